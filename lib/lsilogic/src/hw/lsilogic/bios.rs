// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Requests issued on behalf of the option ROM.
//!
//! The legacy port protocol the ROM speaks is handled by the host, which
//! hands the assembled command over as a [BiosRequest].  Only one such
//! request is outstanding at a time; its outcome is latched in [BiosState]
//! until the host collects it.

use crate::scsi::{opcode, DataDirection, CDB_MAX};

/// A SCSI command assembled by the option ROM.
#[derive(Clone, Debug)]
pub struct BiosRequest {
    pub target: u8,
    pub lun: u8,
    pub cdb: Vec<u8>,
    pub direction: DataDirection,
    /// Data to send (for [DataDirection::ToDevice]), or space for the data
    /// to be received.
    pub buffer: Vec<u8>,
}
impl BiosRequest {
    pub fn is_inquiry(&self) -> bool {
        self.cdb.first() == Some(&opcode::INQUIRY)
    }
    pub(super) fn is_valid(&self) -> bool {
        !self.cdb.is_empty() && self.cdb.len() <= CDB_MAX
    }
}

/// Result of a completed [BiosRequest].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BiosCompletion {
    pub target: u8,
    pub status: u8,
    pub data: Vec<u8>,
}

/// Peripheral qualifier 3 (not connected), device type 0x1f (unknown).
pub(super) const INQUIRY_NOT_PRESENT: [u8; 5] = [0x7f, 0, 0, 0, 0];

#[derive(Debug, Default)]
pub struct BiosState {
    busy: bool,
    done: bool,
    target: u8,
    status: u8,
    buffer: Vec<u8>,
}
impl BiosState {
    pub fn reset(&mut self) {
        *self = Self::default();
    }

    pub fn is_busy(&self) -> bool {
        self.busy
    }

    /// Mark a request as issued to `target`.
    ///
    /// Any result not yet collected is discarded.
    pub(super) fn start(&mut self, target: u8) {
        self.busy = true;
        self.done = false;
        self.target = target;
        self.status = 0;
        self.buffer.clear();
    }

    pub(super) fn finish(&mut self, status: u8, data: Vec<u8>) {
        self.busy = false;
        self.done = true;
        self.status = status;
        self.buffer = data;
    }

    /// Collect the result of the last request, if it has finished.
    pub fn take(&mut self) -> Option<BiosCompletion> {
        if !self.done {
            return None;
        }
        self.done = false;
        Some(BiosCompletion {
            target: self.target,
            status: self.status,
            data: std::mem::take(&mut self.buffer),
        })
    }

    pub(super) fn export(&self) -> migrate::BiosStateV1 {
        migrate::BiosStateV1 {
            busy: self.busy,
            done: self.done,
            target: self.target,
            status: self.status,
            buffer: self.buffer.clone(),
        }
    }

    pub(super) fn import(&mut self, state: migrate::BiosStateV1) {
        self.busy = state.busy;
        self.done = state.done;
        self.target = state.target;
        self.status = state.status;
        self.buffer = state.buffer;
    }
}

pub mod migrate {
    use serde::{Deserialize, Serialize};

    #[derive(Clone, Debug, Default, Deserialize, Serialize)]
    pub struct BiosStateV1 {
        pub busy: bool,
        pub done: bool,
        pub target: u8,
        pub status: u8,
        pub buffer: Vec<u8>,
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn result_collected_once() {
        let mut bios = BiosState::default();
        assert_eq!(bios.take(), None);

        bios.start(3);
        assert!(bios.is_busy());
        assert_eq!(bios.take(), None);

        bios.finish(0, INQUIRY_NOT_PRESENT.to_vec());
        assert!(!bios.is_busy());
        let res = bios.take().unwrap();
        assert_eq!(res.target, 3);
        assert_eq!(res.data, vec![0x7f, 0, 0, 0, 0]);
        assert_eq!(bios.take(), None);
    }

    #[test]
    fn request_validity() {
        let mut req = BiosRequest {
            target: 0,
            lun: 0,
            cdb: vec![opcode::INQUIRY, 0, 0, 0, 36, 0],
            direction: DataDirection::FromDevice,
            buffer: vec![0; 36],
        };
        assert!(req.is_valid());
        assert!(req.is_inquiry());

        req.cdb = vec![0; CDB_MAX + 1];
        assert!(!req.is_valid());
        req.cdb.clear();
        assert!(!req.is_valid());
        assert!(!req.is_inquiry());
    }
}
