// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Interface between the host bus adapter and the SCSI targets which execute
//! its commands.
//!
//! A [Target] receives [Request]s carrying a CDB and a [ScatterList] over the
//! guest data buffer.  It may complete them from any thread, at any later
//! time, by calling [Request::complete].

use std::ops::Range;
use std::sync::{Arc, Mutex, Weak};

use crate::common::GuestRegion;
use crate::vmm::MemCtx;

use serde::{Deserialize, Serialize};

/// Size of the fixed-format sense data exchanged with targets.
pub const SENSE_LEN: usize = 18;

/// Largest CDB carried by a request.
pub const CDB_MAX: usize = 16;

/// SCSI status codes, as returned in the status byte.
pub mod status {
    pub const GOOD: u8 = 0x00;
    pub const CHECK_CONDITION: u8 = 0x02;
    pub const BUSY: u8 = 0x08;
}

/// Subset of SCSI operation codes understood by [MemTarget].
pub mod opcode {
    pub const TEST_UNIT_READY: u8 = 0x00;
    pub const REQUEST_SENSE: u8 = 0x03;
    pub const INQUIRY: u8 = 0x12;
    pub const READ_CAPACITY_10: u8 = 0x25;
    pub const READ_10: u8 = 0x28;
    pub const WRITE_10: u8 = 0x2a;
}

/// Sense keys, as placed in fixed-format sense data.
pub mod sense_key {
    pub const ILLEGAL_REQUEST: u8 = 0x05;
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub enum DataDirection {
    None,
    ToDevice,
    FromDevice,
}

/// Build fixed-format sense data carrying `key`/`asc`/`ascq`.
pub fn fixed_sense(key: u8, asc: u8, ascq: u8) -> [u8; SENSE_LEN] {
    let mut sense = [0u8; SENSE_LEN];
    sense[0] = 0x70;
    sense[2] = key & 0xf;
    sense[7] = (SENSE_LEN - 8) as u8;
    sense[12] = asc;
    sense[13] = ascq;
    sense
}

/// Identifies an outstanding request within the issuing adapter.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub struct ReqId(pub(crate) u32);

/// A piece of the data buffer backing a [ScatterList].
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Segment {
    /// Guest memory, pinned for the lifetime of the request.
    Guest(GuestRegion),
    /// Range within the adapter-owned staging buffer.
    Staged(Range<usize>),
}
impl Segment {
    pub fn len(&self) -> usize {
        match self {
            Segment::Guest(region) => region.1,
            Segment::Staged(range) => range.len(),
        }
    }
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Data buffer for a SCSI request, assembled from guest memory and staging
/// space.
pub struct ScatterList {
    mem: Arc<MemCtx>,
    segs: Vec<Segment>,
    stage: Vec<u8>,
}
impl std::fmt::Debug for ScatterList {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScatterList")
            .field("segs", &self.segs)
            .field("stage_len", &self.stage.len())
            .finish()
    }
}
impl ScatterList {
    pub(crate) fn new(
        mem: Arc<MemCtx>,
        segs: Vec<Segment>,
        stage: Vec<u8>,
    ) -> Self {
        Self { mem, segs, stage }
    }
    pub(crate) fn empty(mem: Arc<MemCtx>) -> Self {
        Self::new(mem, Vec::new(), Vec::new())
    }
    pub(crate) fn into_parts(self) -> (Vec<Segment>, Vec<u8>) {
        (self.segs, self.stage)
    }

    pub fn segments(&self) -> &[Segment] {
        &self.segs
    }
    /// Total number of data bytes described by the list.
    pub fn len(&self) -> usize {
        self.segs.iter().map(Segment::len).sum()
    }
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Gather list contents into `buf`, returning the number of bytes copied.
    pub fn read_into(&self, buf: &mut [u8]) -> Option<usize> {
        let mut done = 0;
        for seg in self.segs.iter() {
            if done == buf.len() {
                break;
            }
            let len = usize::min(seg.len(), buf.len() - done);
            let dst = &mut buf[done..(done + len)];
            match seg {
                Segment::Guest(region) => {
                    self.mem.read_into(region.0, dst, len)?;
                }
                Segment::Staged(range) => {
                    dst.copy_from_slice(
                        &self.stage[range.start..(range.start + len)],
                    );
                }
            }
            done += len;
        }
        Some(done)
    }

    /// Scatter `buf` across the list, returning the number of bytes copied.
    pub fn write_from(&mut self, buf: &[u8]) -> Option<usize> {
        let mut done = 0;
        for seg in self.segs.iter() {
            if done == buf.len() {
                break;
            }
            let len = usize::min(seg.len(), buf.len() - done);
            let src = &buf[done..(done + len)];
            match seg {
                Segment::Guest(region) => {
                    self.mem.write_from(region.0, src, len)?;
                }
                Segment::Staged(range) => {
                    self.stage[range.start..(range.start + len)]
                        .copy_from_slice(src);
                }
            }
            done += len;
        }
        Some(done)
    }
}

/// Receiver of completed requests, implemented by the issuing adapter.
pub trait Completer: Send + Sync + 'static {
    fn complete(&self, req: Request, status: u8);
}

/// A SCSI command issued to a [Target].
pub struct Request {
    pub lun: u8,
    pub direction: DataDirection,
    pub xfer_len: u32,
    pub data: ScatterList,
    pub sense: [u8; SENSE_LEN],
    cdb: [u8; CDB_MAX],
    cdb_len: usize,
    id: ReqId,
    completer: Weak<dyn Completer>,
}
impl Request {
    pub(crate) fn new(
        id: ReqId,
        lun: u8,
        direction: DataDirection,
        cdb: &[u8],
        xfer_len: u32,
        data: ScatterList,
        completer: Weak<dyn Completer>,
    ) -> Self {
        let cdb_len = usize::min(cdb.len(), CDB_MAX);
        let mut buf = [0u8; CDB_MAX];
        buf[..cdb_len].copy_from_slice(&cdb[..cdb_len]);
        Self {
            lun,
            direction,
            xfer_len,
            data,
            sense: [0u8; SENSE_LEN],
            cdb: buf,
            cdb_len,
            id,
            completer,
        }
    }

    pub fn id(&self) -> ReqId {
        self.id
    }
    pub fn cdb(&self) -> &[u8] {
        &self.cdb[..self.cdb_len]
    }

    /// Hand the request back to the issuing adapter with SCSI `status`.
    ///
    /// If the adapter has since been dropped the request is discarded.
    pub fn complete(self, status: u8) {
        if let Some(completer) = self.completer.upgrade() {
            completer.complete(self, status);
        }
    }
}

/// A SCSI device able to service requests from the adapter.
pub trait Target: Send + Sync + 'static {
    fn submit(&self, req: Request);
}

/// Simple disk-like target holding its contents in memory.
///
/// Requests are serviced synchronously within [Target::submit].
pub struct MemTarget {
    bytes: Mutex<Vec<u8>>,
    block_size: usize,
}
impl MemTarget {
    pub fn new(size: usize, block_size: usize) -> Arc<Self> {
        assert!(block_size.is_power_of_two());
        Arc::new(Self { bytes: Mutex::new(vec![0; size]), block_size })
    }

    /// Copy the target contents covering `range`.
    pub fn contents(&self, range: Range<usize>) -> Vec<u8> {
        self.bytes.lock().unwrap()[range].to_vec()
    }

    fn inquiry(req: &mut Request) -> u8 {
        let mut data = [0u8; 36];
        // Direct access block device, SPC-3
        data[2] = 0x05;
        data[3] = 0x02;
        data[4] = (data.len() - 5) as u8;
        data[8..16].copy_from_slice(b"VBOX    ");
        data[16..32].copy_from_slice(b"HARDDISK        ");
        data[32..36].copy_from_slice(b"1.0 ");
        let len = usize::min(data.len(), req.xfer_len as usize);
        match req.data.write_from(&data[..len]) {
            Some(_) => status::GOOD,
            None => Self::illegal(req),
        }
    }

    fn read_capacity(&self, req: &mut Request) -> u8 {
        let blocks = self.bytes.lock().unwrap().len() / self.block_size;
        let last = u32::try_from(blocks.saturating_sub(1)).unwrap_or(u32::MAX);
        let mut data = [0u8; 8];
        data[..4].copy_from_slice(&last.to_be_bytes());
        data[4..].copy_from_slice(&(self.block_size as u32).to_be_bytes());
        match req.data.write_from(&data) {
            Some(_) => status::GOOD,
            None => Self::illegal(req),
        }
    }

    fn rw10(&self, req: &mut Request, write: bool) -> u8 {
        if req.cdb_len < 10 {
            return Self::illegal(req);
        }
        let cdb = req.cdb;
        let lba = u32::from_be_bytes([cdb[2], cdb[3], cdb[4], cdb[5]]) as usize;
        let count = u16::from_be_bytes([cdb[7], cdb[8]]) as usize;
        let start = lba * self.block_size;
        let len = count * self.block_size;

        let mut bytes = self.bytes.lock().unwrap();
        if start + len > bytes.len() || len > req.data.len() {
            drop(bytes);
            return Self::illegal(req);
        }
        let res = if write {
            req.data.read_into(&mut bytes[start..(start + len)])
        } else {
            req.data.write_from(&bytes[start..(start + len)])
        };
        drop(bytes);
        match res {
            Some(_) => status::GOOD,
            None => Self::illegal(req),
        }
    }

    fn illegal(req: &mut Request) -> u8 {
        // INVALID FIELD IN CDB
        req.sense = fixed_sense(sense_key::ILLEGAL_REQUEST, 0x24, 0);
        status::CHECK_CONDITION
    }
}

impl Target for MemTarget {
    fn submit(&self, mut req: Request) {
        let op = req.cdb().first().copied();
        let res = match op {
            Some(opcode::TEST_UNIT_READY) => status::GOOD,
            Some(opcode::REQUEST_SENSE) => {
                let len = usize::min(SENSE_LEN, req.xfer_len as usize);
                match req.data.write_from(&[0u8; SENSE_LEN][..len]) {
                    Some(_) => status::GOOD,
                    None => Self::illegal(&mut req),
                }
            }
            Some(opcode::INQUIRY) => Self::inquiry(&mut req),
            Some(opcode::READ_CAPACITY_10) => self.read_capacity(&mut req),
            Some(opcode::READ_10) => self.rw10(&mut req, false),
            Some(opcode::WRITE_10) => self.rw10(&mut req, true),
            _ => {
                // INVALID COMMAND OPERATION CODE
                req.sense = fixed_sense(sense_key::ILLEGAL_REQUEST, 0x20, 0);
                status::CHECK_CONDITION
            }
        };
        req.complete(res);
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::common::GuestAddr;
    use crate::vmm::PhysMem;

    struct Collect(Mutex<Vec<(Request, u8)>>);
    impl Completer for Collect {
        fn complete(&self, req: Request, status: u8) {
            self.0.lock().unwrap().push((req, status));
        }
    }

    fn mem() -> Arc<MemCtx> {
        MemCtx::new(PhysMem::new(0x10000))
    }

    #[test]
    fn scatter_gather_mixed() {
        let mem = mem();
        let segs = vec![
            Segment::Guest(GuestRegion(GuestAddr(0x1000), 4)),
            Segment::Staged(0..3),
            Segment::Guest(GuestRegion(GuestAddr(0x2000), 2)),
        ];
        let mut sgl = ScatterList::new(mem.clone(), segs, vec![0; 3]);
        assert_eq!(sgl.len(), 9);

        let data: Vec<u8> = (1..=9).collect();
        assert_eq!(sgl.write_from(&data), Some(9));
        assert_eq!(mem.read::<[u8; 4]>(GuestAddr(0x1000)), Some([1, 2, 3, 4]));
        assert_eq!(mem.read::<[u8; 2]>(GuestAddr(0x2000)), Some([8, 9]));

        let mut out = [0u8; 9];
        assert_eq!(sgl.read_into(&mut out), Some(9));
        assert_eq!(&out[..], &data[..]);

        let (_, stage) = sgl.into_parts();
        assert_eq!(stage, vec![5, 6, 7]);
    }

    #[test]
    fn mem_target_rw() {
        let mem = mem();
        let target = MemTarget::new(4096, 512);
        let sink = Arc::new(Collect(Mutex::new(Vec::new())));
        let completer: Arc<dyn Completer> = sink.clone();

        mem.write_from(GuestAddr(0x4000), &[0xa5; 512], 512).unwrap();
        let write = Request::new(
            ReqId(0),
            0,
            DataDirection::ToDevice,
            &[opcode::WRITE_10, 0, 0, 0, 0, 2, 0, 0, 1, 0],
            512,
            ScatterList::new(
                mem.clone(),
                vec![Segment::Guest(GuestRegion(GuestAddr(0x4000), 512))],
                Vec::new(),
            ),
            Arc::downgrade(&completer),
        );
        target.submit(write);
        assert_eq!(target.contents(1024..1536), vec![0xa5; 512]);

        let bogus = Request::new(
            ReqId(1),
            0,
            DataDirection::None,
            &[0xff, 0, 0, 0, 0, 0],
            0,
            ScatterList::empty(mem.clone()),
            Arc::downgrade(&completer),
        );
        target.submit(bogus);

        let done = sink.0.lock().unwrap();
        assert_eq!(done.len(), 2);
        assert_eq!(done[0].1, status::GOOD);
        assert_eq!(done[1].1, status::CHECK_CONDITION);
        assert_eq!(done[1].0.sense[2], sense_key::ILLEGAL_REQUEST);
        assert_eq!(done[1].0.sense[12], 0x20);
    }
}
