// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Posting of replies, and completion of requests handed back by targets.

use std::sync::atomic::Ordering;

use super::bits::*;
use super::task::{TaskId, TaskOrigin};
use super::{CtrlState, LsiError, PciLsiLogic, REPLY_WORDS};
use crate::common::GuestAddr;
use crate::scsi::{self, Completer, ScatterList, SENSE_LEN};

use slog::{error, warn};
use zerocopy::byteorder::little_endian::{U16, U32};
use zerocopy::{Immutable, IntoBytes};

/// Build an error reply for the SCSI I/O request `req`.
pub(super) fn scsi_io_error_reply(
    req: &ScsiIoRequest,
    scsi_status: u8,
    scsi_state: u8,
    ioc_status: IocStatus,
    sense_count: u32,
) -> ScsiIoErrorReply {
    ScsiIoErrorReply {
        target_id: req.target_id,
        bus: req.bus,
        msg_length: 8,
        function: req.function,
        cdb_length: req.cdb_length,
        sense_buffer_length: req.sense_buffer_length,
        reserved: 0,
        msg_flags: req.msg_flags,
        msg_context: req.msg_context,
        scsi_status,
        scsi_state,
        ioc_status: U16::new(ioc_status as u16),
        ioc_log_info: U32::ZERO,
        transfer_count: U32::ZERO,
        sense_count: U32::new(sense_count),
        response_info: U32::ZERO,
    }
}

impl PciLsiLogic {
    /// Post a context reply, carrying only the MsgContext of the request.
    pub(super) fn post_context_reply(&self, state: &mut CtrlState, ctx: u32) {
        if self.reply_post.lock().unwrap().push(ctx).is_err() {
            self.set_fault(state, IocStatus::InsufficientResources);
            return;
        }
        state.intr_status = state.intr_status.with_reply(true);
        self.update_irq(state);
    }

    pub(super) fn post_reply<R: IntoBytes + Immutable>(
        &self,
        state: &mut CtrlState,
        reply: &R,
        forced: bool,
    ) {
        self.post_address_reply(state, reply.as_bytes(), forced)
    }

    /// Post a full reply frame.
    ///
    /// While a doorbell handshake is underway the reply is handed back
    /// through the doorbell, unless `forced` is set, in which case it goes
    /// through a host-supplied reply frame like any other.
    pub(super) fn post_address_reply(
        &self,
        state: &mut CtrlState,
        bytes: &[u8],
        forced: bool,
    ) {
        let len = usize::min(bytes.len(), REPLY_MAX);

        if state.doorbell_in_progress && !forced {
            state.reply = [0; REPLY_WORDS];
            for (word, chunk) in state.reply.iter_mut().zip(bytes[..len].chunks(2))
            {
                let mut buf = [0u8; 2];
                buf[..chunk.len()].copy_from_slice(chunk);
                *word = u16::from_le_bytes(buf);
            }
            // MsgLength is in dwords
            let msg_length = bytes.get(2).copied().unwrap_or(0) as usize;
            state.reply_size = usize::min(msg_length * 2, REPLY_WORDS);
            state.reply_cursor = 0;
            state.intr_status = state.intr_status.with_system_doorbell(true);
            self.update_irq(state);
            return;
        }

        let Some(low) = self.reply_free.lock().unwrap().pop() else {
            warn!(self.log, "no free reply frames");
            self.set_fault(state, IocStatus::InsufficientResources);
            return;
        };

        let mut frame = [0u8; REPLY_MAX];
        frame[..len].copy_from_slice(&bytes[..len]);
        let addr = GuestAddr::from_parts(state.host_mfa_high, low);
        let copy_len = usize::min(state.reply_frame_size as usize, REPLY_MAX);
        if self.mem.write_from(addr, &frame, copy_len).is_none() {
            error!(self.log, "failed to write reply frame"; "addr" => addr.0);
        }

        if self.reply_post.lock().unwrap().push((1 << 31) | (low >> 1)).is_err()
        {
            self.set_fault(state, IocStatus::InsufficientResources);
            return;
        }

        if forced {
            state.doorbell_in_progress = false;
            state.intr_status = state.intr_status.with_system_doorbell(true);
        }
        state.intr_status = state.intr_status.with_reply(true);
        self.update_irq(state);
    }

    pub(super) fn post_scsi_error(
        &self,
        state: &mut CtrlState,
        req: &ScsiIoRequest,
        scsi_status: u8,
        scsi_state: u8,
        ioc_status: IocStatus,
        forced: bool,
    ) {
        let reply =
            scsi_io_error_reply(req, scsi_status, scsi_state, ioc_status, 0);
        self.post_reply(state, &reply, forced);
    }

    /// Fail a SCSI I/O request which never reached a target.
    pub(super) fn finish_target_error(
        &self,
        id: TaskId,
        req: &ScsiIoRequest,
        ioc_status: IocStatus,
    ) -> Result<(), LsiError> {
        let mut state = self.state.lock().unwrap();
        self.post_scsi_error(
            &mut state,
            req,
            scsi::status::GOOD,
            scsi_state::TERMINATED,
            ioc_status,
            false,
        );
        drop(state);

        self.tasks.lock().unwrap().release(id)?;
        Ok(())
    }

    fn complete_guest(
        &self,
        id: TaskId,
        data: ScatterList,
        sense: [u8; SENSE_LEN],
        status: u8,
    ) {
        let sense_high = self.state.lock().unwrap().sense_high;

        let mut tasks = self.tasks.lock().unwrap();
        let task = match tasks.get_mut(id) {
            Ok(task) => task,
            Err(err) => {
                error!(self.log, "completion for idle task"; "error" => %err);
                return;
            }
        };
        let req = task.request;

        task.sense = sense;
        let len = usize::min(req.sense_buffer_length as usize, SENSE_LEN);
        if len != 0 {
            let addr =
                GuestAddr::from_parts(sense_high, req.sense_buffer_low_addr.get());
            if self.mem.write_from(addr, &task.sense, len).is_none() {
                warn!(self.log, "failed to write sense data"; "addr" => addr.0);
            }
        }
        let teardown = task.sgl.teardown(&self.mem, data);
        drop(tasks);

        let mut state = self.state.lock().unwrap();
        match teardown {
            Err(err) => {
                error!(self.log, "failed to return request data";
                    "target" => req.target_id,
                    "error" => %err
                );
                self.post_scsi_error(
                    &mut state,
                    &req,
                    status,
                    scsi_state::TERMINATED,
                    IocStatus::InternalError,
                    true,
                );
            }
            Ok(()) if status == scsi::status::GOOD => {
                self.post_context_reply(&mut state, req.msg_context.get());
            }
            Ok(()) => {
                let reply = scsi_io_error_reply(
                    &req,
                    status,
                    scsi_state::AUTOSENSE_VALID,
                    IocStatus::Success,
                    SENSE_LEN as u32,
                );
                self.post_reply(&mut state, &reply, true);
            }
        }
        drop(state);

        self.release_task(id);
    }

    fn complete_bios(&self, id: TaskId, data: ScatterList, status: u8) {
        let (_, buffer) = data.into_parts();
        self.state.lock().unwrap().bios.finish(status, buffer);
        self.release_task(id);
    }

    fn release_task(&self, id: TaskId) {
        if let Err(err) = self.tasks.lock().unwrap().release(id) {
            error!(self.log, "task release failed"; "error" => %err);
        }
    }

    fn request_done(&self) {
        if self.outstanding.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.idle.notify_waiters();
        }
    }
}

impl Completer for PciLsiLogic {
    fn complete(&self, req: scsi::Request, status: u8) {
        let id = TaskId::from(req.id());
        let sense = req.sense;
        let data = req.data;

        let found = self
            .tasks
            .lock()
            .unwrap()
            .get_mut(id)
            .map(|task| (task.origin, task.target));
        match found {
            Ok((origin, target)) => {
                if let Some(slot) = self.targets.get(target as usize) {
                    slot.outstanding.fetch_sub(1, Ordering::AcqRel);
                }
                match origin {
                    TaskOrigin::Guest => {
                        self.complete_guest(id, data, sense, status)
                    }
                    TaskOrigin::Bios => self.complete_bios(id, data, status),
                }
            }
            Err(err) => {
                error!(self.log, "completion for unknown request";
                    "error" => %err);
            }
        }
        self.request_done();
    }
}
