// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use super::bits;
use super::sgl::SglBuffers;
use crate::common::GuestAddr;
use crate::scsi::{ReqId, SENSE_LEN};

use thiserror::Error;

/// Handle of a slot in the [TaskPool].
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub struct TaskId(u32);
impl TaskId {
    pub fn req_id(self) -> ReqId {
        ReqId(self.0)
    }
}
impl From<ReqId> for TaskId {
    fn from(id: ReqId) -> Self {
        TaskId(id.0)
    }
}

#[derive(Error, Debug, PartialEq, Eq)]
pub enum TaskError {
    /// The slot does not exist.
    #[error("no task slot {0:?}")]
    Invalid(TaskId),

    /// The slot exists but is not handed out.
    #[error("task slot {0:?} is not in use")]
    NotInUse(TaskId),
}

/// Who issued the request a task tracks.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum TaskOrigin {
    /// Request frame posted by the guest driver
    Guest,
    /// Request issued on behalf of the option ROM
    Bios,
}

/// Per-request scratch state.
#[derive(Debug)]
pub struct TaskState {
    id: TaskId,
    pub origin: TaskOrigin,
    /// Guest address of the request frame
    pub frame_addr: GuestAddr,
    /// The request, as read from the frame
    pub request: bits::ScsiIoRequest,
    pub target: u8,
    pub sense: [u8; SENSE_LEN],
    /// Scatter/gather arrays, retained across uses of the slot
    pub sgl: SglBuffers,
}
impl TaskState {
    fn new(id: TaskId) -> Self {
        Self {
            id,
            origin: TaskOrigin::Guest,
            frame_addr: GuestAddr(0),
            request: Default::default(),
            target: 0,
            sense: [0; SENSE_LEN],
            sgl: SglBuffers::default(),
        }
    }
    pub fn id(&self) -> TaskId {
        self.id
    }
}

struct Slot {
    task: TaskState,
    in_use: bool,
}

/// Arena of [TaskState]s.
///
/// Slots are created on demand and never freed, so the scatter/gather
/// arrays they retain can be reused by later requests.
#[derive(Default)]
pub struct TaskPool {
    slots: Vec<Slot>,
    free: Vec<TaskId>,
}
impl TaskPool {
    /// Hand out a free slot, prepared for a request of `origin`.
    pub fn acquire(&mut self, origin: TaskOrigin) -> &mut TaskState {
        let id = match self.free.pop() {
            Some(id) => id,
            None => {
                let id = TaskId(self.slots.len() as u32);
                self.slots.push(Slot { task: TaskState::new(id), in_use: false });
                id
            }
        };
        let slot = &mut self.slots[id.0 as usize];
        debug_assert!(!slot.in_use);
        slot.in_use = true;

        let task = &mut slot.task;
        task.origin = origin;
        task.frame_addr = GuestAddr(0);
        task.request = Default::default();
        task.target = 0;
        task.sense = [0; SENSE_LEN];
        task
    }

    /// Return a slot to the pool.
    ///
    /// Releasing a slot which is not in use is refused, leaving the free
    /// list untouched.
    pub fn release(&mut self, id: TaskId) -> Result<(), TaskError> {
        let slot =
            self.slots.get_mut(id.0 as usize).ok_or(TaskError::Invalid(id))?;
        if !slot.in_use {
            return Err(TaskError::NotInUse(id));
        }
        slot.in_use = false;
        self.free.push(id);
        Ok(())
    }

    /// Access an in-use slot.
    pub fn get_mut(&mut self, id: TaskId) -> Result<&mut TaskState, TaskError> {
        match self.slots.get_mut(id.0 as usize) {
            Some(slot) if slot.in_use => Ok(&mut slot.task),
            Some(_) => Err(TaskError::NotInUse(id)),
            None => Err(TaskError::Invalid(id)),
        }
    }

    /// Number of slots currently handed out.
    pub fn in_use(&self) -> usize {
        self.slots.len() - self.free.len()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn slots_reused() {
        let mut pool = TaskPool::default();
        let a = pool.acquire(TaskOrigin::Guest).id();
        let b = pool.acquire(TaskOrigin::Bios).id();
        assert_ne!(a, b);
        assert_eq!(pool.in_use(), 2);
        assert_eq!(pool.get_mut(b).unwrap().origin, TaskOrigin::Bios);

        pool.get_mut(a).unwrap().target = 5;
        pool.release(a).unwrap();
        assert_eq!(pool.in_use(), 1);

        let c = pool.acquire(TaskOrigin::Guest);
        assert_eq!(c.id(), a);
        assert_eq!(c.target, 0);
    }

    #[test]
    fn double_release() {
        let mut pool = TaskPool::default();
        let a = pool.acquire(TaskOrigin::Guest).id();
        pool.release(a).unwrap();
        assert_eq!(pool.release(a), Err(TaskError::NotInUse(a)));
        assert_eq!(pool.get_mut(a).unwrap_err(), TaskError::NotInUse(a));
        assert_eq!(pool.in_use(), 0);

        // The slot went onto the free list only once
        let b = pool.acquire(TaskOrigin::Guest).id();
        let c = pool.acquire(TaskOrigin::Guest).id();
        assert_eq!(b, a);
        assert_ne!(c, a);

        let bogus = TaskId(100);
        assert_eq!(pool.release(bogus), Err(TaskError::Invalid(bogus)));
    }
}
