// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Emulated LSI Logic Fusion-MPT SCSI host bus adapter.
//!
//! The guest talks to the IOC through a handful of registers, exposed both
//! in I/O port space and in the first MMIO BAR.  Requests arrive either
//! through the doorbell handshake (used for IOC bring-up) or through the
//! request FIFO, whose entries point at request frames in guest memory.
//! SCSI I/O requests are handed to the [Target] attached at the addressed
//! id, and their completions are posted back on the reply FIFO.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Weak};

use crate::common::*;
use crate::intr_pins::IntrPin;
use crate::migrate::*;
use crate::scsi::{self, Completer, DataDirection, Segment, Target, CDB_MAX};
use crate::util::regmap::{Flags, RegMap};
use crate::vmm::MemCtx;

use anyhow::Context;
use futures::future::BoxFuture;
use lazy_static::lazy_static;
use serde::{Deserialize, Serialize};
use slog::{debug, error, info, o, warn, Logger};
use thiserror::Error;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use zerocopy::byteorder::little_endian::{U16, U32};

mod bios;
mod bits;
mod cmds;
mod config;
mod queue;
mod reply;
mod sgl;
mod task;


use bits::*;
use cmds::MessageRequest;
use config::PageStore;
use queue::RingQueue;
use sgl::SglCursor;
use task::{TaskOrigin, TaskPool};

pub use bios::{BiosCompletion, BiosRequest};
pub use config::PciIdent;

/// Number of 16-bit words in the handshake reply scratch.
const REPLY_WORDS: usize = REPLY_MAX / 2;

/// Default depth of the request and reply rings.
pub const DEFAULT_QUEUE_DEPTH: u32 = 256;

#[derive(Error, Debug)]
pub enum LsiError {
    /// The supplied [Config] is unusable
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// Failed to add an entry to one of the rings
    #[error("ring update failed: {0}")]
    QueueUpdate(#[from] queue::QueueUpdateError),

    /// A request frame could not be decoded
    #[error("failed to parse request: {0}")]
    CommandParse(#[from] cmds::ParseErr),

    /// A handshake was started with an unusable length
    #[error("invalid handshake length: {0} dwords")]
    HandshakeSize(usize),

    /// A scatter/gather list could not be translated
    #[error("scatter/gather failure: {0}")]
    Sgl(#[from] sgl::SglError),

    /// The task pool was handed an unknown or idle slot
    #[error("task pool misuse: {0}")]
    Task(#[from] task::TaskError),

    /// Guest memory could not be accessed
    #[error("guest memory at {0:#x} inaccessible")]
    MemoryInaccessible(u64),

    /// A target id beyond what the adapter supports
    #[error("target {0} out of range")]
    InvalidTarget(u8),

    /// A target is already attached at this id
    #[error("target {0} already attached")]
    TargetAttached(u8),

    /// No target is attached at this id
    #[error("no target attached at {0}")]
    NoTarget(u8),

    /// The target still has requests in flight
    #[error("target {0} has {1} requests outstanding")]
    TargetBusy(u8, u32),

    /// The BIOS request is malformed
    #[error("malformed BIOS request")]
    BiosInvalid,

    /// A BIOS request is already in flight
    #[error("BIOS request already in progress")]
    BiosBusy,

    /// Only INQUIRY is answered for an id with no target attached
    #[error("BIOS request to absent target {0} is not an INQUIRY")]
    BiosTargetAbsent(u8),
}
impl LsiError {
    /// Fault code latched by the IOC when this error occurs while servicing
    /// the guest.
    fn fault_code(&self) -> IocStatus {
        match self {
            LsiError::QueueUpdate(_) => IocStatus::InsufficientResources,
            LsiError::CommandParse(_) | LsiError::HandshakeSize(_) => {
                IocStatus::InvalidField
            }
            LsiError::Sgl(e) if e.is_malformed() => IocStatus::InvalidSgl,
            _ => IocStatus::InternalError,
        }
    }
}

/// Model of adapter to emulate.
#[derive(
    Copy,
    Clone,
    Debug,
    Default,
    Eq,
    PartialEq,
    Deserialize,
    Serialize,
    strum::EnumString,
    strum::IntoStaticStr,
)]
pub enum ControllerType {
    /// Parallel SCSI
    #[default]
    #[serde(rename = "LSI53C1030")]
    #[strum(serialize = "LSI53C1030")]
    Spi,
    /// Serial attached SCSI
    #[serde(rename = "SAS1068")]
    #[strum(serialize = "SAS1068")]
    Sas,
}
impl ControllerType {
    pub fn device_id(self) -> u16 {
        match self {
            ControllerType::Spi => PCI_SPI_DEVICE_ID,
            ControllerType::Sas => PCI_SAS_DEVICE_ID,
        }
    }
}

/// Device configuration, as found in an instance spec.
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    pub controller_type: ControllerType,
    pub reply_queue_depth: u32,
    pub request_queue_depth: u32,
    /// PCI device/function, as reported in IO unit page 2
    pub pci_devfn: u8,
}
impl Default for Config {
    fn default() -> Self {
        Self {
            controller_type: ControllerType::default(),
            reply_queue_depth: DEFAULT_QUEUE_DEPTH,
            request_queue_depth: DEFAULT_QUEUE_DEPTH,
            pci_devfn: 0,
        }
    }
}
impl Config {
    pub fn validate(&self) -> Result<(), LsiError> {
        let valid = queue::MIN_QUEUE_DEPTH..=queue::MAX_QUEUE_DEPTH;
        for (name, depth) in [
            ("reply_queue_depth", self.reply_queue_depth),
            ("request_queue_depth", self.request_queue_depth),
        ] {
            if !valid.contains(&depth) {
                return Err(LsiError::InvalidConfig(format!(
                    "{name} {depth} outside {}..={}",
                    valid.start(),
                    valid.end()
                )));
            }
        }
        Ok(())
    }

    pub fn pci_ident(&self) -> PciIdent {
        PciIdent {
            device_id: self.controller_type.device_id(),
            revision_id: PCI_REVISION_ID,
            subsys_vendor_id: PCI_SUBSYSTEM_VENDOR_ID,
            subsys_id: PCI_SUBSYSTEM_ID,
            devfn: self.pci_devfn,
        }
    }
}

struct CtrlState {
    state: IocState,
    who_init: WhoInit,

    intr_mask: IntrMask,
    intr_status: IntrStatus,

    /// Doorbell handshake underway
    doorbell_in_progress: bool,
    /// Handshake request scratch
    msg: [u32; HANDSHAKE_DWORDS],
    msg_expected: usize,
    msg_cursor: usize,
    /// Handshake reply scratch, read out 16 bits at a time
    reply: [u16; REPLY_WORDS],
    reply_size: usize,
    reply_cursor: usize,

    /// Latched fault, shown in the doorbell outside of a handshake
    fault_code: u16,

    reply_frame_size: u16,
    max_devices: u8,
    max_buses: u8,
    host_mfa_high: u32,
    sense_high: u32,
    event_notify: bool,

    diag_enabled: bool,
    diag_progress: usize,

    pages: PageStore,
    bios: bios::BiosState,
}

impl CtrlState {
    fn new(ident: PciIdent) -> Self {
        Self {
            state: IocState::Reset,
            who_init: WhoInit::NotInit,
            intr_mask: IntrMask(0),
            intr_status: IntrStatus(0),
            doorbell_in_progress: false,
            msg: [0; HANDSHAKE_DWORDS],
            msg_expected: 0,
            msg_cursor: 0,
            reply: [0; REPLY_WORDS],
            reply_size: 0,
            reply_cursor: 0,
            fault_code: 0,
            reply_frame_size: REPLY_FRAME_SIZE_DEFAULT,
            max_devices: DEVICES_MAX as u8,
            max_buses: BUSES_MAX as u8,
            host_mfa_high: 0,
            sense_high: 0,
            event_notify: false,
            diag_enabled: false,
            diag_progress: 0,
            pages: PageStore::new(ident),
            bios: bios::BiosState::default(),
        }
    }

    /// Is the interrupt line to be asserted?
    fn intr_asserted(&self) -> bool {
        let mask = self.intr_mask.0 & !INTR_MASK_ROUTING;
        (self.intr_status.0 & !INTR_STATUS_IOC_DOORBELL) & !mask != 0
    }

    /// Value of a Doorbell read, advancing through the handshake reply.
    fn doorbell_read(&mut self) -> u32 {
        let message = if self.doorbell_in_progress {
            let word = self.reply.get(self.reply_cursor).copied().unwrap_or(0);
            if self.reply_cursor < self.reply_size {
                self.reply_cursor += 1;
            }
            word
        } else {
            self.fault_code
        };
        DoorbellStatus(0)
            .with_state(self.state as u8)
            .with_in_use(self.doorbell_in_progress)
            .with_who_init(self.who_init as u8 & 0x7)
            .with_message(message)
            .0
    }

    /// Advance the diagnostic unlock sequence with a WriteSequence value.
    fn write_sequence(&mut self, val: u32) {
        if self.diag_enabled {
            self.diag_enabled = false;
            self.diag_progress = 0;
            return;
        }
        if (val & 0xf) as u8 == DIAG_KEY[self.diag_progress] {
            self.diag_progress += 1;
            if self.diag_progress == DIAG_KEY.len() {
                self.diag_enabled = true;
                self.diag_progress = 0;
            }
        } else {
            self.diag_progress = 0;
        }
    }

    /// Handshake request scratch as raw bytes.
    fn msg_bytes(&self) -> [u8; HANDSHAKE_DWORDS * 4] {
        let mut buf = [0u8; HANDSHAKE_DWORDS * 4];
        for (chunk, dw) in buf.chunks_exact_mut(4).zip(self.msg.iter()) {
            chunk.copy_from_slice(&dw.to_le_bytes());
        }
        buf
    }

    fn export(&self) -> migrate::CtrlStateV1 {
        migrate::CtrlStateV1 {
            state: self.state as u8,
            who_init: self.who_init as u8,
            intr_mask: self.intr_mask.0,
            intr_status: self.intr_status.0,
            doorbell_in_progress: self.doorbell_in_progress,
            msg: self.msg.to_vec(),
            msg_expected: self.msg_expected as u32,
            msg_cursor: self.msg_cursor as u32,
            reply: self.reply.to_vec(),
            reply_size: self.reply_size as u32,
            reply_cursor: self.reply_cursor as u32,
            fault_code: self.fault_code,
            reply_frame_size: self.reply_frame_size,
            max_devices: self.max_devices,
            max_buses: self.max_buses,
            host_mfa_high: self.host_mfa_high,
            sense_high: self.sense_high,
            event_notify: self.event_notify,
            diag_enabled: self.diag_enabled,
            diag_progress: self.diag_progress as u32,
        }
    }

    fn import(
        &mut self,
        state: migrate::CtrlStateV1,
    ) -> Result<(), MigrateStateError> {
        let fail = |msg: String| Err(MigrateStateError::ImportFailed(msg));

        let Some(ioc_state) = IocState::from_repr(state.state) else {
            return fail(format!("invalid IOC state {:#x}", state.state));
        };
        let Some(who_init) = WhoInit::from_repr(state.who_init) else {
            return fail(format!("invalid who-init {:#x}", state.who_init));
        };
        let msg: [u32; HANDSHAKE_DWORDS] = match state.msg.try_into() {
            Ok(msg) => msg,
            Err(_) => return fail("handshake scratch size mismatch".into()),
        };
        let reply: [u16; REPLY_WORDS] = match state.reply.try_into() {
            Ok(reply) => reply,
            Err(_) => return fail("reply scratch size mismatch".into()),
        };
        let (msg_expected, msg_cursor) =
            (state.msg_expected as usize, state.msg_cursor as usize);
        if msg_expected > HANDSHAKE_DWORDS || msg_cursor > msg_expected {
            return fail(format!(
                "handshake cursor {msg_cursor} of {msg_expected} out of range"
            ));
        }
        let (reply_size, reply_cursor) =
            (state.reply_size as usize, state.reply_cursor as usize);
        if reply_size > REPLY_WORDS || reply_cursor > reply_size {
            return fail(format!(
                "reply cursor {reply_cursor} of {reply_size} out of range"
            ));
        }
        if state.diag_progress as usize >= DIAG_KEY.len() {
            return fail(format!(
                "diagnostic sequence position {} out of range",
                state.diag_progress
            ));
        }

        self.state = ioc_state;
        self.who_init = who_init;
        self.intr_mask = IntrMask(state.intr_mask & INTR_MASK_WRITABLE);
        self.intr_status = IntrStatus(state.intr_status);
        self.doorbell_in_progress = state.doorbell_in_progress;
        self.msg = msg;
        self.msg_expected = msg_expected;
        self.msg_cursor = msg_cursor;
        self.reply = reply;
        self.reply_size = reply_size;
        self.reply_cursor = reply_cursor;
        self.fault_code = state.fault_code;
        self.reply_frame_size = state.reply_frame_size;
        self.max_devices = state.max_devices;
        self.max_buses = state.max_buses;
        self.host_mfa_high = state.host_mfa_high;
        self.sense_high = state.sense_high;
        self.event_notify = state.event_notify;
        self.diag_enabled = state.diag_enabled;
        self.diag_progress = state.diag_progress as usize;
        Ok(())
    }
}

/// Attachment point for a target at one SCSI id.
#[derive(Default)]
struct TargetSlot {
    backend: Mutex<Option<Arc<dyn Target>>>,
    /// Requests submitted to the backend and not yet completed
    outstanding: AtomicU32,
}

/// LSI Logic Fusion-MPT SCSI HBA
///
/// Lock ordering: `state` may be held while taking any of the rings, but not
/// the other way around.  `tasks` is never held together with `state`.
pub struct PciLsiLogic {
    /// IOC state
    state: Mutex<CtrlState>,

    request: Mutex<RingQueue>,
    reply_free: Mutex<RingQueue>,
    reply_post: Mutex<RingQueue>,

    tasks: Mutex<TaskPool>,

    targets: [TargetSlot; DEVICES_MAX],

    /// Serializes drains of the request ring
    drain_lock: Mutex<()>,
    /// A drain of the request ring has been requested but not yet begun
    notification_pending: AtomicBool,
    paused: AtomicBool,
    notify: Arc<Notify>,
    worker: Mutex<Option<JoinHandle<()>>>,

    /// Backend requests in flight, across all targets
    outstanding: Arc<AtomicUsize>,
    idle: Arc<Notify>,

    ident: PciIdent,
    intr: Arc<dyn IntrPin>,
    mem: Arc<MemCtx>,
    log: Logger,
    self_weak: Weak<Self>,
}

impl PciLsiLogic {
    /// Create a new adapter with the given configuration.
    pub fn create(
        config: Config,
        mem: Arc<MemCtx>,
        intr: Arc<dyn IntrPin>,
        log: Logger,
    ) -> Result<Arc<Self>, LsiError> {
        config.validate()?;

        let ident = config.pci_ident();
        let mut state = CtrlState::new(ident);
        state.who_init = WhoInit::SystemBios;

        let log = log.new(o!("dev" => "lsilogic"));
        let dev = Arc::new_cyclic(|weak| PciLsiLogic {
            state: Mutex::new(state),
            request: Mutex::new(RingQueue::new(config.request_queue_depth)),
            reply_free: Mutex::new(RingQueue::new(config.reply_queue_depth)),
            reply_post: Mutex::new(RingQueue::new(config.reply_queue_depth)),
            tasks: Mutex::new(TaskPool::default()),
            targets: std::array::from_fn(|_| TargetSlot::default()),
            drain_lock: Mutex::new(()),
            notification_pending: AtomicBool::new(false),
            paused: AtomicBool::new(false),
            notify: Arc::new(Notify::new()),
            worker: Mutex::new(None),
            outstanding: Arc::new(AtomicUsize::new(0)),
            idle: Arc::new(Notify::new()),
            ident,
            intr,
            mem,
            log,
            self_weak: weak.clone(),
        });

        let mut state = dev.state.lock().unwrap();
        dev.hard_reset(&mut state);
        drop(state);

        Ok(dev)
    }

    /// PCI identity of the adapter, for the hosting PCI emulation.
    pub fn pci_ident(&self) -> PciIdent {
        self.ident
    }

    /// Attach `backend` as the target at SCSI id `target`.
    pub fn attach(
        &self,
        target: u8,
        backend: Arc<dyn Target>,
    ) -> Result<(), LsiError> {
        let slot = self.target_slot(target)?;
        let mut cur = slot.backend.lock().unwrap();
        if cur.is_some() {
            return Err(LsiError::TargetAttached(target));
        }
        *cur = Some(backend);
        info!(self.log, "target attached"; "target" => target);
        Ok(())
    }

    /// Detach the target at SCSI id `target`, which must be idle.
    pub fn detach(&self, target: u8) -> Result<Arc<dyn Target>, LsiError> {
        let slot = self.target_slot(target)?;
        let mut cur = slot.backend.lock().unwrap();
        let busy = slot.outstanding.load(Ordering::Acquire);
        if busy != 0 {
            return Err(LsiError::TargetBusy(target, busy));
        }
        let backend = cur.take().ok_or(LsiError::NoTarget(target))?;
        info!(self.log, "target detached"; "target" => target);
        Ok(backend)
    }

    /// Number of backend requests in flight.
    pub fn outstanding(&self) -> usize {
        self.outstanding.load(Ordering::Acquire)
    }

    fn target_slot(&self, target: u8) -> Result<&TargetSlot, LsiError> {
        self.targets
            .get(target as usize)
            .ok_or(LsiError::InvalidTarget(target))
    }

    /// Access to the I/O port register BAR.
    pub fn pio_rw(&self, rwo: RWOp) {
        self.regs_rw(&IO_REGS, rwo)
    }

    /// Access to the memory-mapped register BAR.
    pub fn mmio_rw(&self, rwo: RWOp) {
        self.regs_rw(&MMIO_REGS, rwo)
    }

    /// Access to the diagnostic memory BAR, which is not backed by anything.
    pub fn diag_rw(&self, rwo: RWOp) {
        if let RWOp::Read(ro) = rwo {
            ro.fill(0);
        }
    }

    fn regs_rw(&self, map: &RegMap<CtrlrReg>, mut rwo: RWOp) {
        if rwo.is_empty() || rwo.offset() + rwo.len() > map.len() {
            if let RWOp::Read(ro) = rwo {
                ro.fill(0);
            }
            return;
        }
        map.process(&mut rwo, |id, rwo| {
            let res = match rwo {
                RWOp::Read(ro) => self.reg_read(id, ro),
                RWOp::Write(wo) => self.reg_write(id, wo),
            };
            if let Err(err) = res {
                error!(self.log, "lsilogic reg r/w failure";
                    "register" => ?id,
                    "error" => %err
                );
                self.latch_fault(err.fault_code());
            }
        });
    }

    /// Service a register read from the guest.
    fn reg_read(&self, id: &CtrlrReg, ro: &mut ReadOp) -> Result<(), LsiError> {
        match id {
            CtrlrReg::Doorbell => {
                let mut state = self.state.lock().unwrap();
                ro.write_u32(state.doorbell_read());
            }
            CtrlrReg::HostDiagnostic => {
                let state = self.state.lock().unwrap();
                ro.write_u32(HostDiag(0).with_drwe(state.diag_enabled).0);
            }
            CtrlrReg::HostIntrStatus => {
                let state = self.state.lock().unwrap();
                ro.write_u32(state.intr_status.0);
            }
            CtrlrReg::HostIntrMask => {
                let state = self.state.lock().unwrap();
                ro.write_u32(state.intr_mask.0);
            }
            CtrlrReg::ReplyQueue => {
                let mut state = self.state.lock().unwrap();
                let entry = self.reply_post.lock().unwrap().pop();
                match entry {
                    Some(entry) => ro.write_u32(entry),
                    None => {
                        state.intr_status = state.intr_status.with_reply(false);
                        self.update_irq(&state);
                        ro.write_u32(u32::MAX);
                    }
                }
            }
            CtrlrReg::WriteSequence
            | CtrlrReg::TestBaseAddress
            | CtrlrReg::DiagRwData
            | CtrlrReg::DiagRwAddress
            | CtrlrReg::RequestQueue
            | CtrlrReg::Reserved => {
                ro.fill(0);
            }
        }
        Ok(())
    }

    /// Service a register write from the guest.
    ///
    /// Narrow writes are zero-extended to the full register.
    fn reg_write(
        &self,
        id: &CtrlrReg,
        wo: &mut WriteOp,
    ) -> Result<(), LsiError> {
        let val = wo.read_u32_extend();
        match id {
            CtrlrReg::Doorbell => self.doorbell_write(val)?,
            CtrlrReg::WriteSequence => {
                let mut state = self.state.lock().unwrap();
                let was_enabled = state.diag_enabled;
                state.write_sequence(val);
                if state.diag_enabled != was_enabled {
                    debug!(self.log, "diagnostic access";
                        "enabled" => state.diag_enabled);
                }
            }
            CtrlrReg::HostDiagnostic => {
                if HostDiag(val).reset_adapter() {
                    let mut state = self.state.lock().unwrap();
                    info!(self.log, "adapter reset");
                    self.hard_reset(&mut state);
                }
            }
            CtrlrReg::HostIntrStatus => {
                let mut state = self.state.lock().unwrap();
                state.intr_status = state.intr_status.with_system_doorbell(false);
                if state.doorbell_in_progress
                    && state.msg_cursor == state.msg_expected
                {
                    // The host acknowledged the last reply word
                    if state.reply_cursor == state.reply_size {
                        state.doorbell_in_progress = false;
                    }
                    state.intr_status =
                        state.intr_status.with_system_doorbell(true);
                }
                self.update_irq(&state);
            }
            CtrlrReg::HostIntrMask => {
                let mut state = self.state.lock().unwrap();
                state.intr_mask = IntrMask(val & INTR_MASK_WRITABLE);
                self.update_irq(&state);
            }
            CtrlrReg::RequestQueue => {
                self.request.lock().unwrap().push(val)?;
                self.kick_drain();
            }
            CtrlrReg::ReplyQueue => {
                self.reply_free.lock().unwrap().push(val)?;
            }
            CtrlrReg::TestBaseAddress
            | CtrlrReg::DiagRwData
            | CtrlrReg::DiagRwAddress
            | CtrlrReg::Reserved => {}
        }
        Ok(())
    }

    fn doorbell_write(&self, val: u32) -> Result<(), LsiError> {
        let mut state = self.state.lock().unwrap();

        if state.doorbell_in_progress {
            if state.msg_cursor == state.msg_expected {
                warn!(self.log, "doorbell write while reply pending";
                    "value" => val);
                return Ok(());
            }
            let idx = state.msg_cursor;
            state.msg[idx] = val;
            state.msg_cursor += 1;
            if state.msg_cursor == state.msg_expected {
                self.process_handshake(&mut state)?;
            }
            return Ok(());
        }

        let db = DoorbellWrite(val);
        match db.function() {
            DB_FUNC_IOC_MSG_UNIT_RESET => {
                info!(self.log, "message unit reset");
                state.state = IocState::Reset;
                state.intr_mask = IntrMask(0);
                state.intr_status = IntrStatus(0);
                self.update_irq(&state);
                self.reset_rings();
                state.state = IocState::Ready;
            }
            DB_FUNC_HANDSHAKE => {
                let size = db.size() as usize;
                if size == 0 || size > HANDSHAKE_DWORDS {
                    return Err(LsiError::HandshakeSize(size));
                }
                state.msg = [0; HANDSHAKE_DWORDS];
                state.msg_expected = size;
                state.msg_cursor = 0;
                state.reply_size = 0;
                state.reply_cursor = 0;
                state.doorbell_in_progress = true;
                state.intr_status = state.intr_status.with_system_doorbell(true);
                self.update_irq(&state);
            }
            func @ (DB_FUNC_IO_UNIT_RESET | DB_FUNC_REPLY_FRAME_REMOVAL) => {
                warn!(self.log, "unsupported doorbell function";
                    "function" => func);
            }
            func => {
                warn!(self.log, "unknown doorbell function"; "function" => func);
            }
        }
        Ok(())
    }

    /// Process a request delivered through the doorbell handshake.
    fn process_handshake(&self, state: &mut CtrlState) -> Result<(), LsiError> {
        let buf = state.msg_bytes();
        let msg = MessageRequest::parse(&buf)?;

        let received = state.msg_expected * 4;
        if let Some(need) = MessageRequest::request_size(msg.function()) {
            if received < need {
                debug!(self.log, "short handshake request";
                    "function" => msg.function(),
                    "received" => received,
                    "expected" => need
                );
            }
        }

        if let MessageRequest::ScsiIo(_) = msg {
            warn!(self.log, "SCSI I/O request through doorbell");
            self.set_fault(state, IocStatus::InvalidFunction);
            return Ok(());
        }
        self.process_message(state, msg);
        Ok(())
    }

    /// Handle any request other than SCSI I/O.
    fn process_message(&self, state: &mut CtrlState, msg: MessageRequest) {
        match msg {
            MessageRequest::TaskMgmt(req) => {
                let reply = TaskMgmtReply {
                    target_id: req.target_id,
                    bus: req.bus,
                    msg_length: 6,
                    function: req.function,
                    task_type: req.task_type,
                    msg_context: req.msg_context,
                    termination_count: U32::ZERO,
                    ..Default::default()
                };
                self.post_reply(state, &reply, true);
            }
            MessageRequest::IocInit(req) => {
                let Some(who_init) = WhoInit::from_repr(req.who_init) else {
                    warn!(self.log, "IOC init with invalid who-init";
                        "who_init" => req.who_init);
                    self.set_fault(state, IocStatus::InvalidField);
                    return;
                };
                state.who_init = who_init;
                state.reply_frame_size = req.reply_frame_size.get();
                state.max_buses = req.max_buses;
                state.max_devices = req.max_devices;
                state.host_mfa_high = req.host_mfa_high_addr.get();
                state.sense_high = req.sense_buffer_high_addr.get();

                if state.state == IocState::Ready {
                    info!(self.log, "IOC operational";
                        "who_init" => <&'static str>::from(who_init));
                    state.state = IocState::Operational;
                    // Pick up anything queued while initialization was
                    // underway
                    if !self.request.lock().unwrap().is_empty() {
                        self.kick_drain();
                    }
                }

                let reply = IocInitReply {
                    who_init: req.who_init,
                    msg_length: 5,
                    function: req.function,
                    max_devices: state.max_devices,
                    max_buses: state.max_buses,
                    msg_context: req.msg_context,
                    ..Default::default()
                };
                self.post_reply(state, &reply, false);
            }
            MessageRequest::IocFacts(req) => {
                let reply_depth = self.reply_post.lock().unwrap().depth();
                let request_depth = self.request.lock().unwrap().depth();
                let reply = IocFactsReply {
                    msg_version: U16::new(MSG_VERSION),
                    msg_length: 15,
                    function: req.function,
                    ioc_number: 0,
                    msg_context: req.msg_context,
                    max_chain_depth: MAX_CHAIN_DEPTH,
                    who_init: state.who_init as u8,
                    block_size: 12,
                    flags: 0,
                    reply_queue_depth: U16::new(reply_depth as u16),
                    request_frame_size: U16::new(REQUEST_FRAME_SIZE),
                    product_id: U16::new(PRODUCT_ID),
                    current_host_mfa_high_addr: U32::new(state.host_mfa_high),
                    global_credits: U16::new(request_depth as u16),
                    number_of_ports: PORTS_MAX as u8,
                    event_state: 0,
                    current_sense_buffer_high_addr: U32::new(state.sense_high),
                    cur_reply_frame_size: U16::new(state.reply_frame_size),
                    max_devices: state.max_devices,
                    max_buses: state.max_buses,
                    fw_image_size: U32::ZERO,
                    fw_version: U32::ZERO,
                    ..Default::default()
                };
                self.post_reply(state, &reply, false);
            }
            MessageRequest::Config(req) => {
                let reply =
                    state.pages.process_request(&req, &self.mem, &self.log);
                self.post_reply(state, &reply, false);
            }
            MessageRequest::PortFacts(req) => {
                let mut reply = PortFactsReply {
                    msg_length: 10,
                    function: req.function,
                    port_number: req.port_number,
                    msg_context: req.msg_context,
                    port_type: PORT_TYPE_INACTIVE,
                    ..Default::default()
                };
                if (req.port_number as usize) < PORTS_MAX {
                    reply.port_type = PORT_TYPE_SCSI;
                    reply.max_devices = U16::new(DEVICES_MAX as u16);
                    reply.port_scsi_id = U16::new(HOST_SCSI_ID.into());
                    reply.protocol_flags = U16::new(
                        PORT_PROTOCOL_INITIATOR | PORT_PROTOCOL_LOGBUSADDR,
                    );
                }
                self.post_reply(state, &reply, false);
            }
            MessageRequest::PortEnable(req) => {
                let reply = PortEnableReply {
                    msg_length: 5,
                    function: req.function,
                    port_number: req.port_number,
                    msg_context: req.msg_context,
                    ..Default::default()
                };
                self.post_reply(state, &reply, false);
            }
            MessageRequest::EventNotification(req) => {
                state.event_notify = req.switch != 0;
                let reply = EventNotificationReply {
                    event_data_length: U16::new(1),
                    msg_length: 8,
                    function: req.function,
                    ack_required: 0,
                    msg_flags: MSG_FLAGS_CONTINUATION,
                    msg_context: req.msg_context,
                    event: U32::new(EVENT_CHANGE),
                    event_context: U32::ZERO,
                    data: U32::new(state.event_notify as u32),
                    ..Default::default()
                };
                self.post_reply(state, &reply, false);
            }
            MessageRequest::ScsiIo(_)
            | MessageRequest::EventAck(_)
            | MessageRequest::FwDownload(_)
            | MessageRequest::Unknown(_) => {
                warn!(self.log, "unsupported message function";
                    "function" => msg.function(),
                    "context" => msg.msg_context()
                );
                self.set_fault(state, IocStatus::InvalidFunction);
            }
        }
    }

    /// Ask for the request ring to be drained, unless a request for that is
    /// already pending.
    fn kick_drain(&self) {
        if !self.notification_pending.swap(true, Ordering::AcqRel) {
            self.notify.notify_one();
        }
    }

    /// Process entries posted to the request ring.
    ///
    /// Normally driven by the worker spawned in [Lifecycle::start], but may
    /// be called directly by hosts running without one.
    pub fn process_request_queue(&self) {
        let _drain = self.drain_lock.lock().unwrap();
        if self.paused.load(Ordering::Acquire) {
            return;
        }

        let stop = self.request.lock().unwrap().write_idx();
        self.notification_pending.store(false, Ordering::Release);

        while !self.paused.load(Ordering::Acquire) {
            let state = self.state.lock().unwrap();
            if state.state != IocState::Operational {
                break;
            }
            let Some(entry) = self.request.lock().unwrap().pop_until(stop)
            else {
                break;
            };
            let frame = GuestAddr::from_parts(state.host_mfa_high, entry & !0x7);
            drop(state);

            if let Err(err) = self.process_request_frame(frame) {
                error!(self.log, "request processing failed";
                    "frame" => frame.0,
                    "error" => %err
                );
                self.latch_fault(err.fault_code());
            }
        }

        // Entries written after the snapshot whose notification was
        // swallowed by the pending flag still need a drain.
        let state = self.state.lock().unwrap();
        let rearm = state.state == IocState::Operational
            && !self.paused.load(Ordering::Acquire)
            && !self.request.lock().unwrap().is_empty();
        drop(state);
        if rearm {
            self.kick_drain();
        }
    }

    fn process_request_frame(&self, frame: GuestAddr) -> Result<(), LsiError> {
        let mut buf = [0u8; REQUEST_FRAME_SIZE as usize];
        self.mem
            .read_into(frame, &mut buf, REQUEST_FRAME_SIZE as usize)
            .ok_or(LsiError::MemoryInaccessible(frame.0))?;

        match MessageRequest::parse(&buf)? {
            MessageRequest::ScsiIo(req) => self.start_scsi_io(frame, req),
            msg => {
                let mut state = self.state.lock().unwrap();
                self.process_message(&mut state, msg);
                Ok(())
            }
        }
    }

    /// Issue a SCSI I/O request to its target.
    fn start_scsi_io(
        &self,
        frame: GuestAddr,
        req: ScsiIoRequest,
    ) -> Result<(), LsiError> {
        let target = req.target_id;
        let backend = if req.bus != 0 {
            Err(IocStatus::ScsiInvalidBus)
        } else if target as usize >= DEVICES_MAX {
            Err(IocStatus::ScsiInvalidTargetId)
        } else {
            self.targets[target as usize]
                .backend
                .lock()
                .unwrap()
                .clone()
                .ok_or(IocStatus::ScsiDeviceNotThere)
        };

        let mut tasks = self.tasks.lock().unwrap();
        let task = tasks.acquire(TaskOrigin::Guest);
        task.frame_addr = frame;
        task.request = req;
        task.target = target;
        let id = task.id();

        let backend = match backend {
            Ok(backend) => backend,
            Err(status) => {
                drop(tasks);
                return self.finish_target_error(id, &req, status);
            }
        };

        let cursor = SglCursor::for_scsi_io(frame, req.chain_offset);
        let data = match task.sgl.translate(&self.mem, cursor) {
            Ok(data) => data,
            Err(err) => {
                tasks.release(id)?;
                drop(tasks);
                if err.is_malformed() {
                    return Err(err.into());
                }
                warn!(self.log, "failed to map request data";
                    "target" => target,
                    "error" => %err
                );
                let mut state = self.state.lock().unwrap();
                self.post_scsi_error(
                    &mut state,
                    &req,
                    scsi::status::GOOD,
                    scsi_state::TERMINATED,
                    IocStatus::InternalError,
                    false,
                );
                return Ok(());
            }
        };
        drop(tasks);

        let direction = match ScsiIoControl(req.control.get()).direction() {
            1 => DataDirection::ToDevice,
            2 => DataDirection::FromDevice,
            _ => DataDirection::None,
        };
        let cdb_len = usize::min(req.cdb_length as usize, CDB_MAX);
        let request = scsi::Request::new(
            id.req_id(),
            req.lun[1],
            direction,
            &req.cdb[..cdb_len],
            req.data_length.get(),
            data,
            self.self_weak.clone() as Weak<dyn Completer>,
        );

        self.targets[target as usize].outstanding.fetch_add(1, Ordering::AcqRel);
        self.outstanding.fetch_add(1, Ordering::AcqRel);
        backend.submit(request);
        Ok(())
    }

    /// Issue a request on behalf of the option ROM.
    ///
    /// The outcome is collected with [PciLsiLogic::bios_result].
    pub fn submit_bios_request(&self, req: BiosRequest) -> Result<(), LsiError> {
        if !req.is_valid() {
            return Err(LsiError::BiosInvalid);
        }
        let slot = self.target_slot(req.target)?;
        let backend = slot.backend.lock().unwrap().clone();

        let mut state = self.state.lock().unwrap();
        if state.bios.is_busy() {
            return Err(LsiError::BiosBusy);
        }
        let Some(backend) = backend else {
            if !req.is_inquiry() {
                return Err(LsiError::BiosTargetAbsent(req.target));
            }
            let mut data = req.buffer;
            let len = usize::min(data.len(), bios::INQUIRY_NOT_PRESENT.len());
            data[..len].copy_from_slice(&bios::INQUIRY_NOT_PRESENT[..len]);
            state.bios.start(req.target);
            state.bios.finish(scsi::status::GOOD, data);
            return Ok(());
        };
        state.bios.start(req.target);
        drop(state);

        let mut tasks = self.tasks.lock().unwrap();
        let task = tasks.acquire(TaskOrigin::Bios);
        task.target = req.target;
        let id = task.id();
        drop(tasks);

        // The ROM's buffer serves as the staging area for the whole transfer
        let len = req.buffer.len();
        let data = match len {
            0 => scsi::ScatterList::empty(self.mem.clone()),
            _ => scsi::ScatterList::new(
                self.mem.clone(),
                vec![Segment::Staged(0..len)],
                req.buffer,
            ),
        };
        let request = scsi::Request::new(
            id.req_id(),
            req.lun,
            req.direction,
            &req.cdb,
            len as u32,
            data,
            self.self_weak.clone() as Weak<dyn Completer>,
        );

        slot.outstanding.fetch_add(1, Ordering::AcqRel);
        self.outstanding.fetch_add(1, Ordering::AcqRel);
        backend.submit(request);
        Ok(())
    }

    /// Collect the result of the last BIOS request, once it has finished.
    pub fn bios_result(&self) -> Option<BiosCompletion> {
        self.state.lock().unwrap().bios.take()
    }

    /// Reset the IOC to its power-on state.
    fn hard_reset(&self, state: &mut CtrlState) {
        state.state = IocState::Reset;

        state.intr_mask = state.intr_mask.with_doorbell(true).with_reply(true);
        state.intr_status = IntrStatus(0);
        self.update_irq(state);

        self.reset_rings();
        state.diag_progress = 0;

        state.doorbell_in_progress = false;
        state.msg_expected = 0;
        state.msg_cursor = 0;
        state.reply_size = 0;
        state.reply_cursor = 0;
        state.fault_code = 0;

        state.max_devices = DEVICES_MAX as u8;
        state.max_buses = BUSES_MAX as u8;
        state.reply_frame_size = REPLY_FRAME_SIZE_DEFAULT;

        state.pages.reset();

        state.state = IocState::Ready;
    }

    fn reset_rings(&self) {
        self.request.lock().unwrap().reset();
        self.reply_free.lock().unwrap().reset();
        self.reply_post.lock().unwrap().reset();
    }

    /// Move the IOC into the fault state, unless it is already faulted.
    fn set_fault(&self, state: &mut CtrlState, code: IocStatus) {
        if state.state == IocState::Fault {
            return;
        }
        warn!(self.log, "IOC fault"; "code" => <&'static str>::from(code));
        state.state = IocState::Fault;
        state.fault_code = code as u16;
    }

    fn latch_fault(&self, code: IocStatus) {
        let mut state = self.state.lock().unwrap();
        self.set_fault(&mut state, code);
    }

    fn update_irq(&self, state: &CtrlState) {
        self.intr.set_state(state.intr_asserted());
    }

    fn start_worker(&self) -> anyhow::Result<()> {
        let rt = tokio::runtime::Handle::try_current()
            .context("lsilogic request worker needs a tokio runtime")?;
        let mut worker = self.worker.lock().unwrap();
        if worker.is_none() {
            let dev = self.self_weak.clone();
            let notify = self.notify.clone();
            *worker = Some(rt.spawn(Self::request_worker(dev, notify)));
        }
        Ok(())
    }

    async fn request_worker(dev: Weak<Self>, notify: Arc<Notify>) {
        loop {
            notify.notified().await;
            let Some(dev) = dev.upgrade() else {
                return;
            };
            dev.process_request_queue();
        }
    }

    fn stop_worker(&self) {
        if let Some(worker) = self.worker.lock().unwrap().take() {
            worker.abort();
        }
    }
}

impl Drop for PciLsiLogic {
    fn drop(&mut self) {
        self.stop_worker();
    }
}

impl Lifecycle for PciLsiLogic {
    fn type_name(&self) -> &'static str {
        "lsilogic-scsi"
    }

    fn start(&self) -> anyhow::Result<()> {
        self.start_worker()
    }

    fn reset(&self) {
        let mut state = self.state.lock().unwrap();
        self.hard_reset(&mut state);
        state.bios.reset();
        self.notification_pending.store(false, Ordering::Release);
    }

    fn pause(&self) {
        self.paused.store(true, Ordering::Release);
        // Wait out any drain which started before the flag was raised
        drop(self.drain_lock.lock().unwrap());
    }

    fn resume(&self) {
        self.paused.store(false, Ordering::Release);
        self.notification_pending.store(true, Ordering::Release);
        self.notify.notify_one();
    }

    fn paused(&self) -> BoxFuture<'static, ()> {
        let outstanding = self.outstanding.clone();
        let idle = self.idle.clone();
        Box::pin(async move {
            loop {
                let notified = idle.notified();
                if outstanding.load(Ordering::Acquire) == 0 {
                    return;
                }
                notified.await;
            }
        })
    }

    fn halt(&self) {
        self.stop_worker();
    }

    fn migrate(&self) -> Migrator<'_> {
        Migrator::Single(self)
    }
}

impl MigrateSingle for PciLsiLogic {
    fn export(
        &self,
        _ctx: &MigrateCtx,
    ) -> Result<PayloadOutput, MigrateStateError> {
        if self.outstanding() != 0 {
            return Err(MigrateStateError::NotReadyForExport);
        }
        let targets = self
            .targets
            .iter()
            .map(|slot| slot.backend.lock().unwrap().is_some())
            .collect();

        let state = self.state.lock().unwrap();
        Ok(migrate::LsiLogicV1 {
            ctrl: state.export(),
            request: self.request.lock().unwrap().export(),
            reply_free: self.reply_free.lock().unwrap().export(),
            reply_post: self.reply_post.lock().unwrap().export(),
            pages: state.pages.export(),
            targets,
            bios: state.bios.export(),
        }
        .into())
    }

    fn import(
        &self,
        mut offer: PayloadOffer,
        _ctx: &MigrateCtx,
    ) -> Result<(), MigrateStateError> {
        let input: migrate::LsiLogicV1 = offer.parse()?;

        let present: Vec<bool> = self
            .targets
            .iter()
            .map(|slot| slot.backend.lock().unwrap().is_some())
            .collect();
        if input.targets != present {
            return Err(MigrateStateError::ImportFailed(format!(
                "target presence mismatch: {:?} vs {:?}",
                input.targets, present
            )));
        }

        let mut state = self.state.lock().unwrap();
        state.import(input.ctrl)?;
        state
            .pages
            .import(input.pages)
            .map_err(MigrateStateError::ImportFailed)?;
        state.bios.import(input.bios);
        self.request.lock().unwrap().import(input.request)?;
        self.reply_free.lock().unwrap().import(input.reply_free)?;
        self.reply_post.lock().unwrap().import(input.reply_post)?;
        self.update_irq(&state);
        Ok(())
    }
}

pub mod migrate {
    use crate::migrate::*;

    use serde::{Deserialize, Serialize};

    use super::bios::migrate::BiosStateV1;
    use super::config::migrate::ConfigPageV1;
    use super::queue::migrate::RingQueueV1;

    #[derive(Clone, Debug, Deserialize, Serialize)]
    pub struct CtrlStateV1 {
        pub state: u8,
        pub who_init: u8,
        pub intr_mask: u32,
        pub intr_status: u32,
        pub doorbell_in_progress: bool,
        pub msg: Vec<u32>,
        pub msg_expected: u32,
        pub msg_cursor: u32,
        pub reply: Vec<u16>,
        pub reply_size: u32,
        pub reply_cursor: u32,
        pub fault_code: u16,
        pub reply_frame_size: u16,
        pub max_devices: u8,
        pub max_buses: u8,
        pub host_mfa_high: u32,
        pub sense_high: u32,
        pub event_notify: bool,
        pub diag_enabled: bool,
        pub diag_progress: u32,
    }

    #[derive(Clone, Debug, Deserialize, Serialize)]
    pub struct LsiLogicV1 {
        pub ctrl: CtrlStateV1,
        pub request: RingQueueV1,
        pub reply_free: RingQueueV1,
        pub reply_post: RingQueueV1,
        pub pages: Vec<ConfigPageV1>,
        /// Presence of a target at each SCSI id
        pub targets: Vec<bool>,
        pub bios: BiosStateV1,
    }
    impl Schema<'_> for LsiLogicV1 {
        fn id() -> SchemaId {
            ("lsilogic-scsi", 1)
        }
    }
}

/// Registers of the IOC, shared by the I/O port and MMIO BARs.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
enum CtrlrReg {
    Reserved,

    /// Doorbell, for handshakes and IOC state
    Doorbell,
    /// WriteSequence, fed the diagnostic unlock key
    WriteSequence,
    /// Host Diagnostic
    HostDiagnostic,
    TestBaseAddress,
    DiagRwData,
    DiagRwAddress,
    /// Host Interrupt Status
    HostIntrStatus,
    /// Host Interrupt Mask
    HostIntrMask,
    /// Request post FIFO
    RequestQueue,
    /// Reply post FIFO (read) and reply free FIFO (write)
    ReplyQueue,
}

fn ctrlr_regs(size: usize) -> RegMap<CtrlrReg> {
    let mut layout = [
        (CtrlrReg::Doorbell, 4),
        (CtrlrReg::WriteSequence, 4),
        (CtrlrReg::HostDiagnostic, 4),
        (CtrlrReg::TestBaseAddress, 4),
        (CtrlrReg::DiagRwData, 4),
        (CtrlrReg::DiagRwAddress, 4),
        (CtrlrReg::Reserved, 0x18),
        (CtrlrReg::HostIntrStatus, 4),
        (CtrlrReg::HostIntrMask, 4),
        (CtrlrReg::Reserved, 8),
        (CtrlrReg::RequestQueue, 4),
        (CtrlrReg::ReplyQueue, 4),
        // Left as 0 and adjusted below
        (CtrlrReg::Reserved, 0),
    ];

    // Pad out the rest of the BAR with the last `Reserved` slot
    let regs_sz = layout.iter().map(|(_, sz)| sz).sum::<usize>();
    assert!(regs_sz < size);
    layout.last_mut().unwrap().1 = size - regs_sz;

    RegMap::create_packed(
        size,
        &layout,
        Some(CtrlrReg::Reserved),
        Flags::NO_WRITE_EXTEND,
    )
}

lazy_static! {
    static ref IO_REGS: RegMap<CtrlrReg> = ctrlr_regs(IO_BAR_SIZE);
    static ref MMIO_REGS: RegMap<CtrlrReg> = ctrlr_regs(MMIO_BAR_SIZE);
}
