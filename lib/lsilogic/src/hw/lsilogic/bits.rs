// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Register bits and in-memory message layouts for the Fusion-MPT interface.
//!
//! See the LSI Logic Fusion-MPT Message Passing Interface (MPI) 1.2/1.5
//! specifications for the authoritative definitions.

#![allow(dead_code)]

use bitstruct::bitstruct;
use zerocopy::byteorder::little_endian::{U16, U32};
use zerocopy::{FromBytes, Immutable, IntoBytes};

// Register offsets, shared by the I/O port and memory-mapped BARs

pub const REG_DOORBELL: usize = 0x00;
pub const REG_WRITE_SEQUENCE: usize = 0x04;
pub const REG_HOST_DIAGNOSTIC: usize = 0x08;
pub const REG_TEST_BASE_ADDRESS: usize = 0x0c;
pub const REG_DIAG_RW_DATA: usize = 0x10;
pub const REG_DIAG_RW_ADDRESS: usize = 0x14;
pub const REG_HOST_INTR_STATUS: usize = 0x30;
pub const REG_HOST_INTR_MASK: usize = 0x34;
pub const REG_REQUEST_QUEUE: usize = 0x40;
pub const REG_REPLY_QUEUE: usize = 0x44;

/// Size of the I/O port BAR
pub const IO_BAR_SIZE: usize = 0x100;
/// Size of the register (and diagnostic) memory BARs
pub const MMIO_BAR_SIZE: usize = 0x20000;

// PCI identity
pub const PCI_VENDOR_ID: u16 = 0x1000;
pub const PCI_SPI_DEVICE_ID: u16 = 0x0030;
pub const PCI_SAS_DEVICE_ID: u16 = 0x0054;
pub const PCI_REVISION_ID: u8 = 0x01;
pub const PCI_SUBSYSTEM_VENDOR_ID: u16 = 0x1000;
pub const PCI_SUBSYSTEM_ID: u16 = 0x8000;
/// Mass storage, SCSI bus controller
pub const PCI_CLASS_CODE: u32 = 0x01_00_00;

/// Number of targets addressable on the single SPI bus.
pub const DEVICES_MAX: usize = 16;
/// Number of ports exposed by the IOC.
pub const PORTS_MAX: usize = 1;
/// Number of buses behind the port.
pub const BUSES_MAX: usize = 1;

/// Bytes in a request frame as advertised through IOC facts.
pub const REQUEST_FRAME_SIZE: u16 = 128;
/// Default reply frame size, in bytes, until IOC init says otherwise.
pub const REPLY_FRAME_SIZE_DEFAULT: u16 = 128;
/// Largest reply produced by the IOC (IOC facts).
pub const REPLY_MAX: usize = 60;
/// Dwords in the doorbell handshake scratch, large enough for any request.
pub const HANDSHAKE_DWORDS: usize = 16;
/// Size of the header common to all requests.
pub const MSG_HEADER_SIZE: usize = 12;
/// Offset of the inline SGL within a SCSI I/O request frame.
pub const SCSI_IO_SGL_OFFSET: usize = 48;
/// Advertised limit for chained SGL segments.
pub const MAX_CHAIN_DEPTH: u8 = 3;
/// SCSI ID of the initiator on the parallel bus.
pub const HOST_SCSI_ID: u8 = 7;

pub const MSG_VERSION: u16 = 0x0102;
pub const PRODUCT_ID: u16 = 0xcafe;

/// Diagnostic unlock key, written one nibble at a time to WriteSequence.
pub const DIAG_KEY: [u8; 5] = [0x04, 0x0b, 0x02, 0x07, 0x0d];

// Doorbell functions
pub const DB_FUNC_IOC_MSG_UNIT_RESET: u8 = 0x40;
pub const DB_FUNC_IO_UNIT_RESET: u8 = 0x41;
pub const DB_FUNC_HANDSHAKE: u8 = 0x42;
pub const DB_FUNC_REPLY_FRAME_REMOVAL: u8 = 0x43;

bitstruct! {
    /// Value presented by a read of the Doorbell register.
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
    pub struct DoorbellStatus(pub u32) {
        /// Handshake reply word, or the fault code when not handshaking
        pub message: u16 = 0..16;

        /// Who initialized the IOC
        pub who_init: u8 = 24..27;

        /// A doorbell handshake is in progress
        pub in_use: bool = 27;

        /// IOC state
        pub state: u8 = 28..32;
    }
}

bitstruct! {
    /// Value written by the host to the Doorbell register.
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
    pub struct DoorbellWrite(pub u32) {
        /// Function-specific data
        pub data: u16 = 0..16;

        /// Handshake length in dwords
        pub size: u8 = 16..24;

        /// Doorbell function
        pub function: u8 = 24..32;
    }
}

bitstruct! {
    /// Host Interrupt Status register.
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
    pub struct IntrStatus(pub u32) {
        /// The IOC wrote a handshake word or awaits one
        pub system_doorbell: bool = 0;

        reserved1: u8 = 1..3;

        /// The reply post FIFO is not empty
        pub reply: bool = 3;

        reserved2: u32 = 4..31;

        /// The doorbell is in use by the IOC
        pub ioc_doorbell: bool = 31;
    }
}

bitstruct! {
    /// Host Interrupt Mask register.
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
    pub struct IntrMask(pub u32) {
        /// Mask doorbell interrupts
        pub doorbell: bool = 0;

        reserved1: u8 = 1..3;

        /// Mask reply interrupts
        pub reply: bool = 3;

        reserved2: u8 = 4..8;

        /// Interrupt routing
        pub routing: u8 = 8..10;
    }
}

/// Host-writable bits of the interrupt mask.
pub const INTR_MASK_WRITABLE: u32 = (1 << 0) | (1 << 3) | (1 << 8) | (1 << 9);
/// Routing bits which do not themselves mask anything.
pub const INTR_MASK_ROUTING: u32 = (1 << 8) | (1 << 9);
/// Status bit excluded from interrupt generation.
pub const INTR_STATUS_IOC_DOORBELL: u32 = 1 << 31;

bitstruct! {
    /// Host Diagnostic register.
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
    pub struct HostDiag(pub u32) {
        pub diag_mem_enable: bool = 0;
        pub disable_arm: bool = 1;
        pub reset_adapter: bool = 2;
        reserved1: bool = 3;
        pub diag_rw_enable: bool = 4;
        pub reset_history: bool = 5;
        pub flash_bad_sig: bool = 6;
        /// Diagnostic read/write enabled (unlocked through WriteSequence)
        pub drwe: bool = 7;
        reserved2: bool = 8;
        pub prevent_ioc_boot: bool = 9;
        pub clear_flash_bad_sig: bool = 10;
    }
}

/// IOC states, as reported in the Doorbell register.
#[derive(
    Clone, Copy, Debug, Eq, PartialEq, strum::FromRepr, strum::IntoStaticStr,
)]
#[repr(u8)]
pub enum IocState {
    Reset = 0x0,
    Ready = 0x1,
    Operational = 0x2,
    Fault = 0x4,
}

/// Entity which initialized the IOC.
#[derive(
    Clone, Copy, Debug, Eq, PartialEq, strum::FromRepr, strum::IntoStaticStr,
)]
#[repr(u8)]
pub enum WhoInit {
    NotInit = 0x0,
    SystemBios = 0x1,
    RomBios = 0x2,
    PciPeer = 0x3,
    HostDriver = 0x4,
    Manufacturing = 0x5,
}

/// Request message functions.
#[derive(
    Clone, Copy, Debug, Eq, PartialEq, strum::FromRepr, strum::IntoStaticStr,
)]
#[repr(u8)]
pub enum MsgFunction {
    ScsiIo = 0x00,
    TaskMgmt = 0x01,
    IocInit = 0x02,
    IocFacts = 0x03,
    Config = 0x04,
    PortFacts = 0x05,
    PortEnable = 0x06,
    EventNotification = 0x07,
    EventAck = 0x08,
    FwDownload = 0x09,
}

/// IOC status values, used both in replies and as latched fault codes.
#[derive(
    Clone, Copy, Debug, Eq, PartialEq, strum::FromRepr, strum::IntoStaticStr,
)]
#[repr(u16)]
pub enum IocStatus {
    Success = 0x00,
    InvalidFunction = 0x01,
    Busy = 0x02,
    InvalidSgl = 0x03,
    InternalError = 0x04,
    Reserved = 0x05,
    InsufficientResources = 0x06,
    InvalidField = 0x07,
    InvalidState = 0x08,
    OpStateNotSupported = 0x09,

    ScsiInvalidBus = 0x41,
    ScsiInvalidTargetId = 0x42,
    ScsiDeviceNotThere = 0x43,
}

/// SCSIState bits of a SCSI I/O error reply.
pub mod scsi_state {
    pub const AUTOSENSE_VALID: u8 = 0x01;
    pub const AUTOSENSE_FAILED: u8 = 0x02;
    pub const NO_SCSI_STATUS: u8 = 0x04;
    pub const TERMINATED: u8 = 0x08;
    pub const RESPONSE_INFO_VALID: u8 = 0x10;
    pub const QUEUE_TAG_REJECTED: u8 = 0x20;
}

/// Event codes reported through event notification replies.
pub const EVENT_CHANGE: u32 = 0x0a;

bitstruct! {
    /// Control word of a SCSI I/O request.
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
    pub struct ScsiIoControl(pub u32) {
        reserved1: u32 = 0..24;

        /// 0: no data, 1: write (to device), 2: read (from device)
        pub direction: u8 = 24..26;

        reserved2: u8 = 26..32;
    }
}

/// Element types of a scatter/gather entry
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SgeType {
    Transaction,
    Simple,
    Reserved,
    Chain,
}

bitstruct! {
    /// First dword of a simple scatter/gather entry.
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
    pub struct SgeFlagsLength(pub u32) {
        pub length: u32 = 0..24;
        pub end_of_list: bool = 24;
        pub addr64: bool = 25;
        /// Set for host to IOC transfers
        pub contains_data: bool = 26;
        pub local_addr: bool = 27;
        pub elem_type: SgeType = 28..30;
        pub end_of_buffer: bool = 30;
        pub last_element: bool = 31;
    }
}

impl bitstruct::FromRaw<u8, SgeType> for SgeFlagsLength {
    fn from_raw(raw: u8) -> SgeType {
        match raw {
            0b00 => SgeType::Transaction,
            0b01 => SgeType::Simple,
            0b10 => SgeType::Reserved,
            0b11 => SgeType::Chain,
            _ => unreachable!(),
        }
    }
}

impl bitstruct::IntoRaw<u8, SgeType> for SgeFlagsLength {
    fn into_raw(target: SgeType) -> u8 {
        match target {
            SgeType::Transaction => 0b00,
            SgeType::Simple => 0b01,
            SgeType::Reserved => 0b10,
            SgeType::Chain => 0b11,
        }
    }
}

/// Simple scatter/gather entry with a 32-bit address.
#[repr(C, packed)]
#[derive(Copy, Clone, Default, Debug, FromBytes, IntoBytes, Immutable)]
pub struct SgeSimple32 {
    pub flags_length: U32,
    pub addr_low: U32,
}

/// Simple scatter/gather entry with a 64-bit address.
#[repr(C, packed)]
#[derive(Copy, Clone, Default, Debug, FromBytes, IntoBytes, Immutable)]
pub struct SgeSimple64 {
    pub flags_length: U32,
    pub addr_low: U32,
    pub addr_high: U32,
}

/// Chain element, linking to the next segment of a scatter/gather list.
///
/// `flags` uses the same bit positions as the high byte of
/// [SgeFlagsLength].
#[repr(C, packed)]
#[derive(Copy, Clone, Default, Debug, FromBytes, IntoBytes, Immutable)]
pub struct SgeChain {
    pub length: U16,
    /// Offset, in dwords, of the next chain element within the next segment
    pub next_chain_offset: u8,
    pub flags: u8,
    pub addr_low: U32,
    pub addr_high: U32,
}
impl SgeChain {
    pub fn flags(&self) -> SgeFlagsLength {
        SgeFlagsLength(u32::from(self.flags) << 24)
    }
}

/// Header common to all request messages.
#[repr(C, packed)]
#[derive(Copy, Clone, Default, Debug, FromBytes, IntoBytes, Immutable)]
pub struct MsgHeader {
    pub reserved: [u8; 2],
    pub chain_offset: u8,
    pub function: u8,
    pub reserved1: [u8; 3],
    pub msg_flags: u8,
    pub msg_context: U32,
}

/// Reply header common to the simpler replies.
#[repr(C, packed)]
#[derive(Copy, Clone, Default, Debug, FromBytes, IntoBytes, Immutable)]
pub struct DefaultReply {
    pub function_dependent1: U16,
    pub msg_length: u8,
    pub function: u8,
    pub function_dependent2: U16,
    pub function_dependent3: u8,
    pub msg_flags: u8,
    pub msg_context: U32,
    pub function_dependent4: U16,
    pub ioc_status: U16,
    pub ioc_log_info: U32,
}

#[repr(C, packed)]
#[derive(Copy, Clone, Default, Debug, FromBytes, IntoBytes, Immutable)]
pub struct ScsiIoRequest {
    pub target_id: u8,
    pub bus: u8,
    /// Offset of the chain element, in dwords from the frame start
    pub chain_offset: u8,
    pub function: u8,
    pub cdb_length: u8,
    pub sense_buffer_length: u8,
    pub reserved: u8,
    pub msg_flags: u8,
    pub msg_context: U32,
    pub lun: [u8; 8],
    pub control: U32,
    pub cdb: [u8; 16],
    pub data_length: U32,
    pub sense_buffer_low_addr: U32,
}

#[repr(C, packed)]
#[derive(Copy, Clone, Default, Debug, FromBytes, IntoBytes, Immutable)]
pub struct ScsiIoErrorReply {
    pub target_id: u8,
    pub bus: u8,
    pub msg_length: u8,
    pub function: u8,
    pub cdb_length: u8,
    pub sense_buffer_length: u8,
    pub reserved: u8,
    pub msg_flags: u8,
    pub msg_context: U32,
    pub scsi_status: u8,
    pub scsi_state: u8,
    pub ioc_status: U16,
    pub ioc_log_info: U32,
    pub transfer_count: U32,
    pub sense_count: U32,
    pub response_info: U32,
}

#[repr(C, packed)]
#[derive(Copy, Clone, Default, Debug, FromBytes, IntoBytes, Immutable)]
pub struct TaskMgmtRequest {
    pub target_id: u8,
    pub bus: u8,
    pub chain_offset: u8,
    pub function: u8,
    pub reserved: u8,
    pub task_type: u8,
    pub reserved1: u8,
    pub msg_flags: u8,
    pub msg_context: U32,
    pub lun: [u8; 8],
    pub reserved2: [U32; 7],
    pub task_msg_context: U32,
}

#[repr(C, packed)]
#[derive(Copy, Clone, Default, Debug, FromBytes, IntoBytes, Immutable)]
pub struct TaskMgmtReply {
    pub target_id: u8,
    pub bus: u8,
    pub msg_length: u8,
    pub function: u8,
    pub response_code: u8,
    pub task_type: u8,
    pub reserved1: u8,
    pub msg_flags: u8,
    pub msg_context: U32,
    pub reserved2: [u8; 2],
    pub ioc_status: U16,
    pub ioc_log_info: U32,
    pub termination_count: U32,
}

#[repr(C, packed)]
#[derive(Copy, Clone, Default, Debug, FromBytes, IntoBytes, Immutable)]
pub struct IocInitRequest {
    pub who_init: u8,
    pub reserved: u8,
    pub chain_offset: u8,
    pub function: u8,
    pub flags: u8,
    pub max_devices: u8,
    pub max_buses: u8,
    pub msg_flags: u8,
    pub msg_context: U32,
    pub reply_frame_size: U16,
    pub reserved1: U16,
    pub host_mfa_high_addr: U32,
    pub sense_buffer_high_addr: U32,
}

#[repr(C, packed)]
#[derive(Copy, Clone, Default, Debug, FromBytes, IntoBytes, Immutable)]
pub struct IocInitReply {
    pub who_init: u8,
    pub reserved: u8,
    pub msg_length: u8,
    pub function: u8,
    pub flags: u8,
    pub max_devices: u8,
    pub max_buses: u8,
    pub msg_flags: u8,
    pub msg_context: U32,
    pub reserved1: U16,
    pub ioc_status: U16,
    pub ioc_log_info: U32,
}

/// IOC facts, port facts and port enable requests share the generic header
/// layout, with the port number in the last reserved byte.
#[repr(C, packed)]
#[derive(Copy, Clone, Default, Debug, FromBytes, IntoBytes, Immutable)]
pub struct PortRequest {
    pub reserved: [u8; 2],
    pub chain_offset: u8,
    pub function: u8,
    pub reserved1: [u8; 2],
    pub port_number: u8,
    pub msg_flags: u8,
    pub msg_context: U32,
}

#[repr(C, packed)]
#[derive(Copy, Clone, Default, Debug, FromBytes, IntoBytes, Immutable)]
pub struct IocFactsReply {
    pub msg_version: U16,
    pub msg_length: u8,
    pub function: u8,
    pub reserved: U16,
    pub ioc_number: u8,
    pub msg_flags: u8,
    pub msg_context: U32,
    pub ioc_exceptions: U16,
    pub ioc_status: U16,
    pub ioc_log_info: U32,
    pub max_chain_depth: u8,
    pub who_init: u8,
    pub block_size: u8,
    pub flags: u8,
    pub reply_queue_depth: U16,
    pub request_frame_size: U16,
    pub reserved1: U16,
    pub product_id: U16,
    pub current_host_mfa_high_addr: U32,
    pub global_credits: U16,
    pub number_of_ports: u8,
    pub event_state: u8,
    pub current_sense_buffer_high_addr: U32,
    pub cur_reply_frame_size: U16,
    pub max_devices: u8,
    pub max_buses: u8,
    pub fw_image_size: U32,
    pub ioc_capabilities: U32,
    pub fw_version: U32,
}

#[repr(C, packed)]
#[derive(Copy, Clone, Default, Debug, FromBytes, IntoBytes, Immutable)]
pub struct PortFactsReply {
    pub reserved: U16,
    pub msg_length: u8,
    pub function: u8,
    pub reserved1: U16,
    pub port_number: u8,
    pub msg_flags: u8,
    pub msg_context: U32,
    pub reserved2: U16,
    pub ioc_status: U16,
    pub ioc_log_info: U32,
    pub reserved3: u8,
    pub port_type: u8,
    pub max_devices: U16,
    pub port_scsi_id: U16,
    pub protocol_flags: U16,
    pub max_posted_cmd_buffers: U16,
    pub max_persistent_ids: U16,
    pub max_lan_buckets: U16,
    pub reserved4: U16,
    pub reserved5: U32,
}

pub const PORT_TYPE_INACTIVE: u8 = 0x00;
pub const PORT_TYPE_SCSI: u8 = 0x01;
pub const PORT_PROTOCOL_INITIATOR: u16 = 1 << 3;
pub const PORT_PROTOCOL_LOGBUSADDR: u16 = 1 << 0;

#[repr(C, packed)]
#[derive(Copy, Clone, Default, Debug, FromBytes, IntoBytes, Immutable)]
pub struct PortEnableReply {
    pub reserved: U16,
    pub msg_length: u8,
    pub function: u8,
    pub reserved1: U16,
    pub port_number: u8,
    pub msg_flags: u8,
    pub msg_context: U32,
    pub reserved2: U16,
    pub ioc_status: U16,
    pub ioc_log_info: U32,
}

#[repr(C, packed)]
#[derive(Copy, Clone, Default, Debug, FromBytes, IntoBytes, Immutable)]
pub struct EventNotificationRequest {
    pub switch: u8,
    pub reserved: u8,
    pub chain_offset: u8,
    pub function: u8,
    pub reserved1: [u8; 3],
    pub msg_flags: u8,
    pub msg_context: U32,
}

#[repr(C, packed)]
#[derive(Copy, Clone, Default, Debug, FromBytes, IntoBytes, Immutable)]
pub struct EventNotificationReply {
    pub event_data_length: U16,
    pub msg_length: u8,
    pub function: u8,
    pub reserved1: [u8; 2],
    pub ack_required: u8,
    pub msg_flags: u8,
    pub msg_context: U32,
    pub reserved2: [u8; 2],
    pub ioc_status: U16,
    pub ioc_log_info: U32,
    pub event: U32,
    pub event_context: U32,
    pub data: U32,
}

/// Set in the MsgFlags of a reply when more replies will follow.
pub const MSG_FLAGS_CONTINUATION: u8 = 0x80;

#[repr(C, packed)]
#[derive(Copy, Clone, Default, Debug, FromBytes, IntoBytes, Immutable)]
pub struct ConfigRequest {
    pub action: u8,
    pub reserved: u8,
    pub chain_offset: u8,
    pub function: u8,
    pub ext_page_length: U16,
    pub ext_page_type: u8,
    pub msg_flags: u8,
    pub msg_context: U32,
    pub reserved2: [u8; 8],
    pub page_version: u8,
    pub page_length: u8,
    pub page_number: u8,
    pub page_type: u8,
    /// Port number or bus/target, depending on the page type
    pub page_address: U32,
    pub sge: SgeSimple64,
}

#[repr(C, packed)]
#[derive(Copy, Clone, Default, Debug, FromBytes, IntoBytes, Immutable)]
pub struct ConfigReply {
    pub action: u8,
    pub reserved: u8,
    pub msg_length: u8,
    pub function: u8,
    pub ext_page_length: U16,
    pub ext_page_type: u8,
    pub msg_flags: u8,
    pub msg_context: U32,
    pub reserved2: U16,
    pub ioc_status: U16,
    pub ioc_log_info: U32,
    pub page_version: u8,
    pub page_length: u8,
    pub page_number: u8,
    pub page_type: u8,
}

/// Configuration page actions
pub mod config_action {
    pub const HEADER: u8 = 0x00;
    pub const READ_CURRENT: u8 = 0x01;
    pub const WRITE_CURRENT: u8 = 0x02;
    pub const DEFAULT: u8 = 0x03;
    pub const WRITE_NVRAM: u8 = 0x04;
    pub const READ_DEFAULT: u8 = 0x05;
    pub const READ_NVRAM: u8 = 0x06;
}

/// Header at the start of every configuration page.
#[repr(C, packed)]
#[derive(Copy, Clone, Default, Debug, PartialEq, Eq, FromBytes, IntoBytes, Immutable)]
pub struct PageHeader {
    pub page_version: u8,
    /// Page length in dwords, header included
    pub page_length: u8,
    pub page_number: u8,
    /// Page type in the low nibble, attributes in the high nibble
    pub page_type: u8,
}

#[cfg(test)]
mod test {
    use super::*;
    use std::mem::size_of;

    #[test]
    fn entry_sizing() {
        assert_eq!(size_of::<SgeSimple32>(), 8);
        assert_eq!(size_of::<SgeSimple64>(), 12);
        assert_eq!(size_of::<SgeChain>(), 12);
        assert_eq!(size_of::<MsgHeader>(), MSG_HEADER_SIZE);
        assert_eq!(size_of::<DefaultReply>(), 20);
        assert_eq!(size_of::<ScsiIoRequest>(), SCSI_IO_SGL_OFFSET);
        assert_eq!(size_of::<ScsiIoErrorReply>(), 32);
        assert_eq!(size_of::<TaskMgmtRequest>(), 52);
        assert_eq!(size_of::<TaskMgmtReply>(), 24);
        assert_eq!(size_of::<IocInitRequest>(), 24);
        assert_eq!(size_of::<IocInitReply>(), 20);
        assert_eq!(size_of::<PortRequest>(), 12);
        assert_eq!(size_of::<IocFactsReply>(), REPLY_MAX);
        assert_eq!(size_of::<PortFactsReply>(), 40);
        assert_eq!(size_of::<PortEnableReply>(), 20);
        assert_eq!(size_of::<EventNotificationRequest>(), 12);
        assert_eq!(size_of::<EventNotificationReply>(), 32);
        assert_eq!(size_of::<ConfigRequest>(), 40);
        assert_eq!(size_of::<ConfigReply>(), 24);
        assert_eq!(size_of::<PageHeader>(), 4);
        assert!(size_of::<TaskMgmtRequest>() <= HANDSHAKE_DWORDS * 4);
    }

    #[test]
    fn sge_flags() {
        let sge = SgeFlagsLength(0xd100_0200);
        assert_eq!(sge.length(), 0x200);
        assert!(sge.end_of_list());
        assert!(sge.end_of_buffer());
        assert!(sge.last_element());
        assert_eq!(sge.elem_type(), SgeType::Simple);
        assert!(!sge.addr64());

        let chain = SgeChain {
            flags: 0x32,
            ..Default::default()
        };
        assert_eq!(chain.flags().elem_type(), SgeType::Chain);
        assert!(chain.flags().addr64());
    }

    #[test]
    fn doorbell_fields() {
        let db = DoorbellStatus(0)
            .with_state(IocState::Operational as u8)
            .with_who_init(WhoInit::HostDriver as u8)
            .with_in_use(true)
            .with_message(0xbeef);
        assert_eq!(db.0, 0x2c00_beef);

        let wr = DoorbellWrite(0x4205_0000);
        assert_eq!(wr.function(), DB_FUNC_HANDSHAKE);
        assert_eq!(wr.size(), 5);
    }
}
