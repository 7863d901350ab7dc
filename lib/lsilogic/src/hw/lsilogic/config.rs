// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Configuration pages exposed through the CONFIG request.

use std::collections::BTreeMap;

use super::bits::{self, config_action, IocStatus, PageHeader};
use crate::common::GuestAddr;
use crate::vmm::MemCtx;

use serde::{Deserialize, Serialize};
use slog::{warn, Logger};
use zerocopy::byteorder::little_endian::{U16, U32, U64};
use zerocopy::{FromBytes, Immutable, IntoBytes};

/// Page types, the low nibble of the PageType field.
pub mod page_type {
    pub const IO_UNIT: u8 = 0x00;
    pub const IOC: u8 = 0x01;
    pub const SCSI_SPI_PORT: u8 = 0x03;
    pub const SCSI_SPI_DEVICE: u8 = 0x04;
    pub const MANUFACTURING: u8 = 0x09;
}

/// Page attributes, the high nibble of the PageType field.
pub mod page_attr {
    pub const READONLY: u8 = 0x00;
    pub const CHANGEABLE: u8 = 0x10;
    pub const PERSISTENT: u8 = 0x20;
    pub const PERSISTENT_READONLY: u8 = 0x30;
}

/// Identity of the adapter, as reflected in the manufacturing, IO unit and
/// IOC pages.
#[derive(Copy, Clone, Debug)]
pub struct PciIdent {
    pub device_id: u16,
    pub revision_id: u8,
    pub subsys_vendor_id: u16,
    pub subsys_id: u16,
    pub devfn: u8,
}

/// Addressing within a page type.
#[derive(
    Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize,
)]
pub enum PageAddr {
    None,
    Port(u8),
    Device { bus: u8, target: u8 },
}

#[derive(
    Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize,
)]
pub struct PageKey {
    /// Page type, without attribute bits
    pub page_type: u8,
    pub number: u8,
    pub addr: PageAddr,
}
impl PageKey {
    pub const fn new(page_type: u8, number: u8) -> Self {
        Self { page_type, number, addr: PageAddr::None }
    }

    /// Key addressed by a request's PageType, PageNumber and PageAddress.
    ///
    /// PageAddress holds the port number for SPI port pages, and the
    /// target id (byte 0) and bus (byte 1) for SPI device pages.
    pub fn from_request(raw_type: u8, number: u8, page_address: u32) -> Self {
        let kind = raw_type & 0x0f;
        let addr = match kind {
            page_type::SCSI_SPI_PORT => PageAddr::Port(page_address as u8),
            page_type::SCSI_SPI_DEVICE => PageAddr::Device {
                bus: (page_address >> 8) as u8,
                target: page_address as u8,
            },
            _ => PageAddr::None,
        };
        Self { page_type: kind, number, addr }
    }
}

#[repr(C, packed)]
#[derive(Copy, Clone, Debug, FromBytes, IntoBytes, Immutable)]
struct Manufacturing0 {
    header: PageHeader,
    chip_name: [u8; 16],
    chip_revision: [u8; 8],
    board_name: [u8; 16],
    board_assembly: [u8; 16],
    board_tracer_number: [u8; 16],
}

/// Layout shared by manufacturing pages 2 and 3.
#[repr(C, packed)]
#[derive(Copy, Clone, Debug, FromBytes, IntoBytes, Immutable)]
struct ManufacturingChip {
    header: PageHeader,
    pci_device_id: U16,
    pci_revision_id: u8,
    reserved: u8,
    settings: [U32; 8],
}

#[repr(C, packed)]
#[derive(Copy, Clone, Debug, FromBytes, IntoBytes, Immutable)]
struct IoUnit0 {
    header: PageHeader,
    unique_identifier: U64,
}

#[repr(C, packed)]
#[derive(Copy, Clone, Debug, FromBytes, IntoBytes, Immutable)]
struct IoUnit1 {
    header: PageHeader,
    flags: U32,
}
const IOUNIT1_SINGLE_FUNCTION: u32 = 1 << 0;
const IOUNIT1_DISABLE_IR: u32 = 1 << 6;

#[repr(C, packed)]
#[derive(Copy, Clone, Debug, Default, FromBytes, IntoBytes, Immutable)]
struct AdapterOrder {
    pci_bus_number: u8,
    pci_devfn: u8,
    flags: U16,
}
const ADAPTER_ENABLED: u16 = 1 << 0;
const ADAPTER_EMBEDDED: u16 = 1 << 1;

#[repr(C, packed)]
#[derive(Copy, Clone, Debug, FromBytes, IntoBytes, Immutable)]
struct IoUnit2 {
    header: PageHeader,
    flags: U32,
    bios_version: U32,
    adapter_order: [AdapterOrder; 4],
    reserved: U32,
}

#[repr(C, packed)]
#[derive(Copy, Clone, Debug, FromBytes, IntoBytes, Immutable)]
struct Ioc0 {
    header: PageHeader,
    total_nv_store: U32,
    free_nv_store: U32,
    vendor_id: U16,
    device_id: U16,
    revision_id: u8,
    reserved: [u8; 3],
    class_code: U32,
    subsystem_vendor_id: U16,
    subsystem_id: U16,
}

#[repr(C, packed)]
#[derive(Copy, Clone, Debug, FromBytes, IntoBytes, Immutable)]
struct SpiPort0 {
    header: PageHeader,
    capabilities: U32,
    physical_interface: U32,
}
const SPI_CAP_IU: u32 = 1 << 0;
const SPI_CAP_DT: u32 = 1 << 1;
const SPI_CAP_QAS: u32 = 1 << 2;
const SPI_CAP_MAX_SYNC_OFFSET_SHIFT: u32 = 16;
const SPI_CAP_WIDE: u32 = 1 << 29;
const SPI_CAP_AIP: u32 = 1 << 31;
const SPI_SIGNALING_SE: u32 = 0x3;

#[repr(C, packed)]
#[derive(Copy, Clone, Debug, FromBytes, IntoBytes, Immutable)]
struct SpiPort1 {
    header: PageHeader,
    configuration: U32,
    on_bus_timer_value: U32,
}

#[repr(C, packed)]
#[derive(Copy, Clone, Debug, Default, FromBytes, IntoBytes, Immutable)]
struct SpiDeviceSettings {
    timeout: u8,
    sync_factor: u8,
    flags: U16,
}
const SPI_DEVICE_BOOT_CHOICE: u16 = 0x20;

#[repr(C, packed)]
#[derive(Copy, Clone, Debug, FromBytes, IntoBytes, Immutable)]
struct SpiPort2 {
    header: PageHeader,
    port_flags: U32,
    port_settings: U32,
    device_settings: [SpiDeviceSettings; bits::DEVICES_MAX],
}
const SPI_PORT_FLAGS_TERMINATION_DISABLED: u32 = 0x10;
const SPI_PORT_INIT_HBA_SHIFT: u32 = 4;

/// Sizes of the pages with no canned contents beyond their header.
const MFG1_SIZE: usize = 260;
const MFG4_SIZE: usize = 84;
const IOUNIT3_SIZE: usize = 72;
const IOC1_SIZE: usize = 16;
const IOC2_SIZE: usize = 20;
const IOC3_SIZE: usize = 12;
const IOC4_SIZE: usize = 12;
const IOC6_SIZE: usize = 44;
const SPI_DEV0_SIZE: usize = 12;
const SPI_DEV1_SIZE: usize = 16;
const SPI_DEV2_SIZE: usize = 16;
const SPI_DEV3_SIZE: usize = 12;

fn header(page_type: u8, attr: u8, number: u8, size: usize) -> PageHeader {
    debug_assert_eq!(size % 4, 0);
    PageHeader {
        page_version: 0,
        page_length: (size / 4) as u8,
        page_number: number,
        page_type: attr | page_type,
    }
}

/// Copy `s` into a fixed-size, zero-padded field.
fn fixed_str<const N: usize>(s: &str) -> [u8; N] {
    let mut out = [0u8; N];
    let len = usize::min(s.len(), N);
    out[..len].copy_from_slice(&s.as_bytes()[..len]);
    out
}

/// Storage for every configuration page, keyed by type, number and address.
pub struct PageStore {
    pages: BTreeMap<PageKey, Vec<u8>>,
    ident: PciIdent,
}
impl PageStore {
    pub fn new(ident: PciIdent) -> Self {
        let mut store = Self { pages: BTreeMap::new(), ident };
        store.reset();
        store
    }

    /// Rebuild all pages from their defaults.
    pub fn reset(&mut self) {
        use page_attr::*;
        use page_type::*;

        self.pages.clear();
        let ident = self.ident;

        let mfg0 = Manufacturing0 {
            header: header(
                MANUFACTURING,
                PERSISTENT_READONLY,
                0,
                std::mem::size_of::<Manufacturing0>(),
            ),
            chip_name: fixed_str("VBox MPT Fusion"),
            chip_revision: fixed_str("1.0"),
            board_name: fixed_str("VBox MPT Fusion"),
            board_assembly: fixed_str("SUN"),
            board_tracer_number: fixed_str("CAFECAFECAFECAFE"),
        };
        self.insert(PageKey::new(MANUFACTURING, 0), mfg0.as_bytes());
        self.insert_blank(MANUFACTURING, PERSISTENT_READONLY, 1, MFG1_SIZE);
        for num in [2, 3] {
            let page = ManufacturingChip {
                header: header(
                    MANUFACTURING,
                    READONLY,
                    num,
                    std::mem::size_of::<ManufacturingChip>(),
                ),
                pci_device_id: U16::new(ident.device_id),
                pci_revision_id: ident.revision_id,
                reserved: 0,
                settings: [U32::ZERO; 8],
            };
            self.insert(PageKey::new(MANUFACTURING, num), page.as_bytes());
        }
        self.insert_blank(MANUFACTURING, PERSISTENT_READONLY, 4, MFG4_SIZE);

        let iounit0 = IoUnit0 {
            header: header(IO_UNIT, READONLY, 0, 12),
            unique_identifier: U64::new(0xcafe),
        };
        self.insert(PageKey::new(IO_UNIT, 0), iounit0.as_bytes());
        let iounit1 = IoUnit1 {
            header: header(IO_UNIT, READONLY, 1, 8),
            flags: U32::new(IOUNIT1_SINGLE_FUNCTION | IOUNIT1_DISABLE_IR),
        };
        self.insert(PageKey::new(IO_UNIT, 1), iounit1.as_bytes());
        let mut adapter_order = [AdapterOrder::default(); 4];
        adapter_order[0] = AdapterOrder {
            pci_bus_number: 0,
            pci_devfn: ident.devfn,
            flags: U16::new(ADAPTER_ENABLED | ADAPTER_EMBEDDED),
        };
        let iounit2 = IoUnit2 {
            header: header(IO_UNIT, PERSISTENT, 2, 32),
            flags: U32::ZERO,
            bios_version: U32::new(0xcafe_cafe),
            adapter_order,
            reserved: U32::ZERO,
        };
        self.insert(PageKey::new(IO_UNIT, 2), iounit2.as_bytes());
        self.insert_blank(IO_UNIT, CHANGEABLE, 3, IOUNIT3_SIZE);

        let ioc0 = Ioc0 {
            header: header(IOC, READONLY, 0, 28),
            total_nv_store: U32::ZERO,
            free_nv_store: U32::ZERO,
            vendor_id: U16::new(bits::PCI_VENDOR_ID),
            device_id: U16::new(ident.device_id),
            revision_id: ident.revision_id,
            reserved: [0; 3],
            class_code: U32::new(bits::PCI_CLASS_CODE),
            subsystem_vendor_id: U16::new(ident.subsys_vendor_id),
            subsystem_id: U16::new(ident.subsys_id),
        };
        self.insert(PageKey::new(IOC, 0), ioc0.as_bytes());
        self.insert_blank(IOC, CHANGEABLE, 1, IOC1_SIZE);
        self.insert_blank(IOC, READONLY, 2, IOC2_SIZE);
        self.insert_blank(IOC, READONLY, 3, IOC3_SIZE);
        self.insert_blank(IOC, READONLY, 4, IOC4_SIZE);
        self.insert_blank(IOC, READONLY, 6, IOC6_SIZE);

        for port in 0..bits::PORTS_MAX as u8 {
            let key = |number| PageKey {
                page_type: SCSI_SPI_PORT,
                number,
                addr: PageAddr::Port(port),
            };
            let port0 = SpiPort0 {
                header: header(SCSI_SPI_PORT, READONLY, 0, 12),
                capabilities: U32::new(
                    SPI_CAP_IU
                        | SPI_CAP_DT
                        | SPI_CAP_QAS
                        | (0xff << SPI_CAP_MAX_SYNC_OFFSET_SHIFT)
                        | SPI_CAP_WIDE
                        | SPI_CAP_AIP,
                ),
                physical_interface: U32::new(SPI_SIGNALING_SE),
            };
            self.insert(key(0), port0.as_bytes());
            let port1 = SpiPort1 {
                header: header(SCSI_SPI_PORT, CHANGEABLE, 1, 12),
                configuration: U32::new(
                    u32::from(bits::HOST_SCSI_ID)
                        | (1 << (16 + u32::from(bits::HOST_SCSI_ID))),
                ),
                on_bus_timer_value: U32::ZERO,
            };
            self.insert(key(1), port1.as_bytes());
            let settings = SpiDeviceSettings {
                timeout: 0,
                sync_factor: 0,
                flags: U16::new(SPI_DEVICE_BOOT_CHOICE),
            };
            let port2 = SpiPort2 {
                header: header(SCSI_SPI_PORT, CHANGEABLE, 2, 76),
                port_flags: U32::new(SPI_PORT_FLAGS_TERMINATION_DISABLED),
                port_settings: U32::new(
                    u32::from(bits::HOST_SCSI_ID)
                        | (0x3 << SPI_PORT_INIT_HBA_SHIFT),
                ),
                device_settings: [settings; bits::DEVICES_MAX],
            };
            self.insert(key(2), port2.as_bytes());
        }

        for bus in 0..bits::BUSES_MAX as u8 {
            for target in 0..bits::DEVICES_MAX as u8 {
                let addr = PageAddr::Device { bus, target };
                for (number, attr, size) in [
                    (0, READONLY, SPI_DEV0_SIZE),
                    (1, CHANGEABLE, SPI_DEV1_SIZE),
                    (2, CHANGEABLE, SPI_DEV2_SIZE),
                    (3, READONLY, SPI_DEV3_SIZE),
                ] {
                    let mut page = vec![0u8; size];
                    page[..4].copy_from_slice(
                        header(SCSI_SPI_DEVICE, attr, number, size).as_bytes(),
                    );
                    self.pages.insert(
                        PageKey { page_type: SCSI_SPI_DEVICE, number, addr },
                        page,
                    );
                }
            }
        }
    }

    fn insert(&mut self, key: PageKey, data: &[u8]) {
        self.pages.insert(key, data.to_vec());
    }

    fn insert_blank(&mut self, page_type: u8, attr: u8, number: u8, size: usize) {
        let mut page = vec![0u8; size];
        page[..4]
            .copy_from_slice(header(page_type, attr, number, size).as_bytes());
        self.pages.insert(PageKey::new(page_type, number), page);
    }

    pub fn get(&self, key: &PageKey) -> Option<&[u8]> {
        self.pages.get(key).map(Vec::as_slice)
    }

    pub fn header(&self, key: &PageKey) -> Option<PageHeader> {
        self.get(key)
            .and_then(|page| PageHeader::read_from_prefix(page).ok())
            .map(|(hdr, _)| hdr)
    }

    /// Service a CONFIG request, returning the reply to post.
    pub fn process_request(
        &mut self,
        req: &bits::ConfigRequest,
        mem: &MemCtx,
        log: &Logger,
    ) -> bits::ConfigReply {
        let mut reply = bits::ConfigReply {
            action: req.action,
            msg_length: 6,
            function: req.function,
            msg_context: req.msg_context,
            ..Default::default()
        };

        let key = PageKey::from_request(
            req.page_type,
            req.page_number,
            req.page_address.get(),
        );
        let page = match self.pages.get_mut(&key) {
            Some(page) => page,
            // Unknown pages have an all-zero header
            None => return reply,
        };
        reply.page_version = page[0];
        reply.page_length = page[1];
        reply.page_number = page[2];
        reply.page_type = page[3];

        let sge = bits::SgeFlagsLength(req.sge.flags_length.get());
        let len = usize::min(sge.length() as usize, page.len());
        let addr = if sge.addr64() {
            GuestAddr::from_parts(
                req.sge.addr_high.get(),
                req.sge.addr_low.get(),
            )
        } else {
            GuestAddr(u64::from(req.sge.addr_low.get()))
        };

        let copied = match req.action {
            config_action::HEADER | config_action::DEFAULT => Some(0),
            _ if len == 0 => Some(0),
            config_action::READ_CURRENT
            | config_action::READ_DEFAULT
            | config_action::READ_NVRAM => mem.write_from(addr, page, len),
            config_action::WRITE_CURRENT | config_action::WRITE_NVRAM => {
                mem.read_into(addr, page, len)
            }
            action => {
                warn!(log, "unsupported config action"; "action" => action);
                Some(0)
            }
        };
        if copied.is_none() {
            warn!(log, "config page transfer failed";
                "page_type" => key.page_type,
                "number" => key.number,
                "addr" => addr.0
            );
            reply.ioc_status = U16::new(IocStatus::InternalError as u16);
        }
        reply
    }

    pub fn export(&self) -> Vec<migrate::ConfigPageV1> {
        self.pages
            .iter()
            .map(|(key, data)| migrate::ConfigPageV1 {
                key: *key,
                data: data.clone(),
            })
            .collect()
    }

    /// Replace page contents with those from `pages`.
    ///
    /// Every page must already exist with the same size.
    pub fn import(
        &mut self,
        pages: Vec<migrate::ConfigPageV1>,
    ) -> Result<(), String> {
        if pages.len() != self.pages.len() {
            return Err(format!(
                "config page count mismatch: {} vs {}",
                pages.len(),
                self.pages.len()
            ));
        }
        for page in pages.iter() {
            match self.pages.get(&page.key) {
                Some(cur) if cur.len() == page.data.len() => {}
                Some(_) => {
                    return Err(format!("config page {:?} size mismatch", page.key))
                }
                None => return Err(format!("unknown config page {:?}", page.key)),
            }
        }
        for page in pages {
            self.pages.insert(page.key, page.data);
        }
        Ok(())
    }
}

pub mod migrate {
    use super::PageKey;
    use serde::{Deserialize, Serialize};

    #[derive(Clone, Debug, Deserialize, Serialize)]
    pub struct ConfigPageV1 {
        pub key: PageKey,
        pub data: Vec<u8>,
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::vmm::PhysMem;

    use slog::Discard;
    use std::mem::size_of;

    fn ident() -> PciIdent {
        PciIdent {
            device_id: bits::PCI_SPI_DEVICE_ID,
            revision_id: bits::PCI_REVISION_ID,
            subsys_vendor_id: bits::PCI_SUBSYSTEM_VENDOR_ID,
            subsys_id: bits::PCI_SUBSYSTEM_ID,
            devfn: 0x28,
        }
    }

    fn request(
        action: u8,
        key_type: u8,
        number: u8,
        address: u32,
    ) -> bits::ConfigRequest {
        bits::ConfigRequest {
            action,
            function: bits::MsgFunction::Config as u8,
            msg_context: U32::new(0x1234),
            page_number: number,
            page_type: key_type,
            page_address: U32::new(address),
            ..Default::default()
        }
    }

    fn with_sge(
        mut req: bits::ConfigRequest,
        addr: u64,
        len: u32,
    ) -> bits::ConfigRequest {
        let flags = bits::SgeFlagsLength(0)
            .with_length(len)
            .with_elem_type(bits::SgeType::Simple)
            .with_addr64(true)
            .with_end_of_list(true);
        req.sge = bits::SgeSimple64 {
            flags_length: U32::new(flags.0),
            addr_low: U32::new(addr as u32),
            addr_high: U32::new((addr >> 32) as u32),
        };
        req
    }

    #[test]
    fn layout_sizes() {
        assert_eq!(size_of::<Manufacturing0>(), 76);
        assert_eq!(size_of::<ManufacturingChip>(), 40);
        assert_eq!(size_of::<IoUnit0>(), 12);
        assert_eq!(size_of::<IoUnit1>(), 8);
        assert_eq!(size_of::<IoUnit2>(), 32);
        assert_eq!(size_of::<Ioc0>(), 28);
        assert_eq!(size_of::<SpiPort0>(), 12);
        assert_eq!(size_of::<SpiPort1>(), 12);
        assert_eq!(size_of::<SpiPort2>(), 76);
    }

    #[test]
    fn lookup_keys() {
        use page_type::*;

        let store = PageStore::new(ident());

        let mfg0 = store.header(&PageKey::new(MANUFACTURING, 0)).unwrap();
        assert_eq!(mfg0.page_length, 19);
        assert_eq!(mfg0.page_type, 0x39);
        assert!(store.header(&PageKey::new(IOC, 5)).is_none());
        assert!(store.header(&PageKey::new(IOC, 6)).is_some());

        let port = |p| PageKey::from_request(SCSI_SPI_PORT, 2, p);
        assert_eq!(store.get(&port(0)).map(|p| p.len()), Some(76));
        assert!(store.get(&port(1)).is_none());

        // Attribute bits in the request are ignored for lookup
        let dev = |bus: u32, target: u32| {
            PageKey::from_request(
                page_attr::CHANGEABLE | SCSI_SPI_DEVICE,
                1,
                (bus << 8) | target,
            )
        };
        assert_eq!(
            dev(0, 15),
            PageKey {
                page_type: SCSI_SPI_DEVICE,
                number: 1,
                addr: PageAddr::Device { bus: 0, target: 15 }
            }
        );
        assert!(store.get(&dev(0, 15)).is_some());
        assert!(store.get(&dev(0, 16)).is_none());
        assert!(store.get(&dev(1, 0)).is_none());

        let iounit2 = store.get(&PageKey::new(IO_UNIT, 2)).unwrap();
        let (page, _) = IoUnit2::read_from_prefix(iounit2).unwrap();
        assert_eq!(page.bios_version.get(), 0xcafe_cafe);
        assert_eq!(page.adapter_order[0].pci_devfn, 0x28);
        assert_eq!(
            page.adapter_order[0].flags.get(),
            ADAPTER_ENABLED | ADAPTER_EMBEDDED
        );
    }

    #[test]
    fn headers_match_keys() {
        use page_attr::*;
        use page_type::*;

        let mut expected = vec![
            (PageKey::new(MANUFACTURING, 0), PERSISTENT_READONLY),
            (PageKey::new(MANUFACTURING, 1), PERSISTENT_READONLY),
            (PageKey::new(MANUFACTURING, 2), READONLY),
            (PageKey::new(MANUFACTURING, 3), READONLY),
            (PageKey::new(MANUFACTURING, 4), PERSISTENT_READONLY),
            (PageKey::new(IO_UNIT, 0), READONLY),
            (PageKey::new(IO_UNIT, 1), READONLY),
            (PageKey::new(IO_UNIT, 2), PERSISTENT),
            (PageKey::new(IO_UNIT, 3), CHANGEABLE),
            (PageKey::new(IOC, 0), READONLY),
            (PageKey::new(IOC, 1), CHANGEABLE),
            (PageKey::new(IOC, 2), READONLY),
            (PageKey::new(IOC, 3), READONLY),
            (PageKey::new(IOC, 4), READONLY),
            (PageKey::new(IOC, 6), READONLY),
        ];
        for (number, attr) in [(0, READONLY), (1, CHANGEABLE), (2, CHANGEABLE)]
        {
            let key = PageKey {
                page_type: SCSI_SPI_PORT,
                number,
                addr: PageAddr::Port(0),
            };
            expected.push((key, attr));
        }
        for target in 0..bits::DEVICES_MAX as u8 {
            for (number, attr) in
                [(0, READONLY), (1, CHANGEABLE), (2, CHANGEABLE), (3, READONLY)]
            {
                let key = PageKey {
                    page_type: SCSI_SPI_DEVICE,
                    number,
                    addr: PageAddr::Device { bus: 0, target },
                };
                expected.push((key, attr));
            }
        }
        expected.sort();

        let mut store = PageStore::new(ident());
        // Same set of pages before and after a reset
        store.pages.clear();
        store.reset();

        let keys: Vec<PageKey> = store.pages.keys().copied().collect();
        assert_eq!(keys, expected.iter().map(|(k, _)| *k).collect::<Vec<_>>());

        for (key, attr) in expected {
            let page = store.get(&key).unwrap();
            let hdr = store.header(&key).unwrap();
            assert_eq!(hdr.page_number, key.number, "{key:?}");
            assert_eq!(hdr.page_type & 0x0f, key.page_type, "{key:?}");
            assert_eq!(hdr.page_type & 0xf0, attr, "{key:?}");
            assert_eq!(hdr.page_length as usize * 4, page.len(), "{key:?}");

            // The key a request would use finds the same page
            let address = match key.addr {
                PageAddr::None => 0,
                PageAddr::Port(port) => u32::from(port),
                PageAddr::Device { bus, target } => {
                    (u32::from(bus) << 8) | u32::from(target)
                }
            };
            let from_req =
                PageKey::from_request(hdr.page_type, hdr.page_number, address);
            assert_eq!(from_req, key);
        }
    }

    #[test]
    fn not_found_zeroes_header() {
        let log = Logger::root(Discard, slog::o!());
        let phys = PhysMem::new(0x10000);
        let mem = MemCtx::new(phys);
        let mut store = PageStore::new(ident());

        let mut req = with_sge(
            request(config_action::READ_CURRENT, page_type::IOC, 5, 0),
            0x2000,
            64,
        );
        req.page_version = 3;
        req.page_length = 4;
        let reply = store.process_request(&req, &mem, &log);
        assert_eq!(reply.msg_length, 6);
        assert_eq!(reply.msg_context.get(), 0x1234);
        assert_eq!(reply.ioc_status.get(), IocStatus::Success as u16);
        assert_eq!(reply.page_version, 0);
        assert_eq!(reply.page_length, 0);
        assert_eq!(reply.page_number, 0);
        assert_eq!(reply.page_type, 0);
        assert_eq!(mem.read::<[u8; 4]>(GuestAddr(0x2000)), Some([0; 4]));
    }

    #[test]
    fn read_write_actions() {
        let log = Logger::root(Discard, slog::o!());
        let phys = PhysMem::new(0x10000);
        let mem = MemCtx::new(phys);
        let mut store = PageStore::new(ident());

        // Header only
        let req = with_sge(
            request(config_action::HEADER, page_type::MANUFACTURING, 0, 0),
            0x2000,
            200,
        );
        let reply = store.process_request(&req, &mem, &log);
        assert_eq!(reply.page_length, 19);
        assert_eq!(reply.page_type, 0x39);
        assert_eq!(mem.read::<u8>(GuestAddr(0x2004)), Some(0));

        // Read truncated to the page size
        mem.write_from(GuestAddr(0x2000), &[0xee; 200], 200).unwrap();
        let req = with_sge(
            request(config_action::READ_CURRENT, page_type::MANUFACTURING, 0, 0),
            0x2000,
            200,
        );
        store.process_request(&req, &mem, &log);
        let mut buf = [0u8; 80];
        mem.read_into(GuestAddr(0x2000), &mut buf, 80).unwrap();
        assert_eq!(&buf[4..19], b"VBox MPT Fusion");
        assert_eq!(&buf[44..47], b"SUN");
        assert_eq!(buf[76..80], [0xee; 4]);

        // Write to a changeable page, truncated to the buffer size
        mem.write_from(GuestAddr(0x3000), &[0, 0, 0, 0, 0xaa, 0xbb], 6)
            .unwrap();
        let key = PageKey::new(page_type::IO_UNIT, 3);
        let req = with_sge(
            request(config_action::WRITE_CURRENT, page_type::IO_UNIT, 3, 0),
            0x3000,
            6,
        );
        store.process_request(&req, &mem, &log);
        assert_eq!(&store.get(&key).unwrap()[4..7], &[0xaa, 0xbb, 0]);

        // Zero-length buffers transfer nothing
        let req = with_sge(
            request(config_action::READ_NVRAM, page_type::IO_UNIT, 3, 0),
            0x4000,
            0,
        );
        store.process_request(&req, &mem, &log);
        assert_eq!(mem.read::<u32>(GuestAddr(0x4000)), Some(0));

        // Unreachable buffers fail the request
        let req = with_sge(
            request(config_action::READ_CURRENT, page_type::IOC, 0, 0),
            0x1_0000_0000,
            28,
        );
        let reply = store.process_request(&req, &mem, &log);
        assert_eq!(reply.ioc_status.get(), IocStatus::InternalError as u16);

        // Reset restores the defaults
        store.reset();
        assert_eq!(&store.get(&key).unwrap()[4..7], &[0, 0, 0]);
    }

    #[test]
    fn export_import() {
        let mut store = PageStore::new(ident());
        let key = PageKey::from_request(page_type::SCSI_SPI_DEVICE, 1, 3);
        let mut pages = store.export();
        for page in pages.iter_mut() {
            if page.key == key {
                page.data[4] = 0x42;
            }
        }
        store.import(pages.clone()).unwrap();
        assert_eq!(store.get(&key).unwrap()[4], 0x42);

        pages[0].data.push(0);
        assert!(store.import(pages.clone()).is_err());
        pages.pop();
        assert!(store.import(pages).is_err());
    }
}
