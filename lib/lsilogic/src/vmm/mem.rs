// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Module for accessing guest physical memory.
//!
//! The controller only ever sees guest memory through the [GuestMemory]
//! trait: plain copies in and out, plus page-mapping locks which pin a region
//! for direct access while a backend request is in flight.

use std::collections::BTreeMap;
use std::io::{Error, ErrorKind, Result};
use std::mem::size_of;
use std::sync::{Arc, Mutex};

use crate::common::{GuestAddr, GuestRegion};

use zerocopy::{FromBytes, Immutable, IntoBytes};

bitflags! {
    /// Bitflags representing memory protections.
    #[derive(Debug, Copy, Clone, PartialEq, Eq)]
    pub struct Prot: u8 {
        const NONE = 0;
        const READ = 0b01;
        const WRITE = 0b10;
        const RW = Self::READ.bits() | Self::WRITE.bits();
    }
}

/// Handle for a guest region pinned by [GuestMemory::lock_region].
///
/// Must be handed back to [GuestMemory::unlock_region] once the region is no
/// longer accessed directly.
#[derive(Debug, PartialEq, Eq)]
pub struct RegionLock {
    id: u64,
    region: GuestRegion,
    prot: Prot,
}
impl RegionLock {
    pub fn region(&self) -> GuestRegion {
        self.region
    }
    pub fn prot(&self) -> Prot {
        self.prot
    }
}

/// Access to the physical address space of a guest.
pub trait GuestMemory: Send + Sync + 'static {
    /// Copy `buf.len()` bytes out of guest memory starting at `addr`.
    fn read_bytes(&self, addr: GuestAddr, buf: &mut [u8]) -> Result<()>;

    /// Copy `buf` into guest memory starting at `addr`.
    fn write_bytes(&self, addr: GuestAddr, buf: &[u8]) -> Result<()>;

    /// Pin `region` with access `prot` for direct use.
    fn lock_region(&self, region: &GuestRegion, prot: Prot)
        -> Result<RegionLock>;

    /// Release a pin acquired through [GuestMemory::lock_region].
    fn unlock_region(&self, lock: RegionLock);
}

/// Flat, heap-backed guest memory starting at guest physical address 0.
pub struct PhysMem {
    inner: Mutex<PhysInner>,
}
struct PhysInner {
    bytes: Vec<u8>,
    locks: BTreeMap<u64, (GuestRegion, Prot)>,
    next_lock: u64,
}

impl PhysMem {
    pub fn new(size: usize) -> Arc<Self> {
        Arc::new(Self {
            inner: Mutex::new(PhysInner {
                bytes: vec![0; size],
                locks: BTreeMap::new(),
                next_lock: 0,
            }),
        })
    }

    /// Size of the address space, in bytes.
    pub fn size(&self) -> usize {
        self.inner.lock().unwrap().bytes.len()
    }

    /// Number of regions currently pinned via [GuestMemory::lock_region].
    pub fn locked_regions(&self) -> usize {
        self.inner.lock().unwrap().locks.len()
    }

    fn range(len: usize, addr: GuestAddr, count: usize) -> Result<(usize, usize)> {
        let start = usize::try_from(addr.0)
            .map_err(|_| Error::new(ErrorKind::InvalidInput, "bad address"))?;
        match start.checked_add(count) {
            Some(end) if end <= len => Ok((start, end)),
            _ => Err(Error::new(
                ErrorKind::InvalidInput,
                format!("access {:#x}+{:#x} outside guest memory", addr.0, count),
            )),
        }
    }
}

impl GuestMemory for PhysMem {
    fn read_bytes(&self, addr: GuestAddr, buf: &mut [u8]) -> Result<()> {
        let inner = self.inner.lock().unwrap();
        let (start, end) = Self::range(inner.bytes.len(), addr, buf.len())?;
        buf.copy_from_slice(&inner.bytes[start..end]);
        Ok(())
    }

    fn write_bytes(&self, addr: GuestAddr, buf: &[u8]) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        let (start, end) = Self::range(inner.bytes.len(), addr, buf.len())?;
        inner.bytes[start..end].copy_from_slice(buf);
        Ok(())
    }

    fn lock_region(
        &self,
        region: &GuestRegion,
        prot: Prot,
    ) -> Result<RegionLock> {
        let mut inner = self.inner.lock().unwrap();
        let _ = Self::range(inner.bytes.len(), region.0, region.1)?;

        let id = inner.next_lock;
        inner.next_lock += 1;
        inner.locks.insert(id, (*region, prot));
        Ok(RegionLock { id, region: *region, prot })
    }

    fn unlock_region(&self, lock: RegionLock) {
        let mut inner = self.inner.lock().unwrap();
        let removed = inner.locks.remove(&lock.id);
        debug_assert!(removed.is_some(), "unlocked region was not held");
    }
}

/// Wrapper around the guest address space, offering typed accessors.
pub struct MemCtx {
    mem: Arc<dyn GuestMemory>,
}
impl MemCtx {
    pub fn new(mem: Arc<dyn GuestMemory>) -> Arc<Self> {
        Arc::new(Self { mem })
    }

    /// Reads a generic value from a specified guest address.
    pub fn read<T: Copy + FromBytes>(&self, addr: GuestAddr) -> Option<T> {
        let mut buf = vec![0u8; size_of::<T>()];
        self.mem.read_bytes(addr, &mut buf).ok()?;
        T::read_from_bytes(&buf).ok()
    }
    /// Reads bytes into a requested buffer from guest memory.
    ///
    /// Copies up to `buf.len()` or `len` bytes, whichever is smaller.
    pub fn read_into(
        &self,
        addr: GuestAddr,
        buf: &mut [u8],
        len: usize,
    ) -> Option<usize> {
        let len = usize::min(buf.len(), len);
        self.mem.read_bytes(addr, &mut buf[..len]).ok()?;
        Some(len)
    }
    /// Writes a value to guest memory.
    pub fn write<T: IntoBytes + Immutable>(
        &self,
        addr: GuestAddr,
        val: &T,
    ) -> bool {
        self.mem.write_bytes(addr, val.as_bytes()).is_ok()
    }
    /// Writes bytes from a buffer to guest memory.
    ///
    /// Writes up to `buf.len()` or `len` bytes, whichever is smaller.
    pub fn write_from(
        &self,
        addr: GuestAddr,
        buf: &[u8],
        len: usize,
    ) -> Option<usize> {
        let len = usize::min(buf.len(), len);
        self.mem.write_bytes(addr, &buf[..len]).ok()?;
        Some(len)
    }

    pub fn writable_region(&self, region: &GuestRegion) -> Option<RegionLock> {
        self.mem.lock_region(region, Prot::WRITE).ok()
    }
    pub fn readable_region(&self, region: &GuestRegion) -> Option<RegionLock> {
        self.mem.lock_region(region, Prot::READ).ok()
    }
    pub fn release_region(&self, lock: RegionLock) {
        self.mem.unlock_region(lock)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn typed_access() {
        let phys = PhysMem::new(0x1000);
        let mem = MemCtx::new(phys.clone());

        assert!(mem.write(GuestAddr(0x10), &0xdeadbeefu32));
        assert_eq!(mem.read::<u32>(GuestAddr(0x10)), Some(0xdeadbeef));
        assert_eq!(mem.read::<u16>(GuestAddr(0x12)), Some(0xdead));

        let mut buf = [0u8; 8];
        assert_eq!(mem.read_into(GuestAddr(0x10), &mut buf, 2), Some(2));
        assert_eq!(&buf[..2], &[0xef, 0xbe]);
    }

    #[test]
    fn out_of_range() {
        let phys = PhysMem::new(0x100);
        let mem = MemCtx::new(phys.clone());

        assert!(!mem.write(GuestAddr(0xfe), &0u32));
        assert_eq!(mem.read::<u32>(GuestAddr(0x100)), None);
        assert!(mem.readable_region(&GuestRegion(GuestAddr(0x80), 0x81))
            .is_none());
        assert_eq!(mem.write_from(GuestAddr(u64::MAX), &[1], 1), None);
    }

    #[test]
    fn region_locks_tracked() {
        let phys = PhysMem::new(0x1000);
        let mem = MemCtx::new(phys.clone());

        let a = mem.readable_region(&GuestRegion(GuestAddr(0), 0x200)).unwrap();
        let b =
            mem.writable_region(&GuestRegion(GuestAddr(0x200), 0x200)).unwrap();
        assert_eq!(phys.locked_regions(), 2);
        assert_eq!(b.prot(), Prot::WRITE);
        mem.release_region(a);
        mem.release_region(b);
        assert_eq!(phys.locked_regions(), 0);
    }
}
