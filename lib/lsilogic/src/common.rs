// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use std::ops::{Add, RangeBounds};
use std::slice::SliceIndex;

/// A guest read of a register window.  The device fulfills it by writing
/// into the buffer.
pub struct ReadOp<'a> {
    buf: &'a mut [u8],
    offset: usize,
    write_offset: usize,
}

impl<'a> ReadOp<'a> {
    /// `op_offset` is the offset within the window being read.
    pub fn from_buf(op_offset: usize, buffer: &'a mut [u8]) -> Self {
        Self { buf: buffer, offset: op_offset, write_offset: 0 }
    }

    /// Split `range` of `parent` out into an operation of its own, at
    /// `op_offset` within whatever it targets.
    pub fn new_child<'b, R>(
        op_offset: usize,
        parent: &'a mut ReadOp,
        range: R,
    ) -> ReadOp<'b>
    where
        'a: 'b,
        R: RangeBounds<usize> + SliceIndex<[u8], Output = [u8]>,
    {
        ReadOp { buf: &mut parent.buf[range], offset: op_offset, write_offset: 0 }
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }
    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }
    pub fn offset(&self) -> usize {
        self.offset
    }
    fn avail(&self) -> usize {
        self.len() - self.write_offset
    }

    pub fn write_u32(&mut self, val: u32) {
        self.write_bytes(&val.to_le_bytes()[..]);
    }
    pub fn write_bytes(&mut self, data: &[u8]) {
        let copy_len = data.len();
        let wr_off = self.write_offset;
        assert!(copy_len <= self.avail());

        self.buf[wr_off..(wr_off + copy_len)].copy_from_slice(data);
        self.write_offset += copy_len;
    }
    /// Fill whatever has not been written yet with `val`.
    pub fn fill(&mut self, val: u8) {
        self.buf[self.write_offset..].fill(val);
        self.write_offset = self.len();
    }
}

/// A guest write to a register window.  The device consumes it by reading
/// out of the buffer.
pub struct WriteOp<'a> {
    buf: &'a [u8],
    offset: usize,
    read_offset: usize,
}
impl<'a> WriteOp<'a> {
    pub fn from_buf(op_offset: usize, buf: &'a [u8]) -> Self {
        Self { buf, offset: op_offset, read_offset: 0 }
    }

    pub fn new_child<'b, R>(
        op_offset: usize,
        parent: &'a mut WriteOp,
        range: R,
    ) -> WriteOp<'b>
    where
        'a: 'b,
        R: RangeBounds<usize> + SliceIndex<[u8], Output = [u8]>,
    {
        WriteOp { buf: &parent.buf[range], offset: op_offset, read_offset: 0 }
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }
    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }
    pub fn offset(&self) -> usize {
        self.offset
    }
    fn avail(&self) -> usize {
        self.len() - self.read_offset
    }

    /// Read the remainder of the operation as a little-endian value,
    /// zero-extending accesses narrower than 4 bytes.
    pub fn read_u32_extend(&mut self) -> u32 {
        let mut buf = [0u8; 4];
        let len = usize::min(self.avail(), buf.len());
        self.read_bytes(&mut buf[..len]);
        u32::from_le_bytes(buf)
    }
    pub fn read_bytes(&mut self, data: &mut [u8]) {
        let copy_len = data.len();
        if copy_len == 0 {
            return;
        }
        let rd_off = self.read_offset;
        assert!(copy_len <= self.avail());

        data.copy_from_slice(&self.buf[rd_off..(rd_off + copy_len)]);
        self.read_offset += copy_len;
    }
}

pub enum RWOp<'a, 'b> {
    Read(&'a mut ReadOp<'b>),
    Write(&'a mut WriteOp<'b>),
}
impl RWOp<'_, '_> {
    pub fn offset(&self) -> usize {
        match self {
            RWOp::Read(ro) => ro.offset,
            RWOp::Write(wo) => wo.offset,
        }
    }
    pub fn len(&self) -> usize {
        match self {
            RWOp::Read(ro) => ro.len(),
            RWOp::Write(wo) => wo.len(),
        }
    }
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// An address within guest memory.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd)]
pub struct GuestAddr(pub u64);

impl GuestAddr {
    /// Join the high and low halves in which the host hands out addresses.
    pub fn from_parts(high: u32, low: u32) -> Self {
        Self((u64::from(high) << 32) | u64::from(low))
    }
}

impl Add<usize> for GuestAddr {
    type Output = Self;

    fn add(self, rhs: usize) -> Self::Output {
        Self(self.0 + rhs as u64)
    }
}

/// A span of guest memory: start address and length in bytes.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct GuestRegion(pub GuestAddr, pub usize);

impl GuestRegion {
    /// First address past the end of the region.
    pub fn end(&self) -> GuestAddr {
        self.0 + self.1
    }
}

pub use crate::lifecycle::Lifecycle;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn readop_fill() {
        let mut buf = [0xffu8; 8];
        let mut ro = ReadOp::from_buf(0x10, &mut buf[..6]);
        assert_eq!(ro.offset(), 0x10);
        ro.write_u32(0x4000_0001);
        ro.fill(0);
        drop(ro);
        assert_eq!(buf, [1, 0, 0, 0x40, 0, 0, 0xff, 0xff]);
    }

    #[test]
    fn writeop_extend() {
        let buf = [0x10, 0x20, 0x30, 0x40];
        let mut wo8 = WriteOp::from_buf(0, &buf[0..1]);
        assert_eq!(wo8.read_u32_extend(), 0x10);

        let mut wo16 = WriteOp::from_buf(0, &buf[0..2]);
        assert_eq!(wo16.read_u32_extend(), 0x2010);

        let mut wo32 = WriteOp::from_buf(0, &buf);
        assert_eq!(wo32.read_u32_extend(), 0x40302010);
    }

    #[test]
    #[should_panic]
    fn readop_oversize() {
        let mut buf = [0u8; 2];
        let mut ro = ReadOp::from_buf(0, &mut buf);
        ro.write_u32(0x1000);
    }

    #[test]
    fn guest_addr_parts() {
        let addr = GuestAddr::from_parts(0x1, 0x8000_0000);
        assert_eq!(addr, GuestAddr(0x1_8000_0000));
        assert_eq!(GuestRegion(addr, 0x10).end(), GuestAddr(0x1_8000_0010));
    }
}
