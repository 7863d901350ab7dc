// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Translation of MPT scatter/gather lists into [ScatterList]s.
//!
//! A list starts inline in the request frame and may continue through chain
//! elements into further segments in guest memory.  Fragments which are
//! sector-aligned are pinned and handed to the target directly.  Anything
//! else is bounced through a staging buffer owned by the task.

use std::collections::TryReserveError;
use std::mem::{size_of, take};
use std::ops::Range;
use std::sync::Arc;

use super::bits::{self, SgeFlagsLength, SgeType};
use crate::common::{GuestAddr, GuestRegion};
use crate::scsi::{ScatterList, Segment};
use crate::vmm::{MemCtx, RegionLock};

use thiserror::Error;
use zerocopy::byteorder::little_endian::U32;

/// Chain elements followed before a list is declared malformed.
pub const SGL_MAX_CHAIN_HOPS: usize = 256;
/// Simple elements accepted in a single list.
pub const SGL_MAX_ENTRIES: usize = 4096;
/// Consecutive oversized requests tolerated before retained arrays are freed.
pub const SGL_NR_ALLOWED_BIGGER_LISTS: u32 = 100;
/// Fragments whose address or length is not a multiple of this are staged.
pub const SGL_STAGE_ALIGN: usize = 512;
/// Staging space a single request may claim.
pub const SGL_MAX_STAGE_BYTES: usize = 8 * 1024 * 1024;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SglError {
    /// An element inside a segment was not a simple element.
    #[error("unexpected {0:?} element at {1:#x}")]
    NotSimple(SgeType, u64),

    /// The element at the chain offset was not a chain element.
    #[error("expected chain element at {0:#x}")]
    NotChain(u64),

    /// An element could not be read from guest memory.
    #[error("element at {0:#x} unreadable")]
    Unreadable(u64),

    #[error("chain element limit exceeded")]
    TooManyHops,

    #[error("element limit exceeded")]
    TooManyEntries,

    /// Guest memory described by an element could not be accessed.
    #[error("guest region {0:#x}+{1:#x} inaccessible")]
    GuestAccess(u64, usize),

    /// The list grew between the sizing and translation passes.
    #[error("list changed during translation")]
    Changed,

    /// Unaligned fragments add up to more staging space than is allowed.
    #[error("{0:#x} bytes of staging exceeds limit")]
    StageLimit(usize),

    #[error("could not allocate {0:#x} bytes of staging")]
    StageAlloc(usize),
}
impl SglError {
    /// Does the error stem from a malformed list (as opposed to failing to
    /// access or buffer the memory it describes)?
    pub fn is_malformed(&self) -> bool {
        !matches!(
            self,
            SglError::GuestAccess(..)
                | SglError::Changed
                | SglError::StageLimit(_)
                | SglError::StageAlloc(_)
        )
    }
}

/// A single data fragment described by a simple element.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SgEntry {
    pub addr: GuestAddr,
    pub len: usize,
    /// Host to IOC transfer
    pub contains_data: bool,
}
impl SgEntry {
    fn needs_staging(&self) -> bool {
        self.len % SGL_STAGE_ALIGN != 0
            || self.addr.0 % SGL_STAGE_ALIGN as u64 != 0
    }
}

/// Position of a walk through a (possibly chained) list.
#[derive(Clone, Copy, Debug)]
pub struct SglCursor {
    next: GuestAddr,
    seg_base: GuestAddr,
    chain_offset: Option<usize>,
}
impl SglCursor {
    /// Cursor for the list of a SCSI I/O request frame at `frame`.
    ///
    /// `chain_offset` is the request's ChainOffset field, in dwords from the
    /// start of the frame.
    pub fn for_scsi_io(frame: GuestAddr, chain_offset: u8) -> Self {
        let base = frame + bits::SCSI_IO_SGL_OFFSET;
        let chain_offset = match chain_offset {
            0 => None,
            off => {
                Some((off as usize * 4).saturating_sub(bits::SCSI_IO_SGL_OFFSET))
            }
        };
        Self { next: base, seg_base: base, chain_offset }
    }
}

/// Lazily yields the simple elements of a list.
///
/// The walk ends at the first element flagged EndOfList, or at a zero-length
/// element flagged both EndOfList and EndOfBuffer (which is not yielded).
/// Errors end the walk as well.
pub struct SglWalker<'a> {
    mem: &'a MemCtx,
    cursor: SglCursor,
    hops: usize,
    entries: usize,
    done: bool,
}
impl<'a> SglWalker<'a> {
    pub fn new(mem: &'a MemCtx, cursor: SglCursor) -> Self {
        Self { mem, cursor, hops: 0, entries: 0, done: false }
    }

    fn follow_chain(&mut self) -> Result<(), SglError> {
        self.hops += 1;
        if self.hops > SGL_MAX_CHAIN_HOPS {
            return Err(SglError::TooManyHops);
        }
        let at = self.cursor.next;
        let chain: bits::SgeChain =
            self.mem.read(at).ok_or(SglError::Unreadable(at.0))?;
        let flags = chain.flags();
        if flags.elem_type() != SgeType::Chain {
            return Err(SglError::NotChain(at.0));
        }
        let addr = if flags.addr64() {
            GuestAddr::from_parts(chain.addr_high.get(), chain.addr_low.get())
        } else {
            GuestAddr(u64::from(chain.addr_low.get()))
        };
        self.cursor = SglCursor {
            next: addr,
            seg_base: addr,
            chain_offset: match chain.next_chain_offset {
                0 => None,
                off => Some(off as usize * 4),
            },
        };
        Ok(())
    }

    fn step(&mut self) -> Result<Option<SgEntry>, SglError> {
        if let Some(off) = self.cursor.chain_offset {
            if self.cursor.next == self.cursor.seg_base + off {
                self.follow_chain()?;
            }
        }

        let at = self.cursor.next;
        let flags = SgeFlagsLength(
            self.mem.read::<U32>(at).ok_or(SglError::Unreadable(at.0))?.get(),
        );
        if flags.elem_type() != SgeType::Simple {
            return Err(SglError::NotSimple(flags.elem_type(), at.0));
        }
        let addr = if flags.addr64() {
            let sge: bits::SgeSimple64 =
                self.mem.read(at).ok_or(SglError::Unreadable(at.0))?;
            self.cursor.next = at + size_of::<bits::SgeSimple64>();
            GuestAddr::from_parts(sge.addr_high.get(), sge.addr_low.get())
        } else {
            let sge: bits::SgeSimple32 =
                self.mem.read(at).ok_or(SglError::Unreadable(at.0))?;
            self.cursor.next = at + size_of::<bits::SgeSimple32>();
            GuestAddr(u64::from(sge.addr_low.get()))
        };

        let len = flags.length() as usize;
        if len == 0 && flags.end_of_list() && flags.end_of_buffer() {
            return Ok(None);
        }

        self.entries += 1;
        if self.entries > SGL_MAX_ENTRIES {
            return Err(SglError::TooManyEntries);
        }

        if flags.end_of_list() {
            self.done = true;
        } else if flags.last_element() {
            if let Some(off) = self.cursor.chain_offset {
                self.cursor.next = self.cursor.seg_base + off;
            }
        }
        Ok(Some(SgEntry { addr, len, contains_data: flags.contains_data() }))
    }
}
impl Iterator for SglWalker<'_> {
    type Item = Result<SgEntry, SglError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        match self.step() {
            Ok(Some(ent)) => Some(Ok(ent)),
            Ok(None) => {
                self.done = true;
                None
            }
            Err(e) => {
                self.done = true;
                Some(Err(e))
            }
        }
    }
}

/// How a translated fragment is backed while the request is in flight.
#[derive(Debug)]
enum SgPiece {
    Direct(RegionLock),
    Staged { addr: GuestAddr, range: Range<usize>, contains_data: bool },
}

const ARR_PIECES: usize = 0;
const ARR_SEGS: usize = 1;
const ARR_STAGE: usize = 2;

/// Scatter/gather arrays retained by a task from one request to the next.
///
/// The segment list and staging buffer are lent to the [ScatterList] while
/// the request is in flight, and returned through [SglBuffers::teardown].
#[derive(Debug, Default)]
pub struct SglBuffers {
    pieces: Vec<SgPiece>,
    segs: Vec<Segment>,
    stage: Vec<u8>,

    /// Element counts the arrays are sized for
    retained: [usize; 3],
    /// Consecutive requests which needed less than `retained`
    oversize: [u32; 3],
}

impl SglBuffers {
    /// Build a [ScatterList] for the list starting at `cursor`.
    ///
    /// On failure, nothing remains pinned.
    pub fn translate(
        &mut self,
        mem: &Arc<MemCtx>,
        cursor: SglCursor,
    ) -> Result<ScatterList, SglError> {
        let mut count = 0;
        let mut staged = 0;
        for ent in SglWalker::new(mem, cursor) {
            let ent = ent?;
            count += 1;
            if ent.needs_staging() {
                staged += ent.len;
                if staged > SGL_MAX_STAGE_BYTES {
                    return Err(SglError::StageLimit(staged));
                }
            }
        }
        if let Err(e) = self.size_for([count, count, staged]) {
            *self = SglBuffers::default();
            return Err(e);
        }

        let mut stage_off = 0;
        for ent in SglWalker::new(mem, cursor) {
            if let Err(e) = ent.and_then(|ent| self.add(mem, ent, &mut stage_off))
            {
                self.abort(mem);
                return Err(e);
            }
        }
        Ok(ScatterList::new(
            mem.clone(),
            take(&mut self.segs),
            take(&mut self.stage),
        ))
    }

    fn add(
        &mut self,
        mem: &MemCtx,
        ent: SgEntry,
        stage_off: &mut usize,
    ) -> Result<(), SglError> {
        if ent.len == 0 {
            return Ok(());
        }
        if self.pieces.len() >= self.retained[ARR_PIECES] {
            return Err(SglError::Changed);
        }

        if ent.needs_staging() {
            let range = *stage_off..(*stage_off + ent.len);
            if range.end > self.stage.len() {
                return Err(SglError::Changed);
            }
            if ent.contains_data {
                mem.read_into(ent.addr, &mut self.stage[range.clone()], ent.len)
                    .ok_or(SglError::GuestAccess(ent.addr.0, ent.len))?;
            }
            *stage_off = range.end;

            match self.segs.last_mut() {
                Some(Segment::Staged(prev)) if prev.end == range.start => {
                    prev.end = range.end;
                }
                _ => self.segs.push(Segment::Staged(range.clone())),
            }
            self.pieces.push(SgPiece::Staged {
                addr: ent.addr,
                range,
                contains_data: ent.contains_data,
            });
        } else {
            let region = GuestRegion(ent.addr, ent.len);
            let lock = if ent.contains_data {
                mem.readable_region(&region)
            } else {
                mem.writable_region(&region)
            }
            .ok_or(SglError::GuestAccess(ent.addr.0, ent.len))?;

            match self.segs.last_mut() {
                Some(Segment::Guest(prev)) if prev.end() == region.0 => {
                    prev.1 += region.1;
                }
                _ => self.segs.push(Segment::Guest(region)),
            }
            self.pieces.push(SgPiece::Direct(lock));
        }
        Ok(())
    }

    /// Undo a partial translation.
    fn abort(&mut self, mem: &MemCtx) {
        for piece in self.pieces.drain(..) {
            if let SgPiece::Direct(lock) = piece {
                mem.release_region(lock);
            }
        }
        self.segs.clear();
    }

    /// Finish with the list handed out by [SglBuffers::translate].
    ///
    /// Staged fragments the host expects data in are copied back to the
    /// guest and direct mappings are released, even if some copy fails.
    pub fn teardown(
        &mut self,
        mem: &MemCtx,
        list: ScatterList,
    ) -> Result<(), SglError> {
        let (mut segs, stage) = list.into_parts();
        let mut res = Ok(());

        for piece in self.pieces.drain(..) {
            match piece {
                SgPiece::Direct(lock) => mem.release_region(lock),
                SgPiece::Staged { addr, range, contains_data: false } => {
                    let len = range.len();
                    if mem.write_from(addr, &stage[range], len).is_none() {
                        res = Err(SglError::GuestAccess(addr.0, len));
                    }
                }
                SgPiece::Staged { contains_data: true, .. } => {}
            }
        }
        segs.clear();
        self.segs = segs;
        self.stage = stage;

        if self.oversize.iter().any(|c| *c >= SGL_NR_ALLOWED_BIGGER_LISTS) {
            *self = SglBuffers::default();
        }
        res
    }

    fn size_for(&mut self, need: [usize; 3]) -> Result<(), SglError> {
        for (i, need) in need.iter().enumerate() {
            if *need > self.retained[i] {
                self.retained[i] = *need;
                self.oversize[i] = 0;
            } else if *need == self.retained[i] {
                self.oversize[i] = 0;
            } else {
                self.oversize[i] += 1;
            }
        }

        let alloc_err =
            |_: TryReserveError| SglError::StageAlloc(need[ARR_STAGE]);
        self.pieces.clear();
        self.pieces
            .try_reserve(self.retained[ARR_PIECES])
            .map_err(alloc_err)?;
        self.segs.clear();
        self.segs.try_reserve(self.retained[ARR_SEGS]).map_err(alloc_err)?;
        self.stage.clear();
        self.stage
            .try_reserve_exact(self.retained[ARR_STAGE])
            .map_err(alloc_err)?;
        self.stage.resize(need[ARR_STAGE], 0);
        Ok(())
    }

    #[cfg(test)]
    fn retained(&self) -> [usize; 3] {
        self.retained
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::vmm::PhysMem;

    use zerocopy::byteorder::little_endian::U16;

    const FRAME: u64 = 0x1000;

    fn simple(len: u32) -> SgeFlagsLength {
        SgeFlagsLength(0).with_length(len).with_elem_type(SgeType::Simple)
    }

    fn put32(mem: &MemCtx, at: u64, flags: SgeFlagsLength, addr: u32) {
        let sge = bits::SgeSimple32 {
            flags_length: U32::new(flags.0),
            addr_low: U32::new(addr),
        };
        assert!(mem.write(GuestAddr(at), &sge));
    }

    fn put64(mem: &MemCtx, at: u64, flags: SgeFlagsLength, addr: u64) {
        let sge = bits::SgeSimple64 {
            flags_length: U32::new(flags.with_addr64(true).0),
            addr_low: U32::new(addr as u32),
            addr_high: U32::new((addr >> 32) as u32),
        };
        assert!(mem.write(GuestAddr(at), &sge));
    }

    fn put_chain(mem: &MemCtx, at: u64, next: u64, next_chain_offset: u8) {
        let chain = bits::SgeChain {
            length: U16::new(0),
            next_chain_offset,
            // Chain element type, 64-bit address
            flags: 0x32,
            addr_low: U32::new(next as u32),
            addr_high: U32::new((next >> 32) as u32),
        };
        assert!(mem.write(GuestAddr(at), &chain));
    }

    fn setup() -> (Arc<PhysMem>, Arc<MemCtx>) {
        let phys = PhysMem::new(0x40000);
        let mem = MemCtx::new(phys.clone());
        (phys, mem)
    }

    /// Two inline elements, then a chain to a segment with a 64-bit element.
    fn build_chained(mem: &MemCtx, contains_data: bool) -> SglCursor {
        let sgl = FRAME + 48;
        put32(
            mem,
            sgl,
            simple(512).with_contains_data(contains_data),
            0x10000,
        );
        put32(
            mem,
            sgl + 8,
            simple(100)
                .with_contains_data(contains_data)
                .with_last_element(true),
            0x20010,
        );
        put_chain(mem, sgl + 16, 0x3000, 0);
        put64(
            mem,
            0x3000,
            simple(1024)
                .with_contains_data(contains_data)
                .with_last_element(true)
                .with_end_of_buffer(true)
                .with_end_of_list(true),
            0x10200,
        );
        SglCursor::for_scsi_io(GuestAddr(FRAME), (48 + 16) / 4)
    }

    #[test]
    fn chained_unaligned_read() {
        let (phys, mem) = setup();
        let cursor = build_chained(&mem, false);

        let walked: Vec<_> =
            SglWalker::new(&mem, cursor).collect::<Result<_, _>>().unwrap();
        assert_eq!(walked.len(), 3);
        assert_eq!(walked[2].addr, GuestAddr(0x10200));

        let mut bufs = SglBuffers::default();
        let mut list = bufs.translate(&mem, cursor).unwrap();
        assert_eq!(
            list.segments(),
            &[
                Segment::Guest(GuestRegion(GuestAddr(0x10000), 512)),
                Segment::Staged(0..100),
                Segment::Guest(GuestRegion(GuestAddr(0x10200), 1024)),
            ]
        );
        assert_eq!(phys.locked_regions(), 2);

        let data: Vec<u8> = (0..1636).map(|i| (i % 251) as u8).collect();
        assert_eq!(list.write_from(&data), Some(1636));

        // Staged data only reaches the guest at teardown
        let mut staged = [0u8; 100];
        mem.read_into(GuestAddr(0x20010), &mut staged, 100).unwrap();
        assert_eq!(staged, [0u8; 100]);

        bufs.teardown(&mem, list).unwrap();
        assert_eq!(phys.locked_regions(), 0);
        mem.read_into(GuestAddr(0x20010), &mut staged, 100).unwrap();
        assert_eq!(&staged[..], &data[512..612]);

        let mut tail = vec![0u8; 1024];
        mem.read_into(GuestAddr(0x10200), &mut tail, 1024).unwrap();
        assert_eq!(&tail[..], &data[612..]);
    }

    #[test]
    fn chained_unaligned_write() {
        let (phys, mem) = setup();
        let cursor = build_chained(&mem, true);

        let data: Vec<u8> = (0..1636).map(|i| (i % 13) as u8).collect();
        mem.write_from(GuestAddr(0x10000), &data[..512], 512).unwrap();
        mem.write_from(GuestAddr(0x20010), &data[512..612], 100).unwrap();
        mem.write_from(GuestAddr(0x10200), &data[612..], 1024).unwrap();

        let mut bufs = SglBuffers::default();
        let list = bufs.translate(&mem, cursor).unwrap();

        // Staged contents are captured at translation time
        mem.write_from(GuestAddr(0x20010), &[0xff; 100], 100).unwrap();

        let mut out = vec![0u8; 1636];
        assert_eq!(list.read_into(&mut out), Some(1636));
        assert_eq!(out, data);

        bufs.teardown(&mem, list).unwrap();
        assert_eq!(phys.locked_regions(), 0);
        let mut staged = [0u8; 100];
        mem.read_into(GuestAddr(0x20010), &mut staged, 100).unwrap();
        assert_eq!(staged, [0xff; 100]);
    }

    #[test]
    fn contiguous_coalesced() {
        let (_phys, mem) = setup();
        let sgl = FRAME + 48;
        put32(&mem, sgl, simple(512), 0x8000);
        put32(&mem, sgl + 8, simple(1024), 0x8200);
        put32(
            &mem,
            sgl + 16,
            simple(512).with_last_element(true).with_end_of_list(true),
            0x9000,
        );

        let mut bufs = SglBuffers::default();
        let list =
            bufs.translate(&mem, SglCursor::for_scsi_io(GuestAddr(FRAME), 0))
                .unwrap();
        assert_eq!(
            list.segments(),
            &[
                Segment::Guest(GuestRegion(GuestAddr(0x8000), 1536)),
                Segment::Guest(GuestRegion(GuestAddr(0x9000), 512)),
            ]
        );
        bufs.teardown(&mem, list).unwrap();
    }

    #[test]
    fn zero_length_sentinel() {
        let (_phys, mem) = setup();
        put32(
            &mem,
            FRAME + 48,
            simple(0)
                .with_last_element(true)
                .with_end_of_buffer(true)
                .with_end_of_list(true),
            0,
        );
        let cursor = SglCursor::for_scsi_io(GuestAddr(FRAME), 0);
        assert_eq!(SglWalker::new(&mem, cursor).count(), 0);

        let mut bufs = SglBuffers::default();
        let list = bufs.translate(&mem, cursor).unwrap();
        assert!(list.is_empty());
        bufs.teardown(&mem, list).unwrap();
    }

    #[test]
    fn chain_cycle_rejected() {
        let (phys, mem) = setup();
        // One element per segment, chaining back to the same segment
        put32(&mem, 0x3000, simple(512).with_last_element(true), 0x8000);
        put_chain(&mem, 0x3008, 0x3000, 2);
        put32(&mem, FRAME + 48, simple(512).with_last_element(true), 0x8000);
        put_chain(&mem, FRAME + 56, 0x3000, 2);

        let cursor = SglCursor::for_scsi_io(GuestAddr(FRAME), 56 / 4);
        let res: Result<Vec<_>, _> = SglWalker::new(&mem, cursor).collect();
        assert_eq!(res.unwrap_err(), SglError::TooManyHops);

        let mut bufs = SglBuffers::default();
        assert_eq!(
            bufs.translate(&mem, cursor).unwrap_err(),
            SglError::TooManyHops
        );
        assert_eq!(phys.locked_regions(), 0);
    }

    #[test]
    fn malformed_elements() {
        let (phys, mem) = setup();
        let sgl = FRAME + 48;

        // Transaction element where a simple one is expected
        put32(&mem, sgl, SgeFlagsLength(0).with_length(512), 0x8000);
        let cursor = SglCursor::for_scsi_io(GuestAddr(FRAME), 0);
        let err = SglWalker::new(&mem, cursor).next().unwrap().unwrap_err();
        assert_eq!(err, SglError::NotSimple(SgeType::Transaction, sgl));
        assert!(err.is_malformed());

        // Simple element where the chain element should be
        put32(&mem, sgl, simple(512).with_last_element(true), 0x8000);
        put32(&mem, sgl + 8, simple(512), 0x9000);
        let cursor = SglCursor::for_scsi_io(GuestAddr(FRAME), 56 / 4);
        let mut bufs = SglBuffers::default();
        assert_eq!(
            bufs.translate(&mem, cursor).unwrap_err(),
            SglError::NotChain(sgl + 8)
        );
        assert_eq!(phys.locked_regions(), 0);

        // Element beyond guest memory
        put32(
            &mem,
            sgl,
            simple(512).with_last_element(true).with_end_of_list(true),
            0xfff0_0000,
        );
        let cursor = SglCursor::for_scsi_io(GuestAddr(FRAME), 0);
        let err = bufs.translate(&mem, cursor).unwrap_err();
        assert_eq!(err, SglError::GuestAccess(0xfff0_0000, 512));
        assert!(!err.is_malformed());
    }

    #[test]
    fn staging_bounded() {
        let (phys, mem) = setup();
        // Unaligned and far outside guest memory
        put32(
            &mem,
            FRAME + 48,
            simple(0xff_ffff).with_last_element(true).with_end_of_list(true),
            0xf000_0000,
        );
        let cursor = SglCursor::for_scsi_io(GuestAddr(FRAME), 0);

        let mut bufs = SglBuffers::default();
        let err = bufs.translate(&mem, cursor).unwrap_err();
        assert_eq!(err, SglError::StageLimit(0xff_ffff));
        assert!(!err.is_malformed());
        assert_eq!(bufs.retained(), [0, 0, 0]);
        assert_eq!(phys.locked_regions(), 0);

        // Many fragments, each acceptable alone
        let sgl = FRAME + 48;
        let count = SGL_MAX_STAGE_BYTES / 0x1_0000;
        for i in 0..=count as u64 {
            let mut flags = simple(0x1_0001);
            if i == count as u64 {
                flags = flags.with_last_element(true).with_end_of_list(true);
            }
            put32(&mem, sgl + i * 8, flags, 0x8000);
        }
        let err = bufs.translate(&mem, cursor).unwrap_err();
        assert!(
            matches!(err, SglError::StageLimit(n) if n > SGL_MAX_STAGE_BYTES)
        );
        assert_eq!(bufs.retained(), [0, 0, 0]);
    }

    #[test]
    fn shrink_after_oversized_run() {
        let (_phys, mem) = setup();
        let sgl = FRAME + 48;
        for i in 0..4u64 {
            let mut flags = simple(100);
            if i == 3 {
                flags = flags.with_last_element(true).with_end_of_list(true);
            }
            put32(&mem, sgl + i * 8, flags, 0x8000 + i as u32 * 0x1000);
        }
        let cursor = SglCursor::for_scsi_io(GuestAddr(FRAME), 0);

        let mut bufs = SglBuffers::default();
        let list = bufs.translate(&mem, cursor).unwrap();
        bufs.teardown(&mem, list).unwrap();
        assert_eq!(bufs.retained(), [4, 4, 400]);

        // Shrink the list to its first element
        put32(
            &mem,
            sgl,
            simple(100).with_last_element(true).with_end_of_list(true),
            0x8000,
        );
        for _ in 0..(SGL_NR_ALLOWED_BIGGER_LISTS - 1) {
            let list = bufs.translate(&mem, cursor).unwrap();
            bufs.teardown(&mem, list).unwrap();
            assert_eq!(bufs.retained(), [4, 4, 400]);
        }
        let list = bufs.translate(&mem, cursor).unwrap();
        bufs.teardown(&mem, list).unwrap();
        assert_eq!(bufs.retained(), [0, 0, 0]);

        // An exact fit resets the count
        let list = bufs.translate(&mem, cursor).unwrap();
        bufs.teardown(&mem, list).unwrap();
        assert_eq!(bufs.retained(), [1, 1, 100]);
    }
}
