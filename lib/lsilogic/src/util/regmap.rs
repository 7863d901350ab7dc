// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use std::cmp::Ordering;

use crate::common::*;

#[derive(Debug)]
struct RegDef<ID> {
    start: usize,
    len: usize,
    id: ID,
    flags: Flags,
}

/// Represents a mapping of registers within an address space.
///
/// Registers are kept sorted by start offset and may not overlap.
#[derive(Debug)]
pub struct RegMap<ID> {
    len: usize,
    regs: Vec<RegDef<ID>>,
}

bitflags! {
    #[derive(Default, Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Flags: u8 {
        const DEFAULT = 0;
        const NO_READ_EXTEND = 0b00000001;
        const NO_WRITE_EXTEND = 0b00000010;
        const NO_READ_MOD_WRITE = 0b00000100;
        const PASSTHRU = Self::NO_READ_EXTEND.bits() |
            Self::NO_WRITE_EXTEND.bits();
    }
}

struct RegXfer<'a, ID> {
    reg: &'a RegDef<ID>,
    offset: usize,
    skip_front_idx: usize,
    split_back_idx: usize,
}

impl<ID> RegMap<ID> {
    pub fn new(len: usize) -> Self {
        Self { len, regs: Vec::new() }
    }

    pub fn len(&self) -> usize {
        self.len
    }
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn define(&mut self, start: usize, len: usize, id: ID) {
        self.define_with_flags(start, len, id, Flags::DEFAULT)
    }

    pub fn define_with_flags(
        &mut self,
        start: usize,
        len: usize,
        id: ID,
        flags: Flags,
    ) {
        assert!(len != 0);
        assert!(start + len <= self.len, "register beyond end of map");

        let idx = self.regs.partition_point(|r| r.start < start);
        if let Some(next) = self.regs.get(idx) {
            assert!(start + len <= next.start, "overlapping register");
        }
        if idx > 0 {
            let prev = &self.regs[idx - 1];
            assert!(prev.start + prev.len <= start, "overlapping register");
        }
        self.regs.insert(idx, RegDef { start, len, id, flags });
    }

    pub fn process<F>(&self, op: &mut RWOp<'_, '_>, mut f: F)
    where
        F: FnMut(&ID, RWOp),
    {
        match op {
            RWOp::Read(ro) => {
                self.read(ro, &mut f);
            }
            RWOp::Write(wo) => {
                self.write(wo, &mut f);
            }
        }
    }
    pub fn read<F>(&self, ro: &mut ReadOp, f: &mut F)
    where
        F: FnMut(&ID, RWOp),
    {
        assert!(ro.len() != 0);
        assert!(ro.offset() + ro.len() - 1 < self.len);

        self.iterate_transfers(ro.offset(), ro.len(), |xfer: &RegXfer<ID>| {
            let mut copy_op = ReadOp::new_child(
                xfer.offset,
                ro,
                xfer.skip_front_idx..xfer.split_back_idx,
            );

            debug_assert!(copy_op.len() != 0);
            Self::reg_read(xfer.reg, &mut copy_op, f);
        })
    }

    pub fn write<F>(&self, wo: &mut WriteOp, f: &mut F)
    where
        F: FnMut(&ID, RWOp),
    {
        assert!(wo.len() != 0);
        assert!(wo.offset() + wo.len() - 1 < self.len);

        self.iterate_transfers(wo.offset(), wo.len(), |xfer| {
            let mut copy_op = WriteOp::new_child(
                xfer.offset,
                wo,
                xfer.skip_front_idx..xfer.split_back_idx,
            );

            debug_assert!(copy_op.len() != 0);
            Self::reg_write(xfer.reg, &mut copy_op, f);
        })
    }

    fn reg_read<F>(reg: &RegDef<ID>, copy_op: &mut ReadOp, f: &mut F)
    where
        F: FnMut(&ID, RWOp),
    {
        if reg.flags.contains(Flags::NO_READ_EXTEND) && reg.len != copy_op.len()
        {
            f(&reg.id, RWOp::Read(copy_op));
        } else if reg.len == copy_op.len() {
            debug_assert!(copy_op.offset() == 0);
            f(&reg.id, RWOp::Read(copy_op));
        } else {
            let mut scratch = vec![0; reg.len];
            let mut sro = ReadOp::from_buf(0, &mut scratch);

            f(&reg.id, RWOp::Read(&mut sro));
            drop(sro);
            copy_op.write_bytes(
                &scratch[copy_op.offset()..(copy_op.offset() + copy_op.len())],
            );
        }
    }

    fn reg_write<F>(reg: &RegDef<ID>, copy_op: &mut WriteOp, f: &mut F)
    where
        F: FnMut(&ID, RWOp),
    {
        if reg.flags.contains(Flags::NO_WRITE_EXTEND)
            && reg.len != copy_op.len()
        {
            f(&reg.id, RWOp::Write(copy_op));
        } else if reg.len == copy_op.len() {
            debug_assert!(copy_op.offset() == 0);
            f(&reg.id, RWOp::Write(copy_op));
        } else {
            let mut scratch = vec![0; reg.len];

            if !reg.flags.contains(Flags::NO_READ_MOD_WRITE) {
                let mut sro = ReadOp::from_buf(0, &mut scratch);
                f(&reg.id, RWOp::Read(&mut sro));
            }
            copy_op.read_bytes(
                &mut scratch
                    [copy_op.offset()..(copy_op.offset() + copy_op.len())],
            );

            f(&reg.id, RWOp::Write(&mut WriteOp::from_buf(0, &scratch)));
        }
    }

    fn iterate_transfers<F>(&self, offset: usize, len: usize, mut do_xfer: F)
    where
        F: FnMut(&RegXfer<'_, ID>),
    {
        let last_position = offset + len - 1;
        let mut position = offset;

        assert!(len != 0);
        assert!(last_position < self.len);

        let first = self.regs.partition_point(|r| r.start + r.len <= offset);
        let covered = self.regs[first..]
            .iter()
            .take_while(|r| r.start <= last_position);

        for reg in covered {
            let (reg_start, reg_len) = (reg.start, reg.len);
            let mut skip_front = 0;
            let mut split_back = 0;
            let mut reg_offset = 0;

            let consumed = position - offset;
            let remain = len - consumed;

            match position.cmp(&reg_start) {
                Ordering::Equal => {
                    if remain > reg_len {
                        split_back = remain - reg_len;
                    }
                }
                Ordering::Less => {
                    debug_assert!(position + remain > reg_start);
                    skip_front = reg_start - position;
                    if remain - skip_front > reg_len {
                        split_back = remain - (skip_front + reg_len);
                    }
                }
                Ordering::Greater => {
                    reg_offset = position - reg_start;
                    if reg_offset + remain > reg_len {
                        split_back = reg_offset + remain - reg_len;
                    }
                }
            };
            let xfer_len = remain - (skip_front + split_back);
            debug_assert!(xfer_len <= reg_len);

            do_xfer(&RegXfer {
                reg,
                offset: reg_offset,
                skip_front_idx: consumed + skip_front,
                split_back_idx: consumed + skip_front + xfer_len,
            });

            position = reg_start + reg_offset + xfer_len;
        }
    }
}
impl<ID: Copy + Eq> RegMap<ID> {
    /// Build a map from registers laid out back-to-back starting at offset 0.
    ///
    /// Every register is defined with `flags`, except for those matching
    /// `resv_reg`, which are passed through without extension.
    pub fn create_packed(
        size: usize,
        regdef: &[(ID, usize)],
        resv_reg: Option<ID>,
        flags: Flags,
    ) -> Self {
        let mut map = RegMap::new(size);
        let mut off = 0;
        for &(id, reg_size) in regdef {
            let reg_flags = match resv_reg.as_ref() {
                Some(resv) if *resv == id => Flags::PASSTHRU,
                _ => flags,
            };
            map.define_with_flags(off, reg_size, id, reg_flags);
            off += reg_size;
        }
        assert_eq!(size, off);

        map
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[derive(Clone, Copy, Eq, PartialEq, Debug)]
    enum XferDir {
        Read,
        Write,
    }
    #[derive(Clone, Copy, Eq, PartialEq, Debug)]
    struct Xfer<ID: Copy + Eq> {
        dir: XferDir,
        reg: ID,
        off: usize,
        len: usize,
    }
    impl<ID: Copy + Eq> Xfer<ID> {
        fn from_rwo(id: &ID, rwo: RWOp) -> Self {
            let dir = match rwo {
                RWOp::Read(_) => XferDir::Read,
                RWOp::Write(_) => XferDir::Write,
            };
            Xfer { dir, reg: *id, off: rwo.offset(), len: rwo.len() }
        }
        fn read(id: ID, off: usize, len: usize) -> Self {
            Xfer { dir: XferDir::Read, reg: id, off, len }
        }
        fn write(id: ID, off: usize, len: usize) -> Self {
            Xfer { dir: XferDir::Write, reg: id, off, len }
        }
    }

    fn drive_reads<ID: Copy + Eq>(
        xfers: &[(usize, usize)],
        map: &RegMap<ID>,
    ) -> Vec<Xfer<ID>> {
        let mut res = Vec::new();

        for &(off, len) in xfers {
            let mut buf = vec![0; len];
            let mut ro = ReadOp::from_buf(off, &mut buf);
            map.process(&mut RWOp::Read(&mut ro), |id, rwo| {
                res.push(Xfer::from_rwo(id, rwo))
            });
        }
        res
    }

    #[test]
    fn simple() {
        let map = RegMap::create_packed(
            0x10,
            &[('a', 1), ('b', 1), ('c', 2), ('d', 4), ('e', 8)],
            None,
            Flags::DEFAULT,
        );
        let expected = vec![
            Xfer::read('a', 0, 1),
            Xfer::read('b', 0, 1),
            Xfer::read('c', 0, 2),
            Xfer::read('d', 0, 4),
            Xfer::read('e', 0, 8),
        ];
        // Each field individually
        let reads = [(0, 1), (1, 1), (2, 2), (4, 4), (8, 8)];
        let res = drive_reads(&reads, &map);
        assert_eq!(res, expected);
        // One big op, covering all
        let reads = [(0, 0x10)];
        let res = drive_reads(&reads, &map);
        assert_eq!(res, expected);
    }

    #[test]
    fn narrow_read_extends() {
        let map = RegMap::create_packed(
            8,
            &[('a', 4), ('b', 4)],
            None,
            Flags::NO_WRITE_EXTEND,
        );
        let mut buf = [0u8; 1];
        let mut ro = ReadOp::from_buf(5, &mut buf);
        map.process(&mut RWOp::Read(&mut ro), |id, rwo| {
            assert_eq!(*id, 'b');
            match rwo {
                RWOp::Read(ro) => {
                    assert_eq!(ro.len(), 4);
                    ro.write_u32(0x44332211);
                }
                RWOp::Write(_) => panic!("unexpected write"),
            }
        });
        assert_eq!(buf, [0x22]);
    }

    #[test]
    fn narrow_write_passes_through() {
        let map = RegMap::create_packed(
            8,
            &[('a', 4), ('r', 4)],
            Some('r'),
            Flags::NO_WRITE_EXTEND,
        );
        let mut res = Vec::new();
        let buf = [0xffu8; 2];
        let mut wo = WriteOp::from_buf(2, &buf);
        map.process(&mut RWOp::Write(&mut wo), |id, rwo| {
            res.push(Xfer::from_rwo(id, rwo))
        });
        let mut wo = WriteOp::from_buf(4, &buf);
        map.process(&mut RWOp::Write(&mut wo), |id, rwo| {
            res.push(Xfer::from_rwo(id, rwo))
        });
        assert_eq!(res, vec![Xfer::write('a', 2, 2), Xfer::write('r', 0, 2)]);
    }

    #[test]
    fn sparse() {
        let mut map = RegMap::new(0x20);
        map.define(0x10, 4, 'x');
        map.define(0x00, 4, 'w');
        let res = drive_reads(&[(0x00, 4), (0x10, 4), (0x08, 4)], &map);
        assert_eq!(res, vec![Xfer::read('w', 0, 4), Xfer::read('x', 0, 4)]);
    }

    #[test]
    #[should_panic]
    fn overlap_rejected() {
        let mut map = RegMap::new(0x10);
        map.define(0x0, 8, 'a');
        map.define(0x4, 4, 'b');
    }
}
