//! Trace frame and block encodings. These are bit-exact with what the
//! controller expects from a raw buffer dump.

use crate::{
    error::Result,
    log::LogDebug,
    target::{CoreAddr, TargetMemory},
};
use serde::Serialize;

/// `tpnum: u16` followed by `data_size: u32`, packed.
pub const TRACEFRAME_HEADER_SIZE: usize = 6;

/// Largest payload of a single `M` or `S` block.
pub const MAX_BLOCK_PAYLOAD: usize = u16::MAX as usize;

pub const MEMORY_BLOCK_HEADER_SIZE: usize = 1 + 8 + 2;
pub const TSV_BLOCK_SIZE: usize = 1 + 4 + 8;
pub const SDATA_BLOCK_HEADER_SIZE: usize = 1 + 2;

pub const BLOCK_REGISTERS: u8 = b'R';
pub const BLOCK_MEMORY: u8 = b'M';
pub const BLOCK_TSV: u8 = b'V';
pub const BLOCK_STATIC_DATA: u8 = b'S';

#[derive(Copy, Clone, Default, Eq, PartialEq, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TraceFrameHeader {
    /// 0 marks the end of the data in a buffer.
    pub tpnum: u16,
    pub data_size: u32,
}

impl TraceFrameHeader {
    pub const END: TraceFrameHeader = TraceFrameHeader {
        tpnum: 0,
        data_size: 0,
    };

    pub fn is_end(&self) -> bool {
        self.tpnum == 0
    }

    pub fn encode(&self) -> [u8; TRACEFRAME_HEADER_SIZE] {
        let mut buf = [0u8; TRACEFRAME_HEADER_SIZE];
        buf[0..2].copy_from_slice(&self.tpnum.to_le_bytes());
        buf[2..6].copy_from_slice(&self.data_size.to_le_bytes());
        buf
    }

    pub fn decode(buf: &[u8; TRACEFRAME_HEADER_SIZE]) -> TraceFrameHeader {
        TraceFrameHeader {
            tpnum: u16::from_le_bytes([buf[0], buf[1]]),
            data_size: u32::from_le_bytes([buf[2], buf[3], buf[4], buf[5]]),
        }
    }

    pub fn read<M: TargetMemory + ?Sized>(mem: &mut M, addr: CoreAddr) -> Result<TraceFrameHeader> {
        let mut buf = [0u8; TRACEFRAME_HEADER_SIZE];
        mem.read_memory(addr, &mut buf)?;
        Ok(TraceFrameHeader::decode(&buf))
    }
}

/// Offset of `data_size` inside a frame header.
pub const DATA_SIZE_OFFSET: u64 = 2;

pub fn memory_block_header(addr: CoreAddr, len: u16) -> [u8; MEMORY_BLOCK_HEADER_SIZE] {
    let mut buf = [0u8; MEMORY_BLOCK_HEADER_SIZE];
    buf[0] = BLOCK_MEMORY;
    buf[1..9].copy_from_slice(&addr.to_le_bytes());
    buf[9..11].copy_from_slice(&len.to_le_bytes());
    buf
}

pub fn tsv_block(num: u32, value: i64) -> [u8; TSV_BLOCK_SIZE] {
    let mut buf = [0u8; TSV_BLOCK_SIZE];
    buf[0] = BLOCK_TSV;
    buf[1..5].copy_from_slice(&num.to_le_bytes());
    buf[5..13].copy_from_slice(&value.to_le_bytes());
    buf
}

pub fn sdata_block_header(len: u16) -> [u8; SDATA_BLOCK_HEADER_SIZE] {
    let mut buf = [0u8; SDATA_BLOCK_HEADER_SIZE];
    buf[0] = BLOCK_STATIC_DATA;
    buf[1..3].copy_from_slice(&len.to_le_bytes());
    buf
}

/// One decoded block of a frame.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum TraceBlock<'a> {
    Registers(&'a [u8]),
    Memory { addr: CoreAddr, data: &'a [u8] },
    Variable { number: u32, value: i64 },
    StaticData(&'a [u8]),
}

impl<'a> TraceBlock<'a> {
    pub fn tag(&self) -> u8 {
        match self {
            TraceBlock::Registers(_) => BLOCK_REGISTERS,
            TraceBlock::Memory { .. } => BLOCK_MEMORY,
            TraceBlock::Variable { .. } => BLOCK_TSV,
            TraceBlock::StaticData(_) => BLOCK_STATIC_DATA,
        }
    }

    pub fn kind(&self) -> BlockKinds {
        match self {
            TraceBlock::Registers(_) => BlockKinds::REGISTERS,
            TraceBlock::Memory { .. } => BlockKinds::MEMORY,
            TraceBlock::Variable { .. } => BlockKinds::VARIABLES,
            TraceBlock::StaticData(_) => BlockKinds::STATIC_DATA,
        }
    }
}

bitflags! {
    /// A set of block kinds, written with the block tags: `"RM"` is
    /// registers and memory.
    pub struct BlockKinds: u8 {
        const REGISTERS = 0x1;
        const MEMORY = 0x2;
        const VARIABLES = 0x4;
        const STATIC_DATA = 0x8;
    }
}

impl BlockKinds {
    pub fn from_tags(tags: &str) -> Option<BlockKinds> {
        let mut kinds = BlockKinds::empty();
        for c in tags.bytes() {
            kinds |= match c {
                BLOCK_REGISTERS => BlockKinds::REGISTERS,
                BLOCK_MEMORY => BlockKinds::MEMORY,
                BLOCK_TSV => BlockKinds::VARIABLES,
                BLOCK_STATIC_DATA => BlockKinds::STATIC_DATA,
                _ => return None,
            };
        }
        Some(kinds)
    }
}

/// Linear scan over the blocks of one frame's data.
///
/// Stops at the end of the data, at an unknown tag, or at a block that claims
/// more bytes than remain.
pub struct BlockIter<'a> {
    data: &'a [u8],
    pos: usize,
    regblock_size: usize,
}

impl<'a> BlockIter<'a> {
    pub fn new(data: &'a [u8], regblock_size: usize) -> BlockIter<'a> {
        BlockIter {
            data,
            pos: 0,
            regblock_size,
        }
    }

    fn take(&mut self, n: usize) -> Option<&'a [u8]> {
        let bytes = self.data.get(self.pos..self.pos.checked_add(n)?)?;
        self.pos += n;
        Some(bytes)
    }

    fn take_u16(&mut self) -> Option<u16> {
        let b = self.take(2)?;
        Some(u16::from_le_bytes([b[0], b[1]]))
    }
}

impl<'a> Iterator for BlockIter<'a> {
    type Item = TraceBlock<'a>;

    fn next(&mut self) -> Option<TraceBlock<'a>> {
        let tag = *self.data.get(self.pos)?;
        self.pos += 1;
        let block = match tag {
            BLOCK_REGISTERS => TraceBlock::Registers(self.take(self.regblock_size)?),
            BLOCK_MEMORY => {
                let mut addr = [0u8; 8];
                addr.copy_from_slice(self.take(8)?);
                let len = self.take_u16()?;
                TraceBlock::Memory {
                    addr: u64::from_le_bytes(addr),
                    data: self.take(len as usize)?,
                }
            }
            BLOCK_TSV => {
                let mut num = [0u8; 4];
                num.copy_from_slice(self.take(4)?);
                let mut value = [0u8; 8];
                value.copy_from_slice(self.take(8)?);
                TraceBlock::Variable {
                    number: u32::from_le_bytes(num),
                    value: i64::from_le_bytes(value),
                }
            }
            BLOCK_STATIC_DATA => {
                let len = self.take_u16()?;
                TraceBlock::StaticData(self.take(len as usize)?)
            }
            _ => {
                log!(
                    LogDebug,
                    "unknown block type {:#x} at offset {}, stopping scan",
                    tag,
                    self.pos - 1
                );
                self.pos = self.data.len();
                return None;
            }
        };
        Some(block)
    }
}

/// Bytes of `[addr, addr + len)` if a single `M` block of the frame holds all of them.
pub fn frame_read_memory(data: &[u8], regblock_size: usize, addr: CoreAddr, len: usize) -> Option<Vec<u8>> {
    for block in BlockIter::new(data, regblock_size) {
        if let TraceBlock::Memory {
            addr: maddr,
            data: mdata,
        } = block
        {
            let mend = maddr + mdata.len() as u64;
            if maddr <= addr && addr + len as u64 <= mend {
                let off = (addr - maddr) as usize;
                return Some(mdata[off..off + len].to_vec());
            }
        }
    }
    None
}

pub fn frame_find_registers(data: &[u8], regblock_size: usize) -> Option<&[u8]> {
    BlockIter::new(data, regblock_size).find_map(|b| match b {
        TraceBlock::Registers(regs) => Some(regs),
        _ => None,
    })
}

pub fn frame_read_tsv(data: &[u8], regblock_size: usize, num: u32) -> Option<i64> {
    BlockIter::new(data, regblock_size).find_map(|b| match b {
        TraceBlock::Variable { number, value } if number == num => Some(value),
        _ => None,
    })
}

pub fn frame_static_data(data: &[u8], regblock_size: usize) -> Option<&[u8]> {
    BlockIter::new(data, regblock_size).find_map(|b| match b {
        TraceBlock::StaticData(sdata) => Some(sdata),
        _ => None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_frame() -> Vec<u8> {
        let mut data = Vec::new();
        data.push(BLOCK_REGISTERS);
        data.extend_from_slice(&[0xaa; 4]);
        data.extend_from_slice(&memory_block_header(0x1000, 8));
        data.extend_from_slice(&[1, 2, 3, 4, 5, 6, 7, 8]);
        data.extend_from_slice(&tsv_block(3, -5));
        data.extend_from_slice(&sdata_block_header(2));
        data.extend_from_slice(b"hi");
        data
    }

    #[test]
    fn header_encode_test() {
        let h = TraceFrameHeader {
            tpnum: 0x0102,
            data_size: 0x0a0b0c0d,
        };
        assert_eq!(h.encode(), [0x02, 0x01, 0x0d, 0x0c, 0x0b, 0x0a]);
        assert_eq!(TraceFrameHeader::decode(&h.encode()), h);
        assert!(TraceFrameHeader::END.is_end());
    }

    #[test]
    fn walk_blocks_test() {
        let data = sample_frame();
        let tags: Vec<u8> = BlockIter::new(&data, 4).map(|b| b.tag()).collect();
        assert_eq!(tags, b"RMVS".to_vec());
        assert_eq!(frame_find_registers(&data, 4), Some(&[0xaa; 4][..]));
        assert_eq!(frame_read_tsv(&data, 4, 3), Some(-5));
        assert_eq!(frame_read_tsv(&data, 4, 4), None);
        assert_eq!(frame_static_data(&data, 4), Some(&b"hi"[..]));
    }

    #[test]
    fn block_kinds_test() {
        let kinds = BlockKinds::from_tags("RV").unwrap();
        let data = sample_frame();
        let shown: Vec<u8> = BlockIter::new(&data, 4)
            .filter(|b| kinds.contains(b.kind()))
            .map(|b| b.tag())
            .collect();
        assert_eq!(shown, b"RV".to_vec());
        assert_eq!(BlockKinds::from_tags("RMVS"), Some(BlockKinds::all()));
        assert_eq!(BlockKinds::from_tags(""), Some(BlockKinds::empty()));
        assert_eq!(BlockKinds::from_tags("RX"), None);
    }

    #[test]
    fn read_memory_sub_ranges_test() {
        let data = sample_frame();
        for start in 0..8u64 {
            for len in 1..=(8 - start as usize) {
                let got = frame_read_memory(&data, 4, 0x1000 + start, len).unwrap();
                let expected: Vec<u8> = (start as u8 + 1..start as u8 + 1 + len as u8).collect();
                assert_eq!(got, expected);
            }
        }
        // Straddles the end of the block.
        assert_eq!(frame_read_memory(&data, 4, 0x1006, 4), None);
        assert_eq!(frame_read_memory(&data, 4, 0xfff, 1), None);
    }

    #[test]
    fn truncated_and_unknown_blocks_test() {
        let mut data = sample_frame();
        data.truncate(10);
        assert_eq!(BlockIter::new(&data, 4).count(), 1);
        let data = vec![b'Q', 1, 2, 3];
        assert_eq!(BlockIter::new(&data, 4).count(), 0);
    }
}
