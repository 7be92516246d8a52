use crate::{
    error::{Result, TraceError},
    target::CoreAddr,
};
use std::sync::Arc;

/// How the registers of a target architecture are laid out in a raw
/// register block. The `R` block of a trace frame is exactly this layout.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct RegisterLayout {
    name: &'static str,
    sizes: Vec<usize>,
    offsets: Vec<usize>,
    size_: usize,
    pc_regnum: usize,
}

const AMD64_GPR_NAMES: [&str; 16] = [
    "rax", "rbx", "rcx", "rdx", "rsi", "rdi", "rbp", "rsp", "r8", "r9", "r10", "r11", "r12", "r13",
    "r14", "r15",
];

impl RegisterLayout {
    pub fn new(name: &'static str, sizes: Vec<usize>, pc_regnum: usize) -> RegisterLayout {
        let mut offsets = Vec::with_capacity(sizes.len());
        let mut offset = 0;
        for size in &sizes {
            offsets.push(offset);
            offset += size;
        }
        debug_assert!(pc_regnum < sizes.len());
        RegisterLayout {
            name,
            sizes,
            offsets,
            size_: offset,
            pc_regnum,
        }
    }

    /// The general purpose registers, rip, eflags and the six segment registers.
    pub fn amd64() -> RegisterLayout {
        let mut sizes = vec![8; AMD64_GPR_NAMES.len()];
        // rip
        sizes.push(8);
        // eflags
        sizes.push(4);
        // cs ss ds es fs gs
        sizes.extend_from_slice(&[4; 6]);
        RegisterLayout::new("amd64", sizes, 16)
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Size of a whole register block.
    pub fn size(&self) -> usize {
        self.size_
    }

    pub fn num_registers(&self) -> usize {
        self.sizes.len()
    }

    pub fn register_size(&self, regnum: usize) -> Option<usize> {
        self.sizes.get(regnum).copied()
    }

    pub fn register_offset(&self, regnum: usize) -> Option<usize> {
        self.offsets.get(regnum).copied()
    }

    pub fn pc_regnum(&self) -> usize {
        self.pc_regnum
    }
}

/// A register file in raw layout form.
#[derive(Clone, Debug)]
pub struct RegCache {
    layout: Arc<RegisterLayout>,
    raw: Vec<u8>,
    /// False when the registers are not known, e.g. a trace frame without an `R` block.
    available: bool,
}

impl RegCache {
    pub fn new(layout: Arc<RegisterLayout>) -> RegCache {
        let raw = vec![0; layout.size()];
        RegCache {
            layout,
            raw,
            available: true,
        }
    }

    pub fn from_raw(layout: Arc<RegisterLayout>, raw: &[u8]) -> Result<RegCache> {
        if raw.len() < layout.size() {
            return Err(TraceError::MemoryAccess {
                addr: 0,
                len: layout.size(),
            });
        }
        let mut regs = RegCache::new(layout);
        let n = regs.raw.len();
        regs.raw.copy_from_slice(&raw[..n]);
        Ok(regs)
    }

    pub fn unavailable(layout: Arc<RegisterLayout>) -> RegCache {
        let mut regs = RegCache::new(layout);
        regs.available = false;
        regs
    }

    pub fn layout(&self) -> &Arc<RegisterLayout> {
        &self.layout
    }

    pub fn raw(&self) -> &[u8] {
        &self.raw
    }

    pub fn raw_mut(&mut self) -> &mut [u8] {
        &mut self.raw
    }

    pub fn is_available(&self) -> bool {
        self.available
    }

    pub fn register_bytes(&self, regnum: usize) -> Option<&[u8]> {
        let offset = self.layout.register_offset(regnum)?;
        let size = self.layout.register_size(regnum)?;
        Some(&self.raw[offset..offset + size])
    }

    /// Zero extended value of register `regnum`.
    pub fn collect_register(&self, regnum: usize) -> Option<u64> {
        let bytes = self.register_bytes(regnum)?;
        if bytes.len() > 8 {
            return None;
        }
        let mut buf = [0u8; 8];
        buf[..bytes.len()].copy_from_slice(bytes);
        Some(u64::from_le_bytes(buf))
    }

    /// Store the low bytes of `val` into register `regnum`.
    pub fn supply_register(&mut self, regnum: usize, val: u64) -> bool {
        let (offset, size) = match (
            self.layout.register_offset(regnum),
            self.layout.register_size(regnum),
        ) {
            (Some(offset), Some(size)) if size <= 8 => (offset, size),
            _ => return false,
        };
        self.raw[offset..offset + size].copy_from_slice(&val.to_le_bytes()[..size]);
        true
    }

    pub fn read_pc(&self) -> CoreAddr {
        self.collect_register(self.layout.pc_regnum()).unwrap_or(0)
    }

    pub fn write_pc(&mut self, pc: CoreAddr) {
        let regnum = self.layout.pc_regnum();
        self.supply_register(regnum, pc);
    }
}
