//! The seams between the tracing engine and whatever controls the inferior.
//!
//! Everything here is implemented by the execution-control layer (or by the
//! in-process agent for its own address space). The engine never assumes it
//! can dereference a target address directly.

use crate::{
    error::{Result, TraceError},
    regcache::RegCache,
};
use libc::pid_t;

/// An address in the inferior's address space.
pub type CoreAddr = u64;

pub type ThreadId = pid_t;

/// Read/write access to some address space.
///
/// Multi-byte helpers are little-endian, matching the layout of everything
/// the engine stores.
pub trait TargetMemory {
    fn read_memory(&mut self, addr: CoreAddr, buf: &mut [u8]) -> Result<()>;

    fn write_memory(&mut self, addr: CoreAddr, data: &[u8]) -> Result<()>;

    /// Atomically replace the 32-bit word at `addr` with `new` if it equals
    /// `current`. Returns the value found at `addr`.
    ///
    /// The default is only atomic when nothing else can touch the memory
    /// concurrently, which is true for a stopped inferior.
    fn compare_exchange_u32(&mut self, addr: CoreAddr, current: u32, new: u32) -> Result<u32> {
        let found = self.read_u32(addr)?;
        if found == current {
            self.write_u32(addr, new)?;
        }
        Ok(found)
    }

    /// The 64-bit counterpart of `compare_exchange_u32`.
    fn compare_exchange_u64(&mut self, addr: CoreAddr, current: u64, new: u64) -> Result<u64> {
        let found = self.read_u64(addr)?;
        if found == current {
            self.write_u64(addr, new)?;
        }
        Ok(found)
    }

    fn read_u8(&mut self, addr: CoreAddr) -> Result<u8> {
        let mut buf = [0u8; 1];
        self.read_memory(addr, &mut buf)?;
        Ok(buf[0])
    }

    fn read_u16(&mut self, addr: CoreAddr) -> Result<u16> {
        let mut buf = [0u8; 2];
        self.read_memory(addr, &mut buf)?;
        Ok(u16::from_le_bytes(buf))
    }

    fn read_u32(&mut self, addr: CoreAddr) -> Result<u32> {
        let mut buf = [0u8; 4];
        self.read_memory(addr, &mut buf)?;
        Ok(u32::from_le_bytes(buf))
    }

    fn read_u64(&mut self, addr: CoreAddr) -> Result<u64> {
        let mut buf = [0u8; 8];
        self.read_memory(addr, &mut buf)?;
        Ok(u64::from_le_bytes(buf))
    }

    fn write_u8(&mut self, addr: CoreAddr, val: u8) -> Result<()> {
        self.write_memory(addr, &[val])
    }

    fn write_u32(&mut self, addr: CoreAddr, val: u32) -> Result<()> {
        self.write_memory(addr, &val.to_le_bytes())
    }

    fn write_u64(&mut self, addr: CoreAddr, val: u64) -> Result<()> {
        self.write_memory(addr, &val.to_le_bytes())
    }
}

/// A flat byte region starting at `base`. The monitor keeps its own trace
/// buffer in one of these.
#[derive(Clone, Debug)]
pub struct LocalMemory {
    base: CoreAddr,
    bytes: Vec<u8>,
}

impl LocalMemory {
    pub fn new(base: CoreAddr, size: usize) -> LocalMemory {
        LocalMemory {
            base,
            bytes: vec![0; size],
        }
    }

    pub fn base(&self) -> CoreAddr {
        self.base
    }

    pub fn end(&self) -> CoreAddr {
        self.base + self.bytes.len() as u64
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.bytes
    }

    fn range(&self, addr: CoreAddr, len: usize) -> Result<std::ops::Range<usize>> {
        let bad = || TraceError::MemoryAccess { addr, len };
        let offset = addr.checked_sub(self.base).ok_or_else(bad)? as usize;
        let end = offset.checked_add(len).ok_or_else(bad)?;
        if end > self.bytes.len() {
            return Err(bad());
        }
        Ok(offset..end)
    }
}

impl TargetMemory for LocalMemory {
    fn read_memory(&mut self, addr: CoreAddr, buf: &mut [u8]) -> Result<()> {
        let r = self.range(addr, buf.len())?;
        buf.copy_from_slice(&self.bytes[r]);
        Ok(())
    }

    fn write_memory(&mut self, addr: CoreAddr, data: &[u8]) -> Result<()> {
        let r = self.range(addr, data.len())?;
        self.bytes[r].copy_from_slice(data);
        Ok(())
    }
}

/// Opaque token for an inserted breakpoint or code patch.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug)]
pub struct BreakpointHandle(pub u64);

pub trait Breakpoints {
    fn insert_breakpoint(&mut self, addr: CoreAddr) -> Result<BreakpointHandle>;

    fn remove_breakpoint(&mut self, handle: BreakpointHandle) -> Result<()>;

    /// Forget pending (reported but not yet handled) hits of our breakpoints.
    fn cancel_breakpoint_hits(&mut self) {}
}

pub trait ThreadControl {
    /// Stop every thread. `freeze` also keeps them from being resumed by
    /// anything else until the matching `unpause_all`.
    fn pause_all(&mut self, freeze: bool);

    fn unpause_all(&mut self, unfreeze: bool);

    /// Move threads out of any jump pad they are executing in.
    fn stabilize_threads(&mut self) {}

    fn threads(&self) -> Vec<ThreadId>;

    fn fetch_registers(&mut self, tid: ThreadId, regs: &mut RegCache) -> Result<()>;

    fn store_registers(&mut self, tid: ThreadId, regs: &RegCache) -> Result<()>;
}

/// What the jump pad builder needs to know about a fast tracepoint.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct JumpPadRequest {
    /// The tracepoint's definition inside the agent.
    pub tpoint_obj: CoreAddr,
    pub address: CoreAddr,
    /// The agent's collection entry point.
    pub collector: CoreAddr,
    /// The agent's collection lock.
    pub lockaddr: CoreAddr,
    pub orig_size: u64,
    /// Where the pad may start.
    pub jump_entry: CoreAddr,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct JumpPad {
    /// First unused address after the pad.
    pub end: CoreAddr,
    /// The jump to patch over the tracepoint's instruction.
    pub jump_insn: Vec<u8>,
    pub adjusted_insn_addr: CoreAddr,
    pub adjusted_insn_addr_end: CoreAddr,
}

/// Code patching support for fast and static tracepoints.
pub trait TracepointPatcher {
    fn install_fast_tracepoint_jump_pad(&mut self, req: &JumpPadRequest) -> Result<JumpPad>;

    fn set_fast_tracepoint_jump(&mut self, addr: CoreAddr, insn: &[u8])
        -> Result<BreakpointHandle>;

    fn delete_fast_tracepoint_jump(&mut self, handle: BreakpointHandle) -> Result<()>;

    /// Arm the static marker at `addr`.
    fn probe_marker_at(&mut self, addr: CoreAddr) -> Result<()>;

    fn unprobe_marker_at(&mut self, addr: CoreAddr) -> Result<()>;
}

/// Everything a tracing session needs from the execution-control layer.
pub trait Inferior: TargetMemory + Breakpoints + ThreadControl + TracepointPatcher {}

impl<T: TargetMemory + Breakpoints + ThreadControl + TracepointPatcher> Inferior for T {}
