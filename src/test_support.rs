//! Fakes shared by the unit tests.

use crate::{
    error::{Result, TraceError},
    regcache::{RegCache, RegisterLayout},
    symbols::AgentSymbols,
    target::{
        BreakpointHandle, Breakpoints, CoreAddr, JumpPad, JumpPadRequest, LocalMemory,
        TargetMemory, ThreadControl, ThreadId, TracepointPatcher,
    },
    trace_buffer::{
        control::{SyncToken, TraceBufferControl},
        sync::{write_control_slot, write_token},
    },
};
use std::{
    cell::RefCell,
    collections::{BTreeMap, BTreeSet},
    io,
    rc::Rc,
    sync::Arc,
};

/// Memory that several owners (the monitor's view of the inferior and the
/// agent running inside it) can hold at once.
#[derive(Clone, Debug)]
pub struct SharedMemory(Rc<RefCell<LocalMemory>>);

impl SharedMemory {
    pub fn new(base: CoreAddr, size: usize) -> SharedMemory {
        SharedMemory(Rc::new(RefCell::new(LocalMemory::new(base, size))))
    }
}

impl TargetMemory for SharedMemory {
    fn read_memory(&mut self, addr: CoreAddr, buf: &mut [u8]) -> Result<()> {
        self.0.borrow_mut().read_memory(addr, buf)
    }

    fn write_memory(&mut self, addr: CoreAddr, data: &[u8]) -> Result<()> {
        self.0.borrow_mut().write_memory(addr, data)
    }
}

/// Program data lives here: 0x1000 bytes whose value is their offset.
pub const PROGRAM_BASE: CoreAddr = 0x1000;
pub const PROGRAM_SIZE: u64 = 0x1000;
pub const AGENT_BASE: CoreAddr = PROGRAM_BASE + PROGRAM_SIZE;
const HEAP_SIZE: u64 = 0x2000;
const JUMP_PAD_SIZE: u64 = 0x1000;

/// An address space with program data followed by a loaded agent.
#[derive(Clone, Debug)]
pub struct AgentImage {
    pub mem: SharedMemory,
    pub syms: AgentSymbols,
    pub heap: CoreAddr,
    pub jump_pad: CoreAddr,
    pub buffer_lo: CoreAddr,
    pub buffer_hi: CoreAddr,
}

impl AgentImage {
    pub fn new(buffer_size: u64) -> AgentImage {
        let (syms, syms_size) = AgentSymbols::packed(AGENT_BASE);
        let heap = AGENT_BASE + syms_size;
        let jump_pad = heap + HEAP_SIZE;
        let buffer_lo = jump_pad + JUMP_PAD_SIZE;
        let buffer_hi = buffer_lo + buffer_size;
        let mut mem = SharedMemory::new(PROGRAM_BASE, (buffer_hi - PROGRAM_BASE) as usize);

        let program: Vec<u8> = (0..PROGRAM_SIZE).map(|i| i as u8).collect();
        mem.write_memory(PROGRAM_BASE, &program).unwrap();
        mem.write_u64(syms.trace_buffer_lo, buffer_lo).unwrap();
        mem.write_u64(syms.trace_buffer_hi, buffer_hi).unwrap();
        mem.write_u64(syms.gdb_tp_heap_buffer, heap).unwrap();
        mem.write_u64(syms.gdb_jump_pad_buffer, jump_pad).unwrap();
        mem.write_u64(syms.gdb_jump_pad_buffer_end, buffer_lo).unwrap();
        write_control_slot(&mut mem, &syms, 0, &TraceBufferControl::cleared(buffer_lo, buffer_hi)).unwrap();
        write_token(&mut mem, &syms, SyncToken(0)).unwrap();

        AgentImage {
            mem,
            syms,
            heap,
            jump_pad,
            buffer_lo,
            buffer_hi,
        }
    }
}

pub fn amd64_regs(pc: CoreAddr) -> RegCache {
    let mut regs = RegCache::new(Arc::new(RegisterLayout::amd64()));
    regs.write_pc(pc);
    regs
}

/// Every collaborator trait over a `SharedMemory`, with knobs for making
/// things fail and counters for checking what was done.
#[derive(Debug)]
pub struct FakeInferior {
    pub mem: SharedMemory,
    pub breakpoints: BTreeMap<u64, CoreAddr>,
    pub jumps: BTreeMap<u64, (CoreAddr, Vec<u8>)>,
    pub markers: BTreeSet<CoreAddr>,
    pub regs: BTreeMap<ThreadId, RegCache>,
    next_handle: u64,
    pub fail_breakpoint_at: Option<CoreAddr>,
    pub fail_marker_at: Option<CoreAddr>,
    pub fail_jump_pad: bool,
    /// Nesting depth of `pause_all`.
    pub paused: i32,
    pub pause_calls: u32,
    pub cancel_calls: u32,
    pub removed: u32,
}

impl FakeInferior {
    pub fn new(mem: SharedMemory) -> FakeInferior {
        FakeInferior {
            mem,
            breakpoints: BTreeMap::new(),
            jumps: BTreeMap::new(),
            markers: BTreeSet::new(),
            regs: BTreeMap::new(),
            next_handle: 1,
            fail_breakpoint_at: None,
            fail_marker_at: None,
            fail_jump_pad: false,
            paused: 0,
            pause_calls: 0,
            cancel_calls: 0,
            removed: 0,
        }
    }

    pub fn add_thread(&mut self, tid: ThreadId, regs: RegCache) {
        self.regs.insert(tid, regs);
    }

    pub fn has_breakpoint_at(&self, addr: CoreAddr) -> bool {
        self.breakpoints.values().any(|a| *a == addr)
    }

    /// Anything still patched into the program.
    pub fn installed(&self) -> usize {
        self.breakpoints.len() + self.jumps.len() + self.markers.len()
    }

    fn handle(&mut self) -> BreakpointHandle {
        let h = self.next_handle;
        self.next_handle += 1;
        BreakpointHandle(h)
    }
}

impl TargetMemory for FakeInferior {
    fn read_memory(&mut self, addr: CoreAddr, buf: &mut [u8]) -> Result<()> {
        self.mem.read_memory(addr, buf)
    }

    fn write_memory(&mut self, addr: CoreAddr, data: &[u8]) -> Result<()> {
        self.mem.write_memory(addr, data)
    }
}

impl Breakpoints for FakeInferior {
    fn insert_breakpoint(&mut self, addr: CoreAddr) -> Result<BreakpointHandle> {
        if self.fail_breakpoint_at == Some(addr) {
            return Err(TraceError::MemoryAccess { addr, len: 1 });
        }
        let handle = self.handle();
        self.breakpoints.insert(handle.0, addr);
        Ok(handle)
    }

    fn remove_breakpoint(&mut self, handle: BreakpointHandle) -> Result<()> {
        match self.breakpoints.remove(&handle.0) {
            Some(_) => {
                self.removed += 1;
                Ok(())
            }
            None => panic!("breakpoint {:?} removed twice", handle),
        }
    }

    fn cancel_breakpoint_hits(&mut self) {
        self.cancel_calls += 1;
    }
}

impl ThreadControl for FakeInferior {
    fn pause_all(&mut self, _freeze: bool) {
        self.paused += 1;
        self.pause_calls += 1;
    }

    fn unpause_all(&mut self, _unfreeze: bool) {
        assert!(self.paused > 0, "unpause without pause");
        self.paused -= 1;
    }

    fn threads(&self) -> Vec<ThreadId> {
        self.regs.keys().copied().collect()
    }

    fn fetch_registers(&mut self, tid: ThreadId, regs: &mut RegCache) -> Result<()> {
        match self.regs.get(&tid) {
            Some(r) => {
                *regs = r.clone();
                Ok(())
            }
            None => Err(TraceError::Io(io::Error::new(
                io::ErrorKind::NotFound,
                format!("no thread {}", tid),
            ))),
        }
    }

    fn store_registers(&mut self, tid: ThreadId, regs: &RegCache) -> Result<()> {
        self.regs.insert(tid, regs.clone());
        Ok(())
    }
}

impl TracepointPatcher for FakeInferior {
    fn install_fast_tracepoint_jump_pad(&mut self, req: &JumpPadRequest) -> Result<JumpPad> {
        if self.fail_jump_pad {
            return Err(TraceError::Install {
                number: 0,
                address: req.address,
                reason: "no room for a jump pad".into(),
            });
        }
        let adjusted = req.jump_entry + 0x20;
        Ok(JumpPad {
            end: adjusted + req.orig_size + 5,
            jump_insn: vec![0xe9, 0, 0, 0, 0],
            adjusted_insn_addr: adjusted,
            adjusted_insn_addr_end: adjusted + req.orig_size,
        })
    }

    fn set_fast_tracepoint_jump(&mut self, addr: CoreAddr, insn: &[u8]) -> Result<BreakpointHandle> {
        let handle = self.handle();
        self.jumps.insert(handle.0, (addr, insn.to_vec()));
        Ok(handle)
    }

    fn delete_fast_tracepoint_jump(&mut self, handle: BreakpointHandle) -> Result<()> {
        match self.jumps.remove(&handle.0) {
            Some(_) => {
                self.removed += 1;
                Ok(())
            }
            None => panic!("jump {:?} removed twice", handle),
        }
    }

    fn probe_marker_at(&mut self, addr: CoreAddr) -> Result<()> {
        if self.fail_marker_at == Some(addr) {
            return Err(TraceError::Install {
                number: 0,
                address: addr,
                reason: "no marker here".into(),
            });
        }
        self.markers.insert(addr);
        Ok(())
    }

    fn unprobe_marker_at(&mut self, addr: CoreAddr) -> Result<()> {
        self.markers.remove(&addr);
        self.removed += 1;
        Ok(())
    }
}
