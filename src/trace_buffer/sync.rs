//! How a trace buffer publishes changes to its control block.
//!
//! The monitor owns its buffer outright, so `LocalSync` keeps the control
//! in ordinary memory. The agent shares its buffer with the monitor, which
//! may stop it at any instruction and rewrite the buffer state from outside,
//! so `AgentSync` goes through the three slot token protocol: copy the
//! current slot, modify the copy, compare-and-swap the token, then check
//! that the monitor did not overrule the commit.

use super::control::{
    SyncToken, TraceBufferControl, CONTROL_SLOTS, TRACE_BUFFER_CONTROL_SIZE,
};
use crate::{
    error::Result,
    log::LogDebug,
    symbols::AgentSymbols,
    target::{CoreAddr, TargetMemory},
};
use serde::Serialize;
use std::sync::atomic::{fence, Ordering};

#[derive(Copy, Clone, Default, Eq, PartialEq, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FrameCounters {
    pub write_count: u32,
    pub read_count: u32,
    /// Never decremented, not even when frames are discarded or uploaded.
    pub created: u32,
}

impl FrameCounters {
    /// Complete frames currently in the buffer.
    pub fn live(&self) -> u32 {
        self.write_count.wrapping_sub(self.read_count)
    }
}

/// One attempt at changing the control block. The caller edits `ctrl`
/// and hands the attempt back to `commit_update`.
#[derive(Copy, Clone, Debug)]
pub struct SyncAttempt {
    pub ctrl: TraceBufferControl,
    token: SyncToken,
    slot: usize,
}

pub trait BufferSync<M: TargetMemory + ?Sized> {
    fn begin_update(&mut self, mem: &mut M) -> Result<SyncAttempt>;

    /// Publish `attempt.ctrl`. `false` means another writer got in first and
    /// the whole update must be redone from `begin_update`.
    fn commit_update(&mut self, mem: &mut M, attempt: &SyncAttempt) -> Result<bool>;

    /// Nothing fits. Returns true if space may have been made and the
    /// allocation should start over.
    fn out_of_space(&mut self, mem: &mut M, attempt: &SyncAttempt) -> Result<bool>;

    /// Whether a full buffer may drop its oldest frames. Only the owner of a
    /// buffer can do that, and only when configured as circular.
    fn may_discard(&self) -> bool;

    fn current_control(&mut self, mem: &mut M) -> Result<TraceBufferControl>;

    fn reset_control(&mut self, mem: &mut M, ctrl: TraceBufferControl) -> Result<()>;

    fn counters(&mut self, mem: &mut M) -> Result<FrameCounters>;

    fn set_counters(&mut self, mem: &mut M, counters: FrameCounters) -> Result<()>;
}

/// Single writer: the control block and counters are plain fields.
#[derive(Clone, Debug)]
pub struct LocalSync {
    ctrl: TraceBufferControl,
    counters: FrameCounters,
    circular: bool,
}

impl LocalSync {
    pub fn new(lo: CoreAddr, hi: CoreAddr, circular: bool) -> LocalSync {
        LocalSync {
            ctrl: TraceBufferControl::cleared(lo, hi),
            counters: FrameCounters::default(),
            circular,
        }
    }

    pub fn set_circular(&mut self, circular: bool) {
        self.circular = circular;
    }

    pub fn circular(&self) -> bool {
        self.circular
    }
}

impl<M: TargetMemory + ?Sized> BufferSync<M> for LocalSync {
    fn begin_update(&mut self, _mem: &mut M) -> Result<SyncAttempt> {
        Ok(SyncAttempt {
            ctrl: self.ctrl,
            token: SyncToken::default(),
            slot: 0,
        })
    }

    fn commit_update(&mut self, _mem: &mut M, attempt: &SyncAttempt) -> Result<bool> {
        self.ctrl = attempt.ctrl;
        Ok(true)
    }

    fn out_of_space(&mut self, _mem: &mut M, _attempt: &SyncAttempt) -> Result<bool> {
        Ok(false)
    }

    fn may_discard(&self) -> bool {
        self.circular
    }

    fn current_control(&mut self, _mem: &mut M) -> Result<TraceBufferControl> {
        Ok(self.ctrl)
    }

    fn reset_control(&mut self, _mem: &mut M, ctrl: TraceBufferControl) -> Result<()> {
        self.ctrl = ctrl;
        Ok(())
    }

    fn counters(&mut self, _mem: &mut M) -> Result<FrameCounters> {
        Ok(self.counters)
    }

    fn set_counters(&mut self, _mem: &mut M, counters: FrameCounters) -> Result<()> {
        self.counters = counters;
        Ok(())
    }
}

/// The agent's calls into the functions the monitor plants breakpoints on.
///
/// In a real inferior these are empty functions and the "call" is the
/// monitor stopping the thread on them. The hooks get the agent's memory
/// so whatever stands in for the monitor can act on it before returning.
pub trait Rendezvous<M: TargetMemory + ?Sized> {
    fn about_to_request_buffer_space(&mut self, _mem: &mut M) {}

    fn flush_trace_buffer(&mut self, _mem: &mut M) {}

    fn stop_tracing(&mut self, _mem: &mut M) {}
}

/// Nobody is listening.
#[derive(Copy, Clone, Default, Debug)]
pub struct NoRendezvous;

impl<M: TargetMemory + ?Sized> Rendezvous<M> for NoRendezvous {}

pub fn control_slot_addr(syms: &AgentSymbols, slot: usize) -> CoreAddr {
    syms.trace_buffer_ctrl + (slot * TRACE_BUFFER_CONTROL_SIZE) as u64
}

pub fn read_control_slot<M: TargetMemory + ?Sized>(
    mem: &mut M,
    syms: &AgentSymbols,
    slot: usize,
) -> Result<TraceBufferControl> {
    let mut buf = [0u8; TRACE_BUFFER_CONTROL_SIZE];
    mem.read_memory(control_slot_addr(syms, slot), &mut buf)?;
    Ok(TraceBufferControl::decode(&buf))
}

pub fn write_control_slot<M: TargetMemory + ?Sized>(
    mem: &mut M,
    syms: &AgentSymbols,
    slot: usize,
    ctrl: &TraceBufferControl,
) -> Result<()> {
    mem.write_memory(control_slot_addr(syms, slot), &ctrl.encode())
}

pub fn read_token<M: TargetMemory + ?Sized>(mem: &mut M, syms: &AgentSymbols) -> Result<SyncToken> {
    Ok(SyncToken(mem.read_u32(syms.trace_buffer_ctrl_curr)?))
}

pub fn write_token<M: TargetMemory + ?Sized>(
    mem: &mut M,
    syms: &AgentSymbols,
    token: SyncToken,
) -> Result<()> {
    mem.write_u32(syms.trace_buffer_ctrl_curr, token.0)
}

pub fn read_counters<M: TargetMemory + ?Sized>(
    mem: &mut M,
    syms: &AgentSymbols,
) -> Result<FrameCounters> {
    Ok(FrameCounters {
        write_count: mem.read_u32(syms.traceframe_write_count)?,
        read_count: mem.read_u32(syms.traceframe_read_count)?,
        created: mem.read_u32(syms.traceframes_created)?,
    })
}

/// The agent side of the token protocol. Every access goes through the
/// agent's exported variables.
pub struct AgentSync<M: TargetMemory + ?Sized> {
    syms: AgentSymbols,
    rendezvous: Box<dyn Rendezvous<M>>,
}

impl<M: TargetMemory + ?Sized> AgentSync<M> {
    pub fn new(syms: AgentSymbols, rendezvous: Box<dyn Rendezvous<M>>) -> AgentSync<M> {
        AgentSync { syms, rendezvous }
    }

    pub fn symbols(&self) -> &AgentSymbols {
        &self.syms
    }

    pub fn rendezvous(&mut self) -> &mut dyn Rendezvous<M> {
        &mut *self.rendezvous
    }
}

impl<M: TargetMemory + ?Sized> BufferSync<M> for AgentSync<M> {
    fn begin_update(&mut self, mem: &mut M) -> Result<SyncAttempt> {
        fence(Ordering::SeqCst);
        let token = read_token(mem, &self.syms)?;
        let prev = token.slot() % CONTROL_SLOTS;
        let slot = (prev + 1) % CONTROL_SLOTS;
        self.rendezvous.about_to_request_buffer_space(mem);
        // The monitor may be rewriting `prev` right now. If so the token
        // has changed too and this attempt cannot commit.
        let ctrl = read_control_slot(mem, &self.syms, prev)?;
        log!(LogDebug, "trying slot {} (token {:#010x})", slot, token.0);
        Ok(SyncAttempt { ctrl, token, slot })
    }

    fn commit_update(&mut self, mem: &mut M, attempt: &SyncAttempt) -> Result<bool> {
        write_control_slot(mem, &self.syms, attempt.slot, &attempt.ctrl)?;
        let commit = attempt.token.agent_commit(attempt.slot);
        let readout =
            mem.compare_exchange_u32(self.syms.trace_buffer_ctrl_curr, attempt.token.0, commit.0)?;
        if readout != attempt.token.0 {
            log!(
                LogDebug,
                "monitor touched the trace buffer, restarting (prev={:#010x}, commit={:#010x}, readout={:#010x})",
                attempt.token.0,
                commit.0,
                readout
            );
            return Ok(false);
        }

        // The monitor may stop us here and take the buffer over. Whether
        // our commit survived shows in the token it leaves behind.
        self.rendezvous.about_to_request_buffer_space(mem);
        fence(Ordering::SeqCst);
        let refetch = read_token(mem, &self.syms)?;
        if refetch.confirms(commit) {
            Ok(true)
        } else {
            log!(
                LogDebug,
                "commit not effective (commit={:#010x}, refetch={:#010x})",
                commit.0,
                refetch.0
            );
            Ok(false)
        }
    }

    fn out_of_space(&mut self, mem: &mut M, attempt: &SyncAttempt) -> Result<bool> {
        self.rendezvous.flush_trace_buffer(mem);
        fence(Ordering::SeqCst);
        if mem.read_u32(self.syms.tracing)? == 0 {
            log!(LogDebug, "tracing stopped while waiting for a flush");
            return Ok(false);
        }
        // Only worth retrying if the monitor actually took frames out.
        let token = read_token(mem, &self.syms)?;
        Ok(token != attempt.token)
    }

    fn may_discard(&self) -> bool {
        false
    }

    fn current_control(&mut self, mem: &mut M) -> Result<TraceBufferControl> {
        let token = read_token(mem, &self.syms)?;
        read_control_slot(mem, &self.syms, token.slot() % CONTROL_SLOTS)
    }

    /// Only valid while nothing else runs in the agent.
    fn reset_control(&mut self, mem: &mut M, ctrl: TraceBufferControl) -> Result<()> {
        write_control_slot(mem, &self.syms, 0, &ctrl)?;
        write_token(mem, &self.syms, SyncToken(0))
    }

    fn counters(&mut self, mem: &mut M) -> Result<FrameCounters> {
        read_counters(mem, &self.syms)
    }

    fn set_counters(&mut self, mem: &mut M, counters: FrameCounters) -> Result<()> {
        mem.write_u32(self.syms.traceframe_write_count, counters.write_count)?;
        mem.write_u32(self.syms.traceframe_read_count, counters.read_count)?;
        mem.write_u32(self.syms.traceframes_created, counters.created)
    }
}
