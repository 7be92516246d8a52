//! One tracing run's worth of state on the monitor side, and the operations
//! the command layer drives it with.

use crate::{
    agent_expr::EvalError,
    amd64_emit::Amd64EmitOps,
    ax_compile::{compile_tracepoint_condition, CompileHelpers, EmitOps},
    collect::{Collector, MemorySource, StopState},
    download::{download_definitions, TargetHeap},
    error::{Result, TraceError},
    flags::Flags,
    log::{LogDebug, LogWarn},
    regcache::{RegCache, RegisterLayout},
    symbols::{AgentSymbols, SymbolLookup},
    target::{BreakpointHandle, CoreAddr, Inferior, JumpPadRequest, TargetMemory, ThreadId},
    trace_buffer::{
        frame::{frame_find_registers, frame_read_memory, frame_read_tsv, frame_static_data},
        FrameRef, MonitorBuffer, RawChunk,
    },
    tracepoint::{
        parse_actions, Action, InstallHandle, Tracepoint, TracepointDef, TracepointId,
        TracepointKind, TracepointRegistry,
    },
    tsv::TsvRegistry,
    upload::{clear_agent_trace_buffer, upload_fast_traceframes},
    wstep::WhileStepping,
};
use serde::Serialize;
use std::{
    collections::VecDeque,
    fmt::{self, Display, Formatter},
    sync::Arc,
};

/// Why the last run ended.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum StopReason {
    NotRun,
    PassCount,
    BufferFull,
    EvalError(EvalError),
    Stop,
    Disconnected,
}

impl StopReason {
    /// As sent to the controller: an error message is hex encoded.
    pub fn wire(&self) -> String {
        match self {
            StopReason::EvalError(e) => format!("terror:{}", hex_encode(e.message().as_bytes())),
            other => other.to_string(),
        }
    }
}

impl Display for StopReason {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            StopReason::NotRun => write!(f, "tnotrun"),
            StopReason::PassCount => write!(f, "tpasscount"),
            StopReason::BufferFull => write!(f, "tfull"),
            StopReason::EvalError(e) => write!(f, "terror:{}", e),
            StopReason::Stop => write!(f, "tstop"),
            StopReason::Disconnected => write!(f, "tdisconnected"),
        }
    }
}

fn hex_encode(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}

#[derive(Clone, Debug, Eq, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TraceStatus {
    pub running: bool,
    pub stop_reason: String,
    #[serde(skip)]
    pub stop_reason_wire: String,
    /// The tracepoint the stop reason is about, or 0.
    pub stop_tracepoint: u32,
    pub frames: u32,
    pub created: u32,
    pub free: u64,
    pub size: u64,
    pub circular: bool,
    pub disconnected: bool,
}

/// The status reply, e.g. `T0;tstop:0;tframes:3;tcreated:3;tfree:ff0;tsize:1000;circular:0;disconn:0`.
impl Display for TraceStatus {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "T{};{}:{:x};tframes:{:x};tcreated:{:x};tfree:{:x};tsize:{:x};circular:{};disconn:{}",
            self.running as u8,
            self.stop_reason_wire,
            self.stop_tracepoint,
            self.frames,
            self.created,
            self.free,
            self.size,
            self.circular as u8,
            self.disconnected as u8
        )
    }
}

/// Memory that cannot change during the run, so it is read from the
/// program even while looking at a frame. Both ends are inclusive.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub struct ReadonlyRegion {
    pub start: CoreAddr,
    pub end: CoreAddr,
}

impl ReadonlyRegion {
    pub fn contains(&self, addr: CoreAddr, len: u64) -> bool {
        self.start <= addr && addr + len.max(1) - 1 <= self.end
    }
}

/// How to pick the frame to look at. Searches start after the current
/// frame and do not wrap around.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum FrameSelector {
    Index(usize),
    Pc(CoreAddr),
    Range { lo: CoreAddr, hi: CoreAddr },
    Outside { lo: CoreAddr, hi: CoreAddr },
    Tracepoint(u32),
    /// Go back to the live program.
    None,
}

#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub struct SelectedFrame {
    pub index: usize,
    pub tpnum: u16,
}

/// What the monitor knows about the loaded in-process agent.
struct AgentState {
    syms: AgentSymbols,
    emit: Box<dyn EmitOps>,
    heap: Option<TargetHeap>,
    /// Next free byte of the jump pad area, 0 until read from the agent.
    jump_head: CoreAddr,
    jump_end: CoreAddr,
    stop_tracing_bkpt: Option<BreakpointHandle>,
    flush_bkpt: Option<BreakpointHandle>,
}

impl AgentState {
    fn jump_space<M: TargetMemory + ?Sized>(&mut self, mem: &mut M) -> Result<CoreAddr> {
        if self.jump_head == 0 {
            self.jump_head = mem.read_u64(self.syms.gdb_jump_pad_buffer)?;
            self.jump_end = mem.read_u64(self.syms.gdb_jump_pad_buffer_end)?;
            log!(
                LogDebug,
                "jump pad area is [{:#x}, {:#x})",
                self.jump_head,
                self.jump_end
            );
        }
        Ok(self.jump_head)
    }

    /// Take the jump space up to `end`, padded to 8 bytes.
    fn claim_jump_space(&mut self, end: CoreAddr, tp: &Tracepoint) -> Result<()> {
        let end = (end + 7) & !7;
        if end > self.jump_end {
            return Err(TraceError::Install {
                number: tp.number,
                address: tp.address,
                reason: "jump pad area exhausted".into(),
            });
        }
        log!(
            LogDebug,
            "claim_jump_space reserves {} bytes at {:#x}",
            end - self.jump_head,
            self.jump_head
        );
        self.jump_head = end;
        Ok(())
    }

    fn remove_breakpoints<T: Inferior>(&mut self, inferior: &mut T) {
        for h in self.stop_tracing_bkpt.take().into_iter().chain(self.flush_bkpt.take()) {
            if let Err(e) = inferior.remove_breakpoint(h) {
                log!(LogWarn, "Removing agent breakpoint failed: {}", e);
            }
        }
    }

    fn helpers(&self) -> CompileHelpers {
        CompileHelpers {
            get_raw_reg: self.syms.get_raw_reg,
            get_tsv: self.syms.get_trace_state_variable_value,
            set_tsv: self.syms.set_trace_state_variable_value,
        }
    }
}

fn install_failed(tp: &Tracepoint, e: TraceError) -> TraceError {
    let reason = match e {
        TraceError::Install { reason, .. } => reason,
        other => other.to_string(),
    };
    TraceError::Install {
        number: tp.number,
        address: tp.address,
        reason,
    }
}

/// Compile agent tracepoint conditions into the jump pad area, then hand
/// the agent its definitions.
fn prepare_agent<T: Inferior>(
    inferior: &mut T,
    agent: &mut AgentState,
    tracepoints: &mut TracepointRegistry,
    tsvs: &TsvRegistry,
    align: u64,
) -> Result<()> {
    let helpers = agent.helpers();
    for tp in tracepoints.iter_mut().filter(|tp| tp.kind.needs_agent()) {
        tp.compiled_cond = None;
        if let Some(cond) = &tp.cond {
            let at = (agent.jump_space(inferior)? + 7) & !7;
            let mut jump_entry = at;
            let entry = compile_tracepoint_condition(&mut *agent.emit, tp.number, cond, &helpers, &mut jump_entry);
            let code = agent.emit.take_code();
            inferior
                .write_memory(at, &code)
                .map_err(|e| install_failed(tp, e))?;
            agent.claim_jump_space(jump_entry, tp)?;
            tp.compiled_cond = entry;
        }
    }

    if agent.heap.is_none() {
        agent.heap = Some(TargetHeap::from_agent(inferior, &agent.syms, align)?);
    }
    if let Some(heap) = agent.heap.as_mut() {
        download_definitions(inferior, &agent.syms, heap, tracepoints.iter_mut(), tsvs)?;
    }
    Ok(())
}

/// Patch every enabled tracepoint into the program. Stops at the first
/// failure, leaving what was installed so far for the caller to remove.
fn install_tracepoints<T: Inferior>(
    inferior: &mut T,
    mut agent: Option<&mut AgentState>,
    tracepoints: &mut TracepointRegistry,
) -> Result<()> {
    // Tracepoints are sorted, so sharing a location means following each other.
    let mut prev_fast: Option<TracepointId> = None;
    let mut prev_static: Option<CoreAddr> = None;

    for id in tracepoints.ids().collect::<Vec<_>>() {
        let prev = prev_fast.map(|p| tracepoints.get(p).clone());
        let tp = tracepoints.get_mut(id);
        tp.hit_count = 0;
        if !tp.enabled {
            continue;
        }
        match tp.kind {
            TracepointKind::Trap => {
                let handle = inferior
                    .insert_breakpoint(tp.address)
                    .map_err(|e| install_failed(tp, e))?;
                tp.handle = Some(InstallHandle::Breakpoint(handle));
            }
            TracepointKind::Fast => {
                let agent = match agent.as_deref_mut() {
                    Some(agent) => agent,
                    None => {
                        log!(LogDebug, "Requested a fast tracepoint, but fast tracepoints aren't supported.");
                        return Err(TraceError::AgentNotLoaded);
                    }
                };
                match prev.filter(|p| p.address == tp.address) {
                    Some(prev) => {
                        let insn = prev.jump_insn.clone();
                        let handle = inferior
                            .set_fast_tracepoint_jump(tp.address, &insn)
                            .map_err(|e| install_failed(tp, e))?;
                        tp.handle = Some(InstallHandle::FastJump(handle));
                        tp.jump_insn = insn;
                        tp.jump_pad = prev.jump_pad;
                        tp.jump_pad_end = prev.jump_pad_end;
                        tp.adjusted_insn_addr = prev.adjusted_insn_addr;
                        tp.adjusted_insn_addr_end = prev.adjusted_insn_addr_end;
                    }
                    None => {
                        let jump_entry = agent.jump_space(inferior)?;
                        let req = JumpPadRequest {
                            tpoint_obj: tp.obj_addr_on_target,
                            address: tp.address,
                            collector: agent.syms.gdb_collect,
                            lockaddr: agent.syms.collecting,
                            orig_size: tp.orig_size,
                            jump_entry,
                        };
                        let pad = inferior
                            .install_fast_tracepoint_jump_pad(&req)
                            .map_err(|e| install_failed(tp, e))?;
                        let handle = inferior
                            .set_fast_tracepoint_jump(tp.address, &pad.jump_insn)
                            .map_err(|e| install_failed(tp, e))?;
                        tp.handle = Some(InstallHandle::FastJump(handle));
                        tp.jump_insn = pad.jump_insn;
                        tp.jump_pad = jump_entry;
                        tp.jump_pad_end = pad.end;
                        tp.adjusted_insn_addr = pad.adjusted_insn_addr;
                        tp.adjusted_insn_addr_end = pad.adjusted_insn_addr_end;
                        agent.claim_jump_space(pad.end, tp)?;
                    }
                }
                prev_fast = Some(id);
            }
            TracepointKind::Static => {
                if agent.is_none() {
                    log!(LogDebug, "Requested a static tracepoint, but static tracepoints are not supported.");
                    return Err(TraceError::AgentNotLoaded);
                }
                // A marker can only be probed once.
                if prev_static != Some(tp.address) {
                    inferior
                        .probe_marker_at(tp.address)
                        .map_err(|e| install_failed(tp, e))?;
                    prev_static = Some(tp.address);
                }
                tp.handle = Some(InstallHandle::StaticMarker);
            }
        }
    }
    Ok(())
}

/// Undo `install_tracepoints`. Tracepoints that never got installed are
/// skipped; removal failures are logged and do not stop the others.
fn clear_installed_tracepoints<T: Inferior>(inferior: &mut T, tracepoints: &mut TracepointRegistry) {
    inferior.pause_all(true);
    inferior.cancel_breakpoint_hits();

    let mut prev_static: Option<CoreAddr> = None;
    for tp in tracepoints.iter_mut() {
        let handle = match tp.handle.take() {
            Some(handle) => handle,
            None => {
                log!(
                    LogDebug,
                    "Tracepoint {} at {:#x} was never installed, nothing to clear",
                    tp.number,
                    tp.address
                );
                continue;
            }
        };
        let result = match handle {
            InstallHandle::Breakpoint(h) => inferior.remove_breakpoint(h),
            InstallHandle::FastJump(h) => inferior.delete_fast_tracepoint_jump(h),
            InstallHandle::StaticMarker if prev_static == Some(tp.address) => Ok(()),
            InstallHandle::StaticMarker => {
                prev_static = Some(tp.address);
                inferior.unprobe_marker_at(tp.address)
            }
        };
        if let Err(e) = result {
            log!(
                LogWarn,
                "Removing tracepoint {} at {:#x} failed: {}",
                tp.number,
                tp.address,
                e
            );
        }
    }

    inferior.unpause_all(true);
}

pub struct TracingSession<T: Inferior> {
    inferior: T,
    flags: Flags,
    layout: Arc<RegisterLayout>,
    buffer: MonitorBuffer,
    tracepoints: TracepointRegistry,
    tsvs: TsvRegistry,
    wstep: WhileStepping,
    agent: Option<AgentState>,
    state: StopState,
    stop_reason: StopReason,
    stop_tpnum: u32,
    readonly_regions: Vec<ReadonlyRegion>,
    disconnected_tracing: bool,
    connected: bool,
    current_frame: Option<usize>,
}

impl<T: Inferior> TracingSession<T> {
    /// `layout` describes the register blocks of this inferior's frames.
    pub fn new(inferior: T, flags: Flags, layout: Arc<RegisterLayout>) -> TracingSession<T> {
        let buffer = MonitorBuffer::monitor(flags.trace_buffer_size, flags.circular_trace_buffer);
        TracingSession {
            inferior,
            flags,
            layout,
            buffer,
            tracepoints: TracepointRegistry::new(),
            tsvs: TsvRegistry::with_builtins(),
            wstep: WhileStepping::new(),
            agent: None,
            state: StopState::default(),
            stop_reason: StopReason::NotRun,
            stop_tpnum: 0,
            readonly_regions: Vec::new(),
            disconnected_tracing: false,
            connected: true,
            current_frame: None,
        }
    }

    pub fn inferior(&self) -> &T {
        &self.inferior
    }

    pub fn inferior_mut(&mut self) -> &mut T {
        &mut self.inferior
    }

    pub fn tracepoints(&self) -> &TracepointRegistry {
        &self.tracepoints
    }

    pub fn tsvs(&self) -> &TsvRegistry {
        &self.tsvs
    }

    pub fn buffer_mut(&mut self) -> &mut MonitorBuffer {
        &mut self.buffer
    }

    pub fn is_tracing(&self) -> bool {
        self.state.tracing
    }

    pub fn stop_reason(&self) -> StopReason {
        self.stop_reason
    }

    pub fn current_frame(&self) -> Option<usize> {
        self.current_frame
    }

    pub fn is_stepping(&self, tid: ThreadId) -> bool {
        self.wstep.is_stepping(tid)
    }

    /// The in-process agent has been found at `syms`.
    pub fn attach_agent(&mut self, syms: AgentSymbols) {
        log!(LogDebug, "in-process agent attached, gdb_collect at {:#x}", syms.gdb_collect);
        self.agent = Some(AgentState {
            syms,
            emit: Box::new(Amd64EmitOps::new()),
            heap: None,
            jump_head: 0,
            jump_end: 0,
            stop_tracing_bkpt: None,
            flush_bkpt: None,
        });
    }

    pub fn attach_agent_from(&mut self, lookup: &dyn SymbolLookup) -> Result<()> {
        let syms = AgentSymbols::look_up(lookup)?;
        self.attach_agent(syms);
        Ok(())
    }

    pub fn agent_loaded(&self) -> bool {
        self.agent.is_some()
    }

    /// Forget every definition and all collected data.
    pub fn init(&mut self) -> Result<()> {
        log!(LogDebug, "Initializing the trace");
        if self.state.tracing {
            self.stop()?;
        }
        self.current_frame = None;
        clear_installed_tracepoints(&mut self.inferior, &mut self.tracepoints);
        self.readonly_regions.clear();
        self.tracepoints.clear();
        self.tsvs.clear_user_variables();
        self.wstep.clear();
        self.buffer.clear()?;
        if let Some(agent) = &self.agent {
            clear_agent_trace_buffer(&mut self.inferior, &agent.syms)?;
        }
        Ok(())
    }

    /// Define a tracepoint, replacing (actions included) any existing one
    /// with the same number and address.
    pub fn define_tracepoint(&mut self, def: TracepointDef) -> Result<TracepointId> {
        match self.tracepoints.find(def.number, def.address) {
            Some(id) => {
                log!(LogDebug, "Redefining tracepoint {} at {:#x}", def.number, def.address);
                let tp = self.tracepoints.get_mut(id);
                if tp.handle.is_some() {
                    log!(LogWarn, "Tracepoint {} is installed; the change applies to the next run", def.number);
                }
                let handle = tp.handle;
                *tp = Tracepoint::from_def(def);
                tp.handle = handle;
                Ok(id)
            }
            None => self.tracepoints.add(def),
        }
    }

    /// Add actions in packet form (see `parse_actions`) to a tracepoint.
    pub fn add_tracepoint_actions(&mut self, number: u32, address: CoreAddr, packet: &str) -> Result<()> {
        let (stepping, actions) = parse_actions(packet)?;
        for action in actions {
            self.add_tracepoint_action(number, address, action, stepping)?;
        }
        Ok(())
    }

    pub fn add_tracepoint_action(
        &mut self,
        number: u32,
        address: CoreAddr,
        action: Action,
        stepping: bool,
    ) -> Result<()> {
        let id = self
            .tracepoints
            .find(number, address)
            .ok_or(TraceError::NoSuchTracepoint { number, address })?;
        self.tracepoints.add_action(id, action, stepping);
        Ok(())
    }

    pub fn define_tsv(&mut self, number: u32, initial_value: i64, name: Option<String>) {
        self.tsvs.define(number, initial_value, name);
    }

    pub fn set_readonly_regions(&mut self, regions: Vec<ReadonlyRegion>) {
        log!(LogDebug, "{} read-only regions", regions.len());
        self.readonly_regions = regions;
    }

    pub fn set_circular_buffer(&mut self, circular: bool) {
        log!(LogDebug, "Trace buffer is now {}", if circular { "circular" } else { "linear" });
        self.buffer.set_circular(circular);
    }

    /// Whether the run survives the controller going away.
    pub fn set_disconnected_tracing(&mut self, keep_going: bool) {
        self.disconnected_tracing = keep_going;
    }

    pub fn controller_connected(&mut self) {
        self.connected = true;
    }

    pub fn controller_disconnected(&mut self) -> Result<()> {
        self.connected = false;
        if self.state.tracing && !self.disconnected_tracing {
            self.stop()?;
        }
        Ok(())
    }

    /// Install every enabled tracepoint and start collecting. Either all
    /// of them go in or none stays.
    pub fn start(&mut self) -> Result<()> {
        log!(LogDebug, "Starting the trace");
        if self.state.tracing {
            self.stop()?;
        }

        self.tracepoints.sort_by_address();
        self.current_frame = None;
        self.buffer.clear()?;
        self.tsvs.reset_values();
        self.wstep.clear();
        self.state = StopState::default();

        self.inferior.pause_all(false);
        self.inferior.stabilize_threads();
        self.inferior.pause_all(true);

        let result = self.start_paused();
        if result.is_err() {
            clear_installed_tracepoints(&mut self.inferior, &mut self.tracepoints);
            if let Some(agent) = self.agent.as_mut() {
                agent.remove_breakpoints(&mut self.inferior);
            }
        }

        self.inferior.unpause_all(true);
        self.inferior.unpause_all(false);
        result
    }

    fn start_paused(&mut self) -> Result<()> {
        if let Some(agent) = self.agent.as_mut() {
            clear_agent_trace_buffer(&mut self.inferior, &agent.syms)?;
            prepare_agent(
                &mut self.inferior,
                agent,
                &mut self.tracepoints,
                &self.tsvs,
                self.flags.agent_heap_align,
            )?;
        }

        install_tracepoints(&mut self.inferior, self.agent.as_mut(), &mut self.tracepoints)?;

        if let Some(agent) = self.agent.as_mut() {
            let syms = agent.syms;
            let mem = &mut self.inferior;
            mem.write_u64(syms.stopping_tracepoint, 0)?;
            mem.write_u32(syms.trace_buffer_is_full, 0)?;
            mem.write_u32(syms.expr_eval_result, 0)?;
            mem.write_u64(syms.error_tracepoint, 0)?;
            mem.write_u32(syms.tracing, 1)?;
            agent.stop_tracing_bkpt = Some(self.inferior.insert_breakpoint(syms.stop_tracing)?);
            agent.flush_bkpt = Some(self.inferior.insert_breakpoint(syms.flush_trace_buffer)?);
        }

        self.state = StopState::running();
        log!(LogDebug, "Tracing started with {} tracepoints", self.tracepoints.len());
        Ok(())
    }

    /// End the run, recording why. Does nothing when not tracing.
    pub fn stop(&mut self) -> Result<()> {
        if !self.state.tracing {
            log!(LogDebug, "Tracing is already off, ignoring");
            return Ok(());
        }
        log!(LogDebug, "Stopping the trace");

        self.inferior.pause_all(true);
        self.inferior.cancel_breakpoint_hits();

        self.state.tracing = false;
        self.record_stop_reason();
        self.state.clear_conditions();

        clear_installed_tracepoints(&mut self.inferior, &mut self.tracepoints);
        self.wstep.clear();

        let mut result = Ok(());
        if let Some(agent) = self.agent.as_mut() {
            let syms = agent.syms;
            result = self.inferior.write_u32(syms.tracing, 0);
            // Take what the agent collected even when it does not all fit:
            // the created count still tells the controller about it.
            match upload_fast_traceframes(&mut self.inferior, &syms, &mut self.buffer) {
                Ok(outcome) => log!(LogDebug, "{} frames uploaded at stop", outcome.uploaded),
                Err(e) => {
                    if result.is_ok() {
                        result = Err(e);
                    }
                }
            }
            agent.remove_breakpoints(&mut self.inferior);
        }

        self.inferior.unpause_all(true);
        result
    }

    fn record_stop_reason(&mut self) {
        let number = |id: Option<TracepointId>, tps: &TracepointRegistry| id.map_or(0, |id| tps.get(id).number);
        let (reason, tpnum) = if self.state.stopping_tracepoint.is_some() {
            (StopReason::PassCount, number(self.state.stopping_tracepoint, &self.tracepoints))
        } else if self.state.buffer_full {
            (StopReason::BufferFull, 0)
        } else if let Some(err) = self.state.eval_error {
            (StopReason::EvalError(err), number(self.state.error_tracepoint, &self.tracepoints))
        } else if !self.connected {
            (StopReason::Disconnected, 0)
        } else {
            (StopReason::Stop, 0)
        };
        log!(LogDebug, "Stopping the trace: {} (tracepoint {})", reason, tpnum);
        self.stop_reason = reason;
        self.stop_tpnum = tpnum;
    }

    /// Pull the agent's frames into our buffer. A frame that does not fit
    /// ends the run.
    fn upload_agent_frames(&mut self) -> Result<()> {
        let syms = match &self.agent {
            Some(agent) => agent.syms,
            None => return Ok(()),
        };
        let outcome = upload_fast_traceframes(&mut self.inferior, &syms, &mut self.buffer)?;
        if outcome.buffer_full && self.state.tracing {
            self.state.buffer_full = true;
            self.stop()?;
        }
        Ok(())
    }

    pub fn status(&mut self) -> Result<TraceStatus> {
        if self.agent.is_some() {
            self.inferior.pause_all(true);
            let uploaded = self.upload_agent_frames();
            self.inferior.unpause_all(true);
            uploaded?;
        }
        log!(
            LogDebug,
            "Returning trace status as {}, stop reason {}",
            self.state.tracing as u8,
            self.stop_reason
        );
        let counters = self.buffer.counters()?;
        Ok(TraceStatus {
            running: self.state.tracing,
            stop_reason: self.stop_reason.to_string(),
            stop_reason_wire: self.stop_reason.wire(),
            stop_tracepoint: self.stop_tpnum,
            frames: counters.live(),
            created: counters.created,
            free: self.buffer.free_space()?,
            size: self.buffer.size(),
            circular: self.buffer.circular(),
            disconnected: self.disconnected_tracing,
        })
    }

    fn frame_data(&mut self, index: usize) -> Result<Option<(FrameRef, Vec<u8>)>> {
        match self.buffer.find_traceframe(index)? {
            Some(frame) => {
                let data = self.buffer.read_frame_data(&frame)?;
                Ok(Some((frame, data)))
            }
            None => {
                log!(LogDebug, "traceframe {} not found", index);
                Ok(None)
            }
        }
    }

    /// Where frame `index` was collected: the PC of its register block, or
    /// the address of the first tracepoint with its number.
    pub fn traceframe_pc(&mut self, index: usize) -> Result<Option<CoreAddr>> {
        let (frame, data) = match self.frame_data(index)? {
            Some(found) => found,
            None => return Ok(None),
        };
        Ok(Some(self.frame_address(&frame, &data)?))
    }

    fn frame_address(&self, frame: &FrameRef, data: &[u8]) -> Result<CoreAddr> {
        if let Some(raw) = frame_find_registers(data, self.layout.size()) {
            let pc = RegCache::from_raw(self.layout.clone(), raw)?.read_pc();
            if pc != 0 {
                return Ok(pc);
            }
        }
        // Wrong for while-stepping frames and tracepoints with several
        // locations, but the best there is.
        Ok(self
            .tracepoints
            .find_next_by_number(None, frame.header.tpnum)
            .map_or(0, |id| self.tracepoints.get(id).address))
    }

    /// Make a frame current. None when no frame matches, in which case
    /// the current frame does not change.
    pub fn select_traceframe(&mut self, selector: FrameSelector) -> Result<Option<SelectedFrame>> {
        log!(LogDebug, "Want to look at {:?}", selector);
        let found = match selector {
            FrameSelector::None => {
                self.current_frame = None;
                return Ok(None);
            }
            FrameSelector::Index(index) => self.buffer.find_traceframe(index)?,
            FrameSelector::Pc(pc) => self.find_in_range(pc, pc, true)?,
            FrameSelector::Range { lo, hi } => self.find_in_range(lo, hi, true)?,
            FrameSelector::Outside { lo, hi } => self.find_in_range(lo, hi, false)?,
            FrameSelector::Tracepoint(number) => {
                let from = self.next_search_index();
                self.buffer
                    .frames()?
                    .into_iter()
                    .skip(from)
                    .find(|f| f.header.tpnum as u32 == number)
            }
        };
        Ok(found.map(|frame| {
            self.current_frame = Some(frame.index);
            SelectedFrame {
                index: frame.index,
                tpnum: frame.header.tpnum,
            }
        }))
    }

    fn next_search_index(&self) -> usize {
        self.current_frame.map_or(0, |i| i + 1)
    }

    fn find_in_range(&mut self, lo: CoreAddr, hi: CoreAddr, inside: bool) -> Result<Option<FrameRef>> {
        let from = self.next_search_index();
        for frame in self.buffer.frames()?.into_iter().skip(from) {
            let data = self.buffer.read_frame_data(&frame)?;
            let addr = self.frame_address(&frame, &data)?;
            if (lo <= addr && addr <= hi) == inside {
                return Ok(Some(frame));
            }
        }
        Ok(None)
    }

    /// Up to `len` bytes (capped to the configured chunk size) of raw trace
    /// data starting `offset` bytes into it.
    pub fn read_trace_buffer(&mut self, offset: u64, len: usize) -> Result<RawChunk> {
        self.buffer.read_raw(offset, len.min(self.flags.max_buffer_chunk))
    }

    /// Fill `buf` from the current frame, or from the program when no frame
    /// is selected or the range is read-only.
    pub fn read_memory(&mut self, addr: CoreAddr, buf: &mut [u8]) -> Result<()> {
        if let Some(index) = self.current_frame {
            let collected = match self.frame_data(index)? {
                Some((_, data)) => frame_read_memory(&data, self.layout.size(), addr, buf.len()),
                None => None,
            };
            if let Some(bytes) = collected {
                buf.copy_from_slice(&bytes);
                return Ok(());
            }
            let len = buf.len() as u64;
            if !self.readonly_regions.iter().any(|r| r.contains(addr, len)) {
                log!(LogDebug, "traceframe {} has no memory data for {:#x}", index, addr);
                return Err(TraceError::MemoryAccess { addr, len: buf.len() });
            }
        }
        self.inferior.read_memory(addr, buf)
    }

    /// Registers of frame `index`. A frame without a register block gives
    /// unavailable registers with the PC guessed from its tracepoint.
    pub fn fetch_traceframe_registers(&mut self, index: usize) -> Result<Option<RegCache>> {
        let (frame, data) = match self.frame_data(index)? {
            Some(found) => found,
            None => return Ok(None),
        };
        match frame_find_registers(&data, self.layout.size()) {
            Some(raw) => Ok(Some(RegCache::from_raw(self.layout.clone(), raw)?)),
            None => {
                let mut regs = RegCache::unavailable(self.layout.clone());
                if let Some(id) = self.tracepoints.find_next_by_number(None, frame.header.tpnum) {
                    regs.write_pc(self.tracepoints.get(id).address);
                }
                Ok(Some(regs))
            }
        }
    }

    /// Registers as of the current frame, or live ones of `tid`.
    pub fn read_registers(&mut self, tid: ThreadId) -> Result<RegCache> {
        if let Some(index) = self.current_frame {
            if let Some(regs) = self.fetch_traceframe_registers(index)? {
                return Ok(regs);
            }
        }
        let mut regs = RegCache::new(self.layout.clone());
        self.inferior.fetch_registers(tid, &mut regs)?;
        Ok(regs)
    }

    /// A variable's value in the current frame (None if the frame did not
    /// record it), or its live value.
    pub fn read_tsv(&mut self, number: u32) -> Result<Option<i64>> {
        match self.current_frame {
            Some(index) => Ok(self
                .frame_data(index)?
                .and_then(|(_, data)| frame_read_tsv(&data, self.layout.size(), number))),
            None => Ok(self.tsvs.get(number).map(|_| self.tsvs.value(number))),
        }
    }

    /// Up to `len` bytes of the current frame's static trace data from
    /// `offset`. Empty when there is none.
    pub fn read_static_data(&mut self, offset: usize, len: usize) -> Result<Vec<u8>> {
        let index = match self.current_frame {
            Some(index) => index,
            None => return Ok(Vec::new()),
        };
        let data = match self.frame_data(index)? {
            Some((_, data)) => data,
            None => return Ok(Vec::new()),
        };
        match frame_static_data(&data, self.layout.size()) {
            Some(sdata) if offset < sdata.len() => {
                let end = sdata.len().min(offset.saturating_add(len));
                Ok(sdata[offset..end].to_vec())
            }
            Some(_) => Ok(Vec::new()),
            None => {
                log!(LogDebug, "traceframe {} has no static trace data", index);
                Ok(Vec::new())
            }
        }
    }

    fn thread_registers(&mut self, tid: ThreadId) -> Result<RegCache> {
        let mut regs = RegCache::new(self.layout.clone());
        self.inferior.fetch_registers(tid, &mut regs)?;
        Ok(regs)
    }

    /// `tid` stopped at `stop_pc`: collect for every enabled tracepoint
    /// there. True if there was one.
    pub fn tracepoint_was_hit(&mut self, tid: ThreadId, stop_pc: CoreAddr) -> Result<bool> {
        if !self.state.tracing {
            return Ok(false);
        }
        let hits: Vec<TracepointId> = self
            .tracepoints
            .ids()
            .filter(|id| {
                let tp = self.tracepoints.get(*id);
                tp.enabled && tp.address == stop_pc
            })
            .collect();
        if hits.is_empty() {
            return Ok(false);
        }
        let regs = self.thread_registers(tid)?;

        for id in hits {
            let tp = self.tracepoints.get_mut(id);
            log!(
                LogDebug,
                "Thread {} at address of tracepoint {} at {:#x}",
                tid,
                tp.number,
                tp.address
            );
            let mut collector = Collector {
                buffer: &mut self.buffer,
                memory: MemorySource::Target(&mut self.inferior),
                tsvs: &mut self.tsvs,
                state: &mut self.state,
                regs: &regs,
                stop_pc,
                in_agent: false,
                static_data: None,
                runner: None,
            };
            if collector.condition_true(id, tp) {
                collector.collect_data_at_tracepoint(id, tp)?;
            }
            let (number, address, step_count) = (tp.number, tp.address, tp.step_count);

            if self.state.should_stop() {
                self.stop()?;
                break;
            }
            if step_count > 0 {
                self.wstep.add(tid, number, address);
            }
        }
        Ok(true)
    }

    /// `tid` finished a single step. True if it was stepping for a
    /// tracepoint.
    pub fn tracepoint_finished_step(&mut self, tid: ThreadId, stop_pc: CoreAddr) -> Result<bool> {
        self.upload_agent_frames()?;

        if !self.wstep.is_stepping(tid) {
            return Ok(false);
        }
        if !self.state.tracing {
            // Not tracing anymore; the step was still ours.
            self.wstep.release_thread(tid);
            return Ok(true);
        }

        let regs = self.thread_registers(tid)?;
        let mut states = self.wstep.take(tid);
        let mut kept = VecDeque::with_capacity(states.len());
        while let Some(mut wstep) = states.pop_front() {
            let id = match self.tracepoints.find(wstep.tp_number, wstep.tp_address) {
                Some(id) => id,
                None => {
                    log!(
                        LogWarn,
                        "No tracepoint {} at {:#x} for thread {}",
                        wstep.tp_number,
                        wstep.tp_address,
                        tid
                    );
                    continue;
                }
            };
            wstep.current_step += 1;
            let tp = self.tracepoints.get(id);
            let mut collector = Collector {
                buffer: &mut self.buffer,
                memory: MemorySource::Target(&mut self.inferior),
                tsvs: &mut self.tsvs,
                state: &mut self.state,
                regs: &regs,
                stop_pc,
                in_agent: false,
                static_data: None,
                runner: None,
            };
            collector.collect_data_at_step(id, tp, wstep.current_step)?;

            if wstep.current_step >= tp.step_count {
                log!(
                    LogDebug,
                    "Thread {} done stepping for tracepoint {} at {:#x}",
                    tid,
                    wstep.tp_number,
                    wstep.tp_address
                );
                // The hit is only complete now that the steps are done.
                if tp.pass_count_reached() {
                    self.state.set_stopping(id);
                }
            } else {
                kept.push_back(wstep);
            }

            if self.state.should_stop() {
                kept.extend(states.drain(..));
                self.wstep.restore(tid, kept);
                self.stop()?;
                return Ok(true);
            }
        }
        self.wstep.restore(tid, kept);
        Ok(true)
    }

    /// A thread stopped on one of the breakpoints planted in the agent.
    /// True if `stop_pc` is one of them.
    pub fn handle_tracepoint_bkpts(&mut self, stop_pc: CoreAddr) -> Result<bool> {
        let syms = match &self.agent {
            Some(agent) => agent.syms,
            None => return Ok(false),
        };
        self.upload_agent_frames()?;

        if stop_pc == syms.stop_tracing {
            log!(LogDebug, "lib stopped at stop_tracing");
            let mem = &mut self.inferior;
            let is_full = mem.read_u32(syms.trace_buffer_is_full)? != 0;
            let stopping = mem.read_u64(syms.stopping_tracepoint)?;
            mem.write_u64(syms.stopping_tracepoint, 0)?;
            let error_tp = mem.read_u64(syms.error_tracepoint)?;
            mem.write_u64(syms.error_tracepoint, 0)?;
            let eval_result = mem.read_u32(syms.expr_eval_result)?;
            mem.write_u32(syms.expr_eval_result, 0)?;
            log!(
                LogDebug,
                "lib: trace_buffer_is_full: {}, stopping_tracepoint: {:#x}, expr_eval_result: {}, error_tracepoint: {:#x}",
                is_full,
                stopping,
                eval_result,
                error_tp
            );

            if stopping != 0 {
                if let Some(id) = self.tracepoints.find_by_object_addr(stopping) {
                    self.state.set_stopping(id);
                }
            } else if let Some(err) = EvalError::from_code(eval_result) {
                if self.state.eval_error.is_none() {
                    self.state.eval_error = Some(err);
                    self.state.error_tracepoint = self.tracepoints.find_by_object_addr(error_tp);
                }
            }
            if is_full {
                self.state.buffer_full = true;
            }
            self.stop()?;
            return Ok(true);
        }
        if stop_pc == syms.flush_trace_buffer {
            log!(LogDebug, "lib stopped at flush_trace_buffer");
            return Ok(true);
        }
        Ok(false)
    }
}
