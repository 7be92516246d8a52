//! Running a tracepoint's actions into a trace frame.
//!
//! The same collector serves the monitor (trap tracepoints, collecting into
//! its own buffer from the stopped inferior) and the agent (fast and static
//! tracepoints, collecting into the shared buffer from its own address
//! space).

use crate::{
    agent_expr::{EvalError, ExprContext},
    error::Result,
    log::{LogDebug, LogWarn},
    regcache::RegCache,
    target::{CoreAddr, TargetMemory},
    trace_buffer::{
        frame::{
            memory_block_header, sdata_block_header, tsv_block, BLOCK_REGISTERS,
            MAX_BLOCK_PAYLOAD, MEMORY_BLOCK_HEADER_SIZE,
        },
        sync::BufferSync,
        TraceBuffer, TraceFrameBuilder,
    },
    tracepoint::{Action, Tracepoint, TracepointId},
    tsv::TsvRegistry,
};
use memchr::memchr;

/// Strings are read in pieces this big while looking for the terminator.
const STRING_CHUNK: usize = 64;

/// The conditions that end a run, as observed by whoever collects.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct StopState {
    pub tracing: bool,
    /// The first tracepoint to reach its pass count.
    pub stopping_tracepoint: Option<TracepointId>,
    pub buffer_full: bool,
    /// The first expression error of the run and where it happened.
    pub eval_error: Option<EvalError>,
    pub error_tracepoint: Option<TracepointId>,
}

impl StopState {
    /// State at the start of a run.
    pub fn running() -> StopState {
        StopState {
            tracing: true,
            ..StopState::default()
        }
    }

    pub fn should_stop(&self) -> bool {
        self.stopping_tracepoint.is_some() || self.buffer_full || self.eval_error.is_some()
    }

    pub fn set_stopping(&mut self, id: TracepointId) {
        if self.stopping_tracepoint.is_none() {
            self.stopping_tracepoint = Some(id);
        }
    }

    /// Only the first error of a run is kept.
    pub fn record_error(&mut self, id: TracepointId, err: EvalError) {
        if self.eval_error.is_none() {
            self.eval_error = Some(err);
            self.error_tracepoint = Some(id);
        }
    }

    /// Forget the stop conditions, keeping `tracing`.
    pub fn clear_conditions(&mut self) {
        self.stopping_tracepoint = None;
        self.buffer_full = false;
        self.eval_error = None;
        self.error_tracepoint = None;
    }
}

/// Runs condition code produced by the native compiler.
pub trait ConditionRunner {
    fn run(&mut self, entry: CoreAddr, regs: &RegCache) -> std::result::Result<u64, EvalError>;
}

/// Where collected memory comes from.
pub enum MemorySource<'a> {
    /// The address space the trace buffer lives in. The agent's case.
    Buffer,
    Target(&'a mut dyn TargetMemory),
}

/// Everything one tracepoint hit (or single step) collects with.
pub struct Collector<'a, M: TargetMemory, S: BufferSync<M>> {
    pub buffer: &'a mut TraceBuffer<M, S>,
    pub memory: MemorySource<'a>,
    pub tsvs: &'a mut TsvRegistry,
    pub state: &'a mut StopState,
    pub regs: &'a RegCache,
    pub stop_pc: CoreAddr,
    /// Inside the agent the registers already hold the logical PC.
    pub in_agent: bool,
    /// Marker data of a static tracepoint hit.
    pub static_data: Option<&'a [u8]>,
    pub runner: Option<&'a mut dyn ConditionRunner>,
}

impl<'a, M: TargetMemory, S: BufferSync<M>> Collector<'a, M, S> {
    fn read_target(&mut self, addr: CoreAddr, buf: &mut [u8]) -> Result<()> {
        match &mut self.memory {
            MemorySource::Buffer => self.buffer.memory_mut().read_memory(addr, buf),
            MemorySource::Target(mem) => mem.read_memory(addr, buf),
        }
    }

    fn record_error(&mut self, id: TracepointId, tpoint: &Tracepoint, which: &str, err: EvalError) {
        log!(
            LogDebug,
            "Tracepoint {} at {:#x} {} eval reports error {}",
            tpoint.number,
            tpoint.address,
            which,
            err
        );
        self.state.record_error(id, err);
    }

    /// A tracepoint without a condition always passes. An error counts as
    /// false and is recorded.
    pub fn condition_true(&mut self, id: TracepointId, tpoint: &Tracepoint) -> bool {
        let cond = match &tpoint.cond {
            Some(cond) => cond,
            None => return true,
        };
        let regs = self.regs;
        let compiled = match (tpoint.compiled_cond, self.runner.as_mut()) {
            (Some(entry), Some(runner)) => Some(runner.run(entry, regs)),
            _ => None,
        };
        let result = match compiled {
            Some(result) => result,
            None => {
                let mut ctx = ActionContext {
                    collector: &mut *self,
                    frame: None,
                };
                cond.eval(&mut ctx, true).map(|v| v.unwrap_or(0))
            }
        };
        match result {
            Ok(value) => value != 0,
            Err(err) => {
                self.record_error(id, tpoint, "condition", err);
                false
            }
        }
    }

    /// Count the hit, then run `tpoint`'s actions into a new frame.
    pub fn collect_data_at_tracepoint(&mut self, id: TracepointId, tpoint: &mut Tracepoint) -> Result<()> {
        tpoint.hit_count += 1;

        // Tracepoints that step check their pass count once the steps are done.
        if tpoint.pass_count > 0
            && tpoint.hit_count >= tpoint.pass_count
            && tpoint.step_count == 0
            && self.state.stopping_tracepoint.is_none()
        {
            log!(
                LogDebug,
                "Tracepoint {} at {:#x} reached its pass count {}",
                tpoint.number,
                tpoint.address,
                tpoint.pass_count
            );
            self.state.stopping_tracepoint = Some(id);
        }

        log!(
            LogDebug,
            "Making new traceframe for tracepoint {} at {:#x}, hit {}",
            tpoint.number,
            tpoint.address,
            tpoint.hit_count
        );
        match self.buffer.add_traceframe(tpoint.frame_tpnum())? {
            Some(frame) => self.run_actions(id, tpoint, &tpoint.actions, frame)?,
            None => {
                if self.state.tracing {
                    log!(LogDebug, "No room for a new traceframe, buffer is full");
                    self.state.buffer_full = true;
                }
            }
        }
        Ok(())
    }

    /// Run the while-stepping actions for step `current_step`.
    pub fn collect_data_at_step(
        &mut self,
        id: TracepointId,
        tpoint: &Tracepoint,
        current_step: u64,
    ) -> Result<()> {
        log!(
            LogDebug,
            "Making new step traceframe for tracepoint {} at {:#x}, step {} of {}, hit {}",
            tpoint.number,
            tpoint.address,
            current_step,
            tpoint.step_count,
            tpoint.hit_count
        );
        match self.buffer.add_traceframe(tpoint.frame_tpnum())? {
            Some(frame) => self.run_actions(id, tpoint, &tpoint.step_actions, frame)?,
            None => {
                if self.state.tracing {
                    self.state.buffer_full = true;
                }
            }
        }
        Ok(())
    }

    /// The frame is closed even when an action fails, so later frames stay
    /// reachable. Its header covers every block allocated so far.
    fn run_actions(
        &mut self,
        id: TracepointId,
        tpoint: &Tracepoint,
        actions: &[Action],
        mut frame: TraceFrameBuilder,
    ) -> Result<()> {
        let mut result = Ok(());
        for action in actions {
            result = self.do_action(id, tpoint, &mut frame, action);
            if result.is_err() {
                break;
            }
        }
        self.buffer.finish_traceframe(frame)?;
        result
    }

    fn do_action(
        &mut self,
        id: TracepointId,
        tpoint: &Tracepoint,
        frame: &mut TraceFrameBuilder,
        action: &Action,
    ) -> Result<()> {
        match action {
            Action::CollectMemory { addr, len, basereg } => {
                let mut from = *addr;
                if *basereg >= 0 {
                    match self.regs.collect_register(*basereg as usize) {
                        Some(base) => from = from.wrapping_add(base),
                        None => {
                            log!(LogWarn, "No register {} to collect memory relative to", basereg);
                            return Ok(());
                        }
                    }
                }
                log!(LogDebug, "Want to collect {} bytes at {:#x} (basereg {})", len, from, basereg);
                self.mem_read_into_frame(frame, from, *len)
            }
            Action::CollectRegisters => {
                log!(LogDebug, "Want to collect registers");
                let mut block = Vec::with_capacity(1 + self.regs.raw().len());
                block.push(BLOCK_REGISTERS);
                if self.in_agent {
                    block.extend_from_slice(self.regs.raw());
                } else {
                    // Trap and step stops may report a PC other than the
                    // tracepoint's; always record where the thread stopped.
                    let mut regs = self.regs.clone();
                    regs.write_pc(self.stop_pc);
                    block.extend_from_slice(regs.raw());
                }
                if !self.buffer.add_block_bytes(frame, &block)? {
                    log!(LogDebug, "No room for the register block");
                }
                Ok(())
            }
            Action::EvalExpr(expr) => {
                log!(LogDebug, "Want to evaluate expression {}", expr.to_hex());
                let result = {
                    let mut ctx = ActionContext {
                        collector: &mut *self,
                        frame: Some(frame),
                    };
                    expr.eval(&mut ctx, false)
                };
                if let Err(err) = result {
                    self.record_error(id, tpoint, "action expression", err);
                }
                Ok(())
            }
            Action::CollectStaticData => {
                log!(LogDebug, "Want to collect static trace data");
                let data = match self.static_data {
                    Some(data) => data,
                    None => {
                        log!(LogWarn, "Static trace data requested but this hit has none");
                        return Ok(());
                    }
                };
                let len = data.len().min(MAX_BLOCK_PAYLOAD);
                let mut block = Vec::with_capacity(3 + len);
                block.extend_from_slice(&sdata_block_header(len as u16));
                block.extend_from_slice(&data[..len]);
                if !self.buffer.add_block_bytes(frame, &block)? {
                    log!(LogDebug, "No room for static trace data");
                }
                Ok(())
            }
        }
    }

    /// Append `data` as `M` blocks of at most `MAX_BLOCK_PAYLOAD` bytes.
    /// False once the buffer has no room.
    fn emit_memory_blocks(&mut self, frame: &mut TraceFrameBuilder, addr: CoreAddr, data: &[u8]) -> Result<bool> {
        let mut from = addr;
        for chunk in data.chunks(MAX_BLOCK_PAYLOAD) {
            let mut block = Vec::with_capacity(MEMORY_BLOCK_HEADER_SIZE + chunk.len());
            block.extend_from_slice(&memory_block_header(from, chunk.len() as u16));
            block.extend_from_slice(chunk);
            if !self.buffer.add_block_bytes(frame, &block)? {
                log!(LogDebug, "No room for {} bytes of memory at {:#x}", chunk.len(), from);
                return Ok(false);
            }
            from += chunk.len() as u64;
        }
        Ok(true)
    }

    fn mem_read_into_frame(&mut self, frame: &mut TraceFrameBuilder, addr: CoreAddr, len: u64) -> Result<()> {
        let mut from = addr;
        let mut remaining = len;
        while remaining > 0 {
            let blocklen = remaining.min(MAX_BLOCK_PAYLOAD as u64) as usize;
            let mut data = vec![0u8; blocklen];
            if let Err(e) = self.read_target(from, &mut data) {
                log!(LogDebug, "Collecting {} bytes at {:#x} failed: {}", blocklen, from, e);
                return Ok(());
            }
            if !self.emit_memory_blocks(frame, from, &data)? {
                return Ok(());
            }
            remaining -= blocklen as u64;
            from += blocklen as u64;
        }
        Ok(())
    }

    /// Collect a NUL terminated string of at most `limit` bytes, the
    /// terminator included when it is found.
    fn string_into_frame(&mut self, frame: &mut TraceFrameBuilder, addr: CoreAddr, limit: u64) -> Result<()> {
        let mut collected = Vec::new();
        let mut chunk = [0u8; STRING_CHUNK];
        while (collected.len() as u64) < limit {
            let from = addr + collected.len() as u64;
            let want = (limit - collected.len() as u64).min(STRING_CHUNK as u64) as usize;
            let got = match self.read_target(from, &mut chunk[..want]) {
                Ok(()) => want,
                // Near the end of a mapping: go byte by byte.
                Err(_) => {
                    let mut n = 0;
                    while n < want && self.read_target(from + n as u64, &mut chunk[n..n + 1]).is_ok() {
                        n += 1;
                    }
                    n
                }
            };
            if let Some(nul) = memchr(0, &chunk[..got]) {
                collected.extend_from_slice(&chunk[..=nul]);
                break;
            }
            collected.extend_from_slice(&chunk[..got]);
            if got < want {
                log!(LogDebug, "String at {:#x} runs into unreadable memory", addr);
                break;
            }
        }
        self.emit_memory_blocks(frame, addr, &collected)?;
        Ok(())
    }
}

/// The view an expression gets while a tracepoint collects. Without a
/// frame (conditions) the trace operations record nothing.
struct ActionContext<'c, 'a, M: TargetMemory, S: BufferSync<M>> {
    collector: &'c mut Collector<'a, M, S>,
    frame: Option<&'c mut TraceFrameBuilder>,
}

impl<'c, 'a, M: TargetMemory, S: BufferSync<M>> ExprContext for ActionContext<'c, 'a, M, S> {
    fn read_memory(&mut self, addr: CoreAddr, buf: &mut [u8]) -> bool {
        self.collector.read_target(addr, buf).is_ok()
    }

    fn collect_register(&mut self, regnum: u16) -> Option<u64> {
        self.collector.regs.collect_register(regnum as usize)
    }

    fn get_tsv(&mut self, num: u16) -> i64 {
        self.collector.tsvs.value(num as u32)
    }

    fn set_tsv(&mut self, num: u16, value: i64) {
        self.collector.tsvs.set_value(num as u32, value);
    }

    fn trace_memory(&mut self, addr: CoreAddr, len: u64) {
        if let Some(frame) = self.frame.as_deref_mut() {
            if let Err(e) = self.collector.mem_read_into_frame(frame, addr, len) {
                log!(LogDebug, "trace of {:#x} failed: {}", addr, e);
            }
        }
    }

    fn trace_string(&mut self, addr: CoreAddr, limit: u64) {
        if let Some(frame) = self.frame.as_deref_mut() {
            if let Err(e) = self.collector.string_into_frame(frame, addr, limit) {
                log!(LogDebug, "tracenz of {:#x} failed: {}", addr, e);
            }
        }
    }

    fn trace_tsv(&mut self, num: u16) {
        if let Some(frame) = self.frame.as_deref_mut() {
            let value = self.collector.tsvs.value(num as u32);
            match self.collector.buffer.add_block_bytes(frame, &tsv_block(num as u32, value)) {
                Ok(true) => (),
                Ok(false) => log!(LogDebug, "No room to record variable {}", num),
                Err(e) => log!(LogDebug, "tracev {} failed: {}", num, e),
            }
        }
    }
}
