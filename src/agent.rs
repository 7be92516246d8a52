//! The collecting side that lives inside the traced process.
//!
//! Fast tracepoint jump pads and static tracepoint markers end up here.
//! The agent works on its own copy of the definitions and shares nothing
//! with the monitor except the exported variables and the trace buffer.

use crate::{
    agent_expr::EvalError,
    collect::{Collector, ConditionRunner, MemorySource, StopState},
    download::{decode_tracepoints, decode_tsvs, fetch_published},
    error::Result,
    log::{LogDebug, LogWarn},
    regcache::RegCache,
    symbols::AgentSymbols,
    target::{CoreAddr, TargetMemory},
    trace_buffer::{
        sync::{AgentSync, BufferSync, Rendezvous},
        TraceBuffer,
    },
    tracepoint::{TracepointId, TracepointKind, TracepointRegistry},
    tsv::TsvRegistry,
};

pub type AgentBuffer<M> = TraceBuffer<M, AgentSync<M>>;

pub struct Agent<M: TargetMemory> {
    syms: AgentSymbols,
    buffer: AgentBuffer<M>,
    tracepoints: TracepointRegistry,
    tsvs: TsvRegistry,
    runner: Option<Box<dyn ConditionRunner>>,
}

impl<M: TargetMemory> Agent<M> {
    /// `mem` is the process's own address space. The buffer bounds come
    /// from the agent's exported variables.
    pub fn new(mut mem: M, syms: AgentSymbols, rendezvous: Box<dyn Rendezvous<M>>) -> Result<Agent<M>> {
        let lo = mem.read_u64(syms.trace_buffer_lo)?;
        let hi = mem.read_u64(syms.trace_buffer_hi)?;
        log!(LogDebug, "agent trace buffer at [{:#x}, {:#x})", lo, hi);
        Ok(Agent {
            syms,
            buffer: TraceBuffer::new(mem, AgentSync::new(syms, rendezvous), lo, hi),
            tracepoints: TracepointRegistry::new(),
            tsvs: TsvRegistry::with_builtins(),
            runner: None,
        })
    }

    /// Run compiled conditions through `runner` instead of interpreting them.
    pub fn set_condition_runner(&mut self, runner: Box<dyn ConditionRunner>) {
        self.runner = Some(runner);
    }

    /// Replace the definitions with what the monitor last downloaded.
    pub fn load_definitions(&mut self) -> Result<()> {
        let mem = self.buffer.memory_mut();
        let (base, blob) = fetch_published(mem, self.syms.tracepoints)?;
        let tracepoints = decode_tracepoints(&blob, base)?;
        let (_, blob) = fetch_published(mem, self.syms.trace_state_variables)?;
        let tsvs = decode_tsvs(&blob)?;

        self.tracepoints.clear();
        for tp in tracepoints {
            self.tracepoints.insert(tp);
        }
        self.tsvs.clear_user_variables();
        for tsv in tsvs {
            self.tsvs.define(tsv.number, tsv.initial_value, tsv.name);
            self.tsvs.set_value(tsv.number, tsv.value);
        }
        log!(
            LogDebug,
            "agent loaded {} tracepoints and {} variables",
            self.tracepoints.len(),
            self.tsvs.len()
        );
        Ok(())
    }

    pub fn tracepoints(&self) -> &TracepointRegistry {
        &self.tracepoints
    }

    pub fn tsvs(&self) -> &TsvRegistry {
        &self.tsvs
    }

    pub fn buffer_mut(&mut self) -> &mut AgentBuffer<M> {
        &mut self.buffer
    }

    /// Entry point of a fast tracepoint's jump pad. `tpoint_obj` is the
    /// tracepoint's object address, `regs` what the pad saved.
    pub fn gdb_collect(&mut self, tpoint_obj: CoreAddr, regs: &RegCache) -> Result<()> {
        let id = match self.tracepoints.find_by_object_addr(tpoint_obj) {
            Some(id) => id,
            None => {
                log!(LogWarn, "gdb_collect: no tracepoint object at {:#x}", tpoint_obj);
                return Ok(());
            }
        };
        self.buffer.memory_mut().write_u64(self.syms.collecting, tpoint_obj)?;
        let result = self.collect_hit(id, regs, None);
        self.buffer.memory_mut().write_u64(self.syms.collecting, 0)?;
        result
    }

    /// A static tracepoint marker at `marker` fired with `sdata` as its
    /// formatted data.
    pub fn collect_static(&mut self, marker: CoreAddr, regs: &RegCache, sdata: &[u8]) -> Result<()> {
        let found = self
            .tracepoints
            .ids()
            .find(|id| {
                let tp = self.tracepoints.get(*id);
                tp.kind == TracepointKind::Static && tp.address == marker
            });
        match found {
            Some(id) => self.collect_hit(id, regs, Some(sdata)),
            None => {
                log!(LogDebug, "gdb_probe: marker not known: loc:{:#x}", marker);
                Ok(())
            }
        }
    }

    fn collect_hit(&mut self, id: TracepointId, regs: &RegCache, static_data: Option<&[u8]>) -> Result<()> {
        let seen = self.load_state()?;
        let mut state = seen.clone();
        if !state.tracing {
            log!(LogDebug, "not tracing");
            return Ok(());
        }

        let tpoint = self.tracepoints.get_mut(id);
        if !tpoint.enabled {
            return Ok(());
        }
        let stop_pc = tpoint.address;
        let mut collector = Collector {
            buffer: &mut self.buffer,
            memory: MemorySource::Buffer,
            tsvs: &mut self.tsvs,
            state: &mut state,
            regs,
            stop_pc,
            in_agent: true,
            static_data,
            runner: self
                .runner
                .as_mut()
                .map(|r| &mut **r as &mut dyn ConditionRunner),
        };
        if collector.condition_true(id, tpoint) {
            collector.collect_data_at_tracepoint(id, tpoint)?;
        }

        if state.should_stop() {
            self.publish_stop(&seen, &state)?;
            let (mem, sync) = self.buffer.split_mut();
            sync.rendezvous().stop_tracing(mem);
        }
        Ok(())
    }

    /// The stop conditions live in exported variables so the monitor can
    /// see (and reset) them.
    fn load_state(&mut self) -> Result<StopState> {
        let syms = self.syms;
        let mem = self.buffer.memory_mut();
        let tracing = mem.read_u32(syms.tracing)? != 0;
        let stopping = mem.read_u64(syms.stopping_tracepoint)?;
        let buffer_full = mem.read_u32(syms.trace_buffer_is_full)? != 0;
        let eval_error = EvalError::from_code(mem.read_u32(syms.expr_eval_result)?);
        let error_tp = mem.read_u64(syms.error_tracepoint)?;
        Ok(StopState {
            tracing,
            stopping_tracepoint: self.tracepoints.find_by_object_addr(stopping),
            buffer_full,
            eval_error,
            error_tracepoint: self.tracepoints.find_by_object_addr(error_tp),
        })
    }

    /// Publish only what this hit changed since `seen`. Other threads may
    /// have published meanwhile: the first stopping tracepoint and the
    /// first error are claimed by compare-exchange, so whoever came first
    /// keeps them.
    fn publish_stop(&mut self, seen: &StopState, state: &StopState) -> Result<()> {
        let obj = |id: Option<TracepointId>| id.map_or(0, |id| self.tracepoints.get(id).obj_addr_on_target);
        let stopping = obj(state.stopping_tracepoint);
        let error_tp = obj(state.error_tracepoint);
        let syms = self.syms;
        let mem = self.buffer.memory_mut();

        if seen.stopping_tracepoint.is_none() && stopping != 0 {
            let found = mem.compare_exchange_u64(syms.stopping_tracepoint, 0, stopping)?;
            if found != 0 {
                log!(LogDebug, "stopping tracepoint already claimed by {:#x}", found);
            }
        }
        if !seen.buffer_full && state.buffer_full {
            mem.write_u32(syms.trace_buffer_is_full, 1)?;
        }
        if let (None, Some(err)) = (seen.eval_error, state.eval_error) {
            let found = mem.compare_exchange_u64(syms.error_tracepoint, 0, error_tp)?;
            if found == 0 {
                mem.write_u32(syms.expr_eval_result, err.code())?;
            } else {
                log!(LogDebug, "{:?} dropped, {:#x} already failed first", err, found);
            }
        }
        log!(
            LogDebug,
            "agent stopping: tracepoint={:#x} full={} error={:?} at {:#x}",
            stopping,
            state.buffer_full,
            state.eval_error,
            error_tp
        );
        Ok(())
    }

    /// Frames complete and waiting for the monitor.
    pub fn pending_frames(&mut self) -> Result<u32> {
        let (mem, sync) = self.buffer.split_mut();
        Ok(sync.counters(mem)?.live())
    }
}
