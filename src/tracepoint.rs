use crate::{
    agent_expr::AgentExpr,
    error::{Result, TraceError},
    log::LogDebug,
    target::{BreakpointHandle, CoreAddr},
};
use serde::Serialize;
use std::fmt::{self, Display, Formatter};

#[derive(Copy, Clone, Eq, PartialEq, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum TracepointKind {
    /// Hit through an ordinary breakpoint and collected by the monitor.
    Trap,
    /// A jump patched over the instruction, collected by the agent.
    Fast,
    /// Hooked into a marker compiled into the program, collected by the agent.
    Static,
}

impl TracepointKind {
    pub fn needs_agent(self) -> bool {
        self != TracepointKind::Trap
    }
}

#[derive(Clone, Eq, PartialEq, Debug)]
pub enum Action {
    /// `len` bytes at `addr`, relative to register `basereg` when it is not negative.
    CollectMemory { addr: u64, len: u64, basereg: i32 },
    CollectRegisters,
    EvalExpr(AgentExpr),
    CollectStaticData,
}

impl Action {
    pub fn tag(&self) -> u8 {
        match self {
            Action::CollectMemory { .. } => b'M',
            Action::CollectRegisters => b'R',
            Action::EvalExpr(_) => b'X',
            Action::CollectStaticData => b'L',
        }
    }
}

/// The packet form, e.g. `M-1,10,8`, `R`, `X3,220502`, `L`.
impl Display for Action {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            Action::CollectMemory { addr, len, basereg } => {
                if *basereg < 0 {
                    write!(f, "M-{:x},{:x},{:x}", basereg.unsigned_abs(), addr, len)
                } else {
                    write!(f, "M{:x},{:x},{:x}", basereg, addr, len)
                }
            }
            Action::CollectRegisters => write!(f, "R"),
            Action::EvalExpr(expr) => write!(f, "X{:x},{}", expr.len(), expr.to_hex()),
            Action::CollectStaticData => write!(f, "L"),
        }
    }
}

fn parse_hex(s: &str) -> (u64, &str) {
    let end = s
        .find(|c: char| !c.is_ascii_hexdigit())
        .unwrap_or_else(|| s.len());
    let value = s[..end]
        .chars()
        .fold(0u64, |acc, c| (acc << 4) | c.to_digit(16).unwrap_or(0) as u64);
    (value, &s[end..])
}

fn skip_comma(s: &str) -> Result<&str> {
    if let Some(rest) = s.strip_prefix(',') {
        Ok(rest)
    } else {
        Err(TraceError::MalformedExpression(format!(
            "expected `,' in action at `{}'",
            s
        )))
    }
}

/// Actions in packet form. A leading `S` marks while-stepping actions.
pub fn parse_actions(packet: &str) -> Result<(bool, Vec<Action>)> {
    let (stepping, mut act) = match packet.strip_prefix('S') {
        Some(rest) => (true, rest),
        None => (false, packet),
    };
    let mut actions = Vec::new();
    while let Some(c) = act.chars().next() {
        act = &act[1..];
        match c {
            'M' => {
                let (neg, rest) = match act.strip_prefix('-') {
                    Some(rest) => (true, rest),
                    None => (false, act),
                };
                let (basereg, rest) = parse_hex(rest);
                let (addr, rest) = parse_hex(skip_comma(rest)?);
                let (len, rest) = parse_hex(skip_comma(rest)?);
                let basereg = if neg { -(basereg as i32) } else { basereg as i32 };
                actions.push(Action::CollectMemory { addr, len, basereg });
                act = rest;
            }
            'R' => {
                // The register mask is ignored: every register is collected.
                let (_, rest) = parse_hex(act);
                actions.push(Action::CollectRegisters);
                act = rest;
            }
            'L' => actions.push(Action::CollectStaticData),
            'X' => {
                let (len, rest) = parse_hex(act);
                let rest = skip_comma(rest)?;
                let nhex = len as usize * 2;
                if rest.len() < nhex {
                    return Err(TraceError::MalformedExpression(format!(
                        "expression of {} bytes is truncated",
                        len
                    )));
                }
                actions.push(Action::EvalExpr(AgentExpr::from_hex(&rest[..nhex])?));
                act = &rest[nhex..];
            }
            '-' => break,
            other => {
                log!(LogDebug, "unknown trace action '{}', ignoring", other);
                break;
            }
        }
    }
    Ok((stepping, actions))
}

/// What the controller says about a tracepoint when defining it.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct TracepointDef {
    pub number: u32,
    pub address: CoreAddr,
    pub kind: TracepointKind,
    pub enabled: bool,
    pub step_count: u64,
    pub pass_count: u64,
    pub cond: Option<AgentExpr>,
    /// Length of the instruction a fast tracepoint's jump replaces.
    pub orig_size: u64,
}

impl TracepointDef {
    pub fn new(number: u32, address: CoreAddr) -> TracepointDef {
        TracepointDef {
            number,
            address,
            kind: TracepointKind::Trap,
            enabled: true,
            step_count: 0,
            pass_count: 0,
            cond: None,
            orig_size: 0,
        }
    }
}

/// How an installed tracepoint has to be removed again.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum InstallHandle {
    Breakpoint(BreakpointHandle),
    /// The jump into the pad. Each fast tracepoint at an address holds its own.
    FastJump(BreakpointHandle),
    StaticMarker,
}

#[derive(Clone, Debug)]
pub struct Tracepoint {
    pub number: u32,
    pub address: CoreAddr,
    pub kind: TracepointKind,
    pub enabled: bool,
    pub step_count: u64,
    pub pass_count: u64,
    pub cond: Option<AgentExpr>,
    pub actions: Vec<Action>,
    pub step_actions: Vec<Action>,
    pub hit_count: u64,
    /// Native code for `cond` inside the agent, when it could be compiled.
    pub compiled_cond: Option<CoreAddr>,
    pub orig_size: u64,
    /// Where the agent's copy of this tracepoint lives.
    pub obj_addr_on_target: CoreAddr,
    /// The instruction that replaced the original one at `address`.
    pub jump_insn: Vec<u8>,
    pub jump_pad: CoreAddr,
    pub jump_pad_end: CoreAddr,
    pub adjusted_insn_addr: CoreAddr,
    pub adjusted_insn_addr_end: CoreAddr,
    pub handle: Option<InstallHandle>,
}

impl Tracepoint {
    pub fn from_def(def: TracepointDef) -> Tracepoint {
        Tracepoint {
            number: def.number,
            address: def.address,
            kind: def.kind,
            enabled: def.enabled,
            step_count: def.step_count,
            pass_count: def.pass_count,
            cond: def.cond,
            actions: Vec::new(),
            step_actions: Vec::new(),
            hit_count: 0,
            compiled_cond: None,
            orig_size: def.orig_size,
            obj_addr_on_target: 0,
            jump_insn: Vec::new(),
            jump_pad: 0,
            jump_pad_end: 0,
            adjusted_insn_addr: 0,
            adjusted_insn_addr_end: 0,
            handle: None,
        }
    }

    /// The number as stored in a frame header.
    pub fn frame_tpnum(&self) -> u16 {
        self.number as u16
    }

    pub fn pass_count_reached(&self) -> bool {
        self.pass_count > 0 && self.hit_count >= self.pass_count
    }

    /// `num:addr:E|D:step:pass[:F<orig>|:S][:X<len>,<cond>]`, the definition
    /// as the controller sent it.
    pub fn definition(&self) -> String {
        let mut def = format!(
            "{:x}:{:x}:{}:{:x}:{:x}",
            self.number,
            self.address,
            if self.enabled { 'E' } else { 'D' },
            self.step_count,
            self.pass_count
        );
        match self.kind {
            TracepointKind::Fast => def.push_str(&format!(":F{:x}", self.orig_size)),
            TracepointKind::Static => def.push_str(":S"),
            TracepointKind::Trap => (),
        }
        if let Some(cond) = &self.cond {
            def.push_str(&format!(":X{:x},{}", cond.len(), cond.to_hex()));
        }
        def
    }
}

/// Stable handle to a tracepoint in a registry. Invalidated by `clear`.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug)]
pub struct TracepointId(pub usize);

#[derive(Clone, Debug, Default)]
pub struct TracepointRegistry {
    tracepoints: Vec<Tracepoint>,
}

impl TracepointRegistry {
    pub fn new() -> TracepointRegistry {
        TracepointRegistry::default()
    }

    pub fn add(&mut self, def: TracepointDef) -> Result<TracepointId> {
        if def.number == 0 {
            return Err(TraceError::InvalidTracepointNumber(0));
        }
        if self.find(def.number, def.address).is_some() {
            log!(
                LogDebug,
                "Tracepoint error: tracepoint {} at {:#x} already exists",
                def.number,
                def.address
            );
            return Err(TraceError::DuplicateTracepoint {
                number: def.number,
                address: def.address,
            });
        }
        let tp = Tracepoint::from_def(def);
        log!(
            LogDebug,
            "Defined {:?} tracepoint {} at {:#x}, enabled {} step {} pass {}",
            tp.kind,
            tp.number,
            tp.address,
            tp.enabled,
            tp.step_count,
            tp.pass_count
        );
        self.tracepoints.push(tp);
        Ok(TracepointId(self.tracepoints.len() - 1))
    }

    /// Take over a complete tracepoint, as the agent does with the copies
    /// it is sent.
    pub fn insert(&mut self, tp: Tracepoint) -> TracepointId {
        self.tracepoints.push(tp);
        TracepointId(self.tracepoints.len() - 1)
    }

    pub fn find(&self, number: u32, address: CoreAddr) -> Option<TracepointId> {
        self.tracepoints
            .iter()
            .position(|tp| tp.number == number && tp.address == address)
            .map(TracepointId)
    }

    /// The first tracepoint after `prev` (or the first overall) whose frame
    /// number is `tpnum`.
    pub fn find_next_by_number(&self, prev: Option<TracepointId>, tpnum: u16) -> Option<TracepointId> {
        let from = prev.map_or(0, |id| id.0 + 1);
        self.tracepoints
            .iter()
            .enumerate()
            .skip(from)
            .find(|(_, tp)| tp.frame_tpnum() == tpnum)
            .map(|(i, _)| TracepointId(i))
    }

    pub fn find_by_object_addr(&self, addr: CoreAddr) -> Option<TracepointId> {
        if addr == 0 {
            return None;
        }
        self.tracepoints
            .iter()
            .position(|tp| tp.obj_addr_on_target == addr)
            .map(TracepointId)
    }

    pub fn get(&self, id: TracepointId) -> &Tracepoint {
        &self.tracepoints[id.0]
    }

    pub fn get_mut(&mut self, id: TracepointId) -> &mut Tracepoint {
        &mut self.tracepoints[id.0]
    }

    pub fn add_action(&mut self, id: TracepointId, action: Action, stepping: bool) {
        let tp = &mut self.tracepoints[id.0];
        log!(
            LogDebug,
            "tracepoint {} at {:#x}: adding {}action {}",
            tp.number,
            tp.address,
            if stepping { "step " } else { "" },
            action
        );
        if stepping {
            tp.step_actions.push(action);
        } else {
            tp.actions.push(action);
        }
    }

    /// Stable, so tracepoints sharing an address keep their definition order.
    pub fn sort_by_address(&mut self) {
        self.tracepoints.sort_by_key(|tp| tp.address);
    }

    pub fn clear(&mut self) {
        self.tracepoints.clear();
    }

    pub fn ids(&self) -> impl Iterator<Item = TracepointId> {
        (0..self.tracepoints.len()).map(TracepointId)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Tracepoint> {
        self.tracepoints.iter()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Tracepoint> {
        self.tracepoints.iter_mut()
    }

    pub fn len(&self) -> usize {
        self.tracepoints.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tracepoints.is_empty()
    }
}
