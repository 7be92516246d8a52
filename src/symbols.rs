use crate::{
    error::{Result, TraceError},
    log::LogDebug,
    target::CoreAddr,
};
use object::{Object, ObjectSymbol};
use serde::Serialize;
use std::{collections::HashMap, path::Path};

/// Resolves the agent's exported names. Used once, when the agent is found.
pub trait SymbolLookup {
    fn look_up_symbol(&self, name: &str) -> Option<CoreAddr>;
}

impl SymbolLookup for HashMap<String, CoreAddr> {
    fn look_up_symbol(&self, name: &str) -> Option<CoreAddr> {
        self.get(name).copied()
    }
}

/// Symbol table of an ELF object, relocated by `bias`.
#[derive(Clone, Debug, Default)]
pub struct ElfSymbols {
    symbols: HashMap<String, CoreAddr>,
    bias: u64,
}

impl ElfSymbols {
    pub fn parse(data: &[u8], bias: u64) -> Result<ElfSymbols> {
        let file = object::File::parse(data).map_err(|e| TraceError::Symbol(e.to_string()))?;
        let mut symbols = HashMap::new();
        for sym in file.symbols().chain(file.dynamic_symbols()) {
            if sym.address() == 0 {
                continue;
            }
            if let Ok(name) = sym.name() {
                if !name.is_empty() {
                    symbols.insert(name.to_owned(), sym.address());
                }
            }
        }
        log!(LogDebug, "read {} symbols", symbols.len());
        Ok(ElfSymbols { symbols, bias })
    }

    pub fn open(path: &Path, bias: u64) -> Result<ElfSymbols> {
        let data = std::fs::read(path)?;
        ElfSymbols::parse(&data, bias)
    }

    pub fn len(&self) -> usize {
        self.symbols.len()
    }

    pub fn is_empty(&self) -> bool {
        self.symbols.is_empty()
    }
}

impl SymbolLookup for ElfSymbols {
    fn look_up_symbol(&self, name: &str) -> Option<CoreAddr> {
        self.symbols.get(name).map(|addr| addr.wrapping_add(self.bias))
    }
}

macro_rules! agent_symbols {
    (data { $($data:ident : $size:expr),* $(,)? } functions { $($func:ident),* $(,)? }) => {
        /// Addresses of everything the monitor touches inside the agent.
        #[derive(Copy, Clone, Default, Eq, PartialEq, Debug, Serialize)]
        pub struct AgentSymbols {
            $(pub $data: CoreAddr,)*
            $(pub $func: CoreAddr,)*
        }

        impl AgentSymbols {
            pub const NAMES: &'static [&'static str] = &[
                $(stringify!($data),)*
                $(stringify!($func),)*
            ];

            /// Resolve every symbol. Any missing one means the agent is not (fully) loaded.
            pub fn look_up(lookup: &dyn SymbolLookup) -> Result<AgentSymbols> {
                Ok(AgentSymbols {
                    $($data: lookup
                        .look_up_symbol(stringify!($data))
                        .ok_or_else(|| TraceError::Symbol(stringify!($data).into()))?,)*
                    $($func: lookup
                        .look_up_symbol(stringify!($func))
                        .ok_or_else(|| TraceError::Symbol(stringify!($func).into()))?,)*
                })
            }

            /// Lay out the agent's variables back to back from `base`, followed
            /// by one 16 byte slot per entry point. Returns the layout and the
            /// number of bytes it spans.
            pub fn packed(base: CoreAddr) -> (AgentSymbols, u64) {
                let mut next = base;
                let mut place = |size: u64| {
                    let addr = next;
                    next += (size + 7) & !7;
                    addr
                };
                let syms = AgentSymbols {
                    $($data: place($size),)*
                    $($func: place(16),)*
                };
                (syms, next - base)
            }

            pub fn entries(&self) -> Vec<(&'static str, CoreAddr)> {
                vec![
                    $((stringify!($data), self.$data),)*
                    $((stringify!($func), self.$func),)*
                ]
            }
        }
    };
}

agent_symbols! {
    data {
        trace_buffer_ctrl: 3 * 32,
        trace_buffer_ctrl_curr: 4,
        traceframe_write_count: 4,
        traceframe_read_count: 4,
        traceframes_created: 4,
        trace_buffer_lo: 8,
        trace_buffer_hi: 8,
        tracing: 4,
        stopping_tracepoint: 8,
        trace_buffer_is_full: 4,
        expr_eval_result: 4,
        error_tracepoint: 8,
        // Each download area is an address and a length.
        tracepoints: 16,
        trace_state_variables: 16,
        gdb_jump_pad_buffer: 8,
        gdb_jump_pad_buffer_end: 8,
        gdb_tp_heap_buffer: 8,
        collecting: 8,
    }
    functions {
        gdb_collect,
        about_to_request_buffer_space,
        flush_trace_buffer,
        stop_tracing,
        get_raw_reg,
        get_trace_state_variable_value,
        set_trace_state_variable_value,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn packed_layout_test() {
        let (syms, size) = AgentSymbols::packed(0x10000);
        assert_eq!(syms.trace_buffer_ctrl, 0x10000);
        assert_eq!(syms.trace_buffer_ctrl_curr, 0x10000 + 96);
        assert_eq!(syms.traceframe_write_count, 0x10000 + 104);
        let entries = syms.entries();
        assert_eq!(entries.len(), AgentSymbols::NAMES.len());
        // All distinct and inside the block.
        let mut addrs: Vec<CoreAddr> = entries.iter().map(|(_, a)| *a).collect();
        addrs.sort();
        addrs.dedup();
        assert_eq!(addrs.len(), entries.len());
        assert!(addrs.iter().all(|a| *a >= 0x10000 && *a < 0x10000 + size));
    }

    #[test]
    fn look_up_test() {
        let (syms, _) = AgentSymbols::packed(0x4000);
        let mut map: HashMap<String, CoreAddr> =
            syms.entries().into_iter().map(|(n, a)| (n.to_owned(), a)).collect();
        assert_eq!(AgentSymbols::look_up(&map).unwrap(), syms);
        map.remove("stop_tracing");
        match AgentSymbols::look_up(&map) {
            Err(TraceError::Symbol(name)) => assert_eq!(name, "stop_tracing"),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn parse_garbage_test() {
        assert!(ElfSymbols::parse(b"definitely not an object file", 0).is_err());
    }

    #[test]
    fn parse_self_test() {
        // The test binary itself is a perfectly good ELF file.
        let exe = std::env::current_exe().unwrap();
        let syms = ElfSymbols::open(&exe, 0).unwrap();
        assert!(!syms.is_empty());
        assert_eq!(syms.look_up_symbol("no_such_symbol_anywhere"), None);
    }
}
