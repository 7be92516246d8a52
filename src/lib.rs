#[macro_use]
extern crate bitflags;
#[macro_use]
extern crate lazy_static;
#[macro_use]
extern crate static_assertions;
#[macro_use]
extern crate memoffset;

#[macro_use]
pub mod log;
pub mod agent;
pub mod agent_expr;
pub mod amd64_emit;
pub mod ax_compile;
pub mod collect;
pub mod download;
pub mod error;
pub mod flags;
pub mod process_memory;
pub mod regcache;
pub mod session;
pub mod symbols;
pub mod target;
pub mod trace_buffer;
pub mod tracepoint;
pub mod tsv;
pub mod upload;
pub mod wstep;

#[cfg(test)]
mod test_support;
