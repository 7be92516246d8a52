#[macro_use]
extern crate rdtrace;

mod commands;

use crate::commands::{
    dump_command::DumpCommand,
    exit_result::ExitResult,
    rdtrace_options::{RdTraceOptions, RdTraceSubCommand},
    symbols_command::SymbolsCommand,
    TraceCommand,
};
use rdtrace::{flags::Flags, log::LogDebug};
use structopt::StructOpt;

fn main() -> ExitResult<()> {
    let options = RdTraceOptions::from_args();
    log!(LogDebug, "engine flags: {:?}", Flags::get());

    match &options.cmd {
        RdTraceSubCommand::Dump { .. } => DumpCommand::new(&options).run(),
        RdTraceSubCommand::Symbols { .. } => SymbolsCommand::new(&options).run(),
    }
}
