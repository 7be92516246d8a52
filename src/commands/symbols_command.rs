use crate::commands::{
    exit_result::ExitResult,
    rdtrace_options::{RdTraceOptions, RdTraceSubCommand},
    TraceCommand,
};
use rdtrace::{
    error::TraceError,
    log::LogError,
    symbols::{AgentSymbols, ElfSymbols, SymbolLookup},
    target::CoreAddr,
};
use std::{
    collections::BTreeMap,
    io,
    io::{stdout, Write},
    path::PathBuf,
};

pub struct SymbolsCommand {
    file: PathBuf,
    bias: u64,
    json: bool,
}

impl SymbolsCommand {
    pub fn new(options: &RdTraceOptions) -> SymbolsCommand {
        match options.cmd.clone() {
            RdTraceSubCommand::Symbols { file, bias, json } => SymbolsCommand { file, bias, json },
            _ => panic!("Unexpected RdTraceSubCommand variant. Not a Symbols variant!"),
        }
    }

    /// Print what `lookup` knows of each agent symbol. Returns the names
    /// it does not know.
    fn print_symbols(&self, lookup: &dyn SymbolLookup, f: &mut dyn Write) -> io::Result<Vec<&'static str>> {
        let resolved: BTreeMap<&'static str, Option<CoreAddr>> = AgentSymbols::NAMES
            .iter()
            .map(|name| (*name, lookup.look_up_symbol(name)))
            .collect();
        if self.json {
            serde_json::to_writer_pretty(&mut *f, &resolved)?;
            writeln!(f)?;
        } else {
            for name in AgentSymbols::NAMES {
                match resolved[name] {
                    Some(addr) => writeln!(f, "{:#018x} {}", addr, name)?,
                    None => writeln!(f, "{:>18} {}", "missing", name)?,
                }
            }
        }
        Ok(resolved
            .into_iter()
            .filter(|(_, addr)| addr.is_none())
            .map(|(name, _)| name)
            .collect())
    }
}

impl TraceCommand for SymbolsCommand {
    fn run(&mut self) -> ExitResult<()> {
        let syms = match ElfSymbols::open(&self.file, self.bias) {
            Ok(syms) => syms,
            Err(e) => {
                log!(LogError, "Could not read symbols from {:?}: {}", self.file, e);
                return ExitResult::err_from(e, 1);
            }
        };
        let stdout = stdout();
        let mut out = stdout.lock();
        match self.print_symbols(&syms, &mut out) {
            Ok(missing) if missing.is_empty() => ExitResult::Ok(()),
            // Not an agent, or an incomplete one: the first missing name says which.
            Ok(missing) => ExitResult::err_from(TraceError::Symbol(missing[0].into()), 2),
            Err(e) => ExitResult::err_from(e, 1),
        }
    }
}
