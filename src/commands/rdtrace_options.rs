use rdtrace::{regcache::RegisterLayout, trace_buffer::frame::BlockKinds};
use std::{num::ParseIntError, path::PathBuf};
use structopt::{clap::AppSettings, StructOpt};

#[derive(Debug, StructOpt)]
#[structopt(
    name = "rdtrace",
    about = "Inspect tracepoint trace buffers and in-process agents",
    after_help = "Use RDTRACE_LOG to control logging; e.g. RDTRACE_LOG=all:warn,trace_buffer:debug"
)]
#[structopt(global_settings = &[AppSettings::UnifiedHelpMessage])]
pub struct RdTraceOptions {
    #[structopt(subcommand)]
    pub cmd: RdTraceSubCommand,
}

/// How big an `R` block is, and how to show it.
#[derive(Clone, Debug, PartialEq)]
pub enum RegisterFormat {
    Layout(RegisterLayout),
    /// Unknown architecture: only the size is known.
    Raw(usize),
}

impl RegisterFormat {
    pub fn block_size(&self) -> usize {
        match self {
            RegisterFormat::Layout(layout) => layout.size(),
            RegisterFormat::Raw(size) => *size,
        }
    }
}

#[derive(Clone, Debug, StructOpt)]
pub enum RdTraceSubCommand {
    /// Decode a raw trace buffer image (the concatenated chunks of
    /// "read raw buffer" replies) and print its frames. With --pid, print
    /// the frames waiting in a live agent's buffer instead; FILE is then
    /// the agent library.
    #[structopt(name = "dump")]
    Dump {
        #[structopt(parse(from_os_str))]
        file: PathBuf,

        #[structopt(long, help = "Read the buffer of the agent in this (stopped) process.")]
        pid: Option<i32>,

        #[structopt(
            long,
            default_value = "0",
            parse(try_from_str = parse_hex),
            help = "Load bias of the agent library, in hex. Only used with --pid."
        )]
        bias: u64,

        #[structopt(long, help = "Print one JSON object per frame.")]
        json: bool,

        #[structopt(
            long,
            default_value = "amd64",
            parse(try_from_str = parse_register_format),
            help = "Register block layout: `amd64` or a size in bytes."
        )]
        regs: RegisterFormat,

        #[structopt(
            long,
            parse(try_from_str = parse_block_kinds),
            help = "Only show these block kinds, e.g. `RM`. Tags are R, M, V and S."
        )]
        blocks: Option<BlockKinds>,
    },

    /// Resolve the in-process agent's symbols in an ELF file.
    #[structopt(name = "symbols")]
    Symbols {
        #[structopt(parse(from_os_str))]
        file: PathBuf,

        #[structopt(
            long,
            default_value = "0",
            parse(try_from_str = parse_hex),
            help = "Load bias added to every address, in hex."
        )]
        bias: u64,

        #[structopt(long, help = "Print the symbols as a JSON object.")]
        json: bool,
    },
}

fn parse_register_format(s: &str) -> Result<RegisterFormat, String> {
    match s {
        "amd64" => Ok(RegisterFormat::Layout(RegisterLayout::amd64())),
        _ => s
            .parse::<usize>()
            .map(RegisterFormat::Raw)
            .map_err(|e| format!("`{}' is neither `amd64' nor a size: {}", s, e)),
    }
}

fn parse_block_kinds(s: &str) -> Result<BlockKinds, String> {
    BlockKinds::from_tags(s).ok_or_else(|| format!("`{}' has a tag other than R, M, V or S", s))
}

fn parse_hex(s: &str) -> Result<u64, ParseIntError> {
    u64::from_str_radix(s.trim_start_matches("0x"), 16)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_dump_test() {
        let options = RdTraceOptions::from_iter(&["rdtrace", "dump", "buf.bin", "--regs", "12", "--blocks", "MV"]);
        match options.cmd {
            RdTraceSubCommand::Dump {
                file,
                pid,
                json,
                regs,
                blocks,
                ..
            } => {
                assert_eq!(file, PathBuf::from("buf.bin"));
                assert_eq!(pid, None);
                assert!(!json);
                assert_eq!(regs, RegisterFormat::Raw(12));
                assert_eq!(blocks, Some(BlockKinds::MEMORY | BlockKinds::VARIABLES));
            }
            other => panic!("unexpected {:?}", other),
        }
        assert!(RdTraceOptions::from_iter_safe(&["rdtrace", "dump", "b", "--blocks", "Q"]).is_err());

        let options = RdTraceOptions::from_iter(&["rdtrace", "dump", "libagent.so", "--pid", "412", "--bias", "7f00"]);
        match options.cmd {
            RdTraceSubCommand::Dump { pid, bias, .. } => {
                assert_eq!(pid, Some(412));
                assert_eq!(bias, 0x7f00);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn parse_symbols_test() {
        let options = RdTraceOptions::from_iter(&["rdtrace", "symbols", "libagent.so", "--bias", "0x7f0000"]);
        match options.cmd {
            RdTraceSubCommand::Symbols { bias, json, .. } => {
                assert_eq!(bias, 0x7f0000);
                assert!(!json);
            }
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(parse_register_format("amd64").unwrap().block_size(), RegisterLayout::amd64().size());
    }
}
