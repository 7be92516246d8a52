use crate::commands::{
    exit_result::ExitResult,
    rdtrace_options::{RdTraceOptions, RdTraceSubCommand, RegisterFormat},
    TraceCommand,
};
use nix::unistd::Pid;
use rdtrace::{
    error::Result,
    log::{LogDebug, LogWarn},
    process_memory::ProcessMemory,
    regcache::{RegCache, RegisterLayout},
    symbols::{AgentSymbols, ElfSymbols},
    target::{CoreAddr, TargetMemory},
    trace_buffer::{
        frame::{BlockIter, BlockKinds, TraceBlock, TraceFrameHeader, TRACEFRAME_HEADER_SIZE},
        sync::{AgentSync, NoRendezvous},
        TraceBuffer,
    },
};
use serde::Serialize;
use std::{
    fmt::Write as FmtWrite,
    fs, io,
    io::{stdout, Write},
    path::PathBuf,
    sync::Arc,
};

pub struct DumpCommand {
    file: PathBuf,
    pid: Option<Pid>,
    bias: u64,
    json: bool,
    regs: RegisterFormat,
    layout: Option<Arc<RegisterLayout>>,
    blocks: BlockKinds,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct FrameJson {
    index: usize,
    offset: usize,
    tpnum: u16,
    data_size: u32,
    blocks: Vec<BlockJson>,
}

#[derive(Serialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
enum BlockJson {
    Registers { pc: Option<CoreAddr>, raw: String },
    Memory { address: CoreAddr, length: usize, bytes: String },
    Variable { number: u32, value: i64 },
    StaticData { length: usize, bytes: String },
}

fn hex(bytes: &[u8]) -> String {
    let mut s = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        write!(s, "{:02x}", b).unwrap_or(());
    }
    s
}

impl DumpCommand {
    pub fn new(options: &RdTraceOptions) -> DumpCommand {
        match options.cmd.clone() {
            RdTraceSubCommand::Dump {
                file,
                pid,
                bias,
                json,
                regs,
                blocks,
            } => {
                let mut command = DumpCommand::with_format(file, json, regs, blocks.unwrap_or_else(BlockKinds::all));
                command.pid = pid.map(Pid::from_raw);
                command.bias = bias;
                command
            }
            _ => panic!("Unexpected RdTraceSubCommand variant. Not a Dump variant!"),
        }
    }

    fn with_format(file: PathBuf, json: bool, regs: RegisterFormat, blocks: BlockKinds) -> DumpCommand {
        let layout = match &regs {
            RegisterFormat::Layout(layout) => Some(Arc::new(layout.clone())),
            RegisterFormat::Raw(_) => None,
        };
        DumpCommand {
            file,
            pid: None,
            bias: 0,
            json,
            regs,
            layout,
            blocks,
        }
    }

    fn pc(&self, raw: &[u8]) -> Option<CoreAddr> {
        let layout = self.layout.as_ref()?;
        RegCache::from_raw(layout.clone(), raw).ok().map(|regs| regs.read_pc())
    }

    /// Print every frame of `image`. Returns how many there were.
    fn dump_image(&self, image: &[u8], f: &mut dyn Write) -> io::Result<usize> {
        let mut offset = 0;
        let mut index = 0;
        while offset + TRACEFRAME_HEADER_SIZE <= image.len() {
            let mut raw_header = [0u8; TRACEFRAME_HEADER_SIZE];
            raw_header.copy_from_slice(&image[offset..offset + TRACEFRAME_HEADER_SIZE]);
            let header = TraceFrameHeader::decode(&raw_header);
            if header.is_end() {
                break;
            }
            let start = offset + TRACEFRAME_HEADER_SIZE;
            let end = start + header.data_size as usize;
            if end > image.len() {
                log!(
                    LogWarn,
                    "frame {} at offset {:#x} claims {} bytes but only {} remain",
                    index,
                    offset,
                    header.data_size,
                    image.len() - start
                );
                writeln!(f, "// frame {} at offset {:#x} is truncated", index, offset)?;
                break;
            }
            let data = &image[start..end];
            if self.json {
                self.dump_frame_json(index, offset, &header, data, f)?;
            } else {
                self.dump_frame(index, offset, &header, data, f)?;
            }
            offset = end;
            index += 1;
        }
        log!(LogDebug, "dumped {} frames from {} bytes", index, image.len());
        Ok(index)
    }

    /// Print the frames waiting in an agent's buffer, read through `mem`.
    fn dump_agent<M: TargetMemory>(&self, mut mem: M, syms: AgentSymbols, f: &mut dyn Write) -> Result<usize> {
        let lo = mem.read_u64(syms.trace_buffer_lo)?;
        let hi = mem.read_u64(syms.trace_buffer_hi)?;
        let mut buffer = TraceBuffer::new(mem, AgentSync::new(syms, Box::new(NoRendezvous)), lo, hi);
        let frames = buffer.frames()?;
        for frame in &frames {
            let data = buffer.read_frame_data(frame)?;
            let offset = (frame.addr - lo) as usize;
            if self.json {
                self.dump_frame_json(frame.index, offset, &frame.header, &data, f)?;
            } else {
                self.dump_frame(frame.index, offset, &frame.header, &data, f)?;
            }
        }
        log!(LogDebug, "dumped {} frames from the agent buffer at [{:#x}, {:#x})", frames.len(), lo, hi);
        Ok(frames.len())
    }

    fn dump_live(&self, pid: Pid, f: &mut dyn Write) -> Result<usize> {
        let syms = AgentSymbols::look_up(&ElfSymbols::open(&self.file, self.bias)?)?;
        self.dump_agent(ProcessMemory::open(pid)?, syms, f)
    }

    fn shown_blocks<'a>(&self, data: &'a [u8]) -> impl Iterator<Item = TraceBlock<'a>> {
        let blocks = self.blocks;
        BlockIter::new(data, self.regs.block_size()).filter(move |b| blocks.contains(b.kind()))
    }

    fn dump_frame(
        &self,
        index: usize,
        offset: usize,
        header: &TraceFrameHeader,
        data: &[u8],
        f: &mut dyn Write,
    ) -> io::Result<()> {
        writeln!(
            f,
            "frame {} at offset {:#x}: tracepoint {}, {} bytes",
            index, offset, header.tpnum, header.data_size
        )?;
        for block in self.shown_blocks(data) {
            match block {
                TraceBlock::Registers(raw) => match self.pc(raw) {
                    Some(pc) => writeln!(f, "  R pc {:#x}", pc)?,
                    None => writeln!(f, "  R {}", hex(raw))?,
                },
                TraceBlock::Memory { addr, data } => {
                    writeln!(f, "  M {:#x}, {} bytes: {}", addr, data.len(), hex(data))?
                }
                TraceBlock::Variable { number, value } => writeln!(f, "  V {} = {}", number, value)?,
                TraceBlock::StaticData(sdata) => writeln!(f, "  S {} bytes: {}", sdata.len(), hex(sdata))?,
            }
        }
        Ok(())
    }

    fn dump_frame_json(
        &self,
        index: usize,
        offset: usize,
        header: &TraceFrameHeader,
        data: &[u8],
        f: &mut dyn Write,
    ) -> io::Result<()> {
        let blocks = self
            .shown_blocks(data)
            .map(|block| match block {
                TraceBlock::Registers(raw) => BlockJson::Registers {
                    pc: self.pc(raw),
                    raw: hex(raw),
                },
                TraceBlock::Memory { addr, data } => BlockJson::Memory {
                    address: addr,
                    length: data.len(),
                    bytes: hex(data),
                },
                TraceBlock::Variable { number, value } => BlockJson::Variable { number, value },
                TraceBlock::StaticData(sdata) => BlockJson::StaticData {
                    length: sdata.len(),
                    bytes: hex(sdata),
                },
            })
            .collect();
        let frame = FrameJson {
            index,
            offset,
            tpnum: header.tpnum,
            data_size: header.data_size,
            blocks,
        };
        serde_json::to_writer(&mut *f, &frame)?;
        writeln!(f)
    }
}

impl TraceCommand for DumpCommand {
    fn run(&mut self) -> ExitResult<()> {
        if let Some(pid) = self.pid {
            let stdout = stdout();
            let mut out = stdout.lock();
            return match self.dump_live(pid, &mut out) {
                Ok(_) => ExitResult::Ok(()),
                Err(e) => {
                    log!(LogWarn, "Could not dump the agent buffer of {}: {}", pid, e);
                    ExitResult::err_from(e, 1)
                }
            };
        }
        let image = match fs::read(&self.file) {
            Ok(image) => image,
            Err(e) => {
                log!(LogWarn, "Could not read {:?}: {}", self.file, e);
                return ExitResult::err_from(e, 1);
            }
        };
        let stdout = stdout();
        let mut out = stdout.lock();
        match self.dump_image(&image, &mut out) {
            Ok(_) => ExitResult::Ok(()),
            Err(e) => ExitResult::err_from(e, 1),
        }
    }
}
