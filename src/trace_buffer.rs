//! The trace frame ring buffer.
//!
//! One implementation serves both sides. What differs between the monitor's
//! buffer and the agent's is how memory is reached (`TargetMemory`) and how
//! the control block is published (`BufferSync`).

pub mod control;
pub mod frame;
pub mod sync;

use crate::{
    error::{Result, TraceError},
    log::LogDebug,
    target::{CoreAddr, LocalMemory, TargetMemory},
};
use control::TraceBufferControl;
use frame::{TraceFrameHeader, DATA_SIZE_OFFSET, TRACEFRAME_HEADER_SIZE};
use serde::Serialize;
use sync::{BufferSync, FrameCounters, LocalSync};

const HEADER_SIZE: u64 = TRACEFRAME_HEADER_SIZE as u64;

/// A frame that is being filled in.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub struct TraceFrameBuilder {
    addr: CoreAddr,
    tpnum: u16,
    data_size: u32,
}

impl TraceFrameBuilder {
    pub fn addr(&self) -> CoreAddr {
        self.addr
    }

    pub fn tpnum(&self) -> u16 {
        self.tpnum
    }

    pub fn data_size(&self) -> u32 {
        self.data_size
    }
}

/// A complete frame found by walking the buffer.
#[derive(Copy, Clone, Eq, PartialEq, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FrameRef {
    pub index: usize,
    pub addr: CoreAddr,
    pub header: TraceFrameHeader,
}

/// Result of a raw buffer read.
#[derive(Clone, Eq, PartialEq, Debug)]
pub enum RawChunk {
    /// The offset is exactly the end of the data.
    End,
    Data(Vec<u8>),
}

pub struct TraceBuffer<M, S> {
    mem: M,
    sync: S,
    lo: CoreAddr,
    hi: CoreAddr,
    /// Header of the frame being collected. Never discarded to make room.
    in_progress: Option<CoreAddr>,
}

/// The buffer the monitor owns.
pub type MonitorBuffer = TraceBuffer<LocalMemory, LocalSync>;

impl MonitorBuffer {
    /// A cleared monitor buffer of `size` bytes.
    pub fn monitor(size: usize, circular: bool) -> MonitorBuffer {
        let mem = LocalMemory::new(0, size);
        let (lo, hi) = (mem.base(), mem.end());
        TraceBuffer {
            mem,
            sync: LocalSync::new(lo, hi, circular),
            lo,
            hi,
            in_progress: None,
        }
    }

    pub fn set_circular(&mut self, circular: bool) {
        self.sync.set_circular(circular);
    }

    pub fn circular(&self) -> bool {
        self.sync.circular()
    }

    pub fn as_slice(&self) -> &[u8] {
        self.mem.as_slice()
    }
}

impl<M: TargetMemory, S: BufferSync<M>> TraceBuffer<M, S> {
    /// Wrap an existing region. Call `clear` before first use unless the
    /// region already holds a valid buffer.
    pub fn new(mem: M, sync: S, lo: CoreAddr, hi: CoreAddr) -> TraceBuffer<M, S> {
        TraceBuffer {
            mem,
            sync,
            lo,
            hi,
            in_progress: None,
        }
    }

    pub fn lo(&self) -> CoreAddr {
        self.lo
    }

    pub fn hi(&self) -> CoreAddr {
        self.hi
    }

    pub fn size(&self) -> u64 {
        self.hi - self.lo
    }

    pub fn memory(&self) -> &M {
        &self.mem
    }

    pub fn memory_mut(&mut self) -> &mut M {
        &mut self.mem
    }

    pub fn sync_mut(&mut self) -> &mut S {
        &mut self.sync
    }

    pub fn split_mut(&mut self) -> (&mut M, &mut S) {
        (&mut self.mem, &mut self.sync)
    }

    /// Drop every frame and reset the counters.
    pub fn clear(&mut self) -> Result<()> {
        let ctrl = TraceBufferControl::cleared(self.lo, self.hi);
        self.sync.reset_control(&mut self.mem, ctrl)?;
        self.write_end_marker(self.lo)?;
        self.sync
            .set_counters(&mut self.mem, FrameCounters::default())?;
        self.in_progress = None;
        Ok(())
    }

    pub fn control(&mut self) -> Result<TraceBufferControl> {
        self.sync.current_control(&mut self.mem)
    }

    pub fn counters(&mut self) -> Result<FrameCounters> {
        self.sync.counters(&mut self.mem)
    }

    pub fn set_counters(&mut self, counters: FrameCounters) -> Result<()> {
        self.sync.set_counters(&mut self.mem, counters)
    }

    /// Complete frames in the buffer.
    pub fn frame_count(&mut self) -> Result<u32> {
        Ok(self.counters()?.live())
    }

    /// Total free bytes. Not necessarily allocatable in one piece when the
    /// free space is split in two.
    pub fn free_space(&mut self) -> Result<u64> {
        let c = self.control()?;
        if c.free <= c.end_free {
            Ok(c.end_free - c.free)
        } else {
            Ok((c.end_free - self.lo) + (self.hi - c.free))
        }
    }

    /// Bytes of frame data between `start` and `free`.
    pub fn used_bytes(&mut self) -> Result<u64> {
        let c = self.control()?;
        if c.start <= c.free {
            Ok(c.free - c.start)
        } else {
            Ok((c.wrap - c.start) + (c.free - self.lo))
        }
    }

    fn log_control(&self, what: &str, c: &TraceBufferControl) {
        if is_logging!(LogDebug) {
            log!(
                LogDebug,
                "{}: start={} free={} endfree={} wrap={} hi={}",
                what,
                c.start - self.lo,
                c.free - self.lo,
                c.end_free - self.lo,
                c.wrap - self.lo,
                self.hi - self.lo
            );
        }
    }

    fn write_end_marker(&mut self, addr: CoreAddr) -> Result<()> {
        self.mem
            .write_memory(addr, &TraceFrameHeader::END.encode())
    }

    /// Carve `amt` contiguous bytes out of the buffer. `None` means full.
    ///
    /// Room for an end marker is reserved past every allocation, and the
    /// marker is written there once the allocation is committed.
    pub fn alloc(&mut self, amt: usize) -> Result<Option<CoreAddr>> {
        log!(
            LogDebug,
            "Want to allocate {}+{} bytes in trace buffer",
            amt,
            TRACEFRAME_HEADER_SIZE
        );
        let amt = amt as u64 + HEADER_SIZE;

        loop {
            let mut attempt = self.sync.begin_update(&mut self.mem)?;
            self.log_control("Trace buffer", &attempt.ctrl);

            let mut discarded = false;
            let found = loop {
                let c = &mut attempt.ctrl;
                // With two free parts, try the upper one first.
                if c.end_free < c.free {
                    if c.free + amt <= self.hi {
                        break true;
                    }
                    log!(LogDebug, "Upper part too small, setting wraparound");
                    c.wrap = c.free;
                    c.free = self.lo;
                }

                if c.free + amt <= c.end_free {
                    break true;
                }

                if !self.sync.may_discard() {
                    log!(LogDebug, "Not enough space in the trace buffer");
                    break false;
                }
                if !self.discard_oldest(&mut attempt.ctrl)? {
                    break false;
                }
                discarded = true;
            };

            if !found {
                if discarded {
                    self.sync.commit_update(&mut self.mem, &attempt)?;
                }
                if self.sync.out_of_space(&mut self.mem, &attempt)? {
                    log!(LogDebug, "trace buffer flushed, retrying");
                    continue;
                }
                return Ok(None);
            }

            let rslt = attempt.ctrl.free;
            attempt.ctrl.free += amt - HEADER_SIZE;
            if !self.sync.commit_update(&mut self.mem, &attempt)? {
                continue;
            }

            self.write_end_marker(attempt.ctrl.free)?;
            log!(LogDebug, "Allocated {} bytes", amt - HEADER_SIZE);
            self.log_control("Trace buffer", &attempt.ctrl);
            return Ok(Some(rslt));
        }
    }

    /// Drop the oldest frame to make room. False if there is nothing that
    /// may be dropped.
    fn discard_oldest(&mut self, ctrl: &mut TraceBufferControl) -> Result<bool> {
        let oldest = ctrl.start;
        if self.in_progress == Some(oldest) {
            log!(LogDebug, "Only the frame being collected is left, cannot discard");
            return Ok(false);
        }
        let header = TraceFrameHeader::read(&mut self.mem, oldest)?;
        if header.is_end() {
            log!(LogDebug, "No traceframes to discard");
            return Ok(false);
        }

        let mut counters = self.sync.counters(&mut self.mem)?;
        counters.write_count = counters.write_count.wrapping_sub(1);
        self.sync.set_counters(&mut self.mem, counters)?;

        let new_start = self.next_frame_addr(oldest, &header, ctrl.wrap);
        // Freed the frame that wrapped around: back to the non-wrap case.
        if new_start < ctrl.start {
            log!(LogDebug, "Discarding past the wraparound");
            ctrl.wrap = self.hi;
        }
        ctrl.start = new_start;
        ctrl.end_free = new_start;

        if ctrl.start == ctrl.free {
            log!(LogDebug, "Discarded every frame, resetting the buffer");
            *ctrl = TraceBufferControl::cleared(self.lo, self.hi);
            self.write_end_marker(self.lo)?;
        }
        self.log_control("Discarded a traceframe", ctrl);
        Ok(true)
    }

    fn next_frame_addr(&self, addr: CoreAddr, header: &TraceFrameHeader, wrap: CoreAddr) -> CoreAddr {
        let next = addr + HEADER_SIZE + header.data_size as u64;
        if next >= wrap {
            next - (wrap - self.lo)
        } else {
            next
        }
    }

    /// Start a new frame for tracepoint `tpnum`.
    pub fn add_traceframe(&mut self, tpnum: u16) -> Result<Option<TraceFrameBuilder>> {
        let addr = match self.alloc(TRACEFRAME_HEADER_SIZE)? {
            Some(addr) => addr,
            None => return Ok(None),
        };
        let header = TraceFrameHeader {
            tpnum,
            data_size: 0,
        };
        self.mem.write_memory(addr, &header.encode())?;
        self.in_progress = Some(addr);
        Ok(Some(TraceFrameBuilder {
            addr,
            tpnum,
            data_size: 0,
        }))
    }

    /// Reserve `amt` bytes of block data in `frame`. The caller fills them in.
    pub fn add_traceframe_block(
        &mut self,
        frame: &mut TraceFrameBuilder,
        amt: usize,
    ) -> Result<Option<CoreAddr>> {
        let block = match self.alloc(amt)? {
            Some(block) => block,
            None => return Ok(None),
        };
        frame.data_size += amt as u32;
        self.mem
            .write_u32(frame.addr + DATA_SIZE_OFFSET, frame.data_size)?;
        Ok(Some(block))
    }

    /// Reserve and fill a block in one go. False if it did not fit.
    pub fn add_block_bytes(&mut self, frame: &mut TraceFrameBuilder, bytes: &[u8]) -> Result<bool> {
        match self.add_traceframe_block(frame, bytes.len())? {
            Some(addr) => {
                self.mem.write_memory(addr, bytes)?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    pub fn write_block(&mut self, addr: CoreAddr, bytes: &[u8]) -> Result<()> {
        self.mem.write_memory(addr, bytes)
    }

    pub fn finish_traceframe(&mut self, frame: TraceFrameBuilder) -> Result<()> {
        let mut counters = self.sync.counters(&mut self.mem)?;
        counters.write_count = counters.write_count.wrapping_add(1);
        counters.created = counters.created.wrapping_add(1);
        self.sync.set_counters(&mut self.mem, counters)?;
        if self.in_progress == Some(frame.addr) {
            self.in_progress = None;
        }
        Ok(())
    }

    /// Every complete frame, oldest first.
    pub fn frames(&mut self) -> Result<Vec<FrameRef>> {
        let ctrl = self.control()?;
        let mut frames = Vec::new();
        let mut addr = ctrl.start;
        let limit = (self.size() / HEADER_SIZE) as usize + 1;
        while frames.len() < limit {
            if Some(addr) == self.in_progress || addr < self.lo || addr + HEADER_SIZE > self.hi {
                break;
            }
            let header = TraceFrameHeader::read(&mut self.mem, addr)?;
            if header.is_end() {
                break;
            }
            frames.push(FrameRef {
                index: frames.len(),
                addr,
                header,
            });
            addr = self.next_frame_addr(addr, &header, ctrl.wrap);
        }
        Ok(frames)
    }

    pub fn find_traceframe(&mut self, num: usize) -> Result<Option<FrameRef>> {
        Ok(self.frames()?.into_iter().nth(num))
    }

    /// Read `len` bytes from `addr`, continuing at `lo` when `wrap` is reached.
    fn read_wrapped(&mut self, addr: CoreAddr, len: u64, wrap: CoreAddr) -> Result<Vec<u8>> {
        let mut out = vec![0u8; len as usize];
        let addr = if addr >= wrap { addr - (wrap - self.lo) } else { addr };
        let first = if addr + len > wrap {
            wrap.saturating_sub(addr).min(len)
        } else {
            len
        };
        self.mem
            .read_memory(addr, &mut out[..first as usize])?;
        if first < len {
            self.mem
                .read_memory(self.lo, &mut out[first as usize..])?;
        }
        Ok(out)
    }

    /// The blocks of a frame, reassembled if they straddle the wrap point.
    pub fn read_frame_data(&mut self, frame: &FrameRef) -> Result<Vec<u8>> {
        let ctrl = self.control()?;
        self.read_wrapped(
            frame.addr + HEADER_SIZE,
            frame.header.data_size as u64,
            ctrl.wrap,
        )
    }

    /// Up to `max` bytes of the live data starting `offset` bytes past `start`.
    pub fn read_raw(&mut self, offset: u64, max: usize) -> Result<RawChunk> {
        let total = self.used_bytes()?;
        log!(
            LogDebug,
            "Want to get trace buffer, {} bytes at offset {:#x}",
            max,
            offset
        );
        if offset == total {
            return Ok(RawChunk::End);
        }
        if offset > total {
            return Err(TraceError::BadBufferOffset { offset, total });
        }
        let ctrl = self.control()?;
        let len = (total - offset).min(max as u64);
        let data = self.read_wrapped(ctrl.start + offset, len, ctrl.wrap)?;
        Ok(RawChunk::Data(data))
    }
}
