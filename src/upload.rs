//! Moving frames the agent collected into the monitor's buffer.
//!
//! The agent's buffer is only ever read and advanced here, from outside,
//! while a breakpoint on `about_to_request_buffer_space` keeps any agent
//! thread from committing a new control block behind our back.

use crate::{
    error::{Result, TraceError},
    log::LogDebug,
    symbols::AgentSymbols,
    target::{Breakpoints, CoreAddr, TargetMemory, ThreadControl},
    trace_buffer::{
        control::{SyncToken, TraceBufferControl},
        frame::{TraceFrameHeader, TRACEFRAME_HEADER_SIZE},
        sync::{read_control_slot, read_counters, read_token, write_control_slot, write_token},
        MonitorBuffer,
    },
};

const HEADER_SIZE: u64 = TRACEFRAME_HEADER_SIZE as u64;

#[derive(Copy, Clone, Default, Eq, PartialEq, Debug)]
pub struct UploadOutcome {
    /// Frames taken out of the agent's buffer.
    pub uploaded: u32,
    /// Some frame did not fit in the monitor's buffer and was dropped.
    pub buffer_full: bool,
}

/// The agent's buffer as found in its control slot.
struct AgentBufferView {
    ctrl: TraceBufferControl,
    lo: CoreAddr,
    hi: CoreAddr,
}

impl AgentBufferView {
    fn next_frame(&self, tf: CoreAddr, header: &TraceFrameHeader) -> CoreAddr {
        let next = tf + HEADER_SIZE + header.data_size as u64;
        if next >= self.ctrl.wrap {
            next - (self.ctrl.wrap - self.lo)
        } else {
            next
        }
    }

    /// Frame data, which may continue at `lo` past the wrap point.
    fn read_data<T: TargetMemory + ?Sized>(
        &self,
        mem: &mut T,
        tf: CoreAddr,
        header: &TraceFrameHeader,
    ) -> Result<Vec<u8>> {
        let len = header.data_size as u64;
        let mut data = vec![0u8; len as usize];
        let mut addr = tf + HEADER_SIZE;
        if addr >= self.ctrl.wrap {
            addr -= self.ctrl.wrap - self.lo;
        }
        let first = if addr + len > self.ctrl.wrap {
            self.ctrl.wrap - addr
        } else {
            len
        };
        mem.read_memory(addr, &mut data[..first as usize])?;
        if first < len {
            mem.read_memory(self.lo, &mut data[first as usize..])?;
        }
        Ok(data)
    }
}

/// Drain the agent's completed frames into `buffer`.
///
/// Frames that do not fit are dropped and reported through
/// `buffer_full`; stopping the run then is up to the caller. Nothing
/// happens when the agent's counters cannot be read, which is normal
/// while its thread is running.
pub fn upload_fast_traceframes<T>(
    inferior: &mut T,
    syms: &AgentSymbols,
    buffer: &mut MonitorBuffer,
) -> Result<UploadOutcome>
where
    T: TargetMemory + Breakpoints + ThreadControl + ?Sized,
{
    let racy = match read_counters(inferior, syms) {
        Ok(counters) => counters,
        Err(e) => {
            log!(LogDebug, "can't read the agent's frame counters: {}", e);
            return Ok(UploadOutcome::default());
        }
    };
    log!(
        LogDebug,
        "ipa_traceframe_count (racy area): {} (w={}, r={})",
        racy.live(),
        racy.write_count,
        racy.read_count
    );
    if racy.live() == 0 {
        return Ok(UploadOutcome::default());
    }

    let bkpt = inferior.insert_breakpoint(syms.about_to_request_buffer_space)?;
    let result = drain(inferior, syms, buffer);

    inferior.pause_all(true);
    inferior.cancel_breakpoint_hits();
    let removed = inferior.remove_breakpoint(bkpt);
    inferior.unpause_all(true);

    let outcome = result?;
    removed?;
    Ok(outcome)
}

fn drain<T: TargetMemory + ?Sized>(
    inferior: &mut T,
    syms: &AgentSymbols,
    buffer: &mut MonitorBuffer,
) -> Result<UploadOutcome> {
    let old = read_token(inferior, syms)?;
    // Same slot, fresh counters and our stamp: any agent commit racing
    // with us is now stale.
    let token = old.monitor_commit();
    write_token(inferior, syms, token)?;
    log!(LogDebug, "Lib: Committed {:#010x} -> {:#010x}", old.0, token.0);
    let slot = token.slot();

    // Re-read now that the breakpoint is in: a thread may have finished
    // a frame since the racy read.
    let mut counters = read_counters(inferior, syms)?;
    let mut view = AgentBufferView {
        ctrl: read_control_slot(inferior, syms, slot)?,
        lo: inferior.read_u64(syms.trace_buffer_lo)?,
        hi: inferior.read_u64(syms.trace_buffer_hi)?,
    };
    log!(
        LogDebug,
        "Lib: Trace buffer [{}] start={} free={} endfree={} wrap={} hi={}",
        slot,
        view.ctrl.start - view.lo,
        view.ctrl.free - view.lo,
        view.ctrl.end_free - view.lo,
        view.ctrl.wrap - view.lo,
        view.hi - view.lo
    );

    let mut outcome = UploadOutcome::default();
    let mut tf = view.ctrl.start;
    while counters.live() != 0 {
        let header = TraceFrameHeader::read(inferior, tf).map_err(|_| {
            TraceError::Download(format!("Uploading: couldn't read traceframe at {:#x}", tf))
        })?;
        if header.is_end() {
            fatal!(
                "Uploading: No (more) fast traceframes, but ipa_traceframe_count == {}??",
                counters.live()
            );
        }

        match buffer.add_traceframe(header.tpnum)? {
            None => {
                outcome.buffer_full = true;
                log!(LogDebug, "Uploading: trace buffer is full");
            }
            Some(mut frame) => {
                let data = view.read_data(inferior, tf, &header)?;
                if !buffer.add_block_bytes(&mut frame, &data)? {
                    log!(LogDebug, "Uploading: traceframe didn't fit");
                    outcome.buffer_full = true;
                }
                buffer.finish_traceframe(frame)?;
            }
        }

        tf = view.next_frame(tf, &header);
        if tf < view.ctrl.start {
            log!(LogDebug, "Lib: Discarding past the wraparound");
            view.ctrl.wrap = view.hi;
        }
        view.ctrl.start = tf;
        view.ctrl.end_free = tf;
        counters.read_count = counters.read_count.wrapping_add(1);
        outcome.uploaded += 1;

        if view.ctrl.start == view.ctrl.free && view.ctrl.start == view.ctrl.end_free {
            log!(LogDebug, "Lib: buffer is fully empty");
            view.ctrl = TraceBufferControl::cleared(view.lo, view.hi);
            tf = view.lo;
        }
    }

    write_control_slot(inferior, syms, slot, &view.ctrl)?;
    inferior.write_u32(syms.traceframe_read_count, counters.read_count)?;
    log!(
        LogDebug,
        "Done uploading {} traceframes [{}]",
        outcome.uploaded,
        slot
    );
    Ok(outcome)
}

/// Empty the agent's buffer and reset its counters. Only valid while no
/// agent thread can run.
pub fn clear_agent_trace_buffer<T: TargetMemory + ?Sized>(inferior: &mut T, syms: &AgentSymbols) -> Result<()> {
    let lo = inferior.read_u64(syms.trace_buffer_lo)?;
    let hi = inferior.read_u64(syms.trace_buffer_hi)?;
    write_control_slot(inferior, syms, 0, &TraceBufferControl::cleared(lo, hi))?;
    write_token(inferior, syms, SyncToken(0))?;
    inferior.write_memory(lo, &TraceFrameHeader::END.encode())?;
    inferior.write_u32(syms.traceframe_write_count, 0)?;
    inferior.write_u32(syms.traceframe_read_count, 0)?;
    inferior.write_u32(syms.traceframes_created, 0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        test_support::{AgentImage, FakeInferior, SharedMemory},
        trace_buffer::{
            frame::{BlockIter, TraceBlock, BLOCK_MEMORY, MEMORY_BLOCK_HEADER_SIZE},
            sync::{AgentSync, NoRendezvous},
            TraceBuffer,
        },
    };

    type AgentBuffer = TraceBuffer<SharedMemory, AgentSync<SharedMemory>>;

    fn agent_buffer(image: &AgentImage) -> AgentBuffer {
        TraceBuffer::new(
            image.mem.clone(),
            AgentSync::new(image.syms, Box::new(NoRendezvous)),
            image.buffer_lo,
            image.buffer_hi,
        )
    }

    fn memory_block(len: usize, fill: u8) -> Vec<u8> {
        let mut block = vec![BLOCK_MEMORY];
        block.extend_from_slice(&0x1000u64.to_le_bytes());
        block.extend_from_slice(&(len as u16).to_le_bytes());
        block.extend(std::iter::repeat(fill).take(len));
        block
    }

    /// A frame with one memory block of `len` bytes of `fill`.
    fn agent_frame(buf: &mut AgentBuffer, tpnum: u16, len: usize, fill: u8) -> bool {
        let mut frame = match buf.add_traceframe(tpnum).unwrap() {
            Some(frame) => frame,
            None => return false,
        };
        let ok = buf.add_block_bytes(&mut frame, &memory_block(len, fill)).unwrap();
        buf.finish_traceframe(frame).unwrap();
        ok
    }

    #[test]
    fn nothing_to_upload_test() {
        let image = AgentImage::new(256);
        let mut inferior = FakeInferior::new(image.mem.clone());
        let mut monitor = MonitorBuffer::monitor(1024, false);
        let outcome = upload_fast_traceframes(&mut inferior, &image.syms, &mut monitor).unwrap();
        assert_eq!(outcome, UploadOutcome::default());
        // Not even the rendezvous breakpoint was set.
        assert_eq!(inferior.removed, 0);
        assert_eq!(inferior.pause_calls, 0);
    }

    #[test]
    fn upload_copies_frames_test() {
        let image = AgentImage::new(256);
        let mut agent = agent_buffer(&image);
        assert!(agent_frame(&mut agent, 7, 4, 0xaa));
        assert!(agent_frame(&mut agent, 8, 2, 0xbb));

        let mut inferior = FakeInferior::new(image.mem.clone());
        let mut monitor = MonitorBuffer::monitor(1024, false);
        let outcome = upload_fast_traceframes(&mut inferior, &image.syms, &mut monitor).unwrap();
        assert_eq!(outcome.uploaded, 2);
        assert!(!outcome.buffer_full);

        let frames = monitor.frames().unwrap();
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0].header.tpnum, 7);
        assert_eq!(frames[1].header.tpnum, 8);
        let data = monitor.read_frame_data(&frames[0]).unwrap();
        match BlockIter::new(&data, 0).next() {
            Some(TraceBlock::Memory { addr, data }) => {
                assert_eq!(addr, 0x1000);
                assert_eq!(data, &[0xaa; 4][..]);
            }
            other => panic!("unexpected block {:?}", other),
        }

        // The agent's side is empty again and its token carries our stamp.
        let counters = agent.counters().unwrap();
        assert_eq!(counters.live(), 0);
        assert_eq!(counters.created, 2);
        let ctrl = agent.control().unwrap();
        assert_eq!(ctrl, TraceBufferControl::cleared(image.buffer_lo, image.buffer_hi));
        assert!(read_token(&mut inferior, &image.syms).unwrap().monitor_stamped());
        assert!(inferior.breakpoints.is_empty());
        assert_eq!(inferior.cancel_calls, 1);
        assert_eq!(inferior.paused, 0);

        // The agent keeps collecting where the monitor left it.
        assert!(agent_frame(&mut agent, 9, 1, 0xcc));
        assert_eq!(agent.frames().unwrap().len(), 1);
    }

    #[test]
    fn upload_into_full_monitor_test() {
        let image = AgentImage::new(256);
        let mut agent = agent_buffer(&image);
        assert!(agent_frame(&mut agent, 1, 40, 1));
        assert!(agent_frame(&mut agent, 2, 40, 2));

        let mut inferior = FakeInferior::new(image.mem.clone());
        // Room for the first frame only.
        let mut monitor = MonitorBuffer::monitor(66, false);
        let outcome = upload_fast_traceframes(&mut inferior, &image.syms, &mut monitor).unwrap();
        assert_eq!(outcome.uploaded, 2);
        assert!(outcome.buffer_full);
        assert_eq!(monitor.frames().unwrap().len(), 1);
        assert_eq!(agent.counters().unwrap().live(), 0);
    }

    #[test]
    fn upload_wrapped_frames_test() {
        let image = AgentImage::new(128);
        let mut agent = agent_buffer(&image);
        let mut inferior = FakeInferior::new(image.mem.clone());
        let mut monitor = MonitorBuffer::monitor(4096, false);

        assert!(agent_frame(&mut agent, 1, 30, 1));
        assert!(agent_frame(&mut agent, 2, 30, 2));
        // Frame 3 is still being collected when the monitor drains.
        let mut third = agent.add_traceframe(3).unwrap().unwrap();
        let outcome = upload_fast_traceframes(&mut inferior, &image.syms, &mut monitor).unwrap();
        assert_eq!(outcome.uploaded, 2);

        // Its data no longer fits above it and continues at the bottom.
        assert!(agent.add_block_bytes(&mut third, &memory_block(30, 3)).unwrap());
        agent.finish_traceframe(third).unwrap();
        assert!(agent.control().unwrap().wrap < image.buffer_hi);
        assert!(agent_frame(&mut agent, 4, 30, 4));

        let outcome = upload_fast_traceframes(&mut inferior, &image.syms, &mut monitor).unwrap();
        assert_eq!(outcome.uploaded, 2);
        let frames = monitor.frames().unwrap();
        assert_eq!(frames.len(), 4);
        for f in frames {
            let data = monitor.read_frame_data(&f).unwrap();
            assert_eq!(data.len(), MEMORY_BLOCK_HEADER_SIZE + 30);
            let expected = f.header.tpnum as u8;
            assert!(data[MEMORY_BLOCK_HEADER_SIZE..].iter().all(|b| *b == expected));
        }
        assert_eq!(
            agent.control().unwrap(),
            TraceBufferControl::cleared(image.buffer_lo, image.buffer_hi)
        );
    }

    #[test]
    fn clear_agent_buffer_test() {
        let image = AgentImage::new(256);
        let mut agent = agent_buffer(&image);
        assert!(agent_frame(&mut agent, 1, 8, 1));
        let mut mem = image.mem.clone();
        clear_agent_trace_buffer(&mut mem, &image.syms).unwrap();
        assert_eq!(agent.counters().unwrap(), Default::default());
        assert!(agent.frames().unwrap().is_empty());
    }
}
