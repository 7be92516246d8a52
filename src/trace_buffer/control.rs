use crate::target::CoreAddr;
use bit_field::BitField;
use std::mem::size_of;

/// The four pointers describing the live part of a trace buffer.
///
/// Layout (and size) is shared with the agent's exported control slots, so
/// this is `repr(C)` and only ever moved across the process boundary through
/// `encode`/`decode`.
#[repr(C)]
#[derive(Copy, Clone, Default, Eq, PartialEq, Debug)]
pub struct TraceBufferControl {
    /// Oldest live frame.
    pub start: CoreAddr,
    /// Where the next allocation goes. A zeroed frame header always sits here.
    pub free: CoreAddr,
    /// End of the contiguous free run beginning at `free`.
    pub end_free: CoreAddr,
    /// Frames reaching this address continue at the start of the region.
    pub wrap: CoreAddr,
}

assert_eq_size!(TraceBufferControl, [u8; 32]);

pub const TRACE_BUFFER_CONTROL_SIZE: usize = size_of::<TraceBufferControl>();

impl TraceBufferControl {
    /// An empty buffer covering `[lo, hi)`.
    pub fn cleared(lo: CoreAddr, hi: CoreAddr) -> TraceBufferControl {
        TraceBufferControl {
            start: lo,
            free: lo,
            end_free: hi,
            wrap: hi,
        }
    }

    pub fn encode(&self) -> [u8; TRACE_BUFFER_CONTROL_SIZE] {
        let mut buf = [0u8; TRACE_BUFFER_CONTROL_SIZE];
        let fields = [
            (offset_of!(TraceBufferControl, start), self.start),
            (offset_of!(TraceBufferControl, free), self.free),
            (offset_of!(TraceBufferControl, end_free), self.end_free),
            (offset_of!(TraceBufferControl, wrap), self.wrap),
        ];
        for (offset, value) in fields.iter() {
            buf[*offset..*offset + 8].copy_from_slice(&value.to_le_bytes());
        }
        buf
    }

    pub fn decode(buf: &[u8; TRACE_BUFFER_CONTROL_SIZE]) -> TraceBufferControl {
        let field = |offset: usize| {
            let mut v = [0u8; 8];
            v.copy_from_slice(&buf[offset..offset + 8]);
            u64::from_le_bytes(v)
        };
        TraceBufferControl {
            start: field(offset_of!(TraceBufferControl, start)),
            free: field(offset_of!(TraceBufferControl, free)),
            end_free: field(offset_of!(TraceBufferControl, end_free)),
            wrap: field(offset_of!(TraceBufferControl, wrap)),
        }
    }
}

/// Number of control slots the agent keeps.
pub const CONTROL_SLOTS: usize = 3;

/// Everything above the slot index.
pub const GDBSERVER_FLUSH_COUNT_MASK: u32 = 0xffff_fff0;
pub const GDBSERVER_FLUSH_COUNT_MASK_PREV: u32 = 0x7ff0_0000;
pub const GDBSERVER_FLUSH_COUNT_MASK_CURR: u32 = 0x0007_ff00;
/// Set whenever the monitor (rather than the agent) wrote the token.
pub const GDBSERVER_UPDATED_FLUSH_COUNT_BIT: u32 = 0x8000_0000;

/// The packed word selecting the current control slot.
///
/// ```text
///  31   30..20   19   18..8   7..0
///  GSB    PC     -     CC     TBCI
/// ```
///
/// GSB is the monitor stamp, PC and CC the previous and current commit
/// counters, and TBCI the index of the current slot.
#[derive(Copy, Clone, Default, Eq, PartialEq, Debug)]
pub struct SyncToken(pub u32);

impl SyncToken {
    pub fn slot(self) -> usize {
        (self.0 & !GDBSERVER_FLUSH_COUNT_MASK) as usize
    }

    pub fn prev_counter(self) -> u32 {
        self.0.get_bits(20..31)
    }

    pub fn curr_counter(self) -> u32 {
        self.0.get_bits(8..19)
    }

    pub fn monitor_stamped(self) -> bool {
        self.0.get_bit(31)
    }

    fn pack(stamped: bool, prev: u32, curr: u32, slot: usize) -> SyncToken {
        let mut raw = 0u32;
        raw.set_bit(31, stamped);
        raw.set_bits(20..31, prev & 0x7ff);
        raw.set_bits(8..19, curr & 0x7ff);
        raw.set_bits(0..8, slot as u32);
        SyncToken(raw)
    }

    /// The token an agent publishes when committing `new_slot`: the current
    /// counter moves to "previous" and a fresh counter takes its place.
    pub fn agent_commit(self, new_slot: usize) -> SyncToken {
        let counter = (self.curr_counter() + 1) & 0x7ff;
        SyncToken::pack(false, self.curr_counter(), counter, new_slot)
    }

    /// The token the monitor writes when it takes over the buffer. It keeps
    /// the agent's slot and advances the counters the same way, so an agent
    /// racing with it can recognise its commit was superseded.
    pub fn monitor_commit(self) -> SyncToken {
        let counter = (self.curr_counter() + 1) & 0x7ff;
        SyncToken::pack(true, self.curr_counter(), counter, self.slot())
    }

    /// After publishing `commit`, did the agent's update take effect?
    ///
    /// It did if the token is still ours, or if the monitor has since written
    /// over it starting from our counter (so it saw our state).
    pub fn confirms(self, commit: SyncToken) -> bool {
        self == commit || self.prev_counter() == commit.curr_counter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn control_encode_test() {
        let ctrl = TraceBufferControl {
            start: 0x1000,
            free: 0x1020,
            end_free: 0x2000,
            wrap: 0x2000,
        };
        let bytes = ctrl.encode();
        assert_eq!(&bytes[8..16], &0x1020u64.to_le_bytes());
        assert_eq!(TraceBufferControl::decode(&bytes), ctrl);
        assert_eq!(
            TraceBufferControl::cleared(0x10, 0x50),
            TraceBufferControl {
                start: 0x10,
                free: 0x10,
                end_free: 0x50,
                wrap: 0x50
            }
        );
    }

    #[test]
    fn token_fields_test() {
        let t = SyncToken(0x8000_0000 | (5 << 20) | (6 << 8) | 2);
        assert!(t.monitor_stamped());
        assert_eq!(t.prev_counter(), 5);
        assert_eq!(t.curr_counter(), 6);
        assert_eq!(t.slot(), 2);
    }

    #[test]
    fn agent_commit_matches_masks_test() {
        let prev = SyncToken(0x8030_0401);
        let commit = prev.agent_commit(2);
        let commit_count = ((prev.0 & GDBSERVER_FLUSH_COUNT_MASK_CURR) + 0x100)
            & GDBSERVER_FLUSH_COUNT_MASK_CURR;
        let expected = ((prev.0 & GDBSERVER_FLUSH_COUNT_MASK_CURR) << 12) | commit_count | 2;
        assert_eq!(commit.0, expected);
        assert!(!commit.monitor_stamped());
    }

    #[test]
    fn counter_wraps_test() {
        let prev = SyncToken((0x7ff << 8) | 1);
        let commit = prev.agent_commit(2);
        assert_eq!(commit.curr_counter(), 0);
        assert_eq!(commit.prev_counter(), 0x7ff);
    }

    #[test]
    fn monitor_commit_test() {
        let agent = SyncToken(0).agent_commit(1);
        let monitor = agent.monitor_commit();
        assert!(monitor.monitor_stamped());
        assert_eq!(monitor.slot(), 1);
        assert_eq!(monitor.prev_counter(), agent.curr_counter());
        // The monitor started from our commit, so the commit stands.
        assert!(monitor.confirms(agent));
        // A monitor write based on an older token voids it.
        let stale = SyncToken(0).monitor_commit();
        assert!(!stale.confirms(agent));
    }
}
