use crate::log::LogWarn;
use std::env;

lazy_static! {
    static ref FLAGS: Flags = Flags::from_env();
}

/// Size of the monitor-side trace buffer unless told otherwise.
pub const DEFAULT_TRACE_BUFFER_SIZE: usize = 5 * 1024 * 1024;

/// Largest packet the controller accepts. A raw buffer chunk is hex encoded
/// so only half of that (less some framing) is payload.
pub const PBUFSIZ: usize = 16384;

pub const DEFAULT_MAX_BUFFER_CHUNK: usize = (PBUFSIZ - 16) / 2;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Flags {
    /// Bytes in the monitor's trace buffer.
    pub trace_buffer_size: usize,
    /// Discard the oldest frames instead of reporting the buffer full.
    pub circular_trace_buffer: bool,
    /// Cap for a single "read raw buffer" transfer.
    pub max_buffer_chunk: usize,
    /// Alignment of objects placed on the agent's heap and of jump pad entries.
    pub agent_heap_align: u64,
}

impl Default for Flags {
    fn default() -> Self {
        Flags {
            trace_buffer_size: DEFAULT_TRACE_BUFFER_SIZE,
            circular_trace_buffer: false,
            max_buffer_chunk: DEFAULT_MAX_BUFFER_CHUNK,
            agent_heap_align: 8,
        }
    }
}

impl Flags {
    pub fn get() -> &'static Flags {
        &*FLAGS
    }

    /// Defaults overridden by RDTRACE_BUFFER_SIZE, RDTRACE_CIRCULAR and RDTRACE_MAX_CHUNK.
    pub fn from_env() -> Flags {
        let mut flags = Flags::default();
        if let Some(size) = env_usize("RDTRACE_BUFFER_SIZE") {
            flags.trace_buffer_size = size;
        }
        if let Ok(circular) = env::var("RDTRACE_CIRCULAR") {
            flags.circular_trace_buffer = parse_bool(&circular);
        }
        if let Some(chunk) = env_usize("RDTRACE_MAX_CHUNK") {
            flags.max_buffer_chunk = chunk;
        }
        flags
    }
}

fn parse_bool(s: &str) -> bool {
    matches!(s.trim(), "1" | "true" | "yes" | "on")
}

fn env_usize(var: &str) -> Option<usize> {
    let value = env::var(var).ok()?;
    match parse_size(&value) {
        Some(n) => Some(n),
        None => {
            log!(LogWarn, "Ignoring unparseable {}=`{}'", var, value);
            None
        }
    }
}

/// Accepts plain decimal, `0x` hex, or a `k`/`m` suffix.
fn parse_size(s: &str) -> Option<usize> {
    let s = s.trim();
    if let Some(hex) = s.strip_prefix("0x") {
        return usize::from_str_radix(hex, 16).ok();
    }
    let (digits, multiplier) = match s.chars().last() {
        Some('k') | Some('K') => (&s[..s.len() - 1], 1024),
        Some('m') | Some('M') => (&s[..s.len() - 1], 1024 * 1024),
        _ => (s, 1),
    };
    digits.parse::<usize>().ok()?.checked_mul(multiplier)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_size_test() {
        assert_eq!(parse_size("4096"), Some(4096));
        assert_eq!(parse_size("0x100"), Some(256));
        assert_eq!(parse_size("64k"), Some(64 * 1024));
        assert_eq!(parse_size("5M"), Some(5 * 1024 * 1024));
        assert_eq!(parse_size("lots"), None);
    }

    #[test]
    fn default_chunk_test() {
        let flags = Flags::default();
        assert_eq!(flags.max_buffer_chunk, 8184);
        assert!(!flags.circular_trace_buffer);
    }
}
