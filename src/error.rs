use crate::target::CoreAddr;
use std::{error, fmt, io};

pub type Result<T> = std::result::Result<T, TraceError>;

#[derive(Debug)]
pub enum TraceError {
    /// The inferior (or agent) memory could not be read or written.
    MemoryAccess { addr: CoreAddr, len: usize },
    DuplicateTracepoint { number: u32, address: CoreAddr },
    NoSuchTracepoint { number: u32, address: CoreAddr },
    InvalidTracepointNumber(u32),
    /// Fast and static tracepoints cannot be used without the in-process agent.
    AgentNotLoaded,
    Install {
        number: u32,
        address: CoreAddr,
        reason: String,
    },
    Symbol(String),
    Download(String),
    MalformedExpression(String),
    BadBufferOffset { offset: u64, total: u64 },
    Io(io::Error),
    Os(nix::Error),
}

impl fmt::Display for TraceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TraceError::MemoryAccess { addr, len } => {
                write!(f, "cannot access {} bytes of memory at {:#x}", len, addr)
            }
            TraceError::DuplicateTracepoint { number, address } => write!(
                f,
                "tracepoint {} at {:#x} is already defined",
                number, address
            ),
            TraceError::NoSuchTracepoint { number, address } => {
                write!(f, "no tracepoint {} at {:#x}", number, address)
            }
            TraceError::InvalidTracepointNumber(n) => write!(f, "invalid tracepoint number {}", n),
            TraceError::AgentNotLoaded => {
                write!(f, "in-process agent library not loaded in process")
            }
            TraceError::Install {
                number,
                address,
                reason,
            } => write!(
                f,
                "failed to install tracepoint {} at {:#x}: {}",
                number, address, reason
            ),
            TraceError::Symbol(name) => write!(f, "agent symbol `{}' not found", name),
            TraceError::Download(msg) => write!(f, "download: {}", msg),
            TraceError::MalformedExpression(msg) => write!(f, "malformed agent expression: {}", msg),
            TraceError::BadBufferOffset { offset, total } => write!(
                f,
                "offset {} is past the {} bytes of trace data",
                offset, total
            ),
            TraceError::Io(e) => write!(f, "{}", e),
            TraceError::Os(e) => write!(f, "{}", e),
        }
    }
}

impl error::Error for TraceError {
    fn source(&self) -> Option<&(dyn error::Error + 'static)> {
        match self {
            TraceError::Io(e) => Some(e),
            TraceError::Os(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for TraceError {
    fn from(e: io::Error) -> Self {
        TraceError::Io(e)
    }
}

impl From<nix::Error> for TraceError {
    fn from(e: nix::Error) -> Self {
        TraceError::Os(e)
    }
}
