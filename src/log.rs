//! Per-module logging configured from the environment.
//!
//! `RDTRACE_LOG` holds `module:level` pairs such as
//! `all:warn,trace_buffer:debug`; a module is the stem of its source file.
//! Output goes to stderr unless `RDTRACE_LOG_FILE` (truncate) or
//! `RDTRACE_APPEND_LOG_FILE` names a file, and is buffered when
//! `RDTRACE_LOG_BUFFER` gives a size.

use backtrace::Backtrace;
use nix::errno::{errno, Errno};
use std::{
    collections::HashMap,
    env,
    ffi::OsString,
    fs::{File, OpenOptions},
    io::{self, BufWriter, Write},
    path::Path,
    sync::{Mutex, MutexGuard},
};

#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Debug)]
pub enum LogLevel {
    LogFatal,
    LogError,
    LogWarn,
    LogInfo,
    LogDebug,
}

pub use LogLevel::*;

impl LogLevel {
    /// Unknown names mean `warn`.
    fn parse(s: &str) -> LogLevel {
        match s {
            "fatal" => LogFatal,
            "error" => LogError,
            "warn" => LogWarn,
            "info" => LogInfo,
            "debug" => LogDebug,
            _ => LogWarn,
        }
    }

    fn tag(self) -> &'static str {
        match self {
            LogFatal => "FATAL",
            LogError => "ERROR",
            LogWarn => "WARN",
            LogInfo => "INFO",
            LogDebug => "DEBUG",
        }
    }
}

/// Parsed `RDTRACE_LOG`.
#[derive(Clone, Debug, Eq, PartialEq)]
struct LogSpec {
    default_level: LogLevel,
    modules: HashMap<String, LogLevel>,
}

impl LogSpec {
    /// A spec that names no default logs everything else at debug.
    fn parse(spec: &str) -> LogSpec {
        let mut parsed = LogSpec {
            default_level: LogDebug,
            modules: HashMap::new(),
        };
        for pair in spec.split(',') {
            let (module, level) = match pair.find(':') {
                Some(colon) => (pair[..colon].trim(), LogLevel::parse(pair[colon + 1..].trim())),
                None => continue,
            };
            if module == "all" {
                parsed.default_level = level;
            } else {
                parsed.modules.insert(module.to_owned(), level);
            }
        }
        parsed
    }

    fn from_env() -> LogSpec {
        match env::var("RDTRACE_LOG") {
            Ok(spec) => LogSpec::parse(&spec),
            Err(_) => LogSpec {
                default_level: LogError,
                modules: HashMap::new(),
            },
        }
    }

    /// Module names are case sensitive, like the file names they come from.
    fn level_of(&self, module: &str) -> LogLevel {
        self.modules.get(module).copied().unwrap_or(self.default_level)
    }
}

fn module_of(filename: &str) -> &str {
    Path::new(filename)
        .file_stem()
        .and_then(|stem| stem.to_str())
        .unwrap_or(filename)
}

struct Logger {
    spec: LogSpec,
    /// Level per source file, filled in as files first log.
    levels: HashMap<&'static str, LogLevel>,
    sink: Box<dyn Write + Send>,
}

impl Logger {
    fn level_of(&mut self, filename: &'static str) -> LogLevel {
        let spec = &self.spec;
        *self
            .levels
            .entry(filename)
            .or_insert_with(|| spec.level_of(module_of(filename)))
    }
}

fn open_log_file(var: &str, append: bool) -> Option<Box<dyn Write + Send>> {
    let name: OsString = env::var_os(var)?;
    let opened = if append {
        OpenOptions::new().append(true).create(true).open(&name)
    } else {
        File::create(&name)
    };
    match opened {
        Ok(file) => Some(Box::new(file)),
        Err(e) => {
            eprintln!("Could not open `{:?}' from {}: {}. Logging to stderr", name, var, e);
            None
        }
    }
}

fn open_log_sink() -> Box<dyn Write + Send> {
    let sink = open_log_file("RDTRACE_LOG_FILE", false)
        .or_else(|| open_log_file("RDTRACE_APPEND_LOG_FILE", true))
        .unwrap_or_else(|| Box::new(io::stderr()));

    match env::var("RDTRACE_LOG_BUFFER").map(|size| (size.parse::<usize>(), size)) {
        Ok((Ok(capacity), _)) => Box::new(BufWriter::with_capacity(capacity, sink)),
        Ok((Err(_), size)) => {
            eprintln!("RDTRACE_LOG_BUFFER `{}' is not a number. Log is unbuffered", size);
            sink
        }
        Err(_) => sink,
    }
}

lazy_static! {
    static ref LOGGER: Mutex<Logger> = {
        // A failed registration only means a buffered log may lose its tail.
        unsafe {
            libc::atexit(flush_log_buffer);
        }
        Mutex::new(Logger {
            spec: LogSpec::from_env(),
            levels: HashMap::new(),
            sink: open_log_sink(),
        })
    };
}

/// A poisoned lock still holds a usable sink.
fn lock_logger() -> MutexGuard<'static, Logger> {
    match LOGGER.lock() {
        Ok(lock) => lock,
        Err(poisoned) => poisoned.into_inner(),
    }
}

extern "C" fn flush_log_buffer() {
    lock_logger().sink.flush().unwrap_or(());
}

pub fn write_prefix(stream: &mut dyn Write, level: LogLevel, filename: &str, line: u32) {
    write!(stream, "[{} {}:{}", level.tag(), filename, line).unwrap_or(());
    let err = errno();
    if level <= LogWarn && err != 0 {
        write!(stream, " errno: {:?}", Errno::from_i32(err)).unwrap_or(());
    }
    write!(stream, "] ").unwrap_or(());
}

/// One log line. Collected in memory and written out, newline terminated,
/// when dropped. Holds the logger lock meanwhile so lines never interleave.
pub struct LogLine {
    text: Vec<u8>,
    logger: MutexGuard<'static, Logger>,
}

impl Write for LogLine {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.text.extend_from_slice(buf);
        Ok(buf.len())
    }

    /// Does not flush the sink itself; that happens at exit.
    fn flush(&mut self) -> io::Result<()> {
        if !self.text.is_empty() {
            self.logger.sink.write_all(&self.text)?;
            self.text.clear();
        }
        Ok(())
    }
}

impl Drop for LogLine {
    fn drop(&mut self) {
        self.text.push(b'\n');
        self.flush().unwrap_or(());
    }
}

/// Start a line at `level` if `filename` logs at that level. Use log!() instead.
pub fn log(level: LogLevel, filename: &'static str, line: u32, always_enabled: bool) -> Option<LogLine> {
    let mut logger = lock_logger();
    if !always_enabled && level > logger.level_of(filename) {
        return None;
    }
    let mut log_line = LogLine {
        text: Vec::new(),
        logger,
    };
    if level == LogDebug {
        write!(log_line, "[{}] ", module_of(filename)).unwrap_or(());
    } else {
        write_prefix(&mut log_line, level, filename, line);
    }
    Some(log_line)
}

/// Use is_logging!() instead.
pub fn is_logging(level: LogLevel, filename: &'static str) -> bool {
    level <= lock_logger().level_of(filename)
}

/// Writes to the (possibly buffered) log, then carries on.
#[macro_export]
macro_rules! log {
    ($log_level:expr, $($args:tt)+) => {
        {
            use std::io::Write;
            if let Some(mut line) = $crate::log::log($log_level, file!(), line!(), false) {
                write!(line, $($args)+).unwrap_or(());
            }
        }
    };
}

#[macro_export]
macro_rules! is_logging {
    ($log_level:expr) => {
        $crate::log::is_logging($log_level, file!())
    };
}

/// Logs regardless of level, prints a backtrace to stderr and aborts.
#[macro_export]
macro_rules! fatal {
    ($($args:tt)+) => {
        {
            {
                use std::io::Write;
                if let Some(mut line) = $crate::log::log($crate::log::LogFatal, file!(), line!(), true) {
                    write!(line, $($args)+).unwrap_or(());
                }
            }
            $crate::log::notifying_abort(backtrace::Backtrace::new());
            unreachable!();
        }
    };
}

pub fn notifying_abort(bt: Backtrace) {
    flush_log_buffer();
    eprintln!("=== Start rdtrace backtrace:");
    eprintln!("{:?}", bt);
    eprintln!("=== End rdtrace backtrace");
    std::process::abort();
}
