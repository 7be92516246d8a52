use crate::{
    error::{Result, TraceError},
    log::LogDebug,
    target::{CoreAddr, TargetMemory},
};
use nix::unistd::Pid;
use std::{
    fs::{File, OpenOptions},
    io,
    os::unix::fs::FileExt,
};

/// Memory of a live (ptrace-stopped) process, accessed through `/proc/<pid>/mem`.
pub struct ProcessMemory {
    pid: Pid,
    mem_fd: File,
}

impl ProcessMemory {
    pub fn open(pid: Pid) -> Result<ProcessMemory> {
        let path = format!("/proc/{}/mem", pid);
        let mem_fd = OpenOptions::new().read(true).write(true).open(&path)?;
        log!(LogDebug, "opened {} for tracing", path);
        Ok(ProcessMemory { pid, mem_fd })
    }

    pub fn pid(&self) -> Pid {
        self.pid
    }
}

impl TargetMemory for ProcessMemory {
    fn read_memory(&mut self, addr: CoreAddr, buf: &mut [u8]) -> Result<()> {
        let mut all_read = 0;
        // Short reads are possible so keep going until we hit an error or EOF.
        while all_read < buf.len() {
            match self
                .mem_fd
                .read_at(&mut buf[all_read..], addr + all_read as u64)
            {
                Ok(0) => break,
                Ok(nread) => all_read += nread,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(_) => break,
            }
        }
        if all_read < buf.len() {
            return Err(TraceError::MemoryAccess {
                addr,
                len: buf.len(),
            });
        }
        Ok(())
    }

    fn write_memory(&mut self, addr: CoreAddr, data: &[u8]) -> Result<()> {
        let mut all_written = 0;
        while all_written < data.len() {
            match self
                .mem_fd
                .write_at(&data[all_written..], addr + all_written as u64)
            {
                Ok(0) => break,
                Ok(nwritten) => all_written += nwritten,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(_) => break,
            }
        }
        if all_written < data.len() {
            return Err(TraceError::MemoryAccess {
                addr,
                len: data.len(),
            });
        }
        Ok(())
    }
}
