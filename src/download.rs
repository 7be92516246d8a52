//! Handing tracepoint and variable definitions to the agent.
//!
//! The agent keeps its own copies, so the monitor serializes them into a
//! checksummed blob on the agent's heap and publishes where the blob is.
//!
//! ```text
//! "RDTP" version:u16 kind:u8 0:u8 count:u32 payload_len:u32 crc32:u32
//! record*
//! ```
//!
//! Every record starts with its own length so readers can skip it.

use crate::{
    agent_expr::AgentExpr,
    error::{Result, TraceError},
    log::LogDebug,
    symbols::AgentSymbols,
    target::{CoreAddr, TargetMemory},
    tracepoint::{Action, Tracepoint, TracepointDef, TracepointKind},
    tsv::{TraceStateVariable, TsvRegistry},
};
use crc32fast::Hasher;

pub const DOWNLOAD_MAGIC: &[u8; 4] = b"RDTP";
pub const DOWNLOAD_VERSION: u16 = 1;
pub const DOWNLOAD_HEADER_SIZE: usize = 20;

pub const SECTION_TRACEPOINTS: u8 = b'T';
pub const SECTION_VARIABLES: u8 = b'V';

const ACTION_STEPPING: u8 = 1;

/// An encoded section, with the offset of each record from the start of
/// the blob.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct DownloadBlob {
    pub bytes: Vec<u8>,
    pub record_offsets: Vec<usize>,
}

fn kind_code(kind: TracepointKind) -> u8 {
    match kind {
        TracepointKind::Trap => 0,
        TracepointKind::Fast => 1,
        TracepointKind::Static => 2,
    }
}

fn kind_from_code(code: u8) -> Result<TracepointKind> {
    match code {
        0 => Ok(TracepointKind::Trap),
        1 => Ok(TracepointKind::Fast),
        2 => Ok(TracepointKind::Static),
        _ => Err(TraceError::Download(format!("bad tracepoint kind {}", code))),
    }
}

fn encode_action(out: &mut Vec<u8>, action: &Action, stepping: bool) {
    out.push(if stepping { ACTION_STEPPING } else { 0 });
    out.push(action.tag());
    match action {
        Action::CollectMemory { addr, len, basereg } => {
            out.extend_from_slice(&addr.to_le_bytes());
            out.extend_from_slice(&len.to_le_bytes());
            out.extend_from_slice(&basereg.to_le_bytes());
        }
        Action::EvalExpr(expr) => {
            out.extend_from_slice(&(expr.len() as u32).to_le_bytes());
            out.extend_from_slice(expr.bytes());
        }
        Action::CollectRegisters | Action::CollectStaticData => (),
    }
}

fn encode_tracepoint(tp: &Tracepoint) -> Vec<u8> {
    let mut rec = Vec::new();
    rec.extend_from_slice(&tp.number.to_le_bytes());
    rec.extend_from_slice(&tp.address.to_le_bytes());
    rec.push(kind_code(tp.kind));
    rec.push(tp.enabled as u8);
    rec.extend_from_slice(&tp.step_count.to_le_bytes());
    rec.extend_from_slice(&tp.pass_count.to_le_bytes());
    rec.extend_from_slice(&tp.compiled_cond.unwrap_or(0).to_le_bytes());
    match &tp.cond {
        Some(cond) => {
            rec.extend_from_slice(&(cond.len() as u32).to_le_bytes());
            rec.extend_from_slice(cond.bytes());
        }
        None => rec.extend_from_slice(&0u32.to_le_bytes()),
    }
    let count = tp.actions.len() + tp.step_actions.len();
    rec.extend_from_slice(&(count as u32).to_le_bytes());
    for action in &tp.actions {
        encode_action(&mut rec, action, false);
    }
    for action in &tp.step_actions {
        encode_action(&mut rec, action, true);
    }
    rec
}

fn encode_tsv(tsv: &TraceStateVariable) -> Vec<u8> {
    let mut rec = Vec::new();
    rec.extend_from_slice(&tsv.number.to_le_bytes());
    rec.extend_from_slice(&tsv.initial_value.to_le_bytes());
    rec.extend_from_slice(&tsv.value.to_le_bytes());
    let name = tsv.name.as_deref().unwrap_or("").as_bytes();
    let name = &name[..name.len().min(u16::MAX as usize)];
    rec.extend_from_slice(&(name.len() as u16).to_le_bytes());
    rec.extend_from_slice(name);
    rec
}

fn encode_section(kind: u8, records: Vec<Vec<u8>>) -> DownloadBlob {
    let mut payload = Vec::new();
    let mut record_offsets = Vec::with_capacity(records.len());
    for rec in &records {
        record_offsets.push(DOWNLOAD_HEADER_SIZE + payload.len());
        payload.extend_from_slice(&((rec.len() + 4) as u32).to_le_bytes());
        payload.extend_from_slice(rec);
    }
    let mut hasher = Hasher::new();
    hasher.update(&payload);

    let mut bytes = Vec::with_capacity(DOWNLOAD_HEADER_SIZE + payload.len());
    bytes.extend_from_slice(DOWNLOAD_MAGIC);
    bytes.extend_from_slice(&DOWNLOAD_VERSION.to_le_bytes());
    bytes.push(kind);
    bytes.push(0);
    bytes.extend_from_slice(&(records.len() as u32).to_le_bytes());
    bytes.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    bytes.extend_from_slice(&hasher.finalize().to_le_bytes());
    bytes.extend_from_slice(&payload);
    DownloadBlob {
        bytes,
        record_offsets,
    }
}

/// Tracepoints the agent collects for: fast and static ones.
pub fn encode_tracepoints<'a, I: IntoIterator<Item = &'a Tracepoint>>(tps: I) -> DownloadBlob {
    let records = tps
        .into_iter()
        .filter(|tp| tp.kind.needs_agent())
        .map(encode_tracepoint)
        .collect();
    encode_section(SECTION_TRACEPOINTS, records)
}

/// Variables with a getter are not sent; the agent has its own built-ins.
pub fn encode_tsvs(tsvs: &TsvRegistry) -> DownloadBlob {
    let records = tsvs
        .iter()
        .filter(|tsv| tsv.getter.is_none())
        .map(encode_tsv)
        .collect();
    encode_section(SECTION_VARIABLES, records)
}

struct Reader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(data: &'a [u8]) -> Reader<'a> {
        Reader { data, pos: 0 }
    }

    fn bytes(&mut self, n: usize) -> Result<&'a [u8]> {
        let end = self.pos.checked_add(n);
        match end.and_then(|end| self.data.get(self.pos..end)) {
            Some(bytes) => {
                self.pos += n;
                Ok(bytes)
            }
            None => Err(TraceError::Download(format!(
                "record truncated at offset {}",
                self.pos
            ))),
        }
    }

    fn u8(&mut self) -> Result<u8> {
        Ok(self.bytes(1)?[0])
    }

    fn u16(&mut self) -> Result<u16> {
        let b = self.bytes(2)?;
        Ok(u16::from_le_bytes([b[0], b[1]]))
    }

    fn u32(&mut self) -> Result<u32> {
        let mut buf = [0u8; 4];
        buf.copy_from_slice(self.bytes(4)?);
        Ok(u32::from_le_bytes(buf))
    }

    fn u64(&mut self) -> Result<u64> {
        let mut buf = [0u8; 8];
        buf.copy_from_slice(self.bytes(8)?);
        Ok(u64::from_le_bytes(buf))
    }
}

/// Check the header and return `(record count, payload)`.
fn open_section(blob: &[u8], kind: u8) -> Result<(u32, &[u8])> {
    let mut r = Reader::new(blob);
    if r.bytes(4)? != DOWNLOAD_MAGIC {
        return Err(TraceError::Download("bad magic".into()));
    }
    let version = r.u16()?;
    if version != DOWNLOAD_VERSION {
        return Err(TraceError::Download(format!("unsupported version {}", version)));
    }
    let found = r.u8()?;
    if found != kind {
        return Err(TraceError::Download(format!(
            "expected section `{}', found `{}'",
            kind as char, found as char
        )));
    }
    r.u8()?;
    let count = r.u32()?;
    let len = r.u32()? as usize;
    let crc = r.u32()?;
    let payload = r.bytes(len)?;
    let mut hasher = Hasher::new();
    hasher.update(payload);
    if hasher.finalize() != crc {
        return Err(TraceError::Download("checksum mismatch".into()));
    }
    Ok((count, payload))
}

/// Split the payload into records, with each record's offset in the blob.
fn records(payload: &[u8], count: u32) -> Result<Vec<(usize, &[u8])>> {
    let mut r = Reader::new(payload);
    let mut out = Vec::with_capacity(count as usize);
    for _ in 0..count {
        let offset = DOWNLOAD_HEADER_SIZE + r.pos;
        let len = r.u32()? as usize;
        if len < 4 {
            return Err(TraceError::Download(format!("record of {} bytes", len)));
        }
        out.push((offset, r.bytes(len - 4)?));
    }
    if r.pos != payload.len() {
        return Err(TraceError::Download("trailing bytes after records".into()));
    }
    Ok(out)
}

fn decode_action(r: &mut Reader) -> Result<(bool, Action)> {
    let stepping = r.u8()? & ACTION_STEPPING != 0;
    let action = match r.u8()? {
        b'M' => {
            let addr = r.u64()?;
            let len = r.u64()?;
            let basereg = r.u32()? as i32;
            Action::CollectMemory { addr, len, basereg }
        }
        b'R' => Action::CollectRegisters,
        b'X' => {
            let len = r.u32()? as usize;
            Action::EvalExpr(AgentExpr::new(r.bytes(len)?.to_vec()))
        }
        b'L' => Action::CollectStaticData,
        tag => {
            return Err(TraceError::Download(format!(
                "unknown action `{}'",
                tag as char
            )))
        }
    };
    Ok((stepping, action))
}

fn decode_tracepoint(rec: &[u8]) -> Result<Tracepoint> {
    let mut r = Reader::new(rec);
    let mut def = TracepointDef::new(r.u32()?, r.u64()?);
    def.kind = kind_from_code(r.u8()?)?;
    def.enabled = r.u8()? != 0;
    def.step_count = r.u64()?;
    def.pass_count = r.u64()?;
    let compiled_cond = r.u64()?;
    let cond_len = r.u32()? as usize;
    if cond_len > 0 {
        def.cond = Some(AgentExpr::new(r.bytes(cond_len)?.to_vec()));
    }
    let mut tp = Tracepoint::from_def(def);
    if compiled_cond != 0 {
        tp.compiled_cond = Some(compiled_cond);
    }
    let count = r.u32()?;
    for _ in 0..count {
        match decode_action(&mut r)? {
            (true, action) => tp.step_actions.push(action),
            (false, action) => tp.actions.push(action),
        }
    }
    Ok(tp)
}

/// Decode a tracepoint blob that lives at `base` in the agent. Each
/// tracepoint's object address is where its record sits.
pub fn decode_tracepoints(blob: &[u8], base: CoreAddr) -> Result<Vec<Tracepoint>> {
    let (count, payload) = open_section(blob, SECTION_TRACEPOINTS)?;
    let mut tps = Vec::with_capacity(count as usize);
    for (offset, rec) in records(payload, count)? {
        let mut tp = decode_tracepoint(rec)?;
        tp.obj_addr_on_target = base + offset as u64;
        tps.push(tp);
    }
    Ok(tps)
}

pub fn decode_tsvs(blob: &[u8]) -> Result<Vec<TraceStateVariable>> {
    let (count, payload) = open_section(blob, SECTION_VARIABLES)?;
    let mut tsvs = Vec::with_capacity(count as usize);
    for (_, rec) in records(payload, count)? {
        let mut r = Reader::new(rec);
        let number = r.u32()?;
        let initial_value = r.u64()? as i64;
        let value = r.u64()? as i64;
        let name_len = r.u16()? as usize;
        let name = String::from_utf8_lossy(r.bytes(name_len)?).into_owned();
        tsvs.push(TraceStateVariable {
            number,
            name: if name.is_empty() { None } else { Some(name) },
            initial_value,
            value,
            getter: None,
        });
    }
    Ok(tsvs)
}

/// Bump allocator over the agent's heap. Nothing is ever freed.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct TargetHeap {
    next: CoreAddr,
    align: u64,
}

impl TargetHeap {
    /// Start where the agent says its heap begins.
    pub fn from_agent<M: TargetMemory + ?Sized>(
        mem: &mut M,
        syms: &AgentSymbols,
        align: u64,
    ) -> Result<TargetHeap> {
        let next = mem.read_u64(syms.gdb_tp_heap_buffer)?;
        Ok(TargetHeap::new(next, align))
    }

    pub fn new(next: CoreAddr, align: u64) -> TargetHeap {
        TargetHeap {
            next,
            align: align.max(1),
        }
    }

    pub fn alloc(&mut self, size: u64) -> CoreAddr {
        let ptr = self.next;
        let end = self.next + size;
        self.next = (end + self.align - 1) / self.align * self.align;
        ptr
    }

    pub fn next(&self) -> CoreAddr {
        self.next
    }
}

/// Write `blob` to the agent heap and publish it through the `(address,
/// length)` pair at `slot`. Returns where it went.
fn publish<M: TargetMemory + ?Sized>(
    mem: &mut M,
    heap: &mut TargetHeap,
    slot: CoreAddr,
    blob: &DownloadBlob,
) -> Result<CoreAddr> {
    let addr = heap.alloc(blob.bytes.len() as u64);
    mem.write_memory(addr, &blob.bytes)?;
    mem.write_u64(slot, addr)?;
    mem.write_u64(slot + 8, blob.bytes.len() as u64)?;
    Ok(addr)
}

/// Download the agent's tracepoints and variables. Sets each agent
/// tracepoint's `obj_addr_on_target`.
pub fn download_definitions<'a, M, I>(
    mem: &mut M,
    syms: &AgentSymbols,
    heap: &mut TargetHeap,
    tps: I,
    tsvs: &TsvRegistry,
) -> Result<()>
where
    M: TargetMemory + ?Sized,
    I: IntoIterator<Item = &'a mut Tracepoint>,
{
    let mut agent_tps: Vec<&mut Tracepoint> = tps
        .into_iter()
        .filter(|tp| tp.kind.needs_agent())
        .collect();
    let blob = encode_tracepoints(agent_tps.iter().map(|tp| &**tp));
    let base = publish(mem, heap, syms.tracepoints, &blob)?;
    for (tp, offset) in agent_tps.iter_mut().zip(&blob.record_offsets) {
        tp.obj_addr_on_target = base + *offset as u64;
        log!(
            LogDebug,
            "tracepoint {} at {:#x} downloaded to {:#x}",
            tp.number,
            tp.address,
            tp.obj_addr_on_target
        );
    }

    let blob = encode_tsvs(tsvs);
    let base = publish(mem, heap, syms.trace_state_variables, &blob)?;
    log!(
        LogDebug,
        "{} trace state variables downloaded to {:#x}",
        blob.record_offsets.len(),
        base
    );
    Ok(())
}

/// Fetch a published blob from the agent's memory: `(address, bytes)`.
pub fn fetch_published<M: TargetMemory + ?Sized>(mem: &mut M, slot: CoreAddr) -> Result<(CoreAddr, Vec<u8>)> {
    let addr = mem.read_u64(slot)?;
    let len = mem.read_u64(slot + 8)? as usize;
    let mut bytes = vec![0u8; len];
    mem.read_memory(addr, &mut bytes)?;
    Ok((addr, bytes))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::target::LocalMemory;

    fn sample_tracepoints() -> Vec<Tracepoint> {
        let mut fast = TracepointDef::new(3, 0x40_1000);
        fast.kind = TracepointKind::Fast;
        fast.pass_count = 9;
        fast.cond = Some(AgentExpr::from_hex("220127").unwrap());
        let mut fast = Tracepoint::from_def(fast);
        fast.compiled_cond = Some(0x7000);
        fast.actions = vec![
            Action::CollectMemory {
                addr: 0x10,
                len: 8,
                basereg: -1,
            },
            Action::CollectRegisters,
        ];
        fast.step_actions = vec![Action::EvalExpr(AgentExpr::from_hex("2c000127").unwrap())];

        let trap = Tracepoint::from_def(TracepointDef::new(4, 0x40_2000));

        let mut stat = TracepointDef::new(5, 0x40_3000);
        stat.kind = TracepointKind::Static;
        stat.enabled = false;
        let mut stat = Tracepoint::from_def(stat);
        stat.actions = vec![Action::CollectStaticData];
        vec![fast, trap, stat]
    }

    #[test]
    fn tracepoint_blob_test() {
        let tps = sample_tracepoints();
        let blob = encode_tracepoints(&tps);
        // The trap tracepoint stays with the monitor.
        assert_eq!(blob.record_offsets.len(), 2);
        assert_eq!(&blob.bytes[..4], b"RDTP");

        let decoded = decode_tracepoints(&blob.bytes, 0x9000).unwrap();
        assert_eq!(decoded.len(), 2);
        let fast = &decoded[0];
        assert_eq!(fast.number, 3);
        assert_eq!(fast.kind, TracepointKind::Fast);
        assert_eq!(fast.pass_count, 9);
        assert_eq!(fast.compiled_cond, Some(0x7000));
        assert_eq!(fast.cond, tps[0].cond);
        assert_eq!(fast.actions, tps[0].actions);
        assert_eq!(fast.step_actions, tps[0].step_actions);
        assert_eq!(fast.obj_addr_on_target, 0x9000 + DOWNLOAD_HEADER_SIZE as u64);
        let stat = &decoded[1];
        assert!(!stat.enabled);
        assert_eq!(stat.actions, vec![Action::CollectStaticData]);
        assert_eq!(
            stat.obj_addr_on_target,
            0x9000 + blob.record_offsets[1] as u64
        );
    }

    #[test]
    fn corrupt_blob_test() {
        let blob = encode_tracepoints(&sample_tracepoints());
        let mut bad = blob.bytes.clone();
        bad[0] = b'X';
        assert!(decode_tracepoints(&bad, 0).is_err());

        let mut bad = blob.bytes.clone();
        let last = bad.len() - 1;
        bad[last] ^= 0xff;
        match decode_tracepoints(&bad, 0) {
            Err(TraceError::Download(msg)) => assert_eq!(msg, "checksum mismatch"),
            other => panic!("unexpected {:?}", other.map(|v| v.len())),
        }

        let mut bad = blob.bytes.clone();
        bad[4] = 2;
        assert!(decode_tracepoints(&bad, 0).is_err());

        assert!(decode_tracepoints(&blob.bytes[..10], 0).is_err());
        // Right blob, wrong section.
        assert!(decode_tsvs(&blob.bytes).is_err());
    }

    #[test]
    fn tsv_blob_test() {
        let mut tsvs = TsvRegistry::with_builtins();
        tsvs.define(2, -7, Some("counter".into()));
        tsvs.define(3, 100, None);
        let blob = encode_tsvs(&tsvs);
        let decoded = decode_tsvs(&blob.bytes).unwrap();
        let numbers: Vec<u32> = decoded.iter().map(|v| v.number).collect();
        // The timestamp built-in has a getter and is not sent.
        assert_eq!(numbers, vec![2, 3]);
        assert_eq!(decoded[0].initial_value, -7);
        assert_eq!(decoded[0].name.as_deref(), Some("counter"));
        assert_eq!(decoded[1].name, None);
    }

    #[test]
    fn heap_alignment_test() {
        let mut heap = TargetHeap::new(0x1000, 8);
        assert_eq!(heap.alloc(3), 0x1000);
        assert_eq!(heap.alloc(8), 0x1008);
        assert_eq!(heap.alloc(1), 0x1010);
        assert_eq!(heap.next(), 0x1018);
    }

    #[test]
    fn download_test() {
        let (syms, size) = AgentSymbols::packed(0x1_0000);
        let mut mem = LocalMemory::new(0x1_0000, size as usize + 0x1000);
        let heap_start = 0x1_0000 + size;
        mem.write_u64(syms.gdb_tp_heap_buffer, heap_start).unwrap();
        let mut heap = TargetHeap::from_agent(&mut mem, &syms, 8).unwrap();

        let mut tps = sample_tracepoints();
        let tsvs = TsvRegistry::with_builtins();
        download_definitions(&mut mem, &syms, &mut heap, tps.iter_mut(), &tsvs).unwrap();
        assert_eq!(tps[0].obj_addr_on_target, heap_start + DOWNLOAD_HEADER_SIZE as u64);
        assert_eq!(tps[1].obj_addr_on_target, 0);
        assert!(tps[2].obj_addr_on_target > tps[0].obj_addr_on_target);

        let (addr, bytes) = fetch_published(&mut mem, syms.tracepoints).unwrap();
        assert_eq!(addr, heap_start);
        let loaded = decode_tracepoints(&bytes, addr).unwrap();
        assert_eq!(loaded[1].obj_addr_on_target, tps[2].obj_addr_on_target);
        assert!(heap.next() % 8 == 0);
    }
}
