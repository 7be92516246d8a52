//! Compilation of agent expressions to native code, used for the
//! conditions of fast tracepoints.
//!
//! The compiler walks the bytecode once, recording the emitted address of
//! every bytecode, and then patches the branch displacements in a second
//! pass. The instruction encoding itself lives behind `EmitOps`.

use crate::{
    agent_expr::{fetch_be, AgentExpr, EvalError, GdbAgentOp},
    log::{LogDebug, LogWarn},
    target::CoreAddr,
};
use std::fmt::{self, Display, Formatter};

/// Space left between consecutive compiled conditions.
pub const JUMP_ENTRY_GAP: u64 = 16;

#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum EmitError {
    /// The emitter has no encoding for this operation (or operand).
    Unsupported(&'static str),
    /// A displacement does not fit the instruction it patches.
    OutOfRange { from: CoreAddr, to: CoreAddr },
}

impl Display for EmitError {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            EmitError::Unsupported(what) => write!(f, "cannot emit {}", what),
            EmitError::OutOfRange { from, to } => {
                write!(f, "branch from {:#x} to {:#x} out of range", from, to)
            }
        }
    }
}

pub type EmitResult = std::result::Result<(), EmitError>;

/// Where a branch displacement sits inside just emitted code, relative to
/// the address the branch instruction started at.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub struct GotoPatch {
    pub offset: u64,
    pub size: usize,
}

/// Compare-and-branch forms an emitter may provide in place of a
/// comparison followed by `if_goto`.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum FusedGoto {
    Eq,
    Ne,
    Lt,
    Ge,
    Gt,
    Le,
}

/// Addresses of agent functions that compiled code calls.
#[derive(Copy, Clone, Default, Eq, PartialEq, Debug)]
pub struct CompileHelpers {
    pub get_raw_reg: CoreAddr,
    pub get_tsv: CoreAddr,
    pub set_tsv: CoreAddr,
}

/// Architecture specific instruction emission.
///
/// Code is built into a buffer that represents the bytes starting at the
/// address given to `begin`. The generated function has the signature
/// `fn(raw_regs: *const u8, value: *mut u64) -> i32` and keeps the top of
/// the expression stack in a register.
pub trait EmitOps {
    /// Start a new buffer that will live at `at`.
    fn begin(&mut self, at: CoreAddr);

    fn current_address(&self) -> CoreAddr;

    /// The code emitted since `begin`.
    fn take_code(&mut self) -> Vec<u8>;

    fn emit_prologue(&mut self) -> EmitResult;
    fn emit_epilogue(&mut self) -> EmitResult;
    fn emit_add(&mut self) -> EmitResult;
    fn emit_sub(&mut self) -> EmitResult;
    fn emit_mul(&mut self) -> EmitResult;
    fn emit_lsh(&mut self) -> EmitResult;
    fn emit_rsh_signed(&mut self) -> EmitResult;
    fn emit_rsh_unsigned(&mut self) -> EmitResult;
    fn emit_ext(&mut self, bits: u64) -> EmitResult;
    fn emit_log_not(&mut self) -> EmitResult;
    fn emit_bit_and(&mut self) -> EmitResult;
    fn emit_bit_or(&mut self) -> EmitResult;
    fn emit_bit_xor(&mut self) -> EmitResult;
    fn emit_bit_not(&mut self) -> EmitResult;
    fn emit_equal(&mut self) -> EmitResult;
    fn emit_less_signed(&mut self) -> EmitResult;
    fn emit_less_unsigned(&mut self) -> EmitResult;
    fn emit_ref(&mut self, size: usize) -> EmitResult;
    fn emit_if_goto(&mut self) -> std::result::Result<GotoPatch, EmitError>;
    fn emit_goto(&mut self) -> std::result::Result<GotoPatch, EmitError>;
    fn emit_const(&mut self, value: u64) -> EmitResult;
    fn emit_reg(&mut self, regnum: u16, get_raw_reg: CoreAddr) -> EmitResult;
    fn emit_pop(&mut self) -> EmitResult;
    fn emit_stack_flush(&mut self) -> EmitResult;
    fn emit_zero_ext(&mut self, bits: u64) -> EmitResult;
    fn emit_swap(&mut self) -> EmitResult;
    fn emit_stack_adjust(&mut self, n: u32) -> EmitResult;
    /// Call `func(arg1)` and leave its result on top.
    fn emit_int_call_1(&mut self, func: CoreAddr, arg1: u64) -> EmitResult;
    /// Call `func(arg1, top)`, keeping top.
    fn emit_void_call_2(&mut self, func: CoreAddr, arg1: u64) -> EmitResult;

    fn supports_fused_goto(&self, _kind: FusedGoto) -> bool {
        false
    }

    fn emit_fused_goto(&mut self, _kind: FusedGoto) -> std::result::Result<GotoPatch, EmitError> {
        Err(EmitError::Unsupported("fused goto"))
    }

    /// Point the `size` byte branch displacement at `from` to `to`.
    fn write_goto_address(&mut self, from: CoreAddr, to: CoreAddr, size: usize) -> EmitResult;
}

struct PendingGoto {
    target: usize,
    patch: GotoPatch,
}

/// One bytecode and where its code starts.
struct BytecodeAddress {
    pc: usize,
    address: CoreAddr,
    goto: Option<PendingGoto>,
}

fn next_is(bytes: &[u8], pc: usize, op: GdbAgentOp) -> bool {
    bytes.get(pc) == Some(&(op as u8))
}

/// Try to fuse the comparison just read with the branch that follows it.
///
/// `rest` lists the opcodes that must follow, ending with `if_goto`. None of
/// them may be a branch target since they get no code of their own.
fn try_fuse<E: EmitOps + ?Sized>(
    emit: &mut E,
    aexpr: &AgentExpr,
    pc: &mut usize,
    rest: &[GdbAgentOp],
    kind: FusedGoto,
) -> std::result::Result<Option<std::result::Result<PendingGoto, EmitError>>, EvalError> {
    let bytes = aexpr.bytes();
    let fits = rest
        .iter()
        .enumerate()
        .all(|(i, op)| next_is(bytes, *pc + i, *op) && !aexpr.is_goto_target(*pc + i));
    if !fits || !emit.supports_fused_goto(kind) {
        return Ok(None);
    }
    *pc += rest.len();
    let target = fetch_be(bytes, pc, 2)? as usize;
    log!(LogDebug, "fusing {:?} goto to {}", kind, target);
    Ok(Some(
        emit.emit_fused_goto(kind)
            .map(|patch| PendingGoto { target, patch }),
    ))
}

/// Record a branch, or pass on the emission failure.
fn pending(
    entry: &mut BytecodeAddress,
    goto: std::result::Result<PendingGoto, EmitError>,
) -> EmitResult {
    entry.goto = Some(goto?);
    Ok(())
}

/// Translate `aexpr` through `emit`. On success the code leaves the value of
/// the expression in the emitter's top register, ready for the epilogue.
pub fn compile_bytecodes<E: EmitOps + ?Sized>(
    emit: &mut E,
    aexpr: &AgentExpr,
    helpers: &CompileHelpers,
) -> std::result::Result<(), EvalError> {
    use GdbAgentOp::*;

    let bytes = aexpr.bytes();
    if bytes.is_empty() {
        return Err(EvalError::EmptyExpression);
    }

    let mut table: Vec<BytecodeAddress> = Vec::new();
    let mut pc = 0usize;
    loop {
        let byte = *bytes.get(pc).ok_or(EvalError::UnrecognizedOpcode)?;
        let op = match GdbAgentOp::from_u8(byte) {
            Some(op) => op,
            None => {
                log!(LogDebug, "op {:#x} not recognized, cannot compile", byte);
                return Err(EvalError::UnrecognizedOpcode);
            }
        };
        let mut entry = BytecodeAddress {
            pc,
            address: emit.current_address(),
            goto: None,
        };
        pc += 1;
        let mut done = false;

        let emitted: EmitResult = match op {
            Add => emit.emit_add(),
            Sub => emit.emit_sub(),
            Mul => emit.emit_mul(),
            Lsh => emit.emit_lsh(),
            RshSigned => emit.emit_rsh_signed(),
            RshUnsigned => emit.emit_rsh_unsigned(),
            LogNot => emit.emit_log_not(),
            BitAnd => emit.emit_bit_and(),
            BitOr => emit.emit_bit_or(),
            BitXor => emit.emit_bit_xor(),
            BitNot => emit.emit_bit_not(),
            Equal => {
                let fused = match try_fuse(emit, aexpr, &mut pc, &[IfGoto], FusedGoto::Eq)? {
                    Some(f) => Some(f),
                    None => try_fuse(emit, aexpr, &mut pc, &[LogNot, IfGoto], FusedGoto::Ne)?,
                };
                match fused {
                    Some(goto) => pending(&mut entry, goto),
                    None => emit.emit_equal(),
                }
            }
            LessSigned => {
                let fused = match try_fuse(emit, aexpr, &mut pc, &[IfGoto], FusedGoto::Lt)? {
                    Some(f) => Some(f),
                    None => try_fuse(emit, aexpr, &mut pc, &[LogNot, IfGoto], FusedGoto::Ge)?,
                };
                match fused {
                    Some(goto) => pending(&mut entry, goto),
                    None => emit.emit_less_signed(),
                }
            }
            LessUnsigned => emit.emit_less_unsigned(),
            Ext => {
                let bits = fetch_be(bytes, &mut pc, 1)?;
                if bits < 64 {
                    emit.emit_ext(bits)
                } else {
                    Ok(())
                }
            }
            Ref8 => emit.emit_ref(1),
            Ref16 => emit.emit_ref(2),
            Ref32 => emit.emit_ref(4),
            Ref64 => emit.emit_ref(8),
            IfGoto => {
                let target = fetch_be(bytes, &mut pc, 2)? as usize;
                let goto = emit.emit_if_goto().map(|patch| PendingGoto { target, patch });
                pending(&mut entry, goto)
            }
            Goto => {
                let target = fetch_be(bytes, &mut pc, 2)? as usize;
                let goto = emit.emit_goto().map(|patch| PendingGoto { target, patch });
                pending(&mut entry, goto)
            }
            Const8 | Const16 | Const32 | Const64 => {
                let n = match op {
                    Const8 => 1,
                    Const16 => 2,
                    Const32 => 4,
                    _ => 8,
                };
                let value = fetch_be(bytes, &mut pc, n)?;
                emit.emit_stack_flush().and_then(|_| emit.emit_const(value))
            }
            Reg => {
                let regnum = fetch_be(bytes, &mut pc, 2)? as u16;
                emit.emit_stack_flush()
                    .and_then(|_| emit.emit_reg(regnum, helpers.get_raw_reg))
            }
            End => {
                done = true;
                emit.emit_stack_adjust(1)
            }
            Dup => emit.emit_stack_flush(),
            Pop => emit.emit_pop(),
            ZeroExt => {
                let bits = fetch_be(bytes, &mut pc, 1)?;
                if bits < 64 {
                    emit.emit_zero_ext(bits)
                } else {
                    Ok(())
                }
            }
            Swap => {
                let fused = match try_fuse(emit, aexpr, &mut pc, &[LessSigned, IfGoto], FusedGoto::Gt)? {
                    Some(f) => Some(f),
                    None => try_fuse(
                        emit,
                        aexpr,
                        &mut pc,
                        &[LessSigned, LogNot, IfGoto],
                        FusedGoto::Le,
                    )?,
                };
                match fused {
                    Some(goto) => pending(&mut entry, goto),
                    None => emit.emit_swap(),
                }
            }
            Getv => {
                let num = fetch_be(bytes, &mut pc, 2)?;
                emit.emit_stack_flush()
                    .and_then(|_| emit.emit_int_call_1(helpers.get_tsv, num))
            }
            Setv => {
                let num = fetch_be(bytes, &mut pc, 2)?;
                emit.emit_void_call_2(helpers.set_tsv, num)
            }
            DivSigned | DivUnsigned | RemSigned | RemUnsigned | Trace | TraceQuick | Tracev
            | Tracenz | Trace16 | Pick | Rot | Printf | Float | RefFloat | RefDouble
            | RefLongDouble | LToD | DToL => {
                log!(LogDebug, "op {} cannot be compiled", op.name());
                return Err(EvalError::UnhandledOpcode);
            }
        };

        table.push(entry);
        if let Err(e) = emitted {
            log!(LogDebug, "emitting {} failed: {}", op.name(), e);
            return Err(EvalError::UnhandledOpcode);
        }
        if done {
            break;
        }
    }

    for entry in &table {
        let goto = match &entry.goto {
            Some(goto) => goto,
            None => continue,
        };
        let dest = match table.iter().find(|e| e.pc == goto.target) {
            Some(dest) => dest,
            None => {
                log!(LogDebug, "goto at {} to {} has no code", entry.pc, goto.target);
                return Err(EvalError::InvalidGoto);
            }
        };
        if let Err(e) = emit.write_goto_address(
            entry.address + goto.patch.offset,
            dest.address,
            goto.patch.size,
        ) {
            log!(LogDebug, "patching goto at {}: {}", entry.pc, e);
            return Err(EvalError::InvalidGoto);
        }
    }

    Ok(())
}

/// Compile a tracepoint condition into a function at `*jump_entry` and move
/// `*jump_entry` past it.
///
/// Returns the entry point, or None if the condition cannot be compiled.
/// Either way the emitter holds the code that was produced; a failed
/// attempt is still written out by the caller and simply never called.
pub fn compile_tracepoint_condition<E: EmitOps + ?Sized>(
    emit: &mut E,
    number: u32,
    cond: &AgentExpr,
    helpers: &CompileHelpers,
    jump_entry: &mut CoreAddr,
) -> Option<CoreAddr> {
    let entry_point = *jump_entry;
    emit.begin(entry_point);

    let result = emit
        .emit_prologue()
        .map_err(|_| EvalError::UnhandledOpcode)
        .and_then(|_| compile_bytecodes(emit, cond, helpers))
        .and_then(|_| emit.emit_epilogue().map_err(|_| EvalError::UnhandledOpcode));

    *jump_entry = emit.current_address() + JUMP_ENTRY_GAP;

    match result {
        Ok(()) => {
            log!(
                LogDebug,
                "condition of tracepoint {} compiled at {:#x}, {} bytes",
                number,
                entry_point,
                emit.current_address() - entry_point
            );
            Some(entry_point)
        }
        Err(e) => {
            log!(
                LogWarn,
                "condition of tracepoint {} not compiled ({}), interpreting it",
                number,
                e
            );
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Emits one byte per operation and keeps a log of names so tests can
    /// check what the compiler asked for.
    #[derive(Default)]
    struct RecordingEmitter {
        base: CoreAddr,
        code: Vec<u8>,
        ops: Vec<String>,
        fused: bool,
        patches: Vec<(CoreAddr, CoreAddr, usize)>,
        fail_on: Option<&'static str>,
    }

    impl RecordingEmitter {
        fn op(&mut self, name: &str, len: usize) -> EmitResult {
            if self.fail_on == Some(name) {
                return Err(EmitError::Unsupported("test"));
            }
            self.ops.push(name.to_owned());
            self.code.extend(std::iter::repeat(0x90).take(len));
            Ok(())
        }
    }

    impl EmitOps for RecordingEmitter {
        fn begin(&mut self, at: CoreAddr) {
            self.base = at;
            self.code.clear();
        }
        fn current_address(&self) -> CoreAddr {
            self.base + self.code.len() as u64
        }
        fn take_code(&mut self) -> Vec<u8> {
            std::mem::take(&mut self.code)
        }
        fn emit_prologue(&mut self) -> EmitResult {
            self.op("prologue", 4)
        }
        fn emit_epilogue(&mut self) -> EmitResult {
            self.op("epilogue", 4)
        }
        fn emit_add(&mut self) -> EmitResult {
            self.op("add", 1)
        }
        fn emit_sub(&mut self) -> EmitResult {
            self.op("sub", 1)
        }
        fn emit_mul(&mut self) -> EmitResult {
            self.op("mul", 1)
        }
        fn emit_lsh(&mut self) -> EmitResult {
            self.op("lsh", 1)
        }
        fn emit_rsh_signed(&mut self) -> EmitResult {
            self.op("rsh_signed", 1)
        }
        fn emit_rsh_unsigned(&mut self) -> EmitResult {
            self.op("rsh_unsigned", 1)
        }
        fn emit_ext(&mut self, bits: u64) -> EmitResult {
            self.op(&format!("ext{}", bits), 1)
        }
        fn emit_log_not(&mut self) -> EmitResult {
            self.op("log_not", 1)
        }
        fn emit_bit_and(&mut self) -> EmitResult {
            self.op("bit_and", 1)
        }
        fn emit_bit_or(&mut self) -> EmitResult {
            self.op("bit_or", 1)
        }
        fn emit_bit_xor(&mut self) -> EmitResult {
            self.op("bit_xor", 1)
        }
        fn emit_bit_not(&mut self) -> EmitResult {
            self.op("bit_not", 1)
        }
        fn emit_equal(&mut self) -> EmitResult {
            self.op("equal", 1)
        }
        fn emit_less_signed(&mut self) -> EmitResult {
            self.op("less_signed", 1)
        }
        fn emit_less_unsigned(&mut self) -> EmitResult {
            self.op("less_unsigned", 1)
        }
        fn emit_ref(&mut self, size: usize) -> EmitResult {
            self.op(&format!("ref{}", size * 8), 1)
        }
        fn emit_if_goto(&mut self) -> std::result::Result<GotoPatch, EmitError> {
            self.op("if_goto", 4)?;
            Ok(GotoPatch { offset: 2, size: 2 })
        }
        fn emit_goto(&mut self) -> std::result::Result<GotoPatch, EmitError> {
            self.op("goto", 3)?;
            Ok(GotoPatch { offset: 1, size: 2 })
        }
        fn emit_const(&mut self, value: u64) -> EmitResult {
            self.op(&format!("const {}", value), 1)
        }
        fn emit_reg(&mut self, regnum: u16, _get_raw_reg: CoreAddr) -> EmitResult {
            self.op(&format!("reg {}", regnum), 1)
        }
        fn emit_pop(&mut self) -> EmitResult {
            self.op("pop", 1)
        }
        fn emit_stack_flush(&mut self) -> EmitResult {
            self.op("flush", 1)
        }
        fn emit_zero_ext(&mut self, bits: u64) -> EmitResult {
            self.op(&format!("zero_ext{}", bits), 1)
        }
        fn emit_swap(&mut self) -> EmitResult {
            self.op("swap", 1)
        }
        fn emit_stack_adjust(&mut self, n: u32) -> EmitResult {
            self.op(&format!("adjust {}", n), 1)
        }
        fn emit_int_call_1(&mut self, func: CoreAddr, arg1: u64) -> EmitResult {
            self.op(&format!("call1 {:#x} {}", func, arg1), 1)
        }
        fn emit_void_call_2(&mut self, func: CoreAddr, arg1: u64) -> EmitResult {
            self.op(&format!("call2 {:#x} {}", func, arg1), 1)
        }
        fn supports_fused_goto(&self, _kind: FusedGoto) -> bool {
            self.fused
        }
        fn emit_fused_goto(&mut self, kind: FusedGoto) -> std::result::Result<GotoPatch, EmitError> {
            self.op(&format!("{:?}_goto", kind).to_lowercase(), 4)?;
            Ok(GotoPatch { offset: 2, size: 2 })
        }
        fn write_goto_address(&mut self, from: CoreAddr, to: CoreAddr, size: usize) -> EmitResult {
            self.patches.push((from, to, size));
            Ok(())
        }
    }

    fn compile(hex: &str, fused: bool) -> (RecordingEmitter, std::result::Result<(), EvalError>) {
        let mut emit = RecordingEmitter {
            fused,
            ..Default::default()
        };
        emit.begin(0x1000);
        let result = compile_bytecodes(
            &mut emit,
            &AgentExpr::from_hex(hex).unwrap(),
            &CompileHelpers {
                get_raw_reg: 0x10,
                get_tsv: 0x20,
                set_tsv: 0x30,
            },
        );
        (emit, result)
    }

    #[test]
    fn straight_line_test() {
        // reg 3, const8 1, add, end
        let (emit, result) = compile("26000322010227", false);
        assert_eq!(result, Ok(()));
        assert_eq!(
            emit.ops,
            vec!["flush", "reg 3", "flush", "const 1", "add", "adjust 1"]
        );
    }

    #[test]
    fn tsv_calls_test() {
        // getv 2, setv 5, end
        let (emit, result) = compile("2c00022d000527", false);
        assert_eq!(result, Ok(()));
        assert_eq!(
            emit.ops,
            vec!["flush", "call1 0x20 2", "call2 0x30 5", "adjust 1"]
        );
    }

    #[test]
    fn goto_resolution_test() {
        // 0: const8 1
        // 2: if_goto 7
        // 5: const8 2
        // 7: end
        let (emit, result) = compile("2201200007220227", false);
        assert_eq!(result, Ok(()));
        // const8 1 -> flush+const = 2 bytes at 0x1000, if_goto at 0x1002,
        // const8 2 at 0x1006, end at 0x1008.
        assert_eq!(emit.patches, vec![(0x1004, 0x1008, 2)]);
    }

    #[test]
    fn fused_equal_test() {
        // const8 1, const8 1, equal, if_goto 9, end
        let hex = "220122011320000827";
        let (emit, result) = compile(hex, true);
        assert_eq!(result, Ok(()));
        assert!(emit.ops.contains(&"eq_goto".to_owned()));
        assert!(!emit.ops.contains(&"if_goto".to_owned()));

        let (emit, result) = compile(hex, false);
        assert_eq!(result, Ok(()));
        assert!(emit.ops.contains(&"equal".to_owned()));
        assert!(emit.ops.contains(&"if_goto".to_owned()));
    }

    #[test]
    fn fused_variants_test() {
        // const8 1, const8 2, <ops>, if_goto <end>, end
        let cases: &[(&str, &str)] = &[
            ("130e", "ne_goto"),
            ("14", "lt_goto"),
            ("140e", "ge_goto"),
            ("2b14", "gt_goto"),
            ("2b140e", "le_goto"),
        ];
        for (ops, name) in cases {
            let end = 4 + ops.len() / 2 + 3;
            let hex = format!("22012202{}20{:04x}27", ops, end);
            let (emit, result) = compile(&hex, true);
            assert_eq!(result, Ok(()), "{}", hex);
            assert!(emit.ops.contains(&name.to_string()), "{:?}", emit.ops);
            assert_eq!(emit.patches.len(), 1);
        }
    }

    #[test]
    fn no_fusion_across_branch_target_test() {
        // 0: const8 1
        // 2: const8 1
        // 4: equal
        // 5: if_goto 5   (targets itself, so it must keep its own code)
        // 8: end
        let (emit, result) = compile("220122011320000527", true);
        assert_eq!(result, Ok(()));
        assert!(emit.ops.contains(&"equal".to_owned()));
        assert!(emit.ops.contains(&"if_goto".to_owned()));
    }

    #[test]
    fn unhandled_ops_test() {
        // const8 10, const8 0, div_unsigned, end
        let (_, result) = compile("220a22000627", false);
        assert_eq!(result, Err(EvalError::UnhandledOpcode));
        // const8 1, trace_quick 4, end
        let (_, result) = compile("22010d0427", false);
        assert_eq!(result, Err(EvalError::UnhandledOpcode));
        let (_, result) = compile("ff", false);
        assert_eq!(result, Err(EvalError::UnrecognizedOpcode));
        let (_, result) = compile("", false);
        assert_eq!(result, Err(EvalError::EmptyExpression));
    }

    #[test]
    fn invalid_goto_test() {
        // goto 0x40, end
        let (_, result) = compile("21004027", false);
        assert_eq!(result, Err(EvalError::InvalidGoto));
    }

    #[test]
    fn emit_failure_is_unhandled_test() {
        let mut emit = RecordingEmitter {
            fail_on: Some("mul"),
            ..Default::default()
        };
        emit.begin(0);
        let expr = AgentExpr::from_hex("220222030427").unwrap();
        assert_eq!(
            compile_bytecodes(&mut emit, &expr, &CompileHelpers::default()),
            Err(EvalError::UnhandledOpcode)
        );
    }

    #[test]
    fn condition_entry_advance_test() {
        let mut emit = RecordingEmitter::default();
        let mut jump_entry = 0x2000;
        let cond = AgentExpr::from_hex("220127").unwrap();
        let entry = compile_tracepoint_condition(
            &mut emit,
            1,
            &cond,
            &CompileHelpers::default(),
            &mut jump_entry,
        );
        assert_eq!(entry, Some(0x2000));
        // prologue 4, flush 1, const 1, adjust 1, epilogue 4
        assert_eq!(jump_entry, 0x2000 + 11 + JUMP_ENTRY_GAP);

        // A failed compile still consumes its space.
        let bad = AgentExpr::from_hex("220a22000627").unwrap();
        let start = jump_entry;
        let entry = compile_tracepoint_condition(
            &mut emit,
            2,
            &bad,
            &CompileHelpers::default(),
            &mut jump_entry,
        );
        assert_eq!(entry, None);
        assert!(jump_entry > start + JUMP_ENTRY_GAP);
        assert!(!emit.take_code().is_empty());
    }
}
