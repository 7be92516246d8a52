//! Agent expressions: the bytecode used for tracepoint conditions and
//! `X` actions, and the interpreter that evaluates them.

use crate::{
    error::{Result, TraceError},
    log::LogDebug,
    target::CoreAddr,
};
use std::fmt::{self, Display, Formatter};

/// Depth of the evaluation stack. Reaching `STACK_MAX - 1` is an overflow.
pub const STACK_MAX: usize = 100;

#[repr(u8)]
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum GdbAgentOp {
    Float = 0x01,
    Add = 0x02,
    Sub = 0x03,
    Mul = 0x04,
    DivSigned = 0x05,
    DivUnsigned = 0x06,
    RemSigned = 0x07,
    RemUnsigned = 0x08,
    Lsh = 0x09,
    RshSigned = 0x0a,
    RshUnsigned = 0x0b,
    Trace = 0x0c,
    TraceQuick = 0x0d,
    LogNot = 0x0e,
    BitAnd = 0x0f,
    BitOr = 0x10,
    BitXor = 0x11,
    BitNot = 0x12,
    Equal = 0x13,
    LessSigned = 0x14,
    LessUnsigned = 0x15,
    Ext = 0x16,
    Ref8 = 0x17,
    Ref16 = 0x18,
    Ref32 = 0x19,
    Ref64 = 0x1a,
    RefFloat = 0x1b,
    RefDouble = 0x1c,
    RefLongDouble = 0x1d,
    LToD = 0x1e,
    DToL = 0x1f,
    IfGoto = 0x20,
    Goto = 0x21,
    Const8 = 0x22,
    Const16 = 0x23,
    Const32 = 0x24,
    Const64 = 0x25,
    Reg = 0x26,
    End = 0x27,
    Dup = 0x28,
    Pop = 0x29,
    ZeroExt = 0x2a,
    Swap = 0x2b,
    Getv = 0x2c,
    Setv = 0x2d,
    Tracev = 0x2e,
    Tracenz = 0x2f,
    Trace16 = 0x30,
    Pick = 0x32,
    Rot = 0x33,
    Printf = 0x34,
}

use GdbAgentOp::*;

impl GdbAgentOp {
    pub fn from_u8(byte: u8) -> Option<GdbAgentOp> {
        let op = match byte {
            0x01 => Float,
            0x02 => Add,
            0x03 => Sub,
            0x04 => Mul,
            0x05 => DivSigned,
            0x06 => DivUnsigned,
            0x07 => RemSigned,
            0x08 => RemUnsigned,
            0x09 => Lsh,
            0x0a => RshSigned,
            0x0b => RshUnsigned,
            0x0c => Trace,
            0x0d => TraceQuick,
            0x0e => LogNot,
            0x0f => BitAnd,
            0x10 => BitOr,
            0x11 => BitXor,
            0x12 => BitNot,
            0x13 => Equal,
            0x14 => LessSigned,
            0x15 => LessUnsigned,
            0x16 => Ext,
            0x17 => Ref8,
            0x18 => Ref16,
            0x19 => Ref32,
            0x1a => Ref64,
            0x1b => RefFloat,
            0x1c => RefDouble,
            0x1d => RefLongDouble,
            0x1e => LToD,
            0x1f => DToL,
            0x20 => IfGoto,
            0x21 => Goto,
            0x22 => Const8,
            0x23 => Const16,
            0x24 => Const32,
            0x25 => Const64,
            0x26 => Reg,
            0x27 => End,
            0x28 => Dup,
            0x29 => Pop,
            0x2a => ZeroExt,
            0x2b => Swap,
            0x2c => Getv,
            0x2d => Setv,
            0x2e => Tracev,
            0x2f => Tracenz,
            0x30 => Trace16,
            0x32 => Pick,
            0x33 => Rot,
            0x34 => Printf,
            _ => return None,
        };
        Some(op)
    }

    /// Number of operand bytes following the opcode.
    ///
    /// `printf` carries a variable length format; it is never scanned past.
    pub fn operand_size(self) -> usize {
        match self {
            Ext | TraceQuick | ZeroExt | Const8 | Pick => 1,
            IfGoto | Goto | Const16 | Reg | Getv | Setv | Tracev | Trace16 => 2,
            Const32 => 4,
            Const64 => 8,
            _ => 0,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Float => "float",
            Add => "add",
            Sub => "sub",
            Mul => "mul",
            DivSigned => "div_signed",
            DivUnsigned => "div_unsigned",
            RemSigned => "rem_signed",
            RemUnsigned => "rem_unsigned",
            Lsh => "lsh",
            RshSigned => "rsh_signed",
            RshUnsigned => "rsh_unsigned",
            Trace => "trace",
            TraceQuick => "trace_quick",
            LogNot => "log_not",
            BitAnd => "bit_and",
            BitOr => "bit_or",
            BitXor => "bit_xor",
            BitNot => "bit_not",
            Equal => "equal",
            LessSigned => "less_signed",
            LessUnsigned => "less_unsigned",
            Ext => "ext",
            Ref8 => "ref8",
            Ref16 => "ref16",
            Ref32 => "ref32",
            Ref64 => "ref64",
            RefFloat => "ref_float",
            RefDouble => "ref_double",
            RefLongDouble => "ref_long_double",
            LToD => "l_to_d",
            DToL => "d_to_l",
            IfGoto => "if_goto",
            Goto => "goto",
            Const8 => "const8",
            Const16 => "const16",
            Const32 => "const32",
            Const64 => "const64",
            Reg => "reg",
            End => "end",
            Dup => "dup",
            Pop => "pop",
            ZeroExt => "zero_ext",
            Swap => "swap",
            Getv => "getv",
            Setv => "setv",
            Tracev => "tracev",
            Tracenz => "tracenz",
            Trace16 => "trace16",
            Pick => "pick",
            Rot => "rot",
            Printf => "printf",
        }
    }
}

/// Why evaluation (or compilation) of an expression stopped.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum EvalError {
    EmptyExpression,
    EmptyStack,
    StackOverflow,
    StackUnderflow,
    UnhandledOpcode,
    UnrecognizedOpcode,
    DivideByZero,
    InvalidGoto,
}

impl EvalError {
    /// The numeric code the agent publishes for the monitor. 0 means "no error".
    pub fn code(self) -> u32 {
        match self {
            EvalError::EmptyExpression => 1,
            EvalError::EmptyStack => 2,
            EvalError::StackOverflow => 3,
            EvalError::StackUnderflow => 4,
            EvalError::UnhandledOpcode => 5,
            EvalError::UnrecognizedOpcode => 6,
            EvalError::DivideByZero => 7,
            EvalError::InvalidGoto => 8,
        }
    }

    pub fn from_code(code: u32) -> Option<EvalError> {
        let e = match code {
            1 => EvalError::EmptyExpression,
            2 => EvalError::EmptyStack,
            3 => EvalError::StackOverflow,
            4 => EvalError::StackUnderflow,
            5 => EvalError::UnhandledOpcode,
            6 => EvalError::UnrecognizedOpcode,
            7 => EvalError::DivideByZero,
            8 => EvalError::InvalidGoto,
            _ => return None,
        };
        Some(e)
    }

    pub fn message(self) -> &'static str {
        match self {
            EvalError::EmptyExpression => "empty expression",
            EvalError::EmptyStack => "empty stack",
            EvalError::StackOverflow => "stack overflow",
            EvalError::StackUnderflow => "stack underflow",
            EvalError::UnhandledOpcode => "unhandled opcode",
            EvalError::UnrecognizedOpcode => "unrecognized opcode",
            EvalError::DivideByZero => "division by zero",
            EvalError::InvalidGoto => "invalid goto",
        }
    }
}

impl Display for EvalError {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message())
    }
}

/// Everything an expression can touch while it runs.
///
/// None of these may fail the evaluation: a failed collection simply does not
/// contribute to the frame.
pub trait ExprContext {
    /// Plain read for the `ref` family. Returns false if the memory is unreadable.
    fn read_memory(&mut self, addr: CoreAddr, buf: &mut [u8]) -> bool;

    fn collect_register(&mut self, regnum: u16) -> Option<u64>;

    fn get_tsv(&mut self, num: u16) -> i64;

    fn set_tsv(&mut self, num: u16, value: i64);

    /// Record `[addr, addr + len)` into the frame being collected, if any.
    fn trace_memory(&mut self, addr: CoreAddr, len: u64);

    /// Record a NUL terminated string of at most `limit` bytes.
    fn trace_string(&mut self, addr: CoreAddr, limit: u64);

    /// Record the current value of a TSV.
    fn trace_tsv(&mut self, num: u16);
}

/// An owned bytecode sequence.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct AgentExpr {
    bytes: Vec<u8>,
}

impl AgentExpr {
    pub fn new(bytes: Vec<u8>) -> AgentExpr {
        AgentExpr { bytes }
    }

    /// Parse the hex form the controller sends, e.g. `2205220402`.
    pub fn from_hex(hex: &str) -> Result<AgentExpr> {
        let hex = hex.trim();
        if hex.len() % 2 != 0 {
            return Err(TraceError::MalformedExpression(format!(
                "odd number of hex digits in `{}'",
                hex
            )));
        }
        let mut bytes = Vec::with_capacity(hex.len() / 2);
        for i in (0..hex.len()).step_by(2) {
            let pair = hex.get(i..i + 2).ok_or_else(|| {
                TraceError::MalformedExpression(format!("non-ascii hex in `{}'", hex))
            })?;
            let byte = u8::from_str_radix(pair, 16).map_err(|_| {
                TraceError::MalformedExpression(format!("bad hex byte `{}'", pair))
            })?;
            bytes.push(byte);
        }
        Ok(AgentExpr { bytes })
    }

    pub fn to_hex(&self) -> String {
        let mut s = String::with_capacity(self.bytes.len() * 2);
        for b in &self.bytes {
            s.push_str(&format!("{:02x}", b));
        }
        s
    }

    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// Is `pc` the destination of any goto or if_goto in this expression?
    pub fn is_goto_target(&self, pc: usize) -> bool {
        let mut i = 0;
        while i < self.bytes.len() {
            let op = match GdbAgentOp::from_u8(self.bytes[i]) {
                Some(op) => op,
                None => return false,
            };
            if op == Goto || op == IfGoto {
                if let (Some(hi), Some(lo)) = (self.bytes.get(i + 1), self.bytes.get(i + 2)) {
                    if ((*hi as usize) << 8) + *lo as usize == pc {
                        return true;
                    }
                }
            }
            if op == Printf {
                return false;
            }
            i += 1 + op.operand_size();
        }
        false
    }

    /// Evaluate the expression. With `want_result` the value left on top of
    /// the stack by `end` is returned.
    pub fn eval<C: ExprContext + ?Sized>(
        &self,
        ctx: &mut C,
        want_result: bool,
    ) -> std::result::Result<Option<u64>, EvalError> {
        let result = Interpreter::new(&self.bytes).run(ctx, want_result);
        if let Err(e) = result {
            log!(LogDebug, "agent expression {} failed: {}", self.to_hex(), e);
        }
        result
    }
}

/// Fetch `n` big-endian operand bytes at `*pc`.
pub(crate) fn fetch_be(bytes: &[u8], pc: &mut usize, n: usize) -> std::result::Result<u64, EvalError> {
    let operand = bytes
        .get(*pc..*pc + n)
        .ok_or(EvalError::UnrecognizedOpcode)?;
    *pc += n;
    Ok(operand.iter().fold(0u64, |acc, b| (acc << 8) | *b as u64))
}

struct Interpreter<'a> {
    bytes: &'a [u8],
    pc: usize,
    stack: [u64; STACK_MAX],
    /// Number of elements below the cached top. `stack[0]` is the value the
    /// cache held before the first push.
    sp: usize,
    top: u64,
}

impl<'a> Interpreter<'a> {
    fn new(bytes: &'a [u8]) -> Interpreter<'a> {
        Interpreter {
            bytes,
            pc: 0,
            stack: [0; STACK_MAX],
            sp: 0,
            top: 0,
        }
    }

    fn push_top(&mut self) -> std::result::Result<(), EvalError> {
        if self.sp >= STACK_MAX - 1 {
            return Err(EvalError::StackOverflow);
        }
        self.stack[self.sp] = self.top;
        self.sp += 1;
        Ok(())
    }

    fn pop(&mut self) -> std::result::Result<u64, EvalError> {
        if self.sp == 0 {
            return Err(EvalError::StackUnderflow);
        }
        self.sp -= 1;
        Ok(self.stack[self.sp])
    }

    fn operand(&mut self, n: usize) -> std::result::Result<u64, EvalError> {
        fetch_be(self.bytes, &mut self.pc, n)
    }

    fn jump(&mut self, target: u64) -> std::result::Result<(), EvalError> {
        if target as usize >= self.bytes.len() {
            return Err(EvalError::InvalidGoto);
        }
        self.pc = target as usize;
        Ok(())
    }

    fn read_sized<C: ExprContext + ?Sized>(ctx: &mut C, addr: CoreAddr, size: usize) -> u64 {
        let mut buf = [0u8; 8];
        if !ctx.read_memory(addr, &mut buf[..size]) {
            log!(LogDebug, "ref{} at {:#x} unreadable", size * 8, addr);
        }
        u64::from_le_bytes(buf)
    }

    fn run<C: ExprContext + ?Sized>(
        &mut self,
        ctx: &mut C,
        want_result: bool,
    ) -> std::result::Result<Option<u64>, EvalError> {
        if self.bytes.is_empty() {
            return Err(EvalError::EmptyExpression);
        }

        loop {
            let byte = *self
                .bytes
                .get(self.pc)
                .ok_or(EvalError::UnrecognizedOpcode)?;
            self.pc += 1;
            let op = match GdbAgentOp::from_u8(byte) {
                Some(op) => op,
                None => {
                    log!(LogDebug, "agent expression op {:#x} not recognized", byte);
                    return Err(EvalError::UnrecognizedOpcode);
                }
            };

            match op {
                Add => self.top = self.pop()?.wrapping_add(self.top),
                Sub => self.top = self.pop()?.wrapping_sub(self.top),
                Mul => self.top = self.pop()?.wrapping_mul(self.top),
                DivSigned => {
                    if self.top == 0 {
                        return Err(EvalError::DivideByZero);
                    }
                    let lhs = self.pop()? as i64;
                    self.top = lhs.wrapping_div(self.top as i64) as u64;
                }
                DivUnsigned => {
                    if self.top == 0 {
                        return Err(EvalError::DivideByZero);
                    }
                    self.top = self.pop()? / self.top;
                }
                RemSigned => {
                    if self.top == 0 {
                        return Err(EvalError::DivideByZero);
                    }
                    let lhs = self.pop()? as i64;
                    self.top = lhs.wrapping_rem(self.top as i64) as u64;
                }
                RemUnsigned => {
                    if self.top == 0 {
                        return Err(EvalError::DivideByZero);
                    }
                    self.top = self.pop()? % self.top;
                }
                Lsh => {
                    let v = self.pop()?;
                    self.top = if self.top >= 64 { 0 } else { v << self.top };
                }
                RshSigned => {
                    let v = self.pop()? as i64;
                    self.top = if self.top >= 64 {
                        (v >> 63) as u64
                    } else {
                        (v >> self.top) as u64
                    };
                }
                RshUnsigned => {
                    let v = self.pop()?;
                    self.top = if self.top >= 64 { 0 } else { v >> self.top };
                }
                Trace => {
                    let addr = self.pop()?;
                    ctx.trace_memory(addr, self.top);
                    self.top = self.pop()?;
                }
                TraceQuick => {
                    let len = self.operand(1)?;
                    ctx.trace_memory(self.top, len);
                }
                LogNot => self.top = (self.top == 0) as u64,
                BitAnd => self.top &= self.pop()?,
                BitOr => self.top |= self.pop()?,
                BitXor => self.top ^= self.pop()?,
                BitNot => self.top = !self.top,
                Equal => self.top = (self.pop()? == self.top) as u64,
                LessSigned => self.top = ((self.pop()? as i64) < self.top as i64) as u64,
                LessUnsigned => self.top = (self.pop()? < self.top) as u64,
                Ext => {
                    let bits = self.operand(1)?;
                    if bits > 0 && bits < 64 {
                        let mask = 1u64 << (bits - 1);
                        self.top &= (1u64 << bits) - 1;
                        self.top = (self.top ^ mask).wrapping_sub(mask);
                    }
                }
                Ref8 => self.top = Self::read_sized(ctx, self.top, 1),
                Ref16 => self.top = Self::read_sized(ctx, self.top, 2),
                Ref32 => self.top = Self::read_sized(ctx, self.top, 4),
                Ref64 => self.top = Self::read_sized(ctx, self.top, 8),
                IfGoto => {
                    let target = self.operand(2)?;
                    if self.top != 0 {
                        self.jump(target)?;
                    }
                    self.top = self.pop()?;
                }
                Goto => {
                    let target = self.operand(2)?;
                    self.jump(target)?;
                }
                Const8 | Const16 | Const32 | Const64 => {
                    let n = match op {
                        Const8 => 1,
                        Const16 => 2,
                        Const32 => 4,
                        _ => 8,
                    };
                    self.push_top()?;
                    self.top = self.operand(n)?;
                }
                Reg => {
                    self.push_top()?;
                    let regnum = self.operand(2)? as u16;
                    self.top = match ctx.collect_register(regnum) {
                        Some(v) => v,
                        None => {
                            log!(LogDebug, "register {} not available to reg", regnum);
                            return Err(EvalError::UnhandledOpcode);
                        }
                    };
                }
                End => {
                    if !want_result {
                        return Ok(None);
                    }
                    if self.sp == 0 {
                        log!(LogDebug, "stack is empty, nothing to return");
                        return Err(EvalError::EmptyStack);
                    }
                    return Ok(Some(self.top));
                }
                Dup => self.push_top()?,
                Pop => self.top = self.pop()?,
                Pick => {
                    let depth = self.operand(1)? as usize;
                    let from = self
                        .sp
                        .checked_sub(depth)
                        .ok_or(EvalError::StackUnderflow)?;
                    self.push_top()?;
                    self.top = self.stack[from];
                }
                Rot => {
                    if self.sp < 2 {
                        return Err(EvalError::StackUnderflow);
                    }
                    let tem = self.stack[self.sp - 1];
                    self.stack[self.sp - 1] = self.stack[self.sp - 2];
                    self.stack[self.sp - 2] = self.top;
                    self.top = tem;
                }
                ZeroExt => {
                    let bits = self.operand(1)?;
                    if bits < 64 {
                        self.top &= (1u64 << bits) - 1;
                    }
                }
                Swap => {
                    if self.sp < 1 {
                        return Err(EvalError::StackUnderflow);
                    }
                    std::mem::swap(&mut self.top, &mut self.stack[self.sp - 1]);
                }
                Getv => {
                    self.push_top()?;
                    let num = self.operand(2)? as u16;
                    self.top = ctx.get_tsv(num) as u64;
                }
                Setv => {
                    let num = self.operand(2)? as u16;
                    // The value stays on the stack for enclosing expressions.
                    ctx.set_tsv(num, self.top as i64);
                }
                Tracev => {
                    let num = self.operand(2)? as u16;
                    ctx.trace_tsv(num);
                }
                Tracenz => {
                    let addr = self.pop()?;
                    ctx.trace_string(addr, self.top);
                    self.top = self.pop()?;
                }
                Float | RefFloat | RefDouble | RefLongDouble | LToD | DToL | Trace16 | Printf => {
                    log!(LogDebug, "agent expression op {} valid, but not handled", op.name());
                    return Err(EvalError::UnhandledOpcode);
                }
            }

            if self.sp >= STACK_MAX - 1 {
                log!(LogDebug, "expression stack overflow");
                return Err(EvalError::StackOverflow);
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::collections::HashMap;

    /// Records what an expression asked for instead of touching a target.
    #[derive(Default)]
    pub(crate) struct RecordingContext {
        pub memory: HashMap<CoreAddr, u8>,
        pub regs: HashMap<u16, u64>,
        pub tsvs: HashMap<u16, i64>,
        pub traced: Vec<(CoreAddr, u64)>,
        pub traced_strings: Vec<(CoreAddr, u64)>,
        pub traced_tsvs: Vec<u16>,
    }

    impl ExprContext for RecordingContext {
        fn read_memory(&mut self, addr: CoreAddr, buf: &mut [u8]) -> bool {
            for (i, b) in buf.iter_mut().enumerate() {
                match self.memory.get(&(addr + i as u64)) {
                    Some(v) => *b = *v,
                    None => return false,
                }
            }
            true
        }

        fn collect_register(&mut self, regnum: u16) -> Option<u64> {
            self.regs.get(&regnum).copied()
        }

        fn get_tsv(&mut self, num: u16) -> i64 {
            self.tsvs.get(&num).copied().unwrap_or(0)
        }

        fn set_tsv(&mut self, num: u16, value: i64) {
            self.tsvs.insert(num, value);
        }

        fn trace_memory(&mut self, addr: CoreAddr, len: u64) {
            self.traced.push((addr, len));
        }

        fn trace_string(&mut self, addr: CoreAddr, limit: u64) {
            self.traced_strings.push((addr, limit));
        }

        fn trace_tsv(&mut self, num: u16) {
            self.traced_tsvs.push(num);
        }
    }

    fn eval(bytes: &[u8]) -> std::result::Result<Option<u64>, EvalError> {
        let mut ctx = RecordingContext::default();
        AgentExpr::new(bytes.to_vec()).eval(&mut ctx, true)
    }

    #[test]
    fn div_by_zero_test() {
        let r = eval(&[0x22, 10, 0x22, 0, 0x06, 0x27]);
        assert_eq!(r, Err(EvalError::DivideByZero));
        assert_eq!(EvalError::DivideByZero.to_string(), "division by zero");
    }

    #[test]
    fn arithmetic_test() {
        // (7 - 2) * 3
        assert_eq!(eval(&[0x22, 7, 0x22, 2, 0x03, 0x22, 3, 0x04, 0x27]), Ok(Some(15)));
        // -8 / 3 signed
        let r = eval(&[
            0x25, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xf8, 0x22, 3, 0x05, 0x27,
        ]);
        assert_eq!(r, Ok(Some(-2i64 as u64)));
        // 1 << 70 is 0
        assert_eq!(eval(&[0x22, 1, 0x22, 70, 0x09, 0x27]), Ok(Some(0)));
    }

    #[test]
    fn ext_test() {
        // 0xff sign extended from 8 bits
        assert_eq!(eval(&[0x22, 0xff, 0x16, 8, 0x27]), Ok(Some(u64::MAX)));
        assert_eq!(eval(&[0x22, 0x7f, 0x16, 8, 0x27]), Ok(Some(0x7f)));
        assert_eq!(eval(&[0x23, 0x12, 0x34, 0x2a, 8, 0x27]), Ok(Some(0x34)));
    }

    #[test]
    fn goto_test() {
        // if (1) goto 8; const8 5; end; 8: const8 9; end
        let bytes = [0x22, 1, 0x20, 0, 8, 0x22, 5, 0x27, 0x22, 9, 0x27];
        assert_eq!(eval(&bytes), Ok(Some(9)));
        assert_eq!(eval(&[0x21, 0, 40]), Err(EvalError::InvalidGoto));
        let expr = AgentExpr::new(bytes.to_vec());
        assert!(expr.is_goto_target(8));
        assert!(!expr.is_goto_target(5));
    }

    #[test]
    fn stack_errors_test() {
        assert_eq!(eval(&[]), Err(EvalError::EmptyExpression));
        assert_eq!(eval(&[0x27]), Err(EvalError::EmptyStack));
        assert_eq!(eval(&[0x02, 0x27]), Err(EvalError::StackUnderflow));
        let mut overflow = vec![0x22, 1];
        overflow.extend(std::iter::repeat(0x28).take(STACK_MAX));
        overflow.push(0x27);
        assert_eq!(eval(&overflow), Err(EvalError::StackOverflow));
        assert_eq!(eval(&[0x31]), Err(EvalError::UnrecognizedOpcode));
        assert_eq!(eval(&[0x22, 1, 0x01]), Err(EvalError::UnhandledOpcode));
        assert_eq!(eval(&[0x22]), Err(EvalError::UnrecognizedOpcode));
    }

    #[test]
    fn end_without_result_test() {
        let mut ctx = RecordingContext::default();
        let expr = AgentExpr::new(vec![0x27]);
        assert_eq!(expr.eval(&mut ctx, false), Ok(None));
    }

    #[test]
    fn side_effects_test() {
        let mut ctx = RecordingContext::default();
        ctx.regs.insert(7, 0x1000);
        ctx.tsvs.insert(3, 40);
        ctx.memory.insert(0x1000, 0x2a);
        // reg 7; const8 16; trace; getv 3; const8 2; add; setv 3; tracev 3; end
        let expr = AgentExpr::new(vec![
            0x26, 0, 7, 0x22, 16, 0x0c, 0x2c, 0, 3, 0x22, 2, 0x02, 0x2d, 0, 3, 0x2e, 0, 3, 0x27,
        ]);
        assert_eq!(expr.eval(&mut ctx, true), Ok(Some(42)));
        assert_eq!(ctx.traced, vec![(0x1000, 16)]);
        assert_eq!(ctx.tsvs.get(&3), Some(&42));
        assert_eq!(ctx.traced_tsvs, vec![3]);

        // reg 7; ref8
        let expr = AgentExpr::new(vec![0x26, 0, 7, 0x17, 0x27]);
        assert_eq!(expr.eval(&mut ctx, true), Ok(Some(0x2a)));
    }

    #[test]
    fn pick_rot_swap_test() {
        // a b c rot -> c a b
        assert_eq!(eval(&[0x22, 1, 0x22, 2, 0x22, 3, 0x33, 0x27]), Ok(Some(2)));
        assert_eq!(eval(&[0x22, 1, 0x22, 2, 0x22, 3, 0x33, 0x29, 0x27]), Ok(Some(1)));
        // 5 6 pick 1 -> 5 6 5
        assert_eq!(eval(&[0x22, 5, 0x22, 6, 0x32, 1, 0x27]), Ok(Some(5)));
        // 5 6 swap sub -> 6 - 5
        assert_eq!(eval(&[0x22, 5, 0x22, 6, 0x2b, 0x03, 0x27]), Ok(Some(1)));
    }

    #[test]
    fn tracenz_test() {
        let mut ctx = RecordingContext::default();
        // const16 0x2000; const8 32; tracenz; const8 0; end
        let expr = AgentExpr::new(vec![0x23, 0x20, 0x00, 0x22, 32, 0x2f, 0x22, 0, 0x27]);
        assert_eq!(expr.eval(&mut ctx, true), Ok(Some(0)));
        assert_eq!(ctx.traced_strings, vec![(0x2000, 32)]);
    }

    #[test]
    fn hex_test() {
        let expr = AgentExpr::from_hex("220a220006 27").unwrap_err();
        assert!(matches!(expr, TraceError::MalformedExpression(_)));
        let expr = AgentExpr::from_hex("220a22000627").unwrap();
        assert_eq!(expr.bytes(), &[0x22, 10, 0x22, 0, 0x06, 0x27]);
        assert_eq!(expr.to_hex(), "220a22000627");
        assert!(AgentExpr::from_hex("2").is_err());
        assert!(AgentExpr::from_hex("zz").is_err());
    }

    #[test]
    fn error_codes_test() {
        for code in 1..=8 {
            assert_eq!(EvalError::from_code(code).unwrap().code(), code);
        }
        assert_eq!(EvalError::from_code(0), None);
    }
}
