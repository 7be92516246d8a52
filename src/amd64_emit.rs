//! x86-64 code generation for compiled conditions.
//!
//! The top of the expression stack lives in `%rax`; the rest of the stack is
//! the machine stack. `%rdi` holds the raw register block on entry and is
//! saved at `-8(%rbp)`, the result pointer at `-16(%rbp)`.

use crate::{
    ax_compile::{EmitError, EmitOps, EmitResult, FusedGoto, GotoPatch},
    target::CoreAddr,
};

/// Position and width of the displacement in the fused compare-and-branch
/// sequences: `cmp`, a short `jcc` over the taken path, `lea`, `pop`, then
/// the `jmp rel32`.
const FUSED_GOTO_PATCH: GotoPatch = GotoPatch { offset: 13, size: 4 };

#[derive(Clone, Debug, Default)]
pub struct Amd64EmitOps {
    base: CoreAddr,
    code: Vec<u8>,
}

impl Amd64EmitOps {
    pub fn new() -> Amd64EmitOps {
        Amd64EmitOps::default()
    }

    fn append(&mut self, bytes: &[u8]) -> EmitResult {
        self.code.extend_from_slice(bytes);
        Ok(())
    }

    fn emit_call(&mut self, func: CoreAddr) -> EmitResult {
        let next = self.current_address() + 5;
        let disp = (func as i64).wrapping_sub(next as i64);
        if disp >= i32::MIN as i64 && disp <= i32::MAX as i64 {
            // call rel32
            self.code.push(0xe8);
            self.code.extend_from_slice(&(disp as i32).to_le_bytes());
        } else {
            // movabs $func,%r10; call *%r10
            self.code.extend_from_slice(&[0x49, 0xba]);
            self.code.extend_from_slice(&func.to_le_bytes());
            self.code.extend_from_slice(&[0x41, 0xff, 0xd2]);
        }
        Ok(())
    }

    /// `cmp %rax,(%rsp)`, `jcc` to the fall through path, then the taken
    /// path popping both operands.
    fn emit_compare_goto(&mut self, skip_taken: u8) -> std::result::Result<GotoPatch, EmitError> {
        self.append(&[
            0x48, 0x39, 0x04, 0x24, // cmp %rax,(%rsp)
            skip_taken, 0x0b, // jcc .Lfallthru
            0x48, 0x8d, 0x64, 0x24, 0x08, // lea 0x8(%rsp),%rsp
            0x58, // pop %rax
            0xe9, 0x00, 0x00, 0x00, 0x00, // jmp <target>
            0x48, 0x8d, 0x64, 0x24, 0x08, // .Lfallthru: lea 0x8(%rsp),%rsp
            0x58, // pop %rax
        ])?;
        Ok(FUSED_GOTO_PATCH)
    }

    /// `cmp %rax,(%rsp)`, materialize 0 or 1, drop the second operand.
    fn emit_compare(&mut self, jcc_true: u8) -> EmitResult {
        self.append(&[
            0x48, 0x39, 0x04, 0x24, // cmp %rax,(%rsp)
            jcc_true, 0x05, // jcc .Ltrue
            0x48, 0x31, 0xc0, // xor %rax,%rax
            0xeb, 0x07, // jmp .Lend
            0x48, 0xc7, 0xc0, 0x01, 0x00, 0x00, 0x00, // .Ltrue: mov $0x1,%rax
            0x48, 0x8d, 0x64, 0x24, 0x08, // .Lend: lea 0x8(%rsp),%rsp
        ])
    }

    fn emit_binop(&mut self, op: &[u8]) -> EmitResult {
        self.append(op)?;
        // lea 0x8(%rsp),%rsp
        self.append(&[0x48, 0x8d, 0x64, 0x24, 0x08])
    }

    fn emit_shift(&mut self, modrm: u8) -> EmitResult {
        self.append(&[
            0x48, 0x89, 0xc1, // mov %rax,%rcx
            0x58, // pop %rax
            0x48, 0xd3, modrm, // shl/sar/shr %cl,%rax
        ])
    }

    fn emit_mov_edi(&mut self, value: u64) -> EmitResult {
        if value > u32::MAX as u64 {
            return Err(EmitError::Unsupported("call argument wider than 32 bits"));
        }
        self.code.push(0xbf);
        self.code.extend_from_slice(&(value as u32).to_le_bytes());
        Ok(())
    }
}

impl EmitOps for Amd64EmitOps {
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
        self.append(&[
            0x55, // push %rbp
            0x48, 0x89, 0xe5, // mov %rsp,%rbp
            0x48, 0x83, 0xec, 0x20, // sub $0x20,%rsp
            0x48, 0x89, 0x7d, 0xf8, // mov %rdi,-8(%rbp)
            0x48, 0x89, 0x75, 0xf0, // mov %rsi,-16(%rbp)
        ])
    }

    fn emit_epilogue(&mut self) -> EmitResult {
        self.append(&[
            0x48, 0x8b, 0x7d, 0xf0, // mov -16(%rbp),%rdi
            0x48, 0x89, 0x07, // mov %rax,(%rdi)
            0x48, 0x31, 0xc0, // xor %rax,%rax
            0xc9, // leave
            0xc3, // ret
        ])
    }

    fn emit_add(&mut self) -> EmitResult {
        // add (%rsp),%rax
        self.emit_binop(&[0x48, 0x03, 0x04, 0x24])
    }

    fn emit_sub(&mut self) -> EmitResult {
        self.append(&[
            0x48, 0x29, 0x04, 0x24, // sub %rax,(%rsp)
            0x58, // pop %rax
        ])
    }

    fn emit_mul(&mut self) -> EmitResult {
        // imul (%rsp),%rax
        self.emit_binop(&[0x48, 0x0f, 0xaf, 0x04, 0x24])
    }

    fn emit_lsh(&mut self) -> EmitResult {
        self.emit_shift(0xe0)
    }

    fn emit_rsh_signed(&mut self) -> EmitResult {
        self.emit_shift(0xf8)
    }

    fn emit_rsh_unsigned(&mut self) -> EmitResult {
        self.emit_shift(0xe8)
    }

    fn emit_ext(&mut self, bits: u64) -> EmitResult {
        match bits {
            // movsbq %al,%rax
            8 => self.append(&[0x48, 0x0f, 0xbe, 0xc0]),
            // movswq %ax,%rax
            16 => self.append(&[0x48, 0x0f, 0xbf, 0xc0]),
            // cltq
            32 => self.append(&[0x48, 0x98]),
            _ => Err(EmitError::Unsupported("sign extension width")),
        }
    }

    fn emit_log_not(&mut self) -> EmitResult {
        self.append(&[
            0x48, 0x85, 0xc0, // test %rax,%rax
            0x0f, 0x94, 0xc1, // sete %cl
            0x48, 0x0f, 0xb6, 0xc1, // movzbq %cl,%rax
        ])
    }

    fn emit_bit_and(&mut self) -> EmitResult {
        self.emit_binop(&[0x48, 0x23, 0x04, 0x24])
    }

    fn emit_bit_or(&mut self) -> EmitResult {
        self.emit_binop(&[0x48, 0x0b, 0x04, 0x24])
    }

    fn emit_bit_xor(&mut self) -> EmitResult {
        self.emit_binop(&[0x48, 0x33, 0x04, 0x24])
    }

    fn emit_bit_not(&mut self) -> EmitResult {
        // xor $-1,%rax
        self.append(&[0x48, 0x83, 0xf0, 0xff])
    }

    fn emit_equal(&mut self) -> EmitResult {
        // je
        self.emit_compare(0x74)
    }

    fn emit_less_signed(&mut self) -> EmitResult {
        // jl
        self.emit_compare(0x7c)
    }

    fn emit_less_unsigned(&mut self) -> EmitResult {
        // jb
        self.emit_compare(0x72)
    }

    fn emit_ref(&mut self, size: usize) -> EmitResult {
        match size {
            // movzbq (%rax),%rax
            1 => self.append(&[0x48, 0x0f, 0xb6, 0x00]),
            // movzwq (%rax),%rax
            2 => self.append(&[0x48, 0x0f, 0xb7, 0x00]),
            // mov (%rax),%eax
            4 => self.append(&[0x8b, 0x00]),
            // mov (%rax),%rax
            8 => self.append(&[0x48, 0x8b, 0x00]),
            _ => Err(EmitError::Unsupported("memory reference width")),
        }
    }

    fn emit_if_goto(&mut self) -> std::result::Result<GotoPatch, EmitError> {
        self.append(&[
            0x48, 0x89, 0xc1, // mov %rax,%rcx
            0x58, // pop %rax
            0x48, 0x83, 0xf9, 0x00, // cmp $0,%rcx
            0x0f, 0x85, 0x00, 0x00, 0x00, 0x00, // jne <target>
        ])?;
        Ok(GotoPatch { offset: 10, size: 4 })
    }

    fn emit_goto(&mut self) -> std::result::Result<GotoPatch, EmitError> {
        // jmp <target>
        self.append(&[0xe9, 0x00, 0x00, 0x00, 0x00])?;
        Ok(GotoPatch { offset: 1, size: 4 })
    }

    fn emit_const(&mut self, value: u64) -> EmitResult {
        // movabs $value,%rax
        self.append(&[0x48, 0xb8])?;
        self.append(&value.to_le_bytes())
    }

    fn emit_reg(&mut self, regnum: u16, get_raw_reg: CoreAddr) -> EmitResult {
        // mov -8(%rbp),%rdi
        self.append(&[0x48, 0x8b, 0x7d, 0xf8])?;
        // mov $regnum,%esi
        self.code.push(0xbe);
        self.code.extend_from_slice(&(regnum as u32).to_le_bytes());
        self.emit_call(get_raw_reg)
    }

    fn emit_pop(&mut self) -> EmitResult {
        self.append(&[0x58])
    }

    fn emit_stack_flush(&mut self) -> EmitResult {
        // push %rax
        self.append(&[0x50])
    }

    fn emit_zero_ext(&mut self, bits: u64) -> EmitResult {
        match bits {
            // and $0xff,%rax
            8 => self.append(&[0x48, 0x25, 0xff, 0x00, 0x00, 0x00]),
            // and $0xffff,%rax
            16 => self.append(&[0x48, 0x25, 0xff, 0xff, 0x00, 0x00]),
            32 => self.append(&[
                0xb9, 0xff, 0xff, 0xff, 0xff, // mov $0xffffffff,%ecx
                0x48, 0x21, 0xc8, // and %rcx,%rax
            ]),
            _ => Err(EmitError::Unsupported("zero extension width")),
        }
    }

    fn emit_swap(&mut self) -> EmitResult {
        self.append(&[
            0x48, 0x89, 0xc1, // mov %rax,%rcx
            0x58, // pop %rax
            0x51, // push %rcx
        ])
    }

    fn emit_stack_adjust(&mut self, n: u32) -> EmitResult {
        let bytes = n as u64 * 8;
        if bytes > i8::MAX as u64 {
            return Err(EmitError::Unsupported("stack adjustment"));
        }
        // lea n*8(%rsp),%rsp
        self.append(&[0x48, 0x8d, 0x64, 0x24, bytes as u8])
    }

    fn emit_int_call_1(&mut self, func: CoreAddr, arg1: u64) -> EmitResult {
        self.emit_mov_edi(arg1)?;
        self.emit_call(func)
    }

    fn emit_void_call_2(&mut self, func: CoreAddr, arg1: u64) -> EmitResult {
        self.append(&[
            0x50, // push %rax
            0x48, 0x89, 0xc6, // mov %rax,%rsi
        ])?;
        self.emit_mov_edi(arg1)?;
        self.emit_call(func)?;
        // pop %rax
        self.append(&[0x58])
    }

    fn supports_fused_goto(&self, _kind: FusedGoto) -> bool {
        true
    }

    fn emit_fused_goto(&mut self, kind: FusedGoto) -> std::result::Result<GotoPatch, EmitError> {
        // Each form skips the taken path on the opposite condition.
        let skip_taken = match kind {
            FusedGoto::Eq => 0x75, // jne
            FusedGoto::Ne => 0x74, // je
            FusedGoto::Lt => 0x7d, // jge
            FusedGoto::Ge => 0x7c, // jl
            FusedGoto::Gt => 0x7e, // jle
            FusedGoto::Le => 0x7f, // jg
        };
        self.emit_compare_goto(skip_taken)
    }

    fn write_goto_address(&mut self, from: CoreAddr, to: CoreAddr, size: usize) -> EmitResult {
        if size != 4 {
            return Err(EmitError::Unsupported("branch displacement size"));
        }
        let disp = (to as i64).wrapping_sub((from + size as u64) as i64);
        if disp < i32::MIN as i64 || disp > i32::MAX as i64 {
            return Err(EmitError::OutOfRange { from, to });
        }
        let offset = from
            .checked_sub(self.base)
            .map(|o| o as usize)
            .filter(|o| o + size <= self.code.len())
            .ok_or(EmitError::OutOfRange { from, to })?;
        self.code[offset..offset + size].copy_from_slice(&(disp as i32).to_le_bytes());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        agent_expr::AgentExpr,
        ax_compile::{compile_bytecodes, compile_tracepoint_condition, CompileHelpers},
    };

    #[test]
    fn prologue_epilogue_test() {
        let mut e = Amd64EmitOps::new();
        e.begin(0x7000);
        e.emit_prologue().unwrap();
        e.emit_epilogue().unwrap();
        let code = e.take_code();
        assert_eq!(
            &code[..16],
            &[
                0x55, 0x48, 0x89, 0xe5, 0x48, 0x83, 0xec, 0x20, 0x48, 0x89, 0x7d, 0xf8, 0x48,
                0x89, 0x75, 0xf0
            ]
        );
        assert_eq!(
            &code[16..],
            &[0x48, 0x8b, 0x7d, 0xf0, 0x48, 0x89, 0x07, 0x48, 0x31, 0xc0, 0xc9, 0xc3]
        );
    }

    #[test]
    fn call_encoding_test() {
        let mut e = Amd64EmitOps::new();
        e.begin(0x1000);
        e.emit_int_call_1(0x2000, 3).unwrap();
        // mov $3,%edi then call rel32 relative to the end of the call.
        let code = e.take_code();
        assert_eq!(&code[..5], &[0xbf, 3, 0, 0, 0]);
        assert_eq!(code[5], 0xe8);
        let disp = i32::from_le_bytes([code[6], code[7], code[8], code[9]]);
        assert_eq!(0x1000 + 10 + disp as i64, 0x2000);

        // Far away: through %r10.
        e.begin(0x1000);
        e.emit_int_call_1(0x7fff_0000_0000, 3).unwrap();
        let code = e.take_code();
        assert_eq!(&code[5..7], &[0x49, 0xba]);
        assert_eq!(&code[15..], &[0x41, 0xff, 0xd2]);
    }

    #[test]
    fn goto_patch_test() {
        let mut e = Amd64EmitOps::new();
        e.begin(0x4000);
        let patch = e.emit_if_goto().unwrap();
        e.emit_stack_flush().unwrap();
        e.write_goto_address(0x4000 + patch.offset, 0x4000, patch.size)
            .unwrap();
        let code = e.take_code();
        assert_eq!(&code[8..10], &[0x0f, 0x85]);
        // Back to the start: -(10 + 4).
        assert_eq!(&code[10..14], &(-14i32).to_le_bytes());
        assert!(e.write_goto_address(0x4000 + 100, 0x4000, 4).is_err());
    }

    #[test]
    fn fused_goto_layout_test() {
        let mut e = Amd64EmitOps::new();
        e.begin(0);
        let patch = e.emit_fused_goto(FusedGoto::Lt).unwrap();
        let code = e.take_code();
        assert_eq!(code[patch.offset as usize - 1], 0xe9);
        assert_eq!(code[4], 0x7d);
        // The short jump lands on the fall through path.
        assert_eq!(6 + code[5] as usize, patch.offset as usize + patch.size);
    }

    #[test]
    fn compile_condition_test() {
        // 0: reg 0
        // 3: const8 5
        // 5: less_signed
        // 6: if_goto 11
        // 9: const8 0
        // 11: end
        let cond = AgentExpr::from_hex("26000022051420000b220027").unwrap();
        let mut e = Amd64EmitOps::new();
        let mut jump_entry = 0x10_0000;
        let entry = compile_tracepoint_condition(
            &mut e,
            7,
            &cond,
            &CompileHelpers {
                get_raw_reg: 0x10_8000,
                get_tsv: 0x10_9000,
                set_tsv: 0x10_a000,
            },
            &mut jump_entry,
        );
        assert_eq!(entry, Some(0x10_0000));
        let code = e.take_code();
        assert_eq!(jump_entry, 0x10_0000 + code.len() as u64 + 16);
        assert_eq!(*code.last().unwrap(), 0xc3);
    }

    #[test]
    fn division_not_compiled_test() {
        let mut e = Amd64EmitOps::new();
        e.begin(0);
        let expr = AgentExpr::from_hex("220a22000627").unwrap();
        assert!(compile_bytecodes(&mut e, &expr, &CompileHelpers::default()).is_err());
    }
}
