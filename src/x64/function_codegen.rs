// This module lowers one IR function to x86-64 machine code. FunctionCodegen combines the
// SysVAssigner (argument and return placement), the FunctionFrame (one 8-byte stack slot per
// SSA value, 16-byte aligned frame) and the X64Encoder. The strategy is deliberately naive:
// every instruction loads its operands from their slots into scratch registers, operates and
// stores the result back, so no register allocation is needed and every value is always in
// memory at block boundaries. Block arguments are moved with a push/pop sequence, which
// copies all sources before writing any destination and therefore handles swaps and
// overlapping parameter lists. Calls follow the System V ABI: six register arguments, the
// rest pushed right to left with padding to keep RSP 16-byte aligned, the callee address in
// R11 and AL cleared for variadic callees. References to other symbols go through the
// encoder's patched 64-bit immediates; the caller supplies the symbol numbering.

//! Function code generation with calling conventions.

use crate::{
    core::{
        context::Symbol,
        error::{CompileError, CompileResult},
    },
    ir::{BinaryOp, BlockCall, Function, InstKind, IntCC, Terminator, Value},
    x64::{
        calling_convention::{CCAssigner, FunctionFrame, SysVAssigner},
        encoder::{AsmReg, EncodedCode, EncodingError, JumpCondition, X64Encoder},
    },
};
use bumpalo::Bump;

impl From<IntCC> for JumpCondition {
    fn from(cc: IntCC) -> Self {
        match cc {
            IntCC::Eq => JumpCondition::Equal,
            IntCC::Ne => JumpCondition::NotEqual,
            IntCC::Slt => JumpCondition::Less,
            IntCC::Sle => JumpCondition::LessEqual,
            IntCC::Sgt => JumpCondition::Greater,
            IntCC::Sge => JumpCondition::GreaterEqual,
            IntCC::Ult => JumpCondition::Below,
            IntCC::Ule => JumpCondition::BelowEqual,
            IntCC::Ugt => JumpCondition::Above,
            IntCC::Uge => JumpCondition::AboveEqual,
        }
    }
}

/// Function code generator that handles calling conventions.
pub struct FunctionCodegen<'a, 'f> {
    encoder: X64Encoder,
    cc_assigner: SysVAssigner,
    frame: FunctionFrame<'a>,
    func: &'f Function,
    /// Calls emitted so far.
    calls: usize,
}

impl<'a, 'f> FunctionCodegen<'a, 'f> {
    pub fn new(arena: &'a Bump, func: &'f Function) -> Result<Self, EncodingError> {
        Ok(Self {
            encoder: X64Encoder::new()?,
            cc_assigner: SysVAssigner::new(),
            frame: FunctionFrame::new(arena, func.value_count()),
            func,
            calls: 0,
        })
    }

    pub fn frame_size(&self) -> u32 {
        self.frame.frame_size
    }

    fn slot(&self, value: Value) -> i32 {
        self.frame.slot(value.index())
    }

    fn load(&mut self, reg: AsmReg, value: Value) -> Result<(), EncodingError> {
        let off = self.slot(value);
        self.encoder.mov_reg_mem(reg, AsmReg::RBP, off)
    }

    fn store(&mut self, value: Value, reg: AsmReg) -> Result<(), EncodingError> {
        let off = self.slot(value);
        self.encoder.mov_mem_reg(AsmReg::RBP, off, reg)
    }

    /// Emit the whole function; `symbol_index` numbers referenced symbols.
    pub fn compile<F>(mut self, mut symbol_index: F) -> CompileResult<EncodedCode>
    where
        F: FnMut(&Symbol) -> usize,
    {
        self.emit_prologue()?;
        let func = self.func;
        for block_id in func.block_ids() {
            self.encoder.place_label_for_block(block_id.index())?;
            let block = func.block(block_id);
            for inst in &block.insts {
                self.lower_inst(&inst.kind, inst.result, &mut symbol_index)?;
            }
            self.lower_terminator(&block.terminator)?;
        }
        let code = self.encoder.finalize(0)?;
        log::trace!(
            "lowered {}: {} bytes, {} calls, frame {} bytes",
            self.func.name,
            code.bytes.len(),
            self.calls,
            self.frame.frame_size
        );
        Ok(code)
    }

    /// Set up the frame and spill incoming arguments into their slots.
    fn emit_prologue(&mut self) -> Result<(), EncodingError> {
        self.encoder.emit_prologue(self.frame.frame_size)?;
        self.cc_assigner.reset();
        let func = self.func;
        for &param in func.params() {
            let assignment = self.cc_assigner.assign_arg();
            if let Some(reg) = assignment.reg {
                self.store(param, reg)?;
            } else {
                let off = FunctionFrame::incoming_arg_offset(assignment.stack_off.unwrap_or(0));
                self.encoder.mov_reg_mem(AsmReg::RAX, AsmReg::RBP, off)?;
                self.store(param, AsmReg::RAX)?;
            }
        }
        Ok(())
    }

    fn lower_inst<F>(&mut self, kind: &InstKind, result: Option<Value>, symbol_index: &mut F) -> CompileResult<()>
    where
        F: FnMut(&Symbol) -> usize,
    {
        let func = self.func;
        let needs_result = || {
            result.ok_or_else(|| CompileError::InvalidIr {
                function: func.name.to_string(),
                reason: "instruction without result".to_string(),
            })
        };
        match kind {
            InstKind::Iconst(imm) => {
                let dst = needs_result()?;
                self.encoder.mov_reg_imm(AsmReg::RAX, *imm)?;
                self.store(dst, AsmReg::RAX)?;
            }
            InstKind::Binary(op, lhs, rhs) => {
                let dst = needs_result()?;
                self.load(AsmReg::RAX, *lhs)?;
                self.load(AsmReg::RCX, *rhs)?;
                let out = self.emit_binary(*op)?;
                self.store(dst, out)?;
            }
            InstKind::Icmp(cc, lhs, rhs) => {
                let dst = needs_result()?;
                self.load(AsmReg::RAX, *lhs)?;
                self.load(AsmReg::RCX, *rhs)?;
                self.encoder.cmp_reg_reg(AsmReg::RAX, AsmReg::RCX)?;
                self.encoder.set_condition((*cc).into(), AsmReg::RAX)?;
                self.store(dst, AsmReg::RAX)?;
            }
            InstKind::Call { callee, args } => {
                let index = symbol_index(callee);
                self.emit_call(index, args)?;
                if let Some(dst) = result {
                    self.store(dst, AsmReg::RAX)?;
                }
            }
            InstKind::SymbolAddr(sym) => {
                let dst = needs_result()?;
                let index = symbol_index(sym);
                self.encoder.mov_reg_symbol(AsmReg::RAX, index)?;
                self.store(dst, AsmReg::RAX)?;
            }
            InstKind::Load(addr) => {
                let dst = needs_result()?;
                self.load(AsmReg::RAX, *addr)?;
                self.encoder.mov_reg_mem(AsmReg::RAX, AsmReg::RAX, 0)?;
                self.store(dst, AsmReg::RAX)?;
            }
            InstKind::Store { addr, value } => {
                self.load(AsmReg::RAX, *addr)?;
                self.load(AsmReg::RCX, *value)?;
                self.encoder.mov_mem_reg(AsmReg::RAX, 0, AsmReg::RCX)?;
            }
        }
        Ok(())
    }

    /// Operands in RAX and RCX; returns the register holding the result.
    fn emit_binary(&mut self, op: BinaryOp) -> Result<AsmReg, EncodingError> {
        let (rax, rcx) = (AsmReg::RAX, AsmReg::RCX);
        match op {
            BinaryOp::Add => self.encoder.add_reg_reg(rax, rcx)?,
            BinaryOp::Sub => self.encoder.sub_reg_reg(rax, rcx)?,
            BinaryOp::Mul => self.encoder.imul_reg_reg(rax, rcx)?,
            BinaryOp::And => self.encoder.and_reg_reg(rax, rcx)?,
            BinaryOp::Or => self.encoder.or_reg_reg(rax, rcx)?,
            BinaryOp::Xor => self.encoder.xor_reg_reg(rax, rcx)?,
            BinaryOp::Shl => self.encoder.shl_reg_cl(rax)?,
            BinaryOp::SShr => self.encoder.sar_reg_cl(rax)?,
            BinaryOp::UShr => self.encoder.shr_reg_cl(rax)?,
            BinaryOp::SDiv | BinaryOp::SRem => {
                self.encoder.cqo()?;
                self.encoder.idiv_reg(rcx)?;
                if op == BinaryOp::SRem {
                    return Ok(AsmReg::RDX);
                }
            }
        }
        Ok(rax)
    }

    fn emit_call(&mut self, symbol: usize, args: &[Value]) -> Result<(), EncodingError> {
        self.cc_assigner.reset();
        let assignments = self.cc_assigner.assign_all(args.len());
        let stack_args: Vec<Value> = args
            .iter()
            .zip(&assignments)
            .filter(|(_, a)| a.stack_off.is_some())
            .map(|(v, _)| *v)
            .collect();

        // Keep RSP 16-byte aligned at the call instruction.
        let padding = if stack_args.len() % 2 == 1 { 8 } else { 0 };
        if padding != 0 {
            self.encoder.sub_reg_imm(AsmReg::RSP, padding)?;
        }
        for &arg in stack_args.iter().rev() {
            self.load(AsmReg::RAX, arg)?;
            self.encoder.push_reg(AsmReg::RAX)?;
        }
        for (&arg, assignment) in args.iter().zip(&assignments) {
            if let Some(reg) = assignment.reg {
                self.load(reg, arg)?;
            }
        }

        self.encoder.mov_reg_symbol(AsmReg::R11, symbol)?;
        // AL bounds the vector registers a variadic callee saves.
        self.encoder.mov_reg_imm(AsmReg::RAX, 0)?;
        self.encoder.call_reg(AsmReg::R11)?;

        let cleanup = stack_args.len() as i32 * 8 + padding;
        if cleanup != 0 {
            self.encoder.add_reg_imm(AsmReg::RSP, cleanup)?;
        }
        self.calls += 1;
        Ok(())
    }

    /// Copy block arguments into the target's parameter slots.
    fn emit_block_args(&mut self, call: &BlockCall) -> Result<(), EncodingError> {
        let func = self.func;
        let params = &func.block(call.block).params;
        for &arg in &call.args {
            self.load(AsmReg::RAX, arg)?;
            self.encoder.push_reg(AsmReg::RAX)?;
        }
        for &param in params.iter().rev() {
            self.encoder.pop_reg(AsmReg::RAX)?;
            self.store(param, AsmReg::RAX)?;
        }
        Ok(())
    }

    fn lower_terminator(&mut self, terminator: &Terminator) -> CompileResult<()> {
        match terminator {
            Terminator::Unterminated => {
                return Err(CompileError::InvalidIr {
                    function: self.func.name.to_string(),
                    reason: "block without terminator".to_string(),
                })
            }
            Terminator::Return(value) => {
                if let Some(v) = value {
                    let ret = self.cc_assigner.assign_ret();
                    self.load(ret.reg.unwrap_or(SysVAssigner::RET_REG), *v)?;
                }
                self.encoder.emit_epilogue()?;
            }
            Terminator::Jump(dest) => {
                self.emit_block_args(dest)?;
                self.encoder.jmp_to_block(dest.block.index())?;
            }
            Terminator::Branch {
                cond,
                then_dest,
                else_dest,
            } => {
                self.load(AsmReg::RAX, *cond)?;
                self.encoder.test_reg_reg(AsmReg::RAX, AsmReg::RAX)?;
                if then_dest.args.is_empty() {
                    self.encoder
                        .jcc_to_block(JumpCondition::NotEqual, then_dest.block.index())?;
                    self.emit_block_args(else_dest)?;
                    self.encoder.jmp_to_block(else_dest.block.index())?;
                } else {
                    let mut edge = self.encoder.create_label();
                    self.encoder.jcc_label(JumpCondition::NotEqual, edge)?;
                    self.emit_block_args(else_dest)?;
                    self.encoder.jmp_to_block(else_dest.block.index())?;
                    self.encoder.place_label(&mut edge)?;
                    self.emit_block_args(then_dest)?;
                    self.encoder.jmp_to_block(then_dest.block.index())?;
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::context::ThreadSafeContext;
    use crate::ir::parser::parse_module;

    fn lower(src: &str) -> EncodedCode {
        let ctx = ThreadSafeContext::new();
        let module = parse_module(src, "m", &ctx).unwrap();
        module.verify().unwrap();
        let arena = Bump::new();
        let mut names: Vec<String> = Vec::new();
        let codegen = FunctionCodegen::new(&arena, &module.functions[0]).unwrap();
        codegen
            .compile(|sym| {
                names.push(sym.to_string());
                names.len() - 1
            })
            .unwrap()
    }

    #[test]
    fn test_lower_straight_line() {
        let code = lower("define @add(%a, %b) {\nentry:\n    %s = add %a, %b\n    ret %s\n}\n");
        // push rbp; mov rbp, rsp
        assert_eq!(&code.bytes[..4], &[0x55, 0x48, 0x89, 0xe5]);
        assert_eq!(*code.bytes.last().unwrap(), 0xc3);
        assert!(code.symbol_fixups.is_empty());
    }

    #[test]
    fn test_lower_records_symbol_references() {
        let code = lower(
            "define @f(%x) {\nentry:\n    %p = addr @counter\n    %r = call @g(%x, %p)\n    ret %r\n}\n",
        );
        assert_eq!(code.symbol_fixups.len(), 2);
        assert_eq!(code.symbol_fixups[0].1, 0);
        assert_eq!(code.symbol_fixups[1].1, 1);
    }

    #[test]
    fn test_lower_control_flow_with_block_args() {
        let code = lower(
            r#"define @max(%a, %b) {
entry:
    %c = icmp sgt %a, %b
    br %c, done(%a), done(%b)
done(%r):
    ret %r
}
"#,
        );
        assert!(!code.bytes.is_empty());
    }

    #[test]
    fn test_lower_many_arguments() {
        let code = lower(
            r#"define @many(%a, %b, %c, %d, %e, %f, %g, %h) {
entry:
    %r = call @sink(%a, %b, %c, %d, %e, %f, %g)
    ret %h
}
"#,
        );
        assert_eq!(code.symbol_fixups.len(), 1);
    }
}
