// This module provides x86-64 instruction encoding on top of the iced-x86 code assembler.
// X64Encoder converts AsmReg register references into iced registers and exposes the small
// instruction vocabulary the JIT needs: 64-bit moves between registers, immediates and
// frame slots, integer arithmetic and shifts, signed division, comparisons with SETcc
// materialization, pushes and pops, direct and indirect control flow, and labels for basic
// blocks and branch edges. Symbol references are emitted as 64-bit immediate moves whose
// immediate is patched by the linker; the encoder records each one and reports its byte
// offset after assembly so the object writer can attach an absolute relocation. The same
// encoder produces the lazy-compilation stubs and the shared compile trampoline, where all
// addresses are known and encoded directly.

//! x86-64 instruction encoding using iced-x86.

use iced_x86::code_asm::*;
use iced_x86::BlockEncoderOptions;
use std::collections::HashMap;

/// Register reference: bank 0 is general purpose, ids follow hardware numbering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct AsmReg {
    pub bank: u8,
    pub id: u8,
}

impl AsmReg {
    pub const RAX: AsmReg = AsmReg::gp(0);
    pub const RCX: AsmReg = AsmReg::gp(1);
    pub const RDX: AsmReg = AsmReg::gp(2);
    pub const RBX: AsmReg = AsmReg::gp(3);
    pub const RSP: AsmReg = AsmReg::gp(4);
    pub const RBP: AsmReg = AsmReg::gp(5);
    pub const RSI: AsmReg = AsmReg::gp(6);
    pub const RDI: AsmReg = AsmReg::gp(7);
    pub const R8: AsmReg = AsmReg::gp(8);
    pub const R9: AsmReg = AsmReg::gp(9);
    pub const R10: AsmReg = AsmReg::gp(10);
    pub const R11: AsmReg = AsmReg::gp(11);

    pub const fn new(bank: u8, id: u8) -> Self {
        Self { bank, id }
    }

    pub const fn gp(id: u8) -> Self {
        Self { bank: 0, id }
    }
}

/// Error types for instruction encoding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EncodingError {
    /// Register outside the general purpose bank or out of range.
    InvalidRegister(AsmReg),
    /// Jump to a label that was never placed.
    UnplacedLabel(usize),
    /// Assembly error from iced-x86.
    AssemblyError(String),
}

impl std::fmt::Display for EncodingError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EncodingError::InvalidRegister(reg) => {
                write!(f, "Invalid register bank {} id {}", reg.bank, reg.id)
            }
            EncodingError::UnplacedLabel(block) => {
                write!(f, "Label for block {block} was never placed")
            }
            EncodingError::AssemblyError(msg) => write!(f, "Assembly error: {msg}"),
        }
    }
}

impl std::error::Error for EncodingError {}

fn asm_err(e: IcedError) -> EncodingError {
    EncodingError::AssemblyError(e.to_string())
}

/// Jump and SETcc conditions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JumpCondition {
    Equal,
    NotEqual,
    Less,
    LessEqual,
    Greater,
    GreaterEqual,
    Below,
    BelowEqual,
    Above,
    AboveEqual,
}

/// Placeholder immediate for symbol moves; does not fit in 32 bits so the
/// assembler always selects the 10-byte `mov r64, imm64` form.
const SYMBOL_PLACEHOLDER: i64 = 0x7fde_adbe_efde_adbe;

/// Machine code plus the symbol references it contains.
#[derive(Debug, Clone, Default)]
pub struct EncodedCode {
    pub bytes: Vec<u8>,
    /// `(byte offset of the 8-byte immediate, symbol index)`.
    pub symbol_fixups: Vec<(u64, usize)>,
}

/// x86-64 instruction encoder using iced-x86.
pub struct X64Encoder {
    assembler: CodeAssembler,
    /// Labels for basic blocks.
    block_labels: HashMap<usize, CodeLabel>,
    placed_blocks: std::collections::HashSet<usize>,
    /// `(instruction index, symbol index)` for each symbol move.
    symbol_moves: Vec<(usize, usize)>,
}

impl X64Encoder {
    pub fn new() -> Result<Self, EncodingError> {
        let assembler = CodeAssembler::new(64).map_err(asm_err)?;
        Ok(Self {
            assembler,
            block_labels: HashMap::new(),
            placed_blocks: std::collections::HashSet::new(),
            symbol_moves: Vec::new(),
        })
    }

    fn gp64(&self, reg: AsmReg) -> Result<AsmRegister64, EncodingError> {
        const GP64_REGS: [AsmRegister64; 16] = [
            rax, rcx, rdx, rbx, rsp, rbp, rsi, rdi, r8, r9, r10, r11, r12, r13, r14, r15,
        ];
        if reg.bank != 0 {
            return Err(EncodingError::InvalidRegister(reg));
        }
        GP64_REGS
            .get(reg.id as usize)
            .copied()
            .ok_or(EncodingError::InvalidRegister(reg))
    }

    fn gp32(&self, reg: AsmReg) -> Result<AsmRegister32, EncodingError> {
        const GP32_REGS: [AsmRegister32; 16] = [
            eax, ecx, edx, ebx, esp, ebp, esi, edi, r8d, r9d, r10d, r11d, r12d, r13d, r14d, r15d,
        ];
        if reg.bank != 0 {
            return Err(EncodingError::InvalidRegister(reg));
        }
        GP32_REGS
            .get(reg.id as usize)
            .copied()
            .ok_or(EncodingError::InvalidRegister(reg))
    }

    fn gp8(&self, reg: AsmReg) -> Result<AsmRegister8, EncodingError> {
        const GP8_REGS: [AsmRegister8; 16] = [
            al, cl, dl, bl, spl, bpl, sil, dil, r8b, r9b, r10b, r11b, r12b, r13b, r14b, r15b,
        ];
        if reg.bank != 0 {
            return Err(EncodingError::InvalidRegister(reg));
        }
        GP8_REGS
            .get(reg.id as usize)
            .copied()
            .ok_or(EncodingError::InvalidRegister(reg))
    }

    // ==== MOVES ====

    pub fn mov_reg_reg(&mut self, dst: AsmReg, src: AsmReg) -> Result<(), EncodingError> {
        let (d, s) = (self.gp64(dst)?, self.gp64(src)?);
        self.assembler.mov(d, s).map_err(asm_err)
    }

    pub fn mov_reg_imm(&mut self, dst: AsmReg, imm: i64) -> Result<(), EncodingError> {
        let d = self.gp64(dst)?;
        self.assembler.mov(d, imm).map_err(asm_err)
    }

    /// `mov dst, qword [base + offset]`
    pub fn mov_reg_mem(&mut self, dst: AsmReg, base: AsmReg, offset: i32) -> Result<(), EncodingError> {
        let (d, b) = (self.gp64(dst)?, self.gp64(base)?);
        self.assembler.mov(d, qword_ptr(b + offset)).map_err(asm_err)
    }

    /// `mov qword [base + offset], src`
    pub fn mov_mem_reg(&mut self, base: AsmReg, offset: i32, src: AsmReg) -> Result<(), EncodingError> {
        let (b, s) = (self.gp64(base)?, self.gp64(src)?);
        self.assembler.mov(qword_ptr(b + offset), s).map_err(asm_err)
    }

    /// Load the address of symbol `symbol` into `dst`; patched at link time.
    pub fn mov_reg_symbol(&mut self, dst: AsmReg, symbol: usize) -> Result<(), EncodingError> {
        let index = self.assembler.instructions().len();
        self.mov_reg_imm(dst, SYMBOL_PLACEHOLDER)?;
        self.symbol_moves.push((index, symbol));
        Ok(())
    }

    // ==== ARITHMETIC ====

    pub fn add_reg_reg(&mut self, dst: AsmReg, src: AsmReg) -> Result<(), EncodingError> {
        let (d, s) = (self.gp64(dst)?, self.gp64(src)?);
        self.assembler.add(d, s).map_err(asm_err)
    }

    pub fn add_reg_imm(&mut self, dst: AsmReg, imm: i32) -> Result<(), EncodingError> {
        let d = self.gp64(dst)?;
        self.assembler.add(d, imm).map_err(asm_err)
    }

    pub fn sub_reg_reg(&mut self, dst: AsmReg, src: AsmReg) -> Result<(), EncodingError> {
        let (d, s) = (self.gp64(dst)?, self.gp64(src)?);
        self.assembler.sub(d, s).map_err(asm_err)
    }

    pub fn sub_reg_imm(&mut self, dst: AsmReg, imm: i32) -> Result<(), EncodingError> {
        let d = self.gp64(dst)?;
        self.assembler.sub(d, imm).map_err(asm_err)
    }

    pub fn imul_reg_reg(&mut self, dst: AsmReg, src: AsmReg) -> Result<(), EncodingError> {
        let (d, s) = (self.gp64(dst)?, self.gp64(src)?);
        self.assembler.imul_2(d, s).map_err(asm_err)
    }

    pub fn and_reg_reg(&mut self, dst: AsmReg, src: AsmReg) -> Result<(), EncodingError> {
        let (d, s) = (self.gp64(dst)?, self.gp64(src)?);
        self.assembler.and(d, s).map_err(asm_err)
    }

    pub fn or_reg_reg(&mut self, dst: AsmReg, src: AsmReg) -> Result<(), EncodingError> {
        let (d, s) = (self.gp64(dst)?, self.gp64(src)?);
        self.assembler.or(d, s).map_err(asm_err)
    }

    pub fn xor_reg_reg(&mut self, dst: AsmReg, src: AsmReg) -> Result<(), EncodingError> {
        let (d, s) = (self.gp64(dst)?, self.gp64(src)?);
        self.assembler.xor(d, s).map_err(asm_err)
    }

    // The count register is implicitly CL.

    pub fn shl_reg_cl(&mut self, dst: AsmReg) -> Result<(), EncodingError> {
        let d = self.gp64(dst)?;
        self.assembler.shl(d, cl).map_err(asm_err)
    }

    pub fn shr_reg_cl(&mut self, dst: AsmReg) -> Result<(), EncodingError> {
        let d = self.gp64(dst)?;
        self.assembler.shr(d, cl).map_err(asm_err)
    }

    pub fn sar_reg_cl(&mut self, dst: AsmReg) -> Result<(), EncodingError> {
        let d = self.gp64(dst)?;
        self.assembler.sar(d, cl).map_err(asm_err)
    }

    /// Sign-extend RAX into RDX:RAX.
    pub fn cqo(&mut self) -> Result<(), EncodingError> {
        self.assembler.cqo().map_err(asm_err)
    }

    /// Signed divide RDX:RAX by `divisor`; quotient in RAX, remainder in RDX.
    pub fn idiv_reg(&mut self, divisor: AsmReg) -> Result<(), EncodingError> {
        let d = self.gp64(divisor)?;
        self.assembler.idiv(d).map_err(asm_err)
    }

    // ==== COMPARISONS ====

    pub fn cmp_reg_reg(&mut self, left: AsmReg, right: AsmReg) -> Result<(), EncodingError> {
        let (l, r) = (self.gp64(left)?, self.gp64(right)?);
        self.assembler.cmp(l, r).map_err(asm_err)
    }

    pub fn test_reg_reg(&mut self, left: AsmReg, right: AsmReg) -> Result<(), EncodingError> {
        let (l, r) = (self.gp64(left)?, self.gp64(right)?);
        self.assembler.test(l, r).map_err(asm_err)
    }

    /// SETcc into the low byte of `dst`, then zero-extend to 64 bits.
    pub fn set_condition(&mut self, condition: JumpCondition, dst: AsmReg) -> Result<(), EncodingError> {
        let d8 = self.gp8(dst)?;
        let a = &mut self.assembler;
        match condition {
            JumpCondition::Equal => a.sete(d8),
            JumpCondition::NotEqual => a.setne(d8),
            JumpCondition::Less => a.setl(d8),
            JumpCondition::LessEqual => a.setle(d8),
            JumpCondition::Greater => a.setg(d8),
            JumpCondition::GreaterEqual => a.setge(d8),
            JumpCondition::Below => a.setb(d8),
            JumpCondition::BelowEqual => a.setbe(d8),
            JumpCondition::Above => a.seta(d8),
            JumpCondition::AboveEqual => a.setae(d8),
        }
        .map_err(asm_err)?;
        // Writing the 32-bit register clears the upper half.
        let d32 = self.gp32(dst)?;
        self.assembler.movzx(d32, d8).map_err(asm_err)
    }

    // ==== STACK ====

    pub fn push_reg(&mut self, reg: AsmReg) -> Result<(), EncodingError> {
        let r = self.gp64(reg)?;
        self.assembler.push(r).map_err(asm_err)
    }

    pub fn pop_reg(&mut self, reg: AsmReg) -> Result<(), EncodingError> {
        let r = self.gp64(reg)?;
        self.assembler.pop(r).map_err(asm_err)
    }

    // ==== CONTROL FLOW ====

    pub fn ret(&mut self) -> Result<(), EncodingError> {
        self.assembler.ret().map_err(asm_err)
    }

    pub fn call_reg(&mut self, reg: AsmReg) -> Result<(), EncodingError> {
        let r = self.gp64(reg)?;
        self.assembler.call(r).map_err(asm_err)
    }

    pub fn jmp_reg(&mut self, reg: AsmReg) -> Result<(), EncodingError> {
        let r = self.gp64(reg)?;
        self.assembler.jmp(r).map_err(asm_err)
    }

    /// `jmp qword [base + offset]`
    pub fn jmp_mem(&mut self, base: AsmReg, offset: i32) -> Result<(), EncodingError> {
        let b = self.gp64(base)?;
        self.assembler.jmp(qword_ptr(b + offset)).map_err(asm_err)
    }

    pub fn ud2(&mut self) -> Result<(), EncodingError> {
        self.assembler.ud2().map_err(asm_err)
    }

    // ==== LABEL MANAGEMENT FOR CONTROL FLOW ====

    pub fn create_label(&mut self) -> CodeLabel {
        self.assembler.create_label()
    }

    /// Bind `label` to the next emitted instruction.
    pub fn place_label(&mut self, label: &mut CodeLabel) -> Result<(), EncodingError> {
        self.assembler.set_label(label).map_err(asm_err)
    }

    pub fn get_or_create_label_for_block(&mut self, block_id: usize) -> CodeLabel {
        if let Some(&label) = self.block_labels.get(&block_id) {
            label
        } else {
            let label = self.assembler.create_label();
            self.block_labels.insert(block_id, label);
            label
        }
    }

    pub fn place_label_for_block(&mut self, block_id: usize) -> Result<(), EncodingError> {
        let mut label = self.get_or_create_label_for_block(block_id);
        self.assembler.set_label(&mut label).map_err(asm_err)?;
        self.block_labels.insert(block_id, label);
        self.placed_blocks.insert(block_id);
        Ok(())
    }

    pub fn is_block_placed(&self, block_id: usize) -> bool {
        self.placed_blocks.contains(&block_id)
    }

    pub fn jmp_label(&mut self, label: CodeLabel) -> Result<(), EncodingError> {
        self.assembler.jmp(label).map_err(asm_err)
    }

    pub fn jcc_label(&mut self, condition: JumpCondition, label: CodeLabel) -> Result<(), EncodingError> {
        let a = &mut self.assembler;
        match condition {
            JumpCondition::Equal => a.je(label),
            JumpCondition::NotEqual => a.jne(label),
            JumpCondition::Less => a.jl(label),
            JumpCondition::LessEqual => a.jle(label),
            JumpCondition::Greater => a.jg(label),
            JumpCondition::GreaterEqual => a.jge(label),
            JumpCondition::Below => a.jb(label),
            JumpCondition::BelowEqual => a.jbe(label),
            JumpCondition::Above => a.ja(label),
            JumpCondition::AboveEqual => a.jae(label),
        }
        .map_err(asm_err)
    }

    pub fn jmp_to_block(&mut self, target_block: usize) -> Result<(), EncodingError> {
        let label = self.get_or_create_label_for_block(target_block);
        self.jmp_label(label)
    }

    pub fn jcc_to_block(&mut self, condition: JumpCondition, target_block: usize) -> Result<(), EncodingError> {
        let label = self.get_or_create_label_for_block(target_block);
        self.jcc_label(condition, label)
    }

    // ==== FRAME ====

    /// `push rbp; mov rbp, rsp; sub rsp, frame_size`
    pub fn emit_prologue(&mut self, frame_size: u32) -> Result<(), EncodingError> {
        self.push_reg(AsmReg::RBP)?;
        self.mov_reg_reg(AsmReg::RBP, AsmReg::RSP)?;
        if frame_size > 0 {
            self.sub_reg_imm(AsmReg::RSP, frame_size as i32)?;
        }
        Ok(())
    }

    /// `mov rsp, rbp; pop rbp; ret`
    pub fn emit_epilogue(&mut self) -> Result<(), EncodingError> {
        self.mov_reg_reg(AsmReg::RSP, AsmReg::RBP)?;
        self.pop_reg(AsmReg::RBP)?;
        self.ret()
    }

    /// Assemble for address `ip` and report where symbol immediates landed.
    ///
    /// Symbol immediates are zeroed in the output; the relocation supplies the
    /// full value.
    pub fn finalize(&mut self, ip: u64) -> Result<EncodedCode, EncodingError> {
        if let Some(&unplaced) = self
            .block_labels
            .keys()
            .find(|id| !self.placed_blocks.contains(id))
        {
            return Err(EncodingError::UnplacedLabel(unplaced));
        }

        let result = self
            .assembler
            .assemble_options(ip, BlockEncoderOptions::RETURN_NEW_INSTRUCTION_OFFSETS)
            .map_err(asm_err)?;
        let mut bytes = result.inner.code_buffer;
        let offsets = result.inner.new_instruction_offsets;

        let mut symbol_fixups = Vec::with_capacity(self.symbol_moves.len());
        for &(index, symbol) in &self.symbol_moves {
            let start = *offsets.get(index).ok_or_else(|| {
                EncodingError::AssemblyError(format!("no offset for instruction {index}"))
            })? as usize;
            // REX.W + B8+r, then the 8-byte immediate.
            let imm = start + 2;
            if imm + 8 > bytes.len() {
                return Err(EncodingError::AssemblyError(
                    "symbol move was not encoded as mov r64, imm64".to_string(),
                ));
            }
            bytes[imm..imm + 8].fill(0);
            symbol_fixups.push((imm as u64, symbol));
        }

        Ok(EncodedCode {
            bytes,
            symbol_fixups,
        })
    }
}
