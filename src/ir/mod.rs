// This module defines the intermediate representation accepted by the JIT. A Module owns
// function and global data definitions and is tied to a shared ThreadSafeContext so that
// symbol names interned by different modules compare by identity. Functions are lists of
// basic blocks in SSA form: every Value is a 64-bit machine word defined exactly once,
// either as a block parameter or as the result of an instruction. Block parameters replace
// PHI nodes, and the entry block's parameters are the function arguments. Terminators pass
// arguments to the parameters of their successor blocks. The instruction set is deliberately
// small (integer arithmetic, comparisons, calls, symbol addresses, loads and stores) since the
// front-end owns the language semantics and the backend only has to lower word operations.
// Module::verify checks structural well-formedness before optimization and code generation.

//! Intermediate representation for JIT compilation.
//!
//! The format mirrors what a language front-end lowers its AST into:
//!
//! ```text
//! ; Comments start with semicolon
//! global internal const @greeting = "hi\00"
//! define @max(%a, %b) {
//! entry(%a, %b):
//!     %c = icmp sgt %a, %b
//!     br %c, yes(%a), yes(%b)
//! yes(%r):
//!     ret %r
//! }
//! ```

use crate::core::context::{Symbol, ThreadSafeContext};
use crate::core::error::{CompileError, CompileResult};
use hashbrown::{HashMap, HashSet};
use std::fmt;

pub mod builder;
pub mod parser;
mod display;

pub use builder::FunctionBuilder;

/// SSA value, unique within its function.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Value(pub(crate) u32);

impl Value {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "%v{}", self.0)
    }
}

/// Index of a basic block within its function.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BlockId(pub(crate) u32);

impl BlockId {
    pub const ENTRY: BlockId = BlockId(0);

    pub fn index(self) -> usize {
        self.0 as usize
    }
}

/// Symbol visibility outside of the defining module.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Linkage {
    /// Visible to other modules and to session lookups.
    Exported,
    /// Only visible to code in the same module.
    Internal,
}

/// Two-operand integer operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    SDiv,
    SRem,
    And,
    Or,
    Xor,
    Shl,
    SShr,
    UShr,
}

impl BinaryOp {
    pub const ALL: [BinaryOp; 11] = [
        BinaryOp::Add,
        BinaryOp::Sub,
        BinaryOp::Mul,
        BinaryOp::SDiv,
        BinaryOp::SRem,
        BinaryOp::And,
        BinaryOp::Or,
        BinaryOp::Xor,
        BinaryOp::Shl,
        BinaryOp::SShr,
        BinaryOp::UShr,
    ];

    pub const fn name(self) -> &'static str {
        match self {
            BinaryOp::Add => "add",
            BinaryOp::Sub => "sub",
            BinaryOp::Mul => "mul",
            BinaryOp::SDiv => "sdiv",
            BinaryOp::SRem => "srem",
            BinaryOp::And => "and",
            BinaryOp::Or => "or",
            BinaryOp::Xor => "xor",
            BinaryOp::Shl => "shl",
            BinaryOp::SShr => "sshr",
            BinaryOp::UShr => "ushr",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.iter().copied().find(|op| op.name() == name)
    }

    /// `a op b == b op a`.
    pub const fn is_commutative(self) -> bool {
        matches!(
            self,
            BinaryOp::Add | BinaryOp::Mul | BinaryOp::And | BinaryOp::Or | BinaryOp::Xor
        )
    }

    /// `(a op b) op c == a op (b op c)`.
    pub const fn is_associative(self) -> bool {
        self.is_commutative()
    }

    /// Evaluate on constants with two's complement wrapping.
    ///
    /// Returns `None` when the operation would trap at run time (division by
    /// zero or `i64::MIN / -1`), so such instructions are never folded away.
    pub fn eval(self, lhs: i64, rhs: i64) -> Option<i64> {
        Some(match self {
            BinaryOp::Add => lhs.wrapping_add(rhs),
            BinaryOp::Sub => lhs.wrapping_sub(rhs),
            BinaryOp::Mul => lhs.wrapping_mul(rhs),
            BinaryOp::SDiv => {
                if rhs == 0 || (lhs == i64::MIN && rhs == -1) {
                    return None;
                }
                lhs / rhs
            }
            BinaryOp::SRem => {
                if rhs == 0 || (lhs == i64::MIN && rhs == -1) {
                    return None;
                }
                lhs % rhs
            }
            BinaryOp::And => lhs & rhs,
            BinaryOp::Or => lhs | rhs,
            BinaryOp::Xor => lhs ^ rhs,
            // x86 masks the shift count to six bits
            BinaryOp::Shl => lhs.wrapping_shl((rhs & 63) as u32),
            BinaryOp::SShr => lhs.wrapping_shr((rhs & 63) as u32),
            BinaryOp::UShr => ((lhs as u64).wrapping_shr((rhs & 63) as u32)) as i64,
        })
    }
}

/// Integer comparison condition codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IntCC {
    Eq,
    Ne,
    Slt,
    Sle,
    Sgt,
    Sge,
    Ult,
    Ule,
    Ugt,
    Uge,
}

impl IntCC {
    pub const ALL: [IntCC; 10] = [
        IntCC::Eq,
        IntCC::Ne,
        IntCC::Slt,
        IntCC::Sle,
        IntCC::Sgt,
        IntCC::Sge,
        IntCC::Ult,
        IntCC::Ule,
        IntCC::Ugt,
        IntCC::Uge,
    ];

    pub const fn name(self) -> &'static str {
        match self {
            IntCC::Eq => "eq",
            IntCC::Ne => "ne",
            IntCC::Slt => "slt",
            IntCC::Sle => "sle",
            IntCC::Sgt => "sgt",
            IntCC::Sge => "sge",
            IntCC::Ult => "ult",
            IntCC::Ule => "ule",
            IntCC::Ugt => "ugt",
            IntCC::Uge => "uge",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.iter().copied().find(|cc| cc.name() == name)
    }

    /// Condition that holds for `(b, a)` whenever `self` holds for `(a, b)`.
    pub const fn swapped(self) -> Self {
        match self {
            IntCC::Eq => IntCC::Eq,
            IntCC::Ne => IntCC::Ne,
            IntCC::Slt => IntCC::Sgt,
            IntCC::Sle => IntCC::Sge,
            IntCC::Sgt => IntCC::Slt,
            IntCC::Sge => IntCC::Sle,
            IntCC::Ult => IntCC::Ugt,
            IntCC::Ule => IntCC::Uge,
            IntCC::Ugt => IntCC::Ult,
            IntCC::Uge => IntCC::Ule,
        }
    }

    pub fn eval(self, lhs: i64, rhs: i64) -> bool {
        let (ul, ur) = (lhs as u64, rhs as u64);
        match self {
            IntCC::Eq => lhs == rhs,
            IntCC::Ne => lhs != rhs,
            IntCC::Slt => lhs < rhs,
            IntCC::Sle => lhs <= rhs,
            IntCC::Sgt => lhs > rhs,
            IntCC::Sge => lhs >= rhs,
            IntCC::Ult => ul < ur,
            IntCC::Ule => ul <= ur,
            IntCC::Ugt => ul > ur,
            IntCC::Uge => ul >= ur,
        }
    }
}

/// Instruction payload.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum InstKind {
    Iconst(i64),
    Binary(BinaryOp, Value, Value),
    Icmp(IntCC, Value, Value),
    Call { callee: Symbol, args: Vec<Value> },
    SymbolAddr(Symbol),
    Load(Value),
    Store { addr: Value, value: Value },
}

impl InstKind {
    /// Operands read by the instruction, in order.
    pub fn operands(&self) -> Vec<Value> {
        match self {
            InstKind::Iconst(_) | InstKind::SymbolAddr(_) => Vec::new(),
            InstKind::Binary(_, a, b) | InstKind::Icmp(_, a, b) => vec![*a, *b],
            InstKind::Call { args, .. } => args.clone(),
            InstKind::Load(addr) => vec![*addr],
            InstKind::Store { addr, value } => vec![*addr, *value],
        }
    }

    fn operands_mut(&mut self) -> Vec<&mut Value> {
        match self {
            InstKind::Iconst(_) | InstKind::SymbolAddr(_) => Vec::new(),
            InstKind::Binary(_, a, b) | InstKind::Icmp(_, a, b) => vec![a, b],
            InstKind::Call { args, .. } => args.iter_mut().collect(),
            InstKind::Load(addr) => vec![addr],
            InstKind::Store { addr, value } => vec![addr, value],
        }
    }

    /// No side effects and no dependence on memory: removable when unused and
    /// mergeable when identical.
    pub fn is_pure(&self) -> bool {
        match self {
            InstKind::Iconst(_) | InstKind::Icmp(..) | InstKind::SymbolAddr(_) => true,
            // Division may trap.
            InstKind::Binary(op, ..) => !matches!(op, BinaryOp::SDiv | BinaryOp::SRem),
            InstKind::Call { .. } | InstKind::Load(_) | InstKind::Store { .. } => false,
        }
    }

    pub fn referenced_symbol(&self) -> Option<&Symbol> {
        match self {
            InstKind::Call { callee, .. } => Some(callee),
            InstKind::SymbolAddr(sym) => Some(sym),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Inst {
    pub result: Option<Value>,
    pub kind: InstKind,
}

/// Control transfer to a block, supplying its parameters.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BlockCall {
    pub block: BlockId,
    pub args: Vec<Value>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Terminator {
    /// Placeholder for blocks still under construction; rejected by `verify`.
    Unterminated,
    Return(Option<Value>),
    Jump(BlockCall),
    Branch {
        cond: Value,
        then_dest: BlockCall,
        else_dest: BlockCall,
    },
}

impl Terminator {
    pub fn successors(&self) -> Vec<BlockId> {
        match self {
            Terminator::Unterminated | Terminator::Return(_) => Vec::new(),
            Terminator::Jump(dest) => vec![dest.block],
            Terminator::Branch {
                then_dest,
                else_dest,
                ..
            } => vec![then_dest.block, else_dest.block],
        }
    }

    pub fn block_calls(&self) -> Vec<&BlockCall> {
        match self {
            Terminator::Unterminated | Terminator::Return(_) => Vec::new(),
            Terminator::Jump(dest) => vec![dest],
            Terminator::Branch {
                then_dest,
                else_dest,
                ..
            } => vec![then_dest, else_dest],
        }
    }

    pub fn block_calls_mut(&mut self) -> Vec<&mut BlockCall> {
        match self {
            Terminator::Unterminated | Terminator::Return(_) => Vec::new(),
            Terminator::Jump(dest) => vec![dest],
            Terminator::Branch {
                then_dest,
                else_dest,
                ..
            } => vec![then_dest, else_dest],
        }
    }

    pub fn operands(&self) -> Vec<Value> {
        match self {
            Terminator::Unterminated | Terminator::Return(None) => Vec::new(),
            Terminator::Return(Some(v)) => vec![*v],
            Terminator::Jump(dest) => dest.args.clone(),
            Terminator::Branch {
                cond,
                then_dest,
                else_dest,
            } => {
                let mut ops = vec![*cond];
                ops.extend_from_slice(&then_dest.args);
                ops.extend_from_slice(&else_dest.args);
                ops
            }
        }
    }

    fn operands_mut(&mut self) -> Vec<&mut Value> {
        match self {
            Terminator::Unterminated | Terminator::Return(None) => Vec::new(),
            Terminator::Return(Some(v)) => vec![v],
            Terminator::Jump(dest) => dest.args.iter_mut().collect(),
            Terminator::Branch {
                cond,
                then_dest,
                else_dest,
            } => {
                let mut ops = vec![cond];
                ops.extend(then_dest.args.iter_mut());
                ops.extend(else_dest.args.iter_mut());
                ops
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Block {
    pub name: String,
    pub params: Vec<Value>,
    pub insts: Vec<Inst>,
    pub terminator: Terminator,
}

impl Block {
    fn new(name: String, params: Vec<Value>) -> Self {
        Self {
            name,
            params,
            insts: Vec::new(),
            terminator: Terminator::Unterminated,
        }
    }
}

/// A function definition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Function {
    pub name: Symbol,
    pub linkage: Linkage,
    /// Whether `ret` carries a value.
    pub returns: bool,
    pub blocks: Vec<Block>,
    next_value: u32,
}

impl Function {
    /// Create a function whose entry block holds `param_count` parameters.
    pub fn new(name: Symbol, linkage: Linkage, param_count: usize, returns: bool) -> Self {
        let mut func = Self {
            name,
            linkage,
            returns,
            blocks: Vec::new(),
            next_value: 0,
        };
        func.create_block("entry", param_count);
        func
    }

    pub fn params(&self) -> &[Value] {
        &self.blocks[0].params
    }

    pub fn param_count(&self) -> usize {
        self.blocks[0].params.len()
    }

    /// Upper bound (exclusive) of value indices used in this function.
    pub fn value_count(&self) -> usize {
        self.next_value as usize
    }

    pub fn new_value(&mut self) -> Value {
        let v = Value(self.next_value);
        self.next_value += 1;
        v
    }

    /// Append a block. Labels are made unique so the text form round-trips.
    pub fn create_block(&mut self, name: &str, param_count: usize) -> BlockId {
        let params = (0..param_count).map(|_| self.new_value()).collect();
        let id = BlockId(self.blocks.len() as u32);
        let mut label = name.to_string();
        let mut suffix = self.blocks.len();
        while self.blocks.iter().any(|b| b.name == label) {
            label = format!("{name}{suffix}");
            suffix += 1;
        }
        self.blocks.push(Block::new(label, params));
        id
    }

    pub fn block_by_name(&self, name: &str) -> Option<BlockId> {
        self.blocks
            .iter()
            .position(|b| b.name == name)
            .map(|idx| BlockId(idx as u32))
    }

    pub fn block(&self, id: BlockId) -> &Block {
        &self.blocks[id.index()]
    }

    pub fn block_mut(&mut self, id: BlockId) -> &mut Block {
        &mut self.blocks[id.index()]
    }

    pub fn block_ids(&self) -> impl Iterator<Item = BlockId> {
        (0..self.blocks.len() as u32).map(BlockId)
    }

    pub fn instruction_count(&self) -> usize {
        self.blocks.iter().map(|b| b.insts.len() + 1).sum()
    }

    pub fn is_exported(&self) -> bool {
        self.linkage == Linkage::Exported
    }

    /// Number of uses of each value, indexed by `Value::index`.
    pub fn use_counts(&self) -> Vec<u32> {
        let mut counts = vec![0u32; self.value_count()];
        for block in &self.blocks {
            for inst in &block.insts {
                for op in inst.kind.operands() {
                    counts[op.index()] += 1;
                }
            }
            for op in block.terminator.operands() {
                counts[op.index()] += 1;
            }
        }
        counts
    }

    /// Rewrite every use according to `map`, following replacement chains.
    pub fn replace_uses(&mut self, map: &HashMap<Value, Value>) {
        if map.is_empty() {
            return;
        }
        let resolve = |mut v: Value| {
            let mut steps = 0;
            while let Some(&next) = map.get(&v) {
                v = next;
                steps += 1;
                if steps > map.len() {
                    break;
                }
            }
            v
        };
        for block in &mut self.blocks {
            for inst in &mut block.insts {
                for op in inst.kind.operands_mut() {
                    *op = resolve(*op);
                }
            }
            for op in block.terminator.operands_mut() {
                *op = resolve(*op);
            }
        }
    }

    /// Drop blocks whose `keep` flag is false and renumber the survivors.
    ///
    /// The entry block must be kept and no surviving terminator may target a
    /// dropped block.
    pub fn retain_blocks(&mut self, keep: &[bool]) {
        debug_assert!(keep[0], "entry block must survive");
        let mut remap = vec![None; self.blocks.len()];
        let mut next = 0u32;
        for (idx, &k) in keep.iter().enumerate() {
            if k {
                remap[idx] = Some(BlockId(next));
                next += 1;
            }
        }
        let old = std::mem::take(&mut self.blocks);
        for (idx, mut block) in old.into_iter().enumerate() {
            if !keep[idx] {
                continue;
            }
            for call in block.terminator.block_calls_mut() {
                if let Some(new_id) = remap[call.block.index()] {
                    call.block = new_id;
                }
            }
            self.blocks.push(block);
        }
    }

    fn verify(&self) -> CompileResult<()> {
        let fail = |reason: String| CompileError::InvalidIr {
            function: self.name.to_string(),
            reason,
        };

        let mut defined = HashSet::new();
        for block in &self.blocks {
            for &param in &block.params {
                if !defined.insert(param) {
                    return Err(fail(format!("{param} defined more than once")));
                }
            }
            for inst in &block.insts {
                if let Some(result) = inst.result {
                    if !defined.insert(result) {
                        return Err(fail(format!("{result} defined more than once")));
                    }
                }
                let needs_result = !matches!(inst.kind, InstKind::Store { .. } | InstKind::Call { .. });
                if needs_result && inst.result.is_none() {
                    return Err(fail(format!("instruction in block {} has no result", block.name)));
                }
                if matches!(inst.kind, InstKind::Store { .. }) && inst.result.is_some() {
                    return Err(fail("store cannot define a value".to_string()));
                }
            }
        }

        for block in &self.blocks {
            for inst in &block.insts {
                for op in inst.kind.operands() {
                    if !defined.contains(&op) {
                        return Err(fail(format!("{op} used in block {} is never defined", block.name)));
                    }
                }
            }
            for op in block.terminator.operands() {
                if !defined.contains(&op) {
                    return Err(fail(format!("{op} used in block {} is never defined", block.name)));
                }
            }
            match &block.terminator {
                Terminator::Unterminated => {
                    return Err(fail(format!("block {} has no terminator", block.name)));
                }
                Terminator::Return(value) => {
                    if value.is_some() != self.returns {
                        return Err(fail(format!(
                            "return in block {} does not match the function signature",
                            block.name
                        )));
                    }
                }
                _ => {}
            }
            for call in block.terminator.block_calls() {
                let Some(target) = self.blocks.get(call.block.index()) else {
                    return Err(fail(format!("block {} branches to an unknown block", block.name)));
                };
                if call.block == BlockId::ENTRY {
                    return Err(fail("the entry block cannot be a branch target".to_string()));
                }
                if target.params.len() != call.args.len() {
                    return Err(fail(format!(
                        "branch from {} to {} passes {} arguments, expected {}",
                        block.name,
                        target.name,
                        call.args.len(),
                        target.params.len()
                    )));
                }
            }
        }
        Ok(())
    }
}

/// Statically initialised data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GlobalData {
    pub name: Symbol,
    pub linkage: Linkage,
    pub bytes: Vec<u8>,
    pub writable: bool,
}

/// A unit of IR submitted to the JIT in one `add_module` call.
#[derive(Debug, Clone)]
pub struct Module {
    pub name: String,
    context: ThreadSafeContext,
    pub functions: Vec<Function>,
    pub globals: Vec<GlobalData>,
}

impl Module {
    pub fn new(name: &str, context: &ThreadSafeContext) -> Self {
        Self {
            name: name.to_string(),
            context: context.clone(),
            functions: Vec::new(),
            globals: Vec::new(),
        }
    }

    pub fn context(&self) -> &ThreadSafeContext {
        &self.context
    }

    pub fn intern(&self, name: &str) -> Symbol {
        self.context.intern(name)
    }

    /// Start a new function and return a builder positioned at its entry block.
    pub fn add_function(
        &mut self,
        name: &str,
        linkage: Linkage,
        param_count: usize,
        returns: bool,
    ) -> FunctionBuilder<'_> {
        let func = Function::new(self.context.intern(name), linkage, param_count, returns);
        let idx = self.functions.len();
        self.functions.push(func);
        let context = self.context.clone();
        FunctionBuilder::new(&mut self.functions[idx], context)
    }

    pub fn add_global(&mut self, name: &str, linkage: Linkage, bytes: Vec<u8>, writable: bool) {
        self.globals.push(GlobalData {
            name: self.context.intern(name),
            linkage,
            bytes,
            writable,
        });
    }

    /// Writable 64-bit global with an initial value.
    pub fn add_global_i64(&mut self, name: &str, linkage: Linkage, value: i64) {
        self.add_global(name, linkage, value.to_le_bytes().to_vec(), true);
    }

    pub fn function(&self, name: &str) -> Option<&Function> {
        self.functions.iter().find(|f| &*f.name == name)
    }

    pub fn function_mut(&mut self, name: &str) -> Option<&mut Function> {
        self.functions.iter_mut().find(|f| &*f.name == name)
    }

    pub fn defines(&self, name: &str) -> bool {
        self.functions.iter().any(|f| &*f.name == name)
            || self.globals.iter().any(|g| &*g.name == name)
    }

    /// Names visible outside the module.
    pub fn exported_symbols(&self) -> Vec<Symbol> {
        let funcs = self
            .functions
            .iter()
            .filter(|f| f.linkage == Linkage::Exported)
            .map(|f| f.name.clone());
        let globals = self
            .globals
            .iter()
            .filter(|g| g.linkage == Linkage::Exported)
            .map(|g| g.name.clone());
        funcs.chain(globals).collect()
    }

    /// Symbols referenced by code in this module but not defined by it.
    pub fn external_references(&self) -> Vec<Symbol> {
        let mut refs: Vec<Symbol> = self
            .functions
            .iter()
            .flat_map(|f| f.blocks.iter())
            .flat_map(|b| b.insts.iter())
            .filter_map(|inst| inst.kind.referenced_symbol())
            .filter(|sym| !self.defines(sym))
            .cloned()
            .collect();
        refs.sort();
        refs.dedup();
        refs
    }

    /// Check that every function is well formed and that names are unique.
    pub fn verify(&self) -> CompileResult<()> {
        let mut names = HashSet::new();
        let all_names = self
            .functions
            .iter()
            .map(|f| &f.name)
            .chain(self.globals.iter().map(|g| &g.name));
        for name in all_names {
            if !names.insert(name.clone()) {
                return Err(CompileError::InvalidIr {
                    function: name.to_string(),
                    reason: format!("symbol defined more than once in module {}", self.name),
                });
            }
        }
        for func in &self.functions {
            func.verify()?;
        }
        Ok(())
    }
}
