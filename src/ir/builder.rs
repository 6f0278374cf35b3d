// This module provides FunctionBuilder, the programmatic way for a front-end to emit IR.
// The builder keeps a cursor on the current block, appends instructions to it and returns
// the SSA values they define. Symbol operands are interned through the module's shared
// context so calls and address-of references compare cheaply against definitions.

//! Cursor-style builder for function bodies.

use super::{BinaryOp, BlockCall, BlockId, Function, Inst, InstKind, IntCC, Terminator, Value};
use crate::core::context::ThreadSafeContext;

pub struct FunctionBuilder<'f> {
    func: &'f mut Function,
    context: ThreadSafeContext,
    current: BlockId,
}

impl<'f> FunctionBuilder<'f> {
    pub fn new(func: &'f mut Function, context: ThreadSafeContext) -> Self {
        Self {
            func,
            context,
            current: BlockId::ENTRY,
        }
    }

    /// Function parameters (the entry block's parameters).
    pub fn params(&self) -> Vec<Value> {
        self.func.params().to_vec()
    }

    /// Create a block with `param_count` parameters; returns its id and parameters.
    pub fn create_block(&mut self, name: &str, param_count: usize) -> (BlockId, Vec<Value>) {
        let id = self.func.create_block(name, param_count);
        (id, self.func.block(id).params.clone())
    }

    pub fn switch_to_block(&mut self, block: BlockId) {
        self.current = block;
    }

    pub fn current_block(&self) -> BlockId {
        self.current
    }

    fn push(&mut self, kind: InstKind, has_result: bool) -> Option<Value> {
        let result = has_result.then(|| self.func.new_value());
        self.func
            .block_mut(self.current)
            .insts
            .push(Inst { result, kind });
        result
    }

    fn push_value(&mut self, kind: InstKind) -> Value {
        let result = self.func.new_value();
        self.func.block_mut(self.current).insts.push(Inst {
            result: Some(result),
            kind,
        });
        result
    }

    pub fn iconst(&mut self, value: i64) -> Value {
        self.push_value(InstKind::Iconst(value))
    }

    pub fn binary(&mut self, op: BinaryOp, lhs: Value, rhs: Value) -> Value {
        self.push_value(InstKind::Binary(op, lhs, rhs))
    }

    pub fn add(&mut self, lhs: Value, rhs: Value) -> Value {
        self.binary(BinaryOp::Add, lhs, rhs)
    }

    pub fn sub(&mut self, lhs: Value, rhs: Value) -> Value {
        self.binary(BinaryOp::Sub, lhs, rhs)
    }

    pub fn mul(&mut self, lhs: Value, rhs: Value) -> Value {
        self.binary(BinaryOp::Mul, lhs, rhs)
    }

    pub fn icmp(&mut self, cc: IntCC, lhs: Value, rhs: Value) -> Value {
        self.push_value(InstKind::Icmp(cc, lhs, rhs))
    }

    /// Call returning a value.
    pub fn call(&mut self, callee: &str, args: &[Value]) -> Value {
        let callee = self.context.intern(callee);
        self.push_value(InstKind::Call {
            callee,
            args: args.to_vec(),
        })
    }

    /// Call whose result is discarded.
    pub fn call_void(&mut self, callee: &str, args: &[Value]) {
        let callee = self.context.intern(callee);
        self.push(
            InstKind::Call {
                callee,
                args: args.to_vec(),
            },
            false,
        );
    }

    /// Address of a function or global.
    pub fn symbol_addr(&mut self, name: &str) -> Value {
        let sym = self.context.intern(name);
        self.push_value(InstKind::SymbolAddr(sym))
    }

    pub fn load(&mut self, addr: Value) -> Value {
        self.push_value(InstKind::Load(addr))
    }

    pub fn store(&mut self, addr: Value, value: Value) {
        self.push(InstKind::Store { addr, value }, false);
    }

    pub fn ret(&mut self, value: Option<Value>) {
        self.func.block_mut(self.current).terminator = Terminator::Return(value);
    }

    pub fn jump(&mut self, dest: BlockId, args: &[Value]) {
        self.func.block_mut(self.current).terminator = Terminator::Jump(BlockCall {
            block: dest,
            args: args.to_vec(),
        });
    }

    pub fn branch(
        &mut self,
        cond: Value,
        then_block: BlockId,
        then_args: &[Value],
        else_block: BlockId,
        else_args: &[Value],
    ) {
        self.func.block_mut(self.current).terminator = Terminator::Branch {
            cond,
            then_dest: BlockCall {
                block: then_block,
                args: then_args.to_vec(),
            },
            else_dest: BlockCall {
                block: else_block,
                args: else_args.to_vec(),
            },
        };
    }
}

#[cfg(test)]
mod tests {
    use crate::core::context::ThreadSafeContext;
    use crate::ir::{InstKind, Linkage, Module, Terminator};

    #[test]
    fn test_builds_loop() {
        let ctx = ThreadSafeContext::new();
        let mut module = Module::new("loop", &ctx);
        let mut b = module.add_function("sum_to", Linkage::Exported, 1, true);
        let n = b.params()[0];
        let zero = b.iconst(0);
        let (header, hp) = b.create_block("header", 2);
        let (exit, ep) = b.create_block("exit", 1);
        b.jump(header, &[zero, zero]);

        b.switch_to_block(header);
        let one = b.iconst(1);
        let i = b.add(hp[0], one);
        let acc = b.add(hp[1], i);
        let done = b.icmp(crate::ir::IntCC::Sge, i, n);
        b.branch(done, exit, &[acc], header, &[i, acc]);

        b.switch_to_block(exit);
        b.ret(Some(ep[0]));

        module.verify().unwrap();
        let func = &module.functions[0];
        assert_eq!(func.blocks.len(), 3);
        assert!(matches!(func.blocks[1].terminator, Terminator::Branch { .. }));
        assert!(matches!(func.blocks[0].insts[0].kind, InstKind::Iconst(0)));
    }

    #[test]
    fn test_block_labels_are_unique() {
        let ctx = ThreadSafeContext::new();
        let mut module = Module::new("m", &ctx);
        let mut b = module.add_function("f", Linkage::Internal, 0, false);
        let (a, _) = b.create_block("bb", 0);
        let (c, _) = b.create_block("bb", 0);
        b.jump(a, &[]);
        b.switch_to_block(a);
        b.jump(c, &[]);
        b.switch_to_block(c);
        b.ret(None);
        let func = &module.functions[0];
        assert_ne!(func.blocks[1].name, func.blocks[2].name);
    }
}
