// Instruction combining: folds binary operations and comparisons whose operands are known
// constants, rewrites algebraic identities (x+0, x*1, x-x, x&x, ...) to the value or
// constant they compute, moves constants to the right-hand side of commutative operations
// and comparisons, and deletes pure instructions whose results are never used. Division is
// only folded when it cannot trap, so sdiv/srem by zero survive to run time. The pass
// iterates until nothing changes.

use crate::ir::{BinaryOp, Function, InstKind, IntCC, Value};
use hashbrown::HashMap;

enum Simplified {
    Unchanged,
    Rewrite(InstKind),
    Forward(Value),
}

/// Constants defined by `iconst`, keyed by result.
pub(crate) fn constants(func: &Function) -> HashMap<Value, i64> {
    let mut consts = HashMap::new();
    for block in &func.blocks {
        for inst in &block.insts {
            if let (Some(result), InstKind::Iconst(c)) = (inst.result, &inst.kind) {
                consts.insert(result, *c);
            }
        }
    }
    consts
}

fn simplify_binary(op: BinaryOp, a: Value, b: Value, consts: &HashMap<Value, i64>) -> Simplified {
    let (ca, cb) = (consts.get(&a).copied(), consts.get(&b).copied());
    if let (Some(x), Some(y)) = (ca, cb) {
        return match op.eval(x, y) {
            Some(r) => Simplified::Rewrite(InstKind::Iconst(r)),
            None => Simplified::Unchanged,
        };
    }
    if op.is_commutative() && ca.is_some() {
        return Simplified::Rewrite(InstKind::Binary(op, b, a));
    }
    if a == b {
        match op {
            BinaryOp::Sub | BinaryOp::Xor => return Simplified::Rewrite(InstKind::Iconst(0)),
            BinaryOp::And | BinaryOp::Or => return Simplified::Forward(a),
            _ => {}
        }
    }
    match (op, cb) {
        (
            BinaryOp::Add
            | BinaryOp::Sub
            | BinaryOp::Or
            | BinaryOp::Xor
            | BinaryOp::Shl
            | BinaryOp::SShr
            | BinaryOp::UShr,
            Some(0),
        ) => Simplified::Forward(a),
        (BinaryOp::Mul | BinaryOp::SDiv, Some(1)) => Simplified::Forward(a),
        (BinaryOp::And, Some(-1)) => Simplified::Forward(a),
        (BinaryOp::Mul | BinaryOp::And, Some(0)) => Simplified::Rewrite(InstKind::Iconst(0)),
        (BinaryOp::SRem, Some(1)) => Simplified::Rewrite(InstKind::Iconst(0)),
        _ => Simplified::Unchanged,
    }
}

fn simplify_icmp(cc: IntCC, a: Value, b: Value, consts: &HashMap<Value, i64>) -> Simplified {
    let (ca, cb) = (consts.get(&a).copied(), consts.get(&b).copied());
    if let (Some(x), Some(y)) = (ca, cb) {
        return Simplified::Rewrite(InstKind::Iconst(cc.eval(x, y) as i64));
    }
    if ca.is_some() {
        return Simplified::Rewrite(InstKind::Icmp(cc.swapped(), b, a));
    }
    if a == b {
        // Reflexive conditions hold, strict ones do not.
        return Simplified::Rewrite(InstKind::Iconst(cc.eval(0, 0) as i64));
    }
    Simplified::Unchanged
}

fn combine(func: &mut Function) -> usize {
    let consts = constants(func);
    let mut forward: HashMap<Value, Value> = HashMap::new();
    let mut changes = 0;
    for block in &mut func.blocks {
        block.insts.retain_mut(|inst| {
            let simplified = match inst.kind {
                InstKind::Binary(op, a, b) => simplify_binary(op, a, b, &consts),
                InstKind::Icmp(cc, a, b) => simplify_icmp(cc, a, b, &consts),
                _ => Simplified::Unchanged,
            };
            match simplified {
                Simplified::Unchanged => true,
                Simplified::Rewrite(kind) => {
                    inst.kind = kind;
                    changes += 1;
                    true
                }
                Simplified::Forward(to) => match inst.result {
                    Some(result) => {
                        forward.insert(result, to);
                        changes += 1;
                        false
                    }
                    None => true,
                },
            }
        });
    }
    func.replace_uses(&forward);
    changes
}

/// Delete pure instructions without uses; returns how many were removed.
pub(crate) fn eliminate_dead(func: &mut Function) -> usize {
    let mut removed = 0;
    loop {
        let uses = func.use_counts();
        let mut round = 0;
        for block in &mut func.blocks {
            block.insts.retain(|inst| {
                let dead = inst.kind.is_pure() && inst.result.is_some_and(|r| uses[r.index()] == 0);
                round += dead as usize;
                !dead
            });
        }
        if round == 0 {
            return removed;
        }
        removed += round;
    }
}

pub fn run(func: &mut Function) -> usize {
    let mut changes = 0;
    loop {
        let round = combine(func) + eliminate_dead(func);
        if round == 0 {
            return changes;
        }
        changes += round;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::context::ThreadSafeContext;
    use crate::ir::parser::parse_module;
    use crate::ir::Module;

    fn optimized(src: &str) -> Module {
        let ctx = ThreadSafeContext::new();
        let mut module = parse_module(src, "m", &ctx).unwrap();
        for func in &mut module.functions {
            run(func);
        }
        module.verify().unwrap();
        module
    }

    #[test]
    fn test_constant_folding() {
        let module = optimized(
            "define @f() {\nentry:\n  %a = iconst 6\n  %b = iconst 7\n  %c = mul %a, %b\n  %d = icmp sgt %c, %a\n  %e = add %c, %d\n  ret %e\n}\n",
        );
        assert_eq!(
            module.functions[0].to_string(),
            "define @f() {\nentry:\n    %0 = iconst 43\n    ret %0\n}\n"
        );
    }

    #[test]
    fn test_identities() {
        let module = optimized(
            "define @f(%x) {\nentry:\n  %z = iconst 0\n  %o = iconst 1\n  %a = add %x, %z\n  %b = mul %o, %a\n  %c = sub %b, %b\n  %d = or %b, %c\n  ret %d\n}\n",
        );
        assert_eq!(
            module.functions[0].to_string(),
            "define @f(%0) {\nentry:\n    ret %0\n}\n"
        );
    }

    #[test]
    fn test_trapping_division_is_kept() {
        let module = optimized(
            "define @f() {\nentry:\n  %a = iconst 1\n  %z = iconst 0\n  %d = sdiv %a, %z\n  ret %a\n}\n",
        );
        let text = module.functions[0].to_string();
        assert!(text.contains("sdiv"), "{text}");
    }

    #[test]
    fn test_srem_by_minus_one_is_kept() {
        // i64::MIN srem -1 traps.
        let module = optimized(
            "define @f(%x) {\nentry:\n  %m = iconst -1\n  %v = srem %x, %m\n  ret %v\n}\n",
        );
        let text = module.functions[0].to_string();
        assert!(text.contains("srem"), "{text}");

        let module = optimized(
            "define @f(%x) {\nentry:\n  %o = iconst 1\n  %v = srem %x, %o\n  ret %v\n}\n",
        );
        assert_eq!(
            module.functions[0].to_string(),
            "define @f(%0) {\nentry:\n    %1 = iconst 0\n    ret %1\n}\n"
        );
    }

    #[test]
    fn test_constant_moves_to_rhs() {
        let module = optimized(
            "define @f(%x) {\nentry:\n  %c = iconst 5\n  %a = add %c, %x\n  %b = icmp slt %c, %a\n  ret %b\n}\n",
        );
        assert_eq!(
            module.functions[0].to_string(),
            "define @f(%0) {\nentry:\n    %1 = iconst 5\n    %2 = add %0, %1\n    %3 = icmp sgt %2, %1\n    ret %3\n}\n"
        );
    }

    #[test]
    fn test_side_effects_survive() {
        let module = optimized(
            "define @f(%p) {\nentry:\n  %v = load %p\n  %r = call @g(%v)\n  store %p, %v\n  ret %p\n}\n",
        );
        assert_eq!(module.functions[0].instruction_count(), 4);
    }
}
