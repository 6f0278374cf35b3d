// Reassociation: gives commutative operations a canonical operand order and regroups
// constants in chains of associative operations. Operands are ranked (constants lowest,
// other values by definition order) and the higher-ranked operand goes first, so `a+b` and
// `b+a` become the same expression for value numbering. Subtraction of a constant becomes
// addition of its negation, and `(x op c1) op c2` becomes `x op (c1 op c2)` with the folded
// constant materialized right before its use. Intermediate results left without uses are
// removed.

use super::instcombine::{constants, eliminate_dead};
use crate::ir::{BinaryOp, Function, Inst, InstKind, Value};
use hashbrown::HashMap;

fn rank(value: Value, consts: &HashMap<Value, i64>) -> u64 {
    if consts.contains_key(&value) {
        0
    } else {
        value.index() as u64 + 1
    }
}

/// An instruction rewritten to use a freshly materialized constant.
struct Regroup {
    block: usize,
    inst: usize,
    op: BinaryOp,
    lhs: Value,
    constant: i64,
}

fn canonicalize_order(func: &mut Function, consts: &HashMap<Value, i64>) -> usize {
    let mut changes = 0;
    for block in &mut func.blocks {
        for inst in &mut block.insts {
            if let InstKind::Binary(op, a, b) = inst.kind {
                if op.is_commutative() && rank(a, consts) < rank(b, consts) {
                    inst.kind = InstKind::Binary(op, b, a);
                    changes += 1;
                }
            }
        }
    }
    changes
}

fn find_regroups(func: &Function, consts: &HashMap<Value, i64>) -> Vec<Regroup> {
    let mut defs: HashMap<Value, (BinaryOp, Value, Value)> = HashMap::new();
    for block in &func.blocks {
        for inst in &block.insts {
            if let (Some(result), InstKind::Binary(op, a, b)) = (inst.result, &inst.kind) {
                defs.insert(result, (*op, *a, *b));
            }
        }
    }

    let mut regroups = Vec::new();
    for (block_idx, block) in func.blocks.iter().enumerate() {
        for (inst_idx, inst) in block.insts.iter().enumerate() {
            let InstKind::Binary(op, lhs, rhs) = inst.kind else {
                continue;
            };
            let Some(&c2) = consts.get(&rhs) else {
                continue;
            };
            if op == BinaryOp::Sub {
                regroups.push(Regroup {
                    block: block_idx,
                    inst: inst_idx,
                    op: BinaryOp::Add,
                    lhs,
                    constant: c2.wrapping_neg(),
                });
                continue;
            }
            if !op.is_associative() {
                continue;
            }
            let Some(&(inner_op, x, inner_rhs)) = defs.get(&lhs) else {
                continue;
            };
            let Some(&c1) = consts.get(&inner_rhs) else {
                continue;
            };
            if inner_op != op || consts.contains_key(&x) {
                continue;
            }
            if let Some(constant) = op.eval(c1, c2) {
                regroups.push(Regroup {
                    block: block_idx,
                    inst: inst_idx,
                    op,
                    lhs: x,
                    constant,
                });
            }
        }
    }
    regroups
}

fn regroup_constants(func: &mut Function, consts: &HashMap<Value, i64>) -> usize {
    let regroups = find_regroups(func, consts);
    let changes = regroups.len();
    // Later positions first so earlier indices stay valid.
    for regroup in regroups.into_iter().rev() {
        let constant = func.new_value();
        let block = &mut func.blocks[regroup.block];
        block.insts[regroup.inst].kind = InstKind::Binary(regroup.op, regroup.lhs, constant);
        block.insts.insert(
            regroup.inst,
            Inst {
                result: Some(constant),
                kind: InstKind::Iconst(regroup.constant),
            },
        );
    }
    changes
}

pub fn run(func: &mut Function) -> usize {
    let mut changes = 0;
    loop {
        let consts = constants(func);
        let round = regroup_constants(func, &consts);
        if round == 0 {
            break;
        }
        changes += round;
    }
    let consts = constants(func);
    changes += canonicalize_order(func, &consts);
    changes + eliminate_dead(func)
}
