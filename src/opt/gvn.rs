// Global value numbering over the dominator tree. Blocks are visited in dominator-tree
// preorder with a scoped table from expression to value: a pure instruction whose expression
// is already available from a dominating block is deleted and its uses are redirected to the
// earlier value. Expressions are keyed on operands after earlier replacements, with
// commutative operands and comparison operands put in a canonical order, so the table sees
// through chains of redundancy in a single walk. Instructions with side effects and loads
// are never numbered.

use super::cfg::{ControlFlowGraph, DominatorTree};
use crate::ir::{BlockId, Function, InstKind, Value};
use hashbrown::{HashMap, HashSet};

fn resolve(value: Value, replaced: &HashMap<Value, Value>) -> Value {
    let mut v = value;
    while let Some(&next) = replaced.get(&v) {
        v = next;
    }
    v
}

/// Canonical expression of a pure instruction, or `None` when it is not numbered.
fn expression(kind: &InstKind, replaced: &HashMap<Value, Value>) -> Option<InstKind> {
    if !kind.is_pure() {
        return None;
    }
    Some(match kind {
        InstKind::Binary(op, a, b) => {
            let (a, b) = (resolve(*a, replaced), resolve(*b, replaced));
            if op.is_commutative() && b < a {
                InstKind::Binary(*op, b, a)
            } else {
                InstKind::Binary(*op, a, b)
            }
        }
        InstKind::Icmp(cc, a, b) => {
            let (a, b) = (resolve(*a, replaced), resolve(*b, replaced));
            if b < a {
                InstKind::Icmp(cc.swapped(), b, a)
            } else {
                InstKind::Icmp(*cc, a, b)
            }
        }
        other => other.clone(),
    })
}

enum Visit {
    Enter(BlockId),
    Leave(usize),
}

pub fn run(func: &mut Function) -> usize {
    let dom = DominatorTree::compute(&ControlFlowGraph::compute(func));
    let mut available: HashMap<InstKind, Value> = HashMap::new();
    let mut scope: Vec<InstKind> = Vec::new();
    let mut replaced: HashMap<Value, Value> = HashMap::new();

    let mut stack = vec![Visit::Enter(BlockId::ENTRY)];
    while let Some(visit) = stack.pop() {
        let block = match visit {
            Visit::Enter(block) => block,
            Visit::Leave(depth) => {
                for key in scope.drain(depth..) {
                    available.remove(&key);
                }
                continue;
            }
        };
        stack.push(Visit::Leave(scope.len()));
        for inst in &func.block(block).insts {
            let Some(result) = inst.result else {
                continue;
            };
            let Some(key) = expression(&inst.kind, &replaced) else {
                continue;
            };
            match available.get(&key) {
                Some(&existing) => {
                    replaced.insert(result, existing);
                }
                None => {
                    available.insert(key.clone(), result);
                    scope.push(key);
                }
            }
        }
        for &child in dom.children(block).iter().rev() {
            stack.push(Visit::Enter(child));
        }
    }

    if replaced.is_empty() {
        return 0;
    }
    let redundant: HashSet<Value> = replaced.keys().copied().collect();
    for block in &mut func.blocks {
        block
            .insts
            .retain(|inst| !inst.result.is_some_and(|r| redundant.contains(&r)));
    }
    func.replace_uses(&replaced);
    redundant.len()
}
