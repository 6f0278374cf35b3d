// CFG simplification. Branches on a constant condition become jumps to the taken arm, and a
// branch whose arms are the same block call becomes a jump. Blocks that can no longer be
// reached from the entry are deleted, and a block whose only predecessor ends in an
// unconditional jump to it is merged into that predecessor, with its parameters replaced by
// the jump arguments. The pass repeats until the graph stops changing, then drops the
// pure instructions its folds left without uses.

use super::cfg::ControlFlowGraph;
use super::instcombine::{constants, eliminate_dead};
use crate::ir::{BlockCall, BlockId, Function, Terminator, Value};
use hashbrown::{HashMap, HashSet};

fn fold_branches(func: &mut Function) -> usize {
    let consts = constants(func);
    let mut changes = 0;
    for block in &mut func.blocks {
        let Terminator::Branch {
            cond,
            then_dest,
            else_dest,
        } = &block.terminator
        else {
            continue;
        };
        let taken = match consts.get(cond) {
            Some(0) => else_dest.clone(),
            Some(_) => then_dest.clone(),
            None if then_dest == else_dest => then_dest.clone(),
            None => continue,
        };
        block.terminator = Terminator::Jump(taken);
        changes += 1;
    }
    changes
}

fn remove_unreachable(func: &mut Function) -> usize {
    let reachable = ControlFlowGraph::compute(func).reachable();
    let dead = reachable.iter().filter(|r| !**r).count();
    if dead == 0 {
        return 0;
    }

    // Keep everything if a live block still reads a value defined in a dead one.
    let mut dead_defs: HashSet<Value> = HashSet::new();
    for (idx, block) in func.blocks.iter().enumerate() {
        if !reachable[idx] {
            dead_defs.extend(block.params.iter().copied());
            dead_defs.extend(block.insts.iter().filter_map(|inst| inst.result));
        }
    }
    let escapes = func
        .blocks
        .iter()
        .enumerate()
        .filter(|(idx, _)| reachable[*idx])
        .any(|(_, block)| {
            block
                .insts
                .iter()
                .flat_map(|inst| inst.kind.operands())
                .chain(block.terminator.operands())
                .any(|v| dead_defs.contains(&v))
        });
    if escapes {
        log::warn!("{}: unreachable block defines a live value; keeping it", func.name);
        return 0;
    }

    func.retain_blocks(&reachable);
    dead
}

/// Merge one block into its sole predecessor; returns whether anything changed.
fn merge_one(func: &mut Function) -> bool {
    let cfg = ControlFlowGraph::compute(func);
    let reachable = cfg.reachable();
    let candidate = func.block_ids().find_map(|pred| {
        if !reachable[pred.index()] {
            return None;
        }
        let Terminator::Jump(call) = &func.block(pred).terminator else {
            return None;
        };
        let succ = call.block;
        let single = cfg.predecessors(succ) == [pred];
        (succ != pred && succ != BlockId::ENTRY && single).then_some((pred, succ))
    });
    let Some((pred, succ)) = candidate else {
        return false;
    };

    // The emptied block loops on itself until unreachable blocks are removed.
    let parked = Terminator::Jump(BlockCall {
        block: succ,
        args: Vec::new(),
    });
    let absorbed = func.block_mut(succ);
    let params = std::mem::take(&mut absorbed.params);
    let moved = std::mem::take(&mut absorbed.insts);
    let terminator = std::mem::replace(&mut absorbed.terminator, parked);

    let target = func.block_mut(pred);
    let Terminator::Jump(call) = std::mem::replace(&mut target.terminator, terminator) else {
        return false;
    };
    target.insts.extend(moved);

    let forward: HashMap<Value, Value> = params.into_iter().zip(call.args).collect();
    func.replace_uses(&forward);
    true
}

pub fn run(func: &mut Function) -> usize {
    let mut changes = 0;
    loop {
        let mut round = fold_branches(func);
        round += remove_unreachable(func);
        if merge_one(func) {
            round += 1;
        }
        if round == 0 {
            break;
        }
        changes += round;
    }
    if changes > 0 {
        // Folded branch conditions are usually dead now.
        changes += eliminate_dead(func);
    }
    changes
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::context::ThreadSafeContext;
    use crate::ir::parser::parse_module;

    fn simplified(src: &str) -> String {
        let ctx = ThreadSafeContext::new();
        let mut module = parse_module(src, "m", &ctx).unwrap();
        run(&mut module.functions[0]);
        module.verify().unwrap();
        module.functions[0].to_string()
    }

    #[test]
    fn test_constant_branch_is_folded_and_merged() {
        let text = simplified(
            "define @f(%x) {\nentry:\n  %t = iconst 1\n  br %t, yes(%x), no\nyes(%a):\n  ret %a\nno:\n  %z = iconst 0\n  ret %z\n}\n",
        );
        assert_eq!(
            text,
            "define @f(%0) {\nentry:\n    ret %0\n}\n"
        );
    }

    #[test]
    fn test_false_branch_takes_else_arm() {
        let text = simplified(
            "define @f(%x) {\nentry:\n  %t = iconst 0\n  br %t, yes, no\nyes:\n  ret %x\nno:\n  %z = iconst 9\n  ret %z\n}\n",
        );
        assert_eq!(
            text,
            "define @f(%0) {\nentry:\n    %1 = iconst 9\n    ret %1\n}\n"
        );
    }

    #[test]
    fn test_jump_chain_collapses() {
        let text = simplified(
            "define @f(%x) {\nentry:\n  jmp a(%x)\na(%p):\n  %one = iconst 1\n  jmp b\nb:\n  %r = add %p, %one\n  ret %r\n}\n",
        );
        assert_eq!(
            text,
            "define @f(%0) {\nentry:\n    %1 = iconst 1\n    %2 = add %0, %1\n    ret %2\n}\n"
        );
    }

    #[test]
    fn test_loops_and_join_points_survive() {
        let src = "define @count(%n) {\nentry:\n  %z = iconst 0\n  jmp head(%z)\nhead(%i):\n  %c = icmp slt %i, %n\n  br %c, body, exit\nbody:\n  %one = iconst 1\n  %j = add %i, %one\n  jmp head(%j)\nexit:\n  ret %i\n}\n";
        let ctx = ThreadSafeContext::new();
        let mut module = parse_module(src, "m", &ctx).unwrap();
        assert_eq!(run(&mut module.functions[0]), 0);
        assert_eq!(module.functions[0].blocks.len(), 4);
    }

    #[test]
    fn test_same_target_branch() {
        let text = simplified(
            "define @f(%c, %x) {\nentry:\n  br %c, join(%x), join(%x)\njoin(%r):\n  ret %r\n}\n",
        );
        assert_eq!(text, "define @f(%0, %1) {\nentry:\n    ret %1\n}\n");
    }
}
