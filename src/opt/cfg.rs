// Control flow analysis shared by the optimization passes. ControlFlowGraph records the
// predecessor and successor edges of every block (with multiplicity, so a branch whose two
// arms reach the same block counts twice) and computes the reverse post-order of blocks
// reachable from the entry. DominatorTree implements the iterative algorithm of Cooper,
// Harvey and Kennedy over that order. Unreachable blocks have no immediate dominator and
// are never reported as dominated.

//! CFG and dominator analysis.

use crate::ir::{BlockId, Function};

#[derive(Debug, Clone)]
pub struct ControlFlowGraph {
    preds: Vec<Vec<BlockId>>,
    succs: Vec<Vec<BlockId>>,
}

impl ControlFlowGraph {
    pub fn compute(func: &Function) -> Self {
        let n = func.blocks.len();
        let mut preds = vec![Vec::new(); n];
        let mut succs = vec![Vec::new(); n];
        for id in func.block_ids() {
            for succ in func.block(id).terminator.successors() {
                succs[id.index()].push(succ);
                preds[succ.index()].push(id);
            }
        }
        Self { preds, succs }
    }

    pub fn predecessors(&self, block: BlockId) -> &[BlockId] {
        &self.preds[block.index()]
    }

    pub fn successors(&self, block: BlockId) -> &[BlockId] {
        &self.succs[block.index()]
    }

    pub fn block_count(&self) -> usize {
        self.preds.len()
    }

    /// Blocks reachable from the entry, in reverse post-order.
    pub fn reverse_post_order(&self) -> Vec<BlockId> {
        let mut visited = vec![false; self.block_count()];
        let mut post = Vec::with_capacity(self.block_count());
        // (block, next successor to visit)
        let mut stack = vec![(BlockId::ENTRY, 0usize)];
        visited[0] = true;
        while let Some((block, next)) = stack.last_mut() {
            let block = *block;
            if let Some(&succ) = self.succs[block.index()].get(*next) {
                *next += 1;
                if !visited[succ.index()] {
                    visited[succ.index()] = true;
                    stack.push((succ, 0));
                }
            } else {
                post.push(block);
                stack.pop();
            }
        }
        post.reverse();
        post
    }

    pub fn reachable(&self) -> Vec<bool> {
        let mut reachable = vec![false; self.block_count()];
        for block in self.reverse_post_order() {
            reachable[block.index()] = true;
        }
        reachable
    }
}

#[derive(Debug, Clone)]
pub struct DominatorTree {
    idom: Vec<Option<BlockId>>,
    children: Vec<Vec<BlockId>>,
    rpo: Vec<BlockId>,
}

impl DominatorTree {
    pub fn compute(cfg: &ControlFlowGraph) -> Self {
        let n = cfg.block_count();
        let rpo = cfg.reverse_post_order();
        let mut order = vec![usize::MAX; n];
        for (pos, block) in rpo.iter().enumerate() {
            order[block.index()] = pos;
        }

        let mut idom: Vec<Option<BlockId>> = vec![None; n];
        idom[0] = Some(BlockId::ENTRY);
        let intersect = |idom: &[Option<BlockId>], mut a: BlockId, mut b: BlockId| {
            while a != b {
                while order[a.index()] > order[b.index()] {
                    a = idom[a.index()].unwrap_or(BlockId::ENTRY);
                }
                while order[b.index()] > order[a.index()] {
                    b = idom[b.index()].unwrap_or(BlockId::ENTRY);
                }
            }
            a
        };

        let mut changed = true;
        while changed {
            changed = false;
            for &block in rpo.iter().skip(1) {
                let mut new_idom: Option<BlockId> = None;
                for &pred in cfg.predecessors(block) {
                    if idom[pred.index()].is_none() {
                        continue;
                    }
                    new_idom = Some(match new_idom {
                        None => pred,
                        Some(current) => intersect(&idom, pred, current),
                    });
                }
                if new_idom.is_some() && idom[block.index()] != new_idom {
                    idom[block.index()] = new_idom;
                    changed = true;
                }
            }
        }

        let mut children = vec![Vec::new(); n];
        for &block in rpo.iter().skip(1) {
            if let Some(parent) = idom[block.index()] {
                children[parent.index()].push(block);
            }
        }
        Self { idom, children, rpo }
    }

    /// Immediate dominator; `None` for the entry and unreachable blocks.
    pub fn idom(&self, block: BlockId) -> Option<BlockId> {
        if block == BlockId::ENTRY {
            return None;
        }
        self.idom[block.index()]
    }

    pub fn children(&self, block: BlockId) -> &[BlockId] {
        &self.children[block.index()]
    }

    pub fn is_reachable(&self, block: BlockId) -> bool {
        self.idom[block.index()].is_some()
    }

    pub fn dominates(&self, a: BlockId, b: BlockId) -> bool {
        if !self.is_reachable(a) || !self.is_reachable(b) {
            return false;
        }
        let mut cur = b;
        loop {
            if cur == a {
                return true;
            }
            match self.idom(cur) {
                Some(parent) => cur = parent,
                None => return false,
            }
        }
    }

    pub fn reverse_post_order(&self) -> &[BlockId] {
        &self.rpo
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::context::ThreadSafeContext;
    use crate::ir::parser::parse_module;

    const DIAMOND: &str = r#"
define @f(%c, %x) {
entry:
    br %c, left, right
left:
    jmp join(%x)
right:
    jmp join(%c)
join(%r):
    ret %r
dead:
    jmp join(%x)
}
"#;

    #[test]
    fn test_diamond_dominators() {
        let ctx = ThreadSafeContext::new();
        let module = parse_module(DIAMOND, "m", &ctx).unwrap();
        let func = &module.functions[0];
        let cfg = ControlFlowGraph::compute(func);
        let id = |name: &str| func.block_by_name(name).unwrap();

        assert_eq!(cfg.predecessors(id("join")).len(), 3);
        let rpo = cfg.reverse_post_order();
        assert_eq!(rpo[0], BlockId::ENTRY);
        assert_eq!(*rpo.last().unwrap(), id("join"));
        assert_eq!(rpo.len(), 4);
        assert!(!cfg.reachable()[id("dead").index()]);

        let dom = DominatorTree::compute(&cfg);
        assert_eq!(dom.idom(id("join")), Some(BlockId::ENTRY));
        assert_eq!(dom.idom(id("left")), Some(BlockId::ENTRY));
        assert!(dom.dominates(BlockId::ENTRY, id("join")));
        assert!(!dom.dominates(id("left"), id("join")));
        assert!(!dom.is_reachable(id("dead")));
        assert_eq!(dom.children(BlockId::ENTRY).len(), 3);
    }

    #[test]
    fn test_loop_dominators() {
        let src = r#"
define @count(%n) {
entry:
    %z = iconst 0
    jmp head(%z)
head(%i):
    %c = icmp slt %i, %n
    br %c, body, exit
body:
    %one = iconst 1
    %j = add %i, %one
    jmp head(%j)
exit:
    ret %i
}
"#;
        let ctx = ThreadSafeContext::new();
        let module = parse_module(src, "m", &ctx).unwrap();
        let func = &module.functions[0];
        let dom = DominatorTree::compute(&ControlFlowGraph::compute(func));
        let head = func.block_by_name("head").unwrap();
        assert!(dom.dominates(head, func.block_by_name("body").unwrap()));
        assert!(dom.dominates(head, func.block_by_name("exit").unwrap()));
        assert_eq!(dom.idom(head), Some(BlockId::ENTRY));
    }
}
