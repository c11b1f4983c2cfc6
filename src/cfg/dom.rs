//! Depth-first numbering and the dominator tree
//!
//! Immediate dominators use the iterative scheme of Cooper, Harvey and
//! Kennedy over reverse post-order; block counts here are small enough that
//! it beats Lengauer-Tarjan in practice.

use super::{BlockId, BlockState, Cfg};
use crate::error::{CodegenError, Result};
use tracing::trace;

/// Number blocks in pre-order and RPO, then fill `idom` and `dom_depth`
pub fn compute_dominators(cfg: &mut Cfg) -> Result<()> {
    let post_order = depth_first(cfg)?;

    let n = post_order.len();
    cfg.rpo_order = post_order.iter().rev().copied().collect();
    for (rpo, &b) in cfg.rpo_order.clone().iter().enumerate() {
        cfg.block_mut(b).rpo = rpo as u32;
    }
    debug_assert_eq!(n, cfg.len());

    let root = cfg.root;
    let mut idom: Vec<Option<BlockId>> = vec![None; cfg.len()];
    idom[root.index()] = Some(root);
    let mut changed = true;
    while changed {
        changed = false;
        for &b in cfg.rpo_order.iter().skip(1) {
            let mut new_idom: Option<BlockId> = None;
            for &p in &cfg.block(b).preds {
                if idom[p.index()].is_none() {
                    continue;
                }
                new_idom = Some(match new_idom {
                    None => p,
                    Some(cur) => intersect(cfg, &idom, p, cur),
                });
            }
            if new_idom.is_some() && idom[b.index()] != new_idom {
                idom[b.index()] = new_idom;
                changed = true;
            }
        }
    }

    let order = cfg.rpo_order.clone();
    for b in order {
        let (dom, depth) = if b == root {
            (None, 0)
        } else {
            let d = idom[b.index()].ok_or_else(|| {
                CodegenError::Internal(format!("{} has no immediate dominator", b))
            })?;
            (Some(d), cfg.block(d).dom_depth + 1)
        };
        let block = cfg.block_mut(b);
        block.idom = dom;
        block.dom_depth = depth;
        block.state = BlockState::DominatorAssigned;
    }
    trace!(blocks = n, "dominators computed");
    Ok(())
}

fn intersect(cfg: &Cfg, idom: &[Option<BlockId>], a: BlockId, b: BlockId) -> BlockId {
    let mut f = a;
    let mut g = b;
    while f != g {
        while cfg.block(f).rpo > cfg.block(g).rpo {
            f = idom[f.index()].unwrap_or(cfg.root);
        }
        while cfg.block(g).rpo > cfg.block(f).rpo {
            g = idom[g.index()].unwrap_or(cfg.root);
        }
    }
    f
}

/// Iterative DFS from the root; returns blocks in post-order
fn depth_first(cfg: &mut Cfg) -> Result<Vec<BlockId>> {
    let mut post_order = Vec::with_capacity(cfg.len());
    let mut pre = 0u32;
    let root = cfg.root;
    let mut stack: Vec<(BlockId, usize)> = vec![(root, 0)];
    {
        let block = cfg.block_mut(root);
        block.pre_order = pre;
        block.state = BlockState::PreOrdered;
    }
    pre += 1;

    while let Some(top) = stack.last_mut() {
        let (b, next) = *top;
        if let Some(&succ) = cfg.block(b).succs.get(next) {
            top.1 += 1;
            if cfg.block(succ).state == BlockState::Undiscovered {
                let block = cfg.block_mut(succ);
                block.pre_order = pre;
                block.state = BlockState::PreOrdered;
                pre += 1;
                stack.push((succ, 0));
            }
        } else {
            post_order.push(b);
            stack.pop();
        }
    }

    if let Some(lost) = cfg.blocks.iter().find(|b| b.state == BlockState::Undiscovered) {
        return Err(CodegenError::Internal(format!(
            "{} (head {}) is unreachable from the root",
            lost.id, lost.head
        )));
    }
    Ok(post_order)
}

impl Cfg {
    /// Nearest common dominator; `None` stands for "no block yet"
    pub fn dom_lca(&self, a: Option<BlockId>, b: BlockId) -> BlockId {
        let Some(mut a) = a else { return b };
        let mut b = b;
        let up = |x: BlockId| self.block(x).idom.unwrap_or(self.root);
        while self.block(a).dom_depth > self.block(b).dom_depth {
            a = up(a);
        }
        while self.block(b).dom_depth > self.block(a).dom_depth {
            b = up(b);
        }
        while a != b {
            a = up(a);
            b = up(b);
        }
        a
    }

    /// `a` dominates `b` (reflexively)
    pub fn dominates(&self, a: BlockId, b: BlockId) -> bool {
        let mut b = b;
        while self.block(b).dom_depth > self.block(a).dom_depth {
            b = self.block(b).idom.unwrap_or(self.root);
        }
        a == b
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cfg::test_graphs;
    use crate::ir::{Condition, GraphBuilder, NodeId};
    use crate::operand::BasicType;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};
    use std::collections::HashSet;

    #[test]
    fn test_diamond_dominators() {
        let g = test_graphs::diamond();
        let mut cfg = Cfg::build(&g).unwrap();
        compute_dominators(&mut cfg).unwrap();
        let root = cfg.root;
        for b in cfg.ids() {
            if b != root {
                assert_eq!(cfg.block(b).idom, Some(root));
                assert_eq!(cfg.block(b).dom_depth, 1);
            }
        }
        assert_eq!(cfg.rpo_order[0], root);
        let arms: Vec<BlockId> = cfg.block(root).succs.clone();
        assert_eq!(cfg.dom_lca(Some(arms[0]), arms[1]), root);
        assert!(!cfg.dominates(arms[0], arms[1]));
    }

    #[test]
    fn test_loop_head_dominates_body() {
        let g = test_graphs::counted_loop();
        let mut cfg = Cfg::build(&g).unwrap();
        compute_dominators(&mut cfg).unwrap();
        let head = cfg.blocks.iter().find(|b| b.preds.len() == 2).unwrap().id;
        for b in cfg.ids() {
            if cfg.block(b).preds.contains(&head) {
                assert!(cfg.dominates(head, b));
            }
        }
        // rpo respects every forward edge
        for b in cfg.ids() {
            for s in &cfg.block(b).succs {
                if !cfg.dominates(*s, b) {
                    assert!(cfg.block(*s).rpo > cfg.block(b).rpo);
                }
            }
        }
    }

    /// Blocks reachable from root without passing through `skip`
    fn reachable_avoiding(cfg: &Cfg, skip: BlockId) -> HashSet<BlockId> {
        let mut seen = HashSet::new();
        if skip == cfg.root {
            return seen;
        }
        let mut work = vec![cfg.root];
        while let Some(b) = work.pop() {
            if b == skip || !seen.insert(b) {
                continue;
            }
            work.extend(cfg.block(b).succs.iter().copied());
        }
        seen
    }

    /// Random reducible-or-not graph: a chain through every region plus extra
    /// forward and backward edges
    fn random_graph(seed: u64) -> crate::ir::Graph {
        let mut rng = StdRng::seed_from_u64(seed);
        let mut b = GraphBuilder::new("random");
        let entry = b.start();
        let x = b.param(0, BasicType::Int);
        let zero = b.int(0);
        let count = rng.gen_range(3..10);
        let regions: Vec<NodeId> = (0..count).map(|_| b.region()).collect();
        b.goto(entry, regions[0]);
        for i in 0..count {
            let here = regions[i];
            if i + 1 == count {
                b.ret(here, None);
                continue;
            }
            let next = regions[i + 1];
            if rng.gen_bool(0.6) {
                let other = regions[rng.gen_range(0..count)];
                if other == next {
                    b.goto(here, next);
                } else {
                    b.branch(here, Condition::Less, x, zero, next, other, 0.5);
                }
            } else {
                b.goto(here, next);
            }
        }
        b.finish().unwrap()
    }

    #[test]
    fn test_idom_matches_path_definition() {
        for seed in 0..40 {
            let g = random_graph(seed);
            let mut cfg = Cfg::build(&g).unwrap();
            compute_dominators(&mut cfg).unwrap();
            for b in cfg.ids() {
                // a dominates b iff b is unreachable once a is removed
                for a in cfg.ids() {
                    let brute = a == b || !reachable_avoiding(&cfg, a).contains(&b);
                    assert_eq!(cfg.dominates(a, b), brute, "seed {} {} dom {}", seed, a, b);
                }
                if let Some(idom) = cfg.block(b).idom {
                    assert!(cfg.dominates(idom, b));
                    assert_eq!(cfg.block(b).dom_depth, cfg.block(idom).dom_depth + 1);
                }
            }
        }
    }
}
