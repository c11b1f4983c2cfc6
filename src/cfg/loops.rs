//! Loop tree and block frequency estimation
//!
//! Loops are discovered from back edges (an edge whose target dominates its
//! source), innermost first. The whole method is the root pseudo-loop, id 0.
//! Frequencies are computed per loop relative to one entry of its head, then
//! scaled by the estimated trip counts from the root downwards.

use super::{BlockId, BlockState, Cfg};
use crate::error::Result;
use tracing::{debug, trace};

/// Lower bound of a loop's exit probability
pub const PROB_MIN: f64 = 1e-6;
/// Frequencies never drop below this
pub const MIN_BLOCK_FREQUENCY: f64 = 1e-35;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LoopId(pub u32);

impl LoopId {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

/// A loop member: one of its own blocks or a directly nested loop
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopMember {
    Block(BlockId),
    Loop(LoopId),
}

#[derive(Debug, Clone)]
pub struct CfgLoop {
    pub id: LoopId,
    pub head: BlockId,
    pub depth: u32,
    pub parent: Option<LoopId>,
    pub child: Option<LoopId>,
    pub sibling: Option<LoopId>,
    /// Own blocks and nested loops, in RPO of their heads
    pub members: Vec<LoopMember>,
    /// Exit targets with their probability per loop entry
    pub exits: Vec<(BlockId, f64)>,
    pub exit_prob: f64,
    /// Expected executions of the head per method entry, once scaled
    pub freq: f64,
}

impl CfgLoop {
    fn new(id: LoopId, head: BlockId) -> Self {
        Self {
            id,
            head,
            depth: 0,
            parent: None,
            child: None,
            sibling: None,
            members: Vec::new(),
            exits: Vec::new(),
            exit_prob: 1.0,
            freq: 0.0,
        }
    }

    /// Expected iterations per entry
    pub fn trip_count(&self) -> f64 {
        1.0 / self.exit_prob
    }
}

#[derive(Debug, Clone, Default)]
pub struct LoopTree {
    pub loops: Vec<CfgLoop>,
}

impl LoopTree {
    pub const ROOT: LoopId = LoopId(0);

    pub fn get(&self, id: LoopId) -> &CfgLoop {
        &self.loops[id.index()]
    }

    fn get_mut(&mut self, id: LoopId) -> &mut CfgLoop {
        &mut self.loops[id.index()]
    }

    pub fn len(&self) -> usize {
        self.loops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.loops.is_empty()
    }

    pub fn children(&self, id: LoopId) -> Vec<LoopId> {
        let mut out = Vec::new();
        let mut next = self.get(id).child;
        while let Some(c) = next {
            out.push(c);
            next = self.get(c).sibling;
        }
        out
    }

    /// `inner` is `outer` or nested somewhere inside it
    pub fn contains(&self, outer: LoopId, inner: LoopId) -> bool {
        let mut cur = Some(inner);
        while let Some(l) = cur {
            if l == outer {
                return true;
            }
            cur = self.get(l).parent;
        }
        false
    }

    fn new_loop(&mut self, head: BlockId) -> LoopId {
        let id = LoopId(self.loops.len() as u32);
        self.loops.push(CfgLoop::new(id, head));
        id
    }

    /// Append `child` to the end of `parent`'s child list
    fn add_nested(&mut self, parent: LoopId, child: LoopId) {
        self.get_mut(child).parent = Some(parent);
        match self.get(parent).child {
            None => self.get_mut(parent).child = Some(child),
            Some(first) => {
                let mut last = first;
                while let Some(s) = self.get(last).sibling {
                    last = s;
                }
                self.get_mut(last).sibling = Some(child);
            }
        }
    }

    /// Outermost loop below `stop` on the parent chain of `l`
    fn outermost_below(&self, l: LoopId, stop: LoopId) -> LoopId {
        let mut cur = l;
        while let Some(parent) = self.get(cur).parent {
            if parent == stop {
                break;
            }
            cur = parent;
        }
        cur
    }
}

struct LoopFinder<'a> {
    cfg: &'a Cfg,
    tree: LoopTree,
    block_loop: Vec<Option<LoopId>>,
}

impl LoopFinder<'_> {
    /// Claim `pred` for loop `lp` (whose head is `head`), or adopt the
    /// outermost loop already holding it
    fn push_pred(&mut self, lp: LoopId, head: BlockId, pred: BlockId, work: &mut Vec<BlockId>) {
        let head_rpo = self.cfg.block(head).rpo;
        match self.block_loop[pred.index()] {
            None => {
                // entering from before the head means leaving the loop
                if self.cfg.block(pred).rpo > head_rpo {
                    self.block_loop[pred.index()] = Some(lp);
                    work.push(pred);
                }
            }
            Some(pl) if pl != lp => {
                let outer = self.tree.outermost_below(pl, lp);
                if self.tree.get(outer).parent.is_none() {
                    self.tree.add_nested(lp, outer);
                    // continue from the nested loop's entry edges
                    let inner_head = self.tree.get(outer).head;
                    let entries: Vec<BlockId> = self
                        .cfg
                        .block(inner_head)
                        .preds
                        .iter()
                        .copied()
                        .filter(|p| !self.cfg.dominates(inner_head, *p))
                        .collect();
                    for p in entries {
                        self.push_pred(lp, head, p, work);
                    }
                }
            }
            _ => {}
        }
    }
}

/// Discover loops and fill `cfg.loop_tree` and every block's `loop_id`
pub fn build_loop_tree(cfg: &mut Cfg) -> Result<()> {
    let mut finder = LoopFinder {
        cfg,
        tree: LoopTree::default(),
        block_loop: vec![None; cfg.len()],
    };
    let root_loop = finder.tree.new_loop(cfg.root);

    for &head in cfg.rpo_order.iter().rev() {
        let back_edges: Vec<BlockId> = cfg
            .block(head)
            .preds
            .iter()
            .copied()
            .filter(|p| cfg.dominates(head, *p))
            .collect();
        if back_edges.is_empty() {
            continue;
        }
        if let Some(owner) = finder.block_loop[head.index()] {
            // irreducible entry into a loop found earlier
            debug!(%head, owner = owner.0, "loop head already claimed");
            continue;
        }
        let lp = finder.tree.new_loop(head);
        finder.block_loop[head.index()] = Some(lp);
        finder.tree.get_mut(lp).members.push(LoopMember::Block(head));

        let mut work = Vec::new();
        for tail in back_edges {
            if tail == head {
                continue;
            }
            finder.push_pred(lp, head, tail, &mut work);
        }
        while let Some(member) = work.pop() {
            let preds = cfg.block(member).preds.clone();
            for p in preds {
                finder.push_pred(lp, head, p, &mut work);
            }
        }
    }

    // members in RPO; orphan loops hang off the root
    for &b in &cfg.rpo_order {
        let lp = finder.block_loop[b.index()].unwrap_or(root_loop);
        finder.block_loop[b.index()] = Some(lp);
        let tree = &mut finder.tree;
        if lp == root_loop || b != tree.get(lp).head {
            tree.get_mut(lp).members.push(LoopMember::Block(b));
        }
        if lp != root_loop {
            if tree.get(lp).parent.is_none() {
                tree.add_nested(root_loop, lp);
            }
            if b == tree.get(lp).head {
                if let Some(parent) = tree.get(lp).parent {
                    tree.get_mut(parent).members.push(LoopMember::Loop(lp));
                }
            }
        }
    }

    let LoopFinder {
        tree: mut loop_tree,
        block_loop,
        ..
    } = finder;
    let mut stack = vec![(root_loop, 0u32)];
    while let Some((l, depth)) = stack.pop() {
        loop_tree.get_mut(l).depth = depth;
        for c in loop_tree.children(l) {
            stack.push((c, depth + 1));
        }
    }

    for (i, lp) in block_loop.into_iter().enumerate() {
        let block = &mut cfg.blocks[i];
        block.loop_id = lp;
        block.state = BlockState::LoopClassified;
    }
    debug!(loops = loop_tree.len() - 1, "loop tree built");
    cfg.loop_tree = loop_tree;
    Ok(())
}

/// Estimate how often each block runs per method entry
pub fn estimate_frequency(cfg: &mut Cfg) {
    for block in &mut cfg.blocks {
        block.freq = 0.0;
    }
    cfg.loop_tree.get_mut(LoopTree::ROOT).freq = 1.0;
    compute_freq(cfg, LoopTree::ROOT);
    scale_freq(cfg, LoopTree::ROOT);
}

/// Frequencies inside `lp` relative to one execution of its head
fn compute_freq(cfg: &mut Cfg, lp: LoopId) {
    for child in cfg.loop_tree.children(lp) {
        compute_freq(cfg, child);
    }

    let head = cfg.loop_tree.get(lp).head;
    cfg.block_mut(head).freq = 1.0;
    let members = cfg.loop_tree.get(lp).members.clone();
    for member in members {
        match member {
            LoopMember::Block(b) => {
                let freq = cfg.block(b).freq;
                let edges: Vec<(BlockId, f64)> = cfg
                    .block(b)
                    .succs
                    .iter()
                    .copied()
                    .zip(cfg.block(b).succ_probs.iter().copied())
                    .collect();
                for (succ, prob) in edges {
                    update_succ_freq(cfg, lp, succ, freq * prob);
                }
            }
            LoopMember::Loop(inner) => {
                let freq = cfg.loop_tree.get(inner).freq;
                let exits = cfg.loop_tree.get(inner).exits.clone();
                for (succ, prob) in exits {
                    update_succ_freq(cfg, lp, succ, freq * prob);
                }
            }
        }
    }

    let depth = cfg.loop_tree.get(lp).depth;
    if depth != 0 {
        let l = cfg.loop_tree.get_mut(lp);
        let total: f64 = l.exits.iter().map(|(_, p)| p).sum();
        l.exit_prob = total.clamp(PROB_MIN, 1.0);
        if total > 0.0 {
            for exit in &mut l.exits {
                exit.1 /= total;
            }
        }
        trace!(loop_id = lp.0, exit_prob = l.exit_prob, "loop frequency");
    }
}

fn update_succ_freq(cfg: &mut Cfg, lp: LoopId, succ: BlockId, freq: f64) {
    let succ_loop = cfg.block(succ).loop_id.unwrap_or(LoopTree::ROOT);
    if succ_loop == lp {
        if succ != cfg.loop_tree.get(lp).head {
            cfg.block_mut(succ).freq += freq;
        }
        // back edge to our own head
    } else if !cfg.loop_tree.contains(lp, succ_loop) {
        cfg.loop_tree.get_mut(lp).exits.push((succ, freq));
    } else {
        // into the head of a nested loop
        let child = cfg.loop_tree.outermost_below(succ_loop, lp);
        cfg.loop_tree.get_mut(child).freq += freq;
    }
}

/// Turn loop-relative frequencies into per-method-entry ones
fn scale_freq(cfg: &mut Cfg, lp: LoopId) {
    let loop_freq = {
        let l = cfg.loop_tree.get(lp);
        l.freq * l.trip_count()
    };
    cfg.loop_tree.get_mut(lp).freq = loop_freq;
    let members = cfg.loop_tree.get(lp).members.clone();
    for member in members {
        match member {
            LoopMember::Block(b) => {
                let scaled = clamp_freq(cfg.block(b).freq * loop_freq);
                cfg.block_mut(b).freq = scaled;
            }
            LoopMember::Loop(inner) => {
                let scaled = clamp_freq(cfg.loop_tree.get(inner).freq * loop_freq);
                cfg.loop_tree.get_mut(inner).freq = scaled;
            }
        }
    }
    for child in cfg.loop_tree.children(lp) {
        scale_freq(cfg, child);
    }
}

fn clamp_freq(f: f64) -> f64 {
    if f.is_nan() || f < MIN_BLOCK_FREQUENCY {
        MIN_BLOCK_FREQUENCY
    } else {
        f
    }
}
