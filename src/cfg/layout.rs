//! Block layout
//!
//! Edges are visited hottest first and glued into traces (chains of blocks
//! that fall through into each other). Loops are rotated so their exit test
//! falls through, leftover traces are merged, and the result is cleaned up:
//! jump-only connector blocks disappear, never-branches become plain jumps,
//! and jumps to the next block are dropped.

use super::{BlockId, Cfg};
use crate::config::CompileOptions;
use crate::error::{CodegenError, Result};
use crate::ir::{Graph, Op};
use crate::lir::{BranchTarget, LirBlock, LirOp, LirOpcode};
use std::collections::{HashMap, HashSet};
use tracing::{debug, trace};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EdgeState {
    Open,
    /// Joined two traces
    Connected,
    /// Both ends already sit in one trace
    Interior,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CfgEdge {
    pub from: BlockId,
    pub to: BlockId,
    pub freq: f64,
    /// Share of `from`'s executions taking this edge
    pub from_pct: u32,
    /// Share of `to`'s executions arriving over this edge
    pub to_pct: u32,
    pub state: EdgeState,
}

impl CfgEdge {
    pub fn infrequent(&self, min_pct: u32) -> bool {
        self.from_pct < min_pct || self.to_pct < min_pct
    }
}

/// Disjoint sets keyed by trace id; a set's root is its trace id
#[derive(Debug, Clone)]
pub struct UnionFind {
    parent: Vec<usize>,
}

impl UnionFind {
    pub fn new(n: usize) -> Self {
        Self {
            parent: (0..n).collect(),
        }
    }

    pub fn find(&mut self, mut x: usize) -> usize {
        while self.parent[x] != x {
            self.parent[x] = self.parent[self.parent[x]];
            x = self.parent[x];
        }
        x
    }

    /// Merge the set rooted at `absorbed` into the one rooted at `kept`
    pub fn union(&mut self, kept: usize, absorbed: usize) {
        self.parent[absorbed] = kept;
    }
}

#[derive(Debug, Clone, Copy)]
struct Trace {
    first: BlockId,
    last: BlockId,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LayoutStats {
    pub traces: usize,
    pub rotated_loops: usize,
    pub connectors: usize,
    pub unreachable: usize,
    pub fall_throughs: usize,
}

struct BlockLayout<'a> {
    cfg: &'a Cfg,
    graph: &'a Graph,
    options: &'a CompileOptions,
    next: Vec<Option<BlockId>>,
    prev: Vec<Option<BlockId>>,
    traces: Vec<Option<Trace>>,
    uf: UnionFind,
    edges: Vec<CfgEdge>,
    aligned: Vec<bool>,
    rotated: usize,
}

impl<'a> BlockLayout<'a> {
    fn new(cfg: &'a Cfg, graph: &'a Graph, options: &'a CompileOptions) -> Self {
        let n = cfg.len();
        let traces = cfg
            .ids()
            .map(|b| Some(Trace { first: b, last: b }))
            .collect();
        Self {
            cfg,
            graph,
            options,
            next: vec![None; n],
            prev: vec![None; n],
            traces,
            uf: UnionFind::new(n),
            edges: Vec::new(),
            aligned: vec![false; n],
            rotated: 0,
        }
    }

    fn min_pct(&self) -> u32 {
        self.options.block_layout_min_diamond_percentage
    }

    /// How many successors could be reached by falling through
    fn num_fall_throughs(&self, b: BlockId) -> usize {
        match self.graph.node(self.cfg.block(b).end).op {
            Op::If { .. } => 2,
            Op::Goto { .. } | Op::NeverBranch { .. } | Op::Switch { .. } => 1,
            _ => 0,
        }
    }

    fn is_loop_head(&self, b: BlockId) -> bool {
        match self.cfg.block(b).loop_id {
            Some(l) if l.0 != 0 => self.cfg.loop_tree.get(l).head == b,
            _ => false,
        }
    }

    fn trace_of(&mut self, b: BlockId) -> usize {
        self.uf.find(b.index())
    }

    fn trace(&self, t: usize) -> Result<Trace> {
        self.traces[t]
            .ok_or_else(|| CodegenError::Internal(format!("trace {} was merged away", t)))
    }

    fn find_edges(&mut self) {
        let cfg = self.cfg;
        for b in cfg.ids() {
            let block = cfg.block(b);
            for (&to, &prob) in block.succs.iter().zip(&block.succ_probs) {
                let freq = block.freq * prob;
                let to_freq = cfg.freq(to);
                let to_pct = if to_freq > 0.0 {
                    (100.0 * freq / to_freq).min(100.0) as u32
                } else {
                    0
                };
                self.edges.push(CfgEdge {
                    from: b,
                    to,
                    freq,
                    from_pct: (100.0 * prob) as u32,
                    to_pct,
                    state: EdgeState::Open,
                });
            }
        }
        self.edges.sort_by(|x, y| {
            y.freq
                .total_cmp(&x.freq)
                .then(cfg.block(x.from).pre_order.cmp(&cfg.block(y.from).pre_order))
                .then(cfg.block(x.to).pre_order.cmp(&cfg.block(y.to).pre_order))
        });
    }

    fn append_trace(&mut self, t: usize, other: usize) -> Result<()> {
        let a = self.trace(t)?;
        let b = self.trace(other)?;
        self.next[a.last.index()] = Some(b.first);
        self.prev[b.first.index()] = Some(a.last);
        self.traces[t] = Some(Trace {
            first: a.first,
            last: b.last,
        });
        Ok(())
    }

    fn insert_after(&mut self, t: usize, after: BlockId, other: usize) -> Result<()> {
        let a = self.trace(t)?;
        let b = self.trace(other)?;
        let following = self.next[after.index()];
        self.next[after.index()] = Some(b.first);
        self.prev[b.first.index()] = Some(after);
        self.next[b.last.index()] = following;
        if let Some(f) = following {
            self.prev[f.index()] = Some(b.last);
        }
        if a.last == after {
            self.traces[t] = Some(Trace {
                first: a.first,
                last: b.last,
            });
        }
        Ok(())
    }

    fn insert_before(&mut self, t: usize, before: BlockId, other: usize) -> Result<()> {
        match self.prev[before.index()] {
            Some(p) => self.insert_after(t, p, other),
            None => {
                let a = self.trace(t)?;
                let b = self.trace(other)?;
                self.next[b.last.index()] = Some(before);
                self.prev[before.index()] = Some(b.last);
                self.traces[t] = Some(Trace {
                    first: b.first,
                    last: a.last,
                });
                Ok(())
            }
        }
    }

    /// `updated` now holds the blocks of both; the merged trace takes the lower id
    fn union_traces(&mut self, updated: usize, old: usize) -> Result<()> {
        let merged = self.trace(updated)?;
        let (lo, hi) = (updated.min(old), updated.max(old));
        self.uf.union(lo, hi);
        self.traces[hi] = None;
        self.traces[lo] = Some(merged);
        Ok(())
    }

    /// Handle an edge that stays inside trace `t`; true if the trace was rotated
    fn backedge(&mut self, t: usize, e: &CfgEdge) -> Result<bool> {
        let tr = self.trace(t)?;
        let mut rotated = false;
        if e.to == tr.first {
            if self.options.block_layout_rotate_loops && self.num_fall_throughs(tr.last) < 2 {
                // end the trace at the last two-way branch so the exit falls through
                let mut cur = Some(tr.last);
                let mut branch = None;
                while let Some(b) = cur {
                    if self.num_fall_throughs(b) == 2 {
                        branch = Some(b);
                        break;
                    }
                    cur = self.prev[b.index()];
                }
                if let Some(b) = branch.filter(|b| *b != tr.last) {
                    if let Some(new_first) = self.next[b.index()] {
                        self.next[tr.last.index()] = Some(tr.first);
                        self.prev[tr.first.index()] = Some(tr.last);
                        self.next[b.index()] = None;
                        self.prev[new_first.index()] = None;
                        self.traces[t] = Some(Trace {
                            first: new_first,
                            last: b,
                        });
                        rotated = true;
                        self.rotated += 1;
                        trace!(head = %e.to, new_first = %new_first, "rotated loop");
                    }
                }
            }
            // align the trace top, unless a loop head further in wants it
            let top = self.trace(t)?.first;
            let mut cur = Some(e.to);
            let mut target = top;
            while let Some(b) = cur {
                if self.aligned[b.index()] {
                    break;
                }
                if self.is_loop_head(b) {
                    target = b;
                    break;
                }
                cur = self.next[b.index()];
            }
            self.aligned[target.index()] = true;
        } else {
            // back branch into the middle of a trace
            self.aligned[e.to.index()] = true;
        }
        Ok(rotated)
    }

    fn grow_traces(&mut self) -> Result<()> {
        let root = self.cfg.root;
        let min = self.min_pct();
        let mut i = 0;
        while i < self.edges.len() {
            let e = self.edges[i].clone();
            let slot = i;
            i += 1;
            if e.state != EdgeState::Open || e.infrequent(min) {
                continue;
            }
            let src = self.trace_of(e.from);
            let targ = self.trace_of(e.to);
            if src == targ {
                self.edges[slot].state = EdgeState::Interior;
                if self.backedge(src, &e)? {
                    // rotation can make earlier edges eligible
                    i = 0;
                }
                continue;
            }
            if self.trace(src)?.last == e.from && self.trace(targ)?.first == e.to && e.to != root {
                self.edges[slot].state = EdgeState::Connected;
                self.append_trace(src, targ)?;
                self.union_traces(src, targ)?;
            }
        }
        Ok(())
    }

    fn merge_traces(&mut self, fall_thru_only: bool) -> Result<()> {
        let root = self.cfg.root;
        let min = self.min_pct();
        for i in 0..self.edges.len() {
            let e = self.edges[i].clone();
            if e.state != EdgeState::Open {
                continue;
            }
            if fall_thru_only && e.infrequent(min) {
                continue;
            }
            let src = self.trace_of(e.from);
            let targ = self.trace_of(e.to);
            if src == targ {
                self.edges[i].state = EdgeState::Interior;
                continue;
            }
            let root_trace = self.trace_of(root);
            let src_at_tail = self.trace(src)?.last == e.from;
            let targ_at_start = self.trace(targ)?.first == e.to;

            if !fall_thru_only {
                if src_at_tail && targ_at_start && e.to != root {
                    self.edges[i].state = EdgeState::Connected;
                    self.append_trace(src, targ)?;
                    self.union_traces(src, targ)?;
                }
                continue;
            }

            if !src_at_tail && !targ_at_start {
                continue;
            }
            if !self.options.block_layout_rotate_loops
                && self.cfg.block(e.to).rpo <= self.cfg.block(e.from).rpo
            {
                self.aligned[e.to.index()] = true;
                continue;
            }
            if src_at_tail && targ_at_start {
                if e.to != root {
                    self.edges[i].state = EdgeState::Connected;
                    self.append_trace(src, targ)?;
                    self.union_traces(src, targ)?;
                }
            } else if src_at_tail {
                // the entry block has to stay first
                if src != root_trace {
                    self.edges[i].state = EdgeState::Connected;
                    self.insert_before(targ, e.to, src)?;
                    self.union_traces(targ, src)?;
                }
            } else if self.num_fall_throughs(e.from) == 2 {
                // hang the target trace off a two-way branch in the middle of src
                self.edges[i].state = EdgeState::Connected;
                self.insert_after(src, e.from, targ)?;
                self.union_traces(src, targ)?;
            }
        }
        Ok(())
    }

    fn chain(&self, t: Trace) -> Vec<BlockId> {
        let mut out = Vec::new();
        let mut cur = Some(t.first);
        while let Some(b) = cur {
            out.push(b);
            if b == t.last {
                break;
            }
            cur = self.next[b.index()];
        }
        out
    }

    /// Root trace first, then the rest by the pre-order of their first block
    fn reorder_traces(&mut self) -> Result<Vec<BlockId>> {
        let root_trace = self.trace_of(self.cfg.root);
        let mut order = self.chain(self.trace(root_trace)?);
        let mut rest: Vec<Trace> = self
            .traces
            .iter()
            .enumerate()
            .filter(|(t, _)| *t != root_trace)
            .filter_map(|(_, tr)| *tr)
            .collect();
        rest.sort_by_key(|tr| self.cfg.block(tr.first).pre_order);
        for tr in rest {
            order.extend(self.chain(tr));
        }
        if order.len() != self.cfg.len() || order.first() != Some(&self.cfg.root) {
            return Err(CodegenError::Internal(format!(
                "layout lost blocks: {} placed of {}",
                order.len(),
                self.cfg.len()
            )));
        }
        Ok(order)
    }
}

/// Order the method's blocks and tidy up the branches between them
///
/// `lir` is indexed by block id. Returns the blocks in final order.
pub fn layout_blocks(
    graph: &Graph,
    cfg: &Cfg,
    options: &CompileOptions,
    lir: Vec<LirBlock>,
) -> Result<(Vec<LirBlock>, LayoutStats)> {
    let mut layout = BlockLayout::new(cfg, graph, options);
    layout.find_edges();
    layout.grow_traces()?;
    layout.merge_traces(true)?;
    layout.merge_traces(false)?;
    let order = layout.reorder_traces()?;

    let mut stats = LayoutStats {
        traces: layout.traces.iter().filter(|t| t.is_some()).count(),
        rotated_loops: layout.rotated,
        ..LayoutStats::default()
    };

    let mut slots: Vec<Option<LirBlock>> = lir.into_iter().map(Some).collect();
    let mut blocks = Vec::with_capacity(order.len());
    for b in order {
        let mut block = slots
            .get_mut(b.index())
            .and_then(Option::take)
            .ok_or_else(|| CodegenError::Internal(format!("no LIR for {}", b)))?;
        block.freq = cfg.freq(b);
        block.loop_depth = cfg.loop_depth(b);
        block.aligned = layout.aligned[b.index()];
        blocks.push(block);
    }

    stats.connectors = elide_connectors(&mut blocks, cfg.root);
    for block in &mut blocks {
        for op in &mut block.ops {
            if let LirOpcode::NeverBranch(target) = op.code {
                op.code = LirOpcode::Jump(BranchTarget::Block(target));
            }
        }
    }
    stats.unreachable = remove_unreachable(&mut blocks, cfg.root);
    stats.fall_throughs = fixup_fall_through(&mut blocks);
    debug!(
        blocks = blocks.len(),
        traces = stats.traces,
        rotated = stats.rotated_loops,
        connectors = stats.connectors,
        "block layout done"
    );
    Ok((blocks, stats))
}

/// Every block an op can transfer control to
fn op_targets(op: &LirOp) -> Vec<BlockId> {
    let mut out = Vec::new();
    match &op.code {
        LirOpcode::Branch {
            target, unordered, ..
        } => {
            for t in std::iter::once(target).chain(unordered.iter()) {
                if let BranchTarget::Block(b) = t {
                    out.push(*b);
                }
            }
        }
        LirOpcode::Jump(BranchTarget::Block(b)) | LirOpcode::NeverBranch(b) => out.push(*b),
        _ => {}
    }
    out
}

/// Drop blocks whose only op is a jump and send their predecessors straight on
fn elide_connectors(blocks: &mut Vec<LirBlock>, root: BlockId) -> usize {
    let mut forward: HashMap<BlockId, BlockId> = HashMap::new();
    for block in blocks.iter() {
        if block.id == root || block.ops.len() != 1 {
            continue;
        }
        if let LirOpcode::Jump(BranchTarget::Block(t)) = block.ops[0].code {
            forward.insert(block.id, t);
        }
    }
    let limit = forward.len();
    let resolve = |start: BlockId| -> Option<BlockId> {
        let mut cur = start;
        for _ in 0..=limit {
            match forward.get(&cur) {
                Some(next) => cur = *next,
                None => return Some(cur),
            }
        }
        // a cycle of empty blocks is an empty infinite loop; keep it
        None
    };
    let elided: HashMap<BlockId, BlockId> = forward
        .keys()
        .filter_map(|c| resolve(*c).map(|t| (*c, t)))
        .collect();
    if elided.is_empty() {
        return 0;
    }
    for block in blocks.iter_mut() {
        for op in &mut block.ops {
            for t in op_targets(op) {
                if let Some(&to) = elided.get(&t) {
                    op.retarget(t, to);
                }
            }
        }
    }
    blocks.retain(|b| !elided.contains_key(&b.id));
    elided.len()
}

fn remove_unreachable(blocks: &mut Vec<LirBlock>, root: BlockId) -> usize {
    let by_id: HashMap<BlockId, usize> = blocks.iter().enumerate().map(|(i, b)| (b.id, i)).collect();
    let mut seen: HashSet<BlockId> = HashSet::new();
    let mut work = vec![root];
    while let Some(b) = work.pop() {
        if !seen.insert(b) {
            continue;
        }
        if let Some(&i) = by_id.get(&b) {
            for op in &blocks[i].ops {
                work.extend(op_targets(op));
            }
        }
    }
    let before = blocks.len();
    blocks.retain(|b| seen.contains(&b.id));
    before - blocks.len()
}

/// Remove jumps to the next block; flip a branch over a jump when the
/// branch target is next
fn fixup_fall_through(blocks: &mut [LirBlock]) -> usize {
    let mut fixed = 0;
    for i in 0..blocks.len() {
        let next = blocks.get(i + 1).map(|b| b.id);
        let ops = &mut blocks[i].ops;
        let n = ops.len();
        let Some(last) = ops.last() else { continue };
        let jump_target = match last.code {
            LirOpcode::Jump(BranchTarget::Block(t)) => Some(t),
            _ => None,
        };
        if jump_target.is_some() && jump_target == next {
            ops.pop();
            fixed += 1;
            continue;
        }
        let (Some(jt), true) = (jump_target, n >= 2) else { continue };
        if let LirOpcode::Branch {
            cond,
            target: BranchTarget::Block(bt),
            unordered: None,
        } = ops[n - 2].code
        {
            if Some(bt) == next {
                ops[n - 2].code = LirOpcode::Branch {
                    cond: cond.negate(),
                    target: BranchTarget::Block(jt),
                    unordered: None,
                };
                ops.pop();
                fixed += 1;
            }
        }
    }
    fixed
}
