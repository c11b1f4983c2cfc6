//! Global code motion and local scheduling
//!
//! Floating nodes get an early block (deepest block of their inputs) and a
//! late block (dominator LCA of their uses). Loads are raised above stores
//! that would overwrite the memory they read. The final block is the least
//! frequent one on the dominator chain between the two. Each block is then
//! list-scheduled by latency.

use super::{BlockId, Cfg};
use crate::error::{CodegenError, Result};
use crate::ir::{AliasClass, ArithOp, Graph, NodeId, Op};
use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use tracing::{debug, trace};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GcmStats {
    pub floating: usize,
    /// Floating nodes without uses; left unscheduled
    pub dead: usize,
    /// Placed above their latest legal block
    pub hoisted: usize,
    pub anti_deps: usize,
}

/// Estimated cycles until the result is available
pub fn op_latency(op: &Op) -> u32 {
    match op {
        Op::Const(_) | Op::Phi { .. } | Op::MemPhi { .. } | Op::Param { .. } => 0,
        Op::Arith {
            op: ArithOp::Div | ArithOp::Rem,
            ..
        } => 20,
        Op::Arith { op: ArithOp::Mul, .. } => 3,
        Op::Load { .. } | Op::LoadIndexed { .. } | Op::ArrayLength { .. } => 3,
        Op::Convert { .. } | Op::Compare { .. } => 2,
        Op::Intrinsic { .. } | Op::NewMultiArray { .. } => 10,
        _ => 1,
    }
}

struct MemoryWriter {
    node: NodeId,
    alias: AliasClass,
    mem: Option<NodeId>,
}

struct MemoryMerge {
    node: NodeId,
    alias: AliasClass,
    inputs: Vec<Option<NodeId>>,
}

struct Scheduler<'a> {
    graph: &'a Graph,
    cfg: &'a mut Cfg,
    uses: Vec<Vec<NodeId>>,
    floating: Vec<bool>,
    early: Vec<Option<BlockId>>,
    writers: Vec<MemoryWriter>,
    merges: Vec<MemoryMerge>,
    anti_deps: Vec<(NodeId, NodeId)>,
    stats: GcmStats,
}

/// Place every floating node and order each block
pub fn global_code_motion(graph: &Graph, cfg: &mut Cfg) -> Result<GcmStats> {
    let floating: Vec<bool> = graph
        .nodes
        .iter()
        .map(|n| n.control.is_none() && !n.op.is_block_head())
        .collect();
    let mut writers = Vec::new();
    let mut merges = Vec::new();
    for id in graph.ids() {
        let op = &graph.node(id).op;
        if let Some((alias, mem)) = op.store_memory() {
            writers.push(MemoryWriter { node: id, alias, mem });
        }
        if let Op::MemPhi { alias, inputs } = op {
            merges.push(MemoryMerge {
                node: id,
                alias: *alias,
                inputs: inputs.clone(),
            });
        }
    }

    let mut s = Scheduler {
        graph,
        uses: graph.uses(),
        early: vec![None; graph.len()],
        stats: GcmStats {
            floating: floating.iter().filter(|f| **f).count(),
            ..GcmStats::default()
        },
        floating,
        cfg,
        writers,
        merges,
        anti_deps: Vec::new(),
    };
    let order = s.topological_order()?;
    s.schedule_early(&order)?;
    s.schedule_late(&order)?;
    let latency = s.latencies();
    s.schedule_local(&latency)?;
    debug!(
        floating = s.stats.floating,
        dead = s.stats.dead,
        hoisted = s.stats.hoisted,
        anti_deps = s.stats.anti_deps,
        "global code motion done"
    );
    Ok(s.stats)
}

impl Scheduler<'_> {
    /// Floating nodes, inputs before uses
    fn topological_order(&self) -> Result<Vec<NodeId>> {
        let n = self.graph.len();
        let mut state = vec![0u8; n];
        let mut order = Vec::new();
        for root in self.graph.ids() {
            if !self.floating[root.index()] || state[root.index()] != 0 {
                continue;
            }
            state[root.index()] = 1;
            let mut stack: Vec<(NodeId, Vec<NodeId>, usize)> =
                vec![(root, self.graph.node(root).inputs(), 0)];
            loop {
                let Some(top) = stack.last_mut() else { break };
                let next = if top.2 < top.1.len() {
                    top.2 += 1;
                    Some(top.1[top.2 - 1])
                } else {
                    None
                };
                match next {
                    Some(input) if self.floating[input.index()] => match state[input.index()] {
                        0 => {
                            state[input.index()] = 1;
                            stack.push((input, self.graph.node(input).inputs(), 0));
                        }
                        1 => {
                            return Err(CodegenError::Internal(format!(
                                "floating node {} depends on itself",
                                input
                            )))
                        }
                        _ => {}
                    },
                    Some(_) => {}
                    None => {
                        if let Some((node, _, _)) = stack.pop() {
                            state[node.index()] = 2;
                            order.push(node);
                        }
                    }
                }
            }
        }
        Ok(order)
    }

    fn placed_block(&self, node: NodeId) -> Option<BlockId> {
        if self.floating[node.index()] {
            self.early[node.index()]
        } else {
            self.cfg.block_of(node)
        }
    }

    fn schedule_early(&mut self, order: &[NodeId]) -> Result<()> {
        for &n in order {
            let mut best = self.cfg.root;
            let inputs = self.graph.node(n).inputs();
            let mut input_blocks = Vec::with_capacity(inputs.len());
            for input in inputs {
                let b = self.placed_block(input).ok_or_else(|| {
                    CodegenError::Internal(format!("input {} of {} has no block", input, n))
                })?;
                if self.cfg.block(b).dom_depth > self.cfg.block(best).dom_depth {
                    best = b;
                }
                input_blocks.push(b);
            }
            if let Some(b) = input_blocks.iter().find(|b| !self.cfg.dominates(**b, best)) {
                return Err(CodegenError::Internal(format!(
                    "inputs of {} come from {} and {}, which are not on one dominator chain",
                    n, b, best
                )));
            }
            self.early[n.index()] = Some(best);
        }
        Ok(())
    }

    fn schedule_late(&mut self, order: &[NodeId]) -> Result<()> {
        for &n in order.iter().rev() {
            let mut lca: Option<BlockId> = None;
            for &u in &self.uses[n.index()] {
                let user = self.graph.node(u);
                let phi_inputs: Option<Vec<Option<NodeId>>> = match &user.op {
                    Op::Phi { inputs } => Some(inputs.iter().copied().map(Some).collect()),
                    Op::MemPhi { inputs, .. } => Some(inputs.clone()),
                    _ => None,
                };
                let Some(ub) = self.cfg.block_of(u) else { continue };
                match phi_inputs {
                    // a phi input is used at the end of the matching predecessor
                    Some(inputs) => {
                        for (j, input) in inputs.iter().enumerate() {
                            if *input == Some(n) {
                                let pred = self.cfg.block(ub).preds[j];
                                lca = Some(self.cfg.dom_lca(lca, pred));
                            }
                        }
                    }
                    None => lca = Some(self.cfg.dom_lca(lca, ub)),
                }
            }

            let Some(mut late) = lca else {
                self.stats.dead += 1;
                trace!(node = %n, "dead floating node");
                continue;
            };
            let early = self.early[n.index()]
                .ok_or_else(|| CodegenError::Internal(format!("{} has no early block", n)))?;

            let load = self.graph.node(n).op.load_memory();
            if let Some((alias, mem)) = load {
                late = self.raise_above_conflicting_stores(alias, mem, late, early);
            }
            if !self.cfg.dominates(early, late) {
                return Err(CodegenError::Internal(format!(
                    "early block {} of {} does not dominate its late block {}",
                    early, n, late
                )));
            }

            let best = self.hoist_to_cheaper_block(late, early);
            if best != late {
                self.stats.hoisted += 1;
            }
            self.cfg.set_block_of(n, Some(best));

            if let Some((alias, mem)) = load {
                let conflicting: Vec<NodeId> = self
                    .writers
                    .iter()
                    .filter(|w| w.mem == mem && w.alias.overlaps(alias))
                    .filter(|w| self.cfg.block_of(w.node) == Some(best))
                    .map(|w| w.node)
                    .collect();
                for store in conflicting {
                    self.anti_deps.push((n, store));
                    self.stats.anti_deps += 1;
                }
            }
        }
        Ok(())
    }

    /// Move `lca` up until no path from `early` to it crosses a store that
    /// overwrites the loaded memory state
    fn raise_above_conflicting_stores(
        &self,
        alias: AliasClass,
        mem: Option<NodeId>,
        lca: BlockId,
        early: BlockId,
    ) -> BlockId {
        let mut marked = vec![false; self.cfg.len()];
        for w in &self.writers {
            if w.mem == mem && w.alias.overlaps(alias) {
                if let Some(b) = self.cfg.block_of(w.node) {
                    marked[b.index()] = true;
                }
            }
        }
        // a memory merge fed by our state kills it along that predecessor edge
        for m in &self.merges {
            if !m.alias.overlaps(alias) {
                continue;
            }
            let Some(region) = self.cfg.block_of(m.node) else { continue };
            for (j, input) in m.inputs.iter().enumerate() {
                if *input == mem {
                    marked[self.cfg.block(region).preds[j].index()] = true;
                }
            }
        }

        // a kill in the early block pins the load there
        if marked[early.index()] {
            return early;
        }

        let mut lca = lca;
        let mut visited = vec![false; self.cfg.len()];
        let mut work = vec![lca];
        while let Some(mid) = work.pop() {
            if mid == early || visited[mid.index()] {
                continue;
            }
            if mid != lca && marked[mid.index()] {
                lca = self.cfg.dom_lca(Some(mid), lca);
                if lca == early {
                    break;
                }
                work.push(lca);
                if lca == mid {
                    continue;
                }
            } else {
                work.extend(self.cfg.block(mid).preds.iter().copied());
            }
            visited[mid.index()] = true;
        }
        lca
    }

    /// Least frequent block on the dominator chain from `late` up to `early`
    fn hoist_to_cheaper_block(&self, late: BlockId, early: BlockId) -> BlockId {
        let mut least = late;
        let mut least_freq = self.cfg.freq(late);
        let mut cur = late;
        while cur != early {
            let Some(up) = self.cfg.block(cur).idom else { break };
            cur = up;
            if self.cfg.freq(cur) < least_freq {
                least = cur;
                least_freq = self.cfg.freq(cur);
            }
        }
        least
    }

    /// Longest latency path from each scheduled node to the end of the method
    fn latencies(&self) -> Vec<u32> {
        let n = self.graph.len();
        let mut latency = vec![0u32; n];
        let mut state = vec![0u8; n];
        for root in self.graph.ids() {
            if state[root.index()] != 0 {
                continue;
            }
            state[root.index()] = 1;
            let mut stack = vec![(root, 0usize)];
            loop {
                let Some(top) = stack.last_mut() else { break };
                let (node, i) = *top;
                let uses = &self.uses[node.index()];
                if i < uses.len() {
                    top.1 += 1;
                    let u = uses[i];
                    if state[u.index()] == 0 && !self.graph.node(u).op.is_phi() {
                        state[u.index()] = 1;
                        stack.push((u, 0));
                    }
                    continue;
                }
                stack.pop();
                let tail = uses
                    .iter()
                    .filter(|u| !self.graph.node(**u).op.is_phi() && self.cfg.block_of(**u).is_some())
                    .map(|u| latency[u.index()])
                    .max()
                    .unwrap_or(0);
                latency[node.index()] = op_latency(&self.graph.node(node).op) + tail;
                state[node.index()] = 2;
            }
        }
        latency
    }

    fn schedule_local(&mut self, latency: &[u32]) -> Result<()> {
        let mut members: Vec<Vec<NodeId>> = vec![Vec::new(); self.cfg.len()];
        for id in self.graph.ids() {
            let node = self.graph.node(id);
            if node.op.is_block_head() {
                continue;
            }
            if let Some(b) = self.cfg.block_of(id) {
                members[b.index()].push(id);
            }
        }

        for (i, nodes) in members.into_iter().enumerate() {
            let b = BlockId(i as u32);
            let end = self.cfg.block(b).end;
            let (phis, rest): (Vec<NodeId>, Vec<NodeId>) = nodes
                .into_iter()
                .filter(|n| *n != end)
                .partition(|n| self.graph.node(*n).op.is_phi());
            let ordered = self.list_schedule(b, &rest, latency)?;
            let block = self.cfg.block_mut(b);
            block.nodes = phis;
            block.nodes.extend(ordered);
            block.nodes.push(end);
        }
        Ok(())
    }

    fn list_schedule(&self, b: BlockId, nodes: &[NodeId], latency: &[u32]) -> Result<Vec<NodeId>> {
        let slot: HashMap<NodeId, usize> = nodes.iter().enumerate().map(|(i, n)| (*n, i)).collect();
        let mut succs: Vec<Vec<usize>> = vec![Vec::new(); nodes.len()];
        let mut pending = vec![0usize; nodes.len()];
        let mut edge = |from: usize, to: usize, succs: &mut Vec<Vec<usize>>| {
            if !succs[from].contains(&to) {
                succs[from].push(to);
                pending[to] += 1;
            }
        };

        let mut last_pinned: Option<usize> = None;
        for (i, &n) in nodes.iter().enumerate() {
            for input in self.graph.node(n).inputs() {
                if let Some(&j) = slot.get(&input) {
                    edge(j, i, &mut succs);
                }
            }
            // pinned nodes keep their program order
            if !self.floating[n.index()] {
                if let Some(j) = last_pinned {
                    edge(j, i, &mut succs);
                }
                last_pinned = Some(i);
            }
        }
        for (load, store) in &self.anti_deps {
            if let (Some(&l), Some(&s)) = (slot.get(load), slot.get(store)) {
                edge(l, s, &mut succs);
            }
        }

        let mut ready: BinaryHeap<(u32, Reverse<u32>, usize)> = BinaryHeap::new();
        for (i, &n) in nodes.iter().enumerate() {
            if pending[i] == 0 {
                ready.push((latency[n.index()], Reverse(n.0), i));
            }
        }
        let mut out = Vec::with_capacity(nodes.len());
        while let Some((_, _, i)) = ready.pop() {
            out.push(nodes[i]);
            for &s in &succs[i] {
                pending[s] -= 1;
                if pending[s] == 0 {
                    let n = nodes[s];
                    ready.push((latency[n.index()], Reverse(n.0), s));
                }
            }
        }
        if out.len() != nodes.len() {
            return Err(CodegenError::Internal(format!(
                "dependence cycle while scheduling {}",
                b
            )));
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cfg::{dom, loops, test_graphs};
    use crate::ir::{Condition, GraphBuilder};
    use crate::operand::BasicType;

    fn schedule(g: &Graph) -> (Cfg, GcmStats) {
        let mut cfg = Cfg::build(g).unwrap();
        dom::compute_dominators(&mut cfg).unwrap();
        loops::build_loop_tree(&mut cfg).unwrap();
        loops::estimate_frequency(&mut cfg);
        let stats = global_code_motion(g, &mut cfg).unwrap();
        (cfg, stats)
    }

    fn position(cfg: &Cfg, n: NodeId) -> (BlockId, usize) {
        let b = cfg.block_of(n).unwrap();
        let i = cfg.block(b).nodes.iter().position(|x| *x == n).unwrap();
        (b, i)
    }

    #[test]
    fn test_invariant_hoisted_out_of_loop() {
        let mut b = GraphBuilder::new("hoist");
        let entry = b.start();
        let n = b.param(0, BasicType::Int);
        let one = b.int(1);
        let head = b.region();
        let body = b.region();
        let exit = b.region();
        b.goto(entry, head);
        let i = b.phi(head, BasicType::Int);
        b.branch(head, Condition::Less, i, n, body, exit, 0.9);
        let inv = b.arith(body, ArithOp::Mul, BasicType::Int, n, n);
        let step = b.arith(body, ArithOp::Add, BasicType::Int, i, inv);
        let next = b.arith(body, ArithOp::Add, BasicType::Int, step, one);
        b.goto_safepoint(body, head);
        b.add_phi_input(i, one);
        b.add_phi_input(i, next);
        b.ret(exit, Some(i));
        let g = b.finish().unwrap();

        let (cfg, stats) = schedule(&g);
        assert_eq!(cfg.block_of(inv), Some(cfg.root));
        assert!(cfg.loop_depth(cfg.block_of(next).unwrap()) > 0);
        assert!(stats.hoisted >= 1);
        // the phi input from the back edge is computed in the loop body
        let body_block = cfg.block_of(next).unwrap();
        assert!(cfg.dominates(cfg.block_of(step).unwrap(), body_block));
    }

    #[test]
    fn test_schedule_respects_dominance_of_uses() {
        let g = test_graphs::counted_loop();
        let (cfg, _) = schedule(&g);
        let uses = g.uses();
        for id in g.ids() {
            let node = g.node(id);
            if node.control.is_some() || node.op.is_block_head() {
                continue;
            }
            let Some(b) = cfg.block_of(id) else { continue };
            for u in &uses[id.index()] {
                if g.node(*u).op.is_phi() {
                    continue;
                }
                let ub = cfg.block_of(*u).unwrap();
                assert!(cfg.dominates(b, ub));
                if ub == b {
                    assert!(position(&cfg, id).1 < position(&cfg, *u).1);
                }
            }
        }
    }

    #[test]
    fn test_load_ordered_before_conflicting_store() {
        let mut b = GraphBuilder::new("anti");
        let entry = b.start();
        let obj = b.param(0, BasicType::Object);
        let v = b.int(5);
        let field = AliasClass::Field(8);
        let load = b.load(obj, 8, BasicType::Int, field, None);
        let store = b.store(entry, obj, 8, v, BasicType::Int, field, None);
        b.ret(entry, Some(load));
        let g = b.finish().unwrap();

        let (cfg, stats) = schedule(&g);
        assert_eq!(stats.anti_deps, 1);
        let (lb, li) = position(&cfg, load);
        let (sb, si) = position(&cfg, store);
        assert_eq!(lb, sb);
        assert!(li < si);
    }

    #[test]
    fn test_load_raised_above_loop_store() {
        // the loop body overwrites the field the load reads on entry
        let mut b = GraphBuilder::new("raise");
        let entry = b.start();
        let obj = b.param(0, BasicType::Object);
        let n = b.param(1, BasicType::Int);
        let field = AliasClass::Field(8);
        let head = b.region();
        let body = b.region();
        let exit = b.region();
        b.goto(entry, head);
        let mem = b.mem_phi(head, field);
        b.branch(head, Condition::Less, n, n, body, exit, 0.9);
        let load = b.load(obj, 8, BasicType::Int, field, None);
        let store = b.store(body, obj, 8, load, BasicType::Int, field, Some(mem));
        b.goto_safepoint(body, head);
        b.add_mem_phi_input(mem, None);
        b.add_mem_phi_input(mem, Some(store));
        b.ret(exit, None);
        let g = b.finish().unwrap();

        let (cfg, _) = schedule(&g);
        assert_eq!(cfg.block_of(load), Some(cfg.root));
    }

    #[test]
    fn test_dead_floating_node_unscheduled() {
        let mut b = GraphBuilder::new("dead");
        let entry = b.start();
        let x = b.param(0, BasicType::Int);
        let dead = b.arith(entry, ArithOp::Add, BasicType::Int, x, x);
        b.ret(entry, Some(x));
        let g = b.finish().unwrap();
        let (cfg, stats) = schedule(&g);
        assert_eq!(cfg.block_of(dead), None);
        assert_eq!(stats.dead, 1);
    }
}
