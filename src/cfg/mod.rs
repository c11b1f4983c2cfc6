//! Control-flow graph over the IR
//!
//! Every `Start`/`Region` head starts a block and its single block end closes
//! it. Blocks live in an arena indexed by [`BlockId`]; the analysis passes in
//! the submodules fill in dominators, loops, frequencies and the schedule.

pub mod dom;
pub mod gcm;
pub mod layout;
pub mod loops;

use crate::error::{CodegenError, Result};
use crate::ir::{Graph, NodeId, Op};
use loops::{LoopId, LoopTree};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BlockId(pub u32);

impl BlockId {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for BlockId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "B{}", self.0)
    }
}

/// How far analysis has progressed for a block
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum BlockState {
    Undiscovered,
    PreOrdered,
    DominatorAssigned,
    LoopClassified,
}

#[derive(Debug, Clone)]
pub struct Block {
    pub id: BlockId,
    pub head: NodeId,
    pub end: NodeId,
    /// Nodes in emission order once scheduled; pinned nodes before that
    pub nodes: Vec<NodeId>,
    pub succs: Vec<BlockId>,
    /// Branch probability per successor
    pub succ_probs: Vec<f64>,
    /// In the order of the head's region inputs, so phi input `i` comes from `preds[i]`
    pub preds: Vec<BlockId>,
    pub pre_order: u32,
    pub rpo: u32,
    pub dom_depth: u32,
    pub idom: Option<BlockId>,
    pub loop_id: Option<LoopId>,
    pub freq: f64,
    pub state: BlockState,
}

#[derive(Debug, Clone)]
pub struct Cfg {
    pub blocks: Vec<Block>,
    pub root: BlockId,
    /// Blocks in reverse post-order, filled by [`dom::compute_dominators`]
    pub rpo_order: Vec<BlockId>,
    pub loop_tree: LoopTree,
    node_block: Vec<Option<BlockId>>,
}

impl Cfg {
    /// Partition the graph into blocks
    pub fn build(graph: &Graph) -> Result<Self> {
        let mut node_block = vec![None; graph.len()];
        let mut blocks: Vec<Block> = Vec::new();
        for id in graph.ids() {
            if graph.node(id).op.is_block_head() {
                let bid = BlockId(blocks.len() as u32);
                node_block[id.index()] = Some(bid);
                blocks.push(Block {
                    id: bid,
                    head: id,
                    end: id,
                    nodes: Vec::new(),
                    succs: Vec::new(),
                    succ_probs: Vec::new(),
                    preds: Vec::new(),
                    pre_order: 0,
                    rpo: 0,
                    dom_depth: 0,
                    idom: None,
                    loop_id: None,
                    freq: 0.0,
                    state: BlockState::Undiscovered,
                });
            }
        }
        let root = node_block[graph.start.index()]
            .ok_or_else(|| CodegenError::Internal("start node is not a block head".into()))?;

        let mut ends: Vec<Option<NodeId>> = vec![None; blocks.len()];
        let mut phis: Vec<Vec<NodeId>> = vec![Vec::new(); blocks.len()];
        let mut pinned: Vec<Vec<NodeId>> = vec![Vec::new(); blocks.len()];
        for id in graph.ids() {
            let node = graph.node(id);
            let Some(control) = node.control else { continue };
            let Some(bid) = node_block[control.index()] else {
                return Err(CodegenError::Internal(format!(
                    "{} pinned to {} which starts no block",
                    id, control
                )));
            };
            node_block[id.index()] = Some(bid);
            if node.op.is_block_end() {
                if let Some(prev) = ends[bid.index()] {
                    return Err(CodegenError::Internal(format!(
                        "{} has two block ends, {} and {}",
                        bid, prev, id
                    )));
                }
                ends[bid.index()] = Some(id);
            } else if node.op.is_phi() {
                phis[bid.index()].push(id);
            } else {
                pinned[bid.index()].push(id);
            }
        }

        for (i, block) in blocks.iter_mut().enumerate() {
            let end = ends[i].ok_or_else(|| {
                CodegenError::Internal(format!("{} (head {}) has no block end", block.id, block.head))
            })?;
            block.end = end;
            block.nodes = phis[i].drain(..).chain(pinned[i].drain(..)).collect();
            block.nodes.push(end);

            let end_op = &graph.node(end).op;
            for target in end_op.successors() {
                let succ = node_block[target.index()].ok_or_else(|| {
                    CodegenError::Internal(format!("{} branches to non-head {}", end, target))
                })?;
                block.succs.push(succ);
            }
            block.succ_probs = successor_probabilities(end_op);
        }

        for i in 0..blocks.len() {
            let head = blocks[i].head;
            let mut preds = Vec::new();
            for pred_end in graph.preds(head) {
                let pred = node_block[pred_end.index()].ok_or_else(|| {
                    CodegenError::Internal(format!("region {} input {} is unpinned", head, pred_end))
                })?;
                preds.push(pred);
            }
            blocks[i].preds = preds;
        }

        let entries: Vec<BlockId> = blocks.iter().filter(|b| b.preds.is_empty()).map(|b| b.id).collect();
        if entries != [root] {
            return Err(CodegenError::Internal(format!(
                "expected {} as the only block without predecessors, found {:?}",
                root, entries
            )));
        }

        Ok(Self {
            blocks,
            root,
            rpo_order: Vec::new(),
            loop_tree: LoopTree::default(),
            node_block,
        })
    }

    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    pub fn block(&self, id: BlockId) -> &Block {
        &self.blocks[id.index()]
    }

    pub fn block_mut(&mut self, id: BlockId) -> &mut Block {
        &mut self.blocks[id.index()]
    }

    pub fn ids(&self) -> impl Iterator<Item = BlockId> {
        (0..self.blocks.len() as u32).map(BlockId)
    }

    /// Block a node is placed in; floating nodes only after scheduling
    pub fn block_of(&self, node: NodeId) -> Option<BlockId> {
        self.node_block.get(node.index()).copied().flatten()
    }

    pub(crate) fn set_block_of(&mut self, node: NodeId, block: Option<BlockId>) {
        self.node_block[node.index()] = block;
    }

    pub fn freq(&self, id: BlockId) -> f64 {
        self.block(id).freq
    }

    /// Index of `pred` among `block`'s predecessors
    pub fn pred_index(&self, block: BlockId, pred: BlockId) -> Option<usize> {
        self.block(block).preds.iter().position(|p| *p == pred)
    }

    /// Nesting depth of the loop a block belongs to; 0 outside any loop
    pub fn loop_depth(&self, id: BlockId) -> u32 {
        self.block(id)
            .loop_id
            .map_or(0, |l| self.loop_tree.get(l).depth)
    }
}

fn successor_probabilities(end: &Op) -> Vec<f64> {
    match end {
        Op::If { true_prob, .. } => {
            let p = (*true_prob as f64).clamp(0.0, 1.0);
            vec![p, 1.0 - p]
        }
        Op::Goto { .. } => vec![1.0],
        Op::NeverBranch { .. } => vec![1.0, 0.0],
        Op::Switch { targets, .. } => vec![1.0 / targets.len() as f64; targets.len()],
        _ => Vec::new(),
    }
}

impl fmt::Display for Cfg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for block in &self.blocks {
            let succs: Vec<String> = block.succs.iter().map(|s| s.to_string()).collect();
            let preds: Vec<String> = block.preds.iter().map(|p| p.to_string()).collect();
            write!(
                f,
                "{} head {} preds [{}] succs [{}] freq {:.3}",
                block.id,
                block.head,
                preds.join(" "),
                succs.join(" "),
                block.freq
            )?;
            if let Some(idom) = block.idom {
                write!(f, " idom {}", idom)?;
            }
            writeln!(f)?;
        }
        Ok(())
    }
}
