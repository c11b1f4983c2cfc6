//! Input IR graph
//!
//! A method arrives as an arena of [`Node`]s. Control is expressed with block
//! heads (`Start`, `Region`) and block ends (`If`, `Goto`, `Switch`, `Return`,
//! `Throw`, `NeverBranch`). A node is *pinned* when it names a head in
//! `control`; everything else floats and is placed by global code motion.

use crate::error::{CodegenError, Result};
use crate::operand::{BasicType, Constant};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeId(pub u32);

impl NodeId {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "n{}", self.0)
    }
}

/// Branch condition, signed unless noted
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Condition {
    Equal,
    NotEqual,
    Less,
    LessEqual,
    Greater,
    GreaterEqual,
    /// Unsigned <
    Below,
    /// Unsigned <=
    BelowEqual,
    /// Unsigned >
    Above,
    /// Unsigned >=
    AboveEqual,
}

impl Condition {
    /// Condition that holds exactly when `self` does not
    pub fn negate(self) -> Self {
        use Condition::*;
        match self {
            Equal => NotEqual,
            NotEqual => Equal,
            Less => GreaterEqual,
            GreaterEqual => Less,
            LessEqual => Greater,
            Greater => LessEqual,
            Below => AboveEqual,
            AboveEqual => Below,
            BelowEqual => Above,
            Above => BelowEqual,
        }
    }

    /// Condition to use after swapping the operands
    pub fn mirror(self) -> Self {
        use Condition::*;
        match self {
            Less => Greater,
            Greater => Less,
            LessEqual => GreaterEqual,
            GreaterEqual => LessEqual,
            Below => Above,
            Above => Below,
            BelowEqual => AboveEqual,
            AboveEqual => BelowEqual,
            other => other,
        }
    }

    pub fn eval(self, a: i64, b: i64) -> bool {
        use Condition::*;
        match self {
            Equal => a == b,
            NotEqual => a != b,
            Less => a < b,
            LessEqual => a <= b,
            Greater => a > b,
            GreaterEqual => a >= b,
            Below => (a as u64) < (b as u64),
            BelowEqual => (a as u64) <= (b as u64),
            Above => (a as u64) > (b as u64),
            AboveEqual => (a as u64) >= (b as u64),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ArithOp {
    Add,
    Sub,
    Mul,
    Div,
    Rem,
}

impl ArithOp {
    pub fn is_commutative(self) -> bool {
        matches!(self, ArithOp::Add | ArithOp::Mul)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ShiftOp {
    Shl,
    /// Arithmetic shift right
    Shr,
    /// Logical shift right
    Ushr,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LogicOp {
    And,
    Or,
    Xor,
}

/// Three-way compares producing -1, 0 or 1
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CompareOp {
    LongCmp,
    /// Unordered compares as less
    FloatCmpL,
    /// Unordered compares as greater
    FloatCmpG,
    DoubleCmpL,
    DoubleCmpG,
}

impl CompareOp {
    pub fn unordered_is_less(self) -> bool {
        matches!(self, CompareOp::FloatCmpL | CompareOp::DoubleCmpL)
    }

    pub fn operand_type(self) -> BasicType {
        match self {
            CompareOp::LongCmp => BasicType::Long,
            CompareOp::FloatCmpL | CompareOp::FloatCmpG => BasicType::Float,
            CompareOp::DoubleCmpL | CompareOp::DoubleCmpG => BasicType::Double,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ConvertOp {
    I2L,
    L2I,
    I2F,
    I2D,
    L2F,
    L2D,
    F2I,
    F2L,
    F2D,
    D2I,
    D2L,
    D2F,
    I2B,
    I2C,
    I2S,
}

impl ConvertOp {
    pub fn source_type(self) -> BasicType {
        use ConvertOp::*;
        match self {
            I2L | I2F | I2D | I2B | I2C | I2S => BasicType::Int,
            L2I | L2F | L2D => BasicType::Long,
            F2I | F2L | F2D => BasicType::Float,
            D2I | D2L | D2F => BasicType::Double,
        }
    }

    pub fn result_type(self) -> BasicType {
        use ConvertOp::*;
        match self {
            L2I | F2I | D2I | I2B | I2C | I2S => BasicType::Int,
            I2L | F2L | D2L => BasicType::Long,
            I2F | L2F | D2F => BasicType::Float,
            I2D | L2D | F2D => BasicType::Double,
        }
    }

    pub fn involves_float(self) -> bool {
        self.source_type().is_float() || self.result_type().is_float()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum IntrinsicId {
    Dabs,
    Dsqrt,
    Dsin,
    Dcos,
    Dtan,
    Dlog,
    Dlog10,
    Dexp,
    Dpow,
    ArrayCopy,
    Crc32Update,
    Crc32UpdateBytes,
    Fma,
    VectorizedMismatch,
}

/// Memory slice a load or store touches
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AliasClass {
    /// Instance field at a fixed offset
    Field(i32),
    /// Elements of arrays of one type
    Array(BasicType),
    /// Unknown memory; overlaps everything
    Raw,
}

impl AliasClass {
    pub fn overlaps(self, other: AliasClass) -> bool {
        self == other || self == AliasClass::Raw || other == AliasClass::Raw
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClassRef {
    pub id: u32,
    pub loaded: bool,
}

/// Exception path of a failed checkcast
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CastFailure {
    ClassCast,
    /// Interface receiver check
    IncompatibleClassChange,
    /// Receiver check of an invokespecial; deoptimize instead of throwing
    Deoptimize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Op {
    /// Method entry; head of the root block
    Start,
    /// Merge point; `preds` are the block ends flowing in
    Region { preds: Vec<NodeId> },
    /// Conditional branch; `targets` is `[taken, not taken]`
    If {
        cond: Condition,
        x: NodeId,
        y: NodeId,
        targets: [NodeId; 2],
        true_prob: f32,
        safepoint: bool,
    },
    Goto { target: NodeId, safepoint: bool },
    /// Key switch; `targets` holds one region per key then the default
    Switch {
        value: NodeId,
        keys: Vec<i32>,
        targets: Vec<NodeId>,
    },
    Return { value: Option<NodeId> },
    Throw { exception: NodeId },
    /// Always jumps to `target`; `fake_exit` only keeps infinite loops attached
    NeverBranch { target: NodeId, fake_exit: NodeId },

    /// Incoming argument
    Param { index: u32 },
    Const(Constant),
    /// Value merge; inputs line up with the region's predecessors
    Phi { inputs: Vec<NodeId> },
    /// Memory-state merge for one alias class; `None` is the entry state
    MemPhi {
        alias: AliasClass,
        inputs: Vec<Option<NodeId>>,
    },
    Arith { op: ArithOp, x: NodeId, y: NodeId },
    Shift {
        op: ShiftOp,
        value: NodeId,
        count: NodeId,
    },
    Logic { op: LogicOp, x: NodeId, y: NodeId },
    Compare { op: CompareOp, x: NodeId, y: NodeId },
    Negate { value: NodeId },
    Convert { op: ConvertOp, value: NodeId },
    /// Address of element 0 of `array`
    ElementBase { array: NodeId, elem: BasicType },
    ArrayLength { array: NodeId, null_check: bool },
    LoadIndexed {
        array: NodeId,
        index: NodeId,
        length: Option<NodeId>,
        base: Option<NodeId>,
        elem: BasicType,
        null_check: bool,
        mem: Option<NodeId>,
    },
    StoreIndexed {
        array: NodeId,
        index: NodeId,
        value: NodeId,
        length: Option<NodeId>,
        base: Option<NodeId>,
        elem: BasicType,
        null_check: bool,
        /// Storing into a boolean array; mask the value to one bit
        check_boolean: bool,
        mem: Option<NodeId>,
    },
    /// Field or raw load from `base + offset`; `base` is known non-null
    Load {
        base: NodeId,
        offset: i64,
        alias: AliasClass,
        mem: Option<NodeId>,
        volatile: bool,
    },
    Store {
        base: NodeId,
        offset: i64,
        value: NodeId,
        /// Type of the memory slot; sub-word stores truncate
        ty: BasicType,
        alias: AliasClass,
        mem: Option<NodeId>,
        volatile: bool,
    },
    MonitorEnter {
        object: NodeId,
        monitor: u32,
        null_check: bool,
    },
    MonitorExit { object: NodeId, monitor: u32 },
    CheckCast {
        object: NodeId,
        class: ClassRef,
        failure: CastFailure,
    },
    InstanceOf { object: NodeId, class: ClassRef },
    NewInstance { class: ClassRef },
    NewTypeArray { length: NodeId, elem: BasicType },
    NewObjectArray { length: NodeId, class: ClassRef },
    NewMultiArray { dims: Vec<NodeId>, class: ClassRef },
    Intrinsic { id: IntrinsicId, args: Vec<NodeId> },
    UnsafeGet {
        object: NodeId,
        offset: NodeId,
        volatile: bool,
    },
    UnsafePut {
        object: NodeId,
        offset: NodeId,
        value: NodeId,
        volatile: bool,
        mem: Option<NodeId>,
    },
    UnsafeCas {
        object: NodeId,
        offset: NodeId,
        expected: NodeId,
        new_value: NodeId,
        mem: Option<NodeId>,
    },
    /// Atomic exchange, or fetch-and-add when `is_add`
    UnsafeGetAndSet {
        object: NodeId,
        offset: NodeId,
        value: NodeId,
        is_add: bool,
        mem: Option<NodeId>,
    },
}

impl Op {
    pub fn is_block_head(&self) -> bool {
        matches!(self, Op::Start | Op::Region { .. })
    }

    pub fn is_block_end(&self) -> bool {
        matches!(
            self,
            Op::If { .. }
                | Op::Goto { .. }
                | Op::Switch { .. }
                | Op::Return { .. }
                | Op::Throw { .. }
                | Op::NeverBranch { .. }
        )
    }

    pub fn is_phi(&self) -> bool {
        matches!(self, Op::Phi { .. } | Op::MemPhi { .. })
    }

    /// Successor heads of a block end, in branch order
    pub fn successors(&self) -> Vec<NodeId> {
        match self {
            Op::If { targets, .. } => targets.to_vec(),
            Op::Goto { target, .. } => vec![*target],
            Op::Switch { targets, .. } => targets.clone(),
            Op::NeverBranch { target, fake_exit } => vec![*target, *fake_exit],
            _ => Vec::new(),
        }
    }

    fn successors_mut(&mut self) -> Vec<&mut NodeId> {
        match self {
            Op::If { targets, .. } => targets.iter_mut().collect(),
            Op::Goto { target, .. } => vec![target],
            Op::Switch { targets, .. } => targets.iter_mut().collect(),
            Op::NeverBranch { target, fake_exit } => vec![target, fake_exit],
            _ => Vec::new(),
        }
    }

    /// Alias class and memory input of a memory-writing op
    pub fn store_memory(&self) -> Option<(AliasClass, Option<NodeId>)> {
        match self {
            Op::Store { alias, mem, .. } => Some((*alias, *mem)),
            Op::StoreIndexed { elem, mem, .. } => Some((AliasClass::Array(*elem), *mem)),
            Op::UnsafePut { mem, .. }
            | Op::UnsafeCas { mem, .. }
            | Op::UnsafeGetAndSet { mem, .. } => Some((AliasClass::Raw, *mem)),
            _ => None,
        }
    }

    /// Alias class and memory input of a floating load
    pub fn load_memory(&self) -> Option<(AliasClass, Option<NodeId>)> {
        match self {
            Op::Load {
                alias,
                mem,
                volatile: false,
                ..
            } => Some((*alias, *mem)),
            _ => None,
        }
    }

    /// The op has to stay where the front end put it
    pub fn must_pin(&self, ty: BasicType) -> bool {
        match self {
            Op::Arith {
                op: ArithOp::Div | ArithOp::Rem,
                ..
            } => !ty.is_float(),
            Op::Load { volatile, .. } => *volatile,
            Op::Const(_)
            | Op::Arith { .. }
            | Op::Shift { .. }
            | Op::Logic { .. }
            | Op::Compare { .. }
            | Op::Negate { .. }
            | Op::Convert { .. }
            | Op::ElementBase { .. }
            | Op::InstanceOf { .. } => false,
            Op::Start | Op::Region { .. } => false,
            _ => true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node {
    pub op: Op,
    /// Result type; `Void` for control and memory
    pub ty: BasicType,
    /// Block head this node is pinned to
    pub control: Option<NodeId>,
    /// Bytecode index for debug info
    pub bci: u32,
}

impl Node {
    pub fn is_pinned(&self) -> bool {
        self.control.is_some()
    }

    /// Data inputs, memory states included
    pub fn inputs(&self) -> Vec<NodeId> {
        let mut out = Vec::new();
        let mut push = |id: NodeId| out.push(id);
        match &self.op {
            Op::Start | Op::Region { .. } | Op::Goto { .. } | Op::NeverBranch { .. } => {}
            Op::Param { .. } | Op::Const(_) | Op::NewInstance { .. } => {}
            Op::If { x, y, .. } => {
                push(*x);
                push(*y);
            }
            Op::Switch { value, .. } => push(*value),
            Op::Return { value } => value.iter().copied().for_each(push),
            Op::Throw { exception } => push(*exception),
            Op::Phi { inputs } => inputs.iter().copied().for_each(push),
            Op::MemPhi { inputs, .. } => inputs.iter().flatten().copied().for_each(push),
            Op::Arith { x, y, .. } | Op::Logic { x, y, .. } | Op::Compare { x, y, .. } => {
                push(*x);
                push(*y);
            }
            Op::Shift { value, count, .. } => {
                push(*value);
                push(*count);
            }
            Op::Negate { value } | Op::Convert { value, .. } => push(*value),
            Op::ElementBase { array, .. } | Op::ArrayLength { array, .. } => push(*array),
            Op::LoadIndexed {
                array,
                index,
                length,
                base,
                mem,
                ..
            } => {
                push(*array);
                push(*index);
                length.iter().chain(base).chain(mem).copied().for_each(push);
            }
            Op::StoreIndexed {
                array,
                index,
                value,
                length,
                base,
                mem,
                ..
            } => {
                push(*array);
                push(*index);
                push(*value);
                length.iter().chain(base).chain(mem).copied().for_each(push);
            }
            Op::Load { base, mem, .. } => {
                push(*base);
                mem.iter().copied().for_each(push);
            }
            Op::Store {
                base, value, mem, ..
            } => {
                push(*base);
                push(*value);
                mem.iter().copied().for_each(push);
            }
            Op::MonitorEnter { object, .. }
            | Op::MonitorExit { object, .. }
            | Op::CheckCast { object, .. }
            | Op::InstanceOf { object, .. } => push(*object),
            Op::NewTypeArray { length, .. } | Op::NewObjectArray { length, .. } => push(*length),
            Op::NewMultiArray { dims, .. } => dims.iter().copied().for_each(push),
            Op::Intrinsic { args, .. } => args.iter().copied().for_each(push),
            Op::UnsafeGet { object, offset, .. } => {
                push(*object);
                push(*offset);
            }
            Op::UnsafePut {
                object,
                offset,
                value,
                mem,
                ..
            }
            | Op::UnsafeGetAndSet {
                object,
                offset,
                value,
                mem,
                ..
            } => {
                push(*object);
                push(*offset);
                push(*value);
                mem.iter().copied().for_each(push);
            }
            Op::UnsafeCas {
                object,
                offset,
                expected,
                new_value,
                mem,
            } => {
                push(*object);
                push(*offset);
                push(*expected);
                push(*new_value);
                mem.iter().copied().for_each(push);
            }
        }
        out
    }
}

/// One method's IR
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Graph {
    pub name: String,
    pub nodes: Vec<Node>,
    pub start: NodeId,
    /// Address of the method's backedge counter cell
    #[serde(default)]
    pub backedge_counter: i64,
}

impl Graph {
    pub fn node(&self, id: NodeId) -> &Node {
        &self.nodes[id.index()]
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn ids(&self) -> impl Iterator<Item = NodeId> {
        (0..self.nodes.len() as u32).map(NodeId)
    }

    /// Predecessor ends of a block head; empty for `Start`
    pub fn preds(&self, head: NodeId) -> &[NodeId] {
        match &self.node(head).op {
            Op::Region { preds } => preds,
            _ => &[],
        }
    }

    /// Use lists, in node order
    pub fn uses(&self) -> Vec<Vec<NodeId>> {
        let mut uses = vec![Vec::new(); self.nodes.len()];
        for id in self.ids() {
            for input in self.node(id).inputs() {
                if uses[input.index()].last() != Some(&id) {
                    uses[input.index()].push(id);
                }
            }
        }
        uses
    }

    /// Incoming argument types in parameter order
    pub fn param_types(&self) -> Vec<BasicType> {
        let mut params: Vec<(u32, BasicType)> = self
            .nodes
            .iter()
            .filter_map(|n| match n.op {
                Op::Param { index } => Some((index, n.ty)),
                _ => None,
            })
            .collect();
        params.sort_by_key(|(index, _)| *index);
        params.into_iter().map(|(_, ty)| ty).collect()
    }

    pub fn validate(&self) -> Result<()> {
        let bad = |msg: String| Err(CodegenError::MalformedGraph(msg));
        let len = self.nodes.len();
        if self.start.index() >= len || self.node(self.start).op != Op::Start {
            return bad(format!("{} is not the start node", self.start));
        }

        for id in self.ids() {
            let node = self.node(id);
            for input in node.inputs() {
                if input.index() >= len {
                    return bad(format!("{} uses missing node {}", id, input));
                }
                if node.op.is_block_end() || !self.node(input).op.is_block_end() {
                    continue;
                }
                return bad(format!("{} consumes control node {}", id, input));
            }
            if let Op::Start = node.op {
                if id != self.start {
                    return bad(format!("second start node {}", id));
                }
            }
            if node.op.is_block_head() {
                if node.control.is_some() {
                    return bad(format!("block head {} has a control input", id));
                }
            } else if node.op.is_block_end() || node.op.is_phi() || node.op.must_pin(node.ty) {
                if node.control.is_none() {
                    return bad(format!("{} ({:?}) must be pinned", id, node.op));
                }
            }
            if let Some(ctrl) = node.control {
                if ctrl.index() >= len || !self.node(ctrl).op.is_block_head() {
                    return bad(format!("{} is pinned to non-head {}", id, ctrl));
                }
            }

            for target in node.op.successors() {
                if target.index() >= len {
                    return bad(format!("{} branches to missing node {}", id, target));
                }
                let expected = node.op.successors().iter().filter(|t| **t == target).count();
                let linked = self.preds(target).iter().filter(|p| **p == id).count();
                if !matches!(self.node(target).op, Op::Region { .. }) || expected != linked {
                    return bad(format!("{} -> {} is not linked as a region predecessor", id, target));
                }
            }
            if let Op::Region { preds } = &node.op {
                for pred in preds {
                    if pred.index() >= len || !self.node(*pred).op.successors().contains(&id) {
                        return bad(format!("region {} lists {} which does not branch to it", id, pred));
                    }
                }
            }
            let arity = match &node.op {
                Op::Phi { inputs } => Some(inputs.len()),
                Op::MemPhi { inputs, .. } => Some(inputs.len()),
                _ => None,
            };
            if let (Some(arity), Some(region)) = (arity, node.control) {
                if arity != self.preds(region).len() {
                    return bad(format!(
                        "phi {} has {} inputs but region {} has {} predecessors",
                        id,
                        arity,
                        region,
                        self.preds(region).len()
                    ));
                }
            }
            if let Op::Switch { keys, targets, .. } = &node.op {
                if targets.len() != keys.len() + 1 {
                    return bad(format!("switch {} needs one target per key plus a default", id));
                }
            }
        }
        Ok(())
    }

    /// Put a `Region`+`Goto` pair on every edge from a multi-way block end into
    /// a merge or a phi-carrying head, so every edge into a phi leaves a
    /// single-successor block
    pub fn split_critical_edges(&mut self) -> usize {
        let phi_heads: HashSet<NodeId> = self
            .nodes
            .iter()
            .filter(|n| matches!(n.op, Op::Phi { .. }))
            .filter_map(|n| n.control)
            .collect();
        let mut split = 0;
        for id in self.ids().collect::<Vec<_>>() {
            let succs = self.node(id).op.successors();
            if succs.len() < 2 {
                continue;
            }
            for (slot, target) in succs.into_iter().enumerate() {
                if self.preds(target).len() < 2 && !phi_heads.contains(&target) {
                    continue;
                }
                let bci = self.node(id).bci;
                let region = self.push(Op::Region { preds: vec![id] }, BasicType::Void, None, bci);
                let goto = self.push(
                    Op::Goto {
                        target,
                        safepoint: false,
                    },
                    BasicType::Void,
                    Some(region),
                    bci,
                );
                if let Some(succ) = self.nodes[id.index()].op.successors_mut().into_iter().nth(slot) {
                    *succ = region;
                }
                if let Op::Region { preds } = &mut self.nodes[target.index()].op {
                    if let Some(pred) = preds.iter_mut().find(|p| **p == id) {
                        *pred = goto;
                    }
                }
                split += 1;
            }
        }
        split
    }

    fn push(&mut self, op: Op, ty: BasicType, control: Option<NodeId>, bci: u32) -> NodeId {
        let id = NodeId(self.nodes.len() as u32);
        self.nodes.push(Node {
            op,
            ty,
            control,
            bci,
        });
        id
    }
}

/// Incremental graph construction
///
/// Builders for operations that are always pinned take their block. Those that
/// always float take none. [`GraphBuilder::op`] and [`GraphBuilder::arith`]
/// take a block but pin to it only when the operation requires it.
pub struct GraphBuilder {
    graph: Graph,
    bci: u32,
}

impl GraphBuilder {
    pub fn new(name: &str) -> Self {
        let mut graph = Graph {
            name: name.to_string(),
            nodes: Vec::new(),
            start: NodeId(0),
            backedge_counter: 0,
        };
        graph.push(Op::Start, BasicType::Void, None, 0);
        Self { graph, bci: 0 }
    }

    pub fn start(&self) -> NodeId {
        self.graph.start
    }

    /// Bytecode index recorded on subsequently created nodes
    pub fn set_bci(&mut self, bci: u32) {
        self.bci = bci;
    }

    pub fn set_backedge_counter(&mut self, address: i64) {
        self.graph.backedge_counter = address;
    }

    /// Add any operation; it is pinned to `block` only if it has to be
    pub fn op(&mut self, block: NodeId, op: Op, ty: BasicType) -> NodeId {
        let control = if op.must_pin(ty) || op.is_block_end() || op.is_phi() {
            Some(block)
        } else {
            None
        };
        self.graph.push(op, ty, control, self.bci)
    }

    pub fn region(&mut self) -> NodeId {
        self.graph
            .push(Op::Region { preds: Vec::new() }, BasicType::Void, None, self.bci)
    }

    pub fn param(&mut self, index: u32, ty: BasicType) -> NodeId {
        let start = self.graph.start;
        self.graph.push(Op::Param { index }, ty, Some(start), 0)
    }

    pub fn constant(&mut self, c: Constant) -> NodeId {
        self.graph.push(Op::Const(c), c.basic_type(), None, self.bci)
    }

    pub fn int(&mut self, v: i32) -> NodeId {
        self.constant(Constant::Int(v))
    }

    pub fn long(&mut self, v: i64) -> NodeId {
        self.constant(Constant::Long(v))
    }

    pub fn null(&mut self) -> NodeId {
        self.constant(Constant::Null)
    }

    /// `block` pins only integer divides and remainders, which can trap; any
    /// other arithmetic floats and `block` is ignored
    pub fn arith(&mut self, block: NodeId, op: ArithOp, ty: BasicType, x: NodeId, y: NodeId) -> NodeId {
        self.op(block, Op::Arith { op, x, y }, ty)
    }

    pub fn shift(&mut self, op: ShiftOp, ty: BasicType, value: NodeId, count: NodeId) -> NodeId {
        self.graph.push(Op::Shift { op, value, count }, ty, None, self.bci)
    }

    pub fn logic(&mut self, op: LogicOp, ty: BasicType, x: NodeId, y: NodeId) -> NodeId {
        self.graph.push(Op::Logic { op, x, y }, ty, None, self.bci)
    }

    pub fn compare(&mut self, op: CompareOp, x: NodeId, y: NodeId) -> NodeId {
        self.graph
            .push(Op::Compare { op, x, y }, BasicType::Int, None, self.bci)
    }

    pub fn convert(&mut self, op: ConvertOp, value: NodeId) -> NodeId {
        self.graph
            .push(Op::Convert { op, value }, op.result_type(), None, self.bci)
    }

    /// Phi with no inputs yet; fill it with [`GraphBuilder::add_phi_input`]
    pub fn phi(&mut self, region: NodeId, ty: BasicType) -> NodeId {
        self.graph
            .push(Op::Phi { inputs: Vec::new() }, ty, Some(region), self.bci)
    }

    pub fn add_phi_input(&mut self, phi: NodeId, value: NodeId) {
        if let Op::Phi { inputs } = &mut self.graph.nodes[phi.index()].op {
            inputs.push(value);
        }
    }

    pub fn mem_phi(&mut self, region: NodeId, alias: AliasClass) -> NodeId {
        self.graph.push(
            Op::MemPhi {
                alias,
                inputs: Vec::new(),
            },
            BasicType::Void,
            Some(region),
            self.bci,
        )
    }

    pub fn add_mem_phi_input(&mut self, phi: NodeId, state: Option<NodeId>) {
        if let Op::MemPhi { inputs, .. } = &mut self.graph.nodes[phi.index()].op {
            inputs.push(state);
        }
    }

    fn end(&mut self, block: NodeId, op: Op) -> NodeId {
        let targets = op.successors();
        let id = self.graph.push(op, BasicType::Void, Some(block), self.bci);
        for target in targets {
            if let Op::Region { preds } = &mut self.graph.nodes[target.index()].op {
                preds.push(id);
            }
        }
        id
    }

    pub fn goto(&mut self, block: NodeId, target: NodeId) -> NodeId {
        self.end(
            block,
            Op::Goto {
                target,
                safepoint: false,
            },
        )
    }

    /// Backward jump that polls for a safepoint
    pub fn goto_safepoint(&mut self, block: NodeId, target: NodeId) -> NodeId {
        self.end(
            block,
            Op::Goto {
                target,
                safepoint: true,
            },
        )
    }

    #[allow(clippy::too_many_arguments)]
    pub fn branch(
        &mut self,
        block: NodeId,
        cond: Condition,
        x: NodeId,
        y: NodeId,
        taken: NodeId,
        not_taken: NodeId,
        true_prob: f32,
    ) -> NodeId {
        self.end(
            block,
            Op::If {
                cond,
                x,
                y,
                targets: [taken, not_taken],
                true_prob,
                safepoint: false,
            },
        )
    }

    /// Conditional branch that is also a safepoint poll (loop back branch)
    #[allow(clippy::too_many_arguments)]
    pub fn branch_safepoint(
        &mut self,
        block: NodeId,
        cond: Condition,
        x: NodeId,
        y: NodeId,
        taken: NodeId,
        not_taken: NodeId,
        true_prob: f32,
    ) -> NodeId {
        self.end(
            block,
            Op::If {
                cond,
                x,
                y,
                targets: [taken, not_taken],
                true_prob,
                safepoint: true,
            },
        )
    }

    pub fn switch(&mut self, block: NodeId, value: NodeId, keys: Vec<i32>, targets: Vec<NodeId>) -> NodeId {
        self.end(
            block,
            Op::Switch {
                value,
                keys,
                targets,
            },
        )
    }

    pub fn ret(&mut self, block: NodeId, value: Option<NodeId>) -> NodeId {
        self.end(block, Op::Return { value })
    }

    pub fn throw(&mut self, block: NodeId, exception: NodeId) -> NodeId {
        self.end(block, Op::Throw { exception })
    }

    pub fn never_branch(&mut self, block: NodeId, target: NodeId, fake_exit: NodeId) -> NodeId {
        self.end(block, Op::NeverBranch { target, fake_exit })
    }

    pub fn element_base(&mut self, array: NodeId, elem: BasicType) -> NodeId {
        self.graph.push(
            Op::ElementBase { array, elem },
            BasicType::Address,
            None,
            self.bci,
        )
    }

    pub fn array_length(&mut self, block: NodeId, array: NodeId) -> NodeId {
        self.op(
            block,
            Op::ArrayLength {
                array,
                null_check: true,
            },
            BasicType::Int,
        )
    }

    pub fn load(
        &mut self,
        base: NodeId,
        offset: i64,
        ty: BasicType,
        alias: AliasClass,
        mem: Option<NodeId>,
    ) -> NodeId {
        self.graph.push(
            Op::Load {
                base,
                offset,
                alias,
                mem,
                volatile: false,
            },
            ty,
            None,
            self.bci,
        )
    }

    #[allow(clippy::too_many_arguments)]
    pub fn store(
        &mut self,
        block: NodeId,
        base: NodeId,
        offset: i64,
        value: NodeId,
        ty: BasicType,
        alias: AliasClass,
        mem: Option<NodeId>,
    ) -> NodeId {
        self.op(
            block,
            Op::Store {
                base,
                offset,
                value,
                ty,
                alias,
                mem,
                volatile: false,
            },
            BasicType::Void,
        )
    }

    pub fn load_indexed(
        &mut self,
        block: NodeId,
        array: NodeId,
        index: NodeId,
        elem: BasicType,
        base: Option<NodeId>,
    ) -> NodeId {
        self.op(
            block,
            Op::LoadIndexed {
                array,
                index,
                length: None,
                base,
                elem,
                null_check: true,
                mem: None,
            },
            elem.stack_type(),
        )
    }

    /// Array store with an implicit length load; `base` is an optional
    /// [`Op::ElementBase`] of the same array
    pub fn store_indexed(
        &mut self,
        block: NodeId,
        array: NodeId,
        index: NodeId,
        value: NodeId,
        elem: BasicType,
        base: Option<NodeId>,
    ) -> NodeId {
        self.op(
            block,
            Op::StoreIndexed {
                array,
                index,
                value,
                length: None,
                base,
                elem,
                null_check: true,
                check_boolean: elem == BasicType::Boolean,
                mem: None,
            },
            BasicType::Void,
        )
    }

    /// Validate and normalize into a graph the backend accepts
    pub fn finish(mut self) -> Result<Graph> {
        self.graph.validate()?;
        self.graph.split_critical_edges();
        Ok(self.graph)
    }

    /// Raw graph without validation, for tests of the validators themselves
    pub fn into_graph(self) -> Graph {
        self.graph
    }
}
