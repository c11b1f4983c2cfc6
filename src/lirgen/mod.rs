//! LIR generation
//!
//! Walks the scheduled blocks in reverse post-order and lowers each node to
//! LIR. Per-family encoding questions go to the [`Isa`] strategy; the
//! capability flags of the [`TargetDescriptor`] decide between hardware
//! instructions and runtime calls.
//!
//! Runtime faults never abort code generation: a divide by zero, a failed
//! bounds check or a bad cast becomes a branch into a [`CodeStub`].

mod arith;
mod control;
mod intrinsics;
mod memory;
mod objects;

use crate::cfg::{BlockId, Cfg};
use crate::compiler::CompileContext;
use crate::config::CompileOptions;
use crate::error::{CodegenError, Result};
use crate::ir::{Condition, Graph, NodeId, Op};
use crate::lir::{
    BranchTarget, CodeEmitInfo, CodeStub, LabelId, LirBlock, LirOp, LirOpcode, RuntimeEntry,
    StubId, StubKind,
};
use crate::operand::{BasicType, Constant, Operand};
use crate::target::{Isa, TargetDescriptor};
use std::collections::HashSet;
use tracing::{debug, trace};

/// LIR for every block, indexed by block id, plus the out-of-line stubs
#[derive(Debug, Clone)]
pub struct LirOutput {
    pub blocks: Vec<LirBlock>,
    pub stubs: Vec<CodeStub>,
}

impl LirOutput {
    pub fn op_count(&self) -> usize {
        self.blocks.iter().map(|b| b.ops.len()).sum()
    }
}

pub struct LirGenerator<'a> {
    ctx: &'a CompileContext<'a>,
    graph: &'a Graph,
    cfg: &'a Cfg,
    target: &'a TargetDescriptor,
    isa: &'static dyn Isa,
    options: &'a CompileOptions,
    /// Operand holding each node's value once generated
    results: Vec<Option<Operand>>,
    /// Incoming argument locations by parameter index
    params: Vec<Operand>,
    next_label: u32,
    ops: Vec<LirOp>,
    stubs: Vec<CodeStub>,
    current: BlockId,
}

impl<'a> LirGenerator<'a> {
    pub fn new(ctx: &'a CompileContext<'a>, cfg: &'a Cfg) -> Self {
        let graph = &ctx.graph;
        let params = ctx.isa.runtime_args(&graph.param_types(), ctx.target);
        Self {
            ctx,
            graph,
            cfg,
            target: ctx.target,
            isa: ctx.isa,
            options: ctx.options,
            results: vec![None; graph.len()],
            params,
            next_label: 0,
            ops: Vec::new(),
            stubs: Vec::new(),
            current: cfg.root,
        }
    }

    /// Lower every block; blocks are visited in reverse post-order so each
    /// value is generated before its dominated uses
    pub fn generate(mut self) -> Result<LirOutput> {
        let cfg = self.cfg;
        let mut blocks: Vec<LirBlock> = cfg.ids().map(LirBlock::new).collect();
        for &b in &cfg.rpo_order {
            self.current = b;
            for &n in &cfg.block(b).nodes {
                self.do_node(n)?;
            }
            let ops = std::mem::take(&mut self.ops);
            trace!(block = %b, ops = ops.len(), "lowered block");
            blocks[b.index()].ops = ops;
        }
        let out = LirOutput {
            blocks,
            stubs: self.stubs,
        };
        debug!(
            ops = out.op_count(),
            stubs = out.stubs.len(),
            vregs = self.ctx.vreg_count(),
            "LIR generated"
        );
        Ok(out)
    }

    fn do_node(&mut self, n: NodeId) -> Result<()> {
        let graph = self.graph;
        let node = graph.node(n);
        match &node.op {
            Op::Start | Op::Region { .. } | Op::Phi { .. } | Op::MemPhi { .. } => Ok(()),
            // materialized at each use
            Op::Const(_) => Ok(()),
            Op::Param { index } => self.do_param(n, *index),
            Op::Arith { op, x, y } => self.do_arith(n, *op, *x, *y),
            Op::Shift { op, value, count } => self.do_shift(n, *op, *value, *count),
            Op::Logic { op, x, y } => self.do_logic(n, *op, *x, *y),
            Op::Compare { op, x, y } => self.do_compare(n, *op, *x, *y),
            Op::Negate { value } => self.do_negate(n, *value),
            Op::Convert { op, value } => self.do_convert(n, *op, *value),
            Op::ElementBase { array, elem } => self.do_element_base(n, *array, *elem),
            Op::ArrayLength { array, null_check } => self.do_array_length(n, *array, *null_check),
            Op::LoadIndexed { .. } => self.do_load_indexed(n),
            Op::StoreIndexed { .. } => self.do_store_indexed(n),
            Op::Load { .. } => self.do_load(n),
            Op::Store { .. } => self.do_store(n),
            Op::MonitorEnter {
                object,
                monitor,
                null_check,
            } => self.do_monitor_enter(n, *object, *monitor, *null_check),
            Op::MonitorExit { object, monitor } => self.do_monitor_exit(n, *object, *monitor),
            Op::CheckCast {
                object,
                class,
                failure,
            } => self.do_check_cast(n, *object, *class, *failure),
            Op::InstanceOf { object, class } => self.do_instance_of(n, *object, *class),
            Op::NewInstance { class } => self.do_new_instance(n, *class),
            Op::NewTypeArray { length, elem } => self.do_new_type_array(n, *length, *elem),
            Op::NewObjectArray { length, class } => self.do_new_object_array(n, *length, *class),
            Op::NewMultiArray { dims, class } => self.do_new_multi_array(n, dims, *class),
            Op::Intrinsic { id, args } => self.do_intrinsic(n, *id, args),
            Op::UnsafeGet { .. } => self.do_unsafe_get(n),
            Op::UnsafePut { .. } => self.do_unsafe_put(n),
            Op::UnsafeCas { .. } => self.do_unsafe_cas(n),
            Op::UnsafeGetAndSet { .. } => self.do_unsafe_get_and_set(n),
            Op::If { .. } => self.do_if(n),
            Op::Goto { safepoint, .. } => self.do_goto(n, *safepoint),
            Op::Switch { value, keys, .. } => self.do_switch(*value, keys),
            Op::Return { value } => self.do_return(*value),
            Op::Throw { exception } => self.do_throw(n, *exception),
            Op::NeverBranch { .. } => self.do_never_branch(),
        }
    }

    // ---- operands ----

    fn node_type(&self, n: NodeId) -> BasicType {
        self.graph.node(n).ty
    }

    /// Current operand for a node's value
    fn value(&mut self, n: NodeId) -> Result<Operand> {
        let graph = self.graph;
        let node = graph.node(n);
        match &node.op {
            Op::Const(c) => Ok(Operand::Const(*c)),
            Op::Phi { .. } => {
                // the first reference may come from a back edge move
                if let Some(r) = &self.results[n.index()] {
                    return Ok(r.clone());
                }
                let r = self.new_register(node.ty);
                self.results[n.index()] = Some(r.clone());
                Ok(r)
            }
            _ => self.results[n.index()].clone().ok_or_else(|| {
                CodegenError::Internal(format!("{} ({:?}) used before it was generated", n, node.op))
            }),
        }
    }

    /// Value in a register
    fn load_item(&mut self, n: NodeId) -> Result<Operand> {
        match self.value(n)? {
            Operand::Const(c) => Ok(self.load_constant(c)),
            other => Ok(other),
        }
    }

    /// Constant stays inline if `inline` accepts it; anything else in a register
    fn load_nonconstant(&mut self, n: NodeId, inline: impl Fn(&Constant) -> bool) -> Result<Operand> {
        match self.value(n)? {
            Operand::Const(c) if inline(&c) => Ok(Operand::Const(c)),
            Operand::Const(c) => Ok(self.load_constant(c)),
            other => Ok(other),
        }
    }

    /// Materialize a constant with the shortest sequence the target has
    fn load_constant(&mut self, c: Constant) -> Operand {
        let ty = c.basic_type().stack_type();
        let reg = self.new_register(ty);
        if !self.isa.can_move_immediate(&c, self.target) {
            let pieces = c
                .as_i64()
                .and_then(|v| self.isa.split_add_constant(v, ty))
                .filter(|p| !p.is_empty());
            if let Some(pieces) = pieces {
                // the pieces are disjoint bytes of the word
                let mut iter = pieces.into_iter();
                if let Some(first) = iter.next() {
                    self.emit(
                        LirOp::new(LirOpcode::Move)
                            .result(reg.clone())
                            .inputs(vec![imm(first, ty)]),
                    );
                }
                for piece in iter {
                    self.emit(
                        LirOp::new(LirOpcode::Add)
                            .result(reg.clone())
                            .inputs(vec![reg.clone(), imm(piece, ty)]),
                    );
                }
                return reg;
            }
        }
        self.emit(
            LirOp::new(LirOpcode::Move)
                .result(reg.clone())
                .inputs(vec![Operand::Const(c)]),
        );
        reg
    }

    fn new_register(&self, ty: BasicType) -> Operand {
        Operand::vreg(self.ctx.new_vreg(), ty.stack_type())
    }

    fn new_pointer_register(&self) -> Operand {
        self.new_register(BasicType::Address)
    }

    /// Fresh register recorded as the result of `n`
    fn rlock_result(&mut self, n: NodeId) -> Operand {
        let r = self.new_register(self.node_type(n));
        self.set_result(n, r.clone());
        r
    }

    fn set_result(&mut self, n: NodeId, value: Operand) {
        self.results[n.index()] = Some(value);
    }

    // ---- emission ----

    fn emit(&mut self, op: LirOp) {
        self.ops.push(op);
    }

    fn state_for(&self, n: NodeId, state_before: bool) -> Option<CodeEmitInfo> {
        Some(CodeEmitInfo {
            node: n,
            bci: self.graph.node(n).bci,
            state_before,
            patching: false,
        })
    }

    fn add_stub(&mut self, kind: StubKind, info: Option<CodeEmitInfo>) -> StubId {
        let id = StubId(self.stubs.len() as u32);
        self.stubs.push(CodeStub { id, kind, info });
        id
    }

    fn new_label(&mut self) -> LabelId {
        let l = LabelId(self.next_label);
        self.next_label += 1;
        l
    }

    fn branch(&mut self, cond: Condition, target: BranchTarget) {
        self.emit(LirOp::new(LirOpcode::Branch {
            cond,
            target,
            unordered: None,
        }));
    }

    fn cmp(&mut self, x: Operand, y: Operand) {
        self.emit(LirOp::new(LirOpcode::Cmp).inputs(vec![x, y]));
    }

    /// Call a runtime routine on the calling convention's fixed registers
    ///
    /// Returns a virtual register holding the result, or `Illegal` for void.
    fn call_runtime(
        &mut self,
        args: Vec<Operand>,
        entry: RuntimeEntry,
        result_ty: BasicType,
        info: Option<CodeEmitInfo>,
    ) -> Operand {
        let tys: Vec<BasicType> = args.iter().map(|a| a.ty().stack_type()).collect();
        let locations = self.isa.runtime_args(&tys, self.target);
        for (arg, loc) in args.into_iter().zip(&locations) {
            self.emit(LirOp::new(LirOpcode::Move).result(loc.clone()).inputs(vec![arg]));
        }
        let fixed = if result_ty == BasicType::Void {
            Operand::Illegal
        } else {
            self.isa.result_location(result_ty, self.target)
        };
        self.emit(
            LirOp::new(LirOpcode::Call(entry))
                .result(fixed.clone())
                .inputs(locations)
                .info(info),
        );
        if fixed.is_illegal() {
            return fixed;
        }
        let r = self.new_register(result_ty);
        self.emit(LirOp::new(LirOpcode::Move).result(r.clone()).inputs(vec![fixed]));
        r
    }

    /// Move values flowing into `succ`'s phis along the edge from the current block
    fn move_to_phis(&mut self, succ: BlockId) -> Result<()> {
        let graph = self.graph;
        let slot = self.cfg.pred_index(succ, self.current).ok_or_else(|| {
            CodegenError::Internal(format!("{} is not a predecessor of {}", self.current, succ))
        })?;
        let phis: Vec<NodeId> = self
            .cfg
            .block(succ)
            .nodes
            .iter()
            .copied()
            .filter(|p| matches!(graph.node(*p).op, Op::Phi { .. }))
            .collect();
        let phi_set: HashSet<NodeId> = phis.iter().copied().collect();

        let mut moves: Vec<(Operand, Operand)> = Vec::with_capacity(phis.len());
        let mut staged: Vec<(Operand, Operand)> = Vec::new();
        for phi in phis {
            let Op::Phi { inputs } = &graph.node(phi).op else { continue };
            let input = *inputs.get(slot).ok_or_else(|| {
                CodegenError::Internal(format!("phi {} has no input for {}", phi, self.current))
            })?;
            let dest = self.value(phi)?;
            let src = self.value(input)?;
            if dest == src {
                continue;
            }
            if phi_set.contains(&input) {
                // another phi of this merge may overwrite it first
                let tmp = self.new_register(graph.node(input).ty);
                staged.push((tmp.clone(), src));
                moves.push((dest, tmp));
            } else {
                moves.push((dest, src));
            }
        }
        for (dest, src) in staged.into_iter().chain(moves) {
            self.emit(LirOp::new(LirOpcode::Move).result(dest).inputs(vec![src]));
        }
        Ok(())
    }
}

/// Constant of the given register type
fn imm_const(v: i64, ty: BasicType) -> Constant {
    if ty == BasicType::Long {
        return Constant::Long(v);
    }
    match i32::try_from(v) {
        Ok(i) => Constant::Int(i),
        Err(_) if ty == BasicType::Int => Constant::Int(v as i32),
        Err(_) => Constant::Long(v),
    }
}

fn imm(v: i64, ty: BasicType) -> Operand {
    Operand::Const(imm_const(v, ty))
}
