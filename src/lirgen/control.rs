//! Block ends, parameters and safepoints

use super::LirGenerator;
use crate::cfg::BlockId;
use crate::error::{CodegenError, Result};
use crate::ir::{Condition, NodeId, Op};
use crate::lir::{BranchTarget, LirOp, LirOpcode, RuntimeEntry};
use crate::operand::{BasicType, Constant, Operand, PReg};

impl<'a> LirGenerator<'a> {
    pub(super) fn do_param(&mut self, n: NodeId, index: u32) -> Result<()> {
        let incoming = self
            .params
            .get(index as usize)
            .cloned()
            .ok_or_else(|| CodegenError::MalformedGraph(format!("{} reads missing parameter {}", n, index)))?;
        let result = self.rlock_result(n);
        self.emit(LirOp::new(LirOpcode::Move).result(result).inputs(vec![incoming]));
        Ok(())
    }

    /// Successor blocks of the current block end, in branch order
    fn successor_blocks(&self) -> Result<Vec<BlockId>> {
        let end = self.cfg.block(self.current).end;
        self.graph
            .node(end)
            .op
            .successors()
            .into_iter()
            .map(|head| {
                self.cfg.block_of(head).ok_or_else(|| {
                    CodegenError::Internal(format!("successor {} of {} has no block", head, end))
                })
            })
            .collect()
    }

    /// Backedge counter bump, then the poll
    fn emit_safepoint(&mut self, n: NodeId) -> Result<()> {
        let counter = self.graph.backedge_counter;
        if self.options.count_backedges && counter != 0 {
            self.increment_counter(counter, self.options.backedge_step)?;
        }
        self.emit(LirOp::new(LirOpcode::Safepoint).info(self.state_for(n, true)));
        Ok(())
    }

    pub(super) fn do_if(&mut self, n: NodeId) -> Result<()> {
        let graph = self.graph;
        let Op::If {
            cond,
            x,
            y,
            safepoint,
            ..
        } = graph.node(n).op
        else {
            return Err(CodegenError::Internal(format!("{} is not a conditional branch", n)));
        };
        let succs = self.successor_blocks()?;
        let &[taken, not_taken] = succs.as_slice() else {
            return Err(CodegenError::Internal(format!("{} needs two successors", n)));
        };

        let ty = self.node_type(x).stack_type();
        let isa = self.isa;
        let left = self.load_item(x)?;
        let right = if ty.is_float() {
            self.load_item(y)?
        } else {
            self.load_nonconstant(y, |c| isa.can_inline_cmp(c))?
        };
        if safepoint {
            self.emit_safepoint(n)?;
        }

        if ty.is_float() && !self.target.hardware_float {
            let entry = if ty == BasicType::Float {
                RuntimeEntry::FcmpCond(cond)
            } else {
                RuntimeEntry::DcmpCond(cond)
            };
            let truth = self.call_runtime(vec![left, right], entry, BasicType::Int, None);
            self.cmp(truth, Operand::int(1));
            self.branch(Condition::Equal, BranchTarget::Block(taken));
        } else if ty.is_float() {
            // NaN operands satisfy only !=
            let unordered = if cond == Condition::NotEqual { taken } else { not_taken };
            self.cmp(left, right);
            self.emit(LirOp::new(LirOpcode::Branch {
                cond,
                target: BranchTarget::Block(taken),
                unordered: Some(BranchTarget::Block(unordered)),
            }));
        } else if ty == BasicType::Long && !self.target.direct_long_compare {
            if matches!(
                cond,
                Condition::Below | Condition::BelowEqual | Condition::Above | Condition::AboveEqual
            ) {
                return Err(CodegenError::Unsupported(format!(
                    "unsigned long compare on {}",
                    self.target.family
                )));
            }
            let order = self.new_register(BasicType::Int);
            let rhs = match right {
                Operand::Const(c) => self.load_constant(c),
                other => other,
            };
            self.emit(
                LirOp::new(LirOpcode::Cmp3Long)
                    .result(order.clone())
                    .inputs(vec![left, rhs]),
            );
            self.cmp(order, Operand::int(0));
            self.branch(cond, BranchTarget::Block(taken));
        } else {
            self.cmp(left, right);
            self.branch(cond, BranchTarget::Block(taken));
        }
        self.emit(LirOp::new(LirOpcode::Jump(BranchTarget::Block(not_taken))));
        Ok(())
    }

    pub(super) fn do_goto(&mut self, n: NodeId, safepoint: bool) -> Result<()> {
        let succs = self.successor_blocks()?;
        let &[succ] = succs.as_slice() else {
            return Err(CodegenError::Internal(format!("{} needs one successor", n)));
        };
        if safepoint {
            self.emit_safepoint(n)?;
        }
        self.move_to_phis(succ)?;
        self.emit(LirOp::new(LirOpcode::Jump(BranchTarget::Block(succ))));
        Ok(())
    }

    /// Compare chain over the keys, then the default
    pub(super) fn do_switch(&mut self, value: NodeId, keys: &[i32]) -> Result<()> {
        let succs = self.successor_blocks()?;
        if succs.len() != keys.len() + 1 {
            return Err(CodegenError::MalformedGraph(format!(
                "switch on {} has {} keys but {} targets",
                value,
                keys.len(),
                succs.len()
            )));
        }
        let v = self.load_item(value)?;
        for (&key, &succ) in keys.iter().zip(&succs) {
            let k = Constant::Int(key);
            let rhs = if self.isa.can_inline_cmp(&k) {
                Operand::Const(k)
            } else {
                self.load_constant(k)
            };
            self.cmp(v.clone(), rhs);
            self.branch(Condition::Equal, BranchTarget::Block(succ));
        }
        let default = succs[keys.len()];
        self.emit(LirOp::new(LirOpcode::Jump(BranchTarget::Block(default))));
        Ok(())
    }

    pub(super) fn do_return(&mut self, value: Option<NodeId>) -> Result<()> {
        let Some(v) = value else {
            self.emit(LirOp::new(LirOpcode::Return));
            return Ok(());
        };
        let ty = self.node_type(v);
        let result = self.load_item(v)?;
        let location = self.isa.result_location(ty, self.target);
        self.emit(
            LirOp::new(LirOpcode::Move)
                .result(location.clone())
                .inputs(vec![result]),
        );
        self.emit(LirOp::new(LirOpcode::Return).inputs(vec![location]));
        Ok(())
    }

    pub(super) fn do_throw(&mut self, n: NodeId, exception: NodeId) -> Result<()> {
        let ex = self.load_item(exception)?;
        let location = Operand::fixed(PReg::R(0), BasicType::Object);
        self.emit(LirOp::new(LirOpcode::Move).result(location.clone()).inputs(vec![ex]));
        self.emit(
            LirOp::new(LirOpcode::Throw)
                .inputs(vec![location])
                .info(self.state_for(n, false)),
        );
        Ok(())
    }

    /// Only the real target is kept; layout turns this into a jump
    pub(super) fn do_never_branch(&mut self) -> Result<()> {
        let succs = self.successor_blocks()?;
        let target = *succs
            .first()
            .ok_or_else(|| CodegenError::Internal("never-branch without a target".into()))?;
        self.move_to_phis(target)?;
        self.emit(LirOp::new(LirOpcode::NeverBranch(target)));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cfg::test_graphs;
    use crate::config::CompileOptions;
    use crate::ir::{Graph, GraphBuilder};
    use crate::lir::StubKind;
    use crate::lirgen::{harness, LirOutput};
    use crate::target::TargetDescriptor;

    fn generate(g: Graph, target: &TargetDescriptor, options: &CompileOptions) -> (crate::cfg::Cfg, LirOutput) {
        let cfg = harness::analyze(&g);
        let ctx = harness::context(g, target, options);
        let out = LirGenerator::new(&ctx, &cfg).generate().unwrap();
        (cfg, out)
    }

    fn compare_and_branch(ty: BasicType, cond: Condition) -> Graph {
        let mut b = GraphBuilder::new("branch");
        let entry = b.start();
        let x = b.param(0, ty);
        let y = b.param(1, ty);
        let t = b.region();
        let f = b.region();
        b.branch(entry, cond, x, y, t, f, 0.5);
        let one = b.int(1);
        let zero = b.int(0);
        b.ret(t, Some(one));
        b.ret(f, Some(zero));
        b.finish().unwrap()
    }

    fn entry_ops(ty: BasicType, cond: Condition, target: &TargetDescriptor) -> Vec<LirOp> {
        let (cfg, out) = generate(compare_and_branch(ty, cond), target, &CompileOptions::default());
        out.blocks[cfg.root.index()].ops.clone()
    }

    #[test]
    fn test_float_branch_routes_unordered() {
        let target = TargetDescriptor::aarch64();
        for (cond, to_taken) in [(Condition::Less, false), (Condition::NotEqual, true)] {
            let ops = entry_ops(BasicType::Double, cond, &target);
            let n = ops.len();
            let LirOpcode::Branch {
                target: BranchTarget::Block(taken),
                unordered: Some(BranchTarget::Block(unordered)),
                ..
            } = ops[n - 2].code
            else {
                panic!("expected a float branch, got {}", ops[n - 2]);
            };
            let LirOpcode::Jump(BranchTarget::Block(not_taken)) = ops[n - 1].code else {
                panic!("expected a jump");
            };
            assert_eq!(unordered == taken, to_taken);
            assert_eq!(unordered == not_taken, !to_taken);
        }
    }

    #[test]
    fn test_soft_float_branch_calls_runtime() {
        let ops = entry_ops(BasicType::Float, Condition::Less, &TargetDescriptor::arm32_soft_float());
        let call = ops
            .iter()
            .position(|o| o.code == LirOpcode::Call(RuntimeEntry::FcmpCond(Condition::Less)))
            .unwrap();
        let cmp = ops.iter().rposition(|o| o.code == LirOpcode::Cmp).unwrap();
        assert!(call < cmp);
        assert_eq!(ops[cmp].inputs[1], Operand::int(1));
    }

    #[test]
    fn test_arm32_long_branch_uses_three_way_compare() {
        let ops = entry_ops(BasicType::Long, Condition::Greater, &TargetDescriptor::arm32());
        assert!(ops.iter().any(|o| o.code == LirOpcode::Cmp3Long));
        let direct = entry_ops(BasicType::Long, Condition::Greater, &TargetDescriptor::aarch64());
        assert!(!direct.iter().any(|o| o.code == LirOpcode::Cmp3Long));
    }

    #[test]
    fn test_backedge_counts_then_polls() {
        let mut g = test_graphs::counted_loop();
        g.backedge_counter = 0x5000;
        let (cfg, out) = generate(g, &TargetDescriptor::aarch64(), &CompileOptions::default());
        let body = cfg
            .ids()
            .find(|b| out.blocks[b.index()].ops.iter().any(|o| o.code == LirOpcode::Safepoint))
            .unwrap();
        let ops = &out.blocks[body.index()].ops;
        let counter = ops
            .iter()
            .position(|o| o.inputs == vec![Operand::Const(Constant::Pointer(0x5000))])
            .unwrap();
        let poll = ops.iter().position(|o| o.code == LirOpcode::Safepoint).unwrap();
        assert!(counter < poll);
        assert!(ops.last().map_or(false, |o| o.is_jump()));
        assert!(ops[poll].info.map_or(false, |i| i.state_before));

        let quiet = CompileOptions {
            count_backedges: false,
            ..CompileOptions::default()
        };
        let mut g = test_graphs::counted_loop();
        g.backedge_counter = 0x5000;
        let (_, out) = generate(g, &TargetDescriptor::aarch64(), &quiet);
        assert!(!out
            .blocks
            .iter()
            .flat_map(|b| &b.ops)
            .any(|o| o.inputs == vec![Operand::Const(Constant::Pointer(0x5000))]));
    }

    #[test]
    fn test_switch_is_compare_chain() {
        let mut b = GraphBuilder::new("switch");
        let entry = b.start();
        let x = b.param(0, BasicType::Int);
        let cases: Vec<NodeId> = (0..4).map(|_| b.region()).collect();
        b.switch(entry, x, vec![1, 5, 0x12345], cases.clone());
        for (i, &c) in cases.iter().enumerate() {
            let v = b.int(i as i32);
            b.ret(c, Some(v));
        }
        let g = b.finish().unwrap();
        let (cfg, out) = generate(g, &TargetDescriptor::arm32(), &CompileOptions::default());
        let ops = &out.blocks[cfg.root.index()].ops;
        let branches: Vec<BlockId> = ops
            .iter()
            .filter_map(|o| match o.code {
                LirOpcode::Branch {
                    cond: Condition::Equal,
                    target: BranchTarget::Block(t),
                    ..
                } => Some(t),
                _ => None,
            })
            .collect();
        let expected: Vec<BlockId> = cases.iter().map(|c| cfg.block_of(*c).unwrap()).collect();
        assert_eq!(branches, expected[..3].to_vec());
        assert_eq!(
            ops.last().map(|o| o.code.clone()),
            Some(LirOpcode::Jump(BranchTarget::Block(expected[3])))
        );
        // 0x12345 is not a rotated immediate and goes through a register
        assert!(ops.iter().filter(|o| o.code == LirOpcode::Cmp).all(|o| match &o.inputs[1] {
            Operand::Const(Constant::Int(k)) => *k != 0x12345,
            _ => true,
        }));
        assert!(out.stubs.iter().all(|s| s.kind != StubKind::NullCheck));
    }

    #[test]
    fn test_throw_passes_exception_in_first_register() {
        let mut b = GraphBuilder::new("throw");
        let entry = b.start();
        let ex = b.param(0, BasicType::Object);
        b.throw(entry, ex);
        let g = b.finish().unwrap();
        let (cfg, out) = generate(g, &TargetDescriptor::aarch64(), &CompileOptions::default());
        let ops = &out.blocks[cfg.root.index()].ops;
        let throw = ops.last().unwrap();
        assert_eq!(throw.code, LirOpcode::Throw);
        assert_eq!(throw.inputs, vec![Operand::fixed(PReg::R(0), BasicType::Object)]);
        assert!(throw.info.is_some());
    }
}
