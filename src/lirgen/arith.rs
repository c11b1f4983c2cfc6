//! Arithmetic, shifts, logic, compares and conversions

use super::{imm, imm_const, LirGenerator};
use crate::encoding::exact_log2;
use crate::error::Result;
use crate::ir::{ArithOp, CompareOp, Condition, ConvertOp, LogicOp, NodeId, ShiftOp};
use crate::lir::{BranchTarget, LirOp, LirOpcode, RuntimeEntry, StubKind};
use crate::operand::{BasicType, Constant, Operand, Reg};
use crate::target::TargetFamily;

/// How a multiply by a constant is strength reduced
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum MulByConst {
    /// `x << k`
    Shift(u8),
    /// `(x << k) + x`
    ShiftAdd(u8),
    /// `(x << k) - x`
    ShiftSub(u8),
}

fn mul_by_const(c: i64) -> Option<MulByConst> {
    if c <= 0 {
        return None;
    }
    if let Some(k) = exact_log2(c) {
        return Some(MulByConst::Shift(k));
    }
    if let Some(k) = exact_log2(c - 1) {
        return Some(MulByConst::ShiftAdd(k));
    }
    exact_log2(c + 1).map(MulByConst::ShiftSub)
}

fn arith_opcode(op: ArithOp) -> LirOpcode {
    match op {
        ArithOp::Add => LirOpcode::Add,
        ArithOp::Sub => LirOpcode::Sub,
        ArithOp::Mul => LirOpcode::Mul,
        ArithOp::Div => LirOpcode::Div,
        ArithOp::Rem => LirOpcode::Rem,
    }
}

fn soft_float_entry(op: ArithOp, ty: BasicType) -> RuntimeEntry {
    let double = ty == BasicType::Double;
    match (op, double) {
        (ArithOp::Add, false) => RuntimeEntry::Fadd,
        (ArithOp::Sub, false) => RuntimeEntry::Fsub,
        (ArithOp::Mul, false) => RuntimeEntry::Fmul,
        (ArithOp::Div, false) => RuntimeEntry::Fdiv,
        (ArithOp::Rem, false) => RuntimeEntry::Frem,
        (ArithOp::Add, true) => RuntimeEntry::Dadd,
        (ArithOp::Sub, true) => RuntimeEntry::Dsub,
        (ArithOp::Mul, true) => RuntimeEntry::Dmul,
        (ArithOp::Div, true) => RuntimeEntry::Ddiv,
        (ArithOp::Rem, true) => RuntimeEntry::Drem,
    }
}

fn reg_of(op: &Operand) -> Option<Reg> {
    op.as_reg()
}

impl<'a> LirGenerator<'a> {
    pub(super) fn do_arith(&mut self, n: NodeId, op: ArithOp, x: NodeId, y: NodeId) -> Result<()> {
        let ty = self.node_type(n);
        // keep the constant on the right where it can become an immediate
        let (x, y) = if op.is_commutative() && self.is_constant(x) && !self.is_constant(y) {
            (y, x)
        } else {
            (x, y)
        };
        match ty {
            BasicType::Float | BasicType::Double => self.do_arith_fpu(n, op, x, y, ty),
            BasicType::Long => self.do_arith_long(n, op, x, y),
            _ => self.do_arith_int(n, op, x, y, ty),
        }
    }

    fn is_constant(&self, n: NodeId) -> bool {
        matches!(self.graph.node(n).op, crate::ir::Op::Const(_))
    }

    fn constant_of(&self, n: NodeId) -> Option<Constant> {
        match self.graph.node(n).op {
            crate::ir::Op::Const(c) => Some(c),
            _ => None,
        }
    }

    fn do_arith_int(&mut self, n: NodeId, op: ArithOp, x: NodeId, y: NodeId, ty: BasicType) -> Result<()> {
        match op {
            ArithOp::Div | ArithOp::Rem => self.do_divide(n, op, x, y, ty),
            ArithOp::Mul => {
                let left = self.load_item(x)?;
                let c = self.constant_of(y).and_then(|c| c.as_i64());
                match c.and_then(mul_by_const) {
                    Some(plan) => {
                        let result = self.rlock_result(n);
                        self.emit_mul_by_const(result, left, plan, ty)
                    }
                    None => {
                        let right = self.load_item(y)?;
                        let result = self.rlock_result(n);
                        self.emit(
                            LirOp::new(LirOpcode::Mul)
                                .result(result)
                                .inputs(vec![left, right]),
                        );
                        Ok(())
                    }
                }
            }
            ArithOp::Add | ArithOp::Sub => {
                let left = self.load_item(x)?;
                let isa = self.isa;
                let right = match self.constant_of(y) {
                    Some(c) if isa.can_inline_arith(&c) => Operand::Const(c),
                    Some(c) => {
                        let value = c.as_i64().unwrap_or(0);
                        let value = if op == ArithOp::Sub { value.wrapping_neg() } else { value };
                        if let Some(pieces) = isa.split_add_constant(value, ty) {
                            let result = self.rlock_result(n);
                            self.add_pieces(result, left, &pieces, ty);
                            return Ok(());
                        }
                        self.load_constant(c)
                    }
                    None => self.load_item(y)?,
                };
                let result = self.rlock_result(n);
                self.emit(
                    LirOp::new(arith_opcode(op))
                        .result(result)
                        .inputs(vec![left, right]),
                );
                Ok(())
            }
        }
    }

    fn emit_mul_by_const(
        &mut self,
        result: Operand,
        x: Operand,
        plan: MulByConst,
        ty: BasicType,
    ) -> Result<()> {
        let reg = reg_of(&x).ok_or_else(|| {
            crate::error::CodegenError::Internal(format!("multiply operand {} is not a register", x))
        })?;
        match plan {
            MulByConst::Shift(k) => {
                self.emit(
                    LirOp::new(LirOpcode::Shl)
                        .result(result)
                        .inputs(vec![x, Operand::int(k as i32)]),
                );
            }
            MulByConst::ShiftAdd(k) => {
                self.emit(
                    LirOp::new(LirOpcode::Add)
                        .result(result)
                        .inputs(vec![x, Operand::Shifted(reg, k as i8)]),
                );
            }
            MulByConst::ShiftSub(k) if self.target.family == TargetFamily::Aarch64 => {
                let tmp = self.new_register(ty);
                self.emit(
                    LirOp::new(LirOpcode::Shl)
                        .result(tmp.clone())
                        .inputs(vec![x.clone(), Operand::int(k as i32)]),
                );
                self.emit(LirOp::new(LirOpcode::Sub).result(result).inputs(vec![tmp, x]));
            }
            MulByConst::ShiftSub(k) => {
                // rsb: shifted operand minus x
                self.emit(
                    LirOp::new(LirOpcode::Sub)
                        .result(result)
                        .inputs(vec![Operand::Shifted(reg, k as i8), x]),
                );
            }
        }
        Ok(())
    }

    /// Integer or long divide/remainder with its zero check
    fn do_divide(&mut self, n: NodeId, op: ArithOp, x: NodeId, y: NodeId, ty: BasicType) -> Result<()> {
        let left = self.load_item(x)?;
        let info = self.state_for(n, true);
        let divisor = self.constant_of(y).and_then(|c| c.as_i64());
        if let Some(k) = divisor.filter(|c| *c > 0).and_then(exact_log2) {
            // non-zero constant divisor: no check needed
            let tmp = self.new_register(ty);
            let result = self.rlock_result(n);
            self.emit(
                LirOp::new(arith_opcode(op))
                    .result(result)
                    .inputs(vec![left, imm(1i64 << k, ty)])
                    .temps(vec![tmp]),
            );
            return Ok(());
        }

        let right = self.load_item(y)?;
        self.zero_check(&right, ty, info);
        let hardware = match ty {
            BasicType::Long => self.target.hardware_long_arith,
            _ => self.target.hardware_int_divide,
        };
        if !hardware {
            let entry = match (op, ty) {
                (ArithOp::Div, BasicType::Long) => RuntimeEntry::Ldiv,
                (_, BasicType::Long) => RuntimeEntry::Lrem,
                (ArithOp::Div, _) => RuntimeEntry::Idiv,
                _ => RuntimeEntry::Irem,
            };
            let r = self.call_runtime(vec![left, right], entry, ty, info);
            self.set_result(n, r);
            return Ok(());
        }
        let result = self.rlock_result(n);
        let mut lir = LirOp::new(arith_opcode(op))
            .result(result)
            .inputs(vec![left, right])
            .info(info);
        if op == ArithOp::Rem {
            // divide, then multiply-subtract through a temp
            lir = lir.temps(vec![self.new_register(ty)]);
        }
        self.emit(lir);
        Ok(())
    }

    /// `cmp divisor, 0` and branch to a divide-by-zero stub
    fn zero_check(&mut self, divisor: &Operand, ty: BasicType, info: Option<crate::lir::CodeEmitInfo>) {
        let stub = self.add_stub(StubKind::DivByZero, info);
        self.cmp(divisor.clone(), imm(0, ty));
        self.branch(Condition::Equal, BranchTarget::Stub(stub));
    }

    fn do_arith_long(&mut self, n: NodeId, op: ArithOp, x: NodeId, y: NodeId) -> Result<()> {
        let ty = BasicType::Long;
        match op {
            ArithOp::Div | ArithOp::Rem => self.do_divide(n, op, x, y, ty),
            ArithOp::Mul if !self.target.hardware_long_arith => {
                let left = self.load_item(x)?;
                let right = self.load_item(y)?;
                let r = self.call_runtime(vec![left, right], RuntimeEntry::Lmul, ty, None);
                self.set_result(n, r);
                Ok(())
            }
            ArithOp::Mul => {
                let left = self.load_item(x)?;
                let shift = self
                    .constant_of(y)
                    .and_then(|c| c.as_i64())
                    .filter(|c| *c > 0)
                    .and_then(exact_log2);
                if let Some(k) = shift {
                    let result = self.rlock_result(n);
                    return self.emit_mul_by_const(result, left, MulByConst::Shift(k), ty);
                }
                let right = self.load_item(y)?;
                let result = self.rlock_result(n);
                self.emit(LirOp::new(LirOpcode::Mul).result(result).inputs(vec![left, right]));
                Ok(())
            }
            ArithOp::Add | ArithOp::Sub => {
                let left = self.load_item(x)?;
                let isa = self.isa;
                let right = if self.target.family == TargetFamily::Aarch64 {
                    match self.constant_of(y) {
                        Some(c) if isa.can_inline_arith(&c) => Operand::Const(c),
                        Some(c) => {
                            let value = c.as_i64().unwrap_or(0);
                            let value = if op == ArithOp::Sub { value.wrapping_neg() } else { value };
                            if let Some(pieces) = isa.split_add_constant(value, ty) {
                                let result = self.rlock_result(n);
                                self.add_pieces(result, left, &pieces, ty);
                                return Ok(());
                            }
                            self.load_constant(c)
                        }
                        None => self.load_item(y)?,
                    }
                } else {
                    // register pairs on 32-bit targets
                    self.load_item(y)?
                };
                let result = self.rlock_result(n);
                self.emit(
                    LirOp::new(arith_opcode(op))
                        .result(result)
                        .inputs(vec![left, right]),
                );
                Ok(())
            }
        }
    }

    fn do_arith_fpu(&mut self, n: NodeId, op: ArithOp, x: NodeId, y: NodeId, ty: BasicType) -> Result<()> {
        let left = self.load_item(x)?;
        let right = self.load_item(y)?;
        if !self.target.hardware_float || op == ArithOp::Rem {
            let r = self.call_runtime(vec![left, right], soft_float_entry(op, ty), ty, None);
            self.set_result(n, r);
            return Ok(());
        }
        let result = self.rlock_result(n);
        self.emit(
            LirOp::new(arith_opcode(op))
                .result(result)
                .inputs(vec![left, right]),
        );
        Ok(())
    }

    /// `result = x + value`, using encodable immediates where possible
    pub(super) fn add_constant(&mut self, result: Operand, x: Operand, value: i64, ty: BasicType) {
        match self.isa.split_add_constant(value, ty) {
            Some(pieces) => self.add_pieces(result, x, &pieces, ty),
            None => {
                let reg = self.load_constant(imm_const(value, ty));
                self.emit(LirOp::new(LirOpcode::Add).result(result).inputs(vec![x, reg]));
            }
        }
    }

    fn add_pieces(&mut self, result: Operand, x: Operand, pieces: &[i64], ty: BasicType) {
        if pieces.is_empty() {
            self.emit(LirOp::new(LirOpcode::Move).result(result).inputs(vec![x]));
            return;
        }
        let mut acc = x;
        for (i, &piece) in pieces.iter().enumerate() {
            let dest = if i + 1 == pieces.len() {
                result.clone()
            } else {
                self.new_register(ty)
            };
            let (code, amount) = if piece < 0 {
                (LirOpcode::Sub, piece.wrapping_neg())
            } else {
                (LirOpcode::Add, piece)
            };
            self.emit(
                LirOp::new(code)
                    .result(dest.clone())
                    .inputs(vec![acc, imm(amount, ty)]),
            );
            acc = dest;
        }
    }

    pub(super) fn do_shift(&mut self, n: NodeId, op: ShiftOp, value: NodeId, count: NodeId) -> Result<()> {
        let ty = self.node_type(n);
        let left = self.load_item(value)?;
        let mask = if ty == BasicType::Long { 63 } else { 31 };
        let right = match self.constant_of(count).and_then(|c| c.as_i64()) {
            Some(c) => Operand::int((c & mask) as i32),
            None => self.load_item(count)?,
        };
        let code = match op {
            ShiftOp::Shl => LirOpcode::Shl,
            ShiftOp::Shr => LirOpcode::Shr,
            ShiftOp::Ushr => LirOpcode::Ushr,
        };
        let result = self.rlock_result(n);
        self.emit(LirOp::new(code).result(result).inputs(vec![left, right]));
        Ok(())
    }

    pub(super) fn do_logic(&mut self, n: NodeId, op: LogicOp, x: NodeId, y: NodeId) -> Result<()> {
        let (x, y) = if self.is_constant(x) && !self.is_constant(y) {
            (y, x)
        } else {
            (x, y)
        };
        let left = self.load_item(x)?;
        let isa = self.isa;
        let right = self.load_nonconstant(y, |c| isa.can_inline_logic(c))?;
        let code = match op {
            LogicOp::And => LirOpcode::And,
            LogicOp::Or => LirOpcode::Or,
            LogicOp::Xor => LirOpcode::Xor,
        };
        let result = self.rlock_result(n);
        self.emit(LirOp::new(code).result(result).inputs(vec![left, right]));
        Ok(())
    }

    /// Three-way compare producing -1, 0 or 1
    pub(super) fn do_compare(&mut self, n: NodeId, op: CompareOp, x: NodeId, y: NodeId) -> Result<()> {
        let left = self.load_item(x)?;
        let right = self.load_item(y)?;
        let unordered_less = op.unordered_is_less();
        let code = match op {
            CompareOp::LongCmp => LirOpcode::Cmp3Long,
            _ if !self.target.hardware_float => {
                let entry = if op.operand_type() == BasicType::Double {
                    RuntimeEntry::Dcmp { unordered_less }
                } else {
                    RuntimeEntry::Fcmp { unordered_less }
                };
                let r = self.call_runtime(vec![left, right], entry, BasicType::Int, None);
                self.set_result(n, r);
                return Ok(());
            }
            _ => LirOpcode::Cmp3Float { unordered_less },
        };
        let result = self.rlock_result(n);
        self.emit(LirOp::new(code).result(result).inputs(vec![left, right]));
        Ok(())
    }

    pub(super) fn do_negate(&mut self, n: NodeId, value: NodeId) -> Result<()> {
        let ty = self.node_type(n);
        let v = self.load_item(value)?;
        if ty.is_float() && !self.target.hardware_float {
            let entry = if ty == BasicType::Double {
                RuntimeEntry::Dneg
            } else {
                RuntimeEntry::Fneg
            };
            let r = self.call_runtime(vec![v], entry, ty, None);
            self.set_result(n, r);
            return Ok(());
        }
        let result = self.rlock_result(n);
        self.emit(LirOp::new(LirOpcode::Neg).result(result).inputs(vec![v]));
        Ok(())
    }

    pub(super) fn do_convert(&mut self, n: NodeId, op: ConvertOp, value: NodeId) -> Result<()> {
        let v = self.load_item(value)?;
        let long_float = matches!(op, ConvertOp::L2F | ConvertOp::L2D | ConvertOp::F2L | ConvertOp::D2L);
        let needs_call = (op.involves_float() && !self.target.hardware_float)
            || (long_float && !self.target.hardware_long_arith);
        if needs_call {
            let r = self.call_runtime(vec![v], RuntimeEntry::Convert(op), op.result_type(), None);
            self.set_result(n, r);
            return Ok(());
        }
        let result = self.rlock_result(n);
        self.emit(LirOp::new(LirOpcode::Convert(op)).result(result).inputs(vec![v]));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CompileOptions;
    use crate::ir::{Graph, GraphBuilder};
    use crate::lir::eval::Machine;
    use crate::lirgen::{harness, LirGenerator};
    use crate::operand::PReg;
    use crate::target::TargetDescriptor;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    /// `f(x) = x op c`
    fn binary_with_const(op: ArithOp, ty: BasicType, c: Constant) -> Graph {
        let mut b = GraphBuilder::new("f");
        let entry = b.start();
        let x = b.param(0, ty);
        let k = b.constant(c);
        let r = b.arith(entry, op, ty, x, k);
        b.ret(entry, Some(r));
        b.finish().unwrap()
    }

    fn lower(g: Graph, target: &TargetDescriptor) -> Vec<LirOp> {
        let cfg = harness::analyze(&g);
        let options = CompileOptions::default();
        let ctx = harness::context(g, target, &options);
        let out = LirGenerator::new(&ctx, &cfg).generate().unwrap();
        out.blocks[cfg.root.index()].ops.clone()
    }

    /// Run straight-line integer LIR with `x` in the first argument register
    fn run(ops: &[LirOp], x: i64) -> i64 {
        let mut m = Machine::default();
        m.set(&Operand::fixed(PReg::R(0), BasicType::Int), x);
        m.run(ops);
        m.reg(Reg::Fixed(PReg::R(0)))
    }

    #[test]
    fn test_mul_plan() {
        assert_eq!(mul_by_const(8), Some(MulByConst::Shift(3)));
        assert_eq!(mul_by_const(9), Some(MulByConst::ShiftAdd(3)));
        assert_eq!(mul_by_const(7), Some(MulByConst::ShiftSub(3)));
        assert_eq!(mul_by_const(3), Some(MulByConst::ShiftAdd(1)));
        assert_eq!(mul_by_const(10), None);
        assert_eq!(mul_by_const(-8), None);
        assert_eq!(mul_by_const(i32::MAX as i64), Some(MulByConst::ShiftSub(31)));
    }

    #[test]
    fn test_mul_by_seven_is_shift_sub() {
        for target in [TargetDescriptor::aarch64(), TargetDescriptor::arm32()] {
            let ops = lower(binary_with_const(ArithOp::Mul, BasicType::Int, Constant::Int(7)), &target);
            assert!(!ops.iter().any(|o| o.code == LirOpcode::Mul));
            assert!(ops.iter().any(|o| o.code == LirOpcode::Sub));
        }
    }

    #[test]
    fn test_strength_reduction_matches_multiply() {
        let mut rng = StdRng::seed_from_u64(7);
        let mut samples = vec![0i64, 1, -1, i32::MAX as i64, i32::MIN as i64, 0x4000_0000];
        samples.extend((0..50).map(|_| rng.gen_range(i32::MIN..=i32::MAX) as i64));
        let constants = [1, 2, 3, 5, 7, 9, 15, 17, 31, 33, 1023, 1025, i32::MAX, 0x4000_0001];
        for target in [TargetDescriptor::aarch64(), TargetDescriptor::arm32()] {
            for &c in &constants {
                let ops = lower(binary_with_const(ArithOp::Mul, BasicType::Int, Constant::Int(c)), &target);
                assert!(!ops.iter().any(|o| o.code == LirOpcode::Mul), "c = {}", c);
                for &x in &samples {
                    let expected = (x as i32).wrapping_mul(c) as i64;
                    assert_eq!(run(&ops, x), expected, "{} * {} on {}", x, c, target.family);
                }
            }
        }
    }

    #[test]
    fn test_general_mul_keeps_multiply() {
        let ops = lower(
            binary_with_const(ArithOp::Mul, BasicType::Int, Constant::Int(10)),
            &TargetDescriptor::aarch64(),
        );
        assert!(ops.iter().any(|o| o.code == LirOpcode::Mul));
    }

    #[test]
    fn test_add_large_constant() {
        for target in [TargetDescriptor::aarch64(), TargetDescriptor::arm32()] {
            for c in [0x12345, -0x12345, 0x7f_ff00, 0x1234_5678, i32::MIN] {
                for op in [ArithOp::Add, ArithOp::Sub] {
                    let ops = lower(binary_with_const(op, BasicType::Int, Constant::Int(c)), &target);
                    for x in [0i64, 5, -77, i32::MAX as i64] {
                        let expected = match op {
                            ArithOp::Add => (x as i32).wrapping_add(c),
                            _ => (x as i32).wrapping_sub(c),
                        };
                        assert_eq!(run(&ops, x), expected as i64, "{} {:?} {}", x, op, c);
                    }
                }
            }
        }
    }

    #[test]
    fn test_pow2_divide_has_no_zero_check() {
        let ops = lower(
            binary_with_const(ArithOp::Div, BasicType::Int, Constant::Int(8)),
            &TargetDescriptor::aarch64(),
        );
        assert!(ops.iter().any(|o| o.code == LirOpcode::Div));
        assert!(!ops.iter().any(|o| matches!(o.code, LirOpcode::Branch { .. })));
    }

    #[test]
    fn test_constant_divisor_still_checked() {
        let ops = lower(
            binary_with_const(ArithOp::Rem, BasicType::Int, Constant::Int(10)),
            &TargetDescriptor::aarch64(),
        );
        let check = ops
            .iter()
            .position(|o| matches!(o.code, LirOpcode::Branch { target: BranchTarget::Stub(_), .. }))
            .unwrap();
        let rem = ops.iter().position(|o| o.code == LirOpcode::Rem).unwrap();
        assert!(check < rem);
        assert_eq!(ops[rem].temps.len(), 1);
    }

    #[test]
    fn test_arm32_divide_calls_runtime() {
        let mut b = GraphBuilder::new("f");
        let entry = b.start();
        let x = b.param(0, BasicType::Int);
        let y = b.param(1, BasicType::Int);
        let q = b.arith(entry, ArithOp::Div, BasicType::Int, x, y);
        b.ret(entry, Some(q));
        let ops = lower(b.finish().unwrap(), &TargetDescriptor::arm32());
        let check = ops.iter().position(|o| o.code == LirOpcode::Cmp).unwrap();
        let call = ops
            .iter()
            .position(|o| o.code == LirOpcode::Call(RuntimeEntry::Idiv))
            .unwrap();
        assert!(check < call);
        assert!(ops[call].info.map_or(false, |i| i.state_before));
    }

    #[test]
    fn test_soft_float_arith_and_conversions() {
        let target = TargetDescriptor::arm32_soft_float();
        let mut b = GraphBuilder::new("f");
        let entry = b.start();
        let x = b.param(0, BasicType::Float);
        let y = b.param(1, BasicType::Float);
        let sum = b.arith(entry, ArithOp::Add, BasicType::Float, x, y);
        let wide = b.convert(ConvertOp::F2D, sum);
        b.ret(entry, Some(wide));
        let ops = lower(b.finish().unwrap(), &target);
        assert!(ops.iter().any(|o| o.code == LirOpcode::Call(RuntimeEntry::Fadd)));
        assert!(ops
            .iter()
            .any(|o| o.code == LirOpcode::Call(RuntimeEntry::Convert(ConvertOp::F2D))));
        assert!(!ops.iter().any(|o| o.code == LirOpcode::Add));
    }

    #[test]
    fn test_long_to_float_is_a_call_on_arm32() {
        let mut b = GraphBuilder::new("f");
        let entry = b.start();
        let x = b.param(0, BasicType::Long);
        let f = b.convert(ConvertOp::L2F, x);
        b.ret(entry, Some(f));
        let g = b.finish().unwrap();
        let arm = lower(g.clone(), &TargetDescriptor::arm32());
        assert!(arm.iter().any(|o| o.code == LirOpcode::Call(RuntimeEntry::Convert(ConvertOp::L2F))));
        let a64 = lower(g, &TargetDescriptor::aarch64());
        assert!(a64.iter().any(|o| o.code == LirOpcode::Convert(ConvertOp::L2F)));
    }

    #[test]
    fn test_shift_count_masked() {
        let mut b = GraphBuilder::new("f");
        let entry = b.start();
        let x = b.param(0, BasicType::Int);
        let k = b.int(33);
        let s = b.shift(ShiftOp::Shl, BasicType::Int, x, k);
        b.ret(entry, Some(s));
        let ops = lower(b.finish().unwrap(), &TargetDescriptor::aarch64());
        let shl = ops.iter().find(|o| o.code == LirOpcode::Shl).unwrap();
        assert_eq!(shl.inputs[1], Operand::int(1));
        assert_eq!(run(&ops, 3), 6);
    }
}
