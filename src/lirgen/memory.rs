//! Memory access: address formation, array checks, GC barriers, unsafe access

use super::LirGenerator;
use crate::error::{CodegenError, Result};
use crate::ir::{Condition, NodeId, Op};
use crate::lir::{BranchTarget, CodeEmitInfo, LirOp, LirOpcode, MembarKind, StubKind};
use crate::operand::{Address, BasicType, Constant, Operand, PReg, Reg};
use crate::target::TargetFamily;

fn as_register(op: &Operand, what: &str) -> Result<Reg> {
    op.as_reg()
        .ok_or_else(|| CodegenError::Internal(format!("{} {} is not in a register", what, op)))
}

impl<'a> LirGenerator<'a> {
    /// Legal address for `base + (index << shift) + disp`
    ///
    /// Whatever the load/store cannot encode is folded into new pointer
    /// registers first.
    pub(super) fn generate_address(
        &mut self,
        base: &Operand,
        index: Option<Operand>,
        shift: u8,
        disp: i64,
        ty: BasicType,
    ) -> Result<Address> {
        let mut base_reg = as_register(base, "address base")?;
        let mut disp = disp;
        let mut index = index;
        if let Some(Operand::Const(c)) = &index {
            let v = c.as_i64().ok_or_else(|| {
                CodegenError::Internal(format!("non-integral array index {}", c))
            })?;
            disp = disp.wrapping_add(v.wrapping_shl(shift as u32));
            index = None;
        }

        let limits = self.isa.address_limits(ty, self.target.word_size);
        if let Some(idx) = index {
            let idx_reg = as_register(&idx, "address index")?;
            let embeddable = match self.target.family {
                // vldr/vstr have no register offset form
                TargetFamily::Arm32 => (shift == 0 && !ty.is_float()) || limits.embedded_shift,
                // the index scales by the access size or not at all
                TargetFamily::Aarch64 => shift == 0 || shift as u32 == limits.align,
            };
            if disp == 0 && embeddable {
                return Ok(Address::new(base_reg, Some(idx_reg), shift as i8, 0, ty));
            }
            let tmp = self.new_pointer_register();
            let scaled = if shift == 0 {
                idx
            } else {
                Operand::Shifted(idx_reg, shift as i8)
            };
            self.emit(
                LirOp::new(LirOpcode::Add)
                    .result(tmp.clone())
                    .inputs(vec![Operand::Reg(base_reg, BasicType::Address), scaled]),
            );
            base_reg = as_register(&tmp, "address temp")?;
        }

        if self.isa.disp_in_range(disp, &limits) {
            return Ok(Address::base_disp(base_reg, disp, ty));
        }
        let low = disp & (limits.max_disp - 1);
        let high = disp - low;
        let base = Operand::Reg(base_reg, BasicType::Address);
        let tmp = self.new_pointer_register();
        let tmp_reg = as_register(&tmp, "address temp")?;
        if self.isa.disp_in_range(low, &limits) {
            self.add_constant(tmp, base, high, BasicType::Address);
            Ok(Address::base_disp(tmp_reg, low, ty))
        } else {
            self.add_constant(tmp, base, disp, BasicType::Address);
            Ok(Address::base_disp(tmp_reg, 0, ty))
        }
    }

    /// Address of `array[index]`; with a card mark the address is kept in a
    /// register of its own since the barrier needs it again
    fn emit_array_address(
        &mut self,
        array: &Operand,
        base_override: Option<Operand>,
        index: Operand,
        elem: BasicType,
        needs_card_mark: bool,
    ) -> Result<Address> {
        let shift = elem.log2_size(self.target.word_size);
        let (base, disp) = match base_override {
            Some(b) => (b, 0),
            None => (array.clone(), self.target.array_base_offset(elem)),
        };
        let addr = self.generate_address(&base, Some(index), shift, disp, elem)?;
        if !needs_card_mark {
            return Ok(addr);
        }
        let tmp = self.new_pointer_register();
        let tmp_reg = as_register(&tmp, "card temp")?;
        self.emit(
            LirOp::new(LirOpcode::Lea)
                .result(tmp)
                .inputs(vec![Operand::addr(addr)]),
        );
        Ok(Address::base_disp(tmp_reg, 0, elem))
    }

    pub(super) fn null_check(&mut self, object: &Operand, info: Option<CodeEmitInfo>) {
        let stub = self.add_stub(StubKind::NullCheck, info);
        self.cmp(object.clone(), Operand::Const(Constant::Null));
        self.branch(Condition::Equal, BranchTarget::Stub(stub));
    }

    fn load_length(&mut self, array: &Operand, info: Option<CodeEmitInfo>) -> Result<Operand> {
        let addr = self.generate_address(array, None, 0, self.target.array_length_offset, BasicType::Int)?;
        let len = self.new_register(BasicType::Int);
        self.emit(
            LirOp::new(LirOpcode::Move)
                .result(len.clone())
                .inputs(vec![Operand::addr(addr)])
                .info(info),
        );
        Ok(len)
    }

    /// Bounds check, or just the null check when bounds checks are off
    fn array_checks(
        &mut self,
        array: &Operand,
        index: &Operand,
        length: Option<NodeId>,
        null_check: bool,
        info: Option<CodeEmitInfo>,
    ) -> Result<()> {
        if !self.options.range_checks {
            if null_check {
                self.null_check(array, info);
            }
            return Ok(());
        }
        let len = match length {
            Some(l) => self.load_item(l)?,
            None => {
                if null_check {
                    self.null_check(array, info);
                }
                self.load_length(array, info)?
            }
        };
        let stub = self.add_stub(StubKind::RangeCheck { index: index.clone() }, info);
        // unsigned, so a negative index fails too
        self.cmp(len, index.clone());
        self.branch(Condition::BelowEqual, BranchTarget::Stub(stub));
        Ok(())
    }

    pub(super) fn do_element_base(&mut self, n: NodeId, array: NodeId, elem: BasicType) -> Result<()> {
        let arr = self.load_item(array)?;
        let result = self.rlock_result(n);
        let offset = self.target.array_base_offset(elem);
        self.add_constant(result, arr, offset, BasicType::Address);
        Ok(())
    }

    pub(super) fn do_array_length(&mut self, n: NodeId, array: NodeId, null_check: bool) -> Result<()> {
        let arr = self.load_item(array)?;
        let info = self.state_for(n, false);
        if null_check {
            self.null_check(&arr, info);
        }
        let addr = self.generate_address(&arr, None, 0, self.target.array_length_offset, BasicType::Int)?;
        let result = self.rlock_result(n);
        self.emit(
            LirOp::new(LirOpcode::Move)
                .result(result)
                .inputs(vec![Operand::addr(addr)])
                .info(info),
        );
        Ok(())
    }

    pub(super) fn do_load_indexed(&mut self, n: NodeId) -> Result<()> {
        let graph = self.graph;
        let Op::LoadIndexed {
            array,
            index,
            length,
            base,
            elem,
            null_check,
            ..
        } = graph.node(n).op
        else {
            return Err(CodegenError::Internal(format!("{} is not an indexed load", n)));
        };
        let arr = self.load_item(array)?;
        let idx = self.load_nonconstant(index, |_| true)?;
        let base_override = base.map(|b| self.load_item(b)).transpose()?;
        let info = self.state_for(n, false);

        let addr = self.emit_array_address(&arr, base_override, idx.clone(), elem, false)?;
        self.array_checks(&arr, &idx, length, null_check, info)?;
        let result = self.rlock_result(n);
        self.emit(
            LirOp::new(LirOpcode::Move)
                .result(result)
                .inputs(vec![Operand::addr(addr)])
                .info(info),
        );
        Ok(())
    }

    /// Array store: address, bounds check, store check, barriers around the move
    pub(super) fn do_store_indexed(&mut self, n: NodeId) -> Result<()> {
        let graph = self.graph;
        let Op::StoreIndexed {
            array,
            index,
            value,
            length,
            base,
            elem,
            null_check,
            check_boolean,
            ..
        } = graph.node(n).op
        else {
            return Err(CodegenError::Internal(format!("{} is not an indexed store", n)));
        };
        let is_object = elem.is_object();
        let stores_null = matches!(graph.node(value).op, Op::Const(Constant::Null));
        let needs_store_check =
            is_object && self.options.store_checks && (!stores_null || self.options.profile_stores);
        let needs_card_mark = is_object && self.options.barrier.card_mark;

        let arr = self.load_item(array)?;
        let idx = self.load_nonconstant(index, |_| true)?;
        let isa = self.isa;
        let mut val = if needs_store_check || check_boolean {
            self.load_item(value)?
        } else {
            self.load_nonconstant(value, |c| isa.can_store_as_constant(c))?
        };
        let base_override = base.map(|b| self.load_item(b)).transpose()?;
        let info = self.state_for(n, false);

        // address first, so it can issue ahead of the checks
        let addr = self.emit_array_address(&arr, base_override, idx.clone(), elem, needs_card_mark)?;
        self.array_checks(&arr, &idx, length, null_check, info)?;

        if needs_store_check {
            let stub = self.add_stub(StubKind::ArrayStoreCheck, info);
            let temps = vec![
                self.new_register(BasicType::Object),
                self.new_register(BasicType::Object),
                self.new_register(BasicType::Object),
            ];
            self.emit(
                LirOp::new(LirOpcode::StoreCheck)
                    .inputs(vec![val.clone(), arr.clone()])
                    .temps(temps)
                    .info(info)
                    .stub(stub),
            );
        }

        if is_object {
            self.pre_barrier(&addr);
        }
        if check_boolean {
            let masked = self.new_register(BasicType::Int);
            self.emit(
                LirOp::new(LirOpcode::And)
                    .result(masked.clone())
                    .inputs(vec![val, Operand::int(1)]),
            );
            val = masked;
        }
        self.emit(
            LirOp::new(LirOpcode::Move)
                .result(Operand::addr(addr.clone()))
                .inputs(vec![val])
                .info(info),
        );
        if is_object {
            self.post_barrier(&addr)?;
        }
        Ok(())
    }

    fn move_code(&self, ty: BasicType, volatile: bool) -> LirOpcode {
        let wide = matches!(ty, BasicType::Long | BasicType::Double);
        if volatile && wide && self.target.word_size == 4 {
            LirOpcode::VolatileMove
        } else {
            LirOpcode::Move
        }
    }

    fn membar(&mut self, kind: MembarKind) {
        self.emit(LirOp::new(LirOpcode::Membar(kind)));
    }

    pub(super) fn do_load(&mut self, n: NodeId) -> Result<()> {
        let graph = self.graph;
        let node = graph.node(n);
        let Op::Load {
            base,
            offset,
            volatile,
            ..
        } = node.op
        else {
            return Err(CodegenError::Internal(format!("{} is not a load", n)));
        };
        let b = self.load_item(base)?;
        let addr = self.generate_address(&b, None, 0, offset, node.ty)?;
        let result = self.rlock_result(n);
        let code = self.move_code(node.ty, volatile);
        self.emit(
            LirOp::new(code)
                .result(result)
                .inputs(vec![Operand::addr(addr)])
                .info(self.state_for(n, false)),
        );
        if volatile {
            self.membar(MembarKind::Acquire);
        }
        Ok(())
    }

    pub(super) fn do_store(&mut self, n: NodeId) -> Result<()> {
        let graph = self.graph;
        let Op::Store {
            base,
            offset,
            value,
            ty,
            volatile,
            ..
        } = graph.node(n).op
        else {
            return Err(CodegenError::Internal(format!("{} is not a store", n)));
        };
        let b = self.load_item(base)?;
        let isa = self.isa;
        let v = self.load_nonconstant(value, |c| isa.can_store_as_constant(c))?;
        let addr = self.generate_address(&b, None, 0, offset, ty)?;
        if volatile {
            self.membar(MembarKind::Release);
        }
        if ty.is_object() {
            self.pre_barrier(&addr);
        }
        let code = self.move_code(ty, volatile);
        self.emit(
            LirOp::new(code)
                .result(Operand::addr(addr.clone()))
                .inputs(vec![v])
                .info(self.state_for(n, false)),
        );
        if volatile {
            self.membar(MembarKind::StoreLoad);
        }
        if ty.is_object() {
            self.post_barrier(&addr)?;
        }
        Ok(())
    }

    /// SATB pre-barrier: while marking is active, the stub records the old value
    pub(super) fn pre_barrier(&mut self, addr: &Address) {
        if !self.options.barrier.pre_barrier {
            return;
        }
        let flag_addr = Address::base_disp(
            Reg::Fixed(PReg::Thread),
            self.target.thread_satb_active_offset,
            BasicType::Byte,
        );
        let flag = self.new_register(BasicType::Int);
        self.emit(
            LirOp::new(LirOpcode::Move)
                .result(flag.clone())
                .inputs(vec![Operand::addr(flag_addr)]),
        );
        let stub = self.add_stub(
            StubKind::PreBarrier {
                addr: Operand::addr(addr.clone()),
            },
            None,
        );
        self.cmp(flag, Operand::int(0));
        self.branch(Condition::NotEqual, BranchTarget::Stub(stub));
    }

    /// Card mark for a reference store to `addr`
    pub(super) fn post_barrier(&mut self, addr: &Address) -> Result<()> {
        let options = self.options;
        let barrier = &options.barrier;
        if !barrier.card_mark {
            return Ok(());
        }
        let ptr = if addr.index.is_none() && addr.disp == 0 {
            addr.base
        } else {
            let p = self.new_pointer_register();
            self.emit(
                LirOp::new(LirOpcode::Lea)
                    .result(p.clone())
                    .inputs(vec![Operand::addr(addr.clone())]),
            );
            as_register(&p, "card pointer")?
        };

        let scratch_reg = Reg::Fixed(self.isa.card_scratch());
        let scratch = Operand::Reg(scratch_reg, BasicType::Address);
        let family = self.target.family;
        if family == TargetFamily::Arm32 && self.target.supports_movw {
            self.emit(
                LirOp::new(LirOpcode::Move)
                    .result(scratch.clone())
                    .inputs(vec![Operand::Const(Constant::Pointer(barrier.card_table_base))]),
            );
        } else {
            let slot = Address::base_disp(
                Reg::Fixed(PReg::Thread),
                self.target.thread_card_table_offset,
                BasicType::Address,
            );
            self.emit(
                LirOp::new(LirOpcode::Move)
                    .result(scratch.clone())
                    .inputs(vec![Operand::addr(slot)]),
            );
        }

        let shift = barrier.card_shift as i8;
        let card = if family == TargetFamily::Aarch64 {
            self.emit(
                LirOp::new(LirOpcode::Add)
                    .result(scratch.clone())
                    .inputs(vec![scratch.clone(), Operand::Shifted(ptr, -shift)]),
            );
            Address::base_disp(scratch_reg, 0, BasicType::Byte)
        } else {
            Address::new(scratch_reg, Some(ptr), -shift, 0, BasicType::Byte)
        };

        let dirty = barrier.dirty_card();
        if barrier.conditional_card_mark {
            if barrier.storeload_before_card_check {
                self.membar(MembarKind::StoreLoad);
            }
            let current = self.new_register(BasicType::Int);
            self.emit(
                LirOp::new(LirOpcode::Move)
                    .result(current.clone())
                    .inputs(vec![Operand::addr(card.clone())]),
            );
            let done = self.new_label();
            self.cmp(current, Operand::int(dirty as i32));
            self.branch(Condition::Equal, BranchTarget::Label(done));
            self.set_card(card, scratch);
            self.emit(LirOp::new(LirOpcode::Label(done)));
        } else {
            if barrier.storestore_before_card_mark {
                self.membar(MembarKind::StoreStore);
            }
            self.set_card(card, scratch);
        }
        Ok(())
    }

    fn set_card(&mut self, card: Address, scratch: Operand) {
        let options = self.options;
        let barrier = &options.barrier;
        let dirty = barrier.dirty_card();
        let value = if self.target.family == TargetFamily::Aarch64 && dirty == 0 {
            Operand::fixed(PReg::Zr, BasicType::Byte)
        } else if self.target.family == TargetFamily::Arm32 && barrier.card_table_base & 0xff == dirty {
            // the scratch still holds the table base, whose low byte is the dirty value
            scratch
        } else {
            let v = self.new_register(BasicType::Int);
            self.emit(
                LirOp::new(LirOpcode::Move)
                    .result(v.clone())
                    .inputs(vec![Operand::int(dirty as i32)]),
            );
            v
        };
        self.emit(
            LirOp::new(LirOpcode::Move)
                .result(Operand::addr(card))
                .inputs(vec![value]),
        );
    }

    /// Bump a profile counter cell in memory
    pub(super) fn increment_counter(&mut self, counter: i64, step: i32) -> Result<()> {
        let ptr = self.new_pointer_register();
        self.emit(
            LirOp::new(LirOpcode::Move)
                .result(ptr.clone())
                .inputs(vec![Operand::Const(Constant::Pointer(counter))]),
        );
        let cell = Address::base_disp(as_register(&ptr, "counter")?, 0, BasicType::Int);
        let old = self.new_register(BasicType::Int);
        let new = self.new_register(BasicType::Int);
        self.emit(
            LirOp::new(LirOpcode::Move)
                .result(old.clone())
                .inputs(vec![Operand::addr(cell.clone())]),
        );
        self.emit(
            LirOp::new(LirOpcode::Add)
                .result(new.clone())
                .inputs(vec![old, Operand::int(step)]),
        );
        self.emit(
            LirOp::new(LirOpcode::Move)
                .result(Operand::addr(cell))
                .inputs(vec![new]),
        );
        Ok(())
    }

    /// `object + offset` for the unsafe accessors
    fn unsafe_address(&mut self, object: &Operand, offset: NodeId, ty: BasicType) -> Result<Address> {
        if let Operand::Const(c) = self.value(offset)? {
            let disp = c.as_i64().ok_or_else(|| {
                CodegenError::Internal(format!("non-integral unsafe offset {}", c))
            })?;
            return self.generate_address(object, None, 0, disp, ty);
        }
        let off = self.load_item(offset)?;
        let obj_reg = as_register(object, "unsafe object")?;
        if self.target.family == TargetFamily::Aarch64 {
            let off_reg = as_register(&off, "unsafe offset")?;
            return Ok(Address::new(obj_reg, Some(off_reg), 0, 0, ty));
        }
        // a 64-bit offset cannot index on a 32-bit target
        let tmp = self.new_pointer_register();
        self.emit(
            LirOp::new(LirOpcode::Add)
                .result(tmp.clone())
                .inputs(vec![object.clone(), off]),
        );
        Ok(Address::base_disp(as_register(&tmp, "unsafe address")?, 0, ty))
    }

    pub(super) fn do_unsafe_get(&mut self, n: NodeId) -> Result<()> {
        let graph = self.graph;
        let node = graph.node(n);
        let Op::UnsafeGet {
            object,
            offset,
            volatile,
        } = node.op
        else {
            return Err(CodegenError::Internal(format!("{} is not an unsafe get", n)));
        };
        let obj = self.load_item(object)?;
        let addr = self.unsafe_address(&obj, offset, node.ty)?;
        let result = self.rlock_result(n);
        let code = self.move_code(node.ty, volatile);
        self.emit(LirOp::new(code).result(result).inputs(vec![Operand::addr(addr)]));
        if volatile {
            self.membar(MembarKind::Acquire);
        }
        Ok(())
    }

    pub(super) fn do_unsafe_put(&mut self, n: NodeId) -> Result<()> {
        let graph = self.graph;
        let Op::UnsafePut {
            object,
            offset,
            value,
            volatile,
            ..
        } = graph.node(n).op
        else {
            return Err(CodegenError::Internal(format!("{} is not an unsafe put", n)));
        };
        let ty = graph.node(value).ty;
        let obj = self.load_item(object)?;
        let addr = self.unsafe_address(&obj, offset, ty)?;
        let v = self.load_item(value)?;
        if volatile {
            self.membar(MembarKind::Release);
        }
        if ty.is_object() {
            self.pre_barrier(&addr);
        }
        let code = self.move_code(ty, volatile);
        self.emit(
            LirOp::new(code)
                .result(Operand::addr(addr.clone()))
                .inputs(vec![v]),
        );
        if volatile {
            self.membar(MembarKind::StoreLoad);
        }
        if ty.is_object() {
            self.post_barrier(&addr)?;
        }
        Ok(())
    }

    pub(super) fn do_unsafe_cas(&mut self, n: NodeId) -> Result<()> {
        let graph = self.graph;
        let Op::UnsafeCas {
            object,
            offset,
            expected,
            new_value,
            ..
        } = graph.node(n).op
        else {
            return Err(CodegenError::Internal(format!("{} is not a compare-and-swap", n)));
        };
        let ty = graph.node(new_value).ty;
        let obj = self.load_item(object)?;
        let addr = self.unsafe_address(&obj, offset, ty)?;
        let ptr = self.new_pointer_register();
        self.emit(
            LirOp::new(LirOpcode::Lea)
                .result(ptr.clone())
                .inputs(vec![Operand::addr(addr)]),
        );
        let cell = Address::base_disp(as_register(&ptr, "cas pointer")?, 0, ty);
        let cmp_value = self.load_item(expected)?;
        let new_val = self.load_item(new_value)?;
        let code = match ty {
            BasicType::Long => LirOpcode::CasLong,
            t if t.is_object() => LirOpcode::CasObj,
            _ => LirOpcode::CasInt,
        };
        if ty.is_object() {
            self.pre_barrier(&cell);
        }
        let result = self.rlock_result(n);
        let tmp = self.new_register(BasicType::Int);
        self.emit(
            LirOp::new(code)
                .result(result)
                .inputs(vec![ptr, cmp_value, new_val])
                .temps(vec![tmp]),
        );
        if ty.is_object() {
            self.post_barrier(&cell)?;
        }
        Ok(())
    }

    pub(super) fn do_unsafe_get_and_set(&mut self, n: NodeId) -> Result<()> {
        let graph = self.graph;
        let Op::UnsafeGetAndSet {
            object,
            offset,
            value,
            is_add,
            ..
        } = graph.node(n).op
        else {
            return Err(CodegenError::Internal(format!("{} is not an atomic update", n)));
        };
        let ty = graph.node(value).ty;
        let obj = self.load_item(object)?;
        let addr = self.unsafe_address(&obj, offset, ty)?;
        let v = self.load_item(value)?;
        let barriers = !is_add && ty.is_object();
        if barriers {
            self.pre_barrier(&addr);
        }
        let code = if is_add { LirOpcode::Xadd } else { LirOpcode::Xchg };
        let result = self.rlock_result(n);
        let tmp = self.new_register(BasicType::Int);
        self.emit(
            LirOp::new(code)
                .result(result)
                .inputs(vec![Operand::addr(addr.clone()), v])
                .temps(vec![tmp]),
        );
        if barriers {
            self.post_barrier(&addr)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{BarrierConfig, CompileOptions};
    use crate::ir::{AliasClass, GraphBuilder};
    use crate::lir::eval::Machine;
    use crate::lirgen::harness;
    use crate::operand::VReg;
    use crate::target::TargetDescriptor;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    const TYPES: [BasicType; 7] = [
        BasicType::Byte,
        BasicType::Short,
        BasicType::Int,
        BasicType::Long,
        BasicType::Float,
        BasicType::Double,
        BasicType::Object,
    ];

    #[test]
    fn test_generated_addresses_are_legal_and_exact() {
        let mut rng = StdRng::seed_from_u64(42);
        let fixed_disps = [
            0i64, 1, -1, 8, 255, 256, -256, -257, 1023, 1024, 4095, 4096, -4095, -4096, 32760,
            32768, 70_000, -70_000,
        ];
        for target in [TargetDescriptor::aarch64(), TargetDescriptor::arm32()] {
            let options = CompileOptions::default();
            let (g, cfg) = harness::empty_method();
            let ctx = harness::context(g, &target, &options);
            let mut gen = LirGenerator::new(&ctx, &cfg);
            let isa = target.isa();
            for case in 0..400 {
                let ty = TYPES[rng.gen_range(0..TYPES.len())];
                let disp = if case < fixed_disps.len() * 2 {
                    fixed_disps[case % fixed_disps.len()]
                } else {
                    rng.gen_range(-100_000..100_000)
                };
                let shift = rng.gen_range(0..4u8);
                let base_value = rng.gen_range(0x1000..0x4000_0000i64);
                let index_value = rng.gen_range(-1000..1000i64);

                gen.ops.clear();
                let mut m = Machine::default();
                let base = gen.new_pointer_register();
                m.set(&base, base_value);
                let index = match case % 3 {
                    0 => None,
                    1 => Some(Operand::int(index_value as i32)),
                    _ => {
                        let r = gen.new_register(BasicType::Int);
                        m.set(&r, index_value);
                        Some(r)
                    }
                };
                let scaled = if index.is_some() { index_value << shift } else { 0 };
                let addr = gen.generate_address(&base, index, shift, disp, ty).unwrap();
                m.run(&gen.ops);

                let expected = base_value + scaled + disp;
                let actual = m.effective(&addr);
                if target.word_size == 4 {
                    assert_eq!(actual as u32, expected as u32, "case {} {:?} disp {}", case, ty, disp);
                } else {
                    assert_eq!(actual, expected, "case {} {:?} disp {}", case, ty, disp);
                }
                let limits = isa.address_limits(ty, target.word_size);
                if addr.index.is_some() {
                    assert_eq!(addr.disp, 0);
                } else {
                    assert!(isa.disp_in_range(addr.disp, &limits), "{} out of range for {:?}", addr, ty);
                }
            }
        }
    }

    #[test]
    fn test_arm32_unaligned_float_offset_goes_through_a_register() {
        let target = TargetDescriptor::arm32();
        let options = CompileOptions::default();
        let (g, cfg) = harness::empty_method();
        let ctx = harness::context(g, &target, &options);
        let mut gen = LirGenerator::new(&ctx, &cfg);
        let base = Operand::vreg(VReg(900), BasicType::Object);
        let addr = gen.generate_address(&base, None, 0, 6, BasicType::Float).unwrap();
        assert_eq!(addr.disp, 0);
        assert_ne!(addr.base, Reg::Virtual(VReg(900)));
        assert!(gen.ops.iter().any(|o| o.code == LirOpcode::Add));

        gen.ops.clear();
        let addr = gen.generate_address(&base, None, 0, 8, BasicType::Float).unwrap();
        assert!(gen.ops.is_empty());
        assert_eq!(addr.disp, 8);
    }

    #[test]
    fn test_constant_index_folds_into_displacement() {
        let target = TargetDescriptor::aarch64();
        let options = CompileOptions::default();
        let (g, cfg) = harness::empty_method();
        let ctx = harness::context(g, &target, &options);
        let mut gen = LirGenerator::new(&ctx, &cfg);
        let base = Operand::vreg(VReg(900), BasicType::Array);
        let addr = gen
            .generate_address(&base, Some(Operand::int(3)), 2, 16, BasicType::Int)
            .unwrap();
        assert!(gen.ops.is_empty());
        assert_eq!(addr.index, None);
        assert_eq!(addr.disp, 28);
    }

    fn field_store_ops(target: &TargetDescriptor, barrier: BarrierConfig, volatile: bool) -> Vec<LirOp> {
        let mut b = GraphBuilder::new("put");
        let entry = b.start();
        let holder = b.param(0, BasicType::Object);
        let value = b.param(1, BasicType::Object);
        let st = b.store(entry, holder, 24, value, BasicType::Object, AliasClass::Field(24), None);
        b.ret(entry, None);
        let mut g = b.finish().unwrap();
        if let Op::Store { volatile: v, .. } = &mut g.nodes[st.index()].op {
            *v = volatile;
        }
        let cfg = harness::analyze(&g);
        let options = CompileOptions {
            barrier,
            ..CompileOptions::default()
        };
        let ctx = harness::context(g, target, &options);
        let out = LirGenerator::new(&ctx, &cfg).generate().unwrap();
        out.blocks[cfg.root.index()].ops.clone()
    }

    #[test]
    fn test_conditional_card_mark_skips_dirty_card() {
        let ops = field_store_ops(&TargetDescriptor::aarch64(), BarrierConfig::satb(), false);
        let store = ops
            .iter()
            .position(|o| o.result.as_address().map_or(false, |a| a.disp == 24))
            .unwrap();
        let pre = ops
            .iter()
            .position(|o| matches!(o.code, LirOpcode::Branch { target: BranchTarget::Stub(_), .. }))
            .unwrap();
        assert!(pre < store);
        let after = &ops[store..];
        let fence = after
            .iter()
            .position(|o| o.code == LirOpcode::Membar(MembarKind::StoreLoad))
            .unwrap();
        let skip = after
            .iter()
            .position(|o| matches!(o.code, LirOpcode::Branch { target: BranchTarget::Label(_), .. }))
            .unwrap();
        let label = after
            .iter()
            .position(|o| matches!(o.code, LirOpcode::Label(_)))
            .unwrap();
        assert!(fence < skip && skip < label);
        // the dirtying store sits between the skip branch and its label
        let dirty = &after[label - 1];
        assert_eq!(dirty.inputs, vec![Operand::fixed(PReg::Zr, BasicType::Byte)]);
    }

    #[test]
    fn test_arm32_card_mark_uses_base_register() {
        let ops = field_store_ops(&TargetDescriptor::arm32(), BarrierConfig::default(), false);
        let last = ops.iter().rev().find(|o| o.result.as_address().is_some()).unwrap();
        let card = last.result.as_address().unwrap();
        assert_eq!(card.base, Reg::Fixed(PReg::Lr));
        assert_eq!(card.shift, -9);
        assert_eq!(last.inputs[0].as_reg(), Some(Reg::Fixed(PReg::Lr)));
        assert!(ops
            .iter()
            .any(|o| o.inputs == vec![Operand::Const(Constant::Pointer(0x7f00_0000))]));
    }

    #[test]
    fn test_volatile_store_fences() {
        let ops = field_store_ops(&TargetDescriptor::aarch64(), BarrierConfig::none(), true);
        let codes: Vec<&LirOpcode> = ops.iter().map(|o| &o.code).collect();
        let release = codes
            .iter()
            .position(|c| **c == LirOpcode::Membar(MembarKind::Release))
            .unwrap();
        let full = codes
            .iter()
            .position(|c| **c == LirOpcode::Membar(MembarKind::StoreLoad))
            .unwrap();
        assert!(release < full);
        assert!(!ops.iter().any(|o| o.code == LirOpcode::Lea));
    }

    #[test]
    fn test_volatile_long_on_arm32_is_single_copy() {
        let mut b = GraphBuilder::new("get");
        let entry = b.start();
        let obj = b.param(0, BasicType::Object);
        let off = b.param(1, BasicType::Long);
        let get = b.op(
            entry,
            Op::UnsafeGet {
                object: obj,
                offset: off,
                volatile: true,
            },
            BasicType::Long,
        );
        b.ret(entry, Some(get));
        let g = b.finish().unwrap();
        let cfg = harness::analyze(&g);
        let target = TargetDescriptor::arm32();
        let options = CompileOptions::default();
        let ctx = harness::context(g, &target, &options);
        let out = LirGenerator::new(&ctx, &cfg).generate().unwrap();
        let ops = &out.blocks[cfg.root.index()].ops;
        let add = ops.iter().position(|o| o.code == LirOpcode::Add).unwrap();
        let mv = ops.iter().position(|o| o.code == LirOpcode::VolatileMove).unwrap();
        assert!(add < mv);
        assert_eq!(ops[mv + 1].code, LirOpcode::Membar(MembarKind::Acquire));
    }

    #[test]
    fn test_unsafe_put_barriers_only_for_objects() {
        let build = |ty: BasicType| {
            let mut b = GraphBuilder::new("put");
            let entry = b.start();
            let obj = b.param(0, BasicType::Object);
            let off = b.param(1, BasicType::Long);
            let v = b.param(2, ty);
            b.op(
                entry,
                Op::UnsafePut {
                    object: obj,
                    offset: off,
                    value: v,
                    volatile: false,
                    mem: None,
                },
                BasicType::Void,
            );
            b.ret(entry, None);
            b.finish().unwrap()
        };
        let target = TargetDescriptor::aarch64();
        let options = CompileOptions {
            barrier: BarrierConfig::satb(),
            ..CompileOptions::default()
        };
        for (ty, barriers) in [(BasicType::Object, true), (BasicType::Int, false)] {
            let g = build(ty);
            let cfg = harness::analyze(&g);
            let ctx = harness::context(g, &target, &options);
            let out = LirGenerator::new(&ctx, &cfg).generate().unwrap();
            let has_pre = out.stubs.iter().any(|s| matches!(s.kind, StubKind::PreBarrier { .. }));
            assert_eq!(has_pre, barriers, "{:?}", ty);
        }
    }
}
