//! Monitors, type checks and allocation

use super::LirGenerator;
use crate::error::{CodegenError, Result};
use crate::ir::{CastFailure, ClassRef, NodeId};
use crate::lir::{CodeEmitInfo, LirOp, LirOpcode, RuntimeEntry, StubKind};
use crate::operand::{BasicType, Constant, Operand};

fn klass(class: ClassRef) -> Operand {
    Operand::Const(Constant::Metadata(class.id))
}

impl<'a> LirGenerator<'a> {
    /// Debug info that also marks the site for patching when the class is
    /// not loaded yet
    fn class_info(&self, n: NodeId, class: ClassRef, state_before: bool) -> Option<CodeEmitInfo> {
        self.state_for(n, state_before).map(|info| CodeEmitInfo {
            patching: !class.loaded,
            ..info
        })
    }

    fn object_temps(&self, count: usize) -> Vec<Operand> {
        (0..count).map(|_| self.new_register(BasicType::Object)).collect()
    }

    pub(super) fn do_monitor_enter(
        &mut self,
        n: NodeId,
        object: NodeId,
        monitor: u32,
        null_check: bool,
    ) -> Result<()> {
        let obj = self.load_item(object)?;
        let info = self.state_for(n, true);

        let lock = self.new_pointer_register();
        self.emit(LirOp::new(LirOpcode::MonitorAddress(monitor)).result(lock.clone()));
        let mut temps = vec![self.new_pointer_register()];
        if self.options.biased_locking {
            temps.push(self.new_pointer_register());
        }

        if null_check {
            self.null_check(&obj, info);
        }
        let stub = self.add_stub(StubKind::MonitorEnter, info);
        self.emit(
            LirOp::new(LirOpcode::Lock)
                .inputs(vec![obj, lock])
                .temps(temps)
                .info(info)
                .stub(stub),
        );
        Ok(())
    }

    pub(super) fn do_monitor_exit(&mut self, n: NodeId, object: NodeId, monitor: u32) -> Result<()> {
        let obj = self.load_item(object)?;
        let lock = self.new_pointer_register();
        self.emit(LirOp::new(LirOpcode::MonitorAddress(monitor)).result(lock.clone()));
        let header = self.new_pointer_register();
        let stub = self.add_stub(StubKind::MonitorExit, self.state_for(n, false));
        self.emit(
            LirOp::new(LirOpcode::Unlock)
                .inputs(vec![obj, lock])
                .temps(vec![header])
                .stub(stub),
        );
        Ok(())
    }

    /// Null passes the check; anything else not a subtype branches to the stub
    pub(super) fn do_check_cast(
        &mut self,
        n: NodeId,
        object: NodeId,
        class: ClassRef,
        failure: CastFailure,
    ) -> Result<()> {
        let obj = self.load_item(object)?;
        let info = self.class_info(n, class, true);
        let kind = match failure {
            CastFailure::ClassCast => StubKind::ClassCast,
            CastFailure::IncompatibleClassChange => StubKind::IncompatibleClassChange,
            CastFailure::Deoptimize => StubKind::Deoptimize,
        };
        let stub = self.add_stub(kind, info);
        let temps = self.object_temps(3);
        let result = self.rlock_result(n);
        self.emit(
            LirOp::new(LirOpcode::CheckCast)
                .result(result)
                .inputs(vec![obj, klass(class)])
                .temps(temps)
                .info(info)
                .stub(stub),
        );
        Ok(())
    }

    pub(super) fn do_instance_of(&mut self, n: NodeId, object: NodeId, class: ClassRef) -> Result<()> {
        let obj = self.load_item(object)?;
        // only a patch site needs debug info; the test itself cannot fail
        let info = if class.loaded {
            None
        } else {
            self.class_info(n, class, true)
        };
        let temps = self.object_temps(3);
        let result = self.rlock_result(n);
        self.emit(
            LirOp::new(LirOpcode::InstanceOf)
                .result(result)
                .inputs(vec![obj, klass(class)])
                .temps(temps)
                .info(info),
        );
        Ok(())
    }

    /// Allocation on the runtime convention's registers; the stub covers
    /// the slow path, negative lengths and out-of-memory
    fn allocate(
        &mut self,
        n: NodeId,
        code: LirOpcode,
        args: Vec<Operand>,
        stub_kind: StubKind,
        info: Option<CodeEmitInfo>,
    ) {
        let tys: Vec<BasicType> = args.iter().map(|a| a.ty().stack_type()).collect();
        let locations = self.isa.runtime_args(&tys, self.target);
        for (arg, loc) in args.into_iter().zip(&locations) {
            self.emit(LirOp::new(LirOpcode::Move).result(loc.clone()).inputs(vec![arg]));
        }
        let fixed = self.isa.result_location(BasicType::Object, self.target);
        let stub = self.add_stub(stub_kind, info);
        let temps = self.object_temps(3);
        self.emit(
            LirOp::new(code)
                .result(fixed.clone())
                .inputs(locations)
                .temps(temps)
                .info(info)
                .stub(stub),
        );
        let result = self.rlock_result(n);
        self.emit(LirOp::new(LirOpcode::Move).result(result).inputs(vec![fixed]));
    }

    pub(super) fn do_new_instance(&mut self, n: NodeId, class: ClassRef) -> Result<()> {
        let info = self.class_info(n, class, true);
        self.allocate(n, LirOpcode::AllocObject, vec![klass(class)], StubKind::NewInstance, info);
        Ok(())
    }

    pub(super) fn do_new_type_array(&mut self, n: NodeId, length: NodeId, elem: BasicType) -> Result<()> {
        if elem.is_object() || elem == BasicType::Void {
            return Err(CodegenError::Internal(format!("{:?} is not a primitive element type", elem)));
        }
        let len = self.load_item(length)?;
        let info = self.state_for(n, true);
        // primitive array klasses are indexed by element type
        let array_klass = Operand::Const(Constant::Metadata(elem as u32));
        self.allocate(
            n,
            LirOpcode::AllocArray(elem),
            vec![array_klass, len],
            StubKind::NewTypeArray,
            info,
        );
        Ok(())
    }

    pub(super) fn do_new_object_array(&mut self, n: NodeId, length: NodeId, class: ClassRef) -> Result<()> {
        let len = self.load_item(length)?;
        let info = self.class_info(n, class, true);
        self.allocate(
            n,
            LirOpcode::AllocArray(BasicType::Object),
            vec![klass(class), len],
            StubKind::NewObjectArray,
            info,
        );
        Ok(())
    }

    /// Dimensions go to outgoing stack slots; the runtime reads them from there
    pub(super) fn do_new_multi_array(&mut self, n: NodeId, dims: &[NodeId], class: ClassRef) -> Result<()> {
        if dims.is_empty() {
            return Err(CodegenError::MalformedGraph(format!("{} has no dimensions", n)));
        }
        let info = self.class_info(n, class, true);
        for (slot, &dim) in dims.iter().enumerate() {
            let value = self.load_item(dim)?;
            self.emit(
                LirOp::new(LirOpcode::Move)
                    .result(Operand::Stack(slot as u32, BasicType::Int))
                    .inputs(vec![value]),
            );
        }
        let result = self.call_runtime(
            vec![klass(class), Operand::int(dims.len() as i32)],
            RuntimeEntry::NewMultiArray,
            BasicType::Object,
            info,
        );
        self.set_result(n, result);
        Ok(())
    }
}
