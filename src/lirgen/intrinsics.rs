//! Intrinsic lowering

use super::LirGenerator;
use crate::error::{CodegenError, Result};
use crate::ir::{IntrinsicId, NodeId};
use crate::lir::{LirOp, LirOpcode, RuntimeEntry};
use crate::operand::{BasicType, Operand, PReg};

fn arity(id: IntrinsicId) -> usize {
    match id {
        IntrinsicId::Dpow => 2,
        IntrinsicId::ArrayCopy => 5,
        IntrinsicId::Fma => 3,
        IntrinsicId::Crc32Update => 2,
        IntrinsicId::Crc32UpdateBytes | IntrinsicId::VectorizedMismatch => 4,
        _ => 1,
    }
}

impl<'a> LirGenerator<'a> {
    pub(super) fn do_intrinsic(&mut self, n: NodeId, id: IntrinsicId, args: &[NodeId]) -> Result<()> {
        if args.len() != arity(id) {
            return Err(CodegenError::MalformedGraph(format!(
                "{:?} at {} takes {} arguments, got {}",
                id,
                n,
                arity(id),
                args.len()
            )));
        }
        match id {
            IntrinsicId::Dabs => self.do_math_unary(n, args[0], LirOpcode::Abs, RuntimeEntry::Dabs),
            IntrinsicId::Dsqrt => self.do_math_unary(n, args[0], LirOpcode::Sqrt, RuntimeEntry::Dsqrt),
            IntrinsicId::Dsin => self.do_math_call(n, args, RuntimeEntry::Dsin),
            IntrinsicId::Dcos => self.do_math_call(n, args, RuntimeEntry::Dcos),
            IntrinsicId::Dtan => self.do_math_call(n, args, RuntimeEntry::Dtan),
            IntrinsicId::Dlog => self.do_math_call(n, args, RuntimeEntry::Dlog),
            IntrinsicId::Dlog10 => self.do_math_call(n, args, RuntimeEntry::Dlog10),
            IntrinsicId::Dexp => self.do_math_call(n, args, RuntimeEntry::Dexp),
            IntrinsicId::Dpow => self.do_math_call(n, args, RuntimeEntry::Dpow),
            IntrinsicId::ArrayCopy => self.do_array_copy(n, args),
            IntrinsicId::Crc32Update
            | IntrinsicId::Crc32UpdateBytes
            | IntrinsicId::Fma
            | IntrinsicId::VectorizedMismatch => Err(CodegenError::Unsupported(format!(
                "{:?} intrinsic on {}",
                id, self.target.family
            ))),
        }
    }

    fn do_math_unary(&mut self, n: NodeId, value: NodeId, code: LirOpcode, entry: RuntimeEntry) -> Result<()> {
        if !self.target.hardware_float {
            return self.do_math_call(n, &[value], entry);
        }
        let v = self.load_item(value)?;
        let result = self.rlock_result(n);
        self.emit(LirOp::new(code).result(result).inputs(vec![v]));
        Ok(())
    }

    fn do_math_call(&mut self, n: NodeId, args: &[NodeId], entry: RuntimeEntry) -> Result<()> {
        let mut values = Vec::with_capacity(args.len());
        for &a in args {
            values.push(self.load_item(a)?);
        }
        let result = self.call_runtime(values, entry, BasicType::Double, None);
        self.set_result(n, result);
        Ok(())
    }

    /// `src, src_pos, dst, dst_pos, length` in the convention's registers;
    /// the copy stub also needs a scratch register of its own
    fn do_array_copy(&mut self, n: NodeId, args: &[NodeId]) -> Result<()> {
        let mut values = Vec::with_capacity(args.len());
        for &a in args {
            values.push(self.load_item(a)?);
        }
        let tys: Vec<BasicType> = values.iter().map(|v| v.ty().stack_type()).collect();
        let locations = self.isa.runtime_args(&tys, self.target);
        for (value, loc) in values.into_iter().zip(&locations) {
            self.emit(LirOp::new(LirOpcode::Move).result(loc.clone()).inputs(vec![value]));
        }
        let info = self.state_for(n, false);
        self.emit(
            LirOp::new(LirOpcode::ArrayCopy)
                .inputs(locations)
                .temps(vec![Operand::fixed(PReg::R(5), BasicType::Int)])
                .info(info),
        );
        Ok(())
    }
}
