//! Low-level IR
//!
//! One [`LirOp`] per machine-level operation, over virtual registers and
//! explicit addresses. Slow paths (exceptions, allocation, barriers) are
//! [`CodeStub`]s referenced by id and emitted out of line.

use crate::cfg::BlockId;
use crate::ir::{Condition, ConvertOp, NodeId};
use crate::operand::{BasicType, Operand};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StubId(pub u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LabelId(pub u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BranchTarget {
    Block(BlockId),
    Stub(StubId),
    /// Local label inside the current block
    Label(LabelId),
}

impl fmt::Display for BranchTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BranchTarget::Block(b) => write!(f, "{}", b),
            BranchTarget::Stub(s) => write!(f, "S{}", s.0),
            BranchTarget::Label(l) => write!(f, "L{}", l.0),
        }
    }
}

/// Debug state attached to an op that can trap or call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CodeEmitInfo {
    pub node: NodeId,
    pub bci: u32,
    /// Deoptimization resumes before the node rather than after it
    pub state_before: bool,
    /// Refers to a class that is not loaded yet; the site gets patched
    pub patching: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MembarKind {
    Acquire,
    Release,
    StoreLoad,
    StoreStore,
    Full,
}

/// Out-of-line runtime routines
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuntimeEntry {
    Idiv,
    Irem,
    Lmul,
    Ldiv,
    Lrem,
    Frem,
    Drem,
    Fadd,
    Fsub,
    Fmul,
    Fdiv,
    Dadd,
    Dsub,
    Dmul,
    Ddiv,
    Fneg,
    Dneg,
    /// Three-way float compare; `unordered_less` picks the NaN result
    Fcmp { unordered_less: bool },
    Dcmp { unordered_less: bool },
    /// Boolean float compare for a branch
    FcmpCond(Condition),
    DcmpCond(Condition),
    Convert(ConvertOp),
    Dabs,
    Dsqrt,
    Dsin,
    Dcos,
    Dtan,
    Dlog,
    Dlog10,
    Dexp,
    Dpow,
    NewMultiArray,
}

#[derive(Debug, Clone, PartialEq)]
pub enum LirOpcode {
    Label(LabelId),
    Move,
    /// Single-copy atomic 64-bit move on a 32-bit target
    VolatileMove,
    /// Materialize an effective address
    Lea,
    Add,
    Sub,
    Mul,
    Div,
    Rem,
    Shl,
    Shr,
    Ushr,
    And,
    Or,
    Xor,
    Neg,
    Abs,
    Sqrt,
    Convert(ConvertOp),
    /// Set flags from `inputs[0] - inputs[1]`
    Cmp,
    Cmp3Long,
    Cmp3Float {
        unordered_less: bool,
    },
    Branch {
        cond: Condition,
        target: BranchTarget,
        /// Float compares: where an unordered result goes
        unordered: Option<BranchTarget>,
    },
    Jump(BranchTarget),
    /// Control always reaches `target`; the fake exit edge is only structural
    NeverBranch(BlockId),
    Return,
    Throw,
    Call(RuntimeEntry),
    Safepoint,
    Membar(MembarKind),
    CasInt,
    CasLong,
    CasObj,
    Xchg,
    Xadd,
    /// Address of monitor slot n in the frame
    MonitorAddress(u32),
    Lock,
    Unlock,
    StoreCheck,
    CheckCast,
    InstanceOf,
    AllocObject,
    AllocArray(BasicType),
    ArrayCopy,
}

impl LirOpcode {
    fn mnemonic(&self) -> String {
        match self {
            LirOpcode::Label(l) => format!("label L{}", l.0),
            LirOpcode::Convert(op) => format!("convert {:?}", op).to_lowercase(),
            LirOpcode::Cmp3Float { unordered_less } => {
                if *unordered_less {
                    "fcmp3l".into()
                } else {
                    "fcmp3g".into()
                }
            }
            LirOpcode::Branch { cond, target, .. } => format!("branch {:?} {}", cond, target),
            LirOpcode::Jump(target) => format!("jump {}", target),
            LirOpcode::NeverBranch(target) => format!("never_branch {}", target),
            LirOpcode::Call(entry) => format!("call {:?}", entry),
            LirOpcode::Membar(kind) => format!("membar {:?}", kind).to_lowercase(),
            LirOpcode::MonitorAddress(n) => format!("monaddr {}", n),
            LirOpcode::AllocArray(elem) => format!("alloc_array {:?}", elem),
            other => format!("{:?}", other).to_lowercase(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct LirOp {
    pub code: LirOpcode,
    pub result: Operand,
    pub inputs: Vec<Operand>,
    pub temps: Vec<Operand>,
    pub info: Option<CodeEmitInfo>,
    pub stub: Option<StubId>,
}

impl LirOp {
    pub fn new(code: LirOpcode) -> Self {
        Self {
            code,
            result: Operand::Illegal,
            inputs: Vec::new(),
            temps: Vec::new(),
            info: None,
            stub: None,
        }
    }

    pub fn result(mut self, result: Operand) -> Self {
        self.result = result;
        self
    }

    pub fn inputs(mut self, inputs: Vec<Operand>) -> Self {
        self.inputs = inputs;
        self
    }

    pub fn temps(mut self, temps: Vec<Operand>) -> Self {
        self.temps = temps;
        self
    }

    pub fn info(mut self, info: Option<CodeEmitInfo>) -> Self {
        self.info = info;
        self
    }

    pub fn stub(mut self, stub: StubId) -> Self {
        self.stub = Some(stub);
        self
    }

    /// Block this op transfers control to, if any
    pub fn block_target(&self) -> Option<BlockId> {
        match &self.code {
            LirOpcode::Branch {
                target: BranchTarget::Block(b),
                ..
            }
            | LirOpcode::Jump(BranchTarget::Block(b))
            | LirOpcode::NeverBranch(b) => Some(*b),
            _ => None,
        }
    }

    /// Rewrite every reference to block `from` into `to`
    pub fn retarget(&mut self, from: BlockId, to: BlockId) {
        let swap = |t: &mut BranchTarget| {
            if *t == BranchTarget::Block(from) {
                *t = BranchTarget::Block(to);
            }
        };
        match &mut self.code {
            LirOpcode::Branch {
                target, unordered, ..
            } => {
                swap(target);
                if let Some(u) = unordered {
                    swap(u);
                }
            }
            LirOpcode::Jump(target) => swap(target),
            LirOpcode::NeverBranch(b) if *b == from => *b = to,
            _ => {}
        }
    }

    pub fn is_jump(&self) -> bool {
        matches!(self.code, LirOpcode::Jump(_))
    }
}

impl fmt::Display for LirOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.code.mnemonic())?;
        if !self.result.is_illegal() {
            write!(f, " {} <-", self.result)?;
        }
        for (i, input) in self.inputs.iter().enumerate() {
            let sep = if i == 0 { " " } else { ", " };
            write!(f, "{}{}", sep, input)?;
        }
        if !self.temps.is_empty() {
            let temps: Vec<String> = self.temps.iter().map(|t| t.to_string()).collect();
            write!(f, " [tmp {}]", temps.join(", "))?;
        }
        if let Some(stub) = self.stub {
            write!(f, " -> S{}", stub.0)?;
        }
        if let Some(info) = self.info {
            write!(f, " @{}", info.bci)?;
            if info.state_before {
                write!(f, "b")?;
            }
            if info.patching {
                write!(f, " patch")?;
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum StubKind {
    DivByZero,
    RangeCheck { index: Operand },
    NullCheck,
    ArrayStoreCheck,
    ClassCast,
    IncompatibleClassChange,
    Deoptimize,
    NewInstance,
    NewTypeArray,
    NewObjectArray,
    MonitorEnter,
    MonitorExit,
    /// SATB slow path; records the value currently at `addr`
    PreBarrier { addr: Operand },
}

#[derive(Debug, Clone, PartialEq)]
pub struct CodeStub {
    pub id: StubId,
    pub kind: StubKind,
    pub info: Option<CodeEmitInfo>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct LirBlock {
    pub id: BlockId,
    pub ops: Vec<LirOp>,
    pub freq: f64,
    pub loop_depth: u32,
    /// Loop head the assembler should align
    pub aligned: bool,
}

impl LirBlock {
    pub fn new(id: BlockId) -> Self {
        Self {
            id,
            ops: Vec::new(),
            freq: 0.0,
            loop_depth: 0,
            aligned: false,
        }
    }

    /// Block targets of the trailing branches, in op order
    pub fn targets(&self) -> Vec<BlockId> {
        self.ops.iter().filter_map(LirOp::block_target).collect()
    }
}

impl fmt::Display for LirBlock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} [freq {:.3}", self.id, self.freq)?;
        if self.loop_depth > 0 {
            write!(f, ", loop depth {}", self.loop_depth)?;
        }
        if self.aligned {
            write!(f, ", aligned")?;
        }
        writeln!(f, "]:")?;
        for op in &self.ops {
            writeln!(f, "    {}", op)?;
        }
        Ok(())
    }
}

/// Straight-line interpreter over integer LIR, used to check lowering
/// sequences without an assembler
#[cfg(test)]
pub(crate) mod eval {
    use super::{LirOp, LirOpcode};
    use crate::ir::ConvertOp;
    use crate::operand::{Address, BasicType, Operand, Reg};
    use std::collections::HashMap;

    #[derive(Default)]
    pub struct Machine {
        pub regs: HashMap<Reg, i64>,
    }

    impl Machine {
        pub fn set(&mut self, op: &Operand, value: i64) {
            if let Some(r) = op.as_reg() {
                self.regs.insert(r, value);
            }
        }

        pub fn reg(&self, r: Reg) -> i64 {
            self.regs.get(&r).copied().unwrap_or_else(|| panic!("{} read before write", r))
        }

        pub fn effective(&self, a: &Address) -> i64 {
            let mut ea = self.reg(a.base).wrapping_add(a.disp);
            if let Some(index) = a.index {
                let i = self.reg(index);
                let scaled = if a.shift >= 0 { i << a.shift } else { i >> -a.shift };
                ea = ea.wrapping_add(scaled);
            }
            ea
        }

        pub fn value(&self, op: &Operand) -> i64 {
            match op {
                Operand::Reg(r, _) => self.reg(*r),
                Operand::Const(c) => c.as_i64().unwrap_or_else(|| panic!("non-integral {}", c)),
                Operand::Shifted(r, s) => {
                    let v = self.reg(*r);
                    if *s >= 0 {
                        v << s
                    } else {
                        v >> -s
                    }
                }
                Operand::Addr(a) => self.effective(a),
                other => panic!("cannot evaluate {}", other),
            }
        }

        fn width(ty: BasicType, v: i64) -> i64 {
            if ty == BasicType::Int {
                v as i32 as i64
            } else {
                v
            }
        }

        pub fn run(&mut self, ops: &[LirOp]) {
            for op in ops {
                let ty = op.result.ty();
                let input = |i: usize| self.value(&op.inputs[i]);
                let value = match &op.code {
                    LirOpcode::Move | LirOpcode::Lea => input(0),
                    LirOpcode::Add => input(0).wrapping_add(input(1)),
                    LirOpcode::Sub => input(0).wrapping_sub(input(1)),
                    LirOpcode::Mul => input(0).wrapping_mul(input(1)),
                    LirOpcode::Shl => input(0).wrapping_shl(input(1) as u32),
                    LirOpcode::Shr => {
                        if ty == BasicType::Int {
                            ((input(0) as i32) >> (input(1) & 31)) as i64
                        } else {
                            input(0) >> (input(1) & 63)
                        }
                    }
                    LirOpcode::And => input(0) & input(1),
                    LirOpcode::Or => input(0) | input(1),
                    LirOpcode::Xor => input(0) ^ input(1),
                    LirOpcode::Neg => input(0).wrapping_neg(),
                    LirOpcode::Convert(ConvertOp::I2L) => input(0) as i32 as i64,
                    LirOpcode::Convert(ConvertOp::L2I) => input(0) as i32 as i64,
                    LirOpcode::Label(_)
                    | LirOpcode::Cmp
                    | LirOpcode::Branch { .. }
                    | LirOpcode::Jump(_)
                    | LirOpcode::Safepoint
                    | LirOpcode::Return => continue,
                    other => panic!("eval does not model {:?}", other),
                };
                let value = Self::width(ty, value);
                self.set(&op.result, value);
            }
        }
    }
}
