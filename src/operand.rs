//! Machine operand model
//!
//! Operands are what LIR instructions consume and produce: virtual or fixed
//! registers, immediates, and memory addresses. An [`Address`] can only hold
//! registers for its base and index, so a constant index has nowhere to go but
//! the displacement.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Value types flowing through the IR and the LIR
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BasicType {
    Boolean,
    Byte,
    Char,
    Short,
    Int,
    Long,
    Float,
    Double,
    /// Object reference
    Object,
    /// Array reference
    Array,
    /// Raw machine pointer
    Address,
    /// Class / method metadata pointer
    Metadata,
    Void,
}

impl BasicType {
    /// Storage size in bytes for a target with the given word size
    pub fn size_bytes(self, word_size: u32) -> u32 {
        match self {
            BasicType::Boolean | BasicType::Byte => 1,
            BasicType::Char | BasicType::Short => 2,
            BasicType::Int | BasicType::Float => 4,
            BasicType::Long | BasicType::Double => 8,
            BasicType::Object
            | BasicType::Array
            | BasicType::Address
            | BasicType::Metadata => word_size,
            BasicType::Void => 0,
        }
    }

    /// log2 of the storage size
    pub fn log2_size(self, word_size: u32) -> u8 {
        match self.size_bytes(word_size) {
            0 | 1 => 0,
            2 => 1,
            4 => 2,
            _ => 3,
        }
    }

    pub fn is_object(self) -> bool {
        matches!(self, BasicType::Object | BasicType::Array)
    }

    pub fn is_float(self) -> bool {
        matches!(self, BasicType::Float | BasicType::Double)
    }

    /// Sub-word integer types that are widened to int in registers
    pub fn is_subword(self) -> bool {
        matches!(
            self,
            BasicType::Boolean | BasicType::Byte | BasicType::Char | BasicType::Short
        )
    }

    /// Number of machine words a value occupies
    pub fn word_count(self, word_size: u32) -> u32 {
        match self {
            BasicType::Void => 0,
            BasicType::Long | BasicType::Double if word_size == 4 => 2,
            _ => 1,
        }
    }

    /// Type a value of this type has once loaded into a register
    pub fn stack_type(self) -> BasicType {
        if self.is_subword() {
            BasicType::Int
        } else {
            self
        }
    }

    fn suffix(self) -> &'static str {
        match self {
            BasicType::Boolean => "z",
            BasicType::Byte => "b",
            BasicType::Char => "c",
            BasicType::Short => "s",
            BasicType::Int => "i",
            BasicType::Long => "j",
            BasicType::Float => "f",
            BasicType::Double => "d",
            BasicType::Object => "L",
            BasicType::Array => "[",
            BasicType::Address => "p",
            BasicType::Metadata => "m",
            BasicType::Void => "v",
        }
    }
}

/// Virtual register, numbered per compilation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct VReg(pub u32);

/// Physical register fixed by a calling convention or the runtime
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PReg {
    /// General purpose register n
    R(u8),
    /// Floating point register n
    V(u8),
    Sp,
    Lr,
    /// Hardwired zero register (AArch64 only)
    Zr,
    /// Current thread register
    Thread,
}

impl fmt::Display for PReg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PReg::R(n) => write!(f, "r{}", n),
            PReg::V(n) => write!(f, "v{}", n),
            PReg::Sp => write!(f, "sp"),
            PReg::Lr => write!(f, "lr"),
            PReg::Zr => write!(f, "zr"),
            PReg::Thread => write!(f, "rthread"),
        }
    }
}

/// A register of either kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Reg {
    Virtual(VReg),
    Fixed(PReg),
}

impl fmt::Display for Reg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Reg::Virtual(v) => write!(f, "R{}", v.0),
            Reg::Fixed(p) => write!(f, "{}", p),
        }
    }
}

/// Compile-time constant
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum Constant {
    Int(i32),
    Long(i64),
    Float(f32),
    Double(f64),
    /// The null reference
    Null,
    /// Raw address (counter cells, card table base, ...)
    Pointer(i64),
    /// Class metadata handle
    Metadata(u32),
}

impl Constant {
    pub fn basic_type(&self) -> BasicType {
        match self {
            Constant::Int(_) => BasicType::Int,
            Constant::Long(_) => BasicType::Long,
            Constant::Float(_) => BasicType::Float,
            Constant::Double(_) => BasicType::Double,
            Constant::Null => BasicType::Object,
            Constant::Pointer(_) => BasicType::Address,
            Constant::Metadata(_) => BasicType::Metadata,
        }
    }

    /// Integral value, if the constant has one
    pub fn as_i64(&self) -> Option<i64> {
        match *self {
            Constant::Int(v) => Some(v as i64),
            Constant::Long(v) => Some(v),
            Constant::Null => Some(0),
            Constant::Pointer(v) => Some(v),
            _ => None,
        }
    }

    pub fn is_zero(&self) -> bool {
        match *self {
            Constant::Float(v) => v.to_bits() == 0,
            Constant::Double(v) => v.to_bits() == 0,
            _ => self.as_i64() == Some(0),
        }
    }
}

impl fmt::Display for Constant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Constant::Int(v) => write!(f, "#{}", v),
            Constant::Long(v) => write!(f, "#{}L", v),
            Constant::Float(v) => write!(f, "#{}f", v),
            Constant::Double(v) => write!(f, "#{}d", v),
            Constant::Null => write!(f, "#null"),
            Constant::Pointer(v) => write!(f, "#0x{:x}", v),
            Constant::Metadata(v) => write!(f, "#klass{}", v),
        }
    }
}

/// Memory address `base + (index << shift) + disp`
///
/// A negative `shift` means the index is shifted right instead, which is how
/// card-table addresses are formed.
#[derive(Debug, Clone, PartialEq)]
pub struct Address {
    pub base: Reg,
    pub index: Option<Reg>,
    pub shift: i8,
    pub disp: i64,
    /// Type of the value being accessed
    pub ty: BasicType,
}

impl Address {
    pub fn new(base: Reg, index: Option<Reg>, shift: i8, disp: i64, ty: BasicType) -> Self {
        Self {
            base,
            index,
            shift,
            disp,
            ty,
        }
    }

    pub fn base_disp(base: Reg, disp: i64, ty: BasicType) -> Self {
        Self::new(base, None, 0, disp, ty)
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}", self.base)?;
        if let Some(index) = self.index {
            match self.shift {
                0 => write!(f, " + {}", index)?,
                s if s > 0 => write!(f, " + {} << {}", index, s)?,
                s => write!(f, " + {} >> {}", index, -s)?,
            }
        }
        if self.disp != 0 {
            write!(f, " + {}", self.disp)?;
        }
        write!(f, "]:{}", self.ty.suffix())
    }
}

/// LIR operand
#[derive(Debug, Clone, PartialEq)]
pub enum Operand {
    Reg(Reg, BasicType),
    Const(Constant),
    Addr(Box<Address>),
    /// Shifted register operand (`reg << n`, or `>>` when negative)
    Shifted(Reg, i8),
    /// Outgoing argument stack slot
    Stack(u32, BasicType),
    Illegal,
}

impl Operand {
    pub fn vreg(v: VReg, ty: BasicType) -> Self {
        Operand::Reg(Reg::Virtual(v), ty)
    }

    pub fn fixed(p: PReg, ty: BasicType) -> Self {
        Operand::Reg(Reg::Fixed(p), ty)
    }

    pub fn int(v: i32) -> Self {
        Operand::Const(Constant::Int(v))
    }

    pub fn addr(address: Address) -> Self {
        Operand::Addr(Box::new(address))
    }

    pub fn is_reg(&self) -> bool {
        matches!(self, Operand::Reg(..))
    }

    pub fn is_const(&self) -> bool {
        matches!(self, Operand::Const(_))
    }

    pub fn is_illegal(&self) -> bool {
        matches!(self, Operand::Illegal)
    }

    pub fn as_reg(&self) -> Option<Reg> {
        match self {
            Operand::Reg(r, _) => Some(*r),
            _ => None,
        }
    }

    pub fn as_const(&self) -> Option<Constant> {
        match self {
            Operand::Const(c) => Some(*c),
            _ => None,
        }
    }

    pub fn as_address(&self) -> Option<&Address> {
        match self {
            Operand::Addr(a) => Some(a),
            _ => None,
        }
    }

    pub fn ty(&self) -> BasicType {
        match self {
            Operand::Reg(_, ty) | Operand::Stack(_, ty) => *ty,
            Operand::Const(c) => c.basic_type(),
            Operand::Addr(a) => a.ty,
            Operand::Shifted(..) => BasicType::Int,
            Operand::Illegal => BasicType::Void,
        }
    }
}

impl fmt::Display for Operand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Operand::Reg(r, ty) => write!(f, "{}:{}", r, ty.suffix()),
            Operand::Const(c) => write!(f, "{}", c),
            Operand::Addr(a) => write!(f, "{}", a),
            Operand::Shifted(r, s) if *s >= 0 => write!(f, "({} lsl {})", r, s),
            Operand::Shifted(r, s) => write!(f, "({} asr {})", r, -s),
            Operand::Stack(slot, ty) => write!(f, "stack[{}]:{}", slot, ty.suffix()),
            Operand::Illegal => write!(f, "-"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_type_sizes_follow_word_size() {
        assert_eq!(BasicType::Object.size_bytes(4), 4);
        assert_eq!(BasicType::Object.size_bytes(8), 8);
        assert_eq!(BasicType::Char.log2_size(8), 1);
        assert_eq!(BasicType::Double.log2_size(4), 3);
        assert_eq!(BasicType::Long.word_count(4), 2);
        assert_eq!(BasicType::Long.word_count(8), 1);
    }

    #[test]
    fn test_constant_zero() {
        assert!(Constant::Null.is_zero());
        assert!(Constant::Double(0.0).is_zero());
        assert!(!Constant::Double(-0.0).is_zero());
        assert!(!Constant::Int(3).is_zero());
    }

    #[test]
    fn test_address_display() {
        let a = Address::new(
            Reg::Virtual(VReg(1)),
            Some(Reg::Virtual(VReg(2))),
            2,
            16,
            BasicType::Int,
        );
        assert_eq!(a.to_string(), "[R1 + R2 << 2 + 16]:i");
        let card = Address::new(
            Reg::Fixed(PReg::Lr),
            Some(Reg::Virtual(VReg(7))),
            -9,
            0,
            BasicType::Boolean,
        );
        assert_eq!(card.to_string(), "[lr + R7 >> 9]:z");
    }
}
