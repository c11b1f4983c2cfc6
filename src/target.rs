//! Target capability descriptors and per-family lowering strategies
//!
//! A [`TargetDescriptor`] is the data half: word size, which hardware units
//! exist, object layout offsets. The [`Isa`] trait is the behavioural half and
//! answers encoding questions (immediate envelopes, addressing-mode limits,
//! calling convention). One implementation exists per target family and is
//! picked once, when the compiler is configured.

use crate::encoding::{
    is_aarch64_arith_imm, is_imm_in_range, is_logical_imm, is_movw_imm, is_rotated_imm,
    is_unsigned_imm_in_range,
};
use crate::operand::{BasicType, Constant, Operand, PReg};
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TargetFamily {
    Arm32,
    Aarch64,
}

impl fmt::Display for TargetFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TargetFamily::Arm32 => write!(f, "arm32"),
            TargetFamily::Aarch64 => write!(f, "aarch64"),
        }
    }
}

/// What the target machine and runtime provide
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TargetDescriptor {
    pub family: TargetFamily,
    /// Bytes per machine word (4 or 8)
    pub word_size: u32,
    /// Hardware floating point unit; without it every float op is a runtime call
    pub hardware_float: bool,
    /// Hardware 32-bit integer divide
    pub hardware_int_divide: bool,
    /// 64-bit multiply/divide in hardware
    pub hardware_long_arith: bool,
    /// Longs can be compared and branched on directly
    pub direct_long_compare: bool,
    /// `movw`-style 16-bit immediate moves
    pub supports_movw: bool,
    /// Offset of the length field in an array header
    pub array_length_offset: i64,
    /// Size of the array header before element 0
    pub array_header_size: i64,
    /// Thread-local slot holding the card table base
    pub thread_card_table_offset: i64,
    /// Thread-local flag that is non-zero while concurrent marking runs
    pub thread_satb_active_offset: i64,
    /// Bytes per monitor slot in the frame
    pub monitor_slot_size: i64,
}

impl TargetDescriptor {
    /// 32-bit ARM with VFP and no integer divide
    pub fn arm32() -> Self {
        Self {
            family: TargetFamily::Arm32,
            word_size: 4,
            hardware_float: true,
            hardware_int_divide: false,
            hardware_long_arith: false,
            direct_long_compare: false,
            supports_movw: true,
            array_length_offset: 8,
            array_header_size: 12,
            thread_card_table_offset: 0x90,
            thread_satb_active_offset: 0x98,
            monitor_slot_size: 8,
        }
    }

    /// 32-bit ARM without any floating point hardware
    pub fn arm32_soft_float() -> Self {
        Self {
            hardware_float: false,
            ..Self::arm32()
        }
    }

    pub fn aarch64() -> Self {
        Self {
            family: TargetFamily::Aarch64,
            word_size: 8,
            hardware_float: true,
            hardware_int_divide: true,
            hardware_long_arith: true,
            direct_long_compare: true,
            supports_movw: false,
            array_length_offset: 12,
            array_header_size: 16,
            thread_card_table_offset: 0x110,
            thread_satb_active_offset: 0x118,
            monitor_slot_size: 16,
        }
    }

    /// Look up a preset by its command-line name
    pub fn by_name(name: &str) -> Option<Self> {
        match name {
            "arm32" => Some(Self::arm32()),
            "arm32-soft-float" => Some(Self::arm32_soft_float()),
            "aarch64" => Some(Self::aarch64()),
            _ => None,
        }
    }

    /// Strategy object for this family
    pub fn isa(&self) -> &'static dyn Isa {
        match self.family {
            TargetFamily::Arm32 => &Arm32Isa,
            TargetFamily::Aarch64 => &Aarch64Isa,
        }
    }

    /// Offset of element 0 for arrays of `elem`
    pub fn array_base_offset(&self, elem: BasicType) -> i64 {
        let size = elem.size_bytes(self.word_size) as i64;
        // elements are aligned to their own size
        (self.array_header_size + size - 1) / size * size
    }

    pub fn summary(&self) -> String {
        let mut features = vec![self.family.to_string()];
        if self.hardware_float {
            features.push("fpu".into());
        } else {
            features.push("soft-float".into());
        }
        if self.hardware_int_divide {
            features.push("idiv".into());
        }
        if self.hardware_long_arith {
            features.push("64-bit".into());
        }
        features.join(" ")
    }
}

/// Displacement envelope for one element type
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AddressLimits {
    /// Power-of-two bound on the displacement magnitude
    pub max_disp: i64,
    /// log2 of the required displacement alignment
    pub align: u32,
    /// `base + (index << shift)` fits in the load/store itself
    pub embedded_shift: bool,
}

/// Per-family encoding rules
pub trait Isa: Sync {
    fn family(&self) -> TargetFamily;

    /// Constant may be an arithmetic (add/sub/mul-by-const) operand
    fn can_inline_arith(&self, c: &Constant) -> bool;

    /// Constant may be the right-hand side of a compare (`cmp` or `cmn`)
    fn can_inline_cmp(&self, c: &Constant) -> bool;

    /// Constant may be the immediate of an and/or/xor
    fn can_inline_logic(&self, c: &Constant) -> bool;

    /// Constant may be stored to memory without a register
    fn can_store_as_constant(&self, c: &Constant) -> bool;

    /// A single move instruction materializes the constant
    fn can_move_immediate(&self, c: &Constant, desc: &TargetDescriptor) -> bool;

    /// Immediate pieces whose sum is `c`, each encodable in one add or sub,
    /// or `None` when the constant must be materialized into a register
    fn split_add_constant(&self, c: i64, ty: BasicType) -> Option<Vec<i64>>;

    fn address_limits(&self, ty: BasicType, word_size: u32) -> AddressLimits;

    fn disp_in_range(&self, disp: i64, limits: &AddressLimits) -> bool;

    /// Calling convention locations for runtime call arguments
    fn runtime_args(&self, tys: &[BasicType], desc: &TargetDescriptor) -> Vec<Operand>;

    /// Location of a runtime call or method result
    fn result_location(&self, ty: BasicType, desc: &TargetDescriptor) -> Operand;

    /// Scratch register clobbered by the card mark sequence
    fn card_scratch(&self) -> PReg {
        PReg::Lr
    }
}

#[derive(Debug, Clone, Copy)]
pub struct Arm32Isa;

#[derive(Debug, Clone, Copy)]
pub struct Aarch64Isa;

fn float_zero(c: &Constant) -> bool {
    matches!(c, Constant::Float(_) | Constant::Double(_)) && c.is_zero()
}

impl Isa for Arm32Isa {
    fn family(&self) -> TargetFamily {
        TargetFamily::Arm32
    }

    fn can_inline_arith(&self, c: &Constant) -> bool {
        match *c {
            Constant::Int(v) => is_rotated_imm(v as u32),
            Constant::Null => true,
            _ => float_zero(c),
        }
    }

    fn can_inline_cmp(&self, c: &Constant) -> bool {
        match *c {
            Constant::Int(v) => is_rotated_imm(v as u32) || is_rotated_imm(v.wrapping_neg() as u32),
            Constant::Null => true,
            _ => float_zero(c),
        }
    }

    fn can_inline_logic(&self, c: &Constant) -> bool {
        match *c {
            // bic covers the inverted form
            Constant::Int(v) => is_rotated_imm(v as u32) || is_rotated_imm(!v as u32),
            _ => false,
        }
    }

    fn can_store_as_constant(&self, _c: &Constant) -> bool {
        false
    }

    fn can_move_immediate(&self, c: &Constant, desc: &TargetDescriptor) -> bool {
        match c.as_i64() {
            Some(v) if c.basic_type() != BasicType::Long => {
                let word = v as u32;
                is_rotated_imm(word) || is_rotated_imm(!word) || (desc.supports_movw && is_movw_imm(v))
            }
            _ => true,
        }
    }

    fn split_add_constant(&self, c: i64, ty: BasicType) -> Option<Vec<i64>> {
        if ty == BasicType::Long {
            return None;
        }
        let word = c as u32;
        if word == 0 {
            return Some(Vec::new());
        }
        if is_rotated_imm(word) || is_rotated_imm(word.wrapping_neg()) {
            return Some(vec![word as i32 as i64]);
        }
        // up to four rotated byte pieces starting at the first non-zero even bit
        let mut shift = 0;
        while word & (3u32 << shift) == 0 {
            shift += 2;
        }
        let mask = 0xffu32 << shift;
        let mut pieces = Vec::with_capacity(4);
        for step in 0..4 {
            let piece = word & mask.checked_shl(8 * step).unwrap_or(0);
            if piece != 0 {
                pieces.push(piece as i32 as i64);
            }
        }
        Some(pieces)
    }

    fn address_limits(&self, ty: BasicType, _word_size: u32) -> AddressLimits {
        match ty {
            BasicType::Boolean | BasicType::Byte | BasicType::Char | BasicType::Short => {
                AddressLimits {
                    max_disp: 256,
                    align: 0,
                    embedded_shift: false,
                }
            }
            // vldr/vstr take a word-scaled offset
            BasicType::Float | BasicType::Double => AddressLimits {
                max_disp: 1024,
                align: 2,
                embedded_shift: false,
            },
            BasicType::Long => AddressLimits {
                max_disp: 4096,
                align: 0,
                embedded_shift: false,
            },
            _ => AddressLimits {
                max_disp: 4096,
                align: 0,
                embedded_shift: true,
            },
        }
    }

    fn disp_in_range(&self, disp: i64, limits: &AddressLimits) -> bool {
        -limits.max_disp < disp && disp < limits.max_disp && disp & ((1 << limits.align) - 1) == 0
    }

    fn runtime_args(&self, tys: &[BasicType], desc: &TargetDescriptor) -> Vec<Operand> {
        // soft-float ABI: everything travels in core registers, then the stack
        let mut next_word = 0u32;
        let mut locations = Vec::with_capacity(tys.len());
        for &ty in tys {
            let words = ty.word_count(desc.word_size);
            if words == 2 {
                next_word += next_word % 2;
            }
            if next_word + words <= 4 {
                locations.push(Operand::fixed(PReg::R(next_word as u8), ty));
            } else {
                locations.push(Operand::Stack(next_word - 4, ty));
            }
            next_word += words;
        }
        locations
    }

    fn result_location(&self, ty: BasicType, _desc: &TargetDescriptor) -> Operand {
        Operand::fixed(PReg::R(0), ty.stack_type())
    }
}

impl Isa for Aarch64Isa {
    fn family(&self) -> TargetFamily {
        TargetFamily::Aarch64
    }

    fn can_inline_arith(&self, c: &Constant) -> bool {
        match *c {
            Constant::Int(v) => is_aarch64_arith_imm(v as i64),
            Constant::Long(v) => is_aarch64_arith_imm(v),
            Constant::Null => true,
            _ => float_zero(c),
        }
    }

    fn can_inline_cmp(&self, c: &Constant) -> bool {
        match *c {
            Constant::Int(v) => {
                is_aarch64_arith_imm(v as i64) || is_aarch64_arith_imm(-(v as i64))
            }
            Constant::Long(v) => {
                is_aarch64_arith_imm(v) || v.checked_neg().map_or(false, is_aarch64_arith_imm)
            }
            Constant::Null => true,
            _ => float_zero(c),
        }
    }

    fn can_inline_logic(&self, c: &Constant) -> bool {
        match *c {
            Constant::Int(v) => is_logical_imm(v as u32 as u64, 32),
            Constant::Long(v) => is_logical_imm(v as u64, 64),
            _ => false,
        }
    }

    fn can_store_as_constant(&self, c: &Constant) -> bool {
        c.is_zero()
    }

    fn can_move_immediate(&self, _c: &Constant, _desc: &TargetDescriptor) -> bool {
        // movz/movn/movk or a literal pool load
        true
    }

    fn split_add_constant(&self, c: i64, _ty: BasicType) -> Option<Vec<i64>> {
        let magnitude = c.checked_abs()?;
        if magnitude >> 24 != 0 {
            return None;
        }
        let sign = c.signum();
        let low = magnitude & 0xfff;
        let high = magnitude & 0xfff000;
        Some(
            [low, high]
                .into_iter()
                .filter(|part| *part != 0)
                .map(|part| part * sign)
                .collect(),
        )
    }

    fn address_limits(&self, ty: BasicType, word_size: u32) -> AddressLimits {
        let align = ty.log2_size(word_size) as u32;
        AddressLimits {
            max_disp: 4096 << align,
            align,
            embedded_shift: true,
        }
    }

    fn disp_in_range(&self, disp: i64, limits: &AddressLimits) -> bool {
        // scaled unsigned 12-bit form, or the unscaled signed 9-bit form
        is_unsigned_imm_in_range(disp, 12, limits.align) || is_imm_in_range(disp, 9, 0)
    }

    fn runtime_args(&self, tys: &[BasicType], _desc: &TargetDescriptor) -> Vec<Operand> {
        let mut next_int = 0u8;
        let mut next_float = 0u8;
        let mut next_stack = 0u32;
        let mut locations = Vec::with_capacity(tys.len());
        for &ty in tys {
            let location = if ty.is_float() && next_float < 8 {
                next_float += 1;
                Operand::fixed(PReg::V(next_float - 1), ty)
            } else if !ty.is_float() && next_int < 8 {
                next_int += 1;
                Operand::fixed(PReg::R(next_int - 1), ty)
            } else {
                next_stack += 1;
                Operand::Stack(next_stack - 1, ty)
            };
            locations.push(location);
        }
        locations
    }

    fn result_location(&self, ty: BasicType, _desc: &TargetDescriptor) -> Operand {
        if ty.is_float() {
            Operand::fixed(PReg::V(0), ty)
        } else {
            Operand::fixed(PReg::R(0), ty.stack_type())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_presets() {
        let soft = TargetDescriptor::arm32_soft_float();
        assert!(!soft.hardware_float);
        assert_eq!(soft.word_size, 4);
        assert_eq!(soft.isa().family(), TargetFamily::Arm32);
        assert_eq!(
            TargetDescriptor::by_name("aarch64").map(|t| t.family),
            Some(TargetFamily::Aarch64)
        );
        assert!(TargetDescriptor::by_name("sparc").is_none());
        assert_eq!(TargetDescriptor::aarch64().summary(), "aarch64 fpu idiv 64-bit");
    }

    #[test]
    fn test_array_base_offset_alignment() {
        let arm = TargetDescriptor::arm32();
        assert_eq!(arm.array_base_offset(BasicType::Int), 12);
        assert_eq!(arm.array_base_offset(BasicType::Long), 16);
        assert_eq!(arm.array_base_offset(BasicType::Byte), 12);
        assert_eq!(TargetDescriptor::aarch64().array_base_offset(BasicType::Double), 16);
    }

    #[test]
    fn test_arm32_split_pieces_sum_and_encode() {
        let isa = Arm32Isa;
        for c in [0x1234_5678i64, -0x1234_5678, 0x101, 0x7fff_ffff, -1, 0x0003_0000] {
            let pieces = isa.split_add_constant(c, BasicType::Int).unwrap();
            assert!(pieces.len() <= 4);
            let sum = pieces.iter().fold(0i32, |acc, p| acc.wrapping_add(*p as i32));
            assert_eq!(sum, c as i32);
            for p in pieces {
                assert!(is_rotated_imm(p as u32) || is_rotated_imm((p as i32).wrapping_neg() as u32));
            }
        }
    }

    #[test]
    fn test_aarch64_split_add() {
        let isa = Aarch64Isa;
        assert_eq!(isa.split_add_constant(0x12345, BasicType::Long), Some(vec![0x345, 0x12000]));
        assert_eq!(isa.split_add_constant(-5, BasicType::Int), Some(vec![-5]));
        assert_eq!(isa.split_add_constant(0x100_0000, BasicType::Long), None);
    }

    #[test]
    fn test_inline_predicates_differ_per_family() {
        let c = Constant::Int(0xff0);
        assert!(Arm32Isa.can_inline_arith(&c));
        assert!(Aarch64Isa.can_inline_arith(&c));
        let big = Constant::Int(0x101);
        assert!(!Arm32Isa.can_inline_arith(&big));
        assert!(Aarch64Isa.can_inline_arith(&big));
        assert!(Aarch64Isa.can_inline_cmp(&Constant::Int(-7)));
        assert!(!Aarch64Isa.can_inline_arith(&Constant::Int(-7)));
        assert!(Aarch64Isa.can_inline_logic(&Constant::Int(0xff)));
        assert!(!Aarch64Isa.can_inline_logic(&Constant::Int(0x12345)));
    }

    #[test]
    fn test_arm32_float_displacement_is_word_aligned() {
        let isa = Arm32Isa;
        let limits = isa.address_limits(BasicType::Double, 4);
        assert!(isa.disp_in_range(1020, &limits));
        assert!(isa.disp_in_range(-8, &limits));
        assert!(!isa.disp_in_range(6, &limits));
        assert!(!isa.disp_in_range(1024, &limits));
        // core loads have no such constraint
        let limits = isa.address_limits(BasicType::Int, 4);
        assert!(isa.disp_in_range(6, &limits));
    }

    #[test]
    fn test_aarch64_displacement_rules() {
        let isa = Aarch64Isa;
        let limits = isa.address_limits(BasicType::Long, 8);
        assert_eq!(limits.max_disp, 4096 * 8);
        assert!(isa.disp_in_range(8 * 4095, &limits));
        assert!(!isa.disp_in_range(8 * 4096, &limits));
        assert!(isa.disp_in_range(12, &limits));
        assert!(!isa.disp_in_range(8 * 4096 + 4, &limits));
        assert!(isa.disp_in_range(-256, &limits));
        assert!(!isa.disp_in_range(-257, &limits));
    }

    #[test]
    fn test_runtime_args_pair_alignment() {
        let desc = TargetDescriptor::arm32();
        let locs = Arm32Isa.runtime_args(&[BasicType::Int, BasicType::Long, BasicType::Int], &desc);
        assert_eq!(locs[0], Operand::fixed(PReg::R(0), BasicType::Int));
        assert_eq!(locs[1], Operand::fixed(PReg::R(2), BasicType::Long));
        assert_eq!(locs[2], Operand::Stack(0, BasicType::Int));
    }
}
