//! Immediate encodability predicates
//!
//! Pure bit-twiddling answers to "can this value sit in the instruction
//! itself". The target strategies in [`crate::target`] combine these per opcode
//! family.

/// AArch64 add/sub immediate: 12 bits, optionally shifted left by 12
pub fn is_aarch64_arith_imm(value: i64) -> bool {
    if value < 0 {
        return false;
    }
    value < (1 << 12) || (value & 0xfff == 0 && (value >> 12) < (1 << 12))
}

/// ARM32 data-processing immediate: an 8-bit value rotated right by an even amount
pub fn is_rotated_imm(value: u32) -> bool {
    (0..16).any(|r| value.rotate_left(2 * r) <= 0xff)
}

/// ARM32 `movw` immediate
pub fn is_movw_imm(value: i64) -> bool {
    (0..=0xffff).contains(&value)
}

/// AArch64 bitmask immediate for AND/ORR/EOR
///
/// The value must be a replicated element of 2, 4, .., 64 bits whose pattern is
/// a rotated run of ones. All-zeros and all-ones are not encodable.
pub fn is_logical_imm(value: u64, width: u32) -> bool {
    let imm = if width == 32 {
        let low = value & 0xffff_ffff;
        low | (low << 32)
    } else {
        value
    };
    if imm == 0 || imm == u64::MAX {
        return false;
    }

    let mut size = 64u32;
    while size > 2 {
        let half = size / 2;
        let mask = (1u64 << half) - 1;
        if imm & mask != (imm >> half) & mask {
            break;
        }
        size = half;
    }

    let mask = if size == 64 {
        u64::MAX
    } else {
        (1u64 << size) - 1
    };
    let elem = imm & mask;
    is_shifted_mask(elem) || is_shifted_mask(!elem & mask)
}

/// Non-empty contiguous run of ones, possibly shifted
fn is_shifted_mask(v: u64) -> bool {
    if v == 0 {
        return false;
    }
    let filled = (v - 1) | v;
    filled & filled.wrapping_add(1) == 0
}

/// `value` is a multiple of `1 << align` and `value >> align` fits `bits` unsigned bits
pub fn is_unsigned_imm_in_range(value: i64, bits: u32, align: u32) -> bool {
    if value < 0 || value & ((1i64 << align) - 1) != 0 {
        return false;
    }
    (value >> align) < (1i64 << bits)
}

/// `value` is a multiple of `1 << align` and `value >> align` fits `bits` signed bits
pub fn is_imm_in_range(value: i64, bits: u32, align: u32) -> bool {
    if value & ((1i64 << align) - 1) != 0 {
        return false;
    }
    let scaled = value >> align;
    let limit = 1i64 << (bits - 1);
    (-limit..limit).contains(&scaled)
}

pub fn is_power_of_2(value: i64) -> bool {
    value > 0 && value & (value - 1) == 0
}

/// log2 of a positive power of two
pub fn exact_log2(value: i64) -> Option<u8> {
    if is_power_of_2(value) {
        Some(value.trailing_zeros() as u8)
    } else {
        None
    }
}
