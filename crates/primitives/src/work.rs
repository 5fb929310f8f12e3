//! Proof-of-work accounting from compact difficulty targets.

use primitive_types::U256;

/// Expands a compact `bits` value. Negative, zero and overflowing targets
/// yield `None`.
pub fn compact_to_target(bits: u32) -> Option<U256> {
    let exponent = bits >> 24;
    let mantissa = bits & 0x007f_ffff;
    if mantissa == 0 || bits & 0x0080_0000 != 0 {
        return None;
    }
    if exponent > 34
        || (mantissa > 0xff && exponent > 33)
        || (mantissa > 0xffff && exponent > 32)
    {
        return None;
    }
    let mantissa = U256::from(mantissa);
    let target = if exponent <= 3 {
        mantissa >> (8 * (3 - exponent) as usize)
    } else {
        mantissa << (8 * (exponent - 3) as usize)
    };
    if target.is_zero() {
        None
    } else {
        Some(target)
    }
}

/// Expected hashes for a header at `bits`: 2^256 / (target + 1).
pub fn work_from_bits(bits: u32) -> U256 {
    match compact_to_target(bits) {
        // 2^256 does not fit, so use (~target / (target + 1)) + 1.
        Some(target) => (!target / (target + U256::one())) + U256::one(),
        None => U256::zero(),
    }
}
