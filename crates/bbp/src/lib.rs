#![deny(missing_docs)]
#![deny(unreachable_pub)]

//! Bailey–Borwein–Plouffe arithmetic on arbitrary-precision binary floats.
//!
//! Each BBP term is independent of every other, so a contiguous term range
//! `[first_term, first_term + num_terms)` can be summed on any machine and the
//! partial sums added together in any order. This crate computes those sums
//! and provides the portable byte encoding used to ship them around and to
//! persist them.

mod codec;

pub use codec::{
    FloatCodecError, decode_float, encode_float, from_decimal_string, to_decimal_string,
};

use rug::Float;

/// Decimal digits each job is expected to contribute, used as a safety margin
/// when sizing the working precision.
pub const TARGET_DIGITS_PER_JOB: u32 = 10_000;

/// Bits of binary mantissa per decimal digit, `1 / log10(2)`.
pub const BITS_PER_DECIMAL_DIGIT: f64 = 3.32193;

/// Working precision, in mantissa bits, for a job of `num_terms` terms.
///
/// `3 · ⌈log₂(N) + 10000 / log₁₀(2)⌉`: enough bits for the target decimal
/// digits, a log term for the range length, and a 3× multiplier to absorb
/// accumulation error across the range sum.
pub fn job_precision(num_terms: u64) -> u32 {
    let n = num_terms.max(1) as f64;
    let bits = (n.log2() + f64::from(TARGET_DIGITS_PER_JOB) * BITS_PER_DECIMAL_DIGIT).ceil();
    (bits as u32).saturating_mul(3)
}

/// One BBP term at `prec` mantissa bits:
///
/// `T(k) = 16^(-k) · (4/(8k+1) − 2/(8k+4) − 1/(8k+5) − 1/(8k+6))`
///
/// The `16^(-k)` factor is a right-shift by `4k` bits, which is exact.
pub fn bbp_term(k: u64, prec: u32) -> Float {
    let k8 = 8 * k;

    let mut term = Float::with_val(prec, 4u32) / Float::with_val(prec, k8 + 1);
    term -= Float::with_val(prec, 2u32) / Float::with_val(prec, k8 + 4);
    term -= Float::with_val(prec, 1u32) / Float::with_val(prec, k8 + 5);
    term -= Float::with_val(prec, 1u32) / Float::with_val(prec, k8 + 6);

    // Ranges large enough to overflow the shift would underflow to zero anyway.
    term >>= u32::try_from(4 * k).unwrap_or(u32::MAX);
    term
}

/// Sum of the BBP terms in `[first_term, first_term + num_terms)`.
///
/// Terms are evaluated at `prec` bits and accumulated into a sum carried at
/// `2 · prec` bits so the accumulator never dominates the rounding error.
pub fn partial_sum(first_term: u64, num_terms: u64, prec: u32) -> Float {
    let mut sum = Float::new(prec.saturating_mul(2));
    for k in first_term..first_term.saturating_add(num_terms) {
        sum += bbp_term(k, prec);
    }
    sum
}

#[cfg(test)]
mod tests {
    use super::*;

    const PI_50: &str = "3.14159265358979323846264338327950288419716939937511";

    #[test]
    fn job_precision_scales_with_target_digits() {
        // 10_000 digits · 3.32193 bits ≈ 33_220 bits, tripled.
        let p = job_precision(5_000);
        assert!(p > 99_000 && p < 100_500, "unexpected precision {p}");

        // Zero terms must not panic on log2(0).
        assert!(job_precision(0) > 0);

        // More terms never means fewer bits.
        assert!(job_precision(1_000_000) >= job_precision(10));
    }

    #[test]
    fn first_term_matches_closed_form() {
        // T(0) = 4 - 2/4 - 1/5 - 1/6 = 47/15.
        let term = bbp_term(0, 128);
        let expected = Float::with_val(128, 47u32) / Float::with_val(128, 15u32);
        let diff = Float::with_val(128, &term - &expected).abs();
        assert!(diff < Float::with_val(128, 1e-30), "T(0) = {term}");
    }

    #[test]
    fn partial_sums_converge_to_pi() {
        let pi = Float::with_val(256, Float::parse(PI_50).unwrap());

        let sum = partial_sum(0, 12, 256);
        let diff = Float::with_val(256, &sum - &pi).abs();
        // 12 terms of a base-16 series: well under 16^-10.
        assert!(diff < Float::with_val(256, 1e-12_f64), "sum = {sum}");
    }

    #[test]
    fn split_ranges_sum_to_the_full_range() {
        let whole = partial_sum(0, 40, 512);
        let mut pieces = partial_sum(0, 10, 512);
        pieces += partial_sum(10, 10, 512);
        pieces += partial_sum(20, 20, 512);

        let diff = Float::with_val(1024, &whole - &pieces).abs();
        assert!(diff < Float::with_val(64, 1e-100_f64), "diff = {diff}");
    }
}
