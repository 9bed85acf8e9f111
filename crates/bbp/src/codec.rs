//! Portable, lossless byte and decimal encodings for [`rug::Float`] values.
//!
//! The byte layout is `[exp: i32 LE][sign: u8][magnitude, MSB first]` where
//! `value = sign · magnitude · 2^exp`. The magnitude is the exact significand,
//! so a round-trip at the same precision is bit-identical. Decoding validates
//! the layout strictly; results arriving off the wire are untrusted bytes and
//! a malformed buffer must be reported, not folded into the aggregate.

use std::cmp::Ordering;

use rug::integer::Order;
use rug::{Float, Integer};
use thiserror::Error;

use crate::BITS_PER_DECIMAL_DIGIT;

const SIGN_ZERO: u8 = 0;
const SIGN_POS: u8 = 1;
const SIGN_NEG: u8 = 2;

/// Errors produced when decoding an encoded float.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum FloatCodecError {
    /// The buffer is shorter than the fixed header.
    #[error("encoded float truncated ({0} bytes)")]
    Truncated(usize),

    /// The sign tag is not one of the three defined values.
    #[error("invalid sign tag {0:#04x}")]
    BadSignTag(u8),

    /// A zero value must have an empty magnitude and a zero exponent.
    #[error("non-canonical zero encoding")]
    NonCanonicalZero,

    /// The magnitude has a leading zero byte or is empty for a nonzero sign.
    #[error("non-canonical magnitude")]
    NonCanonicalMagnitude,

    /// The significand needs more bits than the declared precision.
    #[error("significand of {bits} bits exceeds declared precision {prec}")]
    PrecisionOverflow {
        /// Significant bits found in the magnitude.
        bits: u32,
        /// Precision the sender claimed is sufficient.
        prec: u32,
    },

    /// The declared precision is outside the supported range.
    #[error("unsupported precision {0}")]
    UnsupportedPrecision(u32),

    /// The decimal string did not parse as a finite number.
    #[error("invalid decimal string")]
    BadDecimal,
}

/// Encode a finite float losslessly.
///
/// Non-finite values have no wire representation and encode as zero; the
/// range sums this system produces are always finite.
pub fn encode_float(value: &Float) -> Vec<u8> {
    let (mantissa, exp) = value.to_integer_exp().unwrap_or((Integer::new(), 0));

    let sign = match mantissa.cmp0() {
        Ordering::Equal => SIGN_ZERO,
        Ordering::Greater => SIGN_POS,
        Ordering::Less => SIGN_NEG,
    };
    let exp = if sign == SIGN_ZERO { 0 } else { exp };
    let magnitude = mantissa.to_digits::<u8>(Order::MsfBe);

    let mut out = Vec::with_capacity(5 + magnitude.len());
    out.extend_from_slice(&exp.to_le_bytes());
    out.push(sign);
    out.extend_from_slice(&magnitude);
    out
}

/// Decode bytes produced by [`encode_float`] into a float of `prec` bits.
///
/// `prec` must be at least the significand width for the decode to be exact;
/// anything less is rejected rather than silently rounded.
pub fn decode_float(bytes: &[u8], prec: u32) -> Result<Float, FloatCodecError> {
    if !(2..=rug::float::prec_max()).contains(&prec) {
        return Err(FloatCodecError::UnsupportedPrecision(prec));
    }
    if bytes.len() < 5 {
        return Err(FloatCodecError::Truncated(bytes.len()));
    }

    let mut exp_raw = [0u8; 4];
    exp_raw.copy_from_slice(&bytes[..4]);
    let exp = i32::from_le_bytes(exp_raw);
    let sign = bytes[4];
    let magnitude = &bytes[5..];

    match sign {
        SIGN_ZERO => {
            if !magnitude.is_empty() || exp != 0 {
                return Err(FloatCodecError::NonCanonicalZero);
            }
            return Ok(Float::new(prec));
        }
        SIGN_POS | SIGN_NEG => {}
        other => return Err(FloatCodecError::BadSignTag(other)),
    }

    if magnitude.is_empty() || magnitude[0] == 0 {
        return Err(FloatCodecError::NonCanonicalMagnitude);
    }

    let significand = Integer::from_digits(magnitude, Order::MsfBe);
    let bits = significand.significant_bits();
    if bits > prec {
        return Err(FloatCodecError::PrecisionOverflow { bits, prec });
    }

    let mut value = Float::with_val(prec, &significand);
    if sign == SIGN_NEG {
        value = -value;
    }
    value <<= exp;
    Ok(value)
}

/// Render a float as a plain positional decimal string with enough digits to
/// round-trip bit-exactly at the same precision.
pub fn to_decimal_string(value: &Float) -> String {
    if value.is_zero() {
        return String::from("0");
    }

    let digits = (f64::from(value.prec()) / BITS_PER_DECIMAL_DIGIT).ceil() as usize + 2;
    let (neg, raw, exp) = value.to_sign_string_exp(10, Some(digits));

    let Some(exp) = exp else {
        // Non-finite, which the aggregate never is.
        return String::from("0");
    };

    let mut out = String::with_capacity(raw.len() + 4);
    if neg {
        out.push('-');
    }
    if exp <= 0 {
        out.push_str("0.");
        for _ in 0..exp.unsigned_abs() {
            out.push('0');
        }
        out.push_str(&raw);
    } else {
        let point = exp as usize;
        if point >= raw.len() {
            out.push_str(&raw);
            for _ in 0..point - raw.len() {
                out.push('0');
            }
        } else {
            out.push_str(&raw[..point]);
            out.push('.');
            out.push_str(&raw[point..]);
        }
    }
    out
}

/// Parse a decimal string produced by [`to_decimal_string`] at `prec` bits.
pub fn from_decimal_string(s: &str, prec: u32) -> Result<Float, FloatCodecError> {
    if !(2..=rug::float::prec_max()).contains(&prec) {
        return Err(FloatCodecError::UnsupportedPrecision(prec));
    }
    let parsed = Float::parse(s).map_err(|_| FloatCodecError::BadDecimal)?;
    let value = Float::with_val(prec, parsed);
    if !value.is_finite() {
        return Err(FloatCodecError::BadDecimal);
    }
    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::partial_sum;

    fn roundtrip(value: &Float) -> Float {
        decode_float(&encode_float(value), value.prec()).unwrap()
    }

    #[test]
    fn byte_roundtrip_is_identical() {
        for value in [
            Float::with_val(64, 0),
            Float::with_val(64, 1),
            Float::with_val(64, -1.5),
            Float::with_val(200, 1e-77_f64),
            partial_sum(0, 10, 1_000),
            partial_sum(40, 25, 33_000),
        ] {
            let back = roundtrip(&value);
            assert_eq!(back.prec(), value.prec());
            assert!(back == value, "{value} != {back}");
        }
    }

    #[test]
    fn decode_rejects_malformed_buffers() {
        assert_eq!(decode_float(&[], 64), Err(FloatCodecError::Truncated(0)));
        assert_eq!(
            decode_float(&[0, 0, 0, 0], 64),
            Err(FloatCodecError::Truncated(4))
        );
        assert_eq!(
            decode_float(&[0, 0, 0, 0, 0xff, 1], 64),
            Err(FloatCodecError::BadSignTag(0xff))
        );
        // Zero with a trailing magnitude.
        assert_eq!(
            decode_float(&[0, 0, 0, 0, 0, 7], 64),
            Err(FloatCodecError::NonCanonicalZero)
        );
        // Positive sign with an empty magnitude.
        assert_eq!(
            decode_float(&[0, 0, 0, 0, 1], 64),
            Err(FloatCodecError::NonCanonicalMagnitude)
        );
        // Leading zero byte in the magnitude.
        assert_eq!(
            decode_float(&[0, 0, 0, 0, 1, 0, 3], 64),
            Err(FloatCodecError::NonCanonicalMagnitude)
        );
    }

    #[test]
    fn decode_rejects_undersized_precision() {
        let value = partial_sum(0, 5, 256);
        let bytes = encode_float(&value);
        match decode_float(&bytes, 64) {
            Err(FloatCodecError::PrecisionOverflow { bits, prec: 64 }) => {
                assert!(bits > 64);
            }
            other => panic!("expected precision overflow, got {other:?}"),
        }
    }

    #[test]
    fn decode_rejects_silly_precisions() {
        let bytes = encode_float(&Float::with_val(64, 3));
        assert_eq!(
            decode_float(&bytes, 0),
            Err(FloatCodecError::UnsupportedPrecision(0))
        );
    }

    #[test]
    fn decimal_roundtrip_is_identical() {
        for value in [
            Float::with_val(64, 0),
            Float::with_val(64, -42),
            Float::with_val(100, 1) / Float::with_val(100, 3),
            partial_sum(0, 20, 2_000),
        ] {
            let text = to_decimal_string(&value);
            let back = from_decimal_string(&text, value.prec()).unwrap();
            assert!(back == value, "{text} parsed to {back}");
        }
    }

    #[test]
    fn decimal_rendering_is_positional() {
        let text = to_decimal_string(&partial_sum(0, 8, 256));
        assert!(text.starts_with("3.14159265"), "got {text}");
        assert!(!text.contains(['e', 'E', '@']), "got {text}");

        let tiny = to_decimal_string(&Float::with_val(64, 0.03125f64));
        assert!(tiny.starts_with("0.03125"), "got {tiny}");
    }
}
