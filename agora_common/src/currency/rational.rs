use std::str::FromStr;

use num_bigint::BigInt;
use num_rational::BigRational;
use num_traits::{One, Pow};

/// Parses a decimal number (as printed by JSON encoders, e.g. `407.2`, `-0.5`, `1.25e-3`) into an exact rational.
///
/// Returns `None` if the text is not a finite decimal number.
pub fn parse_decimal_rational(text: &str) -> Option<BigRational> {
    let text = text.trim();
    let (mantissa, exponent) = match text.find(|c: char| c == 'e' || c == 'E') {
        Some(i) => (&text[..i], i32::from_str(&text[i + 1..]).ok()?),
        None => (text, 0),
    };
    let (negative, mantissa) = match mantissa.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, mantissa.strip_prefix('+').unwrap_or(mantissa)),
    };
    let (int_part, frac_part) = match mantissa.split_once('.') {
        Some((i, f)) => (i, f),
        None => (mantissa, ""),
    };
    if int_part.is_empty() && frac_part.is_empty() {
        return None;
    }
    if !int_part.chars().chain(frac_part.chars()).all(|c| c.is_ascii_digit()) {
        return None;
    }
    let digits = format!("{int_part}{frac_part}");
    let mut numer = BigInt::from_str(&digits).ok()?;
    if negative {
        numer = -numer;
    }
    let scale = exponent - i32::try_from(frac_part.len()).ok()?;
    let ten = BigInt::from(10u8);
    let value = if scale >= 0 {
        BigRational::from_integer(numer * Pow::pow(&ten, scale.unsigned_abs()))
    } else {
        BigRational::new(numer, Pow::pow(&ten, scale.unsigned_abs()))
    };
    Some(value)
}

/// `10^exp` as a rational, for any sign of `exp`.
pub(crate) fn power_of_ten(exp: i64) -> BigRational {
    let ten = BigInt::from(10u8);
    let magnitude = Pow::pow(&ten, exp.unsigned_abs());
    if exp >= 0 {
        BigRational::from_integer(magnitude)
    } else {
        BigRational::new(BigInt::one(), magnitude)
    }
}
