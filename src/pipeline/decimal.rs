//! Exact fixed-precision decimals for feed values
//!
//! FIRMS publishes coordinates and radiometric values as plain decimal text.
//! Detection identity is keyed on the coordinates exactly as published, so
//! they are never routed through `f64` for comparison. `FixedDecimal` keeps
//! the value as an integer mantissa plus a decimal scale, normalized so that
//! `51.10` and `51.1` are the same value.

use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Maximum number of fractional digits accepted from a feed value
pub const MAX_SCALE: u32 = 12;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecimalError {
    #[error("empty decimal value")]
    Empty,
    #[error("invalid decimal value '{0}'")]
    Invalid(String),
    #[error("decimal value '{0}' exceeds supported precision")]
    Overflow(String),
}

/// Normalized fixed-point decimal: `units * 10^-scale`
///
/// Trailing fractional zeros are always stripped, so derived `Eq`/`Hash`
/// are value equality.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FixedDecimal {
    units: i64,
    scale: u32,
}

impl FixedDecimal {
    pub const ZERO: FixedDecimal = FixedDecimal { units: 0, scale: 0 };

    fn normalized(mut units: i64, mut scale: u32) -> Self {
        while scale > 0 && units % 10 == 0 {
            units /= 10;
            scale -= 1;
        }
        if units == 0 {
            scale = 0;
        }
        Self { units, scale }
    }

    pub fn is_zero(&self) -> bool {
        self.units == 0
    }

    /// Absolute difference, computed exactly
    pub fn abs_diff(&self, other: &FixedDecimal) -> FixedDecimal {
        let scale = self.scale.max(other.scale);
        let a = self.widened(scale);
        let b = other.widened(scale);
        let diff = (a - b).abs();
        // Both inputs fit in i64 at their own scale; the difference of two
        // coordinates can only overflow for absurd magnitudes.
        let units = i64::try_from(diff).unwrap_or(i64::MAX);
        FixedDecimal::normalized(units, scale)
    }

    /// Lossy conversion for geometry tests and approximate store queries
    pub fn to_f64(&self) -> f64 {
        self.units as f64 / 10f64.powi(self.scale as i32)
    }

    fn widened(&self, scale: u32) -> i128 {
        self.units as i128 * 10i128.pow(scale - self.scale)
    }
}

impl Default for FixedDecimal {
    fn default() -> Self {
        Self::ZERO
    }
}

impl Ord for FixedDecimal {
    fn cmp(&self, other: &Self) -> Ordering {
        let scale = self.scale.max(other.scale);
        self.widened(scale).cmp(&other.widened(scale))
    }
}

impl PartialOrd for FixedDecimal {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl FromStr for FixedDecimal {
    type Err = DecimalError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        let s = raw.trim();
        if s.is_empty() {
            return Err(DecimalError::Empty);
        }

        let (negative, digits) = match s.as_bytes()[0] {
            b'-' => (true, &s[1..]),
            b'+' => (false, &s[1..]),
            _ => (false, s),
        };

        let (int_part, frac_part) = match digits.split_once('.') {
            Some((i, f)) => (i, f),
            None => (digits, ""),
        };

        if int_part.is_empty() && frac_part.is_empty() {
            return Err(DecimalError::Invalid(raw.to_string()));
        }
        if !int_part.bytes().all(|b| b.is_ascii_digit())
            || !frac_part.bytes().all(|b| b.is_ascii_digit())
        {
            return Err(DecimalError::Invalid(raw.to_string()));
        }

        // Trailing zeros carry no value; drop them before the precision check
        let frac_trimmed = frac_part.trim_end_matches('0');
        if frac_trimmed.len() as u32 > MAX_SCALE {
            return Err(DecimalError::Overflow(raw.to_string()));
        }

        let mut units: i64 = 0;
        for b in int_part.bytes().chain(frac_trimmed.bytes()) {
            units = units
                .checked_mul(10)
                .and_then(|u| u.checked_add((b - b'0') as i64))
                .ok_or_else(|| DecimalError::Overflow(raw.to_string()))?;
        }
        if negative {
            units = -units;
        }

        Ok(FixedDecimal::normalized(units, frac_trimmed.len() as u32))
    }
}

impl fmt::Display for FixedDecimal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.scale == 0 {
            return write!(f, "{}", self.units);
        }
        let sign = if self.units < 0 { "-" } else { "" };
        let abs = self.units.unsigned_abs();
        let divisor = 10u64.pow(self.scale);
        write!(
            f,
            "{}{}.{:0width$}",
            sign,
            abs / divisor,
            abs % divisor,
            width = self.scale as usize
        )
    }
}
