//! Size value objects: quota sizes and orchestrator resource quantities

use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::Sub;
use std::str::FromStr;

use crate::{Error, Result};

/// Bytes of an ephemeral-storage request held back from the quota for
/// filesystem metadata of the writable layer.
pub const EPHEMERAL_STORAGE_RESERVATION: QuotaSize = QuotaSize::from_mb(1);

/// Size of the basic block unit used by the kernel quota interface
pub const BASIC_BLOCK_SIZE: u64 = 512;

/// Disk size value object with compile-time unit safety
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, Default)]
#[repr(transparent)]
#[serde(transparent)]
pub struct QuotaSize(u64); // bytes

impl QuotaSize {
    /// Create from bytes
    #[must_use]
    pub const fn from_bytes(bytes: u64) -> Self {
        Self(bytes)
    }

    /// Create from kibibytes
    #[must_use]
    pub const fn from_kb(kb: u64) -> Self {
        Self(kb.saturating_mul(1024))
    }

    /// Create from mebibytes
    #[must_use]
    pub const fn from_mb(mb: u64) -> Self {
        Self(mb.saturating_mul(1024).saturating_mul(1024))
    }

    /// Create from gibibytes
    #[must_use]
    pub const fn from_gb(gb: u64) -> Self {
        Self(
            gb.saturating_mul(1024)
                .saturating_mul(1024)
                .saturating_mul(1024),
        )
    }

    /// Get value in bytes
    #[must_use]
    pub const fn as_bytes(self) -> u64 {
        self.0
    }

    /// Get value in 512-byte basic blocks, rounded up
    #[must_use]
    pub const fn as_basic_blocks(self) -> u64 {
        self.0.div_ceil(BASIC_BLOCK_SIZE)
    }

    /// Whether this size means "no limit"
    #[must_use]
    pub const fn is_zero(self) -> bool {
        self.0 == 0
    }

    /// Subtract, returning `None` instead of saturating at zero
    #[must_use]
    pub const fn checked_sub(self, rhs: Self) -> Option<Self> {
        match self.0.checked_sub(rhs.0) {
            Some(v) => Some(Self(v)),
            None => None,
        }
    }

    /// Get value in gibibytes
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn as_gb(self) -> f64 {
        self.0 as f64 / (1024.0 * 1024.0 * 1024.0)
    }

    /// Get value in mebibytes
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn as_mb(self) -> f64 {
        self.0 as f64 / (1024.0 * 1024.0)
    }
}

impl Sub for QuotaSize {
    type Output = Self;

    fn sub(self, rhs: Self) -> Self {
        Self(self.0.saturating_sub(rhs.0))
    }
}

impl From<Quantity> for QuotaSize {
    fn from(q: Quantity) -> Self {
        Self(q.value())
    }
}

impl fmt::Display for QuotaSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        const GB: u64 = 1024 * 1024 * 1024;
        const MB: u64 = 1024 * 1024;

        if self.0 >= GB {
            write!(f, "{:.2} GiB", self.as_gb())
        } else if self.0 >= MB {
            write!(f, "{:.2} MiB", self.as_mb())
        } else {
            write!(f, "{} bytes", self.0)
        }
    }
}

/// A limit to enforce on one project
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuotaSpec {
    /// Byte limit; zero clears the limit
    pub size: QuotaSize,
}

impl QuotaSpec {
    /// Limit to `size`
    #[must_use]
    pub const fn new(size: QuotaSize) -> Self {
        Self { size }
    }

    /// No limit
    #[must_use]
    pub const fn unlimited() -> Self {
        Self {
            size: QuotaSize::from_bytes(0),
        }
    }
}

/// Orchestrator resource quantity, resolved to whole units
///
/// Accepts the Kubernetes quantity grammar: a decimal number followed by a
/// binary suffix (`Ki`..`Ei`), a decimal suffix (`n`, `u`, `m`, `k`..`E`) or
/// a decimal exponent (`e3`, `E-2`). Fractional results round up.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "QuantityRepr", into = "String")]
pub struct Quantity(u64);

/// Quantities arrive as strings from the API and as numbers from hand-written
/// manifests.
#[derive(Deserialize)]
#[serde(untagged)]
enum QuantityRepr {
    Text(String),
    Number(u64),
}

impl TryFrom<QuantityRepr> for Quantity {
    type Error = Error;

    fn try_from(repr: QuantityRepr) -> Result<Self> {
        match repr {
            QuantityRepr::Text(s) => s.parse(),
            QuantityRepr::Number(n) => Ok(Self(n)),
        }
    }
}

impl From<Quantity> for String {
    fn from(q: Quantity) -> Self {
        q.0.to_string()
    }
}

impl Quantity {
    /// Create from whole units
    #[must_use]
    pub const fn from_value(value: u64) -> Self {
        Self(value)
    }

    /// Whole units, rounded up
    #[must_use]
    pub const fn value(self) -> u64 {
        self.0
    }

    fn invalid(input: &str, reason: &str) -> Error {
        Error::resource(format!("invalid quantity {input:?}: {reason}"))
    }

    /// Split a quantity into its numeric part and its suffix
    fn split(input: &str) -> (&str, &str) {
        let end = input
            .find(|c: char| !(c.is_ascii_digit() || c == '.' || c == '+' || c == '-'))
            .unwrap_or(input.len());
        input.split_at(end)
    }

    /// Returns `(multiplier, decimal exponent)` for a suffix
    fn scale(input: &str, suffix: &str) -> Result<(u128, i32)> {
        let scale = match suffix {
            "" => (1, 0),
            "Ki" => (1 << 10, 0),
            "Mi" => (1 << 20, 0),
            "Gi" => (1 << 30, 0),
            "Ti" => (1 << 40, 0),
            "Pi" => (1 << 50, 0),
            "Ei" => (1 << 60, 0),
            "n" => (1, -9),
            "u" => (1, -6),
            "m" => (1, -3),
            "k" => (1, 3),
            "M" => (1, 6),
            "G" => (1, 9),
            "T" => (1, 12),
            "P" => (1, 15),
            "E" => (1, 18),
            exp if exp.starts_with(['e', 'E']) => {
                let exponent: i32 = exp[1..]
                    .parse()
                    .map_err(|_| Self::invalid(input, "malformed exponent"))?;
                if exponent.abs() > 30 {
                    return Err(Self::invalid(input, "exponent out of range"));
                }
                (1, exponent)
            }
            _ => return Err(Self::invalid(input, "unknown suffix")),
        };
        Ok(scale)
    }
}

impl FromStr for Quantity {
    type Err = Error;

    fn from_str(input: &str) -> Result<Self> {
        let trimmed = input.trim();
        let (number, suffix) = Self::split(trimmed);

        let number = number.strip_prefix('+').unwrap_or(number);
        if number.starts_with('-') {
            return Err(Self::invalid(input, "negative quantities are not sizes"));
        }

        let (whole, fraction) = number.split_once('.').unwrap_or((number, ""));
        if whole.is_empty() && fraction.is_empty() {
            return Err(Self::invalid(input, "missing number"));
        }
        if !whole.bytes().chain(fraction.bytes()).all(|b| b.is_ascii_digit()) {
            return Err(Self::invalid(input, "malformed number"));
        }
        if whole.len() + fraction.len() > 30 {
            return Err(Self::invalid(input, "too many digits"));
        }

        let mantissa: u128 = format!("{whole}{fraction}")
            .parse()
            .map_err(|_| Self::invalid(input, "malformed number"))?;
        let (multiplier, exponent) = Self::scale(input, suffix)?;

        #[allow(clippy::cast_possible_wrap, clippy::cast_possible_truncation)]
        let exponent = exponent - fraction.len() as i32;
        let scaled = mantissa
            .checked_mul(multiplier)
            .ok_or_else(|| Self::invalid(input, "overflow"))?;

        let value = if exponent >= 0 {
            10u128
                .checked_pow(exponent.unsigned_abs())
                .and_then(|p| scaled.checked_mul(p))
                .ok_or_else(|| Self::invalid(input, "overflow"))?
        } else {
            let divisor = 10u128
                .checked_pow(exponent.unsigned_abs())
                .ok_or_else(|| Self::invalid(input, "overflow"))?;
            scaled.div_ceil(divisor)
        };

        u64::try_from(value)
            .map(Self)
            .map_err(|_| Self::invalid(input, "overflow"))
    }
}

impl fmt::Display for Quantity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
