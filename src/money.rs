//! Fixed-precision decimal arithmetic for EUR and crypto unit amounts.
//!
//! `Money` never uses binary floating point. All values round-trip through decimal
//! string form so repeated (de)serialization cannot introduce drift.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Fractional digits retained internally. Enough for the 18-decimal precision some
/// chains use for native unit amounts (e.g. wei).
pub const MONEY_SCALE: u32 = 18;

/// Output precision for rendered reports (EUR has two decimal places).
pub const DISPLAY_SCALE: u32 = 2;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum MoneyError {
    #[error("could not parse {0:?} as a decimal amount")]
    Parse(String),

    #[error("arithmetic overflow")]
    ArithmeticOverflow,

    #[error("division by zero")]
    DivisionByZero,
}

/// A fixed-point decimal amount, scaled to [`MONEY_SCALE`] fractional digits.
///
/// Closed under addition, subtraction, and multiplication by a [`Rate`]. There is
/// no `Money * Money`: two monetary values cannot be sensibly multiplied together,
/// only a dimensionless rate can scale one.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Money(Decimal);

/// A dimensionless ratio, e.g. a unit price or an exchange rate.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rate(Decimal);

impl Money {
    pub fn zero() -> Self {
        Self(Decimal::ZERO)
    }

    pub fn one() -> Self {
        Self(Decimal::ONE)
    }

    /// Parses a decimal string. Rejects scientific notation and any trailing
    /// garbage; the entire string must be a plain decimal number.
    pub fn parse(s: &str) -> Result<Self, MoneyError> {
        let trimmed = s.trim();

        if trimmed.contains(['e', 'E']) {
            return Err(MoneyError::Parse(s.to_owned()));
        }

        let decimal =
            Decimal::from_str(trimmed).map_err(|_| MoneyError::Parse(s.to_owned()))?;

        Ok(Self(rescale(decimal)))
    }

    pub fn from_decimal(decimal: Decimal) -> Self {
        Self(rescale(decimal))
    }

    pub fn to_decimal(self) -> Decimal {
        self.0
    }

    pub fn is_zero(self) -> bool {
        self.0.is_zero()
    }

    pub fn is_positive(self) -> bool {
        self.0.is_sign_positive() && !self.0.is_zero()
    }

    pub fn is_negative(self) -> bool {
        self.0.is_sign_negative() && !self.0.is_zero()
    }

    pub fn abs(self) -> Self {
        Self(self.0.abs())
    }

    pub fn neg(self) -> Self {
        Self(-self.0)
    }

    pub fn add(self, other: Self) -> Result<Self, MoneyError> {
        self.0
            .checked_add(other.0)
            .map(Self)
            .ok_or(MoneyError::ArithmeticOverflow)
    }

    pub fn sub(self, other: Self) -> Result<Self, MoneyError> {
        self.0
            .checked_sub(other.0)
            .map(Self)
            .ok_or(MoneyError::ArithmeticOverflow)
    }

    /// `Money * Rate -> Money`. The only multiplication `Money` permits.
    pub fn mul_rate(self, rate: Rate) -> Result<Self, MoneyError> {
        self.0
            .checked_mul(rate.0)
            .map(|d| Self(rescale(d)))
            .ok_or(MoneyError::ArithmeticOverflow)
    }

    /// `Money / Money -> Rate`. Dividing two monetary amounts yields a ratio, not
    /// a further monetary amount (e.g. units disposed / units in a lot).
    pub fn div_units(self, other: Self) -> Result<Rate, MoneyError> {
        if other.0.is_zero() {
            return Err(MoneyError::DivisionByZero);
        }

        self.0
            .checked_div(other.0)
            .map(Rate)
            .ok_or(MoneyError::ArithmeticOverflow)
    }

    /// Formats with exactly `places` fractional digits, banker's rounding.
    pub fn format_fixed(self, places: u32) -> String {
        self.0.round_dp(places).to_string()
    }

    /// Reinterprets this amount as a dimensionless [`Rate`], e.g. treating a
    /// per-unit EUR cost as the scale factor in a `quantity.mul_rate(..)` call.
    pub fn as_rate(self) -> Rate {
        Rate(self.0)
    }
}

impl Rate {
    pub fn zero() -> Self {
        Self(Decimal::ZERO)
    }

    pub fn one() -> Self {
        Self(Decimal::ONE)
    }

    pub fn parse(s: &str) -> Result<Self, MoneyError> {
        let trimmed = s.trim();

        if trimmed.contains(['e', 'E']) {
            return Err(MoneyError::Parse(s.to_owned()));
        }

        Decimal::from_str(trimmed)
            .map(Self)
            .map_err(|_| MoneyError::Parse(s.to_owned()))
    }

    pub fn from_decimal(decimal: Decimal) -> Self {
        Self(decimal)
    }

    pub fn to_decimal(self) -> Decimal {
        self.0
    }

    pub fn inverse(self) -> Result<Self, MoneyError> {
        if self.0.is_zero() {
            return Err(MoneyError::DivisionByZero);
        }

        Decimal::ONE
            .checked_div(self.0)
            .map(Self)
            .ok_or(MoneyError::ArithmeticOverflow)
    }
}

fn rescale(mut decimal: Decimal) -> Decimal {
    decimal.rescale(MONEY_SCALE);
    decimal
}

impl PartialOrd for Money {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Money {
    fn cmp(&self, other: &Self) -> Ordering {
        self.0.cmp(&other.0)
    }
}

impl PartialOrd for Rate {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Rate {
    fn cmp(&self, other: &Self) -> Ordering {
        self.0.cmp(&other.0)
    }
}

impl fmt::Display for Money {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.round_dp(DISPLAY_SCALE))
    }
}

impl fmt::Display for Rate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for Money {
    type Err = MoneyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Money::parse(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_rejects_scientific_notation() {
        assert!(Money::parse("1e10").is_err());
        assert!(Money::parse("1.5E-3").is_err());
    }

    #[test]
    fn parse_rejects_trailing_garbage() {
        assert!(Money::parse("123abc").is_err());
        assert!(Money::parse("12 34").is_err());
    }

    #[test]
    fn add_sub_roundtrip() {
        let a = Money::parse("20000.00").unwrap();
        let b = Money::parse("1000.00").unwrap();

        assert_eq!(a.add(b).unwrap(), Money::parse("21000.00").unwrap());
        assert_eq!(a.sub(b).unwrap(), Money::parse("19000.00").unwrap());
    }

    #[test]
    fn mul_rate_scales_value() {
        let units = Money::parse("0.75").unwrap();
        let price = Rate::parse("30000").unwrap();

        assert_eq!(units.mul_rate(price).unwrap(), Money::parse("22500").unwrap());
    }

    #[test]
    fn div_units_yields_rate() {
        let disposed = Money::parse("0.5").unwrap();
        let acquired = Money::parse("1.0").unwrap();

        let rate = disposed.div_units(acquired).unwrap();
        assert_eq!(rate, Rate::parse("0.5").unwrap());
    }

    #[test]
    fn div_by_zero_is_an_error() {
        let a = Money::parse("1").unwrap();
        assert_eq!(a.div_units(Money::zero()), Err(MoneyError::DivisionByZero));
    }

    #[test]
    fn format_fixed_uses_banker_rounding() {
        let m = Money::parse("2.005").unwrap();
        // banker's rounding: .005 rounds to even (2.00)
        assert_eq!(m.format_fixed(2), "2.00");
    }

    #[test]
    fn arbtest_add_is_commutative() {
        arbtest::arbtest(|u| {
            let a: i64 = u.int_in_range(-1_000_000..=1_000_000)?;
            let b: i64 = u.int_in_range(-1_000_000..=1_000_000)?;

            let ma = Money::from_decimal(Decimal::from(a));
            let mb = Money::from_decimal(Decimal::from(b));

            if let (Ok(ab), Ok(ba)) = (ma.add(mb), mb.add(ma)) {
                assert_eq!(ab, ba);
            }

            Ok(())
        });
    }
}
