//! Fixed-point decimal type used for every quantity and money value in the ledger.
//!
//! Canonical strings (no exponent, no trailing zeros) are the storage format.

use rust_decimal::Decimal as RustDecimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Lossless decimal for token amounts, prices, cost basis and proceeds.
///
/// Backed by rust_decimal so sums and differences are exact.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct Decimal(#[serde(with = "rust_decimal::serde::float")] RustDecimal);

impl Decimal {
    pub fn new(value: RustDecimal) -> Self {
        Decimal(value)
    }

    /// Parse a Decimal from a string losslessly.
    ///
    /// # Errors
    /// Returns an error if the string is not a valid decimal number.
    pub fn from_str_canonical(s: &str) -> Result<Self, rust_decimal::Error> {
        RustDecimal::from_str(s.trim()).map(Decimal)
    }

    /// Format without exponent notation and with trailing zeros removed.
    pub fn to_canonical_string(&self) -> String {
        format!("{}", self.0.normalize())
    }

    pub fn zero() -> Self {
        Decimal(RustDecimal::ZERO)
    }

    pub fn one() -> Self {
        Decimal(RustDecimal::ONE)
    }

    pub fn hundred() -> Self {
        Decimal(RustDecimal::ONE_HUNDRED)
    }

    pub fn from_i64(value: i64) -> Self {
        Decimal(RustDecimal::from(value))
    }

    pub fn is_zero(&self) -> bool {
        self.0.is_zero()
    }

    /// Returns true if the value is > 0.
    pub fn is_positive(&self) -> bool {
        !self.is_zero() && self.0.is_sign_positive()
    }

    /// Returns true if the value is < 0.
    pub fn is_negative(&self) -> bool {
        !self.is_zero() && self.0.is_sign_negative()
    }

    pub fn abs(&self) -> Self {
        Decimal(self.0.abs())
    }

    pub fn min(self, other: Decimal) -> Decimal {
        if other < self {
            other
        } else {
            self
        }
    }

    /// Division that yields `None` for a zero divisor or on overflow.
    pub fn checked_div(&self, rhs: Decimal) -> Option<Decimal> {
        self.0.checked_div(rhs.0).map(Decimal)
    }

    /// Addition that yields `None` on overflow.
    pub fn checked_add(&self, rhs: Decimal) -> Option<Decimal> {
        self.0.checked_add(rhs.0).map(Decimal)
    }

    /// Multiplication that yields `None` on overflow.
    pub fn checked_mul(&self, rhs: Decimal) -> Option<Decimal> {
        self.0.checked_mul(rhs.0).map(Decimal)
    }

    /// `self * numerator / denominator`, dividing first when the product overflows.
    pub fn mul_div(&self, numerator: Decimal, denominator: Decimal) -> Option<Decimal> {
        self.checked_mul(numerator)
            .and_then(|product| product.checked_div(denominator))
            .or_else(|| {
                self.checked_div(denominator)
                    .and_then(|ratio| ratio.checked_mul(numerator))
            })
    }

    /// Round half-even to `dp` decimal places.
    pub fn round_dp(&self, dp: u32) -> Decimal {
        Decimal(self.0.round_dp(dp))
    }

    /// Integer part, truncated toward zero.
    pub fn trunc_i64(&self) -> i64 {
        use rust_decimal::prelude::ToPrimitive;
        self.0.trunc().to_i64().unwrap_or(0)
    }

    /// `self / whole × 100`, or `None` when `whole` is zero or the result overflows.
    pub fn percent_of(&self, whole: Decimal) -> Option<Decimal> {
        self.checked_div(whole)
            .and_then(|ratio| ratio.checked_mul(Decimal::hundred()))
    }
}

impl fmt::Display for Decimal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_canonical_string())
    }
}

impl FromStr for Decimal {
    type Err = rust_decimal::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_str_canonical(s)
    }
}

impl From<RustDecimal> for Decimal {
    fn from(value: RustDecimal) -> Self {
        Decimal(value)
    }
}

impl From<Decimal> for RustDecimal {
    fn from(value: Decimal) -> Self {
        value.0
    }
}

impl std::ops::Add for Decimal {
    type Output = Decimal;

    fn add(self, rhs: Decimal) -> Decimal {
        Decimal(self.0 + rhs.0)
    }
}

impl std::ops::AddAssign for Decimal {
    fn add_assign(&mut self, rhs: Decimal) {
        self.0 += rhs.0;
    }
}

impl std::ops::Sub for Decimal {
    type Output = Decimal;

    fn sub(self, rhs: Decimal) -> Decimal {
        Decimal(self.0 - rhs.0)
    }
}

impl std::ops::SubAssign for Decimal {
    fn sub_assign(&mut self, rhs: Decimal) {
        self.0 -= rhs.0;
    }
}

impl std::ops::Mul for Decimal {
    type Output = Decimal;

    fn mul(self, rhs: Decimal) -> Decimal {
        Decimal(self.0 * rhs.0)
    }
}

impl std::ops::Div for Decimal {
    type Output = Decimal;

    fn div(self, rhs: Decimal) -> Decimal {
        Decimal(self.0 / rhs.0)
    }
}

impl std::ops::Neg for Decimal {
    type Output = Decimal;

    fn neg(self) -> Decimal {
        Decimal(-self.0)
    }
}

impl std::iter::Sum for Decimal {
    fn sum<I: Iterator<Item = Decimal>>(iter: I) -> Decimal {
        iter.fold(Decimal::zero(), |acc, d| acc + d)
    }
}

impl<'a> std::iter::Sum<&'a Decimal> for Decimal {
    fn sum<I: Iterator<Item = &'a Decimal>>(iter: I) -> Decimal {
        iter.fold(Decimal::zero(), |acc, d| acc + *d)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn d(s: &str) -> Decimal {
        Decimal::from_str_canonical(s).unwrap()
    }

    #[test]
    fn test_canonical_string_strips_trailing_zeros() {
        assert_eq!(d("150.000").to_canonical_string(), "150");
        assert_eq!(d("0.0100").to_canonical_string(), "0.01");
        assert!(!d("1e3").to_canonical_string().contains('e'));
    }

    #[test]
    fn test_pro_rata_multiply_first_is_exact() {
        // 100 of a 120-token sell worth 180
        let share = d("100") * d("180") / d("120");
        assert_eq!(share, d("150"));
    }

    #[test]
    fn test_mul_div_divides_first_when_product_overflows() {
        assert_eq!(d("1000000000000000").checked_mul(d("100000000000000")), None);
        let share = d("1000000000000000").mul_div(d("100000000000000"), d("2000000000000000"));
        assert_eq!(share, Some(d("50000000000000")));
        assert_eq!(d("100").mul_div(d("180"), d("120")), Some(d("150")));
        assert_eq!(d("1").mul_div(d("1"), Decimal::zero()), None);
    }

    #[test]
    fn test_checked_div_by_zero() {
        assert_eq!(d("1").checked_div(Decimal::zero()), None);
        assert_eq!(d("1").checked_div(d("4")), Some(d("0.25")));
    }

    #[test]
    fn test_percent_of() {
        assert_eq!(d("50").percent_of(d("100")), Some(d("50")));
        assert_eq!(d("6").percent_of(d("24")), Some(d("25")));
        assert_eq!(d("6").percent_of(Decimal::zero()), None);
    }

    #[test]
    fn test_sum_and_assign_ops() {
        let values = vec![d("0.1"), d("0.2"), d("0.3")];
        let total: Decimal = values.iter().sum();
        assert_eq!(total, d("0.6"));

        let mut acc = Decimal::zero();
        acc += d("2");
        acc -= d("0.5");
        assert_eq!(acc, d("1.5"));
    }

    #[test]
    fn test_min_and_sign() {
        assert_eq!(d("3").min(d("2")), d("2"));
        assert!(d("-1").is_negative());
        assert!(!Decimal::zero().is_positive());
        assert_eq!(d("-2.5").trunc_i64(), -2);
    }

    #[test]
    fn test_json_is_number() {
        let json = serde_json::to_value(d("123.456")).unwrap();
        assert!(json.is_number());
    }
}
