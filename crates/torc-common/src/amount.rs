//! TORC Amount
//!
//! On-ledger amounts are unbounded integers carried as decimal strings on the
//! wire and in the store. [`Amount`] wraps an unsigned big integer;
//! [`SignedAmount`] carries reconciliation differences (`chain − db`).

use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

use num_bigint::{BigInt, BigUint, Sign};
use serde::de::Error as DeError;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;

/// Basis-point denominator used by fee and discount arithmetic
pub const BPS_DENOMINATOR: u32 = 10_000;

/// Amount Error
#[derive(Debug, Error)]
pub enum Error {
    /// Not a decimal integer
    #[error("invalid amount: `{0}`")]
    InvalidAmount(String),
    /// Subtraction would underflow
    #[error("amount underflow")]
    Underflow,
    /// Basis points above the denominator
    #[error("basis points out of range: {0}")]
    BpsOutOfRange(u32),
}

/// Unbounded unsigned amount
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct Amount(BigUint);

impl Amount {
    /// Amount zero
    pub fn zero() -> Self {
        Amount(BigUint::default())
    }

    /// True when the amount is zero
    pub fn is_zero(&self) -> bool {
        self.0 == BigUint::default()
    }

    /// Checked addition
    pub fn checked_add(&self, other: &Amount) -> Amount {
        Amount(&self.0 + &other.0)
    }

    /// Checked subtraction, failing on underflow
    pub fn checked_sub(&self, other: &Amount) -> Result<Amount, Error> {
        if self.0 < other.0 {
            return Err(Error::Underflow);
        }
        Ok(Amount(&self.0 - &other.0))
    }

    /// Basis-point share rounded down: `⌊amount × bps / 10000⌋`
    pub fn bps_share(&self, bps: u32) -> Result<Amount, Error> {
        if bps > BPS_DENOMINATOR {
            return Err(Error::BpsOutOfRange(bps));
        }
        Ok(Amount((&self.0 * bps) / BPS_DENOMINATOR))
    }

    /// Amount payable after a basis-point discount
    pub fn discounted(&self, bps: u32) -> Result<Amount, Error> {
        let discount = self.bps_share(bps)?;
        self.checked_sub(&discount)
    }

    /// Smallest amount whose fee at `bps` is non-zero: `⌈10000 / bps⌉`
    ///
    /// Keeping the minimum tied to the fee rate guarantees every accepted
    /// escrow produces a strictly positive fee.
    pub fn minimum_for_fee_bps(bps: u32) -> Result<Amount, Error> {
        if bps == 0 || bps > BPS_DENOMINATOR {
            return Err(Error::BpsOutOfRange(bps));
        }
        Ok(Amount::from(
            (u64::from(BPS_DENOMINATOR) + u64::from(bps) - 1) / u64::from(bps),
        ))
    }

    /// Signed difference `self − other`
    pub fn signed_diff(&self, other: &Amount) -> SignedAmount {
        let lhs = BigInt::from(self.0.clone());
        let rhs = BigInt::from(other.0.clone());
        SignedAmount(lhs - rhs)
    }
}

impl fmt::Display for Amount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u64> for Amount {
    fn from(value: u64) -> Self {
        Amount(BigUint::from(value))
    }
}

impl FromStr for Amount {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let value = s
            .parse::<BigUint>()
            .map_err(|_| Error::InvalidAmount(s.to_string()))?;
        Ok(Amount(value))
    }
}

impl Serialize for Amount {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Amount {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(DeError::custom)
    }
}

/// Signed amount for discrepancy reporting
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SignedAmount(BigInt);

impl SignedAmount {
    /// Signed zero
    pub fn zero() -> Self {
        SignedAmount(BigInt::default())
    }

    /// True when the difference is zero
    pub fn is_zero(&self) -> bool {
        self.0.sign() == Sign::NoSign
    }

    /// Absolute value as an unsigned amount
    pub fn abs(&self) -> Amount {
        Amount(self.0.magnitude().clone())
    }

    /// True when the value is below zero
    pub fn is_negative(&self) -> bool {
        self.0.sign() == Sign::Minus
    }
}

impl fmt::Display for SignedAmount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for SignedAmount {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let value = s
            .parse::<BigInt>()
            .map_err(|_| Error::InvalidAmount(s.to_string()))?;
        Ok(SignedAmount(value))
    }
}

impl Serialize for SignedAmount {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for SignedAmount {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(DeError::custom)
    }
}

impl PartialOrd for SignedAmount {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for SignedAmount {
    fn cmp(&self, other: &Self) -> Ordering {
        self.0.cmp(&other.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fee_share_rounds_down() {
        let amount = Amount::from(1000);
        assert_eq!(amount.bps_share(50).unwrap(), Amount::from(5));
        // 999 × 50 / 10000 = 4.995
        assert_eq!(Amount::from(999).bps_share(50).unwrap(), Amount::from(4));
        assert_eq!(Amount::from(0).bps_share(50).unwrap(), Amount::zero());
    }

    #[test]
    fn minimum_amount_guarantees_positive_fee() {
        for bps in [1u32, 7, 50, 100, 333, 9_999, 10_000] {
            let minimum = Amount::minimum_for_fee_bps(bps).unwrap();
            let fee = minimum.bps_share(bps).unwrap();
            assert!(!fee.is_zero(), "bps={bps} minimum={minimum} fee={fee}");

            // One below the minimum yields a zero fee for small rates.
            if let Ok(below) = minimum.checked_sub(&Amount::from(1)) {
                if !below.is_zero() && bps < BPS_DENOMINATOR {
                    assert!(below.bps_share(bps).unwrap() < fee);
                }
            }
        }
        assert!(Amount::minimum_for_fee_bps(0).is_err());
    }

    #[test]
    fn discount_applies_to_payable() {
        // 1000 with a 250 bps discount pays 975
        let payable = Amount::from(1000).discounted(250).unwrap();
        assert_eq!(payable, Amount::from(975));
        assert_eq!(Amount::from(1000).discounted(0).unwrap(), Amount::from(1000));
    }

    #[test]
    fn signed_diff_keeps_direction() {
        let chain = Amount::from(500);
        let db = Amount::from(800);
        let diff = chain.signed_diff(&db);
        assert!(diff.is_negative());
        assert_eq!(diff.to_string(), "-300");
        assert_eq!(diff.abs(), Amount::from(300));
        assert!(chain.signed_diff(&chain).is_zero());
    }

    #[test]
    fn amount_serde_uses_decimal_strings() {
        let amount: Amount = "340282366920938463463374607431768211456".parse().unwrap();
        let json = serde_json::to_string(&amount).unwrap();
        assert_eq!(json, "\"340282366920938463463374607431768211456\"");
        let back: Amount = serde_json::from_str(&json).unwrap();
        assert_eq!(back, amount);
        assert!(serde_json::from_str::<Amount>("\"12fish\"").is_err());
    }
}
