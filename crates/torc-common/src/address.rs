//! Ledger account addresses
//!
//! Addresses are opaque hex identifiers assigned by the external ledger.
//! Comparison is case-insensitive, so the inner representation is normalized
//! to lowercase at construction.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize};

/// Ledger account address, normalized to lowercase
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct Address(String);

impl Address {
    /// Create a normalized address
    pub fn new<S: Into<String>>(value: S) -> Self {
        Address(value.into().to_lowercase())
    }

    /// The all-zero address used by the ledger for absent records
    pub fn zero() -> Self {
        Address(format!("0x{}", "0".repeat(40)))
    }

    /// True for the all-zero address
    pub fn is_zero(&self) -> bool {
        let digits = self.0.strip_prefix("0x").unwrap_or(&self.0);
        !digits.is_empty() && digits.chars().all(|c| c == '0')
    }

    /// String form
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for Address {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Address::new(s))
    }
}

impl<'de> Deserialize<'de> for Address {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Ok(Address::new(s))
    }
}

/// Authenticated actor principal handed in by the (out of scope) API layer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Principal {
    /// Actor address
    pub address: Address,
    /// Admin role granted by the auth layer
    pub admin: bool,
}

impl Principal {
    /// Regular actor
    pub fn user<S: Into<String>>(address: S) -> Self {
        Principal {
            address: Address::new(address),
            admin: false,
        }
    }

    /// Admin actor
    pub fn admin<S: Into<String>>(address: S) -> Self {
        Principal {
            address: Address::new(address),
            admin: true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn address_comparison_is_case_insensitive() {
        let a = Address::new("0xAbCd01");
        let b = Address::new("0xabcd01");
        assert_eq!(a, b);
        assert_eq!(a.to_string(), "0xabcd01");
    }

    #[test]
    fn zero_address_detection() {
        assert!(Address::zero().is_zero());
        assert!(Address::new("0x0000").is_zero());
        assert!(!Address::new("0x0001").is_zero());
        assert!(!Address::new("").is_zero());
    }
}
