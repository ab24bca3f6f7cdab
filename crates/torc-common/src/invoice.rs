//! Invoice identifiers
//!
//! The canonical invoice id is a 128-bit UUID. The external ledger addresses
//! escrows by a 32-byte word: the UUID's 16 bytes copied left-aligned with 16
//! zero bytes of padding. Encoding and decoding are total inverses of each
//! other; decoding rejects keys with non-zero padding.

use std::fmt;
use std::str::FromStr;

use serde::de::Error as DeError;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;
use uuid::Uuid;

use crate::util::hex;

/// Invoice id error
#[derive(Debug, Error)]
pub enum Error {
    /// Not a UUID
    #[error("invalid invoice id: `{0}`")]
    InvalidInvoiceId(String),
    /// Key bytes are not a valid encoding
    #[error("invalid ledger key: `{0}`")]
    InvalidLedgerKey(String),
    /// Trailing 16 bytes of the key must be zero
    #[error("ledger key has non-zero padding")]
    NonZeroPadding,
    /// Hex error
    #[error(transparent)]
    Hex(#[from] hex::Error),
}

/// Canonical invoice identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct InvoiceId(Uuid);

impl InvoiceId {
    /// Random invoice id
    pub fn new() -> Self {
        InvoiceId(Uuid::new_v4())
    }

    /// Inner UUID
    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }

    /// Encode as the ledger's 32-byte key
    pub fn to_ledger_key(&self) -> LedgerKey {
        let mut bytes = [0u8; 32];
        bytes[..16].copy_from_slice(self.0.as_bytes());
        LedgerKey(bytes)
    }
}

impl Default for InvoiceId {
    fn default() -> Self {
        InvoiceId::new()
    }
}

impl From<Uuid> for InvoiceId {
    fn from(value: Uuid) -> Self {
        InvoiceId(value)
    }
}

impl fmt::Display for InvoiceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for InvoiceId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s)
            .map(InvoiceId)
            .map_err(|_| Error::InvalidInvoiceId(s.to_string()))
    }
}

/// 32-byte ledger escrow key
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LedgerKey([u8; 32]);

impl LedgerKey {
    /// Wrap raw key bytes
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        LedgerKey(bytes)
    }

    /// Raw key bytes
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Decode the invoice id, rejecting non-zero padding
    pub fn invoice_id(&self) -> Result<InvoiceId, Error> {
        if self.0[16..].iter().any(|b| *b != 0) {
            return Err(Error::NonZeroPadding);
        }
        let mut uuid_bytes = [0u8; 16];
        uuid_bytes.copy_from_slice(&self.0[..16]);
        Ok(InvoiceId(Uuid::from_bytes(uuid_bytes)))
    }
}

impl fmt::Display for LedgerKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{}", hex::encode(self.0))
    }
}

impl FromStr for LedgerKey {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bytes = hex::decode(s)?;
        let bytes: [u8; 32] = bytes
            .try_into()
            .map_err(|_| Error::InvalidLedgerKey(s.to_string()))?;
        Ok(LedgerKey(bytes))
    }
}

impl Serialize for LedgerKey {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for LedgerKey {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(DeError::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ledger_key_layout() {
        let id: InvoiceId = "67e55044-10b1-426f-9247-bb680e5fe0c8".parse().unwrap();
        let key = id.to_ledger_key();
        assert_eq!(&key.as_bytes()[..16], id.as_uuid().as_bytes());
        assert!(key.as_bytes()[16..].iter().all(|b| *b == 0));
        assert_eq!(
            key.to_string(),
            "0x67e5504410b1426f9247bb680e5fe0c800000000000000000000000000000000"
        );
    }

    #[test]
    fn round_trip_random_ids() {
        use rand::RngCore;

        // Raw random bytes, not just v4 ids: the encoding is total over the
        // whole 128-bit space.
        let mut rng = rand::rng();
        for _ in 0..10_000 {
            let mut bytes = [0u8; 16];
            rng.fill_bytes(&mut bytes);
            let id = InvoiceId::from(Uuid::from_bytes(bytes));
            let key = id.to_ledger_key();
            assert_eq!(key.invoice_id().unwrap(), id);
        }
    }

    #[test]
    fn non_zero_padding_is_rejected() {
        let id = InvoiceId::new();
        let mut bytes = *id.to_ledger_key().as_bytes();
        bytes[31] = 1;
        assert!(matches!(
            LedgerKey::from_bytes(bytes).invoice_id(),
            Err(Error::NonZeroPadding)
        ));
    }

    #[test]
    fn ledger_key_hex_round_trip() {
        let key = InvoiceId::new().to_ledger_key();
        let parsed: LedgerKey = key.to_string().parse().unwrap();
        assert_eq!(parsed, key);
        assert!("0xdeadbeef".parse::<LedgerKey>().is_err());
    }
}
