//! Util

use std::time::{SystemTime, UNIX_EPOCH};

/// Seconds since unix epoch
pub fn unix_time() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// Hex encoding and decoding
pub mod hex {
    use thiserror::Error;

    /// Hex error
    #[derive(Debug, Error)]
    pub enum Error {
        /// Odd number of hex digits
        #[error("odd number of hex digits")]
        OddLengthString,
        /// Non-hex character
        #[error("invalid hex character: `{0}`")]
        InvalidHexCharacter(char),
    }

    /// Encode bytes as a lowercase hex string
    pub fn encode<T: AsRef<[u8]>>(data: T) -> String {
        let bytes = data.as_ref();
        let mut out = String::with_capacity(bytes.len() * 2);
        for b in bytes {
            out.push_str(&format!("{b:02x}"));
        }
        out
    }

    /// Decode a hex string (with or without a `0x` prefix) into bytes
    pub fn decode(s: &str) -> Result<Vec<u8>, Error> {
        let s = s.strip_prefix("0x").unwrap_or(s);
        if s.len() % 2 != 0 {
            return Err(Error::OddLengthString);
        }
        let mut out = Vec::with_capacity(s.len() / 2);
        let digits = s
            .chars()
            .map(|c| c.to_digit(16).ok_or(Error::InvalidHexCharacter(c)))
            .collect::<Result<Vec<u32>, Error>>()?;
        for pair in digits.chunks(2) {
            out.push(((pair[0] << 4) | pair[1]) as u8);
        }
        Ok(out)
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        #[test]
        fn hex_round_trip() {
            let bytes = [0u8, 1, 0x7f, 0xff, 0xa0];
            let encoded = encode(bytes);
            assert_eq!(encoded, "00017fffa0");
            assert_eq!(decode(&encoded).unwrap(), bytes);
            assert_eq!(decode(&format!("0x{encoded}")).unwrap(), bytes);
        }

        #[test]
        fn hex_rejects_bad_input() {
            assert!(decode("abc").is_err());
            assert!(decode("zz").is_err());
        }
    }
}
