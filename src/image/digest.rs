//! Content digests
//!
//! A [`Digest`] is an `algorithm:hex` pair such as `sha256:e3b0...`. Only sha256
//! content can be computed locally, other algorithms are carried through
//! unchanged when a registry reports them.

use crate::error::{RegistryError, Result};
use serde::{Deserialize, Serialize};
use sha2::{Digest as _, Sha256};
use std::fmt;
use std::io::Read;
use std::str::FromStr;

pub const SHA256: &str = "sha256";

/// Docker digest for empty content
pub const EMPTY_DIGEST: &str =
    "sha256:e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855";

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Digest {
    algorithm: String,
    hex: String,
}

impl Digest {
    /// Compute the sha256 digest of `data`
    pub fn sha256(data: &[u8]) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(data);
        Self {
            algorithm: SHA256.to_string(),
            hex: hex::encode(hasher.finalize()),
        }
    }

    /// Compute the sha256 digest of everything `reader` yields
    pub fn sha256_reader<R: Read>(mut reader: R) -> Result<Self> {
        let mut hasher = Sha256::new();
        std::io::copy(&mut reader, &mut hasher)?;
        Ok(Self {
            algorithm: SHA256.to_string(),
            hex: hex::encode(hasher.finalize()),
        })
    }

    pub fn parse(value: &str) -> Result<Self> {
        let (algorithm, hex_part) = value.split_once(':').ok_or_else(|| {
            RegistryError::Validation(format!("Digest missing algorithm prefix: {}", value))
        })?;

        let valid_algorithm = !algorithm.is_empty()
            && algorithm
                .chars()
                .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || "+._-".contains(c));
        if !valid_algorithm {
            return Err(RegistryError::Validation(format!(
                "Invalid digest algorithm in: {}",
                value
            )));
        }

        let valid_hex = if algorithm == SHA256 {
            hex_part.len() == 64 && hex_part.chars().all(|c| c.is_ascii_hexdigit())
        } else {
            hex_part.len() >= 32 && hex_part.chars().all(|c| c.is_ascii_alphanumeric())
        };
        if !valid_hex {
            return Err(RegistryError::Validation(format!(
                "Invalid digest encoding in: {}",
                value
            )));
        }

        Ok(Self {
            algorithm: algorithm.to_string(),
            hex: hex_part.to_ascii_lowercase(),
        })
    }

    pub fn algorithm(&self) -> &str {
        &self.algorithm
    }

    pub fn hex(&self) -> &str {
        &self.hex
    }

    /// Check that `data` hashes to this digest
    pub fn verify(&self, data: &[u8]) -> Result<()> {
        if self.algorithm != SHA256 {
            return Err(RegistryError::UnsupportedFormat(format!(
                "Cannot verify {} digests",
                self.algorithm
            )));
        }
        let computed = Self::sha256(data);
        if computed != *self {
            return Err(RegistryError::Verification(format!(
                "Data integrity check failed: expected {}, computed {}",
                self, computed
            )));
        }
        Ok(())
    }

    /// `true` when `data` hashes to this digest
    pub fn matches(&self, data: &[u8]) -> bool {
        self.verify(data).is_ok()
    }

    /// Shortened form for log output
    pub fn short(&self) -> String {
        let full = self.to_string();
        if full.len() > 19 {
            full[..19].to_string()
        } else {
            full
        }
    }
}

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.algorithm, self.hex)
    }
}

impl FromStr for Digest {
    type Err = RegistryError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl TryFrom<String> for Digest {
    type Error = RegistryError;

    fn try_from(value: String) -> Result<Self> {
        Self::parse(&value)
    }
}

impl From<Digest> for String {
    fn from(digest: Digest) -> Self {
        digest.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const HELLO: &str = "sha256:b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9";

    #[test]
    fn test_compute_sha256() {
        assert_eq!(Digest::sha256(b"hello world").to_string(), HELLO);
        assert_eq!(Digest::sha256(b"").to_string(), EMPTY_DIGEST);
    }

    #[test]
    fn test_sha256_reader_matches_slice() {
        let data = vec![7u8; 100_000];
        assert_eq!(Digest::sha256_reader(&data[..]).unwrap(), Digest::sha256(&data));
    }

    #[test]
    fn test_parse() {
        let digest = Digest::parse(HELLO).unwrap();
        assert_eq!(digest.algorithm(), "sha256");
        assert_eq!(digest.hex().len(), 64);
        assert!(Digest::parse("sha256:invalid").is_err());
        assert!(Digest::parse("b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9").is_err());
        assert!(Digest::parse(":abc").is_err());
    }

    #[test]
    fn test_verify() {
        let digest = Digest::parse(HELLO).unwrap();
        assert!(digest.verify(b"hello world").is_ok());
        assert!(matches!(
            digest.verify(b"hello there"),
            Err(RegistryError::Verification(_))
        ));
    }

    #[test]
    fn test_serde_as_string() {
        let digest = Digest::parse(HELLO).unwrap();
        let json = serde_json::to_string(&digest).unwrap();
        assert_eq!(json, format!("\"{}\"", HELLO));
        let back: Digest = serde_json::from_str(&json).unwrap();
        assert_eq!(back, digest);
        assert!(serde_json::from_str::<Digest>("\"nope\"").is_err());
    }
}
