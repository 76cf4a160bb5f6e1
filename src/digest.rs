use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use sha2::{Digest as _, Sha256};

use crate::error::RegistryError;

/// A canonical content digest in `algo:hex` form.
///
/// Only `sha256` is accepted on the wire; the algorithm prefix is kept so
/// that digests render and compare exactly as clients sent them.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Digest {
    algo: &'static str,
    hex: String,
}

impl Digest {
    /// Computes the SHA-256 digest of the given bytes.
    pub fn from_bytes(data: &[u8]) -> Self {
        Self::from_sha256_hex(hex::encode(Sha256::digest(data)))
    }

    /// Wraps an already-computed lowercase SHA-256 hex string.
    pub fn from_sha256_hex(hex: String) -> Self {
        Self {
            algo: "sha256",
            hex,
        }
    }

    pub fn algo(&self) -> &str {
        self.algo
    }

    pub fn hex(&self) -> &str {
        &self.hex
    }
}

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.algo, self.hex)
    }
}

impl FromStr for Digest {
    type Err = RegistryError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let hash = s
            .strip_prefix("sha256:")
            .ok_or_else(|| RegistryError::digest_invalid("digest must start with \"sha256:\""))?;
        if hash.len() != 64 {
            return Err(RegistryError::digest_invalid(
                "sha256 digest must carry 64 hex characters",
            ));
        }
        if !hash
            .chars()
            .all(|c| c.is_ascii_digit() || ('a'..='f').contains(&c))
        {
            return Err(RegistryError::digest_invalid(
                "digest must be lowercase hexadecimal",
            ));
        }
        Ok(Self {
            algo: "sha256",
            hex: hash.to_string(),
        })
    }
}

impl TryFrom<String> for Digest {
    type Error = RegistryError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<Digest> for String {
    fn from(d: Digest) -> Self {
        d.to_string()
    }
}

/// Reports whether a manifest reference is a digest rather than a tag name.
pub fn is_digest(reference: &str) -> bool {
    reference.contains(':')
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_digest_roundtrip() {
        let d = Digest::from_bytes(b"just some random data");
        assert_eq!(
            d.to_string(),
            "sha256:5ecc7468fa80f8f955de376a0a58277515cde6777951ab6d471f1355f22843cc"
        );
        let parsed: Digest = d.to_string().parse().unwrap();
        assert_eq!(parsed, d);
    }

    #[test]
    fn test_digest_rejects_malformed() {
        assert!("sha256:abc".parse::<Digest>().is_err());
        assert!("md5:0123456789abcdef0123456789abcdef".parse::<Digest>().is_err());
        assert!(
            "sha256:ZZ43a9fee50e69b4a9d2b9a99a06f11d6f4a33650c99c27b0f4f8b52f5a9cb5Z"
                .parse::<Digest>()
                .is_err()
        );
        assert!(format!("sha256:{}", "A".repeat(64)).parse::<Digest>().is_err());
    }

    #[test]
    fn test_is_digest() {
        assert!(is_digest("sha256:0000000000000000000000000000000000000000000000000000000000000000"));
        assert!(!is_digest("latest"));
        assert!(!is_digest("v1.2.3"));
    }
}
