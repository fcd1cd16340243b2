use std::fmt::{self, Display, Formatter};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// A digest algorithm Uptane metadata may reference. `Unknown` exists so
/// parsing never fails on an algorithm we don't implement; such hashes
/// simply never match anything.
#[derive(Serialize, Deserialize, Hash, Eq, PartialEq, Debug, Clone, Copy)]
#[serde(rename_all = "lowercase")]
pub enum HashAlgorithm {
    Sha256,
    Sha512,
    #[serde(other)]
    Unknown,
}

impl Display for HashAlgorithm {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        match self {
            HashAlgorithm::Sha256 => write!(f, "sha256"),
            HashAlgorithm::Sha512 => write!(f, "sha512"),
            HashAlgorithm::Unknown => write!(f, "unknown"),
        }
    }
}

impl FromStr for HashAlgorithm {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s.to_lowercase().as_str() {
            "sha256" => HashAlgorithm::Sha256,
            "sha512" => HashAlgorithm::Sha512,
            _ => HashAlgorithm::Unknown,
        })
    }
}

/// A single digest: algorithm plus an upper-case hex digest. Equality is
/// `(algorithm, digest)`.
#[derive(Serialize, Deserialize, Hash, Eq, PartialEq, Debug, Clone)]
pub struct Hash {
    pub algorithm: HashAlgorithm,
    pub digest: String,
}

impl Hash {
    pub fn new(algorithm: HashAlgorithm, digest: &[u8]) -> Hash {
        Hash {
            algorithm,
            digest: hex::encode_upper(digest),
        }
    }

    pub fn matches_bytes(&self, bytes: &[u8]) -> bool {
        use sha2::{Digest, Sha256, Sha512};
        let computed = match self.algorithm {
            HashAlgorithm::Sha256 => hex::encode_upper(Sha256::digest(bytes)),
            HashAlgorithm::Sha512 => hex::encode_upper(Sha512::digest(bytes)),
            HashAlgorithm::Unknown => return false,
        };
        computed == self.digest
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hash_matches_known_digest() {
        let h = Hash::new(HashAlgorithm::Sha256, b"hello");
        assert!(h.matches_bytes(b"hello"));
        assert!(!h.matches_bytes(b"goodbye"));
    }

    #[test]
    fn unknown_algorithm_never_matches() {
        let h = Hash {
            algorithm: HashAlgorithm::Unknown,
            digest: "deadbeef".into(),
        };
        assert!(!h.matches_bytes(b"anything"));
    }
}
