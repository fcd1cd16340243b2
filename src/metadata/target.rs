use std::collections::HashSet;
use std::fmt::{self, Display, Formatter};

use serde::{Deserialize, Serialize};

use crate::metadata::hash::Hash;

/// A hashed, length-bounded binary artifact destined for one ECU.
/// `filename` is non-empty and `hashes` carries at
/// least one `Sha256` or `Sha512` entry by construction (`new`); values
/// built only through `Deserialize` are re-checked by callers via
/// `is_well_formed` before use.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct Target {
    pub filename: String,
    pub ecu_identifier: String,
    pub length: u64,
    pub hashes: HashSet<Hash>,
    pub custom_format: Option<String>,
}

impl Target {
    pub fn new(
        filename: impl Into<String>,
        ecu_identifier: impl Into<String>,
        length: u64,
        hashes: HashSet<Hash>,
    ) -> Option<Target> {
        let filename = filename.into();
        if filename.is_empty() || !Target::has_strong_hash(&hashes) {
            return None;
        }
        Some(Target {
            filename,
            ecu_identifier: ecu_identifier.into(),
            length,
            hashes,
            custom_format: None,
        })
    }

    pub fn is_well_formed(&self) -> bool {
        !self.filename.is_empty() && Target::has_strong_hash(&self.hashes)
    }

    fn has_strong_hash(hashes: &HashSet<Hash>) -> bool {
        use crate::metadata::hash::HashAlgorithm;
        hashes
            .iter()
            .any(|h| matches!(h.algorithm, HashAlgorithm::Sha256 | HashAlgorithm::Sha512))
    }

    /// Verify that `bytes` matches every hash this target declares and
    /// does not exceed the declared length.
    pub fn verify_bytes(&self, bytes: &[u8]) -> Result<(), TargetMismatch> {
        if bytes.len() as u64 > self.length {
            return Err(TargetMismatch::Oversized);
        }
        if !self.hashes.iter().all(|h| h.matches_bytes(bytes)) {
            return Err(TargetMismatch::HashMismatch);
        }
        Ok(())
    }

    /// Cross-repository agreement: Director and Image must declare the
    /// same hashes and length for the same filename.
    pub fn agrees_with(&self, other: &Target) -> bool {
        self.hashes == other.hashes && self.length == other.length
    }

    /// The `custom.hardwareIdentifier` field Director targets carry,
    /// checked against the target ECU's registered hwid.
    pub fn hardware_id(&self) -> Option<String> {
        let raw = self.custom_format.as_ref()?;
        let value: serde_json::Value = serde_json::from_str(raw).ok()?;
        value.get("hardwareIdentifier")?.as_str().map(String::from)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TargetMismatch {
    Oversized,
    HashMismatch,
}

impl Display for TargetMismatch {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        match self {
            TargetMismatch::Oversized => write!(f, "downloaded bytes exceed declared target length"),
            TargetMismatch::HashMismatch => write!(f, "downloaded bytes do not match declared hash"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::hash::HashAlgorithm;

    fn sha256_of(bytes: &[u8]) -> Hash {
        Hash::new(HashAlgorithm::Sha256, bytes)
    }

    #[test]
    fn rejects_targets_without_a_strong_hash() {
        let mut hashes = HashSet::new();
        hashes.insert(Hash {
            algorithm: HashAlgorithm::Unknown,
            digest: "deadbeef".into(),
        });
        assert!(Target::new("firmware.bin", "p1", 4, hashes).is_none());
    }

    #[test]
    fn verify_bytes_checks_hash_and_length() {
        let mut hashes = HashSet::new();
        hashes.insert(sha256_of(b"firmware"));
        let target = Target::new("firmware.bin", "p1", 8, hashes).unwrap();
        assert!(target.verify_bytes(b"firmware").is_ok());
        assert_eq!(target.verify_bytes(b"wrong!!!").unwrap_err(), TargetMismatch::HashMismatch);
        assert_eq!(target.verify_bytes(b"too many bytes").unwrap_err(), TargetMismatch::Oversized);
    }

    #[test]
    fn agreement_ignores_ecu_identifier() {
        let mut hashes = HashSet::new();
        hashes.insert(sha256_of(b"firmware"));
        let director = Target::new("firmware.bin", "p1", 8, hashes.clone()).unwrap();
        let image = Target::new("firmware.bin", "image-side", 8, hashes).unwrap();
        assert!(director.agrees_with(&image));
    }
}
