use std::fmt::{self, Display, Formatter};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::crypto;
use crate::error::Error;

/// The key types recognized on the wire. `Unknown` keys are kept around
/// (so a document listing one doesn't fail to parse) but never verify
/// anything.
#[derive(Serialize, Deserialize, Hash, Eq, PartialEq, Debug, Clone, Copy)]
#[serde(rename_all = "kebab-case")]
pub enum KeyKind {
    Rsa2048,
    Rsa3072,
    Rsa4096,
    Ed25519,
    #[serde(other)]
    Unknown,
}

impl Display for KeyKind {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        match self {
            KeyKind::Rsa2048 => write!(f, "rsa2048"),
            KeyKind::Rsa3072 => write!(f, "rsa3072"),
            KeyKind::Rsa4096 => write!(f, "rsa4096"),
            KeyKind::Ed25519 => write!(f, "ed25519"),
            KeyKind::Unknown => write!(f, "unknown"),
        }
    }
}

/// A TUF key identifier: lowercase hex of `sha256(canonical-json(pem))`.
#[derive(Serialize, Deserialize, Hash, Eq, PartialEq, Debug, Clone, PartialOrd, Ord)]
#[serde(transparent)]
pub struct KeyId(pub String);

impl Display for KeyId {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A public key plus its type and the derived `KeyId`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublicKey {
    pub kind: KeyKind,
    pub encoded: String,
    pub key_id: KeyId,
}

impl PublicKey {
    pub fn new(kind: KeyKind, encoded: String) -> Result<PublicKey, Error> {
        let canonical = crypto::canonicalize_json(&serde_json::to_vec(&encoded)?)?;
        let digest = Sha256::digest(&canonical);
        let key_id = KeyId(hex::encode(digest));
        Ok(PublicKey { kind, encoded, key_id })
    }

    /// Build a key with an already-known `KeyId`, used when parsing a
    /// `root.json` whose `keys` map is keyed by the id the document itself
    /// asserts.
    pub fn with_id(kind: KeyKind, encoded: String, key_id: KeyId) -> PublicKey {
        PublicKey { kind, encoded, key_id }
    }

    /// Verify `sig` (raw bytes, not base64) over `msg` using this key.
    /// `Unknown`-typed keys always fail.
    pub fn verify(&self, msg: &[u8], sig: &[u8]) -> bool {
        match self.kind {
            KeyKind::Unknown => false,
            KeyKind::Ed25519 => crypto::verify_ed25519(&self.encoded, msg, sig).unwrap_or(false),
            KeyKind::Rsa2048 | KeyKind::Rsa3072 | KeyKind::Rsa4096 => {
                crypto::verify_rsa_pss_sha256(&self.encoded, msg, sig).unwrap_or(false)
            }
        }
    }
}

/// On-device signing key for the Primary itself (used to sign ECU
/// manifests and, transitively, the device manifest).
#[derive(Serialize, Deserialize, Clone)]
pub struct PrivateKey {
    pub key_id: KeyId,
    pub kind: KeyKind,
    pub der_bytes: Vec<u8>,
}

impl PrivateKey {
    pub fn sign(&self, msg: &[u8]) -> Result<Vec<u8>, Error> {
        match self.kind {
            KeyKind::Ed25519 => crypto::sign_ed25519(&self.der_bytes, msg),
            KeyKind::Rsa2048 | KeyKind::Rsa3072 | KeyKind::Rsa4096 => {
                crypto::sign_rsa_pss_sha256(&self.der_bytes, msg)
            }
            KeyKind::Unknown => Err(Error::Ring("cannot sign with an unknown key type".into())),
        }
    }
}
