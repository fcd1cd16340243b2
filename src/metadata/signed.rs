use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json as json;

use crate::error::Error;
use crate::metadata::expiry::Expiry;
use crate::metadata::key::KeyId;
use crate::metadata::role::{RoleType, Version};

/// One entry in a document's `signatures` array.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct Signature {
    pub keyid: KeyId,
    pub method: SignatureMethod,
    /// Base64-encoded raw signature bytes.
    pub sig: String,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "kebab-case")]
pub enum SignatureMethod {
    Ed25519,
    #[serde(rename = "rsassa-pss")]
    RsaSsaPss,
    #[serde(rename = "rsassa-pss-sha256")]
    RsaSsaPssSha256,
    #[serde(other)]
    Unknown,
}

/// The raw `{signed, signatures}` envelope every role file is wrapped in,
/// before any verification has taken place. `signed` is kept as a
/// `serde_json::Value` (not re-typed yet) so the exact bytes used for
/// canonicalization match what was downloaded.
#[derive(Deserialize, Debug, Clone)]
pub struct Envelope {
    pub signed: json::Value,
    pub signatures: Vec<Signature>,
}

/// The minimal fields every `signed` body carries, used to check `_type`,
/// `version`, and `expires` before trusting the rest of the document.
#[derive(Deserialize, Debug, Clone)]
pub struct SignedHeader {
    #[serde(rename = "_type")]
    pub role_type: RoleType,
    pub version: Version,
    pub expires: Expiry,
}

/// A verified role document: the typed body `R`, its header fields, and
/// the exact original bytes that were signed over. `original_json` is required for re-verification
/// and for storage, since re-serializing `body` would not reproduce the
/// bytes that were actually signed.
#[derive(Debug, Clone)]
pub struct SignedMetadata<R> {
    pub version: Version,
    pub expires: Expiry,
    pub original_json: Vec<u8>,
    pub body: R,
}

impl<R: DeserializeOwned> SignedMetadata<R> {
    /// Parse the envelope and typed body out of raw bytes without checking
    /// signatures, threshold, or expiry; that is `Verifier::verify`'s job.
    /// `original_json` is the exact input slice, re-used verbatim for
    /// canonicalization so no re-serialization step can desync the bytes
    /// that were signed from the bytes that get hashed.
    pub fn parse_unverified(bytes: &[u8]) -> Result<(Envelope, SignedHeader, R), Error> {
        let envelope: Envelope = json::from_slice(bytes)
            .map_err(|err| Error::InvalidMetadata(format!("malformed envelope: {}", err)))?;
        let header: SignedHeader = json::from_value(envelope.signed.clone())
            .map_err(|err| Error::InvalidMetadata(format!("malformed signed header: {}", err)))?;
        let body: R = json::from_value(envelope.signed.clone())
            .map_err(|err| Error::InvalidMetadata(format!("malformed signed body: {}", err)))?;
        Ok((envelope, header, body))
    }

    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires.is_expired_at(now)
    }
}
