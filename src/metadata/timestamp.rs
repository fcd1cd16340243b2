use std::collections::HashMap;

use serde::Deserialize;

use crate::error::Error;
use crate::metadata::expiry::Expiry;
use crate::metadata::hash::{Hash, HashAlgorithm};
use crate::metadata::role::{RepositoryKind, RoleType, Version};
use crate::metadata::signed::SignedMetadata;

/// A Timestamp role document: a pointer at the Snapshot a client should
/// expect, kept small so it is cheap to poll frequently.
#[derive(Debug, Clone)]
pub struct Timestamp {
    pub repo: RepositoryKind,
    pub version: Version,
    pub expires: Expiry,
    pub original_json: Vec<u8>,
    pub snapshot_hash: Hash,
    pub snapshot_version: Version,
}

impl Timestamp {
    /// Whether `snapshot` still matches what this Timestamp promises
    ///: if so, the fetcher can skip refetching it.
    pub fn still_current(&self, stored_hash: &Hash, stored_version: Version) -> bool {
        *stored_hash == self.snapshot_hash && stored_version == self.snapshot_version
    }

    pub fn from_wire(repo: RepositoryKind, meta: SignedMetadata<TimestampBody>) -> Result<Timestamp, Error> {
        let snapshot = meta
            .body
            .meta
            .get("snapshot.json")
            .ok_or_else(|| Error::InvalidMetadata("timestamp missing snapshot.json entry".into()))?;
        let (algorithm, digest) = snapshot
            .hashes
            .iter()
            .next()
            .ok_or_else(|| Error::InvalidMetadata("timestamp snapshot entry has no hash".into()))?;
        Ok(Timestamp {
            repo,
            version: meta.version,
            expires: meta.expires,
            original_json: meta.original_json,
            snapshot_hash: Hash { algorithm: *algorithm, digest: digest.to_uppercase() },
            snapshot_version: snapshot.version,
        })
    }
}

/// The on-the-wire shape of a Timestamp role's `signed` body.
#[derive(Deserialize, Debug, Clone)]
pub struct TimestampBody {
    #[serde(rename = "_type")]
    pub role_type: RoleType,
    pub version: Version,
    pub expires: Expiry,
    pub meta: HashMap<String, WireTimestampMeta>,
}

#[derive(Deserialize, Debug, Clone)]
pub struct WireTimestampMeta {
    pub version: Version,
    pub length: u64,
    pub hashes: HashMap<HashAlgorithm, String>,
}
