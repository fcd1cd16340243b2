//! The Repository Fetcher: for each repository, roll Root
//! forward, then refresh Timestamp -> Snapshot -> Targets top-down with
//! monotonic version checks, resolving delegated Targets roles lazily.
//! Runs the same walk independently against the Director and Image
//! repositories, since Uptane never lets one repository's metadata
//! stand in for the other's.

use std::collections::HashSet;
use std::time::Duration;

use log::{debug, warn};
use serde::de::DeserializeOwned;
use url::Url;

use crate::clock::Clock;
use crate::crypto;
use crate::error::Error;
use crate::http::{Client, Request};
use crate::metadata::hash::{Hash, HashAlgorithm};
use crate::metadata::role::{RepositoryKind, Role, Version};
use crate::metadata::root::{Root, RootBody};
use crate::metadata::signed::SignedMetadata;
use crate::metadata::snapshot::{Snapshot, SnapshotBody};
use crate::metadata::target::Target;
use crate::metadata::targets::{Targets, TargetsBody};
use crate::metadata::timestamp::{Timestamp, TimestampBody};
use crate::storage::Storage;
use crate::verifier::{self, TrustedRole, MAX_ROOT_ROTATIONS};

/// Delegation traversal is bounded so a cyclic or pathologically deep
/// delegation graph cannot stall target lookup.
pub const MAX_DELEGATION_DEPTH: u32 = 5;

/// Everything the fetcher needs to reach one repository's role files.
pub struct RepositoryEndpoint {
    pub kind: RepositoryKind,
    pub base_url: Url,
}

impl RepositoryEndpoint {
    fn role_url(&self, file_name: &str) -> Result<Url, Error> {
        self.base_url.join(file_name).map_err(Error::from)
    }

    /// The location of a target's binary, conventionally under `targets/`
    /// relative to the repository root.
    pub fn target_url(&self, filename: &str) -> Result<Url, Error> {
        self.base_url.join(&format!("targets/{}", filename)).map_err(Error::from)
    }
}

/// The outcome of one refresh pass: whether anything newer than what was
/// already stored was found.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefreshOutcome {
    UpToDate,
    Updated,
}

pub struct Fetcher<'a> {
    pub client: &'a dyn Client,
    pub storage: &'a dyn Storage,
    pub clock: &'a dyn Clock,
    pub timeout: Duration,
}

impl<'a> Fetcher<'a> {
    pub fn new(client: &'a dyn Client, storage: &'a dyn Storage, clock: &'a dyn Clock, timeout: Duration) -> Fetcher<'a> {
        Fetcher { client, storage, clock, timeout }
    }

    fn get(&self, url: Url) -> Result<Vec<u8>, Error> {
        let response = self.client.execute(Request::get(url.clone(), self.timeout))?;
        if !response.is_success() {
            return Err(Error::Network(format!("GET {} returned HTTP {}", url, response.status)));
        }
        Ok(response.body)
    }

    /// Roll `root` forward one rotation at a time until the repository has
    /// no further numbered root to offer, or `MAX_ROOT_ROTATIONS` is hit
    ///. Returns the final trusted `Root`.
    pub fn refresh_root(&self, endpoint: &RepositoryEndpoint, mut root: Root) -> Result<Root, Error> {
        for _ in 0..MAX_ROOT_ROTATIONS {
            let next_version = root.version.next();
            let url = endpoint.role_url(&format!("{}.root.json", next_version.0))?;
            let response = match self.client.execute(Request::get(url.clone(), self.timeout)) {
                Ok(response) if response.is_success() => response,
                Ok(_) => break, // no such numbered root: rotation is complete
                Err(_) => break,
            };
            let verified = verifier::verify_new_root(&root, &response.body, self.clock.now())?;
            self.storage.store_role(endpoint.kind, &Role::Root, verified.version, &verified.original_json)?;
            root = Root::from_wire(endpoint.kind, verified);
        }
        Ok(root)
    }

    /// Refresh Timestamp, then (if it points at a new Snapshot) Snapshot,
    /// then every top-level role Snapshot promises a new version of
    ///. On any failure, nothing already stored is
    /// overwritten: each step only persists after its own verification
    /// succeeds.
    pub fn refresh_top_level(&self, endpoint: &RepositoryEndpoint, root: &Root) -> Result<RefreshOutcome, Error> {
        let timestamp = self.refresh_timestamp(endpoint, root)?;
        let timestamp = match timestamp {
            Some(t) => t,
            None => return Ok(RefreshOutcome::UpToDate),
        };

        let snapshot = self.refresh_snapshot_if_needed(endpoint, root, &timestamp)?;
        self.refresh_targets_if_needed(endpoint, root, &snapshot)?;
        Ok(RefreshOutcome::Updated)
    }

    /// Reconstruct the latest stored `SignedMetadata<R>` for `role` without
    /// re-deriving trust: the bytes on disk were only ever written here
    /// after this process verified them itself, so `parse_unverified` is
    /// enough to recover the typed header and body.
    fn load_typed<R: DeserializeOwned>(&self, kind: RepositoryKind, role: &Role) -> Result<Option<SignedMetadata<R>>, Error> {
        let bytes = match self.storage.load_latest(kind, role)? {
            Some(bytes) => bytes,
            None => return Ok(None),
        };
        let (_, header, body) = SignedMetadata::<R>::parse_unverified(&bytes)?;
        Ok(Some(SignedMetadata { version: header.version, expires: header.expires, original_json: bytes, body }))
    }

    /// The typed `Root` this process last verified and stored for
    /// `endpoint`, if any. Used to resume a session without re-fetching
    /// `root.json` when the in-memory `Root` from a prior run is gone.
    pub fn load_root(&self, endpoint: &RepositoryEndpoint) -> Result<Option<Root>, Error> {
        Ok(self.load_typed::<RootBody>(endpoint.kind, &Role::Root)?.map(|meta| Root::from_wire(endpoint.kind, meta)))
    }

    /// The typed `Snapshot` this process last verified and stored for
    /// `endpoint`, if any. Callers use this after `refresh_top_level`
    /// reports `Updated` to get an object to resolve targets against,
    /// since that call only persists bytes and reports whether anything
    /// changed.
    pub fn load_snapshot(&self, endpoint: &RepositoryEndpoint) -> Result<Option<Snapshot>, Error> {
        Ok(self.load_typed::<SnapshotBody>(endpoint.kind, &Role::Snapshot)?.map(|meta| Snapshot::from_wire(endpoint.kind, meta)))
    }

    /// The typed top-level `Targets` this process last verified and
    /// stored for `endpoint`, if any.
    pub fn load_targets(&self, endpoint: &RepositoryEndpoint) -> Result<Option<Targets>, Error> {
        self.load_typed::<TargetsBody>(endpoint.kind, &Role::Targets)?.map(|meta| Targets::from_wire(endpoint.kind, meta)).transpose()
    }

    fn refresh_timestamp(&self, endpoint: &RepositoryEndpoint, root: &Root) -> Result<Option<Timestamp>, Error> {
        let url = endpoint.role_url(&Role::Timestamp.file_name())?;
        let bytes = self.get(url)?;
        let trusted = TrustedRole::for_role(root, &Role::Timestamp)?;
        let verified: SignedMetadata<TimestampBody> =
            verifier::verify(&trusted, &Role::Timestamp, &bytes, self.clock.now())?;

        let stored_version = self.storage.latest_version(endpoint.kind, &Role::Timestamp)?;
        match stored_version {
            Some(stored) if verified.version < stored => {
                Err(Error::SecurityException(format!("timestamp rollback: {} < stored {}", verified.version, stored)))
            }
            Some(stored) if verified.version == stored => Ok(None),
            _ => {
                self.storage.store_role(endpoint.kind, &Role::Timestamp, verified.version, &verified.original_json)?;
                Ok(Some(Timestamp::from_wire(endpoint.kind, verified)?))
            }
        }
    }

    fn refresh_snapshot_if_needed(
        &self,
        endpoint: &RepositoryEndpoint,
        root: &Root,
        timestamp: &Timestamp,
    ) -> Result<Snapshot, Error> {
        let stored_bytes = self.storage.load_latest(endpoint.kind, &Role::Snapshot)?;
        let stored_version = self.storage.latest_version(endpoint.kind, &Role::Snapshot)?;
        if let (Some(bytes), Some(version)) = (&stored_bytes, stored_version) {
            let hash = Hash::new(HashAlgorithm::Sha256, bytes);
            if timestamp.still_current(&hash, version) {
                let (_, _, body) = SignedMetadata::<SnapshotBody>::parse_unverified(bytes)?;
                let verified = SignedMetadata { version, expires: timestamp.expires.clone(), original_json: bytes.clone(), body };
                return Ok(Snapshot::from_wire(endpoint.kind, verified));
            }
        }

        let url = endpoint.role_url(&Role::Snapshot.file_name())?;
        let bytes = self.get(url)?;
        let computed_hash = Hash::new(HashAlgorithm::Sha256, &bytes);
        if computed_hash != timestamp.snapshot_hash {
            return Err(Error::SecurityException("snapshot hash does not match timestamp".into()));
        }
        let trusted = TrustedRole::for_role(root, &Role::Snapshot)?;
        let verified: SignedMetadata<SnapshotBody> =
            verifier::verify(&trusted, &Role::Snapshot, &bytes, self.clock.now())?;
        if verified.version != timestamp.snapshot_version {
            return Err(Error::SecurityException("snapshot version does not match timestamp".into()));
        }
        self.storage.store_role(endpoint.kind, &Role::Snapshot, verified.version, &verified.original_json)?;
        Ok(Snapshot::from_wire(endpoint.kind, verified))
    }

    fn refresh_targets_if_needed(&self, endpoint: &RepositoryEndpoint, root: &Root, snapshot: &Snapshot) -> Result<(), Error> {
        let file_name = Role::Targets.file_name();
        let expected = match snapshot.expected_version(&file_name) {
            Some(v) => v,
            None => return Ok(()),
        };
        let stored = self.storage.latest_version(endpoint.kind, &Role::Targets)?;
        if stored == Some(expected) {
            return Ok(());
        }

        let url = endpoint.role_url(&file_name)?;
        let bytes = self.get(url)?;
        let trusted = TrustedRole::for_role(root, &Role::Targets)?;
        let verified: SignedMetadata<TargetsBody> =
            verifier::verify(&trusted, &Role::Targets, &bytes, self.clock.now())?;
        if verified.version != expected {
            return Err(Error::SecurityException(format!(
                "targets version {} does not match snapshot's expected {}",
                verified.version, expected
            )));
        }
        self.storage.store_role(endpoint.kind, &Role::Targets, verified.version, &verified.original_json)?;
        Ok(())
    }

    /// Fetch and verify one delegated Targets role by file name, trusted
    /// via the key set its parent declares.
    fn fetch_delegation(
        &self,
        endpoint: &RepositoryEndpoint,
        snapshot: &Snapshot,
        parent: &Targets,
        name: &str,
    ) -> Result<Targets, Error> {
        let delegation = parent
            .delegations
            .iter()
            .flatten()
            .find(|d| d.name == name)
            .ok_or_else(|| Error::InvalidMetadata(format!("no such delegation: {}", name)))?;
        let role = Role::Delegation(name.to_string());
        let file_name = role.file_name();

        let url = endpoint.role_url(&file_name)?;
        let bytes = self.get(url)?;
        let trusted = TrustedRole::for_delegation(parent, delegation);
        let verified: SignedMetadata<TargetsBody> = verifier::verify(&trusted, &role, &bytes, self.clock.now())?;

        if let Some(expected) = snapshot.expected_version(&file_name) {
            if verified.version != expected {
                return Err(Error::SecurityException(format!(
                    "delegation {} version {} does not match snapshot's expected {}",
                    name, verified.version, expected
                )));
            }
        }
        self.storage.store_role(endpoint.kind, &role, verified.version, &verified.original_json)?;
        Targets::from_wire(endpoint.kind, verified)
    }

    /// Walk the delegation tree depth-first looking for `filename`,
    /// stopping at the first match and refusing to revisit a role name
    /// on this walk (a cycle guard), bounded by `MAX_DELEGATION_DEPTH`.
    pub fn resolve_target(
        &self,
        endpoint: &RepositoryEndpoint,
        snapshot: &Snapshot,
        top_targets: &Targets,
        filename: &str,
    ) -> Result<Option<Target>, Error> {
        if let Some(target) = top_targets.find(filename) {
            return Ok(Some(target.clone()));
        }
        let mut visited = HashSet::new();
        self.walk_delegations(endpoint, snapshot, top_targets, filename, &mut visited, 0)
    }

    fn walk_delegations(
        &self,
        endpoint: &RepositoryEndpoint,
        snapshot: &Snapshot,
        parent: &Targets,
        filename: &str,
        visited: &mut HashSet<String>,
        depth: u32,
    ) -> Result<Option<Target>, Error> {
        if depth >= MAX_DELEGATION_DEPTH {
            warn!("delegation depth bound ({}) reached while resolving {}", MAX_DELEGATION_DEPTH, filename);
            return Ok(None);
        }
        for delegation in parent.delegations_matching(filename) {
            if !visited.insert(delegation.name.clone()) {
                continue; // already visited this role on this walk: cycle
            }
            debug!("descending into delegation {} for {}", delegation.name, filename);
            let child = self.fetch_delegation(endpoint, snapshot, parent, &delegation.name)?;
            if let Some(target) = child.find(filename) {
                return Ok(Some(target.clone()));
            }
            if let Some(found) = self.walk_delegations(endpoint, snapshot, &child, filename, visited, depth + 1)? {
                return Ok(Some(found));
            }
            if delegation.terminating {
                return Ok(None);
            }
        }
        Ok(None)
    }
}
