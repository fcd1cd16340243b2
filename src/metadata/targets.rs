use std::collections::{HashMap, HashSet};

use serde::Deserialize;
use serde_json as json;

use crate::error::Error;
use crate::metadata::delegation::{DelegationDef, PathPattern};
use crate::metadata::expiry::Expiry;
use crate::metadata::hash::{Hash, HashAlgorithm};
use crate::metadata::key::{KeyId, KeyKind, PublicKey};
use crate::metadata::role::{RepositoryKind, Role, RoleType, Version};
use crate::metadata::signed::SignedMetadata;
use crate::metadata::target::Target;

/// A Targets role document: the targets it lists directly, plus any
/// delegations to subordinate Targets roles.
#[derive(Debug, Clone)]
pub struct Targets {
    pub repo: RepositoryKind,
    pub version: Version,
    pub expires: Expiry,
    pub original_json: Vec<u8>,
    pub targets: Vec<Target>,
    pub delegations: Option<Vec<DelegationDef>>,
    /// Public keys of delegated roles, keyed by key id.
    pub delegation_keys: HashMap<KeyId, PublicKey>,
}

impl Targets {
    pub fn find(&self, filename: &str) -> Option<&Target> {
        self.targets.iter().find(|t| t.filename == filename)
    }

    /// Delegations whose path patterns match `filename`, in declaration
    /// order.
    pub fn delegations_matching<'a>(&'a self, filename: &'a str) -> impl Iterator<Item = &'a DelegationDef> {
        self.delegations
            .iter()
            .flatten()
            .filter(move |d| d.matches_filename(filename))
    }

    pub fn from_wire(repo: RepositoryKind, meta: SignedMetadata<TargetsBody>) -> Result<Targets, Error> {
        let mut targets = Vec::with_capacity(meta.body.targets.len());
        for (filename, wire) in meta.body.targets {
            targets.push(wire.into_target(filename)?);
        }
        let mut delegation_keys = HashMap::new();
        let delegations = meta.body.delegations.map(|wd| {
            for (id, wire_key) in wd.keys {
                delegation_keys.insert(id.clone(), PublicKey::with_id(wire_key.keytype, wire_key.keyval.public, id));
            }
            wd.roles
                .into_iter()
                .map(|role| DelegationDef {
                    name: role.name,
                    parent: Role::Targets,
                    key_ids: role.keyids,
                    threshold: role.threshold,
                    paths: role.paths.into_iter().map(PathPattern).collect(),
                    terminating: role.terminating,
                })
                .collect()
        });
        Ok(Targets {
            repo,
            version: meta.version,
            expires: meta.expires,
            original_json: meta.original_json,
            targets,
            delegations,
            delegation_keys,
        })
    }
}

/// The on-the-wire shape of a Targets role's `signed` body.
#[derive(Deserialize, Debug, Clone)]
pub struct TargetsBody {
    #[serde(rename = "_type")]
    pub role_type: RoleType,
    pub version: Version,
    pub expires: Expiry,
    pub targets: HashMap<String, WireTargetMeta>,
    pub delegations: Option<WireDelegations>,
}

#[derive(Deserialize, Debug, Clone)]
pub struct WireTargetMeta {
    pub length: u64,
    pub hashes: HashMap<HashAlgorithm, String>,
    pub custom: Option<json::Value>,
}

impl WireTargetMeta {
    fn into_target(self, filename: String) -> Result<Target, Error> {
        let hashes: HashSet<Hash> = self
            .hashes
            .into_iter()
            .map(|(algorithm, digest)| Hash { algorithm, digest: digest.to_uppercase() })
            .collect();
        let ecu_identifier = self
            .custom
            .as_ref()
            .and_then(|c| c.get("ecuIdentifier"))
            .and_then(|v| v.as_str())
            .unwrap_or("")
            .to_string();
        let custom_format = self.custom.as_ref().map(|c| c.to_string());
        let target = Target { filename, ecu_identifier, length: self.length, hashes, custom_format };
        if !target.is_well_formed() {
            return Err(Error::InvalidMetadata(format!("target {} has no strong hash", target.filename)));
        }
        Ok(target)
    }
}

#[derive(Deserialize, Debug, Clone)]
pub struct WireDelegations {
    pub keys: HashMap<KeyId, WireDelegationKey>,
    pub roles: Vec<WireDelegationRole>,
}

#[derive(Deserialize, Debug, Clone)]
pub struct WireDelegationKey {
    pub keytype: KeyKind,
    pub keyval: WireDelegationKeyVal,
}

#[derive(Deserialize, Debug, Clone)]
pub struct WireDelegationKeyVal {
    pub public: String,
}

#[derive(Deserialize, Debug, Clone)]
pub struct WireDelegationRole {
    pub name: String,
    pub keyids: HashSet<KeyId>,
    pub threshold: u32,
    pub paths: Vec<String>,
    #[serde(default)]
    pub terminating: bool,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    use crate::metadata::delegation::PathPattern;
    use crate::metadata::hash::{Hash, HashAlgorithm};
    use crate::metadata::role::Role;

    fn sample_target(name: &str) -> Target {
        let mut hashes = HashSet::new();
        hashes.insert(Hash::new(HashAlgorithm::Sha256, name.as_bytes()));
        Target::new(name, "p1", 10, hashes).unwrap()
    }

    #[test]
    fn find_looks_up_by_filename() {
        let targets = Targets {
            repo: RepositoryKind::Director,
            version: Version(1),
            expires: Expiry::parse("2030-01-01T00:00:00Z").unwrap(),
            original_json: vec![],
            targets: vec![sample_target("firmware.bin")],
            delegations: None,
            delegation_keys: HashMap::new(),
        };
        assert!(targets.find("firmware.bin").is_some());
        assert!(targets.find("missing.bin").is_none());
    }

    #[test]
    fn delegations_matching_filters_by_path() {
        let matching = DelegationDef {
            name: "promoted".into(),
            parent: Role::Targets,
            key_ids: HashSet::new(),
            threshold: 1,
            paths: vec![PathPattern("director/*.bin".into())],
            terminating: false,
        };
        let non_matching = DelegationDef {
            paths: vec![PathPattern("other/*.bin".into())],
            ..matching.clone()
        };
        let targets = Targets {
            repo: RepositoryKind::Director,
            version: Version(1),
            expires: Expiry::parse("2030-01-01T00:00:00Z").unwrap(),
            original_json: vec![],
            targets: vec![],
            delegations: Some(vec![matching.clone(), non_matching]),
            delegation_keys: HashMap::new(),
        };
        let found: Vec<_> = targets.delegations_matching("director/firmware.bin").collect();
        assert_eq!(found, vec![&matching]);
    }
}
