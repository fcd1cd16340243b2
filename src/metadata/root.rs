use std::collections::{HashMap, HashSet};

use serde::Deserialize;

use crate::metadata::expiry::Expiry;
use crate::metadata::key::{KeyId, KeyKind, PublicKey};
use crate::metadata::role::{RepositoryKind, Role, RoleType, Version};
use crate::metadata::signed::SignedMetadata;

/// Threshold bounds shared by every role.
pub const MIN_THRESHOLD: u32 = 1;
pub const MAX_THRESHOLD: u32 = 1000;

/// The trust root for one repository: every known key, plus the
/// signature threshold and authorized key set for each top-level role.
#[derive(Debug, Clone)]
pub struct Root {
    pub repo: RepositoryKind,
    pub version: Version,
    pub expires: Expiry,
    pub original_json: Vec<u8>,
    pub keys: HashMap<KeyId, PublicKey>,
    pub thresholds: HashMap<Role, u32>,
    pub role_keys: HashMap<Role, HashSet<KeyId>>,
}

impl Root {
    /// For every top-level role, `thresholds[role]` is in bounds and the
    /// authorized key set is at least as large as the threshold. Does not
    /// check delegated roles, whose thresholds live in their declaring
    /// `DelegationDef` instead.
    pub fn has_valid_thresholds(&self) -> bool {
        [Role::Root, Role::Timestamp, Role::Snapshot, Role::Targets]
            .iter()
            .all(|role| self.role_is_well_formed(role))
    }

    fn role_is_well_formed(&self, role: &Role) -> bool {
        let threshold = match self.thresholds.get(role) {
            Some(t) => *t,
            None => return false,
        };
        if !(MIN_THRESHOLD..=MAX_THRESHOLD).contains(&threshold) {
            return false;
        }
        self.role_keys
            .get(role)
            .map(|keys| keys.len() as u32 >= threshold)
            .unwrap_or(false)
    }

    pub fn key(&self, key_id: &KeyId) -> Option<&PublicKey> {
        self.keys.get(key_id)
    }

    pub fn threshold_for(&self, role: &Role) -> Option<u32> {
        self.thresholds.get(role).copied()
    }

    pub fn authorized_keys_for(&self, role: &Role) -> Option<&HashSet<KeyId>> {
        self.role_keys.get(role)
    }

    /// Build a `Root` from a parsed-but-unverified `root.json` body.
    pub fn from_wire(repo: RepositoryKind, meta: SignedMetadata<RootBody>) -> Root {
        let keys = meta
            .body
            .keys
            .into_iter()
            .map(|(id, wire)| (id.clone(), PublicKey::with_id(wire.keytype, wire.keyval.public, id)))
            .collect();
        let thresholds = meta.body.roles.iter().map(|(role, data)| (role.clone(), data.threshold)).collect();
        let role_keys = meta.body.roles.into_iter().map(|(role, data)| (role, data.keyids)).collect();
        Root {
            repo,
            version: meta.version,
            expires: meta.expires,
            original_json: meta.original_json,
            keys,
            thresholds,
            role_keys,
        }
    }
}

/// The on-the-wire shape of a `root.json`'s `signed` body (TUF's
/// `keys`/`roles` maps), deserialized before conversion into the
/// domain `Root` type above.
#[derive(Deserialize, Debug, Clone)]
pub struct RootBody {
    #[serde(rename = "_type")]
    pub role_type: RoleType,
    pub version: Version,
    pub expires: Expiry,
    pub keys: HashMap<KeyId, WireKey>,
    pub roles: HashMap<Role, WireRoleData>,
}

#[derive(Deserialize, Debug, Clone)]
pub struct WireKey {
    pub keytype: KeyKind,
    pub keyval: WireKeyVal,
}

#[derive(Deserialize, Debug, Clone)]
pub struct WireKeyVal {
    pub public: String,
}

#[derive(Deserialize, Debug, Clone)]
pub struct WireRoleData {
    pub keyids: HashSet<KeyId>,
    pub threshold: u32,
}

#[cfg(test)]
mod tests {
    use super::*;
    use maplit::{hashmap, hashset};

    fn key(id: &str) -> (KeyId, PublicKey) {
        let pk = PublicKey::new(crate::metadata::key::KeyKind::Ed25519, id.to_string()).unwrap();
        (pk.key_id.clone(), pk)
    }

    #[test]
    fn rejects_threshold_larger_than_key_set() {
        let (id, pk) = key("a");
        let root = Root {
            repo: RepositoryKind::Director,
            version: Version(1),
            expires: Expiry::parse("2030-01-01T00:00:00Z").unwrap(),
            original_json: vec![],
            keys: hashmap! { id.clone() => pk },
            thresholds: hashmap! {
                Role::Root => 2, Role::Timestamp => 1, Role::Snapshot => 1, Role::Targets => 1,
            },
            role_keys: hashmap! {
                Role::Root => hashset! { id.clone() },
                Role::Timestamp => hashset! { id.clone() },
                Role::Snapshot => hashset! { id.clone() },
                Role::Targets => hashset! { id },
            },
        };
        assert!(!root.has_valid_thresholds());
    }

    #[test]
    fn rejects_threshold_out_of_bounds() {
        let (id, pk) = key("a");
        let root = Root {
            repo: RepositoryKind::Image,
            version: Version(1),
            expires: Expiry::parse("2030-01-01T00:00:00Z").unwrap(),
            original_json: vec![],
            keys: hashmap! { id.clone() => pk },
            thresholds: hashmap! {
                Role::Root => 0, Role::Timestamp => 1, Role::Snapshot => 1, Role::Targets => 1,
            },
            role_keys: hashmap! {
                Role::Root => hashset! { id.clone() },
                Role::Timestamp => hashset! { id.clone() },
                Role::Snapshot => hashset! { id.clone() },
                Role::Targets => hashset! { id },
            },
        };
        assert!(!root.has_valid_thresholds());
    }
}
