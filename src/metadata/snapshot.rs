use std::collections::HashMap;

use serde::Deserialize;

use crate::metadata::expiry::Expiry;
use crate::metadata::role::{RepositoryKind, RoleType, Version};
use crate::metadata::signed::SignedMetadata;

/// A Snapshot role document: the version every other role file is
/// expected to be at. Keyed by role file name
/// (e.g. `"targets.json"`, `"promoted.json"`) rather than `Role` directly,
/// since delegated roles are addressed by file name on the wire.
#[derive(Debug, Clone)]
pub struct Snapshot {
    pub repo: RepositoryKind,
    pub version: Version,
    pub expires: Expiry,
    pub original_json: Vec<u8>,
    pub meta_versions: HashMap<String, Version>,
}

impl Snapshot {
    pub fn expected_version(&self, role_file: &str) -> Option<Version> {
        self.meta_versions.get(role_file).copied()
    }

    pub fn from_wire(repo: RepositoryKind, meta: SignedMetadata<SnapshotBody>) -> Snapshot {
        let meta_versions = meta.body.meta.into_iter().map(|(file, m)| (file, m.version)).collect();
        Snapshot { repo, version: meta.version, expires: meta.expires, original_json: meta.original_json, meta_versions }
    }
}

/// The on-the-wire shape of a Snapshot role's `signed` body.
#[derive(Deserialize, Debug, Clone)]
pub struct SnapshotBody {
    #[serde(rename = "_type")]
    pub role_type: RoleType,
    pub version: Version,
    pub expires: Expiry,
    pub meta: HashMap<String, WireSnapshotMeta>,
}

#[derive(Deserialize, Debug, Clone)]
pub struct WireSnapshotMeta {
    pub version: Version,
}

#[cfg(test)]
mod tests {
    use super::*;
    use maplit::hashmap;

    #[test]
    fn expected_version_looks_up_by_role_file() {
        let snapshot = Snapshot {
            repo: RepositoryKind::Image,
            version: Version(1),
            expires: Expiry::parse("2030-01-01T00:00:00Z").unwrap(),
            original_json: vec![],
            meta_versions: hashmap! { "targets.json".to_string() => Version(4) },
        };
        assert_eq!(snapshot.expected_version("targets.json"), Some(Version(4)));
        assert_eq!(snapshot.expected_version("missing.json"), None);
    }
}
