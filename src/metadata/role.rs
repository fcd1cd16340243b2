use std::fmt::{self, Display, Formatter};
use std::str::FromStr;

use serde::de::{Deserialize, Deserializer, Error as SerdeError};
use serde::{Serialize, Serializer};
use serde_json as json;

use crate::error::Error;

/// Which of the two independent Uptane repositories a piece of metadata
/// came from. Director and Image must agree about every installed target.
#[derive(Serialize, Deserialize, Hash, Eq, PartialEq, Debug, Clone, Copy)]
pub enum RepositoryKind {
    Director,
    Image,
}

impl Display for RepositoryKind {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        match *self {
            RepositoryKind::Director => write!(f, "director"),
            RepositoryKind::Image => write!(f, "image"),
        }
    }
}

/// The role of a piece of signed metadata. `Delegation` carries the
/// delegated role's name; equality on `Delegation` ignores which Targets
/// role declared it.
#[derive(Eq, Debug, Clone)]
pub enum Role {
    Root,
    Timestamp,
    Snapshot,
    Targets,
    Delegation(String),
}

impl PartialEq for Role {
    fn eq(&self, other: &Role) -> bool {
        match (self, other) {
            (Role::Root, Role::Root) => true,
            (Role::Timestamp, Role::Timestamp) => true,
            (Role::Snapshot, Role::Snapshot) => true,
            (Role::Targets, Role::Targets) => true,
            (Role::Delegation(a), Role::Delegation(b)) => a == b,
            _ => false,
        }
    }
}

impl std::hash::Hash for Role {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        match self {
            Role::Root => 0u8.hash(state),
            Role::Timestamp => 1u8.hash(state),
            Role::Snapshot => 2u8.hash(state),
            Role::Targets => 3u8.hash(state),
            Role::Delegation(name) => {
                4u8.hash(state);
                name.hash(state);
            }
        }
    }
}

impl Role {
    /// The `_type` field every delegated Targets role carries is `Targets`,
    /// not its own delegated name.
    pub fn expected_type(&self) -> RoleType {
        match self {
            Role::Root => RoleType::Root,
            Role::Timestamp => RoleType::Timestamp,
            Role::Snapshot => RoleType::Snapshot,
            Role::Targets | Role::Delegation(_) => RoleType::Targets,
        }
    }

    /// The file name used to fetch this role's metadata, e.g. `root.json`.
    pub fn file_name(&self) -> String {
        match self {
            Role::Root => "root.json".into(),
            Role::Timestamp => "timestamp.json".into(),
            Role::Snapshot => "snapshot.json".into(),
            Role::Targets => "targets.json".into(),
            Role::Delegation(name) => format!("{}.json", name),
        }
    }
}

impl Display for Role {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        match self {
            Role::Root => write!(f, "root"),
            Role::Timestamp => write!(f, "timestamp"),
            Role::Snapshot => write!(f, "snapshot"),
            Role::Targets => write!(f, "targets"),
            Role::Delegation(name) => write!(f, "{}", name),
        }
    }
}

impl Serialize for Role {
    fn serialize<S: Serializer>(&self, ser: S) -> Result<S::Ok, S::Error> {
        ser.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for Role {
    fn deserialize<D: Deserializer<'de>>(de: D) -> Result<Role, D::Error> {
        let raw = String::deserialize(de)?;
        Ok(match raw.as_str() {
            "root" => Role::Root,
            "timestamp" => Role::Timestamp,
            "snapshot" => Role::Snapshot,
            "targets" => Role::Targets,
            other => Role::Delegation(other.to_string()),
        })
    }
}

/// The `_type` tag embedded in `signed` documents. Only the four top-level
/// roles have a distinct `_type`; delegations always claim `Targets`.
#[derive(Serialize, Hash, Eq, PartialEq, Debug, Clone, Copy)]
#[serde(rename_all = "lowercase")]
pub enum RoleType {
    Root,
    Targets,
    Snapshot,
    Timestamp,
}

impl FromStr for RoleType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "root" | "Root" => Ok(RoleType::Root),
            "snapshot" | "Snapshot" => Ok(RoleType::Snapshot),
            "targets" | "Targets" => Ok(RoleType::Targets),
            "timestamp" | "Timestamp" => Ok(RoleType::Timestamp),
            _ => Err(Error::InvalidMetadata(format!("unknown role _type: {}", s))),
        }
    }
}

impl Display for RoleType {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        match *self {
            RoleType::Root => write!(f, "root"),
            RoleType::Targets => write!(f, "targets"),
            RoleType::Snapshot => write!(f, "snapshot"),
            RoleType::Timestamp => write!(f, "timestamp"),
        }
    }
}

impl<'de> Deserialize<'de> for RoleType {
    fn deserialize<D: Deserializer<'de>>(de: D) -> Result<RoleType, D::Error> {
        if let json::Value::String(ref s) = json::Value::deserialize(de)? {
            s.parse().map_err(|err| SerdeError::custom(format!("unknown _type: {}", err)))
        } else {
            Err(SerdeError::custom("`_type` must be a string"))
        }
    }
}

/// A non-negative metadata version. `AnyVersion` lets callers query "the
/// latest whatever that is" without caring about the exact number.
#[derive(Serialize, Deserialize, Hash, Eq, PartialEq, PartialOrd, Ord, Debug, Clone, Copy)]
#[serde(transparent)]
pub struct Version(pub u64);

impl Version {
    pub const ZERO: Version = Version(0);

    pub fn next(self) -> Version {
        Version(self.0 + 1)
    }
}

impl Display for Version {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A distinguished version value meaning "don't filter by version" for
/// lookup operations. Not itself a valid `Version` on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VersionQuery {
    Exact(Version),
    Any,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delegation_equality_ignores_parent() {
        let a = Role::Delegation("promoted".into());
        let b = Role::Delegation("promoted".into());
        assert_eq!(a, b);
        assert_ne!(a, Role::Delegation("other".into()));
        assert_ne!(a, Role::Targets);
    }

    #[test]
    fn delegation_expects_targets_type() {
        assert_eq!(Role::Delegation("x".into()).expected_type(), RoleType::Targets);
        assert_eq!(Role::Root.expected_type(), RoleType::Root);
    }

    #[test]
    fn version_ordering_is_total() {
        assert!(Version(1) < Version(2));
        assert!(Version(5).next() == Version(6));
    }
}
