//! Typed representation of Uptane's role-based metadata model, one type
//! family per file instead of one flat module.

pub mod delegation;
pub mod ecu;
pub mod expiry;
pub mod hash;
pub mod install_log;
pub mod key;
pub mod role;
pub mod root;
pub mod signed;
pub mod snapshot;
pub mod target;
pub mod targets;
pub mod timestamp;

pub use delegation::{DelegationDef, PathPattern};
pub use ecu::{EcuRecord, EcuRole, EcuSerial, EcuState, HardwareId, MisconfiguredReason};
pub use expiry::Expiry;
pub use hash::{Hash, HashAlgorithm};
pub use install_log::{InstallationLogEntry, PendingInstall};
pub use key::{KeyId, KeyKind, PrivateKey, PublicKey};
pub use role::{RepositoryKind, Role, RoleType, Version, VersionQuery};
pub use root::{Root, RootBody};
pub use signed::{Envelope, Signature, SignatureMethod, SignedHeader, SignedMetadata};
pub use snapshot::{Snapshot, SnapshotBody};
pub use target::{Target, TargetMismatch};
pub use targets::{Targets, TargetsBody};
pub use timestamp::{Timestamp, TimestampBody};
