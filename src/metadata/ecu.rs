use std::fmt::{self, Display, Formatter};

use serde::{Deserialize, Serialize};

use crate::metadata::key::PublicKey;

/// Opaque, non-empty, device-unique ECU identifier.
#[derive(Serialize, Deserialize, Hash, Eq, PartialEq, Debug, Clone, PartialOrd, Ord)]
#[serde(transparent)]
pub struct EcuSerial(pub String);

impl Display for EcuSerial {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Opaque, non-empty hardware identifier shared by all ECUs of the same
/// hardware revision.
#[derive(Serialize, Deserialize, Hash, Eq, PartialEq, Debug, Clone, PartialOrd, Ord)]
#[serde(transparent)]
pub struct HardwareId(pub String);

impl Display for HardwareId {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Serialize, Deserialize, Hash, Eq, PartialEq, Debug, Clone, Copy)]
pub enum EcuRole {
    Primary,
    Secondary,
}

/// Why an ECU is considered misconfigured, distinguishing a stale
/// registration from one the Director never saw at all.
#[derive(Serialize, Deserialize, Hash, Eq, PartialEq, Debug, Clone, Copy)]
pub enum MisconfiguredReason {
    Old,
    NotRegistered,
}

#[derive(Serialize, Deserialize, Hash, Eq, PartialEq, Debug, Clone, Copy)]
pub enum EcuState {
    Configured,
    Pending,
    Installed,
    Misconfigured(MisconfiguredReason),
}

/// One ECU known to this device: its identity, registered public key, and
/// current registration state.
#[derive(Debug, Clone, PartialEq)]
pub struct EcuRecord {
    pub serial: EcuSerial,
    pub hwid: HardwareId,
    pub role: EcuRole,
    pub public_key: PublicKey,
    pub state: EcuState,
}

impl EcuRecord {
    pub fn is_primary(&self) -> bool {
        matches!(self.role, EcuRole::Primary)
    }
}
