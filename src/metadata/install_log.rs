use serde::{Deserialize, Serialize};

use crate::metadata::ecu::EcuSerial;
use crate::metadata::target::Target;

/// An append-only record of one successful install cycle for one ECU
///. Entries are never edited once
/// appended; `Installer` is the only writer.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct InstallationLogEntry {
    pub ecu: EcuSerial,
    pub targets: Vec<Target>,
}

/// At most one outstanding install per ECU. `raw_report` is set by `setInstallationRawReport` and
/// consumed by the next `sendManifest` call.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct PendingInstall {
    pub ecu: EcuSerial,
    pub target: Target,
    pub raw_report: Option<String>,
}

impl PendingInstall {
    pub fn new(ecu: EcuSerial, target: Target) -> PendingInstall {
        PendingInstall { ecu, target, raw_report: None }
    }

    /// Applies an override report, returning whether there was a pending
    /// row to update.
    pub fn set_raw_report(&mut self, text: String) {
        self.raw_report = Some(text);
    }

    /// Consumes the override so it is attached to exactly one manifest.
    pub fn take_raw_report(&mut self) -> Option<String> {
        self.raw_report.take()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    use crate::metadata::hash::{Hash, HashAlgorithm};

    fn target() -> Target {
        let mut hashes = HashSet::new();
        hashes.insert(Hash::new(HashAlgorithm::Sha256, b"firmware"));
        Target::new("firmware.bin", "p1", 8, hashes).unwrap()
    }

    #[test]
    fn raw_report_is_consumed_once() {
        let mut pending = PendingInstall::new(EcuSerial("p1".into()), target());
        pending.set_raw_report("custom report".into());
        assert_eq!(pending.take_raw_report(), Some("custom report".to_string()));
        assert_eq!(pending.take_raw_report(), None);
    }
}
