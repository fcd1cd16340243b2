//! The package manager capability: dynamic dispatch over a trait rather
//! than a closed enum of backends, since an engine only ever needs one
//! concrete backend alive at a time. Two real backends ship — OSTree-based
//! image updates and Android's package installer — plus a `None`
//! variant for hosts with no package manager at all (tests, or an ECU
//! that only relays metadata). Concrete backends are feature-gated so a
//! build for one target doesn't drag in tooling for another.

#[cfg(feature = "pacman-ostree")]
pub mod ostree;

#[cfg(feature = "pacman-android")]
pub mod android;

use std::path::Path;

use crate::error::Error;
use crate::metadata::Target;

/// What happened when a package manager tried to install a target.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstallOutcome {
    /// Installed and active immediately.
    Installed,
    /// Staged; takes effect only after a reboot and a `finalize_install`
    /// call on the next `Initialize`.
    NeedsCompletion,
}

/// The capability every package manager backend provides, dispatched at
/// startup rather than through generics so the engine can hold a single
/// `Box<dyn PackageManager>` regardless of which backend was selected —
/// a trait object rather than a data enum with match arms, since nothing
/// downstream ever needs to ask "which backend am I".
pub trait PackageManager: Send + Sync {
    /// Install `target`'s downloaded bytes, read from `path`.
    fn install(&self, target: &Target, path: &Path) -> Result<InstallOutcome, Error>;

    /// Complete an install that previously returned `NeedsCompletion`,
    /// called once at `Initialize` before anything else touches this ECU.
    fn finalize_install(&self, target: &Target) -> Result<(), Error>;

    /// The version currently active on the device, if the backend can
    /// report one (used to make a repeated firmware send a no-op, spec
    /// §4.E: "a repeated call with an already-matching installed version
    /// is a no-op returning success").
    fn installed_version(&self) -> Result<Option<String>, Error>;
}

/// No package manager at all: every install attempt fails outright. Used
/// for ECUs that exist purely to relay metadata, and by default in tests
/// that don't exercise installation.
#[derive(Default)]
pub struct NoPackageManager;

impl PackageManager for NoPackageManager {
    fn install(&self, target: &Target, _path: &Path) -> Result<InstallOutcome, Error> {
        Err(Error::Storage(format!("no package manager configured, cannot install {}", target.filename)))
    }

    fn finalize_install(&self, target: &Target) -> Result<(), Error> {
        Err(Error::Storage(format!("no package manager configured, cannot finalize {}", target.filename)))
    }

    fn installed_version(&self) -> Result<Option<String>, Error> {
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn no_package_manager_refuses_every_install() {
        let pacman = NoPackageManager;
        let target = crate::metadata::Target::new(
            "firmware.bin",
            "p1",
            4,
            {
                let mut hashes = std::collections::HashSet::new();
                hashes.insert(crate::metadata::Hash::new(crate::metadata::HashAlgorithm::Sha256, b"fw"));
                hashes
            },
        )
        .unwrap();
        assert!(pacman.install(&target, Path::new("/tmp/fw.bin")).is_err());
        assert!(pacman.installed_version().unwrap().is_none());
    }
}
