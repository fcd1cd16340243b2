//! Android A/B `PackageManager`, shaped after the same shell-out pattern
//! as [`super::ostree`]: drive `update_engine_client` instead of
//! `ostree`, since Android's updater is a CLI-controlled daemon rather
//! than a library this crate could link.

use std::process::{Command, Output};

use log::debug;

use crate::error::Error;
use crate::metadata::Target;
use crate::pacman::{InstallOutcome, PackageManager};

/// Talks to Android's `update_engine` over its client CLI, applying a
/// payload to the inactive A/B slot.
pub struct AndroidPackageManager {
    update_engine_client: String,
}

impl AndroidPackageManager {
    pub fn new(update_engine_client: impl Into<String>) -> Self {
        AndroidPackageManager { update_engine_client: update_engine_client.into() }
    }

    fn run(&self, args: &[&str]) -> Result<Output, Error> {
        debug!("running `{}` with args: {:?}", self.update_engine_client, args);
        Command::new(&self.update_engine_client)
            .args(args)
            .output()
            .map_err(|err| Error::Pacman(format!("update_engine_client: {}", err)))
            .and_then(|output| {
                if output.status.success() {
                    Ok(output)
                } else {
                    let stderr = String::from_utf8_lossy(&output.stderr).into_owned();
                    Err(Error::Pacman(format!("update_engine_client failed: {}", stderr)))
                }
            })
    }

    fn current_slot_version(&self) -> Result<Option<String>, Error> {
        let output = self.run(&["--status"])?;
        let stdout = String::from_utf8_lossy(&output.stdout);
        for line in stdout.lines() {
            if let Some(version) = line.strip_prefix("CURRENT_VERSION=") {
                return Ok(Some(version.trim().to_string()));
            }
        }
        Ok(None)
    }
}

impl PackageManager for AndroidPackageManager {
    /// `path` is the staged A/B payload; `update_engine` applies it to the
    /// inactive slot and marks it bootable, but the switch only takes effect
    /// after a reboot into that slot.
    fn install(&self, _target: &Target, path: &std::path::Path) -> Result<InstallOutcome, Error> {
        if !path.exists() {
            return Err(Error::Pacman(format!("no staged android payload at {:?}", path)));
        }
        let payload = path.to_string_lossy();
        self.run(&["--update", "--payload", &format!("file://{}", payload)])?;
        Ok(InstallOutcome::NeedsCompletion)
    }

    fn finalize_install(&self, target: &Target) -> Result<(), Error> {
        match self.current_slot_version()? {
            Some(ref version) if version == &target.filename => Ok(()),
            Some(version) => Err(Error::Pacman(format!(
                "expected to boot {}, currently on {}",
                target.filename, version
            ))),
            None => Err(Error::Pacman("could not determine active android slot version".into())),
        }
    }

    fn installed_version(&self) -> Result<Option<String>, Error> {
        self.current_slot_version()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn install_rejects_missing_staged_payload() {
        let pacman = AndroidPackageManager::new("update_engine_client");
        let target = Target::new(
            "ota-payload",
            "p1",
            4,
            {
                let mut hashes = std::collections::HashSet::new();
                hashes.insert(crate::metadata::Hash::new(crate::metadata::HashAlgorithm::Sha256, b"fw"));
                hashes
            },
        )
        .unwrap();
        let err = pacman.install(&target, std::path::Path::new("/nonexistent")).unwrap_err();
        assert!(matches!(err, Error::Pacman(_)));
    }
}
