//! OSTree-backed `PackageManager`: shell out to the `ostree` binary
//! rather than linking libostree, and track the currently-deployed
//! commit through `ostree admin status`.

use std::fmt::Debug;
use std::ffi::OsStr;
use std::path::Path;
use std::process::{Command, Output};
use std::str;

use log::debug;

use crate::error::Error;
use crate::metadata::Target;
use crate::pacman::{InstallOutcome, PackageManager};

const OSTREE_REPO: &str = "/sysroot/ostree/repo";
const OSTREE_BOOT_PARTITION: &str = "/boot";

/// Drives the `ostree` CLI against a fixed sysroot/repo pair, setting
/// `OSTREE_REPO`/`OSTREE_BOOT_PARTITION`/`OSTREE_SYSROOT` on every
/// invocation.
pub struct OstreePackageManager {
    sysroot: String,
}

impl OstreePackageManager {
    pub fn new(sysroot: impl Into<String>) -> Self {
        OstreePackageManager { sysroot: sysroot.into() }
    }

    fn run<S: AsRef<OsStr> + Debug>(&self, args: &[S]) -> Result<Output, Error> {
        debug!("running `ostree` with args: {:?}", args);
        Command::new("ostree")
            .args(args)
            .env("OSTREE_REPO", OSTREE_REPO)
            .env("OSTREE_BOOT_PARTITION", OSTREE_BOOT_PARTITION)
            .env("OSTREE_SYSROOT", &self.sysroot)
            .output()
            .map_err(|err| Error::Pacman(format!("ostree: {}", err)))
            .and_then(|output| {
                if output.status.success() {
                    Ok(output)
                } else {
                    let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
                    let stderr = String::from_utf8_lossy(&output.stderr).into_owned();
                    Err(Error::Pacman(format!("ostree failed\nstdout: {}\nstderr: {}", stdout, stderr)))
                }
            })
    }

    /// The commit hash of the currently-booted deployment, parsed out of
    /// `ostree admin status`'s `*`-prefixed line.
    fn current_commit(&self) -> Result<Option<String>, Error> {
        let output = self.run::<&str>(&["admin", "status"])?;
        let stdout = str::from_utf8(&output.stdout).map_err(|e| Error::Parse(e.to_string()))?;
        for chunk in stdout.lines().map(str::trim).filter(|l| !l.is_empty()).collect::<Vec<_>>().chunks(2) {
            if chunk.len() < 2 {
                continue;
            }
            let first: Vec<&str> = chunk[0].split(' ').collect();
            let is_current = matches!(first.first(), Some(&"*"));
            if !is_current {
                continue;
            }
            let commit_name = match first.len() {
                3 => first[2],
                _ => continue,
            };
            let commit = commit_name.split('.').next().unwrap_or(commit_name);
            return Ok(Some(commit.to_string()));
        }
        Ok(None)
    }
}

impl PackageManager for OstreePackageManager {
    /// `path` holds a static-delta or bare commit object pulled by the fetcher;
    /// this just tells OSTree to deploy the commit named by `target.filename`
    /// (the target's custom `ecuIdentifier`/ref naming is resolved upstream).
    fn install(&self, target: &Target, path: &Path) -> Result<InstallOutcome, Error> {
        if !path.exists() {
            return Err(Error::Pacman(format!("no staged ostree content at {:?}", path)));
        }
        let commit = target.filename.as_str();
        self.run(&["admin", "deploy", "--karg-proc-cmdline", commit])?;
        // A new deployment only takes effect after the next reboot into it.
        Ok(InstallOutcome::NeedsCompletion)
    }

    /// Called once at `Initialize`: if the booted commit now matches the
    /// staged target, the reboot happened and the install completed.
    fn finalize_install(&self, target: &Target) -> Result<(), Error> {
        match self.current_commit()? {
            Some(ref commit) if commit == &target.filename => Ok(()),
            Some(commit) => Err(Error::Pacman(format!(
                "expected to boot {}, currently on {}",
                target.filename, commit
            ))),
            None => Err(Error::Pacman("could not determine booted ostree commit".into())),
        }
    }

    fn installed_version(&self) -> Result<Option<String>, Error> {
        self.current_commit()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn install_rejects_missing_staged_content() {
        let pacman = OstreePackageManager::new("/sysroot");
        let target = Target::new(
            "deadbeef",
            "p1",
            4,
            {
                let mut hashes = std::collections::HashSet::new();
                hashes.insert(crate::metadata::Hash::new(crate::metadata::HashAlgorithm::Sha256, b"fw"));
                hashes
            },
        )
        .unwrap();
        let err = pacman.install(&target, Path::new("/nonexistent/path")).unwrap_err();
        assert!(matches!(err, Error::Pacman(_)));
    }
}
