//! The Installer: per-ECU `Idle -> Downloading -> Verified ->
//! Installing -> PendingReboot? -> Installed | Failed` progression, its
//! crash-safe `PendingInstall` bookkeeping, and reboot-aware finalization.
//! Drives one package-manager install per ECU through
//! [`crate::pacman::PackageManager`] and records progress through
//! [`crate::storage::Storage`] so a crash mid-install can be resumed
//! correctly on the next start.

use std::path::{Path, PathBuf};
use std::time::Duration;

use log::{info, warn};

use crate::error::Error;
use crate::events::{Event, EventSink};
use crate::http::{Client, Request};
use crate::metadata::{EcuSerial, InstallationLogEntry, PendingInstall, Target};
use crate::pacman::{InstallOutcome, PackageManager};
use crate::storage::Storage;

/// Where a downloaded target's bytes land before `install` is called.
/// Atomic rename into place happens in
/// [`download`] itself via [`crate::util::write_file_atomic`].
pub fn staged_path(staging_dir: &Path, target: &Target) -> PathBuf {
    staging_dir.join(&target.filename)
}

/// Download `target`'s bytes from `url`, verify them against the
/// metadata-declared hash/length, and stage them atomically. A verification failure deletes
/// any partial artifact rather than leaving it staged.
pub fn download(
    client: &dyn Client,
    staging_dir: &Path,
    target: &Target,
    url: url::Url,
    timeout: Duration,
) -> Result<PathBuf, Error> {
    let response = client.execute(Request::get(url.clone(), timeout))?;
    if !response.is_success() {
        return Err(Error::Network(format!("GET {} returned HTTP {}", url, response.status)));
    }
    target.verify_bytes(&response.body).map_err(|mismatch| match mismatch {
        crate::metadata::TargetMismatch::Oversized => {
            Error::OversizedTarget(format!("{}: {}", target.filename, mismatch))
        }
        crate::metadata::TargetMismatch::HashMismatch => {
            Error::TargetHashMismatch(format!("{}: {}", target.filename, mismatch))
        }
    })?;

    let path = staged_path(staging_dir, target);
    crate::util::write_file_atomic(&path, &response.body)?;
    Ok(path)
}

/// Install one already-staged, already-verified target onto `ecu`'s
/// package manager, persisting a `PendingInstall` row before the
/// package manager is ever invoked, so a crash mid-install is always
/// resumable from storage, never silently lost.
pub fn install(
    storage: &dyn Storage,
    pacman: &dyn PackageManager,
    sink: &mut dyn EventSink,
    ecu: &EcuSerial,
    target: &Target,
    staged_path: &Path,
) -> Result<InstallOutcome, Error> {
    storage.set_pending(&PendingInstall::new(ecu.clone(), target.clone()))?;
    sink.handle(Event::InstallStarted(ecu.clone()));

    let outcome = pacman.install(target, staged_path);
    match outcome {
        Ok(InstallOutcome::Installed) => {
            storage.append_installed(&InstallationLogEntry { ecu: ecu.clone(), targets: vec![target.clone()] })?;
            storage.clear_pending(ecu)?;
            sink.handle(Event::InstallComplete);
            Ok(InstallOutcome::Installed)
        }
        Ok(InstallOutcome::NeedsCompletion) => {
            // State stays `PendingReboot`: the row persists until a future
            // `finalize_pending` call (possibly after a reboot) succeeds.
            info!("{} install needs a reboot to complete", ecu);
            Ok(InstallOutcome::NeedsCompletion)
        }
        Err(err) => {
            warn!("{} install failed: {}", ecu, err);
            sink.handle(Event::Error((&err).into(), err.to_string()));
            Err(err)
        }
    }
}

/// Called once at `Initialize`, before anything else touches this ECU,
/// to complete an install left in `PendingReboot` by a prior run:
/// calls `finalize_install` on the package manager, and on success
/// clears `Pending` and appends an `InstallationLogEntry`. A no-op if
/// there is no pending row; a finalize failure leaves the row in place
/// so the next `Initialize` retries it.
pub fn finalize_pending(
    storage: &dyn Storage,
    pacman: &dyn PackageManager,
    ecu: &EcuSerial,
) -> Result<Option<InstallationLogEntry>, Error> {
    let pending = match storage.pending(ecu)? {
        Some(pending) => pending,
        None => return Ok(None),
    };
    pacman.finalize_install(&pending.target)?;
    let entry = InstallationLogEntry { ecu: ecu.clone(), targets: vec![pending.target] };
    storage.append_installed(&entry)?;
    storage.clear_pending(ecu)?;
    Ok(Some(entry))
}

/// Apply `SetInstallationRawReport(text)` to `ecu`'s pending row;
/// returns `false` if there is no pending row to update.
pub fn set_pending_raw_report(storage: &dyn Storage, ecu: &EcuSerial, text: String) -> Result<bool, Error> {
    match storage.pending(ecu)? {
        Some(mut pending) => {
            pending.set_raw_report(text);
            storage.set_pending(&pending)?;
            Ok(true)
        }
        None => Ok(false),
    }
}

/// Take (and clear) the override text attached to `ecu`'s pending row,
/// for `SendManifest` to fold into the next ECU manifest.
pub fn take_pending_raw_report(storage: &dyn Storage, ecu: &EcuSerial) -> Result<Option<String>, Error> {
    match storage.pending(ecu)? {
        Some(mut pending) => {
            let report = pending.take_raw_report();
            if report.is_some() {
                storage.set_pending(&pending)?;
            }
            Ok(report)
        }
        None => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;
    use std::sync::Mutex;

    use tempfile::tempdir;

    use super::*;
    use crate::events::NullSink;
    use crate::http::TestClient;
    use crate::metadata::{Hash, HashAlgorithm, RepositoryKind, Role, Version};

    fn target() -> Target {
        let mut hashes = HashSet::new();
        hashes.insert(Hash::new(HashAlgorithm::Sha256, b"firmware bytes"));
        Target::new("firmware.bin", "p1", 14, hashes).unwrap()
    }

    struct RecordingPacman {
        outcome: Mutex<Option<InstallOutcome>>,
    }

    impl PackageManager for RecordingPacman {
        fn install(&self, _target: &Target, _path: &Path) -> Result<InstallOutcome, Error> {
            Ok(self.outcome.lock().unwrap().unwrap())
        }
        fn finalize_install(&self, _target: &Target) -> Result<(), Error> {
            Ok(())
        }
        fn installed_version(&self) -> Result<Option<String>, Error> {
            Ok(None)
        }
    }

    #[derive(Default)]
    struct MemStorage {
        pending: Mutex<Option<PendingInstall>>,
        log: Mutex<Vec<InstallationLogEntry>>,
    }

    impl Storage for MemStorage {
        fn load_role(&self, _repo: RepositoryKind, _role: &Role, _version: Version) -> Result<Option<Vec<u8>>, Error> {
            Ok(None)
        }
        fn store_role(&self, _repo: RepositoryKind, _role: &Role, _version: Version, _bytes: &[u8]) -> Result<(), Error> {
            Ok(())
        }
        fn latest_version(&self, _repo: RepositoryKind, _role: &Role) -> Result<Option<Version>, Error> {
            Ok(None)
        }
        fn ecu_serials(&self) -> Result<Vec<EcuSerial>, Error> {
            Ok(vec![])
        }
        fn store_ecu_serials(&self, _serials: &[EcuSerial]) -> Result<(), Error> {
            Ok(())
        }
        fn pending(&self, ecu: &EcuSerial) -> Result<Option<PendingInstall>, Error> {
            Ok(self.pending.lock().unwrap().clone().filter(|p| &p.ecu == ecu))
        }
        fn set_pending(&self, pending: &PendingInstall) -> Result<(), Error> {
            *self.pending.lock().unwrap() = Some(pending.clone());
            Ok(())
        }
        fn clear_pending(&self, _ecu: &EcuSerial) -> Result<(), Error> {
            *self.pending.lock().unwrap() = None;
            Ok(())
        }
        fn installed_log(&self, ecu: &EcuSerial) -> Result<Vec<InstallationLogEntry>, Error> {
            Ok(self.log.lock().unwrap().iter().filter(|e| &e.ecu == ecu).cloned().collect())
        }
        fn append_installed(&self, entry: &InstallationLogEntry) -> Result<(), Error> {
            self.log.lock().unwrap().push(entry.clone());
            Ok(())
        }
        fn device_id(&self) -> Result<Option<String>, Error> {
            Ok(None)
        }
        fn store_device_id(&self, _device_id: &str) -> Result<(), Error> {
            Ok(())
        }
        fn misconfigured_ecus(&self) -> Result<Vec<(EcuSerial, crate::metadata::MisconfiguredReason)>, Error> {
            Ok(vec![])
        }
        fn store_misconfigured_ecus(&self, _ecus: &[(EcuSerial, crate::metadata::MisconfiguredReason)]) -> Result<(), Error> {
            Ok(())
        }
        fn credentials_blob(&self) -> Result<Option<Vec<u8>>, Error> {
            Ok(None)
        }
        fn store_credentials_blob(&self, _blob: &[u8]) -> Result<(), Error> {
            Ok(())
        }
        fn primary_key(&self) -> Result<Option<crate::metadata::PrivateKey>, Error> {
            Ok(None)
        }
        fn store_primary_key(&self, _key: &crate::metadata::PrivateKey) -> Result<(), Error> {
            Ok(())
        }
    }

    #[test]
    fn download_rejects_bytes_that_fail_hash_verification() {
        let dir = tempdir().unwrap();
        let client = TestClient::from(vec![TestClient::ok(b"not the right bytes at all".to_vec())]);
        let url: url::Url = "http://example.test/targets/firmware.bin".parse().unwrap();
        let err = download(&client, dir.path(), &target(), url, Duration::from_secs(1)).unwrap_err();
        assert!(matches!(err, Error::TargetHashMismatch(_)));
        assert!(!staged_path(dir.path(), &target()).exists());
    }

    #[test]
    fn download_reports_oversized_bytes_distinctly_from_a_hash_mismatch() {
        let dir = tempdir().unwrap();
        let client = TestClient::from(vec![TestClient::ok(b"way more bytes than the target declares".to_vec())]);
        let url: url::Url = "http://example.test/targets/firmware.bin".parse().unwrap();
        let err = download(&client, dir.path(), &target(), url, Duration::from_secs(1)).unwrap_err();
        assert!(matches!(err, Error::OversizedTarget(_)));
        assert!(!staged_path(dir.path(), &target()).exists());
    }

    #[test]
    fn install_persists_pending_before_invoking_pacman_and_clears_it_on_success() {
        let storage = MemStorage::default();
        let pacman = RecordingPacman { outcome: Mutex::new(Some(InstallOutcome::Installed)) };
        let mut sink = NullSink;
        let ecu = EcuSerial("p1".into());
        let outcome = install(&storage, &pacman, &mut sink, &ecu, &target(), Path::new("/tmp/staged")).unwrap();
        assert_eq!(outcome, InstallOutcome::Installed);
        assert!(storage.pending(&ecu).unwrap().is_none());
        assert_eq!(storage.installed_log(&ecu).unwrap().len(), 1);
    }

    #[test]
    fn install_needing_completion_leaves_pending_row_in_place() {
        let storage = MemStorage::default();
        let pacman = RecordingPacman { outcome: Mutex::new(Some(InstallOutcome::NeedsCompletion)) };
        let mut sink = NullSink;
        let ecu = EcuSerial("p1".into());
        let outcome = install(&storage, &pacman, &mut sink, &ecu, &target(), Path::new("/tmp/staged")).unwrap();
        assert_eq!(outcome, InstallOutcome::NeedsCompletion);
        assert!(storage.pending(&ecu).unwrap().is_some());
    }

    #[test]
    fn finalize_pending_clears_row_and_appends_log_on_success() {
        let storage = MemStorage::default();
        let ecu = EcuSerial("p1".into());
        storage.set_pending(&PendingInstall::new(ecu.clone(), target())).unwrap();
        let pacman = RecordingPacman { outcome: Mutex::new(None) };

        let entry = finalize_pending(&storage, &pacman, &ecu).unwrap();
        assert!(entry.is_some());
        assert!(storage.pending(&ecu).unwrap().is_none());
        assert_eq!(storage.installed_log(&ecu).unwrap().len(), 1);
    }

    #[test]
    fn finalize_pending_is_a_no_op_without_a_pending_row() {
        let storage = MemStorage::default();
        let pacman = RecordingPacman { outcome: Mutex::new(None) };
        let entry = finalize_pending(&storage, &pacman, &EcuSerial("p1".into())).unwrap();
        assert!(entry.is_none());
    }

    #[test]
    fn raw_report_override_round_trips_through_pending_row() {
        let storage = MemStorage::default();
        let ecu = EcuSerial("p1".into());
        storage.set_pending(&PendingInstall::new(ecu.clone(), target())).unwrap();

        assert!(set_pending_raw_report(&storage, &ecu, "override".into()).unwrap());
        assert_eq!(take_pending_raw_report(&storage, &ecu).unwrap(), Some("override".to_string()));
        assert_eq!(take_pending_raw_report(&storage, &ecu).unwrap(), None);
    }

    #[test]
    fn raw_report_override_without_pending_row_returns_false() {
        let storage = MemStorage::default();
        assert!(!set_pending_raw_report(&storage, &EcuSerial("p1".into()), "x".into()).unwrap());
    }
}
