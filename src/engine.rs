//! The Engine: the synchronous core behind every public API call,
//! wiring the fetcher, verifier, installer and Secondary dispatcher
//! together into the `CheckUpdates -> Download -> Install -> SendManifest`
//! cycle. Owns the HTTP clients, storage and package manager, and knows
//! how to drive one cycle end to end; kept separate from the
//! queue/thread plumbing in [`crate::orchestrator`] so the core logic
//! can be called either directly or from the engine thread.

use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use log::{info, warn};

use crate::clock::Clock;
use crate::command_queue::CancelFlag;
use crate::error::Error;
use crate::events::{Event, EventSink};
use crate::fetcher::{Fetcher, RepositoryEndpoint};
use crate::http::{Client, Request};
use crate::installer;
use crate::metadata::{EcuSerial, HardwareId, InstallationLogEntry, RepositoryKind, Role, Target};
use crate::pacman::{InstallOutcome, PackageManager};
use crate::secondary::{self, Dispatcher, MetaPack, Secondary, SecondaryRegistry, SecondaryReport};
use crate::storage::Storage;
use crate::util;

/// `checkUpdates()`'s result: the Director targets that passed cross-repo
/// agreement against the Image repository and are eligible for download.
#[derive(Debug, Clone, Default)]
pub struct CheckUpdatesResult {
    pub updates: Vec<Target>,
}

/// `download()`'s result: which targets were staged, which failed, and
/// whether the pass stopped early on cancellation.
#[derive(Debug, Clone, Default)]
pub struct DownloadResult {
    pub downloaded: Vec<Target>,
    pub failed: Vec<(Target, String)>,
    pub cancelled: bool,
}

/// `install()`'s result, across both the Primary and any dispatched
/// Secondaries.
#[derive(Debug, Clone, Default)]
pub struct InstallResult {
    pub installed: Vec<EcuSerial>,
    pub pending_reboot: Vec<EcuSerial>,
    pub failed: Vec<(EcuSerial, String)>,
    pub cancelled: bool,
}

/// The Primary's view of the whole device: storage, both repository
/// clients, the Secondary registry, and the package manager, bound
/// together by the primary ECU's own identity.
pub struct Engine {
    storage: Arc<dyn Storage>,
    director_client: Arc<dyn Client>,
    image_client: Arc<dyn Client>,
    clock: Arc<dyn Clock>,
    director: RepositoryEndpoint,
    image: RepositoryEndpoint,
    secondaries: SecondaryRegistry,
    dispatcher: Dispatcher,
    pacman: Box<dyn PackageManager>,
    sink: Box<dyn EventSink>,
    staging_dir: PathBuf,
    primary_serial: EcuSerial,
    primary_hwid: HardwareId,
    http_timeout: Duration,
    secondary_timeout: Duration,
    last_secondary_reports: Vec<SecondaryReport>,
    /// The most recent result of each phase, cached so a caller driving
    /// the engine through the command queue (which only hands back a
    /// bare `Completion`) can still retrieve the rich result afterwards.
    last_check: CheckUpdatesResult,
    last_download: DownloadResult,
    last_install: InstallResult,
    last_manifest_sent: bool,
    initialized: bool,
}

impl Engine {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        storage: Arc<dyn Storage>,
        director_client: Arc<dyn Client>,
        image_client: Arc<dyn Client>,
        clock: Arc<dyn Clock>,
        director: RepositoryEndpoint,
        image: RepositoryEndpoint,
        pacman: Box<dyn PackageManager>,
        sink: Box<dyn EventSink>,
        staging_dir: PathBuf,
        primary_serial: EcuSerial,
        primary_hwid: HardwareId,
        http_timeout: Duration,
        secondary_timeout: Duration,
    ) -> Engine {
        Engine {
            storage,
            director_client,
            image_client,
            clock,
            director,
            image,
            secondaries: SecondaryRegistry::new(),
            dispatcher: Dispatcher::new(),
            pacman,
            sink,
            staging_dir,
            primary_serial,
            primary_hwid,
            http_timeout,
            secondary_timeout,
            last_secondary_reports: Vec::new(),
            last_check: CheckUpdatesResult::default(),
            last_download: DownloadResult::default(),
            last_install: InstallResult::default(),
            last_manifest_sent: false,
            initialized: false,
        }
    }

    /// The result of the last `check_updates()` call, for callers that
    /// drove it through the command queue and only got a `Completion` back.
    pub fn last_check_updates_result(&self) -> CheckUpdatesResult {
        self.last_check.clone()
    }

    pub fn last_download_result(&self) -> DownloadResult {
        self.last_download.clone()
    }

    pub fn last_install_result(&self) -> InstallResult {
        self.last_install.clone()
    }

    /// Whether the last `send_manifest()` call's PUT to the Director
    /// returned a successful HTTP status.
    pub fn last_manifest_sent_result(&self) -> bool {
        self.last_manifest_sent
    }

    /// Valid only before `initialize()`.
    pub fn add_secondary(&mut self, secondary: Box<dyn Secondary>) -> Result<(), Error> {
        if self.initialized {
            return Err(Error::Config("addSecondary is only valid before initialize".into()));
        }
        self.secondaries.register(secondary);
        Ok(())
    }

    pub fn set_sink(&mut self, sink: Box<dyn EventSink>) {
        self.sink = sink;
    }

    fn require_initialized(&self) -> Result<(), Error> {
        if self.initialized {
            Ok(())
        } else {
            Err(Error::Config("initialize() must be called before this operation".into()))
        }
    }

    /// Reports `err` through the installed event sink without failing the
    /// caller; used both internally (a rejected target during
    /// `check_updates` doesn't abort the whole pass) and by the
    /// orchestrator to surface an autonomous cycle's failure.
    pub fn emit_error(&mut self, err: &Error) {
        self.sink.handle(Event::Error(err.into(), err.to_string()));
    }

    /// Provisions a device id if none is stored yet, persists the known
    /// ECU serial set, and finalizes a Primary install left pending by a
    /// prior reboot. Idempotent: calling it twice is a no-op the second
    /// time.
    pub fn initialize(&mut self) -> Result<(), Error> {
        if self.initialized {
            return Ok(());
        }
        if self.storage.device_id()?.is_none() {
            self.storage.store_device_id(&uuid::Uuid::new_v4().to_string())?;
        }
        if self.storage.primary_key()?.is_none() {
            return Err(Error::Storage("no primary signing key provisioned; provision credentials before initialize".into()));
        }
        if self.storage.ecu_serials()?.is_empty() {
            let mut serials = vec![self.primary_serial.clone()];
            serials.extend(self.secondaries.serials());
            self.storage.store_ecu_serials(&serials)?;
        }
        if let Some(entry) = installer::finalize_pending(self.storage.as_ref(), self.pacman.as_ref(), &self.primary_serial)? {
            info!("finalized pending install for {}: {:?}", self.primary_serial, entry.targets);
        }
        self.initialized = true;
        Ok(())
    }

    fn registered_hwid_for(&mut self, ecu: &EcuSerial) -> Option<String> {
        if *ecu == self.primary_serial {
            return Some(self.primary_hwid.0.clone());
        }
        self.secondaries.get_mut(ecu).map(|secondary| secondary.hwid().0)
    }

    /// Refresh both repositories' metadata and return the Director
    /// targets that agree with the Image repository's declaration for
    /// the registered hardware id. Targets that fail agreement are
    /// reported through the event sink and dropped rather than failing
    /// the whole check.
    pub fn check_updates(&mut self, cancel: &CancelFlag) -> Result<CheckUpdatesResult, Error> {
        self.require_initialized()?;

        let director_targets = {
            let fetcher = Fetcher::new(self.director_client.as_ref(), self.storage.as_ref(), self.clock.as_ref(), self.http_timeout);
            let root = fetcher
                .load_root(&self.director)?
                .ok_or_else(|| Error::InvalidMetadata("no director root provisioned".into()))?;
            let root = fetcher.refresh_root(&self.director, root)?;
            fetcher.refresh_top_level(&self.director, &root)?;
            fetcher
                .load_targets(&self.director)?
                .ok_or_else(|| Error::InvalidMetadata("director repository carries no targets role".into()))?
        };

        let (image_snapshot, image_targets) = {
            let fetcher = Fetcher::new(self.image_client.as_ref(), self.storage.as_ref(), self.clock.as_ref(), self.http_timeout);
            let root = fetcher
                .load_root(&self.image)?
                .ok_or_else(|| Error::InvalidMetadata("no image root provisioned".into()))?;
            let root = fetcher.refresh_root(&self.image, root)?;
            fetcher.refresh_top_level(&self.image, &root)?;
            (fetcher.load_snapshot(&self.image)?, fetcher.load_targets(&self.image)?)
        };

        let mut updates = Vec::new();
        for director_target in &director_targets.targets {
            if cancel.is_cancelled() {
                break;
            }
            let ecu = EcuSerial(director_target.ecu_identifier.clone());
            let registered_hwid = self.registered_hwid_for(&ecu);

            let image_target = match (&image_snapshot, &image_targets) {
                (Some(snapshot), Some(top)) => {
                    let fetcher =
                        Fetcher::new(self.image_client.as_ref(), self.storage.as_ref(), self.clock.as_ref(), self.http_timeout);
                    fetcher.resolve_target(&self.image, snapshot, top, &director_target.filename)?
                }
                _ => None,
            };

            match image_target {
                Some(image_target) => match crate::verifier::verify_target_agreement(director_target, &image_target, registered_hwid.as_deref()) {
                    Ok(()) => updates.push(director_target.clone()),
                    Err(err) => {
                        warn!("target {} rejected: {}", director_target.filename, err);
                        self.emit_error(&err);
                    }
                },
                None => {
                    let err = Error::MissMatchTarget(director_target.filename.clone());
                    warn!("{}", err);
                    self.emit_error(&err);
                }
            }
        }

        self.sink.handle(Event::UpdateCheckComplete);
        if !updates.is_empty() {
            self.sink.handle(Event::UpdateAvailable(updates.clone()));
        }
        self.last_check = CheckUpdatesResult { updates: updates.clone() };
        Ok(CheckUpdatesResult { updates })
    }

    /// Download and verify each target's bytes into the staging
    /// directory, regardless of which ECU it targets; Secondary firmware
    /// is read back out of staging during `install()`.
    pub fn download(&mut self, targets: &[Target], cancel: &CancelFlag) -> Result<DownloadResult, Error> {
        self.require_initialized()?;
        let mut result = DownloadResult::default();
        for target in targets {
            if cancel.is_cancelled() {
                result.cancelled = true;
                break;
            }
            let url = self.image.target_url(&target.filename)?;
            match installer::download(self.image_client.as_ref(), &self.staging_dir, target, url, self.http_timeout) {
                Ok(_path) => {
                    self.sink.handle(Event::DownloadProgressReport { target: target.filename.clone(), percent: 100 });
                    result.downloaded.push(target.clone());
                }
                Err(err) => {
                    warn!("download of {} failed: {}", target.filename, err);
                    self.emit_error(&err);
                    result.failed.push((target.clone(), err.to_string()));
                }
            }
        }
        if !result.cancelled {
            self.sink.handle(Event::DownloadComplete);
        }
        self.last_download = result.clone();
        Ok(result)
    }

    fn build_meta_pack(&self) -> Result<MetaPack, Error> {
        Ok(MetaPack {
            director_root: self.storage.load_latest(RepositoryKind::Director, &Role::Root)?,
            director_targets: self.storage.load_latest(RepositoryKind::Director, &Role::Targets)?,
            image_root: self.storage.load_latest(RepositoryKind::Image, &Role::Root)?,
            image_timestamp: self.storage.load_latest(RepositoryKind::Image, &Role::Timestamp)?,
            image_snapshot: self.storage.load_latest(RepositoryKind::Image, &Role::Snapshot)?,
            image_targets: self.storage.load_latest(RepositoryKind::Image, &Role::Targets)?,
        })
    }

    /// Install already-staged targets: Primary targets go straight to the
    /// local package manager; Secondary targets are dispatched over
    /// whatever transport their `Secondary` implementation uses.
    pub fn install(&mut self, targets: &[Target], cancel: &CancelFlag) -> Result<InstallResult, Error> {
        self.require_initialized()?;
        let mut result = InstallResult::default();

        let (primary_targets, secondary_targets): (Vec<Target>, Vec<Target>) =
            targets.iter().cloned().partition(|t| t.ecu_identifier == self.primary_serial.0);

        for target in &primary_targets {
            if cancel.is_cancelled() {
                result.cancelled = true;
                break;
            }
            let staged = installer::staged_path(&self.staging_dir, target);
            match installer::install(self.storage.as_ref(), self.pacman.as_ref(), self.sink.as_mut(), &self.primary_serial, target, &staged) {
                Ok(InstallOutcome::Installed) => result.installed.push(self.primary_serial.clone()),
                Ok(InstallOutcome::NeedsCompletion) => result.pending_reboot.push(self.primary_serial.clone()),
                Err(err) => result.failed.push((self.primary_serial.clone(), err.to_string())),
            }
        }

        if !result.cancelled && !secondary_targets.is_empty() {
            let pack = self.build_meta_pack()?;
            let director_root_bytes = self.storage.load_latest(RepositoryKind::Director, &Role::Root)?;
            let staging_dir = self.staging_dir.clone();
            let reports = self.dispatcher.dispatch_update(
                &mut self.secondaries,
                &secondary_targets,
                |target| util::read_file(&installer::staged_path(&staging_dir, target)),
                &pack,
                director_root_bytes.as_deref(),
                self.secondary_timeout,
            );
            for report in &reports {
                if report.attacks_detected.is_empty() && report.manifest_envelope.is_some() {
                    result.installed.push(report.ecu.clone());
                } else {
                    warn!("secondary {} reported: {}", report.ecu, report.attacks_detected);
                    result.failed.push((report.ecu.clone(), report.attacks_detected.clone()));
                }
            }
            self.last_secondary_reports = reports;
        }

        if !result.installed.is_empty() && result.failed.is_empty() {
            self.sink.handle(Event::AllInstallsComplete);
        }
        self.sink.handle(Event::InstallComplete);
        self.last_install = result.clone();
        Ok(result)
    }

    /// Fold any `SetInstallationRawReport` override into the Primary's
    /// own manifest, collect the last cycle's Secondary reports, and PUT
    /// the signed device manifest to the Director.
    pub fn send_manifest(&mut self, custom_raw_report: Option<String>) -> Result<bool, Error> {
        self.require_initialized()?;
        if let Some(text) = custom_raw_report {
            installer::set_pending_raw_report(self.storage.as_ref(), &self.primary_serial, text)?;
        }
        let raw_report = installer::take_pending_raw_report(self.storage.as_ref(), &self.primary_serial)?;

        let primary_key = self.storage.primary_key()?.ok_or_else(|| Error::Storage("no primary key provisioned".into()))?;
        let installed_log = self.storage.installed_log(&self.primary_serial)?;
        let primary_installed = installed_log.last().and_then(|entry| entry.targets.last()).cloned();

        let reports = std::mem::take(&mut self.last_secondary_reports);
        let bytes = secondary::aggregate_device_manifest(
            &primary_key,
            &self.primary_serial,
            primary_installed.as_ref(),
            &reports,
            raw_report.as_deref(),
        )?;

        let url = self.director.base_url.join("manifest").map_err(Error::from)?;
        let response = self.director_client.execute(Request::put(url.clone(), bytes, self.http_timeout))?;
        let ok = response.is_success();
        if !ok {
            warn!("PUT {} returned HTTP {}", url, response.status);
        }
        self.sink.handle(Event::ManifestSent(ok));
        self.last_manifest_sent = ok;
        Ok(ok)
    }

    /// Post device registration / hardware info to the Director.
    pub fn send_device_data(&mut self, hwinfo: Option<String>) -> Result<(), Error> {
        self.require_initialized()?;
        let device_id = self.storage.device_id()?.ok_or_else(|| Error::Storage("device not provisioned".into()))?;
        let body = serde_json::json!({ "deviceId": device_id, "primaryHardwareInfo": hwinfo });
        let bytes = serde_json::to_vec(&body)?;
        let url = self.director.base_url.join("system_info").map_err(Error::from)?;
        let response = self.director_client.execute(Request::put(url.clone(), bytes, self.http_timeout))?;
        if !response.is_success() {
            return Err(Error::Network(format!("PUT {} returned HTTP {}", url, response.status)));
        }
        Ok(())
    }

    /// One full `SendDeviceData -> FetchMeta -> CheckUpdates -> [Download
    /// -> Install] -> SendManifest` pass. Returns `false` iff a reboot is
    /// required before the device can continue meaningfully (some
    /// installed target needs completion on the next boot).
    pub fn uptane_cycle(&mut self) -> Result<bool, Error> {
        self.send_device_data(None)?;
        let cancel = CancelFlag::new();
        let checked = self.check_updates(&cancel)?;
        if checked.updates.is_empty() {
            return Ok(true);
        }
        let downloaded = self.download(&checked.updates, &cancel)?;
        if downloaded.downloaded.is_empty() {
            return Ok(true);
        }
        let installed = self.install(&downloaded.downloaded, &cancel)?;
        let reboot_needed = !installed.pending_reboot.is_empty();
        self.send_manifest(None)?;
        Ok(!reboot_needed)
    }

    pub fn get_installation_log(&self) -> Result<Vec<InstallationLogEntry>, Error> {
        let mut all = Vec::new();
        for ecu in self.storage.ecu_serials()? {
            all.extend(self.storage.installed_log(&ecu)?);
        }
        Ok(all)
    }

    pub fn get_stored_targets(&self) -> Result<Vec<String>, Error> {
        let mut names = Vec::new();
        if self.staging_dir.exists() {
            for entry in fs::read_dir(&self.staging_dir)? {
                let entry = entry?;
                if entry.path().extension().map_or(true, |ext| ext != "tmp") {
                    names.push(entry.file_name().to_string_lossy().into_owned());
                }
            }
        }
        Ok(names)
    }

    pub fn delete_stored_target(&self, target: &Target) -> Result<(), Error> {
        let path = installer::staged_path(&self.staging_dir, target);
        if path.exists() {
            fs::remove_file(path)?;
        }
        Ok(())
    }

    pub fn open_stored_target(&self, target: &Target) -> Result<fs::File, Error> {
        let path = installer::staged_path(&self.staging_dir, target);
        Ok(fs::File::open(path)?)
    }

    pub fn set_installation_raw_report(&self, ecu: &EcuSerial, text: String) -> Result<bool, Error> {
        installer::set_pending_raw_report(self.storage.as_ref(), ecu, text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::NullSink;
    use crate::http::TestClient;
    use crate::storage::FilesystemStorage;
    use url::Url;

    fn engine(dir: &std::path::Path) -> Engine {
        let storage: Arc<dyn Storage> = Arc::new(FilesystemStorage::new(dir.join("storage")));
        let client: Arc<dyn Client> = Arc::new(TestClient::from(vec![]));
        let clock: Arc<dyn Clock> = Arc::new(crate::clock::SystemClock);
        Engine::new(
            storage,
            client.clone(),
            client,
            clock,
            RepositoryEndpoint { kind: RepositoryKind::Director, base_url: Url::parse("https://director.example/").unwrap() },
            RepositoryEndpoint { kind: RepositoryKind::Image, base_url: Url::parse("https://image.example/").unwrap() },
            Box::new(crate::pacman::NoPackageManager),
            Box::new(NullSink),
            dir.join("staging"),
            EcuSerial("p1".into()),
            HardwareId("hw-p1".into()),
            Duration::from_secs(5),
            Duration::from_secs(5),
        )
    }

    #[test]
    fn operations_require_initialize_first() {
        let dir = tempfile::tempdir().unwrap();
        let mut engine = engine(dir.path());
        let err = engine.check_updates(&CancelFlag::new()).unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn initialize_fails_without_a_provisioned_primary_key() {
        let dir = tempfile::tempdir().unwrap();
        let mut engine = engine(dir.path());
        let err = engine.initialize().unwrap_err();
        assert!(matches!(err, Error::Storage(_)));
    }

    #[test]
    fn initialize_is_idempotent_once_provisioned() {
        let dir = tempfile::tempdir().unwrap();
        let mut engine = engine(dir.path());
        let rng = ring::rand::SystemRandom::new();
        let pkcs8 = ring::signature::Ed25519KeyPair::generate_pkcs8(&rng).unwrap();
        let key = crate::metadata::PrivateKey {
            key_id: crate::metadata::KeyId("k1".into()),
            kind: crate::metadata::KeyKind::Ed25519,
            der_bytes: pkcs8.as_ref().to_vec(),
        };
        engine.storage.store_primary_key(&key).unwrap();
        engine.initialize().unwrap();
        engine.initialize().unwrap();
        assert_eq!(engine.storage.ecu_serials().unwrap(), vec![EcuSerial("p1".into())]);
    }

    #[test]
    fn add_secondary_is_rejected_after_initialize() {
        let dir = tempfile::tempdir().unwrap();
        let mut engine = engine(dir.path());
        let rng = ring::rand::SystemRandom::new();
        let pkcs8 = ring::signature::Ed25519KeyPair::generate_pkcs8(&rng).unwrap();
        let key = crate::metadata::PrivateKey {
            key_id: crate::metadata::KeyId("k1".into()),
            kind: crate::metadata::KeyKind::Ed25519,
            der_bytes: pkcs8.as_ref().to_vec(),
        };
        engine.storage.store_primary_key(&key).unwrap();
        engine.initialize().unwrap();

        struct Empty;
        impl Secondary for Empty {
            fn serial(&self) -> EcuSerial {
                EcuSerial("s1".into())
            }
            fn hwid(&self) -> HardwareId {
                HardwareId("hw-s1".into())
            }
            fn public_key(&self) -> crate::metadata::PublicKey {
                crate::metadata::PublicKey::new(crate::metadata::KeyKind::Ed25519, "key".into()).unwrap()
            }
            fn put_root(&mut self, _: &[u8], _: Duration) -> Result<(), Error> {
                Ok(())
            }
            fn put_metadata(&mut self, _: &MetaPack, _: Duration) -> Result<(), Error> {
                Ok(())
            }
            fn send_firmware(&mut self, _: &secondary::Firmware, _: Duration) -> Result<(), Error> {
                Ok(())
            }
            fn get_manifest(&mut self, _: Duration) -> Result<serde_json::Value, Error> {
                Ok(serde_json::Value::Null)
            }
        }
        let err = engine.add_secondary(Box::new(Empty)).unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }
}
