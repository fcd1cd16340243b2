//! The public-API facade: the single type an embedder constructs. Owns
//! what a concrete device needs at startup — storage, the configured
//! package manager, the HTTP clients — and spawns the engine thread that
//! keeps running behind a handle the caller holds.
//!
//! Every queue-able operation goes through [`CommandQueueHandle::enqueue`]
//! and blocks on the reply channel; the engine thread (running
//! [`crate::orchestrator::Orchestrator::run`]) is the only thing that ever
//! touches the [`Engine`] while the device is live, aside from the narrow
//! pre-initialize exception `add_secondary` takes directly.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crate::clock::{Clock, SystemClock};
use crate::command_queue::{self, CancelFlag, CommandKind, CommandQueueHandle, Completion};
use crate::config::{Config, PacmanKind, ProvisioningConfig};
use crate::engine::{CheckUpdatesResult, DownloadResult, Engine, InstallResult};
use crate::error::Error;
use crate::events::EventSink;
use crate::fetcher::RepositoryEndpoint;
use crate::http::{Client, ReqwestClient};
use crate::metadata::signed::SignedMetadata;
use crate::metadata::{EcuSerial, HardwareId, InstallationLogEntry, PrivateKey, PublicKey, RepositoryKind, Role, RootBody, Target};
use crate::orchestrator::{Orchestrator, PauseFlag};
use crate::pacman::{NoPackageManager, PackageManager};
#[cfg(feature = "pacman-android")]
use crate::pacman::android::AndroidPackageManager;
#[cfg(feature = "pacman-ostree")]
use crate::pacman::ostree::OstreePackageManager;
use crate::secondary::Secondary;
use crate::storage::{FilesystemStorage, Storage};
use crate::util;

/// Owns the command queue handle and the engine thread it feeds, plus a
/// shared reference to the [`Engine`] itself so the three operations whose
/// result is richer than a bare `Completion` (`check_updates`, `download`,
/// `install`) can read it back after the queue round trip.
pub struct Device {
    queue: CommandQueueHandle,
    engine: Arc<Mutex<Engine>>,
    current: Arc<Mutex<Option<CancelFlag>>>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl Device {
    /// Provisions credentials/initial root metadata from `config.provisioning`
    /// if nothing is stored yet, builds the `Engine` and its collaborators,
    /// and spawns the engine thread immediately so the autonomous polling
    /// loop (or a caller's first queued command) can proceed right away.
    pub fn new(config: &Config, sink: Box<dyn EventSink>) -> Result<Device, Error> {
        let storage: Arc<dyn Storage> = Arc::new(FilesystemStorage::new(config.core.storage_dir.clone()));
        provision(storage.as_ref(), &config.provisioning)?;

        let client: Arc<dyn Client> = Arc::new(ReqwestClient::new()?);
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);

        let director_url = config.uptane.director_server.parse().map_err(Error::from)?;
        let image_url = config.uptane.repo_server.parse().map_err(Error::from)?;
        let director = RepositoryEndpoint { kind: RepositoryKind::Director, base_url: director_url };
        let image = RepositoryEndpoint { kind: RepositoryKind::Image, base_url: image_url };

        let pacman = build_pacman(&config.pacman)?;
        let primary_serial = EcuSerial(config.device.primary_ecu_serial.clone());
        let primary_hwid = HardwareId(config.device.hardware_id.clone());

        let engine = Engine::new(
            storage,
            client.clone(),
            client,
            clock,
            director,
            image,
            pacman,
            sink,
            config.core.staging_dir.clone(),
            primary_serial,
            primary_hwid,
            config.network.http_timeout(),
            config.network.secondary_timeout(),
        );
        let engine = Arc::new(Mutex::new(engine));

        let (queue, rx) = command_queue::channel();
        let pause = PauseFlag::new();
        let current = Arc::new(Mutex::new(None));

        let mut orchestrator =
            Orchestrator::new(engine.clone(), rx, pause, config.uptane.mode, Duration::from_secs(config.uptane.polling_sec), current.clone());
        let thread = thread::Builder::new().name("uptane-engine".into()).spawn(move || orchestrator.run()).map_err(Error::Io)?;

        Ok(Device { queue, engine, current, thread: Mutex::new(Some(thread)) })
    }

    fn lock_engine(&self) -> std::sync::MutexGuard<Engine> {
        match self.engine.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Enqueue `kind` and block until it settles, collapsing `Completion`
    /// down to a plain result since the richer phases read their own result
    /// back off the `Engine` afterwards.
    fn run_command(&self, kind: CommandKind) -> Result<(), Error> {
        let (_cancel, reply) = self.queue.enqueue(kind);
        match reply.recv().map_err(Error::Recv)? {
            Completion::Success => Ok(()),
            Completion::Cancelled => Err(Error::Command("cancelled".into())),
            Completion::Failed(message) => Err(Error::Command(message)),
        }
    }

    /// Valid only before the device has been initialized (`Engine::add_secondary`
    /// enforces this itself).
    pub fn add_secondary(&self, secondary: Box<dyn Secondary>) -> Result<(), Error> {
        self.lock_engine().add_secondary(secondary)
    }

    pub fn set_event_handler(&self, sink: Box<dyn EventSink>) {
        self.lock_engine().set_sink(sink);
    }

    pub fn initialize(&self) -> Result<(), Error> {
        self.run_command(CommandKind::Initialize)
    }

    pub fn check_updates(&self) -> Result<CheckUpdatesResult, Error> {
        self.run_command(CommandKind::CheckUpdates)?;
        Ok(self.lock_engine().last_check_updates_result())
    }

    pub fn download(&self, targets: &[Target]) -> Result<DownloadResult, Error> {
        self.run_command(CommandKind::Download(targets.to_vec()))?;
        Ok(self.lock_engine().last_download_result())
    }

    pub fn install(&self, targets: &[Target]) -> Result<InstallResult, Error> {
        self.run_command(CommandKind::Install(targets.to_vec()))?;
        Ok(self.lock_engine().last_install_result())
    }

    pub fn send_manifest(&self, raw_report: Option<String>) -> Result<bool, Error> {
        self.run_command(CommandKind::SendManifest(raw_report))?;
        Ok(self.lock_engine().last_manifest_sent_result())
    }

    pub fn send_device_data(&self, hwinfo: Option<String>) -> Result<(), Error> {
        self.run_command(CommandKind::SendDeviceData(hwinfo))
    }

    /// One full cycle, run synchronously on the calling thread rather than
    /// through the queue: unlike the individual phases, a cycle isn't
    /// cancellable partway through by an `abort()` aimed at a single queued
    /// command, so it bypasses the queue entirely and locks the engine for
    /// its whole duration.
    pub fn uptane_cycle(&self) -> Result<bool, Error> {
        self.lock_engine().uptane_cycle()
    }

    pub fn pause(&self) -> Result<(), Error> {
        self.run_command(CommandKind::Pause)
    }

    pub fn resume(&self) -> Result<(), Error> {
        self.run_command(CommandKind::Resume)
    }

    /// Cancels whatever command is in flight immediately, then enqueues
    /// `Abort` itself so the rest of the queue (and anything deferred by a
    /// pause) is drained once the in-flight command reaches its own
    /// cancellation point.
    pub fn abort(&self) -> Result<(), Error> {
        if let Some(cancel) = self.current.lock().unwrap().as_ref() {
            cancel.cancel();
        }
        self.run_command(CommandKind::Abort)
    }

    pub fn get_installation_log(&self) -> Result<Vec<InstallationLogEntry>, Error> {
        self.lock_engine().get_installation_log()
    }

    pub fn get_stored_targets(&self) -> Result<Vec<String>, Error> {
        self.lock_engine().get_stored_targets()
    }

    pub fn delete_stored_target(&self, target: &Target) -> Result<(), Error> {
        self.lock_engine().delete_stored_target(target)
    }

    pub fn open_stored_target(&self, target: &Target) -> Result<std::fs::File, Error> {
        self.lock_engine().open_stored_target(target)
    }

    pub fn set_installation_raw_report(&self, ecu: &EcuSerial, text: String) -> Result<bool, Error> {
        self.lock_engine().set_installation_raw_report(ecu, text)
    }

    /// Sends an initial device-data report, then blocks the calling
    /// thread until the engine thread exits — which only happens once
    /// `shutdown()` (or an externally enqueued `Shutdown`) has been
    /// processed. Intended to be the body of a daemon's `main`.
    pub fn run_forever(&self, custom_hwinfo: Option<String>) -> Result<(), Error> {
        self.send_device_data(custom_hwinfo)?;
        let handle = self.thread.lock().unwrap().take();
        match handle {
            Some(handle) => handle.join().map_err(|_| Error::Command("engine thread panicked".into())),
            None => Ok(()),
        }
    }

    /// Signals the engine thread to stop; does not itself block. Call
    /// `run_forever()` (from whichever thread is waiting on the device) to
    /// observe the thread actually exit.
    pub fn shutdown(&self) {
        self.queue.shutdown();
    }
}

/// Constructs the package manager backend named by `config.kind`, falling
/// back to a hard error rather than silently degrading to `NoPackageManager`
/// if a caller asked for a backend this build wasn't compiled with.
fn build_pacman(config: &crate::config::PacmanConfig) -> Result<Box<dyn PackageManager>, Error> {
    match config.kind {
        PacmanKind::None => Ok(Box::new(NoPackageManager)),
        PacmanKind::Ostree => {
            #[cfg(feature = "pacman-ostree")]
            {
                Ok(Box::new(OstreePackageManager::new(config.sysroot.clone())))
            }
            #[cfg(not(feature = "pacman-ostree"))]
            {
                Err(Error::Config("pacman.kind = \"ostree\" requires the pacman-ostree feature".into()))
            }
        }
        PacmanKind::Android => {
            #[cfg(feature = "pacman-android")]
            {
                Ok(Box::new(AndroidPackageManager::new(config.sysroot.clone())))
            }
            #[cfg(not(feature = "pacman-android"))]
            {
                Err(Error::Config("pacman.kind = \"android\" requires the pacman-android feature".into()))
            }
        }
    }
}

/// Provisions a primary signing key and each repository's initial, trusted
/// `root.json` the first time the device starts. The read is skipped
/// once storage already holds the material, since repeated provisioning
/// from the same files would be a silent no-op anyway and the config's
/// paths may not even remain valid after the first boot (a factory image
/// mounted read-only, say).
fn provision(storage: &dyn Storage, config: &ProvisioningConfig) -> Result<(), Error> {
    if storage.primary_key()?.is_none() {
        match (&config.private_key_path, &config.public_key_path) {
            (Some(private_path), Some(public_path)) => {
                let der_bytes = util::read_file(private_path)?;
                let pem_bytes = util::read_file(public_path)?;
                let encoded = String::from_utf8(pem_bytes)
                    .map_err(|_| Error::Config("public key file is not valid UTF-8".into()))?;
                let public = PublicKey::new(config.key_kind, encoded)?;
                let key = PrivateKey { key_id: public.key_id, kind: config.key_kind, der_bytes };
                storage.store_primary_key(&key)?;
            }
            (None, None) => {}
            _ => return Err(Error::Config("provisioning needs both private_key_path and public_key_path, or neither".into())),
        }
    }

    if storage.load_latest(RepositoryKind::Director, &Role::Root)?.is_none() {
        if let Some(path) = &config.director_root_path {
            store_initial_root(storage, RepositoryKind::Director, path)?;
        }
    }
    if storage.load_latest(RepositoryKind::Image, &Role::Root)?.is_none() {
        if let Some(path) = &config.image_root_path {
            store_initial_root(storage, RepositoryKind::Image, path)?;
        }
    }
    Ok(())
}

/// Stores a repository's shipped `root.json` verbatim as its version-1 (or
/// whatever version it declares) trusted root, without verifying it: this
/// file is the trust anchor itself, installed at manufacture time rather
/// than fetched and checked against a prior one the way `Fetcher::refresh_root`
/// checks every root after it.
fn store_initial_root(storage: &dyn Storage, repo: RepositoryKind, path: &Path) -> Result<(), Error> {
    let bytes = util::read_file(path)?;
    let (_, header, _) = SignedMetadata::<RootBody>::parse_unverified(&bytes)?;
    storage.store_role(repo, &Role::Root, header.version, &bytes)
}
