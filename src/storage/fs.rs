//! Filesystem-backed reference implementation of the `Storage` contract.
//! Every write goes through `util::write_file_atomic` so a crash
//! mid-write never leaves a role file or pending-install record
//! half-written.
//!
//! Layout under `root`:
//!
//! ```text
//! root/metadata/{director,image}/<version>.<role-file>   versioned role docs
//! root/ecu_serials.json
//! root/misconfigured_ecus.json
//! root/pending/<ecu-serial>.json
//! root/installed_log/<ecu-serial>.jsonl                  append-only, one JSON object per line
//! root/device_id
//! root/credentials.blob
//! root/primary_key.json
//! ```

use std::fs;
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use serde_json as json;

use crate::error::Error;
use crate::metadata::{
    EcuSerial, InstallationLogEntry, MisconfiguredReason, PendingInstall, PrivateKey, RepositoryKind, Role, Version,
};
use crate::storage::Storage;
use crate::util;

pub struct FilesystemStorage {
    root: PathBuf,
    /// Serializes the read-modify-write sequences (ecu serial list,
    /// misconfigured list, append-only log) that aren't single-file
    /// atomic renames on their own.
    lock: Mutex<()>,
}

impl FilesystemStorage {
    pub fn new(root: impl Into<PathBuf>) -> FilesystemStorage {
        FilesystemStorage { root: root.into(), lock: Mutex::new(()) }
    }

    fn metadata_dir(&self, repo: RepositoryKind) -> PathBuf {
        self.root.join("metadata").join(repo.to_string())
    }

    fn role_path(&self, repo: RepositoryKind, role: &Role, version: Version) -> PathBuf {
        self.metadata_dir(repo).join(format!("{}.{}", version, role.file_name()))
    }

    fn pending_path(&self, ecu: &EcuSerial) -> PathBuf {
        self.root.join("pending").join(format!("{}.json", ecu.0))
    }

    fn log_path(&self, ecu: &EcuSerial) -> PathBuf {
        self.root.join("installed_log").join(format!("{}.jsonl", ecu.0))
    }

    fn ecu_serials_path(&self) -> PathBuf {
        self.root.join("ecu_serials.json")
    }

    fn misconfigured_path(&self) -> PathBuf {
        self.root.join("misconfigured_ecus.json")
    }

    fn device_id_path(&self) -> PathBuf {
        self.root.join("device_id")
    }

    fn credentials_path(&self) -> PathBuf {
        self.root.join("credentials.blob")
    }

    fn primary_key_path(&self) -> PathBuf {
        self.root.join("primary_key.json")
    }

    fn read_json_or_default<T: serde::de::DeserializeOwned + Default>(path: &Path) -> Result<T, Error> {
        if !path.exists() {
            return Ok(T::default());
        }
        let bytes = util::read_file(path)?;
        Ok(json::from_slice(&bytes)?)
    }
}

impl Storage for FilesystemStorage {
    fn load_role(&self, repo: RepositoryKind, role: &Role, version: Version) -> Result<Option<Vec<u8>>, Error> {
        let path = self.role_path(repo, role, version);
        if !path.exists() {
            return Ok(None);
        }
        Ok(Some(util::read_file(&path)?))
    }

    fn store_role(&self, repo: RepositoryKind, role: &Role, version: Version, bytes: &[u8]) -> Result<(), Error> {
        util::write_file_atomic(&self.role_path(repo, role, version), bytes)
    }

    fn latest_version(&self, repo: RepositoryKind, role: &Role) -> Result<Option<Version>, Error> {
        let dir = self.metadata_dir(repo);
        if !dir.exists() {
            return Ok(None);
        }
        let suffix = format!(".{}", role.file_name());
        let mut best: Option<u64> = None;
        for entry in fs::read_dir(&dir)? {
            let entry = entry?;
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if let Some(prefix) = name.strip_suffix(&suffix) {
                if let Ok(version) = prefix.parse::<u64>() {
                    best = Some(best.map_or(version, |b| b.max(version)));
                }
            }
        }
        Ok(best.map(Version))
    }

    fn ecu_serials(&self) -> Result<Vec<EcuSerial>, Error> {
        let _guard = self.lock.lock()?;
        Self::read_json_or_default(&self.ecu_serials_path())
    }

    fn store_ecu_serials(&self, serials: &[EcuSerial]) -> Result<(), Error> {
        let _guard = self.lock.lock()?;
        util::write_file_atomic(&self.ecu_serials_path(), &json::to_vec(serials)?)
    }

    fn pending(&self, ecu: &EcuSerial) -> Result<Option<PendingInstall>, Error> {
        let path = self.pending_path(ecu);
        if !path.exists() {
            return Ok(None);
        }
        let bytes = util::read_file(&path)?;
        Ok(Some(json::from_slice(&bytes)?))
    }

    fn set_pending(&self, pending: &PendingInstall) -> Result<(), Error> {
        util::write_file_atomic(&self.pending_path(&pending.ecu), &json::to_vec(pending)?)
    }

    fn clear_pending(&self, ecu: &EcuSerial) -> Result<(), Error> {
        let path = self.pending_path(ecu);
        if path.exists() {
            fs::remove_file(path)?;
        }
        Ok(())
    }

    fn installed_log(&self, ecu: &EcuSerial) -> Result<Vec<InstallationLogEntry>, Error> {
        let path = self.log_path(ecu);
        if !path.exists() {
            return Ok(Vec::new());
        }
        let file = fs::File::open(&path)?;
        let mut entries = Vec::new();
        for line in BufReader::new(file).lines() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            entries.push(json::from_str(&line)?);
        }
        Ok(entries)
    }

    fn append_installed(&self, entry: &InstallationLogEntry) -> Result<(), Error> {
        let _guard = self.lock.lock()?;
        let path = self.log_path(&entry.ecu);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut file = fs::OpenOptions::new().create(true).append(true).open(&path)?;
        let mut line = json::to_vec(entry)?;
        line.push(b'\n');
        file.write_all(&line)?;
        file.sync_all()?;
        Ok(())
    }

    fn device_id(&self) -> Result<Option<String>, Error> {
        let path = self.device_id_path();
        if !path.exists() {
            return Ok(None);
        }
        Ok(Some(String::from_utf8_lossy(&util::read_file(&path)?).into_owned()))
    }

    fn store_device_id(&self, device_id: &str) -> Result<(), Error> {
        util::write_file_atomic(&self.device_id_path(), device_id.as_bytes())
    }

    fn misconfigured_ecus(&self) -> Result<Vec<(EcuSerial, MisconfiguredReason)>, Error> {
        let _guard = self.lock.lock()?;
        Self::read_json_or_default(&self.misconfigured_path())
    }

    fn store_misconfigured_ecus(&self, ecus: &[(EcuSerial, MisconfiguredReason)]) -> Result<(), Error> {
        let _guard = self.lock.lock()?;
        util::write_file_atomic(&self.misconfigured_path(), &json::to_vec(ecus)?)
    }

    fn credentials_blob(&self) -> Result<Option<Vec<u8>>, Error> {
        let path = self.credentials_path();
        if !path.exists() {
            return Ok(None);
        }
        Ok(Some(util::read_file(&path)?))
    }

    fn store_credentials_blob(&self, blob: &[u8]) -> Result<(), Error> {
        util::write_file_atomic(&self.credentials_path(), blob)
    }

    fn primary_key(&self) -> Result<Option<PrivateKey>, Error> {
        let path = self.primary_key_path();
        if !path.exists() {
            return Ok(None);
        }
        let bytes = util::read_file(&path)?;
        Ok(Some(json::from_slice(&bytes)?))
    }

    fn store_primary_key(&self, key: &PrivateKey) -> Result<(), Error> {
        util::write_file_atomic(&self.primary_key_path(), &json::to_vec(key)?)
    }
}
