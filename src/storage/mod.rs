//! The storage contract: versioned metadata, ECU serial
//! registry, pending-install bookkeeping, and the installed-versions log.
//! `Storage` is the trait every caller programs against; `fs` is the
//! reference filesystem-backed implementation.

pub mod fs;

use crate::error::Error;
use crate::metadata::{EcuSerial, PendingInstall, RepositoryKind, Role, Version};

pub use fs::FilesystemStorage;

/// Everything the core needs to persist, independent of backing engine. A
/// database-backed implementation can replace `FilesystemStorage` without
/// the rest of the crate noticing, since nothing outside this module
/// names a concrete type.
pub trait Storage: Send + Sync {
    fn load_role(&self, repo: RepositoryKind, role: &Role, version: Version) -> Result<Option<Vec<u8>>, Error>;
    fn store_role(&self, repo: RepositoryKind, role: &Role, version: Version, bytes: &[u8]) -> Result<(), Error>;
    fn latest_version(&self, repo: RepositoryKind, role: &Role) -> Result<Option<Version>, Error>;

    fn load_latest(&self, repo: RepositoryKind, role: &Role) -> Result<Option<Vec<u8>>, Error> {
        match self.latest_version(repo, role)? {
            Some(version) => self.load_role(repo, role, version),
            None => Ok(None),
        }
    }

    fn ecu_serials(&self) -> Result<Vec<EcuSerial>, Error>;
    fn store_ecu_serials(&self, serials: &[EcuSerial]) -> Result<(), Error>;

    fn pending(&self, ecu: &EcuSerial) -> Result<Option<PendingInstall>, Error>;
    fn set_pending(&self, pending: &PendingInstall) -> Result<(), Error>;
    fn clear_pending(&self, ecu: &EcuSerial) -> Result<(), Error>;

    fn installed_log(&self, ecu: &EcuSerial) -> Result<Vec<crate::metadata::InstallationLogEntry>, Error>;
    fn append_installed(&self, entry: &crate::metadata::InstallationLogEntry) -> Result<(), Error>;

    fn device_id(&self) -> Result<Option<String>, Error>;
    fn store_device_id(&self, device_id: &str) -> Result<(), Error>;

    /// ECUs the Director has flagged as misregistered. Primary-level bookkeeping, not
    /// consulted by the verifier itself.
    fn misconfigured_ecus(&self) -> Result<Vec<(EcuSerial, crate::metadata::MisconfiguredReason)>, Error>;
    fn store_misconfigured_ecus(&self, ecus: &[(EcuSerial, crate::metadata::MisconfiguredReason)]) -> Result<(), Error>;

    /// Opaque device-credential blob (PEM bundle or PKCS#12 container);
    /// the core never parses it, only persists it.
    fn credentials_blob(&self) -> Result<Option<Vec<u8>>, Error>;
    fn store_credentials_blob(&self, blob: &[u8]) -> Result<(), Error>;

    /// The Primary's own signing key, set once at `Initialize`.
    fn primary_key(&self) -> Result<Option<crate::metadata::PrivateKey>, Error>;
    fn store_primary_key(&self, key: &crate::metadata::PrivateKey) -> Result<(), Error>;
}
