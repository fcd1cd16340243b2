//! TOML configuration with per-section defaults: each section implements
//! `Default` independently and `#[serde(default)]` fills in whatever a
//! partial document omits, so a one-line override doesn't force the rest
//! of that section's fields into the document too. Sections are split by
//! concern (core, device, network, uptane, pacman, provisioning) rather
//! than kept as one flat struct.

use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::Error;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub core: CoreConfig,
    pub device: DeviceConfig,
    pub network: NetworkConfig,
    pub uptane: UptaneConfig,
    pub pacman: PacmanConfig,
    pub provisioning: ProvisioningConfig,
}

impl Default for Config {
    fn default() -> Config {
        Config {
            core: CoreConfig::default(),
            device: DeviceConfig::default(),
            network: NetworkConfig::default(),
            uptane: UptaneConfig::default(),
            pacman: PacmanConfig::default(),
            provisioning: ProvisioningConfig::default(),
        }
    }
}

impl Config {
    pub fn load(path: &str) -> Result<Config, Error> {
        let text = fs::read_to_string(path).map_err(|err| Error::Config(format!("couldn't read config {}: {}", path, err)))?;
        Config::parse(&text)
    }

    pub fn parse(text: &str) -> Result<Config, Error> {
        toml::from_str(text).map_err(Error::Toml)
    }
}

/// Filesystem layout: where versioned metadata and device state live, and
/// where downloaded targets are staged before install.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CoreConfig {
    pub storage_dir: PathBuf,
    pub staging_dir: PathBuf,
}

impl Default for CoreConfig {
    fn default() -> CoreConfig {
        CoreConfig { storage_dir: PathBuf::from("/var/sota/storage"), staging_dir: PathBuf::from("/var/sota/staging") }
    }
}

/// This device's own identity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceConfig {
    pub hardware_id: String,
    pub primary_ecu_serial: String,
}

impl Default for DeviceConfig {
    fn default() -> DeviceConfig {
        DeviceConfig { hardware_id: "unknown".into(), primary_ecu_serial: "primary".into() }
    }
}

/// Connection limits.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    pub http_timeout_secs: u64,
    pub secondary_timeout_secs: u64,
}

impl Default for NetworkConfig {
    fn default() -> NetworkConfig {
        NetworkConfig { http_timeout_secs: 30, secondary_timeout_secs: 30 }
    }
}

impl NetworkConfig {
    pub fn http_timeout(&self) -> Duration {
        Duration::from_secs(self.http_timeout_secs)
    }

    pub fn secondary_timeout(&self) -> Duration {
        Duration::from_secs(self.secondary_timeout_secs)
    }
}

/// Director/Image repository endpoints and polling cadence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct UptaneConfig {
    pub director_server: String,
    pub repo_server: String,
    pub polling_sec: u64,
    pub mode: OrchestratorMode,
}

impl Default for UptaneConfig {
    fn default() -> UptaneConfig {
        UptaneConfig {
            director_server: "https://director.example.com".into(),
            repo_server: "https://image-repo.example.com".into(),
            polling_sec: 300,
            mode: OrchestratorMode::Full,
        }
    }
}

/// The orchestrator's configured mode: which phases of the
/// `SendDeviceData -> FetchMeta -> CheckUpdates -> Download -> Install`
/// cycle it runs and whether it loops or stops after one pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum OrchestratorMode {
    Full,
    Once,
    Check,
    Download,
    Install,
    CampaignCheck,
    CampaignAccept,
    CampaignReject,
    Manual,
}

impl Default for OrchestratorMode {
    fn default() -> OrchestratorMode {
        OrchestratorMode::Full
    }
}

/// Which package manager backend to construct.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PacmanConfig {
    pub kind: PacmanKind,
    pub sysroot: String,
}

impl Default for PacmanConfig {
    fn default() -> PacmanConfig {
        PacmanConfig { kind: PacmanKind::None, sysroot: "/".into() }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PacmanKind {
    None,
    Ostree,
    Android,
}

impl Default for PacmanKind {
    fn default() -> PacmanKind {
        PacmanKind::None
    }
}

/// Manufacture-time device provisioning material: the primary signing
/// key and the two repositories' initial `root.json` files a concrete
/// device ships with. This section only names those files; generating
/// keys, talking to a PKCS#11 token, and TLS client-auth material are
/// all the embedder's concern, handled before this crate ever sees a
/// config. [`crate::device::Device`] reads these paths once at first
/// `initialize()`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProvisioningConfig {
    /// PKCS#8 DER-encoded primary signing key, read once if no primary
    /// key has yet been persisted to storage.
    pub private_key_path: Option<PathBuf>,
    /// PEM-encoded public key matching `private_key_path`; its hash
    /// becomes the Primary ECU's `KeyId`.
    pub public_key_path: Option<PathBuf>,
    pub key_kind: crate::metadata::KeyKind,
    /// The Director's initial, trusted `root.json`, read once if the
    /// repository has no root metadata stored yet.
    pub director_root_path: Option<PathBuf>,
    /// The Image repository's initial, trusted `root.json`.
    pub image_root_path: Option<PathBuf>,
}

impl Default for ProvisioningConfig {
    fn default() -> ProvisioningConfig {
        ProvisioningConfig {
            private_key_path: None,
            public_key_path: None,
            key_kind: crate::metadata::KeyKind::Ed25519,
            director_root_path: None,
            image_root_path: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_config_uses_every_default() {
        let config = Config::parse("").unwrap();
        assert_eq!(config, Config::default());
    }

    #[test]
    fn partial_config_only_overrides_named_fields() {
        let text = r#"
            [uptane]
            director_server = "https://director.internal"
            polling_sec = 60
        "#;
        let config = Config::parse(text).unwrap();
        assert_eq!(config.uptane.director_server, "https://director.internal");
        assert_eq!(config.uptane.polling_sec, 60);
        assert_eq!(config.uptane.repo_server, UptaneConfig::default().repo_server);
        assert_eq!(config.core, CoreConfig::default());
    }

    #[test]
    fn unknown_pacman_kind_fails_to_parse() {
        let text = r#"
            [pacman]
            kind = "windows-update"
        "#;
        assert!(Config::parse(text).is_err());
    }

    #[test]
    fn load_reports_a_config_error_for_a_missing_file() {
        let err = Config::load("/nonexistent/sota.toml").unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }
}
