//! Secondary Registry & Dispatcher: tracks Secondaries,
//! pushes them verified metadata and firmware in the right order, and
//! collects their signed ECU manifests into the device manifest. Keeps
//! "the thing driving a transaction" separate from "the transport it
//! drives it over", the latter being the framed IPC transport in
//! [`ipc`].

pub mod ipc;

use std::collections::{HashMap, HashSet};
use std::time::Duration;

use log::warn;
use serde_json::Value;

use crate::error::Error;
use crate::manifest::{self, EcuManifestInput};
use crate::metadata::{EcuSerial, HardwareId, PrivateKey, PublicKey, Root, Target};

/// The six role documents a Secondary may need for one update, as raw
/// signed bytes ready to forward verbatim.
/// Optional fields let legacy Secondaries be sent only Director metadata.
#[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize)]
pub struct MetaPack {
    pub director_root: Option<Vec<u8>>,
    pub director_targets: Option<Vec<u8>>,
    pub image_root: Option<Vec<u8>>,
    pub image_timestamp: Option<Vec<u8>>,
    pub image_snapshot: Option<Vec<u8>>,
    pub image_targets: Option<Vec<u8>>,
}

/// What to hand a Secondary's package manager: raw bytes for most
/// backends, or treehub pull credentials for an ostree-based one.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub enum Firmware {
    Bytes(Vec<u8>),
    OstreeCredentials { pull_uri: String, token: Option<String> },
}

/// The capability set every Secondary implementation provides, whether
/// reached over the framed IPC transport ([`ipc::IpcSecondary`]) or
/// in-process ([`ipc::LocalSecondary`]).
pub trait Secondary: Send {
    fn serial(&self) -> EcuSerial;
    fn hwid(&self) -> HardwareId;
    fn public_key(&self) -> PublicKey;
    fn put_root(&mut self, root_bytes: &[u8], timeout: Duration) -> Result<(), Error>;
    fn put_metadata(&mut self, pack: &MetaPack, timeout: Duration) -> Result<(), Error>;
    fn send_firmware(&mut self, firmware: &Firmware, timeout: Duration) -> Result<(), Error>;
    /// The Secondary's signed installation report, as a `{signed,
    /// signatures}` envelope the caller verifies against `public_key()`.
    fn get_manifest(&mut self, timeout: Duration) -> Result<Value, Error>;
}

/// All Secondaries known to this device, indexed by ECU serial.
#[derive(Default)]
pub struct SecondaryRegistry {
    secondaries: HashMap<EcuSerial, Box<dyn Secondary>>,
}

impl SecondaryRegistry {
    pub fn new() -> SecondaryRegistry {
        SecondaryRegistry { secondaries: HashMap::new() }
    }

    /// Valid only before `initialize()`.
    pub fn register(&mut self, secondary: Box<dyn Secondary>) {
        self.secondaries.insert(secondary.serial(), secondary);
    }

    pub fn get_mut(&mut self, serial: &EcuSerial) -> Option<&mut Box<dyn Secondary>> {
        self.secondaries.get_mut(serial)
    }

    pub fn serials(&self) -> Vec<EcuSerial> {
        self.secondaries.keys().cloned().collect()
    }

    pub fn is_empty(&self) -> bool {
        self.secondaries.is_empty()
    }
}

/// The outcome of dispatching one update to one Secondary: its signed
/// manifest envelope plus whatever attack annotation applies.
pub struct SecondaryReport {
    pub ecu: EcuSerial,
    pub manifest_envelope: Option<Value>,
    pub attacks_detected: String,
}

/// Drives one update cycle's worth of Secondary traffic, tracking which
/// `(ecu, target)` pairs have already been sent so a retried cycle never
/// re-sends firmware.
#[derive(Default)]
pub struct Dispatcher {
    sent: HashSet<(EcuSerial, String)>,
}

impl Dispatcher {
    pub fn new() -> Dispatcher {
        Dispatcher::default()
    }

    /// Dispatch `targets` to every Secondary in `registry` whose ECU is
    /// named by a target and whose `hwid` matches that target's
    /// `custom.hardwareIdentifier`.
    /// Root is always sent before the rest of `pack`, and metadata always
    /// precedes firmware, for every matched Secondary in turn.
    #[allow(clippy::too_many_arguments)]
    pub fn dispatch_update(
        &mut self,
        registry: &mut SecondaryRegistry,
        targets: &[Target],
        firmware_for: impl Fn(&Target) -> Result<Vec<u8>, Error>,
        pack: &MetaPack,
        new_director_root: Option<&[u8]>,
        timeout: Duration,
    ) -> Vec<SecondaryReport> {
        let mut reports = Vec::new();
        for target in targets {
            let hwid = target.hardware_id();
            let Some(secondary) = registry.get_mut(&EcuSerial(target.ecu_identifier.clone())) else {
                continue;
            };
            if hwid.as_deref() != Some(secondary.hwid().0.as_str()) {
                warn!("skipping {}: hwid does not match target's declared hardwareIdentifier", target.ecu_identifier);
                continue;
            }
            let ecu = secondary.serial();
            let key = (ecu.clone(), target.filename.clone());
            if self.sent.contains(&key) {
                continue; // at-most-once per (ecu, target)
            }

            let dispatched = (|| -> Result<(), Error> {
                if let Some(root_bytes) = new_director_root {
                    secondary.put_root(root_bytes, timeout)?;
                }
                secondary.put_metadata(pack, timeout)?;
                let bytes = firmware_for(target)?;
                secondary.send_firmware(&Firmware::Bytes(bytes), timeout)
            })();

            let mut attacks_detected = String::new();
            let manifest_envelope = match dispatched {
                Ok(()) => match secondary.get_manifest(timeout) {
                    Ok(envelope) => {
                        if !verify_secondary_manifest(&envelope, &secondary.public_key()) {
                            attacks_detected = "invalid secondary manifest signature".into();
                        }
                        Some(envelope)
                    }
                    Err(err) => {
                        attacks_detected = format!("no manifest received: {}", err);
                        None
                    }
                },
                Err(err) => {
                    attacks_detected = format!("dispatch failed: {}", err);
                    None
                }
            };

            if manifest_envelope.is_some() && attacks_detected.is_empty() {
                self.sent.insert(key);
            }
            reports.push(SecondaryReport { ecu, manifest_envelope, attacks_detected });
        }
        reports
    }
}

/// Verify a Secondary's manifest envelope against its registered public
/// key before it is folded into the device manifest.
fn verify_secondary_manifest(envelope: &Value, key: &PublicKey) -> bool {
    let signed = match envelope.get("signed") {
        Some(v) => v,
        None => return false,
    };
    let signatures = match envelope.get("signatures").and_then(|v| v.as_array()) {
        Some(sigs) => sigs,
        None => return false,
    };
    let canonical = crate::crypto::canonicalize(signed);
    signatures.iter().any(|sig| {
        let keyid_matches = sig.get("keyid").and_then(|v| v.as_str()) == Some(key.key_id.0.as_str());
        let sig_bytes = sig.get("sig").and_then(|v| v.as_str()).and_then(|s| base64::decode(s).ok());
        match (keyid_matches, sig_bytes) {
            (true, Some(bytes)) => key.verify(&canonical, &bytes),
            _ => false,
        }
    })
}

/// Build the signed device manifest for one cycle: every Secondary's
/// report plus the Primary's own.
pub fn aggregate_device_manifest(
    primary_key: &PrivateKey,
    primary_serial: &EcuSerial,
    primary_installed: Option<&Target>,
    reports: &[SecondaryReport],
    primary_raw_report: Option<&str>,
) -> Result<Vec<u8>, Error> {
    let primary_body = manifest::ecu_manifest_body(&EcuManifestInput {
        ecu: primary_serial,
        installed: primary_installed,
        attacks_detected: "",
        raw_report: primary_raw_report,
        now: chrono::Utc::now(),
    });
    let primary_envelope = manifest::sign_envelope(primary_key, primary_body)?;

    let mut all = vec![(primary_serial.clone(), primary_envelope)];
    for report in reports {
        if !report.attacks_detected.is_empty() {
            // Never forward an unverified or missing Secondary envelope:
            // the Primary signs the annotation itself so the Director
            // still receives a record of this ECU.
            let body = manifest::ecu_manifest_body(&EcuManifestInput {
                ecu: &report.ecu,
                installed: None,
                attacks_detected: &report.attacks_detected,
                raw_report: None,
                now: chrono::Utc::now(),
            });
            all.push((report.ecu.clone(), manifest::sign_envelope(primary_key, body)?));
        } else if let Some(envelope) = &report.manifest_envelope {
            all.push((report.ecu.clone(), envelope.clone()));
        }
    }
    manifest::build_device_manifest(primary_key, primary_serial, all)
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet as Set;

    use ring::rand::SystemRandom;
    use ring::signature::{Ed25519KeyPair, KeyPair};

    use super::*;
    use crate::metadata::{Hash, HashAlgorithm, KeyId, KeyKind};

    struct TestSecondary {
        serial: EcuSerial,
        hwid: HardwareId,
        key: PrivateKey,
        public: PublicKey,
        manifest_calls: u32,
    }

    impl Secondary for TestSecondary {
        fn serial(&self) -> EcuSerial {
            self.serial.clone()
        }
        fn hwid(&self) -> HardwareId {
            self.hwid.clone()
        }
        fn public_key(&self) -> PublicKey {
            self.public.clone()
        }
        fn put_root(&mut self, _root_bytes: &[u8], _timeout: Duration) -> Result<(), Error> {
            Ok(())
        }
        fn put_metadata(&mut self, _pack: &MetaPack, _timeout: Duration) -> Result<(), Error> {
            Ok(())
        }
        fn send_firmware(&mut self, _firmware: &Firmware, _timeout: Duration) -> Result<(), Error> {
            Ok(())
        }
        fn get_manifest(&mut self, _timeout: Duration) -> Result<Value, Error> {
            self.manifest_calls += 1;
            let body = manifest::ecu_manifest_body(&EcuManifestInput {
                ecu: &self.serial,
                installed: None,
                attacks_detected: "",
                raw_report: None,
                now: chrono::Utc::now(),
            });
            manifest::sign_envelope(&self.key, body)
        }
    }

    fn secondary(serial: &str, hwid: &str) -> TestSecondary {
        let rng = SystemRandom::new();
        let pkcs8 = Ed25519KeyPair::generate_pkcs8(&rng).unwrap();
        let pair = Ed25519KeyPair::from_pkcs8(pkcs8.as_ref()).unwrap();
        let public = PublicKey::new(KeyKind::Ed25519, hex::encode(pair.public_key().as_ref())).unwrap();
        let key = PrivateKey { key_id: public.key_id.clone(), kind: KeyKind::Ed25519, der_bytes: pkcs8.as_ref().to_vec() };
        TestSecondary { serial: EcuSerial(serial.into()), hwid: HardwareId(hwid.into()), key, public, manifest_calls: 0 }
    }

    fn target_for(ecu: &str, hwid: &str) -> Target {
        let mut hashes = Set::new();
        hashes.insert(Hash::new(HashAlgorithm::Sha256, b"fw"));
        let mut target = Target::new("firmware.bin", ecu, 2, hashes).unwrap();
        target.custom_format = Some(format!(r#"{{"hardwareIdentifier":"{}"}}"#, hwid));
        target
    }

    #[test]
    fn dispatch_skips_secondary_with_mismatched_hwid() {
        let mut registry = SecondaryRegistry::new();
        registry.register(Box::new(secondary("s1", "hw-s1")));
        let target = target_for("s1", "hw-other");

        let mut dispatcher = Dispatcher::new();
        let reports = dispatcher.dispatch_update(
            &mut registry,
            &[target],
            |_| Ok(vec![1, 2, 3]),
            &MetaPack::default(),
            None,
            Duration::from_secs(1),
        );
        assert!(reports.is_empty());
    }

    #[test]
    fn dispatch_sends_firmware_at_most_once_per_target() {
        let mut registry = SecondaryRegistry::new();
        registry.register(Box::new(secondary("s1", "hw-s1")));
        let target = target_for("s1", "hw-s1");

        let mut dispatcher = Dispatcher::new();
        let reports = dispatcher.dispatch_update(
            &mut registry,
            &[target.clone()],
            |_| Ok(vec![1, 2, 3]),
            &MetaPack::default(),
            None,
            Duration::from_secs(1),
        );
        assert_eq!(reports.len(), 1);
        assert!(reports[0].attacks_detected.is_empty());
        assert!(reports[0].manifest_envelope.is_some());

        let reports_again = dispatcher.dispatch_update(
            &mut registry,
            &[target],
            |_| Ok(vec![1, 2, 3]),
            &MetaPack::default(),
            None,
            Duration::from_secs(1),
        );
        assert!(reports_again.is_empty());
    }

    #[test]
    fn verify_secondary_manifest_rejects_wrong_key() {
        let mut secondary_a = secondary("s1", "hw-s1");
        let envelope = secondary_a.get_manifest(Duration::from_secs(1)).unwrap();
        let other = secondary("s2", "hw-s2");
        assert!(!verify_secondary_manifest(&envelope, &other.public));
        assert!(verify_secondary_manifest(&envelope, &secondary_a.public));
    }

    #[test]
    fn aggregate_manifest_includes_primary_and_secondaries() {
        let rng = SystemRandom::new();
        let pkcs8 = Ed25519KeyPair::generate_pkcs8(&rng).unwrap();
        let primary_key = PrivateKey { key_id: KeyId("primary".into()), kind: KeyKind::Ed25519, der_bytes: pkcs8.as_ref().to_vec() };
        let mut secondary_a = secondary("s1", "hw-s1");
        let envelope = secondary_a.get_manifest(Duration::from_secs(1)).unwrap();
        let reports = vec![SecondaryReport { ecu: EcuSerial("s1".into()), manifest_envelope: Some(envelope), attacks_detected: String::new() }];

        let bytes = aggregate_device_manifest(&primary_key, &EcuSerial("p1".into()), None, &reports, None).unwrap();
        let parsed: Value = serde_json::from_slice(&bytes).unwrap();
        let manifests = parsed["signed"]["ecu_version_manifests"].as_array().unwrap();
        assert_eq!(manifests.len(), 2);
        assert_eq!(manifests[0]["signed"]["ecu_serial"], "p1");
        assert_eq!(manifests[1]["signed"]["ecu_serial"], "s1");
    }

    #[test]
    fn aggregate_manifest_replaces_an_attacked_ecu_with_a_primary_signed_annotation() {
        let rng = SystemRandom::new();
        let pkcs8 = Ed25519KeyPair::generate_pkcs8(&rng).unwrap();
        let primary_key = PrivateKey { key_id: KeyId("primary".into()), kind: KeyKind::Ed25519, der_bytes: pkcs8.as_ref().to_vec() };

        // The attacker's envelope is forged (signed by the wrong key), but
        // the dispatcher still observed it and flagged `attacks_detected`.
        let forger = secondary("s1", "hw-s1");
        let forged_envelope = forger.get_manifest(Duration::from_secs(1)).unwrap();
        let reports = vec![SecondaryReport {
            ecu: EcuSerial("s1".into()),
            manifest_envelope: Some(forged_envelope.clone()),
            attacks_detected: "invalid secondary manifest signature".into(),
        }];

        let bytes = aggregate_device_manifest(&primary_key, &EcuSerial("p1".into()), None, &reports, None).unwrap();
        let parsed: Value = serde_json::from_slice(&bytes).unwrap();
        let manifests = parsed["signed"]["ecu_version_manifests"].as_array().unwrap();
        assert_eq!(manifests.len(), 2);
        let s1_entry = &manifests[1];
        assert_eq!(s1_entry["signed"]["ecu_serial"], "s1");
        assert_eq!(s1_entry["signed"]["attacks_detected"], "invalid secondary manifest signature");
        // The forged envelope itself must never be forwarded verbatim.
        assert_ne!(s1_entry, &forged_envelope);
        assert!(verify_secondary_manifest(s1_entry, &primary_key_public(&primary_key)));
    }

    #[test]
    fn aggregate_manifest_still_records_a_secondary_that_never_produced_a_manifest() {
        let rng = SystemRandom::new();
        let pkcs8 = Ed25519KeyPair::generate_pkcs8(&rng).unwrap();
        let primary_key = PrivateKey { key_id: KeyId("primary".into()), kind: KeyKind::Ed25519, der_bytes: pkcs8.as_ref().to_vec() };
        let reports = vec![SecondaryReport {
            ecu: EcuSerial("s1".into()),
            manifest_envelope: None,
            attacks_detected: "dispatch failed: secondary timed out".into(),
        }];

        let bytes = aggregate_device_manifest(&primary_key, &EcuSerial("p1".into()), None, &reports, None).unwrap();
        let parsed: Value = serde_json::from_slice(&bytes).unwrap();
        let manifests = parsed["signed"]["ecu_version_manifests"].as_array().unwrap();
        assert_eq!(manifests.len(), 2);
        assert_eq!(manifests[1]["signed"]["ecu_serial"], "s1");
        assert_eq!(manifests[1]["signed"]["attacks_detected"], "dispatch failed: secondary timed out");
    }

    fn primary_key_public(key: &PrivateKey) -> PublicKey {
        let pkcs8 = ring::signature::Ed25519KeyPair::from_pkcs8(&key.der_bytes).unwrap();
        PublicKey::new(KeyKind::Ed25519, hex::encode(pkcs8.public_key().as_ref())).unwrap()
    }
}
