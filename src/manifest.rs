//! ECU and device manifest construction: the signed report every ECU
//! sends back describing what it has installed, built fresh from
//! whatever `Target` is currently on disk rather than assuming any one
//! package manager's shape.

use chrono::{DateTime, Utc};
use serde_json::{self as json, json, Value};

use crate::error::Error;
use crate::metadata::{EcuSerial, KeyKind, PrivateKey, Signature, SignatureMethod, Target};

/// One ECU's signed report of what it has installed, built fresh for
/// every `sendManifest` call.
pub struct EcuManifestInput<'a> {
    pub ecu: &'a EcuSerial,
    pub installed: Option<&'a Target>,
    /// Set once a Secondary's own manifest signature failed verification.
    pub attacks_detected: &'a str,
    /// `SetInstallationRawReport`'s override text, consumed at most once.
    pub raw_report: Option<&'a str>,
    pub now: DateTime<Utc>,
}

/// Build the `signed` JSON body for one ECU manifest, to be wrapped in a
/// `{signed, signatures}` envelope by [`sign_envelope`].
pub fn ecu_manifest_body(input: &EcuManifestInput) -> Value {
    let installed_image = match input.installed {
        Some(target) => json!({
            "filepath": target.filename,
            "fileinfo": {
                "length": target.length,
                "hashes": target.hashes.iter().map(|h| (h.algorithm.to_string(), h.digest.clone())).collect::<std::collections::HashMap<_, _>>(),
            },
        }),
        None => Value::Null,
    };
    let mut body = json!({
        "ecu_serial": input.ecu.0,
        "attacks_detected": input.attacks_detected,
        "installed_image": installed_image,
        "timeserver_time": input.now.to_rfc3339(),
    });
    if let Some(report) = input.raw_report {
        body["custom"] = json!({ "raw_report": report });
    }
    body
}

/// Wrap `body` in a `{signed, signatures}` envelope, signed once by
/// `key` through `PrivateKey::sign`, dispatching on `KeyKind` so callers
/// never need to care which signature scheme a given key uses.
pub fn sign_envelope(key: &PrivateKey, body: Value) -> Result<Value, Error> {
    let canonical = crate::crypto::canonicalize(&body);
    let sig_bytes = key.sign(&canonical)?;
    let method = match key.kind {
        KeyKind::Ed25519 => SignatureMethod::Ed25519,
        KeyKind::Rsa2048 | KeyKind::Rsa3072 | KeyKind::Rsa4096 => SignatureMethod::RsaSsaPssSha256,
        KeyKind::Unknown => return Err(Error::Ring("cannot sign with an unknown key type".into())),
    };
    let signature = Signature { keyid: key.key_id.clone(), method, sig: base64::encode(sig_bytes) };
    Ok(json!({ "signed": body, "signatures": [signature] }))
}

/// Aggregate already-signed per-ECU manifest envelopes into one signed
/// device manifest, sorted by ECU serial for reproducibility.
pub fn build_device_manifest(
    primary_key: &PrivateKey,
    primary_serial: &EcuSerial,
    mut ecu_manifests: Vec<(EcuSerial, Value)>,
) -> Result<Vec<u8>, Error> {
    ecu_manifests.sort_by(|(a, _), (b, _)| a.0.cmp(&b.0));
    let body = json!({
        "primary_ecu_serial": primary_serial.0,
        "ecu_version_manifests": ecu_manifests.into_iter().map(|(_, envelope)| envelope).collect::<Vec<_>>(),
    });
    let envelope = sign_envelope(primary_key, body)?;
    Ok(json::to_vec(&envelope)?)
}
