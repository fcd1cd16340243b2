//! Canonical JSON and the two signature schemes Uptane metadata uses.
//!
//! Canonicalization is done in-process: recursively walk the parsed
//! value, sort object keys by byte value, and emit with no insignificant
//! whitespace, so the same logical document always serializes to the
//! same bytes regardless of how it arrived on the wire. Signing and
//! verification support RSA-PSS-SHA256 and Ed25519, the two schemes
//! Uptane metadata is signed with in practice.

use ring::rand::SystemRandom;
use ring::signature::{self, Ed25519KeyPair, KeyPair, RsaKeyPair};
use serde_json::Value;
use untrusted::Input;

use crate::error::Error;

/// Serialize `value` as canonical JSON: object keys sorted lexicographically
/// by UTF-8 byte value, no insignificant whitespace, recursively.
///
/// `canonical(parse(canonical(j))) == canonical(j)` for all `j`: re-parsing canonical output and re-canonicalizing is a
/// no-op because key order and formatting are both fully determined by the
/// parsed structure, not by the input text.
pub fn canonicalize(value: &Value) -> Vec<u8> {
    let mut out = Vec::new();
    write_canonical(value, &mut out);
    out
}

/// Parse `bytes` as JSON then canonicalize. Used when the caller only has
/// the raw bytes (e.g. a freshly-downloaded role file).
pub fn canonicalize_json(bytes: &[u8]) -> Result<Vec<u8>, Error> {
    let value: Value = serde_json::from_slice(bytes)?;
    Ok(canonicalize(&value))
}

fn write_canonical(value: &Value, out: &mut Vec<u8>) {
    match value {
        Value::Null => out.extend_from_slice(b"null"),
        Value::Bool(b) => out.extend_from_slice(if *b { b"true" } else { b"false" }),
        Value::Number(n) => out.extend_from_slice(n.to_string().as_bytes()),
        Value::String(s) => {
            out.extend_from_slice(serde_json::to_string(s).expect("string always serializes").as_bytes())
        }
        Value::Array(items) => {
            out.push(b'[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(b',');
                }
                write_canonical(item, out);
            }
            out.push(b']');
        }
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort_by(|a, b| a.as_bytes().cmp(b.as_bytes()));
            out.push(b'{');
            for (i, key) in keys.iter().enumerate() {
                if i > 0 {
                    out.push(b',');
                }
                out.extend_from_slice(serde_json::to_string(key).expect("string always serializes").as_bytes());
                out.push(b':');
                write_canonical(&map[*key], out);
            }
            out.push(b'}');
        }
    }
}

/// Verify an Ed25519 signature. `pem_or_raw` is either a PEM-wrapped
/// public key or bare base64/hex-free raw bytes depending on caller
/// convention; callers pass already-decoded raw key bytes here.
pub fn verify_ed25519(raw_pubkey: &str, msg: &[u8], sig: &[u8]) -> Result<bool, Error> {
    let key_bytes = decode_key_material(raw_pubkey)?;
    let public_key = signature::UnparsedPublicKey::new(&signature::ED25519, &key_bytes);
    Ok(public_key.verify(msg, sig).is_ok())
}

/// Verify an RSA-PSS-SHA256 signature against a PEM or base64-DER encoded
/// SubjectPublicKeyInfo.
pub fn verify_rsa_pss_sha256(encoded_pubkey: &str, msg: &[u8], sig: &[u8]) -> Result<bool, Error> {
    let der = decode_key_material(encoded_pubkey)?;
    let public_key = signature::UnparsedPublicKey::new(&signature::RSA_PSS_2048_8192_SHA256, &der);
    Ok(public_key.verify(msg, sig).is_ok())
}

pub fn sign_ed25519(pkcs8_der: &[u8], msg: &[u8]) -> Result<Vec<u8>, Error> {
    let pair = Ed25519KeyPair::from_pkcs8(pkcs8_der)?;
    Ok(pair.sign(msg).as_ref().to_vec())
}

pub fn sign_rsa_pss_sha256(pkcs8_der: &[u8], msg: &[u8]) -> Result<Vec<u8>, Error> {
    let pair = RsaKeyPair::from_pkcs8(pkcs8_der).map_err(|err| Error::Ring(err.to_string()))?;
    let rng = SystemRandom::new();
    let mut sig = vec![0u8; pair.public_modulus_len()];
    pair.sign(&signature::RSA_PSS_SHA256, &rng, msg, &mut sig)
        .map_err(|_| Error::Ring("RSA-PSS signing failed".into()))?;
    Ok(sig)
}

/// Accept either a PEM block or raw/hex-decoded key material. PEM is the
/// wire format used by `root.json`; tests often pass raw bytes directly.
fn decode_key_material(encoded: &str) -> Result<Vec<u8>, Error> {
    if encoded.trim_start().starts_with("-----BEGIN") {
        let pem = pem::parse(encoded)?;
        Ok(pem.contents)
    } else if let Ok(bytes) = hex::decode(encoded) {
        Ok(bytes)
    } else {
        base64::decode(encoded).map_err(Error::Base64)
    }
}

/// Marker use of `untrusted::Input` kept at the module boundary: all key
/// material entering `ring` is treated as attacker-controlled input, not
/// implicitly trusted just because it was read from local storage.
#[allow(dead_code)]
fn as_untrusted(bytes: &[u8]) -> Input {
    Input::from(bytes)
}
