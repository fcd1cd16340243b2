//! Canonical-JSON signature verification, threshold checks, expiry, root
//! rotation and cross-repository target agreement. Each role's signed
//! body is typed (`metadata::*`) rather than kept as one generic
//! container, so a caller can't accidentally read a Timestamp field off
//! a Targets document.

use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;

use crate::crypto;
use crate::error::Error;
use crate::metadata::delegation::DelegationDef;
use crate::metadata::key::{KeyId, PublicKey};
use crate::metadata::role::{Role, Version};
use crate::metadata::root::{MAX_THRESHOLD, MIN_THRESHOLD, Root, RootBody};
use crate::metadata::signed::{Signature, SignatureMethod, SignedMetadata};
use crate::metadata::target::Target;
use crate::metadata::targets::Targets;

/// Root rotation is bounded so a malicious or broken Director cannot stall
/// the device in an unbounded fetch loop.
pub const MAX_ROOT_ROTATIONS: u32 = 1000;

/// The key set and threshold a document is checked against: either a
/// top-level role's entry in `Root`, or a delegated role's entry in its
/// parent `Targets`' `delegations`.
pub struct TrustedRole {
    pub keys: HashMap<KeyId, PublicKey>,
    pub authorized: HashSet<KeyId>,
    pub threshold: u32,
}

impl TrustedRole {
    pub fn for_role(root: &Root, role: &Role) -> Result<TrustedRole, Error> {
        let authorized = root
            .authorized_keys_for(role)
            .cloned()
            .ok_or_else(|| Error::InvalidMetadata(format!("root carries no key set for {}", role)))?;
        let threshold = root
            .threshold_for(role)
            .ok_or_else(|| Error::InvalidMetadata(format!("root carries no threshold for {}", role)))?;
        Ok(TrustedRole { keys: root.keys.clone(), authorized, threshold })
    }

    pub fn for_delegation(parent: &Targets, delegation: &DelegationDef) -> TrustedRole {
        TrustedRole {
            keys: parent.delegation_keys.clone(),
            authorized: delegation.key_ids.clone(),
            threshold: delegation.threshold,
        }
    }

    fn from_root_body(body: &RootBody) -> Result<TrustedRole, Error> {
        let data = body
            .roles
            .get(&Role::Root)
            .ok_or_else(|| Error::InvalidMetadata("root body carries no root role entry".into()))?;
        let keys = body
            .keys
            .iter()
            .map(|(id, wire)| (id.clone(), PublicKey::with_id(wire.keytype, wire.keyval.public.clone(), id.clone())))
            .collect();
        Ok(TrustedRole { keys, authorized: data.keyids.clone(), threshold: data.threshold })
    }
}

/// Verify `bytes` as a `role` document trusted via `trusted`: parse, check
/// signatures against the trusted key set, enforce the threshold, check the
/// `_type` tag, then check expiry. `now` is an injected clock reading so
/// expiry checks stay deterministic in tests.
pub fn verify<R: DeserializeOwned>(
    trusted: &TrustedRole,
    role: &Role,
    bytes: &[u8],
    now: DateTime<Utc>,
) -> Result<SignedMetadata<R>, Error> {
    let (envelope, header, body) = SignedMetadata::<R>::parse_unverified(bytes)?;
    let canonical = crypto::canonicalize(&envelope.signed);

    let valid_keys = validate_signatures(&envelope.signatures, &canonical, trusted)?;

    if envelope.signatures.len() == 1 && valid_keys.is_empty() {
        return Err(Error::BadKeyId);
    }
    if !(MIN_THRESHOLD..=MAX_THRESHOLD).contains(&trusted.threshold) {
        return Err(Error::IllegalThreshold(role.clone()));
    }
    if (valid_keys.len() as u32) < trusted.threshold {
        return Err(Error::UnmetThreshold(role.clone()));
    }

    if header.role_type != role.expected_type() {
        return Err(Error::SecurityException(format!(
            "expected _type {}, got {}",
            role.expected_type(),
            header.role_type
        )));
    }
    if header.expires.is_expired_at(now) {
        return Err(Error::ExpiredMetadata);
    }

    Ok(SignedMetadata { version: header.version, expires: header.expires, original_json: bytes.to_vec(), body })
}

/// Per-signature uniqueness and method checks, keyid lookup (unknown or
/// unauthorized keys are skipped, not fatal), and signature verification.
/// Returns the set of distinct keys that produced a valid signature.
fn validate_signatures(
    signatures: &[Signature],
    canonical: &[u8],
    trusted: &TrustedRole,
) -> Result<HashSet<KeyId>, Error> {
    let mut seen = HashSet::new();
    let mut valid = HashSet::new();
    for sig in signatures {
        if !seen.insert(sig.keyid.clone()) {
            return Err(Error::NonUniqueSignatures);
        }
        if !matches!(sig.method, SignatureMethod::Ed25519 | SignatureMethod::RsaSsaPss | SignatureMethod::RsaSsaPssSha256) {
            return Err(Error::SecurityException(format!("unsupported signature method on key {}", sig.keyid)));
        }
        let key = match trusted.keys.get(&sig.keyid) {
            Some(key) => key,
            None => continue, // unknown key-id: silently skipped
        };
        if !trusted.authorized.contains(&sig.keyid) {
            continue; // known key, not authorized for this role: skipped with a warning
        }
        let sig_bytes = match base64::decode(&sig.sig) {
            Ok(bytes) => bytes,
            Err(_) => continue,
        };
        if key.verify(canonical, &sig_bytes) {
            valid.insert(sig.keyid.clone());
        }
    }
    Ok(valid)
}

/// `verifyNewRoot`: roll `old_root` forward by one Root
/// document, requiring agreement from both the outgoing and incoming key
/// sets. Callers loop this up to `MAX_ROOT_ROTATIONS` times to walk to the
/// repository's latest Root.
pub fn verify_new_root(old_root: &Root, bytes: &[u8], now: DateTime<Utc>) -> Result<SignedMetadata<RootBody>, Error> {
    let (envelope, header, body) = SignedMetadata::<RootBody>::parse_unverified(bytes)?;
    let canonical = crypto::canonicalize(&envelope.signed);

    let old_trusted = TrustedRole::for_role(old_root, &Role::Root)?;
    let new_trusted = TrustedRole::from_root_body(&body)?;

    let valid_against_old = validate_signatures(&envelope.signatures, &canonical, &old_trusted)?;
    if (valid_against_old.len() as u32) < old_trusted.threshold {
        return Err(Error::UnmetThreshold(Role::Root));
    }
    let valid_against_new = validate_signatures(&envelope.signatures, &canonical, &new_trusted)?;
    if (valid_against_new.len() as u32) < new_trusted.threshold {
        return Err(Error::UnmetThreshold(Role::Root));
    }

    if header.role_type != Role::Root.expected_type() {
        return Err(Error::SecurityException(format!("expected _type root, got {}", header.role_type)));
    }
    if header.version != old_root.version.next() {
        return Err(Error::SecurityException(format!(
            "root rotation must advance by exactly one version: {} -> {}",
            old_root.version, header.version
        )));
    }
    if header.expires.is_expired_at(now) {
        return Err(Error::ExpiredMetadata);
    }

    Ok(SignedMetadata { version: header.version, expires: header.expires, original_json: bytes.to_vec(), body })
}

/// `verifyTargetAgreement`: the Image repository (possibly
/// reached through delegation) must expose a target with the same hashes
/// and length as the one Director selected, and the hardware id Director's
/// custom field claims must match the target ECU's registered hwid.
pub fn verify_target_agreement(
    director_target: &Target,
    image_target: &Target,
    registered_hwid: Option<&str>,
) -> Result<(), Error> {
    if !director_target.agrees_with(image_target) {
        return Err(Error::MissMatchTarget(director_target.filename.clone()));
    }
    if director_target.hardware_id().as_deref() != registered_hwid {
        return Err(Error::MissMatchTarget(director_target.filename.clone()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet as Set;

    use maplit::{hashmap, hashset};
    use ring::rand::SystemRandom;
    use ring::signature::{Ed25519KeyPair, KeyPair};

    use super::*;
    use crate::metadata::expiry::Expiry;
    use crate::metadata::key::KeyKind;
    use crate::metadata::role::RepositoryKind;

    struct SignedFixture {
        bytes: Vec<u8>,
        trusted: TrustedRole,
    }

    fn sign_targets_fixture(expires: &str, version: u64) -> SignedFixture {
        let rng = SystemRandom::new();
        let pkcs8 = Ed25519KeyPair::generate_pkcs8(&rng).unwrap();
        let pair = Ed25519KeyPair::from_pkcs8(pkcs8.as_ref()).unwrap();
        let pubkey_hex = hex::encode(pair.public_key().as_ref());
        let pk = PublicKey::new(KeyKind::Ed25519, pubkey_hex).unwrap();

        let signed = serde_json::json!({
            "_type": "targets",
            "version": version,
            "expires": expires,
            "targets": {},
        });
        let canonical = crypto::canonicalize(&signed);
        let sig_bytes = crate::crypto::sign_ed25519(pkcs8.as_ref(), &canonical).unwrap();
        let envelope = serde_json::json!({
            "signed": signed,
            "signatures": [{
                "keyid": pk.key_id.0,
                "method": "ed25519",
                "sig": base64::encode(sig_bytes),
            }],
        });
        let trusted = TrustedRole {
            keys: hashmap! { pk.key_id.clone() => pk.clone() },
            authorized: hashset! { pk.key_id.clone() },
            threshold: 1,
        };
        SignedFixture { bytes: serde_json::to_vec(&envelope).unwrap(), trusted }
    }

    #[test]
    fn accepts_a_well_formed_single_signature_document() {
        let fixture = sign_targets_fixture("2030-01-01T00:00:00Z", 1);
        let now = chrono::Utc::now();
        let verified = verify::<crate::metadata::targets::TargetsBody>(&fixture.trusted, &Role::Targets, &fixture.bytes, now);
        assert!(verified.is_ok());
    }

    #[test]
    fn rejects_expired_metadata() {
        let fixture = sign_targets_fixture("2000-01-01T00:00:00Z", 1);
        let now = chrono::Utc::now();
        let err = verify::<crate::metadata::targets::TargetsBody>(&fixture.trusted, &Role::Targets, &fixture.bytes, now)
            .unwrap_err();
        assert!(matches!(err, Error::ExpiredMetadata));
    }

    #[test]
    fn single_invalid_signature_is_bad_key_id() {
        let mut fixture = sign_targets_fixture("2030-01-01T00:00:00Z", 1);
        // Corrupt the one signature present so it no longer verifies.
        let mut envelope: serde_json::Value = serde_json::from_slice(&fixture.bytes).unwrap();
        envelope["signatures"][0]["sig"] = serde_json::Value::String(base64::encode(b"not-a-signature"));
        fixture.bytes = serde_json::to_vec(&envelope).unwrap();

        let now = chrono::Utc::now();
        let err = verify::<crate::metadata::targets::TargetsBody>(&fixture.trusted, &Role::Targets, &fixture.bytes, now)
            .unwrap_err();
        assert!(matches!(err, Error::BadKeyId));
    }

    #[test]
    fn unmet_threshold_requires_two_signatures_against_threshold_two() {
        let fixture = sign_targets_fixture("2030-01-01T00:00:00Z", 1);
        // A second, unrelated authorized key never actually signs the document,
        // so threshold 2 is never met even though the one real signature is valid.
        let other_key_id = KeyId("0000000000000000000000000000000000000000000000000000000000000000".into());
        let mut authorized = fixture.trusted.authorized.clone();
        authorized.insert(other_key_id);
        let trusted = TrustedRole { keys: fixture.trusted.keys.clone(), authorized, threshold: 2 };
        let now = chrono::Utc::now();
        let err = verify::<crate::metadata::targets::TargetsBody>(&trusted, &Role::Targets, &fixture.bytes, now).unwrap_err();
        assert!(matches!(err, Error::UnmetThreshold(Role::Targets)));
    }

    #[test]
    fn wrong_type_is_security_exception() {
        let fixture = sign_targets_fixture("2030-01-01T00:00:00Z", 1);
        let now = chrono::Utc::now();
        let err =
            verify::<crate::metadata::targets::TargetsBody>(&fixture.trusted, &Role::Root, &fixture.bytes, now).unwrap_err();
        assert!(matches!(err, Error::SecurityException(_)));
    }

    #[test]
    fn target_agreement_requires_matching_hwid() {
        let mut hashes = Set::new();
        hashes.insert(crate::metadata::hash::Hash::new(crate::metadata::hash::HashAlgorithm::Sha256, b"fw"));
        let mut director = Target::new("fw.bin", "primary", 2, hashes.clone()).unwrap();
        director.custom_format = Some(r#"{"hardwareIdentifier":"hw-1"}"#.to_string());
        let image = Target::new("fw.bin", "image-side", 2, hashes).unwrap();

        assert!(verify_target_agreement(&director, &image, Some("hw-1")).is_ok());
        assert!(verify_target_agreement(&director, &image, Some("hw-2")).is_err());
    }

    #[test]
    fn target_agreement_catches_hash_mismatch() {
        let mut hashes_a = Set::new();
        hashes_a.insert(crate::metadata::hash::Hash::new(crate::metadata::hash::HashAlgorithm::Sha256, b"fw-a"));
        let mut hashes_b = Set::new();
        hashes_b.insert(crate::metadata::hash::Hash::new(crate::metadata::hash::HashAlgorithm::Sha256, b"fw-b"));
        let director = Target::new("fw.bin", "primary", 2, hashes_a).unwrap();
        let image = Target::new("fw.bin", "image-side", 2, hashes_b).unwrap();
        assert!(matches!(verify_target_agreement(&director, &image, None), Err(Error::MissMatchTarget(_))));
    }

    fn root_with_single_key(version: Version, pk: &PublicKey) -> Root {
        Root {
            repo: RepositoryKind::Director,
            version,
            expires: Expiry::parse("2030-01-01T00:00:00Z").unwrap(),
            original_json: vec![],
            keys: hashmap! { pk.key_id.clone() => pk.clone() },
            thresholds: hashmap! {
                Role::Root => 1, Role::Timestamp => 1, Role::Snapshot => 1, Role::Targets => 1,
            },
            role_keys: hashmap! {
                Role::Root => hashset! { pk.key_id.clone() },
                Role::Timestamp => hashset! { pk.key_id.clone() },
                Role::Snapshot => hashset! { pk.key_id.clone() },
                Role::Targets => hashset! { pk.key_id.clone() },
            },
        }
    }

    #[test]
    fn root_rotation_requires_exact_version_increment() {
        let rng = SystemRandom::new();
        let pkcs8 = Ed25519KeyPair::generate_pkcs8(&rng).unwrap();
        let pair = Ed25519KeyPair::from_pkcs8(pkcs8.as_ref()).unwrap();
        let pk = PublicKey::new(KeyKind::Ed25519, hex::encode(pair.public_key().as_ref())).unwrap();
        let old_root = root_with_single_key(Version(1), &pk);

        let signed = serde_json::json!({
            "_type": "root",
            "version": 3,
            "expires": "2030-01-01T00:00:00Z",
            "keys": { pk.key_id.0.clone(): { "keytype": "ed25519", "keyval": { "public": pk.encoded } } },
            "roles": {
                "root": { "keyids": [pk.key_id.0.clone()], "threshold": 1 },
                "timestamp": { "keyids": [pk.key_id.0.clone()], "threshold": 1 },
                "snapshot": { "keyids": [pk.key_id.0.clone()], "threshold": 1 },
                "targets": { "keyids": [pk.key_id.0.clone()], "threshold": 1 },
            },
        });
        let canonical = crypto::canonicalize(&signed);
        let sig_bytes = crate::crypto::sign_ed25519(pkcs8.as_ref(), &canonical).unwrap();
        let envelope = serde_json::json!({
            "signed": signed,
            "signatures": [{ "keyid": pk.key_id.0, "method": "ed25519", "sig": base64::encode(sig_bytes) }],
        });
        let bytes = serde_json::to_vec(&envelope).unwrap();

        let err = verify_new_root(&old_root, &bytes, chrono::Utc::now()).unwrap_err();
        assert!(matches!(err, Error::SecurityException(_)));
    }
}
