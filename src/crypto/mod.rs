//! Cryptographic primitives and canonical serialization.
//!
//! This module provides the three things the rest of the crate needs to
//! authenticate messages and content-address blocks/transactions:
//!
//! - [`canonical_json`]: a deterministic, sorted-key JSON encoding with a
//!   stringify fallback for values that are not native JSON scalars,
//! - [`sha256_hex`]: SHA-256 over the canonical encoding of a value,
//! - [`Keypair`] / [`sign`] / [`verify`]: ECDSA over NIST P-256, with
//!   signatures exchanged as hex-encoded DER and keys exchanged as PEM.

use std::collections::BTreeMap;

use p256::ecdsa::signature::{Signer, Verifier};
use p256::ecdsa::{Signature, SigningKey, VerifyingKey};
use p256::pkcs8::{DecodePrivateKey, DecodePublicKey, EncodePrivateKey, EncodePublicKey};
use rand::rngs::OsRng;
use serde::Serialize;
use sha2::{Digest, Sha256};

/// Canonicalizes a `serde_json::Value` the way the source's
/// `json.dumps(obj, sort_keys=True, default=str)` does: object keys are
/// sorted ascending, and floats/ints/bools/strings serialize natively.
/// `default=str` only ever fires in the source on values `serde_json`
/// cannot otherwise represent (which do not arise for our data model), so
/// sorting keys is the only behavior this needs to reproduce.
pub fn canonical_json(value: &serde_json::Value) -> String {
    fn sorted(value: &serde_json::Value) -> serde_json::Value {
        match value {
            serde_json::Value::Object(map) => {
                let sorted_map: BTreeMap<String, serde_json::Value> = map
                    .iter()
                    .map(|(k, v)| (k.clone(), sorted(v)))
                    .collect();
                let mut out = serde_json::Map::new();
                for (k, v) in sorted_map {
                    out.insert(k, v);
                }
                serde_json::Value::Object(out)
            }
            serde_json::Value::Array(items) => {
                serde_json::Value::Array(items.iter().map(sorted).collect())
            }
            other => other.clone(),
        }
    }
    serde_json::to_string(&sorted(value)).expect("sorted Value is always serializable")
}

/// Serializes `value` to canonical JSON and returns the lowercase hex
/// SHA-256 digest of the UTF-8 bytes.
pub fn sha256_hex_value(value: &serde_json::Value) -> String {
    sha256_hex_bytes(canonical_json(value).as_bytes())
}

/// SHA-256 of a typed, `Serialize`-able value, canonicalized through
/// `serde_json::Value` first.
pub fn sha256_hex<T: Serialize>(value: &T) -> String {
    let v = serde_json::to_value(value).expect("value must serialize to JSON");
    sha256_hex_value(&v)
}

/// Stringifies `f` the way Python's `str(float)` does: integral values
/// always carry a trailing `.0` (`str(1700000000.0) == "1700000000.0"`),
/// where Rust's `f64::to_string()` would print `"1700000000"`. Used
/// wherever a timestamp is stringified before hashing, so hashes stay
/// comparable against the original Python implementation.
pub fn python_float_str(f: f64) -> String {
    if f.is_finite() && f == f.trunc() && f.abs() < 1e16 {
        format!("{f:.1}")
    } else {
        f.to_string()
    }
}

/// SHA-256 of raw bytes, returned as lowercase hex.
pub fn sha256_hex_bytes(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

/// An ECDSA/P-256 keypair used for node identity and message signing.
pub struct Keypair {
    signing_key: SigningKey,
    verifying_key: VerifyingKey,
}

impl Keypair {
    /// Generates a fresh keypair using the OS RNG.
    pub fn generate() -> Self {
        let signing_key = SigningKey::random(&mut OsRng);
        let verifying_key = *signing_key.verifying_key();
        Self {
            signing_key,
            verifying_key,
        }
    }

    /// Returns the public key encoded as a PEM `SubjectPublicKeyInfo`
    /// string, suitable for exchange between nodes.
    pub fn public_key_pem(&self) -> String {
        self.verifying_key
            .to_public_key_pem(Default::default())
            .expect("P-256 public key always encodes to PEM")
    }

    /// Returns the private key encoded as an unencrypted PKCS8 PEM string.
    pub fn private_key_pem(&self) -> String {
        self.signing_key
            .to_pkcs8_pem(Default::default())
            .expect("P-256 private key always encodes to PEM")
            .to_string()
    }

    /// Signs `message` (UTF-8 bytes) with ECDSA/SHA-256, returning the
    /// signature as hex-encoded DER.
    pub fn sign(&self, message: &str) -> String {
        let sig: Signature = self.signing_key.sign(message.as_bytes());
        hex::encode(sig.to_der().as_bytes())
    }
}

/// Loads a public key from a PEM `SubjectPublicKeyInfo` string.
pub fn load_public_key_pem(pem: &str) -> Result<VerifyingKey, CryptoError> {
    VerifyingKey::from_public_key_pem(pem).map_err(|_| CryptoError::InvalidPem)
}

/// Verifies an ECDSA/SHA-256 signature (hex-encoded DER) over `message`
/// against a PEM-encoded public key. Mirrors the source's
/// `verify_signature`: malformed input returns `false` rather than an
/// error, since callers never want a Byzantine payload to panic the
/// message loop.
pub fn verify(public_key_pem: &str, message: &str, signature_hex: &str) -> bool {
    let Ok(verifying_key) = load_public_key_pem(public_key_pem) else {
        return false;
    };
    let Ok(sig_bytes) = hex::decode(signature_hex) else {
        return false;
    };
    let Ok(signature) = Signature::from_der(&sig_bytes) else {
        return false;
    };
    verifying_key.verify(message.as_bytes(), &signature).is_ok()
}

/// Errors produced by key loading. Verification itself never returns
/// `Err` — see [`verify`].
#[derive(Debug, thiserror::Error)]
pub enum CryptoError {
    #[error("malformed PEM key material")]
    InvalidPem,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn python_float_str_matches_python_repr() {
        assert_eq!(python_float_str(1_700_000_000.0), "1700000000.0");
        assert_eq!(python_float_str(0.0), "0.0");
        assert_eq!(python_float_str(1_700_000_000.5), "1700000000.5");
    }

    #[test]
    fn canonical_json_sorts_keys() {
        let a = json!({"b": 1, "a": 2});
        let b = json!({"a": 2, "b": 1});
        assert_eq!(canonical_json(&a), canonical_json(&b));
        assert_eq!(canonical_json(&a), r#"{"a":2,"b":1}"#);
    }

    #[test]
    fn sha256_hex_is_deterministic() {
        let v = json!({"sender": 0, "receiver": 1, "amount": 5, "timestamp": "123.0"});
        assert_eq!(sha256_hex_value(&v), sha256_hex_value(&v));
    }

    #[test]
    fn sign_and_verify_round_trip() {
        let kp = Keypair::generate();
        let pem = kp.public_key_pem();
        let sig = kp.sign("hello world");
        assert!(verify(&pem, "hello world", &sig));
    }

    #[test]
    fn verify_rejects_tampered_message() {
        let kp = Keypair::generate();
        let pem = kp.public_key_pem();
        let sig = kp.sign("hello world");
        assert!(!verify(&pem, "goodbye world", &sig));
    }

    #[test]
    fn verify_never_panics_on_garbage_input() {
        assert!(!verify("not a pem", "msg", "not hex"));
        assert!(!verify("not a pem", "msg", "deadbeef"));
    }

    #[test]
    fn private_key_pem_round_trips_through_pkcs8() {
        let kp = Keypair::generate();
        let pem = kp.private_key_pem();
        let loaded = SigningKey::from_pkcs8_pem(&pem).expect("valid PKCS8 PEM");
        assert_eq!(loaded.to_bytes(), kp.signing_key.to_bytes());
    }

    proptest::proptest! {
        /// Hash determinism must hold no matter what order a transaction's
        /// fields were inserted in, since `canonical_json` sorts keys
        /// before hashing.
        #[test]
        fn canonical_json_is_independent_of_key_insertion_order(
            sender in 0u64..1000,
            receiver in 0u64..1000,
            amount in 0u64..1_000_000,
            timestamp in 0u64..2_000_000_000,
        ) {
            let forward = serde_json::json!({
                "sender": sender, "receiver": receiver, "amount": amount, "timestamp": timestamp,
            });
            let mut reversed = serde_json::Map::new();
            reversed.insert("timestamp".to_string(), serde_json::json!(timestamp));
            reversed.insert("amount".to_string(), serde_json::json!(amount));
            reversed.insert("receiver".to_string(), serde_json::json!(receiver));
            reversed.insert("sender".to_string(), serde_json::json!(sender));
            let reversed = serde_json::Value::Object(reversed);

            prop_assert_eq!(canonical_json(&forward), canonical_json(&reversed));
            prop_assert_eq!(sha256_hex_value(&forward), sha256_hex_value(&reversed));
        }
    }
}
