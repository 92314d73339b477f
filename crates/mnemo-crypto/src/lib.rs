//! Hashing, Ed25519 signing and scrypt+AES-256-GCM key envelopes.
//!
//! All digests and signatures are represented as algorithm-tagged strings
//! (`"sha256:<hex>"`, `"ed25519:<hex>"`) rather than bare hex, so a tag
//! mismatch is caught before the bytes are even decoded. Signing always
//! operates over the canonical skeleton (§4.1): a fixed field order with
//! metadata keys sorted and missing metadata serialized as `null`, never
//! omitted.

#![deny(unsafe_code)]
#![warn(missing_docs)]

use aes_gcm::{aead::Aead, Aes256Gcm, KeyInit, Nonce};
use ed25519_dalek::{Signer, Verifier};
use scrypt::Params as ScryptParams;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

/// Errors produced by the cryptography primitives.
#[derive(Debug, Error)]
pub enum CryptoError {
    /// A tagged string (`"sha256:..."`, `"ed25519:..."`) had the wrong tag or
    /// the wrong number of hex characters for its algorithm.
    #[error("malformed tagged value: {0}")]
    Malformed(String),
    /// Key-envelope decryption failed: wrong password or a tampered envelope.
    /// Deliberately a single variant — see module docs.
    #[error("decryption failed: wrong password or corrupted key material")]
    DecryptionFailed,
    /// scrypt parameters were invalid (e.g. N not a power of two > 1).
    #[error("invalid scrypt parameters: {0}")]
    InvalidParams(String),
}

const SHA256_TAG: &str = "sha256:";
const ED25519_SIG_TAG: &str = "ed25519:";

/// Compute the tagged SHA-256 digest of `bytes`, e.g. `"sha256:3a7bd3e2...`.
pub fn hash(bytes: &[u8]) -> String {
    let digest = Sha256::digest(bytes);
    format!("{SHA256_TAG}{}", hex::encode(digest))
}

/// Parse a `"sha256:<hex>"` tagged digest into raw bytes.
pub fn parse_sha256(tagged: &str) -> Result<[u8; 32], CryptoError> {
    let hex_part = tagged
        .strip_prefix(SHA256_TAG)
        .ok_or_else(|| CryptoError::Malformed(tagged.to_string()))?;
    let bytes = hex::decode(hex_part).map_err(|_| CryptoError::Malformed(tagged.to_string()))?;
    bytes
        .try_into()
        .map_err(|_| CryptoError::Malformed(tagged.to_string()))
}

/// An Ed25519 key pair. Does not implement `Serialize` or expose raw private
/// key bytes through `Debug` — only [`Ed25519KeyPair::private_key_bytes`]
/// yields the seed, and only for callers that must persist it (`agent.key`).
pub struct Ed25519KeyPair {
    signing_key: ed25519_dalek::SigningKey,
}

impl Ed25519KeyPair {
    /// Generate a fresh random key pair.
    pub fn generate() -> Self {
        let mut csprng = rand::rngs::OsRng;
        Self { signing_key: ed25519_dalek::SigningKey::generate(&mut csprng) }
    }

    /// Reconstruct a key pair from a raw 32-byte seed (e.g. loaded from
    /// `agent.key`).
    pub fn from_seed(seed: &[u8; 32]) -> Self {
        Self { signing_key: ed25519_dalek::SigningKey::from_bytes(seed) }
    }

    /// The raw 32-byte private key seed, for persistence only.
    pub fn private_key_bytes(&self) -> [u8; 32] {
        self.signing_key.to_bytes()
    }

    /// The tagged public key string, e.g. `"ed25519:<64 hex chars>"`.
    pub fn public_key_tagged(&self) -> String {
        format!("{ED25519_SIG_TAG}{}", hex::encode(self.signing_key.verifying_key().to_bytes()))
    }

    /// The raw 32-byte public key.
    pub fn public_key_bytes(&self) -> [u8; 32] {
        self.signing_key.verifying_key().to_bytes()
    }

    /// Sign `message` and return the tagged signature string.
    pub fn sign(&self, message: &[u8]) -> String {
        let sig = self.signing_key.sign(message);
        format!("{ED25519_SIG_TAG}{}", hex::encode(sig.to_bytes()))
    }
}

impl std::fmt::Debug for Ed25519KeyPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Ed25519KeyPair(<private>)")
    }
}

/// Verify `signature` (tagged, `"ed25519:<hex>"`) over `message` under
/// `public_key` (tagged, `"ed25519:<hex>"`). Returns `false` on any
/// malformed input rather than propagating a parse error — verification is
/// a boolean predicate per §4.1.
pub fn verify(message: &[u8], signature: &str, public_key: &str) -> bool {
    let Some(sig_hex) = signature.strip_prefix(ED25519_SIG_TAG) else { return false };
    let Some(pk_hex) = public_key.strip_prefix(ED25519_SIG_TAG) else { return false };
    let Ok(sig_bytes) = hex::decode(sig_hex) else { return false };
    let Ok(pk_bytes) = hex::decode(pk_hex) else { return false };
    let Ok(sig_arr): Result<[u8; 64], _> = sig_bytes.try_into() else { return false };
    let Ok(pk_arr): Result<[u8; 32], _> = pk_bytes.try_into() else { return false };
    let Ok(vk) = ed25519_dalek::VerifyingKey::from_bytes(&pk_arr) else { return false };
    let sig = ed25519_dalek::Signature::from_bytes(&sig_arr);
    vk.verify(message, &sig).is_ok()
}

/// The canonical skeleton over which signatures are computed: a fixed field
/// order (seq, ts, type, tier, content_hash, prev_hash, metadata), with
/// `metadata` keys lexicographically sorted (guaranteed by `serde_json`'s
/// default `BTreeMap`-backed `Map`, since this crate does not enable the
/// `preserve_order` feature) and missing metadata serialized as `null`.
#[derive(Serialize)]
pub struct Skeleton<'a> {
    /// Monotonically increasing sequence number.
    pub seq: u64,
    /// RFC3339 millisecond-precision UTC timestamp.
    pub ts: &'a str,
    /// Entry type: `memory` | `identity` | `decision` | `redaction`.
    #[serde(rename = "type")]
    pub kind: &'a str,
    /// Persistence tier: `committed` | `relationship` | `ephemeral`.
    pub tier: &'a str,
    /// Tagged SHA-256 digest of the referenced blob.
    pub content_hash: &'a str,
    /// Tagged digest of the previous entry's canonical signed form, or `None`
    /// only at genesis (`seq == 0`).
    pub prev_hash: Option<&'a str>,
    /// Entry metadata, or `Value::Null` when absent (never omitted).
    pub metadata: &'a serde_json::Value,
}

#[derive(Serialize)]
struct SkeletonWithSignature<'a> {
    seq: u64,
    ts: &'a str,
    #[serde(rename = "type")]
    kind: &'a str,
    tier: &'a str,
    content_hash: &'a str,
    prev_hash: Option<&'a str>,
    metadata: &'a serde_json::Value,
    signature: &'a str,
}

impl<'a> Skeleton<'a> {
    /// The exact byte sequence over which the Ed25519 signature is computed.
    pub fn canonical_bytes(&self) -> Vec<u8> {
        serde_json::to_vec(self).expect("skeleton serialization cannot fail")
    }

    /// The canonical entry hash: the tagged SHA-256 digest of the skeleton
    /// plus `signature` appended as the last field. This is the value the
    /// next entry's `prev_hash` must equal.
    pub fn canonical_entry_hash(&self, signature: &str) -> String {
        let with_sig = SkeletonWithSignature {
            seq: self.seq,
            ts: self.ts,
            kind: self.kind,
            tier: self.tier,
            content_hash: self.content_hash,
            prev_hash: self.prev_hash,
            metadata: self.metadata,
            signature,
        };
        let bytes = serde_json::to_vec(&with_sig).expect("skeleton serialization cannot fail");
        hash(&bytes)
    }
}

/// An encrypted private-key envelope, per §6's on-disk JSON shape.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeyEnvelope {
    /// Envelope format version.
    pub version: u32,
    /// Cipher identifier, always `"aes-256-gcm"`.
    pub algorithm: String,
    /// KDF identifier, always `"scrypt"`.
    pub kdf: String,
    /// scrypt parameters used to derive the AES key from the password.
    #[serde(rename = "kdfParams")]
    pub kdf_params: KdfParams,
    /// 96-bit IV/nonce, hex-encoded (24 hex chars).
    pub iv: String,
    /// AES-GCM ciphertext, hex-encoded (tag excluded).
    pub ciphertext: String,
    /// 128-bit authentication tag, hex-encoded (32 hex chars).
    pub tag: String,
}

/// scrypt KDF parameters recorded alongside the envelope so a future reader
/// can reproduce the same derived key even if the default parameters change.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct KdfParams {
    /// CPU/memory cost parameter (power of two).
    pub n: u32,
    /// Block size parameter.
    pub r: u32,
    /// Parallelization parameter.
    pub p: u32,
    /// Random salt, hex-encoded.
    pub salt: String,
}

impl KdfParams {
    /// Scrypt parameters calibrated for interactive use (matches common
    /// password-manager defaults): N=2^15, r=8, p=1.
    pub fn interactive_default() -> Self {
        use rand::RngCore;
        let mut salt = [0u8; 32];
        rand::rngs::OsRng.fill_bytes(&mut salt);
        Self { n: 1 << 15, r: 8, p: 1, salt: hex::encode(salt) }
    }

    fn derive_key(&self, password: &str) -> Result<[u8; 32], CryptoError> {
        let log_n = (31 - self.n.leading_zeros()) as u8;
        if 1u32 << log_n != self.n {
            return Err(CryptoError::InvalidParams("n must be a power of two".into()));
        }
        let params = ScryptParams::new(log_n, self.r, self.p, 32)
            .map_err(|e| CryptoError::InvalidParams(e.to_string()))?;
        let salt = hex::decode(&self.salt).map_err(|_| CryptoError::InvalidParams("salt".into()))?;
        let mut out = [0u8; 32];
        scrypt::scrypt(password.as_bytes(), &salt, &params, &mut out)
            .map_err(|e| CryptoError::InvalidParams(e.to_string()))?;
        Ok(out)
    }
}

/// Encrypt `secret` (typically a 32-byte Ed25519 seed) under `password`,
/// deriving the AES-256 key via scrypt with `params`.
pub fn encrypt_key(
    secret: &[u8],
    password: &str,
    params: KdfParams,
) -> Result<KeyEnvelope, CryptoError> {
    use rand::RngCore;
    let key_bytes = params.derive_key(password)?;
    let key = aes_gcm::Key::<Aes256Gcm>::from_slice(&key_bytes);
    let cipher = Aes256Gcm::new(key);
    let mut iv = [0u8; 12];
    rand::rngs::OsRng.fill_bytes(&mut iv);
    let nonce = Nonce::from_slice(&iv);
    let mut ct_and_tag =
        cipher.encrypt(nonce, secret).map_err(|_| CryptoError::InvalidParams("encrypt".into()))?;
    let tag = ct_and_tag.split_off(ct_and_tag.len() - 16);
    Ok(KeyEnvelope {
        version: 1,
        algorithm: "aes-256-gcm".into(),
        kdf: "scrypt".into(),
        kdf_params: params,
        iv: hex::encode(iv),
        ciphertext: hex::encode(ct_and_tag),
        tag: hex::encode(tag),
    })
}

/// Decrypt an envelope under `password`. A wrong password and a tampered
/// envelope are reported identically (`DecryptionFailed`) to avoid a
/// padding-oracle-shaped signal.
pub fn decrypt_key(envelope: &KeyEnvelope, password: &str) -> Result<Vec<u8>, CryptoError> {
    let key_bytes =
        envelope.kdf_params.derive_key(password).map_err(|_| CryptoError::DecryptionFailed)?;
    let key = aes_gcm::Key::<Aes256Gcm>::from_slice(&key_bytes);
    let cipher = Aes256Gcm::new(key);
    let iv = hex::decode(&envelope.iv).map_err(|_| CryptoError::DecryptionFailed)?;
    let mut ct = hex::decode(&envelope.ciphertext).map_err(|_| CryptoError::DecryptionFailed)?;
    let tag = hex::decode(&envelope.tag).map_err(|_| CryptoError::DecryptionFailed)?;
    if iv.len() != 12 || tag.len() != 16 {
        return Err(CryptoError::DecryptionFailed);
    }
    ct.extend_from_slice(&tag);
    let nonce = Nonce::from_slice(&iv);
    cipher.decrypt(nonce, ct.as_ref()).map_err(|_| CryptoError::DecryptionFailed)
}

mod hex {
    //! Minimal lowercase hex codec, avoiding an extra dependency for a
    //! handful of encode/decode calls.

    pub fn encode(bytes: impl AsRef<[u8]>) -> String {
        bytes.as_ref().iter().map(|b| format!("{b:02x}")).collect()
    }

    pub fn decode(s: &str) -> Result<Vec<u8>, &'static str> {
        if s.len() % 2 != 0 {
            return Err("odd-length hex string");
        }
        (0..s.len())
            .step_by(2)
            .map(|i| u8::from_str_radix(&s[i..i + 2], 16).map_err(|_| "invalid hex digit"))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn hash_is_tagged_and_deterministic() {
        let a = hash(b"hello");
        let b = hash(b"hello");
        assert_eq!(a, b);
        assert!(a.starts_with("sha256:"));
        assert_eq!(a.len(), "sha256:".len() + 64);
    }

    #[test]
    fn sign_and_verify_roundtrip() {
        let kp = Ed25519KeyPair::generate();
        let sig = kp.sign(b"payload");
        assert!(verify(b"payload", &sig, &kp.public_key_tagged()));
        assert!(!verify(b"tampered", &sig, &kp.public_key_tagged()));
    }

    #[test]
    fn verify_rejects_wrong_key() {
        let kp1 = Ed25519KeyPair::generate();
        let kp2 = Ed25519KeyPair::generate();
        let sig = kp1.sign(b"payload");
        assert!(!verify(b"payload", &sig, &kp2.public_key_tagged()));
    }

    #[test]
    fn verify_rejects_malformed_tags() {
        assert!(!verify(b"x", "not-tagged", "ed25519:00"));
        assert!(!verify(b"x", "ed25519:00", "not-tagged"));
    }

    #[test]
    fn from_seed_is_deterministic() {
        let seed = [7u8; 32];
        let kp1 = Ed25519KeyPair::from_seed(&seed);
        let kp2 = Ed25519KeyPair::from_seed(&seed);
        assert_eq!(kp1.public_key_tagged(), kp2.public_key_tagged());
        assert_eq!(kp1.sign(b"m"), kp2.sign(b"m"));
    }

    #[test]
    fn skeleton_field_order_is_fixed() {
        let metadata = json!(null);
        let skel = Skeleton {
            seq: 0,
            ts: "1970-01-01T00:00:00.000Z",
            kind: "identity",
            tier: "committed",
            content_hash: "sha256:00",
            prev_hash: None,
            metadata: &metadata,
        };
        let bytes = skel.canonical_bytes();
        let s = String::from_utf8(bytes).unwrap();
        assert_eq!(
            s,
            r#"{"seq":0,"ts":"1970-01-01T00:00:00.000Z","type":"identity","tier":"committed","content_hash":"sha256:00","prev_hash":null,"metadata":null}"#
        );
    }

    #[test]
    fn skeleton_metadata_keys_are_sorted() {
        let metadata = json!({"zeta": 1, "alpha": 2});
        let skel = Skeleton {
            seq: 1,
            ts: "t",
            kind: "memory",
            tier: "ephemeral",
            content_hash: "sha256:00",
            prev_hash: Some("sha256:11"),
            metadata: &metadata,
        };
        let s = String::from_utf8(skel.canonical_bytes()).unwrap();
        let alpha_pos = s.find("alpha").unwrap();
        let zeta_pos = s.find("zeta").unwrap();
        assert!(alpha_pos < zeta_pos);
    }

    #[test]
    fn key_envelope_roundtrip() {
        let secret = [9u8; 32];
        let mut params = KdfParams::interactive_default();
        params.n = 1 << 10; // keep the test fast
        let envelope = encrypt_key(&secret, "hunter2", params).unwrap();
        let recovered = decrypt_key(&envelope, "hunter2").unwrap();
        assert_eq!(recovered, secret);
    }

    #[test]
    fn key_envelope_wrong_password_fails() {
        let secret = [9u8; 32];
        let mut params = KdfParams::interactive_default();
        params.n = 1 << 10;
        let envelope = encrypt_key(&secret, "hunter2", params).unwrap();
        assert!(decrypt_key(&envelope, "wrong").is_err());
    }

    #[test]
    fn key_envelope_tamper_fails() {
        let secret = [9u8; 32];
        let mut params = KdfParams::interactive_default();
        params.n = 1 << 10;
        let mut envelope = encrypt_key(&secret, "hunter2", params).unwrap();
        let mut raw = super::hex::decode(&envelope.ciphertext).unwrap();
        raw[0] ^= 0xff;
        envelope.ciphertext = super::hex::encode(raw);
        assert!(decrypt_key(&envelope, "hunter2").is_err());
    }
}
