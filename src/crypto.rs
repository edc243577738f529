//! Cryptographic primitives: key pairs, fingerprints, signatures, and the
//! hybrid (RSA key-wrap + AES-256-GCM payload) envelope encryption.
//!
//! Grounded on the teacher's `crypto.rs` (X25519 ECDH + AES-256-GCM session
//! keys), generalized to the 2048-bit RSA key pair the spec requires: a
//! fresh symmetric key per message, wrapped per recipient with RSA-OAEP,
//! rather than one ECDH-derived session key per peer pair.

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use rand::RngCore;
use rsa::pkcs8::{DecodePublicKey, EncodePublicKey, LineEnding};
use rsa::pss::{Signature as PssSignature, SigningKey, VerifyingKey};
use rsa::sha2::Sha256;
use rsa::signature::{RandomizedSigner, SignatureEncoding, Verifier as SignatureVerifier};
use rsa::{Oaep, RsaPrivateKey, RsaPublicKey};
use serde::Serialize;

use crate::error::{ChatError, Result};

/// RSA modulus size mandated by the spec.
pub const KEY_BITS: usize = 2048;
/// Public exponent mandated by the spec (65537).
pub const PUBLIC_EXPONENT: u64 = 65_537;

/// Width of the AES-256-GCM nonce this crate fixes (see SPEC_FULL.md §10.6.2).
/// Serialized into the wire envelope's 16-byte-capacity `iv` field,
/// zero-padded on the wire and truncated back to 12 bytes on decode.
pub const GCM_NONCE_LEN: usize = 12;
/// On-wire width of the `iv` field, per the data model in spec.md §3.
pub const WIRE_IV_LEN: usize = 16;

/// A long-term asymmetric key pair, as described in spec.md §3.
#[derive(Clone)]
pub struct KeyPair {
    private: RsaPrivateKey,
    public: RsaPublicKey,
}

impl KeyPair {
    /// `GenerateKeyPair`: 2048-bit RSA, e=65537.
    pub fn generate() -> Result<Self> {
        let mut rng = rand::rngs::OsRng;
        let private = RsaPrivateKey::new(&mut rng, KEY_BITS)
            .map_err(|e| ChatError::Crypto(format!("key generation failed: {e}")))?;
        let public = RsaPublicKey::from(&private);
        Ok(Self { private, public })
    }

    pub fn public(&self) -> &RsaPublicKey {
        &self.public
    }

    /// `ExportPublic`: PEM (SPKI) encoding of the public key.
    pub fn export_public(&self) -> Result<String> {
        export_public(&self.public)
    }

    /// `Fingerprint` of this pair's own public key.
    pub fn fingerprint(&self) -> Result<String> {
        fingerprint(&self.public)
    }

    /// `Sign`: signature over `canonical_json(data) || decimal(counter)`.
    pub fn sign<T: Serialize>(&self, data: &T, counter: u64) -> Result<String> {
        let message = signing_input(data, counter)?;
        let signing_key = SigningKey::<Sha256>::new(self.private.clone());
        let mut rng = rand::rngs::OsRng;
        let signature = signing_key.sign_with_rng(&mut rng, &message);
        Ok(BASE64.encode(signature.to_bytes()))
    }

    /// `UnwrapKey`: RSA-OAEP/SHA-256 decrypt of a wrapped symmetric key.
    /// Returns an error if the padding doesn't validate; callers try the
    /// next wrapped-key entry rather than propagate (see spec.md §4.8).
    pub fn unwrap_key(&self, wrapped_b64: &str) -> Result<[u8; 32]> {
        let wrapped = BASE64
            .decode(wrapped_b64)
            .map_err(|e| ChatError::Crypto(format!("bad base64: {e}")))?;
        let padding = Oaep::new::<Sha256>();
        let plaintext = self
            .private
            .decrypt(padding, &wrapped)
            .map_err(|_| ChatError::DecryptionFailed)?;
        plaintext
            .try_into()
            .map_err(|_| ChatError::DecryptionFailed)
    }
}

/// `ExportPublic`: PEM (SPKI) encoding of an arbitrary public key.
pub fn export_public(public: &RsaPublicKey) -> Result<String> {
    public
        .to_public_key_pem(LineEnding::LF)
        .map_err(|e| ChatError::Crypto(format!("pem export failed: {e}")))
}

/// `ImportPublic`: inverse of [`export_public`].
pub fn import_public(pem: &str) -> Result<RsaPublicKey> {
    RsaPublicKey::from_public_key_pem(pem)
        .map_err(|e| ChatError::Crypto(format!("pem import failed: {e}")))
}

/// `Fingerprint`: lowercase hex SHA-256 of the PEM encoding, 64 chars.
pub fn fingerprint(public: &RsaPublicKey) -> Result<String> {
    let pem = export_public(public)?;
    Ok(fingerprint_of_pem(&pem))
}

/// Same as [`fingerprint`] but over an already-exported PEM string, for
/// callers (the directory, the client's `FingerprintToPEM` table) that
/// only ever see the PEM text on the wire.
pub fn fingerprint_of_pem(pem: &str) -> String {
    use sha2::Digest;
    let digest = Sha256::digest(pem.as_bytes());
    hex::encode(digest)
}

/// `Verify`: never raises — any decoding or verification failure yields
/// `false`.
pub fn verify<T: Serialize>(data: &T, counter: u64, signature_b64: &str, public: &RsaPublicKey) -> bool {
    (|| -> Result<bool> {
        let message = signing_input(data, counter)?;
        let sig_bytes = BASE64
            .decode(signature_b64)
            .map_err(|e| ChatError::Crypto(format!("bad base64: {e}")))?;
        let signature = PssSignature::try_from(sig_bytes.as_slice())
            .map_err(|e| ChatError::Crypto(format!("bad signature encoding: {e}")))?;
        let verifying_key = VerifyingKey::<Sha256>::new(public.clone());
        Ok(verifying_key.verify(&message, &signature).is_ok())
    })()
    .unwrap_or(false)
}

/// Canonical signing input: sorted-keys, no-whitespace JSON of `data`,
/// concatenated with the decimal counter, as UTF-8 bytes.
///
/// `serde_json::to_string` on a typed value (a derived `#[serde(tag =
/// "type")]` enum, here) writes fields in declaration order, not sorted
/// — sorting only falls out of `serde_json::Value`'s object map being a
/// `BTreeMap` (as long as the `preserve_order` feature is off, which it
/// is here). So `data` is routed through `serde_json::to_value` first to
/// land in that `Value` representation, and only the resulting `Value`
/// is stringified; serializing `data` directly would skip the sort.
fn signing_input<T: Serialize>(data: &T, counter: u64) -> Result<Vec<u8>> {
    let value = serde_json::to_value(data)?;
    let canonical = serde_json::to_string(&value)?;
    let mut message = canonical.into_bytes();
    message.extend_from_slice(counter.to_string().as_bytes());
    Ok(message)
}

/// `WrapKey`: RSA-OAEP/SHA-256 encryption of a 32-byte symmetric key to
/// one recipient's public key.
pub fn wrap_key(key: &[u8; 32], recipient: &RsaPublicKey) -> Result<String> {
    let mut rng = rand::rngs::OsRng;
    let padding = Oaep::new::<Sha256>();
    let wrapped = recipient
        .encrypt(&mut rng, padding, key.as_slice())
        .map_err(|e| ChatError::Crypto(format!("key wrap failed: {e}")))?;
    Ok(BASE64.encode(wrapped))
}

/// Generate a fresh 32-byte symmetric key.
pub fn generate_sym_key() -> [u8; 32] {
    let mut key = [0u8; 32];
    rand::rngs::OsRng.fill_bytes(&mut key);
    key
}

/// Generate a fresh nonce, returned already zero-padded to the 16-byte
/// wire width (see [`GCM_NONCE_LEN`] / [`WIRE_IV_LEN`]).
pub fn generate_iv() -> [u8; WIRE_IV_LEN] {
    let mut nonce = [0u8; GCM_NONCE_LEN];
    rand::rngs::OsRng.fill_bytes(&mut nonce);
    let mut wire = [0u8; WIRE_IV_LEN];
    wire[..GCM_NONCE_LEN].copy_from_slice(&nonce);
    wire
}

/// `SymEncrypt`: AES-256-GCM over `plaintext_utf8` with the given key and
/// (wire-width) IV. Returns base64 ciphertext including the GCM tag.
pub fn sym_encrypt(plaintext: &[u8], key: &[u8; 32], iv: &[u8; WIRE_IV_LEN]) -> Result<String> {
    let cipher = Aes256Gcm::new_from_slice(key)
        .map_err(|e| ChatError::Crypto(format!("bad key: {e}")))?;
    let nonce = Nonce::from_slice(&iv[..GCM_NONCE_LEN]);
    let ciphertext = cipher
        .encrypt(nonce, plaintext)
        .map_err(|e| ChatError::Crypto(format!("encrypt failed: {e}")))?;
    Ok(BASE64.encode(ciphertext))
}

/// `SymDecrypt`: inverse of [`sym_encrypt`].
pub fn sym_decrypt(ciphertext_b64: &str, key: &[u8; 32], iv: &[u8; WIRE_IV_LEN]) -> Result<Vec<u8>> {
    let ciphertext = BASE64
        .decode(ciphertext_b64)
        .map_err(|e| ChatError::Crypto(format!("bad base64: {e}")))?;
    let cipher = Aes256Gcm::new_from_slice(key)
        .map_err(|e| ChatError::Crypto(format!("bad key: {e}")))?;
    let nonce = Nonce::from_slice(&iv[..GCM_NONCE_LEN]);
    cipher
        .decrypt(nonce, ciphertext.as_ref())
        .map_err(|_| ChatError::DecryptionFailed)
}

/// Decode a base64 `iv`/`symm_keys` field into raw bytes, truncated to
/// the active nonce width. Malformed or short fields are rejected by the
/// caller via the returned `Result`.
pub fn decode_iv(iv_b64: &str) -> Result<[u8; WIRE_IV_LEN]> {
    let raw = BASE64
        .decode(iv_b64)
        .map_err(|e| ChatError::Crypto(format!("bad base64 iv: {e}")))?;
    raw.try_into()
        .map_err(|_| ChatError::Crypto("iv must be 16 bytes".into()))
}

pub fn encode_iv(iv: &[u8; WIRE_IV_LEN]) -> String {
    BASE64.encode(iv)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn fingerprint_stable_across_reexport() {
        let kp = KeyPair::generate().unwrap();
        let fp1 = kp.fingerprint().unwrap();
        let pem = kp.export_public().unwrap();
        let reimported = import_public(&pem).unwrap();
        let fp2 = fingerprint(&reimported).unwrap();
        assert_eq!(fp1, fp2);
        assert_eq!(fp1.len(), 64);
    }

    #[test]
    fn sign_then_verify_round_trips() {
        let kp = KeyPair::generate().unwrap();
        let other = KeyPair::generate().unwrap();
        let data = json!({"type": "hello", "public_key": "x"});

        let sig = kp.sign(&data, 1).unwrap();
        assert!(verify(&data, 1, &sig, kp.public()));
        assert!(!verify(&data, 1, &sig, other.public()));

        let mut tampered = sig.clone();
        tampered.replace_range(0..1, if tampered.starts_with('A') { "B" } else { "A" });
        assert!(!verify(&data, 1, &tampered, kp.public()));
    }

    #[test]
    fn encrypt_then_decrypt_round_trips_unicode() {
        let key = generate_sym_key();
        let iv = generate_iv();
        let plaintext = "hello \u{1F600} world, caf\u{e9}".as_bytes();
        let ciphertext = sym_encrypt(plaintext, &key, &iv).unwrap();
        let decrypted = sym_decrypt(&ciphertext, &key, &iv).unwrap();
        assert_eq!(decrypted, plaintext);
    }

    #[test]
    fn wrap_then_unwrap_key_round_trips() {
        let kp = KeyPair::generate().unwrap();
        let key = generate_sym_key();
        let wrapped = wrap_key(&key, kp.public()).unwrap();
        let unwrapped = kp.unwrap_key(&wrapped).unwrap();
        assert_eq!(key, unwrapped);
    }

    #[test]
    fn unwrap_with_wrong_key_fails_without_panic() {
        let kp_a = KeyPair::generate().unwrap();
        let kp_b = KeyPair::generate().unwrap();
        let key = generate_sym_key();
        let wrapped = wrap_key(&key, kp_a.public()).unwrap();
        assert!(kp_b.unwrap_key(&wrapped).is_err());
    }
}
