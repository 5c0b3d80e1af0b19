//! Low-level cryptographic operations.
//!
//! This is the only module in the crate that imports `ring`. Everything
//! else encrypts, decrypts and digests exclusively through the functions
//! exposed here.
//!
//! Primitive choices:
//! - **Cipher**: AES-256-GCM (authenticated encryption with AAD)
//! - **IV**: 96-bit (12 bytes), generated fresh per encryption
//! - **Digest**: HMAC-SHA-256, hex-encoded lowercase
//! - **Key size**: 256 bits (32 bytes), carried as lowercase hex
//!
//! Every ciphertext is bound to its semantic location: the caller passes
//! the `registry:key` salt as AAD, so a ciphertext moved to a different
//! entry slot fails authentication on decryption.

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use ring::aead::{self, Aad, LessSafeKey, Nonce, UnboundKey, AES_256_GCM};
use ring::hmac;
use ring::rand::{SecureRandom, SystemRandom};
use thiserror::Error;

/// The AEAD algorithm used for every entry.
const ALGORITHM: &aead::Algorithm = &AES_256_GCM;

/// Size of the GCM IV in bytes (96 bits).
pub const IV_LEN: usize = 12;

/// Size of the GCM authentication tag in bytes.
pub const TAG_LEN: usize = 16;

/// Size of a master key in bytes (256 bits).
pub const KEY_LEN: usize = 32;

#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("Bad hex key")]
    BadKeyHex,

    #[error("Invalid key")]
    InvalidKey,

    #[error("Cipher is not valid base64")]
    BadBase64,

    #[error("Cipher too short")]
    CipherTooShort,

    #[error("Authentication failed")]
    Authentication,

    #[error("Decrypted payload is not valid UTF-8")]
    NotUtf8,

    #[error("Encryption failed")]
    EncryptionFailure,

    #[error("Randomness source failed")]
    RandomnessFailure,
}

/// Source of cryptographic randomness.
///
/// Production code uses [`SystemRandomSource`]; tests inject a fixed
/// source so `generate` and IVs are reproducible.
pub trait RandomSource {
    fn fill(&self, buf: &mut [u8]) -> Result<(), CryptoError>;
}

/// The process CSPRNG (`ring::rand::SystemRandom`).
pub struct SystemRandomSource {
    rng: SystemRandom,
}

impl SystemRandomSource {
    pub fn new() -> Self {
        Self {
            rng: SystemRandom::new(),
        }
    }
}

impl Default for SystemRandomSource {
    fn default() -> Self {
        Self::new()
    }
}

impl RandomSource for SystemRandomSource {
    fn fill(&self, buf: &mut [u8]) -> Result<(), CryptoError> {
        self.rng
            .fill(buf)
            .map_err(|_| CryptoError::RandomnessFailure)
    }
}

/// Produce `bytes` bytes of randomness, hex-encoded lowercase.
pub fn random_hex(rng: &dyn RandomSource, bytes: usize) -> Result<String, CryptoError> {
    let mut raw = vec![0u8; bytes];
    rng.fill(&mut raw)?;
    Ok(hex::encode(raw))
}

/// Fresh random master key: 32 bytes as 64 lowercase hex chars.
pub fn random_key_hex(rng: &dyn RandomSource) -> Result<String, CryptoError> {
    random_hex(rng, KEY_LEN)
}

fn key_bytes(key_hex: &str) -> Result<Vec<u8>, CryptoError> {
    hex::decode(key_hex).map_err(|_| CryptoError::BadKeyHex)
}

/// Keyed digest: HMAC-SHA-256 of `material` under the hex-encoded key,
/// hex-encoded lowercase. An empty `key_hex` uses a zero-length key.
pub fn digest(material: &[u8], key_hex: &str) -> Result<String, CryptoError> {
    let key = if key_hex.is_empty() {
        Vec::new()
    } else {
        key_bytes(key_hex)?
    };
    let key = hmac::Key::new(hmac::HMAC_SHA256, &key);
    let tag = hmac::sign(&key, material);
    Ok(hex::encode(tag.as_ref()))
}

/// Encrypt `plain` under AES-256-GCM with AAD = `salt`.
///
/// Output layout, base64-encoded:
/// ```text
/// [ iv (12 bytes) ][ tag (16 bytes) ][ ciphertext ]
/// ```
pub fn encrypt(
    plain: &str,
    key_hex: &str,
    salt: &str,
    rng: &dyn RandomSource,
) -> Result<String, CryptoError> {
    let unbound =
        UnboundKey::new(ALGORITHM, &key_bytes(key_hex)?).map_err(|_| CryptoError::InvalidKey)?;
    let key = LessSafeKey::new(unbound);

    let mut iv = [0u8; IV_LEN];
    rng.fill(&mut iv)?;
    let nonce = Nonce::assume_unique_for_key(iv);

    // seal_in_place_append_tag leaves ciphertext ‖ tag in the buffer;
    // the archive layout wants iv ‖ tag ‖ ciphertext.
    let mut buffer = plain.as_bytes().to_vec();
    key.seal_in_place_append_tag(nonce, Aad::from(salt.as_bytes()), &mut buffer)
        .map_err(|_| CryptoError::EncryptionFailure)?;
    let split = buffer.len() - TAG_LEN;

    let mut packed = Vec::with_capacity(IV_LEN + buffer.len());
    packed.extend_from_slice(&iv);
    packed.extend_from_slice(&buffer[split..]);
    packed.extend_from_slice(&buffer[..split]);
    Ok(BASE64.encode(packed))
}

/// Decrypt the output of [`encrypt`]. Fails authentication if the key is
/// wrong, the payload was tampered with, or the AAD differs.
pub fn decrypt(cipher_b64: &str, key_hex: &str, salt: &str) -> Result<String, CryptoError> {
    let packed = BASE64
        .decode(cipher_b64)
        .map_err(|_| CryptoError::BadBase64)?;
    if packed.len() < IV_LEN + TAG_LEN {
        return Err(CryptoError::CipherTooShort);
    }
    let iv: [u8; IV_LEN] = packed[..IV_LEN]
        .try_into()
        .map_err(|_| CryptoError::CipherTooShort)?;
    let tag = &packed[IV_LEN..IV_LEN + TAG_LEN];
    let body = &packed[IV_LEN + TAG_LEN..];

    let unbound =
        UnboundKey::new(ALGORITHM, &key_bytes(key_hex)?).map_err(|_| CryptoError::InvalidKey)?;
    let key = LessSafeKey::new(unbound);

    // open_in_place wants ciphertext ‖ tag.
    let mut buffer = Vec::with_capacity(body.len() + TAG_LEN);
    buffer.extend_from_slice(body);
    buffer.extend_from_slice(tag);

    let plain = key
        .open_in_place(
            Nonce::assume_unique_for_key(iv),
            Aad::from(salt.as_bytes()),
            &mut buffer,
        )
        .map_err(|_| CryptoError::Authentication)?;

    String::from_utf8(plain.to_vec()).map_err(|_| CryptoError::NotUtf8)
}
