//! # Crypto Module
//!
//! Authenticated symmetric encryption for rows persisted by the direct-flush
//! path and for individual string-shaped column values.
//!
//! ## Design Overview
//!
//! A 32-byte master key is derived from four build-time key parts via
//! PBKDF2-HMAC-SHA256 (fixed salt, 100 000 iterations). The first half signs,
//! the second half encrypts. Tokens use single-token framing compatible with
//! the fernet scheme:
//!
//! ```text
//! token = base64url( [0x80][timestamp u64 BE][iv 16B][AES-128-CBC ciphertext][HMAC-SHA256 32B] )
//! ```
//!
//! The HMAC covers everything before it, so any bit flip in the version,
//! timestamp, IV, or ciphertext is detected before decryption.
//!
//! ## Integrity failures
//!
//! A token that fails HMAC verification (or is structurally malformed)
//! surfaces [`CryptoError::Integrity`]. Legacy deployments that stored
//! opaque blobs alongside encrypted rows can opt into
//! [`CryptoManager::with_opaque_passthrough`], which returns the input
//! unchanged instead of failing; new code should leave it off.
//!
//! ## Key injection
//!
//! [`KeyMaterial`] is injectable at construction so embedding applications
//! can supply their own secret and tests can run with a deterministic key.

// ------------------------------------------------------------------------------------------------
// Unit tests
// ------------------------------------------------------------------------------------------------


// ------------------------------------------------------------------------------------------------
// Includes
// ------------------------------------------------------------------------------------------------

use std::time::{SystemTime, UNIX_EPOCH};

use aes::cipher::{BlockDecryptMut, BlockEncryptMut, KeyIvInit, block_padding::Pkcs7};
use base64::{Engine as _, engine::general_purpose::URL_SAFE};
use hmac::{Hmac, Mac};
use rand::RngCore;
use sha2::Sha256;
use thiserror::Error;
use tracing::warn;

use crate::schema::{Row, Value, row_from_json, row_to_json};

type Aes128CbcEnc = cbc::Encryptor<aes::Aes128>;
type Aes128CbcDec = cbc::Decryptor<aes::Aes128>;
type HmacSha256 = Hmac<Sha256>;

// ------------------------------------------------------------------------------------------------
// Constants
// ------------------------------------------------------------------------------------------------

const TOKEN_VERSION: u8 = 0x80;
const IV_LEN: usize = 16;
const MAC_LEN: usize = 32;
/// version + timestamp + IV.
const HEADER_LEN: usize = 1 + 8 + IV_LEN;

const KEY_PART_A: &[u8] = &[0x43, 0x6f, 0x6c, 0x64, 0x62, 0x52, 0x6f, 0x77];
const KEY_PART_B: &[u8] = &[0x53, 0x74, 0x6f, 0x72, 0x65, 0x4b, 0x65, 0x79];
const KEY_PART_C: &[u8] = &[0x50, 0x61, 0x72, 0x74, 0x43, 0x78, 0x39, 0x21];
const KEY_PART_D: &[u8] = &[0x40, 0x32, 0x30, 0x32, 0x35, 0x2b, 0x76, 0x33];

const DEFAULT_SALT: &[u8] = b"coldb_segment_salt_v3";
const DEFAULT_ITERATIONS: u32 = 100_000;

// ------------------------------------------------------------------------------------------------
// Error Types
// ------------------------------------------------------------------------------------------------

/// Errors returned by encrypt/decrypt operations.
#[derive(Debug, Error)]
pub enum CryptoError {
    /// Token failed HMAC verification or is structurally malformed.
    #[error("Integrity failure: {0}")]
    Integrity(String),

    /// Decrypted payload is not the JSON object a row must be.
    #[error("Decrypted payload is not a row: {0}")]
    Payload(#[from] serde_json::Error),
}

// ------------------------------------------------------------------------------------------------
// Key material
// ------------------------------------------------------------------------------------------------

/// Inputs to key derivation. Injectable so embedders control the secret and
/// tests can pin a deterministic key.
#[derive(Debug, Clone)]
pub struct KeyMaterial {
    pub parts: [Vec<u8>; 4],
    pub salt: Vec<u8>,
    pub iterations: u32,
}

impl Default for KeyMaterial {
    fn default() -> Self {
        Self {
            parts: [
                KEY_PART_A.to_vec(),
                KEY_PART_B.to_vec(),
                KEY_PART_C.to_vec(),
                KEY_PART_D.to_vec(),
            ],
            salt: DEFAULT_SALT.to_vec(),
            iterations: DEFAULT_ITERATIONS,
        }
    }
}

impl KeyMaterial {
    /// Stretches the concatenated parts into the 32-byte master key.
    fn derive(&self) -> [u8; 32] {
        let combined: Vec<u8> = self.parts.iter().flatten().copied().collect();
        let mut key = [0u8; 32];
        pbkdf2::pbkdf2_hmac::<Sha256>(&combined, &self.salt, self.iterations, &mut key);
        key
    }

    /// The derived key in its base64url transport form.
    pub fn key_string(&self) -> String {
        URL_SAFE.encode(self.derive())
    }
}

// ------------------------------------------------------------------------------------------------
// CryptoManager
// ------------------------------------------------------------------------------------------------

/// Encrypts and decrypts whole rows and individual column values.
///
/// Cheap to clone; all state is a pair of 16-byte keys plus two flags.
#[derive(Debug, Clone)]
pub struct CryptoManager {
    signing_key: [u8; 16],
    encryption_key: [u8; 16],
    enabled: bool,
    opaque_passthrough: bool,
}

impl Default for CryptoManager {
    fn default() -> Self {
        Self::new(&KeyMaterial::default())
    }
}

impl CryptoManager {
    pub fn new(material: &KeyMaterial) -> Self {
        let key = material.derive();
        let mut signing_key = [0u8; 16];
        let mut encryption_key = [0u8; 16];
        signing_key.copy_from_slice(&key[..16]);
        encryption_key.copy_from_slice(&key[16..]);
        Self {
            signing_key,
            encryption_key,
            enabled: true,
            opaque_passthrough: false,
        }
    }

    /// Opts into the legacy behavior of returning undecryptable input
    /// unchanged instead of surfacing [`CryptoError::Integrity`]. Meant for
    /// migration reads only.
    pub fn with_opaque_passthrough(mut self, enabled: bool) -> Self {
        self.opaque_passthrough = enabled;
        self
    }

    /// Disables encryption entirely; payloads pass through as plaintext.
    pub fn with_encryption_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    pub fn enabled(&self) -> bool {
        self.enabled
    }

    /// Encrypts raw bytes into an ASCII token.
    pub fn encrypt(&self, plaintext: &[u8]) -> Vec<u8> {
        if !self.enabled {
            return plaintext.to_vec();
        }
        let mut iv = [0u8; IV_LEN];
        rand::rng().fill_bytes(&mut iv);
        let timestamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);

        let ciphertext = Aes128CbcEnc::new(&self.encryption_key.into(), &iv.into())
            .encrypt_padded_vec_mut::<Pkcs7>(plaintext);

        let mut token = Vec::with_capacity(HEADER_LEN + ciphertext.len() + MAC_LEN);
        token.push(TOKEN_VERSION);
        token.extend_from_slice(&timestamp.to_be_bytes());
        token.extend_from_slice(&iv);
        token.extend_from_slice(&ciphertext);

        let mut mac = <HmacSha256 as Mac>::new_from_slice(&self.signing_key)
            .expect("HMAC accepts any key length");
        mac.update(&token);
        token.extend_from_slice(&mac.finalize().into_bytes());

        URL_SAFE.encode(token).into_bytes()
    }

    /// Decrypts a token produced by [`CryptoManager::encrypt`].
    pub fn decrypt(&self, token: &[u8]) -> Result<Vec<u8>, CryptoError> {
        if !self.enabled {
            return Ok(token.to_vec());
        }
        match self.decrypt_inner(token) {
            Ok(plain) => Ok(plain),
            Err(err) if self.opaque_passthrough => {
                warn!("Returning opaque payload after failed decryption: {err}");
                Ok(token.to_vec())
            }
            Err(err) => Err(err),
        }
    }

    fn decrypt_inner(&self, token: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let raw = URL_SAFE
            .decode(token)
            .map_err(|_| CryptoError::Integrity("token is not valid base64".into()))?;
        if raw.len() < HEADER_LEN + MAC_LEN {
            return Err(CryptoError::Integrity("token too short".into()));
        }
        if raw[0] != TOKEN_VERSION {
            return Err(CryptoError::Integrity(format!(
                "unsupported token version {:#04x}",
                raw[0]
            )));
        }

        let (signed, stored_mac) = raw.split_at(raw.len() - MAC_LEN);
        let mut mac = <HmacSha256 as Mac>::new_from_slice(&self.signing_key)
            .expect("HMAC accepts any key length");
        mac.update(signed);
        mac.verify_slice(stored_mac)
            .map_err(|_| CryptoError::Integrity("HMAC mismatch".into()))?;

        let iv: [u8; IV_LEN] = signed[9..HEADER_LEN].try_into().unwrap();
        let ciphertext = &signed[HEADER_LEN..];
        Aes128CbcDec::new(&self.encryption_key.into(), &iv.into())
            .decrypt_padded_vec_mut::<Pkcs7>(ciphertext)
            .map_err(|_| CryptoError::Integrity("bad block padding".into()))
    }

    /// Encrypts a row into a token over its JSON representation.
    pub fn encrypt_row(&self, row: &Row) -> Vec<u8> {
        let json = row_to_json(row).to_string();
        self.encrypt(json.as_bytes())
    }

    /// Inverse of [`CryptoManager::encrypt_row`].
    pub fn decrypt_row(&self, token: &[u8]) -> Result<Row, CryptoError> {
        let plain = self.decrypt(token)?;
        let json: serde_json::Value = serde_json::from_slice(&plain)?;
        Ok(row_from_json(&json))
    }

    /// Encrypts one value into a string-shaped column cell.
    pub fn encrypt_value(&self, value: &Value) -> Value {
        let json = value.to_json().to_string();
        let token = self.encrypt(json.as_bytes());
        Value::Str(String::from_utf8_lossy(&token).into_owned())
    }

    /// Inverse of [`CryptoManager::encrypt_value`].
    pub fn decrypt_value(&self, value: &Value) -> Result<Value, CryptoError> {
        let Value::Str(token) = value else {
            return Ok(value.clone());
        };
        let plain = self.decrypt(token.as_bytes())?;
        let json: serde_json::Value = serde_json::from_slice(&plain)?;
        Ok(Value::from_json_untyped(&json))
    }
}
