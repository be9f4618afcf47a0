//! Fernet-compatible token encryption.
//!
//! The on-disk blob is a single Fernet token so the store stays compatible
//! with standard Fernet tooling:
//!
//! `0x80 || timestamp(8, big-endian secs) || IV(16) || AES-128-CBC(PKCS7) || HMAC-SHA256(32)`
//!
//! with the whole token base64url-encoded (no padding). The 32-byte master
//! key splits into a 16-byte signing key (first half) and a 16-byte
//! encryption key (second half).

use aes::cipher::{block_padding::Pkcs7, BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use hmac::{Hmac, Mac};
use rand::RngCore;
use sha2::Sha256;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::KeystoreError;

type Aes128CbcEnc = cbc::Encryptor<aes::Aes128>;
type Aes128CbcDec = cbc::Decryptor<aes::Aes128>;
type HmacSha256 = Hmac<Sha256>;

const VERSION: u8 = 0x80;

/// Minimum decoded token: version(1) + timestamp(8) + IV(16) + one cipher
/// block(16) + HMAC(32).
const MIN_TOKEN_LEN: usize = 73;

const HMAC_LEN: usize = 32;
const IV_LEN: usize = 16;

fn split_key(master_key: &[u8; 32]) -> (&[u8], [u8; 16]) {
    let signing_key = &master_key[..16];
    let mut encryption_key = [0u8; 16];
    encryption_key.copy_from_slice(&master_key[16..]);
    (signing_key, encryption_key)
}

fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Encrypt `plaintext` into a base64url-encoded Fernet token.
pub fn encrypt(master_key: &[u8; 32], plaintext: &[u8]) -> Result<String, KeystoreError> {
    let (signing_key, encryption_key) = split_key(master_key);

    let mut iv = [0u8; IV_LEN];
    rand::thread_rng().fill_bytes(&mut iv);

    let cipher = Aes128CbcEnc::new_from_slices(&encryption_key, &iv)
        .map_err(|_| KeystoreError::Crypto("invalid AES key or IV length".into()))?;
    let ciphertext = cipher.encrypt_padded_vec_mut::<Pkcs7>(plaintext);

    let mut token = Vec::with_capacity(1 + 8 + IV_LEN + ciphertext.len() + HMAC_LEN);
    token.push(VERSION);
    token.extend_from_slice(&now_secs().to_be_bytes());
    token.extend_from_slice(&iv);
    token.extend_from_slice(&ciphertext);

    let mut mac = HmacSha256::new_from_slice(signing_key)
        .map_err(|_| KeystoreError::Crypto("invalid HMAC key length".into()))?;
    mac.update(&token);
    token.extend_from_slice(&mac.finalize().into_bytes());

    Ok(URL_SAFE_NO_PAD.encode(token))
}

/// Decrypt a base64url-encoded Fernet token.
///
/// The HMAC is verified (constant time) before any decryption happens; a
/// mismatch is a hard authentication failure. A timestamp in the future is
/// logged but accepted; there is no TTL enforcement.
pub fn decrypt(master_key: &[u8; 32], encoded: &[u8]) -> Result<Vec<u8>, KeystoreError> {
    let token = URL_SAFE_NO_PAD
        .decode(encoded)
        .map_err(|_| KeystoreError::Crypto("token is not valid base64url".into()))?;

    if token.len() < MIN_TOKEN_LEN {
        return Err(KeystoreError::Crypto(format!(
            "token too short: {} bytes",
            token.len()
        )));
    }
    if token[0] != VERSION {
        return Err(KeystoreError::Crypto(format!(
            "unsupported token version: {:#04x}",
            token[0]
        )));
    }

    let (signing_key, encryption_key) = split_key(master_key);

    let (signed, received_hmac) = token.split_at(token.len() - HMAC_LEN);
    let mut mac = HmacSha256::new_from_slice(signing_key)
        .map_err(|_| KeystoreError::Crypto("invalid HMAC key length".into()))?;
    mac.update(signed);
    mac.verify_slice(received_hmac)
        .map_err(|_| KeystoreError::AuthenticationFailed)?;

    let mut timestamp_bytes = [0u8; 8];
    timestamp_bytes.copy_from_slice(&token[1..9]);
    let timestamp = u64::from_be_bytes(timestamp_bytes);
    if timestamp > now_secs() {
        tracing::warn!(timestamp, "keystore token timestamp is in the future");
    }

    let iv = &token[9..9 + IV_LEN];
    let ciphertext = &signed[9 + IV_LEN..];

    let cipher = Aes128CbcDec::new_from_slices(&encryption_key, iv)
        .map_err(|_| KeystoreError::Crypto("invalid AES key or IV length".into()))?;
    cipher
        .decrypt_padded_vec_mut::<Pkcs7>(ciphertext)
        .map_err(|_| KeystoreError::Crypto("bad PKCS7 padding".into()))
}
