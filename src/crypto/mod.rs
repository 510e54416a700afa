//! Encryption of secret settings at rest.
//!
//! Values in the `api_keys` settings category are sealed with AES-256-GCM.
//! Stored format: `ENC:` + base64(nonce || ciphertext || tag), nonce 12 bytes.
//! Rows written before a key was configured stay in plaintext and are read
//! back unchanged.

use aes_gcm::{
    aead::{Aead, KeyInit},
    Aes256Gcm, Nonce,
};
use anyhow::{Context, Result};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use ring::pbkdf2;
use std::num::NonZeroU32;

const KEY_LENGTH: usize = 32;

const NONCE_LENGTH: usize = 12;

const PBKDF2_ITERATIONS: u32 = 100_000;

const PBKDF2_SALT: &[u8] = b"picscribe-settings-encryption-v1";

/// Marks a stored value as ciphertext
pub const ENCRYPTED_PREFIX: &str = "ENC:";

pub type SecretKey = [u8; KEY_LENGTH];

/// Derive the AES-256 key from the configured passphrase.
pub fn derive_key(secret: &str) -> SecretKey {
    let mut key = [0u8; KEY_LENGTH];
    let iterations = NonZeroU32::new(PBKDF2_ITERATIONS).unwrap_or(NonZeroU32::MIN);
    pbkdf2::derive(
        pbkdf2::PBKDF2_HMAC_SHA256,
        iterations,
        PBKDF2_SALT,
        secret.as_bytes(),
        &mut key,
    );
    key
}

/// Key for a configured passphrase, `None` when unset or blank.
pub fn optional_key(secret: Option<&str>) -> Option<SecretKey> {
    secret.filter(|s| !s.trim().is_empty()).map(derive_key)
}

pub fn encrypt(plaintext: &str, key: &SecretKey) -> Result<String> {
    use rand::RngCore;

    let mut nonce_bytes = [0u8; NONCE_LENGTH];
    rand::rng().fill_bytes(&mut nonce_bytes);
    let nonce = Nonce::from_slice(&nonce_bytes);

    let cipher = Aes256Gcm::new_from_slice(key).context("Failed to create cipher")?;
    let ciphertext = cipher
        .encrypt(nonce, plaintext.as_bytes())
        .map_err(|e| anyhow::anyhow!("Encryption failed: {}", e))?;

    let mut combined = Vec::with_capacity(NONCE_LENGTH + ciphertext.len());
    combined.extend_from_slice(&nonce_bytes);
    combined.extend_from_slice(&ciphertext);

    Ok(format!("{}{}", ENCRYPTED_PREFIX, BASE64.encode(&combined)))
}

pub fn decrypt(ciphertext: &str, key: &SecretKey) -> Result<String> {
    let encoded = ciphertext
        .strip_prefix(ENCRYPTED_PREFIX)
        .context("Ciphertext doesn't have expected prefix")?;

    let combined = BASE64.decode(encoded).context("Failed to decode base64")?;
    if combined.len() < NONCE_LENGTH + 1 {
        anyhow::bail!("Ciphertext too short");
    }

    let (nonce_bytes, sealed) = combined.split_at(NONCE_LENGTH);
    let nonce = Nonce::from_slice(nonce_bytes);

    let cipher = Aes256Gcm::new_from_slice(key).context("Failed to create cipher")?;
    let plaintext = cipher
        .decrypt(nonce, sealed)
        .map_err(|e| anyhow::anyhow!("Decryption failed (wrong key or corrupted data): {}", e))?;

    String::from_utf8(plaintext).context("Decrypted data is not valid UTF-8")
}

pub fn is_encrypted(value: &str) -> bool {
    value.starts_with(ENCRYPTED_PREFIX)
}

/// Decrypt sealed values; plaintext passes through.
pub fn decrypt_if_encrypted(value: &str, key: Option<&SecretKey>) -> Result<String> {
    match (is_encrypted(value), key) {
        (true, Some(k)) => decrypt(value, k),
        (true, None) => anyhow::bail!("Value is encrypted but no encryption key is configured"),
        (false, _) => Ok(value.to_string()),
    }
}

/// Seal the value when a key is configured, otherwise store as-is.
pub fn encrypt_if_key_available(value: &str, key: Option<&SecretKey>) -> Result<String> {
    match key {
        Some(k) => encrypt(value, k),
        None => Ok(value.to_string()),
    }
}

/// Render a secret for display: `****` plus the last four characters.
pub fn mask_secret(value: &str) -> String {
    let chars: Vec<char> = value.chars().collect();
    if chars.len() <= 4 {
        return "****".to_string();
    }
    let tail: String = chars[chars.len() - 4..].iter().collect();
    format!("****{}", tail)
}
