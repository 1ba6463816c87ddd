//! AI credential vault
//!
//! Stores per-user upstream API configuration either session-only (plaintext
//! in memory, 1 h TTL) or durable (AES-256-GCM blob, key derived from
//! `AI_ENCRYPTION_KEY` via scrypt). Durable blobs use the wire form
//! `encrypted:<iv-hex>:<tag-hex>:<ct-hex>` with a fresh 16-byte IV per
//! write. On a read miss the vault falls back to the external settings
//! store (category `ai-config`) and promotes the blob into memory.
//!
//! The stored key never leaves this module unmasked except through
//! [`CredentialVault::get_config`] for the owning user.

use std::sync::Arc;
use std::time::{Duration, Instant};

use aes_gcm::aead::consts::U16;
use aes_gcm::aead::generic_array::GenericArray;
use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::aes::Aes256;
use aes_gcm::AesGcm;
use dashmap::DashMap;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};
use zeroize::Zeroizing;

/// AES-256-GCM with the 16-byte IV the wire format prescribes
type Aes256Gcm16 = AesGcm<Aes256, U16>;

/// Marker prefix of encrypted blobs
const ENCRYPTED_PREFIX: &str = "encrypted:";

/// scrypt salt; fixed so the key is stable across restarts
const KDF_SALT: &[u8] = b"easyssh-salt";

/// Session-scope entries expire after this long
const SESSION_TTL: Duration = Duration::from_secs(3600);

/// IV and GCM tag sizes in bytes
const IV_LEN: usize = 16;
const TAG_LEN: usize = 16;

/// Settings-store category the durable blob falls back to
const SETTINGS_CATEGORY: &str = "ai-config";

#[derive(Debug, Error)]
pub enum VaultError {
    #[error("Vault key not configured (AI_ENCRYPTION_KEY missing)")]
    NoKey,

    #[error("Malformed encrypted payload")]
    MalformedPayload,

    #[error("Legacy unencrypted payload rejected")]
    LegacyPayload,

    #[error("Decryption failed")]
    DecryptionFailed,

    #[error("Encryption failed")]
    EncryptionFailed,

    #[error("Serialization error: {0}")]
    Serialization(String),
}

/// Upstream endpoint configuration for one user.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ApiConfig {
    pub provider: String,
    pub base_url: String,
    pub model: String,
    #[serde(default = "default_temperature")]
    pub temperature: f64,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    /// Upstream timeout in seconds
    #[serde(default = "default_timeout")]
    pub timeout: u64,
    pub api_key: String,
    #[serde(default)]
    pub created_at: i64,
    #[serde(default)]
    pub updated_at: i64,
}

fn default_temperature() -> f64 {
    0.7
}

fn default_max_tokens() -> u32 {
    2048
}

fn default_timeout() -> u64 {
    30
}

impl ApiConfig {
    /// Copy with the API key masked; the only form that may cross the wire
    /// for display purposes.
    pub fn masked(&self) -> Self {
        Self {
            api_key: mask_key(&self.api_key),
            ..self.clone()
        }
    }
}

/// External settings store the vault falls back to on a read miss.
///
/// The real implementation lives with the CRUD layer; the server wires an
/// in-memory one in by default.
pub trait SettingsStore: Send + Sync {
    /// Load the persisted JSON blob for `(user_id, category)`.
    fn load(&self, user_id: &str, category: &str) -> Option<String>;

    /// Persist a JSON blob for `(user_id, category)`.
    fn save(&self, user_id: &str, category: &str, blob: &str);
}

/// Settings store backed by a process-local map.
#[derive(Default)]
pub struct MemorySettingsStore {
    entries: DashMap<(String, String), String>,
}

impl SettingsStore for MemorySettingsStore {
    fn load(&self, user_id: &str, category: &str) -> Option<String> {
        self.entries
            .get(&(user_id.to_string(), category.to_string()))
            .map(|e| e.value().clone())
    }

    fn save(&self, user_id: &str, category: &str, blob: &str) {
        self.entries.insert(
            (user_id.to_string(), category.to_string()),
            blob.to_string(),
        );
    }
}

/// Symmetric cipher over the `encrypted:<iv>:<tag>:<ct>` wire form.
///
/// Shared by the AI vault (keyed from `AI_ENCRYPTION_KEY`) and the SSH
/// credential pass-through (keyed from `ENCRYPTION_KEY`): blobs the
/// external CRUD stored encrypted are decrypted just-in-time with the same
/// format.
pub struct SecretCipher {
    key: Zeroizing<[u8; 32]>,
}

impl SecretCipher {
    pub fn new(material: &str) -> Self {
        Self {
            key: derive_key(material),
        }
    }

    /// Encrypt bytes into `encrypted:<iv>:<tag>:<ct>`.
    pub fn encrypt(&self, plaintext: &[u8]) -> Result<String, VaultError> {
        let cipher =
            Aes256Gcm16::new_from_slice(&*self.key).map_err(|_| VaultError::EncryptionFailed)?;

        let mut iv = [0u8; IV_LEN];
        rand::rngs::OsRng.fill_bytes(&mut iv);
        let nonce = GenericArray::from_slice(&iv);

        // aes-gcm appends the 16-byte tag to the ciphertext
        let mut ciphertext = cipher
            .encrypt(nonce, plaintext)
            .map_err(|_| VaultError::EncryptionFailed)?;
        if ciphertext.len() < TAG_LEN {
            return Err(VaultError::EncryptionFailed);
        }
        let tag = ciphertext.split_off(ciphertext.len() - TAG_LEN);

        Ok(format!(
            "{}{}:{}:{}",
            ENCRYPTED_PREFIX,
            hex::encode(iv),
            hex::encode(tag),
            hex::encode(ciphertext)
        ))
    }

    /// Decrypt an `encrypted:<iv>:<tag>:<ct>` blob. Anything without the
    /// prefix is a legacy value and is rejected rather than guessed at.
    pub fn decrypt(&self, blob: &str) -> Result<Zeroizing<Vec<u8>>, VaultError> {
        let Some(rest) = blob.strip_prefix(ENCRYPTED_PREFIX) else {
            return Err(VaultError::LegacyPayload);
        };

        let mut parts = rest.splitn(3, ':');
        let iv = parts
            .next()
            .and_then(|p| hex::decode(p).ok())
            .ok_or(VaultError::MalformedPayload)?;
        let tag = parts
            .next()
            .and_then(|p| hex::decode(p).ok())
            .ok_or(VaultError::MalformedPayload)?;
        let ciphertext = parts
            .next()
            .and_then(|p| hex::decode(p).ok())
            .ok_or(VaultError::MalformedPayload)?;

        if iv.len() != IV_LEN || tag.len() != TAG_LEN {
            return Err(VaultError::MalformedPayload);
        }

        let cipher =
            Aes256Gcm16::new_from_slice(&*self.key).map_err(|_| VaultError::DecryptionFailed)?;
        let nonce = GenericArray::from_slice(&iv);

        let mut combined = ciphertext;
        combined.extend_from_slice(&tag);

        cipher
            .decrypt(nonce, combined.as_ref())
            .map(Zeroizing::new)
            .map_err(|_| VaultError::DecryptionFailed)
    }
}

struct SessionEntry {
    config: ApiConfig,
    expires_at: Instant,
}

pub struct CredentialVault {
    /// Cipher over the derived AES key; absent when AI_ENCRYPTION_KEY is
    /// not set
    cipher: Option<SecretCipher>,
    /// `ai_api_config:<userId>` -> session-scope plaintext entry
    session_cache: DashMap<String, SessionEntry>,
    /// `ai_api_config:<userId>` -> encrypted blob
    durable_cache: DashMap<String, String>,
    settings: Arc<dyn SettingsStore>,
}

impl CredentialVault {
    pub fn new(key_material: Option<&str>, settings: Arc<dyn SettingsStore>) -> Self {
        let cipher = key_material
            .filter(|material| !material.is_empty())
            .map(SecretCipher::new);
        if cipher.is_none() {
            warn!("AI vault running without an encryption key; durable storage disabled");
        }
        Self {
            cipher,
            session_cache: DashMap::new(),
            durable_cache: DashMap::new(),
            settings,
        }
    }

    fn cache_key(user_id: &str) -> String {
        format!("ai_api_config:{}", user_id)
    }

    /// Whether a stored value is in the encrypted wire form.
    pub fn is_encrypted_data(value: &str) -> bool {
        value.starts_with(ENCRYPTED_PREFIX)
    }

    /// Store a config for the session only (plaintext in memory, 1 h TTL).
    pub fn store_session(&self, user_id: &str, config: ApiConfig) {
        debug!(
            "Session AI config stored for user {} (key {})",
            user_id,
            mask_key(&config.api_key)
        );
        self.session_cache.insert(
            Self::cache_key(user_id),
            SessionEntry {
                config,
                expires_at: Instant::now() + SESSION_TTL,
            },
        );
    }

    /// Store a config durably: encrypted in memory and mirrored to the
    /// external settings store.
    pub fn store_durable(&self, user_id: &str, config: &ApiConfig) -> Result<(), VaultError> {
        let blob = self.encrypt_config(config)?;
        self.settings.save(user_id, SETTINGS_CATEGORY, &blob);
        self.durable_cache.insert(Self::cache_key(user_id), blob);
        info!(
            "Durable AI config stored for user {} (key {})",
            user_id,
            mask_key(&config.api_key)
        );
        Ok(())
    }

    /// Fetch the config for a user: session cache, then durable cache, then
    /// the settings-store fallback (promoted into the durable cache).
    pub fn get_config(&self, user_id: &str) -> Result<Option<ApiConfig>, VaultError> {
        let key = Self::cache_key(user_id);

        if let Some(entry) = self.session_cache.get(&key) {
            if entry.expires_at > Instant::now() {
                return Ok(Some(entry.config.clone()));
            }
            drop(entry);
            self.session_cache.remove(&key);
        }

        if let Some(blob) = self.durable_cache.get(&key) {
            return self.decrypt_config(blob.value()).map(Some);
        }

        if let Some(blob) = self.settings.load(user_id, SETTINGS_CATEGORY) {
            let config = self.decrypt_config(&blob)?;
            debug!("AI config for user {} promoted from settings store", user_id);
            self.durable_cache.insert(key, blob);
            return Ok(Some(config));
        }

        Ok(None)
    }

    /// Drop every stored config for a user.
    pub fn clear(&self, user_id: &str) {
        let key = Self::cache_key(user_id);
        self.session_cache.remove(&key);
        self.durable_cache.remove(&key);
    }

    fn encrypt_config(&self, config: &ApiConfig) -> Result<String, VaultError> {
        let json = serde_json::to_string(config)
            .map_err(|e| VaultError::Serialization(e.to_string()))?;
        self.encrypt(json.as_bytes())
    }

    fn decrypt_config(&self, blob: &str) -> Result<ApiConfig, VaultError> {
        let plaintext = self.decrypt(blob)?;
        serde_json::from_slice(&plaintext).map_err(|e| VaultError::Serialization(e.to_string()))
    }

    /// Encrypt bytes into `encrypted:<iv>:<tag>:<ct>`.
    pub fn encrypt(&self, plaintext: &[u8]) -> Result<String, VaultError> {
        self.cipher
            .as_ref()
            .ok_or(VaultError::NoKey)?
            .encrypt(plaintext)
    }

    /// Decrypt an `encrypted:<iv>:<tag>:<ct>` blob.
    pub fn decrypt(&self, blob: &str) -> Result<Zeroizing<Vec<u8>>, VaultError> {
        self.cipher.as_ref().ok_or(VaultError::NoKey)?.decrypt(blob)
    }
}

/// Derive the 32-byte AES key from the configured material.
fn derive_key(material: &str) -> Zeroizing<[u8; 32]> {
    let params = scrypt::Params::new(14, 8, 1, 32).expect("scrypt params");
    let mut key = Zeroizing::new([0u8; 32]);
    scrypt::scrypt(material.as_bytes(), KDF_SALT, &params, &mut *key)
        .expect("scrypt output length");
    key
}

/// Mask an API key for logs: first 4 + at least 4 stars + last 4.
pub fn mask_key(key: &str) -> String {
    if key.len() <= 8 {
        return "*".repeat(key.len().max(4));
    }
    format!(
        "{}{}{}",
        &key[..4],
        "*".repeat((key.len() - 8).max(4)),
        &key[key.len() - 4..]
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vault_with_key(material: &str) -> CredentialVault {
        CredentialVault::new(Some(material), Arc::new(MemorySettingsStore::default()))
    }

    fn config() -> ApiConfig {
        ApiConfig {
            provider: "openai".into(),
            base_url: "https://api.openai.com".into(),
            model: "gpt-4o-mini".into(),
            temperature: 0.7,
            max_tokens: 2048,
            timeout: 30,
            api_key: "sk-abcdefghijklmnop".into(),
            created_at: 0,
            updated_at: 0,
        }
    }

    #[test]
    fn encrypt_decrypt_roundtrip() {
        let vault = vault_with_key("test-master-key");
        let blob = vault.encrypt(b"hello world").unwrap();
        assert!(blob.starts_with("encrypted:"));
        assert_eq!(blob.split(':').count(), 4);
        let plaintext = vault.decrypt(&blob).unwrap();
        assert_eq!(&*plaintext, b"hello world");
    }

    #[test]
    fn wrong_key_fails_auth() {
        let vault1 = vault_with_key("key-one");
        let vault2 = vault_with_key("key-two");
        let blob = vault1.encrypt(b"secret").unwrap();
        assert!(matches!(
            vault2.decrypt(&blob),
            Err(VaultError::DecryptionFailed)
        ));
    }

    #[test]
    fn tampered_blob_fails_auth() {
        let vault = vault_with_key("key");
        let blob = vault.encrypt(b"secret").unwrap();
        let mut tampered = blob.clone().into_bytes();
        let last = tampered.len() - 1;
        tampered[last] = if tampered[last] == b'0' { b'1' } else { b'0' };
        let tampered = String::from_utf8(tampered).unwrap();
        assert!(vault.decrypt(&tampered).is_err());
    }

    #[test]
    fn legacy_blob_rejected() {
        let vault = vault_with_key("key");
        assert!(matches!(
            vault.decrypt("plaintext-api-key"),
            Err(VaultError::LegacyPayload)
        ));
    }

    #[test]
    fn durable_store_and_fetch() {
        let vault = vault_with_key("key");
        vault.store_durable("user-1", &config()).unwrap();
        let fetched = vault.get_config("user-1").unwrap().unwrap();
        assert_eq!(fetched, config());
        assert!(vault.get_config("user-2").unwrap().is_none());
    }

    #[test]
    fn settings_store_fallback_promotes() {
        let settings = Arc::new(MemorySettingsStore::default());
        let writer = CredentialVault::new(Some("key"), settings.clone());
        writer.store_durable("user-1", &config()).unwrap();

        // A fresh vault with an empty in-memory cache but the same backing
        // store picks the blob up and promotes it.
        let reader = CredentialVault::new(Some("key"), settings);
        reader.durable_cache.clear();
        let fetched = reader.get_config("user-1").unwrap().unwrap();
        assert_eq!(fetched.api_key, config().api_key);
        assert!(reader.durable_cache.contains_key("ai_api_config:user-1"));
    }

    #[test]
    fn session_scope_is_plaintext_and_expires() {
        let vault = CredentialVault::new(None, Arc::new(MemorySettingsStore::default()));
        vault.store_session("user-1", config());
        assert!(vault.get_config("user-1").unwrap().is_some());

        // Force-expire
        vault
            .session_cache
            .get_mut("ai_api_config:user-1")
            .unwrap()
            .expires_at = Instant::now() - Duration::from_secs(1);
        assert!(vault.get_config("user-1").unwrap().is_none());
    }

    #[test]
    fn no_key_means_no_durable_storage() {
        let vault = CredentialVault::new(None, Arc::new(MemorySettingsStore::default()));
        assert!(matches!(
            vault.store_durable("user-1", &config()),
            Err(VaultError::NoKey)
        ));
    }

    #[test]
    fn key_masking() {
        assert_eq!(mask_key("sk-abcdefghij"), "sk-a*****ghij");
        assert_eq!(mask_key("sk-abcdefghijklmnopqrstuvwx"), format!("sk-a{}uvwx", "*".repeat(18)));
        assert_eq!(mask_key("short"), "*****");
        assert_eq!(mask_key(""), "****");
        assert_eq!(mask_key("123456789"), "1234****6789");
    }

    #[test]
    fn masked_config_hides_key() {
        let masked = config().masked();
        assert!(!masked.api_key.contains("bcdefghijklm"));
        assert!(masked.api_key.starts_with("sk-a"));
        assert_eq!(masked.model, config().model);
    }

    #[test]
    fn secret_cipher_is_shared_format() {
        let cipher = SecretCipher::new("ssh-credential-key");
        let blob = cipher.encrypt(b"hunter2").unwrap();
        assert!(CredentialVault::is_encrypted_data(&blob));
        assert_eq!(&*cipher.decrypt(&blob).unwrap(), b"hunter2");
    }

    #[test]
    fn encrypted_prefix_detection() {
        assert!(CredentialVault::is_encrypted_data("encrypted:aa:bb:cc"));
        assert!(!CredentialVault::is_encrypted_data("sk-plaintext"));
    }
}
