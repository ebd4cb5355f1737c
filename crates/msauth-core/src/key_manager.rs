//! Where the record key lives: the OS keyring when available, otherwise
//! derived from a passphrase with Argon2id.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use argon2::{Algorithm, Argon2, Params, Version};
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::fs;
use tracing::{debug, warn};
use zeroize::Zeroizing;

use crate::crypto::{self, RecordKey, SealedRecord, fill_random};
use crate::errors::{MsAuthError, Result};
use crate::secret::SecretProvider;

const META_FILE: &str = "meta.json";
const META_VERSION: u32 = 1;
const SALT_LEN: usize = 16;
/// Associated data of the key check; account keys never contain `!`
const KEY_CHECK_CONTEXT: &str = "!key-check";
const KEY_CHECK_PLAINTEXT: &[u8] = b"msauth record key";
#[cfg(feature = "keyring-support")]
const KEYRING_SERVICE: &str = "msauth";

/// Argon2id cost parameters, persisted so the key can be derived again
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct KdfParams {
    pub memory_kib: u32,
    pub iterations: u32,
    pub parallelism: u32,
}

impl Default for KdfParams {
    fn default() -> Self {
        Self {
            memory_kib: 64 * 1024,
            iterations: 3,
            parallelism: 1,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KeySource {
    Keyring,
    Passphrase,
}

/// Contents of `meta.json`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreMeta {
    pub version: u32,
    pub created_at: DateTime<Utc>,
    pub key_source: KeySource,
    /// Base64 Argon2id salt, present for passphrase-derived keys
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub salt: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kdf: Option<KdfParams>,
    /// A fixed plaintext sealed under the record key
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key_check: Option<SealedRecord>,
}

#[derive(Debug, Clone)]
pub struct KeyOptions {
    /// Try the OS keyring before falling back to a passphrase
    pub use_keyring: bool,
    /// Cost for newly derived keys; existing stores keep theirs
    pub kdf: KdfParams,
}

impl Default for KeyOptions {
    fn default() -> Self {
        Self {
            use_keyring: cfg!(feature = "keyring-support"),
            kdf: KdfParams::default(),
        }
    }
}

/// Owns the record key of one store directory
pub struct KeyManager {
    dir: PathBuf,
    meta: StoreMeta,
    key: RecordKey,
    options: KeyOptions,
    secrets: Arc<dyn SecretProvider>,
}

impl KeyManager {
    /// Load the key for `dir`, creating one on first use
    pub async fn open(dir: &Path, secrets: Arc<dyn SecretProvider>, options: KeyOptions) -> Result<Self> {
        let meta_path = dir.join(META_FILE);
        let existing = match fs::read(&meta_path).await {
            Ok(bytes) => Some(serde_json::from_slice::<StoreMeta>(&bytes).map_err(|e| {
                warn!("Unreadable {}: {}", META_FILE, e);
                MsAuthError::CorruptedStore
            })?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
            Err(e) => return Err(e.into()),
        };

        let (meta, key) = match existing {
            Some(mut meta) => {
                let key = match meta.key_source {
                    KeySource::Keyring => keyring_load(dir)?,
                    KeySource::Passphrase => derive_from_meta(&meta, secrets.as_ref()).await?,
                };
                match &meta.key_check {
                    Some(check) => verify_key_check(check, &key)?,
                    None => {
                        meta.key_check = Some(seal_key_check(&key)?);
                        write_meta(dir, &meta).await?;
                        debug!("Added a key check to {}", META_FILE);
                    }
                }
                debug!(source = ?meta.key_source, "Loaded record key");
                (meta, key)
            }
            None => {
                let (meta, key) = create_key(dir, &options, secrets.as_ref()).await?;
                write_meta(dir, &meta).await?;
                debug!(source = ?meta.key_source, "Created record key");
                (meta, key)
            }
        };

        Ok(Self {
            dir: dir.to_path_buf(),
            meta,
            key,
            options,
            secrets,
        })
    }

    pub fn key(&self) -> &RecordKey {
        &self.key
    }

    pub fn meta(&self) -> &StoreMeta {
        &self.meta
    }

    /// Make a fresh key from the same source without persisting anything
    pub(crate) async fn prepare_rotation(&self) -> Result<(StoreMeta, RecordKey)> {
        generate_key(self.meta.key_source, &self.options, self.secrets.as_ref()).await
    }

    /// Persist a key from [`Self::prepare_rotation`] and switch to it.
    ///
    /// On failure the current key stays in effect, in the keyring too.
    pub(crate) async fn commit_rotation(&mut self, meta: StoreMeta, key: RecordKey) -> Result<()> {
        let result = persist_key(&self.dir, &meta, &key).await;
        if let Err(e) = &result
            && meta.key_source == KeySource::Keyring
        {
            warn!("Key rotation failed, restoring the previous key: {}", e);
            if let Err(e) = keyring_store(&self.dir, &self.key) {
                warn!("Failed to restore the previous key in the keyring: {}", e);
            }
        }
        result?;

        self.meta = meta;
        self.key = key;
        Ok(())
    }
}

impl fmt::Debug for KeyManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyManager")
            .field("dir", &self.dir)
            .field("meta", &self.meta)
            .field("key", &"[REDACTED]")
            .finish_non_exhaustive()
    }
}

/// First key of a new store: the keyring when it works, otherwise a passphrase
async fn create_key(
    dir: &Path,
    options: &KeyOptions,
    secrets: &dyn SecretProvider,
) -> Result<(StoreMeta, RecordKey)> {
    if options.use_keyring {
        let (meta, key) = generate_key(KeySource::Keyring, options, secrets).await?;
        match keyring_store(dir, &key).and_then(|()| keyring_verify(dir, &key)) {
            Ok(()) => return Ok((meta, key)),
            Err(e) => warn!("Keyring unavailable, falling back to a passphrase: {}", e),
        }
    }
    generate_key(KeySource::Passphrase, options, secrets).await
}

async fn generate_key(
    source: KeySource,
    options: &KeyOptions,
    secrets: &dyn SecretProvider,
) -> Result<(StoreMeta, RecordKey)> {
    let mut meta = StoreMeta {
        version: META_VERSION,
        created_at: Utc::now(),
        key_source: source,
        salt: None,
        kdf: None,
        key_check: None,
    };

    let key = match source {
        KeySource::Keyring => RecordKey::generate()?,
        KeySource::Passphrase => {
            let mut salt = [0u8; SALT_LEN];
            fill_random(&mut salt)?;
            meta.salt = Some(STANDARD.encode(salt));
            meta.kdf = Some(options.kdf);
            derive_from_meta(&meta, secrets).await?
        }
    };

    meta.key_check = Some(seal_key_check(&key)?);
    Ok((meta, key))
}

async fn persist_key(dir: &Path, meta: &StoreMeta, key: &RecordKey) -> Result<()> {
    if meta.key_source == KeySource::Keyring {
        keyring_store(dir, key)?;
        keyring_verify(dir, key)?;
    }
    write_meta(dir, meta).await
}

fn seal_key_check(key: &RecordKey) -> Result<SealedRecord> {
    crypto::seal(key, KEY_CHECK_CONTEXT, KEY_CHECK_PLAINTEXT)
}

fn verify_key_check(check: &SealedRecord, key: &RecordKey) -> Result<()> {
    match crypto::open(key, KEY_CHECK_CONTEXT, check) {
        Ok(plaintext) if plaintext == KEY_CHECK_PLAINTEXT => Ok(()),
        _ => Err(MsAuthError::KeyMismatch),
    }
}

async fn derive_from_meta(meta: &StoreMeta, secrets: &dyn SecretProvider) -> Result<RecordKey> {
    let salt = meta
        .salt
        .as_deref()
        .and_then(|s| STANDARD.decode(s).ok())
        .ok_or(MsAuthError::CorruptedStore)?;
    let params = meta.kdf.unwrap_or_default();

    let passphrase = secrets
        .passphrase("Passphrase for the account store")
        .await
        .ok_or(MsAuthError::UserCancelled)?;

    derive_key(&passphrase, &salt, params)
}

/// Argon2id(passphrase, salt) -> 32-byte key
pub fn derive_key(passphrase: &str, salt: &[u8], params: KdfParams) -> Result<RecordKey> {
    let params = Params::new(params.memory_kib, params.iterations, params.parallelism, Some(32))
        .map_err(|e| MsAuthError::Crypto(format!("Invalid Argon2 parameters: {e}")))?;

    let mut out = Zeroizing::new([0u8; 32]);
    Argon2::new(Algorithm::Argon2id, Version::V0x13, params)
        .hash_password_into(passphrase.as_bytes(), salt, &mut out[..])
        .map_err(|e| MsAuthError::Crypto(format!("Key derivation failed: {e}")))?;

    Ok(RecordKey::from_bytes(*out))
}

/// Backends without persistence (keyring's mock store) hand back nothing
fn keyring_verify(dir: &Path, key: &RecordKey) -> Result<()> {
    if keyring_load(dir)?.as_bytes() != key.as_bytes() {
        return Err(MsAuthError::Keyring("Record key didn't survive a round trip".to_string()));
    }
    Ok(())
}

async fn write_meta(dir: &Path, meta: &StoreMeta) -> Result<()> {
    let json = serde_json::to_vec_pretty(meta)?;
    let tmp = dir.join(format!("{META_FILE}.tmp"));
    fs::write(&tmp, json).await?;
    fs::rename(&tmp, dir.join(META_FILE)).await?;
    Ok(())
}

/// One keyring entry per store directory
#[cfg(feature = "keyring-support")]
fn keyring_entry(dir: &Path) -> Result<keyring::Entry> {
    keyring::Entry::new(KEYRING_SERVICE, &format!("record-key:{}", dir.display()))
        .map_err(|e| MsAuthError::Keyring(e.to_string()))
}

#[cfg(feature = "keyring-support")]
fn keyring_load(dir: &Path) -> Result<RecordKey> {
    let encoded = Zeroizing::new(
        keyring_entry(dir)?
            .get_password()
            .map_err(|e| MsAuthError::Keyring(format!("Failed to read the record key: {e}")))?,
    );
    RecordKey::from_base64(&encoded)
}

#[cfg(feature = "keyring-support")]
fn keyring_store(dir: &Path, key: &RecordKey) -> Result<()> {
    let encoded = Zeroizing::new(key.to_base64());
    keyring_entry(dir)?
        .set_password(&encoded)
        .map_err(|e| MsAuthError::Keyring(format!("Failed to store the record key: {e}")))
}

#[cfg(not(feature = "keyring-support"))]
fn keyring_load(_dir: &Path) -> Result<RecordKey> {
    Err(MsAuthError::Keyring(
        "Store was created with the OS keyring, but keyring support is disabled".to_string(),
    ))
}

#[cfg(not(feature = "keyring-support"))]
fn keyring_store(_dir: &Path, _key: &RecordKey) -> Result<()> {
    Err(MsAuthError::Keyring("Keyring support is disabled".to_string()))
}
