use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use fs2::FileExt;
use tokio::fs;
use tokio::sync::{Mutex, MutexGuard, RwLock};
use tokio::time::Instant;
use tracing::{debug, error, instrument, warn};

use crate::crypto::{self, RecordKey, SealedRecord};
use crate::errors::{MsAuthError, Result};
use crate::key_manager::{KeyManager, KeyOptions};
use crate::record::AuthenticationRecord;
use crate::secret::SecretProvider;
use crate::store::RecordStore;

const TMP_EXTENSION: &str = "json.tmp";
/// Records sealed under a key that is being rotated in
const ROTATE_EXTENSION: &str = "json.rotate";
const LOCK_TIMEOUT: Duration = Duration::from_secs(10);
const LOCK_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Encrypted on-disk record store.
///
/// ```text
/// <dir>/
/// ├── meta.json        key source, KDF salt and parameters, key check
/// ├── lock             advisory lock held while writing
/// └── accounts/
///     └── <uuid>.json  one sealed record per account
/// ```
#[derive(Debug)]
pub struct FileRecordStore {
    dir: PathBuf,
    accounts_dir: PathBuf,
    keys: RwLock<KeyManager>,
    cache: RwLock<HashMap<String, AuthenticationRecord>>,
    writer: Mutex<()>,
    lock_timeout: Duration,
}

/// Held while writing; the file lock is released before the in-process one
struct StoreLock<'a> {
    _file: std::fs::File,
    _writer: MutexGuard<'a, ()>,
}

impl FileRecordStore {
    pub async fn open(dir: impl AsRef<Path>, secrets: Arc<dyn SecretProvider>) -> Result<Self> {
        Self::open_with(dir, secrets, KeyOptions::default()).await
    }

    #[instrument(skip_all, fields(dir = %dir.as_ref().display()))]
    pub async fn open_with(
        dir: impl AsRef<Path>,
        secrets: Arc<dyn SecretProvider>,
        options: KeyOptions,
    ) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        let accounts_dir = dir.join("accounts");
        fs::create_dir_all(&accounts_dir).await?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            for d in [&dir, &accounts_dir] {
                fs::set_permissions(d, std::fs::Permissions::from_mode(0o700)).await?;
            }
        }

        let keys = KeyManager::open(&dir, secrets, options).await?;

        let store = Self {
            dir,
            accounts_dir,
            keys: RwLock::new(keys),
            cache: RwLock::new(HashMap::new()),
            writer: Mutex::new(()),
            lock_timeout: LOCK_TIMEOUT,
        };
        store.finish_rotation().await?;
        debug!("Opened record store");

        Ok(store)
    }

    /// `store` under the platform config directory for msauth
    pub fn default_dir() -> Result<PathBuf> {
        let dirs = directories::ProjectDirs::from("", "", "msauth").ok_or_else(|| {
            MsAuthError::Io(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                "Could not determine a config directory",
            ))
        })?;
        Ok(dirs.config_dir().join("store"))
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn record_path(&self, account_key: &str) -> Result<PathBuf> {
        // Keys become file names
        if account_key.is_empty()
            || !account_key
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
        {
            return Err(MsAuthError::InvalidResponse(format!(
                "Invalid account key: {account_key:?}"
            )));
        }
        Ok(self.accounts_dir.join(format!("{account_key}.json")))
    }

    /// One writer per store: a mutex within the process, then an advisory
    /// lock across processes, waited on for at most `lock_timeout`
    async fn lock(&self) -> Result<StoreLock<'_>> {
        let writer = self.writer.lock().await;
        let file = std::fs::OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(self.dir.join("lock"))?;

        let deadline = Instant::now() + self.lock_timeout;
        loop {
            match file.try_lock_exclusive() {
                Ok(()) => break,
                Err(e) if e.raw_os_error() == fs2::lock_contended_error().raw_os_error() => {}
                Err(e) => return Err(e.into()),
            }
            if Instant::now() >= deadline {
                return Err(MsAuthError::LockTimeout);
            }
            tokio::time::sleep(LOCK_POLL_INTERVAL).await;
        }

        Ok(StoreLock {
            _file: file,
            _writer: writer,
        })
    }

    async fn read_record(&self, account_key: &str) -> Result<Option<AuthenticationRecord>> {
        let path = self.record_path(account_key)?;
        let bytes = match fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        let sealed: SealedRecord = serde_json::from_slice(&bytes).map_err(|_| MsAuthError::CorruptedStore)?;
        let keys = self.keys.read().await;
        let plaintext = zeroize::Zeroizing::new(crypto::open(keys.key(), account_key, &sealed)?);
        let record = serde_json::from_slice(&plaintext).map_err(|_| MsAuthError::CorruptedStore)?;
        Ok(Some(record))
    }

    /// Record file path and its sealed contents under `key`
    fn seal_record(&self, key: &RecordKey, record: &AuthenticationRecord) -> Result<(PathBuf, Vec<u8>)> {
        let account_key = record.account_key();
        let path = self.record_path(&account_key)?;

        let plaintext = zeroize::Zeroizing::new(serde_json::to_vec(record)?);
        let sealed = crypto::seal(key, &account_key, &plaintext)?;
        Ok((path, serde_json::to_vec_pretty(&sealed)?))
    }

    async fn write_record(&self, record: &AuthenticationRecord) -> Result<()> {
        let (path, contents) = {
            let keys = self.keys.read().await;
            self.seal_record(keys.key(), record)?
        };

        let tmp = write_staged(&path, TMP_EXTENSION, &contents).await?;
        fs::rename(&tmp, &path).await?;
        Ok(())
    }

    /// Seal `record` under `key` next to its file; returns (staged, final) paths
    async fn stage_record(&self, key: &RecordKey, record: &AuthenticationRecord) -> Result<(PathBuf, PathBuf)> {
        let (path, contents) = self.seal_record(key, record)?;
        let staged = write_staged(&path, ROTATE_EXTENSION, &contents).await?;
        Ok((staged, path))
    }

    /// Switch to a new record key and re-encrypt every stored record.
    ///
    /// Every record is sealed under the new key into a staging file before
    /// the key is committed; if anything fails first, the old key and
    /// records stay as they were.
    #[instrument(skip(self))]
    pub async fn rotate_key(&self) -> Result<()> {
        let _lock = self.lock().await?;

        let mut records = Vec::new();
        for key in self.list_accounts().await {
            if let Some(record) = self.read_record(&key).await? {
                records.push(record);
            }
        }

        // Readers wait until the records match the key again
        let mut keys = self.keys.write().await;
        let (meta, key) = keys.prepare_rotation().await?;

        let mut staged = Vec::with_capacity(records.len());
        for record in &records {
            match self.stage_record(&key, record).await {
                Ok(paths) => staged.push(paths),
                Err(e) => {
                    discard_staged(&staged).await;
                    return Err(e);
                }
            }
        }

        if let Err(e) = keys.commit_rotation(meta, key).await {
            discard_staged(&staged).await;
            return Err(e);
        }

        // Staging files left behind here are finished by the next open
        for (tmp, path) in &staged {
            fs::rename(tmp, path).await?;
        }
        drop(keys);
        self.cache.write().await.clear();

        debug!(count = records.len(), "Rotated record key");
        Ok(())
    }

    /// Settle staging files from an interrupted rotation: those sealed under
    /// the current key replace their record, the rest are stale
    async fn finish_rotation(&self) -> Result<()> {
        let mut entries = fs::read_dir(&self.accounts_dir).await?;
        let mut pending = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            let account_key = path
                .file_name()
                .and_then(|name| name.to_str())
                .and_then(|name| name.strip_suffix(&format!(".{ROTATE_EXTENSION}")));
            if let Some(account_key) = account_key {
                pending.push((account_key.to_string(), path));
            }
        }
        if pending.is_empty() {
            return Ok(());
        }

        let _lock = self.lock().await?;
        let keys = self.keys.read().await;
        for (account_key, staged) in pending {
            let current = match fs::read(&staged).await {
                Ok(bytes) => serde_json::from_slice::<SealedRecord>(&bytes)
                    .ok()
                    .is_some_and(|sealed| crypto::open(keys.key(), &account_key, &sealed).is_ok()),
                Err(e) => {
                    warn!("Unreadable staging file {}: {}", staged.display(), e);
                    continue;
                }
            };

            let result = if current {
                debug!(account = %account_key, "Finishing an interrupted key rotation");
                fs::rename(&staged, staged.with_extension("")).await
            } else {
                debug!(account = %account_key, "Removing a stale staging file");
                fs::remove_file(&staged).await
            };
            if let Err(e) = result {
                warn!("Failed to settle {}: {}", staged.display(), e);
            }
        }
        Ok(())
    }
}

/// Write `contents` beside `path` with `extension` and fsync it; the caller
/// renames it into place
async fn write_staged(path: &Path, extension: &str, contents: &[u8]) -> Result<PathBuf> {
    let tmp = path.with_extension(extension);
    fs::write(&tmp, contents).await?;
    fs::File::open(&tmp).await?.sync_all().await?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(&tmp, std::fs::Permissions::from_mode(0o600)).await?;
    }

    Ok(tmp)
}

async fn discard_staged(staged: &[(PathBuf, PathBuf)]) {
    for (tmp, _) in staged {
        if let Err(e) = fs::remove_file(tmp).await {
            warn!("Failed to remove {}: {}", tmp.display(), e);
        }
    }
}

#[async_trait]
impl RecordStore for FileRecordStore {
    async fn load(&self, account_key: &str) -> Option<AuthenticationRecord> {
        if let Some(record) = self.cache.read().await.get(account_key) {
            return Some(record.clone());
        }

        match self.read_record(account_key).await {
            Ok(Some(record)) => {
                self.cache
                    .write()
                    .await
                    .insert(account_key.to_string(), record.clone());
                Some(record)
            }
            Ok(None) => None,
            Err(e) => {
                error!("Failed to load record for {}: {}", account_key, e);
                None
            }
        }
    }

    async fn save(&self, record: &AuthenticationRecord) -> Result<()> {
        let _lock = self.lock().await?;
        self.write_record(record).await?;
        self.cache
            .write()
            .await
            .insert(record.account_key(), record.clone());
        Ok(())
    }

    async fn remove(&self, account_key: &str) -> Result<()> {
        let _lock = self.lock().await?;
        match fs::remove_file(self.record_path(account_key)?).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        self.cache.write().await.remove(account_key);
        Ok(())
    }

    async fn list_accounts(&self) -> Vec<String> {
        let mut accounts = Vec::new();
        let mut entries = match fs::read_dir(&self.accounts_dir).await {
            Ok(entries) => entries,
            Err(e) => {
                error!("Failed to read accounts directory: {}", e);
                return accounts;
            }
        };

        while let Ok(Some(entry)) = entries.next_entry().await {
            let path = entry.path();
            if path.extension().and_then(|s| s.to_str()) == Some("json")
                && let Some(stem) = path.file_stem().and_then(|s| s.to_str())
            {
                accounts.push(stem.to_string());
            }
        }

        accounts.sort();
        accounts
    }
}

#[cfg(test)]
mod tests {
    use tempfile::TempDir;

    use super::*;
    use crate::key_manager::tests::cheap_options;
    use crate::secret::StaticSecretProvider;
    use crate::store::tests::record;

    const NOTCH: &str = "069a79f444e94726a5befca90e38aaf5";
    const JEB: &str = "853c80ef3c3749fdaa49938b674adae6";
    const NOTCH_KEY: &str = "069a79f4-44e9-4726-a5be-fca90e38aaf5";

    async fn open_store(dir: &Path, passphrase: &str) -> Result<FileRecordStore> {
        FileRecordStore::open_with(dir, Arc::new(StaticSecretProvider::new(passphrase)), cheap_options()).await
    }

    #[tokio::test]
    async fn test_save_load_remove() {
        let temp = TempDir::new().unwrap();
        let store = open_store(temp.path(), "pass").await.unwrap();
        let notch = record("Notch", NOTCH);

        store.save(&notch).await.unwrap();
        assert_eq!(store.load(&notch.account_key()).await, Some(notch.clone()));

        // The file on disk holds no plaintext
        let raw = std::fs::read_to_string(temp.path().join("accounts").join(format!("{}.json", notch.account_key()))).unwrap();
        assert!(!raw.contains("Notch-access"));
        assert!(!raw.contains("Notch-refresh"));

        store.remove(&notch.account_key()).await.unwrap();
        assert!(store.load(&notch.account_key()).await.is_none());
        // Removing twice is fine
        store.remove(&notch.account_key()).await.unwrap();
    }

    #[tokio::test]
    async fn test_reopen_and_list() {
        let temp = TempDir::new().unwrap();
        {
            let store = open_store(temp.path(), "pass").await.unwrap();
            store.save(&record("Notch", NOTCH)).await.unwrap();
            store.save(&record("jeb_", JEB)).await.unwrap();
        }

        let store = open_store(temp.path(), "pass").await.unwrap();
        assert_eq!(
            store.list_accounts().await,
            vec![
                "069a79f4-44e9-4726-a5be-fca90e38aaf5".to_string(),
                "853c80ef-3c37-49fd-aa49-938b674adae6".to_string(),
            ]
        );
        let names: Vec<String> = store.load_all().await.into_iter().map(|r| r.username).collect();
        assert_eq!(names, ["Notch", "jeb_"]);
    }

    #[tokio::test]
    async fn test_wrong_passphrase_cannot_open() {
        let temp = TempDir::new().unwrap();
        let notch = record("Notch", NOTCH);
        open_store(temp.path(), "right").await.unwrap().save(&notch).await.unwrap();

        assert!(matches!(
            open_store(temp.path(), "typo").await,
            Err(MsAuthError::KeyMismatch)
        ));

        let store = open_store(temp.path(), "right").await.unwrap();
        assert_eq!(store.load(&notch.account_key()).await, Some(notch));
    }

    #[tokio::test]
    async fn test_swapped_files_do_not_decrypt() {
        let temp = TempDir::new().unwrap();
        let store = open_store(temp.path(), "pass").await.unwrap();
        let notch = record("Notch", NOTCH);
        let jeb = record("jeb_", JEB);
        store.save(&notch).await.unwrap();

        let accounts = temp.path().join("accounts");
        std::fs::copy(
            accounts.join(format!("{}.json", notch.account_key())),
            accounts.join(format!("{}.json", jeb.account_key())),
        )
        .unwrap();

        assert!(matches!(
            store.read_record(&jeb.account_key()).await,
            Err(MsAuthError::CorruptedStore)
        ));
    }

    #[tokio::test]
    async fn test_rotate_key() {
        let temp = TempDir::new().unwrap();
        let store = open_store(temp.path(), "pass").await.unwrap();
        let notch = record("Notch", NOTCH);
        store.save(&notch).await.unwrap();

        let path = temp.path().join("accounts").join(format!("{}.json", notch.account_key()));
        let before = std::fs::read_to_string(&path).unwrap();
        let salt_before = store.keys.read().await.meta().salt.clone();

        store.rotate_key().await.unwrap();

        assert_ne!(std::fs::read_to_string(&path).unwrap(), before);
        assert_ne!(store.keys.read().await.meta().salt, salt_before);
        assert_eq!(store.read_record(&notch.account_key()).await.unwrap(), Some(notch.clone()));

        // The rotated key is what a fresh open derives
        let reopened = open_store(temp.path(), "pass").await.unwrap();
        assert_eq!(reopened.load(&notch.account_key()).await, Some(notch));
    }

    #[tokio::test]
    async fn test_rotation_failure_keeps_old_key() {
        let temp = TempDir::new().unwrap();
        let store = open_store(temp.path(), "pass").await.unwrap();
        let notch = record("Notch", NOTCH);
        let jeb = record("jeb_", JEB);
        store.save(&notch).await.unwrap();
        store.save(&jeb).await.unwrap();
        let salt_before = store.keys.read().await.meta().salt.clone();

        // jeb_'s staging file can't be written
        let accounts = temp.path().join("accounts");
        let blocker = accounts.join(format!("{}.{ROTATE_EXTENSION}", jeb.account_key()));
        std::fs::create_dir(&blocker).unwrap();

        assert!(store.rotate_key().await.is_err());
        assert_eq!(store.keys.read().await.meta().salt, salt_before);
        assert_eq!(store.read_record(&notch.account_key()).await.unwrap(), Some(notch.clone()));
        assert_eq!(store.read_record(&jeb.account_key()).await.unwrap(), Some(jeb.clone()));
        assert!(!accounts.join(format!("{}.{ROTATE_EXTENSION}", notch.account_key())).exists());
        drop(store);

        let reopened = open_store(temp.path(), "pass").await.unwrap();
        assert_eq!(reopened.load(&notch.account_key()).await, Some(notch.clone()));
        assert_eq!(reopened.load(&jeb.account_key()).await, Some(jeb.clone()));

        std::fs::remove_dir(&blocker).unwrap();
        reopened.rotate_key().await.unwrap();
        let names: Vec<String> = reopened.load_all().await.into_iter().map(|r| r.username).collect();
        assert_eq!(names, ["Notch", "jeb_"]);
    }

    #[tokio::test]
    async fn test_interrupted_rotation_finishes_on_open() {
        let temp = TempDir::new().unwrap();
        let notch = record("Notch", NOTCH);
        let stale = {
            let store = open_store(temp.path(), "pass").await.unwrap();
            store.save(&notch).await.unwrap();

            // Left over from an aborted rotation to some other key
            let (stale, _) = store
                .stage_record(&RecordKey::generate().unwrap(), &record("jeb_", JEB))
                .await
                .unwrap();

            // Key committed, then stopped before the rename
            let mut keys = store.keys.write().await;
            let (meta, key) = keys.prepare_rotation().await.unwrap();
            store.stage_record(&key, &notch).await.unwrap();
            keys.commit_rotation(meta, key).await.unwrap();
            stale
        };

        let store = open_store(temp.path(), "pass").await.unwrap();
        assert_eq!(store.load(&notch.account_key()).await, Some(notch));
        assert!(!stale.exists());
        assert!(!temp.path().join("accounts").join(format!("{NOTCH_KEY}.{ROTATE_EXTENSION}")).exists());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_saves() {
        let temp = TempDir::new().unwrap();
        let store = Arc::new(open_store(temp.path(), "pass").await.unwrap());

        let saves: Vec<_> = (0..16u32)
            .map(|i| {
                let store = store.clone();
                tokio::spawn(async move { store.save(&record(&format!("player{i}"), &format!("{i:032x}"))).await })
            })
            .collect();
        for save in saves {
            save.await.unwrap().unwrap();
        }

        assert_eq!(store.list_accounts().await.len(), 16);
    }

    #[tokio::test]
    async fn test_lock_timeout() {
        let temp = TempDir::new().unwrap();
        let mut store = open_store(temp.path(), "pass").await.unwrap();
        store.lock_timeout = Duration::from_millis(100);

        // Another process holding the lock
        let other = std::fs::OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(temp.path().join("lock"))
            .unwrap();
        other.lock_exclusive().unwrap();

        assert!(matches!(store.save(&record("Notch", NOTCH)).await, Err(MsAuthError::LockTimeout)));

        other.unlock().unwrap();
        store.save(&record("Notch", NOTCH)).await.unwrap();
    }

    #[tokio::test]
    async fn test_rejects_path_like_keys() {
        let temp = TempDir::new().unwrap();
        let store = open_store(temp.path(), "pass").await.unwrap();
        assert!(store.remove("../meta").await.is_err());
        assert!(store.load("../meta").await.is_none());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_permissions() {
        use std::os::unix::fs::PermissionsExt;

        let temp = TempDir::new().unwrap();
        let store = open_store(temp.path(), "pass").await.unwrap();
        let notch = record("Notch", NOTCH);
        store.save(&notch).await.unwrap();

        let dir_mode = std::fs::metadata(temp.path().join("accounts")).unwrap().permissions().mode();
        assert_eq!(dir_mode & 0o777, 0o700);
        let file = temp.path().join("accounts").join(format!("{}.json", notch.account_key()));
        assert_eq!(std::fs::metadata(file).unwrap().permissions().mode() & 0o777, 0o600);
    }
}
