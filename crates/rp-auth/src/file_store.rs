use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use anyhow::Context;
use base64::{Engine, engine::general_purpose::URL_SAFE_NO_PAD};
use fs2::FileExt;
use tokio::fs;
use tracing::{debug, instrument, warn};
use zeroize::Zeroizing;

use crate::crypto::{self, EncryptionKey, SealedRecord};
use crate::errors::StoreError;
use crate::store::CredentialStore;

const KEY_FILE: &str = "store.key";
const LOCK_FILE: &str = "lock";
const LOCK_TIMEOUT: Duration = Duration::from_secs(2);
const LOCK_RETRY_DELAY: Duration = Duration::from_millis(20);

/// File-based encrypted credential store
///
/// Every key is stored in its own file, sealed with AES-256-GCM.
///
/// # Directory Structure
/// ```text
/// ~/.local/share/rallypoint/session/
/// ├── store.key              # Encryption key (unless supplied by the host)
/// ├── lock                   # Advisory lock file
/// └── records/
///     ├── c2Vzc2lvbi51c2Vy.json    # base64url("session.user")
///     └── c2Vzc2lvbi50b2tlbnM.json # base64url("session.tokens")
/// ```
#[derive(Debug)]
pub struct FileCredentialStore {
    records_dir: PathBuf,
    lock_file: PathBuf,
    key: EncryptionKey,
}

impl FileCredentialStore {
    /// Open a store, loading the encryption key from `store.key` or creating one
    #[instrument(skip_all)]
    pub async fn open(storage_dir: impl AsRef<Path>) -> Result<Self, StoreError> {
        let storage_dir = storage_dir.as_ref();
        prepare_dir(storage_dir).await?;

        let key = load_or_create_key(&storage_dir.join(KEY_FILE)).await?;
        Self::with_key(storage_dir, key).await
    }

    /// Open a store with a key supplied by the host (e.g. from the platform keychain)
    pub async fn with_key(
        storage_dir: impl AsRef<Path>,
        key: EncryptionKey,
    ) -> Result<Self, StoreError> {
        let storage_dir = storage_dir.as_ref();
        let records_dir = storage_dir.join("records");

        prepare_dir(storage_dir).await?;
        prepare_dir(&records_dir).await?;

        Ok(Self {
            records_dir,
            lock_file: storage_dir.join(LOCK_FILE),
            key,
        })
    }

    /// Get default storage directory for the current platform
    pub fn default_storage_dir() -> Result<PathBuf, StoreError> {
        let project_dirs = directories::ProjectDirs::from("app", "rallypoint", "rallypoint")
            .ok_or(StoreError::StorageDirUnavailable)?;

        Ok(project_dirs.data_dir().join("session"))
    }

    /// Keys may contain any characters, so file names are their base64url form
    fn record_path(&self, key: &str) -> PathBuf {
        self.records_dir
            .join(format!("{}.json", URL_SAFE_NO_PAD.encode(key)))
    }

    /// Acquire the exclusive advisory lock, retrying until `LOCK_TIMEOUT`
    async fn acquire_lock(&self) -> Result<std::fs::File, StoreError> {
        let lock_file = std::fs::OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&self.lock_file)?;

        let started = Instant::now();
        loop {
            match lock_file.try_lock_exclusive() {
                Ok(()) => return Ok(lock_file),
                Err(_) if started.elapsed() < LOCK_TIMEOUT => {
                    tokio::time::sleep(LOCK_RETRY_DELAY).await;
                }
                Err(e) => {
                    warn!("Gave up waiting for credential store lock: {}", e);
                    return Err(StoreError::LockTimeout);
                }
            }
        }
    }

    async fn read_record(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        let path = self.record_path(key);

        let content = match fs::read(&path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        let sealed: SealedRecord =
            serde_json::from_slice(&content).map_err(|_| StoreError::Corrupted)?;
        let plaintext = crypto::open(&self.key, &sealed, key)?;

        Ok(Some(plaintext.to_vec()))
    }

    /// Seal and write a record: temp file, fsync, rename
    async fn write_record(&self, key: &str, value: &[u8]) -> Result<(), StoreError> {
        let path = self.record_path(key);

        let sealed = crypto::seal(&self.key, value, key)?;
        let encoded = serde_json::to_vec(&sealed)
            .map_err(|e| StoreError::Crypto(format!("Failed to encode sealed record: {e}")))?;

        let temp_path = path.with_extension("tmp");
        fs::write(&temp_path, encoded).await?;

        let file = fs::File::open(&temp_path).await?;
        file.sync_all().await?;
        drop(file);

        fs::rename(&temp_path, &path).await?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(&path, std::fs::Permissions::from_mode(0o600)).await?;
        }

        debug!("Wrote credential record {}", key);
        Ok(())
    }

    async fn remove_record(&self, key: &str) -> Result<(), StoreError> {
        match fs::remove_file(self.record_path(key)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

#[async_trait::async_trait]
impl CredentialStore for FileCredentialStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        self.read_record(key).await
    }

    async fn set(&self, key: &str, value: &[u8]) -> Result<(), StoreError> {
        let _lock = self.acquire_lock().await?;
        self.write_record(key, value).await
    }

    async fn remove(&self, key: &str) -> Result<(), StoreError> {
        let _lock = self.acquire_lock().await?;
        self.remove_record(key).await
    }

    async fn remove_many(&self, keys: &[&str]) -> Result<(), StoreError> {
        let _lock = self.acquire_lock().await?;
        for key in keys {
            self.remove_record(key).await?;
        }
        Ok(())
    }

    async fn set_many(&self, entries: &[(&str, Vec<u8>)]) -> Result<(), StoreError> {
        let _lock = self.acquire_lock().await?;
        for (key, value) in entries {
            self.write_record(key, value).await?;
        }
        Ok(())
    }
}

async fn prepare_dir(dir: &Path) -> Result<(), StoreError> {
    fs::create_dir_all(dir)
        .await
        .context("Failed to create storage directory")
        .map_err(|source| StoreError::Setup {
            path: dir.to_path_buf(),
            source,
        })?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(dir, std::fs::Permissions::from_mode(0o700)).await?;
    }

    Ok(())
}

async fn load_or_create_key(path: &Path) -> Result<EncryptionKey, StoreError> {
    match fs::read_to_string(path).await {
        Ok(encoded) => {
            let encoded = Zeroizing::new(encoded);
            debug!("Loaded credential store key from {}", path.display());
            EncryptionKey::from_base64(&encoded)
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            let key = EncryptionKey::generate()?;
            fs::write(path, key.to_base64().as_bytes())
                .await
                .context("Failed to write credential store key")
                .map_err(|source| StoreError::Setup {
                    path: path.to_path_buf(),
                    source,
                })?;

            #[cfg(unix)]
            {
                use std::os::unix::fs::PermissionsExt;
                fs::set_permissions(path, std::fs::Permissions::from_mode(0o600)).await?;
            }

            debug!("Generated new credential store key at {}", path.display());
            Ok(key)
        }
        Err(e) => Err(e.into()),
    }
}
