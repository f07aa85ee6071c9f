//! Purpose: Directory-backed `RemoteStore` shared by every process on one machine.
//! Exports: `FileStore`.
//! Role: Backend for the CLI and multi-process tests; one JSON file per key.
//! Invariants: Updates hold an exclusive fs2 lock on the key's sidecar `.lock` file.
//! Invariants: Values are replaced by rename, so lock-free reads never see partial writes.
//! Notes: Lock files are never deleted; removing one would split waiters across inodes.

use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use fs2::FileExt;
use libc::{EACCES, EPERM};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};

use super::store::{DataStore, KeyInfo, RemoteStore, RequestKind, StoreResult, Update, UpdateFn};
use crate::core::error::{Error, ErrorKind};
use crate::core::lock::now_unix_ms;

const LOCK_POLL: Duration = Duration::from_millis(5);
const LOCK_WAIT: Duration = Duration::from_secs(2);

#[derive(Clone, Debug)]
pub struct FileStore {
    root: PathBuf,
}

struct FileDataStore {
    dir: PathBuf,
}

#[derive(Serialize, Deserialize)]
struct StoredEntry {
    value: Value,
    info: KeyInfo,
}

struct KeyPaths {
    data: PathBuf,
    lock: PathBuf,
    staging: PathBuf,
}

/// Held for the duration of one read-transform-write.
struct KeyLock {
    file: File,
}

impl Drop for KeyLock {
    fn drop(&mut self) {
        let _ = self.file.unlock();
    }
}

impl FileStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

#[async_trait]
impl RemoteStore for FileStore {
    fn open(&self, name: &str) -> StoreResult<Arc<dyn DataStore>> {
        validate_store_name(name)?;
        let dir = self.root.join(name);
        fs::create_dir_all(&dir).map_err(|err| io_error(&dir, err))?;
        Ok(Arc::new(FileDataStore { dir }))
    }

    async fn request_budget(&self, _kind: RequestKind) -> u32 {
        u32::MAX
    }
}

impl FileDataStore {
    fn paths(&self, key: &str) -> StoreResult<KeyPaths> {
        let stem = key_file_stem(key)?;
        Ok(KeyPaths {
            data: self.dir.join(format!("{stem}.json")),
            lock: self.dir.join(format!("{stem}.lock")),
            staging: self.dir.join(format!("{stem}.json.tmp")),
        })
    }

    /// Polls for the key lock instead of blocking a runtime thread.
    async fn lock_key(&self, paths: &KeyPaths) -> StoreResult<KeyLock> {
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .read(true)
            .write(true)
            .open(&paths.lock)
            .map_err(|err| io_error(&paths.lock, err))?;
        let deadline = tokio::time::Instant::now() + LOCK_WAIT;
        loop {
            match file.try_lock_exclusive() {
                Ok(()) => return Ok(KeyLock { file }),
                Err(err) => {
                    let kind = lock_error_kind(&err);
                    if kind != ErrorKind::Remote || tokio::time::Instant::now() >= deadline {
                        return Err(Error::new(kind)
                            .with_message("failed to lock key file")
                            .with_path(&paths.lock)
                            .with_source(err));
                    }
                }
            }
            tokio::time::sleep(LOCK_POLL).await;
        }
    }
}

#[async_trait]
impl DataStore for FileDataStore {
    async fn get(&self, key: &str) -> StoreResult<Option<(Value, KeyInfo)>> {
        let paths = self.paths(key)?;
        Ok(read_entry(&paths.data)?.map(|entry| (entry.value, entry.info)))
    }

    async fn update(
        &self,
        key: &str,
        transform: UpdateFn<'_>,
    ) -> StoreResult<Option<(Value, KeyInfo)>> {
        let paths = self.paths(key)?;
        let _lock = self.lock_key(&paths).await?;

        let current = read_entry(&paths.data)?;
        let update = transform(
            current.as_ref().map(|entry| &entry.value),
            current.as_ref().map(|entry| &entry.info),
        );
        let Update::Write { value, user_ids } = update else {
            return Ok(None);
        };

        let value_bytes = serde_json::to_vec(&value).map_err(|err| {
            Error::new(ErrorKind::Internal)
                .with_message("failed to encode value")
                .with_source(err)
        })?;
        let now = now_unix_ms();
        let info = KeyInfo {
            version: version_token(&value_bytes, now),
            created_at_ms: current.as_ref().map_or(now, |entry| entry.info.created_at_ms),
            updated_at_ms: now,
            user_ids,
        };
        let entry = StoredEntry { value, info };
        write_entry(&paths, &entry)?;
        Ok(Some((entry.value, entry.info)))
    }

    async fn remove(&self, key: &str) -> StoreResult<Option<Value>> {
        let paths = self.paths(key)?;
        let _lock = self.lock_key(&paths).await?;
        let current = read_entry(&paths.data)?;
        if current.is_some() {
            fs::remove_file(&paths.data).map_err(|err| io_error(&paths.data, err))?;
        }
        Ok(current.map(|entry| entry.value))
    }
}

fn read_entry(path: &Path) -> StoreResult<Option<StoredEntry>> {
    let bytes = match fs::read(path) {
        Ok(bytes) => bytes,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(err) => return Err(io_error(path, err)),
    };
    serde_json::from_slice(&bytes).map(Some).map_err(|err| {
        Error::new(ErrorKind::Corrupt)
            .with_message("stored entry is not valid JSON")
            .with_path(path)
            .with_source(err)
    })
}

fn write_entry(paths: &KeyPaths, entry: &StoredEntry) -> StoreResult<()> {
    let bytes = serde_json::to_vec_pretty(entry).map_err(|err| {
        Error::new(ErrorKind::Internal)
            .with_message("failed to encode stored entry")
            .with_source(err)
    })?;
    let mut file = File::create(&paths.staging).map_err(|err| io_error(&paths.staging, err))?;
    file.write_all(&bytes)
        .map_err(|err| io_error(&paths.staging, err))?;
    file.sync_all()
        .map_err(|err| io_error(&paths.staging, err))?;
    fs::rename(&paths.staging, &paths.data).map_err(|err| io_error(&paths.data, err))?;
    Ok(())
}

fn version_token(value_bytes: &[u8], updated_at_ms: u64) -> String {
    let mut hasher = Sha256::new();
    hasher.update(value_bytes);
    hasher.update(updated_at_ms.to_le_bytes());
    let digest = hasher.finalize();
    let mut hex = String::with_capacity(digest.len() * 2);
    for byte in digest {
        use std::fmt::Write;
        let _ = write!(hex, "{byte:02x}");
    }
    hex
}

fn validate_store_name(name: &str) -> StoreResult<()> {
    let valid = !name.is_empty()
        && !name.starts_with('.')
        && name
            .bytes()
            .all(|byte| byte.is_ascii_alphanumeric() || matches!(byte, b'-' | b'_' | b'.'));
    if valid {
        return Ok(());
    }
    Err(Error::new(ErrorKind::Usage)
        .with_message(format!("invalid store name {name:?}"))
        .with_hint("Use letters, digits, '-', '_' or '.', not starting with '.'."))
}

/// Escapes everything outside `[A-Za-z0-9_-]` as `%XX` so any key maps to one file name.
fn key_file_stem(key: &str) -> StoreResult<String> {
    if key.is_empty() {
        return Err(Error::new(ErrorKind::Usage).with_message("key must not be empty"));
    }
    let mut stem = String::with_capacity(key.len());
    for byte in key.bytes() {
        if byte.is_ascii_alphanumeric() || matches!(byte, b'-' | b'_') {
            stem.push(byte as char);
        } else {
            use std::fmt::Write;
            let _ = write!(stem, "%{byte:02X}");
        }
    }
    Ok(stem)
}

fn io_error(path: &Path, err: io::Error) -> Error {
    let kind = match err.kind() {
        io::ErrorKind::PermissionDenied => ErrorKind::Permission,
        _ => ErrorKind::Io,
    };
    Error::new(kind).with_path(path).with_source(err)
}

/// Contention maps to `Remote` so retry policies treat a busy key as transient.
fn lock_error_kind(err: &io::Error) -> ErrorKind {
    let errno = err.raw_os_error().unwrap_or_default();
    if errno == EACCES || errno == EPERM {
        return ErrorKind::Permission;
    }
    match err.kind() {
        io::ErrorKind::WouldBlock => ErrorKind::Remote,
        io::ErrorKind::PermissionDenied => ErrorKind::Permission,
        _ => ErrorKind::Io,
    }
}
