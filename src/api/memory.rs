//! Purpose: In-process `RemoteStore` used for tests and local mocking.
//! Exports: `MemoryStore`.
//! Role: Deterministic backend with failure injection, latency, and budget control.
//! Invariants: Each update reads, transforms, and commits under one mutex hold.
//! Invariants: Clones share state, so two contexts over one store behave like two processes.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;

use super::store::{DataStore, KeyInfo, RemoteStore, RequestKind, StoreResult, Update, UpdateFn};
use crate::core::error::{Error, ErrorKind};
use crate::core::lock::now_unix_ms;

#[derive(Clone, Default)]
pub struct MemoryStore {
    inner: Arc<MemoryInner>,
}

#[derive(Default)]
struct MemoryInner {
    entries: Mutex<HashMap<(String, String), Entry>>,
    writes: Mutex<Vec<WriteLogEntry>>,
    latency_ms: AtomicU64,
    failing_updates: AtomicU32,
    update_calls: AtomicU32,
    next_version: AtomicU64,
    budget: Mutex<Option<u32>>,
}

#[derive(Clone, Debug)]
struct Entry {
    value: Value,
    info: KeyInfo,
}

/// A committed write as observed by the backend.
#[derive(Clone, Debug, PartialEq)]
pub struct WriteLogEntry {
    pub store: String,
    pub key: String,
    pub value: Value,
}

struct MemoryDataStore {
    name: String,
    inner: Arc<MemoryInner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Delay applied before every update and remove commits.
    pub fn set_latency(&self, latency: Duration) {
        self.inner
            .latency_ms
            .store(u64::try_from(latency.as_millis()).unwrap_or(u64::MAX), Ordering::SeqCst);
    }

    /// Makes the next `count` update calls fail with a transient error.
    pub fn fail_next_updates(&self, count: u32) {
        self.inner.failing_updates.store(count, Ordering::SeqCst);
    }

    /// `None` restores the unlimited default.
    pub fn set_request_budget(&self, budget: Option<u32>) {
        *lock(&self.inner.budget) = budget;
    }

    pub fn update_calls(&self) -> u32 {
        self.inner.update_calls.load(Ordering::SeqCst)
    }

    pub fn writes(&self, store: &str, key: &str) -> Vec<Value> {
        lock(&self.inner.writes)
            .iter()
            .filter(|entry| entry.store == store && entry.key == key)
            .map(|entry| entry.value.clone())
            .collect()
    }

    pub fn value(&self, store: &str, key: &str) -> Option<Value> {
        self.entry(store, key).map(|entry| entry.value)
    }

    pub fn key_info(&self, store: &str, key: &str) -> Option<KeyInfo> {
        self.entry(store, key).map(|entry| entry.info)
    }

    /// Stores a raw value as if another writer had put it there.
    pub fn insert(&self, store: &str, key: &str, value: Value) {
        let now = now_unix_ms();
        let info = KeyInfo {
            version: self.inner.bump_version(),
            created_at_ms: now,
            updated_at_ms: now,
            user_ids: Vec::new(),
        };
        lock(&self.inner.entries).insert(owned_key(store, key), Entry { value, info });
    }

    /// Moves the last update time into the past, e.g. to expire a session lock.
    pub fn backdate(&self, store: &str, key: &str, by: Duration) {
        if let Some(entry) = lock(&self.inner.entries).get_mut(&owned_key(store, key)) {
            entry.info.updated_at_ms = entry
                .info
                .updated_at_ms
                .saturating_sub(u64::try_from(by.as_millis()).unwrap_or(u64::MAX));
        }
    }

    fn entry(&self, store: &str, key: &str) -> Option<Entry> {
        lock(&self.inner.entries).get(&owned_key(store, key)).cloned()
    }
}

impl MemoryInner {
    fn bump_version(&self) -> String {
        let version = self.next_version.fetch_add(1, Ordering::SeqCst) + 1;
        format!("v{version}")
    }

    async fn simulate_latency(&self) {
        let latency = self.latency_ms.load(Ordering::SeqCst);
        if latency > 0 {
            tokio::time::sleep(Duration::from_millis(latency)).await;
        }
    }

    fn take_failure(&self) -> bool {
        self.failing_updates
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |count| {
                count.checked_sub(1)
            })
            .is_ok()
    }
}

#[async_trait]
impl RemoteStore for MemoryStore {
    fn open(&self, name: &str) -> StoreResult<Arc<dyn DataStore>> {
        Ok(Arc::new(MemoryDataStore {
            name: name.to_string(),
            inner: Arc::clone(&self.inner),
        }))
    }

    async fn request_budget(&self, _kind: RequestKind) -> u32 {
        lock(&self.inner.budget).unwrap_or(u32::MAX)
    }
}

#[async_trait]
impl DataStore for MemoryDataStore {
    async fn get(&self, key: &str) -> StoreResult<Option<(Value, KeyInfo)>> {
        let entries = lock(&self.inner.entries);
        Ok(entries
            .get(&owned_key(&self.name, key))
            .map(|entry| (entry.value.clone(), entry.info.clone())))
    }

    async fn update(
        &self,
        key: &str,
        transform: UpdateFn<'_>,
    ) -> StoreResult<Option<(Value, KeyInfo)>> {
        self.inner.update_calls.fetch_add(1, Ordering::SeqCst);
        self.inner.simulate_latency().await;
        if self.inner.take_failure() {
            return Err(Error::new(ErrorKind::Remote)
                .with_message("injected update failure")
                .with_key(key));
        }

        let mut entries = lock(&self.inner.entries);
        let slot = owned_key(&self.name, key);
        let current = entries.get(&slot);
        let update = transform(
            current.map(|entry| &entry.value),
            current.map(|entry| &entry.info),
        );
        let Update::Write { value, user_ids } = update else {
            return Ok(None);
        };

        let now = now_unix_ms();
        let created_at_ms = current.map_or(now, |entry| entry.info.created_at_ms);
        let info = KeyInfo {
            version: self.inner.bump_version(),
            created_at_ms,
            updated_at_ms: now,
            user_ids,
        };
        entries.insert(
            slot,
            Entry {
                value: value.clone(),
                info: info.clone(),
            },
        );
        drop(entries);

        lock(&self.inner.writes).push(WriteLogEntry {
            store: self.name.clone(),
            key: key.to_string(),
            value: value.clone(),
        });
        Ok(Some((value, info)))
    }

    async fn remove(&self, key: &str) -> StoreResult<Option<Value>> {
        self.inner.simulate_latency().await;
        let mut entries = lock(&self.inner.entries);
        Ok(entries
            .remove(&owned_key(&self.name, key))
            .map(|entry| entry.value))
    }
}

fn owned_key(store: &str, key: &str) -> (String, String) {
    (store.to_string(), key.to_string())
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poison| poison.into_inner())
}
