//! Purpose: Collections: per-schema factories and registries of open documents.
//! Exports: `Collection`, `CollectionOptions`.
//! Role: Runs the load pipeline: lock, fetch, migrate, validate, register.
//! Invariants: A key has at most one open (or loading) document per collection.
//! Invariants: A load that fails or is cancelled after claiming releases its lock or keeps it for reuse.
//! Invariants: Stranded locks (failed close, interrupted load) are reused by the next load of that key.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use async_trait::async_trait;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::{debug, warn};

use super::config::{Config, Lapis, OpenDocuments};
use super::document::Document;
use super::store::{DataStore, KeyInfo, RequestKind, Update};
use crate::core::error::{Error, ErrorKind};
use crate::core::lock::{self, Claim};
use crate::core::record::Record;
use crate::core::retry::is_retryable;
use crate::core::schema::{BoxError, Migration, Schema, Validator};
use crate::core::throttle::Throttle;

pub struct CollectionOptions<T> {
    default_data: T,
    validate: Option<Validator<T>>,
    migrations: Vec<Migration>,
}

impl<T> CollectionOptions<T> {
    pub fn new(default_data: T) -> Self {
        Self {
            default_data,
            validate: None,
            migrations: Vec::new(),
        }
    }

    pub fn validate(
        mut self,
        validate: impl Fn(&T) -> Result<(), BoxError> + Send + Sync + 'static,
    ) -> Self {
        self.validate = Some(Arc::new(validate));
        self
    }

    /// Appends a migration; migrations run first to last.
    pub fn migration(
        mut self,
        migration: impl Fn(Value) -> Result<Value, BoxError> + Send + Sync + 'static,
    ) -> Self {
        self.migrations.push(Arc::new(migration));
        self
    }
}

pub struct Collection<T> {
    inner: Arc<CollectionInner<T>>,
}

impl<T> Clone for Collection<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

pub(crate) struct CollectionInner<T> {
    name: String,
    context: Lapis,
    store: Arc<dyn DataStore>,
    schema: Schema<T>,
    default_data: T,
    registry: Mutex<HashMap<String, Slot<T>>>,
    stranded: Mutex<HashMap<String, String>>,
}

enum Slot<T> {
    Loading,
    Open(Document<T>),
}

/// Frees a `Loading` slot if the load does not finish (error or cancellation).
/// While `lock_held` is set the record may carry `lock_id`; dropping the slot
/// then keeps the id so the next load of `key` in this process reclaims it.
struct LoadingSlot<'a, T> {
    collection: &'a CollectionInner<T>,
    key: &'a str,
    lock_id: String,
    lock_held: bool,
    armed: bool,
}

impl<T> Drop for LoadingSlot<'_, T> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        lock(&self.collection.registry).remove(self.key);
        if self.lock_held {
            debug!(collection = %self.collection.name, key = self.key, "session lock kept for the next load");
            lock(&self.collection.stranded).insert(self.key.to_string(), self.lock_id.clone());
        }
    }
}

impl<T> LoadingSlot<'_, T>
where
    T: Serialize + DeserializeOwned + Clone + Send + Sync + 'static,
{
    async fn claim(&mut self, config: &Config) -> Result<Claim, Error> {
        let reclaimed = self.lock_held;
        self.lock_held = true;
        let claimed = self
            .collection
            .claim_with_retry(self.key, &self.lock_id, reclaimed, config)
            .await;
        if claimed.is_err() {
            self.lock_held = reclaimed;
        }
        claimed
    }

    async fn release(&mut self, config: &Config) {
        if self.collection.release(self.key, &self.lock_id, config).await {
            self.lock_held = false;
        }
    }
}

impl<T> Collection<T>
where
    T: Serialize + DeserializeOwned + Clone + Send + Sync + 'static,
{
    pub(crate) fn create(
        context: Lapis,
        name: String,
        store: Arc<dyn DataStore>,
        options: CollectionOptions<T>,
    ) -> Result<Self, Error> {
        let validate: Validator<T> = match options.validate {
            Some(validate) => validate,
            None => Arc::new(|_: &T| -> Result<(), BoxError> { Ok(()) }),
        };
        let schema = Schema::new(validate, options.migrations);
        schema.check(&options.default_data).map_err(|err| {
            err.with_hint("Default data must pass the collection's validator.")
        })?;
        schema.encode(&options.default_data)?;

        Ok(Self {
            inner: Arc::new(CollectionInner {
                name,
                context,
                store,
                schema,
                default_data: options.default_data,
                registry: Mutex::new(HashMap::new()),
                stranded: Mutex::new(HashMap::new()),
            }),
        })
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Locks, migrates, and validates the document stored at `key`.
    /// `user_ids` are associated with the key at its next save or close.
    pub async fn load(&self, key: &str, user_ids: &[u64]) -> Result<Document<T>, Error> {
        let config = self.inner.context.freeze();
        let mut slot = self.inner.reserve(key)?;

        let claim = slot.claim(&config).await?;
        let data = match self.inner.open_record(key, claim) {
            Ok(data) => data,
            Err(err) => {
                slot.release(&config).await;
                return Err(err);
            }
        };
        let document = Document::new(
            Arc::clone(&self.inner),
            key.to_string(),
            slot.lock_id.clone(),
            data,
            user_ids.to_vec(),
            config,
        );
        lock(&self.inner.registry).insert(key.to_string(), Slot::Open(document.clone()));
        slot.armed = false;
        debug!(collection = %self.inner.name, key, "document loaded");
        Ok(document)
    }

    /// Reads the stored data without taking the session lock.
    pub async fn read(&self, key: &str) -> Result<T, Error> {
        let config = self.inner.context.freeze();
        let stored = config
            .load_policy()
            .run("read", |_| async {
                self.inner.throttle(&config, RequestKind::Get).await;
                self.inner.store.get(key).await
            })
            .await
            .map_err(|err| err.with_key(key))?;
        let Some((value, _info)) = stored else {
            return Ok(self.inner.default_data.clone());
        };
        let record = Record::decode(&value).map_err(|err| err.with_key(key))?;
        self.inner
            .schema
            .upgrade(record.migration_version, record.data)
            .map_err(|err| err.with_key(key))
    }

    /// Deletes the stored record once its session lock can be taken.
    pub async fn remove(&self, key: &str) -> Result<(), Error> {
        let config = self.inner.context.freeze();
        let mut slot = self.inner.reserve(key)?;
        slot.claim(&config).await?;
        let removed = config
            .save_policy()
            .run("remove", |_| async {
                self.inner.throttle(&config, RequestKind::Remove).await;
                self.inner.store.remove(key).await
            })
            .await;
        if let Err(err) = removed {
            slot.release(&config).await;
            return Err(err.with_key(key));
        }
        slot.lock_held = false;
        debug!(collection = %self.inner.name, key, "record removed");
        Ok(())
    }

    /// Keys with an open document.
    pub fn open_keys(&self) -> Vec<String> {
        let registry = lock(&self.inner.registry);
        let mut keys: Vec<_> = registry
            .iter()
            .filter(|(_, slot)| matches!(slot, Slot::Open(_)))
            .map(|(key, _)| key.clone())
            .collect();
        keys.sort();
        keys
    }

    pub(crate) fn tracker(&self) -> Weak<dyn OpenDocuments> {
        let inner: Arc<dyn OpenDocuments> = self.inner.clone();
        Arc::downgrade(&inner)
    }
}

impl<T> CollectionInner<T>
where
    T: Serialize + DeserializeOwned + Clone + Send + Sync + 'static,
{
    pub(crate) fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn store(&self) -> &Arc<dyn DataStore> {
        &self.store
    }

    pub(crate) fn schema(&self) -> &Schema<T> {
        &self.schema
    }

    pub(crate) async fn throttle(&self, config: &Config, kind: RequestKind) {
        let remote = self.context.remote();
        Throttle::new(config.budget_poll_interval)
            .wait(|| remote.request_budget(kind))
            .await;
    }

    /// Drops a closed document from the registry. A lock id handed back here
    /// is still on the record and is reused by the next load of `key`.
    pub(crate) fn forget(&self, key: &str, stranded_lock: Option<String>) {
        lock(&self.registry).remove(key);
        if let Some(lock_id) = stranded_lock {
            warn!(collection = %self.name, key, "close failed; session lock kept for the next load");
            lock(&self.stranded).insert(key.to_string(), lock_id);
        }
    }

    fn reserve<'a>(&'a self, key: &'a str) -> Result<LoadingSlot<'a, T>, Error> {
        let mut registry = lock(&self.registry);
        if registry.contains_key(key) {
            return Err(Error::new(ErrorKind::AlreadyOpen)
                .with_message("document is already open in this process")
                .with_hint("Close the open document before loading it again.")
                .with_key(key));
        }
        registry.insert(key.to_string(), Slot::Loading);
        drop(registry);

        let mut slot = LoadingSlot {
            collection: self,
            key,
            lock_id: String::new(),
            lock_held: false,
            armed: true,
        };
        match lock(&self.stranded).remove(key) {
            Some(lock_id) => {
                slot.lock_id = lock_id;
                slot.lock_held = true;
            }
            None => slot.lock_id = lock::generate_lock_id()?,
        }
        Ok(slot)
    }

    /// Turns a claimed record into validated data.
    fn open_record(&self, key: &str, claim: Claim) -> Result<T, Error> {
        if !claim.existed {
            debug!(collection = %self.name, key, "new document; using default data");
            return Ok(self.default_data.clone());
        }
        let record = claim.record;
        self.schema
            .upgrade(record.migration_version, record.data)
            .map_err(|err| err.with_key(key))
    }

    async fn claim_with_retry(
        &self,
        key: &str,
        lock_id: &str,
        reclaimed: bool,
        config: &Config,
    ) -> Result<Claim, Error> {
        let claimed = config
            .load_policy()
            .run("acquire lock", |_| self.try_claim(key, lock_id, config))
            .await;
        match claimed {
            Ok(claim) => {
                debug!(collection = %self.name, key, reclaimed, "lock acquired");
                Ok(claim)
            }
            Err(err) => {
                let err = if is_retryable(err.kind()) && err.kind() != ErrorKind::LockUnavailable
                {
                    Error::wrap(ErrorKind::LockUnavailable, err)
                } else {
                    err
                };
                Err(err.with_key(key))
            }
        }
    }

    async fn try_claim(&self, key: &str, lock_id: &str, config: &Config) -> Result<Claim, Error> {
        self.throttle(config, RequestKind::Update).await;
        let version = self.schema.migration_count();
        let default_json = self.schema.encode(&self.default_data)?;
        let mut outcome: Option<Result<Claim, Error>> = None;
        let mut transform = |current: Option<&Value>, info: Option<&KeyInfo>| {
            let claimed = lock::claim(
                current,
                info.map(|info| info.updated_at_ms),
                lock_id,
                config.lock_expire,
                lock::now_unix_ms(),
                || Record::new(version, None, default_json.clone()),
            );
            let update = match claimed.as_ref().map(|claim| claim.record.encode()) {
                Ok(Ok(value)) => Update::Write {
                    value,
                    user_ids: info.map(|info| info.user_ids.clone()).unwrap_or_default(),
                },
                Ok(Err(err)) => {
                    outcome = Some(Err(err));
                    return Update::Abort;
                }
                Err(_) => Update::Abort,
            };
            outcome = Some(claimed);
            update
        };
        let written = self.store.update(key, &mut transform).await?;
        let claim = outcome.unwrap_or_else(|| {
            Err(Error::new(ErrorKind::Internal).with_message("store skipped the update transform"))
        })?;
        if written.is_none() {
            return Err(Error::new(ErrorKind::Remote).with_message("store dropped the lock write"));
        }
        Ok(claim)
    }

    /// Best-effort unlock after a failed load; an unreleased lock still expires.
    /// Returns whether the record no longer carries `lock_id`.
    async fn release(&self, key: &str, lock_id: &str, config: &Config) -> bool {
        let released = config
            .save_policy()
            .run("release lock", |_| async {
                self.throttle(config, RequestKind::Update).await;
                let mut transform = |current: Option<&Value>, info: Option<&KeyInfo>| {
                    match lock::release(current, lock_id).map(|record| record.map(|r| r.encode()))
                    {
                        Ok(Some(Ok(value))) => Update::Write {
                            value,
                            user_ids: info.map(|info| info.user_ids.clone()).unwrap_or_default(),
                        },
                        _ => Update::Abort,
                    }
                };
                self.store.update(key, &mut transform).await
            })
            .await;
        match released {
            Ok(_) => {
                debug!(collection = %self.name, key, "lock released after failed load");
                true
            }
            Err(err) => {
                warn!(collection = %self.name, key, error = %err, "failed to release lock");
                false
            }
        }
    }

    fn open_documents(&self) -> Vec<Document<T>> {
        lock(&self.registry)
            .values()
            .filter_map(|slot| match slot {
                Slot::Open(document) => Some(document.clone()),
                Slot::Loading => None,
            })
            .collect()
    }
}

#[async_trait]
impl<T> OpenDocuments for CollectionInner<T>
where
    T: Serialize + DeserializeOwned + Clone + Send + Sync + 'static,
{
    fn name(&self) -> &str {
        &self.name
    }

    async fn save_open(&self) -> (usize, Vec<Error>) {
        let mut saved = 0;
        let mut errors = Vec::new();
        for document in self.open_documents() {
            match document.save().await {
                Ok(()) => saved += 1,
                Err(err) if err.kind() == ErrorKind::Closed => {}
                Err(err) => errors.push(err),
            }
        }
        (saved, errors)
    }

    async fn close_open(&self) -> (usize, Vec<Error>) {
        let mut closed = 0;
        let mut errors = Vec::new();
        for document in self.open_documents() {
            match document.close().await {
                Ok(()) => closed += 1,
                Err(err) if err.kind() == ErrorKind::Closed => {}
                Err(err) => errors.push(err),
            }
        }
        (closed, errors)
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poison| poison.into_inner())
}
