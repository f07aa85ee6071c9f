//! Purpose: Process-wide settings and the `Lapis` context that owns the remote store.
//! Exports: `Config`, `Lapis`.
//! Role: Entry point: inject a `RemoteStore`, tune retries, create collections.
//! Invariants: Configuration is frozen by the first `load`; later `set_config` calls fail.
//! Invariants: Collection names are unique per context.
//! Notes: Documents keep the configuration snapshot taken when they were loaded.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::debug;

use super::collection::{Collection, CollectionOptions};
use super::store::RemoteStore;
use crate::core::error::{Error, ErrorKind};
use crate::core::retry::RetryPolicy;

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Config {
    /// Attempts per save or close write.
    pub save_attempts: u32,
    pub save_retry_delay: Duration,
    /// Attempts to acquire the session lock during `load`.
    pub load_attempts: u32,
    pub load_retry_delay: Duration,
    pub show_retry_warnings: bool,
    /// Age after which a lock whose holder stopped saving may be taken over.
    pub lock_expire: Duration,
    pub budget_poll_interval: Duration,
}

impl Config {
    pub fn new() -> Self {
        Self {
            save_attempts: 5,
            save_retry_delay: Duration::from_secs(1),
            load_attempts: 20,
            load_retry_delay: Duration::from_secs(1),
            show_retry_warnings: true,
            lock_expire: Duration::from_secs(30 * 60),
            budget_poll_interval: Duration::from_millis(100),
        }
    }

    pub fn validate(&self) -> Result<(), Error> {
        if self.save_attempts == 0 {
            return Err(Error::new(ErrorKind::Usage).with_message("save_attempts must be at least 1"));
        }
        if self.load_attempts == 0 {
            return Err(Error::new(ErrorKind::Usage).with_message("load_attempts must be at least 1"));
        }
        if self.lock_expire.is_zero() {
            return Err(Error::new(ErrorKind::Usage).with_message("lock_expire must be positive"));
        }
        Ok(())
    }

    pub(crate) fn load_policy(&self) -> RetryPolicy {
        RetryPolicy::new(self.load_attempts, self.load_retry_delay)
            .with_warnings(self.show_retry_warnings)
    }

    pub(crate) fn save_policy(&self) -> RetryPolicy {
        RetryPolicy::new(self.save_attempts, self.save_retry_delay)
            .with_warnings(self.show_retry_warnings)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self::new()
    }
}

/// Type-erased view of a collection's open documents, used for sweeps.
#[async_trait]
pub(crate) trait OpenDocuments: Send + Sync {
    fn name(&self) -> &str;

    /// Saves every open document; returns how many saved and the failures.
    async fn save_open(&self) -> (usize, Vec<Error>);

    async fn close_open(&self) -> (usize, Vec<Error>);
}

#[derive(Clone)]
pub struct Lapis {
    inner: Arc<LapisInner>,
}

struct LapisInner {
    store: Arc<dyn RemoteStore>,
    config: RwLock<Config>,
    frozen: AtomicBool,
    collections: Mutex<Vec<Weak<dyn OpenDocuments>>>,
}

impl Lapis {
    pub fn new(store: impl RemoteStore + 'static) -> Self {
        Self::from_shared(Arc::new(store))
    }

    pub fn from_shared(store: Arc<dyn RemoteStore>) -> Self {
        Self {
            inner: Arc::new(LapisInner {
                store,
                config: RwLock::new(Config::new()),
                frozen: AtomicBool::new(false),
                collections: Mutex::new(Vec::new()),
            }),
        }
    }

    pub fn with_config(self, config: Config) -> Result<Self, Error> {
        self.set_config(config)?;
        Ok(self)
    }

    /// Replaces the configuration. Changing it once documents have started
    /// loading would leave them on mixed retry settings, so it is refused.
    pub fn set_config(&self, config: Config) -> Result<(), Error> {
        config.validate()?;
        let mut current = self
            .inner
            .config
            .write()
            .unwrap_or_else(|poison| poison.into_inner());
        if self.inner.frozen.load(Ordering::SeqCst) {
            return Err(Error::new(ErrorKind::Usage)
                .with_message("configuration cannot change after the first load")
                .with_hint("Call set_config before loading any document."));
        }
        *current = config;
        Ok(())
    }

    pub fn config(&self) -> Config {
        self.inner
            .config
            .read()
            .unwrap_or_else(|poison| poison.into_inner())
            .clone()
    }

    pub fn create_collection<T>(
        &self,
        name: impl Into<String>,
        options: CollectionOptions<T>,
    ) -> Result<Collection<T>, Error>
    where
        T: Serialize + DeserializeOwned + Clone + Send + Sync + 'static,
    {
        let name = name.into();
        let mut collections = self
            .inner
            .collections
            .lock()
            .unwrap_or_else(|poison| poison.into_inner());
        collections.retain(|entry| entry.strong_count() > 0);
        let taken = collections
            .iter()
            .filter_map(Weak::upgrade)
            .any(|collection| collection.name() == name);
        if taken {
            return Err(Error::new(ErrorKind::AlreadyExists)
                .with_message(format!("collection {name:?} already exists")));
        }

        let store = self.inner.store.open(&name)?;
        let collection = Collection::create(self.clone(), name, store, options)?;
        collections.push(collection.tracker());
        debug!(collection = collection.name(), "collection created");
        Ok(collection)
    }

    /// Saves every open document of every collection in this context.
    pub async fn save_all(&self) -> Result<usize, Error> {
        let mut saved = 0;
        let mut first_error = None;
        for collection in self.live_collections() {
            let (count, errors) = collection.save_open().await;
            saved += count;
            if first_error.is_none() {
                first_error = errors.into_iter().next();
            }
        }
        match first_error {
            Some(err) => Err(err),
            None => Ok(saved),
        }
    }

    /// Closes every open document, attempting all before reporting the first failure.
    pub async fn close_all(&self) -> Result<usize, Error> {
        let mut closed = 0;
        let mut first_error = None;
        for collection in self.live_collections() {
            let (count, errors) = collection.close_open().await;
            closed += count;
            if first_error.is_none() {
                first_error = errors.into_iter().next();
            }
        }
        match first_error {
            Some(err) => Err(err),
            None => Ok(closed),
        }
    }

    pub(crate) fn remote(&self) -> &Arc<dyn RemoteStore> {
        &self.inner.store
    }

    /// Freezes the configuration and returns the snapshot loads run with.
    pub(crate) fn freeze(&self) -> Config {
        let config = self
            .inner
            .config
            .read()
            .unwrap_or_else(|poison| poison.into_inner());
        self.inner.frozen.store(true, Ordering::SeqCst);
        config.clone()
    }

    fn live_collections(&self) -> Vec<Arc<dyn OpenDocuments>> {
        self.inner
            .collections
            .lock()
            .unwrap_or_else(|poison| poison.into_inner())
            .iter()
            .filter_map(Weak::upgrade)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::{Config, Lapis};
    use crate::api::{CollectionOptions, MemoryStore};
    use crate::core::error::ErrorKind;
    use serde_json::{Value, json};
    use std::time::Duration;

    #[test]
    fn defaults_are_valid() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.load_attempts, 20);
        assert_eq!(config.lock_expire, Duration::from_secs(1800));
    }

    #[test]
    fn zero_attempts_are_rejected() {
        let config = Config {
            save_attempts: 0,
            ..Config::default()
        };
        let err = Lapis::new(MemoryStore::new())
            .with_config(config)
            .err()
            .expect("err");
        assert_eq!(err.kind(), ErrorKind::Usage);
    }

    #[tokio::test]
    async fn config_freezes_after_first_load() {
        let lapis = Lapis::new(MemoryStore::new());
        lapis
            .set_config(Config {
                load_attempts: 2,
                ..Config::default()
            })
            .expect("config");
        let collection = lapis
            .create_collection("things", CollectionOptions::new(json!({})))
            .expect("collection");
        let _document = collection.load("a", &[]).await.expect("load");

        let err = lapis.set_config(Config::default()).expect_err("frozen");
        assert_eq!(err.kind(), ErrorKind::Usage);
        assert_eq!(lapis.config().load_attempts, 2);
    }

    #[test]
    fn collection_names_are_unique() {
        let lapis = Lapis::new(MemoryStore::new());
        let _first = lapis
            .create_collection("players", CollectionOptions::new(Value::Null))
            .expect("first");
        let err = lapis
            .create_collection("players", CollectionOptions::new(Value::Null))
            .err()
            .expect("duplicate");
        assert_eq!(err.kind(), ErrorKind::AlreadyExists);
    }

    #[test]
    fn dropped_collection_frees_its_name() {
        let lapis = Lapis::new(MemoryStore::new());
        let first = lapis
            .create_collection("players", CollectionOptions::new(Value::Null))
            .expect("first");
        drop(first);
        assert!(
            lapis
                .create_collection("players", CollectionOptions::new(Value::Null))
                .is_ok()
        );
    }
}
