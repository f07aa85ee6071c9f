//! Purpose: One key's in-memory data, session lock, and save/close state machine.
//! Exports: `Document`.
//! Role: The only mutation path for loaded data; serializes writes to the remote record.
//! Invariants: At most one remote write per document is in flight at any time.
//! Invariants: A save cycle writes the data present when the cycle starts, never older.
//! Invariants: `closed` flips once; the closing write persists and unlocks in one update.
//! Notes: Hooks run while the document state is locked; they must not call back into it.

use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};

use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::sync::oneshot;
use tracing::{debug, warn};

use super::collection::CollectionInner;
use super::config::Config;
use super::store::{KeyInfo, RequestKind, Update, merge_user_ids};
use crate::core::error::{CallbackError, Error, ErrorKind};
use crate::core::lock;
use crate::core::retry::is_retryable;
use crate::core::schema::{BoxError, isolate};

type Hook<T> = Box<dyn FnMut(&mut T) -> Result<(), BoxError> + Send>;
type Waiter = oneshot::Sender<Result<(), Error>>;

pub struct Document<T> {
    inner: Arc<DocumentInner<T>>,
}

impl<T> Clone for Document<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T> fmt::Debug for Document<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Document")
            .field("collection", &self.inner.collection_name)
            .field("key", &self.inner.key)
            .finish_non_exhaustive()
    }
}

struct DocumentInner<T> {
    collection: Arc<CollectionInner<T>>,
    collection_name: String,
    key: String,
    lock_id: String,
    config: Config,
    state: Mutex<DocState<T>>,
}

struct DocState<T> {
    data: T,
    closed: bool,
    /// A driver task owns the save loop.
    saving: bool,
    close_requested: bool,
    /// Callers satisfied by the next cycle.
    waiters: Vec<Waiter>,
    user_ids_add: Vec<u64>,
    user_ids_remove: Vec<u64>,
    before_save: Option<Hook<T>>,
    before_close: Option<Hook<T>>,
}

/// Work captured under the state lock at the start of a cycle.
struct Cycle {
    waiters: Vec<Waiter>,
    closing: bool,
    staged: Result<Staged, Error>,
}

struct Staged {
    value: Value,
    add: Vec<u64>,
    remove: Vec<u64>,
}

impl<T> Document<T>
where
    T: Serialize + DeserializeOwned + Clone + Send + Sync + 'static,
{
    pub(crate) fn new(
        collection: Arc<CollectionInner<T>>,
        key: String,
        lock_id: String,
        data: T,
        user_ids: Vec<u64>,
        config: Config,
    ) -> Self {
        let collection_name = collection.name().to_string();
        Self {
            inner: Arc::new(DocumentInner {
                collection,
                collection_name,
                key,
                lock_id,
                config,
                state: Mutex::new(DocState {
                    data,
                    closed: false,
                    saving: false,
                    close_requested: false,
                    waiters: Vec::new(),
                    user_ids_add: user_ids,
                    user_ids_remove: Vec::new(),
                    before_save: None,
                    before_close: None,
                }),
            }),
        }
    }

    pub fn key(&self) -> &str {
        &self.inner.key
    }

    pub fn is_closed(&self) -> bool {
        self.inner.state().closed
    }

    pub fn read(&self) -> Result<T, Error> {
        let state = self.inner.state();
        if state.closed {
            return Err(self.inner.closed_error());
        }
        Ok(state.data.clone())
    }

    /// Replaces the in-memory data once it passes the collection's validator.
    /// Nothing is sent to the store until the next save.
    pub fn write(&self, data: T) -> Result<(), Error> {
        if self.is_closed() {
            return Err(self.inner.closed_error());
        }
        self.inner
            .collection
            .schema()
            .check(&data)
            .map_err(|err| err.with_key(self.inner.key.as_str()))?;
        let mut state = self.inner.state();
        if state.closed {
            return Err(self.inner.closed_error());
        }
        state.data = data;
        Ok(())
    }

    /// Persists the current data. Calls made while a write is in flight share
    /// the outcome of the single write that follows it.
    pub async fn save(&self) -> Result<(), Error> {
        let outcome = self.inner.request(false)?;
        self.inner.wait(outcome).await
    }

    /// Final save followed by lock release. On failure the lock stays held
    /// and is reclaimed by the next `load` of this key in this process.
    pub async fn close(&self) -> Result<(), Error> {
        let outcome = self.inner.request(true)?;
        self.inner.wait(outcome).await
    }

    /// Runs on a copy of the data before every save and close; the copy is
    /// validated before it replaces the document's data. The hook runs while
    /// the document state is locked, so calling `read`, `write`, or any other
    /// method on this document (or a clone of it) from inside the hook deadlocks.
    pub fn before_save(
        &self,
        hook: impl FnMut(&mut T) -> Result<(), BoxError> + Send + 'static,
    ) -> Result<(), Error> {
        let mut state = self.inner.state();
        if state.before_save.is_some() {
            return Err(self.inner.hook_already_set("before_save"));
        }
        state.before_save = Some(Box::new(hook));
        Ok(())
    }

    /// Runs after the `before_save` hook on the closing save only. Like
    /// `before_save`, it must not call back into this document.
    pub fn before_close(
        &self,
        hook: impl FnMut(&mut T) -> Result<(), BoxError> + Send + 'static,
    ) -> Result<(), Error> {
        let mut state = self.inner.state();
        if state.before_close.is_some() {
            return Err(self.inner.hook_already_set("before_close"));
        }
        state.before_close = Some(Box::new(hook));
        Ok(())
    }

    /// Associates `user_id` with the key at the next save or close.
    pub fn add_user_id(&self, user_id: u64) -> Result<(), Error> {
        let mut state = self.inner.state();
        if state.closed {
            return Err(self.inner.closed_error());
        }
        state.user_ids_remove.retain(|id| *id != user_id);
        if !state.user_ids_add.contains(&user_id) {
            state.user_ids_add.push(user_id);
        }
        Ok(())
    }

    pub fn remove_user_id(&self, user_id: u64) -> Result<(), Error> {
        let mut state = self.inner.state();
        if state.closed {
            return Err(self.inner.closed_error());
        }
        state.user_ids_add.retain(|id| *id != user_id);
        if !state.user_ids_remove.contains(&user_id) {
            state.user_ids_remove.push(user_id);
        }
        Ok(())
    }
}

/// Resets the driver state if the `drive` task unwinds or is cancelled.
struct DriverGuard<'a, T>
where
    T: Serialize + DeserializeOwned + Clone + Send + Sync + 'static,
{
    inner: &'a DocumentInner<T>,
    finished: bool,
}

impl<T> Drop for DriverGuard<'_, T>
where
    T: Serialize + DeserializeOwned + Clone + Send + Sync + 'static,
{
    fn drop(&mut self) {
        if !self.finished {
            self.inner.abandon();
        }
    }
}

impl<T> DocumentInner<T>
where
    T: Serialize + DeserializeOwned + Clone + Send + Sync + 'static,
{
    fn state(&self) -> MutexGuard<'_, DocState<T>> {
        self.state.lock().unwrap_or_else(|poison| poison.into_inner())
    }

    fn closed_error(&self) -> Error {
        Error::new(ErrorKind::Closed)
            .with_message("document is closed")
            .with_hint("Load the key again to get a fresh document.")
            .with_key(self.key.as_str())
    }

    fn hook_already_set(&self, hook: &str) -> Error {
        Error::new(ErrorKind::AlreadySet)
            .with_message(format!("{hook} hook is already set"))
            .with_key(self.key.as_str())
    }

    /// Queues a caller for the next cycle and starts the driver when idle.
    fn request(
        self: &Arc<Self>,
        closing: bool,
    ) -> Result<oneshot::Receiver<Result<(), Error>>, Error> {
        let mut state = self.state();
        if state.closed {
            return Err(self.closed_error());
        }
        if closing {
            state.closed = true;
            state.close_requested = true;
        }
        let (sender, receiver) = oneshot::channel();
        state.waiters.push(sender);
        if !state.saving {
            state.saving = true;
            tokio::spawn(Arc::clone(self).drive());
        }
        Ok(receiver)
    }

    async fn wait(&self, outcome: oneshot::Receiver<Result<(), Error>>) -> Result<(), Error> {
        outcome.await.unwrap_or_else(|_| {
            Err(Error::new(ErrorKind::Internal)
                .with_message("save driver stopped before reporting")
                .with_key(self.key.as_str()))
        })
    }

    /// Runs cycles until no caller is waiting. Each cycle takes every queued
    /// caller, so saves requested mid-write coalesce into the next cycle.
    async fn drive(self: Arc<Self>) {
        let mut guard = DriverGuard {
            inner: &*self,
            finished: false,
        };
        while let Some(cycle) = self.begin_cycle() {
            let written = match cycle.staged {
                Ok(staged) => self.write_through(&staged, cycle.closing).await.map(|()| staged),
                Err(err) => Err(err),
            };
            self.finish_cycle(cycle.waiters, cycle.closing, written);
        }
        guard.finished = true;
    }

    /// Hands the save loop back after the driver stopped mid-cycle. Queued
    /// callers fail; a pending close strands the lock like any failed close.
    fn abandon(&self) {
        let mut state = self.state();
        state.saving = false;
        let waiters = std::mem::take(&mut state.waiters);
        let closing = state.close_requested;
        drop(state);

        warn!(collection = %self.collection_name, key = %self.key, "save driver stopped mid-cycle");
        if closing {
            self.collection.forget(&self.key, Some(self.lock_id.clone()));
        }
        let err = Error::new(ErrorKind::Internal)
            .with_message("save driver stopped before finishing")
            .with_hint("The store panicked or the runtime shut down; call save again.")
            .with_key(self.key.as_str());
        for waiter in waiters {
            let _ = waiter.send(Err(err.clone()));
        }
    }

    fn begin_cycle(&self) -> Option<Cycle> {
        let mut state = self.state();
        if state.waiters.is_empty() {
            state.saving = false;
            return None;
        }
        let waiters = std::mem::take(&mut state.waiters);
        let closing = state.close_requested;
        let staged = self.stage(&mut state, closing);
        Some(Cycle {
            waiters,
            closing,
            staged,
        })
    }

    /// Runs hooks on a copy of the data and commits the copy only if it validates.
    fn stage(&self, state: &mut DocState<T>, closing: bool) -> Result<Staged, Error> {
        let mut staged = state.data.clone();
        if let Some(hook) = state.before_save.as_mut() {
            isolate(|| hook(&mut staged))
                .map_err(|reason| self.hook_failed(ErrorKind::BeforeSaveFailed, "before_save", reason))?;
        }
        if closing && let Some(hook) = state.before_close.as_mut() {
            isolate(|| hook(&mut staged))
                .map_err(|reason| self.hook_failed(ErrorKind::BeforeCloseFailed, "before_close", reason))?;
        }

        let schema = self.collection.schema();
        schema.check(&staged).map_err(|err| {
            err.with_hint("Hooks must leave the document valid.")
                .with_key(self.key.as_str())
        })?;
        let value = schema.encode(&staged)?;
        state.data = staged;
        Ok(Staged {
            value,
            add: state.user_ids_add.clone(),
            remove: state.user_ids_remove.clone(),
        })
    }

    fn hook_failed(&self, kind: ErrorKind, hook: &str, reason: String) -> Error {
        Error::new(kind)
            .with_message(format!("{hook} hook failed: {reason}"))
            .with_key(self.key.as_str())
            .with_source(CallbackError(reason))
    }

    async fn write_through(&self, staged: &Staged, closing: bool) -> Result<(), Error> {
        let operation = if closing { "close" } else { "save" };
        debug!(collection = %self.collection_name, key = %self.key, operation, "save cycle started");
        self.config
            .save_policy()
            .run(operation, |_| self.write_once(staged, closing))
            .await
            .map_err(|err| {
                let err = if is_retryable(err.kind()) {
                    Error::wrap(ErrorKind::SaveFailed, err)
                        .with_hint("The document is still open; call save again later.")
                } else {
                    err
                };
                err.with_key(self.key.as_str())
            })
    }

    async fn write_once(&self, staged: &Staged, closing: bool) -> Result<(), Error> {
        self.collection
            .throttle(&self.config, RequestKind::Update)
            .await;
        let version = self.collection.schema().migration_count();
        let mut failure: Option<Error> = None;
        let mut transform = |current: Option<&Value>, info: Option<&KeyInfo>| {
            let record = lock::persist(current, &self.lock_id, version, staged.value.clone(), !closing)
                .and_then(|record| record.encode());
            match record {
                Ok(value) => {
                    failure = None;
                    let current_ids = info.map(|info| info.user_ids.as_slice()).unwrap_or(&[]);
                    Update::Write {
                        value,
                        user_ids: merge_user_ids(current_ids, &staged.add, &staged.remove),
                    }
                }
                Err(err) => {
                    failure = Some(err);
                    Update::Abort
                }
            }
        };
        let written = self
            .collection
            .store()
            .update(&self.key, &mut transform)
            .await?;
        if let Some(err) = failure {
            return Err(err);
        }
        if written.is_none() {
            return Err(Error::new(ErrorKind::Remote).with_message("store dropped the write"));
        }
        Ok(())
    }

    fn finish_cycle(&self, waiters: Vec<Waiter>, closing: bool, written: Result<Staged, Error>) {
        let outcome = match written {
            Ok(staged) => {
                let mut state = self.state();
                state.user_ids_add.retain(|id| !staged.add.contains(id));
                state.user_ids_remove.retain(|id| !staged.remove.contains(id));
                drop(state);
                if closing {
                    self.collection.forget(&self.key, None);
                    debug!(collection = %self.collection_name, key = %self.key, "document closed; lock released");
                } else {
                    debug!(collection = %self.collection_name, key = %self.key, "document saved");
                }
                Ok(())
            }
            Err(err) => {
                if closing {
                    let stranded = (err.kind() != ErrorKind::LockLost).then(|| self.lock_id.clone());
                    self.collection.forget(&self.key, stranded);
                }
                debug!(collection = %self.collection_name, key = %self.key, error = %err, "save cycle failed");
                Err(err)
            }
        };
        for waiter in waiters {
            let _ = waiter.send(outcome.clone());
        }
    }
}
