//! Purpose: Define the remote key-value store boundary consumed by collections.
//! Exports: `RemoteStore`, `DataStore`, `KeyInfo`, `Update`, `UpdateFn`, `RequestKind`.
//! Role: Adapter seam; the document layer never talks to a backend directly.
//! Invariants: `update` runs the transform against the value it is about to replace.
//! Invariants: A transform returning `Update::Abort` leaves the record untouched.
//! Notes: Backends may call a transform more than once before committing.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::core::error::Error;

pub type StoreResult<T> = Result<T, Error>;

/// Metadata the backend keeps next to every value.
#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KeyInfo {
    pub version: String,
    pub created_at_ms: u64,
    pub updated_at_ms: u64,
    pub user_ids: Vec<u64>,
}

#[derive(Clone, Debug, PartialEq)]
pub enum Update {
    Write { value: Value, user_ids: Vec<u64> },
    Abort,
}

pub type UpdateFn<'a> = &'a mut (dyn FnMut(Option<&Value>, Option<&KeyInfo>) -> Update + Send);

#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum RequestKind {
    Get,
    Update,
    Remove,
}

/// Factory for named stores plus the request budget used to pace calls.
#[async_trait]
pub trait RemoteStore: Send + Sync {
    fn open(&self, name: &str) -> StoreResult<Arc<dyn DataStore>>;

    /// Requests that may be issued right now without being throttled.
    async fn request_budget(&self, kind: RequestKind) -> u32;
}

#[async_trait]
pub trait DataStore: Send + Sync {
    async fn get(&self, key: &str) -> StoreResult<Option<(Value, KeyInfo)>>;

    /// Returns `None` when the transform aborted.
    async fn update(&self, key: &str, transform: UpdateFn<'_>)
    -> StoreResult<Option<(Value, KeyInfo)>>;

    async fn remove(&self, key: &str) -> StoreResult<Option<Value>>;
}

/// Merges `add` into `current` and drops everything in `remove`, keeping first-seen order.
pub(crate) fn merge_user_ids(current: &[u64], add: &[u64], remove: &[u64]) -> Vec<u64> {
    let mut out = Vec::with_capacity(current.len() + add.len());
    for id in current.iter().chain(add) {
        if !remove.contains(id) && !out.contains(id) {
            out.push(*id);
        }
    }
    out
}
