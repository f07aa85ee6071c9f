//! Purpose: Define the stable public Rust API boundary for Lapis.
//! Exports: Context, collection, and document types plus the store adapters.
//! Role: Public, additive-only surface; hides lock and record internals.
//! Invariants: Documents are only reachable through `Collection::load`.
//! Invariants: Internal modules remain private and are not directly exposed.

mod autosave;
mod collection;
mod config;
mod document;
mod file_store;
mod memory;
mod store;

pub use crate::core::error::{Error, ErrorKind, to_exit_code};
pub use crate::core::retry::RetryPolicy;
pub use crate::core::schema::BoxError;
pub use autosave::AutosaveHandle;
pub use collection::{Collection, CollectionOptions};
pub use config::{Config, Lapis};
pub use document::Document;
pub use file_store::FileStore;
pub use memory::{MemoryStore, WriteLogEntry};
pub use store::{DataStore, KeyInfo, RemoteStore, RequestKind, StoreResult, Update, UpdateFn};
