//! Purpose: Session-locked documents over a remote key-value store.
//! Exports: `api` (collections, documents, stores, config) and `core` (primitives).
//! Role: Library backing the `lapis` CLI and embedding applications.
//! Invariants: Only one process mutates a key at a time (remote session lock).
//! Invariants: Data is validated before it is held, written, or persisted.
pub mod api;
pub mod core;
