//! Versioned request/response cache stores.
//!
//! This module provides the storage half of the worker:
//! - Named stores of request -> response snapshots, keyed by method + URL
//! - A static/dynamic store pair per build generation
//! - SQLite persistence that survives restarts, and a no-op backend for
//!   running with caching disabled

mod generation;
mod storage;
mod traits;

pub use generation::Generation;
pub use storage::{NoopStorage, SqliteStorage};
pub use traits::{CacheStore, CachedResponse, RequestKey, Served, ServedFrom};

#[cfg(test)]
pub use storage::faulty::FaultyStorage;
