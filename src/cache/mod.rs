//! Named cache store for request/response pairs.
//!
//! - Entries are keyed by request identity (method + URL, fragment dropped)
//! - A `put` for an existing identity replaces the old entry
//! - Backends: SQLite on disk, or a process-local map
//! - `addAll`-style bulk inserts are all-or-nothing

mod named;
mod storage;
mod traits;

pub use named::{Caches, NamedCache};
pub use storage::{CacheStorage, MemoryStorage, SqliteStorage};
pub use traits::{CacheResult, CacheSource, CachedResponse, RequestKey};
