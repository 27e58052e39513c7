//! Durable response caching partitioned into versioned namespaces.
//!
//! This module provides:
//! - Namespace naming (`<prefix>-<role>-<version>`) and role enumeration
//! - A storage trait with a SQLite backend and a no-op fallback
//! - The namespace manager used by the strategies: lookups, writes,
//!   expiration limits, stale-version purge and full clear

mod names;
mod namespace;
mod storage;

pub use names::{CacheNames, Role};
pub use namespace::{NamespaceManager, RoleLimits, REVISION_HEADER};
pub use storage::{CacheStorage, NoopStorage, SqliteStorage};
