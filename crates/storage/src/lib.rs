//! Job store abstraction and implementations for smartq.
//!
//! The engine talks to the store only through the [`Storage`] trait:
//! candidate queries, dependency lookups, conditional state transitions
//! and log appends. Two backends are provided, an in-process
//! [`MemoryStorage`] and a SQLite-backed `SqliteStorage`.

#![warn(missing_docs)]

pub mod trait_;
pub mod memory_storage;
#[cfg(feature = "sqlite")]
pub mod sqlite_storage;

pub use trait_::{InsertOutcome, Result, Storage, StorageError};
pub use memory_storage::MemoryStorage;
#[cfg(feature = "sqlite")]
pub use sqlite_storage::SqliteStorage;
