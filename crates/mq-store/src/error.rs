//! Error types for store access

use std::path::PathBuf;
use thiserror::Error;

/// Result type for store operations
pub type StoreResult<T> = Result<T, StoreError>;

#[derive(Debug, Error)]
pub enum StoreError {
    /// The linked SQLite library cannot serialise access from several threads
    #[error("SQLite library is not thread safe (threadsafe mode {0})")]
    NotThreadSafe(i32),

    #[error("failed to open store {path}: {source}")]
    Open {
        path: PathBuf,
        #[source]
        source: rusqlite::Error,
    },

    #[error("migration '{name}' failed: {source}")]
    Migrate {
        name: &'static str,
        #[source]
        source: rusqlite::Error,
    },

    #[error("statement failed: {0}")]
    Sqlite(#[from] rusqlite::Error),
}
