use std::path::PathBuf;
use thiserror::Error;

/// Failures of the pipeline state store.
#[derive(Error, Debug)]
pub enum DatabaseError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// Creating the database directory failed.
    #[error("Cannot prepare database path '{path}': {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Schema migration {version} failed: {reason}")]
    Migration { version: u32, reason: String },

    /// A stored status or mode string no longer maps to a known variant.
    #[error("Invalid value in column '{column}': {reason}")]
    InvalidValue { column: String, reason: String },

    #[error("{entity} '{id}' not found")]
    NotFound { entity: &'static str, id: String },

    #[error("Database lock poisoned")]
    LockPoisoned,
}
