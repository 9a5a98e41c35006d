use thiserror::Error;

/// Typed errors at the engine's internal seams. CLI-level callers are free
/// to keep using `anyhow`; collaborators that need to match on failure kind
/// (a future HTTP layer, tests) get this instead.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("schema migration refused to apply: {0}")]
    MigrationConflict(String),

    #[error("a scan is already running (scan id {0})")]
    ScanAlreadyRunning(i64),

    #[error("no such scan: {0}")]
    ScanNotFound(i64),

    #[error("invariant violation: {0}")]
    InvariantViolation(String),

    #[error("path is not absolute or contains `..`: {0}")]
    InvalidPath(String),

    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, EngineError>;
