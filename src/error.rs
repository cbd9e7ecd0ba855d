use thiserror::Error as ThisError;

/// Retry classification used by the administrative command runner.
pub trait IsRetryable {
    fn is_retryable(&self) -> bool;
}

#[derive(Debug, ThisError)]
pub enum BranchError {
    /// Missing or inconsistent strategy configuration. Surfaced immediately,
    /// never retried.
    #[error("configuration error: {0}")]
    Config(String),

    /// Malformed input rejected before any resource is touched.
    #[error("validation error: {0}")]
    Validation(String),

    /// A short-lived administrative command exited non-zero.
    #[error("command `{command}` exited with status {status}: {stderr}")]
    CommandFailed {
        command: String,
        status: i32,
        stderr: String,
    },

    /// A short-lived administrative command exceeded its bounded timeout.
    #[error("command `{command}` timed out after {secs}s")]
    CommandTimeout { command: String, secs: u64 },

    /// Dataset destruction failed. The only cleanup step that is not
    /// best-effort: a still-mounted dataset must never be treated as deleted.
    #[error("failed to destroy dataset {dataset}: {detail}")]
    DatasetDestroy { dataset: String, detail: String },

    /// Every port in the scanned range was taken.
    #[error("no free port in range {start}-{end}")]
    PortsExhausted { start: u16, end: u16 },

    /// The branch-port lock could not be acquired within the bounded wait.
    #[error("branch port lock acquisition timed out")]
    PortLockTimeout,

    /// No ready restore exists to clone a branch from.
    #[error("no ready restore available")]
    NoReadyRestore,

    #[error("restore {0} not found")]
    RestoreNotFound(i64),

    #[error("branch {0} not found")]
    BranchNotFound(String),

    /// Restores owning branches refuse deletion.
    #[error("restore {id} still owns {count} branch(es)")]
    RestoreHasBranches { id: i64, count: i64 },

    /// The background operation reported failure. Carries a trailing log
    /// excerpt for diagnosis; never auto-retried.
    #[error("restore operation {name} failed:\n{excerpt}")]
    ProcessFailed { name: String, excerpt: String },

    /// The background operation exited without writing a sentinel. Treated
    /// as a crash, fatal.
    #[error("restore operation {name} exited without reporting an outcome")]
    ProcessUnknown { name: String },

    /// Anonymization failed after the restore itself succeeded. Blocks
    /// readiness but preserves the restored data.
    #[error("anonymization of table {table} failed: {detail}")]
    Anonymization { table: String, detail: String },

    /// The clone announced a different port than the one allocated.
    #[error("port mismatch: allocated {expected}, clone announced {actual}")]
    PortMismatch { expected: u16, actual: u16 },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Ractor error: {0}")]
    Ractor(String),
}

impl IsRetryable for BranchError {
    fn is_retryable(&self) -> bool {
        match self {
            BranchError::CommandFailed { .. }
            | BranchError::CommandTimeout { .. }
            | BranchError::Io(_) => true,
            // Process outcomes, configuration and validation errors are
            // never retried.
            _ => false,
        }
    }
}
