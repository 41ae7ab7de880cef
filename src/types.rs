/// Core types shared across the sandrun supervisor
use thiserror::Error;

/// Verdict status values understood by callers.
///
/// `exited` and `killed` originate in the spawner's exit report; the limit
/// statuses are produced by the supervisor itself. The `sys.` prefix is
/// reserved for future supervisor-generated statuses and may not appear in a
/// sandboxed program's self-report.
pub const STATUS_EXITED: &str = "exited";
pub const STATUS_KILLED: &str = "killed";
pub const STATUS_MEMORY_LIMIT: &str = "memoryLimit";
pub const STATUS_PIDS_LIMIT: &str = "pidsLimit";
pub const STATUS_TIME_LIMIT: &str = "timeLimit";
pub const STATUS_FILE_LIMIT: &str = "fileLimit";
pub const STATUS_INTERNAL_ERROR: &str = "internalError";
pub const STATUS_REQUEST_INVALID: &str = "requestInvalid";
pub const STATUS_RESPONSE_TOO_BIG: &str = "responseTooBig";
pub const STATUS_STATUS_INVALID: &str = "statusInvalid";
pub const STATUS_PIPE_LIMIT: &str = "pipeLimit";

/// Status prefix reserved for supervisor-generated verdicts.
pub const RESERVED_STATUS_PREFIX: &str = "sys.";

/// Custom error types for the supervisor
#[derive(Error, Debug)]
pub enum SupervisorError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Request error: {0}")]
    Request(String),

    #[error("Channel error: {0}")]
    Channel(String),

    #[error("Forwarding error: {0}")]
    Forward(String),

    #[error("Response error: {0}")]
    Response(String),
}

/// Result type alias for supervisor operations
pub type Result<T> = std::result::Result<T, SupervisorError>;
