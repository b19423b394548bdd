use std::fmt;

use thiserror::Error;

// Use .user_error() to inject an operator facing message into an error chain.
// The binary extracts it from the chain and prints it instead of the raw cause.
#[derive(Error, Debug, Clone)]
#[error("User Error: {msg}")]
pub struct UserError {
    pub msg: String,
}

impl UserError {
    pub fn new(msg: impl Into<String>) -> Self {
        Self { msg: msg.into() }
    }
}

pub trait ToUserError<T> {
    fn user_error(self, msg: impl Into<String>) -> anyhow::Result<T>;
}

impl<T, E: std::error::Error + Send + Sync + 'static> ToUserError<T> for Result<T, E> {
    fn user_error(self, msg: impl Into<String>) -> anyhow::Result<T> {
        self.map_err(|e| anyhow::Error::from(e).context(UserError::new(msg)))
    }
}

pub fn get_user_message(error: &anyhow::Error) -> &str {
    for cause in error.chain() {
        if let Some(user_error) = cause.downcast_ref::<UserError>() {
            return &user_error.msg;
        }
    }
    "An unknown error occurred"
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ValidationReason {
    Missing,
    Malformed(String),
}

impl fmt::Display for ValidationReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ValidationReason::Missing => write!(f, "missing"),
            ValidationReason::Malformed(detail) => write!(f, "malformed ({detail})"),
        }
    }
}

/// A single input record failed required-field validation. `line` is the
/// 1-based line (JSONL, CSV) or array position (JSON) of the offending record.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("record at line {line}: field '{field}' is {reason}")]
pub struct RecordValidationError {
    pub line: usize,
    pub field: String,
    pub reason: ValidationReason,
}

impl RecordValidationError {
    pub fn missing(line: usize, field: impl Into<String>) -> Self {
        Self {
            line,
            field: field.into(),
            reason: ValidationReason::Missing,
        }
    }

    pub fn malformed(line: usize, field: impl Into<String>, detail: impl Into<String>) -> Self {
        Self {
            line,
            field: field.into(),
            reason: ValidationReason::Malformed(detail.into()),
        }
    }
}

#[derive(Error, Debug)]
pub enum ParseError {
    #[error("failed to read input: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid JSON at line {line}: {source}")]
    Json {
        line: usize,
        #[source]
        source: serde_json::Error,
    },
    #[error("invalid CSV: {0}")]
    Csv(#[from] csv::Error),
    #[error("expected {expected} at line {line}")]
    UnexpectedShape { line: usize, expected: &'static str },
    #[error(transparent)]
    Validation(#[from] RecordValidationError),
}

#[derive(Error, Debug)]
pub enum DatastoreError {
    // Connection loss or timeout. Never retried here.
    #[error("datastore unavailable: {0}")]
    Unavailable(String),
    #[error("index {0} not found")]
    IndexNotFound(String),
    #[error("datastore rejected {operation} with status {status}: {body}")]
    Rejected {
        operation: &'static str,
        status: u16,
        body: String,
    },
    #[error("datastore reported {failed} failed items during {operation}")]
    PartialFailure {
        operation: &'static str,
        failed: usize,
    },
    #[error("could not (de)serialize datastore payload: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl From<reqwest::Error> for DatastoreError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_connect() || e.is_timeout() || e.is_request() {
            DatastoreError::Unavailable(e.to_string())
        } else {
            DatastoreError::Rejected {
                operation: "request",
                status: e.status().map(|s| s.as_u16()).unwrap_or_default(),
                body: e.to_string(),
            }
        }
    }
}

/// A bulk write failed. Records flushed before this batch remain in the index,
/// the failed batch and anything still buffered are lost.
#[derive(Error, Debug)]
#[error("flush of {batch_size} records failed after {committed} were committed: {source}")]
pub struct FlushError {
    pub batch_size: usize,
    pub committed: u64,
    #[source]
    pub source: DatastoreError,
}

#[derive(Error, Debug)]
pub enum RegistryError {
    #[error("Sqlx error: {0}")]
    Sqlx(#[from] sqlx::Error),
    #[error("Migration error: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),
    #[error("{entity} {id} does not exist")]
    NotFound { entity: &'static str, id: i64 },
    #[error("dependents changed since the deletion was planned")]
    DependentsChanged,
}

#[derive(Error, Debug)]
pub enum LifecycleError {
    #[error("no such index: {0}")]
    IndexNotFound(String),
    #[error("index {0} already exists and appending is disabled")]
    IndexAlreadyManaged(String),
    #[error("deletion plan for {0} is stale, plan again before committing")]
    StalePlan(String),
    #[error("registrations for {index} were deleted but the index itself could not be removed, delete it by hand: {source}")]
    OrphanedIndex {
        index: String,
        #[source]
        source: DatastoreError,
    },
    #[error(transparent)]
    Registry(#[from] RegistryError),
    #[error(transparent)]
    Datastore(#[from] DatastoreError),
}

impl From<sqlx::Error> for LifecycleError {
    fn from(e: sqlx::Error) -> Self {
        LifecycleError::Registry(e.into())
    }
}

#[derive(Error, Debug)]
pub enum IngestError {
    #[error("invalid flush interval {0}, must be between 1 and 1000000")]
    InvalidFlushInterval(usize),
    #[error(transparent)]
    Parse(#[from] ParseError),
    #[error(transparent)]
    Flush(#[from] FlushError),
    #[error(transparent)]
    Lifecycle(#[from] LifecycleError),
    #[error("record producer stopped unexpectedly: {0}")]
    Producer(String),
}

impl From<DatastoreError> for IngestError {
    fn from(e: DatastoreError) -> Self {
        IngestError::Lifecycle(e.into())
    }
}

#[derive(Error, Debug)]
pub enum SimilarityError {
    #[error("invalid similarity config: {0}")]
    InvalidConfig(String),
    #[error("signature computation did not complete")]
    WorkerLost,
    #[error(transparent)]
    Datastore(#[from] DatastoreError),
}
