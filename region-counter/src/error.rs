use thiserror::Error;

/// Failure to turn bytes into a typed value (or back).
#[derive(Error, Debug)]
pub enum CodecError {
    #[error("invalid utf-8: {0}")]
    Utf8(#[from] std::str::Utf8Error),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("expected {expected} bytes for a long, got {actual}")]
    LongWidth { expected: usize, actual: usize },
    #[error("invalid decimal integer: {0}")]
    Decimal(#[from] std::num::ParseIntError),
}

/// A source message that could not be turned into a change record. These are
/// skipped without touching any pipeline state.
#[derive(Error, Debug)]
pub enum DecodeError {
    #[error("message has no key")]
    MissingKey,
    #[error("failed to decode key: {0}")]
    Key(#[source] CodecError),
    #[error("failed to decode value: {0}")]
    Value(#[source] CodecError),
}

/// The grouping attribute could not be derived from an otherwise valid record.
/// Records in this state are treated as non-qualifying, never as fatal.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum GroupingError {
    #[error("grouping attribute '{0}' is missing")]
    Missing(&'static str),
    #[error("grouping attribute '{0}' is not a string")]
    NotAString(&'static str),
    #[error("grouping attribute '{0}' is empty")]
    Empty(&'static str),
}

impl GroupingError {
    pub fn reason(&self) -> &'static str {
        match self {
            GroupingError::Missing(_) => "missing",
            GroupingError::NotAString(_) => "not_a_string",
            GroupingError::Empty(_) => "empty",
        }
    }
}

#[derive(Error, Debug)]
pub enum SinkError {
    #[error("transient sink failure: {0}")]
    Transient(String),
    #[error("fatal sink failure: {0}")]
    Fatal(String),
    #[error("sink retry budget exhausted after {attempts} attempts: {last}")]
    RetriesExhausted { attempts: usize, last: String },
}

impl SinkError {
    pub fn is_transient(&self) -> bool {
        matches!(self, SinkError::Transient(_))
    }
}

/// Invalid or missing configuration, always fatal at startup.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum ConfigError {
    #[error("required option {0} is empty")]
    Empty(&'static str),
    #[error("option {option} must be greater than zero")]
    NotPositive { option: &'static str },
    #[error("unknown {option} '{value}'")]
    UnknownFormat { option: &'static str, value: String },
    #[error("option {option} is invalid: {reason}")]
    Invalid {
        option: &'static str,
        reason: String,
    },
}

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error(transparent)]
    Sink(#[from] SinkError),
    #[error("pipeline was cancelled")]
    Cancelled,
    #[error("partition worker {stage}/{partition} stopped unexpectedly")]
    WorkerGone { stage: &'static str, partition: usize },
}
