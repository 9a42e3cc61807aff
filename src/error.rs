use std::time::Duration;
use thiserror::Error;

use crate::frame::DataType;

pub type Result<T> = std::result::Result<T, Error>;

/// Which input table an error refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub enum Side {
    Left,
    Right,
}

impl std::fmt::Display for Side {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Side::Left => write!(f, "left"),
            Side::Right => write!(f, "right"),
        }
    }
}

#[derive(Error, Debug, Clone)]
pub enum Error {
    #[error("Invalid merge request: {0}")]
    InvalidRequest(String),

    #[error("Column '{column}' not found in {side} table")]
    ColumnNotFound { side: Side, column: String },

    #[error("Column '{column}' of type {data_type:?} cannot be used as a join key")]
    UnsupportedKeyType { column: String, data_type: DataType },

    #[error("Join key type mismatch: left '{left}' is {left_type:?}, right '{right}' is {right_type:?}")]
    TypeMismatch {
        left: String,
        left_type: DataType,
        right: String,
        right_type: DataType,
    },

    #[error("Skewed join: bucket {bucket} holds {rows} rows after {depth} radix digits (limit {threshold})")]
    SkewedJoin {
        bucket: u64,
        rows: usize,
        depth: usize,
        threshold: usize,
    },

    #[error("Duplicate join key on {side} side (rows {first_row} and {second_row})")]
    DuplicateKeyViolation {
        side: Side,
        first_row: usize,
        second_row: usize,
    },

    #[error("Task {task} in phase {phase} reported no progress for {waited:?} after {attempts} attempts")]
    StallTimeout {
        phase: String,
        task: usize,
        attempts: u32,
        waited: Duration,
    },

    #[error("Worker failure in task {task}: {message}")]
    WorkerFailure { task: usize, message: String },

    #[error("Merge cancelled")]
    Cancelled,

    #[error("Invalid table: {0}")]
    InvalidTable(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Illegal phase transition from {from} to {to}")]
    PhaseTransition { from: String, to: String },

    #[error("Table mismatch: {0}")]
    Mismatch(String),

    #[error("IO error: {0}")]
    Io(String),
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::Io(err.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Config(err.to_string())
    }
}

impl Error {
    pub fn error_code(&self) -> i32 {
        match self {
            Error::InvalidRequest(_) => -1,
            Error::ColumnNotFound { .. } => -2,
            Error::UnsupportedKeyType { .. } => -3,
            Error::TypeMismatch { .. } => -4,
            Error::SkewedJoin { .. } => -5,
            Error::DuplicateKeyViolation { .. } => -6,
            Error::StallTimeout { .. } => -7,
            Error::WorkerFailure { .. } => -8,
            Error::Cancelled => -9,
            Error::InvalidTable(_) => -10,
            Error::Config(_) => -11,
            Error::PhaseTransition { .. } => -12,
            Error::Mismatch(_) => -13,
            Error::Io(_) => -14,
        }
    }

    /// Whether re-running the failed task may succeed.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Error::WorkerFailure { .. })
    }

    /// Errors raised before any task is scheduled.
    pub fn is_validation_error(&self) -> bool {
        matches!(
            self,
            Error::InvalidRequest(_)
                | Error::ColumnNotFound { .. }
                | Error::UnsupportedKeyType { .. }
                | Error::TypeMismatch { .. }
                | Error::Config(_)
        )
    }

    /// Short label used for metrics and logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Error::InvalidRequest(_) => "invalid_request",
            Error::ColumnNotFound { .. } => "column_not_found",
            Error::UnsupportedKeyType { .. } => "unsupported_key_type",
            Error::TypeMismatch { .. } => "type_mismatch",
            Error::SkewedJoin { .. } => "skewed_join",
            Error::DuplicateKeyViolation { .. } => "duplicate_key",
            Error::StallTimeout { .. } => "stall_timeout",
            Error::WorkerFailure { .. } => "worker_failure",
            Error::Cancelled => "cancelled",
            Error::InvalidTable(_) => "invalid_table",
            Error::Config(_) => "config",
            Error::PhaseTransition { .. } => "phase_transition",
            Error::Mismatch(_) => "mismatch",
            Error::Io(_) => "io",
        }
    }
}
