use std::fmt;

use serde_json::Value;

/// Errors returned by jq operations.
#[derive(Debug)]
pub enum JqError {
    /// Failed to locate or load the native library
    SetupFailed(String),
    /// `jq_init` returned a null state
    InitFailed,
    /// A value was not of the kind an operation requires
    WrongType(String),
    /// The program did not compile; holds every diagnostic libjq reported
    CompileFailed(Vec<String>),
    /// `execute` was called before a program was compiled
    NotCompiled,
    /// libjq could not parse the given JSON text
    InvalidJson(String),
    /// The program raised an uncaught error while running. `outputs` holds
    /// what it produced before the error.
    ExecutionFailed { message: String, outputs: Vec<Value> },
    /// An error libjq reported through the error callback of a stream
    Reported(String),
    /// Operation failed with an error message
    OperationFailed(String),
    /// JSON serialization/deserialization error
    JsonError(String),
}

impl fmt::Display for JqError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JqError::SetupFailed(msg) => write!(f, "library setup failed: {}", msg),
            JqError::InitFailed => write!(f, "jq_init returned null (out of memory?)"),
            JqError::WrongType(msg) => write!(f, "wrong type: {}", msg),
            JqError::CompileFailed(errors) => {
                write!(f, "compile failed: {}", errors.join("; "))
            }
            JqError::NotCompiled => write!(f, "no program has been compiled"),
            JqError::InvalidJson(msg) => write!(f, "invalid JSON: {}", msg),
            JqError::ExecutionFailed { message, .. } => write!(f, "execution failed: {}", message),
            JqError::Reported(msg) => write!(f, "{}", msg),
            JqError::OperationFailed(msg) => write!(f, "operation failed: {}", msg),
            JqError::JsonError(msg) => write!(f, "JSON error: {}", msg),
        }
    }
}

impl std::error::Error for JqError {}

impl From<serde_json::Error> for JqError {
    fn from(e: serde_json::Error) -> Self {
        JqError::JsonError(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, JqError>;
