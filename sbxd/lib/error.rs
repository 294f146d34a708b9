use std::{
    error::Error,
    fmt::{self, Display},
};

use thiserror::Error;

use crate::orchestrator::OrchestratorError;

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// The result of an sbxd-related operation.
pub type SbxdResult<T> = Result<T, SbxdError>;

/// An error that occurred during a control-plane operation.
#[derive(Debug, Error)]
pub enum SbxdError {
    /// A caller-facing validation error, mapped to 400.
    #[error("validation error: {0}")]
    Validation(String),

    /// The sandbox pod did not become ready within the deadline, mapped to 409.
    #[error("sandbox not ready: {0}")]
    NotReady(String),

    /// A missing sandbox or exec record, mapped to 404.
    #[error("not found: {0}")]
    NotFound(String),

    /// A failure surfaced by the cluster orchestrator.
    #[error("orchestrator error: {0}")]
    Orchestrator(#[from] OrchestratorError),

    /// A configuration loading or parsing error.
    #[error("config error: {0}")]
    Config(String),

    /// An error that occurred when performing an IO operation.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// An error that occurred during JSON serialization.
    #[error("serialization error: {0}")]
    SerdeJson(#[from] serde_json::Error),

    /// Custom error.
    #[error(transparent)]
    Custom(#[from] AnyError),
}

/// An error that can represent any error.
#[derive(Debug)]
pub struct AnyError {
    error: anyhow::Error,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl SbxdError {
    /// Creates a new `Err` result.
    pub fn custom(error: impl Into<anyhow::Error>) -> SbxdError {
        SbxdError::Custom(AnyError {
            error: error.into(),
        })
    }
}

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

/// Creates an `Ok` `SbxdResult`.
#[allow(non_snake_case)]
pub fn Ok<T>(value: T) -> SbxdResult<T> {
    Result::Ok(value)
}

//--------------------------------------------------------------------------------------------------
// Trait Implementations
//--------------------------------------------------------------------------------------------------

impl Display for AnyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.error)
    }
}

impl Error for AnyError {}
