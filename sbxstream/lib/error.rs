use std::{
    error::Error,
    fmt::{self, Display},
};

use thiserror::Error;

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// The result of an sbxstream-related operation.
pub type SbxStreamResult<T> = Result<T, SbxStreamError>;

/// An error that occurred while tailing or forwarding exec events.
#[derive(Debug, Error)]
pub enum SbxStreamError {
    /// An error that occurred when performing an IO operation.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// A WebSocket transport error; the caller reconnects.
    #[error("websocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    /// The configured ingest endpoint could not be turned into a URL.
    #[error("invalid stream endpoint: {0}")]
    InvalidEndpoint(String),

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

impl SbxStreamError {
    /// Creates a new `Err` result.
    pub fn custom(error: impl Into<anyhow::Error>) -> SbxStreamError {
        SbxStreamError::Custom(AnyError {
            error: error.into(),
        })
    }
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
