use thiserror::Error;

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// The result of an orchestrator operation.
pub type OrchestratorResult<T> = Result<T, OrchestratorError>;

/// The failure taxonomy surfaced by the cluster orchestrator.
///
/// Background loops treat `Transient` as retry-on-next-tick; the warm-claim
/// path treats `Conflict` as "another claimer won, try the next candidate".
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum OrchestratorError {
    /// The requested object does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// The object already exists. `ensure_*` operations swallow this.
    #[error("already exists: {0}")]
    AlreadyExists(String),

    /// A conditional update lost against a concurrent writer.
    #[error("conflict: {0}")]
    Conflict(String),

    /// The operation ran past its deadline.
    #[error("deadline exceeded")]
    Deadline,

    /// The remote process exited with a non-zero code.
    #[error("command exited with code {code}")]
    ExitCode {
        /// The remote process exit code.
        code: i32,
    },

    /// A network or API error that is worth retrying.
    #[error("transient orchestrator error: {0}")]
    Transient(String),

    /// An error retries will not fix.
    #[error("orchestrator error: {0}")]
    Permanent(String),
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl OrchestratorError {
    /// Whether this is a missing-object error.
    pub fn is_not_found(&self) -> bool {
        matches!(self, OrchestratorError::NotFound(_))
    }

    /// Whether this is a lost conditional update.
    pub fn is_conflict(&self) -> bool {
        matches!(self, OrchestratorError::Conflict(_))
    }

    /// The typed remote exit code, when this error carries one.
    pub fn exit_code(&self) -> Option<i32> {
        match self {
            OrchestratorError::ExitCode { code } => Some(*code),
            _ => None,
        }
    }
}
