use thiserror::Error;

/// Failures reported by external collaborators
#[derive(Error, Debug, Clone, PartialEq)]
pub enum PortError {
    /// Collaborator unreachable or timing out; worth one retry
    #[error("Service unavailable: {0}")]
    Unavailable(String),

    #[error("Not found: {0}")]
    NotFound(String),

    /// Exchange returned a fill that cannot be trusted (zero qty/price, rejected status)
    #[error("Invalid execution result: {0}")]
    InvalidExecutionResult(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Other error: {0}")]
    Other(String),
}

impl PortError {
    pub fn is_unavailable(&self) -> bool {
        matches!(self, PortError::Unavailable(_))
    }
}

pub type PortResult<T> = Result<T, PortError>;
