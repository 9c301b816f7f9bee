use agent_ports::PortError;
use analysis_core::AnalysisError;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum SignalError {
    #[error("Insufficient history: need {required} points, have {actual}")]
    InsufficientHistory { required: usize, actual: usize },

    #[error("Provider unavailable: {0}")]
    ProviderUnavailable(String),

    #[error("Could not extract a signal: {0}")]
    Extraction(String),

    #[error("Invalid signal: {0}")]
    InvalidSignal(String),
}

impl From<AnalysisError> for SignalError {
    fn from(err: AnalysisError) -> Self {
        match err {
            AnalysisError::InsufficientHistory { required, actual } => {
                SignalError::InsufficientHistory { required, actual }
            }
            AnalysisError::InvalidSignal(msg) => SignalError::InvalidSignal(msg),
            AnalysisError::InvalidData(msg) => SignalError::InvalidSignal(msg),
        }
    }
}

impl From<PortError> for SignalError {
    fn from(err: PortError) -> Self {
        SignalError::ProviderUnavailable(err.to_string())
    }
}
