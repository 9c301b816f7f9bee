use agent_ports::PortError;
use signal_providers::SignalError;
use thiserror::Error;

/// Failure of one agent's pipeline run. Risk vetoes travel through here so
/// the pipeline can short-circuit with `?`; they are reported as outcomes,
/// not failures.
#[derive(Error, Debug)]
pub enum TradingError {
    #[error("Insufficient history: need {required} points, have {actual}")]
    InsufficientHistory { required: usize, actual: usize },

    #[error("Provider unavailable: {0}")]
    ProviderUnavailable(String),

    #[error("Invalid execution result: {0}")]
    InvalidExecutionResult(String),

    #[error("Risk rejected: {reason}")]
    RiskRejected { reason: String, critical: bool },

    #[error("Critical risk trip: {0}")]
    CriticalRiskTrip(String),

    #[error("Sizing failed: {0}")]
    Sizing(String),

    #[error("Signal error: {0}")]
    Signal(String),

    #[error(transparent)]
    Port(PortError),
}

impl From<PortError> for TradingError {
    fn from(err: PortError) -> Self {
        match err {
            PortError::Unavailable(msg) => TradingError::ProviderUnavailable(msg),
            PortError::InvalidExecutionResult(msg) => TradingError::InvalidExecutionResult(msg),
            other => TradingError::Port(other),
        }
    }
}

impl From<SignalError> for TradingError {
    fn from(err: SignalError) -> Self {
        match err {
            SignalError::InsufficientHistory { required, actual } => {
                TradingError::InsufficientHistory { required, actual }
            }
            SignalError::ProviderUnavailable(msg) => TradingError::ProviderUnavailable(msg),
            other => TradingError::Signal(other.to_string()),
        }
    }
}

impl TradingError {
    /// Failures that must reach the alert sink
    pub fn should_alert(&self) -> bool {
        matches!(
            self,
            TradingError::InvalidExecutionResult(_) | TradingError::CriticalRiskTrip(_)
        )
    }
}

pub type TradingResult<T> = Result<T, TradingError>;
