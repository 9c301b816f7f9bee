pub mod breaker;
pub mod models;

pub use breaker::RiskRegistry;
pub use models::*;
