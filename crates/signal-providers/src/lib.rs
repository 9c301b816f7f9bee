//! Independent trading strategies behind one `SignalProvider` capability.
//!
//! Every provider reads the same [`MarketContext`] and returns the unified
//! `TradingSignal` shape. Providers never size or execute trades; the
//! arbitrator picks one signal and the agent pipeline takes it from there.

pub mod ai;
pub mod context;
pub mod error;
pub mod expert;
pub mod extract;
pub mod technical;
pub mod ultra;

#[cfg(test)]
mod test_support;

pub use ai::AiTextProvider;
pub use context::MarketContext;
pub use error::SignalError;
pub use expert::ExpertProvider;
pub use extract::{extract_signal_payload, AiSignalPayload, ExtractionStrategy};
pub use technical::TechnicalProvider;
pub use ultra::{UltraProvider, Urgency};

use analysis_core::{SignalAction, SignalSource, TradingSignal};
use async_trait::async_trait;

#[async_trait]
pub trait SignalProvider: Send + Sync {
    fn name(&self) -> &str;

    fn source(&self) -> SignalSource;

    /// Produce a candidate signal for the context's symbol, balance and
    /// current position.
    async fn analyze(&self, ctx: &MarketContext) -> Result<TradingSignal, SignalError>;

    /// Provider-specific gate applied before a signal may be acted on.
    fn should_trade(&self, signal: &TradingSignal) -> bool {
        signal.action != SignalAction::Hold
    }
}
