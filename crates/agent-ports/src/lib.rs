pub mod error;
pub mod memory;

pub use error::{PortError, PortResult};

use analysis_core::{AgentRecord, ClosedTrade, OpenPosition, PriceSeries, Side, TradingSignal};
use async_trait::async_trait;
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Order types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderSide {
    Buy,
    Sell,
}

impl OrderSide {
    /// Order side that opens a position on `side`
    pub fn opening(side: Side) -> Self {
        match side {
            Side::Long => OrderSide::Buy,
            Side::Short => OrderSide::Sell,
        }
    }

    /// Order side that closes a position on `side`
    pub fn closing(side: Side) -> Self {
        Self::opening(side.opposite())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MarketOrder {
    pub symbol: String,
    pub side: OrderSide,
    pub quantity: Decimal,
}

impl MarketOrder {
    pub fn buy(symbol: impl Into<String>, quantity: Decimal) -> Self {
        Self {
            symbol: symbol.into(),
            side: OrderSide::Buy,
            quantity,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderFill {
    pub order_id: String,
    pub executed_qty: Decimal,
    pub executed_price: Decimal,
    pub status: String,
}

impl OrderFill {
    /// A fill with zero quantity, zero price or a non-filled status is a hard
    /// failure of the trade attempt, never a partial success.
    pub fn validated(self) -> PortResult<Self> {
        if self.executed_qty <= Decimal::ZERO {
            return Err(PortError::InvalidExecutionResult(format!(
                "order {} executed quantity {}",
                self.order_id, self.executed_qty
            )));
        }
        if self.executed_price <= Decimal::ZERO {
            return Err(PortError::InvalidExecutionResult(format!(
                "order {} executed price {}",
                self.order_id, self.executed_price
            )));
        }
        let status = self.status.to_ascii_lowercase();
        if !matches!(status.as_str(), "filled" | "partially_filled") {
            return Err(PortError::InvalidExecutionResult(format!(
                "order {} status {}",
                self.order_id, self.status
            )));
        }
        Ok(self)
    }

    pub fn qty_f64(&self) -> f64 {
        self.executed_qty.to_f64().unwrap_or_default()
    }

    pub fn price_f64(&self) -> f64 {
        self.executed_price.to_f64().unwrap_or_default()
    }
}

// ---------------------------------------------------------------------------
// Collaborator traits
// ---------------------------------------------------------------------------

#[async_trait]
pub trait PriceFeed: Send + Sync {
    /// Most recent `lookback` points, oldest first
    async fn get_history(&self, symbol: &str, lookback: usize) -> PortResult<PriceSeries>;

    async fn get_current_price(&self, symbol: &str) -> PortResult<f64>;
}

#[async_trait]
pub trait TextCompletionProvider: Send + Sync {
    /// Raw model output; no format is guaranteed
    async fn complete(&self, prompt: &str, temperature: f64, max_tokens: u32) -> PortResult<String>;

    fn name(&self) -> &str;
}

#[async_trait]
pub trait ExecutionClient: Send + Sync {
    async fn place_market_order(&self, order: MarketOrder) -> PortResult<OrderFill>;

    /// Whether this is a paper/simulated venue
    fn is_paper(&self) -> bool;
}

#[async_trait]
pub trait Persistence: Send + Sync {
    async fn load_agent(&self, agent_id: &str) -> PortResult<Option<AgentRecord>>;

    async fn load_agents(&self) -> PortResult<Vec<AgentRecord>>;

    async fn save_agent(&self, agent: &AgentRecord) -> PortResult<()>;

    /// Open positions, optionally limited to one agent
    async fn load_open_positions(&self, agent_id: Option<&str>) -> PortResult<Vec<OpenPosition>>;

    /// Persist a freshly opened position together with the signal that opened it
    async fn record_trade(&self, position: &OpenPosition, signal: &TradingSignal) -> PortResult<()>;

    async fn update_trade_on_close(&self, trade: &ClosedTrade) -> PortResult<()>;

    /// Most recent first
    async fn load_recent_closed_trades(&self, agent_id: &str, limit: usize) -> PortResult<Vec<ClosedTrade>>;

    async fn load_trade_signal(&self, position_id: &str) -> PortResult<Option<TradingSignal>>;
}

#[async_trait]
pub trait AlertSink: Send + Sync {
    async fn notify(&self, message: &str) -> PortResult<()>;
}

/// Send an alert, logging instead of propagating any failure.
pub async fn notify_quietly(sink: &dyn AlertSink, message: &str) {
    if let Err(e) = sink.notify(message).await {
        tracing::warn!("Alert delivery failed: {}", e);
    }
}
