use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    Long,
    Short,
}

impl Side {
    pub fn opposite(&self) -> Side {
        match self {
            Side::Long => Side::Short,
            Side::Short => Side::Long,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Side::Long => "long",
            Side::Short => "short",
        }
    }

    pub fn parse(raw: &str) -> Option<Side> {
        match raw.to_ascii_lowercase().as_str() {
            "long" => Some(Side::Long),
            "short" => Some(Side::Short),
            _ => None,
        }
    }

    /// +1 for long, -1 for short
    pub fn sign(&self) -> f64 {
        match self {
            Side::Long => 1.0,
            Side::Short => -1.0,
        }
    }
}

impl std::fmt::Display for Side {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Agent configuration as loaded from persistence
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentRecord {
    pub id: String,
    pub name: String,
    pub symbol: String,
    pub balance: f64,
    pub is_active: bool,
    /// Agent trades from a shared pool rather than its own wallet
    pub use_pooled_balance: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OpenPosition {
    pub id: String,
    pub agent_id: String,
    pub symbol: String,
    pub side: Side,
    pub entry_price: f64,
    pub quantity: f64,
    pub collateral_usd: f64,
    pub leverage: f64,
    pub stop_loss: f64,
    pub take_profit: f64,
    pub opened_at: DateTime<Utc>,
}

impl OpenPosition {
    pub fn new_id() -> String {
        Uuid::new_v4().to_string()
    }

    /// Price move in the position's favour, percent of entry (unleveraged).
    pub fn unrealized_pnl_pct(&self, price: f64) -> f64 {
        if self.entry_price <= 0.0 {
            return 0.0;
        }
        self.side.sign() * (price - self.entry_price) / self.entry_price * 100.0
    }

    /// Realized USD P&L if closed at `price`.
    pub fn pnl_at(&self, price: f64) -> f64 {
        self.side.sign() * (price - self.entry_price) * self.quantity
    }

    pub fn stop_loss_hit(&self, price: f64) -> bool {
        if self.stop_loss <= 0.0 {
            return false;
        }
        match self.side {
            Side::Long => price <= self.stop_loss,
            Side::Short => price >= self.stop_loss,
        }
    }

    pub fn take_profit_hit(&self, price: f64) -> bool {
        if self.take_profit <= 0.0 {
            return false;
        }
        match self.side {
            Side::Long => price >= self.take_profit,
            Side::Short => price <= self.take_profit,
        }
    }

    pub fn held_hours(&self, now: DateTime<Utc>) -> f64 {
        (now - self.opened_at).num_seconds() as f64 / 3600.0
    }

    pub fn into_closed(self, exit_price: f64, closed_at: DateTime<Utc>, reason: impl Into<String>) -> ClosedTrade {
        let realized_pnl = self.pnl_at(exit_price);
        ClosedTrade {
            id: self.id,
            agent_id: self.agent_id,
            symbol: self.symbol,
            side: self.side,
            entry_price: self.entry_price,
            exit_price,
            quantity: self.quantity,
            collateral_usd: self.collateral_usd,
            realized_pnl,
            opened_at: self.opened_at,
            closed_at,
            exit_reason: reason.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClosedTrade {
    pub id: String,
    pub agent_id: String,
    pub symbol: String,
    pub side: Side,
    pub entry_price: f64,
    pub exit_price: f64,
    pub quantity: f64,
    pub collateral_usd: f64,
    pub realized_pnl: f64,
    pub opened_at: DateTime<Utc>,
    pub closed_at: DateTime<Utc>,
    pub exit_reason: String,
}

impl ClosedTrade {
    pub fn is_win(&self) -> bool {
        self.realized_pnl > 0.0
    }
}
