use std::collections::VecDeque;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

/// Process-wide circuit breaker thresholds. Mutable at runtime through
/// `RiskRegistry::update_config`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CircuitBreakerConfig {
    pub max_trade_usd: f64,
    pub max_daily_loss_percent: f64,
    pub max_drawdown_percent: f64,
    pub max_open_positions: usize,
    pub min_balance_usd: f64,
    /// Largest single trade as a fraction of balance
    #[serde(default = "default_max_trade_fraction")]
    pub max_trade_fraction: f64,
    /// 0 disables the consecutive-loss rule
    #[serde(default)]
    pub max_consecutive_losses: u32,
    /// Mirror of the global emergency flag, filled in on read
    #[serde(default)]
    pub emergency_stop: bool,
}

fn default_max_trade_fraction() -> f64 {
    0.40
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            max_trade_usd: 1000.0,
            max_daily_loss_percent: 20.0,
            max_drawdown_percent: 30.0,
            max_open_positions: 3,
            min_balance_usd: 10.0,
            max_trade_fraction: default_max_trade_fraction(),
            max_consecutive_losses: 5,
            emergency_stop: false,
        }
    }
}

/// Partial update; `None` keeps the current value.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CircuitBreakerConfigUpdate {
    pub max_trade_usd: Option<f64>,
    pub max_daily_loss_percent: Option<f64>,
    pub max_drawdown_percent: Option<f64>,
    pub max_open_positions: Option<usize>,
    pub min_balance_usd: Option<f64>,
    pub max_trade_fraction: Option<f64>,
    pub max_consecutive_losses: Option<u32>,
    pub emergency_stop: Option<bool>,
}

impl CircuitBreakerConfigUpdate {
    pub fn apply(&self, config: &mut CircuitBreakerConfig) {
        if let Some(v) = self.max_trade_usd {
            config.max_trade_usd = v;
        }
        if let Some(v) = self.max_daily_loss_percent {
            config.max_daily_loss_percent = v;
        }
        if let Some(v) = self.max_drawdown_percent {
            config.max_drawdown_percent = v;
        }
        if let Some(v) = self.max_open_positions {
            config.max_open_positions = v;
        }
        if let Some(v) = self.min_balance_usd {
            config.min_balance_usd = v;
        }
        if let Some(v) = self.max_trade_fraction {
            config.max_trade_fraction = v;
        }
        if let Some(v) = self.max_consecutive_losses {
            config.max_consecutive_losses = v;
        }
    }
}

/// Per-agent risk record. Owned by the registry; callers only see clones.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentRiskState {
    pub agent_id: String,
    pub initial_capital: f64,
    pub current_capital: f64,
    pub peak_capital: f64,
    pub consecutive_losses: u32,
    pub trading_halted: bool,
    pub halt_reason: Option<String>,
    pub tripped_at: Option<DateTime<Utc>>,
    pub total_trades: u64,
    /// Realized P&L events inside the rolling window
    pub recent_pnl: VecDeque<(DateTime<Utc>, f64)>,
    pub created_at: DateTime<Utc>,
}

impl AgentRiskState {
    pub const DAILY_WINDOW_HOURS: i64 = 24;

    pub fn new(agent_id: impl Into<String>, capital: f64) -> Self {
        Self {
            agent_id: agent_id.into(),
            initial_capital: capital,
            current_capital: capital,
            peak_capital: capital,
            consecutive_losses: 0,
            trading_halted: false,
            halt_reason: None,
            tripped_at: None,
            total_trades: 0,
            recent_pnl: VecDeque::new(),
            created_at: Utc::now(),
        }
    }

    fn prune(&mut self, now: DateTime<Utc>) {
        let cutoff = now - Duration::hours(Self::DAILY_WINDOW_HOURS);
        while matches!(self.recent_pnl.front(), Some((at, _)) if *at < cutoff) {
            self.recent_pnl.pop_front();
        }
    }

    /// Net realized loss over the rolling window, as a positive number.
    pub fn daily_loss(&self, now: DateTime<Utc>) -> f64 {
        let cutoff = now - Duration::hours(Self::DAILY_WINDOW_HOURS);
        let net: f64 = self
            .recent_pnl
            .iter()
            .filter(|(at, _)| *at >= cutoff)
            .map(|(_, pnl)| pnl)
            .sum();
        (-net).max(0.0)
    }

    /// Peak-to-current decline, percent
    pub fn drawdown_percent(&self) -> f64 {
        if self.peak_capital <= 0.0 {
            return 0.0;
        }
        ((self.peak_capital - self.current_capital) / self.peak_capital * 100.0).max(0.0)
    }

    pub fn record_pnl(&mut self, pnl: f64, at: DateTime<Utc>) {
        self.current_capital += pnl;
        self.peak_capital = self.peak_capital.max(self.current_capital);
        self.total_trades += 1;
        if pnl < 0.0 {
            self.consecutive_losses += 1;
        } else if pnl > 0.0 {
            self.consecutive_losses = 0;
        }
        // keep chronological order for pruning
        let idx = self.recent_pnl.partition_point(|(t, _)| *t <= at);
        self.recent_pnl.insert(idx, (at, pnl));
        let newest = self.recent_pnl.back().map(|(t, _)| *t).unwrap_or(at);
        self.prune(newest);
    }

    pub fn trip(&mut self, reason: impl Into<String>, at: DateTime<Utc>) {
        if self.trading_halted {
            return;
        }
        self.trading_halted = true;
        self.halt_reason = Some(reason.into());
        self.tripped_at = Some(at);
    }

    /// Clear the trip and the loss tracking; the drawdown baseline restarts
    /// at current capital.
    pub fn reset(&mut self) {
        self.trading_halted = false;
        self.halt_reason = None;
        self.tripped_at = None;
        self.recent_pnl.clear();
        self.consecutive_losses = 0;
        self.peak_capital = self.current_capital;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Severity::Low => "low",
            Severity::Medium => "medium",
            Severity::High => "high",
            Severity::Critical => "critical",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RiskRule {
    EmergencyStop,
    AgentTripped,
    MaxTradeSize,
    MinBalance,
    TradeBalanceRatio,
    DailyLoss,
    Drawdown,
    OpenPositions,
    ConsecutiveLosses,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RiskViolation {
    pub rule: RiskRule,
    pub severity: Severity,
    pub message: String,
}

/// Outcome of a pre-trade check
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RiskCheck {
    pub allowed: bool,
    pub violations: Vec<RiskViolation>,
    /// This check tripped the agent
    pub tripped: bool,
}

impl RiskCheck {
    pub fn max_severity(&self) -> Option<Severity> {
        self.violations.iter().map(|v| v.severity).max()
    }

    pub fn is_critical(&self) -> bool {
        self.max_severity() == Some(Severity::Critical)
    }

    pub fn reason(&self) -> String {
        if self.violations.is_empty() {
            return "All circuit breakers clear".to_string();
        }
        self.violations
            .iter()
            .map(|v| format!("[{}] {}", v.severity, v.message))
            .collect::<Vec<_>>()
            .join("; ")
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TradeRequest {
    pub agent_id: String,
    /// Collateral the trade would commit
    pub amount_usd: f64,
    pub balance: f64,
    pub open_positions: usize,
}
