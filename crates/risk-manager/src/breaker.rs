use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use analysis_core::ClosedTrade;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tokio::sync::{Mutex, RwLock};

use crate::models::*;

/// Owns every agent's risk state plus the process-wide breaker config and
/// emergency flag. Cloning the registry's `Arc` is the only way to share it.
pub struct RiskRegistry {
    agents: DashMap<String, Arc<Mutex<AgentRiskState>>>,
    config: RwLock<CircuitBreakerConfig>,
    emergency_stop: AtomicBool,
}

impl Default for RiskRegistry {
    fn default() -> Self {
        Self::new(CircuitBreakerConfig::default())
    }
}

impl RiskRegistry {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        let emergency = config.emergency_stop;
        Self {
            agents: DashMap::new(),
            config: RwLock::new(config),
            emergency_stop: AtomicBool::new(emergency),
        }
    }

    /// The per-agent lock. Cloned out of the map so no shard guard is held
    /// across an await.
    fn slot(&self, agent_id: &str, capital: f64) -> Arc<Mutex<AgentRiskState>> {
        self.agents
            .entry(agent_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(AgentRiskState::new(agent_id, capital))))
            .clone()
    }

    fn existing(&self, agent_id: &str) -> Option<Arc<Mutex<AgentRiskState>>> {
        self.agents.get(agent_id).map(|entry| entry.value().clone())
    }

    pub fn is_tracked(&self, agent_id: &str) -> bool {
        self.agents.contains_key(agent_id)
    }

    /// Seed an agent's state from its persisted history. `recent_trades` is
    /// most recent first, as the store returns them. No-op when the agent is
    /// already tracked.
    pub async fn hydrate(&self, agent_id: &str, balance: f64, recent_trades: &[ClosedTrade]) {
        if self.is_tracked(agent_id) {
            return;
        }

        let realized: f64 = recent_trades.iter().map(|t| t.realized_pnl).sum();
        let mut state = AgentRiskState::new(agent_id, balance - realized);
        for trade in recent_trades.iter().rev() {
            state.record_pnl(trade.realized_pnl, trade.closed_at);
        }
        state.current_capital = balance;
        state.peak_capital = state.peak_capital.max(balance);

        tracing::debug!(
            agent_id,
            trades = recent_trades.len(),
            consecutive_losses = state.consecutive_losses,
            drawdown_pct = state.drawdown_percent(),
            "Hydrated risk state"
        );

        self.agents
            .entry(agent_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(state)));
    }

    /// Run every breaker rule against a proposed trade. Critical findings
    /// stop evaluation; daily-loss and drawdown breaches trip the agent.
    pub async fn can_trade(&self, request: &TradeRequest) -> RiskCheck {
        self.can_trade_at(request, Utc::now()).await
    }

    pub async fn can_trade_at(&self, request: &TradeRequest, now: DateTime<Utc>) -> RiskCheck {
        let config = self.config.read().await.clone();
        let mut check = RiskCheck {
            allowed: false,
            violations: Vec::new(),
            tripped: false,
        };

        if self.is_emergency_stopped() {
            check.violations.push(violation(
                RiskRule::EmergencyStop,
                Severity::Critical,
                "Emergency stop active".to_string(),
            ));
            return check;
        }

        let slot = self.slot(&request.agent_id, request.balance);
        let mut state = slot.lock().await;

        if state.trading_halted {
            let reason = state
                .halt_reason
                .clone()
                .unwrap_or_else(|| "Agent tripped".to_string());
            check.violations.push(violation(
                RiskRule::AgentTripped,
                Severity::Critical,
                format!("Agent tripped: {}", reason),
            ));
            return check;
        }

        if request.amount_usd > config.max_trade_usd {
            check.violations.push(violation(
                RiskRule::MaxTradeSize,
                Severity::High,
                format!(
                    "Trade ${:.2} exceeds max ${:.2}",
                    request.amount_usd, config.max_trade_usd
                ),
            ));
        }

        if request.balance < config.min_balance_usd {
            check.violations.push(violation(
                RiskRule::MinBalance,
                Severity::Critical,
                format!(
                    "Balance ${:.2} below minimum ${:.2}",
                    request.balance, config.min_balance_usd
                ),
            ));
            return check;
        }

        let ratio = request.amount_usd / request.balance;
        if ratio > config.max_trade_fraction {
            check.violations.push(violation(
                RiskRule::TradeBalanceRatio,
                Severity::Medium,
                format!(
                    "Trade is {:.1}% of balance, limit {:.1}%",
                    ratio * 100.0,
                    config.max_trade_fraction * 100.0
                ),
            ));
        }

        let daily_loss_pct = state.daily_loss(now) / request.balance * 100.0;
        if daily_loss_pct > config.max_daily_loss_percent {
            let message = format!(
                "daily_loss: {:.1}% exceeds limit of {:.1}%",
                daily_loss_pct, config.max_daily_loss_percent
            );
            state.trip(message.clone(), now);
            check.tripped = true;
            check
                .violations
                .push(violation(RiskRule::DailyLoss, Severity::Critical, message));
            log_trip(&state);
            return check;
        }

        let drawdown = state.drawdown_percent();
        if drawdown > config.max_drawdown_percent {
            let message = format!(
                "drawdown: {:.1}% exceeds limit of {:.1}%",
                drawdown, config.max_drawdown_percent
            );
            state.trip(message.clone(), now);
            check.tripped = true;
            check
                .violations
                .push(violation(RiskRule::Drawdown, Severity::Critical, message));
            log_trip(&state);
            return check;
        }

        if request.open_positions >= config.max_open_positions {
            check.violations.push(violation(
                RiskRule::OpenPositions,
                Severity::Medium,
                format!(
                    "{} open positions, limit {}",
                    request.open_positions, config.max_open_positions
                ),
            ));
        }

        if config.max_consecutive_losses > 0
            && state.consecutive_losses >= config.max_consecutive_losses
        {
            check.violations.push(violation(
                RiskRule::ConsecutiveLosses,
                Severity::High,
                format!(
                    "consecutive_losses: {} >= limit of {}",
                    state.consecutive_losses, config.max_consecutive_losses
                ),
            ));
        }

        check.allowed = check.violations.is_empty();
        check
    }

    /// Feed a realized P&L into the agent's state.
    pub async fn record_trade_result(&self, agent_id: &str, pnl: f64, closed_at: DateTime<Utc>) {
        let Some(slot) = self.existing(agent_id) else {
            tracing::warn!(agent_id, pnl, "Trade result for untracked agent ignored");
            return;
        };
        let mut state = slot.lock().await;
        state.record_pnl(pnl, closed_at);
        tracing::debug!(
            agent_id,
            pnl,
            capital = state.current_capital,
            consecutive_losses = state.consecutive_losses,
            "Recorded trade result"
        );
    }

    pub async fn agent_status(&self, agent_id: &str) -> Option<AgentRiskState> {
        let slot = self.existing(agent_id)?;
        let state = slot.lock().await;
        Some(state.clone())
    }

    pub async fn all_statuses(&self) -> Vec<AgentRiskState> {
        let slots: Vec<_> = self.agents.iter().map(|e| e.value().clone()).collect();
        let mut out = Vec::with_capacity(slots.len());
        for slot in slots {
            out.push(slot.lock().await.clone());
        }
        out.sort_by(|a, b| a.agent_id.cmp(&b.agent_id));
        out
    }

    /// Manually trip an agent. An agent that has not traded yet gets a slot
    /// seeded with `capital`, so the halt holds for its first trade.
    pub async fn trip_agent(&self, agent_id: &str, reason: &str, capital: f64) {
        let slot = self.slot(agent_id, capital);
        let mut state = slot.lock().await;
        state.trip(format!("Manual: {}", reason), Utc::now());
        log_trip(&state);
    }

    /// Returns false when the agent is unknown.
    pub async fn reset_agent(&self, agent_id: &str) -> bool {
        let Some(slot) = self.existing(agent_id) else {
            return false;
        };
        let mut state = slot.lock().await;
        state.reset();
        tracing::info!(agent_id, capital = state.current_capital, "Agent circuit breaker reset");
        true
    }

    pub fn emergency_stop_all(&self) {
        self.emergency_stop.store(true, Ordering::SeqCst);
        tracing::warn!("EMERGENCY STOP activated for all agents");
    }

    pub fn resume(&self) {
        self.emergency_stop.store(false, Ordering::SeqCst);
        tracing::info!("Emergency stop cleared, trading resumed");
    }

    pub fn is_emergency_stopped(&self) -> bool {
        self.emergency_stop.load(Ordering::SeqCst)
    }

    pub async fn config(&self) -> CircuitBreakerConfig {
        let mut config = self.config.read().await.clone();
        config.emergency_stop = self.is_emergency_stopped();
        config
    }

    pub async fn update_config(&self, update: CircuitBreakerConfigUpdate) -> CircuitBreakerConfig {
        {
            let mut config = self.config.write().await;
            update.apply(&mut config);
            tracing::info!(?config, "Circuit breaker config updated");
        }
        match update.emergency_stop {
            Some(true) => self.emergency_stop_all(),
            Some(false) => self.resume(),
            None => {}
        }
        self.config().await
    }
}

fn violation(rule: RiskRule, severity: Severity, message: String) -> RiskViolation {
    RiskViolation {
        rule,
        severity,
        message,
    }
}

fn log_trip(state: &AgentRiskState) {
    tracing::warn!(
        agent_id = %state.agent_id,
        reason = state.halt_reason.as_deref().unwrap_or(""),
        capital = state.current_capital,
        "Agent circuit breaker TRIPPED"
    );
}
