//! One agent's analyze, decide, size, risk-check and execute run, plus the
//! per-cycle sweep over open positions.

use std::fmt;
use std::future::Future;
use std::sync::Arc;

use agent_ports::{
    notify_quietly, AlertSink, ExecutionClient, Persistence, PortError, PortResult, PriceFeed,
    TextCompletionProvider,
};
use analysis_core::{AgentRecord, ClosedTrade, MarketRegime, OpenPosition, Side, SignalAction};
use chrono::Utc;
use dashmap::DashMap;
use kelly_position_sizer::{KellyPositionSizer, Sizing, SizingRequest, TradeStats, STATS_WINDOW};
use market_regime_detector::RegimeClassifier;
use risk_manager::{RiskRegistry, TradeRequest};
use serde::Serialize;
use signal_arbitrator::{ArbitrationThresholds, SignalArbitrator};
use signal_providers::{AiTextProvider, ExpertProvider, MarketContext, TechnicalProvider, UltraProvider};
use technical_analysis::IndicatorEngine;
use tokio::sync::Mutex;

use crate::error::{TradingError, TradingResult};
use crate::executor::TradeExecutor;
use crate::monitor::{ExitReason, PositionMonitor};

/// How one agent's run ended. Every variant carries a reason.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum AgentOutcome {
    Executed {
        symbol: String,
        side: Side,
        collateral_usd: f64,
        leverage: f64,
        tier: String,
    },
    Closed {
        symbol: String,
        reason: String,
        realized_pnl: f64,
    },
    Held {
        reason: String,
    },
    Rejected {
        reason: String,
        critical: bool,
    },
    Failed {
        reason: String,
    },
}

impl fmt::Display for AgentOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AgentOutcome::Executed {
                symbol,
                side,
                collateral_usd,
                leverage,
                tier,
            } => write!(
                f,
                "executed {} {} ${:.2} at {:.0}x via {}",
                side, symbol, collateral_usd, leverage, tier
            ),
            AgentOutcome::Closed {
                symbol,
                reason,
                realized_pnl,
            } => write!(f, "closed {} ({}) P&L ${:+.2}", symbol, reason, realized_pnl),
            AgentOutcome::Held { reason } => write!(f, "held: {}", reason),
            AgentOutcome::Rejected { reason, critical } => {
                let tag = if *critical { " (critical)" } else { "" };
                write!(f, "rejected{}: {}", tag, reason)
            }
            AgentOutcome::Failed { reason } => write!(f, "failed: {}", reason),
        }
    }
}

/// Result of one sweep over open positions
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct MonitorReport {
    pub checked: usize,
    pub closed: usize,
    pub failed: usize,
    pub realized_pnl: Vec<f64>,
}

/// External collaborators the pipeline talks to
#[derive(Clone)]
pub struct Collaborators {
    pub feed: Arc<dyn PriceFeed>,
    pub store: Arc<dyn Persistence>,
    pub execution: Arc<dyn ExecutionClient>,
    pub alerts: Arc<dyn AlertSink>,
}

/// Run a price-feed call, retrying once when the feed reports itself
/// unavailable. Any other error, or a second outage, is returned.
async fn retry_unavailable<T, F, Fut>(what: &str, mut call: F) -> PortResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = PortResult<T>>,
{
    match call().await {
        Err(PortError::Unavailable(reason)) => {
            tracing::warn!("{}: feed unavailable ({}), retrying once", what, reason);
            call().await
        }
        other => other,
    }
}

/// The usual four-tier ladder: ultra, expert, technical, then AI text.
pub fn standard_arbitrator(
    llm: Arc<dyn TextCompletionProvider>,
    thresholds: ArbitrationThresholds,
    temperature: f64,
    max_tokens: u32,
) -> SignalArbitrator {
    SignalArbitrator::standard(
        Arc::new(UltraProvider::new()),
        Arc::new(ExpertProvider::new()),
        Arc::new(TechnicalProvider::new()),
        Arc::new(AiTextProvider::new(llm).with_sampling(temperature, max_tokens)),
        thresholds,
    )
}

pub struct AgentPipeline {
    feed: Arc<dyn PriceFeed>,
    store: Arc<dyn Persistence>,
    alerts: Arc<dyn AlertSink>,
    arbitrator: SignalArbitrator,
    sizer: KellyPositionSizer,
    registry: Arc<RiskRegistry>,
    executor: TradeExecutor,
    monitor: PositionMonitor,
    engine: IndicatorEngine,
    classifier: RegimeClassifier,
    lookback: usize,
    /// Serializes position closes and new-trade runs per agent
    agent_locks: DashMap<String, Arc<Mutex<()>>>,
}

impl AgentPipeline {
    pub fn new(
        collaborators: Collaborators,
        arbitrator: SignalArbitrator,
        sizer: KellyPositionSizer,
        registry: Arc<RiskRegistry>,
        monitor: PositionMonitor,
        lookback: usize,
    ) -> Self {
        let executor = TradeExecutor::new(
            collaborators.execution,
            Arc::clone(&collaborators.store),
            Arc::clone(&registry),
            Arc::clone(&collaborators.alerts),
        );
        Self {
            feed: collaborators.feed,
            store: collaborators.store,
            alerts: collaborators.alerts,
            arbitrator,
            sizer,
            registry,
            executor,
            monitor,
            engine: IndicatorEngine,
            classifier: RegimeClassifier::new(),
            lookback,
            agent_locks: DashMap::new(),
        }
    }

    pub fn store(&self) -> &Arc<dyn Persistence> {
        &self.store
    }

    pub fn registry(&self) -> &Arc<RiskRegistry> {
        &self.registry
    }

    pub fn alerts(&self) -> &Arc<dyn AlertSink> {
        &self.alerts
    }

    /// Seed the agent's breaker state from its stored history, once per
    /// process. Returns the recent closed trades, most recent first.
    pub async fn hydrate_risk(&self, agent: &AgentRecord) -> PortResult<Vec<ClosedTrade>> {
        let recent = self
            .store
            .load_recent_closed_trades(&agent.id, STATS_WINDOW)
            .await?;
        self.registry.hydrate(&agent.id, agent.balance, &recent).await;
        Ok(recent)
    }

    fn agent_lock(&self, agent_id: &str) -> Arc<Mutex<()>> {
        self.agent_locks
            .entry(agent_id.to_string())
            .or_default()
            .clone()
    }

    /// Run the full pipeline for one agent. Never fails: every error is
    /// turned into an outcome with a reason.
    pub async fn run_agent(&self, agent: &AgentRecord) -> AgentOutcome {
        let lock = self.agent_lock(&agent.id);
        let _guard = lock.lock().await;

        let outcome = match self.try_run_agent(agent).await {
            Ok(outcome) => outcome,
            Err(TradingError::InsufficientHistory { required, actual }) => AgentOutcome::Held {
                reason: format!("insufficient history ({actual}/{required} points)"),
            },
            Err(TradingError::RiskRejected { reason, critical }) => {
                AgentOutcome::Rejected { reason, critical }
            }
            Err(TradingError::CriticalRiskTrip(reason)) => AgentOutcome::Rejected {
                reason,
                critical: true,
            },
            Err(e) => {
                tracing::warn!("{} ({}): pipeline failed: {}", agent.name, agent.symbol, e);
                AgentOutcome::Failed {
                    reason: e.to_string(),
                }
            }
        };

        tracing::info!(
            agent_id = %agent.id,
            agent = %agent.name,
            symbol = %agent.symbol,
            outcome = %outcome,
            "Agent run finished"
        );
        outcome
    }

    async fn try_run_agent(&self, agent: &AgentRecord) -> TradingResult<AgentOutcome> {
        // Reload so balance freed by this cycle's closes is visible
        let mut agent = self
            .store
            .load_agent(&agent.id)
            .await?
            .unwrap_or_else(|| agent.clone());

        let series = retry_unavailable(&agent.symbol, || {
            self.feed.get_history(&agent.symbol, self.lookback)
        })
        .await?;
        let open = self.store.load_open_positions(Some(&agent.id)).await?;
        let position = open.iter().find(|p| p.symbol == agent.symbol).cloned();

        let ctx = MarketContext::build(
            series,
            agent.balance,
            position.clone(),
            &self.engine,
            &self.classifier,
        )?;

        let decision = self.arbitrator.decide(&ctx).await;
        let tier = decision.winning_tier.clone().unwrap_or_else(|| "none".to_string());
        let signal = decision.signal;
        tracing::info!(
            agent = %agent.name,
            symbol = %signal.symbol,
            action = %signal.action,
            confidence = signal.confidence,
            tier = %tier,
            regime = %ctx.regime,
            "Arbitrated signal"
        );

        match (signal.action, position) {
            (SignalAction::Hold, _) => {
                return Ok(AgentOutcome::Held {
                    reason: signal.reasoning,
                })
            }
            (SignalAction::Close, None) => {
                return Ok(AgentOutcome::Held {
                    reason: "close signal with no open position".to_string(),
                })
            }
            (SignalAction::Close, Some(open_position)) => {
                return self
                    .close_for_signal(&mut agent, open_position, ExitReason::SignalClose)
                    .await
            }
            (action, Some(open_position)) => {
                if action.side() == Some(open_position.side) {
                    return Ok(AgentOutcome::Held {
                        reason: format!("already {} {}", open_position.side, open_position.symbol),
                    });
                }
                return self
                    .close_for_signal(&mut agent, open_position, ExitReason::SignalReversal)
                    .await;
            }
            (_, None) => {}
        }

        let recent = self.hydrate_risk(&agent).await?;
        let breaker = self.registry.config().await;

        let request = SizingRequest {
            signal: &signal,
            balance: agent.balance,
            use_pooled_balance: agent.use_pooled_balance,
            stats: TradeStats::from_trades(&recent),
            max_trade_usd: breaker.max_trade_usd,
        };
        let size = match self
            .sizer
            .size(&request)
            .map_err(|e| TradingError::Sizing(e.to_string()))?
        {
            Sizing::Trade(size) => size,
            Sizing::Skip { reason } => return Ok(AgentOutcome::Held { reason }),
        };

        let check = self
            .registry
            .can_trade(&TradeRequest {
                agent_id: agent.id.clone(),
                amount_usd: size.collateral_usd,
                balance: agent.balance,
                open_positions: open.len(),
            })
            .await;
        if !check.allowed {
            let reason = check.reason();
            if check.tripped {
                tracing::error!("{}: circuit breaker TRIPPED: {}", agent.name, reason);
                notify_quietly(
                    self.alerts.as_ref(),
                    &format!(
                        "**Circuit breaker tripped** for {} ({}): {}\n_No trades until reset._",
                        agent.name, agent.id, reason
                    ),
                )
                .await;
                return Err(TradingError::CriticalRiskTrip(reason));
            }
            let critical = check.is_critical();
            if critical {
                tracing::warn!("{}: trade blocked: {}", agent.name, reason);
            } else {
                tracing::info!("{}: trade rejected: {}", agent.name, reason);
            }
            return Err(TradingError::RiskRejected { reason, critical });
        }

        // Operators may flip the global stop while this run was in flight
        if self.registry.is_emergency_stopped() {
            return Err(TradingError::RiskRejected {
                reason: "Emergency stop activated before execution".to_string(),
                critical: true,
            });
        }

        let position = self.executor.open_position(&mut agent, &signal, &size).await?;
        Ok(AgentOutcome::Executed {
            symbol: position.symbol,
            side: position.side,
            collateral_usd: position.collateral_usd,
            leverage: position.leverage,
            tier,
        })
    }

    async fn close_for_signal(
        &self,
        agent: &mut AgentRecord,
        position: OpenPosition,
        reason: ExitReason,
    ) -> TradingResult<AgentOutcome> {
        let trade = self
            .executor
            .close_position(agent, position, reason.as_str())
            .await?;
        Ok(AgentOutcome::Closed {
            symbol: trade.symbol,
            reason: trade.exit_reason,
            realized_pnl: trade.realized_pnl,
        })
    }

    async fn current_regime(&self, symbol: &str) -> Option<MarketRegime> {
        let history = retry_unavailable(symbol, || self.feed.get_history(symbol, self.lookback));
        let series = match history.await {
            Ok(series) => series,
            Err(e) => {
                tracing::debug!("{}: no history for regime check: {}", symbol, e);
                return None;
            }
        };
        let indicators = self.engine.compute(&series).ok()?;
        Some(self.classifier.classify(&series, &indicators))
    }

    /// Apply the exit rules to every open position, closing those that match.
    pub async fn monitor_positions(&self) -> MonitorReport {
        let mut report = MonitorReport::default();

        let positions = match self.store.load_open_positions(None).await {
            Ok(positions) => positions,
            Err(e) => {
                tracing::error!("Could not load open positions: {}", e);
                report.failed += 1;
                return report;
            }
        };

        let now = Utc::now();
        for position in positions {
            report.checked += 1;

            let price = match retry_unavailable(&position.symbol, || {
                self.feed.get_current_price(&position.symbol)
            })
            .await
            {
                Ok(price) => price,
                Err(e) => {
                    tracing::warn!("{}: price unavailable for monitor: {}", position.symbol, e);
                    report.failed += 1;
                    continue;
                }
            };
            let regime = self.current_regime(&position.symbol).await;

            let Some(reason) = self.monitor.evaluate(&position, price, regime.as_ref(), now) else {
                tracing::debug!(
                    "{} {} at {:+.2}%: holding",
                    position.side,
                    position.symbol,
                    position.unrealized_pnl_pct(price)
                );
                continue;
            };

            let lock = self.agent_lock(&position.agent_id);
            let _guard = lock.lock().await;

            let mut agent = match self.store.load_agent(&position.agent_id).await {
                Ok(Some(agent)) => agent,
                Ok(None) => {
                    tracing::warn!(
                        "Position {} belongs to unknown agent {}",
                        position.id,
                        position.agent_id
                    );
                    report.failed += 1;
                    continue;
                }
                Err(e) => {
                    tracing::warn!("Could not load agent {}: {}", position.agent_id, e);
                    report.failed += 1;
                    continue;
                }
            };

            tracing::info!(
                "Exit rule '{}' for {} {} ({}) at {:+.2}%",
                reason,
                position.side,
                position.symbol,
                agent.name,
                position.unrealized_pnl_pct(price)
            );

            match self.executor.close_position(&mut agent, position, reason.as_str()).await {
                Ok(trade) => {
                    report.closed += 1;
                    report.realized_pnl.push(trade.realized_pnl);
                }
                Err(_) => report.failed += 1,
            }
        }

        report
    }
}
