//! Reconciles the signal providers into one decision.
//!
//! Tiers are tried in priority order and the first tier whose signal passes
//! its gate and confidence floor wins. Lower tiers are not consulted once a
//! tier wins, which also spares the slower providers a call.

use std::sync::Arc;

use analysis_core::{SignalAction, SignalSource, TradingSignal};
use serde::{Deserialize, Serialize};
use signal_providers::{MarketContext, SignalError, SignalProvider};
use tracing::{debug, info, warn};

/// Confidence floors per tier, on the 0-1 scale
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ArbitrationThresholds {
    pub ultra: f64,
    pub expert: f64,
    pub technical: f64,
    pub ai: f64,
}

impl Default for ArbitrationThresholds {
    fn default() -> Self {
        Self {
            ultra: 0.35,
            expert: 0.60,
            technical: 0.45,
            ai: 0.45,
        }
    }
}

/// Extra condition a tier's signal must satisfy besides the floor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TierGate {
    /// Any action other than Hold
    Actionable,
    /// The provider's own `should_trade`
    ProviderApproval,
    /// Any valid signal
    Present,
}

pub struct ArbitrationTier {
    pub name: String,
    pub provider: Arc<dyn SignalProvider>,
    pub min_confidence: f64,
    pub gate: TierGate,
}

impl ArbitrationTier {
    pub fn new(provider: Arc<dyn SignalProvider>, min_confidence: f64, gate: TierGate) -> Self {
        Self {
            name: provider.name().to_string(),
            provider,
            min_confidence,
            gate,
        }
    }

    fn accepts(&self, signal: &TradingSignal) -> Result<(), String> {
        let gate_ok = match self.gate {
            TierGate::Actionable => signal.action != SignalAction::Hold,
            TierGate::ProviderApproval => self.provider.should_trade(signal),
            TierGate::Present => true,
        };
        if !gate_ok {
            return Err(format!("{} gate not passed ({})", self.name, signal.action));
        }
        if signal.confidence < self.min_confidence {
            return Err(format!(
                "{} confidence {:.2} below floor {:.2}",
                self.name, signal.confidence, self.min_confidence
            ));
        }
        Ok(())
    }
}

/// What happened at one tier
#[derive(Debug, Clone, PartialEq)]
pub struct TierVerdict {
    pub tier: String,
    pub accepted: bool,
    pub detail: String,
}

#[derive(Debug, Clone)]
pub struct ArbitrationDecision {
    pub signal: TradingSignal,
    /// Name of the winning tier, `None` when nothing cleared its floor
    pub winning_tier: Option<String>,
    pub verdicts: Vec<TierVerdict>,
}

impl ArbitrationDecision {
    pub fn summary(&self) -> String {
        self.verdicts
            .iter()
            .map(|v| v.detail.as_str())
            .collect::<Vec<_>>()
            .join("; ")
    }
}

pub struct SignalArbitrator {
    tiers: Vec<ArbitrationTier>,
}

impl SignalArbitrator {
    pub fn new(tiers: Vec<ArbitrationTier>) -> Self {
        Self { tiers }
    }

    /// Standard ladder: aggressive, conservative, rule-based, then AI text.
    pub fn standard(
        ultra: Arc<dyn SignalProvider>,
        expert: Arc<dyn SignalProvider>,
        technical: Arc<dyn SignalProvider>,
        ai: Arc<dyn SignalProvider>,
        thresholds: ArbitrationThresholds,
    ) -> Self {
        Self::new(vec![
            ArbitrationTier::new(ultra, thresholds.ultra, TierGate::Actionable),
            ArbitrationTier::new(expert, thresholds.expert, TierGate::ProviderApproval),
            ArbitrationTier::new(technical, thresholds.technical, TierGate::Present),
            ArbitrationTier::new(ai, thresholds.ai, TierGate::Present),
        ])
    }

    pub async fn decide(&self, ctx: &MarketContext) -> ArbitrationDecision {
        let mut verdicts = Vec::with_capacity(self.tiers.len());

        for tier in &self.tiers {
            let signal = match tier.provider.analyze(ctx).await {
                Ok(signal) => signal,
                Err(e) => {
                    log_provider_error(&ctx.symbol, &tier.name, &e);
                    verdicts.push(TierVerdict {
                        tier: tier.name.clone(),
                        accepted: false,
                        detail: format!("{} failed: {}", tier.name, e),
                    });
                    continue;
                }
            };

            if let Err(e) = signal.validate() {
                warn!("{}: {} produced an invalid signal: {}", ctx.symbol, tier.name, e);
                verdicts.push(TierVerdict {
                    tier: tier.name.clone(),
                    accepted: false,
                    detail: format!("{} rejected: {}", tier.name, e),
                });
                continue;
            }

            match tier.accepts(&signal) {
                Ok(()) => {
                    info!(
                        symbol = %ctx.symbol,
                        tier = %tier.name,
                        action = %signal.action,
                        confidence = signal.confidence,
                        "Arbitration winner"
                    );
                    verdicts.push(TierVerdict {
                        tier: tier.name.clone(),
                        accepted: true,
                        detail: format!("{} won with {} @ {:.2}", tier.name, signal.action, signal.confidence),
                    });
                    return ArbitrationDecision {
                        signal,
                        winning_tier: Some(tier.name.clone()),
                        verdicts,
                    };
                }
                Err(detail) => {
                    debug!("{}: {}", ctx.symbol, detail);
                    verdicts.push(TierVerdict {
                        tier: tier.name.clone(),
                        accepted: false,
                        detail,
                    });
                }
            }
        }

        let mut decision = ArbitrationDecision {
            signal: TradingSignal::hold(&ctx.symbol, ctx.price(), SignalSource::Arbitrator, ""),
            winning_tier: None,
            verdicts,
        };
        decision.signal.reasoning = format!("no tier cleared its floor: {}", decision.summary());
        decision.signal = decision.signal.with_context(ctx.regime, ctx.indicators);
        decision
    }
}

fn log_provider_error(symbol: &str, tier: &str, err: &SignalError) {
    match err {
        SignalError::InsufficientHistory { .. } => debug!("{}: {} skipped: {}", symbol, tier, err),
        _ => warn!("{}: {} failed: {}", symbol, tier, err),
    }
}
