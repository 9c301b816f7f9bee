use analysis_core::{ClosedTrade, TradingSignal, MAX_LEVERAGE, MIN_LEVERAGE};
use anyhow::{bail, Result};
use log::debug;
use serde::{Deserialize, Serialize};

/// Trades considered when estimating win rate and payoff
pub const STATS_WINDOW: usize = 20;

/// Kelly Criterion position sizing calculator
///
/// The Kelly Criterion determines the optimal position size to maximize
/// long-term growth rate. Formula: f* = (bp - q) / b
/// where:
///   f* = optimal fraction of capital to wager
///   b = odds received (avg win / avg loss)
///   p = probability of winning
///   q = probability of losing (1 - p)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KellyPositionSizer {
    /// Fractional Kelly multiplier (0.5 for half-Kelly)
    pub kelly_multiplier: f64,

    /// Bounds applied to the adjusted Kelly fraction
    pub min_kelly_fraction: f64,
    pub max_kelly_fraction: f64,

    /// Payoff ratio assumed when there is no history and the signal has no
    /// risk/reward of its own
    pub default_payoff: f64,

    /// Caps for agents trading from the shared pool
    pub pooled_cap: BalanceCap,

    /// Caps for agents trading their own balance
    pub individual_cap: BalanceCap,

    /// Hard ceiling as a fraction of balance, whatever the agent type
    pub max_balance_fraction: f64,

    /// Below this balance nothing is sized
    pub min_balance: f64,

    /// Volatility (percent) above which leverage is scaled down
    pub volatility_threshold: f64,
    pub volatility_leverage_factor: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BalanceCap {
    pub fraction: f64,
    pub ceiling_usd: f64,
}

impl BalanceCap {
    pub fn limit(&self, balance: f64) -> f64 {
        (balance * self.fraction).min(self.ceiling_usd)
    }
}

/// Recent performance used for the Kelly fraction
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TradeStats {
    /// Win rate (0.0 to 1.0)
    pub win_rate: f64,
    /// Average winning P&L (positive)
    pub avg_win: f64,
    /// Average losing P&L (positive)
    pub avg_loss: f64,
    pub num_trades: usize,
}

impl Default for TradeStats {
    fn default() -> Self {
        Self {
            win_rate: 0.5,
            avg_win: 0.0,
            avg_loss: 0.0,
            num_trades: 0,
        }
    }
}

impl TradeStats {
    /// Stats over the first `STATS_WINDOW` trades of a most-recent-first list.
    pub fn from_trades(trades: &[ClosedTrade]) -> Self {
        let recent = &trades[..trades.len().min(STATS_WINDOW)];
        if recent.is_empty() {
            return Self::default();
        }

        let wins: Vec<f64> = recent.iter().filter(|t| t.is_win()).map(|t| t.realized_pnl).collect();
        let losses: Vec<f64> = recent
            .iter()
            .filter(|t| !t.is_win())
            .map(|t| t.realized_pnl.abs())
            .collect();

        let mean = |v: &[f64]| if v.is_empty() { 0.0 } else { v.iter().sum::<f64>() / v.len() as f64 };

        Self {
            win_rate: wins.len() as f64 / recent.len() as f64,
            avg_win: mean(&wins),
            avg_loss: mean(&losses),
            num_trades: recent.len(),
        }
    }

    /// True when both a win and a loss average exist
    pub fn has_payoff(&self) -> bool {
        self.avg_win > 0.0 && self.avg_loss > 0.0
    }
}

#[derive(Debug, Clone)]
pub struct SizingRequest<'a> {
    pub signal: &'a TradingSignal,
    pub balance: f64,
    pub use_pooled_balance: bool,
    pub stats: TradeStats,
    /// Current circuit-breaker trade ceiling
    pub max_trade_usd: f64,
}

/// Position sizing recommendation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PositionSize {
    /// Collateral committed, USD
    pub collateral_usd: f64,
    pub leverage: f64,
    /// Quantity of the asset at the signal's entry price
    pub quantity: f64,
    /// Kelly fraction before bounds
    pub raw_kelly_fraction: f64,
    /// Fraction of balance actually used
    pub fraction: f64,
    pub reasoning: String,
}

impl PositionSize {
    pub fn notional_usd(&self) -> f64 {
        self.collateral_usd * self.leverage
    }
}

#[derive(Debug, Clone)]
pub enum Sizing {
    Trade(PositionSize),
    /// Nothing should be traded; equivalent to Hold
    Skip { reason: String },
}

impl Default for KellyPositionSizer {
    fn default() -> Self {
        Self {
            kelly_multiplier: 0.5,
            min_kelly_fraction: 0.10,
            max_kelly_fraction: 0.25,
            default_payoff: 2.0,
            pooled_cap: BalanceCap {
                fraction: 0.25,
                ceiling_usd: 500.0,
            },
            individual_cap: BalanceCap {
                fraction: 0.35,
                ceiling_usd: 1000.0,
            },
            max_balance_fraction: 0.40,
            min_balance: 3.0,
            volatility_threshold: 3.0,
            volatility_leverage_factor: 0.6,
        }
    }
}

impl KellyPositionSizer {
    pub fn new(kelly_multiplier: f64, min_kelly_fraction: f64, max_kelly_fraction: f64, min_balance: f64) -> Result<Self> {
        if kelly_multiplier <= 0.0 || kelly_multiplier > 1.0 {
            bail!("kelly_multiplier must be between 0 and 1");
        }
        if min_kelly_fraction < 0.0 || min_kelly_fraction > max_kelly_fraction {
            bail!("min_kelly_fraction must be >= 0 and <= max_kelly_fraction");
        }
        if max_kelly_fraction <= 0.0 || max_kelly_fraction > 1.0 {
            bail!("max_kelly_fraction must be between 0 and 1");
        }
        if min_balance < 0.0 {
            bail!("min_balance must be non-negative");
        }

        Ok(Self {
            kelly_multiplier,
            min_kelly_fraction,
            max_kelly_fraction,
            min_balance,
            ..Self::default()
        })
    }

    /// Half-Kelly fraction scaled by confidence, before bounds.
    pub fn kelly_fraction(&self, stats: &TradeStats, signal: &TradingSignal) -> f64 {
        let p = stats.win_rate.clamp(0.0, 1.0);
        let q = 1.0 - p;
        let b = if stats.has_payoff() {
            stats.avg_win / stats.avg_loss
        } else if signal.risk_reward_ratio > 0.0 {
            signal.risk_reward_ratio
        } else {
            self.default_payoff
        };

        let raw = (p * b - q) / b;
        raw * self.kelly_multiplier * (0.5 + signal.confidence / 2.0)
    }

    /// Leverage band from confidence, reduced in volatile markets.
    pub fn leverage_for(&self, confidence: f64, volatility_pct: f64) -> f64 {
        let base: f64 = if confidence >= 0.9 {
            10.0
        } else if confidence >= 0.8 {
            6.0
        } else if confidence >= 0.7 {
            5.0
        } else if confidence >= 0.6 {
            4.0
        } else if confidence >= 0.5 {
            3.0
        } else {
            2.0
        };

        let adjusted = if volatility_pct > self.volatility_threshold {
            (base * self.volatility_leverage_factor).floor()
        } else {
            base
        };
        adjusted.clamp(MIN_LEVERAGE, MAX_LEVERAGE)
    }

    /// Largest collateral allowed for this balance and agent type.
    pub fn collateral_cap(&self, balance: f64, use_pooled_balance: bool, max_trade_usd: f64) -> f64 {
        let agent_cap = if use_pooled_balance {
            self.pooled_cap.limit(balance)
        } else {
            self.individual_cap.limit(balance)
        };
        agent_cap
            .min(balance * self.max_balance_fraction)
            .min(max_trade_usd)
    }

    pub fn size(&self, req: &SizingRequest<'_>) -> Result<Sizing> {
        let signal = req.signal;
        if !signal.is_entry() {
            bail!("cannot size a {} signal", signal.action);
        }
        if signal.entry_price <= 0.0 {
            bail!("entry price must be positive");
        }

        if req.balance < self.min_balance {
            return Ok(Sizing::Skip {
                reason: format!(
                    "balance ${:.2} below sizing floor ${:.2}",
                    req.balance, self.min_balance
                ),
            });
        }

        let volatility = signal.indicators.map(|i| i.volatility_pct).unwrap_or(0.0);
        let cap = self.collateral_cap(req.balance, req.use_pooled_balance, req.max_trade_usd);

        let (wanted, raw_kelly, leverage, basis) = if signal.position_size_usd > 0.0 {
            let leverage = signal.leverage.clamp(MIN_LEVERAGE, MAX_LEVERAGE);
            (signal.position_size_usd, 0.0, leverage, "provider size".to_string())
        } else {
            let raw = self.kelly_fraction(&req.stats, signal);
            let bounded = raw.clamp(self.min_kelly_fraction, self.max_kelly_fraction);
            let basis = format!(
                "Kelly {:.2}% (raw {:.2}%, win rate {:.0}%, {} trades)",
                bounded * 100.0,
                raw * 100.0,
                req.stats.win_rate * 100.0,
                req.stats.num_trades
            );
            (
                req.balance * bounded,
                raw,
                self.leverage_for(signal.confidence, volatility),
                basis,
            )
        };

        let collateral = wanted.min(cap);
        if collateral <= 0.0 || !collateral.is_finite() {
            return Ok(Sizing::Skip {
                reason: format!("no collateral available (cap ${:.2})", cap),
            });
        }

        let reasoning = format!(
            "{} -> ${:.2} collateral (cap ${:.2}) at {:.0}x",
            basis, collateral, cap, leverage
        );
        debug!("{}: {}", signal.symbol, reasoning);

        Ok(Sizing::Trade(PositionSize {
            collateral_usd: collateral,
            leverage,
            quantity: collateral * leverage / signal.entry_price,
            raw_kelly_fraction: raw_kelly,
            fraction: collateral / req.balance,
            reasoning,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use analysis_core::{Side, SignalAction, SignalSource};
    use approx::assert_relative_eq;
    use chrono::Utc;

    fn signal(confidence: f64) -> TradingSignal {
        TradingSignal {
            action: SignalAction::Long,
            confidence,
            stop_loss: 98.0,
            take_profit_levels: vec![104.0, 106.0, 108.0],
            risk_reward_ratio: 2.0,
            ..TradingSignal::hold("BTC", 100.0, SignalSource::Technical, "test")
        }
    }

    fn request(signal: &TradingSignal, balance: f64) -> SizingRequest<'_> {
        SizingRequest {
            signal,
            balance,
            use_pooled_balance: false,
            stats: TradeStats::default(),
            max_trade_usd: 1000.0,
        }
    }

    fn trade(pnl: f64) -> ClosedTrade {
        ClosedTrade {
            id: "t".into(),
            agent_id: "a".into(),
            symbol: "BTC".into(),
            side: Side::Long,
            entry_price: 100.0,
            exit_price: 100.0 + pnl,
            quantity: 1.0,
            collateral_usd: 10.0,
            realized_pnl: pnl,
            opened_at: Utc::now(),
            closed_at: Utc::now(),
            exit_reason: "test".into(),
        }
    }

    fn expect_trade(sizing: Sizing) -> PositionSize {
        match sizing {
            Sizing::Trade(size) => size,
            Sizing::Skip { reason } => panic!("expected a trade, got skip: {reason}"),
        }
    }

    #[test]
    fn test_no_history_half_kelly_fallback() {
        let s = signal(0.80);
        let size = expect_trade(KellyPositionSizer::default().size(&request(&s, 100.0)).unwrap());

        // (0.5 * 2 - 0.5) / 2 = 0.25, half = 0.125, x 0.9 = 0.1125
        assert_relative_eq!(size.collateral_usd, 11.25, epsilon = 1e-9);
        assert!(size.collateral_usd >= 10.0 && size.collateral_usd <= 25.0);
        assert_eq!(size.leverage, 6.0);
        assert_relative_eq!(size.quantity, 11.25 * 6.0 / 100.0, epsilon = 1e-9);
    }

    #[test]
    fn test_negative_edge_floors_at_minimum_fraction() {
        let s = signal(0.5);
        let mut req = request(&s, 100.0);
        req.stats = TradeStats::from_trades(&[trade(-5.0), trade(-5.0), trade(-5.0), trade(2.0)]);

        let size = expect_trade(KellyPositionSizer::default().size(&req).unwrap());
        assert!(size.raw_kelly_fraction < 0.0);
        assert_relative_eq!(size.fraction, 0.10, epsilon = 1e-9);
    }

    #[test]
    fn test_strong_edge_caps_at_maximum_fraction() {
        let s = signal(1.0);
        let mut req = request(&s, 100.0);
        req.stats = TradeStats {
            win_rate: 0.8,
            avg_win: 30.0,
            avg_loss: 5.0,
            num_trades: 20,
        };
        let size = expect_trade(KellyPositionSizer::default().size(&req).unwrap());
        assert_relative_eq!(size.collateral_usd, 25.0, epsilon = 1e-9);
    }

    #[test]
    fn test_stats_use_recent_window() {
        let mut trades: Vec<ClosedTrade> = (0..20).map(|_| trade(10.0)).collect();
        trades.extend((0..30).map(|_| trade(-10.0)));
        let stats = TradeStats::from_trades(&trades);
        assert_eq!(stats.num_trades, 20);
        assert_eq!(stats.win_rate, 1.0);
        assert_eq!(stats.avg_loss, 0.0);
        assert!(!stats.has_payoff());
    }

    #[test]
    fn test_provider_size_is_capped() {
        let mut s = signal(0.9);
        s.position_size_usd = 500.0;
        s.leverage = 8.0;

        let size = expect_trade(KellyPositionSizer::default().size(&request(&s, 1000.0)).unwrap());
        // individual cap: min(350, 1000), 40% = 400
        assert_relative_eq!(size.collateral_usd, 350.0, epsilon = 1e-9);
        assert_eq!(size.leverage, 8.0);
    }

    #[test]
    fn test_pooled_agents_get_tighter_cap() {
        let sizer = KellyPositionSizer::default();
        assert_relative_eq!(sizer.collateral_cap(4000.0, true, 1000.0), 500.0);
        assert_relative_eq!(sizer.collateral_cap(4000.0, false, 1000.0), 1000.0);
        assert_relative_eq!(sizer.collateral_cap(1000.0, true, 1000.0), 250.0);
        assert_relative_eq!(sizer.collateral_cap(1000.0, false, 100.0), 100.0);
    }

    #[test]
    fn test_never_exceeds_trade_or_balance_limit() {
        let sizer = KellyPositionSizer::default();
        for balance in [3.0, 10.0, 100.0, 999.0, 5000.0, 100_000.0] {
            for max_trade in [5.0, 50.0, 1000.0] {
                for provider_size in [0.0, 1.0, 10_000.0] {
                    let mut s = signal(0.95);
                    s.position_size_usd = provider_size;
                    let mut req = request(&s, balance);
                    req.max_trade_usd = max_trade;
                    if let Sizing::Trade(size) = sizer.size(&req).unwrap() {
                        assert!(size.collateral_usd > 0.0);
                        assert!(size.collateral_usd <= max_trade.min(0.4 * balance) + 1e-9);
                    }
                }
            }
        }
    }

    #[test]
    fn test_low_balance_skips() {
        let s = signal(0.8);
        let sizing = KellyPositionSizer::default().size(&request(&s, 2.5)).unwrap();
        assert!(matches!(sizing, Sizing::Skip { .. }));
    }

    #[test]
    fn test_leverage_bands() {
        let sizer = KellyPositionSizer::default();
        assert_eq!(sizer.leverage_for(0.95, 1.0), 10.0);
        assert_eq!(sizer.leverage_for(0.75, 1.0), 5.0);
        assert_eq!(sizer.leverage_for(0.3, 1.0), 2.0);
        // 40% reduction in volatile markets
        assert_eq!(sizer.leverage_for(0.95, 4.0), 6.0);
        assert_eq!(sizer.leverage_for(0.3, 4.0), 1.0);
    }

    #[test]
    fn test_hold_cannot_be_sized() {
        let s = TradingSignal::hold("BTC", 100.0, SignalSource::Technical, "x");
        assert!(KellyPositionSizer::default().size(&request(&s, 100.0)).is_err());
    }

    #[test]
    fn test_invalid_parameters_rejected() {
        assert!(KellyPositionSizer::new(0.0, 0.1, 0.25, 3.0).is_err());
        assert!(KellyPositionSizer::new(0.5, 0.3, 0.25, 3.0).is_err());
        assert!(KellyPositionSizer::new(0.5, 0.1, 0.25, 3.0).is_ok());
    }
}
