use analysis_core::{RegimeKind, Side, SignalAction, SignalSource, TechnicalIndicators, TradingSignal};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::{MarketContext, SignalError, SignalProvider};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Urgency {
    Low,
    Medium,
    High,
    Immediate,
}

impl Urgency {
    pub fn from_confidence(confidence: f64) -> Self {
        if confidence >= 0.8 {
            Urgency::Immediate
        } else if confidence >= 0.65 {
            Urgency::High
        } else if confidence >= 0.5 {
            Urgency::Medium
        } else {
            Urgency::Low
        }
    }

    /// Share of the normal suggested size committed at this urgency
    pub fn size_factor(&self) -> f64 {
        match self {
            Urgency::Low => 0.5,
            Urgency::Medium => 0.75,
            Urgency::High | Urgency::Immediate => 1.0,
        }
    }
}

impl std::fmt::Display for Urgency {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Urgency::Low => "low",
            Urgency::Medium => "medium",
            Urgency::High => "high",
            Urgency::Immediate => "immediate",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UltraRules {
    pub oversold_rsi: f64,
    pub overbought_rsi: f64,
    pub momentum: f64,
    pub volume_ratio: f64,
    /// Score a side needs before it is traded
    pub min_score: f64,
    /// Lead the winning side needs over the other
    pub min_edge: f64,
    pub stop_atr: f64,
    pub take_profit_atr: [f64; 3],
    pub size_fraction: f64,
    pub max_leverage: f64,
    /// Unrealized loss (percent) at which an open position is cut
    pub cut_loss_pct: f64,
    pub reversal_strength: f64,
}

impl Default for UltraRules {
    fn default() -> Self {
        Self {
            oversold_rsi: 35.0,
            overbought_rsi: 65.0,
            momentum: 1.5,
            volume_ratio: 1.1,
            min_score: 0.35,
            min_edge: 0.10,
            stop_atr: 1.0,
            take_profit_atr: [1.5, 2.5, 4.0],
            size_fraction: 0.30,
            max_leverage: 10.0,
            cut_loss_pct: 3.0,
            reversal_strength: 0.6,
        }
    }
}

/// Aggressive strategy: relaxed entry rules, larger size and leverage, and a
/// quick exit on losing positions.
#[derive(Debug, Clone, Default)]
pub struct UltraProvider {
    rules: UltraRules,
}

impl UltraProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_rules(rules: UltraRules) -> Self {
        Self { rules }
    }

    /// Directional score in [0, 1] for `side`.
    fn score(&self, ind: &TechnicalIndicators, regime: RegimeKind, side: Side) -> f64 {
        let r = &self.rules;
        let s = side.sign();
        let mut score: f64 = 0.2;

        if (ind.ema.ema9 - ind.ema.ema21) * s > 0.0 {
            score += 0.15;
        }
        if ind.macd.histogram * s > 0.0 {
            score += 0.15;
        }
        if ind.momentum * s > r.momentum {
            score += 0.15;
            if ind.momentum * s > 2.0 * r.momentum {
                score += 0.10;
            }
        }
        if ind.volume_ratio > r.volume_ratio {
            score += 0.10;
        }
        let stretched = match side {
            Side::Long => ind.rsi < r.oversold_rsi,
            Side::Short => ind.rsi > r.overbought_rsi,
        };
        if stretched {
            score += 0.15;
        }
        let with_trend = matches!(
            (regime, side),
            (RegimeKind::TrendingUp, Side::Long) | (RegimeKind::TrendingDown, Side::Short)
        );
        if with_trend {
            score += 0.15;
        }

        score.min(0.95)
    }

    fn manage_position(&self, ctx: &MarketContext, side: Side, pnl: f64) -> TradingSignal {
        let r = &self.rules;
        let price = ctx.price();

        let reason = if ctx.regime.opposes(side) && ctx.regime.strength > r.reversal_strength {
            Some(format!("{} turned against {} position", ctx.regime.kind, side))
        } else if pnl <= -r.cut_loss_pct {
            Some(format!("cutting {} position at {:.2}%", side, pnl))
        } else {
            None
        };

        match reason {
            Some(reason) => TradingSignal::close(&ctx.symbol, price, 0.7, SignalSource::Ultra, reason),
            None => TradingSignal::hold(
                &ctx.symbol,
                price,
                SignalSource::Ultra,
                format!("riding {} position at {:+.2}%", side, pnl),
            ),
        }
        .with_context(ctx.regime, ctx.indicators)
    }

    pub fn evaluate(&self, ctx: &MarketContext) -> TradingSignal {
        if let Some(position) = &ctx.position {
            return self.manage_position(ctx, position.side, position.unrealized_pnl_pct(ctx.price()));
        }

        let r = &self.rules;
        let ind = &ctx.indicators;
        let price = ctx.price();

        let long = self.score(ind, ctx.regime.kind, Side::Long);
        let short = self.score(ind, ctx.regime.kind, Side::Short);
        let (side, score, other) = if long >= short {
            (Side::Long, long, short)
        } else {
            (Side::Short, short, long)
        };

        if score < r.min_score || score - other < r.min_edge {
            return TradingSignal::hold(
                &ctx.symbol,
                price,
                SignalSource::Ultra,
                format!("no edge (long {:.2}, short {:.2})", long, short),
            )
            .with_context(ctx.regime, ctx.indicators);
        }

        let urgency = Urgency::from_confidence(score);
        let atr = ctx.atr();
        let sign = side.sign();
        let stop_loss = price - sign * r.stop_atr * atr;
        let take_profit_levels: Vec<f64> = r.take_profit_atr.iter().map(|m| price + sign * m * atr).collect();

        let mut leverage = (3.0 + score * 7.0).floor().min(r.max_leverage);
        if ctx.regime.kind == RegimeKind::Volatile {
            leverage = (leverage / 2.0).floor();
        }
        let leverage = leverage.max(1.0);

        TradingSignal {
            symbol: ctx.symbol.clone(),
            action: if side == Side::Long {
                SignalAction::Long
            } else {
                SignalAction::Short
            },
            confidence: score,
            entry_price: price,
            stop_loss,
            take_profit_levels,
            position_size_usd: ctx.balance * r.size_fraction * urgency.size_factor(),
            leverage,
            risk_reward_ratio: r.take_profit_atr[1] / r.stop_atr,
            reasoning: format!(
                "{} urgency {} (score {:.2} vs {:.2}, RSI {:.1}, momentum {:+.2}%)",
                urgency, side, score, other, ind.rsi, ind.momentum
            ),
            regime: Some(ctx.regime),
            indicators: Some(ctx.indicators),
            source: SignalSource::Ultra,
        }
    }
}

#[async_trait]
impl SignalProvider for UltraProvider {
    fn name(&self) -> &str {
        "ultra"
    }

    fn source(&self) -> SignalSource {
        SignalSource::Ultra
    }

    async fn analyze(&self, ctx: &MarketContext) -> Result<TradingSignal, SignalError> {
        Ok(self.evaluate(ctx))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::*;

    fn bullish() -> TechnicalIndicators {
        let mut ind = indicators(100.0);
        ind.ema.ema9 = 101.0;
        ind.ema.ema21 = 99.0;
        ind.macd.histogram = 0.4;
        ind.momentum = 2.0;
        ind.volume_ratio = 1.3;
        ind.volatility_pct = 2.0;
        ind
    }

    #[test]
    fn bullish_setup_goes_long() {
        let ctx = context(bullish(), regime(RegimeKind::TrendingUp, 0.7), 100.0, None);
        let signal = UltraProvider::new().evaluate(&ctx);

        // 0.2 + 0.15 + 0.15 + 0.15 + 0.10 + 0.15
        assert_eq!(signal.action, SignalAction::Long);
        assert!((signal.confidence - 0.90).abs() < 1e-9);
        assert_eq!(signal.leverage, 9.0);
        assert!((signal.stop_loss - 98.0).abs() < 1e-9);
        assert!((signal.take_profit_levels[1] - 105.0).abs() < 1e-9);
        assert!((signal.position_size_usd - 30.0).abs() < 1e-9);
        assert!(signal.reasoning.starts_with("immediate"));
        assert!(signal.validate().is_ok());
    }

    #[test]
    fn volatile_regime_halves_leverage() {
        let ctx = context(bullish(), regime(RegimeKind::Volatile, 0.7), 100.0, None);
        let signal = UltraProvider::new().evaluate(&ctx);
        // score 0.75 -> floor(8.25) = 8 -> 4
        assert_eq!(signal.action, SignalAction::Long);
        assert_eq!(signal.leverage, 4.0);
    }

    #[test]
    fn score_is_capped_when_every_rule_agrees() {
        let mut ind = bullish();
        ind.momentum = 3.5;
        ind.rsi = 30.0;
        let ctx = context(ind, regime(RegimeKind::TrendingUp, 0.7), 100.0, None);
        let signal = UltraProvider::new().evaluate(&ctx);

        // raw score 1.15
        assert_eq!(signal.action, SignalAction::Long);
        assert!((signal.confidence - 0.95).abs() < 1e-9);
        assert_eq!(signal.leverage, 9.0);
    }

    #[test]
    fn neutral_market_holds() {
        let ctx = context(indicators(100.0), regime(RegimeKind::Ranging, 0.5), 100.0, None);
        assert_eq!(UltraProvider::new().evaluate(&ctx).action, SignalAction::Hold);
    }

    #[test]
    fn cuts_losing_position() {
        let ctx = context(
            indicators(96.0),
            regime(RegimeKind::Ranging, 0.5),
            100.0,
            Some(position(Side::Long, 100.0)),
        );
        let signal = UltraProvider::new().evaluate(&ctx);
        assert_eq!(signal.action, SignalAction::Close);
    }

    #[test]
    fn urgency_bands() {
        assert_eq!(Urgency::from_confidence(0.4), Urgency::Low);
        assert_eq!(Urgency::from_confidence(0.55), Urgency::Medium);
        assert_eq!(Urgency::from_confidence(0.7), Urgency::High);
        assert_eq!(Urgency::from_confidence(0.85), Urgency::Immediate);
        assert!(Urgency::Immediate > Urgency::Low);
    }
}
