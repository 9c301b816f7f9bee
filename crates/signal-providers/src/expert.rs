use analysis_core::{
    OpenPosition, RegimeKind, Side, SignalAction, SignalSource, TradingSignal,
};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::{MarketContext, SignalError, SignalProvider};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExpertRules {
    /// Minimum regime confidence before entering with the trend
    pub min_regime_confidence: f64,
    pub long_rsi: (f64, f64),
    pub short_rsi: (f64, f64),
    pub stop_pct: f64,
    pub take_profit_pct: [f64; 3],
    /// Fraction of balance suggested as collateral
    pub size_fraction: f64,
    pub min_confidence: f64,
    pub min_risk_reward: f64,
    /// Unrealized loss (percent) beyond which an RSI divergence closes
    pub divergence_loss_pct: f64,
    /// Peak gain (percent) that arms the trailing stop
    pub trailing_arm_pct: f64,
    /// Retracement from peak (percent) that fires the trailing stop
    pub trailing_stop_pct: f64,
}

impl Default for ExpertRules {
    fn default() -> Self {
        Self {
            min_regime_confidence: 0.8,
            long_rsi: (40.0, 65.0),
            short_rsi: (35.0, 60.0),
            stop_pct: 2.0,
            take_profit_pct: [4.0, 6.0, 8.0],
            size_fraction: 0.15,
            min_confidence: 0.60,
            min_risk_reward: 2.0,
            divergence_loss_pct: 5.0,
            trailing_arm_pct: 5.0,
            trailing_stop_pct: 2.0,
        }
    }
}

/// Conservative strategy: only trades confirmed trends with small size, and
/// actively manages open positions.
#[derive(Debug, Clone, Default)]
pub struct ExpertProvider {
    rules: ExpertRules,
}

impl ExpertProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_rules(rules: ExpertRules) -> Self {
        Self { rules }
    }

    fn manage_position(&self, ctx: &MarketContext, position: &OpenPosition) -> TradingSignal {
        let r = &self.rules;
        let price = ctx.price();
        let pnl = position.unrealized_pnl_pct(price);
        let close = |confidence: f64, reason: String| {
            TradingSignal::close(&ctx.symbol, price, confidence, SignalSource::Expert, reason)
                .with_context(ctx.regime, ctx.indicators)
        };

        if ctx.regime.opposes(position.side) && ctx.regime.confidence >= r.min_regime_confidence {
            return close(
                0.75,
                format!("regime reversal to {} against {} position", ctx.regime, position.side),
            );
        }

        let rsi = ctx.indicators.rsi;
        let diverging = match position.side {
            Side::Long => rsi < 40.0,
            Side::Short => rsi > 60.0,
        };
        if diverging && pnl < -r.divergence_loss_pct {
            return close(
                0.70,
                format!("RSI {:.1} diverging from {} position at {:.2}%", rsi, position.side, pnl),
            );
        }

        if let Some((high, low)) = ctx.series.extremes_since(position.opened_at) {
            let peak = match position.side {
                Side::Long => high.max(price),
                Side::Short => low.min(price),
            };
            let peak_gain = position.unrealized_pnl_pct(peak);
            let retrace = match position.side {
                Side::Long => (peak - price) / peak * 100.0,
                Side::Short => (price - peak) / peak * 100.0,
            };
            if peak_gain > r.trailing_arm_pct && retrace >= r.trailing_stop_pct {
                return close(
                    0.80,
                    format!(
                        "trailing stop: peak gain {:.2}%, retraced {:.2}% from {:.4}",
                        peak_gain, retrace, peak
                    ),
                );
            }
        }

        TradingSignal::hold(
            &ctx.symbol,
            price,
            SignalSource::Expert,
            format!("holding {} position at {:+.2}%", position.side, pnl),
        )
        .with_context(ctx.regime, ctx.indicators)
    }

    fn find_entry(&self, ctx: &MarketContext) -> TradingSignal {
        let r = &self.rules;
        let ind = &ctx.indicators;
        let price = ctx.price();

        let side = match ctx.regime.kind {
            RegimeKind::TrendingUp
                if ctx.regime.confidence >= r.min_regime_confidence
                    && (r.long_rsi.0..=r.long_rsi.1).contains(&ind.rsi)
                    && ind.macd.histogram > 0.0 =>
            {
                Side::Long
            }
            RegimeKind::TrendingDown
                if ctx.regime.confidence >= r.min_regime_confidence
                    && (r.short_rsi.0..=r.short_rsi.1).contains(&ind.rsi)
                    && ind.macd.histogram < 0.0 =>
            {
                Side::Short
            }
            _ => {
                return TradingSignal::hold(
                    &ctx.symbol,
                    price,
                    SignalSource::Expert,
                    format!("no confirmed trend entry in {}", ctx.regime),
                )
                .with_context(ctx.regime, ctx.indicators)
            }
        };

        let sign = side.sign();
        let confidence = (0.55 + ctx.regime.strength * 0.3).min(1.0);
        let stop_loss = price * (1.0 - sign * r.stop_pct / 100.0);
        let take_profit_levels: Vec<f64> = r
            .take_profit_pct
            .iter()
            .map(|pct| price * (1.0 + sign * pct / 100.0))
            .collect();
        let risk_reward_ratio = r.take_profit_pct[1] / r.stop_pct;
        let leverage = if confidence >= 0.75 { 3.0 } else { 2.0 };

        TradingSignal {
            symbol: ctx.symbol.clone(),
            action: if side == Side::Long {
                SignalAction::Long
            } else {
                SignalAction::Short
            },
            confidence,
            entry_price: price,
            stop_loss,
            take_profit_levels,
            position_size_usd: ctx.balance * r.size_fraction,
            leverage,
            risk_reward_ratio,
            reasoning: format!(
                "confirmed {} (RSI {:.1}, MACD hist {:.4})",
                ctx.regime, ind.rsi, ind.macd.histogram
            ),
            regime: Some(ctx.regime),
            indicators: Some(ctx.indicators),
            source: SignalSource::Expert,
        }
    }
}

#[async_trait]
impl SignalProvider for ExpertProvider {
    fn name(&self) -> &str {
        "expert"
    }

    fn source(&self) -> SignalSource {
        SignalSource::Expert
    }

    async fn analyze(&self, ctx: &MarketContext) -> Result<TradingSignal, SignalError> {
        Ok(match &ctx.position {
            Some(position) => self.manage_position(ctx, position),
            None => self.find_entry(ctx),
        })
    }

    fn should_trade(&self, signal: &TradingSignal) -> bool {
        match signal.action {
            SignalAction::Hold => false,
            SignalAction::Close => signal.confidence >= self.rules.min_confidence,
            SignalAction::Long | SignalAction::Short => {
                signal.confidence >= self.rules.min_confidence
                    && signal.risk_reward_ratio >= self.rules.min_risk_reward
            }
        }
    }
}
