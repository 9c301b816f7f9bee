use analysis_core::{RegimeKind, Side, SignalAction, SignalSource, TradingSignal, MIN_LEVERAGE};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::{MarketContext, SignalError, SignalProvider};

/// Tunables of the rule-based strategy. Scores are on a 0-100 scale.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TechnicalRules {
    pub oversold_rsi: f64,
    pub overbought_rsi: f64,
    pub trend_volume_ratio: f64,
    pub breakout_momentum: f64,
    pub breakout_volume_ratio: f64,
    pub stop_atr: f64,
    pub mean_reversion_band_atr: f64,
    pub take_profit_atr: [f64; 3],
    pub min_risk_reward: f64,
}

impl Default for TechnicalRules {
    fn default() -> Self {
        Self {
            oversold_rsi: 30.0,
            overbought_rsi: 70.0,
            trend_volume_ratio: 1.2,
            breakout_momentum: 3.0,
            breakout_volume_ratio: 1.5,
            stop_atr: 1.5,
            mean_reversion_band_atr: 0.5,
            take_profit_atr: [2.0, 3.0, 4.0],
            min_risk_reward: 1.8,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum Setup {
    Breakout,
    MeanReversion,
    TrendFollowing,
}

impl Setup {
    fn label(&self) -> &'static str {
        match self {
            Setup::Breakout => "momentum breakout",
            Setup::MeanReversion => "mean reversion",
            Setup::TrendFollowing => "trend following",
        }
    }
}

/// Deterministic regime-conditioned rules. Also serves as the fallback of the
/// AI provider, so it never fails once a context exists.
#[derive(Debug, Clone, Default)]
pub struct TechnicalProvider {
    rules: TechnicalRules,
}

impl TechnicalProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_rules(rules: TechnicalRules) -> Self {
        Self { rules }
    }

    /// Direction, setup and 0-100 score, or the reason for standing aside.
    fn find_setup(&self, ctx: &MarketContext) -> Result<(Side, Setup, f64), String> {
        let ind = &ctx.indicators;
        let r = &self.rules;

        if ind.momentum.abs() > r.breakout_momentum
            && ind.volume_ratio > r.breakout_volume_ratio
            && ind.macd.histogram > 0.0
        {
            let score = 55.0 + ind.momentum.abs() * 4.0 + (ind.volume_ratio - r.breakout_volume_ratio) * 10.0;
            return Ok((Side::Long, Setup::Breakout, score.min(90.0)));
        }

        match ctx.regime.kind {
            RegimeKind::Volatile => Err(format!(
                "volatile market ({:.2}% volatility), standing aside",
                ind.volatility_pct
            )),
            RegimeKind::Ranging => {
                if ind.rsi < r.oversold_rsi && ind.price < ind.bollinger.lower {
                    let score = 50.0 + (r.oversold_rsi - ind.rsi) * 1.5;
                    Ok((Side::Long, Setup::MeanReversion, score.min(85.0)))
                } else if ind.rsi > r.overbought_rsi && ind.price > ind.bollinger.upper {
                    let score = 50.0 + (ind.rsi - r.overbought_rsi) * 1.5;
                    Ok((Side::Short, Setup::MeanReversion, score.min(85.0)))
                } else {
                    Err(format!("ranging market, RSI {:.1} inside bands", ind.rsi))
                }
            }
            RegimeKind::TrendingUp | RegimeKind::TrendingDown => {
                let side = if ctx.regime.kind == RegimeKind::TrendingUp {
                    Side::Long
                } else {
                    Side::Short
                };
                let histogram_confirms = ind.macd.histogram * side.sign() > 0.0;
                let ema_confirms = (ind.price - ind.ema.ema21) * side.sign() > 0.0;
                let volume_confirms = ind.volume_ratio > r.trend_volume_ratio;

                if histogram_confirms && ema_confirms && volume_confirms {
                    let volume_bonus = ((ind.volume_ratio - r.trend_volume_ratio) * 10.0).min(10.0);
                    let score = 50.0 + ctx.regime.strength * 30.0 + volume_bonus;
                    Ok((side, Setup::TrendFollowing, score.min(90.0)))
                } else {
                    Err(format!(
                        "{} without confirmation (histogram {}, EMA21 {}, volume {})",
                        ctx.regime.kind,
                        histogram_confirms,
                        ema_confirms,
                        volume_confirms
                    ))
                }
            }
        }
    }

    /// Evaluate the rules synchronously. Used directly by the AI fallback.
    pub fn evaluate(&self, ctx: &MarketContext) -> TradingSignal {
        let price = ctx.price();
        let hold = |reason: String| {
            TradingSignal::hold(&ctx.symbol, price, SignalSource::Technical, reason)
                .with_context(ctx.regime, ctx.indicators)
        };

        let (side, setup, score) = match self.find_setup(ctx) {
            Ok(found) => found,
            Err(reason) => return hold(reason),
        };

        let r = &self.rules;
        let atr = ctx.atr();
        let sign = side.sign();

        let mut stop_loss = price - sign * r.stop_atr * atr;
        if setup == Setup::MeanReversion {
            let band_stop = match side {
                Side::Long => ctx.indicators.bollinger.lower - r.mean_reversion_band_atr * atr,
                Side::Short => ctx.indicators.bollinger.upper + r.mean_reversion_band_atr * atr,
            };
            stop_loss = match side {
                Side::Long => stop_loss.min(band_stop),
                Side::Short => stop_loss.max(band_stop),
            };
        }
        let take_profit_levels: Vec<f64> = r.take_profit_atr.iter().map(|m| price + sign * m * atr).collect();

        let risk = (price - stop_loss).abs();
        let reward = (take_profit_levels[1] - price).abs();
        let risk_reward_ratio = if risk > 0.0 { reward / risk } else { 0.0 };

        if risk_reward_ratio < r.min_risk_reward || stop_loss <= 0.0 {
            return hold(format!(
                "{} {} rejected: risk/reward {:.2} below {:.1}",
                setup.label(),
                side,
                risk_reward_ratio,
                r.min_risk_reward
            ));
        }

        let action = match side {
            Side::Long => SignalAction::Long,
            Side::Short => SignalAction::Short,
        };

        TradingSignal {
            symbol: ctx.symbol.clone(),
            action,
            confidence: (score / 100.0).clamp(0.0, 1.0),
            entry_price: price,
            stop_loss,
            take_profit_levels,
            position_size_usd: 0.0,
            leverage: MIN_LEVERAGE,
            risk_reward_ratio,
            reasoning: format!(
                "{} {} in {} (RSI {:.1}, MACD hist {:.4}, volume x{:.2}), score {:.0}/100",
                setup.label(),
                side,
                ctx.regime.kind,
                ctx.indicators.rsi,
                ctx.indicators.macd.histogram,
                ctx.indicators.volume_ratio,
                score
            ),
            regime: Some(ctx.regime),
            indicators: Some(ctx.indicators),
            source: SignalSource::Technical,
        }
    }
}

#[async_trait]
impl SignalProvider for TechnicalProvider {
    fn name(&self) -> &str {
        "technical"
    }

    fn source(&self) -> SignalSource {
        SignalSource::Technical
    }

    async fn analyze(&self, ctx: &MarketContext) -> Result<TradingSignal, SignalError> {
        Ok(self.evaluate(ctx))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::*;

    #[test]
    fn breakout_overrides_regime() {
        let mut ind = indicators(100.0);
        ind.momentum = 4.0;
        ind.volume_ratio = 2.0;
        ind.macd.histogram = 0.5;
        let ctx = context(ind, regime(RegimeKind::Volatile, 0.8), 100.0, None);

        let signal = TechnicalProvider::new().evaluate(&ctx);
        assert_eq!(signal.action, SignalAction::Long);
        // 55 + 16 + 5
        assert!((signal.confidence - 0.76).abs() < 1e-9);
        assert!(signal.validate().is_ok());
    }

    #[test]
    fn volatile_without_breakout_holds() {
        let ctx = context(indicators(100.0), regime(RegimeKind::Volatile, 0.8), 100.0, None);
        let signal = TechnicalProvider::new().evaluate(&ctx);
        assert_eq!(signal.action, SignalAction::Hold);
        assert!(signal.reasoning.contains("volatile"));
    }

    #[test]
    fn trend_following_long_uses_atr_ladder() {
        let mut ind = indicators(100.0);
        ind.macd.histogram = 0.2;
        ind.ema.ema21 = 98.0;
        ind.volume_ratio = 1.4;
        ind.volatility_pct = 2.0; // ATR = 2.0
        let ctx = context(ind, regime(RegimeKind::TrendingUp, 0.6), 100.0, None);

        let signal = TechnicalProvider::new().evaluate(&ctx);
        assert_eq!(signal.action, SignalAction::Long);
        assert!((signal.stop_loss - 97.0).abs() < 1e-9);
        assert_eq!(signal.take_profit_levels.len(), 3);
        assert!((signal.take_profit_levels[0] - 104.0).abs() < 1e-9);
        assert!((signal.take_profit_levels[2] - 108.0).abs() < 1e-9);
        assert!((signal.risk_reward_ratio - 2.0).abs() < 1e-9);
        // 50 + 18 + 2
        assert!((signal.confidence - 0.70).abs() < 1e-9);
    }

    #[test]
    fn trend_without_volume_confirmation_holds() {
        let mut ind = indicators(100.0);
        ind.macd.histogram = 0.2;
        ind.ema.ema21 = 98.0;
        ind.volume_ratio = 1.0;
        let ctx = context(ind, regime(RegimeKind::TrendingUp, 0.9), 100.0, None);
        assert_eq!(TechnicalProvider::new().evaluate(&ctx).action, SignalAction::Hold);
    }

    #[test]
    fn downtrend_goes_short() {
        let mut ind = indicators(100.0);
        ind.macd.histogram = -0.2;
        ind.ema.ema21 = 103.0;
        ind.volume_ratio = 1.5;
        let ctx = context(ind, regime(RegimeKind::TrendingDown, 0.7), 100.0, None);

        let signal = TechnicalProvider::new().evaluate(&ctx);
        assert_eq!(signal.action, SignalAction::Short);
        assert!(signal.stop_loss > 100.0);
        assert!(signal.take_profit_levels.iter().all(|tp| *tp < 100.0));
    }

    #[test]
    fn mean_reversion_with_deep_band_fails_risk_reward() {
        let mut ind = indicators(100.0);
        ind.rsi = 22.0;
        ind.volatility_pct = 1.0; // ATR = 1.0
        ind.bollinger.lower = 100.5;
        let ctx = context(ind, regime(RegimeKind::Ranging, 0.7), 100.0, None);
        // price below lower band, stop = min(98.5, 100.0) = 98.5, RR = 3/1.5 = 2
        let signal = TechnicalProvider::new().evaluate(&ctx);
        assert_eq!(signal.action, SignalAction::Long);
        assert!((signal.stop_loss - 98.5).abs() < 1e-9);

        let mut rules = TechnicalRules::default();
        rules.mean_reversion_band_atr = 3.0;
        let mut ind = ind;
        ind.bollinger.lower = 100.2;
        let ctx = context(ind, regime(RegimeKind::Ranging, 0.7), 100.0, None);
        let signal = TechnicalProvider::with_rules(rules).evaluate(&ctx);
        // stop = min(98.5, 97.2), RR = 3 / 2.8
        assert_eq!(signal.action, SignalAction::Hold);
        assert!(signal.reasoning.contains("risk/reward"));
    }

    #[test]
    fn overbought_above_band_goes_short() {
        let mut ind = indicators(100.0);
        ind.rsi = 78.0;
        ind.bollinger.upper = 99.0;
        let ctx = context(ind, regime(RegimeKind::Ranging, 0.7), 100.0, None);
        let signal = TechnicalProvider::new().evaluate(&ctx);
        assert_eq!(signal.action, SignalAction::Short);
        assert!((signal.confidence - 0.62).abs() < 1e-9);
    }
}
