use analysis_core::{MarketRegime, PriceSeries, RegimeKind, TechnicalIndicators};
use log::{debug, warn};
use serde::{Deserialize, Serialize};

/// Thresholds that decide the regime. Downstream confidence floors are tuned
/// against these exact values.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RegimeThresholds {
    /// Volatility (percent of price) above which a market may be volatile
    pub volatile_pct: f64,
    /// Bollinger width that must also be exceeded for a volatile market
    pub volatile_band_width: f64,
    /// Momentum (percent) that maps to full trend strength
    pub full_strength_momentum: f64,
    /// Minimum strength reported while an EMA stack holds
    pub trend_strength_floor: f64,
    pub trend_confidence: f64,
    pub volatile_confidence: f64,
    pub ranging_confidence: f64,
}

impl Default for RegimeThresholds {
    fn default() -> Self {
        Self {
            volatile_pct: 3.0,
            volatile_band_width: 0.05,
            full_strength_momentum: 10.0,
            trend_strength_floor: 0.6,
            trend_confidence: 0.9,
            volatile_confidence: 0.8,
            ranging_confidence: 0.7,
        }
    }
}

/// Labels the current market from its indicator snapshot.
///
/// Rules are evaluated in a fixed order and the first match wins:
/// volatile, bullish EMA stack, bearish EMA stack, otherwise ranging.
#[derive(Debug, Clone, Default)]
pub struct RegimeClassifier {
    thresholds: RegimeThresholds,
}

impl RegimeClassifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_thresholds(thresholds: RegimeThresholds) -> Self {
        Self { thresholds }
    }

    pub fn thresholds(&self) -> &RegimeThresholds {
        &self.thresholds
    }

    pub fn classify(&self, series: &PriceSeries, indicators: &TechnicalIndicators) -> MarketRegime {
        if let Some(last) = series.last_price() {
            if (last - indicators.price).abs() > f64::EPSILON * last.abs().max(1.0) {
                warn!(
                    "{}: indicator price {} does not match series tail {}",
                    series.symbol(),
                    indicators.price,
                    last
                );
            }
        }

        let regime = self.classify_indicators(indicators);
        debug!(
            "{}: {} (vol {:.2}%, width {:.3}, momentum {:.2}%)",
            series.symbol(),
            regime,
            indicators.volatility_pct,
            indicators.bollinger.width,
            indicators.momentum
        );
        regime
    }

    /// Classification that only needs the indicator snapshot.
    pub fn classify_indicators(&self, ind: &TechnicalIndicators) -> MarketRegime {
        let t = &self.thresholds;

        if ind.volatility_pct > t.volatile_pct && ind.bollinger.width > t.volatile_band_width {
            return MarketRegime {
                kind: RegimeKind::Volatile,
                strength: (ind.volatility_pct / (2.0 * t.volatile_pct)).min(1.0),
                confidence: t.volatile_confidence,
            };
        }

        let trend_strength = (ind.momentum.abs() / t.full_strength_momentum)
            .min(1.0)
            .max(t.trend_strength_floor);

        if ind.bullish_ema_stack() {
            return MarketRegime {
                kind: RegimeKind::TrendingUp,
                strength: trend_strength,
                confidence: t.trend_confidence,
            };
        }

        if ind.bearish_ema_stack() {
            return MarketRegime {
                kind: RegimeKind::TrendingDown,
                strength: trend_strength,
                confidence: t.trend_confidence,
            };
        }

        MarketRegime {
            kind: RegimeKind::Ranging,
            strength: (1.0 - ind.momentum.abs() / t.full_strength_momentum).clamp(0.0, 1.0),
            confidence: t.ranging_confidence,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use analysis_core::{BollingerValues, EmaStack, MacdValues};

    fn indicators(price: f64, ema: [f64; 4], volatility_pct: f64, width: f64, momentum: f64) -> TechnicalIndicators {
        TechnicalIndicators {
            price,
            rsi: 50.0,
            macd: MacdValues {
                value: 0.0,
                signal: 0.0,
                histogram: 0.0,
            },
            bollinger: BollingerValues {
                upper: price * (1.0 + width / 2.0),
                middle: price,
                lower: price * (1.0 - width / 2.0),
                width,
            },
            ema: EmaStack {
                ema9: ema[0],
                ema21: ema[1],
                ema50: ema[2],
                ema200: ema[3],
            },
            volume_ratio: 1.0,
            momentum,
            volatility_pct,
        }
    }

    #[test]
    fn test_volatile_wins_over_trend() {
        let ind = indicators(110.0, [108.0, 105.0, 100.0, 90.0], 4.5, 0.08, 12.0);
        let regime = RegimeClassifier::new().classify_indicators(&ind);
        assert_eq!(regime.kind, RegimeKind::Volatile);
        assert_eq!(regime.confidence, 0.8);
        assert!((regime.strength - 0.75).abs() < 1e-12);
    }

    #[test]
    fn test_volatility_alone_is_not_volatile() {
        let ind = indicators(110.0, [108.0, 105.0, 100.0, 90.0], 4.5, 0.02, 2.0);
        let regime = RegimeClassifier::new().classify_indicators(&ind);
        assert_eq!(regime.kind, RegimeKind::TrendingUp);
    }

    #[test]
    fn test_uptrend_strength_floor() {
        let ind = indicators(110.0, [108.0, 105.0, 100.0, 90.0], 1.0, 0.02, 2.0);
        let regime = RegimeClassifier::new().classify_indicators(&ind);
        assert_eq!(regime.kind, RegimeKind::TrendingUp);
        assert_eq!(regime.strength, 0.6);
        assert_eq!(regime.confidence, 0.9);
    }

    #[test]
    fn test_uptrend_strong_momentum() {
        let ind = indicators(110.0, [108.0, 105.0, 100.0, 90.0], 1.0, 0.02, 8.0);
        let regime = RegimeClassifier::new().classify_indicators(&ind);
        assert!((regime.strength - 0.8).abs() < 1e-12);

        let ind = indicators(110.0, [108.0, 105.0, 100.0, 90.0], 1.0, 0.02, 25.0);
        assert_eq!(RegimeClassifier::new().classify_indicators(&ind).strength, 1.0);
    }

    #[test]
    fn test_downtrend_detection() {
        let ind = indicators(90.0, [92.0, 95.0, 100.0, 110.0], 1.0, 0.02, -7.0);
        let regime = RegimeClassifier::new().classify_indicators(&ind);
        assert_eq!(regime.kind, RegimeKind::TrendingDown);
        assert!((regime.strength - 0.7).abs() < 1e-12);
    }

    #[test]
    fn test_broken_stack_is_ranging() {
        // price above EMA9 but EMA21 below EMA50
        let ind = indicators(110.0, [108.0, 99.0, 100.0, 90.0], 1.0, 0.02, 3.0);
        let regime = RegimeClassifier::new().classify_indicators(&ind);
        assert_eq!(regime.kind, RegimeKind::Ranging);
        assert_eq!(regime.confidence, 0.7);
        assert!((regime.strength - 0.7).abs() < 1e-12);
    }

    #[test]
    fn test_exactly_one_regime() {
        let classifier = RegimeClassifier::new();
        for vol in [0.5, 3.0, 3.1, 8.0] {
            for width in [0.01, 0.05, 0.06] {
                let ind = indicators(110.0, [108.0, 105.0, 100.0, 90.0], vol, width, 4.0);
                let regime = classifier.classify_indicators(&ind);
                let volatile = vol > 3.0 && width > 0.05;
                assert_eq!(regime.kind == RegimeKind::Volatile, volatile);
                assert_eq!(regime.kind == RegimeKind::TrendingUp, !volatile);
            }
        }
    }
}
