use analysis_core::{MarketRegime, OpenPosition, PriceSeries, TechnicalIndicators};
use market_regime_detector::RegimeClassifier;
use technical_analysis::IndicatorEngine;

use crate::SignalError;

/// Everything a provider may look at for one agent in one cycle.
#[derive(Debug, Clone)]
pub struct MarketContext {
    pub symbol: String,
    pub series: PriceSeries,
    pub indicators: TechnicalIndicators,
    pub regime: MarketRegime,
    /// Balance available to the agent
    pub balance: f64,
    /// The agent's open position on `symbol`, if any
    pub position: Option<OpenPosition>,
}

impl MarketContext {
    pub fn build(
        series: PriceSeries,
        balance: f64,
        position: Option<OpenPosition>,
        engine: &IndicatorEngine,
        classifier: &RegimeClassifier,
    ) -> Result<Self, SignalError> {
        let indicators = engine.compute(&series)?;
        let regime = classifier.classify(&series, &indicators);
        Ok(Self {
            symbol: series.symbol().to_string(),
            series,
            indicators,
            regime,
            balance,
            position,
        })
    }

    pub fn price(&self) -> f64 {
        self.indicators.price
    }

    /// ATR-style move, falling back to 1% of price on a flat series.
    pub fn atr(&self) -> f64 {
        let atr = self.indicators.atr();
        if atr > 0.0 {
            atr
        } else {
            self.price() * 0.01
        }
    }

    pub fn unrealized_pnl_pct(&self) -> Option<f64> {
        self.position.as_ref().map(|p| p.unrealized_pnl_pct(self.price()))
    }
}
