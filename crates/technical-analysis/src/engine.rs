use analysis_core::{
    AnalysisError, BollingerValues, EmaStack, MacdValues, PriceSeries, TechnicalIndicators,
};

use crate::indicators::*;

pub const RSI_PERIOD: usize = 14;
pub const MACD_FAST: usize = 12;
pub const MACD_SLOW: usize = 26;
pub const BOLLINGER_PERIOD: usize = 20;
pub const BOLLINGER_STD_DEV: f64 = 2.0;
pub const VOLATILITY_PERIOD: usize = 14;
pub const MOMENTUM_PERIOD: usize = 10;
pub const VOLUME_PERIOD: usize = 20;

/// Computes the indicator snapshot for one series. Stateless: every call only
/// reads the series it is handed, so one engine can be shared by all agent
/// pipelines.
#[derive(Debug, Clone, Copy, Default)]
pub struct IndicatorEngine;

impl IndicatorEngine {
    /// EMA200 is the longest lookback.
    pub const MIN_HISTORY: usize = 200;

    pub fn new() -> Self {
        Self
    }

    pub fn compute(&self, series: &PriceSeries) -> Result<TechnicalIndicators, AnalysisError> {
        if series.len() < Self::MIN_HISTORY {
            return Err(AnalysisError::InsufficientHistory {
                required: Self::MIN_HISTORY,
                actual: series.len(),
            });
        }

        let prices = series.prices();
        let volumes = series.volumes();
        let price = prices[prices.len() - 1];

        let missing = |name: &str| AnalysisError::InvalidData(format!("{name} could not be computed"));

        let rsi = rsi(&prices, RSI_PERIOD).ok_or_else(|| missing("RSI"))?;
        let macd = macd(&prices, MACD_FAST, MACD_SLOW).ok_or_else(|| missing("MACD"))?;
        let bands = bollinger_bands(&prices, BOLLINGER_PERIOD, BOLLINGER_STD_DEV)
            .ok_or_else(|| missing("Bollinger Bands"))?;

        let ema = EmaStack {
            ema9: ema_last(&prices, 9).ok_or_else(|| missing("EMA9"))?,
            ema21: ema_last(&prices, 21).ok_or_else(|| missing("EMA21"))?,
            ema50: ema_last(&prices, 50).ok_or_else(|| missing("EMA50"))?,
            ema200: ema_last(&prices, 200).ok_or_else(|| missing("EMA200"))?,
        };

        let indicators = TechnicalIndicators {
            price,
            rsi,
            macd: MacdValues {
                value: macd.macd,
                signal: macd.signal,
                histogram: macd.histogram,
            },
            bollinger: BollingerValues {
                upper: bands.upper,
                middle: bands.middle,
                lower: bands.lower,
                width: bands.width(),
            },
            ema,
            volume_ratio: volume_ratio(&volumes, VOLUME_PERIOD).unwrap_or(1.0),
            momentum: rate_of_change(&prices, MOMENTUM_PERIOD).unwrap_or(0.0),
            volatility_pct: volatility_pct(&prices, VOLATILITY_PERIOD).unwrap_or(0.0),
        };

        tracing::debug!(
            symbol = series.symbol(),
            rsi = indicators.rsi,
            macd_histogram = indicators.macd.histogram,
            volatility_pct = indicators.volatility_pct,
            momentum = indicators.momentum,
            "Computed indicators"
        );

        Ok(indicators)
    }
}
