use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::AnalysisError;

/// Single observation of a traded market
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PricePoint {
    pub timestamp: DateTime<Utc>,
    pub price: f64,
    pub volume: f64,
}

/// Immutable price/volume history for one symbol, ordered by timestamp.
///
/// Construction validates the ordering so every consumer can index from the
/// back (`last()`) without re-checking.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PriceSeries {
    symbol: String,
    points: Vec<PricePoint>,
}

impl PriceSeries {
    pub fn new(symbol: impl Into<String>, points: Vec<PricePoint>) -> Result<Self, AnalysisError> {
        let symbol = symbol.into();
        for pair in points.windows(2) {
            if pair[1].timestamp <= pair[0].timestamp {
                return Err(AnalysisError::InvalidData(format!(
                    "{}: timestamps must be strictly increasing ({} then {})",
                    symbol, pair[0].timestamp, pair[1].timestamp
                )));
            }
        }
        if let Some(bad) = points
            .iter()
            .find(|p| !p.price.is_finite() || p.price <= 0.0 || !p.volume.is_finite() || p.volume < 0.0)
        {
            return Err(AnalysisError::InvalidData(format!(
                "{}: invalid point at {} (price={}, volume={})",
                symbol, bad.timestamp, bad.price, bad.volume
            )));
        }
        Ok(Self { symbol, points })
    }

    pub fn symbol(&self) -> &str {
        &self.symbol
    }

    pub fn points(&self) -> &[PricePoint] {
        &self.points
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    pub fn prices(&self) -> Vec<f64> {
        self.points.iter().map(|p| p.price).collect()
    }

    pub fn volumes(&self) -> Vec<f64> {
        self.points.iter().map(|p| p.volume).collect()
    }

    pub fn last(&self) -> Option<&PricePoint> {
        self.points.last()
    }

    pub fn last_price(&self) -> Option<f64> {
        self.points.last().map(|p| p.price)
    }

    /// Highest and lowest price observed at or after `since`.
    pub fn extremes_since(&self, since: DateTime<Utc>) -> Option<(f64, f64)> {
        self.points
            .iter()
            .filter(|p| p.timestamp >= since)
            .fold(None, |acc, p| match acc {
                None => Some((p.price, p.price)),
                Some((hi, lo)) => Some((hi.max(p.price), lo.min(p.price))),
            })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MacdValues {
    pub value: f64,
    pub signal: f64,
    pub histogram: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BollingerValues {
    pub upper: f64,
    pub middle: f64,
    pub lower: f64,
    /// (upper - lower) / middle
    pub width: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct EmaStack {
    pub ema9: f64,
    pub ema21: f64,
    pub ema50: f64,
    pub ema200: f64,
}

/// Indicator snapshot derived from a `PriceSeries`. Never a source of truth:
/// recomputed every cycle.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TechnicalIndicators {
    pub price: f64,
    pub rsi: f64,
    pub macd: MacdValues,
    pub bollinger: BollingerValues,
    pub ema: EmaStack,
    /// Last volume relative to the 20-period average volume
    pub volume_ratio: f64,
    /// 10-period rate of change, percent
    pub momentum: f64,
    /// 14-period mean absolute price change as percent of last price
    pub volatility_pct: f64,
}

impl TechnicalIndicators {
    /// ATR-style absolute price movement implied by `volatility_pct`.
    pub fn atr(&self) -> f64 {
        self.price * self.volatility_pct / 100.0
    }

    pub fn bullish_ema_stack(&self) -> bool {
        self.price > self.ema.ema9
            && self.ema.ema9 > self.ema.ema21
            && self.ema.ema21 > self.ema.ema50
            && self.ema.ema50 > self.ema.ema200
    }

    pub fn bearish_ema_stack(&self) -> bool {
        self.price < self.ema.ema9
            && self.ema.ema9 < self.ema.ema21
            && self.ema.ema21 < self.ema.ema50
            && self.ema.ema50 < self.ema.ema200
    }
}

/// Market regime classification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RegimeKind {
    TrendingUp,
    TrendingDown,
    Ranging,
    Volatile,
}

impl RegimeKind {
    pub fn name(&self) -> &'static str {
        match self {
            RegimeKind::TrendingUp => "Trending Up",
            RegimeKind::TrendingDown => "Trending Down",
            RegimeKind::Ranging => "Ranging",
            RegimeKind::Volatile => "Volatile",
        }
    }
}

impl std::fmt::Display for RegimeKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MarketRegime {
    pub kind: RegimeKind,
    /// 0.0 to 1.0
    pub strength: f64,
    /// 0.0 to 1.0
    pub confidence: f64,
}

impl MarketRegime {
    /// True when the regime is a trend running against a position on `side`.
    pub fn opposes(&self, side: crate::Side) -> bool {
        matches!(
            (self.kind, side),
            (RegimeKind::TrendingDown, crate::Side::Long) | (RegimeKind::TrendingUp, crate::Side::Short)
        )
    }
}

impl std::fmt::Display for MarketRegime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} (strength {:.2}, confidence {:.2})",
            self.kind, self.strength, self.confidence
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn point(minutes: i64, price: f64) -> PricePoint {
        PricePoint {
            timestamp: DateTime::<Utc>::UNIX_EPOCH + Duration::minutes(minutes),
            price,
            volume: 10.0,
        }
    }

    #[test]
    fn rejects_out_of_order_timestamps() {
        let err = PriceSeries::new("BTC", vec![point(2, 1.0), point(1, 1.0)]).unwrap_err();
        assert!(matches!(err, AnalysisError::InvalidData(_)));
    }

    #[test]
    fn rejects_duplicate_timestamps() {
        assert!(PriceSeries::new("BTC", vec![point(1, 1.0), point(1, 2.0)]).is_err());
    }

    #[test]
    fn rejects_non_positive_price() {
        assert!(PriceSeries::new("BTC", vec![point(1, 0.0)]).is_err());
    }

    #[test]
    fn extremes_since_only_looks_forward() {
        let series = PriceSeries::new(
            "BTC",
            vec![point(0, 50.0), point(1, 10.0), point(2, 12.0), point(3, 11.0)],
        )
        .unwrap();
        let since = DateTime::<Utc>::UNIX_EPOCH + Duration::minutes(1);
        assert_eq!(series.extremes_since(since), Some((12.0, 10.0)));
    }
}
