use analysis_core::{
    BollingerValues, EmaStack, MacdValues, MarketRegime, OpenPosition, PricePoint, PriceSeries,
    RegimeKind, TechnicalIndicators,
};
use chrono::{Duration, TimeZone, Utc};

use crate::MarketContext;

/// Neutral snapshot: no breakout, RSI 50, bands +-2%, 1% volatility.
pub fn indicators(price: f64) -> TechnicalIndicators {
    TechnicalIndicators {
        price,
        rsi: 50.0,
        macd: MacdValues {
            value: 0.0,
            signal: 0.0,
            histogram: 0.0,
        },
        bollinger: BollingerValues {
            upper: price * 1.02,
            middle: price,
            lower: price * 0.98,
            width: 0.04,
        },
        ema: EmaStack {
            ema9: price,
            ema21: price,
            ema50: price,
            ema200: price,
        },
        volume_ratio: 1.0,
        momentum: 0.0,
        volatility_pct: 1.0,
    }
}

pub fn regime(kind: RegimeKind, strength: f64) -> MarketRegime {
    let confidence = match kind {
        RegimeKind::TrendingUp | RegimeKind::TrendingDown => 0.9,
        RegimeKind::Volatile => 0.8,
        RegimeKind::Ranging => 0.7,
    };
    MarketRegime {
        kind,
        strength,
        confidence,
    }
}

/// Hourly series starting 2024-01-01 00:00 UTC.
pub fn series_with(prices: &[f64]) -> PriceSeries {
    let start = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
    let points = prices
        .iter()
        .enumerate()
        .map(|(i, &price)| PricePoint {
            timestamp: start + Duration::hours(i as i64),
            price,
            volume: 1000.0,
        })
        .collect();
    PriceSeries::new("BTC", points).unwrap()
}

pub fn context(
    indicators: TechnicalIndicators,
    regime: MarketRegime,
    balance: f64,
    position: Option<OpenPosition>,
) -> MarketContext {
    MarketContext {
        symbol: "BTC".to_string(),
        series: series_with(&[indicators.price; 5]),
        indicators,
        regime,
        balance,
        position,
    }
}

pub fn position(side: analysis_core::Side, entry: f64) -> OpenPosition {
    OpenPosition {
        id: "pos-1".to_string(),
        agent_id: "agent-1".to_string(),
        symbol: "BTC".to_string(),
        side,
        entry_price: entry,
        quantity: 1.0,
        collateral_usd: 25.0,
        leverage: 3.0,
        stop_loss: 0.0,
        take_profit: 0.0,
        opened_at: Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap(),
    }
}
