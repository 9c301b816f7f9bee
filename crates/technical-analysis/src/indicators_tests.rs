#[cfg(test)]
mod tests {
    use super::super::engine::*;
    use super::super::indicators::*;
    use analysis_core::{AnalysisError, PricePoint, PriceSeries};
    use chrono::{Duration, TimeZone, Utc};

    // Helper function to create sample price data
    fn sample_prices() -> Vec<f64> {
        vec![
            44.34, 44.09, 44.15, 43.61, 44.33, 44.83, 45.10, 45.42, 45.84, 46.08,
            45.89, 46.03, 45.61, 46.28, 46.28, 46.00, 46.03, 46.41, 46.22, 45.64,
        ]
    }

    fn series_from(prices: &[f64], volumes: &[f64]) -> PriceSeries {
        let start = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let points = prices
            .iter()
            .zip(volumes)
            .enumerate()
            .map(|(i, (&price, &volume))| PricePoint {
                timestamp: start + Duration::minutes(5 * i as i64),
                price,
                volume,
            })
            .collect();
        PriceSeries::new("TEST", points).unwrap()
    }

    fn wavy_series(len: usize) -> PriceSeries {
        let prices: Vec<f64> = (0..len)
            .map(|i| 100.0 + (i as f64 * 0.3).sin() * 4.0 + i as f64 * 0.05)
            .collect();
        let volumes: Vec<f64> = (0..len).map(|i| 1000.0 + (i % 7) as f64 * 50.0).collect();
        series_from(&prices, &volumes)
    }

    #[test]
    fn test_sma_basic() {
        let data = vec![1.0, 2.0, 3.0, 4.0, 5.0];
        let result = sma(&data, 3);

        assert_eq!(result.len(), 3);
        assert!((result[0] - 2.0).abs() < 0.001);
        assert!((result[1] - 3.0).abs() < 0.001);
        assert!((result[2] - 4.0).abs() < 0.001);
    }

    #[test]
    fn test_sma_insufficient_data() {
        assert!(sma(&[1.0, 2.0], 5).is_empty());
    }

    #[test]
    fn test_ema_seeded_with_sma() {
        let prices = sample_prices();
        let result = ema(&prices, 10);

        assert_eq!(result.len(), prices.len() - 9);
        let seed = prices[..10].iter().sum::<f64>() / 10.0;
        assert!((result[0] - seed).abs() < 1e-9);

        let k = 2.0 / 11.0;
        let second = (prices[10] - seed) * k + seed;
        assert!((result[1] - second).abs() < 1e-9);
    }

    #[test]
    fn test_ema_constant_series() {
        let data = vec![7.0; 30];
        assert!((ema_last(&data, 9).unwrap() - 7.0).abs() < 1e-12);
    }

    #[test]
    fn test_rsi_all_gains_is_100() {
        let data: Vec<f64> = (0..20).map(|i| i as f64).collect();
        assert_eq!(rsi(&data, 14), Some(100.0));
    }

    #[test]
    fn test_rsi_all_losses_is_0() {
        let data: Vec<f64> = (0..20).map(|i| 100.0 - i as f64).collect();
        assert!(rsi(&data, 14).unwrap().abs() < 1e-9);
    }

    #[test]
    fn test_rsi_uses_last_window_only() {
        // Large early drop must not influence the 14-period window
        let mut data = vec![100.0, 10.0];
        data.extend((0..15).map(|i| 10.0 + if i % 2 == 0 { 1.0 } else { 0.0 }));
        let value = rsi(&data, 14).unwrap();
        assert!(value > 40.0 && value < 60.0, "rsi = {value}");
    }

    #[test]
    fn test_rsi_range() {
        let value = rsi(&sample_prices(), 14).unwrap();
        assert!((0.0..=100.0).contains(&value));
    }

    #[test]
    fn test_macd_signal_is_eighty_percent() {
        let data: Vec<f64> = (0..60).map(|i| 50.0 + i as f64 * 0.5).collect();
        let result = macd(&data, 12, 26).unwrap();
        assert!(result.macd > 0.0);
        assert!((result.signal - result.macd * 0.8).abs() < 1e-12);
        assert!((result.histogram - result.macd * 0.2).abs() < 1e-12);
    }

    #[test]
    fn test_macd_insufficient_data() {
        assert!(macd(&sample_prices(), 12, 26).is_none());
    }

    #[test]
    fn test_bollinger_bands() {
        let prices = sample_prices();
        let bands = bollinger_bands(&prices, 20, 2.0).unwrap();

        assert!(bands.upper > bands.middle);
        assert!(bands.middle > bands.lower);
        let mean = prices.iter().sum::<f64>() / 20.0;
        assert!((bands.middle - mean).abs() < 1e-9);
        assert!(((bands.upper - bands.middle) - (bands.middle - bands.lower)).abs() < 1e-9);
    }

    #[test]
    fn test_bollinger_flat_series_has_zero_width() {
        let bands = bollinger_bands(&[5.0; 25], 20, 2.0).unwrap();
        assert_eq!(bands.width(), 0.0);
    }

    #[test]
    fn test_volatility_pct() {
        // alternating +-1 around 100: mean abs delta 1, last price 100
        let data: Vec<f64> = (0..15).map(|i| if i % 2 == 0 { 100.0 } else { 101.0 }).collect();
        let vol = volatility_pct(&data, 14).unwrap();
        assert!((vol - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_rate_of_change() {
        let data = vec![100.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0, 110.0];
        assert!((rate_of_change(&data, 10).unwrap() - 10.0).abs() < 1e-9);
    }

    #[test]
    fn test_volume_ratio() {
        let mut volumes = vec![100.0; 19];
        volumes.push(300.0);
        // avg of last 20 = (19*100 + 300) / 20 = 110
        assert!((volume_ratio(&volumes, 20).unwrap() - 300.0 / 110.0).abs() < 1e-9);
    }

    #[test]
    fn engine_rejects_short_history() {
        let err = IndicatorEngine::new().compute(&wavy_series(199)).unwrap_err();
        assert_eq!(
            err,
            AnalysisError::InsufficientHistory {
                required: 200,
                actual: 199
            }
        );
    }

    #[test]
    fn engine_is_deterministic() {
        let series = wavy_series(250);
        let engine = IndicatorEngine::new();
        let a = engine.compute(&series).unwrap();
        let b = engine.compute(&series).unwrap();
        assert_eq!(a.rsi.to_bits(), b.rsi.to_bits());
        assert_eq!(a.macd.value.to_bits(), b.macd.value.to_bits());
        assert_eq!(a.ema.ema200.to_bits(), b.ema.ema200.to_bits());
        assert_eq!(a.volatility_pct.to_bits(), b.volatility_pct.to_bits());
        assert_eq!(a, b);
    }

    #[test]
    fn engine_rising_series_has_bullish_stack() {
        let prices: Vec<f64> = (0..220).map(|i| 100.0 * 1.01f64.powi(i)).collect();
        let volumes = vec![1000.0; 220];
        let ind = IndicatorEngine::new().compute(&series_from(&prices, &volumes)).unwrap();

        assert!(ind.bullish_ema_stack());
        assert_eq!(ind.rsi, 100.0);
        assert!(ind.macd.histogram > 0.0);
        assert!(ind.momentum > 9.0);
        assert!((ind.volume_ratio - 1.0).abs() < 1e-9);
        assert_eq!(ind.price, prices[219]);
    }
}
