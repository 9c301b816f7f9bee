/// Simple Moving Average
pub fn sma(data: &[f64], period: usize) -> Vec<f64> {
    if period == 0 || data.len() < period {
        return vec![];
    }

    let mut result = Vec::with_capacity(data.len() - period + 1);
    for i in period - 1..data.len() {
        let sum: f64 = data[i + 1 - period..=i].iter().sum();
        result.push(sum / period as f64);
    }
    result
}

/// Exponential Moving Average, seeded with the SMA of the first `period`
/// values. Output is aligned with `sma`: element 0 corresponds to
/// `data[period - 1]`.
pub fn ema(data: &[f64], period: usize) -> Vec<f64> {
    if period == 0 || data.len() < period {
        return vec![];
    }

    let multiplier = 2.0 / (period as f64 + 1.0);
    let mut result = Vec::with_capacity(data.len() - period + 1);

    let seed: f64 = data[..period].iter().sum::<f64>() / period as f64;
    result.push(seed);

    for value in &data[period..] {
        let prev = result[result.len() - 1];
        result.push((value - prev) * multiplier + prev);
    }

    result
}

/// Last value of an EMA, if there is enough data.
pub fn ema_last(data: &[f64], period: usize) -> Option<f64> {
    ema(data, period).last().copied()
}

/// Relative Strength Index over the last `period` price changes using plain
/// average gain / average loss (no Wilder smoothing).
pub fn rsi(data: &[f64], period: usize) -> Option<f64> {
    if period == 0 || data.len() < period + 1 {
        return None;
    }

    let window = &data[data.len() - period - 1..];
    let (gains, losses) = window.windows(2).fold((0.0, 0.0), |(g, l), w| {
        let change = w[1] - w[0];
        if change > 0.0 {
            (g + change, l)
        } else {
            (g, l - change)
        }
    });

    let avg_gain = gains / period as f64;
    let avg_loss = losses / period as f64;

    if avg_loss == 0.0 {
        return Some(100.0);
    }

    let rs = avg_gain / avg_loss;
    Some(100.0 - (100.0 / (1.0 + rs)))
}

/// MACD line with the simplified signal line used throughout the agent
/// strategies: signal = 80% of the MACD value.
pub struct MacdResult {
    pub macd: f64,
    pub signal: f64,
    pub histogram: f64,
}

pub const MACD_SIGNAL_RATIO: f64 = 0.8;

pub fn macd(data: &[f64], fast_period: usize, slow_period: usize) -> Option<MacdResult> {
    if fast_period == 0 || slow_period <= fast_period {
        return None;
    }

    let fast = ema_last(data, fast_period)?;
    let slow = ema_last(data, slow_period)?;

    let macd = fast - slow;
    let signal = macd * MACD_SIGNAL_RATIO;

    Some(MacdResult {
        macd,
        signal,
        histogram: macd - signal,
    })
}

/// Bollinger Bands at the most recent point
pub struct BollingerBands {
    pub upper: f64,
    pub middle: f64,
    pub lower: f64,
}

impl BollingerBands {
    pub fn width(&self) -> f64 {
        if self.middle == 0.0 {
            0.0
        } else {
            (self.upper - self.lower) / self.middle
        }
    }
}

pub fn bollinger_bands(data: &[f64], period: usize, std_dev: f64) -> Option<BollingerBands> {
    if period == 0 || data.len() < period {
        return None;
    }

    let slice = &data[data.len() - period..];
    let mean = slice.iter().sum::<f64>() / period as f64;
    let variance: f64 = slice.iter().map(|x| (x - mean).powi(2)).sum::<f64>() / period as f64;
    let std = variance.sqrt();

    Some(BollingerBands {
        upper: mean + std_dev * std,
        middle: mean,
        lower: mean - std_dev * std,
    })
}

/// Percent change between the last value and the value `period` steps back.
pub fn rate_of_change(data: &[f64], period: usize) -> Option<f64> {
    if period == 0 || data.len() < period + 1 {
        return None;
    }
    let last = data[data.len() - 1];
    let base = data[data.len() - 1 - period];
    if base == 0.0 {
        return None;
    }
    Some((last - base) / base * 100.0)
}

/// Mean absolute change over the last `period` steps as a percent of the last
/// value. ATR-style approximation for close-only series.
pub fn volatility_pct(data: &[f64], period: usize) -> Option<f64> {
    if period == 0 || data.len() < period + 1 {
        return None;
    }
    let window = &data[data.len() - period - 1..];
    let total: f64 = window.windows(2).map(|w| (w[1] - w[0]).abs()).sum();
    let last = data[data.len() - 1];
    if last == 0.0 {
        return None;
    }
    Some(total / period as f64 / last * 100.0)
}

/// Last volume relative to the average of the last `period` volumes.
pub fn volume_ratio(volumes: &[f64], period: usize) -> Option<f64> {
    if period == 0 || volumes.len() < period {
        return None;
    }
    let avg = volumes[volumes.len() - period..].iter().sum::<f64>() / period as f64;
    let last = volumes[volumes.len() - 1];
    if avg == 0.0 {
        return Some(1.0);
    }
    Some(last / avg)
}
