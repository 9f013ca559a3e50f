//! Technical indicator library.
//!
//! Pure, deterministic f64 math over close-price and candle sequences.
//! Output lengths are part of the contract:
//!
//! - `sma(x, n)` / `ema(x, n)` / `bollinger(x, n, k)`: `len(x) - n + 1`
//! - `rsi(x, n)` / `atr(candles, n)`: `len(x) - n`
//! - `vwap(candles)`: `len(candles)`
//! - `macd`: line `len(x) - slow + 1`, signal/histogram `line - signal + 1`
//!
//! [`IndicatorSet`] computes the standard family over one candle frame and
//! answers aligned lookups at a candle index (shorter series are aligned to
//! the tail of the frame).

use std::collections::HashMap;

use crate::domain::market::types::{Candle, closes};

pub fn sma(prices: &[f64], period: usize) -> Vec<f64> {
    if period == 0 || prices.len() < period {
        return Vec::new();
    }
    prices
        .windows(period)
        .map(|w| w.iter().sum::<f64>() / period as f64)
        .collect()
}

pub fn ema(prices: &[f64], period: usize) -> Vec<f64> {
    if period == 0 || prices.len() < period {
        return Vec::new();
    }
    let multiplier = 2.0 / (period as f64 + 1.0);
    let mut out = Vec::with_capacity(prices.len() - period + 1);
    // First value seeds from the SMA of the initial window.
    let seed = prices[..period].iter().sum::<f64>() / period as f64;
    out.push(seed);
    for price in &prices[period..] {
        let prev = *out.last().expect("seeded above");
        out.push((price - prev) * multiplier + prev);
    }
    out
}

pub fn rsi(prices: &[f64], period: usize) -> Vec<f64> {
    if period == 0 || prices.len() < period + 1 {
        return Vec::new();
    }
    let deltas: Vec<f64> = prices.windows(2).map(|w| w[1] - w[0]).collect();
    let gains: Vec<f64> = deltas.iter().map(|d| d.max(0.0)).collect();
    let losses: Vec<f64> = deltas.iter().map(|d| (-d).max(0.0)).collect();

    let mut out = Vec::with_capacity(deltas.len() - period + 1);
    let mut avg_gain = gains[..period].iter().sum::<f64>() / period as f64;
    let mut avg_loss = losses[..period].iter().sum::<f64>() / period as f64;
    out.push(rsi_value(avg_gain, avg_loss));

    for i in period..deltas.len() {
        avg_gain = (avg_gain * (period as f64 - 1.0) + gains[i]) / period as f64;
        avg_loss = (avg_loss * (period as f64 - 1.0) + losses[i]) / period as f64;
        out.push(rsi_value(avg_gain, avg_loss));
    }
    out
}

fn rsi_value(avg_gain: f64, avg_loss: f64) -> f64 {
    if avg_loss == 0.0 {
        100.0
    } else {
        100.0 - (100.0 / (1.0 + avg_gain / avg_loss))
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Macd {
    pub line: Vec<f64>,
    pub signal: Vec<f64>,
    pub histogram: Vec<f64>,
}

pub fn macd(prices: &[f64], fast: usize, slow: usize, signal_period: usize) -> Macd {
    if prices.len() < slow {
        return Macd::default();
    }
    let ema_fast = ema(prices, fast);
    let ema_slow = ema(prices, slow);

    // Align both EMAs to the tail before differencing.
    let n = ema_fast.len().min(ema_slow.len());
    let fast_tail = &ema_fast[ema_fast.len() - n..];
    let slow_tail = &ema_slow[ema_slow.len() - n..];
    let line: Vec<f64> = fast_tail
        .iter()
        .zip(slow_tail.iter())
        .map(|(f, s)| f - s)
        .collect();

    let signal = ema(&line, signal_period);
    let offset = line.len().saturating_sub(signal.len());
    let histogram: Vec<f64> = signal
        .iter()
        .enumerate()
        .map(|(i, s)| line[i + offset] - s)
        .collect();

    Macd {
        line,
        signal,
        histogram,
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Bollinger {
    pub upper: Vec<f64>,
    pub middle: Vec<f64>,
    pub lower: Vec<f64>,
}

pub fn bollinger(prices: &[f64], period: usize, num_std: f64) -> Bollinger {
    if period == 0 || prices.len() < period {
        return Bollinger::default();
    }
    let middle = sma(prices, period);
    let mut upper = Vec::with_capacity(middle.len());
    let mut lower = Vec::with_capacity(middle.len());

    for (i, window) in prices.windows(period).enumerate() {
        let mean = middle[i];
        let variance =
            window.iter().map(|p| (p - mean).powi(2)).sum::<f64>() / period as f64;
        let std = variance.sqrt();
        upper.push(mean + num_std * std);
        lower.push(mean - num_std * std);
    }

    Bollinger {
        upper,
        middle,
        lower,
    }
}

pub fn atr(candles: &[Candle], period: usize) -> Vec<f64> {
    if period == 0 || candles.len() < period + 1 {
        return Vec::new();
    }
    let true_ranges: Vec<f64> = candles
        .windows(2)
        .map(|w| {
            let high = w[1].high_f64();
            let low = w[1].low_f64();
            let prev_close = w[0].close_f64();
            (high - low)
                .max((high - prev_close).abs())
                .max((low - prev_close).abs())
        })
        .collect();

    let mut out = Vec::with_capacity(true_ranges.len() - period + 1);
    out.push(true_ranges[..period].iter().sum::<f64>() / period as f64);
    // Wilder smoothing after the seed window.
    for tr in &true_ranges[period..] {
        let prev = *out.last().expect("seeded above");
        out.push((prev * (period as f64 - 1.0) + tr) / period as f64);
    }
    out
}

pub fn vwap(candles: &[Candle]) -> Vec<f64> {
    let mut out = Vec::with_capacity(candles.len());
    let mut cum_volume = 0.0;
    let mut cum_pv = 0.0;

    for candle in candles {
        let typical = (candle.high_f64() + candle.low_f64() + candle.close_f64()) / 3.0;
        let volume = match candle.volume_f64() {
            v if v > 0.0 => v,
            _ => 1.0,
        };
        cum_volume += volume;
        cum_pv += typical * volume;
        out.push(if cum_volume > 0.0 {
            cum_pv / cum_volume
        } else {
            typical
        });
    }
    out
}

/// The standard indicator family over one candle frame, plus any extra
/// keyed series a ruleset needs (`sma_75`, `ema_200`, ...).
#[derive(Debug, Clone)]
pub struct IndicatorSet {
    frame_len: usize,
    series: HashMap<String, Vec<f64>>,
}

impl IndicatorSet {
    pub fn compute(candles: &[Candle]) -> Self {
        Self::compute_with(candles, &[])
    }

    pub fn compute_with(candles: &[Candle], extra_keys: &[String]) -> Self {
        let prices = closes(candles);
        let mut series: HashMap<String, Vec<f64>> = HashMap::new();

        for period in [20usize, 50, 200] {
            series.insert(format!("sma_{}", period), sma(&prices, period));
        }
        for period in [12usize, 26, 50] {
            series.insert(format!("ema_{}", period), ema(&prices, period));
        }
        series.insert("rsi".to_string(), rsi(&prices, 14));

        let m = macd(&prices, 12, 26, 9);
        series.insert("macd".to_string(), m.line);
        series.insert("macd_signal".to_string(), m.signal);
        series.insert("macd_hist".to_string(), m.histogram);

        let bb = bollinger(&prices, 20, 2.0);
        series.insert("bollinger_upper".to_string(), bb.upper);
        series.insert("bollinger_middle".to_string(), bb.middle);
        series.insert("bollinger_lower".to_string(), bb.lower);

        series.insert("atr".to_string(), atr(candles, 14));
        series.insert("vwap".to_string(), vwap(candles));
        series.insert("close".to_string(), prices.clone());

        let mut set = Self {
            frame_len: candles.len(),
            series,
        };
        for key in extra_keys {
            set.ensure(key, candles, &prices);
        }
        set
    }

    /// Compute a keyed series on demand (`sma_75`, `ema_9`, `rsi_7`).
    fn ensure(&mut self, key: &str, candles: &[Candle], prices: &[f64]) {
        let key = key.to_lowercase();
        if self.series.contains_key(&key) {
            return;
        }
        let computed = if let Some(period) = parse_keyed_period(&key, "sma_") {
            Some(sma(prices, period))
        } else if let Some(period) = parse_keyed_period(&key, "ema_") {
            Some(ema(prices, period))
        } else if let Some(period) = parse_keyed_period(&key, "rsi_") {
            Some(rsi(prices, period))
        } else if let Some(period) = parse_keyed_period(&key, "atr_") {
            Some(atr(candles, period))
        } else {
            None
        };
        if let Some(values) = computed {
            self.series.insert(key, values);
        }
    }

    pub fn series(&self, key: &str) -> Option<&[f64]> {
        self.series.get(&key.to_lowercase()).map(Vec::as_slice)
    }

    /// Value of `key` at candle index `index`, aligning shorter series to
    /// the tail of the frame. Returns `None` outside the series' coverage.
    pub fn value_at(&self, key: &str, index: usize) -> Option<f64> {
        let values = self.series(key)?;
        if values.is_empty() || index >= self.frame_len {
            return None;
        }
        let warmup = self.frame_len - values.len();
        if index < warmup {
            return None;
        }
        values.get(index - warmup).copied()
    }

    pub fn latest(&self, key: &str) -> Option<f64> {
        if self.frame_len == 0 {
            return None;
        }
        self.value_at(key, self.frame_len - 1)
    }

    pub fn frame_len(&self) -> usize {
        self.frame_len
    }
}

fn parse_keyed_period(key: &str, prefix: &str) -> Option<usize> {
    key.strip_prefix(prefix)?.parse().ok()
}
