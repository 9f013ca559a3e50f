use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use rust_decimal::prelude::ToPrimitive;
use serde::{Deserialize, Serialize};
use std::fmt;

use super::timeframe::Timeframe;

/// One OHLCV bar. Providers always return bars ordered oldest-first.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Candle {
    pub symbol: String,
    pub open: Decimal,
    pub high: Decimal,
    pub low: Decimal,
    pub close: Decimal,
    pub volume: Decimal,
    pub timestamp: i64,
}

impl Candle {
    pub fn open_f64(&self) -> f64 {
        self.open.to_f64().unwrap_or(0.0)
    }

    pub fn high_f64(&self) -> f64 {
        self.high.to_f64().unwrap_or(0.0)
    }

    pub fn low_f64(&self) -> f64 {
        self.low.to_f64().unwrap_or(0.0)
    }

    pub fn close_f64(&self) -> f64 {
        self.close.to_f64().unwrap_or(0.0)
    }

    pub fn volume_f64(&self) -> f64 {
        self.volume.to_f64().unwrap_or(0.0)
    }
}

/// Extract close prices as f64 for the indicator library.
pub fn closes(candles: &[Candle]) -> Vec<f64> {
    candles.iter().map(Candle::close_f64).collect()
}

/// Extract volumes as f64.
pub fn volumes(candles: &[Candle]) -> Vec<f64> {
    candles.iter().map(Candle::volume_f64).collect()
}

/// Merge `chunk` source candles into one coarser candle. Used to synthesize
/// intervals a vendor cannot serve natively (e.g. 4h from 1h).
pub fn resample(candles: &[Candle], chunk: usize) -> Vec<Candle> {
    if chunk <= 1 || candles.is_empty() {
        return candles.to_vec();
    }
    candles
        .chunks(chunk)
        .filter(|group| !group.is_empty())
        .map(|group| Candle {
            symbol: group[0].symbol.clone(),
            open: group[0].open,
            high: group.iter().map(|c| c.high).max().unwrap_or(group[0].high),
            low: group.iter().map(|c| c.low).min().unwrap_or(group[0].low),
            close: group[group.len() - 1].close,
            volume: group.iter().map(|c| c.volume).sum(),
            timestamp: group[0].timestamp,
        })
        .collect()
}

/// Live quote with daily change.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PriceSnapshot {
    pub symbol: String,
    pub price: Decimal,
    pub change_pct: f64,
    pub timestamp: DateTime<Utc>,
    pub provider: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SentimentLabel {
    Bullish,
    Bearish,
    Neutral,
}

impl fmt::Display for SentimentLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SentimentLabel::Bullish => write!(f, "bullish"),
            SentimentLabel::Bearish => write!(f, "bearish"),
            SentimentLabel::Neutral => write!(f, "neutral"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SentimentSnapshot {
    pub symbol: String,
    /// Aggregate score in [-1, 1].
    pub score: f64,
    pub label: SentimentLabel,
    pub source: String,
    pub timestamp: DateTime<Utc>,
}

impl SentimentSnapshot {
    pub fn neutral(symbol: &str) -> Self {
        Self {
            symbol: symbol.to_string(),
            score: 0.0,
            label: SentimentLabel::Neutral,
            source: "fallback".to_string(),
            timestamp: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VolatilitySnapshot {
    pub symbol: String,
    /// Annualized volatility as a fraction (0.25 = 25%).
    pub volatility: f64,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AssetDetails {
    pub symbol: String,
    pub name: Option<String>,
    pub sector: Option<String>,
    pub exchange: Option<String>,
}

/// Whether a request must be served by historical-grade data.
///
/// Backtests, evolution and regime memory require the historical slot;
/// live requests go to the live hierarchy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DataIntent {
    Historical,
    Live,
}

/// Normalized candle request routed through the queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CandleRequest {
    pub symbol: String,
    pub timeframe: Timeframe,
    pub limit: usize,
    pub start: Option<DateTime<Utc>>,
    pub end: Option<DateTime<Utc>>,
    pub intent: DataIntent,
}

impl CandleRequest {
    pub fn live(symbol: &str, timeframe: Timeframe, limit: usize) -> Self {
        Self {
            symbol: symbol.to_string(),
            timeframe,
            limit,
            start: None,
            end: None,
            intent: DataIntent::Live,
        }
    }

    pub fn historical(
        symbol: &str,
        timeframe: Timeframe,
        limit: usize,
        start: Option<DateTime<Utc>>,
        end: Option<DateTime<Utc>>,
    ) -> Self {
        Self {
            symbol: symbol.to_string(),
            timeframe,
            limit,
            start,
            end,
            intent: DataIntent::Historical,
        }
    }
}

/// Composite per-symbol snapshot served to the context surface and the
/// streaming layer. Every field has a safe default so degraded upstreams
/// never produce a hole.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MarketContext {
    pub symbol: String,
    pub price: f64,
    pub volume: f64,
    pub annualized_volatility: f64,
    pub change_24h: f64,
    pub change_7d: f64,
    pub sentiment: SentimentLabel,
    pub regime: String,
    pub regime_confidence: f64,
    pub timestamp: DateTime<Utc>,
}

impl MarketContext {
    pub fn degraded(symbol: &str) -> Self {
        Self {
            symbol: symbol.to_string(),
            price: 0.0,
            volume: 0.0,
            annualized_volatility: 0.0,
            change_24h: 0.0,
            change_7d: 0.0,
            sentiment: SentimentLabel::Neutral,
            regime: "neutral".to_string(),
            regime_confidence: 0.0,
            timestamp: Utc::now(),
        }
    }
}

/// One frame pushed to a streaming subscriber.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TickFrame {
    Boot {
        symbol: String,
        price: f64,
        regime: String,
        risk_level: String,
    },
    Tick {
        symbol: String,
        price: f64,
        change_pct: f64,
        volume: f64,
        sentiment: SentimentLabel,
        regime: String,
        volatility: Option<f64>,
        risk_level: String,
    },
    Ping,
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn candle(open: f64, high: f64, low: f64, close: f64, vol: f64, ts: i64) -> Candle {
        Candle {
            symbol: "AAPL".to_string(),
            open: Decimal::from_f64_retain(open).unwrap(),
            high: Decimal::from_f64_retain(high).unwrap(),
            low: Decimal::from_f64_retain(low).unwrap(),
            close: Decimal::from_f64_retain(close).unwrap(),
            volume: Decimal::from_f64_retain(vol).unwrap(),
            timestamp: ts,
        }
    }

    #[test]
    fn test_resample_merges_ohlcv() {
        let source = vec![
            candle(10.0, 12.0, 9.0, 11.0, 100.0, 0),
            candle(11.0, 14.0, 10.0, 13.0, 200.0, 3600),
            candle(13.0, 13.5, 8.0, 9.0, 50.0, 7200),
            candle(9.0, 10.0, 8.5, 9.5, 150.0, 10800),
        ];

        let merged = resample(&source, 4);
        assert_eq!(merged.len(), 1);
        assert_eq!(merged[0].open, dec!(10.0));
        assert_eq!(merged[0].high, dec!(14.0));
        assert_eq!(merged[0].low, dec!(8.0));
        assert_eq!(merged[0].close, dec!(9.5));
        assert_eq!(merged[0].volume, dec!(500.0));
        assert_eq!(merged[0].timestamp, 0);
    }

    #[test]
    fn test_resample_chunk_one_is_identity() {
        let source = vec![candle(1.0, 2.0, 0.5, 1.5, 10.0, 0)];
        assert_eq!(resample(&source, 1), source);
    }
}
