//! Multi-timeframe trend confirmation.
//!
//! Six timeframes are classified from EMA12/EMA26 alignment and slope,
//! grouped into short (1m/5m), medium (15m/1h) and long (4h/1d) horizons,
//! and reduced to an alignment score: 1.0 when all non-flat horizons
//! agree, 0.67 when two agree, 0.33 otherwise, minus 0.1 per flat horizon.

use futures_util::future::join_all;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use crate::domain::indicators::IndicatorSet;
use crate::domain::market::types::{Candle, CandleRequest};
use crate::domain::market::Timeframe;
use crate::infrastructure::market_data::ProviderRouter;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrendDirection {
    Up,
    Down,
    Flat,
}

impl fmt::Display for TrendDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TrendDirection::Up => write!(f, "up"),
            TrendDirection::Down => write!(f, "down"),
            TrendDirection::Flat => write!(f, "flat"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimeframeTrend {
    pub trend: TrendDirection,
    pub rsi: f64,
    pub macd_hist: f64,
    pub ema_slope: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrendAnalysis {
    pub trend_short: TrendDirection,
    pub trend_medium: TrendDirection,
    pub trend_long: TrendDirection,
    pub alignment_score: f64,
    pub timeframe_details: HashMap<String, TimeframeTrend>,
}

impl TrendAnalysis {
    pub fn unavailable() -> Self {
        Self {
            trend_short: TrendDirection::Flat,
            trend_medium: TrendDirection::Flat,
            trend_long: TrendDirection::Flat,
            alignment_score: 0.5,
            timeframe_details: HashMap::new(),
        }
    }
}

pub struct MultiTimeframeAnalyzer {
    router: Arc<ProviderRouter>,
}

impl MultiTimeframeAnalyzer {
    pub fn new(router: Arc<ProviderRouter>) -> Self {
        Self { router }
    }

    pub async fn analyze(&self, symbol: &str) -> TrendAnalysis {
        // All six timeframes fetch concurrently; the queue coalesces and
        // rate-limits underneath.
        let fetches = Timeframe::confirmation_set().map(|timeframe| {
            let request = CandleRequest::live(symbol, timeframe, 50);
            async move { (timeframe, self.router.candles_or_empty(&request).await) }
        });

        let mut details = HashMap::new();
        for (timeframe, candles) in join_all(fetches).await {
            if candles.len() >= 20 {
                details.insert(timeframe.as_str().to_string(), analyze_timeframe(&candles));
            }
        }

        if details.is_empty() {
            return TrendAnalysis::unavailable();
        }

        let trend_short = classify_group(&details, &["1m", "5m"]);
        let trend_medium = classify_group(&details, &["15m", "1h"]);
        let trend_long = classify_group(&details, &["4h", "1d"]);
        let alignment_score = alignment_score(trend_short, trend_medium, trend_long);

        TrendAnalysis {
            trend_short,
            trend_medium,
            trend_long,
            alignment_score,
            timeframe_details: details,
        }
    }
}

pub(crate) fn analyze_timeframe(candles: &[Candle]) -> TimeframeTrend {
    let indicators = IndicatorSet::compute(candles);
    let last = candles.len() - 1;

    let ema_12 = indicators.value_at("ema_12", last);
    let ema_12_prev = last.checked_sub(1).and_then(|i| indicators.value_at("ema_12", i));
    let ema_26 = indicators.value_at("ema_26", last);

    let (trend, ema_slope) = match (ema_12, ema_12_prev, ema_26) {
        (Some(fast), Some(fast_prev), Some(slow)) if fast_prev.abs() > 1e-9 => {
            let slope = (fast - fast_prev) / fast_prev * 100.0;
            let trend = if fast > slow && slope > 0.0 {
                TrendDirection::Up
            } else if fast < slow && slope < 0.0 {
                TrendDirection::Down
            } else {
                TrendDirection::Flat
            };
            (trend, slope)
        }
        _ => (TrendDirection::Flat, 0.0),
    };

    TimeframeTrend {
        trend,
        rsi: indicators.value_at("rsi", last).unwrap_or(50.0),
        macd_hist: indicators.value_at("macd_hist", last).unwrap_or(0.0),
        ema_slope,
    }
}

fn classify_group(
    details: &HashMap<String, TimeframeTrend>,
    keys: &[&str],
) -> TrendDirection {
    let trends: Vec<TrendDirection> = keys
        .iter()
        .filter_map(|key| details.get(*key))
        .map(|d| d.trend)
        .collect();

    let up = trends.iter().filter(|t| **t == TrendDirection::Up).count();
    let down = trends.iter().filter(|t| **t == TrendDirection::Down).count();

    if up > down {
        TrendDirection::Up
    } else if down > up {
        TrendDirection::Down
    } else {
        TrendDirection::Flat
    }
}

pub(crate) fn alignment_score(
    short: TrendDirection,
    medium: TrendDirection,
    long: TrendDirection,
) -> f64 {
    let trends = [short, medium, long];
    let non_flat: Vec<TrendDirection> = trends
        .iter()
        .copied()
        .filter(|t| *t != TrendDirection::Flat)
        .collect();

    if non_flat.is_empty() {
        return 0.5;
    }

    let distinct = {
        let mut seen = Vec::new();
        for t in &non_flat {
            if !seen.contains(t) {
                seen.push(*t);
            }
        }
        seen.len()
    };

    let base = match distinct {
        1 => 1.0,
        2 => 0.67,
        _ => 0.33,
    };

    let flats = trends.iter().filter(|t| **t == TrendDirection::Flat).count();
    (base - flats as f64 * 0.1).clamp(0.0, 1.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal::Decimal;

    fn trending_candles(start: f64, step: f64, len: usize) -> Vec<Candle> {
        (0..len)
            .map(|i| {
                let p = start + step * i as f64;
                Candle {
                    symbol: "TEST".to_string(),
                    open: Decimal::from_f64_retain(p).unwrap(),
                    high: Decimal::from_f64_retain(p + 0.5).unwrap(),
                    low: Decimal::from_f64_retain(p - 0.5).unwrap(),
                    close: Decimal::from_f64_retain(p).unwrap(),
                    volume: Decimal::from_f64_retain(1000.0).unwrap(),
                    timestamp: i as i64,
                }
            })
            .collect()
    }

    #[test]
    fn test_uptrend_classification() {
        let analysis = analyze_timeframe(&trending_candles(100.0, 1.0, 50));
        assert_eq!(analysis.trend, TrendDirection::Up);
        assert!(analysis.ema_slope > 0.0);
    }

    #[test]
    fn test_downtrend_classification() {
        let analysis = analyze_timeframe(&trending_candles(150.0, -1.0, 50));
        assert_eq!(analysis.trend, TrendDirection::Down);
    }

    #[test]
    fn test_alignment_all_agree() {
        let score = alignment_score(
            TrendDirection::Up,
            TrendDirection::Up,
            TrendDirection::Up,
        );
        assert_eq!(score, 1.0);
    }

    #[test]
    fn test_alignment_two_directions() {
        let score = alignment_score(
            TrendDirection::Up,
            TrendDirection::Up,
            TrendDirection::Down,
        );
        assert!((score - 0.67).abs() < 1e-9);
    }

    #[test]
    fn test_alignment_flat_penalty() {
        // All non-flat trends agree but one horizon is flat.
        let score = alignment_score(
            TrendDirection::Up,
            TrendDirection::Up,
            TrendDirection::Flat,
        );
        assert!((score - 0.9).abs() < 1e-9);

        // All flat is neutral.
        let score = alignment_score(
            TrendDirection::Flat,
            TrendDirection::Flat,
            TrendDirection::Flat,
        );
        assert_eq!(score, 0.5);
    }
}
