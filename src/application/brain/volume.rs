//! Volume confirmation: is there enough participation behind an entry
//! signal? Compares the trailing 5-bar mean against the prior 15-bar mean
//! and the 50-bar historical mean, then recommends confirm / caution /
//! block.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

use crate::domain::market::types::{Candle, CandleRequest, volumes};
use crate::domain::market::Timeframe;
use crate::infrastructure::market_data::ProviderRouter;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VolumeTrend {
    Increasing,
    Decreasing,
    Normal,
    Low,
}

impl fmt::Display for VolumeTrend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            VolumeTrend::Increasing => "increasing",
            VolumeTrend::Decreasing => "decreasing",
            VolumeTrend::Normal => "normal",
            VolumeTrend::Low => "low",
        };
        write!(f, "{}", s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VolumeRecommendation {
    Confirm,
    Caution,
    Block,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VolumeConfirmation {
    pub trend: VolumeTrend,
    pub strength: f64,
    pub ratio: f64,
    pub is_above_average: bool,
    pub recommendation: VolumeRecommendation,
}

impl VolumeConfirmation {
    pub fn unavailable() -> Self {
        Self {
            trend: VolumeTrend::Normal,
            strength: 0.5,
            ratio: 1.0,
            is_above_average: false,
            recommendation: VolumeRecommendation::Caution,
        }
    }
}

pub struct VolumeAnalyzer {
    router: Arc<ProviderRouter>,
}

impl VolumeAnalyzer {
    pub fn new(router: Arc<ProviderRouter>) -> Self {
        Self { router }
    }

    pub async fn confirm(&self, symbol: &str, timeframe: Timeframe) -> VolumeConfirmation {
        let request = CandleRequest::live(symbol, timeframe, 50);
        let candles = self.router.candles_or_empty(&request).await;
        confirm_from_candles(&candles)
    }
}

pub(crate) fn confirm_from_candles(candles: &[Candle]) -> VolumeConfirmation {
    if candles.len() < 20 {
        return VolumeConfirmation::unavailable();
    }

    let vols = volumes(candles);
    let recent: &[f64] = &vols[vols.len() - 5..];
    let prior: &[f64] = &vols[vols.len() - 20..vols.len() - 5];

    let recent_avg = mean(recent);
    let prior_avg = mean(prior);
    let historical_avg = mean(&vols);

    let change_pct = if prior_avg > 0.0 {
        (recent_avg - prior_avg) / prior_avg * 100.0
    } else {
        0.0
    };
    let ratio = if historical_avg > 0.0 {
        recent_avg / historical_avg
    } else {
        1.0
    };

    let trend = if ratio < 0.5 {
        VolumeTrend::Low
    } else if change_pct > 20.0 {
        VolumeTrend::Increasing
    } else if change_pct < -20.0 {
        VolumeTrend::Decreasing
    } else {
        VolumeTrend::Normal
    };

    let strength = match trend {
        VolumeTrend::Increasing => 0.5 + (ratio - 1.0) * 0.5,
        VolumeTrend::Decreasing | VolumeTrend::Low => 0.5 - (1.0 - ratio) * 0.5,
        VolumeTrend::Normal => 0.5 + (ratio - 1.0) * 0.2,
    }
    .clamp(0.0, 1.0);

    let is_above_average = ratio > 1.0;
    let recommendation = if ratio < 0.5 {
        VolumeRecommendation::Block
    } else if trend == VolumeTrend::Decreasing && ratio < 0.8 {
        VolumeRecommendation::Caution
    } else if trend == VolumeTrend::Increasing && ratio > 1.2 {
        VolumeRecommendation::Confirm
    } else if is_above_average {
        VolumeRecommendation::Confirm
    } else {
        VolumeRecommendation::Caution
    };

    VolumeConfirmation {
        trend,
        strength,
        ratio,
        is_above_average,
        recommendation,
    }
}

fn mean(values: &[f64]) -> f64 {
    if values.is_empty() {
        0.0
    } else {
        values.iter().sum::<f64>() / values.len() as f64
    }
}
