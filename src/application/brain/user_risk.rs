//! User risk profile inferred from closed trade history.
//!
//! Weighted additive rubric over position sizing, win rate, holding
//! period, return volatility and worst drawdown; the winning tendency's
//! margin over the runner-up becomes the confidence.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use statrs::statistics::{Data, Distribution};
use std::fmt;
use std::sync::Arc;

use crate::domain::repositories::{PaperAccountRepository, TradeRepository};
use crate::domain::trading::{Trade, TradeStatus};
use rust_decimal::prelude::ToPrimitive;

/// Closed trades required before a profile is inferred.
const MIN_TRADES: usize = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RiskTendency {
    Conservative,
    Moderate,
    Aggressive,
}

impl fmt::Display for RiskTendency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RiskTendency::Conservative => "conservative",
            RiskTendency::Moderate => "moderate",
            RiskTendency::Aggressive => "aggressive",
        };
        write!(f, "{}", s)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RiskFactors {
    pub avg_position_size_pct: f64,
    pub win_rate: f64,
    pub avg_holding_period_days: f64,
    pub return_stdev: f64,
    pub max_drawdown_pct: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RiskProfile {
    pub tendency: RiskTendency,
    pub confidence: f64,
    pub factors: RiskFactors,
    pub trade_count: usize,
    pub last_updated: chrono::DateTime<Utc>,
}

impl RiskProfile {
    /// Default profile when history is too thin to infer anything.
    pub fn default_moderate(trade_count: usize) -> Self {
        Self {
            tendency: RiskTendency::Moderate,
            confidence: 0.3,
            factors: RiskFactors::default(),
            trade_count,
            last_updated: Utc::now(),
        }
    }
}

pub struct UserRiskProfiler {
    trades: Arc<dyn TradeRepository>,
    accounts: Arc<dyn PaperAccountRepository>,
}

impl UserRiskProfiler {
    pub fn new(
        trades: Arc<dyn TradeRepository>,
        accounts: Arc<dyn PaperAccountRepository>,
    ) -> Self {
        Self { trades, accounts }
    }

    pub async fn profile(&self, user_id: &str) -> RiskProfile {
        let closed = match self
            .trades
            .list_for_user(user_id, Some(TradeStatus::Closed), None)
            .await
        {
            Ok(trades) => trades,
            Err(_) => return RiskProfile::default_moderate(0),
        };

        if closed.len() < MIN_TRADES {
            return RiskProfile::default_moderate(closed.len());
        }

        let balance = match self.accounts.get(user_id).await {
            Ok(Some(account)) => account.balance.to_f64().unwrap_or(100_000.0),
            _ => 100_000.0,
        };

        let factors = compute_factors(&closed, balance);
        let (tendency, confidence) = infer_tendency(&factors);

        RiskProfile {
            tendency,
            confidence,
            factors,
            trade_count: closed.len(),
            last_updated: Utc::now(),
        }
    }
}

pub(crate) fn compute_factors(trades: &[Trade], balance: f64) -> RiskFactors {
    let position_sizes: Vec<f64> = trades
        .iter()
        .filter_map(|t| t.entry_cost().to_f64())
        .filter(|_| balance > 0.0)
        .map(|cost| cost / balance)
        .collect();
    let avg_position_size_pct = mean(&position_sizes);

    let wins = trades
        .iter()
        .filter(|t| t.realized_pnl.map(|p| p > rust_decimal::Decimal::ZERO).unwrap_or(false))
        .count();
    let win_rate = wins as f64 / trades.len() as f64;

    let holding_periods: Vec<f64> = trades
        .iter()
        .filter_map(|t| {
            t.closed_at
                .map(|closed| (closed - t.opened_at).num_seconds() as f64 / 86_400.0)
        })
        .collect();
    let avg_holding_period_days = mean(&holding_periods);

    let returns: Vec<f64> = trades
        .iter()
        .filter_map(|t| {
            let pnl = t.realized_pnl?.to_f64()?;
            let cost = t.entry_cost().to_f64()?;
            if cost > 0.0 { Some(pnl / cost) } else { None }
        })
        .collect();
    let return_stdev = if returns.len() > 1 {
        Data::new(returns).std_dev().unwrap_or(0.0)
    } else {
        0.0
    };

    let worst_loss = trades
        .iter()
        .filter_map(|t| t.realized_pnl?.to_f64())
        .filter(|p| *p < 0.0)
        .fold(0.0f64, f64::min)
        .abs();
    let max_drawdown_pct = if balance > 0.0 { worst_loss / balance } else { 0.0 };

    RiskFactors {
        avg_position_size_pct,
        win_rate,
        avg_holding_period_days,
        return_stdev,
        max_drawdown_pct,
    }
}

pub(crate) fn infer_tendency(factors: &RiskFactors) -> (RiskTendency, f64) {
    let mut conservative: f64 = 0.0;
    let mut moderate: f64 = 0.0;
    let mut aggressive: f64 = 0.0;

    // Position size: <5% conservative, 5-15% moderate, >15% aggressive.
    if factors.avg_position_size_pct < 0.05 {
        conservative += 0.3;
    } else if factors.avg_position_size_pct < 0.15 {
        moderate += 0.3;
    } else {
        aggressive += 0.3;
    }

    // Win rate: >0.7 conservative, 0.5-0.7 moderate, <0.5 aggressive.
    if factors.win_rate > 0.7 {
        conservative += 0.2;
    } else if factors.win_rate > 0.5 {
        moderate += 0.2;
    } else {
        aggressive += 0.2;
    }

    // Holding period: >7d conservative, 2-7d moderate, <2d aggressive.
    if factors.avg_holding_period_days > 7.0 {
        conservative += 0.2;
    } else if factors.avg_holding_period_days > 2.0 {
        moderate += 0.2;
    } else {
        aggressive += 0.2;
    }

    // Return volatility tiers.
    if factors.return_stdev < 0.02 {
        conservative += 0.15;
    } else if factors.return_stdev < 0.05 {
        moderate += 0.15;
    } else {
        aggressive += 0.15;
    }

    // Drawdown tolerance tiers.
    if factors.max_drawdown_pct < 0.05 {
        conservative += 0.15;
    } else if factors.max_drawdown_pct < 0.15 {
        moderate += 0.15;
    } else {
        aggressive += 0.15;
    }

    let mut scored = [
        (RiskTendency::Conservative, conservative),
        (RiskTendency::Moderate, moderate),
        (RiskTendency::Aggressive, aggressive),
    ];
    scored.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));

    let winner = scored[0];
    let runner_up = scored[1];
    let confidence = if winner.1 > 0.0 {
        ((winner.1 - runner_up.1) / winner.1).clamp(0.3, 1.0)
    } else {
        0.3
    };

    (winner.0, confidence)
}

fn mean(values: &[f64]) -> f64 {
    if values.is_empty() {
        0.0
    } else {
        values.iter().sum::<f64>() / values.len() as f64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_small_positions_high_win_rate_is_conservative() {
        let factors = RiskFactors {
            avg_position_size_pct: 0.02,
            win_rate: 0.8,
            avg_holding_period_days: 12.0,
            return_stdev: 0.01,
            max_drawdown_pct: 0.02,
        };
        let (tendency, confidence) = infer_tendency(&factors);
        assert_eq!(tendency, RiskTendency::Conservative);
        assert!(confidence > 0.5);
    }

    #[test]
    fn test_large_positions_fast_turnover_is_aggressive() {
        let factors = RiskFactors {
            avg_position_size_pct: 0.30,
            win_rate: 0.4,
            avg_holding_period_days: 0.5,
            return_stdev: 0.12,
            max_drawdown_pct: 0.25,
        };
        let (tendency, _) = infer_tendency(&factors);
        assert_eq!(tendency, RiskTendency::Aggressive);
    }

    #[test]
    fn test_middle_of_the_road_is_moderate() {
        let factors = RiskFactors {
            avg_position_size_pct: 0.10,
            win_rate: 0.6,
            avg_holding_period_days: 4.0,
            return_stdev: 0.03,
            max_drawdown_pct: 0.08,
        };
        let (tendency, _) = infer_tendency(&factors);
        assert_eq!(tendency, RiskTendency::Moderate);
    }

    #[test]
    fn test_confidence_reflects_margin() {
        let decisive = RiskFactors {
            avg_position_size_pct: 0.02,
            win_rate: 0.9,
            avg_holding_period_days: 20.0,
            return_stdev: 0.005,
            max_drawdown_pct: 0.01,
        };
        let (_, decisive_confidence) = infer_tendency(&decisive);

        let split = RiskFactors {
            avg_position_size_pct: 0.02, // conservative
            win_rate: 0.6,               // moderate
            avg_holding_period_days: 4.0, // moderate
            return_stdev: 0.01,          // conservative
            max_drawdown_pct: 0.08,      // moderate
        };
        let (_, split_confidence) = infer_tendency(&split);

        assert!(decisive_confidence > split_confidence);
    }
}
