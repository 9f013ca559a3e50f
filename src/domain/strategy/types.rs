use anyhow::{Result, anyhow};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;

use crate::domain::trading::AssetType;

/// Lifecycle of an evolving strategy.
///
/// `experiment -> candidate -> proposable`, with `discarded` terminal.
/// A strategy never moves backward from `proposable` to `experiment`
/// within a single evolution cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StrategyStatus {
    Experiment,
    Candidate,
    Proposable,
    Discarded,
}

impl fmt::Display for StrategyStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            StrategyStatus::Experiment => "experiment",
            StrategyStatus::Candidate => "candidate",
            StrategyStatus::Proposable => "proposable",
            StrategyStatus::Discarded => "discarded",
        };
        write!(f, "{}", s)
    }
}

impl FromStr for StrategyStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "experiment" => Ok(StrategyStatus::Experiment),
            "candidate" => Ok(StrategyStatus::Candidate),
            "proposable" => Ok(StrategyStatus::Proposable),
            "discarded" => Ok(StrategyStatus::Discarded),
            _ => Err(anyhow!("Invalid strategy status: {}", s)),
        }
    }
}

/// Persistent strategy row. Rulesets and parameters are opaque JSON
/// documents; versioned changes create new strategies linked by lineage,
/// never in-place edits beyond status/score/metrics.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StrategyRecord {
    pub id: String,
    pub owner_id: String,
    pub name: String,
    pub asset_type: AssetType,
    pub parameters: Value,
    pub ruleset: Value,
    pub score: f64,
    pub status: StrategyStatus,
    pub evolution_attempts: u32,
    pub is_active: bool,
    pub last_backtest_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl StrategyRecord {
    /// Derived flag gating recommendation to users.
    pub fn is_proposable(&self) -> bool {
        self.status == StrategyStatus::Proposable && self.is_active
    }
}

/// How a child strategy was derived from its parent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MutationKind {
    ParameterTweak,
    ConditionToggle,
    TimeframeShift,
    ExitRatioTweak,
    IndicatorSwap,
    Crossover,
}

impl fmt::Display for MutationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            MutationKind::ParameterTweak => "parameter_tweak",
            MutationKind::ConditionToggle => "condition_toggle",
            MutationKind::TimeframeShift => "timeframe_shift",
            MutationKind::ExitRatioTweak => "exit_ratio_tweak",
            MutationKind::IndicatorSwap => "indicator_swap",
            MutationKind::Crossover => "crossover",
        };
        write!(f, "{}", s)
    }
}

impl FromStr for MutationKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "parameter_tweak" => Ok(MutationKind::ParameterTweak),
            "condition_toggle" => Ok(MutationKind::ConditionToggle),
            "timeframe_shift" => Ok(MutationKind::TimeframeShift),
            "exit_ratio_tweak" => Ok(MutationKind::ExitRatioTweak),
            "indicator_swap" => Ok(MutationKind::IndicatorSwap),
            "crossover" => Ok(MutationKind::Crossover),
            _ => Err(anyhow!("Invalid mutation kind: {}", s)),
        }
    }
}

/// One edge of the lineage DAG. Children may have multiple parents
/// (crossover); the DAG must stay acyclic.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LineageEdge {
    pub id: String,
    pub parent_id: String,
    pub child_id: String,
    pub mutation_kind: MutationKind,
    pub similarity: Option<f64>,
    pub created_by: String,
    pub created_at: DateTime<Utc>,
}

/// Immutable backtest result row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BacktestReport {
    pub id: String,
    pub strategy_id: String,
    pub symbol: String,
    pub timeframe: String,
    pub window_start: DateTime<Utc>,
    pub window_end: DateTime<Utc>,
    pub total_return: f64,
    pub win_rate: f64,
    pub max_drawdown: f64,
    pub avg_pnl: f64,
    pub total_trades: u32,
    pub sharpe: Option<f64>,
    pub train_sharpe: Option<f64>,
    pub test_sharpe: Option<f64>,
    pub created_at: DateTime<Utc>,
}

impl BacktestReport {
    /// Test/train Sharpe ratio used by the overfit gate; `None` when either
    /// half lacks a defined Sharpe.
    pub fn overfit_ratio(&self) -> Option<f64> {
        match (self.train_sharpe, self.test_sharpe) {
            (Some(train), Some(test)) if train.abs() > 1e-9 => Some(test / train),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_round_trip() {
        for status in [
            StrategyStatus::Experiment,
            StrategyStatus::Candidate,
            StrategyStatus::Proposable,
            StrategyStatus::Discarded,
        ] {
            assert_eq!(
                StrategyStatus::from_str(&status.to_string()).unwrap(),
                status
            );
        }
    }

    #[test]
    fn test_overfit_ratio() {
        let mut report = BacktestReport {
            id: "b1".into(),
            strategy_id: "s1".into(),
            symbol: "AAPL".into(),
            timeframe: "1d".into(),
            window_start: Utc::now(),
            window_end: Utc::now(),
            total_return: 0.1,
            win_rate: 0.6,
            max_drawdown: 0.05,
            avg_pnl: 1.2,
            total_trades: 40,
            sharpe: Some(1.5),
            train_sharpe: Some(2.0),
            test_sharpe: Some(1.5),
            created_at: Utc::now(),
        };
        assert_eq!(report.overfit_ratio(), Some(0.75));

        report.test_sharpe = None;
        assert_eq!(report.overfit_ratio(), None);
    }
}
