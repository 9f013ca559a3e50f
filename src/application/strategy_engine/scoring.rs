//! Composite strategy score in [0, 1], derived from the latest backtest.
//!
//! The score feeds signal confidence (70% weight there) and ranking on
//! the recommendation surface, so it must be stable, bounded and cheap.

use crate::application::strategy_engine::backtest::BacktestMetrics;

/// Blend weights.
const WIN_RATE_WEIGHT: f64 = 0.4;
const SHARPE_WEIGHT: f64 = 0.3;
const RETURN_WEIGHT: f64 = 0.2;
const DRAWDOWN_WEIGHT: f64 = 0.1;

/// Sharpe normalization ceiling: 2.0 and above maps to a full score.
const SHARPE_CEILING: f64 = 2.0;
/// Return normalization ceiling: +50% maps to a full score.
const RETURN_CEILING: f64 = 0.5;

pub fn score_strategy(metrics: &BacktestMetrics) -> f64 {
    if metrics.total_trades == 0 {
        return 0.0;
    }

    let sharpe_component = metrics
        .sharpe
        .map(|s| (s / SHARPE_CEILING).clamp(0.0, 1.0))
        .unwrap_or(0.0);
    let return_component = (metrics.total_return / RETURN_CEILING).clamp(0.0, 1.0);
    let drawdown_component = (1.0 - metrics.max_drawdown).clamp(0.0, 1.0);

    let score = WIN_RATE_WEIGHT * metrics.win_rate.clamp(0.0, 1.0)
        + SHARPE_WEIGHT * sharpe_component
        + RETURN_WEIGHT * return_component
        + DRAWDOWN_WEIGHT * drawdown_component;

    score.clamp(0.0, 1.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn metrics(win_rate: f64, sharpe: Option<f64>, total_return: f64, dd: f64) -> BacktestMetrics {
        BacktestMetrics {
            total_return,
            win_rate,
            max_drawdown: dd,
            avg_pnl: 0.0,
            total_trades: 50,
            sharpe,
        }
    }

    #[test]
    fn test_score_bounds() {
        let perfect = metrics(1.0, Some(5.0), 2.0, 0.0);
        assert_eq!(score_strategy(&perfect), 1.0);

        let terrible = metrics(0.0, Some(-3.0), -0.9, 1.0);
        assert_eq!(score_strategy(&terrible), 0.0);
    }

    #[test]
    fn test_no_trades_scores_zero() {
        let empty = BacktestMetrics::default();
        assert_eq!(score_strategy(&empty), 0.0);
    }

    #[test]
    fn test_better_metrics_score_higher() {
        let good = metrics(0.65, Some(1.6), 0.25, 0.08);
        let mediocre = metrics(0.45, Some(0.4), 0.05, 0.25);
        assert!(score_strategy(&good) > score_strategy(&mediocre));
    }
}
