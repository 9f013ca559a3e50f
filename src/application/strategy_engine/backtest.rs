//! Deterministic bar-by-bar backtest engine.
//!
//! One pass over a canonical OHLCV frame: evaluate entry conditions when
//! flat, manage stop/target/trailing exits when positioned. Fills are
//! gap-aware: a bar whose low breaches the stop fills at the stop, a bar
//! whose high breaches the target fills at the target, and when one bar
//! breaches both, the stop wins (conservative). The final bar closes any
//! open position at its close.

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use statrs::statistics::{Data, Distribution};
use uuid::Uuid;

use crate::application::strategy_engine::evaluator::RulesetEvaluator;
use crate::domain::indicators::IndicatorSet;
use crate::domain::market::types::Candle;
use crate::domain::strategy::ruleset::Ruleset;
use crate::domain::strategy::types::BacktestReport;
use crate::domain::trading::TradeSide;

/// Fraction of the frame used for the training half of the overfit split.
const TRAIN_FRACTION: f64 = 0.7;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExitReason {
    StopLoss,
    TakeProfit,
    TrailingStop,
    ConditionLapsed,
    EndOfData,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimulatedTrade {
    pub side: TradeSide,
    pub entry_index: usize,
    pub exit_index: usize,
    pub entry_price: f64,
    pub exit_price: f64,
    pub pnl: f64,
    pub exit_reason: ExitReason,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BacktestMetrics {
    pub total_return: f64,
    pub win_rate: f64,
    pub max_drawdown: f64,
    pub avg_pnl: f64,
    pub total_trades: u32,
    pub sharpe: Option<f64>,
}

#[derive(Debug, Clone)]
pub struct BacktestOutcome {
    pub trades: Vec<SimulatedTrade>,
    pub metrics: BacktestMetrics,
    pub train_sharpe: Option<f64>,
    pub test_sharpe: Option<f64>,
}

pub struct BacktestEngine;

impl BacktestEngine {
    /// Run the full simulation plus the chronological train/test split.
    pub fn run(ruleset: &Ruleset, candles: &[Candle]) -> BacktestOutcome {
        let (trades, metrics) = Self::simulate(ruleset, candles);

        let split = ((candles.len() as f64) * TRAIN_FRACTION) as usize;
        let (train_sharpe, test_sharpe) = if split > 2 && split < candles.len() {
            let (_, train_metrics) = Self::simulate(ruleset, &candles[..split]);
            let (_, test_metrics) = Self::simulate(ruleset, &candles[split..]);
            (train_metrics.sharpe, test_metrics.sharpe)
        } else {
            (None, None)
        };

        BacktestOutcome {
            trades,
            metrics,
            train_sharpe,
            test_sharpe,
        }
    }

    /// Assemble a persistable report from an outcome.
    pub fn report(
        strategy_id: &str,
        symbol: &str,
        ruleset: &Ruleset,
        candles: &[Candle],
        outcome: &BacktestOutcome,
    ) -> BacktestReport {
        let window_start = candles
            .first()
            .map(|c| timestamp_to_utc(c.timestamp))
            .unwrap_or_else(Utc::now);
        let window_end = candles
            .last()
            .map(|c| timestamp_to_utc(c.timestamp))
            .unwrap_or_else(Utc::now);

        BacktestReport {
            id: Uuid::new_v4().to_string(),
            strategy_id: strategy_id.to_string(),
            symbol: symbol.to_string(),
            timeframe: ruleset.timeframe.to_string(),
            window_start,
            window_end,
            total_return: outcome.metrics.total_return,
            win_rate: outcome.metrics.win_rate,
            max_drawdown: outcome.metrics.max_drawdown,
            avg_pnl: outcome.metrics.avg_pnl,
            total_trades: outcome.metrics.total_trades,
            sharpe: outcome.metrics.sharpe,
            train_sharpe: outcome.train_sharpe,
            test_sharpe: outcome.test_sharpe,
            created_at: Utc::now(),
        }
    }

    fn simulate(ruleset: &Ruleset, candles: &[Candle]) -> (Vec<SimulatedTrade>, BacktestMetrics) {
        if candles.len() < 2 {
            return (Vec::new(), BacktestMetrics::default());
        }

        let extra_keys = RulesetEvaluator::required_keys(ruleset);
        let indicators = IndicatorSet::compute_with(candles, &extra_keys);

        let mut trades: Vec<SimulatedTrade> = Vec::new();
        let mut position: Option<OpenPosition> = None;

        for (i, candle) in candles.iter().enumerate() {
            let high = candle.high_f64();
            let low = candle.low_f64();
            let close = candle.close_f64();

            if let Some(open) = &mut position {
                open.update_water_mark(close);
                let exit = open.check_exit(high, low, close, || {
                    !RulesetEvaluator::evaluate_at(&ruleset.conditions, &indicators, i)
                });
                if let Some((exit_price, reason)) = exit {
                    trades.push(open.close(i, exit_price, reason));
                    position = None;
                }
            }

            let is_last = i == candles.len() - 1;
            if position.is_none()
                && !is_last
                && RulesetEvaluator::evaluate_at(&ruleset.conditions, &indicators, i)
            {
                let entry_price = match ruleset.entry {
                    crate::domain::strategy::ruleset::PriceRef::Close => close,
                    crate::domain::strategy::ruleset::PriceRef::Open => candle.open_f64(),
                    crate::domain::strategy::ruleset::PriceRef::High => high,
                    crate::domain::strategy::ruleset::PriceRef::Low => low,
                };
                if entry_price <= 0.0 {
                    continue;
                }
                let atr = indicators.value_at("atr", i);
                let (stop_loss, take_profit) =
                    RulesetEvaluator::exit_prices(ruleset, entry_price, ruleset.side, atr);

                position = Some(OpenPosition {
                    side: ruleset.side,
                    entry_index: i,
                    entry_price,
                    stop_loss,
                    take_profit,
                    trailing: ruleset.exit.trailing_stop,
                    water_mark: entry_price,
                    price_exit_configured: stop_loss.is_some() || take_profit.is_some(),
                });
            }
        }

        if let Some(open) = position {
            let last = candles.len() - 1;
            let close = candles[last].close_f64();
            trades.push(open.close(last, close, ExitReason::EndOfData));
        }

        let metrics = Self::metrics(&trades);
        (trades, metrics)
    }

    fn metrics(trades: &[SimulatedTrade]) -> BacktestMetrics {
        if trades.is_empty() {
            return BacktestMetrics::default();
        }

        let wins = trades.iter().filter(|t| t.pnl > 0.0).count();
        let win_rate = wins as f64 / trades.len() as f64;
        let avg_pnl = trades.iter().map(|t| t.pnl).sum::<f64>() / trades.len() as f64;

        // Compound per-trade returns into an equity curve for return and
        // peak-to-trough drawdown.
        let mut equity = 1.0f64;
        let mut peak = 1.0f64;
        let mut max_drawdown = 0.0f64;
        for trade in trades {
            let r = if trade.entry_price > 0.0 {
                trade.pnl / trade.entry_price
            } else {
                0.0
            };
            equity *= 1.0 + r;
            peak = peak.max(equity);
            if peak > 0.0 {
                max_drawdown = max_drawdown.max((peak - equity) / peak);
            }
        }
        let total_return = equity - 1.0;

        let sharpe = if trades.len() >= 2 {
            let pnls: Vec<f64> = trades.iter().map(|t| t.pnl).collect();
            let data = Data::new(pnls);
            match (data.mean(), data.std_dev()) {
                (Some(mean), Some(std_dev)) if std_dev > 1e-12 => Some(mean / std_dev),
                _ => None,
            }
        } else {
            None
        };

        BacktestMetrics {
            total_return,
            win_rate,
            max_drawdown,
            avg_pnl,
            total_trades: trades.len() as u32,
            sharpe,
        }
    }
}

struct OpenPosition {
    side: TradeSide,
    entry_index: usize,
    entry_price: f64,
    stop_loss: Option<f64>,
    take_profit: Option<f64>,
    trailing: Option<f64>,
    water_mark: f64,
    price_exit_configured: bool,
}

impl OpenPosition {
    fn update_water_mark(&mut self, close: f64) {
        match self.side {
            TradeSide::Buy => self.water_mark = self.water_mark.max(close),
            TradeSide::Sell => self.water_mark = self.water_mark.min(close),
        }
    }

    /// Exit price and reason for this bar, if any. Stop is evaluated
    /// before target on bars that breach both.
    fn check_exit(
        &self,
        high: f64,
        low: f64,
        close: f64,
        conditions_lapsed: impl FnOnce() -> bool,
    ) -> Option<(f64, ExitReason)> {
        match self.side {
            TradeSide::Buy => {
                if let Some(stop) = self.stop_loss
                    && low <= stop
                {
                    return Some((stop, ExitReason::StopLoss));
                }
                if let Some(trail_pct) = self.trailing {
                    let level = self.water_mark * (1.0 - trail_pct);
                    if low <= level && level > self.stop_loss.unwrap_or(f64::MIN) {
                        return Some((level, ExitReason::TrailingStop));
                    }
                }
                if let Some(target) = self.take_profit
                    && high >= target
                {
                    return Some((target, ExitReason::TakeProfit));
                }
            }
            TradeSide::Sell => {
                if let Some(stop) = self.stop_loss
                    && high >= stop
                {
                    return Some((stop, ExitReason::StopLoss));
                }
                if let Some(trail_pct) = self.trailing {
                    let level = self.water_mark * (1.0 + trail_pct);
                    if high >= level && level < self.stop_loss.unwrap_or(f64::MAX) {
                        return Some((level, ExitReason::TrailingStop));
                    }
                }
                if let Some(target) = self.take_profit
                    && low <= target
                {
                    return Some((target, ExitReason::TakeProfit));
                }
            }
        }

        // Strategies with no price-based exit close when their entry
        // conditions stop holding.
        if !self.price_exit_configured && conditions_lapsed() {
            return Some((close, ExitReason::ConditionLapsed));
        }
        None
    }

    fn close(&self, exit_index: usize, exit_price: f64, reason: ExitReason) -> SimulatedTrade {
        let pnl = match self.side {
            TradeSide::Buy => exit_price - self.entry_price,
            TradeSide::Sell => self.entry_price - exit_price,
        };
        SimulatedTrade {
            side: self.side,
            entry_index: self.entry_index,
            exit_index,
            entry_price: self.entry_price,
            exit_price,
            pnl,
            exit_reason: reason,
        }
    }
}

fn timestamp_to_utc(millis: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(millis).single().unwrap_or_else(Utc::now)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal::Decimal;
    use serde_json::json;

    fn candle(open: f64, high: f64, low: f64, close: f64, ts: i64) -> Candle {
        Candle {
            symbol: "TEST".to_string(),
            open: Decimal::from_f64_retain(open).unwrap(),
            high: Decimal::from_f64_retain(high).unwrap(),
            low: Decimal::from_f64_retain(low).unwrap(),
            close: Decimal::from_f64_retain(close).unwrap(),
            volume: Decimal::from_f64_retain(1000.0).unwrap(),
            timestamp: ts * 86_400_000,
        }
    }

    fn flat_frame(price: f64, len: usize) -> Vec<Candle> {
        (0..len)
            .map(|i| candle(price, price + 0.5, price - 0.5, price, i as i64))
            .collect()
    }

    #[test]
    fn test_stop_fills_at_stop_on_gap() {
        // Enter at 100 on every bar (always-true condition), stop 2%.
        let ruleset = Ruleset::parse(&json!({
            "conditions": [{"indicator": "CLOSE", "relation": ">", "value": 0}],
            "exit": {"stop_loss": 0.02, "take_profit": 0.5}
        }));

        let mut candles = flat_frame(100.0, 5);
        // Bar 2 gaps down through the stop.
        candles[2] = candle(100.0, 100.0, 90.0, 92.0, 2);

        let outcome = BacktestEngine::run(&ruleset, &candles);
        let first = &outcome.trades[0];
        assert_eq!(first.exit_reason, ExitReason::StopLoss);
        assert!((first.exit_price - 98.0).abs() < 1e-9);
        assert!((first.pnl - (-2.0)).abs() < 1e-9);
    }

    #[test]
    fn test_stop_beats_target_on_same_bar() {
        let ruleset = Ruleset::parse(&json!({
            "conditions": [{"indicator": "CLOSE", "relation": ">", "value": 0}],
            "exit": {"stop_loss": 0.02, "take_profit": 0.02}
        }));

        let mut candles = flat_frame(100.0, 4);
        // Bar 1 sweeps both levels.
        candles[1] = candle(100.0, 105.0, 95.0, 100.0, 1);

        let outcome = BacktestEngine::run(&ruleset, &candles);
        assert_eq!(outcome.trades[0].exit_reason, ExitReason::StopLoss);
    }

    #[test]
    fn test_take_profit_fill() {
        let ruleset = Ruleset::parse(&json!({
            "conditions": [{"indicator": "CLOSE", "relation": ">", "value": 0}],
            "exit": {"stop_loss": 0.10, "take_profit": 0.04}
        }));

        let mut candles = flat_frame(100.0, 4);
        candles[2] = candle(100.0, 106.0, 99.5, 105.0, 2);

        let outcome = BacktestEngine::run(&ruleset, &candles);
        let first = &outcome.trades[0];
        assert_eq!(first.exit_reason, ExitReason::TakeProfit);
        assert!((first.exit_price - 104.0).abs() < 1e-9);
        assert!((first.pnl - 4.0).abs() < 1e-9);
    }

    #[test]
    fn test_open_position_closes_at_end_of_data() {
        let ruleset = Ruleset::parse(&json!({
            "conditions": [{"indicator": "CLOSE", "relation": ">", "value": 0}],
            "exit": {"stop_loss": 0.5, "take_profit": 0.5}
        }));

        let candles = flat_frame(100.0, 6);
        let outcome = BacktestEngine::run(&ruleset, &candles);
        assert!(!outcome.trades.is_empty());
        assert_eq!(
            outcome.trades.last().unwrap().exit_reason,
            ExitReason::EndOfData
        );
    }

    #[test]
    fn test_sharpe_none_for_constant_pnl() {
        // Two identical winning trades: stdev 0, Sharpe undefined.
        let ruleset = Ruleset::parse(&json!({
            "conditions": [{"indicator": "CLOSE", "relation": ">", "value": 0}],
            "exit": {"stop_loss": 0.02, "take_profit": 0.02}
        }));

        let mut candles = flat_frame(100.0, 8);
        candles[1] = candle(100.0, 103.0, 99.5, 102.0, 1);
        candles[4] = candle(100.0, 103.0, 99.5, 102.0, 4);

        let outcome = BacktestEngine::run(&ruleset, &candles);
        let winners = outcome
            .trades
            .iter()
            .filter(|t| t.exit_reason == ExitReason::TakeProfit)
            .count();
        assert!(winners >= 2);
        // Identical pnls leave no spread for the ratio.
        if outcome
            .trades
            .iter()
            .all(|t| (t.pnl - outcome.trades[0].pnl).abs() < 1e-12)
        {
            assert!(outcome.metrics.sharpe.is_none());
        }
    }

    #[test]
    fn test_deterministic_across_runs() {
        let ruleset = Ruleset::parse(&json!({
            "conditions": [{"indicator": "SMA", "length": 5, "relation": "<", "value": 101.0}],
            "exit": {"stop_loss": 0.03, "take_profit": 0.05}
        }));

        let candles: Vec<Candle> = (0..60)
            .map(|i| {
                let p = 100.0 + ((i as f64) * 0.7).sin() * 3.0;
                candle(p, p + 1.5, p - 1.5, p, i as i64)
            })
            .collect();

        let a = BacktestEngine::run(&ruleset, &candles);
        let b = BacktestEngine::run(&ruleset, &candles);
        assert_eq!(a.trades.len(), b.trades.len());
        assert_eq!(a.metrics.total_return, b.metrics.total_return);
        assert_eq!(a.metrics.win_rate, b.metrics.win_rate);
    }

    #[test]
    fn test_empty_frame_yields_empty_outcome() {
        let ruleset = Ruleset::parse(&json!({}));
        let outcome = BacktestEngine::run(&ruleset, &[]);
        assert!(outcome.trades.is_empty());
        assert_eq!(outcome.metrics.total_trades, 0);
    }
}
