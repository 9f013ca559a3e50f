//! Ruleset evaluation against a computed indicator frame.
//!
//! Conditions combine under a running logic operator (AND unless an OR
//! marker preceded them); nested groups evaluate recursively. A condition
//! that references an unknown indicator or an index before the warm-up
//! boundary is simply false; malformed strategies must never throw inside
//! a worker cycle.

use crate::domain::indicators::IndicatorSet;
use crate::domain::strategy::ruleset::{ComparisonNode, LogicOp, Ruleset, RulesetNode};
use crate::domain::trading::TradeSide;

pub struct RulesetEvaluator;

impl RulesetEvaluator {
    /// Keyed series the indicator frame must contain for this ruleset
    /// (beyond the standard family).
    pub fn required_keys(ruleset: &Ruleset) -> Vec<String> {
        let mut keys = Vec::new();
        collect_keys(&ruleset.conditions, &mut keys);
        keys
    }

    /// Evaluate all entry conditions at the given bar index.
    pub fn evaluate_at(conditions: &[RulesetNode], indicators: &IndicatorSet, index: usize) -> bool {
        if conditions.is_empty() {
            return true;
        }

        let mut results = Vec::with_capacity(conditions.len());
        let mut current_logic = LogicOp::And;

        for node in conditions {
            match node {
                RulesetNode::Comparison(c) => {
                    results.push(Self::evaluate_comparison(c, indicators, index));
                    current_logic = c.logic;
                }
                RulesetNode::Group { nodes, logic } => {
                    results.push(Self::evaluate_at(nodes, indicators, index));
                    current_logic = *logic;
                }
            }
        }

        match current_logic {
            LogicOp::Or => results.iter().any(|r| *r),
            LogicOp::And => results.iter().all(|r| *r),
        }
    }

    fn evaluate_comparison(
        condition: &ComparisonNode,
        indicators: &IndicatorSet,
        index: usize,
    ) -> bool {
        let key = resolve_key(&condition.indicator, condition.length);
        let Some(current) = indicators.value_at(&key, index) else {
            return false;
        };

        if let Some(other) = &condition.other {
            let other_key = resolve_key(other, None);
            match indicators.value_at(&other_key, index) {
                Some(other_value) => condition.relation.compare(current, other_value),
                None => false,
            }
        } else if let Some(value) = condition.value {
            condition.relation.compare(current, value)
        } else {
            false
        }
    }

    /// Stop/target levels for an entry. ATR multiples win when ATR is
    /// available, percent rules fill the gaps, fixed levels override both.
    pub fn exit_prices(
        ruleset: &Ruleset,
        entry_price: f64,
        side: TradeSide,
        atr: Option<f64>,
    ) -> (Option<f64>, Option<f64>) {
        let exit = &ruleset.exit;
        let mut stop_loss = None;
        let mut take_profit = None;

        if let Some(atr) = atr.filter(|a| *a > 0.0) {
            if let Some(mult) = exit.take_profit_atr {
                take_profit = Some(match side {
                    TradeSide::Buy => entry_price + atr * mult,
                    TradeSide::Sell => entry_price - atr * mult,
                });
            }
            if let Some(mult) = exit.stop_loss_atr {
                stop_loss = Some(match side {
                    TradeSide::Buy => entry_price - atr * mult,
                    TradeSide::Sell => entry_price + atr * mult,
                });
            }
        }

        if take_profit.is_none()
            && let Some(pct) = exit.take_profit
        {
            take_profit = Some(match side {
                TradeSide::Buy => entry_price * (1.0 + pct),
                TradeSide::Sell => entry_price * (1.0 - pct),
            });
        }
        if stop_loss.is_none()
            && let Some(pct) = exit.stop_loss
        {
            stop_loss = Some(match side {
                TradeSide::Buy => entry_price * (1.0 - pct),
                TradeSide::Sell => entry_price * (1.0 + pct),
            });
        }

        if let Some(fixed) = exit.take_profit_fixed {
            take_profit = Some(fixed);
        }
        if let Some(fixed) = exit.stop_loss_fixed {
            stop_loss = Some(fixed);
        }

        (stop_loss, take_profit)
    }

    /// Mean distance-to-threshold across satisfied comparisons, mapped
    /// into [0, 1]. 0.5 is neutral; distances scale against 10% of the
    /// reference value.
    pub fn signal_strength(
        conditions: &[RulesetNode],
        indicators: &IndicatorSet,
        index: usize,
    ) -> f64 {
        let mut strengths = Vec::new();
        collect_strengths(conditions, indicators, index, &mut strengths);

        if strengths.is_empty() {
            0.5
        } else {
            strengths.iter().sum::<f64>() / strengths.len() as f64
        }
    }
}

fn collect_strengths(
    nodes: &[RulesetNode],
    indicators: &IndicatorSet,
    index: usize,
    strengths: &mut Vec<f64>,
) {
    for node in nodes {
        match node {
            RulesetNode::Comparison(c) => {
                let key = resolve_key(&c.indicator, c.length);
                let Some(current) = indicators.value_at(&key, index) else {
                    continue;
                };
                let reference = if let Some(other) = &c.other {
                    indicators.value_at(&resolve_key(other, None), index)
                } else {
                    c.value
                };
                let Some(reference) = reference else {
                    continue;
                };

                let diff = match c.relation {
                    crate::domain::strategy::ruleset::Relation::Gt
                    | crate::domain::strategy::ruleset::Relation::Ge => current - reference,
                    crate::domain::strategy::ruleset::Relation::Lt
                    | crate::domain::strategy::ruleset::Relation::Le => reference - current,
                    _ => 0.0,
                };
                let scale = reference.abs().max(1e-9) * 0.1;
                strengths.push((0.5 + diff / scale).clamp(0.0, 1.0));
            }
            RulesetNode::Group { nodes, .. } => {
                collect_strengths(nodes, indicators, index, strengths);
            }
        }
    }
}

/// Map a DSL indicator name (optionally with a length) to the indicator
/// frame key. Names like "EMA_200" arrive whole from `other` references.
pub fn resolve_key(indicator: &str, length: Option<usize>) -> String {
    let upper = indicator.to_uppercase();
    match upper.as_str() {
        "SMA" => format!("sma_{}", length.unwrap_or(20)),
        "EMA" => format!("ema_{}", length.unwrap_or(12)),
        "RSI" => match length {
            Some(n) if n != 14 => format!("rsi_{}", n),
            _ => "rsi".to_string(),
        },
        "MACD" => "macd".to_string(),
        "MACD_SIGNAL" => "macd_signal".to_string(),
        "MACD_HIST" => "macd_hist".to_string(),
        "BOLLINGER" => "bollinger_middle".to_string(),
        "BOLLINGER_UPPER" => "bollinger_upper".to_string(),
        "BOLLINGER_LOWER" => "bollinger_lower".to_string(),
        "ATR" => match length {
            Some(n) if n != 14 => format!("atr_{}", n),
            _ => "atr".to_string(),
        },
        "VWAP" => "vwap".to_string(),
        "CLOSE" | "PRICE" => "close".to_string(),
        _ => indicator.to_lowercase(),
    }
}

fn collect_keys(nodes: &[RulesetNode], keys: &mut Vec<String>) {
    for node in nodes {
        match node {
            RulesetNode::Comparison(c) => {
                keys.push(resolve_key(&c.indicator, c.length));
                if let Some(other) = &c.other {
                    keys.push(resolve_key(other, None));
                }
            }
            RulesetNode::Group { nodes, .. } => collect_keys(nodes, keys),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::indicators::IndicatorSet;
    use crate::domain::market::types::Candle;
    use rust_decimal::Decimal;
    use serde_json::json;

    fn frame(closes: &[f64]) -> IndicatorSet {
        let candles: Vec<Candle> = closes
            .iter()
            .enumerate()
            .map(|(i, &c)| Candle {
                symbol: "TEST".to_string(),
                open: Decimal::from_f64_retain(c).unwrap(),
                high: Decimal::from_f64_retain(c + 1.0).unwrap(),
                low: Decimal::from_f64_retain(c - 1.0).unwrap(),
                close: Decimal::from_f64_retain(c).unwrap(),
                volume: Decimal::from_f64_retain(1000.0).unwrap(),
                timestamp: i as i64,
            })
            .collect();
        IndicatorSet::compute_with(&candles, &["sma_5".to_string()])
    }

    #[test]
    fn test_resolve_key() {
        assert_eq!(resolve_key("SMA", Some(50)), "sma_50");
        assert_eq!(resolve_key("EMA", None), "ema_12");
        assert_eq!(resolve_key("RSI", Some(14)), "rsi");
        assert_eq!(resolve_key("RSI", Some(7)), "rsi_7");
        assert_eq!(resolve_key("EMA_200", None), "ema_200");
        assert_eq!(resolve_key("BOLLINGER", None), "bollinger_middle");
    }

    #[test]
    fn test_and_or_evaluation() {
        let closes: Vec<f64> = (1..=40).map(|i| i as f64).collect();
        let indicators = frame(&closes);
        let last = closes.len() - 1;

        // close (40) > 30 AND sma_5 > 20 -> true.
        let rs = Ruleset::parse(&json!({
            "conditions": [
                {"indicator": "CLOSE", "relation": ">", "value": 30},
                {"indicator": "SMA", "length": 5, "relation": ">", "value": 20}
            ]
        }));
        assert!(RulesetEvaluator::evaluate_at(&rs.conditions, &indicators, last));

        // close > 100 AND sma_5 > 20 -> false.
        let rs = Ruleset::parse(&json!({
            "conditions": [
                {"indicator": "CLOSE", "relation": ">", "value": 100},
                {"indicator": "SMA", "length": 5, "relation": ">", "value": 20}
            ]
        }));
        assert!(!RulesetEvaluator::evaluate_at(&rs.conditions, &indicators, last));

        // OR rescues the failing branch.
        let rs = Ruleset::parse(&json!({
            "conditions": [
                {"logic": "OR"},
                {"indicator": "CLOSE", "relation": ">", "value": 100},
                {"indicator": "SMA", "length": 5, "relation": ">", "value": 20}
            ]
        }));
        assert!(RulesetEvaluator::evaluate_at(&rs.conditions, &indicators, last));
    }

    #[test]
    fn test_unknown_indicator_is_false_not_fatal() {
        let indicators = frame(&(1..=30).map(|i| i as f64).collect::<Vec<_>>());
        let rs = Ruleset::parse(&json!({
            "conditions": [{"indicator": "WOBBLE", "relation": ">", "value": 1}]
        }));
        assert!(!RulesetEvaluator::evaluate_at(&rs.conditions, &indicators, 29));
    }

    #[test]
    fn test_index_before_warmup_is_false() {
        let indicators = frame(&(1..=30).map(|i| i as f64).collect::<Vec<_>>());
        let rs = Ruleset::parse(&json!({
            "conditions": [{"indicator": "SMA", "length": 5, "relation": ">", "value": 0}]
        }));
        assert!(!RulesetEvaluator::evaluate_at(&rs.conditions, &indicators, 2));
        assert!(RulesetEvaluator::evaluate_at(&rs.conditions, &indicators, 10));
    }

    #[test]
    fn test_exit_prices_percent() {
        let rs = Ruleset::parse(&json!({
            "exit": {"stop_loss": 0.02, "take_profit": 0.04}
        }));
        let (stop, target) = RulesetEvaluator::exit_prices(&rs, 100.0, TradeSide::Buy, None);
        assert_eq!(stop, Some(98.0));
        assert_eq!(target, Some(104.0));

        let (stop, target) = RulesetEvaluator::exit_prices(&rs, 100.0, TradeSide::Sell, None);
        assert_eq!(stop, Some(102.0));
        assert_eq!(target, Some(96.0));
    }

    #[test]
    fn test_exit_prices_atr_beats_percent_fixed_beats_all() {
        let rs = Ruleset::parse(&json!({
            "exit": {"stop_loss": 0.02, "stop_loss_atr": 1.5, "take_profit": 0.04}
        }));
        let (stop, target) = RulesetEvaluator::exit_prices(&rs, 100.0, TradeSide::Buy, Some(2.0));
        assert_eq!(stop, Some(97.0)); // 100 - 2.0 * 1.5
        assert_eq!(target, Some(104.0)); // percent fallback

        let rs = Ruleset::parse(&json!({
            "exit": {"stop_loss": 0.02, "stop_loss_fixed": 95.0}
        }));
        let (stop, _) = RulesetEvaluator::exit_prices(&rs, 100.0, TradeSide::Buy, None);
        assert_eq!(stop, Some(95.0));
    }

    #[test]
    fn test_signal_strength_scales_with_distance() {
        let closes: Vec<f64> = (1..=40).map(|i| i as f64).collect();
        let indicators = frame(&closes);
        let last = closes.len() - 1;

        // Barely met vs comfortably met.
        let tight = Ruleset::parse(&json!({
            "conditions": [{"indicator": "CLOSE", "relation": ">", "value": 39.9}]
        }));
        let wide = Ruleset::parse(&json!({
            "conditions": [{"indicator": "CLOSE", "relation": ">", "value": 20.0}]
        }));

        let s_tight = RulesetEvaluator::signal_strength(&tight.conditions, &indicators, last);
        let s_wide = RulesetEvaluator::signal_strength(&wide.conditions, &indicators, last);
        assert!(s_wide > s_tight);
        assert!((0.0..=1.0).contains(&s_tight));
        assert!((0.0..=1.0).contains(&s_wide));
    }
}
