//! Mutation engine: derive child strategies from a parent.
//!
//! Children are new strategies (never in-place edits) linked to the parent
//! through a lineage edge that records the mutation kind and a structural
//! similarity score. Similarity drives royalty attribution later, so it is
//! computed here once, at creation time, from the same tokenizer the
//! royalty engine uses.

use chrono::Utc;
use rand::Rng;
use serde_json::Value;
use uuid::Uuid;

use crate::domain::strategy::ruleset::Ruleset;
use crate::domain::strategy::types::{
    LineageEdge, MutationKind, StrategyRecord, StrategyStatus,
};

const MAX_CHILDREN: usize = 3;

/// Weighting between token overlap and parameter proximity.
const TOKEN_WEIGHT: f64 = 0.7;
const PARAM_WEIGHT: f64 = 0.3;

#[derive(Debug, Clone)]
pub struct MutationOutcome {
    pub child: StrategyRecord,
    pub edge: LineageEdge,
}

pub struct MutationEngine;

impl MutationEngine {
    /// Produce `count` (clamped to [1, 3]) children from a parent.
    pub fn mutate(
        parent: &StrategyRecord,
        count: usize,
        created_by: &str,
    ) -> Vec<MutationOutcome> {
        let count = count.clamp(1, MAX_CHILDREN);
        let mut rng = rand::rng();
        let parent_ruleset = Ruleset::parse(&parent.ruleset);

        (0..count)
            .map(|_| {
                let kind = pick_kind(&mut rng);
                let mut doc = parent.ruleset.clone();
                apply_mutation(kind, &mut doc, &mut rng);

                let child_ruleset = Ruleset::parse(&doc);
                let similarity = Self::similarity(&parent_ruleset, &child_ruleset);
                let now = Utc::now();

                let child = StrategyRecord {
                    id: Uuid::new_v4().to_string(),
                    owner_id: parent.owner_id.clone(),
                    name: format!("{} [{}]", parent.name, kind),
                    asset_type: parent.asset_type,
                    parameters: parent.parameters.clone(),
                    ruleset: doc,
                    score: 0.0,
                    status: StrategyStatus::Experiment,
                    evolution_attempts: 0,
                    is_active: true,
                    last_backtest_at: None,
                    created_at: now,
                    updated_at: now,
                };
                let edge = LineageEdge {
                    id: Uuid::new_v4().to_string(),
                    parent_id: parent.id.clone(),
                    child_id: child.id.clone(),
                    mutation_kind: kind,
                    similarity: Some(similarity),
                    created_by: created_by.to_string(),
                    created_at: now,
                };

                MutationOutcome { child, edge }
            })
            .collect()
    }

    /// Structural similarity in [0, 1]: weighted Jaccard over ruleset
    /// tokens plus parametric proximity.
    pub fn similarity(a: &Ruleset, b: &Ruleset) -> f64 {
        let tokens_a = a.structural_tokens();
        let tokens_b = b.structural_tokens();

        let jaccard = if tokens_a.is_empty() && tokens_b.is_empty() {
            1.0
        } else {
            let intersection = tokens_a.intersection(&tokens_b).count() as f64;
            let union = tokens_a.union(&tokens_b).count() as f64;
            if union > 0.0 { intersection / union } else { 1.0 }
        };

        let params_a = a.numeric_parameters();
        let params_b = b.numeric_parameters();
        let param_sim = if params_a.is_empty() && params_b.is_empty() {
            1.0
        } else {
            let n = params_a.len().max(params_b.len());
            let mut total = 0.0;
            for i in 0..n {
                match (params_a.get(i), params_b.get(i)) {
                    (Some(x), Some(y)) => {
                        let scale = x.abs().max(y.abs()).max(1e-9);
                        total += 1.0 - ((x - y).abs() / scale).min(1.0);
                    }
                    _ => {} // A missing parameter contributes zero proximity.
                }
            }
            total / n as f64
        };

        (TOKEN_WEIGHT * jaccard + PARAM_WEIGHT * param_sim).clamp(0.0, 1.0)
    }
}

fn pick_kind(rng: &mut impl Rng) -> MutationKind {
    match rng.random_range(0..5) {
        0 => MutationKind::ParameterTweak,
        1 => MutationKind::ConditionToggle,
        2 => MutationKind::TimeframeShift,
        3 => MutationKind::ExitRatioTweak,
        _ => MutationKind::IndicatorSwap,
    }
}

fn apply_mutation(kind: MutationKind, doc: &mut Value, rng: &mut impl Rng) {
    match kind {
        MutationKind::ParameterTweak => tweak_parameters(doc, rng),
        MutationKind::ConditionToggle => toggle_condition(doc, rng),
        MutationKind::TimeframeShift => shift_timeframe(doc, rng),
        MutationKind::ExitRatioTweak => tweak_exit_ratios(doc, rng),
        MutationKind::IndicatorSwap => swap_indicator(doc, rng),
        // Crossover edges are written by the evolution worker when it
        // merges two parents; a single-parent mutation never picks it.
        MutationKind::Crossover => tweak_parameters(doc, rng),
    }
}

/// Perturb numeric comparison thresholds by up to ±20%.
fn tweak_parameters(doc: &mut Value, rng: &mut impl Rng) {
    let Some(conditions) = doc.get_mut("conditions").and_then(Value::as_array_mut) else {
        return;
    };
    for item in conditions {
        if let Some(value) = item.get("value").and_then(Value::as_f64) {
            let factor = 1.0 + rng.random_range(-0.2..0.2);
            let perturbed = value * factor;
            if let Some(obj) = item.as_object_mut()
                && let Some(json_value) = serde_json::Number::from_f64(perturbed)
            {
                obj.insert("value".to_string(), Value::Number(json_value));
            }
        }
    }
}

/// Remove one comparison, or add a mild RSI guard when there is only one.
fn toggle_condition(doc: &mut Value, rng: &mut impl Rng) {
    let Some(conditions) = doc.get_mut("conditions").and_then(Value::as_array_mut) else {
        return;
    };
    let comparison_indices: Vec<usize> = conditions
        .iter()
        .enumerate()
        .filter(|(_, item)| item.get("indicator").is_some())
        .map(|(i, _)| i)
        .collect();

    if comparison_indices.len() > 1 {
        let victim = comparison_indices[rng.random_range(0..comparison_indices.len())];
        conditions.remove(victim);
    } else {
        conditions.push(serde_json::json!({
            "indicator": "RSI",
            "length": 14,
            "relation": "<",
            "value": 70.0
        }));
    }
}

const TIMEFRAME_LADDER: &[&str] = &["1m", "5m", "15m", "1h", "4h", "1d"];

fn shift_timeframe(doc: &mut Value, rng: &mut impl Rng) {
    let current = doc
        .get("timeframe")
        .and_then(Value::as_str)
        .unwrap_or("1d")
        .to_string();
    let position = TIMEFRAME_LADDER
        .iter()
        .position(|tf| *tf == current)
        .unwrap_or(TIMEFRAME_LADDER.len() - 1);

    let shifted = if position == 0 {
        1
    } else if position == TIMEFRAME_LADDER.len() - 1 {
        position - 1
    } else if rng.random_bool(0.5) {
        position + 1
    } else {
        position - 1
    };

    if let Some(obj) = doc.as_object_mut() {
        obj.insert(
            "timeframe".to_string(),
            Value::String(TIMEFRAME_LADDER[shifted].to_string()),
        );
    }
}

/// Scale stop/target percentages by 0.8-1.2.
fn tweak_exit_ratios(doc: &mut Value, rng: &mut impl Rng) {
    let Some(exit) = doc.get_mut("exit").and_then(Value::as_object_mut) else {
        return;
    };
    for key in ["stop_loss", "take_profit", "stop_loss_atr", "take_profit_atr"] {
        if let Some(value) = exit.get(key).and_then(Value::as_f64) {
            let factor = rng.random_range(0.8..1.2);
            if let Some(json_value) = serde_json::Number::from_f64(value * factor) {
                exit.insert(key.to_string(), Value::Number(json_value));
            }
        }
    }
}

/// Swap a moving-average family indicator for its sibling.
fn swap_indicator(doc: &mut Value, rng: &mut impl Rng) {
    let Some(conditions) = doc.get_mut("conditions").and_then(Value::as_array_mut) else {
        return;
    };
    let swappable: Vec<usize> = conditions
        .iter()
        .enumerate()
        .filter(|(_, item)| {
            matches!(
                item.get("indicator").and_then(Value::as_str),
                Some("SMA") | Some("EMA") | Some("sma") | Some("ema")
            )
        })
        .map(|(i, _)| i)
        .collect();

    if swappable.is_empty() {
        // Nothing to swap; fall back to a parameter tweak so the child
        // still differs from its parent.
        tweak_parameters(doc, rng);
        return;
    }

    let target = swappable[rng.random_range(0..swappable.len())];
    if let Some(obj) = conditions[target].as_object_mut() {
        let current = obj
            .get("indicator")
            .and_then(Value::as_str)
            .unwrap_or("SMA")
            .to_uppercase();
        let swapped = if current == "SMA" { "EMA" } else { "SMA" };
        obj.insert(
            "indicator".to_string(),
            Value::String(swapped.to_string()),
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::trading::AssetType;
    use serde_json::json;

    fn parent() -> StrategyRecord {
        let now = Utc::now();
        StrategyRecord {
            id: "parent".to_string(),
            owner_id: "creator".to_string(),
            name: "RSI Reversal".to_string(),
            asset_type: AssetType::Stock,
            parameters: json!({}),
            ruleset: json!({
                "type": "mean_reversion",
                "conditions": [
                    {"indicator": "RSI", "length": 14, "relation": "<", "value": 30},
                    {"indicator": "SMA", "length": 20, "relation": ">", "other": "SMA_50"}
                ],
                "exit": {"stop_loss": 0.02, "take_profit": 0.04},
                "timeframe": "1d"
            }),
            score: 0.8,
            status: StrategyStatus::Proposable,
            evolution_attempts: 4,
            is_active: true,
            last_backtest_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn test_self_similarity_is_one() {
        let rs = Ruleset::parse(&parent().ruleset);
        assert_eq!(MutationEngine::similarity(&rs, &rs), 1.0);
    }

    #[test]
    fn test_children_start_in_experiment() {
        let outcomes = MutationEngine::mutate(&parent(), 3, "worker");
        assert_eq!(outcomes.len(), 3);
        for outcome in &outcomes {
            assert_eq!(outcome.child.status, StrategyStatus::Experiment);
            assert_eq!(outcome.child.evolution_attempts, 0);
            assert_eq!(outcome.edge.parent_id, "parent");
            assert_eq!(outcome.edge.child_id, outcome.child.id);
            let similarity = outcome.edge.similarity.unwrap();
            assert!((0.0..=1.0).contains(&similarity));
        }
    }

    #[test]
    fn test_count_is_clamped() {
        assert_eq!(MutationEngine::mutate(&parent(), 0, "worker").len(), 1);
        assert_eq!(MutationEngine::mutate(&parent(), 99, "worker").len(), 3);
    }

    #[test]
    fn test_mutation_changes_document() {
        // Across enough attempts every child must differ from the parent
        // structurally or parametrically.
        let parent = parent();
        let outcomes = MutationEngine::mutate(&parent, 3, "worker");
        let parent_rs = Ruleset::parse(&parent.ruleset);
        for outcome in outcomes {
            let child_rs = Ruleset::parse(&outcome.child.ruleset);
            let similarity = MutationEngine::similarity(&parent_rs, &child_rs);
            assert!(similarity < 1.0, "child identical to parent");
        }
    }

    #[test]
    fn test_dissimilar_rulesets_score_low() {
        let a = Ruleset::parse(&json!({
            "conditions": [{"indicator": "RSI", "length": 14, "relation": "<", "value": 30}],
            "timeframe": "1d"
        }));
        let b = Ruleset::parse(&json!({
            "conditions": [{"indicator": "MACD", "relation": ">", "value": 0}],
            "timeframe": "5m"
        }));
        assert!(MutationEngine::similarity(&a, &b) < 0.5);
    }
}
