//! Strategy rule DSL.
//!
//! Rulesets arrive as JSON documents:
//!
//! ```json
//! {
//!   "type": "trend_follow",
//!   "conditions": [
//!     {"indicator": "EMA", "length": 50, "relation": ">", "other": "EMA_200"},
//!     {"indicator": "RSI", "length": 14, "relation": "<", "value": 70},
//!     {"logic": "AND"}
//!   ],
//!   "entry": "close",
//!   "exit": {"take_profit": 0.03, "stop_loss": 0.01},
//!   "timeframe": "1d"
//! }
//! ```
//!
//! Parsing is tolerant: unknown fields are ignored and missing fields take
//! defaults, so a malformed user document degrades to a ruleset that simply
//! never fires rather than an error deep inside a worker cycle.

use anyhow::{Result, anyhow};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use crate::domain::market::Timeframe;
use crate::domain::trading::TradeSide;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Relation {
    Gt,
    Ge,
    Lt,
    Le,
    Eq,
    Ne,
}

impl Relation {
    pub fn compare(&self, a: f64, b: f64) -> bool {
        match self {
            Relation::Gt => a > b,
            Relation::Ge => a >= b,
            Relation::Lt => a < b,
            Relation::Le => a <= b,
            Relation::Eq => (a - b).abs() < 1e-4,
            Relation::Ne => (a - b).abs() >= 1e-4,
        }
    }
}

impl fmt::Display for Relation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Relation::Gt => ">",
            Relation::Ge => ">=",
            Relation::Lt => "<",
            Relation::Le => "<=",
            Relation::Eq => "==",
            Relation::Ne => "!=",
        };
        write!(f, "{}", s)
    }
}

impl FromStr for Relation {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            ">" => Ok(Relation::Gt),
            ">=" => Ok(Relation::Ge),
            "<" => Ok(Relation::Lt),
            "<=" => Ok(Relation::Le),
            "==" | "=" => Ok(Relation::Eq),
            "!=" => Ok(Relation::Ne),
            _ => Err(anyhow!("Invalid relation: {}", s)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LogicOp {
    And,
    Or,
}

/// A single indicator comparison: `indicator <relation> value` or
/// `indicator <relation> other_indicator`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComparisonNode {
    pub indicator: String,
    pub length: Option<usize>,
    pub relation: Relation,
    pub value: Option<f64>,
    pub other: Option<String>,
    /// Logic operator in effect when this node was parsed.
    pub logic: LogicOp,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum RulesetNode {
    Comparison(ComparisonNode),
    Group { nodes: Vec<RulesetNode>, logic: LogicOp },
}

/// Entry price reference within the triggering bar.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PriceRef {
    Close,
    Open,
    High,
    Low,
}

/// Exit configuration. Styles: fractional percent (`stop_loss: 0.02`),
/// ATR multiple (`stop_loss_atr: 1.5`) and fixed level
/// (`stop_loss_fixed: 145.0`). ATR wins over percent when ATR is
/// available; fixed levels override both.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExitSpec {
    pub stop_loss: Option<f64>,
    pub take_profit: Option<f64>,
    pub stop_loss_atr: Option<f64>,
    pub take_profit_atr: Option<f64>,
    pub stop_loss_fixed: Option<f64>,
    pub take_profit_fixed: Option<f64>,
    pub trailing_stop: Option<f64>,
}

impl ExitSpec {
    pub fn is_empty(&self) -> bool {
        self.stop_loss.is_none()
            && self.take_profit.is_none()
            && self.stop_loss_atr.is_none()
            && self.take_profit_atr.is_none()
            && self.stop_loss_fixed.is_none()
            && self.take_profit_fixed.is_none()
            && self.trailing_stop.is_none()
    }
}

/// Parsed, evaluable ruleset.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Ruleset {
    pub kind: String,
    pub conditions: Vec<RulesetNode>,
    pub entry: PriceRef,
    pub exit: ExitSpec,
    pub timeframe: Timeframe,
    pub side: TradeSide,
}

impl Ruleset {
    /// Parse a JSON ruleset document. Tolerant of missing fields.
    pub fn parse(doc: &Value) -> Self {
        let kind = doc
            .get("type")
            .and_then(Value::as_str)
            .unwrap_or("custom")
            .to_string();

        let conditions = doc
            .get("conditions")
            .and_then(Value::as_array)
            .map(|items| parse_conditions(items))
            .unwrap_or_default();

        let entry = match doc.get("entry").and_then(Value::as_str) {
            Some("open") => PriceRef::Open,
            Some("high") => PriceRef::High,
            Some("low") => PriceRef::Low,
            _ => PriceRef::Close,
        };

        let exit = doc
            .get("exit")
            .map(parse_exit)
            .unwrap_or_default();

        let timeframe = doc
            .get("timeframe")
            .and_then(Value::as_str)
            .and_then(|s| Timeframe::from_str(s).ok())
            .unwrap_or(Timeframe::OneDay);

        let side = doc
            .get("side")
            .and_then(Value::as_str)
            .and_then(|s| TradeSide::from_str(s).ok())
            .unwrap_or(TradeSide::Buy);

        Self {
            kind,
            conditions,
            entry,
            exit,
            timeframe,
            side,
        }
    }

    /// Serialize back to the JSON document form (used by the mutation
    /// engine, which edits documents rather than parsed trees).
    pub fn to_document(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }

    /// Structural tokens for similarity scoring: one token per comparison,
    /// plus timeframe and exit-style tokens. Parameters are part of the
    /// token so a threshold change registers as a structural change.
    pub fn structural_tokens(&self) -> BTreeSet<String> {
        let mut tokens = BTreeSet::new();
        collect_tokens(&self.conditions, &mut tokens);
        tokens.insert(format!("timeframe:{}", self.timeframe));
        tokens.insert(format!("entry:{:?}", self.entry));
        if let Some(sl) = self.exit.stop_loss {
            tokens.insert(format!("exit:stop_loss:{:.4}", sl));
        }
        if let Some(tp) = self.exit.take_profit {
            tokens.insert(format!("exit:take_profit:{:.4}", tp));
        }
        if let Some(sl) = self.exit.stop_loss_atr {
            tokens.insert(format!("exit:stop_loss_atr:{:.2}", sl));
        }
        if let Some(tp) = self.exit.take_profit_atr {
            tokens.insert(format!("exit:take_profit_atr:{:.2}", tp));
        }
        tokens
    }

    /// Numeric parameters (condition lengths and thresholds) for parametric
    /// distance.
    pub fn numeric_parameters(&self) -> Vec<f64> {
        let mut params = Vec::new();
        collect_parameters(&self.conditions, &mut params);
        if let Some(sl) = self.exit.stop_loss {
            params.push(sl);
        }
        if let Some(tp) = self.exit.take_profit {
            params.push(tp);
        }
        params
    }
}

fn parse_conditions(items: &[Value]) -> Vec<RulesetNode> {
    let mut nodes = Vec::new();
    let mut current_logic = LogicOp::And;

    for item in items {
        let Some(obj) = item.as_object() else {
            continue;
        };

        if let Some(logic) = obj.get("logic").and_then(Value::as_str) {
            current_logic = if logic.eq_ignore_ascii_case("or") {
                LogicOp::Or
            } else {
                LogicOp::And
            };
            continue;
        }

        if let Some(indicator) = obj.get("indicator").and_then(Value::as_str) {
            let relation = obj
                .get("relation")
                .and_then(Value::as_str)
                .and_then(|s| Relation::from_str(s).ok())
                .unwrap_or(Relation::Gt);

            nodes.push(RulesetNode::Comparison(ComparisonNode {
                indicator: indicator.to_uppercase(),
                length: obj.get("length").and_then(Value::as_u64).map(|v| v as usize),
                relation,
                value: obj.get("value").and_then(Value::as_f64),
                other: obj
                    .get("other")
                    .and_then(Value::as_str)
                    .map(|s| s.to_uppercase()),
                logic: current_logic,
            }));
            continue;
        }

        if let Some(nested) = obj.get("condition").and_then(Value::as_array) {
            nodes.push(RulesetNode::Group {
                nodes: parse_conditions(nested),
                logic: current_logic,
            });
        }
    }

    nodes
}

fn parse_exit(doc: &Value) -> ExitSpec {
    let get = |key: &str| doc.get(key).and_then(Value::as_f64);
    ExitSpec {
        stop_loss: get("stop_loss"),
        take_profit: get("take_profit"),
        stop_loss_atr: get("stop_loss_atr"),
        take_profit_atr: get("take_profit_atr"),
        stop_loss_fixed: get("stop_loss_fixed"),
        take_profit_fixed: get("take_profit_fixed"),
        trailing_stop: get("trailing_stop"),
    }
}

fn collect_tokens(nodes: &[RulesetNode], tokens: &mut BTreeSet<String>) {
    for node in nodes {
        match node {
            RulesetNode::Comparison(c) => {
                let target = c
                    .other
                    .clone()
                    .or(c.value.map(|v| format!("{:.4}", v)))
                    .unwrap_or_default();
                tokens.insert(format!(
                    "cond:{}:{}:{}:{}",
                    c.indicator,
                    c.length.map(|l| l.to_string()).unwrap_or_default(),
                    c.relation,
                    target
                ));
            }
            RulesetNode::Group { nodes, .. } => collect_tokens(nodes, tokens),
        }
    }
}

fn collect_parameters(nodes: &[RulesetNode], params: &mut Vec<f64>) {
    for node in nodes {
        match node {
            RulesetNode::Comparison(c) => {
                if let Some(l) = c.length {
                    params.push(l as f64);
                }
                if let Some(v) = c.value {
                    params.push(v);
                }
            }
            RulesetNode::Group { nodes, .. } => collect_parameters(nodes, params),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_basic_ruleset() {
        let doc = json!({
            "type": "trend_follow",
            "conditions": [
                {"indicator": "EMA", "length": 50, "relation": ">", "other": "EMA_200"},
                {"indicator": "RSI", "length": 14, "relation": "<", "value": 70},
                {"logic": "AND"}
            ],
            "entry": "close",
            "exit": {"take_profit": 0.03, "stop_loss": 0.01},
            "timeframe": "1d"
        });

        let rs = Ruleset::parse(&doc);
        assert_eq!(rs.kind, "trend_follow");
        assert_eq!(rs.conditions.len(), 2);
        assert_eq!(rs.entry, PriceRef::Close);
        assert_eq!(rs.exit.take_profit, Some(0.03));
        assert_eq!(rs.timeframe, Timeframe::OneDay);
        assert_eq!(rs.side, TradeSide::Buy);
    }

    #[test]
    fn test_parse_nested_group_and_or() {
        let doc = json!({
            "conditions": [
                {"logic": "OR"},
                {"indicator": "RSI", "length": 14, "relation": "<", "value": 30},
                {"condition": [
                    {"indicator": "SMA", "length": 20, "relation": ">", "other": "SMA_50"}
                ]}
            ]
        });

        let rs = Ruleset::parse(&doc);
        assert_eq!(rs.conditions.len(), 2);
        match &rs.conditions[0] {
            RulesetNode::Comparison(c) => assert_eq!(c.logic, LogicOp::Or),
            other => panic!("expected comparison, got {:?}", other),
        }
        assert!(matches!(rs.conditions[1], RulesetNode::Group { .. }));
    }

    #[test]
    fn test_parse_empty_document_is_inert() {
        let rs = Ruleset::parse(&json!({}));
        assert!(rs.conditions.is_empty());
        assert!(rs.exit.is_empty());
    }

    #[test]
    fn test_structural_tokens_capture_thresholds() {
        let a = Ruleset::parse(&json!({
            "conditions": [{"indicator": "RSI", "length": 14, "relation": "<", "value": 30}],
            "exit": {"stop_loss": 0.02}
        }));
        let b = Ruleset::parse(&json!({
            "conditions": [{"indicator": "RSI", "length": 14, "relation": "<", "value": 25}],
            "exit": {"stop_loss": 0.02}
        }));

        let ta = a.structural_tokens();
        let tb = b.structural_tokens();
        assert_ne!(ta, tb);
        assert!(ta.iter().any(|t| t.contains("RSI")));
    }

    #[test]
    fn test_relation_compare() {
        assert!(Relation::Lt.compare(25.0, 30.0));
        assert!(!Relation::Lt.compare(35.0, 30.0));
        assert!(Relation::Eq.compare(1.00001, 1.0));
        assert!(Relation::Ne.compare(1.1, 1.0));
    }
}
