//! Strategy recommendations and the brain summary.
//!
//! Both surfaces must never fail outward: any internal error degrades to
//! an empty payload with the standing disclaimer.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::warn;

use crate::application::brain::regime::{Regime, RegimeDetector};
use crate::domain::repositories::{
    BacktestRepository, LineageRepository, StrategyRepository,
};
use crate::domain::strategy::StrategyStatus;

const DISCLAIMER: &str = "These recommendations are based on historical backtests and are \
     not guaranteed. Markets can behave differently; past performance does not guarantee \
     future results.";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BacktestDigest {
    pub win_rate: f64,
    pub avg_return: f64,
    pub sample_size: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Recommendation {
    pub strategy_id: String,
    pub name: String,
    pub score: f64,
    pub metrics: Option<BacktestDigest>,
    pub regime_compatibility: f64,
    pub confidence: f64,
    pub why_recommended: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Recommendations {
    pub recommendations: Vec<Recommendation>,
    pub count: usize,
    pub disclaimer: String,
}

impl Recommendations {
    fn empty() -> Self {
        Self {
            recommendations: Vec::new(),
            count: 0,
            disclaimer: DISCLAIMER.to_string(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BrainSummary {
    pub total_strategies: usize,
    pub active_strategies: usize,
    pub proposable_strategies: usize,
    pub mutated_strategies: usize,
    pub top_strategies: Vec<Recommendation>,
    pub message: Option<String>,
}

pub struct RecommendationService {
    strategies: Arc<dyn StrategyRepository>,
    backtests: Arc<dyn BacktestRepository>,
    lineage: Arc<dyn LineageRepository>,
    regime: Arc<RegimeDetector>,
}

impl RecommendationService {
    pub fn new(
        strategies: Arc<dyn StrategyRepository>,
        backtests: Arc<dyn BacktestRepository>,
        lineage: Arc<dyn LineageRepository>,
        regime: Arc<RegimeDetector>,
    ) -> Self {
        Self {
            strategies,
            backtests,
            lineage,
            regime,
        }
    }

    /// Ranked proposable strategies for a user, biased by the current
    /// regime for `symbol` when given. Never errors.
    pub async fn recommended(
        &self,
        user_id: &str,
        symbol: Option<&str>,
        limit: usize,
    ) -> Recommendations {
        let strategies = match self.strategies.list_active().await {
            Ok(strategies) => strategies,
            Err(e) => {
                warn!("Recommendation listing failed for {}: {:#}", user_id, e);
                return Recommendations::empty();
            }
        };

        let regime = match symbol {
            Some(symbol) => Some(self.regime.assess(symbol).await),
            None => None,
        };

        let mut ranked = Vec::new();
        for strategy in strategies
            .iter()
            .filter(|s| s.is_proposable() || s.owner_id == user_id)
        {
            let digest = match self.backtests.latest_for(&strategy.id).await {
                Ok(Some(report)) => Some(BacktestDigest {
                    win_rate: report.win_rate,
                    avg_return: report.total_return,
                    sample_size: report.total_trades,
                }),
                _ => None,
            };

            let regime_compatibility = regime
                .as_ref()
                .map(|assessment| regime_fit(assessment.regime, strategy.score))
                .unwrap_or(0.5);

            let confidence =
                (0.6 * strategy.score + 0.4 * regime_compatibility).clamp(0.0, 1.0);
            let why_recommended = match &digest {
                Some(d) => format!(
                    "{:.0}% win rate over {} backtested trades",
                    d.win_rate * 100.0,
                    d.sample_size
                ),
                None => "Awaiting its first full backtest".to_string(),
            };

            ranked.push(Recommendation {
                strategy_id: strategy.id.clone(),
                name: strategy.name.clone(),
                score: strategy.score,
                metrics: digest,
                regime_compatibility,
                confidence,
                why_recommended,
            });
        }

        ranked.sort_by(|a, b| {
            b.confidence
                .partial_cmp(&a.confidence)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        ranked.truncate(limit.max(1));

        Recommendations {
            count: ranked.len(),
            recommendations: ranked,
            disclaimer: DISCLAIMER.to_string(),
        }
    }

    /// Per-user evolution overview. Never errors.
    pub async fn summary(&self, user_id: &str) -> BrainSummary {
        let strategies = match self.strategies.list_by_owner(user_id).await {
            Ok(strategies) => strategies,
            Err(e) => {
                warn!("Summary listing failed for {}: {:#}", user_id, e);
                return BrainSummary {
                    message: Some("Unable to load summary. Please try again later.".to_string()),
                    ..BrainSummary::default()
                };
            }
        };

        let mut mutated = 0usize;
        for strategy in &strategies {
            match self.lineage.parents_of(&strategy.id).await {
                Ok(parents) if !parents.is_empty() => mutated += 1,
                _ => {}
            }
        }

        let mut top: Vec<Recommendation> = strategies
            .iter()
            .map(|s| Recommendation {
                strategy_id: s.id.clone(),
                name: s.name.clone(),
                score: s.score,
                metrics: None,
                regime_compatibility: 0.5,
                confidence: s.score,
                why_recommended: s.status.to_string(),
            })
            .collect();
        top.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
        top.truncate(10);

        let total = strategies.len();
        let active = strategies.iter().filter(|s| s.is_active).count();
        let proposable = strategies
            .iter()
            .filter(|s| s.status == StrategyStatus::Proposable)
            .count();

        let message = if total == 0 {
            Some("No strategies yet. Evolution starts once one is created.".to_string())
        } else if active == 0 {
            Some("No active strategies. Strategies activate after backtesting.".to_string())
        } else {
            None
        };

        BrainSummary {
            total_strategies: total,
            active_strategies: active,
            proposable_strategies: proposable,
            mutated_strategies: mutated,
            top_strategies: top,
            message,
        }
    }
}

/// How well a strategy's track record suits the current regime. Strong
/// strategies keep their edge in supportive regimes and give some back in
/// defensive ones.
fn regime_fit(regime: Regime, score: f64) -> f64 {
    let bias = match regime {
        Regime::Momentum | Regime::RiskOn => 0.1,
        Regime::Neutral => 0.0,
        Regime::Volatility => -0.1,
        Regime::RiskOff => -0.2,
    };
    (score + bias).clamp(0.0, 1.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_regime_fit_bias() {
        assert!(regime_fit(Regime::Momentum, 0.6) > regime_fit(Regime::RiskOff, 0.6));
        assert_eq!(regime_fit(Regime::Neutral, 0.6), 0.6);
        assert_eq!(regime_fit(Regime::RiskOff, 0.1), 0.0);
    }
}
