//! Explanation synthesis: one entry per factor that shaped a signal, with
//! the factor's observed value, its weight in calibration, and a
//! qualitative reading a user can act on.

use serde::{Deserialize, Serialize};

use crate::application::brain::multi_timeframe::TrendAnalysis;
use crate::application::brain::portfolio_risk::PortfolioRiskVerdict;
use crate::application::brain::regime::{Regime, RegimeAssessment};
use crate::application::brain::user_risk::RiskProfile;
use crate::application::brain::volume::{VolumeConfirmation, VolumeRecommendation};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExplanationFactor {
    pub factor: String,
    pub value: String,
    pub weight: f64,
    pub impact: String,
}

/// Provenance note about the strategy behind the signal.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LineageNote {
    pub ancestor_count: u32,
    /// Strategy score at signal time; a proxy for how settled it is.
    pub stability: f64,
    pub overfit_flag: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Explanation {
    pub summary: String,
    pub factors: Vec<ExplanationFactor>,
    pub lineage: LineageNote,
}

impl Explanation {
    pub fn not_triggered() -> Self {
        Self {
            summary: "Entry conditions not met".to_string(),
            factors: Vec::new(),
            lineage: LineageNote::default(),
        }
    }
}

pub struct ExplanationBuilder {
    factors: Vec<ExplanationFactor>,
    lineage: LineageNote,
}

impl ExplanationBuilder {
    pub fn new() -> Self {
        Self {
            factors: Vec::new(),
            lineage: LineageNote::default(),
        }
    }

    pub fn strategy_score(mut self, score: f64, weight: f64) -> Self {
        let impact = if score >= 0.7 {
            "strong historical performance"
        } else if score >= 0.4 {
            "mixed historical performance"
        } else {
            "weak historical performance"
        };
        self.factors.push(ExplanationFactor {
            factor: "strategy_score".to_string(),
            value: format!("{:.2}", score),
            weight,
            impact: impact.to_string(),
        });
        self
    }

    pub fn signal_strength(mut self, strength: f64, weight: f64) -> Self {
        let impact = if strength >= 0.7 {
            "conditions met with wide margin"
        } else if strength >= 0.4 {
            "conditions met near their thresholds"
        } else {
            "conditions barely met"
        };
        self.factors.push(ExplanationFactor {
            factor: "signal_strength".to_string(),
            value: format!("{:.2}", strength),
            weight,
            impact: impact.to_string(),
        });
        self
    }

    pub fn regime(mut self, assessment: &RegimeAssessment, multiplier: f64) -> Self {
        let impact = match assessment.regime {
            Regime::Momentum => "trending market favors directional entries",
            Regime::RiskOn => "supportive low-volatility backdrop",
            Regime::RiskOff => "defensive regime argues for caution",
            Regime::Volatility => "elevated volatility widens outcome spread",
            Regime::Neutral => "no regime edge either way",
        };
        self.factors.push(ExplanationFactor {
            factor: "market_regime".to_string(),
            value: format!(
                "{} (confidence {:.2})",
                assessment.regime, assessment.confidence
            ),
            weight: multiplier,
            impact: impact.to_string(),
        });
        self
    }

    pub fn trend_alignment(mut self, trend: &TrendAnalysis, multiplier: f64) -> Self {
        let impact = if trend.alignment_score >= 0.9 {
            "timeframes agree on direction"
        } else if trend.alignment_score >= 0.6 {
            "most timeframes agree"
        } else {
            "timeframes disagree"
        };
        self.factors.push(ExplanationFactor {
            factor: "trend_alignment".to_string(),
            value: format!(
                "short {} / medium {} / long {} ({:.2})",
                trend.trend_short, trend.trend_medium, trend.trend_long, trend.alignment_score
            ),
            weight: multiplier,
            impact: impact.to_string(),
        });
        self
    }

    pub fn volume(mut self, volume: &VolumeConfirmation, multiplier: f64) -> Self {
        let impact = match volume.recommendation {
            VolumeRecommendation::Confirm => "participation backs the move",
            VolumeRecommendation::Caution => "participation is unconvincing",
            VolumeRecommendation::Block => "volume too thin to trust the move",
        };
        self.factors.push(ExplanationFactor {
            factor: "volume_confirmation".to_string(),
            value: format!("{} (ratio {:.2})", volume.trend, volume.ratio),
            weight: multiplier,
            impact: impact.to_string(),
        });
        self
    }

    pub fn risk_profile(mut self, profile: &RiskProfile, multiplier: f64) -> Self {
        self.factors.push(ExplanationFactor {
            factor: "user_risk_profile".to_string(),
            value: format!(
                "{} (confidence {:.2})",
                profile.tendency, profile.confidence
            ),
            weight: multiplier,
            impact: format!("sized for a {} profile", profile.tendency),
        });
        self
    }

    pub fn portfolio(mut self, verdict: &PortfolioRiskVerdict) -> Self {
        self.factors.push(ExplanationFactor {
            factor: "portfolio_risk".to_string(),
            value: format!(
                "symbol {:.1}% / sector {:.1}% / leverage {:.2}",
                verdict.factors.symbol_exposure * 100.0,
                verdict.factors.sector_exposure * 100.0,
                verdict.factors.leverage
            ),
            weight: verdict.adjustment,
            impact: verdict.reason.clone(),
        });
        self
    }

    pub fn lineage(mut self, ancestor_count: u32, stability: f64, overfit_flag: bool) -> Self {
        self.lineage = LineageNote {
            ancestor_count,
            stability,
            overfit_flag,
        };
        self
    }

    pub fn build(self, summary: String) -> Explanation {
        Explanation {
            summary,
            factors: self.factors,
            lineage: self.lineage,
        }
    }
}

impl Default for ExplanationBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder_collects_factors() {
        let explanation = ExplanationBuilder::new()
            .strategy_score(0.8, 0.7)
            .signal_strength(0.9, 0.3)
            .lineage(2, 0.8, false)
            .build("BUY AAPL".to_string());

        assert_eq!(explanation.factors.len(), 2);
        assert_eq!(explanation.factors[0].factor, "strategy_score");
        assert_eq!(explanation.lineage.ancestor_count, 2);
        assert!(!explanation.lineage.overfit_flag);
    }

    #[test]
    fn test_not_triggered_is_minimal() {
        let explanation = Explanation::not_triggered();
        assert!(explanation.factors.is_empty());
        assert!(explanation.summary.contains("not met"));
    }
}
