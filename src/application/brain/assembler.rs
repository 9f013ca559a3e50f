//! Brain signal assembler: composes the strategy engine, market data,
//! regime memory and the confirmation/risk stack into one calibrated
//! signal with a full per-factor explanation.

use anyhow::{Context, Result, anyhow};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info};

use crate::application::brain::explanation::{Explanation, ExplanationBuilder};
use crate::application::brain::multi_timeframe::{MultiTimeframeAnalyzer, TrendAnalysis};
use crate::application::brain::portfolio_risk::{
    PortfolioRiskManager, PortfolioRiskVerdict, ProposedTrade,
};
use crate::application::brain::regime::{Regime, RegimeAssessment, RegimeDetector};
use crate::application::brain::user_risk::{RiskProfile, RiskTendency, UserRiskProfiler};
use crate::application::brain::volume::{
    VolumeAnalyzer, VolumeConfirmation, VolumeRecommendation,
};
use crate::application::strategy_engine::evaluator::RulesetEvaluator;
use crate::domain::errors::SignalRefusal;
use crate::domain::indicators::IndicatorSet;
use crate::domain::market::types::CandleRequest;
use crate::domain::repositories::{
    BacktestRepository, LineageRepository, PaperAccountRepository, StrategyRepository,
};
use crate::domain::strategy::ruleset::{PriceRef, Ruleset};
use crate::domain::trading::TradeSide;
use crate::infrastructure::market_data::ProviderRouter;
use crate::infrastructure::observability::Metrics;
use rust_decimal::prelude::ToPrimitive;

/// Candle history pulled for indicator computation.
const SIGNAL_CANDLE_DEPTH: usize = 200;
/// Fraction of account balance assumed per brain-sized position.
const NOMINAL_POSITION_FRACTION: f64 = 0.10;
/// Overfit gate mirrored from the evolution thresholds.
const OVERFIT_RATIO_FLOOR: f64 = 0.7;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SignalSide {
    Buy,
    Sell,
    Hold,
}

impl fmt::Display for SignalSide {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SignalSide::Buy => write!(f, "BUY"),
            SignalSide::Sell => write!(f, "SELL"),
            SignalSide::Hold => write!(f, "HOLD"),
        }
    }
}

impl From<TradeSide> for SignalSide {
    fn from(side: TradeSide) -> Self {
        match side {
            TradeSide::Buy => SignalSide::Buy,
            TradeSide::Sell => SignalSide::Sell,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrainSignal {
    pub strategy_id: String,
    pub symbol: String,
    pub side: SignalSide,
    pub entry: Option<f64>,
    pub stop_loss: Option<f64>,
    pub take_profit: Option<f64>,
    pub confidence: f64,
    pub reasoning: String,
    pub refusal: Option<SignalRefusal>,
    pub regime: RegimeAssessment,
    pub trend: TrendAnalysis,
    pub volume: VolumeConfirmation,
    pub risk_profile: RiskProfile,
    pub portfolio: Option<PortfolioRiskVerdict>,
    pub explanation: Explanation,
    pub timestamp: DateTime<Utc>,
}

pub struct SignalAssembler {
    strategies: Arc<dyn StrategyRepository>,
    lineage: Arc<dyn LineageRepository>,
    backtests: Arc<dyn BacktestRepository>,
    accounts: Arc<dyn PaperAccountRepository>,
    router: Arc<ProviderRouter>,
    regime: Arc<RegimeDetector>,
    trend: Arc<MultiTimeframeAnalyzer>,
    volume: Arc<VolumeAnalyzer>,
    user_risk: Arc<UserRiskProfiler>,
    portfolio: Arc<PortfolioRiskManager>,
    metrics: Metrics,
    min_confidence: f64,
}

impl SignalAssembler {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        strategies: Arc<dyn StrategyRepository>,
        lineage: Arc<dyn LineageRepository>,
        backtests: Arc<dyn BacktestRepository>,
        accounts: Arc<dyn PaperAccountRepository>,
        router: Arc<ProviderRouter>,
        regime: Arc<RegimeDetector>,
        trend: Arc<MultiTimeframeAnalyzer>,
        volume: Arc<VolumeAnalyzer>,
        user_risk: Arc<UserRiskProfiler>,
        portfolio: Arc<PortfolioRiskManager>,
        metrics: Metrics,
        min_confidence: f64,
    ) -> Self {
        Self {
            strategies,
            lineage,
            backtests,
            accounts,
            router,
            regime,
            trend,
            volume,
            user_risk,
            portfolio,
            metrics,
            min_confidence,
        }
    }

    /// Generate a calibrated signal for (strategy, user, symbol).
    pub async fn generate(
        &self,
        strategy_id: &str,
        user_id: &str,
        symbol: &str,
    ) -> Result<BrainSignal> {
        let strategy = self
            .strategies
            .get(strategy_id)
            .await?
            .ok_or_else(|| anyhow!("Strategy not found: {}", strategy_id))?;
        let ruleset = Ruleset::parse(&strategy.ruleset);

        let price = self
            .router
            .price(symbol)
            .await
            .with_context(|| format!("price unavailable for {}", symbol))?;
        let current_price = price.price.to_f64().unwrap_or(0.0);

        let request = CandleRequest::live(symbol, ruleset.timeframe, SIGNAL_CANDLE_DEPTH);
        let candles = self.router.candles_or_empty(&request).await;
        if candles.len() < 2 {
            return Ok(self.hold_signal(
                strategy_id,
                symbol,
                "Insufficient candle history for signal generation".to_string(),
            ));
        }

        let extra_keys = RulesetEvaluator::required_keys(&ruleset);
        let indicators = IndicatorSet::compute_with(&candles, &extra_keys);
        let last_index = candles.len() - 1;

        if !RulesetEvaluator::evaluate_at(&ruleset.conditions, &indicators, last_index) {
            self.metrics.signals_total.with_label_values(&["hold"]).inc();
            return Ok(self.hold_signal(
                strategy_id,
                symbol,
                "Entry conditions not met".to_string(),
            ));
        }

        let side = ruleset.side;
        let entry = match ruleset.entry {
            PriceRef::Close => current_price,
            PriceRef::Open => candles[last_index].open_f64(),
            PriceRef::High => candles[last_index].high_f64(),
            PriceRef::Low => candles[last_index].low_f64(),
        };
        let atr = indicators.value_at("atr", last_index);
        let (stop_loss, take_profit) = RulesetEvaluator::exit_prices(&ruleset, entry, side, atr);
        let signal_strength =
            RulesetEvaluator::signal_strength(&ruleset.conditions, &indicators, last_index);

        // Enrichment factors run concurrently; each degrades independently.
        let (regime, trend, volume, risk_profile) = tokio::join!(
            self.regime.assess(symbol),
            self.trend.analyze(symbol),
            self.volume.confirm(symbol, ruleset.timeframe),
            self.user_risk.profile(user_id),
        );

        let quantity = self.nominal_quantity(user_id, entry).await;
        let proposed = ProposedTrade {
            symbol: symbol.to_string(),
            side,
            quantity,
            entry_price: entry,
            sector: None,
        };
        let portfolio = self.portfolio.evaluate(user_id, &proposed).await;

        let base = 0.7 * strategy.score + 0.3 * signal_strength;
        let regime_mult = regime_multiplier(regime.regime, side);
        let alignment_mult = 0.8 + 0.4 * trend.alignment_score;
        let volume_mult = match volume.recommendation {
            VolumeRecommendation::Confirm => 1.1,
            VolumeRecommendation::Caution => 0.95,
            VolumeRecommendation::Block => 0.75,
        };
        let risk_mult = risk_tendency_multiplier(&risk_profile, entry, stop_loss);
        let portfolio_mult = if portfolio.allowed {
            portfolio.adjustment
        } else {
            0.0
        };

        let confidence = (base
            * regime_mult
            * alignment_mult
            * volume_mult
            * risk_mult
            * portfolio_mult)
            .clamp(0.0, 1.0);

        debug!(
            "Signal calibration for {}: base {:.3} regime {:.2} align {:.2} volume {:.2} risk {:.2} portfolio {:.2} -> {:.3}",
            symbol, base, regime_mult, alignment_mult, volume_mult, risk_mult, portfolio_mult,
            confidence
        );

        let (ancestor_count, overfit_flag) = self.lineage_note(strategy_id).await;
        let summary = format!(
            "{} {} @ {:.2} (confidence {:.2})",
            side, symbol, entry, confidence
        );
        let explanation = ExplanationBuilder::new()
            .strategy_score(strategy.score, 0.7)
            .signal_strength(signal_strength, 0.3)
            .regime(&regime, regime_mult)
            .trend_alignment(&trend, alignment_mult)
            .volume(&volume, volume_mult)
            .risk_profile(&risk_profile, risk_mult)
            .portfolio(&portfolio)
            .lineage(ancestor_count, strategy.score, overfit_flag)
            .build(summary);

        let refusal = if !portfolio.allowed {
            Some(SignalRefusal::PortfolioRisk)
        } else if confidence < self.min_confidence {
            Some(SignalRefusal::LowConfidence)
        } else {
            None
        };

        let outcome_label = match refusal {
            Some(_) => "refused",
            None => match side {
                TradeSide::Buy => "buy",
                TradeSide::Sell => "sell",
            },
        };
        self.metrics
            .signals_total
            .with_label_values(&[outcome_label])
            .inc();

        let (side, reasoning) = match refusal {
            Some(SignalRefusal::PortfolioRisk) => {
                (SignalSide::Hold, format!("portfolio-risk: {}", portfolio.reason))
            }
            Some(SignalRefusal::LowConfidence) => (
                SignalSide::Hold,
                format!(
                    "low-confidence: {:.2} below minimum {:.2}",
                    confidence, self.min_confidence
                ),
            ),
            None => {
                info!(
                    "Brain signal: {} {} entry {:.2} stop {:?} target {:?} confidence {:.2}",
                    side, symbol, entry, stop_loss, take_profit, confidence
                );
                (
                    SignalSide::from(side),
                    format!("Ruleset conditions satisfied at {:.2}", entry),
                )
            }
        };

        Ok(BrainSignal {
            strategy_id: strategy_id.to_string(),
            symbol: symbol.to_string(),
            side,
            entry: Some(entry),
            stop_loss,
            take_profit,
            confidence,
            reasoning,
            refusal,
            regime,
            trend,
            volume,
            risk_profile,
            portfolio: Some(portfolio),
            explanation,
            timestamp: Utc::now(),
        })
    }

    fn hold_signal(&self, strategy_id: &str, symbol: &str, reasoning: String) -> BrainSignal {
        BrainSignal {
            strategy_id: strategy_id.to_string(),
            symbol: symbol.to_string(),
            side: SignalSide::Hold,
            entry: None,
            stop_loss: None,
            take_profit: None,
            confidence: 0.0,
            reasoning,
            refusal: None,
            regime: RegimeAssessment::fallback(),
            trend: TrendAnalysis::unavailable(),
            volume: VolumeConfirmation::unavailable(),
            risk_profile: RiskProfile::default_moderate(0),
            portfolio: None,
            explanation: Explanation::not_triggered(),
            timestamp: Utc::now(),
        }
    }

    async fn nominal_quantity(&self, user_id: &str, entry: f64) -> f64 {
        if entry <= 0.0 {
            return 0.0;
        }
        let balance = match self.accounts.get(user_id).await {
            Ok(Some(account)) => account.balance.to_f64().unwrap_or(0.0),
            _ => 0.0,
        };
        (balance * NOMINAL_POSITION_FRACTION / entry).max(0.0)
    }

    /// Ancestor count (walking parent edges with a cycle guard) and the
    /// overfit flag from the latest backtest.
    async fn lineage_note(&self, strategy_id: &str) -> (u32, bool) {
        let mut count = 0u32;
        let mut visited: HashSet<String> = HashSet::new();
        let mut cursor = strategy_id.to_string();

        while visited.insert(cursor.clone()) {
            match self.lineage.parents_of(&cursor).await {
                Ok(parents) if !parents.is_empty() => {
                    count += 1;
                    cursor = parents[0].parent_id.clone();
                }
                _ => break,
            }
        }

        let overfit = match self.backtests.latest_for(strategy_id).await {
            Ok(Some(report)) => report
                .overfit_ratio()
                .map(|r| r < OVERFIT_RATIO_FLOOR)
                .unwrap_or(false),
            _ => false,
        };

        (count, overfit)
    }
}

fn regime_multiplier(regime: Regime, side: TradeSide) -> f64 {
    match (regime, side) {
        (Regime::Momentum, TradeSide::Buy) => 1.1,
        (Regime::Momentum, TradeSide::Sell) => 0.9,
        (Regime::RiskOn, TradeSide::Buy) => 1.05,
        (Regime::RiskOn, TradeSide::Sell) => 0.95,
        (Regime::RiskOff, TradeSide::Buy) => 0.85,
        (Regime::RiskOff, TradeSide::Sell) => 1.05,
        (Regime::Volatility, _) => 0.9,
        (Regime::Neutral, _) => 1.0,
    }
}

/// Match the trade's risk footprint against the user's tendency.
fn risk_tendency_multiplier(profile: &RiskProfile, entry: f64, stop_loss: Option<f64>) -> f64 {
    let Some(stop) = stop_loss else {
        return 1.0;
    };
    if entry <= 0.0 {
        return 1.0;
    }
    let stop_distance = (entry - stop).abs() / entry;
    let risky = stop_distance > 0.05;

    match (profile.tendency, risky) {
        (RiskTendency::Conservative, true) => 0.85,
        (RiskTendency::Conservative, false) => 1.05,
        (RiskTendency::Aggressive, true) => 1.05,
        _ => 1.0,
    }
}
