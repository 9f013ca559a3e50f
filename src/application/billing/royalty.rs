//! Royalty attribution engine.
//!
//! On every profitable, strategy-attributed trade close: walk the lineage
//! back to the original ancestor, measure structural similarity and
//! mutation distance, look up the rate, take the platform fee from the
//! creator's plan (admin settings are the source of truth for defaults),
//! and write one ledger row in integer cents.

use anyhow::{Context, Result};
use chrono::Utc;
use rust_decimal::Decimal;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, info};
use uuid::Uuid;

use crate::application::strategy_engine::mutation::MutationEngine;
use crate::domain::billing::{RoyaltyBreakdown, RoyaltyEntry, to_cents};
use crate::domain::repositories::{
    LineageRepository, PlanRepository, RoyaltyRepository, SettingsRepository, StrategyRepository,
    UserRepository,
};
use crate::domain::strategy::ruleset::Ruleset;
use crate::domain::trading::Trade;
use crate::infrastructure::observability::Metrics;

/// Hard ceiling on lineage walks; real chains are a handful of steps.
const MAX_LINEAGE_DEPTH: usize = 64;

pub struct RoyaltyEngine {
    strategies: Arc<dyn StrategyRepository>,
    lineage: Arc<dyn LineageRepository>,
    users: Arc<dyn UserRepository>,
    plans: Arc<dyn PlanRepository>,
    settings: Arc<dyn SettingsRepository>,
    ledger: Arc<dyn RoyaltyRepository>,
    metrics: Metrics,
}

impl RoyaltyEngine {
    pub fn new(
        strategies: Arc<dyn StrategyRepository>,
        lineage: Arc<dyn LineageRepository>,
        users: Arc<dyn UserRepository>,
        plans: Arc<dyn PlanRepository>,
        settings: Arc<dyn SettingsRepository>,
        ledger: Arc<dyn RoyaltyRepository>,
        metrics: Metrics,
    ) -> Self {
        Self {
            strategies,
            lineage,
            users,
            plans,
            settings,
            ledger,
            metrics,
        }
    }

    /// Compute and persist the royalty for a closed trade. Returns the
    /// ledger row, or `None` when the trade earns no royalty (no profit,
    /// no strategy, or a zero-rate tier).
    pub async fn record_for_trade(&self, trade: &Trade) -> Result<Option<RoyaltyEntry>> {
        let Some(breakdown) = self.calculate(trade).await? else {
            return Ok(None);
        };
        if breakdown.royalty_rate <= 0.0 || breakdown.royalty_cents == 0 {
            debug!(
                "Trade {} earns no royalty (similarity {:.2}, {} mutations)",
                trade.id, breakdown.similarity, breakdown.mutation_count
            );
            return Ok(None);
        }

        let entry = RoyaltyEntry {
            id: Uuid::new_v4().to_string(),
            user_id: breakdown.creator_id.clone(),
            strategy_id: breakdown.strategy_id.clone(),
            trade_id: trade.id.clone(),
            royalty_cents: breakdown.royalty_cents,
            royalty_rate: breakdown.royalty_rate,
            platform_fee_cents: breakdown.platform_fee_cents,
            platform_fee_rate: breakdown.platform_fee_rate,
            net_cents: breakdown.net_cents,
            trade_profit_cents: breakdown.trade_profit_cents,
            paid_at: None,
            payment_id: None,
            created_at: Utc::now(),
        };
        self.ledger.insert(&entry).await.context("ledger write")?;

        let tier = format!("{:.1}%", breakdown.royalty_rate * 100.0);
        self.metrics
            .royalty_entries_total
            .with_label_values(&[&tier])
            .inc();
        info!(
            "Royalty recorded: trade {} -> creator {} ({} cents net)",
            trade.id, entry.user_id, entry.net_cents
        );
        Ok(Some(entry))
    }

    /// The attribution math without the ledger write.
    pub async fn calculate(&self, trade: &Trade) -> Result<Option<RoyaltyBreakdown>> {
        let Some(profit) = trade.realized_pnl.filter(|p| *p > Decimal::ZERO) else {
            return Ok(None);
        };
        let Some(strategy_id) = &trade.strategy_id else {
            return Ok(None);
        };
        let Some(strategy) = self.strategies.get(strategy_id).await? else {
            return Ok(None);
        };
        let Some(creator) = self.users.get(&strategy.owner_id).await? else {
            return Ok(None);
        };

        let (original_id, mutation_count) = self.find_original(strategy_id).await?;
        let similarity = if original_id == *strategy_id {
            1.0
        } else {
            match self.strategies.get(&original_id).await? {
                Some(original) => MutationEngine::similarity(
                    &Ruleset::parse(&original.ruleset),
                    &Ruleset::parse(&strategy.ruleset),
                ),
                None => 0.0,
            }
        };

        let royalty_rate = royalty_rate_for(similarity, mutation_count);

        // Platform fee: the creator's plan wins, otherwise admin settings
        // decide (creator override vs the general default).
        let settings = self.settings.get().await?;
        let plan_fee = match &creator.current_plan_id {
            Some(plan_id) => self
                .plans
                .get(plan_id)
                .await?
                .and_then(|plan| plan.platform_fee_percent),
            None => None,
        };
        let platform_fee_rate = match plan_fee {
            Some(percent) => percent / 100.0,
            None if creator.is_creator() => settings.creator_fee_percent / 100.0,
            None => settings.platform_fee_percent / 100.0,
        };

        let trade_profit_cents = to_cents(profit);
        let royalty_cents = to_cents(profit * Decimal::from_f64_retain(royalty_rate).unwrap_or_default());
        let platform_fee_cents = ((royalty_cents as f64) * platform_fee_rate).round() as i64;
        let net_cents = royalty_cents - platform_fee_cents;

        Ok(Some(RoyaltyBreakdown {
            creator_id: creator.id,
            strategy_id: strategy_id.clone(),
            original_strategy_id: original_id,
            similarity,
            mutation_count,
            royalty_rate,
            platform_fee_rate,
            trade_profit_cents,
            royalty_cents,
            platform_fee_cents,
            net_cents,
        }))
    }

    /// Walk parent edges back to the original ancestor, counting steps.
    /// A visited set guards against accidental cycles in the DAG.
    async fn find_original(&self, strategy_id: &str) -> Result<(String, u32)> {
        let mut cursor = strategy_id.to_string();
        let mut steps = 0u32;
        let mut visited: HashSet<String> = HashSet::new();

        while visited.insert(cursor.clone()) && (steps as usize) < MAX_LINEAGE_DEPTH {
            let parents = self.lineage.parents_of(&cursor).await?;
            let Some(first) = parents.first() else {
                break;
            };
            cursor = first.parent_id.clone();
            steps += 1;
        }

        Ok((cursor, steps))
    }
}

/// Rate table on (structural similarity to the original, mutation steps).
pub fn royalty_rate_for(similarity: f64, mutation_count: u32) -> f64 {
    if mutation_count > 3 || similarity < 0.40 {
        0.0
    } else if mutation_count == 3 || similarity < 0.50 {
        0.015
    } else if similarity > 0.70 {
        0.05
    } else {
        // similarity in [0.50, 0.70] with fewer than 3 mutations.
        0.03
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rate_table() {
        // Original strategy traded by someone else: full rate.
        assert_eq!(royalty_rate_for(1.0, 0), 0.05);
        assert_eq!(royalty_rate_for(0.75, 2), 0.05);

        // Mid tier.
        assert_eq!(royalty_rate_for(0.55, 2), 0.03);
        assert_eq!(royalty_rate_for(0.70, 1), 0.03);

        // Low tier.
        assert_eq!(royalty_rate_for(0.45, 1), 0.015);
        assert_eq!(royalty_rate_for(0.90, 3), 0.015);

        // No royalty.
        assert_eq!(royalty_rate_for(0.30, 0), 0.0);
        assert_eq!(royalty_rate_for(0.90, 4), 0.0);
    }
}
