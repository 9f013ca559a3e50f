//! Portfolio-level admission control.
//!
//! Per-symbol exposure, per-sector exposure, correlated-position count and
//! leverage are computed against the user's open positions. Crossing 80%
//! of a limit shrinks the confidence multiplier; crossing 100% denies the
//! trade outright.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::warn;

use crate::domain::repositories::{PaperAccountRepository, TradeRepository};
use crate::domain::trading::{Trade, TradeSide, TradeStatus};
use crate::infrastructure::market_data::ProviderRouter;
use rust_decimal::prelude::ToPrimitive;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProposedTrade {
    pub symbol: String,
    pub side: TradeSide,
    pub quantity: f64,
    pub entry_price: f64,
    pub sector: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RiskFactorBreakdown {
    pub symbol_exposure: f64,
    pub sector_exposure: f64,
    pub correlation_risk: f64,
    pub leverage: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PortfolioRiskVerdict {
    pub allowed: bool,
    pub reason: String,
    /// Confidence multiplier in [0, 1]; 1.0 means unconstrained.
    pub adjustment: f64,
    pub factors: RiskFactorBreakdown,
}

impl PortfolioRiskVerdict {
    fn denied(reason: String, factors: RiskFactorBreakdown) -> Self {
        Self {
            allowed: false,
            reason,
            adjustment: 0.0,
            factors,
        }
    }
}

pub struct PortfolioRiskManager {
    trades: Arc<dyn TradeRepository>,
    accounts: Arc<dyn PaperAccountRepository>,
    router: Arc<ProviderRouter>,
    max_symbol_exposure: f64,
    max_sector_exposure: f64,
    max_correlated_positions: usize,
    max_leverage: f64,
}

impl PortfolioRiskManager {
    pub fn new(
        trades: Arc<dyn TradeRepository>,
        accounts: Arc<dyn PaperAccountRepository>,
        router: Arc<ProviderRouter>,
    ) -> Self {
        Self {
            trades,
            accounts,
            router,
            max_symbol_exposure: 0.20,
            max_sector_exposure: 0.40,
            max_correlated_positions: 5,
            max_leverage: 1.0,
        }
    }

    pub async fn evaluate(&self, user_id: &str, proposed: &ProposedTrade) -> PortfolioRiskVerdict {
        let capital = match self.accounts.get(user_id).await {
            Ok(Some(account)) => account.balance.to_f64().unwrap_or(0.0),
            _ => 0.0,
        };
        if capital <= 0.0 {
            return PortfolioRiskVerdict::denied(
                "Insufficient capital".to_string(),
                RiskFactorBreakdown::default(),
            );
        }

        let open_trades = match self
            .trades
            .list_for_user(user_id, Some(TradeStatus::Open), None)
            .await
        {
            Ok(trades) => trades,
            Err(e) => {
                warn!("Portfolio lookup failed for {}: {}", user_id, e);
                return PortfolioRiskVerdict::denied(
                    "Portfolio unavailable".to_string(),
                    RiskFactorBreakdown::default(),
                );
            }
        };

        let sector = match &proposed.sector {
            Some(sector) => Some(sector.clone()),
            None => self.lookup_sector(&proposed.symbol).await,
        };

        let mut position_sectors = Vec::with_capacity(open_trades.len());
        for trade in &open_trades {
            position_sectors.push(self.lookup_sector(&trade.symbol).await);
        }

        let factors = compute_factors(
            &open_trades,
            &position_sectors,
            proposed,
            sector.as_deref(),
            capital,
        );

        let mut allowed = true;
        let mut adjustment = 1.0f64;
        let mut reasons: Vec<String> = Vec::new();

        check_limit(
            factors.symbol_exposure,
            self.max_symbol_exposure,
            &format!("Symbol exposure for {}", proposed.symbol),
            &mut allowed,
            &mut adjustment,
            &mut reasons,
            0.8,
        );
        check_limit(
            factors.sector_exposure,
            self.max_sector_exposure,
            &format!("Sector exposure ({})", sector.as_deref().unwrap_or("unknown")),
            &mut allowed,
            &mut adjustment,
            &mut reasons,
            0.8,
        );
        check_limit(
            factors.correlation_risk,
            1.0,
            "Correlated positions",
            &mut allowed,
            &mut adjustment,
            &mut reasons,
            0.7,
        );
        if factors.leverage > self.max_leverage {
            allowed = false;
            reasons.push(format!(
                "Leverage {:.2} exceeds limit {:.2}",
                factors.leverage, self.max_leverage
            ));
        }

        PortfolioRiskVerdict {
            allowed,
            reason: if reasons.is_empty() {
                "No risk constraints violated".to_string()
            } else {
                reasons.join("; ")
            },
            adjustment: if allowed { adjustment.clamp(0.0, 1.0) } else { 0.0 },
            factors,
        }
    }

    async fn lookup_sector(&self, symbol: &str) -> Option<String> {
        match self.router.asset_details(symbol).await {
            Ok(Some(details)) => details.sector,
            _ => None,
        }
    }

    /// Correlated-position normalization ceiling, exposed for the brain's
    /// explanation surface.
    pub fn max_correlated_positions(&self) -> usize {
        self.max_correlated_positions
    }
}

fn check_limit(
    value: f64,
    limit: f64,
    label: &str,
    allowed: &mut bool,
    adjustment: &mut f64,
    reasons: &mut Vec<String>,
    soft_multiplier: f64,
) {
    if value > limit {
        *allowed = false;
        reasons.push(format!(
            "{} ({:.1}%) exceeds limit ({:.1}%)",
            label,
            value * 100.0,
            limit * 100.0
        ));
    } else if value > limit * 0.8 {
        *adjustment *= soft_multiplier;
        reasons.push(format!(
            "{} ({:.1}%) approaching limit",
            label,
            value * 100.0
        ));
    }
}

fn compute_factors(
    open_trades: &[Trade],
    position_sectors: &[Option<String>],
    proposed: &ProposedTrade,
    proposed_sector: Option<&str>,
    capital: f64,
) -> RiskFactorBreakdown {
    let proposed_value = proposed.quantity * proposed.entry_price;

    let position_value = |trade: &Trade| -> f64 {
        trade.entry_cost().to_f64().unwrap_or(0.0)
    };

    let current_symbol: f64 = open_trades
        .iter()
        .filter(|t| t.symbol == proposed.symbol)
        .map(position_value)
        .sum();
    let symbol_exposure = apply_side(
        current_symbol,
        proposed_value,
        proposed.side,
    ) / capital;

    let current_sector: f64 = open_trades
        .iter()
        .zip(position_sectors)
        .filter(|(_, sector)| {
            matches!((sector, proposed_sector), (Some(s), Some(p)) if s == p)
        })
        .map(|(t, _)| position_value(t))
        .sum();
    let sector_exposure = if proposed_sector.is_some() {
        apply_side(current_sector, proposed_value, proposed.side) / capital
    } else {
        0.0
    };

    let same_sector_count = open_trades
        .iter()
        .zip(position_sectors)
        .filter(|(t, sector)| {
            t.side == proposed.side
                && matches!((sector, proposed_sector), (Some(s), Some(p)) if s == p)
        })
        .count();
    let correlation_risk = (same_sector_count as f64 / 5.0).min(1.0);

    let total_exposure: f64 = open_trades.iter().map(position_value).sum();
    let leverage = apply_side(total_exposure, proposed_value, proposed.side) / capital;

    RiskFactorBreakdown {
        symbol_exposure,
        sector_exposure,
        correlation_risk,
        leverage,
    }
}

fn apply_side(current: f64, proposed: f64, side: TradeSide) -> f64 {
    match side {
        TradeSide::Buy => current + proposed,
        TradeSide::Sell => (current - proposed).max(0.0),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use rust_decimal_macros::dec;

    use crate::domain::trading::{AssetType, TradeMode, TradeSource};

    fn open_trade(symbol: &str, qty: i64, price: i64) -> Trade {
        Trade {
            id: uuid::Uuid::new_v4().to_string(),
            user_id: "u1".to_string(),
            symbol: symbol.to_string(),
            asset_type: AssetType::Stock,
            side: TradeSide::Buy,
            quantity: dec!(1) * rust_decimal::Decimal::from(qty),
            entry_price: rust_decimal::Decimal::from(price),
            exit_price: None,
            status: TradeStatus::Open,
            mode: TradeMode::Paper,
            source: TradeSource::Manual,
            strategy_id: None,
            opened_at: Utc::now(),
            closed_at: None,
            realized_pnl: None,
        }
    }

    fn proposed(symbol: &str, qty: f64, price: f64) -> ProposedTrade {
        ProposedTrade {
            symbol: symbol.to_string(),
            side: TradeSide::Buy,
            quantity: qty,
            entry_price: price,
            sector: Some("tech".to_string()),
        }
    }

    #[test]
    fn test_symbol_exposure_includes_proposed_value() {
        // Existing AAPL worth 15k, proposing 10k more on 100k capital: 25%.
        let open = vec![open_trade("AAPL", 100, 150)];
        let sectors = vec![Some("tech".to_string())];
        let factors = compute_factors(
            &open,
            &sectors,
            &proposed("AAPL", 100.0, 100.0),
            Some("tech"),
            100_000.0,
        );
        assert!((factors.symbol_exposure - 0.25).abs() < 1e-9);
        assert!((factors.leverage - 0.25).abs() < 1e-9);
    }

    #[test]
    fn test_sell_reduces_exposure() {
        let open = vec![open_trade("AAPL", 100, 150)];
        let sectors = vec![Some("tech".to_string())];
        let mut p = proposed("AAPL", 50.0, 100.0);
        p.side = TradeSide::Sell;
        let factors = compute_factors(&open, &sectors, &p, Some("tech"), 100_000.0);
        assert!((factors.symbol_exposure - 0.10).abs() < 1e-9);
    }

    #[test]
    fn test_correlation_counts_same_sector_same_side() {
        let open = vec![
            open_trade("AAPL", 10, 100),
            open_trade("MSFT", 10, 100),
            open_trade("NVDA", 10, 100),
        ];
        let sectors = vec![
            Some("tech".to_string()),
            Some("tech".to_string()),
            Some("energy".to_string()),
        ];
        let factors = compute_factors(
            &open,
            &sectors,
            &proposed("GOOG", 10.0, 100.0),
            Some("tech"),
            100_000.0,
        );
        assert!((factors.correlation_risk - 0.4).abs() < 1e-9);
    }
}
