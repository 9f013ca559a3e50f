//! Paper broker: ledger-only simulated orders against live prices.
//!
//! Balance bookkeeping: a BUY open debits the position cost, a SELL open
//! credits the short proceeds, and a close reverses the position at the
//! fill price, so `starting_balance + Σ realized_pnl` always equals
//! `balance + Σ open position cost` for long books.
//!
//! Operations on one user's account and trades are serialized behind a
//! per-user async lock; unrelated users interleave freely.

use anyhow::Result;
use chrono::Utc;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use tokio::sync::Mutex as AsyncMutex;
use tracing::{info, warn};
use uuid::Uuid;

use crate::application::billing::RoyaltyEngine;
use crate::domain::errors::TradingError;
use crate::domain::market::symbols;
use crate::domain::repositories::{PaperAccountRepository, TradeRepository};
use crate::domain::trading::{
    AssetType, Trade, TradeMode, TradeSide, TradeSource, TradeStatus,
};
use crate::infrastructure::market_data::ProviderRouter;
use rust_decimal::prelude::ToPrimitive;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderReceipt {
    pub order_id: String,
    pub trade_id: String,
    pub symbol: String,
    pub side: TradeSide,
    pub quantity: Decimal,
    pub price: Decimal,
    pub status: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CloseReceipt {
    pub order_id: String,
    pub trade_ids: Vec<String>,
    pub symbol: String,
    pub quantity: Decimal,
    pub exit_price: Decimal,
    pub realized_pnl: Decimal,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccountSummary {
    pub user_id: String,
    pub balance: Decimal,
    pub equity: Decimal,
    pub realized_pnl: Decimal,
    pub unrealized_pnl: Decimal,
}

pub struct PaperBroker {
    trades: Arc<dyn TradeRepository>,
    accounts: Arc<dyn PaperAccountRepository>,
    router: Arc<ProviderRouter>,
    royalties: Arc<RoyaltyEngine>,
    starting_balance: Decimal,
    user_locks: StdMutex<HashMap<String, Arc<AsyncMutex<()>>>>,
}

impl PaperBroker {
    pub fn new(
        trades: Arc<dyn TradeRepository>,
        accounts: Arc<dyn PaperAccountRepository>,
        router: Arc<ProviderRouter>,
        royalties: Arc<RoyaltyEngine>,
        starting_balance: Decimal,
    ) -> Self {
        Self {
            trades,
            accounts,
            router,
            royalties,
            starting_balance,
            user_locks: StdMutex::new(HashMap::new()),
        }
    }

    fn lock_for(&self, user_id: &str) -> Arc<AsyncMutex<()>> {
        let mut locks = self.user_locks.lock().expect("user lock map");
        locks
            .entry(user_id.to_string())
            .or_insert_with(|| Arc::new(AsyncMutex::new(())))
            .clone()
    }

    /// Place a simulated market order at the current live price.
    #[allow(clippy::too_many_arguments)]
    pub async fn place_market_order(
        &self,
        user_id: &str,
        symbol: &str,
        side: TradeSide,
        quantity: Decimal,
        asset_type: AssetType,
        source: TradeSource,
        strategy_id: Option<String>,
    ) -> Result<OrderReceipt> {
        if quantity <= Decimal::ZERO {
            return Err(TradingError::InvalidOrder {
                reason: "quantity must be positive".to_string(),
            }
            .into());
        }
        let symbol = symbols::normalize(symbol);

        let lock = self.lock_for(user_id);
        let _guard = lock.lock().await;

        let price = self
            .router
            .price(&symbol)
            .await
            .map_err(|e| TradingError::PriceUnavailable {
                symbol: symbol.clone(),
                reason: e.to_string(),
            })?;
        let entry_price = price.price;
        let order_cost = entry_price * quantity;

        let account = self
            .accounts
            .get_or_create(user_id, self.starting_balance)
            .await?;

        if side == TradeSide::Buy && order_cost > account.balance {
            return Err(TradingError::InsufficientFunds {
                need: order_cost,
                available: account.balance,
            }
            .into());
        }

        let trade = Trade {
            id: Uuid::new_v4().to_string(),
            user_id: user_id.to_string(),
            symbol: symbol.clone(),
            asset_type,
            side,
            quantity,
            entry_price,
            exit_price: None,
            status: TradeStatus::Open,
            mode: TradeMode::Paper,
            source,
            strategy_id,
            opened_at: Utc::now(),
            closed_at: None,
            realized_pnl: None,
        };
        self.trades.create(&trade).await?;

        let new_balance = match side {
            TradeSide::Buy => account.balance - order_cost,
            TradeSide::Sell => account.balance + order_cost,
        };
        self.accounts.update_balance(user_id, new_balance).await?;

        info!(
            "Paper {} {} x {} @ {} for {} (balance {})",
            side, symbol, quantity, entry_price, user_id, new_balance
        );

        Ok(OrderReceipt {
            order_id: Uuid::new_v4().to_string(),
            trade_id: trade.id,
            symbol,
            side,
            quantity,
            price: entry_price,
            status: "FILLED".to_string(),
        })
    }

    /// Close open paper positions for (user, symbol) at the current live
    /// price, oldest first.
    ///
    /// A partial quantity closes whole trades until the remainder is
    /// smaller than the next trade; that trade is closed in full at the
    /// fill and the unrequested remainder reopens as a new trade based at
    /// the same fill price, which keeps realized pnl and balance identical
    /// to a true partial fill.
    pub async fn close_position(
        &self,
        user_id: &str,
        symbol: &str,
        quantity: Option<Decimal>,
    ) -> Result<CloseReceipt> {
        let symbol = symbols::normalize(symbol);

        let lock = self.lock_for(user_id);
        let _guard = lock.lock().await;

        let open_trades: Vec<Trade> = self
            .trades
            .list_for_user(user_id, Some(TradeStatus::Open), Some(TradeMode::Paper))
            .await?
            .into_iter()
            .filter(|t| t.symbol == symbol)
            .collect();

        if open_trades.is_empty() {
            return Err(TradingError::NoOpenPosition {
                symbol: symbol.clone(),
            }
            .into());
        }

        let price = self
            .router
            .price(&symbol)
            .await
            .map_err(|e| TradingError::PriceUnavailable {
                symbol: symbol.clone(),
                reason: e.to_string(),
            })?;
        let exit_price = price.price;
        let now = Utc::now();

        let total_open: Decimal = open_trades.iter().map(|t| t.quantity).sum();
        let mut remaining = quantity.unwrap_or(total_open).min(total_open);
        if remaining <= Decimal::ZERO {
            return Err(TradingError::InvalidOrder {
                reason: "close quantity must be positive".to_string(),
            }
            .into());
        }
        let requested = remaining;

        let account = self
            .accounts
            .get_or_create(user_id, self.starting_balance)
            .await?;
        let mut balance = account.balance;
        let mut closed_ids = Vec::new();
        let mut realized_total = Decimal::ZERO;

        for trade in &open_trades {
            if remaining <= Decimal::ZERO {
                break;
            }

            let pnl = trade.pnl_at(exit_price);
            self.trades.close(&trade.id, exit_price, now, pnl).await?;
            closed_ids.push(trade.id.clone());
            realized_total += pnl;

            // Reverse the position at the fill price.
            let close_value = exit_price * trade.quantity;
            balance = match trade.side {
                TradeSide::Buy => balance + close_value,
                TradeSide::Sell => balance - close_value,
            };

            if remaining < trade.quantity {
                // Partial close: reopen the remainder re-based at the fill.
                let leftover = trade.quantity - remaining;
                let reopened = Trade {
                    id: Uuid::new_v4().to_string(),
                    user_id: trade.user_id.clone(),
                    symbol: trade.symbol.clone(),
                    asset_type: trade.asset_type,
                    side: trade.side,
                    quantity: leftover,
                    entry_price: exit_price,
                    exit_price: None,
                    status: TradeStatus::Open,
                    mode: TradeMode::Paper,
                    source: trade.source,
                    strategy_id: trade.strategy_id.clone(),
                    opened_at: now,
                    closed_at: None,
                    realized_pnl: None,
                };
                self.trades.create(&reopened).await?;
                let reopen_cost = exit_price * leftover;
                balance = match trade.side {
                    TradeSide::Buy => balance - reopen_cost,
                    TradeSide::Sell => balance + reopen_cost,
                };
                remaining = Decimal::ZERO;
            } else {
                remaining -= trade.quantity;
            }
        }

        self.accounts.update_balance(user_id, balance).await?;

        // Royalties accrue per closed trade, strictly after the books are
        // settled; a ledger failure must not unwind the close.
        for trade_id in &closed_ids {
            if let Ok(Some(closed)) = self.trades.get(trade_id).await {
                if let Err(e) = self.royalties.record_for_trade(&closed).await {
                    warn!("Royalty recording failed for trade {}: {}", trade_id, e);
                }
            }
        }

        info!(
            "Paper close {} x {} @ {} for {} (pnl {}, balance {})",
            symbol, requested, exit_price, user_id, realized_total, balance
        );

        Ok(CloseReceipt {
            order_id: Uuid::new_v4().to_string(),
            trade_ids: closed_ids,
            symbol,
            quantity: requested,
            exit_price,
            realized_pnl: realized_total,
        })
    }

    /// Balance, equity and pnl snapshot for one account.
    pub async fn account_summary(&self, user_id: &str) -> Result<AccountSummary> {
        let account = self
            .accounts
            .get_or_create(user_id, self.starting_balance)
            .await?;

        let trades = self
            .trades
            .list_for_user(user_id, None, Some(TradeMode::Paper))
            .await?;

        let realized_pnl: Decimal = trades
            .iter()
            .filter_map(|t| t.realized_pnl)
            .sum();

        let mut unrealized_pnl = Decimal::ZERO;
        for trade in trades.iter().filter(|t| t.is_open()) {
            match self.router.price(&trade.symbol).await {
                Ok(snapshot) => unrealized_pnl += trade.pnl_at(snapshot.price),
                Err(e) => warn!(
                    "Skipping unrealized pnl for {}: {}",
                    trade.symbol, e
                ),
            }
        }

        Ok(AccountSummary {
            user_id: user_id.to_string(),
            balance: account.balance,
            equity: account.balance + unrealized_pnl,
            realized_pnl,
            unrealized_pnl,
        })
    }

    pub fn starting_balance(&self) -> Decimal {
        self.starting_balance
    }

    /// Open positions grouped per symbol with average entry.
    pub async fn positions(&self, user_id: &str) -> Result<Vec<PositionSummary>> {
        let open = self
            .trades
            .list_for_user(user_id, Some(TradeStatus::Open), Some(TradeMode::Paper))
            .await?;

        let mut by_symbol: HashMap<String, Vec<&Trade>> = HashMap::new();
        for trade in &open {
            by_symbol.entry(trade.symbol.clone()).or_default().push(trade);
        }

        let mut positions = Vec::with_capacity(by_symbol.len());
        for (symbol, trades) in by_symbol {
            let net_quantity: Decimal = trades
                .iter()
                .map(|t| match t.side {
                    TradeSide::Buy => t.quantity,
                    TradeSide::Sell => -t.quantity,
                })
                .sum();
            if net_quantity == Decimal::ZERO {
                continue;
            }
            let total_quantity: Decimal = trades.iter().map(|t| t.quantity).sum();
            let total_cost: Decimal = trades.iter().map(|t| t.entry_cost()).sum();
            let avg_entry = if total_quantity > Decimal::ZERO {
                total_cost / total_quantity
            } else {
                Decimal::ZERO
            };

            let current_price = match self.router.price(&symbol).await {
                Ok(snapshot) => snapshot.price,
                Err(_) => avg_entry,
            };
            let direction = if net_quantity > Decimal::ZERO {
                TradeSide::Buy
            } else {
                TradeSide::Sell
            };
            let unrealized = match direction {
                TradeSide::Buy => (current_price - avg_entry) * net_quantity,
                TradeSide::Sell => (avg_entry - current_price) * net_quantity.abs(),
            };

            positions.push(PositionSummary {
                symbol,
                quantity: net_quantity.abs(),
                side: direction,
                avg_entry_price: avg_entry,
                current_price,
                unrealized_pnl: unrealized,
            });
        }

        positions.sort_by(|a, b| a.symbol.cmp(&b.symbol));
        Ok(positions)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PositionSummary {
    pub symbol: String,
    pub quantity: Decimal,
    pub side: TradeSide,
    pub avg_entry_price: Decimal,
    pub current_price: Decimal,
    pub unrealized_pnl: Decimal,
}

// Conversion helper for risk checks that want f64 capital.
pub fn balance_f64(summary: &AccountSummary) -> f64 {
    summary.balance.to_f64().unwrap_or(0.0)
}
