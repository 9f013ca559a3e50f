//! Paper broker lifecycle against real repositories and a scripted
//! price source: open, close, partial close, and balance conservation.

mod common;

use common::{ScriptedProvider, downtrend_frame, router_over};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::sync::Arc;

use tradebrain::application::billing::RoyaltyEngine;
use tradebrain::application::broker::PaperBroker;
use tradebrain::domain::repositories::{
    PaperAccountRepository, TradeRepository,
};
use tradebrain::domain::trading::{
    AssetType, TradeMode, TradeSide, TradeSource, TradeStatus,
};
use tradebrain::infrastructure::market_data::cache::CacheKind;
use tradebrain::infrastructure::observability::Metrics;
use tradebrain::infrastructure::persistence::Database;
use tradebrain::infrastructure::persistence::repositories::{
    SqliteLineageRepository, SqlitePaperAccountRepository, SqlitePlanRepository,
    SqliteRoyaltyRepository, SqliteSettingsRepository, SqliteStrategyRepository,
    SqliteTradeRepository, SqliteUserRepository,
};

struct Fixture {
    broker: PaperBroker,
    trades: Arc<dyn TradeRepository>,
    accounts: Arc<dyn PaperAccountRepository>,
    provider: Arc<ScriptedProvider>,
    router: Arc<tradebrain::infrastructure::market_data::ProviderRouter>,
    _cache_dir: tempfile::TempDir,
}

async fn fixture() -> Fixture {
    let db = Database::new_in_memory().await.unwrap();
    let pool = db.pool.clone();

    let trades: Arc<dyn TradeRepository> = Arc::new(SqliteTradeRepository::new(pool.clone()));
    let accounts: Arc<dyn PaperAccountRepository> =
        Arc::new(SqlitePaperAccountRepository::new(pool.clone()));

    let provider = Arc::new(ScriptedProvider::new(dec!(100), downtrend_frame(50)));
    let (router, cache_dir) = router_over(provider.clone());

    let metrics = Metrics::new().unwrap();
    let royalties = Arc::new(RoyaltyEngine::new(
        Arc::new(SqliteStrategyRepository::new(pool.clone())),
        Arc::new(SqliteLineageRepository::new(pool.clone())),
        Arc::new(SqliteUserRepository::new(pool.clone())),
        Arc::new(SqlitePlanRepository::new(pool.clone())),
        Arc::new(SqliteSettingsRepository::new(pool.clone())),
        Arc::new(SqliteRoyaltyRepository::new(pool)),
        metrics,
    ));

    let broker = PaperBroker::new(
        trades.clone(),
        accounts.clone(),
        router.clone(),
        royalties,
        dec!(100000),
    );

    Fixture {
        broker,
        trades,
        accounts,
        provider,
        router,
        _cache_dir: cache_dir,
    }
}

impl Fixture {
    /// Move the live price and drop the cached quote so the next call
    /// sees it.
    fn reprice(&self, price: Decimal, symbol: &str) {
        self.provider.set_price(price);
        self.router.queue().cache().invalidate(Some(CacheKind::Price), Some(symbol));
    }
}

#[tokio::test]
async fn buy_open_debits_and_close_credits_with_pnl() {
    let fx = fixture().await;

    let receipt = fx
        .broker
        .place_market_order(
            "u1",
            "AAPL",
            TradeSide::Buy,
            dec!(10),
            AssetType::Stock,
            TradeSource::Manual,
            None,
        )
        .await
        .unwrap();
    assert_eq!(receipt.price, dec!(100));

    let account = fx.accounts.get("u1").await.unwrap().unwrap();
    assert_eq!(account.balance, dec!(99000));

    fx.reprice(dec!(110), "AAPL");
    let close = fx.broker.close_position("u1", "AAPL", None).await.unwrap();
    assert_eq!(close.exit_price, dec!(110));
    assert_eq!(close.realized_pnl, dec!(100));

    // starting + realized pnl = balance once everything is closed.
    let account = fx.accounts.get("u1").await.unwrap().unwrap();
    assert_eq!(account.balance, dec!(100100));

    let closed = fx
        .trades
        .list_for_user("u1", Some(TradeStatus::Closed), Some(TradeMode::Paper))
        .await
        .unwrap();
    assert_eq!(closed.len(), 1);
    assert!(closed[0].exit_price.is_some());
    assert!(closed[0].closed_at.is_some());
    assert_eq!(closed[0].realized_pnl, Some(dec!(100)));
}

#[tokio::test]
async fn short_sale_credits_proceeds_and_profits_on_decline() {
    let fx = fixture().await;

    fx.broker
        .place_market_order(
            "u1",
            "TSLA",
            TradeSide::Sell,
            dec!(5),
            AssetType::Stock,
            TradeSource::Manual,
            None,
        )
        .await
        .unwrap();

    // Short proceeds are credited on open.
    let account = fx.accounts.get("u1").await.unwrap().unwrap();
    assert_eq!(account.balance, dec!(100500));

    fx.reprice(dec!(80), "TSLA");
    let close = fx.broker.close_position("u1", "TSLA", None).await.unwrap();
    assert_eq!(close.realized_pnl, dec!(100)); // (100 - 80) * 5

    let account = fx.accounts.get("u1").await.unwrap().unwrap();
    assert_eq!(account.balance, dec!(100100));
}

#[tokio::test]
async fn insufficient_balance_rejects_buy() {
    let fx = fixture().await;
    let result = fx
        .broker
        .place_market_order(
            "u1",
            "AAPL",
            TradeSide::Buy,
            dec!(2000), // 200k notional against a 100k account
            AssetType::Stock,
            TradeSource::Manual,
            None,
        )
        .await;
    assert!(result.is_err());

    // Account untouched.
    let account = fx.accounts.get("u1").await.unwrap().unwrap();
    assert_eq!(account.balance, dec!(100000));
}

#[tokio::test]
async fn partial_close_is_deterministic_and_conserves_balance() {
    let fx = fixture().await;

    fx.broker
        .place_market_order(
            "u1",
            "AAPL",
            TradeSide::Buy,
            dec!(10),
            AssetType::Stock,
            TradeSource::Manual,
            None,
        )
        .await
        .unwrap();

    fx.reprice(dec!(110), "AAPL");
    let close = fx
        .broker
        .close_position("u1", "AAPL", Some(dec!(4)))
        .await
        .unwrap();

    // The original trade closes in full; the remainder reopens re-based
    // at the fill price.
    assert_eq!(close.quantity, dec!(4));
    assert_eq!(close.realized_pnl, dec!(100));

    let open = fx
        .trades
        .list_for_user("u1", Some(TradeStatus::Open), Some(TradeMode::Paper))
        .await
        .unwrap();
    assert_eq!(open.len(), 1);
    assert_eq!(open[0].quantity, dec!(6));
    assert_eq!(open[0].entry_price, dec!(110));

    // Conservation: starting + realized = balance + open cost.
    let account = fx.accounts.get("u1").await.unwrap().unwrap();
    let open_cost: Decimal = open.iter().map(|t| t.entry_cost()).sum();
    let realized: Decimal = fx
        .trades
        .list_for_user("u1", Some(TradeStatus::Closed), Some(TradeMode::Paper))
        .await
        .unwrap()
        .iter()
        .filter_map(|t| t.realized_pnl)
        .sum();
    assert_eq!(dec!(100000) + realized, account.balance + open_cost);

    // Closing the remainder at the same price realizes nothing further.
    let second = fx.broker.close_position("u1", "AAPL", None).await.unwrap();
    assert_eq!(second.realized_pnl, dec!(0));
    let account = fx.accounts.get("u1").await.unwrap().unwrap();
    assert_eq!(account.balance, dec!(100100));
}

#[tokio::test]
async fn close_without_position_errors() {
    let fx = fixture().await;
    assert!(fx.broker.close_position("u1", "NVDA", None).await.is_err());
}

#[tokio::test]
async fn account_summary_tracks_equity() {
    let fx = fixture().await;

    fx.broker
        .place_market_order(
            "u1",
            "AAPL",
            TradeSide::Buy,
            dec!(10),
            AssetType::Stock,
            TradeSource::Manual,
            None,
        )
        .await
        .unwrap();

    fx.reprice(dec!(105), "AAPL");
    let summary = fx.broker.account_summary("u1").await.unwrap();
    assert_eq!(summary.balance, dec!(99000));
    assert_eq!(summary.unrealized_pnl, dec!(50));
    assert_eq!(summary.equity, dec!(99050));
}
