//! Application assembly: build every long-lived service once, in
//! dependency order, and shut them down in reverse.
//!
//! The edge layer (HTTP, auth, websocket framing, payment processor
//! webhooks) holds an `App` and calls into these services; nothing here
//! knows about wire formats.

use anyhow::{Context, Result};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{info, warn};

use crate::application::billing::{BillingCycle, RoyaltyEngine};
use crate::application::brain::assembler::SignalAssembler;
use crate::application::brain::context::MarketContextService;
use crate::application::brain::multi_timeframe::MultiTimeframeAnalyzer;
use crate::application::brain::portfolio_risk::PortfolioRiskManager;
use crate::application::brain::recommend::RecommendationService;
use crate::application::brain::regime::RegimeDetector;
use crate::application::brain::user_risk::UserRiskProfiler;
use crate::application::brain::volume::VolumeAnalyzer;
use crate::application::broker::PaperBroker;
use crate::application::evolution::{EvolutionThresholds, EvolutionWorker};
use crate::application::groups::GroupService;
use crate::application::streaming::MarketStreamManager;
use crate::config::Config;
use crate::domain::ports::{
    ChargeReceipt, MarketDataProvider, MessageCipher, PaymentGateway, PlainCipher,
};
use crate::domain::repositories::{
    BacktestRepository, GroupRepository, LineageRepository, PaperAccountRepository,
    PlanRepository, RoyaltyRepository, SettingsRepository, StrategyRepository, TradeRepository,
    UserRepository,
};
use crate::infrastructure::market_data::adapters::{
    AlpacaAdapter, TwelveDataAdapter, YahooAdapter,
};
use crate::infrastructure::market_data::{MarketDataCache, ProviderRouter, RequestQueue};
use crate::infrastructure::market_data::sentiment::SentimentService;
use crate::infrastructure::mcn::MemoryClusterStore;
use crate::infrastructure::observability::Metrics;
use crate::infrastructure::persistence::Database;
use crate::infrastructure::persistence::repositories::{
    SqliteBacktestRepository, SqliteGroupRepository, SqliteLineageRepository,
    SqlitePaperAccountRepository, SqlitePlanRepository, SqliteRoyaltyRepository,
    SqliteSettingsRepository, SqliteStrategyRepository, SqliteTradeRepository,
    SqliteUserRepository,
};

/// Gateway placeholder used until the deployment wires its processor
/// adapter; every charge attempt fails loudly instead of silently
/// settling dues.
struct UnconfiguredGateway;

#[async_trait]
impl PaymentGateway for UnconfiguredGateway {
    async fn charge_royalties(
        &self,
        user_id: &str,
        _user_email: &str,
        amount_cents: i64,
        _description: &str,
    ) -> Result<ChargeReceipt> {
        anyhow::bail!(
            "no payment gateway configured (attempted to charge {} cents to {})",
            amount_cents,
            user_id
        )
    }
}

pub struct App {
    pub config: Config,
    pub database: Database,
    pub metrics: Metrics,
    pub router: Arc<ProviderRouter>,
    pub memory: Arc<MemoryClusterStore>,
    pub users: Arc<dyn UserRepository>,
    pub plans: Arc<dyn PlanRepository>,
    pub settings: Arc<dyn SettingsRepository>,
    pub strategies: Arc<dyn StrategyRepository>,
    pub lineage: Arc<dyn LineageRepository>,
    pub backtests: Arc<dyn BacktestRepository>,
    pub trades: Arc<dyn TradeRepository>,
    pub accounts: Arc<dyn PaperAccountRepository>,
    pub royalty_ledger: Arc<dyn RoyaltyRepository>,
    pub groups_repo: Arc<dyn GroupRepository>,
    pub regime: Arc<RegimeDetector>,
    pub context: Arc<MarketContextService>,
    pub assembler: Arc<SignalAssembler>,
    pub recommendations: Arc<RecommendationService>,
    pub broker: Arc<PaperBroker>,
    pub royalties: Arc<RoyaltyEngine>,
    pub billing: Arc<BillingCycle>,
    pub groups: Arc<GroupService>,
    pub worker: Arc<EvolutionWorker>,
    pub streams: Arc<MarketStreamManager>,
    shutdown_tx: watch::Sender<bool>,
}

impl App {
    pub async fn build(config: Config) -> Result<Self> {
        let metrics = Metrics::new().context("metrics registry")?;
        let database = Database::new(&config.database_url).await?;
        Self::assemble(config, database, metrics).await
    }

    /// Assembly against an existing database handle (tests use the
    /// in-memory database).
    pub async fn assemble(config: Config, database: Database, metrics: Metrics) -> Result<Self> {
        let pool = database.pool.clone();
        let users: Arc<dyn UserRepository> = Arc::new(SqliteUserRepository::new(pool.clone()));
        let plans: Arc<dyn PlanRepository> = Arc::new(SqlitePlanRepository::new(pool.clone()));
        let settings: Arc<dyn SettingsRepository> =
            Arc::new(SqliteSettingsRepository::new(pool.clone()));
        let strategies: Arc<dyn StrategyRepository> =
            Arc::new(SqliteStrategyRepository::new(pool.clone()));
        let lineage: Arc<dyn LineageRepository> =
            Arc::new(SqliteLineageRepository::new(pool.clone()));
        let backtests: Arc<dyn BacktestRepository> =
            Arc::new(SqliteBacktestRepository::new(pool.clone()));
        let trades: Arc<dyn TradeRepository> = Arc::new(SqliteTradeRepository::new(pool.clone()));
        let accounts: Arc<dyn PaperAccountRepository> =
            Arc::new(SqlitePaperAccountRepository::new(pool.clone()));
        let royalty_ledger: Arc<dyn RoyaltyRepository> =
            Arc::new(SqliteRoyaltyRepository::new(pool.clone()));
        let groups_repo: Arc<dyn GroupRepository> =
            Arc::new(SqliteGroupRepository::new(pool.clone()));

        let cache = Arc::new(MarketDataCache::new(
            &config.cache.directory,
            config.cache.max_entries,
        ));
        if config.redis_url.is_some() {
            // The distributed layer activates when the deployment registers
            // a DistributedCache implementation alongside its Redis client.
            info!("REDIS_URL set; distributed cache layer awaits an adapter");
        }
        let queue = Arc::new(RequestQueue::new(cache, metrics.clone()));

        let router = Arc::new(Self::build_router(&config, Arc::clone(&queue), metrics.clone()));

        let memory = Arc::new(
            MemoryClusterStore::new(MemoryClusterStore::FIXED_DIM).with_snapshot(
                &config.brain.mcn_snapshot_path,
                config.brain.mcn_snapshot_max_bytes,
            ),
        );
        if let Err(e) = memory.load_state() {
            warn!("Memory store snapshot unavailable: {:#}", e);
        }

        let sentiment = Arc::new(SentimentService::new());
        let regime = Arc::new(RegimeDetector::new(Arc::clone(&router), Arc::clone(&memory)));
        let context = Arc::new(MarketContextService::new(
            Arc::clone(&router),
            Arc::clone(&sentiment),
            Arc::clone(&regime),
        ));

        let trend = Arc::new(MultiTimeframeAnalyzer::new(Arc::clone(&router)));
        let volume = Arc::new(VolumeAnalyzer::new(Arc::clone(&router)));
        let user_risk = Arc::new(UserRiskProfiler::new(
            Arc::clone(&trades),
            Arc::clone(&accounts),
        ));
        let portfolio = Arc::new(PortfolioRiskManager::new(
            Arc::clone(&trades),
            Arc::clone(&accounts),
            Arc::clone(&router),
        ));

        let assembler = Arc::new(SignalAssembler::new(
            Arc::clone(&strategies),
            Arc::clone(&lineage),
            Arc::clone(&backtests),
            Arc::clone(&accounts),
            Arc::clone(&router),
            Arc::clone(&regime),
            trend,
            volume,
            user_risk,
            portfolio,
            metrics.clone(),
            config.brain.min_signal_confidence,
        ));

        let recommendations = Arc::new(RecommendationService::new(
            Arc::clone(&strategies),
            Arc::clone(&backtests),
            Arc::clone(&lineage),
            Arc::clone(&regime),
        ));

        let royalties = Arc::new(RoyaltyEngine::new(
            Arc::clone(&strategies),
            Arc::clone(&lineage),
            Arc::clone(&users),
            Arc::clone(&plans),
            Arc::clone(&settings),
            Arc::clone(&royalty_ledger),
            metrics.clone(),
        ));

        let gateway: Arc<dyn PaymentGateway> = Arc::new(UnconfiguredGateway);
        let billing = Arc::new(BillingCycle::new(
            Arc::clone(&royalty_ledger),
            Arc::clone(&users),
            Arc::clone(&settings),
            gateway,
        ));

        let broker = Arc::new(PaperBroker::new(
            Arc::clone(&trades),
            Arc::clone(&accounts),
            Arc::clone(&router),
            Arc::clone(&royalties),
            config.paper_starting_balance,
        ));

        let cipher: Arc<dyn MessageCipher> = Arc::new(PlainCipher);
        if !config.encryption_secret_key.is_empty() {
            // The keyed cipher ships with the deployment; the identity
            // cipher here only covers local development.
            warn!("ENCRYPTION_SECRET_KEY set but no cipher adapter installed");
        }
        let groups = Arc::new(GroupService::new(
            Arc::clone(&groups_repo),
            Arc::clone(&users),
            Arc::clone(&plans),
            cipher,
        ));

        let thresholds = EvolutionThresholds {
            min_trades: config.evolution.min_trades,
            win_rate: config.evolution.win_rate_threshold,
            sharpe: config.evolution.sharpe_threshold,
            overfit_ratio: config.evolution.overfit_ratio,
            attempt_cap: config.evolution.attempt_cap,
            mutations_per_parent: config.evolution.mutations_per_parent,
            ..EvolutionThresholds::default()
        };
        let worker = Arc::new(EvolutionWorker::new(
            Arc::clone(&strategies),
            Arc::clone(&backtests),
            Arc::clone(&lineage),
            Arc::clone(&router),
            metrics.clone(),
            thresholds,
            Duration::from_secs(config.evolution.interval_hours * 3600),
        ));

        let streams = Arc::new(MarketStreamManager::new(
            Arc::clone(&context),
            config.streaming.max_connections,
        ));

        let (shutdown_tx, _) = watch::channel(false);

        info!("Application assembled; provider slots: {:?}", router.describe());

        Ok(Self {
            config,
            database,
            metrics,
            router,
            memory,
            users,
            plans,
            settings,
            strategies,
            lineage,
            backtests,
            trades,
            accounts,
            royalty_ledger,
            groups_repo,
            regime,
            context,
            assembler,
            recommendations,
            broker,
            royalties,
            billing,
            groups,
            worker,
            streams,
            shutdown_tx,
        })
    }

    fn build_router(config: &Config, queue: Arc<RequestQueue>, metrics: Metrics) -> ProviderRouter {
        let twelvedata: Arc<dyn MarketDataProvider> = Arc::new(TwelveDataAdapter::new(
            config.providers.twelvedata_api_key.clone(),
        ));
        let alpaca: Arc<dyn MarketDataProvider> = Arc::new(
            AlpacaAdapter::builder()
                .api_key(config.providers.alpaca_api_key.clone())
                .api_secret(config.providers.alpaca_secret_key.clone())
                .data_base_url(config.providers.alpaca_data_url.clone())
                .api_base_url(config.providers.alpaca_api_url.clone())
                .build(),
        );
        let yahoo: Arc<dyn MarketDataProvider> = Arc::new(YahooAdapter::new());

        let by_name = |name: &str| -> Arc<dyn MarketDataProvider> {
            match name {
                "alpaca" => Arc::clone(&alpaca),
                "yahoo" => Arc::clone(&yahoo),
                _ => Arc::clone(&twelvedata),
            }
        };

        let mut builder = ProviderRouter::builder(queue, metrics)
            .historical(by_name(&config.providers.historical))
            .live_primary(by_name(&config.providers.live_primary))
            .last_resort(yahoo.clone());
        if let Some(secondary) = &config.providers.live_secondary {
            builder = builder.live_secondary(by_name(secondary));
        }
        builder.build()
    }

    /// Shutdown signal handed to the evolution worker loop.
    pub fn shutdown_signal(&self) -> watch::Receiver<bool> {
        self.shutdown_tx.subscribe()
    }

    /// Stop background work and persist process-wide state, reverse of
    /// startup order.
    pub async fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
        for symbol in self.streams.active_symbols() {
            self.streams.disconnect(&symbol);
        }
        if let Err(e) = self.memory.save_state() {
            warn!("Could not persist memory store snapshot: {:#}", e);
        }
        self.database.pool.close().await;
        info!("Shutdown complete");
    }
}
