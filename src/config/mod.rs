//! Configuration loaded from environment variables (optionally a .env
//! file via dotenvy), organized by domain: database, providers, cache,
//! paper trading, evolution, brain, streaming and billing secrets.

use anyhow::{Context, Result};
use rust_decimal::Decimal;
use std::env;
use std::str::FromStr;

/// Provider slot assignments. Slot names refer to registered adapters
/// ("twelvedata", "alpaca", "yahoo").
#[derive(Debug, Clone)]
pub struct ProviderConfig {
    pub historical: String,
    pub live_primary: String,
    pub live_secondary: Option<String>,
    pub twelvedata_api_key: String,
    pub alpaca_api_key: String,
    pub alpaca_secret_key: String,
    pub alpaca_data_url: String,
    pub alpaca_api_url: String,
}

#[derive(Debug, Clone)]
pub struct CacheConfig {
    pub directory: String,
    pub max_entries: usize,
}

#[derive(Debug, Clone)]
pub struct EvolutionConfig {
    pub interval_hours: u64,
    pub min_trades: u32,
    pub win_rate_threshold: f64,
    pub sharpe_threshold: f64,
    pub overfit_ratio: f64,
    pub attempt_cap: u32,
    pub mutations_per_parent: usize,
}

#[derive(Debug, Clone)]
pub struct BrainConfig {
    pub min_signal_confidence: f64,
    pub mcn_snapshot_path: String,
    pub mcn_snapshot_max_bytes: u64,
}

#[derive(Debug, Clone)]
pub struct StreamingConfig {
    pub max_connections: usize,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: String,
    pub redis_url: Option<String>,
    pub jwt_secret_key: String,
    pub encryption_secret_key: String,
    pub stripe_secret_key: Option<String>,
    pub stripe_webhook_secret: Option<String>,
    pub paper_starting_balance: Decimal,
    pub providers: ProviderConfig,
    pub cache: CacheConfig,
    pub evolution: EvolutionConfig,
    pub brain: BrainConfig,
    pub streaming: StreamingConfig,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        let paper_starting_balance = env_or("PAPER_STARTING_BALANCE", "100000");
        let paper_starting_balance = Decimal::from_str(&paper_starting_balance)
            .context("PAPER_STARTING_BALANCE must be a decimal number")?;

        Ok(Self {
            database_url: env_or("DATABASE_URL", "sqlite://data/tradebrain.db"),
            redis_url: env::var("REDIS_URL").ok().filter(|s| !s.is_empty()),
            jwt_secret_key: env_or("JWT_SECRET_KEY", ""),
            encryption_secret_key: env_or("ENCRYPTION_SECRET_KEY", ""),
            stripe_secret_key: env::var("STRIPE_SECRET_KEY").ok().filter(|s| !s.is_empty()),
            stripe_webhook_secret: env::var("STRIPE_WEBHOOK_SECRET")
                .ok()
                .filter(|s| !s.is_empty()),
            paper_starting_balance,
            providers: ProviderConfig {
                historical: env_or("MARKET_DATA_PROVIDER_HISTORICAL", "twelvedata")
                    .to_lowercase(),
                live_primary: env_or("MARKET_DATA_PROVIDER_LIVE_PRIMARY", "twelvedata")
                    .to_lowercase(),
                live_secondary: env::var("MARKET_DATA_PROVIDER_LIVE_SECONDARY")
                    .ok()
                    .filter(|s| !s.is_empty())
                    .map(|s| s.to_lowercase())
                    .or_else(|| Some("alpaca".to_string())),
                twelvedata_api_key: env_or("TWELVEDATA_API_KEY", ""),
                alpaca_api_key: env_or("ALPACA_API_KEY", ""),
                alpaca_secret_key: env_or("ALPACA_SECRET_KEY", ""),
                alpaca_data_url: env_or("ALPACA_DATA_URL", "https://data.alpaca.markets"),
                alpaca_api_url: env_or("ALPACA_API_URL", "https://paper-api.alpaca.markets"),
            },
            cache: CacheConfig {
                directory: env_or("MARKET_CACHE_DIR", "./cache"),
                max_entries: parse_or("MARKET_CACHE_MAX_ENTRIES", 1000)?,
            },
            evolution: EvolutionConfig {
                interval_hours: parse_or("EVOLUTION_WORKER_INTERVAL_HOURS", 24)?,
                min_trades: parse_or("EVOLUTION_MIN_TRADES", 20)?,
                win_rate_threshold: parse_or("EVOLUTION_WIN_RATE_THRESHOLD", 0.55)?,
                sharpe_threshold: parse_or("EVOLUTION_SHARPE_THRESHOLD", 1.0)?,
                overfit_ratio: parse_or("EVOLUTION_OVERFIT_RATIO", 0.7)?,
                attempt_cap: parse_or("EVOLUTION_ATTEMPT_CAP", 10)?,
                mutations_per_parent: parse_or("EVOLUTION_MUTATIONS_PER_PARENT", 2)?,
            },
            brain: BrainConfig {
                min_signal_confidence: parse_or("MIN_SIGNAL_CONFIDENCE", 0.3)?,
                mcn_snapshot_path: env_or("MCN_SNAPSHOT_PATH", "./data/mcn_state.json"),
                mcn_snapshot_max_bytes: parse_or("MCN_SNAPSHOT_MAX_BYTES", 8 * 1024 * 1024)?,
            },
            streaming: StreamingConfig {
                max_connections: parse_or("WS_MAX_CONNECTIONS_PER_NODE", 256)?,
            },
        })
    }
}

fn env_or(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}

fn parse_or<T: FromStr>(key: &str, default: T) -> Result<T>
where
    T::Err: std::fmt::Display,
{
    match env::var(key) {
        Ok(raw) => raw
            .parse::<T>()
            .map_err(|e| anyhow::anyhow!("Invalid {}: {}", key, e)),
        Err(_) => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_load_without_env() {
        let config = Config::from_env().unwrap();
        assert_eq!(config.providers.historical, "twelvedata");
        assert_eq!(config.evolution.interval_hours, 24);
        assert!(config.brain.min_signal_confidence > 0.0);
        assert_eq!(
            config.paper_starting_balance,
            Decimal::from_str("100000").unwrap()
        );
    }
}
