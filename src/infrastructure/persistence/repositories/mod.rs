mod accounts;
mod backtests;
mod groups;
mod lineage;
mod plans;
mod royalties;
mod settings;
mod strategies;
mod trades;
mod users;

pub use accounts::SqlitePaperAccountRepository;
pub use backtests::SqliteBacktestRepository;
pub use groups::SqliteGroupRepository;
pub use lineage::SqliteLineageRepository;
pub use plans::SqlitePlanRepository;
pub use royalties::SqliteRoyaltyRepository;
pub use settings::SqliteSettingsRepository;
pub use strategies::SqliteStrategyRepository;
pub use trades::SqliteTradeRepository;
pub use users::SqliteUserRepository;

use anyhow::{Context, Result};
use rust_decimal::Decimal;
use std::str::FromStr;

/// Decimals persist as TEXT to keep exact values across round-trips.
pub(crate) fn parse_decimal(raw: &str) -> Result<Decimal> {
    Decimal::from_str(raw).with_context(|| format!("invalid decimal in database: {}", raw))
}

pub(crate) fn parse_optional_decimal(raw: Option<String>) -> Result<Option<Decimal>> {
    raw.as_deref().map(parse_decimal).transpose()
}
