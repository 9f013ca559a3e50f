use anyhow::{Result, anyhow};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TradeSide {
    Buy,
    Sell,
}

impl fmt::Display for TradeSide {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TradeSide::Buy => write!(f, "BUY"),
            TradeSide::Sell => write!(f, "SELL"),
        }
    }
}

impl FromStr for TradeSide {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_uppercase().as_str() {
            "BUY" => Ok(TradeSide::Buy),
            "SELL" => Ok(TradeSide::Sell),
            _ => Err(anyhow!("Invalid trade side: {}", s)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TradeStatus {
    Open,
    Closed,
}

impl fmt::Display for TradeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TradeStatus::Open => write!(f, "OPEN"),
            TradeStatus::Closed => write!(f, "CLOSED"),
        }
    }
}

impl FromStr for TradeStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_uppercase().as_str() {
            "OPEN" => Ok(TradeStatus::Open),
            "CLOSED" => Ok(TradeStatus::Closed),
            _ => Err(anyhow!("Invalid trade status: {}", s)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TradeMode {
    Paper,
    Real,
}

impl fmt::Display for TradeMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TradeMode::Paper => write!(f, "PAPER"),
            TradeMode::Real => write!(f, "REAL"),
        }
    }
}

impl FromStr for TradeMode {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_uppercase().as_str() {
            "PAPER" => Ok(TradeMode::Paper),
            "REAL" => Ok(TradeMode::Real),
            _ => Err(anyhow!("Invalid trade mode: {}", s)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TradeSource {
    Manual,
    Brain,
}

impl fmt::Display for TradeSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TradeSource::Manual => write!(f, "MANUAL"),
            TradeSource::Brain => write!(f, "BRAIN"),
        }
    }
}

impl FromStr for TradeSource {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_uppercase().as_str() {
            "MANUAL" => Ok(TradeSource::Manual),
            "BRAIN" => Ok(TradeSource::Brain),
            _ => Err(anyhow!("Invalid trade source: {}", s)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AssetType {
    Stock,
    Crypto,
    Forex,
}

impl fmt::Display for AssetType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AssetType::Stock => write!(f, "stock"),
            AssetType::Crypto => write!(f, "crypto"),
            AssetType::Forex => write!(f, "forex"),
        }
    }
}

impl FromStr for AssetType {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "stock" => Ok(AssetType::Stock),
            "crypto" => Ok(AssetType::Crypto),
            "forex" => Ok(AssetType::Forex),
            _ => Err(anyhow!("Invalid asset type: {}", s)),
        }
    }
}

/// A position open/close pair.
///
/// Invariant: `status == Closed` iff `exit_price`, `closed_at` and
/// `realized_pnl` are all set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Trade {
    pub id: String,
    pub user_id: String,
    pub symbol: String,
    pub asset_type: AssetType,
    pub side: TradeSide,
    pub quantity: Decimal,
    pub entry_price: Decimal,
    pub exit_price: Option<Decimal>,
    pub status: TradeStatus,
    pub mode: TradeMode,
    pub source: TradeSource,
    pub strategy_id: Option<String>,
    pub opened_at: DateTime<Utc>,
    pub closed_at: Option<DateTime<Utc>>,
    pub realized_pnl: Option<Decimal>,
}

impl Trade {
    /// Realized pnl at `exit_price`: (exit - entry) * qty for BUY,
    /// sign flipped for SELL.
    pub fn pnl_at(&self, exit_price: Decimal) -> Decimal {
        match self.side {
            TradeSide::Buy => (exit_price - self.entry_price) * self.quantity,
            TradeSide::Sell => (self.entry_price - exit_price) * self.quantity,
        }
    }

    /// Capital consumed when the position was opened.
    pub fn entry_cost(&self) -> Decimal {
        self.entry_price * self.quantity
    }

    pub fn is_open(&self) -> bool {
        self.status == TradeStatus::Open
    }

    /// Closed-state invariant check, used before persisting a close.
    pub fn validate_closed(&self) -> Result<()> {
        if self.status == TradeStatus::Closed {
            if self.exit_price.is_none() || self.closed_at.is_none() || self.realized_pnl.is_none()
            {
                return Err(anyhow!(
                    "Trade {} is CLOSED but missing exit fields",
                    self.id
                ));
            }
        } else if self.exit_price.is_some() || self.closed_at.is_some() || self.realized_pnl.is_some()
        {
            return Err(anyhow!("Trade {} is OPEN but has exit fields", self.id));
        }
        Ok(())
    }
}

/// One simulated account per user.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PaperAccount {
    pub user_id: String,
    pub balance: Decimal,
    pub starting_balance: Decimal,
    pub updated_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn trade(side: TradeSide) -> Trade {
        Trade {
            id: "t1".to_string(),
            user_id: "u1".to_string(),
            symbol: "AAPL".to_string(),
            asset_type: AssetType::Stock,
            side,
            quantity: dec!(10),
            entry_price: dec!(100),
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

    #[test]
    fn test_pnl_signs() {
        let long = trade(TradeSide::Buy);
        assert_eq!(long.pnl_at(dec!(110)), dec!(100));
        assert_eq!(long.pnl_at(dec!(95)), dec!(-50));

        let short = trade(TradeSide::Sell);
        assert_eq!(short.pnl_at(dec!(110)), dec!(-100));
        assert_eq!(short.pnl_at(dec!(95)), dec!(50));
    }

    #[test]
    fn test_closed_invariant() {
        let mut t = trade(TradeSide::Buy);
        assert!(t.validate_closed().is_ok());

        t.status = TradeStatus::Closed;
        assert!(t.validate_closed().is_err());

        t.exit_price = Some(dec!(110));
        t.closed_at = Some(Utc::now());
        t.realized_pnl = Some(dec!(100));
        assert!(t.validate_closed().is_ok());

        t.status = TradeStatus::Open;
        assert!(t.validate_closed().is_err());
    }
}
