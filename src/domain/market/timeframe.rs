use anyhow::{Result, anyhow};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Candle interval used across providers, the strategy engine and the brain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Timeframe {
    OneMin,
    FiveMin,
    FifteenMin,
    OneHour,
    FourHour,
    OneDay,
    OneWeek,
}

impl Timeframe {
    pub fn to_minutes(&self) -> usize {
        match self {
            Timeframe::OneMin => 1,
            Timeframe::FiveMin => 5,
            Timeframe::FifteenMin => 15,
            Timeframe::OneHour => 60,
            Timeframe::FourHour => 240,
            Timeframe::OneDay => 1440,
            Timeframe::OneWeek => 10080,
        }
    }

    pub fn to_seconds(&self) -> i64 {
        (self.to_minutes() * 60) as i64
    }

    /// Canonical wire form ("1m", "4h", "1d") used for cache keys and storage.
    pub fn as_str(&self) -> &'static str {
        match self {
            Timeframe::OneMin => "1m",
            Timeframe::FiveMin => "5m",
            Timeframe::FifteenMin => "15m",
            Timeframe::OneHour => "1h",
            Timeframe::FourHour => "4h",
            Timeframe::OneDay => "1d",
            Timeframe::OneWeek => "1w",
        }
    }

    /// Alpaca bar interval string.
    pub fn to_alpaca_string(&self) -> &'static str {
        match self {
            Timeframe::OneMin => "1Min",
            Timeframe::FiveMin => "5Min",
            Timeframe::FifteenMin => "15Min",
            Timeframe::OneHour => "1Hour",
            Timeframe::FourHour => "4Hour",
            Timeframe::OneDay => "1Day",
            Timeframe::OneWeek => "1Week",
        }
    }

    /// Twelve Data interval string. Returns None for intervals the vendor
    /// lacks; callers resample from `resample_source` instead.
    pub fn to_twelvedata_string(&self) -> Option<&'static str> {
        match self {
            Timeframe::OneMin => Some("1min"),
            Timeframe::FiveMin => Some("5min"),
            Timeframe::FifteenMin => Some("15min"),
            Timeframe::OneHour => Some("1h"),
            Timeframe::FourHour => None,
            Timeframe::OneDay => Some("1day"),
            Timeframe::OneWeek => Some("1week"),
        }
    }

    /// Yahoo chart interval string.
    pub fn to_yahoo_string(&self) -> &'static str {
        match self {
            Timeframe::OneMin => "1m",
            Timeframe::FiveMin => "5m",
            Timeframe::FifteenMin => "15m",
            Timeframe::OneHour => "60m",
            Timeframe::FourHour => "60m",
            Timeframe::OneDay => "1d",
            Timeframe::OneWeek => "1wk",
        }
    }

    /// Finer timeframe plus the number of source candles that merge into one
    /// candle of this timeframe, for intervals a vendor cannot serve natively.
    pub fn resample_source(&self) -> Option<(Timeframe, usize)> {
        match self {
            Timeframe::FourHour => Some((Timeframe::OneHour, 4)),
            _ => None,
        }
    }

    pub fn all() -> Vec<Timeframe> {
        vec![
            Timeframe::OneMin,
            Timeframe::FiveMin,
            Timeframe::FifteenMin,
            Timeframe::OneHour,
            Timeframe::FourHour,
            Timeframe::OneDay,
            Timeframe::OneWeek,
        ]
    }

    /// The six timeframes analyzed for multi-timeframe confirmation.
    pub fn confirmation_set() -> [Timeframe; 6] {
        [
            Timeframe::OneMin,
            Timeframe::FiveMin,
            Timeframe::FifteenMin,
            Timeframe::OneHour,
            Timeframe::FourHour,
            Timeframe::OneDay,
        ]
    }

    /// Start of the period containing `timestamp_ms` (daily/weekly align to
    /// midnight UTC).
    pub fn period_start(&self, timestamp_ms: i64) -> i64 {
        let timestamp_sec = timestamp_ms / 1000;
        let period_sec = self.to_seconds();
        let aligned = timestamp_sec - (timestamp_sec % period_sec);
        aligned * 1000
    }
}

impl FromStr for Timeframe {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "1m" | "1min" => Ok(Timeframe::OneMin),
            "5m" | "5min" => Ok(Timeframe::FiveMin),
            "15m" | "15min" => Ok(Timeframe::FifteenMin),
            "1h" | "60m" | "1hour" => Ok(Timeframe::OneHour),
            "4h" | "4hour" => Ok(Timeframe::FourHour),
            "1d" | "1day" => Ok(Timeframe::OneDay),
            "1w" | "1wk" | "1week" => Ok(Timeframe::OneWeek),
            _ => Err(anyhow!(
                "Invalid timeframe: '{}'. Valid options: 1m, 5m, 15m, 1h, 4h, 1d, 1w",
                s
            )),
        }
    }
}

impl fmt::Display for Timeframe {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}
