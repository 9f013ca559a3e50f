use rust_decimal::Decimal;
use thiserror::Error;

/// Errors raised by market data providers and the routing layer.
///
/// Clone so the request queue can broadcast one failure to every
/// coalesced waiter.
#[derive(Debug, Clone, Error)]
pub enum MarketDataError {
    #[error("Rate limited by {provider}: retry after {retry_after_secs}s")]
    RateLimited {
        provider: String,
        retry_after_secs: u64,
    },

    #[error("Upstream error from {provider} (HTTP {status}): {message}")]
    Upstream {
        provider: String,
        status: u16,
        message: String,
    },

    #[error("Authentication failed for {provider}: {message}")]
    Auth { provider: String, message: String },

    #[error("Symbol not found: {symbol}")]
    NotFound { symbol: String },

    #[error("{provider} does not support {what}")]
    Unsupported { provider: String, what: String },

    #[error("Invalid request: {message}")]
    InvalidRequest { message: String },

    #[error("Network error: {message}")]
    Network { message: String },

    #[error("All providers failed for {operation}")]
    AllProvidersFailed { operation: String },

    #[error("No market data provider is configured")]
    NoProvider,
}

impl MarketDataError {
    /// Whether the router should try the next provider slot.
    ///
    /// 429, 5xx, network faults, auth failures and 404s all fall over to
    /// the next slot; only malformed requests propagate immediately.
    pub fn is_retryable(&self) -> bool {
        match self {
            MarketDataError::RateLimited { .. } => true,
            MarketDataError::Upstream { status, .. } => {
                *status >= 500 || *status == 408 || *status == 429 || (400..=404).contains(status)
            }
            MarketDataError::Auth { .. } => true,
            MarketDataError::NotFound { .. } => true,
            MarketDataError::Unsupported { .. } => true,
            MarketDataError::Network { .. } => true,
            MarketDataError::InvalidRequest { .. } => false,
            MarketDataError::AllProvidersFailed { .. } => false,
            MarketDataError::NoProvider => false,
        }
    }

    /// Whether the request queue should enter exponential backoff.
    pub fn is_rate_limit(&self) -> bool {
        matches!(
            self,
            MarketDataError::RateLimited { .. }
                | MarketDataError::Upstream { status: 429, .. }
                | MarketDataError::Upstream { status: 500..=599, .. }
        )
    }
}

/// Errors related to trade placement and account bookkeeping.
#[derive(Debug, Error)]
pub enum TradingError {
    #[error("Insufficient funds: need ${need}, available ${available}")]
    InsufficientFunds { need: Decimal, available: Decimal },

    #[error("No open position found for {symbol}")]
    NoOpenPosition { symbol: String },

    #[error("Invalid order: {reason}")]
    InvalidOrder { reason: String },

    #[error("Trade not found: {trade_id}")]
    TradeNotFound { trade_id: String },

    #[error("Price unavailable for {symbol}: {reason}")]
    PriceUnavailable { symbol: String, reason: String },
}

/// Portfolio admission-control violations.
#[derive(Debug, Error)]
pub enum RiskViolation {
    #[error("Symbol exposure limit for {symbol}: {current_pct:.1}% > {max_pct:.1}%")]
    SymbolExposure {
        symbol: String,
        current_pct: f64,
        max_pct: f64,
    },

    #[error("Sector exposure limit for {sector}: {current_pct:.1}% > {max_pct:.1}%")]
    SectorExposure {
        sector: String,
        current_pct: f64,
        max_pct: f64,
    },

    #[error("Correlated positions limit: {count} correlated positions")]
    CorrelationLimit { count: usize },

    #[error("Leverage {leverage:.2} exceeds limit {max:.2}")]
    LeverageLimit { leverage: f64, max: f64 },
}

/// Errors in royalty attribution and the billing cycle.
#[derive(Debug, Error)]
pub enum BillingError {
    #[error("Creator not found: {user_id}")]
    CreatorNotFound { user_id: String },

    #[error("Payment gateway failure: {message}")]
    GatewayFailure { message: String },

    #[error("Ledger write failed: {message}")]
    LedgerWrite { message: String },
}

/// Access-policy failures surfaced to the edge as 402/403.
#[derive(Debug, Error)]
pub enum PolicyError {
    #[error("Account locked: ${outstanding:.2} outstanding (threshold ${threshold:.2})")]
    RoyaltyLock { outstanding: f64, threshold: f64 },

    #[error("Not authorized: {reason}")]
    NotAuthorized { reason: String },

    #[error("Plan limit reached: {reason}")]
    PlanLimit { reason: String },
}

/// Refusals from the signal assembler (not failures).
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Error, serde::Serialize, serde::Deserialize,
)]
#[serde(rename_all = "kebab-case")]
pub enum SignalRefusal {
    #[error("low-confidence")]
    LowConfidence,

    #[error("portfolio-risk")]
    PortfolioRisk,
}
