mod alpaca;
mod twelvedata;
mod yahoo;

pub use alpaca::AlpacaAdapter;
pub use twelvedata::TwelveDataAdapter;
pub use yahoo::YahooAdapter;

use reqwest::{Client, StatusCode};
use reqwest_middleware::{ClientBuilder, ClientWithMiddleware};
use reqwest_retry::{RetryTransientMiddleware, policies::ExponentialBackoff};
use std::time::Duration;
use url::Url;

use crate::domain::errors::MarketDataError;

/// Provider calls must finish inside the 30s budget end to end.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Shared HTTP client for the vendor adapters.
///
/// Transport retries are capped at two attempts; provider-level backoff
/// and slot fallback belong to the request queue and router, so a vendor
/// outage must not multiply into middleware retry storms.
pub(crate) fn http_client() -> ClientWithMiddleware {
    let base = Client::builder()
        .timeout(REQUEST_TIMEOUT)
        .connect_timeout(CONNECT_TIMEOUT)
        .pool_max_idle_per_host(5)
        .build()
        .unwrap_or_default();

    ClientBuilder::new(base)
        .with(RetryTransientMiddleware::new_with_policy(
            ExponentialBackoff::builder().build_with_max_retries(2),
        ))
        .build()
}

/// Build a vendor endpoint with query parameters, percent-encoding
/// included (crypto pairs like `BTC/USD` need it).
pub(crate) fn endpoint<K, V>(
    provider: &str,
    base: &str,
    params: &[(K, V)],
) -> Result<Url, MarketDataError>
where
    K: AsRef<str>,
    V: AsRef<str>,
{
    Url::parse_with_params(base, params).map_err(|e| MarketDataError::InvalidRequest {
        message: format!("{} endpoint construction failed: {}", provider, e),
    })
}

/// Map a vendor HTTP status to the shared error taxonomy.
pub(crate) fn error_for_status(
    provider: &str,
    status: StatusCode,
    body: String,
) -> MarketDataError {
    match status.as_u16() {
        429 => MarketDataError::RateLimited {
            provider: provider.to_string(),
            retry_after_secs: 60,
        },
        401 | 403 => MarketDataError::Auth {
            provider: provider.to_string(),
            message: body,
        },
        404 => MarketDataError::NotFound { symbol: body },
        code => MarketDataError::Upstream {
            provider: provider.to_string(),
            status: code,
            message: body,
        },
    }
}

pub(crate) fn network_error(error: reqwest_middleware::Error) -> MarketDataError {
    MarketDataError::Network {
        message: error.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_endpoint_appends_and_encodes_query() {
        let url = endpoint(
            "twelvedata",
            "https://api.example.com/quote",
            &[("symbol", "BTC/USD"), ("apikey", "k")],
        )
        .unwrap();
        assert_eq!(
            url.as_str(),
            "https://api.example.com/quote?symbol=BTC%2FUSD&apikey=k"
        );
    }

    #[test]
    fn test_endpoint_rejects_malformed_base() {
        let result = endpoint("yahoo", "not a url", &[("a", "b")]);
        assert!(matches!(
            result,
            Err(MarketDataError::InvalidRequest { .. })
        ));
    }
}
