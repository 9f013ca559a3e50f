//! Twelve Data adapter: historical-primary slot.
//!
//! Serves time series with start/end windows, quotes, volatility derived
//! from daily closes, and asset profiles. Crypto pairs are rewritten to
//! the vendor's slash form (BTC-USD -> BTC/USD). The vendor has no 4h
//! interval; those requests fetch 1h bars and resample.

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use reqwest_middleware::ClientWithMiddleware;
use rust_decimal::Decimal;
use serde::Deserialize;
use std::str::FromStr;
use tracing::debug;

use crate::domain::errors::MarketDataError;
use crate::domain::market::symbols;
use crate::domain::market::types::{
    AssetDetails, Candle, CandleRequest, PriceSnapshot, VolatilitySnapshot, resample,
};
use crate::domain::ports::{Capabilities, MarketDataProvider};

use super::{endpoint, error_for_status, http_client, network_error};

pub struct TwelveDataAdapter {
    client: ClientWithMiddleware,
    api_key: String,
    base_url: String,
}

impl TwelveDataAdapter {
    pub fn new(api_key: String) -> Self {
        Self::with_base_url(api_key, "https://api.twelvedata.com".to_string())
    }

    pub fn with_base_url(api_key: String, base_url: String) -> Self {
        Self {
            client: http_client(),
            api_key,
            base_url,
        }
    }

    async fn fetch_series(
        &self,
        symbol: &str,
        interval: &str,
        outputsize: usize,
        start: Option<DateTime<Utc>>,
        end: Option<DateTime<Utc>>,
    ) -> Result<Vec<Candle>, MarketDataError> {
        let vendor_symbol = symbols::to_twelvedata(symbol);
        let outputsize_str = outputsize.to_string();

        let mut params: Vec<(String, String)> = vec![
            ("symbol".to_string(), vendor_symbol),
            ("interval".to_string(), interval.to_string()),
            ("outputsize".to_string(), outputsize_str),
            ("apikey".to_string(), self.api_key.clone()),
        ];
        if let Some(start) = start {
            params.push((
                "start_date".to_string(),
                start.format("%Y-%m-%d %H:%M:%S").to_string(),
            ));
        }
        if let Some(end) = end {
            params.push((
                "end_date".to_string(),
                end.format("%Y-%m-%d %H:%M:%S").to_string(),
            ));
        }

        let url = endpoint(
            "twelvedata",
            &format!("{}/time_series", self.base_url),
            &params,
        )?;
        let response = self
            .client
            .get(url.as_str())
            .send()
            .await
            .map_err(network_error)?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(error_for_status("twelvedata", status, body));
        }

        let payload: TimeSeriesResponse = response.json().await.map_err(|e| {
            MarketDataError::Upstream {
                provider: "twelvedata".to_string(),
                status: 200,
                message: format!("malformed time series payload: {}", e),
            }
        })?;

        // The vendor reports errors inside a 200 body.
        if let Some(code) = payload.code {
            return Err(match code {
                429 => MarketDataError::RateLimited {
                    provider: "twelvedata".to_string(),
                    retry_after_secs: 60,
                },
                401 | 403 => MarketDataError::Auth {
                    provider: "twelvedata".to_string(),
                    message: payload.message.unwrap_or_default(),
                },
                404 => MarketDataError::NotFound {
                    symbol: symbol.to_string(),
                },
                other => MarketDataError::Upstream {
                    provider: "twelvedata".to_string(),
                    status: other,
                    message: payload.message.unwrap_or_default(),
                },
            });
        }

        let mut candles: Vec<Candle> = payload
            .values
            .unwrap_or_default()
            .into_iter()
            .filter_map(|bar| bar.into_candle(symbol))
            .collect();
        // Vendor returns newest-first; contract is oldest-first.
        candles.sort_by_key(|c| c.timestamp);
        Ok(candles)
    }
}

#[async_trait]
impl MarketDataProvider for TwelveDataAdapter {
    fn name(&self) -> &'static str {
        "twelvedata"
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            price: true,
            candles: true,
            sentiment: false,
            volatility: true,
            asset_details: true,
        }
    }

    async fn price(&self, symbol: &str) -> Result<PriceSnapshot, MarketDataError> {
        let vendor_symbol = symbols::to_twelvedata(symbol);
        let url = endpoint(
            "twelvedata",
            &format!("{}/quote", self.base_url),
            &[
                ("symbol", vendor_symbol.as_str()),
                ("apikey", self.api_key.as_str()),
            ],
        )?;

        let response = self
            .client
            .get(url.as_str())
            .send()
            .await
            .map_err(network_error)?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(error_for_status("twelvedata", status, body));
        }

        let quote: QuoteResponse = response.json().await.map_err(|e| {
            MarketDataError::Upstream {
                provider: "twelvedata".to_string(),
                status: 200,
                message: format!("malformed quote payload: {}", e),
            }
        })?;

        let price = quote
            .close
            .as_deref()
            .and_then(|s| Decimal::from_str(s).ok())
            .ok_or_else(|| MarketDataError::NotFound {
                symbol: symbol.to_string(),
            })?;
        let change_pct = quote
            .percent_change
            .as_deref()
            .and_then(|s| s.parse::<f64>().ok())
            .unwrap_or(0.0);

        Ok(PriceSnapshot {
            symbol: symbols::normalize(symbol),
            price,
            change_pct,
            timestamp: Utc::now(),
            provider: "twelvedata".to_string(),
        })
    }

    async fn candles(&self, request: &CandleRequest) -> Result<Vec<Candle>, MarketDataError> {
        match request.timeframe.to_twelvedata_string() {
            Some(interval) => {
                self.fetch_series(
                    &request.symbol,
                    interval,
                    request.limit,
                    request.start,
                    request.end,
                )
                .await
            }
            None => {
                // Unsupported interval: synthesize from the finer source.
                let (source, chunk) = request
                    .timeframe
                    .resample_source()
                    .ok_or_else(|| MarketDataError::Unsupported {
                        provider: "twelvedata".to_string(),
                        what: format!("interval {}", request.timeframe),
                    })?;
                let source_interval =
                    source
                        .to_twelvedata_string()
                        .ok_or_else(|| MarketDataError::Unsupported {
                            provider: "twelvedata".to_string(),
                            what: format!("interval {}", source),
                        })?;
                debug!(
                    "Resampling {} {} from {}x{}",
                    request.symbol, request.timeframe, chunk, source
                );
                let fine = self
                    .fetch_series(
                        &request.symbol,
                        source_interval,
                        request.limit * chunk,
                        request.start,
                        request.end,
                    )
                    .await?;
                Ok(resample(&fine, chunk))
            }
        }
    }

    async fn volatility(
        &self,
        symbol: &str,
    ) -> Result<Option<VolatilitySnapshot>, MarketDataError> {
        let candles = self.fetch_series(symbol, "1day", 31, None, None).await?;
        if candles.len() < 10 {
            return Ok(None);
        }

        let closes: Vec<f64> = candles.iter().map(Candle::close_f64).collect();
        let returns: Vec<f64> = closes
            .windows(2)
            .filter(|w| w[0] > 0.0)
            .map(|w| w[1] / w[0] - 1.0)
            .collect();
        if returns.len() < 2 {
            return Ok(None);
        }
        let mean = returns.iter().sum::<f64>() / returns.len() as f64;
        let variance = returns.iter().map(|r| (r - mean).powi(2)).sum::<f64>()
            / (returns.len() - 1) as f64;
        let annualized = variance.sqrt() * (252.0f64).sqrt();

        Ok(Some(VolatilitySnapshot {
            symbol: symbols::normalize(symbol),
            volatility: annualized,
            timestamp: Utc::now(),
        }))
    }

    async fn asset_details(&self, symbol: &str) -> Result<Option<AssetDetails>, MarketDataError> {
        let vendor_symbol = symbols::to_twelvedata(symbol);
        let url = endpoint(
            "twelvedata",
            &format!("{}/profile", self.base_url),
            &[
                ("symbol", vendor_symbol.as_str()),
                ("apikey", self.api_key.as_str()),
            ],
        )?;

        let response = self
            .client
            .get(url.as_str())
            .send()
            .await
            .map_err(network_error)?;
        let status = response.status();
        if !status.is_success() {
            // Profiles are best-effort; missing data is not an error.
            return Ok(None);
        }

        let profile: ProfileResponse = match response.json().await {
            Ok(p) => p,
            Err(_) => return Ok(None),
        };

        Ok(Some(AssetDetails {
            symbol: symbols::normalize(symbol),
            name: profile.name,
            sector: profile.sector,
            exchange: profile.exchange,
        }))
    }
}

#[derive(Debug, Deserialize)]
struct TimeSeriesResponse {
    values: Option<Vec<TimeSeriesBar>>,
    code: Option<u16>,
    message: Option<String>,
}

#[derive(Debug, Deserialize)]
struct TimeSeriesBar {
    datetime: String,
    open: String,
    high: String,
    low: String,
    close: String,
    volume: Option<String>,
}

impl TimeSeriesBar {
    fn into_candle(self, symbol: &str) -> Option<Candle> {
        let timestamp = parse_vendor_datetime(&self.datetime)?;
        Some(Candle {
            symbol: symbols::normalize(symbol),
            open: Decimal::from_str(&self.open).ok()?,
            high: Decimal::from_str(&self.high).ok()?,
            low: Decimal::from_str(&self.low).ok()?,
            close: Decimal::from_str(&self.close).ok()?,
            volume: self
                .volume
                .as_deref()
                .and_then(|v| Decimal::from_str(v).ok())
                .unwrap_or(Decimal::ZERO),
            timestamp,
        })
    }
}

fn parse_vendor_datetime(raw: &str) -> Option<i64> {
    if let Ok(dt) = chrono::NaiveDateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S") {
        return Some(Utc.from_utc_datetime(&dt).timestamp_millis());
    }
    if let Ok(date) = chrono::NaiveDate::parse_from_str(raw, "%Y-%m-%d") {
        let dt = date.and_hms_opt(0, 0, 0)?;
        return Some(Utc.from_utc_datetime(&dt).timestamp_millis());
    }
    None
}

#[derive(Debug, Deserialize)]
struct QuoteResponse {
    close: Option<String>,
    percent_change: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ProfileResponse {
    name: Option<String>,
    sector: Option<String>,
    exchange: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_vendor_datetime() {
        assert!(parse_vendor_datetime("2024-01-02 15:30:00").is_some());
        assert!(parse_vendor_datetime("2024-01-02").is_some());
        assert!(parse_vendor_datetime("bogus").is_none());
    }

    #[test]
    fn test_bar_conversion_sorts_into_contract_order() {
        let bar = TimeSeriesBar {
            datetime: "2024-01-02".to_string(),
            open: "100.5".to_string(),
            high: "101".to_string(),
            low: "99".to_string(),
            close: "100".to_string(),
            volume: Some("1200".to_string()),
        };
        let candle = bar.into_candle("aapl").unwrap();
        assert_eq!(candle.symbol, "AAPL");
        assert_eq!(candle.close, Decimal::from_str("100").unwrap());
    }
}
