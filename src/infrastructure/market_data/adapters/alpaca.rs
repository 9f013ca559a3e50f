//! Alpaca adapter: live-primary slot.
//!
//! Stock data comes from the v2 data API (IEX feed); crypto pairs use the
//! v1beta3 endpoints. Asset metadata comes from the trading API.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest_middleware::ClientWithMiddleware;
use rust_decimal::Decimal;
use serde::Deserialize;
use std::collections::HashMap;

use crate::domain::errors::MarketDataError;
use crate::domain::market::symbols;
use crate::domain::market::types::{AssetDetails, Candle, CandleRequest, PriceSnapshot};
use crate::domain::ports::{Capabilities, MarketDataProvider};

use super::{endpoint, error_for_status, http_client, network_error};

pub struct AlpacaAdapter {
    client: ClientWithMiddleware,
    api_key: String,
    api_secret: String,
    data_base_url: String,
    api_base_url: String,
}

#[derive(Default)]
pub struct AlpacaAdapterBuilder {
    api_key: Option<String>,
    api_secret: Option<String>,
    data_base_url: Option<String>,
    api_base_url: Option<String>,
}

impl AlpacaAdapterBuilder {
    pub fn api_key(mut self, api_key: String) -> Self {
        self.api_key = Some(api_key);
        self
    }

    pub fn api_secret(mut self, api_secret: String) -> Self {
        self.api_secret = Some(api_secret);
        self
    }

    pub fn data_base_url(mut self, url: String) -> Self {
        self.data_base_url = Some(url);
        self
    }

    pub fn api_base_url(mut self, url: String) -> Self {
        self.api_base_url = Some(url);
        self
    }

    pub fn build(self) -> AlpacaAdapter {
        AlpacaAdapter {
            client: http_client(),
            api_key: self.api_key.unwrap_or_default(),
            api_secret: self.api_secret.unwrap_or_default(),
            data_base_url: self
                .data_base_url
                .unwrap_or_else(|| "https://data.alpaca.markets".to_string()),
            api_base_url: self
                .api_base_url
                .unwrap_or_else(|| "https://paper-api.alpaca.markets".to_string()),
        }
    }
}

impl AlpacaAdapter {
    pub fn builder() -> AlpacaAdapterBuilder {
        AlpacaAdapterBuilder::default()
    }

    fn auth_headers(
        &self,
        request: reqwest_middleware::RequestBuilder,
    ) -> reqwest_middleware::RequestBuilder {
        request
            .header("APCA-API-KEY-ID", &self.api_key)
            .header("APCA-API-SECRET-KEY", &self.api_secret)
    }

    /// Crypto pairs route to the v1beta3 endpoints with a slash symbol.
    fn crypto_symbol(symbol: &str) -> String {
        symbol.replace('-', "/")
    }
}

#[async_trait]
impl MarketDataProvider for AlpacaAdapter {
    fn name(&self) -> &'static str {
        "alpaca"
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            price: true,
            candles: true,
            sentiment: false,
            volatility: false,
            asset_details: true,
        }
    }

    async fn price(&self, symbol: &str) -> Result<PriceSnapshot, MarketDataError> {
        let canonical = symbols::normalize(symbol);

        let url = if symbols::is_crypto(&canonical) {
            endpoint(
                "alpaca",
                &format!("{}/v1beta3/crypto/us/snapshots", self.data_base_url),
                &[("symbols", Self::crypto_symbol(&canonical).as_str())],
            )?
            .to_string()
        } else {
            format!("{}/v2/stocks/{}/snapshot", self.data_base_url, canonical)
        };

        let response = self
            .auth_headers(self.client.get(&url))
            .send()
            .await
            .map_err(network_error)?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(error_for_status("alpaca", status, body));
        }

        let (price, prev_close) = if symbols::is_crypto(&canonical) {
            let payload: CryptoSnapshotResponse =
                response.json().await.map_err(malformed)?;
            let snapshot = payload
                .snapshots
                .into_values()
                .next()
                .ok_or_else(|| MarketDataError::NotFound {
                    symbol: canonical.clone(),
                })?;
            (
                snapshot.latest_trade.map(|t| t.p),
                snapshot.prev_daily_bar.map(|b| b.c),
            )
        } else {
            let payload: StockSnapshotResponse =
                response.json().await.map_err(malformed)?;
            (
                payload.latest_trade.map(|t| t.p),
                payload.prev_daily_bar.map(|b| b.c),
            )
        };

        let price = price.ok_or_else(|| MarketDataError::NotFound {
            symbol: canonical.clone(),
        })?;
        let change_pct = match prev_close {
            Some(prev) if prev > Decimal::ZERO => {
                use rust_decimal::prelude::ToPrimitive;
                ((price - prev) / prev).to_f64().unwrap_or(0.0) * 100.0
            }
            _ => 0.0,
        };

        Ok(PriceSnapshot {
            symbol: canonical,
            price,
            change_pct,
            timestamp: Utc::now(),
            provider: "alpaca".to_string(),
        })
    }

    async fn candles(&self, request: &CandleRequest) -> Result<Vec<Candle>, MarketDataError> {
        let canonical = symbols::normalize(&request.symbol);
        let timeframe = request.timeframe.to_alpaca_string().to_string();
        let limit = request.limit.to_string();

        let mut params: Vec<(String, String)> = vec![
            ("timeframe".to_string(), timeframe),
            ("limit".to_string(), limit),
            ("adjustment".to_string(), "raw".to_string()),
        ];
        if let Some(start) = request.start {
            params.push(("start".to_string(), rfc3339(start)));
        }
        if let Some(end) = request.end {
            params.push(("end".to_string(), rfc3339(end)));
        }

        let url = if symbols::is_crypto(&canonical) {
            params.push((
                "symbols".to_string(),
                Self::crypto_symbol(&canonical),
            ));
            endpoint(
                "alpaca",
                &format!("{}/v1beta3/crypto/us/bars", self.data_base_url),
                &params,
            )?
        } else {
            params.push(("feed".to_string(), "iex".to_string()));
            endpoint(
                "alpaca",
                &format!("{}/v2/stocks/{}/bars", self.data_base_url, canonical),
                &params,
            )?
        };

        let response = self
            .auth_headers(self.client.get(url.as_str()))
            .send()
            .await
            .map_err(network_error)?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(error_for_status("alpaca", status, body));
        }

        let bars: Vec<AlpacaBar> = if symbols::is_crypto(&canonical) {
            let payload: CryptoBarsResponse = response.json().await.map_err(malformed)?;
            payload.bars.into_values().next().unwrap_or_default()
        } else {
            let payload: StockBarsResponse = response.json().await.map_err(malformed)?;
            payload.bars.unwrap_or_default()
        };

        let mut candles: Vec<Candle> = bars
            .into_iter()
            .filter_map(|bar| bar.into_candle(&canonical))
            .collect();
        candles.sort_by_key(|c| c.timestamp);
        Ok(candles)
    }

    async fn asset_details(&self, symbol: &str) -> Result<Option<AssetDetails>, MarketDataError> {
        let canonical = symbols::normalize(symbol);
        let url = format!("{}/v2/assets/{}", self.api_base_url, canonical);

        let response = self
            .auth_headers(self.client.get(&url))
            .send()
            .await
            .map_err(network_error)?;

        if !response.status().is_success() {
            return Ok(None);
        }

        let asset: AssetResponse = match response.json().await {
            Ok(a) => a,
            Err(_) => return Ok(None),
        };

        Ok(Some(AssetDetails {
            symbol: canonical,
            name: asset.name,
            sector: None,
            exchange: asset.exchange,
        }))
    }
}

fn malformed(error: reqwest::Error) -> MarketDataError {
    MarketDataError::Upstream {
        provider: "alpaca".to_string(),
        status: 200,
        message: format!("malformed payload: {}", error),
    }
}

fn rfc3339(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(chrono::SecondsFormat::Secs, true)
}

#[derive(Debug, Deserialize)]
struct AlpacaBar {
    t: String,
    o: Decimal,
    h: Decimal,
    l: Decimal,
    c: Decimal,
    v: Decimal,
}

impl AlpacaBar {
    fn into_candle(self, symbol: &str) -> Option<Candle> {
        let timestamp = DateTime::parse_from_rfc3339(&self.t)
            .ok()?
            .with_timezone(&Utc)
            .timestamp_millis();
        Some(Candle {
            symbol: symbol.to_string(),
            open: self.o,
            high: self.h,
            low: self.l,
            close: self.c,
            volume: self.v,
            timestamp,
        })
    }
}

#[derive(Debug, Deserialize)]
struct StockBarsResponse {
    bars: Option<Vec<AlpacaBar>>,
}

#[derive(Debug, Deserialize)]
struct CryptoBarsResponse {
    bars: HashMap<String, Vec<AlpacaBar>>,
}

#[derive(Debug, Deserialize)]
struct LatestTrade {
    p: Decimal,
}

#[derive(Debug, Deserialize)]
struct DailyBar {
    c: Decimal,
}

#[derive(Debug, Deserialize)]
struct StockSnapshotResponse {
    #[serde(rename = "latestTrade")]
    latest_trade: Option<LatestTrade>,
    #[serde(rename = "prevDailyBar")]
    prev_daily_bar: Option<DailyBar>,
}

#[derive(Debug, Deserialize)]
struct CryptoSnapshot {
    #[serde(rename = "latestTrade")]
    latest_trade: Option<LatestTrade>,
    #[serde(rename = "prevDailyBar")]
    prev_daily_bar: Option<DailyBar>,
}

#[derive(Debug, Deserialize)]
struct CryptoSnapshotResponse {
    snapshots: HashMap<String, CryptoSnapshot>,
}

#[derive(Debug, Deserialize)]
struct AssetResponse {
    name: Option<String>,
    exchange: Option<String>,
}
