//! Yahoo adapter: fixed last-resort slot. Key-less chart API, used only
//! when every configured provider has failed.

use async_trait::async_trait;
use chrono::Utc;
use reqwest_middleware::ClientWithMiddleware;
use rust_decimal::Decimal;
use serde::Deserialize;

use crate::domain::errors::MarketDataError;
use crate::domain::market::symbols;
use crate::domain::market::types::{Candle, CandleRequest, PriceSnapshot};
use crate::domain::ports::{Capabilities, MarketDataProvider};

use super::{endpoint, error_for_status, http_client, network_error};

pub struct YahooAdapter {
    client: ClientWithMiddleware,
    base_url: String,
}

impl YahooAdapter {
    pub fn new() -> Self {
        Self::with_base_url("https://query1.finance.yahoo.com".to_string())
    }

    pub fn with_base_url(base_url: String) -> Self {
        Self {
            client: http_client(),
            base_url,
        }
    }

    async fn fetch_chart(
        &self,
        symbol: &str,
        interval: &str,
        range: &str,
    ) -> Result<ChartResult, MarketDataError> {
        let canonical = symbols::normalize(symbol);
        let url = endpoint(
            "yahoo",
            &format!("{}/v8/finance/chart/{}", self.base_url, canonical),
            &[("interval", interval), ("range", range)],
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
            return Err(error_for_status("yahoo", status, body));
        }

        let payload: ChartResponse = response.json().await.map_err(|e| {
            MarketDataError::Upstream {
                provider: "yahoo".to_string(),
                status: 200,
                message: format!("malformed chart payload: {}", e),
            }
        })?;

        payload
            .chart
            .result
            .and_then(|mut results| {
                if results.is_empty() {
                    None
                } else {
                    Some(results.remove(0))
                }
            })
            .ok_or_else(|| MarketDataError::NotFound {
                symbol: canonical.clone(),
            })
    }

    /// Range string wide enough to cover `limit` bars at `interval`.
    fn range_for(request: &CandleRequest) -> &'static str {
        use crate::domain::market::Timeframe::*;
        match request.timeframe {
            OneMin | FiveMin | FifteenMin => "5d",
            OneHour | FourHour => "1mo",
            OneDay => {
                if request.limit > 250 {
                    "2y"
                } else {
                    "1y"
                }
            }
            OneWeek => "5y",
        }
    }
}

impl Default for YahooAdapter {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MarketDataProvider for YahooAdapter {
    fn name(&self) -> &'static str {
        "yahoo"
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            price: true,
            candles: true,
            sentiment: false,
            volatility: false,
            asset_details: false,
        }
    }

    async fn price(&self, symbol: &str) -> Result<PriceSnapshot, MarketDataError> {
        let chart = self.fetch_chart(symbol, "1d", "5d").await?;
        let meta = chart.meta.ok_or_else(|| MarketDataError::NotFound {
            symbol: symbols::normalize(symbol),
        })?;

        let price = meta
            .regular_market_price
            .and_then(Decimal::from_f64_retain)
            .ok_or_else(|| MarketDataError::NotFound {
                symbol: symbols::normalize(symbol),
            })?;
        let change_pct = match (meta.regular_market_price, meta.chart_previous_close) {
            (Some(last), Some(prev)) if prev > 0.0 => (last / prev - 1.0) * 100.0,
            _ => 0.0,
        };

        Ok(PriceSnapshot {
            symbol: symbols::normalize(symbol),
            price,
            change_pct,
            timestamp: Utc::now(),
            provider: "yahoo".to_string(),
        })
    }

    async fn candles(&self, request: &CandleRequest) -> Result<Vec<Candle>, MarketDataError> {
        let interval = request.timeframe.to_yahoo_string();
        let range = Self::range_for(request);
        let chart = self.fetch_chart(&request.symbol, interval, range).await?;

        let canonical = symbols::normalize(&request.symbol);
        let timestamps = chart.timestamp.unwrap_or_default();
        let quote = chart
            .indicators
            .and_then(|i| i.quote.into_iter().next())
            .unwrap_or_default();

        let mut candles = Vec::with_capacity(timestamps.len());
        for (i, ts) in timestamps.iter().enumerate() {
            let (Some(open), Some(high), Some(low), Some(close)) = (
                value_at(&quote.open, i),
                value_at(&quote.high, i),
                value_at(&quote.low, i),
                value_at(&quote.close, i),
            ) else {
                continue; // Yahoo pads halted bars with nulls.
            };
            let volume = value_at(&quote.volume, i).unwrap_or(0.0);

            let (Some(open), Some(high), Some(low), Some(close), Some(volume)) = (
                Decimal::from_f64_retain(open),
                Decimal::from_f64_retain(high),
                Decimal::from_f64_retain(low),
                Decimal::from_f64_retain(close),
                Decimal::from_f64_retain(volume),
            ) else {
                continue;
            };

            candles.push(Candle {
                symbol: canonical.clone(),
                open,
                high,
                low,
                close,
                volume,
                timestamp: ts * 1000,
            });
        }

        // Oldest-first, trimmed to the requested window.
        candles.sort_by_key(|c| c.timestamp);
        if candles.len() > request.limit {
            let excess = candles.len() - request.limit;
            candles.drain(..excess);
        }
        Ok(candles)
    }
}

fn value_at(series: &[Option<f64>], index: usize) -> Option<f64> {
    series.get(index).copied().flatten()
}

#[derive(Debug, Deserialize)]
struct ChartResponse {
    chart: Chart,
}

#[derive(Debug, Deserialize)]
struct Chart {
    result: Option<Vec<ChartResult>>,
}

#[derive(Debug, Deserialize)]
struct ChartResult {
    meta: Option<ChartMeta>,
    timestamp: Option<Vec<i64>>,
    indicators: Option<Indicators>,
}

#[derive(Debug, Deserialize)]
struct ChartMeta {
    #[serde(rename = "regularMarketPrice")]
    regular_market_price: Option<f64>,
    #[serde(rename = "chartPreviousClose")]
    chart_previous_close: Option<f64>,
}

#[derive(Debug, Deserialize)]
struct Indicators {
    quote: Vec<Quote>,
}

#[derive(Debug, Default, Deserialize)]
struct Quote {
    #[serde(default)]
    open: Vec<Option<f64>>,
    #[serde(default)]
    high: Vec<Option<f64>>,
    #[serde(default)]
    low: Vec<Option<f64>>,
    #[serde(default)]
    close: Vec<Option<f64>>,
    #[serde(default)]
    volume: Vec<Option<f64>>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::market::Timeframe;

    #[test]
    fn test_range_selection() {
        let req = CandleRequest::live("AAPL", Timeframe::OneDay, 50);
        assert_eq!(YahooAdapter::range_for(&req), "1y");

        let req = CandleRequest::live("AAPL", Timeframe::OneDay, 300);
        assert_eq!(YahooAdapter::range_for(&req), "2y");

        let req = CandleRequest::live("AAPL", Timeframe::FiveMin, 50);
        assert_eq!(YahooAdapter::range_for(&req), "5d");
    }

    #[test]
    fn test_null_padded_bars_are_skipped() {
        let series = vec![Some(1.0), None, Some(3.0)];
        assert_eq!(value_at(&series, 0), Some(1.0));
        assert_eq!(value_at(&series, 1), None);
        assert_eq!(value_at(&series, 5), None);
    }
}
