//! Headline sentiment service.
//!
//! Pulls recent RSS headlines for a symbol and scores them with VADER plus
//! a small financial lexicon boost. Any failure collapses to a neutral
//! snapshot. Sentiment is an enrichment signal, never a hard dependency.

use chrono::Utc;
use reqwest::Client;
use rss::Channel;
use std::io::Cursor;
use std::time::Duration;
use tracing::debug;
use vader_sentiment::SentimentIntensityAnalyzer;

use crate::domain::market::types::{SentimentLabel, SentimentSnapshot};

const BULLISH_KEYWORDS: &[(&str, f64)] = &[
    ("surge", 0.4),
    ("surges", 0.4),
    ("rally", 0.4),
    ("rallies", 0.4),
    ("soar", 0.5),
    ("soars", 0.5),
    ("bullish", 0.5),
    ("all-time high", 0.5),
    ("breakout", 0.3),
    ("upgrade", 0.3),
    ("record high", 0.4),
    ("beats estimates", 0.4),
];

const BEARISH_KEYWORDS: &[(&str, f64)] = &[
    ("crash", -0.5),
    ("crashes", -0.5),
    ("plunge", -0.5),
    ("plunges", -0.5),
    ("bearish", -0.5),
    ("collapse", -0.5),
    ("lawsuit", -0.4),
    ("downgrade", -0.3),
    ("sell-off", -0.4),
    ("misses estimates", -0.4),
    ("recall", -0.3),
];

/// Label thresholds on the aggregate score.
const BULLISH_THRESHOLD: f64 = 0.15;
const BEARISH_THRESHOLD: f64 = -0.15;

pub struct SentimentService {
    client: Client,
    feed_url_template: String,
    analyzer: SentimentIntensityAnalyzer<'static>,
    max_headlines: usize,
}

impl SentimentService {
    pub fn new() -> Self {
        Self::with_feed_template(
            "https://feeds.finance.yahoo.com/rss/2.0/headline?s={symbol}&region=US&lang=en-US"
                .to_string(),
        )
    }

    pub fn with_feed_template(feed_url_template: String) -> Self {
        Self {
            client: Client::builder()
                .timeout(Duration::from_secs(10))
                .build()
                .unwrap_or_else(|_| Client::new()),
            feed_url_template,
            analyzer: SentimentIntensityAnalyzer::new(),
            max_headlines: 20,
        }
    }

    /// Aggregate headline sentiment for one symbol. Never fails.
    pub async fn analyze(&self, symbol: &str) -> SentimentSnapshot {
        match self.try_analyze(symbol).await {
            Some(snapshot) => snapshot,
            None => SentimentSnapshot::neutral(symbol),
        }
    }

    async fn try_analyze(&self, symbol: &str) -> Option<SentimentSnapshot> {
        let url = self.feed_url_template.replace("{symbol}", symbol);
        let response = self.client.get(&url).send().await.ok()?;
        if !response.status().is_success() {
            debug!(
                "Sentiment feed returned {} for {}",
                response.status(),
                symbol
            );
            return None;
        }
        let bytes = response.bytes().await.ok()?;
        let channel = Channel::read_from(Cursor::new(bytes)).ok()?;

        let scores: Vec<f64> = channel
            .items()
            .iter()
            .take(self.max_headlines)
            .filter_map(|item| item.title())
            .map(|title| self.score_text(title))
            .collect();

        if scores.is_empty() {
            return None;
        }

        let score = scores.iter().sum::<f64>() / scores.len() as f64;
        Some(SentimentSnapshot {
            symbol: symbol.to_string(),
            score,
            label: label_for(score),
            source: "rss".to_string(),
            timestamp: Utc::now(),
        })
    }

    /// VADER compound score plus financial keyword boost, in [-1, 1].
    pub fn score_text(&self, text: &str) -> f64 {
        if text.trim().is_empty() {
            return 0.0;
        }
        let scores = self.analyzer.polarity_scores(text);
        let vader_score = scores.get("compound").copied().unwrap_or(0.0);

        let lower = text.to_lowercase();
        let mut boost = 0.0;
        for (keyword, weight) in BULLISH_KEYWORDS.iter().chain(BEARISH_KEYWORDS) {
            if lower.contains(keyword) {
                boost += weight;
            }
        }

        (vader_score + boost * 0.5).clamp(-1.0, 1.0)
    }
}

impl Default for SentimentService {
    fn default() -> Self {
        Self::new()
    }
}

fn label_for(score: f64) -> SentimentLabel {
    if score > BULLISH_THRESHOLD {
        SentimentLabel::Bullish
    } else if score < BEARISH_THRESHOLD {
        SentimentLabel::Bearish
    } else {
        SentimentLabel::Neutral
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_score_direction() {
        let service = SentimentService::new();
        let bullish = service.score_text("Shares surge to record high after earnings beat");
        let bearish = service.score_text("Stock crashes amid lawsuit and broad sell-off");
        assert!(bullish > 0.0);
        assert!(bearish < 0.0);
        assert_eq!(service.score_text("   "), 0.0);
    }

    #[test]
    fn test_labels() {
        assert_eq!(label_for(0.5), SentimentLabel::Bullish);
        assert_eq!(label_for(-0.5), SentimentLabel::Bearish);
        assert_eq!(label_for(0.0), SentimentLabel::Neutral);
    }

    #[tokio::test]
    async fn test_unreachable_feed_degrades_to_neutral() {
        let service =
            SentimentService::with_feed_template("http://127.0.0.1:1/rss?s={symbol}".to_string());
        let snapshot = service.analyze("AAPL").await;
        assert_eq!(snapshot.label, SentimentLabel::Neutral);
        assert_eq!(snapshot.source, "fallback");
    }
}
