//! Prometheus metrics. All metrics use the `tradebrain_` prefix and are
//! registered on a private registry that the ops layer scrapes or dumps.

use prometheus::{
    CounterVec, Gauge, Opts, Registry, TextEncoder,
    core::{AtomicF64, GenericGauge},
};
use std::sync::Arc;

#[derive(Clone)]
pub struct Metrics {
    registry: Arc<Registry>,
    /// Cache hits by layer (l1/l2/l3).
    pub cache_hits_total: CounterVec,
    /// Calls that reached a vendor, by provider.
    pub upstream_calls_total: CounterVec,
    /// Backoff windows entered, by provider.
    pub backoffs_total: CounterVec,
    /// Requests that joined an in-flight identical request.
    pub coalesced_requests_total: CounterVec,
    /// Provider fallbacks taken by the router.
    pub provider_fallbacks_total: CounterVec,
    /// Evolution cycles completed.
    pub evolution_cycles_total: CounterVec,
    /// Strategies currently proposable.
    pub proposable_strategies: GenericGauge<AtomicF64>,
    /// Signals emitted by outcome (buy/sell/hold/refused).
    pub signals_total: CounterVec,
    /// Royalty ledger rows written.
    pub royalty_entries_total: CounterVec,
}

impl Metrics {
    pub fn new() -> anyhow::Result<Self> {
        let registry = Registry::new();

        let cache_hits_total = CounterVec::new(
            Opts::new("tradebrain_cache_hits_total", "Cache hits by layer"),
            &["layer"],
        )?;
        registry.register(Box::new(cache_hits_total.clone()))?;

        let upstream_calls_total = CounterVec::new(
            Opts::new(
                "tradebrain_upstream_calls_total",
                "Requests dispatched to a market data vendor",
            ),
            &["provider"],
        )?;
        registry.register(Box::new(upstream_calls_total.clone()))?;

        let backoffs_total = CounterVec::new(
            Opts::new(
                "tradebrain_backoffs_total",
                "Exponential backoff windows entered",
            ),
            &["provider"],
        )?;
        registry.register(Box::new(backoffs_total.clone()))?;

        let coalesced_requests_total = CounterVec::new(
            Opts::new(
                "tradebrain_coalesced_requests_total",
                "Requests served by an identical in-flight request",
            ),
            &["provider"],
        )?;
        registry.register(Box::new(coalesced_requests_total.clone()))?;

        let provider_fallbacks_total = CounterVec::new(
            Opts::new(
                "tradebrain_provider_fallbacks_total",
                "Router fallbacks from one slot to the next",
            ),
            &["from", "to"],
        )?;
        registry.register(Box::new(provider_fallbacks_total.clone()))?;

        let evolution_cycles_total = CounterVec::new(
            Opts::new(
                "tradebrain_evolution_cycles_total",
                "Evolution worker cycles by outcome",
            ),
            &["outcome"],
        )?;
        registry.register(Box::new(evolution_cycles_total.clone()))?;

        let proposable_strategies = Gauge::with_opts(Opts::new(
            "tradebrain_proposable_strategies",
            "Strategies currently in proposable status",
        ))?;
        registry.register(Box::new(proposable_strategies.clone()))?;

        let signals_total = CounterVec::new(
            Opts::new("tradebrain_signals_total", "Brain signals by outcome"),
            &["outcome"],
        )?;
        registry.register(Box::new(signals_total.clone()))?;

        let royalty_entries_total = CounterVec::new(
            Opts::new(
                "tradebrain_royalty_entries_total",
                "Royalty ledger rows written",
            ),
            &["rate_tier"],
        )?;
        registry.register(Box::new(royalty_entries_total.clone()))?;

        Ok(Self {
            registry: Arc::new(registry),
            cache_hits_total,
            upstream_calls_total,
            backoffs_total,
            coalesced_requests_total,
            provider_fallbacks_total,
            evolution_cycles_total,
            proposable_strategies,
            signals_total,
            royalty_entries_total,
        })
    }

    /// Text exposition for the ops surface.
    pub fn gather(&self) -> String {
        let encoder = TextEncoder::new();
        encoder
            .encode_to_string(&self.registry.gather())
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_register_and_gather() {
        let metrics = Metrics::new().unwrap();
        metrics.cache_hits_total.with_label_values(&["l1"]).inc();
        metrics
            .upstream_calls_total
            .with_label_values(&["alpaca"])
            .inc();

        let text = metrics.gather();
        assert!(text.contains("tradebrain_cache_hits_total"));
        assert!(text.contains("alpaca"));
    }
}
