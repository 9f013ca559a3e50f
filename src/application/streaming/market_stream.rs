//! Per-symbol market streaming.
//!
//! One cooperative task per symbol alternates between a ~1s snapshot tick
//! and a 30s keepalive ping, and disconnects itself after 30 minutes
//! without a consumer touch. At most one live stream per symbol; duplicate
//! registrations are rejected so the transport layer can close them with a
//! policy violation.
//!
//! Frames carry safe defaults for every field, so a degraded context never
//! produces a hole that crashes a client.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{broadcast, watch};
use tracing::{debug, info, warn};

use crate::application::brain::context::MarketContextService;
use crate::domain::market::types::TickFrame;

const SNAPSHOT_CADENCE: Duration = Duration::from_secs(1);
const KEEPALIVE_CADENCE: Duration = Duration::from_secs(30);
const IDLE_TIMEOUT: Duration = Duration::from_secs(30 * 60);

#[derive(Debug, Error)]
pub enum StreamError {
    #[error("A live stream already exists for {symbol}")]
    AlreadyStreaming { symbol: String },

    #[error("Stream capacity reached ({max})")]
    CapacityReached { max: usize },
}

struct StreamHandle {
    frames: broadcast::Sender<TickFrame>,
    touch: watch::Sender<()>,
    stop: watch::Sender<bool>,
}

pub struct MarketStreamManager {
    context: Arc<MarketContextService>,
    active: Mutex<HashMap<String, StreamHandle>>,
    max_connections: usize,
}

impl MarketStreamManager {
    pub fn new(context: Arc<MarketContextService>, max_connections: usize) -> Self {
        Self {
            context,
            active: Mutex::new(HashMap::new()),
            max_connections: max_connections.max(1),
        }
    }

    /// Open a stream for a symbol. Returns the frame receiver; the boot
    /// frame arrives first.
    pub fn subscribe(
        self: Arc<Self>,
        symbol: &str,
    ) -> Result<broadcast::Receiver<TickFrame>, StreamError> {
        let symbol = symbol.to_uppercase();
        let mut active = self.active.lock().expect("stream map lock");

        // Drop entries whose task already stopped.
        active.retain(|_, handle| !*handle.stop.borrow());

        if active.contains_key(&symbol) {
            return Err(StreamError::AlreadyStreaming { symbol });
        }
        if active.len() >= self.max_connections {
            return Err(StreamError::CapacityReached {
                max: self.max_connections,
            });
        }

        let (frames_tx, frames_rx) = broadcast::channel(64);
        let (touch_tx, touch_rx) = watch::channel(());
        let (stop_tx, stop_rx) = watch::channel(false);

        active.insert(
            symbol.clone(),
            StreamHandle {
                frames: frames_tx.clone(),
                touch: touch_tx,
                stop: stop_tx.clone(),
            },
        );
        drop(active);

        let manager = Arc::clone(&self);
        tokio::spawn(async move {
            manager
                .stream_task(symbol.clone(), frames_tx, touch_rx, stop_rx, stop_tx)
                .await;
            manager.remove(&symbol);
        });

        Ok(frames_rx)
    }

    /// Reset a stream's idle timer (a consumer is still there).
    pub fn touch(&self, symbol: &str) {
        let active = self.active.lock().expect("stream map lock");
        if let Some(handle) = active.get(&symbol.to_uppercase()) {
            let _ = handle.touch.send(());
        }
    }

    /// Close one stream.
    pub fn disconnect(&self, symbol: &str) {
        let active = self.active.lock().expect("stream map lock");
        if let Some(handle) = active.get(&symbol.to_uppercase()) {
            let _ = handle.stop.send(true);
        }
    }

    pub fn active_symbols(&self) -> Vec<String> {
        let active = self.active.lock().expect("stream map lock");
        active.keys().cloned().collect()
    }

    /// Live receivers on one symbol's stream.
    pub fn subscriber_count(&self, symbol: &str) -> usize {
        let active = self.active.lock().expect("stream map lock");
        active
            .get(&symbol.to_uppercase())
            .map(|handle| handle.frames.receiver_count())
            .unwrap_or(0)
    }

    fn remove(&self, symbol: &str) {
        let mut active = self.active.lock().expect("stream map lock");
        active.remove(symbol);
        debug!("Stream for {} removed", symbol);
    }

    async fn stream_task(
        &self,
        symbol: String,
        frames: broadcast::Sender<TickFrame>,
        mut touch: watch::Receiver<()>,
        mut stop: watch::Receiver<bool>,
        stop_tx: watch::Sender<bool>,
    ) {
        info!("Market stream started for {}", symbol);

        // Boot frame first: defaults only, never an error.
        let boot_context = self.context.context(&symbol).await;
        let _ = frames.send(TickFrame::Boot {
            symbol: symbol.clone(),
            price: boot_context.price,
            regime: boot_context.regime.clone(),
            risk_level: "normal".to_string(),
        });

        let mut snapshot_timer = tokio::time::interval(SNAPSHOT_CADENCE);
        snapshot_timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        let mut keepalive_timer = tokio::time::interval(KEEPALIVE_CADENCE);
        let idle = tokio::time::sleep(IDLE_TIMEOUT);
        tokio::pin!(idle);

        loop {
            tokio::select! {
                _ = snapshot_timer.tick() => {
                    if frames.receiver_count() == 0 {
                        continue;
                    }
                    let context = self.context.context(&symbol).await;
                    let frame = TickFrame::Tick {
                        symbol: symbol.clone(),
                        price: context.price,
                        change_pct: context.change_24h,
                        volume: context.volume,
                        sentiment: context.sentiment,
                        regime: context.regime,
                        volatility: Some(context.annualized_volatility),
                        risk_level: risk_level_label(context.annualized_volatility),
                    };
                    if frames.send(frame).is_err() {
                        warn!("Stream for {} lost all receivers", symbol);
                        break;
                    }
                }
                _ = keepalive_timer.tick() => {
                    let _ = frames.send(TickFrame::Ping);
                }
                changed = touch.changed() => {
                    if changed.is_ok() {
                        idle.as_mut().reset(tokio::time::Instant::now() + IDLE_TIMEOUT);
                    }
                }
                _ = &mut idle => {
                    info!("Stream for {} idle past {:?}, disconnecting", symbol, IDLE_TIMEOUT);
                    break;
                }
                _ = stop.changed() => {
                    if *stop.borrow() {
                        break;
                    }
                }
            }
        }

        let _ = stop_tx.send(true);
        info!("Market stream for {} stopped", symbol);
    }
}

fn risk_level_label(annualized_volatility_pct: f64) -> String {
    if annualized_volatility_pct > 30.0 {
        "high".to_string()
    } else if annualized_volatility_pct < 15.0 && annualized_volatility_pct > 0.0 {
        "low".to_string()
    } else {
        "normal".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_risk_level_label() {
        assert_eq!(risk_level_label(45.0), "high");
        assert_eq!(risk_level_label(10.0), "low");
        assert_eq!(risk_level_label(20.0), "normal");
        assert_eq!(risk_level_label(0.0), "normal");
    }
}
