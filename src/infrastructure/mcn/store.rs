//! Memory-cluster store: a process-wide, fixed-dimension embedding store
//! with cosine k-NN recall.
//!
//! Contract:
//! - Every insert is coerced to the fixed dimension (truncate / zero-pad).
//! - Queries that cannot be coerced into a finite fixed-dimension vector
//!   are refused with an empty result, never an error.
//! - All access goes through one mutex; a poisoned lock degrades to empty
//!   results so a panicked writer can never take the brain down with it.
//! - Snapshots persist as JSON; when the snapshot exceeds its size budget,
//!   the oldest memories are evicted first.

use anyhow::{Context, Result};
use ndarray::Array1;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fs;
use std::path::PathBuf;
use std::sync::Mutex;
use tracing::{debug, info, warn};

/// Coerce a vector to exactly `dim` entries by truncation or zero-padding.
pub fn fix_dim(input: &[f32], dim: usize) -> Array1<f32> {
    let mut out = Array1::zeros(dim);
    for (i, value) in input.iter().take(dim).enumerate() {
        out[i] = *value;
    }
    out
}

#[derive(Serialize, Deserialize, Default)]
struct StoreState {
    vectors: Vec<Vec<f32>>,
    metadata: Vec<Value>,
}

pub struct MemoryClusterStore {
    dim: usize,
    state: Mutex<StoreState>,
    snapshot_path: Option<PathBuf>,
    max_snapshot_bytes: u64,
}

impl MemoryClusterStore {
    /// Design dimension for market-state embeddings.
    pub const FIXED_DIM: usize = 32;

    pub fn new(dim: usize) -> Self {
        Self {
            dim,
            state: Mutex::new(StoreState::default()),
            snapshot_path: None,
            max_snapshot_bytes: 8 * 1024 * 1024,
        }
    }

    pub fn with_snapshot(mut self, path: impl Into<PathBuf>, max_bytes: u64) -> Self {
        self.snapshot_path = Some(path.into());
        self.max_snapshot_bytes = max_bytes;
        self
    }

    pub fn dim(&self) -> usize {
        self.dim
    }

    pub fn len(&self) -> usize {
        match self.state.lock() {
            Ok(state) => state.vectors.len(),
            Err(_) => 0,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Insert one vector with its metadata. Inserts are coerced to the
    /// fixed dimension; non-finite entries are zeroed.
    pub fn add(&self, vector: &[f32], metadata: Value) -> Result<()> {
        let mut fixed = fix_dim(vector, self.dim);
        for value in fixed.iter_mut() {
            if !value.is_finite() {
                *value = 0.0;
            }
        }

        let mut state = self
            .state
            .lock()
            .map_err(|_| anyhow::anyhow!("memory store lock poisoned"))?;
        state.vectors.push(fixed.to_vec());
        state.metadata.push(metadata);
        Ok(())
    }

    /// Cosine k-NN over the stored memories.
    ///
    /// Never fails: refused queries (empty, non-finite) and internal
    /// faults all produce `(vec![], vec![])`, and callers degrade
    /// gracefully.
    pub fn search(&self, query: &[f32], k: usize) -> (Vec<Value>, Vec<f32>) {
        if k == 0 || query.is_empty() || query.iter().any(|v| !v.is_finite()) {
            return (Vec::new(), Vec::new());
        }
        let query = fix_dim(query, self.dim);
        let query_norm = query.dot(&query).sqrt();
        if query_norm == 0.0 {
            return (Vec::new(), Vec::new());
        }

        let Ok(state) = self.state.lock() else {
            warn!("Memory store lock poisoned, returning empty search result");
            return (Vec::new(), Vec::new());
        };

        let mut scored: Vec<(usize, f32)> = state
            .vectors
            .iter()
            .enumerate()
            .filter_map(|(i, stored)| {
                let stored = Array1::from_vec(stored.clone());
                let norm = stored.dot(&stored).sqrt();
                if norm == 0.0 {
                    return None;
                }
                Some((i, query.dot(&stored) / (query_norm * norm)))
            })
            .collect();

        scored.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
        scored.truncate(k);

        let metas = scored
            .iter()
            .map(|(i, _)| state.metadata[*i].clone())
            .collect();
        let scores = scored.iter().map(|(_, s)| *s).collect();
        (metas, scores)
    }

    /// Serialize the store to its snapshot path, evicting oldest memories
    /// until the serialized form fits the size budget.
    pub fn save_state(&self) -> Result<()> {
        let Some(path) = &self.snapshot_path else {
            return Ok(());
        };

        let mut state = self
            .state
            .lock()
            .map_err(|_| anyhow::anyhow!("memory store lock poisoned"))?;

        let mut serialized = serde_json::to_vec(&*state).context("serialize memory store")?;
        while serialized.len() as u64 > self.max_snapshot_bytes && !state.vectors.is_empty() {
            let evict = (state.vectors.len() / 10).max(1);
            state.vectors.drain(..evict);
            state.metadata.drain(..evict);
            debug!("Snapshot over budget, evicted {} oldest memories", evict);
            serialized = serde_json::to_vec(&*state).context("serialize memory store")?;
        }

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).context("create snapshot directory")?;
        }
        fs::write(path, serialized).context("write memory store snapshot")?;
        info!(
            "Saved memory store snapshot ({} memories) to {:?}",
            state.vectors.len(),
            path
        );
        Ok(())
    }

    /// Load a previously saved snapshot. Missing or corrupt snapshots
    /// leave the store empty.
    pub fn load_state(&self) -> Result<()> {
        let Some(path) = &self.snapshot_path else {
            return Ok(());
        };
        if !path.exists() {
            return Ok(());
        }

        let raw = fs::read(path).context("read memory store snapshot")?;
        let loaded: StoreState = match serde_json::from_slice(&raw) {
            Ok(state) => state,
            Err(e) => {
                warn!("Corrupt memory store snapshot, starting empty: {}", e);
                return Ok(());
            }
        };

        let mut state = self
            .state
            .lock()
            .map_err(|_| anyhow::anyhow!("memory store lock poisoned"))?;
        // Re-coerce on load in case the dimension changed between versions.
        state.vectors = loaded
            .vectors
            .iter()
            .map(|v| fix_dim(v, self.dim).to_vec())
            .collect();
        state.metadata = loaded.metadata;
        info!("Loaded {} memories from {:?}", state.vectors.len(), path);
        Ok(())
    }
}
