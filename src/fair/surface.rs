//! Empirical fair-price surface.
//!
//! Maps (asset, |spot − strike| bucket, time-to-expiry bucket) to an EWMA
//! of the observed UP mid-price. Cells are created on first observation
//! and never destroyed; a cell is trusted for trading only once it has
//! enough samples and a recent update. Fair DOWN is the complement of
//! fair UP.

use std::collections::HashMap;
use std::path::Path;

use anyhow::Context;
use serde::{Deserialize, Serialize};

use crate::config::asset_params;
use crate::types::Asset;

#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct FairCell {
    pub fair: f64,
    pub n: u64,
    pub last_update_ms: i64,
    pub min: f64,
    pub max: f64,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
struct CellKey {
    asset: Asset,
    delta_idx: u32,
    time_idx: usize,
}

pub struct FairSurface {
    alpha: f64,
    min_samples: u64,
    max_age_ms: i64,
    /// Half-open time buckets [edges[i], edges[i+1]) in seconds-to-expiry.
    time_edges: Vec<i64>,
    cells: HashMap<CellKey, FairCell>,
}

impl FairSurface {
    pub fn new(alpha: f64, min_samples: u64, max_age_ms: i64, time_edges: Vec<i64>) -> Self {
        Self {
            alpha,
            min_samples,
            max_age_ms,
            time_edges,
            cells: HashMap::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.cells.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cells.is_empty()
    }

    /// Delta bucket index: |delta| clamped to the asset's cap, then
    /// floor-divided by the bucket width.
    fn delta_bucket(asset: Asset, delta_abs: f64) -> u32 {
        let p = asset_params(asset);
        let clamped = delta_abs.abs().min(p.max_delta_usd);
        let idx = (clamped / p.delta_width_usd).floor() as u32;
        // The clamp itself lands exactly on the upper edge; fold it into
        // the top bucket.
        idx.min((p.max_delta_usd / p.delta_width_usd) as u32 - 1)
    }

    /// Lower bound of a delta bucket in USD.
    pub fn delta_bucket_lower(asset: Asset, delta_abs: f64) -> f64 {
        Self::delta_bucket(asset, delta_abs) as f64 * asset_params(asset).delta_width_usd
    }

    fn time_bucket(&self, tte_s: f64) -> Option<usize> {
        let t = tte_s as i64;
        if tte_s < 0.0 || t < *self.time_edges.first()? || t >= *self.time_edges.last()? {
            return None;
        }
        self.time_edges
            .windows(2)
            .position(|w| t >= w[0] && t < w[1])
    }

    fn key(&self, asset: Asset, delta_abs: f64, tte_s: f64) -> Option<CellKey> {
        let time_idx = self.time_bucket(tte_s)?;
        Some(CellKey {
            asset,
            delta_idx: Self::delta_bucket(asset, delta_abs),
            time_idx,
        })
    }

    /// Fold one observed UP mid into the surface. Snapshots outside the
    /// time range are ignored. Returns true when a cell was updated.
    pub fn observe(
        &mut self,
        asset: Asset,
        delta_abs: f64,
        tte_s: f64,
        up_mid: f64,
        now_ms: i64,
    ) -> bool {
        if !(up_mid > 0.0 && up_mid < 1.0) {
            return false;
        }
        let Some(key) = self.key(asset, delta_abs, tte_s) else {
            return false;
        };

        match self.cells.get_mut(&key) {
            Some(cell) => {
                cell.fair += self.alpha * (up_mid - cell.fair);
                cell.n += 1;
                cell.last_update_ms = now_ms;
                if up_mid < cell.min {
                    cell.min = up_mid;
                }
                if up_mid > cell.max {
                    cell.max = up_mid;
                }
            }
            None => {
                self.cells.insert(
                    key,
                    FairCell {
                        fair: up_mid,
                        n: 1,
                        last_update_ms: now_ms,
                        min: up_mid,
                        max: up_mid,
                    },
                );
            }
        }
        true
    }

    /// Trusted fair UP price for the cell covering this observation, or
    /// None when the cell is missing, under-sampled, or stale.
    pub fn fair_up(&self, asset: Asset, delta_abs: f64, tte_s: f64, now_ms: i64) -> Option<f64> {
        let key = self.key(asset, delta_abs, tte_s)?;
        let cell = self.cells.get(&key)?;
        if cell.n < self.min_samples {
            return None;
        }
        if now_ms - cell.last_update_ms > self.max_age_ms {
            return None;
        }
        Some(cell.fair)
    }

    /// Complement of the trusted fair UP.
    pub fn fair_down(&self, asset: Asset, delta_abs: f64, tte_s: f64, now_ms: i64) -> Option<f64> {
        self.fair_up(asset, delta_abs, tte_s, now_ms).map(|f| 1.0 - f)
    }

    /// Raw cell access (diagnostics, checkpoint tests).
    pub fn cell(&self, asset: Asset, delta_abs: f64, tte_s: f64) -> Option<&FairCell> {
        self.key(asset, delta_abs, tte_s)
            .and_then(|k| self.cells.get(&k))
    }

    // ── Checkpoint ──
    //
    // Opaque string-keyed map: "ASSET|delta_idx|time_idx" → cell. Loaded
    // best-effort at startup; unparseable keys are skipped, not fatal.

    fn key_string(key: &CellKey) -> String {
        format!("{}|{}|{}", key.asset.label(), key.delta_idx, key.time_idx)
    }

    fn parse_key(s: &str) -> Option<CellKey> {
        let mut parts = s.split('|');
        let asset = Asset::from_symbol(parts.next()?)?;
        let delta_idx = parts.next()?.parse().ok()?;
        let time_idx = parts.next()?.parse().ok()?;
        Some(CellKey {
            asset,
            delta_idx,
            time_idx,
        })
    }

    pub fn save(&self, path: impl AsRef<Path>) -> anyhow::Result<()> {
        let map: HashMap<String, FairCell> = self
            .cells
            .iter()
            .map(|(k, v)| (Self::key_string(k), *v))
            .collect();
        let json = serde_json::to_string(&map).context("serialize fair surface")?;
        if let Some(parent) = path.as_ref().parent() {
            std::fs::create_dir_all(parent).ok();
        }
        std::fs::write(&path, json)
            .with_context(|| format!("write {}", path.as_ref().display()))?;
        Ok(())
    }

    /// Load a checkpoint into this surface. Returns the number of cells
    /// restored.
    pub fn load(&mut self, path: impl AsRef<Path>) -> anyhow::Result<usize> {
        let json = std::fs::read_to_string(&path)
            .with_context(|| format!("read {}", path.as_ref().display()))?;
        let map: HashMap<String, FairCell> =
            serde_json::from_str(&json).context("parse fair surface checkpoint")?;
        let mut restored = 0;
        for (k, cell) in map {
            if let Some(key) = Self::parse_key(&k) {
                self.cells.insert(key, cell);
                restored += 1;
            }
        }
        Ok(restored)
    }
}
