use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{DagsError, Result};

/// Listener and concurrency limits.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerSection {
    /// TCP port the scheduler listens on
    pub port: u16,
    /// Maximum simultaneously open client connections
    pub max_connections: usize,
    /// Maximum handlers running concurrently (connections beyond this wait)
    pub max_workers: usize,
    /// Console verbosity, 0 (quiet) through 4 (trace)
    pub verbosity: u8,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            port: 9123,
            max_connections: 25,
            max_workers: 6,
            verbosity: 2,
        }
    }
}

/// Load-balancing and soft-lease tuning.
///
/// `wait_fraction` scales `ideal_contact_interval_secs` into the soft-lease
/// expiry: work dispatched longer ago than the product is eligible for
/// redispatch. A fraction of 0 disables redispatch entirely.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BalanceSection {
    /// Adapt batch sizes to observed client throughput
    pub enabled: bool,
    /// Batch size for clients with no throughput history
    pub default_batch_size: usize,
    /// Target seconds between contacts from one client
    pub ideal_contact_interval_secs: u64,
    /// Soft-lease expiry as a multiple of the ideal interval
    pub wait_fraction: f64,
    /// Number of throughput samples kept per client
    pub history_size: usize,
    /// Per-slot weights, newest sample first; must sum to 1
    pub weights: Vec<f64>,
}

impl Default for BalanceSection {
    fn default() -> Self {
        Self {
            enabled: false,
            default_batch_size: 100,
            ideal_contact_interval_secs: 60,
            wait_fraction: 2.0,
            history_size: 5,
            weights: vec![0.2; 5],
        }
    }
}

/// Persistence cadence.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreSection {
    /// SQLite database path
    pub db_path: String,
    /// Flush a group's fresh scores once they reach this percent of its
    /// jobs; 0 flushes eagerly, 100 only on full completion
    pub sync_percent: u8,
    /// Rewrite the whole group durably on each submission
    pub group_sync: bool,
    /// Keep only one group's jobs resident, paging others from the store
    pub memory_short: bool,
}

impl Default for StoreSection {
    fn default() -> Self {
        Self {
            db_path: "universe.db".to_string(),
            sync_percent: 100,
            group_sync: true,
            memory_short: false,
        }
    }
}

/// Per-request-class zlib levels. 0–9, or -1 to mirror whatever level the
/// client asked for.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CompressionSection {
    pub group_level: i32,
    pub subgroup_level: i32,
}

impl Default for CompressionSection {
    fn default() -> Self {
        Self {
            group_level: -1,
            subgroup_level: -1,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerSection,
    pub balance: BalanceSection,
    pub store: StoreSection,
    pub compression: CompressionSection,
}

impl Config {
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| DagsError::Config(format!("cannot read {}: {e}", path.display())))?;
        let cfg: Config = toml::from_str(&raw)
            .map_err(|e| DagsError::Config(format!("cannot parse {}: {e}", path.display())))?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Write the default configuration to `path`, with every field present.
    pub fn dump_default(path: &Path) -> Result<()> {
        let rendered = toml::to_string_pretty(&Config::default())
            .map_err(|e| DagsError::Config(e.to_string()))?;
        std::fs::write(path, rendered)?;
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.balance.history_size == 0 {
            return Err(DagsError::Config("balance.history_size must be > 0".into()));
        }
        if self.balance.weights.len() != self.balance.history_size {
            return Err(DagsError::Config(format!(
                "balance.weights has {} entries, history_size is {}",
                self.balance.weights.len(),
                self.balance.history_size
            )));
        }
        let sum: f64 = self.balance.weights.iter().sum();
        if (sum - 1.0).abs() > 1e-6 {
            return Err(DagsError::Config(format!(
                "balance.weights must sum to 1, got {sum}"
            )));
        }
        if self.balance.wait_fraction < 0.0 {
            return Err(DagsError::Config("balance.wait_fraction must be >= 0".into()));
        }
        if self.store.sync_percent > 100 {
            return Err(DagsError::Config("store.sync_percent must be <= 100".into()));
        }
        for (name, level) in [
            ("compression.group_level", self.compression.group_level),
            ("compression.subgroup_level", self.compression.subgroup_level),
        ] {
            if !(-1..=9).contains(&level) {
                return Err(DagsError::Config(format!("{name} must be in -1..=9")));
            }
        }
        if self.store.memory_short && self.store.db_path.is_empty() {
            return Err(DagsError::Config(
                "store.memory_short requires store.db_path".into(),
            ));
        }
        if !self.store.group_sync && self.store.sync_percent < 100 {
            tracing::warn!(
                sync_percent = self.store.sync_percent,
                "group_sync disabled with partial score sync; a crash can lose recent scores"
            );
        }
        Ok(())
    }

    /// Soft-lease expiry in seconds; `None` when redispatch is disabled.
    pub fn lease_secs(&self) -> Option<u64> {
        if self.balance.wait_fraction == 0.0 {
            None
        } else {
            Some((self.balance.wait_fraction * self.balance.ideal_contact_interval_secs as f64) as u64)
        }
    }
}
