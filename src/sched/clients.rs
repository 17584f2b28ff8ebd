use std::collections::VecDeque;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::config::BalanceSection;
use crate::error::{DagsError, Result};
use crate::sched::balance;

/// Per-client throughput and contact statistics. Invalidated when the
/// client reseeds or disconnects abnormally; its id then becomes reusable.
#[derive(Debug, Clone)]
pub struct Distribution {
    pub id: i64,
    pub addr: String,
    pub first_contact: DateTime<Utc>,
    pub last_contact: DateTime<Utc>,
    /// Jobs-per-second samples, newest first, bounded by the history size
    pub samples: VecDeque<f64>,
    /// Batch size handed out on the last dispatch
    pub last_batch: usize,
    pub valid: bool,
}

/// What monitor queries see.
#[derive(Debug, Clone, Serialize)]
pub struct DistributionSnapshot {
    pub id: i64,
    pub addr: String,
    pub last_contact: DateTime<Utc>,
    pub samples: Vec<f64>,
    pub last_batch: usize,
    pub valid: bool,
}

impl Distribution {
    fn snapshot(&self) -> DistributionSnapshot {
        DistributionSnapshot {
            id: self.id,
            addr: self.addr.clone(),
            last_contact: self.last_contact,
            samples: self.samples.iter().copied().collect(),
            last_batch: self.last_batch,
            valid: self.valid,
        }
    }
}

/// Registry of every client the server has ever seen this run. Ids of
/// invalidated clients are handed back out before the table grows.
#[derive(Debug, Default)]
pub struct ClientTable {
    records: Vec<Distribution>,
    free_ids: VecDeque<i64>,
}

impl ClientTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a first-contact client, reusing an invalidated slot when
    /// one is available.
    pub fn register(&mut self, addr: &str) -> i64 {
        let now = Utc::now();
        if let Some(id) = self.free_ids.pop_front() {
            let rec = &mut self.records[id as usize];
            *rec = Distribution {
                id,
                addr: addr.to_string(),
                first_contact: now,
                last_contact: now,
                samples: VecDeque::new(),
                last_batch: 0,
                valid: true,
            };
            tracing::info!(client_id = id, addr, "client registered (reused id)");
            return id;
        }
        let id = self.records.len() as i64;
        self.records.push(Distribution {
            id,
            addr: addr.to_string(),
            first_contact: now,
            last_contact: now,
            samples: VecDeque::new(),
            last_batch: 0,
            valid: true,
        });
        tracing::info!(client_id = id, addr, "client registered");
        id
    }

    fn get_mut(&mut self, id: i64) -> Result<&mut Distribution> {
        if id < 0 {
            return Err(DagsError::InvalidClientId(id));
        }
        match self.records.get_mut(id as usize) {
            Some(rec) if rec.valid => Ok(rec),
            _ => Err(DagsError::InvalidClientId(id)),
        }
    }

    pub fn is_known(&self, id: i64) -> bool {
        id >= 0 && (id as usize) < self.records.len() && self.records[id as usize].valid
    }

    /// Fold a completed batch into the client's throughput ring. Elapsed
    /// time is floored at one second; a wall clock that went backwards
    /// drops the sample rather than recording a negative rate.
    pub fn record_contact(&mut self, id: i64, jobs_completed: usize, history: usize) -> Result<()> {
        let now = Utc::now();
        let rec = self.get_mut(id)?;
        let elapsed = (now - rec.last_contact).num_seconds();
        rec.last_contact = now;
        if elapsed < 0 {
            tracing::warn!(client_id = id, elapsed, "clock went backwards, sample dropped");
            return Ok(());
        }
        if jobs_completed == 0 {
            return Ok(());
        }
        let rate = jobs_completed as f64 / elapsed.max(1) as f64;
        rec.samples.push_front(rate);
        rec.samples.truncate(history);
        tracing::debug!(client_id = id, jobs_completed, rate, "throughput sample recorded");
        Ok(())
    }

    pub fn note_batch(&mut self, id: i64, size: usize) -> Result<()> {
        self.get_mut(id)?.last_batch = size;
        Ok(())
    }

    /// Batch size this client should be handed next.
    pub fn recommend(&self, id: i64, cfg: &BalanceSection) -> usize {
        if !cfg.enabled {
            return cfg.default_batch_size;
        }
        match self.records.get(id.max(0) as usize) {
            Some(rec) if rec.valid => balance::recommended_batch(
                &rec.samples,
                &cfg.weights,
                cfg.ideal_contact_interval_secs,
                cfg.default_batch_size,
            ),
            _ => cfg.default_batch_size,
        }
    }

    /// Drop a client; its id goes back on the free list.
    pub fn invalidate(&mut self, id: i64) -> Result<()> {
        let rec = self.get_mut(id)?;
        rec.valid = false;
        self.free_ids.push_back(id);
        tracing::info!(client_id = id, "client invalidated");
        Ok(())
    }

    pub fn snapshot(&self, id: i64) -> Result<DistributionSnapshot> {
        if id < 0 {
            return Err(DagsError::InvalidClientId(id));
        }
        match self.records.get(id as usize) {
            Some(rec) if rec.valid => Ok(rec.snapshot()),
            _ => Err(DagsError::InvalidClientId(id)),
        }
    }

    pub fn snapshot_all(&self) -> Vec<DistributionSnapshot> {
        self.records
            .iter()
            .filter(|r| r.valid)
            .map(Distribution::snapshot)
            .collect()
    }

    pub fn len(&self) -> usize {
        self.records.iter().filter(|r| r.valid).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
