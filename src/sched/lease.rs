use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

/// Tracks when each outstanding job was last handed out. Expiry is lazy:
/// nothing fires on its own, later dispatch requests call [`take_expired`]
/// and pick up whatever went stale.
///
/// A job re-stamped after a redispatch leaves its old queue entry behind;
/// entries are validated against the stamp table when popped, so stale
/// duplicates cost one comparison each.
///
/// [`take_expired`]: DispatchLedger::take_expired
#[derive(Debug, Default)]
pub struct DispatchLedger {
    queue: VecDeque<(i64, Instant)>,
    stamps: HashMap<i64, Instant>,
}

impl DispatchLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record that `job_id` was dispatched at `now`. Overwrites any earlier
    /// stamp for the same job.
    pub fn stamp(&mut self, job_id: i64, now: Instant) {
        self.queue.push_back((job_id, now));
        self.stamps.insert(job_id, now);
    }

    /// Forget a job entirely (it was scored and will not be redispatched).
    pub fn settle(&mut self, job_id: i64) {
        self.stamps.remove(&job_id);
    }

    /// Pop up to `limit` jobs whose current stamp is older than `wait`;
    /// anything past the limit stays queued for the next caller. The caller
    /// re-stamps the ones it actually redispatches; jobs scored in the
    /// meantime should have been settled and never show up here.
    pub fn take_expired(&mut self, now: Instant, wait: Duration, limit: usize) -> Vec<i64> {
        let mut expired = Vec::new();
        while expired.len() < limit {
            let Some(&(job_id, stamped_at)) = self.queue.front() else {
                break;
            };
            if now.saturating_duration_since(stamped_at) < wait {
                break;
            }
            self.queue.pop_front();
            match self.stamps.get(&job_id) {
                // Entry matches the live stamp: genuinely overdue.
                Some(&live) if live == stamped_at => {
                    self.stamps.remove(&job_id);
                    expired.push(job_id);
                }
                // Re-stamped later or already settled: stale entry.
                _ => {}
            }
        }
        expired
    }

    pub fn clear(&mut self) {
        self.queue.clear();
        self.stamps.clear();
    }

    /// Jobs currently out on a lease.
    pub fn outstanding(&self) -> usize {
        self.stamps.len()
    }
}
