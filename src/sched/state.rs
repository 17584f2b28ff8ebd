use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};

use serde::Serialize;

use crate::config::BalanceSection;
use crate::error::{DagsError, Result};
use crate::protocol::message::{GroupMessage, JobPayload, SubGroupMessage};
use crate::sched::clients::{ClientTable, DistributionSnapshot};
use crate::sched::group::{GroupRecord, GroupStatus, JobSlot};
use crate::sched::lease::DispatchLedger;

/// Everything the scheduler knows about one group, guarded by one lock.
#[derive(Debug)]
struct GroupEntry {
    meta: GroupRecord,
    /// Job payloads of the current generation; `None` while paged out
    /// under low-memory mode. All bookkeeping below stays resident.
    jobs: Option<Vec<JobSlot>>,
    /// Ids awaiting their first dispatch this cycle, FIFO
    need_score: VecDeque<i64>,
    /// Membership mirror of `need_score`
    in_queue: Vec<bool>,
    /// Score-received bitmap; the idempotence guard for upserts
    received: Vec<bool>,
    /// Jobs not yet handed out this cycle
    undispatched: usize,
    /// Scores recorded since the last durable flush
    fresh_scores: Vec<(i64, String)>,
    leases: DispatchLedger,
}

/// Result of a `record_scores` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScoreOutcome {
    /// Scores not previously seen; duplicates count zero
    pub newly_recorded: usize,
    /// Scores still missing after this call
    pub remaining: usize,
    /// This call completed the generation and queued the group as Ready
    pub became_ready: bool,
}

/// One line of the monitor `states` summary.
#[derive(Debug, Clone, Serialize)]
pub struct GroupStateSummary {
    pub group_id: i64,
    pub status: GroupStatus,
    pub generation: i64,
    pub job_count: usize,
    pub score_needed: usize,
    pub counter: u32,
}

/// The single in-memory source of truth for groups, jobs, scores and
/// client statistics. One instance per server process; handlers share it
/// behind an `Arc`.
///
/// Locking: each group entry carries its own mutex; the ready FIFO and the
/// client table are independent locks. No lock is ever held across another
/// entry's lock or across I/O, so there is no ordering to get wrong.
#[derive(Debug)]
pub struct SchedulingState {
    groups: RwLock<HashMap<i64, Arc<Mutex<GroupEntry>>>>,
    /// Groups that turned Ready, oldest first; O(1) wake-up for sequencers
    ready: Mutex<VecDeque<i64>>,
    clients: Mutex<ClientTable>,
    /// Application this server instance is dedicated to; learned from the
    /// first submission or the startup load
    app_name: RwLock<Option<String>>,
    low_memory: bool,
    /// Group whose jobs are resident under low-memory mode
    resident: Mutex<Option<i64>>,
}

impl SchedulingState {
    pub fn new(low_memory: bool) -> Self {
        Self {
            groups: RwLock::new(HashMap::new()),
            ready: Mutex::new(VecDeque::new()),
            clients: Mutex::new(ClientTable::new()),
            app_name: RwLock::new(None),
            low_memory,
            resident: Mutex::new(None),
        }
    }

    fn entry(&self, group_id: i64) -> Result<Arc<Mutex<GroupEntry>>> {
        self.groups
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(&group_id)
            .cloned()
            .ok_or(DagsError::GroupNotFound(group_id))
    }

    fn lock_ready(&self) -> std::sync::MutexGuard<'_, VecDeque<i64>> {
        self.ready.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn lock_clients(&self) -> std::sync::MutexGuard<'_, ClientTable> {
        self.clients.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn app_name(&self) -> Option<String> {
        self.app_name
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn group_count(&self) -> usize {
        self.groups.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    fn learn_app_name(&self, name: &str) {
        let mut guard = self.app_name.write().unwrap_or_else(|e| e.into_inner());
        if guard.is_none() {
            *guard = Some(name.to_string());
        }
    }

    // ------------------------------------------------------------------
    // Group lifecycle
    // ------------------------------------------------------------------

    /// Create or wholesale-replace a group from a submission. A race
    /// between two submissions of the same id resolves last-writer-wins on
    /// generation; submitters are trusted.
    ///
    /// Submitted job ids are preserved: each job lands in the slot its id
    /// names, so ids must form exactly `0..job_count` in any order.
    pub fn submit_group(&self, msg: &GroupMessage, app_name: &str, version: &str) -> Result<()> {
        self.learn_app_name(app_name);

        let job_count = msg.jobs.len();
        let mut slots: Vec<Option<JobSlot>> = (0..job_count).map(|_| None).collect();
        for job in &msg.jobs {
            let idx = usize::try_from(job.id)
                .ok()
                .filter(|&i| i < job_count)
                .ok_or_else(|| {
                    DagsError::InvalidGroup(format!(
                        "group {}: job id {} outside 0..{job_count}",
                        msg.group_id, job.id
                    ))
                })?;
            if slots[idx].is_some() {
                return Err(DagsError::InvalidGroup(format!(
                    "group {}: duplicate job id {}",
                    msg.group_id, job.id
                )));
            }
            slots[idx] = Some(JobSlot {
                data: job.data.clone().unwrap_or_default(),
                score: job.score.clone(),
                needs_score: job.evaluate && job.score.is_none(),
            });
        }
        // job_count distinct in-range ids fill every slot.
        let mut jobs = Vec::with_capacity(job_count);
        for slot in slots {
            jobs.push(slot.ok_or_else(|| DagsError::Internal("unfilled job slot".into()))?);
        }

        let mut need_score = VecDeque::new();
        let mut in_queue = vec![false; job_count];
        let mut received = vec![false; job_count];
        for (idx, slot) in jobs.iter().enumerate() {
            if slot.needs_score {
                need_score.push_back(idx as i64);
                in_queue[idx] = true;
            } else {
                received[idx] = true;
            }
        }
        let score_needed = need_score.len();
        let status = if score_needed == 0 {
            GroupStatus::Ready
        } else {
            GroupStatus::ReadyForEval
        };

        let meta = GroupRecord {
            id: msg.group_id,
            app_name: app_name.to_string(),
            generation: msg.generation,
            environment: msg.environment.clone(),
            distribute_env: msg.distribute_env,
            status,
            counter: 0,
            last_dispatch: None,
            job_count,
            score_needed,
            version: version.to_string(),
        };
        let entry = GroupEntry {
            meta,
            jobs: Some(jobs),
            need_score,
            in_queue,
            received,
            undispatched: score_needed,
            fresh_scores: Vec::new(),
            leases: DispatchLedger::new(),
        };

        let replaced = {
            let mut groups = self.groups.write().unwrap_or_else(|e| e.into_inner());
            groups
                .insert(msg.group_id, Arc::new(Mutex::new(entry)))
                .is_some()
        };
        if self.low_memory {
            self.evict_resident_except(msg.group_id);
        }
        if status == GroupStatus::Ready {
            self.push_ready(msg.group_id);
        }
        tracing::info!(
            group_id = msg.group_id,
            generation = msg.generation,
            job_count,
            score_needed,
            replaced,
            "group submitted"
        );
        Ok(())
    }

    /// Install a group recovered from the store at startup. `need_ids`
    /// lists the jobs whose scores were not durably written; they re-enter
    /// the evaluation pool (the documented crash-recovery path).
    pub fn install_loaded_group(
        &self,
        meta: GroupRecord,
        jobs: Option<Vec<JobSlot>>,
        need_ids: &[i64],
    ) {
        let job_count = meta.job_count;
        let mut need_score = VecDeque::new();
        let mut in_queue = vec![false; job_count];
        let mut received = vec![true; job_count];
        for &id in need_ids {
            let idx = id as usize;
            if id < 0 || idx >= job_count || in_queue[idx] {
                continue;
            }
            need_score.push_back(id);
            in_queue[idx] = true;
            received[idx] = false;
        }
        let status = meta.status;
        let group_id = meta.id;
        let score_needed = need_score.len();
        self.learn_app_name(&meta.app_name);

        let entry = GroupEntry {
            meta: GroupRecord {
                score_needed,
                ..meta
            },
            jobs,
            need_score,
            in_queue,
            received,
            undispatched: score_needed,
            fresh_scores: Vec::new(),
            leases: DispatchLedger::new(),
        };
        self.groups
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(group_id, Arc::new(Mutex::new(entry)));
        if status == GroupStatus::Ready {
            self.push_ready(group_id);
        }
    }

    fn push_ready(&self, group_id: i64) {
        let mut fifo = self.lock_ready();
        if !fifo.contains(&group_id) {
            fifo.push_back(group_id);
        }
    }

    /// Lowest-generation Ready group, flipped to BeingEvolved with its
    /// counter bumped and dispatch time stamped. The ready FIFO is the
    /// fast path; a scan backstops groups loaded at startup.
    pub fn take_group_for_evolution(&self) -> Result<i64> {
        loop {
            let candidate = {
                let mut fifo = self.lock_ready();
                fifo.pop_front()
            };
            let group_id = match candidate {
                Some(id) => id,
                None => match self.scan_lowest_generation(GroupStatus::Ready) {
                    Some(id) => id,
                    None => return Err(DagsError::NoGroupAvailable),
                },
            };
            let entry = match self.entry(group_id) {
                Ok(e) => e,
                Err(_) => continue, // stale FIFO entry
            };
            let mut guard = entry.lock().unwrap_or_else(|e| e.into_inner());
            if guard.meta.status != GroupStatus::Ready {
                continue; // raced; try the next candidate
            }
            guard.meta.status = GroupStatus::BeingEvolved;
            guard.meta.counter += 1;
            guard.meta.last_dispatch = Some(Instant::now());
            tracing::debug!(group_id, generation = guard.meta.generation, "group taken for evolution");
            return Ok(group_id);
        }
    }

    fn scan_lowest_generation(&self, status: GroupStatus) -> Option<i64> {
        let entries: Vec<Arc<Mutex<GroupEntry>>> = self
            .groups
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .cloned()
            .collect();
        let mut best: Option<(i64, i64)> = None; // (generation, id)
        for entry in entries {
            let guard = entry.lock().unwrap_or_else(|e| e.into_inner());
            if guard.meta.status == status {
                let key = (guard.meta.generation, guard.meta.id);
                if best.map_or(true, |b| key < b) {
                    best = Some(key);
                }
            }
        }
        best.map(|(_, id)| id)
    }

    /// A group workers can evaluate: ReadyForEval first (lowest generation,
    /// then lowest counter), else a BeingEvaluated group whose soft lease
    /// expired. Bumps the counter and stamps the dispatch time. The pick is
    /// revalidated under the entry lock; a candidate that changed status
    /// in the window (a completing score, a racing dispatch) triggers a
    /// rescan.
    pub fn take_group_for_evaluation(&self, lease: Option<Duration>) -> Result<i64> {
        loop {
            let entries: Vec<Arc<Mutex<GroupEntry>>> = self
                .groups
                .read()
                .unwrap_or_else(|e| e.into_inner())
                .values()
                .cloned()
                .collect();
            let now = Instant::now();

            let mut fresh: Option<(i64, u32, i64)> = None; // (generation, counter, id)
            let mut overdue: Option<(i64, u32, i64)> = None;
            for entry in &entries {
                let guard = entry.lock().unwrap_or_else(|e| e.into_inner());
                let key = (guard.meta.generation, guard.meta.counter, guard.meta.id);
                match guard.meta.status {
                    GroupStatus::ReadyForEval => {
                        if fresh.map_or(true, |b| key < b) {
                            fresh = Some(key);
                        }
                    }
                    GroupStatus::BeingEvaluated => {
                        if let Some(wait) = lease {
                            let expired = guard
                                .meta
                                .dispatch_age_secs(now)
                                .map_or(true, |age| age > wait.as_secs());
                            if expired && overdue.map_or(true, |b| key < b) {
                                overdue = Some(key);
                            }
                        }
                    }
                    _ => {}
                }
            }

            let group_id = fresh
                .or(overdue)
                .map(|(_, _, id)| id)
                .ok_or(DagsError::NoGroupAvailable)?;
            let entry = self.entry(group_id)?;
            let mut guard = entry.lock().unwrap_or_else(|e| e.into_inner());
            let still_eligible = match guard.meta.status {
                GroupStatus::ReadyForEval => true,
                GroupStatus::BeingEvaluated => lease.map_or(false, |wait| {
                    guard
                        .meta
                        .dispatch_age_secs(now)
                        .map_or(true, |age| age > wait.as_secs())
                }),
                _ => false,
            };
            if !still_eligible {
                continue;
            }
            guard.meta.counter += 1;
            guard.meta.last_dispatch = Some(now);
            return Ok(group_id);
        }
    }

    /// Pop up to `n` jobs for evaluation. On a ReadyForEval group this
    /// drains the needs-score queue, flipping to BeingEvaluated once the
    /// last undispatched job leaves. On a BeingEvaluated group it
    /// re-dispatches jobs whose lease expired (when redispatch is enabled).
    pub fn take_jobs_for_evaluation(
        &self,
        group_id: i64,
        n: usize,
        lease: Option<Duration>,
    ) -> Result<SubGroupMessage> {
        let entry = self.entry(group_id)?;
        let mut guard = entry.lock().unwrap_or_else(|e| e.into_inner());
        let now = Instant::now();

        let picked: Vec<i64> = match guard.meta.status {
            GroupStatus::ReadyForEval => {
                let mut picked = Vec::with_capacity(n);
                while picked.len() < n {
                    let id = match guard.need_score.pop_front() {
                        Some(id) => id,
                        None => break,
                    };
                    guard.in_queue[id as usize] = false;
                    decrement(&mut guard.undispatched, group_id, "undispatched");
                    // Scored while queued (reseed-provided score): skip.
                    if guard.received[id as usize] {
                        continue;
                    }
                    guard.leases.stamp(id, now);
                    picked.push(id);
                }
                if guard.undispatched == 0 {
                    guard.meta.status = GroupStatus::BeingEvaluated;
                }
                picked
            }
            GroupStatus::BeingEvaluated => {
                let wait = lease.ok_or(DagsError::JobsUnavailable(group_id))?;
                let mut expired = guard.leases.take_expired(now, wait, n);
                expired.retain(|&id| !guard.received[id as usize]);
                for &id in &expired {
                    guard.leases.stamp(id, now);
                }
                if !expired.is_empty() {
                    tracing::info!(
                        group_id,
                        count = expired.len(),
                        "redispatching jobs past their soft lease"
                    );
                }
                expired
            }
            _ => return Err(DagsError::JobsUnavailable(group_id)),
        };

        if picked.is_empty() {
            return Err(DagsError::JobsUnavailable(group_id));
        }
        guard.meta.last_dispatch = Some(now);

        let jobs_table = guard
            .jobs
            .as_ref()
            .ok_or_else(|| DagsError::Internal(format!("group {group_id} jobs paged out")))?;
        let jobs = picked
            .iter()
            .map(|&id| JobPayload {
                id,
                evaluate: true,
                data: Some(jobs_table[id as usize].data.clone()),
                score: None,
            })
            .collect();
        Ok(SubGroupMessage {
            group_id,
            generation: guard.meta.generation,
            environment: guard
                .meta
                .distribute_env
                .then(|| guard.meta.environment.clone()),
            jobs,
        })
    }

    /// Idempotent score upsert. Already-scored jobs are skipped and count
    /// zero newly-recorded. Completing the generation flips the group to
    /// Ready and queues it exactly once.
    pub fn record_scores(
        &self,
        group_id: i64,
        generation: i64,
        scores: &[(i64, String)],
    ) -> Result<ScoreOutcome> {
        let entry = self.entry(group_id)?;
        let mut guard = entry.lock().unwrap_or_else(|e| e.into_inner());
        if generation != guard.meta.generation {
            return Err(DagsError::StaleGeneration {
                group_id,
                current: guard.meta.generation,
                got: generation,
            });
        }

        let mut newly = 0usize;
        for (job_id, score) in scores {
            let idx = *job_id as usize;
            if *job_id < 0 || idx >= guard.meta.job_count {
                return Err(DagsError::JobNotFound {
                    group_id,
                    job_id: *job_id,
                });
            }
            if guard.received[idx] {
                continue;
            }
            guard.received[idx] = true;
            if let Some(jobs) = guard.jobs.as_mut() {
                jobs[idx].score = Some(score.clone());
                jobs[idx].needs_score = false;
            }
            guard.fresh_scores.push((*job_id, score.clone()));
            guard.leases.settle(*job_id);
            decrement(&mut guard.meta.score_needed, group_id, "score_needed");
            newly += 1;
        }

        let mut became_ready = false;
        if guard.meta.score_needed == 0 && guard.meta.status != GroupStatus::Ready {
            guard.meta.status = GroupStatus::Ready;
            guard.meta.counter = 0;
            guard.meta.last_dispatch = None;
            guard.leases.clear();
            became_ready = true;
        }
        let remaining = guard.meta.score_needed;
        drop(guard);
        if became_ready {
            self.push_ready(group_id);
            tracing::info!(group_id, "group fully scored, queued as ready");
        }
        Ok(ScoreOutcome {
            newly_recorded: newly,
            remaining,
            became_ready,
        })
    }

    /// Return unscored job ids to the needs-evaluation pool. The caller's
    /// generation must still be current, checked under the entry lock so a
    /// resubmission racing the requeue cannot leak a dead generation's ids
    /// into the new one. The group drops back to ReadyForEval with a
    /// cleared dispatch clock so waiting workers pick it up at once.
    pub fn requeue_unscored(&self, group_id: i64, generation: i64, job_ids: &[i64]) -> Result<usize> {
        let entry = self.entry(group_id)?;
        let mut guard = entry.lock().unwrap_or_else(|e| e.into_inner());
        if generation != guard.meta.generation {
            return Err(DagsError::StaleGeneration {
                group_id,
                current: guard.meta.generation,
                got: generation,
            });
        }
        let mut requeued = 0usize;
        for &job_id in job_ids {
            let idx = job_id as usize;
            if job_id < 0 || idx >= guard.meta.job_count {
                return Err(DagsError::JobNotFound { group_id, job_id });
            }
            if guard.received[idx] || guard.in_queue[idx] {
                continue;
            }
            guard.need_score.push_back(job_id);
            guard.in_queue[idx] = true;
            guard.leases.settle(job_id);
            guard.undispatched += 1;
            requeued += 1;
        }
        if requeued > 0 {
            guard.meta.status = GroupStatus::ReadyForEval;
            guard.meta.counter = 0;
            guard.meta.last_dispatch = None;
            tracing::info!(group_id, requeued, "unscored jobs returned to the pool");
        }
        Ok(requeued)
    }

    /// Release a group taken for evolution without resubmitting it.
    pub fn release_group(&self, group_id: i64) -> Result<()> {
        let entry = self.entry(group_id)?;
        let mut guard = entry.lock().unwrap_or_else(|e| e.into_inner());
        if guard.meta.status != GroupStatus::BeingEvolved {
            return Err(DagsError::InvalidRequest(format!(
                "group {group_id} is {}, not being evolved",
                guard.meta.status
            )));
        }
        guard.meta.status = GroupStatus::Ready;
        guard.meta.counter = 0;
        guard.meta.last_dispatch = None;
        drop(guard);
        self.push_ready(group_id);
        Ok(())
    }

    /// Replace a group's shared environment. The caller's generation must
    /// match the stored one.
    pub fn set_environment(&self, group_id: i64, generation: i64, environment: &str) -> Result<()> {
        let entry = self.entry(group_id)?;
        let mut guard = entry.lock().unwrap_or_else(|e| e.into_inner());
        if generation != guard.meta.generation {
            return Err(DagsError::StaleGeneration {
                group_id,
                current: guard.meta.generation,
                got: generation,
            });
        }
        guard.meta.environment = environment.to_string();
        Ok(())
    }

    // ------------------------------------------------------------------
    // Snapshots & queries
    // ------------------------------------------------------------------

    /// Full wire-shaped view of a group, jobs included.
    pub fn group_message(&self, group_id: i64) -> Result<GroupMessage> {
        let entry = self.entry(group_id)?;
        let guard = entry.lock().unwrap_or_else(|e| e.into_inner());
        let jobs_table = guard
            .jobs
            .as_ref()
            .ok_or_else(|| DagsError::Internal(format!("group {group_id} jobs paged out")))?;
        let jobs = jobs_table
            .iter()
            .enumerate()
            .map(|(idx, slot)| JobPayload {
                id: idx as i64,
                evaluate: slot.needs_score,
                data: Some(slot.data.clone()),
                score: slot.score.clone(),
            })
            .collect();
        Ok(GroupMessage {
            group_id,
            generation: guard.meta.generation,
            environment: guard.meta.environment.clone(),
            distribute_env: guard.meta.distribute_env,
            jobs,
        })
    }

    pub fn group_record(&self, group_id: i64) -> Result<GroupRecord> {
        let entry = self.entry(group_id)?;
        let guard = entry.lock().unwrap_or_else(|e| e.into_inner());
        Ok(guard.meta.clone())
    }

    pub fn environment(&self, group_id: i64) -> Result<String> {
        Ok(self.group_record(group_id)?.environment)
    }

    pub fn environment_list(&self) -> Vec<(i64, String)> {
        let entries: Vec<Arc<Mutex<GroupEntry>>> = self
            .groups
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .cloned()
            .collect();
        let mut out: Vec<(i64, String)> = entries
            .iter()
            .map(|e| {
                let g = e.lock().unwrap_or_else(|p| p.into_inner());
                (g.meta.id, g.meta.environment.clone())
            })
            .collect();
        out.sort_by_key(|(id, _)| *id);
        out
    }

    pub fn states_summary(&self) -> Vec<GroupStateSummary> {
        let entries: Vec<Arc<Mutex<GroupEntry>>> = self
            .groups
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .cloned()
            .collect();
        let mut out: Vec<GroupStateSummary> = entries
            .iter()
            .map(|e| {
                let g = e.lock().unwrap_or_else(|p| p.into_inner());
                GroupStateSummary {
                    group_id: g.meta.id,
                    status: g.meta.status,
                    generation: g.meta.generation,
                    job_count: g.meta.job_count,
                    score_needed: g.meta.score_needed,
                    counter: g.meta.counter,
                }
            })
            .collect();
        out.sort_by_key(|s| s.group_id);
        out
    }

    /// Ready FIFO length, exposed for tests and the states summary.
    pub fn ready_queue_len(&self) -> usize {
        self.lock_ready().len()
    }

    // ------------------------------------------------------------------
    // Durable-sync support
    // ------------------------------------------------------------------

    /// Take a group's unsynced scores when the flush policy says so:
    /// `force`, eager sync (0 percent), the configured fraction reached, or
    /// nothing left to score. Returns an empty vec when the policy defers.
    pub fn drain_unsynced(
        &self,
        group_id: i64,
        sync_percent: u8,
        force: bool,
    ) -> Result<Vec<(i64, String)>> {
        let entry = self.entry(group_id)?;
        let mut guard = entry.lock().unwrap_or_else(|e| e.into_inner());
        if guard.fresh_scores.is_empty() {
            return Ok(Vec::new());
        }
        let due = force
            || sync_percent == 0
            || guard.meta.score_needed == 0
            || guard.fresh_scores.len() * 100 >= sync_percent as usize * guard.meta.job_count;
        if !due {
            return Ok(Vec::new());
        }
        Ok(std::mem::take(&mut guard.fresh_scores))
    }

    /// Every group's unsynced scores; used on shutdown.
    pub fn drain_all_unsynced(&self) -> Vec<(i64, Vec<(i64, String)>)> {
        let ids: Vec<i64> = self
            .groups
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .keys()
            .copied()
            .collect();
        let mut out = Vec::new();
        for id in ids {
            if let Ok(scores) = self.drain_unsynced(id, 0, true) {
                if !scores.is_empty() {
                    out.push((id, scores));
                }
            }
        }
        out
    }

    // ------------------------------------------------------------------
    // Low-memory paging
    // ------------------------------------------------------------------

    pub fn jobs_resident(&self, group_id: i64) -> Result<bool> {
        let entry = self.entry(group_id)?;
        let guard = entry.lock().unwrap_or_else(|e| e.into_inner());
        Ok(guard.jobs.is_some())
    }

    /// Install rows paged in from the store, evicting the previously
    /// resident group's payloads. In-memory truth (received bitmap,
    /// unflushed scores) overrides whatever the rows carried; the evicted
    /// group's unsynced scores stay behind for the regular flush policy.
    pub fn install_jobs(&self, group_id: i64, mut rows: Vec<JobSlot>) -> Result<()> {
        let entry = self.entry(group_id)?;
        if self.low_memory {
            self.evict_resident_except(group_id);
        }

        let mut guard = entry.lock().unwrap_or_else(|e| e.into_inner());
        if rows.len() != guard.meta.job_count {
            return Err(DagsError::Internal(format!(
                "group {group_id}: store has {} jobs, expected {}",
                rows.len(),
                guard.meta.job_count
            )));
        }
        for (idx, slot) in rows.iter_mut().enumerate() {
            slot.needs_score = !guard.received[idx];
            if slot.needs_score {
                slot.score = None;
            }
        }
        for (job_id, score) in &guard.fresh_scores {
            rows[*job_id as usize].score = Some(score.clone());
        }
        guard.jobs = Some(rows);
        Ok(())
    }

    /// Drop the resident group's job payloads and make `keep` resident.
    fn evict_resident_except(&self, keep: i64) {
        let previous = {
            let mut resident = self.resident.lock().unwrap_or_else(|e| e.into_inner());
            resident.replace(keep)
        };
        if let Some(prev) = previous.filter(|&p| p != keep) {
            if let Ok(prev_entry) = self.entry(prev) {
                let mut g = prev_entry.lock().unwrap_or_else(|e| e.into_inner());
                g.jobs = None;
                tracing::debug!(group_id = prev, "job payloads paged out");
            }
        }
    }

    // ------------------------------------------------------------------
    // Clients
    // ------------------------------------------------------------------

    pub fn register_client(&self, addr: &str) -> i64 {
        self.lock_clients().register(addr)
    }

    pub fn client_known(&self, id: i64) -> bool {
        self.lock_clients().is_known(id)
    }

    pub fn record_client_contact(&self, id: i64, jobs_completed: usize, history: usize) -> Result<()> {
        self.lock_clients().record_contact(id, jobs_completed, history)
    }

    pub fn note_client_batch(&self, id: i64, size: usize) -> Result<()> {
        self.lock_clients().note_batch(id, size)
    }

    pub fn recommend_batch(&self, id: i64, cfg: &BalanceSection) -> usize {
        self.lock_clients().recommend(id, cfg)
    }

    pub fn invalidate_client(&self, id: i64) -> Result<()> {
        self.lock_clients().invalidate(id)
    }

    pub fn client_snapshot(&self, id: i64) -> Result<DistributionSnapshot> {
        self.lock_clients().snapshot(id)
    }

    pub fn client_snapshots(&self) -> Vec<DistributionSnapshot> {
        self.lock_clients().snapshot_all()
    }
}

/// Clamp-at-zero decrement. Going below zero is an invariant violation:
/// log it loudly and keep serving.
fn decrement(value: &mut usize, group_id: i64, what: &str) {
    if *value == 0 {
        tracing::error!(group_id, counter = what, "invariant violation: counter would go negative");
        return;
    }
    *value -= 1;
}
