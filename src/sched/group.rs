use std::fmt;
use std::time::Instant;

use serde::{Deserialize, Serialize};

/// Where a group sits in its evolve/evaluate cycle. Exactly one status
/// holds at a time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum GroupStatus {
    /// Fully scored (or freshly loaded); awaiting a sequencer
    Ready,
    /// Handed to a sequencer for evolution
    BeingEvolved,
    /// Submitted with jobs needing scores; awaiting crunchers
    ReadyForEval,
    /// Every job dispatched at least once; scores still trickling in
    BeingEvaluated,
}

impl GroupStatus {
    pub fn as_i32(self) -> i32 {
        match self {
            GroupStatus::Ready => 0,
            GroupStatus::BeingEvolved => 1,
            GroupStatus::ReadyForEval => 2,
            GroupStatus::BeingEvaluated => 3,
        }
    }

    pub fn from_i32(v: i32) -> Option<Self> {
        match v {
            0 => Some(GroupStatus::Ready),
            1 => Some(GroupStatus::BeingEvolved),
            2 => Some(GroupStatus::ReadyForEval),
            3 => Some(GroupStatus::BeingEvaluated),
            _ => None,
        }
    }
}

impl fmt::Display for GroupStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            GroupStatus::Ready => "ready",
            GroupStatus::BeingEvolved => "being-evolved",
            GroupStatus::ReadyForEval => "ready-for-eval",
            GroupStatus::BeingEvaluated => "being-evaluated",
        };
        f.write_str(s)
    }
}

/// One job slot of the current generation. `data` and `score` are opaque.
#[derive(Debug, Clone)]
pub struct JobSlot {
    pub data: String,
    pub score: Option<String>,
    pub needs_score: bool,
}

/// Group metadata. Job payloads live beside it in the owning entry so they
/// can be paged out under low-memory mode without losing the bookkeeping.
#[derive(Debug, Clone)]
pub struct GroupRecord {
    pub id: i64,
    pub app_name: String,
    pub generation: i64,
    pub environment: String,
    /// Ship the environment to workers with every subgroup
    pub distribute_env: bool,
    pub status: GroupStatus,
    /// In-flight dispatch counter; selection tie-breaker
    pub counter: u32,
    pub last_dispatch: Option<Instant>,
    pub job_count: usize,
    /// Scores still missing this generation
    pub score_needed: usize,
    /// Protocol version of the submitting client
    pub version: String,
}

impl GroupRecord {
    /// Age of the last dispatch in whole seconds; `None` before any
    /// dispatch this cycle.
    pub fn dispatch_age_secs(&self, now: Instant) -> Option<u64> {
        self.last_dispatch
            .map(|t| now.saturating_duration_since(t).as_secs())
    }
}
