use thiserror::Error;

use crate::protocol::wire;

#[derive(Error, Debug)]
pub enum DagsError {
    #[error("Group not found: {0}")]
    GroupNotFound(i64),

    #[error("Job {job_id} not found in group {group_id}")]
    JobNotFound { group_id: i64, job_id: i64 },

    #[error("No group available for dispatch")]
    NoGroupAvailable,

    #[error("Group {0} has no jobs awaiting evaluation")]
    JobsUnavailable(i64),

    #[error("Application mismatch: server runs {expected:?}, request names {got:?}")]
    ApplicationMismatch { expected: String, got: String },

    #[error("Invalid group submission: {0}")]
    InvalidGroup(String),

    #[error("Stale generation for group {group_id}: current {current}, request carried {got}")]
    StaleGeneration {
        group_id: i64,
        current: i64,
        got: i64,
    },

    #[error("Invalid client id: {0}")]
    InvalidClientId(i64),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Config error: {0}")]
    Config(String),

    #[error("Store error: {0}")]
    Store(#[from] sqlx::Error),

    #[error("Persisted schema invalid: {0}")]
    Schema(String),

    #[error("Serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl DagsError {
    /// Numeric code sent in the response envelope. Only the protocol
    /// boundary calls this; everything else works with the typed variants.
    pub fn wire_code(&self) -> i32 {
        match self {
            DagsError::GroupNotFound(_) => wire::GROUP_FETCH_FAILED,
            DagsError::JobNotFound { .. } => wire::JOBS_UNAVAILABLE,
            DagsError::NoGroupAvailable => wire::NO_GROUP_AVAILABLE,
            DagsError::JobsUnavailable(_) => wire::JOBS_UNAVAILABLE,
            DagsError::ApplicationMismatch { .. } => wire::UNKNOWN_APPLICATION,
            DagsError::InvalidGroup(_) => wire::BAD_GROUP_ATTRIBUTES,
            DagsError::StaleGeneration { .. } => wire::BAD_GROUP_ATTRIBUTES,
            DagsError::InvalidClientId(_) => wire::INVALID_CLIENT_ID,
            DagsError::Protocol(_) => wire::MALFORMED_MESSAGE,
            DagsError::InvalidRequest(_) => wire::INVALID_REQUEST,
            DagsError::Config(_) => wire::INVALID_REQUEST,
            DagsError::Store(_) => wire::GROUP_SUBMIT_FAILED,
            DagsError::Schema(_) => wire::INVALID_REQUEST,
            DagsError::Serde(_) => wire::MALFORMED_MESSAGE,
            DagsError::Io(_) => wire::MALFORMED_MESSAGE,
            DagsError::Internal(_) => wire::INVALID_REQUEST,
        }
    }
}

pub type Result<T> = std::result::Result<T, DagsError>;
