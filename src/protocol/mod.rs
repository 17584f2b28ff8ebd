pub mod codec;
pub mod message;

/// Numeric codes carried in the envelope's `code` field. Negative values
/// are errors; the three positive values are in-band sentinels.
pub mod wire {
    pub const NO_GROUP_AVAILABLE: i32 = -17;
    pub const SCORE_SUBMIT_FAILED: i32 = -16;
    pub const GROUP_SUBMIT_FAILED: i32 = -15;
    pub const STATE_QUERY_FAILED: i32 = -14;
    pub const UNKNOWN_APPLICATION: i32 = -13;
    pub const CLIENT_REGISTRATION_FAILED: i32 = -12;
    pub const ENVIRONMENT_FETCH_FAILED: i32 = -11;
    pub const SUBGROUP_FETCH_FAILED: i32 = -10;
    pub const GROUP_FETCH_FAILED: i32 = -9;
    pub const GROUP_ALREADY_EXISTS: i32 = -8;
    pub const INVALID_CLIENT_ID: i32 = -7;
    pub const JOBS_UNAVAILABLE: i32 = -6;
    pub const BAD_SUBGROUP_ATTRIBUTES: i32 = -5;
    pub const BAD_GROUP_ATTRIBUTES: i32 = -4;
    pub const BAD_REQUEST_ATTRIBUTES: i32 = -3;
    pub const MALFORMED_MESSAGE: i32 = -2;
    pub const INVALID_REQUEST: i32 = -1;

    /// Exchange succeeded; both halves of a two-half request ran.
    pub const NO_ERROR: i32 = 1;
    /// Request side: the caller has nothing to upload, skip the receive half.
    pub const NOTHING_TO_SEND: i32 = 2;
    /// Request side: the caller wants nothing back, skip the send half.
    pub const NOTHING_TO_RECEIVE: i32 = 3;
}
