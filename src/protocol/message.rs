use std::fmt;

use serde::{Deserialize, Serialize};

use crate::protocol::wire;

/// What the client is asking for. One kind per exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RequestKind {
    /// Submit and/or fetch a whole group (sequencer traffic)
    Group,
    /// Submit scores and/or fetch a subgroup (cruncher traffic)
    Jobs,
    /// Abandon an unfinished batch, returning unscored job ids
    Reseed,
    /// Read-only administrative query
    Monitor,
    /// Operator full group replacement
    Terminate,
    /// Release a group taken for evolution without resubmitting it
    Quit,
    /// Application name and group count
    State,
    /// Replace a group's shared environment blob
    SetEnv,
}

impl fmt::Display for RequestKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RequestKind::Group => "group",
            RequestKind::Jobs => "jobs",
            RequestKind::Reseed => "reseed",
            RequestKind::Monitor => "monitor",
            RequestKind::Terminate => "terminate",
            RequestKind::Quit => "quit",
            RequestKind::State => "state",
            RequestKind::SetEnv => "set-env",
        };
        f.write_str(s)
    }
}

/// One job as carried on the wire. `data` and `score` are opaque to the
/// scheduler.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobPayload {
    pub id: i64,
    /// The caller wants a score computed for this job
    pub evaluate: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub score: Option<String>,
}

/// A full group: shared environment plus every job of the current
/// generation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupMessage {
    pub group_id: i64,
    pub generation: i64,
    pub environment: String,
    /// Ship the environment to workers alongside each subgroup
    pub distribute_env: bool,
    pub jobs: Vec<JobPayload>,
}

/// The slice of one group dispatched to one client in one exchange.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubGroupMessage {
    pub group_id: i64,
    pub generation: i64,
    /// Present only if the group's distribute-env flag is set
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub environment: Option<String>,
    pub jobs: Vec<JobPayload>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum MonitorQuery {
    /// Every client's distribution record
    DistributionList,
    /// One client's distribution record
    Distribution,
    /// Every group's environment blob
    EnvironmentList,
    /// One group's environment blob
    Environment,
    /// One group's full contents
    Group,
    /// Status summary of every group
    States,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MonitorMessage {
    pub query: MonitorQuery,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<i64>,
}

/// The payload variants an envelope can wrap. Exactly one per message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum Body {
    None,
    Group(GroupMessage),
    SubGroup(SubGroupMessage),
    Monitor(MonitorMessage),
    /// Free-form text: monitor replies, state replies, error detail
    Text { text: String },
}

impl Body {
    pub fn text(s: impl Into<String>) -> Self {
        Body::Text { text: s.into() }
    }
}

/// One framed wire message. Responses mirror the request envelope with
/// `code` rewritten.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    /// Server-assigned client id; -1 means not yet registered
    pub client_id: i64,
    pub kind: RequestKind,
    /// Request side: NO_ERROR, NOTHING_TO_SEND or NOTHING_TO_RECEIVE.
    /// Response side: NO_ERROR or a negative error code.
    pub code: i32,
    pub app_name: String,
    pub version: String,
    /// zlib level the peer would like applied to the response, 0-9
    pub compression: i32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group_id: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub generation: Option<i64>,
    pub body: Body,
}

impl Envelope {
    /// True when the request carries something for the server to ingest.
    pub fn has_upload(&self) -> bool {
        self.code != wire::NOTHING_TO_SEND
    }

    /// True when the caller expects a payload back.
    pub fn wants_download(&self) -> bool {
        self.code != wire::NOTHING_TO_RECEIVE
    }

    /// Response mirroring this request, carrying `code` and `body`.
    pub fn reply(&self, code: i32, body: Body) -> Envelope {
        Envelope {
            client_id: self.client_id,
            kind: self.kind,
            code,
            app_name: self.app_name.clone(),
            version: self.version.clone(),
            compression: self.compression,
            group_id: self.group_id,
            generation: self.generation,
            body,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_request() -> Envelope {
        Envelope {
            client_id: 4,
            kind: RequestKind::Jobs,
            code: wire::NO_ERROR,
            app_name: "onemax".to_string(),
            version: "0.1.0".to_string(),
            compression: 0,
            group_id: Some(0),
            generation: Some(2),
            body: Body::None,
        }
    }

    #[test]
    fn sentinels_gate_halves() {
        let mut req = sample_request();
        assert!(req.has_upload());
        assert!(req.wants_download());

        req.code = wire::NOTHING_TO_SEND;
        assert!(!req.has_upload());
        assert!(req.wants_download());

        req.code = wire::NOTHING_TO_RECEIVE;
        assert!(req.has_upload());
        assert!(!req.wants_download());
    }

    #[test]
    fn reply_mirrors_request() {
        let req = sample_request();
        let resp = req.reply(wire::NO_ERROR, Body::text("ok"));
        assert_eq!(resp.client_id, req.client_id);
        assert_eq!(resp.kind, RequestKind::Jobs);
        assert_eq!(resp.group_id, Some(0));
        assert_eq!(resp.body, Body::text("ok"));
    }

    #[test]
    fn request_kind_display() {
        assert_eq!(RequestKind::SetEnv.to_string(), "set-env");
        assert_eq!(RequestKind::Jobs.to_string(), "jobs");
    }

    #[test]
    fn envelope_json_round_trip() {
        let req = Envelope {
            body: Body::Group(GroupMessage {
                group_id: 0,
                generation: 1,
                environment: "env".to_string(),
                distribute_env: true,
                jobs: vec![JobPayload {
                    id: 0,
                    evaluate: true,
                    data: Some("payload".to_string()),
                    score: None,
                }],
            }),
            ..sample_request()
        };
        let raw = serde_json::to_vec(&req).unwrap();
        let back: Envelope = serde_json::from_slice(&raw).unwrap();
        assert_eq!(back, req);
    }
}
