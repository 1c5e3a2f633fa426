use std::fmt;

use serde::{Deserialize, Serialize};

/// Default cap on concurrently open streams per session.
pub const DEFAULT_MAX_OPEN_STREAMS: usize = 100;

/// Why a session must be closed after refusing a stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CloseReason {
    /// The peer used an id from the locally-initiated (even) space.
    InvalidStreamId,
    TooManyOpenStreams,
}

impl CloseReason {
    pub fn as_str(self) -> &'static str {
        match self {
            CloseReason::InvalidStreamId => "invalid_stream_id",
            CloseReason::TooManyOpenStreams => "too_many_open_streams",
        }
    }
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of an admission check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamAdmission {
    Accept,
    Reject(CloseReason),
}

impl StreamAdmission {
    pub fn is_accepted(self) -> bool {
        self == StreamAdmission::Accept
    }
}

/// Decide whether a peer-initiated stream may be created.
///
/// Peer-initiated ids are odd; even ids belong to this side. The id check
/// runs first, so a bad id is reported even when the session is also full.
pub fn should_create_incoming_stream(
    stream_id: u64,
    open_stream_count: usize,
    max_open_streams: usize,
) -> StreamAdmission {
    if stream_id % 2 == 0 {
        return StreamAdmission::Reject(CloseReason::InvalidStreamId);
    }
    if open_stream_count >= max_open_streams {
        return StreamAdmission::Reject(CloseReason::TooManyOpenStreams);
    }
    StreamAdmission::Accept
}

/// Per-session stream limits.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct StreamPolicy {
    pub max_open_streams: usize,
}

impl Default for StreamPolicy {
    fn default() -> Self {
        Self {
            max_open_streams: DEFAULT_MAX_OPEN_STREAMS,
        }
    }
}

impl StreamPolicy {
    pub fn new(max_open_streams: usize) -> Self {
        Self { max_open_streams }
    }

    pub fn admit(&self, stream_id: u64, open_stream_count: usize) -> StreamAdmission {
        should_create_incoming_stream(stream_id, open_stream_count, self.max_open_streams)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn even_id_is_invalid() {
        assert_eq!(
            should_create_incoming_stream(2, 0, 10),
            StreamAdmission::Reject(CloseReason::InvalidStreamId)
        );
        assert_eq!(
            should_create_incoming_stream(0, 0, 10),
            StreamAdmission::Reject(CloseReason::InvalidStreamId)
        );
    }

    #[test]
    fn full_session_rejects() {
        assert_eq!(
            should_create_incoming_stream(5, 10, 10),
            StreamAdmission::Reject(CloseReason::TooManyOpenStreams)
        );
        assert_eq!(
            should_create_incoming_stream(5, 11, 10),
            StreamAdmission::Reject(CloseReason::TooManyOpenStreams)
        );
    }

    #[test]
    fn below_limit_accepts() {
        assert!(should_create_incoming_stream(5, 9, 10).is_accepted());
        assert!(should_create_incoming_stream(1, 0, 1).is_accepted());
    }

    #[test]
    fn bad_id_wins_over_full_session() {
        assert_eq!(
            should_create_incoming_stream(4, 10, 10),
            StreamAdmission::Reject(CloseReason::InvalidStreamId)
        );
    }

    #[test]
    fn zero_limit_rejects_everything() {
        assert_eq!(
            StreamPolicy::new(0).admit(1, 0),
            StreamAdmission::Reject(CloseReason::TooManyOpenStreams)
        );
    }

    #[test]
    fn policy_from_json() {
        let policy: StreamPolicy = serde_json::from_str(r#"{"max_open_streams": 3}"#).unwrap();
        assert_eq!(policy, StreamPolicy::new(3));

        let policy: StreamPolicy = serde_json::from_str("{}").unwrap();
        assert_eq!(policy.max_open_streams, DEFAULT_MAX_OPEN_STREAMS);

        assert!(serde_json::from_str::<StreamPolicy>(r#"{"max_streams": 3}"#).is_err());
    }

    #[test]
    fn close_reason_names() {
        assert_eq!(CloseReason::InvalidStreamId.to_string(), "invalid_stream_id");
        assert_eq!(
            serde_json::to_string(&CloseReason::TooManyOpenStreams).unwrap(),
            "\"too_many_open_streams\""
        );
    }
}
