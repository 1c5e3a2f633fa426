use framepipe_pipe::PipeError;

use crate::policy::CloseReason;

/// Errors that can occur in session operations.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    /// The peer tried to open a stream the policy refuses. The session is
    /// closed with the same reason.
    #[error("incoming stream {stream_id} rejected: {reason}")]
    Rejected { stream_id: u64, reason: CloseReason },

    /// The session was already closed by an earlier rejection.
    #[error("session closed: {0}")]
    Closed(CloseReason),

    /// A locally-initiated stream would exceed the open-stream limit. The
    /// session stays open.
    #[error("too many open streams ({open} of {max})")]
    OutgoingLimit { open: usize, max: usize },

    #[error("stream {0} is already open")]
    DuplicateStream(u64),

    #[error("stream {0} is not open")]
    UnknownStream(u64),

    /// Error from the stream's data pipe.
    #[error("pipe error: {0}")]
    Pipe(#[from] PipeError),
}

pub type Result<T> = std::result::Result<T, SessionError>;
