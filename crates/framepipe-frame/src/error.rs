/// Errors raised while framing or unframing messages.
#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    /// A header announced a length of zero or one larger than the buffer
    /// the caller supplied.
    #[error("invalid message size {size} (buffer capacity {capacity})")]
    InvalidMessageSize { size: usize, capacity: usize },

    /// An outgoing payload exceeds the configured maximum.
    #[error("payload too large ({size} bytes, max {max})")]
    PayloadTooLarge { size: usize, max: usize },

    /// Zero-length payloads cannot be framed.
    #[error("empty payload cannot be framed")]
    EmptyPayload,

    /// The caller supplied a payload buffer with no capacity.
    #[error("payload buffer has zero capacity")]
    EmptyBuffer,

    /// A read was started while another one is still outstanding.
    #[error("a message read is already in progress")]
    ReadInProgress,

    /// A read was resumed but none is outstanding.
    #[error("no message read is in progress")]
    NoReadInProgress,

    /// The stream has no data right now; the read keeps its progress and
    /// can be resumed.
    #[error("stream would block")]
    WouldBlock,

    /// The underlying stream failed.
    #[error("transport error: {0}")]
    Io(#[from] std::io::Error),

    /// The stream ended, possibly in the middle of a message.
    #[error("connection closed")]
    ConnectionClosed,
}

impl FrameError {
    /// True for failures of the underlying stream (as opposed to protocol
    /// or usage errors).
    pub fn is_transport(&self) -> bool {
        matches!(self, FrameError::Io(_) | FrameError::ConnectionClosed)
    }
}

impl From<framepipe_transport::TransportError> for FrameError {
    fn from(err: framepipe_transport::TransportError) -> Self {
        FrameError::Io(err.into_io())
    }
}

pub type Result<T> = std::result::Result<T, FrameError>;
