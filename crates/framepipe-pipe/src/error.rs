use framepipe_frame::FrameError;
use framepipe_transport::TransportError;

/// Coarse classification shared by every error in this crate.
///
/// `ShouldWait` is a retry signal rather than a failure: the endpoint is
/// healthy but has nothing to offer (or no room) right now.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    InvalidMessageSize,
    Transport,
    FailedPrecondition,
    OutOfRange,
    InvalidArgument,
    ResourceExhausted,
    ShouldWait,
}

/// Errors raised by data pipes and message pipes.
#[derive(Debug, thiserror::Error)]
pub enum PipeError {
    /// Malformed options, misaligned sizes, self-referential handles or
    /// undecodable serialized state.
    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),

    /// The endpoint (or its peer) is in a state that forbids the operation.
    #[error("failed precondition: {0}")]
    FailedPrecondition(&'static str),

    /// An all-or-none transfer cannot be satisfied.
    #[error("out of range: requested {requested} bytes, {available} available")]
    OutOfRange { requested: usize, available: usize },

    /// A configured limit was exceeded.
    #[error("resource exhausted: {what} ({size} > {limit})")]
    ResourceExhausted {
        what: &'static str,
        size: usize,
        limit: usize,
    },

    /// The caller's buffers cannot hold the next message.
    #[error("buffer too small for message of {num_bytes} bytes and {num_handles} handles")]
    BufferTooSmall { num_bytes: usize, num_handles: usize },

    /// Nothing to do yet; retry once the relevant signal is raised.
    #[error("should wait")]
    ShouldWait,

    /// Framing error on a stream-backed transport.
    #[error("frame error: {0}")]
    Frame(#[from] FrameError),

    /// Stream transport error.
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),
}

impl PipeError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            PipeError::InvalidArgument(_) => ErrorKind::InvalidArgument,
            PipeError::FailedPrecondition(_) => ErrorKind::FailedPrecondition,
            PipeError::OutOfRange { .. } => ErrorKind::OutOfRange,
            PipeError::ResourceExhausted { .. } | PipeError::BufferTooSmall { .. } => {
                ErrorKind::ResourceExhausted
            }
            PipeError::ShouldWait => ErrorKind::ShouldWait,
            PipeError::Frame(FrameError::InvalidMessageSize { .. }) => {
                ErrorKind::InvalidMessageSize
            }
            PipeError::Frame(FrameError::PayloadTooLarge { .. }) => ErrorKind::ResourceExhausted,
            PipeError::Frame(FrameError::EmptyPayload | FrameError::EmptyBuffer) => {
                ErrorKind::InvalidArgument
            }
            PipeError::Frame(FrameError::ReadInProgress | FrameError::NoReadInProgress) => {
                ErrorKind::FailedPrecondition
            }
            PipeError::Frame(FrameError::WouldBlock) => ErrorKind::ShouldWait,
            PipeError::Frame(_) | PipeError::Transport(_) => ErrorKind::Transport,
        }
    }

    pub fn is_should_wait(&self) -> bool {
        self.kind() == ErrorKind::ShouldWait
    }
}

pub type Result<T> = std::result::Result<T, PipeError>;
