//! Framed transports, bounded data pipes and handle-carrying message pipes.
//!
//! # Crate Structure
//!
//! - [`transport`]: Unix domain socket byte streams
//! - [`frame`]: 4-byte length-prefixed framing and the resumable message reader
//! - [`pipe`]: Data pipes, message pipes, handles and signals
//! - [`session`]: Stream admission policy (behind `session` feature)

/// Re-export transport types.
pub mod transport {
    pub use framepipe_transport::*;
}

/// Re-export frame types.
pub mod frame {
    pub use framepipe_frame::*;
}

/// Re-export pipe types.
pub mod pipe {
    pub use framepipe_pipe::*;
}

/// Re-export session types (requires `session` feature).
#[cfg(feature = "session")]
pub mod session {
    pub use framepipe_session::*;
}
