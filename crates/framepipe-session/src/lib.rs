//! Admission control for logical streams multiplexed on one session.
//!
//! [`should_create_incoming_stream`] is the pure decision. [`Session`] keeps
//! the open-stream bookkeeping around it and gives every admitted stream its
//! own data pipe, so stream payloads are flow-controlled independently.

pub mod error;
pub mod policy;
pub mod session;

pub use error::{Result, SessionError};
pub use policy::{
    should_create_incoming_stream, CloseReason, StreamAdmission, StreamPolicy,
    DEFAULT_MAX_OPEN_STREAMS,
};
pub use session::{Session, StreamId};
