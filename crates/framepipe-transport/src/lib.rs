//! Byte-stream transport for framepipe.
//!
//! The lowest layer of the workspace: an ordered, reliable byte stream
//! ([`IpcStream`]) and a listener that hands them out
//! ([`UnixDomainSocket`]). Framing, pipes and sessions are all built on top.

pub mod error;
pub mod stream;

#[cfg(unix)]
pub mod uds;

pub use error::{Result, TransportError};
pub use stream::IpcStream;

#[cfg(unix)]
pub use uds::UnixDomainSocket;
