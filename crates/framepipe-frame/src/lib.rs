//! Length-prefixed message framing.
//!
//! Every message on the wire is a 4-byte big-endian payload length followed
//! by exactly that many payload bytes. Zero-length messages are not
//! representable.
//!
//! [`FramedMessageReader`] turns a byte stream back into messages, resuming
//! from the exact byte offset across short reads and would-block
//! suspensions. [`FrameWriter`] produces the wire format.

pub mod codec;
pub mod error;
pub mod reader;
pub mod writer;

pub use codec::{decode_message, encode_message, FrameConfig, DEFAULT_MAX_PAYLOAD, HEADER_SIZE};
#[cfg(feature = "async")]
pub use codec::LengthPrefixedCodec;
pub use error::{FrameError, Result};
pub use reader::{FramedMessageReader, ReadState};
pub use writer::FrameWriter;
