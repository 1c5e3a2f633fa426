//! In-process pipes built over framepipe streams.
//!
//! Two primitives live here:
//!
//! - [`DataPipe`]: a bounded, unidirectional byte channel with copying and
//!   two-phase (zero-copy) access on both ends.
//! - [`MessagePipe`]: a bidirectional channel of discrete messages that can
//!   carry [`Handle`]s, including other pipe endpoints, and can itself be
//!   serialized for transfer through a [`Broker`].
//!
//! Neither blocks. Endpoints expose [`SignalsState`] for the caller's own
//! wait loop; with the `async` feature both kinds of endpoint can also be
//! awaited directly.

pub mod broker;
pub mod config;
pub mod data_pipe;
pub mod error;
pub mod handle;
pub mod message_pipe;
pub mod raw_channel;
mod ring;
mod serialize;
pub mod signals;

pub use broker::{Broker, InMemoryBroker, Token, Transferable};
pub use config::Configuration;
pub use data_pipe::{Consumer, DataPipe, DataPipeOptions, Producer, Transfer};
pub use error::{ErrorKind, PipeError, Result};
pub use handle::{Handle, Message};
pub use message_pipe::{
    MessagePipe, MessageSize, PipeId, ReadFlags, SerializeEstimate, SerializedEndpoint, Side,
};
pub use raw_channel::{
    ChannelError, ChannelEvent, Doorbell, InProcessChannel, RawChannel, StreamChannel,
    WriteRejected,
};
pub use signals::{Signals, SignalsState};
