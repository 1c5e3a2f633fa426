use std::fmt;

use bytes::Bytes;

use crate::data_pipe::{Consumer, Producer};
use crate::message_pipe::{MessagePipe, PipeId};

/// A capability that can ride along with a message.
///
/// Attaching a handle to a successful `write_message` moves it to the
/// receiving endpoint; the sender keeps nothing.
pub enum Handle {
    MessagePipe(MessagePipe),
    Producer(Producer),
    Consumer(Consumer),
    #[cfg(unix)]
    Platform(std::os::fd::OwnedFd),
}

impl Handle {
    pub fn kind_name(&self) -> &'static str {
        match self {
            Handle::MessagePipe(_) => "message_pipe",
            Handle::Producer(_) => "data_pipe_producer",
            Handle::Consumer(_) => "data_pipe_consumer",
            #[cfg(unix)]
            Handle::Platform(_) => "platform",
        }
    }

    pub(crate) fn pipe_id(&self) -> Option<PipeId> {
        match self {
            Handle::MessagePipe(pipe) => Some(pipe.id()),
            _ => None,
        }
    }

    pub fn into_message_pipe(self) -> Option<MessagePipe> {
        match self {
            Handle::MessagePipe(pipe) => Some(pipe),
            _ => None,
        }
    }

    pub fn into_producer(self) -> Option<Producer> {
        match self {
            Handle::Producer(producer) => Some(producer),
            _ => None,
        }
    }

    pub fn into_consumer(self) -> Option<Consumer> {
        match self {
            Handle::Consumer(consumer) => Some(consumer),
            _ => None,
        }
    }
}

impl From<MessagePipe> for Handle {
    fn from(pipe: MessagePipe) -> Self {
        Handle::MessagePipe(pipe)
    }
}

impl From<Producer> for Handle {
    fn from(producer: Producer) -> Self {
        Handle::Producer(producer)
    }
}

impl From<Consumer> for Handle {
    fn from(consumer: Consumer) -> Self {
        Handle::Consumer(consumer)
    }
}

#[cfg(unix)]
impl From<std::os::fd::OwnedFd> for Handle {
    fn from(fd: std::os::fd::OwnedFd) -> Self {
        Handle::Platform(fd)
    }
}

impl fmt::Debug for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Handle::MessagePipe(pipe) => f.debug_tuple("MessagePipe").field(pipe).finish(),
            Handle::Producer(producer) => f.debug_tuple("Producer").field(producer).finish(),
            Handle::Consumer(consumer) => f.debug_tuple("Consumer").field(consumer).finish(),
            #[cfg(unix)]
            Handle::Platform(fd) => f.debug_tuple("Platform").field(fd).finish(),
        }
    }
}

/// A discrete message: opaque bytes plus attached handles.
#[derive(Debug, Default)]
pub struct Message {
    pub bytes: Bytes,
    pub handles: Vec<Handle>,
}

impl Message {
    pub fn new(bytes: impl Into<Bytes>) -> Self {
        Self {
            bytes: bytes.into(),
            handles: Vec::new(),
        }
    }

    pub fn with_handles(bytes: impl Into<Bytes>, handles: Vec<Handle>) -> Self {
        Self {
            bytes: bytes.into(),
            handles,
        }
    }

    pub fn num_bytes(&self) -> usize {
        self.bytes.len()
    }

    pub fn num_handles(&self) -> usize {
        self.handles.len()
    }
}
