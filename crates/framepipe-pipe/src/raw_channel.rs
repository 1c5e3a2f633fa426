//! Transports underneath a message pipe.
//!
//! A raw channel moves whole [`Message`]s to the peer endpoint and reports
//! what happened on the way in as [`ChannelEvent`]s, which the owning
//! endpoint drains and feeds through its state machine.

use std::net::Shutdown;
#[cfg(feature = "async")]
use std::sync::Arc;
use std::sync::mpsc::{self, Receiver, Sender, TryRecvError};
use std::thread::JoinHandle;

use framepipe_frame::{FrameConfig, FrameError, FrameWriter, FramedMessageReader};
use framepipe_transport::{IpcStream, TransportError};
use tracing::{debug, error, warn};

use crate::config::Configuration;
use crate::error::{PipeError, Result};
use crate::handle::Message;

/// Failures a transport can report.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelError {
    /// The read side failed.
    ReadBroken,
    /// The peer sent data that does not decode. Always fatal.
    ReadBadMessage,
    /// The read side stopped for an unclassified reason.
    ReadUnknown,
    /// A write failed; the write side is unusable from now on.
    Write,
}

/// Something that happened on a transport.
#[derive(Debug)]
pub enum ChannelEvent {
    /// A complete inbound message.
    Message(Message),
    /// The peer shut the transport down cleanly.
    Closed,
    Error(ChannelError),
}

/// A message the transport refused, handed back untouched.
#[derive(Debug)]
pub struct WriteRejected {
    pub error: PipeError,
    pub message: Message,
}

/// Rung by a transport whenever it has a new event to poll.
#[derive(Clone, Default)]
pub struct Doorbell {
    #[cfg(feature = "async")]
    notify: Arc<tokio::sync::Notify>,
}

impl Doorbell {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn ring(&self) {
        #[cfg(feature = "async")]
        self.notify.notify_waiters();
    }

    #[cfg(feature = "async")]
    pub(crate) fn notified(&self) -> tokio::sync::futures::Notified<'_> {
        self.notify.notified()
    }
}

/// A bidirectional message transport owned by one endpoint.
pub trait RawChannel: Send {
    /// Hand one message to the transport. A refused message is returned
    /// with its handles.
    fn write(&mut self, message: Message) -> std::result::Result<(), WriteRejected>;

    /// The next pending event, if any. Never blocks.
    fn poll_event(&mut self) -> Option<ChannelEvent>;

    /// Bell rung when `poll_event` has something new. Without one, async
    /// waiters fall back to polling.
    fn doorbell(&self) -> Option<Doorbell> {
        None
    }

    /// Reject messages this transport cannot carry.
    fn check_message(&self, _num_bytes: usize, _num_handles: usize) -> Result<()> {
        Ok(())
    }

    /// Stop the transport. The peer observes a close.
    fn shutdown(&mut self);
}

/// Channel between two endpoints in the same process.
///
/// Messages (handles included) move through a pair of `mpsc` queues, so
/// anything written while the peer is in transit waits for it.
pub struct InProcessChannel {
    tx: Option<Sender<Message>>,
    rx: Option<Receiver<Message>>,
    bell: Doorbell,
    peer_bell: Doorbell,
}

impl InProcessChannel {
    pub fn pair() -> (Self, Self) {
        let (a_tx, b_rx) = mpsc::channel();
        let (b_tx, a_rx) = mpsc::channel();
        let (a_bell, b_bell) = (Doorbell::new(), Doorbell::new());
        (
            Self {
                tx: Some(a_tx),
                rx: Some(a_rx),
                bell: a_bell.clone(),
                peer_bell: b_bell.clone(),
            },
            Self {
                tx: Some(b_tx),
                rx: Some(b_rx),
                bell: b_bell,
                peer_bell: a_bell,
            },
        )
    }
}

impl RawChannel for InProcessChannel {
    fn write(&mut self, message: Message) -> std::result::Result<(), WriteRejected> {
        let Some(tx) = self.tx.as_ref() else {
            return Err(WriteRejected {
                error: PipeError::FailedPrecondition("channel is shut down"),
                message,
            });
        };
        match tx.send(message) {
            Ok(()) => {
                self.peer_bell.ring();
                Ok(())
            }
            Err(mpsc::SendError(message)) => Err(WriteRejected {
                error: PipeError::FailedPrecondition("peer endpoint is gone"),
                message,
            }),
        }
    }

    fn poll_event(&mut self) -> Option<ChannelEvent> {
        match self.rx.as_ref()?.try_recv() {
            Ok(message) => Some(ChannelEvent::Message(message)),
            Err(TryRecvError::Empty) => None,
            Err(TryRecvError::Disconnected) => {
                self.rx = None;
                Some(ChannelEvent::Closed)
            }
        }
    }

    fn doorbell(&self) -> Option<Doorbell> {
        Some(self.bell.clone())
    }

    fn shutdown(&mut self) {
        self.rx = None;
        if self.tx.take().is_some() {
            self.peer_bell.ring();
        }
    }
}

impl Drop for InProcessChannel {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Channel over a connected byte stream.
///
/// Outbound messages are framed with a 4-byte length header. A background
/// thread runs a [`FramedMessageReader`] and forwards what it reads as
/// events. Handles and empty messages cannot be expressed on the wire.
pub struct StreamChannel {
    writer: FrameWriter<IpcStream>,
    control: IpcStream,
    events: Receiver<ChannelEvent>,
    reader: Option<JoinHandle<()>>,
    bell: Doorbell,
}

impl StreamChannel {
    pub fn new(stream: IpcStream, config: &Configuration) -> Result<Self> {
        let frame_config = FrameConfig {
            max_payload_size: config.max_message_num_bytes,
            ..FrameConfig::default()
        };
        let control = stream.try_clone()?;
        let mut reader = FramedMessageReader::with_config(stream.try_clone()?, frame_config.clone());
        let writer = FrameWriter::with_config(stream, frame_config);

        let (tx, events) = mpsc::channel();
        let bell = Doorbell::new();
        let reader_bell = bell.clone();
        let reader = std::thread::Builder::new()
            .name("framepipe-reader".to_string())
            .spawn(move || read_loop(&mut reader, &tx, &reader_bell))
            .map_err(TransportError::Io)?;

        debug!("stream channel started");
        Ok(Self {
            writer,
            control,
            events,
            reader: Some(reader),
            bell,
        })
    }
}

fn read_loop(
    reader: &mut FramedMessageReader<IpcStream>,
    tx: &Sender<ChannelEvent>,
    bell: &Doorbell,
) {
    loop {
        let event = match reader.next_message() {
            Ok(bytes) => ChannelEvent::Message(Message::new(bytes)),
            Err(FrameError::WouldBlock) => continue,
            Err(FrameError::ConnectionClosed) => {
                debug!("stream closed by peer");
                ChannelEvent::Closed
            }
            Err(err @ FrameError::InvalidMessageSize { .. }) => {
                warn!(%err, "malformed frame on stream");
                ChannelEvent::Error(ChannelError::ReadBadMessage)
            }
            Err(FrameError::Io(err)) => {
                warn!(%err, "stream read failed");
                ChannelEvent::Error(ChannelError::ReadBroken)
            }
            Err(err) => {
                error!(%err, "unexpected stream read failure");
                ChannelEvent::Error(ChannelError::ReadUnknown)
            }
        };

        let last = !matches!(event, ChannelEvent::Message(_));
        let sent = tx.send(event).is_ok();
        bell.ring();
        if !sent || last {
            return;
        }
    }
}

impl RawChannel for StreamChannel {
    fn write(&mut self, message: Message) -> std::result::Result<(), WriteRejected> {
        match self.writer.send(&message.bytes) {
            Ok(()) => Ok(()),
            Err(err) => Err(WriteRejected {
                error: err.into(),
                message,
            }),
        }
    }

    fn poll_event(&mut self) -> Option<ChannelEvent> {
        match self.events.try_recv() {
            Ok(event) => Some(event),
            Err(TryRecvError::Empty) => None,
            // Reader thread exited without reporting; treat as a close.
            Err(TryRecvError::Disconnected) if self.reader.is_some() => {
                self.reader = None;
                Some(ChannelEvent::Closed)
            }
            Err(TryRecvError::Disconnected) => None,
        }
    }

    fn doorbell(&self) -> Option<Doorbell> {
        Some(self.bell.clone())
    }

    fn check_message(&self, num_bytes: usize, num_handles: usize) -> Result<()> {
        if num_handles > 0 {
            return Err(PipeError::InvalidArgument(
                "handles cannot cross a stream transport",
            ));
        }
        if num_bytes == 0 {
            return Err(PipeError::InvalidArgument(
                "empty messages cannot cross a stream transport",
            ));
        }
        Ok(())
    }

    fn shutdown(&mut self) {
        let Some(reader) = self.reader.take() else {
            return;
        };
        if let Err(err) = self.control.shutdown(Shutdown::Both) {
            debug!(%err, "stream shutdown failed");
        }
        if reader.join().is_err() {
            error!("stream reader thread panicked");
        }
        debug!("stream channel shut down");
    }
}

impl Drop for StreamChannel {
    fn drop(&mut self) {
        self.shutdown();
    }
}
