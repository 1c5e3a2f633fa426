//! Bidirectional pipes of discrete messages.
//!
//! A [`MessagePipe`] is one endpoint. It owns the transport to its peer (a
//! [`RawChannel`]), a FIFO of inbound messages, and a sticky write-error
//! flag. Transport activity reaches the endpoint as [`ChannelEvent`]s which
//! are drained lazily whenever the endpoint is used.
//!
//! An endpoint can be serialized for transfer to another context: the
//! transport and any attached handles are parked in a [`Broker`] and only
//! tokens travel with the bytes.

use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use bytes::{Bytes, BytesMut};
use framepipe_transport::IpcStream;
use tracing::{debug, error, trace, warn};

use crate::broker::{Broker, Token, Transferable};
use crate::config::Configuration;
use crate::error::{PipeError, Result};
use crate::handle::{Handle, Message};
use crate::raw_channel::{ChannelError, ChannelEvent, InProcessChannel, RawChannel, StreamChannel};
use crate::serialize::{self, DecodedEndpoint, DecodedHandle, EndpointState};
use crate::signals::{Signals, SignalsState};

static NEXT_PIPE_ID: AtomicU64 = AtomicU64::new(1);

/// Re-check interval for transports that have no doorbell.
#[cfg(feature = "async")]
const CHANNEL_POLL_INTERVAL: std::time::Duration = std::time::Duration::from_millis(5);

/// Identity shared by the two endpoints of one pipe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PipeId(u64);

impl PipeId {
    fn next() -> Self {
        Self(NEXT_PIPE_ID.fetch_add(1, Ordering::Relaxed))
    }

    pub fn as_u64(self) -> u64 {
        self.0
    }

    pub(crate) fn from_u64(raw: u64) -> Self {
        Self(raw)
    }
}

/// Which end of a pipe an endpoint is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Side {
    A,
    B,
}

impl Side {
    pub fn peer(self) -> Side {
        match self {
            Side::A => Side::B,
            Side::B => Side::A,
        }
    }

    pub(crate) fn as_u8(self) -> u8 {
        match self {
            Side::A => 0,
            Side::B => 1,
        }
    }

    pub(crate) fn from_u8(raw: u8) -> Option<Side> {
        match raw {
            0 => Some(Side::A),
            1 => Some(Side::B),
            _ => None,
        }
    }
}

/// Flags for [`MessagePipe::read_message_into`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReadFlags {
    /// Drop a message that does not fit instead of leaving it queued.
    pub may_discard: bool,
}

/// Size of a message that was read (or did not fit).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MessageSize {
    pub num_bytes: usize,
    pub num_handles: usize,
}

/// Upper bounds on what [`MessagePipe::end_serialize_and_close`] produces.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SerializeEstimate {
    pub max_bytes: usize,
    pub max_platform_handles: usize,
}

/// A serialized endpoint: bytes plus the broker tokens they refer to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SerializedEndpoint {
    pub bytes: Bytes,
    pub tokens: Vec<Token>,
}

struct PendingSerialization {
    bytes: BytesMut,
    transferables: Vec<Transferable>,
}

impl PendingSerialization {
    fn estimate(&self) -> SerializeEstimate {
        SerializeEstimate {
            max_bytes: self.bytes.len(),
            max_platform_handles: self
                .transferables
                .iter()
                .filter(|transferable| transferable.is_platform())
                .count(),
        }
    }
}

/// One endpoint of a message pipe.
pub struct MessagePipe {
    id: PipeId,
    side: Side,
    channel: Option<Box<dyn RawChannel>>,
    write_error: bool,
    queue: VecDeque<Message>,
    limits: Configuration,
    pending: Option<PendingSerialization>,
    closed: bool,
}

impl MessagePipe {
    /// Create two connected endpoints in this process.
    pub fn pair(config: &Configuration) -> (MessagePipe, MessagePipe) {
        let id = PipeId::next();
        let (a, b) = InProcessChannel::pair();
        debug!(pipe = id.0, "message pipe created");
        (
            Self::from_parts(id, Side::A, Some(Box::new(a)), config),
            Self::from_parts(id, Side::B, Some(Box::new(b)), config),
        )
    }

    /// Wrap a connected stream. The peer is whatever sits at the other end
    /// of the stream, typically another `over_stream` endpoint.
    pub fn over_stream(stream: IpcStream, config: &Configuration) -> Result<MessagePipe> {
        let channel = StreamChannel::new(stream, config)?;
        Ok(Self::with_channel(Box::new(channel), config))
    }

    /// Endpoint over a caller-provided transport.
    pub fn with_channel(channel: Box<dyn RawChannel>, config: &Configuration) -> MessagePipe {
        Self::from_parts(PipeId::next(), Side::A, Some(channel), config)
    }

    fn from_parts(
        id: PipeId,
        side: Side,
        channel: Option<Box<dyn RawChannel>>,
        config: &Configuration,
    ) -> Self {
        Self {
            id,
            side,
            channel,
            write_error: false,
            queue: VecDeque::new(),
            limits: config.clone(),
            pending: None,
            closed: false,
        }
    }

    pub fn id(&self) -> PipeId {
        self.id
    }

    pub fn side(&self) -> Side {
        self.side
    }

    fn ensure_usable(&self) -> Result<()> {
        if self.closed {
            return Err(PipeError::FailedPrecondition("endpoint is closed"));
        }
        if self.pending.is_some() {
            return Err(PipeError::FailedPrecondition(
                "endpoint is being serialized",
            ));
        }
        Ok(())
    }

    /// Send `bytes` with `handles` attached.
    ///
    /// On success `handles` is drained into the message. On failure nothing
    /// is sent and the handles stay with the caller, including when the
    /// transport refuses the message.
    pub fn write_message(&mut self, bytes: &[u8], handles: &mut Vec<Handle>) -> Result<()> {
        self.ensure_usable()?;
        self.pump();

        if self.write_error {
            return Err(PipeError::FailedPrecondition("earlier write failed"));
        }
        let Some(channel) = self.channel.as_mut() else {
            return Err(PipeError::FailedPrecondition("peer is closed"));
        };

        if bytes.len() > self.limits.max_message_num_bytes {
            return Err(PipeError::ResourceExhausted {
                what: "message bytes",
                size: bytes.len(),
                limit: self.limits.max_message_num_bytes,
            });
        }
        if handles.len() > self.limits.max_message_num_handles {
            return Err(PipeError::ResourceExhausted {
                what: "message handles",
                size: handles.len(),
                limit: self.limits.max_message_num_handles,
            });
        }
        channel.check_message(bytes.len(), handles.len())?;

        for handle in handles.iter() {
            if handle.pipe_id() == Some(self.id) {
                return Err(PipeError::InvalidArgument(
                    "cannot send an endpoint over its own pipe",
                ));
            }
            if let Handle::MessagePipe(pipe) = handle {
                if pipe.closed || pipe.pending.is_some() {
                    return Err(PipeError::InvalidArgument(
                        "attached endpoint is closed or being serialized",
                    ));
                }
            }
        }

        let message = Message::with_handles(Bytes::copy_from_slice(bytes), handles.drain(..).collect());
        trace!(
            pipe = self.id.0,
            num_bytes = message.num_bytes(),
            num_handles = message.num_handles(),
            "write message"
        );
        if let Err(rejected) = channel.write(message) {
            warn!(pipe = self.id.0, err = %rejected.error, "message pipe write failed");
            handles.extend(rejected.message.handles);
            self.on_event(ChannelEvent::Error(ChannelError::Write));
            return Err(PipeError::FailedPrecondition("write failed"));
        }
        Ok(())
    }

    /// Take the next inbound message.
    pub fn read_message(&mut self) -> Result<Message> {
        self.ensure_usable()?;
        self.pump();
        match self.queue.pop_front() {
            Some(message) => Ok(message),
            None => Err(self.empty_queue_error()),
        }
    }

    /// Copy the next message's bytes into `buf` and append its handles.
    ///
    /// When the message does not fit in `buf` or in `max_handles`, fails
    /// with `BufferTooSmall` carrying the required sizes. The message stays
    /// queued unless `flags.may_discard` is set.
    pub fn read_message_into(
        &mut self,
        buf: &mut [u8],
        handles: &mut Vec<Handle>,
        max_handles: usize,
        flags: ReadFlags,
    ) -> Result<MessageSize> {
        self.ensure_usable()?;
        self.pump();

        let Some(next) = self.queue.front() else {
            return Err(self.empty_queue_error());
        };
        let size = MessageSize {
            num_bytes: next.num_bytes(),
            num_handles: next.num_handles(),
        };
        if size.num_bytes > buf.len() || size.num_handles > max_handles {
            if flags.may_discard {
                debug!(pipe = self.id.0, ?size, "discarding oversized message");
                self.queue.pop_front();
            }
            return Err(PipeError::BufferTooSmall {
                num_bytes: size.num_bytes,
                num_handles: size.num_handles,
            });
        }

        let Some(message) = self.queue.pop_front() else {
            return Err(self.empty_queue_error());
        };
        buf[..size.num_bytes].copy_from_slice(&message.bytes);
        handles.extend(message.handles);
        Ok(size)
    }

    fn empty_queue_error(&self) -> PipeError {
        if self.channel.is_some() {
            PipeError::ShouldWait
        } else {
            PipeError::FailedPrecondition("queue is empty and peer is closed")
        }
    }

    /// Feed one transport event through the endpoint.
    pub fn on_event(&mut self, event: ChannelEvent) {
        if self.closed {
            return;
        }
        match event {
            ChannelEvent::Message(message) => {
                trace!(pipe = self.id.0, num_bytes = message.num_bytes(), "message arrived");
                self.queue.push_back(message);
            }
            ChannelEvent::Closed => {
                debug!(pipe = self.id.0, side = ?self.side, "peer closed");
                self.shutdown_channel();
            }
            ChannelEvent::Error(ChannelError::Write) => {
                warn!(pipe = self.id.0, "write side broken");
                self.write_error = true;
            }
            ChannelEvent::Error(err) => {
                error!(pipe = self.id.0, ?err, "read side failed");
                self.shutdown_channel();
            }
        }
    }

    fn shutdown_channel(&mut self) {
        if let Some(mut channel) = self.channel.take() {
            channel.shutdown();
        }
    }

    fn pump(&mut self) {
        while let Some(event) = self.channel.as_mut().and_then(|channel| channel.poll_event()) {
            self.on_event(event);
        }
    }

    pub fn signals_state(&mut self) -> SignalsState {
        let mut out = SignalsState::default();
        if self.ensure_usable().is_err() {
            return out;
        }
        self.pump();

        let connected = self.channel.is_some();
        let writable = connected && !self.write_error;
        out.satisfied.set(Signals::READABLE, !self.queue.is_empty());
        out.satisfied.set(Signals::WRITABLE, writable);
        out.satisfied.set(Signals::PEER_CLOSED, !writable);
        out.satisfiable
            .set(Signals::READABLE, connected || !self.queue.is_empty());
        out.satisfiable.set(Signals::WRITABLE, writable);
        out.satisfiable |= Signals::PEER_CLOSED;
        out
    }

    /// Resolve once any of `signals` is satisfied.
    ///
    /// Fails with `FailedPrecondition` once none of them can be, or when the
    /// endpoint is closed or being serialized.
    #[cfg(feature = "async")]
    pub async fn wait(&mut self, signals: Signals) -> Result<SignalsState> {
        self.ensure_usable()?;
        loop {
            let bell = self.channel.as_ref().and_then(|channel| channel.doorbell());
            let state = match &bell {
                Some(bell) => {
                    let mut notified = std::pin::pin!(bell.notified());
                    notified.as_mut().enable();
                    let state = self.signals_state();
                    if !state.any_satisfied(signals) && state.any_satisfiable(signals) {
                        notified.await;
                        continue;
                    }
                    state
                }
                None => self.signals_state(),
            };

            if state.any_satisfied(signals) {
                return Ok(state);
            }
            if !state.any_satisfiable(signals) {
                return Err(PipeError::FailedPrecondition(
                    "requested signals can never be satisfied",
                ));
            }
            tokio::time::sleep(CHANNEL_POLL_INTERVAL).await;
        }
    }

    /// Begin serializing this endpoint. Idempotent.
    ///
    /// The transport is detached and the inbound queue captured, so the
    /// endpoint accepts no further reads or writes.
    pub fn start_serialize(&mut self) -> Result<SerializeEstimate> {
        if self.closed {
            return Err(PipeError::FailedPrecondition("endpoint is closed"));
        }
        if let Some(pending) = &self.pending {
            return Ok(pending.estimate());
        }

        let state = self.detach_state();
        let mut bytes = BytesMut::new();
        let mut transferables = Vec::new();
        serialize::encode(state, &mut bytes, &mut transferables);

        let pending = PendingSerialization {
            bytes,
            transferables,
        };
        let estimate = pending.estimate();
        debug!(pipe = self.id.0, ?estimate, "serialization started");
        self.pending = Some(pending);
        Ok(estimate)
    }

    /// Finish serializing and consume the endpoint.
    pub fn end_serialize_and_close(mut self, broker: &mut dyn Broker) -> Result<SerializedEndpoint> {
        if self.pending.is_none() {
            self.start_serialize()?;
        }
        let pending = self
            .pending
            .take()
            .ok_or(PipeError::FailedPrecondition("endpoint is closed"))?;
        self.closed = true;

        let mut tokens = Vec::with_capacity(pending.transferables.len());
        for transferable in pending.transferables {
            tokens.push(broker.register(transferable)?);
        }
        debug!(pipe = self.id.0, tokens = tokens.len(), "endpoint serialized");
        Ok(SerializedEndpoint {
            bytes: pending.bytes.freeze(),
            tokens,
        })
    }

    /// Rebuild an endpoint from its serialized form, redeeming its tokens.
    pub fn deserialize(
        serialized: &SerializedEndpoint,
        broker: &mut dyn Broker,
        config: &Configuration,
    ) -> Result<MessagePipe> {
        let decoded = serialize::decode(serialized.bytes.clone(), &serialized.tokens, broker)?;
        let pipe = Self::from_decoded(decoded, config);
        debug!(pipe = pipe.id.0, queued = pipe.queue.len(), "endpoint deserialized");
        Ok(pipe)
    }

    fn from_decoded(decoded: DecodedEndpoint, config: &Configuration) -> MessagePipe {
        let DecodedEndpoint { state, nested } = decoded;
        let mut pipe = Self::from_parts(state.id, state.side, state.channel, config);
        pipe.write_error = state.write_error;
        pipe.queue = state.queue;
        for (message, handles) in pipe.queue.iter_mut().zip(nested) {
            message.handles = handles
                .into_iter()
                .map(|handle| match handle {
                    DecodedHandle::MessagePipe(endpoint) => {
                        Handle::MessagePipe(Self::from_decoded(endpoint, config))
                    }
                    DecodedHandle::Ready(handle) => handle,
                })
                .collect();
        }
        pipe
    }

    fn detach_state(&mut self) -> EndpointState {
        self.pump();
        EndpointState {
            id: self.id,
            side: self.side,
            write_error: self.write_error,
            channel: self.channel.take(),
            queue: std::mem::take(&mut self.queue),
        }
    }

    /// Strip a nested endpoint for serialization; it is closed afterwards.
    pub(crate) fn detach(&mut self) -> EndpointState {
        let state = self.detach_state();
        self.closed = true;
        state
    }

    /// Close the endpoint. Queued messages and their handles are dropped
    /// and the peer observes a close. Idempotent.
    pub fn close(&mut self) {
        if std::mem::replace(&mut self.closed, true) {
            return;
        }
        self.pending = None;
        self.shutdown_channel();
        self.queue.clear();
        debug!(pipe = self.id.0, side = ?self.side, "message pipe closed");
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }
}

impl Drop for MessagePipe {
    fn drop(&mut self) {
        self.close();
    }
}

impl fmt::Debug for MessagePipe {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MessagePipe")
            .field("id", &self.id.0)
            .field("side", &self.side)
            .field("connected", &self.channel.is_some())
            .field("write_error", &self.write_error)
            .field("queued", &self.queue.len())
            .field("serializing", &self.pending.is_some())
            .field("closed", &self.closed)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::time::{Duration, Instant};

    use super::*;
    use crate::broker::InMemoryBroker;
    use crate::data_pipe::{DataPipe, DataPipeOptions, Transfer};
    use crate::error::ErrorKind;
    use crate::raw_channel::WriteRejected;

    fn config() -> Configuration {
        Configuration::default()
    }

    fn write(pipe: &mut MessagePipe, bytes: &[u8]) {
        pipe.write_message(bytes, &mut Vec::new()).unwrap();
    }

    fn read_eventually(pipe: &mut MessagePipe) -> Result<Message> {
        let deadline = Instant::now() + Duration::from_secs(5);
        loop {
            match pipe.read_message() {
                Err(PipeError::ShouldWait) if Instant::now() < deadline => {
                    std::thread::sleep(Duration::from_millis(2));
                }
                other => return other,
            }
        }
    }

    #[test]
    fn messages_arrive_in_order() {
        let (mut a, mut b) = MessagePipe::pair(&config());
        assert_eq!(a.id(), b.id());
        assert_eq!(a.side().peer(), b.side());

        write(&mut a, b"one");
        write(&mut a, b"two");
        write(&mut b, b"back");

        assert_eq!(b.read_message().unwrap().bytes.as_ref(), b"one");
        assert_eq!(b.read_message().unwrap().bytes.as_ref(), b"two");
        assert!(matches!(b.read_message(), Err(PipeError::ShouldWait)));
        assert_eq!(a.read_message().unwrap().bytes.as_ref(), b"back");
    }

    #[test]
    fn empty_messages_are_allowed_in_process() {
        let (mut a, mut b) = MessagePipe::pair(&config());
        write(&mut a, b"");
        assert!(b.read_message().unwrap().bytes.is_empty());
    }

    #[test]
    fn peer_close_drains_then_fails() {
        let (mut a, mut b) = MessagePipe::pair(&config());
        write(&mut a, b"last words");
        drop(a);

        let signals = b.signals_state();
        assert!(signals.is_satisfied(Signals::PEER_CLOSED));
        assert!(signals.is_satisfied(Signals::READABLE));
        assert!(!signals.is_satisfiable(Signals::WRITABLE));

        assert_eq!(b.read_message().unwrap().bytes.as_ref(), b"last words");
        assert!(matches!(
            b.read_message(),
            Err(PipeError::FailedPrecondition(_))
        ));
        assert!(!b.signals_state().is_satisfiable(Signals::READABLE));
        assert!(matches!(
            b.write_message(b"anyone?", &mut Vec::new()),
            Err(PipeError::FailedPrecondition(_))
        ));
    }

    #[test]
    fn fresh_endpoint_is_writable_not_readable() {
        let (mut a, _b) = MessagePipe::pair(&config());
        let signals = a.signals_state();
        assert!(signals.is_satisfied(Signals::WRITABLE));
        assert!(!signals.is_satisfied(Signals::READABLE));
        assert!(signals.is_satisfiable(Signals::READABLE));
        assert!(!signals.is_satisfied(Signals::PEER_CLOSED));
    }

    #[test]
    fn sending_the_peer_endpoint_is_rejected() {
        let (mut a, b) = MessagePipe::pair(&config());
        let mut handles = vec![Handle::from(b)];

        let err = a.write_message(b"self", &mut handles).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidArgument);
        assert_eq!(handles.len(), 1);

        let b = handles.pop().and_then(Handle::into_message_pipe).unwrap();
        assert!(!b.is_closed());
    }

    #[test]
    fn limits_are_enforced() {
        let limits = Configuration {
            max_message_num_bytes: 4,
            max_message_num_handles: 1,
            ..Configuration::default()
        };
        let (mut a, _b) = MessagePipe::pair(&limits);
        assert!(matches!(
            a.write_message(b"too long", &mut Vec::new()),
            Err(PipeError::ResourceExhausted { what: "message bytes", .. })
        ));

        let (c, d) = MessagePipe::pair(&limits);
        let mut handles = vec![Handle::from(c), Handle::from(d)];
        assert!(matches!(
            a.write_message(b"ok", &mut handles),
            Err(PipeError::ResourceExhausted { what: "message handles", .. })
        ));
        assert_eq!(handles.len(), 2);
    }

    #[test]
    fn handles_move_with_the_message() {
        let cfg = config();
        let (mut a, mut b) = MessagePipe::pair(&cfg);
        let (mut producer, consumer) = DataPipe::create(DataPipeOptions::default(), &cfg).unwrap();
        let (mut c, d) = MessagePipe::pair(&cfg);

        let mut handles = vec![Handle::from(consumer), Handle::from(d)];
        a.write_message(b"take these", &mut handles).unwrap();
        assert!(handles.is_empty());

        let mut message = b.read_message().unwrap();
        assert_eq!(message.num_handles(), 2);
        let mut d = message.handles.pop().and_then(Handle::into_message_pipe).unwrap();
        let mut consumer = message.handles.pop().and_then(Handle::into_consumer).unwrap();

        producer.write(b"data", Transfer::AllOrNone).unwrap();
        let mut buf = [0u8; 4];
        assert_eq!(consumer.read(&mut buf, Transfer::AllOrNone).unwrap(), 4);
        assert_eq!(&buf, b"data");

        write(&mut c, b"nested");
        assert_eq!(d.read_message().unwrap().bytes.as_ref(), b"nested");
    }

    #[test]
    fn attaching_a_closed_endpoint_is_rejected() {
        let (mut a, _b) = MessagePipe::pair(&config());
        let (mut c, _d) = MessagePipe::pair(&config());
        c.close();
        let mut handles = vec![Handle::from(c)];
        assert!(matches!(
            a.write_message(b"x", &mut handles),
            Err(PipeError::InvalidArgument(_))
        ));
    }

    #[test]
    fn small_buffer_keeps_message_unless_discarding() {
        let (mut c, mut d) = MessagePipe::pair(&config());
        let (e, _f) = MessagePipe::pair(&config());
        c.write_message(b"twelve bytes", &mut vec![Handle::from(e)])
            .unwrap();
        write(&mut c, b"dropped on the floor");
        write(&mut c, b"next");

        let mut small = [0u8; 4];
        let mut handles = Vec::new();
        let err = d
            .read_message_into(&mut small, &mut handles, 1, ReadFlags::default())
            .unwrap_err();
        assert!(matches!(
            err,
            PipeError::BufferTooSmall { num_bytes: 12, num_handles: 1 }
        ));
        assert_eq!(err.kind(), ErrorKind::ResourceExhausted);

        let mut big = [0u8; 16];
        let err = d
            .read_message_into(&mut big, &mut handles, 0, ReadFlags::default())
            .unwrap_err();
        assert!(matches!(err, PipeError::BufferTooSmall { num_handles: 1, .. }));

        let size = d
            .read_message_into(&mut big, &mut handles, 1, ReadFlags::default())
            .unwrap();
        assert_eq!(size, MessageSize { num_bytes: 12, num_handles: 1 });
        assert_eq!(&big[..12], b"twelve bytes");
        assert_eq!(handles.len(), 1);

        let discard = ReadFlags { may_discard: true };
        assert!(d.read_message_into(&mut small, &mut handles, 0, discard).is_err());
        let size = d
            .read_message_into(&mut small, &mut handles, 0, discard)
            .unwrap();
        assert_eq!(size.num_bytes, 4);
        assert_eq!(&small, b"next");
    }

    struct FailingChannel {
        inbound: VecDeque<ChannelEvent>,
    }

    impl RawChannel for FailingChannel {
        fn write(&mut self, message: Message) -> std::result::Result<(), WriteRejected> {
            Err(WriteRejected {
                error: PipeError::FailedPrecondition("wire cut"),
                message,
            })
        }

        fn poll_event(&mut self) -> Option<ChannelEvent> {
            self.inbound.pop_front()
        }

        fn shutdown(&mut self) {
            self.inbound.clear();
        }
    }

    #[test]
    fn write_failure_is_sticky_but_reads_continue() {
        let channel = FailingChannel {
            inbound: VecDeque::from([ChannelEvent::Message(Message::new(&b"inbound"[..]))]),
        };
        let mut pipe = MessagePipe::with_channel(Box::new(channel), &config());

        assert!(matches!(
            pipe.write_message(b"out", &mut Vec::new()),
            Err(PipeError::FailedPrecondition(_))
        ));
        let signals = pipe.signals_state();
        assert!(signals.is_satisfied(Signals::PEER_CLOSED));
        assert!(!signals.is_satisfiable(Signals::WRITABLE));
        assert!(signals.is_satisfied(Signals::READABLE));

        assert_eq!(pipe.read_message().unwrap().bytes.as_ref(), b"inbound");
        assert!(matches!(pipe.read_message(), Err(PipeError::ShouldWait)));
        assert!(matches!(
            pipe.write_message(b"again", &mut Vec::new()),
            Err(PipeError::FailedPrecondition(_))
        ));
    }

    #[test]
    fn refused_write_returns_handles_to_caller() {
        let cfg = config();
        let channel = FailingChannel {
            inbound: VecDeque::new(),
        };
        let mut pipe = MessagePipe::with_channel(Box::new(channel), &cfg);
        let (producer, consumer) = DataPipe::create(DataPipeOptions::default(), &cfg).unwrap();
        let (_c, d) = MessagePipe::pair(&cfg);

        let mut handles = vec![Handle::from(consumer), Handle::from(d)];
        assert!(matches!(
            pipe.write_message(b"with handles", &mut handles),
            Err(PipeError::FailedPrecondition(_))
        ));
        assert_eq!(handles.len(), 2);
        assert!(!producer.signals_state().is_satisfied(Signals::PEER_CLOSED));

        let d = handles.pop().and_then(Handle::into_message_pipe).unwrap();
        assert!(!d.is_closed());
        assert!(handles.pop().and_then(Handle::into_consumer).is_some());
    }

    #[test]
    fn read_error_event_disconnects() {
        let (mut a, _b) = MessagePipe::pair(&config());
        a.on_event(ChannelEvent::Error(ChannelError::ReadBadMessage));
        assert!(a.signals_state().is_satisfied(Signals::PEER_CLOSED));
        assert!(matches!(a.read_message(), Err(PipeError::FailedPrecondition(_))));
    }

    #[test]
    fn serialized_endpoint_keeps_queue_handles_and_transport() {
        let cfg = config();
        let (mut a, mut b) = MessagePipe::pair(&cfg);
        let (mut c, d) = MessagePipe::pair(&cfg);
        let (mut producer, consumer) = DataPipe::create(DataPipeOptions::default(), &cfg).unwrap();

        write(&mut c, b"for d");
        a.write_message(b"outer", &mut vec![Handle::from(d), Handle::from(consumer)])
            .unwrap();

        let estimate = b.start_serialize().unwrap();
        assert!(estimate.max_bytes > 0);
        assert_eq!(estimate.max_platform_handles, 0);
        assert_eq!(b.start_serialize().unwrap(), estimate);
        assert!(matches!(
            b.read_message(),
            Err(PipeError::FailedPrecondition(_))
        ));
        assert!(b.signals_state().satisfied.is_empty());

        let mut broker = InMemoryBroker::new();
        let serialized = b.end_serialize_and_close(&mut broker).unwrap();
        // b's transport, d's transport and the consumer.
        assert_eq!(serialized.tokens.len(), 3);
        assert_eq!(broker.len(), 3);

        let mut b = MessagePipe::deserialize(&serialized, &mut broker, &cfg).unwrap();
        assert!(broker.is_empty());

        let mut outer = b.read_message().unwrap();
        assert_eq!(outer.bytes.as_ref(), b"outer");
        let consumer = outer.handles.pop().and_then(Handle::into_consumer).unwrap();
        let mut d = outer.handles.pop().and_then(Handle::into_message_pipe).unwrap();

        assert_eq!(d.read_message().unwrap().bytes.as_ref(), b"for d");
        write(&mut c, b"still connected");
        assert_eq!(d.read_message().unwrap().bytes.as_ref(), b"still connected");

        producer.write(b"xy", Transfer::AllOrNone).unwrap();
        assert_eq!(consumer.query().unwrap(), 2);

        write(&mut a, b"after");
        assert_eq!(b.read_message().unwrap().bytes.as_ref(), b"after");
        write(&mut b, b"reply");
        assert_eq!(a.read_message().unwrap().bytes.as_ref(), b"reply");
    }

    #[test]
    fn writes_during_serialization_are_refused() {
        let (_a, mut b) = MessagePipe::pair(&config());
        b.start_serialize().unwrap();
        assert!(matches!(
            b.write_message(b"x", &mut Vec::new()),
            Err(PipeError::FailedPrecondition(_))
        ));
    }

    #[test]
    fn endpoint_under_serialization_cannot_be_attached() {
        let (mut a, _b) = MessagePipe::pair(&config());
        let (mut c, _d) = MessagePipe::pair(&config());
        c.start_serialize().unwrap();
        let mut handles = vec![Handle::from(c)];
        assert!(a.write_message(b"x", &mut handles).is_err());
        assert_eq!(handles.len(), 1);
    }

    #[test]
    fn dropping_a_started_serialization_closes_the_peer() {
        let (mut a, mut b) = MessagePipe::pair(&config());
        b.start_serialize().unwrap();
        drop(b);
        assert!(a.signals_state().is_satisfied(Signals::PEER_CLOSED));
    }

    #[test]
    fn malformed_serialized_endpoint_is_rejected() {
        let mut broker = InMemoryBroker::new();
        let garbage = SerializedEndpoint {
            bytes: Bytes::from_static(b"garbage"),
            tokens: Vec::new(),
        };
        let err = MessagePipe::deserialize(&garbage, &mut broker, &config()).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidArgument);
    }

    #[test]
    fn unknown_tokens_are_rejected() {
        let (_a, b) = MessagePipe::pair(&config());
        let mut broker = InMemoryBroker::new();
        let serialized = b.end_serialize_and_close(&mut broker).unwrap();

        let mut other = InMemoryBroker::new();
        assert!(matches!(
            MessagePipe::deserialize(&serialized, &mut other, &config()),
            Err(PipeError::InvalidArgument(_))
        ));
    }

    #[test]
    fn stream_endpoints_exchange_messages() {
        let (left, right) = IpcStream::pair().unwrap();
        let cfg = config();
        let mut a = MessagePipe::over_stream(left, &cfg).unwrap();
        let mut b = MessagePipe::over_stream(right, &cfg).unwrap();

        write(&mut a, b"framed");
        assert_eq!(read_eventually(&mut b).unwrap().bytes.as_ref(), b"framed");

        let (_c, d) = MessagePipe::pair(&cfg);
        let mut handles = vec![Handle::from(d)];
        assert!(matches!(
            a.write_message(b"with handle", &mut handles),
            Err(PipeError::InvalidArgument(_))
        ));
        assert_eq!(handles.len(), 1);
        assert!(matches!(
            a.write_message(b"", &mut Vec::new()),
            Err(PipeError::InvalidArgument(_))
        ));

        drop(a);
        assert!(matches!(
            read_eventually(&mut b),
            Err(PipeError::FailedPrecondition(_))
        ));
    }

    #[cfg(feature = "async")]
    mod waiting {
        use super::*;

        #[tokio::test]
        async fn wait_resolves_when_a_message_arrives() {
            let (mut a, mut b) = MessagePipe::pair(&config());
            let waiter = tokio::spawn(async move {
                let state = b.wait(Signals::READABLE).await.unwrap();
                assert!(state.is_satisfied(Signals::READABLE));
                b.read_message().unwrap().bytes
            });

            tokio::task::yield_now().await;
            write(&mut a, b"wake");
            assert_eq!(waiter.await.unwrap().as_ref(), b"wake");
        }

        #[tokio::test]
        async fn wait_resolves_when_the_peer_closes() {
            let (mut a, mut b) = MessagePipe::pair(&config());
            let waiter = tokio::spawn(async move {
                b.wait(Signals::PEER_CLOSED).await.unwrap()
            });

            tokio::task::yield_now().await;
            a.close();
            let state = waiter.await.unwrap();
            assert!(state.is_satisfied(Signals::PEER_CLOSED));
            assert!(!state.is_satisfiable(Signals::WRITABLE));
        }

        #[tokio::test]
        async fn wait_fails_once_unsatisfiable() {
            let (a, mut b) = MessagePipe::pair(&config());
            drop(a);
            assert_eq!(
                b.wait(Signals::READABLE).await.unwrap_err().kind(),
                ErrorKind::FailedPrecondition
            );

            b.close();
            assert_eq!(
                b.wait(Signals::PEER_CLOSED).await.unwrap_err().kind(),
                ErrorKind::FailedPrecondition
            );
        }

        #[tokio::test]
        async fn wait_polls_transports_without_a_doorbell() {
            let channel = FailingChannel {
                inbound: VecDeque::from([ChannelEvent::Message(Message::new(&b"queued"[..]))]),
            };
            let mut pipe = MessagePipe::with_channel(Box::new(channel), &config());
            let state = pipe.wait(Signals::READABLE).await.unwrap();
            assert!(state.is_satisfied(Signals::READABLE));
        }
    }
}
