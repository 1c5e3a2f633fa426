//! Byte layout of a message pipe endpoint in transit.
//!
//! ```text
//! endpoint := "FPMP" version:u8 flags:u8 pipe_id:u64 side:u8
//!             [channel:u64]            (present when FLAG_HAS_CHANNEL)
//!             count:u64 message*count
//! message  := len:u64 bytes handle_count:u64 handle*handle_count
//! handle   := TAG_MESSAGE_PIPE len:u64 endpoint
//!           | (TAG_PRODUCER | TAG_CONSUMER | TAG_PLATFORM) index:u64
//! ```
//!
//! Integers are big-endian. Lengths, counts and indices are written as u64
//! so no `usize` is ever truncated. Every `index` (and `channel`) points
//! into the token list that travels next to the bytes. Endpoints nest at
//! most [`MAX_NESTING_DEPTH`] levels below the outermost one.

use std::collections::VecDeque;

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::broker::{Broker, Token, Transferable};
use crate::error::{PipeError, Result};
use crate::handle::{Handle, Message};
use crate::message_pipe::{PipeId, Side};
use crate::raw_channel::RawChannel;

const MAGIC: [u8; 4] = *b"FPMP";
const VERSION: u8 = 1;

/// Deepest chain of message pipes nested inside queued messages that
/// `decode` accepts.
pub(crate) const MAX_NESTING_DEPTH: usize = 64;

const FLAG_WRITE_ERROR: u8 = 1 << 0;
const FLAG_HAS_CHANNEL: u8 = 1 << 1;

const TAG_MESSAGE_PIPE: u8 = 0;
const TAG_PRODUCER: u8 = 1;
const TAG_CONSUMER: u8 = 2;
const TAG_PLATFORM: u8 = 3;

/// Everything an endpoint carries across a transfer.
pub(crate) struct EndpointState {
    pub(crate) id: PipeId,
    pub(crate) side: Side,
    pub(crate) write_error: bool,
    pub(crate) channel: Option<Box<dyn RawChannel>>,
    pub(crate) queue: VecDeque<Message>,
}

fn put_len(out: &mut BytesMut, len: usize) {
    out.put_u64(len as u64);
}

fn park(out: &mut BytesMut, transferables: &mut Vec<Transferable>, transferable: Transferable) {
    put_len(out, transferables.len());
    transferables.push(transferable);
}

/// Append `state` to `out`, moving non-byte resources into `transferables`.
///
/// Message pipes attached to queued messages are detached and nested in
/// place, so their own queues travel too.
pub(crate) fn encode(
    state: EndpointState,
    out: &mut BytesMut,
    transferables: &mut Vec<Transferable>,
) {
    let mut flags = 0u8;
    if state.write_error {
        flags |= FLAG_WRITE_ERROR;
    }
    if state.channel.is_some() {
        flags |= FLAG_HAS_CHANNEL;
    }

    out.put_slice(&MAGIC);
    out.put_u8(VERSION);
    out.put_u8(flags);
    out.put_u64(state.id.as_u64());
    out.put_u8(state.side.as_u8());
    if let Some(channel) = state.channel {
        park(out, transferables, Transferable::Channel(channel));
    }

    put_len(out, state.queue.len());
    for message in state.queue {
        put_len(out, message.bytes.len());
        out.put_slice(&message.bytes);
        put_len(out, message.handles.len());
        for handle in message.handles {
            match handle {
                Handle::MessagePipe(mut pipe) => {
                    let mut nested = BytesMut::new();
                    encode(pipe.detach(), &mut nested, transferables);
                    out.put_u8(TAG_MESSAGE_PIPE);
                    put_len(out, nested.len());
                    out.put_slice(&nested);
                }
                Handle::Producer(producer) => {
                    out.put_u8(TAG_PRODUCER);
                    park(out, transferables, Transferable::Producer(producer));
                }
                Handle::Consumer(consumer) => {
                    out.put_u8(TAG_CONSUMER);
                    park(out, transferables, Transferable::Consumer(consumer));
                }
                #[cfg(unix)]
                Handle::Platform(fd) => {
                    out.put_u8(TAG_PLATFORM);
                    park(out, transferables, Transferable::Platform(fd));
                }
            }
        }
    }
}

fn malformed() -> PipeError {
    PipeError::InvalidArgument("malformed serialized endpoint")
}

fn need(buf: &Bytes, len: usize) -> Result<()> {
    if buf.remaining() < len {
        return Err(malformed());
    }
    Ok(())
}

fn get_u8(buf: &mut Bytes) -> Result<u8> {
    need(buf, 1)?;
    Ok(buf.get_u8())
}

fn get_u64(buf: &mut Bytes) -> Result<u64> {
    need(buf, 8)?;
    Ok(buf.get_u64())
}

fn get_len(buf: &mut Bytes) -> Result<usize> {
    usize::try_from(get_u64(buf)?).map_err(|_| malformed())
}

fn get_bytes(buf: &mut Bytes, len: usize) -> Result<Bytes> {
    need(buf, len)?;
    Ok(buf.split_to(len))
}

struct Redeemer<'a> {
    tokens: &'a [Token],
    broker: &'a mut dyn Broker,
}

impl Redeemer<'_> {
    fn take(&mut self, buf: &mut Bytes) -> Result<Transferable> {
        let index = get_len(buf)?;
        let token = self
            .tokens
            .get(index)
            .ok_or(PipeError::InvalidArgument("token index out of range"))?;
        self.broker.redeem(*token).ok_or(PipeError::InvalidArgument(
            "token is unknown or was already redeemed",
        ))
    }
}

fn mismatch() -> PipeError {
    PipeError::InvalidArgument("token refers to a different kind of resource")
}

/// Parse one endpoint that must span all of `buf`.
pub(crate) fn decode(
    mut buf: Bytes,
    tokens: &[Token],
    broker: &mut dyn Broker,
) -> Result<DecodedEndpoint> {
    let mut redeemer = Redeemer { tokens, broker };
    let endpoint = decode_endpoint(&mut buf, &mut redeemer, 0)?;
    if buf.has_remaining() {
        return Err(malformed());
    }
    Ok(endpoint)
}

/// A decoded endpoint whose nested message pipes are still plain state.
pub(crate) struct DecodedEndpoint {
    pub(crate) state: EndpointState,
    pub(crate) nested: Vec<DecodedMessageHandles>,
}

/// Handles of one queued message, in order.
pub(crate) type DecodedMessageHandles = Vec<DecodedHandle>;

pub(crate) enum DecodedHandle {
    MessagePipe(DecodedEndpoint),
    Ready(Handle),
}

fn decode_endpoint(
    buf: &mut Bytes,
    redeemer: &mut Redeemer<'_>,
    depth: usize,
) -> Result<DecodedEndpoint> {
    if get_bytes(buf, MAGIC.len())?.as_ref() != MAGIC {
        return Err(malformed());
    }
    if get_u8(buf)? != VERSION {
        return Err(PipeError::InvalidArgument(
            "unsupported serialized endpoint version",
        ));
    }
    let flags = get_u8(buf)?;
    let id = PipeId::from_u64(get_u64(buf)?);
    let side = Side::from_u8(get_u8(buf)?).ok_or_else(malformed)?;

    let channel = if flags & FLAG_HAS_CHANNEL != 0 {
        match redeemer.take(buf)? {
            Transferable::Channel(channel) => Some(channel),
            _ => return Err(mismatch()),
        }
    } else {
        None
    };

    let count = get_len(buf)?;
    let mut queue = VecDeque::new();
    let mut nested = Vec::new();
    for _ in 0..count {
        let len = get_len(buf)?;
        let bytes = get_bytes(buf, len)?;
        let handle_count = get_len(buf)?;
        let mut handles = Vec::new();
        for _ in 0..handle_count {
            handles.push(decode_handle(buf, redeemer, depth)?);
        }
        queue.push_back(Message::new(bytes));
        nested.push(handles);
    }

    Ok(DecodedEndpoint {
        state: EndpointState {
            id,
            side,
            write_error: flags & FLAG_WRITE_ERROR != 0,
            channel,
            queue,
        },
        nested,
    })
}

fn decode_handle(
    buf: &mut Bytes,
    redeemer: &mut Redeemer<'_>,
    depth: usize,
) -> Result<DecodedHandle> {
    let handle = match get_u8(buf)? {
        TAG_MESSAGE_PIPE => {
            if depth >= MAX_NESTING_DEPTH {
                return Err(PipeError::InvalidArgument(
                    "serialized endpoints are nested too deeply",
                ));
            }
            let len = get_len(buf)?;
            let mut nested = get_bytes(buf, len)?;
            let endpoint = decode_endpoint(&mut nested, redeemer, depth + 1)?;
            if nested.has_remaining() {
                return Err(malformed());
            }
            return Ok(DecodedHandle::MessagePipe(endpoint));
        }
        TAG_PRODUCER => match redeemer.take(buf)? {
            Transferable::Producer(producer) => Handle::Producer(producer),
            _ => return Err(mismatch()),
        },
        TAG_CONSUMER => match redeemer.take(buf)? {
            Transferable::Consumer(consumer) => Handle::Consumer(consumer),
            _ => return Err(mismatch()),
        },
        #[cfg(unix)]
        TAG_PLATFORM => match redeemer.take(buf)? {
            Transferable::Platform(fd) => Handle::Platform(fd),
            _ => return Err(mismatch()),
        },
        _ => return Err(malformed()),
    };
    Ok(DecodedHandle::Ready(handle))
}
