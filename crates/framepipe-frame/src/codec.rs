use std::time::Duration;

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::{FrameError, Result};

/// Header: payload length as a big-endian `u32`.
pub const HEADER_SIZE: usize = 4;

/// Default maximum payload size: 16 MiB.
pub const DEFAULT_MAX_PAYLOAD: usize = 16 * 1024 * 1024;

/// Append one framed message to `dst`.
///
/// ```text
/// ┌──────────────────┬──────────────────────┐
/// │ Length (4B, BE)  │ Payload (Length B)   │
/// └──────────────────┴──────────────────────┘
/// ```
pub fn encode_message(payload: &[u8], dst: &mut BytesMut) -> Result<()> {
    if payload.is_empty() {
        return Err(FrameError::EmptyPayload);
    }
    let len = u32::try_from(payload.len()).map_err(|_| FrameError::PayloadTooLarge {
        size: payload.len(),
        max: u32::MAX as usize,
    })?;
    dst.reserve(HEADER_SIZE + payload.len());
    dst.put_u32(len);
    dst.put_slice(payload);
    Ok(())
}

/// Split one complete message off the front of `src`.
///
/// Returns `Ok(None)` until the whole message has been buffered. A header
/// announcing zero bytes or more than `max_payload` is rejected before any
/// payload is waited for.
pub fn decode_message(src: &mut BytesMut, max_payload: usize) -> Result<Option<Bytes>> {
    if src.len() < HEADER_SIZE {
        return Ok(None);
    }

    let mut header = [0u8; HEADER_SIZE];
    header.copy_from_slice(&src[..HEADER_SIZE]);
    let len = u32::from_be_bytes(header) as usize;
    if len == 0 || len > max_payload {
        return Err(FrameError::InvalidMessageSize {
            size: len,
            capacity: max_payload,
        });
    }

    if src.len() < HEADER_SIZE + len {
        src.reserve(HEADER_SIZE + len - src.len());
        return Ok(None);
    }

    src.advance(HEADER_SIZE);
    Ok(Some(src.split_to(len).freeze()))
}

/// Framing limits and stream timeouts.
#[derive(Debug, Clone)]
pub struct FrameConfig {
    /// Largest payload accepted or produced. Default: 16 MiB.
    pub max_payload_size: usize,
    /// Read timeout applied to `IpcStream`s.
    pub read_timeout: Option<Duration>,
    /// Write timeout applied to `IpcStream`s.
    pub write_timeout: Option<Duration>,
}

impl Default for FrameConfig {
    fn default() -> Self {
        Self {
            max_payload_size: DEFAULT_MAX_PAYLOAD,
            read_timeout: None,
            write_timeout: None,
        }
    }
}

/// tokio-util codec for the length-prefixed wire format.
///
/// ```ignore
/// let mut framed = tokio_util::codec::Framed::new(stream, LengthPrefixedCodec::default());
/// framed.send(Bytes::from_static(b"hello")).await?;
/// let message = framed.next().await.transpose()?;
/// ```
#[cfg(feature = "async")]
#[derive(Debug, Clone)]
pub struct LengthPrefixedCodec {
    max_payload_size: usize,
}

#[cfg(feature = "async")]
impl LengthPrefixedCodec {
    pub fn new(max_payload_size: usize) -> Self {
        Self { max_payload_size }
    }

    pub fn max_payload_size(&self) -> usize {
        self.max_payload_size
    }
}

#[cfg(feature = "async")]
impl Default for LengthPrefixedCodec {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_PAYLOAD)
    }
}

#[cfg(feature = "async")]
impl tokio_util::codec::Decoder for LengthPrefixedCodec {
    type Item = Bytes;
    type Error = FrameError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Bytes>> {
        decode_message(src, self.max_payload_size)
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Bytes>> {
        match self.decode(src)? {
            Some(message) => Ok(Some(message)),
            None if src.is_empty() => Ok(None),
            None => Err(FrameError::ConnectionClosed),
        }
    }
}

#[cfg(feature = "async")]
impl tokio_util::codec::Encoder<Bytes> for LengthPrefixedCodec {
    type Error = FrameError;

    fn encode(&mut self, item: Bytes, dst: &mut BytesMut) -> Result<()> {
        if item.len() > self.max_payload_size {
            return Err(FrameError::PayloadTooLarge {
                size: item.len(),
                max: self.max_payload_size,
            });
        }
        encode_message(&item, dst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encode_writes_big_endian_length() {
        let mut buf = BytesMut::new();
        encode_message(b"abc", &mut buf).unwrap();
        assert_eq!(buf.as_ref(), &[0, 0, 0, 3, b'a', b'b', b'c']);
    }

    #[test]
    fn encode_rejects_empty_payload() {
        let mut buf = BytesMut::new();
        assert!(matches!(
            encode_message(b"", &mut buf),
            Err(FrameError::EmptyPayload)
        ));
        assert!(buf.is_empty());
    }

    #[test]
    fn decode_waits_for_complete_header_and_payload() {
        let mut buf = BytesMut::from(&[0u8, 0][..]);
        assert!(decode_message(&mut buf, DEFAULT_MAX_PAYLOAD).unwrap().is_none());

        let mut buf = BytesMut::new();
        encode_message(b"hello", &mut buf).unwrap();
        buf.truncate(HEADER_SIZE + 2);
        assert!(decode_message(&mut buf, DEFAULT_MAX_PAYLOAD).unwrap().is_none());
        assert_eq!(buf.len(), HEADER_SIZE + 2, "partial input must not be consumed");
    }

    #[test]
    fn decode_splits_consecutive_messages() {
        let mut buf = BytesMut::new();
        encode_message(b"first", &mut buf).unwrap();
        encode_message(b"second", &mut buf).unwrap();

        let first = decode_message(&mut buf, DEFAULT_MAX_PAYLOAD).unwrap().unwrap();
        let second = decode_message(&mut buf, DEFAULT_MAX_PAYLOAD).unwrap().unwrap();
        assert_eq!(first.as_ref(), b"first");
        assert_eq!(second.as_ref(), b"second");
        assert!(buf.is_empty());
    }

    #[test]
    fn decode_rejects_zero_length_header() {
        let mut buf = BytesMut::from(&[0u8, 0, 0, 0][..]);
        assert!(matches!(
            decode_message(&mut buf, DEFAULT_MAX_PAYLOAD),
            Err(FrameError::InvalidMessageSize { size: 0, .. })
        ));
    }

    #[test]
    fn decode_rejects_oversized_header_before_payload_arrives() {
        let mut buf = BytesMut::new();
        buf.put_u32(1024);
        assert!(matches!(
            decode_message(&mut buf, 16),
            Err(FrameError::InvalidMessageSize {
                size: 1024,
                capacity: 16
            })
        ));
    }

    #[cfg(feature = "async")]
    mod framed {
        use futures_util::{SinkExt, StreamExt};
        use tokio_util::codec::{FramedRead, FramedWrite};

        use super::super::*;

        #[tokio::test]
        async fn codec_roundtrip_over_duplex() {
            let (client, server) = tokio::io::duplex(64);
            let mut sink = FramedWrite::new(client, LengthPrefixedCodec::default());
            let mut stream = FramedRead::new(server, LengthPrefixedCodec::default());

            sink.send(Bytes::from_static(b"one")).await.unwrap();
            sink.send(Bytes::from(vec![7u8; 300])).await.unwrap();
            drop(sink);

            assert_eq!(stream.next().await.unwrap().unwrap().as_ref(), b"one");
            assert_eq!(stream.next().await.unwrap().unwrap().len(), 300);
            assert!(stream.next().await.is_none());
        }

        #[tokio::test]
        async fn codec_reports_truncated_stream() {
            let (mut client, server) = tokio::io::duplex(64);
            tokio::io::AsyncWriteExt::write_all(&mut client, &[0, 0, 0, 9, 1, 2])
                .await
                .unwrap();
            drop(client);

            let mut stream = FramedRead::new(server, LengthPrefixedCodec::default());
            assert!(matches!(
                stream.next().await,
                Some(Err(FrameError::ConnectionClosed))
            ));
        }

        #[tokio::test]
        async fn codec_encoder_enforces_limit() {
            let (client, _server) = tokio::io::duplex(64);
            let mut sink = FramedWrite::new(client, LengthPrefixedCodec::new(4));
            assert!(matches!(
                sink.send(Bytes::from_static(b"too long")).await,
                Err(FrameError::PayloadTooLarge { size: 8, max: 4 })
            ));
        }
    }
}
