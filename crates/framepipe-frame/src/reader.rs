use std::io::{ErrorKind, Read};

use bytes::Bytes;
use framepipe_transport::IpcStream;
use tracing::{debug, error, warn};

use crate::codec::{FrameConfig, HEADER_SIZE};
use crate::error::{FrameError, Result};

/// Where a [`FramedMessageReader`] is within the current message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadState {
    Idle,
    ReadingHeader,
    ReadingPayload,
}

/// Extracts length-prefixed messages from a byte stream.
///
/// One read may be outstanding at a time. The reader remembers exactly how
/// many header and payload bytes it has consumed, so a read interrupted by
/// [`FrameError::WouldBlock`] (a non-blocking stream or an expired read
/// timeout) continues with [`resume`](Self::resume) from the same byte.
///
/// A header announcing zero bytes, or more bytes than the caller's payload
/// buffer can hold, fails the read without consuming any payload.
pub struct FramedMessageReader<T> {
    inner: T,
    state: ReadState,
    header: [u8; HEADER_SIZE],
    header_offset: usize,
    payload_len: usize,
    payload_offset: usize,
    config: FrameConfig,
    scratch: Vec<u8>,
}

impl<T> FramedMessageReader<T> {
    /// Create a reader with default configuration.
    pub fn new(inner: T) -> Self {
        Self::with_config(inner, FrameConfig::default())
    }

    /// Create a reader with explicit configuration.
    pub fn with_config(inner: T, config: FrameConfig) -> Self {
        Self {
            inner,
            state: ReadState::Idle,
            header: [0; HEADER_SIZE],
            header_offset: 0,
            payload_len: 0,
            payload_offset: 0,
            config,
            scratch: Vec::new(),
        }
    }

    pub fn state(&self) -> ReadState {
        self.state
    }

    pub fn is_idle(&self) -> bool {
        self.state == ReadState::Idle
    }

    /// Borrow the underlying stream.
    pub fn get_ref(&self) -> &T {
        &self.inner
    }

    /// Mutably borrow the underlying stream.
    pub fn get_mut(&mut self) -> &mut T {
        &mut self.inner
    }

    /// Consume the reader and return the inner stream.
    pub fn into_inner(self) -> T {
        self.inner
    }

    /// Upper bound on message size, applied on top of the payload buffer.
    pub fn set_max_payload_size(&mut self, max_payload_size: usize) {
        self.config.max_payload_size = max_payload_size;
    }

    pub fn config(&self) -> &FrameConfig {
        &self.config
    }

    fn begin(&mut self, payload: &[u8]) -> Result<()> {
        if self.state != ReadState::Idle {
            error!(state = ?self.state, "message read started while another is in flight");
            return Err(FrameError::ReadInProgress);
        }
        if payload.is_empty() {
            return Err(FrameError::EmptyBuffer);
        }
        self.state = ReadState::ReadingHeader;
        self.header_offset = 0;
        self.payload_len = 0;
        self.payload_offset = 0;
        Ok(())
    }

    fn reset(&mut self) {
        self.state = ReadState::Idle;
        self.header_offset = 0;
        self.payload_len = 0;
        self.payload_offset = 0;
    }

    fn capacity_for(&self, payload: &[u8]) -> usize {
        payload.len().min(self.config.max_payload_size)
    }

    /// Validate a complete header and move on to the payload.
    fn accept_header(&mut self, capacity: usize) -> Result<()> {
        let len = u32::from_be_bytes(self.header) as usize;
        if len == 0 || len > capacity {
            warn!(size = len, capacity, "rejecting message with invalid size");
            self.reset();
            return Err(FrameError::InvalidMessageSize {
                size: len,
                capacity,
            });
        }
        self.payload_len = len;
        self.payload_offset = 0;
        self.state = ReadState::ReadingPayload;
        Ok(())
    }

    fn finish(&mut self) -> usize {
        let len = self.payload_len;
        self.reset();
        len
    }

    /// Map the outcome of one read call onto the state machine.
    fn check_read(&mut self, read: std::io::Result<usize>) -> Result<usize> {
        match read {
            Ok(0) => {
                if self.header_offset > 0 {
                    debug!(state = ?self.state, "stream ended mid-message");
                }
                self.reset();
                Err(FrameError::ConnectionClosed)
            }
            Ok(n) => Ok(n),
            Err(err) if err.kind() == ErrorKind::WouldBlock => Err(FrameError::WouldBlock),
            Err(err) => {
                self.reset();
                Err(FrameError::Io(err))
            }
        }
    }
}

impl<T: Read> FramedMessageReader<T> {
    /// Read one complete message into `payload` and return its length.
    ///
    /// Blocks until the message is complete, the stream ends, or the stream
    /// reports `WouldBlock`. In the last case the partial progress is kept and
    /// the read must be finished with [`resume`](Self::resume).
    pub fn read_message(&mut self, payload: &mut [u8]) -> Result<usize> {
        self.begin(payload)?;
        self.drive(payload)
    }

    /// Continue a read suspended by [`FrameError::WouldBlock`].
    ///
    /// `payload` must be the buffer the read started with (or one at least as
    /// large); bytes already copied into it are not re-read.
    pub fn resume(&mut self, payload: &mut [u8]) -> Result<usize> {
        if self.state == ReadState::Idle {
            return Err(FrameError::NoReadInProgress);
        }
        if self.state == ReadState::ReadingPayload && payload.len() < self.payload_len {
            let size = self.payload_len;
            self.reset();
            return Err(FrameError::InvalidMessageSize {
                size,
                capacity: payload.len(),
            });
        }
        self.drive(payload)
    }

    /// Read the next message into an owned buffer.
    ///
    /// Starts a new read when idle and otherwise continues the suspended one,
    /// so it can be called again after `WouldBlock`. Messages are limited by
    /// `max_payload_size`.
    pub fn next_message(&mut self) -> Result<Bytes> {
        if self.state == ReadState::Idle {
            self.state = ReadState::ReadingHeader;
            self.header_offset = 0;
        }
        if self.state == ReadState::ReadingHeader {
            let capacity = self.config.max_payload_size;
            self.fill_header(capacity)?;
        }

        let mut scratch = std::mem::take(&mut self.scratch);
        if scratch.len() < self.payload_len {
            scratch.resize(self.payload_len, 0);
        }
        let result = self
            .fill_payload(&mut scratch)
            .map(|len| Bytes::copy_from_slice(&scratch[..len]));
        self.scratch = scratch;
        result
    }

    fn drive(&mut self, payload: &mut [u8]) -> Result<usize> {
        if self.state == ReadState::ReadingHeader {
            let capacity = self.capacity_for(payload);
            self.fill_header(capacity)?;
        }
        self.fill_payload(payload)
    }

    fn fill_header(&mut self, capacity: usize) -> Result<()> {
        while self.header_offset < HEADER_SIZE {
            let read = read_retrying(&mut self.inner, &mut self.header[self.header_offset..]);
            self.header_offset += self.check_read(read)?;
        }
        self.accept_header(capacity)
    }

    fn fill_payload(&mut self, payload: &mut [u8]) -> Result<usize> {
        while self.payload_offset < self.payload_len {
            let read = read_retrying(
                &mut self.inner,
                &mut payload[self.payload_offset..self.payload_len],
            );
            self.payload_offset += self.check_read(read)?;
        }
        Ok(self.finish())
    }
}

impl FramedMessageReader<IpcStream> {
    /// Create a reader for an `IpcStream` and apply the configured read
    /// timeout. An expired timeout surfaces as [`FrameError::WouldBlock`].
    pub fn with_config_ipc(inner: IpcStream, config: FrameConfig) -> Result<Self> {
        inner.set_read_timeout(config.read_timeout)?;
        Ok(Self::with_config(inner, config))
    }
}

fn read_retrying<R: Read>(inner: &mut R, buf: &mut [u8]) -> std::io::Result<usize> {
    loop {
        match inner.read(buf) {
            Err(err) if err.kind() == ErrorKind::Interrupted => continue,
            // Read timeouts surface as `TimedOut` on some platforms.
            Err(err) if err.kind() == ErrorKind::TimedOut => {
                return Err(std::io::Error::from(ErrorKind::WouldBlock))
            }
            other => return other,
        }
    }
}

#[cfg(feature = "async")]
mod nonblocking {
    use std::pin::Pin;
    use std::task::{ready, Context, Poll};

    use tokio::io::{AsyncRead, ReadBuf};

    use super::*;

    impl<T: AsyncRead + Unpin> FramedMessageReader<T> {
        /// Read one complete message into `payload`.
        ///
        /// Dropping the returned future mid-message leaves the reader in its
        /// in-flight state; finish it with
        /// [`poll_read_message`](Self::poll_read_message) or discard the
        /// connection.
        pub async fn read_message_async(&mut self, payload: &mut [u8]) -> Result<usize> {
            self.begin(payload)?;
            std::future::poll_fn(|cx| self.poll_drive(cx, payload)).await
        }

        /// Step the reader once. Starts a read when idle, otherwise continues
        /// the outstanding one.
        pub fn poll_read_message(
            &mut self,
            cx: &mut Context<'_>,
            payload: &mut [u8],
        ) -> Poll<Result<usize>> {
            if self.state == ReadState::Idle {
                self.begin(payload)?;
            }
            self.poll_drive(cx, payload)
        }

        fn poll_drive(&mut self, cx: &mut Context<'_>, payload: &mut [u8]) -> Poll<Result<usize>> {
            if self.state == ReadState::ReadingHeader {
                while self.header_offset < HEADER_SIZE {
                    let read = ready!(poll_retrying(
                        &mut self.inner,
                        cx,
                        &mut self.header[self.header_offset..]
                    ));
                    self.header_offset += self.check_read(read)?;
                }
                let capacity = self.capacity_for(payload);
                self.accept_header(capacity)?;
            }

            if self.state == ReadState::ReadingPayload && payload.len() < self.payload_len {
                let size = self.payload_len;
                self.reset();
                return Poll::Ready(Err(FrameError::InvalidMessageSize {
                    size,
                    capacity: payload.len(),
                }));
            }

            while self.payload_offset < self.payload_len {
                let read = ready!(poll_retrying(
                    &mut self.inner,
                    cx,
                    &mut payload[self.payload_offset..self.payload_len]
                ));
                self.payload_offset += self.check_read(read)?;
            }
            Poll::Ready(Ok(self.finish()))
        }
    }

    fn poll_retrying<R: AsyncRead + Unpin>(
        inner: &mut R,
        cx: &mut Context<'_>,
        buf: &mut [u8],
    ) -> Poll<std::io::Result<usize>> {
        loop {
            let mut read_buf = ReadBuf::new(&mut *buf);
            match ready!(Pin::new(&mut *inner).poll_read(cx, &mut read_buf)) {
                Ok(()) => return Poll::Ready(Ok(read_buf.filled().len())),
                Err(err) if err.kind() == ErrorKind::Interrupted => continue,
                Err(err) => return Poll::Ready(Err(err)),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use bytes::BytesMut;

    use super::*;
    use crate::codec::encode_message;

    fn wire(messages: &[&[u8]]) -> Vec<u8> {
        let mut buf = BytesMut::new();
        for message in messages {
            encode_message(message, &mut buf).unwrap();
        }
        buf.to_vec()
    }

    /// Yields the input in fixed-size pieces.
    struct ChunkedReader {
        bytes: Vec<u8>,
        pos: usize,
        chunk: usize,
    }

    impl Read for ChunkedReader {
        fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
            let n = self.chunk.min(buf.len()).min(self.bytes.len() - self.pos);
            buf[..n].copy_from_slice(&self.bytes[self.pos..self.pos + n]);
            self.pos += n;
            Ok(n)
        }
    }

    /// Alternates between one byte of data and a `WouldBlock` (or
    /// `Interrupted`) error.
    struct Stuttering {
        bytes: Vec<u8>,
        pos: usize,
        stall: bool,
        kind: ErrorKind,
    }

    impl Stuttering {
        fn new(bytes: Vec<u8>, kind: ErrorKind) -> Self {
            Self {
                bytes,
                pos: 0,
                stall: true,
                kind,
            }
        }
    }

    impl Read for Stuttering {
        fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
            self.stall = !self.stall;
            if !self.stall {
                return Err(std::io::Error::from(self.kind));
            }
            if self.pos >= self.bytes.len() || buf.is_empty() {
                return Ok(0);
            }
            buf[0] = self.bytes[self.pos];
            self.pos += 1;
            Ok(1)
        }
    }

    #[test]
    fn reads_consecutive_messages() {
        let bytes = wire(&[b"one", b"two", b"three"]);
        let mut reader = FramedMessageReader::new(Cursor::new(bytes));
        let mut buf = [0u8; 16];

        let n = reader.read_message(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"one");
        let n = reader.read_message(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"two");
        let n = reader.read_message(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"three");
        assert!(reader.is_idle());
    }

    #[test]
    fn roundtrip_under_any_fragmentation() {
        let messages: Vec<Vec<u8>> = (1..=40u8).map(|i| vec![i; i as usize * 7]).collect();
        let refs: Vec<&[u8]> = messages.iter().map(Vec::as_slice).collect();
        let bytes = wire(&refs);

        for chunk in [1, 2, 3, 5, 13, 64, 4096] {
            let mut reader = FramedMessageReader::new(ChunkedReader {
                bytes: bytes.clone(),
                pos: 0,
                chunk,
            });
            let mut buf = vec![0u8; 512];
            for expected in &messages {
                let n = reader.read_message(&mut buf).unwrap();
                assert_eq!(&buf[..n], expected.as_slice(), "chunk size {chunk}");
            }
            assert!(matches!(
                reader.read_message(&mut buf),
                Err(FrameError::ConnectionClosed)
            ));
        }
    }

    #[test]
    fn zero_length_header_is_rejected() {
        let mut reader = FramedMessageReader::new(Cursor::new(vec![0, 0, 0, 0, 9, 9]));
        let mut buf = [0u8; 8];
        assert!(matches!(
            reader.read_message(&mut buf),
            Err(FrameError::InvalidMessageSize { size: 0, .. })
        ));
        assert!(reader.is_idle());
    }

    #[test]
    fn header_larger_than_buffer_is_rejected_without_reading_payload() {
        let bytes = wire(&[b"0123456789"]);
        let mut reader = FramedMessageReader::new(Cursor::new(bytes));
        let mut buf = [0u8; 4];

        assert!(matches!(
            reader.read_message(&mut buf),
            Err(FrameError::InvalidMessageSize {
                size: 10,
                capacity: 4
            })
        ));
        assert_eq!(reader.state(), ReadState::Idle);
        assert_eq!(reader.get_ref().position(), HEADER_SIZE as u64);
        assert_eq!(buf, [0u8; 4]);
    }

    #[test]
    fn max_payload_size_caps_capacity() {
        let bytes = wire(&[b"0123456789"]);
        let config = FrameConfig {
            max_payload_size: 8,
            ..FrameConfig::default()
        };
        let mut reader = FramedMessageReader::with_config(Cursor::new(bytes), config);
        let mut buf = [0u8; 64];
        assert!(matches!(
            reader.read_message(&mut buf),
            Err(FrameError::InvalidMessageSize {
                size: 10,
                capacity: 8
            })
        ));
    }

    #[test]
    fn empty_buffer_is_rejected() {
        let mut reader = FramedMessageReader::new(Cursor::new(wire(&[b"x"])));
        assert!(matches!(
            reader.read_message(&mut []),
            Err(FrameError::EmptyBuffer)
        ));
        assert!(reader.is_idle());
    }

    #[test]
    fn would_block_suspends_and_resume_continues() {
        let bytes = wire(&[b"suspended"]);
        let mut reader =
            FramedMessageReader::new(Stuttering::new(bytes, ErrorKind::WouldBlock));
        let mut buf = [0u8; 32];

        let mut result = reader.read_message(&mut buf);
        let mut suspensions = 0;
        while matches!(result, Err(FrameError::WouldBlock)) {
            suspensions += 1;
            assert!(!reader.is_idle());
            result = reader.resume(&mut buf);
        }

        let n = result.unwrap();
        assert_eq!(&buf[..n], b"suspended");
        assert_eq!(suspensions, HEADER_SIZE + b"suspended".len());
        assert!(reader.is_idle());
    }

    #[test]
    fn second_read_while_in_flight_is_rejected() {
        let bytes = wire(&[b"abc"]);
        let mut reader =
            FramedMessageReader::new(Stuttering::new(bytes, ErrorKind::WouldBlock));
        let mut buf = [0u8; 8];

        assert!(matches!(
            reader.read_message(&mut buf),
            Err(FrameError::WouldBlock)
        ));
        let state = reader.state();
        assert!(matches!(
            reader.read_message(&mut buf),
            Err(FrameError::ReadInProgress)
        ));
        assert_eq!(reader.state(), state, "in-flight read must be untouched");
    }

    #[test]
    fn resume_without_read_is_rejected() {
        let mut reader = FramedMessageReader::new(Cursor::new(Vec::new()));
        assert!(matches!(
            reader.resume(&mut [0u8; 4]),
            Err(FrameError::NoReadInProgress)
        ));
    }

    #[test]
    fn interrupted_reads_are_retried() {
        let bytes = wire(&[b"retry"]);
        let mut reader =
            FramedMessageReader::new(Stuttering::new(bytes, ErrorKind::Interrupted));
        let mut buf = [0u8; 8];
        let n = reader.read_message(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"retry");
    }

    #[test]
    fn eof_mid_payload_closes_and_resets() {
        let mut bytes = wire(&[b"truncated"]);
        bytes.truncate(HEADER_SIZE + 3);
        let mut reader = FramedMessageReader::new(Cursor::new(bytes));
        let mut buf = [0u8; 16];

        assert!(matches!(
            reader.read_message(&mut buf),
            Err(FrameError::ConnectionClosed)
        ));
        assert!(reader.is_idle());
    }

    #[test]
    fn io_error_resets_to_idle() {
        struct Broken;
        impl Read for Broken {
            fn read(&mut self, _buf: &mut [u8]) -> std::io::Result<usize> {
                Err(std::io::Error::from(ErrorKind::ConnectionReset))
            }
        }

        let mut reader = FramedMessageReader::new(Broken);
        let err = reader.read_message(&mut [0u8; 4]).unwrap_err();
        assert!(matches!(err, FrameError::Io(ref e) if e.kind() == ErrorKind::ConnectionReset));
        assert!(err.is_transport());
        assert!(reader.is_idle());
    }

    #[test]
    fn next_message_returns_owned_payloads() {
        let bytes = wire(&[b"alpha", b"beta"]);
        let mut reader = FramedMessageReader::new(ChunkedReader {
            bytes,
            pos: 0,
            chunk: 3,
        });

        assert_eq!(reader.next_message().unwrap().as_ref(), b"alpha");
        assert_eq!(reader.next_message().unwrap().as_ref(), b"beta");
        assert!(matches!(
            reader.next_message(),
            Err(FrameError::ConnectionClosed)
        ));
    }

    #[test]
    fn next_message_survives_would_block() {
        let bytes = wire(&[b"later"]);
        let mut reader =
            FramedMessageReader::new(Stuttering::new(bytes, ErrorKind::WouldBlock));
        let message = loop {
            match reader.next_message() {
                Ok(message) => break message,
                Err(FrameError::WouldBlock) => continue,
                Err(err) => panic!("unexpected error: {err}"),
            }
        };
        assert_eq!(message.as_ref(), b"later");
    }

    #[test]
    #[cfg(unix)]
    fn roundtrip_over_socket_pair() {
        let (left, right) = IpcStream::pair().unwrap();
        let mut writer = crate::writer::FrameWriter::new(left);
        let mut reader = FramedMessageReader::new(right);

        let sender = std::thread::spawn(move || {
            for i in 0..64u32 {
                writer.send(format!("msg-{i}").as_bytes()).unwrap();
            }
        });

        let mut buf = [0u8; 32];
        for i in 0..64u32 {
            let n = reader.read_message(&mut buf).unwrap();
            assert_eq!(&buf[..n], format!("msg-{i}").as_bytes());
        }
        sender.join().unwrap();
    }

    #[test]
    #[cfg(unix)]
    fn read_timeout_suspends_instead_of_failing() {
        let (mut left, right) = IpcStream::pair().unwrap();
        let config = FrameConfig {
            read_timeout: Some(std::time::Duration::from_millis(20)),
            ..FrameConfig::default()
        };
        let mut reader = FramedMessageReader::with_config_ipc(right, config).unwrap();

        std::io::Write::write_all(&mut left, &[0, 0, 0, 4, b'a', b'b']).unwrap();
        let mut buf = [0u8; 8];
        assert!(matches!(
            reader.read_message(&mut buf),
            Err(FrameError::WouldBlock)
        ));
        assert_eq!(reader.state(), ReadState::ReadingPayload);

        std::io::Write::write_all(&mut left, b"cd").unwrap();
        let n = reader.resume(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"abcd");
    }

    #[cfg(feature = "async")]
    mod nonblocking {
        use futures_util::FutureExt;
        use tokio::io::AsyncWriteExt;

        use super::*;

        #[tokio::test]
        async fn async_read_across_partial_writes() {
            let (mut client, server) = tokio::io::duplex(8);
            let bytes = wire(&[b"hello over duplex", b"second"]);

            let writer = tokio::spawn(async move {
                for piece in bytes.chunks(3) {
                    client.write_all(piece).await.unwrap();
                    tokio::task::yield_now().await;
                }
            });

            let mut reader = FramedMessageReader::new(server);
            let mut buf = [0u8; 64];
            let n = reader.read_message_async(&mut buf).await.unwrap();
            assert_eq!(&buf[..n], b"hello over duplex");
            let n = reader.read_message_async(&mut buf).await.unwrap();
            assert_eq!(&buf[..n], b"second");
            writer.await.unwrap();
        }

        #[tokio::test]
        async fn dropped_future_leaves_read_in_flight() {
            let (mut client, server) = tokio::io::duplex(64);
            client.write_all(&[0, 0, 0, 5, b'p', b'a']).await.unwrap();

            let mut reader = FramedMessageReader::new(server);
            let mut buf = [0u8; 16];
            assert!(reader.read_message_async(&mut buf).now_or_never().is_none());
            assert_eq!(reader.state(), ReadState::ReadingPayload);

            client.write_all(b"rts").await.unwrap();
            let n = std::future::poll_fn(|cx| reader.poll_read_message(cx, &mut buf))
                .await
                .unwrap();
            assert_eq!(&buf[..n], b"parts");
            assert!(reader.is_idle());
        }

        #[tokio::test]
        async fn async_rejects_oversized_header() {
            let (mut client, server) = tokio::io::duplex(64);
            client.write_all(&[0, 0, 1, 0]).await.unwrap();

            let mut reader = FramedMessageReader::new(server);
            let mut buf = [0u8; 16];
            assert!(matches!(
                reader.read_message_async(&mut buf).await,
                Err(FrameError::InvalidMessageSize {
                    size: 256,
                    capacity: 16
                })
            ));
            assert!(reader.is_idle());
        }

        #[tokio::test]
        async fn async_eof_reports_closed() {
            let (client, server) = tokio::io::duplex(64);
            drop(client);
            let mut reader = FramedMessageReader::new(server);
            assert!(matches!(
                reader.read_message_async(&mut [0u8; 4]).await,
                Err(FrameError::ConnectionClosed)
            ));
        }
    }
}
