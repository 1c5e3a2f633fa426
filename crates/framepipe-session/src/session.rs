use std::collections::BTreeMap;

use framepipe_pipe::{
    Configuration, Consumer, DataPipe, DataPipeOptions, Producer, Signals, Transfer,
};
use tracing::{debug, trace, warn};

use crate::error::{Result, SessionError};
use crate::policy::{CloseReason, StreamAdmission, StreamPolicy};

pub type StreamId = u64;

/// Open-stream registry for one session.
///
/// Each open stream owns the producer end of a data pipe; the consumer end
/// goes to whoever handles the stream. Streams whose consumer has been
/// closed are dropped from the registry before each admission check, so
/// they stop counting against the limit.
pub struct Session {
    policy: StreamPolicy,
    pipe_config: Configuration,
    pipe_options: DataPipeOptions,
    streams: BTreeMap<StreamId, Producer>,
    next_outgoing: StreamId,
    close_reason: Option<CloseReason>,
}

impl Session {
    pub fn new(policy: StreamPolicy, pipe_config: Configuration) -> Self {
        Self {
            policy,
            pipe_config,
            pipe_options: DataPipeOptions::default(),
            streams: BTreeMap::new(),
            next_outgoing: 2,
            close_reason: None,
        }
    }

    /// Override the options used for every stream's data pipe.
    pub fn with_data_pipe_options(mut self, options: DataPipeOptions) -> Self {
        self.pipe_options = options;
        self
    }

    pub fn policy(&self) -> &StreamPolicy {
        &self.policy
    }

    pub fn open_stream_count(&self) -> usize {
        self.streams.len()
    }

    pub fn is_stream_open(&self, stream_id: StreamId) -> bool {
        self.streams.contains_key(&stream_id)
    }

    /// Reason the session was closed, once a stream has been rejected.
    pub fn close_reason(&self) -> Option<CloseReason> {
        self.close_reason
    }

    fn ensure_open(&self) -> Result<()> {
        match self.close_reason {
            Some(reason) => Err(SessionError::Closed(reason)),
            None => Ok(()),
        }
    }

    /// Admit a peer-initiated stream and return the consumer for its data.
    ///
    /// A rejection closes the session with the policy's reason.
    pub fn open_incoming(&mut self, stream_id: StreamId) -> Result<Consumer> {
        self.ensure_open()?;
        if self.streams.contains_key(&stream_id) {
            return Err(SessionError::DuplicateStream(stream_id));
        }
        self.reap_closed_streams();

        match self.policy.admit(stream_id, self.streams.len()) {
            StreamAdmission::Accept => self.register(stream_id),
            StreamAdmission::Reject(reason) => {
                warn!(
                    stream_id,
                    open = self.streams.len(),
                    max = self.policy.max_open_streams,
                    %reason,
                    "incoming stream rejected, closing session"
                );
                self.close_reason = Some(reason);
                self.streams.clear();
                Err(SessionError::Rejected { stream_id, reason })
            }
        }
    }

    /// Open a locally-initiated stream with the next even id.
    ///
    /// Fails with `OutgoingLimit` when the session is already at its
    /// open-stream limit; unlike an incoming rejection, the session stays
    /// open and no id is consumed.
    pub fn open_outgoing(&mut self) -> Result<(StreamId, Consumer)> {
        self.ensure_open()?;
        self.reap_closed_streams();
        let max = self.policy.max_open_streams;
        if self.streams.len() >= max {
            debug!(open = self.streams.len(), max, "outgoing stream refused");
            return Err(SessionError::OutgoingLimit {
                open: self.streams.len(),
                max,
            });
        }

        let stream_id = self.next_outgoing;
        self.next_outgoing += 2;
        let consumer = self.register(stream_id)?;
        Ok((stream_id, consumer))
    }

    fn register(&mut self, stream_id: StreamId) -> Result<Consumer> {
        let (producer, consumer) = DataPipe::create(self.pipe_options, &self.pipe_config)?;
        self.streams.insert(stream_id, producer);
        debug!(stream_id, open = self.streams.len(), "stream opened");
        Ok(consumer)
    }

    /// Deposit bytes that arrived on `stream_id` into its pipe.
    ///
    /// Best effort: returns how many bytes fit. A full pipe yields
    /// `Pipe(ShouldWait)`; the caller holds the rest back until the
    /// consumer drains.
    pub fn on_stream_data(&mut self, stream_id: StreamId, data: &[u8]) -> Result<usize> {
        self.ensure_open()?;
        let producer = self
            .streams
            .get_mut(&stream_id)
            .ok_or(SessionError::UnknownStream(stream_id))?;
        let written = producer.write(data, Transfer::BestEffort)?;
        trace!(stream_id, written, offered = data.len(), "stream data");
        Ok(written)
    }

    /// Finish a stream. Its consumer can still drain what was delivered.
    pub fn close_stream(&mut self, stream_id: StreamId) -> Result<()> {
        let mut producer = self
            .streams
            .remove(&stream_id)
            .ok_or(SessionError::UnknownStream(stream_id))?;
        producer.close();
        debug!(stream_id, open = self.streams.len(), "stream closed");
        Ok(())
    }

    /// Drop streams nobody reads any more. Returns how many were removed.
    pub fn reap_closed_streams(&mut self) -> usize {
        let before = self.streams.len();
        self.streams.retain(|stream_id, producer| {
            let abandoned = producer.signals_state().is_satisfied(Signals::PEER_CLOSED);
            if abandoned {
                debug!(stream_id, "reaping stream with closed consumer");
            }
            !abandoned
        });
        before - self.streams.len()
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("policy", &self.policy)
            .field("open_streams", &self.streams.keys().collect::<Vec<_>>())
            .field("next_outgoing", &self.next_outgoing)
            .field("close_reason", &self.close_reason)
            .finish()
    }
}
