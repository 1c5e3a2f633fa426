//! Bounded single-producer, single-consumer byte channel.
//!
//! A data pipe moves elements of a fixed size from a [`Producer`] to a
//! [`Consumer`] through a ring buffer of fixed capacity. Nothing here blocks:
//! an operation that cannot make progress returns [`PipeError::ShouldWait`]
//! and the caller waits on the endpoint's signals.
//!
//! Besides copying reads and writes, both sides support two-phase access: a
//! `begin_*` call lends out a contiguous region of the ring, and the matching
//! `end_*` call commits however much of it was used.

use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

use crate::config::Configuration;
use crate::error::{PipeError, Result};
use crate::ring::Ring;
use crate::signals::{Signals, SignalsState};

/// Creation options for a data pipe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DataPipeOptions {
    /// Size of one element. Every transfer is a whole number of elements.
    pub element_num_bytes: u32,
    /// Ring capacity; 0 selects the configured default. Rounded up to a
    /// multiple of the element size.
    pub capacity_num_bytes: u32,
}

impl Default for DataPipeOptions {
    fn default() -> Self {
        Self {
            element_num_bytes: 1,
            capacity_num_bytes: 0,
        }
    }
}

impl DataPipeOptions {
    pub fn new(element_num_bytes: u32, capacity_num_bytes: u32) -> Self {
        Self {
            element_num_bytes,
            capacity_num_bytes,
        }
    }
}

/// How much of a request must be satisfied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transfer {
    /// Transfer everything or nothing.
    AllOrNone,
    /// Transfer as much as currently possible.
    BestEffort,
}

/// Constructor namespace for data pipes.
pub struct DataPipe;

impl DataPipe {
    /// Create a connected producer/consumer pair.
    pub fn create(
        options: DataPipeOptions,
        config: &Configuration,
    ) -> Result<(Producer, Consumer)> {
        let (element_size, capacity) = validate(options, config)?;
        let shared = Arc::new(Shared {
            element_size,
            capacity,
            state: Mutex::new(State {
                producer_open: true,
                consumer_open: true,
                ring: Some(Arc::new(Ring::new(capacity))),
                start: 0,
                len: 0,
                write_reserved: None,
                read_reserved: None,
            }),
            #[cfg(feature = "async")]
            notify: tokio::sync::Notify::new(),
        });
        debug!(element_size, capacity, "created data pipe");

        Ok((
            Producer {
                shared: Arc::clone(&shared),
                reservation: None,
                closed: false,
            },
            Consumer {
                shared,
                reservation: None,
                closed: false,
            },
        ))
    }
}

fn validate(options: DataPipeOptions, config: &Configuration) -> Result<(usize, usize)> {
    let element = options.element_num_bytes as usize;
    if element == 0 {
        return Err(PipeError::InvalidArgument("element size must be non-zero"));
    }

    let capacity = match options.capacity_num_bytes as usize {
        0 => {
            let default = config.default_data_pipe_capacity_bytes;
            (default - default % element).max(element)
        }
        requested => requested.div_ceil(element) * element,
    };

    if capacity > config.max_data_pipe_capacity_bytes {
        return Err(PipeError::ResourceExhausted {
            what: "data pipe capacity",
            size: capacity,
            limit: config.max_data_pipe_capacity_bytes,
        });
    }
    Ok((element, capacity))
}

struct Shared {
    element_size: usize,
    capacity: usize,
    state: Mutex<State>,
    #[cfg(feature = "async")]
    notify: tokio::sync::Notify,
}

struct State {
    producer_open: bool,
    consumer_open: bool,
    /// Released once both endpoints are closed.
    ring: Option<Arc<Ring>>,
    /// Offset of the oldest buffered byte.
    start: usize,
    /// Buffered (committed, unread) bytes.
    len: usize,
    write_reserved: Option<usize>,
    read_reserved: Option<usize>,
}

impl State {
    fn ring(&self) -> Result<Arc<Ring>> {
        self.ring
            .clone()
            .ok_or(PipeError::FailedPrecondition("data pipe storage was released"))
    }

    /// Rewind to the start of the ring when nothing is buffered or lent out,
    /// so that two-phase regions are as large as possible.
    fn compact(&mut self) {
        if self.len == 0 && self.read_reserved.is_none() && self.write_reserved.is_none() {
            self.start = 0;
        }
    }

    fn release_if_unused(&mut self) {
        if !self.producer_open && !self.consumer_open && self.ring.take().is_some() {
            debug!("both data pipe endpoints closed; releasing storage");
        }
    }
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn check_aligned(&self, num_bytes: usize) -> Result<()> {
        if num_bytes % self.element_size != 0 {
            return Err(PipeError::InvalidArgument(
                "byte count is not a multiple of the element size",
            ));
        }
        Ok(())
    }

    fn wake(&self) {
        #[cfg(feature = "async")]
        self.notify.notify_waiters();
    }

    #[cfg(feature = "async")]
    async fn wait_for(
        &self,
        signals: Signals,
        current: impl Fn() -> SignalsState,
    ) -> Result<SignalsState> {
        loop {
            let mut notified = std::pin::pin!(self.notify.notified());
            notified.as_mut().enable();

            let state = current();
            if state.any_satisfied(signals) {
                return Ok(state);
            }
            if !state.any_satisfiable(signals) {
                return Err(PipeError::FailedPrecondition(
                    "requested signals can never be satisfied",
                ));
            }
            notified.await;
        }
    }
}

/// A region of the ring lent to one endpoint by a two-phase operation.
struct Reservation {
    ring: Arc<Ring>,
    offset: usize,
    len: usize,
}

/// Writing end of a data pipe.
pub struct Producer {
    shared: Arc<Shared>,
    reservation: Option<Reservation>,
    closed: bool,
}

impl Producer {
    pub fn element_num_bytes(&self) -> usize {
        self.shared.element_size
    }

    pub fn capacity_num_bytes(&self) -> usize {
        self.shared.capacity
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed {
            return Err(PipeError::FailedPrecondition("producer is closed"));
        }
        Ok(())
    }

    /// Copy `data` into the pipe and return how many bytes were written.
    pub fn write(&mut self, data: &[u8], transfer: Transfer) -> Result<usize> {
        self.ensure_open()?;
        self.shared.check_aligned(data.len())?;

        let mut state = self.shared.lock();
        if state.write_reserved.is_some() {
            return Err(PipeError::FailedPrecondition("two-phase write in progress"));
        }
        if !state.consumer_open {
            return Err(PipeError::FailedPrecondition("consumer is closed"));
        }
        if data.is_empty() {
            return Ok(0);
        }

        let free = self.shared.capacity - state.len;
        let count = match transfer {
            Transfer::AllOrNone if data.len() > free => {
                return Err(PipeError::OutOfRange {
                    requested: data.len(),
                    available: free,
                });
            }
            Transfer::AllOrNone => data.len(),
            Transfer::BestEffort if free == 0 => return Err(PipeError::ShouldWait),
            Transfer::BestEffort => data.len().min(free),
        };

        let ring = state.ring()?;
        let at = (state.start + state.len) % self.shared.capacity;
        // SAFETY: `at..at + count` (mod capacity) lies in free space, and no
        // write reservation exists.
        unsafe { ring.write_wrapping(at, &data[..count]) };
        state.len += count;
        drop(state);

        trace!(count, "data pipe write");
        self.shared.wake();
        Ok(count)
    }

    /// Lend out a contiguous writable region.
    ///
    /// The region holds at least one element; when `requested` is non-zero it
    /// holds at most `requested` bytes. Commit with [`end_write`](Self::end_write).
    pub fn begin_write(&mut self, requested: usize) -> Result<&mut [u8]> {
        self.ensure_open()?;
        self.shared.check_aligned(requested)?;

        let mut state = self.shared.lock();
        if state.write_reserved.is_some() {
            return Err(PipeError::FailedPrecondition("two-phase write in progress"));
        }
        if !state.consumer_open {
            return Err(PipeError::FailedPrecondition("consumer is closed"));
        }
        state.compact();

        let capacity = self.shared.capacity;
        let free = capacity - state.len;
        if free == 0 {
            return Err(PipeError::ShouldWait);
        }
        let at = (state.start + state.len) % capacity;
        let mut len = free.min(capacity - at);
        if requested > 0 {
            len = len.min(requested);
        }

        let ring = state.ring()?;
        state.write_reserved = Some(len);
        drop(state);

        trace!(offset = at, len, "begin two-phase write");
        self.reservation = Some(Reservation {
            ring,
            offset: at,
            len,
        });
        self.write_buffer()
    }

    /// The region lent out by the outstanding [`begin_write`](Self::begin_write).
    pub fn write_buffer(&mut self) -> Result<&mut [u8]> {
        let reservation = self
            .reservation
            .as_ref()
            .ok_or(PipeError::FailedPrecondition("no two-phase write in progress"))?;
        // SAFETY: the region is reserved for this producer until `end_write`
        // or `close`, both of which need `&mut self`.
        Ok(unsafe { reservation.ring.slice_mut(reservation.offset, reservation.len) })
    }

    /// Commit `actual` bytes of the outstanding two-phase write.
    ///
    /// An invalid `actual` still ends the two-phase write, committing nothing.
    pub fn end_write(&mut self, actual: usize) -> Result<()> {
        self.ensure_open()?;
        let reservation = self
            .reservation
            .take()
            .ok_or(PipeError::FailedPrecondition("no two-phase write in progress"))?;

        let mut state = self.shared.lock();
        state.write_reserved = None;
        let result = if actual > reservation.len {
            Err(PipeError::InvalidArgument(
                "committed more bytes than were reserved",
            ))
        } else if let Err(err) = self.shared.check_aligned(actual) {
            Err(err)
        } else {
            state.len += actual;
            Ok(())
        };
        state.compact();
        drop(state);

        trace!(actual, ok = result.is_ok(), "end two-phase write");
        self.shared.wake();
        result
    }

    /// Close the producer. Buffered data stays readable. Idempotent.
    pub fn close(&mut self) {
        if std::mem::replace(&mut self.closed, true) {
            return;
        }
        self.reservation = None;

        let mut state = self.shared.lock();
        state.producer_open = false;
        state.write_reserved = None;
        state.release_if_unused();
        drop(state);

        debug!("data pipe producer closed");
        self.shared.wake();
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    pub fn signals_state(&self) -> SignalsState {
        let mut out = SignalsState::default();
        if self.closed {
            return out;
        }

        let state = self.shared.lock();
        let free = self.shared.capacity - state.len;
        out.satisfied.set(
            Signals::WRITABLE,
            state.consumer_open && free > 0 && state.write_reserved.is_none(),
        );
        out.satisfied.set(Signals::PEER_CLOSED, !state.consumer_open);
        out.satisfiable.set(Signals::WRITABLE, state.consumer_open);
        out.satisfiable |= Signals::PEER_CLOSED;
        out
    }

    /// Resolve once any of `signals` is satisfied.
    ///
    /// Fails with `FailedPrecondition` once none of them can be.
    #[cfg(feature = "async")]
    pub async fn wait(&self, signals: Signals) -> Result<SignalsState> {
        self.shared.wait_for(signals, || self.signals_state()).await
    }
}

impl Drop for Producer {
    fn drop(&mut self) {
        self.close();
    }
}

impl fmt::Debug for Producer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Producer")
            .field("element_num_bytes", &self.shared.element_size)
            .field("capacity_num_bytes", &self.shared.capacity)
            .field("closed", &self.closed)
            .finish()
    }
}

/// Reading end of a data pipe.
pub struct Consumer {
    shared: Arc<Shared>,
    reservation: Option<Reservation>,
    closed: bool,
}

impl Consumer {
    pub fn element_num_bytes(&self) -> usize {
        self.shared.element_size
    }

    pub fn capacity_num_bytes(&self) -> usize {
        self.shared.capacity
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed {
            return Err(PipeError::FailedPrecondition("consumer is closed"));
        }
        Ok(())
    }

    /// Copy data out of the pipe, consuming it.
    pub fn read(&mut self, buf: &mut [u8], transfer: Transfer) -> Result<usize> {
        self.consume(buf.len(), transfer, Some(buf), true)
    }

    /// Copy data out of the pipe, leaving it buffered.
    pub fn peek(&mut self, buf: &mut [u8], transfer: Transfer) -> Result<usize> {
        self.consume(buf.len(), transfer, Some(buf), false)
    }

    /// Drop up to `num_bytes` of buffered data.
    pub fn discard(&mut self, num_bytes: usize, transfer: Transfer) -> Result<usize> {
        self.consume(num_bytes, transfer, None, true)
    }

    fn consume(
        &mut self,
        requested: usize,
        transfer: Transfer,
        dst: Option<&mut [u8]>,
        advance: bool,
    ) -> Result<usize> {
        self.ensure_open()?;
        self.shared.check_aligned(requested)?;

        let mut state = self.shared.lock();
        if state.read_reserved.is_some() {
            return Err(PipeError::FailedPrecondition("two-phase read in progress"));
        }
        if requested == 0 {
            return Ok(0);
        }

        let count = match transfer {
            Transfer::AllOrNone if requested > self.shared.capacity => {
                return Err(PipeError::OutOfRange {
                    requested,
                    available: state.len,
                });
            }
            Transfer::AllOrNone if requested > state.len => {
                if !state.producer_open {
                    return Err(PipeError::FailedPrecondition(
                        "producer closed with too little data buffered",
                    ));
                }
                return Err(PipeError::OutOfRange {
                    requested,
                    available: state.len,
                });
            }
            Transfer::AllOrNone => requested,
            Transfer::BestEffort if state.len == 0 => {
                if !state.producer_open {
                    return Err(PipeError::FailedPrecondition(
                        "producer closed and the pipe is drained",
                    ));
                }
                return Err(PipeError::ShouldWait);
            }
            Transfer::BestEffort => requested.min(state.len),
        };

        if let Some(dst) = dst {
            let ring = state.ring()?;
            // SAFETY: `start..start + count` (mod capacity) is committed data;
            // the producer only writes into free space.
            unsafe { ring.read_wrapping(state.start, &mut dst[..count]) };
        }

        if advance {
            state.start = (state.start + count) % self.shared.capacity;
            state.len -= count;
            state.compact();
            drop(state);
            trace!(count, "data pipe read");
            self.shared.wake();
        }
        Ok(count)
    }

    /// Number of bytes currently buffered.
    pub fn query(&self) -> Result<usize> {
        self.ensure_open()?;
        Ok(self.shared.lock().len)
    }

    /// Lend out a contiguous readable region.
    ///
    /// The region stays valid and unchanged while the producer keeps
    /// writing. Consume with [`end_read`](Self::end_read).
    pub fn begin_read(&mut self) -> Result<&[u8]> {
        self.ensure_open()?;

        let mut state = self.shared.lock();
        if state.read_reserved.is_some() {
            return Err(PipeError::FailedPrecondition("two-phase read in progress"));
        }
        if state.len == 0 {
            if !state.producer_open {
                return Err(PipeError::FailedPrecondition(
                    "producer closed and the pipe is drained",
                ));
            }
            return Err(PipeError::ShouldWait);
        }

        let offset = state.start;
        let len = state.len.min(self.shared.capacity - offset);
        let ring = state.ring()?;
        state.read_reserved = Some(len);
        drop(state);

        trace!(offset, len, "begin two-phase read");
        self.reservation = Some(Reservation { ring, offset, len });
        self.read_buffer()
    }

    /// The region lent out by the outstanding [`begin_read`](Self::begin_read).
    pub fn read_buffer(&self) -> Result<&[u8]> {
        let reservation = self
            .reservation
            .as_ref()
            .ok_or(PipeError::FailedPrecondition("no two-phase read in progress"))?;
        // SAFETY: the region is committed data that the producer cannot
        // overwrite until `end_read` releases it.
        Ok(unsafe { reservation.ring.slice(reservation.offset, reservation.len) })
    }

    /// Consume `actual` bytes of the outstanding two-phase read.
    ///
    /// An invalid `actual` still ends the two-phase read, consuming nothing.
    pub fn end_read(&mut self, actual: usize) -> Result<()> {
        self.ensure_open()?;
        let reservation = self
            .reservation
            .take()
            .ok_or(PipeError::FailedPrecondition("no two-phase read in progress"))?;

        let mut state = self.shared.lock();
        state.read_reserved = None;
        let result = if actual > reservation.len {
            Err(PipeError::InvalidArgument(
                "consumed more bytes than were lent out",
            ))
        } else if let Err(err) = self.shared.check_aligned(actual) {
            Err(err)
        } else {
            state.start = (state.start + actual) % self.shared.capacity;
            state.len -= actual;
            Ok(())
        };
        state.compact();
        drop(state);

        trace!(actual, ok = result.is_ok(), "end two-phase read");
        self.shared.wake();
        result
    }

    /// Close the consumer. Further producer writes fail. Idempotent.
    pub fn close(&mut self) {
        if std::mem::replace(&mut self.closed, true) {
            return;
        }
        self.reservation = None;

        let mut state = self.shared.lock();
        state.consumer_open = false;
        state.read_reserved = None;
        state.release_if_unused();
        drop(state);

        debug!("data pipe consumer closed");
        self.shared.wake();
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    pub fn signals_state(&self) -> SignalsState {
        let mut out = SignalsState::default();
        if self.closed {
            return out;
        }

        let state = self.shared.lock();
        out.satisfied.set(
            Signals::READABLE,
            state.len > 0 && state.read_reserved.is_none(),
        );
        out.satisfied.set(Signals::PEER_CLOSED, !state.producer_open);
        out.satisfiable
            .set(Signals::READABLE, state.len > 0 || state.producer_open);
        out.satisfiable |= Signals::PEER_CLOSED;
        out
    }

    /// Resolve once any of `signals` is satisfied.
    ///
    /// Fails with `FailedPrecondition` once none of them can be.
    #[cfg(feature = "async")]
    pub async fn wait(&self, signals: Signals) -> Result<SignalsState> {
        self.shared.wait_for(signals, || self.signals_state()).await
    }
}

impl Drop for Consumer {
    fn drop(&mut self) {
        self.close();
    }
}

impl fmt::Debug for Consumer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Consumer")
            .field("element_num_bytes", &self.shared.element_size)
            .field("capacity_num_bytes", &self.shared.capacity)
            .field("closed", &self.closed)
            .finish()
    }
}
