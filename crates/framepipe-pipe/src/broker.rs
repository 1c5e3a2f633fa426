use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use tracing::trace;

use crate::data_pipe::{Consumer, Producer};
use crate::error::Result;
use crate::raw_channel::RawChannel;

/// Opaque reference to a resource parked in a [`Broker`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Token(pub u64);

/// A resource that cannot be written into serialized bytes and has to be
/// handed over out of band.
pub enum Transferable {
    Channel(Box<dyn RawChannel>),
    Producer(Producer),
    Consumer(Consumer),
    #[cfg(unix)]
    Platform(std::os::fd::OwnedFd),
}

impl Transferable {
    /// Whether this is an OS-level handle the receiver must adopt.
    pub fn is_platform(&self) -> bool {
        #[cfg(unix)]
        {
            matches!(self, Transferable::Platform(_))
        }
        #[cfg(not(unix))]
        {
            false
        }
    }
}

impl fmt::Debug for Transferable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Transferable::Channel(_) => f.write_str("Channel"),
            Transferable::Producer(producer) => f.debug_tuple("Producer").field(producer).finish(),
            Transferable::Consumer(consumer) => f.debug_tuple("Consumer").field(consumer).finish(),
            #[cfg(unix)]
            Transferable::Platform(fd) => f.debug_tuple("Platform").field(fd).finish(),
        }
    }
}

/// Exchanges transferables for tokens and back.
///
/// Serialization registers every transferable it meets; deserialization in
/// the receiving context redeems the tokens. Each token is redeemable once.
pub trait Broker {
    fn register(&mut self, transferable: Transferable) -> Result<Token>;

    fn redeem(&mut self, token: Token) -> Option<Transferable>;
}

/// Broker for transfers within one process.
#[derive(Default)]
pub struct InMemoryBroker {
    next: u64,
    parked: HashMap<Token, Transferable>,
}

impl InMemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of registered, not yet redeemed, transferables.
    pub fn len(&self) -> usize {
        self.parked.len()
    }

    pub fn is_empty(&self) -> bool {
        self.parked.is_empty()
    }
}

impl Broker for InMemoryBroker {
    fn register(&mut self, transferable: Transferable) -> Result<Token> {
        self.next += 1;
        let token = Token(self.next);
        trace!(?token, ?transferable, "parked transferable");
        self.parked.insert(token, transferable);
        Ok(token)
    }

    fn redeem(&mut self, token: Token) -> Option<Transferable> {
        self.parked.remove(&token)
    }
}

impl fmt::Debug for InMemoryBroker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InMemoryBroker")
            .field("parked", &self.parked.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Configuration;
    use crate::data_pipe::{DataPipe, DataPipeOptions};

    #[test]
    fn tokens_redeem_once() {
        let (producer, _consumer) =
            DataPipe::create(DataPipeOptions::default(), &Configuration::default()).unwrap();
        let mut broker = InMemoryBroker::new();

        let token = broker.register(Transferable::Producer(producer)).unwrap();
        assert_eq!(broker.len(), 1);
        assert!(matches!(broker.redeem(token), Some(Transferable::Producer(_))));
        assert!(broker.redeem(token).is_none());
        assert!(broker.is_empty());
    }
}
