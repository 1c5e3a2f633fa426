use bitflags::bitflags;

bitflags! {
    /// A set of readiness conditions.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct Signals: u32 {
        const READABLE = 1 << 0;
        const WRITABLE = 1 << 1;
        const PEER_CLOSED = 1 << 2;
    }
}

impl Default for Signals {
    fn default() -> Self {
        Signals::empty()
    }
}

/// Point-in-time readiness of an endpoint.
///
/// `satisfied` holds what is true now; `satisfiable` what could still become
/// true. A waiter whose signals drop out of `satisfiable` will never be woken
/// by them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SignalsState {
    pub satisfied: Signals,
    pub satisfiable: Signals,
}

impl SignalsState {
    pub fn is_satisfied(&self, signals: Signals) -> bool {
        self.satisfied.contains(signals)
    }

    pub fn is_satisfiable(&self, signals: Signals) -> bool {
        self.satisfiable.contains(signals)
    }

    /// True when at least one of `signals` is satisfied now.
    pub fn any_satisfied(&self, signals: Signals) -> bool {
        self.satisfied.intersects(signals)
    }

    /// True when at least one of `signals` can still become satisfied.
    pub fn any_satisfiable(&self, signals: Signals) -> bool {
        self.satisfiable.intersects(signals)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_operations() {
        let both = Signals::READABLE | Signals::PEER_CLOSED;
        assert!(both.contains(Signals::READABLE));
        assert!(!both.contains(Signals::READABLE | Signals::WRITABLE));
        assert!(both.intersects(Signals::READABLE | Signals::WRITABLE));
        assert_eq!(both & Signals::PEER_CLOSED, Signals::PEER_CLOSED);
        assert!(Signals::default().is_empty());
        assert_eq!(Signals::all().bits(), 0b111);
    }

    #[test]
    fn state_queries() {
        let state = SignalsState {
            satisfied: Signals::WRITABLE,
            satisfiable: Signals::WRITABLE | Signals::READABLE | Signals::PEER_CLOSED,
        };
        assert!(state.any_satisfied(Signals::READABLE | Signals::WRITABLE));
        assert!(!state.is_satisfied(Signals::READABLE | Signals::WRITABLE));
        assert!(state.is_satisfiable(Signals::READABLE));
        assert!(!SignalsState::default().any_satisfiable(Signals::all()));
    }
}
