use serde::Serialize;

/// Which endpoint of an edge.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Side {
    Source,
    Target,
}

impl Side {
    pub(crate) fn other(self) -> Side {
        match self {
            Side::Source => Side::Target,
            Side::Target => Side::Source,
        }
    }

    fn index(self) -> usize {
        match self {
            Side::Source => 0,
            Side::Target => 1,
        }
    }
}

/// The token on one local edge. Exactly one endpoint owns it; a request
/// bit per endpoint records who is waiting for it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Fork {
    pub(crate) owner: Side,
    pub(crate) dirty: bool,
    requests: [bool; 2],
}

impl Fork {
    pub(crate) fn dirty_owned_by(owner: Side) -> Self {
        Self {
            owner,
            dirty: true,
            requests: [false; 2],
        }
    }

    /// A freshly handed-over fork: clean, no requests pending.
    pub(crate) fn clean_owned_by(owner: Side) -> Self {
        Self {
            owner,
            dirty: false,
            requests: [false; 2],
        }
    }

    pub(crate) fn request(&mut self, by: Side) {
        self.requests[by.index()] = true;
    }

    pub(crate) fn requested_by(&self, side: Side) -> bool {
        self.requests[side.index()]
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum PhilosopherState {
    Thinking,
    Hungry,
    /// Holds every local fork and waits for the other replicas.
    HorsDoeuvre,
    Eating,
}

#[derive(Debug)]
pub(crate) struct Philosopher {
    /// Local incident edges.
    pub(crate) num_edges: usize,
    pub(crate) forks_acquired: usize,
    pub(crate) state: PhilosopherState,
    /// Master only: replicas that still have to signal readiness.
    pub(crate) counter: usize,
    pub(crate) cancellation_sent: bool,
    /// Flipped on every hunger episode; stale callbacks carry the old value.
    pub(crate) lock_id: bool,
}

impl Philosopher {
    pub(crate) fn new(num_edges: usize) -> Self {
        Self {
            num_edges,
            forks_acquired: 0,
            state: PhilosopherState::Thinking,
            counter: 0,
            cancellation_sent: false,
            lock_id: false,
        }
    }

    pub(crate) fn holds_all_forks(&self) -> bool {
        self.forks_acquired == self.num_edges
    }

    /// Hungry with every fork in hand: move to hors d'oeuvre. Returns
    /// whether the transition happened.
    pub(crate) fn try_enter_hors_doeuvre(&mut self) -> bool {
        if self.state == PhilosopherState::Hungry && self.holds_all_forks() {
            self.state = PhilosopherState::HorsDoeuvre;
            self.cancellation_sent = false;
            true
        } else {
            false
        }
    }
}

/// Order a (mine, other) pair as (source, target).
pub(crate) fn by_side<'x, T>(my_side: Side, mine: &'x mut T, other: &'x mut T) -> (&'x mut T, &'x mut T) {
    match my_side {
        Side::Source => (mine, other),
        Side::Target => (other, mine),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn handover_clears_requests() {
        let mut f = Fork::dirty_owned_by(Side::Source);
        f.request(Side::Target);
        assert!(f.requested_by(Side::Target));
        assert!(!f.requested_by(Side::Source));

        let f = Fork::clean_owned_by(f.owner.other());
        assert_eq!(f.owner, Side::Target);
        assert!(!f.dirty);
        assert!(!f.requested_by(Side::Target));
    }

    #[test]
    fn hors_doeuvre_needs_all_forks() {
        let mut p = Philosopher::new(2);
        p.state = PhilosopherState::Hungry;
        p.forks_acquired = 1;
        assert!(!p.try_enter_hors_doeuvre());
        p.forks_acquired = 2;
        p.cancellation_sent = true;
        assert!(p.try_enter_hors_doeuvre());
        assert_eq!(p.state, PhilosopherState::HorsDoeuvre);
        assert!(!p.cancellation_sent);
    }
}
