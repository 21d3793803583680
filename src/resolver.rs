//! Deterministic conflict resolution for racing writes.
//!
//! Every mutable field carries a [`WriteStamp`] — the writer's wall-clock
//! timestamp plus its actor token. When two writes race, the later
//! timestamp wins; exact ties break on actor-token byte order. This is
//! last-write-wins, not causal ordering: deterministic everywhere, fair
//! nowhere, and sufficient for a domain with no cross-player invariants.

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

use crate::record::ActorToken;

/// Timestamp + author of a field write.
///
/// Total order: `timestamp_ms` first, actor token bytes second. The
/// greater stamp wins; on an exact timestamp tie the greater token wins.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WriteStamp {
    pub timestamp_ms: u64,
    pub actor: ActorToken,
}

impl WriteStamp {
    pub fn new(timestamp_ms: u64, actor: ActorToken) -> Self {
        Self {
            timestamp_ms,
            actor,
        }
    }

    /// Stamp with the current wall clock.
    pub fn now(actor: ActorToken) -> Self {
        Self::new(crate::record::epoch_millis(), actor)
    }

    /// Whether a write carrying this stamp displaces one carrying `other`.
    pub fn wins_over(&self, other: &WriteStamp) -> bool {
        self > other
    }
}

impl PartialOrd for WriteStamp {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for WriteStamp {
    fn cmp(&self, other: &Self) -> Ordering {
        self.timestamp_ms
            .cmp(&other.timestamp_ms)
            .then_with(|| self.actor.as_bytes().cmp(other.actor.as_bytes()))
    }
}

/// A last-write-wins register.
///
/// Holds a value and the stamp of the write that set it. [`Lww::apply`]
/// replaces the value only when the candidate stamp wins, so applying the
/// same update twice (at-least-once delivery) is a no-op.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Lww<T> {
    value: T,
    stamp: WriteStamp,
}

impl<T> Lww<T> {
    pub fn new(value: T, stamp: WriteStamp) -> Self {
        Self { value, stamp }
    }

    pub fn get(&self) -> &T {
        &self.value
    }

    pub fn stamp(&self) -> WriteStamp {
        self.stamp
    }

    /// Apply a candidate write. Returns `true` if it won and the value
    /// changed hands, `false` if the stored write was retained.
    pub fn apply(&mut self, value: T, stamp: WriteStamp) -> bool {
        if stamp.wins_over(&self.stamp) {
            self.value = value;
            self.stamp = stamp;
            true
        } else {
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn token(byte: u8) -> ActorToken {
        ActorToken(Uuid::from_bytes([byte; 16]))
    }

    #[test]
    fn test_later_timestamp_wins() {
        let a = WriteStamp::new(100, token(1));
        let b = WriteStamp::new(200, token(1));
        assert!(b.wins_over(&a));
        assert!(!a.wins_over(&b));
    }

    #[test]
    fn test_tie_breaks_on_actor_bytes() {
        let low = WriteStamp::new(100, token(1));
        let high = WriteStamp::new(100, token(2));
        assert!(high.wins_over(&low));
        assert!(!low.wins_over(&high));
    }

    #[test]
    fn test_stamp_never_beats_itself() {
        let s = WriteStamp::new(100, token(7));
        assert!(!s.wins_over(&s));
    }

    #[test]
    fn test_lww_apply() {
        let mut reg = Lww::new(1u32, WriteStamp::new(100, token(1)));

        // Stale write rejected
        assert!(!reg.apply(2, WriteStamp::new(50, token(9))));
        assert_eq!(*reg.get(), 1);

        // Newer write applied
        assert!(reg.apply(3, WriteStamp::new(150, token(1))));
        assert_eq!(*reg.get(), 3);
        assert_eq!(reg.stamp().timestamp_ms, 150);
    }

    #[test]
    fn test_lww_redelivery_is_noop() {
        let stamp = WriteStamp::new(100, token(1));
        let mut reg = Lww::new(1u32, WriteStamp::new(50, token(1)));

        assert!(reg.apply(2, stamp));
        // Same message delivered again (at-least-once feed)
        assert!(!reg.apply(2, stamp));
        assert_eq!(*reg.get(), 2);
    }

    #[test]
    fn test_deterministic_winner_both_orders() {
        // Two replicas seeing the same pair of racing writes in opposite
        // order must converge to the same value.
        let w1 = (10u32, WriteStamp::new(100, token(3)));
        let w2 = (20u32, WriteStamp::new(100, token(4)));
        let base = Lww::new(0u32, WriteStamp::new(0, token(0)));

        let mut r1 = base.clone();
        r1.apply(w1.0, w1.1);
        r1.apply(w2.0, w2.1);

        let mut r2 = base;
        r2.apply(w2.0, w2.1);
        r2.apply(w1.0, w1.1);

        assert_eq!(r1.get(), r2.get());
        assert_eq!(*r1.get(), 20); // greater token wins the tie
    }
}
