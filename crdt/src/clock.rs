//! Lamport timestamps and state vectors.
//!
//! # Examples
//!
//! ```
//! use easel_crdt::{ActorId, Lamport, StateVector};
//!
//! let a = ActorId::new(1);
//! let b = ActorId::new(2);
//! assert!(Lamport::new(2, a) > Lamport::new(1, b));
//! // same counter: the actor id breaks the tie
//! assert!(Lamport::new(1, b) > Lamport::new(1, a));
//!
//! let mut sv = StateVector::new();
//! sv.observe(Lamport::new(3, a));
//! assert!(sv.contains(Lamport::new(2, a)));
//! assert!(!sv.contains(Lamport::new(1, b)));
//! ```

use crate::id::ActorId;
use bytecheck::CheckBytes;
use rkyv::{Archive, Deserialize, Serialize};
use std::collections::BTreeMap;

/// A Lamport timestamp: a logical counter paired with the writing actor.
///
/// The derived ordering compares counters first and breaks ties on the
/// actor id, which makes the order total. Last-writer-wins registers
/// resolve concurrent writes with this order.
#[derive(
    Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd, Archive, CheckBytes, Deserialize,
    Serialize,
)]
#[archive(as = "Lamport")]
#[repr(C)]
pub struct Lamport {
    /// The logical counter.
    pub counter: u64,
    /// The actor that produced the write.
    pub actor: ActorId,
}

impl Lamport {
    /// Creates a timestamp.
    pub fn new(counter: u64, actor: ActorId) -> Self {
        Self { counter, actor }
    }

    /// The timestamp every register starts out with; smaller than any
    /// timestamp a real write can carry.
    pub fn origin() -> Self {
        Self::new(0, ActorId::new(0))
    }
}

impl std::fmt::Display for Lamport {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{}:{}", self.actor, self.counter)
    }
}

/// Tracks, per actor, the highest counter this replica has observed.
///
/// A state vector is what a peer sends when (re)joining a room; the
/// receiving side answers with every op the vector does not cover.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct StateVector {
    entries: BTreeMap<ActorId, u64>,
}

impl StateVector {
    /// Returns an empty state vector.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the highest observed counter for an actor. Actors never
    /// seen have an implied counter of 0.
    pub fn get(&self, actor: &ActorId) -> u64 {
        self.entries.get(actor).copied().unwrap_or(0)
    }

    /// Monotonically records an observed timestamp.
    pub fn observe(&mut self, stamp: Lamport) {
        let counter = self.entries.entry(stamp.actor).or_insert(0);
        if *counter < stamp.counter {
            *counter = stamp.counter;
        }
    }

    /// True if the vector already covers the given timestamp.
    pub fn contains(&self, stamp: Lamport) -> bool {
        self.get(&stamp.actor) >= stamp.counter
    }

    /// Takes the pointwise maximum with another vector.
    pub fn merge(&mut self, other: &StateVector) {
        for (&actor, &counter) in other.entries.iter() {
            self.observe(Lamport::new(counter, actor));
        }
    }

    /// Returns true if nothing has been observed.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Iterates over the per-actor maxima.
    pub fn iter(&self) -> impl Iterator<Item = Lamport> + '_ {
        self.entries
            .iter()
            .map(|(&actor, &counter)| Lamport::new(counter, actor))
    }
}

impl FromIterator<Lamport> for StateVector {
    fn from_iter<I: IntoIterator<Item = Lamport>>(iter: I) -> Self {
        let mut sv = StateVector::new();
        for stamp in iter {
            sv.observe(stamp);
        }
        sv
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn order_is_total() {
        let a = ActorId::new(1);
        let b = ActorId::new(2);
        let mut stamps = vec![
            Lamport::new(2, a),
            Lamport::new(1, b),
            Lamport::new(1, a),
            Lamport::new(3, b),
        ];
        stamps.sort();
        assert_eq!(
            stamps,
            vec![
                Lamport::new(1, a),
                Lamport::new(1, b),
                Lamport::new(2, a),
                Lamport::new(3, b),
            ]
        );
    }

    #[test]
    fn observe_is_monotone() {
        let a = ActorId::new(7);
        let mut sv = StateVector::new();
        sv.observe(Lamport::new(5, a));
        sv.observe(Lamport::new(3, a));
        assert_eq!(sv.get(&a), 5);
    }

    #[test]
    fn merge_is_pointwise_max() {
        let a = ActorId::new(1);
        let b = ActorId::new(2);
        let mut left: StateVector = [Lamport::new(4, a)].into_iter().collect();
        let right: StateVector = [Lamport::new(2, a), Lamport::new(9, b)].into_iter().collect();
        left.merge(&right);
        assert_eq!(left.get(&a), 4);
        assert_eq!(left.get(&b), 9);
    }
}
