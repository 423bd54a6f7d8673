//! Causality tracking via vector clocks
//!
//! A VectorClock records, for every replica that has touched a document, how
//! many operations that replica had generated as far as the holder knows.
//! Comparing two clocks tells us whether one edit causally preceded another
//! or whether they were made concurrently.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Unique identifier for a replica (a user session editing a map)
pub type ReplicaId = String;

/// Outcome of comparing two vector clocks
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ClockOrdering {
    /// Every component is <= the other's and at least one is strictly less
    Before,
    /// The mirror image of `Before`
    After,
    /// Neither clock happened before the other
    Concurrent,
    /// All components are equal
    Equal,
}

impl ClockOrdering {
    /// The ordering seen from the other side of the comparison.
    pub fn reverse(self) -> Self {
        match self {
            ClockOrdering::Before => ClockOrdering::After,
            ClockOrdering::After => ClockOrdering::Before,
            other => other,
        }
    }
}

/// Per-replica logical clock.
///
/// Serializes as a flat `{ replica: counter }` object. Components that are
/// absent read as zero, so `{}` and `{"a": 0}` compare as `Equal`.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct VectorClock {
    counters: BTreeMap<ReplicaId, u64>,
}

impl VectorClock {
    /// Create an empty clock (knows nothing)
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a clock with a single component set
    pub fn at(replica: impl Into<ReplicaId>, counter: u64) -> Self {
        let mut clock = Self::new();
        clock.counters.insert(replica.into(), counter);
        clock
    }

    /// Counter for a replica (0 if never seen)
    pub fn get(&self, replica: &str) -> u64 {
        self.counters.get(replica).copied().unwrap_or(0)
    }

    /// Replicas with a recorded component
    pub fn replicas(&self) -> impl Iterator<Item = &ReplicaId> {
        self.counters.keys()
    }

    pub fn is_empty(&self) -> bool {
        self.counters.values().all(|c| *c == 0)
    }

    /// Bump this replica's counter by one and return the new value.
    pub fn increment(&mut self, replica: &str) -> u64 {
        let counter = self.counters.entry(replica.to_string()).or_insert(0);
        *counter += 1;
        *counter
    }

    /// Pure variant of [`increment`](Self::increment).
    pub fn incremented(&self, replica: &str) -> Self {
        let mut next = self.clone();
        next.increment(replica);
        next
    }

    /// Merge another clock into this one (component-wise max)
    pub fn update(&mut self, other: &VectorClock) {
        for (replica, counter) in &other.counters {
            let current = self.counters.entry(replica.clone()).or_insert(0);
            if *counter > *current {
                *current = *counter;
            }
        }
    }

    /// Merge two clocks without touching either input.
    pub fn merge(a: &VectorClock, b: &VectorClock) -> VectorClock {
        let mut merged = a.clone();
        merged.update(b);
        merged
    }

    /// Compare this clock against another.
    pub fn compare(&self, other: &VectorClock) -> ClockOrdering {
        let mut less = false;
        let mut greater = false;

        for replica in self.counters.keys().chain(other.counters.keys()) {
            let mine = self.get(replica);
            let theirs = other.get(replica);
            if mine < theirs {
                less = true;
            } else if mine > theirs {
                greater = true;
            }
            if less && greater {
                return ClockOrdering::Concurrent;
            }
        }

        match (less, greater) {
            (false, false) => ClockOrdering::Equal,
            (true, false) => ClockOrdering::Before,
            (false, true) => ClockOrdering::After,
            (true, true) => ClockOrdering::Concurrent,
        }
    }

    /// True iff this clock strictly happened before `other`
    pub fn happened_before(&self, other: &VectorClock) -> bool {
        self.compare(other) == ClockOrdering::Before
    }

    /// True iff neither clock happened before the other and they differ
    pub fn is_concurrent_with(&self, other: &VectorClock) -> bool {
        self.compare(other) == ClockOrdering::Concurrent
    }
}
