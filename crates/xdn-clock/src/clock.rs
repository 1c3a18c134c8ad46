//! The vector clock value type.

use std::collections::HashMap;

use xdn_types::NodeId;

use crate::error::{ClockError, ClockResult};

// ============================================================================
// Causal Ordering
// ============================================================================

/// Relationship between two comparable vector clocks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CausalOrdering {
    /// `self` happened-before `other`.
    Less,
    /// Every counter matches.
    Equal,
    /// `self` happened-after `other`.
    Greater,
    /// Neither clock dominates the other.
    Concurrent,
}

// ============================================================================
// Vector Clock
// ============================================================================

/// Per-node logical counters over a node set fixed at construction.
///
/// The clock is a plain owned value: mutation takes `&mut self`, so a single
/// writer is enforced at compile time. Use [`SharedVectorClock`] when several
/// tasks must observe and update the same clock.
///
/// # Invariants
///
/// - The node set never changes after construction
/// - [`tick`](Self::tick) only increases counters; [`set_counter`](Self::set_counter)
///   is reserved for synchronizing with an observed peer value
///
/// [`SharedVectorClock`]: crate::SharedVectorClock
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VectorClock {
    counters: HashMap<NodeId, u64>,
}

impl VectorClock {
    /// Creates a zeroed clock over `nodes`. Duplicate ids collapse to one entry.
    ///
    /// # Panics
    ///
    /// Panics if `nodes` is empty, or if an id contains `:`, `.` or `/`,
    /// which would make the encoded clock ambiguous.
    pub fn new<I, N>(nodes: I) -> Self
    where
        I: IntoIterator<Item = N>,
        N: Into<NodeId>,
    {
        let counters: HashMap<NodeId, u64> = nodes.into_iter().map(|n| (n.into(), 0)).collect();
        assert!(
            !counters.is_empty(),
            "vector clock must have at least one node"
        );
        assert!(
            counters.keys().all(|n| Self::accepts_node(n.as_str())),
            "node ids must not contain ':' '.' or '/'"
        );
        Self { counters }
    }

    /// True if `node` can be part of a clock: the encoded form reserves
    /// `:`, `.` and `/`.
    pub fn accepts_node(node: &str) -> bool {
        !node.contains([':', '.', '/'])
    }

    pub(crate) fn from_counters(counters: HashMap<NodeId, u64>) -> Self {
        debug_assert!(!counters.is_empty());
        Self { counters }
    }

    /// Increments the counter of `node` by one. Chainable.
    ///
    /// # Panics
    ///
    /// Panics if `node` is not a member of the clock.
    pub fn tick(&mut self, node: &str) -> &mut Self {
        let counter = self.slot(node);
        *counter = counter.saturating_add(1);
        self
    }

    /// Overwrites the counter of `node`.
    ///
    /// Callers merging a peer's clock are responsible for max-merge
    /// semantics; see [`merge`](Self::merge).
    ///
    /// # Panics
    ///
    /// Panics if `node` is not a member of the clock.
    pub fn set_counter(&mut self, node: &str, value: u64) -> &mut Self {
        *self.slot(node) = value;
        self
    }

    /// Returns the counter of `node`.
    ///
    /// # Panics
    ///
    /// Panics if `node` is not a member of the clock.
    pub fn counter(&self, node: &str) -> u64 {
        match self.counters.get(node) {
            Some(&value) => value,
            None => panic!("unknown node {node} in vector clock"),
        }
    }

    /// Returns the counter of `node`, or `None` if it is not a member.
    pub fn get(&self, node: &str) -> Option<u64> {
        self.counters.get(node).copied()
    }

    /// Returns true if `node` is a member of the clock.
    pub fn contains(&self, node: &str) -> bool {
        self.counters.contains_key(node)
    }

    /// Iterates over the member node ids in unspecified order.
    pub fn node_ids(&self) -> impl Iterator<Item = &NodeId> {
        self.counters.keys()
    }

    /// Iterates over `(node, counter)` pairs in unspecified order.
    pub fn iter(&self) -> impl Iterator<Item = (&NodeId, u64)> {
        self.counters.iter().map(|(node, &counter)| (node, counter))
    }

    /// Returns the number of member nodes.
    pub fn len(&self) -> usize {
        self.counters.len()
    }

    /// Always false: a clock has at least one node.
    pub fn is_empty(&self) -> bool {
        self.counters.is_empty()
    }

    /// Returns true if every counter is zero.
    pub fn is_zero(&self) -> bool {
        self.counters.values().all(|&c| c == 0)
    }

    // ========================================================================
    // Comparison
    // ========================================================================

    /// Returns true iff both clocks range over exactly the same node set.
    pub fn is_comparable_with(&self, other: &Self) -> bool {
        self.counters.len() == other.counters.len()
            && self.counters.keys().all(|n| other.counters.contains_key(n))
    }

    /// Determines the causal relationship between two clocks.
    ///
    /// Non-panicking entry point for clocks received from other nodes.
    pub fn compare(&self, other: &Self) -> ClockResult<CausalOrdering> {
        if !self.is_comparable_with(other) {
            return Err(ClockError::Incomparable {
                left: self.len(),
                right: other.len(),
            });
        }

        let mut less = false;
        let mut greater = false;
        for (node, &mine) in &self.counters {
            let theirs = other.counters[node];
            if mine < theirs {
                less = true;
            } else if mine > theirs {
                greater = true;
            }
            if less && greater {
                return Ok(CausalOrdering::Concurrent);
            }
        }

        Ok(match (less, greater) {
            (false, false) => CausalOrdering::Equal,
            (true, false) => CausalOrdering::Less,
            (false, true) => CausalOrdering::Greater,
            (true, true) => CausalOrdering::Concurrent,
        })
    }

    fn ordering(&self, other: &Self) -> CausalOrdering {
        match self.compare(other) {
            Ok(ordering) => ordering,
            Err(e) => panic!("{e}"),
        }
    }

    /// Strictly happened-before: every counter `<=` and at least one `<`.
    ///
    /// # Panics
    ///
    /// Panics if the clocks are not comparable.
    pub fn is_less_than(&self, other: &Self) -> bool {
        self.ordering(other) == CausalOrdering::Less
    }

    /// Every counter matches.
    ///
    /// # Panics
    ///
    /// Panics if the clocks are not comparable.
    pub fn is_equal_to(&self, other: &Self) -> bool {
        self.ordering(other) == CausalOrdering::Equal
    }

    /// # Panics
    ///
    /// Panics if the clocks are not comparable.
    pub fn is_less_than_or_equal_to(&self, other: &Self) -> bool {
        matches!(
            self.ordering(other),
            CausalOrdering::Less | CausalOrdering::Equal
        )
    }

    /// Strictly happened-after: every counter `>=` and at least one `>`.
    ///
    /// # Panics
    ///
    /// Panics if the clocks are not comparable.
    pub fn is_greater_than(&self, other: &Self) -> bool {
        self.ordering(other) == CausalOrdering::Greater
    }

    /// # Panics
    ///
    /// Panics if the clocks are not comparable.
    pub fn is_greater_than_or_equal_to(&self, other: &Self) -> bool {
        matches!(
            self.ordering(other),
            CausalOrdering::Greater | CausalOrdering::Equal
        )
    }

    /// Neither clock dominates.
    ///
    /// # Panics
    ///
    /// Panics if the clocks are not comparable.
    pub fn is_concurrent_with(&self, other: &Self) -> bool {
        self.ordering(other) == CausalOrdering::Concurrent
    }

    // ========================================================================
    // Synchronization
    // ========================================================================

    /// Max-merges an observed clock into this one.
    pub fn merge(&mut self, observed: &Self) -> ClockResult<()> {
        if !self.is_comparable_with(observed) {
            return Err(ClockError::Incomparable {
                left: self.len(),
                right: observed.len(),
            });
        }
        for (node, &theirs) in &observed.counters {
            if let Some(mine) = self.counters.get_mut(node) {
                *mine = (*mine).max(theirs);
            }
        }
        Ok(())
    }

    /// Builds a clock over a new node set, carrying over the counters of
    /// nodes present in both.
    ///
    /// Used when the membership a clock ranges over changes; the result is
    /// generally not comparable with `self`.
    ///
    /// # Panics
    ///
    /// Panics if `nodes` is empty or an id is rejected by
    /// [`accepts_node`](Self::accepts_node).
    pub fn rebased<I, N>(&self, nodes: I) -> Self
    where
        I: IntoIterator<Item = N>,
        N: Into<NodeId>,
    {
        let mut clock = Self::new(nodes);
        for (node, counter) in &mut clock.counters {
            *counter = self.get(node.as_str()).unwrap_or(0);
        }
        clock
    }

    fn slot(&mut self, node: &str) -> &mut u64 {
        match self.counters.get_mut(node) {
            Some(counter) => counter,
            None => panic!("unknown node {node} in vector clock"),
        }
    }
}
