//! A vector clock shared between tasks.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::{
    clock::VectorClock,
    error::{ClockError, ClockResult},
};

/// Thread-safe handle to a single [`VectorClock`].
///
/// Every operation takes the lock for its whole duration, so a tick is never
/// observed half-applied. Readers receive owned snapshots.
#[derive(Debug, Clone)]
pub struct SharedVectorClock {
    inner: Arc<Mutex<VectorClock>>,
}

impl SharedVectorClock {
    pub fn new(clock: VectorClock) -> Self {
        Self {
            inner: Arc::new(Mutex::new(clock)),
        }
    }

    /// Increments `node` and returns the clock as it was right after the tick.
    pub fn tick(&self, node: &str) -> ClockResult<VectorClock> {
        let mut clock = self.lock();
        if !clock.contains(node) {
            return Err(ClockError::UnknownNode(node.into()));
        }
        clock.tick(node);
        Ok(clock.clone())
    }

    /// Max-merges an observed clock.
    pub fn merge(&self, observed: &VectorClock) -> ClockResult<()> {
        self.lock().merge(observed)
    }

    /// Returns a copy of the current clock.
    pub fn snapshot(&self) -> VectorClock {
        self.lock().clone()
    }

    /// Replaces the clock, e.g. after the node set it ranges over changed.
    pub fn replace(&self, clock: VectorClock) -> VectorClock {
        std::mem::replace(&mut *self.lock(), clock)
    }

    fn lock(&self) -> MutexGuard<'_, VectorClock> {
        // A panic while holding the lock cannot leave a counter half-written.
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl From<VectorClock> for SharedVectorClock {
    fn from(clock: VectorClock) -> Self {
        Self::new(clock)
    }
}
