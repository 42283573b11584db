//! In-memory capture target

use std::sync::{Arc, Mutex, MutexGuard};

use super::Direction;

#[derive(Debug, Default)]
struct Recorded {
    combined: Vec<u8>,
    per_direction: [Vec<u8>; 2],
}

/// Capture target that keeps bytes in memory
///
/// Clones share the same buffers, so a handle kept by the caller observes
/// what the session recorded.
#[derive(Debug, Clone, Default)]
pub struct MemoryCapture {
    inner: Arc<Mutex<Recorded>>,
}

impl MemoryCapture {
    /// Create an empty capture
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn record(&self, direction: Direction, bytes: &[u8]) {
        let mut recorded = self.lock();
        recorded.combined.extend_from_slice(bytes);
        recorded.per_direction[direction.index()].extend_from_slice(bytes);
    }

    /// Everything recorded, in append order across both directions
    pub fn combined(&self) -> Vec<u8> {
        self.lock().combined.clone()
    }

    /// Bytes recorded for one direction, in relay order
    pub fn direction(&self, direction: Direction) -> Vec<u8> {
        self.lock().per_direction[direction.index()].clone()
    }

    fn lock(&self) -> MutexGuard<'_, Recorded> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
