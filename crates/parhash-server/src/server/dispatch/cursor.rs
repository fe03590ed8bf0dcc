use parhash_core::{Error, Result};
use parking_lot::Mutex;

/// Server-wide round-robin cursor over `len` backends.
///
/// Every claim reads the current ordinal and advances it under one lock, so
/// claims from concurrent batches interleave into a single round-robin
/// sequence. The lock is held only for the read-and-advance step.
#[derive(Debug)]
pub struct RoundRobin {
    next: Mutex<usize>,
    len: usize,
}

impl RoundRobin {
    /// Creates a cursor starting at backend `0`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidConfig`] if `len` is zero.
    pub fn new(len: usize) -> Result<Self> {
        if len == 0 {
            return Err(Error::invalid_config("at least one backend is required"));
        }
        Ok(Self {
            next: Mutex::new(0),
            len,
        })
    }

    /// Claims the next backend ordinal and advances the cursor.
    pub fn claim(&self) -> usize {
        let mut next = self.next.lock();
        let claimed = *next;
        *next = (claimed + 1) % self.len;
        claimed
    }

    /// The ordinal the next [`claim`](Self::claim) will return.
    pub fn peek(&self) -> usize {
        *self.next.lock()
    }
}
