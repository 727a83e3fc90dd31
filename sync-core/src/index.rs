//! Datawallet modification index tracking.
//!
//! The backbone numbers every pushed modification with a strictly
//! increasing index. A device stores the highest index it has applied
//! (`localDatawalletModificationIndex`) and asks only for newer records.
//!
//! [`IndexTracker`] follows one sync pass: it starts at the stored index,
//! rejects a record that does not continue the ascending sequence and
//! reports the index to persist when the pass ends.

use thiserror::Error;

/// Errors for index tracking.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum IndexError {
    /// A record did not continue the ascending sequence.
    #[error("modification index {index} does not follow {previous}")]
    NotAscending {
        /// Highest index seen before
        previous: u64,
        /// Offending index
        index: u64,
    },
}

/// Tracks modification indices during a sync pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexTracker {
    /// Highest index observed so far.
    highest: u64,
}

impl IndexTracker {
    /// Start tracking from the stored local index (0 when nothing was applied).
    pub fn new(local_index: u64) -> Self {
        Self {
            highest: local_index,
        }
    }

    /// Record an applied modification index.
    ///
    /// Indices must be strictly increasing and above the starting index.
    pub fn observe(&mut self, index: u64) -> Result<(), IndexError> {
        if index <= self.highest {
            return Err(IndexError::NotAscending {
                previous: self.highest,
                index,
            });
        }
        self.highest = index;
        Ok(())
    }

    /// Record the index the backbone returned after a push.
    ///
    /// Our own pushed records are not pulled back, so the push result moves
    /// the tracker forward directly. Never moves backwards.
    pub fn advance_to(&mut self, index: u64) {
        self.highest = self.highest.max(index);
    }

    /// Index to persist at the end of the pass.
    pub fn local_index(&self) -> u64 {
        self.highest
    }
}

impl Default for IndexTracker {
    fn default() -> Self {
        Self::new(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tracker_starts_at_local_index() {
        let tracker = IndexTracker::new(7);
        assert_eq!(tracker.local_index(), 7);
    }

    #[test]
    fn ascending_indices_are_accepted() {
        let mut tracker = IndexTracker::new(0);
        tracker.observe(1).unwrap();
        tracker.observe(2).unwrap();
        tracker.observe(5).unwrap(); // gaps are other devices' deleted records

        assert_eq!(tracker.local_index(), 5);
    }

    #[test]
    fn repeated_index_is_rejected() {
        let mut tracker = IndexTracker::new(0);
        tracker.observe(3).unwrap();
        let err = tracker.observe(3).unwrap_err();
        assert_eq!(err, IndexError::NotAscending { previous: 3, index: 3 });
    }

    #[test]
    fn index_at_or_below_start_is_rejected() {
        let mut tracker = IndexTracker::new(10);
        assert!(tracker.observe(10).is_err());
        assert!(tracker.observe(4).is_err());
        assert_eq!(tracker.local_index(), 10);
    }

    #[test]
    fn advance_never_moves_backwards() {
        let mut tracker = IndexTracker::new(10);
        tracker.advance_to(8);
        assert_eq!(tracker.local_index(), 10);
        tracker.advance_to(12);
        assert_eq!(tracker.local_index(), 12);
    }
}
