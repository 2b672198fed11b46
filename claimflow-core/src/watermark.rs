//! Tracks sequence numbers that were admitted but are not yet durable in the claims store, and
//! derives the safe resume point from them.
//!
//! Partitions complete batches concurrently and out of admission order, so the tracker cannot
//! just remember the last written sequence number. Instead it keeps the active sequence numbers
//! in an ordered set. The lowest active sequence number is the first gap in durability, and
//! everything strictly below it has been written.
//!
//! ```text
//! admitted:  1 2 3 4 5 6 7 8 9 10
//! written:   1 2 3 . 5 6 . . . .
//! active:          4     7 8 9 10
//! safe resume point = 4 - 1 = 3
//! ```

use std::collections::BTreeSet;

use parking_lot::Mutex;
use tracing::warn;

#[derive(Debug)]
struct State {
    active: BTreeSet<i64>,
    highest_admitted: i64,
}

/// Shared between the producer (which adds) and every partition (which removes). Each operation
/// takes a single lock, so adds and removes are individually atomic.
#[derive(Debug)]
pub(crate) struct WatermarkTracker {
    state: Mutex<State>,
}

impl WatermarkTracker {
    /// `initial` is the checkpoint restored at startup, it is reported while nothing is active.
    pub(crate) fn new(initial: i64) -> Self {
        WatermarkTracker {
            state: Mutex::new(State {
                active: BTreeSet::new(),
                highest_admitted: initial,
            }),
        }
    }

    /// Marks `sequence_number` as admitted and not yet durable.
    pub(crate) fn add_active(&self, sequence_number: i64) {
        let mut state = self.state.lock();
        if !state.active.insert(sequence_number) {
            warn!(sequence_number, "Sequence number is already active");
            debug_assert!(false, "sequence number {sequence_number} added twice");
        }
        state.highest_admitted = state.highest_admitted.max(sequence_number);
    }

    /// Marks `sequence_number` as durable. Removing a sequence number that is not active is a
    /// bug in the caller, it is ignored in release builds so the watermark is not corrupted.
    pub(crate) fn remove_written(&self, sequence_number: i64) {
        let mut state = self.state.lock();
        if !state.active.remove(&sequence_number) {
            warn!(
                sequence_number,
                "Ignoring removal of a sequence number that is not active"
            );
            debug_assert!(false, "sequence number {sequence_number} is not active");
        }
    }

    /// Highest sequence number at or below which everything has been written.
    pub(crate) fn safe_resume_point(&self) -> i64 {
        let state = self.state.lock();
        match state.active.first() {
            Some(lowest) => lowest - 1,
            None => state.highest_admitted,
        }
    }

    pub(crate) fn active_count(&self) -> usize {
        self.state.lock().active.len()
    }
}
