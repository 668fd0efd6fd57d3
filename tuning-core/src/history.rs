//! Per-mode pass/fail bookkeeping for one calibration attempt.
//!
//! Every update is an intersection: a tap that failed once stays failed until
//! the next attempt calls [`FailureHistory::reset`].

use crate::phase::{PHASE_COUNT, PassBitmap, PhaseIndex};

/// Accumulated probe results for a single bus mode.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct FailureHistory {
    tx_history: PassBitmap,
    tx_table: [PassBitmap; PHASE_COUNT],
    all_table: [PassBitmap; PHASE_COUNT],
}

impl FailureHistory {
    /// Creates a history with every tap marked as passing.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            tx_history: PassBitmap::ALL_PASS,
            tx_table: [PassBitmap::ALL_PASS; PHASE_COUNT],
            all_table: [PassBitmap::ALL_PASS; PHASE_COUNT],
        }
    }

    /// Forgets everything observed so far.
    pub fn reset(&mut self) {
        *self = Self::new();
    }

    /// Merges a probe result taken while transmitting on `tx`.
    pub fn observe(&mut self, tx: PhaseIndex, bitmap: PassBitmap) {
        let slot = tx.index();
        self.tx_table[slot] &= bitmap;
        self.all_table[slot] &= bitmap;
        self.tx_history &= bitmap;
    }

    /// Narrows the receive-side accessibility row for `tx`.
    pub fn restrict_accessibility(&mut self, tx: PhaseIndex, bitmap: PassBitmap) {
        self.all_table[tx.index()] &= bitmap;
    }

    /// Removes `tx` from every future accessibility query.
    pub fn mark_tx_failed(&mut self, tx: PhaseIndex) {
        self.all_table[tx.index()] = PassBitmap::ALL_FAIL;
    }

    /// Folds a conservative bitmap into the running history.
    pub fn merge_history(&mut self, bitmap: PassBitmap) {
        self.tx_history &= bitmap;
    }

    /// Intersection of every result seen in this attempt.
    #[must_use]
    pub fn tx_history(&self) -> PassBitmap {
        self.tx_history
    }

    /// Result recorded for `tx`.
    #[must_use]
    pub fn tx_result(&self, tx: PhaseIndex) -> PassBitmap {
        self.tx_table[tx.index()]
    }

    /// Receive taps still reachable while transmitting on `tx`.
    #[must_use]
    pub fn accessibility_row(&self, tx: PhaseIndex) -> PassBitmap {
        self.all_table[tx.index()]
    }

    /// Transmit taps whose accessibility row still contains `rx`.
    #[must_use]
    pub fn accessibility_at(&self, rx: PhaseIndex) -> PassBitmap {
        PhaseIndex::all()
            .filter(|tx| self.all_table[tx.index()].contains(rx))
            .collect()
    }

    /// Drops the weakest circular diagonal of the accessibility matrix.
    ///
    /// Diagonal `c` holds the cells `(tx, tx + c)`. The diagonal with the
    /// fewest passing cells (lowest `c` on ties) is cleared from every row.
    /// Returns the offset that was removed.
    pub fn smooth_diagonals(&mut self) -> PhaseIndex {
        let mut weakest = PhaseIndex::ZERO;
        let mut weakest_votes = usize::MAX;

        for offset in PhaseIndex::all() {
            let votes = PhaseIndex::all()
                .filter(|tx| self.all_table[tx.index()].contains(tx.offset(offset.index())))
                .count();
            if votes < weakest_votes {
                weakest_votes = votes;
                weakest = offset;
            }
        }

        for tx in PhaseIndex::all() {
            self.all_table[tx.index()].remove(tx.offset(weakest.index()));
        }

        weakest
    }

    /// Intersects every accessibility row with the running history.
    pub fn fold_history_into_rows(&mut self) {
        let history = self.tx_history;
        for row in &mut self.all_table {
            *row &= history;
        }
    }
}

impl Default for FailureHistory {
    fn default() -> Self {
        Self::new()
    }
}
