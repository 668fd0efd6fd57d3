//! Conservative shaping of observed failures before they reach hardware.
//!
//! A fresh probe result is never trusted as-is. The policy widens an isolated
//! failure by one tap on either side, collapses scattered fail groups into a
//! single region, and refuses to believe a bitmap in which every tap passed.
//! The shaped bitmap is what the engine programs into the bridge's inject
//! register before the next probe.

use crate::phase::{BusMode, PHASE_COUNT, PassBitmap, PhaseIndex};
use crate::window::WindowSearch;

/// SDR50 substitute for an all-pass result (taps 3..=5 fail).
pub const SDR50_MANUAL_INJECT: PassBitmap = PassBitmap::from_bits(0x7C7);

/// SDR104 substitute for an all-pass result (taps 1..=3 fail).
pub const SDR104_MANUAL_INJECT: PassBitmap = PassBitmap::from_bits(0x7F1);

/// Default fail count up to which boundary erosion still applies.
pub const DEFAULT_EROSION_FAIL_LIMIT: u8 = 2;

/// Default manual mask for `mode`.
#[must_use]
pub const fn manual_inject_mask(mode: BusMode) -> PassBitmap {
    match mode {
        BusMode::Sdr50 => SDR50_MANUAL_INJECT,
        BusMode::Sdr104 => SDR104_MANUAL_INJECT,
    }
}

/// Failure derived from the fine-grained sweep vector.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct FailurePoint {
    /// Taps judged failing.
    pub bitmap: PassBitmap,
    /// Tap at which the decisive failure begins.
    pub start: PhaseIndex,
}

/// Locates the failure inside a hardware receive sweep.
///
/// The bridge sweeps `count` taps starting at `start`; bit `start + k` of
/// `raw` holds the outcome of the `k`-th step. A trailing run of failures is
/// reduced to its first step, earlier failures are kept, and a sweep with no
/// failure at all blames its last step.
#[must_use]
pub fn failure_point(start: PhaseIndex, raw: u64, count: u8) -> FailurePoint {
    let steps = usize::from(count).clamp(1, PHASE_COUNT);
    let passed = |step: usize| (raw >> (start.index() + step)) & 1 == 1;

    let trailing = (0..steps).rev().take_while(|&step| !passed(step)).count();
    if (0..steps).all(passed) {
        let last = start.offset(steps - 1);
        return FailurePoint {
            bitmap: PassBitmap::ALL_PASS.without(last),
            start: last,
        };
    }

    let cutoff = steps - trailing;
    let mut bitmap = PassBitmap::ALL_PASS;
    let mut first_failure = None;
    for step in (0..steps).filter(|&step| !passed(step) && step <= cutoff) {
        let phase = start.offset(step);
        bitmap.remove(phase);
        first_failure.get_or_insert(phase);
    }

    let decisive = if trailing > 0 {
        start.offset(cutoff)
    } else {
        first_failure.unwrap_or(start)
    };

    FailurePoint {
        bitmap,
        start: decisive,
    }
}

/// Shapes observed bitmaps for one bus mode.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct InjectionPolicy {
    manual_mask: PassBitmap,
    erosion_fail_limit: u8,
}

impl InjectionPolicy {
    /// Creates a policy with an explicit manual mask.
    #[must_use]
    pub const fn new(manual_mask: PassBitmap, erosion_fail_limit: u8) -> Self {
        Self {
            manual_mask,
            erosion_fail_limit,
        }
    }

    /// Policy with the stock manual mask for `mode`.
    #[must_use]
    pub const fn for_mode(mode: BusMode) -> Self {
        Self::new(manual_inject_mask(mode), DEFAULT_EROSION_FAIL_LIMIT)
    }

    /// Mask substituted for an all-pass bitmap.
    #[must_use]
    pub const fn manual_mask(&self) -> PassBitmap {
        self.manual_mask
    }

    /// Collapses `history` to a single fail region, or substitutes the
    /// manual mask when nothing failed.
    ///
    /// Applying this to its own output returns the same bitmap.
    #[must_use]
    pub fn erode(&self, history: PassBitmap) -> PassBitmap {
        if history.is_all_pass() {
            collapse(self.manual_mask)
        } else {
            collapse(history)
        }
    }

    /// Widens the fail run containing `known_failure_start` by one tap on
    /// each side, then erodes.
    ///
    /// The widening is skipped once the bitmap already carries more than the
    /// configured number of failures.
    #[must_use]
    pub fn erode_around_failure(
        &self,
        raw: PassBitmap,
        known_failure_start: PhaseIndex,
    ) -> PassBitmap {
        let mut bitmap = raw.without(known_failure_start);

        if bitmap.fail_count() <= self.erosion_fail_limit {
            let mut first = known_failure_start;
            let mut last = known_failure_start;
            for _ in 1..PHASE_COUNT {
                if bitmap.contains(first.prev()) {
                    break;
                }
                first = first.prev();
            }
            for _ in 1..PHASE_COUNT {
                if bitmap.contains(last.next()) {
                    break;
                }
                last = last.next();
            }

            bitmap.remove(first.prev());
            bitmap.remove(last.next());
        }

        self.erode(bitmap)
    }

    /// Folds a new observation into the bitmap already programmed.
    ///
    /// The first failure of an attempt is widened; later ones are intersected
    /// and collapsed.
    #[must_use]
    pub fn merge(
        &self,
        programmed: PassBitmap,
        observed: PassBitmap,
        known_failure_start: PhaseIndex,
    ) -> PassBitmap {
        if programmed.is_all_pass() {
            self.erode_around_failure(observed, known_failure_start)
        } else {
            self.erode(programmed & observed)
        }
    }
}

/// Keeps only the widest pass run.
fn collapse(bitmap: PassBitmap) -> PassBitmap {
    match WindowSearch::find_best(bitmap) {
        Ok(window) if !bitmap.is_all_pass() => (0..usize::from(window.width))
            .map(|step| window.start.offset(step))
            .collect(),
        _ => bitmap,
    }
}
