//! Circular pass-window search.

use core::fmt;

use crate::phase::{PHASE_COUNT, PassBitmap, PhaseIndex};

/// Which of the two middle taps an even-width window reports as its center.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum CenterBias {
    /// Upper middle tap (`start + width / 2`).
    #[default]
    Right,
    /// Lower middle tap (`start + width / 2 - 1`).
    Left,
}

/// Longest contiguous run of passing taps.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct PassWindow {
    pub start: PhaseIndex,
    pub width: u8,
    pub center: PhaseIndex,
}

impl PassWindow {
    /// Returns `true` when `phase` falls inside the run.
    #[must_use]
    pub fn contains(&self, phase: PhaseIndex) -> bool {
        let distance = (phase.index() + PHASE_COUNT - self.start.index()) % PHASE_COUNT;
        distance < usize::from(self.width)
    }
}

/// Failures reported by [`WindowSearch`].
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum WindowError {
    /// Every tap failed; there is no center to report.
    NoPassingPhase,
}

impl fmt::Display for WindowError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{self:?}")
    }
}

/// Locates the widest pass run on the tap ring.
pub struct WindowSearch;

impl WindowSearch {
    /// Finds the widest run using the default (right) center bias.
    ///
    /// # Errors
    ///
    /// Returns [`WindowError::NoPassingPhase`] when no tap passes.
    pub fn find_best(bitmap: PassBitmap) -> Result<PassWindow, WindowError> {
        Self::find_best_with(bitmap, CenterBias::Right)
    }

    /// Finds the widest run and centers it according to `bias`.
    ///
    /// The scan starts at the first failing tap so no run is split by the
    /// array boundary. Equal-width runs resolve to the one seen first.
    ///
    /// # Errors
    ///
    /// Returns [`WindowError::NoPassingPhase`] when no tap passes.
    pub fn find_best_with(bitmap: PassBitmap, bias: CenterBias) -> Result<PassWindow, WindowError> {
        if bitmap.is_all_fail() {
            return Err(WindowError::NoPassingPhase);
        }

        let cut = bitmap.first_fail().unwrap_or(PhaseIndex::ZERO);
        let mut best_start = cut;
        let mut best_width = 0u8;
        let mut run_start = cut;
        let mut run_width = 0u8;

        for step in 0..PHASE_COUNT {
            let phase = cut.offset(step);
            if bitmap.contains(phase) {
                if run_width == 0 {
                    run_start = phase;
                }
                run_width += 1;
                if run_width > best_width {
                    best_width = run_width;
                    best_start = run_start;
                }
            } else {
                run_width = 0;
            }
        }

        let mut half = usize::from(best_width / 2);
        if best_width % 2 == 0 && bias == CenterBias::Left {
            half -= 1;
        }

        Ok(PassWindow {
            start: best_start,
            width: best_width,
            center: best_start.offset(half),
        })
    }

    /// Width of the pass run holding `phase`, or zero when `phase` fails.
    #[must_use]
    pub fn run_width_at(bitmap: PassBitmap, phase: PhaseIndex) -> u8 {
        if !bitmap.contains(phase) {
            return 0;
        }
        if bitmap.is_all_pass() {
            return bitmap.pass_count();
        }

        let above = (1..PHASE_COUNT)
            .take_while(|&step| bitmap.contains(phase.offset(step)))
            .count();
        let below = (1..PHASE_COUNT)
            .take_while(|&step| bitmap.contains(phase.offset(PHASE_COUNT - step)))
            .count();
        u8::try_from(1 + above + below).unwrap_or(u8::MAX)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn phase(value: u8) -> PhaseIndex {
        PhaseIndex::new(value).expect("tap in range")
    }

    fn brute_force_longest(bitmap: PassBitmap) -> u8 {
        let mut longest = 0;
        for start in PhaseIndex::all() {
            let mut width = 0u8;
            while usize::from(width) < PHASE_COUNT && bitmap.contains(start.offset(width.into())) {
                width += 1;
            }
            longest = longest.max(width);
        }
        longest
    }

    #[test]
    fn width_matches_brute_force_for_every_bitmap() {
        for bits in 1..=0x7FF_u16 {
            let bitmap = PassBitmap::from_bits(bits);
            let window = WindowSearch::find_best(bitmap).expect("bitmap has a pass");
            assert_eq!(window.width, brute_force_longest(bitmap), "bitmap {bits:#05x}");

            for offset in 0..window.width {
                assert!(
                    bitmap.contains(window.start.offset(offset.into())),
                    "reported run leaves the passing set for {bits:#05x}"
                );
            }
            assert!(window.contains(window.center));
        }
    }

    #[test]
    fn all_fail_is_an_error() {
        assert_eq!(
            WindowSearch::find_best(PassBitmap::ALL_FAIL),
            Err(WindowError::NoPassingPhase)
        );
        assert_eq!(
            WindowSearch::find_best_with(PassBitmap::ALL_FAIL, CenterBias::Left),
            Err(WindowError::NoPassingPhase)
        );
    }

    #[test]
    fn wrapping_run_centers_across_boundary() {
        let bitmap = PassBitmap::ALL_PASS
            .without(phase(4))
            .without(phase(5))
            .without(phase(6));

        let window = WindowSearch::find_best(bitmap).expect("window");
        assert_eq!(window.start, phase(7));
        assert_eq!(window.width, 8);
        assert_eq!(window.center, phase(0));

        let left = WindowSearch::find_best_with(bitmap, CenterBias::Left).expect("window");
        assert_eq!(left.width, 8);
        assert_eq!(left.center, phase(10));
    }

    #[test]
    fn odd_width_ignores_bias() {
        let bitmap = PassBitmap::from_bits(0b000_0111_1100);
        let right = WindowSearch::find_best(bitmap).expect("window");
        let left = WindowSearch::find_best_with(bitmap, CenterBias::Left).expect("window");
        assert_eq!(right.width, 5);
        assert_eq!(right.center, phase(4));
        assert_eq!(left.center, right.center);
    }

    #[test]
    fn equal_runs_prefer_first_after_cut() {
        // Runs {1,2} and {4,5}; the scan starts at tap 0.
        let bitmap = PassBitmap::from_bits(0b000_0011_0110);
        let window = WindowSearch::find_best(bitmap).expect("window");
        assert_eq!(window.start, phase(1));
        assert_eq!(window.center, phase(2));
    }

    #[test]
    fn run_width_follows_the_run_around_the_ring() {
        let bitmap = PassBitmap::ALL_PASS.without(phase(5));
        assert_eq!(WindowSearch::run_width_at(bitmap, phase(0)), 10);
        assert_eq!(WindowSearch::run_width_at(bitmap, phase(5)), 0);

        // Runs {1,2} and {4,5}.
        let split = PassBitmap::from_bits(0b000_0011_0110);
        assert_eq!(WindowSearch::run_width_at(split, phase(4)), 2);
        assert_eq!(WindowSearch::run_width_at(PassBitmap::ALL_PASS, phase(3)), 11);
    }

    #[test]
    fn all_pass_spans_the_ring() {
        let window = WindowSearch::find_best(PassBitmap::ALL_PASS).expect("window");
        assert_eq!(window.start, phase(0));
        assert_eq!(window.width, 11);
        assert_eq!(window.center, phase(5));
    }
}
