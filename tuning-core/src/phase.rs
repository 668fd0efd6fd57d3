//! Phase primitives shared by every calibration stage.
//!
//! The bridge exposes an 11-tap delay line for both the transmit (`sela`) and
//! receive (`selb`) sampling points. Every index and bitmap in this crate is
//! interpreted modulo [`PHASE_COUNT`], so runs may wrap from tap 10 back to 0.

use core::fmt;
use core::ops::{BitAnd, BitAndAssign};

/// Number of discrete taps on the delay line.
pub const PHASE_COUNT: usize = 11;

/// Mask covering every valid tap in a [`PassBitmap`].
pub const PASS_MASK: u16 = 0x7FF;

/// A tap index in `[0, PHASE_COUNT)`.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct PhaseIndex(u8);

impl PhaseIndex {
    /// Tap zero.
    pub const ZERO: Self = Self(0);

    /// Returns the tap when `value` is in range.
    #[must_use]
    pub const fn new(value: u8) -> Option<Self> {
        if (value as usize) < PHASE_COUNT {
            Some(Self(value))
        } else {
            None
        }
    }

    /// Reduces an arbitrary position onto the ring.
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub const fn wrapping(value: usize) -> Self {
        Self((value % PHASE_COUNT) as u8)
    }

    /// Raw tap number.
    #[must_use]
    pub const fn get(self) -> u8 {
        self.0
    }

    /// Tap number usable as an array index.
    #[must_use]
    pub const fn index(self) -> usize {
        self.0 as usize
    }

    /// Moves `delta` taps to the right, wrapping.
    #[must_use]
    pub const fn offset(self, delta: usize) -> Self {
        Self::wrapping(self.index() + delta % PHASE_COUNT)
    }

    /// Neighbouring tap to the right.
    #[must_use]
    pub const fn next(self) -> Self {
        self.offset(1)
    }

    /// Neighbouring tap to the left.
    #[must_use]
    pub const fn prev(self) -> Self {
        self.offset(PHASE_COUNT - 1)
    }

    /// Iterates over every tap in ascending order.
    pub fn all() -> impl Iterator<Item = PhaseIndex> {
        (0..PHASE_COUNT).map(PhaseIndex::wrapping)
    }
}

impl fmt::Display for PhaseIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Set of taps whose probe passed. A cleared bit is a failure.
///
/// Bitmaps only ever lose members while results are merged; there is no
/// union operation on purpose.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct PassBitmap(u16);

impl PassBitmap {
    /// Every tap passes.
    pub const ALL_PASS: Self = Self(PASS_MASK);
    /// Every tap fails.
    pub const ALL_FAIL: Self = Self(0);

    /// Builds a bitmap, discarding bits beyond the last tap.
    #[must_use]
    pub const fn from_bits(bits: u16) -> Self {
        Self(bits & PASS_MASK)
    }

    /// Raw bit image, bit `n` set when tap `n` passes.
    #[must_use]
    pub const fn bits(self) -> u16 {
        self.0
    }

    /// Returns `true` when `phase` passed.
    #[must_use]
    pub const fn contains(self, phase: PhaseIndex) -> bool {
        self.0 & (1 << phase.get()) != 0
    }

    /// Returns a copy with `phase` marked as passing.
    #[must_use]
    pub const fn with(self, phase: PhaseIndex) -> Self {
        Self(self.0 | (1 << phase.get()))
    }

    /// Returns a copy with `phase` marked as failing.
    #[must_use]
    pub const fn without(self, phase: PhaseIndex) -> Self {
        Self(self.0 & !(1 << phase.get()))
    }

    /// Marks `phase` as failing in place.
    pub fn remove(&mut self, phase: PhaseIndex) {
        *self = self.without(phase);
    }

    /// Taps passing in both bitmaps.
    #[must_use]
    pub const fn intersect(self, other: Self) -> Self {
        Self(self.0 & other.0)
    }

    /// Number of passing taps.
    #[must_use]
    pub fn pass_count(self) -> u8 {
        match u8::try_from(self.0.count_ones()) {
            Ok(value) => value,
            Err(_) => u8::MAX,
        }
    }

    /// Number of failing taps.
    #[must_use]
    pub fn fail_count(self) -> u8 {
        match u8::try_from(PHASE_COUNT) {
            Ok(total) => total.saturating_sub(self.pass_count()),
            Err(_) => 0,
        }
    }

    /// Returns `true` when no tap failed.
    #[must_use]
    pub const fn is_all_pass(self) -> bool {
        self.0 == PASS_MASK
    }

    /// Returns `true` when no tap passed.
    #[must_use]
    pub const fn is_all_fail(self) -> bool {
        self.0 == 0
    }

    /// Returns `true` when at least one tap failed.
    #[must_use]
    pub const fn has_failure(self) -> bool {
        !self.is_all_pass()
    }

    /// Lowest failing tap, if any.
    #[must_use]
    pub fn first_fail(self) -> Option<PhaseIndex> {
        PhaseIndex::all().find(|phase| !self.contains(*phase))
    }

    /// Iterates over failing taps in ascending order.
    pub fn failing(self) -> impl Iterator<Item = PhaseIndex> {
        PhaseIndex::all().filter(move |phase| !self.contains(*phase))
    }
}

impl Default for PassBitmap {
    fn default() -> Self {
        Self::ALL_PASS
    }
}

impl BitAnd for PassBitmap {
    type Output = Self;

    fn bitand(self, rhs: Self) -> Self {
        self.intersect(rhs)
    }
}

impl BitAndAssign for PassBitmap {
    fn bitand_assign(&mut self, rhs: Self) {
        *self = self.intersect(rhs);
    }
}

impl FromIterator<PhaseIndex> for PassBitmap {
    fn from_iter<I: IntoIterator<Item = PhaseIndex>>(iter: I) -> Self {
        iter.into_iter()
            .fold(Self::ALL_FAIL, |bitmap, phase| bitmap.with(phase))
    }
}

/// Renders tap 0 first, `o` for pass and `x` for fail.
impl fmt::Display for PassBitmap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for phase in PhaseIndex::all() {
            f.write_str(if self.contains(phase) { "o" } else { "x" })?;
        }
        Ok(())
    }
}

/// High-speed bus modes that require calibration.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum BusMode {
    /// 100 MHz single data rate.
    Sdr50,
    /// 208 MHz single data rate.
    Sdr104,
}

impl BusMode {
    /// Every calibrated mode, in state-table order.
    pub const ALL: [BusMode; 2] = [BusMode::Sdr50, BusMode::Sdr104];

    /// Slot used for per-mode tables.
    #[must_use]
    pub const fn index(self) -> usize {
        match self {
            BusMode::Sdr50 => 0,
            BusMode::Sdr104 => 1,
        }
    }

    /// Lower-case name used on the console.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            BusMode::Sdr50 => "sdr50",
            BusMode::Sdr104 => "sdr104",
        }
    }

    /// Case-insensitive lookup by console name.
    #[must_use]
    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|mode| mode.name().eq_ignore_ascii_case(name))
    }
}

impl fmt::Display for BusMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Transmit/receive tap pair programmed together.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Hash)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct PhasePair {
    pub tx: PhaseIndex,
    pub rx: PhaseIndex,
}

impl PhasePair {
    /// Creates a new pair.
    #[must_use]
    pub const fn new(tx: PhaseIndex, rx: PhaseIndex) -> Self {
        Self { tx, rx }
    }
}

impl fmt::Display for PhasePair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "tx={} rx={}", self.tx, self.rx)
    }
}
