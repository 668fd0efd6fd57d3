//! Hardware seams consumed by the calibration engine.
//!
//! [`RegisterChannel`] moves phase settings and status through the bridge's
//! configuration path; [`TuningProbe`] issues the tuning command itself. Both
//! are implemented by [`crate::bridge::BlobChannel`] for real bridges and by
//! mocks in tests.

use core::fmt;

use crate::ladder::{DriverStrength, VoltageDomain};
use crate::phase::{BusMode, PHASE_COUNT, PassBitmap, PhaseIndex};

/// Opcode of the SD tuning block read.
pub const TUNING_OPCODE: u8 = 19;

/// Rows of 11 taps packed into a 64-bit fine status vector.
const FINE_ROWS: usize = 6;

/// Transport failures while talking to the bridge.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum ChannelError {
    /// The card did not come back after the configuration round-trip.
    ReselectTimeout,
    /// The status block never arrived.
    ReadTimeout,
    /// The configuration block was not accepted.
    WriteTimeout,
}

impl ChannelError {
    /// Returns `true` when the whole attempt must be abandoned.
    #[must_use]
    pub const fn is_fatal(self) -> bool {
        matches!(self, ChannelError::ReselectTimeout)
    }
}

impl fmt::Display for ChannelError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{self:?}")
    }
}

/// Tuning command failures.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum ProbeError {
    /// The delay line never locked; no timing information was produced.
    NoLock,
    /// The command completed but the data pattern did not verify.
    Unstable,
}

impl fmt::Display for ProbeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{self:?}")
    }
}

/// Status read back after a tuning probe.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct StatusSnapshot {
    /// Raw transmit sweep vector.
    pub tx_fine: u64,
    /// Transmit result folded onto the tap ring.
    pub tx: PassBitmap,
    /// Raw receive accessibility vector.
    pub rx_fine: u64,
    /// Receive accessibility folded onto the tap ring.
    pub accessibility: PassBitmap,
}

impl StatusSnapshot {
    /// Builds a snapshot from the two raw vectors.
    #[must_use]
    pub fn from_raw(tx_fine: u64, rx_fine: u64) -> Self {
        Self {
            tx_fine,
            tx: fold_fine_vector(tx_fine),
            rx_fine,
            accessibility: fold_fine_vector(rx_fine),
        }
    }
}

/// Reduces a 64-bit vector to 11 taps.
///
/// Bit `i` belongs to tap `i % 11`; a tap passes only when every one of its
/// bits is set. Positions past bit 63 count as passing.
#[must_use]
pub fn fold_fine_vector(raw: u64) -> PassBitmap {
    let mut bitmap = PassBitmap::ALL_PASS;
    for row in 0..FINE_ROWS {
        for tap in PhaseIndex::all() {
            let bit = row * PHASE_COUNT + tap.index();
            if bit < 64 && (raw >> bit) & 1 == 0 {
                bitmap.remove(tap);
            }
        }
    }
    bitmap
}

/// Settings programmed alongside the phase pair.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct ExtraFields {
    pub mode: BusMode,
    /// Taps swept by the hardware starting at the programmed receive phase.
    pub sweep_count: u8,
    /// Conservative bitmap for the inject register.
    pub inject: PassBitmap,
    pub inject_enable: bool,
    pub voltage: VoltageDomain,
    pub driver_strength: DriverStrength,
}

impl ExtraFields {
    /// Full sweep with injection disabled.
    #[must_use]
    pub fn plain(mode: BusMode, voltage: VoltageDomain, driver_strength: DriverStrength) -> Self {
        Self {
            mode,
            sweep_count: full_sweep(),
            inject: PassBitmap::ALL_PASS,
            inject_enable: false,
            voltage,
            driver_strength,
        }
    }
}

/// Sweep length covering the whole ring.
#[must_use]
pub fn full_sweep() -> u8 {
    PassBitmap::ALL_PASS.pass_count()
}

/// Configuration path into the bridge.
pub trait RegisterChannel {
    /// Programs the phase pair and accompanying fields.
    ///
    /// # Errors
    ///
    /// Returns the transport failure that interrupted the round-trip.
    fn write_phase(
        &mut self,
        tx: PhaseIndex,
        rx: PhaseIndex,
        extra: &ExtraFields,
    ) -> Result<(), ChannelError>;

    /// Reads the status captured by the most recent probe.
    ///
    /// # Errors
    ///
    /// Returns the transport failure that interrupted the round-trip.
    fn read_status(&mut self) -> Result<StatusSnapshot, ChannelError>;
}

/// Tuning command issuer.
pub trait TuningProbe {
    /// Runs one tuning command.
    ///
    /// # Errors
    ///
    /// Distinguishes a delay line that never locked from an unstable result.
    fn run_probe(&mut self, opcode: u8) -> Result<(), ProbeError>;
}

impl<T: RegisterChannel + ?Sized> RegisterChannel for &mut T {
    fn write_phase(
        &mut self,
        tx: PhaseIndex,
        rx: PhaseIndex,
        extra: &ExtraFields,
    ) -> Result<(), ChannelError> {
        (**self).write_phase(tx, rx, extra)
    }

    fn read_status(&mut self) -> Result<StatusSnapshot, ChannelError> {
        (**self).read_status()
    }
}

impl<T: TuningProbe + ?Sized> TuningProbe for &mut T {
    fn run_probe(&mut self, opcode: u8) -> Result<(), ProbeError> {
        (**self).run_probe(opcode)
    }
}
