//! Tunable thresholds and defaults for the calibration engine.

use crate::bridge::ProbeTimeouts;
use crate::channel::TUNING_OPCODE;
use crate::inject::{DEFAULT_EROSION_FAIL_LIMIT, InjectionPolicy, manual_inject_mask};
use crate::phase::{BusMode, PassBitmap, PhaseIndex, PhasePair};

/// Statically configured phase pair used as the start point and fallback.
pub const DEFAULT_PHASE_PAIR: PhasePair = PhasePair::new(PhaseIndex::ZERO, PhaseIndex::wrapping(7));

/// Settings that vary per bus mode.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct ModeConfig {
    /// Pair written on entry and restored on failure.
    pub default_pair: PhasePair,
    /// Substitute for an all-pass observation.
    pub manual_inject: PassBitmap,
}

impl ModeConfig {
    #[must_use]
    pub const fn for_mode(mode: BusMode) -> Self {
        Self {
            default_pair: DEFAULT_PHASE_PAIR,
            manual_inject: manual_inject_mask(mode),
        }
    }
}

/// Engine configuration.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct CalibrationConfig {
    pub sdr50: ModeConfig,
    pub sdr104: ModeConfig,
    /// Receive re-probes allowed per transmit tap.
    pub rescan_budget: u8,
    /// Re-entries allowed for a tap classified as needing a retune.
    pub retune_budget: u8,
    /// Writes allowed in the hardware inject loop.
    pub inject_budget: u8,
    /// Narrowest acceptable pass window.
    pub min_pass_width: u8,
    pub erosion_fail_limit: u8,
    /// Failures still accepted as a stable result.
    pub stable_fail_limit: u8,
    /// Attempts per `calibrate` call before giving up.
    pub max_attempts: u8,
    pub tuning_opcode: u8,
    pub timeouts: ProbeTimeouts,
}

impl CalibrationConfig {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            sdr50: ModeConfig::for_mode(BusMode::Sdr50),
            sdr104: ModeConfig::for_mode(BusMode::Sdr104),
            rescan_budget: 3,
            retune_budget: 3,
            inject_budget: 4,
            min_pass_width: 5,
            erosion_fail_limit: DEFAULT_EROSION_FAIL_LIMIT,
            stable_fail_limit: 3,
            max_attempts: 8,
            tuning_opcode: TUNING_OPCODE,
            timeouts: ProbeTimeouts::new(),
        }
    }

    /// Settings for `mode`.
    #[must_use]
    pub const fn mode(&self, mode: BusMode) -> &ModeConfig {
        match mode {
            BusMode::Sdr50 => &self.sdr50,
            BusMode::Sdr104 => &self.sdr104,
        }
    }

    pub fn mode_mut(&mut self, mode: BusMode) -> &mut ModeConfig {
        match mode {
            BusMode::Sdr50 => &mut self.sdr50,
            BusMode::Sdr104 => &mut self.sdr104,
        }
    }

    /// Injection policy built from this configuration.
    #[must_use]
    pub const fn policy(&self, mode: BusMode) -> InjectionPolicy {
        InjectionPolicy::new(self.mode(mode).manual_inject, self.erosion_fail_limit)
    }
}

impl Default for CalibrationConfig {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_table() {
        let config = CalibrationConfig::default();
        assert_eq!(config.sdr50.default_pair.tx.get(), 0);
        assert_eq!(config.sdr50.default_pair.rx.get(), 7);
        assert_eq!(config.sdr104.default_pair, config.sdr50.default_pair);
        assert_eq!(config.sdr50.manual_inject.bits(), 0x7C7);
        assert_eq!(config.sdr104.manual_inject.bits(), 0x7F1);
        assert_eq!(
            (config.rescan_budget, config.retune_budget, config.inject_budget),
            (3, 3, 4)
        );
        assert_eq!(config.min_pass_width, 5);
        assert_eq!(config.erosion_fail_limit, 2);
        assert_eq!(config.stable_fail_limit, 3);
        assert_eq!(config.max_attempts, 8);
        assert_eq!(config.tuning_opcode, 19);
        assert_eq!(config.timeouts.tuning.as_millis(), 150);
    }

    #[test]
    fn policy_follows_mode_overrides() {
        let mut config = CalibrationConfig::new();
        config.mode_mut(BusMode::Sdr104).manual_inject = PassBitmap::from_bits(0x7F9);
        assert_eq!(config.policy(BusMode::Sdr104).manual_mask().bits(), 0x7F9);
        assert_eq!(config.policy(BusMode::Sdr50).manual_mask().bits(), 0x7C7);
    }
}
