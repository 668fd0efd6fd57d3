//! DLL voltage and driver-strength escalation.
//!
//! Unlock counters are learned hardware behaviour and survive every attempt.
//! The per-round `tried` flags are cleared by [`VoltageLadder::begin_round`]
//! at the start of each `calibrate` call so one call never revisits a domain
//! before the others have had a turn.

use core::fmt;

/// Number of selectable DLL supply domains.
pub const VOLTAGE_DOMAINS: usize = 4;

/// Highest programmable driver-strength step.
pub const MAX_DRIVER_STRENGTH: u8 = 7;

/// One of the DLL supply domains.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Hash)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct VoltageDomain(u8);

impl VoltageDomain {
    /// Returns the domain when `value` names one.
    #[must_use]
    pub const fn new(value: u8) -> Option<Self> {
        if (value as usize) < VOLTAGE_DOMAINS {
            Some(Self(value))
        } else {
            None
        }
    }

    #[allow(clippy::cast_possible_truncation)]
    const fn wrapping(value: usize) -> Self {
        Self((value % VOLTAGE_DOMAINS) as u8)
    }

    /// Raw domain number.
    #[must_use]
    pub const fn get(self) -> u8 {
        self.0
    }

    /// Domain number usable as an array index.
    #[must_use]
    pub const fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for VoltageDomain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Transmit drive-current step, `0..=7`.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct DriverStrength(u8);

impl DriverStrength {
    /// Strongest setting.
    pub const MAX: Self = Self(MAX_DRIVER_STRENGTH);

    /// Returns the step when `value` is programmable.
    #[must_use]
    pub const fn new(value: u8) -> Option<Self> {
        if value <= MAX_DRIVER_STRENGTH {
            Some(Self(value))
        } else {
            None
        }
    }

    /// Raw step.
    #[must_use]
    pub const fn get(self) -> u8 {
        self.0
    }

    /// Next step up, clamped at [`DriverStrength::MAX`].
    #[must_use]
    pub const fn escalated(self) -> Self {
        if self.0 < MAX_DRIVER_STRENGTH {
            Self(self.0 + 1)
        } else {
            Self::MAX
        }
    }

    /// Returns `true` once no further escalation is possible.
    #[must_use]
    pub const fn is_max(self) -> bool {
        self.0 >= MAX_DRIVER_STRENGTH
    }
}

impl fmt::Display for DriverStrength {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Escalation state for one bus mode.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct VoltageLadder {
    unlock_counts: [u32; VOLTAGE_DOMAINS],
    tried: [bool; VOLTAGE_DOMAINS],
    voltage: VoltageDomain,
    driver_strength: DriverStrength,
}

impl VoltageLadder {
    /// Starts at domain 0 with the weakest drive.
    #[must_use]
    pub const fn new() -> Self {
        Self::starting_at(VoltageDomain(0), DriverStrength(0))
    }

    /// Starts at an explicit voltage and drive step.
    #[must_use]
    pub const fn starting_at(voltage: VoltageDomain, driver_strength: DriverStrength) -> Self {
        Self {
            unlock_counts: [0; VOLTAGE_DOMAINS],
            tried: [false; VOLTAGE_DOMAINS],
            voltage,
            driver_strength,
        }
    }

    /// Domain currently programmed.
    #[must_use]
    pub const fn voltage(&self) -> VoltageDomain {
        self.voltage
    }

    /// Drive step currently programmed.
    #[must_use]
    pub const fn driver_strength(&self) -> DriverStrength {
        self.driver_strength
    }

    /// Lock failures seen per domain.
    #[must_use]
    pub const fn unlock_counts(&self) -> [u32; VOLTAGE_DOMAINS] {
        self.unlock_counts
    }

    /// Returns `true` when `domain` already failed this round.
    #[must_use]
    pub const fn was_tried(&self, domain: VoltageDomain) -> bool {
        self.tried[domain.index()]
    }

    /// Clears the per-round flags; counters are kept.
    pub fn begin_round(&mut self) {
        self.tried = [false; VOLTAGE_DOMAINS];
    }

    /// Picks the domain to move to from `current`.
    ///
    /// Among domains not yet tried this round, the one with the fewest lock
    /// failures wins, scanning upward from `current`. When every other domain
    /// was tried the ladder simply advances by one.
    #[must_use]
    pub fn next_voltage(&self, current: VoltageDomain) -> VoltageDomain {
        let mut best: Option<VoltageDomain> = None;
        for step in 1..VOLTAGE_DOMAINS {
            let candidate = VoltageDomain::wrapping(current.index() + step);
            if self.tried[candidate.index()] {
                continue;
            }
            let better = match best {
                Some(chosen) => {
                    self.unlock_counts[candidate.index()] < self.unlock_counts[chosen.index()]
                }
                None => true,
            };
            if better {
                best = Some(candidate);
            }
        }

        best.unwrap_or_else(|| VoltageDomain::wrapping(current.index() + 1))
    }

    /// Charges a lock failure to the current domain and moves on.
    pub fn record_unlock_failure(&mut self) -> VoltageDomain {
        let current = self.voltage;
        let slot = current.index();
        self.unlock_counts[slot] = self.unlock_counts[slot].saturating_add(1);
        self.tried[slot] = true;

        self.voltage = self.next_voltage(current);
        warn!(
            "dll voltage {} failed to lock ({} total), switching to {}",
            current.get(),
            self.unlock_counts[slot],
            self.voltage.get()
        );
        self.voltage
    }

    /// Raises drive strength by one step.
    pub fn escalate_driver_strength(&mut self) -> DriverStrength {
        let previous = self.driver_strength;
        self.driver_strength = previous.escalated();
        if previous.is_max() {
            warn!("driver strength already at {}, hard floor reached", previous.get());
        } else {
            warn!(
                "driver strength raised {} -> {}",
                previous.get(),
                self.driver_strength.get()
            );
        }
        self.driver_strength
    }
}

impl Default for VoltageLadder {
    fn default() -> Self {
        Self::new()
    }
}
