//! Simulated storage bridge.
//!
//! The bridge keeps a configuration image like the real part and answers
//! tuning commands from an eye model: a passing receive region per DLL
//! voltage domain that widens as driver strength rises. Faults can be armed
//! from the console.

use std::time::Duration;

use tuning_core::bridge::{BridgeError, StorageBridge};
use tuning_core::channel::ProbeError;
use tuning_core::codec::{ConfigBlob, PhaseCodec};
use tuning_core::ladder::VOLTAGE_DOMAINS;
use tuning_core::phase::{BusMode, PassBitmap, PhaseIndex, PhasePair};
use tuning_core::repl::commands::BusHooks;
use tuning_core::repl::grammar::FaultCommand;

/// Eye shapes selectable from the command line.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum SimProfile {
    /// Every tap passes in every domain.
    Open,
    /// Three receive taps at the weakest drive. One step opens the eye.
    Narrow,
    /// The lowest voltage domain never locks.
    LockLoss,
    /// Two transmit taps are unusable and the receive eye wraps past tap 10.
    Marginal,
}

impl SimProfile {
    pub const ALL: [SimProfile; 4] = [
        SimProfile::Open,
        SimProfile::Narrow,
        SimProfile::LockLoss,
        SimProfile::Marginal,
    ];

    pub fn tag(self) -> &'static str {
        match self {
            SimProfile::Open => "open",
            SimProfile::Narrow => "narrow",
            SimProfile::LockLoss => "lockloss",
            SimProfile::Marginal => "marginal",
        }
    }

    pub fn from_tag(tag: &str) -> Result<Self, String> {
        Self::ALL
            .into_iter()
            .find(|profile| profile.tag().eq_ignore_ascii_case(tag))
            .ok_or_else(|| format!("Unknown bus profile `{tag}`"))
    }

    pub fn model(self) -> EyeModel {
        match self {
            SimProfile::Open => EyeModel::open(),
            SimProfile::Narrow => EyeModel {
                rx_eye: [taps(&[0, 1, 2]); VOLTAGE_DOMAINS],
                widen_per_step: 4,
                ..EyeModel::open()
            },
            SimProfile::LockLoss => EyeModel {
                dead_domains: [true, false, false, false],
                ..EyeModel::open()
            },
            SimProfile::Marginal => EyeModel {
                rx_eye: [taps(&[7, 8, 9, 10, 0, 1, 2]); VOLTAGE_DOMAINS],
                tx_ok: PassBitmap::ALL_PASS
                    .without(PhaseIndex::wrapping(4))
                    .without(PhaseIndex::wrapping(5)),
                widen_per_step: 1,
                ..EyeModel::open()
            },
        }
    }
}

/// Physical behaviour of the simulated link.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct EyeModel {
    /// Passing receive taps at driver strength 0, per voltage domain.
    pub rx_eye: [PassBitmap; VOLTAGE_DOMAINS],
    /// Transmit taps the card accepts.
    pub tx_ok: PassBitmap,
    /// Domains whose delay line never locks.
    pub dead_domains: [bool; VOLTAGE_DOMAINS],
    /// Taps regained on each edge per driver-strength step.
    pub widen_per_step: u8,
}

impl EyeModel {
    pub fn open() -> Self {
        Self {
            rx_eye: [PassBitmap::ALL_PASS; VOLTAGE_DOMAINS],
            tx_ok: PassBitmap::ALL_PASS,
            dead_domains: [false; VOLTAGE_DOMAINS],
            widen_per_step: 0,
        }
    }

    /// Receive taps passing at the given settings.
    pub fn eye(&self, voltage: usize, driver_strength: u8) -> PassBitmap {
        let steps = usize::from(driver_strength) * usize::from(self.widen_per_step);
        (0..steps).fold(self.rx_eye[voltage], |eye, _| widen(eye))
    }
}

/// In-memory bridge driven by an [`EyeModel`].
pub struct SimulatedBridge {
    model: EyeModel,
    mode: BusMode,
    stored: ConfigBlob,
    selected: bool,
    reselect_fault: Option<PhasePair>,
    reselect_pending: bool,
    no_lock_pending: bool,
    writes: usize,
    probes: usize,
}

impl SimulatedBridge {
    pub fn new(model: EyeModel) -> Self {
        Self {
            model,
            mode: BusMode::Sdr104,
            stored: ConfigBlob::new(),
            selected: true,
            reselect_fault: None,
            reselect_pending: false,
            no_lock_pending: false,
            writes: 0,
            probes: 0,
        }
    }

    pub fn writes(&self) -> usize {
        self.writes
    }

    pub fn probes(&self) -> usize {
        self.probes
    }

    /// Pair and settings the image currently holds for the active mode.
    fn programmed(&self) -> Option<(PhasePair, usize, u8)> {
        let fields = PhaseCodec::decode(&self.stored, self.mode).ok()?;
        Some((
            PhasePair::new(fields.tx, fields.rx),
            fields.extra.voltage.index(),
            fields.extra.driver_strength.get(),
        ))
    }
}

impl StorageBridge for SimulatedBridge {
    fn select(&mut self, selected: bool, _timeout: Duration) -> Result<(), BridgeError> {
        if selected && std::mem::take(&mut self.reselect_pending) {
            log::debug!("sim: reselect dropped");
            return Err(BridgeError::SelectTimeout);
        }
        self.selected = selected;
        Ok(())
    }

    fn write_block(&mut self, blob: &ConfigBlob, _timeout: Duration) -> Result<(), BridgeError> {
        if self.selected {
            return Err(BridgeError::TransferTimeout);
        }
        self.stored = blob.clone();
        self.writes += 1;

        if let Some((pair, _, _)) = self.programmed()
            && self.reselect_fault == Some(pair)
        {
            self.reselect_fault = None;
            self.reselect_pending = true;
        }
        Ok(())
    }

    fn read_block(&mut self, blob: &mut ConfigBlob, _timeout: Duration) -> Result<(), BridgeError> {
        if self.selected {
            return Err(BridgeError::TransferTimeout);
        }
        let eye = match self.programmed() {
            Some((_, voltage, drive)) => self.model.eye(voltage, drive),
            None => PassBitmap::ALL_FAIL,
        };
        PhaseCodec::encode_status(&mut self.stored, spread(eye), u64::MAX);
        *blob = self.stored.clone();
        Ok(())
    }

    fn send_tuning(&mut self, _opcode: u8, _timeout: Duration) -> Result<(), ProbeError> {
        self.probes += 1;
        let Some((pair, voltage, _)) = self.programmed() else {
            return Err(ProbeError::Unstable);
        };
        if std::mem::take(&mut self.no_lock_pending) || self.model.dead_domains[voltage] {
            return Err(ProbeError::NoLock);
        }
        if !self.model.tx_ok.contains(pair.tx) {
            return Err(ProbeError::Unstable);
        }
        Ok(())
    }
}

impl BusHooks for SimulatedBridge {
    fn script_fault(&mut self, fault: FaultCommand) -> bool {
        match fault {
            FaultCommand::Reselect(pair) => self.reselect_fault = Some(pair),
            FaultCommand::NoLock => self.no_lock_pending = true,
        }
        true
    }

    fn prepare(&mut self, mode: BusMode) {
        self.mode = mode;
    }
}

fn taps(passing: &[u8]) -> PassBitmap {
    passing.iter().filter_map(|&tap| PhaseIndex::new(tap)).collect()
}

/// Grows every passing run by one tap on each side.
fn widen(eye: PassBitmap) -> PassBitmap {
    PhaseIndex::all()
        .filter(|&tap| eye.contains(tap) || eye.contains(tap.prev()) || eye.contains(tap.next()))
        .collect()
}

/// Expands an 11-tap bitmap into the 64-bit fine vector the bridge reports.
fn spread(bitmap: PassBitmap) -> u64 {
    (0..64)
        .filter(|&bit| bitmap.contains(PhaseIndex::wrapping(bit)))
        .fold(0, |raw, bit| raw | (1u64 << bit))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tuning_core::bridge::{BlobChannel, ProbeTimeouts};
    use tuning_core::config::CalibrationConfig;
    use tuning_core::engine::{CalibrationEngine, CalibrationError};
    use tuning_core::repl::commands::CalibrationTarget;

    fn engine(profile: SimProfile) -> CalibrationEngine<BlobChannel<SimulatedBridge>> {
        let config = CalibrationConfig::default();
        let channel = BlobChannel::new(SimulatedBridge::new(profile.model()), config.timeouts);
        CalibrationEngine::new(channel, config)
    }

    fn pair(tx: u8, rx: u8) -> PhasePair {
        PhasePair::new(
            PhaseIndex::new(tx).expect("tx tap"),
            PhaseIndex::new(rx).expect("rx tap"),
        )
    }

    #[test]
    fn driver_strength_widens_the_eye() {
        let model = SimProfile::Narrow.model();
        assert_eq!(model.eye(0, 0).pass_count(), 3);
        assert!(model.eye(0, 1).is_all_pass());
        assert_eq!(widen(taps(&[0])), taps(&[10, 0, 1]));
    }

    #[test]
    fn spread_folds_back_to_the_same_taps() {
        let eye = taps(&[2, 3, 4, 5]);
        let snapshot = tuning_core::channel::StatusSnapshot::from_raw(spread(eye), u64::MAX);
        assert_eq!(snapshot.tx, eye);
    }

    #[test]
    fn transfers_require_a_deselected_card() {
        let mut bridge = SimulatedBridge::new(EyeModel::open());
        let timeout = ProbeTimeouts::new().register;
        assert_eq!(
            bridge.write_block(&ConfigBlob::new(), timeout),
            Err(BridgeError::TransferTimeout)
        );
        bridge.select(false, timeout).expect("deselect");
        assert_eq!(bridge.write_block(&ConfigBlob::new(), timeout), Ok(()));
        assert_eq!(bridge.writes(), 1);
    }

    #[test]
    fn open_profile_converges() {
        let mut engine = engine(SimProfile::Open);
        let result =
            CalibrationTarget::calibrate(&mut engine, BusMode::Sdr104).expect("calibration");
        assert_eq!(result.pair(), pair(2, 8));
        assert_eq!(result.window_width, 8);
        assert_eq!(engine.bus().bridge().probes(), 12);
    }

    #[test]
    fn lockloss_profile_moves_off_the_dead_domain() {
        let mut engine = engine(SimProfile::LockLoss);
        let result =
            CalibrationTarget::calibrate(&mut engine, BusMode::Sdr50).expect("calibration");
        assert_eq!(result.voltage.get(), 1);
        assert_eq!(result.attempts, 2);
        assert_eq!(engine.learned_voltage_stats(BusMode::Sdr50), [1, 0, 0, 0]);
    }

    #[test]
    fn narrow_profile_needs_more_drive() {
        let mut engine = engine(SimProfile::Narrow);
        let result =
            CalibrationTarget::calibrate(&mut engine, BusMode::Sdr104).expect("calibration");
        assert_eq!(result.driver_strength.get(), 1);
        assert_eq!(result.pair(), pair(2, 8));
    }

    #[test]
    fn scripted_reselect_fires_once() {
        let mut engine = engine(SimProfile::Open);
        assert!(CalibrationTarget::script_fault(
            &mut engine,
            FaultCommand::Reselect(pair(3, 8))
        ));

        assert_eq!(
            CalibrationTarget::calibrate(&mut engine, BusMode::Sdr104),
            Err(CalibrationError::ReselectTimeout { pair: pair(3, 8) })
        );
        let result = CalibrationTarget::calibrate(&mut engine, BusMode::Sdr104).expect("resumed");
        assert_eq!(result.pair(), pair(2, 8));
    }

    #[test]
    fn profiles_parse_from_tags() {
        assert_eq!(SimProfile::from_tag("LockLoss"), Ok(SimProfile::LockLoss));
        assert!(SimProfile::from_tag("closed").is_err());
    }
}
