//! Calibration state machine.
//!
//! One `calibrate` call runs attempts until a verified phase pair is found or
//! a budget runs out. Each attempt sweeps every transmit tap, probes it at a
//! receive tap chosen from what is already known, shapes any failures into the
//! inject bitmap, and finally picks the centre of the surviving window.
//! Voltage and driver-strength escalations restart the attempt with a fresh
//! history; a card-reselect timeout aborts the call and is resumed by the next
//! one.

use core::{fmt, mem};

use crate::channel::{
    ChannelError, ExtraFields, ProbeError, RegisterChannel, StatusSnapshot, TuningProbe,
    full_sweep,
};
use crate::config::CalibrationConfig;
use crate::history::FailureHistory;
use crate::inject::failure_point;
use crate::ladder::{DriverStrength, VOLTAGE_DOMAINS, VoltageDomain, VoltageLadder};
use crate::phase::{BusMode, PHASE_COUNT, PassBitmap, PhaseIndex, PhasePair};
use crate::telemetry::{CompletionOutcome, TelemetryEventKind, TelemetryRecorder};
use crate::window::{CenterBias, WindowError, WindowSearch};

/// Terminal failures of a `calibrate` call.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum CalibrationError {
    /// No receive or transmit tap survived the sweep.
    NoPassingPhaseFound,
    /// Every attempt ended in an escalation or a failed tap sweep.
    RetryBudgetExhausted,
    /// The last attempt converged but its verification probe failed.
    VerificationFailed,
    /// The card did not come back after a register round-trip.
    ReselectTimeout { pair: PhasePair },
}

impl fmt::Display for CalibrationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CalibrationError::ReselectTimeout { pair } => write!(f, "ReselectTimeout at {pair}"),
            other => write!(f, "{other:?}"),
        }
    }
}

impl From<WindowError> for CalibrationError {
    fn from(_: WindowError) -> Self {
        CalibrationError::NoPassingPhaseFound
    }
}

/// Verified outcome of a `calibrate` call.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct CalibrationResult {
    pub mode: BusMode,
    pub tx: PhaseIndex,
    pub rx: PhaseIndex,
    /// Width of the receive window the pair was centred in.
    pub window_width: u8,
    pub voltage: VoltageDomain,
    pub driver_strength: DriverStrength,
    /// Attempts used, including the successful one.
    pub attempts: u8,
}

impl CalibrationResult {
    #[must_use]
    pub const fn pair(&self) -> PhasePair {
        PhasePair::new(self.tx, self.rx)
    }
}

impl fmt::Display for CalibrationResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} tx={} rx={} width={} voltage={} drive={} attempts={}",
            self.mode,
            self.tx,
            self.rx,
            self.window_width,
            self.voltage,
            self.driver_strength,
            self.attempts
        )
    }
}

/// States of the calibration state machine.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum EngineState {
    Init,
    SweepTxPhase,
    ProbeAtRxPhase,
    RescanRx,
    EvaluateTxResult,
    NextTxPhase,
    FinalizeGlobalPhase,
    Verify,
    Done,
    Failed,
}

impl EngineState {
    /// Returns `true` when the state represents a terminal outcome.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, EngineState::Done | EngineState::Failed)
    }
}

/// What happened the last time a transmit tap was probed.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum TxOutcome {
    #[default]
    Untested,
    Pass,
    SetPhaseFail,
    TuningFail,
    ReadStatusFail,
    /// Failures too wide to accept; the tap is being re-probed.
    Retune,
    /// Skipped after a CRC error was reported at or next to this tap.
    Masked,
}

impl TxOutcome {
    /// Returns `true` once the sweep no longer needs to visit the tap.
    #[must_use]
    pub const fn is_resolved(self) -> bool {
        !matches!(self, TxOutcome::Untested | TxOutcome::Retune)
    }
}

/// Everything the engine remembers about one bus mode between calls.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct BusModeState {
    history: FailureHistory,
    ladder: VoltageLadder,
    injected: PassBitmap,
    outcomes: [TxOutcome; PHASE_COUNT],
    /// Transmit taps not excluded by a reported CRC error.
    tx_allowed: PassBitmap,
    resume: Option<PhasePair>,
    last_result: Option<CalibrationResult>,
}

impl BusModeState {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            history: FailureHistory::new(),
            ladder: VoltageLadder::new(),
            injected: PassBitmap::ALL_PASS,
            outcomes: [TxOutcome::Untested; PHASE_COUNT],
            tx_allowed: PassBitmap::ALL_PASS,
            resume: None,
            last_result: None,
        }
    }

    #[must_use]
    pub fn history(&self) -> &FailureHistory {
        &self.history
    }

    #[must_use]
    pub fn ladder(&self) -> &VoltageLadder {
        &self.ladder
    }

    /// Bitmap currently programmed into the inject register.
    #[must_use]
    pub fn injected(&self) -> PassBitmap {
        self.injected
    }

    #[must_use]
    pub fn outcome(&self, tx: PhaseIndex) -> TxOutcome {
        self.outcomes[tx.index()]
    }

    /// Transmit taps the sweep may still visit.
    #[must_use]
    pub fn tx_allowed(&self) -> PassBitmap {
        self.tx_allowed
    }

    /// Pair the next call resumes from after a reselect timeout.
    #[must_use]
    pub fn resume_pair(&self) -> Option<PhasePair> {
        self.resume
    }

    #[must_use]
    pub fn last_result(&self) -> Option<CalibrationResult> {
        self.last_result
    }

    fn clear_attempt(&mut self) {
        self.history.reset();
        self.injected = PassBitmap::ALL_PASS;
        self.outcomes = [TxOutcome::Untested; PHASE_COUNT];
    }
}

impl Default for BusModeState {
    fn default() -> Self {
        Self::new()
    }
}

/// Per-mode state owned by the engine.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct CalibrationState {
    sdr50: BusModeState,
    sdr104: BusModeState,
}

impl CalibrationState {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            sdr50: BusModeState::new(),
            sdr104: BusModeState::new(),
        }
    }

    #[must_use]
    pub const fn mode(&self, mode: BusMode) -> &BusModeState {
        match mode {
            BusMode::Sdr50 => &self.sdr50,
            BusMode::Sdr104 => &self.sdr104,
        }
    }

    fn mode_mut(&mut self, mode: BusMode) -> &mut BusModeState {
        match mode {
            BusMode::Sdr50 => &mut self.sdr50,
            BusMode::Sdr104 => &mut self.sdr104,
        }
    }
}

/// Bookkeeping scoped to one `calibrate` call.
struct CalibrationRun {
    mode: BusMode,
    attempts: u8,
    probes: usize,
    tx: PhaseIndex,
    rx: PhaseIndex,
    sweep_count: u8,
    visited: usize,
    first_probe: bool,
    rescans: u8,
    retunes: u8,
    transport_retries: u8,
    /// Fields for the current pair were already written by the inject loop.
    programmed: bool,
    probed: PhasePair,
    snapshot: StatusSnapshot,
    selected: Option<(PhasePair, u8)>,
    verify_failed: bool,
    result: Option<CalibrationResult>,
}

impl CalibrationRun {
    fn new(mode: BusMode, basis: PhasePair) -> Self {
        Self {
            mode,
            attempts: 0,
            probes: 0,
            tx: basis.tx,
            rx: basis.rx,
            sweep_count: full_sweep(),
            visited: 0,
            first_probe: true,
            rescans: 0,
            retunes: 0,
            transport_retries: 0,
            programmed: false,
            probed: basis,
            snapshot: StatusSnapshot::from_raw(u64::MAX, u64::MAX),
            selected: None,
            verify_failed: false,
            result: None,
        }
    }

    fn restart(&mut self, basis: PhasePair) {
        self.tx = basis.tx;
        self.rx = basis.rx;
        self.sweep_count = full_sweep();
        self.visited = 0;
        self.first_probe = true;
        self.reset_budgets();
        self.programmed = false;
        self.selected = None;
    }

    fn reset_budgets(&mut self) {
        self.rescans = 0;
        self.retunes = 0;
        self.transport_retries = 0;
    }

    fn pair(&self) -> PhasePair {
        PhasePair::new(self.tx, self.rx)
    }

    fn advance_tx(&mut self) {
        self.tx = self.tx.next();
        self.visited += 1;
    }

    /// Points the next probe at the surviving window, or at the manual
    /// window while nothing has failed yet.
    fn aim(&mut self, injected: PassBitmap, manual_center: PhaseIndex) {
        match WindowSearch::find_best(injected) {
            Ok(window) if injected.has_failure() => {
                self.rx = window.start;
                self.sweep_count = window.width;
            }
            _ => {
                self.rx = manual_center;
                self.sweep_count = full_sweep();
            }
        }
    }
}

/// Drives calibration over a bus that can both program phases and probe.
pub struct CalibrationEngine<B> {
    bus: B,
    config: CalibrationConfig,
    modes: CalibrationState,
    telemetry: TelemetryRecorder,
    phase: EngineState,
}

impl<B> CalibrationEngine<B>
where
    B: RegisterChannel + TuningProbe,
{
    #[must_use]
    pub fn new(bus: B, config: CalibrationConfig) -> Self {
        Self {
            bus,
            config,
            modes: CalibrationState::new(),
            telemetry: TelemetryRecorder::new(),
            phase: EngineState::Init,
        }
    }

    #[must_use]
    pub fn bus(&self) -> &B {
        &self.bus
    }

    pub fn bus_mut(&mut self) -> &mut B {
        &mut self.bus
    }

    #[must_use]
    pub fn into_inner(self) -> B {
        self.bus
    }

    #[must_use]
    pub fn config(&self) -> &CalibrationConfig {
        &self.config
    }

    /// State the machine stopped in after the last call.
    #[must_use]
    pub fn state(&self) -> EngineState {
        self.phase
    }

    #[must_use]
    pub fn mode_state(&self, mode: BusMode) -> &BusModeState {
        self.modes.mode(mode)
    }

    #[must_use]
    pub fn telemetry(&self) -> &TelemetryRecorder {
        &self.telemetry
    }

    /// Lock failures per DLL voltage domain learned so far.
    #[must_use]
    pub fn learned_voltage_stats(&self, mode: BusMode) -> [u32; VOLTAGE_DOMAINS] {
        self.modes.mode(mode).ladder.unlock_counts()
    }

    /// Forgets the pass/fail history, CRC exclusions, pending resume point,
    /// and last result. Learned voltage counters are kept.
    pub fn reset_history(&mut self, mode: BusMode) {
        let state = self.modes.mode_mut(mode);
        state.clear_attempt();
        state.tx_allowed = PassBitmap::ALL_PASS;
        state.resume = None;
        state.last_result = None;
        debug!("history reset for {}", mode.name());
    }

    /// Records a CRC error seen by the host while running on `mode`.
    ///
    /// The transmit tap of the last result (or the default pair when there is
    /// none) and both of its neighbours are excluded from later sweeps, and the
    /// stored result is dropped so the next `calibrate` runs in full. Returns
    /// the tap that was blamed.
    pub fn report_crc_error(&mut self, mode: BusMode) -> PhaseIndex {
        let default_tx = self.config.mode(mode).default_pair.tx;
        let state = self.modes.mode_mut(mode);
        let tx = state.last_result.take().map_or(default_tx, |result| result.tx);
        state.tx_allowed = state
            .tx_allowed
            .without(tx.prev())
            .without(tx)
            .without(tx.next());
        warn!(
            "crc error on {} at tx={}, {} tx taps left",
            mode.name(),
            tx.get(),
            state.tx_allowed.pass_count()
        );
        tx
    }

    /// Finds and verifies a phase pair for `mode`.
    ///
    /// A result stored by an earlier call is written back and tuned once; the
    /// full sweep only runs when that fails, after [`Self::reset_history`], or
    /// after [`Self::report_crc_error`].
    ///
    /// # Errors
    ///
    /// Returns [`CalibrationError::ReselectTimeout`] as soon as the card fails
    /// to come back; the next call resumes from the same pair. The other
    /// variants are returned once the configured budgets are exhausted. In
    /// every error case the default phase pair is written back.
    pub fn calibrate(&mut self, mode: BusMode) -> Result<CalibrationResult, CalibrationError> {
        if let Some(result) = self.reapply(mode)? {
            return Ok(result);
        }

        info!("calibration start for {}", mode.name());
        self.modes.mode_mut(mode).ladder.begin_round();

        let mut run = CalibrationRun::new(mode, self.config.mode(mode).default_pair);
        self.phase = EngineState::Init;

        loop {
            match self.step(&mut run) {
                Ok(next) => self.phase = next,
                Err(err) => {
                    self.phase = EngineState::Failed;
                    self.apply_fallback(mode);
                    self.telemetry.record_completion(
                        mode,
                        CompletionOutcome::Failed,
                        usize::from(run.attempts),
                        run.probes,
                    );
                    warn!(
                        "calibration for {} failed after {} attempts",
                        mode.name(),
                        run.attempts
                    );
                    return Err(err);
                }
            }

            if let Some(result) = run.result.take() {
                self.modes.mode_mut(mode).last_result = Some(result);
                self.telemetry.record_completion(
                    mode,
                    CompletionOutcome::Converged,
                    usize::from(run.attempts),
                    run.probes,
                );
                info!(
                    "calibrated {}: tx={} rx={} width={}",
                    mode.name(),
                    result.tx.get(),
                    result.rx.get(),
                    result.window_width
                );
                return Ok(result);
            }
        }
    }

    /// Re-programs the stored result for `mode` and checks that the card still
    /// tunes on it. Returns `None` when a full calibration is needed.
    fn reapply(&mut self, mode: BusMode) -> Result<Option<CalibrationResult>, CalibrationError> {
        let Some(result) = self.modes.mode(mode).last_result else {
            return Ok(None);
        };
        let pair = result.pair();
        let extra = ExtraFields::plain(mode, result.voltage, result.driver_strength);

        let tuned = match self.bus.write_phase(pair.tx, pair.rx, &extra) {
            Ok(()) => self.bus.run_probe(self.config.tuning_opcode).is_ok(),
            Err(err) if err.is_fatal() => {
                self.modes.mode_mut(mode).last_result = None;
                self.phase = EngineState::Failed;
                self.apply_fallback(mode);
                return Err(CalibrationError::ReselectTimeout { pair });
            }
            Err(_) => false,
        };

        if !tuned {
            info!("stored pair for {} no longer tunes", mode.name());
            self.modes.mode_mut(mode).last_result = None;
            return Ok(None);
        }

        self.phase = EngineState::Done;
        info!(
            "reusing {} result tx={} rx={}",
            mode.name(),
            pair.tx.get(),
            pair.rx.get()
        );
        Ok(Some(result))
    }

    fn step(&mut self, run: &mut CalibrationRun) -> Result<EngineState, CalibrationError> {
        match self.phase {
            EngineState::Init | EngineState::Done | EngineState::Failed => self.begin_attempt(run),
            EngineState::SweepTxPhase => Ok(self.select_tx(run)),
            EngineState::ProbeAtRxPhase => self.probe(run),
            EngineState::RescanRx => self.rescan(run),
            EngineState::EvaluateTxResult => Ok(self.evaluate(run)),
            EngineState::NextTxPhase => {
                run.advance_tx();
                Ok(EngineState::SweepTxPhase)
            }
            EngineState::FinalizeGlobalPhase => self.finalize(run),
            EngineState::Verify => self.verify(run),
        }
    }

    fn begin_attempt(&mut self, run: &mut CalibrationRun) -> Result<EngineState, CalibrationError> {
        if run.attempts >= self.config.max_attempts {
            return Err(if run.verify_failed {
                CalibrationError::VerificationFailed
            } else {
                CalibrationError::RetryBudgetExhausted
            });
        }
        run.attempts += 1;

        let default_pair = self.config.mode(run.mode).default_pair;
        let state = self.modes.mode_mut(run.mode);
        let basis = if let Some(pair) = state.resume.take() {
            info!("resuming at tx={} rx={}", pair.tx.get(), pair.rx.get());
            pair
        } else {
            state.clear_attempt();
            default_pair
        };
        run.restart(basis);

        debug!(
            "attempt {} voltage={} drive={}",
            run.attempts,
            state.ladder.voltage().get(),
            state.ladder.driver_strength().get()
        );
        self.telemetry.record_attempt(run.mode, run.attempts);
        Ok(EngineState::SweepTxPhase)
    }

    fn select_tx(&mut self, run: &mut CalibrationRun) -> EngineState {
        let state = self.modes.mode_mut(run.mode);
        while run.visited < PHASE_COUNT {
            if !state.tx_allowed.contains(run.tx) {
                state.outcomes[run.tx.index()] = TxOutcome::Masked;
                state.history.mark_tx_failed(run.tx);
            } else if !state.outcome(run.tx).is_resolved() {
                run.reset_budgets();
                return EngineState::ProbeAtRxPhase;
            }
            run.advance_tx();
        }
        EngineState::FinalizeGlobalPhase
    }

    fn probe(&mut self, run: &mut CalibrationRun) -> Result<EngineState, CalibrationError> {
        let pair = run.pair();
        if !mem::take(&mut run.programmed) {
            let extra = self.extra_fields(run);
            if let Err(err) = self.bus.write_phase(pair.tx, pair.rx, &extra) {
                return self.transport_failure(run, err, TxOutcome::SetPhaseFail);
            }
        }

        run.probes += 1;
        run.probed = pair;
        let first = mem::replace(&mut run.first_probe, false);
        match self.bus.run_probe(self.config.tuning_opcode) {
            Ok(()) => {}
            Err(ProbeError::NoLock) if first => return Ok(self.escalate_voltage(run)),
            Err(_) => {
                debug!("tuning failed at tx={} rx={}", pair.tx.get(), pair.rx.get());
                self.fail_tx(run, TxOutcome::TuningFail);
                return Ok(EngineState::NextTxPhase);
            }
        }

        match self.bus.read_status() {
            Ok(snapshot) => {
                trace!(
                    "status at tx={} rx={}: tx={} access={}",
                    pair.tx.get(),
                    pair.rx.get(),
                    snapshot.tx.bits(),
                    snapshot.accessibility.bits()
                );
                run.snapshot = snapshot;
                Ok(EngineState::RescanRx)
            }
            Err(err) => self.transport_failure(run, err, TxOutcome::ReadStatusFail),
        }
    }

    fn rescan(&mut self, run: &mut CalibrationRun) -> Result<EngineState, CalibrationError> {
        let config = self.config;
        let policy = config.policy(run.mode);
        let manual_center = self.manual_center(run.mode, run.rx);
        let snapshot = run.snapshot;
        let (tx, rx) = (run.probed.tx, run.probed.rx);
        let state = self.modes.mode_mut(run.mode);

        if snapshot.tx.is_all_pass() {
            state.history.observe(tx, snapshot.tx);
            state.history.restrict_accessibility(tx, snapshot.accessibility);
            state.outcomes[tx.index()] = TxOutcome::Pass;
            run.aim(state.injected, manual_center);
            return Ok(EngineState::EvaluateTxResult);
        }

        let (observed, known, retune) = if snapshot.tx.is_all_fail() {
            let point = failure_point(rx, snapshot.tx_fine, run.sweep_count);
            (point.bitmap, point.start, true)
        } else {
            let known = (0..PHASE_COUNT)
                .map(|step| rx.offset(step))
                .find(|&phase| !snapshot.tx.contains(phase))
                .unwrap_or(rx);
            (
                snapshot.tx,
                known,
                snapshot.tx.fail_count() > config.stable_fail_limit,
            )
        };

        // Failures at taps the programmed window still counted as passing.
        let widened = observed.failing().any(|tap| state.injected.contains(tap));
        state.injected = policy.merge(state.injected, observed, known);
        state.history.merge_history(state.injected);
        state.history.observe(tx, observed);
        state.history.restrict_accessibility(tx, snapshot.accessibility);
        debug!(
            "tx={} saw {} failures from {}, inject={}",
            tx.get(),
            observed.fail_count(),
            known.get(),
            state.injected.bits()
        );

        if state.injected.pass_count() < config.min_pass_width {
            return Ok(EngineState::EvaluateTxResult);
        }
        run.aim(state.injected, manual_center);

        if !retune {
            if widened && run.rescans < config.rescan_budget {
                run.rescans += 1;
                debug!("tx={} rescan {} from rx={}", tx.get(), run.rescans, run.rx.get());
                return Ok(self.program_inject(run));
            }
            state.outcomes[tx.index()] = TxOutcome::Pass;
            return Ok(EngineState::EvaluateTxResult);
        }

        state.outcomes[tx.index()] = TxOutcome::Retune;
        if run.retunes >= config.retune_budget {
            debug!("tx={} out of retunes", tx.get());
            self.fail_tx(run, TxOutcome::SetPhaseFail);
            return Ok(EngineState::NextTxPhase);
        }
        run.retunes += 1;

        Ok(self.program_inject(run))
    }

    /// Writes the shaped inject bitmap ahead of the re-probe.
    fn program_inject(&mut self, run: &mut CalibrationRun) -> EngineState {
        let config = self.config;
        let policy = config.policy(run.mode);

        for _ in 0..config.inject_budget {
            let extra = self.extra_fields(run);
            match self.bus.write_phase(run.tx, run.rx, &extra) {
                Ok(()) => {
                    run.programmed = true;
                    break;
                }
                Err(ChannelError::ReselectTimeout) => {
                    warn!("reselect timeout programming inject at rx={}", run.rx.get());
                    let manual_center = self.manual_center(run.mode, run.rx);
                    let state = self.modes.mode_mut(run.mode);
                    state.injected = policy.erode(state.injected.without(run.rx));
                    if state.injected.pass_count() < config.min_pass_width {
                        return EngineState::EvaluateTxResult;
                    }
                    run.aim(state.injected, manual_center);
                }
                Err(_) => break,
            }
        }

        EngineState::ProbeAtRxPhase
    }

    fn evaluate(&mut self, run: &mut CalibrationRun) -> EngineState {
        let floor = self.config.min_pass_width;
        let state = self.modes.mode_mut(run.mode);
        let width = state.injected.pass_count();

        if width < floor {
            let from = state.ladder.driver_strength();
            let to = state.ladder.escalate_driver_strength();
            self.telemetry.record_drive_step(run.mode, from.get(), to.get());
            run.verify_failed = false;
            return EngineState::Init;
        }

        let seen = state.history.tx_result(run.probed.tx).pass_count();
        self.telemetry.record_phase(
            TelemetryEventKind::TxResolved(run.mode),
            run.probed,
            Some(seen),
        );
        EngineState::NextTxPhase
    }

    fn finalize(&mut self, run: &mut CalibrationRun) -> Result<EngineState, CalibrationError> {
        let policy = self.config.policy(run.mode);
        let history = &mut self.modes.mode_mut(run.mode).history;

        let removed = history.smooth_diagonals();
        history.fold_history_into_rows();

        let rx_window = WindowSearch::find_best(policy.erode(history.tx_history()))?;
        let tx_window = WindowSearch::find_best_with(
            history.accessibility_at(rx_window.center),
            CenterBias::Left,
        )?;

        debug!(
            "dropped diagonal {}, rx window {}+{}, tx window {}+{}",
            removed.get(),
            rx_window.start.get(),
            rx_window.width,
            tx_window.start.get(),
            tx_window.width
        );
        run.selected = Some((
            PhasePair::new(tx_window.center, rx_window.center),
            rx_window.width,
        ));
        Ok(EngineState::Verify)
    }

    fn verify(&mut self, run: &mut CalibrationRun) -> Result<EngineState, CalibrationError> {
        let Some((pair, width)) = run.selected else {
            return Ok(EngineState::FinalizeGlobalPhase);
        };
        let state = self.modes.mode(run.mode);
        let (voltage, driver_strength) = (state.ladder.voltage(), state.ladder.driver_strength());
        let extra = ExtraFields {
            inject: state.injected,
            inject_enable: state.injected.has_failure(),
            ..ExtraFields::plain(run.mode, voltage, driver_strength)
        };

        let verified = match self.verify_probe(run, pair, &extra) {
            Ok(Some(snapshot)) => {
                // The status must still pass at the chosen rx.
                match WindowSearch::run_width_at(snapshot.tx, pair.rx) {
                    0 => None,
                    seen => Some(width.min(seen)),
                }
            }
            Ok(None) => None,
            Err(err) if err.is_fatal() => return Err(self.reselect_timeout(run.mode, pair)),
            Err(_) => None,
        };

        let Some(width) = verified else {
            warn!(
                "verification failed at tx={} rx={}, restarting",
                pair.tx.get(),
                pair.rx.get()
            );
            run.verify_failed = true;
            return Ok(EngineState::Init);
        };

        run.result = Some(CalibrationResult {
            mode: run.mode,
            tx: pair.tx,
            rx: pair.rx,
            window_width: width,
            voltage,
            driver_strength,
            attempts: run.attempts,
        });
        Ok(EngineState::Done)
    }

    fn verify_probe(
        &mut self,
        run: &mut CalibrationRun,
        pair: PhasePair,
        extra: &ExtraFields,
    ) -> Result<Option<StatusSnapshot>, ChannelError> {
        self.bus.write_phase(pair.tx, pair.rx, extra)?;
        run.probes += 1;
        if self.bus.run_probe(self.config.tuning_opcode).is_err() {
            return Ok(None);
        }
        self.bus.read_status().map(Some)
    }

    fn escalate_voltage(&mut self, run: &mut CalibrationRun) -> EngineState {
        let ladder = &mut self.modes.mode_mut(run.mode).ladder;
        let from = ladder.voltage();
        let to = ladder.record_unlock_failure();
        self.telemetry.record_voltage_step(run.mode, from.get(), to.get());
        run.verify_failed = false;
        EngineState::Init
    }

    fn transport_failure(
        &mut self,
        run: &mut CalibrationRun,
        err: ChannelError,
        outcome: TxOutcome,
    ) -> Result<EngineState, CalibrationError> {
        if err.is_fatal() {
            return Err(self.reselect_timeout(run.mode, run.pair()));
        }
        if run.transport_retries < self.config.rescan_budget {
            run.transport_retries += 1;
            debug!("transport retry {} at tx={}", run.transport_retries, run.tx.get());
            return Ok(EngineState::ProbeAtRxPhase);
        }

        self.fail_tx(run, outcome);
        Ok(EngineState::NextTxPhase)
    }

    fn reselect_timeout(&mut self, mode: BusMode, pair: PhasePair) -> CalibrationError {
        self.modes.mode_mut(mode).resume = Some(pair);
        self.telemetry
            .record_phase(TelemetryEventKind::ReselectTimeout(mode), pair, None);
        warn!(
            "reselect timeout at tx={} rx={}, attempt abandoned",
            pair.tx.get(),
            pair.rx.get()
        );
        CalibrationError::ReselectTimeout { pair }
    }

    fn fail_tx(&mut self, run: &CalibrationRun, outcome: TxOutcome) {
        let state = self.modes.mode_mut(run.mode);
        state.outcomes[run.tx.index()] = outcome;
        state.history.mark_tx_failed(run.tx);
    }

    fn apply_fallback(&mut self, mode: BusMode) {
        let pair = self.config.mode(mode).default_pair;
        let ladder = &self.modes.mode(mode).ladder;
        let extra = ExtraFields::plain(mode, ladder.voltage(), ladder.driver_strength());
        let written = self.bus.write_phase(pair.tx, pair.rx, &extra).is_ok();

        self.telemetry
            .record_phase(TelemetryEventKind::FallbackApplied(mode), pair, None);
        warn!(
            "falling back to tx={} rx={} (written: {})",
            pair.tx.get(),
            pair.rx.get(),
            written
        );
    }

    fn extra_fields(&self, run: &CalibrationRun) -> ExtraFields {
        let state = self.modes.mode(run.mode);
        ExtraFields {
            mode: run.mode,
            sweep_count: run.sweep_count,
            inject: state.injected,
            inject_enable: state.injected.has_failure(),
            voltage: state.ladder.voltage(),
            driver_strength: state.ladder.driver_strength(),
        }
    }

    fn manual_center(&self, mode: BusMode, fallback: PhaseIndex) -> PhaseIndex {
        WindowSearch::find_best(self.config.policy(mode).manual_mask())
            .map_or(fallback, |window| window.center)
    }
}
