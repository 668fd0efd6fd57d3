//! Console command dispatcher.
//!
//! Parsed commands are applied to anything implementing
//! [`CalibrationTarget`]. The engine implements it directly; fault scripting
//! and mode selection are forwarded to the bus through [`BusHooks`].

use crate::bridge::{BlobChannel, StorageBridge};
use crate::channel::{RegisterChannel, TuningProbe};
use crate::engine::{CalibrationEngine, CalibrationError, CalibrationResult};
use crate::ladder::VOLTAGE_DOMAINS;
use crate::phase::{BusMode, PhaseIndex};

use super::catalog::{self, CommandSpec};
use super::grammar::{self, Command, FaultCommand};
use super::status::StatusReport;

/// Command execution successes.
#[derive(Clone, Debug, PartialEq)]
pub enum CommandOutcome {
    Calibrated(CalibrationResult),
    Reset(BusMode),
    /// Transmit tap blamed for a reported CRC error.
    CrcReported {
        mode: BusMode,
        tx: PhaseIndex,
    },
    Stats {
        mode: BusMode,
        unlock_counts: [u32; VOLTAGE_DOMAINS],
    },
    FaultScripted(FaultCommand),
    Status(StatusReport),
    /// `None` lists the whole catalog.
    Help(Option<&'static CommandSpec>),
}

/// Errors surfaced while executing a command.
#[derive(Debug, PartialEq)]
pub enum CommandError<'a> {
    Parse(grammar::ParseError<'a>),
    Calibration(CalibrationError),
    UnknownTopic(&'a str),
    Unsupported(&'static str),
}

impl<'a> From<grammar::ParseError<'a>> for CommandError<'a> {
    fn from(error: grammar::ParseError<'a>) -> Self {
        Self::Parse(error)
    }
}

impl From<CalibrationError> for CommandError<'_> {
    fn from(error: CalibrationError) -> Self {
        Self::Calibration(error)
    }
}

/// Bus hooks used by the console.
pub trait BusHooks {
    /// Arms `fault`. Returns `false` when the bus cannot simulate it.
    fn script_fault(&mut self, fault: FaultCommand) -> bool;

    /// Called before a console-driven calibration of `mode`.
    fn prepare(&mut self, _mode: BusMode) {}
}

impl<T: BusHooks + ?Sized> BusHooks for &mut T {
    fn script_fault(&mut self, fault: FaultCommand) -> bool {
        (**self).script_fault(fault)
    }

    fn prepare(&mut self, mode: BusMode) {
        (**self).prepare(mode);
    }
}

impl<B: StorageBridge + BusHooks> BusHooks for BlobChannel<B> {
    fn script_fault(&mut self, fault: FaultCommand) -> bool {
        self.bridge_mut().script_fault(fault)
    }

    fn prepare(&mut self, mode: BusMode) {
        self.bridge_mut().prepare(mode);
    }
}

/// What the console needs from a calibration engine.
pub trait CalibrationTarget {
    /// Runs one calibration for `mode`.
    ///
    /// # Errors
    ///
    /// Returns the engine's terminal failure.
    fn calibrate(&mut self, mode: BusMode) -> Result<CalibrationResult, CalibrationError>;

    fn reset_history(&mut self, mode: BusMode);

    /// Excludes the transmit taps around the current pair after a CRC error.
    fn report_crc_error(&mut self, mode: BusMode) -> PhaseIndex;

    fn learned_voltage_stats(&self, mode: BusMode) -> [u32; VOLTAGE_DOMAINS];

    fn status(&self) -> StatusReport;

    /// Arms a bus fault. Returns `false` when the target cannot simulate it.
    fn script_fault(&mut self, fault: FaultCommand) -> bool;
}

impl<B> CalibrationTarget for CalibrationEngine<B>
where
    B: RegisterChannel + TuningProbe + BusHooks,
{
    fn calibrate(&mut self, mode: BusMode) -> Result<CalibrationResult, CalibrationError> {
        self.bus_mut().prepare(mode);
        CalibrationEngine::calibrate(self, mode)
    }

    fn reset_history(&mut self, mode: BusMode) {
        CalibrationEngine::reset_history(self, mode);
    }

    fn report_crc_error(&mut self, mode: BusMode) -> PhaseIndex {
        CalibrationEngine::report_crc_error(self, mode)
    }

    fn learned_voltage_stats(&self, mode: BusMode) -> [u32; VOLTAGE_DOMAINS] {
        CalibrationEngine::learned_voltage_stats(self, mode)
    }

    fn status(&self) -> StatusReport {
        let mut results = [None; BusMode::ALL.len()];
        for mode in BusMode::ALL {
            results[mode.index()] = self.mode_state(mode).last_result();
        }

        StatusReport {
            state: self.state(),
            results,
            latest_event: self.telemetry().latest().copied(),
            recorded_events: self.telemetry().len(),
        }
    }

    fn script_fault(&mut self, fault: FaultCommand) -> bool {
        self.bus_mut().script_fault(fault)
    }
}

/// Dispatches console commands to a calibration target.
pub struct CommandExecutor<T> {
    target: T,
}

impl<T> CommandExecutor<T> {
    /// Creates a new executor around the provided target.
    #[must_use]
    pub const fn new(target: T) -> Self {
        Self { target }
    }

    #[must_use]
    pub fn target(&self) -> &T {
        &self.target
    }

    pub fn target_mut(&mut self) -> &mut T {
        &mut self.target
    }

    /// Consumes the executor and yields the inner target.
    #[must_use]
    pub fn into_inner(self) -> T {
        self.target
    }
}

impl<T: CalibrationTarget> CommandExecutor<T> {
    /// Parses and executes a console line.
    ///
    /// # Errors
    ///
    /// Returns a parse failure, an engine failure, or an unsupported fault.
    pub fn execute<'a>(&mut self, line: &'a str) -> Result<CommandOutcome, CommandError<'a>> {
        let command = grammar::parse(line)?;
        self.dispatch(command)
    }

    fn dispatch<'a>(&mut self, command: Command<'a>) -> Result<CommandOutcome, CommandError<'a>> {
        match command {
            Command::Calibrate(mode) => {
                info!("console calibrate mode={}", mode.name());
                let result = self.target.calibrate(mode)?;
                Ok(CommandOutcome::Calibrated(result))
            }
            Command::Reset(mode) => {
                self.target.reset_history(mode);
                Ok(CommandOutcome::Reset(mode))
            }
            Command::Crc(mode) => {
                let tx = self.target.report_crc_error(mode);
                Ok(CommandOutcome::CrcReported { mode, tx })
            }
            Command::Stats(mode) => Ok(CommandOutcome::Stats {
                mode,
                unlock_counts: self.target.learned_voltage_stats(mode),
            }),
            Command::Fault(fault) => {
                if self.target.script_fault(fault) {
                    Ok(CommandOutcome::FaultScripted(fault))
                } else {
                    Err(CommandError::Unsupported("fault scripting"))
                }
            }
            Command::Status => Ok(CommandOutcome::Status(self.target.status())),
            Command::Help(help) => match help.topic {
                None => Ok(CommandOutcome::Help(None)),
                Some(topic) => catalog::find(topic)
                    .map(|spec| CommandOutcome::Help(Some(spec)))
                    .ok_or(CommandError::UnknownTopic(topic)),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::EngineState;
    use crate::ladder::{DriverStrength, VoltageDomain};
    use crate::phase::PhasePair;
    use crate::repl::catalog::CommandTag;

    #[derive(Default)]
    struct MockTarget {
        calibrated: Option<BusMode>,
        reset: Option<BusMode>,
        crc_reports: usize,
        faults: Option<FaultCommand>,
        fail_with: Option<CalibrationError>,
        faults_supported: bool,
    }

    impl CalibrationTarget for MockTarget {
        fn calibrate(&mut self, mode: BusMode) -> Result<CalibrationResult, CalibrationError> {
            self.calibrated = Some(mode);
            if let Some(error) = self.fail_with {
                return Err(error);
            }
            Ok(CalibrationResult {
                mode,
                tx: PhaseIndex::new(2).expect("tap"),
                rx: PhaseIndex::new(8).expect("tap"),
                window_width: 8,
                voltage: VoltageDomain::new(0).expect("domain"),
                driver_strength: DriverStrength::new(0).expect("step"),
                attempts: 1,
            })
        }

        fn reset_history(&mut self, mode: BusMode) {
            self.reset = Some(mode);
        }

        fn report_crc_error(&mut self, _mode: BusMode) -> PhaseIndex {
            self.crc_reports += 1;
            PhaseIndex::new(2).expect("tap")
        }

        fn learned_voltage_stats(&self, mode: BusMode) -> [u32; VOLTAGE_DOMAINS] {
            match mode {
                BusMode::Sdr50 => [0; VOLTAGE_DOMAINS],
                BusMode::Sdr104 => [1, 0, 0, 0],
            }
        }

        fn status(&self) -> StatusReport {
            StatusReport {
                state: EngineState::Done,
                ..StatusReport::idle()
            }
        }

        fn script_fault(&mut self, fault: FaultCommand) -> bool {
            self.faults = Some(fault);
            self.faults_supported
        }
    }

    fn executor() -> CommandExecutor<MockTarget> {
        CommandExecutor::new(MockTarget {
            faults_supported: true,
            ..MockTarget::default()
        })
    }

    #[test]
    fn calibrate_runs_requested_mode() {
        let mut executor = executor();
        let outcome = executor.execute("calibrate sdr50").expect("dispatch");
        assert!(matches!(
            outcome,
            CommandOutcome::Calibrated(result) if result.mode == BusMode::Sdr50
        ));
        assert_eq!(executor.target().calibrated, Some(BusMode::Sdr50));
    }

    #[test]
    fn crc_errors_reach_the_target() {
        let mut executor = executor();
        assert_eq!(
            executor.execute("crc sdr50"),
            Ok(CommandOutcome::CrcReported {
                mode: BusMode::Sdr50,
                tx: PhaseIndex::new(2).expect("tap"),
            })
        );
        assert_eq!(executor.target().crc_reports, 1);
    }

    #[test]
    fn calibration_failure_is_surfaced() {
        let mut executor = CommandExecutor::new(MockTarget {
            fail_with: Some(CalibrationError::RetryBudgetExhausted),
            ..MockTarget::default()
        });
        assert_eq!(
            executor.execute("calibrate"),
            Err(CommandError::Calibration(CalibrationError::RetryBudgetExhausted))
        );
    }

    #[test]
    fn reset_and_stats_reach_the_target() {
        let mut executor = executor();
        assert_eq!(
            executor.execute("reset sdr50"),
            Ok(CommandOutcome::Reset(BusMode::Sdr50))
        );
        assert_eq!(executor.target().reset, Some(BusMode::Sdr50));
        assert_eq!(
            executor.execute("stats"),
            Ok(CommandOutcome::Stats {
                mode: BusMode::Sdr104,
                unlock_counts: [1, 0, 0, 0],
            })
        );
    }

    #[test]
    fn faults_are_scripted_or_rejected() {
        let mut executor = executor();
        let expected = FaultCommand::Reselect(PhasePair::new(
            PhaseIndex::new(3).expect("tap"),
            PhaseIndex::new(7).expect("tap"),
        ));
        assert_eq!(
            executor.execute("fault reselect tx=3 rx=7"),
            Ok(CommandOutcome::FaultScripted(expected))
        );
        assert_eq!(executor.target().faults, Some(expected));

        executor.target_mut().faults_supported = false;
        assert_eq!(
            executor.execute("fault nolock"),
            Err(CommandError::Unsupported("fault scripting"))
        );
    }

    #[test]
    fn help_resolves_topics() {
        let mut executor = executor();
        assert_eq!(executor.execute("help"), Ok(CommandOutcome::Help(None)));
        match executor.execute("help fault") {
            Ok(CommandOutcome::Help(Some(spec))) => assert_eq!(spec.tag, CommandTag::Fault),
            other => panic!("unexpected outcome: {other:?}"),
        }
        assert_eq!(
            executor.execute("help eject"),
            Err(CommandError::UnknownTopic("eject"))
        );
    }

    #[test]
    fn status_returns_target_report() {
        let mut executor = executor();
        match executor.execute("status") {
            Ok(CommandOutcome::Status(report)) => assert_eq!(report.state, EngineState::Done),
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[test]
    fn parse_error_is_returned() {
        let mut executor = executor();
        assert!(matches!(
            executor.execute("calibrate ddr52"),
            Err(CommandError::Parse(_))
        ));
    }
}
