use std::fmt::Write as _;
use std::fs::{self, OpenOptions};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant as HostInstant};

use tuning_core::bridge::BlobChannel;
use tuning_core::config::CalibrationConfig;
use tuning_core::engine::CalibrationEngine;
use tuning_core::phase::BusMode;
use tuning_core::repl::catalog;
use tuning_core::repl::commands::{CommandError, CommandExecutor, CommandOutcome};
use tuning_core::repl::grammar::FaultCommand;
use tuning_core::repl::status::{StatusFormatter, StatusReport, write_stats_line};

use crate::sim::{SimProfile, SimulatedBridge};

type SimEngine = CalibrationEngine<BlobChannel<SimulatedBridge>>;

/// Everything needed to start a session.
#[derive(Clone, Debug)]
pub struct SessionOptions {
    pub profile: SimProfile,
    pub config: CalibrationConfig,
    pub transcript: Option<PathBuf>,
}

impl SessionOptions {
    pub fn new(profile: SimProfile) -> Self {
        Self {
            profile,
            config: CalibrationConfig::new(),
            transcript: None,
        }
    }
}

pub struct Session {
    executor: CommandExecutor<SimEngine>,
    transcript: Option<TranscriptLogger>,
    started_at: HostInstant,
}

impl Session {
    pub fn new(options: SessionOptions) -> io::Result<Self> {
        let transcript = match &options.transcript {
            Some(path) => Some(TranscriptLogger::new(path, options.profile)?),
            None => None,
        };

        let bridge = SimulatedBridge::new(options.profile.model());
        let channel = BlobChannel::new(bridge, options.config.timeouts);
        let engine = CalibrationEngine::new(channel, options.config);
        log::info!("session started profile={}", options.profile.tag());

        Ok(Self {
            executor: CommandExecutor::new(engine),
            transcript,
            started_at: HostInstant::now(),
        })
    }

    pub fn handle_command(&mut self, line: &str) -> io::Result<Vec<String>> {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            return Ok(Vec::new());
        }

        let elapsed = self.started_at.elapsed();
        self.append(elapsed, TranscriptRole::Host, trimmed)?;

        let lines = match self.executor.execute(trimmed) {
            Ok(outcome) => render_outcome(&outcome),
            Err(error) => vec![render_error(&error)],
        };

        for output in &lines {
            self.append(elapsed, TranscriptRole::Emulator, output)?;
        }
        Ok(lines)
    }

    fn append(&mut self, elapsed: Duration, role: TranscriptRole, line: &str) -> io::Result<()> {
        match self.transcript.as_mut() {
            Some(logger) => logger.append_line(elapsed, role, line),
            None => Ok(()),
        }
    }
}

fn render_outcome(outcome: &CommandOutcome) -> Vec<String> {
    match outcome {
        CommandOutcome::Calibrated(result) => vec![format!("OK calibrated {result}")],
        CommandOutcome::Reset(mode) => vec![format!("OK reset {mode}")],
        CommandOutcome::CrcReported { mode, tx } => {
            vec![format!("OK crc {mode} tx={tx} and neighbours excluded")]
        }
        CommandOutcome::Stats {
            mode,
            unlock_counts,
        } => {
            let mut line = String::from("OK ");
            // Writing into a String cannot fail.
            let _ = write_stats_line(&mut line, *mode, unlock_counts);
            vec![line]
        }
        CommandOutcome::FaultScripted(FaultCommand::Reselect(pair)) => {
            vec![format!("OK fault armed reselect at {pair}")]
        }
        CommandOutcome::FaultScripted(FaultCommand::NoLock) => {
            vec!["OK fault armed nolock on next probe".to_string()]
        }
        CommandOutcome::Status(report) => render_status(report),
        CommandOutcome::Help(Some(spec)) => vec![spec.usage.to_string()],
        CommandOutcome::Help(None) => {
            let mut lines = vec!["Available commands:".to_string()];
            lines.extend(catalog::commands().iter().map(|spec| format!("  {}", spec.usage)));
            lines.push("Type `help <command>` for a specific command.".to_string());
            lines
        }
    }
}

fn render_status(report: &StatusReport) -> Vec<String> {
    let formatter = StatusFormatter::new(report);
    let mut lines = Vec::with_capacity(BusMode::ALL.len() + 2);

    let mut line = String::new();
    let _ = formatter.write_engine_line(&mut line);
    lines.push(line);
    for mode in BusMode::ALL {
        let mut line = String::new();
        let _ = formatter.write_result_line(&mut line, mode);
        lines.push(line);
    }
    let mut line = String::new();
    let _ = formatter.write_event_line(&mut line);
    lines.push(line);
    lines
}

fn render_error(error: &CommandError<'_>) -> String {
    match error {
        CommandError::Parse(err) => format!("ERR syntax {err}"),
        CommandError::Calibration(err) => format!("ERR calibration {err}"),
        CommandError::UnknownTopic(topic) => {
            let mut message = format!("ERR no help for `{topic}`; topics:");
            for spec in catalog::commands() {
                let _ = write!(message, " {}", spec.name);
            }
            message
        }
        CommandError::Unsupported(what) => format!("ERR unsupported {what}"),
    }
}

struct TranscriptLogger {
    writer: BufWriter<fs::File>,
}

impl TranscriptLogger {
    fn new(path: &Path, profile: SimProfile) -> io::Result<Self> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(path)?;

        let mut logger = Self {
            writer: BufWriter::new(file),
        };
        writeln!(logger.writer, "# Phase tuning emulator, {} bus profile", profile.tag())?;
        writeln!(logger.writer, "# Timestamps are milliseconds since session start")?;
        writeln!(logger.writer)?;
        logger.writer.flush()?;
        Ok(logger)
    }

    fn append_line(
        &mut self,
        elapsed: Duration,
        role: TranscriptRole,
        line: &str,
    ) -> io::Result<()> {
        writeln!(
            self.writer,
            "[+{:>6} ms] {} {}",
            elapsed.as_millis(),
            role.prefix(),
            line
        )?;
        self.writer.flush()
    }
}

#[derive(Clone, Copy)]
enum TranscriptRole {
    Host,
    Emulator,
}

impl TranscriptRole {
    fn prefix(self) -> &'static str {
        match self {
            TranscriptRole::Host => "HOST>",
            TranscriptRole::Emulator => "EMU <",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session(profile: SimProfile) -> Session {
        Session::new(SessionOptions::new(profile)).expect("session")
    }

    #[test]
    fn calibrate_reports_the_result() {
        let mut session = session(SimProfile::Open);
        let lines = session.handle_command("calibrate").expect("io");
        assert_eq!(
            lines,
            vec!["OK calibrated sdr104 tx=2 rx=8 width=8 voltage=0 drive=0 attempts=1".to_string()]
        );
    }

    #[test]
    fn status_lists_both_modes() {
        let mut session = session(SimProfile::Open);
        session.handle_command("calibrate sdr50").expect("io");
        let lines = session.handle_command("status").expect("io");
        assert_eq!(lines.len(), 4);
        assert!(lines[0].starts_with("engine state=Done events="));
        assert!(lines[1].starts_with("sdr50 tx=4 rx=10"), "{lines:?}");
        assert_eq!(lines[2], "sdr104 uncalibrated");
        assert!(lines[3].starts_with("last-event #"));
    }

    #[test]
    fn lock_loss_shows_up_in_stats() {
        let mut session = session(SimProfile::LockLoss);
        session.handle_command("calibrate sdr50").expect("io");
        assert_eq!(
            session.handle_command("stats sdr50").expect("io"),
            vec!["OK sdr50 unlocks v0=1 v1=0 v2=0 v3=0".to_string()]
        );
    }

    #[test]
    fn errors_are_rendered() {
        let mut session = session(SimProfile::Open);
        let lines = session.handle_command("calibrate ddr52").expect("io");
        assert!(lines[0].starts_with("ERR syntax"));

        let lines = session.handle_command("help eject").expect("io");
        assert!(lines[0].starts_with("ERR no help for `eject`"));
        assert!(lines[0].ends_with("status help"));

        session.handle_command("fault reselect tx=3 rx=8").expect("io");
        let lines = session.handle_command("calibrate").expect("io");
        assert!(lines[0].starts_with("ERR calibration"));
    }

    #[test]
    fn crc_error_moves_the_next_calibration() {
        let mut session = session(SimProfile::Open);
        session.handle_command("calibrate").expect("io");
        assert_eq!(
            session.handle_command("crc").expect("io"),
            vec!["OK crc sdr104 tx=2 and neighbours excluded".to_string()]
        );
        let lines = session.handle_command("calibrate").expect("io");
        assert!(lines[0].starts_with("OK calibrated sdr104 tx=5 rx=8"), "{lines:?}");
    }

    #[test]
    fn blank_lines_are_ignored() {
        let mut session = session(SimProfile::Open);
        assert!(session.handle_command("   ").expect("io").is_empty());
    }

    #[test]
    fn help_lists_every_command() {
        let mut session = session(SimProfile::Open);
        let lines = session.handle_command("help").expect("io");
        assert_eq!(lines.len(), catalog::commands().len() + 2);
        assert_eq!(
            session.handle_command("help fault").expect("io"),
            vec!["fault reselect tx=<n> rx=<n> | fault nolock".to_string()]
        );
    }
}
