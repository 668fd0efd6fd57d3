//! Shared status surface for the console.
//!
//! [`StatusReport`] is a copy of everything the `status` and `stats` commands
//! print, so front-ends never hold a borrow of the engine while writing.
//! [`StatusFormatter`] keeps the textual rendering identical across them.

use core::fmt;

use crate::engine::{CalibrationResult, EngineState};
use crate::ladder::VOLTAGE_DOMAINS;
use crate::phase::BusMode;
use crate::telemetry::{TelemetryPayload, TelemetryRecord};

/// Snapshot surfaced by the `status` command.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct StatusReport {
    pub state: EngineState,
    /// Last verified result per bus mode, indexed by [`BusMode::index`].
    pub results: [Option<CalibrationResult>; BusMode::ALL.len()],
    pub latest_event: Option<TelemetryRecord>,
    pub recorded_events: usize,
}

impl StatusReport {
    /// Report for an engine that has not run yet.
    #[must_use]
    pub const fn idle() -> Self {
        Self {
            state: EngineState::Init,
            results: [None; BusMode::ALL.len()],
            latest_event: None,
            recorded_events: 0,
        }
    }

    #[must_use]
    pub fn result(&self, mode: BusMode) -> Option<CalibrationResult> {
        self.results[mode.index()]
    }
}

impl Default for StatusReport {
    fn default() -> Self {
        Self::idle()
    }
}

/// Renders a [`StatusReport`] into human-readable lines.
#[derive(Clone, Copy, Debug)]
pub struct StatusFormatter<'a> {
    report: &'a StatusReport,
}

impl<'a> StatusFormatter<'a> {
    #[must_use]
    pub const fn new(report: &'a StatusReport) -> Self {
        Self { report }
    }

    /// Writes the engine line (e.g. `engine state=Done events=14`).
    ///
    /// # Errors
    ///
    /// Propagates writer failures.
    pub fn write_engine_line<W: fmt::Write>(&self, writer: &mut W) -> fmt::Result {
        write!(
            writer,
            "engine state={:?} events={}",
            self.report.state, self.report.recorded_events
        )
    }

    /// Writes one result line (e.g. `sdr104 tx=2 rx=8 width=8 ...` or
    /// `sdr50 uncalibrated`).
    ///
    /// # Errors
    ///
    /// Propagates writer failures.
    pub fn write_result_line<W: fmt::Write>(&self, writer: &mut W, mode: BusMode) -> fmt::Result {
        match self.report.result(mode) {
            Some(result) => write!(writer, "{result}"),
            None => write!(writer, "{mode} uncalibrated"),
        }
    }

    /// Writes the most recent telemetry record (e.g. `last-event #3 tx-resolved sdr104 tx=0 rx=7`).
    ///
    /// # Errors
    ///
    /// Propagates writer failures.
    pub fn write_event_line<W: fmt::Write>(&self, writer: &mut W) -> fmt::Result {
        writer.write_str("last-event")?;
        match self.report.latest_event {
            Some(record) => {
                write!(writer, " #{} {}", record.id, record.event)?;
                write_payload(writer, &record.details)
            }
            None => writer.write_str(" none"),
        }
    }
}

fn write_payload<W: fmt::Write>(writer: &mut W, payload: &TelemetryPayload) -> fmt::Result {
    match payload {
        TelemetryPayload::None => Ok(()),
        TelemetryPayload::Attempt(attempt) => write!(writer, " attempt={attempt}"),
        TelemetryPayload::Escalation(step) => write!(writer, " {}->{}", step.from, step.to),
        TelemetryPayload::Phase(phase) => {
            write!(writer, " tx={} rx={}", phase.tx, phase.rx)?;
            match phase.width {
                Some(width) => write!(writer, " width={width}"),
                None => Ok(()),
            }
        }
        TelemetryPayload::Completion(done) => write!(
            writer,
            " {:?} attempts={} probes={}",
            done.outcome, done.attempts, done.probes
        ),
    }
}

/// Writes the learned unlock counters (e.g. `sdr104 unlocks v0=1 v1=0 v2=0 v3=0`).
///
/// # Errors
///
/// Propagates writer failures.
pub fn write_stats_line<W: fmt::Write>(
    writer: &mut W,
    mode: BusMode,
    unlock_counts: &[u32; VOLTAGE_DOMAINS],
) -> fmt::Result {
    write!(writer, "{mode} unlocks")?;
    for (domain, count) in unlock_counts.iter().enumerate() {
        write!(writer, " v{domain}={count}")?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ladder::{DriverStrength, VoltageDomain};
    use crate::phase::PhaseIndex;
    use crate::telemetry::{EscalationTelemetry, TelemetryEventKind};
    use heapless::String;

    fn render<F>(write: F) -> String<96>
    where
        F: FnOnce(&mut String<96>) -> fmt::Result,
    {
        let mut line = String::new();
        write(&mut line).expect("line fits");
        line
    }

    #[test]
    fn idle_report_renders_placeholders() {
        let report = StatusReport::idle();
        let formatter = StatusFormatter::new(&report);

        assert_eq!(
            render(|w| formatter.write_engine_line(w)).as_str(),
            "engine state=Init events=0"
        );
        assert_eq!(
            render(|w| formatter.write_result_line(w, BusMode::Sdr50)).as_str(),
            "sdr50 uncalibrated"
        );
        assert_eq!(
            render(|w| formatter.write_event_line(w)).as_str(),
            "last-event none"
        );
    }

    #[test]
    fn populated_report_renders_result_and_event() {
        let mut report = StatusReport::idle();
        report.state = EngineState::Done;
        report.recorded_events = 5;
        report.results[BusMode::Sdr104.index()] = Some(CalibrationResult {
            mode: BusMode::Sdr104,
            tx: PhaseIndex::new(2).expect("tap"),
            rx: PhaseIndex::new(8).expect("tap"),
            window_width: 8,
            voltage: VoltageDomain::new(0).expect("domain"),
            driver_strength: DriverStrength::new(1).expect("step"),
            attempts: 2,
        });
        report.latest_event = Some(TelemetryRecord {
            id: 4,
            event: TelemetryEventKind::DriverStrengthEscalated(BusMode::Sdr104),
            details: TelemetryPayload::Escalation(EscalationTelemetry::new(0, 1)),
        });

        let formatter = StatusFormatter::new(&report);
        assert_eq!(
            render(|w| formatter.write_result_line(w, BusMode::Sdr104)).as_str(),
            "sdr104 tx=2 rx=8 width=8 voltage=0 drive=1 attempts=2"
        );
        assert_eq!(
            render(|w| formatter.write_event_line(w)).as_str(),
            "last-event #4 driver-strength-escalated sdr104 0->1"
        );
    }

    #[test]
    fn stats_line_lists_every_domain() {
        let line = render(|w| write_stats_line(w, BusMode::Sdr50, &[1, 0, 2, 0]));
        assert_eq!(line.as_str(), "sdr50 unlocks v0=1 v1=0 v2=2 v3=0");
    }
}
