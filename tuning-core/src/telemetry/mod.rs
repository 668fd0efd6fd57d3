//! Calibration telemetry catalog and event ring.
//!
//! Event kinds serialize to compact numeric codes so a host can pull the ring
//! over a diagnostics channel. Records carry a monotonically increasing
//! sequence id instead of a timestamp; the engine has no clock of its own.

use core::fmt;

use heapless::{HistoryBuf, OldestOrdered};

use crate::phase::{BusMode, PhasePair};

/// Identifier assigned to every recorded event.
pub type EventId = u32;

/// Total number of telemetry entries retained in memory.
pub const TELEMETRY_RING_CAPACITY: usize = 64;

/// Discriminated calibration events.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum TelemetryEventKind {
    AttemptStarted(BusMode),
    VoltageEscalated(BusMode),
    DriverStrengthEscalated(BusMode),
    TxResolved(BusMode),
    ReselectTimeout(BusMode),
    FallbackApplied(BusMode),
    CalibrationComplete(BusMode),
    Custom(u16),
}

impl fmt::Display for TelemetryEventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TelemetryEventKind::AttemptStarted(mode) => write!(f, "attempt-started {mode}"),
            TelemetryEventKind::VoltageEscalated(mode) => write!(f, "voltage-escalated {mode}"),
            TelemetryEventKind::DriverStrengthEscalated(mode) => {
                write!(f, "driver-strength-escalated {mode}")
            }
            TelemetryEventKind::TxResolved(mode) => write!(f, "tx-resolved {mode}"),
            TelemetryEventKind::ReselectTimeout(mode) => write!(f, "reselect-timeout {mode}"),
            TelemetryEventKind::FallbackApplied(mode) => write!(f, "fallback-applied {mode}"),
            TelemetryEventKind::CalibrationComplete(mode) => {
                write!(f, "calibration-complete {mode}")
            }
            TelemetryEventKind::Custom(code) => write!(f, "custom({code})"),
        }
    }
}

impl TelemetryEventKind {
    const ATTEMPT_STARTED_BASE: u16 = 0x0000;
    const VOLTAGE_ESCALATED_BASE: u16 = 0x0002;
    const DRIVER_STRENGTH_BASE: u16 = 0x0004;
    const TX_RESOLVED_BASE: u16 = 0x0006;
    const RESELECT_TIMEOUT_BASE: u16 = 0x0008;
    const FALLBACK_APPLIED_BASE: u16 = 0x000A;
    const CALIBRATION_COMPLETE_BASE: u16 = 0x000C;
    const FIRST_CUSTOM_CODE: u16 = 0x000E;

    /// Encodes the event into a compact transport-friendly discriminant.
    #[must_use]
    pub const fn to_raw(self) -> u16 {
        match self {
            TelemetryEventKind::AttemptStarted(mode) => {
                Self::ATTEMPT_STARTED_BASE + mode_code(mode)
            }
            TelemetryEventKind::VoltageEscalated(mode) => {
                Self::VOLTAGE_ESCALATED_BASE + mode_code(mode)
            }
            TelemetryEventKind::DriverStrengthEscalated(mode) => {
                Self::DRIVER_STRENGTH_BASE + mode_code(mode)
            }
            TelemetryEventKind::TxResolved(mode) => Self::TX_RESOLVED_BASE + mode_code(mode),
            TelemetryEventKind::ReselectTimeout(mode) => {
                Self::RESELECT_TIMEOUT_BASE + mode_code(mode)
            }
            TelemetryEventKind::FallbackApplied(mode) => {
                Self::FALLBACK_APPLIED_BASE + mode_code(mode)
            }
            TelemetryEventKind::CalibrationComplete(mode) => {
                Self::CALIBRATION_COMPLETE_BASE + mode_code(mode)
            }
            TelemetryEventKind::Custom(code) => code,
        }
    }

    /// Decodes a raw discriminant, falling back to [`TelemetryEventKind::Custom`].
    #[must_use]
    pub fn from_raw(code: u16) -> Self {
        if code >= Self::FIRST_CUSTOM_CODE {
            return TelemetryEventKind::Custom(code);
        }

        let mode = if code % 2 == 0 {
            BusMode::Sdr50
        } else {
            BusMode::Sdr104
        };
        match code - code % 2 {
            Self::ATTEMPT_STARTED_BASE => TelemetryEventKind::AttemptStarted(mode),
            Self::VOLTAGE_ESCALATED_BASE => TelemetryEventKind::VoltageEscalated(mode),
            Self::DRIVER_STRENGTH_BASE => TelemetryEventKind::DriverStrengthEscalated(mode),
            Self::TX_RESOLVED_BASE => TelemetryEventKind::TxResolved(mode),
            Self::RESELECT_TIMEOUT_BASE => TelemetryEventKind::ReselectTimeout(mode),
            Self::FALLBACK_APPLIED_BASE => TelemetryEventKind::FallbackApplied(mode),
            Self::CALIBRATION_COMPLETE_BASE => TelemetryEventKind::CalibrationComplete(mode),
            _ => TelemetryEventKind::Custom(code),
        }
    }

    /// Bus mode the event refers to, if any.
    #[must_use]
    pub const fn mode(self) -> Option<BusMode> {
        match self {
            TelemetryEventKind::AttemptStarted(mode)
            | TelemetryEventKind::VoltageEscalated(mode)
            | TelemetryEventKind::DriverStrengthEscalated(mode)
            | TelemetryEventKind::TxResolved(mode)
            | TelemetryEventKind::ReselectTimeout(mode)
            | TelemetryEventKind::FallbackApplied(mode)
            | TelemetryEventKind::CalibrationComplete(mode) => Some(mode),
            TelemetryEventKind::Custom(_) => None,
        }
    }
}

/// Payloads carried alongside telemetry events.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum TelemetryPayload {
    /// No additional metadata accompanies the event.
    None,
    /// Attempt number within the current `calibrate` call.
    Attempt(u8),
    /// A ladder step from one raw setting to another.
    Escalation(EscalationTelemetry),
    /// A phase pair, with the window width when one was measured.
    Phase(PhaseTelemetry),
    /// Summary of a finished `calibrate` call.
    Completion(CompletionTelemetry),
}

impl TelemetryPayload {
    /// Convenience constructor when no payload data is needed.
    #[must_use]
    pub const fn none() -> Self {
        TelemetryPayload::None
    }
}

/// Voltage or driver-strength step.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct EscalationTelemetry {
    pub from: u8,
    pub to: u8,
}

impl EscalationTelemetry {
    #[must_use]
    pub const fn new(from: u8, to: u8) -> Self {
        Self { from, to }
    }
}

/// Phase pair payload.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct PhaseTelemetry {
    pub tx: u8,
    pub rx: u8,
    pub width: Option<u8>,
}

impl PhaseTelemetry {
    #[must_use]
    pub const fn new(pair: PhasePair, width: Option<u8>) -> Self {
        Self {
            tx: pair.tx.get(),
            rx: pair.rx.get(),
            width,
        }
    }
}

/// How a `calibrate` call ended.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum CompletionOutcome {
    Converged,
    Failed,
}

/// Completion summary payload.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct CompletionTelemetry {
    pub outcome: CompletionOutcome,
    pub attempts: u8,
    pub probes: u16,
}

impl CompletionTelemetry {
    #[must_use]
    pub fn new(outcome: CompletionOutcome, attempts: usize, probes: usize) -> Self {
        Self {
            outcome,
            attempts: truncate_u8(attempts),
            probes: truncate_u16(probes),
        }
    }
}

/// Telemetry record stored in the ring buffer.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct TelemetryRecord {
    pub id: EventId,
    pub event: TelemetryEventKind,
    pub details: TelemetryPayload,
}

/// Telemetry ring buffer type alias.
pub type TelemetryRing<const CAPACITY: usize = TELEMETRY_RING_CAPACITY> =
    HistoryBuf<TelemetryRecord, CAPACITY>;

/// Records telemetry events into a fixed-size ring buffer.
pub struct TelemetryRecorder<const CAPACITY: usize = TELEMETRY_RING_CAPACITY> {
    ring: TelemetryRing<CAPACITY>,
    next_event_id: EventId,
}

impl<const CAPACITY: usize> TelemetryRecorder<CAPACITY> {
    /// Creates a new telemetry recorder with an empty history.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            ring: HistoryBuf::new(),
            next_event_id: 0,
        }
    }

    /// Returns an iterator over the recorded telemetry in chronological order.
    #[must_use]
    pub fn oldest_first(&self) -> OldestOrdered<'_, TelemetryRecord> {
        self.ring.oldest_ordered()
    }

    /// Returns the most recent telemetry record, if available.
    #[must_use]
    pub fn latest(&self) -> Option<&TelemetryRecord> {
        self.ring.recent()
    }

    /// Returns the number of records currently stored.
    #[must_use]
    pub fn len(&self) -> usize {
        self.ring.len()
    }

    /// Returns `true` when no telemetry records are stored.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.ring.is_empty()
    }

    /// Records an arbitrary telemetry event with the supplied payload.
    pub fn record(&mut self, event: TelemetryEventKind, payload: TelemetryPayload) -> EventId {
        let id = self.next_event_id;
        self.next_event_id = self.next_event_id.wrapping_add(1);

        self.ring.write(TelemetryRecord {
            id,
            event,
            details: payload,
        });

        id
    }

    pub fn record_attempt(&mut self, mode: BusMode, attempt: u8) -> EventId {
        self.record(
            TelemetryEventKind::AttemptStarted(mode),
            TelemetryPayload::Attempt(attempt),
        )
    }

    /// Records a DLL voltage switch after a lock failure.
    pub fn record_voltage_step(&mut self, mode: BusMode, from: u8, to: u8) -> EventId {
        self.record(
            TelemetryEventKind::VoltageEscalated(mode),
            TelemetryPayload::Escalation(EscalationTelemetry::new(from, to)),
        )
    }

    /// Records a driver-strength increase after a narrow window.
    pub fn record_drive_step(&mut self, mode: BusMode, from: u8, to: u8) -> EventId {
        self.record(
            TelemetryEventKind::DriverStrengthEscalated(mode),
            TelemetryPayload::Escalation(EscalationTelemetry::new(from, to)),
        )
    }

    pub fn record_phase(
        &mut self,
        event: TelemetryEventKind,
        pair: PhasePair,
        width: Option<u8>,
    ) -> EventId {
        self.record(event, TelemetryPayload::Phase(PhaseTelemetry::new(pair, width)))
    }

    /// Records the end of a `calibrate` call.
    pub fn record_completion(
        &mut self,
        mode: BusMode,
        outcome: CompletionOutcome,
        attempts: usize,
        probes: usize,
    ) -> EventId {
        self.record(
            TelemetryEventKind::CalibrationComplete(mode),
            TelemetryPayload::Completion(CompletionTelemetry::new(outcome, attempts, probes)),
        )
    }
}

impl<const CAPACITY: usize> Default for TelemetryRecorder<CAPACITY> {
    fn default() -> Self {
        Self::new()
    }
}

const fn mode_code(mode: BusMode) -> u16 {
    match mode {
        BusMode::Sdr50 => 0,
        BusMode::Sdr104 => 1,
    }
}

fn truncate_u8(count: usize) -> u8 {
    match u8::try_from(count) {
        Ok(value) => value,
        Err(_) => u8::MAX,
    }
}

fn truncate_u16(count: usize) -> u16 {
    match u16::try_from(count) {
        Ok(value) => value,
        Err(_) => u16::MAX,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::phase::PhaseIndex;

    #[test]
    fn event_codes_round_trip() {
        for mode in BusMode::ALL {
            let events = [
                TelemetryEventKind::AttemptStarted(mode),
                TelemetryEventKind::VoltageEscalated(mode),
                TelemetryEventKind::DriverStrengthEscalated(mode),
                TelemetryEventKind::TxResolved(mode),
                TelemetryEventKind::ReselectTimeout(mode),
                TelemetryEventKind::FallbackApplied(mode),
                TelemetryEventKind::CalibrationComplete(mode),
            ];
            for event in events {
                assert_eq!(TelemetryEventKind::from_raw(event.to_raw()), event);
                assert_eq!(event.mode(), Some(mode));
            }
        }

        let custom = TelemetryEventKind::from_raw(0x0100);
        assert_eq!(custom, TelemetryEventKind::Custom(0x0100));
        assert_eq!(custom.to_raw(), 0x0100);
        assert_eq!(custom.mode(), None);
    }

    #[test]
    fn records_are_numbered_in_order() {
        let mut recorder = TelemetryRecorder::<4>::new();
        assert!(recorder.is_empty());

        let first = recorder.record_attempt(BusMode::Sdr104, 1);
        let second = recorder.record_voltage_step(BusMode::Sdr104, 0, 2);
        assert_eq!((first, second), (0, 1));

        let latest = recorder.latest().copied().expect("record");
        assert_eq!(latest.event, TelemetryEventKind::VoltageEscalated(BusMode::Sdr104));
        assert_eq!(
            latest.details,
            TelemetryPayload::Escalation(EscalationTelemetry::new(0, 2))
        );
    }

    #[test]
    fn ring_drops_oldest_records() {
        let mut recorder = TelemetryRecorder::<3>::new();
        for attempt in 1..=5 {
            recorder.record_attempt(BusMode::Sdr50, attempt);
        }

        assert_eq!(recorder.len(), 3);
        let ids: [EventId; 3] = {
            let mut ids = [0; 3];
            for (slot, record) in ids.iter_mut().zip(recorder.oldest_first()) {
                *slot = record.id;
            }
            ids
        };
        assert_eq!(ids, [2, 3, 4]);
    }

    #[test]
    fn completion_counts_saturate() {
        let mut recorder = TelemetryRecorder::<2>::new();
        recorder.record_completion(BusMode::Sdr50, CompletionOutcome::Failed, 300, 70_000);
        match recorder.latest().map(|record| record.details) {
            Some(TelemetryPayload::Completion(summary)) => {
                assert_eq!(summary.outcome, CompletionOutcome::Failed);
                assert_eq!(summary.attempts, u8::MAX);
                assert_eq!(summary.probes, u16::MAX);
            }
            other => panic!("expected completion payload, got {other:?}"),
        }
    }

    #[test]
    fn phase_payload_captures_pair() {
        let mut recorder = TelemetryRecorder::<2>::new();
        let pair = PhasePair::new(
            PhaseIndex::new(2).expect("tap"),
            PhaseIndex::new(8).expect("tap"),
        );
        recorder.record_phase(TelemetryEventKind::TxResolved(BusMode::Sdr104), pair, Some(8));

        let record = recorder.latest().copied().expect("record");
        assert_eq!(
            record.details,
            TelemetryPayload::Phase(PhaseTelemetry {
                tx: 2,
                rx: 8,
                width: Some(8)
            })
        );
    }
}
