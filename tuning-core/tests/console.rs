use core::time::Duration;

use tuning_core::bridge::{BlobChannel, BridgeError, StorageBridge};
use tuning_core::channel::ProbeError;
use tuning_core::codec::{ConfigBlob, PhaseCodec};
use tuning_core::config::CalibrationConfig;
use tuning_core::engine::{CalibrationEngine, CalibrationError, EngineState};
use tuning_core::phase::{BusMode, PhaseIndex, PhasePair};
use tuning_core::repl::commands::{BusHooks, CommandError, CommandExecutor, CommandOutcome};
use tuning_core::repl::grammar::FaultCommand;

type Engine = CalibrationEngine<BlobChannel<EyeBridge>>;

#[test]
fn calibrate_through_the_configuration_image() {
    let mut executor = build_executor();

    let outcome = executor.execute("calibrate sdr104").expect("calibrate");
    let result = match outcome {
        CommandOutcome::Calibrated(result) => result,
        other => panic!("unexpected outcome: {other:?}"),
    };
    assert_eq!(result.pair(), pair(2, 8));
    assert_eq!(result.window_width, 8);

    let engine = executor.target();
    assert_eq!(engine.bus().bridge().mode, BusMode::Sdr104);
    let stored =
        PhaseCodec::decode(&engine.bus().bridge().stored, BusMode::Sdr104).expect("decode");
    assert_eq!((stored.tx, stored.rx), (result.tx, result.rx));
}

#[test]
fn crc_report_moves_the_transmit_tap() {
    let mut executor = build_executor();
    executor.execute("calibrate").expect("calibrate");

    assert_eq!(
        executor.execute("crc"),
        Ok(CommandOutcome::CrcReported {
            mode: BusMode::Sdr104,
            tx: PhaseIndex::new(2).expect("tap"),
        })
    );
    match executor.execute("calibrate") {
        Ok(CommandOutcome::Calibrated(result)) => assert_eq!(result.pair(), pair(5, 8)),
        other => panic!("unexpected outcome: {other:?}"),
    }
    assert!(
        !executor
            .target()
            .mode_state(BusMode::Sdr104)
            .tx_allowed()
            .contains(PhaseIndex::new(3).expect("tap"))
    );
}

#[test]
fn scripted_reselect_fault_fails_then_resumes() {
    let mut executor = build_executor();

    assert_eq!(
        executor.execute("fault reselect tx=3 rx=8"),
        Ok(CommandOutcome::FaultScripted(FaultCommand::Reselect(pair(3, 8))))
    );
    assert_eq!(
        executor.execute("calibrate"),
        Err(CommandError::Calibration(CalibrationError::ReselectTimeout {
            pair: pair(3, 8)
        }))
    );

    match executor.execute("status") {
        Ok(CommandOutcome::Status(report)) => {
            assert_eq!(report.state, EngineState::Failed);
            assert!(report.result(BusMode::Sdr104).is_none());
        }
        other => panic!("unexpected outcome: {other:?}"),
    }

    let stored = PhaseCodec::decode(&executor.target().bus().bridge().stored, BusMode::Sdr104)
        .expect("decode");
    assert_eq!((stored.tx.get(), stored.rx.get()), (0, 7), "default pair restored");

    match executor.execute("calibrate") {
        Ok(CommandOutcome::Calibrated(result)) => assert_eq!(result.pair(), pair(2, 8)),
        other => panic!("unexpected outcome: {other:?}"),
    }
}

#[test]
fn scripted_lock_loss_is_learned() {
    let mut executor = build_executor();

    executor.execute("fault nolock").expect("script fault");
    match executor.execute("calibrate sdr50") {
        Ok(CommandOutcome::Calibrated(result)) => {
            assert_eq!(result.voltage.get(), 1);
            assert_eq!(result.attempts, 2);
        }
        other => panic!("unexpected outcome: {other:?}"),
    }

    assert_eq!(
        executor.execute("stats sdr50"),
        Ok(CommandOutcome::Stats {
            mode: BusMode::Sdr50,
            unlock_counts: [1, 0, 0, 0],
        })
    );

    executor.execute("reset sdr50").expect("reset");
    assert_eq!(
        executor.execute("stats sdr50"),
        Ok(CommandOutcome::Stats {
            mode: BusMode::Sdr50,
            unlock_counts: [1, 0, 0, 0],
        }),
        "reset keeps learned voltage counters"
    );
    assert!(
        executor
            .target()
            .mode_state(BusMode::Sdr50)
            .last_result()
            .is_none()
    );
}

fn pair(tx: u8, rx: u8) -> PhasePair {
    PhasePair::new(
        PhaseIndex::new(tx).expect("tx tap"),
        PhaseIndex::new(rx).expect("rx tap"),
    )
}

fn build_executor() -> CommandExecutor<Engine> {
    let config = CalibrationConfig::default();
    let channel = BlobChannel::new(EyeBridge::default(), config.timeouts);
    CommandExecutor::new(CalibrationEngine::new(channel, config))
}

/// Bridge with a fully open eye that keeps its image like the real part.
struct EyeBridge {
    stored: ConfigBlob,
    mode: BusMode,
    fail_reselect_after: Option<PhasePair>,
    reselect_pending: bool,
    no_lock_pending: bool,
}

impl Default for EyeBridge {
    fn default() -> Self {
        Self {
            stored: ConfigBlob::new(),
            mode: BusMode::Sdr50,
            fail_reselect_after: None,
            reselect_pending: false,
            no_lock_pending: false,
        }
    }
}

impl StorageBridge for EyeBridge {
    fn select(&mut self, selected: bool, _timeout: Duration) -> Result<(), BridgeError> {
        if selected && core::mem::take(&mut self.reselect_pending) {
            return Err(BridgeError::SelectTimeout);
        }
        Ok(())
    }

    fn write_block(&mut self, blob: &ConfigBlob, _timeout: Duration) -> Result<(), BridgeError> {
        self.stored = blob.clone();
        let fields = PhaseCodec::decode(blob, self.mode).expect("decodable image");
        if self.fail_reselect_after == Some(PhasePair::new(fields.tx, fields.rx)) {
            self.fail_reselect_after = None;
            self.reselect_pending = true;
        }
        Ok(())
    }

    fn read_block(&mut self, blob: &mut ConfigBlob, _timeout: Duration) -> Result<(), BridgeError> {
        PhaseCodec::encode_status(&mut self.stored, u64::MAX, u64::MAX);
        *blob = self.stored.clone();
        Ok(())
    }

    fn send_tuning(&mut self, _opcode: u8, _timeout: Duration) -> Result<(), ProbeError> {
        if core::mem::take(&mut self.no_lock_pending) {
            return Err(ProbeError::NoLock);
        }
        Ok(())
    }
}

impl BusHooks for EyeBridge {
    fn script_fault(&mut self, fault: FaultCommand) -> bool {
        match fault {
            FaultCommand::Reselect(pair) => self.fail_reselect_after = Some(pair),
            FaultCommand::NoLock => self.no_lock_pending = true,
        }
        true
    }

    fn prepare(&mut self, mode: BusMode) {
        self.mode = mode;
    }
}
