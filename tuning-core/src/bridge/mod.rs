//! Block-level bridge adapter.
//!
//! The bridge only exposes its configuration as a 512-byte image that can be
//! read or written while the card is deselected. [`BlobChannel`] wraps any
//! [`StorageBridge`] so the engine can talk to it through
//! [`RegisterChannel`] and [`TuningProbe`]. Every register access is a
//! deselect, block transfer, reselect round-trip.

use core::{fmt, time::Duration};

use crate::channel::{
    ChannelError, ExtraFields, ProbeError, RegisterChannel, StatusSnapshot, TuningProbe,
};
use crate::codec::{ConfigBlob, PhaseCodec, PhaseFields};
use crate::phase::PhaseIndex;

/// Default timeout for one configuration round-trip leg.
pub const DEFAULT_REGISTER_TIMEOUT: Duration = Duration::from_millis(50);

/// Default timeout for the tuning command.
pub const DEFAULT_TUNING_TIMEOUT: Duration = Duration::from_millis(150);

/// Failures reported by the block-level transport.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum BridgeError {
    /// The card did not answer the select or deselect command.
    SelectTimeout,
    /// The block transfer did not finish in time.
    TransferTimeout,
}

impl fmt::Display for BridgeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{self:?}")
    }
}

/// Raw transport supplied by the host driver or a simulator.
pub trait StorageBridge {
    /// Selects or deselects the card.
    ///
    /// # Errors
    ///
    /// Returns [`BridgeError::SelectTimeout`] when the card does not respond.
    fn select(&mut self, selected: bool, timeout: Duration) -> Result<(), BridgeError>;

    /// Writes the configuration image.
    ///
    /// # Errors
    ///
    /// Returns the transfer failure.
    fn write_block(&mut self, blob: &ConfigBlob, timeout: Duration) -> Result<(), BridgeError>;

    /// Reads the configuration image, including the latest status vectors.
    ///
    /// # Errors
    ///
    /// Returns the transfer failure.
    fn read_block(&mut self, blob: &mut ConfigBlob, timeout: Duration) -> Result<(), BridgeError>;

    /// Issues one tuning command with the programmed settings.
    ///
    /// # Errors
    ///
    /// Returns the probe outcome when tuning did not succeed.
    fn send_tuning(&mut self, opcode: u8, timeout: Duration) -> Result<(), ProbeError>;
}

impl<T: StorageBridge + ?Sized> StorageBridge for &mut T {
    fn select(&mut self, selected: bool, timeout: Duration) -> Result<(), BridgeError> {
        (**self).select(selected, timeout)
    }

    fn write_block(&mut self, blob: &ConfigBlob, timeout: Duration) -> Result<(), BridgeError> {
        (**self).write_block(blob, timeout)
    }

    fn read_block(&mut self, blob: &mut ConfigBlob, timeout: Duration) -> Result<(), BridgeError> {
        (**self).read_block(blob, timeout)
    }

    fn send_tuning(&mut self, opcode: u8, timeout: Duration) -> Result<(), ProbeError> {
        (**self).send_tuning(opcode, timeout)
    }
}

/// Per-operation timeouts.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct ProbeTimeouts {
    pub register: Duration,
    pub tuning: Duration,
}

impl ProbeTimeouts {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            register: DEFAULT_REGISTER_TIMEOUT,
            tuning: DEFAULT_TUNING_TIMEOUT,
        }
    }
}

impl Default for ProbeTimeouts {
    fn default() -> Self {
        Self::new()
    }
}

/// Which leg of the round-trip was running.
#[derive(Copy, Clone)]
enum Leg {
    Write,
    Read,
}

/// Exposes a [`StorageBridge`] through the engine's channel traits.
pub struct BlobChannel<B> {
    bridge: B,
    timeouts: ProbeTimeouts,
    shadow: ConfigBlob,
    last_written: Option<PhaseFields>,
}

impl<B: StorageBridge> BlobChannel<B> {
    /// Wraps `bridge` with the given timeouts.
    #[must_use]
    pub fn new(bridge: B, timeouts: ProbeTimeouts) -> Self {
        Self {
            bridge,
            timeouts,
            shadow: ConfigBlob::new(),
            last_written: None,
        }
    }

    /// Settings written by the most recent successful `write_phase`.
    #[must_use]
    pub fn last_written(&self) -> Option<PhaseFields> {
        self.last_written
    }

    #[must_use]
    pub fn bridge(&self) -> &B {
        &self.bridge
    }

    pub fn bridge_mut(&mut self) -> &mut B {
        &mut self.bridge
    }

    /// Releases the wrapped transport.
    #[must_use]
    pub fn into_inner(self) -> B {
        self.bridge
    }

    fn round_trip(&mut self, leg: Leg) -> Result<(), ChannelError> {
        let timeout = self.timeouts.register;
        self.bridge
            .select(false, timeout)
            .map_err(|_| ChannelError::ReselectTimeout)?;

        let transfer = match leg {
            Leg::Write => self
                .bridge
                .write_block(&self.shadow, timeout)
                .map_err(|_| ChannelError::WriteTimeout),
            Leg::Read => self
                .bridge
                .read_block(&mut self.shadow, timeout)
                .map_err(|_| ChannelError::ReadTimeout),
        };

        // The card must come back even when the transfer failed.
        let reselect = self
            .bridge
            .select(true, timeout)
            .map_err(|_| ChannelError::ReselectTimeout);

        reselect.and(transfer)
    }
}

impl<B: StorageBridge> RegisterChannel for BlobChannel<B> {
    fn write_phase(
        &mut self,
        tx: PhaseIndex,
        rx: PhaseIndex,
        extra: &ExtraFields,
    ) -> Result<(), ChannelError> {
        let fields = PhaseFields {
            tx,
            rx,
            extra: *extra,
        };
        PhaseCodec::encode(&mut self.shadow, &fields);
        trace!(
            "bridge write tx={} rx={} sweep={} inject={}",
            tx.get(),
            rx.get(),
            extra.sweep_count,
            extra.inject.bits()
        );

        self.round_trip(Leg::Write)?;
        self.last_written = Some(fields);
        Ok(())
    }

    fn read_status(&mut self) -> Result<StatusSnapshot, ChannelError> {
        self.round_trip(Leg::Read)?;
        Ok(PhaseCodec::decode_status(&self.shadow))
    }
}

impl<B: StorageBridge> TuningProbe for BlobChannel<B> {
    fn run_probe(&mut self, opcode: u8) -> Result<(), ProbeError> {
        self.bridge.send_tuning(opcode, self.timeouts.tuning)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ladder::{DriverStrength, VoltageDomain};
    use crate::phase::{BusMode, PassBitmap};

    #[derive(Default)]
    struct ScriptedBridge {
        stored: ConfigBlob,
        selected: bool,
        fail_deselect: bool,
        fail_reselect: bool,
        fail_write: bool,
        fail_read: bool,
        reselects: usize,
        last_timeout: Option<Duration>,
    }

    impl StorageBridge for ScriptedBridge {
        fn select(&mut self, selected: bool, timeout: Duration) -> Result<(), BridgeError> {
            self.last_timeout = Some(timeout);
            if (selected && self.fail_reselect) || (!selected && self.fail_deselect) {
                return Err(BridgeError::SelectTimeout);
            }
            if selected {
                self.reselects += 1;
            }
            self.selected = selected;
            Ok(())
        }

        fn write_block(
            &mut self,
            blob: &ConfigBlob,
            _timeout: Duration,
        ) -> Result<(), BridgeError> {
            assert!(!self.selected, "block written while selected");
            if self.fail_write {
                return Err(BridgeError::TransferTimeout);
            }
            self.stored = blob.clone();
            Ok(())
        }

        fn read_block(
            &mut self,
            blob: &mut ConfigBlob,
            _timeout: Duration,
        ) -> Result<(), BridgeError> {
            if self.fail_read {
                return Err(BridgeError::TransferTimeout);
            }
            *blob = self.stored.clone();
            Ok(())
        }

        fn send_tuning(&mut self, opcode: u8, timeout: Duration) -> Result<(), ProbeError> {
            self.last_timeout = Some(timeout);
            if opcode == 19 { Ok(()) } else { Err(ProbeError::Unstable) }
        }
    }

    fn phase(value: u8) -> PhaseIndex {
        PhaseIndex::new(value).expect("tap")
    }

    fn extra() -> ExtraFields {
        ExtraFields {
            mode: BusMode::Sdr104,
            sweep_count: 5,
            inject: PassBitmap::from_bits(0x7F1),
            inject_enable: true,
            voltage: VoltageDomain::new(2).expect("domain"),
            driver_strength: DriverStrength::new(3).expect("step"),
        }
    }

    #[test]
    fn write_lands_in_the_stored_image() {
        let mut channel = BlobChannel::new(ScriptedBridge::default(), ProbeTimeouts::new());
        channel
            .write_phase(phase(3), phase(9), &extra())
            .expect("write");

        let stored = PhaseCodec::decode(&channel.bridge().stored, BusMode::Sdr104).expect("decode");
        assert_eq!(stored.tx, phase(3));
        assert_eq!(stored.rx, phase(9));
        assert_eq!(stored.extra, extra());
        assert!(channel.bridge().selected);
        assert_eq!(channel.bridge().last_timeout, Some(DEFAULT_REGISTER_TIMEOUT));
        assert_eq!(channel.last_written().map(|fields| fields.tx), Some(phase(3)));
    }

    #[test]
    fn status_is_decoded_from_the_read_image() {
        let mut bridge = ScriptedBridge::default();
        PhaseCodec::encode_status(&mut bridge.stored, u64::MAX & !(1 << 4), u64::MAX);
        let mut channel = BlobChannel::new(bridge, ProbeTimeouts::new());

        let status = channel.read_status().expect("status");
        assert!(!status.tx.contains(phase(4)));
        assert_eq!(status.tx.fail_count(), 1);
    }

    #[test]
    fn errors_map_to_channel_failures() {
        let mut channel = BlobChannel::new(
            ScriptedBridge {
                fail_write: true,
                ..ScriptedBridge::default()
            },
            ProbeTimeouts::new(),
        );
        assert_eq!(
            channel.write_phase(phase(0), phase(0), &extra()),
            Err(ChannelError::WriteTimeout)
        );
        assert_eq!(channel.bridge().reselects, 1, "card reselected after failed write");
        assert!(channel.last_written().is_none());

        channel.bridge_mut().fail_write = false;
        channel.bridge_mut().fail_read = true;
        assert_eq!(channel.read_status(), Err(ChannelError::ReadTimeout));

        channel.bridge_mut().fail_read = false;
        channel.bridge_mut().fail_reselect = true;
        assert_eq!(
            channel.write_phase(phase(0), phase(0), &extra()),
            Err(ChannelError::ReselectTimeout)
        );

        channel.bridge_mut().fail_reselect = false;
        channel.bridge_mut().fail_deselect = true;
        assert_eq!(channel.read_status(), Err(ChannelError::ReselectTimeout));
    }

    #[test]
    fn probe_uses_tuning_timeout() {
        let mut channel = BlobChannel::new(ScriptedBridge::default(), ProbeTimeouts::new());
        assert_eq!(channel.run_probe(19), Ok(()));
        assert_eq!(channel.bridge().last_timeout, Some(DEFAULT_TUNING_TIMEOUT));
        assert_eq!(channel.run_probe(21), Err(ProbeError::Unstable));
    }
}
