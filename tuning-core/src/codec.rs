//! Named register fields packed into the bridge's 512-byte configuration image.
//!
//! Fields are addressed by bit offset and mask. Bits are stored LSB-first:
//! bit `n` of the image lives in byte `n / 8`, position `n % 8`. The bridge
//! firmware only interprets bits up to [`MAX_FIELD_BIT`].

use core::fmt;

use crate::channel::{ExtraFields, StatusSnapshot};
use crate::ladder::{DriverStrength, VoltageDomain};
use crate::phase::{BusMode, PassBitmap, PhaseIndex};

/// Size of the configuration image in bytes.
pub const BLOB_LEN: usize = 512;

/// Highest bit the bridge interprets.
pub const MAX_FIELD_BIT: u16 = 383;

/// Bit offset and value mask of a register field.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct RegisterField {
    pub offset: u16,
    pub mask: u32,
}

impl RegisterField {
    /// Creates a field descriptor.
    #[must_use]
    pub const fn new(offset: u16, mask: u32) -> Self {
        Self { offset, mask }
    }

    /// Number of bits the field occupies.
    #[must_use]
    pub const fn width(self) -> u32 {
        u32::BITS - self.mask.leading_zeros()
    }
}

/// Field table used by the calibration path.
pub mod fields {
    use super::RegisterField;

    pub const RX_STATUS_LOW: RegisterField = RegisterField::new(14, 0xFFFF_FFFF);
    pub const RX_STATUS_HIGH: RegisterField = RegisterField::new(46, 0xFFFF_FFFF);
    pub const TX_STATUS_LOW: RegisterField = RegisterField::new(205, 0xFFFF_FFFF);
    pub const TX_STATUS_HIGH: RegisterField = RegisterField::new(237, 0xFFFF_FFFF);

    pub const TX_PHASE_SDR50: RegisterField = RegisterField::new(126, 0xF);
    pub const TX_PHASE_SDR104: RegisterField = RegisterField::new(130, 0xF);
    pub const RX_PHASE_SDR50: RegisterField = RegisterField::new(140, 0xF);
    pub const RX_PHASE_SDR104: RegisterField = RegisterField::new(144, 0xF);
    pub const SWEEP_COUNT: RegisterField = RegisterField::new(173, 0x3F);

    pub const INJECT_SDR50: RegisterField = RegisterField::new(81, 0x7FF);
    pub const INJECT_SDR104: RegisterField = RegisterField::new(93, 0x7FF);
    pub const INJECT_ENABLE: RegisterField = RegisterField::new(357, 0x1);

    pub const DRIVER_STRENGTH: RegisterField = RegisterField::new(3, 0x7);
    pub const DLL_VOLTAGE: RegisterField = RegisterField::new(167, 0xF);

    /// Every field, for layout checks.
    pub const ALL: [RegisterField; 14] = [
        RX_STATUS_LOW,
        RX_STATUS_HIGH,
        TX_STATUS_LOW,
        TX_STATUS_HIGH,
        TX_PHASE_SDR50,
        TX_PHASE_SDR104,
        RX_PHASE_SDR50,
        RX_PHASE_SDR104,
        SWEEP_COUNT,
        INJECT_SDR50,
        INJECT_SDR104,
        INJECT_ENABLE,
        DRIVER_STRENGTH,
        DLL_VOLTAGE,
    ];
}

/// Decoding failures for phase settings.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum CodecError {
    /// A field held a value outside its valid range.
    OutOfRange(RegisterField),
}

impl fmt::Display for CodecError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CodecError::OutOfRange(field) => {
                write!(f, "field at bit {} out of range", field.offset)
            }
        }
    }
}

/// Raw configuration image exchanged with the bridge.
#[derive(Clone, Eq, PartialEq)]
pub struct ConfigBlob([u8; BLOB_LEN]);

impl ConfigBlob {
    /// All-zero image.
    #[must_use]
    pub const fn new() -> Self {
        Self([0; BLOB_LEN])
    }

    /// Wraps an image read from the bridge.
    #[must_use]
    pub const fn from_bytes(bytes: [u8; BLOB_LEN]) -> Self {
        Self(bytes)
    }

    #[must_use]
    pub fn as_bytes(&self) -> &[u8; BLOB_LEN] {
        &self.0
    }

    pub fn as_bytes_mut(&mut self) -> &mut [u8; BLOB_LEN] {
        &mut self.0
    }

    /// Extracts `field`.
    #[must_use]
    pub fn read(&self, field: RegisterField) -> u32 {
        let mut value = 0u32;
        for bit in 0..field.width() {
            let position = usize::from(field.offset) + bit as usize;
            if (self.0[position / 8] >> (position % 8)) & 1 == 1 {
                value |= 1 << bit;
            }
        }
        value & field.mask
    }

    /// Stores `value` into `field`, discarding bits outside the mask.
    pub fn write(&mut self, field: RegisterField, value: u32) {
        let value = value & field.mask;
        for bit in 0..field.width() {
            let position = usize::from(field.offset) + bit as usize;
            let byte = &mut self.0[position / 8];
            let flag = 1u8 << (position % 8);
            if (value >> bit) & 1 == 1 {
                *byte |= flag;
            } else {
                *byte &= !flag;
            }
        }
    }
}

impl Default for ConfigBlob {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for ConfigBlob {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ConfigBlob({BLOB_LEN} bytes)")
    }
}

/// Phase pair plus extra fields as written by the engine.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct PhaseFields {
    pub tx: PhaseIndex,
    pub rx: PhaseIndex,
    pub extra: ExtraFields,
}

/// Translates between typed settings and the configuration image.
pub struct PhaseCodec;

impl PhaseCodec {
    /// Writes every calibration field for `fields.extra.mode`.
    pub fn encode(blob: &mut ConfigBlob, fields: &PhaseFields) {
        let (tx_field, rx_field, inject_field) = mode_fields(fields.extra.mode);
        blob.write(tx_field, fields.tx.get().into());
        blob.write(rx_field, fields.rx.get().into());
        blob.write(fields::SWEEP_COUNT, fields.extra.sweep_count.into());
        blob.write(inject_field, fields.extra.inject.bits().into());
        blob.write(fields::INJECT_ENABLE, u32::from(fields.extra.inject_enable));
        blob.write(fields::DRIVER_STRENGTH, fields.extra.driver_strength.get().into());
        blob.write(fields::DLL_VOLTAGE, fields.extra.voltage.get().into());
    }

    /// Reads the calibration fields for `mode`.
    ///
    /// # Errors
    ///
    /// Returns [`CodecError::OutOfRange`] when a tap, voltage, or drive field
    /// holds a value the engine never writes.
    pub fn decode(blob: &ConfigBlob, mode: BusMode) -> Result<PhaseFields, CodecError> {
        let (tx_field, rx_field, inject_field) = mode_fields(mode);

        let tx = phase_field(blob, tx_field)?;
        let rx = phase_field(blob, rx_field)?;
        let sweep_count = narrow(blob.read(fields::SWEEP_COUNT), fields::SWEEP_COUNT)?;
        let inject_bits = u16::try_from(blob.read(inject_field))
            .map_err(|_| CodecError::OutOfRange(inject_field))?;
        let inject = PassBitmap::from_bits(inject_bits);
        let voltage = narrow(blob.read(fields::DLL_VOLTAGE), fields::DLL_VOLTAGE)?;
        let voltage =
            VoltageDomain::new(voltage).ok_or(CodecError::OutOfRange(fields::DLL_VOLTAGE))?;
        let drive = narrow(blob.read(fields::DRIVER_STRENGTH), fields::DRIVER_STRENGTH)?;
        let driver_strength =
            DriverStrength::new(drive).ok_or(CodecError::OutOfRange(fields::DRIVER_STRENGTH))?;

        Ok(PhaseFields {
            tx,
            rx,
            extra: ExtraFields {
                mode,
                sweep_count,
                inject,
                inject_enable: blob.read(fields::INJECT_ENABLE) == 1,
                voltage,
                driver_strength,
            },
        })
    }

    /// Writes raw status vectors, as the bridge does after a probe.
    pub fn encode_status(blob: &mut ConfigBlob, tx_fine: u64, rx_fine: u64) {
        write_wide(blob, fields::TX_STATUS_LOW, fields::TX_STATUS_HIGH, tx_fine);
        write_wide(blob, fields::RX_STATUS_LOW, fields::RX_STATUS_HIGH, rx_fine);
    }

    /// Reads the status vectors captured by the last probe.
    #[must_use]
    pub fn decode_status(blob: &ConfigBlob) -> StatusSnapshot {
        let tx_fine = read_wide(blob, fields::TX_STATUS_LOW, fields::TX_STATUS_HIGH);
        let rx_fine = read_wide(blob, fields::RX_STATUS_LOW, fields::RX_STATUS_HIGH);
        StatusSnapshot::from_raw(tx_fine, rx_fine)
    }
}

const fn mode_fields(mode: BusMode) -> (RegisterField, RegisterField, RegisterField) {
    match mode {
        BusMode::Sdr50 => (
            fields::TX_PHASE_SDR50,
            fields::RX_PHASE_SDR50,
            fields::INJECT_SDR50,
        ),
        BusMode::Sdr104 => (
            fields::TX_PHASE_SDR104,
            fields::RX_PHASE_SDR104,
            fields::INJECT_SDR104,
        ),
    }
}

fn narrow(value: u32, field: RegisterField) -> Result<u8, CodecError> {
    u8::try_from(value).map_err(|_| CodecError::OutOfRange(field))
}

fn phase_field(blob: &ConfigBlob, field: RegisterField) -> Result<PhaseIndex, CodecError> {
    PhaseIndex::new(narrow(blob.read(field), field)?).ok_or(CodecError::OutOfRange(field))
}

#[allow(clippy::cast_possible_truncation)]
fn write_wide(blob: &mut ConfigBlob, low: RegisterField, high: RegisterField, value: u64) {
    blob.write(low, (value & 0xFFFF_FFFF) as u32);
    blob.write(high, (value >> 32) as u32);
}

fn read_wide(blob: &ConfigBlob, low: RegisterField, high: RegisterField) -> u64 {
    (u64::from(blob.read(high)) << 32) | u64::from(blob.read(low))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::full_sweep;

    #[test]
    fn field_table_fits_and_does_not_overlap() {
        let mut used = [false; MAX_FIELD_BIT as usize + 1];
        for field in fields::ALL {
            for bit in 0..field.width() {
                let position = usize::from(field.offset) + bit as usize;
                assert!(position <= usize::from(MAX_FIELD_BIT), "bit {position} out of range");
                assert!(!used[position], "bit {position} claimed twice");
                used[position] = true;
            }
        }
    }

    #[test]
    fn fields_survive_neighbouring_writes() {
        let mut blob = ConfigBlob::new();
        blob.write(fields::TX_PHASE_SDR104, 0xF);
        blob.write(fields::TX_PHASE_SDR50, 0x5);
        blob.write(fields::INJECT_SDR104, 0x7F1);
        assert_eq!(blob.read(fields::TX_PHASE_SDR104), 0xF);
        assert_eq!(blob.read(fields::TX_PHASE_SDR50), 0x5);
        assert_eq!(blob.read(fields::INJECT_SDR104), 0x7F1);

        blob.write(fields::TX_PHASE_SDR104, 0x1_0003);
        assert_eq!(blob.read(fields::TX_PHASE_SDR104), 0x3);
    }

    #[test]
    fn phase_fields_round_trip() {
        let mut blob = ConfigBlob::new();
        for mode in BusMode::ALL {
            for tx in PhaseIndex::all() {
                let rx = tx.offset(4);
                let step = tx.get();
                let fields = PhaseFields {
                    tx,
                    rx,
                    extra: ExtraFields {
                        mode,
                        sweep_count: step % full_sweep() + 1,
                        inject: PassBitmap::ALL_PASS.without(rx),
                        inject_enable: step % 2 == 0,
                        voltage: VoltageDomain::new(step % 4).expect("domain"),
                        driver_strength: DriverStrength::new(step % 8).expect("step"),
                    },
                };

                PhaseCodec::encode(&mut blob, &fields);
                assert_eq!(PhaseCodec::decode(&blob, mode), Ok(fields));
            }
        }
    }

    #[test]
    fn status_round_trip() {
        let mut blob = ConfigBlob::new();
        PhaseCodec::encode_status(&mut blob, 0xDEAD_BEEF_0123_4567, u64::MAX);
        let status = PhaseCodec::decode_status(&blob);
        assert_eq!(status.tx_fine, 0xDEAD_BEEF_0123_4567);
        assert!(status.accessibility.is_all_pass());
    }

    #[test]
    fn decode_rejects_taps_past_the_ring() {
        let mut blob = ConfigBlob::new();
        blob.write(fields::RX_PHASE_SDR50, 12);
        assert_eq!(
            PhaseCodec::decode(&blob, BusMode::Sdr50),
            Err(CodecError::OutOfRange(fields::RX_PHASE_SDR50))
        );
    }
}
