use bytes::{Buf, BufMut, Bytes, BytesMut};
use packed_struct::PackingError;
use strum_macros::Display;
use thiserror::Error;
use tokio_util::codec::Decoder;

use super::{
    fields::{FanMode, HvacMode, OperModeByte, Reading, StatusByte, SwingMode, TargetTemperature},
    layout::{self, legacy, FieldTable, Revision, CHECKSUM_OFFSET, COMPACT_SIGNATURE, FRAME_LEN, KIND_OFFSET, LEGACY_SIGNATURE, UNIT_OFFSET},
    unit::{UnitId, BROADCAST_UNIT},
};


#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Display)]
pub enum Format {
    Legacy,
    Compact,
}

impl Format {
    /// Identify the frame format from its header signature.
    pub fn identify(raw: &[u8]) -> Option<Self> {
        if raw.starts_with(&COMPACT_SIGNATURE) {
            Some(Format::Compact)
        } else if raw.starts_with(&LEGACY_SIGNATURE) {
            Some(Format::Legacy)
        } else {
            None
        }
    }

    pub fn min_len(self) -> usize {
        FRAME_LEN
    }
}


/// Frame kind, byte 2 of both formats.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum FrameKind {
    StatusRequest,
    StatusReport,
    Control,
    Other(u8),
}

impl FrameKind {
    const STATUS_REQUEST: u8 = 0xa3;
    const STATUS_REPORT: u8 = 0xb0;
    const CONTROL: u8 = 0xc6;

    pub fn from_byte(byte: u8) -> Self {
        match byte {
            Self::STATUS_REQUEST => Self::StatusRequest,
            Self::STATUS_REPORT => Self::StatusReport,
            Self::CONTROL => Self::Control,
            other => Self::Other(other),
        }
    }

    pub fn to_byte(self) -> u8 {
        match self {
            Self::StatusRequest => Self::STATUS_REQUEST,
            Self::StatusReport => Self::STATUS_REPORT,
            Self::Control => Self::CONTROL,
            Self::Other(byte) => byte,
        }
    }
}


#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    #[error("unknown frame header {0:02x?}")]
    UnknownFormat(Vec<u8>),

    #[error("truncated {format} frame ({len} bytes, need {min})")]
    Truncated {
        format: Format,
        len: usize,
        min: usize,
    },

    #[error("invalid checksum (expected {expected:02x}, actual: {actual:02x})")]
    ChecksumMismatch {
        expected: u8,
        actual: u8,
    },

    #[error("frame for unit {actual} offered to unit {expected}")]
    UnitIdMismatch {
        expected: UnitId,
        actual: UnitId,
    },

    #[error("{field} out of range: {value:#04x}")]
    FieldOutOfRange {
        field: &'static str,
        value: u8,
    },

    #[error("frame kind {0:#04x} does not carry unit state")]
    UnexpectedKind(u8),

    #[error("invalid unit id {0:?}")]
    InvalidUnitId(String),

    #[error("field byte does not pack: {0}")]
    Packing(String),
}

impl From<PackingError> for DecodeError {
    fn from(err: PackingError) -> Self {
        Self::Packing(err.to_string())
    }
}


/// Frame checksum over every byte before the checksum byte.
pub fn checksum(bytes: &[u8]) -> u8 {
    let sum = bytes.iter().fold(0u8, |acc, byte| acc.wrapping_add(*byte));
    (sum & 0xaa) + (0x55 - (sum & 0x55))
}

/// Unit id embedded in a frame, without validating anything else.
pub fn peek_unit_id(raw: &[u8]) -> Option<UnitId> {
    Format::identify(raw)?;
    raw.get(UNIT_OFFSET).and_then(|byte| UnitId::from_bcd(*byte).ok())
}

/// A valid Compact status request addressed to every unit.
pub fn is_broadcast_request(raw: &[u8]) -> bool {
    raw.len() >= FRAME_LEN
        && Format::identify(raw) == Some(Format::Compact)
        && FrameKind::from_byte(raw[KIND_OFFSET]) == FrameKind::StatusRequest
        && raw[UNIT_OFFSET] == BROADCAST_UNIT
        && raw[CHECKSUM_OFFSET] == checksum(&raw[..CHECKSUM_OFFSET])
}


/// Decoded content of one frame.
///
/// Fields a format does not carry are `None` (or [`Reading::NotReported`]),
/// so the caller can keep its previous value.
#[derive(Clone, Debug, PartialEq)]
pub struct ParsedFrame {
    pub format: Format,
    pub kind: FrameKind,
    pub unit_id: UnitId,

    pub power: bool,
    pub locked: Option<bool>,

    pub hvac_mode: HvacMode,
    pub swing_mode: Option<SwingMode>,
    pub fan_mode: FanMode,

    /// `None` when the frame carried a value outside `16..=30`.
    pub target_temperature: Option<TargetTemperature>,

    pub current_temperature: Reading,
    pub pipe1_temperature: Reading,
    pub pipe2_temperature: Reading,
    pub outdoor_temperature: Reading,

    pub error_code: Option<u8>,
    pub filter_alarm: Option<bool>,

    /// The frame bytes, without any trailing padding.
    pub raw: Bytes,
}

impl ParsedFrame {
    /// The command this frame expresses, if it carries every commanded field.
    pub fn control(&self) -> Option<ControlCommand> {
        Some(ControlCommand {
            unit_id: self.unit_id,
            power: self.power,
            locked: self.locked?,
            hvac_mode: self.hvac_mode,
            fan_mode: self.fan_mode,
            swing_mode: self.swing_mode?,
            target_temperature: self.target_temperature?,
        })
    }
}


/// A change of settings for one unit.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ControlCommand {
    pub unit_id: UnitId,
    pub power: bool,
    pub locked: bool,
    pub hvac_mode: HvacMode,
    pub fan_mode: FanMode,
    pub swing_mode: SwingMode,
    pub target_temperature: TargetTemperature,
}

impl ControlCommand {
    pub fn status_byte(&self) -> StatusByte {
        StatusByte::new(self.power, self.locked)
    }

    pub fn opermode_byte(&self) -> OperModeByte {
        OperModeByte::new(self.hvac_mode, self.swing_mode, self.fan_mode)
    }
}


/// Full state of a unit as it reports it.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct StatusReport {
    pub settings: ControlCommand,
    pub current_temperature: Reading,
    pub pipe1_temperature: Reading,
    pub pipe2_temperature: Reading,
    pub outdoor_temperature: Reading,
    pub error_code: u8,
    pub filter_alarm: bool,
}


/// Stateless frame encoder/decoder.
///
/// Legacy frames always use the legacy layout. Compact frames use the
/// [`FieldTable`] of the revision the codec was built for.
#[derive(Clone, Copy, Debug)]
pub struct PacketCodec {
    table: &'static FieldTable,
}

impl Default for PacketCodec {
    fn default() -> Self {
        Self::new(Revision::default())
    }
}

impl PacketCodec {
    pub fn new(revision: Revision) -> Self {
        Self {
            table: revision.table(),
        }
    }

    pub fn revision(&self) -> Revision {
        self.table.revision
    }

    pub fn decode(&self, raw: &[u8]) -> Result<ParsedFrame, DecodeError> {
        let format = Format::identify(raw)
            .ok_or_else(|| DecodeError::UnknownFormat(raw[..raw.len().min(COMPACT_SIGNATURE.len())].to_vec()))?;

        if raw.len() < format.min_len() {
            return Err(DecodeError::Truncated { format, len: raw.len(), min: format.min_len() });
        }

        let frame = &raw[..FRAME_LEN];

        if format == Format::Compact {
            let expected = checksum(&frame[..CHECKSUM_OFFSET]);
            let actual = frame[CHECKSUM_OFFSET];

            if expected != actual {
                return Err(DecodeError::ChecksumMismatch { expected, actual });
            }
        }

        let unit_id = UnitId::from_bcd(frame[UNIT_OFFSET])?;
        let kind = FrameKind::from_byte(frame[KIND_OFFSET]);
        let raw = Bytes::copy_from_slice(frame);

        match format {
            Format::Compact => self.decode_compact(kind, unit_id, raw),
            Format::Legacy => Ok(decode_legacy(kind, unit_id, raw)),
        }
    }

    fn decode_compact(&self, kind: FrameKind, unit_id: UnitId, raw: Bytes) -> Result<ParsedFrame, DecodeError> {
        let table = self.table;

        let status = StatusByte::from_byte(raw[table.status])?;
        let opermode = OperModeByte::from_byte(raw[table.opermode])?;

        Ok(ParsedFrame {
            format: Format::Compact,
            kind,
            unit_id,
            power: status.power,
            locked: Some(status.locked),
            hvac_mode: opermode.hvac_mode(),
            swing_mode: Some(opermode.swing_mode()),
            fan_mode: opermode.fan_mode(),
            target_temperature: TargetTemperature::from_raw(raw[table.target]),
            current_temperature: Reading::from_sensor_byte(raw[table.ambient]),
            pipe1_temperature: Reading::from_sensor_byte(raw[table.pipe1]),
            pipe2_temperature: Reading::from_sensor_byte(raw[table.pipe2]),
            outdoor_temperature: Reading::from_sensor_byte(raw[table.outdoor]),
            error_code: Some(raw[table.error_code]),
            filter_alarm: Some(raw[table.flags] & layout::FLAG_FILTER_ALARM != 0),
            raw,
        })
    }

    pub fn encode_control(&self, command: &ControlCommand) -> Result<Bytes, DecodeError> {
        self.encode_compact(FrameKind::Control, command.unit_id.to_bcd(), |frame, table| {
            frame[table.status] = command.status_byte().to_byte()?;
            frame[table.opermode] = command.opermode_byte().to_byte()?;
            frame[table.target] = command.target_temperature.to_raw();
            Ok(())
        })
    }

    /// Ask one unit for its state. The request carries the opermode the
    /// caller currently believes the unit is in.
    pub fn encode_status_request(&self, unit_id: UnitId, current_opermode: OperModeByte) -> Result<Bytes, DecodeError> {
        self.encode_compact(FrameKind::StatusRequest, unit_id.to_bcd(), |frame, table| {
            frame[table.opermode] = current_opermode.to_byte()?;
            Ok(())
        })
    }

    /// Ask every unit on the bus for its state.
    pub fn encode_broadcast_status_request(&self) -> Result<Bytes, DecodeError> {
        self.encode_compact(FrameKind::StatusRequest, BROADCAST_UNIT, |_, _| Ok(()))
    }

    pub fn encode_status_report(&self, report: &StatusReport) -> Result<Bytes, DecodeError> {
        let settings = &report.settings;

        self.encode_compact(FrameKind::StatusReport, settings.unit_id.to_bcd(), |frame, table| {
            frame[table.status] = settings.status_byte().to_byte()?;
            frame[table.opermode] = settings.opermode_byte().to_byte()?;
            frame[table.target] = settings.target_temperature.to_raw();
            frame[table.ambient] = report.current_temperature.to_sensor_byte();
            frame[table.pipe1] = report.pipe1_temperature.to_sensor_byte();
            frame[table.pipe2] = report.pipe2_temperature.to_sensor_byte();
            frame[table.outdoor] = report.outdoor_temperature.to_sensor_byte();
            frame[table.error_code] = report.error_code;
            frame[table.flags] = if report.filter_alarm { layout::FLAG_FILTER_ALARM } else { 0 };
            Ok(())
        })
    }

    fn encode_compact<F>(&self, kind: FrameKind, unit: u8, fill: F) -> Result<Bytes, DecodeError> where
        F: FnOnce(&mut [u8; FRAME_LEN], &FieldTable) -> Result<(), DecodeError>
    {
        let mut frame = [0u8; FRAME_LEN];

        frame[..COMPACT_SIGNATURE.len()].copy_from_slice(&COMPACT_SIGNATURE);
        frame[KIND_OFFSET] = kind.to_byte();
        frame[UNIT_OFFSET] = unit;

        fill(&mut frame, self.table)?;

        frame[CHECKSUM_OFFSET] = checksum(&frame[..CHECKSUM_OFFSET]);

        let mut dst = BytesMut::with_capacity(FRAME_LEN);
        dst.put(&frame[..]);
        Ok(dst.freeze())
    }
}

fn decode_legacy(kind: FrameKind, unit_id: UnitId, raw: Bytes) -> ParsedFrame {
    ParsedFrame {
        format: Format::Legacy,
        kind,
        unit_id,
        power: raw[legacy::POWER] == legacy::POWER_ON,
        locked: None,
        hvac_mode: HvacMode::from_legacy_code(raw[legacy::MODE]),
        swing_mode: None,
        fan_mode: FanMode::from_legacy_code(raw[legacy::FAN]),
        target_temperature: TargetTemperature::new(raw[legacy::TARGET]).ok(),
        current_temperature: Reading::from_legacy_byte(raw[legacy::CURRENT]),
        pipe1_temperature: Reading::NotReported,
        pipe2_temperature: Reading::NotReported,
        outdoor_temperature: Reading::NotReported,
        error_code: Some(raw[legacy::ERROR_CODE]),
        filter_alarm: Some(raw[legacy::FILTER] == legacy::FILTER_ALARM),
        raw,
    }
}


/// Splits a byte stream into frames on header signatures.
///
/// Frames are not validated here; that is [`PacketCodec::decode`]'s job.
/// Junk before a signature is skipped. Bytes left over when the stream
/// ends are yielded as a final (short) frame.
#[derive(Debug, Default)]
pub struct FrameSplitter;

fn find_signature(src: &[u8]) -> Option<usize> {
    src.windows(COMPACT_SIGNATURE.len())
        .position(|window| window == COMPACT_SIGNATURE || window == LEGACY_SIGNATURE)
}

impl Decoder for FrameSplitter {
    type Item = Bytes;

    type Error = std::io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        match find_signature(src) {
            Some(0) => (),
            Some(idx) => {
                tracing::trace!(skipped = idx, "resync on frame header");
                src.advance(idx);
            },
            None => {
                // keep a trailing byte that might be the first half of a signature
                let keep = match src.last() {
                    Some(&byte) if byte == COMPACT_SIGNATURE[0] || byte == LEGACY_SIGNATURE[0] => 1,
                    _ => 0,
                };
                src.advance(src.len() - keep);
                return Ok(None);
            }
        }

        if src.len() < FRAME_LEN {
            src.reserve(FRAME_LEN - src.len());
            return Ok(None);
        }

        Ok(Some(src.split_to(FRAME_LEN).freeze()))
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        match self.decode(src)? {
            Some(frame) => Ok(Some(frame)),
            None if src.is_empty() => Ok(None),
            None => Ok(Some(src.split().freeze())),
        }
    }
}
