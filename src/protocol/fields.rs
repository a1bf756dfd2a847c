use std::fmt::Debug;

use packed_struct::prelude::*;
use strum_macros::{Display, EnumIter, EnumString};

use super::codec::DecodeError;


/// Operating mode of an indoor unit.
///
/// `Off` has no opermode ordinal of its own. A unit that is powered off
/// still reports the mode it will resume in.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Display, EnumIter, EnumString)]
#[strum(serialize_all = "snake_case")]
pub enum HvacMode {
    Cool,
    Dry,
    FanOnly,
    Auto,
    Heat,
    Off,
}

impl HvacMode {
    /// Ordinal written for `Off`. Outside 0-4, so it reads back as `Off`.
    const OFF_ORDINAL: u8 = 0x07;

    pub fn from_ordinal(ordinal: u8) -> Self {
        match ordinal {
            0 => Self::Cool,
            1 => Self::Dry,
            2 => Self::FanOnly,
            3 => Self::Auto,
            4 => Self::Heat,
            _ => Self::Off,
        }
    }

    pub fn ordinal(self) -> u8 {
        match self {
            Self::Cool => 0,
            Self::Dry => 1,
            Self::FanOnly => 2,
            Self::Auto => 3,
            Self::Heat => 4,
            Self::Off => Self::OFF_ORDINAL,
        }
    }

    pub fn from_legacy_code(code: u8) -> Self {
        match code {
            0x01 => Self::Heat,
            0x02 => Self::Cool,
            0x03 => Self::Dry,
            0x04 => Self::FanOnly,
            0x05 => Self::Auto,
            _ => Self::Off,
        }
    }
}


#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Display, EnumIter, EnumString)]
#[strum(serialize_all = "snake_case")]
pub enum FanMode {
    Low,
    Medium,
    High,
    Auto,
    Silent,
    Power,
}

impl FanMode {
    pub fn from_ordinal(ordinal: u8) -> Self {
        match ordinal {
            0 => Self::Low,
            1 => Self::Medium,
            2 => Self::High,
            3 => Self::Auto,
            4 => Self::Silent,
            5 => Self::Power,
            _ => Self::Auto,
        }
    }

    pub fn ordinal(self) -> u8 {
        match self {
            Self::Low => 0,
            Self::Medium => 1,
            Self::High => 2,
            Self::Auto => 3,
            Self::Silent => 4,
            Self::Power => 5,
        }
    }

    pub fn from_legacy_code(code: u8) -> Self {
        match code {
            0x00 => Self::Low,
            0x01 => Self::Medium,
            0x02 => Self::High,
            0x04 => Self::Power,
            0x05 => Self::Silent, // "nature"
            _ => Self::Auto,
        }
    }
}


#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Display, EnumIter, EnumString)]
#[strum(serialize_all = "snake_case")]
pub enum SwingMode {
    Fix,
    Auto,
}


/// Status byte: power and lock packed into the two low bits.
///
/// | value | meaning        |
/// |-------|----------------|
/// | `0`   | off, unlocked  |
/// | `1`   | on, unlocked   |
/// | `2`   | off, locked    |
/// | `3`   | on, locked     |
#[derive(PackedStruct, Clone, Copy, Debug, PartialEq, Eq)]
#[packed_struct(bit_numbering = "lsb0", size_bytes = "1")]
pub struct StatusByte {
    #[packed_field(bits = "0")]
    pub power: bool,

    #[packed_field(bits = "1")]
    pub locked: bool,
}

impl StatusByte {
    pub fn new(power: bool, locked: bool) -> Self {
        Self { power, locked }
    }

    pub fn from_byte(byte: u8) -> Result<Self, DecodeError> {
        Ok(Self::unpack(&[byte])?)
    }

    pub fn to_byte(self) -> Result<u8, DecodeError> {
        let [byte] = self.pack()?;
        Ok(byte)
    }
}


/// Opermode byte: hvac mode, swing and fan speed.
///
/// - bits 0-2: hvac mode ordinal
/// - bit 3: swing (`0` fix, `1` auto)
/// - bits 4-6: fan mode ordinal
#[derive(PackedStruct, Clone, Copy, Debug, PartialEq)]
#[packed_struct(bit_numbering = "lsb0", size_bytes = "1")]
pub struct OperModeByte {
    #[packed_field(bits = "0..=2")]
    pub hvac: Integer<u8, packed_bits::Bits::<3>>,

    #[packed_field(bits = "3")]
    pub swing: bool,

    #[packed_field(bits = "4..=6")]
    pub fan: Integer<u8, packed_bits::Bits::<3>>,
}

impl OperModeByte {
    pub fn new(hvac_mode: HvacMode, swing_mode: SwingMode, fan_mode: FanMode) -> Self {
        Self {
            hvac: hvac_mode.ordinal().into(),
            swing: swing_mode == SwingMode::Auto,
            fan: fan_mode.ordinal().into(),
        }
    }

    pub fn from_byte(byte: u8) -> Result<Self, DecodeError> {
        Ok(Self::unpack(&[byte])?)
    }

    pub fn to_byte(self) -> Result<u8, DecodeError> {
        let [byte] = self.pack()?;
        Ok(byte)
    }

    pub fn hvac_mode(&self) -> HvacMode {
        HvacMode::from_ordinal(*self.hvac)
    }

    pub fn swing_mode(&self) -> SwingMode {
        if self.swing { SwingMode::Auto } else { SwingMode::Fix }
    }

    pub fn fan_mode(&self) -> FanMode {
        FanMode::from_ordinal(*self.fan)
    }
}


/// Target (setpoint) temperature, whole degrees celsius in `16..=30`.
///
/// Written on the wire as `celsius - 15`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TargetTemperature(u8);

impl TargetTemperature {
    pub const MIN: u8 = 16;
    pub const MAX: u8 = 30;
    const WIRE_OFFSET: u8 = 15;

    pub fn new(celsius: u8) -> Result<Self, DecodeError> {
        if (Self::MIN..=Self::MAX).contains(&celsius) {
            Ok(Self(celsius))
        } else {
            Err(DecodeError::FieldOutOfRange { field: "target temperature", value: celsius })
        }
    }

    /// `None` when the decoded value falls outside `16..=30`.
    pub fn from_raw(raw: u8) -> Option<Self> {
        raw.checked_add(Self::WIRE_OFFSET)
            .and_then(|celsius| Self::new(celsius).ok())
    }

    pub fn to_raw(self) -> u8 {
        self.0 - Self::WIRE_OFFSET
    }

    pub fn celsius(self) -> u8 {
        self.0
    }
}

impl Default for TargetTemperature {
    fn default() -> Self {
        Self(24)
    }
}


/// A temperature sensor reading (room, pipe or outdoor).
#[derive(Clone, Copy, Debug, PartialEq, Default)]
pub enum Reading {
    /// The unit did not report this sensor. Distinct from a reading of 0C.
    #[default]
    NotReported,
    Celsius(f32),
}

impl Reading {
    /// Raw sensor bytes at or below this value carry no reading.
    pub const SENSOR_FLOOR: u8 = 40;

    pub fn from_sensor_byte(raw: u8) -> Self {
        if raw > Self::SENSOR_FLOOR {
            Self::Celsius(64.0 - f32::from(raw) / 3.0)
        } else {
            Self::NotReported
        }
    }

    /// Inverse of [`Reading::from_sensor_byte`], rounded to the nearest raw step.
    /// Values the sensor encoding cannot carry are written as "not reported".
    pub fn to_sensor_byte(self) -> u8 {
        match self {
            Self::NotReported => 0,
            Self::Celsius(celsius) => {
                let raw = ((64.0 - celsius) * 3.0).round();
                if raw > f32::from(Self::SENSOR_FLOOR) && raw <= f32::from(u8::MAX) {
                    raw as u8
                } else {
                    0
                }
            }
        }
    }

    /// Legacy frames carry plain degrees, valid in `0..=50`.
    pub fn from_legacy_byte(raw: u8) -> Self {
        if raw <= 50 {
            Self::Celsius(f32::from(raw))
        } else {
            Self::NotReported
        }
    }

    pub fn celsius(self) -> Option<f32> {
        match self {
            Self::NotReported => None,
            Self::Celsius(celsius) => Some(celsius),
        }
    }
}


#[cfg(test)]
mod tests {
    use strum::IntoEnumIterator;

    use super::*;

    #[test]
    fn test_status_byte_combinations() {
        assert_eq!(StatusByte::new(false, false).to_byte().unwrap(), 0);
        assert_eq!(StatusByte::new(true, false).to_byte().unwrap(), 1);
        assert_eq!(StatusByte::new(false, true).to_byte().unwrap(), 2);
        assert_eq!(StatusByte::new(true, true).to_byte().unwrap(), 3);

        // high bits are ignored
        assert_eq!(StatusByte::from_byte(0xf1).unwrap(), StatusByte::new(true, false));
    }

    #[test]
    fn test_opermode_byte_layout() {
        let byte = OperModeByte::new(HvacMode::Heat, SwingMode::Fix, FanMode::Auto).to_byte().unwrap();
        assert_eq!(byte, 0x34);

        let byte = OperModeByte::new(HvacMode::Cool, SwingMode::Auto, FanMode::Power).to_byte().unwrap();
        assert_eq!(byte, 0x58);

        for hvac in HvacMode::iter() {
            for fan in FanMode::iter() {
                for swing in SwingMode::iter() {
                    let decoded = OperModeByte::from_byte(OperModeByte::new(hvac, swing, fan).to_byte().unwrap()).unwrap();
                    assert_eq!((decoded.hvac_mode(), decoded.swing_mode(), decoded.fan_mode()), (hvac, swing, fan));
                }
            }
        }
    }

    #[test]
    fn test_unknown_ordinals_use_safe_defaults() {
        let decoded = OperModeByte::from_byte(0x76).unwrap();
        assert_eq!(decoded.hvac_mode(), HvacMode::Off);
        assert_eq!(decoded.fan_mode(), FanMode::Auto);
        assert_eq!(decoded.swing_mode(), SwingMode::Fix);
    }

    #[test]
    fn test_target_temperature() {
        assert_eq!(TargetTemperature::from_raw(0x0c).map(|t| t.celsius()), Some(27));
        assert_eq!(TargetTemperature::from_raw(1).map(|t| t.celsius()), Some(16));
        assert_eq!(TargetTemperature::from_raw(15).map(|t| t.celsius()), Some(30));
        assert_eq!(TargetTemperature::from_raw(0), None);
        assert_eq!(TargetTemperature::from_raw(16), None);
        assert_eq!(TargetTemperature::from_raw(0xff), None);

        assert_eq!(TargetTemperature::new(27).unwrap().to_raw(), 0x0c);
        assert!(TargetTemperature::new(31).is_err());
    }

    #[test]
    fn test_sensor_reading_floor() {
        assert_eq!(Reading::from_sensor_byte(40), Reading::NotReported);
        assert_eq!(Reading::from_sensor_byte(0), Reading::NotReported);

        let celsius = Reading::from_sensor_byte(41).celsius().unwrap();
        assert!((celsius - (64.0 - 41.0 / 3.0)).abs() < 1e-4);
        assert!((celsius - 50.33).abs() < 0.01);

        assert_eq!(Reading::from_sensor_byte(120).to_sensor_byte(), 120);
        assert_eq!(Reading::Celsius(60.0).to_sensor_byte(), 0);
    }

    #[test]
    fn test_mode_names() {
        assert_eq!(HvacMode::FanOnly.to_string(), "fan_only");
        assert_eq!("silent".parse::<FanMode>().unwrap(), FanMode::Silent);
    }
}
