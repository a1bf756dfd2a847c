use std::{fmt, str::FromStr};

use super::codec::DecodeError;

/// Address of one indoor unit on the bus, `01` to `99`.
///
/// Units are written on the wire as two BCD digits, so unit `12` is the byte `0x12`.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct UnitId(u8);

/// Unit byte used by a status request addressed to every unit.
pub const BROADCAST_UNIT: u8 = 0x00;

impl UnitId {
    pub const FIRST: u8 = 1;
    pub const LAST: u8 = 99;

    pub fn new(id: u8) -> Result<Self, DecodeError> {
        if (Self::FIRST..=Self::LAST).contains(&id) {
            Ok(Self(id))
        } else {
            Err(DecodeError::FieldOutOfRange { field: "unit id", value: id })
        }
    }

    pub fn get(self) -> u8 {
        self.0
    }

    pub fn from_bcd(byte: u8) -> Result<Self, DecodeError> {
        let (high, low) = (byte >> 4, byte & 0x0f);

        if high > 9 || low > 9 {
            return Err(DecodeError::FieldOutOfRange { field: "unit id", value: byte });
        }

        Self::new(high * 10 + low)
            .map_err(|_| DecodeError::FieldOutOfRange { field: "unit id", value: byte })
    }

    pub fn to_bcd(self) -> u8 {
        ((self.0 / 10) << 4) | (self.0 % 10)
    }

    /// The first `count` unit ids (`01`, `02`, ...).
    pub fn first_n(count: u8) -> impl Iterator<Item = UnitId> {
        (Self::FIRST..=count.min(Self::LAST)).map(UnitId)
    }
}

impl fmt::Display for UnitId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:02}", self.0)
    }
}

impl FromStr for UnitId {
    type Err = DecodeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();

        if s.is_empty() || s.len() > 2 || !s.bytes().all(|b| b.is_ascii_digit()) {
            return Err(DecodeError::InvalidUnitId(s.to_string()));
        }

        let id: u8 = s.parse().map_err(|_| DecodeError::InvalidUnitId(s.to_string()))?;
        Self::new(id)
    }
}

impl TryFrom<u8> for UnitId {
    type Error = DecodeError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}
