//! Byte offsets of the fields inside a frame.
//!
//! Captures from different firmware revisions disagree on where the status
//! and opermode bytes sit in Compact frames. Each known assignment is kept
//! as its own [`FieldTable`] and the codec is handed one at construction.
//! Header, unit id and checksum positions are shared by every revision.

use strum_macros::{Display, EnumIter, EnumString};

/// Header signature of checksum-bearing frames.
pub const COMPACT_SIGNATURE: [u8; 2] = [0x10, 0x02];

/// Header signature of the older flat frames without a checksum.
pub const LEGACY_SIGNATURE: [u8; 2] = [0x80, 0x00];

/// Both formats are 16 bytes. Anything after that is gateway padding.
pub const FRAME_LEN: usize = 16;

pub const KIND_OFFSET: usize = 2;
pub const UNIT_OFFSET: usize = 4;
pub const CHECKSUM_OFFSET: usize = FRAME_LEN - 1;


/// Compact offset table revision.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default, Display, EnumIter, EnumString)]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
pub enum Revision {
    /// status byte before the opermode byte
    #[default]
    A,
    /// opermode byte before the status byte
    B,
}

impl Revision {
    pub fn table(self) -> &'static FieldTable {
        match self {
            Revision::A => &COMPACT_REV_A,
            Revision::B => &COMPACT_REV_B,
        }
    }
}


#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FieldTable {
    pub revision: Revision,
    pub status: usize,
    pub opermode: usize,
    pub target: usize,
    pub ambient: usize,
    pub pipe1: usize,
    pub pipe2: usize,
    pub outdoor: usize,
    pub error_code: usize,
    pub flags: usize,
}

pub const COMPACT_REV_A: FieldTable = FieldTable {
    revision: Revision::A,
    status: 5,
    opermode: 6,
    target: 7,
    ambient: 8,
    pipe1: 9,
    pipe2: 10,
    outdoor: 11,
    error_code: 12,
    flags: 13,
};

pub const COMPACT_REV_B: FieldTable = FieldTable {
    revision: Revision::B,
    status: 6,
    opermode: 5,
    ..COMPACT_REV_A
};

/// Bit in the Compact flags byte set while the filter needs cleaning.
pub const FLAG_FILTER_ALARM: u8 = 0x01;


/// Legacy frames: one field per byte, plain values.
pub mod legacy {
    pub const POWER: usize = 5;
    pub const MODE: usize = 6;
    pub const TARGET: usize = 7;
    pub const CURRENT: usize = 8;
    pub const FAN: usize = 9;
    pub const ERROR_CODE: usize = 10;
    pub const FILTER: usize = 11;

    pub const POWER_ON: u8 = 0x01;
    pub const FILTER_ALARM: u8 = 0x01;
}
