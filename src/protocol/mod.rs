pub mod codec;
pub mod fields;
pub mod layout;
pub mod unit;

pub use codec::{ControlCommand, DecodeError, Format, FrameKind, PacketCodec, ParsedFrame, StatusReport};
pub use fields::{FanMode, HvacMode, OperModeByte, Reading, StatusByte, SwingMode, TargetTemperature};
pub use layout::Revision;
pub use unit::UnitId;
