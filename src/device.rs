use std::{
    fmt,
    time::{Duration, Instant},
};

use bytes::Bytes;
use tracing::{debug, warn};

use crate::protocol::{
    ControlCommand, DecodeError, FanMode, FrameKind, HvacMode, OperModeByte, ParsedFrame, Reading, SwingMode,
    TargetTemperature, UnitId,
};


/// Result of offering a frame (or a command) to a [`DeviceState`].
#[derive(Clone, Debug, PartialEq)]
pub enum ApplyOutcome {
    Changed,
    Unchanged,
    Rejected(DecodeError),
}

impl ApplyOutcome {
    pub fn is_changed(&self) -> bool {
        matches!(self, ApplyOutcome::Changed)
    }
}


/// Every field that collaborators can observe. Two states with equal
/// signatures look identical to them.
#[derive(Clone, Debug, PartialEq)]
struct StateSignature {
    power: bool,
    locked: bool,
    hvac_mode: HvacMode,
    fan_mode: FanMode,
    swing_mode: SwingMode,
    target_temperature: TargetTemperature,
    current_temperature: Reading,
    pipe1_temperature: Reading,
    pipe2_temperature: Reading,
    outdoor_temperature: Reading,
    error_code: u8,
    filter_alarm: bool,
    provisional: bool,
}


/// Canonical state of one indoor unit.
#[derive(Clone, Debug)]
pub struct DeviceState {
    pub unit_id: UnitId,

    pub power: bool,
    pub locked: bool,

    pub hvac_mode: HvacMode,
    pub fan_mode: FanMode,
    pub swing_mode: SwingMode,

    pub target_temperature: TargetTemperature,

    pub current_temperature: Reading,
    pub pipe1_temperature: Reading,
    pub pipe2_temperature: Reading,
    pub outdoor_temperature: Reading,

    pub error_code: u8,
    pub filter_alarm: bool,

    /// Last frame successfully applied. `None` until the unit has reported once.
    pub last_raw_frame: Option<Bytes>,

    /// Set by an optimistic write, cleared by the next authoritative frame.
    pub provisional: bool,

    last_seen: Option<Instant>,
    consecutive_failures: u32,
    signature: Option<StateSignature>,
}

impl DeviceState {
    pub fn new(unit_id: UnitId) -> Self {
        Self {
            unit_id,
            power: false,
            locked: false,
            hvac_mode: HvacMode::Off,
            fan_mode: FanMode::Auto,
            swing_mode: SwingMode::Fix,
            target_temperature: TargetTemperature::default(),
            current_temperature: Reading::NotReported,
            pipe1_temperature: Reading::NotReported,
            pipe2_temperature: Reading::NotReported,
            outdoor_temperature: Reading::NotReported,
            error_code: 0,
            filter_alarm: false,
            last_raw_frame: None,
            provisional: false,
            last_seen: None,
            consecutive_failures: 0,
            signature: None,
        }
    }

    fn signature(&self) -> StateSignature {
        StateSignature {
            power: self.power,
            locked: self.locked,
            hvac_mode: self.hvac_mode,
            fan_mode: self.fan_mode,
            swing_mode: self.swing_mode,
            target_temperature: self.target_temperature,
            current_temperature: self.current_temperature,
            pipe1_temperature: self.pipe1_temperature,
            pipe2_temperature: self.pipe2_temperature,
            outdoor_temperature: self.outdoor_temperature,
            error_code: self.error_code,
            filter_alarm: self.filter_alarm,
            provisional: self.provisional,
        }
    }

    /// Replace `self` with `next`, reporting whether anything observable changed.
    fn commit(&mut self, mut next: DeviceState) -> ApplyOutcome {
        let signature = next.signature();

        let outcome = if self.signature.as_ref() == Some(&signature) {
            ApplyOutcome::Unchanged
        } else {
            ApplyOutcome::Changed
        };

        next.signature = Some(signature);
        *self = next;

        outcome
    }

    /// Apply an authoritative frame reported by the unit.
    ///
    /// Every field the frame carries overwrites the current value, including
    /// any optimistic write. Fields the frame does not carry (or reports as
    /// out of range) keep their previous value.
    pub fn apply(&mut self, parsed: &ParsedFrame) -> ApplyOutcome {
        if parsed.kind != FrameKind::StatusReport {
            return ApplyOutcome::Rejected(DecodeError::UnexpectedKind(parsed.kind.to_byte()));
        }

        if parsed.unit_id != self.unit_id {
            return ApplyOutcome::Rejected(DecodeError::UnitIdMismatch {
                expected: self.unit_id,
                actual: parsed.unit_id,
            });
        }

        let mut next = self.clone();

        next.power = parsed.power;
        next.hvac_mode = parsed.hvac_mode;
        next.fan_mode = parsed.fan_mode;

        if let Some(locked) = parsed.locked {
            next.locked = locked;
        }

        if let Some(swing_mode) = parsed.swing_mode {
            next.swing_mode = swing_mode;
        }

        match parsed.target_temperature {
            Some(target) => next.target_temperature = target,
            None => warn!(unit = %self.unit_id, "target temperature out of range, keeping {}", self.target_temperature.celsius()),
        }

        for (field, reading) in [
            (&mut next.current_temperature, parsed.current_temperature),
            (&mut next.pipe1_temperature, parsed.pipe1_temperature),
            (&mut next.pipe2_temperature, parsed.pipe2_temperature),
            (&mut next.outdoor_temperature, parsed.outdoor_temperature),
        ] {
            if let Reading::Celsius(_) = reading {
                *field = reading;
            }
        }

        if let Some(error_code) = parsed.error_code {
            next.error_code = error_code;
        }

        if let Some(filter_alarm) = parsed.filter_alarm {
            next.filter_alarm = filter_alarm;
        }

        next.last_raw_frame = Some(parsed.raw.clone());
        next.provisional = false;
        next.last_seen = Some(Instant::now());
        next.consecutive_failures = 0;

        self.commit(next)
    }

    /// Write the fields a successfully sent command implies, ahead of the
    /// unit confirming them.
    pub fn apply_optimistic(&mut self, command: &ControlCommand) -> ApplyOutcome {
        if command.unit_id != self.unit_id {
            return ApplyOutcome::Rejected(DecodeError::UnitIdMismatch {
                expected: self.unit_id,
                actual: command.unit_id,
            });
        }

        let mut next = self.clone();

        next.power = command.power;
        next.locked = command.locked;
        next.hvac_mode = command.hvac_mode;
        next.fan_mode = command.fan_mode;
        next.swing_mode = command.swing_mode;
        next.target_temperature = command.target_temperature;
        next.provisional = true;

        debug!(unit = %self.unit_id, "optimistic update from command");

        self.commit(next)
    }

    /// Note a failed status request. Returns the number of consecutive failures.
    pub fn record_failure(&mut self) -> u32 {
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);
        self.consecutive_failures
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    /// When the last authoritative frame was applied.
    pub fn last_seen(&self) -> Option<Instant> {
        self.last_seen
    }

    /// `true` once the unit has reported at least once.
    pub fn is_available(&self) -> bool {
        self.last_raw_frame.is_some()
    }

    /// Available, and the last report is younger than `stale_after`.
    pub fn is_fresh(&self, stale_after: Duration) -> bool {
        self.is_available() && self.last_seen.map_or(false, |seen| seen.elapsed() < stale_after)
    }

    /// The opermode byte for the state as currently known.
    pub fn opermode(&self) -> OperModeByte {
        OperModeByte::new(self.hvac_mode, self.swing_mode, self.fan_mode)
    }

    /// Build a command for this unit.
    ///
    /// The lock is carried over from the current state, as is the swing mode
    /// unless one is given. Asking for `HvacMode::Off` turns the unit off
    /// and keeps its current mode.
    pub fn build_control(
        &self,
        power: bool,
        hvac_mode: HvacMode,
        target_temperature: u8,
        fan_mode: FanMode,
        swing_mode: Option<SwingMode>,
    ) -> Result<ControlCommand, DecodeError> {
        let (power, hvac_mode) = match hvac_mode {
            HvacMode::Off => (false, self.hvac_mode),
            mode => (power, mode),
        };

        Ok(ControlCommand {
            unit_id: self.unit_id,
            power,
            locked: self.locked,
            hvac_mode,
            fan_mode,
            swing_mode: swing_mode.unwrap_or(self.swing_mode),
            target_temperature: TargetTemperature::new(target_temperature)?,
        })
    }

    pub fn snapshot(&self, stale_after: Duration) -> DeviceSnapshot {
        DeviceSnapshot {
            available: self.is_fresh(stale_after),
            state: self.clone(),
        }
    }
}


impl fmt::Display for DeviceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let power = if self.power { "on" } else { "off" };

        write!(f, "unit {}: {power} {} {}C fan {} swing {}",
            self.unit_id, self.hvac_mode, self.target_temperature.celsius(), self.fan_mode, self.swing_mode)?;

        if self.locked {
            write!(f, " locked")?;
        }

        if let Some(celsius) = self.current_temperature.celsius() {
            write!(f, ", room {celsius:.1}C")?;
        }

        if self.error_code != 0 {
            write!(f, ", error {:#04x}", self.error_code)?;
        }

        if self.filter_alarm {
            write!(f, ", clean filter")?;
        }

        Ok(())
    }
}


/// Read-only copy of a unit's state handed to collaborators.
#[derive(Clone, Debug)]
pub struct DeviceSnapshot {
    pub state: DeviceState,

    /// The unit has reported, recently enough to be trusted.
    pub available: bool,
}

impl DeviceSnapshot {
    pub fn unit_id(&self) -> UnitId {
        self.state.unit_id
    }
}


#[cfg(test)]
mod tests {
    use crate::protocol::{PacketCodec, StatusReport};

    use super::*;

    fn unit(id: u8) -> UnitId {
        UnitId::new(id).unwrap()
    }

    fn report(unit_id: UnitId) -> StatusReport {
        StatusReport {
            settings: ControlCommand {
                unit_id,
                power: true,
                locked: false,
                hvac_mode: HvacMode::Heat,
                fan_mode: FanMode::Auto,
                swing_mode: SwingMode::Fix,
                target_temperature: TargetTemperature::new(27).unwrap(),
            },
            current_temperature: Reading::from_sensor_byte(120),
            pipe1_temperature: Reading::from_sensor_byte(90),
            pipe2_temperature: Reading::from_sensor_byte(93),
            outdoor_temperature: Reading::from_sensor_byte(150),
            error_code: 0,
            filter_alarm: false,
        }
    }

    fn parsed(report: &StatusReport) -> ParsedFrame {
        let codec = PacketCodec::default();
        codec.decode(&codec.encode_status_report(report).unwrap()).unwrap()
    }

    #[test]
    fn test_defaults() {
        let state = DeviceState::new(unit(1));

        assert!(!state.power);
        assert_eq!(state.hvac_mode, HvacMode::Off);
        assert_eq!(state.target_temperature.celsius(), 24);
        assert_eq!(state.fan_mode, FanMode::Auto);
        assert_eq!(state.swing_mode, SwingMode::Fix);
        assert!(!state.is_available());
        assert!(!state.is_fresh(Duration::from_secs(60)));
    }

    #[test]
    fn test_apply_twice_is_idempotent() {
        let mut state = DeviceState::new(unit(1));
        let frame = parsed(&report(unit(1)));

        assert_eq!(state.apply(&frame), ApplyOutcome::Changed);
        assert_eq!(state.apply(&frame), ApplyOutcome::Unchanged);

        assert!(state.power);
        assert_eq!(state.hvac_mode, HvacMode::Heat);
        assert_eq!(state.target_temperature.celsius(), 27);
        assert_eq!(state.last_raw_frame.as_ref(), Some(&frame.raw));
        assert!(state.is_fresh(Duration::from_secs(60)));

        assert_eq!(state.to_string(), "unit 01: on heat 27C fan auto swing fix, room 24.0C");
    }

    #[test]
    fn test_first_identical_report_still_changes_availability() {
        // a report matching the defaults is still the first sign of life
        let mut report = report(unit(1));
        report.settings.power = false;
        report.settings.hvac_mode = HvacMode::Off;
        report.settings.target_temperature = TargetTemperature::default();
        report.current_temperature = Reading::NotReported;
        report.pipe1_temperature = Reading::NotReported;
        report.pipe2_temperature = Reading::NotReported;
        report.outdoor_temperature = Reading::NotReported;

        let mut state = DeviceState::new(unit(1));
        assert_eq!(state.apply(&parsed(&report)), ApplyOutcome::Changed);
        assert!(state.is_available());
    }

    #[test]
    fn test_not_reported_keeps_previous_reading() {
        let mut state = DeviceState::new(unit(1));
        state.apply(&parsed(&report(unit(1))));

        let mut quiet = report(unit(1));
        quiet.current_temperature = Reading::from_sensor_byte(40);

        assert_eq!(state.apply(&parsed(&quiet)), ApplyOutcome::Unchanged);
        assert_eq!(state.current_temperature, Reading::Celsius(24.0));

        let mut hot = report(unit(1));
        hot.current_temperature = Reading::from_sensor_byte(41);
        assert_eq!(state.apply(&parsed(&hot)), ApplyOutcome::Changed);
        assert!((state.current_temperature.celsius().unwrap() - 50.33).abs() < 0.01);
    }

    #[test]
    fn test_out_of_range_target_keeps_previous_value() {
        let codec = PacketCodec::default();
        let mut state = DeviceState::new(unit(1));
        state.apply(&parsed(&report(unit(1))));

        let mut raw = codec.encode_status_report(&report(unit(1))).unwrap().to_vec();
        raw[crate::protocol::layout::COMPACT_REV_A.target] = 0x20;
        raw[15] = crate::protocol::codec::checksum(&raw[..15]);

        let frame = codec.decode(&raw).unwrap();
        assert_eq!(frame.target_temperature, None);

        state.apply(&frame);
        assert_eq!(state.target_temperature.celsius(), 27);
    }

    #[test]
    fn test_rejects_other_units_and_non_reports() {
        let mut state = DeviceState::new(unit(1));

        let outcome = state.apply(&parsed(&report(unit(2))));
        assert_eq!(
            outcome,
            ApplyOutcome::Rejected(DecodeError::UnitIdMismatch { expected: unit(1), actual: unit(2) })
        );

        let codec = PacketCodec::default();
        let request = codec.decode(&codec.encode_status_request(unit(1), state.opermode()).unwrap()).unwrap();
        assert!(matches!(state.apply(&request), ApplyOutcome::Rejected(DecodeError::UnexpectedKind(0xa3))));

        assert!(!state.is_available());
    }

    #[test]
    fn test_legacy_frame_keeps_lock_and_swing() {
        let mut state = DeviceState::new(unit(1));

        let mut locked = report(unit(1));
        locked.settings.locked = true;
        locked.settings.swing_mode = SwingMode::Auto;
        state.apply(&parsed(&locked));

        let legacy = [0x80, 0x00, 0xb0, 0x0c, 0x01, 0x00, 0x02, 0x18, 0x17, 0x01, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00];
        let frame = PacketCodec::default().decode(&legacy).unwrap();

        assert_eq!(state.apply(&frame), ApplyOutcome::Changed);
        assert!(!state.power);
        assert_eq!(state.hvac_mode, HvacMode::Cool);
        assert_eq!(state.fan_mode, FanMode::Medium);
        assert!(state.locked);
        assert_eq!(state.swing_mode, SwingMode::Auto);
        assert_eq!(state.current_temperature, Reading::Celsius(23.0));
        assert_eq!(state.pipe1_temperature, Reading::Celsius(34.0));
    }

    #[test]
    fn test_authoritative_frame_replaces_optimistic_write() {
        let mut state = DeviceState::new(unit(1));
        let frame = parsed(&report(unit(1)));
        state.apply(&frame);

        let command = state.build_control(false, HvacMode::Heat, 27, FanMode::Auto, None).unwrap();
        assert_eq!(state.apply_optimistic(&command), ApplyOutcome::Changed);
        assert!(!state.power);
        assert!(state.provisional);

        // the unit never acted: the same report comes back
        assert_eq!(state.apply(&frame), ApplyOutcome::Changed);
        assert!(state.power);
        assert!(!state.provisional);

        // the unit did act: the report matches, but the state is no longer provisional
        state.apply_optimistic(&command);
        let mut off = report(unit(1));
        off.settings.power = false;
        assert_eq!(state.apply(&parsed(&off)), ApplyOutcome::Changed);
        assert!(!state.power);
        assert!(!state.provisional);
    }

    #[test]
    fn test_build_control_defaults() {
        let mut state = DeviceState::new(unit(1));

        let mut locked = report(unit(1));
        locked.settings.locked = true;
        locked.settings.swing_mode = SwingMode::Auto;
        state.apply(&parsed(&locked));

        let command = state.build_control(true, HvacMode::Cool, 22, FanMode::High, None).unwrap();
        assert!(command.locked);
        assert_eq!(command.swing_mode, SwingMode::Auto);
        assert_eq!(command.target_temperature.celsius(), 22);

        let command = state.build_control(true, HvacMode::Cool, 22, FanMode::High, Some(SwingMode::Fix)).unwrap();
        assert_eq!(command.swing_mode, SwingMode::Fix);

        let command = state.build_control(true, HvacMode::Off, 22, FanMode::High, None).unwrap();
        assert!(!command.power);
        assert_eq!(command.hvac_mode, HvacMode::Heat);

        assert_eq!(
            state.build_control(true, HvacMode::Cool, 31, FanMode::High, None),
            Err(DecodeError::FieldOutOfRange { field: "target temperature", value: 31 })
        );
    }

    #[test]
    fn test_failures_do_not_touch_state() {
        let mut state = DeviceState::new(unit(1));
        state.apply(&parsed(&report(unit(1))));

        assert_eq!(state.record_failure(), 1);
        assert_eq!(state.record_failure(), 2);
        assert!(state.is_fresh(Duration::from_secs(60)));

        state.apply(&parsed(&report(unit(1))));
        assert_eq!(state.consecutive_failures(), 0);

        assert!(!state.snapshot(Duration::ZERO).available);
        assert!(state.snapshot(Duration::from_secs(60)).available);
    }
}
