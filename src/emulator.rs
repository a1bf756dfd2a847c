//! Software indoor units that answer the wire protocol.
//!
//! Used by the `unitemu` binary, and by tests that need something on the
//! other end of a socket.

use std::{collections::BTreeMap, sync::Arc};

use anyhow::Result;
use bytes::Bytes;
use futures::StreamExt;
use parking_lot::Mutex;
use tokio::{io::AsyncWriteExt, net::{TcpListener, TcpStream}};
use tokio_util::codec::FramedRead;
use tracing::{debug, info, trace, warn};

use crate::protocol::{
    codec::{is_broadcast_request, FrameSplitter},
    ControlCommand, FanMode, FrameKind, HvacMode, PacketCodec, Reading, StatusReport, SwingMode, TargetTemperature,
    UnitId,
};


/// A powered-off unit at the default setpoint in a 24C room.
pub fn idle_report(unit_id: UnitId) -> StatusReport {
    StatusReport {
        settings: ControlCommand {
            unit_id,
            power: false,
            locked: false,
            hvac_mode: HvacMode::Cool,
            fan_mode: FanMode::Auto,
            swing_mode: SwingMode::Fix,
            target_temperature: TargetTemperature::default(),
        },
        current_temperature: Reading::Celsius(24.0),
        pipe1_temperature: Reading::Celsius(22.0),
        pipe2_temperature: Reading::Celsius(22.0),
        outdoor_temperature: Reading::Celsius(15.0),
        error_code: 0,
        filter_alarm: false,
    }
}


pub struct UnitEmulator {
    codec: PacketCodec,
    units: BTreeMap<UnitId, StatusReport>,
}

impl UnitEmulator {
    pub fn new(codec: PacketCodec, units: impl IntoIterator<Item = UnitId>) -> Self {
        Self {
            codec,
            units: units.into_iter().map(|unit_id| (unit_id, idle_report(unit_id))).collect(),
        }
    }

    pub fn insert(&mut self, report: StatusReport) {
        self.units.insert(report.settings.unit_id, report);
    }

    pub fn report(&self, unit_id: UnitId) -> Option<&StatusReport> {
        self.units.get(&unit_id)
    }

    pub fn report_mut(&mut self, unit_id: UnitId) -> Option<&mut StatusReport> {
        self.units.get_mut(&unit_id)
    }

    /// The frames a bus of these units sends in answer to `raw`.
    pub fn handle(&mut self, raw: &[u8]) -> Vec<Bytes> {
        if is_broadcast_request(raw) {
            debug!("broadcast status request");
            return self.units.values()
                .filter_map(|report| encode_report(&self.codec, report))
                .collect();
        }

        let frame = match self.codec.decode(raw) {
            Ok(frame) => frame,
            Err(err) => {
                debug!("ignoring frame {}: {err}", hex::encode(raw));
                return Vec::new();
            }
        };

        let codec = self.codec;
        let Some(report) = self.units.get_mut(&frame.unit_id) else {
            trace!(unit = %frame.unit_id, "frame for a unit not on this bus");
            return Vec::new();
        };

        match frame.kind {
            FrameKind::StatusRequest => {
                debug!(unit = %frame.unit_id, "status request");
            },
            FrameKind::Control => match frame.control() {
                Some(command) => {
                    info!(unit = %frame.unit_id, ?command, "control");
                    report.settings = command;
                },
                None => {
                    warn!(unit = %frame.unit_id, "control frame without a full command, ignored");
                    return Vec::new();
                }
            },
            FrameKind::StatusReport | FrameKind::Other(_) => return Vec::new(),
        }

        encode_report(&codec, report).into_iter().collect()
    }
}

fn encode_report(codec: &PacketCodec, report: &StatusReport) -> Option<Bytes> {
    codec.encode_status_report(report)
        .map_err(|err| warn!(unit = %report.settings.unit_id, "report not encoded: {err}"))
        .ok()
}


/// Answer requests on `listener` until it fails.
pub async fn serve(listener: TcpListener, emulator: Arc<Mutex<UnitEmulator>>) -> Result<()> {
    loop {
        let (socket, addr) = listener.accept().await?;
        socket.set_nodelay(true)?;

        debug!("connection from {addr}");

        let emulator = emulator.clone();
        tokio::spawn(async move {
            if let Err(err) = answer(socket, emulator).await {
                warn!("connection from {addr} failed: {err}");
            }
        });
    }
}

async fn answer(socket: TcpStream, emulator: Arc<Mutex<UnitEmulator>>) -> Result<()> {
    let (rx, mut tx) = socket.into_split();
    let mut frames = FramedRead::new(rx, FrameSplitter);

    while let Some(frame) = frames.next().await {
        let replies = emulator.lock().handle(&frame?);

        for reply in replies {
            tx.write_all(&reply).await?;
        }
    }

    Ok(())
}
