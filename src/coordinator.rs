use std::{collections::BTreeMap, sync::Arc, time::Duration};

use async_broadcast::Receiver;
use parking_lot::Mutex;
use thiserror::Error;
use tokio::{
    sync::Notify,
    time::{interval, sleep, MissedTickBehavior},
};
use tracing::{debug, info, trace, warn};

use crate::{
    bus::{Change, ChangeBus},
    config::PollSettings,
    device::{ApplyOutcome, DeviceSnapshot, DeviceState},
    protocol::{ControlCommand, DecodeError, FanMode, HvacMode, PacketCodec, SwingMode, UnitId},
    transport::{Delivered, Delivery, Inbound, Transport, TransportError},
};


const CHANGE_CAPACITY: usize = 64;


#[derive(Error, Debug)]
pub enum CommandError {
    #[error("unit {0} is not managed by this bridge")]
    UnknownUnit(UnitId),

    #[error(transparent)]
    Invalid(#[from] DecodeError),
}


/// State shared with the transport's receive handler.
struct Shared {
    codec: PacketCodec,
    devices: BTreeMap<UnitId, Mutex<DeviceState>>,
    changes: ChangeBus,
    stale_after: Duration,
}

impl Shared {
    fn device(&self, unit_id: UnitId) -> Option<&Mutex<DeviceState>> {
        self.devices.get(&unit_id)
    }

    /// Decode `payload` and apply it to `unit_id`'s state.
    ///
    /// `None` if the unit is not managed.
    fn ingest(&self, unit_id: UnitId, payload: &[u8]) -> Option<ApplyOutcome> {
        let device = self.device(unit_id)?;

        let frame = match self.codec.decode(payload) {
            Ok(frame) => frame,
            Err(err) => {
                warn!(unit = %unit_id, "dropping frame {}: {err}", hex::encode(payload));
                return Some(ApplyOutcome::Rejected(err));
            }
        };

        let mut state = device.lock();
        let outcome = state.apply(&frame);

        match &outcome {
            ApplyOutcome::Changed => {
                info!(unit = %unit_id, power = state.power, mode = %state.hvac_mode, target = state.target_temperature.celsius(), "state changed");
                self.notify(&state);
            },
            ApplyOutcome::Unchanged => trace!(unit = %unit_id, "state unchanged"),
            ApplyOutcome::Rejected(DecodeError::UnexpectedKind(kind)) => {
                trace!(unit = %unit_id, "ignoring frame of kind {kind:#04x}");
            },
            ApplyOutcome::Rejected(err) => warn!(unit = %unit_id, "frame rejected: {err}"),
        }

        Some(outcome)
    }

    fn notify(&self, state: &DeviceState) {
        self.changes.publish(Change {
            unit_id: state.unit_id,
            snapshot: state.snapshot(self.stale_after),
        });
    }
}


/// Owns the state of every configured unit and the transport that reaches them.
///
/// With a reply transport, every poll is a request/response cycle per unit,
/// in unit order. With a push transport, a poll is a single broadcast request
/// and the answers arrive through the receive handler. Either way each
/// `Changed` outcome is published once on the change bus.
pub struct Coordinator {
    shared: Arc<Shared>,
    transport: Arc<dyn Transport>,
    settings: PollSettings,
    refresh_requested: Notify,
}

impl Coordinator {
    pub fn new(units: &[UnitId], transport: Arc<dyn Transport>, codec: PacketCodec, settings: PollSettings) -> Self {
        let shared = Arc::new(Shared {
            codec,
            devices: units.iter()
                .map(|unit_id| (*unit_id, Mutex::new(DeviceState::new(*unit_id))))
                .collect(),
            changes: ChangeBus::new(CHANGE_CAPACITY),
            stale_after: settings.stale_after,
        });

        {
            let shared = shared.clone();

            transport.set_receive_handler(Arc::new(move |inbound: Inbound| {
                if shared.ingest(inbound.unit_id, &inbound.payload).is_none() {
                    trace!(unit = %inbound.unit_id, "frame for a unit not managed here");
                }
            }));
        }

        Self {
            shared,
            transport,
            settings,
            refresh_requested: Notify::new(),
        }
    }

    pub fn units(&self) -> impl Iterator<Item = UnitId> + '_ {
        self.shared.devices.keys().copied()
    }

    pub fn settings(&self) -> &PollSettings {
        &self.settings
    }

    /// Connect the transport and run the first refresh.
    ///
    /// On a push transport the first refresh asks each unit in turn, spaced
    /// by the stagger delay, after letting the session settle.
    pub async fn start(&self) -> Result<(), TransportError> {
        self.transport.connect().await?;

        info!(units = self.shared.devices.len(), "transport connected");

        match self.transport.delivery() {
            Delivery::Reply => self.refresh().await,
            Delivery::Push => {
                sleep(self.settings.settle).await;

                for (idx, unit_id) in self.units().enumerate() {
                    if idx > 0 {
                        sleep(self.settings.stagger).await;
                    }

                    if let Err(err) = self.request_status(unit_id).await {
                        warn!(unit = %unit_id, "initial status request failed: {err}");
                    }
                }
            }
        }

        Ok(())
    }

    /// Refresh every scan interval, or sooner when asked. Never returns.
    pub async fn run(&self) {
        let mut ticker = interval(self.settings.scan_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        // the first tick is immediate, and start() has just refreshed
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = ticker.tick() => (),
                _ = self.refresh_requested.notified() => {
                    debug!("refresh requested");
                    ticker.reset();
                }
            }

            self.refresh().await;
        }
    }

    /// Ask [`Coordinator::run`] to refresh now.
    pub fn request_refresh(&self) {
        self.refresh_requested.notify_one();
    }

    /// One poll cycle.
    pub async fn refresh(&self) {
        match self.transport.delivery() {
            Delivery::Reply => {
                for unit_id in self.units() {
                    self.poll_unit(unit_id).await;
                }
            },
            Delivery::Push => {
                let frame = match self.shared.codec.encode_broadcast_status_request() {
                    Ok(frame) => frame,
                    Err(err) => {
                        warn!("broadcast status request not encoded: {err}");
                        return;
                    }
                };

                match self.transport.send(frame).await {
                    Ok(_) => debug!("broadcast status request sent"),
                    Err(err) => warn!("broadcast status request failed: {err}"),
                }
            }
        }
    }

    async fn request_status(&self, unit_id: UnitId) -> Result<Delivered, TransportError> {
        let opermode = match self.shared.device(unit_id) {
            Some(device) => device.lock().opermode(),
            None => return Err(TransportError::NotConnected),
        };

        let frame = self.shared.codec.encode_status_request(unit_id, opermode)?;
        self.transport.send(frame).await
    }

    async fn poll_unit(&self, unit_id: UnitId) {
        let failed = match self.request_status(unit_id).await {
            Ok(Delivered::Reply(reply)) => {
                matches!(self.shared.ingest(unit_id, &reply), Some(ApplyOutcome::Rejected(_)))
            },
            Ok(Delivered::Published) => false,
            Err(err) => {
                warn!(unit = %unit_id, "status request failed: {err}");
                true
            }
        };

        if failed {
            if let Some(device) = self.shared.device(unit_id) {
                let failures = device.lock().record_failure();
                debug!(unit = %unit_id, failures, "poll failed");
            }
        }
    }

    pub fn devices(&self) -> BTreeMap<UnitId, DeviceSnapshot> {
        self.shared.devices.iter()
            .map(|(unit_id, device)| (*unit_id, device.lock().snapshot(self.settings.stale_after)))
            .collect()
    }

    pub fn device(&self, unit_id: UnitId) -> Option<DeviceSnapshot> {
        self.shared.device(unit_id)
            .map(|device| device.lock().snapshot(self.settings.stale_after))
    }

    /// Change notifications, one per `Changed` outcome.
    pub fn subscribe(&self) -> Receiver<Change> {
        self.shared.changes.subscribe()
    }

    /// Build a command for `unit_id` from its current state.
    pub fn build_control(
        &self,
        unit_id: UnitId,
        power: bool,
        hvac_mode: HvacMode,
        target_temperature: u8,
        fan_mode: FanMode,
        swing_mode: Option<SwingMode>,
    ) -> Result<ControlCommand, CommandError> {
        let device = self.shared.device(unit_id).ok_or(CommandError::UnknownUnit(unit_id))?;

        let command = device.lock().build_control(power, hvac_mode, target_temperature, fan_mode, swing_mode)?;
        Ok(command)
    }

    /// Send `command` once. `true` when the transport reports success.
    ///
    /// On success the commanded fields are written to the unit's state
    /// ahead of its next report. Failures are never retried.
    pub async fn send_command(&self, unit_id: UnitId, command: ControlCommand) -> bool {
        if command.unit_id != unit_id {
            warn!(unit = %unit_id, "command addressed to unit {}, not sent", command.unit_id);
            return false;
        }

        let Some(device) = self.shared.device(unit_id) else {
            warn!(unit = %unit_id, "unit not managed, command not sent");
            return false;
        };

        let frame = match self.shared.codec.encode_control(&command) {
            Ok(frame) => frame,
            Err(err) => {
                warn!(unit = %unit_id, "command not encoded: {err}");
                return false;
            }
        };

        match self.transport.send(frame).await {
            Ok(Delivered::Reply(reply)) if reply.is_empty() => {
                warn!(unit = %unit_id, "command got an empty reply");
                return false;
            },
            Ok(delivered) => {
                if let Delivered::Reply(reply) = delivered {
                    trace!(unit = %unit_id, "command acknowledged with {}", hex::encode(&reply));
                }
            },
            Err(err) => {
                warn!(unit = %unit_id, "command failed: {err}");
                return false;
            }
        }

        {
            let mut state = device.lock();

            // the next report must get through even if it repeats the last one;
            // reports routed from here on wait for the optimistic write
            self.transport.forget(unit_id);

            if state.apply_optimistic(&command).is_changed() {
                self.shared.notify(&state);
            }
        }

        info!(unit = %unit_id, ?command, "command sent");
        true
    }

    pub async fn shutdown(&self) -> Result<(), TransportError> {
        self.transport.disconnect().await?;
        info!("transport disconnected");
        Ok(())
    }
}
