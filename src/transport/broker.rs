use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use rumqttc::{AsyncClient, Event, EventLoop, MqttOptions, Outgoing, Packet, QoS, SubscribeFilter};
use tokio::{sync::watch, task::JoinHandle, time::{sleep, timeout}};
use tracing::{debug, error, info, trace, warn};

use crate::{
    config::Topics,
    protocol::{codec::peek_unit_id, layout::FRAME_LEN, UnitId},
};

use super::{Delivered, Delivery, Inbound, ReceiveHandler, Transport, TransportError};


const KEEP_ALIVE: Duration = Duration::from_secs(60);
const RECONNECT_DELAY: Duration = Duration::from_secs(1);
const REQUEST_CAPACITY: usize = 16;


/// Broker options for `host:port`, with a random client id.
pub fn mqtt_options(host: &str, port: u16, credentials: Option<(String, String)>) -> MqttOptions {
    let client_id = format!("lgac2mqtt-{:08x}", rand::random::<u32>());

    let mut options = MqttOptions::new(client_id, host, port);
    options.set_keep_alive(KEEP_ALIVE);
    options.set_clean_session(true);

    if let Some((user, password)) = credentials {
        options.set_credentials(user, password);
    }

    options
}


/// What [`InboundRouter::route`] did with a message.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Routed {
    Delivered(UnitId),

    /// Same payload as the previous one for this unit.
    Duplicate(UnitId),

    /// Not a frame for any unit.
    Ignored,
}


/// Attributes broker messages to units and drops repeats.
///
/// Frames on the receive topic are raw binary and carry their unit id.
/// Frames on a state topic are hex text and belong to the unit named by
/// the topic. Either way a payload identical to the last one delivered for
/// the same unit is not delivered again.
pub struct InboundRouter {
    topics: Topics,
    handler: RwLock<Option<ReceiveHandler>>,
    last_seen: Mutex<HashMap<UnitId, Bytes>>,
}

impl InboundRouter {
    pub fn new(topics: Topics) -> Self {
        Self {
            topics,
            handler: RwLock::new(None),
            last_seen: Mutex::new(HashMap::new()),
        }
    }

    pub fn topics(&self) -> &Topics {
        &self.topics
    }

    pub fn set_handler(&self, handler: ReceiveHandler) {
        *self.handler.write() = Some(handler);
    }

    pub fn forget(&self, unit_id: UnitId) {
        self.last_seen.lock().remove(&unit_id);
    }

    pub fn route(&self, topic: &str, payload: &[u8]) -> Result<Routed, TransportError> {
        let invalid = |reason: String| TransportError::InvalidPayload { topic: topic.to_string(), reason };

        let (unit_id, frame) = if topic == self.topics.recv {
            if payload.len() < FRAME_LEN {
                return Err(invalid(format!("{} bytes, need {FRAME_LEN}", payload.len())));
            }

            match peek_unit_id(payload) {
                Some(unit_id) => (unit_id, Bytes::copy_from_slice(&payload[..FRAME_LEN])),
                None => return Ok(Routed::Ignored),
            }
        } else if let Some(unit_id) = self.topics.unit_for_state_topic(topic) {
            let text = std::str::from_utf8(payload)
                .map_err(|err| invalid(err.to_string()))?;

            let mut frame = hex::decode(text.trim())
                .map_err(|err| invalid(err.to_string()))?;
            frame.truncate(FRAME_LEN);

            (unit_id, Bytes::from(frame))
        } else {
            return Ok(Routed::Ignored);
        };

        {
            let mut last_seen = self.last_seen.lock();

            if last_seen.get(&unit_id) == Some(&frame) {
                return Ok(Routed::Duplicate(unit_id));
            }

            last_seen.insert(unit_id, frame.clone());
        }

        match self.handler.read().as_ref() {
            Some(handler) => handler(Inbound { unit_id, payload: frame }),
            None => debug!(unit = %unit_id, "no receive handler, frame dropped"),
        }

        Ok(Routed::Delivered(unit_id))
    }
}


struct Session {
    client: AsyncClient,
    task: JoinHandle<()>,
}


/// Publish/subscribe session with a broker.
///
/// Outbound frames are published hex-encoded on the send topic. Inbound
/// frames arrive on the shared receive topic and on one state topic per
/// unit, and reach the receive handler through an [`InboundRouter`].
pub struct BrokerTransport {
    options: MqttOptions,
    topics: Topics,
    subscriptions: Vec<String>,
    connect_timeout: Duration,
    router: Arc<InboundRouter>,
    connected: Arc<AtomicBool>,
    session: Mutex<Option<Session>>,
}

impl BrokerTransport {
    pub fn new(options: MqttOptions, topics: Topics, units: &[UnitId], connect_timeout: Duration) -> Self {
        let subscriptions = std::iter::once(topics.recv.clone())
            .chain(units.iter().map(|unit_id| topics.state_topic(*unit_id)))
            .collect();

        Self {
            options,
            router: Arc::new(InboundRouter::new(topics.clone())),
            topics,
            subscriptions,
            connect_timeout,
            connected: Arc::new(AtomicBool::new(false)),
            session: Mutex::new(None),
        }
    }

    pub fn router(&self) -> &Arc<InboundRouter> {
        &self.router
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn broker_addr(&self) -> String {
        let (host, port) = self.options.broker_address();
        format!("{host}:{port}")
    }

    fn client(&self) -> Option<AsyncClient> {
        self.session.lock().as_ref().map(|session| session.client.clone())
    }
}

/// Drive the broker connection until the client disconnects.
///
/// Every connection acknowledgement (re)subscribes all topics: the session
/// is clean, so the broker forgets them on every reconnect.
async fn event_loop(
    mut eventloop: EventLoop,
    client: AsyncClient,
    subscriptions: Vec<String>,
    router: Arc<InboundRouter>,
    connected: Arc<AtomicBool>,
    ready: watch::Sender<bool>,
) {
    loop {
        match eventloop.poll().await {
            Ok(Event::Incoming(Packet::ConnAck(ack))) => {
                info!("connected to broker ({:?})", ack.code);
                connected.store(true, Ordering::SeqCst);

                let filters = subscriptions.iter()
                    .map(|topic| SubscribeFilter::new(topic.clone(), QoS::AtMostOnce));

                if let Err(err) = client.try_subscribe_many(filters) {
                    error!("failed to subscribe: {err}");
                }

                ready.send_replace(true);
            },
            Ok(Event::Incoming(Packet::Publish(publish))) => {
                trace!(topic = %publish.topic, "received {}", hex::encode(&publish.payload));

                match router.route(&publish.topic, &publish.payload) {
                    Ok(Routed::Delivered(unit_id)) => debug!(unit = %unit_id, topic = %publish.topic, "frame delivered"),
                    Ok(Routed::Duplicate(unit_id)) => trace!(unit = %unit_id, "duplicate frame suppressed"),
                    Ok(Routed::Ignored) => trace!(topic = %publish.topic, "message ignored"),
                    Err(err) => warn!("dropping message: {err}"),
                }
            },
            Ok(Event::Outgoing(Outgoing::Disconnect)) => {
                connected.store(false, Ordering::SeqCst);
                debug!("broker session closed");
                break;
            },
            Ok(_) => (),
            Err(err) => {
                if connected.swap(false, Ordering::SeqCst) {
                    error!("broker connection lost: {err}");
                } else {
                    warn!("broker connection failed: {err}");
                }

                sleep(RECONNECT_DELAY).await;
            }
        }
    }
}

#[async_trait]
impl Transport for BrokerTransport {
    fn delivery(&self) -> Delivery {
        Delivery::Push
    }

    async fn connect(&self) -> Result<(), TransportError> {
        if self.session.lock().is_some() {
            return Ok(());
        }

        let (client, eventloop) = AsyncClient::new(self.options.clone(), REQUEST_CAPACITY);
        let (ready_send, mut ready_recv) = watch::channel(false);

        let task = tokio::spawn(event_loop(
            eventloop,
            client.clone(),
            self.subscriptions.clone(),
            self.router.clone(),
            self.connected.clone(),
            ready_send,
        ));

        let acknowledged = matches!(
            timeout(self.connect_timeout, ready_recv.wait_for(|ready| *ready)).await,
            Ok(Ok(_))
        );

        if !acknowledged {
            task.abort();

            return Err(TransportError::ConnectFailed {
                endpoint: self.broker_addr(),
                reason: format!("no connection acknowledgement within {:?}", self.connect_timeout),
            });
        }

        *self.session.lock() = Some(Session { client, task });
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), TransportError> {
        let Some(session) = self.session.lock().take() else {
            return Ok(());
        };

        if let Err(err) = session.client.try_disconnect() {
            warn!("failed to disconnect cleanly: {err}");
        }

        let mut task = session.task;
        if timeout(RECONNECT_DELAY, &mut task).await.is_err() {
            task.abort();
        }

        self.connected.store(false, Ordering::SeqCst);
        info!(broker = %self.broker_addr(), "disconnected from broker");

        Ok(())
    }

    async fn send(&self, frame: Bytes) -> Result<Delivered, TransportError> {
        let client = self.client().ok_or(TransportError::NotConnected)?;

        if !self.is_connected() {
            return Err(TransportError::NotConnected);
        }

        let payload = hex::encode_upper(&frame);

        client.publish(self.topics.send.as_str(), QoS::AtMostOnce, false, payload.as_bytes()).await
            .map_err(|err| TransportError::PublishFailed(err.to_string()))?;

        debug!(topic = %self.topics.send, "published {payload}");

        Ok(Delivered::Published)
    }

    fn set_receive_handler(&self, handler: ReceiveHandler) {
        self.router.set_handler(handler);
    }

    fn forget(&self, unit_id: UnitId) {
        self.router.forget(unit_id);
    }
}


#[cfg(test)]
mod tests {
    use bytes::BytesMut;
    use rumqttc::mqttbytes::v4::read;
    use tokio::{
        io::{AsyncReadExt, AsyncWriteExt},
        net::{TcpListener, TcpStream},
    };

    use crate::protocol::{ControlCommand, FanMode, HvacMode, PacketCodec, Reading, StatusReport, SwingMode, TargetTemperature};

    use super::*;

    const CONNACK_ACCEPTED: [u8; 4] = [0x20, 0x02, 0x00, 0x00];

    /// One client connection to an in-process broker.
    struct BrokerSide {
        socket: TcpStream,
        buffer: BytesMut,
    }

    impl BrokerSide {
        /// Accept a client and acknowledge its connect.
        async fn accept(listener: &TcpListener) -> Self {
            let (socket, _) = listener.accept().await.unwrap();
            let mut side = Self { socket, buffer: BytesMut::new() };

            assert!(matches!(side.next().await, Packet::Connect(_)));
            side.socket.write_all(&CONNACK_ACCEPTED).await.unwrap();

            side
        }

        async fn next(&mut self) -> Packet {
            loop {
                if let Ok(packet) = read(&mut self.buffer, 64 * 1024) {
                    return packet;
                }

                assert!(self.socket.read_buf(&mut self.buffer).await.unwrap() > 0, "client hung up");
            }
        }

        async fn subscribed_topics(&mut self) -> Vec<String> {
            loop {
                if let Packet::Subscribe(subscribe) = self.next().await {
                    return subscribe.filters.into_iter().map(|filter| filter.path).collect();
                }
            }
        }

        async fn published(&mut self) -> (String, Bytes) {
            loop {
                if let Packet::Publish(publish) = self.next().await {
                    return (publish.topic, publish.payload);
                }
            }
        }
    }

    fn unit(id: u8) -> UnitId {
        UnitId::new(id).unwrap()
    }

    fn report(unit_id: UnitId, target: u8) -> Bytes {
        PacketCodec::default().encode_status_report(&StatusReport {
            settings: ControlCommand {
                unit_id,
                power: true,
                locked: false,
                hvac_mode: HvacMode::Cool,
                fan_mode: FanMode::Low,
                swing_mode: SwingMode::Auto,
                target_temperature: TargetTemperature::new(target).unwrap(),
            },
            current_temperature: Reading::from_sensor_byte(117),
            pipe1_temperature: Reading::NotReported,
            pipe2_temperature: Reading::NotReported,
            outdoor_temperature: Reading::NotReported,
            error_code: 0,
            filter_alarm: false,
        }).unwrap()
    }

    fn recording_router() -> (InboundRouter, Arc<Mutex<Vec<Inbound>>>) {
        let router = InboundRouter::new(Topics::default());
        let received = Arc::new(Mutex::new(Vec::new()));

        let sink = received.clone();
        router.set_handler(Arc::new(move |inbound| sink.lock().push(inbound)));

        (router, received)
    }

    #[test]
    fn test_duplicate_payload_delivered_once() {
        let (router, received) = recording_router();
        let frame = report(unit(1), 22);

        assert_eq!(router.route("ew11b/recv", &frame).unwrap(), Routed::Delivered(unit(1)));
        assert_eq!(router.route("ew11b/recv", &frame).unwrap(), Routed::Duplicate(unit(1)));

        assert_eq!(received.lock().len(), 1);
        assert_eq!(received.lock()[0], Inbound { unit_id: unit(1), payload: frame.clone() });

        // a different unit, or a changed payload, goes through
        assert_eq!(router.route("ew11b/recv", &report(unit(2), 22)).unwrap(), Routed::Delivered(unit(2)));
        assert_eq!(router.route("ew11b/recv", &report(unit(1), 23)).unwrap(), Routed::Delivered(unit(1)));
        assert_eq!(router.route("ew11b/recv", &frame).unwrap(), Routed::Delivered(unit(1)));

        assert_eq!(received.lock().len(), 4);
    }

    #[test]
    fn test_forget_allows_repeat() {
        let (router, received) = recording_router();
        let frame = report(unit(3), 22);

        router.route("ew11b/recv", &frame).unwrap();
        router.forget(unit(3));
        assert_eq!(router.route("ew11b/recv", &frame).unwrap(), Routed::Delivered(unit(3)));

        assert_eq!(received.lock().len(), 2);
    }

    #[test]
    fn test_state_topic_hex_payload() {
        let (router, received) = recording_router();
        let frame = report(unit(4), 22);

        let text = format!("{}\n", hex::encode_upper(&frame));
        assert_eq!(router.route("lgac/state/04", text.as_bytes()).unwrap(), Routed::Delivered(unit(4)));
        assert_eq!(received.lock()[0].payload, frame);

        // the same frame seen on the receive topic is a repeat
        assert_eq!(router.route("ew11b/recv", &frame).unwrap(), Routed::Duplicate(unit(4)));

        assert!(matches!(
            router.route("lgac/state/04", b"not hex"),
            Err(TransportError::InvalidPayload { .. })
        ));
    }

    #[test]
    fn test_padding_and_junk() {
        let (router, received) = recording_router();
        let frame = report(unit(1), 22);

        let mut padded = frame.to_vec();
        padded.extend_from_slice(&[0x00, 0x00, 0x00]);
        router.route("ew11b/recv", &padded).unwrap();
        assert_eq!(received.lock()[0].payload, frame);

        assert!(matches!(router.route("ew11b/recv", &frame[..8]), Err(TransportError::InvalidPayload { .. })));
        assert_eq!(router.route("ew11b/recv", &[0x55; 16]).unwrap(), Routed::Ignored);
        assert_eq!(router.route("some/other/topic", &frame).unwrap(), Routed::Ignored);

        assert_eq!(received.lock().len(), 1);
    }

    #[test]
    fn test_routers_do_not_share_state() {
        let (first, first_received) = recording_router();
        let (second, second_received) = recording_router();
        let frame = report(unit(1), 22);

        first.route("ew11b/recv", &frame).unwrap();
        second.route("ew11b/recv", &frame).unwrap();

        assert_eq!(first_received.lock().len(), 1);
        assert_eq!(second_received.lock().len(), 1);
    }

    #[test]
    fn test_subscriptions() {
        let transport = BrokerTransport::new(
            mqtt_options("localhost", 1883, None),
            Topics::default(),
            &[unit(1), unit(2)],
            Duration::from_secs(1),
        );

        assert_eq!(transport.subscriptions, ["ew11b/recv", "lgac/state/01", "lgac/state/02"]);
        assert_eq!(transport.delivery(), Delivery::Push);
    }

    #[tokio::test]
    async fn test_resubscribe_and_publish_hex() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let transport = BrokerTransport::new(
            mqtt_options("127.0.0.1", port, None),
            Topics::default(),
            &[unit(1), unit(2)],
            Duration::from_secs(5),
        );

        let broker = tokio::spawn(async move {
            let mut first = BrokerSide::accept(&listener).await;
            let first_topics = first.subscribed_topics().await;

            // the broker restarts, forgetting every subscription
            drop(first);

            let mut second = BrokerSide::accept(&listener).await;
            let second_topics = second.subscribed_topics().await;

            (first_topics, second_topics, second)
        });

        transport.connect().await.unwrap();

        let (first_topics, second_topics, mut second) = timeout(Duration::from_secs(10), broker).await
            .unwrap()
            .unwrap();

        let expected = ["ew11b/recv", "lgac/state/01", "lgac/state/02"];
        assert_eq!(first_topics, expected);
        assert_eq!(second_topics, expected);

        while !transport.is_connected() {
            sleep(Duration::from_millis(10)).await;
        }

        let frame = report(unit(2), 24);
        assert_eq!(transport.send(frame.clone()).await.unwrap(), Delivered::Published);

        let (topic, payload) = timeout(Duration::from_secs(5), second.published()).await.unwrap();
        assert_eq!(topic, "lgac/scan");
        assert_eq!(payload, Bytes::from(hex::encode_upper(&frame)));

        transport.disconnect().await.unwrap();
    }

    #[tokio::test]
    async fn test_send_requires_session() {
        let transport = BrokerTransport::new(
            mqtt_options("localhost", 1883, None),
            Topics::default(),
            &[unit(1)],
            Duration::from_secs(1),
        );

        let result = transport.send(report(unit(1), 22)).await;
        assert!(matches!(result, Err(TransportError::NotConnected)));
    }

    #[tokio::test]
    async fn test_connect_without_broker_fails() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let transport = BrokerTransport::new(
            mqtt_options("127.0.0.1", port, None),
            Topics::default(),
            &[unit(1)],
            Duration::from_millis(300),
        );

        let result = transport.connect().await;
        assert!(matches!(result, Err(TransportError::ConnectFailed { .. })), "{result:?}");
        assert!(!transport.is_connected());
    }
}
