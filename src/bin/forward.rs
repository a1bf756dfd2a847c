use std::sync::Arc;

use anyhow::{bail, Result};
use clap::Parser;
use lgac2mqtt::{
    config::{init_logging, Endpoint, TopicArgs, Topics, DEFAULT_GATEWAY_SEND_TOPIC},
    transport::{broker::mqtt_options, Inbound, InboundRouter, Routed},
};
use rumqttc::{AsyncClient, Event, Packet, QoS, SubscribeFilter};
use tracing::{debug, error, info, trace, warn};
use url::Url;


/// Forwards frames between the bridge's hex topics and a serial gateway's binary topics
///
/// Hex frames on the send topic are written to the gateway. Binary frames
/// from the gateway are republished as hex on the unit's state topic, unless
/// they repeat the last frame forwarded for that unit.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// URL of the broker, mqtt://[user[:password]@]host[:port]
    #[arg(env = "LGAC_ENDPOINT")]
    broker: Url,

    #[command(flatten)]
    topics: TopicArgs,

    /// Topic the serial gateway takes raw frames from
    #[arg(long, env = "LGAC_GATEWAY_SEND_TOPIC", default_value = DEFAULT_GATEWAY_SEND_TOPIC)]
    gateway_send_topic: String,
}


#[tokio::main]
async fn main() -> Result<()> {
    init_logging("info");

    let args = Args::parse();

    let Endpoint::Broker { host, port, credentials } = Endpoint::from_url(&args.broker)? else {
        bail!("the forwarder needs an mqtt:// url, got {}", args.broker);
    };

    let topics = Topics::from(args.topics);
    let (client, mut eventloop) = AsyncClient::new(mqtt_options(&host, port, credentials), 16);

    let router = InboundRouter::new(topics.clone());
    {
        let client = client.clone();
        let topics = topics.clone();

        router.set_handler(Arc::new(move |inbound: Inbound| {
            let topic = topics.state_topic(inbound.unit_id);
            let payload = hex::encode_upper(&inbound.payload);

            match client.try_publish(topic.as_str(), QoS::AtMostOnce, false, payload.as_bytes()) {
                Ok(()) => debug!(unit = %inbound.unit_id, "{payload} -> {topic}"),
                Err(err) => warn!(unit = %inbound.unit_id, "failed to publish to {topic}: {err}"),
            }
        }));
    }

    info!(broker = %args.broker, send = %topics.send, recv = %topics.recv, "forwarding");

    loop {
        let event = tokio::select! {
            event = eventloop.poll() => event,
            result = tokio::signal::ctrl_c() => {
                result?;
                break;
            }
        };

        match event {
            Ok(Event::Incoming(Packet::ConnAck(_))) => {
                info!("connected to broker");

                let filters = [&topics.send, &topics.recv].into_iter()
                    .map(|topic| SubscribeFilter::new(topic.clone(), QoS::AtMostOnce));

                if let Err(err) = client.try_subscribe_many(filters) {
                    error!("failed to subscribe: {err}");
                }
            },
            Ok(Event::Incoming(Packet::Publish(publish))) if publish.topic == topics.send => {
                let text = String::from_utf8_lossy(&publish.payload);

                match hex::decode(text.trim()) {
                    Ok(frame) => {
                        debug!("{} -> {}", text.trim(), args.gateway_send_topic);

                        if let Err(err) = client.try_publish(args.gateway_send_topic.as_str(), QoS::AtMostOnce, false, frame) {
                            warn!("failed to publish to {}: {err}", args.gateway_send_topic);
                        }
                    },
                    Err(err) => warn!("dropping {text:?} from {}: {err}", topics.send),
                }
            },
            Ok(Event::Incoming(Packet::Publish(publish))) => {
                match router.route(&publish.topic, &publish.payload) {
                    Ok(Routed::Duplicate(unit_id)) => trace!(unit = %unit_id, "unchanged, not forwarded"),
                    Ok(Routed::Ignored) => trace!(topic = %publish.topic, "message ignored"),
                    Ok(Routed::Delivered(_)) => (),
                    Err(err) => warn!("dropping message: {err}"),
                }
            },
            Ok(_) => (),
            Err(err) => {
                error!("broker connection failed: {err}");
                tokio::time::sleep(std::time::Duration::from_secs(1)).await;
            }
        }
    }

    info!("shutting down");
    client.try_disconnect()?;

    Ok(())
}
