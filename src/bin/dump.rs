use std::time::SystemTime;

use anyhow::{bail, Context, Result};
use clap::Parser;
use colored::{ColoredString, Colorize};
use lgac2mqtt::{
    config::{init_logging, parse_revision, Endpoint, TopicArgs, Topics},
    protocol::{FrameKind, PacketCodec, ParsedFrame, Reading, Revision},
    transport::broker::mqtt_options,
};
use rumqttc::{AsyncClient, Event, Packet, QoS, SubscribeFilter};
use tracing::{error, info};
use url::Url;


/// Decode and print frames
///
/// Frames given on the command line are decoded and printed. Without any,
/// every frame seen on the broker's send and receive topics is printed.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Frames to decode, as hex
    frames: Vec<String>,

    /// URL of the broker to listen to, mqtt://[user[:password]@]host[:port]
    #[arg(long, env = "LGAC_ENDPOINT")]
    broker: Option<Url>,

    /// Compact frame field layout
    #[arg(long, env = "LGAC_REVISION", default_value_t = Revision::A, value_parser = parse_revision)]
    revision: Revision,

    #[command(flatten)]
    topics: TopicArgs,
}


fn delta_ms(since: Option<SystemTime>) -> u128 {
    since.and_then(|time| time.elapsed().ok())
        .map_or(0, |elapsed| elapsed.as_millis())
}

fn kind_desc(kind: FrameKind) -> String {
    match kind {
        FrameKind::StatusRequest => "Status Request".to_string(),
        FrameKind::StatusReport => "Status Report".to_string(),
        FrameKind::Control => "Control".to_string(),
        FrameKind::Other(byte) => format!("Unknown {byte:02x}"),
    }
}

fn frame_desc(frame: &ParsedFrame) -> String {
    let kind = kind_desc(frame.kind);
    let power = if frame.power { "on" } else { "off" };

    let target = frame.target_temperature
        .map_or("--".to_string(), |target| format!("{}C", target.celsius()));

    let reading = |reading: Reading| reading.celsius()
        .map_or("--".to_string(), |celsius| format!("{celsius:.1}C"));

    let mut line = format!(
        "{}: {:<6} {kind: <16} {power: <3} {: <8} {target: <4} fan {: <6}",
        frame.unit_id, frame.format, frame.hvac_mode, frame.fan_mode
    );

    if let Some(swing) = frame.swing_mode {
        line += &format!(" swing {swing: <4}");
    }

    if frame.kind == FrameKind::StatusReport {
        line += &format!(
            " room {} pipe {}/{} outdoor {}",
            reading(frame.current_temperature),
            reading(frame.pipe1_temperature),
            reading(frame.pipe2_temperature),
            reading(frame.outdoor_temperature),
        );

        if let Some(error_code) = frame.error_code.filter(|code| *code != 0) {
            line += &format!(" error {error_code:02x}");
        }

        if frame.filter_alarm == Some(true) {
            line += " filter";
        }
    }

    line
}

fn coloured(kind: FrameKind, line: String) -> ColoredString {
    match kind {
        FrameKind::StatusRequest => line.on_cyan().bright_white(),
        FrameKind::StatusReport => line.on_green().bright_white(),
        FrameKind::Control => line.on_purple().bright_white(),
        FrameKind::Other(_) => line.on_black(),
    }
}

fn print_frame(codec: &PacketCodec, raw: &[u8], prefix: &str) {
    let hex = hex::encode(raw);

    match codec.decode(raw) {
        Ok(frame) => println!("{}", coloured(frame.kind, format!("{prefix}{} {hex}", frame_desc(&frame)))),
        Err(err) => println!("{}", format!("{prefix}{err}: {hex}").on_red().bright_white()),
    }
}


#[tokio::main]
async fn main() -> Result<()> {
    init_logging("warn");

    let args = Args::parse();
    let codec = PacketCodec::new(args.revision);

    if !args.frames.is_empty() {
        for text in &args.frames {
            let raw = hex::decode(text.trim())
                .with_context(|| format!("{text:?} is not hex"))?;

            print_frame(&codec, &raw, "");
        }

        return Ok(());
    }

    let Some(url) = args.broker else {
        bail!("give frames to decode, or a broker to listen to");
    };

    let Endpoint::Broker { host, port, credentials } = Endpoint::from_url(&url)? else {
        bail!("dump listens to an mqtt:// url, got {url}");
    };

    let topics = Topics::from(args.topics);
    let (client, mut eventloop) = AsyncClient::new(mqtt_options(&host, port, credentials), 16);

    let start_time = SystemTime::now();
    let mut last_frame_time: Option<SystemTime> = None;

    loop {
        match eventloop.poll().await {
            Ok(Event::Incoming(Packet::ConnAck(_))) => {
                info!("connected to {url}");

                let filters = [&topics.send, &topics.recv].into_iter()
                    .map(|topic| SubscribeFilter::new(topic.clone(), QoS::AtMostOnce));

                client.try_subscribe_many(filters)?;
            },
            Ok(Event::Incoming(Packet::Publish(publish))) => {
                let start_delta_ms = delta_ms(Some(start_time));
                let last_frame_delta_ms = delta_ms(last_frame_time);
                let prefix = format!("[{start_delta_ms:8}, {last_frame_delta_ms:8}] ");

                if publish.topic == topics.send {
                    // outbound frames are hex text
                    match hex::decode(String::from_utf8_lossy(&publish.payload).trim()) {
                        Ok(raw) => print_frame(&codec, &raw, &format!("{prefix}-> ")),
                        Err(err) => println!("{prefix}-> not hex: {err}"),
                    }
                } else {
                    print_frame(&codec, &publish.payload, &format!("{prefix}<- "));
                }

                last_frame_time = Some(SystemTime::now());
            },
            Ok(_) => (),
            Err(err) => {
                error!("broker connection failed: {err}");
                tokio::time::sleep(std::time::Duration::from_secs(1)).await;
            }
        }
    }
}
