use std::time::Duration;

use anyhow::{Context, Result};
use async_broadcast::RecvError;
use clap::Parser;
use lgac2mqtt::{
    config::{init_logging, BusArgs, Endpoint, PollSettings, TopicArgs, Topics, DEFAULT_UNITS},
    coordinator::Coordinator,
    protocol::{PacketCodec, UnitId},
    transport,
};
use tracing::{info, warn};


/// Bridge between a bus of LG air conditioners and their device state
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    #[command(flatten)]
    bus: BusArgs,

    #[command(flatten)]
    topics: TopicArgs,

    /// Units on the bus, as comma separated two-digit ids
    #[arg(long, env = "LGAC_UNITS", value_delimiter = ',', default_value = DEFAULT_UNITS)]
    units: Vec<UnitId>,

    /// Seconds between polls
    #[arg(long, env = "LGAC_SCAN_INTERVAL", default_value_t = 30, value_parser = clap::value_parser!(u64).range(1..))]
    scan_interval: u64,

    /// Milliseconds between the per-unit requests of the first broker refresh
    #[arg(long, env = "LGAC_STAGGER", default_value_t = 500)]
    stagger: u64,

    /// Milliseconds to wait after the broker connects before the first refresh
    #[arg(long, env = "LGAC_SETTLE", default_value_t = 1000)]
    settle: u64,

    /// Seconds without a report before a unit is unavailable [default: 3 x scan interval]
    #[arg(long, env = "LGAC_STALE_AFTER")]
    stale_after: Option<u64>,
}

impl Args {
    fn poll_settings(&self) -> PollSettings {
        let scan_interval = Duration::from_secs(self.scan_interval);

        PollSettings {
            scan_interval,
            timeout: Duration::from_secs(self.bus.timeout),
            stagger: Duration::from_millis(self.stagger),
            settle: Duration::from_millis(self.settle),
            stale_after: self.stale_after.map_or(scan_interval * 3, Duration::from_secs),
        }
    }
}


#[tokio::main]
async fn main() -> Result<()> {
    init_logging("info");

    let args = Args::parse();

    let endpoint = Endpoint::from_url(&args.bus.endpoint)?;
    let settings = args.poll_settings();
    let topics = Topics::from(args.topics.clone());

    let transport = transport::open(&endpoint, &args.units, &topics, settings.timeout);
    let codec = PacketCodec::new(args.bus.revision);

    let coordinator = Coordinator::new(&args.units, transport, codec, settings);

    let mut changes = coordinator.subscribe();
    tokio::spawn(async move {
        loop {
            match changes.recv().await {
                Ok(change) => {
                    let availability = if change.snapshot.available { "" } else { " (unavailable)" };
                    info!("{}{availability}", change.snapshot.state);
                },
                Err(RecvError::Overflowed(missed)) => warn!("missed {missed} changes"),
                Err(RecvError::Closed) => break,
            }
        }
    });

    info!(endpoint = %args.bus.endpoint, revision = %codec.revision(), units = ?args.units, "starting bridge");

    coordinator.start().await
        .with_context(|| format!("failed to connect to {}", args.bus.endpoint))?;

    tokio::select! {
        _ = coordinator.run() => (),
        result = tokio::signal::ctrl_c() => {
            result.context("failed to wait for ctrl-c")?;
            info!("shutting down");
        }
    }

    coordinator.shutdown().await?;

    Ok(())
}
