use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::Parser;
use lgac2mqtt::{
    config::{init_logging, BusArgs, Endpoint},
    device::{ApplyOutcome, DeviceState},
    protocol::{PacketCodec, UnitId},
    transport::{Delivered, SocketTransport, Transport},
};


/// Ask one unit for its state, once
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    #[command(flatten)]
    bus: BusArgs,

    /// Unit to query
    #[arg(long, short, default_value = "01")]
    unit: UnitId,
}


#[tokio::main]
async fn main() -> Result<()> {
    init_logging("warn");

    let args = Args::parse();

    let Endpoint::Socket { host, port } = Endpoint::from_url(&args.bus.endpoint)? else {
        bail!("query needs a tcp:// url, got {}", args.bus.endpoint);
    };

    let codec = PacketCodec::new(args.bus.revision);
    let transport = SocketTransport::new(&host, port, Duration::from_secs(args.bus.timeout));
    transport.connect().await?;

    let mut state = DeviceState::new(args.unit);
    let request = codec.encode_status_request(args.unit, state.opermode())?;

    println!("-> {}", hex::encode(&request));

    let reply = match transport.send(request).await
        .with_context(|| format!("no answer from unit {} at {}", args.unit, transport.addr()))?
    {
        Delivered::Reply(reply) => reply,
        Delivered::Published => bail!("{} did not reply inline", transport.addr()),
    };

    println!("<- {}", hex::encode(&reply));

    let frame = codec.decode(&reply)?;
    println!("{frame:#?}");

    match state.apply(&frame) {
        ApplyOutcome::Rejected(err) => bail!("reply rejected: {err}"),
        _ => println!("{state}"),
    }

    transport.disconnect().await?;

    Ok(())
}
