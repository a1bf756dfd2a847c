use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use lgac2mqtt::{
    config::{init_logging, parse_revision, DEFAULT_UNITS},
    emulator::{serve, UnitEmulator},
    protocol::{PacketCodec, Reading, Revision, UnitId},
};
use parking_lot::Mutex;
use rand::Rng;
use tokio::net::TcpListener;
use tracing::info;


/// Emulator for LG indoor units behind a serial-to-TCP gateway
///
/// Answers status requests and control frames for every configured unit,
/// one connection per request like the gateway.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Address and port to listen on (host:port)
    #[arg(default_value = "127.0.0.1:8899")]
    listen: String,

    /// Units to emulate, as comma separated two-digit ids
    #[arg(long, value_delimiter = ',', default_value = DEFAULT_UNITS)]
    units: Vec<UnitId>,

    /// Compact frame field layout
    #[arg(long, default_value_t = Revision::A, value_parser = parse_revision)]
    revision: Revision,
}


#[tokio::main]
async fn main() -> Result<()> {
    init_logging("info");

    let args = Args::parse();

    let mut emulator = UnitEmulator::new(PacketCodec::new(args.revision), args.units.iter().copied());

    // give every room its own temperature
    {
        let mut rng = rand::thread_rng();

        for unit_id in &args.units {
            if let Some(report) = emulator.report_mut(*unit_id) {
                report.current_temperature = Reading::Celsius(f32::from(rng.gen_range(18u8..=28)));
            }
        }
    }

    let listener = TcpListener::bind(&args.listen).await
        .with_context(|| format!("failed to listen on {}", args.listen))?;

    info!(units = ?args.units, "listening on {}", args.listen);

    serve(listener, Arc::new(Mutex::new(emulator))).await
}
