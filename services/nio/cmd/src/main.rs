//! nio pump binary.
//!
//! Streams a generated payload from a producer thread through a shared
//! output buffer into a managed session over an in-memory transport, and
//! reports what the simulated peer received.

use clap::Parser;
use std::path::PathBuf;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

mod config;
mod logging;
mod pump;

use config::PumpConfig;
use logging::NioLogFormatter;

/// Loopback pump over a managed session
#[derive(Parser, Debug)]
#[command(name = "nio", version, about = "Flow-controlled output pump over a managed session")]
struct Args {
    /// Configuration file path
    #[arg(long, default_value = "nio.yaml")]
    config: PathBuf,

    /// Total payload size in bytes (overrides config)
    #[arg(long)]
    payload_bytes: Option<usize>,

    /// Producer write size in bytes (overrides config)
    #[arg(long)]
    chunk_size: Option<usize>,

    /// Bytes the peer accepts per reactor cycle (overrides config)
    #[arg(long)]
    sink_window: Option<usize>,

    /// Reactor poll interval, e.g. 1ms (overrides config)
    #[arg(long)]
    select_interval: Option<humantime::Duration>,

    /// Give up after this long, e.g. 30s
    #[arg(long, default_value = "30s")]
    deadline: humantime::Duration,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main(flavor = "multi_thread")]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let env_filter = EnvFilter::new("info")
        .add_directive(format!("nio={}", args.log_level).parse()?)
        .add_directive(format!("nio_session={}", args.log_level).parse()?)
        .add_directive(format!("nio_buffer={}", args.log_level).parse()?);

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr)
        .event_format(NioLogFormatter::new("nio"))
        .init();

    info!("Starting nio pump v{}", env!("CARGO_PKG_VERSION"));

    let mut config = PumpConfig::load_from_file(&args.config)?;
    if let Some(v) = args.payload_bytes {
        config.payload_bytes = v;
    }
    if let Some(v) = args.chunk_size {
        config.chunk_size = v;
    }
    if let Some(v) = args.sink_window {
        config.sink_window = v;
    }
    if let Some(v) = args.select_interval {
        config.session.select_interval = v.into();
    }
    let deadline: std::time::Duration = args.deadline.into();

    let pump = tokio::task::spawn_blocking(move || pump::run(&config, deadline));

    tokio::select! {
        result = pump => {
            match result? {
                Ok(report) => {
                    info!(
                        "Pump finished: sent={}B received={}B request={}B cycles={} released={} in {:?}",
                        report.bytes_sent,
                        report.bytes_received,
                        report.request_bytes,
                        report.output_cycles,
                        report.released_sessions,
                        report.elapsed
                    );
                    if report.bytes_sent != report.bytes_received {
                        anyhow::bail!(
                            "peer received {} of {} bytes",
                            report.bytes_received,
                            report.bytes_sent
                        );
                    }
                }
                Err(e) => {
                    error!("Pump failed: {:#}", e);
                    return Err(e);
                }
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Interrupted, exiting");
        }
    }

    Ok(())
}
