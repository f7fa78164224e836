//! TelemXnet Relay Server Binary
//!
//! Runs a relay until Ctrl-C.

use std::net::{IpAddr, SocketAddr};
use std::process::ExitCode;
use std::time::Duration;

use clap::Parser;
use tracing::{error, info};

use telemxnet::core::constants::DEFAULT_SERVER_PORT;
use telemxnet::logging::{LogFormat, LogLevel, init_logging};
use telemxnet::server::RelayServerBuilder;

#[derive(Parser, Debug)]
#[command(name = "telemx-server", version, about = "TelemXnet relay server")]
struct Cli {
    /// Address of the network adapter to listen on.
    #[arg(long, env = "TELEMX_IP", default_value = "127.0.0.1")]
    ip: IpAddr,

    /// UDP port to listen on.
    #[arg(long, env = "TELEMX_PORT", default_value_t = DEFAULT_SERVER_PORT)]
    port: u16,

    /// Maximum number of datagrams handled concurrently.
    #[arg(long, env = "TELEMX_MAX_IN_FLIGHT", default_value_t = 1024)]
    max_in_flight: usize,

    /// Seconds between statistics log lines (0 disables them).
    #[arg(long, env = "TELEMX_STATS_INTERVAL", default_value_t = 60)]
    stats_interval: u64,

    /// Log output format (stderr).
    #[arg(long, value_name = "FORMAT", env = "TELEMX_LOG_FORMAT", default_value = "text")]
    log_format: LogFormat,

    /// Minimum log level (stderr).
    #[arg(long, value_name = "LEVEL", env = "TELEMX_LOG_LEVEL", default_value = "info")]
    log_level: LogLevel,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(cli.log_format, cli.log_level);

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, "relay server failed");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> telemxnet::Result<()> {
    let mut server = RelayServerBuilder::new()
        .bind_addr(SocketAddr::new(cli.ip, cli.port))
        .max_in_flight(cli.max_in_flight)
        .bind()
        .await?;

    let mut stats_tick = tokio::time::interval(Duration::from_secs(cli.stats_interval.max(1)));
    stats_tick.tick().await;

    loop {
        tokio::select! {
            result = tokio::signal::ctrl_c() => {
                result?;
                info!("shutdown signal received");
                break;
            }
            _ = stats_tick.tick(), if cli.stats_interval > 0 => {
                let stats = server.stats();
                let devices = server.routing_table().len().await;
                info!(
                    received = stats.received,
                    forwarded = stats.forwarded,
                    invalid = stats.invalid,
                    pings = stats.pings_echoed,
                    send_failures = stats.send_failures,
                    devices,
                    "relay statistics"
                );
            }
        }
    }

    server.shutdown().await?;
    Ok(())
}
