//! TelemXnet Client Binary
//!
//! Bridges a local application port to the relay over every given
//! interface, logging per-interface ping latency until Ctrl-C.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::process::ExitCode;
use std::time::Duration;

use clap::{Parser, ValueEnum};
use rand::RngCore;
use tracing::{error, info, warn};

use telemxnet::TelemxError;
use telemxnet::client::{ClientError, MultiplexerBuilder, resolve_server};
use telemxnet::core::constants::DEFAULT_LOCAL_PORT;
use telemxnet::core::{NetworkId, Side};
use telemxnet::logging::{LogFormat, LogLevel, init_logging};

#[derive(Copy, Clone, Debug, PartialEq, Eq, ValueEnum)]
enum Mode {
    Uas,
    Gcs,
}

impl From<Mode> for Side {
    fn from(mode: Mode) -> Side {
        match mode {
            Mode::Uas => Side::Uas,
            Mode::Gcs => Side::Gcs,
        }
    }
}

#[derive(Parser, Debug)]
#[command(name = "telemx-client", version, about = "TelemXnet client multiplexer")]
struct Cli {
    /// Network id: a 32-character string or 64 hex digits. Random if omitted.
    #[arg(long, env = "TELEMX_NETID")]
    netid: Option<NetworkId>,

    /// Relay server as host:port.
    #[arg(long, env = "TELEMX_REMOTE", default_value = "127.0.0.1:16250")]
    remote: String,

    /// Local port the application talks to.
    #[arg(long, env = "TELEMX_LOCALPORT", default_value_t = DEFAULT_LOCAL_PORT)]
    localport: u16,

    /// Side of the link.
    #[arg(long, env = "TELEMX_MODE", value_enum, default_value = "gcs")]
    mode: Mode,

    /// Local interface address to send through (repeatable).
    #[arg(long = "iface", value_name = "ADDR")]
    ifaces: Vec<IpAddr>,

    /// Use the loopback interface only.
    #[arg(long, conflicts_with = "ifaces")]
    localonly: bool,

    /// Seconds between pings (0 disables them).
    #[arg(long, env = "TELEMX_PING_INTERVAL", default_value_t = 1)]
    ping_interval: u64,

    /// Log output format (stderr).
    #[arg(long, value_name = "FORMAT", env = "TELEMX_LOG_FORMAT", default_value = "text")]
    log_format: LogFormat,

    /// Minimum log level (stderr).
    #[arg(long, value_name = "LEVEL", env = "TELEMX_LOG_LEVEL", default_value = "info")]
    log_level: LogLevel,
}

impl Cli {
    fn interfaces(&self) -> Vec<IpAddr> {
        if self.localonly {
            vec![IpAddr::V4(Ipv4Addr::LOCALHOST)]
        } else {
            self.ifaces.clone()
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(cli.log_format, cli.log_level);

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, "client failed");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> telemxnet::Result<()> {
    let interfaces = cli.interfaces();
    if interfaces.is_empty() {
        return Err(TelemxError::Config(
            "no interfaces given: pass --iface ADDR or --localonly".into(),
        ));
    }

    let network_id = match cli.netid {
        Some(id) => id,
        None => {
            let mut bytes = [0u8; 32];
            rand::thread_rng().fill_bytes(&mut bytes);
            let id = NetworkId::new(bytes);
            info!(netid = %id.to_hex(), "generated random network id");
            id
        }
    };

    let server = resolve_server(&cli.remote).await?;
    let mut mux = MultiplexerBuilder::new(network_id)
        .local_addr(SocketAddr::from(([127, 0, 0, 1], cli.localport)))
        .server_addr(server)
        .side(cli.mode.into())
        .bind()
        .await?;

    for iface in interfaces {
        mux.add_interface(iface).await?;
    }
    for info in mux.interfaces().await? {
        info!(device_id = %info.device_id, iface = %info.iface, "added interface");
    }

    let mut ping_tick = tokio::time::interval(Duration::from_secs(cli.ping_interval.max(1)));
    ping_tick.tick().await;

    loop {
        tokio::select! {
            result = tokio::signal::ctrl_c() => {
                result?;
                info!("shutdown signal received");
                break;
            }
            _ = ping_tick.tick(), if cli.ping_interval > 0 => match mux.ping().await {
                Ok(results) => {
                    for result in results {
                        info!(
                            device_id = %result.device_id,
                            iface = %result.iface,
                            latency_ms = result.value(),
                            "{}",
                            result
                        );
                    }
                }
                Err(ClientError::NoInterfaces) => warn!("no active interfaces"),
                Err(e) => return Err(e.into()),
            },
        }
    }

    mux.shutdown().await?;
    Ok(())
}
