//! Relay server.
//!
//! A single UDP listener that registers device paths and broadcasts every
//! data frame, unchanged, to the registered devices on the opposite side of
//! the same network. Each datagram is handled on its own task so a slow or
//! failing send never delays delivery to other devices.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use bytes::Bytes;
use thiserror::Error;
use tokio::net::UdpSocket;
use tokio::sync::{Semaphore, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use super::routing::DeviceTable;
use crate::core::ControlMessage;
use crate::core::constants::{
    DEFAULT_SERVER_PORT, RECV_BUFFER_SIZE, RECV_ERROR_BACKOFF, SHUTDOWN_TIMEOUT,
};
use crate::transport::Frame;

/// Errors that can occur in the relay server.
#[derive(Debug, Error)]
pub enum ServerError {
    /// Failed to bind to address.
    #[error("bind failed: {0}")]
    BindFailed(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The listener task panicked.
    #[error("listener task failed: {0}")]
    TaskFailed(String),
}

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to.
    pub bind_addr: SocketAddr,

    /// Maximum number of datagrams handled concurrently.
    pub max_in_flight: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([127, 0, 0, 1], DEFAULT_SERVER_PORT)),
            max_in_flight: 1024,
        }
    }
}

/// Builder for creating a [`RelayServer`].
#[derive(Debug, Default)]
pub struct RelayServerBuilder {
    config: ServerConfig,
}

impl RelayServerBuilder {
    /// Create a new server builder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the bind address.
    pub fn bind_addr(mut self, addr: SocketAddr) -> Self {
        self.config.bind_addr = addr;
        self
    }

    /// Set the maximum number of datagrams handled concurrently.
    pub fn max_in_flight(mut self, max: usize) -> Self {
        self.config.max_in_flight = max.max(1);
        self
    }

    /// Build the server configuration.
    pub fn build(self) -> ServerConfig {
        self.config
    }

    /// Bind and start the server.
    pub async fn bind(self) -> Result<RelayServer, ServerError> {
        RelayServer::bind(self.config).await
    }
}

/// Relay counters.
#[derive(Debug, Default)]
pub struct RelayStats {
    received: AtomicU64,
    invalid: AtomicU64,
    forwarded: AtomicU64,
    pings_echoed: AtomicU64,
    registrations: AtomicU64,
    unregistrations: AtomicU64,
    send_failures: AtomicU64,
}

/// Point-in-time copy of [`RelayStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RelayStatsSnapshot {
    /// Datagrams received.
    pub received: u64,
    /// Datagrams dropped as invalid frames.
    pub invalid: u64,
    /// Datagrams forwarded to a peer device.
    pub forwarded: u64,
    /// Ping frames echoed.
    pub pings_echoed: u64,
    /// Begin frames processed.
    pub registrations: u64,
    /// End frames processed.
    pub unregistrations: u64,
    /// Sends that failed.
    pub send_failures: u64,
}

impl RelayStats {
    /// Take a snapshot of all counters.
    pub fn snapshot(&self) -> RelayStatsSnapshot {
        RelayStatsSnapshot {
            received: self.received.load(Ordering::Relaxed),
            invalid: self.invalid.load(Ordering::Relaxed),
            forwarded: self.forwarded.load(Ordering::Relaxed),
            pings_echoed: self.pings_echoed.load(Ordering::Relaxed),
            registrations: self.registrations.load(Ordering::Relaxed),
            unregistrations: self.unregistrations.load(Ordering::Relaxed),
            send_failures: self.send_failures.load(Ordering::Relaxed),
        }
    }

    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

/// Shared by the listener and every datagram handler.
#[derive(Debug)]
struct Relay {
    socket: Arc<UdpSocket>,
    table: Arc<DeviceTable>,
    stats: Arc<RelayStats>,
}

impl Relay {
    async fn handle_datagram(&self, data: Bytes, from: SocketAddr) {
        let frame = match Frame::decode(&data) {
            Ok(frame) => frame,
            Err(e) => {
                RelayStats::bump(&self.stats.invalid);
                trace!(from = %from, error = %e, "dropping invalid frame");
                return;
            }
        };
        let network = *frame.network_id();
        let device = frame.device_id();

        if device.is_control() {
            let device = device.as_data();
            match frame.control_message() {
                Some(ControlMessage::ClientBegin) => {
                    RelayStats::bump(&self.stats.registrations);
                    let previous = self.table.register(network, device, from).await;
                    if previous != Some(from) {
                        info!(network = %network, device_id = %device, addr = %from, "device registered");
                    }
                }
                Some(ControlMessage::ClientEnd) => {
                    RelayStats::bump(&self.stats.unregistrations);
                    if self.table.unregister(&network, device).await.is_some() {
                        info!(network = %network, device_id = %device, "device unregistered");
                    }
                }
                Some(ControlMessage::ServerPing) => {
                    if let Some(addr) = self.table.lookup(&network, device).await {
                        if self.send(&data, addr).await {
                            RelayStats::bump(&self.stats.pings_echoed);
                        }
                    } else {
                        trace!(network = %network, device_id = %device, "ping from unregistered device");
                    }
                }
                None => {
                    debug!(network = %network, device_id = %device, "unrecognised control payload");
                }
            }
            return;
        }

        let Some(origin) = device.origin_side() else {
            debug!(network = %network, device_id = %device, "device outside both bands");
            return;
        };

        let targets = self.table.lookup_side(&network, origin.peer()).await;
        if targets.is_empty() {
            trace!(network = %network, device_id = %device, "no peers registered");
        }
        for (target, addr) in targets {
            trace!(device_id = %device, target = %target, addr = %addr, "forwarding");
            if self.send(&data, addr).await {
                RelayStats::bump(&self.stats.forwarded);
            }
        }
    }

    /// Best-effort send; failures are logged and counted, never propagated.
    async fn send(&self, data: &[u8], addr: SocketAddr) -> bool {
        match self.socket.send_to(data, addr).await {
            Ok(_) => true,
            Err(e) => {
                RelayStats::bump(&self.stats.send_failures);
                warn!(addr = %addr, error = %e, "send failed");
                false
            }
        }
    }
}

/// A running relay server.
///
/// # Example
///
/// ```ignore
/// use telemxnet::server::RelayServerBuilder;
///
/// let mut server = RelayServerBuilder::new()
///     .bind_addr("0.0.0.0:16250".parse()?)
///     .bind()
///     .await?;
///
/// tokio::signal::ctrl_c().await?;
/// server.shutdown().await?;
/// ```
#[derive(Debug)]
pub struct RelayServer {
    config: ServerConfig,
    local_addr: SocketAddr,
    table: Arc<DeviceTable>,
    stats: Arc<RelayStats>,
    shutdown_tx: Option<oneshot::Sender<()>>,
    task: Option<JoinHandle<()>>,
}

impl RelayServer {
    /// Bind to the configured address and start the listener.
    pub async fn bind(config: ServerConfig) -> Result<Self, ServerError> {
        let socket = UdpSocket::bind(config.bind_addr)
            .await
            .map_err(|e| ServerError::BindFailed(format!("{}: {}", config.bind_addr, e)))?;
        let local_addr = socket.local_addr()?;

        let table = Arc::new(DeviceTable::new());
        let stats = Arc::new(RelayStats::default());
        let relay = Arc::new(Relay {
            socket: Arc::new(socket),
            table: Arc::clone(&table),
            stats: Arc::clone(&stats),
        });

        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let limiter = Arc::new(Semaphore::new(config.max_in_flight.max(1)));
        let task = tokio::spawn(listen(relay, limiter, shutdown_rx));

        info!(addr = %local_addr, "relay server listening");

        Ok(Self {
            config,
            local_addr,
            table,
            stats,
            shutdown_tx: Some(shutdown_tx),
            task: Some(task),
        })
    }

    /// Get the local address the server is bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Get the server configuration.
    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// The routing table.
    pub fn routing_table(&self) -> &Arc<DeviceTable> {
        &self.table
    }

    /// Current counters.
    pub fn stats(&self) -> RelayStatsSnapshot {
        self.stats.snapshot()
    }

    /// Whether the listener is still running.
    pub fn is_running(&self) -> bool {
        self.task.as_ref().is_some_and(|task| !task.is_finished())
    }

    /// Stop the listener and wait for it to exit.
    ///
    /// Idempotent: later calls return immediately.
    pub async fn shutdown(&mut self) -> Result<(), ServerError> {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        let Some(task) = self.task.take() else {
            return Ok(());
        };
        match tokio::time::timeout(SHUTDOWN_TIMEOUT, task).await {
            Ok(Ok(())) => {
                info!(addr = %self.local_addr, "relay server stopped");
                Ok(())
            }
            Ok(Err(e)) => Err(ServerError::TaskFailed(e.to_string())),
            Err(_) => {
                warn!(addr = %self.local_addr, "relay listener did not stop in time");
                Ok(())
            }
        }
    }
}

impl Drop for RelayServer {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
    }
}

async fn listen(relay: Arc<Relay>, limiter: Arc<Semaphore>, mut shutdown: oneshot::Receiver<()>) {
    let socket = Arc::clone(&relay.socket);
    let mut buf = vec![0u8; RECV_BUFFER_SIZE];

    loop {
        tokio::select! {
            biased;

            _ = &mut shutdown => break,

            result = socket.recv_from(&mut buf) => match result {
                Ok((len, from)) => {
                    RelayStats::bump(&relay.stats.received);
                    let Ok(permit) = Arc::clone(&limiter).acquire_owned().await else {
                        break;
                    };
                    let data = Bytes::copy_from_slice(&buf[..len]);
                    let relay = Arc::clone(&relay);
                    tokio::spawn(async move {
                        relay.handle_datagram(data, from).await;
                        drop(permit);
                    });
                }
                Err(e) if matches!(
                    e.kind(),
                    io::ErrorKind::ConnectionReset | io::ErrorKind::ConnectionRefused
                ) => {
                    trace!(error = %e, "peer unreachable");
                }
                Err(e) => {
                    debug!(error = %e, "recv failed");
                    tokio::time::sleep(RECV_ERROR_BACKOFF).await;
                }
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{DeviceId, NetworkId};
    use crate::transport::encode;
    use std::time::Duration;

    const NET_A: [u8; 32] = [0xA1; 32];
    const NET_B: [u8; 32] = [0xB2; 32];

    async fn start() -> RelayServer {
        RelayServerBuilder::new()
            .bind_addr("127.0.0.1:0".parse().unwrap())
            .bind()
            .await
            .unwrap()
    }

    async fn client() -> UdpSocket {
        UdpSocket::bind("127.0.0.1:0").await.unwrap()
    }

    async fn recv_within(socket: &UdpSocket, ms: u64) -> Option<Vec<u8>> {
        let mut buf = [0u8; 1024];
        match tokio::time::timeout(Duration::from_millis(ms), socket.recv_from(&mut buf)).await {
            Ok(Ok((len, _))) => Some(buf[..len].to_vec()),
            _ => None,
        }
    }

    /// Send CLIENT-BEGIN for `slot` and wait until the relay has it.
    async fn register(server: &RelayServer, socket: &UdpSocket, net: [u8; 32], slot: i8) {
        let begin = encode(&net, -slot, 0, b"CLIENT-BEGIN").unwrap();
        socket.send_to(&begin, server.local_addr()).await.unwrap();
        let device = DeviceId::new(slot).unwrap();
        for _ in 0..200 {
            if server
                .routing_table()
                .lookup(&NetworkId::new(net), device)
                .await
                .is_some()
            {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("device {} never registered", slot);
    }

    #[tokio::test]
    async fn test_bind_failure_is_reported() {
        let server = start().await;
        let err = RelayServerBuilder::new()
            .bind_addr(server.local_addr())
            .bind()
            .await
            .unwrap_err();
        assert!(matches!(err, ServerError::BindFailed(_)));
    }

    #[tokio::test]
    async fn test_relays_both_directions() {
        let mut server = start().await;
        let uas = client().await;
        let gcs = client().await;
        register(&server, &uas, NET_A, 1).await;
        register(&server, &gcs, NET_A, 32).await;

        let up = encode(&NET_A, 1, 10, b"telemetry").unwrap();
        uas.send_to(&up, server.local_addr()).await.unwrap();
        assert_eq!(recv_within(&gcs, 1000).await.unwrap(), up.to_vec());

        let down = encode(&NET_A, 32, 11, b"command").unwrap();
        gcs.send_to(&down, server.local_addr()).await.unwrap();
        assert_eq!(recv_within(&uas, 1000).await.unwrap(), down.to_vec());

        // Never reflected back to the sender's own side.
        assert!(recv_within(&uas, 100).await.is_none());
        server.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_band_upper_bounds() {
        let mut server = start().await;
        let uas_top = client().await;
        let gcs_top = client().await;
        register(&server, &uas_top, NET_A, 31).await;
        register(&server, &gcs_top, NET_A, 63).await;

        let from_zero = encode(&NET_A, 0, 1, b"x").unwrap();
        uas_top.send_to(&from_zero, server.local_addr()).await.unwrap();
        assert_eq!(recv_within(&gcs_top, 1000).await.unwrap(), from_zero.to_vec());

        let from_top = encode(&NET_A, 63, 2, b"y").unwrap();
        gcs_top.send_to(&from_top, server.local_addr()).await.unwrap();
        assert_eq!(recv_within(&uas_top, 1000).await.unwrap(), from_top.to_vec());
        server.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_device_64_is_not_routed() {
        let mut server = start().await;
        let uas = client().await;
        let gcs = client().await;
        register(&server, &uas, NET_A, 1).await;
        register(&server, &gcs, NET_A, 32).await;

        let stray = encode(&NET_A, 64, 1, b"z").unwrap();
        uas.send_to(&stray, server.local_addr()).await.unwrap();
        assert!(recv_within(&gcs, 150).await.is_none());
        assert!(recv_within(&uas, 50).await.is_none());
        server.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_networks_are_isolated() {
        let mut server = start().await;
        let uas = client().await;
        let gcs_other = client().await;
        register(&server, &uas, NET_A, 1).await;
        register(&server, &gcs_other, NET_B, 32).await;

        let up = encode(&NET_A, 1, 1, b"secret").unwrap();
        uas.send_to(&up, server.local_addr()).await.unwrap();
        assert!(recv_within(&gcs_other, 200).await.is_none());
        server.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_ping_is_echoed_unchanged() {
        let mut server = start().await;
        let uas = client().await;
        register(&server, &uas, NET_A, 2).await;

        let ping = encode(&NET_A, -2, 99, b"SERVER-PING").unwrap();
        uas.send_to(&ping, server.local_addr()).await.unwrap();
        assert_eq!(recv_within(&uas, 1000).await.unwrap(), ping.to_vec());
        assert_eq!(server.stats().pings_echoed, 1);
        server.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_ping_from_unregistered_device_not_echoed() {
        let mut server = start().await;
        let uas = client().await;

        let ping = encode(&NET_A, -4, 1, b"SERVER-PING").unwrap();
        uas.send_to(&ping, server.local_addr()).await.unwrap();
        assert!(recv_within(&uas, 200).await.is_none());

        let stats = server.stats();
        assert_eq!(stats.received, 1);
        assert_eq!(stats.pings_echoed, 0);
        assert!(server.routing_table().is_empty().await);
        server.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_send_failure_does_not_abort_fan_out() {
        let mut server = start().await;
        let uas = client().await;
        let gcs = client().await;

        // An IPv6 target is unreachable from the IPv4 relay socket.
        let unsendable: SocketAddr = "[::1]:9".parse().unwrap();
        server
            .routing_table()
            .register(NetworkId::new(NET_A), DeviceId::new(32).unwrap(), unsendable)
            .await;
        register(&server, &gcs, NET_A, 33).await;

        let up = encode(&NET_A, 1, 5, b"still delivered").unwrap();
        uas.send_to(&up, server.local_addr()).await.unwrap();
        assert_eq!(recv_within(&gcs, 1000).await.unwrap(), up.to_vec());

        for _ in 0..200 {
            if server.stats().send_failures == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        let stats = server.stats();
        assert_eq!(stats.send_failures, 1);
        assert_eq!(stats.forwarded, 1);
        assert!(server.is_running());
        server.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_client_end_unregisters() {
        let mut server = start().await;
        let uas = client().await;
        let gcs = client().await;
        register(&server, &uas, NET_A, 1).await;
        register(&server, &gcs, NET_A, 32).await;

        let end = encode(&NET_A, -32, 0, b"CLIENT-END").unwrap();
        gcs.send_to(&end, server.local_addr()).await.unwrap();
        for _ in 0..200 {
            if server.routing_table().len().await == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(server.routing_table().len().await, 1);

        let up = encode(&NET_A, 1, 3, b"nobody home").unwrap();
        uas.send_to(&up, server.local_addr()).await.unwrap();
        assert!(recv_within(&gcs, 150).await.is_none());
        server.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_invalid_and_unroutable_dropped() {
        let mut server = start().await;
        let sender = client().await;

        sender.send_to(b"garbage", server.local_addr()).await.unwrap();
        let unknown = encode(&NET_A, -3, 0, b"HELLO").unwrap();
        sender.send_to(&unknown, server.local_addr()).await.unwrap();
        let orphan = encode(&NET_A, 5, 0, b"data").unwrap();
        sender.send_to(&orphan, server.local_addr()).await.unwrap();

        for _ in 0..200 {
            if server.stats().received == 3 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;

        let stats = server.stats();
        assert_eq!(stats.received, 3);
        assert_eq!(stats.invalid, 1);
        assert_eq!(stats.forwarded, 0);
        assert!(server.routing_table().is_empty().await);
        assert!(recv_within(&sender, 100).await.is_none());
        assert!(server.is_running());
        server.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_shutdown_is_idempotent() {
        let mut server = start().await;
        assert!(server.is_running());
        server.shutdown().await.unwrap();
        assert!(!server.is_running());
        server.shutdown().await.unwrap();
    }
}
