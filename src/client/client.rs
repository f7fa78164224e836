//! Client multiplexer.
//!
//! A [`Multiplexer`] binds one local UDP endpoint for the application it
//! serves and fans every application datagram out across a dynamic set of
//! interface transceivers, all targeting the same relay. Frames coming back
//! on any interface are collapsed to a single local delivery by sequence.
//!
//! All state lives in one supervised task. The [`Multiplexer`] handle only
//! enqueues commands for it, so the interface set has a single writer.

use std::io;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use thiserror::Error;
use tokio::net::UdpSocket;
use tokio::sync::{Notify, mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use super::dedup::SequenceWatermark;
use super::interface::{InterfaceInfo, InterfaceSlot, SlotAllocator};
use super::ping::{PingCollector, PingEcho, PingResult};
use crate::core::constants::{
    DEFAULT_LOCAL_PORT, DEFAULT_SERVER_PORT, MAX_PAYLOAD_SIZE, PING_WINDOW, RECV_BUFFER_SIZE,
    RECV_ERROR_BACKOFF, SHUTDOWN_TIMEOUT,
};
use crate::core::{ControlMessage, DeviceId, NetworkId, Side};
use crate::transport::{DEFAULT_QUEUE_CAPACITY, Frame, TransceiverBuilder};

/// Errors that can occur in the client multiplexer.
#[derive(Debug, Error)]
pub enum ClientError {
    /// Failed to bind the local application endpoint.
    #[error("bind failed: {0}")]
    BindFailed(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The multiplexer has stopped.
    #[error("multiplexer closed")]
    Closed,

    /// Another ping is still collecting echoes.
    #[error("ping already in progress")]
    PingInProgress,

    /// No interface is active.
    #[error("no active interfaces")]
    NoInterfaces,

    /// Relay address could not be resolved.
    #[error("cannot resolve relay address: {0}")]
    AddressResolution(String),

    /// The multiplexer task panicked.
    #[error("multiplexer task crashed: {0}")]
    Crashed(String),
}

/// Client configuration.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Application-facing local address.
    pub local_addr: SocketAddr,

    /// Where inbound data is delivered. Learned from the last local
    /// datagram when unset.
    pub app_addr: Option<SocketAddr>,

    /// Relay server address.
    pub server_addr: SocketAddr,

    /// Network this multiplexer belongs to.
    pub network_id: NetworkId,

    /// Side of the link, selecting the device id band.
    pub side: Side,

    /// How long a ping waits for echoes.
    pub ping_window: Duration,

    /// Depth of the command queue.
    pub command_capacity: usize,

    /// Depth of each transceiver's frame queues.
    pub frame_queue_capacity: usize,
}

impl ClientConfig {
    /// Default configuration for `network_id`.
    pub fn new(network_id: NetworkId) -> Self {
        Self {
            local_addr: SocketAddr::from(([127, 0, 0, 1], DEFAULT_LOCAL_PORT)),
            app_addr: None,
            server_addr: SocketAddr::from(([127, 0, 0, 1], DEFAULT_SERVER_PORT)),
            network_id,
            side: Side::Gcs,
            ping_window: PING_WINDOW,
            command_capacity: 64,
            frame_queue_capacity: DEFAULT_QUEUE_CAPACITY,
        }
    }
}

/// Builder for creating a [`Multiplexer`].
#[derive(Debug)]
pub struct MultiplexerBuilder {
    config: ClientConfig,
}

impl MultiplexerBuilder {
    /// Create a new builder for `network_id`.
    pub fn new(network_id: NetworkId) -> Self {
        Self {
            config: ClientConfig::new(network_id),
        }
    }

    /// Set the application-facing local address.
    pub fn local_addr(mut self, addr: SocketAddr) -> Self {
        self.config.local_addr = addr;
        self
    }

    /// Deliver inbound data to a fixed application address.
    pub fn app_addr(mut self, addr: SocketAddr) -> Self {
        self.config.app_addr = Some(addr);
        self
    }

    /// Set the relay server address.
    pub fn server_addr(mut self, addr: SocketAddr) -> Self {
        self.config.server_addr = addr;
        self
    }

    /// Set the side of the link.
    pub fn side(mut self, side: Side) -> Self {
        self.config.side = side;
        self
    }

    /// Set the ping collection window.
    pub fn ping_window(mut self, window: Duration) -> Self {
        self.config.ping_window = window;
        self
    }

    /// Set the command queue depth.
    pub fn command_capacity(mut self, capacity: usize) -> Self {
        self.config.command_capacity = capacity.max(1);
        self
    }

    /// Set each transceiver's frame queue depth.
    pub fn frame_queue_capacity(mut self, capacity: usize) -> Self {
        self.config.frame_queue_capacity = capacity.max(1);
        self
    }

    /// Build the client configuration.
    pub fn build(self) -> ClientConfig {
        self.config
    }

    /// Bind and start the multiplexer.
    pub async fn bind(self) -> Result<Multiplexer, ClientError> {
        Multiplexer::bind(self.config).await
    }
}

/// Resolve a `host:port` relay address, preferring IPv4.
pub async fn resolve_server(host: &str) -> Result<SocketAddr, ClientError> {
    let addrs: Vec<SocketAddr> = tokio::net::lookup_host(host)
        .await
        .map_err(|e| ClientError::AddressResolution(format!("{}: {}", host, e)))?
        .collect();
    addrs
        .iter()
        .find(|addr| addr.is_ipv4())
        .or_else(|| addrs.first())
        .copied()
        .ok_or_else(|| ClientError::AddressResolution(format!("{}: no addresses", host)))
}

/// Echo stream for one ping round, handed from the loop to the caller.
#[derive(Debug)]
struct PingRound {
    started: Instant,
    seeded: Vec<(DeviceId, IpAddr)>,
    echoes: mpsc::Receiver<PingEcho>,
}

#[derive(Debug)]
enum Command {
    AddInterface(IpAddr),
    RemoveInterface(IpAddr),
    Ping(oneshot::Sender<Result<PingRound, ClientError>>),
    Interfaces(oneshot::Sender<Vec<InterfaceInfo>>),
}

/// Handle to a running multiplexer.
///
/// # Example
///
/// ```ignore
/// use telemxnet::client::MultiplexerBuilder;
/// use telemxnet::core::Side;
///
/// let mut mux = MultiplexerBuilder::new(network_id)
///     .side(Side::Uas)
///     .server_addr(relay)
///     .bind()
///     .await?;
///
/// mux.add_interface("192.168.1.20".parse()?).await?;
/// mux.add_interface("10.8.0.3".parse()?).await?;
///
/// for result in mux.ping().await? {
///     println!("{}", result);
/// }
///
/// mux.shutdown().await?;
/// ```
#[derive(Debug)]
pub struct Multiplexer {
    config: ClientConfig,
    local_addr: SocketAddr,
    commands: mpsc::Sender<Command>,
    shutdown_tx: Option<oneshot::Sender<()>>,
    task: Option<JoinHandle<()>>,
}

impl Multiplexer {
    /// Bind the local application endpoint and start the multiplexer task.
    pub async fn bind(config: ClientConfig) -> Result<Self, ClientError> {
        let socket = UdpSocket::bind(config.local_addr)
            .await
            .map_err(|e| ClientError::BindFailed(format!("{}: {}", config.local_addr, e)))?;
        let local_addr = socket.local_addr()?;

        let (commands_tx, commands_rx) = mpsc::channel(config.command_capacity.max(1));
        let (shutdown_tx, shutdown_rx) = oneshot::channel();

        let worker = Worker {
            socket: Arc::new(socket),
            wake: Arc::new(Notify::new()),
            network: config.network_id,
            side: config.side,
            server_addr: config.server_addr,
            app_addr: config.app_addr,
            learned_app_addr: None,
            frame_queue_capacity: config.frame_queue_capacity,
            slots: Vec::new(),
            allocator: SlotAllocator::new(config.side),
            sequence: 0,
            watermark: SequenceWatermark::new(),
            pending_ping: None,
        };
        let task = tokio::spawn(worker.run(commands_rx, shutdown_rx));

        info!(
            network = %config.network_id,
            side = %config.side,
            local = %local_addr,
            server = %config.server_addr,
            "multiplexer started"
        );

        Ok(Self {
            config,
            local_addr,
            commands: commands_tx,
            shutdown_tx: Some(shutdown_tx),
            task: Some(task),
        })
    }

    /// Application-facing local address.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Get the client configuration.
    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Whether the multiplexer task is still running.
    pub fn is_running(&self) -> bool {
        self.task.as_ref().is_some_and(|task| !task.is_finished())
    }

    /// Queue a request to open a path through local interface `iface`.
    ///
    /// The interface is bound, assigned the next free device id, and
    /// registered with the relay by the multiplexer task. Failures there are
    /// logged; use [`interfaces`](Self::interfaces) to observe the outcome.
    pub async fn add_interface(&self, iface: IpAddr) -> Result<(), ClientError> {
        self.command(Command::AddInterface(iface)).await
    }

    /// Queue a request to close the oldest active path on `iface`.
    ///
    /// Removing an interface that is not active is a no-op.
    pub async fn remove_interface(&self, iface: IpAddr) -> Result<(), ClientError> {
        self.command(Command::RemoveInterface(iface)).await
    }

    /// Active interfaces, after every previously queued request has run.
    pub async fn interfaces(&self) -> Result<Vec<InterfaceInfo>, ClientError> {
        let (tx, rx) = oneshot::channel();
        self.command(Command::Interfaces(tx)).await?;
        rx.await.map_err(|_| ClientError::Closed)
    }

    /// Probe every active path through the relay.
    ///
    /// Waits up to the configured ping window for echoes and returns one
    /// result per interface; paths that did not answer report a timeout.
    pub async fn ping(&self) -> Result<Vec<PingResult>, ClientError> {
        let (tx, rx) = oneshot::channel();
        self.command(Command::Ping(tx)).await?;
        let mut round = rx.await.map_err(|_| ClientError::Closed)??;

        let deadline = tokio::time::Instant::from_std(round.started) + self.config.ping_window;
        let mut collector = PingCollector::new(round.started, round.seeded);
        while !collector.is_complete() {
            match tokio::time::timeout_at(deadline, round.echoes.recv()).await {
                Ok(Some(echo)) => {
                    collector.record(echo);
                }
                Ok(None) | Err(_) => break,
            }
        }
        Ok(collector.finish())
    }

    /// Unregister every path and stop the multiplexer.
    ///
    /// Idempotent: later calls return immediately.
    pub async fn shutdown(&mut self) -> Result<(), ClientError> {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        let Some(task) = self.task.take() else {
            return Ok(());
        };
        match tokio::time::timeout(SHUTDOWN_TIMEOUT, task).await {
            Ok(Ok(())) => {
                info!(local = %self.local_addr, "multiplexer stopped");
                Ok(())
            }
            Ok(Err(e)) => Err(ClientError::Crashed(e.to_string())),
            Err(_) => {
                warn!(local = %self.local_addr, "multiplexer did not stop in time");
                Ok(())
            }
        }
    }

    async fn command(&self, command: Command) -> Result<(), ClientError> {
        self.commands
            .send(command)
            .await
            .map_err(|_| ClientError::Closed)
    }
}

impl Drop for Multiplexer {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
    }
}

#[derive(Debug)]
struct PendingPing {
    sequence: u16,
    echoes: mpsc::Sender<PingEcho>,
}

/// State owned by the multiplexer task.
struct Worker {
    socket: Arc<UdpSocket>,
    wake: Arc<Notify>,
    network: NetworkId,
    side: Side,
    server_addr: SocketAddr,
    app_addr: Option<SocketAddr>,
    learned_app_addr: Option<SocketAddr>,
    frame_queue_capacity: usize,
    slots: Vec<InterfaceSlot>,
    allocator: SlotAllocator,
    sequence: u16,
    watermark: SequenceWatermark,
    pending_ping: Option<PendingPing>,
}

impl Worker {
    async fn run(
        mut self,
        mut commands: mpsc::Receiver<Command>,
        mut shutdown: oneshot::Receiver<()>,
    ) {
        let socket = Arc::clone(&self.socket);
        let wake = Arc::clone(&self.wake);
        let mut buf = vec![0u8; RECV_BUFFER_SIZE];

        loop {
            tokio::select! {
                biased;

                _ = &mut shutdown => break,

                command = commands.recv() => match command {
                    Some(command) => self.handle_command(command).await,
                    None => break,
                },

                _ = wake.notified() => self.drain_inbound().await,

                result = socket.recv_from(&mut buf) => match result {
                    Ok((len, from)) => self.fan_out(&buf[..len], from),
                    Err(e) if e.kind() == io::ErrorKind::ConnectionReset => {
                        trace!(error = %e, "application endpoint unreachable");
                    }
                    Err(e) => {
                        debug!(error = %e, "local recv failed");
                        tokio::time::sleep(RECV_ERROR_BACKOFF).await;
                    }
                },
            }
        }

        self.close_all().await;
    }

    fn next_sequence(&mut self) -> u16 {
        let sequence = self.sequence;
        self.sequence = self.sequence.wrapping_add(1);
        sequence
    }

    async fn handle_command(&mut self, command: Command) {
        match command {
            Command::AddInterface(iface) => self.add_interface(iface).await,
            Command::RemoveInterface(iface) => self.remove_interface(iface).await,
            Command::Ping(reply) => {
                let _ = reply.send(self.start_ping());
            }
            Command::Interfaces(reply) => {
                let active = self
                    .slots
                    .iter()
                    .filter(|slot| slot.is_active())
                    .filter_map(InterfaceSlot::info)
                    .collect();
                let _ = reply.send(active);
            }
        }
    }

    async fn add_interface(&mut self, iface: IpAddr) {
        let Some(device_id) = self.allocator.allocate() else {
            warn!(iface = %iface, side = %self.side, "device id band exhausted");
            return;
        };
        let mut slot = InterfaceSlot::requested(device_id, iface);

        let transceiver = match TransceiverBuilder::new()
            .queue_capacity(self.frame_queue_capacity)
            .wake(Arc::clone(&self.wake))
            .bind(iface, self.server_addr)
            .await
        {
            Ok(transceiver) => transceiver,
            Err(e) => {
                warn!(iface = %iface, error = %e, "failed to open interface");
                self.allocator.release(device_id);
                return;
            }
        };
        if let Err(transceiver) = slot.activate(transceiver) {
            self.allocator.release(device_id);
            transceiver.close().await;
            return;
        }

        let sequence = self.next_sequence();
        let begin = Frame::control(self.network, device_id, sequence, ControlMessage::ClientBegin);
        if let Some(transceiver) = slot.transceiver() {
            transceiver.send(begin.encode());
        }

        info!(device_id = %device_id, iface = %iface, "interface added");
        self.slots.push(slot);
    }

    async fn remove_interface(&mut self, iface: IpAddr) {
        let Some(index) = self
            .slots
            .iter()
            .position(|slot| slot.iface() == iface && slot.is_active())
        else {
            debug!(iface = %iface, "no active interface to remove");
            return;
        };

        let sequence = self.next_sequence();
        let mut slot = self.slots.remove(index);
        if slot.request_removal() {
            self.send_end(&slot, sequence).await;
        }
        if let Some(transceiver) = slot.close() {
            transceiver.close().await;
        }
        self.allocator.release(slot.device_id());
        info!(device_id = %slot.device_id(), iface = %iface, state = %slot.state(), "interface removed");
    }

    async fn send_end(&self, slot: &InterfaceSlot, sequence: u16) {
        let Some(transceiver) = slot.transceiver() else {
            return;
        };
        let end = Frame::control(
            self.network,
            slot.device_id(),
            sequence,
            ControlMessage::ClientEnd,
        );
        if let Err(e) = transceiver.send_now(&end.encode()).await {
            debug!(device_id = %slot.device_id(), error = %e, "failed to send end frame");
        }
    }

    async fn close_all(&mut self) {
        if !self.slots.is_empty() {
            let sequence = self.next_sequence();
            for mut slot in std::mem::take(&mut self.slots) {
                if slot.request_removal() {
                    self.send_end(&slot, sequence).await;
                }
                if let Some(transceiver) = slot.close() {
                    transceiver.close().await;
                }
                self.allocator.release(slot.device_id());
            }
        }
        trace!(network = %self.network, "multiplexer task stopped");
    }

    /// Send one application datagram out of every active interface.
    fn fan_out(&mut self, data: &[u8], from: SocketAddr) {
        if self.app_addr.is_none() && self.learned_app_addr != Some(from) {
            debug!(app = %from, "application address learned");
            self.learned_app_addr = Some(from);
        }

        for chunk in data.chunks(MAX_PAYLOAD_SIZE) {
            let sequence = self.next_sequence();
            let payload = Bytes::copy_from_slice(chunk);
            for slot in self.slots.iter().filter(|slot| slot.is_active()) {
                let frame = match Frame::new(self.network, slot.device_id(), sequence, payload.clone()) {
                    Ok(frame) => frame,
                    Err(e) => {
                        debug!(error = %e, "cannot frame application datagram");
                        break;
                    }
                };
                if let Some(transceiver) = slot.transceiver() {
                    trace!(device_id = %slot.device_id(), sequence, "sending");
                    transceiver.send(frame.encode());
                }
            }
        }
    }

    async fn drain_inbound(&mut self) {
        let mut received = Vec::new();
        for slot in self.slots.iter_mut().filter(|slot| slot.is_active()) {
            let device_id = slot.device_id();
            let iface = slot.iface();
            if let Some(transceiver) = slot.transceiver_mut() {
                while let Some(bytes) = transceiver.receive() {
                    received.push((device_id, iface, bytes));
                }
            }
        }

        for (device_id, iface, bytes) in received {
            let frame = match Frame::decode(&bytes) {
                Ok(frame) => frame,
                Err(e) => {
                    trace!(iface = %iface, error = %e, "dropping invalid frame");
                    continue;
                }
            };
            if *frame.network_id() != self.network {
                trace!(iface = %iface, "dropping frame from another network");
                continue;
            }

            if frame.is_control() {
                self.handle_control(&frame, device_id, iface);
            } else {
                self.deliver(frame).await;
            }
        }
    }

    fn handle_control(&mut self, frame: &Frame, device_id: DeviceId, iface: IpAddr) {
        if frame.control_message() != Some(ControlMessage::ServerPing) {
            debug!(iface = %iface, device_id = %frame.device_id(), "unexpected control frame");
            return;
        }
        let Some(pending) = &self.pending_ping else {
            trace!(iface = %iface, "ping echo with no ping outstanding");
            return;
        };
        if pending.sequence != frame.sequence() || frame.device_id().slot() != device_id.slot() {
            trace!(iface = %iface, sequence = frame.sequence(), "stale ping echo");
            return;
        }
        let echo = PingEcho {
            device_id,
            iface,
            at: Instant::now(),
        };
        if let Err(mpsc::error::TrySendError::Closed(_)) = pending.echoes.try_send(echo) {
            self.pending_ping = None;
        }
    }

    async fn deliver(&mut self, frame: Frame) {
        let Some(app) = self.app_addr.or(self.learned_app_addr) else {
            debug!(sequence = frame.sequence(), "no application address yet, dropping");
            return;
        };
        if !self.watermark.is_new(frame.sequence()) {
            trace!(sequence = frame.sequence(), "duplicate or stale frame");
            return;
        }
        self.watermark.advance(frame.sequence());
        if let Err(e) = self.socket.send_to(frame.payload(), app).await {
            warn!(app = %app, error = %e, "local delivery failed");
        }
    }

    fn start_ping(&mut self) -> Result<PingRound, ClientError> {
        if let Some(pending) = &self.pending_ping {
            if !pending.echoes.is_closed() {
                return Err(ClientError::PingInProgress);
            }
        }
        let seeded: Vec<(DeviceId, IpAddr)> = self
            .slots
            .iter()
            .filter(|slot| slot.is_active())
            .map(|slot| (slot.device_id(), slot.iface()))
            .collect();
        if seeded.is_empty() {
            return Err(ClientError::NoInterfaces);
        }

        let sequence = self.next_sequence();
        let started = Instant::now();
        for slot in self.slots.iter().filter(|slot| slot.is_active()) {
            let ping = Frame::control(self.network, slot.device_id(), sequence, ControlMessage::ServerPing);
            if let Some(transceiver) = slot.transceiver() {
                transceiver.send(ping.encode());
            }
        }

        let (tx, rx) = mpsc::channel(seeded.len() * 2);
        self.pending_ping = Some(PendingPing {
            sequence,
            echoes: tx,
        });
        debug!(sequence, paths = seeded.len(), "ping sent");

        Ok(PingRound {
            started,
            seeded,
            echoes: rx,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    const NET: [u8; 32] = [0x5A; 32];
    const LOOPBACK: IpAddr = IpAddr::V4(Ipv4Addr::LOCALHOST);

    async fn fake_relay() -> UdpSocket {
        UdpSocket::bind("127.0.0.1:0").await.unwrap()
    }

    async fn mux(relay: &UdpSocket, side: Side) -> Multiplexer {
        MultiplexerBuilder::new(NetworkId::new(NET))
            .local_addr("127.0.0.1:0".parse().unwrap())
            .server_addr(relay.local_addr().unwrap())
            .side(side)
            .bind()
            .await
            .unwrap()
    }

    async fn recv_frame(socket: &UdpSocket) -> (Frame, SocketAddr) {
        let mut buf = [0u8; 1024];
        let (len, from) = tokio::time::timeout(Duration::from_secs(2), socket.recv_from(&mut buf))
            .await
            .expect("datagram within timeout")
            .unwrap();
        (Frame::decode(&buf[..len]).unwrap(), from)
    }

    async fn recv_within(socket: &UdpSocket, ms: u64) -> Option<Vec<u8>> {
        let mut buf = [0u8; 1024];
        match tokio::time::timeout(Duration::from_millis(ms), socket.recv_from(&mut buf)).await {
            Ok(Ok((len, _))) => Some(buf[..len].to_vec()),
            _ => None,
        }
    }

    #[tokio::test]
    async fn test_bind_failure_is_reported() {
        let taken = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let err = MultiplexerBuilder::new(NetworkId::new(NET))
            .local_addr(taken.local_addr().unwrap())
            .bind()
            .await
            .unwrap_err();
        assert!(matches!(err, ClientError::BindFailed(_)));
    }

    #[test]
    fn test_builder_defaults() {
        let config = MultiplexerBuilder::new(NetworkId::new(NET)).build();
        assert_eq!(config.local_addr.port(), DEFAULT_LOCAL_PORT);
        assert_eq!(config.server_addr.port(), DEFAULT_SERVER_PORT);
        assert_eq!(config.side, Side::Gcs);
        assert_eq!(config.ping_window, PING_WINDOW);
        assert!(config.app_addr.is_none());
    }

    #[tokio::test]
    async fn test_add_interface_sends_begin() {
        let relay = fake_relay().await;
        let mut mux = mux(&relay, Side::Gcs).await;

        mux.add_interface(LOOPBACK).await.unwrap();
        let (frame, from) = recv_frame(&relay).await;
        assert_eq!(frame.device_id().get(), -32);
        assert_eq!(frame.control_message(), Some(ControlMessage::ClientBegin));

        let interfaces = mux.interfaces().await.unwrap();
        assert_eq!(interfaces.len(), 1);
        assert_eq!(interfaces[0].device_id, DeviceId::new(32).unwrap());
        assert_eq!(interfaces[0].local_addr, from);
        mux.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_fan_out_shares_sequence() {
        let relay = fake_relay().await;
        let mut mux = mux(&relay, Side::Uas).await;
        mux.add_interface(LOOPBACK).await.unwrap();
        mux.add_interface(LOOPBACK).await.unwrap();
        recv_frame(&relay).await;
        recv_frame(&relay).await;

        let app = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        app.send_to(b"position", mux.local_addr()).await.unwrap();

        let (a, _) = recv_frame(&relay).await;
        let (b, _) = recv_frame(&relay).await;
        assert_eq!(a.sequence(), b.sequence());
        assert_eq!(a.payload().as_ref(), b"position");
        assert_eq!(b.payload().as_ref(), b"position");
        let mut ids = [a.device_id().get(), b.device_id().get()];
        ids.sort();
        assert_eq!(ids, [1, 2]);
        mux.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_oversized_datagram_is_chunked() {
        let relay = fake_relay().await;
        let mut mux = mux(&relay, Side::Uas).await;
        mux.add_interface(LOOPBACK).await.unwrap();
        let (begin, _) = recv_frame(&relay).await;

        let app = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let data: Vec<u8> = (0..400u16).map(|i| (i % 251) as u8).collect();
        app.send_to(&data, mux.local_addr()).await.unwrap();

        let mut rebuilt = Vec::new();
        let mut sequences = Vec::new();
        while rebuilt.len() < data.len() {
            let (frame, _) = recv_frame(&relay).await;
            sequences.push(frame.sequence());
            rebuilt.extend_from_slice(frame.payload());
        }
        assert_eq!(rebuilt, data);
        let first = begin.sequence().wrapping_add(1);
        assert_eq!(sequences, vec![first, first + 1, first + 2]);
        mux.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_inbound_dedup_and_delivery() {
        let relay = fake_relay().await;
        let app = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let mut mux = MultiplexerBuilder::new(NetworkId::new(NET))
            .local_addr("127.0.0.1:0".parse().unwrap())
            .server_addr(relay.local_addr().unwrap())
            .app_addr(app.local_addr().unwrap())
            .bind()
            .await
            .unwrap();
        mux.add_interface(LOOPBACK).await.unwrap();
        mux.add_interface(LOOPBACK).await.unwrap();
        let paths: Vec<SocketAddr> = mux
            .interfaces()
            .await
            .unwrap()
            .iter()
            .map(|info| info.local_addr)
            .collect();

        let frame = Frame::new(NetworkId::new(NET), DeviceId::new(1).unwrap(), 7, &b"hello"[..])
            .unwrap()
            .encode();
        for path in &paths {
            relay.send_to(&frame, path).await.unwrap();
        }
        assert_eq!(recv_within(&app, 2000).await.unwrap(), b"hello");
        assert!(recv_within(&app, 150).await.is_none());

        let stale = Frame::new(NetworkId::new(NET), DeviceId::new(1).unwrap(), 6, &b"old"[..])
            .unwrap()
            .encode();
        relay.send_to(&stale, paths[0]).await.unwrap();
        assert!(recv_within(&app, 150).await.is_none());

        let foreign = Frame::new(NetworkId::new([0x11; 32]), DeviceId::new(1).unwrap(), 9, &b"x"[..])
            .unwrap()
            .encode();
        relay.send_to(&foreign, paths[0]).await.unwrap();
        assert!(recv_within(&app, 150).await.is_none());

        let next = Frame::new(NetworkId::new(NET), DeviceId::new(1).unwrap(), 8, &b"next"[..])
            .unwrap()
            .encode();
        relay.send_to(&next, paths[1]).await.unwrap();
        assert_eq!(recv_within(&app, 2000).await.unwrap(), b"next");
        mux.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_ping_reports_echo_and_timeout() {
        let relay = fake_relay().await;
        let mux = Arc::new(mux(&relay, Side::Gcs).await);
        mux.add_interface(LOOPBACK).await.unwrap();
        mux.add_interface(LOOPBACK).await.unwrap();
        recv_frame(&relay).await;
        recv_frame(&relay).await;

        let pinger = {
            let mux = Arc::clone(&mux);
            tokio::spawn(async move { mux.ping().await })
        };

        // Echo only the ping sent by device 32.
        for _ in 0..2 {
            let mut buf = [0u8; 512];
            let (len, from) = relay.recv_from(&mut buf).await.unwrap();
            let frame = Frame::decode(&buf[..len]).unwrap();
            assert_eq!(frame.control_message(), Some(ControlMessage::ServerPing));
            if frame.device_id().get() == -32 {
                relay.send_to(&buf[..len], from).await.unwrap();
            }
        }

        let results = pinger.await.unwrap().unwrap();
        assert_eq!(results.len(), 2);
        let answered = results.iter().find(|r| r.device_id.get() == 32).unwrap();
        let silent = results.iter().find(|r| r.device_id.get() == 33).unwrap();
        assert!(!answered.is_timeout());
        assert!(answered.value() >= 0);
        assert_eq!(silent.value(), -1);
    }

    #[tokio::test]
    async fn test_concurrent_ping_is_rejected() {
        let relay = fake_relay().await;
        let mux = Arc::new(mux(&relay, Side::Uas).await);
        mux.add_interface(LOOPBACK).await.unwrap();

        let first = {
            let mux = Arc::clone(&mux);
            tokio::spawn(async move { mux.ping().await })
        };
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(matches!(mux.ping().await, Err(ClientError::PingInProgress)));

        let results = first.await.unwrap().unwrap();
        assert_eq!(results.len(), 1);
        assert!(results[0].is_timeout());

        // Finished rounds free the slot for the next ping.
        assert_eq!(mux.ping().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_ping_without_interfaces() {
        let relay = fake_relay().await;
        let mut mux = mux(&relay, Side::Uas).await;
        assert!(matches!(mux.ping().await, Err(ClientError::NoInterfaces)));
        mux.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_remove_interface_sends_end() {
        let relay = fake_relay().await;
        let mut mux = mux(&relay, Side::Uas).await;
        mux.add_interface(LOOPBACK).await.unwrap();
        recv_frame(&relay).await;

        mux.remove_interface(LOOPBACK).await.unwrap();
        let (end, _) = recv_frame(&relay).await;
        assert_eq!(end.device_id().get(), -1);
        assert_eq!(end.control_message(), Some(ControlMessage::ClientEnd));
        assert!(mux.interfaces().await.unwrap().is_empty());

        // Unknown and already-removed interfaces are ignored.
        mux.remove_interface(LOOPBACK).await.unwrap();
        mux.remove_interface("10.255.0.1".parse().unwrap()).await.unwrap();
        assert!(mux.interfaces().await.unwrap().is_empty());

        // The freed id is handed out again.
        mux.add_interface(LOOPBACK).await.unwrap();
        let (begin, _) = recv_frame(&relay).await;
        assert_eq!(begin.device_id().get(), -1);
        mux.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_shutdown_sends_end_on_every_path() {
        let relay = fake_relay().await;
        let mut mux = mux(&relay, Side::Gcs).await;
        mux.add_interface(LOOPBACK).await.unwrap();
        mux.add_interface(LOOPBACK).await.unwrap();
        recv_frame(&relay).await;
        recv_frame(&relay).await;

        mux.shutdown().await.unwrap();
        let (a, _) = recv_frame(&relay).await;
        let (b, _) = recv_frame(&relay).await;
        assert_eq!(a.control_message(), Some(ControlMessage::ClientEnd));
        assert_eq!(b.control_message(), Some(ControlMessage::ClientEnd));
        assert_eq!(a.sequence(), b.sequence());

        assert!(!mux.is_running());
        mux.shutdown().await.unwrap();
        assert!(matches!(
            mux.add_interface(LOOPBACK).await,
            Err(ClientError::Closed)
        ));
    }

    #[tokio::test]
    async fn test_resolve_server() {
        let addr = resolve_server("127.0.0.1:16250").await.unwrap();
        assert_eq!(addr, SocketAddr::from(([127, 0, 0, 1], 16250)));
        assert!(matches!(
            resolve_server("not an address").await,
            Err(ClientError::AddressResolution(_))
        ));
    }
}
