//! Per-interface UDP transceiver.
//!
//! A transceiver owns one UDP socket bound to a local interface address and
//! connected to the relay server. Its own task performs every socket write
//! and read; callers only enqueue outbound frames and pick up reassembled
//! inbound frames, so neither side ever blocks on socket readiness.

use std::io;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use bytes::Bytes;
use tokio::net::UdpSocket;
use tokio::sync::{Notify, mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

use super::buffer::{DEFAULT_MAX_BUFFERED, FrameAssembler};
use crate::core::constants::{RECV_BUFFER_SIZE, RECV_ERROR_BACKOFF, SHUTDOWN_TIMEOUT};

/// Default depth of the outbound and inbound frame queues.
pub const DEFAULT_QUEUE_CAPACITY: usize = 256;

/// Builder for creating transceivers with custom options.
#[derive(Debug, Clone)]
pub struct TransceiverBuilder {
    queue_capacity: usize,
    max_buffered: usize,
    wake: Option<Arc<Notify>>,
}

impl Default for TransceiverBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl TransceiverBuilder {
    /// Create a new builder with default options.
    pub fn new() -> Self {
        Self {
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            max_buffered: DEFAULT_MAX_BUFFERED,
            wake: None,
        }
    }

    /// Set the depth of the outbound and inbound queues.
    pub fn queue_capacity(mut self, capacity: usize) -> Self {
        self.queue_capacity = capacity.max(1);
        self
    }

    /// Set the reassembly buffer cap.
    pub fn max_buffered(mut self, max: usize) -> Self {
        self.max_buffered = max;
        self
    }

    /// Notify `wake` whenever a frame becomes available via [`Transceiver::receive`].
    pub fn wake(mut self, wake: Arc<Notify>) -> Self {
        self.wake = Some(wake);
        self
    }

    /// Bind to `iface` on an ephemeral port, connect to `server`, and start
    /// the I/O task.
    pub async fn bind(self, iface: IpAddr, server: SocketAddr) -> io::Result<Transceiver> {
        let socket = UdpSocket::bind(SocketAddr::new(iface, 0)).await?;
        socket.connect(server).await?;
        let local_addr = socket.local_addr()?;
        let socket = Arc::new(socket);

        let (outbound_tx, outbound_rx) = mpsc::channel(self.queue_capacity);
        let (inbound_tx, inbound_rx) = mpsc::channel(self.queue_capacity);
        let (shutdown_tx, shutdown_rx) = oneshot::channel();

        let io = TransceiverIo {
            socket: Arc::clone(&socket),
            local_addr,
            assembler: FrameAssembler::with_max_buffered(self.max_buffered),
            inbound: inbound_tx,
            wake: self.wake,
        };
        let task = tokio::spawn(io.run(outbound_rx, shutdown_rx));

        debug!(iface = %iface, local = %local_addr, server = %server, "transceiver started");

        Ok(Transceiver {
            iface,
            local_addr,
            server_addr: server,
            socket,
            outbound: outbound_tx,
            inbound: inbound_rx,
            shutdown_tx: Some(shutdown_tx),
            task: Some(task),
        })
    }
}

/// One network path to the relay server.
#[derive(Debug)]
pub struct Transceiver {
    iface: IpAddr,
    local_addr: SocketAddr,
    server_addr: SocketAddr,
    socket: Arc<UdpSocket>,
    outbound: mpsc::Sender<Bytes>,
    inbound: mpsc::Receiver<Bytes>,
    shutdown_tx: Option<oneshot::Sender<()>>,
    task: Option<JoinHandle<()>>,
}

impl Transceiver {
    /// Bind with default options. See [`TransceiverBuilder::bind`].
    pub async fn bind(iface: IpAddr, server: SocketAddr) -> io::Result<Self> {
        TransceiverBuilder::new().bind(iface, server).await
    }

    /// Local interface address this transceiver is bound to.
    pub fn iface(&self) -> IpAddr {
        self.iface
    }

    /// Full local socket address (interface plus ephemeral port).
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Relay server address.
    pub fn server_addr(&self) -> SocketAddr {
        self.server_addr
    }

    /// Queue an encoded frame for sending.
    ///
    /// Never blocks. Returns `false` if the queue is full or the I/O task
    /// has stopped, in which case the frame is dropped.
    pub fn send(&self, frame: Bytes) -> bool {
        match self.outbound.try_send(frame) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!(iface = %self.iface, "outbound queue full, dropping frame");
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        }
    }

    /// Write a frame directly, bypassing the queue.
    ///
    /// Used for the final frame on a path, which must not be discarded by
    /// the [`close`](Self::close) that follows.
    pub async fn send_now(&self, frame: &[u8]) -> io::Result<()> {
        self.socket.send(frame).await.map(|_| ())
    }

    /// Next reassembled inbound frame, if one is buffered.
    pub fn receive(&mut self) -> Option<Bytes> {
        self.inbound.try_recv().ok()
    }

    /// Wait for the next reassembled inbound frame.
    ///
    /// Returns `None` once the I/O task has stopped.
    pub async fn recv(&mut self) -> Option<Bytes> {
        self.inbound.recv().await
    }

    /// Stop the I/O task and release the socket.
    ///
    /// Frames still queued for sending are discarded.
    pub async fn close(mut self) {
        self.stop().await;
    }

    async fn stop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        if let Some(task) = self.task.take() {
            if tokio::time::timeout(SHUTDOWN_TIMEOUT, task).await.is_err() {
                warn!(iface = %self.iface, "transceiver task did not stop in time");
            }
        }
    }
}

impl Drop for Transceiver {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
    }
}

/// State owned by the transceiver's I/O task.
struct TransceiverIo {
    socket: Arc<UdpSocket>,
    local_addr: SocketAddr,
    assembler: FrameAssembler,
    inbound: mpsc::Sender<Bytes>,
    wake: Option<Arc<Notify>>,
}

impl TransceiverIo {
    async fn run(
        mut self,
        mut outbound: mpsc::Receiver<Bytes>,
        mut shutdown: oneshot::Receiver<()>,
    ) {
        let socket = Arc::clone(&self.socket);
        let mut buf = vec![0u8; RECV_BUFFER_SIZE];

        loop {
            tokio::select! {
                biased;

                _ = &mut shutdown => break,

                frame = outbound.recv() => match frame {
                    Some(frame) => {
                        if let Err(e) = socket.send(&frame).await {
                            debug!(local = %self.local_addr, error = %e, "send failed");
                        }
                    }
                    None => break,
                },

                result = socket.recv(&mut buf) => match result {
                    Ok(len) => self.ingest(&buf[..len]),
                    Err(e) if e.kind() == io::ErrorKind::ConnectionRefused => {
                        trace!(local = %self.local_addr, "relay unreachable");
                    }
                    Err(e) => {
                        debug!(local = %self.local_addr, error = %e, "recv failed");
                        tokio::time::sleep(RECV_ERROR_BACKOFF).await;
                    }
                },
            }
        }

        trace!(local = %self.local_addr, "transceiver stopped");
    }

    fn ingest(&mut self, chunk: &[u8]) {
        self.assembler.push(chunk);
        while let Some(frame) = self.assembler.next_frame() {
            match self.inbound.try_send(frame) {
                Ok(()) => {
                    if let Some(wake) = &self.wake {
                        wake.notify_one();
                    }
                }
                Err(mpsc::error::TrySendError::Full(_)) => {
                    debug!(local = %self.local_addr, "inbound queue full, dropping frame");
                }
                Err(mpsc::error::TrySendError::Closed(_)) => return,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::frame::{decode, encode};
    use std::time::Duration;

    const NET: [u8; 32] = [0x07; 32];
    const LOOPBACK: IpAddr = IpAddr::V4(std::net::Ipv4Addr::LOCALHOST);

    async fn wait_frame(t: &mut Transceiver) -> Bytes {
        tokio::time::timeout(Duration::from_secs(2), t.recv())
            .await
            .expect("frame within timeout")
            .expect("transceiver open")
    }

    #[tokio::test]
    async fn test_send_reaches_server() {
        let server = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let t = Transceiver::bind(LOOPBACK, server.local_addr().unwrap())
            .await
            .unwrap();

        let frame = encode(&NET, 1, 5, b"out").unwrap();
        assert!(t.send(frame.clone()));

        let mut buf = [0u8; 512];
        let (len, from) = tokio::time::timeout(Duration::from_secs(2), server.recv_from(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(&buf[..len], frame.as_ref());
        assert_eq!(from, t.local_addr());
        t.close().await;
    }

    #[tokio::test]
    async fn test_receive_reassembles_split_frame() {
        let server = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let mut t = Transceiver::bind(LOOPBACK, server.local_addr().unwrap())
            .await
            .unwrap();
        assert!(t.receive().is_none());

        let frame = encode(&NET, 33, 77, &[3u8; 100]).unwrap();
        let (head, tail) = frame.split_at(40);
        server.send_to(head, t.local_addr()).await.unwrap();
        server.send_to(tail, t.local_addr()).await.unwrap();

        let got = wait_frame(&mut t).await;
        assert_eq!(decode(&got).unwrap().sequence(), 77);
        t.close().await;
    }

    #[tokio::test]
    async fn test_two_frames_in_one_datagram() {
        let server = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let mut t = Transceiver::bind(LOOPBACK, server.local_addr().unwrap())
            .await
            .unwrap();

        let a = encode(&NET, 40, 1, b"a").unwrap();
        let b = encode(&NET, 40, 2, b"b").unwrap();
        let mut both = a.to_vec();
        both.extend_from_slice(&b);
        server.send_to(&both, t.local_addr()).await.unwrap();

        assert_eq!(wait_frame(&mut t).await, a);
        assert_eq!(wait_frame(&mut t).await, b);
        t.close().await;
    }

    #[tokio::test]
    async fn test_wake_notified_on_frame() {
        let server = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let wake = Arc::new(Notify::new());
        let mut t = TransceiverBuilder::new()
            .wake(Arc::clone(&wake))
            .bind(LOOPBACK, server.local_addr().unwrap())
            .await
            .unwrap();

        let frame = encode(&NET, 32, 1, b"ping").unwrap();
        server.send_to(&frame, t.local_addr()).await.unwrap();

        tokio::time::timeout(Duration::from_secs(2), wake.notified())
            .await
            .unwrap();
        assert_eq!(t.receive().unwrap(), frame);
        t.close().await;
    }

    #[tokio::test]
    async fn test_send_to_unreachable_relay_is_best_effort() {
        // Nothing listens on the server port: sends are best effort.
        let server = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = server.local_addr().unwrap();
        drop(server);

        let t = Transceiver::bind(LOOPBACK, addr).await.unwrap();
        let frame = encode(&NET, 1, 1, b"lost").unwrap();
        assert!(t.send(frame.clone()));
        assert!(t.send(frame));
        tokio::time::sleep(Duration::from_millis(20)).await;
        t.close().await;
    }
}
