//! Ping results and echo collection.

use std::collections::HashMap;
use std::fmt;
use std::net::IpAddr;
use std::time::{Duration, Instant};

use crate::core::DeviceId;
use crate::core::constants::PING_TIMEOUT_LATENCY;

/// Round-trip result for one interface.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PingResult {
    /// Device id of the probed path.
    pub device_id: DeviceId,
    /// Local interface of the probed path.
    pub iface: IpAddr,
    /// Round-trip time, or `None` if no echo arrived within the window.
    pub latency: Option<Duration>,
}

impl PingResult {
    /// Latency in whole milliseconds, or `-1` on timeout.
    pub fn value(&self) -> i64 {
        match self.latency {
            Some(latency) => latency.as_millis() as i64,
            None => PING_TIMEOUT_LATENCY,
        }
    }

    /// Whether the path failed to answer.
    pub fn is_timeout(&self) -> bool {
        self.latency.is_none()
    }
}

impl fmt::Display for PingResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.latency {
            Some(latency) => write!(
                f,
                "device {} via {}: {:.1} ms",
                self.device_id,
                self.iface,
                latency.as_secs_f64() * 1000.0
            ),
            None => write!(f, "device {} via {}: timeout", self.device_id, self.iface),
        }
    }
}

/// An echoed ping observed by the multiplexer loop.
#[derive(Debug, Clone, Copy)]
pub(crate) struct PingEcho {
    pub(crate) device_id: DeviceId,
    pub(crate) iface: IpAddr,
    pub(crate) at: Instant,
}

/// Gathers echoes for one ping round.
#[derive(Debug)]
pub(crate) struct PingCollector {
    started: Instant,
    seeded: Vec<(DeviceId, IpAddr)>,
    echoes: HashMap<(DeviceId, IpAddr), Duration>,
}

impl PingCollector {
    pub(crate) fn new(started: Instant, seeded: Vec<(DeviceId, IpAddr)>) -> Self {
        Self {
            started,
            seeded,
            echoes: HashMap::new(),
        }
    }

    /// Record an echo. Only the first echo for a seeded path counts.
    pub(crate) fn record(&mut self, echo: PingEcho) -> bool {
        let key = (echo.device_id, echo.iface);
        if !self.seeded.contains(&key) || self.echoes.contains_key(&key) {
            return false;
        }
        self.echoes
            .insert(key, echo.at.saturating_duration_since(self.started));
        true
    }

    pub(crate) fn is_complete(&self) -> bool {
        self.echoes.len() == self.seeded.len()
    }

    /// One result per seeded path, in seeding order.
    pub(crate) fn finish(self) -> Vec<PingResult> {
        self.seeded
            .iter()
            .map(|&(device_id, iface)| PingResult {
                device_id,
                iface,
                latency: self.echoes.get(&(device_id, iface)).copied(),
            })
            .collect()
    }
}
