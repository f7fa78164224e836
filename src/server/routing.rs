//! Device routing table.
//!
//! Maps `(network, device)` to the address a device last registered from.
//! This is the only state the relay shares between concurrent datagram
//! handlers; every access goes through the table's lock.

use std::collections::HashMap;
use std::net::SocketAddr;

use tokio::sync::RwLock;

use crate::core::{DeviceId, NetworkId, Side};

/// Routing entries for every network served by one relay.
#[derive(Debug, Default)]
pub struct DeviceTable {
    entries: RwLock<HashMap<(NetworkId, DeviceId), SocketAddr>>,
}

impl DeviceTable {
    /// Create an empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or refresh a device's address. Last writer wins.
    ///
    /// Returns the address previously registered, if any.
    pub async fn register(
        &self,
        network: NetworkId,
        device: DeviceId,
        addr: SocketAddr,
    ) -> Option<SocketAddr> {
        self.entries
            .write()
            .await
            .insert((network, device.as_data()), addr)
    }

    /// Address of a device, or `None` if nobody has registered it.
    pub async fn lookup(&self, network: &NetworkId, device: DeviceId) -> Option<SocketAddr> {
        self.entries
            .read()
            .await
            .get(&(*network, device.as_data()))
            .copied()
    }

    /// Remove a device. Removing an absent device is a no-op.
    pub async fn unregister(&self, network: &NetworkId, device: DeviceId) -> Option<SocketAddr> {
        self.entries
            .write()
            .await
            .remove(&(*network, device.as_data()))
    }

    /// Registered devices on `side` of `network`, in slot order.
    pub async fn lookup_side(&self, network: &NetworkId, side: Side) -> Vec<(DeviceId, SocketAddr)> {
        let entries = self.entries.read().await;
        side.band()
            .filter_map(|slot| {
                let device = DeviceId::data(slot).ok()?;
                entries
                    .get(&(*network, device))
                    .map(|addr| (device, *addr))
            })
            .collect()
    }

    /// Number of registered devices across all networks.
    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    /// Whether the table is empty.
    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }
}
