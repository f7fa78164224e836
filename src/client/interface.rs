//! Interface slots.
//!
//! Each local interface handed to a multiplexer occupies one slot: a device
//! id from the multiplexer's side band plus the transceiver bound to that
//! interface. Slots move strictly forward through
//! `Requested -> Active -> RemovalRequested -> Closed`.

use std::collections::BTreeSet;
use std::fmt;
use std::net::{IpAddr, SocketAddr};

use crate::core::{DeviceId, Side};
use crate::transport::Transceiver;

/// Lifecycle state of an interface slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InterfaceState {
    /// Device id allocated, transceiver not yet running.
    Requested,
    /// Transceiver running and registered with the relay.
    Active,
    /// Removal requested; the end frame is being sent.
    RemovalRequested,
    /// Transceiver stopped and slot released.
    Closed,
}

impl InterfaceState {
    /// Whether `self -> next` is a legal transition.
    pub fn can_transition_to(self, next: InterfaceState) -> bool {
        matches!(
            (self, next),
            (InterfaceState::Requested, InterfaceState::Active)
                | (InterfaceState::Active, InterfaceState::RemovalRequested)
                | (InterfaceState::RemovalRequested, InterfaceState::Closed)
        )
    }
}

impl fmt::Display for InterfaceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            InterfaceState::Requested => "requested",
            InterfaceState::Active => "active",
            InterfaceState::RemovalRequested => "removal-requested",
            InterfaceState::Closed => "closed",
        };
        f.write_str(s)
    }
}

/// Snapshot of one active interface.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InterfaceInfo {
    /// Device id the relay knows this path by.
    pub device_id: DeviceId,
    /// Local interface address.
    pub iface: IpAddr,
    /// Local socket address of the transceiver.
    pub local_addr: SocketAddr,
}

/// Hands out device ids from one side's band, lowest free first.
#[derive(Debug, Clone)]
pub struct SlotAllocator {
    side: Side,
    in_use: BTreeSet<u8>,
}

impl SlotAllocator {
    /// Create an allocator for `side`.
    pub fn new(side: Side) -> Self {
        Self {
            side,
            in_use: BTreeSet::new(),
        }
    }

    /// Side this allocator serves.
    pub fn side(&self) -> Side {
        self.side
    }

    /// Allocate the lowest free id, or `None` if the band is exhausted.
    pub fn allocate(&mut self) -> Option<DeviceId> {
        let slot = self.side.band().find(|slot| !self.in_use.contains(slot))?;
        let id = DeviceId::data(slot).ok()?;
        self.in_use.insert(slot);
        Some(id)
    }

    /// Return an id to the pool. Releasing a free id is a no-op.
    pub fn release(&mut self, id: DeviceId) {
        self.in_use.remove(&id.slot());
    }

    /// Number of ids currently allocated.
    pub fn allocated(&self) -> usize {
        self.in_use.len()
    }
}

/// One interface owned by a multiplexer's loop.
#[derive(Debug)]
pub(crate) struct InterfaceSlot {
    device_id: DeviceId,
    iface: IpAddr,
    state: InterfaceState,
    transceiver: Option<Transceiver>,
}

impl InterfaceSlot {
    pub(crate) fn requested(device_id: DeviceId, iface: IpAddr) -> Self {
        Self {
            device_id,
            iface,
            state: InterfaceState::Requested,
            transceiver: None,
        }
    }

    pub(crate) fn device_id(&self) -> DeviceId {
        self.device_id
    }

    pub(crate) fn iface(&self) -> IpAddr {
        self.iface
    }

    pub(crate) fn state(&self) -> InterfaceState {
        self.state
    }

    pub(crate) fn is_active(&self) -> bool {
        self.state == InterfaceState::Active
    }

    fn transition(&mut self, next: InterfaceState) -> bool {
        if self.state.can_transition_to(next) {
            self.state = next;
            true
        } else {
            false
        }
    }

    /// Attach a running transceiver. Fails, handing it back, unless the
    /// slot is still `Requested`.
    pub(crate) fn activate(&mut self, transceiver: Transceiver) -> Result<(), Transceiver> {
        if self.transition(InterfaceState::Active) {
            self.transceiver = Some(transceiver);
            Ok(())
        } else {
            Err(transceiver)
        }
    }

    /// Begin removal. Only an active slot can be removed.
    pub(crate) fn request_removal(&mut self) -> bool {
        self.transition(InterfaceState::RemovalRequested)
    }

    /// Finish removal, handing back the transceiver to be closed.
    pub(crate) fn close(&mut self) -> Option<Transceiver> {
        if self.transition(InterfaceState::Closed) {
            self.transceiver.take()
        } else {
            None
        }
    }

    /// The transceiver, while the slot is active or being removed.
    pub(crate) fn transceiver(&self) -> Option<&Transceiver> {
        self.transceiver.as_ref()
    }

    pub(crate) fn transceiver_mut(&mut self) -> Option<&mut Transceiver> {
        self.transceiver.as_mut()
    }

    pub(crate) fn info(&self) -> Option<InterfaceInfo> {
        let transceiver = self.transceiver.as_ref()?;
        Some(InterfaceInfo {
            device_id: self.device_id,
            iface: self.iface,
            local_addr: transceiver.local_addr(),
        })
    }
}
