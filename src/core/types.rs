//! Identifiers shared by every layer of the relay network.

use std::fmt;
use std::ops::RangeInclusive;
use std::str::FromStr;

use super::constants::{
    CLIENT_BEGIN, CLIENT_END, GCS_BAND, MAX_DEVICE_ID, MIN_DEVICE_ID, NETWORK_ID_SIZE,
    SERVER_PING, UAS_BAND, UAS_ORIGIN,
};
use super::error::IdentifierError;

/// Shared 32-byte token partitioning independent relay networks.
///
/// This is an addressing secret, not a key: frames are never encrypted.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct NetworkId([u8; NETWORK_ID_SIZE]);

impl NetworkId {
    /// Create a network id from raw bytes.
    pub fn new(bytes: [u8; NETWORK_ID_SIZE]) -> Self {
        Self(bytes)
    }

    /// Create a network id from a slice, which must be exactly 32 bytes.
    pub fn from_slice(bytes: &[u8]) -> Result<Self, IdentifierError> {
        let bytes: [u8; NETWORK_ID_SIZE] = bytes
            .try_into()
            .map_err(|_| IdentifierError::NetworkIdLength(bytes.len()))?;
        Ok(Self(bytes))
    }

    /// Get the network id as bytes.
    pub fn as_bytes(&self) -> &[u8; NETWORK_ID_SIZE] {
        &self.0
    }

    /// Full hex rendering, suitable for sharing with peers.
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Short fingerprint for logs.
    pub fn fingerprint(&self) -> String {
        hex::encode(&self.0[..4])
    }
}

impl fmt::Debug for NetworkId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NetworkId({}..)", self.fingerprint())
    }
}

impl fmt::Display for NetworkId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}..", self.fingerprint())
    }
}

impl From<[u8; NETWORK_ID_SIZE]> for NetworkId {
    fn from(bytes: [u8; NETWORK_ID_SIZE]) -> Self {
        Self::new(bytes)
    }
}

impl TryFrom<&[u8]> for NetworkId {
    type Error = IdentifierError;

    fn try_from(bytes: &[u8]) -> Result<Self, Self::Error> {
        Self::from_slice(bytes)
    }
}

impl AsRef<[u8]> for NetworkId {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

/// Accepts either a literal 32-character string or 64 hex digits.
impl FromStr for NetworkId {
    type Err = IdentifierError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.len() == NETWORK_ID_SIZE * 2 {
            if let Ok(bytes) = hex::decode(s) {
                return Self::from_slice(&bytes);
            }
        }
        Self::from_slice(s.as_bytes())
    }
}

/// Which end of the link a device sits on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Side {
    /// Vehicle side (device slots 1-31).
    Uas,
    /// Ground control side (device slots 32-63).
    Gcs,
}

impl Side {
    /// First device slot allocated to a client on this side.
    pub fn base_id(self) -> u8 {
        *self.band().start()
    }

    /// Device slots belonging to this side.
    pub fn band(self) -> RangeInclusive<u8> {
        match self {
            Side::Uas => UAS_BAND,
            Side::Gcs => GCS_BAND,
        }
    }

    /// The opposite side, which receives this side's data.
    pub fn peer(self) -> Side {
        match self {
            Side::Uas => Side::Gcs,
            Side::Gcs => Side::Uas,
        }
    }
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Side::Uas => f.write_str("uas"),
            Side::Gcs => f.write_str("gcs"),
        }
    }
}

/// Signed device identifier in `[-64, 64]`.
///
/// Negative values mark control frames sent by device `abs(id)`; the
/// magnitude selects the side of the link.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DeviceId(i8);

impl DeviceId {
    /// Create a device id, rejecting values outside `[-64, 64]`.
    pub fn new(id: i8) -> Result<Self, IdentifierError> {
        if (MIN_DEVICE_ID..=MAX_DEVICE_ID).contains(&id) {
            Ok(Self(id))
        } else {
            Err(IdentifierError::DeviceIdOutOfRange(id))
        }
    }

    /// Device id for data frames from slot `slot`.
    pub fn data(slot: u8) -> Result<Self, IdentifierError> {
        let id = i8::try_from(slot).map_err(|_| IdentifierError::SlotOutOfRange(slot))?;
        Self::new(id)
    }

    /// Device id for control frames from slot `slot`.
    pub fn control(slot: u8) -> Result<Self, IdentifierError> {
        let id = i8::try_from(slot).map_err(|_| IdentifierError::SlotOutOfRange(slot))?;
        Self::new(-id)
    }

    /// Raw signed value as carried on the wire.
    pub fn get(self) -> i8 {
        self.0
    }

    /// Whether this id marks a control frame.
    pub fn is_control(self) -> bool {
        self.0 < 0
    }

    /// Device slot, i.e. `abs(id)`.
    pub fn slot(self) -> u8 {
        self.0.unsigned_abs()
    }

    /// The same slot as a control id.
    ///
    /// Slot 0 has no control form and comes back as the data id `0`.
    /// Client slots are allocated from `1..=63`, so they never hit this.
    pub fn as_control(self) -> Self {
        Self(-(self.slot() as i8))
    }

    /// The same slot as a data id.
    pub fn as_data(self) -> Self {
        Self(self.slot() as i8)
    }

    /// Side of the link a data frame with this id originates from.
    ///
    /// Returns `None` for control ids and for ids outside both bands.
    pub fn origin_side(self) -> Option<Side> {
        if self.is_control() {
            return None;
        }
        let slot = self.slot();
        if UAS_ORIGIN.contains(&slot) {
            Some(Side::Uas)
        } else if GCS_BAND.contains(&slot) {
            Some(Side::Gcs)
        } else {
            None
        }
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl TryFrom<i8> for DeviceId {
    type Error = IdentifierError;

    fn try_from(id: i8) -> Result<Self, Self::Error> {
        Self::new(id)
    }
}

impl From<DeviceId> for i8 {
    fn from(id: DeviceId) -> i8 {
        id.0
    }
}

/// Management payloads carried under a negative device id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ControlMessage {
    /// Register the sending path.
    ClientBegin,
    /// Unregister the sending path.
    ClientEnd,
    /// Latency probe echoed by the relay.
    ServerPing,
}

impl ControlMessage {
    /// Exact wire bytes of this message.
    pub fn as_bytes(self) -> &'static [u8] {
        match self {
            ControlMessage::ClientBegin => CLIENT_BEGIN,
            ControlMessage::ClientEnd => CLIENT_END,
            ControlMessage::ServerPing => SERVER_PING,
        }
    }

    /// Parse a control payload; anything unrecognised yields `None`.
    pub fn from_bytes(payload: &[u8]) -> Option<Self> {
        match payload {
            CLIENT_BEGIN => Some(ControlMessage::ClientBegin),
            CLIENT_END => Some(ControlMessage::ClientEnd),
            SERVER_PING => Some(ControlMessage::ServerPing),
            _ => None,
        }
    }
}
