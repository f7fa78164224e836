//! Protocol constants for TelemXnet.
//!
//! These values are fixed by the protocol and MUST NOT be changed: every
//! client and relay on a network has to agree on them.

use std::ops::RangeInclusive;
use std::time::Duration;

// =============================================================================
// FRAME LAYOUT
// =============================================================================

/// Frame delimiter. Byte stuffing guarantees it never occurs inside a frame.
pub const FRAME_DELIMITER: u8 = 0x00;

/// Network identifier size.
pub const NETWORK_ID_SIZE: usize = 32;

/// Device identifier size (signed byte).
pub const DEVICE_ID_SIZE: usize = 1;

/// Sequence number size (big-endian u16).
pub const SEQUENCE_SIZE: usize = 2;

/// Payload length prefix size.
pub const PAYLOAD_LENGTH_SIZE: usize = 1;

/// Truncated SHA-256 checksum size.
pub const CHECKSUM_SIZE: usize = 4;

/// Fixed header size (network id + device id + sequence + payload length).
pub const HEADER_SIZE: usize =
    NETWORK_ID_SIZE + DEVICE_ID_SIZE + SEQUENCE_SIZE + PAYLOAD_LENGTH_SIZE;

/// Ceiling on the unstuffed frame size.
pub const MAX_FRAME_SIZE: usize = 254;

/// Largest payload a single frame may carry.
pub const MAX_PAYLOAD_SIZE: usize = 174;

/// Receive buffer for a single datagram on any TelemXnet socket.
pub const RECV_BUFFER_SIZE: usize = 2048;

// =============================================================================
// DEVICE IDENTIFIERS
// =============================================================================

/// Smallest valid device identifier (control frame from device 64).
pub const MIN_DEVICE_ID: i8 = -64;

/// Largest valid device identifier.
pub const MAX_DEVICE_ID: i8 = 64;

/// Device slots on the vehicle side.
pub const UAS_BAND: RangeInclusive<u8> = 1..=31;

/// Device slots on the ground side.
pub const GCS_BAND: RangeInclusive<u8> = 32..=63;

/// Data frames with a device id in this range originate on the vehicle side.
pub const UAS_ORIGIN: RangeInclusive<u8> = 0..=31;

// =============================================================================
// CONTROL PAYLOADS
// =============================================================================

/// Registers the sending path with the relay.
pub const CLIENT_BEGIN: &[u8] = b"CLIENT-BEGIN";

/// Removes the sending path from the relay.
pub const CLIENT_END: &[u8] = b"CLIENT-END";

/// Echoed back by the relay for latency measurement.
pub const SERVER_PING: &[u8] = b"SERVER-PING";

// =============================================================================
// TIMING
// =============================================================================

/// How long a ping collects echoes before reporting timeouts.
pub const PING_WINDOW: Duration = Duration::from_millis(500);

/// Latency reported for an interface whose ping was not echoed.
pub const PING_TIMEOUT_LATENCY: i64 = -1;

/// Upper bound on waiting for a background loop to exit on shutdown.
pub const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(2);

/// Pause after a non-transient socket receive error.
pub const RECV_ERROR_BACKOFF: Duration = Duration::from_millis(1);

// =============================================================================
// DEFAULTS
// =============================================================================

/// Default relay server port.
pub const DEFAULT_SERVER_PORT: u16 = 16250;

/// Default application-facing port of a client.
pub const DEFAULT_LOCAL_PORT: u16 = 14650;
