//! # TelemXnet
//!
//! Redundant multi-path UDP telemetry relay between unmanned vehicles and
//! ground control stations.
//!
//! A vehicle (UAS) and a ground station (GCS) each run a client
//! [`Multiplexer`](client::Multiplexer) next to their application. Every
//! application datagram is sent through *all* of the machine's network
//! interfaces at once (cellular, Wi-Fi, VPN, ...) to a shared relay
//! [`RelayServer`](server::RelayServer), which forwards it to every
//! registered device on the other side of the link. The receiving
//! multiplexer delivers the first copy to arrive and drops the rest.
//!
//! - **Redundancy**: one logical send travels every path; losing a path
//!   loses nothing as long as one survives
//! - **Isolation**: a 32-byte network id partitions independent vehicle
//!   fleets sharing one relay
//! - **Integrity**: every frame carries a truncated SHA-256 checksum;
//!   corrupted or forged frames are dropped silently
//!
//! ## Feature Flags
//!
//! - `client` (default): Client multiplexer and interface management
//! - `server` (default): Relay server and routing table
//! - `cli`: The `telemx-server` and `telemx-client` binaries
//!
//! ## Modules
//!
//! - [`core`]: Constants, identifiers, and error types (always included)
//! - [`transport`]: Frame codec, reassembly, and transceivers (always included)
//! - [`client`]: Client multiplexer (requires `client` feature)
//! - [`server`]: Relay server (requires `server` feature)
//!
//! ## Example Usage
//!
//! ```rust
//! use telemxnet::prelude::*;
//!
//! let network = NetworkId::new([0x42; 32]);
//! let device = DeviceId::new(1).unwrap();
//!
//! let frame = Frame::new(network, device, 7, &b"HEARTBEAT"[..]).unwrap();
//! let wire = frame.encode();
//!
//! let decoded = Frame::decode(&wire).unwrap();
//! assert_eq!(decoded.sequence(), 7);
//! assert_eq!(decoded.payload().as_ref(), b"HEARTBEAT");
//! assert_eq!(device.origin_side(), Some(Side::Uas));
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![cfg_attr(docsrs, feature(doc_cfg))]

// Core module (always included)
pub mod core;

// Transport layer (always included)
pub mod transport;

// Client API (feature-gated)
#[cfg(feature = "client")]
#[cfg_attr(docsrs, doc(cfg(feature = "client")))]
pub mod client;

// Server API (feature-gated)
#[cfg(feature = "server")]
#[cfg_attr(docsrs, doc(cfg(feature = "server")))]
pub mod server;

// Binary support
#[cfg(feature = "cli")]
#[cfg_attr(docsrs, doc(cfg(feature = "cli")))]
pub mod logging;

/// Prelude module for convenient imports.
pub mod prelude {
    pub use crate::core::*;

    pub use crate::transport::{Frame, FrameAssembler, FrameError, Transceiver, TransceiverBuilder};

    #[cfg(feature = "client")]
    pub use crate::client::{
        ClientConfig, ClientError, InterfaceInfo, Multiplexer, MultiplexerBuilder, PingResult,
    };

    #[cfg(feature = "server")]
    pub use crate::server::{
        DeviceTable, RelayServer, RelayServerBuilder, RelayStatsSnapshot, ServerConfig,
        ServerError,
    };
}

// Re-export commonly used items at crate root
pub use crate::core::{ControlMessage, DeviceId, NetworkId, Result, Side, TelemxError};
pub use crate::transport::{Frame, FrameError, decode, encode};
