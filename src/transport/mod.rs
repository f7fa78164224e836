//! TelemXnet - Transport Layer
//!
//! This module provides everything between a logical frame and a UDP socket:
//!
//! - **Frame encoding/decoding**: [`Frame`], [`encode`], [`decode`] with a
//!   truncated SHA-256 checksum
//! - **Byte stuffing**: [`cobs`], which keeps `0x00` free as a delimiter
//! - **Reassembly**: [`FrameAssembler`] extracting delimited frames from a
//!   byte stream
//! - **Transceivers**: [`Transceiver`], one UDP endpoint per local interface
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────┐
//! │     Client Multiplexer / Relay          │
//! ├─────────────────────────────────────────┤
//! │         Transport Layer                 │  ← This module
//! │  frames, stuffing, reassembly, I/O      │
//! ├─────────────────────────────────────────┤
//! │              UDP                        │
//! └─────────────────────────────────────────┘
//! ```

mod buffer;
pub mod cobs;
mod frame;
mod transceiver;

pub use buffer::*;
pub use frame::*;
pub use transceiver::*;
