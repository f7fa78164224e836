//! TelemXnet - Client Multiplexer
//!
//! High-level API for applications talking through the relay: one local
//! endpoint, any number of redundant interface paths.

#[allow(clippy::module_inception)]
mod client;
mod dedup;
mod interface;
mod ping;

pub use client::*;
pub use dedup::*;
pub use interface::{InterfaceInfo, InterfaceState, SlotAllocator};
pub use ping::PingResult;
