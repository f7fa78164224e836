//! TelemXnet - Relay Server
//!
//! The rendezvous point every client path registers with. The relay keeps a
//! [`DeviceTable`] of device addresses per network and forwards data frames
//! from one side of the link to every registered device on the other.

mod routing;
#[allow(clippy::module_inception)]
mod server;

pub use routing::*;
pub use server::*;
