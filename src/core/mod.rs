//! Core identifiers, constants, and error types.

pub mod constants;
mod error;
mod types;

pub use error::*;
pub use types::*;
