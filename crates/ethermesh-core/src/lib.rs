//! Core types and codecs for the ethermesh overlay.
//!
//! This crate holds everything the node and its companion CLI must agree on
//! without talking to each other: overlay addresses, the long-lived node
//! identity and its on-disk serializations, protocol timing constants, the
//! embedded version stamp, the dictionary line codec spoken to helper
//! subprocesses, and the authenticated message codec for the loopback
//! control channel.

pub mod address;
pub mod constants;
pub mod control;
pub mod dictionary;
pub mod error;
pub mod identity;
pub mod time;
pub mod version;

pub use address::Address;
pub use dictionary::Dictionary;
pub use error::CoreError;
pub use identity::Identity;
pub use time::now_ms;
