//! Node lifecycle and service loop orchestration for the ethermesh overlay.
//!
//! This crate ties the overlay subsystems together: it bootstraps the
//! node's on-disk identity and control-channel secret, constructs the
//! runtime environment in the correct order, drives the timer-based
//! service loop, and serves the authenticated loopback control channel
//! used by the companion CLI.

pub mod auth_token;
pub mod defaults;
pub mod error;
pub mod identity_store;
pub mod local_client;
pub mod logging;
pub mod netconf_bridge;
pub mod network;
pub mod node_config;
pub mod runtime;
pub mod service_cycle;
pub mod supervisor;

pub use error::NodeError;
pub use local_client::LocalClient;
pub use node_config::NodeConfig;
pub use supervisor::{Node, NodeOptions, TerminationReason};
