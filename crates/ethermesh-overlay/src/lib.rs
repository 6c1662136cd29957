//! Network-facing subsystems of an ethermesh node.
//!
//! These are the collaborators the supervisor wires together: the
//! demarcation point (UDP multiplexer), the peer topology database, the
//! multicaster, the packet switch, the host environment watcher, and the
//! helper subprocess service. Each owns its internal locks; all are shared
//! behind `Arc` by the runtime environment and never outlive it.

pub mod demarc;
pub mod error;
pub mod multicast;
pub mod packet;
pub mod peer;
pub mod service;
pub mod switch;
pub mod sysenv;
pub mod topology;

pub use demarc::Demarc;
pub use error::OverlayError;
pub use multicast::{Multicaster, MulticastGroup};
pub use packet::{ErrorCode, Packet, Verb};
pub use service::Service;
pub use switch::Switch;
pub use sysenv::SysEnv;
pub use topology::Topology;
