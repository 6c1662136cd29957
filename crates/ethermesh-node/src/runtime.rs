//! The shared runtime environment.
//!
//! Owns every collaborator the supervisor constructs. Collaborators
//! receive `Arc` handles at construction and never outlive this struct.
//! Fields are declared in the *reverse* of construction order so Rust's
//! field drop order tears the node down last-built-first: netconf service,
//! environment watcher, topology, switch, multicaster, demarcation point,
//! node-config facade. The logger is process-global and is not owned here.

use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use rand::rngs::SmallRng;
use rand::Rng;

use ethermesh_core::Identity;
use ethermesh_overlay::{Demarc, Multicaster, Service, Switch, SysEnv, Topology};

use crate::node_config::NodeConfig;

/// Everything a running node owns.
pub struct RuntimeEnvironment {
    /// Present only when `services.d/netconf.service` exists on a POSIX
    /// host.
    pub netconf_service: Option<Service>,
    pub sysenv: Arc<SysEnv>,
    pub topology: Arc<Topology>,
    pub switch: Arc<Switch>,
    pub multicaster: Arc<Multicaster>,
    pub demarc: Arc<Demarc>,
    pub nc: Arc<NodeConfig>,
    pub identity: Arc<Identity>,
    /// Non-cryptographic PRNG for jitter and junk payloads. Never used
    /// for key material.
    pub prng: Mutex<SmallRng>,
    pub home: PathBuf,
}

impl RuntimeEnvironment {
    /// A small random junk payload for a firewall-opener datagram.
    #[must_use]
    pub fn firewall_opener_payload(&self) -> Vec<u8> {
        let mut prng = self.prng.lock().unwrap_or_else(|e| e.into_inner());
        let len = prng.gen_range(1..=4);
        (0..len).map(|_| prng.gen()).collect()
    }
}
