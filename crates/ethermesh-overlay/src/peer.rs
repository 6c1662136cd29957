//! Per-peer link state.

use std::net::SocketAddr;

use serde::{Deserialize, Serialize};

use ethermesh_core::constants::{FIREWALL_OPENER_DELAY, PEER_DIRECT_PING_DELAY};
use ethermesh_core::Address;

/// What the topology remembers about one peer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Peer {
    pub address: Address,
    /// Last known direct UDP path, if any.
    pub direct_path: Option<SocketAddr>,
    pub last_direct_send: u64,
    pub last_direct_receive: u64,
    pub last_firewall_opener: u64,
}

impl Peer {
    #[must_use]
    pub fn new(address: Address) -> Self {
        Self {
            address,
            direct_path: None,
            last_direct_send: 0,
            last_direct_receive: 0,
            last_firewall_opener: 0,
        }
    }

    #[must_use]
    pub fn with_path(address: Address, path: SocketAddr) -> Self {
        Self {
            direct_path: Some(path),
            ..Self::new(address)
        }
    }

    #[must_use]
    pub fn has_direct_path(&self) -> bool {
        self.direct_path.is_some()
    }

    /// Whether this peer is due a HELLO keepalive.
    #[must_use]
    pub fn needs_ping(&self, now: u64) -> bool {
        self.has_direct_path() && now.saturating_sub(self.last_direct_send) >= PEER_DIRECT_PING_DELAY
    }

    /// Whether this peer is due a firewall-opener datagram.
    #[must_use]
    pub fn needs_firewall_opener(&self, now: u64) -> bool {
        self.has_direct_path()
            && now.saturating_sub(self.last_firewall_opener) >= FIREWALL_OPENER_DELAY
    }

    /// Most recent link activity in either direction.
    #[must_use]
    pub fn last_activity(&self) -> u64 {
        self.last_direct_send.max(self.last_direct_receive)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(seed: u8) -> Address {
        Address::new([seed; 5])
    }

    fn path() -> SocketAddr {
        "10.0.0.1:9993".parse().unwrap()
    }

    #[test]
    fn pathless_peer_never_needs_anything() {
        let p = Peer::new(addr(1));
        assert!(!p.needs_ping(u64::MAX));
        assert!(!p.needs_firewall_opener(u64::MAX));
    }

    #[test]
    fn ping_due_after_direct_ping_delay() {
        let mut p = Peer::with_path(addr(1), path());
        p.last_direct_send = 1000;
        assert!(!p.needs_ping(1000 + PEER_DIRECT_PING_DELAY - 1));
        assert!(p.needs_ping(1000 + PEER_DIRECT_PING_DELAY));
    }

    #[test]
    fn firewall_opener_due_after_opener_delay() {
        let mut p = Peer::with_path(addr(1), path());
        p.last_firewall_opener = 500;
        assert!(!p.needs_firewall_opener(500 + FIREWALL_OPENER_DELAY - 1));
        assert!(p.needs_firewall_opener(500 + FIREWALL_OPENER_DELAY));
    }

    #[test]
    fn fresh_peer_with_path_is_immediately_due() {
        let p = Peer::with_path(addr(1), path());
        assert!(p.needs_ping(PEER_DIRECT_PING_DELAY));
        assert!(p.needs_firewall_opener(FIREWALL_OPENER_DELAY));
    }

    #[test]
    fn last_activity_takes_later_direction() {
        let mut p = Peer::new(addr(1));
        p.last_direct_send = 5;
        p.last_direct_receive = 9;
        assert_eq!(p.last_activity(), 9);
    }
}
