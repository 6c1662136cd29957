//! The peer topology database.
//!
//! Holds everything known about other peers: their addresses, last-known
//! direct paths, and link activity timestamps, plus the registry of
//! well-known supernodes. Persisted to `peer.db` with an atomic
//! write-then-rename so a crash never leaves a torn file.

use std::collections::{BTreeSet, HashMap};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use tracing::{debug, warn};

use ethermesh_core::constants::PEER_EXPIRATION;
use ethermesh_core::Address;

use crate::demarc::Demarc;
use crate::error::OverlayError;
use crate::peer::Peer;

/// The peer database and supernode registry.
pub struct Topology {
    db_path: PathBuf,
    our_address: Address,
    peers: Mutex<HashMap<Address, Peer>>,
    supernodes: Mutex<BTreeSet<Address>>,
}

impl Topology {
    /// Open the topology backed by `db_path`, loading any persisted peers.
    ///
    /// A missing database starts empty; a corrupt one is discarded with a
    /// warning rather than failing startup.
    pub fn new(db_path: impl Into<PathBuf>, our_address: Address) -> Result<Self, OverlayError> {
        let db_path = db_path.into();
        let peers = match std::fs::read(&db_path) {
            Ok(bytes) => match postcard::from_bytes::<Vec<Peer>>(&bytes) {
                Ok(list) => {
                    debug!("loaded {} peers from {}", list.len(), db_path.display());
                    list.into_iter().map(|p| (p.address, p)).collect()
                }
                Err(e) => {
                    warn!("discarding corrupt peer database: {e}");
                    HashMap::new()
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => HashMap::new(),
            Err(e) => return Err(OverlayError::Io(e)),
        };

        Ok(Self {
            db_path,
            our_address,
            peers: Mutex::new(peers),
            supernodes: Mutex::new(BTreeSet::new()),
        })
    }

    /// Install the well-known supernode list, creating or re-pathing their
    /// peer entries.
    pub fn set_supernodes(&self, supernodes: &[(Address, SocketAddr)]) {
        let mut set = self.supernodes.lock().unwrap_or_else(|e| e.into_inner());
        let mut peers = self.peers.lock().unwrap_or_else(|e| e.into_inner());
        set.clear();
        for (address, path) in supernodes {
            set.insert(*address);
            peers
                .entry(*address)
                .and_modify(|p| p.direct_path = Some(*path))
                .or_insert_with(|| Peer::with_path(*address, *path));
        }
    }

    /// Whether this node is itself a supernode.
    #[must_use]
    pub fn am_supernode(&self) -> bool {
        self.supernodes
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .contains(&self.our_address)
    }

    /// Supernodes (other than ourselves) whose last direct send is stale.
    #[must_use]
    pub fn supernodes_needing_ping(&self, now: u64) -> Vec<Address> {
        let set = self.supernodes.lock().unwrap_or_else(|e| e.into_inner());
        let peers = self.peers.lock().unwrap_or_else(|e| e.into_inner());
        set.iter()
            .filter(|a| **a != self.our_address)
            .filter(|a| peers.get(a).is_some_and(|p| p.needs_ping(now)))
            .copied()
            .collect()
    }

    /// Every peer (other than ourselves) with a direct path.
    #[must_use]
    pub fn peers_with_direct_path(&self) -> Vec<Address> {
        let peers = self.peers.lock().unwrap_or_else(|e| e.into_inner());
        peers
            .values()
            .filter(|p| p.address != self.our_address && p.has_direct_path())
            .map(|p| p.address)
            .collect()
    }

    /// Peers due a HELLO keepalive.
    #[must_use]
    pub fn peers_needing_ping(&self, now: u64) -> Vec<Address> {
        let peers = self.peers.lock().unwrap_or_else(|e| e.into_inner());
        peers
            .values()
            .filter(|p| p.address != self.our_address && p.needs_ping(now))
            .map(|p| p.address)
            .collect()
    }

    /// Peers due a firewall-opener datagram. Supernodes are never
    /// firewalled and are excluded.
    #[must_use]
    pub fn peers_needing_firewall_opener(&self, now: u64) -> Vec<Address> {
        let set = self.supernodes.lock().unwrap_or_else(|e| e.into_inner());
        let peers = self.peers.lock().unwrap_or_else(|e| e.into_inner());
        peers
            .values()
            .filter(|p| {
                p.address != self.our_address
                    && !set.contains(&p.address)
                    && p.needs_firewall_opener(now)
            })
            .map(|p| p.address)
            .collect()
    }

    /// Announce targets: supernodes plus every peer with a direct path.
    #[must_use]
    pub fn announce_targets(&self) -> Vec<Address> {
        let set = self.supernodes.lock().unwrap_or_else(|e| e.into_inner());
        let peers = self.peers.lock().unwrap_or_else(|e| e.into_inner());
        let mut targets: BTreeSet<Address> = set
            .iter()
            .filter(|a| **a != self.our_address)
            .copied()
            .collect();
        targets.extend(
            peers
                .values()
                .filter(|p| p.address != self.our_address && p.has_direct_path())
                .map(|p| p.address),
        );
        targets.into_iter().collect()
    }

    /// The direct path to `address`, if known.
    #[must_use]
    pub fn direct_path(&self, address: Address) -> Option<SocketAddr> {
        self.peers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(&address)
            .and_then(|p| p.direct_path)
    }

    /// A fallback transit path through any supernode.
    #[must_use]
    pub fn first_supernode_path(&self) -> Option<SocketAddr> {
        let set = self.supernodes.lock().unwrap_or_else(|e| e.into_inner());
        let peers = self.peers.lock().unwrap_or_else(|e| e.into_inner());
        set.iter()
            .filter(|a| **a != self.our_address)
            .find_map(|a| peers.get(a).and_then(|p| p.direct_path))
    }

    /// Snapshot of one peer.
    #[must_use]
    pub fn get(&self, address: Address) -> Option<Peer> {
        self.peers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(&address)
            .cloned()
    }

    #[must_use]
    pub fn peer_count(&self) -> usize {
        self.peers.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    /// Record an outbound send toward `address`, creating the peer entry
    /// if this is the first contact.
    pub fn note_direct_send(&self, address: Address, now: u64) {
        let mut peers = self.peers.lock().unwrap_or_else(|e| e.into_inner());
        peers
            .entry(address)
            .or_insert_with(|| Peer::new(address))
            .last_direct_send = now;
    }

    /// Record an inbound datagram from `address` at `src`, learning the
    /// direct path if none was known.
    pub fn note_direct_receive(&self, address: Address, src: SocketAddr, now: u64) {
        let mut peers = self.peers.lock().unwrap_or_else(|e| e.into_inner());
        let peer = peers.entry(address).or_insert_with(|| Peer::new(address));
        peer.last_direct_receive = now;
        if peer.direct_path.is_none() {
            peer.direct_path = Some(src);
        }
    }

    /// Send a firewall-opener datagram to `address` and record it.
    pub async fn send_firewall_opener(
        &self,
        address: Address,
        demarc: &Demarc,
        payload: &[u8],
        now: u64,
    ) -> Result<(), OverlayError> {
        let path = self.direct_path(address).ok_or(OverlayError::NotBound)?;
        demarc.send_to(path, payload).await?;
        let mut peers = self.peers.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(peer) = peers.get_mut(&address) {
            peer.last_firewall_opener = now;
        }
        Ok(())
    }

    /// Evict peers with no link activity inside the expiration window,
    /// then persist. Supernodes are never evicted. Returns how many peers
    /// were dropped.
    pub fn clean(&self, now: u64) -> usize {
        let evicted = {
            let set = self.supernodes.lock().unwrap_or_else(|e| e.into_inner());
            let mut peers = self.peers.lock().unwrap_or_else(|e| e.into_inner());
            let before = peers.len();
            peers.retain(|address, peer| {
                set.contains(address) || now.saturating_sub(peer.last_activity()) < PEER_EXPIRATION
            });
            before - peers.len()
        };
        if let Err(e) = self.save() {
            warn!("could not persist peer database: {e}");
        }
        evicted
    }

    /// Write the peer database atomically.
    pub fn save(&self) -> Result<(), OverlayError> {
        let snapshot: Vec<Peer> = {
            let peers = self.peers.lock().unwrap_or_else(|e| e.into_inner());
            peers.values().cloned().collect()
        };
        let bytes = postcard::to_allocvec(&snapshot)
            .map_err(|e| OverlayError::PeerDatabase(e.to_string()))?;
        atomic_write(&self.db_path, &bytes)
    }
}

fn atomic_write(path: &Path, data: &[u8]) -> Result<(), OverlayError> {
    let tmp = path.with_extension("tmp");
    std::fs::write(&tmp, data)?;
    std::fs::rename(&tmp, path)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use ethermesh_core::constants::{FIREWALL_OPENER_DELAY, PEER_DIRECT_PING_DELAY};

    fn addr(seed: u8) -> Address {
        Address::new([seed; 5])
    }

    fn sn_path(seed: u8) -> SocketAddr {
        format!("10.9.9.{seed}:9993").parse().unwrap()
    }

    fn topology(dir: &tempfile::TempDir) -> Topology {
        Topology::new(dir.path().join("peer.db"), addr(0xEE)).unwrap()
    }

    #[test]
    fn starts_empty_without_database() {
        let dir = tempfile::tempdir().unwrap();
        let t = topology(&dir);
        assert_eq!(t.peer_count(), 0);
        assert!(!t.am_supernode());
    }

    #[test]
    fn corrupt_database_is_discarded() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("peer.db"), b"\xff\xff not postcard").unwrap();
        let t = topology(&dir);
        assert_eq!(t.peer_count(), 0);
    }

    #[test]
    fn save_load_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let t = topology(&dir);
        t.note_direct_send(addr(1), 42);
        t.note_direct_receive(addr(1), sn_path(7), 43);
        t.save().unwrap();

        let reloaded = topology(&dir);
        let peer = reloaded.get(addr(1)).unwrap();
        assert_eq!(peer.last_direct_send, 42);
        assert_eq!(peer.last_direct_receive, 43);
        assert_eq!(peer.direct_path, Some(sn_path(7)));
        assert!(!dir.path().join("peer.tmp").exists());
    }

    #[test]
    fn supernode_installation_and_self_detection() {
        let dir = tempfile::tempdir().unwrap();
        let t = topology(&dir);
        t.set_supernodes(&[(addr(1), sn_path(1)), (addr(0xEE), sn_path(2))]);
        assert!(t.am_supernode());
        assert_eq!(t.direct_path(addr(1)), Some(sn_path(1)));
    }

    #[test]
    fn supernodes_needing_ping_excludes_self_and_fresh() {
        let dir = tempfile::tempdir().unwrap();
        let t = topology(&dir);
        t.set_supernodes(&[(addr(1), sn_path(1)), (addr(2), sn_path(2)), (addr(0xEE), sn_path(3))]);
        t.note_direct_send(addr(2), PEER_DIRECT_PING_DELAY);

        let due = t.supernodes_needing_ping(PEER_DIRECT_PING_DELAY);
        assert_eq!(due, vec![addr(1)]);
    }

    #[test]
    fn ping_and_opener_policies() {
        let dir = tempfile::tempdir().unwrap();
        let t = topology(&dir);
        t.set_supernodes(&[(addr(1), sn_path(1))]);
        t.note_direct_receive(addr(2), sn_path(2), 0);
        t.note_direct_send(addr(3), 0); // no path

        let now = PEER_DIRECT_PING_DELAY.max(FIREWALL_OPENER_DELAY);
        let mut ping = t.peers_needing_ping(now);
        ping.sort();
        assert_eq!(ping, vec![addr(1), addr(2)]);

        // Supernodes never get firewall openers.
        assert_eq!(t.peers_needing_firewall_opener(now), vec![addr(2)]);
    }

    #[test]
    fn announce_targets_dedup_supernodes_and_path_peers() {
        let dir = tempfile::tempdir().unwrap();
        let t = topology(&dir);
        t.set_supernodes(&[(addr(1), sn_path(1))]);
        t.note_direct_receive(addr(2), sn_path(2), 0);
        let targets = t.announce_targets();
        assert_eq!(targets, vec![addr(1), addr(2)]);
    }

    #[test]
    fn clean_evicts_idle_peers_but_keeps_supernodes() {
        let dir = tempfile::tempdir().unwrap();
        let t = topology(&dir);
        t.set_supernodes(&[(addr(1), sn_path(1))]);
        t.note_direct_send(addr(2), 0);
        t.note_direct_send(addr(3), PEER_EXPIRATION);

        let evicted = t.clean(PEER_EXPIRATION);
        assert_eq!(evicted, 1);
        assert!(t.get(addr(2)).is_none());
        assert!(t.get(addr(3)).is_some());
        assert!(t.get(addr(1)).is_some());
        // clean() also persisted the surviving set.
        assert_eq!(topology(&dir).peer_count(), 2);
    }

    #[tokio::test]
    async fn firewall_opener_updates_timestamp() {
        let dir = tempfile::tempdir().unwrap();
        let t = topology(&dir);

        let sink = tokio::net::UdpSocket::bind("127.0.0.1:0").await.unwrap();
        t.note_direct_receive(addr(2), sink.local_addr().unwrap(), 0);

        let (demarc, _rx) = Demarc::new();
        let base = {
            let s = tokio::net::UdpSocket::bind("127.0.0.1:0").await.unwrap();
            s.local_addr().unwrap().port()
        };
        demarc.bind_range(base, 8).await.unwrap();

        t.send_firewall_opener(addr(2), &demarc, &[0x00], 777)
            .await
            .unwrap();
        assert_eq!(t.get(addr(2)).unwrap().last_firewall_opener, 777);

        let mut buf = [0u8; 8];
        let (n, _) = tokio::time::timeout(
            std::time::Duration::from_secs(2),
            sink.recv_from(&mut buf),
        )
        .await
        .expect("timed out")
        .unwrap();
        assert_eq!(n, 1);

        demarc.stop().await;
    }
}
