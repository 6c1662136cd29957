//! The packet switch.
//!
//! Owns the outbound packet queue and packet scheduling. Callers enqueue
//! packets (directly or through the HELLO / multicast-announce helpers);
//! `do_timer_tasks` drains inbound datagrams from the demarcation point,
//! attempts delivery of queued packets over direct paths (falling back to
//! supernode transit), and reports how soon it wants to run again.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::Mutex as StdMutex;

use tokio::sync::{mpsc, Mutex};
use tracing::{debug, trace, warn};

use ethermesh_core::constants::MIN_SERVICE_LOOP_INTERVAL;
use ethermesh_core::{Address, Identity};

use crate::demarc::{Demarc, InboundDatagram};
use crate::error::OverlayError;
use crate::multicast::{Multicaster, MulticastGroup};
use crate::packet::Packet;
use crate::topology::Topology;

/// Queued packets older than this are dropped as undeliverable.
const QUEUE_TTL: u64 = 30_000;

/// Requested re-run delay while packets are still queued.
const QUEUE_RETRY_DELAY: u64 = 50;

/// Multicast-like entries per announcement packet.
const LIKES_PER_PACKET: usize = 64;

struct QueuedPacket {
    packet: Packet,
    enqueued_at: u64,
}

/// The packet switch.
pub struct Switch {
    demarc: Arc<Demarc>,
    multicaster: Arc<Multicaster>,
    identity: Arc<Identity>,
    queue: StdMutex<VecDeque<QueuedPacket>>,
    inbound: Mutex<mpsc::Receiver<InboundDatagram>>,
}

impl Switch {
    #[must_use]
    pub fn new(
        demarc: Arc<Demarc>,
        multicaster: Arc<Multicaster>,
        identity: Arc<Identity>,
        inbound: mpsc::Receiver<InboundDatagram>,
    ) -> Self {
        Self {
            demarc,
            multicaster,
            identity,
            queue: StdMutex::new(VecDeque::new()),
            inbound: Mutex::new(inbound),
        }
    }

    /// Enqueue a packet for delivery.
    pub fn send(&self, packet: Packet, now: u64) {
        let mut queue = self.queue.lock().unwrap_or_else(|e| e.into_inner());
        queue.push_back(QueuedPacket {
            packet,
            enqueued_at: now,
        });
    }

    /// Build and enqueue a HELLO keepalive to `destination`, recording the
    /// send attempt against the peer.
    pub fn send_hello(
        &self,
        topology: &Topology,
        destination: Address,
        now: u64,
    ) -> Result<(), OverlayError> {
        let packet = Packet::hello(destination, &self.identity, now)?;
        topology.note_direct_send(destination, now);
        self.send(packet, now);
        Ok(())
    }

    /// Announce multicast group memberships to every announce target.
    /// Returns the number of packets queued.
    pub fn announce_multicast_groups(
        &self,
        topology: &Topology,
        memberships: &[(u64, Vec<MulticastGroup>)],
        now: u64,
    ) -> usize {
        let mut entries: Vec<(u64, MulticastGroup)> = Vec::new();
        for (nwid, groups) in memberships {
            for group in groups {
                self.multicaster.add_like(*nwid, *group, now);
                entries.push((*nwid, *group));
            }
        }
        if entries.is_empty() {
            return 0;
        }

        let mut queued = 0;
        for target in topology.announce_targets() {
            for chunk in entries.chunks(LIKES_PER_PACKET) {
                self.send(
                    Packet::multicast_like(target, self.identity.address(), chunk),
                    now,
                );
                queued += 1;
            }
        }
        queued
    }

    /// Number of packets awaiting delivery.
    #[must_use]
    pub fn pending(&self) -> usize {
        self.queue.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    /// Take every queued packet. Used on shutdown and by tests to inspect
    /// what the switch was about to transmit.
    #[must_use]
    pub fn drain_pending(&self) -> Vec<Packet> {
        let mut queue = self.queue.lock().unwrap_or_else(|e| e.into_inner());
        queue.drain(..).map(|q| q.packet).collect()
    }

    /// Run one scheduling pass and return the delay in milliseconds until
    /// the switch next wants service.
    pub async fn do_timer_tasks(&self, topology: &Topology, now: u64) -> u64 {
        self.drain_inbound(topology, now).await;

        let pending: Vec<QueuedPacket> = {
            let mut queue = self.queue.lock().unwrap_or_else(|e| e.into_inner());
            queue.drain(..).collect()
        };

        let mut retained = VecDeque::new();
        for qp in pending {
            let path = topology
                .direct_path(qp.packet.destination)
                .or_else(|| topology.first_supernode_path());
            match path {
                Some(target) => {
                    if let Err(e) = self.demarc.send_to(target, &qp.packet.serialize()).await {
                        warn!("transmit to {} failed: {e}", qp.packet.destination);
                        if now.saturating_sub(qp.enqueued_at) < QUEUE_TTL {
                            retained.push_back(qp);
                        }
                    }
                }
                None => {
                    if now.saturating_sub(qp.enqueued_at) < QUEUE_TTL {
                        retained.push_back(qp);
                    } else {
                        trace!(
                            "dropping undeliverable packet for {}",
                            qp.packet.destination
                        );
                    }
                }
            }
        }

        let next_delay = if retained.is_empty() {
            MIN_SERVICE_LOOP_INTERVAL
        } else {
            QUEUE_RETRY_DELAY
        };

        let mut queue = self.queue.lock().unwrap_or_else(|e| e.into_inner());
        // Packets enqueued during the sends stay behind the retained ones.
        for qp in retained.into_iter().rev() {
            queue.push_front(qp);
        }
        next_delay
    }

    /// Pull inbound datagrams off the demarcation point and record peer
    /// activity.
    async fn drain_inbound(&self, topology: &Topology, now: u64) {
        let mut inbound = self.inbound.lock().await;
        while let Ok((src, data)) = inbound.try_recv() {
            match Packet::parse(&data) {
                Ok(packet) => topology.note_direct_receive(packet.source, src, now),
                Err(e) => debug!("unparseable datagram from {src}: {e}"),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::Verb;

    fn addr(seed: u8) -> Address {
        Address::new([seed; 5])
    }

    async fn free_port() -> u16 {
        let s = tokio::net::UdpSocket::bind("127.0.0.1:0").await.unwrap();
        s.local_addr().unwrap().port()
    }

    struct Fixture {
        switch: Switch,
        topology: Topology,
        demarc: Arc<Demarc>,
        identity: Arc<Identity>,
        _dir: tempfile::TempDir,
    }

    async fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let identity = Arc::new(Identity::generate());
        let topology =
            Topology::new(dir.path().join("peer.db"), identity.address()).unwrap();
        let (demarc, inbound) = Demarc::new();
        let demarc = Arc::new(demarc);
        let base = free_port().await;
        demarc.bind_range(base, 16).await.unwrap();
        let switch = Switch::new(
            Arc::clone(&demarc),
            Arc::new(Multicaster::new()),
            Arc::clone(&identity),
            inbound,
        );
        Fixture {
            switch,
            topology,
            demarc,
            identity,
            _dir: dir,
        }
    }

    #[tokio::test]
    async fn hello_is_queued_and_marks_send() {
        let f = fixture().await;
        f.switch.send_hello(&f.topology, addr(7), 1234).unwrap();
        assert_eq!(f.switch.pending(), 1);
        assert_eq!(f.topology.get(addr(7)).unwrap().last_direct_send, 1234);

        let queued = f.switch.drain_pending();
        assert_eq!(queued[0].verb, Verb::Hello);
        assert_eq!(queued[0].destination, addr(7));
        f.demarc.stop().await;
    }

    #[tokio::test]
    async fn queued_packet_is_delivered_over_direct_path() {
        let f = fixture().await;
        let sink = tokio::net::UdpSocket::bind("127.0.0.1:0").await.unwrap();
        f.topology
            .note_direct_receive(addr(7), sink.local_addr().unwrap(), 0);

        f.switch.send_hello(&f.topology, addr(7), 0).unwrap();
        let delay = f.switch.do_timer_tasks(&f.topology, 0).await;
        assert_eq!(delay, MIN_SERVICE_LOOP_INTERVAL);
        assert_eq!(f.switch.pending(), 0);

        let mut buf = [0u8; 4096];
        let (n, _) = tokio::time::timeout(
            std::time::Duration::from_secs(2),
            sink.recv_from(&mut buf),
        )
        .await
        .expect("timed out")
        .unwrap();
        let packet = Packet::parse(&buf[..n]).unwrap();
        assert_eq!(packet.verb, Verb::Hello);
        assert_eq!(packet.source, f.identity.address());
        f.demarc.stop().await;
    }

    #[tokio::test]
    async fn pathless_packet_is_retained_then_expired() {
        let f = fixture().await;
        f.switch.send_hello(&f.topology, addr(9), 0).unwrap();

        // addr(9) has no path (note_direct_send created a pathless entry)
        // and there are no supernodes, so the packet is retained.
        let delay = f.switch.do_timer_tasks(&f.topology, 0).await;
        assert_eq!(delay, QUEUE_RETRY_DELAY);
        assert_eq!(f.switch.pending(), 1);

        // Past the TTL it is dropped.
        let delay = f.switch.do_timer_tasks(&f.topology, QUEUE_TTL).await;
        assert_eq!(delay, MIN_SERVICE_LOOP_INTERVAL);
        assert_eq!(f.switch.pending(), 0);
        f.demarc.stop().await;
    }

    #[tokio::test]
    async fn fallback_transit_uses_supernode_path() {
        let f = fixture().await;
        let sn_sink = tokio::net::UdpSocket::bind("127.0.0.1:0").await.unwrap();
        f.topology
            .set_supernodes(&[(addr(1), sn_sink.local_addr().unwrap())]);

        // addr(9) is unknown; the packet should transit the supernode.
        f.switch.send_hello(&f.topology, addr(9), 0).unwrap();
        f.switch.do_timer_tasks(&f.topology, 0).await;

        let mut buf = [0u8; 4096];
        let (n, _) = tokio::time::timeout(
            std::time::Duration::from_secs(2),
            sn_sink.recv_from(&mut buf),
        )
        .await
        .expect("timed out")
        .unwrap();
        let packet = Packet::parse(&buf[..n]).unwrap();
        assert_eq!(packet.destination, addr(9));
        f.demarc.stop().await;
    }

    #[tokio::test]
    async fn announce_targets_each_get_like_packets() {
        let f = fixture().await;
        f.topology.set_supernodes(&[(addr(1), "10.0.0.1:9993".parse().unwrap())]);
        f.topology
            .note_direct_receive(addr(2), "10.0.0.2:9993".parse().unwrap(), 0);

        let groups = vec![MulticastGroup::BROADCAST];
        let queued = f
            .switch
            .announce_multicast_groups(&f.topology, &[(0x10, groups)], 0);
        assert_eq!(queued, 2);
        assert_eq!(f.switch.pending(), 2);

        let packets = f.switch.drain_pending();
        assert!(packets.iter().all(|p| p.verb == Verb::MulticastLike));
        f.demarc.stop().await;
    }

    #[tokio::test]
    async fn announce_with_no_groups_queues_nothing() {
        let f = fixture().await;
        f.topology.set_supernodes(&[(addr(1), "10.0.0.1:9993".parse().unwrap())]);
        assert_eq!(
            f.switch
                .announce_multicast_groups(&f.topology, &[(0x10, Vec::new())], 0),
            0
        );
        f.demarc.stop().await;
    }

    #[tokio::test]
    async fn inbound_datagram_records_peer_activity() {
        let f = fixture().await;
        let other = Identity::generate();
        let external = tokio::net::UdpSocket::bind("127.0.0.1:0").await.unwrap();

        let hello = Packet::hello(f.identity.address(), &other, 5).unwrap();
        external
            .send_to(
                &hello.serialize(),
                ("127.0.0.1", f.demarc.local_port().unwrap()),
            )
            .await
            .unwrap();

        // Give the read loop a moment to enqueue the datagram.
        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
        f.switch.do_timer_tasks(&f.topology, 42).await;

        let peer = f.topology.get(other.address()).expect("peer learned");
        assert_eq!(peer.last_direct_receive, 42);
        assert_eq!(
            peer.direct_path.unwrap().port(),
            external.local_addr().unwrap().port()
        );
        f.demarc.stop().await;
    }
}
