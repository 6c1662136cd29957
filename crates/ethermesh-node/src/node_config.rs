//! The node configuration facade and its local control server.
//!
//! [`NodeConfig`] owns the set of joined virtual networks and executes
//! control commands against them. Construction binds the authenticated
//! control channel: a loopback UDP socket whose datagrams are decoded with
//! the key derived from `authtoken.secret`. A bind failure here almost
//! always means another node instance is already running against the same
//! control port.
//!
//! Commands run synchronously under the facade's internal locks; every
//! result line is sent back tagged with the request's conversation id,
//! fragmented into datagrams no larger than the control packet bound.

use std::collections::BTreeMap;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::{Arc, Mutex, OnceLock, Weak};

use tokio::net::UdpSocket;
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, trace};

use ethermesh_core::constants::NODECONFIG_MAX_PACKET_SIZE;
use ethermesh_core::control::{decode_control_packet, derive_control_key, encode_control_message};
use ethermesh_core::version::version_string;
use ethermesh_core::{now_ms, Address};
use ethermesh_overlay::Topology;

use crate::error::NodeError;
use crate::network::Network;

/// The node configuration facade plus its loopback control server.
pub struct NodeConfig {
    address: Address,
    key: [u8; 32],
    networks: Mutex<BTreeMap<u64, Arc<Network>>>,
    /// Attached after construction; the topology is built later in the
    /// startup sequence.
    topology: OnceLock<Arc<Topology>>,
    socket: Arc<UdpSocket>,
    loop_waker: Arc<Notify>,
    stop_tx: watch::Sender<bool>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl NodeConfig {
    /// Create the facade and bind the control channel on loopback at
    /// `control_port` (0 for an OS-assigned port).
    pub async fn new(
        address: Address,
        auth_token: &str,
        control_port: u16,
        loop_waker: Arc<Notify>,
    ) -> Result<Arc<Self>, NodeError> {
        let socket = UdpSocket::bind((Ipv4Addr::LOCALHOST, control_port))
            .await
            .map_err(NodeError::ControlBind)?;

        let (stop_tx, stop_rx) = watch::channel(false);
        let nc = Arc::new(Self {
            address,
            key: derive_control_key(auth_token),
            networks: Mutex::new(BTreeMap::new()),
            topology: OnceLock::new(),
            socket: Arc::new(socket),
            loop_waker,
            stop_tx,
            task: Mutex::new(None),
        });

        let task = tokio::spawn(Self::serve(Arc::downgrade(&nc), stop_rx));
        *nc.task.lock().unwrap_or_else(|e| e.into_inner()) = Some(task);
        Ok(nc)
    }

    /// Attach the topology once it exists. May be called once.
    pub fn attach_topology(&self, topology: Arc<Topology>) {
        let _ = self.topology.set(topology);
    }

    /// The bound control port.
    #[must_use]
    pub fn control_port(&self) -> u16 {
        self.socket.local_addr().map(|a| a.port()).unwrap_or(0)
    }

    // -- Virtual networks --

    /// Join a network, creating its tap state if not already joined.
    pub fn join(&self, nwid: u64) -> Arc<Network> {
        let mut networks = self.networks.lock().unwrap_or_else(|e| e.into_inner());
        Arc::clone(
            networks
                .entry(nwid)
                .or_insert_with(|| Arc::new(Network::new(nwid))),
        )
    }

    /// Leave a network. Returns whether it was joined.
    pub fn leave(&self, nwid: u64) -> bool {
        let mut networks = self.networks.lock().unwrap_or_else(|e| e.into_inner());
        networks.remove(&nwid).is_some()
    }

    #[must_use]
    pub fn network(&self, nwid: u64) -> Option<Arc<Network>> {
        let networks = self.networks.lock().unwrap_or_else(|e| e.into_inner());
        networks.get(&nwid).cloned()
    }

    #[must_use]
    pub fn networks(&self) -> Vec<Arc<Network>> {
        let networks = self.networks.lock().unwrap_or_else(|e| e.into_inner());
        networks.values().cloned().collect()
    }

    /// Re-kick every network's tap after an environment change.
    pub fn whack_all_taps(&self) {
        for network in self.networks() {
            network.tap().whack();
        }
    }

    /// Evict each network's expired transient state.
    pub fn clean_all_networks(&self, now: u64) {
        for network in self.networks() {
            network.clean(now);
        }
    }

    // -- Control command execution --

    /// Execute one control command, returning its result lines.
    pub fn execute(&self, command: &str) -> Vec<String> {
        let mut parts = command.split_whitespace();
        let verb = parts.next().unwrap_or("");
        match verb {
            "info" => vec![format!(
                "200 info {} {} online",
                self.address,
                version_string()
            )],
            "listpeers" => self.cmd_listpeers(),
            "listnetworks" => self.cmd_listnetworks(),
            "join" => self.cmd_join(parts.next()),
            "leave" => self.cmd_leave(parts.next()),
            "" => vec!["400 empty command".to_string()],
            other => vec![format!("404 {other} not found")],
        }
    }

    fn cmd_listpeers(&self) -> Vec<String> {
        let Some(topology) = self.topology.get() else {
            return vec!["503 listpeers not ready".to_string()];
        };
        let now = now_ms();
        let mut addresses = topology.peers_with_direct_path();
        addresses.sort();
        addresses
            .iter()
            .filter_map(|a| topology.get(*a))
            .map(|peer| {
                let path = peer
                    .direct_path
                    .map(|p| p.to_string())
                    .unwrap_or_else(|| "-".to_string());
                format!(
                    "200 listpeers {} {} {} {}",
                    peer.address,
                    path,
                    age_or_dash(now, peer.last_direct_send),
                    age_or_dash(now, peer.last_direct_receive),
                )
            })
            .collect()
    }

    fn cmd_listnetworks(&self) -> Vec<String> {
        self.networks()
            .iter()
            .map(|nw| {
                format!(
                    "200 listnetworks {:016x} {}",
                    nw.id(),
                    nw.multicast_groups().len()
                )
            })
            .collect()
    }

    fn cmd_join(&self, nwid: Option<&str>) -> Vec<String> {
        match nwid.and_then(|s| u64::from_str_radix(s, 16).ok()) {
            Some(nwid) => {
                self.join(nwid);
                vec![format!("200 join {nwid:016x} OK")]
            }
            None => vec!["400 join requires a hex network id".to_string()],
        }
    }

    fn cmd_leave(&self, nwid: Option<&str>) -> Vec<String> {
        match nwid.and_then(|s| u64::from_str_radix(s, 16).ok()) {
            Some(nwid) if self.leave(nwid) => vec![format!("200 leave {nwid:016x} OK")],
            Some(nwid) => vec![format!("404 leave {nwid:016x} not found")],
            None => vec!["400 leave requires a hex network id".to_string()],
        }
    }

    // -- Control server --

    async fn serve(nc: Weak<NodeConfig>, mut stop_rx: watch::Receiver<bool>) {
        let socket = match nc.upgrade() {
            Some(nc) => Arc::clone(&nc.socket),
            None => return,
        };
        let mut buf = vec![0u8; NODECONFIG_MAX_PACKET_SIZE];
        loop {
            let (len, src) = tokio::select! {
                result = socket.recv_from(&mut buf) => match result {
                    Ok(pair) => pair,
                    Err(e) => {
                        debug!("control socket recv error: {e}");
                        continue;
                    }
                },
                _ = stop_rx.changed() => break,
            };

            let Some(nc) = nc.upgrade() else { break };
            nc.handle_datagram(&buf[..len], src).await;
        }
    }

    async fn handle_datagram(&self, data: &[u8], src: SocketAddr) {
        // Authentication or decode failures are dropped silently.
        let Ok((conversation_id, commands)) = decode_control_packet(&self.key, data) else {
            trace!("dropping unauthenticated control datagram from {src}");
            return;
        };

        for command in &commands {
            let results = self.execute(command);
            match encode_control_message(&self.key, conversation_id, &results) {
                Ok(packets) => {
                    for packet in packets {
                        if let Err(e) = self.socket.send_to(&packet, src).await {
                            debug!("control reply to {src} failed: {e}");
                        }
                    }
                }
                Err(e) => trace!("could not encode control reply: {e}"),
            }
        }

        // A control command is one of the service loop's wake sources.
        self.loop_waker.notify_one();
    }

    /// Stop the control server and release the socket.
    pub async fn shutdown(&self) {
        let _ = self.stop_tx.send(true);
        let task = self.task.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(task) = task {
            let _ = task.await;
        }
    }
}

fn age_or_dash(now: u64, then: u64) -> String {
    if then == 0 {
        "-".to_string()
    } else {
        format!("{}", now.saturating_sub(then))
    }
}
