//! The supervisor: node lifecycle and the timer-driven service loop.
//!
//! [`Node::run`] performs the startup sequence (log sink, PRNG, identity,
//! auth token, node-config facade with its control channel, demarcation
//! point, multicaster, switch, topology, environment watcher, overlay
//! port bind, supernode install, optional netconf helper), then drives
//! the service loop until terminated. Startup failures collapse to
//! [`TerminationReason::UnrecoverableError`] with a specific message;
//! failures inside a loop cycle are logged at warning level and the loop
//! continues.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use rand::rngs::SmallRng;
use rand::SeedableRng;
use tokio::sync::Notify;
use tracing::{debug, info, warn};

use ethermesh_core::constants::{
    CONTROL_UDP_PORT, DEFAULT_UDP_PORT, LOG_ROTATION_BUDGET, SLEEP_WAKE_SETTLE_TIME,
    UDP_PORT_SEARCH_RANGE,
};
use ethermesh_core::version::version_string;
use ethermesh_core::{now_ms, Address};
use ethermesh_overlay::{Demarc, Multicaster, OverlayError, Service, Switch, SysEnv, Topology};

use crate::node_config::NodeConfig;
use crate::runtime::RuntimeEnvironment;
use crate::service_cycle::{self, CycleTimers, PingPlan};
use crate::{auth_token, defaults, identity_store, logging, netconf_bridge};

/// Why (or whether) the node has stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminationReason {
    /// Internal sentinel: the node has not terminated.
    Running,
    /// Clean shutdown via [`Node::terminate`].
    Normal,
    /// Startup failure or an unrecoverable fault.
    UnrecoverableError,
}

/// Tunable node parameters. [`Node::new`] uses the defaults; tests
/// override the ports so instances can run concurrently.
#[derive(Debug, Clone)]
pub struct NodeOptions {
    pub home: PathBuf,
    pub control_port: u16,
    pub overlay_port: u16,
    pub port_search_range: u16,
    pub log_to_stdout: bool,
}

impl NodeOptions {
    #[must_use]
    pub fn for_home(home: impl Into<PathBuf>) -> Self {
        Self {
            home: home.into(),
            control_port: CONTROL_UDP_PORT,
            overlay_port: DEFAULT_UDP_PORT,
            port_search_range: UDP_PORT_SEARCH_RANGE,
            log_to_stdout: false,
        }
    }
}

struct NodeInner {
    options: NodeOptions,
    started: AtomicBool,
    running: AtomicBool,
    terminate_now: AtomicBool,
    loop_waker: Arc<Notify>,
    reason: Mutex<Option<(TerminationReason, String)>>,
}

/// A node instance. Exactly one [`run`](Self::run) call is permitted.
#[derive(Clone)]
pub struct Node {
    inner: Arc<NodeInner>,
}

impl Node {
    /// Create a node with default options rooted at `home`.
    #[must_use]
    pub fn new(home: impl Into<PathBuf>) -> Self {
        Self::with_options(NodeOptions::for_home(home))
    }

    #[must_use]
    pub fn with_options(options: NodeOptions) -> Self {
        Self {
            inner: Arc::new(NodeInner {
                options,
                started: AtomicBool::new(false),
                running: AtomicBool::new(false),
                terminate_now: AtomicBool::new(false),
                loop_waker: Arc::new(Notify::new()),
                reason: Mutex::new(None),
            }),
        }
    }

    /// Execute the node, blocking this task until it stops.
    ///
    /// Shutdown is triggered by [`terminate`](Self::terminate) or by an
    /// unrecoverable startup fault.
    pub async fn run(&self) -> TerminationReason {
        if self.inner.started.swap(true, Ordering::SeqCst) {
            // A second run() never repeats the startup sequence and must
            // not disturb a live loop's state.
            return TerminationReason::UnrecoverableError;
        }
        self.inner.running.store(true, Ordering::SeqCst);

        let renv = match self.startup().await {
            Ok(renv) => renv,
            Err(message) => {
                return self.terminate_because(TerminationReason::UnrecoverableError, &message)
            }
        };

        self.service_loop(&renv).await;
        self.teardown(renv).await;
        self.terminate_because(TerminationReason::Normal, "normal termination")
    }

    /// Ask the node to stop. Asynchronous and idempotent; callable from
    /// any task or thread.
    pub fn terminate(&self) {
        self.inner.terminate_now.store(true, Ordering::SeqCst);
        self.inner.loop_waker.notify_one();
    }

    /// The stored termination message, or `None` while the node has not
    /// finished running.
    #[must_use]
    pub fn reason_for_termination(&self) -> Option<String> {
        if !self.inner.started.load(Ordering::SeqCst) || self.inner.running.load(Ordering::SeqCst)
        {
            return None;
        }
        let reason = self.inner.reason.lock().unwrap_or_else(|e| e.into_inner());
        reason.as_ref().map(|(_, message)| message.clone())
    }

    fn terminate_because(&self, reason: TerminationReason, message: &str) -> TerminationReason {
        info!("terminating: {message}");
        *self.inner.reason.lock().unwrap_or_else(|e| e.into_inner()) =
            Some((reason, message.to_string()));
        self.inner.running.store(false, Ordering::SeqCst);
        reason
    }

    // -- Startup --

    async fn startup(&self) -> Result<RuntimeEnvironment, String> {
        let options = &self.inner.options;
        let home = options.home.clone();

        std::fs::create_dir_all(&home)
            .map_err(|e| format!("could not create home directory {}: {e}", home.display()))?;

        if options.log_to_stdout {
            logging::init();
        } else {
            logging::init_file(&home.join("node.log"), LOG_ROTATION_BUDGET)
                .map_err(|e| format!("could not open node.log: {e}"))?;
        }

        // Non-cryptographic PRNG first; later startup steps may want it.
        let prng = SmallRng::from_entropy();

        let (identity, _generated) = identity_store::load_or_generate(&home)
            .await
            .map_err(|e| e.to_string())?;
        let identity = Arc::new(identity);

        // Obsolete files from earlier releases.
        for legacy in ["status", "thisdeviceismine"] {
            let _ = tokio::fs::remove_file(home.join(legacy)).await;
        }

        let auth_token = auth_token::load_or_generate(&home)
            .await
            .map_err(|e| e.to_string())?;

        let nc = NodeConfig::new(
            identity.address(),
            &auth_token,
            options.control_port,
            Arc::clone(&self.inner.loop_waker),
        )
        .await
        .map_err(|_| {
            "another instance of ethermesh appears to be running, or the local control UDP port cannot be bound"
                .to_string()
        })?;

        let (demarc, inbound) = Demarc::new();
        let demarc = Arc::new(demarc);
        let multicaster = Arc::new(Multicaster::new());
        let switch = Arc::new(Switch::new(
            Arc::clone(&demarc),
            Arc::clone(&multicaster),
            Arc::clone(&identity),
            inbound,
        ));
        let topology = Arc::new(
            Topology::new(home.join("peer.db"), identity.address())
                .map_err(|e| format!("could not open peer database: {e}"))?,
        );
        nc.attach_topology(Arc::clone(&topology));
        let sysenv = Arc::new(SysEnv::new());

        demarc
            .bind_range(options.overlay_port, options.port_search_range)
            .await
            .map_err(|_| "could not bind any local UDP ports".to_string())?;

        topology.set_supernodes(&defaults::supernodes());

        let netconf_service =
            start_netconf_service(&home, &nc, &switch, identity.address());

        Ok(RuntimeEnvironment {
            netconf_service,
            sysenv,
            topology,
            switch,
            multicaster,
            demarc,
            nc,
            identity,
            prng: Mutex::new(prng),
            home,
        })
    }

    // -- Service loop --

    async fn service_loop(&self, r: &RuntimeEnvironment) {
        let mut timers = CycleTimers::new(now_ms());
        let mut fingerprint = r.sysenv.network_configuration_fingerprint();
        let mut last_delay_delta: i64 = 0;

        info!("{} starting version {}", r.identity.address(), version_string());

        while !self.inner.terminate_now.load(Ordering::SeqCst) {
            let now = now_ms();
            let mut ping_all = false;

            // Suspend/resume shows up as a wait that overshot its deadline.
            if service_cycle::sleep_wake_detected(last_delay_delta) {
                timers.force_environment_resync();
                ping_all = true;
                info!("probable suspend/resume detected, pausing a moment for things to settle...");
                tokio::time::sleep(Duration::from_millis(SLEEP_WAKE_SETTLE_TIME)).await;
            }

            if timers.due_fingerprint_check(now) {
                timers.last_network_fingerprint_check = now;
                let current = r.sysenv.network_configuration_fingerprint();
                if current != fingerprint {
                    info!(
                        "netconf fingerprint change: {fingerprint:016x} != {current:016x}, resyncing with network"
                    );
                    fingerprint = current;
                    ping_all = true;
                    timers.note_fingerprint_change();
                    r.nc.whack_all_taps();
                }
            }

            if timers.due_multicast_check(now) {
                timers.last_multicast_check = now;
                let announce_all = timers.due_announce_all(now);
                match multicast_step(r, announce_all, now) {
                    Ok(announced_any) => {
                        if service_cycle::should_record_announce_all(announce_all, announced_any)
                        {
                            timers.last_multicast_announce_all = now;
                        }
                    }
                    Err(e) => warn!("unexpected error announcing multicast groups: {e}"),
                }
            }

            if timers.due_ping_check(now) {
                timers.last_ping_check = now;
                if let Err(e) = ping_step(r, ping_all, now).await {
                    warn!("unexpected error running ping check cycle: {e}");
                }
            }

            if timers.due_clean(now) {
                timers.last_clean = now;
                clean_step(r, now);
            }

            let switch_delay = r.switch.do_timer_tasks(&r.topology, now).await;
            let wait = service_cycle::compute_wait(switch_delay);
            let wait_started = tokio::time::Instant::now();
            let _ = tokio::time::timeout(
                Duration::from_millis(wait),
                self.inner.loop_waker.notified(),
            )
            .await;
            last_delay_delta =
                service_cycle::delay_delta(wait, wait_started.elapsed().as_millis() as u64);
        }
    }

    // -- Teardown --

    async fn teardown(&self, r: RuntimeEnvironment) {
        if let Some(service) = &r.netconf_service {
            service.stop().await;
        }
        r.nc.shutdown().await;
        r.demarc.stop().await;
        if let Err(e) = r.topology.save() {
            warn!("could not persist peer database: {e}");
        }
        // The rest is dropped in reverse construction order.
    }
}

#[cfg(unix)]
fn start_netconf_service(
    home: &Path,
    nc: &Arc<NodeConfig>,
    switch: &Arc<Switch>,
    our_address: Address,
) -> Option<Service> {
    let path = home.join("services.d").join("netconf.service");
    if !path.exists() {
        return None;
    }
    info!("services.d/netconf.service appears to exist, starting...");
    let nc = Arc::clone(nc);
    let switch = Arc::clone(switch);
    match Service::start(
        "netconf",
        &path,
        Arc::new(move |message| {
            netconf_bridge::handle_netconf_message(&nc, &switch, our_address, &message, now_ms());
        }),
    ) {
        Ok(service) => Some(service),
        Err(e) => {
            warn!("failed to start netconf service: {e}");
            None
        }
    }
}

#[cfg(not(unix))]
fn start_netconf_service(
    _home: &Path,
    _nc: &Arc<NodeConfig>,
    _switch: &Arc<Switch>,
    _our_address: Address,
) -> Option<Service> {
    None
}

/// Poll every network's tap for membership changes and announce changed
/// (or, on the announce-all period, all) networks. Returns whether any
/// network announced.
fn multicast_step(
    r: &RuntimeEnvironment,
    announce_all: bool,
    now: u64,
) -> Result<bool, OverlayError> {
    let mut to_announce = Vec::new();
    for network in r.nc.networks() {
        let changed = network.update_multicast_groups(now);
        if changed || announce_all {
            to_announce.push((network.id(), network.multicast_groups()));
        }
    }
    if to_announce.is_empty() {
        return Ok(false);
    }
    r.switch
        .announce_multicast_groups(&r.topology, &to_announce, now);
    Ok(true)
}

/// Run one ping/firewall-opener scheduling pass. A failure against one
/// peer never aborts the cycle.
async fn ping_step(r: &RuntimeEnvironment, ping_all: bool, now: u64) -> Result<(), OverlayError> {
    match service_cycle::choose_ping_plan(r.topology.am_supernode(), ping_all) {
        PingPlan::Supernode => {
            for address in r.topology.supernodes_needing_ping(now) {
                if let Err(e) = r.switch.send_hello(&r.topology, address, now) {
                    warn!("unexpected error sending HELLO to {address}: {e}");
                }
            }
        }
        PingPlan::All => {
            for address in r.topology.peers_with_direct_path() {
                if let Err(e) = r.switch.send_hello(&r.topology, address, now) {
                    warn!("unexpected error sending HELLO to {address}: {e}");
                }
            }
        }
        PingPlan::Selective => {
            for address in r.topology.peers_needing_ping(now) {
                if let Err(e) = r.switch.send_hello(&r.topology, address, now) {
                    warn!("unexpected error sending HELLO to {address}: {e}");
                }
            }
            for address in r.topology.peers_needing_firewall_opener(now) {
                let payload = r.firewall_opener_payload();
                if let Err(e) = r
                    .topology
                    .send_firewall_opener(address, &r.demarc, &payload, now)
                    .await
                {
                    warn!("unexpected error sending firewall opener to {address}: {e}");
                }
            }
        }
    }
    Ok(())
}

/// Housekeeping: evict expired peers, clean each network's transient
/// state, and expire stale multicast announcements.
fn clean_step(r: &RuntimeEnvironment, now: u64) {
    let evicted = r.topology.clean(now);
    if evicted > 0 {
        debug!("evicted {evicted} expired peers");
    }
    r.nc.clean_all_networks(now);
    r.multicaster.clean(now);
}
