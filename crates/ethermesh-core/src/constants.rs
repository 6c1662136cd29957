//! Protocol timing, port, and size constants.
//!
//! All intervals are in milliseconds. These values shape the service loop's
//! cadence; tightening them increases chatter on the overlay, loosening them
//! slows NAT keepalive and peer liveness detection.

/// First overlay UDP port tried at startup.
pub const DEFAULT_UDP_PORT: u16 = 9993;

/// Number of consecutive ports probed after [`DEFAULT_UDP_PORT`].
pub const UDP_PORT_SEARCH_RANGE: u16 = 128;

/// Loopback UDP port for the local control channel.
pub const CONTROL_UDP_PORT: u16 = 39393;

/// Maximum size of one control-channel datagram.
pub const NODECONFIG_MAX_PACKET_SIZE: usize = 4096;

/// Length of the generated `authtoken.secret` value.
pub const AUTH_TOKEN_LENGTH: usize = 24;

/// How often the ping/firewall-opener scheduling step runs.
pub const PING_CHECK_DELAY: u64 = 10_000;

/// A peer with a direct path is HELLOed when its last direct send is older
/// than this.
pub const PEER_DIRECT_PING_DELAY: u64 = 120_000;

/// Interval between firewall-opener datagrams to a given peer.
pub const FIREWALL_OPENER_DELAY: u64 = 50_000;

/// How often the host network environment fingerprint is re-sampled.
pub const NETWORK_FINGERPRINT_CHECK_DELAY: u64 = 60_000;

/// How often tap multicast subscriptions are polled for changes.
pub const MULTICAST_LOCAL_POLL_PERIOD: u64 = 10_000;

/// Interval between full re-announcements of every network's groups.
pub const MULTICAST_LIKE_ANNOUNCE_ALL_PERIOD: u64 = 120_000;

/// Remembered multicast subscriptions expire after this long without the
/// tap reporting them.
pub const MULTICAST_LIKE_EXPIRE: u64 = 600_000;

/// How often expired peers and per-network transient state are evicted.
pub const DB_CLEAN_PERIOD: u64 = 300_000;

/// Upper bound on one service-loop wait. The switch may ask for less.
pub const MIN_SERVICE_LOOP_INTERVAL: u64 = 500;

/// A wait that overshoots its deadline by at least this much is treated as
/// a host suspend/resume.
pub const SLEEP_WAKE_DETECTION_THRESHOLD: u64 = 2_000;

/// Pause after a detected suspend/resume before resuming normal service.
pub const SLEEP_WAKE_SETTLE_TIME: u64 = 5_000;

/// Non-supernode peers with no link activity for this long are evicted.
pub const PEER_EXPIRATION: u64 = 7 * 24 * 60 * 60 * 1000;

/// Exclusive upper bound on a network configuration blob from the helper
/// service. A blob of exactly this size is rejected.
pub const NETCONF_MAX_BLOB: usize = 2048;

/// Maximum size of `node.log` before it is rotated to `node.log.old`.
pub const LOG_ROTATION_BUDGET: u64 = 131_072;
