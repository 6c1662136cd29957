//! Error types for the overlay subsystems.

/// Errors that can occur in the network-facing subsystems.
#[derive(Debug, thiserror::Error)]
pub enum OverlayError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("no UDP port in the configured range could be bound")]
    NoBindablePort,
    #[error("demarcation point is not bound")]
    NotBound,
    #[error("packet truncated: {0} bytes")]
    PacketTruncated(usize),
    #[error("unknown packet verb: {0:#04x}")]
    UnknownVerb(u8),
    #[error("identity has no private key")]
    NoPrivateKey,
    #[error("peer database corrupt: {0}")]
    PeerDatabase(String),
    #[error("failed to spawn service {0}: {1}")]
    ServiceSpawn(String, std::io::Error),
    #[error("service {0} is not running")]
    ServiceStopped(String),
}
