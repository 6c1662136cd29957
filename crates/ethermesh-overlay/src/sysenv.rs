//! Host network environment watcher.
//!
//! Produces an opaque 64-bit fingerprint of the host's interfaces,
//! addresses, and routing state. The value itself means nothing; a change
//! between two samples means the environment changed and the node should
//! resync with the overlay.

use sha2::{Digest, Sha256};

/// Watches the host OS network configuration.
#[derive(Debug, Default)]
pub struct SysEnv;

impl SysEnv {
    #[must_use]
    pub fn new() -> Self {
        Self
    }

    /// Sample the current network configuration fingerprint.
    ///
    /// On Linux this hashes the routing table, IPv6 address list, and the
    /// set of interface names. On other hosts (and when nothing is
    /// readable) it returns a constant, so "no information" never looks
    /// like a change.
    #[must_use]
    pub fn network_configuration_fingerprint(&self) -> u64 {
        #[cfg(target_os = "linux")]
        {
            let mut hasher = Sha256::new();
            let mut sampled = false;

            for path in ["/proc/net/route", "/proc/net/if_inet6"] {
                if let Ok(contents) = std::fs::read(path) {
                    hasher.update(&contents);
                    sampled = true;
                }
            }

            // /proc/net/dev carries traffic counters that change constantly;
            // only the interface names are part of the environment.
            if let Ok(dev) = std::fs::read_to_string("/proc/net/dev") {
                for line in dev.lines().skip(2) {
                    if let Some((name, _)) = line.split_once(':') {
                        hasher.update(name.trim().as_bytes());
                        hasher.update(b"\n");
                    }
                }
                sampled = true;
            }

            if !sampled {
                return 1;
            }
            let digest = hasher.finalize();
            u64::from_be_bytes(digest[..8].try_into().unwrap_or([0u8; 8])).max(1)
        }
        #[cfg(not(target_os = "linux"))]
        {
            1
        }
    }
}
