//! Multicast groups and the multicaster's membership store.

use std::collections::HashMap;
use std::fmt;
use std::sync::Mutex;

use ethermesh_core::constants::MULTICAST_LIKE_EXPIRE;

/// A multicast group: an Ethernet MAC plus an additional distinguishing
/// information word (used e.g. to scope IPv4 ARP-like traffic).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct MulticastGroup {
    mac: [u8; 6],
    adi: u32,
}

impl MulticastGroup {
    /// The all-ones broadcast group every network is implicitly subscribed to.
    pub const BROADCAST: Self = Self {
        mac: [0xff; 6],
        adi: 0,
    };

    #[must_use]
    pub const fn new(mac: [u8; 6], adi: u32) -> Self {
        Self { mac, adi }
    }

    #[must_use]
    pub const fn mac(&self) -> &[u8; 6] {
        &self.mac
    }

    #[must_use]
    pub const fn adi(&self) -> u32 {
        self.adi
    }
}

impl fmt::Display for MulticastGroup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}/{:08x}",
            self.mac[0], self.mac[1], self.mac[2], self.mac[3], self.mac[4], self.mac[5], self.adi
        )
    }
}

/// Tracks which multicast groups this node has announced, per network,
/// with the time of the last announcement.
#[derive(Debug, Default)]
pub struct Multicaster {
    likes: Mutex<HashMap<(u64, MulticastGroup), u64>>,
}

impl Multicaster {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record that `group` was announced on `nwid` at `now`.
    pub fn add_like(&self, nwid: u64, group: MulticastGroup, now: u64) {
        let mut likes = self.likes.lock().unwrap_or_else(|e| e.into_inner());
        likes.insert((nwid, group), now);
    }

    /// Number of live announced memberships.
    #[must_use]
    pub fn like_count(&self) -> usize {
        self.likes.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    /// Evict announcements older than the membership expiry. Returns how
    /// many were dropped.
    pub fn clean(&self, now: u64) -> usize {
        let mut likes = self.likes.lock().unwrap_or_else(|e| e.into_inner());
        let before = likes.len();
        likes.retain(|_, announced| now.saturating_sub(*announced) < MULTICAST_LIKE_EXPIRE);
        before - likes.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_format() {
        let g = MulticastGroup::new([0x01, 0x00, 0x5e, 0x00, 0x00, 0xfb], 7);
        assert_eq!(g.to_string(), "01:00:5e:00:00:fb/00000007");
    }

    #[test]
    fn likes_accumulate_and_refresh() {
        let m = Multicaster::new();
        let g = MulticastGroup::BROADCAST;
        m.add_like(1, g, 1000);
        m.add_like(1, g, 2000);
        m.add_like(2, g, 1000);
        assert_eq!(m.like_count(), 2);
    }

    #[test]
    fn clean_evicts_only_expired() {
        let m = Multicaster::new();
        let g = MulticastGroup::BROADCAST;
        m.add_like(1, g, 0);
        m.add_like(2, g, MULTICAST_LIKE_EXPIRE);
        let evicted = m.clean(MULTICAST_LIKE_EXPIRE + 1);
        assert_eq!(evicted, 1);
        assert_eq!(m.like_count(), 1);
    }
}
