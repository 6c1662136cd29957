//! Joined virtual networks and their tap-side multicast state.
//!
//! Each joined network presents a virtual Ethernet tap to the host. The
//! tap adapter itself is a thin stand-in here: it tracks the multicast
//! groups the host side has subscribed and a "whack" flag the supervisor
//! raises when the network environment changes, telling the tap to re-kick
//! its host-facing state.

use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use ethermesh_core::constants::MULTICAST_LIKE_EXPIRE;
use ethermesh_overlay::MulticastGroup;

/// The host-facing virtual Ethernet device for one network.
#[derive(Debug, Default)]
pub struct VirtualTap {
    groups: Mutex<BTreeSet<MulticastGroup>>,
    needs_whack: AtomicBool,
}

impl VirtualTap {
    /// Replace the host side's current multicast subscriptions.
    pub fn set_multicast_groups(&self, groups: impl IntoIterator<Item = MulticastGroup>) {
        let mut current = self.groups.lock().unwrap_or_else(|e| e.into_inner());
        *current = groups.into_iter().collect();
    }

    /// The host side's current subscriptions, always including broadcast.
    #[must_use]
    pub fn multicast_groups(&self) -> BTreeSet<MulticastGroup> {
        let mut groups = self
            .groups
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone();
        groups.insert(MulticastGroup::BROADCAST);
        groups
    }

    /// Ask the tap to re-kick its host-facing state.
    pub fn whack(&self) {
        self.needs_whack.store(true, Ordering::SeqCst);
    }

    /// Consume the whack flag.
    pub fn take_whack(&self) -> bool {
        self.needs_whack.swap(false, Ordering::SeqCst)
    }
}

/// One joined virtual network.
#[derive(Debug)]
pub struct Network {
    id: u64,
    tap: VirtualTap,
    /// Groups we currently consider ourselves a member of, with the time
    /// the tap last reported each. Memberships linger briefly after the
    /// tap drops them, until cleaned.
    memberships: Mutex<HashMap<MulticastGroup, u64>>,
}

impl Network {
    #[must_use]
    pub fn new(id: u64) -> Self {
        Self {
            id,
            tap: VirtualTap::default(),
            memberships: Mutex::new(HashMap::new()),
        }
    }

    #[must_use]
    pub fn id(&self) -> u64 {
        self.id
    }

    #[must_use]
    pub fn tap(&self) -> &VirtualTap {
        &self.tap
    }

    /// Poll the tap for its current subscriptions, refreshing membership
    /// timestamps. Returns whether the membership set changed.
    pub fn update_multicast_groups(&self, now: u64) -> bool {
        let reported = self.tap.multicast_groups();
        let mut memberships = self.memberships.lock().unwrap_or_else(|e| e.into_inner());
        let mut changed = false;
        for group in &reported {
            if memberships.insert(*group, now).is_none() {
                changed = true;
            }
        }
        changed
    }

    /// The current membership set.
    #[must_use]
    pub fn multicast_groups(&self) -> Vec<MulticastGroup> {
        let memberships = self.memberships.lock().unwrap_or_else(|e| e.into_inner());
        let mut groups: Vec<MulticastGroup> = memberships.keys().copied().collect();
        groups.sort();
        groups
    }

    /// Evict memberships the tap has not reported within the expiry
    /// window. Returns whether anything was dropped.
    pub fn clean(&self, now: u64) -> bool {
        let mut memberships = self.memberships.lock().unwrap_or_else(|e| e.into_inner());
        let before = memberships.len();
        memberships.retain(|_, seen| now.saturating_sub(*seen) < MULTICAST_LIKE_EXPIRE);
        memberships.len() != before
    }
}
