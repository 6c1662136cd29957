//! Built-in defaults, including the hard-coded supernode list.

use std::net::{Ipv4Addr, SocketAddr};

use ethermesh_core::constants::DEFAULT_UDP_PORT;
use ethermesh_core::Address;

/// The well-known always-reachable relay nodes, installed into the
/// topology at startup. Addresses must match the identities the operators
/// of these nodes publish.
// TODO: bootstrap this list off the network so supernode changes do not
// require a release.
#[must_use]
pub fn supernodes() -> Vec<(Address, SocketAddr)> {
    vec![
        (
            Address::new([0x8a, 0xcf, 0x05, 0x9f, 0xe3]),
            SocketAddr::from((Ipv4Addr::new(198, 199, 97, 220), DEFAULT_UDP_PORT)),
        ),
        (
            Address::new([0x70, 0x31, 0xdb, 0x76, 0xf9]),
            SocketAddr::from((Ipv4Addr::new(107, 191, 46, 210), DEFAULT_UDP_PORT)),
        ),
        (
            Address::new([0x36, 0xf6, 0x3d, 0x12, 0x51]),
            SocketAddr::from((Ipv4Addr::new(162, 243, 77, 111), DEFAULT_UDP_PORT)),
        ),
    ]
}
