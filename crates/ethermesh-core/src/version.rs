//! Version identification for running nodes and on-disk binaries.

use std::sync::OnceLock;

pub const VERSION_MAJOR: u8 = 0;
pub const VERSION_MINOR: u8 = 2;
pub const VERSION_REVISION: u16 = 0;

/// Sentinel scanned for by the updater to locate a binary's version without
/// symbols: 16 magic bytes, then major, minor, and the revision in
/// little-endian order.
#[used]
pub static EMBEDDED_VERSION_STAMP: [u8; 20] = [
    0x6d, 0xfe, 0xff, 0x01, 0x90, 0xfa, 0x89, 0x57, 0x88, 0xa1, 0xaa, 0xdc, 0xdd, 0xde, 0xb0, 0x33,
    VERSION_MAJOR,
    VERSION_MINOR,
    (VERSION_REVISION & 0xff) as u8,
    (VERSION_REVISION >> 8) as u8,
];

/// The runtime-queryable version string, `"MAJOR.MINOR.REVISION"`.
#[must_use]
pub fn version_string() -> &'static str {
    static VERSION_STRING: OnceLock<String> = OnceLock::new();
    VERSION_STRING.get_or_init(|| format!("{VERSION_MAJOR}.{VERSION_MINOR}.{VERSION_REVISION}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn version_string_matches_parts() {
        assert_eq!(
            version_string(),
            format!("{VERSION_MAJOR}.{VERSION_MINOR}.{VERSION_REVISION}")
        );
    }

    #[test]
    fn stamp_carries_sentinel_and_version() {
        assert_eq!(
            &EMBEDDED_VERSION_STAMP[..16],
            &[
                0x6d, 0xfe, 0xff, 0x01, 0x90, 0xfa, 0x89, 0x57, 0x88, 0xa1, 0xaa, 0xdc, 0xdd,
                0xde, 0xb0, 0x33
            ]
        );
        assert_eq!(EMBEDDED_VERSION_STAMP[16], VERSION_MAJOR);
        assert_eq!(EMBEDDED_VERSION_STAMP[17], VERSION_MINOR);
        let rev = u16::from_le_bytes([EMBEDDED_VERSION_STAMP[18], EMBEDDED_VERSION_STAMP[19]]);
        assert_eq!(rev, VERSION_REVISION);
    }
}
