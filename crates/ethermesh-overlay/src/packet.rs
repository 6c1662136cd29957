//! Overlay packets.
//!
//! The wire layout is deliberately small: destination and source addresses
//! followed by a verb byte and an opaque verb-specific payload. Only the
//! verbs the node core emits are defined here; transit framing, encryption,
//! and fragmentation live below the demarcation point and are not this
//! crate's concern.
//!
//! ```text
//! [destination: 5] [source: 5] [verb: 1] [payload...]
//! ```

use ethermesh_core::address::ADDRESS_LENGTH;
use ethermesh_core::{Address, Identity};

use crate::error::OverlayError;
use crate::multicast::MulticastGroup;

/// Fixed header bytes before the payload.
pub const PACKET_HEADER_LENGTH: usize = 2 * ADDRESS_LENGTH + 1;

/// Protocol verbs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Verb {
    Nop = 0x00,
    /// Keepalive carrying identity proof.
    Hello = 0x01,
    Error = 0x02,
    Ok = 0x03,
    /// Multicast group membership announcement.
    MulticastLike = 0x09,
    NetworkConfigRequest = 0x0b,
}

impl TryFrom<u8> for Verb {
    type Error = OverlayError;

    fn try_from(value: u8) -> Result<Self, OverlayError> {
        match value {
            0x00 => Ok(Self::Nop),
            0x01 => Ok(Self::Hello),
            0x02 => Ok(Self::Error),
            0x03 => Ok(Self::Ok),
            0x09 => Ok(Self::MulticastLike),
            0x0b => Ok(Self::NetworkConfigRequest),
            other => Err(OverlayError::UnknownVerb(other)),
        }
    }
}

/// Error codes carried in `ERROR` replies.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ErrorCode {
    None = 0x00,
    InvalidRequest = 0x01,
    NotFound = 0x02,
}

impl TryFrom<u8> for ErrorCode {
    type Error = OverlayError;

    fn try_from(value: u8) -> Result<Self, OverlayError> {
        match value {
            0x00 => Ok(Self::None),
            0x01 => Ok(Self::InvalidRequest),
            0x02 => Ok(Self::NotFound),
            other => Err(OverlayError::UnknownVerb(other)),
        }
    }
}

/// One overlay packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub destination: Address,
    pub source: Address,
    pub verb: Verb,
    pub payload: Vec<u8>,
}

impl Packet {
    /// Build a HELLO: timestamp, the sender's public identity, and a
    /// signature over the timestamp proving key possession.
    pub fn hello(destination: Address, identity: &Identity, now: u64) -> Result<Self, OverlayError> {
        let public = identity.to_public_string();
        let signature = identity
            .sign(&now.to_be_bytes())
            .ok_or(OverlayError::NoPrivateKey)?;

        let mut payload = Vec::with_capacity(8 + 2 + public.len() + 64);
        payload.extend_from_slice(&now.to_be_bytes());
        payload.extend_from_slice(&(public.len() as u16).to_be_bytes());
        payload.extend_from_slice(public.as_bytes());
        payload.extend_from_slice(&signature);

        Ok(Self {
            destination,
            source: identity.address(),
            verb: Verb::Hello,
            payload,
        })
    }

    /// Build a MULTICAST_LIKE carrying `(network id, group)` entries.
    #[must_use]
    pub fn multicast_like(
        destination: Address,
        source: Address,
        entries: &[(u64, MulticastGroup)],
    ) -> Self {
        let mut payload = Vec::with_capacity(entries.len() * 18);
        for (nwid, group) in entries {
            payload.extend_from_slice(&nwid.to_be_bytes());
            payload.extend_from_slice(group.mac());
            payload.extend_from_slice(&group.adi().to_be_bytes());
        }
        Self {
            destination,
            source,
            verb: Verb::MulticastLike,
            payload,
        }
    }

    /// Build an OK reply to a network configuration request.
    #[must_use]
    pub fn network_config_ok(
        destination: Address,
        source: Address,
        in_re_packet_id: u64,
        nwid: u64,
        blob: &[u8],
    ) -> Self {
        let mut payload = Vec::with_capacity(1 + 8 + 8 + 2 + blob.len());
        payload.push(Verb::NetworkConfigRequest as u8);
        payload.extend_from_slice(&in_re_packet_id.to_be_bytes());
        payload.extend_from_slice(&nwid.to_be_bytes());
        payload.extend_from_slice(&(blob.len() as u16).to_be_bytes());
        payload.extend_from_slice(blob);
        Self {
            destination,
            source,
            verb: Verb::Ok,
            payload,
        }
    }

    /// Build an ERROR reply to a network configuration request.
    #[must_use]
    pub fn network_config_error(
        destination: Address,
        source: Address,
        in_re_packet_id: u64,
        code: ErrorCode,
        nwid: u64,
    ) -> Self {
        let mut payload = Vec::with_capacity(1 + 8 + 1 + 8);
        payload.push(Verb::NetworkConfigRequest as u8);
        payload.extend_from_slice(&in_re_packet_id.to_be_bytes());
        payload.push(code as u8);
        payload.extend_from_slice(&nwid.to_be_bytes());
        Self {
            destination,
            source,
            verb: Verb::Error,
            payload,
        }
    }

    #[must_use]
    pub fn serialize(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(PACKET_HEADER_LENGTH + self.payload.len());
        out.extend_from_slice(self.destination.as_bytes());
        out.extend_from_slice(self.source.as_bytes());
        out.push(self.verb as u8);
        out.extend_from_slice(&self.payload);
        out
    }

    pub fn parse(data: &[u8]) -> Result<Self, OverlayError> {
        if data.len() < PACKET_HEADER_LENGTH {
            return Err(OverlayError::PacketTruncated(data.len()));
        }
        let mut dest = [0u8; ADDRESS_LENGTH];
        dest.copy_from_slice(&data[..ADDRESS_LENGTH]);
        let mut src = [0u8; ADDRESS_LENGTH];
        src.copy_from_slice(&data[ADDRESS_LENGTH..2 * ADDRESS_LENGTH]);
        Ok(Self {
            destination: Address::new(dest),
            source: Address::new(src),
            verb: Verb::try_from(data[2 * ADDRESS_LENGTH])?,
            payload: data[PACKET_HEADER_LENGTH..].to_vec(),
        })
    }
}

/// Decoded fields of a network-config ERROR payload.
pub fn parse_network_config_error(payload: &[u8]) -> Result<(Verb, u64, ErrorCode, u64), OverlayError> {
    if payload.len() < 18 {
        return Err(OverlayError::PacketTruncated(payload.len()));
    }
    let verb = Verb::try_from(payload[0])?;
    let in_re = u64::from_be_bytes(payload[1..9].try_into().unwrap_or_default());
    let code = ErrorCode::try_from(payload[9])?;
    let nwid = u64::from_be_bytes(payload[10..18].try_into().unwrap_or_default());
    Ok((verb, in_re, code, nwid))
}

/// Decoded fields of a network-config OK payload.
pub fn parse_network_config_ok(payload: &[u8]) -> Result<(Verb, u64, u64, Vec<u8>), OverlayError> {
    if payload.len() < 19 {
        return Err(OverlayError::PacketTruncated(payload.len()));
    }
    let verb = Verb::try_from(payload[0])?;
    let in_re = u64::from_be_bytes(payload[1..9].try_into().unwrap_or_default());
    let nwid = u64::from_be_bytes(payload[9..17].try_into().unwrap_or_default());
    let len = u16::from_be_bytes([payload[17], payload[18]]) as usize;
    if payload.len() < 19 + len {
        return Err(OverlayError::PacketTruncated(payload.len()));
    }
    Ok((verb, in_re, nwid, payload[19..19 + len].to_vec()))
}
