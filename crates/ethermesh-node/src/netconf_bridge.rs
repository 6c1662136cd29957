//! Bridge between the netconf helper subprocess and the overlay.
//!
//! The helper answers network configuration requests with dictionary
//! messages. This module parses those untyped messages into a typed
//! [`NetconfResponse`] at the boundary, then turns each into an overlay
//! `OK` or `ERROR` reply enqueued on the switch. Malformed messages are
//! logged and dropped.

use tracing::{debug, warn};

use ethermesh_core::constants::NETCONF_MAX_BLOB;
use ethermesh_core::{Address, Dictionary};
use ethermesh_overlay::{ErrorCode, Packet, Switch};

use crate::node_config::NodeConfig;

/// The outcome the helper reported for one request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NetconfPayload {
    /// A symbolic error code; `NOT_FOUND` maps to the overlay's
    /// `NOT_FOUND`, anything else to `INVALID_REQUEST`.
    Error(String),
    /// An opaque configuration blob, strictly shorter than
    /// [`NETCONF_MAX_BLOB`] bytes.
    Blob(Vec<u8>),
}

/// A parsed `netconf-response` message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetconfResponse {
    /// The overlay packet id being answered.
    pub request_id: u64,
    pub nwid: u64,
    /// The peer that asked.
    pub peer: Address,
    pub payload: NetconfPayload,
}

/// Reasons a helper message is rejected.
#[derive(Debug, PartialEq, Eq, thiserror::Error)]
pub enum BridgeError {
    #[error("message is not a netconf-response")]
    NotAResponse,
    #[error("missing field {0}")]
    MissingField(&'static str),
    #[error("malformed field {0}")]
    BadField(&'static str),
    #[error("netconf blob of {0} bytes exceeds the size bound")]
    OversizeBlob(usize),
    #[error("unknown network {0:#x}")]
    UnknownNetwork(u64),
}

/// Parse a helper message into a typed response.
pub fn parse_netconf_response(message: &Dictionary) -> Result<NetconfResponse, BridgeError> {
    if message.get("type") != Some("netconf-response") {
        return Err(BridgeError::NotAResponse);
    }

    let request_id = hex_field(message, "requestId")?;
    let nwid = hex_field(message, "nwid")?;
    let peer: Address = message
        .get("peer")
        .ok_or(BridgeError::MissingField("peer"))?
        .parse()
        .map_err(|_| BridgeError::BadField("peer"))?;

    let payload = if let Some(code) = message.get("error") {
        NetconfPayload::Error(code.to_string())
    } else if let Some(blob) = message.get("netconf") {
        if blob.len() >= NETCONF_MAX_BLOB {
            return Err(BridgeError::OversizeBlob(blob.len()));
        }
        NetconfPayload::Blob(blob.as_bytes().to_vec())
    } else {
        return Err(BridgeError::MissingField("error or netconf"));
    };

    Ok(NetconfResponse {
        request_id,
        nwid,
        peer,
        payload,
    })
}

fn hex_field(message: &Dictionary, field: &'static str) -> Result<u64, BridgeError> {
    let raw = message.get(field).ok_or(BridgeError::MissingField(field))?;
    u64::from_str_radix(raw.trim_start_matches("0x"), 16).map_err(|_| BridgeError::BadField(field))
}

/// Map a helper error code onto an overlay error code.
#[must_use]
pub fn map_error_code(code: &str) -> ErrorCode {
    if code == "NOT_FOUND" {
        ErrorCode::NotFound
    } else {
        ErrorCode::InvalidRequest
    }
}

/// Handle one message from the netconf helper: validate it against the
/// joined networks and enqueue the overlay reply on the switch.
pub fn handle_netconf_message(
    nc: &NodeConfig,
    switch: &Switch,
    our_address: Address,
    message: &Dictionary,
    now: u64,
) {
    let response = match parse_netconf_response(message) {
        Ok(response) => response,
        Err(BridgeError::NotAResponse) => {
            debug!("ignoring helper message of unknown type");
            return;
        }
        Err(e) => {
            warn!("dropping malformed netconf response: {e}");
            return;
        }
    };

    if nc.network(response.nwid).is_none() {
        warn!(
            "dropping netconf response for unknown network {:#x}",
            response.nwid
        );
        return;
    }

    let packet = match &response.payload {
        NetconfPayload::Error(code) => Packet::network_config_error(
            response.peer,
            our_address,
            response.request_id,
            map_error_code(code),
            response.nwid,
        ),
        NetconfPayload::Blob(blob) => Packet::network_config_ok(
            response.peer,
            our_address,
            response.request_id,
            response.nwid,
            blob,
        ),
    };
    switch.send(packet, now);
}
