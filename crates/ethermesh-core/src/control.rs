//! Authenticated message codec for the loopback control channel.
//!
//! Both the node's control server and the out-of-process client derive the
//! same 256-bit key by hashing the shared `authtoken.secret` value with
//! SHA-256. A control packet is:
//!
//! ```text
//! [conversation id: u32 BE] [HMAC-SHA256 tag: 32 bytes] [payload]
//! ```
//!
//! The tag covers the conversation id and the payload. The payload is one
//! or more UTF-8 lines joined by `\n`; encoding fragments line-wise so no
//! packet exceeds [`NODECONFIG_MAX_PACKET_SIZE`]. Packets that fail
//! authentication are rejected without further inspection.

use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256};

use crate::constants::NODECONFIG_MAX_PACKET_SIZE;
use crate::error::CoreError;

type HmacSha256 = Hmac<Sha256>;

/// Bytes of header (conversation id + tag) in every control packet.
pub const CONTROL_PACKET_OVERHEAD: usize = 4 + 32;

/// Largest payload one control packet can carry.
pub const MAX_CONTROL_PAYLOAD: usize = NODECONFIG_MAX_PACKET_SIZE - CONTROL_PACKET_OVERHEAD;

/// Derive the control-channel key from the shared auth token.
#[must_use]
pub fn derive_control_key(auth_token: &str) -> [u8; 32] {
    Sha256::digest(auth_token.as_bytes()).into()
}

/// Encode `lines` into one or more authenticated packets tagged with
/// `conversation_id`.
pub fn encode_control_message(
    key: &[u8; 32],
    conversation_id: u32,
    lines: &[String],
) -> Result<Vec<Vec<u8>>, CoreError> {
    if conversation_id == 0 {
        return Err(CoreError::ZeroConversationId);
    }

    let mut packets = Vec::new();
    let mut payload = String::new();
    // Track line count, not payload emptiness, so empty result lines
    // survive the round trip.
    let mut lines_in_payload = 0usize;
    for line in lines {
        if line.contains('\n') {
            return Err(CoreError::EmbeddedNewline);
        }
        if line.len() > MAX_CONTROL_PAYLOAD {
            return Err(CoreError::OversizeLine(line.len()));
        }
        let needed = if lines_in_payload == 0 {
            line.len()
        } else {
            line.len() + 1
        };
        if lines_in_payload > 0 && payload.len() + needed > MAX_CONTROL_PAYLOAD {
            packets.push(seal(key, conversation_id, payload.as_bytes()));
            payload.clear();
            lines_in_payload = 0;
        }
        if lines_in_payload > 0 {
            payload.push('\n');
        }
        payload.push_str(line);
        lines_in_payload += 1;
    }
    if lines_in_payload > 0 || packets.is_empty() {
        packets.push(seal(key, conversation_id, payload.as_bytes()));
    }
    Ok(packets)
}

/// Decode and authenticate one packet, yielding its conversation id and
/// payload lines.
pub fn decode_control_packet(key: &[u8; 32], data: &[u8]) -> Result<(u32, Vec<String>), CoreError> {
    if data.len() < CONTROL_PACKET_OVERHEAD {
        return Err(CoreError::Truncated(data.len()));
    }

    let conversation_id = u32::from_be_bytes([data[0], data[1], data[2], data[3]]);
    if conversation_id == 0 {
        return Err(CoreError::ZeroConversationId);
    }

    let tag = &data[4..CONTROL_PACKET_OVERHEAD];
    let payload = &data[CONTROL_PACKET_OVERHEAD..];

    let mut mac = HmacSha256::new_from_slice(key).map_err(|_| CoreError::BadAuthTag)?;
    mac.update(&data[..4]);
    mac.update(payload);
    mac.verify_slice(tag).map_err(|_| CoreError::BadAuthTag)?;

    let text = std::str::from_utf8(payload).map_err(|_| CoreError::InvalidUtf8)?;
    let lines = if text.is_empty() {
        Vec::new()
    } else {
        text.split('\n').map(String::from).collect()
    };
    Ok((conversation_id, lines))
}

fn seal(key: &[u8; 32], conversation_id: u32, payload: &[u8]) -> Vec<u8> {
    let mut packet = Vec::with_capacity(CONTROL_PACKET_OVERHEAD + payload.len());
    packet.extend_from_slice(&conversation_id.to_be_bytes());

    let mut mac =
        HmacSha256::new_from_slice(key).expect("HMAC accepts a key of any length");
    mac.update(&conversation_id.to_be_bytes());
    mac.update(payload);
    packet.extend_from_slice(&mac.finalize().into_bytes());
    packet.extend_from_slice(payload);
    packet
}


#[cfg(test)]
mod proptests {
    use super::*;
    use proptest::prelude::*;

    proptest! {
        #[test]
        fn roundtrip_any_commands(
            token in "[A-Za-z0-9]{24}",
            conv in 1u32..,
            lines in proptest::collection::vec("[^\n]{0,200}", 0..20),
        ) {
            let key = derive_control_key(&token);
            let packets = encode_control_message(&key, conv, &lines).unwrap();
            let mut decoded = Vec::new();
            for p in &packets {
                prop_assert!(p.len() <= NODECONFIG_MAX_PACKET_SIZE);
                let (c, mut l) = decode_control_packet(&key, p).unwrap();
                prop_assert_eq!(c, conv);
                decoded.append(&mut l);
            }
            // An all-empty-lines message decodes to nothing; otherwise the
            // line stream is preserved exactly.
            if lines.iter().all(|l| l.is_empty()) && lines.len() <= 1 {
                prop_assert!(decoded.is_empty());
            } else {
                prop_assert_eq!(decoded, lines);
            }
        }
    }
}
