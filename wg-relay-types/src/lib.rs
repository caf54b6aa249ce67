//! Wire-format constants and small newtypes for the WireGuard handshake
//! framing this relay inspects. The relay never parses past what's needed
//! to classify, authenticate, and route a datagram — it does not know the
//! handshake's cryptographic structure beyond the MAC1 field.

use std::fmt;

use base64ct::{Base64, Encoding};
use thiserror::Error;

/// Handshake initiation: sender -> responder, first message of the handshake.
pub const MSG_INITIATION: u8 = 1;
/// Handshake initiation response: responder -> sender, completes the handshake.
pub const MSG_INITIATION_RESPONSE: u8 = 2;
/// Cookie reply, sent instead of an initiation response under load.
pub const MSG_COOKIE_REPLY: u8 = 3;
/// Transport data / keepalive.
pub const MSG_TRANSPORT: u8 = 4;

pub const LEN_INITIATION: usize = 148;
pub const LEN_INITIATION_RESPONSE: usize = 92;
pub const LEN_COOKIE_REPLY: usize = 64;
pub const LEN_TRANSPORT_MIN: usize = 32;

/// Offset of the 16-byte MAC1 field within a handshake initiation.
pub const MAC1_OFFSET_INITIATION: usize = 116;
/// Offset of the 16-byte MAC1 field within a handshake initiation response.
pub const MAC1_OFFSET_RESPONSE: usize = 60;
pub const MAC_LEN: usize = 16;

pub const LABEL_MAC1: &[u8; 8] = b"mac1----";

pub const PUBLIC_KEY_LEN: usize = 32;

/// The message kind a datagram was classified as, per `(type byte, length)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    Initiation,
    InitiationResponse,
    CookieReply,
    Transport,
}

/// Classify a datagram by its first byte and length, per the relay's
/// dispatch table. Returns `None` for anything that should be silently
/// dropped: empty, unrecognized type, or wrong length for its declared type.
pub fn classify(datagram: &[u8]) -> Option<MessageKind> {
    if datagram.is_empty() {
        return None;
    }
    match (datagram[0], datagram.len()) {
        (MSG_TRANSPORT, len) if len >= LEN_TRANSPORT_MIN => Some(MessageKind::Transport),
        (MSG_INITIATION, LEN_INITIATION) => Some(MessageKind::Initiation),
        (MSG_INITIATION_RESPONSE, LEN_INITIATION_RESPONSE) => {
            Some(MessageKind::InitiationResponse)
        }
        (MSG_COOKIE_REPLY, LEN_COOKIE_REPLY) => Some(MessageKind::CookieReply),
        _ => None,
    }
}

/// MAC1 offset for a message type known to carry one (initiation or
/// initiation-response). Panics on any other type; callers only reach this
/// after `classify` has already picked one of those two kinds.
pub fn mac1_offset(msg_type: u8) -> usize {
    match msg_type {
        MSG_INITIATION => MAC1_OFFSET_INITIATION,
        MSG_INITIATION_RESPONSE => MAC1_OFFSET_RESPONSE,
        _ => unreachable!("mac1_offset called on a message type with no MAC1 field"),
    }
}

/// A 4-byte session index, chosen by a VPN peer. Treated by the relay as an
/// unstructured, opaque identifier: equality and hashability only.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Idx(pub [u8; 4]);

impl Idx {
    pub fn from_slice(bytes: &[u8]) -> Option<Self> {
        <[u8; 4]>::try_from(bytes).ok().map(Idx)
    }
}

impl fmt::Debug for Idx {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Idx({self})")
    }
}

// Hex formatting is for operator diagnostics only; not part of any external
// contract.
impl fmt::Display for Idx {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for b in self.0 {
            write!(f, "{b:02x}")?;
        }
        Ok(())
    }
}

/// A 32-byte WireGuard public key, as configured via base64 on the CLI.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct PubKey(pub [u8; PUBLIC_KEY_LEN]);

#[derive(Debug, Error)]
pub enum PubKeyError {
    #[error("invalid base64: {0}")]
    Base64(#[from] base64ct::Error),
    #[error("decoded key is {len} bytes, expected {PUBLIC_KEY_LEN}")]
    WrongLength { len: usize },
}

impl PubKey {
    pub fn from_base64(s: &str) -> Result<Self, PubKeyError> {
        let mut buf = [0u8; PUBLIC_KEY_LEN];
        let decoded = Base64::decode(s.trim(), &mut buf)?;
        if decoded.len() != PUBLIC_KEY_LEN {
            return Err(PubKeyError::WrongLength { len: decoded.len() });
        }
        Ok(PubKey(buf))
    }

    pub fn as_bytes(&self) -> &[u8; PUBLIC_KEY_LEN] {
        &self.0
    }
}

impl fmt::Debug for PubKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PubKey({self})")
    }
}

impl fmt::Display for PubKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut buf = [0u8; 44];
        let s = Base64::encode(&self.0, &mut buf).map_err(|_| fmt::Error)?;
        f.write_str(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_by_type_and_length() {
        let mut init = [0u8; LEN_INITIATION];
        init[0] = MSG_INITIATION;
        assert_eq!(classify(&init), Some(MessageKind::Initiation));

        // wrong length for type 1 is dropped, not misclassified
        assert_eq!(classify(&init[..100]), None);

        let mut resp = [0u8; LEN_INITIATION_RESPONSE];
        resp[0] = MSG_INITIATION_RESPONSE;
        assert_eq!(classify(&resp), Some(MessageKind::InitiationResponse));

        let mut cookie = [0u8; LEN_COOKIE_REPLY];
        cookie[0] = MSG_COOKIE_REPLY;
        assert_eq!(classify(&cookie), Some(MessageKind::CookieReply));

        let mut transport = [0u8; LEN_TRANSPORT_MIN];
        transport[0] = MSG_TRANSPORT;
        assert_eq!(classify(&transport), Some(MessageKind::Transport));
        // longer transport frames are still transport frames
        let mut big = vec![0u8; 200];
        big[0] = MSG_TRANSPORT;
        assert_eq!(classify(&big), Some(MessageKind::Transport));

        assert_eq!(classify(&[]), None);
        assert_eq!(classify(&[9, 9, 9, 9]), None);
    }

    #[test]
    fn pubkey_roundtrips_through_base64() {
        let raw = [7u8; PUBLIC_KEY_LEN];
        let mut buf = [0u8; 44];
        let encoded = Base64::encode(&raw, &mut buf).unwrap();
        let key = PubKey::from_base64(encoded).unwrap();
        assert_eq!(key.as_bytes(), &raw);
    }

    #[test]
    fn pubkey_rejects_wrong_length() {
        let err = PubKey::from_base64("AAAA").unwrap_err();
        assert!(matches!(err, PubKeyError::WrongLength { .. }));
    }

    #[test]
    fn idx_displays_as_lowercase_hex() {
        let idx = Idx([0xde, 0xad, 0xbe, 0xef]);
        assert_eq!(idx.to_string(), "deadbeef");
    }
}
