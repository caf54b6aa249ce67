//! MAC-key table and MAC1 verification.
//!
//! The relay never holds a VPN peer's private key. What it does hold is a
//! per-configured-key MAC key, derived once at startup the same way every
//! WireGuard peer derives it, which is enough to authenticate (but never
//! decrypt) a handshake message.

use ahash::AHashMap;
use blake2::digest::consts::U16;
use blake2::digest::{KeyInit, Mac as _};
use blake2::{Blake2s256, Blake2sMac, Digest};
use subtle::ConstantTimeEq;
use zeroize::Zeroize;

use wg_relay_types::{mac1_offset, PubKey, LABEL_MAC1, MAC_LEN};

/// 32-byte output of `BLAKE2s("mac1----" || pubkey)`.
pub type MacKey = [u8; 32];

/// The largest offset a MAC1 field can sit at (`MAC1_OFFSET_INITIATION`),
/// rounded up; bounds the stack buffer used to build the canonical message
/// so MAC verification never allocates.
const MAX_CANONICAL_LEN: usize = 128;

fn mac1_key(pubkey: &PubKey) -> MacKey {
    let mut hasher = Blake2s256::new();
    hasher.update(LABEL_MAC1);
    hasher.update(pubkey.as_bytes());
    hasher.finalize().into()
}

fn mac16(key: &[u8], msg: &[u8]) -> [u8; MAC_LEN] {
    let mut mac =
        Blake2sMac::<U16>::new_from_slice(key).expect("32-byte key is valid for Blake2sMac");
    mac.update(msg);
    mac.finalize().into_bytes().into()
}

/// Reconstructs the canonical message (header with reserved bytes zeroed,
/// followed by the body up to the MAC1 field) and checks it against the
/// datagram's MAC1 in constant time.
fn verify_mac1_at(datagram: &[u8], offset: usize, key: &MacKey) -> bool {
    assert!(offset <= MAX_CANONICAL_LEN, "mac1 offset out of range");
    if datagram.len() < offset + MAC_LEN {
        return false;
    }

    let mut canonical = [0u8; MAX_CANONICAL_LEN];
    canonical[0] = datagram[0];
    // bytes 1..4 are the reserved header bytes, left zeroed.
    let body_len = offset - 4;
    canonical[4..4 + body_len].copy_from_slice(&datagram[4..offset]);

    let expected = mac16(key, &canonical[..offset]);
    let actual = &datagram[offset..offset + MAC_LEN];
    expected.ct_eq(actual).into()
}

/// Maps each configured public key to its precomputed MAC key. Built once at
/// startup and never mutated afterward.
pub struct MacKeyTable {
    keys: AHashMap<PubKey, MacKey>,
}

impl MacKeyTable {
    /// Derive and cache a MAC key for every distinct public key in `pubkeys`.
    pub fn new<'a>(pubkeys: impl IntoIterator<Item = &'a PubKey>) -> Self {
        let mut keys = AHashMap::default();
        for pk in pubkeys {
            keys.entry(*pk).or_insert_with(|| mac1_key(pk));
        }
        Self { keys }
    }

    /// Linear scan verifying the datagram's MAC1 against every configured
    /// key; returns the first match. Intentional and acceptable: key counts
    /// are small, typically single digits.
    pub fn find_key(&self, datagram: &[u8]) -> Option<PubKey> {
        if datagram.is_empty() {
            return None;
        }
        let offset = mac1_offset(datagram[0]);
        self.keys
            .iter()
            .find(|(_, mac_key)| verify_mac1_at(datagram, offset, mac_key))
            .map(|(pk, _)| *pk)
    }
}

impl Drop for MacKeyTable {
    fn drop(&mut self) {
        for key in self.keys.values_mut() {
            key.zeroize();
        }
    }
}
