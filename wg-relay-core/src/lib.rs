//! The relay state machine: key groups, the session table, and the four
//! datagram handlers that classify, authenticate, and forward handshake and
//! transport traffic between peers that cannot reach each other directly.
//!
//! Process-wide mutable state (session table, group registry) is modeled as
//! a single owning struct passed by exclusive reference through the
//! handlers, not as free-floating globals — the relay is a single-threaded
//! cooperative loop, so there is no need for interior mutability or locking
//! here.

use std::net::SocketAddr;
use std::time::{Duration, Instant};

use ahash::{AHashMap, AHashSet};
use tracing::{debug, info};

use wg_relay_crypto::MacKeyTable;
use wg_relay_types::{classify, Idx, MessageKind, PubKey};

/// An initiator session is deleted after this long without a follow-up
/// packet.
pub const TIMEOUT_INIT: Duration = Duration::from_secs(10);
/// An established session's address is cleared (but the index kept) after
/// this long of silence from that side.
pub const TIMEOUT_ESTABLISHED: Duration = Duration::from_secs(60);
/// The expiry sweep runs at most this often, regardless of how often
/// `maybe_expire` is called.
const SWEEP_INTERVAL: Duration = Duration::from_secs(1);

/// A session, keyed by its 4-byte index in `RelayState::sessions`.
#[derive(Debug, Clone)]
pub struct Session {
    /// Current transport address, or `None` if timed out and awaiting the
    /// paired peer to also expire.
    pub addr: Option<SocketAddr>,
    /// `None` while still in the initiation phase; `Some(peer)` once
    /// established, pointing at the paired session's index.
    ///
    /// The pairing is represented as an index into the session map rather
    /// than a direct reference, so a one-sided dangling reference (the
    /// paired session was already deleted) is just a map miss, repaired by
    /// the next expiry sweep rather than requiring weak-reference
    /// machinery.
    pub peer: Option<Idx>,
    /// Monotonic timestamp of the most recent datagram received with this
    /// index as sender, or as observed sender via paired transport traffic.
    pub last: Instant,
}

/// A permission group: a fixed set of public keys allowed to rendezvous,
/// plus the dynamic set of session indices that have initiated against one
/// of those keys.
struct KeyGroup {
    keys: AHashSet<PubKey>,
    peers: AHashSet<Idx>,
}

/// The relay's entire mutable state: the MAC-key table, the key-group
/// registry, and the session table.
pub struct RelayState {
    mac_keys: MacKeyTable,
    groups: Vec<KeyGroup>,
    sessions: AHashMap<Idx, Session>,
    last_sweep: Option<Instant>,
}

impl RelayState {
    /// Build the relay state from a list of permission groups, each a list
    /// of base64-irrelevant (already-decoded) public keys. Groups may
    /// share keys; the MAC-key table is deduplicated across all of them.
    pub fn new(groups: Vec<Vec<PubKey>>) -> Self {
        let mac_keys = MacKeyTable::new(groups.iter().flatten());
        let groups = groups
            .into_iter()
            .map(|keys| KeyGroup {
                keys: keys.into_iter().collect(),
                peers: AHashSet::default(),
            })
            .collect();

        Self {
            mac_keys,
            groups,
            sessions: AHashMap::default(),
            last_sweep: None,
        }
    }

    /// Classify and dispatch one datagram. Returns the addresses it should
    /// be forwarded to verbatim (zero, one, or many — broadcast happens
    /// only for handshake initiations). The caller owns the actual send.
    pub fn handle_datagram(
        &mut self,
        now: Instant,
        from: SocketAddr,
        datagram: &[u8],
    ) -> Vec<SocketAddr> {
        match classify(datagram) {
            Some(MessageKind::Initiation) => self.handle_initiation(now, from, datagram),
            Some(MessageKind::InitiationResponse) => self
                .handle_initiation_response(now, from, datagram)
                .into_iter()
                .collect(),
            Some(MessageKind::CookieReply) => {
                self.handle_cookie_reply(datagram).into_iter().collect()
            }
            Some(MessageKind::Transport) => {
                self.handle_transport(now, from, datagram).into_iter().collect()
            }
            None => {
                debug!(len = datagram.len(), "dropping unrecognized datagram");
                Vec::new()
            }
        }
    }

    /// Run the expiry sweep if at least a second has passed since the last
    /// one; a no-op otherwise.
    pub fn maybe_expire(&mut self, now: Instant) {
        if let Some(last) = self.last_sweep {
            if now.duration_since(last) < SWEEP_INTERVAL {
                return;
            }
        }
        self.last_sweep = Some(now);
        self.expire_sessions(now);
        self.prune_group_peers();
    }

    /// Handshake initiation (type 1): the first message of a handshake,
    /// broadcast to every other peer currently registered in a group the
    /// matched key belongs to.
    fn handle_initiation(&mut self, now: Instant, from: SocketAddr, d: &[u8]) -> Vec<SocketAddr> {
        let Some(sender) = Idx::from_slice(&d[4..8]) else {
            return Vec::new();
        };

        // Ignore if this index is already established: prevents index
        // reuse across unrelated established connections.
        if self.sessions.get(&sender).is_some_and(|s| s.peer.is_some()) {
            debug!(idx = %sender, "initiation for already-established index dropped");
            return Vec::new();
        }

        let Some(key) = self.mac_keys.find_key(d) else {
            debug!(idx = %sender, "initiation with unrecognized mac1 dropped");
            return Vec::new();
        };

        self.sessions.insert(
            sender,
            Session {
                addr: Some(from),
                peer: None,
                last: now,
            },
        );

        // For every group containing the matched key: record every other
        // peer currently in that group as a forwarding candidate, then add
        // `sender` to the group. Order matters -- `sender` must not be
        // collected as its own forwarding target from this pass. A sender
        // index is added to every group the matched key belongs to, even
        // ones it reaches the relay through for the first time, so a key
        // shared across groups can rendezvous through any of them.
        let mut possible_peers: AHashSet<Idx> = AHashSet::default();
        for group in &mut self.groups {
            if group.keys.contains(&key) {
                possible_peers.extend(group.peers.iter().copied());
                group.peers.insert(sender);
            }
        }

        let sessions = &self.sessions;
        let mut targets: AHashSet<SocketAddr> = possible_peers
            .iter()
            .filter_map(|idx| sessions.get(idx).and_then(|s| s.addr))
            .collect();
        targets.remove(&from);

        info!(
            idx = %sender,
            key = %key,
            from = %from,
            targets = targets.len(),
            "handshake initiation accepted"
        );

        targets.into_iter().collect()
    }

    /// Handshake initiation response (type 2): completes the handshake,
    /// pairing `sender` and `receiver` into an established session.
    fn handle_initiation_response(
        &mut self,
        now: Instant,
        from: SocketAddr,
        d: &[u8],
    ) -> Option<SocketAddr> {
        let sender = Idx::from_slice(&d[4..8])?;
        let receiver = Idx::from_slice(&d[8..12])?;

        if self.sessions.get(&sender).is_some_and(|s| s.peer.is_some()) {
            return None;
        }
        if self.sessions.get(&receiver)?.peer.is_some() {
            return None;
        }

        let key = self.mac_keys.find_key(d)?;

        // The matched key must belong to a group that also lists
        // `receiver` among its peers: this prevents a peer in group A from
        // completing a handshake with an initiator from an unrelated
        // group B, even if both groups happen to accept responses signed
        // under a shared key.
        let allowed = self
            .groups
            .iter()
            .any(|g| g.keys.contains(&key) && g.peers.contains(&receiver));
        if !allowed {
            debug!(
                sender = %sender,
                receiver = %receiver,
                "initiation response policy violation dropped"
            );
            return None;
        }

        self.sessions.insert(
            sender,
            Session {
                addr: Some(from),
                peer: Some(receiver),
                last: now,
            },
        );
        // Pairing is now symmetric (invariant I1).
        self.sessions.get_mut(&receiver).expect("checked above").peer = Some(sender);

        let target = self.sessions[&receiver].addr;
        info!(sender = %sender, receiver = %receiver, key = %key, "session established");
        target
    }

    /// Cookie reply (type 3), deliberately unauthenticated here: cookie
    /// replies carry a different MAC the relay doesn't verify, and
    /// legitimately arrive from any responder in the group.
    fn handle_cookie_reply(&self, d: &[u8]) -> Option<SocketAddr> {
        let receiver = Idx::from_slice(&d[4..8])?;
        let session = self.sessions.get(&receiver)?;
        if session.peer.is_some() {
            return None;
        }
        info!(receiver = %receiver, "cookie reply forwarded");
        session.addr
    }

    /// Transport data / keepalive (type 4).
    ///
    /// Per the wire protocol, bytes 4..8 of a transport frame hold the
    /// *receiver's* session index, not the sender's — the opposite of
    /// types 1/2. The relay learns the actual sender's address from this,
    /// which is how NAT rebinding on either side gets picked up.
    fn handle_transport(&mut self, now: Instant, from: SocketAddr, d: &[u8]) -> Option<SocketAddr> {
        let receiver = Idx::from_slice(&d[4..8])?;
        let sender_idx = self.sessions.get(&receiver)?.peer?;

        if let Some(sender_session) = self.sessions.get_mut(&sender_idx) {
            sender_session.addr = Some(from);
            sender_session.last = now;
        }

        self.sessions.get(&receiver).and_then(|s| s.addr)
    }

    fn expire_sessions(&mut self, now: Instant) {
        let ids: Vec<Idx> = self.sessions.keys().copied().collect();
        for id in ids {
            let Some(session) = self.sessions.get(&id) else {
                continue;
            };

            match session.peer {
                None => {
                    if now.duration_since(session.last) > TIMEOUT_INIT {
                        self.sessions.remove(&id);
                        info!(idx = %id, "initiator timed out");
                    }
                }
                Some(peer) if !self.sessions.contains_key(&peer) => {
                    // Broken pairing: the paired index no longer exists.
                    self.sessions.remove(&id);
                }
                Some(peer) => {
                    if now.duration_since(session.last) > TIMEOUT_ESTABLISHED {
                        let peer_silent =
                            self.sessions.get(&peer).is_some_and(|p| p.addr.is_none());
                        if peer_silent {
                            info!(a = %id, b = %peer, "established pair removed");
                            self.sessions.remove(&peer);
                            self.sessions.remove(&id);
                        } else if self.sessions.get(&id).is_some_and(|s| s.addr.is_some()) {
                            info!(idx = %id, "established peer timed out");
                            self.sessions.get_mut(&id).expect("checked above").addr = None;
                        }
                    }
                }
            }
        }
    }

    fn prune_group_peers(&mut self) {
        let sessions = &self.sessions;
        for group in &mut self.groups {
            group
                .peers
                .retain(|idx| sessions.get(idx).is_some_and(|s| s.addr.is_some()));
        }
    }
}
