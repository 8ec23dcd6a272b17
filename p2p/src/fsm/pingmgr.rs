//! Ping manager.
//!
//! Sends a latency probe every couple of minutes and answers the peer's
//! probes. Peers predating BIP 31 get a nonce-free ping and no
//! round-trip tracking, since they will never answer with a `pong`.
use log::*;

use galena_common::block::time::{LocalDuration, LocalTime};
use galena_common::collections::HashMap;
use galena_common::p2p::PeerId;

use super::output::Ping;
use super::{BIP0031_VERSION, PING_INTERVAL};

#[derive(Debug)]
enum State {
    AwaitingPong { nonce: u64, since: LocalTime },
    Idle { since: LocalTime },
}

#[derive(Debug)]
struct Peer {
    version: u32,
    state: State,
    queued: bool,
    last_rtt: Option<LocalDuration>,
    min_rtt: Option<LocalDuration>,
}

/// Sends and answers latency probes.
#[derive(Debug)]
pub struct PingManager<U> {
    peers: HashMap<PeerId, Peer>,
    rng: fastrand::Rng,
    upstream: U,
}

impl<U: Ping> PingManager<U> {
    /// Create a new ping manager.
    pub fn new(rng: fastrand::Rng, upstream: U) -> Self {
        let peers = HashMap::with_hasher(rng.clone().into());

        Self {
            peers,
            rng,
            upstream,
        }
    }

    /// Called when a peer completes the handshake.
    pub fn peer_negotiated(&mut self, id: PeerId, version: u32) {
        self.peers.insert(
            id,
            Peer {
                version,
                // An old enough `since` makes the first tick ping.
                state: State::Idle {
                    since: LocalTime::default(),
                },
                queued: false,
                last_rtt: None,
                min_rtt: None,
            },
        );
    }

    /// Called when a peer disconnects.
    pub fn peer_disconnected(&mut self, id: PeerId) {
        self.peers.remove(&id);
    }

    /// Queue a ping outside the regular interval.
    pub fn queue_ping(&mut self, id: PeerId) {
        if let Some(peer) = self.peers.get_mut(&id) {
            peer.queued = true;
        }
    }

    /// Called on each send tick for the peer.
    pub fn maybe_ping(&mut self, id: PeerId, now: LocalTime) {
        let peer = match self.peers.get_mut(&id) {
            Some(peer) => peer,
            None => return,
        };
        let due = match peer.state {
            State::Idle { since } => now >= since + PING_INTERVAL,
            State::AwaitingPong { .. } => false,
        };
        if !peer.queued && !due {
            return;
        }
        peer.queued = false;

        if peer.version > BIP0031_VERSION {
            let nonce = loop {
                let nonce = self.rng.u64(..);
                if nonce != 0 {
                    break nonce;
                }
            };
            self.upstream.ping(id, nonce);
            peer.state = State::AwaitingPong { nonce, since: now };
        } else {
            // The pong will never arrive; just keep the interval.
            self.upstream.ping_legacy(id);
            peer.state = State::Idle { since: now };
        }
    }

    /// Called when a `ping` is received.
    pub fn received_ping(&mut self, id: PeerId, nonce: u64) {
        if let Some(peer) = self.peers.get(&id) {
            if peer.version > BIP0031_VERSION {
                self.upstream.pong(id, nonce);
            }
        }
    }

    /// Called when a `pong` is received. Mismatched nonces are normal
    /// when pings overlap and are tolerated without penalty.
    pub fn received_pong(&mut self, id: PeerId, nonce: Option<u64>, now: LocalTime) {
        let peer = match self.peers.get_mut(&id) {
            Some(peer) => peer,
            None => return,
        };
        match peer.state {
            State::AwaitingPong {
                nonce: expected,
                since,
            } => match nonce {
                Some(n) if n == expected => {
                    let rtt = now - since;

                    if rtt > LocalDuration::default() {
                        peer.last_rtt = Some(rtt);
                        peer.min_rtt = Some(peer.min_rtt.map_or(rtt, |m| m.min(rtt)));
                    }
                    peer.state = State::Idle { since: now };
                }
                Some(0) | None => {
                    // Most likely a bug in the remote implementation;
                    // cancel the probe.
                    debug!("peer={}: pong cancelled the outstanding ping", id);
                    peer.state = State::Idle { since: now };
                }
                Some(n) => {
                    trace!("peer={}: pong nonce mismatch: {:x} != {:x}", id, n, expected);
                }
            },
            State::Idle { .. } => {
                trace!("peer={}: unsolicited pong", id);
            }
        }
    }

    /// Last and lowest observed round-trip times for a peer.
    pub fn latency(&self, id: PeerId) -> Option<(LocalDuration, LocalDuration)> {
        let peer = self.peers.get(&id)?;

        Some((peer.last_rtt?, peer.min_rtt?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fsm::output::{Io, Outbox};
    use bitcoin::network::message::NetworkMessage;

    fn messages(outbox: &mut Outbox) -> Vec<NetworkMessage> {
        outbox
            .drain()
            .filter_map(|io| match io {
                Io::Message(_, msg) => Some(msg),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn test_ping_interval() {
        let mut outbox = Outbox::new(70015);
        let mut mgr = PingManager::new(fastrand::Rng::with_seed(3), outbox.clone());
        let mut now = LocalTime::from_secs(10_000);

        mgr.peer_negotiated(1, 70015);
        mgr.maybe_ping(1, now);

        let nonce = match &messages(&mut outbox)[..] {
            [NetworkMessage::Ping(n)] => *n,
            msgs => panic!("expected a ping, got {:?}", msgs),
        };
        assert_ne!(nonce, 0);

        // No second ping while one is outstanding.
        now.elapse(PING_INTERVAL * 2);
        mgr.maybe_ping(1, now);
        assert!(messages(&mut outbox).is_empty());

        mgr.received_pong(1, Some(nonce), now);
        assert!(mgr.latency(1).is_some());

        now.elapse(PING_INTERVAL);
        mgr.maybe_ping(1, now);
        assert_eq!(messages(&mut outbox).len(), 1);
    }

    #[test]
    fn test_legacy_ping_has_no_nonce() {
        let mut outbox = Outbox::new(70015);
        let mut mgr = PingManager::new(fastrand::Rng::with_seed(3), outbox.clone());

        mgr.peer_negotiated(1, BIP0031_VERSION);
        mgr.maybe_ping(1, LocalTime::from_secs(10_000));

        assert!(matches!(
            &messages(&mut outbox)[..],
            [NetworkMessage::Ping(0)]
        ));
    }

    #[test]
    fn test_pong_mismatch_tolerated() {
        let mut outbox = Outbox::new(70015);
        let mut mgr = PingManager::new(fastrand::Rng::with_seed(3), outbox.clone());
        let now = LocalTime::from_secs(10_000);

        mgr.peer_negotiated(1, 70015);
        mgr.maybe_ping(1, now);
        messages(&mut outbox);

        mgr.received_pong(1, Some(0xdead_beef), now + LocalDuration::from_secs(1));
        assert!(mgr.latency(1).is_none(), "mismatch records no latency");
    }
}
