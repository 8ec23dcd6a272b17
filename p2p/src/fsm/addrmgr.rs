//! Address relay.
//!
//! Processes `addr` and `getaddr` traffic, remembers which addresses a
//! peer already knows, and fans freshly learned addresses out to a
//! deterministic pair of peers so that the same address keeps flowing
//! through the same relays for a day at a time.
use std::fmt;
use std::net;

use bitcoin::consensus::encode::serialize;
use bitcoin::hashes::{siphash24, Hash};
use bitcoin::network::address::Address;
use bitcoin::network::constants::ServiceFlags;
use log::*;

use galena_common::block::time::{poisson_next_send, LocalTime};
use galena_common::block::BlockTime;
use galena_common::collections::{HashMap, RollingSet};
use galena_common::p2p::{AddressSource, Interrupt, Link, PeerId};

use super::output::SendAddrs;
use super::{
    AVG_ADDRESS_BROADCAST_INTERVAL, AVG_LOCAL_ADDRESS_BROADCAST_INTERVAL, CADDR_TIME_VERSION,
    MAX_ADDR_TO_SEND,
};

/// How many addresses a peer may remember before old entries roll off.
const MAX_ADDR_KNOWN: usize = 5000;
/// Addresses older than this are not relayed.
const ADDR_RELAY_MAX_AGE: BlockTime = 10 * 60;

/// An event originating in the address manager.
#[derive(Debug, Clone)]
pub enum Event {
    /// Addresses were received and stored.
    AddressesReceived {
        /// The sending peer.
        peer: PeerId,
        /// How many addresses were stored.
        count: usize,
    },
}

impl fmt::Display for Event {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Event::AddressesReceived { peer, count } => {
                write!(fmt, "{}: Received {} address(es)", peer, count)
            }
        }
    }
}

#[derive(Debug)]
struct Peer {
    addr: net::SocketAddr,
    link: Link,
    one_shot: bool,
    version: u32,
    /// Addresses this peer is known to have.
    known: RollingSet<Vec<u8>>,
    /// Addresses queued for the next `addr` flush.
    to_send: Vec<(BlockTime, Address)>,
    next_addr_send: LocalTime,
    next_local_send: LocalTime,
    /// The peer asked us for addresses; only honored once.
    answered_getaddr: bool,
    /// We asked the peer for addresses and await the big reply.
    sent_getaddr: bool,
}

/// Manages address exchange and relay.
#[derive(Debug)]
pub struct AddressManager<A, U> {
    store: A,
    peers: HashMap<PeerId, Peer>,
    /// Salt for the deterministic relay-peer selection.
    relay_key: (u64, u64),
    rng: fastrand::Rng,
    upstream: U,
}

impl<A: AddressSource, U: SendAddrs> AddressManager<A, U> {
    /// Create a new address manager around an address store.
    pub fn new(store: A, rng: fastrand::Rng, upstream: U) -> Self {
        let peers = HashMap::with_hasher(rng.clone().into());
        let relay_key = (rng.u64(..), rng.u64(..));

        Self {
            store,
            peers,
            relay_key,
            rng,
            upstream,
        }
    }

    /// Access the underlying store.
    pub fn store_mut(&mut self) -> &mut A {
        &mut self.store
    }

    /// Called when a connection is established.
    pub fn peer_connected(
        &mut self,
        id: PeerId,
        addr: net::SocketAddr,
        link: Link,
        one_shot: bool,
        now: LocalTime,
    ) {
        self.peers.insert(
            id,
            Peer {
                addr,
                link,
                one_shot,
                version: 0,
                known: RollingSet::new(MAX_ADDR_KNOWN, self.rng.clone()),
                to_send: Vec::new(),
                next_addr_send: poisson_next_send(now, AVG_ADDRESS_BROADCAST_INTERVAL, &self.rng),
                next_local_send: poisson_next_send(
                    now,
                    AVG_LOCAL_ADDRESS_BROADCAST_INTERVAL,
                    &self.rng,
                ),
                answered_getaddr: false,
                sent_getaddr: false,
            },
        );
    }

    /// Called once the peer's protocol version is known.
    pub fn peer_negotiated(&mut self, id: PeerId, version: u32) {
        if let Some(peer) = self.peers.get_mut(&id) {
            peer.version = version;
        }
    }

    /// Called when a peer disconnects.
    pub fn peer_disconnected(&mut self, id: PeerId) {
        self.peers.remove(&id);
    }

    /// Record a successful outbound handshake with the peer's address.
    pub fn peer_verified(&mut self, id: PeerId, services: ServiceFlags) {
        if let Some(peer) = self.peers.get(&id) {
            self.store.set_services(peer.addr, services);
            self.store.mark_good(peer.addr);
        }
    }

    /// Ask an outbound peer for addresses.
    pub fn request_addresses(&mut self, id: PeerId) {
        if let Some(peer) = self.peers.get_mut(&id) {
            peer.sent_getaddr = true;
            self.upstream.get_addr(id);
        }
    }

    /// Whether we should bother asking this peer for addresses.
    pub fn wants_addresses(&self, id: PeerId) -> bool {
        self.peers
            .get(&id)
            .map_or(false, |p| p.one_shot || p.version >= CADDR_TIME_VERSION)
            || self.store.count() < 1000
    }

    /// Record the address a peer sees us as.
    pub fn record_local(&mut self, addr: &Address) {
        self.store.record_local(addr);
    }

    /// Queue an address for a peer, unless the peer already knows it.
    /// The queue is bounded; a random entry is replaced when it is full.
    pub fn push_address(&mut self, id: PeerId, entry: (BlockTime, Address)) {
        let peer = match self.peers.get_mut(&id) {
            Some(peer) => peer,
            None => return,
        };
        if peer.known.contains(&addr_key(&entry.1)) {
            return;
        }
        if peer.to_send.len() >= MAX_ADDR_TO_SEND {
            let ix = self.rng.usize(..peer.to_send.len());
            peer.to_send[ix] = entry;
        } else {
            peer.to_send.push(entry);
        }
    }

    /// Advertise our own address to a peer.
    pub fn advertise_local(&mut self, id: PeerId) {
        let peer = match self.peers.get(&id) {
            Some(peer) => peer,
            None => return,
        };
        if !self.store.is_listening() {
            return;
        }
        if let Some(local) = self.store.local_address(&peer.addr) {
            self.push_address(id, local);
        }
    }

    /// Handle a `getaddr` request.
    pub fn received_getaddr(&mut self, id: PeerId) {
        let peer = match self.peers.get_mut(&id) {
            Some(peer) => peer,
            None => return,
        };
        // Answering getaddr on outbound connections would let an
        // attacker fingerprint our address book; and answering twice
        // only helps address stamping.
        if peer.link.is_outbound() {
            debug!("peer={}: Ignoring getaddr on outbound connection", id);
            return;
        }
        if peer.answered_getaddr {
            debug!("peer={}: Ignoring repeated getaddr", id);
            return;
        }
        peer.answered_getaddr = true;
        peer.to_send.clear();

        for entry in self.store.addresses(MAX_ADDR_TO_SEND) {
            self.push_address(id, entry);
        }
    }

    /// Handle an `addr` message. Returns the one-shot disconnect flag on
    /// success, or a misbehavior score.
    pub fn received_addr(
        &mut self,
        id: PeerId,
        addrs: Vec<(BlockTime, Address)>,
        required_services: ServiceFlags,
        now: LocalTime,
        adjusted_time: BlockTime,
        interrupt: &Interrupt,
    ) -> Result<bool, u32> {
        let (version, one_shot, sent_getaddr, source_addr) = match self.peers.get(&id) {
            Some(p) => (p.version, p.one_shot, p.sent_getaddr, p.addr),
            None => return Ok(false),
        };
        // Old peers can't timestamp addresses; ignore them unless we're
        // short on addresses.
        if version < CADDR_TIME_VERSION && self.store.count() > 1000 {
            return Ok(false);
        }
        if addrs.len() > MAX_ADDR_TO_SEND {
            warn!("peer={}: addr message size = {}", id, addrs.len());
            return Err(20);
        }

        let small_batch = addrs.len() <= 10;
        let since = adjusted_time.saturating_sub(ADDR_RELAY_MAX_AGE);
        let mut keep = Vec::with_capacity(addrs.len());

        for (mut time, addr) in addrs {
            if interrupt.is_set() {
                return Ok(false);
            }
            if !addr.services.has(required_services) {
                continue;
            }
            // Normalize absurd timestamps.
            if time <= 100_000_000 || time > adjusted_time + 10 * 60 {
                time = adjusted_time.saturating_sub(5 * 24 * 60 * 60);
            }
            if let Some(peer) = self.peers.get_mut(&id) {
                peer.known.insert(addr_key(&addr));
            }
            let reachable = self.store.is_reachable(&addr);

            if time > since && !sent_getaddr && small_batch && is_routable(&addr) {
                self.relay_address((time, addr.clone()), reachable, now);
            }
            // Do not store addresses outside our network.
            if reachable {
                keep.push((time, addr));
            }
        }
        let count = keep.len();

        self.store.add(keep, source_addr);
        self.upstream.event(Event::AddressesReceived { peer: id, count });

        if let Some(peer) = self.peers.get_mut(&id) {
            peer.sent_getaddr = false;
        }
        Ok(one_shot)
    }

    /// Relay an address to a deterministic selection of peers: two for
    /// reachable addresses, one otherwise. The selection is keyed on the
    /// address and the day, so it only rotates every 24 hours.
    fn relay_address(&mut self, entry: (BlockTime, Address), reachable: bool, now: LocalTime) {
        let relay_count = if reachable { 2 } else { 1 };
        let key = addr_key(&entry.1);
        let addr_hash = self.salted_hash(&key);
        let day = (now.as_secs().wrapping_add(addr_hash)) / (24 * 60 * 60);

        let mut best: Vec<(u64, PeerId)> = Vec::new();

        for (id, peer) in &self.peers {
            if peer.version < CADDR_TIME_VERSION {
                continue;
            }
            let mut input = key.clone();
            input.extend_from_slice(&day.to_le_bytes());
            input.extend_from_slice(&id.to_le_bytes());

            best.push((self.salted_hash(&input), *id));
        }
        best.sort_unstable_by(|a, b| b.cmp(a));

        for (_, id) in best.into_iter().take(relay_count) {
            self.push_address(id, entry.clone());
        }
    }

    fn salted_hash(&self, data: &[u8]) -> u64 {
        siphash24::Hash::hash_with_keys(self.relay_key.0, self.relay_key.1, data).as_u64()
    }

    /// Flush queued addresses to a peer. Called on each send tick, after
    /// the handshake; advertises our local address and drains the addr
    /// queue at their respective Poisson cadences.
    pub fn flush(&mut self, id: PeerId, now: LocalTime, in_ibd: bool) {
        if !in_ibd {
            if self
                .peers
                .get(&id)
                .map_or(false, |p| now >= p.next_local_send)
            {
                self.advertise_local(id);
                if let Some(peer) = self.peers.get_mut(&id) {
                    peer.next_local_send =
                        poisson_next_send(now, AVG_LOCAL_ADDRESS_BROADCAST_INTERVAL, &self.rng);
                }
            }
        }

        let peer = match self.peers.get_mut(&id) {
            Some(peer) => peer,
            None => return,
        };
        if now < peer.next_addr_send {
            return;
        }
        peer.next_addr_send = poisson_next_send(now, AVG_ADDRESS_BROADCAST_INTERVAL, &self.rng);

        let mut batch = Vec::with_capacity(peer.to_send.len().min(MAX_ADDR_TO_SEND));

        for entry in peer.to_send.drain(..) {
            if peer.known.insert(addr_key(&entry.1)) {
                batch.push(entry);
                // The receiver rejects bigger addr messages.
                if batch.len() >= MAX_ADDR_TO_SEND {
                    self.upstream.addr(id, std::mem::take(&mut batch));
                }
            }
        }
        if !batch.is_empty() {
            self.upstream.addr(id, batch);
        }
    }
}

/// The store key of an address: its serialized network form, without
/// the timestamp.
fn addr_key(addr: &Address) -> Vec<u8> {
    serialize(addr)
}

/// Whether an address is on a publicly routable network.
pub fn is_routable(addr: &Address) -> bool {
    match addr.socket_addr() {
        Ok(net::SocketAddr::V4(sock)) => {
            let ip = sock.ip();
            !(ip.is_private()
                || ip.is_loopback()
                || ip.is_link_local()
                || ip.is_broadcast()
                || ip.is_unspecified())
        }
        Ok(net::SocketAddr::V6(sock)) => {
            let ip = sock.ip();
            !(ip.is_loopback() || ip.is_unspecified())
        }
        Err(_) => false,
    }
}
