//! Peer-to-peer primitives shared between the peer logic and the
//! connection manager that drives it.
use std::net;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bitcoin::network::address::Address;
use bitcoin::network::constants::ServiceFlags;

use crate::block::BlockTime;

/// Identifies a peer. Assigned by the connection manager in connection
/// order, so a higher id always means a newer connection.
pub type PeerId = u64;

/// Link direction of a peer connection.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Link {
    /// Connection initiated by the remote.
    Inbound,
    /// Connection initiated by us.
    Outbound,
}

impl Link {
    /// Whether the connection was initiated by us.
    pub fn is_outbound(&self) -> bool {
        *self == Link::Outbound
    }

    /// Whether the connection was initiated by the remote.
    pub fn is_inbound(&self) -> bool {
        *self == Link::Inbound
    }
}

/// Everything the connection manager tells us about a new connection.
#[derive(Clone, Debug)]
pub struct ConnectInfo {
    /// Peer id.
    pub id: PeerId,
    /// Remote address.
    pub addr: net::SocketAddr,
    /// Our address, as bound for this connection.
    pub local_addr: net::SocketAddr,
    /// Display label for logs.
    pub name: String,
    /// Link direction.
    pub link: Link,
    /// Whether the peer is whitelisted.
    pub whitelisted: bool,
    /// Whether this is a manually requested connection.
    pub manual: bool,
    /// Whether this connection exists only to fetch addresses.
    pub one_shot: bool,
    /// Whether this is a feeler connection probing address liveness.
    pub feeler: bool,
}

/// Cooperative cancellation token polled by message handlers.
#[derive(Clone, Debug, Default)]
pub struct Interrupt(Arc<AtomicBool>);

impl Interrupt {
    /// Create a new, unset token.
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation.
    pub fn set(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    /// Whether cancellation was requested.
    pub fn is_set(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// The address manager, as seen by the peer logic. Stores and samples
/// peer addresses; the peer logic only feeds it and reads batches for
/// `addr`/`getaddr` traffic.
pub trait AddressSource {
    /// Addresses to answer a `getaddr` request with.
    fn addresses(&mut self, max: usize) -> Vec<(BlockTime, Address)>;
    /// Store addresses learned from a peer.
    fn add(&mut self, addrs: Vec<(BlockTime, Address)>, source: net::SocketAddr);
    /// Record a successful connection to an address.
    fn mark_good(&mut self, addr: net::SocketAddr);
    /// Update the known services of an address.
    fn set_services(&mut self, addr: net::SocketAddr, services: ServiceFlags);
    /// Number of addresses known.
    fn count(&self) -> usize;
    /// Our own address to advertise to the given peer, if we are
    /// reachable.
    fn local_address(&self, peer: &net::SocketAddr) -> Option<(BlockTime, Address)>;
    /// Record an address a peer claims to see us as.
    fn record_local(&mut self, addr: &Address);
    /// Whether we can route to addresses of this network class.
    fn is_reachable(&self, addr: &Address) -> bool;
    /// Whether we are listening for inbound connections.
    fn is_listening(&self) -> bool;
}
