//! Per-peer protocol state.
//!
//! One [`NodeState`] row exists per connected peer, created when the
//! connection manager hands us the connection and destroyed when it goes
//! away. The [`NodeStates`] table owns every row together with the
//! global in-flight map, the block source attributions and the derived
//! tallies, so that they can only ever change together.
use std::collections::VecDeque;
use std::net;

use bitcoin::network::constants::ServiceFlags;
use log::*;

use galena_common::block::time::LocalTime;
use galena_common::block::{BlockHash, Height, ZERO_WORK};
use galena_common::chain::{BlockId, Chain, RejectCode};
use galena_common::collections::HashMap;
use galena_common::p2p::{ConnectInfo, Link, PeerId};

use super::cmpct::PartialBlock;

/// Peers kept announcing blocks to us in compact form.
const MAX_CMPCT_ANNOUNCERS: usize = 3;

/// A block download queued with a peer.
#[derive(Debug)]
pub struct QueuedBlock {
    /// Hash of the requested block.
    pub hash: BlockHash,
    /// Header entry, when the header was already validated at request
    /// time.
    pub block: Option<BlockId>,
    /// Whether the header was validated at request time.
    pub validated_headers: bool,
    /// Reconstruction state for compact-block downloads.
    pub partial: Option<PartialBlock>,
}

/// A pending reject notification for a block delivered by this peer,
/// produced asynchronously by validation and flushed on the next send
/// tick.
#[derive(Debug, Clone)]
pub struct BlockReject {
    /// Reject code.
    pub code: RejectCode,
    /// Truncated reason string.
    pub reason: String,
    /// The offending block.
    pub hash: BlockHash,
}

/// State of the chain-sync timeout discipline for an outbound peer: if
/// its best known block stays below our tip for too long, we ask once
/// for headers and then give up on the peer.
#[derive(Debug, Default)]
pub struct ChainSync {
    /// Deadline for the peer to prove chain work.
    pub timeout: Option<LocalTime>,
    /// Our tip at the time the deadline was set.
    pub work_header: Option<BlockId>,
    /// Whether the single probing `getheaders` went out.
    pub sent_getheaders: bool,
    /// Whether the peer is protected from this eviction logic.
    pub protect: bool,
}

/// Everything we track about one connected peer.
#[derive(Debug)]
pub struct NodeState {
    /// Remote address.
    pub addr: net::SocketAddr,
    /// Our address, as bound for this connection.
    pub local_addr: net::SocketAddr,
    /// Display label, for logging.
    pub name: String,
    /// Link direction.
    pub link: Link,
    /// Whether the peer is whitelisted.
    pub whitelisted: bool,
    /// Whether this is a manual connection.
    pub manual: bool,
    /// Address-delivery-only connection.
    pub one_shot: bool,
    /// Liveness-probe connection.
    pub feeler: bool,
    /// When the connection was established.
    pub connected_since: LocalTime,
    /// The nonce we put in our `version` message, to detect connections
    /// to ourselves.
    pub local_nonce: u64,

    /// Protocol version the peer advertised; zero before `version`.
    pub version: u32,
    /// Version we serialize messages with for this peer.
    pub send_version: u32,
    /// Best height the peer claimed at handshake.
    pub starting_height: i32,
    /// Services the peer advertised.
    pub services: ServiceFlags,
    /// The peer does not serve the full chain.
    pub client: bool,
    /// Handshake completed; gates all non-handshake messages.
    pub successfully_connected: bool,
    /// Outbound connection confirmed working, for address bookkeeping.
    pub currently_connected: bool,
    /// A disconnect was already issued for this peer.
    pub disconnecting: bool,

    /// Accumulated misbehavior score.
    pub misbehavior: u32,
    /// Latched when the misbehavior score crosses the ban threshold.
    pub should_ban: bool,
    /// Pending reject notifications.
    pub rejects: Vec<BlockReject>,

    /// The most-work block we know this peer has.
    pub best_known_block: Option<BlockId>,
    /// A block the peer announced but we have not indexed yet.
    pub last_unknown_block: Option<BlockHash>,
    /// The highest block we share with the peer; advances as downloads
    /// complete.
    pub last_common_block: Option<BlockId>,
    /// The best header we have announced to this peer.
    pub best_header_sent: Option<BlockId>,

    /// Streak of header announcements whose parent we lack.
    pub unconnecting_headers: u32,
    /// Whether this peer is our headers-sync source.
    pub sync_started: bool,
    /// Deadline for initial headers sync progress; `None` once we have
    /// caught up and the check is disarmed.
    pub headers_sync_timeout: Option<LocalTime>,

    /// Since when the download window is blocked on this peer.
    pub stalling_since: Option<LocalTime>,
    /// Blocks requested from this peer, in request order.
    pub blocks_in_flight: Vec<QueuedBlock>,
    /// When the first entry of `blocks_in_flight` started downloading.
    pub downloading_since: LocalTime,
    /// How many in-flight entries had validated headers.
    pub in_flight_valid_headers: u32,

    /// Eligible as a primary block-download source.
    pub preferred_download: bool,
    /// Peer asked for `headers` announcements.
    pub prefer_headers: bool,
    /// Peer asked for `cmpctblock` announcements.
    pub prefer_header_and_ids: bool,
    /// Peer offered to serve compact blocks; locks in the witness
    /// flavor we send.
    pub provides_header_and_ids: bool,
    /// Peer advertises the witness service.
    pub have_witness: bool,
    /// Peer wants witnesses in compact blocks we send.
    pub wants_cmpct_witness: bool,
    /// Peer speaks the compact-block version we want to receive.
    pub supports_desired_cmpct_version: bool,

    /// Chain-sync timeout discipline.
    pub chain_sync: ChainSync,
    /// Last time the peer announced a new block to us.
    pub last_block_announcement: Option<LocalTime>,
    /// Last time the peer gave us a new block.
    pub last_block_time: Option<LocalTime>,
}

impl NodeState {
    fn new(conn: &ConnectInfo, local_nonce: u64, now: LocalTime) -> Self {
        Self {
            addr: conn.addr,
            local_addr: conn.local_addr,
            name: conn.name.clone(),
            link: conn.link,
            whitelisted: conn.whitelisted,
            manual: conn.manual,
            one_shot: conn.one_shot,
            feeler: conn.feeler,
            connected_since: now,
            local_nonce,
            version: 0,
            send_version: 0,
            starting_height: -1,
            services: ServiceFlags::NONE,
            client: true,
            successfully_connected: false,
            currently_connected: false,
            disconnecting: false,
            misbehavior: 0,
            should_ban: false,
            rejects: Vec::new(),
            best_known_block: None,
            last_unknown_block: None,
            last_common_block: None,
            best_header_sent: None,
            unconnecting_headers: 0,
            sync_started: false,
            headers_sync_timeout: None,
            stalling_since: None,
            blocks_in_flight: Vec::new(),
            downloading_since: LocalTime::default(),
            in_flight_valid_headers: 0,
            preferred_download: false,
            prefer_headers: false,
            prefer_header_and_ids: false,
            provides_header_and_ids: false,
            have_witness: false,
            wants_cmpct_witness: false,
            supports_desired_cmpct_version: false,
            chain_sync: ChainSync::default(),
            last_block_announcement: None,
            last_block_time: None,
        }
    }

    /// Outbound peers eligible for heuristic eviction: not manual, not
    /// feelers, not one-shots.
    pub fn is_outbound_disconnect_candidate(&self) -> bool {
        self.link.is_outbound() && !self.manual && !self.one_shot && !self.feeler
    }

    /// Number of blocks in flight with this peer.
    pub fn in_flight_count(&self) -> usize {
        self.blocks_in_flight.len()
    }

    /// The queued download of the given block, if any.
    pub fn queued(&self, hash: &BlockHash) -> Option<&QueuedBlock> {
        self.blocks_in_flight.iter().find(|q| &q.hash == hash)
    }

    /// Mutable access to the queued download of the given block.
    pub fn queued_mut(&mut self, hash: &BlockHash) -> Option<&mut QueuedBlock> {
        self.blocks_in_flight.iter_mut().find(|q| &q.hash == hash)
    }
}

/// Per-peer statistics exposed to the embedding node.
#[derive(Debug, Clone)]
pub struct NodeStateStats {
    /// Accumulated misbehavior score.
    pub misbehavior: u32,
    /// Height of the peer's best known block.
    pub sync_height: Option<Height>,
    /// Height of the last block we share with the peer.
    pub common_height: Option<Height>,
    /// Heights of the blocks in flight with the peer.
    pub heights_in_flight: Vec<Height>,
}

/// Outcome of marking a block in flight.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InFlight {
    /// A new entry was queued.
    Inserted,
    /// The block was already in flight with the same peer.
    AlreadyQueued,
}

/// Outcome of rotating a peer into the compact-announcer set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CmpctRotation {
    /// The peer was already announcing in compact form; freshened.
    Refreshed,
    /// The peer should be asked to announce in compact form; if a peer
    /// was displaced, it should be asked to stop.
    Announce {
        /// Displaced announcer, if the set was full.
        stop: Option<PeerId>,
    },
}

/// The table of per-peer state and the globals derived from it.
#[derive(Debug)]
pub struct NodeStates {
    nodes: HashMap<PeerId, NodeState>,
    /// Who a block is in flight with. Every entry has a matching
    /// [`QueuedBlock`] in that peer's list, and vice versa.
    in_flight: HashMap<BlockHash, PeerId>,
    /// Who delivered a block that has not finished validating, and
    /// whether they answer for it if it turns out invalid.
    sources: HashMap<BlockHash, (PeerId, bool)>,
    /// Peers currently asked to announce blocks in compact form, oldest
    /// first.
    cmpct_announcers: VecDeque<PeerId>,

    preferred_download: usize,
    with_validated_downloads: usize,
    protected_outbound: usize,
    sync_started: usize,
    last_tip_update: Option<LocalTime>,
    ban_threshold: u32,
}

impl NodeStates {
    /// Create an empty table.
    pub fn new(ban_threshold: u32, rng: &fastrand::Rng) -> Self {
        Self {
            nodes: HashMap::with_hasher(rng.clone().into()),
            in_flight: HashMap::with_hasher(rng.clone().into()),
            sources: HashMap::with_hasher(rng.clone().into()),
            cmpct_announcers: VecDeque::new(),
            preferred_download: 0,
            with_validated_downloads: 0,
            protected_outbound: 0,
            sync_started: 0,
            last_tip_update: None,
            ban_threshold,
        }
    }

    /// Create the row for a new connection.
    pub fn insert(&mut self, conn: &ConnectInfo, local_nonce: u64, now: LocalTime) {
        self.nodes
            .insert(conn.id, NodeState::new(conn, local_nonce, now));
    }

    /// Tear down a peer's row, reversing its contribution to the global
    /// tallies. Returns whether the address manager should refresh the
    /// address's last-connected time.
    pub fn remove(&mut self, id: PeerId) -> bool {
        let state = match self.nodes.remove(&id) {
            Some(state) => state,
            None => return false,
        };
        if state.sync_started {
            self.sync_started -= 1;
        }
        for queued in &state.blocks_in_flight {
            self.in_flight.remove(&queued.hash);
        }
        self.preferred_download -= state.preferred_download as usize;
        self.with_validated_downloads -= (state.in_flight_valid_headers > 0) as usize;
        self.protected_outbound -= state.chain_sync.protect as usize;
        self.cmpct_announcers.retain(|p| *p != id);

        if self.nodes.is_empty() {
            debug_assert!(self.in_flight.is_empty());
            debug_assert_eq!(self.preferred_download, 0);
            debug_assert_eq!(self.with_validated_downloads, 0);
            debug_assert_eq!(self.protected_outbound, 0);
            debug_assert_eq!(self.sync_started, 0);
        }
        debug!("Cleared state for peer={}", id);

        state.misbehavior == 0 && state.currently_connected
    }

    /// Access a peer's row.
    pub fn get(&self, id: PeerId) -> Option<&NodeState> {
        self.nodes.get(&id)
    }

    /// Mutable access to a peer's row.
    pub fn get_mut(&mut self, id: PeerId) -> Option<&mut NodeState> {
        self.nodes.get_mut(&id)
    }

    /// Whether a peer is known.
    pub fn contains(&self, id: PeerId) -> bool {
        self.nodes.contains_key(&id)
    }

    /// All connected peer ids.
    pub fn ids(&self) -> Vec<PeerId> {
        self.nodes.keys().copied().collect()
    }

    /// Iterate over all rows.
    pub fn iter(&self) -> impl Iterator<Item = (&PeerId, &NodeState)> {
        self.nodes.iter()
    }

    /// Number of connected peers.
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Whether the table is empty.
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Number of peers eligible as primary download sources.
    pub fn preferred_download_count(&self) -> usize {
        self.preferred_download
    }

    /// Number of peers with validated-header downloads in flight.
    pub fn validated_downloads_count(&self) -> usize {
        self.with_validated_downloads
    }

    /// Number of protected outbound peers.
    pub fn protected_count(&self) -> usize {
        self.protected_outbound
    }

    /// Number of peers we are syncing headers from.
    pub fn sync_started_count(&self) -> usize {
        self.sync_started
    }

    /// Apply a misbehavior score to a peer. Returns `true` when this
    /// crossing latches the ban flag.
    pub fn misbehaving(&mut self, id: PeerId, score: u32) -> bool {
        if score == 0 {
            return false;
        }
        let threshold = self.ban_threshold;
        let state = match self.nodes.get_mut(&id) {
            Some(state) => state,
            None => return false,
        };
        let before = state.misbehavior;
        state.misbehavior += score;

        if state.misbehavior >= threshold && before < threshold {
            warn!(
                "{}: peer={} misbehaving ({} -> {}), ban threshold exceeded",
                state.name, id, before, state.misbehavior
            );
            state.should_ban = true;
            true
        } else {
            debug!(
                "{}: peer={} misbehaving ({} -> {})",
                state.name, id, before, state.misbehavior
            );
            false
        }
    }

    /// Recompute a peer's preferred-download eligibility from its
    /// connection and service flags.
    pub fn update_preferred_download(&mut self, id: PeerId) {
        if let Some(state) = self.nodes.get_mut(&id) {
            self.preferred_download -= state.preferred_download as usize;
            state.preferred_download = (state.link.is_outbound() || state.whitelisted)
                && !state.one_shot
                && !state.client;
            self.preferred_download += state.preferred_download as usize;
        }
    }

    /// Mark a peer as our headers-sync source.
    pub fn start_sync(&mut self, id: PeerId, timeout: LocalTime) {
        if let Some(state) = self.nodes.get_mut(&id) {
            if !state.sync_started {
                state.sync_started = true;
                state.headers_sync_timeout = Some(timeout);
                self.sync_started += 1;
            }
        }
    }

    /// Clear a peer's headers-sync role so another peer can be tried.
    pub fn reset_sync(&mut self, id: PeerId) {
        if let Some(state) = self.nodes.get_mut(&id) {
            if state.sync_started {
                state.sync_started = false;
                state.headers_sync_timeout = None;
                self.sync_started -= 1;
            }
        }
    }

    /// Protect an outbound peer from chain-sync eviction.
    pub fn protect(&mut self, id: PeerId) {
        if let Some(state) = self.nodes.get_mut(&id) {
            if !state.chain_sync.protect {
                state.chain_sync.protect = true;
                self.protected_outbound += 1;
            }
        }
    }

    /// The peer a block is in flight with, if any.
    pub fn in_flight_with(&self, hash: &BlockHash) -> Option<PeerId> {
        self.in_flight.get(hash).copied()
    }

    /// Total number of blocks in flight, across all peers.
    pub fn in_flight_total(&self) -> usize {
        self.in_flight.len()
    }

    /// Drop a block from the in-flight tables, on receipt, timeout, or
    /// hand-over to another peer. Returns whether we had requested it.
    pub fn mark_block_received(&mut self, hash: &BlockHash, now: LocalTime) -> bool {
        let id = match self.in_flight.remove(hash) {
            Some(id) => id,
            None => return false,
        };
        let state = self
            .nodes
            .get_mut(&id)
            .unwrap_or_else(|| panic!("in-flight peer {} is not known", id));
        let pos = state
            .blocks_in_flight
            .iter()
            .position(|q| &q.hash == hash)
            .unwrap_or_else(|| panic!("in-flight block {} missing from peer {}", hash, id));

        if state.blocks_in_flight[pos].validated_headers {
            state.in_flight_valid_headers -= 1;
            if state.in_flight_valid_headers == 0 {
                // Last validated download from this peer completed.
                self.with_validated_downloads -= 1;
            }
        }
        if pos == 0 {
            // First block of the queue arrived; the next one starts
            // downloading now.
            state.downloading_since = state.downloading_since.max(now);
        }
        state.blocks_in_flight.remove(pos);
        state.stalling_since = None;
        true
    }

    /// Queue a block download with a peer, evicting any in-flight record
    /// held by another peer. Idempotent for the same peer.
    pub fn mark_block_in_flight(
        &mut self,
        id: PeerId,
        hash: BlockHash,
        block: Option<BlockId>,
        now: LocalTime,
    ) -> Option<InFlight> {
        if self.in_flight.get(&hash) == Some(&id) {
            return Some(InFlight::AlreadyQueued);
        }
        // Make sure it's not listed with another peer already.
        self.mark_block_received(&hash, now);

        let state = self.nodes.get_mut(&id)?;
        let validated_headers = block.is_some();

        state.blocks_in_flight.push(QueuedBlock {
            hash,
            block,
            validated_headers,
            partial: None,
        });
        if state.blocks_in_flight.len() == 1 {
            // Starting a download batch from this peer.
            state.downloading_since = now;
        }
        if validated_headers {
            state.in_flight_valid_headers += 1;
            if state.in_flight_valid_headers == 1 {
                self.with_validated_downloads += 1;
            }
        }
        self.in_flight.insert(hash, id);

        Some(InFlight::Inserted)
    }

    /// Resolve a peer's last announced-but-unknown block, if our index
    /// has since learned about it.
    pub fn process_block_availability<T: Chain>(&mut self, id: PeerId, chain: &T) {
        let state = match self.nodes.get_mut(&id) {
            Some(state) => state,
            None => return,
        };
        if let Some(hash) = state.last_unknown_block {
            if let Some(entry) = chain.lookup(&hash) {
                if chain.work(entry) > ZERO_WORK {
                    if state
                        .best_known_block
                        .map_or(true, |best| chain.work(entry) >= chain.work(best))
                    {
                        state.best_known_block = Some(entry);
                    }
                    state.last_unknown_block = None;
                }
            }
        }
    }

    /// Track a block announcement from a peer.
    pub fn update_block_availability<T: Chain>(
        &mut self,
        id: PeerId,
        hash: BlockHash,
        chain: &T,
    ) {
        self.process_block_availability(id, chain);

        let state = match self.nodes.get_mut(&id) {
            Some(state) => state,
            None => return,
        };
        match chain.lookup(&hash) {
            Some(entry) if chain.work(entry) > ZERO_WORK => {
                // An actually better block was announced.
                if state
                    .best_known_block
                    .map_or(true, |best| chain.work(entry) >= chain.work(best))
                {
                    state.best_known_block = Some(entry);
                }
            }
            _ => {
                // An unknown block was announced; assume it's the best.
                state.last_unknown_block = Some(hash);
            }
        }
    }

    /// Whether, as far as we know, the peer already has this header.
    pub fn peer_has_header<T: Chain>(&self, state: &NodeState, id: BlockId, chain: &T) -> bool {
        let height = chain.height(id);

        if let Some(best) = state.best_known_block {
            if chain.ancestor(best, height) == Some(id) {
                return true;
            }
        }
        if let Some(sent) = state.best_header_sent {
            if chain.ancestor(sent, height) == Some(id) {
                return true;
            }
        }
        false
    }

    /// Record who delivered a block that is about to be validated.
    pub fn record_block_source(&mut self, hash: BlockHash, id: PeerId, punish: bool) {
        self.sources.insert(hash, (id, punish));
    }

    /// Who delivered the given block.
    pub fn block_source(&self, hash: &BlockHash) -> Option<(PeerId, bool)> {
        self.sources.get(hash).copied()
    }

    /// Forget a block's source once validation settled.
    pub fn clear_block_source(&mut self, hash: &BlockHash) {
        self.sources.remove(hash);
    }

    /// Rotate a peer into the bounded set of compact-block announcers.
    pub fn rotate_cmpct_announcer(&mut self, id: PeerId) -> Option<CmpctRotation> {
        let state = self.nodes.get(&id)?;

        // Never ask peers that can't give us the flavor we want.
        if !state.supports_desired_cmpct_version || !state.provides_header_and_ids {
            return None;
        }
        if self.cmpct_announcers.contains(&id) {
            self.cmpct_announcers.retain(|p| *p != id);
            self.cmpct_announcers.push_back(id);
            return Some(CmpctRotation::Refreshed);
        }
        let stop = if self.cmpct_announcers.len() >= MAX_CMPCT_ANNOUNCERS {
            self.cmpct_announcers.pop_front()
        } else {
            None
        };
        self.cmpct_announcers.push_back(id);

        Some(CmpctRotation::Announce { stop })
    }

    /// Record that our tip advanced.
    pub fn tip_updated(&mut self, now: LocalTime) {
        self.last_tip_update = Some(now);
    }

    /// When our tip last advanced.
    pub fn last_tip_update(&self) -> Option<LocalTime> {
        self.last_tip_update
    }

    /// Per-peer statistics.
    pub fn stats<T: Chain>(&self, id: PeerId, chain: &T) -> Option<NodeStateStats> {
        let state = self.nodes.get(&id)?;

        Some(NodeStateStats {
            misbehavior: state.misbehavior,
            sync_height: state.best_known_block.map(|b| chain.height(b)),
            common_height: state.last_common_block.map(|b| chain.height(b)),
            heights_in_flight: state
                .blocks_in_flight
                .iter()
                .filter_map(|q| q.block.map(|b| chain.height(b)))
                .collect(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bitcoin::hashes::Hash;

    fn conn(id: PeerId, link: Link) -> ConnectInfo {
        ConnectInfo {
            id,
            addr: ([88, 88, 88, 88], 8333).into(),
            local_addr: ([127, 0, 0, 1], 8333).into(),
            name: format!("peer-{}", id),
            link,
            whitelisted: false,
            manual: false,
            one_shot: false,
            feeler: false,
        }
    }

    fn hash(n: u8) -> BlockHash {
        BlockHash::from_slice(&[n; 32]).unwrap()
    }

    fn table() -> NodeStates {
        NodeStates::new(100, &fastrand::Rng::with_seed(1))
    }

    #[test]
    fn test_in_flight_accounting() {
        let mut nodes = table();
        let now = LocalTime::from_secs(1000);

        nodes.insert(&conn(1, Link::Outbound), 7, now);
        nodes.insert(&conn(2, Link::Outbound), 8, now);

        assert_eq!(
            nodes.mark_block_in_flight(1, hash(1), Some(BlockId(1)), now),
            Some(InFlight::Inserted)
        );
        assert_eq!(
            nodes.mark_block_in_flight(1, hash(1), Some(BlockId(1)), now),
            Some(InFlight::AlreadyQueued),
            "re-requesting from the same peer does not double-count"
        );
        assert_eq!(nodes.in_flight_total(), 1);
        assert_eq!(nodes.get(1).unwrap().in_flight_count(), 1);
        assert_eq!(nodes.validated_downloads_count(), 1);

        // A second peer taking over the block evicts the first record.
        nodes.mark_block_in_flight(2, hash(1), Some(BlockId(1)), now);
        assert_eq!(nodes.in_flight_with(&hash(1)), Some(2));
        assert_eq!(nodes.get(1).unwrap().in_flight_count(), 0);
        assert_eq!(nodes.validated_downloads_count(), 1);

        assert!(nodes.mark_block_received(&hash(1), now));
        assert!(!nodes.mark_block_received(&hash(1), now));
        assert_eq!(nodes.in_flight_total(), 0);
        assert_eq!(nodes.validated_downloads_count(), 0);
    }

    #[test]
    fn test_remove_clears_in_flight() {
        let mut nodes = table();
        let now = LocalTime::from_secs(1000);

        nodes.insert(&conn(1, Link::Outbound), 7, now);
        for n in 0..4 {
            nodes.mark_block_in_flight(1, hash(n), Some(BlockId(n as u32)), now);
        }
        assert_eq!(nodes.in_flight_total(), 4);

        nodes.remove(1);
        assert_eq!(nodes.in_flight_total(), 0);
        assert_eq!(nodes.validated_downloads_count(), 0);
    }

    #[test]
    fn test_counters_match_rows() {
        let mut nodes = table();
        let now = LocalTime::default();

        for id in 0..5 {
            let mut c = conn(id, Link::Outbound);
            c.whitelisted = id % 2 == 0;
            nodes.insert(&c, id, now);
            if let Some(s) = nodes.get_mut(id) {
                s.client = false;
            }
            nodes.update_preferred_download(id);
        }
        nodes.start_sync(3, now);
        nodes.protect(4);

        let preferred = nodes.iter().filter(|(_, s)| s.preferred_download).count();
        let syncing = nodes.iter().filter(|(_, s)| s.sync_started).count();
        let protected = nodes.iter().filter(|(_, s)| s.chain_sync.protect).count();

        assert_eq!(nodes.preferred_download_count(), preferred);
        assert_eq!(nodes.sync_started_count(), syncing);
        assert_eq!(nodes.protected_count(), protected);

        for id in 0..5 {
            nodes.remove(id);
        }
        assert!(nodes.is_empty());
    }

    #[test]
    fn test_misbehaving_latches_once() {
        let mut nodes = table();
        nodes.insert(&conn(1, Link::Inbound), 0, LocalTime::default());

        assert!(!nodes.misbehaving(1, 50));
        assert!(nodes.misbehaving(1, 50), "threshold crossing latches");
        assert!(!nodes.misbehaving(1, 50), "only the crossing reports");
        assert!(nodes.get(1).unwrap().should_ban);
        assert_eq!(nodes.get(1).unwrap().misbehavior, 150);
    }

    #[test]
    fn test_cmpct_announcer_rotation() {
        let mut nodes = table();
        let now = LocalTime::default();

        for id in 1..=4 {
            nodes.insert(&conn(id, Link::Outbound), id, now);
            let s = nodes.get_mut(id).unwrap();
            s.supports_desired_cmpct_version = true;
            s.provides_header_and_ids = true;
        }

        assert_eq!(
            nodes.rotate_cmpct_announcer(1),
            Some(CmpctRotation::Announce { stop: None })
        );
        assert_eq!(
            nodes.rotate_cmpct_announcer(1),
            Some(CmpctRotation::Refreshed)
        );
        nodes.rotate_cmpct_announcer(2);
        nodes.rotate_cmpct_announcer(3);
        assert_eq!(
            nodes.rotate_cmpct_announcer(4),
            Some(CmpctRotation::Announce { stop: Some(1) }),
            "a fourth announcer displaces the oldest"
        );
    }
}
