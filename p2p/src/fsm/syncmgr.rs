//! Headers-first synchronization.
//!
//! Chooses a sync peer and walks the header chain ahead of block
//! download, fetches recent blocks directly when we are close to the
//! network tip, and polices peers whose chains never catch up to ours.
use std::fmt;

use bitcoin::hashes::Hash as _;
use bitcoin::network::message_blockdata::Inventory;
use bitcoin::BlockHeader;
use log::*;

use galena_common::block::time::{LocalDuration, LocalTime};
use galena_common::block::{BlockHash, BlockTime};
use galena_common::chain::{BlockId, Chain, ValidationLevel};
use galena_common::p2p::PeerId;

use super::nodestate::NodeStates;
use super::output::SyncHeaders;
use super::{
    block_inv, DisconnectReason, CHAIN_SYNC_TIMEOUT, HEADERS_DOWNLOAD_TIMEOUT_BASE,
    HEADERS_DOWNLOAD_TIMEOUT_PER_HEADER, HEADERS_RESPONSE_TIME, MAX_BLOCKS_IN_TRANSIT_PER_PEER,
    MAX_BLOCKS_TO_ANNOUNCE, MAX_HEADERS_RESULTS, MAX_UNCONNECTING_HEADERS,
};

/// How many target spacings from the present our tip must be for blocks
/// to be fetched straight from header announcements.
const DIRECT_FETCH_SPACINGS: u64 = 20;
/// How long before the present a best header counts as caught up.
const RECENT_HEADER_WINDOW: BlockTime = 24 * 60 * 60;

/// An event originating in the sync manager.
#[derive(Debug, Clone)]
pub enum Event {
    /// Headers sync started with a peer.
    Syncing(PeerId),
    /// A batch of headers was accepted.
    HeadersReceived(PeerId, usize),
    /// A peer sent headers that failed validation.
    InvalidHeadersReceived(PeerId, &'static str),
    /// An outbound peer was protected from chain-sync eviction.
    PeerProtected(PeerId),
}

impl fmt::Display for Event {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Event::Syncing(peer) => write!(fmt, "Syncing headers with peer {}", peer),
            Event::HeadersReceived(peer, count) => {
                write!(fmt, "{}: Received {} header(s)", peer, count)
            }
            Event::InvalidHeadersReceived(peer, reason) => {
                write!(fmt, "{}: Received invalid headers: {}", peer, reason)
            }
            Event::PeerProtected(peer) => {
                write!(fmt, "Protecting outbound peer {} from eviction", peer)
            }
        }
    }
}

/// Drives headers-first sync.
#[derive(Debug)]
pub struct SyncManager<U> {
    /// Consensus target spacing, in seconds.
    target_spacing: u64,
    upstream: U,
}

impl<U: SyncHeaders> SyncManager<U> {
    /// Create a new sync manager.
    pub fn new(target_spacing: u64, upstream: U) -> Self {
        Self {
            target_spacing,
            upstream,
        }
    }

    /// Whether our tip is recent enough to fetch announced blocks
    /// without waiting for the download scheduler.
    pub fn can_direct_fetch<T: Chain>(&self, chain: &T, adjusted_time: BlockTime) -> bool {
        chain.time(chain.tip())
            > adjusted_time.saturating_sub((self.target_spacing * DIRECT_FETCH_SPACINGS) as u32)
    }

    /// Consider starting headers sync with this peer. Only one peer is
    /// actively synced from at a time, unless our best header is close
    /// to the present.
    pub fn maybe_start_sync<T: Chain>(
        &mut self,
        nodes: &mut NodeStates,
        id: PeerId,
        chain: &T,
        now: LocalTime,
        adjusted_time: BlockTime,
    ) {
        if chain.is_importing() || chain.is_reindexing() {
            return;
        }
        let (sync_started, client, one_shot, preferred, starting_height) = match nodes.get(id) {
            Some(s) => (
                s.sync_started,
                s.client,
                s.one_shot,
                s.preferred_download,
                s.starting_height,
            ),
            None => return,
        };
        if sync_started || client {
            return;
        }
        let fetch = preferred || (nodes.preferred_download_count() == 0 && !one_shot);
        let best_header = chain.best_header();
        let best_time = chain.time(best_header);

        if (nodes.sync_started_count() == 0 && fetch)
            || best_time > adjusted_time.saturating_sub(RECENT_HEADER_WINDOW)
        {
            let behind = adjusted_time.saturating_sub(best_time) as u64;
            let timeout = now
                + HEADERS_DOWNLOAD_TIMEOUT_BASE
                + HEADERS_DOWNLOAD_TIMEOUT_PER_HEADER * (behind / self.target_spacing);

            nodes.start_sync(id, timeout);

            // Start at the parent of the best header, so an up-to-date
            // peer answers with a non-empty batch and we learn its best
            // block.
            let start = chain.prev(best_header).unwrap_or(best_header);

            debug!(
                "initial getheaders ({}) to peer={} (startheight:{})",
                chain.height(start),
                id,
                starting_height
            );
            self.upstream
                .get_headers(id, (chain.locator(start), BlockHash::all_zeros()));
            self.upstream.event(Event::Syncing(id));
        }
    }

    /// Process a `headers` batch from a peer. `punish_duplicate_invalid`
    /// is set when the headers arrived over a path that promises an
    /// honest active chain.
    pub fn received_headers<T: Chain>(
        &mut self,
        nodes: &mut NodeStates,
        id: PeerId,
        headers: &[BlockHeader],
        chain: &mut T,
        our_witness: bool,
        punish_duplicate_invalid: bool,
        now: LocalTime,
        adjusted_time: BlockTime,
    ) -> Option<DisconnectReason> {
        let count = headers.len();

        if count == 0 {
            // Nothing interesting; stop asking this peer for more.
            return None;
        }

        // A short batch whose parent we lack is treated as an
        // announcement across a gap: try to connect the chain with a
        // getheaders, and score the peer if it keeps happening.
        if chain.lookup(&headers[0].prev_blockhash).is_none() && count < MAX_BLOCKS_TO_ANNOUNCE {
            let streak = {
                let state = nodes.get_mut(id)?;
                state.unconnecting_headers += 1;
                state.unconnecting_headers
            };
            self.upstream
                .get_headers(id, (chain.locator(chain.best_header()), BlockHash::all_zeros()));
            debug!(
                "received header {}: missing prev block {}, sending getheaders (peer={}, unconnecting={})",
                headers[0].block_hash(),
                headers[0].prev_blockhash,
                id,
                streak
            );
            // Remember the announcement, so once the gap closes, even
            // through another peer, this one counts as a source.
            nodes.update_block_availability(id, headers[count - 1].block_hash(), chain);

            if streak % MAX_UNCONNECTING_HEADERS == 0 {
                nodes.misbehaving(id, 20);
            }
            return None;
        }

        let mut last_hash: Option<BlockHash> = None;
        for header in headers {
            if let Some(prev) = last_hash {
                if header.prev_blockhash != prev {
                    nodes.misbehaving(id, 20);
                    self.upstream
                        .event(Event::InvalidHeadersReceived(id, "non-continuous headers"));
                    return None;
                }
            }
            last_hash = Some(header.block_hash());
        }
        let last_hash = last_hash.expect("the batch is non-empty");

        // If we don't have the last header, the batch contains something
        // new to us.
        let received_new = chain.lookup(&last_hash).is_none();

        let last = match chain.accept_headers(headers) {
            Ok(entry) => entry,
            Err(err) => {
                if err.dos > 0 {
                    nodes.misbehaving(id, err.dos);
                }
                self.upstream
                    .event(Event::InvalidHeadersReceived(id, err.reason));

                // A peer announcing a block we know to be invalid as part
                // of its active chain is on an incompatible chain: don't
                // let it hold an outbound slot. Headers that never made
                // it into our index get a pass, since they may merely be
                // too far in the future.
                if punish_duplicate_invalid
                    && err
                        .first_invalid
                        .map_or(false, |hash| chain.lookup(&hash).is_some())
                {
                    return Some(DisconnectReason::InvalidChain);
                }
                return None;
            }
        };

        if let Some(state) = nodes.get_mut(id) {
            if state.unconnecting_headers > 0 {
                debug!(
                    "peer={}: resetting unconnecting-headers ({} -> 0)",
                    id, state.unconnecting_headers
                );
            }
            state.unconnecting_headers = 0;
        }
        nodes.update_block_availability(id, chain.hash(last), chain);
        self.upstream.event(Event::HeadersReceived(id, count));

        if received_new && chain.work(last) > chain.work(chain.tip()) {
            if let Some(state) = nodes.get_mut(id) {
                state.last_block_announcement = Some(now);
            }
        }

        if count == MAX_HEADERS_RESULTS {
            // A maximum-size batch; the peer likely has more.
            debug!(
                "more getheaders ({}) to end to peer={}",
                chain.height(last),
                id
            );
            self.upstream
                .get_headers(id, (chain.locator(last), BlockHash::all_zeros()));
        }

        // If this batch is valid and ends in a block at least as good as
        // our tip, and we're near the present, fetch the blocks now.
        if self.can_direct_fetch(chain, adjusted_time)
            && chain.is_valid(last, ValidationLevel::Tree)
            && chain.work(chain.tip()) <= chain.work(last)
        {
            self.direct_fetch(nodes, id, last, chain, our_witness, now);
        }

        // During initial download, a peer that has no more headers and
        // whose chain carries too little work can't help us sync; free
        // the outbound slot.
        if chain.is_initial_block_download() && count != MAX_HEADERS_RESULTS {
            let state = nodes.get(id)?;
            let weak_chain = state
                .best_known_block
                .map_or(false, |best| chain.work(best) < chain.min_chain_work());

            if weak_chain && state.is_outbound_disconnect_candidate() {
                debug!(
                    "Disconnecting outbound peer {} -- headers chain has insufficient work",
                    id
                );
                return Some(DisconnectReason::InsufficientWork);
            }
        }

        // Protect a limited number of outbound peers that demonstrate
        // tip-level work from the chain-sync eviction logic.
        let (candidate, protected, best) = {
            let state = nodes.get(id)?;
            (
                state.is_outbound_disconnect_candidate(),
                state.chain_sync.protect,
                state.best_known_block,
            )
        };
        if candidate && !protected {
            if let Some(best) = best {
                if nodes.protected_count() < super::MAX_OUTBOUND_PEERS_TO_PROTECT_FROM_DISCONNECT
                    && chain.work(best) >= chain.work(chain.tip())
                {
                    nodes.protect(id);
                    self.upstream.event(Event::PeerProtected(id));
                }
            }
        }
        None
    }

    /// Request the blocks leading up to a freshly learned header,
    /// oldest first, up to the in-flight limit. A single block with a
    /// fully validated parent is upgraded to a compact-block request.
    fn direct_fetch<T: Chain>(
        &mut self,
        nodes: &mut NodeStates,
        id: PeerId,
        last: BlockId,
        chain: &T,
        our_witness: bool,
        now: LocalTime,
    ) {
        let (have_witness, supports_cmpct) = match nodes.get(id) {
            Some(s) => (s.have_witness, s.supports_desired_cmpct_version),
            None => return,
        };
        let mut to_fetch = Vec::new();
        let mut walk = Some(last);

        // Collect everything needed to switch to the announced tip, up
        // to a limit.
        while let Some(entry) = walk {
            if chain.in_active(entry) || to_fetch.len() > MAX_BLOCKS_IN_TRANSIT_PER_PEER {
                break;
            }
            if !chain.has_data(entry)
                && nodes.in_flight_with(&chain.hash(entry)).is_none()
                && (!chain.witness_enabled(chain.prev(entry)) || have_witness)
            {
                to_fetch.push(entry);
            }
            walk = chain.prev(entry);
        }
        // If the walk did not land on our active chain, this is a very
        // large reorg at a time we believed ourselves near the tip;
        // leave it to the parallel download scheduler.
        match walk {
            Some(entry) if chain.in_active(entry) => {}
            _ => {
                debug!(
                    "Large reorg, won't direct fetch to {} ({})",
                    chain.hash(last),
                    chain.height(last)
                );
                return;
            }
        }

        let witness = our_witness && have_witness;
        let mut invs = Vec::new();

        // Download from earliest to latest.
        for entry in to_fetch.into_iter().rev() {
            if nodes.get(id).map_or(0, |s| s.in_flight_count()) >= MAX_BLOCKS_IN_TRANSIT_PER_PEER
            {
                // Can't fetch anything more from this peer.
                break;
            }
            let hash = chain.hash(entry);

            nodes.mark_block_in_flight(id, hash, Some(entry), now);
            debug!("Requesting block {} from peer={}", hash, id);
            invs.push(block_inv(hash, witness));
        }
        if invs.len() > 1 {
            debug!(
                "Downloading blocks toward {} ({}) via headers direct fetch",
                chain.hash(last),
                chain.height(last)
            );
        }
        if let Some(first) = invs.first() {
            let sole_request = invs.len() == 1 && nodes.in_flight_total() == 1;
            let parent_valid = chain
                .prev(last)
                .map_or(false, |p| chain.is_valid(p, ValidationLevel::Chain));

            if sole_request && parent_valid && supports_cmpct {
                // Fetch the lone block in compact form.
                if let Inventory::Block(hash) | Inventory::WitnessBlock(hash) = first {
                    invs = vec![Inventory::CompactBlock(*hash)];
                }
            }
            self.upstream.get_data(id, invs);
        }
    }

    /// Handle a block announced via `inv`: note availability, and ask
    /// for the headers leading up to it instead of the block itself,
    /// since an inv fallback usually means a gap or a reorg.
    pub fn received_block_inv<T: Chain>(
        &mut self,
        nodes: &mut NodeStates,
        id: PeerId,
        hash: BlockHash,
        chain: &T,
    ) {
        nodes.update_block_availability(id, hash, chain);

        if chain.lookup(&hash).is_some() {
            return;
        }
        if chain.is_importing() || chain.is_reindexing() {
            return;
        }
        if nodes.in_flight_with(&hash).is_some() {
            return;
        }
        debug!(
            "getheaders ({}) {} to peer={}",
            chain.height(chain.best_header()),
            hash,
            id
        );
        self.upstream
            .get_headers(id, (chain.locator(chain.best_header()), hash));
    }

    /// Check the initial headers-sync deadline. Called on each send
    /// tick.
    pub fn check_headers_timeout<T: Chain>(
        &mut self,
        nodes: &mut NodeStates,
        id: PeerId,
        chain: &T,
        now: LocalTime,
        adjusted_time: BlockTime,
    ) -> Option<DisconnectReason> {
        let state = nodes.get(id)?;
        let deadline = match (state.sync_started, state.headers_sync_timeout) {
            (true, Some(deadline)) => deadline,
            _ => return None,
        };
        if chain.time(chain.best_header()) > adjusted_time.saturating_sub(RECENT_HEADER_WINDOW) {
            // Once caught up, disarm the check for this peer.
            if let Some(state) = nodes.get_mut(id) {
                state.headers_sync_timeout = None;
            }
            return None;
        }
        if now > deadline
            && nodes.sync_started_count() == 1
            && nodes.preferred_download_count() - state.preferred_download as usize >= 1
        {
            // Our lone sync peer is stalling and we have alternatives.
            // Note that if all our peers are inbound we keep waiting; we
            // have bigger problems than a slow sync peer then.
            if !state.whitelisted {
                warn!("Timeout downloading headers from peer={}, disconnecting", id);
                return Some(DisconnectReason::HeadersSyncTimeout);
            }
            debug!(
                "Timeout downloading headers from whitelisted peer={}, not disconnecting",
                id
            );
            // Give another peer a chance at being the sync peer.
            nodes.reset_sync(id);
        }
        None
    }

    /// Enforce the chain-sync work deadline on outbound peers. Called on
    /// each send tick.
    pub fn consider_eviction<T: Chain>(
        &mut self,
        nodes: &mut NodeStates,
        id: PeerId,
        chain: &T,
        now: LocalTime,
    ) -> Option<DisconnectReason> {
        let tip = chain.tip();
        let tip_work = chain.work(tip);
        let state = nodes.get_mut(id)?;

        if state.chain_sync.protect
            || !state.is_outbound_disconnect_candidate()
            || !state.sync_started
        {
            return None;
        }

        let best_work = state.best_known_block.map(|b| chain.work(b));

        if best_work.map_or(false, |work| work >= tip_work) {
            // The peer proved its chain; clear any pending deadline.
            if state.chain_sync.timeout.is_some() {
                state.chain_sync.timeout = None;
                state.chain_sync.work_header = None;
                state.chain_sync.sent_getheaders = false;
            }
        } else if state.chain_sync.timeout.is_none()
            || (state.chain_sync.work_header.map_or(false, |wh| {
                best_work.map_or(false, |work| work >= chain.work(wh))
            }))
        {
            // The peer is behind our tip, either noticed just now or
            // after catching up to the previous benchmark; (re)arm the
            // deadline against the current tip.
            state.chain_sync.timeout = Some(now + CHAIN_SYNC_TIMEOUT);
            state.chain_sync.work_header = Some(tip);
            state.chain_sync.sent_getheaders = false;
        } else if state.chain_sync.timeout.map_or(false, |t| now > t) {
            if state.chain_sync.sent_getheaders {
                // They've run out of time to catch up.
                warn!(
                    "Disconnecting outbound peer {} for old chain, best known block = {}",
                    id,
                    state
                        .best_known_block
                        .map(|b| chain.hash(b).to_string())
                        .unwrap_or_else(|| "<none>".to_owned())
                );
                return Some(DisconnectReason::ChainSyncTimeout);
            }
            let work_header = state.chain_sync.work_header?;

            debug!(
                "sending getheaders to outbound peer={} to verify chain work (benchmark {})",
                id,
                chain.hash(work_header)
            );
            state.chain_sync.sent_getheaders = true;
            // Allow time for a response that could clear or reset the
            // deadline before disconnecting.
            state.chain_sync.timeout = Some(now + HEADERS_RESPONSE_TIME);

            let start = chain.prev(work_header).unwrap_or(work_header);
            self.upstream
                .get_headers(id, (chain.locator(start), BlockHash::all_zeros()));
        }
        None
    }
}
