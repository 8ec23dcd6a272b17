//! Block download scheduling.
//!
//! Keeps up to [`MAX_BLOCKS_IN_TRANSIT_PER_PEER`] requests open per
//! peer, sliding a [`BLOCK_DOWNLOAD_WINDOW`]-block window along each
//! peer's best chain, and polices peers that hold the window up.
use log::*;

use galena_common::block::time::{LocalDuration, LocalTime};
use galena_common::chain::{BlockId, Chain, ValidationLevel};
use galena_common::p2p::PeerId;

use super::nodestate::NodeStates;
use super::output::SyncHeaders;
use super::{
    block_inv, DisconnectReason, BLOCK_DOWNLOAD_TIMEOUT_BASE, BLOCK_DOWNLOAD_TIMEOUT_PER_PEER,
    BLOCK_DOWNLOAD_WINDOW, BLOCK_STALLING_TIMEOUT, MAX_BLOCKS_IN_TRANSIT_PER_PEER,
};

/// Schedules block downloads across peers.
#[derive(Debug)]
pub struct BlockManager<U> {
    /// Consensus target spacing, in seconds. Scales download timeouts.
    target_spacing: u64,
    upstream: U,
}

impl<U: SyncHeaders> BlockManager<U> {
    /// Create a new block download manager.
    pub fn new(target_spacing: u64, upstream: U) -> Self {
        Self {
            target_spacing,
            upstream,
        }
    }

    /// Advance the peer's last-common-block and collect up to `count`
    /// of its successors that we still need and that nobody is
    /// downloading. Also reports the peer the window is blocked on, if
    /// nothing could be scheduled for that reason alone.
    pub fn find_next_blocks<T: Chain>(
        &self,
        nodes: &mut NodeStates,
        id: PeerId,
        count: usize,
        chain: &T,
    ) -> (Vec<BlockId>, Option<PeerId>) {
        let mut blocks = Vec::new();
        let mut staller = None;

        if count == 0 {
            return (blocks, staller);
        }
        nodes.process_block_availability(id, chain);

        let (best, have_witness, last_common) = match nodes.get(id) {
            Some(state) => match state.best_known_block {
                Some(best) => (best, state.have_witness, state.last_common_block),
                // This peer has nothing interesting.
                None => return (blocks, staller),
            },
            None => return (blocks, staller),
        };
        if chain.work(best) < chain.work(chain.tip()) || chain.work(best) < chain.min_chain_work()
        {
            // This peer has nothing interesting.
            return (blocks, staller);
        }

        let mut last_common = match last_common {
            Some(entry) => entry,
            None => {
                // Bootstrap by guessing the fork point near the lower of
                // the two tips. Guessing wrong either way is harmless.
                match chain.at(chain.height(best).min(chain.tip_height())) {
                    Some(entry) => entry,
                    None => return (blocks, staller),
                }
            }
        };
        // If the peer reorganized, our previous last-common-block may no
        // longer be an ancestor of its tip.
        last_common = chain.last_common_ancestor(last_common, best);

        if last_common == best {
            if let Some(state) = nodes.get_mut(id) {
                state.last_common_block = Some(last_common);
            }
            return (blocks, staller);
        }

        // Never fetch past the peer's tip, nor more than a window past
        // the last linked block we share. The extra +1 block lets us
        // detect stalling: the block we could fetch if the window were
        // one larger.
        let window_end = chain.height(last_common) + BLOCK_DOWNLOAD_WINDOW;
        let max_height = chain.height(best).min(window_end + 1);
        let mut waiting_for: Option<PeerId> = None;
        let mut walk = last_common;

        'walk: while chain.height(walk) < max_height {
            // Read successors in batches of at least 128, since an
            // ancestor lookup costs about as much as walking that many
            // entries.
            let remaining = (max_height - chain.height(walk)) as usize;
            let to_fetch = remaining.min((count - blocks.len()).max(128));

            let target = match chain.ancestor(best, chain.height(walk) + to_fetch as u64) {
                Some(entry) => entry,
                None => break,
            };
            let mut batch = vec![target];
            let mut cursor = target;

            for _ in 1..to_fetch {
                match chain.prev(cursor) {
                    Some(prev) => {
                        batch.push(prev);
                        cursor = prev;
                    }
                    None => break,
                }
            }
            batch.reverse();
            walk = target;

            for candidate in batch {
                if !chain.is_valid(candidate, ValidationLevel::Tree) {
                    // The chain this peer is on is invalid.
                    break 'walk;
                }
                if !have_witness && chain.witness_enabled(chain.prev(candidate)) {
                    // We wouldn't download this block or its descendants
                    // from this peer.
                    break 'walk;
                }
                if chain.has_data(candidate) || chain.in_active(candidate) {
                    if chain.has_txns(candidate) {
                        last_common = candidate;
                    }
                } else if let Some(holder) = nodes.in_flight_with(&chain.hash(candidate)) {
                    if waiting_for.is_none() {
                        // First already-in-flight block.
                        waiting_for = Some(holder);
                    }
                } else {
                    if chain.height(candidate) > window_end {
                        // End of the window.
                        if blocks.is_empty() && waiting_for != Some(id) {
                            // We can't fetch anything, but could if the
                            // window were one larger.
                            staller = waiting_for;
                        }
                        break 'walk;
                    }
                    blocks.push(candidate);
                    if blocks.len() == count {
                        break 'walk;
                    }
                }
            }
        }
        if let Some(state) = nodes.get_mut(id) {
            state.last_common_block = Some(last_common);
        }
        (blocks, staller)
    }

    /// Fill the peer's in-flight quota with `getdata` requests. Called
    /// on each send tick.
    pub fn request_blocks<T: Chain>(
        &self,
        nodes: &mut NodeStates,
        id: PeerId,
        chain: &T,
        our_witness: bool,
        now: LocalTime,
    ) {
        let (client, one_shot, preferred, in_flight, have_witness) = match nodes.get(id) {
            Some(state) => (
                state.client,
                state.one_shot,
                state.preferred_download,
                state.in_flight_count(),
                state.have_witness,
            ),
            None => return,
        };
        if client {
            return;
        }
        // Download from this peer if it's a nice peer, or if we have no
        // nice peers and this one might do.
        let fetch = preferred || (nodes.preferred_download_count() == 0 && !one_shot);

        if !fetch && chain.is_initial_block_download() {
            return;
        }
        if in_flight >= MAX_BLOCKS_IN_TRANSIT_PER_PEER {
            return;
        }

        let (blocks, staller) =
            self.find_next_blocks(nodes, id, MAX_BLOCKS_IN_TRANSIT_PER_PEER - in_flight, chain);
        let witness = our_witness && have_witness;
        let mut invs = Vec::with_capacity(blocks.len());

        for entry in blocks {
            let hash = chain.hash(entry);

            nodes.mark_block_in_flight(id, hash, Some(entry), now);
            debug!(
                "Requesting block {} ({}) peer={}",
                hash,
                chain.height(entry),
                id
            );
            invs.push(block_inv(hash, witness));
        }
        if !invs.is_empty() {
            self.upstream.get_data(id, invs);
        }

        if nodes.get(id).map_or(0, |s| s.in_flight_count()) == 0 {
            if let Some(staller) = staller {
                if let Some(state) = nodes.get_mut(staller) {
                    if state.stalling_since.is_none() {
                        state.stalling_since = Some(now);
                        debug!("Stall started peer={}", staller);
                    }
                }
            }
        }
    }

    /// Check the window-stall and per-block download timeouts for a
    /// peer. Called once per peer per send tick.
    pub fn check_timeouts(
        &self,
        nodes: &NodeStates,
        id: PeerId,
        now: LocalTime,
    ) -> Option<DisconnectReason> {
        let state = nodes.get(id)?;

        if let Some(since) = state.stalling_since {
            // Stalling only triggers when the download window cannot
            // move, which in steady state shouldn't happen outside
            // initial block download.
            if now > since + BLOCK_STALLING_TIMEOUT {
                warn!("Peer={} is stalling block download, disconnecting", id);
                return Some(DisconnectReason::StallingBlockDownload);
            }
        }
        if let Some(first) = state.blocks_in_flight.first() {
            // Compensate for peers we're downloading validated blocks
            // from, so a saturated downstream link doesn't get peers
            // killed. Only validated in-flight blocks count, so a peer
            // can't inflate our timeout with made-up hashes.
            let others =
                nodes.validated_downloads_count() - (state.in_flight_valid_headers > 0) as usize;
            let timeout = LocalDuration::from_micros(
                self.target_spacing
                    * (BLOCK_DOWNLOAD_TIMEOUT_BASE
                        + BLOCK_DOWNLOAD_TIMEOUT_PER_PEER * others as u64),
            );
            if now > state.downloading_since + timeout {
                warn!(
                    "Timeout downloading block {} from peer={}, disconnecting",
                    first.hash, id
                );
                return Some(DisconnectReason::BlockDownloadTimeout);
            }
        }
        None
    }
}
