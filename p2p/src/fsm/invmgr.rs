//! Inventory relay.
//!
//! Owns the per-peer relay state: queued block announcements and the
//! headers / compact-block / inv announcement decision, transaction
//! inventory trickling, scheduled `getdata` requests, the peer's bloom
//! filter, fee filters, and the serving side of `getdata`.
use bitcoin::network::message_blockdata::Inventory;
use bitcoin::network::message_bloom::FilterLoad;
use bitcoin::util::merkleblock::MerkleBlock;
use bitcoin::{Transaction, Txid};
use log::*;

use galena_common::block::time::{poisson_next_send, LocalDuration, LocalTime};
use galena_common::block::BlockHash;
use galena_common::bloom::{BloomFilter, MAX_SCRIPT_ELEMENT_SIZE};
use galena_common::chain::Chain;
use galena_common::collections::{HashMap, RollingSet};
use galena_common::mempool::Mempool;
use galena_common::p2p::{Interrupt, Link, PeerId};

use super::cmpct;
use super::nodestate::NodeStates;
use super::output::Inventories;
use super::{
    AVG_FEEFILTER_BROADCAST_INTERVAL, INVENTORY_BROADCAST_INTERVAL, INVENTORY_BROADCAST_MAX,
    MAX_BLOCKS_TO_ANNOUNCE, MAX_CMPCTBLOCK_DEPTH, MAX_FEEFILTER_CHANGE_DELAY, MAX_GETDATA_BATCH,
    MAX_INV_SZ,
};

/// Maximum value of a fee filter, in satoshis.
const MAX_MONEY: u64 = 21_000_000 * 100_000_000;
/// Bound on remembered transaction inventories per peer.
const MAX_INV_KNOWN: usize = 50_000;
/// Bound on scheduled transaction requests per peer.
const MAX_ASK_FOR: usize = 50_000;
/// Minimum spacing between requests for the same transaction, giving
/// the first peer a chance to answer before we ask another.
const GETDATA_TX_INTERVAL: LocalDuration = LocalDuration::from_mins(2);
/// Average interval between rebroadcasts of our own transactions.
const AVG_REBROADCAST_INTERVAL: LocalDuration = LocalDuration::from_mins(30);

/// Rounds fee rates to a sparse set of bucket boundaries, with a little
/// randomness, so the exact mempool floor is not leaked.
#[derive(Debug)]
pub struct FeeFilterRounder {
    buckets: Vec<u64>,
    rng: fastrand::Rng,
}

impl FeeFilterRounder {
    const SPACING: f64 = 1.1;

    /// Create a rounder anchored at half the given fee rate.
    pub fn new(min_fee: u64, rng: fastrand::Rng) -> Self {
        let mut buckets = vec![0];
        let mut boundary = (min_fee as f64 / 2.0).max(1.0);

        while boundary <= MAX_MONEY as f64 {
            buckets.push(boundary as u64);
            boundary *= Self::SPACING;
        }
        Self { buckets, rng }
    }

    /// Quantize a fee rate.
    pub fn round(&self, fee: u64) -> u64 {
        let mut pos = self.buckets.partition_point(|b| *b < fee);

        if (pos > 0 && self.rng.u32(..3) != 0) || pos == self.buckets.len() {
            pos -= 1;
        }
        self.buckets[pos]
    }
}

#[derive(Debug)]
struct Peer {
    link: Link,
    whitelisted: bool,
    version: u32,
    /// Whether the peer asked for transaction relay in its `version`.
    relay_txes: bool,

    /// Block hashes to consider announcing, oldest first.
    announce_blocks: Vec<BlockHash>,
    /// Block inventories to flush.
    inv_blocks: Vec<BlockHash>,
    /// Transaction hashes queued for the trickle.
    tx_to_send: Vec<Txid>,
    /// Transaction inventories the peer is known to have.
    known: RollingSet<Txid>,
    /// Scheduled `getdata` requests.
    ask_for: Vec<(LocalTime, Inventory)>,
    ask_set: RollingSet<Txid>,
    /// Pending `getdata` entries to serve.
    recv_getdata: Vec<Inventory>,
    /// Serving a `getblocks` follow-up: inv the tip after this block.
    hash_continue: Option<BlockHash>,

    /// The peer asked for our whole mempool (BIP 35).
    send_mempool: bool,
    last_mempool_req: Option<LocalTime>,
    next_inv_send: LocalTime,

    /// The peer's bloom filter, once installed.
    bloom: Option<BloomFilter>,

    /// Fee floor the peer asked of us.
    fee_filter_received: u64,
    /// The last fee filter we told the peer.
    fee_filter_sent: u64,
    next_fee_filter_send: Option<LocalTime>,
}

/// Manages inventory relay and serving.
#[derive(Debug)]
pub struct InventoryManager<U> {
    peers: HashMap<PeerId, Peer>,
    /// When each transaction was last requested from anyone.
    requested: HashMap<Txid, LocalTime>,
    /// Our own unconfirmed transactions, kept for rebroadcast.
    submitted: HashMap<Txid, Transaction>,
    next_rebroadcast: Option<LocalTime>,
    fee_rounder: FeeFilterRounder,
    rng: fastrand::Rng,
    upstream: U,
}

impl<U: Inventories> InventoryManager<U> {
    /// Create a new inventory manager.
    pub fn new(min_relay_fee: u64, rng: fastrand::Rng, upstream: U) -> Self {
        Self {
            peers: HashMap::with_hasher(rng.clone().into()),
            requested: HashMap::with_hasher(rng.clone().into()),
            submitted: HashMap::with_hasher(rng.clone().into()),
            next_rebroadcast: None,
            fee_rounder: FeeFilterRounder::new(min_relay_fee, rng.clone()),
            rng,
            upstream,
        }
    }

    /// Called when a connection is established.
    pub fn peer_connected(&mut self, id: PeerId, link: Link, whitelisted: bool, now: LocalTime) {
        self.peers.insert(
            id,
            Peer {
                link,
                whitelisted,
                version: 0,
                relay_txes: true,
                announce_blocks: Vec::new(),
                inv_blocks: Vec::new(),
                tx_to_send: Vec::new(),
                known: RollingSet::new(MAX_INV_KNOWN, self.rng.clone()),
                ask_for: Vec::new(),
                ask_set: RollingSet::new(MAX_ASK_FOR, self.rng.clone()),
                recv_getdata: Vec::new(),
                hash_continue: None,
                send_mempool: false,
                last_mempool_req: None,
                next_inv_send: now,
                bloom: None,
                fee_filter_received: 0,
                fee_filter_sent: 0,
                next_fee_filter_send: None,
            },
        );
    }

    /// Called once the peer's `version` is processed.
    pub fn peer_negotiated(&mut self, id: PeerId, version: u32, relay: bool) {
        if let Some(peer) = self.peers.get_mut(&id) {
            peer.version = version;
            peer.relay_txes = relay;
        }
    }

    /// Upgrade a peer to whitelisted, after its user agent matched.
    pub fn set_whitelisted(&mut self, id: PeerId) {
        if let Some(peer) = self.peers.get_mut(&id) {
            peer.whitelisted = true;
        }
    }

    /// Called when a peer disconnects.
    pub fn peer_disconnected(&mut self, id: PeerId) {
        self.peers.remove(&id);
    }

    /// Queue a block hash for announcement to a peer.
    pub fn queue_block_announcement(&mut self, id: PeerId, hash: BlockHash) {
        if let Some(peer) = self.peers.get_mut(&id) {
            peer.announce_blocks.push(hash);
        }
    }

    /// Queue a block inventory for a peer.
    pub fn push_block_inv(&mut self, id: PeerId, hash: BlockHash) {
        if let Some(peer) = self.peers.get_mut(&id) {
            peer.inv_blocks.push(hash);
        }
    }

    /// Arm the `getblocks` continuation trigger.
    pub fn set_hash_continue(&mut self, id: PeerId, hash: BlockHash) {
        if let Some(peer) = self.peers.get_mut(&id) {
            peer.hash_continue = Some(hash);
        }
    }

    /// Note that a peer told us about a transaction.
    pub fn transaction_known(&mut self, id: PeerId, txid: Txid) {
        if let Some(peer) = self.peers.get_mut(&id) {
            peer.known.insert(txid);
        }
    }

    /// Schedule a `getdata` for a transaction inventory, spaced so other
    /// peers we asked first have a chance to answer.
    pub fn ask_for(&mut self, id: PeerId, inv: Inventory, now: LocalTime) {
        let txid = match inv {
            Inventory::Transaction(txid) | Inventory::WitnessTransaction(txid) => txid,
            _ => return,
        };
        let peer = match self.peers.get_mut(&id) {
            Some(peer) => peer,
            None => return,
        };
        if peer.ask_for.len() >= MAX_ASK_FOR || !peer.ask_set.insert(txid) {
            return;
        }
        let at = self
            .requested
            .get(&txid)
            .map(|last| *last + GETDATA_TX_INTERVAL)
            .unwrap_or(now)
            .max(now);

        peer.ask_for.push((at, inv));
    }

    /// Drop a transaction from the request schedule, after it arrived.
    pub fn transaction_received(&mut self, id: PeerId, txid: Txid) {
        self.requested.remove(&txid);

        if let Some(peer) = self.peers.get_mut(&id) {
            peer.known.insert(txid);
            peer.ask_for.retain(|(_, inv)| {
                !matches!(inv, Inventory::Transaction(t) | Inventory::WitnessTransaction(t) if *t == txid)
            });
        }
    }

    /// Queue transaction announcements to every relaying peer except the
    /// source.
    pub fn relay(&mut self, txids: &[Txid], skip: Option<PeerId>) {
        for (id, peer) in self.peers.iter_mut() {
            if Some(*id) == skip || !peer.relay_txes {
                continue;
            }
            for txid in txids {
                if !peer.known.contains(txid) {
                    peer.tx_to_send.push(*txid);
                }
            }
        }
    }

    /// Submit one of our own transactions for announcement, keeping it
    /// for periodic rebroadcast until it confirms.
    pub fn submit(&mut self, tx: Transaction) -> Vec<PeerId> {
        let txid = tx.txid();

        self.submitted.insert(txid, tx);
        self.relay(&[txid], None);
        self.peers
            .iter()
            .filter(|(_, p)| p.relay_txes)
            .map(|(id, _)| *id)
            .collect()
    }

    /// Drop confirmed transactions from the rebroadcast set.
    pub fn confirmed(&mut self, txids: impl Iterator<Item = Txid>) {
        for txid in txids {
            self.submitted.remove(&txid);
        }
    }

    /// Fetch a transaction we submitted ourselves.
    pub fn submitted_tx(&self, txid: &Txid) -> Option<&Transaction> {
        self.submitted.get(txid)
    }

    /// Requeue our unconfirmed transactions once in a while. Called on
    /// the send tick, outside initial block download.
    pub fn maybe_rebroadcast(&mut self, now: LocalTime) {
        match self.next_rebroadcast {
            Some(next) if now < next => return,
            _ => {}
        }
        self.next_rebroadcast = Some(poisson_next_send(now, AVG_REBROADCAST_INTERVAL, &self.rng));

        if !self.submitted.is_empty() {
            let txids = self.submitted.keys().copied().collect::<Vec<_>>();
            self.relay(&txids, None);
        }
    }

    /// Handle `mempool`: remember to trickle out our whole pool.
    pub fn received_mempool(&mut self, id: PeerId) {
        if let Some(peer) = self.peers.get_mut(&id) {
            peer.send_mempool = true;
        }
    }

    /// Handle `feefilter`.
    pub fn received_feefilter(&mut self, id: PeerId, rate: i64) {
        if rate < 0 || rate as u64 > MAX_MONEY {
            return;
        }
        if let Some(peer) = self.peers.get_mut(&id) {
            peer.fee_filter_received = rate as u64;
            debug!("received: feefilter of {} from peer={}", rate, id);
        }
    }

    /// Handle `filterload`. Returns a misbehavior score on violation.
    pub fn received_filterload(&mut self, id: PeerId, msg: FilterLoad) -> u32 {
        let filter = BloomFilter::from(msg);

        if !filter.is_within_size_constraints() {
            // There is no excuse for an oversized filter.
            return 100;
        }
        if let Some(peer) = self.peers.get_mut(&id) {
            peer.bloom = Some(filter);
            peer.relay_txes = true;
        }
        0
    }

    /// Handle `filteradd`. Returns a misbehavior score on violation.
    pub fn received_filteradd(&mut self, id: PeerId, data: &[u8]) -> u32 {
        if data.len() > MAX_SCRIPT_ELEMENT_SIZE {
            return 100;
        }
        match self.peers.get_mut(&id).and_then(|p| p.bloom.as_mut()) {
            Some(bloom) => {
                bloom.insert(data);
                0
            }
            None => 100,
        }
    }

    /// Handle `filterclear`.
    pub fn received_filterclear(&mut self, id: PeerId) {
        if let Some(peer) = self.peers.get_mut(&id) {
            peer.bloom = Some(BloomFilter::default());
            peer.relay_txes = true;
        }
    }

    /// Whether the peer's bloom filter, if any, matches the transaction.
    pub fn filter_matches(&mut self, id: PeerId, tx: &Transaction) -> bool {
        match self.peers.get_mut(&id).and_then(|p| p.bloom.as_mut()) {
            Some(bloom) => bloom.is_relevant_and_update(tx),
            None => true,
        }
    }

    /// Queue received `getdata` entries for serving.
    pub fn received_getdata(&mut self, id: PeerId, invs: &[Inventory]) {
        if let Some(peer) = self.peers.get_mut(&id) {
            peer.recv_getdata.extend_from_slice(invs);
        }
    }

    /// Serve queued `getdata` entries.
    pub fn process_getdata<T: Chain, M: Mempool>(
        &mut self,
        id: PeerId,
        nodes: &NodeStates,
        chain: &T,
        mempool: &M,
        interrupt: &Interrupt,
    ) {
        let wants_cmpct_witness = nodes.get(id).map_or(false, |s| s.wants_cmpct_witness);
        let peer = match self.peers.get_mut(&id) {
            Some(peer) => peer,
            None => return,
        };
        let pending = std::mem::take(&mut peer.recv_getdata);
        let mut not_found = Vec::new();

        for inv in pending {
            if interrupt.is_set() {
                return;
            }
            match inv {
                Inventory::Block(hash)
                | Inventory::WitnessBlock(hash)
                | Inventory::CompactBlock(hash) => {
                    let entry = match chain.lookup(&hash) {
                        Some(entry) if chain.has_data(entry) => entry,
                        _ => continue,
                    };
                    let block = match chain.read_block(entry) {
                        Some(block) => block,
                        None => continue,
                    };
                    let recent = chain.height(entry)
                        >= chain.tip_height().saturating_sub(MAX_CMPCTBLOCK_DEPTH);

                    if matches!(inv, Inventory::CompactBlock(_)) && recent {
                        let compact = chain.cached_compact_block(&hash).or_else(|| {
                            cmpct::compact_from_block(&block, wants_cmpct_witness, self.rng.u64(..))
                        });
                        match compact {
                            Some(compact) => self.upstream.cmpct_block(id, compact),
                            None => self.upstream.block(id, block),
                        }
                    } else {
                        self.upstream.block(id, block);
                    }

                    if peer.hash_continue == Some(hash) {
                        // The peer is walking the chain with getblocks;
                        // invite the next getblocks round by announcing
                        // our tip, even though it's redundant.
                        self.upstream
                            .inv(id, vec![Inventory::Block(chain.hash(chain.tip()))]);
                        peer.hash_continue = None;
                    }
                }
                Inventory::Unknown { inv_type: 3, hash } => {
                    // Filtered block request (there is no typed variant).
                    let hash = BlockHash::from_hash(
                        <bitcoin::hashes::sha256d::Hash as bitcoin::hashes::Hash>::from_inner(hash),
                    );
                    let entry = match chain.lookup(&hash) {
                        Some(entry) if chain.has_data(entry) => entry,
                        _ => continue,
                    };
                    let (block, bloom) = match (chain.read_block(entry), peer.bloom.as_mut()) {
                        (Some(block), Some(bloom)) => (block, bloom),
                        _ => continue,
                    };
                    let mut matched = Vec::new();
                    for tx in &block.txdata {
                        if bloom.is_relevant_and_update(tx) {
                            matched.push(tx.clone());
                        }
                    }
                    let txids = matched.iter().map(|tx| tx.txid()).collect::<Vec<_>>();
                    let merkle =
                        MerkleBlock::from_block_with_predicate(&block, |t| txids.contains(t));
                    self.upstream.merkle_block(id, merkle, matched);
                }
                Inventory::Transaction(txid) | Inventory::WitnessTransaction(txid) => {
                    match mempool.get(&txid).or_else(|| self.submitted.get(&txid).cloned()) {
                        Some(tx) => self.upstream.tx(id, tx),
                        None => not_found.push(inv),
                    }
                }
                _ => {}
            }
        }
        if !not_found.is_empty() {
            // Tell the peer, so it doesn't wait around for
            // transactions we no longer have.
            self.upstream.not_found(id, not_found);
        }
    }

    /// Announce queued blocks to a peer: a single compact block, a
    /// connecting headers batch, or an inv of the tip, depending on the
    /// peer's preferences and what actually connects.
    pub fn announce_blocks<T: Chain>(&mut self, id: PeerId, nodes: &mut NodeStates, chain: &T) {
        nodes.process_block_availability(id, chain);

        let peer = match self.peers.get_mut(&id) {
            Some(peer) => peer,
            None => return,
        };
        if peer.announce_blocks.is_empty() {
            return;
        }
        let state = match nodes.get(id) {
            Some(state) => state,
            None => return,
        };
        let mut revert_to_inv = (!state.prefer_headers
            && (!state.prefer_header_and_ids || peer.announce_blocks.len() > 1))
            || peer.announce_blocks.len() > MAX_BLOCKS_TO_ANNOUNCE;

        let mut headers = Vec::new();
        let mut best = None; // last header queued for delivery
        let mut found_start = false;

        if !revert_to_inv {
            // Find the first header the peer doesn't have, then send all
            // headers past that one. Give up on anything off the active
            // chain or not connecting.
            for hash in &peer.announce_blocks {
                let entry = match chain.lookup(hash) {
                    Some(entry) => entry,
                    None => {
                        revert_to_inv = true;
                        break;
                    }
                };
                if chain.at(chain.height(entry)) != Some(entry) {
                    // We reorged away from this block.
                    revert_to_inv = true;
                    break;
                }
                if best.is_some() && chain.prev(entry) != best {
                    // The blocks to announce don't connect to each
                    // other; possible after repeated tip invalidations.
                    revert_to_inv = true;
                    break;
                }
                best = Some(entry);
                if found_start {
                    headers.push(chain.header(entry));
                } else if nodes.peer_has_header(state, entry, chain) {
                    continue; // keep looking for the first new block
                } else if chain.prev(entry).map_or(true, |prev| {
                    nodes.peer_has_header(state, prev, chain)
                }) {
                    // Peer doesn't have this header, but has the prior
                    // one: start sending from here.
                    found_start = true;
                    headers.push(chain.header(entry));
                } else {
                    // Peer has neither this header nor the prior one;
                    // nothing will connect.
                    revert_to_inv = true;
                    break;
                }
            }
        }

        let mut best_sent = None;

        if !revert_to_inv && !headers.is_empty() {
            let entry = best.expect("headers were collected");

            if headers.len() == 1 && state.prefer_header_and_ids {
                // Announcing more than one block in compact form would
                // mean the peer is badly behind; don't bother.
                debug!("sending header-and-ids {} to peer={}", chain.hash(entry), id);

                let compact = chain.cached_compact_block(&chain.hash(entry)).or_else(|| {
                    chain.read_block(entry).and_then(|block| {
                        cmpct::compact_from_block(
                            &block,
                            state.wants_cmpct_witness,
                            self.rng.u64(..),
                        )
                    })
                });
                match compact {
                    Some(compact) => {
                        self.upstream.cmpct_block(id, compact);
                        best_sent = Some(entry);
                    }
                    None => revert_to_inv = true,
                }
            } else if state.prefer_headers {
                if headers.len() > 1 {
                    debug!(
                        "sending {} headers, range ({}, {}), to peer={}",
                        headers.len(),
                        headers[0].block_hash(),
                        headers[headers.len() - 1].block_hash(),
                        id
                    );
                } else {
                    debug!("sending header {} to peer={}", headers[0].block_hash(), id);
                }
                self.upstream.headers(id, headers);
                best_sent = Some(entry);
            } else {
                revert_to_inv = true;
            }
        }

        if revert_to_inv {
            // The last entry in the announce queue was our tip at some
            // point; inv that one.
            if let Some(hash) = peer.announce_blocks.last().copied() {
                if let Some(entry) = chain.lookup(&hash) {
                    if chain.at(chain.height(entry)) != Some(entry) {
                        debug!(
                            "Announcing block {} not on main chain (tip={})",
                            hash,
                            chain.hash(chain.tip())
                        );
                    }
                    if !nodes.peer_has_header(state, entry, chain) {
                        peer.inv_blocks.push(hash);
                        debug!("sending inv peer={} hash={}", id, hash);
                    }
                }
            }
        }
        peer.announce_blocks.clear();

        if let Some(entry) = best_sent {
            if let Some(state) = nodes.get_mut(id) {
                state.best_header_sent = Some(entry);
            }
        }
    }

    /// Flush block inventories and trickle transaction inventories.
    pub fn flush_inventory<M: Mempool>(&mut self, id: PeerId, mempool: &mut M, now: LocalTime) {
        let peer = match self.peers.get_mut(&id) {
            Some(peer) => peer,
            None => return,
        };
        let mut invs = Vec::with_capacity(peer.inv_blocks.len().max(INVENTORY_BROADCAST_MAX));

        for hash in peer.inv_blocks.drain(..) {
            invs.push(Inventory::Block(hash));
            if invs.len() == MAX_INV_SZ {
                self.upstream.inv(id, std::mem::take(&mut invs));
            }
        }

        // Whitelisted peers get their transactions without the privacy
        // delay.
        let mut trickle = peer.whitelisted;

        if now >= peer.next_inv_send {
            trickle = true;
            // Use half the delay for outbound peers, since they are
            // harder to use for spying on us.
            let interval = if peer.link.is_outbound() {
                INVENTORY_BROADCAST_INTERVAL / 2
            } else {
                INVENTORY_BROADCAST_INTERVAL
            };
            peer.next_inv_send = poisson_next_send(now, interval, &self.rng);
        }

        if trickle {
            if !peer.relay_txes {
                peer.tx_to_send.clear();
            }
            let selection = mempool.select_inventory(
                peer.send_mempool,
                peer.fee_filter_received,
                peer.bloom.as_ref(),
                std::mem::take(&mut peer.tx_to_send),
                INVENTORY_BROADCAST_MAX,
            );
            if peer.send_mempool {
                peer.send_mempool = false;
                peer.last_mempool_req = Some(now);
            }
            peer.tx_to_send = selection.defer;

            for txid in selection.send {
                peer.known.insert(txid);
                invs.push(Inventory::Transaction(txid));
                if invs.len() == MAX_INV_SZ {
                    self.upstream.inv(id, std::mem::take(&mut invs));
                }
            }
        }
        if !invs.is_empty() {
            self.upstream.inv(id, invs);
        }
    }

    /// Send due scheduled `getdata` requests.
    pub fn drain_ask_for<M: Mempool>(&mut self, id: PeerId, mempool: &M, now: LocalTime) {
        let peer = match self.peers.get_mut(&id) {
            Some(peer) => peer,
            None => return,
        };
        let mut batch = Vec::new();
        let mut keep = Vec::with_capacity(peer.ask_for.len());

        for (at, inv) in peer.ask_for.drain(..) {
            if at > now {
                keep.push((at, inv));
                continue;
            }
            let txid = match inv {
                Inventory::Transaction(txid) | Inventory::WitnessTransaction(txid) => txid,
                _ => continue,
            };
            if mempool.contains(&txid) {
                // Arrived through other means; don't expect an answer.
                continue;
            }
            debug!("Requesting {} peer={}", txid, id);
            self.requested.insert(txid, now);
            batch.push(inv);

            if batch.len() >= MAX_GETDATA_BATCH {
                self.upstream.get_data(id, std::mem::take(&mut batch));
            }
        }
        peer.ask_for = keep;

        if !batch.is_empty() {
            self.upstream.get_data(id, batch);
        }
    }

    /// Send a `feefilter` update at the broadcast cadence, or sooner if
    /// our floor drifted far from what the peer believes.
    pub fn maybe_send_feefilter<M: Mempool>(
        &mut self,
        id: PeerId,
        mempool: &M,
        enabled: bool,
        force_relay_whitelisted: bool,
        max_mempool_bytes: usize,
        min_relay_fee: u64,
        now: LocalTime,
    ) {
        let peer = match self.peers.get_mut(&id) {
            Some(peer) => peer,
            None => return,
        };
        if !enabled || peer.version < super::FEEFILTER_VERSION {
            return;
        }
        // Don't ask whitelisted peers to filter when we force-relay
        // their transactions anyway.
        if peer.whitelisted && force_relay_whitelisted {
            return;
        }
        let current = mempool.min_fee(max_mempool_bytes);

        match peer.next_fee_filter_send {
            Some(next) if now < next => {
                // If the floor drifted by more than a third, move the
                // broadcast up.
                let drifted = current < peer.fee_filter_sent * 3 / 4
                    || current > peer.fee_filter_sent * 4 / 3;

                if drifted && now + MAX_FEEFILTER_CHANGE_DELAY < next {
                    let jitter = LocalDuration::from_secs(
                        self.rng.u64(..MAX_FEEFILTER_CHANGE_DELAY.as_secs()),
                    );
                    peer.next_fee_filter_send = Some(now + jitter);
                }
            }
            _ => {
                let rounded = self.fee_rounder.round(current).max(min_relay_fee);

                if rounded != peer.fee_filter_sent {
                    self.upstream.fee_filter(id, rounded as i64);
                    peer.fee_filter_sent = rounded;
                }
                peer.next_fee_filter_send = Some(poisson_next_send(
                    now,
                    AVG_FEEFILTER_BROADCAST_INTERVAL,
                    &self.rng,
                ));
            }
        }
    }
}
