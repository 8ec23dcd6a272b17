//! Test doubles: a model chain engine, mempool and address store, plus
//! block generators.
use std::collections::{HashMap, HashSet};
use std::net;

use bitcoin::blockdata::locktime::PackedLockTime;
use bitcoin::hashes::Hash as _;
use bitcoin::blockdata::script::Script;
use bitcoin::blockdata::transaction::{OutPoint, Sequence, TxIn, TxOut};
use bitcoin::network::address::Address;
use bitcoin::network::constants::ServiceFlags;
use bitcoin::util::bip152::HeaderAndShortIds;
use bitcoin::{Block, BlockHeader, Transaction, TxMerkleNode, Witness};

use galena_common::block::time::LocalTime;
use galena_common::block::{BlockHash, BlockTime, Height, Txid, Uint256, Work};
use galena_common::bloom::BloomFilter;
use galena_common::chain::{BlockId, Chain, HeaderError, ValidationLevel};
use galena_common::mempool::{Mempool, TxSelection, TxVerdict};
use galena_common::network::Network;
use galena_common::p2p::{AddressSource, PeerId};

use crate::fsm::MIN_PEER_PROTO_VERSION;

fn work(units: u64) -> Work {
    Uint256([units, 0, 0, 0])
}

#[derive(Debug)]
struct Entry {
    header: BlockHeader,
    height: Height,
    work: u64,
    prev: Option<BlockId>,
    have_data: bool,
    have_txns: bool,
}

/// In-memory model of the chain engine.
#[derive(Debug)]
pub struct TestChain {
    entries: Vec<Entry>,
    by_hash: HashMap<BlockHash, BlockId>,
    active: Vec<BlockId>,
    best_header: BlockId,
    blocks: HashMap<BlockHash, Block>,

    /// Entries that fail validation, by hash.
    pub invalid: HashSet<BlockHash>,
    /// Required work of a peer's chain before we download from it.
    pub min_work: u64,
    /// Whether we are in initial block download.
    pub ibd: bool,
    /// Whether witness rules are active.
    pub witness_active: bool,
    /// Minimum peer version the chain demands.
    pub min_version: u32,
    /// Record of `accept_block` calls: hash and force flag.
    pub accepted_blocks: Vec<(BlockHash, bool)>,
    /// Received checkpoint payloads.
    pub checkpoints: Vec<Vec<u8>>,
}

impl TestChain {
    /// A chain holding only the genesis block of the given network.
    pub fn new(network: Network) -> Self {
        let genesis = network.genesis();
        let mut by_hash = HashMap::new();
        by_hash.insert(genesis.block_hash(), BlockId(0));

        Self {
            entries: vec![Entry {
                header: genesis,
                height: 0,
                work: 1,
                prev: None,
                have_data: true,
                have_txns: true,
            }],
            by_hash,
            active: vec![BlockId(0)],
            best_header: BlockId(0),
            blocks: HashMap::new(),
            invalid: HashSet::new(),
            min_work: 0,
            ibd: false,
            witness_active: false,
            min_version: MIN_PEER_PROTO_VERSION,
            accepted_blocks: Vec::new(),
            checkpoints: Vec::new(),
        }
    }

    /// Import headers directly, as if fully synced from elsewhere.
    pub fn import_headers(&mut self, headers: &[BlockHeader]) {
        self.accept_headers(headers).unwrap();
    }

    /// Pretend the block data for a hash is on disk, without connecting.
    pub fn set_have_data(&mut self, hash: &BlockHash) {
        let id = self.by_hash[hash];
        self.entries[id.0 as usize].have_data = true;
    }

    /// Connect blocks directly, advancing the active chain.
    pub fn import_blocks(&mut self, blocks: &[Block]) {
        for block in blocks {
            self.import_headers(&[block.header]);
            self.accept_block(block.clone(), true);
        }
    }

    fn extend_active(&mut self) {
        loop {
            let tip = *self.active.last().unwrap();
            let next = self.entries.iter().position(|e| {
                e.prev == Some(tip) && e.have_data && !self.invalid.contains(&e.header.block_hash())
            });
            match next {
                Some(ix) => {
                    self.entries[ix].have_txns = true;
                    self.active.push(BlockId(ix as u32));
                }
                None => break,
            }
        }
    }
}

impl Chain for TestChain {
    fn lookup(&self, hash: &BlockHash) -> Option<BlockId> {
        self.by_hash.get(hash).copied()
    }

    fn header(&self, id: BlockId) -> BlockHeader {
        self.entries[id.0 as usize].header
    }

    fn hash(&self, id: BlockId) -> BlockHash {
        self.entries[id.0 as usize].header.block_hash()
    }

    fn height(&self, id: BlockId) -> Height {
        self.entries[id.0 as usize].height
    }

    fn work(&self, id: BlockId) -> Work {
        work(self.entries[id.0 as usize].work)
    }

    fn time(&self, id: BlockId) -> BlockTime {
        self.entries[id.0 as usize].header.time
    }

    fn prev(&self, id: BlockId) -> Option<BlockId> {
        self.entries[id.0 as usize].prev
    }

    fn ancestor(&self, id: BlockId, height: Height) -> Option<BlockId> {
        let mut walk = id;
        loop {
            let entry = &self.entries[walk.0 as usize];
            if entry.height == height {
                return Some(walk);
            }
            if entry.height < height {
                return None;
            }
            walk = entry.prev?;
        }
    }

    fn last_common_ancestor(&self, a: BlockId, b: BlockId) -> BlockId {
        let (mut a, mut b) = (a, b);
        while self.height(a) > self.height(b) {
            a = self.prev(a).unwrap();
        }
        while self.height(b) > self.height(a) {
            b = self.prev(b).unwrap();
        }
        while a != b {
            a = self.prev(a).unwrap();
            b = self.prev(b).unwrap();
        }
        a
    }

    fn is_valid(&self, id: BlockId, level: ValidationLevel) -> bool {
        let entry = &self.entries[id.0 as usize];
        if self.invalid.contains(&entry.header.block_hash()) {
            return false;
        }
        match level {
            ValidationLevel::Tree | ValidationLevel::Chain => true,
            ValidationLevel::Transactions => entry.have_txns,
        }
    }

    fn has_data(&self, id: BlockId) -> bool {
        self.entries[id.0 as usize].have_data
    }

    fn has_txns(&self, id: BlockId) -> bool {
        self.entries[id.0 as usize].have_txns
    }

    fn tip(&self) -> BlockId {
        *self.active.last().unwrap()
    }

    fn tip_height(&self) -> Height {
        (self.active.len() - 1) as Height
    }

    fn at(&self, height: Height) -> Option<BlockId> {
        self.active.get(height as usize).copied()
    }

    fn in_active(&self, id: BlockId) -> bool {
        self.active.get(self.height(id) as usize) == Some(&id)
    }

    fn best_header(&self) -> BlockId {
        self.best_header
    }

    fn locator(&self, from: BlockId) -> Vec<BlockHash> {
        vec![self.hash(from)]
    }

    fn min_chain_work(&self) -> Work {
        work(self.min_work)
    }

    fn is_initial_block_download(&self) -> bool {
        self.ibd
    }

    fn witness_enabled(&self, _parent: Option<BlockId>) -> bool {
        self.witness_active
    }

    fn min_peer_version(&self) -> u32 {
        self.min_version
    }

    fn accept_headers(&mut self, headers: &[BlockHeader]) -> Result<BlockId, HeaderError> {
        let mut last = None;

        for header in headers {
            let hash = header.block_hash();

            if self.invalid.contains(&hash) {
                return Err(HeaderError {
                    dos: 100,
                    code: 0x10,
                    reason: "invalid header",
                    first_invalid: Some(hash),
                });
            }
            if let Some(id) = self.by_hash.get(&hash) {
                last = Some(*id);
                continue;
            }
            let prev = match self.by_hash.get(&header.prev_blockhash) {
                Some(prev) => *prev,
                None => {
                    return Err(HeaderError {
                        dos: 10,
                        code: 0x10,
                        reason: "previous header not found",
                        first_invalid: Some(hash),
                    })
                }
            };
            let id = BlockId(self.entries.len() as u32);
            let prev_entry = &self.entries[prev.0 as usize];

            self.entries.push(Entry {
                header: *header,
                height: prev_entry.height + 1,
                work: prev_entry.work + 1,
                prev: Some(prev),
                have_data: false,
                have_txns: false,
            });
            self.by_hash.insert(hash, id);

            if self.entries[id.0 as usize].work > self.entries[self.best_header.0 as usize].work {
                self.best_header = id;
            }
            last = Some(id);
        }
        last.ok_or(HeaderError {
            dos: 0,
            code: 0x10,
            reason: "empty headers",
            first_invalid: None,
        })
    }

    fn accept_block(&mut self, block: Block, force: bool) -> bool {
        let hash = block.block_hash();

        self.accepted_blocks.push((hash, force));

        if self.by_hash.get(&hash).is_none() {
            if self.accept_headers(&[block.header]).is_err() {
                return false;
            }
        }
        let id = self.by_hash[&hash];
        let is_new = !self.entries[id.0 as usize].have_data;

        self.entries[id.0 as usize].have_data = true;
        self.blocks.insert(hash, block);
        self.extend_active();

        is_new
    }

    fn locate_headers(&self, locator: &[BlockHash], stop: BlockHash, max: usize) -> Vec<BlockId> {
        let from = locator
            .iter()
            .filter_map(|h| self.by_hash.get(h))
            .filter(|id| self.in_active(**id))
            .map(|id| self.height(*id))
            .max()
            .unwrap_or(0);

        let mut out = Vec::new();
        for height in (from + 1)..=self.tip_height() {
            let id = self.active[height as usize];
            out.push(id);
            if self.hash(id) == stop || out.len() == max {
                break;
            }
        }
        out
    }

    fn locate_blocks(&self, locator: &[BlockHash], stop: BlockHash, max: usize) -> Vec<BlockHash> {
        self.locate_headers(locator, stop, max)
            .into_iter()
            .map(|id| self.hash(id))
            .collect()
    }

    fn read_block(&self, id: BlockId) -> Option<Block> {
        self.blocks.get(&self.hash(id)).cloned()
    }

    fn cached_compact_block(&self, _hash: &BlockHash) -> Option<HeaderAndShortIds> {
        None
    }

    fn receive_checkpoints(&mut self, data: &[u8]) -> Result<usize, HeaderError> {
        self.checkpoints.push(data.to_vec());
        Ok(1)
    }

    fn checkpoints_from(&self, _height: Height) -> Option<Vec<u8>> {
        Some(vec![0xca, 0xfe])
    }
}

/// In-memory model of the mempool engine.
#[derive(Debug, Default)]
pub struct TestMempool {
    /// Pool contents.
    pub txs: HashMap<Txid, Transaction>,
    /// Fee floor reported by `min_fee`.
    pub min_fee: u64,
    /// Orphan eviction calls, by peer.
    pub orphans_evicted_for: Vec<PeerId>,
}

impl Mempool for TestMempool {
    fn contains(&self, txid: &Txid) -> bool {
        self.txs.contains_key(txid)
    }

    fn receive(&mut self, _from: PeerId, tx: Transaction) -> TxVerdict {
        let txid = tx.txid();
        self.txs.insert(txid, tx);

        TxVerdict {
            accepted: true,
            misbehavior: 0,
            reject: None,
            relay: vec![txid],
        }
    }

    fn get(&self, txid: &Txid) -> Option<Transaction> {
        self.txs.get(txid).cloned()
    }

    fn min_fee(&self, _max_mempool_bytes: usize) -> u64 {
        self.min_fee
    }

    fn select_inventory(
        &mut self,
        send_mempool: bool,
        _fee_floor: u64,
        _filter: Option<&BloomFilter>,
        queued: Vec<Txid>,
        max: usize,
    ) -> TxSelection {
        let mut candidates = queued;

        if send_mempool {
            candidates.extend(self.txs.keys().copied());
        }
        candidates.dedup();

        let send = candidates.iter().take(max).copied().collect();
        let defer = candidates.into_iter().skip(max).collect();

        TxSelection { send, defer }
    }

    fn transactions(&self) -> Vec<Transaction> {
        self.txs.values().cloned().collect()
    }

    fn remove_orphans_for_block(&mut self, _block: &Block) {}

    fn remove_orphans_for_peer(&mut self, peer: PeerId) {
        self.orphans_evicted_for.push(peer);
    }
}

/// In-memory model of the address store.
#[derive(Debug)]
pub struct TestAddrs {
    /// Stored addresses.
    pub stored: Vec<(BlockTime, Address)>,
    /// Whether we accept inbound connections.
    pub listening: bool,
    /// Addresses marked good.
    pub good: Vec<net::SocketAddr>,
}

impl Default for TestAddrs {
    fn default() -> Self {
        Self {
            stored: Vec::new(),
            listening: true,
            good: Vec::new(),
        }
    }
}

impl AddressSource for TestAddrs {
    fn addresses(&mut self, max: usize) -> Vec<(BlockTime, Address)> {
        self.stored.iter().take(max).cloned().collect()
    }

    fn add(&mut self, addrs: Vec<(BlockTime, Address)>, _source: net::SocketAddr) {
        self.stored.extend(addrs);
    }

    fn mark_good(&mut self, addr: net::SocketAddr) {
        self.good.push(addr);
    }

    fn set_services(&mut self, _addr: net::SocketAddr, _services: ServiceFlags) {}

    fn count(&self) -> usize {
        self.stored.len()
    }

    fn local_address(&self, _peer: &net::SocketAddr) -> Option<(BlockTime, Address)> {
        let local: net::SocketAddr = ([1, 2, 3, 4], 8333).into();
        Some((0, Address::new(&local, ServiceFlags::NETWORK)))
    }

    fn record_local(&mut self, _addr: &Address) {}

    fn is_reachable(&self, _addr: &Address) -> bool {
        true
    }

    fn is_listening(&self) -> bool {
        self.listening
    }
}

/// A coinbase-like transaction with a unique script.
pub fn gen_transaction(rng: &fastrand::Rng) -> Transaction {
    let tag: Vec<u8> = (0..8).map(|_| rng.u8(..)).collect();

    Transaction {
        version: 1,
        lock_time: PackedLockTime::ZERO,
        input: vec![TxIn {
            previous_output: OutPoint::null(),
            script_sig: Script::from(tag),
            sequence: Sequence::MAX,
            witness: Witness::new(),
        }],
        output: vec![TxOut {
            value: 50_0000_0000,
            script_pubkey: Script::new(),
        }],
    }
}

/// A block on top of `prev` containing the given transactions.
pub fn gen_block_with(prev: &BlockHeader, txdata: Vec<Transaction>, rng: &fastrand::Rng) -> Block {
    let mut block = Block {
        header: BlockHeader {
            version: 1,
            prev_blockhash: prev.block_hash(),
            merkle_root: TxMerkleNode::all_zeros(),
            time: prev.time + 600,
            bits: prev.bits,
            nonce: rng.u32(..),
        },
        txdata,
    };
    block.header.merkle_root = block.compute_merkle_root().unwrap();
    block
}

/// A block with a single generated transaction.
pub fn gen_block(prev: &BlockHeader, rng: &fastrand::Rng) -> Block {
    gen_block_with(prev, vec![gen_transaction(rng)], rng)
}

/// A chain of blocks on top of `genesis`.
pub fn gen_chain(genesis: &BlockHeader, length: usize, rng: &fastrand::Rng) -> Vec<Block> {
    let mut blocks = Vec::with_capacity(length);
    let mut prev = *genesis;

    for _ in 0..length {
        let block = gen_block(&prev, rng);
        prev = block.header;
        blocks.push(block);
    }
    blocks
}

/// Timestamp of the local clock used in tests, just past the genesis
/// block so the tip counts as fresh.
pub fn genesis_time(network: Network) -> LocalTime {
    LocalTime::from_secs(network.genesis().time as u64 + 600)
}
