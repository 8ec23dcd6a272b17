//! Interface to the transaction memory pool.
use crate::block::{Block, Transaction, Txid};
use crate::bloom::BloomFilter;
use crate::chain::RejectCode;
use crate::p2p::PeerId;

/// Outcome of handing a transaction to the mempool.
#[derive(Debug, Default)]
pub struct TxVerdict {
    /// Whether the transaction entered the pool (or the orphan pool).
    pub accepted: bool,
    /// Misbehavior score for the sender; zero means none.
    pub misbehavior: u32,
    /// Reject notification to send back, if any.
    pub reject: Option<(RejectCode, String)>,
    /// Transactions to announce to our peers as a result, typically the
    /// accepted transaction plus any orphans it unblocked.
    pub relay: Vec<Txid>,
}

/// Transaction inventory chosen for a peer, split into the hashes to
/// announce now and the ones to retain for a later trickle.
#[derive(Debug, Default)]
pub struct TxSelection {
    /// Hashes to announce now, ordered for announcement.
    pub send: Vec<Txid>,
    /// Hashes to keep queued.
    pub defer: Vec<Txid>,
}

/// The mempool engine, as seen by the peer logic.
pub trait Mempool {
    /// Whether the pool (including orphans and recently confirmed
    /// transactions) already has this transaction.
    fn contains(&self, txid: &Txid) -> bool;
    /// Validate and accept a transaction received from a peer.
    fn receive(&mut self, from: PeerId, tx: Transaction) -> TxVerdict;
    /// Fetch a transaction for relay.
    fn get(&self, txid: &Txid) -> Option<Transaction>;
    /// The pool's minimum fee rate in satoshis per kilobyte, given its
    /// configured size limit in bytes.
    fn min_fee(&self, max_mempool_bytes: usize) -> u64;
    /// Choose up to `max` transaction hashes to announce to a peer,
    /// honoring its fee filter and bloom filter. `queued` holds the
    /// hashes previously deferred for this peer; `send_mempool` is set
    /// when the peer requested our whole pool (BIP 35).
    fn select_inventory(
        &mut self,
        send_mempool: bool,
        fee_floor: u64,
        filter: Option<&BloomFilter>,
        queued: Vec<Txid>,
        max: usize,
    ) -> TxSelection;
    /// A snapshot of the pool's transactions, for compact block
    /// reconstruction.
    fn transactions(&self) -> Vec<Transaction>;
    /// Evict orphan transactions made redundant by a connected block.
    fn remove_orphans_for_block(&mut self, block: &Block);
    /// Evict orphan transactions attributed to a disconnected peer.
    fn remove_orphans_for_peer(&mut self, peer: PeerId);
}
