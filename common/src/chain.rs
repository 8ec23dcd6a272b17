//! Interface to the chain engine.
//!
//! The peer logic never owns headers or blocks; it holds [`BlockId`]
//! handles into the header arena owned by the chain engine, and reaches
//! the engine through the [`Chain`] trait. Handles are plain indices:
//! copyable, comparable, and meaningless outside the engine that issued
//! them.
use thiserror::Error;

use bitcoin::util::bip152::HeaderAndShortIds;

use crate::block::{Block, BlockHash, BlockHeader, BlockTime, Height, Work};

/// Handle to an entry in the chain engine's header arena.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BlockId(pub u32);

/// How far validation of a header entry has progressed.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum ValidationLevel {
    /// The header is valid and connects to a valid tree of headers.
    Tree,
    /// The block's transactions and their order are valid.
    Chain,
    /// The block has been fully validated in the context of its chain.
    Transactions,
}

/// Reject code for invalid data, as used in `reject` messages.
pub type RejectCode = u8;

/// Header acceptance failure.
#[derive(Error, Debug, Clone)]
#[error("invalid header: {reason}")]
pub struct HeaderError {
    /// Misbehavior score to apply to the sender; zero means none.
    pub dos: u32,
    /// Reject code.
    pub code: RejectCode,
    /// Human-readable reason.
    pub reason: &'static str,
    /// Hash of the first header that failed validation, if identified.
    pub first_invalid: Option<BlockHash>,
}

/// Outcome of a block validation, reported back through the peer logic's
/// `block_checked` notification.
#[derive(Debug, Clone)]
pub struct BlockVerdict {
    /// Whether the block passed validation.
    pub valid: bool,
    /// Misbehavior score for the block's source, if invalid.
    pub dos: u32,
    /// Reject code; zero or internal codes suppress the reject message.
    pub code: RejectCode,
    /// Whether the failure is internal (not the sender's fault).
    pub internal: bool,
    /// Human-readable reason.
    pub reason: String,
}

/// The chain engine, as seen by the peer logic.
///
/// Queries on handles are cheap index lookups and must not block;
/// `accept_headers` and `accept_block` may do real work, but full block
/// validation completes asynchronously and reports through the
/// `block_checked` notification.
pub trait Chain {
    /// Look up a header by hash.
    fn lookup(&self, hash: &BlockHash) -> Option<BlockId>;
    /// The header data of an entry.
    fn header(&self, id: BlockId) -> BlockHeader;
    /// The block hash of an entry.
    fn hash(&self, id: BlockId) -> BlockHash;
    /// The height of an entry.
    fn height(&self, id: BlockId) -> Height;
    /// The cumulative work of an entry.
    fn work(&self, id: BlockId) -> Work;
    /// The timestamp of an entry.
    fn time(&self, id: BlockId) -> BlockTime;
    /// The parent of an entry.
    fn prev(&self, id: BlockId) -> Option<BlockId>;
    /// The ancestor of an entry at the given height.
    fn ancestor(&self, id: BlockId, height: Height) -> Option<BlockId>;
    /// The highest common ancestor of two entries.
    fn last_common_ancestor(&self, a: BlockId, b: BlockId) -> BlockId;
    /// Whether the entry has reached the given validation level.
    fn is_valid(&self, id: BlockId, level: ValidationLevel) -> bool;
    /// Whether the block's data is stored.
    fn has_data(&self, id: BlockId) -> bool;
    /// Whether the chain up to and including this block has its
    /// transactions connected.
    fn has_txns(&self, id: BlockId) -> bool;

    /// The tip of the active chain.
    fn tip(&self) -> BlockId;
    /// The height of the active chain.
    fn tip_height(&self) -> Height;
    /// The active-chain entry at the given height.
    fn at(&self, height: Height) -> Option<BlockId>;
    /// Whether an entry is on the active chain.
    fn in_active(&self, id: BlockId) -> bool;
    /// The best known header, which may be ahead of the active tip.
    fn best_header(&self) -> BlockId;
    /// A block locator starting from the given entry.
    fn locator(&self, from: BlockId) -> Vec<BlockHash>;

    /// Minimum cumulative work required of a peer's chain before we
    /// download blocks from it.
    fn min_chain_work(&self) -> Work;
    /// Whether we are still catching up to the network tip.
    fn is_initial_block_download(&self) -> bool;
    /// Whether the engine is reindexing from disk.
    fn is_reindexing(&self) -> bool {
        false
    }
    /// Whether the engine is importing blocks from files.
    fn is_importing(&self) -> bool {
        false
    }
    /// Whether witness rules are active for a block whose parent is the
    /// given entry.
    fn witness_enabled(&self, parent: Option<BlockId>) -> bool;
    /// Minimum peer protocol version currently acceptable. The engine
    /// raises this when a fork activates that obsoletes old peers.
    fn min_peer_version(&self) -> u32;

    /// Validate and index a batch of headers. On success, returns the
    /// entry of the last header.
    fn accept_headers(&mut self, headers: &[BlockHeader]) -> Result<BlockId, HeaderError>;
    /// Submit a block for processing. `force` bypasses the unrequested
    /// block limiter. Returns whether the block was new to us; the
    /// validation verdict arrives later via `block_checked`.
    fn accept_block(&mut self, block: Block, force: bool) -> bool;

    /// Entries to serve for a `getheaders` request, in height order,
    /// starting after the locator's fork point, up to `max`.
    fn locate_headers(&self, locator: &[BlockHash], stop: BlockHash, max: usize) -> Vec<BlockId>;
    /// Hashes to inventory for a `getblocks` request.
    fn locate_blocks(&self, locator: &[BlockHash], stop: BlockHash, max: usize) -> Vec<BlockHash>;
    /// Read a block's data from storage.
    fn read_block(&self, id: BlockId) -> Option<Block>;
    /// The cached compact encoding of the most recently announced block,
    /// if it matches the given hash.
    fn cached_compact_block(&self, hash: &BlockHash) -> Option<HeaderAndShortIds>;

    /// Feed a `checkpoint` payload to the engine. The payload format is
    /// owned by the engine; the peer logic only routes it and applies
    /// the returned score on failure.
    fn receive_checkpoints(&mut self, data: &[u8]) -> Result<usize, HeaderError>;
    /// Serve a `get_checkpoint` request for checkpoints at or above the
    /// given height.
    fn checkpoints_from(&self, height: Height) -> Option<Vec<u8>>;
}
