//! Block-related primitives.
pub mod time;

pub use bitcoin::blockdata::block::{Block, BlockHeader};
pub use bitcoin::hash_types::{BlockHash, TxMerkleNode, Txid, Wtxid};
pub use bitcoin::util::uint::Uint256;
pub use bitcoin::Transaction;

/// Height of a block in the chain.
pub type Height = u64;

/// Block timestamp, in seconds since epoch. This is the representation
/// used in block headers and `addr` messages.
pub type BlockTime = u32;

/// Cumulative proof-of-work.
pub type Work = Uint256;

/// Zero cumulative work, the work of an entry that has not been
/// validated against its proof-of-work target.
pub const ZERO_WORK: Work = Uint256([0, 0, 0, 0]);
