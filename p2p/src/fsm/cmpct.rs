//! Compact block relay (BIP 152).
//!
//! A compact block carries a header, a salted 6-byte short id per
//! transaction, and a few prefilled transactions. [`PartialBlock`] holds
//! the reconstruction state for one such block: slots are filled from
//! the mempool by short id, the remainder is requested with
//! `getblocktxn` and completed from the `blocktxn` answer.
use std::collections::HashMap;

use bitcoin::consensus::encode::serialize;
use bitcoin::hashes::{sha256, siphash24, Hash};
use bitcoin::util::bip152::HeaderAndShortIds;
use bitcoin::util::bip152::ShortId;
use bitcoin::{Block, BlockHeader, Transaction};
use thiserror::Error;

use galena_common::mempool::Mempool;

/// Reconstruction failure.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum CmpctError {
    /// The compact block or the supplied transactions are garbage; the
    /// sender is at fault.
    #[error("invalid compact block")]
    Invalid,
    /// Reconstruction failed without implicating the sender, most
    /// likely a short-id collision. Fall back to a full `getdata`.
    #[error("compact block reconstruction failed")]
    Failed,
}

/// A block being reconstructed from its compact form.
#[derive(Debug)]
pub struct PartialBlock {
    header: BlockHeader,
    txs: Vec<Option<Transaction>>,
}

impl PartialBlock {
    /// Start reconstructing from a compact block, extracting whatever
    /// the mempool already has. Short ids are matched on wtxid when the
    /// negotiated compact-block version is 2.
    pub fn new<M: Mempool>(
        cmpct: &HeaderAndShortIds,
        mempool: &M,
        use_wtxid: bool,
    ) -> Result<Self, CmpctError> {
        let total = cmpct.short_ids.len() + cmpct.prefilled_txs.len();

        if total == 0 {
            return Err(CmpctError::Invalid);
        }
        let mut txs: Vec<Option<Transaction>> = vec![None; total];

        for prefilled in &cmpct.prefilled_txs {
            let index = prefilled.idx as usize;

            if index >= total || txs[index].is_some() {
                return Err(CmpctError::Invalid);
            }
            txs[index] = Some(prefilled.tx.clone());
        }

        // Map short ids to the slots left between prefilled entries.
        let mut ids: HashMap<u64, usize> = HashMap::with_capacity(cmpct.short_ids.len());
        let mut slot = 0;

        for short_id in &cmpct.short_ids {
            while txs[slot].is_some() {
                slot += 1;
            }
            if ids.insert(shortid_value(short_id), slot).is_some() {
                // Two identical short ids; the block can only be fetched
                // whole.
                return Err(CmpctError::Failed);
            }
            slot += 1;
        }

        let keys = siphash_keys(&cmpct.header, cmpct.nonce);
        let mut filled = vec![false; total];

        for tx in mempool.transactions() {
            let id = if use_wtxid {
                short_id(keys, &tx.wtxid()[..])
            } else {
                short_id(keys, &tx.txid()[..])
            };
            if let Some(&index) = ids.get(&id) {
                if !filled[index] {
                    txs[index] = Some(tx);
                    filled[index] = true;
                } else if txs[index].is_some() {
                    // Two mempool transactions match this short id; drop
                    // the slot so it gets requested explicitly.
                    txs[index] = None;
                }
            }
        }

        Ok(Self {
            header: cmpct.header,
            txs,
        })
    }

    /// The header being reconstructed.
    pub fn header(&self) -> &BlockHeader {
        &self.header
    }

    /// Whether the transaction at the given index is available.
    pub fn is_available(&self, index: usize) -> bool {
        self.txs.get(index).map_or(false, Option::is_some)
    }

    /// Indexes of the transactions still missing, in order.
    pub fn missing(&self) -> Vec<u64> {
        self.txs
            .iter()
            .enumerate()
            .filter(|(_, tx)| tx.is_none())
            .map(|(i, _)| i as u64)
            .collect()
    }

    /// Complete the block with the transactions answering our
    /// `getblocktxn` request, in request order.
    pub fn fill(&self, provided: Vec<Transaction>) -> Result<Block, CmpctError> {
        let mut provided = provided.into_iter();
        let mut txdata = Vec::with_capacity(self.txs.len());

        for slot in &self.txs {
            match slot {
                Some(tx) => txdata.push(tx.clone()),
                None => txdata.push(provided.next().ok_or(CmpctError::Invalid)?),
            }
        }
        if provided.next().is_some() {
            return Err(CmpctError::Invalid);
        }

        let block = Block {
            header: self.header,
            txdata,
        };
        // A merkle mismatch here is indistinguishable from a short-id
        // collision, so the sender is not implicated.
        if !block.check_merkle_root() {
            return Err(CmpctError::Failed);
        }
        Ok(block)
    }
}

/// Build the compact encoding of a block for announcement, prefilling
/// the coinbase.
pub fn compact_from_block(
    block: &Block,
    use_wtxid: bool,
    nonce: u64,
) -> Option<HeaderAndShortIds> {
    let version = if use_wtxid { 2 } else { 1 };

    HeaderAndShortIds::from_block(block, nonce, version, &[]).ok()
}

/// The SipHash keys salting a compact block's short ids, derived from
/// the header and nonce.
pub fn siphash_keys(header: &BlockHeader, nonce: u64) -> (u64, u64) {
    let mut input = serialize(header);
    input.extend_from_slice(&nonce.to_le_bytes());

    let bytes = sha256::Hash::hash(&input).into_inner();

    let k0 = u64::from_le_bytes(bytes[0..8].try_into().expect("8 bytes"));
    let k1 = u64::from_le_bytes(bytes[8..16].try_into().expect("8 bytes"));

    (k0, k1)
}

/// Compute a 48-bit short id for a transaction hash.
pub fn short_id((k0, k1): (u64, u64), txhash: &[u8]) -> u64 {
    siphash24::Hash::hash_with_keys(k0, k1, txhash).as_u64() & 0x0000_ffff_ffff_ffff
}

fn shortid_value(short_id: &ShortId) -> u64 {
    let bytes: &[u8] = &short_id[..];
    let mut value = [0u8; 8];
    value[..6].copy_from_slice(bytes);

    u64::from_le_bytes(value)
}
