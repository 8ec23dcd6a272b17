//! BIP 37 bloom filters.
//!
//! Peers may install a bloom filter on their connection to receive only
//! matching transactions and filtered blocks. The `bitcoin` crate ships
//! the wire structures (`filterload`, `filteradd`); the filter itself
//! lives here.
use bitcoin::consensus::encode::serialize;
use bitcoin::network::message_bloom::{BloomFlags, FilterLoad};
use bitcoin::{OutPoint, Script, Transaction};

/// Maximum size of a bloom filter, in bytes.
pub const MAX_BLOOM_FILTER_SIZE: usize = 36_000;
/// Maximum number of hash functions in a bloom filter.
pub const MAX_HASH_FUNCS: u32 = 50;
/// Maximum size of a script data element, and thus of a `filteradd` item.
pub const MAX_SCRIPT_ELEMENT_SIZE: usize = 520;

const LN2SQUARED: f64 = std::f64::consts::LN_2 * std::f64::consts::LN_2;
const LN2: f64 = std::f64::consts::LN_2;

/// A bloom filter installed by a peer.
#[derive(Debug, Clone)]
pub struct BloomFilter {
    data: Vec<u8>,
    hash_funcs: u32,
    tweak: u32,
    flags: BloomFlags,
    empty: bool,
    full: bool,
}

impl Default for BloomFilter {
    /// An empty filter, matching nothing. This is the state after
    /// `filterclear`.
    fn default() -> Self {
        Self {
            data: vec![],
            hash_funcs: 0,
            tweak: 0,
            flags: BloomFlags::None,
            empty: true,
            full: false,
        }
    }
}

impl From<FilterLoad> for BloomFilter {
    fn from(msg: FilterLoad) -> Self {
        let mut filter = Self {
            data: msg.filter,
            hash_funcs: msg.hash_funcs,
            tweak: msg.tweak,
            flags: msg.flags,
            empty: true,
            full: false,
        };
        filter.update_empty_full();
        filter
    }
}

impl BloomFilter {
    /// Create a filter sized for `elements` entries at the given false
    /// positive rate.
    pub fn new(elements: usize, fp_rate: f64, tweak: u32, flags: BloomFlags) -> Self {
        let bits = (-1.0 / LN2SQUARED * elements as f64 * fp_rate.ln()) as usize;
        let size = bits.min(MAX_BLOOM_FILTER_SIZE * 8) / 8;
        let hash_funcs = ((size * 8 / elements) as f64 * LN2) as u32;

        Self {
            data: vec![0; size],
            hash_funcs: hash_funcs.min(MAX_HASH_FUNCS),
            tweak,
            flags,
            empty: true,
            full: false,
        }
    }

    /// Whether the filter respects the protocol size limits. Oversized
    /// filters are a bannable offense.
    pub fn is_within_size_constraints(&self) -> bool {
        self.data.len() <= MAX_BLOOM_FILTER_SIZE && self.hash_funcs <= MAX_HASH_FUNCS
    }

    fn bit_index(&self, hash_num: u32, data: &[u8]) -> usize {
        let seed = hash_num.wrapping_mul(0xFBA4C795).wrapping_add(self.tweak);

        murmur3(seed, data) as usize % (self.data.len() * 8)
    }

    /// Insert a data element.
    pub fn insert(&mut self, data: &[u8]) {
        if self.full || self.data.is_empty() {
            return;
        }
        for i in 0..self.hash_funcs {
            let index = self.bit_index(i, data);
            self.data[index >> 3] |= 1 << (7 & index);
        }
        self.empty = false;
    }

    /// Check whether a data element matches.
    pub fn contains(&self, data: &[u8]) -> bool {
        if self.full {
            return true;
        }
        if self.empty || self.data.is_empty() {
            return false;
        }
        (0..self.hash_funcs).all(|i| {
            let index = self.bit_index(i, data);
            self.data[index >> 3] & (1 << (7 & index)) != 0
        })
    }

    /// Insert an outpoint.
    pub fn insert_outpoint(&mut self, outpoint: &OutPoint) {
        self.insert(&serialize(outpoint));
    }

    /// Check whether an outpoint matches.
    pub fn contains_outpoint(&self, outpoint: &OutPoint) -> bool {
        self.contains(&serialize(outpoint))
    }

    /// Recompute the all-zeroes / all-ones shortcuts.
    pub fn update_empty_full(&mut self) {
        self.full = self.data.iter().all(|b| *b == 0xff) && !self.data.is_empty();
        self.empty = self.data.iter().all(|b| *b == 0);
    }

    /// Check whether any of the transaction's elements match the filter,
    /// inserting outpoints of matching outputs according to the filter
    /// flags so that future spends of them also match.
    pub fn is_relevant_and_update(&mut self, tx: &Transaction) -> bool {
        if self.full {
            return true;
        }
        if self.empty {
            return false;
        }
        let txid = tx.txid();
        let mut found = self.contains(&txid[..]);

        for (vout, output) in tx.output.iter().enumerate() {
            for push in push_data(&output.script_pubkey) {
                if !self.contains(&push) {
                    continue;
                }
                found = true;

                let insert = match self.flags {
                    BloomFlags::All => true,
                    BloomFlags::PubkeyOnly => is_pubkey_script(&output.script_pubkey),
                    BloomFlags::None => false,
                };
                if insert {
                    self.insert_outpoint(&OutPoint {
                        txid,
                        vout: vout as u32,
                    });
                }
            }
        }
        if found {
            return true;
        }

        for input in &tx.input {
            if self.contains_outpoint(&input.previous_output) {
                return true;
            }
            for push in push_data(&input.script_sig) {
                if self.contains(&push) {
                    return true;
                }
            }
        }
        false
    }
}

fn push_data(script: &Script) -> Vec<Vec<u8>> {
    use bitcoin::blockdata::script::Instruction;

    script
        .instructions()
        .filter_map(|ins| match ins {
            Ok(Instruction::PushBytes(data)) if !data.is_empty() => Some(data.to_vec()),
            _ => None,
        })
        .collect()
}

fn is_pubkey_script(script: &Script) -> bool {
    use bitcoin::blockdata::opcodes::all::OP_CHECKMULTISIG;

    script.is_p2pk() || script.as_bytes().last() == Some(&OP_CHECKMULTISIG.to_u8())
}

/// MurmurHash3 (x86, 32-bit), the hash family mandated by BIP 37.
pub fn murmur3(seed: u32, data: &[u8]) -> u32 {
    const C1: u32 = 0xcc9e2d51;
    const C2: u32 = 0x1b873593;

    let mut h1 = seed;
    let blocks = data.len() / 4;

    for i in 0..blocks {
        let mut k1 = u32::from_le_bytes([
            data[i * 4],
            data[i * 4 + 1],
            data[i * 4 + 2],
            data[i * 4 + 3],
        ]);
        k1 = k1.wrapping_mul(C1).rotate_left(15).wrapping_mul(C2);
        h1 ^= k1;
        h1 = h1.rotate_left(13).wrapping_mul(5).wrapping_add(0xe6546b64);
    }

    let tail = &data[blocks * 4..];
    let mut k1: u32 = 0;

    if tail.len() >= 3 {
        k1 ^= (tail[2] as u32) << 16;
    }
    if tail.len() >= 2 {
        k1 ^= (tail[1] as u32) << 8;
    }
    if !tail.is_empty() {
        k1 ^= tail[0] as u32;
        k1 = k1.wrapping_mul(C1).rotate_left(15).wrapping_mul(C2);
        h1 ^= k1;
    }

    h1 ^= data.len() as u32;
    h1 ^= h1 >> 16;
    h1 = h1.wrapping_mul(0x85ebca6b);
    h1 ^= h1 >> 13;
    h1 = h1.wrapping_mul(0xc2b2ae35);
    h1 ^= h1 >> 16;
    h1
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hex(s: &str) -> Vec<u8> {
        (0..s.len())
            .step_by(2)
            .map(|i| u8::from_str_radix(&s[i..i + 2], 16).unwrap())
            .collect()
    }

    #[test]
    fn test_insert_contains() {
        let mut filter = BloomFilter::new(3, 0.01, 0, BloomFlags::All);

        filter.insert(&hex("99108ad8ed9bb6274d3980bab5a85c048f0950c8"));
        assert!(filter.contains(&hex("99108ad8ed9bb6274d3980bab5a85c048f0950c8")));
        assert!(!filter.contains(&hex("19108ad8ed9bb6274d3980bab5a85c048f0950c8")));

        filter.insert(&hex("b5a2c786d9ef4658287ced5914b37a1b4aa32eee"));
        filter.insert(&hex("b9300670b4c5366e95b2699e8b18bc75e5f729c5"));
        assert!(filter.contains(&hex("b5a2c786d9ef4658287ced5914b37a1b4aa32eee")));
        assert!(filter.contains(&hex("b9300670b4c5366e95b2699e8b18bc75e5f729c5")));

        assert_eq!(filter.data, hex("614e9b"));
        assert_eq!(filter.hash_funcs, 5);
    }

    #[test]
    fn test_insert_with_tweak() {
        let mut filter = BloomFilter::new(3, 0.01, 2147483649, BloomFlags::All);

        filter.insert(&hex("99108ad8ed9bb6274d3980bab5a85c048f0950c8"));
        filter.insert(&hex("b5a2c786d9ef4658287ced5914b37a1b4aa32eee"));
        filter.insert(&hex("b9300670b4c5366e95b2699e8b18bc75e5f729c5"));

        assert_eq!(filter.data, hex("ce4299"));
        assert_eq!(filter.hash_funcs, 5);
    }

    #[test]
    fn test_size_constraints() {
        let filter = BloomFilter::from(FilterLoad {
            filter: vec![0; MAX_BLOOM_FILTER_SIZE + 1],
            hash_funcs: 1,
            tweak: 0,
            flags: BloomFlags::All,
        });
        assert!(!filter.is_within_size_constraints());

        let filter = BloomFilter::from(FilterLoad {
            filter: vec![0; 100],
            hash_funcs: MAX_HASH_FUNCS + 1,
            tweak: 0,
            flags: BloomFlags::All,
        });
        assert!(!filter.is_within_size_constraints());
    }

    #[test]
    fn test_empty_and_full() {
        let mut filter = BloomFilter::from(FilterLoad {
            filter: vec![0xff; 4],
            hash_funcs: 3,
            tweak: 0,
            flags: BloomFlags::All,
        });
        filter.update_empty_full();
        assert!(filter.contains(b"anything"));

        let filter = BloomFilter::default();
        assert!(!filter.contains(b"anything"));
    }
}
