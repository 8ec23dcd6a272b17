//! Collections used in `galena`.
//!
//! Hash maps keyed by attacker-controlled data use a keyed SipHash-2-4
//! hasher seeded from the node's random state, so that map iteration
//! order can neither be predicted nor forced into collisions.
use std::hash::Hash;
use std::mem;

use bitcoin::hashes::siphash24;

/// A `HashMap` which uses `fastrand::Rng` for its random state.
pub type HashMap<K, V> = std::collections::HashMap<K, V, RandomState>;

/// A `HashSet` which uses `fastrand::Rng` for its random state.
pub type HashSet<K> = std::collections::HashSet<K, RandomState>;

/// Hasher using SipHash-2-4.
#[derive(Default)]
pub struct Hasher {
    data: Vec<u8>,
    key1: u64,
    key2: u64,
}

impl std::hash::Hasher for Hasher {
    fn write(&mut self, bytes: &[u8]) {
        self.data.extend_from_slice(bytes)
    }

    fn finish(&self) -> u64 {
        siphash24::Hash::hash_with_keys(self.key1, self.key2, &self.data).as_u64()
    }
}

/// Random hasher state.
#[derive(Default, Clone)]
pub struct RandomState {
    key1: u64,
    key2: u64,
}

impl std::hash::BuildHasher for RandomState {
    type Hasher = Hasher;

    fn build_hasher(&self) -> Self::Hasher {
        Hasher {
            data: vec![],
            key1: self.key1,
            key2: self.key2,
        }
    }
}

impl From<fastrand::Rng> for RandomState {
    fn from(rng: fastrand::Rng) -> Self {
        Self {
            key1: rng.u64(..),
            key2: rng.u64(..),
        }
    }
}

/// A bounded membership set with approximate FIFO expiry.
///
/// Holds between `capacity / 2` and `capacity` of the most recently
/// inserted elements, dropping the oldest generation wholesale when the
/// bound is reached. Stands in for a rolling filter where exact
/// membership is wanted.
#[derive(Debug)]
pub struct RollingSet<T> {
    current: HashSet<T>,
    previous: HashSet<T>,
    generation: usize,
}

impl<T: Eq + Hash> RollingSet<T> {
    /// Create a new rolling set holding up to `capacity` elements.
    pub fn new(capacity: usize, rng: fastrand::Rng) -> Self {
        let generation = (capacity / 2).max(1);
        let state = RandomState::from(rng);

        Self {
            current: HashSet::with_hasher(state.clone()),
            previous: HashSet::with_hasher(state),
            generation,
        }
    }

    /// Insert an element. Returns `false` if it was already present.
    pub fn insert(&mut self, value: T) -> bool {
        if self.contains(&value) {
            return false;
        }
        if self.current.len() >= self.generation {
            self.previous = mem::take(&mut self.current);
        }
        self.current.insert(value)
    }

    /// Check whether an element is present.
    pub fn contains(&self, value: &T) -> bool {
        self.current.contains(value) || self.previous.contains(value)
    }

    /// Number of elements currently tracked.
    pub fn len(&self) -> usize {
        self.current.len() + self.previous.len()
    }

    /// Whether the set is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
