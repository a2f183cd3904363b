//! Bloom filter summaries for "what do you already have" exchanges
//!
//! The bit array is split into `num_partitions` equal contiguous ranges and
//! each key sets exactly one bit per range. Bit offsets are taken directly
//! from the key's identity bytes, so filters built on different devices and
//! builds agree bit for bit. Identities are random, which makes their bytes
//! already well distributed.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use tidal_index::{Did, Oid, Sid, UNIQUE_ID_LEN};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BloomError {
    #[error("Bloom filter needs at least one partition and one bit per partition")]
    Empty,

    #[error("Bit length {bit_length} is not divisible into {num_partitions} partitions")]
    UnevenPartitions {
        bit_length: usize,
        num_partitions: usize,
    },

    #[error("Expected {expected} words of bits, got {actual}")]
    WordCount { expected: usize, actual: usize },

    #[error("Cannot combine filters with parameters {left:?} and {right:?}")]
    ParameterMismatch {
        left: (usize, usize),
        right: (usize, usize),
    },
}

/// Keys that can be summarised
pub trait BloomKey {
    fn identity_bytes(&self) -> &[u8; UNIQUE_ID_LEN];
}

impl BloomKey for Oid {
    fn identity_bytes(&self) -> &[u8; UNIQUE_ID_LEN] {
        self.as_bytes()
    }
}

impl BloomKey for Sid {
    fn identity_bytes(&self) -> &[u8; UNIQUE_ID_LEN] {
        self.as_bytes()
    }
}

impl BloomKey for Did {
    fn identity_bytes(&self) -> &[u8; UNIQUE_ID_LEN] {
        self.as_bytes()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "RawBloomFilter")]
pub struct BloomFilter {
    words: Vec<u64>,
    bit_length: usize,
    num_partitions: usize,
}

/// Wire form of a filter, checked before it becomes a [`BloomFilter`]
#[derive(Deserialize)]
struct RawBloomFilter {
    words: Vec<u64>,
    bit_length: usize,
    num_partitions: usize,
}

impl TryFrom<RawBloomFilter> for BloomFilter {
    type Error = BloomError;

    fn try_from(raw: RawBloomFilter) -> Result<Self, Self::Error> {
        let mut filter = BloomFilter::new(raw.bit_length, raw.num_partitions)?;
        if raw.words.len() != filter.words.len() {
            return Err(BloomError::WordCount {
                expected: filter.words.len(),
                actual: raw.words.len(),
            });
        }
        filter.words = raw.words;
        Ok(filter)
    }
}

impl BloomFilter {
    /// Default size used for object summaries
    pub const DEFAULT_BIT_LENGTH: usize = 8192;
    pub const DEFAULT_PARTITIONS: usize = 4;

    pub fn new(bit_length: usize, num_partitions: usize) -> Result<Self, BloomError> {
        if num_partitions == 0 || bit_length < num_partitions {
            return Err(BloomError::Empty);
        }
        if bit_length % num_partitions != 0 {
            return Err(BloomError::UnevenPartitions {
                bit_length,
                num_partitions,
            });
        }

        Ok(Self {
            words: vec![0; (bit_length + 63) / 64],
            bit_length,
            num_partitions,
        })
    }

    pub fn bit_length(&self) -> usize {
        self.bit_length
    }

    pub fn num_partitions(&self) -> usize {
        self.num_partitions
    }

    fn partition_size(&self) -> usize {
        self.bit_length / self.num_partitions
    }

    /// Bit selected in `partition` for a key
    ///
    /// Reads four little-endian bytes starting at a per-partition offset,
    /// wrapping around the identity. The start shifts by one extra byte every
    /// four partitions so that more than four partitions still see different
    /// windows.
    fn bit_index(&self, key: &[u8; UNIQUE_ID_LEN], partition: usize) -> usize {
        let start = (4 * partition + partition / 4) % UNIQUE_ID_LEN;
        let mut window = [0u8; 4];
        for (i, byte) in window.iter_mut().enumerate() {
            *byte = key[(start + i) % UNIQUE_ID_LEN];
        }
        let offset = u32::from_le_bytes(window) as usize % self.partition_size();
        partition * self.partition_size() + offset
    }

    fn is_set(&self, bit: usize) -> bool {
        self.words[bit / 64] & (1u64 << (bit % 64)) != 0
    }

    pub fn add<K: BloomKey + ?Sized>(&mut self, key: &K) {
        let bytes = key.identity_bytes();
        for partition in 0..self.num_partitions {
            let bit = self.bit_index(bytes, partition);
            self.words[bit / 64] |= 1u64 << (bit % 64);
        }
    }

    /// May report keys that were never added, never misses one that was
    pub fn contains<K: BloomKey + ?Sized>(&self, key: &K) -> bool {
        let bytes = key.identity_bytes();
        (0..self.num_partitions).all(|partition| self.is_set(self.bit_index(bytes, partition)))
    }

    /// Fold `other` into this filter
    pub fn union(&mut self, other: &BloomFilter) -> Result<(), BloomError> {
        if self.bit_length != other.bit_length
            || self.num_partitions != other.num_partitions
            || self.words.len() != other.words.len()
        {
            return Err(BloomError::ParameterMismatch {
                left: (self.bit_length, self.num_partitions),
                right: (other.bit_length, other.num_partitions),
            });
        }
        for (mine, theirs) in self.words.iter_mut().zip(&other.words) {
            *mine |= *theirs;
        }
        Ok(())
    }

    pub fn is_empty(&self) -> bool {
        self.words.iter().all(|word| *word == 0)
    }

    /// Number of set bits
    pub fn popcount(&self) -> u32 {
        self.words.iter().map(|word| word.count_ones()).sum()
    }
}

impl Default for BloomFilter {
    fn default() -> Self {
        Self {
            words: vec![0; Self::DEFAULT_BIT_LENGTH / 64],
            bit_length: Self::DEFAULT_BIT_LENGTH,
            num_partitions: Self::DEFAULT_PARTITIONS,
        }
    }
}
