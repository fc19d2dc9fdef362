//! Bloom filter used for read-rate sampling and anti-spam throttling.
//!
//! INVARIANTS:
//! - INVARIANT-1: no false negatives. Once inserted, `contains` returns
//!   true until the filter is cleared. Read sampling may under-count
//!   distinct readers through false positives (acceptable for a heuristic
//!   trigger); the anti-spam filter may over-throttle but never lets a
//!   noted identity re-run verification.

use bitvec::prelude::*;
use std::io::Cursor;

/// k-hash bit-array probabilistic set.
#[derive(Clone, Debug)]
pub struct BloomFilter {
    bits: BitVec<u8, Lsb0>,
    /// Number of hash functions.
    k: usize,
    /// Size in bits.
    m: usize,
    /// Distinct elements observed (insertions that were not already present).
    distinct: usize,
    /// Rotation tweak; changing it re-randomizes positions after a clear.
    tweak: u32,
}

impl BloomFilter {
    /// Create a filter with explicit parameters.
    pub fn new(m: usize, k: usize) -> Self {
        Self {
            bits: bitvec![u8, Lsb0; 0; m],
            k,
            m,
            distinct: 0,
            tweak: 0,
        }
    }

    /// Create a filter sized for `expected` elements at `target_fpr`.
    pub fn with_capacity(expected: usize, target_fpr: f64) -> Self {
        let (m, k) = optimal_parameters(expected, target_fpr);
        Self::new(m, k)
    }

    /// Insert an element.
    ///
    /// Returns true if the element was not already present, i.e. this
    /// insertion was counted as a new distinct element. False positives
    /// make this an under-estimate, never an over-estimate.
    pub fn insert(&mut self, element: &[u8]) -> bool {
        let mut newly_set = false;
        for pos in self.positions(element) {
            if !self.bits[pos] {
                self.bits.set(pos, true);
                newly_set = true;
            }
        }
        if newly_set {
            self.distinct += 1;
        }
        newly_set
    }

    /// Whether the element might have been inserted.
    ///
    /// False positives possible, false negatives impossible (INVARIANT-1).
    pub fn contains(&self, element: &[u8]) -> bool {
        self.positions(element).into_iter().all(|pos| self.bits[pos])
    }

    /// Estimated number of distinct elements inserted since the last clear.
    pub fn distinct_estimate(&self) -> usize {
        self.distinct
    }

    /// Reset the filter and bump the rotation tweak.
    pub fn rotate(&mut self) {
        self.bits.fill(false);
        self.distinct = 0;
        self.tweak = self.tweak.wrapping_add(1);
    }

    /// Filter size in bits.
    pub fn size_bits(&self) -> usize {
        self.m
    }

    /// Double hashing: h(i) = h1 + i * h2, all positions mod m.
    fn positions(&self, element: &[u8]) -> Vec<usize> {
        let h1 = murmur64(element, self.tweak);
        let h2 = murmur64(element, self.tweak.wrapping_add(0x9E37_79B9));
        (0..self.k)
            .map(|i| {
                let hash = h1.wrapping_add((i as u64).wrapping_mul(h2));
                (hash % self.m as u64) as usize
            })
            .collect()
    }
}

/// MurmurHash3 x64 128-bit, lower 64 bits.
fn murmur64(element: &[u8], seed: u32) -> u64 {
    let mut cursor = Cursor::new(element);
    murmur3::murmur3_x64_128(&mut cursor, seed).unwrap_or(0) as u64
}

/// Optimal (m, k) for `n` expected elements at false-positive rate `p`.
///
/// m = -n ln p / (ln 2)^2, k = (m / n) ln 2.
pub fn optimal_parameters(n: usize, p: f64) -> (usize, usize) {
    let n = n.max(1) as f64;
    let p = p.clamp(1e-9, 0.5);
    let ln2 = std::f64::consts::LN_2;
    let m = (-(n * p.ln()) / (ln2 * ln2)).ceil().max(8.0) as usize;
    let k = ((m as f64 / n) * ln2).round().max(1.0) as usize;
    (m, k)
}
