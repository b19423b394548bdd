use std::{collections::BTreeSet, hash::Hasher};

use siphasher::sip::SipHasher13;

const KEYS_A: (u64, u64) = (0x5bd1_e995_6b8b_4567, 0x3274_2e7a_f1c2_9d01);
const KEYS_B: (u64, u64) = (0x9e37_79b9_7f4a_7c15, 0xc2b2_ae3d_27d4_eb4f);

fn sip(keys: (u64, u64), value: &str) -> u64 {
    let mut hasher = SipHasher13::new_with_keys(keys.0, keys.1);
    hasher.write(value.as_bytes());
    hasher.finish()
}

/// Min-hash over `len` hash functions derived by double hashing,
/// `h_i(x) = h1(x) + i * h2(x)`.
#[derive(Debug, Clone, Copy)]
pub struct MinHasher {
    len: usize,
}

impl MinHasher {
    pub fn new(len: usize) -> Self {
        Self { len }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// An empty shingle set hashes to all `u64::MAX`, so empty texts match each other.
    pub fn signature(&self, shingles: &BTreeSet<String>) -> Vec<u64> {
        let mut sig = vec![u64::MAX; self.len];
        for shingle in shingles {
            let h1 = sip(KEYS_A, shingle);
            // Odd, so successive functions never collapse onto h1
            let h2 = sip(KEYS_B, shingle) | 1;
            for (i, slot) in sig.iter_mut().enumerate() {
                let h = h1.wrapping_add((i as u64).wrapping_mul(h2));
                if h < *slot {
                    *slot = h;
                }
            }
        }
        sig
    }
}

/// Fraction of positions where two signatures agree.
pub fn estimated_jaccard(a: &[u64], b: &[u64]) -> f64 {
    let len = a.len().min(b.len());
    if len == 0 {
        return 0.0;
    }
    let equal = a.iter().zip(b).filter(|(x, y)| x == y).count();
    equal as f64 / len as f64
}
