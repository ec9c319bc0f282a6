//! Byte hashing: an Adler-32 style checksum followed by a bit-spreading
//! rehash step.
//!
//! Raw Adler sums cluster badly for short or similar inputs (small integers,
//! short strings), so every code is passed through [`rehash`] before it is
//! used to select a bucket.

use core::hash::{BuildHasher, Hasher};

const MOD_ADLER: u32 = 65521;

/// Spreads the entropy of `x` into the low bits used for bucket selection.
#[inline]
pub fn rehash(mut x: u32) -> u32 {
    x ^= (x >> 20) ^ (x >> 12);
    x ^ (x >> 7) ^ (x >> 4)
}

/// Folds a 64-bit code into 32 bits and rehashes it.
#[inline]
pub fn rehash64(x: u64) -> u32 {
    rehash(((x >> 32) as u32) ^ (x as u32))
}

/// Hashes a byte span into a well-distributed 32-bit code.
pub fn hash_bytes(bytes: &[u8]) -> u32 {
    let mut h = BytesHasher::default();
    h.write(bytes);
    h.code()
}

/// Streaming form of [`hash_bytes`]: accumulators carry across `write` calls.
#[derive(Debug, Clone, Copy)]
pub struct BytesHasher {
    a: u32,
    b: u32,
}

impl Default for BytesHasher {
    fn default() -> Self {
        Self { a: 1, b: 0 }
    }
}

impl BytesHasher {
    /// The rehashed 32-bit code for everything written so far.
    #[inline]
    pub fn code(&self) -> u32 {
        rehash((self.b << 16) | self.a)
    }
}

impl Hasher for BytesHasher {
    fn write(&mut self, bytes: &[u8]) {
        let (mut a, mut b) = (self.a, self.b);
        for &byte in bytes {
            a = (a + byte as u32) % MOD_ADLER;
            b = (b + a) % MOD_ADLER;
        }
        self.a = a;
        self.b = b;
    }

    #[inline]
    fn finish(&self) -> u64 {
        self.code() as u64
    }
}

/// Default `BuildHasher` of `HashTable` and `ExpiringMap`.
#[derive(Debug, Clone, Copy, Default)]
pub struct BytesHashBuilder;

impl BuildHasher for BytesHashBuilder {
    type Hasher = BytesHasher;

    #[inline]
    fn build_hasher(&self) -> BytesHasher {
        BytesHasher::default()
    }
}
