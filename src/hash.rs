//! The hash function seam.
//!
//! The store is generic over [`Hasher`] so the hash function travels with
//! the database: the key file records a random salt and a `pepper` derived
//! from it, and a build bound to a different hash function fails to open
//! with [`crate::Error::HashMismatch`] instead of silently misplacing keys.

use xxhash_rust::xxh64::Xxh64;

/// A seedable streaming 64-bit hash function.
pub trait Hasher {
    /// Construct a hasher from two 64-bit seeds.
    ///
    /// Implementations are free to ignore the second seed.
    fn new(seed0: u64, seed1: u64) -> Self;

    /// Feed bytes into the hash state.
    fn update(&mut self, bytes: &[u8]);

    /// Consume the hasher and produce the digest.
    fn finish(self) -> u64;
}

/// Hash `bytes` with a fresh `H` seeded by `salt`.
pub fn hash<H: Hasher>(bytes: &[u8], salt: u64) -> u64 {
    let mut h = H::new(salt, salt);
    h.update(bytes);
    h.finish()
}

/// The default hash function: XXH64.
#[derive(Clone)]
pub struct XxHasher {
    state: Xxh64,
}

impl Hasher for XxHasher {
    fn new(seed0: u64, _seed1: u64) -> Self {
        Self {
            state: Xxh64::new(seed0),
        }
    }

    fn update(&mut self, bytes: &[u8]) {
        self.state.update(bytes);
    }

    fn finish(self) -> u64 {
        self.state.digest()
    }
}
