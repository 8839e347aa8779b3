//! The pending-insert set.
//!
//! Two pools exist at runtime: `p0` accumulates new inserts and `p1`
//! holds the batch currently being persisted. Both are only ever touched
//! under the store mutex; the commit thread reads a swapped-out pool
//! without the lock, which is safe because nothing mutates a pool while
//! it is being persisted.

use std::collections::HashMap;

use crate::arena::{Arena, ArenaRef};

struct PoolEntry {
    key: ArenaRef,
    value: ArenaRef,
}

pub struct Pool {
    arena: Arena,
    // Keyed by key hash; collisions are resolved by key compare.
    map: HashMap<u64, Vec<PoolEntry>>,
    count: usize,
    data_size: u64,
}

impl Pool {
    pub fn new(chunk_size: usize) -> Self {
        Self::with_spare(chunk_size, Vec::new())
    }

    pub fn with_spare(chunk_size: usize, spare: Vec<Box<[u8]>>) -> Self {
        Self {
            arena: Arena::with_spare(chunk_size, spare),
            map: HashMap::new(),
            count: 0,
            data_size: 0,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    pub fn count(&self) -> usize {
        self.count
    }

    /// Bytes of key and value payload held.
    pub fn data_size(&self) -> u64 {
        self.data_size
    }

    /// Add a pair. The caller has already established the key is absent.
    pub fn insert(&mut self, hash: u64, key: &[u8], value: &[u8]) {
        let key_ref = self.arena.insert(key);
        let value_ref = self.arena.insert(value);
        self.map.entry(hash).or_default().push(PoolEntry {
            key: key_ref,
            value: value_ref,
        });
        self.count += 1;
        self.data_size += (key.len() + value.len()) as u64;
    }

    pub fn find(&self, hash: u64, key: &[u8]) -> Option<&[u8]> {
        self.map
            .get(&hash)?
            .iter()
            .find(|e| self.arena.get(e.key) == key)
            .map(|e| self.arena.get(e.value))
    }

    /// All entries as (hash, key, value), in no particular order.
    pub fn entries(&self) -> Vec<(u64, &[u8], &[u8])> {
        let mut out = Vec::with_capacity(self.count);
        for (&hash, entries) in &self.map {
            for e in entries {
                out.push((hash, self.arena.get(e.key), self.arena.get(e.value)));
            }
        }
        out
    }

    /// Tear down, handing back the arena chunks for reuse.
    pub fn into_spare(self) -> Vec<Box<[u8]>> {
        self.arena.into_spare()
    }
}
