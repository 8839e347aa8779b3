//! A growable bump allocator holding key/value bytes between insert and
//! commit.
//!
//! Allocation appends into fixed-size chunks; `clear` moves exhausted
//! chunks onto a free list instead of returning them to the allocator, so
//! a store that commits at a steady rate stops allocating entirely.

/// A handle to bytes stored in an [`Arena`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ArenaRef {
    chunk: usize,
    off: usize,
    len: usize,
}

impl ArenaRef {
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

struct Chunk {
    buf: Box<[u8]>,
    used: usize,
}

impl Chunk {
    fn new(size: usize) -> Self {
        Self {
            buf: vec![0u8; size].into_boxed_slice(),
            used: 0,
        }
    }

    fn room(&self) -> usize {
        self.buf.len() - self.used
    }
}

pub struct Arena {
    chunk_size: usize,
    chunks: Vec<Chunk>,
    free: Vec<Box<[u8]>>,
}

impl Arena {
    pub fn new(chunk_size: usize) -> Self {
        Self::with_spare(chunk_size, Vec::new())
    }

    /// Construct an arena that draws from `spare` buffers before
    /// allocating new chunks.
    pub fn with_spare(chunk_size: usize, spare: Vec<Box<[u8]>>) -> Self {
        Self {
            chunk_size: chunk_size.max(1),
            chunks: Vec::new(),
            free: spare,
        }
    }

    /// Copy `bytes` into the arena.
    pub fn insert(&mut self, bytes: &[u8]) -> ArenaRef {
        let need = bytes.len();
        let fits_last = self
            .chunks
            .last()
            .is_some_and(|c| c.room() >= need);
        if !fits_last {
            // Oversized allocations get a dedicated chunk.
            let size = self.chunk_size.max(need);
            let buf = match self.free.pop() {
                Some(buf) if buf.len() >= need => buf,
                Some(buf) => {
                    self.free.push(buf);
                    vec![0u8; size].into_boxed_slice()
                }
                None => vec![0u8; size].into_boxed_slice(),
            };
            self.chunks.push(Chunk { buf, used: 0 });
        }
        let chunk = self.chunks.len() - 1;
        let c = self.chunks.last_mut().unwrap();
        let off = c.used;
        c.buf[off..off + need].copy_from_slice(bytes);
        c.used += need;
        ArenaRef {
            chunk,
            off,
            len: need,
        }
    }

    pub fn get(&self, r: ArenaRef) -> &[u8] {
        &self.chunks[r.chunk].buf[r.off..r.off + r.len]
    }

    /// Drop all allocations, keeping the chunk buffers for reuse.
    pub fn clear(&mut self) {
        for chunk in self.chunks.drain(..) {
            self.free.push(chunk.buf);
        }
    }

    /// Give up the reusable chunk buffers.
    pub fn into_spare(mut self) -> Vec<Box<[u8]>> {
        self.clear();
        self.free
    }
}
