//------------------------------------------

/// How a chunk's payload should be interpreted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Allocation {
    /// Payload bytes are present.
    Data,
    /// Payload absent, implicitly zero.
    Hole,
    /// Payload absent, implicitly zero but semantically "allocated"
    /// (distinguished from `Hole` so a restore can re-allocate rather than
    /// discard the range).
    Alloc,
}

/// The archive's unit of content-addressable storage: either fresh bytes read
/// from the device, or a zero-filled range that needn't be stored.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chunk {
    pub allocation: Allocation,
    pub size: usize,
    pub payload: Option<Vec<u8>>,
}

impl Chunk {
    pub fn data(payload: Vec<u8>) -> Chunk {
        Chunk {
            allocation: Allocation::Data,
            size: payload.len(),
            payload: Some(payload),
        }
    }

    pub fn hole(size: usize) -> Chunk {
        Chunk {
            allocation: Allocation::Hole,
            size,
            payload: None,
        }
    }

    pub fn alloc(size: usize) -> Chunk {
        Chunk {
            allocation: Allocation::Alloc,
            size,
            payload: None,
        }
    }

    /// Splits this chunk at `at` bytes, returning `(head, tail)` where
    /// `head.size == at`. Both halves carry the original allocation; `Data`
    /// payloads are sliced accordingly.
    pub fn split_at(&self, at: usize) -> (Chunk, Chunk) {
        assert!(at <= self.size);
        match (&self.allocation, &self.payload) {
            (Allocation::Data, Some(p)) => {
                let head = Chunk::data(p[..at].to_vec());
                let tail = Chunk::data(p[at..].to_vec());
                (head, tail)
            }
            (Allocation::Hole, None) => (Chunk::hole(at), Chunk::hole(self.size - at)),
            (Allocation::Alloc, None) => (Chunk::alloc(at), Chunk::alloc(self.size - at)),
            _ => unreachable!("Data chunk must carry a payload"),
        }
    }

    /// Bytes this chunk contributes to the reconstructed volume image:
    /// the payload itself, or `size` zero bytes for `Hole`/`Alloc`.
    pub fn decode(&self) -> Vec<u8> {
        match &self.payload {
            Some(p) => p.clone(),
            None => vec![0u8; self.size],
        }
    }
}

//------------------------------------------

/// An opaque pointer into the repository's chunk store, preserving dedup
/// identity. Payload bytes are not held here; they're fetched on demand
/// through a `ChunkFetcher`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ChunkRef {
    pub id: u64,
    pub size: usize,
}

impl ChunkRef {
    pub fn new(id: u64, size: usize) -> ChunkRef {
        ChunkRef { id, size }
    }
}

//------------------------------------------

/// One item of an aligned stream: either a chunk (or forwarded `ChunkRef`)
/// belonging to the segment currently open, or the sentinel that closes it.
///
/// Kept as a single sum type rather than a separate "end of segment" signal
/// channel, per the iterator-composition design: `End` is just another
/// variant consumers pattern-match on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AlignedItem {
    Chunk(Chunk),
    Ref(ChunkRef),
    End,
}

//------------------------------------------
