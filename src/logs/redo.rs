//! Redo log: a content-addressed write buffer.
//!
//! Chunked at `CHUNK_SIZE`-byte granularity per spec §3/§4.9: an
//! open-addressed hash from a chunk's base address to an index into a
//! growable vector of chunks, each chunk a `CHUNK_SIZE`-byte buffer plus
//! a per-byte validity mask. A scalar access is assumed not to straddle
//! a chunk boundary; that case is not supported.
//! "Fast-clear" bumps a generation counter rather than walking the index,
//! so the common "commit, then begin the next transaction" path touches
//! no per-entry state.

use alloc::vec::Vec;

use crate::minivec::MiniVec;

/// Bytes per chunk; must be a power of two and at least as wide as the
/// widest scalar access (8 bytes).
pub const CHUNK_SIZE: usize = 64;

const CHUNK_MASK: usize = CHUNK_SIZE - 1;

/// The result of a redo-log lookup: which bytes of the requested access
/// were found in the log, and their values.
#[derive(Debug, Clone, Copy)]
pub struct PartialRead {
    /// `bytes[i]` is valid (logged) iff bit `i` of `hit_mask` is set.
    pub bytes: [u8; 8],
    pub hit_mask: u8,
}

impl PartialRead {
    /// True if every requested byte was found in the log.
    #[inline]
    pub fn is_full_hit(&self, width: usize) -> bool {
        let want = if width >= 8 { 0xFFu8 } else { (1u8 << width) - 1 };
        self.hit_mask & want == want
    }

    /// Merge this partial hit with bytes freshly read from memory,
    /// producing the fully reconstructed little-endian value. This is
    /// spec §4.9's byte-mask reconstruction and the mechanism behind
    /// scenario 4 (partial-hit reconstruction).
    pub fn reconstruct(&self, width: usize, memory: &[u8]) -> [u8; 8] {
        let mut out = [0u8; 8];
        for i in 0..width {
            out[i] = if self.hit_mask & (1 << i) != 0 {
                self.bytes[i]
            } else {
                memory[i]
            };
        }
        out
    }
}

struct Chunk {
    base: usize,
    data: [u8; CHUNK_SIZE],
    mask: u64,
    generation: u32,
}

struct IndexSlot {
    base: usize,
    chunk: usize,
    generation: u32,
    occupied: bool,
}

/// A growable hash-indexed write buffer.
pub struct RedoLog {
    chunks: MiniVec<Chunk>,
    index: Vec<IndexSlot>,
    generation: u32,
    len_hint: usize,
}

impl RedoLog {
    const INITIAL_SLOTS: usize = 16;

    /// Create an empty redo log.
    pub fn new() -> Self {
        Self {
            chunks: MiniVec::new(),
            index: Self::fresh_index(Self::INITIAL_SLOTS),
            generation: 1,
            len_hint: 0,
        }
    }

    fn fresh_index(capacity: usize) -> Vec<IndexSlot> {
        (0..capacity)
            .map(|_| IndexSlot {
                base: 0,
                chunk: 0,
                generation: 0,
                occupied: false,
            })
            .collect()
    }

    #[inline]
    fn slot_for(base: usize, capacity: usize) -> usize {
        (base.wrapping_mul(0x9E37_79B9_7F4A_7C15) >> 16) as usize % capacity
    }

    fn find_chunk(&self, base: usize) -> Option<usize> {
        let capacity = self.index.len();
        let start = Self::slot_for(base, capacity);
        for probe in 0..capacity {
            let slot = &self.index[(start + probe) % capacity];
            if !slot.occupied || slot.generation != self.generation {
                return None;
            }
            if slot.base == base {
                return Some(slot.chunk);
            }
        }
        None
    }

    fn grow_index(&mut self) {
        let new_capacity = self.index.len() * 2;
        let mut new_index = Self::fresh_index(new_capacity);
        for slot in self.index.iter() {
            if slot.occupied && slot.generation == self.generation {
                let mut probe = Self::slot_for(slot.base, new_capacity);
                while new_index[probe].occupied {
                    probe = (probe + 1) % new_capacity;
                }
                new_index[probe] = IndexSlot {
                    base: slot.base,
                    chunk: slot.chunk,
                    generation: self.generation,
                    occupied: true,
                };
            }
        }
        self.index = new_index;
    }

    fn insert_chunk_index(&mut self, base: usize, chunk: usize) {
        if self.len_hint * 2 >= self.index.len() {
            self.grow_index();
        }
        let capacity = self.index.len();
        let mut probe = Self::slot_for(base, capacity);
        loop {
            let occupied_here =
                self.index[probe].occupied && self.index[probe].generation == self.generation;
            if !occupied_here {
                self.index[probe] = IndexSlot {
                    base,
                    chunk,
                    generation: self.generation,
                    occupied: true,
                };
                self.len_hint += 1;
                return;
            }
            if self.index[probe].base == base {
                self.index[probe].chunk = chunk;
                return;
            }
            probe = (probe + 1) % capacity;
        }
    }

    fn chunk_for_mut(&mut self, base: usize) -> usize {
        if let Some(idx) = self.find_chunk(base) {
            return idx;
        }
        let chunk_idx = self.chunks.len();
        self.chunks.push(Chunk {
            base,
            data: [0u8; CHUNK_SIZE],
            mask: 0,
            generation: self.generation,
        });
        self.insert_chunk_index(base, chunk_idx);
        chunk_idx
    }

    /// Insert `width` bytes of `value` (little-endian) at `addr`.
    ///
    /// # Panics
    ///
    /// Panics if the access straddles a `CHUNK_SIZE` boundary; callers
    /// must only log aligned scalar accesses (spec §4.9).
    pub fn insert(&mut self, addr: usize, width: usize, value: u64) {
        debug_assert!(width <= 8);
        let base = addr & !CHUNK_MASK;
        let offset = addr & CHUNK_MASK;
        assert!(
            offset + width <= CHUNK_SIZE,
            "redo log write straddles a chunk boundary"
        );

        let chunk_idx = self.chunk_for_mut(base);
        let bytes = value.to_le_bytes();
        let chunk = &mut self.chunks.as_mut_slice()[chunk_idx];
        for i in 0..width {
            chunk.data[offset + i] = bytes[i];
            chunk.mask |= 1 << (offset + i);
        }
    }

    /// Look up `width` bytes starting at `addr`. Returns `None` on a full
    /// miss (no chunk covers `addr` at all).
    pub fn lookup(&self, addr: usize, width: usize) -> Option<PartialRead> {
        debug_assert!(width <= 8);
        let base = addr & !CHUNK_MASK;
        let offset = addr & CHUNK_MASK;
        let chunk_idx = self.find_chunk(base)?;
        let chunk = &self.chunks.as_slice()[chunk_idx];
        if chunk.generation != self.generation {
            return None;
        }

        let mut bytes = [0u8; 8];
        let mut hit_mask = 0u8;
        for i in 0..width {
            if chunk.mask & (1 << (offset + i)) != 0 {
                bytes[i] = chunk.data[offset + i];
                hit_mask |= 1 << i;
            }
        }
        if hit_mask == 0 {
            return None;
        }
        Some(PartialRead { bytes, hit_mask })
    }

    /// Apply every logged chunk to memory via `write_range`, called once
    /// per maximal contiguous run of valid bytes within a chunk.
    pub fn writeback(&self, mut write_range: impl FnMut(usize, &[u8])) {
        for chunk in self.chunks.as_slice() {
            if chunk.generation != self.generation {
                continue;
            }
            let mut i = 0usize;
            while i < CHUNK_SIZE {
                if chunk.mask & (1 << i) == 0 {
                    i += 1;
                    continue;
                }
                let run_start = i;
                while i < CHUNK_SIZE && chunk.mask & (1 << i) != 0 {
                    i += 1;
                }
                write_range(chunk.base + run_start, &chunk.data[run_start..i]);
            }
        }
    }

    /// Fast-clear: invalidate every entry by bumping the generation
    /// counter, without walking the index or the chunk vector.
    #[inline]
    pub fn clear(&mut self) {
        self.generation = self.generation.wrapping_add(1).max(1);
        self.chunks.clear();
        self.len_hint = 0;
    }

    /// Number of distinct chunks currently logged.
    #[inline]
    pub fn chunk_count(&self) -> usize {
        self.chunks.len()
    }

    /// Base addresses of every chunk touched in the current generation, in
    /// insertion order. Commit-time lock acquisition walks this to find
    /// which orecs/bytelocks must be locked before writeback.
    pub fn chunk_bases(&self) -> impl Iterator<Item = usize> + '_ {
        self.chunks
            .as_slice()
            .iter()
            .filter(move |c| c.generation == self.generation)
            .map(|c| c.base)
    }

    /// True if nothing has been written in the current generation.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }
}

impl Default for RedoLog {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::vec::Vec;

    #[test]
    fn full_miss_returns_none() {
        let log = RedoLog::new();
        assert!(log.lookup(0x1000, 4).is_none());
    }

    #[test]
    fn full_hit_roundtrips() {
        let mut log = RedoLog::new();
        log.insert(0x1000, 4, 0xDEAD_BEEF);
        let hit = log.lookup(0x1000, 4).unwrap();
        assert!(hit.is_full_hit(4));
        assert_eq!(u32::from_le_bytes(hit.bytes[..4].try_into().unwrap()), 0xDEAD_BEEF);
    }

    #[test]
    fn partial_hit_reconstructs_from_memory() {
        // Scenario 4: write a u8 at `a`, then read a u32 at `a-3` where
        // a-3..a-1 are unchanged memory {0xAA,0xBB,0xCC} and a holds 0xDD.
        let mut log = RedoLog::new();
        let a: usize = 16;
        log.insert(a, 1, 0xDD);

        let hit = log.lookup(a - 3, 4).unwrap();
        assert!(!hit.is_full_hit(4));
        let memory = [0xAAu8, 0xBB, 0xCC, 0x00];
        let reconstructed = hit.reconstruct(4, &memory);
        let value = u32::from_le_bytes(reconstructed[..4].try_into().unwrap());
        assert_eq!(value, 0xDDCC_BBAA);
    }

    #[test]
    fn overwrite_same_address_keeps_latest() {
        let mut log = RedoLog::new();
        log.insert(0x40, 4, 1);
        log.insert(0x40, 4, 2);
        let hit = log.lookup(0x40, 4).unwrap();
        assert_eq!(u32::from_le_bytes(hit.bytes[..4].try_into().unwrap()), 2);
    }

    #[test]
    fn clear_invalidates_without_dropping_capacity() {
        let mut log = RedoLog::new();
        log.insert(0x40, 4, 1);
        log.clear();
        assert!(log.lookup(0x40, 4).is_none());
        assert!(log.is_empty());
    }

    #[test]
    fn writeback_emits_contiguous_runs() {
        let mut log = RedoLog::new();
        log.insert(0, 1, 0xAA);
        log.insert(1, 1, 0xBB);
        log.insert(10, 1, 0xCC);

        let mut runs: Vec<(usize, Vec<u8>)> = Vec::new();
        log.writeback(|addr, bytes| runs.push((addr, bytes.to_vec())));

        assert_eq!(runs.len(), 2);
        assert_eq!(runs[0], (0, alloc::vec![0xAA, 0xBB]));
        assert_eq!(runs[1], (10, alloc::vec![0xCC]));
    }

    #[test]
    fn grows_past_initial_index_capacity() {
        let mut log = RedoLog::new();
        for i in 0..200usize {
            log.insert(i * CHUNK_SIZE, 1, i as u64);
        }
        for i in 0..200usize {
            let hit = log.lookup(i * CHUNK_SIZE, 1).unwrap();
            assert_eq!(hit.bytes[0] as usize, i % 256);
        }
    }
}
