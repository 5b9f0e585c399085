//! The bytelock table.
//!
//! A bytelock is a writer-slot word plus a byte-per-reader-slot array:
//! readers announce by writing their own byte, so a writer can scan for
//! "any reader present" without contending on a shared counter. This is
//! the substrate [`crate::core::tlrw`] builds its pessimistic two-phase
//! locking on.

use core::sync::atomic::{AtomicU32, AtomicU8, Ordering};

use crate::orec::GRAIN;

/// Maximum number of concurrently live transaction descriptors; also the
/// width of a bytelock's reader array.
pub const MAX_SLOTS: usize = 127;

/// One bytelock: `owner == 0` means free, `owner == slot + 1` means that
/// descriptor holds the write lock. `readers[i] != 0` announces that
/// slot `i` holds a read lock, independent of `owner`.
pub struct ByteLockRecord {
    owner: AtomicU32,
    readers: [AtomicU8; MAX_SLOTS],
}

impl ByteLockRecord {
    /// A free record with no readers.
    pub const fn new() -> Self {
        Self {
            owner: AtomicU32::new(0),
            readers: [const { AtomicU8::new(0) }; MAX_SLOTS],
        }
    }

    /// Announce a read lock for `slot`.
    #[inline]
    pub fn announce_reader(&self, slot: usize) {
        self.readers[slot].store(1, Ordering::Release);
    }

    /// Retract a previously announced read lock for `slot`.
    #[inline]
    pub fn retract_reader(&self, slot: usize) {
        self.readers[slot].store(0, Ordering::Release);
    }

    /// True if `slot` currently announces a read lock.
    #[inline]
    pub fn is_reader(&self, slot: usize) -> bool {
        self.readers[slot].load(Ordering::Acquire) != 0
    }

    /// The current writer-slot word: `0` for free, else `slot + 1`.
    #[inline]
    pub fn owner_word(&self) -> u32 {
        self.owner.load(Ordering::Acquire)
    }

    /// True if `slot` holds the write lock.
    #[inline]
    pub fn is_owner(&self, slot: usize) -> bool {
        self.owner_word() == slot as u32 + 1
    }

    /// Attempt to become the writer for this record.
    #[inline]
    pub fn try_acquire_write(&self, slot: usize) -> bool {
        self.owner
            .compare_exchange(0, slot as u32 + 1, Ordering::AcqRel, Ordering::Relaxed)
            .is_ok()
    }

    /// Release the write lock; must only be called by the current owner.
    #[inline]
    pub fn release_write(&self) {
        self.owner.store(0, Ordering::Release);
    }

    /// True if any slot other than `exclude` currently announces a
    /// reader — what a writer spins on before proceeding.
    pub fn has_other_reader(&self, exclude: usize) -> bool {
        self.readers
            .iter()
            .enumerate()
            .any(|(slot, byte)| slot != exclude && byte.load(Ordering::Acquire) != 0)
    }
}

impl Default for ByteLockRecord {
    fn default() -> Self {
        Self::new()
    }
}

/// A fixed-size table of bytelocks, addressed the same way as the orec
/// table (`(addr >> GRAIN) mod N`) so the two substrates can share a
/// striping scheme when a build composes both.
pub struct ByteLockTable<const N: usize> {
    records: [ByteLockRecord; N],
}

impl<const N: usize> ByteLockTable<N> {
    /// Create a table with every record free.
    pub const fn new() -> Self {
        Self {
            records: [const { ByteLockRecord::new() }; N],
        }
    }

    /// The bytelock covering `addr`.
    #[inline]
    pub fn get(&self, addr: usize) -> &ByteLockRecord {
        &self.records[(addr >> GRAIN) % N]
    }
}

impl<const N: usize> Default for ByteLockTable<N> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_lock_is_exclusive() {
        let rec = ByteLockRecord::new();
        assert!(rec.try_acquire_write(0));
        assert!(!rec.try_acquire_write(1));
        assert!(rec.is_owner(0));
        rec.release_write();
        assert!(rec.try_acquire_write(1));
    }

    #[test]
    fn reader_announcement_is_visible() {
        let rec = ByteLockRecord::new();
        assert!(!rec.is_reader(5));
        rec.announce_reader(5);
        assert!(rec.is_reader(5));
        assert!(rec.has_other_reader(0));
        assert!(!rec.has_other_reader(5));
        rec.retract_reader(5);
        assert!(!rec.is_reader(5));
    }

    #[test]
    fn table_hashes_nearby_addresses_together() {
        let table: ByteLockTable<16> = ByteLockTable::new();
        let a = table.get(0x2000) as *const ByteLockRecord;
        let b = table.get(0x2001) as *const ByteLockRecord;
        assert_eq!(a, b);
    }
}
