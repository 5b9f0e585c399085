//! The ownership-record (orec) table.
//!
//! An orec is a single 64-bit word doubling as a version and a lock: the
//! high bit clear means "unlocked, value is a version number"; the high
//! bit set means "locked, low bits name the owning descriptor's slot".
//! `GRAIN` addresses share one orec, trading false conflicts for table
//! size — the classic orec striping tradeoff.

use core::sync::atomic::{AtomicU64, Ordering};

/// Log2 of the number of address bytes one orec covers. Four low bits
/// (16-byte stripes) keeps collisions rare for typical scalar-sized
/// transactional objects without inflating the table.
pub const GRAIN: u32 = 4;

const LOCK_BIT: u64 = 1 << 63;

/// True if `word` encodes a held lock rather than a version.
#[inline]
pub const fn is_locked(word: u64) -> bool {
    word & LOCK_BIT != 0
}

/// The version encoded by an unlocked word.
#[inline]
pub const fn version(word: u64) -> u64 {
    word & !LOCK_BIT
}

/// The owning descriptor slot encoded by a locked word.
#[inline]
pub const fn owner_slot(word: u64) -> u32 {
    (word & !LOCK_BIT) as u32
}

/// The lock-token word for a descriptor holding slot `slot`.
#[inline]
pub const fn lock_token(slot: u32) -> u64 {
    LOCK_BIT | slot as u64
}

/// One ownership record: `curr` is the live version-or-lock word, `prev`
/// is scratch space the owner uses to stash the pre-acquisition version
/// (needed to restore it, bumped by one, on abort).
pub struct Orec {
    curr: AtomicU64,
    prev: AtomicU64,
}

impl Orec {
    /// A fresh, unlocked orec at version zero.
    pub const fn new() -> Self {
        Self {
            curr: AtomicU64::new(0),
            prev: AtomicU64::new(0),
        }
    }

    /// Read the current word.
    #[inline]
    pub fn load(&self, order: Ordering) -> u64 {
        self.curr.load(order)
    }

    /// Attempt to acquire the lock, succeeding only if the word is
    /// currently `expected` (an unlocked version). On success, stashes
    /// `expected` into `prev` before returning.
    #[inline]
    pub fn try_lock(&self, expected_version: u64, token: u64) -> Result<(), u64> {
        match self.curr.compare_exchange(
            expected_version,
            token,
            Ordering::AcqRel,
            Ordering::Acquire,
        ) {
            Ok(_) => {
                self.prev.store(expected_version, Ordering::Relaxed);
                Ok(())
            }
            Err(observed) => Err(observed),
        }
    }

    /// The version stashed at the most recent successful `try_lock`.
    #[inline]
    pub fn prev_version(&self) -> u64 {
        self.prev.load(Ordering::Relaxed)
    }

    /// Release the lock, publishing `new_version` (must have the lock
    /// bit clear). Used by a committing writer.
    #[inline]
    pub fn release(&self, new_version: u64) {
        debug_assert!(!is_locked(new_version));
        self.curr.store(new_version, Ordering::Release);
    }
}

impl Default for Orec {
    fn default() -> Self {
        Self::new()
    }
}

/// A fixed-size table of orecs, addressed by `(addr >> GRAIN) mod N`.
pub struct OrecTable<const N: usize> {
    orecs: [Orec; N],
}

impl<const N: usize> OrecTable<N> {
    /// Create a table with every orec unlocked at version zero.
    pub const fn new() -> Self {
        Self {
            orecs: [const { Orec::new() }; N],
        }
    }

    /// The orec covering `addr`.
    #[inline]
    pub fn get(&self, addr: usize) -> &Orec {
        &self.orecs[(addr >> GRAIN) % N]
    }

    /// Number of slots in the table.
    #[inline]
    pub const fn capacity(&self) -> usize {
        N
    }
}

impl<const N: usize> Default for OrecTable<N> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encode_decode_roundtrip() {
        let token = lock_token(7);
        assert!(is_locked(token));
        assert_eq!(owner_slot(token), 7);

        let ver = version(42);
        assert!(!is_locked(ver));
        assert_eq!(version(ver), 42);
    }

    #[test]
    fn try_lock_succeeds_on_matching_version() {
        let orec = Orec::new();
        assert!(orec.try_lock(0, lock_token(3)).is_ok());
        assert!(is_locked(orec.load(Ordering::Acquire)));
        assert_eq!(orec.prev_version(), 0);
    }

    #[test]
    fn try_lock_fails_on_mismatched_version() {
        let orec = Orec::new();
        orec.release(5);
        let result = orec.try_lock(0, lock_token(1));
        assert_eq!(result, Err(5));
    }

    #[test]
    fn release_publishes_new_version() {
        let orec = Orec::new();
        orec.try_lock(0, lock_token(2)).unwrap();
        orec.release(1);
        assert_eq!(version(orec.load(Ordering::Acquire)), 1);
    }

    #[test]
    fn table_hashes_nearby_addresses_together() {
        let table: OrecTable<16> = OrecTable::new();
        let a = table.get(0x1000) as *const Orec;
        let b = table.get(0x1001) as *const Orec;
        assert_eq!(a, b);
    }
}
