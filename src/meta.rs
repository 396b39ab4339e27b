// Copyright 2020 Graydon Hoare <graydon@pobox.com>
// Licensed under the MIT and Apache-2.0 licenses.

//! Every row carries a single 64-bit metadata word holding its write lock
//! and its two logical timestamps. The word is the _only_ point of
//! inter-worker synchronization on a row, so all of the commit protocol's
//! atomicity obligations reduce to loads, stores and compare-and-swaps on
//! it.
//!
//! Layout:
//!
//! ```text
//!   bit  63      : write-lock bit
//!   bits 62..32  : rts, the read timestamp (31 bits)
//!   bits 31..0   : wts, the write timestamp (32 bits)
//! ```
//!
//! `wts` is the commit time of the version currently stored in the row;
//! `rts` is the latest commit time at which the version is known to have
//! been read. Together they form a lease: a read at time `t` is
//! serializable against this version iff `wts <= t <= rts`, and `rts` may
//! be extended forward by any reader as long as no writer holds the lock.
//!
//! Timestamps wider than the packed fields are truncated on store; the
//! engine does not handle wts overflow.

use std::sync::atomic::{AtomicU64, Ordering};

const LOCK_BIT: u64 = 1 << 63;
const RTS_MASK: u64 = 0x7fff_ffff;
const WTS_MASK: u64 = 0xffff_ffff;

/// Extract the write timestamp from a metadata word.
pub fn wts(word: u64) -> u64 {
    word & WTS_MASK
}

/// Extract the read timestamp from a metadata word.
pub fn rts(word: u64) -> u64 {
    (word >> 32) & RTS_MASK
}

/// True if the write-lock bit is set.
pub fn is_locked(word: u64) -> bool {
    word & LOCK_BIT != 0
}

/// Return `word` with its wts field replaced.
pub fn with_wts(word: u64, wts: u64) -> u64 {
    (word & !WTS_MASK) | (wts & WTS_MASK)
}

/// Return `word` with its rts field replaced.
pub fn with_rts(word: u64, rts: u64) -> u64 {
    (word & !(RTS_MASK << 32)) | ((rts & RTS_MASK) << 32)
}

/// Return `word` with the lock bit cleared.
pub fn strip_lock(word: u64) -> u64 {
    word & !LOCK_BIT
}

/// Attempt to acquire the row's write lock with a single compare-and-swap.
/// Returns the pre-lock word that was observed and whether the acquisition
/// succeeded. Never spins: a row already locked (or a lost CAS race) is a
/// failure, and the caller aborts rather than waits.
pub fn try_lock(meta: &AtomicU64) -> (u64, bool) {
    let observed = meta.load(Ordering::Acquire);
    if is_locked(observed) {
        return (strip_lock(observed), false);
    }
    match meta.compare_exchange(
        observed,
        observed | LOCK_BIT,
        Ordering::AcqRel,
        Ordering::Acquire,
    ) {
        Ok(_) => (observed, true),
        Err(actual) => (strip_lock(actual), false),
    }
}

/// Spinning acquire, used only off the critical commit path (applying a
/// replicated version, where the holder is another committer that is about
/// to release). Returns the pre-lock word.
pub fn lock(meta: &AtomicU64) -> u64 {
    loop {
        let (observed, ok) = try_lock(meta);
        if ok {
            return observed;
        }
        std::hint::spin_loop();
    }
}

/// Install a freshly committed version: lock bit clear, wts = rts =
/// `new_wts`. The new version has been written at `new_wts` and read by
/// nobody later than that yet.
pub fn unlock(meta: &AtomicU64, new_wts: u64) {
    let word = with_rts(with_wts(0, new_wts), new_wts);
    meta.store(word, Ordering::Release);
}

/// Drop the lock without installing a version, preserving wts and rts.
/// Used when a transaction aborts after locking.
pub fn release(meta: &AtomicU64) {
    meta.fetch_and(!LOCK_BIT, Ordering::Release);
}

/// Validate a read taken at `snapshot` against the row's current word, for
/// a transaction committing at `commit_ts`.
///
/// Success means the read is serializable at `commit_ts`, and yields the
/// word the row held at the validation instant (lock bit stripped) so the
/// caller can detect a permissible wts advance and refresh its snapshot.
/// Failure (`None`) means the version the transaction read cannot be
/// ordered before `commit_ts`:
///
///   - the row is locked by a writer, or
///   - the row's wts advanced beyond `commit_ts`.
///
/// A wts advance that stays at or below `commit_ts` is permissible: the
/// newer version is still the one visible at `commit_ts`, and the read is
/// re-pointed at it. On success the version's read lease is extended to
/// `commit_ts` by CAS; the loop retries only on CAS races with other
/// lease-extending readers.
pub fn validate_read(meta: &AtomicU64, snapshot: u64, commit_ts: u64) -> Option<u64> {
    debug_assert!(!is_locked(snapshot));
    loop {
        let current = meta.load(Ordering::Acquire);
        if wts(current) != wts(snapshot) {
            if is_locked(current) || wts(current) > commit_ts {
                return None;
            }
        } else if rts(current) >= commit_ts {
            return Some(strip_lock(current));
        } else if is_locked(current) {
            // The lease would need extending, but the lock holder is about
            // to supersede this version.
            return None;
        }
        let extended = with_rts(current, rts(current).max(commit_ts));
        if extended == current {
            return Some(strip_lock(current));
        }
        if meta
            .compare_exchange(current, extended, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            return Some(strip_lock(extended));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pack_unpack() {
        let word = with_rts(with_wts(0, 7), 9);
        assert_eq!(wts(word), 7);
        assert_eq!(rts(word), 9);
        assert!(!is_locked(word));
        assert!(is_locked(word | LOCK_BIT));
        assert_eq!(strip_lock(word | LOCK_BIT), word);
    }

    #[test]
    fn field_truncation() {
        let word = with_wts(0, u64::MAX);
        assert_eq!(wts(word), WTS_MASK);
        let word = with_rts(0, u64::MAX);
        assert_eq!(rts(word), RTS_MASK);
        assert!(!is_locked(word));
    }

    #[test]
    fn try_lock_is_exclusive() {
        let meta = AtomicU64::new(with_wts(0, 3));
        let (observed, ok) = try_lock(&meta);
        assert!(ok);
        assert_eq!(wts(observed), 3);
        let (_, ok) = try_lock(&meta);
        assert!(!ok);
        release(&meta);
        let (_, ok) = try_lock(&meta);
        assert!(ok);
    }

    #[test]
    fn unlock_installs_version() {
        let meta = AtomicU64::new(with_rts(with_wts(0, 3), 5));
        let (_, ok) = try_lock(&meta);
        assert!(ok);
        unlock(&meta, 8);
        let word = meta.load(Ordering::Acquire);
        assert!(!is_locked(word));
        assert_eq!(wts(word), 8);
        assert_eq!(rts(word), 8);
    }

    #[test]
    fn release_preserves_word() {
        let before = with_rts(with_wts(0, 3), 5);
        let meta = AtomicU64::new(before);
        let (_, ok) = try_lock(&meta);
        assert!(ok);
        release(&meta);
        assert_eq!(meta.load(Ordering::Acquire), before);
    }

    #[test]
    fn validate_same_version_extends_lease() {
        let snapshot = with_rts(with_wts(0, 3), 3);
        let meta = AtomicU64::new(snapshot);
        let word = validate_read(&meta, snapshot, 10).expect("validates");
        assert_eq!(wts(word), 3);
        assert_eq!(rts(word), 10);
        assert_eq!(rts(meta.load(Ordering::Acquire)), 10);
    }

    #[test]
    fn validate_permissible_advance_refreshes() {
        let snapshot = with_rts(with_wts(0, 3), 3);
        let meta = AtomicU64::new(with_rts(with_wts(0, 6), 6));
        let word = validate_read(&meta, snapshot, 10).expect("refreshes");
        assert_eq!(wts(word), 6);
        assert_eq!(rts(word), 10);
    }

    #[test]
    fn validate_fails_past_commit_ts() {
        let snapshot = with_rts(with_wts(0, 3), 3);
        let meta = AtomicU64::new(with_rts(with_wts(0, 12), 12));
        assert!(validate_read(&meta, snapshot, 10).is_none());
    }

    #[test]
    fn validate_fails_when_locked() {
        let snapshot = with_rts(with_wts(0, 3), 3);
        let meta = AtomicU64::new(snapshot);
        let (_, ok) = try_lock(&meta);
        assert!(ok);
        assert!(validate_read(&meta, snapshot, 10).is_none());
        release(&meta);
        // With the lock gone but no wts change and rts already covering
        // commit_ts, validation passes without a CAS.
        assert!(validate_read(&meta, snapshot, 3).is_some());
    }
}
