//! Open-addressed bucket table with a side "used" bitmap.
//!
//! A bucket slot holds 0 (never written) or the arena offset of a
//! record. The used bit distinguishes live slots from freed ones: a
//! probe walks past freed slots and terminates only on offset 0, so
//! deletion never rewrites the table. Freed slots are remembered as
//! insertion candidates and reused by the next insert that reaches them.

use super::layout::BUCKET_FLAG_BITS;
use super::region::ShmRegion;

/// 64-bit djb2 over the full key byte slice. Embedded NULs hash like
/// any other byte.
pub fn hash_key(key: &[u8]) -> u64 {
    let mut hash: u64 = 5381;
    for &b in key {
        hash = (hash << 5).wrapping_add(hash).wrapping_add(u64::from(b));
    }
    hash
}

/// Outcome of probing the table for a key.
pub(crate) struct FindOutcome {
    /// Arena offset of the matching record, if the key is present.
    pub record: Option<u64>,
    /// Matching slot on a hit; otherwise the insertion candidate, or
    /// `max_buckets` when every slot holds a live record.
    pub bucket: u64,
}

/// Linear-probe the table for `key`, starting at `hash % max_buckets`.
///
/// Inspects at most `max_buckets` slots. The insertion candidate on a
/// miss is the earliest slot without a live record: a freed slot seen on
/// the way, or the never-written slot that terminated the probe.
///
/// # Safety
/// Caller must hold the lock; every used bucket must reference a valid
/// record.
pub(crate) unsafe fn find_record(region: &ShmRegion, hash: u64, key: &[u8]) -> FindOutcome {
    let max_buckets = region.header().max_buckets;
    let buckets = region.buckets();
    let home = hash % max_buckets;

    let mut candidate = max_buckets;
    for i in 0..max_buckets {
        let index = (home + i) % max_buckets;
        let offset = buckets[index as usize];

        if offset == 0 {
            if candidate == max_buckets {
                candidate = index;
            }
            return FindOutcome { record: None, bucket: candidate };
        }
        if is_used(region, index) {
            let r = region.record_at(offset);
            if r.hash == hash
                && r.key_size == key.len() as u64
                && region.record_key_bytes(offset) == key
            {
                return FindOutcome { record: Some(offset), bucket: index };
            }
        } else if candidate == max_buckets {
            // Freed slot: probe past it, but remember it for insertion.
            candidate = index;
        }
    }

    FindOutcome { record: None, bucket: candidate }
}

/// True when bucket `index` references a live record.
///
/// # Safety
/// Caller must hold the lock; `index < max_buckets`.
pub(crate) unsafe fn is_used(region: &ShmRegion, index: u64) -> bool {
    let flags = region.bucket_flags();
    (flags[(index / BUCKET_FLAG_BITS) as usize] >> (index % BUCKET_FLAG_BITS)) & 1 == 1
}

/// Mark bucket `index` as referencing a live record.
///
/// # Safety
/// Caller must hold the write lock; `index < max_buckets`.
pub(crate) unsafe fn set_used(region: &ShmRegion, index: u64) {
    let flags = region.bucket_flags_mut();
    flags[(index / BUCKET_FLAG_BITS) as usize] |= 1u64 << (index % BUCKET_FLAG_BITS);
}

/// Clear the live mark of bucket `index`, leaving its offset as a
/// probe-through tombstone.
///
/// # Safety
/// Caller must hold the write lock; `index < max_buckets`.
pub(crate) unsafe fn unset_used(region: &ShmRegion, index: u64) {
    let flags = region.bucket_flags_mut();
    flags[(index / BUCKET_FLAG_BITS) as usize] &= !(1u64 << (index % BUCKET_FLAG_BITS));
}

/// Number of live buckets, by popcount over the flag words.
///
/// # Safety
/// Caller must hold the lock.
pub(crate) unsafe fn count_used(region: &ShmRegion) -> u64 {
    region
        .bucket_flags()
        .iter()
        .map(|w| u64::from(w.count_ones()))
        .sum()
}
