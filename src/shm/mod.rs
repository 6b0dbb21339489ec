//! Shared-memory hashmap backend.
//!
//! Provides `ShmHashMap` — a fixed-capacity, cross-process hashmap
//! backed by mmap. All data (header, used-bitmap, bucket array,
//! freelist, record arena) lives in a single memory-mapped file,
//! addressed by byte offsets. A separate mmap file holds a
//! process-shared rwlock: `set`/`del` take it exclusive, `get`/`stat`
//! shared. Operations are synchronous; lock acquisition is the only
//! blocking point.

pub mod bucket;
pub mod freelist;
pub mod layout;
pub mod lock;
pub mod region;

use std::marker::PhantomData;
use std::ops::Deref;
use std::path::Path;
use std::slice;

use tracing::{debug, trace};

use crate::error::{ShmError, ShmResult};
use layout::{Stat, HEADER_SIZE, RECORD_HEADER_SIZE};
use lock::ShmRwLock;
use region::{shm_dir, ShmRegion};

/// The main shared-memory hashmap handle.
///
/// Created once by `create`; any cooperating process attaches to the
/// same region with `open`. Only the creating handle, in the creating
/// process, may tear the region down — attached handles and forked
/// children get `PermissionDenied` from `close` and simply unmap on
/// drop.
pub struct ShmHashMap {
    /// `None` once the creator has closed the map.
    region: Option<ShmRegion>,
    /// Process id recorded at creation time.
    owner_pid: u32,
    /// Whether this handle created the region (vs. attached to it).
    created: bool,
}

// All region mutation happens under the process-shared rwlock.
unsafe impl Send for ShmHashMap {}
unsafe impl Sync for ShmHashMap {}

/// Shared-lock guard over a found value.
///
/// Derefs to the value bytes inside the region; the bytes stay valid
/// exactly as long as the guard holds the read lock, so drop it before
/// any mutation from the same thread.
pub struct ValueGuard<'a> {
    lock: ShmRwLock,
    ptr: *const u8,
    len: usize,
    _region: PhantomData<&'a ShmRegion>,
}

impl Deref for ValueGuard<'_> {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        unsafe { slice::from_raw_parts(self.ptr, self.len) }
    }
}

impl Drop for ValueGuard<'_> {
    fn drop(&mut self) {
        self.lock.unlock();
    }
}

impl ShmHashMap {
    /// Create a new named map in the default shared-memory directory.
    ///
    /// `memory_size` is rounded up to the region alignment and must
    /// cover the fixed segments computed from `max_buckets` and
    /// `max_free_blocks` (both may be 0 to derive defaults; see
    /// `calc_required_memory_size`).
    pub fn create(
        name: &str,
        memory_size: u64,
        max_buckets: u64,
        max_free_blocks: u64,
    ) -> ShmResult<Self> {
        Self::create_in(&shm_dir(), name, memory_size, max_buckets, max_free_blocks)
    }

    /// Create a new named map with its backing files under `dir`.
    pub fn create_in(
        dir: &Path,
        name: &str,
        memory_size: u64,
        max_buckets: u64,
        max_free_blocks: u64,
    ) -> ShmResult<Self> {
        let memory_size = layout::aligned_size(memory_size);
        let s = layout::calc_required_memory_size(memory_size, max_buckets, max_free_blocks, 0)?;
        if memory_size < s.memory_size {
            return Err(ShmError::MemorySizeTooSmall);
        }

        let owner_pid = std::process::id();
        let region = ShmRegion::create_in(dir, name, &s, memory_size, owner_pid)
            .map_err(ShmError::MapFailed)?;
        if let Err(e) = region.init_lock() {
            region.unlink();
            return Err(ShmError::LockFailed(e));
        }

        debug!(name, memory_size, max_buckets = s.max_buckets, "created shared map");
        Ok(ShmHashMap {
            region: Some(region),
            owner_pid,
            created: true,
        })
    }

    /// Attach to an existing map in the default shared-memory directory.
    pub fn open(name: &str) -> ShmResult<Self> {
        Self::open_in(&shm_dir(), name)
    }

    /// Attach to an existing map with its backing files under `dir`.
    pub fn open_in(dir: &Path, name: &str) -> ShmResult<Self> {
        let region = ShmRegion::open_in(dir, name).map_err(ShmError::MapFailed)?;
        let owner_pid = region.header().owner_pid;
        debug!(name, owner_pid, "attached shared map");
        Ok(ShmHashMap {
            region: Some(region),
            owner_pid,
            created: false,
        })
    }

    fn region(&self) -> ShmResult<&ShmRegion> {
        self.region.as_ref().ok_or(ShmError::Closed)
    }

    /// Insert or overwrite a key-value pair. Exclusive lock.
    ///
    /// A value of the same size as the stored one is overwritten in
    /// place; otherwise the new record is placed first and the old one
    /// freed after, so a failed replacement leaves the old value live.
    pub fn set(&mut self, key: &[u8], value: &[u8]) -> ShmResult<()> {
        let region = self.region()?;
        let lock = region.lock();
        lock.write_lock().map_err(ShmError::LockFailed)?;
        let result = unsafe { set_locked(region, key, value) };
        lock.unlock();
        if result.is_ok() {
            trace!(key_len = key.len(), value_len = value.len(), "set");
        }
        result
    }

    /// Delete a key. Exclusive lock.
    ///
    /// The record's space goes to the freelist and the bucket's used bit
    /// is cleared; the slot offset stays behind as a probe-through
    /// tombstone.
    pub fn del(&mut self, key: &[u8]) -> ShmResult<()> {
        let region = self.region()?;
        let lock = region.lock();
        lock.write_lock().map_err(ShmError::LockFailed)?;
        let result = unsafe { del_locked(region, key) };
        lock.unlock();
        if result.is_ok() {
            trace!(key_len = key.len(), "del");
        }
        result
    }

    /// Look up a key. Shared lock, held by the returned guard.
    pub fn get(&self, key: &[u8]) -> ShmResult<ValueGuard<'_>> {
        let region = self.region()?;
        let lock = region.lock();
        lock.read_lock().map_err(ShmError::LockFailed)?;

        let found = unsafe { bucket::find_record(region, bucket::hash_key(key), key) };
        match found.record {
            Some(offset) => {
                let value = unsafe { region.record_value_bytes(offset) };
                Ok(ValueGuard {
                    lock,
                    ptr: value.as_ptr(),
                    len: value.len(),
                    _region: PhantomData,
                })
            }
            None => {
                lock.unlock();
                Err(ShmError::NotFound)
            }
        }
    }

    /// Look up a key and copy the value out. Shared lock.
    pub fn get_copy(&self, key: &[u8]) -> ShmResult<Vec<u8>> {
        Ok(self.get(key)?.to_vec())
    }

    /// Report sizing and usage. Shared lock.
    pub fn stat(&self) -> ShmResult<Stat> {
        let region = self.region()?;
        let lock = region.lock();
        lock.read_lock().map_err(ShmError::LockFailed)?;
        let s = unsafe { stat_locked(region) };
        lock.unlock();
        Ok(s)
    }

    /// Tear the region down: unlink the backing files and destroy the
    /// lock.
    ///
    /// Only the creating handle in the creating process may close; all
    /// other handles get `PermissionDenied` with the region untouched.
    /// A second close from the creator is a no-op reporting success.
    /// Cooperating processes must be done with the region before the
    /// creator closes it.
    pub fn close(&mut self) -> ShmResult<()> {
        if !self.created || std::process::id() != self.owner_pid {
            return Err(ShmError::PermissionDenied);
        }
        let Some(region) = self.region.take() else {
            return Ok(());
        };

        let lock = region.lock();
        if let Err(e) = lock.write_lock() {
            self.region = Some(region);
            return Err(ShmError::LockFailed(e));
        }
        region.unlink();
        lock.unlock();
        unsafe { lock.destroy() };
        drop(region);

        debug!("closed shared map");
        Ok(())
    }
}

impl Drop for ShmHashMap {
    fn drop(&mut self) {
        // Finalizer: the creating process tears the region down if close
        // was never called. Attached handles and forked children only
        // unmap.
        if self.created && std::process::id() == self.owner_pid {
            let _ = self.close();
        }
    }
}

/// Insert under the write lock.
///
/// # Safety
/// Caller must hold the write lock on `region`.
unsafe fn set_locked(region: &ShmRegion, key: &[u8], value: &[u8]) -> ShmResult<()> {
    let hash = bucket::hash_key(key);
    let found = bucket::find_record(region, hash, key);

    let (max_buckets, memory_size, data_tail, num_free_blocks, max_free_blocks) = {
        let h = region.header();
        (
            h.max_buckets,
            h.memory_size,
            h.data_tail,
            h.num_free_blocks,
            h.max_free_blocks,
        )
    };

    if found.record.is_none() && found.bucket == max_buckets {
        return Err(ShmError::NoEmptyBucket);
    }

    let mut replaced = None;
    if let Some(offset) = found.record {
        let r = region.record_at(offset);
        if r.value_size == value.len() as u64 {
            region.overwrite_value(offset, value);
            return Ok(());
        }
        if num_free_blocks == max_free_blocks {
            return Err(ShmError::NoEmptyFreeBlock);
        }
        replaced = Some((offset, r.footprint()));
    }

    // Place the new record before releasing the old one, so a failed
    // replacement leaves the stored value intact.
    let required = layout::record_footprint(key.len() as u64, value.len() as u64);
    let use_tail = memory_size - data_tail >= required;
    let insert_offset = if use_tail {
        data_tail
    } else {
        match freelist::find_free_block(region, required) {
            Some(offset) => offset,
            None => return Err(ShmError::NoSpace),
        }
    };

    region.write_record(insert_offset, hash, key, value);
    region.buckets_mut()[found.bucket as usize] = insert_offset;
    bucket::set_used(region, found.bucket);
    if use_tail {
        region.header_mut().data_tail = data_tail + required;
    }

    if let Some((offset, footprint)) = replaced {
        // Room was checked before placement, and placement consumed at
        // most the slot it released.
        freelist::add_free_block(region, offset, footprint);
    }
    Ok(())
}

/// Delete under the write lock.
///
/// # Safety
/// Caller must hold the write lock on `region`.
unsafe fn del_locked(region: &ShmRegion, key: &[u8]) -> ShmResult<()> {
    let found = bucket::find_record(region, bucket::hash_key(key), key);
    let Some(offset) = found.record else {
        return Err(ShmError::NotFound);
    };

    if !freelist::has_room(region) {
        return Err(ShmError::NoEmptyFreeBlock);
    }

    let footprint = region.record_at(offset).footprint();
    freelist::add_free_block(region, offset, footprint);
    bucket::unset_used(region, found.bucket);
    Ok(())
}

/// Collect statistics under the shared lock.
///
/// # Safety
/// Caller must hold the lock on `region`.
unsafe fn stat_locked(region: &ShmRegion) -> Stat {
    let h = region.header();
    Stat {
        memory_size: h.memory_size,
        max_bucket_flags: h.max_bucket_flags,
        max_buckets: h.max_buckets,
        max_free_blocks: h.max_free_blocks,
        header_size: HEADER_SIZE as u64,
        bucket_flags_size: h.max_bucket_flags * 8,
        buckets_size: h.max_buckets * 8,
        free_blocks_size: h.max_free_blocks * 8,
        data_size: h.memory_size - h.data_offset,
        record_header_size: RECORD_HEADER_SIZE as u64 + 2,
        record_size: 0,
        used_buckets: bucket::count_used(region),
        used_free_blocks: h.num_free_blocks,
        used_data_size: h.data_tail - h.data_offset,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};
    use std::collections::HashMap;

    impl ShmHashMap {
        /// Stored sizes of the live freelist entries, in list order.
        fn freelist_sizes(&self) -> Vec<u64> {
            let region = self.region.as_ref().unwrap();
            let n = region.header().num_free_blocks as usize;
            unsafe {
                region.freelist()[..n]
                    .iter()
                    .map(|&off| region.free_block_size(off))
                    .collect()
            }
        }
    }

    fn map_in(dir: &Path, memory_size: u64, max_buckets: u64, max_free_blocks: u64) -> ShmHashMap {
        ShmHashMap::create_in(dir, "map", memory_size, max_buckets, max_free_blocks).unwrap()
    }

    #[test]
    fn derives_bucket_counts_from_memory_size() {
        let dir = tempfile::tempdir().unwrap();
        let map = map_in(dir.path(), 1000, 0, 0);
        let s = map.stat().unwrap();
        assert_eq!(s.max_buckets, 31); // (1000 / 4) / 8
        assert_eq!(s.max_free_blocks, 31);
        assert_eq!(s.memory_size, 1000);
        assert_eq!(s.used_buckets, 0);
        assert_eq!(s.used_data_size, 0);
    }

    #[test]
    fn rejects_memory_size_below_fixed_segments() {
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(
            ShmHashMap::create_in(dir.path(), "small", 100, 0, 0),
            Err(ShmError::MemorySizeTooSmall)
        ));
    }

    #[test]
    fn set_get_del_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let mut map = map_in(dir.path(), 4096, 8, 0);

        map.set(b"hello", b"world!").unwrap();
        assert_eq!(&*map.get(b"hello").unwrap(), b"world!");
        assert_eq!(map.get_copy(b"hello").unwrap(), b"world!");

        map.del(b"hello").unwrap();
        assert!(matches!(map.get(b"hello"), Err(ShmError::NotFound)));

        let s = map.stat().unwrap();
        assert_eq!(s.used_buckets, 0);
        assert_eq!(s.used_free_blocks, 1);
    }

    #[test]
    fn keys_and_values_may_embed_nuls() {
        let dir = tempfile::tempdir().unwrap();
        let mut map = map_in(dir.path(), 4096, 8, 0);

        map.set(b"a\0b", b"x\0y\0z").unwrap();
        assert_eq!(&*map.get(b"a\0b").unwrap(), b"x\0y\0z");
        assert!(matches!(map.get(b"ab"), Err(ShmError::NotFound)));
    }

    #[test]
    fn empty_value_roundtrips() {
        let dir = tempfile::tempdir().unwrap();
        let mut map = map_in(dir.path(), 4096, 8, 0);

        map.set(b"k", b"").unwrap();
        assert_eq!(&*map.get(b"k").unwrap(), b"");
    }

    #[test]
    fn same_size_overwrite_updates_in_place() {
        let dir = tempfile::tempdir().unwrap();
        let mut map = map_in(dir.path(), 4096, 8, 0);

        map.set(b"k", b"ab").unwrap();
        let before = map.stat().unwrap();

        map.set(b"k", b"cd").unwrap();
        assert_eq!(&*map.get(b"k").unwrap(), b"cd");

        let after = map.stat().unwrap();
        assert_eq!(after.used_free_blocks, before.used_free_blocks);
        assert_eq!(after.used_data_size, before.used_data_size);
        assert_eq!(after.used_buckets, 1);
    }

    #[test]
    fn different_size_overwrite_frees_exactly_one_block() {
        let dir = tempfile::tempdir().unwrap();
        let mut map = map_in(dir.path(), 4096, 8, 0);

        map.set(b"k", b"a").unwrap();
        let before = map.stat().unwrap();

        map.set(b"k", b"bbb").unwrap();
        assert_eq!(&*map.get(b"k").unwrap(), b"bbb");

        let after = map.stat().unwrap();
        assert_eq!(after.used_free_blocks, before.used_free_blocks + 1);
        assert_eq!(after.used_buckets, 1);
    }

    #[test]
    fn fifth_key_into_four_buckets_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let mut map = map_in(dir.path(), 4096, 4, 0);

        for i in 0..4 {
            map.set(format!("key{i}").as_bytes(), b"v").unwrap();
        }
        assert!(matches!(
            map.set(b"key4", b"v"),
            Err(ShmError::NoEmptyBucket)
        ));

        // A probe over the full table still terminates.
        assert!(matches!(map.get(b"missing"), Err(ShmError::NotFound)));
        assert_eq!(map.stat().unwrap().used_buckets, 4);
    }

    #[test]
    fn second_delete_with_one_freelist_slot_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let mut map = map_in(dir.path(), 4096, 4, 1);

        map.set(b"k1", b"aaaa").unwrap();
        map.set(b"k2", b"bbbb").unwrap();

        map.del(b"k1").unwrap();
        assert_eq!(map.stat().unwrap().used_free_blocks, 1);

        assert!(matches!(map.del(b"k2"), Err(ShmError::NoEmptyFreeBlock)));
        // The refused delete left the record live.
        assert_eq!(&*map.get(b"k2").unwrap(), b"bbbb");
        assert_eq!(map.stat().unwrap().used_free_blocks, 1);
    }

    #[test]
    fn deleting_missing_key_changes_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let mut map = map_in(dir.path(), 4096, 8, 0);

        map.set(b"k", b"v").unwrap();
        let before = map.stat().unwrap();

        assert!(matches!(map.del(b"missing"), Err(ShmError::NotFound)));
        assert_eq!(map.stat().unwrap(), before);
    }

    #[test]
    fn deleted_slot_is_reused_for_insertion() {
        let dir = tempfile::tempdir().unwrap();
        let mut map = map_in(dir.path(), 4096, 4, 0);

        for i in 0..4 {
            map.set(format!("key{i}").as_bytes(), b"v").unwrap();
        }
        map.del(b"key1").unwrap();

        // The freed slot must accept a new key even though no bucket was
        // ever zeroed.
        map.set(b"fresh", b"w").unwrap();
        assert_eq!(&*map.get(b"fresh").unwrap(), b"w");
        assert_eq!(&*map.get(b"key0").unwrap(), b"v");
        assert_eq!(&*map.get(b"key2").unwrap(), b"v");
        assert_eq!(&*map.get(b"key3").unwrap(), b"v");
        assert_eq!(map.stat().unwrap().used_buckets, 4);

        assert!(matches!(
            map.set(b"overflow", b"v"),
            Err(ShmError::NoEmptyBucket)
        ));
    }

    #[test]
    fn reclaimed_space_serves_equal_sized_records() {
        // Arena sized for exactly three minimal records: fixed segments
        // are 96 + 8 + 32 + 32 = 168 bytes, each record 24 + 2 + 6 + 2 =
        // 34 bytes.
        let dir = tempfile::tempdir().unwrap();
        let mut map = map_in(dir.path(), 272, 4, 4);

        for key in [b"k1", b"k2", b"k3"] {
            map.set(key, b"aaaaaa").unwrap();
        }
        for key in [b"k1", b"k2", b"k3"] {
            map.del(key).unwrap();
        }
        for key in [b"k1", b"k2", b"k3"] {
            map.set(key, b"bbbbbb").unwrap();
        }
        for key in [b"k1", b"k2", b"k3"] {
            assert_eq!(&*map.get(key).unwrap(), b"bbbbbb");
        }

        // The arena tail is spent; a fourth record has nowhere to go.
        assert!(matches!(map.set(b"k4", b"cccccc"), Err(ShmError::NoSpace)));
    }

    #[test]
    fn failed_replacement_keeps_old_value() {
        // Same sizing as above: the tail fits three records and nothing
        // else.
        let dir = tempfile::tempdir().unwrap();
        let mut map = map_in(dir.path(), 272, 4, 4);

        for key in [b"k1", b"k2", b"k3"] {
            map.set(key, b"aaaaaa").unwrap();
        }

        // Growing k2 needs a 36-byte block; neither the tail (0 left)
        // nor the freelist (empty) has one.
        assert!(matches!(
            map.set(b"k2", b"aaaaaaaa"),
            Err(ShmError::NoSpace)
        ));
        assert_eq!(&*map.get(b"k2").unwrap(), b"aaaaaa");
        assert_eq!(map.stat().unwrap().used_free_blocks, 0);
    }

    #[test]
    fn attached_handle_sees_creator_writes_and_vice_versa() {
        let dir = tempfile::tempdir().unwrap();
        let mut creator = map_in(dir.path(), 8192, 16, 0);
        let mut attached = ShmHashMap::open_in(dir.path(), "map").unwrap();

        creator.set(b"from-creator", b"one").unwrap();
        assert_eq!(&*attached.get(b"from-creator").unwrap(), b"one");

        attached.set(b"from-attached", b"two").unwrap();
        assert_eq!(&*creator.get(b"from-attached").unwrap(), b"two");

        attached.del(b"from-creator").unwrap();
        assert!(matches!(creator.get(b"from-creator"), Err(ShmError::NotFound)));
    }

    #[test]
    fn only_the_creating_handle_may_close() {
        let dir = tempfile::tempdir().unwrap();
        let mut creator = map_in(dir.path(), 4096, 8, 0);
        let mut attached = ShmHashMap::open_in(dir.path(), "map").unwrap();

        assert!(matches!(attached.close(), Err(ShmError::PermissionDenied)));
        // The denied close left the region intact.
        creator.set(b"k", b"v").unwrap();
        assert_eq!(&*attached.get(b"k").unwrap(), b"v");

        drop(attached);
        creator.close().unwrap();
        // Second close is a no-op reporting success.
        creator.close().unwrap();
        assert!(matches!(creator.get(b"k"), Err(ShmError::Closed)));
        assert!(matches!(creator.set(b"k", b"v"), Err(ShmError::Closed)));
        assert!(matches!(creator.stat(), Err(ShmError::Closed)));

        assert!(ShmHashMap::open_in(dir.path(), "map").is_err());
    }

    #[test]
    fn drop_of_creator_unlinks_backing_files() {
        let dir = tempfile::tempdir().unwrap();
        {
            let _map = map_in(dir.path(), 4096, 8, 0);
            assert!(dir.path().join("map.data").exists());
        }
        assert!(!dir.path().join("map.data").exists());
        assert!(!dir.path().join("map.lock").exists());
    }

    #[test]
    fn drop_of_attached_handle_keeps_backing_files() {
        let dir = tempfile::tempdir().unwrap();
        let map = map_in(dir.path(), 4096, 8, 0);
        {
            let _attached = ShmHashMap::open_in(dir.path(), "map").unwrap();
        }
        assert!(dir.path().join("map.data").exists());
        drop(map);
    }

    #[test]
    fn randomized_operations_match_a_model() {
        let dir = tempfile::tempdir().unwrap();
        let mut map = map_in(dir.path(), 1 << 16, 64, 0);
        let mut model: HashMap<Vec<u8>, Vec<u8>> = HashMap::new();
        let mut rng = StdRng::seed_from_u64(0xC0FFEE);

        let max_free_blocks = map.stat().unwrap().max_free_blocks;

        for _ in 0..2000 {
            let key = format!("key-{}", rng.gen_range(0..32u32)).into_bytes();
            match rng.gen_range(0..4u32) {
                0 | 1 => {
                    let len = rng.gen_range(0..48usize);
                    let value: Vec<u8> = (0..len).map(|_| rng.gen()).collect();
                    match map.set(&key, &value) {
                        Ok(()) => {
                            model.insert(key, value);
                        }
                        Err(
                            ShmError::NoSpace
                            | ShmError::NoEmptyBucket
                            | ShmError::NoEmptyFreeBlock,
                        ) => {}
                        Err(e) => panic!("unexpected set error: {e}"),
                    }
                }
                2 => match map.del(&key) {
                    Ok(()) => {
                        assert!(model.remove(&key).is_some());
                    }
                    Err(ShmError::NotFound) => {
                        assert!(!model.contains_key(&key));
                    }
                    Err(ShmError::NoEmptyFreeBlock) => {}
                    Err(e) => panic!("unexpected del error: {e}"),
                },
                _ => match map.get(&key) {
                    Ok(guard) => assert_eq!(&*guard, model[&key].as_slice()),
                    Err(ShmError::NotFound) => assert!(!model.contains_key(&key)),
                    Err(e) => panic!("unexpected get error: {e}"),
                },
            }

            let s = map.stat().unwrap();
            assert_eq!(s.used_buckets, model.len() as u64);
            assert!(s.used_free_blocks <= max_free_blocks);
            assert!(s.used_data_size <= s.data_size);

            let sizes = map.freelist_sizes();
            assert!(
                sizes.windows(2).all(|w| w[0] <= w[1]),
                "freelist out of order: {sizes:?}"
            );
        }

        for (key, value) in &model {
            assert_eq!(&*map.get(key).unwrap(), value.as_slice());
        }
    }
}
