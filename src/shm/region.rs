//! Shared memory region management using mmap.
//!
//! Creates or opens a named memory-mapped file pair: the data file holds
//! the entire map (header + bucket flags + buckets + freelist + arena),
//! a second small file holds the process-shared rwlock. All structure
//! inside the data region is addressed by byte offsets from the mapping
//! base, so processes mapping it at different addresses see the same
//! map.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::ptr;
use std::slice;

use memmap2::MmapMut;

use super::layout::{Header, Record, Stat, HEADER_SIZE, MAGIC, RECORD_HEADER_SIZE};
use super::lock::{ShmRwLock, LOCK_SIZE};

/// Where to store the mmap files.
pub(crate) fn shm_dir() -> PathBuf {
    if cfg!(target_os = "linux") {
        PathBuf::from("/dev/shm")
    } else {
        // macOS and other Unix: use TMPDIR
        std::env::temp_dir().join("shmap")
    }
}

/// The full shared-memory region, owning the mmap handles and providing
/// raw accessors to the structures within.
///
/// Accessors translate offsets to addresses on each call; absolute
/// addresses are never stored inside the region.
#[derive(Debug)]
pub struct ShmRegion {
    mmap: MmapMut,
    lock_mmap: MmapMut,
    base: *mut u8,
    lock_base: *mut u8,
    data_path: PathBuf,
    lock_path: PathBuf,
}

// The raw base pointers target the owned mappings above.
unsafe impl Send for ShmRegion {}

impl ShmRegion {
    /// Create a new region under `dir`, initializing the header from the
    /// computed layout. The lock is not initialized yet; call
    /// `init_lock` next.
    pub fn create_in(
        dir: &Path,
        name: &str,
        s: &Stat,
        memory_size: u64,
        owner_pid: u32,
    ) -> io::Result<Self> {
        if !dir.exists() {
            fs::create_dir_all(dir)?;
        }

        let data_path = dir.join(format!("{name}.data"));
        let lock_path = dir.join(format!("{name}.lock"));

        let data_file = fs::OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&data_path)?;
        data_file.set_len(memory_size)?;

        let lock_file = fs::OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&lock_path)?;
        lock_file.set_len(LOCK_SIZE as u64)?;

        // Safety: we just created these files and own them exclusively at
        // this point.
        let mut mmap = unsafe { MmapMut::map_mut(&data_file)? };
        let mut lock_mmap = unsafe { MmapMut::map_mut(&lock_file)? };

        mmap.fill(0);
        lock_mmap.fill(0);

        let base = mmap.as_mut_ptr();
        let lock_base = lock_mmap.as_mut_ptr();

        let header = unsafe { &mut *(base as *mut Header) };
        header.magic = MAGIC;
        header.memory_size = memory_size;
        header.max_bucket_flags = s.max_bucket_flags;
        header.max_buckets = s.max_buckets;
        header.max_free_blocks = s.max_free_blocks;
        header.num_free_blocks = 0;
        header.bucket_flags_offset = HEADER_SIZE as u64;
        header.buckets_offset = header.bucket_flags_offset + s.bucket_flags_size;
        header.freelist_offset = header.buckets_offset + s.buckets_size;
        header.data_offset = header.freelist_offset + s.free_blocks_size;
        header.data_tail = header.data_offset;
        header.owner_pid = owner_pid;

        Ok(ShmRegion {
            mmap,
            lock_mmap,
            base,
            lock_base,
            data_path,
            lock_path,
        })
    }

    /// Open an existing region under `dir`, validating the header magic.
    pub fn open_in(dir: &Path, name: &str) -> io::Result<Self> {
        let data_path = dir.join(format!("{name}.data"));
        let lock_path = dir.join(format!("{name}.lock"));

        let data_file = fs::OpenOptions::new().read(true).write(true).open(&data_path)?;
        let lock_file = fs::OpenOptions::new().read(true).write(true).open(&lock_path)?;

        let mut mmap = unsafe { MmapMut::map_mut(&data_file)? };
        let mut lock_mmap = unsafe { MmapMut::map_mut(&lock_file)? };

        let base = mmap.as_mut_ptr();
        let lock_base = lock_mmap.as_mut_ptr();

        let header = unsafe { &*(base as *const Header) };
        if header.magic != MAGIC {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "invalid shared map file: bad magic",
            ));
        }
        if header.memory_size as usize > mmap.len() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "invalid shared map file: truncated region",
            ));
        }

        Ok(ShmRegion {
            mmap,
            lock_mmap,
            base,
            lock_base,
            data_path,
            lock_path,
        })
    }

    /// Initialize the process-shared rwlock in the lock mapping.
    /// Call once, by the creator, right after `create_in`.
    pub fn init_lock(&self) -> io::Result<()> {
        unsafe { ShmRwLock::init(self.lock_base) }.map(|_| ())
    }

    /// Handle to the shared rwlock.
    pub fn lock(&self) -> ShmRwLock {
        unsafe { ShmRwLock::from_existing(self.lock_base) }
    }

    pub fn header(&self) -> &Header {
        unsafe { &*(self.base as *const Header) }
    }

    /// Mutable header access. Caller must hold the write lock.
    #[allow(clippy::mut_from_ref)]
    pub(crate) unsafe fn header_mut(&self) -> &mut Header {
        &mut *(self.base as *mut Header)
    }

    /// The bucket-flags bitmap words. Caller must hold the lock.
    pub(crate) unsafe fn bucket_flags(&self) -> &[u64] {
        let h = self.header();
        slice::from_raw_parts(
            self.base.add(h.bucket_flags_offset as usize) as *const u64,
            h.max_bucket_flags as usize,
        )
    }

    /// Mutable bucket-flags words. Caller must hold the write lock.
    #[allow(clippy::mut_from_ref)]
    pub(crate) unsafe fn bucket_flags_mut(&self) -> &mut [u64] {
        let h = self.header();
        slice::from_raw_parts_mut(
            self.base.add(h.bucket_flags_offset as usize) as *mut u64,
            h.max_bucket_flags as usize,
        )
    }

    /// The bucket slot array of record offsets. Caller must hold the lock.
    pub(crate) unsafe fn buckets(&self) -> &[u64] {
        let h = self.header();
        slice::from_raw_parts(
            self.base.add(h.buckets_offset as usize) as *const u64,
            h.max_buckets as usize,
        )
    }

    /// Mutable bucket slots. Caller must hold the write lock.
    #[allow(clippy::mut_from_ref)]
    pub(crate) unsafe fn buckets_mut(&self) -> &mut [u64] {
        let h = self.header();
        slice::from_raw_parts_mut(
            self.base.add(h.buckets_offset as usize) as *mut u64,
            h.max_buckets as usize,
        )
    }

    /// The full-capacity freelist array; only the first
    /// `num_free_blocks` entries are live. Caller must hold the lock.
    pub(crate) unsafe fn freelist(&self) -> &[u64] {
        let h = self.header();
        slice::from_raw_parts(
            self.base.add(h.freelist_offset as usize) as *const u64,
            h.max_free_blocks as usize,
        )
    }

    /// Mutable freelist array. Caller must hold the write lock.
    #[allow(clippy::mut_from_ref)]
    pub(crate) unsafe fn freelist_mut(&self) -> &mut [u64] {
        let h = self.header();
        slice::from_raw_parts_mut(
            self.base.add(h.freelist_offset as usize) as *mut u64,
            h.max_free_blocks as usize,
        )
    }

    /// Read the record header at an arena offset. Offsets are unaligned.
    pub(crate) unsafe fn record_at(&self, offset: u64) -> Record {
        ptr::read_unaligned(self.base.add(offset as usize) as *const Record)
    }

    /// Key bytes of the record at `offset`.
    pub(crate) unsafe fn record_key_bytes(&self, offset: u64) -> &[u8] {
        let r = self.record_at(offset);
        let p = self.base.add(offset as usize + RECORD_HEADER_SIZE);
        slice::from_raw_parts(p, r.key_size as usize)
    }

    /// Value bytes of the record at `offset`.
    pub(crate) unsafe fn record_value_bytes(&self, offset: u64) -> &[u8] {
        let r = self.record_at(offset);
        let p = self
            .base
            .add(offset as usize + RECORD_HEADER_SIZE + r.key_size as usize + 1);
        slice::from_raw_parts(p, r.value_size as usize)
    }

    /// Write a full record (header, key, NUL, value, NUL) at `offset`.
    /// Caller must hold the write lock and have reserved the footprint.
    pub(crate) unsafe fn write_record(&self, offset: u64, hash: u64, key: &[u8], value: &[u8]) {
        let p = self.base.add(offset as usize);
        ptr::write_unaligned(
            p as *mut Record,
            Record {
                hash,
                key_size: key.len() as u64,
                value_size: value.len() as u64,
            },
        );
        let kp = p.add(RECORD_HEADER_SIZE);
        ptr::copy_nonoverlapping(key.as_ptr(), kp, key.len());
        *kp.add(key.len()) = 0;
        let vp = kp.add(key.len() + 1);
        ptr::copy_nonoverlapping(value.as_ptr(), vp, value.len());
        *vp.add(value.len()) = 0;
    }

    /// Overwrite the value bytes of the record at `offset` in place.
    /// `value` must have exactly the record's current value size.
    pub(crate) unsafe fn overwrite_value(&self, offset: u64, value: &[u8]) {
        let r = self.record_at(offset);
        debug_assert_eq!(r.value_size, value.len() as u64);
        let vp = self
            .base
            .add(offset as usize + RECORD_HEADER_SIZE + r.key_size as usize + 1) as *mut u8;
        ptr::copy_nonoverlapping(value.as_ptr(), vp, value.len());
        *vp.add(value.len()) = 0;
    }

    /// Read the size prefix of the free block at `offset`.
    pub(crate) unsafe fn free_block_size(&self, offset: u64) -> u64 {
        ptr::read_unaligned(self.base.add(offset as usize) as *const u64)
    }

    /// Write the size prefix of the free block at `offset`.
    pub(crate) unsafe fn set_free_block_size(&self, offset: u64, size: u64) {
        ptr::write_unaligned(self.base.add(offset as usize) as *mut u64, size)
    }

    /// Remove the backing files. Mappings stay valid until dropped.
    pub fn unlink(&self) {
        let _ = fs::remove_file(&self.data_path);
        let _ = fs::remove_file(&self.lock_path);
    }
}
