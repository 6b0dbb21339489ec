//! `#[repr(C)]` structures that live in the shared region (mmap), plus
//! the sizing arithmetic that lays the region out.
//!
//! All structs use fixed-size fields so the layout is identical across
//! processes mapping the same region. Intra-region references are byte
//! offsets from the region base, never absolute addresses. Fields are
//! stored in host-native endianness; the format is not portable across
//! heterogeneous architectures.

use crate::error::{ShmError, ShmResult};

/// Magic bytes at the start of the header to validate a mapping.
pub const MAGIC: [u8; 8] = *b"SHMHMAP1";

/// Size of the fixed header at the start of the region.
pub const HEADER_SIZE: usize = 96;

/// Size of the record header preceding the key/value bytes.
pub const RECORD_HEADER_SIZE: usize = 24;

/// Size of the length prefix at the start of every free block.
pub const FREE_BLOCK_HEADER_SIZE: u64 = 8;

/// Width of one word in the bucket-flags bitmap.
pub const BUCKET_FLAG_BITS: u64 = 64;

/// Natural alignment of the region; region sizes are rounded up to it.
pub const REGION_ALIGN: u64 = std::mem::align_of::<u64>() as u64;

/// Header lives at offset 0 of the region.
///
/// Fields are u64-sized (except the trailing pid pair) so `#[repr(C)]`
/// introduces no implicit padding.
#[repr(C)]
#[derive(Debug)]
pub struct Header {
    pub magic: [u8; 8],           // 0..8
    pub memory_size: u64,         // 8..16   total region size in bytes
    pub max_bucket_flags: u64,    // 16..24  number of u64 words in the bitmap
    pub max_buckets: u64,         // 24..32
    pub max_free_blocks: u64,     // 32..40
    pub num_free_blocks: u64,     // 40..48  current freelist population
    pub bucket_flags_offset: u64, // 48..56
    pub buckets_offset: u64,      // 56..64
    pub freelist_offset: u64,     // 64..72
    pub data_offset: u64,         // 72..80
    pub data_tail: u64,           // 80..88  next unallocated arena byte
    pub owner_pid: u32,           // 88..92  creator process id
    pub _pad: u32,                // 92..96
}

const _: () = assert!(std::mem::size_of::<Header>() == HEADER_SIZE);

/// Record header stored in the arena, immediately followed by
/// `key_size` key bytes, a NUL, `value_size` value bytes, and a NUL.
///
/// Record offsets are not aligned; read and write this struct with
/// unaligned pointer accesses only.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Record {
    pub hash: u64,
    pub key_size: u64,
    pub value_size: u64,
}

const _: () = assert!(std::mem::size_of::<Record>() == RECORD_HEADER_SIZE);

impl Record {
    /// Total arena footprint: header + key + NUL + value + NUL.
    pub fn footprint(&self) -> u64 {
        record_footprint(self.key_size, self.value_size)
    }
}

/// Arena footprint of a record with the given key/value lengths.
pub fn record_footprint(key_size: u64, value_size: u64) -> u64 {
    RECORD_HEADER_SIZE as u64 + key_size + value_size + 2
}

/// Round `size` up to the region's natural alignment.
pub fn aligned_size(size: u64) -> u64 {
    (size + REGION_ALIGN - 1) & !(REGION_ALIGN - 1)
}

/// Sizing and usage report for a region.
///
/// `calc_required_memory_size` fills the sizing fields and leaves the
/// usage fields zero; `ShmHashMap::stat` fills both.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Stat {
    pub memory_size: u64,
    pub max_bucket_flags: u64,
    pub max_buckets: u64,
    pub max_free_blocks: u64,
    // size of each segment
    pub header_size: u64,
    pub bucket_flags_size: u64,
    pub buckets_size: u64,
    pub free_blocks_size: u64,
    pub data_size: u64,
    pub record_header_size: u64,
    pub record_size: u64,
    // usage
    pub used_buckets: u64,
    pub used_free_blocks: u64,
    pub used_data_size: u64,
}

/// Compute the region layout for the given sizing parameters.
///
/// Two sizing modes: by total `memory_size`, or by `max_buckets` plus an
/// expected `record_kv_size` (combined key+value bytes per record).
///
/// - `max_buckets == 0` derives `(memory_size / 4) / 8` buckets and
///   requires `memory_size > 0`.
/// - `max_free_blocks == 0` defaults to `max_buckets`.
/// - With `record_kv_size > 0` the data arena is sized to hold one
///   record per bucket and added to `memory_size`.
/// - Otherwise, with `memory_size > 0`, the arena is whatever remains
///   above the fixed segments and `record_size` is the advisory count of
///   minimal records fitting in it.
///
/// The reported `memory_size` is rounded up to the region alignment.
pub fn calc_required_memory_size(
    memory_size: u64,
    max_buckets: u64,
    max_free_blocks: u64,
    record_kv_size: u64,
) -> ShmResult<Stat> {
    let max_buckets = if max_buckets == 0 {
        if memory_size == 0 {
            return Err(ShmError::MemorySizeTooSmall);
        }
        (memory_size / 4) / 8
    } else {
        max_buckets
    };
    let max_free_blocks = if max_free_blocks == 0 {
        max_buckets
    } else {
        max_free_blocks
    };

    let mut s = Stat {
        max_bucket_flags: (max_buckets + BUCKET_FLAG_BITS - 1) / BUCKET_FLAG_BITS,
        max_buckets,
        max_free_blocks,
        header_size: HEADER_SIZE as u64,
        record_header_size: RECORD_HEADER_SIZE as u64 + 2,
        ..Stat::default()
    };
    s.bucket_flags_size = s.max_bucket_flags * 8;
    s.buckets_size = s.max_buckets * 8;
    s.free_blocks_size = s.max_free_blocks * 8;
    s.memory_size = s.header_size + s.bucket_flags_size + s.buckets_size + s.free_blocks_size;

    if record_kv_size > 0 {
        s.record_size = s.record_header_size + record_kv_size;
        s.data_size = s.record_size * s.max_buckets;
        s.memory_size += s.data_size;
    } else if memory_size > 0 {
        // Advisory only: how much arena the caller's size leaves, and how
        // many minimal records would fit in it.
        s.data_size = memory_size.saturating_sub(s.memory_size);
        s.record_size = s.data_size / s.record_header_size;
    }
    s.memory_size = aligned_size(s.memory_size);

    Ok(s)
}
