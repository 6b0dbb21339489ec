//! Fixed-capacity shared-memory hashmap.
//!
//! A single contiguous mmap region holds a header, a bit-packed "used"
//! bitmap, an open-addressed bucket array, a size-sorted freelist, and a
//! record arena. All intra-region references are byte offsets, so
//! cooperating processes mapping the region at different base addresses
//! observe the same map. Operations are serialized by a process-shared
//! reader-writer lock living in a second small mapping.
//!
//! Keys and values are opaque byte strings with explicit lengths; the
//! map never interprets them. There is no resize, no iteration, and no
//! persistence beyond the life of the backing tmpfs files.
//!
//! ```no_run
//! use shmap::ShmHashMap;
//!
//! let mut map = ShmHashMap::create("example", 64 * 1024, 0, 0)?;
//! map.set(b"hello", b"world!")?;
//! assert_eq!(&*map.get(b"hello")?, b"world!");
//! map.del(b"hello")?;
//! # Ok::<(), shmap::ShmError>(())
//! ```

pub mod error;
pub mod shm;

pub use error::{ShmError, ShmResult};
pub use shm::layout::{calc_required_memory_size, Stat};
pub use shm::{ShmHashMap, ValueGuard};
