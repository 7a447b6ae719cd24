//! Size-classed slab allocation over lazily committed virtual memory.
//!
//! A [`Slab`] reserves one large address range, commits pages as it grows
//! and hands out fixed-size chunks tracked in a bitmap. A
//! [`SizeClassAllocator`] keeps one slab per power-of-two size class and
//! routes `allocate(size)` / `free(ptr)` to the right one, sending oversized
//! requests to the heap.
//!
//! Neither type is thread-safe; [`GlobalSizeClassAllocator`] wraps a
//! process-wide instance in a mutex.

#[cfg(not(target_pointer_width = "64"))]
compile_error!("vslab supports only 64-bit targets.");

#[cfg(not(any(unix, loom, miri)))]
compile_error!("vslab needs a unix virtual memory API (mmap/mprotect).");

pub(crate) mod sync;

// public module: contains implementation details (hidden via pub(crate))
// and TEST_MUTEX (public for tests)
pub mod memory;

// allocators
pub use memory::global::GlobalSizeClassAllocator;
pub use memory::size_class::{FreedFrom, SizeClassAllocator};
pub use memory::slab::{Cursor, FreeOutcome, Slab, grown_size, next_committed_size};

// config
pub use memory::config::{
    DEFAULT_MAX_CAPACITY, DEFAULT_RETAIN_AFTER_RESET, ResetPolicy, SizeClassConfig, SlabConfig,
};

// vm
pub use memory::vm::{PlatformVmOps, VmError, VmOps};

// diagnostics
pub use memory::diag::{BucketTable, ByteSize, MAX_PRINTABLE_COMMITTED, OccupancyMap};
pub use memory::stats::MemoryStats;

// errors
pub use memory::error::{AllocError, ConfigError, InitError};
