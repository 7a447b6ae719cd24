use super::bits;
use super::config::{ResetPolicy, SlabConfig};
use super::diag::ByteSize;
use super::error::{AllocError, InitError};
use super::stats;
use super::vm::{PlatformVmOps, VmOps};
use fixedbitset::FixedBitSet;
use log::{debug, error, warn};
use std::ptr::NonNull;

const KIB: usize = 1024;
const MIB: usize = 1024 * KIB;
const GIB: usize = 1024 * MIB;

/// Where the next allocation comes from.
///
/// A cache, not the source of truth: `Chunk(i)` is re-checked against the
/// bitmap before use and replaced by a scan if it went stale.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Cursor {
    /// A chunk believed to be free.
    Chunk(usize),
    /// No free chunk in the committed region, but capacity remains. The next
    /// allocation grows the slab.
    Grow,
    /// Committed up to capacity and every chunk is in use.
    Full,
}

/// Result of handing a pointer back to a slab.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[must_use]
pub enum FreeOutcome {
    /// The chunk was in use and is now free.
    Freed,
    /// The chunk was already free (double free). Nothing changed.
    AlreadyFree,
    /// The pointer is outside this slab's committed chunks.
    NotOwned,
}

impl FreeOutcome {
    /// Whether the slab claimed the pointer, freed now or before.
    #[must_use]
    pub fn is_owned(self) -> bool {
        !matches!(self, Self::NotOwned)
    }
}

/// Committed size after one geometric growth step, before chunk and page
/// rounding. Greedy while small, conservative once large.
#[must_use]
pub fn grown_size(current: usize) -> usize {
    if current < 512 * KIB {
        current.saturating_mul(4)
    } else if current < 16 * MIB {
        current.saturating_mul(3)
    } else if current < 128 * MIB {
        current.saturating_mul(2)
    } else if current < GIB {
        current.saturating_add(current / 2)
    } else {
        current.saturating_add(current / 8)
    }
}

/// Committed size a slab grows to from `current`: one geometric step, at
/// least one more chunk, rounded up to whole pages, never above `capacity`.
#[must_use]
pub fn next_committed_size(
    current: usize,
    chunk_size: usize,
    page_size: usize,
    capacity: usize,
) -> usize {
    let target = grown_size(current).max(current.saturating_add(chunk_size));
    bits::round_up(target, page_size).min(capacity)
}

/// A pool of same-size chunks carved from one virtual memory reservation.
///
/// The whole `max_capacity` is reserved up front; pages are committed as the
/// pool grows. Occupancy lives in a bitmap (1 = free), so a pointer can be
/// checked for ownership and freed without any per-chunk header.
///
/// Not thread-safe. `Send` because it owns its reservation outright; wrap it
/// (or the [`SizeClassAllocator`](super::size_class::SizeClassAllocator) that
/// holds it) in a lock to share it.
pub struct Slab<V: VmOps = PlatformVmOps> {
    vm: V,
    /// `None` for a degenerate or released slab.
    base: Option<NonNull<u8>>,
    chunk_size: usize,
    /// Bytes backed by physical memory, starting at `base`.
    committed: usize,
    /// Bytes of address space reserved at `base`.
    reserved: usize,
    /// One bit per committed chunk; set = free.
    free_mask: FixedBitSet,
    cursor: Cursor,
    live: usize,
    reset: ResetPolicy,
}

// Safety: Slab owns its reservation; the raw base pointer is never shared.
unsafe impl<V: VmOps + Send> Send for Slab<V> {}

impl Slab<PlatformVmOps> {
    /// Create a slab backed by the process's virtual memory.
    ///
    /// # Errors
    ///
    /// See [`Slab::new`].
    pub fn with_config(config: SlabConfig) -> Result<Self, InitError> {
        Self::new(PlatformVmOps, config)
    }
}

impl<V: VmOps> Slab<V> {
    /// Reserve `config.max_capacity` bytes, commit the starting window and
    /// mark all of its chunks free.
    ///
    /// A starting window holding no whole chunk yields a degenerate slab: it
    /// reserves nothing, reports zero capacity and never allocates.
    ///
    /// # Errors
    ///
    /// `InitError::Config` for invalid parameters, `InitError::Vm` if the
    /// reservation or the initial commit fails.
    pub fn new(vm: V, config: SlabConfig) -> Result<Self, InitError> {
        config.validate()?;
        let SlabConfig {
            chunk_size,
            starting_size,
            max_capacity,
            reset,
        } = config;

        let chunks = starting_size / chunk_size;
        if chunks == 0 {
            return Ok(Self {
                vm,
                base: None,
                chunk_size,
                committed: 0,
                reserved: 0,
                free_mask: FixedBitSet::new(),
                cursor: Cursor::Full,
                live: 0,
                reset,
            });
        }

        // Safety: FFI call to reserve memory.
        let base = unsafe { vm.reserve(max_capacity)? };
        // Safety: base..base + starting_size lies inside the reservation.
        if let Err(e) = unsafe { vm.commit(base, starting_size) } {
            // Safety: releasing the reservation made above; nothing points into it.
            if let Err(release_err) = unsafe { vm.release(base, max_capacity) } {
                error!("slab({chunk_size}-byte chunks): {release_err}");
            }
            return Err(e.into());
        }

        stats::TOTAL_RESERVED.add(max_capacity);
        stats::TOTAL_COMMITTED.add(starting_size);

        let mut free_mask = FixedBitSet::with_capacity(chunks);
        free_mask.insert_range(..);

        Ok(Self {
            vm,
            base: Some(base),
            chunk_size,
            committed: starting_size,
            reserved: max_capacity,
            free_mask,
            cursor: Cursor::Chunk(0),
            live: 0,
            reset,
        })
    }

    /// Hand out one chunk of `chunk_size()` bytes.
    ///
    /// Sequential first-time allocation walks the cursor forward in O(1);
    /// otherwise the bitmap is scanned a word at a time for the lowest free
    /// chunk. When the committed region is full the *next* call grows it.
    ///
    /// # Errors
    ///
    /// `AllocError::Exhausted` when every chunk is taken and the reservation
    /// is fully committed; `AllocError::CommitFailed` when growth could not
    /// commit more pages, in which case the slab is unchanged.
    pub fn allocate(&mut self) -> Result<NonNull<u8>, AllocError> {
        let index = self.claim_index()?;
        let base = self.base.ok_or(AllocError::Exhausted {
            chunk_size: self.chunk_size,
        })?;

        self.free_mask.set(index, false);
        self.live += 1;
        stats::SLAB_LIVE_CHUNKS.add(1);

        self.cursor = if self.free_mask.contains(index + 1) {
            Cursor::Chunk(index + 1)
        } else {
            self.find_free()
        };

        // Safety: index < chunk_count(), so the chunk lies inside the
        // committed region.
        Ok(unsafe { base.add(index * self.chunk_size) })
    }

    /// Resolve the cursor to a free chunk index, growing if needed.
    fn claim_index(&mut self) -> Result<usize, AllocError> {
        loop {
            match self.cursor {
                Cursor::Chunk(index) if self.free_mask.contains(index) => return Ok(index),
                Cursor::Chunk(_) => self.cursor = self.find_free(),
                Cursor::Grow => self.grow()?,
                Cursor::Full => {
                    return Err(AllocError::Exhausted {
                        chunk_size: self.chunk_size,
                    });
                }
            }
        }
    }

    /// Lowest free chunk, or the state to fall into when there is none.
    fn find_free(&self) -> Cursor {
        match self.free_mask.ones().next() {
            Some(index) => Cursor::Chunk(index),
            None if self.base.is_some() && self.committed < self.reserved => Cursor::Grow,
            None => Cursor::Full,
        }
    }

    /// Commit the next geometric step. Leaves the cursor at `Chunk` or `Full`.
    fn grow(&mut self) -> Result<(), AllocError> {
        let Some(base) = self.base else {
            self.cursor = Cursor::Full;
            return Ok(());
        };

        let page_size = self.vm.page_size();
        let old_size = self.committed;
        let new_size = next_committed_size(old_size, self.chunk_size, page_size, self.reserved);
        let old_chunks = self.free_mask.len();
        let new_chunks = new_size / self.chunk_size;
        if new_chunks <= old_chunks {
            self.cursor = Cursor::Full;
            return Ok(());
        }

        // The initial window need not end on a page boundary; commit from
        // the page that holds its end.
        let start = bits::round_down(old_size, page_size);
        // Safety: start..new_size lies inside the reservation (new_size <= reserved).
        unsafe { self.vm.commit(base.add(start), new_size - start) }
            .map_err(AllocError::CommitFailed)?;

        debug!(
            "slab({}-byte chunks): growing {:.1}% from {} to {}",
            self.chunk_size,
            percent(new_size, old_size),
            ByteSize(old_size),
            ByteSize(new_size),
        );

        stats::TOTAL_COMMITTED.add(new_size - old_size);
        self.committed = new_size;
        self.free_mask.grow(new_chunks);
        self.free_mask.insert_range(old_chunks..new_chunks);
        self.cursor = Cursor::Chunk(old_chunks);
        Ok(())
    }

    /// Mark the chunk containing `ptr` free.
    ///
    /// Any address inside a chunk frees that chunk. Freeing an already-free
    /// chunk is tolerated and reported as [`FreeOutcome::AlreadyFree`].
    pub fn free(&mut self, ptr: NonNull<u8>) -> FreeOutcome {
        let Some(index) = self.chunk_index(ptr) else {
            return FreeOutcome::NotOwned;
        };

        if self.free_mask.put(index) {
            warn!(
                "slab({}-byte chunks): double free of chunk {index} at {ptr:p}",
                self.chunk_size
            );
            return FreeOutcome::AlreadyFree;
        }

        self.live -= 1;
        stats::SLAB_LIVE_CHUNKS.sub(1);

        // Prefer the lowest freed chunk; it also rescues a Grow/Full cursor.
        match self.cursor {
            Cursor::Chunk(current) if current <= index => {}
            _ => self.cursor = Cursor::Chunk(index),
        }
        FreeOutcome::Freed
    }

    /// Mark every chunk free in one pass, without touching chunk contents.
    ///
    /// Under [`ResetPolicy::Shrink`] the committed region above the retained
    /// size is returned to the OS first. All pointers previously handed out
    /// become invalid.
    pub fn free_all(&mut self) {
        let Some(base) = self.base else {
            return;
        };

        if let ResetPolicy::Shrink { retain } = self.reset {
            let keep = bits::round_up(retain, self.vm.page_size());
            if keep < self.committed {
                let len = self.committed - keep;
                // Safety: keep..committed lies inside the committed region and
                // no chunk in it stays live past this reset.
                match unsafe { self.vm.decommit(base.add(keep), len) } {
                    Ok(()) => {
                        stats::TOTAL_COMMITTED.sub(len);
                        self.committed = keep;
                    }
                    Err(e) => error!(
                        "slab({}-byte chunks): keeping {} committed, decommit failed: {e}",
                        self.chunk_size,
                        ByteSize(self.committed)
                    ),
                }
            }
        }

        let chunks = self.committed / self.chunk_size;
        if chunks == self.free_mask.len() {
            self.free_mask.insert_range(..);
        } else {
            self.free_mask = FixedBitSet::with_capacity(chunks);
            self.free_mask.insert_range(..);
        }

        stats::SLAB_LIVE_CHUNKS.sub(self.live);
        self.live = 0;
        self.cursor = self.find_free();

        debug!(
            "slab({}-byte chunks): reset, {} committed",
            self.chunk_size,
            ByteSize(self.committed)
        );
    }

    /// Unreserve the address range and drop the bitmap. Idempotent; also run
    /// on drop.
    pub fn release(&mut self) {
        if let Some(base) = self.base.take() {
            // Safety: base/reserved describe the reservation made in `new`;
            // the slab stops handing out pointers into it.
            if let Err(e) = unsafe { self.vm.release(base, self.reserved) } {
                error!("slab({}-byte chunks): {e}", self.chunk_size);
            }
            stats::TOTAL_RESERVED.sub(self.reserved);
            stats::TOTAL_COMMITTED.sub(self.committed);
            stats::SLAB_LIVE_CHUNKS.sub(self.live);
        }
        self.committed = 0;
        self.live = 0;
        self.free_mask = FixedBitSet::new();
        self.cursor = Cursor::Full;
    }

    fn chunk_index(&self, ptr: NonNull<u8>) -> Option<usize> {
        let base = self.base?;
        let offset = (ptr.as_ptr() as usize).checked_sub(base.as_ptr() as usize)?;
        let index = offset / self.chunk_size;
        (index < self.free_mask.len()).then_some(index)
    }

    /// Whether `ptr` falls inside one of this slab's committed chunks.
    #[must_use]
    pub fn contains(&self, ptr: NonNull<u8>) -> bool {
        self.chunk_index(ptr).is_some()
    }

    #[must_use]
    pub fn chunk_count(&self) -> usize {
        self.free_mask.len()
    }

    #[must_use]
    pub fn committed_size(&self) -> usize {
        self.committed
    }

    #[must_use]
    pub fn reserved_capacity(&self) -> usize {
        self.reserved
    }

    #[must_use]
    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    #[must_use]
    pub fn chunks_in_use(&self) -> usize {
        self.live
    }

    /// Population count of the bitmap. O(chunks / 64).
    #[must_use]
    pub fn free_chunks(&self) -> usize {
        self.free_mask.count_ones(..)
    }

    /// `None` when `index` is not a committed chunk.
    #[must_use]
    pub fn is_chunk_free(&self, index: usize) -> Option<bool> {
        (index < self.free_mask.len()).then(|| self.free_mask.contains(index))
    }

    #[must_use]
    pub fn base_address(&self) -> Option<NonNull<u8>> {
        self.base
    }

    #[must_use]
    pub fn cursor(&self) -> Cursor {
        self.cursor
    }

    #[must_use]
    pub fn reset_policy(&self) -> ResetPolicy {
        self.reset
    }

    pub fn vm(&self) -> &V {
        &self.vm
    }
}

impl<V: VmOps> Drop for Slab<V> {
    fn drop(&mut self) {
        self.release();
    }
}

#[allow(clippy::cast_precision_loss)]
fn percent(new: usize, old: usize) -> f64 {
    if old == 0 {
        return f64::INFINITY;
    }
    new as f64 / old as f64 * 100.0
}
