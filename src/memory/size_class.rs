use super::bits;
use super::config::SizeClassConfig;
use super::error::{AllocError, InitError};
use super::slab::Slab;
use super::stats;
use super::vm::{PlatformVmOps, VmOps};
use log::{debug, trace, warn};
use std::ptr::NonNull;

/// Where [`SizeClassAllocator::free`] sent a pointer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FreedFrom {
    /// Null pointer; nothing happened.
    Null,
    /// Returned to the bucket with this index.
    Bucket(usize),
    /// Handed to the heap's free.
    Heap,
    /// No bucket owns it and the heap path was not taken.
    Unowned,
}

/// General `allocate(size)` / `free(ptr)` over one [`Slab`] per power-of-two
/// size class.
///
/// Bucket `k` holds chunks of `min_chunk << k` bytes. Requests up to
/// `max_chunk` are rounded up to the next class, so a chunk is always less
/// than twice the request (above `min_chunk`). Larger requests go to the
/// heap unless `heap_fallback` is off.
///
/// Not thread-safe; see [`GlobalSizeClassAllocator`](super::global::GlobalSizeClassAllocator)
/// for a locked process-wide instance.
pub struct SizeClassAllocator<V: VmOps + Clone = PlatformVmOps> {
    buckets: Vec<Slab<V>>,
    config: SizeClassConfig,
    min_shift: u32,
    /// Heap-served allocations this instance has counted and not yet freed.
    heap_live: usize,
    vm: V,
}

impl SizeClassAllocator<PlatformVmOps> {
    /// # Errors
    ///
    /// See [`SizeClassAllocator::new`].
    pub fn with_config(config: SizeClassConfig) -> Result<Self, InitError> {
        Self::new(PlatformVmOps, config)
    }
}

impl<V: VmOps + Clone> SizeClassAllocator<V> {
    /// Build one slab per size class. Each bucket gets its own reservation of
    /// `config.max_capacity` bytes.
    ///
    /// # Errors
    ///
    /// `InitError::Config` for an invalid config, `InitError::Vm` if any
    /// bucket cannot reserve or commit its starting window. Buckets built
    /// before the failure are released.
    pub fn new(vm: V, config: SizeClassConfig) -> Result<Self, InitError> {
        config.validate()?;

        let buckets = (0..config.bucket_count())
            .map(|k| Slab::new(vm.clone(), config.slab_config(k)))
            .collect::<Result<Vec<_>, _>>()?;

        debug!(
            "size-class allocator: {} buckets, {}..={} bytes, heap fallback {}",
            buckets.len(),
            config.min_chunk,
            config.max_chunk,
            if config.heap_fallback { "on" } else { "off" }
        );

        Ok(Self {
            buckets,
            min_shift: bits::floor_log2(config.min_chunk),
            config,
            heap_live: 0,
            vm,
        })
    }

    /// Bucket serving `size`, or `None` when it exceeds `max_chunk`.
    /// Sizes up to `min_chunk` (zero included) map to bucket 0.
    #[must_use]
    pub fn bucket_index(&self, size: usize) -> Option<usize> {
        if size > self.config.max_chunk {
            return None;
        }
        Some(bits::ceil_log2(size).saturating_sub(self.min_shift) as usize)
    }

    /// Allocate at least `size` bytes.
    ///
    /// # Errors
    ///
    /// Whatever the bucket's slab reports, `AllocError::HeapFailed` when an
    /// oversized request is refused by the heap, or `AllocError::TooLarge`
    /// when it may not go to the heap at all.
    pub fn allocate(&mut self, size: usize) -> Result<NonNull<u8>, AllocError> {
        match self.bucket_index(size) {
            Some(k) => self.buckets[k].allocate(),
            None => self.heap_allocate(size),
        }
    }

    fn heap_allocate(&mut self, size: usize) -> Result<NonNull<u8>, AllocError> {
        if !self.config.heap_fallback {
            return Err(AllocError::TooLarge {
                size,
                max: self.config.max_chunk,
            });
        }
        let ptr = self
            .vm
            .heap_alloc(size)
            .ok_or(AllocError::HeapFailed { size })?;
        self.heap_live += 1;
        stats::HEAP_LIVE_ALLOCS.add(1);
        trace!(
            "size-class allocator: {size} bytes exceeds {} bytes, served by the heap at {ptr:p}",
            self.config.max_chunk
        );
        Ok(ptr)
    }

    /// Give `ptr` back.
    ///
    /// With a non-zero `size_hint` the pointer goes straight to that size's
    /// bucket, or to the heap above `max_chunk`. With a zero hint every bucket
    /// is asked in order and the heap is the last resort.
    ///
    /// # Safety
    ///
    /// Whenever this reaches the heap path, `ptr` must have come from
    /// [`allocate`](Self::allocate)'s heap path on this allocator and not been
    /// freed since. A non-zero `size_hint` must be the size that was
    /// requested.
    pub unsafe fn free(&mut self, ptr: *mut u8, size_hint: usize) -> FreedFrom {
        let Some(ptr) = NonNull::new(ptr) else {
            return FreedFrom::Null;
        };

        if size_hint == 0 {
            if let Some(k) = self.buckets.iter_mut().position(|slab| slab.free(ptr).is_owned()) {
                return FreedFrom::Bucket(k);
            }
            // Safety: upheld by caller.
            return unsafe { self.heap_free(ptr) };
        }

        match self.bucket_index(size_hint) {
            Some(k) if self.buckets[k].free(ptr).is_owned() => FreedFrom::Bucket(k),
            Some(k) => {
                warn!(
                    "size-class allocator: {ptr:p} freed with a {size_hint}-byte hint \
                     is not in the {}-byte bucket",
                    self.buckets[k].chunk_size()
                );
                FreedFrom::Unowned
            }
            // Safety: upheld by caller.
            None => unsafe { self.heap_free(ptr) },
        }
    }

    /// The gauge only drops while this instance has heap blocks outstanding,
    /// so foreign frees never take it below what `heap_allocate` counted.
    unsafe fn heap_free(&mut self, ptr: NonNull<u8>) -> FreedFrom {
        if !self.config.heap_fallback {
            warn!("size-class allocator: ignoring free of unowned pointer {ptr:p}");
            return FreedFrom::Unowned;
        }
        // Safety: upheld by caller of `free`.
        unsafe { self.vm.heap_free(ptr) };
        if let Some(left) = self.heap_live.checked_sub(1) {
            self.heap_live = left;
            stats::HEAP_LIVE_ALLOCS.sub(1);
        } else {
            debug!("size-class allocator: {ptr:p} was not served by this allocator's heap path");
        }
        FreedFrom::Heap
    }

    /// Bulk-reset every bucket. Heap-served allocations are not tracked and
    /// stay live.
    pub fn free_all(&mut self) {
        for slab in &mut self.buckets {
            slab.free_all();
        }
    }

    /// Index of the bucket whose committed chunks contain `ptr`.
    #[must_use]
    pub fn owner_of(&self, ptr: NonNull<u8>) -> Option<usize> {
        self.buckets.iter().position(|slab| slab.contains(ptr))
    }

    #[must_use]
    pub fn bucket(&self, index: usize) -> Option<&Slab<V>> {
        self.buckets.get(index)
    }

    #[must_use]
    pub fn buckets(&self) -> &[Slab<V>] {
        &self.buckets
    }

    #[must_use]
    pub fn min_chunk(&self) -> usize {
        self.config.min_chunk
    }

    #[must_use]
    pub fn max_chunk(&self) -> usize {
        self.config.max_chunk
    }

    #[must_use]
    pub fn config(&self) -> &SizeClassConfig {
        &self.config
    }

    /// Committed bytes summed over all buckets.
    #[must_use]
    pub fn committed_size(&self) -> usize {
        self.buckets.iter().map(Slab::committed_size).sum()
    }

    /// Live chunks summed over all buckets; heap allocations not included.
    #[must_use]
    pub fn chunks_in_use(&self) -> usize {
        self.buckets.iter().map(Slab::chunks_in_use).sum()
    }

    /// Heap-served allocations not yet freed.
    #[must_use]
    pub fn heap_allocs_in_use(&self) -> usize {
        self.heap_live
    }
}
