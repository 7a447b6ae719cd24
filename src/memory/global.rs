use super::config::SizeClassConfig;
use super::error::{AllocError, InitError};
use super::size_class::{FreedFrom, SizeClassAllocator};
use super::stats::MemoryStats;
use crate::sync::{Mutex, MutexGuard, OnceLock};
use log::warn;
use std::ptr::NonNull;
use std::sync::PoisonError;

static GLOBAL_SIZE_CLASS_ALLOCATOR: OnceLock<Mutex<SizeClassAllocator>> = OnceLock::new();

/// Process-wide [`SizeClassAllocator`] behind one mutex.
///
/// Initialised explicitly with [`init`](Self::init) or lazily with
/// `SizeClassConfig::default()` on the first allocation.
pub struct GlobalSizeClassAllocator;

impl GlobalSizeClassAllocator {
    /// The global instance, plus whether this call's candidate became it.
    fn ensure_initialized(
        config: impl FnOnce() -> SizeClassConfig,
    ) -> Result<(&'static Mutex<SizeClassAllocator>, bool), InitError> {
        if let Some(alloc) = GLOBAL_SIZE_CLASS_ALLOCATOR.get() {
            return Ok((alloc, false));
        }

        let candidate = Mutex::new(SizeClassAllocator::with_config(config())?);
        let mut stored = false;
        // Losing the race drops our candidate and its reservations.
        let alloc = GLOBAL_SIZE_CLASS_ALLOCATOR.get_or_init(|| {
            stored = true;
            candidate
        });
        Ok((alloc, stored))
    }

    fn lock(alloc: &'static Mutex<SizeClassAllocator>) -> MutexGuard<'static, SizeClassAllocator> {
        // Every operation leaves the allocator consistent before it can
        // panic, so a poisoned lock is still usable.
        alloc.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Build the global instance from `config`.
    ///
    /// Returns `Ok(true)` only if the instance built from `config` is the one
    /// installed. `Ok(false)` means another caller got there first, including
    /// one racing this call, and `config` is ignored.
    ///
    /// # Errors
    ///
    /// The [`InitError`] from building the allocator.
    pub fn init(config: SizeClassConfig) -> Result<bool, InitError> {
        let (_, stored) = Self::ensure_initialized(|| config)?;
        Ok(stored)
    }

    pub fn get() -> Option<&'static Mutex<SizeClassAllocator>> {
        GLOBAL_SIZE_CLASS_ALLOCATOR.get()
    }

    /// Allocate at least `size` bytes from the global instance.
    ///
    /// # Errors
    ///
    /// `AllocError::Init` if the lazily built default instance could not be
    /// created, otherwise as [`SizeClassAllocator::allocate`].
    pub fn alloc(size: usize) -> Result<NonNull<u8>, AllocError> {
        let (alloc, _) = Self::ensure_initialized(SizeClassConfig::default)?;
        Self::lock(alloc).allocate(size)
    }

    /// Give `ptr` back to the global instance. Before initialisation nothing
    /// can be owned, so the pointer is left alone and reported `Unowned`.
    ///
    /// # Safety
    ///
    /// As [`SizeClassAllocator::free`]; `ptr` must come from
    /// [`alloc`](Self::alloc).
    pub unsafe fn free(ptr: *mut u8, size_hint: usize) -> FreedFrom {
        if ptr.is_null() {
            return FreedFrom::Null;
        }
        let Some(alloc) = Self::get() else {
            warn!("global size-class allocator: free of {ptr:p} before initialisation");
            return FreedFrom::Unowned;
        };
        // Safety: upheld by caller.
        unsafe { Self::lock(alloc).free(ptr, size_hint) }
    }

    /// Bulk-reset every bucket of the global instance, if it exists.
    pub fn free_all() {
        if let Some(alloc) = Self::get() {
            Self::lock(alloc).free_all();
        }
    }

    /// Run `f` with the global instance locked; `None` before initialisation.
    pub fn with<R>(f: impl FnOnce(&mut SizeClassAllocator) -> R) -> Option<R> {
        Self::get().map(|alloc| f(&mut Self::lock(alloc)))
    }

    #[must_use]
    pub fn stats() -> MemoryStats {
        MemoryStats::capture()
    }
}
