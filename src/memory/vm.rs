use std::io;
use std::ptr::NonNull;

#[derive(Debug, thiserror::Error)]
pub enum VmError {
    #[error("VM reservation failed: {0}")]
    ReservationFailed(#[source] io::Error),
    #[error("VM commit failed: {0}")]
    CommitFailed(#[source] io::Error),
    #[error("VM decommit failed: {0}")]
    DecommitFailed(#[source] io::Error),
    #[error("VM release failed: {0}")]
    ReleaseFailed(#[source] io::Error),
}

/// Virtual memory and heap capabilities consumed by the allocators.
///
/// Implementations are passed by value into [`Slab`](super::slab::Slab) and
/// [`SizeClassAllocator`](super::size_class::SizeClassAllocator), so a test
/// double can carry state (commit budgets, call counters) behind `&self`.
pub trait VmOps {
    /// Reserve address space without committing physical pages.
    /// Returns a pointer to the start of the reserved range.
    ///
    /// # Safety
    /// The returned range must only be touched after [`commit`](VmOps::commit).
    unsafe fn reserve(&self, size: usize) -> Result<NonNull<u8>, VmError>;

    /// Commit (back with physical pages) a range within a reservation.
    ///
    /// # Safety
    /// `ptr` must be page aligned and `ptr..ptr + size` must lie inside a live
    /// reservation made by this `VmOps`.
    unsafe fn commit(&self, ptr: NonNull<u8>, size: usize) -> Result<(), VmError>;

    /// Decommit (return physical pages, keep address range reserved).
    ///
    /// # Safety
    /// Same range requirements as [`commit`](VmOps::commit). Nothing in the
    /// range may be accessed until it is committed again.
    unsafe fn decommit(&self, ptr: NonNull<u8>, size: usize) -> Result<(), VmError>;

    /// Release address space entirely (after which pointers are invalid).
    ///
    /// # Safety
    /// `ptr` and `size` must describe a whole reservation made by this
    /// `VmOps`.
    unsafe fn release(&self, ptr: NonNull<u8>, size: usize) -> Result<(), VmError>;

    /// Granularity of commit and decommit.
    fn page_size(&self) -> usize;

    /// General-purpose allocation for requests that bypass the slabs.
    fn heap_alloc(&self, size: usize) -> Option<NonNull<u8>> {
        // Safety: FFI call to malloc.
        NonNull::new(unsafe { libc::malloc(size.max(1)) }.cast::<u8>())
    }

    /// Free memory obtained from [`heap_alloc`](VmOps::heap_alloc).
    ///
    /// # Safety
    /// `ptr` must come from `heap_alloc` on an equivalent `VmOps` and must not
    /// have been freed already.
    unsafe fn heap_free(&self, ptr: NonNull<u8>) {
        // Safety: upheld by caller.
        unsafe { libc::free(ptr.as_ptr().cast::<libc::c_void>()) };
    }
}

/// The process's real virtual memory.
#[derive(Clone, Copy, Debug, Default)]
pub struct PlatformVmOps;

#[cfg(all(unix, not(any(loom, miri))))]
mod unix {
    use super::{NonNull, PlatformVmOps, VmError, VmOps, io};

    #[cfg(target_os = "linux")]
    const RESERVE_FLAGS: libc::c_int = libc::MAP_PRIVATE | libc::MAP_ANON | libc::MAP_NORESERVE;
    #[cfg(not(target_os = "linux"))]
    const RESERVE_FLAGS: libc::c_int = libc::MAP_PRIVATE | libc::MAP_ANON;

    impl VmOps for PlatformVmOps {
        unsafe fn reserve(&self, size: usize) -> Result<NonNull<u8>, VmError> {
            // Safety: FFI call to mmap.
            let ptr = unsafe {
                libc::mmap(std::ptr::null_mut(), size, libc::PROT_NONE, RESERVE_FLAGS, -1, 0)
            };

            if ptr == libc::MAP_FAILED {
                return Err(VmError::ReservationFailed(io::Error::last_os_error()));
            }

            NonNull::new(ptr.cast::<u8>())
                .ok_or_else(|| VmError::ReservationFailed(io::Error::other("mmap returned null")))
        }

        unsafe fn commit(&self, ptr: NonNull<u8>, size: usize) -> Result<(), VmError> {
            // Safety: FFI call to mprotect.
            if unsafe {
                libc::mprotect(
                    ptr.as_ptr().cast::<libc::c_void>(),
                    size,
                    libc::PROT_READ | libc::PROT_WRITE,
                )
            } != 0
            {
                return Err(VmError::CommitFailed(io::Error::last_os_error()));
            }
            Ok(())
        }

        unsafe fn decommit(&self, ptr: NonNull<u8>, size: usize) -> Result<(), VmError> {
            // MADV_FREE lets the kernel reclaim lazily; PROT_NONE removes
            // access until the range is committed again. Contents after a
            // recommit are unspecified (stale or zero).
            // Safety: FFI call to madvise.
            if unsafe { libc::madvise(ptr.as_ptr().cast::<libc::c_void>(), size, libc::MADV_FREE) }
                != 0
            {
                return Err(VmError::DecommitFailed(io::Error::last_os_error()));
            }
            // Safety: FFI call to mprotect.
            if unsafe {
                libc::mprotect(ptr.as_ptr().cast::<libc::c_void>(), size, libc::PROT_NONE)
            } != 0
            {
                return Err(VmError::DecommitFailed(io::Error::last_os_error()));
            }
            Ok(())
        }

        unsafe fn release(&self, ptr: NonNull<u8>, size: usize) -> Result<(), VmError> {
            // Safety: FFI call to munmap.
            if unsafe { libc::munmap(ptr.as_ptr().cast::<libc::c_void>(), size) } != 0 {
                return Err(VmError::ReleaseFailed(io::Error::last_os_error()));
            }
            Ok(())
        }

        fn page_size(&self) -> usize {
            use crate::sync::OnceLock;
            static CACHED: OnceLock<usize> = OnceLock::new();
            *CACHED.get_or_init(|| {
                // Safety: FFI call to sysconf.
                let raw = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
                assert!(
                    raw > 0,
                    "sysconf(_SC_PAGESIZE) failed: {}",
                    io::Error::last_os_error()
                );
                #[allow(clippy::cast_sign_loss, clippy::cast_possible_truncation)]
                {
                    raw as usize
                }
            })
        }
    }
}

// ---------------------------------------------------------------------------
// Loom / Miri: heap-backed reservations.
//
// Neither can issue real VM syscalls, so every "reservation" is a plain
// zeroed heap block. `commit` / `decommit` are no-ops: the memory is always
// accessible once reserved. Enough to exercise the bookkeeping and the
// unsafe pointer arithmetic; page-level behaviour is covered by the real
// implementation in normal builds.
// ---------------------------------------------------------------------------
#[cfg(any(loom, miri))]
const MOCK_PAGE_SIZE: usize = 4096;

#[cfg(any(loom, miri))]
impl VmOps for PlatformVmOps {
    unsafe fn reserve(&self, size: usize) -> Result<NonNull<u8>, VmError> {
        if size == 0 {
            return Err(VmError::ReservationFailed(io::Error::new(
                io::ErrorKind::InvalidInput,
                "zero-size reservation",
            )));
        }
        let layout = std::alloc::Layout::from_size_align(size, MOCK_PAGE_SIZE)
            .map_err(|e| VmError::ReservationFailed(io::Error::other(e)))?;
        // Safety: layout has non-zero size.
        let ptr = unsafe { std::alloc::alloc_zeroed(layout) };
        NonNull::new(ptr).ok_or_else(|| {
            VmError::ReservationFailed(io::Error::new(
                io::ErrorKind::OutOfMemory,
                "alloc returned null",
            ))
        })
    }

    unsafe fn commit(&self, _ptr: NonNull<u8>, _size: usize) -> Result<(), VmError> {
        Ok(())
    }

    unsafe fn decommit(&self, _ptr: NonNull<u8>, _size: usize) -> Result<(), VmError> {
        Ok(())
    }

    unsafe fn release(&self, ptr: NonNull<u8>, size: usize) -> Result<(), VmError> {
        let layout = std::alloc::Layout::from_size_align(size, MOCK_PAGE_SIZE)
            .map_err(|e| VmError::ReleaseFailed(io::Error::other(e)))?;
        // Safety: ptr was allocated with the same layout via `reserve`.
        unsafe { std::alloc::dealloc(ptr.as_ptr(), layout) };
        Ok(())
    }

    fn page_size(&self) -> usize {
        MOCK_PAGE_SIZE
    }
}

#[cfg(all(test, not(any(loom, miri))))]
mod tests {
    use super::*;

    #[test]
    fn test_reserve_commit_release() {
        let vm = PlatformVmOps;
        let size = vm.page_size();
        // Safety: Test code.
        unsafe {
            let ptr = vm.reserve(size).expect("Reserve failed");
            vm.commit(ptr, size).expect("Commit failed");

            let slice = std::slice::from_raw_parts_mut(ptr.as_ptr(), size);
            slice[0] = 42;
            assert_eq!(slice[0], 42);

            vm.decommit(ptr, size).expect("Decommit failed");
            vm.release(ptr, size).expect("Release failed");
        }
    }

    #[test]
    fn test_reserve_zero_size() {
        // mmap with length 0 fails with EINVAL.
        // Safety: Test code.
        let result = unsafe { PlatformVmOps.reserve(0) };
        assert!(matches!(result, Err(VmError::ReservationFailed(_))));
    }

    #[test]
    fn test_partial_commit_then_extend() {
        // Commit the head of a reservation, then the next pages: the shape of
        // slab growth.
        let vm = PlatformVmOps;
        let page = vm.page_size();
        let total = page * 8;
        // Safety: Test code.
        unsafe {
            let ptr = vm.reserve(total).expect("Reserve failed");
            vm.commit(ptr, page).expect("Initial commit failed");
            *ptr.as_ptr() = 1;

            let tail = NonNull::new_unchecked(ptr.as_ptr().add(page));
            vm.commit(tail, page * 3).expect("Extending commit failed");
            *tail.as_ptr().add(page * 3 - 1) = 2;

            assert_eq!(*ptr.as_ptr(), 1);
            assert_eq!(*tail.as_ptr().add(page * 3 - 1), 2);

            vm.release(ptr, total).expect("Release failed");
        }
    }

    #[test]
    fn test_commit_unaligned_length() {
        // mprotect rounds the length up to whole pages.
        let vm = PlatformVmOps;
        let page = vm.page_size();
        // Safety: Test code.
        unsafe {
            let ptr = vm.reserve(page * 2).expect("Reserve failed");
            vm.commit(ptr, page + 1).expect("Commit unaligned failed");
            *ptr.as_ptr().add(page) = 42;
            vm.release(ptr, page * 2).expect("Release failed");
        }
    }

    #[test]
    fn test_decommit_then_recommit() {
        let vm = PlatformVmOps;
        let size = vm.page_size();
        // Safety: Test code.
        unsafe {
            let ptr = vm.reserve(size).expect("Reserve failed");
            vm.commit(ptr, size).expect("Commit failed");
            std::ptr::write_bytes(ptr.as_ptr(), 0xAA, size);

            vm.decommit(ptr, size).expect("Decommit failed");
            vm.commit(ptr, size).expect("Recommit failed");

            // Contents are unspecified after a recommit; only access matters.
            *ptr.as_ptr() = 0x42;
            assert_eq!(*ptr.as_ptr(), 0x42);

            vm.release(ptr, size).expect("Release failed");
        }
    }

    #[test]
    fn test_page_size_is_power_of_two() {
        let size = PlatformVmOps.page_size();
        assert!(size.is_power_of_two(), "Page size {size} is not power of two");
    }

    #[test]
    fn test_reserve_very_large() {
        // Reserving without committing must not need backing memory.
        let vm = PlatformVmOps;
        let size = 64 * 1024 * 1024 * 1024;
        // Safety: Test code.
        unsafe {
            let ptr = vm.reserve(size).expect("Failed to reserve 64GB");
            vm.release(ptr, size).expect("Release failed");
        }
    }

    #[test]
    fn test_heap_alloc_and_free() {
        let vm = PlatformVmOps;
        let ptr = vm.heap_alloc(10_000).expect("heap_alloc failed");
        // Safety: Test code.
        unsafe {
            ptr.as_ptr().add(9_999).write(7);
            assert_eq!(ptr.as_ptr().add(9_999).read(), 7);
            vm.heap_free(ptr);
        }
    }
}
