//! Stateful `VmOps` double for unit tests.
//!
//! Reservations are page-aligned heap blocks (like the loom/miri backend), so
//! tests never depend on the host's overcommit settings. Commits can be capped
//! to simulate the OS refusing to back more pages, and every call is counted.

use super::vm::{VmError, VmOps};
use std::alloc::Layout;
use std::cell::RefCell;
use std::io;
use std::ptr::NonNull;
use std::rc::Rc;

pub(crate) const MOCK_PAGE_SIZE: usize = 4096;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub(crate) struct MockCalls {
    pub reserves: usize,
    pub releases: usize,
    pub commits: usize,
    pub committed_bytes: usize,
    pub decommitted_bytes: usize,
    pub heap_allocs: usize,
    pub heap_frees: usize,
}

#[derive(Default)]
struct MockState {
    calls: MockCalls,
    /// Remaining bytes `commit` will accept; `None` = unlimited.
    commit_budget: Option<usize>,
    fail_reserve: bool,
    /// Report release failures; the block is still freed and not counted.
    fail_release: bool,
}

#[derive(Clone, Default)]
pub(crate) struct MockVm {
    state: Rc<RefCell<MockState>>,
}

impl MockVm {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Accept at most `bytes` more committed bytes, then fail every commit.
    pub(crate) fn limit_commits(&self, bytes: usize) {
        self.state.borrow_mut().commit_budget = Some(bytes);
    }

    pub(crate) fn unlimit_commits(&self) {
        self.state.borrow_mut().commit_budget = None;
    }

    pub(crate) fn fail_reserve(&self, fail: bool) {
        self.state.borrow_mut().fail_reserve = fail;
    }

    pub(crate) fn fail_release(&self, fail: bool) {
        self.state.borrow_mut().fail_release = fail;
    }

    pub(crate) fn calls(&self) -> MockCalls {
        self.state.borrow().calls
    }

    fn layout(size: usize) -> Result<Layout, io::Error> {
        Layout::from_size_align(size, MOCK_PAGE_SIZE).map_err(io::Error::other)
    }
}

impl VmOps for MockVm {
    unsafe fn reserve(&self, size: usize) -> Result<NonNull<u8>, VmError> {
        let mut state = self.state.borrow_mut();
        if state.fail_reserve || size == 0 {
            return Err(VmError::ReservationFailed(io::Error::from(
                io::ErrorKind::OutOfMemory,
            )));
        }
        let layout = Self::layout(size).map_err(VmError::ReservationFailed)?;
        // Safety: layout has non-zero size.
        let ptr = unsafe { std::alloc::alloc_zeroed(layout) };
        let ptr = NonNull::new(ptr).ok_or_else(|| {
            VmError::ReservationFailed(io::Error::from(io::ErrorKind::OutOfMemory))
        })?;
        state.calls.reserves += 1;
        Ok(ptr)
    }

    unsafe fn commit(&self, ptr: NonNull<u8>, size: usize) -> Result<(), VmError> {
        let mut state = self.state.borrow_mut();
        if !(ptr.as_ptr() as usize).is_multiple_of(MOCK_PAGE_SIZE) {
            return Err(VmError::CommitFailed(io::Error::new(
                io::ErrorKind::InvalidInput,
                "commit address is not page aligned",
            )));
        }
        if let Some(budget) = state.commit_budget {
            if size > budget {
                return Err(VmError::CommitFailed(io::Error::from(
                    io::ErrorKind::OutOfMemory,
                )));
            }
            state.commit_budget = Some(budget - size);
        }
        state.calls.commits += 1;
        state.calls.committed_bytes += size;
        Ok(())
    }

    unsafe fn decommit(&self, ptr: NonNull<u8>, size: usize) -> Result<(), VmError> {
        if !(ptr.as_ptr() as usize).is_multiple_of(MOCK_PAGE_SIZE) {
            return Err(VmError::DecommitFailed(io::Error::new(
                io::ErrorKind::InvalidInput,
                "decommit address is not page aligned",
            )));
        }
        self.state.borrow_mut().calls.decommitted_bytes += size;
        Ok(())
    }

    unsafe fn release(&self, ptr: NonNull<u8>, size: usize) -> Result<(), VmError> {
        let layout = Self::layout(size).map_err(VmError::ReleaseFailed)?;
        // Safety: ptr was allocated with the same layout via `reserve`.
        unsafe { std::alloc::dealloc(ptr.as_ptr(), layout) };
        if self.state.borrow().fail_release {
            return Err(VmError::ReleaseFailed(io::Error::from(
                io::ErrorKind::PermissionDenied,
            )));
        }
        self.state.borrow_mut().calls.releases += 1;
        Ok(())
    }

    fn page_size(&self) -> usize {
        MOCK_PAGE_SIZE
    }

    fn heap_alloc(&self, size: usize) -> Option<NonNull<u8>> {
        // Safety: FFI call to malloc.
        let ptr = NonNull::new(unsafe { libc::malloc(size.max(1)) }.cast::<u8>())?;
        self.state.borrow_mut().calls.heap_allocs += 1;
        Some(ptr)
    }

    unsafe fn heap_free(&self, ptr: NonNull<u8>) {
        // Safety: upheld by caller.
        unsafe { libc::free(ptr.as_ptr().cast::<libc::c_void>()) };
        self.state.borrow_mut().calls.heap_frees += 1;
    }
}
