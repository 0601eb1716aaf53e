//! Global Heap Shim
//!
//! Backs the `alloc` crate with the memory services so the loader can use
//! `Vec` and `Box` for its bookkeeping. Everything is whole pages; the
//! collections involved are small and short-lived, so the waste is
//! acceptable. The backend pointer is process-wide, set once at init and
//! swapped during the firmware transition.

use crate::allocator::{page_count, Allocator};
use crate::services::MemoryServices;

use spin::Mutex;

type Backend = &'static (dyn MemoryServices + Sync);

static BACKEND: Mutex<Option<Backend>> = Mutex::new(None);

/// Install the allocation backend, returning the previous one if any.
pub fn set_backend(ms: Backend) -> Option<Backend> {
    BACKEND.lock().replace(ms)
}

fn backend() -> Option<Backend> {
    *BACKEND.lock()
}

/// Page-granular `GlobalAlloc` over the installed backend.
pub struct LoaderHeap;

// SAFETY: allocation is delegated to the backend; a missing backend or an
// oversized alignment request yields null, which `alloc` treats as OOM.
unsafe impl core::alloc::GlobalAlloc for LoaderHeap {
    unsafe fn alloc(&self, layout: core::alloc::Layout) -> *mut u8 {
        let Some(ms) = backend() else {
            return core::ptr::null_mut();
        };
        if layout.align() > crate::config::PAGE_SIZE || layout.size() == 0 {
            return core::ptr::null_mut();
        }

        match Allocator::new(ms).allocate_pages(page_count(layout.size())) {
            Some(ptr) => ptr.as_ptr(),
            None => core::ptr::null_mut(),
        }
    }

    unsafe fn dealloc(&self, ptr: *mut u8, layout: core::alloc::Layout) {
        let Some(ms) = backend() else {
            return;
        };
        Allocator::new(ms).free_pages(ptr as u64, page_count(layout.size()));
    }
}

#[cfg(target_os = "none")]
#[global_allocator]
static HEAP: LoaderHeap = LoaderHeap;
