//! Allocation Facade
//!
//! Typed page and byte allocation over the swappable memory services
//! backend. Critical allocations are the ones the handover cannot happen
//! without; their failure surfaces as an error that the top-level handler
//! turns into a halt. Best-effort allocations simply return `None`.

use crate::config::{ALLOCATION_CEILING, PAGE_SIZE};
use crate::services::MemoryServices;

use core::fmt;
use core::ptr::NonNull;
use hyper_protocol::MEMORY_TYPE_LOADER_RECLAIMABLE;

/// Memory type used when the caller does not care.
pub const DEFAULT_ALLOC_TYPE: u32 = MEMORY_TYPE_LOADER_RECLAIMABLE;

/// A failed critical allocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AllocError {
    /// Requested fixed address, if any.
    pub address: Option<u64>,
    pub count: usize,
    pub ty: u32,
}

impl fmt::Display for AllocError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.address {
            Some(address) => write!(
                f,
                "failed to satisfy an allocation at {:#x} with {} pages of type {:#x}",
                address, self.count, self.ty
            ),
            None => write!(
                f,
                "failed to satisfy an allocation at <any-address> with {} pages of type {:#x}",
                self.count, self.ty
            ),
        }
    }
}

#[must_use]
pub const fn page_count(bytes: usize) -> usize {
    bytes.div_ceil(PAGE_SIZE)
}

/// Cheap, copyable handle over the memory services backend.
#[derive(Clone, Copy)]
pub struct Allocator<'a> {
    ms: &'a dyn MemoryServices,
}

impl<'a> Allocator<'a> {
    pub fn new(ms: &'a dyn MemoryServices) -> Self {
        Self { ms }
    }

    fn do_allocate(&self, address: Option<u64>, count: usize, ty: u32) -> Option<NonNull<u8>> {
        let result = match address {
            Some(address) => self.ms.allocate_pages_at(address, count, ty),
            None => self.ms.allocate_pages(count, ALLOCATION_CEILING, ty),
        };

        result.and_then(|addr| NonNull::new(addr as *mut u8))
    }

    // -- Best-effort allocations.

    pub fn allocate_pages(&self, count: usize) -> Option<NonNull<u8>> {
        self.allocate_pages_with_type(count, DEFAULT_ALLOC_TYPE)
    }

    pub fn allocate_pages_with_type(&self, count: usize, ty: u32) -> Option<NonNull<u8>> {
        let result = self.do_allocate(None, count, ty);
        if result.is_none() {
            log::warn!(
                "failed to satisfy an allocation at <any-address> with {count} pages of type {ty:#x}"
            );
        }
        result
    }

    pub fn allocate_bytes(&self, len: usize) -> Option<NonNull<u8>> {
        self.allocate_pages(page_count(len))
    }

    // -- Critical allocations: failure is unrecoverable for the boot.

    pub fn allocate_critical_pages(&self, count: usize) -> Result<NonNull<u8>, AllocError> {
        self.allocate_critical_pages_with_type(count, DEFAULT_ALLOC_TYPE)
    }

    pub fn allocate_critical_pages_with_type(
        &self,
        count: usize,
        ty: u32,
    ) -> Result<NonNull<u8>, AllocError> {
        self.do_allocate(None, count, ty).ok_or(AllocError {
            address: None,
            count,
            ty,
        })
    }

    pub fn allocate_critical_pages_with_type_at(
        &self,
        address: u64,
        count: usize,
        ty: u32,
    ) -> Result<NonNull<u8>, AllocError> {
        self.do_allocate(Some(address), count, ty)
            .ok_or(AllocError {
                address: Some(address),
                count,
                ty,
            })
    }

    pub fn allocate_critical_bytes(&self, len: usize) -> Result<NonNull<u8>, AllocError> {
        self.allocate_critical_pages(page_count(len))
    }

    // -- Release.

    pub fn free_pages(&self, address: u64, count: usize) {
        self.ms.free_pages(address, count);
    }

    pub fn free_bytes(&self, address: u64, len: usize) {
        self.free_pages(address, page_count(len));
    }
}

#[cfg(test)]
mod tests {
    extern crate std;

    use super::*;
    use core::cell::RefCell;
    use hyper_protocol::MemoryMapEntry;
    use std::vec::Vec;

    /// Backend that hands out fake addresses and fails on request.
    struct FlakyBackend {
        remaining: RefCell<usize>,
        calls: RefCell<Vec<(Option<u64>, usize, u32)>>,
    }

    impl MemoryServices for FlakyBackend {
        fn allocate_pages_at(&self, address: u64, count: usize, ty: u32) -> Option<u64> {
            self.calls.borrow_mut().push((Some(address), count, ty));
            let mut remaining = self.remaining.borrow_mut();
            if *remaining == 0 {
                return None;
            }
            *remaining -= 1;
            Some(address)
        }

        fn allocate_pages(&self, count: usize, _upper_limit: u64, ty: u32) -> Option<u64> {
            self.calls.borrow_mut().push((None, count, ty));
            let mut remaining = self.remaining.borrow_mut();
            if *remaining == 0 {
                return None;
            }
            *remaining -= 1;
            Some(0x10_0000)
        }

        fn free_pages(&self, _address: u64, _count: usize) {}

        fn copy_map(&self, _into: Option<&mut [MemoryMapEntry]>, _key: &mut usize) -> usize {
            0
        }

        fn handover(&self, _key: usize) -> bool {
            true
        }
    }

    #[test]
    fn critical_failure_reports_the_request() {
        let backend = FlakyBackend {
            remaining: RefCell::new(0),
            calls: RefCell::new(Vec::new()),
        };
        let alloc = Allocator::new(&backend);

        let err = alloc
            .allocate_critical_pages_with_type_at(0x20_0000, 3, 0xFFFF_0004)
            .unwrap_err();
        assert_eq!(err.address, Some(0x20_0000));
        assert_eq!(err.count, 3);
        assert_eq!(err.ty, 0xFFFF_0004);
    }

    #[test]
    fn best_effort_failure_is_none() {
        let backend = FlakyBackend {
            remaining: RefCell::new(0),
            calls: RefCell::new(Vec::new()),
        };
        let alloc = Allocator::new(&backend);
        assert!(alloc.allocate_pages(1).is_none());
    }

    #[test]
    fn byte_allocations_round_up_to_pages() {
        let backend = FlakyBackend {
            remaining: RefCell::new(4),
            calls: RefCell::new(Vec::new()),
        };
        let alloc = Allocator::new(&backend);

        alloc.allocate_critical_bytes(1).unwrap();
        alloc.allocate_critical_bytes(PAGE_SIZE + 1).unwrap();

        let calls = backend.calls.borrow();
        assert_eq!(calls[0].1, 1);
        assert_eq!(calls[1].1, 2);
        assert_eq!(calls[0].2, DEFAULT_ALLOC_TYPE);
    }
}
