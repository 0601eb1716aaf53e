//! Page Table Construction
//!
//! Builds a 4-level (48-bit VA) x86-64 page table out of pages supplied
//! by a [`TableAllocator`]. The loader runs identity-mapped, so table
//! physical addresses are dereferenced directly while the structure is
//! being built.

#![no_std]
#![deny(unsafe_op_in_unsafe_fn)]

use bitflags::bitflags;
use core::fmt;

pub const PAGE_SIZE: usize = 4096;
pub const HUGE_PAGE_SIZE: usize = 2 * 1024 * 1024;
pub const ENTRIES_PER_TABLE: usize = 512;

bitflags! {
    /// Page table entry bits used by the loader.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct EntryFlags: u64 {
        const PRESENT = 1 << 0;
        const WRITABLE = 1 << 1;
        const HUGE = 1 << 7;
    }
}

const ADDRESS_MASK: u64 = 0x000F_FFFF_FFFF_F000;

/// Supplies zeroed, page-aligned, identity-accessible 4 KiB tables.
pub trait TableAllocator {
    /// Returns the physical address of a fresh table, or `None` if the
    /// allocation failed.
    fn allocate_table(&mut self) -> Option<u64>;
}

/// Errors raised while inserting mappings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[must_use = "mapping errors must be handled"]
pub enum MapError {
    /// Virtual or physical address not aligned to the mapping size.
    Misaligned,
    /// The walk ran into an existing huge mapping.
    HugeConflict,
    /// The allocator could not provide an intermediate table.
    AllocationFailed,
}

impl fmt::Display for MapError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Misaligned => write!(f, "address is not aligned to the mapping size"),
            Self::HugeConflict => write!(f, "range is already covered by a huge mapping"),
            Self::AllocationFailed => write!(f, "failed to allocate a page table"),
        }
    }
}

/// A 4-level page table rooted at a physical address.
pub struct PageTable {
    root: u64,
}

fn table_index(virt: u64, shift: u32) -> usize {
    ((virt >> shift) & (ENTRIES_PER_TABLE as u64 - 1)) as usize
}

/// Read or create the next-level table behind `table[index]`.
fn table_at<A: TableAllocator>(
    table: u64,
    index: usize,
    alloc: &mut A,
) -> Result<u64, MapError> {
    // SAFETY: `table` is a live page table previously handed out by the
    // allocator (or the root), identity-accessible per the trait contract.
    let entry_ptr = unsafe { (table as *mut u64).add(index) };
    let entry = unsafe { entry_ptr.read() };

    if entry & EntryFlags::PRESENT.bits() != 0 {
        if entry & EntryFlags::HUGE.bits() != 0 {
            return Err(MapError::HugeConflict);
        }
        return Ok(entry & ADDRESS_MASK);
    }

    let page = alloc.allocate_table().ok_or(MapError::AllocationFailed)?;
    let flags = EntryFlags::PRESENT | EntryFlags::WRITABLE;
    // SAFETY: same identity-access contract as above.
    unsafe { entry_ptr.write(page | flags.bits()) };
    Ok(page)
}

impl PageTable {
    /// Allocate an empty root table.
    pub fn new<A: TableAllocator>(alloc: &mut A) -> Result<Self, MapError> {
        let root = alloc.allocate_table().ok_or(MapError::AllocationFailed)?;
        Ok(Self { root })
    }

    /// Physical address to load into CR3.
    #[must_use]
    pub fn root(&self) -> u64 {
        self.root
    }

    fn map_one<A: TableAllocator>(
        &mut self,
        virt: u64,
        phys: u64,
        huge: bool,
        alloc: &mut A,
    ) -> Result<(), MapError> {
        let alignment = if huge { HUGE_PAGE_SIZE } else { PAGE_SIZE } as u64;
        if virt % alignment != 0 || phys % alignment != 0 {
            return Err(MapError::Misaligned);
        }

        let lvl3 = table_at(self.root, table_index(virt, 39), alloc)?;
        let lvl2 = table_at(lvl3, table_index(virt, 30), alloc)?;

        if huge {
            let flags = EntryFlags::PRESENT | EntryFlags::WRITABLE | EntryFlags::HUGE;
            // SAFETY: `lvl2` is a live identity-accessible table.
            unsafe {
                (lvl2 as *mut u64)
                    .add(table_index(virt, 21))
                    .write(phys | flags.bits());
            }
            return Ok(());
        }

        let lvl1 = table_at(lvl2, table_index(virt, 21), alloc)?;
        let flags = EntryFlags::PRESENT | EntryFlags::WRITABLE;
        // SAFETY: `lvl1` is a live identity-accessible table.
        unsafe {
            (lvl1 as *mut u64)
                .add(table_index(virt, 12))
                .write(phys | flags.bits());
        }
        Ok(())
    }

    pub fn map_page<A: TableAllocator>(
        &mut self,
        virt: u64,
        phys: u64,
        alloc: &mut A,
    ) -> Result<(), MapError> {
        self.map_one(virt, phys, false, alloc)
    }

    pub fn map_huge_page<A: TableAllocator>(
        &mut self,
        virt: u64,
        phys: u64,
        alloc: &mut A,
    ) -> Result<(), MapError> {
        self.map_one(virt, phys, true, alloc)
    }

    pub fn map_pages<A: TableAllocator>(
        &mut self,
        mut virt: u64,
        mut phys: u64,
        count: usize,
        alloc: &mut A,
    ) -> Result<(), MapError> {
        for _ in 0..count {
            self.map_one(virt, phys, false, alloc)?;
            virt += PAGE_SIZE as u64;
            phys += PAGE_SIZE as u64;
        }
        Ok(())
    }

    pub fn map_huge_pages<A: TableAllocator>(
        &mut self,
        mut virt: u64,
        mut phys: u64,
        count: usize,
        alloc: &mut A,
    ) -> Result<(), MapError> {
        for _ in 0..count {
            self.map_one(virt, phys, true, alloc)?;
            virt += HUGE_PAGE_SIZE as u64;
            phys += HUGE_PAGE_SIZE as u64;
        }
        Ok(())
    }

    /// Follow the table to the physical address `virt` maps to. Meant for
    /// inspection, not for the hot path.
    #[must_use]
    pub fn translate(&self, virt: u64) -> Option<u64> {
        let mut table = self.root;

        for shift in [39, 30, 21] {
            // SAFETY: live identity-accessible table.
            let entry = unsafe { (table as *const u64).add(table_index(virt, shift)).read() };
            if entry & EntryFlags::PRESENT.bits() == 0 {
                return None;
            }
            if entry & EntryFlags::HUGE.bits() != 0 {
                // Only level-2 huge pages are produced here.
                if shift != 21 {
                    return None;
                }
                let base = entry & ADDRESS_MASK & !(HUGE_PAGE_SIZE as u64 - 1);
                return Some(base + (virt & (HUGE_PAGE_SIZE as u64 - 1)));
            }
            table = entry & ADDRESS_MASK;
        }

        // SAFETY: live identity-accessible table.
        let entry = unsafe { (table as *const u64).add(table_index(virt, 12)).read() };
        if entry & EntryFlags::PRESENT.bits() == 0 {
            return None;
        }
        Some((entry & ADDRESS_MASK) + (virt & (PAGE_SIZE as u64 - 1)))
    }
}
