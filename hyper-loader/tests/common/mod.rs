//! Mock firmware services and crafted ELF images for the end-to-end
//! boot tests.

use std::alloc::{alloc, Layout};
use std::cell::{Cell, RefCell};
use std::collections::HashMap;

use hyper_loader::services::{
    File, Filesystem, MemoryServices, Resolution, VideoMode, VideoServices,
};
use hyper_protocol::{exported_memory_type, Framebuffer, MemoryMapEntry, FB_FORMAT_RGB};

pub const PAGE_SIZE: usize = 4096;

// -- Memory services mock -------------------------------------------------

#[derive(Clone, Copy)]
pub struct Allocation {
    /// Address the loader asked for, when placement was fixed.
    pub requested_at: Option<u64>,
    /// Address actually handed out (a host buffer).
    pub at: u64,
    pub pages: usize,
    pub ty: u32,
}

struct MemoryState {
    map: Vec<MemoryMapEntry>,
    key: usize,
    allocations: Vec<Allocation>,
    snapshot_taken: bool,
    mutated_after_snapshot: bool,
    handover_done: bool,
    reserve_queries: usize,
    frees: usize,
    /// Armed by a size query; the next allocation then grows the map by
    /// this many extra entries, once.
    growth_entries: usize,
    growth_armed: bool,
}

pub struct MockMemory {
    state: RefCell<MemoryState>,
}

fn host_pages(pages: usize) -> u64 {
    let layout = Layout::from_size_align(pages * PAGE_SIZE, PAGE_SIZE).unwrap();
    // Leaked on purpose: "physical" memory must stay valid for the whole
    // test. Poisoned so missing zero-fills show up.
    let ptr = unsafe { alloc(layout) };
    assert!(!ptr.is_null());
    unsafe { std::ptr::write_bytes(ptr, 0xAA, pages * PAGE_SIZE) };
    ptr as u64
}

impl MockMemory {
    pub fn new() -> Self {
        let map = vec![
            MemoryMapEntry::new(0x0, 0x9F000, hyper_protocol::MEMORY_TYPE_FREE),
            MemoryMapEntry::new(0x100000, 64 * 1024 * 1024, hyper_protocol::MEMORY_TYPE_FREE),
            // Firmware-specific type; must be exported as RESERVED.
            MemoryMapEntry::new(0xE000_0000, 0x1000_0000, 9),
        ];
        Self {
            state: RefCell::new(MemoryState {
                map,
                key: 1,
                allocations: Vec::new(),
                snapshot_taken: false,
                mutated_after_snapshot: false,
                handover_done: false,
                reserve_queries: 0,
                frees: 0,
                growth_entries: 0,
                growth_armed: false,
            }),
        }
    }

    /// Make the map grow by `entries` extra entries on the allocation
    /// right after the next size query, as fragmenting firmware does.
    pub fn grow_on_next_reservation(&self, entries: usize) {
        self.state.borrow_mut().growth_entries = entries;
    }

    fn allocate(&self, requested_at: Option<u64>, pages: usize, ty: u32) -> u64 {
        let mut state = self.state.borrow_mut();
        if state.snapshot_taken {
            state.mutated_after_snapshot = true;
        }

        let at = host_pages(pages);
        state
            .map
            .push(MemoryMapEntry::new(at, (pages * PAGE_SIZE) as u64, ty));
        state.key += 1;

        if state.growth_armed && state.growth_entries > 0 {
            for i in 0..state.growth_entries {
                state
                    .map
                    .push(MemoryMapEntry::new(0x8000_0000 + i as u64 * 0x1000, 0x1000, 2));
            }
            state.key += 1;
            state.growth_entries = 0;
        }
        state.growth_armed = false;

        state.allocations.push(Allocation {
            requested_at,
            at,
            pages,
            ty,
        });
        at
    }

    pub fn allocation_at(&self, requested_at: u64) -> Option<Allocation> {
        self.state
            .borrow()
            .allocations
            .iter()
            .find(|a| a.requested_at == Some(requested_at))
            .copied()
    }

    pub fn last_allocation_of_type(&self, ty: u32) -> Option<Allocation> {
        self.state
            .borrow()
            .allocations
            .iter()
            .rev()
            .find(|a| a.ty == ty)
            .copied()
    }

    pub fn allocation_containing(&self, at: u64) -> Option<Allocation> {
        self.state
            .borrow()
            .allocations
            .iter()
            .find(|a| at >= a.at && at < a.at + (a.pages * PAGE_SIZE) as u64)
            .copied()
    }

    pub fn mutated_after_snapshot(&self) -> bool {
        self.state.borrow().mutated_after_snapshot
    }

    pub fn handover_done(&self) -> bool {
        self.state.borrow().handover_done
    }

    pub fn reserve_queries(&self) -> usize {
        self.state.borrow().reserve_queries
    }

    pub fn frees(&self) -> usize {
        self.state.borrow().frees
    }

    pub fn map_len(&self) -> usize {
        self.state.borrow().map.len()
    }
}

impl MemoryServices for MockMemory {
    fn allocate_pages_at(&self, address: u64, count: usize, ty: u32) -> Option<u64> {
        Some(self.allocate(Some(address), count, ty))
    }

    fn allocate_pages(&self, count: usize, _upper_limit: u64, ty: u32) -> Option<u64> {
        Some(self.allocate(None, count, ty))
    }

    fn free_pages(&self, address: u64, _count: usize) {
        let mut state = self.state.borrow_mut();
        if state.snapshot_taken {
            state.mutated_after_snapshot = true;
        }
        state.map.retain(|e| e.physical_address != address);
        state.key += 1;
        state.frees += 1;
    }

    fn copy_map(&self, into: Option<&mut [MemoryMapEntry]>, key: &mut usize) -> usize {
        let mut state = self.state.borrow_mut();
        let count = state.map.len();

        match into {
            None => {
                state.reserve_queries += 1;
                state.growth_armed = true;
            }
            Some(buffer) => {
                if buffer.len() >= count {
                    for (dest, entry) in buffer.iter_mut().zip(state.map.iter()) {
                        *dest = MemoryMapEntry::new(
                            entry.physical_address,
                            entry.size_in_bytes,
                            exported_memory_type(entry.ty),
                        );
                    }
                    *key = state.key;
                    state.snapshot_taken = true;
                }
            }
        }

        count
    }

    fn handover(&self, key: usize) -> bool {
        let mut state = self.state.borrow_mut();
        if !state.snapshot_taken || key != state.key || state.handover_done {
            return false;
        }
        state.handover_done = true;
        true
    }
}

// -- Video services mock --------------------------------------------------

pub struct MockVideo {
    pub modes: Vec<VideoMode>,
    pub native: Option<Resolution>,
    pub framebuffer_address: u64,
    set_calls: RefCell<Vec<u32>>,
    fail_set: Cell<bool>,
}

impl MockVideo {
    pub fn new(modes: Vec<VideoMode>, native: Option<Resolution>) -> Self {
        Self {
            modes,
            native,
            framebuffer_address: 0xFD00_0000,
            set_calls: RefCell::new(Vec::new()),
            fail_set: Cell::new(false),
        }
    }

    pub fn none() -> Self {
        Self::new(Vec::new(), None)
    }

    pub fn standard() -> Self {
        let modes = vec![
            VideoMode { width: 800, height: 600, bpp: 32, id: 0 },
            VideoMode { width: 1024, height: 768, bpp: 32, id: 1 },
            VideoMode { width: 1920, height: 1080, bpp: 32, id: 2 },
        ];
        Self::new(modes, Some(Resolution { width: 1920, height: 1080 }))
    }

    pub fn fail_set_mode(&self) {
        self.fail_set.set(true);
    }

    pub fn set_calls(&self) -> Vec<u32> {
        self.set_calls.borrow().clone()
    }
}

impl VideoServices for MockVideo {
    fn list_modes(&self) -> &[VideoMode] {
        &self.modes
    }

    fn query_resolution(&self) -> Option<Resolution> {
        self.native
    }

    fn set_mode(&self, id: u32) -> Option<Framebuffer> {
        self.set_calls.borrow_mut().push(id);
        if self.fail_set.get() {
            return None;
        }

        let mode = self.modes.iter().find(|m| m.id == id)?;
        Some(Framebuffer {
            width: mode.width,
            height: mode.height,
            pitch: mode.width * 4,
            bpp: mode.bpp,
            format: FB_FORMAT_RGB,
            pad: 0,
            physical_address: self.framebuffer_address,
        })
    }
}

// -- In-memory filesystem -------------------------------------------------

pub struct MemFs {
    files: HashMap<String, Vec<u8>>,
}

impl MemFs {
    pub fn new(files: &[(&str, Vec<u8>)]) -> Self {
        Self {
            files: files
                .iter()
                .map(|(path, data)| (path.to_string(), data.clone()))
                .collect(),
        }
    }
}

struct MemFile<'a> {
    data: &'a [u8],
}

impl File for MemFile<'_> {
    fn size(&self) -> u64 {
        self.data.len() as u64
    }

    fn read(&self, buf: &mut [u8], offset: u64) -> bool {
        let offset = offset as usize;
        let Some(end) = offset.checked_add(buf.len()) else {
            return false;
        };
        if end > self.data.len() {
            return false;
        }
        buf.copy_from_slice(&self.data[offset..end]);
        true
    }
}

impl Filesystem for MemFs {
    fn open(&self, path: &str) -> Option<Box<dyn File + '_>> {
        self.files
            .get(path)
            .map(|data| Box::new(MemFile { data }) as Box<dyn File + '_>)
    }
}

// -- Crafted ELF images ---------------------------------------------------

pub struct Segment {
    pub vaddr: u64,
    pub paddr: u64,
    pub data: Vec<u8>,
    pub memsz: u64,
}

impl Segment {
    pub fn simple(vaddr: u64, data: Vec<u8>) -> Self {
        let memsz = data.len() as u64;
        Self {
            vaddr,
            paddr: vaddr,
            data,
            memsz,
        }
    }

    pub fn with_bss(vaddr: u64, data: Vec<u8>, memsz: u64) -> Self {
        Self {
            vaddr,
            paddr: vaddr,
            data,
            memsz,
        }
    }
}

fn ident(class: u8) -> [u8; 16] {
    let mut ident = [0u8; 16];
    ident[0..4].copy_from_slice(&[0x7F, b'E', b'L', b'F']);
    ident[4] = class;
    ident[5] = 1; // little endian
    ident[6] = 1; // version
    ident
}

/// Build a minimal 32-bit executable image.
pub fn elf32(entry: u32, segments: &[Segment]) -> Vec<u8> {
    const EHSIZE: usize = 52;
    const PHENTSIZE: usize = 32;

    let mut image = Vec::new();
    image.extend_from_slice(&ident(1));
    image.extend_from_slice(&2u16.to_le_bytes()); // e_type = ET_EXEC
    image.extend_from_slice(&3u16.to_le_bytes()); // e_machine = EM_386
    image.extend_from_slice(&1u32.to_le_bytes()); // e_version
    image.extend_from_slice(&entry.to_le_bytes());
    image.extend_from_slice(&(EHSIZE as u32).to_le_bytes()); // e_phoff
    image.extend_from_slice(&0u32.to_le_bytes()); // e_shoff
    image.extend_from_slice(&0u32.to_le_bytes()); // e_flags
    image.extend_from_slice(&(EHSIZE as u16).to_le_bytes());
    image.extend_from_slice(&(PHENTSIZE as u16).to_le_bytes());
    image.extend_from_slice(&(segments.len() as u16).to_le_bytes());
    image.extend_from_slice(&0u16.to_le_bytes()); // e_shentsize
    image.extend_from_slice(&0u16.to_le_bytes()); // e_shnum
    image.extend_from_slice(&0u16.to_le_bytes()); // e_shstrndx
    assert_eq!(image.len(), EHSIZE);

    let data_start = EHSIZE + segments.len() * PHENTSIZE;
    let mut offset = data_start;
    for segment in segments {
        image.extend_from_slice(&1u32.to_le_bytes()); // PT_LOAD
        image.extend_from_slice(&(offset as u32).to_le_bytes());
        image.extend_from_slice(&(segment.vaddr as u32).to_le_bytes());
        image.extend_from_slice(&(segment.paddr as u32).to_le_bytes());
        image.extend_from_slice(&(segment.data.len() as u32).to_le_bytes());
        image.extend_from_slice(&(segment.memsz as u32).to_le_bytes());
        image.extend_from_slice(&5u32.to_le_bytes()); // p_flags
        image.extend_from_slice(&0x1000u32.to_le_bytes()); // p_align
        offset += segment.data.len();
    }

    for segment in segments {
        image.extend_from_slice(&segment.data);
    }
    image
}

/// Build a minimal 64-bit executable image.
pub fn elf64(entry: u64, segments: &[Segment]) -> Vec<u8> {
    const EHSIZE: usize = 64;
    const PHENTSIZE: usize = 56;

    let mut image = Vec::new();
    image.extend_from_slice(&ident(2));
    image.extend_from_slice(&2u16.to_le_bytes()); // e_type = ET_EXEC
    image.extend_from_slice(&62u16.to_le_bytes()); // e_machine = EM_X86_64
    image.extend_from_slice(&1u32.to_le_bytes()); // e_version
    image.extend_from_slice(&entry.to_le_bytes());
    image.extend_from_slice(&(EHSIZE as u64).to_le_bytes()); // e_phoff
    image.extend_from_slice(&0u64.to_le_bytes()); // e_shoff
    image.extend_from_slice(&0u32.to_le_bytes()); // e_flags
    image.extend_from_slice(&(EHSIZE as u16).to_le_bytes());
    image.extend_from_slice(&(PHENTSIZE as u16).to_le_bytes());
    image.extend_from_slice(&(segments.len() as u16).to_le_bytes());
    image.extend_from_slice(&0u16.to_le_bytes()); // e_shentsize
    image.extend_from_slice(&0u16.to_le_bytes()); // e_shnum
    image.extend_from_slice(&0u16.to_le_bytes()); // e_shstrndx
    assert_eq!(image.len(), EHSIZE);

    let data_start = EHSIZE + segments.len() * PHENTSIZE;
    let mut offset = data_start;
    for segment in segments {
        image.extend_from_slice(&1u32.to_le_bytes()); // PT_LOAD
        image.extend_from_slice(&5u32.to_le_bytes()); // p_flags
        image.extend_from_slice(&(offset as u64).to_le_bytes());
        image.extend_from_slice(&segment.vaddr.to_le_bytes());
        image.extend_from_slice(&segment.paddr.to_le_bytes());
        image.extend_from_slice(&(segment.data.len() as u64).to_le_bytes());
        image.extend_from_slice(&segment.memsz.to_le_bytes());
        image.extend_from_slice(&0x1000u64.to_le_bytes()); // p_align
        offset += segment.data.len();
    }

    for segment in segments {
        image.extend_from_slice(&segment.data);
    }
    image
}

// -- Page table inspection ------------------------------------------------

const PTE_PRESENT: u64 = 1;
const PTE_HUGE: u64 = 1 << 7;
const PTE_ADDRESS: u64 = 0x000F_FFFF_FFFF_F000;

/// Follow a 4-level table the way the MMU would.
pub fn translate(root: u64, virt: u64) -> Option<u64> {
    let mut table = root;

    for shift in [39u32, 30, 21] {
        let index = ((virt >> shift) & 511) as usize;
        let entry = unsafe { (table as *const u64).add(index).read() };
        if entry & PTE_PRESENT == 0 {
            return None;
        }
        if entry & PTE_HUGE != 0 {
            assert_eq!(shift, 21, "only 2 MiB huge pages are expected");
            let base = entry & PTE_ADDRESS & !0x1F_FFFF;
            return Some(base + (virt & 0x1F_FFFF));
        }
        table = entry & PTE_ADDRESS;
    }

    let index = ((virt >> 12) & 511) as usize;
    let entry = unsafe { (table as *const u64).add(index).read() };
    if entry & PTE_PRESENT == 0 {
        return None;
    }
    Some((entry & PTE_ADDRESS) + (virt & 0xFFF))
}

/// Read back memory the loader wrote through a mock allocation.
pub fn read_memory(at: u64, len: usize) -> Vec<u8> {
    unsafe { std::slice::from_raw_parts(at as *const u8, len) }.to_vec()
}
