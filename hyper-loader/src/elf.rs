//! Kernel ELF Loader
//!
//! Validates and loads PT_LOAD segments of 32- and 64-bit images. 64-bit
//! kernels may be loaded "anywhere": one physical region is allocated
//! for the whole image and the on-disk virtual addresses only matter for
//! the kernel's own view. Fixed loads place each segment at the physical
//! range derived from the headers.

use crate::allocator::{AllocError, Allocator};
use crate::config::{ALLOCATION_CEILING, HIGHER_HALF_BASE, PAGE_SIZE};

use core::fmt;
use elf_rs::{Elf, ElfFile, ProgramType};

/// Most PT_LOAD segments a kernel image may carry.
pub const MAX_SEGMENTS: usize = 16;

const ELF_MAGIC: [u8; 4] = [0x7F, b'E', b'L', b'F'];
const EI_CLASS: usize = 4;
const EI_DATA: usize = 5;
const ELFCLASS32: u8 = 1;
const ELFCLASS64: u8 = 2;
const ELFDATA2LSB: u8 = 1;
const E_TYPE_OFFSET: usize = 16;
const E_MACHINE_OFFSET: usize = 18;
const ET_EXEC: u16 = 2;
const EM_386: u16 = 3;
const EM_X86_64: u16 = 62;

/// Word width of an ELF image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Bitness {
    B32,
    B64,
}

impl Bitness {
    #[must_use]
    pub const fn bits(self) -> u32 {
        match self {
            Self::B32 => 32,
            Self::B64 => 64,
        }
    }
}

/// Where and how the kernel ended up in memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BinaryInfo {
    pub physical_base: u64,
    pub physical_ceiling: u64,
    pub virtual_base: u64,
    pub virtual_ceiling: u64,
    pub entrypoint: u64,
    pub bitness: Bitness,
    /// True when the kernel's virtual range is covered by the direct map
    /// and needs no dedicated page table entries.
    pub kernel_range_is_direct_map: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ElfError {
    InvalidMagic,
    InvalidClass,
    NotLittleEndian,
    NotExecutable,
    UnexpectedMachine,
    Malformed,
    NoLoadableSegments,
    TooManySegments,
    OverlappingSegments,
    InvalidProgramHeader,
    InvalidLoadAddress,
    InvalidEntrypoint,
    InvalidLoadOptions,
    AllocationFailed(AllocError),
}

impl fmt::Display for ElfError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidMagic => write!(f, "invalid magic"),
            Self::InvalidClass => write!(f, "invalid ELF class"),
            Self::NotLittleEndian => write!(f, "not a little-endian file"),
            Self::NotExecutable => write!(f, "not an executable"),
            Self::UnexpectedMachine => write!(f, "unexpected machine type"),
            Self::Malformed => write!(f, "malformed ELF file"),
            Self::NoLoadableSegments => write!(f, "no loadable segments"),
            Self::TooManySegments => write!(f, "too many loadable segments"),
            Self::OverlappingSegments => write!(f, "overlapping loadable segments"),
            Self::InvalidProgramHeader => write!(f, "invalid program header"),
            Self::InvalidLoadAddress => write!(f, "invalid load address"),
            Self::InvalidEntrypoint => write!(f, "invalid entrypoint"),
            Self::InvalidLoadOptions => {
                write!(f, "allocate-anywhere is only allowed for 64 bit kernels")
            }
            Self::AllocationFailed(err) => write!(f, "{err}"),
        }
    }
}

/// How to place the image in physical memory.
#[derive(Debug, Clone, Copy)]
pub struct LoadOptions {
    /// Allocate a single region anywhere instead of honoring the fixed
    /// addresses from the headers. 64-bit images only.
    pub allocate_anywhere: bool,
    /// Protocol memory type the image region is tagged with.
    pub memory_type: u32,
}

/// Inspect the ident and report the image width, if it is one we load.
#[must_use]
pub fn elf_bitness(data: &[u8]) -> Option<Bitness> {
    if data.len() < 64 {
        return None;
    }
    match data[EI_CLASS] {
        ELFCLASS32 => Some(Bitness::B32),
        ELFCLASS64 => Some(Bitness::B64),
        _ => None,
    }
}

#[derive(Debug, Clone, Copy, Default)]
struct Segment {
    vaddr: u64,
    paddr: u64,
    filesz: u64,
    memsz: u64,
    offset: u64,
}

impl Segment {
    /// Physical address this segment loads at when placement is fixed.
    fn fixed_target(&self, use_va: bool) -> u64 {
        if !use_va {
            return self.paddr;
        }
        if self.vaddr >= HIGHER_HALF_BASE {
            self.vaddr - HIGHER_HALF_BASE
        } else {
            self.vaddr
        }
    }
}

fn read_u16_le(data: &[u8], offset: usize) -> u16 {
    u16::from_le_bytes([data[offset], data[offset + 1]])
}

const fn page_round_down(v: u64) -> u64 {
    v & !(PAGE_SIZE as u64 - 1)
}

const fn page_round_up(v: u64) -> u64 {
    (v + PAGE_SIZE as u64 - 1) & !(PAGE_SIZE as u64 - 1)
}

/// Load a kernel image. `data` is the whole file; the returned info
/// describes the placed image.
pub fn load(
    data: &[u8],
    opts: &LoadOptions,
    alloc: &Allocator<'_>,
) -> Result<BinaryInfo, ElfError> {
    let bitness = elf_bitness(data).ok_or(ElfError::InvalidClass)?;
    let use_va = bitness == Bitness::B64;

    if opts.allocate_anywhere && !use_va {
        return Err(ElfError::InvalidLoadOptions);
    }
    if data[..4] != ELF_MAGIC {
        return Err(ElfError::InvalidMagic);
    }
    if data[EI_DATA] != ELFDATA2LSB {
        return Err(ElfError::NotLittleEndian);
    }
    if read_u16_le(data, E_TYPE_OFFSET) != ET_EXEC {
        return Err(ElfError::NotExecutable);
    }
    let expected_machine = match bitness {
        Bitness::B32 => EM_386,
        Bitness::B64 => EM_X86_64,
    };
    if read_u16_le(data, E_MACHINE_OFFSET) != expected_machine {
        return Err(ElfError::UnexpectedMachine);
    }

    let elf = Elf::from_bytes(data).map_err(|_| ElfError::Malformed)?;

    let mut segments = [Segment::default(); MAX_SEGMENTS];
    let mut count = 0usize;

    macro_rules! collect_segments {
        ($image:expr) => {
            for ph in $image.program_header_iter() {
                if ph.ph_type() != ProgramType::LOAD || ph.memsz() == 0 {
                    continue;
                }
                if count == MAX_SEGMENTS {
                    return Err(ElfError::TooManySegments);
                }
                segments[count] = Segment {
                    vaddr: ph.vaddr(),
                    paddr: ph.paddr(),
                    filesz: ph.filesz(),
                    memsz: ph.memsz(),
                    offset: ph.offset(),
                };
                count += 1;
            }
        };
    }

    let mut entrypoint = match &elf {
        Elf::Elf32(image) => {
            collect_segments!(image);
            image.elf_header().entry_point()
        }
        Elf::Elf64(image) => {
            collect_segments!(image);
            image.elf_header().entry_point()
        }
    };

    if count == 0 {
        return Err(ElfError::NoLoadableSegments);
    }
    let segments = &segments[..count];

    let mut virtual_base = u64::MAX;
    let mut virtual_ceiling = 0u64;
    let mut physical_base = u64::MAX;
    let mut physical_ceiling = 0u64;

    for segment in segments {
        let virt_end = segment
            .vaddr
            .checked_add(segment.memsz)
            .ok_or(ElfError::InvalidLoadAddress)?;

        if opts.allocate_anywhere && segment.vaddr < HIGHER_HALF_BASE {
            return Err(ElfError::InvalidLoadAddress);
        }

        virtual_base = virtual_base.min(segment.vaddr);
        virtual_ceiling = virtual_ceiling.max(virt_end);

        let target = segment.fixed_target(use_va);
        let target_end = target
            .checked_add(segment.memsz)
            .ok_or(ElfError::InvalidLoadAddress)?;
        physical_base = physical_base.min(target);
        physical_ceiling = physical_ceiling.max(target_end);
    }

    for (i, a) in segments.iter().enumerate() {
        for b in &segments[i + 1..] {
            if a.vaddr < b.vaddr + b.memsz && b.vaddr < a.vaddr + a.memsz {
                return Err(ElfError::OverlappingSegments);
            }
        }
    }

    // 32-bit kernels run at physical addresses: move the entrypoint into
    // the physical view of whichever segment contains it.
    if !use_va {
        for segment in segments {
            if entrypoint >= segment.vaddr && entrypoint < segment.vaddr + segment.memsz {
                entrypoint = entrypoint - segment.vaddr + segment.paddr;
                break;
            }
        }
    }

    let (reference_base, reference_ceiling) = if use_va {
        (virtual_base, virtual_ceiling)
    } else {
        (physical_base, physical_ceiling)
    };
    if entrypoint < reference_base || entrypoint >= reference_ceiling {
        return Err(ElfError::InvalidEntrypoint);
    }

    let virtual_base = page_round_down(virtual_base);
    let virtual_ceiling = page_round_up(virtual_ceiling);
    let mut physical_base = page_round_down(physical_base);
    let mut physical_ceiling = page_round_up(physical_ceiling);

    let kernel_range_is_direct_map;

    if opts.allocate_anywhere {
        let pages = ((virtual_ceiling - virtual_base) as usize) / PAGE_SIZE;
        let region = alloc
            .allocate_critical_pages_with_type(pages, opts.memory_type)
            .map_err(ElfError::AllocationFailed)?;

        physical_base = region.as_ptr() as u64;
        physical_ceiling = physical_base + (pages * PAGE_SIZE) as u64;
        kernel_range_is_direct_map = false;

        // SAFETY: the region was just allocated with `pages` pages.
        unsafe { core::ptr::write_bytes(region.as_ptr(), 0, pages * PAGE_SIZE) };

        for segment in segments {
            // SAFETY: vaddr is within [virtual_base, virtual_ceiling) by
            // construction, so the destination stays in the region.
            let dest = unsafe { region.as_ptr().add((segment.vaddr - virtual_base) as usize) };
            copy_segment(data, segment, dest)?;
        }
    } else {
        kernel_range_is_direct_map = virtual_base == HIGHER_HALF_BASE.wrapping_add(physical_base);

        for segment in segments {
            let target = segment.fixed_target(use_va);

            if use_va && segment.vaddr >= HIGHER_HALF_BASE && target < 1024 * 1024 {
                return Err(ElfError::InvalidLoadAddress);
            }

            let begin = page_round_down(target);
            let end = page_round_up(
                target
                    .checked_add(segment.memsz)
                    .ok_or(ElfError::InvalidLoadAddress)?,
            );
            if end > ALLOCATION_CEILING {
                return Err(ElfError::InvalidLoadAddress);
            }

            let pages = ((end - begin) as usize) / PAGE_SIZE;
            let region = alloc
                .allocate_critical_pages_with_type_at(begin, pages, opts.memory_type)
                .map_err(ElfError::AllocationFailed)?;

            // SAFETY: `target - begin` is below one page and the region
            // spans the whole rounded segment.
            let dest = unsafe { region.as_ptr().add((target - begin) as usize) };
            copy_segment(data, segment, dest)?;
        }
    }

    Ok(BinaryInfo {
        physical_base,
        physical_ceiling,
        virtual_base,
        virtual_ceiling,
        entrypoint,
        bitness,
        kernel_range_is_direct_map,
    })
}

/// Copy a segment's file payload to `dest` and zero the BSS tail.
fn copy_segment(data: &[u8], segment: &Segment, dest: *mut u8) -> Result<(), ElfError> {
    if segment.memsz < segment.filesz {
        return Err(ElfError::InvalidProgramHeader);
    }

    let file_end = segment
        .offset
        .checked_add(segment.filesz)
        .ok_or(ElfError::InvalidProgramHeader)?;
    if file_end > data.len() as u64 {
        return Err(ElfError::InvalidProgramHeader);
    }

    let filesz = segment.filesz as usize;
    if filesz != 0 {
        // SAFETY: source range checked against the file above, dest spans
        // memsz bytes per the caller.
        unsafe {
            core::ptr::copy_nonoverlapping(
                data.as_ptr().add(segment.offset as usize),
                dest,
                filesz,
            );
        }
    }

    let bss = (segment.memsz - segment.filesz) as usize;
    if bss != 0 {
        // SAFETY: dest spans memsz bytes.
        unsafe { core::ptr::write_bytes(dest.add(filesz), 0, bss) };
    }

    Ok(())
}
