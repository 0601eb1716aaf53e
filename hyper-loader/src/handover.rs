//! Handover Attribute Array
//!
//! Composes the contiguous attribute array handed to the kernel and
//! snapshots the firmware memory map into it. The memory map mutates
//! under every allocation, so storage for the array is reserved with one
//! spare entry and re-checked after the allocation; once the final
//! `copy_map` produced the handover key, no further allocation may
//! happen anywhere in the loader.

use crate::allocator::Allocator;
use crate::config::{
    DIRECT_MAP_BASE, HIGHER_HALF_BASE, LOADER_MAJOR, LOADER_MINOR, LOADER_NAME,
    MAX_MEMORY_MAP_ATTEMPTS,
};
use crate::elf::{BinaryInfo, Bitness};
use crate::error::{LoaderError, ResourceError};
use crate::services::MemoryServices;

use core::mem::size_of;
use core::ptr::NonNull;
use hyper_protocol::{
    AttributeArrayHeader, AttributeHeader, Framebuffer, FramebufferAttribute,
    KernelInfoAttribute, MemoryMapEntry, ModuleInfoAttribute, PlatformInfoAttribute,
    PlatformType, ATTRIBUTE_COMMAND_LINE, ATTRIBUTE_FRAMEBUFFER_INFO, ATTRIBUTE_KERNEL_INFO,
    ATTRIBUTE_MEMORY_MAP, ATTRIBUTE_PLATFORM_INFO, LOADER_NAME_SIZE, ULTRA_MAGIC,
};
use zerocopy::{Immutable, IntoBytes};

/// Everything that goes into the attribute array.
pub struct AttributeArraySpec<'a> {
    pub platform: PlatformType,
    pub kernel: BinaryInfo,
    pub modules: &'a [ModuleInfoAttribute],
    pub cmdline: Option<&'a str>,
    pub framebuffer: Option<Framebuffer>,
    pub stack_address: u64,
}

impl AttributeArraySpec<'_> {
    fn kernel_is_higher_half(&self) -> bool {
        self.kernel.entrypoint >= HIGHER_HALF_BASE
    }
}

/// Result of building the array: where it is and the key binding the
/// memory map snapshot to the firmware state.
pub struct HandoverInfo {
    pub attribute_array_address: u64,
    pub memory_map_key: usize,
    pub attribute_count: u32,
}

/// Everything the final jump needs.
#[derive(Debug, Clone, Copy)]
pub struct Handover {
    pub bitness: Bitness,
    pub entrypoint: u64,
    pub stack_address: u64,
    pub page_table_root: u64,
    pub attribute_array_address: u64,
    pub magic: u32,
}

const fn align_up_8(v: usize) -> usize {
    (v + 7) & !7
}

/// Byte cursor over the zeroed array region.
struct Writer {
    base: NonNull<u8>,
    len: usize,
    offset: usize,
}

impl Writer {
    fn push_bytes(&mut self, bytes: &[u8]) {
        debug_assert!(self.offset + bytes.len() <= self.len);
        // SAFETY: the region spans `len` bytes and the cursor stays
        // within it.
        unsafe {
            core::ptr::copy_nonoverlapping(
                bytes.as_ptr(),
                self.base.as_ptr().add(self.offset),
                bytes.len(),
            );
        }
        self.offset += bytes.len();
    }

    fn push<T: IntoBytes + Immutable>(&mut self, value: &T) {
        self.push_bytes(value.as_bytes());
    }

    fn patch<T: IntoBytes + Immutable>(&mut self, offset: usize, value: &T) {
        debug_assert!(offset + size_of::<T>() <= self.len);
        // SAFETY: as above; patching rewrites already-reserved bytes.
        unsafe {
            core::ptr::copy_nonoverlapping(
                value.as_bytes().as_ptr(),
                self.base.as_ptr().add(offset),
                size_of::<T>(),
            );
        }
    }

    /// Jump the cursor forward over already-zeroed padding.
    fn skip_to(&mut self, offset: usize) {
        debug_assert!(offset >= self.offset && offset <= self.len);
        self.offset = offset;
    }
}

fn loader_name_field() -> [u8; LOADER_NAME_SIZE] {
    let mut name = [0u8; LOADER_NAME_SIZE];
    let bytes = LOADER_NAME.as_bytes();
    name[..bytes.len()].copy_from_slice(bytes);
    name
}

/// Build the attribute array and take the memory map snapshot.
///
/// On return the handover key is live: any allocation made before the
/// jump invalidates the snapshot the kernel will read.
pub fn build_attribute_array(
    spec: &AttributeArraySpec<'_>,
    ms: &dyn MemoryServices,
) -> Result<HandoverInfo, LoaderError> {
    let cmdline_size = spec
        .cmdline
        .map(|c| align_up_8(size_of::<AttributeHeader>() + c.len()))
        .unwrap_or(0);

    let mut bytes_static = size_of::<AttributeArrayHeader>()
        + size_of::<PlatformInfoAttribute>()
        + size_of::<KernelInfoAttribute>()
        + spec.modules.len() * size_of::<ModuleInfoAttribute>()
        + cmdline_size
        + size_of::<AttributeHeader>();
    if spec.framebuffer.is_some() {
        bytes_static += size_of::<FramebufferAttribute>();
    }

    let alloc = Allocator::new(ms);

    // Reserve room for the map plus one spare entry, then make sure the
    // allocation itself did not grow the map past the reservation.
    let mut placed = None;
    for _ in 0..MAX_MEMORY_MAP_ATTEMPTS {
        let mut key = 0usize;
        let reserved_entries = ms.copy_map(None, &mut key) + 1;
        let total = bytes_static + reserved_entries * size_of::<MemoryMapEntry>();

        let region = alloc.allocate_critical_bytes(total)?;

        if ms.copy_map(None, &mut key) <= reserved_entries {
            placed = Some((region, reserved_entries, total));
            break;
        }

        alloc.free_bytes(region.as_ptr() as u64, total);
    }
    let Some((region, reserved_entries, total)) = placed else {
        return Err(LoaderError::Resource(ResourceError::MemoryMapUnstable));
    };

    // SAFETY: freshly allocated region of `total` bytes.
    unsafe { core::ptr::write_bytes(region.as_ptr(), 0, total) };

    let mut writer = Writer {
        base: region,
        len: total,
        offset: 0,
    };
    let mut attribute_count = 0u32;

    // Patched with the final count at the end.
    writer.push(&AttributeArrayHeader {
        pad: 0,
        attribute_count: 0,
    });

    writer.push(&PlatformInfoAttribute {
        header: AttributeHeader {
            ty: ATTRIBUTE_PLATFORM_INFO,
            size_in_bytes: size_of::<PlatformInfoAttribute>() as u32,
        },
        platform_type: spec.platform as u32,
        loader_major: LOADER_MAJOR,
        loader_minor: LOADER_MINOR,
        loader_name: loader_name_field(),
    });
    attribute_count += 1;

    writer.push(&KernelInfoAttribute {
        header: AttributeHeader {
            ty: ATTRIBUTE_KERNEL_INFO,
            size_in_bytes: size_of::<KernelInfoAttribute>() as u32,
        },
        physical_base: spec.kernel.physical_base,
        virtual_base: spec.kernel.virtual_base,
        size_in_bytes: spec.kernel.physical_ceiling - spec.kernel.physical_base,
        entrypoint: spec.kernel.entrypoint,
    });
    attribute_count += 1;

    for module in spec.modules {
        writer.push(module);
        attribute_count += 1;
    }

    if let Some(cmdline) = spec.cmdline {
        let record_start = writer.offset;
        writer.push(&AttributeHeader {
            ty: ATTRIBUTE_COMMAND_LINE,
            size_in_bytes: cmdline_size as u32,
        });
        writer.push_bytes(cmdline.as_bytes());
        writer.skip_to(record_start + cmdline_size);
        attribute_count += 1;
    }

    if let Some(mut framebuffer) = spec.framebuffer {
        // The kernel sees the framebuffer through the direct map.
        if spec.kernel_is_higher_half() {
            framebuffer.physical_address += DIRECT_MAP_BASE;
        }
        writer.push(&FramebufferAttribute {
            header: AttributeHeader {
                ty: ATTRIBUTE_FRAMEBUFFER_INFO,
                size_in_bytes: size_of::<FramebufferAttribute>() as u32,
            },
            framebuffer,
        });
        attribute_count += 1;
    }

    // Memory map comes last; its size is known only after the snapshot.
    let map_header_offset = writer.offset;
    writer.push(&AttributeHeader {
        ty: ATTRIBUTE_MEMORY_MAP,
        size_in_bytes: 0,
    });
    attribute_count += 1;

    // SAFETY: the tail of the region holds `reserved_entries` entries,
    // 8-byte aligned because every record size is a multiple of 8.
    let entries = unsafe {
        core::slice::from_raw_parts_mut(
            region.as_ptr().add(writer.offset) as *mut MemoryMapEntry,
            reserved_entries,
        )
    };

    let mut memory_map_key = 0usize;
    let entries_written = ms.copy_map(Some(entries), &mut memory_map_key);
    if entries_written > reserved_entries {
        return Err(LoaderError::Protocol(
            "memory map grew past its reservation during the snapshot",
        ));
    }

    writer.patch(
        map_header_offset,
        &AttributeHeader {
            ty: ATTRIBUTE_MEMORY_MAP,
            size_in_bytes: (size_of::<AttributeHeader>()
                + entries_written * size_of::<MemoryMapEntry>()) as u32,
        },
    );
    writer.patch(
        0,
        &AttributeArrayHeader {
            pad: 0,
            attribute_count,
        },
    );

    Ok(HandoverInfo {
        attribute_array_address: region.as_ptr() as u64,
        memory_map_key,
        attribute_count,
    })
}

/// Final addresses for the jump. Higher-half kernels see the stack and
/// the attribute array through the direct map; the allocations
/// themselves stay physical.
pub fn prepare_handover(
    spec: &AttributeArraySpec<'_>,
    info: &HandoverInfo,
    page_table_root: u64,
) -> Handover {
    let rebase = if spec.kernel_is_higher_half() {
        DIRECT_MAP_BASE
    } else {
        0
    };

    Handover {
        bitness: spec.kernel.bitness,
        entrypoint: spec.kernel.entrypoint,
        stack_address: spec.stack_address + rebase,
        page_table_root,
        attribute_array_address: info.attribute_array_address + rebase,
        magic: ULTRA_MAGIC,
    }
}
