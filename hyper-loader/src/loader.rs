//! Load Pipeline
//!
//! The strictly linear sequence from configuration text to an armed
//! handover: find and parse the config, pick an entry, load the kernel
//! and modules, build the page table and stack, set the video mode,
//! build the attribute array, exit firmware services. Any failure is
//! fatal; there are no other control paths.
//!
//! Page table and stack are allocated before the attribute array is
//! built, and nothing allocates after its memory map snapshot. Legacy
//! text output may die with `set_video_mode`, so the steps after it do
//! not log.

use crate::allocator::{Allocator, DEFAULT_ALLOC_TYPE};
use crate::arch::CpuFeatures;
use crate::config::{
    CONFIG_SEARCH_PATHS, DEFAULT_STACK_SIZE, DIRECT_MAP_BASE, IDENTITY_MAP_SIZE, MAX_MODULES,
    PAGE_SIZE,
};
use crate::elf::{self, BinaryInfo, Bitness, LoadOptions};
use crate::error::{LoaderError, ResourceError};
use crate::fstab::FsTable;
use crate::handover::{self, AttributeArraySpec, Handover};
use crate::path::parse_path;
use crate::services::{File, Services};
use crate::video;

use core::fmt::Write as _;
use hyper_config::{Config, LoadableEntry, TypeMask, Value, GLOBAL};
use hyper_paging::{PageTable, TableAllocator};
use hyper_protocol::{
    AttributeHeader, ModuleInfoAttribute, ATTRIBUTE_MODULE_INFO, MEMORY_TYPE_KERNEL_BINARY,
    MEMORY_TYPE_KERNEL_STACK, MEMORY_TYPE_MODULE, MODULE_NAME_SIZE,
};
use zerocopy::FromZeros;

/// Run the whole load. On success firmware services have been exited and
/// the returned handover is ready for the architecture jump.
pub fn run(services: &Services<'_>, fstab: &mut FsTable) -> Result<Handover, LoaderError> {
    let alloc = Allocator::new(services.memory);

    let text = read_config_text(fstab, &alloc)?;
    let cfg = match Config::parse(text) {
        Ok(cfg) => cfg,
        Err(err) => {
            log::error!("{}", err.display_with(text));
            return Err(err.into());
        }
    };

    let entry = pick_loadable_entry(&cfg)?;
    log::info!("booting \"{}\"", entry.name());
    check_protocol(&cfg, &entry)?;

    let kernel = load_kernel(&cfg, &entry, fstab, &alloc, services.cpu)?;
    let cmdline = cfg.get_string(&entry, "cmdline")?;

    let mut modules = [ModuleInfoAttribute::new_zeroed(); MAX_MODULES];
    let module_count = load_modules(&cfg, &entry, fstab, &alloc, &mut modules)?;

    let page_table_root = build_page_table(&kernel, alloc, services.cpu)?;
    let stack_address = pick_stack(&cfg, &entry, &alloc)?;

    let framebuffer = video::set_video_mode(&cfg, &entry, services.video)?;

    let spec = AttributeArraySpec {
        platform: services.platform,
        kernel,
        modules: &modules[..module_count],
        cmdline,
        framebuffer,
        stack_address,
    };

    // The memory map is snapshotted in here; no allocation is allowed
    // anywhere past this call.
    let info = handover::build_attribute_array(&spec, services.memory)?;

    if !services.memory.handover(info.memory_map_key) {
        return Err(LoaderError::Protocol(
            "firmware rejected the memory map handover key",
        ));
    }

    Ok(handover::prepare_handover(&spec, &info, page_table_root))
}

/// Read a whole file into a fresh critical allocation of type `ty`.
/// The region lives until the jump; nothing ever frees it.
fn read_whole_file(
    file: &dyn File,
    alloc: &Allocator<'_>,
    ty: u32,
) -> Result<&'static mut [u8], LoaderError> {
    let size = file.size() as usize;
    if size == 0 {
        return Err(LoaderError::Io("file is empty"));
    }

    let pages = size.div_ceil(PAGE_SIZE);
    let region = alloc.allocate_critical_pages_with_type(pages, ty)?;

    // SAFETY: `region` spans `pages` whole pages and is never freed.
    let buffer = unsafe { core::slice::from_raw_parts_mut(region.as_ptr(), size) };
    if !file.read(buffer, 0) {
        return Err(LoaderError::Io("failed to read file"));
    }
    Ok(buffer)
}

fn read_config_text(
    fstab: &mut FsTable,
    alloc: &Allocator<'_>,
) -> Result<&'static str, LoaderError> {
    let mut found = None;

    'search: for (index, entry) in fstab.entries().iter().enumerate() {
        for path in CONFIG_SEARCH_PATHS {
            if let Some(file) = entry.filesystem().open(path) {
                found = Some((index, read_whole_file(&*file, alloc, DEFAULT_ALLOC_TYPE)?));
                break 'search;
            }
        }
    }

    let (index, bytes) =
        found.ok_or(LoaderError::Io("couldn't find hyper.cfg anywhere on disk"))?;
    fstab.set_origin(index);

    core::str::from_utf8(bytes).map_err(|_| LoaderError::Io("config file is not valid UTF-8"))
}

fn pick_loadable_entry(cfg: &Config<'static>) -> Result<LoadableEntry<'static>, LoaderError> {
    if let Some(name) = cfg.get_string(&GLOBAL, "default-entry")? {
        return cfg
            .loadable_entry(name)
            .ok_or(LoaderError::ConfigSemantic("no such loadable entry"));
    }

    cfg.first_loadable_entry().ok_or(LoaderError::ConfigSemantic(
        "configuration file must contain at least one loadable entry",
    ))
}

fn check_protocol(
    cfg: &Config<'static>,
    entry: &LoadableEntry<'static>,
) -> Result<(), LoaderError> {
    match cfg.get_string(entry, "protocol")? {
        Some(name) if !name.eq_ignore_ascii_case("ultra") => {
            Err(LoaderError::InvalidValue { key: "protocol" })
        }
        _ => Ok(()),
    }
}

struct BinaryOptions {
    path: &'static str,
    allocate_anywhere: bool,
}

fn binary_options(
    cfg: &Config<'static>,
    entry: &LoadableEntry<'static>,
) -> Result<BinaryOptions, LoaderError> {
    let value = cfg.require_one_of(entry, "binary", TypeMask::STRING | TypeMask::OBJECT)?;

    if let Some(path) = value.as_str() {
        return Ok(BinaryOptions {
            path,
            allocate_anywhere: false,
        });
    }

    Ok(BinaryOptions {
        path: cfg.require_string(&value, "path")?,
        allocate_anywhere: cfg.get_bool(&value, "allocate-anywhere")?.unwrap_or(false),
    })
}

fn open_and_read(
    path_str: &str,
    fstab: &FsTable,
    alloc: &Allocator<'_>,
    ty: u32,
) -> Result<&'static mut [u8], LoaderError> {
    let path = parse_path(path_str).ok_or_else(|| {
        log::error!("invalid path \"{path_str}\"");
        LoaderError::Path(crate::path::PathError::Malformed)
    })?;

    let fs_entry = fstab.by_full_path(&path)?;
    let file = fs_entry
        .filesystem()
        .open(path.path_within_partition)
        .ok_or(LoaderError::Io("failed to open file"))?;

    read_whole_file(&*file, alloc, ty)
}

fn load_kernel(
    cfg: &Config<'static>,
    entry: &LoadableEntry<'static>,
    fstab: &FsTable,
    alloc: &Allocator<'_>,
    cpu: CpuFeatures,
) -> Result<BinaryInfo, LoaderError> {
    let opts = binary_options(cfg, entry)?;
    let data = open_and_read(opts.path, fstab, alloc, DEFAULT_ALLOC_TYPE)?;

    let bitness = elf::elf_bitness(data).ok_or(LoaderError::Binary(elf::ElfError::InvalidClass))?;
    if bitness == Bitness::B64 && !cpu.long_mode {
        return Err(LoaderError::Capability(
            "attempted to load a 64 bit kernel on a CPU without long mode support",
        ));
    }

    let info = elf::load(
        data,
        &LoadOptions {
            allocate_anywhere: opts.allocate_anywhere,
            memory_type: MEMORY_TYPE_KERNEL_BINARY,
        },
        alloc,
    )?;

    log::info!(
        "kernel loaded: physical {:#x}..{:#x}, entry {:#x} ({} bit)",
        info.physical_base,
        info.physical_ceiling,
        info.entrypoint,
        info.bitness.bits(),
    );
    Ok(info)
}

/// Fixed-width module name with snprintf-style truncation.
struct NameField {
    buf: [u8; MODULE_NAME_SIZE],
    len: usize,
}

impl NameField {
    fn new() -> Self {
        Self {
            buf: [0; MODULE_NAME_SIZE],
            len: 0,
        }
    }

    fn from_str(name: &str) -> Self {
        let mut field = Self::new();
        let _ = field.write_str(name);
        field
    }
}

impl core::fmt::Write for NameField {
    fn write_str(&mut self, s: &str) -> core::fmt::Result {
        for &b in s.as_bytes() {
            // Keep the terminating NUL.
            if self.len < MODULE_NAME_SIZE - 1 {
                self.buf[self.len] = b;
                self.len += 1;
            }
        }
        Ok(())
    }
}

fn load_modules(
    cfg: &Config<'static>,
    entry: &LoadableEntry<'static>,
    fstab: &FsTable,
    alloc: &Allocator<'_>,
    modules: &mut [ModuleInfoAttribute; MAX_MODULES],
) -> Result<usize, LoaderError> {
    let mask = TypeMask::STRING | TypeMask::OBJECT;
    let Some(first) = cfg.get_first_one_of(entry, "module", mask)? else {
        return Ok(0);
    };

    let mut count = 0usize;
    let mut unnamed = 0u32;
    let mut value = first;

    loop {
        if count == MAX_MODULES {
            return Err(LoaderError::Resource(ResourceError::TooManyModules));
        }
        modules[count] = load_one_module(cfg, &value, fstab, alloc, &mut unnamed)?;
        count += 1;

        match cfg.get_next_one_of(mask, &value, true)? {
            Some(next) => value = next,
            None => break,
        }
    }

    Ok(count)
}

fn load_one_module(
    cfg: &Config<'static>,
    value: &Value<'static>,
    fstab: &FsTable,
    alloc: &Allocator<'_>,
    unnamed: &mut u32,
) -> Result<ModuleInfoAttribute, LoaderError> {
    let (name, path) = if let Some(path) = value.as_str() {
        (None, path)
    } else {
        (
            cfg.get_string(value, "name")?,
            cfg.require_string(value, "path")?,
        )
    };

    let name = match name {
        Some(name) => NameField::from_str(name),
        None => {
            *unnamed += 1;
            let mut field = NameField::new();
            let _ = write!(field, "unnamed_module{unnamed}");
            field
        }
    };

    let data = open_and_read(path, fstab, alloc, MEMORY_TYPE_MODULE)?;

    Ok(ModuleInfoAttribute {
        header: AttributeHeader {
            ty: ATTRIBUTE_MODULE_INFO,
            size_in_bytes: core::mem::size_of::<ModuleInfoAttribute>() as u32,
        },
        name: name.buf,
        physical_address: data.as_ptr() as u64,
        size_in_bytes: data.len() as u64,
    })
}

/// Page table allocator over critical loader pages. Tables are zeroed on
/// creation.
struct CriticalTables<'a> {
    alloc: Allocator<'a>,
}

impl TableAllocator for CriticalTables<'_> {
    fn allocate_table(&mut self) -> Option<u64> {
        let page = self.alloc.allocate_pages(1)?;
        // SAFETY: fresh whole page.
        unsafe { core::ptr::write_bytes(page.as_ptr(), 0, PAGE_SIZE) };
        Some(page.as_ptr() as u64)
    }
}

fn map_chunk(
    pt: &mut PageTable,
    tables: &mut CriticalTables<'_>,
    virt: u64,
    phys: u64,
    size: u64,
    huge: bool,
) -> Result<(), LoaderError> {
    if huge {
        let count = (size as usize) / hyper_paging::HUGE_PAGE_SIZE;
        pt.map_huge_pages(virt, phys, count, tables)?;
    } else {
        let count = (size as usize) / PAGE_SIZE;
        pt.map_pages(virt, phys, count, tables)?;
    }
    Ok(())
}

/// Build the kernel's initial address space:
/// identity map of the bottom 4 GiB, direct map of the same range at
/// `DIRECT_MAP_BASE`, and the kernel's own virtual range unless the
/// direct or identity map already covers it. 32-bit kernels run without
/// paging and get no table.
fn build_page_table(
    info: &BinaryInfo,
    alloc: Allocator<'_>,
    cpu: CpuFeatures,
) -> Result<u64, LoaderError> {
    if info.bitness != Bitness::B64 {
        return Ok(0);
    }

    let mut tables = CriticalTables { alloc };
    let mut pt = PageTable::new(&mut tables)?;

    map_chunk(&mut pt, &mut tables, 0, 0, IDENTITY_MAP_SIZE, cpu.huge_pages)?;
    map_chunk(
        &mut pt,
        &mut tables,
        DIRECT_MAP_BASE,
        0,
        IDENTITY_MAP_SIZE,
        cpu.huge_pages,
    )?;

    if !info.kernel_range_is_direct_map && info.virtual_ceiling > IDENTITY_MAP_SIZE {
        let size = info.physical_ceiling - info.physical_base;
        pt.map_pages(
            info.virtual_base,
            info.physical_base,
            (size as usize) / PAGE_SIZE,
            &mut tables,
        )?;
    }

    log::debug!("page table root at {:#x}", pt.root());
    Ok(pt.root())
}

/// Allocate the kernel stack and return its top. `stack` accepts
/// `"auto"` or an object with `allocate-at` (`"anywhere"` or a fixed
/// address) and `size` (`"auto"` or a byte count).
fn pick_stack(
    cfg: &Config<'static>,
    entry: &LoadableEntry<'static>,
    alloc: &Allocator<'_>,
) -> Result<u64, LoaderError> {
    let mut address = None;
    let mut size = DEFAULT_STACK_SIZE;

    if let Some(value) = cfg.get_one_of(entry, "stack", TypeMask::STRING | TypeMask::OBJECT)? {
        if let Some(s) = value.as_str() {
            if s != "auto" {
                return Err(LoaderError::InvalidValue { key: "stack" });
            }
        } else {
            let scalar = TypeMask::STRING | TypeMask::UNSIGNED;

            if let Some(at) = cfg.get_one_of(&value, "allocate-at", scalar)? {
                match at.as_str() {
                    Some("anywhere") => {}
                    Some(_) => return Err(LoaderError::InvalidValue { key: "allocate-at" }),
                    None => address = at.as_unsigned(),
                }
            }

            if let Some(requested) = cfg.get_one_of(&value, "size", scalar)? {
                match requested.as_str() {
                    Some("auto") => {}
                    Some(_) => return Err(LoaderError::InvalidValue { key: "size" }),
                    None => {
                        if let Some(v) = requested.as_unsigned() {
                            size = v;
                        }
                    }
                }
            }
        }
    }

    let pages = (size as usize).div_ceil(PAGE_SIZE);
    let span = (pages * PAGE_SIZE) as u64;

    match address {
        Some(address) => {
            alloc.allocate_critical_pages_with_type_at(address, pages, MEMORY_TYPE_KERNEL_STACK)?;
            Ok(address + span)
        }
        None => {
            let base = alloc.allocate_critical_pages_with_type(pages, MEMORY_TYPE_KERNEL_STACK)?;
            Ok(base.as_ptr() as u64 + span)
        }
    }
}
