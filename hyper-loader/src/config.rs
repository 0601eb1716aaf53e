//! Loader Configuration Constants

/// Start of the higher half of the 48-bit virtual address space.
pub const HIGHER_HALF_BASE: u64 = 0xFFFF_8000_0000_0000;

/// Base of the kernel-visible direct map of physical memory. Kernel
/// pointers exported to a higher-half kernel are rebased by this amount.
pub const DIRECT_MAP_BASE: u64 = 0xFFFF_8000_0000_0000;

pub const PAGE_SIZE: usize = 4096;

/// How much physical memory the identity and direct maps cover.
pub const IDENTITY_MAP_SIZE: u64 = 4 * 1024 * 1024 * 1024;

/// All loader allocations stay below this so they remain reachable from
/// 32-bit kernels and from the identity map.
pub const ALLOCATION_CEILING: u64 = 4 * 1024 * 1024 * 1024;

/// Kernel stack size when the config does not override it.
pub const DEFAULT_STACK_SIZE: u64 = 16 * 1024;

/// Video mode used for `video-mode = "auto"`.
pub const DEFAULT_VIDEO_WIDTH: u32 = 1024;
pub const DEFAULT_VIDEO_HEIGHT: u32 = 768;
pub const DEFAULT_VIDEO_BPP: u32 = 32;

/// Locations probed for the configuration file, in order.
pub const CONFIG_SEARCH_PATHS: [&str; 3] = [
    "/hyper.cfg",
    "/boot/hyper.cfg",
    "/boot/hyper/hyper.cfg",
];

pub const LOADER_NAME: &str = "HyperLoader v0.1";
pub const LOADER_MAJOR: u16 = 0;
pub const LOADER_MINOR: u16 = 1;

/// Most modules a single loadable entry may reference.
pub const MAX_MODULES: usize = 32;

/// How many times the attribute array allocation is retried while the
/// firmware memory map keeps growing underneath it.
pub const MAX_MEMORY_MAP_ATTEMPTS: usize = 8;
