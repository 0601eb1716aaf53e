//! Hyper Bootloader
//!
//! This loader:
//! 1. Detects filesystems and locates the boot configuration file
//! 2. Parses the configuration and picks a loadable entry
//! 3. Loads the kernel ELF image and any modules
//! 4. Builds the initial page tables and kernel stack
//! 5. Sets the requested video mode
//! 6. Builds the attribute array with a memory map snapshot
//! 7. Exits firmware services and jumps to the kernel
//!
//! Firmware is reached exclusively through the capability traits in
//! [`services`]; concrete backends live with the platform entry stubs.

#![no_std]
#![deny(unsafe_op_in_unsafe_fn)]

extern crate alloc;

pub mod allocator;
pub mod arch;
pub mod config;
pub mod elf;
pub mod error;
pub mod fstab;
pub mod handover;
pub mod heap;
pub mod loader;
pub mod path;
pub mod services;
pub mod video;

pub use error::{fatal, LoaderError};
pub use loader::run;
