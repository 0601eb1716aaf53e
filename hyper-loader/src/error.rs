//! Loader Error Taxonomy
//!
//! There is no recovery: every error propagates to the top-level handler,
//! which logs it and halts. The config lookup API is the only place where
//! absence of something is not an error.

use crate::allocator::AllocError;
use crate::elf::ElfError;
use crate::path::PathError;

use core::fmt;
use hyper_config::{LookupError, ParseError};
use hyper_paging::MapError;

/// Resource exhaustion and constraint failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceError {
    Allocation(AllocError),
    Mapping(MapError),
    NoVideoMode {
        width: u32,
        height: u32,
        bpp: u32,
    },
    VideoModeSetFailed,
    /// The firmware memory map kept growing across allocation attempts.
    MemoryMapUnstable,
    TooManyModules,
}

impl fmt::Display for ResourceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Allocation(err) => write!(f, "{err}"),
            Self::Mapping(err) => write!(f, "page table construction failed: {err}"),
            Self::NoVideoMode { width, height, bpp } => write!(
                f,
                "failed to pick a video mode according to constraints ({width}x{height} {bpp} bpp)"
            ),
            Self::VideoModeSetFailed => write!(f, "failed to set the picked video mode"),
            Self::MemoryMapUnstable => {
                write!(f, "firmware memory map would not stabilize for the handover")
            }
            Self::TooManyModules => write!(f, "too many modules in the loadable entry"),
        }
    }
}

/// Top-level failure of the load.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoaderError {
    /// Config text did not parse; reported with source context at the
    /// parse site.
    ConfigSyntax(ParseError),
    /// Missing mandatory key, duplicate unique key, or wrong value type.
    ConfigValue(LookupError<'static>),
    /// The config parsed but does not describe a bootable setup.
    ConfigSemantic(&'static str),
    /// A key had the right type but an unsupported literal.
    InvalidValue { key: &'static str },
    Path(PathError),
    Io(&'static str),
    Binary(ElfError),
    Capability(&'static str),
    Resource(ResourceError),
    Protocol(&'static str),
}

impl fmt::Display for LoaderError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ConfigSyntax(err) => write!(f, "config parse error: {err}"),
            Self::ConfigValue(err) => write!(f, "{err}"),
            Self::ConfigSemantic(context) => write!(f, "{context}"),
            Self::InvalidValue { key } => write!(f, "invalid value for \"{key}\""),
            Self::Path(err) => write!(f, "{err}"),
            Self::Io(context) => write!(f, "{context}"),
            Self::Binary(err) => write!(f, "failed to load kernel binary: {err}"),
            Self::Capability(context) => write!(f, "{context}"),
            Self::Resource(err) => write!(f, "{err}"),
            Self::Protocol(context) => write!(f, "{context}"),
        }
    }
}

impl From<ParseError> for LoaderError {
    fn from(err: ParseError) -> Self {
        Self::ConfigSyntax(err)
    }
}

impl From<LookupError<'static>> for LoaderError {
    fn from(err: LookupError<'static>) -> Self {
        Self::ConfigValue(err)
    }
}

impl From<PathError> for LoaderError {
    fn from(err: PathError) -> Self {
        Self::Path(err)
    }
}

impl From<ElfError> for LoaderError {
    fn from(err: ElfError) -> Self {
        Self::Binary(err)
    }
}

impl From<AllocError> for LoaderError {
    fn from(err: AllocError) -> Self {
        Self::Resource(ResourceError::Allocation(err))
    }
}

impl From<MapError> for LoaderError {
    fn from(err: MapError) -> Self {
        Self::Resource(ResourceError::Mapping(err))
    }
}

/// Log the error and halt. Nothing survives a loader failure.
pub fn fatal(err: &LoaderError) -> ! {
    log::error!("{err}");
    crate::arch::halt()
}
