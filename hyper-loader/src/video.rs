//! Video Mode Selection
//!
//! Reads the `video-mode` key of the loadable entry, matches it against
//! the modes the firmware lists, and sets the winner. The mode list
//! ordering is taken as the service reports it; under an `at-least`
//! constraint the last qualifying mode wins, so with duplicate
//! geometries the later one is selected.

use crate::config::{DEFAULT_VIDEO_BPP, DEFAULT_VIDEO_HEIGHT, DEFAULT_VIDEO_WIDTH};
use crate::error::{LoaderError, ResourceError};
use crate::services::{Resolution, VideoMode, VideoServices};

use hyper_config::{Config, ConfigScope, TypeMask, Value};
use hyper_protocol::Framebuffer;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Constraint {
    Exactly,
    AtLeast,
}

#[derive(Debug, Clone, Copy)]
struct RequestedMode {
    width: u32,
    height: u32,
    bpp: u32,
    constraint: Constraint,
    /// Leave the video hardware alone entirely.
    none: bool,
}

impl RequestedMode {
    const AUTO: Self = Self {
        width: DEFAULT_VIDEO_WIDTH,
        height: DEFAULT_VIDEO_HEIGHT,
        bpp: DEFAULT_VIDEO_BPP,
        constraint: Constraint::AtLeast,
        none: false,
    };

    const NONE: Self = Self {
        width: DEFAULT_VIDEO_WIDTH,
        height: DEFAULT_VIDEO_HEIGHT,
        bpp: DEFAULT_VIDEO_BPP,
        constraint: Constraint::AtLeast,
        none: true,
    };
}

fn dimension(value: Option<u64>, default: u32, key: &'static str) -> Result<u32, LoaderError> {
    match value {
        None => Ok(default),
        Some(v) => u32::try_from(v).map_err(|_| LoaderError::InvalidValue { key }),
    }
}

fn requested_mode(
    cfg: &Config<'static>,
    value: Option<Value<'static>>,
) -> Result<RequestedMode, LoaderError> {
    // No video-mode key at all: leave the hardware alone.
    let Some(value) = value else {
        return Ok(RequestedMode::NONE);
    };

    if value.is_null() {
        return Ok(RequestedMode::NONE);
    }

    if let Some(s) = value.as_str() {
        return match s {
            "unset" => Ok(RequestedMode::NONE),
            "auto" => Ok(RequestedMode::AUTO),
            _ => Err(LoaderError::InvalidValue { key: "video-mode" }),
        };
    }

    // Object form: absent fields keep their defaults.
    let mut mode = RequestedMode::AUTO;
    mode.width = dimension(cfg.get_unsigned(&value, "width")?, mode.width, "width")?;
    mode.height = dimension(cfg.get_unsigned(&value, "height")?, mode.height, "height")?;
    mode.bpp = dimension(cfg.get_unsigned(&value, "bpp")?, mode.bpp, "bpp")?;

    if let Some(constraint) = cfg.get_string(&value, "constraint")? {
        mode.constraint = match constraint {
            "exactly" => Constraint::Exactly,
            "at-least" => Constraint::AtLeast,
            _ => return Err(LoaderError::InvalidValue { key: "constraint" }),
        };
    }

    Ok(mode)
}

fn pick_mode<'m>(
    modes: &'m [VideoMode],
    native: Resolution,
    requested: &RequestedMode,
) -> Option<&'m VideoMode> {
    let mut picked = None;

    for mode in modes {
        match requested.constraint {
            Constraint::Exactly => {
                if mode.width == requested.width
                    && mode.height == requested.height
                    && mode.bpp == requested.bpp
                {
                    return Some(mode);
                }
            }
            Constraint::AtLeast => {
                let fits_request = mode.width >= requested.width
                    && mode.height >= requested.height
                    && mode.bpp >= requested.bpp;
                let fits_native = mode.width <= native.width && mode.height <= native.height;
                if fits_request && fits_native {
                    picked = Some(mode);
                }
            }
        }
    }

    picked
}

/// Resolve and set the video mode of a loadable entry. `Ok(None)` means
/// the entry asked for the mode to be left alone and no framebuffer is
/// exported.
pub fn set_video_mode(
    cfg: &Config<'static>,
    entry: &dyn ConfigScope,
    vs: &dyn VideoServices,
) -> Result<Option<Framebuffer>, LoaderError> {
    let value = cfg.get_one_of(
        entry,
        "video-mode",
        TypeMask::OBJECT | TypeMask::STRING | TypeMask::NONE,
    )?;
    let requested = requested_mode(cfg, value)?;

    if requested.none {
        return Ok(None);
    }

    let native = vs.query_resolution().unwrap_or(Resolution {
        width: DEFAULT_VIDEO_WIDTH,
        height: DEFAULT_VIDEO_HEIGHT,
    });

    let picked = pick_mode(vs.list_modes(), native, &requested).ok_or(LoaderError::Resource(
        ResourceError::NoVideoMode {
            width: requested.width,
            height: requested.height,
            bpp: requested.bpp,
        },
    ))?;

    log::info!(
        "picked video mode {}x{} {} bpp",
        picked.width,
        picked.height,
        picked.bpp
    );

    vs.set_mode(picked.id)
        .ok_or(LoaderError::Resource(ResourceError::VideoModeSetFailed))
        .map(Some)
}
