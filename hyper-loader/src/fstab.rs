//! Filesystem Table
//!
//! Registry of every filesystem instance detected during disk
//! enumeration, resolvable by the selectors of a [`FullPath`]. The entry
//! the configuration file was loaded from is remembered as the origin and
//! backs the implicit `boot` selectors.

use crate::path::{FullPath, Guid, PathError, Selector};
use crate::services::Filesystem;

use alloc::boxed::Box;
use alloc::string::String;
use alloc::vec::Vec;

/// One mounted filesystem and the identity of its partition.
pub struct FsEntry {
    pub disk_index: u32,
    pub disk_guid: Guid,
    pub partition_index: u32,
    pub partition_guid: Guid,
    /// Volume label, when the filesystem has one.
    pub label: Option<String>,
    fs: Box<dyn Filesystem>,
}

impl FsEntry {
    pub fn new(
        disk_index: u32,
        disk_guid: Guid,
        partition_index: u32,
        partition_guid: Guid,
        label: Option<String>,
        fs: Box<dyn Filesystem>,
    ) -> Self {
        Self {
            disk_index,
            disk_guid,
            partition_index,
            partition_guid,
            label,
            fs,
        }
    }

    pub fn filesystem(&self) -> &dyn Filesystem {
        &*self.fs
    }
}

/// All detected filesystems, in disk enumeration order.
#[derive(Default)]
pub struct FsTable {
    entries: Vec<FsEntry>,
    origin: Option<usize>,
}

impl FsTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a filesystem, returning its table index.
    pub fn add_entry(&mut self, entry: FsEntry) -> usize {
        self.entries.push(entry);
        self.entries.len() - 1
    }

    pub fn entries(&self) -> &[FsEntry] {
        &self.entries
    }

    /// Remember which entry the configuration file was loaded from.
    pub fn set_origin(&mut self, index: usize) {
        self.origin = Some(index);
    }

    pub fn origin(&self) -> Option<&FsEntry> {
        self.origin.map(|i| &self.entries[i])
    }

    /// Resolve a parsed path to the filesystem it names.
    pub fn by_full_path(&self, path: &FullPath<'_>) -> Result<&FsEntry, PathError> {
        if path.disk == Selector::Boot && path.partition == Selector::Boot {
            return self.origin().ok_or(PathError::NoMatchingFilesystem);
        }

        let origin_index = self.origin;

        for (i, entry) in self.entries.iter().enumerate() {
            let disk_matches = match path.disk {
                Selector::Boot => {
                    origin_index.map(|o| self.entries[o].disk_index) == Some(entry.disk_index)
                }
                Selector::Index(index) => index == entry.disk_index,
                Selector::Guid(guid) => guid == entry.disk_guid,
                // Disks carry no label.
                Selector::Name(_) => false,
            };
            if !disk_matches {
                continue;
            }

            let partition_matches = match path.partition {
                Selector::Boot => origin_index == Some(i),
                Selector::Index(index) => index == entry.partition_index,
                Selector::Guid(guid) => guid == entry.partition_guid,
                Selector::Name(name) => entry.label.as_deref() == Some(name),
            };
            if partition_matches {
                return Ok(entry);
            }
        }

        Err(PathError::NoMatchingFilesystem)
    }
}
