// SPDX-FileCopyrightText: Copyright (c) 2024-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

use std::fs;
use std::path::{Path, PathBuf};

use crate::numa::NumaNode;
use crate::{MemError, Result, sysfs};

/// Per-block attribute files.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[allow(missing_docs)]
pub enum BlockAttr {
    Online,
    PhysDevice,
    Removable,
    State,
    ValidZones,
}

impl BlockAttr {
    /// File name inside the `memory<N>` directory.
    pub fn file_name(&self) -> &'static str {
        match self {
            Self::Online => "online",
            Self::PhysDevice => "phys_device",
            Self::Removable => "removable",
            Self::State => "state",
            Self::ValidZones => "valid_zones",
        }
    }
}

/// System-wide attribute files next to the `memory<N>` directories.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GlobalAttr {
    /// Hex-encoded block size in bytes.
    BlockSizeBytes,
    /// Auto-online policy applied to newly added blocks.
    AutoOnlineBlocks,
}

impl GlobalAttr {
    /// File name in the memory directory.
    pub fn file_name(&self) -> &'static str {
        match self {
            Self::BlockSizeBytes => "block_size_bytes",
            Self::AutoOnlineBlocks => "auto_online_blocks",
        }
    }
}

/// Access to the kernel memory block directory.
///
/// Writes return the byte count the store reported; verifying it against the
/// expected length is the caller's job.
pub trait BlockDirectory {
    /// Ids of every `memory<N>` entry, in directory order.
    fn block_ids(&self) -> Result<Vec<u32>>;

    /// Reads a block attribute with the trailing newline removed.
    fn read(&self, id: u32, attr: BlockAttr) -> Result<String>;

    /// Writes a block attribute.
    fn write(&self, id: u32, attr: BlockAttr, value: &str) -> Result<usize>;

    /// NUMA node from the block's `node<M>` link, if any.
    fn node(&self, id: u32) -> Option<NumaNode>;

    /// Reads a global attribute.
    fn read_global(&self, attr: GlobalAttr) -> Result<String>;

    /// Writes a global attribute.
    fn write_global(&self, attr: GlobalAttr, value: &str) -> Result<usize>;

    /// Path of a block attribute, for diagnostics.
    fn block_path(&self, id: u32, attr: BlockAttr) -> PathBuf;

    /// Path of a global attribute, for diagnostics.
    fn global_path(&self, attr: GlobalAttr) -> PathBuf;
}

/// [`BlockDirectory`] over `<sysfs>/devices/system/memory`.
#[derive(Debug, Clone)]
pub struct SysfsBlockDirectory {
    root: PathBuf,
}

impl SysfsBlockDirectory {
    /// Uses `root` as the memory directory.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// The memory directory.
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn block_dir(&self, id: u32) -> PathBuf {
        self.root.join(format!("memory{id}"))
    }
}

/// Parses `memory<N>`, ignoring anything after the digits.
pub(crate) fn parse_block_dir_name(name: &str) -> Option<u32> {
    let digits = name.strip_prefix("memory")?;
    let end = digits
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(digits.len());
    digits[..end].parse().ok()
}

impl BlockDirectory for SysfsBlockDirectory {
    fn block_ids(&self) -> Result<Vec<u32>> {
        let entries = fs::read_dir(&self.root).map_err(|e| MemError::sysfs(&self.root, e))?;

        let mut ids = Vec::new();
        for entry in entries {
            let entry = match entry {
                Ok(entry) => entry,
                Err(e) => {
                    tracing::warn!("skipping unreadable entry in {}: {}", self.root.display(), e);
                    continue;
                }
            };
            let is_dir = entry.file_type().map(|t| t.is_dir()).unwrap_or(false);
            if !is_dir {
                continue;
            }
            if let Some(id) = parse_block_dir_name(&entry.file_name().to_string_lossy()) {
                ids.push(id);
            }
        }
        Ok(ids)
    }

    fn read(&self, id: u32, attr: BlockAttr) -> Result<String> {
        sysfs::read_attr(&self.block_path(id, attr))
    }

    fn write(&self, id: u32, attr: BlockAttr, value: &str) -> Result<usize> {
        sysfs::write_attr(&self.block_path(id, attr), value)
    }

    fn node(&self, id: u32) -> Option<NumaNode> {
        let entries = fs::read_dir(self.block_dir(id)).ok()?;
        entries.flatten().find_map(|entry| {
            let is_link = entry.file_type().map(|t| t.is_symlink()).unwrap_or(false);
            if !is_link {
                return None;
            }
            NumaNode::from_link_name(&entry.file_name().to_string_lossy())
        })
    }

    fn read_global(&self, attr: GlobalAttr) -> Result<String> {
        sysfs::read_attr(&self.global_path(attr))
    }

    fn write_global(&self, attr: GlobalAttr, value: &str) -> Result<usize> {
        sysfs::write_attr(&self.global_path(attr), value)
    }

    fn block_path(&self, id: u32, attr: BlockAttr) -> PathBuf {
        self.block_dir(id).join(attr.file_name())
    }

    fn global_path(&self, attr: GlobalAttr) -> PathBuf {
        self.root.join(attr.file_name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::SysfsTree;

    #[test]
    fn test_parse_block_dir_name() {
        assert_eq!(parse_block_dir_name("memory0"), Some(0));
        assert_eq!(parse_block_dir_name("memory1234"), Some(1234));
        assert_eq!(parse_block_dir_name("memory"), None);
        assert_eq!(parse_block_dir_name("power"), None);
        assert_eq!(parse_block_dir_name("memory_tiering"), None);
    }

    #[test]
    fn test_block_ids_only_counts_memory_dirs() {
        let tree = SysfsTree::new();
        tree.memory_block(3, "online", "Movable", Some(0));
        tree.memory_block(1, "offline", "Normal Movable", Some(1));
        tree.file("devices/system/memory/memory7", "not a directory");
        tree.dir("devices/system/memory/power");

        let dir = SysfsBlockDirectory::new(tree.memory_dir());
        let mut ids = dir.block_ids().unwrap();
        ids.sort();
        assert_eq!(ids, vec![1, 3]);
    }

    #[test]
    fn test_node_link_resolution() {
        let tree = SysfsTree::new();
        tree.memory_block(5, "online", "Normal", Some(2));
        tree.memory_block(6, "online", "Normal", None);

        let dir = SysfsBlockDirectory::new(tree.memory_dir());
        assert_eq!(dir.node(5), Some(NumaNode(2)));
        assert_eq!(dir.node(6), None);
        assert_eq!(dir.node(99), None);
    }

    #[test]
    fn test_missing_directory_is_io_error() {
        let dir = SysfsBlockDirectory::new("/nonexistent/devices/system/memory");
        assert!(dir.block_ids().unwrap_err().is_io());
    }
}
