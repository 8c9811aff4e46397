// SPDX-FileCopyrightText: Copyright (c) 2024-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! One-shot enumeration of the block directory.

use super::{BlockAttr, BlockDirectory, BlockSet, MemoryBlock};
use crate::policy::{RawState, ZoneMask};
use crate::{Result, sysfs};

/// Enumerates every block in `dir`.
///
/// Only a failure to list the directory is fatal. Attributes that cannot be
/// read fall back to zero values so one bad block does not hide the rest.
pub(crate) fn scan_blocks(dir: &dyn BlockDirectory) -> Result<BlockSet> {
    let ids = dir.block_ids()?;
    let blocks: Vec<MemoryBlock> = ids.into_iter().map(|id| load_block(dir, id)).collect();
    tracing::debug!("enumerated {} memory blocks", blocks.len());
    Ok(BlockSet::from_blocks(blocks))
}

/// Reads all attributes of block `id`.
pub(crate) fn load_block(dir: &dyn BlockDirectory, id: u32) -> MemoryBlock {
    let mut block = MemoryBlock {
        id,
        node: dir.node(id).unwrap_or_default(),
        online: false,
        phys_device: read_attr(dir, id, BlockAttr::PhysDevice)
            .map(|s| sysfs::parse_ulong(&s))
            .unwrap_or(0),
        removable: read_attr(dir, id, BlockAttr::Removable)
            .map(|s| sysfs::parse_ulong(&s) != 0)
            .unwrap_or(false),
        raw_state: RawState::default(),
        zones: ZoneMask::empty(),
    };
    apply_mutable_attrs(dir, &mut block);
    block
}

/// Re-reads the attributes a state change can alter: `online`, `state` and
/// `valid_zones`. Values that cannot be read keep their cached contents.
pub(crate) fn refresh_block(dir: &dyn BlockDirectory, block: &mut MemoryBlock) {
    apply_mutable_attrs(dir, block);
}

fn apply_mutable_attrs(dir: &dyn BlockDirectory, block: &mut MemoryBlock) {
    let id = block.id;
    if let Some(online) = read_attr(dir, id, BlockAttr::Online) {
        block.online = sysfs::parse_ulong(&online) != 0;
    }
    if let Some(state) = read_attr(dir, id, BlockAttr::State) {
        match state.trim().parse::<RawState>() {
            Ok(raw) => block.raw_state = raw,
            Err(_) => tracing::warn!("memory{}: unrecognised state {:?}", id, state),
        }
    }
    if let Some(zones) = read_attr(dir, id, BlockAttr::ValidZones) {
        block.zones = ZoneMask::parse_list(&zones);
    }
}

fn read_attr(dir: &dyn BlockDirectory, id: u32, attr: BlockAttr) -> Option<String> {
    match dir.read(id, attr) {
        Ok(value) => Some(value),
        Err(e) => {
            tracing::debug!("memory{}: {} unreadable: {}", id, attr.file_name(), e);
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::SysfsBlockDirectory;
    use crate::numa::NumaNode;
    use crate::policy::OnlinePolicy;
    use crate::testing::{FakeMemory, SysfsTree};

    #[test]
    fn test_scan_sorts_and_parses() {
        let tree = SysfsTree::new();
        tree.memory_block(32, "online", "Movable", Some(1));
        tree.memory_block(2, "online", "DMA32 Normal", Some(0));
        tree.memory_block(9, "offline", "Normal Movable", None);

        let dir = SysfsBlockDirectory::new(tree.memory_dir());
        let set = scan_blocks(&dir).unwrap();
        assert_eq!(set.ids(), vec![2, 9, 32]);

        let b2 = set.get(2).unwrap();
        assert!(b2.is_online());
        assert_eq!(b2.node(), NumaNode(0));
        assert_eq!(b2.state(), OnlinePolicy::Kernel);

        let b9 = set.get(9).unwrap();
        assert!(!b9.is_online());
        assert!(b9.node().is_unknown());
        assert_eq!(b9.state(), OnlinePolicy::Offline);

        assert_eq!(set.get(32).unwrap().state(), OnlinePolicy::Movable);
    }

    #[test]
    fn test_missing_attributes_default_to_zero() {
        let tree = SysfsTree::new();
        tree.dir("devices/system/memory/memory4");

        let dir = SysfsBlockDirectory::new(tree.memory_dir());
        let set = scan_blocks(&dir).unwrap();
        let block = set.get(4).unwrap();
        assert!(!block.is_online());
        assert!(!block.is_removable());
        assert_eq!(block.phys_device(), 0);
        assert_eq!(block.raw_state(), RawState::Offline);
        assert!(block.zones().is_empty());
    }

    #[test]
    fn test_unopenable_directory_fails() {
        let dir = SysfsBlockDirectory::new("/nonexistent/memory");
        assert!(scan_blocks(&dir).unwrap_err().is_io());
    }

    #[test]
    fn test_refresh_picks_up_kernel_changes() {
        let fake = FakeMemory::with_block_size(0x1000_0000);
        fake.add_block(1, false, ZoneMask::NORMAL | ZoneMask::MOVABLE);

        let mut block = load_block(&fake, 1);
        assert_eq!(block.state(), OnlinePolicy::Offline);

        fake.set_online(1, true, ZoneMask::MOVABLE);
        refresh_block(&fake, &mut block);
        assert!(block.is_online());
        assert_eq!(block.state(), OnlinePolicy::Movable);
    }
}
