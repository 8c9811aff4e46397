// SPDX-FileCopyrightText: Copyright (c) 2024-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Memory blocks and the kernel block directory.
//!
//! A [`MemoryBlock`] is a snapshot of one `memory<N>` directory. Its effective
//! [`OnlinePolicy`] is never stored; [`derive_state`] computes it from the raw
//! `state` and `valid_zones` attributes every time it is asked for.
//!
//! [`BlockDirectory`] abstracts the directory itself so the transition engine
//! can be exercised against an in-memory kernel in tests.

mod directory;
pub(crate) mod scan;

pub use directory::{BlockAttr, BlockDirectory, GlobalAttr, SysfsBlockDirectory};

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::numa::NumaNode;
use crate::policy::{OnlinePolicy, RawState, ZoneMask};

/// Snapshot of a kernel memory block.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemoryBlock {
    pub(crate) id: u32,
    pub(crate) node: NumaNode,
    pub(crate) online: bool,
    pub(crate) phys_device: u64,
    pub(crate) removable: bool,
    pub(crate) raw_state: RawState,
    pub(crate) zones: ZoneMask,
}

impl MemoryBlock {
    /// Creates a block snapshot from raw attribute values.
    pub fn new(
        id: u32,
        node: NumaNode,
        online: bool,
        phys_device: u64,
        removable: bool,
        raw_state: RawState,
        zones: ZoneMask,
    ) -> Self {
        Self {
            id,
            node,
            online,
            phys_device,
            removable,
            raw_state,
            zones,
        }
    }

    /// Block index; `id × block_size` is the block's physical base address.
    pub fn id(&self) -> u32 {
        self.id
    }

    /// NUMA node from the block's `node<M>` link.
    pub fn node(&self) -> NumaNode {
        self.node
    }

    /// Raw `online` flag.
    pub fn is_online(&self) -> bool {
        self.online
    }

    /// Raw `phys_device` value.
    pub fn phys_device(&self) -> u64 {
        self.phys_device
    }

    /// Raw `removable` flag.
    pub fn is_removable(&self) -> bool {
        self.removable
    }

    /// Raw `state` attribute.
    pub fn raw_state(&self) -> RawState {
        self.raw_state
    }

    /// Parsed `valid_zones` attribute.
    pub fn zones(&self) -> ZoneMask {
        self.zones
    }

    /// Effective policy state, see [`derive_state`].
    pub fn state(&self) -> OnlinePolicy {
        derive_state(self.raw_state, self.zones)
    }

    /// Physical base address for the given block size, `None` on overflow.
    pub fn phys_addr(&self, block_size: u64) -> Option<u64> {
        (self.id as u64).checked_mul(block_size)
    }
}

/// Derives a block's effective state from its raw state and zones.
///
/// Check order is fixed: offline wins, then DMA/DMA32 (kernel), then Normal
/// (online), then Movable. A block online with no recognised zone is online.
pub fn derive_state(raw_state: RawState, zones: ZoneMask) -> OnlinePolicy {
    if raw_state == RawState::Offline {
        OnlinePolicy::Offline
    } else if zones.intersects(ZoneMask::DMA | ZoneMask::DMA32) {
        OnlinePolicy::Kernel
    } else if zones.contains(ZoneMask::NORMAL) {
        OnlinePolicy::Online
    } else if zones.contains(ZoneMask::MOVABLE) {
        OnlinePolicy::Movable
    } else {
        OnlinePolicy::Online
    }
}

/// Memory blocks sorted ascending by id with an id index.
#[derive(Debug, Clone, Default)]
pub struct BlockSet {
    blocks: Vec<MemoryBlock>,
    index: HashMap<u32, usize>,
}

impl BlockSet {
    /// Builds a set from blocks in any order. Later duplicates of an id are dropped.
    pub fn from_blocks(mut blocks: Vec<MemoryBlock>) -> Self {
        blocks.sort_by_key(|b| b.id);
        blocks.dedup_by_key(|b| b.id);
        let index = blocks
            .iter()
            .enumerate()
            .map(|(pos, b)| (b.id, pos))
            .collect();
        Self { blocks, index }
    }

    /// Looks up a block by id.
    pub fn get(&self, id: u32) -> Option<&MemoryBlock> {
        self.index.get(&id).map(|&pos| &self.blocks[pos])
    }

    pub(crate) fn get_mut(&mut self, id: u32) -> Option<&mut MemoryBlock> {
        self.index.get(&id).map(|&pos| &mut self.blocks[pos])
    }

    /// Returns true if a block with this id exists.
    pub fn contains(&self, id: u32) -> bool {
        self.index.contains_key(&id)
    }

    /// Blocks in ascending id order.
    pub fn iter(&self) -> std::slice::Iter<'_, MemoryBlock> {
        self.blocks.iter()
    }

    /// Block ids in ascending order.
    pub fn ids(&self) -> Vec<u32> {
        self.blocks.iter().map(|b| b.id).collect()
    }

    /// Number of blocks.
    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    /// Returns true if no blocks were enumerated.
    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }
}

impl<'a> IntoIterator for &'a BlockSet {
    type Item = &'a MemoryBlock;
    type IntoIter = std::slice::Iter<'a, MemoryBlock>;

    fn into_iter(self) -> Self::IntoIter {
        self.blocks.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn block(id: u32) -> MemoryBlock {
        MemoryBlock::new(
            id,
            NumaNode(0),
            true,
            0,
            true,
            RawState::Online,
            ZoneMask::MOVABLE,
        )
    }

    #[rstest]
    #[case(RawState::Offline, ZoneMask::DMA | ZoneMask::NORMAL, OnlinePolicy::Offline)]
    #[case(RawState::Online, ZoneMask::DMA, OnlinePolicy::Kernel)]
    #[case(RawState::Online, ZoneMask::DMA32 | ZoneMask::MOVABLE, OnlinePolicy::Kernel)]
    #[case(RawState::Online, ZoneMask::DMA | ZoneMask::NORMAL, OnlinePolicy::Kernel)]
    #[case(RawState::Online, ZoneMask::NORMAL | ZoneMask::MOVABLE, OnlinePolicy::Online)]
    #[case(RawState::Online, ZoneMask::MOVABLE, OnlinePolicy::Movable)]
    #[case(RawState::Online, ZoneMask::NONE, OnlinePolicy::Online)]
    #[case(RawState::Online, ZoneMask::empty(), OnlinePolicy::Online)]
    #[case(RawState::GoingOffline, ZoneMask::MOVABLE, OnlinePolicy::Movable)]
    fn test_derive_state(
        #[case] raw: RawState,
        #[case] zones: ZoneMask,
        #[case] expected: OnlinePolicy,
    ) {
        assert_eq!(derive_state(raw, zones), expected);
    }

    #[test]
    fn test_block_set_sorted_and_indexed() {
        let set = BlockSet::from_blocks(vec![block(40), block(2), block(17), block(2)]);
        assert_eq!(set.ids(), vec![2, 17, 40]);
        assert_eq!(set.len(), 3);
        assert_eq!(set.get(17).map(|b| b.id()), Some(17));
        assert!(set.get(3).is_none());
        assert!(set.contains(40));
    }

    #[test]
    fn test_phys_addr() {
        let b = block(16);
        assert_eq!(b.phys_addr(0x800_0000), Some(16 * 0x800_0000));
        assert_eq!(block(u32::MAX).phys_addr(u64::MAX), None);
    }
}
