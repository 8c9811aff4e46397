// SPDX-FileCopyrightText: Copyright (c) 2024-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! The administration context.
//!
//! [`MemContext`] owns the two kernel seams and the caches built on top of
//! them:
//!
//! - the block collection, enumerated on first use and kept for the context's
//!   lifetime (open a new context to see hot-added blocks);
//! - the region list, fetched on first use and dropped by
//!   [`MemContext::refresh_regions`] or by any lifecycle operation run through
//!   this context.
//!
//! The caches use [`OnceCell`], so a context is `!Sync`; use one per thread.

use std::cell::OnceCell;

use crate::block::scan::scan_blocks;
use crate::block::{BlockDirectory, BlockSet, MemoryBlock, SysfsBlockDirectory};
use crate::config::MemConfig;
use crate::region::Region;
use crate::topology::{Memdev, SysfsTopology, Topology};
use crate::{MemError, Result};

/// Single-owner handle over the memory block tree and the CXL topology.
pub struct MemContext {
    config: MemConfig,
    memory: Box<dyn BlockDirectory>,
    topology: Box<dyn Topology>,
    blocks: OnceCell<BlockSet>,
    regions: OnceCell<Vec<Region>>,
}

impl MemContext {
    /// Creates a context backed by the sysfs tree under `config.sysfs_root`.
    pub fn new(config: MemConfig) -> Self {
        let memory = SysfsBlockDirectory::new(config.memory_dir());
        let topology = SysfsTopology::new(config.cxl_dir(), config.dax_dir());
        Self::with_backends(config, memory, topology)
    }

    /// Creates a context over explicit backends.
    pub fn with_backends(
        config: MemConfig,
        memory: impl BlockDirectory + 'static,
        topology: impl Topology + 'static,
    ) -> Self {
        Self {
            config,
            memory: Box::new(memory),
            topology: Box::new(topology),
            blocks: OnceCell::new(),
            regions: OnceCell::new(),
        }
    }

    /// The configuration this context was built with.
    pub fn config(&self) -> &MemConfig {
        &self.config
    }

    /// The memory block directory.
    pub fn memory(&self) -> &dyn BlockDirectory {
        self.memory.as_ref()
    }

    /// The CXL/DAX topology.
    pub fn topology(&self) -> &dyn Topology {
        self.topology.as_ref()
    }

    /// Returns the block collection, scanning the block directory on first use.
    ///
    /// A failed scan leaves the collection empty and is retried on the next call.
    pub fn enumerate_blocks(&self) -> Result<&BlockSet> {
        if let Some(blocks) = self.blocks.get() {
            return Ok(blocks);
        }
        let scanned = scan_blocks(self.memory.as_ref())?;
        Ok(self.blocks.get_or_init(|| scanned))
    }

    /// Looks up a block by id.
    pub fn block(&self, id: u32) -> Result<&MemoryBlock> {
        self.enumerate_blocks()?
            .get(id)
            .ok_or_else(|| MemError::NotFound(format!("memory block {id}")))
    }

    /// Splits the context into the block directory and one cached block so a
    /// transition can write through the former and update the latter.
    pub(crate) fn block_mut(&mut self, id: u32) -> Result<(&dyn BlockDirectory, &mut MemoryBlock)> {
        self.enumerate_blocks()?;
        let memory = self.memory.as_ref();
        let block = self
            .blocks
            .get_mut()
            .and_then(|set| set.get_mut(id))
            .ok_or_else(|| MemError::NotFound(format!("memory block {id}")))?;
        Ok((memory, block))
    }

    /// All regions sorted by id, fetched on first use.
    pub fn regions(&self) -> Result<&[Region]> {
        if let Some(regions) = self.regions.get() {
            return Ok(regions);
        }
        let mut fetched = self.topology.regions()?;
        fetched.sort_by_key(|r| r.id);
        tracing::debug!("fetched {} regions", fetched.len());
        Ok(self.regions.get_or_init(|| fetched))
    }

    /// Looks up a region by name.
    pub fn region(&self, name: &str) -> Result<&Region> {
        self.regions()?
            .iter()
            .find(|r| r.name == name)
            .ok_or_else(|| MemError::NotFound(format!("region {name}")))
    }

    /// Drops the cached region list; the next query fetches it again.
    pub fn refresh_regions(&mut self) {
        self.regions.take();
    }

    /// All memdevs sorted by id. Not cached.
    pub fn memdevs(&self) -> Result<Vec<Memdev>> {
        let mut memdevs = self.topology.memdevs()?;
        memdevs.sort_by_key(|m| m.id);
        Ok(memdevs)
    }

    /// Looks up a memdev by name.
    pub fn memdev(&self, name: &str) -> Result<Memdev> {
        self.memdevs()?
            .into_iter()
            .find(|m| m.name == name)
            .ok_or_else(|| MemError::NotFound(format!("memdev {name}")))
    }

    /// Whether the named memdev can join a new region.
    pub fn memdev_is_available(&self, name: &str) -> Result<bool> {
        Ok(self.memdev(name)?.is_available())
    }

    /// Interleave granularity advertised for the named memdev.
    pub fn memdev_interleave_granularity(&self, name: &str) -> Result<u32> {
        let memdev = self.memdev(name)?;
        self.topology.memdev_interleave_granularity(&memdev.name)
    }
}

impl std::fmt::Debug for MemContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemContext")
            .field("config", &self.config)
            .field("blocks", &self.blocks.get().map(|b| b.len()))
            .field("regions", &self.regions.get().map(|r| r.len()))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use crate::policy::ZoneMask;
    use crate::testing::{FakeMemory, MockTopology, context, region};
    use crate::MemError;

    const BS: u64 = 0x1000_0000;

    #[test]
    fn test_blocks_enumerated_once() {
        let memory = FakeMemory::with_block_size(BS);
        memory.add_blocks(0..4, true, ZoneMask::MOVABLE);
        let ctx = context(memory.clone(), MockTopology::new());

        assert_eq!(ctx.enumerate_blocks().unwrap().len(), 4);
        memory.add_block(9, false, ZoneMask::MOVABLE);
        assert_eq!(ctx.enumerate_blocks().unwrap().len(), 4);
        assert!(matches!(ctx.block(9), Err(MemError::NotFound(_))));
    }

    #[test]
    fn test_failed_scan_is_retried() {
        let memory = FakeMemory::with_block_size(BS);
        memory.add_block(0, true, ZoneMask::MOVABLE);
        memory.fail_listing(true);
        let ctx = context(memory.clone(), MockTopology::new());

        assert!(ctx.enumerate_blocks().unwrap_err().is_io());
        memory.fail_listing(false);
        assert_eq!(ctx.enumerate_blocks().unwrap().ids(), vec![0]);
    }

    #[test]
    fn test_region_cache_and_refresh() {
        let topology = MockTopology::new();
        topology.add_region(region("region1", 4 * BS, 4 * BS));
        topology.add_region(region("region0", 0x10 * BS, 4 * BS));
        let mut ctx = context(FakeMemory::with_block_size(BS), topology.clone());

        let names: Vec<_> = ctx.regions().unwrap().iter().map(|r| r.name.clone()).collect();
        assert_eq!(names, vec!["region0", "region1"]);

        topology.add_region(region("region2", 0x20 * BS, 4 * BS));
        assert_eq!(ctx.regions().unwrap().len(), 2);
        assert!(matches!(ctx.region("region2"), Err(MemError::NotFound(_))));

        ctx.refresh_regions();
        assert_eq!(ctx.regions().unwrap().len(), 3);
        assert!(ctx.region("region2").is_ok());
    }

    #[test]
    fn test_memdev_lookup() {
        let topology = MockTopology::new();
        topology.add_memdev("mem1", 1 << 30);
        topology.add_memdev("mem0", 2 << 30);
        let ctx = context(FakeMemory::with_block_size(BS), topology);

        let names: Vec<_> = ctx.memdevs().unwrap().into_iter().map(|m| m.name).collect();
        assert_eq!(names, vec!["mem0", "mem1"]);
        assert_eq!(ctx.memdev("mem0").unwrap().ram_size, 2 << 30);
        assert!(ctx.memdev_is_available("mem1").unwrap());
        assert!(matches!(ctx.memdev("mem7"), Err(MemError::NotFound(_))));
    }
}
