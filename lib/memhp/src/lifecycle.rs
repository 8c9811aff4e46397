// SPDX-FileCopyrightText: Copyright (c) 2024-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Region lifecycle.
//!
//! ```text
//! absent -> create -> uncommitted -> commit + enable -> enabled <-> disabled -> delete -> absent
//! ```
//!
//! Creation is transactional: any failure after the region is allocated
//! deletes it again, and the error says whether that cleanup worked
//! ([`MemError::CreateFailed`]) or not ([`MemError::RegionOrphaned`]).
//! Every operation here drops the context's region cache.

use crate::config::validate_granularity;
use crate::context::MemContext;
use crate::region::{BlockFilter, Region, RegionMode, count_in_range};
use crate::topology::{DecoderMode, Memdev};
use crate::transition::Change;
use crate::{MemError, Result};

impl MemContext {
    /// Creates, commits and enables a RAM region striped across `memdevs`.
    ///
    /// Device `i` in `memdevs` becomes interleave target `i`, which fixes the
    /// striping order. The region size is the sum of the devices' RAM sizes.
    pub fn create_region(&mut self, memdevs: &[String], granularity: u32) -> Result<Region> {
        let granularity = validate_granularity(granularity)?;
        let devices = self.resolve_memdevs(memdevs)?;

        let name = self.topology().create_ram_region().inspect_err(|e| {
            tracing::error!("could not allocate a ram region: {}", e);
        })?;
        tracing::info!("created ram region {}", name);

        let built = self.build_region(&name, &devices, granularity);
        self.refresh_regions();

        if let Err(cause) = built {
            tracing::error!("configuring region {} failed: {}", name, cause);
            return Err(match self.topology().delete_region(&name) {
                Ok(()) => {
                    tracing::warn!("deleted partially configured region {}", name);
                    MemError::CreateFailed {
                        region: name,
                        cause: Box::new(cause),
                    }
                }
                Err(rollback) => {
                    tracing::error!("failed to delete region {}: {}", name, rollback);
                    MemError::RegionOrphaned {
                        region: name,
                        cause: Box::new(cause),
                        rollback: Box::new(rollback),
                    }
                }
            });
        }

        self.region(&name).cloned()
    }

    fn resolve_memdevs(&self, names: &[String]) -> Result<Vec<Memdev>> {
        if names.is_empty() {
            return Err(MemError::InvalidArgument(
                "a region needs at least one memdev".into(),
            ));
        }

        let all = self.memdevs()?;
        let mut devices: Vec<Memdev> = Vec::with_capacity(names.len());
        for name in names {
            if devices.iter().any(|d| &d.name == name) {
                return Err(MemError::InvalidArgument(format!(
                    "memdev {name} listed more than once"
                )));
            }
            let device = all
                .iter()
                .find(|m| &m.name == name)
                .cloned()
                .ok_or_else(|| MemError::NotFound(format!("memdev {name}")))?;
            if !device.is_available() {
                tracing::warn!("memdev {} does not look available", name);
            }
            devices.push(device);
        }
        Ok(devices)
    }

    fn build_region(&self, name: &str, devices: &[Memdev], granularity: u32) -> Result<()> {
        let topology = self.topology();
        let ways = devices.len() as u32;

        topology.set_interleave_ways(name, ways)?;
        tracing::info!("set interleave ways to {} on {}", ways, name);
        topology.set_interleave_granularity(name, granularity)?;
        tracing::info!("set interleave granularity to {} on {}", granularity, name);

        let mut total: u64 = 0;
        for device in devices {
            topology.set_decoder_mode(&device.name, DecoderMode::Ram)?;
            tracing::info!("set decoder mode ram for {}", device.name);
            topology.set_decoder_dpa_size(&device.name, device.ram_size)?;
            tracing::info!("set decoder dpa size {} for {}", device.ram_size, device.name);
            total = total.checked_add(device.ram_size).ok_or_else(|| {
                MemError::InvalidArgument("combined memdev size overflows".into())
            })?;
        }

        topology.set_region_size(name, total)?;
        tracing::info!("set region size to {} on {}", total, name);

        for (position, device) in devices.iter().enumerate() {
            topology.set_region_target(name, position, &device.name)?;
            tracing::info!("set target {} of {} to {}", position, name, device.name);
        }

        topology.commit_region(name)?;
        tracing::info!("committed decode on {}", name);
        topology.enable_region(name)?;
        tracing::info!("enabled region {}", name);
        Ok(())
    }

    /// Offlines the region's blocks, then disables and deletes it.
    ///
    /// If any block fails to offline the region is left enabled and in place.
    pub fn delete_region(&mut self, name: &str) -> Result<()> {
        let region = self.region(name)?.clone();

        let block_size = self.block_size()?;

        let online = match region.span() {
            Ok(_) => count_in_range(
                self.enumerate_blocks()?,
                &region,
                block_size,
                BlockFilter::Online,
            )?,
            // a region without an address holds no blocks
            Err(reason) => {
                tracing::debug!("{}: {}", name, reason);
                0
            }
        };
        if online > 0 {
            self.offline_region_blocks(name).inspect_err(|e| {
                tracing::error!("not deleting {}: {}", name, e);
            })?;
            tracing::info!("offlined all memory blocks of {}", name);
        }

        self.refresh_regions();
        if region.enabled {
            self.topology().disable_region(name)?;
            tracing::info!("disabled region {}", name);
        }
        self.topology().delete_region(name)?;
        tracing::info!("deleted region {}", name);
        Ok(())
    }

    /// Binds the region driver.
    pub fn enable_region(&mut self, name: &str) -> Result<()> {
        if self.region(name)?.enabled {
            return Err(MemError::AlreadyInState(format!(
                "region {name} is already enabled"
            )));
        }
        self.refresh_regions();
        self.topology().enable_region(name)?;
        tracing::info!("enabled region {}", name);
        Ok(())
    }

    /// Unbinds the region driver.
    pub fn disable_region(&mut self, name: &str) -> Result<()> {
        if !self.region(name)?.enabled {
            return Err(MemError::AlreadyInState(format!(
                "region {name} is already disabled"
            )));
        }
        self.refresh_regions();
        self.topology().disable_region(name)?;
        tracing::info!("disabled region {}", name);
        Ok(())
    }

    /// Whether the region's DAX device is bound as system RAM.
    pub fn region_is_ram_mode(&self, name: &str) -> Result<bool> {
        self.region(name)?;
        Ok(self.topology().dax_device(name)?.mode == RegionMode::Ram)
    }

    /// Whether the region's DAX device is bound as a raw device.
    pub fn region_is_dax_mode(&self, name: &str) -> Result<bool> {
        self.region(name)?;
        Ok(self.topology().dax_device(name)?.mode == RegionMode::Dax)
    }

    /// Switches the region's DAX device to `target` ([`RegionMode::Ram`] or
    /// [`RegionMode::Dax`]).
    ///
    /// Switching an enabled region to DAX first offlines all its blocks; any
    /// block that stays online aborts the switch. If binding the new driver
    /// fails the previous binding is restored on a best-effort basis.
    pub fn switch_mode(&mut self, name: &str, target: RegionMode) -> Result<Change> {
        if target == RegionMode::Other {
            return Err(MemError::InvalidArgument(
                "a region can only be switched to ram or dax mode".into(),
            ));
        }
        let region = self.region(name)?.clone();
        let dax = self.topology().dax_device(name)?;

        if dax.mode == target {
            tracing::info!("{} of {} already in {} mode", dax.name, name, target);
            return Ok(Change::Unchanged);
        }

        if target == RegionMode::Dax && region.enabled {
            self.offline_region_blocks(name).inspect_err(|e| {
                tracing::error!("not switching {} to dax mode: {}", name, e);
            })?;
            tracing::info!("offlined all memory blocks of {}", name);
        }

        self.refresh_regions();
        if dax.enabled {
            self.topology().disable_dax_device(&dax.name)?;
            tracing::info!("disabled dax device {}", dax.name);
        }

        if let Err(e) = self.bind_dax(&dax.name, target) {
            tracing::error!("failed to enable {} mode on {}: {}", target, dax.name, e);
            if dax.enabled {
                match self.bind_dax(&dax.name, dax.mode) {
                    Ok(()) => tracing::warn!("restored {} mode on {}", dax.mode, dax.name),
                    Err(restore) => {
                        tracing::error!("could not restore {} on {}: {}", dax.mode, dax.name, restore)
                    }
                }
            }
            return Err(e);
        }
        tracing::info!("enabled {} mode on dax device {}", target, dax.name);
        Ok(Change::Applied)
    }

    fn bind_dax(&self, dax: &str, mode: RegionMode) -> Result<()> {
        match mode {
            RegionMode::Ram => self.topology().enable_system_ram(dax),
            RegionMode::Dax => self.topology().enable_devdax(dax),
            RegionMode::Other => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::ZoneMask;
    use crate::testing::{FailPoint, FakeMemory, MockTopology, context, region};

    const BS: u64 = 256 << 20;
    const GIB: u64 = 1 << 30;

    fn names(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    fn topology_with_memdevs() -> MockTopology {
        let topology = MockTopology::new();
        topology.add_memdev("mem0", GIB);
        topology.add_memdev("mem1", 2 * GIB);
        topology.add_memdev("mem2", 4 * GIB);
        topology
    }

    #[test]
    fn test_create_sums_sizes_and_orders_targets() {
        let topology = topology_with_memdevs();
        let mut ctx = context(FakeMemory::with_block_size(BS), topology.clone());

        let created = ctx
            .create_region(&names(&["mem2", "mem0", "mem1"]), 4096)
            .unwrap();
        assert_eq!(created.size, 7 * GIB);
        assert_eq!(created.interleave_ways, 3);
        assert_eq!(created.interleave_granularity, 4096);
        assert!(created.enabled);
        assert_eq!(
            created.targets,
            vec![Some("mem2".into()), Some("mem0".into()), Some("mem1".into())]
        );
        assert_eq!(ctx.memdev("mem0").unwrap().decoder_mode, DecoderMode::Ram);
        assert!(!ctx.memdev_is_available("mem1").unwrap());
    }

    #[test]
    fn test_create_rolls_back_on_target_failure() {
        let topology = topology_with_memdevs();
        topology.fail_at(FailPoint::SetTarget(1));
        let mut ctx = context(FakeMemory::with_block_size(BS), topology.clone());

        let err = ctx
            .create_region(&names(&["mem0", "mem1", "mem2"]), 4096)
            .unwrap_err();
        match err {
            MemError::CreateFailed { region, .. } => assert_eq!(region, "region0"),
            other => panic!("unexpected error: {other:?}"),
        }
        assert!(ctx.regions().unwrap().is_empty());
        assert!(topology.calls().contains(&"delete_region region0".to_string()));
    }

    #[test]
    fn test_create_reports_orphaned_region() {
        let topology = topology_with_memdevs();
        topology.fail_at(FailPoint::Commit);
        topology.fail_at(FailPoint::DeleteRegion);
        let mut ctx = context(FakeMemory::with_block_size(BS), topology);

        let err = ctx.create_region(&names(&["mem0"]), 256).unwrap_err();
        assert!(matches!(err, MemError::RegionOrphaned { .. }));
        assert_eq!(ctx.regions().unwrap().len(), 1);
    }

    #[test]
    fn test_create_validates_before_allocating() {
        let topology = topology_with_memdevs();
        let mut ctx = context(FakeMemory::with_block_size(BS), topology.clone());

        assert!(matches!(
            ctx.create_region(&names(&["mem0"]), 100),
            Err(MemError::InvalidArgument(_))
        ));
        assert!(matches!(
            ctx.create_region(&[], 4096),
            Err(MemError::InvalidArgument(_))
        ));
        assert!(matches!(
            ctx.create_region(&names(&["mem0", "mem9"]), 4096),
            Err(MemError::NotFound(_))
        ));
        assert!(matches!(
            ctx.create_region(&names(&["mem0", "mem0"]), 4096),
            Err(MemError::InvalidArgument(_))
        ));
        assert!(topology.calls().is_empty());
    }

    #[test]
    fn test_delete_offlines_blocks_first() {
        let memory = FakeMemory::with_block_size(BS);
        memory.add_blocks(8..10, true, ZoneMask::MOVABLE);
        let topology = MockTopology::new();
        topology.add_region(region("region0", 8 * BS, 2 * BS));
        let mut ctx = context(memory.clone(), topology.clone());

        ctx.delete_region("region0").unwrap();
        assert!(!memory.is_online(8));
        assert!(!memory.is_online(9));
        assert_eq!(
            topology.calls(),
            vec!["disable_region region0", "delete_region region0"]
        );
        assert!(ctx.regions().unwrap().is_empty());
    }

    #[test]
    fn test_delete_aborts_when_a_block_stays_online() {
        let memory = FakeMemory::with_block_size(BS);
        memory.add_blocks(8..10, true, ZoneMask::MOVABLE);
        memory.fail_writes(9);
        let topology = MockTopology::new();
        topology.add_region(region("region0", 8 * BS, 2 * BS));
        let mut ctx = context(memory.clone(), topology.clone());

        assert!(matches!(
            ctx.delete_region("region0"),
            Err(MemError::PartialFailure(o)) if o.failures.len() == 1
        ));
        assert!(!memory.is_online(8));
        assert!(topology.calls().is_empty());
        ctx.refresh_regions();
        assert!(ctx.region("region0").unwrap().enabled);
    }

    #[test]
    fn test_delete_unaddressed_region() {
        let topology = MockTopology::new();
        let mut unaddressed = region("region3", crate::region::INVALID_ADDRESS, 0);
        unaddressed.enabled = false;
        topology.add_region(unaddressed);
        let mut ctx = context(FakeMemory::with_block_size(BS), topology.clone());

        ctx.delete_region("region3").unwrap();
        assert_eq!(topology.calls(), vec!["delete_region region3"]);
    }

    #[test]
    fn test_delete_refuses_without_block_size() {
        let memory = FakeMemory::with_block_size(BS);
        memory.add_blocks(4..6, true, ZoneMask::MOVABLE);
        let topology = MockTopology::new();
        topology.add_region(region("region0", 4 * BS, 2 * BS));
        let mut ctx = context(memory.clone(), topology.clone());

        memory.set_block_size(0);
        assert!(matches!(
            ctx.delete_region("region0"),
            Err(MemError::Config(_))
        ));
        assert!(memory.is_online(4));
        assert!(memory.is_online(5));
        assert!(topology.calls().is_empty());
        assert!(ctx.region("region0").is_ok());
    }

    #[test]
    fn test_enable_disable_guards() {
        let topology = MockTopology::new();
        topology.add_region(region("region0", 8 * BS, 2 * BS));
        let mut ctx = context(FakeMemory::with_block_size(BS), topology);

        let err = ctx.enable_region("region0").unwrap_err();
        assert!(matches!(err, MemError::AlreadyInState(_)));
        assert!(err.is_user_error());

        ctx.disable_region("region0").unwrap();
        assert!(!ctx.region("region0").unwrap().enabled);
        assert!(matches!(
            ctx.disable_region("region0"),
            Err(MemError::AlreadyInState(_))
        ));
        ctx.enable_region("region0").unwrap();
        assert!(ctx.region("region0").unwrap().enabled);
    }

    #[test]
    fn test_switch_to_dax_offlines_then_rebinds() {
        let memory = FakeMemory::with_block_size(BS);
        memory.add_blocks(8..12, true, ZoneMask::MOVABLE);
        let topology = MockTopology::new();
        topology.add_region(region("region0", 8 * BS, 4 * BS));
        let mut ctx = context(memory.clone(), topology.clone());

        assert!(ctx.region_is_ram_mode("region0").unwrap());
        assert_eq!(ctx.switch_mode("region0", RegionMode::Dax).unwrap(), Change::Applied);
        assert!(ctx.region_is_dax_mode("region0").unwrap());
        assert!((8..12).all(|id| !memory.is_online(id)));
        assert_eq!(
            topology.calls(),
            vec!["disable_dax dax0.0", "enable_devdax dax0.0"]
        );

        assert_eq!(
            ctx.switch_mode("region0", RegionMode::Dax).unwrap(),
            Change::Unchanged
        );
        assert_eq!(ctx.switch_mode("region0", RegionMode::Ram).unwrap(), Change::Applied);
        assert!(ctx.region_is_ram_mode("region0").unwrap());
    }

    #[test]
    fn test_switch_restores_previous_mode_on_failure() {
        let topology = MockTopology::new();
        topology.add_region(region("region0", 8 * BS, 4 * BS));
        topology.fail_at(FailPoint::EnableDevdax);
        let mut ctx = context(FakeMemory::with_block_size(BS), topology.clone());

        assert!(ctx.switch_mode("region0", RegionMode::Dax).is_err());
        assert!(ctx.region_is_ram_mode("region0").unwrap());
        assert!(matches!(
            ctx.switch_mode("region0", RegionMode::Other),
            Err(MemError::InvalidArgument(_))
        ));
        assert!(matches!(
            ctx.switch_mode("region7", RegionMode::Ram),
            Err(MemError::NotFound(_))
        ));
    }

    #[test]
    fn test_switch_aborts_when_offline_fails() {
        let memory = FakeMemory::with_block_size(BS);
        memory.add_blocks(8..10, true, ZoneMask::MOVABLE);
        memory.fail_writes(8);
        let topology = MockTopology::new();
        topology.add_region(region("region0", 8 * BS, 2 * BS));
        let mut ctx = context(memory, topology.clone());

        assert!(matches!(
            ctx.switch_mode("region0", RegionMode::Dax),
            Err(MemError::PartialFailure(_))
        ));
        assert!(topology.calls().is_empty());
        assert!(ctx.region_is_ram_mode("region0").unwrap());
    }
}
