// SPDX-FileCopyrightText: Copyright (c) 2024-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::numa::NumaNode;
use crate::region::{INVALID_ADDRESS, Region, RegionMode};
use crate::topology::{DaxDevice, DecoderMode, Memdev, Topology};
use crate::{MemError, Result};

/// A [`MockTopology`] operation that can be made to fail.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
#[allow(missing_docs)]
pub enum FailPoint {
    CreateRegion,
    SetWays,
    SetGranularity,
    SetDecoderMode(String),
    SetDpaSize(String),
    SetRegionSize,
    /// Binding the target at this interleave position.
    SetTarget(usize),
    Commit,
    EnableRegion,
    DisableRegion,
    DeleteRegion,
    DisableDax,
    EnableDevdax,
    EnableSystemRam,
}

#[derive(Debug, Clone)]
struct MockDax {
    name: String,
    mode: RegionMode,
}

#[derive(Debug, Clone)]
struct MockRegion {
    region: Region,
    dax: Option<MockDax>,
}

#[derive(Debug)]
struct State {
    memdevs: Vec<Memdev>,
    regions: BTreeMap<String, MockRegion>,
    next_region: u32,
    next_base: u64,
    fail: HashSet<FailPoint>,
    calls: Vec<String>,
}

/// In-memory CXL/DAX topology.
///
/// Mutating calls are recorded in a journal (see [`MockTopology::calls`])
/// before failure injection is applied, so a failed call still shows up.
/// Clones share state.
#[derive(Debug, Clone)]
pub struct MockTopology {
    state: Arc<Mutex<State>>,
}

impl Default for MockTopology {
    fn default() -> Self {
        Self::new()
    }
}

impl MockTopology {
    /// Empty topology. New regions are placed from 64 GiB upwards.
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(State {
                memdevs: Vec::new(),
                regions: BTreeMap::new(),
                next_region: 0,
                next_base: 64 << 30,
                fail: HashSet::new(),
                calls: Vec::new(),
            })),
        }
    }

    /// Adds an enabled, unbound memdev. Its endpoint and decoder are named
    /// after the memdev id.
    pub fn add_memdev(&self, name: &str, ram_size: u64) {
        let id = crate::topology::device_id(name, "mem").unwrap_or(0);
        self.state.lock().memdevs.push(Memdev {
            name: name.to_string(),
            id,
            ram_size,
            enabled: true,
            host: format!("0000:{:02x}:00.0", 0x30 + id),
            endpoint: Some(format!("endpoint{}", id + 10)),
            endpoint_enabled: true,
            decoder: Some(format!("decoder{}.0", id + 10)),
            decoder_mode: DecoderMode::None,
            region: None,
            node: NumaNode(1),
            firmware_version: Some("1.0".into()),
        });
    }

    /// Adds an existing region. Its DAX device follows `region.dax` and
    /// `region.mode`.
    pub fn add_region(&self, region: Region) {
        let mut state = self.state.lock();
        state.next_region = state.next_region.max(region.id + 1);
        let dax = region.dax.clone().map(|name| MockDax {
            name,
            mode: region.mode,
        });
        state
            .regions
            .insert(region.name.clone(), MockRegion { region, dax });
    }

    /// Base address given to the next region that gets a size.
    pub fn set_next_base(&self, base: u64) {
        self.state.lock().next_base = base;
    }

    /// Makes `point` fail until the topology is dropped.
    pub fn fail_at(&self, point: FailPoint) {
        self.state.lock().fail.insert(point);
    }

    /// Journal of mutating calls, e.g. `"set_region_target region0 1 mem3"`.
    pub fn calls(&self) -> Vec<String> {
        self.state.lock().calls.clone()
    }

    fn call(&self, entry: String, point: FailPoint) -> Result<()> {
        let mut state = self.state.lock();
        state.calls.push(entry.clone());
        if state.fail.contains(&point) {
            return Err(MemError::Topology(format!("injected failure: {entry}")));
        }
        Ok(())
    }

    fn with_region<T>(&self, name: &str, f: impl FnOnce(&mut MockRegion) -> Result<T>) -> Result<T> {
        let mut state = self.state.lock();
        let region = state
            .regions
            .get_mut(name)
            .ok_or_else(|| MemError::NotFound(format!("region {name}")))?;
        f(region)
    }

    fn with_memdev<T>(&self, name: &str, f: impl FnOnce(&mut Memdev) -> T) -> Result<T> {
        let mut state = self.state.lock();
        let memdev = state
            .memdevs
            .iter_mut()
            .find(|m| m.name == name)
            .ok_or_else(|| MemError::NotFound(format!("memdev {name}")))?;
        Ok(f(memdev))
    }

    fn with_dax<T>(&self, dax: &str, f: impl FnOnce(&mut MockDax) -> T) -> Result<T> {
        let mut state = self.state.lock();
        let device = state
            .regions
            .values_mut()
            .filter_map(|r| r.dax.as_mut())
            .find(|d| d.name == dax)
            .ok_or_else(|| MemError::NotFound(format!("dax device {dax}")))?;
        Ok(f(device))
    }
}

impl Topology for MockTopology {
    fn memdevs(&self) -> Result<Vec<Memdev>> {
        Ok(self.state.lock().memdevs.clone())
    }

    fn regions(&self) -> Result<Vec<Region>> {
        let state = self.state.lock();
        Ok(state
            .regions
            .values()
            .map(|r| {
                let mut region = r.region.clone();
                region.mode = r.dax.as_ref().map_or(RegionMode::Other, |d| d.mode);
                region
            })
            .collect())
    }

    fn memdev_interleave_granularity(&self, memdev: &str) -> Result<u32> {
        self.with_memdev(memdev, |_| 4096)
    }

    fn create_ram_region(&self) -> Result<String> {
        self.call("create_ram_region".into(), FailPoint::CreateRegion)?;
        let mut state = self.state.lock();
        let id = state.next_region;
        state.next_region += 1;
        let name = format!("region{id}");
        let region = Region {
            name: name.clone(),
            id,
            base: INVALID_ADDRESS,
            size: 0,
            interleave_ways: 0,
            interleave_granularity: 0,
            enabled: false,
            committed: false,
            decoder_mode: DecoderMode::Ram,
            mode: RegionMode::Other,
            dax: None,
            targets: Vec::new(),
        };
        state
            .regions
            .insert(name.clone(), MockRegion { region, dax: None });
        Ok(name)
    }

    fn delete_region(&self, region: &str) -> Result<()> {
        self.call(format!("delete_region {region}"), FailPoint::DeleteRegion)?;
        let mut state = self.state.lock();
        match state.regions.get(region) {
            None => return Err(MemError::NotFound(format!("region {region}"))),
            Some(r) if r.region.enabled => {
                return Err(MemError::Topology(format!("{region} is still enabled")));
            }
            Some(_) => {}
        }
        state.regions.remove(region);
        for memdev in state.memdevs.iter_mut() {
            if memdev.region.as_deref() == Some(region) {
                memdev.region = None;
            }
        }
        Ok(())
    }

    fn set_interleave_ways(&self, region: &str, ways: u32) -> Result<()> {
        self.call(format!("set_interleave_ways {region} {ways}"), FailPoint::SetWays)?;
        self.with_region(region, |r| {
            r.region.interleave_ways = ways;
            r.region.targets = vec![None; ways as usize];
            Ok(())
        })
    }

    fn set_interleave_granularity(&self, region: &str, granularity: u32) -> Result<()> {
        self.call(
            format!("set_interleave_granularity {region} {granularity}"),
            FailPoint::SetGranularity,
        )?;
        self.with_region(region, |r| {
            r.region.interleave_granularity = granularity;
            Ok(())
        })
    }

    fn set_region_size(&self, region: &str, size: u64) -> Result<()> {
        self.call(format!("set_region_size {region} {size}"), FailPoint::SetRegionSize)?;
        let base = {
            let mut state = self.state.lock();
            let base = state.next_base;
            state.next_base = base.saturating_add(size);
            base
        };
        self.with_region(region, |r| {
            r.region.size = size;
            r.region.base = base;
            Ok(())
        })
    }

    fn set_decoder_mode(&self, memdev: &str, mode: DecoderMode) -> Result<()> {
        self.call(
            format!("set_decoder_mode {memdev} {mode}"),
            FailPoint::SetDecoderMode(memdev.to_string()),
        )?;
        self.with_memdev(memdev, |m| m.decoder_mode = mode)
    }

    fn set_decoder_dpa_size(&self, memdev: &str, size: u64) -> Result<()> {
        self.call(
            format!("set_decoder_dpa_size {memdev} {size}"),
            FailPoint::SetDpaSize(memdev.to_string()),
        )?;
        self.with_memdev(memdev, |_| ())
    }

    fn set_region_target(&self, region: &str, position: usize, memdev: &str) -> Result<()> {
        self.call(
            format!("set_region_target {region} {position} {memdev}"),
            FailPoint::SetTarget(position),
        )?;
        self.with_memdev(memdev, |m| m.region = Some(region.to_string()))?;
        self.with_region(region, |r| {
            let slot = r.region.targets.get_mut(position).ok_or_else(|| {
                MemError::Topology(format!("{region} has no target position {position}"))
            })?;
            *slot = Some(memdev.to_string());
            Ok(())
        })
    }

    fn commit_region(&self, region: &str) -> Result<()> {
        self.call(format!("commit_region {region}"), FailPoint::Commit)?;
        self.with_region(region, |r| {
            if r.region.targets.iter().any(Option::is_none) {
                return Err(MemError::Topology(format!("{region} has unbound targets")));
            }
            r.region.committed = true;
            Ok(())
        })
    }

    fn enable_region(&self, region: &str) -> Result<()> {
        self.call(format!("enable_region {region}"), FailPoint::EnableRegion)?;
        self.with_region(region, |r| {
            if !r.region.committed {
                return Err(MemError::Topology(format!("{region} is not committed")));
            }
            r.region.enabled = true;
            if r.dax.is_none() {
                let name = format!("dax{}.0", r.region.id);
                r.region.dax = Some(name.clone());
                r.dax = Some(MockDax {
                    name,
                    mode: RegionMode::Ram,
                });
            }
            Ok(())
        })
    }

    fn disable_region(&self, region: &str) -> Result<()> {
        self.call(format!("disable_region {region}"), FailPoint::DisableRegion)?;
        self.with_region(region, |r| {
            if !r.region.enabled {
                return Err(MemError::Topology(format!("{region} is not enabled")));
            }
            r.region.enabled = false;
            Ok(())
        })
    }

    fn dax_device(&self, region: &str) -> Result<DaxDevice> {
        self.with_region(region, |r| {
            let dax = r
                .dax
                .as_ref()
                .ok_or_else(|| MemError::NotFound(format!("dax device of {region}")))?;
            Ok(DaxDevice {
                name: dax.name.clone(),
                mode: dax.mode,
                enabled: dax.mode != RegionMode::Other,
            })
        })
    }

    fn disable_dax_device(&self, dax: &str) -> Result<()> {
        self.call(format!("disable_dax {dax}"), FailPoint::DisableDax)?;
        self.with_dax(dax, |d| d.mode = RegionMode::Other)
    }

    fn enable_devdax(&self, dax: &str) -> Result<()> {
        self.call(format!("enable_devdax {dax}"), FailPoint::EnableDevdax)?;
        self.with_dax(dax, |d| d.mode = RegionMode::Dax)
    }

    fn enable_system_ram(&self, dax: &str) -> Result<()> {
        self.call(format!("enable_system_ram {dax}"), FailPoint::EnableSystemRam)?;
        self.with_dax(dax, |d| d.mode = RegionMode::Ram)
    }
}
