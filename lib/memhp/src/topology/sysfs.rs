// SPDX-FileCopyrightText: Copyright (c) 2024-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use super::{DaxDevice, DecoderMode, Memdev, Topology, device_id};
use crate::numa::NumaNode;
use crate::region::{INVALID_ADDRESS, Region, RegionMode};
use crate::sysfs::{link_name, read_attr, read_ulong, write_attr_verified};
use crate::{MemError, Result};

const KMEM_DRIVER: &str = "kmem";
const DEVDAX_DRIVER: &str = "device_dax";

/// [`Topology`] over `/sys/bus/cxl` and `/sys/bus/dax`.
///
/// Objects are located by name under `<cxl>/devices` and `<dax>/devices`; a
/// device counts as enabled when its `driver` link exists.
#[derive(Debug, Clone)]
pub struct SysfsTopology {
    cxl: PathBuf,
    dax: PathBuf,
}

impl SysfsTopology {
    /// Uses `cxl` and `dax` as the bus directories.
    pub fn new(cxl: impl Into<PathBuf>, dax: impl Into<PathBuf>) -> Self {
        Self {
            cxl: cxl.into(),
            dax: dax.into(),
        }
    }

    fn device(&self, name: &str) -> PathBuf {
        self.cxl.join("devices").join(name)
    }

    fn dax_device_dir(&self, name: &str) -> PathBuf {
        self.dax.join("devices").join(name)
    }

    /// Devices under `<cxl>/devices` named `<prefix><N>`, ascending by `N`.
    fn list(&self, prefix: &str) -> Result<Vec<(String, u32)>> {
        let dir = self.cxl.join("devices");
        let entries = fs::read_dir(&dir).map_err(|e| MemError::sysfs(&dir, e))?;
        let mut found: Vec<(String, u32)> = entries
            .flatten()
            .filter_map(|entry| {
                let name = entry.file_name().to_string_lossy().into_owned();
                device_id(&name, prefix).map(|id| (name, id))
            })
            .collect();
        found.sort_by_key(|(_, id)| *id);
        Ok(found)
    }

    fn region_dir(&self, region: &str) -> Result<PathBuf> {
        let path = self.device(region);
        if !path.exists() {
            return Err(MemError::NotFound(format!("region {region}")));
        }
        Ok(path)
    }

    /// Endpoint port id to the memdev behind it, from each endpoint's `uport` link.
    fn endpoint_memdevs(&self) -> Result<HashMap<u32, String>> {
        Ok(self
            .list("endpoint")?
            .into_iter()
            .filter_map(|(name, id)| {
                link_name(&self.device(&name).join("uport")).map(|memdev| (id, memdev))
            })
            .collect())
    }

    fn endpoint_of(&self, memdev: &str) -> Result<Option<(String, u32)>> {
        Ok(self
            .endpoint_memdevs()?
            .into_iter()
            .find(|(_, m)| m == memdev)
            .map(|(id, _)| (format!("endpoint{id}"), id)))
    }

    fn memdev_decoder(&self, memdev: &str) -> Result<PathBuf> {
        let (_, port) = self
            .endpoint_of(memdev)?
            .ok_or_else(|| MemError::Topology(format!("memdev {memdev} has no endpoint")))?;
        let decoder = self.device(&format!("decoder{port}.0"));
        if !decoder.exists() {
            return Err(MemError::Topology(format!(
                "endpoint{port} of {memdev} has no decoder"
            )));
        }
        Ok(decoder)
    }

    fn root_decoder(&self) -> Result<PathBuf> {
        let (_, port) = self
            .list("root")?
            .into_iter()
            .next()
            .ok_or_else(|| MemError::Topology("no CXL root port".into()))?;
        let decoder = self.device(&format!("decoder{port}.0"));
        if !decoder.exists() {
            return Err(MemError::Topology(format!("root{port} has no decoder")));
        }
        Ok(decoder)
    }

    fn is_bound(path: &Path) -> bool {
        path.join("driver").exists()
    }

    /// Reads the region's interleave targets, resolving decoders to memdevs.
    fn region_targets(&self, dir: &Path, ways: u32, endpoints: &HashMap<u32, String>) -> Vec<Option<String>> {
        (0..ways)
            .map(|position| {
                let decoder = read_attr(&dir.join(format!("target{position}"))).ok()?;
                let port = decoder
                    .strip_prefix("decoder")?
                    .split('.')
                    .next()?
                    .parse::<u32>()
                    .ok()?;
                endpoints.get(&port).cloned()
            })
            .collect()
    }

    fn region_dax_name(&self, region: &str) -> Option<String> {
        let id = device_id(region, "region")?;
        let dax_region = self.device(region).join(format!("dax_region{id}"));
        let mut names: Vec<String> = fs::read_dir(dax_region)
            .ok()?
            .flatten()
            .map(|e| e.file_name().to_string_lossy().into_owned())
            .filter(|name| name.starts_with("dax") && name.contains('.'))
            .collect();
        names.sort();
        names.into_iter().next()
    }

    fn dax_mode(&self, dax: &str) -> RegionMode {
        match link_name(&self.dax_device_dir(dax).join("driver")).as_deref() {
            Some(KMEM_DRIVER) => RegionMode::Ram,
            Some(DEVDAX_DRIVER) => RegionMode::Dax,
            _ => RegionMode::Other,
        }
    }

    fn load_region(&self, name: String, id: u32, endpoints: &HashMap<u32, String>) -> Region {
        let dir = self.device(&name);
        let ulong = |attr: &str| read_ulong(&dir.join(attr)).ok();

        let interleave_ways = ulong("interleave_ways").unwrap_or(0) as u32;
        let dax = self.region_dax_name(&name);
        Region {
            id,
            base: ulong("resource").unwrap_or(INVALID_ADDRESS),
            size: ulong("size").unwrap_or(0),
            interleave_ways,
            interleave_granularity: ulong("interleave_granularity").unwrap_or(0) as u32,
            enabled: Self::is_bound(&dir),
            committed: ulong("commit").unwrap_or(0) != 0,
            decoder_mode: read_attr(&dir.join("mode"))
                .ok()
                .and_then(|m| m.parse().ok())
                .unwrap_or(DecoderMode::Ram),
            mode: dax.as_deref().map_or(RegionMode::Other, |d| self.dax_mode(d)),
            targets: self.region_targets(&dir, interleave_ways, endpoints),
            dax,
            name,
        }
    }
}

impl Topology for SysfsTopology {
    fn memdevs(&self) -> Result<Vec<Memdev>> {
        let endpoints = self.endpoint_memdevs()?;
        let regions = self.regions()?;

        Ok(self
            .list("mem")?
            .into_iter()
            .map(|(name, id)| {
                let dir = self.device(&name);
                let host = fs::canonicalize(&dir)
                    .ok()
                    .and_then(|p| p.parent().and_then(|p| p.file_name()).map(|n| n.to_string_lossy().into_owned()))
                    .unwrap_or_else(|| "-".to_string());
                let node = read_attr(&dir.join("numa_node"))
                    .ok()
                    .and_then(|s| s.trim().parse::<i64>().ok())
                    .and_then(|n| u32::try_from(n).ok())
                    .map_or(NumaNode::UNKNOWN, NumaNode);

                let endpoint = endpoints
                    .iter()
                    .find(|(_, m)| **m == name)
                    .map(|(port, _)| *port);
                let decoder = endpoint
                    .map(|port| format!("decoder{port}.0"))
                    .filter(|d| self.device(d).exists());
                let decoder_mode = decoder
                    .as_ref()
                    .and_then(|d| read_attr(&self.device(d).join("mode")).ok())
                    .and_then(|m| m.parse().ok())
                    .unwrap_or_default();
                let region = regions
                    .iter()
                    .find(|r| r.targets.iter().flatten().any(|t| *t == name))
                    .map(|r| r.name.clone());

                Memdev {
                    ram_size: read_ulong(&dir.join("ram/size")).unwrap_or(0),
                    enabled: Self::is_bound(&dir),
                    host,
                    endpoint_enabled: endpoint
                        .is_some_and(|port| Self::is_bound(&self.device(&format!("endpoint{port}")))),
                    endpoint: endpoint.map(|port| format!("endpoint{port}")),
                    decoder,
                    decoder_mode,
                    region,
                    node,
                    firmware_version: read_attr(&dir.join("firmware_version")).ok(),
                    name,
                    id,
                }
            })
            .collect())
    }

    fn regions(&self) -> Result<Vec<Region>> {
        let endpoints = self.endpoint_memdevs()?;
        Ok(self
            .list("region")?
            .into_iter()
            .map(|(name, id)| self.load_region(name, id, &endpoints))
            .collect())
    }

    fn memdev_interleave_granularity(&self, memdev: &str) -> Result<u32> {
        let (endpoint, _) = self
            .endpoint_of(memdev)?
            .ok_or_else(|| MemError::Topology(format!("memdev {memdev} has no endpoint")))?;
        let path = fs::canonicalize(self.device(&endpoint))
            .map_err(|e| MemError::sysfs(self.device(&endpoint), e))?;

        // the host bridge port is the ancestor directly below the root port
        let port = path
            .ancestors()
            .find(|p| {
                p.parent()
                    .and_then(|parent| parent.file_name())
                    .is_some_and(|n| n.to_string_lossy().starts_with("root"))
            })
            .and_then(|p| p.file_name())
            .and_then(|n| device_id(&n.to_string_lossy(), "port"))
            .ok_or_else(|| {
                MemError::Topology(format!("no host bridge port above {endpoint}"))
            })?;

        let granularity = read_ulong(&self.device(&format!("decoder{port}.0")).join("interleave_granularity"))?;
        Ok(granularity as u32)
    }

    fn create_ram_region(&self) -> Result<String> {
        let attr = self.root_decoder()?.join("create_ram_region");
        let name = read_attr(&attr)?.trim().to_string();
        if name.is_empty() {
            return Err(MemError::Topology("root decoder offered no region name".into()));
        }
        write_attr_verified(&attr, &name)?;
        Ok(name)
    }

    fn delete_region(&self, region: &str) -> Result<()> {
        let dir = self.region_dir(region)?;
        // a region lives under the root decoder that created it
        let decoder = fs::canonicalize(&dir)
            .ok()
            .and_then(|p| p.parent().map(Path::to_path_buf))
            .filter(|p| {
                p.file_name()
                    .is_some_and(|n| n.to_string_lossy().starts_with("decoder"))
            });
        let decoder = match decoder {
            Some(decoder) => decoder,
            None => self.root_decoder()?,
        };
        write_attr_verified(&decoder.join("delete_region"), region)
    }

    fn set_interleave_ways(&self, region: &str, ways: u32) -> Result<()> {
        write_attr_verified(&self.region_dir(region)?.join("interleave_ways"), &ways.to_string())
    }

    fn set_interleave_granularity(&self, region: &str, granularity: u32) -> Result<()> {
        write_attr_verified(
            &self.region_dir(region)?.join("interleave_granularity"),
            &granularity.to_string(),
        )
    }

    fn set_region_size(&self, region: &str, size: u64) -> Result<()> {
        write_attr_verified(&self.region_dir(region)?.join("size"), &format!("{size:#x}"))
    }

    fn set_decoder_mode(&self, memdev: &str, mode: DecoderMode) -> Result<()> {
        write_attr_verified(&self.memdev_decoder(memdev)?.join("mode"), mode.as_str())
    }

    fn set_decoder_dpa_size(&self, memdev: &str, size: u64) -> Result<()> {
        write_attr_verified(
            &self.memdev_decoder(memdev)?.join("dpa_size"),
            &format!("{size:#x}"),
        )
    }

    fn set_region_target(&self, region: &str, position: usize, memdev: &str) -> Result<()> {
        let decoder = self.memdev_decoder(memdev)?;
        let decoder_name = decoder
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .ok_or_else(|| MemError::Topology(format!("bad decoder path for {memdev}")))?;
        write_attr_verified(
            &self.region_dir(region)?.join(format!("target{position}")),
            &decoder_name,
        )
    }

    fn commit_region(&self, region: &str) -> Result<()> {
        write_attr_verified(&self.region_dir(region)?.join("commit"), "1")
    }

    fn enable_region(&self, region: &str) -> Result<()> {
        self.region_dir(region)?;
        write_attr_verified(&self.cxl.join("drivers/cxl_region/bind"), region)
    }

    fn disable_region(&self, region: &str) -> Result<()> {
        self.region_dir(region)?;
        write_attr_verified(&self.cxl.join("drivers/cxl_region/unbind"), region)
    }

    fn dax_device(&self, region: &str) -> Result<DaxDevice> {
        self.region_dir(region)?;
        let name = self
            .region_dax_name(region)
            .ok_or_else(|| MemError::NotFound(format!("dax device of {region}")))?;
        let mode = self.dax_mode(&name);
        let enabled = Self::is_bound(&self.dax_device_dir(&name));
        Ok(DaxDevice {
            name,
            mode,
            enabled,
        })
    }

    fn disable_dax_device(&self, dax: &str) -> Result<()> {
        let Some(driver) = link_name(&self.dax_device_dir(dax).join("driver")) else {
            tracing::debug!("{} has no driver bound", dax);
            return Ok(());
        };
        write_attr_verified(&self.dax.join("drivers").join(driver).join("unbind"), dax)
    }

    fn enable_devdax(&self, dax: &str) -> Result<()> {
        write_attr_verified(&self.dax.join("drivers").join(DEVDAX_DRIVER).join("bind"), dax)
    }

    fn enable_system_ram(&self, dax: &str) -> Result<()> {
        write_attr_verified(&self.dax.join("drivers").join(KMEM_DRIVER).join("bind"), dax)
    }
}
