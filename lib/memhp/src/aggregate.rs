// SPDX-FileCopyrightText: Copyright (c) 2024-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! System and region aggregates.
//!
//! Counts and capacities are recomputed from the cached block collection on
//! every call and the block size is re-read each time; nothing here is cached
//! on its own.

use serde::{Deserialize, Serialize};

use crate::block::GlobalAttr;
use crate::context::MemContext;
use crate::policy::OnlinePolicy;
use crate::region::{BlockFilter, check_block_size, count_in_range};
use crate::transition::Change;
use crate::{MemError, Result, sysfs};

impl MemContext {
    /// Memory block size in bytes, read from `block_size_bytes`.
    pub fn block_size(&self) -> Result<u64> {
        let raw = self.memory().read_global(GlobalAttr::BlockSizeBytes)?;
        check_block_size(sysfs::parse_hex(&raw))
    }

    /// Ids of all blocks, ascending.
    pub fn system_blocks(&self) -> Result<Vec<u32>> {
        Ok(self.enumerate_blocks()?.ids())
    }

    /// Number of blocks passing `filter`.
    pub fn num_blocks(&self, filter: BlockFilter) -> Result<usize> {
        Ok(self
            .enumerate_blocks()?
            .iter()
            .filter(|b| filter.matches(b))
            .count())
    }

    /// Bytes of memory in blocks passing `filter`.
    pub fn capacity(&self, filter: BlockFilter) -> Result<u64> {
        let block_size = self.block_size()?;
        bytes_of(block_size, self.num_blocks(filter)? as u64)
    }

    /// Number of blocks of the named region passing `filter`.
    pub fn region_num_blocks(&self, name: &str, filter: BlockFilter) -> Result<usize> {
        self.count_in_range(name, filter)
    }

    /// Bytes of memory in blocks of the named region passing `filter`.
    pub fn region_capacity(&self, name: &str, filter: BlockFilter) -> Result<u64> {
        let block_size = self.block_size()?;
        let count = count_in_range(
            self.enumerate_blocks()?,
            self.region(name)?,
            block_size,
            filter,
        )?;
        bytes_of(block_size, count as u64)
    }

    /// Current auto-online policy.
    pub fn policy(&self) -> Result<OnlinePolicy> {
        let raw = self.memory().read_global(GlobalAttr::AutoOnlineBlocks)?;
        raw.trim().parse()
    }

    /// Sets the auto-online policy. Setting the current policy is a no-op.
    pub fn set_policy(&self, policy: OnlinePolicy) -> Result<Change> {
        if self.policy()? == policy {
            tracing::info!("online policy already {}, skipping", policy);
            return Ok(Change::Unchanged);
        }

        let memory = self.memory();
        let value = policy.as_str();
        let written = memory.write_global(GlobalAttr::AutoOnlineBlocks, value)?;
        sysfs::verify_written(&memory.global_path(GlobalAttr::AutoOnlineBlocks), value, written)
            .inspect_err(|e| tracing::error!("failed to set online policy: {}", e))?;
        tracing::info!("set online policy to {}", policy);
        Ok(Change::Applied)
    }

    /// Number of regions.
    pub fn num_regions(&self) -> Result<usize> {
        Ok(self.regions()?.len())
    }

    /// Number of memdevs.
    pub fn num_memdevs(&self) -> Result<usize> {
        Ok(self.memdevs()?.len())
    }

    /// Whether the named region's driver is bound.
    pub fn region_is_enabled(&self, name: &str) -> Result<bool> {
        Ok(self.region(name)?.enabled)
    }

    /// Snapshot of the system-wide figures; see [`SystemSummary`].
    pub fn summary(&self) -> SystemSummary {
        let block_size = sentinel("block size", self.block_size());
        let count = |filter| sentinel("block count", self.num_blocks(filter)) as u64;
        let (total, online, offline) = (
            count(BlockFilter::All),
            count(BlockFilter::Online),
            count(BlockFilter::Offline),
        );
        let bytes = |count| sentinel("capacity", bytes_of(block_size, count));

        SystemSummary {
            block_size,
            policy: self
                .policy()
                .inspect_err(|e| tracing::error!("failed to read online policy: {}", e))
                .ok(),
            num_blocks: total,
            num_blocks_online: online,
            num_blocks_offline: offline,
            capacity: bytes(total),
            capacity_online: bytes(online),
            capacity_offline: bytes(offline),
            num_regions: sentinel("region count", self.num_regions()),
            num_memdevs: sentinel("memdev count", self.num_memdevs()),
        }
    }
}

fn bytes_of(block_size: u64, count: u64) -> Result<u64> {
    block_size.checked_mul(count).ok_or_else(|| {
        MemError::Config(format!(
            "{count} blocks of {block_size:#x} bytes overflow a byte count"
        ))
    })
}

fn sentinel<T: Default>(what: &str, value: Result<T>) -> T {
    value
        .inspect_err(|e| tracing::error!("failed to read {}: {}", what, e))
        .unwrap_or_default()
}

/// System-wide figures for the `info` view.
///
/// Every field that cannot be determined holds `0` (or `None` for the
/// policy); the cause is logged.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[allow(missing_docs)]
pub struct SystemSummary {
    pub block_size: u64,
    pub policy: Option<OnlinePolicy>,
    pub num_blocks: u64,
    pub num_blocks_online: u64,
    pub num_blocks_offline: u64,
    pub capacity: u64,
    pub capacity_online: u64,
    pub capacity_offline: u64,
    pub num_regions: usize,
    pub num_memdevs: usize,
}

const UNITS: [char; 5] = [' ', 'K', 'M', 'G', 'T'];

/// Formats a byte count with two decimals and a binary unit, e.g. `256.00 M`.
///
/// Values up to 1024 are printed without a unit.
pub fn format_bytes(bytes: u64) -> String {
    let mut value = bytes as f64;
    let mut unit = 0;
    while value > 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{value:.2}")
    } else {
        format!("{value:.2} {}", UNITS[unit])
    }
}

/// Parses an [`OnlinePolicy`], mapping failures to [`MemError::InvalidArgument`].
pub fn parse_policy(s: &str) -> Result<OnlinePolicy> {
    s.parse().map_err(|_| {
        MemError::InvalidArgument(format!(
            "{s:?} is not one of offline, online, online_kernel, online_movable"
        ))
    })
}
