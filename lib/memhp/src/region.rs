// SPDX-FileCopyrightText: Copyright (c) 2024-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Region snapshots and block-to-region address mapping.
//!
//! A block belongs to a region when its physical base address
//! `id × block_size` falls in `[base, base + size)`. Regions never overlap, so
//! a block belongs to at most one region.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::block::{BlockSet, MemoryBlock};
use crate::context::MemContext;
use crate::policy::OnlinePolicy;
use crate::topology::DecoderMode;
use crate::{AddressRange, MemError, Result};

/// Resource value the kernel reports for a region without an address.
pub const INVALID_ADDRESS: u64 = u64::MAX;

/// How a region's memory is exposed to the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RegionMode {
    /// Onlined as zoned system RAM.
    Ram,
    /// Exposed as a raw byte-addressable DAX device.
    Dax,
    /// No DAX device, or one without a driver bound.
    #[default]
    Other,
}

impl RegionMode {
    /// Short name used in listings.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Ram => "ram",
            Self::Dax => "dax",
            Self::Other => "-",
        }
    }
}

impl fmt::Display for RegionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Snapshot of a CXL region.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Region {
    /// Device name, e.g. `region0`. Mutating calls address the region by it.
    pub name: String,
    /// Numeric suffix of the name; region listings are sorted by it.
    pub id: u32,
    /// Physical base address, [`INVALID_ADDRESS`] if none is assigned.
    pub base: u64,
    /// Size in bytes.
    pub size: u64,
    /// Number of devices the region stripes across.
    pub interleave_ways: u32,
    /// Stripe unit in bytes.
    pub interleave_granularity: u32,
    /// Whether the region driver is bound.
    pub enabled: bool,
    /// Whether the decode configuration is committed.
    pub committed: bool,
    /// Decoder mode the region was created in.
    pub decoder_mode: DecoderMode,
    /// Exposure mode of the backing DAX device.
    pub mode: RegionMode,
    /// Name of the backing DAX device.
    pub dax: Option<String>,
    /// Memdev bound at each interleave position.
    pub targets: Vec<Option<String>>,
}

impl Region {
    /// The address range covered by the region.
    ///
    /// Fails with [`MemError::Config`] when the base is unassigned (`0` or
    /// [`INVALID_ADDRESS`]). A zero-sized region yields `None` and a warning.
    pub fn span(&self) -> Result<Option<AddressRange>> {
        if self.base == 0 || self.base == INVALID_ADDRESS {
            return Err(MemError::Config(format!(
                "region {} has no valid resource address",
                self.name
            )));
        }
        if self.size == 0 {
            tracing::warn!("region {} has zero size", self.name);
            return Ok(None);
        }
        Ok(Some(AddressRange::new(self.base, self.size)))
    }

    /// True if the region's memory is onlined as system RAM.
    pub fn is_ram_mode(&self) -> bool {
        self.mode == RegionMode::Ram
    }

    /// True if the region is exposed as a raw DAX device.
    pub fn is_dax_mode(&self) -> bool {
        self.mode == RegionMode::Dax
    }
}

/// Block selection for counts and capacities, keyed on the raw online flag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BlockFilter {
    /// Every block.
    #[default]
    All,
    /// Blocks whose `online` attribute is non-zero.
    Online,
    /// Blocks whose `online` attribute is zero.
    Offline,
}

impl BlockFilter {
    /// Filter from a pair of mutually exclusive `--online`/`--offline` flags.
    pub fn from_flags(online: bool, offline: bool) -> Self {
        match (online, offline) {
            (true, false) => Self::Online,
            (false, true) => Self::Offline,
            _ => Self::All,
        }
    }

    /// Returns true if `block` passes the filter.
    pub fn matches(&self, block: &MemoryBlock) -> bool {
        match self {
            Self::All => true,
            Self::Online => block.is_online(),
            Self::Offline => !block.is_online(),
        }
    }
}

pub(crate) fn check_block_size(block_size: u64) -> Result<u64> {
    if block_size == 0 {
        return Err(MemError::Config("memory block size is zero".into()));
    }
    Ok(block_size)
}

/// Ids of the blocks inside `region`, ascending.
pub fn blocks_of_region(blocks: &BlockSet, region: &Region, block_size: u64) -> Result<Vec<u32>> {
    Ok(region_blocks(blocks, region, block_size)?
        .map(|b| b.id())
        .collect())
}

/// Number of blocks inside `region` that pass `filter`.
pub fn count_in_range(
    blocks: &BlockSet,
    region: &Region,
    block_size: u64,
    filter: BlockFilter,
) -> Result<usize> {
    Ok(region_blocks(blocks, region, block_size)?
        .filter(|b| filter.matches(b))
        .count())
}

/// Blocks inside `region`, ascending by id.
pub(crate) fn region_blocks<'a>(
    blocks: &'a BlockSet,
    region: &Region,
    block_size: u64,
) -> Result<impl Iterator<Item = &'a MemoryBlock> + 'a> {
    let block_size = check_block_size(block_size)?;
    let span = region.span()?;
    Ok(blocks.iter().filter(move |b| match (span, b.phys_addr(block_size)) {
        (Some(span), Some(addr)) => span.contains(addr),
        _ => false,
    }))
}

/// The region containing `block`, or `None` for plain system RAM.
///
/// Regions without an assigned address cannot contain anything and are skipped.
pub fn region_of_block<'a>(
    regions: &'a [Region],
    block: &MemoryBlock,
    block_size: u64,
) -> Option<&'a Region> {
    let addr = block.phys_addr(block_size)?;
    regions.iter().find(|r| {
        let valid = r.base != 0 && r.base != INVALID_ADDRESS;
        valid && AddressRange::new(r.base, r.size).contains(addr)
    })
}

/// Resolves a block offset within `region` to a block id.
///
/// The target address is `base + block_size × offset`. Negative offsets and
/// addresses at or past the region end are [`MemError::Range`]; an address no
/// enumerated block starts at is [`MemError::NotFound`].
pub fn block_at_offset(
    blocks: &BlockSet,
    region: &Region,
    block_size: u64,
    offset: i64,
) -> Result<u32> {
    let block_size = check_block_size(block_size)?;
    if offset < 0 {
        return Err(MemError::Range(format!(
            "offset {offset} is negative"
        )));
    }
    if region.base == 0 || region.base == INVALID_ADDRESS {
        return Err(MemError::Config(format!(
            "region {} has no valid resource address",
            region.name
        )));
    }

    let end = AddressRange::new(region.base, region.size).end();
    let addr = block_size
        .checked_mul(offset as u64)
        .and_then(|delta| region.base.checked_add(delta))
        .filter(|&addr| addr < end)
        .ok_or_else(|| {
            MemError::Range(format!(
                "offset {offset} lies outside region {} ({} bytes)",
                region.name, region.size
            ))
        })?;

    Some(addr)
        .filter(|addr| addr % block_size == 0)
        .and_then(|addr| u32::try_from(addr / block_size).ok())
        .and_then(|id| blocks.get(id))
        .map(|b| b.id())
        .ok_or_else(|| {
            MemError::NotFound(format!(
                "no memory block at {addr:#x} (region {} offset {offset})",
                region.name
            ))
        })
}

impl MemContext {
    /// Ids of the blocks in the named region, ascending.
    pub fn blocks_of_region(&self, name: &str) -> Result<Vec<u32>> {
        let block_size = self.block_size()?;
        blocks_of_region(self.enumerate_blocks()?, self.region(name)?, block_size)
    }

    /// The region containing block `id`, `None` if it is plain system RAM.
    pub fn region_of_block(&self, id: u32) -> Result<Option<&Region>> {
        let block_size = self.block_size()?;
        let block = self.block(id)?;
        Ok(region_of_block(self.regions()?, block, block_size))
    }

    /// Number of blocks of the named region that pass `filter`.
    pub fn count_in_range(&self, name: &str, filter: BlockFilter) -> Result<usize> {
        let block_size = self.block_size()?;
        count_in_range(
            self.enumerate_blocks()?,
            self.region(name)?,
            block_size,
            filter,
        )
    }

    /// Id of the block at `offset` within the named region.
    pub fn block_at_offset(&self, name: &str, offset: i64) -> Result<u32> {
        let block_size = self.block_size()?;
        block_at_offset(
            self.enumerate_blocks()?,
            self.region(name)?,
            block_size,
            offset,
        )
    }

    /// Derived state of the block at `offset` within the named region.
    pub fn block_state_at_offset(&self, name: &str, offset: i64) -> Result<OnlinePolicy> {
        let id = self.block_at_offset(name, offset)?;
        Ok(self.block(id)?.state())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::numa::NumaNode;
    use crate::policy::{RawState, ZoneMask};
    use crate::testing::region;
    use rstest::rstest;

    const BS: u64 = 256 << 20;

    fn blocks(ids: impl IntoIterator<Item = u32>) -> BlockSet {
        BlockSet::from_blocks(
            ids.into_iter()
                .map(|id| {
                    MemoryBlock::new(
                        id,
                        NumaNode(0),
                        id % 2 == 0,
                        0,
                        true,
                        if id % 2 == 0 {
                            RawState::Online
                        } else {
                            RawState::Offline
                        },
                        ZoneMask::MOVABLE,
                    )
                })
                .collect(),
        )
    }

    #[test]
    fn test_blocks_of_region_exact_membership() {
        let set = blocks(0..64);
        let r = region("region0", 16 * BS, 10 * BS);
        let ids = blocks_of_region(&set, &r, BS).unwrap();
        assert_eq!(ids, (16..26).collect::<Vec<_>>());
    }

    #[test]
    fn test_blocks_of_region_ignores_gaps() {
        let set = blocks([1, 2, 5, 9, 12]);
        let r = region("region0", 2 * BS, 8 * BS);
        assert_eq!(blocks_of_region(&set, &r, BS).unwrap(), vec![2, 5, 9]);
    }

    #[test]
    fn test_partial_block_range() {
        // region end falls mid-block: only block starts inside the range count
        let set = blocks(0..8);
        let r = region("region0", 2 * BS, 2 * BS + 1);
        assert_eq!(blocks_of_region(&set, &r, BS).unwrap(), vec![2, 3, 4]);
    }

    #[rstest]
    #[case(0)]
    #[case(INVALID_ADDRESS)]
    fn test_invalid_base_is_config_error(#[case] base: u64) {
        let set = blocks(0..4);
        let r = region("region0", base, 4 * BS);
        assert!(matches!(
            blocks_of_region(&set, &r, BS),
            Err(MemError::Config(_))
        ));
    }

    #[test]
    fn test_zero_block_size_is_config_error() {
        let set = blocks(0..4);
        let r = region("region0", BS, 4 * BS);
        assert!(matches!(
            count_in_range(&set, &r, 0, BlockFilter::All),
            Err(MemError::Config(_))
        ));
    }

    #[test]
    fn test_zero_size_region_has_no_blocks() {
        let set = blocks(0..4);
        let r = region("region0", BS, 0);
        assert!(blocks_of_region(&set, &r, BS).unwrap().is_empty());
    }

    #[test]
    fn test_count_filters_on_online_flag() {
        let set = blocks(0..20);
        let r = region("region0", 4 * BS, 10 * BS);
        assert_eq!(count_in_range(&set, &r, BS, BlockFilter::All).unwrap(), 10);
        assert_eq!(count_in_range(&set, &r, BS, BlockFilter::Online).unwrap(), 5);
        assert_eq!(count_in_range(&set, &r, BS, BlockFilter::Offline).unwrap(), 5);
    }

    #[test]
    fn test_region_of_block() {
        let set = blocks(0..40);
        let regions = vec![
            region("region0", 8 * BS, 8 * BS),
            region("region1", 16 * BS, 8 * BS),
            region("region2", INVALID_ADDRESS, 8 * BS),
        ];
        let find = |id| {
            region_of_block(&regions, set.get(id).unwrap(), BS).map(|r| r.name.as_str())
        };
        assert_eq!(find(8), Some("region0"));
        assert_eq!(find(15), Some("region0"));
        assert_eq!(find(16), Some("region1"));
        assert_eq!(find(24), None);
        assert_eq!(find(0), None);
    }

    #[rstest]
    #[case(0, Ok(4))]
    #[case(3, Ok(7))]
    #[case(4, Err("range"))]
    #[case(-1, Err("range"))]
    fn test_block_at_offset(#[case] offset: i64, #[case] expected: std::result::Result<u32, &str>) {
        let set = blocks(0..16);
        let r = region("region0", 4 * BS, 4 * BS);
        let got = block_at_offset(&set, &r, BS, offset);
        match expected {
            Ok(id) => assert_eq!(got.unwrap(), id),
            Err(_) => assert!(matches!(got, Err(MemError::Range(_)))),
        }
    }

    #[test]
    fn test_block_at_offset_missing_block() {
        let set = blocks([4, 5, 7]);
        let r = region("region0", 4 * BS, 4 * BS);
        assert!(matches!(
            block_at_offset(&set, &r, BS, 2),
            Err(MemError::NotFound(_))
        ));
    }

    #[rstest]
    #[case::unaligned_base(4 * BS + BS / 2)]
    #[case::beyond_block_ids((u64::from(u32::MAX) + 1) * BS)]
    fn test_block_at_offset_without_a_block_start(#[case] base: u64) {
        let set = blocks(0..16);
        let r = region("region0", base, 4 * BS);
        assert!(matches!(
            block_at_offset(&set, &r, BS, 0),
            Err(MemError::NotFound(_))
        ));
    }

    #[test]
    fn test_filter_from_flags() {
        assert_eq!(BlockFilter::from_flags(true, false), BlockFilter::Online);
        assert_eq!(BlockFilter::from_flags(false, true), BlockFilter::Offline);
        assert_eq!(BlockFilter::from_flags(false, false), BlockFilter::All);
        assert_eq!(BlockFilter::from_flags(true, true), BlockFilter::All);
    }
}
