// SPDX-FileCopyrightText: Copyright (c) 2024-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Immutable command values and their execution against a [`MemContext`].
//!
//! A front end parses its arguments into a [`Request`] once and hands it to
//! [`execute`]; nothing below this point reads global option state.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};

use crate::aggregate::SystemSummary;
use crate::context::MemContext;
use crate::policy::OnlinePolicy;
use crate::region::{BlockFilter, Region, RegionMode, region_of_block};
use crate::topology::Memdev;
use crate::transition::{BatchOutcome, Change};
use crate::{MemError, Result};

/// Which blocks a system-wide online/offline applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BlockTarget {
    /// Every block in the system.
    All,
    /// `count` blocks starting at id `start`.
    Range {
        /// First block id.
        start: u32,
        /// Number of consecutive ids.
        count: u32,
    },
}

/// Read-only queries.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[allow(missing_docs)]
pub enum Query {
    BlockSize,
    Policy,
    Blocks,
    BlockNode(u32),
    BlockOnline(u32),
    BlockPhysDevice(u32),
    BlockRemovable(u32),
    BlockState(u32),
    BlockZones(u32),
    /// Block count, system-wide or within `region`.
    NumBlocks {
        filter: BlockFilter,
        region: Option<String>,
    },
    /// Capacity in bytes, system-wide or within `region`.
    Capacity {
        filter: BlockFilter,
        region: Option<String>,
    },
    Memdevs,
    MemdevAvailable(String),
    MemdevGranularity(String),
    NumMemdevs,
    Regions,
    NumRegions,
    RegionEnabled(String),
    RegionBlockState { region: String, offset: i64 },
}

/// One administrative command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Request {
    /// System summary.
    Info,
    /// Per-block listing, optionally restricted to one region.
    List {
        /// Online/offline selection.
        filter: BlockFilter,
        /// Only blocks of this region.
        region: Option<String>,
    },
    /// A read-only query.
    Show(Query),
    /// Online blocks into ZONE_MOVABLE.
    BlockOnline(BlockTarget),
    /// Offline blocks.
    BlockOffline(BlockTarget),
    /// Move one block to a policy state.
    SetBlockState {
        /// Block id.
        id: u32,
        /// Target state.
        state: OnlinePolicy,
    },
    /// Move blocks of a region, addressed by offset, to a policy state.
    SetRegionBlockState {
        /// Region name.
        region: String,
        /// Offsets within the region; `None` selects every block.
        offsets: Option<Vec<i64>>,
        /// Target state.
        state: OnlinePolicy,
    },
    /// Set the policy for hot-added blocks.
    SetPolicy(OnlinePolicy),
    /// Create a RAM region over `memdevs`; an empty list selects every memdev.
    RegionCreate {
        /// Memdev names in target order.
        memdevs: Vec<String>,
        /// Interleave granularity; the configured default when absent.
        granularity: Option<u32>,
    },
    /// Offline, disable and delete a region.
    RegionDelete(String),
    /// Bind a region's driver.
    RegionEnable(String),
    /// Unbind a region's driver.
    RegionDisable(String),
    /// Rebind a region's DAX device.
    RegionMode {
        /// Region name.
        name: String,
        /// [`RegionMode::Ram`] or [`RegionMode::Dax`].
        mode: RegionMode,
    },
}

impl Request {
    /// True for requests that write to sysfs.
    pub fn is_mutating(&self) -> bool {
        !matches!(self, Request::Info | Request::List { .. } | Request::Show(_))
    }
}

/// One row of the block listing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[allow(missing_docs)]
pub struct BlockRow {
    pub id: u32,
    pub node: Option<u32>,
    pub online: bool,
    pub state: OnlinePolicy,
    pub zones: String,
    pub phys_device: u64,
    pub removable: bool,
    pub region: Option<String>,
}

/// A region with its block accounting.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegionRow {
    /// The region snapshot.
    #[serde(flatten)]
    pub region: Region,
    /// Blocks inside the region's address range.
    pub num_blocks: usize,
    /// Of those, blocks currently online.
    pub blocks_online: usize,
}

/// Result of [`execute`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
#[allow(missing_docs)]
pub enum Output {
    Summary(SystemSummary),
    Blocks(Vec<BlockRow>),
    Memdevs(Vec<Memdev>),
    Regions(Vec<RegionRow>),
    Region(Region),
    Batch(BatchOutcome),
    Change(Change),
    Flag(bool),
    Count(u64),
    Bytes(u64),
    Text(String),
    Done,
}

/// Runs `request` against `ctx`.
///
/// Mutating requests are refused with [`MemError::Permission`] when the
/// configuration requires root and the effective uid is not 0.
pub fn execute(ctx: &mut MemContext, request: &Request) -> Result<Output> {
    if request.is_mutating() && ctx.config().require_root {
        check_root()?;
    }
    tracing::debug!("executing {:?}", request);

    match request {
        Request::Info => Ok(Output::Summary(ctx.summary())),
        Request::List { filter, region } => list_blocks(ctx, *filter, region.as_deref()).map(Output::Blocks),
        Request::Show(query) => show(ctx, query),
        Request::BlockOnline(BlockTarget::All) => ctx.online_all().map(Output::Batch),
        Request::BlockOnline(BlockTarget::Range { start, count }) => {
            ctx.online_range(*start, *count).map(Output::Batch)
        }
        Request::BlockOffline(BlockTarget::All) => ctx.offline_all().map(Output::Batch),
        Request::BlockOffline(BlockTarget::Range { start, count }) => {
            ctx.offline_range(*start, *count).map(Output::Batch)
        }
        Request::SetBlockState { id, state } => ctx.set_block_state(*id, *state).map(Output::Change),
        Request::SetRegionBlockState {
            region,
            offsets,
            state,
        } => ctx
            .set_region_block_states(region, offsets.as_deref(), *state)
            .map(Output::Batch),
        Request::SetPolicy(policy) => ctx.set_policy(*policy).map(Output::Change),
        Request::RegionCreate {
            memdevs,
            granularity,
        } => {
            let memdevs = if memdevs.is_empty() {
                let all: Vec<String> = ctx.memdevs()?.into_iter().map(|m| m.name).collect();
                tracing::info!("no memdevs given, using all {}", all.len());
                all
            } else {
                memdevs.clone()
            };
            let granularity = granularity.unwrap_or(ctx.config().default_granularity);
            ctx.create_region(&memdevs, granularity).map(Output::Region)
        }
        Request::RegionDelete(name) => ctx.delete_region(name).map(|_| Output::Done),
        Request::RegionEnable(name) => ctx.enable_region(name).map(|_| Output::Done),
        Request::RegionDisable(name) => ctx.disable_region(name).map(|_| Output::Done),
        Request::RegionMode { name, mode } => ctx.switch_mode(name, *mode).map(Output::Change),
    }
}

fn check_root() -> Result<()> {
    if !nix::unistd::geteuid().is_root() {
        return Err(MemError::Permission(
            "this operation must be run as root".into(),
        ));
    }
    Ok(())
}

fn show(ctx: &MemContext, query: &Query) -> Result<Output> {
    Ok(match query {
        Query::BlockSize => Output::Bytes(ctx.block_size()?),
        Query::Policy => Output::Text(ctx.policy()?.to_string()),
        Query::Blocks => Output::Blocks(list_blocks(ctx, BlockFilter::All, None)?),
        Query::BlockNode(id) => match ctx.block(*id)?.node().index() {
            Some(node) => Output::Count(node.into()),
            None => Output::Text("-".into()),
        },
        Query::BlockOnline(id) => Output::Flag(ctx.block(*id)?.is_online()),
        Query::BlockPhysDevice(id) => Output::Count(ctx.block(*id)?.phys_device()),
        Query::BlockRemovable(id) => Output::Flag(ctx.block(*id)?.is_removable()),
        Query::BlockState(id) => Output::Text(ctx.block(*id)?.state().to_string()),
        Query::BlockZones(id) => Output::Text(ctx.block(*id)?.zones().to_string()),
        Query::NumBlocks { filter, region } => {
            let count = match region {
                Some(region) => ctx.region_num_blocks(region, *filter)?,
                None => ctx.num_blocks(*filter)?,
            };
            Output::Count(count as u64)
        }
        Query::Capacity { filter, region } => Output::Bytes(match region {
            Some(region) => ctx.region_capacity(region, *filter)?,
            None => ctx.capacity(*filter)?,
        }),
        Query::Memdevs => Output::Memdevs(ctx.memdevs()?),
        Query::MemdevAvailable(name) => Output::Flag(ctx.memdev_is_available(name)?),
        Query::MemdevGranularity(name) => {
            Output::Count(ctx.memdev_interleave_granularity(name)?.into())
        }
        Query::NumMemdevs => Output::Count(ctx.num_memdevs()? as u64),
        Query::Regions => Output::Regions(region_rows(ctx)?),
        Query::NumRegions => Output::Count(ctx.num_regions()? as u64),
        Query::RegionEnabled(name) => Output::Flag(ctx.region_is_enabled(name)?),
        Query::RegionBlockState { region, offset } => {
            Output::Text(ctx.block_state_at_offset(region, *offset)?.to_string())
        }
    })
}

fn list_blocks(ctx: &MemContext, filter: BlockFilter, region: Option<&str>) -> Result<Vec<BlockRow>> {
    let members: Option<HashSet<u32>> = match region {
        Some(name) => Some(ctx.blocks_of_region(name)?.into_iter().collect()),
        None => None,
    };
    // an unreadable block size or region list shows no region for any row
    let block_size = ctx.block_size().ok();
    let regions = ctx.regions().ok();

    let mut rows = Vec::new();
    for block in ctx.enumerate_blocks()?.iter() {
        if !filter.matches(block) {
            continue;
        }
        if members.as_ref().is_some_and(|ids| !ids.contains(&block.id())) {
            continue;
        }
        let region = block_size
            .zip(regions)
            .and_then(|(block_size, regions)| region_of_block(regions, block, block_size))
            .map(|r| r.name.clone());
        rows.push(BlockRow {
            id: block.id(),
            node: block.node().index(),
            online: block.is_online(),
            state: block.state(),
            zones: block.zones().to_string(),
            phys_device: block.phys_device(),
            removable: block.is_removable(),
            region,
        });
    }
    Ok(rows)
}

fn region_rows(ctx: &MemContext) -> Result<Vec<RegionRow>> {
    ctx.regions()?
        .iter()
        .map(|region| {
            let (num_blocks, blocks_online) = match region.span() {
                Ok(Some(_)) => (
                    ctx.count_in_range(&region.name, BlockFilter::All)?,
                    ctx.count_in_range(&region.name, BlockFilter::Online)?,
                ),
                _ => (0, 0),
            };
            Ok(RegionRow {
                region: region.clone(),
                num_blocks,
                blocks_online,
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::ZoneMask;
    use crate::testing::{FakeMemory, MockTopology, context, region, test_config};

    const BS: u64 = 256 << 20;

    fn setup() -> (FakeMemory, MockTopology, MemContext) {
        let memory = FakeMemory::with_block_size(BS);
        memory.add_blocks(0..4, true, ZoneMask::NORMAL);
        memory.add_blocks(4..8, false, ZoneMask::NORMAL | ZoneMask::MOVABLE);
        let topology = MockTopology::new();
        topology.add_region(region("region0", 6 * BS, 2 * BS));
        let ctx = context(memory.clone(), topology.clone());
        (memory, topology, ctx)
    }

    #[test]
    fn test_mutating_classification() {
        assert!(!Request::Info.is_mutating());
        assert!(!Request::Show(Query::Policy).is_mutating());
        assert!(Request::SetPolicy(OnlinePolicy::Movable).is_mutating());
        assert!(Request::RegionDelete("region0".into()).is_mutating());
    }

    #[test]
    fn test_list_filters_by_region_and_state() {
        let (_, _, mut ctx) = setup();

        let Output::Blocks(rows) = execute(
            &mut ctx,
            &Request::List {
                filter: BlockFilter::Offline,
                region: None,
            },
        )
        .unwrap() else {
            panic!("expected blocks");
        };
        assert_eq!(rows.iter().map(|r| r.id).collect::<Vec<_>>(), vec![4, 5, 6, 7]);
        assert_eq!(rows[2].region.as_deref(), Some("region0"));
        assert_eq!(rows[0].region, None);

        let Output::Blocks(rows) = execute(
            &mut ctx,
            &Request::List {
                filter: BlockFilter::All,
                region: Some("region0".into()),
            },
        )
        .unwrap() else {
            panic!("expected blocks");
        };
        assert_eq!(rows.iter().map(|r| r.id).collect::<Vec<_>>(), vec![6, 7]);
    }

    #[test]
    fn test_list_reads_block_size_once() {
        let (memory, _, mut ctx) = setup();
        let before = memory.global_reads();

        let Output::Blocks(rows) = execute(&mut ctx, &Request::Show(Query::Blocks)).unwrap() else {
            panic!("expected blocks");
        };
        assert_eq!(rows.len(), 8);
        assert_eq!(memory.global_reads() - before, 1);
        let in_region: Vec<u32> = rows
            .iter()
            .filter(|r| r.region.is_some())
            .map(|r| r.id)
            .collect();
        assert_eq!(in_region, vec![6, 7]);
    }

    #[test]
    fn test_show_region_counts() {
        let (_, _, mut ctx) = setup();
        let query = Request::Show(Query::Capacity {
            filter: BlockFilter::All,
            region: Some("region0".into()),
        });
        assert_eq!(execute(&mut ctx, &query).unwrap(), Output::Bytes(2 * BS));

        let Output::Regions(rows) = execute(&mut ctx, &Request::Show(Query::Regions)).unwrap() else {
            panic!("expected regions");
        };
        assert_eq!(rows[0].num_blocks, 2);
        assert_eq!(rows[0].blocks_online, 0);
    }

    #[test]
    fn test_region_block_state_offsets() {
        let (memory, _, mut ctx) = setup();
        let request = Request::SetRegionBlockState {
            region: "region0".into(),
            offsets: Some(vec![1]),
            state: OnlinePolicy::Movable,
        };
        let Output::Batch(outcome) = execute(&mut ctx, &request).unwrap() else {
            panic!("expected batch");
        };
        assert_eq!(outcome.changed, vec![7]);
        assert!(memory.is_online(7));
        assert!(!memory.is_online(6));

        let state = Request::Show(Query::RegionBlockState {
            region: "region0".into(),
            offset: 1,
        });
        assert_eq!(
            execute(&mut ctx, &state).unwrap(),
            Output::Text("online_movable".into())
        );
    }

    #[test]
    fn test_create_without_memdevs_uses_all() {
        let memory = FakeMemory::with_block_size(BS);
        let topology = MockTopology::new();
        topology.add_memdev("mem1", 1 << 30);
        topology.add_memdev("mem0", 2 << 30);
        let mut ctx = context(memory, topology.clone());

        let request = Request::RegionCreate {
            memdevs: Vec::new(),
            granularity: None,
        };
        let Output::Region(created) = execute(&mut ctx, &request).unwrap() else {
            panic!("expected region");
        };
        assert_eq!(created.interleave_ways, 2);
        assert_eq!(created.size, 3 << 30);
        assert_eq!(
            created.targets,
            vec![Some("mem0".to_string()), Some("mem1".to_string())]
        );
        assert!(
            topology
                .calls()
                .contains(&"set_interleave_granularity region0 4096".to_string())
        );
    }

    #[test]
    fn test_mutation_requires_root_when_configured() {
        let memory = FakeMemory::with_block_size(BS);
        memory.add_block(0, false, ZoneMask::MOVABLE);
        let config = crate::MemConfig {
            require_root: true,
            ..test_config()
        };
        let mut ctx = MemContext::with_backends(config, memory.clone(), MockTopology::new());

        let request = Request::SetBlockState {
            id: 0,
            state: OnlinePolicy::Movable,
        };
        let result = execute(&mut ctx, &request);
        if nix::unistd::geteuid().is_root() {
            assert_eq!(result.unwrap(), Output::Change(Change::Applied));
        } else {
            assert!(matches!(result, Err(MemError::Permission(_))));
            assert_eq!(memory.block_writes(), 0);
        }

        // reads never need root
        assert!(execute(&mut ctx, &Request::Show(Query::BlockSize)).is_ok());
    }
}
