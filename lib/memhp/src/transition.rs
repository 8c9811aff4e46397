// SPDX-FileCopyrightText: Copyright (c) 2024-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Block state transitions.
//!
//! Single-block operations check the block's derived state, write one
//! attribute and verify the kernel consumed exactly `value.len() + 1` bytes.
//! On success the block's `online`, `state` and `valid_zones` are re-read.
//!
//! Batch operations visit targets in ascending order and never stop early: a
//! failing block is recorded and the batch moves on. A batch with any failure
//! returns [`MemError::PartialFailure`]; nothing is rolled back.

use serde::{Deserialize, Serialize};

use crate::block::scan::refresh_block;
use crate::block::{BlockAttr, BlockDirectory, MemoryBlock};
use crate::context::MemContext;
use crate::policy::{OnlinePolicy, RawState, ZoneMask};
use crate::region::blocks_of_region;
use crate::{MemError, Result, sysfs};

/// Whether an operation changed anything.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Change {
    /// The kernel accepted a write.
    Applied,
    /// The target was already in the requested state.
    Unchanged,
}

/// Onlines an offline block into ZONE_MOVABLE.
///
/// No-op if the block is already movable; [`MemError::Precondition`] if it is
/// online in any other zone.
pub fn online(dir: &dyn BlockDirectory, block: &mut MemoryBlock) -> Result<Change> {
    let current = block.state();
    tracing::debug!("memory{}: online requested, current state {}", block.id, current);
    if current == OnlinePolicy::Movable {
        tracing::info!("memory{} already {}, skipping", block.id, current);
        return Ok(Change::Unchanged);
    }
    if current != OnlinePolicy::Offline {
        return Err(MemError::Precondition(format!(
            "memory{} is {}, not offline",
            block.id, current
        )));
    }

    store(dir, block, BlockAttr::State, OnlinePolicy::Movable.as_str())?;
    expect_state(block, OnlinePolicy::Movable);
    refresh_block(dir, block);
    tracing::info!("onlined memory{}", block.id);
    Ok(Change::Applied)
}

/// Offlines a block. No-op if it is already offline.
pub fn offline(dir: &dyn BlockDirectory, block: &mut MemoryBlock) -> Result<Change> {
    let current = block.state();
    tracing::debug!("memory{}: offline requested, current state {}", block.id, current);
    if current == OnlinePolicy::Offline {
        tracing::info!("memory{} already offline, skipping", block.id);
        return Ok(Change::Unchanged);
    }

    store(dir, block, BlockAttr::Online, "0")?;
    expect_state(block, OnlinePolicy::Offline);
    refresh_block(dir, block);
    tracing::info!("offlined memory{}", block.id);
    Ok(Change::Applied)
}

/// Moves a block to `target`.
///
/// Any transition other than to or from offline must pass through offline
/// first and fails with [`MemError::Precondition`].
pub fn set_state(
    dir: &dyn BlockDirectory,
    block: &mut MemoryBlock,
    target: OnlinePolicy,
) -> Result<Change> {
    let current = block.state();
    tracing::debug!("memory{}: {} requested, current state {}", block.id, target, current);
    if current == target {
        tracing::info!("memory{} already {}, skipping", block.id, target);
        return Ok(Change::Unchanged);
    }
    if target != OnlinePolicy::Offline && current != OnlinePolicy::Offline {
        return Err(MemError::Precondition(format!(
            "memory{} is {}; offline it before setting {}",
            block.id, current, target
        )));
    }

    store(dir, block, BlockAttr::State, target.as_str())?;
    expect_state(block, target);
    refresh_block(dir, block);
    tracing::info!("set memory{} to {}", block.id, target);
    Ok(Change::Applied)
}

fn store(dir: &dyn BlockDirectory, block: &MemoryBlock, attr: BlockAttr, value: &str) -> Result<()> {
    let written = dir.write(block.id, attr, value)?;
    sysfs::verify_written(&dir.block_path(block.id, attr), value, written)
}

// Cached values assumed after an accepted write; a readable re-read replaces them.
fn expect_state(block: &mut MemoryBlock, state: OnlinePolicy) {
    match state {
        OnlinePolicy::Offline => {
            block.online = false;
            block.raw_state = RawState::Offline;
        }
        OnlinePolicy::Online => {
            block.online = true;
            block.raw_state = RawState::Online;
        }
        OnlinePolicy::Kernel => {
            block.online = true;
            block.raw_state = RawState::Online;
            block.zones = ZoneMask::NORMAL;
        }
        OnlinePolicy::Movable => {
            block.online = true;
            block.raw_state = RawState::Online;
            block.zones = ZoneMask::MOVABLE;
        }
    }
}

/// A member of a batch that failed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchFailure {
    /// What was being changed, e.g. `memory12` or `region0 offset 3`.
    pub target: String,
    /// Rendered error.
    pub error: String,
}

/// Accounting of a batch operation.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchOutcome {
    /// Name of the batch, used in logs and errors.
    pub operation: String,
    /// Targets visited.
    pub attempted: usize,
    /// Blocks the kernel accepted a write for.
    pub changed: Vec<u32>,
    /// Blocks already in the requested state.
    pub unchanged: Vec<u32>,
    /// Targets that failed, in visit order.
    pub failures: Vec<BatchFailure>,
}

impl BatchOutcome {
    fn new(operation: impl Into<String>) -> Self {
        Self {
            operation: operation.into(),
            ..Default::default()
        }
    }

    fn fail(&mut self, target: String, error: &MemError) {
        tracing::error!("{}: {} failed: {}", self.operation, target, error);
        self.failures.push(BatchFailure {
            target,
            error: error.to_string(),
        });
    }

    /// Returns true if no target failed.
    pub fn is_success(&self) -> bool {
        self.failures.is_empty()
    }

    /// `Ok(self)` when every target succeeded, [`MemError::PartialFailure`] otherwise.
    pub fn into_result(self) -> Result<Self> {
        if self.is_success() {
            tracing::info!(
                "{}: {} changed, {} unchanged",
                self.operation,
                self.changed.len(),
                self.unchanged.len()
            );
            Ok(self)
        } else {
            Err(MemError::PartialFailure(Box::new(self)))
        }
    }
}

type BlockOp = fn(&dyn BlockDirectory, &mut MemoryBlock) -> Result<Change>;

impl MemContext {
    /// Onlines block `id` into ZONE_MOVABLE.
    pub fn online_block(&mut self, id: u32) -> Result<Change> {
        let (dir, block) = self.block_mut(id)?;
        online(dir, block)
    }

    /// Offlines block `id`.
    pub fn offline_block(&mut self, id: u32) -> Result<Change> {
        let (dir, block) = self.block_mut(id)?;
        offline(dir, block)
    }

    /// Moves block `id` to `state`.
    pub fn set_block_state(&mut self, id: u32, state: OnlinePolicy) -> Result<Change> {
        let (dir, block) = self.block_mut(id)?;
        set_state(dir, block, state)
    }

    /// Moves the block at `offset` within the named region to `state`.
    pub fn set_block_state_at_offset(
        &mut self,
        region: &str,
        offset: i64,
        state: OnlinePolicy,
    ) -> Result<Change> {
        let id = self.block_at_offset(region, offset)?;
        self.set_block_state(id, state)
    }

    /// Onlines every offline block.
    pub fn online_all(&mut self) -> Result<BatchOutcome> {
        let ids = self.enumerate_blocks()?.ids();
        self.run_batch(BatchOutcome::new("online all"), ids, true, online)
    }

    /// Offlines every online block.
    pub fn offline_all(&mut self) -> Result<BatchOutcome> {
        let ids = self.enumerate_blocks()?.ids();
        self.run_batch(BatchOutcome::new("offline all"), ids, false, offline)
    }

    /// Onlines blocks `start..start + count`, skipping those already online.
    pub fn online_range(&mut self, start: u32, count: u32) -> Result<BatchOutcome> {
        let ids = (start..start.saturating_add(count)).collect();
        let label = format!("online blocks {start}+{count}");
        self.run_batch(BatchOutcome::new(label), ids, true, online)
    }

    /// Offlines blocks `start..start + count`, skipping those already offline.
    pub fn offline_range(&mut self, start: u32, count: u32) -> Result<BatchOutcome> {
        let ids = (start..start.saturating_add(count)).collect();
        let label = format!("offline blocks {start}+{count}");
        self.run_batch(BatchOutcome::new(label), ids, false, offline)
    }

    /// Onlines every offline block of the named region.
    pub fn online_region_blocks(&mut self, region: &str) -> Result<BatchOutcome> {
        let ids = self.region_block_ids(region)?;
        let label = format!("online {region}");
        self.run_batch(BatchOutcome::new(label), ids, true, online)
    }

    /// Offlines every online block of the named region.
    pub fn offline_region_blocks(&mut self, region: &str) -> Result<BatchOutcome> {
        let ids = self.region_block_ids(region)?;
        let label = format!("offline {region}");
        self.run_batch(BatchOutcome::new(label), ids, false, offline)
    }

    /// Moves the blocks at `offsets` within the named region to `state`.
    ///
    /// `None` selects every block of the region. Offsets are visited in
    /// ascending order; one that does not resolve to a block counts as a failure.
    pub fn set_region_block_states(
        &mut self,
        region: &str,
        offsets: Option<&[i64]>,
        state: OnlinePolicy,
    ) -> Result<BatchOutcome> {
        let offsets: Vec<i64> = match offsets {
            Some(offsets) => {
                let mut offsets = offsets.to_vec();
                offsets.sort_unstable();
                offsets.dedup();
                offsets
            }
            None => (0..self.region_block_ids(region)?.len() as i64).collect(),
        };

        let mut outcome = BatchOutcome::new(format!("set {region} blocks to {state}"));
        for offset in offsets {
            outcome.attempted += 1;
            let target = format!("{region} offset {offset}");
            let id = match self.block_at_offset(region, offset) {
                Ok(id) => id,
                Err(e) => {
                    outcome.fail(target, &e);
                    continue;
                }
            };
            match self.set_block_state(id, state) {
                Ok(Change::Applied) => outcome.changed.push(id),
                Ok(Change::Unchanged) => outcome.unchanged.push(id),
                Err(e) => outcome.fail(target, &e),
            }
        }
        outcome.into_result()
    }

    fn region_block_ids(&self, region: &str) -> Result<Vec<u32>> {
        let block_size = self.block_size()?;
        blocks_of_region(self.enumerate_blocks()?, self.region(region)?, block_size)
    }

    // `online_target` is the raw online flag that marks a block as already done.
    fn run_batch(
        &mut self,
        mut outcome: BatchOutcome,
        ids: Vec<u32>,
        online_target: bool,
        op: BlockOp,
    ) -> Result<BatchOutcome> {
        for id in ids {
            outcome.attempted += 1;
            let (dir, block) = match self.block_mut(id) {
                Ok(found) => found,
                Err(e) => {
                    outcome.fail(format!("memory{id}"), &e);
                    continue;
                }
            };
            if block.is_online() == online_target {
                outcome.unchanged.push(id);
                continue;
            }
            match op(dir, block) {
                Ok(Change::Applied) => outcome.changed.push(id),
                Ok(Change::Unchanged) => outcome.unchanged.push(id),
                Err(e) => outcome.fail(format!("memory{id}"), &e),
            }
        }
        outcome.into_result()
    }
}
