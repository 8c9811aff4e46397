// SPDX-FileCopyrightText: Copyright (c) 2024-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

use std::collections::{BTreeMap, HashSet};
use std::io;
use std::ops::Range;
use std::path::PathBuf;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::block::{BlockAttr, BlockDirectory, GlobalAttr};
use crate::numa::NumaNode;
use crate::policy::ZoneMask;
use crate::{MemError, Result};

#[derive(Debug, Clone)]
struct FakeBlock {
    online: bool,
    // zones the block may be onlined into; reported while offline
    candidates: ZoneMask,
    // zone the block is onlined into; reported while online
    zone: ZoneMask,
    node: Option<u32>,
}

#[derive(Debug, Default)]
struct State {
    block_size: u64,
    policy: String,
    blocks: BTreeMap<u32, FakeBlock>,
    fail_writes: HashSet<u32>,
    short_writes: HashSet<u32>,
    fail_listing: bool,
    writes: Vec<(u32, String, String)>,
    global_writes: usize,
    global_reads: usize,
}

/// In-memory memory block directory.
///
/// Writes to `online` and `state` move blocks between offline and online the
/// way the kernel does: `online_movable` lands in ZONE_MOVABLE, `online` and
/// `online_kernel` in ZONE_NORMAL. Clones share state, so a test can keep a
/// handle after moving one into a context.
#[derive(Debug, Clone, Default)]
pub struct FakeMemory {
    state: Arc<Mutex<State>>,
}

impl FakeMemory {
    /// Empty directory reporting `block_size` and policy `offline`.
    pub fn with_block_size(block_size: u64) -> Self {
        let fake = Self::default();
        {
            let mut state = fake.state.lock();
            state.block_size = block_size;
            state.policy = "offline".into();
        }
        fake
    }

    /// Adds a block on node 0. An online block sits in the lowest zone of
    /// `zones`; an offline one lists `zones` as its candidates.
    pub fn add_block(&self, id: u32, online: bool, zones: ZoneMask) {
        let zone = zones
            .iter()
            .next()
            .unwrap_or(ZoneMask::NORMAL);
        self.state.lock().blocks.insert(
            id,
            FakeBlock {
                online,
                candidates: zones,
                zone,
                node: Some(0),
            },
        );
    }

    /// Adds every block in `ids`.
    pub fn add_blocks(&self, ids: Range<u32>, online: bool, zones: ZoneMask) {
        for id in ids {
            self.add_block(id, online, zones);
        }
    }

    /// Changes a block behind the context's back.
    pub fn set_online(&self, id: u32, online: bool, zone: ZoneMask) {
        if let Some(block) = self.state.lock().blocks.get_mut(&id) {
            block.online = online;
            block.zone = zone;
        }
    }

    /// Sets the value of `block_size_bytes`.
    pub fn set_block_size(&self, block_size: u64) {
        self.state.lock().block_size = block_size;
    }

    /// Sets the value of `auto_online_blocks`.
    pub fn set_policy(&self, policy: &str) {
        self.state.lock().policy = policy.to_string();
    }

    /// Makes every write to block `id` fail with an I/O error.
    pub fn fail_writes(&self, id: u32) {
        self.state.lock().fail_writes.insert(id);
    }

    /// Makes writes to block `id` report one byte fewer and change nothing.
    pub fn short_writes(&self, id: u32) {
        self.state.lock().short_writes.insert(id);
    }

    /// Makes listing the directory fail.
    pub fn fail_listing(&self, fail: bool) {
        self.state.lock().fail_listing = fail;
    }

    /// Current raw online flag of block `id`.
    pub fn is_online(&self, id: u32) -> bool {
        self.state
            .lock()
            .blocks
            .get(&id)
            .is_some_and(|b| b.online)
    }

    /// Accepted block writes as `(id, attribute, value)`, in order.
    pub fn writes(&self) -> Vec<(u32, String, String)> {
        self.state.lock().writes.clone()
    }

    /// The most recent accepted block write.
    pub fn last_write(&self) -> Option<(u32, String, String)> {
        self.state.lock().writes.last().cloned()
    }

    /// Number of accepted block writes.
    pub fn block_writes(&self) -> usize {
        self.state.lock().writes.len()
    }

    /// Number of accepted global attribute writes.
    pub fn global_writes(&self) -> usize {
        self.state.lock().global_writes
    }

    /// Number of global attribute reads.
    pub fn global_reads(&self) -> usize {
        self.state.lock().global_reads
    }

    fn missing(&self, path: PathBuf) -> MemError {
        MemError::sysfs(path, io::Error::from(io::ErrorKind::NotFound))
    }
}

impl BlockDirectory for FakeMemory {
    fn block_ids(&self) -> Result<Vec<u32>> {
        let state = self.state.lock();
        if state.fail_listing {
            return Err(MemError::sysfs(
                "/fake/memory",
                io::Error::from(io::ErrorKind::PermissionDenied),
            ));
        }
        // directory order is not sorted
        Ok(state.blocks.keys().rev().copied().collect())
    }

    fn read(&self, id: u32, attr: BlockAttr) -> Result<String> {
        let state = self.state.lock();
        let block = state
            .blocks
            .get(&id)
            .ok_or_else(|| self.missing(self.block_path(id, attr)))?;
        Ok(match attr {
            BlockAttr::Online => u8::from(block.online).to_string(),
            BlockAttr::PhysDevice => "0".to_string(),
            BlockAttr::Removable => "1".to_string(),
            BlockAttr::State => if block.online { "online" } else { "offline" }.to_string(),
            BlockAttr::ValidZones => {
                if block.online {
                    block.zone.to_string()
                } else {
                    block.candidates.to_string()
                }
            }
        })
    }

    fn write(&self, id: u32, attr: BlockAttr, value: &str) -> Result<usize> {
        let mut state = self.state.lock();
        if state.fail_writes.contains(&id) {
            return Err(MemError::sysfs(
                self.block_path(id, attr),
                io::Error::from(io::ErrorKind::ResourceBusy),
            ));
        }
        if state.short_writes.contains(&id) {
            return Ok(value.len());
        }
        let block = state
            .blocks
            .get_mut(&id)
            .ok_or_else(|| self.missing(self.block_path(id, attr)))?;

        match (attr, value) {
            (BlockAttr::Online, "0") | (BlockAttr::State, "offline") => block.online = false,
            (BlockAttr::Online, "1") | (BlockAttr::State, "online" | "online_kernel") => {
                block.online = true;
                block.zone = ZoneMask::NORMAL;
            }
            (BlockAttr::State, "online_movable") => {
                block.online = true;
                block.zone = ZoneMask::MOVABLE;
            }
            _ => {
                return Err(MemError::sysfs(
                    self.block_path(id, attr),
                    io::Error::from(io::ErrorKind::InvalidInput),
                ));
            }
        }
        state
            .writes
            .push((id, attr.file_name().to_string(), value.to_string()));
        Ok(value.len() + 1)
    }

    fn node(&self, id: u32) -> Option<NumaNode> {
        self.state
            .lock()
            .blocks
            .get(&id)
            .and_then(|b| b.node)
            .map(NumaNode)
    }

    fn read_global(&self, attr: GlobalAttr) -> Result<String> {
        let mut state = self.state.lock();
        state.global_reads += 1;
        Ok(match attr {
            GlobalAttr::BlockSizeBytes => format!("{:x}", state.block_size),
            GlobalAttr::AutoOnlineBlocks => state.policy.clone(),
        })
    }

    fn write_global(&self, attr: GlobalAttr, value: &str) -> Result<usize> {
        let mut state = self.state.lock();
        match attr {
            GlobalAttr::AutoOnlineBlocks => state.policy = value.to_string(),
            GlobalAttr::BlockSizeBytes => {
                return Err(MemError::sysfs(
                    self.global_path(attr),
                    io::Error::from(io::ErrorKind::PermissionDenied),
                ));
            }
        }
        state.global_writes += 1;
        Ok(value.len() + 1)
    }

    fn block_path(&self, id: u32, attr: BlockAttr) -> PathBuf {
        PathBuf::from(format!("/fake/memory/memory{id}/{}", attr.file_name()))
    }

    fn global_path(&self, attr: GlobalAttr) -> PathBuf {
        PathBuf::from(format!("/fake/memory/{}", attr.file_name()))
    }
}
