// SPDX-FileCopyrightText: Copyright (c) 2024-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Shared test fixtures.
//!
//! - [`FakeMemory`]: in-memory [`BlockDirectory`](crate::BlockDirectory) that
//!   applies writes the way the kernel would, with failure injection
//! - [`MockTopology`]: in-memory [`Topology`](crate::Topology) with a call
//!   journal and failure points
//! - [`SysfsTree`]: builder for a throwaway sysfs tree on disk
//!
//! Available to unit tests and, through the `testing` feature, to other crates.

mod memory;
mod sysfs_tree;
mod topology;

pub use memory::FakeMemory;
pub use sysfs_tree::SysfsTree;
pub use topology::{FailPoint, MockTopology};

use crate::config::MemConfig;
use crate::context::MemContext;
use crate::region::{Region, RegionMode};
use crate::topology::DecoderMode;

/// Config for fixtures: no root requirement, default granularity.
pub fn test_config() -> MemConfig {
    MemConfig {
        require_root: false,
        ..Default::default()
    }
}

/// Context over the given fakes with [`test_config`].
pub fn context(memory: FakeMemory, topology: MockTopology) -> MemContext {
    MemContext::with_backends(test_config(), memory, topology)
}

/// An enabled, committed RAM region covering `[base, base + size)`.
///
/// The id is taken from the name's numeric suffix and the DAX device is
/// `dax<id>.0`, bound as system RAM.
pub fn region(name: &str, base: u64, size: u64) -> Region {
    let id = crate::topology::device_id(name, "region").unwrap_or(0);
    Region {
        name: name.to_string(),
        id,
        base,
        size,
        interleave_ways: 1,
        interleave_granularity: 4096,
        enabled: true,
        committed: true,
        decoder_mode: DecoderMode::Ram,
        mode: RegionMode::Ram,
        dax: Some(format!("dax{id}.0")),
        targets: Vec::new(),
    }
}
