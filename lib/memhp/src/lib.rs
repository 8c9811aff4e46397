// SPDX-FileCopyrightText: Copyright (c) 2024-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Memory block hotplug and CXL region administration.
//!
//! This crate drives the kernel's memory hotplug interface
//! (`/sys/devices/system/memory`) and the CXL region/DAX device model:
//! - Enumeration of memory blocks into an id-indexed, sorted [`BlockSet`]
//! - Policy state derivation from raw `state` / `valid_zones` attributes
//! - Address-range mapping of blocks onto CXL [`Region`]s
//! - Byte-verified online/offline transitions with batch failure accounting
//! - Region lifecycle (create, delete, enable, disable, mode switch) with rollback
//!
//! All kernel access goes through two seams: [`BlockDirectory`] for the memory
//! block tree and [`Topology`] for CXL/DAX objects. [`MemContext`] owns one of
//! each and caches the block collection and region list for its lifetime.

#![deny(missing_docs)]

pub mod aggregate;
pub mod block;
pub mod config;
pub mod context;
pub mod lifecycle;
pub mod numa;
pub mod policy;
pub mod region;
pub mod request;
pub mod sysfs;
pub mod topology;
pub mod transition;

#[cfg(any(test, feature = "testing"))]
pub mod testing;


pub use aggregate::{SystemSummary, format_bytes};
pub use block::{BlockDirectory, BlockSet, MemoryBlock, SysfsBlockDirectory};
pub use config::MemConfig;
pub use context::MemContext;
pub use numa::NumaNode;
pub use policy::{OnlinePolicy, RawState, Zone, ZoneMask};
pub use region::{BlockFilter, Region, RegionMode};
pub use request::{Output, Request};
pub use topology::{DaxDevice, DecoderMode, Memdev, SysfsTopology, Topology};
pub use transition::{BatchFailure, BatchOutcome, Change};

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use thiserror::Error;

/// Result type for memory administration operations.
pub type Result<T> = std::result::Result<T, MemError>;

/// Errors that can occur while inspecting or mutating memory state.
#[derive(Debug, Error)]
#[allow(missing_docs)]
pub enum MemError {
    /// Unusable system configuration: unreadable block size, invalid region address.
    #[error("configuration error: {0}")]
    Config(String),

    #[error("I/O error on {}: {source}", path.display())]
    Sysfs {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A sysfs store consumed fewer (or more) bytes than were written.
    #[error("short write to {}: {written} of {expected} bytes", path.display())]
    ShortWrite {
        path: PathBuf,
        written: usize,
        expected: usize,
    },

    /// The requested state transition is not allowed from the current state.
    #[error("invalid state transition: {0}")]
    Precondition(String),

    #[error("out of range: {0}")]
    Range(String),

    #[error("not found: {0}")]
    NotFound(String),

    /// At least one member of a batch or multi-step operation failed.
    ///
    /// Carries the full outcome so callers can tell which targets changed.
    #[error(
        "{}: {} of {} operations failed",
        .0.operation,
        .0.failures.len(),
        .0.attempted
    )]
    PartialFailure(Box<BatchOutcome>),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// The object is already in the requested state (a user error, not a fault).
    #[error("{0}")]
    AlreadyInState(String),

    /// Region creation failed and the partially built region was deleted.
    #[error("failed to create region {region} (rolled back): {cause}")]
    CreateFailed {
        region: String,
        #[source]
        cause: Box<MemError>,
    },

    /// Region creation failed and deleting the partial region failed too.
    #[error("failed to create region {region}: {cause}; rollback failed, region may be orphaned: {rollback}")]
    RegionOrphaned {
        region: String,
        cause: Box<MemError>,
        rollback: Box<MemError>,
    },

    #[error("topology error: {0}")]
    Topology(String),

    #[error("permission denied: {0}")]
    Permission(String),
}

impl MemError {
    /// Returns true for open/read/write failures, including byte-count mismatches.
    pub fn is_io(&self) -> bool {
        matches!(
            self,
            MemError::Sysfs { .. } | MemError::Io(_) | MemError::ShortWrite { .. }
        )
    }

    /// Returns true for errors caused by the request rather than the system.
    pub fn is_user_error(&self) -> bool {
        matches!(
            self,
            MemError::Precondition(_)
                | MemError::Range(_)
                | MemError::NotFound(_)
                | MemError::InvalidArgument(_)
                | MemError::AlreadyInState(_)
                | MemError::Permission(_)
        )
    }

    /// The batch accounting behind a [`MemError::PartialFailure`].
    pub fn batch_outcome(&self) -> Option<&BatchOutcome> {
        match self {
            MemError::PartialFailure(outcome) => Some(outcome),
            _ => None,
        }
    }

    pub(crate) fn sysfs(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        MemError::Sysfs {
            path: path.into(),
            source,
        }
    }
}

/// A half-open physical address range `[base, base + size)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddressRange {
    /// Start address of the range.
    pub base: u64,

    /// Size of the range in bytes.
    pub size: u64,
}

impl AddressRange {
    /// Creates a new range with the given base address and size.
    pub fn new(base: u64, size: u64) -> Self {
        Self { base, size }
    }

    /// One past the last address of the range, saturating at `u64::MAX`.
    #[inline]
    pub fn end(&self) -> u64 {
        self.base.saturating_add(self.size)
    }

    /// Returns true if `addr` lies inside the range.
    #[inline]
    pub fn contains(&self, addr: u64) -> bool {
        self.base <= addr && addr < self.end()
    }

    /// Returns true if the range covers no addresses.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.size == 0
    }
}
