// SPDX-FileCopyrightText: Copyright (c) 2024-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Configuration for memory administration
//!
//! Provides environment-based configuration of the sysfs root and the
//! defaults applied to requests.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::{MemError, Result};

/// Interleave granularities a region can be created with.
pub const GRANULARITIES: [u32; 6] = [256, 512, 1024, 2048, 4096, 8192];

/// Memory administration settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MemConfig {
    /// Mount point of sysfs; the memory, CXL and DAX trees are resolved under it.
    pub sysfs_root: PathBuf,
    /// Interleave granularity used when a create request names none.
    pub default_granularity: u32,
    /// Refuse mutating requests unless running as root.
    pub require_root: bool,
}

impl Default for MemConfig {
    fn default() -> Self {
        Self {
            sysfs_root: PathBuf::from("/sys"),
            default_granularity: 4096,
            require_root: true,
        }
    }
}

impl MemConfig {
    /// Create config from environment variables
    ///
    /// # Environment Variables
    ///
    /// - `MEMHP_SYSFS_ROOT`: sysfs mount point (default: /sys)
    /// - `MEMHP_DEFAULT_GRANULARITY`: default interleave granularity in bytes (default: 4096)
    /// - `MEMHP_REQUIRE_ROOT`: require root for mutations, true/false, 1/0, on/off, yes/no (default: true)
    ///
    /// # Errors
    /// Returns [`MemError::Config`] for an unparsable value or a granularity
    /// outside [`GRANULARITIES`].
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds a config from an arbitrary variable lookup.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let defaults = Self::default();

        let sysfs_root = lookup("MEMHP_SYSFS_ROOT")
            .filter(|s| !s.is_empty())
            .map(PathBuf::from)
            .unwrap_or(defaults.sysfs_root);

        let default_granularity = match lookup("MEMHP_DEFAULT_GRANULARITY") {
            Some(value) => {
                let granularity = value.trim().parse::<u32>().map_err(|_| {
                    MemError::Config(format!("MEMHP_DEFAULT_GRANULARITY: not a number: {value:?}"))
                })?;
                validate_granularity(granularity)
                    .map_err(|e| MemError::Config(format!("MEMHP_DEFAULT_GRANULARITY: {e}")))?
            }
            None => defaults.default_granularity,
        };

        let require_root = match lookup("MEMHP_REQUIRE_ROOT") {
            Some(value) => parse_bool(&value)
                .map_err(|e| MemError::Config(format!("MEMHP_REQUIRE_ROOT: {e}")))?,
            None => defaults.require_root,
        };

        Ok(Self {
            sysfs_root,
            default_granularity,
            require_root,
        })
    }

    /// `<root>/devices/system/memory`
    pub fn memory_dir(&self) -> PathBuf {
        self.sysfs_root.join("devices/system/memory")
    }

    /// `<root>/bus/cxl`
    pub fn cxl_dir(&self) -> PathBuf {
        self.sysfs_root.join("bus/cxl")
    }

    /// `<root>/bus/dax`
    pub fn dax_dir(&self) -> PathBuf {
        self.sysfs_root.join("bus/dax")
    }
}

/// Checks a granularity against [`GRANULARITIES`].
pub fn validate_granularity(granularity: u32) -> Result<u32> {
    if GRANULARITIES.contains(&granularity) {
        Ok(granularity)
    } else {
        Err(MemError::InvalidArgument(format!(
            "interleave granularity {granularity} is not one of {GRANULARITIES:?}"
        )))
    }
}

fn parse_bool(value: &str) -> std::result::Result<bool, String> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "on" | "yes" => Ok(true),
        "0" | "false" | "off" | "no" => Ok(false),
        other => Err(format!("invalid boolean value: {other:?}")),
    }
}
