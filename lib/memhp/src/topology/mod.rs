// SPDX-FileCopyrightText: Copyright (c) 2024-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! CXL and DAX topology.
//!
//! Memory devices, regions and their DAX devices are owned by the kernel. The
//! crate only ever sees snapshots ([`Memdev`], [`Region`], [`DaxDevice`]) and
//! refers to live objects by device name. [`Topology`] is the set of primitive
//! operations the lifecycle manager composes; [`SysfsTopology`] implements it
//! on `/sys/bus/cxl` and `/sys/bus/dax`.

mod sysfs;

pub use sysfs::SysfsTopology;

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::numa::NumaNode;
use crate::region::{Region, RegionMode};
use crate::{MemError, Result};

/// Endpoint decoder mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
#[allow(missing_docs)]
pub enum DecoderMode {
    #[default]
    None,
    Ram,
    Pmem,
    Mixed,
}

impl DecoderMode {
    /// Kernel string for this mode.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Ram => "ram",
            Self::Pmem => "pmem",
            Self::Mixed => "mixed",
        }
    }
}

impl fmt::Display for DecoderMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DecoderMode {
    type Err = MemError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "none" => Ok(Self::None),
            "ram" => Ok(Self::Ram),
            "pmem" => Ok(Self::Pmem),
            "mixed" => Ok(Self::Mixed),
            other => Err(MemError::InvalidArgument(format!(
                "unknown decoder mode: {other:?}"
            ))),
        }
    }
}

/// Snapshot of a CXL memory device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Memdev {
    /// Device name, e.g. `mem0`.
    pub name: String,
    /// Numeric suffix of the name; memdev listings are sorted by it.
    pub id: u32,
    /// Volatile capacity in bytes.
    pub ram_size: u64,
    /// Whether a driver is bound to the memdev.
    pub enabled: bool,
    /// Parent device (usually a PCI address).
    pub host: String,
    /// Endpoint port name, `None` if the device has no endpoint yet.
    pub endpoint: Option<String>,
    /// Whether the endpoint port is bound.
    pub endpoint_enabled: bool,
    /// First endpoint decoder; this is the decoder regions bind to.
    pub decoder: Option<String>,
    /// Current mode of [`Memdev::decoder`].
    pub decoder_mode: DecoderMode,
    /// Region currently targeting [`Memdev::decoder`].
    pub region: Option<String>,
    /// NUMA node the device is attached to.
    pub node: NumaNode,
    /// Firmware revision string.
    pub firmware_version: Option<String>,
}

impl Memdev {
    /// True when the device can join a new region: it is enabled, has an
    /// enabled endpoint with a decoder, and that decoder is not bound to a region.
    pub fn is_available(&self) -> bool {
        self.enabled && self.endpoint_enabled && self.decoder.is_some() && self.region.is_none()
    }
}

/// The DAX device backing a region.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DaxDevice {
    /// Device name, e.g. `dax0.0`.
    pub name: String,
    /// [`RegionMode::Ram`] when bound as system RAM, [`RegionMode::Dax`] when
    /// bound as a raw device, [`RegionMode::Other`] when unbound.
    pub mode: RegionMode,
    /// Whether any driver is bound.
    pub enabled: bool,
}

/// Primitive CXL/DAX operations.
///
/// Every mutating call either fully applies or returns an error; composing
/// calls into transactions is the lifecycle manager's job.
pub trait Topology {
    /// All memory devices, in any order.
    fn memdevs(&self) -> Result<Vec<Memdev>>;

    /// All regions, in any order.
    fn regions(&self) -> Result<Vec<Region>>;

    /// Interleave granularity advertised by the memdev's host bridge decoder.
    fn memdev_interleave_granularity(&self, memdev: &str) -> Result<u32>;

    /// Allocates a new RAM region from the root decoder and returns its name.
    fn create_ram_region(&self) -> Result<String>;

    /// Deletes a region. The region must be disabled.
    fn delete_region(&self, region: &str) -> Result<()>;

    /// Sets the number of devices the region stripes across.
    fn set_interleave_ways(&self, region: &str, ways: u32) -> Result<()>;

    /// Sets the stripe unit in bytes.
    fn set_interleave_granularity(&self, region: &str, granularity: u32) -> Result<()>;

    /// Sets the region size in bytes.
    fn set_region_size(&self, region: &str, size: u64) -> Result<()>;

    /// Sets the mode of the memdev's endpoint decoder.
    fn set_decoder_mode(&self, memdev: &str, mode: DecoderMode) -> Result<()>;

    /// Sets the DPA allocation of the memdev's endpoint decoder.
    fn set_decoder_dpa_size(&self, memdev: &str, size: u64) -> Result<()>;

    /// Binds the memdev's endpoint decoder as interleave target `position`.
    fn set_region_target(&self, region: &str, position: usize, memdev: &str) -> Result<()>;

    /// Commits the region's decode configuration.
    fn commit_region(&self, region: &str) -> Result<()>;

    /// Binds the region driver.
    fn enable_region(&self, region: &str) -> Result<()>;

    /// Unbinds the region driver.
    fn disable_region(&self, region: &str) -> Result<()>;

    /// The DAX device backing the region.
    fn dax_device(&self, region: &str) -> Result<DaxDevice>;

    /// Unbinds the DAX device from its current driver.
    fn disable_dax_device(&self, dax: &str) -> Result<()>;

    /// Binds the DAX device as a raw character device.
    fn enable_devdax(&self, dax: &str) -> Result<()>;

    /// Binds the DAX device as system RAM.
    fn enable_system_ram(&self, dax: &str) -> Result<()>;
}

/// Parses the numeric suffix of a device name such as `mem3` or `region12`.
pub(crate) fn device_id(name: &str, prefix: &str) -> Option<u32> {
    name.strip_prefix(prefix)?.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn memdev() -> Memdev {
        Memdev {
            name: "mem0".into(),
            id: 0,
            ram_size: 1 << 30,
            enabled: true,
            host: "0000:35:00.0".into(),
            endpoint: Some("endpoint2".into()),
            endpoint_enabled: true,
            decoder: Some("decoder2.0".into()),
            decoder_mode: DecoderMode::None,
            region: None,
            node: NumaNode(1),
            firmware_version: None,
        }
    }

    #[test]
    fn test_memdev_availability() {
        let free = memdev();
        assert!(free.is_available());

        let bound = Memdev {
            region: Some("region0".into()),
            ..memdev()
        };
        assert!(!bound.is_available());

        let disabled = Memdev {
            enabled: false,
            ..memdev()
        };
        assert!(!disabled.is_available());

        let no_endpoint = Memdev {
            endpoint: None,
            endpoint_enabled: false,
            decoder: None,
            ..memdev()
        };
        assert!(!no_endpoint.is_available());
    }

    #[rstest]
    #[case("mem0", "mem", Some(0))]
    #[case("region12", "region", Some(12))]
    #[case("mem", "mem", None)]
    #[case("endpoint3", "mem", None)]
    fn test_device_id(#[case] name: &str, #[case] prefix: &str, #[case] expected: Option<u32>) {
        assert_eq!(device_id(name, prefix), expected);
    }

    #[test]
    fn test_decoder_mode_strings() {
        assert_eq!("ram".parse::<DecoderMode>().unwrap(), DecoderMode::Ram);
        assert_eq!(DecoderMode::Pmem.to_string(), "pmem");
        assert!("RAM".parse::<DecoderMode>().is_err());
    }
}
