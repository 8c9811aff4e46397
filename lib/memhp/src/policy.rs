// SPDX-FileCopyrightText: Copyright (c) 2024-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Online policies, raw block states and memory zones.
//!
//! Each enum owns its kernel string mapping; [`FromStr`] is the inverse of
//! `as_str` and rejects anything outside the table.

use std::fmt;
use std::str::FromStr;

use bitflags::bitflags;
use serde::{Deserialize, Serialize};

use crate::MemError;

/// Effective block state, also used for the system auto-online policy.
///
/// The string forms are what the kernel accepts in a block's `state`
/// attribute and in `auto_online_blocks`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OnlinePolicy {
    /// Block is offline.
    Offline,
    /// Online in the zone the kernel picks (usually Normal).
    Online,
    /// Online in a kernel zone (DMA, DMA32 or Normal).
    Kernel,
    /// Online in ZONE_MOVABLE, so it can be offlined again later.
    Movable,
}

impl OnlinePolicy {
    /// All policies in table order.
    pub const ALL: [OnlinePolicy; 4] = [
        OnlinePolicy::Offline,
        OnlinePolicy::Online,
        OnlinePolicy::Kernel,
        OnlinePolicy::Movable,
    ];

    /// Kernel string for this policy.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Offline => "offline",
            Self::Online => "online",
            Self::Kernel => "online_kernel",
            Self::Movable => "online_movable",
        }
    }
}

impl fmt::Display for OnlinePolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OnlinePolicy {
    type Err = MemError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|p| p.as_str() == s)
            .ok_or_else(|| MemError::InvalidArgument(format!("unknown online policy: {s:?}")))
    }
}

/// Raw value of a block's `state` attribute.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RawState {
    #[default]
    #[allow(missing_docs)]
    Offline,
    #[allow(missing_docs)]
    Online,
    /// Transient state while the kernel migrates pages out of the block.
    GoingOffline,
}

impl RawState {
    /// All raw states in table order.
    pub const ALL: [RawState; 3] = [RawState::Offline, RawState::Online, RawState::GoingOffline];

    /// Kernel string for this state.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Offline => "offline",
            Self::Online => "online",
            Self::GoingOffline => "going-offline",
        }
    }
}

impl fmt::Display for RawState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RawState {
    type Err = MemError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|st| st.as_str() == s)
            .ok_or_else(|| MemError::InvalidArgument(format!("unknown block state: {s:?}")))
    }
}

/// A memory zone named in `valid_zones`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[allow(missing_docs)]
pub enum Zone {
    Dma,
    Dma32,
    Normal,
    Movable,
    None,
}

impl Zone {
    /// All zones in bit order.
    pub const ALL: [Zone; 5] = [Zone::Dma, Zone::Dma32, Zone::Normal, Zone::Movable, Zone::None];

    /// Kernel string for this zone.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Dma => "DMA",
            Self::Dma32 => "DMA32",
            Self::Normal => "Normal",
            Self::Movable => "Movable",
            Self::None => "none",
        }
    }

    /// The bit this zone occupies in a [`ZoneMask`].
    pub fn mask(&self) -> ZoneMask {
        match self {
            Self::Dma => ZoneMask::DMA,
            Self::Dma32 => ZoneMask::DMA32,
            Self::Normal => ZoneMask::NORMAL,
            Self::Movable => ZoneMask::MOVABLE,
            Self::None => ZoneMask::NONE,
        }
    }
}

impl fmt::Display for Zone {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Zone {
    type Err = MemError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|z| z.as_str() == s)
            .ok_or_else(|| MemError::InvalidArgument(format!("unknown zone: {s:?}")))
    }
}

bitflags! {
    /// Bitmask of zones a block may be onlined into.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
    #[serde(transparent)]
    pub struct ZoneMask: u8 {
        #[allow(missing_docs)]
        const DMA = 0x01;
        #[allow(missing_docs)]
        const DMA32 = 0x02;
        #[allow(missing_docs)]
        const NORMAL = 0x04;
        #[allow(missing_docs)]
        const MOVABLE = 0x08;
        #[allow(missing_docs)]
        const NONE = 0x10;
    }
}

impl ZoneMask {
    /// Parses a space-separated `valid_zones` value; unknown names are ignored.
    pub fn parse_list(s: &str) -> ZoneMask {
        s.split_whitespace()
            .filter_map(|token| token.parse::<Zone>().ok())
            .fold(ZoneMask::empty(), |mask, zone| mask | zone.mask())
    }

    /// Zones present in the mask, in bit order.
    pub fn zones(&self) -> impl Iterator<Item = Zone> + '_ {
        Zone::ALL.into_iter().filter(|z| self.contains(z.mask()))
    }
}

impl fmt::Display for ZoneMask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names: Vec<&str> = self.zones().map(|z| z.as_str()).collect();
        f.write_str(&names.join(" "))
    }
}
