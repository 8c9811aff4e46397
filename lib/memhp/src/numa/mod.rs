// SPDX-FileCopyrightText: Copyright (c) 2025-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! NUMA affinity of memory blocks.
//!
//! Each `memory<N>` directory under `/sys/devices/system/memory` carries a
//! `node<M>` symlink naming the NUMA node the block belongs to. Blocks without
//! such a link (or with an unparsable one) report [`NumaNode::UNKNOWN`].

use serde::{Deserialize, Serialize};

/// Represents a NUMA node identifier.
///
/// Use [`NumaNode::UNKNOWN`] when the node cannot be determined.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NumaNode(pub u32);

impl NumaNode {
    /// Sentinel value for unknown NUMA node.
    pub const UNKNOWN: NumaNode = NumaNode(u32::MAX);

    /// Returns true if this represents an unknown NUMA node.
    pub fn is_unknown(&self) -> bool {
        self.0 == u32::MAX
    }

    /// Parses a sysfs link name of the form `node<M>`.
    ///
    /// Trailing garbage after the digits is ignored, so `node1` and `node1x`
    /// both resolve to node 1.
    pub fn from_link_name(name: &str) -> Option<NumaNode> {
        let digits = name.strip_prefix("node")?;
        let end = digits
            .find(|c: char| !c.is_ascii_digit())
            .unwrap_or(digits.len());
        digits[..end].parse::<u32>().ok().map(NumaNode)
    }

    /// The node index, or `None` when unknown.
    pub fn index(&self) -> Option<u32> {
        (!self.is_unknown()).then_some(self.0)
    }
}

impl Default for NumaNode {
    fn default() -> Self {
        NumaNode::UNKNOWN
    }
}

impl std::fmt::Display for NumaNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.is_unknown() {
            write!(f, "-")
        } else {
            write!(f, "{}", self.0)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[test]
    fn test_numa_node_unknown() {
        let unknown = NumaNode::UNKNOWN;
        assert!(unknown.is_unknown());
        assert_eq!(unknown.index(), None);
        assert_eq!(NumaNode::default(), NumaNode::UNKNOWN);

        let valid = NumaNode(0);
        assert!(!valid.is_unknown());
        assert_eq!(valid.index(), Some(0));
    }

    #[rstest]
    #[case("node0", Some(NumaNode(0)))]
    #[case("node12", Some(NumaNode(12)))]
    #[case("node3x", Some(NumaNode(3)))]
    #[case("node", None)]
    #[case("nodex", None)]
    #[case("memory0", None)]
    fn test_from_link_name(#[case] name: &str, #[case] expected: Option<NumaNode>) {
        assert_eq!(NumaNode::from_link_name(name), expected);
    }

    #[test]
    fn test_numa_node_display() {
        assert_eq!(format!("{}", NumaNode(0)), "0");
        assert_eq!(format!("{}", NumaNode(7)), "7");
        assert_eq!(format!("{}", NumaNode::UNKNOWN), "-");
    }

    #[test]
    fn test_numa_node_serialization() {
        let node = NumaNode(1);
        let json = serde_json::to_string(&node).unwrap();
        assert_eq!(json, "1");
        let deserialized: NumaNode = serde_json::from_str(&json).unwrap();
        assert_eq!(node, deserialized);
    }
}
