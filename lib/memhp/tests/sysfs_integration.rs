// SPDX-FileCopyrightText: Copyright (c) 2024-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Integration tests against an on-disk sysfs tree
//!
//! Exercises the sysfs-backed block directory and topology end to end:
//! 1. Enumeration, block size and policy from `devices/system/memory`
//! 2. Region discovery and block-to-region mapping from `bus/cxl`
//! 3. Requests that write attributes and driver bind files

use memhp::request::{Query, execute};
use memhp::testing::SysfsTree;
use memhp::{BlockFilter, Change, MemConfig, MemContext, OnlinePolicy, Output, Request};

const BS: u64 = 256 << 20;
const REGION_BASE: u64 = 0x10_0000_0000;

/// Blocks 254..=259 on node 0; 256 and 257 back `region0` through `mem0`.
fn populated_tree() -> SysfsTree {
    let tree = SysfsTree::new();
    tree.file("devices/system/memory/block_size_bytes", "10000000\n");
    tree.file("devices/system/memory/auto_online_blocks", "offline\n");
    for id in 254..256 {
        tree.memory_block(id, "online", "Normal", Some(0));
    }
    tree.memory_block(256, "online", "Movable", Some(1));
    for id in 257..260 {
        tree.memory_block(id, "offline", "Normal Movable", Some(1));
    }

    tree.cxl_memdev(0, 2 * BS, 10);
    tree.cxl_region(0, REGION_BASE, 2 * BS, &["decoder10.0"]);
    tree.dax_device(0, "kmem");
    tree
}

fn context(tree: &SysfsTree) -> MemContext {
    MemContext::new(MemConfig {
        sysfs_root: tree.root().to_path_buf(),
        require_root: false,
        ..Default::default()
    })
}

#[test]
fn test_summary_from_sysfs() {
    let tree = populated_tree();
    let ctx = context(&tree);

    let summary = ctx.summary();
    assert_eq!(summary.block_size, BS);
    assert_eq!(summary.policy, Some(OnlinePolicy::Offline));
    assert_eq!(summary.num_blocks, 6);
    assert_eq!(summary.num_blocks_online, 3);
    assert_eq!(summary.capacity_offline, 3 * BS);
    assert_eq!(summary.num_regions, 1);
    assert_eq!(summary.num_memdevs, 1);
}

#[test]
fn test_blocks_map_onto_region() {
    let tree = populated_tree();
    let ctx = context(&tree);

    assert_eq!(ctx.blocks_of_region("region0").unwrap(), vec![256, 257]);
    assert_eq!(ctx.region_of_block(257).unwrap().map(|r| r.name.as_str()), Some("region0"));
    assert!(ctx.region_of_block(255).unwrap().is_none());
    assert_eq!(ctx.region_num_blocks("region0", BlockFilter::Online).unwrap(), 1);
    assert_eq!(ctx.block_state_at_offset("region0", 0).unwrap(), OnlinePolicy::Movable);

    let region = ctx.region("region0").unwrap();
    assert!(region.is_ram_mode());
    assert_eq!(region.targets, vec![Some("mem0".to_string())]);
    assert_eq!(ctx.memdevs().unwrap()[0].region.as_deref(), Some("region0"));
}

#[test]
fn test_list_request_reports_regions() {
    let tree = populated_tree();
    let mut ctx = context(&tree);

    let request = Request::List {
        filter: BlockFilter::Offline,
        region: None,
    };
    let Output::Blocks(rows) = execute(&mut ctx, &request).unwrap() else {
        panic!("expected a block listing");
    };
    let summary: Vec<(u32, Option<&str>)> = rows
        .iter()
        .map(|r| (r.id, r.region.as_deref()))
        .collect();
    assert_eq!(
        summary,
        vec![(257, Some("region0")), (258, None), (259, None)]
    );
    assert_eq!(rows[0].node, Some(1));
}

#[test]
fn test_writes_reach_sysfs() {
    let tree = populated_tree();
    let mut ctx = context(&tree);

    let policy = execute(&mut ctx, &Request::SetPolicy(OnlinePolicy::Movable)).unwrap();
    assert_eq!(policy, Output::Change(Change::Applied));
    assert_eq!(
        tree.read("devices/system/memory/auto_online_blocks"),
        "online_movable\n"
    );

    let online = Request::SetBlockState {
        id: 258,
        state: OnlinePolicy::Movable,
    };
    assert_eq!(
        execute(&mut ctx, &online).unwrap(),
        Output::Change(Change::Applied)
    );
    assert_eq!(
        tree.read("devices/system/memory/memory258/state"),
        "online_movable\n"
    );

    execute(&mut ctx, &Request::RegionEnable("region0".into())).unwrap();
    assert_eq!(tree.read("bus/cxl/drivers/cxl_region/bind"), "region0\n");
}

#[test]
fn test_block_size_query_and_missing_block() {
    let tree = populated_tree();
    let mut ctx = context(&tree);

    assert_eq!(
        execute(&mut ctx, &Request::Show(Query::BlockSize)).unwrap(),
        Output::Bytes(BS)
    );
    let err = execute(&mut ctx, &Request::Show(Query::BlockState(999))).unwrap_err();
    assert!(err.is_user_error());
}
