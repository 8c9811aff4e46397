// SPDX-FileCopyrightText: Copyright (c) 2024-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Memory hotplug and CXL region administration.
//!
//! Run with: cargo run --package memhp --bin memctl -- --help

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use memhp::aggregate::parse_policy;
use memhp::request::{BlockRow, BlockTarget, Query, RegionRow, execute};
use memhp::{
    BatchOutcome, BlockFilter, Change, MemConfig, MemContext, Memdev, OnlinePolicy, Output, RegionMode,
    Request, SystemSummary, format_bytes,
};
use tracing_subscriber::EnvFilter;

// ---------------------------------------------------------------------------
// CLI
// ---------------------------------------------------------------------------

#[derive(Parser, Debug)]
#[command(name = "memctl")]
#[command(about = "Inspect and manage hotplugged memory blocks and CXL regions")]
struct Cli {
    /// Print results as JSON
    #[arg(long, global = true)]
    json: bool,

    /// Print sizes with binary units
    #[arg(short = 'H', long, global = true)]
    human: bool,

    /// Log at debug level (RUST_LOG takes precedence)
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// System summary: block size, policy, counts and capacities
    Info,
    /// List memory blocks
    List {
        #[command(flatten)]
        filter: FilterArgs,
        /// Only blocks of this region
        #[arg(long)]
        region: Option<String>,
    },
    /// Online or offline memory blocks
    #[command(subcommand)]
    Block(BlockCommand),
    /// Create, delete and reconfigure CXL regions
    #[command(subcommand)]
    Region(RegionCommand),
    /// Change system settings
    #[command(subcommand)]
    Set(SetCommand),
    /// Query individual values
    #[command(subcommand)]
    Show(ShowCommand),
}

#[derive(Args, Debug)]
struct FilterArgs {
    /// Only online blocks
    #[arg(long, conflicts_with = "offline")]
    online: bool,
    /// Only offline blocks
    #[arg(long)]
    offline: bool,
}

impl FilterArgs {
    fn filter(&self) -> BlockFilter {
        BlockFilter::from_flags(self.online, self.offline)
    }
}

#[derive(Args, Debug)]
struct RangeArgs {
    /// Every block in the system
    #[arg(long, conflicts_with = "start")]
    all: bool,
    /// First block id
    #[arg(required_unless_present = "all")]
    start: Option<u32>,
    /// Number of blocks
    #[arg(default_value = "1")]
    count: u32,
}

impl RangeArgs {
    fn target(&self) -> BlockTarget {
        match self.start {
            Some(start) if !self.all => BlockTarget::Range {
                start,
                count: self.count,
            },
            _ => BlockTarget::All,
        }
    }
}

#[derive(Subcommand, Debug)]
enum BlockCommand {
    /// Online blocks into ZONE_MOVABLE
    Online(RangeArgs),
    /// Offline blocks
    Offline(RangeArgs),
    /// Move one block to a state
    State {
        id: u32,
        #[arg(value_parser = policy_arg)]
        state: OnlinePolicy,
    },
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum ModeArg {
    Ram,
    Dax,
}

impl From<ModeArg> for RegionMode {
    fn from(mode: ModeArg) -> Self {
        match mode {
            ModeArg::Ram => RegionMode::Ram,
            ModeArg::Dax => RegionMode::Dax,
        }
    }
}

#[derive(Subcommand, Debug)]
enum RegionCommand {
    /// Create a RAM region striped across memdevs (all memdevs when none given)
    Create {
        /// Interleave granularity in bytes
        #[arg(short, long)]
        granularity: Option<u32>,
        memdevs: Vec<String>,
    },
    /// Offline a region's blocks, then disable and delete it
    Delete { name: String },
    /// Bind the region driver
    Enable { name: String },
    /// Unbind the region driver
    Disable { name: String },
    /// Switch the region's DAX device between system RAM and devdax
    Mode {
        name: String,
        #[arg(value_enum)]
        mode: ModeArg,
    },
    /// Move blocks of a region to a state
    Blocks {
        name: String,
        #[arg(value_parser = policy_arg)]
        state: OnlinePolicy,
        /// Block offsets within the region; -1 or none selects every block
        #[arg(short, long, allow_hyphen_values = true)]
        offset: Vec<i64>,
    },
}

#[derive(Subcommand, Debug)]
enum SetCommand {
    /// Policy applied to hot-added blocks
    Policy {
        #[arg(value_parser = policy_arg)]
        policy: OnlinePolicy,
    },
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum BlockAttrArg {
    Node,
    Online,
    PhysDevice,
    Removable,
    State,
    Zones,
}

#[derive(Subcommand, Debug)]
enum ShowCommand {
    /// Memory block size
    BlockSize,
    /// Online policy for hot-added blocks
    Policy,
    /// One attribute of a block
    Block {
        id: u32,
        #[arg(value_enum)]
        attr: BlockAttrArg,
    },
    /// Number of blocks, system-wide or in a region
    NumBlocks {
        #[command(flatten)]
        filter: FilterArgs,
        #[arg(long)]
        region: Option<String>,
    },
    /// Capacity, system-wide or in a region
    Capacity {
        #[command(flatten)]
        filter: FilterArgs,
        #[arg(long)]
        region: Option<String>,
    },
    /// CXL memory devices
    Memdevs,
    /// Whether a memdev can join a new region
    MemdevAvailable { name: String },
    /// Interleave granularity of the memdev's host bridge
    MemdevGranularity { name: String },
    /// Number of memdevs
    NumMemdevs,
    /// CXL regions
    Regions,
    /// Number of regions
    NumRegions,
    /// Whether a region's driver is bound
    RegionEnabled { name: String },
    /// State of the block at an offset within a region
    RegionBlockState { name: String, offset: i64 },
}

fn policy_arg(s: &str) -> std::result::Result<OnlinePolicy, String> {
    parse_policy(s).map_err(|e| e.to_string())
}

impl Command {
    fn into_request(self) -> Request {
        match self {
            Command::Info => Request::Info,
            Command::List { filter, region } => Request::List {
                filter: filter.filter(),
                region,
            },
            Command::Block(BlockCommand::Online(range)) => Request::BlockOnline(range.target()),
            Command::Block(BlockCommand::Offline(range)) => Request::BlockOffline(range.target()),
            Command::Block(BlockCommand::State { id, state }) => Request::SetBlockState { id, state },
            Command::Region(cmd) => match cmd {
                RegionCommand::Create {
                    granularity,
                    memdevs,
                } => Request::RegionCreate {
                    memdevs,
                    granularity,
                },
                RegionCommand::Delete { name } => Request::RegionDelete(name),
                RegionCommand::Enable { name } => Request::RegionEnable(name),
                RegionCommand::Disable { name } => Request::RegionDisable(name),
                RegionCommand::Mode { name, mode } => Request::RegionMode {
                    name,
                    mode: mode.into(),
                },
                RegionCommand::Blocks {
                    name,
                    state,
                    offset,
                } => Request::SetRegionBlockState {
                    region: name,
                    offsets: (!offset.is_empty() && !offset.contains(&-1)).then_some(offset),
                    state,
                },
            },
            Command::Set(SetCommand::Policy { policy }) => Request::SetPolicy(policy),
            Command::Show(cmd) => Request::Show(match cmd {
                ShowCommand::BlockSize => Query::BlockSize,
                ShowCommand::Policy => Query::Policy,
                ShowCommand::Block { id, attr } => match attr {
                    BlockAttrArg::Node => Query::BlockNode(id),
                    BlockAttrArg::Online => Query::BlockOnline(id),
                    BlockAttrArg::PhysDevice => Query::BlockPhysDevice(id),
                    BlockAttrArg::Removable => Query::BlockRemovable(id),
                    BlockAttrArg::State => Query::BlockState(id),
                    BlockAttrArg::Zones => Query::BlockZones(id),
                },
                ShowCommand::NumBlocks { filter, region } => Query::NumBlocks {
                    filter: filter.filter(),
                    region,
                },
                ShowCommand::Capacity { filter, region } => Query::Capacity {
                    filter: filter.filter(),
                    region,
                },
                ShowCommand::Memdevs => Query::Memdevs,
                ShowCommand::MemdevAvailable { name } => Query::MemdevAvailable(name),
                ShowCommand::MemdevGranularity { name } => Query::MemdevGranularity(name),
                ShowCommand::NumMemdevs => Query::NumMemdevs,
                ShowCommand::Regions => Query::Regions,
                ShowCommand::NumRegions => Query::NumRegions,
                ShowCommand::RegionEnabled { name } => Query::RegionEnabled(name),
                ShowCommand::RegionBlockState { name, offset } => Query::RegionBlockState {
                    region: name,
                    offset,
                },
            }),
        }
    }
}

// ---------------------------------------------------------------------------
// Rendering
// ---------------------------------------------------------------------------

struct Printer {
    human: bool,
}

impl Printer {
    fn bytes(&self, bytes: u64) -> String {
        if self.human {
            format_bytes(bytes)
        } else {
            bytes.to_string()
        }
    }

    fn print(&self, output: &Output) {
        match output {
            Output::Summary(summary) => self.summary(summary),
            Output::Blocks(rows) => self.blocks(rows),
            Output::Memdevs(memdevs) => self.memdevs(memdevs),
            Output::Regions(rows) => self.regions(rows),
            Output::Region(region) => println!("{}", region.name),
            Output::Batch(outcome) => self.batch(outcome),
            Output::Change(Change::Applied) => println!("applied"),
            Output::Change(Change::Unchanged) => println!("unchanged"),
            Output::Flag(flag) => println!("{}", u8::from(*flag)),
            Output::Count(n) => println!("{n}"),
            Output::Bytes(n) => println!("{}", self.bytes(*n)),
            Output::Text(text) => println!("{text}"),
            Output::Done => {}
        }
    }

    fn summary(&self, s: &SystemSummary) {
        let policy = s.policy.map_or_else(|| "-".to_string(), |p| p.to_string());
        println!("Block size:        {}", self.bytes(s.block_size));
        println!("Online policy:     {policy}");
        println!(
            "Blocks:            {} ({} online, {} offline)",
            s.num_blocks, s.num_blocks_online, s.num_blocks_offline
        );
        println!(
            "Capacity:          {} ({} online, {} offline)",
            self.bytes(s.capacity),
            self.bytes(s.capacity_online),
            self.bytes(s.capacity_offline)
        );
        println!("Regions:           {}", s.num_regions);
        println!("Memdevs:           {}", s.num_memdevs);
    }

    fn blocks(&self, rows: &[BlockRow]) {
        println!("{:<10} {:>5} {:>7} {:<16} {:<10} {:<24}", "BLOCK", "NODE", "ONLINE", "STATE", "REGION", "ZONES");
        for row in rows {
            let node = row.node.map_or_else(|| "-".to_string(), |n| n.to_string());
            println!(
                "{:<10} {:>5} {:>7} {:<16} {:<10} {:<24}",
                format!("memory{}", row.id),
                node,
                u8::from(row.online),
                row.state,
                row.region.as_deref().unwrap_or("-"),
                row.zones
            );
        }
    }

    fn memdevs(&self, memdevs: &[Memdev]) {
        println!(
            "{:<8} {:>7} {:<6} {:>12} {:<14} {:<12} {:<12} {:<10} {:<10}",
            "MEMDEV", "ENABLED", "MODE", "SIZE", "HOST", "ENDPOINT", "DECODER", "REGION", "FIRMWARE"
        );
        for m in memdevs {
            println!(
                "{:<8} {:>7} {:<6} {:>12} {:<14} {:<12} {:<12} {:<10} {:<10}",
                m.name,
                u8::from(m.enabled),
                m.decoder_mode,
                self.bytes(m.ram_size),
                m.host,
                m.endpoint.as_deref().unwrap_or("-"),
                m.decoder.as_deref().unwrap_or("-"),
                m.region.as_deref().unwrap_or("-"),
                m.firmware_version.as_deref().unwrap_or("-"),
            );
        }
    }

    fn regions(&self, rows: &[RegionRow]) {
        println!(
            "{:<10} {:>7} {:<8} {:<4} {:>12} {:>4} {:>6} {:>7} {:>7}  TARGETS",
            "REGION", "ENABLED", "DAX", "MODE", "SIZE", "WAYS", "GRAN", "BLOCKS", "ONLINE"
        );
        for row in rows {
            let r = &row.region;
            let targets: Vec<String> = r
                .targets
                .iter()
                .enumerate()
                .map(|(i, t)| format!("{i}:{}", t.as_deref().unwrap_or("-")))
                .collect();
            println!(
                "{:<10} {:>7} {:<8} {:<4} {:>12} {:>4} {:>6} {:>7} {:>7}  {}",
                r.name,
                u8::from(r.enabled),
                r.dax.as_deref().unwrap_or("-"),
                r.mode,
                self.bytes(r.size),
                r.interleave_ways,
                r.interleave_granularity,
                row.num_blocks,
                row.blocks_online,
                targets.join(" ")
            );
        }
    }

    fn batch(&self, outcome: &BatchOutcome) {
        println!(
            "{}: {} attempted, {} changed, {} unchanged",
            outcome.operation,
            outcome.attempted,
            outcome.changed.len(),
            outcome.unchanged.len()
        );
        for failure in &outcome.failures {
            println!("  {} failed: {}", failure.target, failure.error);
        }
    }
}

fn init_logging(verbose: bool) {
    let default = if verbose { "memhp=debug" } else { "memhp=info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let config = MemConfig::from_env().context("Failed to load configuration")?;
    let mut ctx = MemContext::new(config);
    let request = cli.command.into_request();

    let printer = Printer { human: cli.human };
    let output = match execute(&mut ctx, &request) {
        Ok(output) => output,
        Err(e) => {
            // report what a failed batch did get done before bailing out
            if let Some(outcome) = e.batch_outcome() {
                emit(cli.json, &printer, &Output::Batch(outcome.clone()))?;
            }
            return Err(e).with_context(|| format!("{request:?} failed"));
        }
    };
    emit(cli.json, &printer, &output)
}

fn emit(json: bool, printer: &Printer, output: &Output) -> Result<()> {
    if json {
        println!(
            "{}",
            serde_json::to_string_pretty(output).context("Failed to serialize output")?
        );
    } else {
        printer.print(output);
    }
    Ok(())
}
