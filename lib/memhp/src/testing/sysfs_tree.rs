// SPDX-FileCopyrightText: Copyright (c) 2024-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

use std::fs;
use std::os::unix::fs::symlink;
use std::path::{Path, PathBuf};

use tempfile::TempDir;

/// A throwaway sysfs tree in a temporary directory.
///
/// Paths passed to the helpers are relative to the tree root, which plays
/// the role of `/sys`. Device entries under `bus/*/devices` are symlinks into
/// `devices/` the way the kernel lays them out, so canonical paths carry the
/// host and port hierarchy. Helpers panic on I/O errors.
#[derive(Debug)]
pub struct SysfsTree {
    dir: TempDir,
}

impl Default for SysfsTree {
    fn default() -> Self {
        Self::new()
    }
}

impl SysfsTree {
    /// Creates an empty tree with the CXL region and DAX driver attributes in place.
    pub fn new() -> Self {
        let tree = Self {
            dir: TempDir::new().expect("create temp sysfs root"),
        };
        tree.dir("devices/system/memory");
        tree.dir("bus/cxl/devices");
        tree.dir("bus/dax/devices");
        for driver in ["bus/cxl/drivers/cxl_region", "bus/dax/drivers/kmem", "bus/dax/drivers/device_dax"] {
            tree.file(&format!("{driver}/bind"), "");
            tree.file(&format!("{driver}/unbind"), "");
        }
        tree
    }

    /// The tree root.
    pub fn root(&self) -> &Path {
        self.dir.path()
    }

    /// `devices/system/memory`.
    pub fn memory_dir(&self) -> PathBuf {
        self.path("devices/system/memory")
    }

    /// `bus/cxl`.
    pub fn cxl_dir(&self) -> PathBuf {
        self.path("bus/cxl")
    }

    /// `bus/dax`.
    pub fn dax_dir(&self) -> PathBuf {
        self.path("bus/dax")
    }

    /// Absolute path of `rel`.
    pub fn path(&self, rel: &str) -> PathBuf {
        self.root().join(rel)
    }

    /// Creates directory `rel` and its parents.
    pub fn dir(&self, rel: &str) -> PathBuf {
        let path = self.path(rel);
        fs::create_dir_all(&path).expect("create directory");
        path
    }

    /// Writes `content` to `rel`, creating parent directories.
    pub fn file(&self, rel: &str, content: &str) -> PathBuf {
        let path = self.path(rel);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).expect("create parent directory");
        }
        fs::write(&path, content).expect("write file");
        path
    }

    /// Contents of `rel`.
    pub fn read(&self, rel: &str) -> String {
        fs::read_to_string(self.path(rel)).expect("read file")
    }

    /// Creates a symlink at `rel` pointing at `target` (relative to the root).
    pub fn symlink(&self, rel: &str, target: &str) {
        let link = self.path(rel);
        if let Some(parent) = link.parent() {
            fs::create_dir_all(parent).expect("create parent directory");
        }
        symlink(self.path(target), link).expect("create symlink");
    }

    /// Binds the device directory `rel` to `driver` by adding a `driver` link.
    pub fn bind(&self, rel: &str, driver: &str) {
        self.dir(driver);
        self.symlink(&format!("{rel}/driver"), driver);
    }

    /// Adds `memory<id>` with the given `state` and `valid_zones` text.
    ///
    /// `online` is `1` exactly when `state` is `online`. A `node<M>` link is
    /// added when `node` is given.
    pub fn memory_block(&self, id: u32, state: &str, zones: &str, node: Option<u32>) {
        let block = format!("devices/system/memory/memory{id}");
        let online = if state == "online" { "1" } else { "0" };
        self.file(&format!("{block}/online"), &format!("{online}\n"));
        self.file(&format!("{block}/phys_device"), "0\n");
        self.file(&format!("{block}/removable"), "1\n");
        self.file(&format!("{block}/state"), &format!("{state}\n"));
        self.file(&format!("{block}/valid_zones"), &format!("{zones}\n"));
        if let Some(node) = node {
            self.dir(&format!("devices/system/node/node{node}"));
            self.symlink(
                &format!("{block}/node{node}"),
                &format!("devices/system/node/node{node}"),
            );
        }
    }

    /// Adds CXL root port `root<id>` with root decoder `decoder<id>.0`.
    pub fn cxl_root(&self, id: u32) {
        let real = format!("devices/platform/ACPI0017:00/root{id}");
        self.dir(&real);
        self.link_device(&format!("root{id}"), &real);
        self.dir(&format!("bus/cxl/devices/decoder{id}.0"));
    }

    /// Adds an enabled memdev `mem<id>` of `ram_size` bytes on node 1.
    ///
    /// The memdev sits behind host `0000:<30+id>:00.0`. Its enabled endpoint
    /// `endpoint<port>` hangs off host bridge port `port1` under `root0`, and
    /// the endpoint decoder `decoder<port>.0` starts in mode `none`. The
    /// host bridge decoder `decoder1.0` interleaves at 4096 bytes.
    pub fn cxl_memdev(&self, id: u32, ram_size: u64, port: u32) {
        let host = format!("devices/pci0000:{0:02x}/0000:{0:02x}:00.0", 0x30 + id);
        let memdev = format!("{host}/mem{id}");
        self.file(&format!("{memdev}/ram/size"), &format!("{ram_size:#x}\n"));
        self.file(&format!("{memdev}/numa_node"), "1\n");
        self.file(&format!("{memdev}/firmware_version"), "1.0\n");
        self.bind(&memdev, "bus/cxl/drivers/cxl_mem");
        self.link_device(&format!("mem{id}"), &memdev);

        let bridge = "devices/platform/ACPI0017:00/root0/port1";
        if !self.path("bus/cxl/devices/root0").exists() {
            self.cxl_root(0);
        }
        self.file("bus/cxl/devices/decoder1.0/interleave_granularity", "4096\n");

        let endpoint = format!("{bridge}/endpoint{port}");
        self.dir(&endpoint);
        self.symlink(&format!("{endpoint}/uport"), &memdev);
        self.bind(&endpoint, "bus/cxl/drivers/cxl_port");
        self.link_device(&format!("endpoint{port}"), &endpoint);

        let decoder = format!("bus/cxl/devices/decoder{port}.0");
        self.file(&format!("{decoder}/mode"), "none\n");
        self.file(&format!("{decoder}/dpa_size"), "0x0\n");
    }

    /// Adds region `region<id>` targeting the given endpoint decoders.
    ///
    /// The region is committed when it has targets and is left unbound.
    pub fn cxl_region(&self, id: u32, base: u64, size: u64, decoders: &[&str]) {
        let region = format!("bus/cxl/devices/region{id}");
        self.file(&format!("{region}/resource"), &format!("{base:#x}\n"));
        self.file(&format!("{region}/size"), &format!("{size:#x}\n"));
        self.file(&format!("{region}/interleave_ways"), &format!("{}\n", decoders.len()));
        self.file(&format!("{region}/interleave_granularity"), "4096\n");
        self.file(&format!("{region}/mode"), "ram\n");
        let committed = u8::from(!decoders.is_empty());
        self.file(&format!("{region}/commit"), &format!("{committed}\n"));
        for (position, decoder) in decoders.iter().enumerate() {
            self.file(&format!("{region}/target{position}"), &format!("{decoder}\n"));
        }
    }

    /// Adds `dax<id>.0` under `region<id>`, bound to `driver` (`kmem` or
    /// `device_dax`).
    pub fn dax_device(&self, region: u32, driver: &str) {
        let name = format!("dax{region}.0");
        self.dir(&format!(
            "bus/cxl/devices/region{region}/dax_region{region}/{name}"
        ));
        let device = format!("bus/dax/devices/{name}");
        self.dir(&device);
        self.bind(&device, &format!("bus/dax/drivers/{driver}"));
    }

    fn link_device(&self, name: &str, real: &str) {
        self.symlink(&format!("bus/cxl/devices/{name}"), real);
    }
}
