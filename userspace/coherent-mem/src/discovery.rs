// Copyright 2026 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Sources of coherent region descriptors.
//!
//! `DeviceTreeDiscovery` reads an unpacked device tree (`/proc/device-tree`): every
//! node whose `compatible` list names the configured device points at its memory
//! through a `memory-region` phandle, and the target node's `reg` carries the base
//! and size as two big-endian 64-bit cells. A node with broken metadata is logged and
//! skipped; the remaining nodes are still reported.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use log::{debug, warn};

use crate::error::{Error, Result};
use crate::region::RegionDescriptor;

/// Default unpacked device-tree location.
pub const DEFAULT_DEVICE_TREE_ROOT: &str = "/proc/device-tree";
/// Compatible string of coherent memory devices.
pub const DEFAULT_COMPATIBLE: &str = "ibm,memory-device";

const PROP_COMPATIBLE: &str = "compatible";
const PROP_MEMORY_REGION: &str = "memory-region";
const PROP_PHANDLE: &str = "phandle";
const PROP_LINUX_PHANDLE: &str = "linux,phandle";
const PROP_REG: &str = "reg";

/// Supplies region descriptors to the registry.
pub trait Discovery {
    /// Returns every usable descriptor, in discovery order.
    fn discover(&self) -> Result<Vec<RegionDescriptor>>;
}

/// Fixed list of regions, typically from the service configuration.
#[derive(Debug, Clone, Default)]
pub struct StaticDiscovery {
    regions: Vec<RegionDescriptor>,
}

impl StaticDiscovery {
    /// Wraps `regions`.
    pub fn new(regions: Vec<RegionDescriptor>) -> Self {
        Self { regions }
    }
}

impl Discovery for StaticDiscovery {
    fn discover(&self) -> Result<Vec<RegionDescriptor>> {
        Ok(self.regions.clone())
    }
}

/// Discovery over an unpacked device tree.
#[derive(Debug, Clone)]
pub struct DeviceTreeDiscovery {
    root: PathBuf,
    compatible: String,
}

struct DtNode {
    path: PathBuf,
    compatible: bool,
}

impl DeviceTreeDiscovery {
    /// Creates a discovery rooted at `root` matching nodes compatible with `compatible`.
    pub fn new(root: impl Into<PathBuf>, compatible: impl Into<String>) -> Self {
        Self { root: root.into(), compatible: compatible.into() }
    }

    fn walk(
        &self,
        dir: &Path,
        nodes: &mut Vec<DtNode>,
        phandles: &mut HashMap<u32, PathBuf>,
    ) -> Result<()> {
        let compatible = match fs::read(dir.join(PROP_COMPATIBLE)) {
            Ok(raw) => raw
                .split(|b| *b == 0)
                .any(|entry| entry == self.compatible.as_bytes()),
            Err(_) => false,
        };
        for prop in [PROP_PHANDLE, PROP_LINUX_PHANDLE] {
            if let Ok(raw) = fs::read(dir.join(prop)) {
                if let Some(handle) = be_u32(&raw) {
                    phandles.entry(handle).or_insert_with(|| dir.to_path_buf());
                }
            }
        }
        nodes.push(DtNode { path: dir.to_path_buf(), compatible });

        let mut children = Vec::new();
        for entry in fs::read_dir(dir)? {
            let entry = entry?;
            if entry.file_type()?.is_dir() {
                children.push(entry.path());
            }
        }
        children.sort();
        for child in children {
            self.walk(&child, nodes, phandles)?;
        }
        Ok(())
    }

    fn resolve(&self, node: &Path, phandles: &HashMap<u32, PathBuf>) -> Result<RegionDescriptor> {
        let raw = fs::read(node.join(PROP_MEMORY_REGION)).map_err(|_| {
            Error::Configuration(format!("{}: memory-region property not found", node.display()))
        })?;
        let handle = be_u32(&raw).ok_or_else(|| {
            Error::Configuration(format!("{}: memory-region property malformed", node.display()))
        })?;
        let target = phandles.get(&handle).ok_or_else(|| {
            Error::Configuration(format!("{}: phandle {handle:#x} not found", node.display()))
        })?;
        let reg = fs::read(target.join(PROP_REG)).map_err(|_| {
            Error::Configuration(format!("{}: reg property not found", target.display()))
        })?;
        match (be_u64(&reg, 0), be_u64(&reg, 8)) {
            (Some(base), Some(size)) => Ok(RegionDescriptor::new(base, size)),
            _ => Err(Error::Configuration(format!(
                "{}: reg property too short ({} bytes)",
                target.display(),
                reg.len()
            ))),
        }
    }
}

impl Discovery for DeviceTreeDiscovery {
    fn discover(&self) -> Result<Vec<RegionDescriptor>> {
        let mut nodes = Vec::new();
        let mut phandles = HashMap::new();
        self.walk(&self.root, &mut nodes, &mut phandles)?;

        let mut regions = Vec::new();
        for node in nodes.iter().filter(|node| node.compatible) {
            match self.resolve(&node.path, &phandles) {
                Ok(region) => {
                    debug!(
                        "coherent: {} -> {:#x}+{:#x}",
                        node.path.display(),
                        region.base,
                        region.size
                    );
                    regions.push(region);
                }
                Err(err) => warn!("coherent: skipping device node: {err}"),
            }
        }
        Ok(regions)
    }
}

fn be_u32(raw: &[u8]) -> Option<u32> {
    raw.get(..4).map(|b| u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
}

fn be_u64(raw: &[u8], at: usize) -> Option<u64> {
    let bytes: [u8; 8] = raw.get(at..at + 8)?.try_into().ok()?;
    Some(u64::from_be_bytes(bytes))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_prop(dir: &Path, name: &str, bytes: &[u8]) {
        fs::create_dir_all(dir).unwrap();
        fs::write(dir.join(name), bytes).unwrap();
    }

    fn reg(base: u64, size: u64) -> Vec<u8> {
        let mut out = base.to_be_bytes().to_vec();
        out.extend_from_slice(&size.to_be_bytes());
        out
    }

    #[test]
    fn follows_memory_region_phandles() {
        let tree = tempfile::tempdir().unwrap();
        let root = tree.path();
        write_prop(&root.join("reserved-memory/mem@1000000"), "phandle", &0x11u32.to_be_bytes());
        write_prop(&root.join("reserved-memory/mem@1000000"), "reg", &reg(0x1000000, 0x400000));
        write_prop(&root.join("gpu@0"), "compatible", b"vendor,other\0ibm,memory-device\0");
        write_prop(&root.join("gpu@0"), "memory-region", &0x11u32.to_be_bytes());

        let found = DeviceTreeDiscovery::new(root, DEFAULT_COMPATIBLE).discover().unwrap();
        assert_eq!(found, [RegionDescriptor::new(0x1000000, 0x400000)]);
    }

    #[test]
    fn broken_node_is_skipped() {
        let tree = tempfile::tempdir().unwrap();
        let root = tree.path();
        write_prop(&root.join("a-dev"), "compatible", b"ibm,memory-device\0");
        write_prop(&root.join("b-dev"), "compatible", b"ibm,memory-device\0");
        write_prop(&root.join("b-dev"), "memory-region", &7u32.to_be_bytes());
        write_prop(&root.join("mem"), "linux,phandle", &7u32.to_be_bytes());
        write_prop(&root.join("mem"), "reg", &reg(0x2000000, 0x100000));

        let found = DeviceTreeDiscovery::new(root, DEFAULT_COMPATIBLE).discover().unwrap();
        assert_eq!(found, [RegionDescriptor::new(0x2000000, 0x100000)]);
    }

    #[test]
    fn short_reg_is_a_configuration_error() {
        let tree = tempfile::tempdir().unwrap();
        let root = tree.path();
        write_prop(&root.join("mem"), "phandle", &1u32.to_be_bytes());
        write_prop(&root.join("mem"), "reg", &[0u8; 12]);
        write_prop(&root.join("dev"), "memory-region", &1u32.to_be_bytes());
        let disc = DeviceTreeDiscovery::new(root, DEFAULT_COMPATIBLE);
        let mut phandles = HashMap::new();
        phandles.insert(1, root.join("mem"));
        assert!(matches!(disc.resolve(&root.join("dev"), &phandles), Err(Error::Configuration(_))));
    }
}
