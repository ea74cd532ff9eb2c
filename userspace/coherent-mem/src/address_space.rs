// Copyright 2026 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Process address-space snapshots used to resolve a virtual address to the mapping
//! that contains it.
//!
//! The map lives behind a `parking_lot::RwLock`; lookups take the read side and copy
//! the matching range out, so no lock is held once a lookup returns.

use std::collections::BTreeMap;
use std::fs;
use std::path::PathBuf;
use std::sync::Arc;

use log::debug;
use parking_lot::RwLock;

use crate::error::{Error, Result};

/// Default procfs mount point.
pub const DEFAULT_PROCFS_ROOT: &str = "/proc";

/// Half-open virtual range `[start, end)`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct VmRange {
    /// First address.
    pub start: u64,
    /// Exclusive end.
    pub end: u64,
}

impl VmRange {
    /// Creates `[start, end)`.
    pub const fn new(start: u64, end: u64) -> Self {
        Self { start, end }
    }

    /// Returns `true` when `start <= addr < end`.
    pub fn contains(&self, addr: u64) -> bool {
        self.start <= addr && addr < self.end
    }

    /// Length in bytes.
    pub fn len(&self) -> u64 {
        self.end.saturating_sub(self.start)
    }

    /// Returns `true` for an empty range.
    pub fn is_empty(&self) -> bool {
        self.start >= self.end
    }

    fn overlaps(&self, other: &VmRange) -> bool {
        self.start < other.end && other.start < self.end
    }
}

/// Mappings of one process, keyed by start address.
#[derive(Debug)]
pub struct AddressSpace {
    pid: u32,
    map: RwLock<BTreeMap<u64, VmRange>>,
}

impl AddressSpace {
    /// Creates an empty address space for `pid`.
    pub fn new(pid: u32) -> Self {
        Self { pid, map: RwLock::new(BTreeMap::new()) }
    }

    /// Process id owning this address space.
    pub fn pid(&self) -> u32 {
        self.pid
    }

    /// Inserts `range`; empty or overlapping ranges are rejected.
    pub fn map(&self, range: VmRange) -> Result<()> {
        if range.is_empty() {
            return Err(Error::Configuration(format!(
                "empty mapping {:#x}-{:#x}",
                range.start, range.end
            )));
        }
        let mut map = self.map.write();
        let clash = map
            .range(..range.end)
            .next_back()
            .map(|(_, existing)| *existing)
            .filter(|existing| existing.overlaps(&range));
        if let Some(existing) = clash {
            return Err(Error::Configuration(format!(
                "mapping {:#x}-{:#x} overlaps {:#x}-{:#x}",
                range.start, range.end, existing.start, existing.end
            )));
        }
        map.insert(range.start, range);
        Ok(())
    }

    /// Removes the mapping starting at `start`.
    pub fn unmap(&self, start: u64) -> Option<VmRange> {
        self.map.write().remove(&start)
    }

    /// Returns the first mapping, in address order, containing `addr`.
    pub fn find(&self, addr: u64) -> Option<VmRange> {
        let map = self.map.read();
        map.values().find(|range| range.contains(addr)).copied()
    }

    /// Snapshot of every mapping in address order.
    pub fn ranges(&self) -> Vec<VmRange> {
        self.map.read().values().copied().collect()
    }

    /// Builds a snapshot from `/proc/<pid>/maps` text.
    ///
    /// Only the leading `start-end` column is used. Lines that do not parse are
    /// rejected rather than skipped.
    pub fn from_proc_maps(pid: u32, text: &str) -> Result<Self> {
        let space = Self::new(pid);
        for (lineno, line) in text.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            let range = parse_maps_line(line).ok_or_else(|| {
                Error::Configuration(format!("maps line {}: {line:?}", lineno + 1))
            })?;
            space.map(range)?;
        }
        debug!("coherent: pid {pid} has {} mapping(s)", space.map.read().len());
        Ok(space)
    }
}

fn parse_maps_line(line: &str) -> Option<VmRange> {
    let span = line.split_whitespace().next()?;
    let (start, end) = span.split_once('-')?;
    let start = u64::from_str_radix(start, 16).ok()?;
    let end = u64::from_str_radix(end, 16).ok()?;
    Some(VmRange::new(start, end))
}

/// Hands out address spaces by process id.
pub trait AddressSpaceProvider: Send + Sync {
    /// Returns the address space of `pid`.
    fn address_space(&self, pid: u32) -> Result<Arc<AddressSpace>>;
}

/// Reads address spaces from `<procfs_root>/<pid>/maps`.
#[derive(Debug, Clone)]
pub struct ProcMapsProvider {
    procfs_root: PathBuf,
}

impl ProcMapsProvider {
    /// Creates a provider over `procfs_root`.
    pub fn new(procfs_root: impl Into<PathBuf>) -> Self {
        Self { procfs_root: procfs_root.into() }
    }
}

impl Default for ProcMapsProvider {
    fn default() -> Self {
        Self::new(DEFAULT_PROCFS_ROOT)
    }
}

impl AddressSpaceProvider for ProcMapsProvider {
    fn address_space(&self, pid: u32) -> Result<Arc<AddressSpace>> {
        let text = fs::read_to_string(self.procfs_root.join(pid.to_string()).join("maps"))?;
        Ok(Arc::new(AddressSpace::from_proc_maps(pid, &text)?))
    }
}
