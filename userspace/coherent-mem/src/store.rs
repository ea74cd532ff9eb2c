// Copyright 2026 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Key/value view of the memory-hotplug block-state interface
//! OWNERS: @kernel-mm-team
//! STATUS: Functional (host-first)
//! API_STABILITY: Unstable
//! TEST_COVERAGE: Unit tests below; sysfs layout covered in `tests/hotplug_lifecycle.rs`
//!
//! The hotplug core never caches block state: every decision reads or writes the
//! store. `SysfsStore` talks to `/sys/devices/system/memory` (or any directory laid
//! out the same way); `MemoryStore` emulates it in memory and records writes.

use std::collections::HashMap;
use std::fmt;
use std::fs::OpenOptions;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use parking_lot::Mutex;

/// Default root of the memory-hotplug sysfs tree.
pub const DEFAULT_SYSFS_ROOT: &str = "/sys/devices/system/memory";

const AUTO_ONLINE_BLOCKS: &str = "auto_online_blocks";
const BLOCK_SIZE_BYTES: &str = "block_size_bytes";
const MEMORY_PROBE: &str = "probe";

/// Keys understood by a [`BlockStateStore`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum StoreKey {
    /// Global auto-online policy switch (`online` / `offline`).
    AutoOnline,
    /// Global memory block size, hex encoded.
    BlockSize,
    /// Probe-register action; writing a hex address creates the block containing it.
    Probe,
    /// Lifecycle state of the block with the given index.
    BlockState(u64),
}

impl StoreKey {
    /// Path of the key relative to the store root.
    pub fn relative_path(&self) -> PathBuf {
        match self {
            Self::AutoOnline => PathBuf::from(AUTO_ONLINE_BLOCKS),
            Self::BlockSize => PathBuf::from(BLOCK_SIZE_BYTES),
            Self::Probe => PathBuf::from(MEMORY_PROBE),
            Self::BlockState(index) => Path::new(&format!("memory{index}")).join("state"),
        }
    }
}

impl fmt::Display for StoreKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::AutoOnline => f.write_str(AUTO_ONLINE_BLOCKS),
            Self::BlockSize => f.write_str(BLOCK_SIZE_BYTES),
            Self::Probe => f.write_str(MEMORY_PROBE),
            Self::BlockState(index) => write!(f, "memory{index}/state"),
        }
    }
}

/// Text-valued store backing the hotplug state machine.
pub trait BlockStateStore: Send + Sync {
    /// Reads the current value of `key`.
    fn read(&self, key: StoreKey) -> io::Result<String>;

    /// Writes `value` to `key`.
    fn write(&self, key: StoreKey, value: &str) -> io::Result<()>;
}

impl<S: BlockStateStore + ?Sized> BlockStateStore for std::sync::Arc<S> {
    fn read(&self, key: StoreKey) -> io::Result<String> {
        (**self).read(key)
    }

    fn write(&self, key: StoreKey, value: &str) -> io::Result<()> {
        (**self).write(key, value)
    }
}

/// Store backed by the sysfs memory-hotplug files.
#[derive(Debug, Clone)]
pub struct SysfsStore {
    root: PathBuf,
}

impl SysfsStore {
    /// Creates a store rooted at `root`.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Returns the store root.
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path(&self, key: StoreKey) -> PathBuf {
        self.root.join(key.relative_path())
    }
}

impl Default for SysfsStore {
    fn default() -> Self {
        Self::new(DEFAULT_SYSFS_ROOT)
    }
}

impl BlockStateStore for SysfsStore {
    fn read(&self, key: StoreKey) -> io::Result<String> {
        std::fs::read_to_string(self.path(key))
    }

    fn write(&self, key: StoreKey, value: &str) -> io::Result<()> {
        // sysfs attributes exist up front; never create them.
        let mut file = OpenOptions::new().write(true).truncate(true).open(self.path(key))?;
        file.write_all(value.as_bytes())
    }
}

#[derive(Default)]
struct MemoryInner {
    values: HashMap<StoreKey, String>,
    writes: Vec<(StoreKey, String)>,
    failing: Vec<StoreKey>,
}

/// In-memory store emulating the sysfs semantics the hotplug core relies on.
///
/// Probing an address creates the containing block in the `offline` state; writing
/// the state of a block that was never probed fails with `NotFound`, like a missing
/// sysfs attribute. Every successful write is journaled in order.
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<MemoryInner>,
}

impl MemoryStore {
    /// Creates a store advertising `block_size` bytes per memory block.
    pub fn new(block_size: u64) -> Self {
        let store = Self::default();
        {
            let mut inner = store.inner.lock();
            inner.values.insert(StoreKey::BlockSize, format!("{block_size:x}\n"));
            inner.values.insert(StoreKey::AutoOnline, "online\n".to_string());
        }
        store
    }

    /// Makes every subsequent write to `key` fail.
    pub fn fail_writes_to(&self, key: StoreKey) {
        self.inner.lock().failing.push(key);
    }

    /// Drops all injected failures.
    pub fn clear_failures(&self) {
        self.inner.lock().failing.clear();
    }

    /// Removes a value, making subsequent reads of `key` fail.
    pub fn remove(&self, key: StoreKey) {
        self.inner.lock().values.remove(&key);
    }

    /// Returns the journal of successful writes in issue order.
    pub fn writes(&self) -> Vec<(StoreKey, String)> {
        self.inner.lock().writes.clone()
    }

    /// Forgets the write journal.
    pub fn clear_writes(&self) {
        self.inner.lock().writes.clear();
    }

    /// Returns the trimmed value of `key`, if present.
    pub fn value(&self, key: StoreKey) -> Option<String> {
        self.inner.lock().values.get(&key).map(|v| v.trim().to_string())
    }

    /// Returns the state of block `index`, if it exists.
    pub fn block_state(&self, index: u64) -> Option<String> {
        self.value(StoreKey::BlockState(index))
    }

    fn block_size(inner: &MemoryInner) -> Option<u64> {
        let raw = inner.values.get(&StoreKey::BlockSize)?;
        u64::from_str_radix(raw.trim().trim_start_matches("0x"), 16).ok().filter(|&b| b != 0)
    }
}

impl BlockStateStore for MemoryStore {
    fn read(&self, key: StoreKey) -> io::Result<String> {
        self.inner
            .lock()
            .values
            .get(&key)
            .cloned()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, format!("{key} not present")))
    }

    fn write(&self, key: StoreKey, value: &str) -> io::Result<()> {
        let mut inner = self.inner.lock();
        if inner.failing.contains(&key) {
            return Err(io::Error::new(io::ErrorKind::PermissionDenied, format!("{key} rejected")));
        }
        match key {
            StoreKey::Probe => {
                let addr = value.trim().trim_start_matches("0x");
                let addr = u64::from_str_radix(addr, 16)
                    .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "bad probe address"))?;
                let block = Self::block_size(&inner)
                    .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "no block size"))?;
                inner
                    .values
                    .entry(StoreKey::BlockState(addr / block))
                    .or_insert_with(|| "offline\n".to_string());
            }
            StoreKey::BlockState(_) => {
                let state = inner.values.get_mut(&key).ok_or_else(|| {
                    io::Error::new(io::ErrorKind::NotFound, format!("{key} not present"))
                })?;
                *state = format!("{value}\n");
            }
            StoreKey::AutoOnline | StoreKey::BlockSize => {
                inner.values.insert(key, format!("{value}\n"));
            }
        }
        inner.writes.push((key, value.to_string()));
        Ok(())
    }
}
