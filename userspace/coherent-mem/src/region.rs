// Copyright 2026 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Bounded registry of coherent regions brought online by this service
//! OWNERS: @kernel-mm-team
//! STATUS: Functional (host-first)
//! API_STABILITY: Unstable
//! TEST_COVERAGE: Unit tests below + `tests/hotplug_lifecycle.rs`
//!
//! INVARIANTS:
//! - Entries correspond 1:1 to regions that were probed and onlined successfully
//! - Only whole, block-aligned regions that fit in the address space are admitted
//! - A batch larger than the remaining capacity is rejected before any block is touched
//! - Single writer: every mutation takes `&mut self`

use log::{error, info, warn};
use serde::Deserialize;

use crate::discovery::Discovery;
use crate::error::{Error, Result};
use crate::hotplug::{BlockState, HotplugController};
use crate::store::BlockStateStore;

/// Default number of regions a registry tracks.
pub const DEFAULT_MAX_REGIONS: usize = 100;

/// Physical range of a coherent memory region.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RegionDescriptor {
    /// Physical base address.
    pub base: u64,
    /// Size in bytes.
    pub size: u64,
}

impl RegionDescriptor {
    /// Creates a descriptor for `[base, base + size)`.
    pub const fn new(base: u64, size: u64) -> Self {
        Self { base, size }
    }

    /// Exclusive end address.
    pub fn end(&self) -> u64 {
        self.base.saturating_add(self.size)
    }
}

/// Outcome of a registration batch.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RegistrationReport {
    /// Regions probed and onlined.
    pub onlined: usize,
    /// Regions skipped after a probe or online failure.
    pub failed: usize,
}

/// Owns the list of online regions and the controller used to change them.
pub struct RegionRegistry<S> {
    hotplug: HotplugController<S>,
    regions: Vec<RegionDescriptor>,
    capacity: usize,
}

impl<S: BlockStateStore> RegionRegistry<S> {
    /// Creates an empty registry able to track `capacity` regions.
    pub fn new(hotplug: HotplugController<S>, capacity: usize) -> Self {
        Self { hotplug, regions: Vec::with_capacity(capacity.min(DEFAULT_MAX_REGIONS)), capacity }
    }

    /// Borrows the hotplug controller.
    pub fn hotplug(&self) -> &HotplugController<S> {
        &self.hotplug
    }

    /// Regions currently online, in registration order.
    pub fn regions(&self) -> &[RegionDescriptor] {
        &self.regions
    }

    /// Maximum number of tracked regions.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of tracked regions.
    pub fn len(&self) -> usize {
        self.regions.len()
    }

    /// Returns `true` when no region is online.
    pub fn is_empty(&self) -> bool {
        self.regions.is_empty()
    }

    /// Probes and onlines each descriptor in order.
    ///
    /// A descriptor that fails is logged and skipped; the rest of the batch still runs.
    /// Only [`Error::CapacityExceeded`] fails the whole batch, and it does so before
    /// any block is touched.
    pub fn register_all(&mut self, descriptors: &[RegionDescriptor]) -> Result<RegistrationReport> {
        register_into(&self.hotplug, &mut self.regions, self.capacity, descriptors)
    }

    /// Discovers regions and registers them with auto-online suspended.
    pub fn online_discovered(&mut self, discovery: &dyn Discovery) -> Result<RegistrationReport> {
        let hotplug = &self.hotplug;
        let regions = &mut self.regions;
        let capacity = self.capacity;
        hotplug.with_auto_online_suspended(|| {
            let descriptors = discovery.discover()?;
            info!("coherent: discovered {} region(s)", descriptors.len());
            register_into(hotplug, regions, capacity, &descriptors)
        })
    }

    /// Offlines every tracked region and empties the registry.
    ///
    /// Failures are logged per region; teardown always clears the registry.
    pub fn teardown_all(&mut self) {
        for region in self.regions.drain(..) {
            match self.hotplug.set_state(region.base, region.size, BlockState::Offline) {
                Ok(()) => info!(
                    "coherent: offlined region {:#x} size {:#x}",
                    region.base, region.size
                ),
                Err(err) => error!(
                    "coherent: offline of region {:#x} size {:#x} failed: {err}",
                    region.base, region.size
                ),
            }
        }
    }
}

fn register_into<S: BlockStateStore>(
    hotplug: &HotplugController<S>,
    regions: &mut Vec<RegionDescriptor>,
    capacity: usize,
    descriptors: &[RegionDescriptor],
) -> Result<RegistrationReport> {
    let requested = regions.len() + descriptors.len();
    if requested > capacity {
        error!("coherent: {requested} regions exceed capacity {capacity}");
        return Err(Error::CapacityExceeded { requested, capacity });
    }

    let mut report = RegistrationReport::default();
    for region in descriptors {
        info!("coherent: coherent memory start {:#x} size {:#x}", region.base, region.size);
        match online_region(hotplug, region) {
            Ok(()) => {
                regions.push(*region);
                report.onlined += 1;
            }
            Err(err) => {
                warn!("coherent: region {:#x} skipped: {err}", region.base);
                report.failed += 1;
            }
        }
    }
    Ok(report)
}

fn online_region<S: BlockStateStore>(
    hotplug: &HotplugController<S>,
    region: &RegionDescriptor,
) -> Result<()> {
    let reject = |what: &str| {
        Error::Configuration(format!(
            "region {:#x} size {:#x} {what}",
            region.base, region.size
        ))
    };
    if region.size == 0 {
        return Err(reject("has zero size"));
    }
    if region.base.checked_add(region.size).is_none() {
        return Err(reject("wraps the address space"));
    }
    let block = hotplug.block_size()?;
    if region.size < block {
        return Err(reject(&format!("is smaller than block size {block:#x}")));
    }
    if region.base % block != 0 || region.size % block != 0 {
        return Err(reject(&format!("is not aligned to block size {block:#x}")));
    }
    hotplug.probe(region.base, region.size)?;
    hotplug.set_state(region.base, region.size, BlockState::OnlineMovable)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::discovery::StaticDiscovery;
    use crate::store::{MemoryStore, StoreKey};

    const BLOCK: u64 = 0x100000;

    fn registry(capacity: usize) -> RegionRegistry<MemoryStore> {
        RegionRegistry::new(HotplugController::new(MemoryStore::new(BLOCK)), capacity)
    }

    #[test]
    fn partial_success_keeps_going() {
        let mut reg = registry(8);
        reg.hotplug().store().fail_writes_to(StoreKey::BlockState(0x21));
        let report = reg
            .register_all(&[
                RegionDescriptor::new(0x1000000, 2 * BLOCK),
                RegionDescriptor::new(0x2000000, 2 * BLOCK),
                RegionDescriptor::new(0x3000000, 2 * BLOCK),
            ])
            .unwrap();
        assert_eq!(report, RegistrationReport { onlined: 2, failed: 1 });
        assert_eq!(
            reg.regions(),
            [
                RegionDescriptor::new(0x1000000, 2 * BLOCK),
                RegionDescriptor::new(0x3000000, 2 * BLOCK),
            ]
        );
    }

    #[test]
    fn zero_sized_region_is_skipped() {
        let mut reg = registry(4);
        let report = reg.register_all(&[RegionDescriptor::new(0x1000000, 0)]).unwrap();
        assert_eq!(report.failed, 1);
        assert!(reg.is_empty());
    }

    #[test]
    fn misshapen_regions_touch_no_block() {
        let mut reg = registry(8);
        let report = reg
            .register_all(&[
                RegionDescriptor::new(u64::MAX - BLOCK + 1, 2 * BLOCK),
                RegionDescriptor::new(0x1000000, BLOCK / 2),
                RegionDescriptor::new(0x1000000 + BLOCK / 2, BLOCK),
                RegionDescriptor::new(0x1000000, BLOCK + BLOCK / 2),
            ])
            .unwrap();
        assert_eq!(report, RegistrationReport { onlined: 0, failed: 4 });
        assert!(reg.is_empty());
        assert!(reg.hotplug().store().writes().is_empty());
    }

    #[test]
    fn capacity_counts_already_registered_regions() {
        let mut reg = registry(2);
        reg.register_all(&[RegionDescriptor::new(0, BLOCK)]).unwrap();
        let err = reg
            .register_all(&[
                RegionDescriptor::new(BLOCK, BLOCK),
                RegionDescriptor::new(2 * BLOCK, BLOCK),
            ])
            .unwrap_err();
        assert!(matches!(err, Error::CapacityExceeded { requested: 3, capacity: 2 }));
        assert_eq!(reg.len(), 1);
    }

    #[test]
    fn discovery_runs_with_auto_online_suspended() {
        let mut reg = registry(4);
        let discovery = StaticDiscovery::new(vec![RegionDescriptor::new(0x1000000, BLOCK)]);
        reg.online_discovered(&discovery).unwrap();
        let writes = reg.hotplug().store().writes();
        assert_eq!(writes.first(), Some(&(StoreKey::AutoOnline, "offline".to_string())));
        assert_eq!(writes.last(), Some(&(StoreKey::AutoOnline, "online".to_string())));
        assert_eq!(reg.len(), 1);
    }
}
