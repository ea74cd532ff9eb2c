// Copyright 2026 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Coherent memory hotplug, tiered fault allocation and range migration control
//! OWNERS: @kernel-mm-team
//! STATUS: Functional (host-first)
//! API_STABILITY: Unstable
//! TEST_COVERAGE: Host unit tests + integration tests in `tests/`
//!
//! PUBLIC API:
//!   - BlockStateStore / SysfsStore / MemoryStore: memory-block key/value store
//!   - HotplugController: probe, ordered state transitions, auto-online suspension
//!   - RegionRegistry: bounded registry of online coherent regions
//!   - Discovery / StaticDiscovery / DeviceTreeDiscovery: region descriptor sources
//!   - FaultAllocator / Mapping / Page: fault-driven interleaved allocation + safe drain
//!   - MigrationController / AddressSpace: range migration between tiers
//!   - ControlSurface / protocol: text + numeric control commands and their wire framing
//!   - Config: TOML configuration
//!
//! DEPENDENCIES:
//!   - log: diagnostics
//!   - parking_lot: mapping and address-space locks
//!   - serde + toml: configuration
//!   - thiserror: error taxonomy
//!
//! INVARIANTS:
//! - Registry entries correspond 1:1 to regions currently online
//! - Probe requests ascend, block state writes descend
//! - A tracked page is released exactly once, only after it left its mapping context

#![forbid(unsafe_code)]

pub mod address_space;
pub mod config;
pub mod control;
pub mod discovery;
pub mod error;
pub mod fault;
pub mod hotplug;
pub mod migrate;
pub mod page;
pub mod protocol;
pub mod region;
pub mod store;
pub mod tier;

pub use address_space::{AddressSpace, AddressSpaceProvider, ProcMapsProvider, VmRange};
pub use config::Config;
pub use control::{ControlCommand, ControlSurface, ParseMode, USAGE};
pub use discovery::{DeviceTreeDiscovery, Discovery, StaticDiscovery};
pub use error::{Error, Result};
pub use fault::{FaultAllocator, FaultStats, Mapping, MappingState, VmFault};
pub use hotplug::{BlockState, HotplugController};
pub use migrate::{
    ControlFileMigrator, MigrationController, MigrationRequest, RangeMigrator, RecordingMigrator,
};
pub use page::{AllocPolicy, Page, PageSource, SimulatedNodes};
pub use region::{RegionDescriptor, RegionRegistry, RegistrationReport};
pub use store::{BlockStateStore, MemoryStore, StoreKey, SysfsStore};
pub use tier::{NodeId, Tier, TierMap, TierSelector};
