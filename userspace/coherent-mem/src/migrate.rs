// Copyright 2026 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Range migration between memory tiers
//! OWNERS: @kernel-mm-team
//! STATUS: Functional (host-first)
//! API_STABILITY: Unstable
//! TEST_COVERAGE: Unit tests below + `tests/control_surface.rs`
//!
//! The controller never walks page tables itself. It validates and resolves a
//! request, then hands it to a [`RangeMigrator`], the primitive that actually moves
//! the pages.

use core::fmt;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use log::{info, warn};
use parking_lot::Mutex;

use crate::address_space::AddressSpace;
use crate::error::{Error, Result};
use crate::tier::{NodeId, Tier, TierMap};

/// A virtual range of one process to move onto `node`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct MigrationRequest {
    /// Target process id.
    pub pid: u64,
    /// First virtual address.
    pub start: u64,
    /// Exclusive end address.
    pub end: u64,
    /// Destination node.
    pub node: NodeId,
}

impl fmt::Display for MigrationRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "pid {} {:#x}-{:#x} -> {}", self.pid, self.start, self.end, self.node)
    }
}

/// Primitive that migrates a virtual range of a process.
pub trait RangeMigrator: Send + Sync {
    /// Moves `request.start..request.end` of `request.pid` to `request.node`.
    fn migrate_virtual_range(&self, request: &MigrationRequest) -> std::io::Result<()>;
}

impl<M: RangeMigrator + ?Sized> RangeMigrator for Arc<M> {
    fn migrate_virtual_range(&self, request: &MigrationRequest) -> std::io::Result<()> {
        (**self).migrate_virtual_range(request)
    }
}

/// Forwards requests to a kernel control file as `pid,start,end,node`.
#[derive(Debug, Clone)]
pub struct ControlFileMigrator {
    path: PathBuf,
}

impl ControlFileMigrator {
    /// Targets the control file at `path`.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Control file path.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl RangeMigrator for ControlFileMigrator {
    fn migrate_virtual_range(&self, request: &MigrationRequest) -> std::io::Result<()> {
        let mut file = OpenOptions::new().write(true).truncate(true).open(&self.path)?;
        let line = format!(
            "{},{:#x},{:#x},{}",
            request.pid, request.start, request.end, request.node.0
        );
        file.write_all(line.as_bytes())
    }
}

/// Records requests instead of migrating; used by dry runs and tests.
#[derive(Debug, Default)]
pub struct RecordingMigrator {
    requests: Mutex<Vec<MigrationRequest>>,
}

impl RecordingMigrator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Requests seen so far, oldest first.
    pub fn requests(&self) -> Vec<MigrationRequest> {
        self.requests.lock().clone()
    }
}

impl RangeMigrator for RecordingMigrator {
    fn migrate_virtual_range(&self, request: &MigrationRequest) -> std::io::Result<()> {
        self.requests.lock().push(*request);
        Ok(())
    }
}

/// Validates, resolves and forwards migration requests.
pub struct MigrationController {
    migrator: Box<dyn RangeMigrator>,
    tiers: TierMap,
}

impl MigrationController {
    pub fn new(migrator: Box<dyn RangeMigrator>, tiers: TierMap) -> Self {
        Self { migrator, tiers }
    }

    /// Tier-to-node mapping in use.
    pub fn tiers(&self) -> TierMap {
        self.tiers
    }

    /// Hands `request` to the migration primitive.
    pub fn migrate_range(&self, request: &MigrationRequest) -> Result<()> {
        info!("coherent: migrate {request}");
        self.migrator.migrate_virtual_range(request).map_err(|err| {
            warn!("coherent: migrate {request} failed: {err}");
            Error::Migration(format!("{request}: {err}"))
        })
    }

    /// Migrates the mapping of `space` that contains `addr` to `tier`.
    ///
    /// Returns the request that was issued, or `None` when no mapping contains
    /// `addr`. The address-space lock is released before the primitive runs.
    pub fn resolve_and_migrate(
        &self,
        space: &AddressSpace,
        addr: u64,
        tier: Tier,
    ) -> Result<Option<MigrationRequest>> {
        let Some(range) = space.find(addr) else {
            info!("coherent: pid {} has no mapping at {addr:#x}", space.pid());
            return Ok(None);
        };
        let request = MigrationRequest {
            pid: u64::from(space.pid()),
            start: range.start,
            end: range.end,
            node: self.tiers.node(tier),
        };
        self.migrate_range(&request)?;
        Ok(Some(request))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::address_space::VmRange;

    struct Failing;

    impl RangeMigrator for Failing {
        fn migrate_virtual_range(&self, _: &MigrationRequest) -> std::io::Result<()> {
            Err(std::io::Error::other("busy"))
        }
    }

    fn space() -> AddressSpace {
        let space = AddressSpace::new(9);
        space.map(VmRange::new(0x1000, 0x3000)).unwrap();
        space.map(VmRange::new(0x3000, 0x8000)).unwrap();
        space
    }

    #[test]
    fn resolves_enclosing_mapping() {
        let recorder = Arc::new(RecordingMigrator::new());
        let ctl = MigrationController::new(Box::new(recorder.clone()), TierMap::default());
        let issued = ctl.resolve_and_migrate(&space(), 0x2fff, Tier::Coherent).unwrap();
        let expected = MigrationRequest { pid: 9, start: 0x1000, end: 0x3000, node: NodeId(2) };
        assert_eq!(issued, Some(expected));
        assert_eq!(recorder.requests(), [expected]);
    }

    #[test]
    fn miss_does_not_migrate() {
        let recorder = Arc::new(RecordingMigrator::new());
        let ctl = MigrationController::new(Box::new(recorder.clone()), TierMap::default());
        assert_eq!(ctl.resolve_and_migrate(&space(), 0x8000, Tier::Default).unwrap(), None);
        assert!(recorder.requests().is_empty());
    }

    #[test]
    fn primitive_failure_is_a_migration_error() {
        let ctl = MigrationController::new(Box::new(Failing), TierMap::default());
        let err = ctl.resolve_and_migrate(&space(), 0x1000, Tier::Default).unwrap_err();
        assert!(matches!(err, Error::Migration(_)));
    }

    #[test]
    fn control_file_receives_tuple() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("coherent_debug");
        std::fs::write(&path, "").unwrap();
        let req = MigrationRequest { pid: 100, start: 0x1000, end: 0x2000, node: NodeId(2) };
        ControlFileMigrator::new(&path).migrate_virtual_range(&req).unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "100,0x1000,0x2000,2");
    }
}
