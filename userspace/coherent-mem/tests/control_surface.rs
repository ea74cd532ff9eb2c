// Copyright 2026 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Integration tests for the migration control surface
//! OWNERS: @kernel-mm-team
//! STATUS: Functional
//! API_STABILITY: Unstable
//! TEST_COVERAGE: 6 integration tests
//!
//! TEST_SCOPE:
//!   - Numeric commands resolved against a procfs-backed address space
//!   - Text commands in lenient and strict mode
//!   - Usage text and the control-file migrator
//!
//! TEST_SCENARIOS:
//!   - ioctl_codes_pick_tiers(): code 1 -> coherent node, code 2 -> default node
//!   - end_address_resolves_to_next_mapping(): half-open containment
//!   - repeated_ioctl_is_idempotent_on_the_request(): same request issued twice
//!   - text_write_forwards_tuple(): lenient parsing, consumed byte count
//!   - strict_mode_rejects_before_migrating(): nothing reaches the migrator
//!   - control_file_end_to_end(): text command lands in the control file

use std::sync::Arc;

use coherent_mem::{
    AddressSpaceProvider, ControlFileMigrator, ControlSurface, Error, MigrationController,
    MigrationRequest, NodeId, ParseMode, ProcMapsProvider, RecordingMigrator, TierMap, USAGE,
};

const MAPS: &str = "\
00400000-00452000 r-xp 00000000 08:02 173521 /usr/bin/app
00452000-00500000 rw-p 00052000 08:02 173521 /usr/bin/app
7f0000000000-7f0000200000 rw-p 00000000 00:00 0 [coherent]
";

fn surface(mode: ParseMode) -> (Arc<RecordingMigrator>, ControlSurface) {
    let recorder = Arc::new(RecordingMigrator::new());
    let migration = MigrationController::new(Box::new(recorder.clone()), TierMap::default());
    (recorder, ControlSurface::new(migration, mode))
}

fn provider() -> (tempfile::TempDir, ProcMapsProvider) {
    let root = tempfile::tempdir().unwrap();
    std::fs::create_dir(root.path().join("4242")).unwrap();
    std::fs::write(root.path().join("4242/maps"), MAPS).unwrap();
    let provider = ProcMapsProvider::new(root.path());
    (root, provider)
}

#[test]
fn ioctl_codes_pick_tiers() {
    let (_root, provider) = provider();
    let space = provider.address_space(4242).unwrap();
    let (recorder, surface) = surface(ParseMode::Lenient);

    surface.ioctl(&space, 1, 0x7f0000001000).unwrap();
    surface.ioctl(&space, 2, 0x7f0000001000).unwrap();
    let err = surface.ioctl(&space, 3, 0x7f0000001000).unwrap_err();
    assert!(matches!(err, Error::InvalidCommand(_)));

    let nodes: Vec<NodeId> = recorder.requests().iter().map(|r| r.node).collect();
    assert_eq!(nodes, [NodeId(2), NodeId(0)]);
}

#[test]
fn end_address_resolves_to_next_mapping() {
    let (_root, provider) = provider();
    let space = provider.address_space(4242).unwrap();
    let (_, surface) = surface(ParseMode::Lenient);

    let issued = surface.ioctl(&space, 1, 0x00452000).unwrap().unwrap();
    assert_eq!((issued.start, issued.end), (0x00452000, 0x00500000));
    assert_eq!(surface.ioctl(&space, 1, 0x7f0000200000).unwrap(), None);
}

#[test]
fn repeated_ioctl_is_idempotent_on_the_request() {
    let (_root, provider) = provider();
    let space = provider.address_space(4242).unwrap();
    let (recorder, surface) = surface(ParseMode::Lenient);

    surface.ioctl(&space, 1, 0x00400010).unwrap();
    surface.ioctl(&space, 1, 0x00400010).unwrap();
    let requests = recorder.requests();
    assert_eq!(requests.len(), 2);
    assert_eq!(requests[0], requests[1]);
    assert_eq!(
        requests[0],
        MigrationRequest { pid: 4242, start: 0x00400000, end: 0x00452000, node: NodeId(2) }
    );
}

#[test]
fn text_write_forwards_tuple() {
    let (recorder, surface) = surface(ParseMode::Lenient);
    assert_eq!(surface.write(b"100,4096,8192,2").unwrap(), 15);
    assert_eq!(surface.write(b"7\n").unwrap(), 2);
    assert_eq!(surface.write(&[b'1'; 300]).unwrap(), 99);
    assert_eq!(surface.usage(), USAGE);
    assert_eq!(USAGE, "Expected Value: <pid,vaddr,size,nid>\n");

    let requests = recorder.requests();
    assert_eq!(
        requests[0],
        MigrationRequest { pid: 100, start: 4096, end: 8192, node: NodeId(2) }
    );
    assert_eq!(requests[1], MigrationRequest { pid: 7, start: 0, end: 0, node: NodeId(0) });
    assert_eq!(requests.len(), 3);
}

#[test]
fn strict_mode_rejects_before_migrating() {
    let (recorder, surface) = surface(ParseMode::Strict);
    assert!(matches!(surface.write(b"7"), Err(Error::InvalidCommand(_))));
    assert!(matches!(surface.write(b"1,0x2000,0x1000,2"), Err(Error::InvalidCommand(_))));
    assert!(recorder.requests().is_empty());
    assert_eq!(surface.write(b"1,0x1000,0x2000,2").unwrap(), 17);
    assert_eq!(recorder.requests().len(), 1);
}

#[test]
fn control_file_end_to_end() {
    let dir = tempfile::tempdir().unwrap();
    let file = dir.path().join("coherent_debug");
    std::fs::write(&file, "").unwrap();
    let migration =
        MigrationController::new(Box::new(ControlFileMigrator::new(&file)), TierMap::default());
    let surface = ControlSurface::new(migration, ParseMode::Lenient);

    surface.write(b"55,0x10000,0x20000,1").unwrap();
    assert_eq!(std::fs::read_to_string(&file).unwrap(), "55,0x10000,0x20000,1");

    std::fs::remove_file(&file).unwrap();
    assert!(matches!(surface.write(b"55,1,2,1"), Err(Error::Migration(_))));
}
