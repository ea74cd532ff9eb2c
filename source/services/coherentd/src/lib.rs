// Copyright 2026 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

#![forbid(unsafe_code)]

//! CONTEXT: Coherent memory daemon: onlines coherent regions at start, serves the
//! migration control protocol on a Unix socket, offlines the regions at shutdown
//! OWNERS: @kernel-mm-team
//! STATUS: Functional (host-first)
//! API_STABILITY: Unstable
//! TEST_COVERAGE: `tests/service_loop.rs`

mod std_server;
pub use std_server::*;
