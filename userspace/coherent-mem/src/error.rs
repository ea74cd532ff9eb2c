// Copyright 2026 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Error taxonomy shared by the hotplug, fault and migration paths.

use thiserror::Error;

use crate::store::StoreKey;

/// Result alias used across the crate.
pub type Result<T> = core::result::Result<T, Error>;

/// Errors surfaced by coherent memory operations.
#[derive(Debug, Error)]
pub enum Error {
    /// Discovered region metadata is missing or malformed.
    #[error("configuration error: {0}")]
    Configuration(String),
    /// More regions were offered than the registry can track.
    #[error("region capacity exceeded: {requested} requested, capacity {capacity}")]
    CapacityExceeded {
        /// Regions tracked after the batch would have been accepted.
        requested: usize,
        /// Registry capacity.
        capacity: usize,
    },
    /// Block-state store read or write failed.
    #[error("block-state store error on {key}: {source}")]
    Store {
        /// Key being accessed.
        key: StoreKey,
        /// Underlying failure.
        #[source]
        source: std::io::Error,
    },
    /// The store reported an unusable memory block size.
    #[error("invalid memory block size {0:?}")]
    InvalidBlockSize(String),
    /// Unknown command code or malformed control text.
    #[error("invalid command: {0}")]
    InvalidCommand(String),
    /// A mapping was driven through its lifecycle out of order.
    #[error("mapping state: expected {expected}, found {found}")]
    MappingState {
        /// State the operation requires.
        expected: &'static str,
        /// State the mapping was in.
        found: &'static str,
    },
    /// The range-migration primitive failed.
    #[error("migration failed: {0}")]
    Migration(String),
    /// Configuration file could not be parsed.
    #[error("config error: {0}")]
    Config(String),
    /// Any other I/O failure.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    pub(crate) fn store(key: StoreKey, source: std::io::Error) -> Self {
        Self::Store { key, source }
    }

    /// Returns `true` for errors that callers expecting a structured result must see.
    ///
    /// Everything else is reported through the log and handled in place.
    pub fn is_structured(&self) -> bool {
        matches!(self, Self::CapacityExceeded { .. } | Self::InvalidCommand(_))
    }
}
