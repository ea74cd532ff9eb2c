// Copyright 2026 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Memory tiers, their node ids, and the interleaving selector used on fault.

use core::fmt;
use core::sync::atomic::{AtomicU64, Ordering};

use serde::Deserialize;

/// Node backing the default (system RAM) tier.
pub const DEFAULT_TIER_NODE: NodeId = NodeId(0);
/// Node backing the coherent tier.
pub const COHERENT_TIER_NODE: NodeId = NodeId(2);
/// Nodes fault allocations interleave across, in selection order.
pub const DEFAULT_FAULT_NODES: [NodeId; 2] = [NodeId(2), NodeId(1)];

/// NUMA node identifier.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Deserialize)]
#[serde(transparent)]
#[repr(transparent)]
pub struct NodeId(pub u64);

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "node{}", self.0)
    }
}

/// Memory tier a range can be migrated to.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Tier {
    /// Ordinary system memory.
    Default,
    /// Device-coherent memory.
    Coherent,
}

/// Maps tiers onto node ids.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TierMap {
    /// Node of [`Tier::Default`].
    pub default: NodeId,
    /// Node of [`Tier::Coherent`].
    pub coherent: NodeId,
}

impl TierMap {
    /// Returns the node backing `tier`.
    pub fn node(&self, tier: Tier) -> NodeId {
        match tier {
            Tier::Default => self.default,
            Tier::Coherent => self.coherent,
        }
    }

    /// Returns the tier a node belongs to, if any.
    pub fn tier_of(&self, node: NodeId) -> Option<Tier> {
        if node == self.coherent {
            Some(Tier::Coherent)
        } else if node == self.default {
            Some(Tier::Default)
        } else {
            None
        }
    }
}

impl Default for TierMap {
    fn default() -> Self {
        Self { default: DEFAULT_TIER_NODE, coherent: COHERENT_TIER_NODE }
    }
}

/// Alternates allocations between two nodes.
///
/// One selector is shared by every mapping served by an allocator; each call
/// advances a single atomic counter, so concurrent faults never observe the same
/// slot twice in a row.
#[derive(Debug)]
pub struct TierSelector {
    nodes: [NodeId; 2],
    next: AtomicU64,
}

impl TierSelector {
    /// Creates a selector starting at `nodes[0]`.
    pub fn new(nodes: [NodeId; 2]) -> Self {
        Self { nodes, next: AtomicU64::new(0) }
    }

    /// Returns the node for the next allocation and advances.
    pub fn advance(&self) -> NodeId {
        let turn = self.next.fetch_add(1, Ordering::Relaxed);
        self.nodes[(turn % 2) as usize]
    }

    /// Nodes in selection order.
    pub fn nodes(&self) -> [NodeId; 2] {
        self.nodes
    }

    /// Number of selections made so far.
    pub fn selections(&self) -> u64 {
        self.next.load(Ordering::Relaxed)
    }
}

impl Default for TierSelector {
    fn default() -> Self {
        Self::new(DEFAULT_FAULT_NODES)
    }
}
