// Copyright 2026 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Fault-driven allocator backing coherent-memory mappings
//! OWNERS: @kernel-mm-team
//! STATUS: Functional (host-first)
//! API_STABILITY: Unstable
//! TEST_COVERAGE: Unit tests below + `tests/fault_drain.rs`
//!
//! Lifecycle per mapping: Unopened -> Open -> Closing -> Closed.
//!
//! Every page handed out on fault is tracked by the mapping's context. Closing a
//! mapping drains that set with a try-lock protocol: when a tracked page is locked by
//! someone else (a concurrent reclaim pass), the context mutex is released entirely
//! and the pass restarts after a yield. The drain never blocks on a page lock while
//! holding the mutex, and it has no retry bound: it ends only when every tracked page
//! has been released, since a page left behind could never be reclaimed.
//!
//! INVARIANTS:
//! - `nr_pages == pages.len()` whenever the context mutex is not held
//! - A page is attached to its context before the faulting caller sees it
//! - A failed allocation is never attached
//! - No page is attached once the drain has started

use core::fmt;
use core::sync::atomic::{AtomicU64, Ordering};
use std::collections::BTreeMap;
use std::sync::Arc;

use log::{debug, info, warn};
use parking_lot::{Mutex, MutexGuard};
use thiserror::Error;

use crate::error::{Error, Result};
use crate::page::{AllocPolicy, Page, PageSource};
use crate::tier::{NodeId, TierSelector};

/// Size of a page in bytes.
pub const PAGE_SIZE: u64 = 4096;

/// Outcome signalled to the faulting consumer.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Error)]
pub enum VmFault {
    /// The fault cannot be served; the consumer receives a bus error.
    #[error("SIGBUS")]
    SigBus,
}

/// Lifecycle state of a mapping.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MappingState {
    /// Created, no context attached yet.
    Unopened,
    /// Context attached; faults are served.
    Open,
    /// Tracked pages are being drained.
    Closing,
    /// Context released.
    Closed,
}

impl MappingState {
    fn as_str(self) -> &'static str {
        match self {
            Self::Unopened => "unopened",
            Self::Open => "open",
            Self::Closing => "closing",
            Self::Closed => "closed",
        }
    }
}

impl fmt::Display for MappingState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

struct TrackedPages {
    pages: Vec<Page>,
    nr_pages: usize,
    draining: bool,
}

/// Per-mapping bookkeeping of pages awaiting reclaim.
pub struct MappingContext {
    tracked: Mutex<TrackedPages>,
}

impl MappingContext {
    fn new() -> Self {
        let tracked = TrackedPages { pages: Vec::new(), nr_pages: 0, draining: false };
        Self { tracked: Mutex::new(tracked) }
    }

    /// Number of pages currently tracked.
    pub fn tracked_pages(&self) -> usize {
        let tracked = self.tracked.lock();
        debug_assert_eq!(tracked.nr_pages, tracked.pages.len());
        tracked.nr_pages
    }

    /// Attaches `page`; refused once the drain has started.
    fn attach(&self, page: &Page) -> bool {
        let mut tracked = self.tracked.lock();
        if tracked.draining {
            return false;
        }
        tracked.pages.push(page.clone());
        tracked.nr_pages += 1;
        true
    }
}

struct MappingInner {
    state: MappingState,
    context: Option<Arc<MappingContext>>,
    installed: BTreeMap<u64, Page>,
}

/// A user mapping of the coherent memory device.
pub struct Mapping {
    start: u64,
    end: u64,
    inner: Mutex<MappingInner>,
}

impl Mapping {
    /// Describes a mapping of `[start, end)`.
    pub fn new(start: u64, end: u64) -> Self {
        Self {
            start,
            end,
            inner: Mutex::new(MappingInner {
                state: MappingState::Unopened,
                context: None,
                installed: BTreeMap::new(),
            }),
        }
    }

    /// First virtual address.
    pub fn start(&self) -> u64 {
        self.start
    }

    /// Exclusive end address.
    pub fn end(&self) -> u64 {
        self.end
    }

    /// Number of pages the mapping spans.
    pub fn page_count(&self) -> u64 {
        self.end.saturating_sub(self.start) / PAGE_SIZE
    }

    /// Current lifecycle state.
    pub fn state(&self) -> MappingState {
        self.inner.lock().state
    }

    /// Pages tracked by the attached context, if one is attached.
    pub fn tracked_pages(&self) -> Option<usize> {
        let context = self.inner.lock().context.clone();
        context.map(|ctx| ctx.tracked_pages())
    }

    /// Page currently installed at `pgoff`.
    pub fn installed(&self, pgoff: u64) -> Option<Page> {
        self.inner.lock().installed.get(&pgoff).cloned()
    }

    fn expect_state(inner: &MappingInner, expected: MappingState) -> Result<()> {
        if inner.state == expected {
            Ok(())
        } else {
            Err(Error::MappingState { expected: expected.as_str(), found: inner.state.as_str() })
        }
    }
}

/// Snapshot of allocator activity.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct FaultStats {
    /// Faults that installed a newly allocated page.
    pub served: u64,
    /// Faults answered with SIGBUS.
    pub sigbus: u64,
    /// Pages released by drains.
    pub drained: u64,
    /// Drain passes restarted on page-lock contention.
    pub drain_retries: u64,
}

#[derive(Default)]
struct FaultCounters {
    served: AtomicU64,
    sigbus: AtomicU64,
    drained: AtomicU64,
    drain_retries: AtomicU64,
}

/// Serves faults on coherent mappings, interleaving allocations across two nodes.
pub struct FaultAllocator {
    source: Arc<dyn PageSource>,
    selector: TierSelector,
    counters: FaultCounters,
}

impl FaultAllocator {
    /// Creates an allocator drawing frames from `source` on `nodes`, alternately.
    pub fn new(source: Arc<dyn PageSource>, nodes: [NodeId; 2]) -> Self {
        Self { source, selector: TierSelector::new(nodes), counters: FaultCounters::default() }
    }

    /// The interleaving selector shared by every mapping of this allocator.
    pub fn selector(&self) -> &TierSelector {
        &self.selector
    }

    /// Activity counters.
    pub fn stats(&self) -> FaultStats {
        FaultStats {
            served: self.counters.served.load(Ordering::Relaxed),
            sigbus: self.counters.sigbus.load(Ordering::Relaxed),
            drained: self.counters.drained.load(Ordering::Relaxed),
            drain_retries: self.counters.drain_retries.load(Ordering::Relaxed),
        }
    }

    /// Attaches a fresh context to `mapping`.
    pub fn open(&self, mapping: &Mapping) -> Result<()> {
        let mut inner = mapping.inner.lock();
        Mapping::expect_state(&inner, MappingState::Unopened)?;
        inner.context = Some(Arc::new(MappingContext::new()));
        inner.state = MappingState::Open;
        debug!("coherent: mapping {:#x}-{:#x} opened", mapping.start, mapping.end);
        Ok(())
    }

    /// Serves a fault at page offset `pgoff`.
    ///
    /// The page comes from the next node of the interleave with a this-node-only,
    /// movable policy. There is no fallback to the other node: an allocation failure
    /// ends the fault with [`VmFault::SigBus`]. A page already installed at `pgoff`
    /// is returned as is.
    pub fn fault(&self, mapping: &Mapping, pgoff: u64) -> core::result::Result<Page, VmFault> {
        let context = {
            let inner = mapping.inner.lock();
            if let Some(page) = inner.installed.get(&pgoff) {
                return Ok(page.clone());
            }
            match (&inner.context, inner.state) {
                (Some(ctx), MappingState::Open) if pgoff < mapping.page_count() => Arc::clone(ctx),
                _ => return Err(self.sigbus(mapping, pgoff)),
            }
        };

        let node = self.selector.advance();
        let Some(pfn) = self.source.alloc(node, AllocPolicy::HIGHUSER_MOVABLE_THIS_NODE) else {
            warn!("coherent: no page on {node} for pgoff {pgoff:#x}");
            return Err(self.sigbus(mapping, pgoff));
        };
        let page = Page::new(pfn, node, Arc::clone(&self.source));
        page.set_index(pgoff);
        if !context.attach(&page) {
            page.put();
            return Err(self.sigbus(mapping, pgoff));
        }

        {
            let mut inner = mapping.inner.lock();
            if inner.state != MappingState::Open {
                // Still tracked; the drain in progress releases it.
                return Err(self.sigbus(mapping, pgoff));
            }
            // Reference held by the installed translation.
            page.get();
            if let Some(raced) = inner.installed.insert(pgoff, page.clone()) {
                raced.put();
            }
        }
        self.counters.served.fetch_add(1, Ordering::Relaxed);
        Ok(page)
    }

    /// Tears `mapping` down, releasing every page it tracks.
    ///
    /// Installed translations are dropped first, then the tracked set is drained.
    /// Returns only once the tracked count is zero; lock contention with a concurrent
    /// reclaimer delays the return but is never reported.
    pub fn close(&self, mapping: &Mapping) -> Result<()> {
        let (context, installed) = {
            let mut inner = mapping.inner.lock();
            Mapping::expect_state(&inner, MappingState::Open)?;
            inner.state = MappingState::Closing;
            let context = inner.context.clone();
            (context, core::mem::take(&mut inner.installed))
        };
        for page in installed.into_values() {
            page.put();
        }
        if let Some(context) = context {
            self.drain(&context);
        }

        let mut inner = mapping.inner.lock();
        inner.context = None;
        inner.state = MappingState::Closed;
        info!("coherent: mapping {:#x}-{:#x} closed", mapping.start, mapping.end);
        Ok(())
    }

    fn drain(&self, context: &MappingContext) {
        'again: loop {
            std::thread::yield_now();
            let mut tracked = context.tracked.lock();
            tracked.draining = true;
            while tracked.nr_pages > 0 {
                while let Some(page) = tracked.pages.last().cloned() {
                    let Some(lock) = page.try_lock() else {
                        drop(tracked);
                        self.counters.drain_retries.fetch_add(1, Ordering::Relaxed);
                        continue 'again;
                    };
                    tracked.pages.pop();
                    tracked.nr_pages -= 1;
                    drop(lock);
                    page.set_reclaim();
                    page.put();
                    self.counters.drained.fetch_add(1, Ordering::Relaxed);
                }
                MutexGuard::unlocked(&mut tracked, std::thread::yield_now);
            }
            return;
        }
    }

    fn sigbus(&self, mapping: &Mapping, pgoff: u64) -> VmFault {
        self.counters.sigbus.fetch_add(1, Ordering::Relaxed);
        debug!("coherent: SIGBUS at {:#x} pgoff {pgoff:#x}", mapping.start);
        VmFault::SigBus
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::page::SimulatedNodes;

    const NODES: [NodeId; 2] = [NodeId(2), NodeId(1)];

    fn setup(per_node: usize) -> (Arc<SimulatedNodes>, FaultAllocator) {
        let source = Arc::new(SimulatedNodes::new(&[(NodeId(1), per_node), (NodeId(2), per_node)]));
        let alloc = FaultAllocator::new(source.clone(), NODES);
        (source, alloc)
    }

    #[test]
    fn fault_before_open_is_sigbus() {
        let (_, alloc) = setup(4);
        let mapping = Mapping::new(0x10000, 0x20000);
        assert_eq!(alloc.fault(&mapping, 0).unwrap_err(), VmFault::SigBus);
        assert_eq!(alloc.stats().sigbus, 1);
    }

    #[test]
    fn fault_tags_and_tracks_page() {
        let (_, alloc) = setup(4);
        let mapping = Mapping::new(0x10000, 0x20000);
        alloc.open(&mapping).unwrap();
        let page = alloc.fault(&mapping, 3).unwrap();
        assert_eq!(page.index(), 3);
        assert_eq!(page.ref_count(), 2);
        assert_eq!(mapping.tracked_pages(), Some(1));
        assert!(mapping.installed(3).unwrap().same_frame(&page));
    }

    #[test]
    fn repeated_fault_reuses_installed_page() {
        let (source, alloc) = setup(4);
        let mapping = Mapping::new(0x10000, 0x20000);
        alloc.open(&mapping).unwrap();
        let first = alloc.fault(&mapping, 1).unwrap();
        let again = alloc.fault(&mapping, 1).unwrap();
        assert!(first.same_frame(&again));
        assert_eq!(source.allocations().len(), 1);
    }

    #[test]
    fn allocation_failure_does_not_fall_back() {
        let source = Arc::new(SimulatedNodes::new(&[(NodeId(1), 4), (NodeId(2), 0)]));
        let alloc = FaultAllocator::new(source.clone(), NODES);
        let mapping = Mapping::new(0, 16 * PAGE_SIZE);
        alloc.open(&mapping).unwrap();
        assert_eq!(alloc.fault(&mapping, 0).unwrap_err(), VmFault::SigBus);
        assert_eq!(mapping.tracked_pages(), Some(0));
        assert_eq!(alloc.fault(&mapping, 0).unwrap().node(), NodeId(1));
    }

    #[test]
    fn out_of_range_offset_is_sigbus() {
        let (_, alloc) = setup(4);
        let mapping = Mapping::new(0, 2 * PAGE_SIZE);
        alloc.open(&mapping).unwrap();
        assert_eq!(alloc.fault(&mapping, 2).unwrap_err(), VmFault::SigBus);
    }

    #[test]
    fn lifecycle_is_enforced() {
        let (_, alloc) = setup(4);
        let mapping = Mapping::new(0, PAGE_SIZE);
        assert!(matches!(alloc.close(&mapping), Err(Error::MappingState { .. })));
        alloc.open(&mapping).unwrap();
        assert!(matches!(alloc.open(&mapping), Err(Error::MappingState { .. })));
        alloc.close(&mapping).unwrap();
        assert_eq!(mapping.state(), MappingState::Closed);
        assert_eq!(mapping.tracked_pages(), None);
        assert_eq!(alloc.fault(&mapping, 0).unwrap_err(), VmFault::SigBus);
    }

    #[test]
    fn close_releases_everything() {
        let (source, alloc) = setup(8);
        let mapping = Mapping::new(0, 8 * PAGE_SIZE);
        alloc.open(&mapping).unwrap();
        let pages: Vec<Page> = (0..6).map(|off| alloc.fault(&mapping, off).unwrap()).collect();
        assert_eq!(source.total_outstanding(), 6);
        alloc.close(&mapping).unwrap();
        assert_eq!(source.total_outstanding(), 0);
        assert!(pages.iter().all(|p| p.is_reclaim() && p.ref_count() == 0));
        assert_eq!(alloc.stats().drained, 6);
    }
}
