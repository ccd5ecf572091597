//! Crate-local test-only mock platform for easily running tests in the
//! various modules.

// Pull in `std` for the test-only world, so that we have a nicer/easier time
// writing tests
extern crate std;

use core::sync::atomic::{AtomicU64, Ordering};
use std::boxed::Box;
use std::collections::VecDeque;
use std::string::String;
use std::sync::Mutex;
use std::vec::Vec;

use alloc::sync::Arc;

use super::*;
use crate::paging::MemoryContext;
use crate::vmobject::MemoryObject;

/// A mock platform implementing [`Provider`], useful purely for testing
/// within this crate.
///
/// Hardware mapping calls are recorded on the [`MockTableRoot`] so that
/// tests can compare the simulated page tables against the region index.
/// Randomness is deterministic: scripted bytes are consumed first, then a
/// fixed xorshift stream.
pub(crate) struct MockPlatform {
    scripted_random: Mutex<VecDeque<u8>>,
    rng_state: AtomicU64,
    unmap_events: Mutex<Vec<VirtualRange>>,
    log: Mutex<Vec<String>>,
}

impl MockPlatform {
    pub(crate) fn new() -> &'static Self {
        // Tests want a statically lived platform; leaking one per test is
        // perfectly fine.
        Box::leak(Box::new(Self {
            scripted_random: Mutex::new(VecDeque::new()),
            rng_state: AtomicU64::new(0x9e37_79b9_7f4a_7c15),
            unmap_events: Mutex::new(Vec::new()),
            log: Mutex::new(Vec::new()),
        }))
    }

    /// Queue bytes to be returned by the next `fill_fast_random` calls.
    pub(crate) fn script_random(&self, bytes: &[u8]) {
        self.scripted_random.lock().unwrap().extend(bytes);
    }

    pub(crate) fn unmap_events(&self) -> Vec<VirtualRange> {
        self.unmap_events.lock().unwrap().clone()
    }

    pub(crate) fn log_lines(&self) -> Vec<String> {
        self.log.lock().unwrap().clone()
    }
}

/// Build a leaked memory context over a fresh mock platform.
pub(crate) fn mock_context() -> &'static MemoryContext<MockPlatform> {
    Box::leak(Box::new(MemoryContext::new(MockPlatform::new())))
}

impl Provider for MockPlatform {}

/// A simulated page-table root recording every mapping call.
#[derive(Default)]
pub(crate) struct MockTableRoot {
    /// Currently installed mappings, in call order.
    pub(crate) mapped: Vec<(VirtualRange, Access)>,
    /// Ranges attached without entries (`PROT_NONE`).
    pub(crate) attached: Vec<VirtualRange>,
}

impl MockTableRoot {
    pub(crate) fn is_mapped(&self, range: VirtualRange) -> bool {
        self.mapped.iter().any(|(r, _)| *r == range)
    }

    pub(crate) fn mapped_ranges(&self) -> Vec<VirtualRange> {
        let mut ranges: Vec<_> = self.mapped.iter().map(|(r, _)| *r).collect();
        ranges.sort_by_key(VirtualRange::base);
        ranges
    }
}

impl PageTableProvider for MockPlatform {
    type TableRoot = MockTableRoot;

    const USER_RANGE_BASE: usize = 0;
    const USER_RANGE_CEILING: usize = 0x8000_0000;

    fn try_create_userspace_root(&self) -> Result<Self::TableRoot, PageTableError> {
        Ok(MockTableRoot::default())
    }

    fn map_pages(
        &self,
        root: &mut Self::TableRoot,
        range: VirtualRange,
        access: Access,
        _cacheable: bool,
        _flush: TlbFlush,
    ) -> Result<(), PageTableError> {
        assert!(
            !root.mapped.iter().any(|(r, _)| r.intersects(range)),
            "double-mapping {range:x?}"
        );
        root.mapped.push((range, access));
        Ok(())
    }

    fn unmap_pages(
        &self,
        root: &mut Self::TableRoot,
        range: VirtualRange,
        release: RangeRelease,
        _flush: TlbFlush,
    ) {
        root.mapped.retain(|(r, _)| *r != range);
        if release == RangeRelease::Release {
            root.attached.retain(|r| *r != range);
        }
    }

    fn attach_range(&self, root: &mut Self::TableRoot, range: VirtualRange) {
        root.attached.push(range);
    }
}

impl MemoryObjectProvider for MockPlatform {
    fn try_create_anonymous_object(
        &self,
        size: usize,
        _strategy: AllocationStrategy,
    ) -> Result<MemoryObjectHandle, ObjectAllocationError> {
        Ok(Arc::new(MockMemoryObject::anonymous(size)))
    }
}

impl RandomProvider for MockPlatform {
    fn fill_fast_random(&self, dest: &mut [u8]) {
        let mut scripted = self.scripted_random.lock().unwrap();
        for byte in dest {
            *byte = scripted.pop_front().unwrap_or_else(|| {
                let mut x = self.rng_state.load(Ordering::Relaxed);
                x ^= x << 13;
                x ^= x >> 7;
                x ^= x << 17;
                self.rng_state.store(x, Ordering::Relaxed);
                (x >> 32) as u8
            });
        }
    }
}

impl DebugLogProvider for MockPlatform {
    fn debug_log_print(&self, msg: &str) {
        std::eprint!("{msg}");
        self.log.lock().unwrap().push(String::from(msg));
    }
}

impl PerfEventProvider for MockPlatform {
    fn add_unmap_perf_event(&self, range: VirtualRange) {
        self.unmap_events.lock().unwrap().push(range);
    }
}

impl SchedulerProvider for MockPlatform {
    fn is_finalizer_thread(&self) -> bool {
        true
    }
}

/// A memory object with fully scriptable kind and per-page state.
pub(crate) struct MockMemoryObject {
    pub(crate) size: usize,
    pub(crate) anonymous: bool,
    pub(crate) inode: bool,
    pub(crate) purgeable: bool,
    pub(crate) volatile: bool,
    pub(crate) resident: Vec<bool>,
    pub(crate) dirty: Vec<bool>,
    pub(crate) shared: Vec<bool>,
    pub(crate) clean: usize,
}

impl MockMemoryObject {
    pub(crate) fn anonymous(size: usize) -> Self {
        let pages = size.div_ceil(crate::range::PAGE_SIZE);
        Self {
            size,
            anonymous: true,
            inode: false,
            purgeable: false,
            volatile: false,
            resident: std::vec![false; pages],
            dirty: std::vec![false; pages],
            shared: std::vec![false; pages],
            clean: 0,
        }
    }

    pub(crate) fn inode(size: usize, clean: usize) -> Self {
        Self {
            anonymous: false,
            inode: true,
            clean,
            ..Self::anonymous(size)
        }
    }

    pub(crate) fn purgeable(size: usize, volatile: bool) -> Self {
        Self {
            purgeable: true,
            volatile,
            ..Self::anonymous(size)
        }
    }
}

impl MemoryObject for MockMemoryObject {
    fn size(&self) -> usize {
        self.size
    }

    fn is_anonymous(&self) -> bool {
        self.anonymous
    }

    fn is_inode(&self) -> bool {
        self.inode
    }

    fn is_purgeable(&self) -> bool {
        self.purgeable
    }

    fn is_volatile(&self) -> bool {
        self.volatile
    }

    fn page_is_resident(&self, page_index: usize) -> bool {
        self.resident.get(page_index).copied().unwrap_or(false)
    }

    fn page_is_dirty(&self, page_index: usize) -> bool {
        self.dirty.get(page_index).copied().unwrap_or(false)
    }

    fn page_is_shared(&self, page_index: usize) -> bool {
        self.shared.get(page_index).copied().unwrap_or(false)
    }

    fn amount_clean(&self) -> usize {
        self.clean
    }
}
