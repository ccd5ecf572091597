// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//! Page directory handles and the shared memory-manager context.
//!
//! A [`PageDirectory`] wraps the platform's hardware table root behind its
//! own lock; a [`MemoryContext`] carries the process-wide pieces every
//! address space needs: the platform itself and the global memory-manager
//! lock. Lock ordering throughout the crate is address space, then page
//! directory, then the global lock.

use core::sync::atomic::{AtomicU64, Ordering};

use thiserror::Error;

use crate::platform::Provider;
use crate::range::VirtualRange;
use crate::region::{Access, Region};

/// Whether a mapping change flushes the TLB for the affected range.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TlbFlush {
    Flush,
    NoFlush,
}

/// Whether an unmap also releases the virtual range back to the platform's
/// bookkeeping, or keeps it claimed because the caller is about to re-map
/// parts of it.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RangeRelease {
    Release,
    Keep,
}

/// Opaque identity of an address space, used as the page directory's
/// non-owning back-pointer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SpaceId(u64);

impl SpaceId {
    #[must_use]
    pub fn as_u64(self) -> u64 {
        self.0
    }
}

/// Process-wide state shared by every address space: the platform and the
/// global memory-manager lock.
///
/// One instance exists per system; address spaces keep a `'static` reference
/// to it rather than reaching for ambient globals.
pub struct MemoryContext<P: Provider> {
    platform: &'static P,
    mm_lock: spin::Mutex<()>,
    next_space_id: AtomicU64,
}

impl<P: Provider> MemoryContext<P> {
    /// Create the context for `platform`.
    #[must_use]
    pub const fn new(platform: &'static P) -> Self {
        Self {
            platform,
            mm_lock: spin::Mutex::new(()),
            next_space_id: AtomicU64::new(1),
        }
    }

    /// The injected platform.
    #[inline]
    #[must_use]
    pub fn platform(&self) -> &'static P {
        self.platform
    }

    /// Acquire the global memory-manager lock.
    ///
    /// Callers must already hold the page-directory lock if they hold any,
    /// and must never acquire an address-space lock afterwards.
    pub(crate) fn lock_mm(&self) -> spin::MutexGuard<'_, ()> {
        self.mm_lock.lock()
    }

    pub(crate) fn allocate_space_id(&self) -> SpaceId {
        SpaceId(self.next_space_id.fetch_add(1, Ordering::Relaxed))
    }
}

/// The hardware page-table root of one address space, guarded by its own
/// lock.
///
/// Exclusively owned by its address space; the space identity recorded via
/// [`PageDirectory::set_space`] is an opaque id, never an owning reference,
/// keeping ownership a tree.
pub struct PageDirectory<P: Provider> {
    root: spin::Mutex<P::TableRoot>,
    space: AtomicU64,
}

impl<P: Provider> PageDirectory<P> {
    /// Create a fresh userspace page directory.
    ///
    /// # Errors
    ///
    /// Returns [`PageTableError::OutOfMemory`] if the platform cannot
    /// allocate a table root.
    pub fn try_create_for_userspace(ctx: &MemoryContext<P>) -> Result<Self, PageTableError> {
        let root = ctx.platform().try_create_userspace_root()?;
        Ok(Self {
            root: spin::Mutex::new(root),
            space: AtomicU64::new(0),
        })
    }

    /// Record the owning address space.
    pub fn set_space(&self, id: SpaceId) {
        self.space.store(id.as_u64(), Ordering::Relaxed);
    }

    /// The owning address space, if one has been recorded.
    #[must_use]
    pub fn space(&self) -> Option<SpaceId> {
        match self.space.load(Ordering::Relaxed) {
            0 => None,
            id => Some(SpaceId(id)),
        }
    }

    /// Acquire the page-directory lock, yielding the table root.
    pub fn lock(&self) -> spin::MutexGuard<'_, P::TableRoot> {
        self.root.lock()
    }

    /// Install page-table entries for `region`.
    ///
    /// Takes the page-directory and global locks internally; must not be
    /// called with the address-space lock held.
    ///
    /// # Errors
    ///
    /// Fails if the platform runs out of memory for page-table nodes.
    pub(crate) fn map_region(
        &self,
        ctx: &MemoryContext<P>,
        region: &Region,
        flush: TlbFlush,
    ) -> Result<(), PageTableError> {
        self.map_range(ctx, region.range(), region.access(), region.is_cacheable(), flush)
    }

    pub(crate) fn map_range(
        &self,
        ctx: &MemoryContext<P>,
        range: VirtualRange,
        access: Access,
        cacheable: bool,
        flush: TlbFlush,
    ) -> Result<(), PageTableError> {
        let mut root = self.root.lock();
        let _mm = ctx.lock_mm();
        ctx.platform().map_pages(&mut root, range, access, cacheable, flush)
    }

    /// Attach `region`'s range to the directory without installing entries.
    ///
    /// Used for `PROT_NONE` mappings, which reserve the range but must fault
    /// on any access.
    pub(crate) fn attach_region(&self, ctx: &MemoryContext<P>, region: &Region) {
        let mut root = self.root.lock();
        let _mm = ctx.lock_mm();
        ctx.platform().attach_range(&mut root, region.range());
    }

    /// Remove `region`'s page-table entries.
    ///
    /// Takes the page-directory and global locks internally; must not be
    /// called with the address-space lock held.
    pub(crate) fn unmap_region(
        &self,
        ctx: &MemoryContext<P>,
        region: &Region,
        release: RangeRelease,
        flush: TlbFlush,
    ) {
        let mut root = self.root.lock();
        let _mm = ctx.lock_mm();
        ctx.platform().unmap_pages(&mut root, region.range(), release, flush);
    }

    /// Remove `region`'s page-table entries with the page-directory and
    /// global locks already held by the caller.
    pub(crate) fn unmap_region_with_locks_held(
        platform: &P,
        root: &mut P::TableRoot,
        _mm_guard: &spin::MutexGuard<'_, ()>,
        region: &Region,
        release: RangeRelease,
        flush: TlbFlush,
    ) {
        platform.unmap_pages(root, region.range(), release, flush);
    }
}

/// Possible errors from page-table manipulation.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum PageTableError {
    #[error("out of memory while updating page tables")]
    OutOfMemory,
}
