// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//! Traits that the embedding kernel implements to back the address space
//! core.
//!
//! The top-level trait that denotes something is a valid platform is
//! [`Provider`]. Ideally a provider is zero-sized and only exists to reach
//! functionality that lives elsewhere: the hardware page tables, the
//! physical-memory subsystem that constructs memory objects, the kernel's
//! entropy pool, its log, and its performance-event stream.

use crate::paging::{PageTableError, RangeRelease, TlbFlush};
use crate::range::VirtualRange;
use crate::region::Access;
use crate::vmobject::{AllocationStrategy, MemoryObjectHandle, ObjectAllocationError};

/// A full platform for the address space core.
///
/// Platforms opt in explicitly; there is no blanket implementation.
pub trait Provider:
    PageTableProvider
    + MemoryObjectProvider
    + RandomProvider
    + DebugLogProvider
    + PerfEventProvider
    + SchedulerProvider
    + Sync
    + 'static
{
}

/// Access to hardware page tables.
///
/// The core holds one [`TableRoot`](Self::TableRoot) per address space,
/// behind the page-directory lock; every call receives the root exclusively.
pub trait PageTableProvider {
    /// The hardware page-table root for one address space.
    type TableRoot: Send;

    /// The lower bound (inclusive) for userspace virtual addresses.
    ///
    /// Must be page-aligned.
    const USER_RANGE_BASE: usize;

    /// The upper bound (exclusive) for userspace virtual addresses.
    ///
    /// Must be page-aligned.
    const USER_RANGE_CEILING: usize;

    /// Allocate a fresh table root for a userspace address space.
    ///
    /// # Errors
    ///
    /// Returns [`PageTableError::OutOfMemory`] when no memory is available
    /// for the root tables.
    fn try_create_userspace_root(&self) -> Result<Self::TableRoot, PageTableError>;

    /// Install entries mapping `range` with the given access bits.
    ///
    /// # Errors
    ///
    /// Returns [`PageTableError::OutOfMemory`] when intermediate table nodes
    /// cannot be allocated.
    fn map_pages(
        &self,
        root: &mut Self::TableRoot,
        range: VirtualRange,
        access: Access,
        cacheable: bool,
        flush: TlbFlush,
    ) -> Result<(), PageTableError>;

    /// Remove the entries covering `range`.
    ///
    /// `release` states whether the virtual range itself is being given up or
    /// merely re-shaped; ranges previously recorded via
    /// [`attach_range`](Self::attach_range) are forgotten on release.
    fn unmap_pages(
        &self,
        root: &mut Self::TableRoot,
        range: VirtualRange,
        release: RangeRelease,
        flush: TlbFlush,
    );

    /// Record `range` against the root without installing any entries, so
    /// that every access faults while the range stays claimed.
    fn attach_range(&self, root: &mut Self::TableRoot, range: VirtualRange);
}

/// Construction of anonymous memory objects.
pub trait MemoryObjectProvider {
    /// Create an anonymous memory object of `size` bytes.
    ///
    /// # Errors
    ///
    /// Returns [`ObjectAllocationError::OutOfMemory`] when the commitment
    /// cannot be satisfied.
    fn try_create_anonymous_object(
        &self,
        size: usize,
        strategy: AllocationStrategy,
    ) -> Result<MemoryObjectHandle, ObjectAllocationError>;
}

/// A fast, non-cryptographic source of randomness.
pub trait RandomProvider {
    /// Fill `dest` with random bytes.
    fn fill_fast_random(&self, dest: &mut [u8]);
}

/// An interface to dumping debug output for tracing purposes.
pub trait DebugLogProvider {
    /// Print `msg` to the debug log
    ///
    /// Newlines are *not* automatically appended to `msg`, thus the caller
    /// must make sure to include newlines if necessary.
    ///
    /// On some platforms this might be a slow operation; callers should
    /// combine all strings part of a single logical message into a single
    /// `debug_log_print` call.
    fn debug_log_print(&self, msg: &str);
}

/// Emission of performance events consumed by profiling tools.
pub trait PerfEventProvider {
    /// Record that the current process unmapped `range`.
    fn add_unmap_perf_event(&self, range: VirtualRange);
}

/// The little the core needs to know about scheduling.
pub trait SchedulerProvider {
    /// Whether the calling thread is the process finalizer.
    fn is_finalizer_thread(&self) -> bool;
}

pub(crate) fn fast_random_u8<P: RandomProvider + ?Sized>(platform: &P) -> u8 {
    let mut byte = [0u8; 1];
    platform.fill_fast_random(&mut byte);
    byte[0]
}

pub(crate) fn fast_random_usize<P: RandomProvider + ?Sized>(platform: &P) -> usize {
    let mut bytes = [0u8; size_of::<usize>()];
    platform.fill_fast_random(&mut bytes);
    usize::from_ne_bytes(bytes)
}

#[cfg(test)]
pub(crate) mod mock;
