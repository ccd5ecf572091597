// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//! The memory object interface consumed by regions.
//!
//! Memory objects are the source of pages behind a region: anonymous RAM,
//! file-backed caches, or purgeable pools. This crate never creates or
//! touches their pages; it only reads sizes, kinds, and per-page state for
//! accounting, and asks the [platform](crate::platform::MemoryObjectProvider)
//! to construct fresh anonymous objects for it.

use alloc::sync::Arc;
use thiserror::Error;

/// A shared, reference-counted handle to a memory object.
///
/// Objects are shared by zero or more regions across one or more address
/// spaces, and outlive every referring region.
pub type MemoryObjectHandle = Arc<dyn MemoryObject>;

/// A reference-counted source of pages backing one or more regions.
///
/// All page indices are relative to the start of the object, not to any
/// region mapping it.
pub trait MemoryObject: Send + Sync {
    /// Total size of the object in bytes, a page multiple.
    fn size(&self) -> usize;

    /// Whether the object is anonymous memory.
    fn is_anonymous(&self) -> bool {
        false
    }

    /// Whether the object is backed by a file.
    fn is_inode(&self) -> bool {
        false
    }

    /// Whether the object belongs to a purgeable pool.
    fn is_purgeable(&self) -> bool {
        false
    }

    /// Whether a purgeable object is currently volatile.
    fn is_volatile(&self) -> bool {
        false
    }

    /// Whether the page at `page_index` has a physical page assigned.
    fn page_is_resident(&self, page_index: usize) -> bool;

    /// Whether the page at `page_index` has been written to.
    fn page_is_dirty(&self, page_index: usize) -> bool;

    /// Whether the page at `page_index` is shared with another mapping.
    fn page_is_shared(&self, page_index: usize) -> bool;

    /// Bytes of clean resident pages held by the whole object.
    ///
    /// Only meaningful for file-backed objects; the anonymous default is zero.
    fn amount_clean(&self) -> usize {
        0
    }
}

/// How an anonymous memory object obtains its physical pages.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AllocationStrategy {
    /// Commit against available memory now, assign physical pages on fault.
    Reserve,
    /// Assign physical pages immediately.
    AllocateNow,
}

/// Possible errors when constructing a fresh anonymous memory object.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum ObjectAllocationError {
    #[error("out of memory")]
    OutOfMemory,
}
