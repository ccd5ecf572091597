//! The per-process address space: an interval index of regions, the
//! placement policy that finds room for new ones, and the unmap engine that
//! splits regions around ranges given back by userspace.

pub(crate) mod tree;


use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::fmt::Write as _;

use hashbrown::HashSet;
use thiserror::Error;

use crate::paging::{
    MemoryContext, PageDirectory, PageTableError, RangeRelease, SpaceId, TlbFlush,
};
use crate::platform::{self, Provider};
use crate::range::{PAGE_MASK, PAGE_SIZE, VirtualRange, is_page_aligned, page_round_up};
use crate::region::{Protection, Region, RegionFlags, prot_to_region_access_flags};
use crate::vmobject::{AllocationStrategy, MemoryObjectHandle, ObjectAllocationError};

use self::tree::RegionTree;

const MIB: usize = 1 << 20;

/// Window below which the base of a fresh root space is randomly shifted.
const ASLR_WINDOW: usize = 32 * MIB;

/// Attempts before randomized placement falls back to a linear scan.
const MAX_RANDOMIZED_ATTEMPTS: usize = 1000;

/// The set of virtual memory regions owned by one process.
///
/// An address space owns its [`PageDirectory`] and every indexed [`Region`].
/// The region index sits behind the space's own spin lock; hardware mapping
/// calls take the page-directory and global memory-manager locks internally
/// and are issued outside the space lock, except in
/// [`remove_all_regions`](Self::remove_all_regions), which is the one place
/// all three locks are held together (in that order).
///
/// Dropping the space releases all region bookkeeping and assumes the
/// process finalizer already unmapped everything from hardware.
pub struct AddressSpace<P: Provider> {
    ctx: &'static MemoryContext<P>,
    page_directory: PageDirectory<P>,
    total_range: VirtualRange,
    id: SpaceId,
    regions: spin::Mutex<RegionTree>,
}

impl<P: Provider> AddressSpace<P> {
    /// Create an address space, inheriting `parent`'s bounds when given.
    ///
    /// A root space (no parent) covers the user range with its base shifted
    /// up by a random page multiple below 32 MiB.
    ///
    /// # Errors
    ///
    /// Fails when the platform cannot allocate a page-table root.
    pub fn try_create(
        ctx: &'static MemoryContext<P>,
        parent: Option<&AddressSpace<P>>,
    ) -> Result<Self, PageTableError> {
        let page_directory = PageDirectory::try_create_for_userspace(ctx)?;

        let total_range = match parent {
            Some(parent) => parent.total_range,
            None => {
                let random_offset =
                    (usize::from(platform::fast_random_u8(ctx.platform())) % 32 * MIB) & PAGE_MASK;
                debug_assert!(random_offset < ASLR_WINDOW);
                let base = P::USER_RANGE_BASE + random_offset;
                VirtualRange::new(base, P::USER_RANGE_CEILING - base)
            }
        };

        let space = Self {
            ctx,
            page_directory,
            total_range,
            id: ctx.allocate_space_id(),
            regions: spin::Mutex::new(RegionTree::new()),
        };
        space.page_directory.set_space(space.id);
        Ok(space)
    }

    /// The bounds of every legal region in this space.
    #[inline]
    #[must_use]
    pub fn total_range(&self) -> VirtualRange {
        self.total_range
    }

    /// The page directory owned by this space.
    #[inline]
    #[must_use]
    pub fn page_directory(&self) -> &PageDirectory<P> {
        &self.page_directory
    }

    /// This space's opaque identity, as recorded on its page directory.
    #[inline]
    #[must_use]
    pub fn id(&self) -> SpaceId {
        self.id
    }

    fn user_range() -> VirtualRange {
        VirtualRange::new(P::USER_RANGE_BASE, P::USER_RANGE_CEILING - P::USER_RANGE_BASE)
    }

    // ---- Placement ----

    /// Find a free range for `size` bytes, at `vaddr` if it is non-zero.
    ///
    /// `vaddr` is masked down to a page boundary and `size` rounded up to a
    /// page multiple before placement.
    ///
    /// # Errors
    ///
    /// Fails with [`PlacementError::Overflow`] if rounding `size` wraps, and
    /// otherwise as the underlying placement mode does.
    pub fn try_allocate_range(
        &self,
        vaddr: usize,
        size: usize,
        alignment: usize,
    ) -> Result<VirtualRange, PlacementError> {
        let vaddr = vaddr & PAGE_MASK;
        let size = page_round_up(size).map_err(|_| PlacementError::Overflow)?;
        if vaddr == 0 {
            self.try_allocate_anywhere(size, alignment)
        } else {
            self.try_allocate_specific(vaddr, size)
        }
    }

    /// Check that `[base, base + size)` is free and inside the space.
    ///
    /// # Errors
    ///
    /// Fails with [`PlacementError::OutOfMemory`] if the range leaves the
    /// space bounds or collides with an indexed region.
    ///
    /// # Panics
    ///
    /// Panics if `base` or `size` is not a page multiple.
    pub fn try_allocate_specific(
        &self,
        base: usize,
        size: usize,
    ) -> Result<VirtualRange, PlacementError> {
        if size == 0 {
            return Err(PlacementError::ZeroSize);
        }
        assert!(is_page_aligned(base));
        assert!(is_page_aligned(size));

        let range = VirtualRange::new(base, size);
        if !self.total_range.contains(range) {
            return Err(PlacementError::OutOfMemory);
        }

        let tree = self.regions.lock();
        let Some(below) = tree.find_largest_not_above(base) else {
            // The range can be accommodated below the current lowest region.
            return Ok(range);
        };
        if below.range().intersects(range) {
            return Err(PlacementError::OutOfMemory);
        }

        let mut iter = tree.iter_from(below.base());
        let _ = iter.next();
        match iter.next() {
            // The range can be accommodated above the nearest region.
            None => Ok(range),
            Some(above) if above.range().intersects(range) => Err(PlacementError::OutOfMemory),
            // It fits between the nearest region and its next neighbor.
            Some(_) => Ok(range),
        }
    }

    /// Find the lowest free gap that can hold `size` bytes at `alignment`.
    ///
    /// # Errors
    ///
    /// Fails with [`PlacementError::OutOfMemory`] when no gap fits.
    ///
    /// # Panics
    ///
    /// Panics if `size` is not a page multiple or `alignment` is not a
    /// positive page multiple.
    pub fn try_allocate_anywhere(
        &self,
        size: usize,
        alignment: usize,
    ) -> Result<VirtualRange, PlacementError> {
        if size == 0 {
            return Err(PlacementError::ZeroSize);
        }
        assert!(is_page_aligned(size));
        assert!(alignment != 0 && is_page_aligned(alignment));

        let slack = size.checked_add(alignment).ok_or(PlacementError::Overflow)?;

        let tree = self.regions.lock();
        let mut window_start = self.total_range.base();
        for region in tree.iter() {
            if window_start == region.base() {
                window_start = region.range().end();
                continue;
            }

            let available = VirtualRange::new(window_start, region.base() - window_start);
            window_start = region.range().end();

            // FUTURE: requiring a full alignment of slack passes over some
            // valid gaps when the alignment is large.
            if available.size() < slack {
                continue;
            }

            let aligned_base = available.base().next_multiple_of(alignment);
            return Ok(VirtualRange::new(aligned_base, size));
        }

        // The gap after the highest region is the final candidate.
        if let Some(aligned_base) = window_start.checked_next_multiple_of(alignment) {
            let candidate = VirtualRange::new(aligned_base, size);
            if self.total_range.contains(candidate) {
                return Ok(candidate);
            }
        }
        drop(tree);

        self.ctx.platform().debug_log_print(&alloc::format!(
            "AddressSpace: failed to allocate anywhere: size={size}, alignment={alignment}\n"
        ));
        Err(PlacementError::OutOfMemory)
    }

    /// Find a free range at a uniformly drawn base, falling back to
    /// [`try_allocate_anywhere`](Self::try_allocate_anywhere) after 1000
    /// misses.
    ///
    /// # Errors
    ///
    /// Fails as the fallback does once the attempts are exhausted.
    ///
    /// # Panics
    ///
    /// Panics if `size` is not a page multiple or `alignment` is not a
    /// positive page multiple.
    pub fn try_allocate_randomized(
        &self,
        size: usize,
        alignment: usize,
    ) -> Result<VirtualRange, PlacementError> {
        if size == 0 {
            return Err(PlacementError::ZeroSize);
        }
        assert!(is_page_aligned(size));
        assert!(alignment != 0 && is_page_aligned(alignment));

        for _ in 0..MAX_RANDOMIZED_ATTEMPTS {
            let raw = platform::fast_random_usize(self.ctx.platform()) % self.total_range.end();
            let Some(base) = raw.checked_next_multiple_of(alignment) else {
                continue;
            };
            if !self.total_range.contains_span(base, size) {
                continue;
            }
            if let Ok(range) = self.try_allocate_specific(base, size) {
                return Ok(range);
            }
        }

        self.try_allocate_anywhere(size, alignment)
    }

    // ---- Region lifecycle ----

    /// Create a region over `range` backed by a fresh anonymous memory
    /// object, map it, and index it.
    ///
    /// The new mapping is installed without a TLB flush; the range was not
    /// previously accessible.
    ///
    /// # Errors
    ///
    /// Fails when the object cannot be allocated or the mapping cannot be
    /// installed; the space is unchanged on failure.
    ///
    /// # Panics
    ///
    /// Panics if `range` is empty or not page-aligned.
    pub fn allocate_region(
        &self,
        range: VirtualRange,
        name: Option<&str>,
        prot: Protection,
        strategy: AllocationStrategy,
    ) -> Result<VirtualRange, AllocateRegionError> {
        assert!(is_page_aligned(range.base()) && is_page_aligned(range.size()));
        assert!(!range.is_empty());

        let vmobject = self
            .ctx
            .platform()
            .try_create_anonymous_object(range.size(), strategy)?;
        let region = Region::new_user_accessible(
            range,
            vmobject,
            0,
            name.map(String::from),
            prot_to_region_access_flags(prot),
            RegionFlags::CACHEABLE,
        );
        self.page_directory
            .map_region(self.ctx, &region, TlbFlush::NoFlush)?;
        Ok(self.add_region(region))
    }

    /// Create a region over `range` backed by the given slice of a
    /// caller-supplied memory object, map it, and index it.
    ///
    /// `offset_in_vmobject` is rounded down to a page boundary. With an
    /// empty `prot` (`PROT_NONE`) the range is attached to the page
    /// directory but no entries are installed, so every access faults.
    ///
    /// # Errors
    ///
    /// Fails when the offset arithmetic wraps, the slice leaves the object,
    /// or the mapping cannot be installed; the space is unchanged on
    /// failure.
    ///
    /// # Panics
    ///
    /// Panics if `range` is empty or not page-aligned.
    pub fn allocate_region_with_vmobject(
        &self,
        range: VirtualRange,
        vmobject: MemoryObjectHandle,
        offset_in_vmobject: usize,
        name: Option<&str>,
        prot: Protection,
        shared: bool,
    ) -> Result<VirtualRange, AllocateRegionError> {
        assert!(is_page_aligned(range.base()) && is_page_aligned(range.size()));
        assert!(!range.is_empty());
        let platform = self.ctx.platform();

        let Some(end_in_vmobject) = offset_in_vmobject.checked_add(range.size()) else {
            platform.debug_log_print("allocate_region_with_vmobject: overflow (offset + size)\n");
            return Err(AllocateRegionError::OffsetOverflow);
        };
        if offset_in_vmobject >= vmobject.size() {
            platform.debug_log_print(
                "allocate_region_with_vmobject: offset past the end of the memory object\n",
            );
            return Err(AllocateRegionError::OffsetPastEnd);
        }
        if end_in_vmobject > vmobject.size() {
            platform.debug_log_print(
                "allocate_region_with_vmobject: end past the end of the memory object\n",
            );
            return Err(AllocateRegionError::EndPastEnd);
        }
        let offset_in_vmobject = offset_in_vmobject & PAGE_MASK;

        let mut flags = RegionFlags::CACHEABLE;
        flags.set(RegionFlags::SHARED, shared);
        let region = Region::new_user_accessible(
            range,
            vmobject,
            offset_in_vmobject,
            name.map(String::from),
            prot_to_region_access_flags(prot),
            flags,
        );

        if prot.is_empty() {
            self.page_directory.attach_region(self.ctx, &region);
        } else {
            self.page_directory
                .map_region(self.ctx, &region, TlbFlush::NoFlush)?;
        }
        Ok(self.add_region(region))
    }

    /// Index `region`, transferring ownership into the space.
    ///
    /// Returns the region's range; its base is the stable handle for later
    /// lookups.
    ///
    /// # Panics
    ///
    /// Panics if the region leaves the space bounds or its base is already
    /// indexed.
    pub fn add_region(&self, region: Region) -> VirtualRange {
        let range = region.range();
        assert!(
            self.total_range.contains(range),
            "region outside the address space"
        );
        self.regions.lock().insert(region);
        range
    }

    /// Remove the region based at `base` from the index and return exclusive
    /// ownership to the caller.
    ///
    /// Hardware pages stay mapped; this only changes index membership.
    ///
    /// # Panics
    ///
    /// Panics if no region with this base is indexed.
    pub fn take_region(&self, base: usize) -> Region {
        self.regions
            .lock()
            .remove(base)
            .expect("taking a region that is not indexed")
    }

    /// Remove the region based at `base`, unmap it from the page directory,
    /// and destroy it.
    ///
    /// # Panics
    ///
    /// Panics if no region with this base is indexed.
    pub fn deallocate_region(&self, base: usize) {
        let region = self.take_region(base);
        self.page_directory
            .unmap_region(self.ctx, &region, RangeRelease::Release, TlbFlush::Flush);
    }

    /// Create and index a user-accessible region covering `range`, sharing
    /// `source`'s memory object at `offset_in_vmobject`.
    ///
    /// The name is deep-copied and all flags propagate; copy-on-write bits
    /// shift with the object offset.
    ///
    /// Returns the new region's range.
    pub fn try_allocate_split_region(
        &self,
        source: &Region,
        range: VirtualRange,
        offset_in_vmobject: usize,
    ) -> VirtualRange {
        let mut new_region = Region::new_user_accessible(
            range,
            source.vmobject().clone(),
            offset_in_vmobject,
            source.name().map(String::from),
            source.access(),
            source.flags(),
        );

        let page_offset_in_source =
            (offset_in_vmobject - source.offset_in_vmobject()) / PAGE_SIZE;
        for i in 0..new_region.page_count() {
            if source.should_cow(page_offset_in_source + i) {
                new_region.set_should_cow(i, true);
            }
        }
        self.add_region(new_region)
    }

    /// Carve `desired` out of `source`'s range and index a replacement
    /// region for each remainder, in ascending order.
    ///
    /// `source` has already been taken out of the index; carving its entire
    /// range yields no replacements. Carving a range disjoint from the
    /// source is a caller bug and panics.
    pub fn try_split_region_around_range(
        &self,
        source: &Region,
        desired: VirtualRange,
    ) -> Vec<VirtualRange> {
        let old_range = source.range();
        let remaining = old_range.carve(desired);

        let mut new_ranges = Vec::with_capacity(remaining.len());
        for new_range in remaining {
            assert!(
                old_range.contains(new_range),
                "carve remainder escapes the source region"
            );
            let offset_in_vmobject =
                source.offset_in_vmobject() + (new_range.base() - old_range.base());
            new_ranges.push(self.try_allocate_split_region(source, new_range, offset_in_vmobject));
        }
        new_ranges
    }

    /// Map an already indexed region into the page directory.
    ///
    /// # Panics
    ///
    /// Panics if no region with this base is indexed.
    fn map_indexed_region(&self, base: usize, flush: TlbFlush) -> Result<(), PageTableError> {
        let (range, access, cacheable) = {
            let tree = self.regions.lock();
            let region = tree.get(base).expect("mapping a region that is not indexed");
            (region.range(), region.access(), region.is_cacheable())
        };
        self.page_directory
            .map_range(self.ctx, range, access, cacheable, flush)
    }

    // ---- Unmap engine ----

    /// Unmap `[addr, addr + size)`, expanded to page boundaries, from the
    /// space.
    ///
    /// Only regions marked mmap may be unmapped this way. A region covering
    /// exactly the range is deallocated; a region strictly containing it is
    /// split around it; otherwise every intersecting region is deallocated
    /// or split as its overlap dictates. An empty intersection succeeds with
    /// nothing to do.
    ///
    /// # Errors
    ///
    /// - [`UnmapError::ZeroSize`] for an empty request.
    /// - [`UnmapError::Overflow`] if expanding the range wraps.
    /// - [`UnmapError::OutsideUserRange`] if the expanded range leaves the
    ///   user range.
    /// - [`UnmapError::NotMmapRegion`] if any affected region is not mmap;
    ///   checked for all affected regions before anything is touched.
    /// - [`UnmapError::PageTable`] if mapping a replacement fails, which
    ///   leaves the caller in an undefined state (see [`UnmapError`]).
    pub fn unmap_mmap_range(&self, addr: usize, size: usize) -> Result<(), UnmapError> {
        if size == 0 {
            return Err(UnmapError::ZeroSize);
        }
        let range_to_unmap = VirtualRange::expand_to_page_boundaries(addr, size)
            .map_err(|_| UnmapError::Overflow)?;
        if !Self::user_range().contains(range_to_unmap) {
            return Err(UnmapError::OutsideUserRange);
        }

        // A region covering exactly the requested range is deallocated
        // outright.
        let whole_region = {
            let tree = self.regions.lock();
            match tree.get(range_to_unmap.base()) {
                Some(region) if region.size() == range_to_unmap.size() => {
                    if !region.is_mmap() {
                        return Err(UnmapError::NotMmapRegion);
                    }
                    Some(region.range())
                }
                _ => None,
            }
        };
        if let Some(range) = whole_region {
            self.ctx.platform().add_unmap_perf_event(range);
            self.deallocate_region(range.base());
            return Ok(());
        }

        // A single region strictly containing the range is split around it.
        let containing = {
            let tree = self.regions.lock();
            match tree.find_largest_not_above(range_to_unmap.base()) {
                Some(region) if region.range().contains(range_to_unmap) => {
                    if !region.is_mmap() {
                        return Err(UnmapError::NotMmapRegion);
                    }
                    Some(region.base())
                }
                _ => None,
            }
        };
        if let Some(base) = containing {
            let region = self.take_region(base);

            // Unmap the hardware pages but keep the virtual range claimed;
            // the replacements reuse parts of it.
            self.page_directory
                .unmap_region(self.ctx, &region, RangeRelease::Keep, TlbFlush::Flush);

            let new_ranges = self.try_split_region_around_range(&region, range_to_unmap);
            drop(region);

            for new_range in new_ranges {
                self.map_indexed_region(new_range.base(), TlbFlush::Flush)?;
            }

            self.ctx.platform().add_unmap_perf_event(range_to_unmap);
            return Ok(());
        }

        // Otherwise the range may cross several regions.
        let intersecting = {
            let tree = self.regions.lock();
            let regions = intersecting_regions(&tree, range_to_unmap);
            // All-or-nothing: refuse before touching anything, so a
            // non-mmap region cannot leave half the range unmapped.
            for region in &regions {
                if !region.is_mmap() {
                    return Err(UnmapError::NotMmapRegion);
                }
            }
            regions
                .iter()
                .map(|region| region.range())
                .collect::<Vec<_>>()
        };
        if intersecting.is_empty() {
            return Ok(());
        }

        let mut new_ranges = Vec::new();
        for old_range in intersecting {
            if old_range.intersect(range_to_unmap).size() == old_range.size() {
                // Fully covered, so the whole region goes.
                self.deallocate_region(old_range.base());
                continue;
            }

            let region = self.take_region(old_range.base());
            self.page_directory
                .unmap_region(self.ctx, &region, RangeRelease::Keep, TlbFlush::Flush);
            new_ranges.extend(self.try_split_region_around_range(&region, range_to_unmap));
        }

        for new_range in new_ranges {
            self.map_indexed_region(new_range.base(), TlbFlush::Flush)?;
        }

        self.ctx.platform().add_unmap_perf_event(range_to_unmap);
        Ok(())
    }

    // ---- Queries ----

    /// The range of the region whose base and page-rounded size equal
    /// `range`'s, if one is indexed.
    #[must_use]
    pub fn find_region_from_range(&self, range: VirtualRange) -> Option<VirtualRange> {
        let tree = self.regions.lock();
        let region = tree.get(range.base())?;
        let rounded_size = page_round_up(range.size()).ok()?;
        (region.size() == rounded_size).then(|| region.range())
    }

    /// The range of the region containing all of `range`, if one is indexed.
    #[must_use]
    pub fn find_region_containing(&self, range: VirtualRange) -> Option<VirtualRange> {
        let tree = self.regions.lock();
        let candidate = tree.find_largest_not_above(range.base())?;
        candidate.range().contains(range).then(|| candidate.range())
    }

    /// The ranges of every region overlapping `range`, in ascending order.
    #[must_use]
    pub fn find_regions_intersecting(&self, range: VirtualRange) -> Vec<VirtualRange> {
        let tree = self.regions.lock();
        intersecting_regions(&tree, range)
            .iter()
            .map(|region| region.range())
            .collect()
    }

    /// Run `f` over the indexed region based at `base`.
    pub fn with_region<R>(&self, base: usize, f: impl FnOnce(&Region) -> R) -> Option<R> {
        let tree = self.regions.lock();
        tree.get(base).map(f)
    }

    /// Run `f` over the indexed region based at `base`, mutably.
    pub fn with_region_mut<R>(&self, base: usize, f: impl FnOnce(&mut Region) -> R) -> Option<R> {
        let mut tree = self.regions.lock();
        tree.get_mut(base).map(f)
    }

    // ---- Accounting ----

    /// Total bytes of indexed regions.
    #[must_use]
    pub fn amount_virtual(&self) -> usize {
        let tree = self.regions.lock();
        tree.iter().map(Region::size).sum()
    }

    /// Bytes currently backed by physical pages.
    ///
    /// Physical pages mapped by more than one region are counted once per
    /// region.
    #[must_use]
    pub fn amount_resident(&self) -> usize {
        let tree = self.regions.lock();
        tree.iter().map(Region::amount_resident).sum()
    }

    /// Bytes shared with other mappings, with the same double-counting
    /// caveat as [`amount_resident`](Self::amount_resident).
    #[must_use]
    pub fn amount_shared(&self) -> usize {
        let tree = self.regions.lock();
        tree.iter().map(Region::amount_shared).sum()
    }

    /// Dirty bytes in non-shared regions.
    #[must_use]
    pub fn amount_dirty_private(&self) -> usize {
        let tree = self.regions.lock();
        tree.iter()
            .filter(|region| !region.is_shared())
            .map(Region::amount_dirty)
            .sum()
    }

    /// Clean bytes across the distinct file-backed objects mapped by this
    /// space.
    #[must_use]
    pub fn amount_clean_inode(&self) -> usize {
        let tree = self.regions.lock();
        // Several regions can map one file-backed object; count each object
        // once.
        let mut seen = HashSet::new();
        let mut amount = 0;
        for region in tree.iter() {
            if region.vmobject().is_inode() {
                let identity = Arc::as_ptr(region.vmobject()).cast::<()>();
                if seen.insert(identity) {
                    amount += region.vmobject().amount_clean();
                }
            }
        }
        amount
    }

    /// Resident bytes of volatile purgeable anonymous regions.
    #[must_use]
    pub fn amount_purgeable_volatile(&self) -> usize {
        let tree = self.regions.lock();
        tree.iter()
            .filter(|region| {
                let vmobject = region.vmobject();
                vmobject.is_anonymous() && vmobject.is_purgeable() && vmobject.is_volatile()
            })
            .map(Region::amount_resident)
            .sum()
    }

    /// Resident bytes of non-volatile purgeable anonymous regions.
    #[must_use]
    pub fn amount_purgeable_nonvolatile(&self) -> usize {
        let tree = self.regions.lock();
        tree.iter()
            .filter(|region| {
                let vmobject = region.vmobject();
                vmobject.is_anonymous() && vmobject.is_purgeable() && !vmobject.is_volatile()
            })
            .map(Region::amount_resident)
            .sum()
    }

    // ---- Teardown ----

    /// Unmap every region from hardware and destroy them all.
    ///
    /// Called by the process finalizer. Holds the space, page-directory and
    /// global memory-manager locks together, in that order, while unmapping;
    /// no TLB flushes are issued since the process will never run again.
    ///
    /// # Panics
    ///
    /// Panics when called from any thread but the finalizer.
    pub fn remove_all_regions(&self) {
        assert!(
            self.ctx.platform().is_finalizer_thread(),
            "remove_all_regions called off the finalizer thread"
        );

        let mut tree = self.regions.lock();
        {
            let mut root = self.page_directory.lock();
            let mm_guard = self.ctx.lock_mm();
            for region in tree.iter() {
                PageDirectory::<P>::unmap_region_with_locks_held(
                    self.ctx.platform(),
                    &mut root,
                    &mm_guard,
                    region,
                    RangeRelease::Keep,
                    TlbFlush::NoFlush,
                );
            }
        }

        tree.delete_all_assuming_unmapped();
    }

    /// Destroy every indexed region without touching hardware.
    ///
    /// The caller asserts that nothing is mapped anymore.
    pub fn delete_all_regions_assuming_they_are_unmapped(&self) {
        self.regions.lock().delete_all_assuming_unmapped();
    }

    /// Push a table of all regions to the debug log.
    pub fn dump_regions(&self) {
        let mut out = String::from("Process regions:\n");
        let _ = writeln!(
            out,
            "{:<18} {:<18} {:<18} ACCESS NAME",
            "BEGIN", "END", "SIZE"
        );

        let tree = self.regions.lock();
        for region in tree.iter() {
            let _ = writeln!(
                out,
                "{:#018x} {:#018x} {:#018x} {}{}{}{}{}{} {}",
                region.base(),
                region.range().end() - 1,
                region.size(),
                if region.is_readable() { 'R' } else { ' ' },
                if region.is_writable() { 'W' } else { ' ' },
                if region.is_executable() { 'X' } else { ' ' },
                if region.is_shared() { 'S' } else { ' ' },
                if region.is_stack() { 'T' } else { ' ' },
                if region.is_syscall_region() { 'C' } else { ' ' },
                region.name().unwrap_or(""),
            );
        }
        drop(tree);

        self.ctx.platform().debug_log_print(&out);
    }
}

/// All regions overlapping `range` in ascending order, stopping early once
/// the collected regions are known to cover the whole range.
fn intersecting_regions(tree: &RegionTree, range: VirtualRange) -> Vec<&Region> {
    let mut regions = Vec::new();
    let mut total_size_collected = 0;

    let Some(found) = tree.find_largest_not_above(range.base()) else {
        return regions;
    };
    for region in tree.iter_from(found.base()) {
        let region_range = region.range();
        if region_range.base() < range.end() && region_range.end() > range.base() {
            regions.push(region);

            total_size_collected += region.size() - region_range.intersect(range).size();
            if total_size_collected == range.size() {
                break;
            }
        }
    }
    regions
}

/// Possible errors when choosing a placement for a new region.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlacementError {
    #[error("requested size is zero")]
    ZeroSize,
    #[error("size and alignment overflow the address space")]
    Overflow,
    #[error("no free range satisfies the request")]
    OutOfMemory,
}

/// Possible errors when creating a region.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum AllocateRegionError {
    #[error("offset plus size overflows the memory object")]
    OffsetOverflow,
    #[error("offset lies past the end of the memory object")]
    OffsetPastEnd,
    #[error("region would extend past the end of the memory object")]
    EndPastEnd,
    #[error("failed to allocate a memory object: {0}")]
    ObjectAllocation(#[from] ObjectAllocationError),
    #[error("failed to map the region: {0}")]
    PageTable(#[from] PageTableError),
}

/// Possible errors from [`AddressSpace::unmap_mmap_range`].
///
/// A [`UnmapError::PageTable`] failure after replacement regions have been
/// created leaves the caller in an undefined state: some original regions
/// are gone and replacements may be unmapped. No rollback is attempted.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum UnmapError {
    #[error("requested size is zero")]
    ZeroSize,
    #[error("range overflows the address space")]
    Overflow,
    #[error("range is not a user range")]
    OutsideUserRange,
    #[error("region is not an mmap region")]
    NotMmapRegion,
    #[error("failed to map a replacement region: {0}")]
    PageTable(#[from] PageTableError),
}
