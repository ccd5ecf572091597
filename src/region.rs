//! Regions: contiguous virtual ranges with uniform protection, each backed
//! by a slice of one memory object.

use alloc::string::String;
use alloc::vec::Vec;

use crate::range::{PAGE_SIZE, VirtualRange, is_page_aligned};
use crate::vmobject::{MemoryObject, MemoryObjectHandle};

bitflags::bitflags! {
    /// Hardware access bits of a region.
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct Access: u8 {
        /// Readable.
        const READ = 1 << 0;
        /// Writable.
        const WRITE = 1 << 1;
        /// Executable.
        const EXECUTE = 1 << 2;
    }
}

bitflags::bitflags! {
    /// POSIX memory protection bits as passed to `mmap` and `mprotect`.
    ///
    /// The empty set is `PROT_NONE`.
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct Protection: u32 {
        /// `PROT_READ`
        const READ = 1 << 0;
        /// `PROT_WRITE`
        const WRITE = 1 << 1;
        /// `PROT_EXEC`
        const EXEC = 1 << 2;
    }
}

/// Convert POSIX protection bits to region access flags.
#[must_use]
pub fn prot_to_region_access_flags(prot: Protection) -> Access {
    let mut access = Access::empty();
    access.set(Access::READ, prot.contains(Protection::READ));
    access.set(Access::WRITE, prot.contains(Protection::WRITE));
    access.set(Access::EXECUTE, prot.contains(Protection::EXEC));
    access
}

bitflags::bitflags! {
    /// Properties of a region beyond its access bits.
    ///
    /// These are opaque to the address space core and are preserved across
    /// splits; only [`RegionFlags::MMAP`] carries meaning here, gating
    /// user-initiated unmap.
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct RegionFlags: u8 {
        /// The mapping may be cached by hardware.
        const CACHEABLE = 1 << 0;
        /// Writes are visible to other mappings of the same object.
        const SHARED = 1 << 1;
        /// The region backs a thread stack.
        const STACK = 1 << 2;
        /// The region originates from a user memory mapping request.
        const MMAP = 1 << 3;
        /// The region holds the per-process syscall trampoline.
        const SYSCALL = 1 << 4;
    }
}

/// A dense per-page bit set.
#[derive(Clone)]
struct PageBitmap {
    bits: Vec<u64>,
    pages: usize,
}

impl PageBitmap {
    fn new(pages: usize) -> Self {
        Self {
            bits: alloc::vec![0; pages.div_ceil(64)],
            pages,
        }
    }

    fn get(&self, index: usize) -> bool {
        assert!(index < self.pages);
        self.bits[index / 64] & (1 << (index % 64)) != 0
    }

    fn set(&mut self, index: usize, value: bool) {
        assert!(index < self.pages);
        if value {
            self.bits[index / 64] |= 1 << (index % 64);
        } else {
            self.bits[index / 64] &= !(1 << (index % 64));
        }
    }
}

/// One contiguous virtual range with uniform protection, owned by exactly
/// one address space while indexed.
///
/// A region is a move-only value: it lives inside the region tree while
/// indexed and is handed out by value for split and remap work. Hardware
/// mapping state is tracked by the page directory, not by the region, so
/// dropping a region releases only its bookkeeping; callers unmap first.
pub struct Region {
    range: VirtualRange,
    vmobject: MemoryObjectHandle,
    offset_in_vmobject: usize,
    name: Option<String>,
    access: Access,
    flags: RegionFlags,
    cow_map: PageBitmap,
}

impl Region {
    /// Construct a user-accessible region over `range`, backed by the given
    /// slice of `vmobject`.
    ///
    /// # Panics
    ///
    /// Panics if the range or object offset violate page alignment, if the
    /// range is empty, or if the slice extends past the end of the object.
    #[must_use]
    pub fn new_user_accessible(
        range: VirtualRange,
        vmobject: MemoryObjectHandle,
        offset_in_vmobject: usize,
        name: Option<String>,
        access: Access,
        flags: RegionFlags,
    ) -> Self {
        assert!(is_page_aligned(range.base()) && is_page_aligned(range.size()));
        assert!(!range.is_empty());
        assert!(is_page_aligned(offset_in_vmobject));
        let end_in_vmobject = offset_in_vmobject
            .checked_add(range.size())
            .expect("region slice overflows its memory object");
        assert!(end_in_vmobject <= vmobject.size());

        let pages = range.size() / PAGE_SIZE;
        Self {
            range,
            vmobject,
            offset_in_vmobject,
            name,
            access,
            flags,
            cow_map: PageBitmap::new(pages),
        }
    }

    /// The virtual range covered by this region.
    #[inline]
    #[must_use]
    pub fn range(&self) -> VirtualRange {
        self.range
    }

    /// The base virtual address, which is also the region's index key.
    #[inline]
    #[must_use]
    pub fn base(&self) -> usize {
        self.range.base()
    }

    /// The size of the region in bytes.
    #[inline]
    #[must_use]
    pub fn size(&self) -> usize {
        self.range.size()
    }

    /// The number of pages covered by the region.
    #[inline]
    #[must_use]
    pub fn page_count(&self) -> usize {
        self.range.size() / PAGE_SIZE
    }

    /// The backing memory object.
    #[inline]
    #[must_use]
    pub fn vmobject(&self) -> &MemoryObjectHandle {
        &self.vmobject
    }

    /// Byte offset of the region's first page into its memory object.
    #[inline]
    #[must_use]
    pub fn offset_in_vmobject(&self) -> usize {
        self.offset_in_vmobject
    }

    /// The region's name, if it has one.
    #[must_use]
    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    /// The region's access bits.
    #[inline]
    #[must_use]
    pub fn access(&self) -> Access {
        self.access
    }

    #[must_use]
    pub fn is_readable(&self) -> bool {
        self.access.contains(Access::READ)
    }

    #[must_use]
    pub fn is_writable(&self) -> bool {
        self.access.contains(Access::WRITE)
    }

    #[must_use]
    pub fn is_executable(&self) -> bool {
        self.access.contains(Access::EXECUTE)
    }

    /// The region's property flags.
    #[inline]
    #[must_use]
    pub fn flags(&self) -> RegionFlags {
        self.flags
    }

    #[must_use]
    pub fn is_cacheable(&self) -> bool {
        self.flags.contains(RegionFlags::CACHEABLE)
    }

    #[must_use]
    pub fn is_shared(&self) -> bool {
        self.flags.contains(RegionFlags::SHARED)
    }

    #[must_use]
    pub fn is_stack(&self) -> bool {
        self.flags.contains(RegionFlags::STACK)
    }

    #[must_use]
    pub fn is_mmap(&self) -> bool {
        self.flags.contains(RegionFlags::MMAP)
    }

    #[must_use]
    pub fn is_syscall_region(&self) -> bool {
        self.flags.contains(RegionFlags::SYSCALL)
    }

    pub fn set_mmap(&mut self, mmap: bool) {
        self.flags.set(RegionFlags::MMAP, mmap);
    }

    pub fn set_stack(&mut self, stack: bool) {
        self.flags.set(RegionFlags::STACK, stack);
    }

    pub fn set_syscall_region(&mut self, syscall: bool) {
        self.flags.set(RegionFlags::SYSCALL, syscall);
    }

    /// Whether a write to the page at `page_index` (relative to the region)
    /// must clone the page first.
    #[must_use]
    pub fn should_cow(&self, page_index: usize) -> bool {
        self.cow_map.get(page_index)
    }

    /// Mark or clear the copy-on-write bit for one page of the region.
    pub fn set_should_cow(&mut self, page_index: usize, cow: bool) {
        self.cow_map.set(page_index, cow);
    }

    /// Index of the region's first page within its memory object.
    #[inline]
    fn first_page_index(&self) -> usize {
        self.offset_in_vmobject / PAGE_SIZE
    }

    fn amount_matching(&self, pred: impl Fn(&dyn MemoryObject, usize) -> bool) -> usize {
        let first = self.first_page_index();
        (0..self.page_count())
            .filter(|i| pred(&*self.vmobject, first + i))
            .count()
            * PAGE_SIZE
    }

    /// Bytes of the region currently backed by physical pages.
    ///
    /// Pages shared with other regions are counted in full by each of them.
    #[must_use]
    pub fn amount_resident(&self) -> usize {
        self.amount_matching(|object, index| object.page_is_resident(index))
    }

    /// Bytes of the region shared with other mappings.
    #[must_use]
    pub fn amount_shared(&self) -> usize {
        self.amount_matching(|object, index| object.page_is_shared(index))
    }

    /// Bytes of the region that have been written to.
    #[must_use]
    pub fn amount_dirty(&self) -> usize {
        self.amount_matching(|object, index| object.page_is_dirty(index))
    }
}

#[cfg(test)]
mod tests {
    use alloc::sync::Arc;

    use super::*;

    struct PatternObject {
        size: usize,
    }

    // Pages at even indices are resident and dirty, odd ones are shared.
    impl MemoryObject for PatternObject {
        fn size(&self) -> usize {
            self.size
        }

        fn is_anonymous(&self) -> bool {
            true
        }

        fn page_is_resident(&self, page_index: usize) -> bool {
            page_index % 2 == 0
        }

        fn page_is_dirty(&self, page_index: usize) -> bool {
            page_index % 2 == 0
        }

        fn page_is_shared(&self, page_index: usize) -> bool {
            page_index % 2 == 1
        }
    }

    fn make_region(offset: usize, pages: usize) -> Region {
        Region::new_user_accessible(
            VirtualRange::new(0x10000, pages * PAGE_SIZE),
            Arc::new(PatternObject {
                size: 16 * PAGE_SIZE,
            }),
            offset,
            None,
            Access::READ | Access::WRITE,
            RegionFlags::CACHEABLE,
        )
    }

    #[test]
    fn prot_conversion() {
        assert_eq!(prot_to_region_access_flags(Protection::empty()), Access::empty());
        assert_eq!(
            prot_to_region_access_flags(Protection::READ | Protection::EXEC),
            Access::READ | Access::EXECUTE
        );
    }

    #[test]
    fn amounts_follow_the_object_slice() {
        // Starting at an even object page: 2 of 4 pages resident and dirty.
        let region = make_region(0, 4);
        assert_eq!(region.amount_resident(), 2 * PAGE_SIZE);
        assert_eq!(region.amount_dirty(), 2 * PAGE_SIZE);
        assert_eq!(region.amount_shared(), 2 * PAGE_SIZE);

        // Starting at an odd object page shifts the pattern.
        let region = make_region(PAGE_SIZE, 3);
        assert_eq!(region.amount_resident(), PAGE_SIZE);
        assert_eq!(region.amount_shared(), 2 * PAGE_SIZE);
    }

    #[test]
    fn cow_bits_are_per_page() {
        let mut region = make_region(0, 3);
        assert!(!region.should_cow(1));
        region.set_should_cow(1, true);
        assert!(region.should_cow(1));
        assert!(!region.should_cow(0));
        region.set_should_cow(1, false);
        assert!(!region.should_cow(1));
    }

    #[test]
    #[should_panic]
    fn slice_past_object_end_is_rejected() {
        let _ = Region::new_user_accessible(
            VirtualRange::new(0x10000, 4 * PAGE_SIZE),
            Arc::new(PatternObject { size: 2 * PAGE_SIZE }),
            0,
            None,
            Access::READ,
            RegionFlags::empty(),
        );
    }
}
