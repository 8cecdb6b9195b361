//! The contract between the physical memory manager and the
//! image-section subsystem.
//!
//! An *image section* owns the backing store for a range of pageable
//! memory (a file mapping, anonymous swap, etc.). The memory manager
//! never looks inside a section; it only holds reference-counted
//! handles and calls the [`ImageSection`] trait when it needs a page
//! written out.
//!
//! Every pageable frame carries a [`PagingDescriptor`] describing how
//! that frame is backed: which section owns it and at which page offset.
//! Descriptors are created by the section subsystem (one per pageable
//! page) and handed to the frame database when paging is enabled on a
//! frame. The descriptor's mutable fields are only ever modified under
//! the frame database lock; see the field documentation.
//!
//! Reference cycles (address space → frame → descriptor → section →
//! mapped pages) are broken by making the section the only
//! reference-counted edge: frame records hold descriptor references
//! that the frame database severs under its lock, and dropping the last
//! descriptor reference releases the section reference it carries.

#![no_std]

extern crate alloc;

#[cfg(test)]
extern crate std;

use alloc::sync::Arc;
use core::sync::atomic::{AtomicU8, Ordering};
use memory_structs::{Frame, PageRange};
use spin::Mutex;

/// A shared handle to an image section.
pub type SectionRef = Arc<dyn ImageSection>;

/// A shared handle to a paging descriptor.
pub type DescriptorRef = Arc<PagingDescriptor>;

/// A shared handle to a page-cache entry associated with a non-paged frame.
pub type PageCacheRef = Arc<dyn PageCacheEntry>;

/// Why a page-out attempt did not complete.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PageOutError {
    /// The page is transiently busy (e.g., it was locked or touched
    /// while the writeback was being prepared). The caller may retry
    /// with a different victim.
    ResourceInUse,
    /// The backing store failed. Counts toward the pager's hard
    /// failure limit.
    Io,
}

/// Scratch resources lent to [`ImageSection::page_out`] for the
/// duration of one writeback: a preallocated I/O buffer and a private
/// kernel virtual region for temporarily mapping the victim frame.
pub struct PageOutContext<'a> {
    pub io_buffer: &'a mut [u8],
    pub scratch: PageRange,
}

/// The interface a section exposes to the memory manager.
pub trait ImageSection: Send + Sync {
    /// Writes the page at `offset` (in pages, from the start of the
    /// section) out to this section's backing store, then unmaps
    /// `frame` from every address space that shares it.
    ///
    /// On success, returns the number of pages written (usually 1; a
    /// section may cluster neighbors). The caller owns the frame for
    /// the duration of the call: the descriptor's paging-out flag is
    /// set, so the frame cannot be freed or re-locked underneath it.
    fn page_out(
        &self,
        descriptor: &PagingDescriptor,
        offset: usize,
        frame: Frame,
        context: &mut PageOutContext<'_>,
    ) -> Result<usize, PageOutError>;

    /// Returns `true` once the section has been destroyed. A live
    /// pageable frame must never reference a destroyed section.
    fn destroyed(&self) -> bool;
}

/// A page-cache entry that may be attached to a non-paged frame, so
/// that physical-to-cache lookups can find the owning cache page.
/// The memory manager only stores and returns these handles.
pub trait PageCacheEntry: Send + Sync {}

/// The paging-out flag: set under the frame database lock when the
/// pager selects the frame, cleared by the pager once the writeback
/// attempt completes. While set, the pager owns the frame.
const PAGING_OUT: u8 = 1 << 0;

struct Backing {
    section: SectionRef,
    offset: usize,
}

/// Per-frame metadata describing how a pageable frame is backed.
pub struct PagingDescriptor {
    /// The owning section and the page offset within it. Rebound only
    /// by descriptor migration, under the frame database lock.
    backing: Mutex<Backing>,
    /// Number of callers that have locked the frame in memory.
    /// Mutated only under the frame database lock; a non-zero count
    /// keeps the frame out of the pager's reach.
    lock_count: AtomicU8,
    /// See [`PAGING_OUT`].
    flags: AtomicU8,
}

impl PagingDescriptor {
    pub fn new(section: SectionRef, offset: usize) -> PagingDescriptor {
        PagingDescriptor {
            backing: Mutex::new(Backing { section, offset }),
            lock_count: AtomicU8::new(0),
            flags: AtomicU8::new(0),
        }
    }

    /// Returns the owning section and the page offset within it.
    pub fn backing(&self) -> (SectionRef, usize) {
        let backing = self.backing.lock();
        (backing.section.clone(), backing.offset)
    }

    pub fn section(&self) -> SectionRef {
        self.backing.lock().section.clone()
    }

    /// Re-points this descriptor at a new section and offset, returning
    /// the previous section handle so the caller can release it outside
    /// any lock. Used by descriptor migration.
    pub fn rebind(&self, section: SectionRef, offset: usize) -> SectionRef {
        let mut backing = self.backing.lock();
        backing.offset = offset;
        core::mem::replace(&mut backing.section, section)
    }

    pub fn lock_count(&self) -> u8 {
        self.lock_count.load(Ordering::Relaxed)
    }

    /// Increments the lock count, returning the new value.
    pub fn increment_lock_count(&self) -> u8 {
        self.lock_count.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Decrements the lock count, returning the new value.
    pub fn decrement_lock_count(&self) -> u8 {
        self.lock_count.fetch_sub(1, Ordering::Relaxed) - 1
    }

    /// Seeds the lock count of a freshly installed descriptor.
    pub fn set_initial_lock_count(&self, count: u8) {
        self.lock_count.store(count, Ordering::Relaxed);
    }

    pub fn is_paging_out(&self) -> bool {
        self.flags.load(Ordering::Acquire) & PAGING_OUT != 0
    }

    /// Marks this descriptor's frame as owned by the pager.
    pub fn begin_page_out(&self) {
        self.flags.fetch_or(PAGING_OUT, Ordering::AcqRel);
    }

    /// Releases the pager's ownership after a writeback attempt.
    pub fn end_page_out(&self) {
        self.flags.fetch_and(!PAGING_OUT, Ordering::AcqRel);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct NullSection;
    impl ImageSection for NullSection {
        fn page_out(
            &self,
            _descriptor: &PagingDescriptor,
            _offset: usize,
            _frame: Frame,
            _context: &mut PageOutContext<'_>,
        ) -> Result<usize, PageOutError> {
            Ok(1)
        }
        fn destroyed(&self) -> bool {
            false
        }
    }

    #[test]
    fn rebind_swaps_section_and_offset() {
        let first: SectionRef = Arc::new(NullSection);
        let second: SectionRef = Arc::new(NullSection);
        let descriptor = PagingDescriptor::new(first.clone(), 7);

        let previous = descriptor.rebind(second.clone(), 42);
        assert!(Arc::ptr_eq(&previous, &first));
        let (section, offset) = descriptor.backing();
        assert!(Arc::ptr_eq(&section, &second));
        assert_eq!(offset, 42);
    }

    #[test]
    fn paging_out_flag_round_trip() {
        let descriptor = PagingDescriptor::new(Arc::new(NullSection), 0);
        assert!(!descriptor.is_paging_out());
        descriptor.begin_page_out();
        assert!(descriptor.is_paging_out());
        descriptor.end_page_out();
        assert!(!descriptor.is_paging_out());
    }
}
