//! The per-address-space page table machinery: mapping, unmapping,
//! permission changes, translation, fork-style duplication, and
//! teardown, with the TLB coherence rules those operations require.
//!
//! The TLB rules in force throughout this module:
//! * a present-to-absent transition (and a present-to-present change of
//!   frame or permissions) must be followed by an invalidation, and by
//!   a cross-processor broadcast when other CPUs may hold the entry;
//! * an absent-to-present transition never requires invalidation,
//!   because absent entries are not negatively cached.
//!
//! Writes of present bits always precede the broadcast call.

pub(crate) mod table;

use alloc::sync::Arc;
use alloc::vec::Vec;
use core::fmt;
use core::sync::atomic::{AtomicUsize, Ordering};
use bitflags::bitflags;
use image_section::SectionRef;
use kernel_config::memory::{
    ENTRIES_PER_PAGE_TABLE, KERNEL_HALF_P4_INDEX, KERNEL_HALF_START, PAGE_SIZE,
};
use log::error;
use memory_structs::{Frame, Page, PageRange, PhysicalAddress, VirtualAddress};
use page_table_entry::PteFlags;
use run_level::DispatchGuard;
use spin::Mutex;

use self::table::{table_from_frame, Level1, Level4, Table};
use crate::{broadcast_invalidate, kernel_root_frame, local_invalidate};

/// Serializes creation of kernel-half page tables across all address
/// spaces, so exactly one table is ever installed for a given slot of
/// the kernel's master top-level table.
static KERNEL_TABLE_LOCK: Mutex<()> = Mutex::new(());

bitflags! {
    /// Options for [`AddressSpace::unmap_range`] and
    /// [`unmap_page_in`](AddressSpace::unmap_page_in).
    pub struct UnmapFlags: u8 {
        /// Free the backing frames once the entries are invalidated.
        const FREE_FRAMES = 1 << 0;
        /// Broadcast a TLB shootdown to other processors. Omit only
        /// when the mapping cannot be cached on another CPU.
        const BROADCAST = 1 << 1;
    }
}

/// A shareable handle to an [`AddressSpace`].
pub type AddressSpaceRef = Arc<AddressSpace>;

/// One process's page tables and the accounting that goes with them.
///
/// The kernel-half entries of the top-level table are copies of the
/// kernel's master table, established at creation and synchronized
/// lazily at fault time. Leaf tables are retained for the life of the
/// address space; [`tear_down_user`](Self::tear_down_user) reclaims
/// them all at process exit.
pub struct AddressSpace {
    p4_frame: Frame,
    /// Serializes page-table edits that race between threads of the
    /// same process. This is the only lock taken on the hot paths.
    lock: Mutex<()>,
    /// The number of present user-half mappings.
    resident_set: AtomicUsize,
    /// The number of page-table frames (all levels below the root)
    /// owned by the user half of this space.
    page_table_count: AtomicUsize,
    /// The number of schedulable threads sharing this space; consulted
    /// to elide TLB broadcasts for single-threaded and exiting
    /// processes.
    thread_count: AtomicUsize,
}

impl fmt::Debug for AddressSpace {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "AddressSpace(p4: {:#X})", self.p4_frame.start_address().value())
    }
}

fn is_user_page(page: &Page) -> bool {
    page.p4_index() < KERNEL_HALF_P4_INDEX
}

/// Creates a new address space: a fresh top-level table whose user
/// half is zeroed and whose kernel half is copied from the kernel's
/// master table. The memory subsystem must be initialized first.
pub fn create_address_space() -> AddressSpaceRef {
    let master_frame = kernel_root_frame();
    let p4_frame = frame_allocator::allocate_frames(1, 1);
    {
        let _table_lock = KERNEL_TABLE_LOCK.lock();
        let new_p4 = unsafe { table_from_frame::<Level4>(p4_frame) };
        let master = unsafe { &*table_from_frame::<Level4>(master_frame) };
        for index in 0..KERNEL_HALF_P4_INDEX {
            new_p4[index].zero();
        }
        for index in KERNEL_HALF_P4_INDEX..ENTRIES_PER_PAGE_TABLE {
            new_p4[index].set_raw(master[index].value());
        }
    }
    Arc::new(AddressSpace::with_root(p4_frame))
}

impl AddressSpace {
    pub(crate) fn with_root(p4_frame: Frame) -> AddressSpace {
        AddressSpace {
            p4_frame,
            lock: Mutex::new(()),
            resident_set: AtomicUsize::new(0),
            page_table_count: AtomicUsize::new(0),
            thread_count: AtomicUsize::new(1),
        }
    }

    /// Returns the frame holding this space's top-level table.
    pub fn root_frame(&self) -> Frame {
        self.p4_frame
    }

    /// Returns the physical address loaded into the CPU's table base
    /// register when this space is active.
    pub fn physical_address(&self) -> PhysicalAddress {
        self.p4_frame.start_address()
    }

    /// The number of present user-half mappings.
    pub fn resident_set_size(&self) -> usize {
        self.resident_set.load(Ordering::Relaxed)
    }

    /// The number of user-half page-table frames this space owns.
    pub fn page_table_count(&self) -> usize {
        self.page_table_count.load(Ordering::Relaxed)
    }

    pub fn thread_count(&self) -> usize {
        self.thread_count.load(Ordering::Relaxed)
    }

    /// Updated by the process layer as threads come and go; a count of
    /// zero marks a space whose process has exited.
    pub fn set_thread_count(&self, count: usize) {
        self.thread_count.store(count, Ordering::Relaxed);
    }

    fn p4(&self) -> &mut Table<Level4> {
        unsafe { table_from_frame::<Level4>(self.p4_frame) }
    }

    /// Walks to the leaf table covering `page`, creating any missing
    /// tables along the way. User-half tables are counted into
    /// `new_user_tables`; kernel-half tables are created once in the
    /// kernel's master table and the top-level link is mirrored here.
    fn p1_create(&self, page: &Page, new_user_tables: &mut usize) -> &mut Table<Level1> {
        if is_user_page(page) {
            self.p4()
                .next_table_create(page.p4_index(), true, new_user_tables)
                .next_table_create(page.p3_index(), true, new_user_tables)
                .next_table_create(page.p2_index(), true, new_user_tables)
        } else {
            let _table_lock = KERNEL_TABLE_LOCK.lock();
            let master_frame = kernel_root_frame();
            let master = unsafe { table_from_frame::<Level4>(master_frame) };
            let mut untracked = 0;
            let p1 = master
                .next_table_create(page.p4_index(), false, &mut untracked)
                .next_table_create(page.p3_index(), false, &mut untracked)
                .next_table_create(page.p2_index(), false, &mut untracked);
            if self.p4_frame != master_frame {
                let master = unsafe { &*table_from_frame::<Level4>(master_frame) };
                self.p4()[page.p4_index()].set_raw(master[page.p4_index()].value());
            }
            p1
        }
    }

    /// Walks to the leaf table covering `page`, if every table on the
    /// way exists. For kernel-half pages, a stale top-level entry is
    /// first synchronized from the kernel's master table, since another
    /// address space may have created the table.
    fn p1_of(&self, page: &Page) -> Option<&mut Table<Level1>> {
        let p4 = self.p4();
        if !is_user_page(page) && !p4[page.p4_index()].is_present() {
            let master_frame = kernel_root_frame();
            if self.p4_frame != master_frame {
                let _table_lock = KERNEL_TABLE_LOCK.lock();
                let master = unsafe { &*table_from_frame::<Level4>(master_frame) };
                if master[page.p4_index()].is_present() {
                    p4[page.p4_index()].set_raw(master[page.p4_index()].value());
                }
            }
        }
        p4.next_table_mut(page.p4_index())?
            .next_table_mut(page.p3_index())?
            .next_table_mut(page.p2_index())
    }

    /// Maps `page` to `frame` with the given permission flags,
    /// allocating the covering tables as needed.
    ///
    /// The destination slot must be empty: on a present-to-present
    /// transition the caller must have previously unmapped and
    /// invalidated it. No TLB work is needed here because installing a
    /// mapping is an absent-to-present transition.
    pub fn map_page(&self, page: Page, frame: Frame, flags: PteFlags) {
        let _guard = self.lock.lock();
        let mut new_user_tables = 0;
        let p1 = self.p1_create(&page, &mut new_user_tables);
        let entry = &mut p1[page.p1_index()];
        debug_assert!(
            entry.is_unused(),
            "map_page over a live entry; unmap and invalidate it first",
        );
        entry.set(frame, flags);
        if is_user_page(&page) {
            if new_user_tables != 0 {
                self.page_table_count.fetch_add(new_user_tables, Ordering::Relaxed);
            }
            self.resident_set.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Unmaps `pages`, returning whether any of them was dirty.
    ///
    /// This runs in two passes. The first clears the present bits and,
    /// if anything changed and [`UnmapFlags::BROADCAST`] was requested,
    /// issues one cross-processor shootdown for the whole range; until
    /// then other processors may still have TLB entries, so the frames
    /// stay untouched. The second pass collects dirty bits, zeroes the
    /// entries, and (with [`UnmapFlags::FREE_FRAMES`]) releases the
    /// backing frames in batched contiguous runs.
    ///
    /// Single-threaded user spaces downgrade the broadcast to local
    /// invalidations, and spaces with no remaining threads skip
    /// invalidation entirely.
    pub fn unmap_range(&self, pages: &PageRange, flags: UnmapFlags) -> bool {
        let _guard = self.lock.lock();
        let user_range = pages.size_in_pages() != 0 && is_user_page(pages.start());
        let mut broadcast = flags.contains(UnmapFlags::BROADCAST);
        let mut invalidate_locally = true;
        if user_range {
            let threads = self.thread_count();
            if threads <= 1 {
                broadcast = false;
                invalidate_locally = threads != 0;
            }
        }

        // Pass one: turn every entry off. Other processors may still
        // hold TLB entries, so the pages are technically still in use.
        let mut changed_something = false;
        let mut mapped_count = 0;
        for page in pages.iter() {
            let p1 = match self.p1_of(&page) {
                Some(p1) => p1,
                None => continue,
            };
            let entry = &mut p1[page.p1_index()];
            if entry.is_unused() {
                debug_assert!(!entry.is_present());
                continue;
            }
            mapped_count += 1;
            if entry.is_present() {
                entry.clear_flags(PteFlags::PRESENT);
                changed_something = true;
                if !broadcast && invalidate_locally {
                    local_invalidate(page.start_address());
                }
            }
        }

        // Get everyone faulting; after this the pages can go offline.
        if changed_something && broadcast {
            broadcast_invalidate(self, pages.clone());
        }

        // Pass two: collect dirty bits, finish the entries, and free
        // the frames in contiguous runs.
        let mut was_dirty = false;
        let mut runs = FrameRunBatcher::new();
        for page in pages.iter() {
            let p1 = match self.p1_of(&page) {
                Some(p1) => p1,
                None => continue,
            };
            let entry = &mut p1[page.p1_index()];
            if entry.is_unused() {
                continue;
            }
            if entry.flags().is_dirty() {
                was_dirty = true;
            }
            if flags.contains(UnmapFlags::FREE_FRAMES) {
                if let Some(frame) = entry.frame() {
                    runs.add(frame);
                }
            }
            entry.zero();
        }
        runs.flush();

        if user_range && mapped_count != 0 {
            self.resident_set.fetch_sub(mapped_count, Ordering::Relaxed);
        }
        was_dirty
    }

    /// Applies the flag bits selected by `mask` to every mapped page
    /// of the range, skipping unmapped pages.
    ///
    /// Only present-to-absent transitions and permission narrowing
    /// require invalidation; making an entry present (or widening
    /// nothing) is never broadcast because absent entries are not
    /// cached.
    pub fn change_access(&self, pages: &PageRange, flags: PteFlags, mask: PteFlags) {
        let _guard = self.lock.lock();
        let user_range = pages.size_in_pages() != 0 && is_user_page(pages.start());
        let mut broadcast = true;
        let mut invalidate_locally = true;
        if user_range {
            let threads = self.thread_count();
            if threads <= 1 {
                broadcast = false;
                invalidate_locally = threads != 0;
            }
        }

        let mut changed_something = false;
        for page in pages.iter() {
            let p1 = match self.p1_of(&page) {
                Some(p1) => p1,
                None => continue,
            };
            let entry = &mut p1[page.p1_index()];
            if entry.is_unused() {
                debug_assert!(!entry.is_present());
                continue;
            }

            let mut changed_this_round = false;
            if mask.contains(PteFlags::WRITABLE)
                && entry.flags().is_writable() != flags.is_writable()
            {
                changed_this_round = true;
                if flags.is_writable() {
                    entry.insert_flags(PteFlags::WRITABLE);
                } else {
                    entry.clear_flags(PteFlags::WRITABLE);
                }
            }
            if mask.contains(PteFlags::PRESENT)
                && entry.is_present() != flags.is_present()
            {
                // Absent entries are not cached, so only the present
                // to absent direction counts as a visible change.
                if !flags.is_present() {
                    changed_this_round = true;
                }
                if flags.is_present() {
                    entry.insert_flags(PteFlags::PRESENT);
                } else {
                    entry.clear_flags(PteFlags::PRESENT);
                }
            }

            if changed_this_round {
                if broadcast {
                    changed_something = true;
                } else if invalidate_locally {
                    local_invalidate(page.start_address());
                }
            }
        }

        if changed_something {
            broadcast_invalidate(self, pages.clone());
        }
    }

    /// Translates a virtual address through this space's tables.
    /// Returns the physical address (with the page offset applied) and
    /// the entry's flags; an entry whose frame remains but whose
    /// present bit is off is still reported, with the flags telling
    /// the story.
    pub fn virtual_to_physical(
        &self,
        virt_addr: VirtualAddress,
    ) -> Option<(PhysicalAddress, PteFlags)> {
        let _guard = self.lock.lock();
        self.translate_locked(virt_addr)
    }

    fn translate_locked(
        &self,
        virt_addr: VirtualAddress,
    ) -> Option<(PhysicalAddress, PteFlags)> {
        let page = Page::containing_address(virt_addr);
        let p1 = self.p1_of(&page)?;
        let entry = &p1[page.p1_index()];
        let frame = entry.frame()?;
        Some((frame.start_address() + virt_addr.page_offset(), entry.flags()))
    }

    /// Reclaims every user-half page table of an exiting process,
    /// freeing the table frames in batched contiguous runs. The
    /// mappings themselves must already have been unmapped. Does
    /// nothing unless the process is `terminated` (an exec reuses the
    /// tables).
    pub fn tear_down_user(&self, terminated: bool) {
        if !terminated {
            return;
        }
        let _guard = self.lock.lock();
        let p4 = self.p4();
        let mut runs = FrameRunBatcher::new();
        let mut freed_tables = 0;
        for p4_index in 0..KERNEL_HALF_P4_INDEX {
            let p3_frame = match p4.next_table_frame(p4_index) {
                Some(frame) if p4[p4_index].is_present() => frame,
                _ => continue,
            };
            let p3 = unsafe { &*table_from_frame::<table::Level3>(p3_frame) };
            for p3_index in 0..ENTRIES_PER_PAGE_TABLE {
                let p2_frame = match p3.next_table_frame(p3_index) {
                    Some(frame) if p3[p3_index].is_present() => frame,
                    _ => continue,
                };
                let p2 = unsafe { &*table_from_frame::<table::Level2>(p2_frame) };
                for p2_index in 0..ENTRIES_PER_PAGE_TABLE {
                    if let Some(p1_frame) = p2.next_table_frame(p2_index) {
                        if p2[p2_index].is_present() {
                            runs.add(p1_frame);
                            freed_tables += 1;
                        }
                    }
                }
                runs.add(p2_frame);
                freed_tables += 1;
            }
            runs.add(p3_frame);
            freed_tables += 1;
            p4[p4_index].zero();
        }
        runs.flush();

        let owned = self.page_table_count.swap(0, Ordering::Relaxed);
        if owned != freed_tables {
            error!(
                "tear_down_user: {:?} owned {} page tables but freed {}",
                self, owned, freed_tables,
            );
            debug_assert_eq!(owned, freed_tables, "page tables were leaked");
        }
    }

    /// Copies kernel-half top-level entries covering the given range
    /// from the kernel's master table into this space. Used when a
    /// fault (or an explicit sync) finds this space's view stale.
    pub fn update_kernel_half(&self, virt_addr: VirtualAddress, size_in_bytes: usize) {
        if virt_addr.value() < KERNEL_HALF_START || size_in_bytes == 0 {
            return;
        }
        let master_frame = kernel_root_frame();
        if self.p4_frame == master_frame {
            return;
        }
        let _table_lock = KERNEL_TABLE_LOCK.lock();
        let master = unsafe { &*table_from_frame::<Level4>(master_frame) };
        let p4 = self.p4();
        let first = Page::containing_address(virt_addr).p4_index();
        let last = Page::containing_address(virt_addr + (size_in_bytes - 1)).p4_index();
        for index in first..=last {
            if master[index].is_present() && !p4[index].is_present() {
                p4[index].set_raw(master[index].value());
            }
        }
    }

    /// Determines whether a fault at `virt_addr` occurred only because
    /// this space's top-level table had not yet seen a kernel-half
    /// entry. If so, the entry is copied over and the fault is
    /// resolved silently; the caller should retry the access.
    pub fn resolve_kernel_fault(&self, virt_addr: VirtualAddress) -> bool {
        if virt_addr.value() < KERNEL_HALF_START {
            return false;
        }
        let master_frame = kernel_root_frame();
        if self.p4_frame == master_frame {
            return false;
        }
        let page = Page::containing_address(virt_addr);
        let index = page.p4_index();
        let synced = {
            let _table_lock = KERNEL_TABLE_LOCK.lock();
            let master = unsafe { &*table_from_frame::<Level4>(master_frame) };
            let p4 = self.p4();
            if master[index].is_present() && !p4[index].is_present() {
                p4[index].set_raw(master[index].value());
                true
            } else {
                false
            }
        };
        if !synced {
            return false;
        }
        // The fault is resolved only if the rest of the walk finds a
        // present mapping.
        match self.p1_of(&page) {
            Some(p1) => p1[page.p1_index()].is_present(),
            None => false,
        }
    }
}

impl Drop for AddressSpace {
    fn drop(&mut self) {
        debug_assert_eq!(
            self.page_table_count(),
            0,
            "address space dropped with live page tables; run tear_down_user first",
        );
        frame_allocator::free_frames(self.p4_frame, 1);
    }
}

/// Translates a user virtual address through *another* address space's
/// tables. Runs at dispatch level for the duration of the walk and
/// takes no sleepable locks.
pub fn virtual_to_physical_in(
    space: &AddressSpace,
    virt_addr: VirtualAddress,
) -> Option<PhysicalAddress> {
    debug_assert!(virt_addr.value() < KERNEL_HALF_START);
    let _dispatch = DispatchGuard::raise();
    let page = Page::containing_address(virt_addr);
    let p1 = space
        .p4()
        .next_table(page.p4_index())?
        .next_table(page.p3_index())?
        .next_table(page.p2_index())?;
    let frame = p1[page.p1_index()].frame()?;
    Some(frame.start_address() + virt_addr.page_offset())
}

/// Maps a page into another address space.
///
/// The covering leaf table must already exist (fork preallocates
/// them); discovering a missing table here would mean allocating under
/// locks that forbid it, so it is treated as fatal. If the destination
/// slot was previously present the caller must pass `broadcast`, since
/// the old translation may be cached on other processors.
pub fn map_page_in(
    space: &AddressSpace,
    page: Page,
    frame: Frame,
    flags: PteFlags,
    broadcast: bool,
) {
    debug_assert!(is_user_page(&page));
    let _guard = space.lock.lock();
    let mut newly_mapped = false;
    let mut send_broadcast = false;
    {
        let _dispatch = DispatchGuard::raise();
        let p1 = match space
            .p4()
            .next_table_mut(page.p4_index())
            .and_then(|p3| p3.next_table_mut(page.p3_index()))
            .and_then(|p2| p2.next_table_mut(page.p2_index()))
        {
            Some(p1) => p1,
            None => panic!("map_page_in: no preallocated page table covers {:?}", page),
        };
        let entry = &mut p1[page.p1_index()];
        if entry.is_unused() {
            newly_mapped = true;
        } else {
            debug_assert!(broadcast, "remapping a live entry requires a broadcast");
            send_broadcast = broadcast && entry.is_present();
        }
        entry.set(frame, flags);
    }
    if send_broadcast {
        let range = PageRange::new(page, page);
        broadcast_invalidate(space, range);
    }
    if newly_mapped {
        space.resident_set.fetch_add(1, Ordering::Relaxed);
    }
}

/// Unmaps one page from another address space, always broadcasting if
/// the entry was present. Returns whether the page was dirty.
pub fn unmap_page_in(space: &AddressSpace, page: Page, flags: UnmapFlags) -> bool {
    debug_assert!(is_user_page(&page));
    let _guard = space.lock.lock();
    let (was_present, was_dirty, freed_frame) = {
        let _dispatch = DispatchGuard::raise();
        let p1 = match space
            .p4()
            .next_table_mut(page.p4_index())
            .and_then(|p3| p3.next_table_mut(page.p3_index()))
            .and_then(|p2| p2.next_table_mut(page.p2_index()))
        {
            Some(p1) => p1,
            None => return false,
        };
        let entry = &mut p1[page.p1_index()];
        if entry.is_unused() {
            return false;
        }
        let was_present = entry.is_present();
        entry.clear_flags(PteFlags::PRESENT);
        let was_dirty = entry.flags().is_dirty();
        let freed_frame = if flags.contains(UnmapFlags::FREE_FRAMES) {
            entry.frame()
        } else {
            None
        };
        if !was_present {
            entry.zero();
        }
        (was_present, was_dirty, freed_frame)
    };
    if was_present {
        broadcast_invalidate(space, PageRange::new(page, page));
        // Now that no TLB can reach it, finish the entry off.
        let _dispatch = DispatchGuard::raise();
        if let Some(p1) = space
            .p4()
            .next_table_mut(page.p4_index())
            .and_then(|p3| p3.next_table_mut(page.p3_index()))
            .and_then(|p2| p2.next_table_mut(page.p2_index()))
        {
            p1[page.p1_index()].zero();
        }
    }
    if let Some(frame) = freed_frame {
        frame_allocator::free_frames(frame, 1);
    }
    space.resident_set.fetch_sub(1, Ordering::Relaxed);
    was_dirty
}

/// Preallocates the page tables a fork destination will need: one
/// table for every user-half table the source owns, mirroring the
/// source's shape, fully linked and zeroed.
///
/// The frames are taken in one scattered allocation before any
/// space lock is held, because physical allocation may wait on the
/// pager and the pager may need these locks.
pub fn preallocate_page_tables(source: &AddressSpace, destination: &AddressSpace) {
    let needed = source.page_table_count();
    if needed == 0 {
        return;
    }
    let mut frames: Vec<Frame> = alloc::vec![Frame::from_number(0); needed];
    frame_allocator::allocate_frames_scattered(&mut frames);

    let _source_guard = source.lock.lock();
    let _destination_guard = destination.lock.lock();
    let mut free_frames = frames.into_iter();
    let mut installed = 0;
    let source_p4 = &*source.p4();
    let destination_p4 = destination.p4();
    for p4_index in 0..KERNEL_HALF_P4_INDEX {
        let source_p3 = match source_p4.next_table(p4_index) {
            Some(table) => table,
            None => continue,
        };
        let destination_p3 =
            mirror_child(&mut *destination_p4, p4_index, &mut free_frames, &mut installed);
        for p3_index in 0..ENTRIES_PER_PAGE_TABLE {
            let source_p2 = match source_p3.next_table(p3_index) {
                Some(table) => table,
                None => continue,
            };
            let destination_p2 =
                mirror_child(&mut *destination_p3, p3_index, &mut free_frames, &mut installed);
            for p2_index in 0..ENTRIES_PER_PAGE_TABLE {
                if source_p2.next_table(p2_index).is_some() {
                    mirror_child(&mut *destination_p2, p2_index, &mut free_frames, &mut installed);
                }
            }
        }
    }
    debug_assert_eq!(installed, needed, "fork preallocation count went stale");
    destination.page_table_count.fetch_add(installed, Ordering::Relaxed);

    // Return any stragglers (the source shrank in between).
    let mut leftovers = FrameRunBatcher::new();
    for frame in free_frames {
        leftovers.add(frame);
    }
    leftovers.flush();
}

fn mirror_child<'t, L>(
    parent: &'t mut Table<L>,
    index: usize,
    free_frames: &mut impl Iterator<Item = Frame>,
    installed: &mut usize,
) -> &'t mut Table<L::NextLevel>
where
    L: table::HierarchicalLevel,
{
    if parent.next_table(index).is_none() {
        let frame = match free_frames.next() {
            Some(frame) => frame,
            None => panic!("fork preallocation ran out of page-table frames"),
        };
        unsafe { table_from_frame::<L::NextLevel>(frame) }.zero();
        parent[index].set(frame, PteFlags::table_link() | PteFlags::USER_ACCESSIBLE);
        *installed += 1;
    }
    parent.next_table_mut(index).unwrap()
}

/// The fork-time copy: every mapped entry of `source` in the range is
/// made read-only (without flushing), then copied to `destination`
/// with the dirty bit masked out. One broadcast invalidation covers
/// the whole downgraded range at the end. The destination's covering
/// tables must have been preallocated.
pub fn copy_and_downgrade(
    source: &AddressSpace,
    destination: &AddressSpace,
    virt_addr: VirtualAddress,
    size_in_bytes: usize,
) {
    debug_assert!(virt_addr.is_page_aligned());
    debug_assert_eq!(size_in_bytes & (PAGE_SIZE - 1), 0);
    if size_in_bytes == 0 {
        return;
    }
    let pages = PageRange::from_addr(virt_addr, size_in_bytes);
    debug_assert!(is_user_page(pages.start()) && is_user_page(pages.end()));

    let mut copied = 0;
    {
        let _source_guard = source.lock.lock();
        let _destination_guard = destination.lock.lock();
        for page in pages.iter() {
            let source_p1 = match source.p1_of(&page) {
                Some(p1) => p1,
                None => continue,
            };
            let source_entry = &mut source_p1[page.p1_index()];
            if source_entry.is_unused() {
                continue;
            }
            source_entry.clear_flags(PteFlags::WRITABLE);
            let destination_p1 = match destination.p1_of(&page) {
                Some(p1) => p1,
                None => panic!("copy_and_downgrade: no preallocated table covers {:?}", page),
            };
            destination_p1[page.p1_index()]
                .set_raw(source_entry.value() & !PteFlags::DIRTY.bits());
            copied += 1;
        }
    }

    // One shootdown for the entire range now that the copy is done.
    broadcast_invalidate(source, pages);
    if copied != 0 {
        destination.resident_set.fetch_add(copied, Ordering::Relaxed);
    }
}

impl AddressSpace {
    /// Ensures every page table covering the given range exists,
    /// allocating and zeroing new ones as needed.
    pub fn create_page_tables(&self, virt_addr: VirtualAddress, size_in_bytes: usize) {
        if size_in_bytes == 0 {
            return;
        }
        let _guard = self.lock.lock();
        let pages = PageRange::from_addr(virt_addr, size_in_bytes);
        let mut new_user_tables = 0;
        let mut page = *pages.start();
        loop {
            let _ = self.p1_create(&page, &mut new_user_tables);
            // Hop to the first page of the next leaf table.
            let next = Page::from_number((page.number() | 0x1FF) + 1);
            if next > *pages.end() {
                break;
            }
            page = next;
        }
        if new_user_tables != 0 {
            self.page_table_count.fetch_add(new_user_tables, Ordering::Relaxed);
        }
    }

    /// Reassigns the paging descriptors of every mapped frame in the
    /// given user range from `old_section` to `new_section`, with each
    /// page's descriptor offset rebased to `new_base_offset` plus its
    /// index in the range.
    pub fn migrate_paging_descriptors(
        &self,
        old_section: &SectionRef,
        new_section: &SectionRef,
        virt_addr: VirtualAddress,
        page_count: usize,
        new_base_offset: usize,
    ) {
        let _guard = self.lock.lock();
        let first_page = Page::containing_address(virt_addr);
        let mut pages: Vec<(Frame, usize)> = Vec::new();
        for index in 0..page_count {
            let page = first_page + index;
            if let Some(p1) = self.p1_of(&page) {
                if let Some(frame) = p1[page.p1_index()].frame() {
                    pages.push((frame, new_base_offset + index));
                }
            }
        }
        frame_allocator::migrate_descriptors(&pages, old_section, new_section);
    }
}

/// Batches physical frees into contiguous runs, since most unmapped
/// ranges and torn-down tables free neighboring frames.
struct FrameRunBatcher {
    start: Option<Frame>,
    length: usize,
}

impl FrameRunBatcher {
    fn new() -> FrameRunBatcher {
        FrameRunBatcher { start: None, length: 0 }
    }

    fn add(&mut self, frame: Frame) {
        match self.start {
            Some(start) if start + self.length == frame => self.length += 1,
            Some(start) => {
                frame_allocator::free_frames(start, self.length);
                self.start = Some(frame);
                self.length = 1;
            }
            None => {
                self.start = Some(frame);
                self.length = 1;
            }
        }
    }

    fn flush(&mut self) {
        if let Some(start) = self.start.take() {
            frame_allocator::free_frames(start, self.length);
            self.length = 0;
        }
    }
}
