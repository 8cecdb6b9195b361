//! Provides the physical page database and the allocator built on it.
//!
//! Every usable frame of physical memory is described by one
//! [`FrameRecord`], and records are grouped into contiguous
//! [`Segment`]s built from the boot memory map. A single system-wide
//! lock guards the database; all record and counter mutations happen
//! under it.
//!
//! Allocation searches the segments with a rotating cursor so that
//! requests sweep across memory rather than hammering the same frames.
//! When the search comes up empty, the allocator asks the pager for a
//! target number of free pages and waits on the pages-freed event; only
//! after about three minutes of fruitless retries does it declare the
//! system out of memory. A second, independent cursor serves the
//! pager's own search for eviction victims, so the two sweeps do not
//! interfere.
//!
//! The database also tracks the memory warning level derived from the
//! ratio of allocated frames to total, pulsing [`warning_event`] on
//! each level crossing. To keep the common paths cheap, the thresholds
//! are only consulted when the low bits of the allocate/free counters
//! are zero (roughly every 1% of total memory's worth of operations).

#![no_std]

extern crate alloc;

#[cfg(test)]
extern crate std;

#[macro_use]
extern crate static_assertions;

use alloc::sync::Arc;
use alloc::vec::Vec;
use core::cmp::{max, min};
use core::mem::size_of;
use image_section::{DescriptorRef, PageCacheRef, SectionRef};
use kernel_config::memory::{MAX_PHYSICAL_ADDRESS, PAGE_SHIFT, PAGE_SIZE};
use log::{debug, error, warn};
use memory_structs::{Frame, MemoryRegion, MemoryRegionType, PhysicalAddress, VirtualAddress};
use pulse_event::PulseEvent;
use spin::{Mutex, Once};

#[cfg(test)]
mod tests;

/// The number of concurrent lock requests on one frame before callers
/// start getting rejected.
const MAX_FRAME_LOCK_COUNT: u8 = 15;

/// The percentage of physical pages that should remain free.
const MIN_FREE_PERCENT: usize = 5;

/// The physical memory percentages for each memory warning level.
const WARNING_LEVEL_1_HIGH_PERCENT: usize = 97;
const WARNING_LEVEL_1_LOW_PERCENT: usize = 95;
const WARNING_LEVEL_2_HIGH_PERCENT: usize = 90;
const WARNING_LEVEL_2_LOW_PERCENT: usize = 87;

/// The percentage of physical pages used to derive the warning count mask.
const WARNING_COUNT_MASK_PERCENT: usize = 1;

/// How long allocation retries against the pager before declaring the
/// system truly out of memory.
const ALLOCATION_TIMEOUT_MILLIS: u64 = 180_000;

/// One record per usable physical frame.
///
/// A frame is in exactly one of four states. The back-references are
/// severed under the database lock; see the crate documentation of
/// `image_section` for how the reference cycles are broken.
enum FrameRecord {
    /// The frame is free for allocation.
    Free,
    /// Allocated, not subject to eviction. Page-cache-owned frames
    /// carry a back-reference to their cache entry.
    NonPaged { cache_entry: Option<PageCacheRef> },
    /// Allocated and evictable; the descriptor says how it is backed.
    Pageable(DescriptorRef),
    /// Holds memory-manager structures; never returned and never freed.
    Reserved,
}

// The records array has one entry per frame of physical memory, so the
// record must stay small: one word of discriminant plus a (fat) pointer.
const_assert!(size_of::<FrameRecord>() <= 3 * size_of::<usize>());

/// A contiguous run of physical frames described by one record array.
struct Segment {
    start: Frame,
    free_frames: usize,
    records: Vec<FrameRecord>,
}

impl Segment {
    fn frame_count(&self) -> usize {
        self.records.len()
    }

    fn contains(&self, frame: Frame) -> bool {
        frame >= self.start && frame - self.start < self.frame_count()
    }

    fn offset_of(&self, frame: Frame) -> usize {
        frame - self.start
    }

    fn frame_at(&self, offset: usize) -> Frame {
        self.start + offset
    }
}

/// What a database search is looking for.
#[derive(Clone, Copy, PartialEq, Eq)]
enum FrameSearch {
    /// A run of free frames.
    Free,
    /// Evictable frames: pageable, unlocked, not already being paged out.
    Pageable,
    /// Free frames whose identical virtual address is also unused.
    IdentityMappable,
}

/// A rotating position in the segment list.
#[derive(Clone, Copy)]
struct SearchCursor {
    segment: usize,
    offset: usize,
}

/// The memory warning level, derived from the ratio of allocated
/// frames to total. `Level1` is the more severe of the two.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WarningLevel {
    None,
    Level1,
    Level2,
}

struct WarningThresholds {
    level1_high: usize,
    level1_low: usize,
    level2_high: usize,
    level2_low: usize,
    /// Allocate/free counters are sampled against this mask; warning
    /// levels are only re-evaluated when the masked bits are zero.
    count_mask: usize,
}

struct FrameDatabase {
    segments: Vec<Segment>,
    total_frames: usize,
    allocated_frames: usize,
    non_paged_frames: usize,
    minimum_free_frames: usize,
    allocation_cursor: SearchCursor,
    pager_cursor: SearchCursor,
    allocation_count: usize,
    free_count: usize,
    warning_level: WarningLevel,
    thresholds: WarningThresholds,
}

impl FrameDatabase {
    const fn empty() -> FrameDatabase {
        FrameDatabase {
            segments: Vec::new(),
            total_frames: 0,
            allocated_frames: 0,
            non_paged_frames: 0,
            minimum_free_frames: 0,
            allocation_cursor: SearchCursor { segment: 0, offset: 0 },
            pager_cursor: SearchCursor { segment: 0, offset: 0 },
            allocation_count: 0,
            free_count: 0,
            warning_level: WarningLevel::None,
            thresholds: WarningThresholds {
                level1_high: 0,
                level1_low: 0,
                level2_high: 0,
                level2_low: 0,
                count_mask: 0,
            },
        }
    }

    fn free_frames(&self) -> usize {
        self.total_frames - self.allocated_frames
    }

    fn segment_index_of(&self, frame: Frame) -> Option<usize> {
        self.segments.iter().position(|segment| segment.contains(frame))
    }
}

/// The single, system-wide physical page database.
static FRAME_DB: Mutex<FrameDatabase> = Mutex::new(FrameDatabase::empty());

/// Pulsed on every warning-level transition.
static WARNING_EVENT: PulseEvent = PulseEvent::new();

/// Pulsed by the pager as evictions free up memory, waking waiting
/// allocators so they retry.
static PAGES_FREED_EVENT: PulseEvent = PulseEvent::new();

/// Wakes the pager with a target free-page count.
static REQUEST_PAGEOUT_HOOK: Once<fn(usize)> = Once::new();

/// Asks the kernel virtual-address accounting whether the given range
/// is free, for identity-mappable allocation.
static IDENTITY_VA_CHECK: Once<fn(VirtualAddress, usize) -> bool> = Once::new();

/// A monotonic millisecond clock, used only for the allocation timeout.
static TIME_SOURCE: Once<fn() -> u64> = Once::new();

/// Registers the hook that wakes the pager. Called once by the pager
/// during its initialization.
pub fn set_request_pageout_hook(hook: fn(usize)) {
    REQUEST_PAGEOUT_HOOK.call_once(|| hook);
}

/// Registers the kernel virtual-address accounting query used by
/// [`allocate_identity_mappable`]. Until this is registered, identity
/// allocation always fails.
pub fn set_identity_va_check(check: fn(VirtualAddress, usize) -> bool) {
    IDENTITY_VA_CHECK.call_once(|| check);
}

/// Registers a monotonic millisecond clock. Until one is registered
/// (e.g., before timers calibrate during boot), allocation waits are
/// not bounded by the out-of-memory timeout.
pub fn set_time_source(now_millis: fn() -> u64) {
    TIME_SOURCE.call_once(|| now_millis);
}

/// Returns the event pulsed on every memory warning level transition.
pub fn warning_event() -> &'static PulseEvent {
    &WARNING_EVENT
}

/// Returns the current memory warning level.
pub fn warning_level() -> WarningLevel {
    FRAME_DB.lock().warning_level
}

/// Returns the event pulsed by the pager as it frees pages.
pub fn pages_freed_event() -> &'static PulseEvent {
    &PAGES_FREED_EVENT
}

/// A point-in-time snapshot of the physical memory counters.
#[derive(Clone, Copy, Debug)]
pub struct MemoryStats {
    pub total_frames: usize,
    pub allocated_frames: usize,
    pub non_paged_frames: usize,
    pub free_frames: usize,
    pub minimum_free_frames: usize,
}

pub fn statistics() -> MemoryStats {
    let db = FRAME_DB.lock();
    MemoryStats {
        total_frames: db.total_frames,
        allocated_frames: db.allocated_frames,
        non_paged_frames: db.non_paged_frames,
        free_frames: db.free_frames(),
        minimum_free_frames: db.minimum_free_frames,
    }
}

pub fn total_frames() -> usize {
    FRAME_DB.lock().total_frames
}

pub fn free_frames_count() -> usize {
    FRAME_DB.lock().free_frames()
}

pub fn non_paged_frames_count() -> usize {
    FRAME_DB.lock().non_paged_frames
}

/// Initialize the frame database from the boot-provided memory map.
///
/// This walks the map twice: once to count segments and usable pages
/// (optionally capped by `page_limit`), and once more to build the
/// segment headers and frame records, after carving the space those
/// structures occupy out of the front of free memory. Frame 0 is
/// withheld from the database even when the map reports it free, so
/// that a zero frame number can serve as a null value elsewhere.
pub fn init(memory_map: &[MemoryRegion], page_limit: Option<usize>) -> Result<(), &'static str> {
    let mut db = FRAME_DB.lock();
    if !db.segments.is_empty() {
        return Err("frame database was already initialized, cannot be initialized twice");
    }

    let mut regions = normalize_memory_map(memory_map)?;

    // First pass: count usable pages and coalesced segments.
    let (uncapped_pages, segment_count) = count_pages_and_segments(&regions);
    let mut total_pages = uncapped_pages;
    if let Some(limit) = page_limit {
        total_pages = min(total_pages, limit);
    }
    if total_pages == 0 {
        return Err("boot memory map describes no usable physical memory");
    }

    // Carve out the space for the database structures themselves. The
    // carved frames reappear below as non-paged MM-structure pages, so
    // the accounting covers them. The record storage proper lives on
    // the early heap, which the embedding kernel points at this region.
    let arena_bytes =
        segment_count * size_of::<Segment>() + total_pages * size_of::<FrameRecord>();
    let arena_pages = (arena_bytes + PAGE_SIZE - 1) >> PAGE_SHIFT;
    carve_arena(&mut regions, arena_pages)?;

    // Second pass: build the segments and initialize every record.
    let mut segments: Vec<Segment> = Vec::with_capacity(segment_count);
    let mut allocated = 0;
    let mut non_paged = 0;
    let mut pages_initialized = 0;
    let mut last_end: Option<PhysicalAddress> = None;
    for region in &regions {
        if pages_initialized == total_pages {
            break;
        }
        if last_end != Some(region.base) {
            segments.push(Segment {
                start: Frame::containing_address(region.base),
                free_frames: 0,
                records: Vec::new(),
            });
        }
        let segment = segments.last_mut().ok_or("no segment to initialize")?;
        let mut remaining = region.size_in_bytes >> PAGE_SHIFT;
        while remaining != 0 && pages_initialized < total_pages {
            if region.typ.is_free() {
                segment.records.push(FrameRecord::Free);
                segment.free_frames += 1;
            } else if region.typ == MemoryRegionType::MmStructures {
                segment.records.push(FrameRecord::Reserved);
                allocated += 1;
                non_paged += 1;
            } else {
                segment.records.push(FrameRecord::NonPaged { cache_entry: None });
                allocated += 1;
                non_paged += 1;
            }
            remaining -= 1;
            pages_initialized += 1;
        }
        last_end = Some(region.base + region.size_in_bytes);
    }

    db.segments = segments;
    db.total_frames = pages_initialized;
    db.allocated_frames = allocated;
    db.non_paged_frames = non_paged;
    db.minimum_free_frames = pages_initialized * MIN_FREE_PERCENT / 100;
    db.allocation_cursor = SearchCursor { segment: 0, offset: 0 };
    db.pager_cursor = SearchCursor { segment: 0, offset: 0 };
    db.allocation_count = 0;
    db.free_count = 0;
    db.warning_level = WarningLevel::None;
    db.thresholds = WarningThresholds {
        level1_high: pages_initialized * WARNING_LEVEL_1_HIGH_PERCENT / 100,
        level1_low: pages_initialized * WARNING_LEVEL_1_LOW_PERCENT / 100,
        level2_high: pages_initialized * WARNING_LEVEL_2_HIGH_PERCENT / 100,
        level2_low: pages_initialized * WARNING_LEVEL_2_LOW_PERCENT / 100,
        count_mask: warning_count_mask(pages_initialized),
    };

    debug!(
        "frame database: {} usable pages in {} segments, {} allocated at boot, minimum free {}",
        db.total_frames,
        db.segments.len(),
        db.allocated_frames,
        db.minimum_free_frames,
    );
    Ok(())
}

/// Copies the usable regions of the boot map, checking alignment,
/// clamping to the maximum physical address, sorting by base, and
/// withholding frame 0.
fn normalize_memory_map(memory_map: &[MemoryRegion]) -> Result<Vec<MemoryRegion>, &'static str> {
    let mut regions: Vec<MemoryRegion> = Vec::with_capacity(memory_map.len());
    for region in memory_map {
        if !region.typ.is_usable() {
            continue;
        }
        if !region.base.is_page_aligned() || region.size_in_bytes & (PAGE_SIZE - 1) != 0 {
            return Err("boot memory map regions must be page aligned");
        }
        let mut region = *region;
        if region.base.value() >= MAX_PHYSICAL_ADDRESS {
            continue;
        }
        if region.base.value() + region.size_in_bytes > MAX_PHYSICAL_ADDRESS {
            region.size_in_bytes = MAX_PHYSICAL_ADDRESS - region.base.value();
        }
        if region.size_in_bytes == 0 {
            continue;
        }
        regions.push(region);
    }
    regions.sort_unstable_by_key(|region| region.base.value());
    for window in regions.windows(2) {
        if window[0].end() > window[1].base {
            return Err("boot memory map regions overlap");
        }
    }

    // Withhold frame 0: it does not do well in the general pool, and a
    // zero frame number doubles as a null value in page table entries.
    if let Some(first) = regions.first_mut() {
        if first.base.value() == 0 && first.typ.is_free() {
            first.base += PAGE_SIZE;
            first.size_in_bytes -= PAGE_SIZE;
            if first.size_in_bytes == 0 {
                regions.remove(0);
            }
        }
    }
    Ok(regions)
}

fn count_pages_and_segments(regions: &[MemoryRegion]) -> (usize, usize) {
    let mut pages = 0;
    let mut segments = 0;
    let mut last_end: Option<PhysicalAddress> = None;
    for region in regions {
        if last_end != Some(region.base) {
            segments += 1;
        }
        pages += region.size_in_bytes >> PAGE_SHIFT;
        last_end = Some(region.base + region.size_in_bytes);
    }
    (pages, segments)
}

/// Bites `arena_pages` off the front of the first free region large
/// enough, retyping them as MM structures.
fn carve_arena(regions: &mut Vec<MemoryRegion>, arena_pages: usize) -> Result<(), &'static str> {
    let arena_bytes = arena_pages << PAGE_SHIFT;
    let index = regions
        .iter()
        .position(|region| region.typ.is_free() && region.size_in_bytes >= arena_bytes)
        .ok_or("not enough contiguous free memory for the frame database structures")?;

    let carved = MemoryRegion::new(regions[index].base, arena_bytes, MemoryRegionType::MmStructures);
    regions[index].base += arena_bytes;
    regions[index].size_in_bytes -= arena_bytes;
    if regions[index].size_in_bytes == 0 {
        regions[index] = carved;
    } else {
        regions.insert(index, carved);
    }
    Ok(())
}

/// Computes the allocate/free counter sampling mask: 1% of total pages
/// rounded down to a power of two, minus one.
fn warning_count_mask(total_pages: usize) -> usize {
    let raw = total_pages * WARNING_COUNT_MASK_PERCENT / 100;
    if raw == 0 {
        0
    } else {
        let highest_bit = usize::BITS as usize - 1 - raw.leading_zeros() as usize;
        (1 << highest_bit) - 1
    }
}

/// Tears the database down to its uninitialized state.
/// Only for use by unit tests; real frame records are never destroyed.
#[doc(hidden)]
pub fn teardown() {
    *FRAME_DB.lock() = FrameDatabase::empty();
}

/// Verifies the database's global counter invariants.
#[doc(hidden)]
pub fn consistency_check() -> Result<(), &'static str> {
    let db = FRAME_DB.lock();
    let free_sum: usize = db.segments.iter().map(|segment| segment.free_frames).sum();
    if free_sum != db.total_frames - db.allocated_frames {
        return Err("segment free counts do not sum to total minus allocated");
    }
    if db.non_paged_frames > db.allocated_frames || db.allocated_frames > db.total_frames {
        return Err("non_paged <= allocated <= total violated");
    }
    Ok(())
}

/// Attempts to find a run of frames matching the given criteria,
/// starting from the appropriate cursor.
///
/// For `Free` and `IdentityMappable` searches, only a full run of
/// `page_count` frames (at `page_alignment`) matches. For `Pageable`
/// searches, any non-empty run up to `page_count` matches, and each
/// accepted frame's descriptor has its paging-out flag set before the
/// lock is released, transferring ownership to the pager.
///
/// On a match the corresponding cursor is advanced past the selection.
/// Returns the segment index, the offset within it, and the number of
/// frames found.
fn find_frames(
    db: &mut FrameDatabase,
    page_count: usize,
    page_alignment: usize,
    search: FrameSearch,
) -> Option<(usize, usize, usize)> {
    debug_assert!(page_alignment != 0);
    if db.segments.is_empty() {
        return None;
    }

    let start_cursor = match search {
        FrameSearch::Pageable => db.pager_cursor,
        _ => db.allocation_cursor,
    };
    let start_segment = min(start_cursor.segment, db.segments.len() - 1);
    let mut segment_index = start_segment;

    // Start from the cursor, aligned up as required.
    let segment = &db.segments[segment_index];
    let aligned_page = align_up(segment.start.number() + start_cursor.offset, page_alignment);
    let mut offset = aligned_page - segment.start.number();
    let first_offset = offset;
    let mut segment_page_count = segment.frame_count();

    // Loop until the walk comes back around to where it started.
    let mut first_iteration = true;
    loop {
        // Advance to the next segment when this one is walked off or
        // cannot possibly satisfy the request.
        if offset >= segment_page_count
            || (search != FrameSearch::Pageable && offset + page_count > segment_page_count)
            || (search == FrameSearch::Free
                && db.segments[segment_index].free_frames < page_count)
        {
            if segment_index == start_segment && !first_iteration {
                return None;
            }
            first_iteration = false;
            segment_index = (segment_index + 1) % db.segments.len();
            let segment = &db.segments[segment_index];
            segment_page_count = segment.frame_count();
            let aligned = align_up(segment.start.number(), page_alignment);
            offset = aligned - segment.start.number();
            // The alignment may have pushed the offset off this
            // segment too, so run all the checks again.
            if segment_index == start_segment && offset == first_offset {
                return None;
            }
            continue;
        }

        // Collect as many matching frames as the criteria wants from
        // the current position.
        let span_target = if search == FrameSearch::Pageable {
            min(page_count, segment_page_count - offset)
        } else {
            page_count
        };
        let segment = &db.segments[segment_index];
        let mut span = 0;
        while span < span_target {
            let matches = match (&segment.records[offset + span], search) {
                (FrameRecord::Free, FrameSearch::Free) => true,
                (FrameRecord::Free, FrameSearch::IdentityMappable) => {
                    identity_va_is_free(segment.frame_at(offset + span))
                }
                (FrameRecord::Pageable(descriptor), FrameSearch::Pageable) => {
                    debug_assert!(
                        !descriptor.section().destroyed(),
                        "pageable frame references a destroyed section",
                    );
                    if descriptor.lock_count() != 0 || descriptor.is_paging_out() {
                        false
                    } else {
                        // Mark the frame as owned by the pager so it
                        // cannot be freed out from under the writeback.
                        descriptor.begin_page_out();
                        true
                    }
                }
                _ => false,
            };
            if !matches {
                break;
            }
            span += 1;
        }

        if span == page_count || (span != 0 && search == FrameSearch::Pageable) {
            let cursor = SearchCursor { segment: segment_index, offset: offset + span };
            match search {
                FrameSearch::Pageable => db.pager_cursor = cursor,
                _ => db.allocation_cursor = cursor,
            }
            return Some((segment_index, offset, span));
        }

        offset += if search == FrameSearch::Pageable { 1 } else { page_alignment };
        if segment_index == start_segment && offset == first_offset {
            return None;
        }
    }
}

fn identity_va_is_free(frame: Frame) -> bool {
    let check = match IDENTITY_VA_CHECK.get() {
        Some(check) => check,
        None => return false,
    };
    match VirtualAddress::new(frame.start_address().value()) {
        Some(virt_addr) => check(virt_addr, 1),
        None => false,
    }
}

const fn align_up(value: usize, alignment: usize) -> usize {
    (value + alignment - 1) / alignment * alignment
}

/// Allocates a run of `page_count` contiguous physical frames aligned
/// to `page_alignment` frames, marking them non-paged.
///
/// This never returns failure: if no run is available, it asks the
/// pager to evict and waits on the pages-freed event, panicking only
/// after the out-of-memory timeout expires. It must therefore never be
/// called from the pager's own task, and the caller must not hold the
/// section or database locks.
pub fn allocate_frames(page_count: usize, page_alignment: usize) -> Frame {
    assert!(page_count != 0, "cannot allocate zero frames");
    let alignment = max(page_alignment, 1);

    let mut deadline: Option<u64> = None;
    loop {
        let (target, wait_token) = {
            let mut db = FRAME_DB.lock();
            assert!(
                !db.segments.is_empty(),
                "allocate_frames invoked before the frame database was initialized",
            );
            if let Some((segment_index, offset, _)) =
                find_frames(&mut db, page_count, alignment, FrameSearch::Free)
            {
                let segment = &mut db.segments[segment_index];
                for index in 0..page_count {
                    debug_assert!(matches!(segment.records[offset + index], FrameRecord::Free));
                    segment.records[offset + index] = FrameRecord::NonPaged { cache_entry: None };
                }
                segment.free_frames -= page_count;
                let frame = segment.frame_at(offset);
                db.allocated_frames += page_count;
                db.non_paged_frames += page_count;
                debug_assert!(db.allocated_frames <= db.total_frames);
                db.allocation_count = db.allocation_count.wrapping_add(1);
                let signal = note_allocation_for_warning(&mut db, page_count);
                drop(db);
                if signal {
                    WARNING_EVENT.pulse();
                }
                return frame;
            }

            // No luck. Ask the pager to get back to the minimum free
            // count, or at least enough to hopefully satisfy this
            // request, and wait for it to make progress. The token is
            // taken before the lock drops so a pulse in between is not
            // lost.
            let target = max(db.minimum_free_frames, page_count + alignment);
            (target, PAGES_FREED_EVENT.current())
        };

        debug!(
            "allocate_frames: no run of {} pages (alignment {}), requesting page-out to {} free",
            page_count, alignment, target,
        );
        request_pageout(target);
        PAGES_FREED_EVENT.wait(wait_token);

        if let Some(now_millis) = TIME_SOURCE.get() {
            let now = now_millis();
            match deadline {
                None => deadline = Some(now + ALLOCATION_TIMEOUT_MILLIS),
                Some(deadline) if now >= deadline => panic!(
                    "out of memory: gave up allocating {} pages (alignment {}) after {} ms",
                    page_count, alignment, ALLOCATION_TIMEOUT_MILLIS,
                ),
                Some(_) => {}
            }
        }
    }
}

/// Fills `frames` with individually allocated single frames, for
/// callers (such as leaf-table preallocation) that need many frames
/// but not contiguity. No section locks may be held.
pub fn allocate_frames_scattered(frames: &mut [Frame]) {
    for slot in frames.iter_mut() {
        *slot = allocate_frames(1, 1);
    }
}

/// Allocates physical frames that can be identity mapped: the
/// identical virtual address range is verified free with the kernel
/// VA accounting. Unlike [`allocate_frames`], this never waits on the
/// pager; callers must cope with failure.
pub fn allocate_identity_mappable(page_count: usize, page_alignment: usize) -> Option<Frame> {
    assert!(page_count != 0, "cannot allocate zero frames");
    let alignment = max(page_alignment, 1);
    if IDENTITY_VA_CHECK.get().is_none() {
        debug!("allocate_identity_mappable: no VA accounting registered, failing");
        return None;
    }

    let mut db = FRAME_DB.lock();
    let (segment_index, offset, _) =
        find_frames(&mut db, page_count, alignment, FrameSearch::IdentityMappable)?;
    let segment = &mut db.segments[segment_index];
    for index in 0..page_count {
        debug_assert!(matches!(segment.records[offset + index], FrameRecord::Free));
        segment.records[offset + index] = FrameRecord::NonPaged { cache_entry: None };
    }
    segment.free_frames -= page_count;
    let frame = segment.frame_at(offset);
    db.allocated_frames += page_count;
    db.non_paged_frames += page_count;
    debug_assert!(db.allocated_frames <= db.total_frames);
    Some(frame)
}

/// The disposition of one record on the free path.
enum Released {
    No,
    NonPaged,
    Pageable,
}

/// Frees a contiguous run of physical frames.
///
/// Non-paged frames flip straight to free. A pageable frame whose
/// descriptor is flagged as paging out is left alone: the pager owns
/// it and will complete the transition. Other pageable frames are
/// freed and their now-orphaned descriptors are destroyed after the
/// database lock is released (descriptor teardown may take section
/// locks, which order before the database lock on this path).
///
/// Freeing a frame that is already free indicates corruption and
/// panics. Freeing a frame outside every segment is a defensive no-op.
pub fn free_frames(first_frame: Frame, page_count: usize) {
    let mut orphaned_descriptors: Vec<DescriptorRef> = Vec::new();
    let mut signal = false;
    {
        let mut db = FRAME_DB.lock();
        let segment_index = match db.segment_index_of(first_frame) {
            Some(index) => index,
            None => {
                error!("free_frames: attempt to free non-existent frame {:?}", first_frame);
                debug_assert!(false, "free of a frame outside every segment");
                return;
            }
        };
        let offset = db.segments[segment_index].offset_of(first_frame);
        debug_assert!(
            offset + page_count <= db.segments[segment_index].frame_count(),
            "contiguous frames must share one segment",
        );

        for index in 0..page_count {
            let released = {
                let record = &mut db.segments[segment_index].records[offset + index];
                match record {
                    FrameRecord::Free => {
                        panic!("free_frames: frame {:?} was already free", first_frame + index)
                    }
                    FrameRecord::Reserved => {
                        error!(
                            "free_frames: ignoring free of reserved frame {:?}",
                            first_frame + index,
                        );
                        Released::No
                    }
                    FrameRecord::NonPaged { .. } => {
                        *record = FrameRecord::Free;
                        Released::NonPaged
                    }
                    FrameRecord::Pageable(descriptor) => {
                        if descriptor.is_paging_out() {
                            // The pager owns this frame now and will
                            // release it when the writeback completes.
                            Released::No
                        } else {
                            debug_assert_eq!(descriptor.lock_count(), 0);
                            orphaned_descriptors.push(descriptor.clone());
                            *record = FrameRecord::Free;
                            Released::Pageable
                        }
                    }
                }
            };

            match released {
                Released::No => continue,
                Released::NonPaged => db.non_paged_frames -= 1,
                Released::Pageable => {}
            }
            db.allocated_frames -= 1;
            db.segments[segment_index].free_frames += 1;
            db.free_count = db.free_count.wrapping_add(1);
            if !signal {
                signal = note_free_for_warning(&mut db);
            }
        }
    }

    drop(orphaned_descriptors);
    if signal {
        WARNING_EVENT.pulse();
    }
}

/// Transitions a run of non-paged frames to pageable, installing one
/// paging descriptor per frame. This is a separate step from
/// allocation so a page being paged in is never visible to the pager
/// mid-flight. With `lock_initial`, the pages start locked instead of
/// joining the evictable pool.
pub fn enable_paging_for(
    first_frame: Frame,
    page_count: usize,
    descriptors: &[DescriptorRef],
    lock_initial: bool,
) {
    assert_eq!(descriptors.len(), page_count, "one descriptor per frame is required");
    let mut db = FRAME_DB.lock();
    let segment_index = match db.segment_index_of(first_frame) {
        Some(index) => index,
        None => {
            error!("enable_paging_for: frame {:?} is outside every segment", first_frame);
            debug_assert!(false, "enable paging on a frame outside every segment");
            return;
        }
    };
    let offset = db.segments[segment_index].offset_of(first_frame);
    for index in 0..page_count {
        let descriptor = &descriptors[index];
        debug_assert!(
            !descriptor.section().destroyed(),
            "installing a descriptor whose section is destroyed",
        );
        {
            let record = &mut db.segments[segment_index].records[offset + index];
            match record {
                FrameRecord::NonPaged { .. } => {}
                _ => {
                    error!(
                        "enable_paging_for: frame {:?} is not a non-paged allocation",
                        first_frame + index,
                    );
                    debug_assert!(false, "enable paging on a frame that is not non-paged");
                    continue;
                }
            }
            *record = FrameRecord::Pageable(descriptor.clone());
        }
        if lock_initial {
            debug_assert_eq!(descriptor.lock_count(), 0);
            descriptor.set_initial_lock_count(1);
        } else {
            db.non_paged_frames -= 1;
        }
    }
}

/// Why a lock or unlock request failed.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FrameLockError {
    /// The per-frame lock count is at its cap; retry later.
    ResourceInUse,
    /// The frame is outside every known segment.
    UnknownFrame,
}

/// Locks a run of frames in memory, keeping them out of the pager's
/// reach. Non-paged frames are implicitly locked already and are
/// skipped. The caller must hold the owning section's lock.
///
/// On failure, any frames locked by this call are unlocked again.
pub fn lock_frames(first_frame: Frame, page_count: usize) -> Result<(), FrameLockError> {
    let mut locked_pages = 0;
    let result = {
        let mut db = FRAME_DB.lock();
        let segment_index = match db.segment_index_of(first_frame) {
            Some(index) => index,
            None => {
                debug_assert!(false, "lock of a frame outside every segment");
                return Err(FrameLockError::UnknownFrame);
            }
        };
        let offset = db.segments[segment_index].offset_of(first_frame);
        let mut failure = None;
        for index in 0..page_count {
            let newly_locked = {
                let record = &db.segments[segment_index].records[offset + index];
                match record {
                    FrameRecord::Free => {
                        panic!("lock_frames: frame {:?} is free", first_frame + index)
                    }
                    FrameRecord::NonPaged { .. } | FrameRecord::Reserved => false,
                    FrameRecord::Pageable(descriptor) => {
                        if descriptor.lock_count() == MAX_FRAME_LOCK_COUNT {
                            failure = Some(FrameLockError::ResourceInUse);
                            break;
                        }
                        descriptor.increment_lock_count() == 1
                    }
                }
            };
            if newly_locked {
                db.non_paged_frames += 1;
            }
            locked_pages = index + 1;
        }
        match failure {
            Some(error) => Err(error),
            None => Ok(()),
        }
    };

    if result.is_err() && locked_pages != 0 {
        unlock_frames(first_frame, locked_pages);
    }
    result
}

/// Unlocks a run of frames locked with [`lock_frames`]. The caller
/// must hold the owning section's lock.
pub fn unlock_frames(first_frame: Frame, page_count: usize) {
    let mut db = FRAME_DB.lock();
    let segment_index = match db.segment_index_of(first_frame) {
        Some(index) => index,
        None => {
            error!("unlock_frames: frame {:?} is outside every segment", first_frame);
            debug_assert!(false, "unlock of a frame outside every segment");
            return;
        }
    };
    let offset = db.segments[segment_index].offset_of(first_frame);
    for index in 0..page_count {
        let fully_unlocked = {
            let record = &db.segments[segment_index].records[offset + index];
            match record {
                FrameRecord::Free => {
                    panic!("unlock_frames: frame {:?} is free", first_frame + index)
                }
                FrameRecord::NonPaged { .. } | FrameRecord::Reserved => false,
                FrameRecord::Pageable(descriptor) => {
                    debug_assert!(descriptor.lock_count() != 0);
                    descriptor.decrement_lock_count() == 0
                }
            }
        };
        if fully_unlocked {
            db.non_paged_frames -= 1;
        }
    }
}

/// Attaches a page-cache back-reference to a non-paged frame, so
/// physical-to-cache lookups can find the owning cache page.
pub fn set_page_cache_entry(frame: Frame, entry: PageCacheRef) {
    let mut db = FRAME_DB.lock();
    let segment_index = match db.segment_index_of(frame) {
        Some(index) => index,
        None => {
            error!("set_page_cache_entry: frame {:?} is outside every segment", frame);
            debug_assert!(false, "page cache entry on a frame outside every segment");
            return;
        }
    };
    let offset = db.segments[segment_index].offset_of(frame);
    match &mut db.segments[segment_index].records[offset] {
        FrameRecord::NonPaged { cache_entry } => *cache_entry = Some(entry),
        _ => {
            error!("set_page_cache_entry: frame {:?} is not a non-paged allocation", frame);
            debug_assert!(false, "page cache entry on a frame that is not non-paged");
        }
    }
}

/// Returns the page-cache entry associated with a non-paged frame,
/// if any.
pub fn page_cache_entry(frame: Frame) -> Option<PageCacheRef> {
    let db = FRAME_DB.lock();
    let segment_index = db.segment_index_of(frame)?;
    let offset = db.segments[segment_index].offset_of(frame);
    match &db.segments[segment_index].records[offset] {
        FrameRecord::NonPaged { cache_entry } => cache_entry.clone(),
        _ => None,
    }
}

/// Re-points the paging descriptors of the given frames from one
/// section to another, updating each descriptor's section offset. The
/// swapped-out section references are released after the database lock
/// drops. Page-cache-owned (non-paged) frames are left untouched.
///
/// `old_section` must hold at least one reference beyond the
/// descriptors being migrated.
pub fn migrate_descriptors(
    pages: &[(Frame, usize)],
    old_section: &SectionRef,
    new_section: &SectionRef,
) {
    let mut released: Vec<SectionRef> = Vec::with_capacity(pages.len());
    {
        let db = FRAME_DB.lock();
        for (frame, new_offset) in pages {
            let segment_index = match db.segment_index_of(*frame) {
                Some(index) => index,
                None => {
                    debug_assert!(false, "migrating a frame outside every segment");
                    continue;
                }
            };
            let offset = db.segments[segment_index].offset_of(*frame);
            if let FrameRecord::Pageable(descriptor) =
                &db.segments[segment_index].records[offset]
            {
                debug_assert!(
                    Arc::ptr_eq(&descriptor.section(), old_section),
                    "migrating a descriptor owned by a different section",
                );
                released.push(descriptor.rebind(new_section.clone(), *new_offset));
            }
        }
    }
    drop(released);
}

/// One eviction candidate handed to the pager. The descriptor's
/// paging-out flag is already set: the frame belongs to the pager
/// until [`complete_page_out`] is called.
pub struct PageoutVictim {
    pub frame: Frame,
    pub descriptor: DescriptorRef,
    /// The owning section and offset, snapshotted under the database
    /// lock so descriptor migration cannot race the writeback setup.
    pub section: SectionRef,
    pub section_offset: usize,
}

/// Selects one pageable frame for eviction using the pager's own
/// cursor. Returns `None` when no evictable frame exists.
pub fn select_pageout_victim() -> Option<PageoutVictim> {
    let mut db = FRAME_DB.lock();
    let (segment_index, offset, found) = find_frames(&mut db, 1, 1, FrameSearch::Pageable)?;
    debug_assert_eq!(found, 1);
    let segment = &db.segments[segment_index];
    let frame = segment.frame_at(offset);
    let descriptor = match &segment.records[offset] {
        FrameRecord::Pageable(descriptor) => descriptor.clone(),
        _ => panic!("pageable search returned a non-pageable record"),
    };
    let (section, section_offset) = descriptor.backing();
    Some(PageoutVictim { frame, descriptor, section, section_offset })
}

/// Completes a page-out attempt started by [`select_pageout_victim`].
/// On success the frame becomes free; either way the descriptor's
/// paging-out flag is cleared, ending the pager's ownership.
pub fn complete_page_out(frame: Frame, descriptor: &DescriptorRef, success: bool) {
    let mut dropped_descriptor: Option<DescriptorRef> = None;
    let mut signal = false;
    {
        let mut db = FRAME_DB.lock();
        let segment_index = match db.segment_index_of(frame) {
            Some(index) => index,
            None => {
                debug_assert!(false, "completing page-out of a frame outside every segment");
                descriptor.end_page_out();
                return;
            }
        };
        let offset = db.segments[segment_index].offset_of(frame);
        if success {
            {
                let record = &mut db.segments[segment_index].records[offset];
                match record {
                    FrameRecord::Pageable(existing) => {
                        dropped_descriptor = Some(existing.clone());
                    }
                    _ => debug_assert!(false, "paged-out frame record changed state"),
                }
                *record = FrameRecord::Free;
            }
            db.allocated_frames -= 1;
            db.segments[segment_index].free_frames += 1;
            db.free_count = db.free_count.wrapping_add(1);
            signal = note_free_for_warning(&mut db);
        }
        descriptor.end_page_out();
    }

    drop(dropped_descriptor);
    if signal {
        WARNING_EVENT.pulse();
    }
}

fn request_pageout(target_free_pages: usize) {
    match REQUEST_PAGEOUT_HOOK.get() {
        Some(hook) => hook(target_free_pages),
        None => warn!("request_pageout: no pager registered, allocation will only retry"),
    }
}

/// Re-evaluates the warning level after an allocation, if the counter
/// sample bits say it is time (or the request was large enough to
/// matter on its own). Only upward transitions happen here; the free
/// path handles the way back down. Returns whether to pulse the event.
fn note_allocation_for_warning(db: &mut FrameDatabase, page_count: usize) -> bool {
    let mask = db.thresholds.count_mask;
    if db.allocation_count & mask != 0 && page_count < mask {
        return false;
    }
    if db.warning_level != WarningLevel::Level1
        && db.allocated_frames >= db.thresholds.level1_high
    {
        db.warning_level = WarningLevel::Level1;
        return true;
    }
    if db.warning_level == WarningLevel::None
        && db.allocated_frames >= db.thresholds.level2_high
    {
        db.warning_level = WarningLevel::Level2;
        return true;
    }
    false
}

/// The downward-direction counterpart, sampled on the free counter.
/// Levels are checked from the lowest page count to the highest.
fn note_free_for_warning(db: &mut FrameDatabase) -> bool {
    if db.free_count & db.thresholds.count_mask != 0 {
        return false;
    }
    if db.warning_level == WarningLevel::Level2
        && db.allocated_frames < db.thresholds.level2_low
    {
        db.warning_level = WarningLevel::None;
        return true;
    }
    if db.warning_level == WarningLevel::Level1
        && db.allocated_frames < db.thresholds.level1_low
    {
        db.warning_level = WarningLevel::Level2;
        return true;
    }
    false
}
