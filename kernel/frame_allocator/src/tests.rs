//! Tests for the frame database, exercised against a fake boot memory
//! map, a scripted pager stand-in, and a fake monotonic clock.
//!
//! The database is a process-wide singleton, so every test serializes
//! on [`test_lock`] and rebuilds the database from scratch.

use super::*;
use image_section::{ImageSection, PageOutContext, PageOutError, PagingDescriptor};
use memory_structs::{MemoryRegion, MemoryRegionType, PhysicalAddress};
use std::boxed::Box;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex as StdMutex;
use std::sync::MutexGuard;
use std::vec;
use std::vec::Vec;

static TEST_LOCK: StdMutex<()> = StdMutex::new(());

/// What the registered relax hook should do while an allocation waits.
static WAIT_BEHAVIOR: StdMutex<Option<Box<dyn FnMut() + Send>>> = StdMutex::new(None);

/// Every page-out target the allocator has requested.
static REQUESTED_TARGETS: StdMutex<Vec<usize>> = StdMutex::new(Vec::new());

/// Whether the fake kernel VA accounting reports ranges as free.
static IDENTITY_RANGES_FREE: AtomicBool = AtomicBool::new(true);

/// The fake monotonic clock, in milliseconds.
static FAKE_NOW_MILLIS: AtomicU64 = AtomicU64::new(0);

fn relax_hook() {
    if let Some(behavior) = WAIT_BEHAVIOR.lock().unwrap_or_else(|e| e.into_inner()).as_mut() {
        behavior();
    } else {
        std::thread::yield_now();
    }
}

fn request_pageout_hook(target: usize) {
    REQUESTED_TARGETS.lock().unwrap_or_else(|e| e.into_inner()).push(target);
}

fn identity_va_check(_virt_addr: VirtualAddress, _pages: usize) -> bool {
    IDENTITY_RANGES_FREE.load(Ordering::Relaxed)
}

fn fake_now_millis() -> u64 {
    FAKE_NOW_MILLIS.load(Ordering::Relaxed)
}

/// Serializes the test, installs the deterministic hooks, and resets
/// all shared state, leaving the database uninitialized.
fn test_lock() -> MutexGuard<'static, ()> {
    let guard = TEST_LOCK.lock().unwrap_or_else(|e| e.into_inner());
    pulse_event::set_wait_relax_hook(relax_hook);
    set_request_pageout_hook(request_pageout_hook);
    set_identity_va_check(identity_va_check);
    set_time_source(fake_now_millis);
    *WAIT_BEHAVIOR.lock().unwrap_or_else(|e| e.into_inner()) = None;
    REQUESTED_TARGETS.lock().unwrap_or_else(|e| e.into_inner()).clear();
    IDENTITY_RANGES_FREE.store(true, Ordering::Relaxed);
    FAKE_NOW_MILLIS.store(0, Ordering::Relaxed);
    teardown();
    guard
}

const KIB: usize = 1024;
const MIB: usize = 1024 * 1024;

/// `[0 .. 4 KiB reserved][4 KiB .. 64 MiB free]`
fn map_64mib() -> Vec<MemoryRegion> {
    vec![
        MemoryRegion::new(PhysicalAddress::zero(), 4 * KIB, MemoryRegionType::Reserved),
        MemoryRegion::new(
            PhysicalAddress::new_canonical(4 * KIB),
            64 * MIB - 4 * KIB,
            MemoryRegionType::Free,
        ),
    ]
}

/// An 8 MiB map that starts at physical zero, entirely free.
fn map_8mib_from_zero() -> Vec<MemoryRegion> {
    vec![MemoryRegion::new(PhysicalAddress::zero(), 8 * MIB, MemoryRegionType::Free)]
}

struct FakeSection {
    destroyed: AtomicBool,
}

impl FakeSection {
    fn new() -> SectionRef {
        Arc::new(FakeSection { destroyed: AtomicBool::new(false) })
    }
}

impl ImageSection for FakeSection {
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
        self.destroyed.load(Ordering::Relaxed)
    }
}

fn descriptors_for(section: &SectionRef, count: usize) -> Vec<DescriptorRef> {
    (0..count)
        .map(|offset| Arc::new(PagingDescriptor::new(section.clone(), offset)))
        .collect()
}

#[test]
fn boot_initialization_from_memory_map() {
    let _guard = test_lock();
    init(&map_64mib(), None).unwrap();

    let stats = statistics();
    // 64 MiB of 4 KiB pages, minus the reserved first page.
    assert_eq!(stats.total_frames, 16383);
    // The database's own structures were carved out of free memory.
    assert!(stats.allocated_frames >= 1);
    assert_eq!(stats.non_paged_frames, stats.allocated_frames);
    assert_eq!(stats.free_frames, stats.total_frames - stats.allocated_frames);
    assert_eq!(stats.minimum_free_frames, 16383 * 5 / 100);
    assert_eq!(warning_level(), WarningLevel::None);
    consistency_check().unwrap();

    assert!(init(&map_64mib(), None).is_err(), "double initialization must fail");
}

#[test]
fn frame_zero_is_withheld_from_free_maps() {
    let _guard = test_lock();
    init(&map_8mib_from_zero(), None).unwrap();
    // 2048 pages, minus the withheld frame 0.
    assert_eq!(statistics().total_frames, 2047);
    // Frame 0 is in no segment, so freeing it is a defensive no-op.
    let before = statistics();
    free_frames(Frame::from_number(0), 1);
    assert_eq!(statistics().allocated_frames, before.allocated_frames);
}

#[test]
fn page_limit_caps_the_database() {
    let _guard = test_lock();
    init(&map_64mib(), Some(1000)).unwrap();
    assert_eq!(statistics().total_frames, 1000);
    consistency_check().unwrap();
}

#[test]
fn allocate_free_allocate_rotates_the_cursor() {
    let _guard = test_lock();
    init(&map_64mib(), None).unwrap();
    let baseline = statistics().allocated_frames;

    let first = allocate_frames(1, 1);
    assert_eq!(statistics().allocated_frames, baseline + 1);
    free_frames(first, 1);
    assert_eq!(statistics().allocated_frames, baseline);

    // The second allocation succeeds but sweeps onward rather than
    // reusing the just-freed frame.
    let second = allocate_frames(1, 1);
    assert_ne!(second, first);
    assert_eq!(statistics().allocated_frames, baseline + 1);
    free_frames(second, 1);
    consistency_check().unwrap();
}

#[test]
fn aligned_allocation_returns_aligned_run() {
    let _guard = test_lock();
    init(&map_64mib(), None).unwrap();
    let baseline = statistics();

    // 10 pages aligned to 64 KiB, i.e., a frame number multiple of 16.
    let frame = allocate_frames(10, 16);
    assert_eq!(frame.number() % 16, 0);
    let stats = statistics();
    assert_eq!(stats.allocated_frames, baseline.allocated_frames + 10);
    assert_eq!(stats.non_paged_frames, baseline.non_paged_frames + 10);

    free_frames(frame, 10);
    assert_eq!(statistics().allocated_frames, baseline.allocated_frames);
    consistency_check().unwrap();
}

#[test]
fn exhaustion_requests_pageout_and_retries() {
    let _guard = test_lock();
    init(&map_8mib_from_zero(), None).unwrap();

    // Use up every free frame.
    let free = statistics().free_frames;
    let hog = allocate_frames(free, 1);

    // While the allocator waits, play the pager's part: free one frame
    // of the hog and announce the progress.
    let released = std::sync::Arc::new(AtomicBool::new(false));
    let released_for_hook = released.clone();
    *WAIT_BEHAVIOR.lock().unwrap() = Some(Box::new(move || {
        if !released_for_hook.swap(true, Ordering::Relaxed) {
            free_frames(hog, 1);
        }
        pages_freed_event().pulse();
    }));

    let frame = allocate_frames(1, 1);
    assert_eq!(frame, hog, "the freed frame is the only one available");
    assert!(released.load(Ordering::Relaxed));

    let targets = REQUESTED_TARGETS.lock().unwrap();
    assert!(!targets.is_empty(), "the allocator must have asked for a page-out");
    let minimum_free = statistics().minimum_free_frames;
    assert!(targets.iter().all(|&target| target >= minimum_free.max(2)));
    drop(targets);

    free_frames(frame, 1);
    free_frames(hog + 1, free - 1);
    consistency_check().unwrap();
}

#[test]
#[should_panic(expected = "out of memory")]
fn allocation_panics_after_the_timeout() {
    let _guard = test_lock();
    init(&map_8mib_from_zero(), None).unwrap();
    let free = statistics().free_frames;
    let _hog = allocate_frames(free, 1);

    // The "pager" makes no progress; it only pulses and lets the
    // fake clock march toward the deadline.
    *WAIT_BEHAVIOR.lock().unwrap() = Some(Box::new(|| {
        FAKE_NOW_MILLIS.fetch_add(100_000, Ordering::Relaxed);
        pages_freed_event().pulse();
    }));

    let _ = allocate_frames(1, 1);
}

#[test]
#[should_panic(expected = "already free")]
fn double_free_panics() {
    let _guard = test_lock();
    init(&map_8mib_from_zero(), None).unwrap();
    let frame = allocate_frames(1, 1);
    free_frames(frame, 1);
    free_frames(frame, 1);
}

#[test]
fn scattered_allocation_yields_distinct_frames() {
    let _guard = test_lock();
    init(&map_8mib_from_zero(), None).unwrap();
    let mut frames = [Frame::from_number(0); 8];
    allocate_frames_scattered(&mut frames);
    for (i, frame) in frames.iter().enumerate() {
        assert!(frames[..i].iter().all(|other| other != frame));
        free_frames(*frame, 1);
    }
    consistency_check().unwrap();
}

#[test]
fn identity_mappable_allocation_respects_va_accounting() {
    let _guard = test_lock();
    init(&map_8mib_from_zero(), None).unwrap();
    let baseline = statistics();

    let frame = allocate_identity_mappable(2, 1).expect("VA range is reported free");
    let stats = statistics();
    assert_eq!(stats.allocated_frames, baseline.allocated_frames + 2);
    assert_eq!(stats.non_paged_frames, baseline.non_paged_frames + 2);
    free_frames(frame, 2);

    // When the kernel VA accounting says no, the allocation fails
    // without waiting on the pager.
    IDENTITY_RANGES_FREE.store(false, Ordering::Relaxed);
    assert!(allocate_identity_mappable(1, 1).is_none());
    assert!(REQUESTED_TARGETS.lock().unwrap().is_empty());
    consistency_check().unwrap();
}

#[test]
fn enable_paging_moves_frames_out_of_non_paged() {
    let _guard = test_lock();
    init(&map_8mib_from_zero(), None).unwrap();
    let section = FakeSection::new();

    let frame = allocate_frames(4, 1);
    let after_alloc = statistics();

    let descriptors = descriptors_for(&section, 4);
    enable_paging_for(frame, 4, &descriptors, false);
    let stats = statistics();
    assert_eq!(stats.non_paged_frames, after_alloc.non_paged_frames - 4);
    assert_eq!(stats.allocated_frames, after_alloc.allocated_frames);

    // Freeing the pageable run drops allocated but leaves non-paged
    // untouched.
    free_frames(frame, 4);
    let stats = statistics();
    assert_eq!(stats.non_paged_frames, after_alloc.non_paged_frames - 4);
    assert_eq!(stats.allocated_frames, after_alloc.allocated_frames - 4);
    consistency_check().unwrap();
}

#[test]
fn enable_paging_with_initial_lock_keeps_frames_non_paged() {
    let _guard = test_lock();
    init(&map_8mib_from_zero(), None).unwrap();
    let section = FakeSection::new();

    let frame = allocate_frames(2, 1);
    let after_alloc = statistics();
    let descriptors = descriptors_for(&section, 2);
    enable_paging_for(frame, 2, &descriptors, true);

    let stats = statistics();
    assert_eq!(stats.non_paged_frames, after_alloc.non_paged_frames);
    assert!(descriptors.iter().all(|descriptor| descriptor.lock_count() == 1));

    unlock_frames(frame, 2);
    assert_eq!(statistics().non_paged_frames, after_alloc.non_paged_frames - 2);
    free_frames(frame, 2);
    consistency_check().unwrap();
}

#[test]
fn lock_unlock_is_symmetric() {
    let _guard = test_lock();
    init(&map_8mib_from_zero(), None).unwrap();
    let section = FakeSection::new();

    let frame = allocate_frames(3, 1);
    let descriptors = descriptors_for(&section, 3);
    enable_paging_for(frame, 3, &descriptors, false);
    let baseline = statistics();

    lock_frames(frame, 3).unwrap();
    assert_eq!(statistics().non_paged_frames, baseline.non_paged_frames + 3);
    assert!(descriptors.iter().all(|descriptor| descriptor.lock_count() == 1));

    unlock_frames(frame, 3);
    assert_eq!(statistics().non_paged_frames, baseline.non_paged_frames);
    assert!(descriptors.iter().all(|descriptor| descriptor.lock_count() == 0));

    free_frames(frame, 3);
    consistency_check().unwrap();
}

#[test]
fn lock_count_saturation_fails_and_unwinds() {
    let _guard = test_lock();
    init(&map_8mib_from_zero(), None).unwrap();
    let section = FakeSection::new();

    let frame = allocate_frames(2, 1);
    let descriptors = descriptors_for(&section, 2);
    enable_paging_for(frame, 2, &descriptors, false);

    // Saturate the second frame's lock count.
    for _ in 0..usize::from(MAX_FRAME_LOCK_COUNT) {
        lock_frames(frame + 1, 1).unwrap();
    }
    assert_eq!(lock_frames(frame + 1, 1), Err(FrameLockError::ResourceInUse));

    // A run that trips the cap partway through unwinds what it locked.
    let non_paged_before = statistics().non_paged_frames;
    assert_eq!(lock_frames(frame, 2), Err(FrameLockError::ResourceInUse));
    assert_eq!(statistics().non_paged_frames, non_paged_before);
    assert_eq!(descriptors[0].lock_count(), 0);

    for _ in 0..usize::from(MAX_FRAME_LOCK_COUNT) {
        unlock_frames(frame + 1, 1);
    }
    free_frames(frame, 2);
    consistency_check().unwrap();
}

#[test]
fn page_cache_association_round_trips() {
    let _guard = test_lock();
    init(&map_8mib_from_zero(), None).unwrap();

    struct FakeCacheEntry;
    impl image_section::PageCacheEntry for FakeCacheEntry {}

    let frame = allocate_frames(1, 1);
    assert!(page_cache_entry(frame).is_none());

    let entry: PageCacheRef = Arc::new(FakeCacheEntry);
    set_page_cache_entry(frame, entry.clone());
    let found = page_cache_entry(frame).expect("the entry was just attached");
    assert!(Arc::ptr_eq(&found, &entry));

    free_frames(frame, 1);
    assert!(page_cache_entry(frame).is_none());
    consistency_check().unwrap();
}

#[test]
fn pager_victim_selection_sets_the_paging_out_flag() {
    let _guard = test_lock();
    init(&map_8mib_from_zero(), None).unwrap();
    let section = FakeSection::new();

    let frame = allocate_frames(1, 1);
    let descriptors = descriptors_for(&section, 1);
    enable_paging_for(frame, 1, &descriptors, false);

    let victim = select_pageout_victim().expect("one evictable frame exists");
    assert_eq!(victim.frame, frame);
    assert!(victim.descriptor.is_paging_out());
    assert!(Arc::ptr_eq(&victim.section, &section));
    assert_eq!(victim.section_offset, 0);

    // While the pager owns the frame, freeing it is deferred...
    let allocated_before = statistics().allocated_frames;
    free_frames(frame, 1);
    assert_eq!(statistics().allocated_frames, allocated_before);

    // ...until the pager completes the transition.
    complete_page_out(victim.frame, &victim.descriptor, true);
    assert_eq!(statistics().allocated_frames, allocated_before - 1);
    assert!(!victim.descriptor.is_paging_out());
    consistency_check().unwrap();
}

#[test]
fn locked_frames_are_not_eviction_victims() {
    let _guard = test_lock();
    init(&map_8mib_from_zero(), None).unwrap();
    let section = FakeSection::new();

    let frame = allocate_frames(1, 1);
    let descriptors = descriptors_for(&section, 1);
    enable_paging_for(frame, 1, &descriptors, false);
    lock_frames(frame, 1).unwrap();

    assert!(select_pageout_victim().is_none());

    unlock_frames(frame, 1);
    let victim = select_pageout_victim().expect("unlocked frame is evictable again");
    complete_page_out(victim.frame, &victim.descriptor, false);
    free_frames(frame, 1);
    consistency_check().unwrap();
}

#[test]
fn descriptor_migration_rebinds_sections() {
    let _guard = test_lock();
    init(&map_8mib_from_zero(), None).unwrap();
    let old_section = FakeSection::new();
    let new_section = FakeSection::new();

    let frame = allocate_frames(2, 1);
    let descriptors = descriptors_for(&old_section, 2);
    enable_paging_for(frame, 2, &descriptors, false);

    migrate_descriptors(&[(frame, 10), (frame + 1, 11)], &old_section, &new_section);
    for (index, descriptor) in descriptors.iter().enumerate() {
        let (section, offset) = descriptor.backing();
        assert!(Arc::ptr_eq(&section, &new_section));
        assert_eq!(offset, 10 + index);
    }

    free_frames(frame, 2);
    consistency_check().unwrap();
}

#[test]
fn warning_levels_cross_with_hysteresis() {
    let _guard = test_lock();
    init(&map_64mib(), None).unwrap();
    let stats = statistics();
    let total = stats.total_frames;
    let level1_high = total * 97 / 100;
    let level1_low = total * 95 / 100;
    let level2_low = total * 87 / 100;

    // One large allocation (well above the sampling mask) straight
    // past the level-1 threshold fires the event exactly once.
    let token = warning_event().current();
    let big = level1_high - stats.allocated_frames + 1;
    let big_run = allocate_frames(big, 1);
    assert_eq!(warning_level(), WarningLevel::Level1);
    assert!(warning_event().pulsed_since(token));

    // A small follow-up allocation crosses nothing and must not fire.
    let token = warning_event().current();
    let extra = allocate_frames(1, 1);
    assert_eq!(warning_level(), WarningLevel::Level1);
    assert!(!warning_event().pulsed_since(token));
    free_frames(extra, 1);

    // Free down just below the level-1 low threshold. The downward
    // check is sampled on the free counter, so cycle single pages
    // until a sample lands; exactly one step down occurs.
    let to_free = statistics().allocated_frames - (level1_low - 1);
    free_frames(big_run, to_free);
    let mut spins = 0;
    while warning_level() == WarningLevel::Level1 && spins < 512 {
        let frame = allocate_frames(1, 1);
        free_frames(frame, 1);
        spins += 1;
    }
    assert_eq!(warning_level(), WarningLevel::Level2);

    // Freeing the rest crosses the level-2 low threshold with plenty
    // of samples to spare, stepping the level down to none.
    free_frames(big_run + to_free, big - to_free);
    assert_eq!(warning_level(), WarningLevel::None);
    assert!(statistics().allocated_frames < level2_low);
    consistency_check().unwrap();
}
