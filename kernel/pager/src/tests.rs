//! Pager tests, driven synchronously against scripted image sections
//! so every eviction outcome is deterministic.

use super::*;
use frame_allocator::{
    allocate_frames, enable_paging_for, free_frames, free_frames_count, statistics,
    warning_event, warning_level, select_pageout_victim, WarningLevel,
};
use image_section::{
    DescriptorRef, ImageSection, PagingDescriptor, SectionRef,
};
use memory_structs::{Frame, MemoryRegion, MemoryRegionType, PhysicalAddress};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize as StdAtomicUsize, Ordering as StdOrdering};
use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use std::sync::MutexGuard;
use std::vec::Vec;

static TEST_LOCK: StdMutex<()> = StdMutex::new(());

fn test_lock() -> MutexGuard<'static, ()> {
    let guard = TEST_LOCK.lock().unwrap_or_else(|e| e.into_inner());
    teardown();
    frame_allocator::teardown();
    let map = [MemoryRegion::new(
        PhysicalAddress::zero(),
        8 * 1024 * 1024,
        MemoryRegionType::Free,
    )];
    frame_allocator::init(&map, None).unwrap();
    init().unwrap();
    guard
}

/// A section whose `page_out` results follow a script, falling back
/// to a default once the script runs dry.
struct ScriptedSection {
    script: StdMutex<VecDeque<Result<usize, PageOutError>>>,
    fallback: Result<usize, PageOutError>,
    calls: StdAtomicUsize,
    destroyed: AtomicBool,
}

impl ScriptedSection {
    fn always(fallback: Result<usize, PageOutError>) -> Arc<ScriptedSection> {
        ScriptedSection::scripted(Vec::new(), fallback)
    }

    fn scripted(
        script: Vec<Result<usize, PageOutError>>,
        fallback: Result<usize, PageOutError>,
    ) -> Arc<ScriptedSection> {
        Arc::new(ScriptedSection {
            script: StdMutex::new(script.into_iter().collect()),
            fallback,
            calls: StdAtomicUsize::new(0),
            destroyed: AtomicBool::new(false),
        })
    }

    fn calls(&self) -> usize {
        self.calls.load(StdOrdering::Relaxed)
    }
}

impl ImageSection for ScriptedSection {
    fn page_out(
        &self,
        _descriptor: &PagingDescriptor,
        _offset: usize,
        _frame: Frame,
        context: &mut PageOutContext<'_>,
    ) -> Result<usize, PageOutError> {
        // The preallocated resources really are handed over.
        assert_eq!(context.io_buffer.len(), PAGE_SIZE);
        assert_ne!(context.scratch.size_in_pages(), 0);
        self.calls.fetch_add(1, StdOrdering::Relaxed);
        self.script
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .pop_front()
            .unwrap_or(self.fallback)
    }

    fn destroyed(&self) -> bool {
        self.destroyed.load(StdOrdering::Relaxed)
    }
}

/// Allocates `count` frames and makes them pageable against `section`.
fn make_pageable(section: &Arc<ScriptedSection>, count: usize) -> (Frame, Vec<DescriptorRef>) {
    let section_ref: SectionRef = section.clone();
    let first = allocate_frames(count, 1);
    let descriptors: Vec<DescriptorRef> = (0..count)
        .map(|offset| Arc::new(PagingDescriptor::new(section_ref.clone(), offset)))
        .collect();
    enable_paging_for(first, count, &descriptors, false);
    (first, descriptors)
}

#[test]
fn eviction_reaches_an_exact_target() {
    let _guard = test_lock();
    let section = ScriptedSection::always(Ok(1));
    let (_first, _descriptors) = make_pageable(&section, 8);

    // Exactly eight evictable frames exist; ask for exactly that many
    // more free pages. The pass terminates with the target met and
    // without touching anything else.
    let target = free_frames_count() + 8;
    request_pageout(target);
    let evicted = process_pending_request();
    assert_eq!(evicted, 8);
    assert!(free_frames_count() >= target);
    assert_eq!(section.calls(), 8);
    assert!(select_pageout_victim().is_none(), "nothing evictable remains");
    frame_allocator::consistency_check().unwrap();
}

#[test]
fn hard_failures_end_the_pass_without_deadlock() {
    let _guard = test_lock();

    // Drive the allocated count over the level-2 line so the warning
    // event fires once during setup.
    let stats = statistics();
    let warning_token = warning_event().current();
    let filler = allocate_frames(
        stats.total_frames * 92 / 100 - stats.allocated_frames,
        1,
    );
    assert_eq!(warning_level(), WarningLevel::Level2);
    assert!(warning_event().pulsed_since(warning_token));

    let section = ScriptedSection::always(Err(PageOutError::Io));
    let (first, descriptors) = make_pageable(&section, 12);

    let freed_token = pages_freed_event().current();
    let warning_token = warning_event().current();
    request_pageout(statistics().total_frames);
    let evicted = process_pending_request();

    // Ten hard failures end the pass; nothing was freed, the waiters
    // were still woken, and the warning level did not fire again.
    assert_eq!(evicted, 0);
    assert_eq!(section.calls(), MAX_PAGE_OUT_FAILURES);
    assert!(pages_freed_event().pulsed_since(freed_token));
    assert!(!warning_event().pulsed_since(warning_token));
    assert!(descriptors.iter().all(|descriptor| !descriptor.is_paging_out()));

    free_frames(first, 12);
    free_frames(filler, stats.total_frames * 92 / 100 - stats.allocated_frames);
    frame_allocator::consistency_check().unwrap();
}

#[test]
fn transient_failures_are_retried_with_other_victims() {
    let _guard = test_lock();
    let section = ScriptedSection::scripted(
        std::vec![
            Err(PageOutError::ResourceInUse),
            Err(PageOutError::ResourceInUse),
            Ok(1),
            Ok(1),
        ],
        Ok(1),
    );
    let (first, descriptors) = make_pageable(&section, 4);

    let target = free_frames_count() + 2;
    request_pageout(target);
    let evicted = process_pending_request();

    // Two transient refusals did not count against the pass.
    assert_eq!(evicted, 2);
    assert_eq!(section.calls(), 4);
    assert!(free_frames_count() >= target);
    assert!(descriptors.iter().all(|descriptor| !descriptor.is_paging_out()));

    // The two frames the transient refusals skipped are still intact
    // and evictable on a later pass.
    request_pageout(free_frames_count() + 2);
    assert_eq!(process_pending_request(), 2);
    let _ = first;
    frame_allocator::consistency_check().unwrap();
}

#[test]
fn unrealistic_targets_are_clamped_to_evictable_memory() {
    let _guard = test_lock();
    let section = ScriptedSection::always(Ok(1));
    let (_first, _descriptors) = make_pageable(&section, 4);

    // Ask for far more free memory than eviction could ever produce.
    request_pageout(usize::MAX);
    let evicted = process_pending_request();
    assert_eq!(evicted, 4);
    assert!(select_pageout_victim().is_none());
    frame_allocator::consistency_check().unwrap();
}

#[test]
fn requests_latch_and_coalesce() {
    let _guard = test_lock();
    let section = ScriptedSection::always(Ok(1));
    let (_first, _descriptors) = make_pageable(&section, 6);

    // Two overlapping requests coalesce to the larger target and are
    // consumed by a single pass.
    let needed_event = pageout_needed_event();
    let token = needed_event.current();
    request_pageout(free_frames_count() + 2);
    request_pageout(free_frames_count() + 5);
    assert!(needed_event.pulsed_since(token));

    let evicted = process_pending_request();
    assert_eq!(evicted, 5);
    assert_eq!(process_pending_request(), 0, "the latch was consumed");
    frame_allocator::consistency_check().unwrap();
}

#[test]
fn mid_pass_progress_pulses_waiters_early() {
    let _guard = test_lock();
    let section = ScriptedSection::always(Ok(1));
    let (_first, _descriptors) = make_pageable(&section, 40);

    let token = pages_freed_event().current();
    request_pageout(free_frames_count() + 40);
    let evicted = process_pending_request();
    assert_eq!(evicted, 40);

    // Forty evictions cross the sixteen-page signal threshold twice,
    // plus the unconditional pulse at the end of the pass.
    assert!(pages_freed_event().pulsed_since(token));
    frame_allocator::consistency_check().unwrap();
}

#[test]
fn uninitialized_pager_refuses_politely() {
    let _guard = test_lock();
    teardown();
    assert_eq!(page_out_frames(100), 0);
    // Re-initialization succeeds after a teardown.
    init().unwrap();
    assert!(init().is_err());
}
