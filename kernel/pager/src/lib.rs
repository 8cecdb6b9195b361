//! The pager: a single long-lived task that brings the free-frame
//! count back up to a requested target by evicting pageable frames.
//!
//! Allocators that come up empty latch a target free-page count with
//! [`request_pageout`] and wait on the frame database's pages-freed
//! event. The pager task wakes, selects victims one at a time with the
//! database's pager cursor (which also marks each victim's descriptor
//! as paging out, transferring ownership), and hands each to its
//! owning image section for writeback. Every sixteen successful
//! evictions it pulses the pages-freed event so waiters retry early,
//! and it always pulses once more at the end of a pass, even at zero
//! progress, so a genuinely exhausted system fails loudly in the
//! allocator instead of hanging quietly here.
//!
//! The pager must never call the ordinary frame allocator: satisfying
//! that allocation could require the pager, which is busy being the
//! pager. Its I/O buffer and scratch mapping region are preallocated
//! at initialization and reused for every writeback. The task runs
//! entirely at low run level.

#![no_std]

extern crate alloc;

#[cfg(test)]
extern crate std;

use alloc::vec::Vec;
use core::sync::atomic::{AtomicUsize, Ordering};
use frame_allocator::{complete_page_out, pages_freed_event, select_pageout_victim, statistics};
use image_section::{PageOutContext, PageOutError};
use kernel_config::memory::{PAGER_SCRATCH_BASE, PAGER_SCRATCH_PAGES, PAGE_SIZE};
use log::{debug, error, warn};
use memory_structs::{Page, PageRange, VirtualAddress};
use pulse_event::PulseEvent;
use spin::Mutex;

#[cfg(test)]
mod tests;

/// How many hard writeback failures end an eviction pass.
const MAX_PAGE_OUT_FAILURES: usize = 10;

/// How many pages must be evicted before the pages-freed event is
/// pulsed mid-pass. Too few and waiters thrash retrying allocations
/// that still cannot succeed; too many and they wait needlessly.
const PAGES_FREED_SIGNAL_COUNT: usize = 16;

/// Signaled whenever an allocator needs pages evicted.
static PAGEOUT_NEEDED: PulseEvent = PulseEvent::new();

/// The latched free-page target; concurrent requests coalesce by
/// keeping the maximum.
static REQUESTED_TARGET: AtomicUsize = AtomicUsize::new(0);

struct PagerResources {
    /// Reused for every writeback, so eviction never allocates.
    io_buffer: Vec<u8>,
    /// Private kernel virtual region for mapping victims during I/O.
    scratch: PageRange,
}

static RESOURCES: Mutex<Option<PagerResources>> = Mutex::new(None);

/// Initializes the pager: preallocates the I/O buffer and scratch
/// region, and registers the wake-up hook with the frame database.
/// Must be called once, after the frame database is initialized and
/// before the pager task starts.
pub fn init() -> Result<(), &'static str> {
    let mut resources = RESOURCES.lock();
    if resources.is_some() {
        return Err("pager was already initialized, cannot be initialized twice");
    }
    let scratch_start =
        Page::containing_address(VirtualAddress::new_canonical(PAGER_SCRATCH_BASE));
    *resources = Some(PagerResources {
        io_buffer: alloc::vec![0u8; PAGE_SIZE],
        scratch: PageRange::new(scratch_start, scratch_start + (PAGER_SCRATCH_PAGES - 1)),
    });
    frame_allocator::set_request_pageout_hook(request_pageout);
    Ok(())
}

/// Asks the pager to evict until `target_free_pages` frames are free.
/// Returns immediately; callers wanting to know when progress happens
/// wait on the frame database's pages-freed event.
pub fn request_pageout(target_free_pages: usize) {
    REQUESTED_TARGET.fetch_max(target_free_pages, Ordering::Relaxed);
    PAGEOUT_NEEDED.pulse();
}

/// Returns the event the pager sleeps on between requests.
pub fn pageout_needed_event() -> &'static PulseEvent {
    &PAGEOUT_NEEDED
}

/// The body of the pager task. Never returns.
pub fn pager_task_entry() -> ! {
    loop {
        let token = PAGEOUT_NEEDED.current();
        let target = REQUESTED_TARGET.swap(0, Ordering::Relaxed);
        if target == 0 {
            PAGEOUT_NEEDED.wait(token);
            continue;
        }
        page_out_frames(target);
    }
}

/// Runs one eviction pass for the currently latched request, if any.
/// Returns the number of pages evicted. This is the same work the
/// pager task does per wakeup, exposed for callers that drive the
/// pager synchronously.
pub fn process_pending_request() -> usize {
    let target = REQUESTED_TARGET.swap(0, Ordering::Relaxed);
    if target == 0 {
        return 0;
    }
    page_out_frames(target)
}

/// One eviction pass: evict pageable frames until `target` frames are
/// free, no victims remain, or too many writebacks fail hard.
pub fn page_out_frames(mut target: usize) -> usize {
    let mut resources_guard = RESOURCES.lock();
    let resources = match resources_guard.as_mut() {
        Some(resources) => resources,
        None => {
            error!("pager: eviction requested before initialization");
            return 0;
        }
    };

    let mut failure_count = 0;
    let mut pages_since_signal = 0;
    let mut total_paged = 0;
    loop {
        // Keep the goal realistic: non-paged frames can never become
        // free through eviction.
        let stats = statistics();
        let evictable_ceiling = stats.total_frames - stats.non_paged_frames;
        if target > evictable_ceiling {
            target = evictable_ceiling;
        }

        // The pass is done when free memory reaches the target, or
        // when enough has been evicted that it ought to have; without
        // the second exit, page-in racing page-out could keep this
        // loop alive indefinitely.
        if stats.free_frames >= target || total_paged >= target {
            break;
        }

        let victim = match select_pageout_victim() {
            Some(victim) => victim,
            None => break,
        };

        // The search set the descriptor's paging-out flag, so the
        // frame cannot be freed or locked underneath the writeback.
        let mut context = PageOutContext {
            io_buffer: &mut resources.io_buffer,
            scratch: resources.scratch.clone(),
        };
        let result = victim.section.page_out(
            &victim.descriptor,
            victim.section_offset,
            victim.frame,
            &mut context,
        );

        match result {
            Ok(pages_written) => {
                complete_page_out(victim.frame, &victim.descriptor, true);
                total_paged += pages_written;
                pages_since_signal += pages_written;
                if pages_since_signal >= PAGES_FREED_SIGNAL_COUNT {
                    pages_since_signal = 0;
                    pages_freed_event().pulse();
                }
            }
            Err(PageOutError::ResourceInUse) => {
                // Transient; give the frame back and move on.
                complete_page_out(victim.frame, &victim.descriptor, false);
            }
            Err(PageOutError::Io) => {
                complete_page_out(victim.frame, &victim.descriptor, false);
                failure_count += 1;
                if failure_count >= MAX_PAGE_OUT_FAILURES {
                    warn!(
                        "pager: giving up the pass after {} hard page-out failures",
                        failure_count,
                    );
                    break;
                }
            }
        }
    }

    // Always wake the waiters at the end, even with zero progress, so
    // an allocator facing genuine exhaustion re-evaluates (and
    // eventually times out) rather than hanging here forever.
    pages_freed_event().pulse();
    debug!("pager: pass evicted {} pages toward a target of {}", total_paged, target);
    total_paged
}

/// Forgets the pager's resources and any latched request.
/// Only for use by unit tests.
#[doc(hidden)]
pub fn teardown() {
    RESOURCES.lock().take();
    REQUESTED_TARGET.store(0, Ordering::Relaxed);
}
