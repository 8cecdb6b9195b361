//! This crate implements the virtual memory subsystem: the
//! architectural page tables owned by each address space, the
//! map/unmap/query operations over them, and their coupling to the
//! physical frame database.
//!
//! ## Acknowledgments
//! Some of the internal page table management code was based on
//! Philipp Oppermann's [blog_os], but has since changed significantly.
//!
//! [blog_os]: https://github.com/phil-opp/blog_os

#![no_std]

extern crate alloc;

#[cfg(test)]
extern crate std;

mod paging;
mod translate;


pub use paging::{
    copy_and_downgrade, create_address_space, map_page_in, preallocate_page_tables,
    unmap_page_in, virtual_to_physical_in, AddressSpace, AddressSpaceRef, UnmapFlags,
};
pub use translate::set_phys_to_virt_offset;

pub use memory_structs::{Frame, FrameRange, Page, PageRange, PhysicalAddress, VirtualAddress};
pub use page_table_entry::PteFlags;
pub use kernel_config::memory::PAGE_SIZE;

use alloc::sync::Arc;
use log::debug;
use memory_structs::MemoryRegion;
use paging::table::{table_from_frame, Level4};
use spin::{Mutex, Once};

/// The kernel's own address space, whose top-level table is the master
/// copy of the kernel half.
static KERNEL_SPACE: Mutex<Option<AddressSpaceRef>> = Mutex::new(None);

/// Invoked to deliver a TLB shootdown IPI covering the given range of
/// the given address space. Registered by the scheduler layer.
static BROADCAST_TLB_SHOOTDOWN: Once<fn(&AddressSpace, PageRange)> = Once::new();

/// Invoked to invalidate one local TLB entry.
static LOCAL_TLB_INVALIDATE: Once<fn(VirtualAddress)> = Once::new();

/// Invoked by [`switch_address_space`] with the new root table's
/// physical address; the implementor writes the CPU's table base
/// register and stashes the value anywhere interrupt handlers need it.
static SWITCH_ADDRESS_SPACE: Once<fn(PhysicalAddress)> = Once::new();

/// Set the function callback that will be invoked every time a TLB
/// shootdown broadcast is necessary.
pub fn set_broadcast_tlb_shootdown_cb(func: fn(&AddressSpace, PageRange)) {
    BROADCAST_TLB_SHOOTDOWN.call_once(|| func);
}

/// Set the function callback that invalidates a single TLB entry on
/// the current processor.
pub fn set_local_tlb_invalidate_cb(func: fn(VirtualAddress)) {
    LOCAL_TLB_INVALIDATE.call_once(|| func);
}

/// Set the function callback that loads a new top-level table into the
/// current CPU.
pub fn set_switch_address_space_cb(func: fn(PhysicalAddress)) {
    SWITCH_ADDRESS_SPACE.call_once(|| func);
}

pub(crate) fn broadcast_invalidate(space: &AddressSpace, pages: PageRange) {
    if let Some(broadcast) = BROADCAST_TLB_SHOOTDOWN.get() {
        broadcast(space, pages);
    }
}

pub(crate) fn local_invalidate(virt_addr: VirtualAddress) {
    if let Some(invalidate) = LOCAL_TLB_INVALIDATE.get() {
        invalidate(virt_addr);
    }
}

/// Initializes the memory subsystem: the frame database from the boot
/// memory map, the linear physical mapping offset used for all page
/// table access, and the kernel's own address space.
///
/// Must be called once, before any allocation or mapping.
pub fn init(
    memory_map: &[MemoryRegion],
    phys_to_virt_offset: usize,
    page_limit: Option<usize>,
) -> Result<(), &'static str> {
    translate::set_phys_to_virt_offset(phys_to_virt_offset);
    frame_allocator::init(memory_map, page_limit)?;

    let mut kernel_space = KERNEL_SPACE.lock();
    if kernel_space.is_some() {
        return Err("memory subsystem was already initialized, cannot be initialized twice");
    }
    let p4_frame = frame_allocator::allocate_frames(1, 1);
    unsafe { table_from_frame::<Level4>(p4_frame) }.zero();
    let space = Arc::new(AddressSpace::with_root(p4_frame));
    debug!("memory: kernel address space at {:?}", space);
    *kernel_space = Some(space);
    Ok(())
}

/// Returns a reference to the kernel's address space, if initialized.
pub fn kernel_address_space() -> Option<AddressSpaceRef> {
    KERNEL_SPACE.lock().clone()
}

/// The frame of the kernel's master top-level table.
pub(crate) fn kernel_root_frame() -> Frame {
    match &*KERNEL_SPACE.lock() {
        Some(space) => space.root_frame(),
        None => panic!("memory subsystem used before initialization"),
    }
}

/// Makes `space` the active address space on the current CPU.
pub fn switch_address_space(space: &AddressSpace) {
    match SWITCH_ADDRESS_SPACE.get() {
        Some(switch) => switch(space.physical_address()),
        None => debug!("switch_address_space: no CPU hook registered"),
    }
}

/// Drops the kernel address space and forgets the initialization, so
/// unit tests can rebuild the world. The kernel-half page tables are
/// deliberately left to the frame database teardown.
#[doc(hidden)]
pub fn teardown() {
    KERNEL_SPACE.lock().take();
}
