//! Physical-to-virtual translation through the kernel's linear mapping.
//!
//! All of physical memory is mapped at a fixed offset within the kernel
//! half of the address space, so page table frames (and any other
//! physical memory the manager must touch) are reachable with one
//! addition. The offset is registered exactly once during early boot,
//! before the first page table walk.

use memory_structs::PhysicalAddress;
use spin::Once;

static PHYS_TO_VIRT_OFFSET: Once<usize> = Once::new();

/// Registers the linear-mapping offset. Must be called once, before
/// any page-table operation.
pub fn set_phys_to_virt_offset(offset: usize) {
    PHYS_TO_VIRT_OFFSET.call_once(|| offset);
}

/// Translates a physical address to its linearly mapped virtual address.
pub fn phys_to_virt(phys_addr: PhysicalAddress) -> *mut u8 {
    match PHYS_TO_VIRT_OFFSET.get() {
        Some(offset) => (offset + phys_addr.value()) as *mut u8,
        None => panic!("phys_to_virt used before the linear mapping offset was registered"),
    }
}
