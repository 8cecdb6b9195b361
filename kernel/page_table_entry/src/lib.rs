//! Defines the structure of page table entries: the raw 64-bit value,
//! its permission bits, and conversions to and from frames.
//!
//! An entry distinguishes two independent pieces of state:
//! * whether it holds a frame at all (the address bits are non-zero), and
//! * whether that mapping is *present* (reachable by the MMU).
//!
//! The distinction matters during unmapping, where the present bit is
//! cleared first and the frame is only released after the TLB shootdown
//! completes, and during fork, where a leaf table is installed in the
//! child before it becomes visible.

#![no_std]

#[cfg(test)]
extern crate std;

#[macro_use]
extern crate bitflags;

use core::fmt;
use memory_structs::{Frame, PhysicalAddress};
use zerocopy::FromBytes;

/// The mask of the frame address bits within a page table entry.
pub const ADDRESS_MASK: u64 = 0x000F_FFFF_FFFF_F000;

bitflags! {
    /// Page table entry permission and status bits.
    pub struct PteFlags: u64 {
        /// The mapping is reachable by the MMU.
        const PRESENT           = 1 << 0;
        /// Writes are allowed.
        const WRITABLE          = 1 << 1;
        /// The page is accessible in user mode.
        const USER_ACCESSIBLE   = 1 << 2;
        /// Writes go straight through the cache.
        const WRITE_THROUGH     = 1 << 3;
        /// Accesses bypass the cache entirely.
        const NO_CACHE          = 1 << 4;
        /// Set by hardware when the page is accessed.
        const ACCESSED          = 1 << 5;
        /// Set by hardware when the page is written to.
        const DIRTY             = 1 << 6;
        /// The entry maps a large page rather than a leaf table.
        const HUGE              = 1 << 7;
        /// The translation survives an address-space switch.
        const GLOBAL            = 1 << 8;
        /// No code on this page can be executed.
        const NO_EXECUTE        = 1 << 63;
    }
}

impl PteFlags {
    /// The flags used for the non-leaf entries that link page tables together.
    pub fn table_link() -> PteFlags {
        PteFlags::PRESENT | PteFlags::WRITABLE
    }

    pub fn is_present(&self) -> bool {
        self.contains(PteFlags::PRESENT)
    }

    pub fn is_writable(&self) -> bool {
        self.contains(PteFlags::WRITABLE)
    }

    pub fn is_dirty(&self) -> bool {
        self.contains(PteFlags::DIRTY)
    }
}

/// A single entry within a page table.
#[derive(FromBytes)]
#[repr(transparent)]
pub struct PageTableEntry(u64);

impl PageTableEntry {
    pub const fn new() -> PageTableEntry {
        PageTableEntry(0)
    }

    /// Zeroes out this entry entirely: no frame, no flags.
    pub fn zero(&mut self) {
        self.0 = 0;
    }

    /// Returns `true` if this entry holds neither a frame nor any flags.
    pub fn is_unused(&self) -> bool {
        self.0 == 0
    }

    pub fn flags(&self) -> PteFlags {
        PteFlags::from_bits_truncate(self.0)
    }

    pub fn is_present(&self) -> bool {
        self.flags().is_present()
    }

    /// Returns the frame held by this entry, whether or not the entry
    /// is present. `None` only if the address bits are all zero.
    ///
    /// Frame 0 is withheld from the frame database precisely so that
    /// zero address bits can mean "no frame".
    pub fn frame(&self) -> Option<Frame> {
        let addr = self.0 & ADDRESS_MASK;
        if addr == 0 {
            None
        } else {
            Some(Frame::containing_address(PhysicalAddress::new_canonical(addr as usize)))
        }
    }

    /// Returns the frame held by this entry if the entry is present.
    pub fn pointed_frame(&self) -> Option<Frame> {
        if self.is_present() {
            self.frame()
        } else {
            None
        }
    }

    /// Replaces the entry wholesale with the given frame and flags.
    pub fn set(&mut self, frame: Frame, flags: PteFlags) {
        let addr = frame.start_address().value() as u64;
        debug_assert_eq!(addr & !ADDRESS_MASK, 0);
        self.0 = (addr & ADDRESS_MASK) | flags.bits();
    }

    /// Overwrites only the flag bits, preserving the frame address.
    pub fn set_flags(&mut self, flags: PteFlags) {
        self.0 = (self.0 & ADDRESS_MASK) | flags.bits();
    }

    pub fn clear_flags(&mut self, flags: PteFlags) {
        self.0 &= !flags.bits();
    }

    pub fn insert_flags(&mut self, flags: PteFlags) {
        self.0 |= flags.bits();
    }

    pub fn value(&self) -> u64 {
        self.0
    }

    /// Overwrites this entry wholesale with the given raw value.
    pub fn set_raw(&mut self, raw: u64) {
        self.0 = raw;
    }
}

impl fmt::Debug for PageTableEntry {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self.frame() {
            Some(frame) => write!(f, "PTE({:?}, {:?})", frame, self.flags()),
            None => write!(f, "PTE(<no frame>, {:?})", self.flags()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_requires_nonzero_address_bits() {
        let mut entry = PageTableEntry::new();
        assert_eq!(entry.frame(), None);
        entry.set(Frame::from_number(0xdeadb), PteFlags::WRITABLE);
        assert_eq!(entry.frame(), Some(Frame::from_number(0xdeadb)));
        // Not present, so pointed_frame() still sees nothing.
        assert_eq!(entry.pointed_frame(), None);
        entry.insert_flags(PteFlags::PRESENT);
        assert_eq!(entry.pointed_frame(), Some(Frame::from_number(0xdeadb)));
    }

    #[test]
    fn flag_changes_preserve_address() {
        let mut entry = PageTableEntry::new();
        entry.set(Frame::from_number(0xcafeb), PteFlags::PRESENT | PteFlags::WRITABLE);
        entry.set_flags(PteFlags::PRESENT | PteFlags::DIRTY | PteFlags::NO_EXECUTE);
        assert_eq!(entry.frame(), Some(Frame::from_number(0xcafeb)));
        assert_eq!(entry.flags(), PteFlags::PRESENT | PteFlags::DIRTY | PteFlags::NO_EXECUTE);
    }

    #[test]
    fn representation_matches_hardware_layout() {
        let mut entry = PageTableEntry::new();
        entry.set(
            Frame::from_number(0xdeadb),
            PteFlags::PRESENT | PteFlags::WRITABLE | PteFlags::USER_ACCESSIBLE | PteFlags::DIRTY,
        );
        assert_eq!(
            entry.value(),
            0xdeadb000 | (1 << 0) | (1 << 1) | (1 << 2) | (1 << 6),
        );
    }
}
