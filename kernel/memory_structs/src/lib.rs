//! This crate contains basic types used for memory management.
//!
//! The types of interest are divided into three categories:
//! 1. addresses: `VirtualAddress` and `PhysicalAddress`.
//! 2. "chunk" types: `Page` and `Frame`.
//! 3. ranges of chunks: `PageRange` and `FrameRange`.
//!
//! A `Frame` or `Page` is identified by its number, i.e., its address
//! shifted right by [`PAGE_SHIFT`]. Ranges are **inclusive** on both
//! ends; an empty range is represented with `start > end`.

#![no_std]

#[cfg(test)]
extern crate std;

use core::{
    fmt,
    ops::{Add, AddAssign, Sub, SubAssign},
};
use bit_field::BitField;
use kernel_config::memory::{
    MAX_PAGE_NUMBER, PAGE_SHIFT, PAGE_SIZE,
    P1_INDEX_SHIFT, P2_INDEX_SHIFT, P3_INDEX_SHIFT, P4_INDEX_SHIFT,
};
use zerocopy::FromBytes;

/// A virtual memory address, which must be canonical:
/// bits 48 through 63 are copies of bit 47.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, FromBytes)]
#[repr(transparent)]
pub struct VirtualAddress(usize);

impl VirtualAddress {
    /// Creates a new `VirtualAddress`,
    /// returning `None` if the address is not canonical.
    pub fn new(addr: usize) -> Option<VirtualAddress> {
        if is_canonical_virtual_address(addr) {
            Some(VirtualAddress(addr))
        } else {
            None
        }
    }

    /// Creates a new `VirtualAddress` that is guaranteed to be canonical,
    /// sign-extending bit 47 into the upper bits.
    pub const fn new_canonical(addr: usize) -> VirtualAddress {
        VirtualAddress(canonicalize_virtual_address(addr))
    }

    pub const fn zero() -> VirtualAddress {
        VirtualAddress(0)
    }

    pub const fn value(&self) -> usize {
        self.0
    }

    /// Returns the offset of this address within its page,
    /// i.e., the lowest `PAGE_SHIFT` bits.
    pub const fn page_offset(&self) -> usize {
        self.0 & (PAGE_SIZE - 1)
    }

    pub const fn is_page_aligned(&self) -> bool {
        self.0 & (PAGE_SIZE - 1) == 0
    }
}

const fn is_canonical_virtual_address(virt_addr: usize) -> bool {
    matches!(virt_addr & 0xFFFF_8000_0000_0000, 0 | 0xFFFF_8000_0000_0000)
}

const fn canonicalize_virtual_address(virt_addr: usize) -> usize {
    // Sign extend bit 47 into bits 48..64.
    ((virt_addr << 16) as isize >> 16) as usize
}

impl fmt::Debug for VirtualAddress {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "v{:#X}", self.0)
    }
}
impl fmt::Display for VirtualAddress {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

impl Add<usize> for VirtualAddress {
    type Output = VirtualAddress;
    fn add(self, rhs: usize) -> VirtualAddress {
        VirtualAddress::new_canonical(self.0.saturating_add(rhs))
    }
}
impl AddAssign<usize> for VirtualAddress {
    fn add_assign(&mut self, rhs: usize) {
        *self = *self + rhs;
    }
}
impl Sub<usize> for VirtualAddress {
    type Output = VirtualAddress;
    fn sub(self, rhs: usize) -> VirtualAddress {
        VirtualAddress::new_canonical(self.0.saturating_sub(rhs))
    }
}
impl SubAssign<usize> for VirtualAddress {
    fn sub_assign(&mut self, rhs: usize) {
        *self = *self - rhs;
    }
}

/// A physical memory address.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, FromBytes)]
#[repr(transparent)]
pub struct PhysicalAddress(usize);

impl PhysicalAddress {
    /// Creates a new `PhysicalAddress`,
    /// returning `None` if the upper 18 bits are set (not a valid physical address).
    pub fn new(addr: usize) -> Option<PhysicalAddress> {
        if addr >> 46 == 0 {
            Some(PhysicalAddress(addr))
        } else {
            None
        }
    }

    /// Creates a new `PhysicalAddress`, masking off any of the upper 18 bits.
    pub const fn new_canonical(addr: usize) -> PhysicalAddress {
        PhysicalAddress(addr & 0x0000_3FFF_FFFF_FFFF)
    }

    pub const fn zero() -> PhysicalAddress {
        PhysicalAddress(0)
    }

    pub const fn value(&self) -> usize {
        self.0
    }

    /// Returns the offset of this address within its frame,
    /// i.e., the lowest `PAGE_SHIFT` bits.
    pub const fn frame_offset(&self) -> usize {
        self.0 & (PAGE_SIZE - 1)
    }

    pub const fn is_page_aligned(&self) -> bool {
        self.0 & (PAGE_SIZE - 1) == 0
    }
}

impl fmt::Debug for PhysicalAddress {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "p{:#X}", self.0)
    }
}
impl fmt::Display for PhysicalAddress {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

impl Add<usize> for PhysicalAddress {
    type Output = PhysicalAddress;
    fn add(self, rhs: usize) -> PhysicalAddress {
        PhysicalAddress::new_canonical(self.0.saturating_add(rhs))
    }
}
impl AddAssign<usize> for PhysicalAddress {
    fn add_assign(&mut self, rhs: usize) {
        *self = *self + rhs;
    }
}
impl Sub<usize> for PhysicalAddress {
    type Output = PhysicalAddress;
    fn sub(self, rhs: usize) -> PhysicalAddress {
        PhysicalAddress::new_canonical(self.0.saturating_sub(rhs))
    }
}
impl Sub<PhysicalAddress> for PhysicalAddress {
    type Output = usize;
    fn sub(self, rhs: PhysicalAddress) -> usize {
        self.0.saturating_sub(rhs.0)
    }
}

/// A physical frame of memory, identified by its frame number.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Frame {
    number: usize,
}

impl Frame {
    /// Returns the `Frame` containing the given `PhysicalAddress`.
    pub const fn containing_address(addr: PhysicalAddress) -> Frame {
        Frame { number: addr.value() >> PAGE_SHIFT }
    }

    pub const fn from_number(number: usize) -> Frame {
        Frame { number }
    }

    pub const fn number(&self) -> usize {
        self.number
    }

    /// Returns the `PhysicalAddress` at the start of this frame.
    pub const fn start_address(&self) -> PhysicalAddress {
        PhysicalAddress::new_canonical(self.number << PAGE_SHIFT)
    }
}

impl fmt::Debug for Frame {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "Frame(p{:#X})", self.start_address().value())
    }
}

impl Add<usize> for Frame {
    type Output = Frame;
    fn add(self, rhs: usize) -> Frame {
        Frame { number: core::cmp::min(MAX_PAGE_NUMBER, self.number.saturating_add(rhs)) }
    }
}
impl AddAssign<usize> for Frame {
    fn add_assign(&mut self, rhs: usize) {
        *self = *self + rhs;
    }
}
impl Sub<usize> for Frame {
    type Output = Frame;
    fn sub(self, rhs: usize) -> Frame {
        Frame { number: self.number.saturating_sub(rhs) }
    }
}
impl Sub<Frame> for Frame {
    type Output = usize;
    fn sub(self, rhs: Frame) -> usize {
        self.number.saturating_sub(rhs.number)
    }
}

/// A virtual page, identified by its page number.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Page {
    number: usize,
}

impl Page {
    /// Returns the `Page` containing the given `VirtualAddress`.
    pub const fn containing_address(addr: VirtualAddress) -> Page {
        Page { number: addr.value() >> PAGE_SHIFT }
    }

    pub const fn from_number(number: usize) -> Page {
        Page { number }
    }

    pub const fn number(&self) -> usize {
        self.number
    }

    /// Returns the `VirtualAddress` at the start of this page.
    pub const fn start_address(&self) -> VirtualAddress {
        VirtualAddress::new_canonical(self.number << PAGE_SHIFT)
    }

    /// Returns the 9-bit index of this page within its P4 (top-level) table.
    pub fn p4_index(&self) -> usize {
        self.number.get_bits(P4_INDEX_SHIFT as u8..(P4_INDEX_SHIFT + 9) as u8)
    }

    /// Returns the 9-bit index of this page within its P3 table.
    pub fn p3_index(&self) -> usize {
        self.number.get_bits(P3_INDEX_SHIFT as u8..(P3_INDEX_SHIFT + 9) as u8)
    }

    /// Returns the 9-bit index of this page within its P2 table.
    pub fn p2_index(&self) -> usize {
        self.number.get_bits(P2_INDEX_SHIFT as u8..(P2_INDEX_SHIFT + 9) as u8)
    }

    /// Returns the 9-bit index of this page within its P1 (leaf) table.
    pub fn p1_index(&self) -> usize {
        self.number.get_bits(P1_INDEX_SHIFT as u8..(P1_INDEX_SHIFT + 9) as u8)
    }
}

impl fmt::Debug for Page {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "Page(v{:#X})", self.start_address().value())
    }
}

impl Add<usize> for Page {
    type Output = Page;
    fn add(self, rhs: usize) -> Page {
        Page { number: core::cmp::min(MAX_PAGE_NUMBER, self.number.saturating_add(rhs)) }
    }
}
impl AddAssign<usize> for Page {
    fn add_assign(&mut self, rhs: usize) {
        *self = *self + rhs;
    }
}
impl Sub<usize> for Page {
    type Output = Page;
    fn sub(self, rhs: usize) -> Page {
        Page { number: self.number.saturating_sub(rhs) }
    }
}
impl Sub<Page> for Page {
    type Output = usize;
    fn sub(self, rhs: Page) -> usize {
        self.number.saturating_sub(rhs.number)
    }
}

macro_rules! implement_range {
    ($TypeName:ident, $chunk:ident, $address:ident, $desc:literal) => {
        #[doc = concat!("An inclusive range of contiguous `", stringify!($chunk), "`s, ", $desc, ".")]
        ///
        /// An empty range is represented with `start > end`.
        #[derive(Clone, PartialEq, Eq)]
        pub struct $TypeName {
            start: $chunk,
            end: $chunk,
        }

        impl $TypeName {
            pub const fn new(start: $chunk, end: $chunk) -> $TypeName {
                $TypeName { start, end }
            }

            /// Returns an empty range, which contains no chunks.
            pub const fn empty() -> $TypeName {
                $TypeName::new($chunk { number: 1 }, $chunk { number: 0 })
            }

            /// Returns the range covering `size_in_bytes` bytes starting
            /// at `start_addr`, inclusive of the chunk containing the
            /// last byte. An empty range is returned for a zero size.
            pub fn from_addr(start_addr: $address, size_in_bytes: usize) -> $TypeName {
                if size_in_bytes == 0 {
                    return $TypeName::empty();
                }
                let start = $chunk::containing_address(start_addr);
                let end = $chunk::containing_address(start_addr + (size_in_bytes - 1));
                $TypeName::new(start, end)
            }

            pub const fn start(&self) -> &$chunk {
                &self.start
            }

            pub const fn end(&self) -> &$chunk {
                &self.end
            }

            pub fn start_address(&self) -> $address {
                self.start.start_address()
            }

            /// Returns the number of chunks covered by this range.
            pub fn size_in_chunks(&self) -> usize {
                (self.end.number + 1).saturating_sub(self.start.number)
            }

            pub fn size_in_bytes(&self) -> usize {
                self.size_in_chunks() * PAGE_SIZE
            }

            pub fn contains(&self, chunk: &$chunk) -> bool {
                self.start <= *chunk && *chunk <= self.end
            }

            pub fn iter(&self) -> impl Iterator<Item = $chunk> {
                (self.start.number..=self.end.number).map(|number| $chunk { number })
            }
        }

        impl fmt::Debug for $TypeName {
            fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
                write!(f, "{:?}..={:?}", self.start, self.end)
            }
        }
    };
}

implement_range!(FrameRange, Frame, PhysicalAddress, "describing physical memory");
implement_range!(PageRange, Page, VirtualAddress, "describing virtual memory");

impl FrameRange {
    pub fn size_in_frames(&self) -> usize {
        self.size_in_chunks()
    }
}
impl PageRange {
    pub fn size_in_pages(&self) -> usize {
        self.size_in_chunks()
    }
}

/// The types of region found in the boot-provided memory map.
///
/// Every type except `Reserved` describes usable physical memory that
/// belongs in the frame database; only `Free` regions start out free.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MemoryRegionType {
    /// Memory that is free for general use.
    Free,
    /// Memory used by the boot loader that can be reclaimed once boot completes.
    LoaderTemporary,
    /// Memory holding structures the boot loader hands over permanently.
    LoaderPermanent,
    /// Memory used by the firmware during boot services.
    FirmwareTemporary,
    /// Memory holding the boot-time page tables.
    PageTables,
    /// Memory holding memory-manager bookkeeping structures.
    MmStructures,
    /// Memory holding the ACPI tables.
    AcpiTables,
    /// Memory that must never be used (device regions, firmware runtime, holes).
    Reserved,
}

impl MemoryRegionType {
    /// Returns `true` if regions of this type are usable physical memory
    /// and therefore described by the frame database.
    pub fn is_usable(&self) -> bool {
        !matches!(self, MemoryRegionType::Reserved)
    }

    /// Returns `true` if regions of this type start out as free frames.
    pub fn is_free(&self) -> bool {
        matches!(self, MemoryRegionType::Free)
    }
}

/// One entry of the boot-provided memory map.
#[derive(Clone, Copy, Debug)]
pub struct MemoryRegion {
    pub base: PhysicalAddress,
    pub size_in_bytes: usize,
    pub typ: MemoryRegionType,
}

impl MemoryRegion {
    pub const fn new(base: PhysicalAddress, size_in_bytes: usize, typ: MemoryRegionType) -> MemoryRegion {
        MemoryRegion { base, size_in_bytes, typ }
    }

    pub fn end(&self) -> PhysicalAddress {
        self.base + self.size_in_bytes
    }

    pub fn frames(&self) -> FrameRange {
        FrameRange::from_addr(self.base, self.size_in_bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn canonical_virtual_addresses() {
        assert!(VirtualAddress::new(0x0000_7FFF_FFFF_FFFF).is_some());
        assert!(VirtualAddress::new(0xFFFF_8000_0000_0000).is_some());
        assert!(VirtualAddress::new(0x0000_8000_0000_0000).is_none());
        assert_eq!(
            VirtualAddress::new_canonical(0x0000_8000_0000_0000).value(),
            0xFFFF_8000_0000_0000,
        );
    }

    #[test]
    fn page_table_indices() {
        let page = Page::containing_address(VirtualAddress::new_canonical(
            (1 << 39) + (2 << 30) + (3 << 21) + (4 << 12),
        ));
        assert_eq!(page.p4_index(), 1);
        assert_eq!(page.p3_index(), 2);
        assert_eq!(page.p2_index(), 3);
        assert_eq!(page.p1_index(), 4);
    }

    #[test]
    fn frame_range_sizes() {
        let range = FrameRange::from_addr(PhysicalAddress::new_canonical(0x1000), 0x3000);
        assert_eq!(range.size_in_frames(), 3);
        assert_eq!(range.start().number(), 1);
        assert_eq!(range.end().number(), 3);
        assert!(range.contains(&Frame::from_number(2)));
        assert!(!range.contains(&Frame::from_number(4)));
        assert_eq!(FrameRange::empty().size_in_frames(), 0);
        assert_eq!(FrameRange::empty().iter().count(), 0);
    }
}
