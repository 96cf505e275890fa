// https://wiki.osdev.org/Paging

// Avoids lots of warnings about casting usize to u32 which cannot result in
// truncation on a 32-bit platform, which is all we support. It would be nice if
// you could tell clippy that you were only dealing with 32-bit usizes...
#![allow(clippy::cast_possible_truncation)]

use crate::mem::OFFSET;
use arbitrary_int::{u10, u12, u20};
use bitbybit::bitfield;

#[bitfield(u32, default = 0)]
pub struct PageTableEntry {
    #[bit(0, rw)]
    present: bool,
    #[bit(1, rw)]
    read_write: bool,
    #[bit(2, rw)]
    user_supervisor: bool,
    #[bit(3, rw)]
    write_through: bool,
    #[bit(4, rw)]
    cache_disable: bool,
    #[bit(5, rw)]
    accessed: bool,
    #[bit(6, rw)]
    dirty: bool,
    #[bit(7, rw)]
    page_attribute_table: bool,
    #[bit(8, rw)]
    global: bool,
    #[bits(12..=31, rw)]
    page_frame_address: u20,
}

impl PageTableEntry {
    /// A present user mapping of physical frame number `frame`.
    pub fn user(frame: u20, writable: bool) -> Self {
        Self::DEFAULT
            .with_present(true)
            .with_user_supervisor(true)
            .with_read_write(writable)
            .with_page_frame_address(frame)
    }
}

#[bitfield(u32)]
pub struct VirtualAddress {
    #[bits(22..=31, r)]
    page_directory_index: u10,
    #[bits(12..=21, r)]
    page_table_index: u10,
    #[bits(0..=11, r)]
    offset: u12,
}

impl VirtualAddress {
    /// Returns `None` for addresses that do not fit the 32-bit address space.
    pub fn from_usize(addr: usize) -> Option<Self> {
        u32::try_from(addr).ok().map(Self::new_with_raw_value)
    }

    pub fn page_number(self) -> u20 {
        u20::new(self.raw_value() >> 12)
    }

    pub fn as_usize(self) -> usize {
        self.raw_value() as usize
    }

    pub fn is_user(self) -> bool {
        self.as_usize() < OFFSET
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_virtual_address_fields() {
        let va = VirtualAddress::from_usize(0xBFFF_F123).unwrap();
        assert_eq!(va.page_number().value(), 0xBFFFF);
        assert_eq!(va.page_directory_index().value(), 0x2FF);
        assert_eq!(va.page_table_index().value(), 0x3FF);
        assert_eq!(va.offset().value(), 0x123);
        assert!(va.is_user());
        assert!(!VirtualAddress::from_usize(OFFSET).unwrap().is_user());
    }

    #[test]
    fn test_user_entry() {
        let pte = PageTableEntry::user(u20::new(0x42), false);
        assert!(pte.present());
        assert!(pte.user_supervisor());
        assert!(!pte.read_write());
        assert!(!pte.dirty());
        assert_eq!(pte.page_frame_address().value(), 0x42);
    }
}
