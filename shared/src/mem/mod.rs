use crate::sizes::{KB, MB, SECTOR_SIZE};

// Page size is 4KB. This is a property of x86 processors.
pub const PAGE_FRAME_SIZE: usize = 4 * KB;

/// Number of block sectors backing one page.
pub const SECTORS_PER_PAGE: u32 = PAGE_FRAME_SIZE as u32 / SECTOR_SIZE;

// Any virtual address at or above OFFSET is a kernel address.
pub const OFFSET: usize = 0xC000_0000;

/// Lowest address a user page may live at. Page 0 is never mapped so that
/// null pointer dereferences always fault.
pub const USER_BASE: usize = PAGE_FRAME_SIZE;

/// Maximum size of a user stack.
pub const USER_STACK_SIZE: usize = 8 * MB;

/// How far below the stack pointer an access may land and still count as
/// stack growth. `PUSHA` writes 32 bytes below `esp` before it moves.
pub const STACK_SLACK: usize = 32;

/// Distance between the clock hands, as a divisor of the frame count.
pub const HAND_SPREAD: usize = 4;

#[inline]
pub const fn pg_ofs(addr: usize) -> usize {
    addr & (PAGE_FRAME_SIZE - 1)
}

#[inline]
pub const fn pg_round_down(addr: usize) -> usize {
    addr & !(PAGE_FRAME_SIZE - 1)
}

#[inline]
pub const fn pg_round_up(addr: usize) -> usize {
    pg_round_down(addr + PAGE_FRAME_SIZE - 1)
}

#[inline]
pub const fn is_page_aligned(addr: usize) -> bool {
    pg_ofs(addr) == 0
}

/// Whether `addr` may ever be mapped for a user process.
#[inline]
pub const fn is_user_vaddr(addr: usize) -> bool {
    addr >= USER_BASE && addr < OFFSET
}

/// Whether `addr` lies in the region reserved for the user stack.
#[inline]
pub const fn is_stack_vaddr(addr: usize, max_stack_size: usize) -> bool {
    addr < OFFSET && addr >= OFFSET.saturating_sub(max_stack_size)
}
