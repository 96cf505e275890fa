//! Access to user memory on behalf of system calls.
//!
//! User pages may not be resident, so every access goes through the fault
//! path one page at a time and copies while holding the frame.

use crate::mem::page_table::SupplementalPageTable;
use crate::mem::{PageFault, VmError};
use alloc::{vec, vec::Vec};
use kidneyos_vm_shared::mem::{is_user_vaddr, pg_ofs, OFFSET, PAGE_FRAME_SIZE};

/// Checks that `[pointer, pointer + count)` lies entirely in user space.
pub fn check_user_range(pointer: usize, count: usize) -> Result<(), VmError> {
    let end = pointer
        .checked_add(count)
        .ok_or(VmError::SegmentationFault(pointer))?;
    // Trying to reach into kernel memory.
    if !is_user_vaddr(pointer) || end > OFFSET {
        return Err(VmError::SegmentationFault(pointer));
    }
    Ok(())
}

/// Runs `f` on the bytes of the page at `addr`, from `addr` to the end of the
/// page, with the page resident and its frame locked.
fn with_user_page<R>(
    spt: &SupplementalPageTable,
    addr: usize,
    write: bool,
    f: impl FnOnce(&mut [u8]) -> R,
) -> Result<R, VmError> {
    let frames = spt.system().frames();
    loop {
        let page = spt.resolve_fault(PageFault::syscall(addr, write))?;
        let resident = page.lock().frame;
        let Some(kpage) = resident else {
            continue;
        };
        let mut frame = frames.lock(kpage);
        if !frame.is_bound_to(&page) {
            continue;
        }
        page.lock().touch(write);
        return Ok(f(&mut frame.data_mut()[pg_ofs(addr)..]));
    }
}

fn for_each_chunk(
    pointer: usize,
    count: usize,
    mut f: impl FnMut(usize, core::ops::Range<usize>) -> Result<(), VmError>,
) -> Result<(), VmError> {
    if count == 0 {
        return Ok(());
    }
    check_user_range(pointer, count)?;
    let mut done = 0;
    while done < count {
        let addr = pointer + done;
        let len = (PAGE_FRAME_SIZE - pg_ofs(addr)).min(count - done);
        f(addr, done..done + len)?;
        done += len;
    }
    Ok(())
}

/// Copies `buf.len()` bytes of user memory starting at `pointer` into `buf`.
pub fn copy_from_user(
    spt: &SupplementalPageTable,
    pointer: usize,
    buf: &mut [u8],
) -> Result<(), VmError> {
    for_each_chunk(pointer, buf.len(), |addr, range| {
        let dst = &mut buf[range];
        with_user_page(spt, addr, false, |src| dst.copy_from_slice(&src[..dst.len()]))
    })
}

/// Copies `data` into user memory starting at `pointer`. Every page touched
/// must be writable.
pub fn copy_to_user(spt: &SupplementalPageTable, pointer: usize, data: &[u8]) -> Result<(), VmError> {
    for_each_chunk(pointer, data.len(), |addr, range| {
        let src = &data[range];
        with_user_page(spt, addr, true, |dst| dst[..src.len()].copy_from_slice(src))
    })
}

/// Copies `count` bytes of user memory at `pointer` into kernel memory.
///
/// Data is sometimes handed from one thread to another; copying it out first
/// saves mapping it into both.
pub fn read_user_bytes(
    spt: &SupplementalPageTable,
    pointer: usize,
    count: usize,
) -> Result<Vec<u8>, VmError> {
    let mut bytes = vec![0; count];
    copy_from_user(spt, pointer, &mut bytes)?;
    Ok(bytes)
}
