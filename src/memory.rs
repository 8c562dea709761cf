#[cfg(all(any(target_os = "macos", target_os = "ios"), target_arch = "aarch64"))]
use crate::constants::VM_PROT_COPY;
use crate::constants::MAX_INSTRUCTIONS;
use crate::error::HookError;
use libc::{c_int, c_void};
use std::sync::atomic::{AtomicU32, Ordering};

#[cfg(all(any(target_os = "macos", target_os = "ios"), target_arch = "aarch64"))]
unsafe extern "C" {
    fn sys_icache_invalidate(start: *mut c_void, len: usize);
    fn mach_vm_protect(
        target_task: libc::vm_map_t,
        address: libc::mach_vm_address_t,
        size: libc::mach_vm_size_t,
        set_maximum: libc::boolean_t,
        new_protection: libc::vm_prot_t,
    ) -> libc::kern_return_t;
}

#[cfg(all(
    any(target_os = "linux", target_os = "android"),
    target_arch = "aarch64"
))]
unsafe extern "C" {
    fn __clear_cache(begin: *mut c_void, end: *mut c_void);
}

#[inline]
pub(crate) fn last_errno() -> c_int {
    #[cfg(target_os = "macos")]
    {
        unsafe { *libc::__error() }
    }

    #[cfg(target_os = "ios")]
    {
        unsafe { *libc::__error() }
    }

    #[cfg(target_os = "linux")]
    {
        unsafe { *libc::__errno_location() }
    }

    #[cfg(target_os = "android")]
    {
        unsafe { *libc::__errno() }
    }
}

#[inline]
pub(crate) fn read_u32(address: u64) -> u32 {
    unsafe { u32::from_le(std::ptr::read_volatile(address as *const u32)) }
}

#[inline]
pub(crate) fn write_u32(address: u64, value: u32) {
    unsafe { std::ptr::write_unaligned(address as *mut u32, value.to_le()) }
}

#[inline]
pub(crate) fn write_u64(address: u64, value: u64) {
    unsafe { std::ptr::write_unaligned(address as *mut u64, value.to_le()) }
}

#[inline]
pub(crate) fn copy_bytes(src: u64, dst: u64, len: usize) {
    unsafe { std::ptr::copy_nonoverlapping(src as *const u8, dst as *mut u8, len) }
}

fn page_size() -> Result<usize, HookError> {
    let value = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if value <= 0 {
        return Err(HookError::PageSizeUnavailable);
    }
    Ok(value as usize)
}

fn protect_range_start_len(address: usize, len: usize, page_size: usize) -> (usize, usize) {
    let start = address & !(page_size - 1);
    let end_inclusive = address + len - 1;
    let end_page = end_inclusive & !(page_size - 1);
    let total = (end_page + page_size) - start;
    (start, total)
}

pub(crate) fn make_writable(address: usize, len: usize) -> Result<(), HookError> {
    let page_size = page_size()?;
    let (protect_start, protect_len) = protect_range_start_len(address, len, page_size);

    #[cfg(all(any(target_os = "macos", target_os = "ios"), target_arch = "aarch64"))]
    {
        let kr = unsafe {
            mach_vm_protect(
                libc::mach_task_self(),
                protect_start as u64,
                protect_len as u64,
                0,
                libc::VM_PROT_READ | libc::VM_PROT_WRITE | VM_PROT_COPY,
            )
        };

        if kr != 0 {
            return Err(HookError::ProtectFailed {
                errno: last_errno(),
            });
        }
    }

    #[cfg(not(all(any(target_os = "macos", target_os = "ios"), target_arch = "aarch64")))]
    {
        let result = unsafe {
            libc::mprotect(
                protect_start as *mut c_void,
                protect_len,
                libc::PROT_READ | libc::PROT_WRITE | libc::PROT_EXEC,
            )
        };

        if result != 0 {
            return Err(HookError::ProtectFailed {
                errno: last_errno(),
            });
        }
    }

    Ok(())
}

fn make_executable(address: usize, len: usize) -> Result<(), HookError> {
    let page_size = page_size()?;
    let (protect_start, protect_len) = protect_range_start_len(address, len, page_size);

    #[cfg(all(any(target_os = "macos", target_os = "ios"), target_arch = "aarch64"))]
    {
        let kr = unsafe {
            mach_vm_protect(
                libc::mach_task_self(),
                protect_start as u64,
                protect_len as u64,
                0,
                libc::VM_PROT_READ | libc::VM_PROT_EXECUTE,
            )
        };

        if kr != 0 {
            return Err(HookError::ProtectFailed {
                errno: last_errno(),
            });
        }
    }

    #[cfg(not(all(any(target_os = "macos", target_os = "ios"), target_arch = "aarch64")))]
    {
        let result = unsafe {
            libc::mprotect(
                protect_start as *mut c_void,
                protect_len,
                libc::PROT_READ | libc::PROT_EXEC,
            )
        };

        if result != 0 {
            return Err(HookError::ProtectFailed {
                errno: last_errno(),
            });
        }
    }

    Ok(())
}

pub(crate) fn flush_icache(address: u64, len: usize) {
    #[cfg(all(any(target_os = "macos", target_os = "ios"), target_arch = "aarch64"))]
    unsafe {
        sys_icache_invalidate(address as *mut c_void, len);
    }

    #[cfg(all(
        any(target_os = "linux", target_os = "android"),
        target_arch = "aarch64"
    ))]
    unsafe {
        let end = (address as usize).wrapping_add(len) as *mut c_void;
        __clear_cache(address as *mut c_void, end);
    }

    #[cfg(not(target_arch = "aarch64"))]
    {
        let _ = (address, len);
    }
}

/// Atomically swaps the single word at `address` for `branch`, so a
/// concurrent fetch observes either the old word or the new one in full.
pub(crate) fn patch_branch_atomic(address: u64, branch: u32) -> Result<(), HookError> {
    make_writable(address as usize, 4)?;

    let previous = read_u32(address);
    let atomic = unsafe { AtomicU32::from_ptr(address as *mut u32) };
    let _ = atomic.compare_exchange(previous, branch, Ordering::SeqCst, Ordering::SeqCst);

    flush_icache(address, 4);
    make_executable(address as usize, 4)
}

/// Writes the far-patch prologue. The protection toggle always spans the
/// full 5-word reach so the aligned and unaligned entry forms take the same
/// path; the write itself is not atomic.
pub(crate) fn patch_prologue(address: u64, words: &[u32]) -> Result<(), HookError> {
    let reserve = MAX_INSTRUCTIONS * 4;

    make_writable(address as usize, reserve)?;

    for (i, word) in words.iter().enumerate() {
        write_u32(address + 4 * i as u64, *word);
    }

    flush_icache(address, reserve);
    make_executable(address as usize, reserve)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constants::{B_OPCODE, BR_X17, LDR_X17_LITERAL_8, NOP};
    use std::ptr::null_mut;

    // large enough that the protect range stays inside the mapping whatever
    // the system page size
    const MAP_LEN: usize = 65536;

    fn map_scratch() -> u64 {
        let memory = unsafe {
            libc::mmap(
                null_mut(),
                MAP_LEN,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANON,
                -1,
                0,
            )
        };
        assert_ne!(memory, libc::MAP_FAILED);
        memory as u64
    }

    fn unmap_scratch(address: u64) {
        unsafe { libc::munmap(address as *mut c_void, MAP_LEN) };
    }

    #[test]
    fn prologue_words_land_in_order() {
        let page = map_scratch();
        let words = [NOP, LDR_X17_LITERAL_8, BR_X17, 0x2000_0000, 0x0000_0001];
        patch_prologue(page, &words).unwrap();

        for (i, word) in words.iter().enumerate() {
            assert_eq!(read_u32(page + 4 * i as u64), *word);
        }
        unmap_scratch(page);
    }

    #[test]
    fn four_word_prologue_leaves_fifth_untouched() {
        let page = map_scratch();
        patch_prologue(page + 16, &[NOP; 5]).unwrap();
        let words = [LDR_X17_LITERAL_8, BR_X17, 0x2000_0000, 0x0000_0001];
        patch_prologue(page + 16, &words).unwrap();

        for (i, word) in words.iter().enumerate() {
            assert_eq!(read_u32(page + 16 + 4 * i as u64), *word);
        }
        assert_eq!(read_u32(page + 32), NOP);
        unmap_scratch(page);
    }

    #[test]
    fn branch_patch_swaps_the_single_word() {
        let page = map_scratch();
        write_u32(page, 0xD65F_03C0); // ret
        write_u32(page + 4, NOP);
        patch_branch_atomic(page, B_OPCODE | 0x40).unwrap();

        assert_eq!(read_u32(page), B_OPCODE | 0x40);
        assert_eq!(read_u32(page + 4), NOP); // neighbor untouched
        unmap_scratch(page);
    }
}
