use crate::constants::{MAX_BACKUPS, PAGE_SIZE, TRAMPOLINE_SLOT_WORDS};
use crate::error::HookError;
use crate::memory::last_errno;
use log::{error, info};
use std::ptr::null_mut;
use std::sync::Once;
use std::sync::atomic::{AtomicI32, AtomicU64, AtomicUsize, Ordering};

pub(crate) const SLOT_BYTES: usize = TRAMPOLINE_SLOT_WORDS * 4;
const POOL_BYTES: usize = (MAX_BACKUPS * SLOT_BYTES + PAGE_SIZE - 1) & !(PAGE_SIZE - 1);

// inline 64-bit literals in any slot must be alignable
const _: () = assert!(SLOT_BYTES % 8 == 0);

static POOL_INIT: Once = Once::new();
static POOL_BASE: AtomicU64 = AtomicU64::new(0);
static POOL_ERRNO: AtomicI32 = AtomicI32::new(0);
static NEXT_SLOT: AtomicUsize = AtomicUsize::new(0);

fn pool_base() -> Result<u64, HookError> {
    POOL_INIT.call_once(|| {
        let memory = unsafe {
            libc::mmap(
                null_mut(),
                POOL_BYTES,
                libc::PROT_READ | libc::PROT_WRITE | libc::PROT_EXEC,
                libc::MAP_PRIVATE | libc::MAP_ANON,
                -1,
                0,
            )
        };

        if memory == libc::MAP_FAILED {
            POOL_ERRNO.store(last_errno(), Ordering::Relaxed);
            return;
        }

        info!("trampoline pool initialized ({POOL_BYTES} bytes, {MAX_BACKUPS} slots)");
        POOL_BASE.store(memory as u64, Ordering::Release);
    });

    let base = POOL_BASE.load(Ordering::Acquire);
    if base == 0 {
        let errno = POOL_ERRNO.load(Ordering::Relaxed);
        error!("trampoline pool mmap failed (errno={errno})");
        return Err(HookError::PoolInitFailed { errno });
    }
    Ok(base)
}

/// Hands out the next free slot. Slots are never returned to the pool.
pub(crate) fn allocate_slot() -> Result<u64, HookError> {
    let base = pool_base()?;

    let index = NEXT_SLOT.fetch_add(1, Ordering::Relaxed);
    if index >= MAX_BACKUPS {
        error!("trampoline pool exhausted ({MAX_BACKUPS} slots)");
        return Err(HookError::PoolExhausted);
    }

    Ok(base + (index * SLOT_BYTES) as u64)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slots_are_distinct_and_contiguous() {
        // mapping an anonymous RWX region can be refused by a hardened
        // kernel; nothing to test further in that case
        let first = match allocate_slot() {
            Ok(addr) => addr,
            Err(_) => return,
        };
        let second = allocate_slot().unwrap();
        assert_eq!(second - first, SLOT_BYTES as u64);
        assert_eq!(first % 8, 0);
    }
}
