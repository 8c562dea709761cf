#![doc = include_str!("../README.md")]

mod constants;
mod error;
mod fixup;
mod memory;
mod pool;
mod relocate;

pub use error::HookError;

use constants::{B_IMM_MASK, B_OPCODE, BR_X17, LDR_X17_LITERAL_8, MAX_INSTRUCTIONS, NOP};
use log::{error, info};

/// Diverts the function at `symbol` to `replace` and returns the address of
/// a trampoline that reaches the original implementation.
///
/// The trampoline is allocated from an internal RWX pool of fixed-size slots
/// and lives for the rest of the process; it re-executes the displaced
/// prologue instructions (rewritten for their new address) and jumps back
/// into the original function.
///
/// Any literal an `LDR (literal)` in the prologue points at may be copied
/// into the trampoline as a snapshot; mutating the original literal
/// afterwards will not be reflected there.
///
/// # Example
///
/// ```rust,no_run
/// use a64hook::hook;
///
/// extern "C" fn replacement(a: i32, b: i32) -> i32 {
///     a * b
/// }
///
/// let symbol = 0x1000_0000u64; // e.g. from dlsym
/// let trampoline = hook(symbol, replacement as usize as u64)?;
/// let original: extern "C" fn(i32, i32) -> i32 =
///     unsafe { std::mem::transmute(trampoline) };
/// let _ = original;
/// # Ok::<(), a64hook::HookError>(())
/// ```
pub fn hook(symbol: u64, replace: u64) -> Result<u64, HookError> {
    let slot = pool::allocate_slot()?;
    install(symbol, replace, Some((slot, pool::SLOT_BYTES)))?;
    Ok(slot)
}

/// Diverts the function at `symbol` to `replace` without keeping a way back.
///
/// No trampoline is generated; the original implementation becomes
/// unreachable through this hook.
///
/// # Example
///
/// ```rust,no_run
/// use a64hook::hook_no_trampoline;
///
/// extern "C" fn replacement() {}
///
/// hook_no_trampoline(0x1000_0000, replacement as usize as u64)?;
/// # Ok::<(), a64hook::HookError>(())
/// ```
pub fn hook_no_trampoline(symbol: u64, replace: u64) -> Result<(), HookError> {
    install(symbol, replace, None)
}

/// Like [`hook`], but writes the trampoline into a caller-owned buffer that
/// must already be readable, writable and executable.
///
/// Returns `rwx` on success. The buffer must hold the worst-case expansion
/// of the displaced window ([`BufferTooSmall`](HookError::BufferTooSmall)
/// names the shortfall otherwise), must not overlap the hooked function, and
/// must outlive every call made through the trampoline.
///
/// # Example
///
/// ```rust,no_run
/// use a64hook::hook_with_buffer;
///
/// extern "C" fn replacement() {}
///
/// let buffer = 0x7F00_0000_0000u64; // an RWX mapping owned by the caller
/// let trampoline = hook_with_buffer(0x1000_0000, replacement as usize as u64, buffer, 200)?;
/// assert_eq!(trampoline, buffer);
/// # Ok::<(), a64hook::HookError>(())
/// ```
pub fn hook_with_buffer(
    symbol: u64,
    replace: u64,
    rwx: u64,
    rwx_size: usize,
) -> Result<u64, HookError> {
    install(symbol, replace, Some((rwx, rwx_size)))?;
    Ok(rwx)
}

/// Number of prologue instructions the patch displaces: one for a `B` in
/// reach, otherwise the 4-word far sequence, or 5 with a leading NOP when
/// the entry is on the wrong parity for the 8-byte target literal.
fn displaced_count(symbol: u64, replace: u64) -> usize {
    let displacement = (replace as i64 - symbol as i64) >> 2;
    if displacement.unsigned_abs() >= (B_IMM_MASK as u64 >> 1) {
        if (symbol + 8) & 7 != 0 { 5 } else { 4 }
    } else {
        1
    }
}

/// Worst-case trampoline bytes for a `count`-instruction window.
fn trampoline_reserve(count: usize) -> usize {
    count * 10 * 4
}

fn install(symbol: u64, replace: u64, trampoline: Option<(u64, usize)>) -> Result<(), HookError> {
    if symbol == 0 || symbol & 3 != 0 || replace & 3 != 0 {
        return Err(HookError::InvalidAddress);
    }

    let count = displaced_count(symbol, replace);

    if let Some((rwx, rwx_size)) = trampoline {
        if rwx == 0 || rwx & 3 != 0 {
            return Err(HookError::InvalidAddress);
        }

        let need = trampoline_reserve(count);
        if rwx_size < need {
            error!("trampoline buffer too small: need {need} bytes, got {rwx_size}");
            return Err(HookError::BufferTooSmall {
                need,
                got: rwx_size,
            });
        }

        // the relocator reads the window while writing the buffer
        let window_end = symbol + 4 * count as u64;
        if rwx < window_end && rwx + rwx_size as u64 > symbol {
            error!("trampoline buffer {rwx:#x} overlaps hooked function {symbol:#x}");
            return Err(HookError::BufferOverlapsTarget);
        }
    }

    // unprotect the entry before generating anything, so a failure here
    // leaves no trampoline behind
    if let Err(err) = memory::make_writable(symbol as usize, MAX_INSTRUCTIONS * 4) {
        error!("cannot unprotect {symbol:#x}: {err}");
        return Err(err);
    }

    if let Some((rwx, _)) = trampoline {
        // fully written and flushed before the divert below goes live
        relocate::relocate_window(symbol, count, rwx);
    }

    if count == 1 {
        let displacement = ((replace as i64 - symbol as i64) >> 2) as u32;
        memory::patch_branch_atomic(symbol, B_OPCODE | (displacement & B_IMM_MASK))?;
    } else {
        let mut prologue = [NOP; 5];
        let skip = count - 4;
        prologue[skip] = LDR_X17_LITERAL_8;
        prologue[skip + 1] = BR_X17;
        prologue[skip + 2] = replace as u32;
        prologue[skip + 3] = (replace >> 32) as u32;
        memory::patch_prologue(symbol, &prologue[..skip + 4])?;
    }

    info!(
        "inline hook {symbol:#x} -> {replace:#x} installed ({} bytes overwritten)",
        count * 4
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn patch_form_follows_distance_and_parity() {
        // within ±128 MiB: single-word patch
        assert_eq!(displaced_count(0x1000_0000, 0x1000_1000), 1);
        assert_eq!(displaced_count(0x1000_0000, 0x1700_0000), 1);
        // out of reach, entry + 8 already 8-aligned
        assert_eq!(displaced_count(0x1000_0000, 0x9000_0000), 4);
        // out of reach, off parity: leading NOP
        assert_eq!(displaced_count(0x1000_0004, 0x9000_0000), 5);
    }

    #[test]
    fn buffer_size_is_checked_before_anything_runs() {
        let err = hook_with_buffer(0x1000_0000, 0x9000_0000, 0x2000_0000, 8);
        assert_eq!(
            err,
            Err(HookError::BufferTooSmall {
                need: 160,
                got: 8
            })
        );
    }

    #[test]
    fn overlapping_buffer_is_rejected() {
        let err = hook_with_buffer(0x1000_0000, 0x9000_0000, 0x1000_0004, 200);
        assert_eq!(err, Err(HookError::BufferOverlapsTarget));
    }

    #[test]
    fn unaligned_addresses_are_rejected() {
        assert_eq!(
            hook_no_trampoline(0x1000_0002, 0x2000_0000),
            Err(HookError::InvalidAddress)
        );
        assert_eq!(
            hook_no_trampoline(0, 0x2000_0000),
            Err(HookError::InvalidAddress)
        );
        assert_eq!(
            hook_with_buffer(0x1000_0000, 0x9000_0000, 0x2000_0001, 200),
            Err(HookError::InvalidAddress)
        );
    }
}
