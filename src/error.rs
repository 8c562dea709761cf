use libc::c_int;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HookError {
    InvalidAddress,
    PageSizeUnavailable,
    ProtectFailed {
        errno: c_int,
    },
    PoolInitFailed {
        errno: c_int,
    },
    PoolExhausted,
    BufferTooSmall {
        need: usize,
        got: usize,
    },
    BufferOverlapsTarget,
}

impl fmt::Display for HookError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            HookError::InvalidAddress => write!(f, "invalid address"),
            HookError::PageSizeUnavailable => write!(f, "page size unavailable"),
            HookError::ProtectFailed { errno } => {
                write!(f, "mprotect failed (errno={errno})")
            }
            HookError::PoolInitFailed { errno } => {
                write!(f, "trampoline pool mmap failed (errno={errno})")
            }
            HookError::PoolExhausted => write!(f, "trampoline pool is exhausted"),
            HookError::BufferTooSmall { need, got } => {
                write!(
                    f,
                    "trampoline buffer too small (need {need} bytes, got {got})"
                )
            }
            HookError::BufferOverlapsTarget => {
                write!(f, "trampoline buffer overlaps the hooked function")
            }
        }
    }
}

impl std::error::Error for HookError {}
