//! Hooks libc's `strlen`, resolved with `dlsym` from an init-array
//! constructor. libc's image is mapped far from the executable's, so the
//! divert takes the long-patch form; the trampoline keeps the real
//! implementation reachable.

#[cfg(target_arch = "aarch64")]
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

#[cfg(target_arch = "aarch64")]
static TRAMPOLINE: AtomicU64 = AtomicU64::new(0);

#[cfg(target_arch = "aarch64")]
static CALLS: AtomicUsize = AtomicUsize::new(0);

#[cfg(target_arch = "aarch64")]
extern "C" fn counting_strlen(s: *const libc::c_char) -> usize {
    CALLS.fetch_add(1, Ordering::Relaxed);

    let trampoline = TRAMPOLINE.load(Ordering::Acquire);
    if trampoline == 0 {
        // the divert can fire before the trampoline address is published
        let mut len = 0;
        while unsafe { *s.add(len) } != 0 {
            len += 1;
        }
        return len;
    }

    let original: extern "C" fn(*const libc::c_char) -> usize =
        unsafe { std::mem::transmute(trampoline) };
    original(s)
}

#[cfg(target_arch = "aarch64")]
#[used]
#[cfg_attr(
    any(target_os = "linux", target_os = "android"),
    unsafe(link_section = ".init_array")
)]
#[cfg_attr(target_os = "macos", unsafe(link_section = "__DATA,__mod_init_func"))]
static INIT_ARRAY: extern "C" fn() = init;

#[cfg(target_arch = "aarch64")]
extern "C" fn init() {
    unsafe {
        let symbol = libc::dlsym(libc::RTLD_DEFAULT, c"strlen".as_ptr());
        if symbol.is_null() {
            return;
        }

        if let Ok(trampoline) = a64hook::hook(symbol as u64, counting_strlen as usize as u64) {
            TRAMPOLINE.store(trampoline, Ordering::Release);
        }
    }
}

#[cfg(target_arch = "aarch64")]
fn main() {
    let sample = c"a64hook";
    let len = unsafe { libc::strlen(sample.as_ptr()) };
    println!("strlen(\"a64hook\")      = {len}");
    println!("strlen calls observed = {}", CALLS.load(Ordering::Relaxed));
}

#[cfg(not(target_arch = "aarch64"))]
fn main() {
    println!("this demo only runs on aarch64");
}
