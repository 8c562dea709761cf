//! Hooks a local function from an init-array constructor and calls the
//! original back through the trampoline. Target and replacement share the
//! executable's image, so the divert is a single-word near patch.

#[cfg(target_arch = "aarch64")]
use std::sync::atomic::{AtomicU64, Ordering};

#[cfg(target_arch = "aarch64")]
#[inline(never)]
#[unsafe(no_mangle)]
extern "C" fn target_add(a: i32, b: i32) -> i32 {
    a + b
}

#[cfg(target_arch = "aarch64")]
extern "C" fn replacement(a: i32, b: i32) -> i32 {
    a * b
}

#[cfg(target_arch = "aarch64")]
static TRAMPOLINE: AtomicU64 = AtomicU64::new(0);

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
        // the executable may not export its own symbols dynamically; fall
        // back to the function pointer when dlsym comes up empty
        let symbol = libc::dlsym(libc::RTLD_DEFAULT, c"target_add".as_ptr());
        let symbol = if symbol.is_null() {
            target_add as usize as u64
        } else {
            symbol as u64
        };

        if let Ok(trampoline) = a64hook::hook(symbol, replacement as usize as u64) {
            TRAMPOLINE.store(trampoline, Ordering::Release);
        }
    }
}

#[cfg(target_arch = "aarch64")]
fn main() {
    println!("target_add(6, 7) = {}", target_add(6, 7)); // now multiplies

    let trampoline = TRAMPOLINE.load(Ordering::Acquire);
    if trampoline != 0 {
        let original: extern "C" fn(i32, i32) -> i32 =
            unsafe { std::mem::transmute(trampoline) };
        println!("original(6, 7)   = {}", original(6, 7));
    }
}

#[cfg(not(target_arch = "aarch64"))]
fn main() {
    println!("this demo only runs on aarch64");
}
