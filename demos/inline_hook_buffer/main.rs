//! Hooks a local function with a caller-owned RWX trampoline buffer.

#[cfg(target_arch = "aarch64")]
#[inline(never)]
extern "C" fn target_add(a: i32, b: i32) -> i32 {
    a + b
}

#[cfg(target_arch = "aarch64")]
extern "C" fn replacement(a: i32, b: i32) -> i32 {
    a - b
}

#[cfg(target_arch = "aarch64")]
fn main() {
    use a64hook::hook_with_buffer;
    use std::ptr::null_mut;

    let buffer = unsafe {
        libc::mmap(
            null_mut(),
            4096,
            libc::PROT_READ | libc::PROT_WRITE | libc::PROT_EXEC,
            libc::MAP_PRIVATE | libc::MAP_ANON,
            -1,
            0,
        )
    };
    assert_ne!(buffer, libc::MAP_FAILED, "mmap failed");

    let symbol = target_add as usize as u64;
    let trampoline = hook_with_buffer(symbol, replacement as usize as u64, buffer as u64, 4096)
        .expect("hook failed");

    println!("target_add(6, 7) = {}", target_add(6, 7)); // now subtracts

    let original: extern "C" fn(i32, i32) -> i32 = unsafe { std::mem::transmute(trampoline) };
    println!("original(6, 7)   = {}", original(6, 7));
}

#[cfg(not(target_arch = "aarch64"))]
fn main() {
    println!("this demo only runs on aarch64");
}
