//! Thin wrappers over the shared (non-private) futex calls.
//!
//! `FUTEX_WAIT`/`FUTEX_WAKE` without `_PRIVATE` key on the physical page,
//! so waiters in different processes meet on the same word.

use std::sync::atomic::AtomicU32;
use swarm_common::Result;

/// Sleeps while `*word == expected`. Spurious returns are normal.
#[cfg(target_os = "linux")]
pub(crate) fn wait(word: &AtomicU32, expected: u32) -> Result<()> {
    // Safety: word points into a live mapping for the duration of the call.
    let rc = unsafe {
        libc::syscall(
            libc::SYS_futex,
            word as *const AtomicU32 as *const u32,
            libc::FUTEX_WAIT,
            expected,
            std::ptr::null::<libc::timespec>(),
            std::ptr::null::<u32>(),
            0u32,
        )
    };
    if rc == -1 {
        let err = std::io::Error::last_os_error();
        match err.raw_os_error() {
            // Value changed before we slept, or a signal woke us.
            Some(libc::EAGAIN) | Some(libc::EINTR) => {}
            _ => return Err(swarm_common::Error::lock("futex wait", err.to_string())),
        }
    }
    Ok(())
}

/// Wakes one waiter on `word`.
#[cfg(target_os = "linux")]
pub(crate) fn wake_one(word: &AtomicU32) -> Result<()> {
    // Safety: see `wait`.
    let rc = unsafe {
        libc::syscall(
            libc::SYS_futex,
            word as *const AtomicU32 as *const u32,
            libc::FUTEX_WAKE,
            1u32,
            std::ptr::null::<libc::timespec>(),
            std::ptr::null::<u32>(),
            0u32,
        )
    };
    if rc == -1 {
        return Err(swarm_common::Error::lock(
            "futex wake",
            std::io::Error::last_os_error().to_string(),
        ));
    }
    Ok(())
}

#[cfg(not(target_os = "linux"))]
pub(crate) fn wait(_word: &AtomicU32, _expected: u32) -> Result<()> {
    std::thread::yield_now();
    Ok(())
}

#[cfg(not(target_os = "linux"))]
pub(crate) fn wake_one(_word: &AtomicU32) -> Result<()> {
    Ok(())
}
