//! Process-wide stop flag.
//!
//! Handlers are installed in the parent before workers are forked, so each
//! worker inherits them along with its own copy of the flag.

use nix::sys::signal::{sigaction, SaFlags, SigAction, SigHandler, SigSet, Signal};
use std::ffi::c_int;
use std::sync::atomic::{AtomicBool, Ordering};

static STOP: AtomicBool = AtomicBool::new(false);

extern "C" fn on_stop_signal(_signal: c_int) {
    STOP.store(true, Ordering::SeqCst);
}

/// Routes each of `signals` to the stop flag.
///
/// `SA_RESTART` is left off so a blocking `waitpid` in the parent returns
/// `EINTR` and the reaper can notice the teardown.
pub fn install_stop_handlers(signals: &[Signal]) -> nix::Result<()> {
    let action = SigAction::new(
        SigHandler::Handler(on_stop_signal),
        SaFlags::empty(),
        SigSet::empty(),
    );
    for &signal in signals {
        // Safety: the handler only stores to an atomic.
        unsafe { sigaction(signal, &action) }?;
    }
    Ok(())
}

pub fn stop_requested() -> bool {
    STOP.load(Ordering::SeqCst)
}

pub fn request_stop() {
    STOP.store(true, Ordering::SeqCst);
}

pub fn reset_stop() {
    STOP.store(false, Ordering::SeqCst);
}
