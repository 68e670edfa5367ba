use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

/// Raised by the first SIGINT/SIGTERM while `ddbctl maintain` runs.
static SHUTDOWN: AtomicBool = AtomicBool::new(false);

/// Route SIGINT and SIGTERM to [`SHUTDOWN`].
///
/// The handler is one-shot: a second signal hits the default disposition and
/// ends the process even if the current maintenance tick is stuck.
pub fn install_signal_handlers() {
    #[cfg(unix)]
    for sig in [libc::SIGINT, libc::SIGTERM] {
        // Safety: the handler only touches an atomic.
        unsafe {
            let mut action: libc::sigaction = std::mem::zeroed();
            action.sa_sigaction = on_signal as *const () as libc::sighandler_t;
            action.sa_flags = libc::SA_RESETHAND;
            libc::sigemptyset(&mut action.sa_mask);
            if libc::sigaction(sig, &action, std::ptr::null_mut()) != 0 {
                tracing::warn!(signal = sig, "could not install shutdown handler");
            }
        }
    }
}

#[cfg(unix)]
extern "C" fn on_signal(_sig: libc::c_int) {
    SHUTDOWN.store(true, Ordering::SeqCst);
}

pub fn shutdown_requested() -> bool {
    SHUTDOWN.load(Ordering::SeqCst)
}

/// Sleep in `poll` steps until a shutdown signal arrives.
pub fn wait_for_shutdown(poll: Duration) {
    while !shutdown_requested() {
        std::thread::sleep(poll);
    }
}
