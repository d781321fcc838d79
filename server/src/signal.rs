//! Signal handling for graceful shutdown.

use std::sync::atomic::{AtomicBool, Ordering};

/// Install the SIGINT/SIGTERM handler. The first signal invokes
/// `on_shutdown` (typically: stop the server, quit the base loop); a second
/// signal forces an immediate exit.
pub fn install(on_shutdown: impl Fn() + Send + 'static) {
    static SIGNALLED: AtomicBool = AtomicBool::new(false);

    ctrlc::set_handler(move || {
        if SIGNALLED.swap(true, Ordering::SeqCst) {
            tracing::warn!("received second signal, forcing immediate exit");
            std::process::exit(1);
        }
        tracing::info!("received shutdown signal, stopping");
        on_shutdown();
    })
    .expect("failed to install signal handler");
}

/// Writes to a closed connection must surface as `EPIPE`, not kill the
/// process.
pub fn ignore_sigpipe() {
    #[cfg(unix)]
    unsafe {
        libc::signal(libc::SIGPIPE, libc::SIG_IGN);
    }
}
