//! Shutdown orchestration for a Unix daemon.
//!
//! Installs handlers for `SIGTERM`/`SIGINT` (graceful shutdown) and `SIGHUP`
//! (config/mount-map reload) via `signal-hook`.
//!
//! Design notes:
//!   - The shutdown routine must not block the signal thread itself: the
//!     actual work runs on a background thread.
//!   - Shutdown is idempotent (runs once even if multiple signals arrive).
//!   - Avoid calling `std::process::exit` without calling `trigger()` first:
//!     `Drop` will be skipped and the PID file will be left behind.

use signal_hook::consts::{SIGHUP, SIGINT, SIGTERM};
use signal_hook::iterator::Signals;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;

/// Shared state referenced by the signal-watcher thread.
struct ShutdownInner {
    fired: AtomicBool,
    shutdown: Arc<dyn Fn() + Send + Sync + 'static>,
}

impl ShutdownInner {
    fn fire_once(&self) {
        if !self.fired.swap(true, Ordering::SeqCst) {
            let f = Arc::clone(&self.shutdown);
            thread::spawn(move || {
                log::info!("ShutdownHandler: running shutdown routine…");
                (f)();
                log::info!("ShutdownHandler: shutdown completed.");
            });
        }
    }
}

/// Installs `SIGTERM`/`SIGINT`/`SIGHUP` handlers on a dedicated background
/// thread and exposes a single-shot shutdown trigger plus a reload hook.
pub struct ShutdownHandler {
    state: Arc<ShutdownInner>,
}

impl ShutdownHandler {
    /// Registers the signal handlers.
    ///
    /// `shutdown_fn` runs exactly once, off the signal-delivery thread, on
    /// `SIGTERM`/`SIGINT`. `reload_fn` runs on every `SIGHUP` and may run any
    /// number of times.
    ///
    /// # Panics
    /// Panics if the signal iterator cannot be registered with the kernel.
    pub fn new<F, R>(shutdown_fn: F, reload_fn: R) -> Self
    where
        F: Fn() + Send + Sync + 'static,
        R: Fn() + Send + Sync + 'static,
    {
        let state = Arc::new(ShutdownInner {
            fired: AtomicBool::new(false),
            shutdown: Arc::new(shutdown_fn),
        });

        let mut signals = Signals::new([SIGTERM, SIGINT, SIGHUP])
            .expect("failed to register signal handlers");

        let watcher_state = Arc::clone(&state);
        thread::Builder::new()
            .name("signal_watcher".into())
            .spawn(move || {
                for signal in signals.forever() {
                    match signal {
                        SIGTERM | SIGINT => watcher_state.fire_once(),
                        SIGHUP => {
                            log::info!("SIGHUP received, reloading configuration");
                            reload_fn();
                        }
                        _ => {}
                    }
                }
            })
            .expect("failed to spawn signal watcher thread");

        log::debug!("ShutdownHandler: signal handlers installed.");
        Self { state }
    }

    /// Manually trigger shutdown (idempotent). Useful before
    /// `std::process::exit` or when exiting voluntarily.
    pub fn trigger(&self) {
        self.state.fire_once();
    }

    pub fn was_triggered(&self) -> bool {
        self.state.fired.load(Ordering::SeqCst)
    }
}

impl Drop for ShutdownHandler {
    fn drop(&mut self) {
        if !self.was_triggered() {
            log::debug!("ShutdownHandler: triggering shutdown from Drop.");
            self.state.fire_once();
        }
    }
}
