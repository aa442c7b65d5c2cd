//! Signal handling for graceful loop shutdown.
//!
//! SIGTERM and SIGINT set an atomic from the raw handler; a watcher thread
//! polls it and calls [`StopHandle::stop`], which interrupts the loop's
//! blocked alarm wait. Nothing but an atomic store happens in signal context.

use phaselock_runtime::StopHandle;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU32, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::{debug, info, warn};

const POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Signal number delivered but not yet handled (0 = none).
static PENDING_SIGNAL: AtomicI32 = AtomicI32::new(0);

/// Signals that stop the loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalKind {
    /// SIGTERM - graceful termination request.
    Terminate,
    /// SIGINT - interrupt (Ctrl+C).
    Interrupt,
}

impl SignalKind {
    fn from_raw(signum: i32) -> Option<Self> {
        match signum {
            libc::SIGTERM => Some(Self::Terminate),
            libc::SIGINT => Some(Self::Interrupt),
            _ => None,
        }
    }
}

impl std::fmt::Display for SignalKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SignalKind::Terminate => write!(f, "SIGTERM"),
            SignalKind::Interrupt => write!(f, "SIGINT"),
        }
    }
}

/// State shared between the watcher thread and the daemon.
#[derive(Debug, Default)]
pub struct SignalState {
    finished: AtomicBool,
    signal_count: AtomicU32,
}

impl SignalState {
    /// Count one delivered shutdown signal.
    fn record_signal(&self) {
        self.signal_count.fetch_add(1, Ordering::Relaxed);
    }

    /// Total shutdown signals received.
    pub fn signal_count(&self) -> u32 {
        self.signal_count.load(Ordering::Relaxed)
    }

    fn mark_finished(&self) {
        self.finished.store(true, Ordering::Relaxed);
    }

    fn is_finished(&self) -> bool {
        self.finished.load(Ordering::Relaxed)
    }
}

/// Forwards shutdown signals to a loop's [`StopHandle`].
pub struct SignalWatcher {
    state: Arc<SignalState>,
    thread: Option<JoinHandle<()>>,
}

impl SignalWatcher {
    /// Register SIGTERM/SIGINT handlers and start the watcher thread.
    ///
    /// # Errors
    ///
    /// Returns an error if the watcher thread cannot be spawned.
    pub fn install(stop: StopHandle) -> std::io::Result<Self> {
        let watcher = Self::spawn(stop, &PENDING_SIGNAL)?;

        #[cfg(unix)]
        register_unix_handlers();

        Ok(watcher)
    }

    fn spawn(stop: StopHandle, pending: &'static AtomicI32) -> std::io::Result<Self> {
        let state = Arc::new(SignalState::default());

        let watcher_state = Arc::clone(&state);
        let thread = std::thread::Builder::new()
            .name(String::from("signal-watcher"))
            .spawn(move || watch(&watcher_state, pending, &stop))?;

        Ok(Self {
            state,
            thread: Some(thread),
        })
    }

    /// Stop the watcher thread and wait for it to exit.
    pub fn shutdown(mut self) -> u32 {
        self.join();
        self.state.signal_count()
    }

    fn join(&mut self) {
        self.state.mark_finished();
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                warn!("Signal watcher thread panicked");
            }
        }
    }
}

impl Drop for SignalWatcher {
    fn drop(&mut self) {
        self.join();
    }
}

fn watch(state: &SignalState, pending: &AtomicI32, stop: &StopHandle) {
    while !state.is_finished() {
        let signum = pending.swap(0, Ordering::Relaxed);
        if let Some(kind) = SignalKind::from_raw(signum) {
            info!(signal = %kind, "Shutdown signal received, stopping loop");
            state.record_signal();
            stop.stop();
        }
        std::thread::sleep(POLL_INTERVAL);
    }
    debug!("Signal watcher exiting");
}

#[cfg(unix)]
fn register_unix_handlers() {
    use std::os::raw::c_int;

    extern "C" fn on_shutdown_signal(signum: c_int) {
        PENDING_SIGNAL.store(signum, Ordering::Relaxed);
    }

    // SAFETY: the handler performs a single atomic store, which is
    // async-signal-safe.
    unsafe {
        libc::signal(libc::SIGTERM, on_shutdown_signal as libc::sighandler_t);
        libc::signal(libc::SIGINT, on_shutdown_signal as libc::sighandler_t);
    }

    debug!("Unix signal handlers registered");
}
