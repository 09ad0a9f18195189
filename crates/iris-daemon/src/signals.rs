//! Unix signal handling for the daemon.
//!
//! SIGTERM and SIGINT request shutdown; SIGHUP requests a status report.
//! The handlers only touch atomics; a watcher thread forwards the flags to
//! the shared [`SignalState`].

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info};

/// Signals the daemon reacts to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalKind {
    /// SIGTERM.
    Terminate,
    /// SIGINT.
    Interrupt,
    /// SIGHUP, used as a status report request.
    Hangup,
}

impl std::fmt::Display for SignalKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SignalKind::Terminate => write!(f, "SIGTERM"),
            SignalKind::Interrupt => write!(f, "SIGINT"),
            SignalKind::Hangup => write!(f, "SIGHUP"),
        }
    }
}

/// State shared between the watcher thread and the main loop.
#[derive(Debug, Default)]
pub struct SignalState {
    shutdown_requested: AtomicBool,
    status_requested: AtomicBool,
    signal_count: AtomicU32,
}

impl SignalState {
    /// Create a state with nothing requested.
    pub fn new() -> Self {
        Self::default()
    }

    /// Check if shutdown has been requested.
    #[inline]
    pub fn shutdown_requested(&self) -> bool {
        self.shutdown_requested.load(Ordering::Relaxed)
    }

    /// Check if a status report was requested (and clear the flag).
    #[inline]
    pub fn take_status_request(&self) -> bool {
        self.status_requested.swap(false, Ordering::Relaxed)
    }

    /// Request shutdown.
    pub fn request_shutdown(&self) {
        self.shutdown_requested.store(true, Ordering::Relaxed);
    }

    /// Request a status report.
    pub fn request_status(&self) {
        self.status_requested.store(true, Ordering::Relaxed);
    }

    fn record_signal(&self, kind: SignalKind) {
        self.signal_count.fetch_add(1, Ordering::Relaxed);
        info!(signal = %kind, "Signal received");
        match kind {
            SignalKind::Terminate | SignalKind::Interrupt => self.request_shutdown(),
            SignalKind::Hangup => self.request_status(),
        }
    }

    /// Total number of signals received.
    pub fn signal_count(&self) -> u32 {
        self.signal_count.load(Ordering::Relaxed)
    }
}

static TERM_FLAG: AtomicBool = AtomicBool::new(false);
static INT_FLAG: AtomicBool = AtomicBool::new(false);
static HUP_FLAG: AtomicBool = AtomicBool::new(false);

/// Handle to the installed signal handlers.
#[derive(Clone)]
pub struct SignalHandler {
    state: Arc<SignalState>,
}

impl SignalHandler {
    /// Install the handlers and start the watcher thread.
    ///
    /// On non-Unix platforms only manual shutdown is available.
    pub fn new() -> std::io::Result<Self> {
        let handler = Self {
            state: Arc::new(SignalState::new()),
        };

        #[cfg(unix)]
        handler.register_unix_handlers()?;

        Ok(handler)
    }

    #[cfg(unix)]
    fn register_unix_handlers(&self) -> std::io::Result<()> {
        use std::os::raw::c_int;

        let state = Arc::clone(&self.state);
        std::thread::Builder::new()
            .name("iris-signals".into())
            .spawn(move || loop {
                for (flag, kind) in [
                    (&TERM_FLAG, SignalKind::Terminate),
                    (&INT_FLAG, SignalKind::Interrupt),
                    (&HUP_FLAG, SignalKind::Hangup),
                ] {
                    if flag.swap(false, Ordering::Relaxed) {
                        state.record_signal(kind);
                    }
                }
                if state.shutdown_requested() {
                    break;
                }
                std::thread::sleep(Duration::from_millis(10));
            })?;

        extern "C" fn on_term(_: c_int) {
            TERM_FLAG.store(true, Ordering::Relaxed);
        }

        extern "C" fn on_int(_: c_int) {
            INT_FLAG.store(true, Ordering::Relaxed);
        }

        extern "C" fn on_hup(_: c_int) {
            HUP_FLAG.store(true, Ordering::Relaxed);
        }

        // Handlers only store to atomics, which is async-signal-safe.
        unsafe {
            libc::signal(libc::SIGTERM, on_term as libc::sighandler_t);
            libc::signal(libc::SIGINT, on_int as libc::sighandler_t);
            libc::signal(libc::SIGHUP, on_hup as libc::sighandler_t);
        }

        debug!("Unix signal handlers registered");
        Ok(())
    }

    /// Check if shutdown has been requested.
    #[inline]
    pub fn shutdown_requested(&self) -> bool {
        self.state.shutdown_requested()
    }

    /// Check if a status report was requested (clears the flag).
    #[inline]
    pub fn take_status_request(&self) -> bool {
        self.state.take_status_request()
    }

    /// Request shutdown from the daemon itself.
    pub fn request_shutdown(&self) {
        info!("Shutdown requested");
        self.state.request_shutdown();
    }

    /// Shared state.
    pub fn state(&self) -> &SignalState {
        &self.state
    }
}

/// Block until shutdown is requested or `timeout` expires.
///
/// Returns true if shutdown was requested.
pub fn wait_for_shutdown(handler: &SignalHandler, timeout: Duration) -> bool {
    let start = Instant::now();
    let poll_interval = Duration::from_millis(50);

    while start.elapsed() < timeout {
        if handler.shutdown_requested() {
            return true;
        }
        std::thread::sleep(poll_interval.min(timeout.saturating_sub(start.elapsed())));
    }

    handler.shutdown_requested()
}
