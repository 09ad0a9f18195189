//! Periodic background tasks with cooperative stop.
//!
//! Every background loop of the server (process data exchange, slave health
//! check, measurement sequencing) runs on its own named thread. The stop
//! signal is checked at the top of every iteration; the only suspension point
//! is the sleep between iterations, so a stop takes effect within one period.

use crate::error::{AcqError, AcqResult};
use std::ops::ControlFlow;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, warn};

/// Work performed by a [`PeriodicTask`] on every iteration.
pub trait Periodic: Send + 'static {
    /// Run one iteration. Returning `Break` ends the task.
    fn tick(&mut self) -> ControlFlow<()>;

    /// Called once on the task thread after the last iteration, whatever
    /// ended the loop.
    fn finish(&mut self) {}
}

/// Cloneable cooperative stop flag.
#[derive(Debug, Clone, Default)]
pub struct StopSignal(Arc<AtomicBool>);

impl StopSignal {
    /// Create a signal in the "not requested" state.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Request the owning task to stop at its next iteration.
    pub fn request(&self) {
        self.0.store(true, Ordering::Release);
    }

    /// Check whether a stop was requested.
    #[inline]
    #[must_use]
    pub fn is_requested(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

/// Clears the running flag even if the work panics.
struct RunningGuard(Arc<AtomicBool>);

impl Drop for RunningGuard {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Handle to a periodic background thread owning its work value.
///
/// The work value is moved into the thread and handed back on join, so the
/// state it carries is owned by exactly one context at a time.
#[derive(Debug)]
pub struct PeriodicTask<W: Periodic> {
    name: String,
    stop: StopSignal,
    running: Arc<AtomicBool>,
    handle: Option<JoinHandle<W>>,
}

impl<W: Periodic> PeriodicTask<W> {
    /// Spawn `work` on a named thread, ticking it every `period`.
    ///
    /// # Errors
    ///
    /// Returns an error if the thread cannot be spawned.
    pub fn spawn(name: &str, period: Duration, work: W) -> AcqResult<Self> {
        let stop = StopSignal::new();
        let running = Arc::new(AtomicBool::new(true));

        let thread_stop = stop.clone();
        let guard = RunningGuard(Arc::clone(&running));
        let thread_name = name.to_string();

        let handle = thread::Builder::new()
            .name(name.into())
            .spawn(move || {
                let _guard = guard;
                let mut work = work;
                debug!(task = %thread_name, period_ms = period.as_millis(), "Task started");

                while !thread_stop.is_requested() {
                    if work.tick().is_break() {
                        break;
                    }
                    thread::sleep(period);
                }

                work.finish();
                debug!(task = %thread_name, "Task stopped");
                work
            })
            .map_err(|e| {
                running.store(false, Ordering::Release);
                AcqError::Config(format!("failed to spawn {name} thread: {e}"))
            })?;

        Ok(Self {
            name: name.to_string(),
            stop,
            running,
            handle: Some(handle),
        })
    }

    /// Task name (also the thread name).
    pub fn name(&self) -> &str {
        &self.name
    }

    /// A clone of the task's stop signal.
    #[must_use]
    pub fn stop_signal(&self) -> StopSignal {
        self.stop.clone()
    }

    /// Request the task to stop without waiting.
    pub fn request_stop(&self) {
        self.stop.request();
    }

    /// Returns true until the loop has exited.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Returns true once the thread has exited (or was already joined).
    pub fn is_finished(&self) -> bool {
        self.handle.as_ref().map_or(true, JoinHandle::is_finished)
    }

    /// Wait for the task to exit on its own and take back its work value.
    ///
    /// Returns `None` if the task panicked.
    pub fn join(mut self) -> Option<W> {
        self.join_inner()
    }

    /// Request a stop, wait for the task to exit and take back its work value.
    ///
    /// Returns `None` if the task panicked.
    pub fn stop(mut self) -> Option<W> {
        self.stop.request();
        self.join_inner()
    }

    fn join_inner(&mut self) -> Option<W> {
        let handle = self.handle.take()?;
        match handle.join() {
            Ok(work) => Some(work),
            Err(e) => {
                warn!(task = %self.name, "Task thread panicked: {:?}", e);
                None
            }
        }
    }
}

impl<W: Periodic> Drop for PeriodicTask<W> {
    fn drop(&mut self) {
        if self.handle.is_some() {
            self.stop.request();
            let _ = self.join_inner();
        }
    }
}
