//! Controllable looping thread.
//!
//! Wraps a background OS thread around a user callback invoked in a loop.
//! The callback's return value drives pacing: `Ok` loops immediately,
//! `Idle` sleeps for the configured idle time, `Error` is logged, and
//! `Done` ends the loop. After a stop request the loop performs up to 100
//! further iterations to let the callback drain its queues.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::{debug, warn};

/// Result of one loop iteration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopStatus {
    /// Work was done; call again immediately.
    Ok,
    /// Nothing to do; sleep before the next call.
    Idle,
    /// Finished; exit the loop.
    Done,
    /// Iteration failed; logged, loop continues (exits when stopping).
    Error,
}

/// Number of extra iterations granted after a stop request.
const MAX_ITERATIONS_ON_SHUTDOWN: u32 = 100;

/// A named background loop with start/stop/join control.
pub struct LoopThread {
    name: String,
    shutdown: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl LoopThread {
    /// Spawns the loop immediately.
    ///
    /// `idle_sleep` is applied whenever the callback returns
    /// [`LoopStatus::Idle`].
    pub fn start<F>(name: &str, idle_sleep: Duration, mut callback: F) -> Self
    where
        F: FnMut() -> LoopStatus + Send + 'static,
    {
        let shutdown = Arc::new(AtomicBool::new(false));
        let flag = shutdown.clone();
        let thread_name = name.to_string();
        let handle = std::thread::Builder::new()
            .name(thread_name.clone())
            .spawn(move || {
                debug!("thread {} starting", thread_name);
                let mut iterations_on_shutdown = 0u32;
                loop {
                    if flag.load(Ordering::Acquire) {
                        if iterations_on_shutdown >= MAX_ITERATIONS_ON_SHUTDOWN {
                            break;
                        }
                        iterations_on_shutdown += 1;
                    }
                    match callback() {
                        LoopStatus::Ok => {}
                        LoopStatus::Idle => {
                            if flag.load(Ordering::Acquire) {
                                break;
                            }
                            std::thread::sleep(idle_sleep);
                        }
                        LoopStatus::Error => {
                            warn!("thread {}: loop iteration reported an error", thread_name);
                            if flag.load(Ordering::Acquire) {
                                break;
                            }
                        }
                        LoopStatus::Done => break,
                    }
                }
                debug!("thread {} completed", thread_name);
            })
            .expect("spawning a named thread cannot fail with a valid name");
        Self {
            name: name.to_string(),
            shutdown,
            handle: Some(handle),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Requests termination; the loop drains and exits on its own.
    pub fn stop(&self) {
        self.shutdown.store(true, Ordering::Release);
    }

    /// Requests termination and waits for the thread to exit.
    pub fn join(&mut self) {
        self.stop();
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for LoopThread {
    fn drop(&mut self) {
        self.join();
    }
}
