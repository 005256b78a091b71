// SPDX-License-Identifier: GPL-3.0-only
//! Thread lifecycle for simulated producer and consumer loops
//!
//! Every consumer attached to a simulated output runs in its own thread, the
//! way a display or encoder would drain its queue independently of the camera.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use tracing::{debug, info, warn};

/// Returned by a loop iteration to keep going or finish
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopAction {
    Continue,
    Stop,
}

/// Owns one loop thread
///
/// The loop runs until its closure returns [`LoopAction::Stop`] or the
/// controller is stopped. Dropping the controller stops and joins the thread.
///
/// ```ignore
/// let consumer = LoopController::start("display", move || {
///     if let Some(frame) = output.acquire_timeout(Duration::from_millis(50)) {
///         let _ = output.release(frame.slot, SyncPointFence::no_fence());
///     }
///     LoopAction::Continue
/// });
/// ```
pub struct LoopController {
    thread_handle: Option<JoinHandle<()>>,
    stop_signal: Arc<AtomicBool>,
    name: String,
}

impl LoopController {
    /// Spawn a thread calling `loop_fn` until it asks to stop
    pub fn start<F>(name: &str, mut loop_fn: F) -> Self
    where
        F: FnMut() -> LoopAction + Send + 'static,
    {
        Self::start_with_init(name, || Ok(()), move |_: &mut ()| loop_fn())
    }

    /// Spawn a thread that builds its state with `init_fn` first.
    ///
    /// If `init_fn` fails the thread exits without running the loop.
    pub fn start_with_init<S, I, F>(name: &str, init_fn: I, mut loop_fn: F) -> Self
    where
        S: Send + 'static,
        I: FnOnce() -> Result<S, String> + Send + 'static,
        F: FnMut(&mut S) -> LoopAction + Send + 'static,
    {
        let stop_signal = Arc::new(AtomicBool::new(false));
        let thread_stop = Arc::clone(&stop_signal);
        let thread_name = name.to_string();

        debug!(name = %name, "Starting loop thread");

        let thread_handle = thread::spawn(move || {
            let mut state = match init_fn() {
                Ok(state) => state,
                Err(e) => {
                    warn!(name = %thread_name, error = %e, "Loop initialization failed");
                    return;
                }
            };

            while !thread_stop.load(Ordering::SeqCst) {
                if loop_fn(&mut state) == LoopAction::Stop {
                    debug!(name = %thread_name, "Loop finished");
                    break;
                }
            }

            debug!(name = %thread_name, "Loop thread exiting");
        });

        Self {
            thread_handle: Some(thread_handle),
            stop_signal,
            name: name.to_string(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_running(&self) -> bool {
        self.thread_handle
            .as_ref()
            .is_some_and(|h| !h.is_finished())
    }

    /// Ask the loop to stop without waiting for it
    pub fn request_stop(&self) {
        self.stop_signal.store(true, Ordering::SeqCst);
    }

    /// Stop the loop and wait for the thread
    pub fn stop(&mut self) {
        self.request_stop();
        self.join();
    }

    /// Wait for the thread without signalling it
    pub fn join(&mut self) {
        if let Some(handle) = self.thread_handle.take() {
            if let Err(e) = handle.join() {
                warn!(name = %self.name, "Loop thread panicked: {:?}", e);
            } else {
                info!(name = %self.name, "Loop thread joined");
            }
        }
    }
}

impl Drop for LoopController {
    fn drop(&mut self) {
        if self.thread_handle.is_some() {
            debug!(name = %self.name, "LoopController dropped, stopping loop");
            self.stop();
        }
    }
}
