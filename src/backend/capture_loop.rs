//! Thread lifecycle for backend capture loops.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use tracing::{debug, info, warn};

use crate::error::{Error, Result};

/// What a capture loop iteration asks for next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopAction {
    /// Run another iteration.
    Continue,
    /// Leave the loop.
    Stop,
}

/// A capture loop running on its own thread.
///
/// The loop body is called repeatedly until it returns [`LoopAction::Stop`]
/// or [`stop`](Self::stop) is called. Dropping the controller stops and
/// joins the thread.
pub struct CaptureLoop {
    thread: Option<JoinHandle<()>>,
    stop_signal: Arc<AtomicBool>,
    name: String,
}

impl CaptureLoop {
    /// Spawn a named loop thread. `init` runs once on the new thread and
    /// builds the state handed to every iteration; if it fails the thread
    /// exits without iterating.
    pub fn start<S, I, F>(name: &str, init: I, mut body: F) -> Result<Self>
    where
        I: FnOnce() -> Result<S> + Send + 'static,
        F: FnMut(&mut S, &AtomicBool) -> LoopAction + Send + 'static,
        S: 'static,
    {
        let stop_signal = Arc::new(AtomicBool::new(false));
        let thread_stop = Arc::clone(&stop_signal);
        let thread_name = name.to_owned();

        info!(name, "starting capture loop");

        let thread = thread::Builder::new()
            .name(name.to_owned())
            .spawn(move || {
                let mut state = match init() {
                    Ok(state) => state,
                    Err(err) => {
                        warn!(name = %thread_name, error = %err, "capture loop initialization failed");
                        return;
                    }
                };

                while !thread_stop.load(Ordering::SeqCst) {
                    if body(&mut state, &thread_stop) == LoopAction::Stop {
                        debug!(name = %thread_name, "capture loop requested stop");
                        break;
                    }
                }

                debug!(name = %thread_name, "capture loop exiting");
            })
            .map_err(Error::from)?;

        Ok(Self {
            thread: Some(thread),
            stop_signal,
            name: name.to_owned(),
        })
    }

    /// Whether the thread is still running.
    pub fn is_running(&self) -> bool {
        self.thread.as_ref().is_some_and(|thread| !thread.is_finished())
    }

    /// Signal the loop to stop without waiting for it.
    pub fn request_stop(&self) {
        self.stop_signal.store(true, Ordering::SeqCst);
    }

    /// Signal the loop to stop and join the thread.
    pub fn stop(&mut self) {
        self.request_stop();
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                warn!(name = %self.name, "capture loop thread panicked");
            } else {
                debug!(name = %self.name, "capture loop stopped");
            }
        }
    }
}

impl Drop for CaptureLoop {
    fn drop(&mut self) {
        self.stop();
    }
}
