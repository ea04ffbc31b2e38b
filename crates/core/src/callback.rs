// Thread-safe callback mechanism for session events
// Progress reports are throttled so a slow listener never stalls the worker

use crate::handle::Handle;
use crate::state::{Progress, StopReason};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Session event types
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    /// Input opened and decoder running
    Started { handle: Handle },

    /// Session returned to idle
    Stopped { handle: Handle, reason: StopReason },

    /// Output suspended; `ducked` is set when another session interrupted it
    Paused { handle: Handle, ducked: bool },

    /// Output resumed after a pause or interruption
    Resumed { handle: Handle },

    /// Playback position update
    Progress { handle: Handle, progress: Progress },
}

/// Session callback trait
/// Implementations run on the session worker and should return quickly
pub trait SessionCallback: Send + Sync {
    fn on_event(&self, session: &str, event: SessionEvent);
}

/// Throttled callback wrapper
pub struct ThrottledCallback {
    inner: Arc<dyn SessionCallback>,
    last_progress: Mutex<Option<Instant>>,
    progress_interval: Duration,
}

impl ThrottledCallback {
    pub fn new(callback: Arc<dyn SessionCallback>, progress_interval: Duration) -> Self {
        Self {
            inner: callback,
            last_progress: Mutex::new(None),
            progress_interval,
        }
    }

    pub fn dispatch(&self, session: &str, event: SessionEvent) {
        if let SessionEvent::Progress { .. } = &event {
            let mut last = self.last_progress.lock();
            if let Some(at) = *last {
                if at.elapsed() < self.progress_interval {
                    return;
                }
            }
            *last = Some(Instant::now());
        }
        self.inner.on_event(session, event);
    }
}

/// Callback list owned by one session
pub struct CallbackDispatcher {
    callbacks: Mutex<Vec<Arc<ThrottledCallback>>>,
}

impl CallbackDispatcher {
    pub fn new() -> Self {
        Self {
            callbacks: Mutex::new(Vec::new()),
        }
    }

    pub fn add_callback(&self, callback: Arc<dyn SessionCallback>, progress_interval: Duration) {
        let throttled = Arc::new(ThrottledCallback::new(callback, progress_interval));
        self.callbacks.lock().push(throttled);
    }

    pub fn clear_callbacks(&self) {
        self.callbacks.lock().clear();
    }

    pub fn dispatch(&self, session: &str, event: SessionEvent) {
        // Listeners may call back into the session; never hold the list lock while they run.
        let callbacks: Vec<_> = self.callbacks.lock().clone();
        for callback in callbacks {
            callback.dispatch(session, event.clone());
        }
    }
}

impl Default for CallbackDispatcher {
    fn default() -> Self {
        Self::new()
    }
}
