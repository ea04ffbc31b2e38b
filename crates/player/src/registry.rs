// Cross-session registry used for ducking decisions

use chime_core::{AudioError, PlaybackState, Result};
use parking_lot::Mutex;
use std::sync::{Arc, Weak};

/// What the registry needs from a session to duck and restore it.
///
/// `duck` and `restore` only signal the peer's worker; they never wait for
/// it or take the peer's control lock.
pub trait Duckable: Send + Sync {
    fn name(&self) -> &str;

    fn playback_state(&self) -> PlaybackState;

    /// The clip asked to be resumed after an interruption
    fn resume_previous(&self) -> bool;

    /// Break a playing session. Returns false if it was not playing.
    fn duck(&self) -> bool;

    /// Resume a broken session. Returns false if it was not broken.
    fn restore(&self) -> bool;
}

/// Fixed-size table of registered sessions, in registration order
pub struct SessionRegistry {
    slots: Mutex<Vec<Option<Weak<dyn Duckable>>>>,
}

fn same(a: &Weak<dyn Duckable>, b: &Arc<dyn Duckable>) -> bool {
    std::ptr::addr_eq(a.as_ptr(), Arc::as_ptr(b))
}

impl SessionRegistry {
    pub fn new(slots: usize) -> Self {
        Self {
            slots: Mutex::new(vec![None; slots]),
        }
    }

    pub fn capacity(&self) -> usize {
        self.slots.lock().len()
    }

    /// Take the first free slot. Registering twice is a no-op.
    pub fn register(&self, session: &Arc<dyn Duckable>) -> Result<usize> {
        let mut slots = self.slots.lock();
        if let Some(index) = slots
            .iter()
            .position(|slot| slot.as_ref().map_or(false, |s| same(s, session)))
        {
            return Ok(index);
        }

        // Slots of dropped sessions are free again.
        let free = slots
            .iter()
            .position(|slot| slot.as_ref().map_or(true, |s| s.strong_count() == 0));
        match free {
            Some(index) => {
                slots[index] = Some(Arc::downgrade(session));
                log::debug!("[registry] {} registered in slot {}", session.name(), index);
                Ok(index)
            }
            None => Err(AudioError::RegistryFull(slots.len())),
        }
    }

    pub fn unregister(&self, session: &Arc<dyn Duckable>) {
        let mut slots = self.slots.lock();
        for slot in slots.iter_mut() {
            if slot.as_ref().map_or(false, |s| same(s, session)) {
                *slot = None;
                log::debug!("[registry] {} unregistered", session.name());
            }
        }
    }

    pub fn is_registered(&self, session: &Arc<dyn Duckable>) -> bool {
        self.slots
            .lock()
            .iter()
            .any(|slot| slot.as_ref().map_or(false, |s| same(s, session)))
    }

    /// Snapshot of the other live sessions; the lock is released before
    /// the caller looks at their state.
    fn others(&self, me: &Arc<dyn Duckable>) -> Vec<Arc<dyn Duckable>> {
        self.slots
            .lock()
            .iter()
            .flatten()
            .filter(|s| !same(s, me))
            .filter_map(Weak::upgrade)
            .collect()
    }

    pub fn find_other_playing(&self, me: &Arc<dyn Duckable>) -> Vec<Arc<dyn Duckable>> {
        self.others(me)
            .into_iter()
            .filter(|s| s.playback_state() == PlaybackState::Playing)
            .collect()
    }

    /// First broken session in registry order
    pub fn find_other_broken(&self, me: &Arc<dyn Duckable>) -> Option<Arc<dyn Duckable>> {
        self.others(me)
            .into_iter()
            .find(|s| s.playback_state() == PlaybackState::Broken)
    }
}
