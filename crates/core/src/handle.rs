// Monotonic request handles

use std::sync::atomic::{AtomicU32, Ordering};

/// Handle assigned to every `start`; a caller holding an older one knows
/// its request was superseded.
pub type Handle = u32;

/// Issues strictly increasing handles, starting at 1
#[derive(Debug, Default)]
pub struct HandleAllocator {
    last: AtomicU32,
}

impl HandleAllocator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next(&self) -> Handle {
        let mut handle = self.last.fetch_add(1, Ordering::SeqCst).wrapping_add(1);
        if handle == 0 {
            handle = self.last.fetch_add(1, Ordering::SeqCst).wrapping_add(1);
        }
        handle
    }

    pub fn last(&self) -> Handle {
        self.last.load(Ordering::SeqCst)
    }
}
