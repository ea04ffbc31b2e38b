// Playback sessions and the manager that routes clips to them

mod input;
pub mod manager;
pub mod registry;
pub mod session;
pub mod storage;

#[cfg(test)]
mod testing;

use std::sync::Once;

pub use manager::{default_sink, ClipSource, SessionManager};
pub use registry::{Duckable, SessionRegistry};
pub use session::{PlaybackSession, SessionEnv, SessionParts};
pub use storage::{MemoryStorage, StdStorage, Storage, StorageFile};

static INIT_LOGGER: Once = Once::new();

/// Install `env_logger` at info level unless a logger is already set.
pub fn init_logging() {
    INIT_LOGGER.call_once(|| {
        let _ = env_logger::builder()
            .is_test(false)
            .filter_level(log::LevelFilter::Info)
            .try_init();
    });
}
