// Core types shared by the chime streaming audio engine

pub mod callback;
pub mod config;
pub mod error;
pub mod event;
pub mod handle;
pub mod state;

// Re-export commonly used types
pub use callback::{CallbackDispatcher, SessionCallback, SessionEvent, ThrottledCallback};
pub use config::{
    DecodeConfig, DownloadConfig, EngineConfig, ManagerConfig, PlayerConfig, StreamBufferConfig,
};
pub use error::{AudioError, ErrorKind, FallbackPrompt, Result};
pub use event::{EventGroup, Events};
pub use handle::{Handle, HandleAllocator};
pub use state::{ClipInfo, ContentKind, PlaybackState, Progress, SourceKind, StopReason};
