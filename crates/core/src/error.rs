// Error handling for the streaming audio engine

use thiserror::Error;

/// Audio engine error types
///
/// Every non-success outcome of a playback session ends up as one of these,
/// attached to the session's terminal `Stopped` event.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AudioError {
    /// Invalid path, URL or argument
    #[error("Invalid parameter: {0}")]
    InvalidParam(String),

    /// Operation not allowed in the current state
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// No free slot left in the session registry
    #[error("Session registry is full ({0} slots)")]
    RegistryFull(usize),

    /// Failed to open a local or embedded input
    #[error("Open failed: {0}")]
    OpenFailed(String),

    /// Input exists but holds no data
    #[error("Empty input: {0}")]
    EmptyInput(String),

    /// Failed to read or seek an open input
    #[error("Read failed: {0}")]
    ReadFailed(String),

    /// Bitstream could not be decoded
    #[error("Unsupported format: {0}")]
    UnsupportedFormat(String),

    /// Buffered network input never arrived
    #[error("Network timeout: {0}")]
    NetworkTimeout(String),

    /// Download gave up after its retry budget
    #[error("Network error: {0}")]
    Network(String),

    /// Audio sink could not be configured or started
    #[error("Device error: {0}")]
    Device(String),

    /// The request was replaced by a newer start
    #[error("Superseded by a newer request")]
    Superseded,

    /// IO error
    #[error("IO error: {0}")]
    Io(String),
}

/// Coarse classification used by the orchestration layer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Parameter,
    Resource,
    Transient,
    Protocol,
    Decode,
    Timeout,
    State,
}

/// Diagnostic prompt a caller may play after a failure
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FallbackPrompt {
    NetworkUnavailable,
    FormatUnsupported,
}

impl AudioError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            AudioError::InvalidParam(_) => ErrorKind::Parameter,
            AudioError::RegistryFull(_) | AudioError::Device(_) => ErrorKind::Resource,
            AudioError::OpenFailed(_)
            | AudioError::EmptyInput(_)
            | AudioError::ReadFailed(_)
            | AudioError::Io(_) => ErrorKind::Transient,
            AudioError::Network(_) => ErrorKind::Protocol,
            AudioError::UnsupportedFormat(_) => ErrorKind::Decode,
            AudioError::NetworkTimeout(_) => ErrorKind::Timeout,
            AudioError::InvalidState(_) | AudioError::Superseded => ErrorKind::State,
        }
    }

    /// Which diagnostic prompt fits this failure.
    pub fn fallback(&self) -> FallbackPrompt {
        match self {
            AudioError::NetworkTimeout(_) | AudioError::Network(_) => {
                FallbackPrompt::NetworkUnavailable
            }
            _ => FallbackPrompt::FormatUnsupported,
        }
    }
}

/// Result type alias for audio operations
pub type Result<T> = std::result::Result<T, AudioError>;

impl From<std::io::Error> for AudioError {
    fn from(err: std::io::Error) -> Self {
        AudioError::Io(err.to_string())
    }
}
