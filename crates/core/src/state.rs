// Session state and clip description

use crate::error::{AudioError, Result};

/// Playback session state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlaybackState {
    /// Nothing assigned, waiting for a start
    Idle,
    /// Opening input and starting the decoder
    Starting,
    /// PCM is flowing to the sink
    Playing,
    /// Paused by the user
    Paused,
    /// Interrupted by another session (ducking)
    Broken,
    /// Tearing down input, decoder and registry slot
    Stopping,
    /// Worker has exited
    Exited,
}

impl PlaybackState {
    pub fn is_idle(self) -> bool {
        self == PlaybackState::Idle
    }

    /// Check that a worker transition follows the session state machine.
    pub fn validate_transition(from: PlaybackState, to: PlaybackState) -> Result<()> {
        use PlaybackState::*;

        match (from, to) {
            (Idle, Starting) | (Idle, Exited) => Ok(()),

            (Starting, Playing) | (Starting, Stopping) => Ok(()),

            (Playing, Paused) | (Playing, Broken) | (Playing, Stopping) => Ok(()),

            (Paused, Playing) | (Paused, Stopping) => Ok(()),
            (Broken, Playing) | (Broken, Stopping) => Ok(()),

            (Stopping, Idle) => Ok(()),

            _ if from == to => Ok(()),

            _ => Err(AudioError::InvalidState(format!(
                "Invalid state transition from {:?} to {:?}",
                from, to
            ))),
        }
    }
}

/// Where the compressed bytes come from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceKind {
    Network,
    LocalFile,
    Flash,
}

/// What the clip is; resources duck other sessions, prompts do not
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContentKind {
    Resource,
    Prompt,
}

/// What a session is asked to play
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClipInfo {
    pub path: String,
    pub source: SourceKind,
    pub content: ContentKind,
    /// Resume whatever this clip interrupted once it stops
    pub resume_previous: bool,
}

impl ClipInfo {
    pub fn new(path: impl Into<String>, source: SourceKind, content: ContentKind) -> Self {
        Self {
            path: path.into(),
            source,
            content,
            resume_previous: true,
        }
    }

    pub fn with_resume_previous(mut self, resume: bool) -> Self {
        self.resume_previous = resume;
        self
    }

    pub fn is_network(&self) -> bool {
        self.source == SourceKind::Network
    }
}

/// Elapsed and total playback time
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Progress {
    pub elapsed_secs: u32,
    pub total_secs: u32,
}

impl Progress {
    /// `mm:ss/mm:ss`
    pub fn display(&self) -> String {
        format!(
            "{:02}:{:02}/{:02}:{:02}",
            self.elapsed_secs / 60,
            self.elapsed_secs % 60,
            self.total_secs / 60,
            self.total_secs % 60
        )
    }
}

/// Why a session went back to idle
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StopReason {
    /// Input drained and the sink finished
    Completed,
    /// Stopped on request
    Requested,
    /// Terminated by an error
    Failed(AudioError),
}
