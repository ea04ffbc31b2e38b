// Engine tuning constants

use std::time::Duration;

/// Chunked download buffer sizing
#[derive(Debug, Clone, Copy)]
pub struct StreamBufferConfig {
    pub chunk_size: usize,
    pub capacity: usize,
}

impl Default for StreamBufferConfig {
    fn default() -> Self {
        Self {
            chunk_size: 10 * 1024,
            capacity: 640 * 1024,
        }
    }
}

/// HTTP download retry policy and pacing
#[derive(Debug, Clone, Copy)]
pub struct DownloadConfig {
    /// Consecutive connect/send failures before giving up
    pub max_conn_errors: u32,
    /// Consecutive receive failures or empty responses before giving up
    pub max_recv_errors: u32,
    pub recv_chunk_size: usize,
    /// Wait for the headers of a fresh request
    pub response_timeout: Duration,
    /// Silence tolerated inside a body already announced
    pub body_stall_timeout: Duration,
    pub retry_delay: Duration,
    pub free_poll_interval: Duration,
    pub progress_interval: Duration,
    pub control_timeout: Duration,
    pub wait_poll_interval: Duration,
}

impl Default for DownloadConfig {
    fn default() -> Self {
        Self {
            max_conn_errors: 5,
            max_recv_errors: 15,
            recv_chunk_size: 2048,
            response_timeout: Duration::from_millis(3000),
            body_stall_timeout: Duration::from_secs(600),
            retry_delay: Duration::from_millis(500),
            free_poll_interval: Duration::from_millis(100),
            progress_interval: Duration::from_secs(2),
            control_timeout: Duration::from_secs(30),
            wait_poll_interval: Duration::from_millis(50),
        }
    }
}

/// Decoder worker and PCM handoff sizing
#[derive(Debug, Clone, Copy)]
pub struct DecodeConfig {
    pub ring_capacity: usize,
    pub scratch_size: usize,
    pub max_errors: u32,
    pub start_timeout: Duration,
    pub control_timeout: Duration,
}

impl Default for DecodeConfig {
    fn default() -> Self {
        Self {
            ring_capacity: 32 * 1024,
            scratch_size: 10 * 1024,
            max_errors: 20,
            start_timeout: Duration::from_secs(15),
            control_timeout: Duration::from_secs(30),
        }
    }
}

/// Playback session pacing and input prefix policy
#[derive(Debug, Clone, Copy)]
pub struct PlayerConfig {
    pub monitor_interval: Duration,
    pub progress_interval: Duration,
    pub control_timeout: Duration,
    /// Prefix awaited for a prompt whose length is unknown
    pub prompt_prefix: usize,
    /// Prefix awaited for a resource whose length is unknown
    pub resource_prefix: usize,
    /// Prefix awaited once the length is known
    pub known_length_prefix: usize,
    /// Base timeout in ms; each wait adds `size * base / 10240`
    pub prefix_timeout_base_ms: u64,
    pub registry_slots: usize,
}

impl Default for PlayerConfig {
    fn default() -> Self {
        Self {
            monitor_interval: Duration::from_millis(300),
            progress_interval: Duration::from_millis(1000),
            control_timeout: Duration::from_secs(30),
            prompt_prefix: 4 * 1024,
            resource_prefix: 25 * 1024,
            known_length_prefix: 20 * 1024,
            prefix_timeout_base_ms: 5000,
            registry_slots: 10,
        }
    }
}

impl PlayerConfig {
    /// How long to wait for `size` buffered bytes.
    ///
    /// With an unknown length the wait gets the base timeout on top of the
    /// size-scaled part.
    pub fn prefix_timeout(&self, size: usize, length_known: bool) -> Duration {
        let scaled = size as u64 * self.prefix_timeout_base_ms / 10240;
        if length_known {
            Duration::from_millis(scaled)
        } else {
            Duration::from_millis(scaled + self.prefix_timeout_base_ms)
        }
    }
}

/// Session manager options
#[derive(Debug, Clone)]
pub struct ManagerConfig {
    /// Flash prompt played after a network failure
    pub network_prompt: Option<String>,
    /// Flash prompt played after any other failure
    pub unsupported_prompt: Option<String>,
    pub start_poll_interval: Duration,
    pub prompt_poll_interval: Duration,
}

impl ManagerConfig {
    pub fn new() -> Self {
        Self {
            network_prompt: None,
            unsupported_prompt: None,
            start_poll_interval: Duration::from_millis(100),
            prompt_poll_interval: Duration::from_millis(500),
        }
    }
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self::new()
    }
}

/// Every tunable in one place
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub stream_buffer: StreamBufferConfig,
    pub download: DownloadConfig,
    pub decode: DecodeConfig,
    pub player: PlayerConfig,
    pub manager: ManagerConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            stream_buffer: StreamBufferConfig::default(),
            download: DownloadConfig::default(),
            decode: DecodeConfig::default(),
            player: PlayerConfig::default(),
            manager: ManagerConfig::default(),
        }
    }
}
