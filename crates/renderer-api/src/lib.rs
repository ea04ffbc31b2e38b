// Audio sink abstraction layer

use chime_core::AudioError;
use thiserror::Error;

pub mod thread_sink;
pub mod writer;

#[cfg(feature = "cpal")]
pub mod cpal_writer;

pub use thread_sink::ThreadSink;
pub use writer::{Capture, CaptureWriter, NullWriter, PcmWriter};

#[cfg(feature = "cpal")]
pub use cpal_writer::CpalWriter;

/// What one data request produced
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Pull {
    /// `n` bytes of PCM were written to the front of the buffer
    Data(usize),
    /// Nothing available yet; ask again shortly
    Starved,
    /// The stream has ended
    Finished,
}

/// Data request callback registered by the PCM producer.
/// Runs on the sink thread, never with a sink lock held.
pub type PcmCallback = Box<dyn FnMut(&mut [u8]) -> Pull + Send + 'static>;

/// Interleaved signed 16-bit little-endian PCM
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PcmFormat {
    pub sample_rate: u32,
    pub channels: u16,
}

impl PcmFormat {
    pub fn new(sample_rate: u32, channels: u16) -> Self {
        Self {
            sample_rate,
            channels,
        }
    }

    pub fn bytes_per_frame(&self) -> usize {
        self.channels as usize * 2
    }

    pub fn bytes_per_second(&self) -> usize {
        self.sample_rate as usize * self.bytes_per_frame()
    }

    pub fn validate(&self) -> Result<(), SinkError> {
        if self.sample_rate == 0 || !(1..=2).contains(&self.channels) {
            return Err(SinkError::InvalidFormat(*self));
        }
        Ok(())
    }
}

impl Default for PcmFormat {
    fn default() -> Self {
        Self {
            sample_rate: 44100,
            channels: 2,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SinkError {
    #[error("sink started before configure")]
    NotConfigured,
    #[error("unsupported pcm format {0:?}")]
    InvalidFormat(PcmFormat),
    #[error("output device: {0}")]
    Device(String),
    #[error("sink thread did not answer")]
    Unresponsive,
}

impl From<SinkError> for AudioError {
    fn from(err: SinkError) -> Self {
        match err {
            SinkError::InvalidFormat(_) => AudioError::UnsupportedFormat(err.to_string()),
            _ => AudioError::Device(err.to_string()),
        }
    }
}

/// Pull-based PCM consumer.
///
/// The producer registers a data callback; the sink calls it from its own
/// thread whenever it wants more PCM. All methods take `&self` so a sink can
/// be shared between the supervisor and its controllers.
pub trait AudioSink: Send + Sync {
    fn configure(&self, format: PcmFormat) -> Result<(), SinkError>;

    fn set_data_callback(&self, callback: Option<PcmCallback>);

    fn start(&self) -> Result<(), SinkError>;

    fn pause(&self) -> Result<(), SinkError>;

    fn resume(&self) -> Result<(), SinkError>;

    fn stop(&self) -> Result<(), SinkError>;

    /// The producer has nothing left; the next empty pull ends the stream.
    fn set_no_more_data(&self);

    /// The stream ended and everything pulled has been played
    fn is_done(&self) -> bool;

    /// Running, but the last pull came back empty
    fn is_starved(&self) -> bool;
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case(PcmFormat::new(44100, 2), true)]
    #[case(PcmFormat::new(16000, 1), true)]
    #[case(PcmFormat::new(0, 2), false)]
    #[case(PcmFormat::new(48000, 6), false)]
    fn test_format_validation(#[case] format: PcmFormat, #[case] valid: bool) {
        assert_eq!(format.validate().is_ok(), valid);
    }

    #[test]
    fn test_format_rates() {
        let format = PcmFormat::new(16000, 1);
        assert_eq!(format.bytes_per_frame(), 2);
        assert_eq!(format.bytes_per_second(), 32000);
    }

    #[test]
    fn test_sink_error_maps_to_audio_error() {
        let err: AudioError = SinkError::InvalidFormat(PcmFormat::new(0, 2)).into();
        assert!(matches!(err, AudioError::UnsupportedFormat(_)));
        let err: AudioError = SinkError::NotConfigured.into();
        assert!(matches!(err, AudioError::Device(_)));
    }
}
