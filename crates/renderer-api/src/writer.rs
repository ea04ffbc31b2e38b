// PCM writers driven by the sink thread

use crate::{PcmFormat, SinkError};
use parking_lot::Mutex;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

/// Final stage of a `ThreadSink`.
///
/// A writer is created on and only ever touched by the sink thread, so it
/// may hold device handles that are not `Send`. `write` should block for
/// roughly as long as the PCM takes to play; that is what paces the pulls.
pub trait PcmWriter {
    fn open(&mut self, format: PcmFormat) -> Result<(), SinkError>;

    fn write(&mut self, pcm: &[u8]) -> Result<(), SinkError>;

    /// Block until everything written so far has been played.
    fn drain(&mut self) {}

    fn pause(&mut self) {}

    fn resume(&mut self) {}

    fn close(&mut self);
}

/// Discards PCM at (a multiple of) real-time speed
pub struct NullWriter {
    speed: f64,
    format: Option<PcmFormat>,
    clock: Option<(Instant, u64)>,
}

impl NullWriter {
    pub fn new() -> Self {
        Self::with_speed(1.0)
    }

    /// Play `speed` times faster than real time; 0 disables pacing.
    pub fn with_speed(speed: f64) -> Self {
        Self {
            speed,
            format: None,
            clock: None,
        }
    }
}

impl Default for NullWriter {
    fn default() -> Self {
        Self::new()
    }
}

impl PcmWriter for NullWriter {
    fn open(&mut self, format: PcmFormat) -> Result<(), SinkError> {
        format.validate()?;
        self.format = Some(format);
        self.clock = None;
        Ok(())
    }

    fn write(&mut self, pcm: &[u8]) -> Result<(), SinkError> {
        let format = self.format.ok_or(SinkError::NotConfigured)?;
        if self.speed <= 0.0 {
            return Ok(());
        }

        // Pace against a running clock so short writes do not drift.
        let (begin, written) = self.clock.get_or_insert_with(|| (Instant::now(), 0));
        *written += pcm.len() as u64;
        let due = *written as f64 / (format.bytes_per_second() as f64 * self.speed);
        let due = *begin + Duration::from_secs_f64(due);
        let now = Instant::now();
        if due > now {
            thread::sleep(due - now);
        }
        Ok(())
    }

    fn pause(&mut self) {
        self.clock = None;
    }

    fn resume(&mut self) {
        self.clock = None;
    }

    fn close(&mut self) {
        self.format = None;
        self.clock = None;
    }
}

#[derive(Debug, Default)]
pub struct Capture {
    pub format: Option<PcmFormat>,
    pub pcm: Vec<u8>,
    pub writes: usize,
    pub opens: usize,
    pub closes: usize,
}

/// Records everything written to it
#[derive(Clone, Default)]
pub struct CaptureWriter {
    capture: Arc<Mutex<Capture>>,
    delay: Option<Duration>,
}

impl CaptureWriter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sleep `delay` after every write, standing in for device latency.
    pub fn with_delay(delay: Duration) -> Self {
        Self {
            capture: Arc::default(),
            delay: Some(delay),
        }
    }

    pub fn capture(&self) -> Arc<Mutex<Capture>> {
        self.capture.clone()
    }
}

impl PcmWriter for CaptureWriter {
    fn open(&mut self, format: PcmFormat) -> Result<(), SinkError> {
        format.validate()?;
        let mut capture = self.capture.lock();
        capture.format = Some(format);
        capture.opens += 1;
        Ok(())
    }

    fn write(&mut self, pcm: &[u8]) -> Result<(), SinkError> {
        {
            let mut capture = self.capture.lock();
            capture.pcm.extend_from_slice(pcm);
            capture.writes += 1;
        }
        if let Some(delay) = self.delay {
            thread::sleep(delay);
        }
        Ok(())
    }

    fn close(&mut self) {
        self.capture.lock().closes += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_null_writer_paces_in_real_time() {
        let mut writer = NullWriter::new();
        writer.open(PcmFormat::new(8000, 1)).unwrap();

        let begin = Instant::now();
        // 1600 bytes at 16000 bytes/s is 100 ms
        writer.write(&[0u8; 800]).unwrap();
        writer.write(&[0u8; 800]).unwrap();
        assert!(begin.elapsed() >= Duration::from_millis(95));
    }

    #[test]
    fn test_null_writer_requires_open() {
        let mut writer = NullWriter::with_speed(0.0);
        assert_eq!(writer.write(&[0u8; 4]), Err(SinkError::NotConfigured));
        writer.open(PcmFormat::default()).unwrap();
        assert!(writer.write(&[0u8; 4]).is_ok());
    }

    #[test]
    fn test_capture_writer_records() {
        let mut writer = CaptureWriter::new();
        let capture = writer.capture();

        writer.open(PcmFormat::new(22050, 1)).unwrap();
        writer.write(&[1, 2]).unwrap();
        writer.write(&[3]).unwrap();
        writer.close();

        let capture = capture.lock();
        assert_eq!(capture.pcm, vec![1, 2, 3]);
        assert_eq!(capture.writes, 2);
        assert_eq!((capture.opens, capture.closes), (1, 1));
        assert_eq!(capture.format, Some(PcmFormat::new(22050, 1)));
    }
}
