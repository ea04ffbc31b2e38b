// cpal-backed writer for the default output device

use crate::writer::PcmWriter;
use crate::{PcmFormat, SinkError};
use chime_ringbuffer::SharedRingBuffer;
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{Stream, StreamConfig};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

const WRITE_RETRY: Duration = Duration::from_millis(5);
const DRAIN_LIMIT: Duration = Duration::from_secs(2);

/// Feeds the device callback through a ring sized for ~250 ms of audio.
pub struct CpalWriter {
    stream: Option<Stream>,
    ring: Option<SharedRingBuffer>,
    is_playing: Arc<AtomicBool>,
}

impl CpalWriter {
    pub fn new() -> Self {
        Self {
            stream: None,
            ring: None,
            is_playing: Arc::new(AtomicBool::new(false)),
        }
    }
}

impl Default for CpalWriter {
    fn default() -> Self {
        Self::new()
    }
}

impl PcmWriter for CpalWriter {
    fn open(&mut self, format: PcmFormat) -> Result<(), SinkError> {
        format.validate()?;
        self.close();

        let host = cpal::default_host();
        let device = host
            .default_output_device()
            .ok_or_else(|| SinkError::Device("no output device available".to_string()))?;

        let config = StreamConfig {
            channels: format.channels,
            sample_rate: cpal::SampleRate(format.sample_rate),
            buffer_size: cpal::BufferSize::Default,
        };

        let ring = SharedRingBuffer::new(format.bytes_per_second() / 4)
            .map_err(|e| SinkError::Device(e.to_string()))?;
        let device_ring = ring.clone();
        let is_playing = self.is_playing.clone();
        let mut bytes = Vec::new();

        let stream = device
            .build_output_stream(
                &config,
                move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
                    if !is_playing.load(Ordering::Relaxed) {
                        data.fill(0.0);
                        return;
                    }

                    bytes.resize(data.len() * 2, 0);
                    let read = device_ring.pop(&mut bytes) / 2;
                    for (sample, pair) in data.iter_mut().zip(bytes.chunks_exact(2)).take(read) {
                        *sample = i16::from_le_bytes([pair[0], pair[1]]) as f32 / 32768.0;
                    }

                    // Zero-fill any unwritten samples to prevent playing stale data
                    if read < data.len() {
                        data[read..].fill(0.0);
                    }
                },
                |err| {
                    log::error!("[sink] audio stream error: {}", err);
                },
                None,
            )
            .map_err(|e| SinkError::Device(format!("failed to build output stream: {}", e)))?;

        stream
            .play()
            .map_err(|e| SinkError::Device(format!("failed to start stream: {}", e)))?;
        self.is_playing.store(true, Ordering::Relaxed);
        self.stream = Some(stream);
        self.ring = Some(ring);
        log::info!("[sink] device opened {:?}", format);
        Ok(())
    }

    fn write(&mut self, pcm: &[u8]) -> Result<(), SinkError> {
        let ring = self.ring.as_ref().ok_or(SinkError::NotConfigured)?;
        let mut offset = 0;
        while offset < pcm.len() {
            let pushed = ring.push(&pcm[offset..]);
            offset += pushed;
            if pushed == 0 {
                thread::sleep(WRITE_RETRY);
            }
        }
        Ok(())
    }

    fn drain(&mut self) {
        let Some(ring) = &self.ring else {
            return;
        };
        let begin = Instant::now();
        while ring.count() > 0 && begin.elapsed() < DRAIN_LIMIT {
            thread::sleep(WRITE_RETRY);
        }
    }

    fn pause(&mut self) {
        self.is_playing.store(false, Ordering::Relaxed);
        if let Some(stream) = &self.stream {
            if let Err(e) = stream.pause() {
                log::warn!("[sink] failed to pause stream: {}", e);
            }
        }
    }

    fn resume(&mut self) {
        self.is_playing.store(true, Ordering::Relaxed);
        if let Some(stream) = &self.stream {
            if let Err(e) = stream.play() {
                log::warn!("[sink] failed to resume stream: {}", e);
            }
        }
    }

    fn close(&mut self) {
        self.is_playing.store(false, Ordering::Relaxed);
        self.stream = None;
        self.ring = None;
    }
}
