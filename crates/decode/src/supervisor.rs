// Decode supervisor: owns the decoder worker, the PCM ring and the sink handshake

use crate::codec::{FrameDecoder, FrameInfo};
use crate::worker::{
    DecodeShared, DecodeStatus, DecoderInput, DecoderState, Worker, ABORT, EXIT, EXITED, INPUT,
    PAUSE, PAUSED, READY, RESUME, START, STARTED, STOP, STOPPED,
};
use chime_core::{AudioError, DecodeConfig, EventGroup, Progress, Result};
use chime_renderer_api::{AudioSink, PcmCallback, PcmFormat, Pull};
use chime_ringbuffer::SharedRingBuffer;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

/// Runs one decoder worker and feeds its PCM to an `AudioSink`.
pub struct DecodeSupervisor {
    shared: Arc<DecodeShared>,
    sink: Arc<dyn AudioSink>,
    config: DecodeConfig,
    control: Mutex<()>,
    /// The sink was told no more PCM is coming this run
    end_flagged: AtomicBool,
    worker: Option<JoinHandle<()>>,
}

impl DecodeSupervisor {
    pub fn new(
        codec: Box<dyn FrameDecoder>,
        sink: Arc<dyn AudioSink>,
        config: DecodeConfig,
    ) -> Result<Self> {
        let ring = SharedRingBuffer::new(config.ring_capacity)
            .map_err(|e| AudioError::InvalidParam(e.to_string()))?;
        let shared = Arc::new(DecodeShared {
            events: EventGroup::new(),
            status: Mutex::new(DecodeStatus::new()),
            ring,
            input: Mutex::new(None),
        });

        let worker = Worker::new(shared.clone(), codec, config);
        let handle = thread::Builder::new()
            .name("chime-decoder".into())
            .spawn(move || worker.run())?;

        Ok(Self {
            shared,
            sink,
            config,
            control: Mutex::new(()),
            end_flagged: AtomicBool::new(false),
            worker: Some(handle),
        })
    }

    /// Start decoding `input` and, once the first frame is out, the sink.
    pub fn start(&self, input: Arc<dyn DecoderInput>) -> Result<FrameInfo> {
        let _guard = self.control.lock();
        self.stop_locked();

        self.shared.status.lock().reset();
        self.shared.ring.clear();
        self.end_flagged.store(false, Ordering::Release);
        *self.shared.input.lock() = Some(input);
        self.shared
            .events
            .clear(STARTED | STOPPED | PAUSED | READY | ABORT | RESUME | PAUSE);
        self.shared.events.signal(START);

        if self
            .shared
            .events
            .wait(STARTED, Some(self.config.control_timeout))
            .is_empty()
        {
            return Err(AudioError::InvalidState(
                "decoder worker did not start".to_string(),
            ));
        }

        let events = self
            .shared
            .events
            .wait(READY | ABORT, Some(self.config.start_timeout));
        if !events.contains(READY) {
            let err = if events.contains(ABORT) {
                self.shared.status.lock().error.clone().unwrap_or_else(|| {
                    AudioError::UnsupportedFormat("decoder aborted".to_string())
                })
            } else {
                AudioError::NetworkTimeout(format!(
                    "no audio frame within {:?}",
                    self.config.start_timeout
                ))
            };
            log::warn!("[decoder] start failed: {}", err);
            self.stop_locked();
            return Err(err);
        }

        let info = self
            .shared
            .status
            .lock()
            .format
            .ok_or_else(|| AudioError::InvalidState("format missing after first frame".to_string()))?;

        let started = self
            .sink
            .configure(PcmFormat::new(info.sample_rate, info.channels))
            .and_then(|_| {
                self.sink.set_data_callback(Some(self.data_callback()));
                self.sink.start()
            });
        if let Err(err) = started {
            log::error!("[decoder] sink start failed: {}", err);
            self.stop_locked();
            return Err(err.into());
        }
        Ok(info)
    }

    /// Pull handler the sink runs on its own thread.
    fn data_callback(&self) -> PcmCallback {
        let shared = self.shared.clone();
        Box::new(move |buf: &mut [u8]| {
            let (output_done, output_enabled) = {
                let status = shared.status.lock();
                (status.output_done, status.output_enabled)
            };

            let len = shared.ring.pop(buf);
            if len == 0 {
                if output_done {
                    return Pull::Finished;
                }
                shared.events.signal(RESUME);
                return Pull::Starved;
            }

            shared.status.lock().played += len as u64;
            if !output_done && output_enabled {
                let (count, free) = shared.ring.levels();
                if free > count {
                    shared.events.signal(RESUME);
                }
            }
            Pull::Data(len)
        })
    }

    pub fn stop(&self) {
        let _guard = self.control.lock();
        self.stop_locked();
    }

    fn stop_locked(&self) {
        if let Err(err) = self.sink.stop() {
            log::warn!("[decoder] sink stop failed: {}", err);
        }
        self.sink.set_data_callback(None);

        if self.state() != DecoderState::Idle {
            self.shared.events.signal(STOP);
            if self
                .shared
                .events
                .wait(STOPPED, Some(self.config.control_timeout))
                .is_empty()
            {
                log::warn!("[decoder] stop timed out");
            }
        }
        self.shared.events.clear(START | STOP | PAUSE | RESUME | PAUSED);
        self.shared.ring.clear();
    }

    /// Hold the sink and the decoder; buffered PCM is kept.
    pub fn pause(&self) -> Result<()> {
        let _guard = self.control.lock();
        self.sink.pause()?;
        self.shared.status.lock().output_enabled = false;

        if !matches!(self.state(), DecoderState::Idle | DecoderState::Paused) {
            self.shared.events.signal(PAUSE);
            if self
                .shared
                .events
                .wait(PAUSED, Some(self.config.control_timeout))
                .is_empty()
            {
                log::warn!("[decoder] pause not acknowledged");
            }
        }
        Ok(())
    }

    pub fn resume(&self) -> Result<()> {
        let _guard = self.control.lock();
        self.shared.status.lock().output_enabled = true;
        self.shared.events.clear(PAUSE);
        self.shared.events.signal(RESUME | INPUT);
        self.sink.resume()?;
        Ok(())
    }

    /// Wake a decoder parked on an input that reported `Pulled::Pending`.
    pub fn input_ready(&self) {
        self.shared.events.signal(INPUT);
    }

    /// Kick the decoder when the sink starved while it sat on a full ring.
    pub fn auto_resume(&self) -> bool {
        let waiting = {
            let status = self.shared.status.lock();
            status.output_enabled && status.state == DecoderState::Waiting
        };
        if waiting && self.sink.is_starved() {
            log::debug!("[decoder] sink starved, waking decoder");
            self.shared.events.signal(RESUME);
            return true;
        }
        false
    }

    /// The sink played everything the decoder will ever produce.
    ///
    /// Once the decoder pushed its last PCM the sink is told no more data
    /// follows, so it drains and finishes on its next starved pull.
    pub fn is_done(&self) -> bool {
        if self.is_output_done() && !self.end_flagged.swap(true, Ordering::AcqRel) {
            log::debug!("[decoder] output complete, flagging sink");
            self.sink.set_no_more_data();
        }
        self.sink.is_done()
    }

    /// The decoder has pushed its last PCM (or gave up)
    pub fn is_output_done(&self) -> bool {
        self.shared.status.lock().output_done
    }

    pub fn state(&self) -> DecoderState {
        self.shared.status.lock().state
    }

    pub fn format(&self) -> Option<FrameInfo> {
        self.shared.status.lock().format
    }

    pub fn last_error(&self) -> Option<AudioError> {
        self.shared.status.lock().error.clone()
    }

    pub fn frames(&self) -> u64 {
        self.shared.status.lock().frames
    }

    /// Bytes of PCM pushed to the ring this run
    pub fn produced(&self) -> u64 {
        self.shared.status.lock().produced
    }

    /// Elapsed from PCM the sink pulled; total estimated from the input
    /// length and the stream bit rate.
    pub fn progress(&self, total_input_len: Option<u64>) -> Progress {
        let status = self.shared.status.lock();
        let Some(info) = status.format else {
            return Progress::default();
        };

        let bytes_per_second = info.sample_rate as u64 * info.channels as u64 * 2;
        let elapsed_secs = if bytes_per_second > 0 {
            status.played / bytes_per_second
        } else {
            0
        };
        let total_secs = match total_input_len {
            Some(len) if info.bit_rate > 0 => {
                len.saturating_sub(status.tag_size) * 8 / info.bit_rate as u64
            }
            _ => 0,
        };

        Progress {
            elapsed_secs: elapsed_secs as u32,
            total_secs: total_secs as u32,
        }
    }
}

impl Drop for DecodeSupervisor {
    fn drop(&mut self) {
        self.stop();
        self.shared.events.signal(EXIT);
        if self
            .shared
            .events
            .wait(EXITED, Some(self.config.control_timeout))
            .is_empty()
        {
            log::warn!("[decoder] exit timed out, detaching worker");
            return;
        }
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{DecodedFrame, FrameError};
    use crate::worker::Pulled;
    use chime_renderer_api::{CaptureWriter, SinkError, ThreadSink};
    use std::sync::atomic::AtomicUsize;
    use std::time::{Duration, Instant};

    /// Passes everything to a `ThreadSink`, counting end-of-data flags
    struct CountingSink {
        inner: ThreadSink,
        end_flags: AtomicUsize,
    }

    impl AudioSink for CountingSink {
        fn configure(&self, format: PcmFormat) -> std::result::Result<(), SinkError> {
            self.inner.configure(format)
        }

        fn set_data_callback(&self, callback: Option<PcmCallback>) {
            self.inner.set_data_callback(callback)
        }

        fn start(&self) -> std::result::Result<(), SinkError> {
            self.inner.start()
        }

        fn pause(&self) -> std::result::Result<(), SinkError> {
            self.inner.pause()
        }

        fn resume(&self) -> std::result::Result<(), SinkError> {
            self.inner.resume()
        }

        fn stop(&self) -> std::result::Result<(), SinkError> {
            self.inner.stop()
        }

        fn set_no_more_data(&self) {
            self.end_flags.fetch_add(1, Ordering::SeqCst);
            self.inner.set_no_more_data()
        }

        fn is_done(&self) -> bool {
            self.inner.is_done()
        }

        fn is_starved(&self) -> bool {
            self.inner.is_starved()
        }
    }

    const FRAME: usize = 100;
    const INFO: FrameInfo = FrameInfo {
        sample_rate: 8000,
        channels: 1,
        bit_rate: 800,
    };
    /// One second of mono PCM per frame
    const SAMPLES: usize = 8000;

    /// Frames are `0xAA, index, ..` padded to 100 bytes; `0xEE` marks a
    /// corrupt frame; `TG` + big-endian u16 is a tag.
    struct BlockCodec;

    impl FrameDecoder for BlockCodec {
        fn decode_frame(&mut self, input: &[u8]) -> std::result::Result<DecodedFrame, FrameError> {
            match input.first() {
                None => Err(FrameError::NeedMoreData),
                Some(0xAA) if input.len() < FRAME => Err(FrameError::NeedMoreData),
                Some(0xAA) => Ok(DecodedFrame {
                    consumed: FRAME,
                    pcm: vec![input[1] as i16; SAMPLES],
                    info: INFO,
                }),
                Some(0xEE) => Err(FrameError::Recoverable {
                    consumed: FRAME.min(input.len()),
                    reason: "corrupt".to_string(),
                }),
                Some(_) => Err(FrameError::LostSync {
                    consumed: input.iter().position(|b| *b == 0xAA).unwrap_or(input.len()),
                }),
            }
        }

        fn probe_tag_size(&self, input: &[u8]) -> Option<usize> {
            if input.len() >= 4 && input.starts_with(b"TG") {
                Some(u16::from_be_bytes([input[2], input[3]]) as usize)
            } else {
                None
            }
        }

        fn reset(&mut self) {}
    }

    struct MemoryInput {
        data: Vec<u8>,
        pos: Mutex<usize>,
        chunk: usize,
        seekable: bool,
        seeks: Mutex<Vec<u64>>,
        errors: Mutex<Vec<AudioError>>,
    }

    impl MemoryInput {
        fn new(data: Vec<u8>) -> Arc<Self> {
            Self::with(data, false)
        }

        fn with(data: Vec<u8>, seekable: bool) -> Arc<Self> {
            Arc::new(Self {
                data,
                pos: Mutex::new(0),
                chunk: 37,
                seekable,
                seeks: Mutex::new(Vec::new()),
                errors: Mutex::new(Vec::new()),
            })
        }
    }

    impl DecoderInput for MemoryInput {
        fn pull(&self, buf: &mut [u8]) -> Pulled {
            let mut pos = self.pos.lock();
            let len = buf.len().min(self.chunk).min(self.data.len() - *pos);
            buf[..len].copy_from_slice(&self.data[*pos..*pos + len]);
            *pos += len;
            Pulled::Data {
                len,
                last: *pos == self.data.len(),
            }
        }

        fn seek(&self, offset: u64) -> bool {
            if !self.seekable {
                return false;
            }
            self.seeks.lock().push(offset);
            *self.pos.lock() = (offset as usize).min(self.data.len());
            true
        }

        fn on_error(&self, err: AudioError) {
            self.errors.lock().push(err);
        }
    }

    fn frames(count: u8) -> Vec<u8> {
        let mut data = Vec::new();
        for index in 0..count {
            let mut frame = vec![0u8; FRAME];
            frame[0] = 0xAA;
            frame[1] = index + 1;
            data.extend_from_slice(&frame);
        }
        data
    }

    fn test_config() -> DecodeConfig {
        DecodeConfig {
            scratch_size: 1024,
            start_timeout: Duration::from_secs(5),
            control_timeout: Duration::from_secs(5),
            ..Default::default()
        }
    }

    fn supervisor(writer: CaptureWriter) -> DecodeSupervisor {
        let sink = Arc::new(ThreadSink::new(move || writer).unwrap());
        DecodeSupervisor::new(Box::new(BlockCodec), sink, test_config()).unwrap()
    }

    fn wait_until(mut check: impl FnMut() -> bool) -> bool {
        let begin = Instant::now();
        while begin.elapsed() < Duration::from_secs(10) {
            if check() {
                return true;
            }
            std::thread::sleep(Duration::from_millis(2));
        }
        false
    }

    #[test]
    fn test_end_of_stream_after_all_frames_drained() {
        let writer = CaptureWriter::with_delay(Duration::from_millis(5));
        let capture = writer.capture();
        let decoder = supervisor(writer);
        let input = MemoryInput::new(frames(5));

        let info = decoder.start(input.clone()).unwrap();
        assert_eq!(info, INFO);

        assert!(wait_until(|| decoder.is_done()));
        assert_eq!(decoder.frames(), 5);
        assert_eq!(decoder.produced(), (5 * SAMPLES * 2) as u64);
        assert!(decoder.is_output_done());

        let capture = capture.lock();
        assert_eq!(capture.pcm.len(), 5 * SAMPLES * 2);
        // frame order survives the ring
        for (index, block) in capture.pcm.chunks(SAMPLES * 2).enumerate() {
            let value = i16::from_le_bytes([block[0], block[1]]);
            assert_eq!(value, index as i16 + 1);
        }
        assert!(input.errors.lock().is_empty());
    }

    #[test]
    fn test_sink_flagged_once_output_complete() {
        let writer = CaptureWriter::new();
        let sink = Arc::new(CountingSink {
            inner: ThreadSink::new(move || writer).unwrap(),
            end_flags: AtomicUsize::new(0),
        });
        let decoder =
            DecodeSupervisor::new(Box::new(BlockCodec), sink.clone(), test_config()).unwrap();

        decoder.start(MemoryInput::new(frames(3))).unwrap();
        assert!(wait_until(|| decoder.is_done()));
        assert!(decoder.is_done());
        assert_eq!(sink.end_flags.load(Ordering::SeqCst), 1);

        // a new run flags the sink again
        decoder.start(MemoryInput::new(frames(1))).unwrap();
        assert!(wait_until(|| decoder.is_done()));
        assert_eq!(sink.end_flags.load(Ordering::SeqCst), 2);
    }

    /// Reports `Pending` until opened
    struct GatedInput {
        inner: Arc<MemoryInput>,
        open: AtomicBool,
        pending_pulls: AtomicUsize,
    }

    impl DecoderInput for GatedInput {
        fn pull(&self, buf: &mut [u8]) -> Pulled {
            if !self.open.load(Ordering::SeqCst) {
                self.pending_pulls.fetch_add(1, Ordering::SeqCst);
                return Pulled::Pending;
            }
            self.inner.pull(buf)
        }

        fn on_error(&self, err: AudioError) {
            self.inner.on_error(err)
        }
    }

    #[test]
    fn test_pending_input_parks_until_ready() {
        let decoder = supervisor(CaptureWriter::new());
        let input = Arc::new(GatedInput {
            inner: MemoryInput::new(frames(2)),
            open: AtomicBool::new(false),
            pending_pulls: AtomicUsize::new(0),
        });

        let begin = Instant::now();
        std::thread::scope(|scope| {
            let opener = scope.spawn(|| {
                std::thread::sleep(Duration::from_millis(300));
                input.open.store(true, Ordering::SeqCst);
                decoder.input_ready();
            });
            decoder.start(input.clone()).unwrap();
            opener.join().unwrap();
        });

        // woken by the signal, not by the 5 s control timeout
        assert!(begin.elapsed() < Duration::from_secs(3));
        // parked rather than spinning while the gate was shut
        assert!(input.pending_pulls.load(Ordering::SeqCst) <= 2);
        assert!(wait_until(|| decoder.is_done()));
        assert_eq!(decoder.frames(), 2);
    }

    #[test]
    fn test_progress_from_played_pcm() {
        let decoder = supervisor(CaptureWriter::new());
        let data = frames(3);
        let len = data.len() as u64;

        decoder.start(MemoryInput::new(data)).unwrap();
        assert!(wait_until(|| decoder.is_done()));

        let progress = decoder.progress(Some(len));
        assert_eq!(progress.elapsed_secs, 3);
        assert_eq!(progress.total_secs, 3);
        assert_eq!(decoder.progress(None).total_secs, 0);
    }

    #[test]
    fn test_long_tag_skipped_by_seek() {
        let mut data = b"TG\x0b\xb8".to_vec();
        data.resize(3000, 0x55);
        data.extend(frames(2));

        let decoder = supervisor(CaptureWriter::new());
        let input = MemoryInput::with(data, true);
        decoder.start(input.clone()).unwrap();
        assert!(wait_until(|| decoder.is_done()));

        assert_eq!(*input.seeks.lock(), vec![3000]);
        assert_eq!(decoder.frames(), 2);
        assert_eq!(decoder.progress(Some(3200)).total_secs, 2);
    }

    #[test]
    fn test_long_tag_discarded_without_seek() {
        let mut data = b"TG\x0b\xb8".to_vec();
        data.resize(3000, 0x55);
        data.extend(frames(2));

        let decoder = supervisor(CaptureWriter::new());
        let input = MemoryInput::new(data);
        decoder.start(input.clone()).unwrap();
        assert!(wait_until(|| decoder.is_done()));

        assert!(input.seeks.lock().is_empty());
        assert_eq!(decoder.frames(), 2);
        assert!(input.errors.lock().is_empty());
    }

    #[test]
    fn test_corrupt_stream_aborts_once() {
        let mut data = Vec::new();
        for _ in 0..30 {
            let mut frame = vec![0u8; FRAME];
            frame[0] = 0xEE;
            data.extend_from_slice(&frame);
        }

        let decoder = supervisor(CaptureWriter::new());
        let input = MemoryInput::new(data);
        let err = decoder.start(input.clone()).unwrap_err();

        assert!(matches!(err, AudioError::UnsupportedFormat(_)));
        assert_eq!(input.errors.lock().len(), 1);
        assert_eq!(decoder.frames(), 0);
    }

    #[test]
    fn test_empty_input_reported() {
        let decoder = supervisor(CaptureWriter::new());
        let input = MemoryInput::new(Vec::new());

        assert!(decoder.start(input.clone()).is_err());
        assert_eq!(input.errors.lock().len(), 1);
    }

    #[test]
    fn test_pause_holds_output() {
        let writer = CaptureWriter::with_delay(Duration::from_millis(20));
        let capture = writer.capture();
        let decoder = supervisor(writer);

        decoder.start(MemoryInput::new(frames(40))).unwrap();
        assert!(wait_until(|| capture.lock().writes > 0));

        decoder.pause().unwrap();
        assert_eq!(decoder.state(), DecoderState::Paused);
        std::thread::sleep(Duration::from_millis(60));
        let held = (capture.lock().pcm.len(), decoder.produced());
        std::thread::sleep(Duration::from_millis(60));
        assert_eq!((capture.lock().pcm.len(), decoder.produced()), held);

        decoder.resume().unwrap();
        assert!(wait_until(|| capture.lock().pcm.len() > held.0));

        decoder.stop();
        assert_eq!(decoder.state(), DecoderState::Idle);
        assert!(!decoder.is_done());
    }

    #[test]
    fn test_restart_replaces_stream() {
        let writer = CaptureWriter::new();
        let capture = writer.capture();
        let decoder = supervisor(writer);

        decoder.start(MemoryInput::new(frames(40))).unwrap();
        decoder.start(MemoryInput::new(frames(1))).unwrap();
        assert!(wait_until(|| decoder.is_done()));

        assert_eq!(decoder.frames(), 1);
        let capture = capture.lock();
        let tail = &capture.pcm[capture.pcm.len() - 2..];
        assert_eq!(i16::from_le_bytes([tail[0], tail[1]]), 1);
    }
}
