// Decoder worker: pulls compressed input, runs the codec, fills the PCM ring

use crate::codec::{FrameDecoder, FrameError, FrameInfo};
use chime_core::{AudioError, DecodeConfig, EventGroup, Events};
use chime_ringbuffer::SharedRingBuffer;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;

pub(crate) const START: Events = Events::bit(0);
pub(crate) const STOP: Events = Events::bit(1);
pub(crate) const PAUSE: Events = Events::bit(2);
pub(crate) const RESUME: Events = Events::bit(3);
pub(crate) const EXIT: Events = Events::bit(4);
pub(crate) const STARTED: Events = Events::bit(5);
pub(crate) const STOPPED: Events = Events::bit(6);
pub(crate) const PAUSED: Events = Events::bit(7);
/// First frame decoded, format known
pub(crate) const READY: Events = Events::bit(8);
/// Decoding gave up; see `DecodeStatus::error`
pub(crate) const ABORT: Events = Events::bit(9);
pub(crate) const EXITED: Events = Events::bit(10);
/// The input has bytes again after a `Pulled::Pending`
pub(crate) const INPUT: Events = Events::bit(11);

const OUTPUT_RETRY: Duration = Duration::from_millis(20);

/// Result of one input pull
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Pulled {
    /// `len` bytes were copied; `last` marks the end of the input
    Data { len: usize, last: bool },
    /// Nothing available right now. The decoder parks until
    /// `DecodeSupervisor::input_ready` or a resume wakes it.
    Pending,
    /// The input broke; no more data will come
    Failed,
}

/// Compressed byte source feeding the decoder.
pub trait DecoderInput: Send + Sync {
    fn pull(&self, buf: &mut [u8]) -> Pulled;

    /// Continue reading at absolute `offset`. Inputs that cannot seek
    /// return false and the decoder discards bytes instead.
    fn seek(&self, _offset: u64) -> bool {
        false
    }

    /// Called at most once per run when decoding fails for good.
    fn on_error(&self, err: AudioError);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecoderState {
    Idle,
    Running,
    /// PCM ring full, waiting for the sink to drain it
    Waiting,
    Paused,
    /// Input exhausted or decoding aborted
    Done,
    Exited,
}

pub(crate) struct DecodeStatus {
    pub state: DecoderState,
    pub format: Option<FrameInfo>,
    /// Cleared while the supervisor holds output paused
    pub output_enabled: bool,
    /// No more PCM will be pushed this run
    pub output_done: bool,
    pub produced: u64,
    pub played: u64,
    pub tag_size: u64,
    pub frames: u64,
    pub error: Option<AudioError>,
}

impl DecodeStatus {
    pub fn new() -> Self {
        Self {
            state: DecoderState::Idle,
            format: None,
            output_enabled: true,
            output_done: false,
            produced: 0,
            played: 0,
            tag_size: 0,
            frames: 0,
            error: None,
        }
    }

    pub fn reset(&mut self) {
        *self = Self {
            state: self.state,
            ..Self::new()
        };
    }
}

pub(crate) struct DecodeShared {
    pub events: EventGroup,
    pub status: Mutex<DecodeStatus>,
    pub ring: SharedRingBuffer,
    pub input: Mutex<Option<Arc<dyn DecoderInput>>>,
}

/// Per-run bookkeeping
struct Run {
    input: Arc<dyn DecoderInput>,
    /// Unconsumed input is `scratch[start..end]`
    start: usize,
    end: usize,
    input_offset: u64,
    input_done: bool,
    input_pending: bool,
    /// Tag bytes still to drop as they arrive
    discard: u64,
    probed: bool,
    pcm: Vec<u8>,
    pcm_pos: usize,
    errors: u32,
    reported: bool,
}

pub(crate) struct Worker {
    shared: Arc<DecodeShared>,
    codec: Box<dyn FrameDecoder>,
    config: DecodeConfig,
    scratch: Vec<u8>,
    run: Option<Run>,
}

impl Worker {
    pub fn new(shared: Arc<DecodeShared>, codec: Box<dyn FrameDecoder>, config: DecodeConfig) -> Self {
        Self {
            shared,
            codec,
            scratch: vec![0u8; config.scratch_size.max(64)],
            config,
            run: None,
        }
    }

    pub fn run(mut self) {
        let mut state = DecoderState::Idle;
        loop {
            self.publish_state(state);
            state = match state {
                DecoderState::Idle => self.idle(),
                DecoderState::Running => self.running(),
                DecoderState::Waiting => self.waiting(),
                DecoderState::Paused => self.paused(),
                DecoderState::Done => self.done(),
                DecoderState::Exited => break,
            };
        }

        self.publish_state(DecoderState::Exited);
        self.shared.events.signal(EXITED);
        log::debug!("[decoder] worker exited");
    }

    fn publish_state(&self, state: DecoderState) {
        let mut status = self.shared.status.lock();
        if status.state != state {
            log::debug!("[decoder] {:?} -> {:?}", status.state, state);
            status.state = state;
        }
    }

    fn end_run(&mut self) {
        self.run = None;
        self.codec.reset();
        self.publish_state(DecoderState::Idle);
        self.shared.events.signal(STOPPED);
    }

    /// Stop, pause and exit requests, checked between decode steps.
    fn control(&mut self) -> Option<DecoderState> {
        let events = self
            .shared
            .events
            .wait(STOP | PAUSE | EXIT, Some(Duration::ZERO));
        if events.contains(EXIT) {
            self.end_run();
            Some(DecoderState::Exited)
        } else if events.contains(STOP) {
            self.end_run();
            Some(DecoderState::Idle)
        } else if events.contains(PAUSE) {
            self.shared.events.clear(RESUME);
            self.publish_state(DecoderState::Paused);
            self.shared.events.signal(PAUSED);
            Some(DecoderState::Paused)
        } else {
            None
        }
    }

    fn idle(&mut self) -> DecoderState {
        let events = self.shared.events.wait(START | EXIT, None);
        if events.contains(EXIT) {
            return DecoderState::Exited;
        }

        let input = self.shared.input.lock().take();
        let next = match input {
            Some(input) => {
                self.codec.reset();
                self.run = Some(Run {
                    input,
                    start: 0,
                    end: 0,
                    input_offset: 0,
                    input_done: false,
                    input_pending: false,
                    discard: 0,
                    probed: false,
                    pcm: Vec::new(),
                    pcm_pos: 0,
                    errors: 0,
                    reported: false,
                });
                DecoderState::Running
            }
            None => {
                log::warn!("[decoder] start without input");
                DecoderState::Idle
            }
        };
        self.shared.events.signal(STARTED);
        next
    }

    fn waiting(&mut self) -> DecoderState {
        if let Some(next) = self.control() {
            return next;
        }
        self.shared
            .events
            .watch(RESUME | STOP | PAUSE | EXIT, Some(OUTPUT_RETRY));
        self.shared.events.clear(RESUME);
        DecoderState::Running
    }

    fn paused(&mut self) -> DecoderState {
        let events = self.shared.events.wait(RESUME | STOP | EXIT, None);
        if events.contains(EXIT) {
            self.end_run();
            DecoderState::Exited
        } else if events.contains(STOP) {
            self.end_run();
            DecoderState::Idle
        } else if !self.shared.status.lock().output_enabled {
            // A late pull from the sink, not a resume request
            DecoderState::Paused
        } else {
            DecoderState::Running
        }
    }

    fn done(&mut self) -> DecoderState {
        let events = self.shared.events.wait(STOP | PAUSE | EXIT, None);
        if events.contains(EXIT) {
            self.end_run();
            DecoderState::Exited
        } else if events.contains(STOP) {
            self.end_run();
            DecoderState::Idle
        } else {
            // Nothing left to pause; acknowledge so the caller does not wait.
            self.shared.events.signal(PAUSED);
            DecoderState::Done
        }
    }

    fn running(&mut self) -> DecoderState {
        if let Some(next) = self.control() {
            return next;
        }
        let Some(run) = self.run.as_mut() else {
            return DecoderState::Done;
        };

        // Hand over PCM left from the previous frame first.
        if run.pcm_pos < run.pcm.len() {
            let pushed = self.shared.ring.push(&run.pcm[run.pcm_pos..]);
            run.pcm_pos += pushed;
            self.shared.status.lock().produced += pushed as u64;
            if run.pcm_pos < run.pcm.len() {
                return DecoderState::Waiting;
            }
            run.pcm.clear();
            run.pcm_pos = 0;
        }

        self.fill();
        self.decode_step()
    }

    /// Top up the scratch buffer from the input.
    fn fill(&mut self) {
        let Some(run) = self.run.as_mut() else {
            return;
        };
        run.input_pending = false;
        if run.input_done {
            return;
        }

        if run.start > 0 {
            self.scratch.copy_within(run.start..run.end, 0);
            run.end -= run.start;
            run.start = 0;
        }
        if run.end == self.scratch.len() {
            return;
        }

        // Cleared before the pull so a wake-up racing it is kept
        self.shared.events.clear(INPUT);
        match run.input.pull(&mut self.scratch[run.end..]) {
            Pulled::Data { len, last } => {
                run.input_offset += len as u64;
                let mut len = len;
                if run.discard > 0 {
                    let dropped = (run.discard.min(len as u64)) as usize;
                    self.scratch
                        .copy_within(run.end + dropped..run.end + len, run.end);
                    len -= dropped;
                    run.discard -= dropped as u64;
                }
                run.end += len;
                if last {
                    log::debug!("[decoder] input ended at {}", run.input_offset);
                    run.input_done = true;
                }
            }
            Pulled::Pending => run.input_pending = true,
            Pulled::Failed => {
                log::warn!("[decoder] input failed at {}", run.input_offset);
                run.input_done = true;
            }
        }
    }

    /// Skip an ID3v2 tag at the start of the stream.
    fn probe_tag(&mut self) -> bool {
        let Some(run) = self.run.as_mut() else {
            return false;
        };
        let available = run.end - run.start;
        if available < 10 && !run.input_done {
            return false;
        }
        run.probed = true;

        let Some(size) = self.codec.probe_tag_size(&self.scratch[run.start..run.end]) else {
            return true;
        };
        log::info!("[decoder] skipping {} byte tag", size);
        self.shared.status.lock().tag_size = size as u64;

        if size <= available {
            run.start += size;
        } else if run.input.seek(size as u64) {
            run.start = 0;
            run.end = 0;
            run.input_offset = size as u64;
        } else {
            run.discard = (size - available) as u64;
            run.start = 0;
            run.end = 0;
        }
        true
    }

    fn decode_step(&mut self) -> DecoderState {
        if !self.run.as_ref().map_or(false, |run| run.probed) && !self.probe_tag() {
            return self.wait_input();
        }
        let Some(run) = self.run.as_mut() else {
            return DecoderState::Done;
        };

        if run.start == run.end {
            return if run.input_done {
                self.end_of_stream()
            } else {
                self.wait_input()
            };
        }

        let result = self.codec.decode_frame(&self.scratch[run.start..run.end]);
        let available = run.end - run.start;
        match result {
            Ok(frame) => {
                run.start += frame.consumed.min(available);
                run.errors = 0;
                run.pcm = frame.pcm.iter().flat_map(|s| s.to_le_bytes()).collect();
                run.pcm_pos = 0;

                let mut status = self.shared.status.lock();
                status.frames += 1;
                if status.format.is_none() {
                    log::info!(
                        "[decoder] {} Hz, {} ch, {} bps",
                        frame.info.sample_rate,
                        frame.info.channels,
                        frame.info.bit_rate
                    );
                    status.format = Some(frame.info);
                    drop(status);
                    self.shared.events.signal(READY);
                }
                DecoderState::Running
            }
            Err(FrameError::NeedMoreData) => {
                if run.input_done {
                    if available > 0 {
                        log::debug!("[decoder] dropping {} trailing bytes", available);
                    }
                    run.start = run.end;
                    self.end_of_stream()
                } else if available == self.scratch.len() {
                    // Claimed frame does not fit the scratch buffer.
                    self.frame_error(1, "frame larger than input buffer".to_string())
                } else {
                    self.wait_input()
                }
            }
            Err(FrameError::Recoverable { consumed, reason }) => self.frame_error(consumed, reason),
            Err(FrameError::LostSync { consumed }) => {
                let reason = format!("lost sync, {} bytes skipped", consumed);
                self.frame_error(consumed, reason)
            }
            Err(FrameError::Fatal(reason)) => self.abort(AudioError::UnsupportedFormat(reason)),
        }
    }

    fn frame_error(&mut self, consumed: usize, reason: String) -> DecoderState {
        let max_errors = self.config.max_errors;
        let Some(run) = self.run.as_mut() else {
            return DecoderState::Done;
        };
        run.start += consumed.max(1).min(run.end - run.start);
        run.errors += 1;
        log::warn!("[decoder] error {}/{}: {}", run.errors, max_errors, reason);

        if run.errors >= max_errors {
            let errors = run.errors;
            return self.abort(AudioError::UnsupportedFormat(format!(
                "{} consecutive decode errors",
                errors
            )));
        }
        DecoderState::Running
    }

    /// Park while the input has nothing for us.
    fn wait_input(&mut self) -> DecoderState {
        if self.run.as_ref().map_or(false, |run| run.input_pending) {
            self.shared.events.watch(
                INPUT | STOP | PAUSE | EXIT,
                Some(self.config.control_timeout),
            );
        }
        DecoderState::Running
    }

    fn end_of_stream(&mut self) -> DecoderState {
        let frames = self.shared.status.lock().frames;
        if frames == 0 {
            return self.abort(AudioError::UnsupportedFormat(
                "input ended without a decodable frame".to_string(),
            ));
        }
        log::info!("[decoder] end of stream after {} frames", frames);
        self.shared.status.lock().output_done = true;
        DecoderState::Done
    }

    fn abort(&mut self, err: AudioError) -> DecoderState {
        log::error!("[decoder] {}", err);
        if let Some(run) = self.run.as_mut() {
            run.input_done = true;
            if !run.reported {
                run.reported = true;
                run.input.on_error(err.clone());
            }
        }
        {
            let mut status = self.shared.status.lock();
            status.error = Some(err);
            status.output_done = true;
        }
        self.shared.events.signal(ABORT);
        DecoderState::Done
    }
}
