// Scripted collaborators shared by the session and manager tests

use chime_core::{SessionCallback, SessionEvent};
use chime_decode::{DecodedFrame, FrameDecoder, FrameError, FrameInfo};
use chime_renderer_api::{AudioSink, Capture, CaptureWriter, NullWriter, ThreadSink};
use chime_transport_http::{HttpClient, HttpError, Request, Response, ResponseHead};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::{Duration, Instant};

pub const FRAME: usize = 100;
/// 200 ms of 8 kHz mono per frame
pub const SAMPLES: usize = 1600;
pub const INFO: FrameInfo = FrameInfo {
    sample_rate: 8000,
    channels: 1,
    bit_rate: 4000,
};

/// Frames are `0xAA, index, ..` padded to 100 bytes
pub struct ToneCodec;

impl FrameDecoder for ToneCodec {
    fn decode_frame(&mut self, input: &[u8]) -> Result<DecodedFrame, FrameError> {
        match input.first() {
            None => Err(FrameError::NeedMoreData),
            Some(0xAA) if input.len() < FRAME => Err(FrameError::NeedMoreData),
            Some(0xAA) => Ok(DecodedFrame {
                consumed: FRAME,
                pcm: vec![input[1] as i16; SAMPLES],
                info: INFO,
            }),
            Some(_) => Err(FrameError::LostSync {
                consumed: input.iter().position(|b| *b == 0xAA).unwrap_or(input.len()),
            }),
        }
    }

    fn probe_tag_size(&self, _input: &[u8]) -> Option<usize> {
        None
    }

    fn reset(&mut self) {}
}

pub fn tone_clip(frames: usize) -> Vec<u8> {
    let mut data = Vec::with_capacity(frames * FRAME);
    for i in 0..frames {
        let mut frame = vec![0u8; FRAME];
        frame[0] = 0xAA;
        frame[1] = i as u8;
        data.extend_from_slice(&frame);
    }
    data
}

/// Sink that records PCM as fast as it is produced
pub fn capture_sink() -> (Arc<dyn AudioSink>, Arc<Mutex<Capture>>) {
    let writer = CaptureWriter::new();
    let capture = writer.capture();
    let sink = ThreadSink::new(move || writer).unwrap();
    (Arc::new(sink), capture)
}

/// Sink consuming PCM in real time
pub fn paced_sink() -> Arc<dyn AudioSink> {
    Arc::new(ThreadSink::new(NullWriter::new).unwrap())
}

/// Serves one body with a plain 200 response, or never answers.
pub struct MemoryHttp {
    body: Arc<Vec<u8>>,
    stall: bool,
    url: Option<String>,
    head: Option<Arc<ResponseHead>>,
    pos: usize,
}

impl MemoryHttp {
    pub fn serving(body: Vec<u8>) -> Self {
        Self {
            body: Arc::new(body),
            stall: false,
            url: None,
            head: None,
            pos: 0,
        }
    }

    pub fn stalled() -> Self {
        Self {
            stall: true,
            ..Self::serving(Vec::new())
        }
    }
}

impl HttpClient for MemoryHttp {
    fn connect(&mut self, url: &str) -> Result<(), HttpError> {
        self.url = Some(url.to_string());
        Ok(())
    }

    fn send_request(&mut self, _request: &Request) -> Result<(), HttpError> {
        self.head = Some(Arc::new(ResponseHead {
            status: 200,
            content_length: Some(self.body.len() as u64),
            ..Default::default()
        }));
        self.pos = 0;
        Ok(())
    }

    fn receive_response(
        &mut self,
        buf: &mut [u8],
        _header_timeout: Duration,
    ) -> Result<Response, HttpError> {
        if self.stall {
            std::thread::sleep(Duration::from_millis(20));
            return Err(HttpError::Timeout);
        }
        let head = self.head.clone().ok_or(HttpError::NoResponse)?;
        let n = (self.body.len() - self.pos).min(buf.len());
        buf[..n].copy_from_slice(&self.body[self.pos..self.pos + n]);
        self.pos += n;
        Ok(Response {
            head,
            len: n,
            more: self.pos < self.body.len(),
        })
    }

    fn close(&mut self) {
        self.url = None;
        self.head = None;
    }
}

pub fn wait_until(timeout: Duration, mut check: impl FnMut() -> bool) -> bool {
    let begin = Instant::now();
    while begin.elapsed() < timeout {
        if check() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    check()
}

/// Collects the events of every session it is attached to
#[derive(Default)]
pub struct Recorder {
    pub events: Mutex<Vec<(String, SessionEvent)>>,
}

impl Recorder {
    /// Events other than progress, in order
    pub fn lifecycle(&self) -> Vec<SessionEvent> {
        self.events
            .lock()
            .iter()
            .filter(|(_, e)| !matches!(e, SessionEvent::Progress { .. }))
            .map(|(_, e)| e.clone())
            .collect()
    }
}

impl SessionCallback for Recorder {
    fn on_event(&self, session: &str, event: SessionEvent) {
        self.events.lock().push((session.to_string(), event));
    }
}
