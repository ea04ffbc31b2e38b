// Sink that pulls PCM on a dedicated thread and hands it to a PcmWriter

use crate::writer::PcmWriter;
use crate::{AudioSink, PcmCallback, PcmFormat, Pull, SinkError};
use parking_lot::{Condvar, Mutex, MutexGuard};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

const PULL_SIZE: usize = 16 * 1024;
const STARVED_RETRY: Duration = Duration::from_millis(5);
const CONTROL_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Stopped,
    Running,
    Paused,
}

struct SinkState {
    format: Option<PcmFormat>,
    callback: Option<PcmCallback>,
    /// Bumped by every `set_data_callback`, so a pull in flight does not
    /// reinstall a callback that was replaced meanwhile.
    callback_gen: u64,
    phase: Phase,
    opened: bool,
    open_request: bool,
    open_result: Option<Result<(), SinkError>>,
    close_request: bool,
    writer_paused: bool,
    no_more_data: bool,
    done: bool,
    starved: bool,
    exit: bool,
}

struct Shared {
    state: Mutex<SinkState>,
    changed: Condvar,
}

impl Shared {
    fn wait_until(
        &self,
        guard: &mut MutexGuard<'_, SinkState>,
        mut ready: impl FnMut(&SinkState) -> bool,
    ) -> bool {
        let deadline = Instant::now() + CONTROL_TIMEOUT;
        while !ready(&**guard) {
            if self.changed.wait_until(guard, deadline).timed_out() {
                return ready(&**guard);
            }
        }
        true
    }
}

/// `AudioSink` running its pull loop on a worker thread
pub struct ThreadSink {
    shared: Arc<Shared>,
    worker: Option<JoinHandle<()>>,
}

impl ThreadSink {
    /// Spawn the sink thread; `make_writer` runs on it.
    pub fn new<W, F>(make_writer: F) -> std::io::Result<Self>
    where
        W: PcmWriter,
        F: FnOnce() -> W + Send + 'static,
    {
        let shared = Arc::new(Shared {
            state: Mutex::new(SinkState {
                format: None,
                callback: None,
                callback_gen: 0,
                phase: Phase::Stopped,
                opened: false,
                open_request: false,
                open_result: None,
                close_request: false,
                writer_paused: false,
                no_more_data: false,
                done: false,
                starved: false,
                exit: false,
            }),
            changed: Condvar::new(),
        });

        let worker_shared = shared.clone();
        let worker = thread::Builder::new()
            .name("chime-sink".into())
            .spawn(move || {
                let writer = make_writer();
                run(worker_shared, writer);
            })?;

        Ok(Self {
            shared,
            worker: Some(worker),
        })
    }
}

fn run<W: PcmWriter>(shared: Arc<Shared>, mut writer: W) {
    let mut chunk = vec![0u8; PULL_SIZE];
    let mut state = shared.state.lock();

    loop {
        if state.exit {
            break;
        }

        if state.close_request {
            state.close_request = false;
            if state.opened {
                MutexGuard::unlocked(&mut state, || writer.close());
                state.opened = false;
                log::debug!("[sink] closed");
            }
            shared.changed.notify_all();
            continue;
        }

        if state.open_request {
            state.open_request = false;
            let result = match state.format {
                Some(format) => MutexGuard::unlocked(&mut state, || writer.open(format)),
                None => Err(SinkError::NotConfigured),
            };
            if let Err(err) = &result {
                log::error!("[sink] open failed: {}", err);
            }
            state.opened = result.is_ok();
            state.writer_paused = false;
            state.open_result = Some(result);
            shared.changed.notify_all();
            continue;
        }

        let want_paused = state.phase == Phase::Paused;
        if state.opened && want_paused != state.writer_paused {
            state.writer_paused = want_paused;
            if want_paused {
                MutexGuard::unlocked(&mut state, || writer.pause());
            } else {
                MutexGuard::unlocked(&mut state, || writer.resume());
            }
            continue;
        }

        if !state.opened || state.phase != Phase::Running || state.done {
            shared.changed.wait(&mut state);
            continue;
        }

        let Some(mut callback) = state.callback.take() else {
            state.starved = true;
            shared.changed.wait_for(&mut state, STARVED_RETRY);
            continue;
        };
        let generation = state.callback_gen;
        let pull = MutexGuard::unlocked(&mut state, || callback(&mut chunk));
        if state.callback_gen == generation {
            state.callback = Some(callback);
        }

        match pull {
            Pull::Data(len) if len > 0 => {
                state.starved = false;
                let len = len.min(chunk.len());
                let result = MutexGuard::unlocked(&mut state, || writer.write(&chunk[..len]));
                if let Err(err) = result {
                    log::error!("[sink] write failed: {}", err);
                    state.done = true;
                    shared.changed.notify_all();
                }
            }
            Pull::Data(_) | Pull::Starved => {
                state.starved = true;
                if state.no_more_data {
                    finish(&shared, &mut state, &mut writer);
                } else {
                    shared.changed.wait_for(&mut state, STARVED_RETRY);
                }
            }
            Pull::Finished => finish(&shared, &mut state, &mut writer),
        }
    }

    if state.opened {
        MutexGuard::unlocked(&mut state, || writer.close());
        state.opened = false;
    }
    log::debug!("[sink] thread exited");
}

fn finish<W: PcmWriter>(shared: &Shared, state: &mut MutexGuard<'_, SinkState>, writer: &mut W) {
    MutexGuard::unlocked(state, || writer.drain());
    state.starved = false;
    state.done = true;
    log::debug!("[sink] end of stream");
    shared.changed.notify_all();
}

impl AudioSink for ThreadSink {
    fn configure(&self, format: PcmFormat) -> Result<(), SinkError> {
        format.validate()?;
        let mut state = self.shared.state.lock();
        state.format = Some(format);
        log::debug!("[sink] configured {:?}", format);
        Ok(())
    }

    fn set_data_callback(&self, callback: Option<PcmCallback>) {
        let mut state = self.shared.state.lock();
        state.callback = callback;
        state.callback_gen = state.callback_gen.wrapping_add(1);
        self.shared.changed.notify_all();
    }

    fn start(&self) -> Result<(), SinkError> {
        let mut state = self.shared.state.lock();
        if state.format.is_none() {
            return Err(SinkError::NotConfigured);
        }
        state.close_request = state.opened;
        state.open_request = true;
        state.open_result = None;
        state.phase = Phase::Running;
        state.no_more_data = false;
        state.done = false;
        state.starved = false;
        self.shared.changed.notify_all();

        if !self
            .shared
            .wait_until(&mut state, |state| state.open_result.is_some())
        {
            state.phase = Phase::Stopped;
            return Err(SinkError::Unresponsive);
        }
        let result = state.open_result.take().unwrap_or(Err(SinkError::Unresponsive));
        if result.is_err() {
            state.phase = Phase::Stopped;
        }
        result
    }

    fn pause(&self) -> Result<(), SinkError> {
        let mut state = self.shared.state.lock();
        if state.phase == Phase::Running {
            state.phase = Phase::Paused;
            self.shared.changed.notify_all();
        }
        Ok(())
    }

    fn resume(&self) -> Result<(), SinkError> {
        let mut state = self.shared.state.lock();
        if state.phase == Phase::Paused {
            state.phase = Phase::Running;
        }
        state.starved = false;
        self.shared.changed.notify_all();
        Ok(())
    }

    fn stop(&self) -> Result<(), SinkError> {
        let mut state = self.shared.state.lock();
        state.phase = Phase::Stopped;
        state.no_more_data = false;
        state.done = false;
        state.starved = false;
        if !state.opened {
            return Ok(());
        }
        state.close_request = true;
        self.shared.changed.notify_all();

        if self.shared.wait_until(&mut state, |state| !state.opened) {
            Ok(())
        } else {
            Err(SinkError::Unresponsive)
        }
    }

    fn set_no_more_data(&self) {
        self.shared.state.lock().no_more_data = true;
        self.shared.changed.notify_all();
    }

    fn is_done(&self) -> bool {
        self.shared.state.lock().done
    }

    fn is_starved(&self) -> bool {
        let state = self.shared.state.lock();
        state.phase == Phase::Running && state.starved
    }
}

impl Drop for ThreadSink {
    fn drop(&mut self) {
        self.shared.state.lock().exit = true;
        self.shared.changed.notify_all();
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::writer::CaptureWriter;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn wait_for(mut check: impl FnMut() -> bool) -> bool {
        let begin = Instant::now();
        while begin.elapsed() < Duration::from_secs(5) {
            if check() {
                return true;
            }
            thread::sleep(Duration::from_millis(2));
        }
        false
    }

    fn capture_sink() -> (ThreadSink, CaptureWriter) {
        let writer = CaptureWriter::new();
        let sink_writer = writer.clone();
        (ThreadSink::new(move || sink_writer).unwrap(), writer)
    }

    /// Serves `total` bytes counting up, then finishes
    fn counting_source(total: usize) -> PcmCallback {
        let mut sent = 0usize;
        Box::new(move |buf: &mut [u8]| {
            if sent >= total {
                return Pull::Finished;
            }
            let len = buf.len().min(total - sent).min(1000);
            for (i, byte) in buf[..len].iter_mut().enumerate() {
                *byte = ((sent + i) % 251) as u8;
            }
            sent += len;
            Pull::Data(len)
        })
    }

    #[test]
    fn test_start_requires_configure() {
        let (sink, _writer) = capture_sink();
        assert_eq!(sink.start(), Err(SinkError::NotConfigured));
        assert!(sink.configure(PcmFormat::new(0, 1)).is_err());
    }

    #[test]
    fn test_plays_until_finished() {
        let (sink, writer) = capture_sink();
        sink.configure(PcmFormat::new(16000, 1)).unwrap();
        sink.set_data_callback(Some(counting_source(5000)));
        sink.start().unwrap();

        assert!(wait_for(|| sink.is_done()));
        let capture = writer.capture();
        let capture = capture.lock();
        assert_eq!(capture.pcm.len(), 5000);
        assert!(capture.pcm.iter().enumerate().all(|(i, b)| *b == (i % 251) as u8));
        assert_eq!(capture.format, Some(PcmFormat::new(16000, 1)));
    }

    #[test]
    fn test_no_more_data_ends_starved_stream() {
        let (sink, _writer) = capture_sink();
        let pulls = Arc::new(AtomicUsize::new(0));
        let counter = pulls.clone();
        sink.configure(PcmFormat::default()).unwrap();
        sink.set_data_callback(Some(Box::new(move |_buf: &mut [u8]| {
            counter.fetch_add(1, Ordering::SeqCst);
            Pull::Starved
        })));
        sink.start().unwrap();

        assert!(wait_for(|| sink.is_starved()));
        assert!(!sink.is_done());

        sink.set_no_more_data();
        assert!(wait_for(|| sink.is_done()));
        assert!(!sink.is_starved());
        assert!(pulls.load(Ordering::SeqCst) > 0);
    }

    #[test]
    fn test_pause_stops_pulling() {
        let writer = CaptureWriter::with_delay(Duration::from_millis(2));
        let sink_writer = writer.clone();
        let sink = ThreadSink::new(move || sink_writer).unwrap();
        sink.configure(PcmFormat::default()).unwrap();
        sink.set_data_callback(Some(Box::new(|buf: &mut [u8]| {
            let len = buf.len().min(64);
            Pull::Data(len)
        })));
        sink.start().unwrap();
        let capture = writer.capture();
        assert!(wait_for(|| capture.lock().writes > 3));

        sink.pause().unwrap();
        thread::sleep(Duration::from_millis(30));
        let paused_at = capture.lock().writes;
        thread::sleep(Duration::from_millis(50));
        assert_eq!(capture.lock().writes, paused_at);

        sink.resume().unwrap();
        assert!(wait_for(|| capture.lock().writes > paused_at));

        sink.stop().unwrap();
        assert_eq!(capture.lock().closes, 1);
    }

    #[test]
    fn test_restart_after_done() {
        let (sink, writer) = capture_sink();
        sink.configure(PcmFormat::default()).unwrap();
        sink.set_data_callback(Some(counting_source(100)));
        sink.start().unwrap();
        assert!(wait_for(|| sink.is_done()));

        sink.stop().unwrap();
        assert!(!sink.is_done());
        sink.set_data_callback(Some(counting_source(300)));
        sink.start().unwrap();
        assert!(wait_for(|| sink.is_done()));

        let capture = writer.capture();
        let capture = capture.lock();
        assert_eq!(capture.pcm.len(), 400);
        assert_eq!(capture.opens, 2);
    }
}
