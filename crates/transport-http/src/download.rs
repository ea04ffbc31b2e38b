// Streaming HTTP download feeding a bounded StreamBuffer
//
// One worker thread per session runs the protocol state machine. The control
// API talks to it through an EventGroup and reads its progress from a small
// mutex-guarded status block.

use crate::client::{HttpClient, HttpError, Request};
use crate::range::plain_http;
use chime_core::{DownloadConfig, EventGroup, Events, Handle, HandleAllocator};
use chime_source_buffer::SharedStreamBuffer;
use parking_lot::Mutex;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use thiserror::Error;

const START: Events = Events::bit(0);
const STOP: Events = Events::bit(1);
const PAUSE: Events = Events::bit(2);
const RESUME: Events = Events::bit(3);
const EXIT: Events = Events::bit(4);
const STARTED: Events = Events::bit(5);
const STOPPED: Events = Events::bit(6);
const EXITED: Events = Events::bit(7);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DownloadState {
    Idle,
    Starting,
    Connecting,
    Receiving,
    PushingData,
    WaitingForFree,
    WaitingForRangeWindow,
    Paused,
    Stopping,
    Exited,
}

/// Fatal download outcomes
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DownloadError {
    #[error("invalid url: {0:?}")]
    InvalidUrl(String),
    #[error("download was never started")]
    NotStarted,
    #[error("cannot connect after {attempts} attempts: {reason}")]
    CannotConnect { attempts: u32, reason: String },
    #[error("cannot receive after {attempts} attempts: {reason}")]
    CannotReceive { attempts: u32, reason: String },
    #[error("bad response after {attempts} attempts (status {status})")]
    BadResponse { attempts: u32, status: u16 },
}

/// Why `wait_buffer` returned without the requested bytes
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum WaitError {
    #[error("timed out waiting for buffered data")]
    Timeout,
    #[error("download is paused")]
    Paused,
    #[error("download failed: {0}")]
    Failed(DownloadError),
}

/// What the server did with our range requests so far
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RangeSupport {
    Unknown,
    Honored,
    /// Server answered a range request with the full body
    Ignored,
}

struct Job {
    url: String,
    buffer: SharedStreamBuffer,
    range_enable: bool,
}

struct Status {
    state: DownloadState,
    handle: Handle,
    last_error: Option<DownloadError>,
    total_length: Option<u64>,
    delivered: u64,
    range: RangeSupport,
}

struct Shared {
    events: EventGroup,
    status: Mutex<Status>,
    job: Mutex<Option<Job>>,
}

/// Outcome of one state handler
enum Step {
    Next,
    Retry,
    Redirect,
    Skip,
    BufferFull,
    RangeEnd,
    AllEnd,
}

/// Per-start transfer bookkeeping, owned by the worker
struct Transfer {
    url: String,
    buffer: SharedStreamBuffer,
    range_enable: bool,
    opened: bool,
    /// Bytes delivered to the buffer
    pre_download_pos: u64,
    /// Bytes read from the current response, as an absolute offset
    cur_download_pos: u64,
    range_end: u64,
    total_length: Option<u64>,
    length_known: bool,
    chunked: bool,
    redirected: bool,
    err_conn: u32,
    err_recv: u32,
    range: RangeSupport,
    validator: Option<String>,
    head_pending: bool,
    is_range: bool,
    more: bool,
    recv_len: usize,
    read_pos: usize,
    last_progress: Instant,
}

impl Transfer {
    fn new(job: Job) -> Self {
        Self {
            url: job.url,
            buffer: job.buffer,
            range_enable: job.range_enable,
            opened: false,
            pre_download_pos: 0,
            cur_download_pos: 0,
            range_end: 0,
            total_length: None,
            length_known: false,
            chunked: false,
            redirected: false,
            err_conn: 0,
            err_recv: 0,
            range: RangeSupport::Unknown,
            validator: None,
            head_pending: false,
            is_range: false,
            more: false,
            recv_len: 0,
            read_pos: 0,
            last_progress: Instant::now(),
        }
    }

    fn pending(&self) -> usize {
        self.recv_len - self.read_pos
    }

    fn uses_range(&self) -> bool {
        self.range_enable && self.range != RangeSupport::Ignored
    }
}

struct Worker {
    shared: Arc<Shared>,
    client: Box<dyn HttpClient>,
    config: DownloadConfig,
    recv_buf: Vec<u8>,
    transfer: Option<Transfer>,
}

impl Worker {
    fn run(mut self) {
        let mut state = DownloadState::Idle;
        loop {
            state = self.poll_control(state);
            self.publish_state(state);

            state = match state {
                DownloadState::Idle => match self.idle() {
                    Some(next) => next,
                    None => break,
                },
                DownloadState::Starting => self.starting(),
                DownloadState::Connecting => self.connecting(),
                DownloadState::Receiving => self.receiving(),
                DownloadState::PushingData => self.pushing(),
                DownloadState::WaitingForFree => self.waiting_for_free(),
                DownloadState::WaitingForRangeWindow => self.waiting_for_range_window(),
                DownloadState::Paused => self.paused(),
                DownloadState::Stopping => self.stopping(),
                DownloadState::Exited => break,
            };
        }

        self.publish_state(DownloadState::Exited);
        self.shared.events.signal(EXITED);
        log::debug!("[download] worker exited");
    }

    fn poll_control(&self, state: DownloadState) -> DownloadState {
        let mask = match state {
            DownloadState::Idle | DownloadState::Stopping | DownloadState::Exited => {
                return state;
            }
            DownloadState::Starting | DownloadState::Paused => STOP,
            _ => STOP | PAUSE,
        };

        let events = self.shared.events.wait(mask, Some(Duration::ZERO));
        if events.contains(STOP) {
            DownloadState::Stopping
        } else if events.contains(PAUSE) {
            DownloadState::Paused
        } else {
            state
        }
    }

    fn publish_state(&self, state: DownloadState) {
        let mut status = self.shared.status.lock();
        if status.state != state {
            log::debug!("[download] {:?} -> {:?}", status.state, state);
            status.state = state;
        }
    }

    /// Sleep for `delay` unless a stop or pause arrives first.
    fn nap(&self, delay: Duration) {
        self.shared.events.watch(STOP | PAUSE, Some(delay));
    }

    fn close_client(&mut self) {
        self.client.close();
        if let Some(transfer) = self.transfer.as_mut() {
            transfer.opened = false;
        }
    }

    fn fail(&mut self, err: DownloadError) -> DownloadState {
        log::error!("[download] {}", err);
        self.shared.status.lock().last_error = Some(err);
        DownloadState::Stopping
    }

    fn idle(&mut self) -> Option<DownloadState> {
        {
            let status = self.shared.status.lock();
            match &status.last_error {
                Some(err) => log::debug!("[download] idle, last error: {}", err),
                None => log::debug!("[download] idle"),
            }
        }
        self.shared.events.signal(STOPPED);
        self.shared.events.clear(STARTED);

        let events = self.shared.events.wait(START | EXIT, None);
        self.shared.events.clear(STOPPED);

        if events.contains(EXIT) {
            None
        } else {
            Some(DownloadState::Starting)
        }
    }

    fn starting(&mut self) -> DownloadState {
        let job = self.shared.job.lock().as_ref().map(|job| Job {
            url: job.url.clone(),
            buffer: job.buffer.clone(),
            range_enable: job.range_enable,
        });

        let next = match job {
            Some(job) => {
                log::info!(
                    "[download] start {} (range {})",
                    job.url,
                    if job.range_enable { "on" } else { "off" }
                );
                self.transfer = Some(Transfer::new(job));
                DownloadState::Connecting
            }
            None => self.fail(DownloadError::NotStarted),
        };

        self.shared.events.signal(STARTED);
        next
    }

    fn connecting(&mut self) -> DownloadState {
        match self.connect() {
            Ok(Step::BufferFull) => DownloadState::WaitingForRangeWindow,
            Ok(Step::Retry) => {
                self.close_client();
                self.nap(self.config.retry_delay);
                DownloadState::Connecting
            }
            Ok(_) => DownloadState::Receiving,
            Err(err) => self.fail(err),
        }
    }

    fn receiving(&mut self) -> DownloadState {
        match self.receive() {
            Ok(Step::Next) => DownloadState::PushingData,
            Ok(Step::Skip) => DownloadState::Receiving,
            Ok(_) => {
                self.close_client();
                DownloadState::Connecting
            }
            Err(err) => self.fail(err),
        }
    }

    fn pushing(&mut self) -> DownloadState {
        match self.push_data() {
            Step::BufferFull => DownloadState::WaitingForFree,
            Step::RangeEnd => DownloadState::WaitingForRangeWindow,
            Step::AllEnd => {
                if let Some(transfer) = &self.transfer {
                    log::info!(
                        "[download] complete, {} bytes delivered",
                        transfer.pre_download_pos
                    );
                }
                DownloadState::Stopping
            }
            _ => DownloadState::Receiving,
        }
    }

    fn waiting_for_free(&mut self) -> DownloadState {
        let Some(transfer) = &self.transfer else {
            return DownloadState::Stopping;
        };
        if transfer.buffer.free_count() >= transfer.pending() {
            return DownloadState::PushingData;
        }
        self.nap(self.config.free_poll_interval);
        DownloadState::WaitingForFree
    }

    fn waiting_for_range_window(&mut self) -> DownloadState {
        let Some(transfer) = &self.transfer else {
            return DownloadState::Stopping;
        };
        if transfer.buffer.free_count() > transfer.buffer.count() {
            return DownloadState::Connecting;
        }
        self.nap(self.config.free_poll_interval);
        DownloadState::WaitingForRangeWindow
    }

    fn paused(&mut self) -> DownloadState {
        self.close_client();
        if let Some(transfer) = &self.transfer {
            log::info!("[download] paused at {}", transfer.pre_download_pos);
            transfer.buffer.notify();
        }
        self.shared.events.wait(RESUME, None);
        log::info!("[download] resumed");
        DownloadState::Connecting
    }

    fn stopping(&mut self) -> DownloadState {
        self.client.close();
        if let Some(transfer) = self.transfer.take() {
            transfer.buffer.notify();
        }
        DownloadState::Idle
    }

    fn connection_failed(&mut self, err: HttpError) -> Result<Step, DownloadError> {
        let max = self.config.max_conn_errors;
        let Some(transfer) = self.transfer.as_mut() else {
            return Err(DownloadError::NotStarted);
        };
        transfer.err_conn += 1;
        log::warn!(
            "[download] connection error {}/{}: {}",
            transfer.err_conn,
            max,
            err
        );
        if transfer.err_conn >= max {
            return Err(DownloadError::CannotConnect {
                attempts: transfer.err_conn,
                reason: err.to_string(),
            });
        }
        Ok(Step::Retry)
    }

    fn connect(&mut self) -> Result<Step, DownloadError> {
        let Some(transfer) = self.transfer.as_mut() else {
            return Err(DownloadError::NotStarted);
        };
        if transfer.url.is_empty() {
            return Err(DownloadError::InvalidUrl(transfer.url.clone()));
        }

        if !transfer.opened {
            let url = plain_http(&transfer.url);
            if let Err(err) = self.client.connect(&url) {
                return self.connection_failed(err);
            }
            transfer.opened = true;
        }

        transfer.cur_download_pos = 0;
        transfer.head_pending = true;

        let request = if transfer.uses_range() {
            let free = transfer.buffer.free_count() as u64;
            let window = match (transfer.length_known, transfer.total_length) {
                (true, Some(total)) => free.min(total.saturating_sub(transfer.pre_download_pos)),
                _ => free,
            };
            if window == 0 {
                return Ok(Step::BufferFull);
            }
            transfer.range_end = transfer.pre_download_pos + window;
            Request {
                range: Some((transfer.pre_download_pos, transfer.range_end - 1)),
                if_range: match transfer.range {
                    RangeSupport::Honored => transfer.validator.clone(),
                    _ => None,
                },
            }
        } else {
            Request::default()
        };

        if let Err(err) = self.client.send_request(&request) {
            return self.connection_failed(err);
        }
        Ok(Step::Next)
    }

    fn receive_failed(&mut self, reason: String, counted: bool) -> Result<Step, DownloadError> {
        let max = self.config.max_recv_errors;
        let Some(transfer) = self.transfer.as_mut() else {
            return Err(DownloadError::NotStarted);
        };
        if counted {
            transfer.err_recv += 1;
        }
        log::warn!(
            "[download] receive error {}/{}: {}",
            transfer.err_recv,
            max,
            reason
        );
        if transfer.err_recv >= max {
            return Err(DownloadError::CannotReceive {
                attempts: transfer.err_recv,
                reason,
            });
        }
        Ok(Step::Retry)
    }

    fn receive(&mut self) -> Result<Step, DownloadError> {
        let result = self
            .client
            .receive_response(&mut self.recv_buf, self.config.response_timeout);
        let response = match result {
            Ok(response) => response,
            Err(err) if err.is_connect_failure() => {
                let step = self.connection_failed(err)?;
                self.nap(self.config.retry_delay);
                return Ok(step);
            }
            Err(err) => {
                let counted = !err.is_connection_lost();
                return self.receive_failed(err.to_string(), counted);
            }
        };

        let max_recv = self.config.max_recv_errors;
        let Some(transfer) = self.transfer.as_mut() else {
            return Err(DownloadError::NotStarted);
        };
        let head = &response.head;

        if transfer.head_pending {
            // The request reached the server
            transfer.err_conn = 0;
            if !transfer.redirected {
                if let Some(target) = head.redirect_target() {
                    log::info!("[download] redirect {} -> {}", transfer.url, target);
                    transfer.url = target.to_string();
                    transfer.redirected = true;
                    return Ok(Step::Redirect);
                }
            }

            if head.status >= 400 || (!head.chunked && head.content_length.unwrap_or(0) == 0) {
                transfer.err_recv += 1;
                log::warn!(
                    "[download] empty or failed response {}/{} (status {})",
                    transfer.err_recv,
                    max_recv,
                    head.status
                );
                if transfer.err_recv >= max_recv {
                    return Err(DownloadError::BadResponse {
                        attempts: transfer.err_recv,
                        status: head.status,
                    });
                }
                return Ok(Step::Retry);
            }

            transfer.is_range = false;
            if transfer.uses_range() {
                match head.content_range {
                    Some(range) if range.start == transfer.pre_download_pos => {
                        if transfer.range == RangeSupport::Unknown {
                            log::info!("[download] server honors range requests");
                        }
                        transfer.range = RangeSupport::Honored;
                        transfer.is_range = true;
                        transfer.cur_download_pos = range.start;
                        if head.validator.is_some() {
                            transfer.validator = head.validator.clone();
                        }
                    }
                    Some(range) => {
                        let reason = format!(
                            "range starts at {} instead of {}",
                            range.start, transfer.pre_download_pos
                        );
                        return self.receive_failed(reason, true);
                    }
                    None => {
                        log::info!(
                            "[download] server ignored range request, continuing as plain transfer"
                        );
                        transfer.range = RangeSupport::Ignored;
                    }
                }
            }

            if head.chunked {
                transfer.chunked = true;
                transfer.total_length = None;
            } else if !transfer.length_known {
                transfer.total_length = if transfer.is_range {
                    head.content_range.and_then(|range| range.total)
                } else {
                    head.content_length
                };
                transfer.length_known = true;
                log::info!("[download] total length {:?}", transfer.total_length);
            }

            let mut status = self.shared.status.lock();
            status.total_length = transfer.total_length;
            status.range = transfer.range;
            drop(status);

            transfer.head_pending = false;
        }

        transfer.recv_len = response.len;
        transfer.read_pos = 0;
        transfer.more = response.more;

        // A plain response restarts at offset 0; drop what was delivered before.
        if !transfer.is_range && transfer.cur_download_pos < transfer.pre_download_pos {
            let behind = transfer.pre_download_pos - transfer.cur_download_pos;
            let skip = (behind.min(transfer.recv_len as u64)) as usize;
            transfer.cur_download_pos += skip as u64;
            transfer.read_pos = skip;
            if transfer.read_pos >= transfer.recv_len && transfer.more {
                return Ok(Step::Skip);
            }
        }

        Ok(Step::Next)
    }

    fn push_data(&mut self) -> Step {
        let progress_interval = self.config.progress_interval;
        let Some(transfer) = self.transfer.as_mut() else {
            return Step::AllEnd;
        };

        let pending = &self.recv_buf[transfer.read_pos..transfer.recv_len];
        if !pending.is_empty() {
            if transfer.buffer.free_count() < pending.len() {
                return Step::BufferFull;
            }
            if transfer.buffer.push(pending).is_err() {
                return Step::BufferFull;
            }

            let len = pending.len() as u64;
            transfer.pre_download_pos += len;
            transfer.cur_download_pos += len;
            transfer.read_pos = transfer.recv_len;
            self.shared.status.lock().delivered = transfer.pre_download_pos;

            if transfer.last_progress.elapsed() >= progress_interval {
                transfer.last_progress = Instant::now();
                match transfer.total_length {
                    Some(total) if total > 0 => log::info!(
                        "[download] {}/{} bytes ({}%)",
                        transfer.pre_download_pos,
                        total,
                        transfer.pre_download_pos * 100 / total
                    ),
                    _ => log::info!("[download] {} bytes", transfer.pre_download_pos),
                }
            }
        }

        if !transfer.is_range && !transfer.more {
            return Step::AllEnd;
        }
        if !transfer.chunked {
            if let Some(total) = transfer.total_length {
                if transfer.pre_download_pos >= total {
                    return Step::AllEnd;
                }
            }
        }
        if transfer.is_range && (transfer.pre_download_pos >= transfer.range_end || !transfer.more)
        {
            if transfer.total_length.is_none() && transfer.pre_download_pos < transfer.range_end {
                // Window cut short and no total advertised: nothing more to fetch.
                return Step::AllEnd;
            }
            return Step::RangeEnd;
        }
        Step::Next
    }
}

/// Control handle for one streaming download
pub struct DownloadSession {
    shared: Arc<Shared>,
    handles: Arc<HandleAllocator>,
    control: Mutex<()>,
    config: DownloadConfig,
    worker: Option<JoinHandle<()>>,
}

impl DownloadSession {
    pub fn new(
        client: Box<dyn HttpClient>,
        config: DownloadConfig,
        handles: Arc<HandleAllocator>,
    ) -> std::io::Result<Self> {
        let shared = Arc::new(Shared {
            events: EventGroup::new(),
            status: Mutex::new(Status {
                state: DownloadState::Idle,
                handle: 0,
                last_error: None,
                total_length: None,
                delivered: 0,
                range: RangeSupport::Unknown,
            }),
            job: Mutex::new(None),
        });

        let worker = Worker {
            shared: shared.clone(),
            client,
            config,
            recv_buf: vec![0u8; config.recv_chunk_size.max(1)],
            transfer: None,
        };
        let handle = thread::Builder::new()
            .name("chime-download".into())
            .spawn(move || worker.run())?;

        Ok(Self {
            shared,
            handles,
            control: Mutex::new(()),
            config,
            worker: Some(handle),
        })
    }

    /// Begin fetching `url` into `buffer`, stopping any previous transfer.
    pub fn start(
        &self,
        buffer: SharedStreamBuffer,
        url: &str,
        range_enable: bool,
    ) -> Result<Handle, DownloadError> {
        if url.is_empty() {
            return Err(DownloadError::InvalidUrl(url.to_string()));
        }

        let _guard = self.control.lock();
        self.stop_locked();

        *self.shared.job.lock() = Some(Job {
            url: url.to_string(),
            buffer,
            range_enable,
        });
        let handle = self.handles.next();
        {
            let mut status = self.shared.status.lock();
            status.handle = handle;
            status.last_error = None;
            status.total_length = None;
            status.delivered = 0;
            status.range = RangeSupport::Unknown;
        }

        self.shared.events.signal(START);
        if self
            .shared
            .events
            .wait(STARTED, Some(self.config.control_timeout))
            .is_empty()
        {
            log::warn!("[download] start not acknowledged within {:?}", self.config.control_timeout);
        }
        Ok(handle)
    }

    pub fn stop(&self) {
        let _guard = self.control.lock();
        self.stop_locked();
    }

    fn stop_locked(&self) {
        if self.state() != DownloadState::Idle {
            self.shared.events.signal(STOP | RESUME);
            if self
                .shared
                .events
                .wait(STOPPED, Some(self.config.control_timeout))
                .is_empty()
            {
                log::warn!("[download] stop timed out");
            }
        }
        self.shared.events.clear(START | STOP | PAUSE | RESUME | STARTED);
    }

    /// Release the connection; buffered data stays available.
    pub fn pause(&self) {
        let _guard = self.control.lock();
        match self.state() {
            DownloadState::Idle
            | DownloadState::Paused
            | DownloadState::Stopping
            | DownloadState::Exited => {}
            _ => self.shared.events.signal(PAUSE),
        }
    }

    /// Reconnect at the delivered offset.
    pub fn resume(&self) {
        let _guard = self.control.lock();
        self.shared.events.clear(PAUSE);
        if self.state() == DownloadState::Paused {
            self.shared.events.signal(RESUME);
        }
    }

    pub fn state(&self) -> DownloadState {
        self.shared.status.lock().state
    }

    pub fn handle(&self) -> Handle {
        self.shared.status.lock().handle
    }

    pub fn last_error(&self) -> Option<DownloadError> {
        self.shared.status.lock().last_error.clone()
    }

    /// Total resource length once a response announced it
    pub fn total_length(&self) -> Option<u64> {
        self.shared.status.lock().total_length
    }

    /// Bytes pushed into the buffer so far
    pub fn delivered(&self) -> u64 {
        self.shared.status.lock().delivered
    }

    pub fn range_support(&self) -> RangeSupport {
        self.shared.status.lock().range
    }

    /// Idle without a fatal error: everything that will arrive has arrived.
    pub fn is_finished(&self) -> bool {
        let status = self.shared.status.lock();
        status.state == DownloadState::Idle && status.last_error.is_none()
    }

    pub fn is_stopped(&self) -> bool {
        self.state() == DownloadState::Idle
    }

    /// Block until `size` bytes are buffered or the download can make no
    /// further progress.
    pub fn wait_buffer(&self, size: usize, timeout: Duration) -> Result<(), WaitError> {
        let buffer = self
            .shared
            .job
            .lock()
            .as_ref()
            .map(|job| job.buffer.clone())
            .ok_or(WaitError::Failed(DownloadError::NotStarted))?;

        let begin = Instant::now();
        loop {
            if buffer.count() >= size {
                return Ok(());
            }
            if begin.elapsed() >= timeout {
                return Err(WaitError::Timeout);
            }
            {
                let status = self.shared.status.lock();
                match status.state {
                    DownloadState::Idle => {
                        return match &status.last_error {
                            None => Ok(()),
                            Some(err) => Err(WaitError::Failed(err.clone())),
                        };
                    }
                    DownloadState::Paused => return Err(WaitError::Paused),
                    _ => {}
                }
            }
            if self.shared.events.peek().contains(PAUSE) {
                return Err(WaitError::Paused);
            }
            buffer.wait_for_count(size, self.config.wait_poll_interval);
        }
    }
}

impl Drop for DownloadSession {
    fn drop(&mut self) {
        self.stop();
        self.shared.events.signal(EXIT);
        if self
            .shared
            .events
            .wait(EXITED, Some(self.config.control_timeout))
            .is_empty()
        {
            log::warn!("[download] exit timed out, detaching worker");
            return;
        }
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}
