// Playback session: one slot coordinating input, decoder and sink for a clip
// Cross-session ducking goes through the shared registry

use crate::input::SessionInput;
use crate::registry::{Duckable, SessionRegistry};
use crate::storage::{MemoryStorage, StdStorage, Storage};
use chime_core::{
    AudioError, CallbackDispatcher, ClipInfo, ContentKind, EngineConfig, EventGroup, Events,
    Handle, HandleAllocator, PlaybackState, PlayerConfig, Progress, Result, SessionCallback,
    SessionEvent, SourceKind, StopReason,
};
use chime_decode::{DecodeSupervisor, FrameDecoder, MpegFrameDecoder};
use chime_renderer_api::AudioSink;
use chime_source_buffer::SharedStreamBuffer;
use chime_transport_http::{DownloadError, DownloadSession, HttpClient, UreqClient};
use parking_lot::{Condvar, Mutex};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

const START: Events = Events::bit(0);
const STOP: Events = Events::bit(1);
const PAUSE: Events = Events::bit(2);
const RESUME: Events = Events::bit(3);
/// Pause on behalf of another session
const BREAK: Events = Events::bit(4);
const EXIT: Events = Events::bit(5);
const STARTED: Events = Events::bit(6);
const STOPPED: Events = Events::bit(7);
const PAUSED: Events = Events::bit(8);
const RESUMED: Events = Events::bit(9);
const BROKEN: Events = Events::bit(10);
const EXITED: Events = Events::bit(11);

/// Collaborators owned by one session
pub struct SessionParts {
    pub http: Box<dyn HttpClient>,
    pub codec: Box<dyn FrameDecoder>,
    pub sink: Arc<dyn AudioSink>,
}

impl SessionParts {
    pub fn new(
        http: Box<dyn HttpClient>,
        codec: Box<dyn FrameDecoder>,
        sink: Arc<dyn AudioSink>,
    ) -> Self {
        Self { http, codec, sink }
    }

    /// ureq transport and the MP3 decoder
    pub fn standard(sink: Arc<dyn AudioSink>, config: &EngineConfig) -> Self {
        Self::new(
            Box::new(UreqClient::with_stall_timeout(
                config.download.body_stall_timeout,
            )),
            Box::new(MpegFrameDecoder::new()),
            sink,
        )
    }
}

/// Services shared by every session of one manager
#[derive(Clone)]
pub struct SessionEnv {
    /// Local files
    pub storage: Arc<dyn Storage>,
    /// Embedded prompt bank
    pub flash: Arc<dyn Storage>,
    pub registry: Arc<SessionRegistry>,
    pub handles: Arc<HandleAllocator>,
    pub config: EngineConfig,
}

impl SessionEnv {
    pub fn new(config: EngineConfig) -> Self {
        Self {
            storage: Arc::new(StdStorage::new()),
            flash: Arc::new(MemoryStorage::new()),
            registry: Arc::new(SessionRegistry::new(config.player.registry_slots)),
            handles: Arc::new(HandleAllocator::new()),
            config,
        }
    }

    pub fn with_storage(mut self, storage: Arc<dyn Storage>) -> Self {
        self.storage = storage;
        self
    }

    pub fn with_flash(mut self, flash: Arc<dyn Storage>) -> Self {
        self.flash = flash;
        self
    }
}

struct Status {
    state: PlaybackState,
    handle: Handle,
    clip: Option<ClipInfo>,
    last_error: Option<AudioError>,
    progress: Progress,
    /// Outcome of the last finished run
    finished: Option<(Handle, Result<StopReason>)>,
    stop_requested: bool,
    /// The run is being replaced by a new start
    superseded: bool,
}

struct SessionCore {
    name: String,
    events: EventGroup,
    status: Mutex<Status>,
    finished: Condvar,
    callbacks: CallbackDispatcher,
}

impl SessionCore {
    fn state(&self) -> PlaybackState {
        self.status.lock().state
    }

    fn handle(&self) -> Handle {
        self.status.lock().handle
    }

    fn dispatch(&self, event: SessionEvent) {
        self.callbacks.dispatch(&self.name, event);
    }
}

impl Duckable for SessionCore {
    fn name(&self) -> &str {
        &self.name
    }

    fn playback_state(&self) -> PlaybackState {
        self.state()
    }

    fn resume_previous(&self) -> bool {
        self.status
            .lock()
            .clip
            .as_ref()
            .map_or(false, |clip| clip.resume_previous)
    }

    fn duck(&self) -> bool {
        if self.state() != PlaybackState::Playing {
            return false;
        }
        self.events.signal(BREAK);
        true
    }

    fn restore(&self) -> bool {
        if self.state() != PlaybackState::Broken {
            return false;
        }
        self.events.signal(RESUME);
        true
    }
}

fn download_error(err: DownloadError) -> AudioError {
    match err {
        DownloadError::InvalidUrl(url) => AudioError::InvalidParam(url),
        other => AudioError::Network(other.to_string()),
    }
}

struct Worker {
    core: Arc<SessionCore>,
    me: Arc<dyn Duckable>,
    decoder: DecodeSupervisor,
    download: Arc<DownloadSession>,
    stream: SharedStreamBuffer,
    env: SessionEnv,
    input: Option<Arc<SessionInput>>,
    exiting: bool,
    last_progress: Instant,
}

impl Worker {
    fn config(&self) -> &PlayerConfig {
        &self.env.config.player
    }

    fn run(mut self) {
        let mut state = PlaybackState::Idle;
        loop {
            self.publish_state(state);
            let next = match state {
                PlaybackState::Idle => self.idle(),
                PlaybackState::Starting => self.starting(),
                PlaybackState::Playing => self.playing(),
                PlaybackState::Paused | PlaybackState::Broken => self.suspended(),
                PlaybackState::Stopping => self.stopping(),
                PlaybackState::Exited => break,
            };
            if let Err(err) = PlaybackState::validate_transition(state, next) {
                log::error!("[session] {}: {}", self.core.name, err);
            }
            state = next;
        }

        self.publish_state(PlaybackState::Exited);
        self.core.events.signal(EXITED);
        log::debug!("[session] {} worker exited", self.core.name);
    }

    fn publish_state(&self, state: PlaybackState) {
        let mut status = self.core.status.lock();
        if status.state != state {
            log::debug!("[session] {} {:?} -> {:?}", self.core.name, status.state, state);
            status.state = state;
        }
    }

    /// Keep the first error of a run.
    fn fail(&self, err: AudioError) {
        let mut status = self.core.status.lock();
        if status.last_error.is_none() {
            log::warn!("[session] {} failed: {}", self.core.name, err);
            status.last_error = Some(err);
        }
    }

    fn stop_pending(&self) -> bool {
        self.core.events.peek().intersects(STOP | EXIT)
    }

    fn idle(&mut self) -> PlaybackState {
        if self.exiting {
            return PlaybackState::Exited;
        }
        let events = self.core.events.wait(START | EXIT, None);
        if events.contains(EXIT) {
            return PlaybackState::Exited;
        }
        self.publish_state(PlaybackState::Starting);
        self.core.events.signal(STARTED);
        PlaybackState::Starting
    }

    fn starting(&mut self) -> PlaybackState {
        let Some(clip) = self.core.status.lock().clip.clone() else {
            self.fail(AudioError::InvalidState("started without a clip".to_string()));
            return PlaybackState::Stopping;
        };
        self.last_progress = Instant::now();

        if clip.content == ContentKind::Resource {
            for peer in self.env.registry.find_other_playing(&self.me) {
                if peer.duck() {
                    log::info!("[session] {} interrupts {}", self.core.name, peer.name());
                }
            }
        }
        if let Err(err) = self.env.registry.register(&self.me) {
            self.fail(err);
            return PlaybackState::Stopping;
        }

        let input = match self.open_input(&clip) {
            Ok(input) => input,
            Err(err) => {
                self.fail(err);
                return PlaybackState::Stopping;
            }
        };
        self.input = Some(input.clone());
        if self.stop_pending() {
            return PlaybackState::Stopping;
        }

        match self.decoder.start(input.clone()) {
            Ok(info) => log::info!(
                "[session] {} playing {} ({} Hz, {} ch, {} bps)",
                self.core.name,
                clip.path,
                info.sample_rate,
                info.channels,
                info.bit_rate
            ),
            Err(err) => {
                if !self.stop_pending() {
                    self.fail(input.error().unwrap_or(err));
                }
                return PlaybackState::Stopping;
            }
        }

        self.core.dispatch(SessionEvent::Started {
            handle: self.core.handle(),
        });
        PlaybackState::Playing
    }

    fn open_input(&self, clip: &ClipInfo) -> Result<Arc<SessionInput>> {
        let config = *self.config();
        let input = match clip.source {
            SourceKind::Network => {
                self.stream.clear();
                let ranged = clip.content == ContentKind::Resource;
                self.download
                    .start(self.stream.clone(), &clip.path, ranged)
                    .map_err(download_error)?;
                SessionInput::network(
                    self.download.clone(),
                    self.stream.clone(),
                    clip.content,
                    config,
                )
            }
            SourceKind::LocalFile => {
                SessionInput::file(self.env.storage.clone(), &clip.path, config)?
            }
            SourceKind::Flash => SessionInput::file(self.env.flash.clone(), &clip.path, config)?,
        };
        Ok(Arc::new(input))
    }

    fn playing(&mut self) -> PlaybackState {
        let interval = self.config().monitor_interval;
        let events = self
            .core
            .events
            .wait(STOP | PAUSE | BREAK | EXIT, Some(interval));
        if events.contains(EXIT) {
            self.exiting = true;
            return PlaybackState::Stopping;
        }
        if events.contains(STOP) {
            return PlaybackState::Stopping;
        }
        if events.intersects(PAUSE | BREAK) {
            let (next, ack) = if events.contains(PAUSE) {
                (PlaybackState::Paused, PAUSED)
            } else {
                (PlaybackState::Broken, BROKEN)
            };
            self.suspend();
            self.core.events.clear(RESUME);
            self.publish_state(next);
            self.core.events.signal(ack);
            self.core.dispatch(SessionEvent::Paused {
                handle: self.core.handle(),
                ducked: next == PlaybackState::Broken,
            });
            return next;
        }
        self.monitor()
    }

    /// Periodic end-of-stream and progress check.
    fn monitor(&mut self) -> PlaybackState {
        if let Some(err) = self.input.as_ref().and_then(|input| input.error()) {
            self.fail(err);
            return PlaybackState::Stopping;
        }

        self.decoder.auto_resume();
        if self.decoder.is_done() {
            if let Some(err) = self.decoder.last_error() {
                self.fail(err);
            }
            return PlaybackState::Stopping;
        }

        if self.last_progress.elapsed() >= self.config().progress_interval {
            self.last_progress = Instant::now();
            let total = self.input.as_ref().and_then(|input| input.total_length());
            let progress = self.decoder.progress(total);
            self.core.status.lock().progress = progress;
            log::info!("[session] {} {}", self.core.name, progress.display());
            self.core.dispatch(SessionEvent::Progress {
                handle: self.core.handle(),
                progress,
            });
        }
        PlaybackState::Playing
    }

    /// Release the input first; a decoder blocked on it returns at once.
    fn suspend(&self) {
        if let Some(input) = &self.input {
            input.suspend();
        }
        if let Err(err) = self.decoder.pause() {
            log::warn!("[session] {} pause failed: {}", self.core.name, err);
        }
    }

    fn suspended(&mut self) -> PlaybackState {
        let events = self.core.events.wait(RESUME | STOP | EXIT, None);
        if events.contains(EXIT) {
            self.exiting = true;
            return PlaybackState::Stopping;
        }
        if events.contains(STOP) {
            return PlaybackState::Stopping;
        }

        if let Some(input) = &self.input {
            if let Err(err) = input.reopen() {
                self.fail(err);
                return PlaybackState::Stopping;
            }
        }
        if let Err(err) = self.decoder.resume() {
            self.fail(err);
            return PlaybackState::Stopping;
        }

        self.last_progress = Instant::now();
        self.publish_state(PlaybackState::Playing);
        self.core.events.signal(RESUMED);
        self.core.dispatch(SessionEvent::Resumed {
            handle: self.core.handle(),
        });
        PlaybackState::Playing
    }

    fn stopping(&mut self) -> PlaybackState {
        if self
            .core
            .events
            .wait(STOP | EXIT, Some(Duration::ZERO))
            .contains(EXIT)
        {
            self.exiting = true;
        }

        // The decoder may be blocked on network input: stop the download first.
        self.download.stop();
        self.decoder.stop();
        self.stream.clear();
        self.input = None;
        self.env.registry.unregister(&self.me);

        let (handle, resume_previous, requested, superseded, error) = {
            let status = self.core.status.lock();
            (
                status.handle,
                status.clip.as_ref().map_or(false, |clip| clip.resume_previous),
                status.stop_requested,
                status.superseded,
                status.last_error.clone(),
            )
        };

        if !superseded {
            if let Some(peer) = self.env.registry.find_other_broken(&self.me) {
                if (resume_previous || peer.resume_previous()) && peer.restore() {
                    log::info!("[session] {} resumes {}", self.core.name, peer.name());
                }
            }
        }

        let reason = match error {
            Some(err) => StopReason::Failed(err),
            None if requested => StopReason::Requested,
            None => StopReason::Completed,
        };
        log::info!("[session] {} stopped: {:?}", self.core.name, reason);

        let outcome = if superseded {
            Err(AudioError::Superseded)
        } else {
            match &reason {
                StopReason::Failed(err) => Err(err.clone()),
                other => Ok(other.clone()),
            }
        };
        self.core.dispatch(SessionEvent::Stopped { handle, reason });
        {
            let mut status = self.core.status.lock();
            status.state = PlaybackState::Idle;
            status.finished = Some((handle, outcome));
        }
        self.core.finished.notify_all();
        self.core.events.signal(STOPPED);
        PlaybackState::Idle
    }
}

/// One playable slot: a clip at a time, network or local.
pub struct PlaybackSession {
    core: Arc<SessionCore>,
    download: Arc<DownloadSession>,
    handles: Arc<HandleAllocator>,
    config: PlayerConfig,
    control: Mutex<()>,
    worker: Option<JoinHandle<()>>,
}

impl PlaybackSession {
    pub fn new(name: &str, parts: SessionParts, env: SessionEnv) -> Result<Self> {
        let download = Arc::new(DownloadSession::new(
            parts.http,
            env.config.download,
            env.handles.clone(),
        )?);
        let decoder = DecodeSupervisor::new(parts.codec, parts.sink, env.config.decode)?;

        let core = Arc::new(SessionCore {
            name: name.to_string(),
            events: EventGroup::new(),
            status: Mutex::new(Status {
                state: PlaybackState::Idle,
                handle: 0,
                clip: None,
                last_error: None,
                progress: Progress::default(),
                finished: None,
                stop_requested: false,
                superseded: false,
            }),
            finished: Condvar::new(),
            callbacks: CallbackDispatcher::new(),
        });

        let me: Arc<dyn Duckable> = core.clone();
        let config = env.config.player;
        let handles = env.handles.clone();
        let worker = Worker {
            core: core.clone(),
            me,
            decoder,
            download: download.clone(),
            stream: SharedStreamBuffer::new(env.config.stream_buffer),
            env,
            input: None,
            exiting: false,
            last_progress: Instant::now(),
        };
        let handle = thread::Builder::new()
            .name(format!("chime-{}", name))
            .spawn(move || worker.run())?;

        Ok(Self {
            core,
            download,
            handles,
            config,
            control: Mutex::new(()),
            worker: Some(handle),
        })
    }

    pub fn name(&self) -> &str {
        &self.core.name
    }

    /// Play `clip`, replacing whatever this session plays now.
    ///
    /// The replaced clip does not resume interrupted peers. With
    /// `wait_finish` the call returns once the new clip has stopped.
    pub fn start(&self, clip: ClipInfo, wait_finish: bool) -> Result<Handle> {
        if clip.path.is_empty() {
            return Err(AudioError::InvalidParam("empty path".to_string()));
        }

        let handle = {
            let _guard = self.control.lock();
            self.stop_locked(true);

            let handle = self.handles.next();
            log::info!("[session] {} start #{} {}", self.core.name, handle, clip.path);
            {
                let mut status = self.core.status.lock();
                status.handle = handle;
                status.clip = Some(clip);
                status.last_error = None;
                status.progress = Progress::default();
                status.finished = None;
                status.stop_requested = false;
                status.superseded = false;
            }
            self.core.finished.notify_all();

            self.core.events.clear(
                STOP | STARTED | STOPPED | PAUSE | RESUME | BREAK | PAUSED | RESUMED | BROKEN,
            );
            self.core.events.signal(START);
            if self
                .core
                .events
                .wait(STARTED, Some(self.config.control_timeout))
                .is_empty()
            {
                return Err(AudioError::InvalidState(
                    "session worker did not start".to_string(),
                ));
            }
            handle
        };

        if wait_finish {
            self.wait_finished(handle)?;
        }
        Ok(handle)
    }

    /// Block until the run started as `handle` stops.
    ///
    /// Returns `Superseded` once a newer start replaced it, and the run's
    /// error if it failed.
    pub fn wait_finished(&self, handle: Handle) -> Result<StopReason> {
        if handle == 0 {
            return Err(AudioError::InvalidParam("handle 0 is never issued".to_string()));
        }
        let mut status = self.core.status.lock();
        loop {
            if let Some((finished, outcome)) = &status.finished {
                if *finished == handle {
                    return outcome.clone();
                }
            }
            if status.handle != handle {
                return Err(AudioError::Superseded);
            }
            self.core.finished.wait(&mut status);
        }
    }

    pub fn stop(&self) {
        let _guard = self.control.lock();
        self.stop_locked(false);
    }

    fn stop_locked(&self, superseded: bool) {
        if matches!(self.state(), PlaybackState::Idle | PlaybackState::Exited) {
            return;
        }
        {
            let mut status = self.core.status.lock();
            status.stop_requested = true;
            status.superseded = superseded;
        }
        self.core.events.signal(STOP);
        // Unblocks a worker still waiting for the first network bytes
        self.download.stop();

        if self
            .core
            .events
            .wait(STOPPED, Some(self.config.control_timeout))
            .is_empty()
        {
            log::warn!("[session] {} stop timed out", self.core.name);
        }
    }

    /// Signal `request` and wait for `ack`; a run that ends first is an error.
    fn request(&self, request: Events, ack: Events, what: &str) -> Result<()> {
        self.core.events.clear(ack);
        self.core.events.signal(request);
        let events = self
            .core
            .events
            .wait(ack | STOPPED, Some(self.config.control_timeout));
        if events.contains(ack) {
            Ok(())
        } else if events.contains(STOPPED) {
            Err(AudioError::InvalidState(format!("stopped before {}", what)))
        } else {
            log::warn!("[session] {} {} not acknowledged", self.core.name, what);
            Err(AudioError::InvalidState(format!("{} timed out", what)))
        }
    }

    pub fn pause(&self) -> Result<()> {
        let _guard = self.control.lock();
        let state = self.state();
        if state != PlaybackState::Playing {
            return Err(AudioError::InvalidState(format!("cannot pause while {:?}", state)));
        }
        self.request(PAUSE, PAUSED, "pause")
    }

    pub fn resume(&self) -> Result<()> {
        let _guard = self.control.lock();
        let state = self.state();
        if !matches!(state, PlaybackState::Paused | PlaybackState::Broken) {
            return Err(AudioError::InvalidState(format!("cannot resume while {:?}", state)));
        }
        self.request(RESUME, RESUMED, "resume")
    }

    /// Break: pause on behalf of another clip.
    pub fn interrupt(&self) -> Result<()> {
        let _guard = self.control.lock();
        let state = self.state();
        if state != PlaybackState::Playing {
            return Err(AudioError::InvalidState(format!(
                "cannot interrupt while {:?}",
                state
            )));
        }
        self.request(BREAK, BROKEN, "interrupt")
    }

    pub fn state(&self) -> PlaybackState {
        self.core.state()
    }

    pub fn handle(&self) -> Handle {
        self.core.handle()
    }

    pub fn clip(&self) -> Option<ClipInfo> {
        self.core.status.lock().clip.clone()
    }

    pub fn last_error(&self) -> Option<AudioError> {
        self.core.status.lock().last_error.clone()
    }

    /// Position as of the last progress report
    pub fn progress(&self) -> Progress {
        self.core.status.lock().progress
    }

    pub fn add_callback(&self, callback: Arc<dyn SessionCallback>) {
        self.core
            .callbacks
            .add_callback(callback, self.config.progress_interval);
    }

    pub fn clear_callbacks(&self) {
        self.core.callbacks.clear_callbacks();
    }
}

impl Drop for PlaybackSession {
    fn drop(&mut self) {
        self.stop();
        self.core.events.signal(EXIT);
        if self
            .core
            .events
            .wait(EXITED, Some(self.config.control_timeout))
            .is_empty()
        {
            log::warn!("[session] {} exit timed out, detaching worker", self.core.name);
            return;
        }
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}
