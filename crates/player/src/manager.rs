// Session manager: routes clips to the prompt and resource sessions

use crate::session::{PlaybackSession, SessionEnv, SessionParts};
use chime_core::{
    AudioError, ClipInfo, ContentKind, FallbackPrompt, Handle, ManagerConfig, PlaybackState,
    Result, SessionCallback, SessionEvent, SourceKind, StopReason,
};
use chime_renderer_api::{AudioSink, ThreadSink};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::thread;

/// Where a clip comes from, as callers name it
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClipSource {
    /// Track on local storage
    Local,
    /// Prompt from the embedded bank
    Prompt,
    /// Streamed track
    HttpUrl,
    /// Synthesized speech fetched over HTTP
    Tts,
}

impl ClipSource {
    pub fn kinds(self) -> (SourceKind, ContentKind) {
        match self {
            ClipSource::Local => (SourceKind::LocalFile, ContentKind::Resource),
            ClipSource::Prompt => (SourceKind::Flash, ContentKind::Prompt),
            ClipSource::HttpUrl => (SourceKind::Network, ContentKind::Resource),
            ClipSource::Tts => (SourceKind::Network, ContentKind::Prompt),
        }
    }
}

/// Default output: the audio device with the `cpal` feature, a paced null
/// writer otherwise.
pub fn default_sink() -> Result<Arc<dyn AudioSink>> {
    #[cfg(feature = "cpal")]
    let sink = ThreadSink::new(chime_renderer_api::CpalWriter::new)?;
    #[cfg(not(feature = "cpal"))]
    let sink = ThreadSink::new(chime_renderer_api::NullWriter::new)?;
    Ok(Arc::new(sink))
}

/// Plays the configured diagnostic prompt when a session fails.
struct FallbackPrompter {
    prompt: Weak<PlaybackSession>,
    config: ManagerConfig,
}

impl FallbackPrompter {
    fn path_for(&self, kind: FallbackPrompt) -> Option<&String> {
        match kind {
            FallbackPrompt::NetworkUnavailable => self.config.network_prompt.as_ref(),
            FallbackPrompt::FormatUnsupported => self.config.unsupported_prompt.as_ref(),
        }
    }

    fn is_fallback(&self, path: &str) -> bool {
        [&self.config.network_prompt, &self.config.unsupported_prompt]
            .iter()
            .any(|p| p.as_deref() == Some(path))
    }
}

impl SessionCallback for FallbackPrompter {
    fn on_event(&self, session: &str, event: SessionEvent) {
        let SessionEvent::Stopped {
            reason: StopReason::Failed(err),
            ..
        } = event
        else {
            return;
        };
        let Some(path) = self.path_for(err.fallback()).cloned() else {
            return;
        };
        let Some(prompt) = self.prompt.upgrade() else {
            return;
        };
        // A failing diagnostic prompt must not queue itself again.
        if prompt.name() == session
            && prompt.clip().map_or(false, |clip| self.is_fallback(&clip.path))
        {
            return;
        }
        drop(prompt);

        log::info!("[manager] {} failed ({}), playing {}", session, err, path);
        // Runs on the failing session's worker; starting from here would wait on it.
        let prompt = self.prompt.clone();
        let spawned = thread::Builder::new()
            .name("chime-fallback".into())
            .spawn(move || {
                let Some(prompt) = prompt.upgrade() else {
                    return;
                };
                let clip = ClipInfo::new(path, SourceKind::Flash, ContentKind::Prompt);
                if let Err(err) = prompt.start(clip, false) {
                    log::warn!("[manager] fallback prompt failed: {}", err);
                }
            });
        if let Err(err) = spawned {
            log::warn!("[manager] cannot spawn fallback: {}", err);
        }
    }
}

/// Owns the prompt and resource sessions and their shared registry.
pub struct SessionManager {
    prompt: Arc<PlaybackSession>,
    resource: Arc<PlaybackSession>,
    config: ManagerConfig,
    /// Seeds `ClipInfo::resume_previous` for every clip `play` starts
    resume_previous: AtomicBool,
}

impl SessionManager {
    pub fn new(
        prompt_parts: SessionParts,
        resource_parts: SessionParts,
        env: SessionEnv,
    ) -> Result<Self> {
        let config = env.config.manager.clone();
        let prompt = Arc::new(PlaybackSession::new("prompt", prompt_parts, env.clone())?);
        let resource = Arc::new(PlaybackSession::new("resource", resource_parts, env)?);

        for session in [&prompt, &resource] {
            session.add_callback(Arc::new(FallbackPrompter {
                prompt: Arc::downgrade(&prompt),
                config: config.clone(),
            }));
        }

        Ok(Self {
            prompt,
            resource,
            config,
            resume_previous: AtomicBool::new(true),
        })
    }

    /// Both sessions on the ureq client, the MP3 decoder and `default_sink`.
    pub fn standard(env: SessionEnv) -> Result<Self> {
        let prompt = SessionParts::standard(default_sink()?, &env.config);
        let resource = SessionParts::standard(default_sink()?, &env.config);
        Self::new(prompt, resource, env)
    }

    pub fn prompt(&self) -> &PlaybackSession {
        &self.prompt
    }

    pub fn resource(&self) -> &PlaybackSession {
        &self.resource
    }

    fn session_for(&self, content: ContentKind) -> &PlaybackSession {
        match content {
            ContentKind::Prompt => &self.prompt,
            ContentKind::Resource => &self.resource,
        }
    }

    /// Whether clips started from now on resume what they interrupt.
    pub fn set_resume_previous(&self, resume: bool) {
        log::info!("[manager] resume previous {}", if resume { "on" } else { "off" });
        self.resume_previous.store(resume, Ordering::Relaxed);
    }

    pub fn resume_previous(&self) -> bool {
        self.resume_previous.load(Ordering::Relaxed)
    }

    pub fn add_callback(&self, callback: Arc<dyn SessionCallback>) {
        self.prompt.add_callback(callback.clone());
        self.resource.add_callback(callback);
    }

    /// Start `path` on the session its source routes to.
    ///
    /// Flash prompts wait for a running flash prompt to finish. With
    /// `wait_start` the call returns once the clip is playing, or with
    /// the error that stopped it.
    pub fn play(&self, path: &str, source: ClipSource, wait_start: bool) -> Result<Handle> {
        if path.is_empty() {
            return Err(AudioError::InvalidParam("empty path".to_string()));
        }
        let (kind, content) = source.kinds();
        if kind == SourceKind::Flash {
            while self.flash_prompt_running() {
                thread::sleep(self.config.prompt_poll_interval);
            }
        }

        let session = self.session_for(content);
        let clip = ClipInfo::new(path, kind, content).with_resume_previous(self.resume_previous());
        let handle = session.start(clip, false)?;
        if wait_start {
            self.wait_started(session, handle)?;
        }
        Ok(handle)
    }

    /// Play `path` and block until it stops.
    pub fn play_and_wait(&self, path: &str, source: ClipSource) -> Result<StopReason> {
        let handle = self.play(path, source, false)?;
        self.session_for(source.kinds().1).wait_finished(handle)
    }

    fn flash_prompt_running(&self) -> bool {
        matches!(
            self.prompt.state(),
            PlaybackState::Starting | PlaybackState::Playing
        ) && self
            .prompt
            .clip()
            .map_or(false, |clip| clip.source == SourceKind::Flash)
    }

    fn wait_started(&self, session: &PlaybackSession, handle: Handle) -> Result<()> {
        loop {
            if session.handle() != handle {
                return Err(AudioError::Superseded);
            }
            match session.state() {
                PlaybackState::Starting => thread::sleep(self.config.start_poll_interval),
                PlaybackState::Playing | PlaybackState::Paused | PlaybackState::Broken => {
                    return Ok(())
                }
                // Over before we looked: report how it ended
                _ => return session.wait_finished(handle).map(|_| ()),
            }
        }
    }

    pub fn stop(&self) {
        self.prompt.stop();
        self.resource.stop();
    }

    /// Stop the prompt and break the resource.
    pub fn interrupt(&self) -> Result<()> {
        self.prompt.stop();
        if self.resource.state() == PlaybackState::Playing {
            self.resource.interrupt()?;
        }
        Ok(())
    }

    pub fn pause(&self) -> Result<()> {
        if self.prompt.state() == PlaybackState::Playing {
            return self.prompt.pause();
        }
        self.resource.pause()
    }

    pub fn resume(&self) -> Result<()> {
        if matches!(
            self.resource.state(),
            PlaybackState::Paused | PlaybackState::Broken
        ) {
            return self.resource.resume();
        }
        self.prompt.resume()
    }

    /// Pause when playing, resume when paused.
    pub fn toggle(&self) -> Result<()> {
        if self.is_playing() {
            self.pause()
        } else if self.is_paused() {
            self.resume()
        } else {
            Err(AudioError::InvalidState("nothing to toggle".to_string()))
        }
    }

    pub fn is_playing(&self) -> bool {
        self.prompt.state() == PlaybackState::Playing
            || self.resource.state() == PlaybackState::Playing
    }

    pub fn is_paused(&self) -> bool {
        [&self.prompt, &self.resource].iter().any(|session| {
            matches!(session.state(), PlaybackState::Paused | PlaybackState::Broken)
        })
    }

    pub fn is_stopped(&self) -> bool {
        self.resource.state().is_idle()
    }

    /// The resource clip comes from local storage
    pub fn is_local(&self) -> bool {
        self.resource
            .clip()
            .map_or(false, |clip| clip.source == SourceKind::LocalFile)
    }

    pub fn is_network(&self) -> bool {
        self.resource.clip().map_or(false, |clip| clip.is_network())
    }

    pub fn all_idle(&self) -> bool {
        self.prompt.state().is_idle() && self.resource.state().is_idle()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{MemoryStorage, Storage};
    use crate::testing::{paced_sink, tone_clip, wait_until, MemoryHttp, Recorder, ToneCodec};
    use chime_core::EngineConfig;
    use rstest::rstest;
    use std::time::Duration;

    const WAIT: Duration = Duration::from_secs(5);

    fn parts() -> SessionParts {
        SessionParts::new(
            Box::new(MemoryHttp::serving(Vec::new())),
            Box::new(ToneCodec),
            paced_sink(),
        )
    }

    fn manager_with(config: EngineConfig) -> SessionManager {
        let bank = MemoryStorage::new();
        bank.insert("track", tone_clip(100));
        bank.insert("beep", tone_clip(2));
        bank.insert("chime", tone_clip(2));
        bank.insert("sorry", tone_clip(2));
        bank.insert("empty", Vec::new());
        let bank: Arc<dyn Storage> = Arc::new(bank);
        let env = SessionEnv::new(config)
            .with_storage(bank.clone())
            .with_flash(bank);
        SessionManager::new(parts(), parts(), env).unwrap()
    }

    fn manager() -> SessionManager {
        let mut config = EngineConfig::default();
        config.player.monitor_interval = Duration::from_millis(20);
        config.manager.start_poll_interval = Duration::from_millis(10);
        config.manager.prompt_poll_interval = Duration::from_millis(20);
        manager_with(config)
    }

    #[rstest]
    #[case(ClipSource::Local, SourceKind::LocalFile, ContentKind::Resource)]
    #[case(ClipSource::Prompt, SourceKind::Flash, ContentKind::Prompt)]
    #[case(ClipSource::HttpUrl, SourceKind::Network, ContentKind::Resource)]
    #[case(ClipSource::Tts, SourceKind::Network, ContentKind::Prompt)]
    fn test_clip_source_kinds(
        #[case] source: ClipSource,
        #[case] kind: SourceKind,
        #[case] content: ContentKind,
    ) {
        assert_eq!(source.kinds(), (kind, content));
    }

    #[test]
    fn test_play_routes_and_waits_for_start() {
        crate::init_logging();
        let manager = manager();
        assert!(manager.all_idle());
        assert!(manager.play("", ClipSource::Local, false).is_err());

        manager.play("track", ClipSource::Local, true).unwrap();
        assert_eq!(manager.resource().state(), PlaybackState::Playing);
        assert!(manager.prompt().state().is_idle());
        assert!(manager.is_playing());
        assert!(manager.is_local());
        assert!(!manager.is_network());
        assert!(!manager.is_stopped());

        manager.stop();
        assert!(manager.all_idle());
    }

    #[test]
    fn test_wait_start_reports_failure() {
        let manager = manager();
        assert_eq!(
            manager.play("empty", ClipSource::Prompt, true),
            Err(AudioError::EmptyInput("empty".to_string()))
        );
    }

    #[test]
    fn test_toggle_and_interrupt() {
        let manager = manager();
        assert!(manager.toggle().is_err());

        manager.play("track", ClipSource::Local, true).unwrap();
        manager.toggle().unwrap();
        assert!(manager.is_paused());
        manager.toggle().unwrap();
        assert!(manager.is_playing());

        manager.interrupt().unwrap();
        assert_eq!(manager.resource().state(), PlaybackState::Broken);
        manager.resume().unwrap();
        assert_eq!(manager.resource().state(), PlaybackState::Playing);
        manager.stop();
    }

    #[test]
    fn test_flash_prompts_play_in_order() {
        let manager = manager();
        let recorder = Arc::new(Recorder::default());
        manager.prompt().add_callback(recorder.clone());

        let first = manager.play("beep", ClipSource::Prompt, true).unwrap();
        let second = manager.play("chime", ClipSource::Prompt, false).unwrap();
        assert_eq!(
            manager.prompt().wait_finished(second),
            Ok(StopReason::Completed)
        );

        let events = recorder.lifecycle();
        assert_eq!(
            events[..2],
            [
                SessionEvent::Started { handle: first },
                SessionEvent::Stopped {
                    handle: first,
                    reason: StopReason::Completed
                },
            ]
        );
        assert_eq!(events[2], SessionEvent::Started { handle: second });
    }

    #[test]
    fn test_play_and_wait() {
        let manager = manager();
        assert_eq!(
            manager.play_and_wait("beep", ClipSource::Prompt),
            Ok(StopReason::Completed)
        );
        assert!(manager.all_idle());
    }

    #[rstest]
    #[case(true, PlaybackState::Playing)]
    #[case(false, PlaybackState::Broken)]
    fn test_resume_previous_default_seeds_clips(
        #[case] resume: bool,
        #[case] prompt_after: PlaybackState,
    ) {
        let manager = manager();
        assert!(manager.resume_previous());
        manager.set_resume_previous(resume);

        manager.play("track", ClipSource::Prompt, true).unwrap();
        assert_eq!(
            manager.prompt().clip().map(|clip| clip.resume_previous),
            Some(resume)
        );

        // the local clip breaks the prompt until it completes
        assert_eq!(
            manager.play_and_wait("beep", ClipSource::Local),
            Ok(StopReason::Completed)
        );
        if resume {
            assert!(wait_until(WAIT, || manager.prompt().state() == prompt_after));
        } else {
            std::thread::sleep(Duration::from_millis(100));
            assert_eq!(manager.prompt().state(), prompt_after);
        }
        manager.stop();
    }

    #[rstest]
    #[case("empty", Some("sorry"), "sorry")]
    #[case("missing", Some("empty"), "empty")]
    #[case("empty", None, "empty")]
    fn test_fallback_prompt_after_failure(
        #[case] path: &str,
        #[case] fallback: Option<&str>,
        #[case] last_played: &str,
    ) {
        let mut config = EngineConfig::default();
        config.player.monitor_interval = Duration::from_millis(20);
        config.manager.unsupported_prompt = fallback.map(str::to_string);
        let manager = manager_with(config);

        assert!(manager.play_and_wait(path, ClipSource::Prompt).is_err());
        assert!(wait_until(WAIT, || {
            manager.all_idle()
                && manager.prompt().clip().map(|clip| clip.path) == Some(last_played.to_string())
        }));
        // A failed fallback does not chain into another one
        std::thread::sleep(Duration::from_millis(100));
        assert_eq!(
            manager.prompt().clip().map(|clip| clip.path),
            Some(last_played.to_string())
        );
    }
}
