// Compressed input a playback session hands to its decoder

use crate::storage::{Storage, StorageFile};
use chime_core::{AudioError, ContentKind, PlayerConfig};
use chime_decode::{DecoderInput, Pulled};
use chime_source_buffer::SharedStreamBuffer;
use chime_transport_http::{DownloadSession, WaitError};
use parking_lot::Mutex;
use std::sync::Arc;

enum Source {
    Network {
        download: Arc<DownloadSession>,
        stream: SharedStreamBuffer,
        content: ContentKind,
    },
    File {
        storage: Arc<dyn Storage>,
        path: String,
        file: Mutex<Option<Box<dyn StorageFile>>>,
        size: u64,
    },
}

pub(crate) struct SessionInput {
    source: Source,
    config: PlayerConfig,
    /// Bytes handed to the decoder, as an absolute offset
    position: Mutex<u64>,
    error: Mutex<Option<AudioError>>,
}

impl SessionInput {
    pub fn network(
        download: Arc<DownloadSession>,
        stream: SharedStreamBuffer,
        content: ContentKind,
        config: PlayerConfig,
    ) -> Self {
        Self {
            source: Source::Network {
                download,
                stream,
                content,
            },
            config,
            position: Mutex::new(0),
            error: Mutex::new(None),
        }
    }

    /// Open `path`; empty inputs are refused.
    pub fn file(storage: Arc<dyn Storage>, path: &str, config: PlayerConfig) -> Result<Self, AudioError> {
        let file = storage.open(path)?;
        let size = file.size();
        if size == 0 {
            return Err(AudioError::EmptyInput(path.to_string()));
        }
        Ok(Self {
            source: Source::File {
                storage,
                path: path.to_string(),
                file: Mutex::new(Some(file)),
                size,
            },
            config,
            position: Mutex::new(0),
            error: Mutex::new(None),
        })
    }

    pub fn error(&self) -> Option<AudioError> {
        self.error.lock().clone()
    }

    fn fail(&self, err: AudioError) {
        let mut error = self.error.lock();
        if error.is_none() {
            log::warn!("[input] {}", err);
            *error = Some(err);
        }
    }

    pub fn total_length(&self) -> Option<u64> {
        match &self.source {
            Source::Network { download, .. } => download.total_length(),
            Source::File { size, .. } => Some(*size),
        }
    }

    /// Release the connection or file handle while paused.
    pub fn suspend(&self) {
        match &self.source {
            Source::Network { download, .. } => download.pause(),
            Source::File { file, .. } => {
                file.lock().take();
            }
        }
    }

    /// Reopen at the saved read position.
    pub fn reopen(&self) -> Result<(), AudioError> {
        match &self.source {
            Source::Network { download, .. } => {
                download.resume();
                Ok(())
            }
            Source::File {
                storage, path, file, ..
            } => {
                let mut slot = file.lock();
                if slot.is_some() {
                    return Ok(());
                }
                let mut reopened = storage.open(path)?;
                reopened.seek(*self.position.lock())?;
                *slot = Some(reopened);
                Ok(())
            }
        }
    }

    /// Bytes worth waiting for before the next pop.
    fn prefix_size(&self, stream: &SharedStreamBuffer, content: ContentKind) -> (usize, bool) {
        let (size, known) = match self.total_length() {
            Some(total) => {
                let remaining = total.saturating_sub(*self.position.lock());
                (
                    (self.config.known_length_prefix as u64).min(remaining) as usize,
                    true,
                )
            }
            None => match content {
                ContentKind::Prompt => (self.config.prompt_prefix, false),
                ContentKind::Resource => (self.config.resource_prefix, false),
            },
        };
        (size.min(stream.capacity()).max(1), known)
    }

    fn pull_network(
        &self,
        download: &DownloadSession,
        stream: &SharedStreamBuffer,
        content: ContentKind,
        buf: &mut [u8],
    ) -> Pulled {
        if stream.count() < buf.len() && !download.is_finished() {
            let (size, known) = self.prefix_size(stream, content);
            let timeout = self.config.prefix_timeout(size, known);
            match download.wait_buffer(size, timeout) {
                Ok(()) => {}
                Err(WaitError::Paused) if stream.count() == 0 => return Pulled::Pending,
                Err(WaitError::Timeout) if stream.count() == 0 => {
                    self.fail(AudioError::NetworkTimeout(format!(
                        "{} bytes not buffered within {:?}",
                        size, timeout
                    )));
                    return Pulled::Failed;
                }
                Err(WaitError::Failed(err)) if stream.count() == 0 => {
                    self.fail(AudioError::Network(err.to_string()));
                    return Pulled::Failed;
                }
                // Short of the prefix but something arrived: play it.
                Err(_) => {}
            }
        }

        let len = stream.pop(buf);
        let position = {
            let mut position = self.position.lock();
            *position += len as u64;
            *position
        };
        let ended = (download.is_finished() && stream.count() == 0)
            || download.total_length().map_or(false, |total| position >= total);
        if len == 0 && !ended {
            return Pulled::Pending;
        }
        Pulled::Data { len, last: ended }
    }

    fn pull_file(&self, file: &Mutex<Option<Box<dyn StorageFile>>>, size: u64, buf: &mut [u8]) -> Pulled {
        let mut slot = file.lock();
        let Some(file) = slot.as_mut() else {
            return Pulled::Pending;
        };
        match file.read(buf) {
            Ok(len) => {
                let mut position = self.position.lock();
                *position += len as u64;
                Pulled::Data {
                    len,
                    last: len == 0 || *position >= size,
                }
            }
            Err(err) => {
                self.fail(err);
                Pulled::Failed
            }
        }
    }
}

impl DecoderInput for SessionInput {
    fn pull(&self, buf: &mut [u8]) -> Pulled {
        match &self.source {
            Source::Network {
                download,
                stream,
                content,
            } => self.pull_network(download, stream, *content, buf),
            Source::File { file, size, .. } => self.pull_file(file, *size, buf),
        }
    }

    fn seek(&self, offset: u64) -> bool {
        let Source::File { file, size, .. } = &self.source else {
            return false;
        };
        if offset > *size {
            return false;
        }
        let mut slot = file.lock();
        let Some(file) = slot.as_mut() else {
            return false;
        };
        match file.seek(offset) {
            Ok(()) => {
                *self.position.lock() = offset;
                true
            }
            Err(err) => {
                log::warn!("[input] seek to {} failed: {}", offset, err);
                false
            }
        }
    }

    fn on_error(&self, err: AudioError) {
        self.fail(err);
    }
}
