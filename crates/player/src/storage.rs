// Local storage collaborator: filesystem files and the embedded prompt bank

use chime_core::{AudioError, Result};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::PathBuf;
use std::sync::Arc;

/// An open, seekable input
pub trait StorageFile: Send {
    fn read(&mut self, buf: &mut [u8]) -> Result<usize>;

    fn seek(&mut self, offset: u64) -> Result<()>;

    fn size(&self) -> u64;
}

pub trait Storage: Send + Sync {
    fn open(&self, path: &str) -> Result<Box<dyn StorageFile>>;
}

/// Files on the local filesystem, optionally below a root directory
#[derive(Debug, Clone, Default)]
pub struct StdStorage {
    root: Option<PathBuf>,
}

impl StdStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_root(root: impl Into<PathBuf>) -> Self {
        Self {
            root: Some(root.into()),
        }
    }

    fn resolve(&self, path: &str) -> PathBuf {
        match &self.root {
            Some(root) => root.join(path.trim_start_matches('/')),
            None => PathBuf::from(path),
        }
    }
}

struct StdFile {
    file: File,
    size: u64,
}

impl StorageFile for StdFile {
    fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        self.file
            .read(buf)
            .map_err(|e| AudioError::ReadFailed(e.to_string()))
    }

    fn seek(&mut self, offset: u64) -> Result<()> {
        self.file
            .seek(SeekFrom::Start(offset))
            .map(|_| ())
            .map_err(|e| AudioError::ReadFailed(e.to_string()))
    }

    fn size(&self) -> u64 {
        self.size
    }
}

impl Storage for StdStorage {
    fn open(&self, path: &str) -> Result<Box<dyn StorageFile>> {
        let resolved = self.resolve(path);
        let file = File::open(&resolved)
            .map_err(|e| AudioError::OpenFailed(format!("{}: {}", resolved.display(), e)))?;
        let size = file
            .metadata()
            .map_err(|e| AudioError::OpenFailed(format!("{}: {}", resolved.display(), e)))?
            .len();
        Ok(Box::new(StdFile { file, size }))
    }
}

/// In-memory prompt bank standing in for embedded flash
#[derive(Default)]
pub struct MemoryStorage {
    files: RwLock<HashMap<String, Arc<[u8]>>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, path: impl Into<String>, data: impl Into<Arc<[u8]>>) {
        self.files.write().insert(path.into(), data.into());
    }

    pub fn contains(&self, path: &str) -> bool {
        self.files.read().contains_key(path)
    }
}

struct MemoryFile {
    data: Arc<[u8]>,
    pos: usize,
}

impl StorageFile for MemoryFile {
    fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        let len = buf.len().min(self.data.len().saturating_sub(self.pos));
        buf[..len].copy_from_slice(&self.data[self.pos..self.pos + len]);
        self.pos += len;
        Ok(len)
    }

    fn seek(&mut self, offset: u64) -> Result<()> {
        if offset > self.data.len() as u64 {
            return Err(AudioError::ReadFailed(format!(
                "seek to {} past end {}",
                offset,
                self.data.len()
            )));
        }
        self.pos = offset as usize;
        Ok(())
    }

    fn size(&self) -> u64 {
        self.data.len() as u64
    }
}

impl Storage for MemoryStorage {
    fn open(&self, path: &str) -> Result<Box<dyn StorageFile>> {
        let data = self
            .files
            .read()
            .get(path)
            .cloned()
            .ok_or_else(|| AudioError::OpenFailed(format!("no prompt named {}", path)))?;
        Ok(Box::new(MemoryFile { data, pos: 0 }))
    }
}
