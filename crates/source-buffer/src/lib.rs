// Chunked byte queue that bridges the HTTP download to the decoder input

use chime_core::StreamBufferConfig;
use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;

/// Push rejected because it would exceed the buffer capacity
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("stream buffer overflow: {requested} bytes requested, {free} free")]
pub struct OverflowError {
    pub requested: usize,
    pub free: usize,
}

struct Chunk {
    data: Box<[u8]>,
    begin: usize,
    end: usize,
}

impl Chunk {
    fn new(size: usize) -> Self {
        Self {
            data: vec![0u8; size].into_boxed_slice(),
            begin: 0,
            end: 0,
        }
    }

    fn len(&self) -> usize {
        self.end - self.begin
    }

    fn spare(&self) -> usize {
        self.data.len() - self.end
    }
}

/// Bounded FIFO of bytes stored in fixed-size chunks.
///
/// Chunks are allocated when a push needs room and released as soon as a pop
/// drains them, so an idle stream holds no memory. A push is all or nothing.
pub struct StreamBuffer {
    chunks: VecDeque<Chunk>,
    chunk_size: usize,
    capacity: usize,
    count: usize,
}

impl StreamBuffer {
    pub fn new(config: StreamBufferConfig) -> Self {
        Self {
            chunks: VecDeque::new(),
            chunk_size: config.chunk_size.max(1),
            capacity: config.capacity,
            count: 0,
        }
    }

    /// Append all of `data`, or nothing if it does not fit.
    pub fn push(&mut self, data: &[u8]) -> Result<usize, OverflowError> {
        if data.len() > self.free_count() {
            return Err(OverflowError {
                requested: data.len(),
                free: self.free_count(),
            });
        }

        let mut written = 0;
        while written < data.len() {
            if self.chunks.back().map_or(true, |chunk| chunk.spare() == 0) {
                self.chunks.push_back(Chunk::new(self.chunk_size));
            }
            let Some(tail) = self.chunks.back_mut() else {
                break;
            };
            let n = tail.spare().min(data.len() - written);
            tail.data[tail.end..tail.end + n].copy_from_slice(&data[written..written + n]);
            tail.end += n;
            written += n;
        }

        self.count += written;
        Ok(written)
    }

    /// Move up to `output.len()` bytes out, front first.
    pub fn pop(&mut self, output: &mut [u8]) -> usize {
        self.take(output.len(), Some(output))
    }

    /// Drop up to `len` bytes from the front.
    pub fn discard(&mut self, len: usize) -> usize {
        self.take(len, None)
    }

    fn take(&mut self, len: usize, mut output: Option<&mut [u8]>) -> usize {
        let mut read = 0;
        while read < len {
            let Some(head) = self.chunks.front_mut() else {
                break;
            };
            let n = head.len().min(len - read);
            if let Some(out) = output.as_deref_mut() {
                out[read..read + n].copy_from_slice(&head.data[head.begin..head.begin + n]);
            }
            head.begin += n;
            read += n;

            if head.len() == 0 {
                self.chunks.pop_front();
            }
        }

        self.count -= read;
        read
    }

    pub fn count(&self) -> usize {
        self.count
    }

    pub fn free_count(&self) -> usize {
        self.capacity - self.count
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    /// Chunks currently allocated
    pub fn chunk_count(&self) -> usize {
        self.chunks.len()
    }

    pub fn clear(&mut self) {
        self.chunks.clear();
        self.count = 0;
    }
}

struct Shared {
    buffer: Mutex<StreamBuffer>,
    data_ready: Condvar,
}

/// Thread-safe StreamBuffer handle shared by one producer and one consumer
#[derive(Clone)]
pub struct SharedStreamBuffer {
    inner: Arc<Shared>,
}

impl SharedStreamBuffer {
    pub fn new(config: StreamBufferConfig) -> Self {
        Self {
            inner: Arc::new(Shared {
                buffer: Mutex::new(StreamBuffer::new(config)),
                data_ready: Condvar::new(),
            }),
        }
    }

    pub fn push(&self, data: &[u8]) -> Result<usize, OverflowError> {
        let written = self.inner.buffer.lock().push(data)?;
        self.inner.data_ready.notify_all();
        Ok(written)
    }

    pub fn pop(&self, output: &mut [u8]) -> usize {
        self.inner.buffer.lock().pop(output)
    }

    pub fn discard(&self, len: usize) -> usize {
        self.inner.buffer.lock().discard(len)
    }

    pub fn count(&self) -> usize {
        self.inner.buffer.lock().count()
    }

    pub fn free_count(&self) -> usize {
        self.inner.buffer.lock().free_count()
    }

    pub fn capacity(&self) -> usize {
        self.inner.buffer.lock().capacity()
    }

    pub fn chunk_count(&self) -> usize {
        self.inner.buffer.lock().chunk_count()
    }

    pub fn clear(&self) {
        self.inner.buffer.lock().clear();
        log::debug!("[stream-buffer] cleared");
    }

    /// Wake consumers blocked in `wait_for_count` so they re-check producer state.
    pub fn notify(&self) {
        self.inner.data_ready.notify_all();
    }

    /// Block until at least `size` bytes are buffered, a `notify` arrives, or
    /// `timeout` passes. Returns whether `size` bytes are available.
    pub fn wait_for_count(&self, size: usize, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut buffer = self.inner.buffer.lock();
        if buffer.count() >= size {
            return true;
        }
        let now = Instant::now();
        if now < deadline {
            self.inner.data_ready.wait_for(&mut buffer, deadline - now);
        }
        buffer.count() >= size
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn small() -> StreamBufferConfig {
        StreamBufferConfig {
            chunk_size: 16,
            capacity: 64,
        }
    }

    fn pattern(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i % 253) as u8).collect()
    }

    #[test]
    fn test_push_spans_chunks() {
        let mut buffer = StreamBuffer::new(small());
        assert_eq!(buffer.push(&pattern(40)), Ok(40));
        assert_eq!(buffer.chunk_count(), 3);
        assert_eq!(buffer.count(), 40);
        assert_eq!(buffer.free_count(), 24);
    }

    #[test]
    fn test_overflow_is_atomic() {
        let mut buffer = StreamBuffer::new(small());
        buffer.push(&pattern(60)).unwrap();

        let err = buffer.push(&pattern(5)).unwrap_err();
        assert_eq!(err, OverflowError { requested: 5, free: 4 });
        assert_eq!(buffer.count(), 60);

        assert_eq!(buffer.push(&pattern(4)), Ok(4));
        assert_eq!(buffer.free_count(), 0);
    }

    #[test]
    fn test_pop_frees_drained_chunks() {
        let mut buffer = StreamBuffer::new(small());
        let data = pattern(40);
        buffer.push(&data).unwrap();

        let mut out = [0u8; 20];
        assert_eq!(buffer.pop(&mut out), 20);
        assert_eq!(&out[..], &data[..20]);
        assert_eq!(buffer.chunk_count(), 2);

        let mut out = [0u8; 100];
        assert_eq!(buffer.pop(&mut out), 20);
        assert_eq!(&out[..20], &data[20..]);
        assert_eq!(buffer.chunk_count(), 0);
        assert_eq!(buffer.pop(&mut out), 0);
    }

    #[test]
    fn test_discard() {
        let mut buffer = StreamBuffer::new(small());
        buffer.push(&pattern(30)).unwrap();
        assert_eq!(buffer.discard(18), 18);
        let mut out = [0u8; 1];
        buffer.pop(&mut out);
        assert_eq!(out[0], 18);
        assert_eq!(buffer.discard(100), 11);
    }

    #[rstest]
    #[case(1, 1)]
    #[case(3, 7)]
    #[case(16, 16)]
    #[case(17, 5)]
    #[case(64, 33)]
    fn test_round_trip(#[case] push_size: usize, #[case] pop_size: usize) {
        let mut buffer = StreamBuffer::new(small());
        let data = pattern(500);
        let mut received = Vec::new();
        let mut sent = 0;

        while received.len() < data.len() {
            let end = (sent + push_size).min(data.len());
            if sent < end && buffer.push(&data[sent..end]).is_ok() {
                sent = end;
            }
            assert!(buffer.count() <= buffer.capacity());

            let mut out = vec![0u8; pop_size];
            let n = buffer.pop(&mut out);
            received.extend_from_slice(&out[..n]);
        }

        assert_eq!(received, data);
    }

    #[test]
    fn test_clear_releases_chunks() {
        let mut buffer = StreamBuffer::new(small());
        buffer.push(&pattern(50)).unwrap();
        buffer.clear();
        assert_eq!(buffer.count(), 0);
        assert_eq!(buffer.chunk_count(), 0);
        assert_eq!(buffer.free_count(), 64);
    }

    #[test]
    fn test_wait_for_count_wakes_on_push() {
        let shared = SharedStreamBuffer::new(small());
        let producer = {
            let shared = shared.clone();
            std::thread::spawn(move || {
                std::thread::sleep(Duration::from_millis(20));
                shared.push(&pattern(10)).unwrap();
            })
        };

        assert!(shared.wait_for_count(10, Duration::from_secs(5)));
        producer.join().unwrap();
        assert!(!shared.wait_for_count(11, Duration::from_millis(10)));
    }
}
