// PCM byte ring buffer between the decoder and the audio sink

use parking_lot::Mutex;
use std::sync::Arc;
use thiserror::Error;

/// Largest capacity a ring may be rounded up to
pub const MAX_CAPACITY: usize = 0x8000_0000;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CapacityError {
    #[error("ring buffer capacity must be non-zero")]
    Zero,
    #[error("ring buffer capacity {0} exceeds {MAX_CAPACITY}")]
    TooLarge(usize),
}

/// Fixed-capacity circular byte buffer.
///
/// Capacity is a power of two so positions are masked instead of wrapped.
/// `write` and `read` are unwrapped cursors: the occupied length is always
/// `write - read`, computed with wrapping arithmetic.
pub struct ByteRingBuffer {
    buffer: Box<[u8]>,
    write: usize,
    read: usize,
}

impl ByteRingBuffer {
    pub fn new(size: usize) -> Result<Self, CapacityError> {
        if size == 0 {
            return Err(CapacityError::Zero);
        }
        if size > MAX_CAPACITY {
            return Err(CapacityError::TooLarge(size));
        }
        let capacity = size.next_power_of_two();

        Ok(Self {
            buffer: vec![0u8; capacity].into_boxed_slice(),
            write: 0,
            read: 0,
        })
    }

    #[inline]
    fn mask(&self) -> usize {
        self.buffer.len() - 1
    }

    /// Copy as much of `data` as fits; returns the number of bytes accepted.
    pub fn push(&mut self, data: &[u8]) -> usize {
        let to_write = data.len().min(self.free_count());
        if to_write == 0 {
            return 0;
        }

        let start = self.write & self.mask();
        let first_chunk = to_write.min(self.buffer.len() - start);
        let second_chunk = to_write - first_chunk;

        self.buffer[start..start + first_chunk].copy_from_slice(&data[..first_chunk]);
        self.buffer[..second_chunk].copy_from_slice(&data[first_chunk..to_write]);

        self.write = self.write.wrapping_add(to_write);
        to_write
    }

    /// Copy up to `output.len()` bytes out; returns the number of bytes read.
    pub fn pop(&mut self, output: &mut [u8]) -> usize {
        let to_read = output.len().min(self.count());
        if to_read == 0 {
            return 0;
        }

        let start = self.read & self.mask();
        let first_chunk = to_read.min(self.buffer.len() - start);
        let second_chunk = to_read - first_chunk;

        output[..first_chunk].copy_from_slice(&self.buffer[start..start + first_chunk]);
        output[first_chunk..to_read].copy_from_slice(&self.buffer[..second_chunk]);

        self.read = self.read.wrapping_add(to_read);
        to_read
    }

    pub fn count(&self) -> usize {
        self.write.wrapping_sub(self.read)
    }

    pub fn free_count(&self) -> usize {
        self.buffer.len() - self.count()
    }

    pub fn capacity(&self) -> usize {
        self.buffer.len()
    }

    pub fn clear(&mut self) {
        self.write = 0;
        self.read = 0;
    }
}

/// Thread-safe wrapper for ByteRingBuffer
#[derive(Clone)]
pub struct SharedRingBuffer {
    inner: Arc<Mutex<ByteRingBuffer>>,
}

impl SharedRingBuffer {
    pub fn new(size: usize) -> Result<Self, CapacityError> {
        Ok(Self {
            inner: Arc::new(Mutex::new(ByteRingBuffer::new(size)?)),
        })
    }

    pub fn push(&self, data: &[u8]) -> usize {
        self.inner.lock().push(data)
    }

    pub fn pop(&self, output: &mut [u8]) -> usize {
        self.inner.lock().pop(output)
    }

    pub fn count(&self) -> usize {
        self.inner.lock().count()
    }

    pub fn free_count(&self) -> usize {
        self.inner.lock().free_count()
    }

    /// Occupied and free length from a single lock
    pub fn levels(&self) -> (usize, usize) {
        let ring = self.inner.lock();
        (ring.count(), ring.free_count())
    }

    pub fn capacity(&self) -> usize {
        self.inner.lock().capacity()
    }

    pub fn clear(&self) {
        self.inner.lock().clear()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn pattern(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i * 7 % 251) as u8).collect()
    }

    #[rstest]
    #[case(1, 1)]
    #[case(1000, 1024)]
    #[case(1024, 1024)]
    #[case(1025, 2048)]
    #[case(32 * 1024, 32 * 1024)]
    fn test_capacity_rounds_up(#[case] requested: usize, #[case] expected: usize) {
        let ring = ByteRingBuffer::new(requested).unwrap();
        assert_eq!(ring.capacity(), expected);
        assert_eq!(ring.free_count(), expected);
    }

    #[test]
    fn test_capacity_errors() {
        assert_eq!(ByteRingBuffer::new(0).err(), Some(CapacityError::Zero));
        assert_eq!(
            ByteRingBuffer::new(MAX_CAPACITY + 1).err(),
            Some(CapacityError::TooLarge(MAX_CAPACITY + 1))
        );
    }

    #[test]
    fn test_partial_push_and_pop() {
        let mut ring = ByteRingBuffer::new(8).unwrap();
        assert_eq!(ring.push(&pattern(12)), 8);
        assert_eq!(ring.free_count(), 0);
        assert_eq!(ring.push(&[1]), 0);

        let mut out = [0u8; 5];
        assert_eq!(ring.pop(&mut out), 5);
        assert_eq!(&out, &pattern(12)[..5]);
        assert_eq!(ring.count() + ring.free_count(), ring.capacity());

        let mut out = [0u8; 16];
        assert_eq!(ring.pop(&mut out), 3);
        assert_eq!(ring.pop(&mut out), 0);
    }

    #[test]
    fn test_wraparound_round_trip() {
        let mut ring = ByteRingBuffer::new(16).unwrap();
        let data = pattern(1000);
        let mut received = Vec::new();
        let mut sent = 0;
        let mut step = 0;

        while received.len() < data.len() {
            step += 1;
            let push_len = (step * 5) % 11 + 1;
            let end = (sent + push_len).min(data.len());
            sent += ring.push(&data[sent..end]);
            assert!(ring.count() <= ring.capacity());
            assert_eq!(ring.count() + ring.free_count(), ring.capacity());

            let mut out = vec![0u8; (step * 3) % 7 + 1];
            let n = ring.pop(&mut out);
            received.extend_from_slice(&out[..n]);
        }

        assert_eq!(received, data);
    }

    #[test]
    fn test_cursor_wrapping() {
        let mut ring = ByteRingBuffer::new(4).unwrap();
        ring.write = usize::MAX - 1;
        ring.read = usize::MAX - 1;

        assert_eq!(ring.push(&[1, 2, 3]), 3);
        assert_eq!(ring.count(), 3);
        let mut out = [0u8; 3];
        assert_eq!(ring.pop(&mut out), 3);
        assert_eq!(out, [1, 2, 3]);
        assert_eq!(ring.count(), 0);
    }

    #[test]
    fn test_shared_across_threads() {
        let ring = SharedRingBuffer::new(64).unwrap();
        let data = pattern(10_000);

        let producer = {
            let ring = ring.clone();
            let data = data.clone();
            std::thread::spawn(move || {
                let mut sent = 0;
                while sent < data.len() {
                    let end = (sent + 13).min(data.len());
                    sent += ring.push(&data[sent..end]);
                    std::thread::yield_now();
                }
            })
        };

        let mut received = Vec::new();
        let mut out = [0u8; 17];
        while received.len() < data.len() {
            let n = ring.pop(&mut out);
            received.extend_from_slice(&out[..n]);
            std::thread::yield_now();
        }
        producer.join().unwrap();
        assert_eq!(received, data);
    }
}
