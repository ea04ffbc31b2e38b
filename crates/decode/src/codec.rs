// Frame-at-a-time codec collaborator

use thiserror::Error;

/// Stream parameters reported with every decoded frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameInfo {
    pub sample_rate: u32,
    pub channels: u16,
    /// Bits per second
    pub bit_rate: u32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DecodedFrame {
    /// Input bytes the frame occupied
    pub consumed: usize,
    /// Interleaved samples
    pub pcm: Vec<i16>,
    pub info: FrameInfo,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FrameError {
    /// The input does not hold a whole frame yet
    #[error("need more data")]
    NeedMoreData,
    /// The frame was bad; skip `consumed` bytes and carry on
    #[error("bad frame ({reason}), skipping {consumed} bytes")]
    Recoverable { consumed: usize, reason: String },
    /// No frame header at the start; the next candidate is `consumed` bytes in
    #[error("lost sync, skipping {consumed} bytes")]
    LostSync { consumed: usize },
    /// The stream cannot be decoded at all
    #[error("{0}")]
    Fatal(String),
}

/// Decodes one compressed frame per call.
pub trait FrameDecoder: Send {
    /// Decode the frame at the start of `input`.
    fn decode_frame(&mut self, input: &[u8]) -> Result<DecodedFrame, FrameError>;

    /// Size of a metadata tag at the start of `input`, header included.
    fn probe_tag_size(&self, input: &[u8]) -> Option<usize>;

    /// Forget inter-frame state before a new stream.
    fn reset(&mut self);
}
