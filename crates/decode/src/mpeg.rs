// MPEG audio frame decoder backed by symphonia
//
// Frame boundaries come from the 4-byte MPEG audio header; each frame is
// handed to symphonia's MP3 decoder as its own packet so the bit reservoir
// carries over between calls.

use crate::codec::{DecodedFrame, FrameDecoder, FrameError, FrameInfo};
use symphonia::core::audio::{Channels, SampleBuffer};
use symphonia::core::codecs::{CodecParameters, Decoder, DecoderOptions, CODEC_TYPE_MP3};
use symphonia::core::errors::Error as SymphoniaError;
use symphonia::core::formats::Packet;

const HEADER_LEN: usize = 4;
const ID3_HEADER_LEN: usize = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MpegVersion {
    V1,
    V2,
    V25,
}

// kbps, indexed by [row][bitrate index]
const BITRATES: [[u32; 15]; 5] = [
    // V1 layer I
    [0, 32, 64, 96, 128, 160, 192, 224, 256, 288, 320, 352, 384, 416, 448],
    // V1 layer II
    [0, 32, 48, 56, 64, 80, 96, 112, 128, 160, 192, 224, 256, 320, 384],
    // V1 layer III
    [0, 32, 40, 48, 56, 64, 80, 96, 112, 128, 160, 192, 224, 256, 320],
    // V2/V2.5 layer I
    [0, 32, 48, 56, 64, 80, 96, 112, 128, 144, 160, 176, 192, 224, 256],
    // V2/V2.5 layer II and III
    [0, 8, 16, 24, 32, 40, 48, 56, 64, 80, 96, 112, 128, 144, 160],
];

/// Parsed MPEG audio frame header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub version: MpegVersion,
    pub layer: u8,
    pub bit_rate: u32,
    pub sample_rate: u32,
    pub channels: u16,
    /// Whole frame, header included
    pub frame_len: usize,
    pub samples_per_frame: u32,
}

impl FrameHeader {
    /// Parse the header at the start of `bytes`. Free-format and reserved
    /// values are rejected.
    pub fn parse(bytes: &[u8]) -> Option<Self> {
        if bytes.len() < HEADER_LEN || bytes[0] != 0xFF || bytes[1] & 0xE0 != 0xE0 {
            return None;
        }

        let version = match (bytes[1] >> 3) & 0x03 {
            0 => MpegVersion::V25,
            2 => MpegVersion::V2,
            3 => MpegVersion::V1,
            _ => return None,
        };
        let layer = match (bytes[1] >> 1) & 0x03 {
            1 => 3,
            2 => 2,
            3 => 1,
            _ => return None,
        };

        let bitrate_index = (bytes[2] >> 4) as usize;
        if bitrate_index == 0 || bitrate_index == 15 {
            return None;
        }
        let row = match (version, layer) {
            (MpegVersion::V1, l) => (l - 1) as usize,
            (_, 1) => 3,
            _ => 4,
        };
        let bit_rate = BITRATES[row][bitrate_index] * 1000;

        let base_rate = match (bytes[2] >> 2) & 0x03 {
            0 => 44100,
            1 => 48000,
            2 => 32000,
            _ => return None,
        };
        let sample_rate = match version {
            MpegVersion::V1 => base_rate,
            MpegVersion::V2 => base_rate / 2,
            MpegVersion::V25 => base_rate / 4,
        };

        let padding = ((bytes[2] >> 1) & 0x01) as usize;
        let channels = if bytes[3] >> 6 == 3 { 1 } else { 2 };

        let (frame_len, samples_per_frame) = match (layer, version) {
            (1, _) => (((12 * bit_rate / sample_rate) as usize + padding) * 4, 384),
            (2, _) | (3, MpegVersion::V1) => {
                ((144 * bit_rate / sample_rate) as usize + padding, 1152)
            }
            _ => ((72 * bit_rate / sample_rate) as usize + padding, 576),
        };

        Some(Self {
            version,
            layer,
            bit_rate,
            sample_rate,
            channels,
            frame_len,
            samples_per_frame,
        })
    }
}

/// Offset of the first parseable header at or after `from`
fn find_sync(input: &[u8], from: usize) -> Option<usize> {
    (from..input.len().saturating_sub(HEADER_LEN - 1)).find(|&i| FrameHeader::parse(&input[i..]).is_some())
}

/// Size of an ID3v2 tag at the start of `input`, including header and footer
pub fn id3v2_size(input: &[u8]) -> Option<usize> {
    if input.len() < ID3_HEADER_LEN || &input[..3] != b"ID3" {
        return None;
    }
    if input[3] == 0xFF || input[4] == 0xFF || input[6..10].iter().any(|b| b & 0x80 != 0) {
        return None;
    }
    let size = input[6..10]
        .iter()
        .fold(0usize, |acc, b| (acc << 7) | *b as usize);
    let footer = if input[5] & 0x10 != 0 { ID3_HEADER_LEN } else { 0 };
    Some(ID3_HEADER_LEN + size + footer)
}

/// MPEG-1/2/2.5 layer III decoder
pub struct MpegFrameDecoder {
    decoder: Option<Box<dyn Decoder>>,
    /// (sample rate, channels) the decoder was built for
    params: Option<(u32, u16)>,
    ts: u64,
}

impl MpegFrameDecoder {
    pub fn new() -> Self {
        Self {
            decoder: None,
            params: None,
            ts: 0,
        }
    }

    fn decoder_for(&mut self, header: &FrameHeader) -> Result<&mut Box<dyn Decoder>, FrameError> {
        let wanted = (header.sample_rate, header.channels);
        if self.params != Some(wanted) {
            self.decoder = None;
        }

        if self.decoder.is_none() {
            let channels = if header.channels == 1 {
                Channels::FRONT_CENTRE
            } else {
                Channels::FRONT_LEFT | Channels::FRONT_RIGHT
            };
            let mut params = CodecParameters::new();
            params
                .for_codec(CODEC_TYPE_MP3)
                .with_sample_rate(header.sample_rate)
                .with_channels(channels);

            let decoder = symphonia::default::get_codecs()
                .make(&params, &DecoderOptions::default())
                .map_err(|e| FrameError::Fatal(format!("Failed to create decoder: {}", e)))?;
            log::debug!(
                "[decoder] mp3 decoder for {} Hz, {} ch",
                header.sample_rate,
                header.channels
            );
            self.decoder = Some(decoder);
            self.params = Some(wanted);
        }

        self.decoder
            .as_mut()
            .ok_or_else(|| FrameError::Fatal("decoder unavailable".to_string()))
    }
}

impl Default for MpegFrameDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameDecoder for MpegFrameDecoder {
    fn decode_frame(&mut self, input: &[u8]) -> Result<DecodedFrame, FrameError> {
        if input.len() < HEADER_LEN {
            return Err(FrameError::NeedMoreData);
        }

        let Some(header) = FrameHeader::parse(input) else {
            let consumed = find_sync(input, 1).unwrap_or(input.len() - (HEADER_LEN - 1));
            return Err(FrameError::LostSync { consumed });
        };

        if header.layer != 3 {
            return Err(FrameError::Recoverable {
                consumed: header.frame_len.max(1),
                reason: format!("layer {} is not supported", header.layer),
            });
        }
        if input.len() < header.frame_len {
            return Err(FrameError::NeedMoreData);
        }

        let frame = &input[..header.frame_len];
        let packet = Packet::new_from_slice(0, self.ts, header.samples_per_frame as u64, frame);
        self.ts += header.samples_per_frame as u64;

        let decoder = self.decoder_for(&header)?;
        let decoded = match decoder.decode(&packet) {
            Ok(decoded) => decoded,
            Err(SymphoniaError::ResetRequired) => {
                self.decoder = None;
                return Err(FrameError::Recoverable {
                    consumed: header.frame_len,
                    reason: "decoder reset required".to_string(),
                });
            }
            Err(SymphoniaError::Unsupported(what)) => {
                return Err(FrameError::Fatal(format!("unsupported stream: {}", what)));
            }
            Err(e) => {
                return Err(FrameError::Recoverable {
                    consumed: header.frame_len,
                    reason: e.to_string(),
                });
            }
        };

        let spec = *decoded.spec();
        let mut samples = SampleBuffer::<i16>::new(decoded.capacity() as u64, spec);
        samples.copy_interleaved_ref(decoded);

        Ok(DecodedFrame {
            consumed: header.frame_len,
            pcm: samples.samples().to_vec(),
            info: FrameInfo {
                sample_rate: spec.rate,
                channels: spec.channels.count() as u16,
                bit_rate: header.bit_rate,
            },
        })
    }

    fn probe_tag_size(&self, input: &[u8]) -> Option<usize> {
        id3v2_size(input)
    }

    fn reset(&mut self) {
        if let Some(decoder) = self.decoder.as_mut() {
            decoder.reset();
        }
        self.ts = 0;
    }
}
