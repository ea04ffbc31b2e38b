// Decoding pipeline: codec collaborator, decoder worker and supervisor

pub mod codec;
pub mod mpeg;
pub mod supervisor;
pub mod worker;

pub use codec::{DecodedFrame, FrameDecoder, FrameError, FrameInfo};
pub use mpeg::{FrameHeader, MpegFrameDecoder};
pub use supervisor::DecodeSupervisor;
pub use worker::{DecoderInput, DecoderState, Pulled};
