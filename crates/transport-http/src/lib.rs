// HTTP transport for streaming audio

pub mod client;
pub mod download;
pub mod range;

pub use client::{HttpClient, HttpError, Request, Response, ResponseHead, UreqClient};
pub use download::{DownloadError, DownloadSession, DownloadState, RangeSupport, WaitError};
pub use range::ContentRange;
