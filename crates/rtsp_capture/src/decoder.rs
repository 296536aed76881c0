//! Decoder capability boundary.
//!
//! A [`VideoSource`] is a blocking handle onto one network video source. The
//! capture loop is the only caller, always from its own thread, so
//! implementations are free to block inside [`VideoSource::open`] and
//! [`VideoSource::read`] up to their own timeouts.

use crate::frame::{Frame, FrameError};
use thiserror::Error;

/// Errors surfaced by a video source
#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("failed to open source: {reason}")]
    Open { url: String, reason: String },
    #[error("source is not opened")]
    NotOpened,
    #[error("timed out waiting for a frame")]
    Timeout,
    #[error("end of stream")]
    EndOfStream,
    #[error("read failed: {0}")]
    Read(String),
    #[error("invalid frame: {0}")]
    InvalidFrame(#[from] FrameError),
    #[cfg(feature = "gstreamer")]
    #[error("GStreamer error: {0}")]
    GStreamer(#[from] gstreamer::glib::Error),
}

/// Opaque handle for reading successive decoded frames from a live source.
///
/// Mirrors the open / read / release lifecycle of a capture device:
/// `open` may be called again after a failed read or after `release` to
/// reconnect.
pub trait VideoSource: Send + 'static {
    /// Connect to `url`. Any previously opened connection is dropped first.
    fn open(&mut self, url: &str) -> Result<(), DecodeError>;

    /// Whether the last `open` succeeded and the connection has not been released.
    fn is_opened(&self) -> bool;

    /// Block until the next decoded frame is available.
    fn read(&mut self) -> Result<Frame, DecodeError>;

    /// Drop the connection and free its resources. Must be idempotent.
    fn release(&mut self);
}
