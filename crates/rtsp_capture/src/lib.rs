//! On-demand snapshots of live RTSP streams over HTTP.
//!
//! Every configured stream gets a [`StreamReader`] that keeps decoding frames
//! on its own thread and caches only the latest one. The HTTP endpoint
//! `GET /capture/{stream_name}` encodes that cached frame as JPEG, so a
//! request never waits on the camera.

pub mod config;
pub mod decoder;
pub mod frame;
#[cfg(feature = "gstreamer")]
pub mod gst_source;
pub mod http_server;
pub mod reader;
pub mod registry;

pub use config::{CaptureConfig, Config, ConfigError, ServerConfig};
pub use decoder::{DecodeError, VideoSource};
pub use frame::{Frame, FrameError};
#[cfg(feature = "gstreamer")]
pub use gst_source::GstVideoSource;
pub use http_server::{create_router, run_http_server, AppState, CaptureError};
pub use reader::{ReaderError, ReaderOptions, StreamReader, StreamStats, StreamStatus};
pub use registry::{RegistryError, StreamRegistry};
