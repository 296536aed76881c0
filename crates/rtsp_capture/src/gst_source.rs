use crate::decoder::{DecodeError, VideoSource};
use crate::frame::Frame;
use gstreamer::prelude::*;
use std::time::{Duration, Instant};

/// RTSP video source backed by a GStreamer pipeline.
///
/// Pipeline:
/// ```text
/// rtspsrc ! decodebin ! videoconvert ! video/x-raw,format=RGB ! appsink
/// ```
///
/// The appsink keeps a single buffer and drops older ones, so `read` always
/// yields the freshest decoded frame rather than draining a backlog.
///
/// `open` only succeeds once the first frame has been decoded, since
/// `rtspsrc` connects asynchronously and reports failures on the bus.
pub struct GstVideoSource {
    latency_ms: u32,
    read_timeout: Duration,
    pipeline: Option<gstreamer::Pipeline>,
    sink: Option<gstreamer_app::AppSink>,
    /// First sample, pulled by `open` and handed out by the next `read`
    pending: Option<gstreamer::Sample>,
    sequence: u64,
}

/// Slice of the open timeout spent blocked on the appsink between bus checks
const OPEN_POLL: Duration = Duration::from_millis(100);

impl GstVideoSource {
    pub fn new(latency_ms: u32, read_timeout: Duration) -> Result<Self, DecodeError> {
        if !gstreamer::INITIALIZED.load(std::sync::atomic::Ordering::Relaxed) {
            gstreamer::init()?;
        }

        Ok(Self {
            latency_ms,
            read_timeout,
            pipeline: None,
            sink: None,
            pending: None,
            sequence: 0,
        })
    }

    fn timeout(&self) -> gstreamer::ClockTime {
        clock_time(self.read_timeout)
    }

    fn build_pipeline(
        &self,
        url: &str,
    ) -> Result<(gstreamer::Pipeline, gstreamer_app::AppSink), DecodeError> {
        let latency = self.latency_ms;
        let pipeline_desc = format!(
            "rtspsrc location={url} latency={latency} ! \
             decodebin ! \
             videoconvert ! \
             video/x-raw,format=RGB ! \
             appsink name=sink max-buffers=1 drop=true sync=false"
        );

        log::debug!("Creating pipeline: {}", pipeline_desc);

        let pipeline = gstreamer::parse::launch(&pipeline_desc)?
            .dynamic_cast::<gstreamer::Pipeline>()
            .map_err(|_| DecodeError::Read("failed to downcast pipeline".to_string()))?;

        let sink = pipeline
            .by_name("sink")
            .ok_or_else(|| DecodeError::Read("appsink element not found".to_string()))?
            .dynamic_cast::<gstreamer_app::AppSink>()
            .map_err(|_| DecodeError::Read("failed to downcast appsink".to_string()))?;

        Ok((pipeline, sink))
    }

    fn sample_to_frame(&mut self, sample: gstreamer::Sample) -> Result<Frame, DecodeError> {
        let caps = sample
            .caps()
            .ok_or_else(|| DecodeError::Read("sample has no caps".to_string()))?;
        let info = gstreamer_video::VideoInfo::from_caps(caps)
            .map_err(|e| DecodeError::Read(format!("unsupported caps: {}", e)))?;

        let buffer = sample
            .buffer()
            .ok_or_else(|| DecodeError::Read("sample has no buffer".to_string()))?;
        let map = buffer
            .map_readable()
            .map_err(|_| DecodeError::Read("failed to map buffer".to_string()))?;

        // videoconvert pads RGB rows to 4-byte alignment
        let frame = Frame::from_strided(
            map.as_slice(),
            info.width(),
            info.height(),
            info.stride()[0],
            self.sequence,
        )?;
        self.sequence = self.sequence.wrapping_add(1);
        Ok(frame)
    }

    /// Wait for the first decoded sample of a freshly started pipeline.
    fn wait_first_sample(
        &self,
        pipeline: &gstreamer::Pipeline,
        sink: &gstreamer_app::AppSink,
    ) -> Result<gstreamer::Sample, String> {
        let deadline = Instant::now() + self.read_timeout;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if let Some(sample) = sink.try_pull_sample(clock_time(remaining.min(OPEN_POLL))) {
                return Ok(sample);
            }
            if let Some(reason) = bus_error(pipeline) {
                return Err(reason);
            }
            if sink.is_eos() {
                return Err("stream ended before the first frame".to_string());
            }
            if remaining.is_zero() {
                return Err(format!("no frame within {:?}", self.read_timeout));
            }
        }
    }
}

fn clock_time(duration: Duration) -> gstreamer::ClockTime {
    gstreamer::ClockTime::from_mseconds(u64::try_from(duration.as_millis()).unwrap_or(u64::MAX))
}

/// Drain the bus for an error message posted by any pipeline element.
fn bus_error(pipeline: &gstreamer::Pipeline) -> Option<String> {
    let bus = pipeline.bus()?;
    let msg = bus.pop_filtered(&[gstreamer::MessageType::Error])?;
    match msg.view() {
        gstreamer::MessageView::Error(err) => Some(match err.debug() {
            Some(debug) => format!("{} ({})", err.error(), debug),
            None => err.error().to_string(),
        }),
        _ => None,
    }
}

impl VideoSource for GstVideoSource {
    fn open(&mut self, url: &str) -> Result<(), DecodeError> {
        self.release();

        let (pipeline, sink) = self.build_pipeline(url)?;

        // rtspsrc is live: Playing returns NoPreroll at once and the connection
        // is only known to work once a frame comes out of the appsink
        let started = pipeline
            .set_state(gstreamer::State::Playing)
            .map_err(|e| e.to_string())
            .and_then(|_| self.wait_first_sample(&pipeline, &sink));

        match started {
            Ok(sample) => {
                self.pipeline = Some(pipeline);
                self.sink = Some(sink);
                self.pending = Some(sample);
                Ok(())
            }
            Err(reason) => {
                let _ = pipeline.set_state(gstreamer::State::Null);
                Err(DecodeError::Open {
                    url: url.to_string(),
                    reason,
                })
            }
        }
    }

    fn is_opened(&self) -> bool {
        self.pipeline.is_some()
    }

    fn read(&mut self) -> Result<Frame, DecodeError> {
        let sink = self.sink.as_ref().ok_or(DecodeError::NotOpened)?;
        if let Some(sample) = self.pending.take() {
            return self.sample_to_frame(sample);
        }

        let sample = match sink.try_pull_sample(self.timeout()) {
            Some(sample) => sample,
            None if sink.is_eos() => return Err(DecodeError::EndOfStream),
            None => {
                let pending_error = self.pipeline.as_ref().and_then(bus_error);
                return Err(match pending_error {
                    Some(reason) => DecodeError::Read(reason),
                    None => DecodeError::Timeout,
                });
            }
        };

        self.sample_to_frame(sample)
    }

    fn release(&mut self) {
        self.pending = None;
        self.sink = None;
        if let Some(pipeline) = self.pipeline.take() {
            let _ = pipeline.send_event(gstreamer::event::Eos::new());
            if let Err(e) = pipeline.set_state(gstreamer::State::Null) {
                log::warn!("Failed to stop GStreamer pipeline: {}", e);
            }
        }
    }
}

impl Drop for GstVideoSource {
    fn drop(&mut self) {
        self.release();
    }
}
