//! Per-stream capture loop and its single-slot frame cache.
//!
//! One [`StreamReader`] owns one [`VideoSource`]. After [`StreamReader::start`]
//! the source is moved into a dedicated OS thread that keeps decoding frames
//! and replaces the cached frame after every successful read. HTTP handlers
//! call [`StreamReader::get_frame`], which only takes the per-reader lock and
//! clones an `Arc`, so it never waits on the network.
//!
//! Failure policy: any open or read failure is logged, followed by a fixed
//! wait and a reconnect. Retries never stop while the reader is running and
//! the cached frame is never cleared.

use crate::decoder::VideoSource;
use crate::frame::Frame;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use thiserror::Error;

/// Errors returned by [`StreamReader::start`]
#[derive(Debug, Error)]
pub enum ReaderError {
    #[error("stream '{0}' is already running")]
    AlreadyRunning(String),
    #[error("stream '{0}' was stopped and its decoder released")]
    DecoderReleased(String),
    #[error("failed to spawn capture thread: {0}")]
    Spawn(#[from] std::io::Error),
}

/// Lifecycle state of a capture loop
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamStatus {
    /// Constructed, not started
    Idle = 0,
    /// Started, first connection attempt pending
    Connecting = 1,
    /// Frames are being decoded
    Streaming = 2,
    /// Connection lost, waiting to reopen
    Reconnecting = 3,
    /// Stopped, decoder released
    Stopped = 4,
}

impl StreamStatus {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => StreamStatus::Connecting,
            2 => StreamStatus::Streaming,
            3 => StreamStatus::Reconnecting,
            4 => StreamStatus::Stopped,
            _ => StreamStatus::Idle,
        }
    }
}

/// Counters accumulated by the capture loop
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StreamStats {
    pub frames_captured: u64,
    pub read_failures: u64,
    pub open_failures: u64,
    pub reconnects: u64,
}

/// Tunables for a single reader
#[derive(Debug, Clone, Copy)]
pub struct ReaderOptions {
    /// Fixed wait after a failed open or read
    pub reconnect_interval: Duration,
}

impl Default for ReaderOptions {
    fn default() -> Self {
        Self {
            reconnect_interval: Duration::from_secs(1),
        }
    }
}

/// State shared between the reader and its capture thread
struct Shared {
    name: String,
    source: String,
    latest: Mutex<Option<Arc<Frame>>>,
    running: AtomicBool,
    status: AtomicU8,
    frames_captured: AtomicU64,
    read_failures: AtomicU64,
    open_failures: AtomicU64,
    reconnects: AtomicU64,
}

impl Shared {
    fn set_status(&self, status: StreamStatus) {
        self.status.store(status as u8, Ordering::Release);
    }

    fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    fn store_frame(&self, frame: Frame) {
        let frame = Arc::new(frame);
        *lock(&self.latest) = Some(frame);
    }
}

/// A poisoned lock only means another thread panicked mid-replace of an
/// `Option<Arc<_>>`, which can not leave a torn value behind.
fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Keeps the most recent decoded frame of one stream
pub struct StreamReader {
    shared: Arc<Shared>,
    options: ReaderOptions,
    decoder: Mutex<Option<Box<dyn VideoSource>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl StreamReader {
    pub fn new(
        name: impl Into<String>,
        source: impl Into<String>,
        decoder: Box<dyn VideoSource>,
        options: ReaderOptions,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                name: name.into(),
                source: source.into(),
                latest: Mutex::new(None),
                running: AtomicBool::new(false),
                status: AtomicU8::new(StreamStatus::Idle as u8),
                frames_captured: AtomicU64::new(0),
                read_failures: AtomicU64::new(0),
                open_failures: AtomicU64::new(0),
                reconnects: AtomicU64::new(0),
            }),
            options,
            decoder: Mutex::new(Some(decoder)),
            worker: Mutex::new(None),
        }
    }

    pub fn name(&self) -> &str {
        &self.shared.name
    }

    pub fn source(&self) -> &str {
        &self.shared.source
    }

    /// Spawn the capture thread and return immediately.
    ///
    /// The first connection attempt happens on the capture thread, so a
    /// source that is down does not delay startup.
    pub fn start(&self) -> Result<(), ReaderError> {
        let mut worker = lock(&self.worker);
        if worker.is_some() {
            return Err(ReaderError::AlreadyRunning(self.shared.name.clone()));
        }

        let decoder = lock(&self.decoder)
            .take()
            .ok_or_else(|| ReaderError::DecoderReleased(self.shared.name.clone()))?;

        self.shared.running.store(true, Ordering::Release);
        self.shared.set_status(StreamStatus::Connecting);

        let shared = self.shared.clone();
        let interval = self.options.reconnect_interval;
        let spawned = std::thread::Builder::new()
            .name(format!("capture-{}", self.shared.name))
            .spawn(move || capture_loop(shared, decoder, interval));

        match spawned {
            Ok(handle) => {
                *worker = Some(handle);
                Ok(())
            }
            Err(e) => {
                // The closure, and the decoder inside it, were dropped by the failed spawn
                self.shared.running.store(false, Ordering::Release);
                self.shared.set_status(StreamStatus::Stopped);
                Err(ReaderError::Spawn(e))
            }
        }
    }

    /// Stop the capture loop and release the decoder.
    ///
    /// Blocks until the capture thread exits, which can take up to the
    /// decoder's own read timeout. Safe to call repeatedly and on a reader
    /// that was never started.
    pub fn stop(&self) {
        // Serialized with `start` on the worker lock: once it is released here,
        // a concurrent `start` sees no decoder and can not respawn the loop
        let (handle, decoder) = {
            let mut worker = lock(&self.worker);
            self.shared.running.store(false, Ordering::Release);
            (worker.take(), lock(&self.decoder).take())
        };
        let mut stopped_something = false;

        if let Some(handle) = handle {
            handle.thread().unpark();
            if handle.join().is_err() {
                log::error!("Capture thread for '{}' panicked", self.shared.name);
            }
            stopped_something = true;
        }

        // Never started: the decoder is still ours to release
        if let Some(mut decoder) = decoder {
            decoder.release();
            stopped_something = true;
        }

        self.shared.set_status(StreamStatus::Stopped);
        if stopped_something {
            log::info!("RTSP stream '{}' stopped", self.shared.name);
        }
    }

    /// Copy out the most recent frame, if any has been captured yet.
    pub fn get_frame(&self) -> Option<Arc<Frame>> {
        lock(&self.shared.latest).clone()
    }

    pub fn is_running(&self) -> bool {
        self.shared.is_running()
    }

    pub fn status(&self) -> StreamStatus {
        StreamStatus::from_u8(self.shared.status.load(Ordering::Acquire))
    }

    pub fn stats(&self) -> StreamStats {
        StreamStats {
            frames_captured: self.shared.frames_captured.load(Ordering::Relaxed),
            read_failures: self.shared.read_failures.load(Ordering::Relaxed),
            open_failures: self.shared.open_failures.load(Ordering::Relaxed),
            reconnects: self.shared.reconnects.load(Ordering::Relaxed),
        }
    }
}

impl Drop for StreamReader {
    fn drop(&mut self) {
        self.stop();
    }
}

fn capture_loop(shared: Arc<Shared>, mut decoder: Box<dyn VideoSource>, interval: Duration) {
    log::debug!("Capture loop for '{}' started", shared.name);
    let mut connected_once = false;

    while shared.is_running() {
        if !decoder.is_opened() {
            match decoder.open(&shared.source) {
                Ok(()) => {
                    if connected_once {
                        shared.reconnects.fetch_add(1, Ordering::Relaxed);
                        log::info!("RTSP stream '{}' reconnected", shared.name);
                    } else {
                        log::info!("RTSP stream '{}' opened", shared.name);
                    }
                    connected_once = true;
                }
                Err(e) => {
                    shared.open_failures.fetch_add(1, Ordering::Relaxed);
                    log::warn!(
                        "RTSP stream '{}' is not opened: {}. Retrying in {:?}",
                        shared.name,
                        e,
                        interval
                    );
                    backoff(&shared, interval);
                }
            }
            continue;
        }

        match decoder.read() {
            Ok(frame) => {
                log::trace!(
                    "RTSP stream '{}' frame #{} ({}x{})",
                    shared.name,
                    frame.sequence(),
                    frame.width(),
                    frame.height()
                );
                shared.store_frame(frame);
                shared.frames_captured.fetch_add(1, Ordering::Relaxed);
                shared.set_status(StreamStatus::Streaming);
            }
            Err(e) => {
                shared.set_status(StreamStatus::Reconnecting);
                shared.read_failures.fetch_add(1, Ordering::Relaxed);
                log::warn!(
                    "Failed to read frame from '{}': {}. Reconnecting in {:?}",
                    shared.name,
                    e,
                    interval
                );
                decoder.release();
                backoff(&shared, interval);
            }
        }
    }

    decoder.release();
    log::debug!("Capture loop for '{}' exited", shared.name);
}

/// Wait `interval`, returning early once the reader is stopped.
fn backoff(shared: &Shared, interval: Duration) {
    let deadline = Instant::now() + interval;
    while shared.is_running() {
        let now = Instant::now();
        if now >= deadline {
            break;
        }
        std::thread::park_timeout(deadline - now);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decoder::DecodeError;

    /// Never opens; counts calls.
    struct Unreachable {
        opens: Arc<AtomicU64>,
        releases: Arc<AtomicU64>,
    }

    impl VideoSource for Unreachable {
        fn open(&mut self, url: &str) -> Result<(), DecodeError> {
            self.opens.fetch_add(1, Ordering::SeqCst);
            Err(DecodeError::Open {
                url: url.to_string(),
                reason: "connection refused".to_string(),
            })
        }

        fn is_opened(&self) -> bool {
            false
        }

        fn read(&mut self) -> Result<Frame, DecodeError> {
            Err(DecodeError::NotOpened)
        }

        fn release(&mut self) {
            self.releases.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn unreachable_reader(interval: Duration) -> (StreamReader, Arc<AtomicU64>, Arc<AtomicU64>) {
        let opens = Arc::new(AtomicU64::new(0));
        let releases = Arc::new(AtomicU64::new(0));
        let reader = StreamReader::new(
            "cam",
            "rtsp://10.255.255.1/stream",
            Box::new(Unreachable {
                opens: opens.clone(),
                releases: releases.clone(),
            }),
            ReaderOptions {
                reconnect_interval: interval,
            },
        );
        (reader, opens, releases)
    }

    #[test]
    fn test_status_roundtrip() {
        for status in [
            StreamStatus::Idle,
            StreamStatus::Connecting,
            StreamStatus::Streaming,
            StreamStatus::Reconnecting,
            StreamStatus::Stopped,
        ] {
            assert_eq!(StreamStatus::from_u8(status as u8), status);
        }
    }

    #[test]
    fn test_stop_interrupts_backoff() {
        let (reader, opens, releases) = unreachable_reader(Duration::from_secs(60));
        reader.start().unwrap();

        let deadline = Instant::now() + Duration::from_secs(5);
        while opens.load(Ordering::SeqCst) == 0 && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(opens.load(Ordering::SeqCst), 1);

        // Without the unpark this would wait out the 60s backoff
        let started = Instant::now();
        reader.stop();
        assert!(started.elapsed() < Duration::from_secs(5));
        assert_eq!(releases.load(Ordering::SeqCst), 1);
        assert_eq!(reader.status(), StreamStatus::Stopped);
        assert!(reader.get_frame().is_none());
    }

    #[test]
    fn test_open_failures_are_counted_and_retried() {
        let (reader, opens, _) = unreachable_reader(Duration::from_millis(5));
        reader.start().unwrap();

        let deadline = Instant::now() + Duration::from_secs(5);
        while opens.load(Ordering::SeqCst) < 3 && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(5));
        }
        assert!(opens.load(Ordering::SeqCst) >= 3);
        assert!(reader.stats().open_failures >= 3);
        assert_eq!(reader.stats().frames_captured, 0);
        assert_eq!(reader.status(), StreamStatus::Connecting);
        reader.stop();
    }

    #[test]
    fn test_start_after_stop_is_rejected() {
        let (reader, _, _) = unreachable_reader(Duration::from_millis(5));
        reader.start().unwrap();
        assert!(matches!(
            reader.start(),
            Err(ReaderError::AlreadyRunning(_))
        ));
        reader.stop();
        assert!(matches!(
            reader.start(),
            Err(ReaderError::DecoderReleased(_))
        ));
    }
}
