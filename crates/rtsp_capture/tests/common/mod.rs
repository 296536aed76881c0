//! Test helpers: a scripted in-memory video source

#![allow(dead_code)]

use rtsp_capture::{DecodeError, Frame, VideoSource};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

/// One scripted outcome of `VideoSource::read`
#[derive(Debug, Clone)]
pub enum Step {
    /// Return a 2x2 frame with every byte set to this value
    Frame(u8),
    /// Fail with a read error
    Fail,
    /// Report end of stream
    EndOfStream,
    /// Block for the duration, then return a frame filled with the value
    Stall(Duration, u8),
}

#[derive(Default)]
struct ScriptState {
    open_results: VecDeque<bool>,
    reads: VecDeque<Step>,
    fallback: Option<Step>,
    refuse_opens: bool,
    opened: bool,
    opens: usize,
    reads_done: usize,
    releases: usize,
    sequence: u64,
}

/// Drives and observes a [`ScriptedSource`] from the test body
#[derive(Clone, Default)]
pub struct Script {
    state: Arc<Mutex<ScriptState>>,
}

impl Script {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue the result of the next `open` call. Unqueued opens succeed.
    pub fn push_open(&self, ok: bool) -> &Self {
        self.state.lock().unwrap().open_results.push_back(ok);
        self
    }

    pub fn push_read(&self, step: Step) -> &Self {
        self.state.lock().unwrap().reads.push_back(step);
        self
    }

    /// Step repeated once the queue is empty. Defaults to `Step::Fail`.
    pub fn set_fallback(&self, step: Step) -> &Self {
        self.state.lock().unwrap().fallback = Some(step);
        self
    }

    /// Make every `open` fail, overriding queued results
    pub fn refuse_opens(&self) -> &Self {
        self.state.lock().unwrap().refuse_opens = true;
        self
    }

    pub fn opens(&self) -> usize {
        self.state.lock().unwrap().opens
    }

    pub fn reads(&self) -> usize {
        self.state.lock().unwrap().reads_done
    }

    pub fn releases(&self) -> usize {
        self.state.lock().unwrap().releases
    }

    pub fn source(&self) -> Box<dyn VideoSource> {
        Box::new(ScriptedSource {
            state: self.state.clone(),
        })
    }
}

pub struct ScriptedSource {
    state: Arc<Mutex<ScriptState>>,
}

fn make_frame(fill: u8, sequence: u64) -> Frame {
    Frame::new(vec![fill; 2 * 2 * 3], 2, 2, sequence).unwrap()
}

impl VideoSource for ScriptedSource {
    fn open(&mut self, url: &str) -> Result<(), DecodeError> {
        let mut state = self.state.lock().unwrap();
        state.opens += 1;
        let ok = state.open_results.pop_front().unwrap_or(true) && !state.refuse_opens;
        state.opened = ok;
        if ok {
            Ok(())
        } else {
            Err(DecodeError::Open {
                url: url.to_string(),
                reason: "scripted open failure".to_string(),
            })
        }
    }

    fn is_opened(&self) -> bool {
        self.state.lock().unwrap().opened
    }

    fn read(&mut self) -> Result<Frame, DecodeError> {
        let (step, sequence) = {
            let mut state = self.state.lock().unwrap();
            if !state.opened {
                return Err(DecodeError::NotOpened);
            }
            state.reads_done += 1;
            let step = match state.reads.pop_front() {
                Some(step) => step,
                None => state.fallback.clone().unwrap_or(Step::Fail),
            };
            state.sequence += 1;
            (step, state.sequence)
        };

        // Sleep outside the lock so the test body can keep observing
        match step {
            Step::Frame(fill) => Ok(make_frame(fill, sequence)),
            Step::Fail => Err(DecodeError::Read("scripted read failure".to_string())),
            Step::EndOfStream => Err(DecodeError::EndOfStream),
            Step::Stall(duration, fill) => {
                std::thread::sleep(duration);
                Ok(make_frame(fill, sequence))
            }
        }
    }

    fn release(&mut self) {
        let mut state = self.state.lock().unwrap();
        state.opened = false;
        state.releases += 1;
    }
}

/// First byte of the cached frame, if any
pub fn fill_of(frame: &Frame) -> u8 {
    frame.as_slice()[0]
}

/// Poll `condition` every few milliseconds until it holds or `timeout` passes
pub fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    loop {
        if condition() {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        std::thread::sleep(Duration::from_millis(2));
    }
}
