//! Scripted sources and encoders for exercising the relay without a camera.
//!
//! A [`ScriptedOpener`] hands out [`ScriptedSource`]s that emit the frames
//! `frame-0`, `frame-1`, ... at a fixed interval and then end the way their
//! [`Script`] says. The opener counts how many sources it opened and how many
//! are open right now, which is what the fan-out tests assert on.

use bytes::Bytes;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::camera::{Frame, FrameSource, SourceError, SourceOpener};
use crate::processing::{EncodeError, FrameEncoder};

/// How every source from a [`ScriptedOpener`] behaves
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Script {
    /// `open` fails
    Unreachable,
    /// Frames until closed
    Endless { interval: Duration },
    /// `frames` frames, then end of stream
    Limited { interval: Duration, frames: u64 },
    /// `frames` frames, then a read error
    Failing { interval: Duration, frames: u64 },
}

impl Script {
    pub fn endless(interval: Duration) -> Self {
        Script::Endless { interval }
    }

    pub fn limited(interval: Duration, frames: u64) -> Self {
        Script::Limited { interval, frames }
    }

    pub fn failing(interval: Duration, frames: u64) -> Self {
        Script::Failing { interval, frames }
    }

    fn interval(&self) -> Duration {
        match *self {
            Script::Unreachable => Duration::ZERO,
            Script::Endless { interval }
            | Script::Limited { interval, .. }
            | Script::Failing { interval, .. } => interval,
        }
    }
}

#[derive(Debug, Default)]
struct OpenCounters {
    opens: AtomicU64,
    open_now: AtomicU64,
    peak_open: AtomicU64,
}

/// [`SourceOpener`] that follows a [`Script`]
pub struct ScriptedOpener {
    script: Script,
    counters: Arc<OpenCounters>,
}

impl ScriptedOpener {
    pub fn new(script: Script) -> Self {
        Self {
            script,
            counters: Arc::new(OpenCounters::default()),
        }
    }

    /// Successful opens so far
    pub fn opens(&self) -> u64 {
        self.counters.opens.load(Ordering::SeqCst)
    }

    /// Sources opened and not yet closed
    pub fn open_now(&self) -> u64 {
        self.counters.open_now.load(Ordering::SeqCst)
    }

    /// Most sources ever open at the same time
    pub fn peak_open(&self) -> u64 {
        self.counters.peak_open.load(Ordering::SeqCst)
    }
}

impl SourceOpener for ScriptedOpener {
    fn open(&self, url: &str) -> Result<Box<dyn FrameSource>, SourceError> {
        if self.script == Script::Unreachable {
            return Err(SourceError::Unreachable(format!("{url}: connection refused")));
        }

        self.counters.opens.fetch_add(1, Ordering::SeqCst);
        let now = self.counters.open_now.fetch_add(1, Ordering::SeqCst) + 1;
        self.counters.peak_open.fetch_max(now, Ordering::SeqCst);

        Ok(Box::new(ScriptedSource {
            script: self.script,
            sequence: 0,
            closed: AtomicBool::new(false),
            counters: Arc::clone(&self.counters),
        }))
    }
}

/// One open scripted source
pub struct ScriptedSource {
    script: Script,
    sequence: u64,
    closed: AtomicBool,
    counters: Arc<OpenCounters>,
}

impl FrameSource for ScriptedSource {
    fn next_frame(&mut self) -> Result<Frame, SourceError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(SourceError::Read("source closed".to_string()));
        }

        match self.script {
            Script::Limited { frames, .. } if self.sequence >= frames => {
                return Err(SourceError::EndOfStream);
            }
            Script::Failing { frames, .. } if self.sequence >= frames => {
                return Err(SourceError::Read("connection reset".to_string()));
            }
            _ => {}
        }

        std::thread::sleep(self.script.interval());

        let data = format!("frame-{}", self.sequence).into_bytes();
        self.sequence += 1;
        Ok(Frame::new(data.len() as u32, 1, data))
    }

    fn close(&mut self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.counters.open_now.fetch_sub(1, Ordering::SeqCst);
        }
    }
}

impl Drop for ScriptedSource {
    fn drop(&mut self) {
        self.close();
    }
}

/// Encoder that passes the frame bytes through untouched
#[derive(Debug, Clone, Copy, Default)]
pub struct PassthroughEncoder;

impl FrameEncoder for PassthroughEncoder {
    fn encode(&self, frame: &Frame) -> Result<Bytes, EncodeError> {
        Ok(Bytes::from(frame.data.clone()))
    }
}
