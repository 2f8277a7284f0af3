use gstreamer as gst;
use gstreamer::prelude::*;
use gstreamer_app as gst_app;
use gstreamer_video as gst_video;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use super::{redact_credentials, Frame, FrameSource, SourceError, SourceOpener};

/// Slice used while waiting for the first frame, so bus errors surface early.
const OPEN_POLL: Duration = Duration::from_millis(100);

/// Tuning for RTSP decode sessions
#[derive(Debug, Clone)]
pub struct RtspOptions {
    pub latency_ms: u32,
    pub open_timeout: Duration,
    pub pull_timeout: Duration,
    pub max_read_failures: u32,
}

impl Default for RtspOptions {
    fn default() -> Self {
        Self {
            latency_ms: 200,
            open_timeout: Duration::from_secs(5),
            pull_timeout: Duration::from_secs(2),
            max_read_failures: 3,
        }
    }
}

/// Opens [`RtspSource`]s with shared options.
#[derive(Debug, Clone, Default)]
pub struct RtspOpener {
    options: RtspOptions,
}

impl RtspOpener {
    pub fn new(options: RtspOptions) -> Self {
        Self { options }
    }
}

impl SourceOpener for RtspOpener {
    fn open(&self, url: &str) -> Result<Box<dyn FrameSource>, SourceError> {
        let source = RtspSource::open(url, &self.options)?;
        Ok(Box::new(source))
    }
}

/// RTSP decode session backed by a GStreamer pipeline.
///
/// `rtspsrc ! decodebin ! videoconvert ! RGB ! appsink`. The appsink keeps a
/// single buffer and drops older ones, so nothing queues up behind a slow
/// reader.
pub struct RtspSource {
    url: String,
    pipeline: gst::Pipeline,
    appsink: gst_app::AppSink,
    bus: gst::Bus,
    pending: Option<Frame>,
    pull_timeout: Duration,
    max_read_failures: u32,
    consecutive_failures: u32,
    closed: bool,
}

impl RtspSource {
    /// Start the pipeline and wait for the first decoded frame.
    pub fn open(url: &str, options: &RtspOptions) -> Result<Self, SourceError> {
        gst::init().map_err(|e| SourceError::Unreachable(e.to_string()))?;

        let display_url = redact_credentials(url);
        info!(url = %display_url, "Opening RTSP source");

        let pipe_description = format!(
            "rtspsrc name=src latency={} protocols=tcp ! decodebin ! videoconvert ! \
             video/x-raw,format=RGB ! appsink name=sink max-buffers=1 drop=true sync=false",
            options.latency_ms
        );
        debug!(pipeline = %pipe_description, "Creating GStreamer pipeline");

        let pipeline = gst::parse::launch(&pipe_description)
            .map_err(|e| SourceError::Unreachable(format!("failed to create pipeline: {e}")))?
            .downcast::<gst::Pipeline>()
            .map_err(|_| SourceError::Unreachable("parsed element is not a pipeline".into()))?;

        let src = pipeline
            .by_name("src")
            .ok_or_else(|| SourceError::Unreachable("element 'src' not found".into()))?;
        src.set_property("location", url);

        let appsink = pipeline
            .by_name("sink")
            .ok_or_else(|| SourceError::Unreachable("element 'sink' not found".into()))?
            .downcast::<gst_app::AppSink>()
            .map_err(|_| SourceError::Unreachable("element 'sink' is not an appsink".into()))?;

        let bus = pipeline
            .bus()
            .ok_or_else(|| SourceError::Unreachable("pipeline has no bus".into()))?;

        let mut source = RtspSource {
            url: display_url,
            pipeline,
            appsink,
            bus,
            pending: None,
            pull_timeout: options.pull_timeout,
            max_read_failures: options.max_read_failures.max(1),
            consecutive_failures: 0,
            closed: false,
        };

        // From here on `source` owns the pipeline, so every early return
        // drops it back to Null.
        source
            .pipeline
            .set_state(gst::State::Playing)
            .map_err(|e| SourceError::Unreachable(format!("failed to start pipeline: {e}")))?;

        let first = source.wait_first_frame(options.open_timeout)?;
        source.pending = Some(first);

        info!(url = %source.url, "RTSP source opened");
        Ok(source)
    }

    fn wait_first_frame(&mut self, open_timeout: Duration) -> Result<Frame, SourceError> {
        let deadline = Instant::now() + open_timeout;

        loop {
            if let Some(reason) = self.bus_failure() {
                return Err(SourceError::Unreachable(reason));
            }

            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(SourceError::Unreachable(format!(
                    "no frame within {:?}",
                    open_timeout
                )));
            }

            let slice = remaining.min(OPEN_POLL);
            if let Some(sample) = self.appsink.try_pull_sample(clock_time(slice)) {
                return sample_to_frame(&sample);
            }
            if self.appsink.is_eos() {
                return Err(SourceError::Unreachable(
                    "stream ended before the first frame".into(),
                ));
            }
        }
    }

    /// Pop a pending error or EOS message off the bus.
    fn bus_failure(&self) -> Option<String> {
        let msg = self
            .bus
            .pop_filtered(&[gst::MessageType::Error, gst::MessageType::Eos])?;

        match msg.view() {
            gst::MessageView::Error(err) => {
                let src = err
                    .src()
                    .map(|s| s.path_string().to_string())
                    .unwrap_or_else(|| "unknown".into());
                warn!(
                    url = %self.url,
                    source = %src,
                    error = %err.error(),
                    debug = ?err.debug(),
                    "GStreamer error"
                );
                Some(err.error().to_string())
            }
            gst::MessageView::Eos(_) => Some("end of stream".into()),
            _ => None,
        }
    }
}

impl FrameSource for RtspSource {
    fn next_frame(&mut self) -> Result<Frame, SourceError> {
        if self.closed {
            return Err(SourceError::Read("source closed".into()));
        }
        if let Some(frame) = self.pending.take() {
            return Ok(frame);
        }

        if let Some(sample) = self.appsink.try_pull_sample(clock_time(self.pull_timeout)) {
            self.consecutive_failures = 0;
            return sample_to_frame(&sample);
        }

        if self.appsink.is_eos() {
            return Err(SourceError::EndOfStream);
        }
        if let Some(reason) = self.bus_failure() {
            return Err(SourceError::Read(reason));
        }

        self.consecutive_failures += 1;
        warn!(
            url = %self.url,
            failures = self.consecutive_failures,
            "No frame within pull timeout"
        );
        if self.consecutive_failures >= self.max_read_failures {
            return Err(SourceError::Read(format!(
                "{} consecutive pull timeouts",
                self.consecutive_failures
            )));
        }

        Err(SourceError::Timeout(self.pull_timeout))
    }

    fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        self.pending = None;

        if let Err(e) = self.pipeline.set_state(gst::State::Null) {
            warn!(url = %self.url, error = %e, "Failed to set pipeline to Null");
        }
        info!(url = %self.url, "RTSP source closed");
    }
}

impl Drop for RtspSource {
    fn drop(&mut self) {
        self.close();
    }
}

fn clock_time(duration: Duration) -> gst::ClockTime {
    gst::ClockTime::from_mseconds(duration.as_millis() as u64)
}

/// Copy an RGB sample into a tightly packed [`Frame`], dropping row padding.
fn sample_to_frame(sample: &gst::Sample) -> Result<Frame, SourceError> {
    let caps = sample
        .caps()
        .ok_or_else(|| SourceError::Read("sample had no caps".into()))?;
    let info = gst_video::VideoInfo::from_caps(caps)
        .map_err(|e| SourceError::Read(format!("invalid video caps: {e}")))?;

    let buffer = sample
        .buffer()
        .ok_or_else(|| SourceError::Read("sample had no buffer".into()))?;
    let map = buffer
        .map_readable()
        .map_err(|_| SourceError::Read("unable to map buffer".into()))?;

    let width = info.width();
    let height = info.height();
    let stride = info.stride()[0] as usize;

    let data = pack_rows(map.as_slice(), width as usize * 3, stride, height as usize)
        .ok_or_else(|| SourceError::Read("buffer shorter than its caps".into()))?;

    Ok(Frame::new(width, height, data))
}

fn pack_rows(src: &[u8], row_bytes: usize, stride: usize, rows: usize) -> Option<Vec<u8>> {
    if stride == row_bytes {
        return src.get(..row_bytes * rows).map(<[u8]>::to_vec);
    }

    let mut data = Vec::with_capacity(row_bytes * rows);
    for row in 0..rows {
        let start = row * stride;
        data.extend_from_slice(src.get(start..start + row_bytes)?);
    }
    Some(data)
}
