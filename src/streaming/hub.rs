use bytes::Bytes;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use super::frame_distributor::{FrameDistributor, FrameReceiver, FrameRecvError};
use super::StreamError;
use crate::camera::{redact_credentials, FrameSource, SourceError, SourceOpener};
use crate::processing::FrameEncoder;

pub(crate) type HubMap = parking_lot::Mutex<HashMap<u32, Arc<StreamHub>>>;

/// Hub tuning shared by every camera
#[derive(Debug, Clone)]
pub struct HubConfig {
    /// Cadence of empty frames while the camera is unreachable
    pub placeholder_interval: Duration,
    /// Frames a viewer may fall behind before it starts skipping
    pub channel_capacity: usize,
    /// 0 means unlimited
    pub max_viewers: usize,
    /// How long a viewer may leave a part unwritten before it is dropped
    pub write_timeout: Duration,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            placeholder_interval: Duration::from_millis(100),
            channel_capacity: 2,
            max_viewers: 0,
            write_timeout: Duration::from_secs(5),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HubState {
    Idle,
    Starting,
    Streaming,
}

/// What the current generation's worker is doing
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SourcePhase {
    Connecting,
    Live,
    Placeholder,
    Ended,
}

#[derive(Debug, Default)]
struct HubCounters {
    frames_encoded: AtomicU64,
    encode_errors: AtomicU64,
    placeholder_frames: AtomicU64,
    source_opens: AtomicU64,
}

/// Point-in-time view of one hub
#[derive(Debug, Clone, Serialize)]
pub struct HubStats {
    pub camera_id: u32,
    pub state: HubState,
    pub viewers: usize,
    pub generation: u64,
    pub degraded: bool,
    pub source_opens: u64,
    pub frames_encoded: u64,
    pub encode_errors: u64,
    pub placeholder_frames: u64,
    pub frames_published: u64,
    pub frames_unseen: u64,
}

/// One start-to-stop lifetime of the source and its pull loop.
struct Generation {
    id: u64,
    distributor: Arc<FrameDistributor>,
    stop_tx: watch::Sender<bool>,
    phase_rx: watch::Receiver<SourcePhase>,
    task: JoinHandle<()>,
}

impl Generation {
    fn has_ended(&self) -> bool {
        self.task.is_finished() || *self.phase_rx.borrow() == SourcePhase::Ended
    }
}

/// Copy of the hub's externally visible state, readable without waiting
/// for an attach or detach in progress.
#[derive(Default)]
struct HubStatus {
    viewers: usize,
    generation: u64,
    phase: Option<watch::Receiver<SourcePhase>>,
    distributor: Option<Arc<FrameDistributor>>,
}

struct HubInner {
    viewers: usize,
    generation: u64,
    active: Option<Generation>,
    /// Keeps the last generation's distributor around for its counters.
    last_distributor: Option<Arc<FrameDistributor>>,
}

/// Per-camera fan-out coordinator
///
/// Owns at most one source at a time. The first [`attach`](Self::attach)
/// starts a generation (open + pull loop); the last detach stops it and
/// waits until the source is closed. Both run under the same async lock, so
/// a new generation can never overlap the one being torn down.
pub struct StreamHub {
    camera_id: u32,
    url: String,
    opener: Arc<dyn SourceOpener>,
    encoder: Arc<dyn FrameEncoder>,
    config: HubConfig,
    inner: Mutex<HubInner>,
    status: parking_lot::Mutex<HubStatus>,
    closed: AtomicBool,
    counters: Arc<HubCounters>,
    next_session: AtomicU64,
}

impl StreamHub {
    pub fn new(
        camera_id: u32,
        url: impl Into<String>,
        opener: Arc<dyn SourceOpener>,
        encoder: Arc<dyn FrameEncoder>,
        config: HubConfig,
    ) -> Self {
        Self {
            camera_id,
            url: url.into(),
            opener,
            encoder,
            config,
            inner: Mutex::new(HubInner {
                viewers: 0,
                generation: 0,
                active: None,
                last_distributor: None,
            }),
            status: parking_lot::Mutex::new(HubStatus::default()),
            closed: AtomicBool::new(false),
            counters: Arc::new(HubCounters::default()),
            next_session: AtomicU64::new(1),
        }
    }

    pub fn camera_id(&self) -> u32 {
        self.camera_id
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// Register a viewer, starting the source if it is the first one.
    pub async fn attach(self: &Arc<Self>) -> Result<Subscription, StreamError> {
        self.attach_with_registry(None).await
    }

    pub(crate) async fn attach_with_registry(
        self: &Arc<Self>,
        registry: Option<Weak<HubMap>>,
    ) -> Result<Subscription, StreamError> {
        let mut inner = self.inner.lock().await;

        if self.closed.load(Ordering::SeqCst) {
            return Err(StreamError::HubClosed(self.camera_id));
        }

        // A generation that ended on its own (read error, end of stream)
        // still holds its task handle until someone reaps it.
        if inner.active.as_ref().is_some_and(Generation::has_ended) {
            self.shutdown_active(&mut inner).await;
            inner.viewers = 0;
            self.publish_status(&inner);
        }

        if self.config.max_viewers > 0 && inner.viewers >= self.config.max_viewers {
            warn!(
                camera_id = self.camera_id,
                viewers = inner.viewers,
                "Max viewers reached, rejecting viewer"
            );
            return Err(StreamError::ViewerLimitReached(self.camera_id));
        }

        let existing = inner
            .active
            .as_ref()
            .and_then(|active| active.distributor.subscribe());

        let (rx, latest) = match existing {
            Some(subscription) => subscription,
            None => {
                self.shutdown_active(&mut inner).await;
                let distributor = self.start_generation(&mut inner);
                distributor
                    .subscribe()
                    .ok_or(StreamError::HubClosed(self.camera_id))?
            }
        };

        inner.viewers += 1;
        self.publish_status(&inner);
        let session_id = self.next_session.fetch_add(1, Ordering::Relaxed);

        info!(
            camera_id = self.camera_id,
            session_id,
            viewers = inner.viewers,
            generation = inner.generation,
            "Viewer attached"
        );

        Ok(Subscription {
            camera_id: self.camera_id,
            session_id,
            receiver: FrameReceiver::new(rx, session_id),
            initial: latest,
            attached_at: Instant::now(),
            release: Some(Release {
                hub: Arc::clone(self),
                generation: inner.generation,
                registry,
            }),
        })
    }

    /// Deregister a viewer of `generation`. Returns the viewers left.
    ///
    /// Handles from an earlier generation are ignored for counting, so they
    /// can never take a later generation's viewers down to zero.
    pub(crate) async fn detach(&self, generation: u64, session_id: u64) -> usize {
        let mut inner = self.inner.lock().await;

        if inner.generation == generation && inner.viewers > 0 {
            inner.viewers -= 1;
        }

        debug!(
            camera_id = self.camera_id,
            session_id,
            viewers = inner.viewers,
            "Viewer detached"
        );

        let ended = inner.active.as_ref().is_some_and(Generation::has_ended);
        if inner.viewers == 0 || ended {
            if inner.active.is_some() {
                if inner.viewers == 0 {
                    info!(camera_id = self.camera_id, "Last viewer left, stopping source");
                }
                self.shutdown_active(&mut inner).await;
            }
            inner.viewers = 0;
        }

        self.publish_status(&inner);
        inner.viewers
    }

    /// Stop the source and end every viewer's stream. Later attaches fail
    /// with [`StreamError::HubClosed`].
    pub async fn shutdown(&self) {
        self.closed.store(true, Ordering::SeqCst);

        let mut inner = self.inner.lock().await;
        if inner.active.is_some() {
            info!(
                camera_id = self.camera_id,
                viewers = inner.viewers,
                "Shutting down stream"
            );
        }
        self.shutdown_active(&mut inner).await;
        inner.viewers = 0;
        self.publish_status(&inner);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn state(&self) -> HubState {
        Self::state_of(&self.status.lock())
    }

    pub fn viewer_count(&self) -> usize {
        self.status.lock().viewers
    }

    /// Never waits on an attach or detach in progress.
    pub fn stats(&self) -> HubStats {
        let status = self.status.lock();

        let distributor_stats = status
            .distributor
            .as_ref()
            .map(|d| d.stats())
            .unwrap_or_default();
        let degraded = status
            .phase
            .as_ref()
            .is_some_and(|phase| *phase.borrow() == SourcePhase::Placeholder);

        HubStats {
            camera_id: self.camera_id,
            state: Self::state_of(&status),
            viewers: status.viewers,
            generation: status.generation,
            degraded,
            source_opens: self.counters.source_opens.load(Ordering::Relaxed),
            frames_encoded: self.counters.frames_encoded.load(Ordering::Relaxed),
            encode_errors: self.counters.encode_errors.load(Ordering::Relaxed),
            placeholder_frames: self.counters.placeholder_frames.load(Ordering::Relaxed),
            frames_published: distributor_stats.frames_sent,
            frames_unseen: distributor_stats.frames_unseen,
        }
    }

    /// No viewers and no generation left to tear down.
    pub(crate) fn is_idle_now(&self) -> bool {
        let status = self.status.lock();
        status.viewers == 0 && status.phase.is_none()
    }

    fn state_of(status: &HubStatus) -> HubState {
        let Some(phase) = &status.phase else {
            return HubState::Idle;
        };
        // A dropped sender means the worker is gone.
        if phase.has_changed().is_err() {
            return HubState::Idle;
        }
        match *phase.borrow() {
            SourcePhase::Connecting => HubState::Starting,
            SourcePhase::Live | SourcePhase::Placeholder => HubState::Streaming,
            SourcePhase::Ended => HubState::Idle,
        }
    }

    /// Mirror `inner` into the lock-free status. Call after every change.
    fn publish_status(&self, inner: &HubInner) {
        let mut status = self.status.lock();
        status.viewers = inner.viewers;
        status.generation = inner.generation;
        status.phase = inner.active.as_ref().map(|active| active.phase_rx.clone());
        status.distributor = inner
            .active
            .as_ref()
            .map(|active| Arc::clone(&active.distributor))
            .or_else(|| inner.last_distributor.clone());
    }

    fn start_generation(&self, inner: &mut HubInner) -> Arc<FrameDistributor> {
        inner.generation += 1;
        inner.viewers = 0;

        let distributor = Arc::new(FrameDistributor::new(self.config.channel_capacity));
        let (stop_tx, stop_rx) = watch::channel(false);
        let (phase_tx, phase_rx) = watch::channel(SourcePhase::Connecting);

        info!(
            camera_id = self.camera_id,
            generation = inner.generation,
            url = %redact_credentials(&self.url),
            "Starting source"
        );

        let worker = Worker {
            camera_id: self.camera_id,
            url: self.url.clone(),
            opener: Arc::clone(&self.opener),
            encoder: Arc::clone(&self.encoder),
            distributor: Arc::clone(&distributor),
            counters: Arc::clone(&self.counters),
            placeholder_interval: self.config.placeholder_interval,
            stop_rx,
            phase_tx,
        };
        let task = tokio::spawn(worker.run());

        inner.active = Some(Generation {
            id: inner.generation,
            distributor: Arc::clone(&distributor),
            stop_tx,
            phase_rx,
            task,
        });
        self.publish_status(inner);
        distributor
    }

    /// Stop the current generation and wait until its source is closed.
    async fn shutdown_active(&self, inner: &mut HubInner) {
        let Some(active) = inner.active.take() else {
            return;
        };

        let _ = active.stop_tx.send(true);
        active.distributor.close();
        inner.last_distributor = Some(Arc::clone(&active.distributor));
        self.publish_status(inner);

        if let Err(e) = active.task.await {
            error!(camera_id = self.camera_id, error = %e, "Source worker panicked");
        }

        debug!(
            camera_id = self.camera_id,
            generation = active.id,
            "Source generation stopped"
        );
    }
}

impl Drop for StreamHub {
    fn drop(&mut self) {
        // The worker closes its source on its own once told to stop.
        if let Some(active) = self.inner.get_mut().active.take() {
            let _ = active.stop_tx.send(true);
            active.distributor.close();
        }
    }
}

/// Everything the pull loop needs, moved into its task.
struct Worker {
    camera_id: u32,
    url: String,
    opener: Arc<dyn SourceOpener>,
    encoder: Arc<dyn FrameEncoder>,
    distributor: Arc<FrameDistributor>,
    counters: Arc<HubCounters>,
    placeholder_interval: Duration,
    stop_rx: watch::Receiver<bool>,
    phase_tx: watch::Sender<SourcePhase>,
}

impl Worker {
    async fn run(self) {
        let opener = Arc::clone(&self.opener);
        let url = self.url.clone();
        let opened = tokio::task::spawn_blocking(move || opener.open(&url)).await;

        match opened {
            Ok(Ok(source)) => {
                self.counters.source_opens.fetch_add(1, Ordering::Relaxed);
                self.stream(source).await;
            }
            Ok(Err(e)) => {
                warn!(
                    camera_id = self.camera_id,
                    error = %e,
                    "Source unreachable, serving placeholder frames"
                );
                self.placeholder().await;
            }
            Err(e) => {
                error!(camera_id = self.camera_id, error = %e, "Source open task failed");
            }
        }

        self.distributor.close();
        let _ = self.phase_tx.send(SourcePhase::Ended);
    }

    async fn stream(&self, mut source: Box<dyn FrameSource>) {
        if *self.stop_rx.borrow() {
            let _ = tokio::task::spawn_blocking(move || source.close()).await;
            return;
        }

        let _ = self.phase_tx.send(SourcePhase::Live);
        info!(camera_id = self.camera_id, "Source streaming");

        let pull = PullLoop {
            camera_id: self.camera_id,
            encoder: Arc::clone(&self.encoder),
            distributor: Arc::clone(&self.distributor),
            counters: Arc::clone(&self.counters),
            stop_rx: self.stop_rx.clone(),
        };

        match tokio::task::spawn_blocking(move || pull.run(source)).await {
            Ok(PullOutcome::Stopped) => {
                debug!(camera_id = self.camera_id, "Pull loop stopped");
            }
            Ok(PullOutcome::Ended) => {
                info!(camera_id = self.camera_id, "Source reached end of stream");
            }
            Ok(PullOutcome::Failed(e)) => {
                warn!(camera_id = self.camera_id, error = %e, "Source read failed, ending stream");
            }
            Err(e) => {
                error!(camera_id = self.camera_id, error = %e, "Pull loop panicked");
            }
        }
    }

    async fn placeholder(&self) {
        let _ = self.phase_tx.send(SourcePhase::Placeholder);

        let mut stop_rx = self.stop_rx.clone();
        let mut ticker = tokio::time::interval(self.placeholder_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            if *stop_rx.borrow() {
                break;
            }
            tokio::select! {
                _ = ticker.tick() => {
                    self.distributor.publish(Bytes::new());
                    self.counters.placeholder_frames.fetch_add(1, Ordering::Relaxed);
                }
                changed = stop_rx.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }

        debug!(camera_id = self.camera_id, "Placeholder emitter stopped");
    }
}

enum PullOutcome {
    Stopped,
    Ended,
    Failed(SourceError),
}

/// Blocking half of the worker: pull, encode, publish until told to stop or
/// the source gives out. Always closes the source before returning.
struct PullLoop {
    camera_id: u32,
    encoder: Arc<dyn FrameEncoder>,
    distributor: Arc<FrameDistributor>,
    counters: Arc<HubCounters>,
    stop_rx: watch::Receiver<bool>,
}

impl PullLoop {
    fn run(self, mut source: Box<dyn FrameSource>) -> PullOutcome {
        let outcome = loop {
            if *self.stop_rx.borrow() {
                break PullOutcome::Stopped;
            }

            match source.next_frame() {
                Ok(frame) => match self.encoder.encode(&frame) {
                    Ok(jpeg) => {
                        self.counters.frames_encoded.fetch_add(1, Ordering::Relaxed);
                        self.distributor.publish(jpeg);
                    }
                    Err(e) => {
                        self.counters.encode_errors.fetch_add(1, Ordering::Relaxed);
                        warn!(camera_id = self.camera_id, error = %e, "Skipping frame that failed to encode");
                    }
                },
                Err(SourceError::EndOfStream) => break PullOutcome::Ended,
                Err(e) if e.is_terminal() => break PullOutcome::Failed(e),
                Err(_) => continue,
            }
        };

        source.close();
        outcome
    }
}

/// Handle for one attached viewer
///
/// Yields the hub's frames in order. Dropping it detaches from the hub; use
/// [`detach`](Self::detach) to wait for the detach to finish.
pub struct Subscription {
    camera_id: u32,
    session_id: u64,
    receiver: FrameReceiver,
    initial: Option<Bytes>,
    attached_at: Instant,
    release: Option<Release>,
}

impl Subscription {
    pub fn camera_id(&self) -> u32 {
        self.camera_id
    }

    pub fn session_id(&self) -> u64 {
        self.session_id
    }

    pub fn attached_at(&self) -> Instant {
        self.attached_at
    }

    pub fn frames_skipped(&self) -> u64 {
        self.receiver.frames_lagged()
    }

    /// Next encoded frame, or `None` once the hub ended this stream.
    ///
    /// An empty frame is a placeholder. Frames the viewer was too slow for
    /// are skipped.
    pub async fn next_frame(&mut self) -> Option<Bytes> {
        if let Some(frame) = self.initial.take() {
            return Some(frame);
        }

        loop {
            match self.receiver.recv().await {
                Ok(frame) => return Some(frame),
                Err(FrameRecvError::Lagged(_)) => continue,
                Err(FrameRecvError::Closed) => return None,
            }
        }
    }

    /// Detach and wait until the hub has processed it.
    pub async fn detach(mut self) {
        if let Some(release) = self.release.take() {
            release.run(self.session_id).await;
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        let Some(release) = self.release.take() else {
            return;
        };

        let session_id = self.session_id;
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(release.run(session_id));
            }
            Err(_) => warn!(
                camera_id = self.camera_id,
                session_id, "Subscription dropped outside a runtime, cannot detach"
            ),
        }
    }
}

struct Release {
    hub: Arc<StreamHub>,
    generation: u64,
    registry: Option<Weak<HubMap>>,
}

impl Release {
    async fn run(self, session_id: u64) {
        let Release {
            hub,
            generation,
            registry,
        } = self;

        let camera_id = hub.camera_id;
        hub.detach(generation, session_id).await;
        drop(hub);

        if let Some(hubs) = registry.and_then(|weak| weak.upgrade()) {
            super::registry::forget_if_idle(&hubs, camera_id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{PassthroughEncoder, Script, ScriptedOpener};
    use std::time::Duration;
    use tokio::time::timeout;

    const WAIT: Duration = Duration::from_secs(5);

    fn hub(opener: &Arc<ScriptedOpener>, config: HubConfig) -> Arc<StreamHub> {
        Arc::new(StreamHub::new(
            1,
            "rtsp://cam.local/feed",
            Arc::clone(opener) as Arc<dyn SourceOpener>,
            Arc::new(PassthroughEncoder),
            config,
        ))
    }

    async fn next(sub: &mut Subscription) -> Option<Bytes> {
        timeout(WAIT, sub.next_frame()).await.expect("frame timed out")
    }

    async fn wait_for<F: Fn() -> bool>(condition: F) {
        timeout(WAIT, async {
            while !condition() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("condition not reached");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_many_viewers_share_one_source() {
        let opener = Arc::new(ScriptedOpener::new(Script::endless(Duration::from_millis(5))));
        let hub = hub(&opener, HubConfig::default());

        let mut subs = Vec::new();
        for _ in 0..5 {
            subs.push(hub.attach().await.unwrap());
        }
        for sub in subs.iter_mut() {
            assert!(next(sub).await.is_some());
        }

        assert_eq!(opener.opens(), 1);
        assert_eq!(opener.open_now(), 1);
        assert_eq!(hub.viewer_count(), 5);
        assert_eq!(hub.state(), HubState::Streaming);

        for sub in subs {
            sub.detach().await;
        }

        assert_eq!(opener.open_now(), 0);
        assert_eq!(opener.peak_open(), 1);
        assert_eq!(hub.state(), HubState::Idle);
    }

    fn seq(frame: &Bytes) -> u64 {
        std::str::from_utf8(frame).unwrap()["frame-".len()..]
            .parse()
            .unwrap()
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_late_viewer_shares_frames_and_outlives_first() {
        let opener = Arc::new(ScriptedOpener::new(Script::endless(Duration::from_millis(5))));
        let hub = hub(
            &opener,
            HubConfig {
                channel_capacity: 16,
                ..HubConfig::default()
            },
        );

        let mut a = hub.attach().await.unwrap();
        for _ in 0..3 {
            assert!(next(&mut a).await.is_some());
        }

        let mut b = hub.attach().await.unwrap();
        let mut seen_by_b = Vec::new();
        for _ in 0..5 {
            seen_by_b.push(next(&mut b).await.unwrap());
        }

        // A catches up to where B joined, then sees the same frames
        let mut frame = next(&mut a).await.unwrap();
        while seq(&frame) < seq(&seen_by_b[0]) {
            frame = next(&mut a).await.unwrap();
        }
        let mut seen_by_a = vec![frame];
        for _ in 1..5 {
            seen_by_a.push(next(&mut a).await.unwrap());
        }
        assert_eq!(seen_by_a, seen_by_b);
        assert_eq!(opener.opens(), 1);

        a.detach().await;
        assert_eq!(hub.viewer_count(), 1);

        let mut last = seq(seen_by_b.last().unwrap());
        for _ in 0..5 {
            let frame = next(&mut b).await.unwrap();
            assert_eq!(seq(&frame), last + 1);
            last += 1;
        }
        assert_eq!(opener.open_now(), 1);
        assert_eq!(opener.opens(), 1);

        b.detach().await;
        assert_eq!(opener.open_now(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_shutdown_ends_attached_viewers() {
        let opener = Arc::new(ScriptedOpener::new(Script::endless(Duration::from_millis(5))));
        let hub = hub(&opener, HubConfig::default());

        let mut sub = hub.attach().await.unwrap();
        assert!(next(&mut sub).await.is_some());

        timeout(WAIT, hub.shutdown()).await.unwrap();
        assert_eq!(opener.open_now(), 0);
        assert_eq!(hub.state(), HubState::Idle);
        assert!(hub.is_closed());

        timeout(WAIT, async { while sub.next_frame().await.is_some() {} })
            .await
            .unwrap();
        assert!(matches!(hub.attach().await, Err(StreamError::HubClosed(1))));

        sub.detach().await;
        assert_eq!(hub.viewer_count(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_status_readable_while_hub_is_busy() {
        let opener = Arc::new(ScriptedOpener::new(Script::endless(Duration::from_millis(5))));
        let hub = hub(&opener, HubConfig::default());

        let mut sub = hub.attach().await.unwrap();
        assert!(next(&mut sub).await.is_some());

        {
            // Stands in for a detach waiting on its worker
            let _busy = hub.inner.lock().await;
            let stats = hub.stats();
            assert_eq!(stats.viewers, 1);
            assert_eq!(stats.state, HubState::Streaming);
            assert!(!hub.is_idle_now());
        }

        sub.detach().await;
        let _busy = hub.inner.lock().await;
        assert!(hub.is_idle_now());
        assert_eq!(hub.stats().generation, 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_reattach_opens_fresh_source() {
        let opener = Arc::new(ScriptedOpener::new(Script::endless(Duration::from_millis(5))));
        let hub = hub(&opener, HubConfig::default());

        let mut first = hub.attach().await.unwrap();
        assert!(next(&mut first).await.is_some());
        first.detach().await;
        assert_eq!(opener.open_now(), 0);

        let mut second = hub.attach().await.unwrap();
        let frame = next(&mut second).await.unwrap();

        // Numbering restarts because this is a new source
        assert_eq!(frame, Bytes::from_static(b"frame-0"));
        assert_eq!(opener.opens(), 2);
        assert_eq!(hub.stats().generation, 2);
        second.detach().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_frames_arrive_in_order() {
        let opener = Arc::new(ScriptedOpener::new(Script::limited(
            Duration::from_millis(2),
            10,
        )));
        let hub = hub(
            &opener,
            HubConfig {
                channel_capacity: 16,
                ..HubConfig::default()
            },
        );

        let mut sub = hub.attach().await.unwrap();
        let mut frames = Vec::new();
        while let Some(frame) = next(&mut sub).await {
            frames.push(frame);
        }

        let expected: Vec<Bytes> = (0..10)
            .map(|i| Bytes::from(format!("frame-{i}")))
            .collect();
        assert_eq!(frames, expected);
        sub.detach().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_slow_viewer_does_not_stall_others() {
        let opener = Arc::new(ScriptedOpener::new(Script::endless(Duration::from_millis(2))));
        let hub = hub(&opener, HubConfig::default());

        let mut fast = hub.attach().await.unwrap();
        let mut slow = hub.attach().await.unwrap();

        let mut last = None;
        for _ in 0..50 {
            last = next(&mut fast).await;
        }
        assert!(last.is_some());

        // The slow viewer never read; it only sees recent frames, in order.
        let a = next(&mut slow).await.unwrap();
        let b = next(&mut slow).await.unwrap();
        assert!(seq(&b) > seq(&a));
        assert!(slow.frames_skipped() > 0);
        assert!(hub.stats().frames_published >= 50);

        fast.detach().await;
        slow.detach().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_unreachable_serves_placeholders() {
        let opener = Arc::new(ScriptedOpener::new(Script::Unreachable));
        let hub = hub(
            &opener,
            HubConfig {
                placeholder_interval: Duration::from_millis(10),
                ..HubConfig::default()
            },
        );

        let mut sub = hub.attach().await.unwrap();
        for _ in 0..3 {
            assert_eq!(next(&mut sub).await, Some(Bytes::new()));
        }

        let stats = hub.stats();
        assert!(stats.degraded);
        assert_eq!(stats.state, HubState::Streaming);
        assert_eq!(stats.source_opens, 0);

        sub.detach().await;
        assert_eq!(hub.state(), HubState::Idle);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_placeholder_rate_is_bounded() {
        let opener = Arc::new(ScriptedOpener::new(Script::Unreachable));
        let hub = hub(
            &opener,
            HubConfig {
                placeholder_interval: Duration::from_millis(20),
                ..HubConfig::default()
            },
        );

        let sub = hub.attach().await.unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;

        let emitted = hub.stats().placeholder_frames;
        assert!((2..=11).contains(&emitted), "emitted {emitted} placeholders");
        sub.detach().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_read_error_ends_all_viewers() {
        let opener = Arc::new(ScriptedOpener::new(Script::failing(
            Duration::from_millis(5),
            5,
        )));
        let hub = hub(
            &opener,
            HubConfig {
                channel_capacity: 16,
                ..HubConfig::default()
            },
        );

        let mut a = hub.attach().await.unwrap();
        let mut b = hub.attach().await.unwrap();

        while next(&mut a).await.is_some() {}
        while next(&mut b).await.is_some() {}

        wait_for(|| opener.open_now() == 0).await;
        assert_eq!(hub.state(), HubState::Idle);

        // Stale handles must not disturb the next generation
        a.detach().await;
        let mut c = hub.attach().await.unwrap();
        b.detach().await;
        assert_eq!(hub.viewer_count(), 1);
        assert!(next(&mut c).await.is_some());
        assert_eq!(opener.opens(), 2);
        c.detach().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_dropped_subscription_detaches() {
        let opener = Arc::new(ScriptedOpener::new(Script::endless(Duration::from_millis(5))));
        let hub = hub(&opener, HubConfig::default());

        let mut sub = hub.attach().await.unwrap();
        assert!(next(&mut sub).await.is_some());
        drop(sub);

        wait_for(|| opener.open_now() == 0).await;
        assert_eq!(hub.viewer_count(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_viewer_limit() {
        let opener = Arc::new(ScriptedOpener::new(Script::endless(Duration::from_millis(5))));
        let hub = hub(
            &opener,
            HubConfig {
                max_viewers: 1,
                ..HubConfig::default()
            },
        );

        let sub = hub.attach().await.unwrap();
        assert!(matches!(
            hub.attach().await,
            Err(StreamError::ViewerLimitReached(1))
        ));
        sub.detach().await;
        hub.attach().await.unwrap().detach().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_encode_errors_are_skipped() {
        let opener = Arc::new(ScriptedOpener::new(Script::limited(
            Duration::from_millis(2),
            4,
        )));
        // Scripted frames are not valid RGB, so the real encoder rejects each one.
        let hub = Arc::new(StreamHub::new(
            1,
            "rtsp://cam.local/feed",
            Arc::clone(&opener) as Arc<dyn SourceOpener>,
            Arc::new(crate::processing::JpegEncoder::default()),
            HubConfig::default(),
        ));

        let mut sub = hub.attach().await.unwrap();
        assert_eq!(next(&mut sub).await, None);

        let stats = hub.stats();
        assert_eq!(stats.encode_errors, 4);
        assert_eq!(stats.frames_encoded, 0);
        sub.detach().await;
    }
}
