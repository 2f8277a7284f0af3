use futures_util::future::join_all;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, info};

use super::hub::{HubConfig, HubMap, HubStats, StreamHub, Subscription};
use super::StreamError;
use crate::camera::SourceOpener;
use crate::processing::FrameEncoder;

/// All live hubs, keyed by camera id
///
/// Built once at server start and shared by the HTTP handlers. Hubs are
/// created on the first attach for a camera and forgotten again as soon as
/// they are idle and nothing else holds them.
pub struct HubRegistry {
    hubs: Arc<HubMap>,
    opener: Arc<dyn SourceOpener>,
    encoder: Arc<dyn FrameEncoder>,
    config: HubConfig,
    shutting_down: AtomicBool,
}

impl HubRegistry {
    pub fn new(
        opener: Arc<dyn SourceOpener>,
        encoder: Arc<dyn FrameEncoder>,
        config: HubConfig,
    ) -> Self {
        Self {
            hubs: Arc::new(Mutex::new(HashMap::new())),
            opener,
            encoder,
            config,
            shutting_down: AtomicBool::new(false),
        }
    }

    pub fn config(&self) -> &HubConfig {
        &self.config
    }

    /// Attach a viewer to the hub for `camera_id`, creating it if needed.
    ///
    /// `url` is only used when the hub is created.
    pub async fn attach(&self, camera_id: u32, url: &str) -> Result<Subscription, StreamError> {
        if self.shutting_down.load(Ordering::SeqCst) {
            return Err(StreamError::ShuttingDown);
        }

        let hub = {
            let mut hubs = self.hubs.lock();
            Arc::clone(hubs.entry(camera_id).or_insert_with(|| {
                debug!(camera_id, "Creating stream hub");
                Arc::new(StreamHub::new(
                    camera_id,
                    url,
                    Arc::clone(&self.opener),
                    Arc::clone(&self.encoder),
                    self.config.clone(),
                ))
            }))
        };

        let result = hub
            .attach_with_registry(Some(Arc::downgrade(&self.hubs)))
            .await;
        if result.is_err() {
            drop(hub);
            forget_if_idle(&self.hubs, camera_id);
        }
        result
    }

    pub fn hub(&self, camera_id: u32) -> Option<Arc<StreamHub>> {
        self.hubs.lock().get(&camera_id).cloned()
    }

    pub fn len(&self) -> usize {
        self.hubs.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.hubs.lock().is_empty()
    }

    /// Stats for every known hub, ordered by camera id.
    pub fn stats(&self) -> Vec<HubStats> {
        let mut stats: Vec<HubStats> = self.hubs.lock().values().map(|hub| hub.stats()).collect();
        stats.sort_by_key(|s| s.camera_id);
        stats
    }

    /// Stop every source and end every viewer's stream. New attaches are
    /// refused from here on.
    pub async fn shutdown(&self) {
        if self.shutting_down.swap(true, Ordering::SeqCst) {
            return;
        }

        let hubs: Vec<Arc<StreamHub>> = self.hubs.lock().values().cloned().collect();
        info!(hubs = hubs.len(), "Stopping all streams");

        join_all(hubs.iter().map(|hub| hub.shutdown())).await;
        drop(hubs);
        self.hubs.lock().clear();
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::SeqCst)
    }
}

/// Drop the hub for `camera_id` if only the map still references it and it
/// has nothing running. Anyone holding the `Arc` (a viewer, or an attach in
/// progress) keeps it alive; each of them calls this again when done.
pub(crate) fn forget_if_idle(hubs: &HubMap, camera_id: u32) {
    let mut hubs = hubs.lock();
    let idle = hubs
        .get(&camera_id)
        .is_some_and(|hub| Arc::strong_count(hub) == 1 && hub.is_idle_now());

    if idle {
        hubs.remove(&camera_id);
        debug!(camera_id, "Removed idle stream hub");
    }
}
