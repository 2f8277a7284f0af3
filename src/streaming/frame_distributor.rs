//! Zero-copy frame fan-out for one hub generation
//!
//! Frames are `Bytes`, so every subscriber shares the same allocation.
//! `tokio::sync::broadcast` gives drop-on-full semantics: a subscriber that
//! falls more than `capacity` frames behind skips ahead to the newest ones
//! instead of holding up the publisher.

use bytes::Bytes;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::broadcast;
use tracing::{debug, info};

/// Counters for one distributor
#[derive(Debug, Clone, Default)]
pub struct FrameStats {
    pub frames_sent: u64,
    pub frames_unseen: u64,
    pub subscribers: usize,
}

struct Channel {
    /// `None` once closed; dropping the sender ends every receiver.
    tx: Option<broadcast::Sender<Bytes>>,
    latest: Option<Bytes>,
}

pub struct FrameDistributor {
    channel: Mutex<Channel>,
    frames_sent: AtomicU64,
    frames_unseen: AtomicU64,
}

impl FrameDistributor {
    /// `capacity` is how many frames a subscriber may fall behind before it
    /// starts losing the oldest ones.
    pub fn new(capacity: usize) -> Self {
        let (tx, _rx) = broadcast::channel(capacity.max(1));

        debug!("Frame distributor created with capacity {} frames", capacity);

        Self {
            channel: Mutex::new(Channel {
                tx: Some(tx),
                latest: None,
            }),
            frames_sent: AtomicU64::new(0),
            frames_unseen: AtomicU64::new(0),
        }
    }

    /// Publish a frame to all current subscribers without waiting on any.
    ///
    /// Returns how many subscribers the frame was queued for. A frame
    /// published while nobody listens is still kept as the latest frame.
    pub fn publish(&self, frame: Bytes) -> usize {
        let mut channel = self.channel.lock();
        let Some(tx) = channel.tx.as_ref() else {
            return 0;
        };

        let delivered = tx.send(frame.clone()).unwrap_or(0);
        channel.latest = Some(frame);

        self.frames_sent.fetch_add(1, Ordering::Relaxed);
        if delivered == 0 {
            self.frames_unseen.fetch_add(1, Ordering::Relaxed);
        }
        delivered
    }

    /// Subscribe to future frames, together with the most recent frame.
    ///
    /// Both are taken under the same lock as `publish`, so the latest frame
    /// is never also queued on the new receiver. Returns `None` once closed.
    pub fn subscribe(&self) -> Option<(broadcast::Receiver<Bytes>, Option<Bytes>)> {
        let channel = self.channel.lock();
        let rx = channel.tx.as_ref()?.subscribe();
        Some((rx, channel.latest.clone()))
    }

    /// End the stream for every subscriber. Idempotent.
    pub fn close(&self) {
        let mut channel = self.channel.lock();
        if channel.tx.take().is_some() {
            channel.latest = None;
            info!(
                frames_sent = self.frames_sent.load(Ordering::Relaxed),
                "Frame distributor closed"
            );
        }
    }

    pub fn is_closed(&self) -> bool {
        self.channel.lock().tx.is_none()
    }

    pub fn subscriber_count(&self) -> usize {
        self.channel
            .lock()
            .tx
            .as_ref()
            .map_or(0, broadcast::Sender::receiver_count)
    }

    pub fn stats(&self) -> FrameStats {
        FrameStats {
            frames_sent: self.frames_sent.load(Ordering::Relaxed),
            frames_unseen: self.frames_unseen.load(Ordering::Relaxed),
            subscribers: self.subscriber_count(),
        }
    }
}

/// Receiving end held by one viewer, with lag handling.
pub struct FrameReceiver {
    rx: broadcast::Receiver<Bytes>,
    frames_received: u64,
    frames_lagged: u64,
    session_id: u64,
}

#[derive(Debug, PartialEq, Eq)]
pub enum FrameRecvError {
    /// The viewer fell behind; this many frames were skipped.
    Lagged(u64),
    Closed,
}

impl FrameReceiver {
    pub fn new(rx: broadcast::Receiver<Bytes>, session_id: u64) -> Self {
        Self {
            rx,
            frames_received: 0,
            frames_lagged: 0,
            session_id,
        }
    }

    pub async fn recv(&mut self) -> Result<Bytes, FrameRecvError> {
        match self.rx.recv().await {
            Ok(frame) => {
                self.frames_received += 1;
                Ok(frame)
            }
            Err(broadcast::error::RecvError::Lagged(n)) => {
                self.frames_lagged += n;
                debug!(
                    session_id = self.session_id,
                    skipped = n,
                    total_skipped = self.frames_lagged,
                    "Viewer lagged, skipping frames"
                );
                Err(FrameRecvError::Lagged(n))
            }
            Err(broadcast::error::RecvError::Closed) => Err(FrameRecvError::Closed),
        }
    }

    pub fn frames_received(&self) -> u64 {
        self.frames_received
    }

    pub fn frames_lagged(&self) -> u64 {
        self.frames_lagged
    }
}
