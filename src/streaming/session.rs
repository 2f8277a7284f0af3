use bytes::{BufMut, Bytes, BytesMut};
use futures_util::stream::{self, Stream};
use std::convert::Infallible;
use std::time::Duration;
use tokio::sync::mpsc::{self, error::SendTimeoutError};
use tracing::{info, warn};

use super::hub::Subscription;

/// Multipart boundary shared by every MJPEG response
pub const BOUNDARY: &str = "frame";

/// Response content type for MJPEG streams
pub const CONTENT_TYPE: &str = "multipart/x-mixed-replace; boundary=frame";

const PART_HEADER: &[u8] = b"--frame\r\nContent-Type: image/jpeg\r\n\r\n";
const PART_TRAILER: &[u8] = b"\r\n";

/// Parts waiting for the transport beyond the one being written
const PART_QUEUE: usize = 1;

/// Wrap one JPEG in multipart framing. An empty `jpeg` yields a placeholder
/// part with correct framing and no body.
pub fn encode_part(jpeg: &[u8]) -> Bytes {
    let mut part = BytesMut::with_capacity(PART_HEADER.len() + jpeg.len() + PART_TRAILER.len());
    part.put_slice(PART_HEADER);
    part.put_slice(jpeg);
    part.put_slice(PART_TRAILER);
    part.freeze()
}

/// One HTTP client watching a camera
///
/// Pulls frames from its [`Subscription`] and frames them as multipart parts.
/// A part the transport does not accept within `write_timeout` ends the
/// session, as does the client going away. Either way the subscription is
/// dropped and the viewer detaches from the hub.
pub struct ViewerSession {
    subscription: Subscription,
    write_timeout: Duration,
    parts_written: u64,
    placeholders_written: u64,
}

impl ViewerSession {
    pub fn new(subscription: Subscription, write_timeout: Duration) -> Self {
        Self {
            subscription,
            write_timeout,
            parts_written: 0,
            placeholders_written: 0,
        }
    }

    pub fn camera_id(&self) -> u32 {
        self.subscription.camera_id()
    }

    /// Next framed part, or `None` when the stream has ended.
    pub async fn next_part(&mut self) -> Option<Bytes> {
        let frame = self.subscription.next_frame().await?;

        self.parts_written += 1;
        if frame.is_empty() {
            self.placeholders_written += 1;
        }
        Some(encode_part(&frame))
    }

    /// Body stream for `axum::body::Body::from_stream`.
    ///
    /// Spawns the task that feeds it, so it must be called inside a Tokio
    /// runtime.
    pub fn into_stream(self) -> impl Stream<Item = Result<Bytes, Infallible>> + Send {
        let (tx, rx) = mpsc::channel(PART_QUEUE);
        tokio::spawn(self.forward(tx));

        stream::unfold(rx, |mut rx| async move {
            let part = rx.recv().await?;
            Some((Ok(part), rx))
        })
    }

    async fn forward(mut self, tx: mpsc::Sender<Bytes>) {
        loop {
            let part = tokio::select! {
                part = self.next_part() => part,
                _ = tx.closed() => None,
            };
            let Some(part) = part else {
                break;
            };

            match tx.send_timeout(part, self.write_timeout).await {
                Ok(()) => {}
                Err(SendTimeoutError::Timeout(_)) => {
                    warn!(
                        camera_id = self.camera_id(),
                        session_id = self.subscription.session_id(),
                        timeout_ms = self.write_timeout.as_millis() as u64,
                        "Viewer stopped reading, dropping it"
                    );
                    break;
                }
                Err(SendTimeoutError::Closed(_)) => break,
            }
        }
    }
}

impl Drop for ViewerSession {
    fn drop(&mut self) {
        info!(
            camera_id = self.subscription.camera_id(),
            session_id = self.subscription.session_id(),
            parts = self.parts_written,
            placeholders = self.placeholders_written,
            skipped = self.subscription.frames_skipped(),
            duration_ms = self.subscription.attached_at().elapsed().as_millis() as u64,
            "Viewer session ended"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::camera::SourceOpener;
    use crate::streaming::{HubConfig, StreamHub};
    use crate::testing::{PassthroughEncoder, Script, ScriptedOpener};
    use futures_util::StreamExt;
    use std::sync::Arc;
    use std::time::Duration;

    #[test]
    fn test_part_framing() {
        assert_eq!(
            &encode_part(b"JPEG")[..],
            b"--frame\r\nContent-Type: image/jpeg\r\n\r\nJPEG\r\n"
        );
    }

    #[test]
    fn test_placeholder_framing() {
        assert_eq!(
            &encode_part(b"")[..],
            b"--frame\r\nContent-Type: image/jpeg\r\n\r\n\r\n"
        );
    }

    #[test]
    fn test_content_type_names_boundary() {
        assert!(CONTENT_TYPE.ends_with(&format!("boundary={BOUNDARY}")));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_stream_ends_after_source_ends() {
        let opener = Arc::new(ScriptedOpener::new(Script::limited(
            Duration::from_millis(2),
            3,
        )));
        let hub = Arc::new(StreamHub::new(
            1,
            "rtsp://cam.local/feed",
            opener as Arc<dyn SourceOpener>,
            Arc::new(PassthroughEncoder),
            HubConfig {
                channel_capacity: 8,
                ..HubConfig::default()
            },
        ));

        let session = ViewerSession::new(hub.attach().await.unwrap(), Duration::from_secs(5));
        let parts: Vec<Bytes> = tokio::time::timeout(
            Duration::from_secs(5),
            session
                .into_stream()
                .map(|part| part.unwrap_or_else(|never| match never {}))
                .collect(),
        )
        .await
        .unwrap();

        assert_eq!(parts.len(), 3);
        assert_eq!(parts[2], encode_part(b"frame-2"));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_unread_stream_is_dropped_after_write_timeout() {
        let opener = Arc::new(ScriptedOpener::new(Script::endless(Duration::from_millis(2))));
        let hub = Arc::new(StreamHub::new(
            1,
            "rtsp://cam.local/feed",
            Arc::clone(&opener) as Arc<dyn SourceOpener>,
            Arc::new(PassthroughEncoder),
            HubConfig::default(),
        ));

        let session = ViewerSession::new(hub.attach().await.unwrap(), Duration::from_millis(50));
        let mut body = Box::pin(session.into_stream());

        // Take one part, then stop reading
        let first = tokio::time::timeout(Duration::from_secs(5), body.next())
            .await
            .unwrap();
        assert!(first.is_some());

        tokio::time::timeout(Duration::from_secs(5), async {
            while opener.open_now() > 0 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
        assert_eq!(hub.viewer_count(), 0);

        // Whatever was queued drains, then the body ends
        let rest: Vec<_> = tokio::time::timeout(Duration::from_secs(5), body.collect())
            .await
            .unwrap();
        assert!(rest.len() <= PART_QUEUE + 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_dropped_body_detaches() {
        let opener = Arc::new(ScriptedOpener::new(Script::endless(Duration::from_millis(5))));
        let hub = Arc::new(StreamHub::new(
            1,
            "rtsp://cam.local/feed",
            Arc::clone(&opener) as Arc<dyn SourceOpener>,
            Arc::new(PassthroughEncoder),
            HubConfig::default(),
        ));

        let session = ViewerSession::new(hub.attach().await.unwrap(), Duration::from_secs(5));
        let mut body = Box::pin(session.into_stream());
        assert!(body.next().await.is_some());
        drop(body);

        tokio::time::timeout(Duration::from_secs(5), async {
            while opener.open_now() > 0 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
        assert_eq!(hub.viewer_count(), 0);
    }
}
