//! Live MJPEG feeds.
//!
//! Every viewer gets its own [`StreamSession`], but sessions never encode:
//! they poll the shared cache and forward whichever frame is newest, so a
//! slow viewer skips frames instead of queueing them.

use std::convert::Infallible;
use std::time::{Duration, Instant};

use axum::body::Body;
use axum::http::header;
use bytes::Bytes;
use futures_util::Stream;
use tokio::sync::watch;

use super::prelude::*;
use crate::cache::FrameCache;
use crate::capture::shutdown_requested;
use crate::encoder::CONTENT_TYPE;
use crate::frame::EncodedFrame;
use crate::viewers::ViewerLease;

/// Multipart boundary between JPEG parts.
pub const BOUNDARY: &str = "frame";

fn part_header(frame: &EncodedFrame) -> Bytes {
    Bytes::from(format!(
        "--{BOUNDARY}\r\nContent-Type: {CONTENT_TYPE}\r\nContent-Length: {}\r\n\r\n",
        frame.len()
    ))
}

/// One viewer attached to one source's feed.
///
/// The session owns the viewer lease, so however the stream ends (client
/// gone, shutdown, error) the viewer count goes back down.
pub struct StreamSession {
    lease: ViewerLease,
    cache: Arc<FrameCache>,
    poll_interval: Duration,
    shutdown: watch::Receiver<bool>,
}

impl StreamSession {
    pub fn new(
        lease: ViewerLease,
        cache: Arc<FrameCache>,
        poll_interval: Duration,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            lease,
            cache,
            poll_interval,
            shutdown,
        }
    }

    /// Multipart body chunks. Each frame becomes a part header, the shared
    /// JPEG bytes and a trailing CRLF.
    pub fn into_stream(self) -> impl Stream<Item = Result<Bytes, Infallible>> + Send + 'static {
        let Self {
            lease,
            cache,
            poll_interval,
            mut shutdown,
        } = self;

        async_stream::stream! {
            let source_id = lease.source_id().clone();
            let mut last_sent: Option<Instant> = None;
            let mut frames_sent: u64 = 0;

            loop {
                if *shutdown.borrow() {
                    break;
                }
                match cache.read_latest(&source_id, last_sent) {
                    Some(frame) => {
                        last_sent = Some(frame.captured_at);
                        frames_sent += 1;
                        yield Ok(part_header(&frame));
                        yield Ok(frame.data.clone());
                        yield Ok(Bytes::from_static(b"\r\n"));
                    }
                    None => {
                        tokio::select! {
                            _ = shutdown_requested(&mut shutdown) => break,
                            _ = tokio::time::sleep(poll_interval) => {}
                        }
                    }
                }
            }

            debug!(
                "Stream session {} on {source_id} ended after {frames_sent} frames",
                lease.session_id()
            );
            drop(lease);
        }
    }
}

/// `GET /feed/{source}`
#[instrument(level = "debug", skip(state))]
pub(crate) async fn live_feed(
    Path(source): Path<String>,
    State(state): State<Arc<AppState>>,
) -> Response {
    let source_id = SourceId::from(source);
    let Some(source_state) = state.statuses.state(&source_id) else {
        return error_response(StatusCode::NOT_FOUND, format!("Unknown source {source_id}"));
    };
    if state.lifecycle.state() != ServiceState::Running {
        return error_response(
            StatusCode::SERVICE_UNAVAILABLE,
            "Feed service is not running",
        );
    }
    if source_state != SourceState::Open {
        return error_response(
            StatusCode::SERVICE_UNAVAILABLE,
            format!("Source {source_id} is unavailable"),
        );
    }

    let lease = match state.viewers.attach_lease(&source_id) {
        Ok(lease) => lease,
        Err(e) => {
            error!("Failed to attach viewer to {source_id}: {e}");
            return error_response(StatusCode::NOT_FOUND, e.to_string());
        }
    };
    let session = StreamSession::new(
        lease,
        Arc::clone(&state.cache),
        state.settings.poll_interval,
        state.shutdown.clone(),
    );
    (
        [(
            header::CONTENT_TYPE,
            format!("multipart/x-mixed-replace; boundary={BOUNDARY}"),
        )],
        Body::from_stream(session.into_stream()),
    )
        .into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::RawFrame;
    use crate::viewers::{QualityTier, ViewerRegistry};
    use futures_util::StreamExt;

    fn publish(cache: &FrameCache, source_id: &SourceId, at: Instant, payload: &'static [u8]) {
        let encoded = EncodedFrame {
            data: Bytes::from_static(payload),
            tier: QualityTier::Idle,
            jpeg_quality: 85,
            width: 1,
            height: 1,
            captured_at: at,
        };
        let raw = Arc::new(RawFrame::captured_at(1, 1, vec![0; 3], at));
        cache.publish(source_id, raw, encoded).expect("publish");
    }

    #[tokio::test]
    async fn test_session_emits_parts_and_detaches_on_drop() {
        let robot = SourceId::from("robot");
        let cache = Arc::new(FrameCache::new([robot.clone()]));
        let viewers = Arc::new(ViewerRegistry::new([robot.clone()]));
        let (_tx, rx) = watch::channel(false);
        publish(&cache, &robot, Instant::now(), b"JPEG");

        let lease = viewers.attach_lease(&robot).expect("attach");
        let stream = StreamSession::new(lease, Arc::clone(&cache), Duration::from_millis(5), rx)
            .into_stream();
        let mut stream = Box::pin(stream);

        let header = stream.next().await.expect("header").expect("chunk");
        assert_eq!(
            header,
            Bytes::from_static(b"--frame\r\nContent-Type: image/jpeg\r\nContent-Length: 4\r\n\r\n")
        );
        let body = stream.next().await.expect("body").expect("chunk");
        assert_eq!(body, Bytes::from_static(b"JPEG"));
        let trailer = stream.next().await.expect("trailer").expect("chunk");
        assert_eq!(trailer, Bytes::from_static(b"\r\n"));
        assert_eq!(viewers.current_count(&robot), 1);

        drop(stream);
        assert_eq!(viewers.current_count(&robot), 0);
    }

    #[tokio::test]
    async fn test_session_ends_on_shutdown() {
        let robot = SourceId::from("robot");
        let cache = Arc::new(FrameCache::new([robot.clone()]));
        let viewers = Arc::new(ViewerRegistry::new([robot.clone()]));
        let (tx, rx) = watch::channel(false);

        let lease = viewers.attach_lease(&robot).expect("attach");
        let stream = StreamSession::new(lease, Arc::clone(&cache), Duration::from_millis(5), rx)
            .into_stream();
        let collector = tokio::spawn(async move { stream.collect::<Vec<_>>().await });

        tokio::time::sleep(Duration::from_millis(20)).await;
        tx.send(true).expect("send shutdown");
        let chunks = tokio::time::timeout(Duration::from_secs(1), collector)
            .await
            .expect("session should end")
            .expect("join");
        assert!(chunks.is_empty());
        assert_eq!(viewers.current_count(&robot), 0);
    }

    #[tokio::test]
    async fn test_session_skips_to_newest_frame() {
        let robot = SourceId::from("robot");
        let cache = Arc::new(FrameCache::new([robot.clone()]));
        let viewers = Arc::new(ViewerRegistry::new([robot.clone()]));
        let (_tx, rx) = watch::channel(false);
        let base = Instant::now();
        publish(&cache, &robot, base, b"one");
        publish(&cache, &robot, base + Duration::from_millis(1), b"two");

        let lease = viewers.attach_lease(&robot).expect("attach");
        let stream = StreamSession::new(lease, cache, Duration::from_millis(5), rx).into_stream();
        let mut stream = Box::pin(stream);
        let _header = stream.next().await;
        let body = stream.next().await.expect("body").expect("chunk");
        assert_eq!(body, Bytes::from_static(b"two"));
    }
}
