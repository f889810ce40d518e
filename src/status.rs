//! Per-source health bookkeeping and the report served on `/health`.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Instant;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::error;

use crate::cache::FrameCache;
use crate::frame::SourceId;
use crate::service::ServiceState;
use crate::sources::SourceState;
use crate::viewers::{QualityPolicy, QualityTier, ViewerRegistry};

#[derive(Debug)]
struct StatusInner {
    state: SourceState,
    consecutive_failures: u32,
    frames_published: u64,
    last_error: Option<String>,
}

impl Default for StatusInner {
    fn default() -> Self {
        Self {
            state: SourceState::Unopened,
            consecutive_failures: 0,
            frames_published: 0,
            last_error: None,
        }
    }
}

/// Mutable status of one source, written by its capture loop.
#[derive(Debug, Default)]
pub struct SourceStatus {
    inner: Mutex<StatusInner>,
}

impl SourceStatus {
    fn inner(&self) -> MutexGuard<'_, StatusInner> {
        self.inner.lock().unwrap_or_else(|e| {
            error!("Source status mutex poisoned: {e}");
            e.into_inner()
        })
    }

    pub fn state(&self) -> SourceState {
        self.inner().state
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.inner().consecutive_failures
    }

    pub fn frames_published(&self) -> u64 {
        self.inner().frames_published
    }

    /// The camera was acquired. The failure streak only ends on a publish.
    pub fn mark_open(&self) {
        self.inner().state = SourceState::Open;
    }

    /// Record a failed open/read/encode; returns the failure streak length.
    pub fn mark_unavailable(&self, reason: impl Into<String>) -> u32 {
        let mut inner = self.inner();
        inner.state = SourceState::Unavailable;
        inner.consecutive_failures = inner.consecutive_failures.saturating_add(1);
        inner.last_error = Some(reason.into());
        inner.consecutive_failures
    }

    pub fn record_publish(&self) {
        let mut inner = self.inner();
        inner.state = SourceState::Open;
        inner.consecutive_failures = 0;
        inner.frames_published += 1;
    }

    pub fn mark_closed(&self) {
        self.inner().state = SourceState::Closed;
    }

    /// Back to `Unopened` with cleared counters, for a fresh start.
    pub fn reset(&self) {
        *self.inner() = StatusInner::default();
    }
}

/// Status of every configured source, shared by the service, its capture
/// loops and the HTTP handlers.
#[derive(Debug, Default)]
pub struct StatusBoard {
    sources: HashMap<SourceId, Arc<SourceStatus>>,
}

impl StatusBoard {
    pub fn new(sources: impl IntoIterator<Item = SourceId>) -> Self {
        Self {
            sources: sources
                .into_iter()
                .map(|id| (id, Arc::new(SourceStatus::default())))
                .collect(),
        }
    }

    pub fn get(&self, source_id: &SourceId) -> Option<Arc<SourceStatus>> {
        self.sources.get(source_id).cloned()
    }

    pub fn state(&self, source_id: &SourceId) -> Option<SourceState> {
        self.sources.get(source_id).map(|status| status.state())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&SourceId, &Arc<SourceStatus>)> {
        self.sources.iter()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SourceHealth {
    pub state: SourceState,
    pub viewer_count: usize,
    pub tier: QualityTier,
    pub frames_published: u64,
    pub consecutive_failures: u32,
    pub last_frame_age_ms: Option<u64>,
    pub last_frame_tier: Option<QualityTier>,
    pub last_error: Option<String>,
    pub feed_path: String,
    pub snapshot_path: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub state: ServiceState,
    pub started_at: Option<DateTime<Utc>>,
    pub total_viewers: usize,
    pub sources: BTreeMap<SourceId, SourceHealth>,
}

impl HealthReport {
    /// Assemble a report. `viewers` and `cache` are absent while stopped.
    pub fn collect(
        state: ServiceState,
        started_at: Option<DateTime<Utc>>,
        statuses: &StatusBoard,
        viewers: Option<&ViewerRegistry>,
        cache: Option<&FrameCache>,
        policy: &QualityPolicy,
    ) -> Self {
        let now = Instant::now();
        let sources: BTreeMap<_, _> = statuses
            .iter()
            .map(|(source_id, status)| {
                let viewer_count = viewers.map_or(0, |v| v.current_count(source_id));
                let last_frame_age_ms = cache
                    .and_then(|cache| cache.last_updated(source_id))
                    .map(|at| now.saturating_duration_since(at).as_millis() as u64);
                let last_frame_tier = cache
                    .and_then(|cache| cache.read_latest(source_id, None))
                    .map(|frame| frame.tier);
                let inner = status.inner();
                let health = SourceHealth {
                    state: inner.state,
                    viewer_count,
                    tier: policy.tier_for(viewer_count),
                    frames_published: inner.frames_published,
                    consecutive_failures: inner.consecutive_failures,
                    last_frame_age_ms,
                    last_frame_tier,
                    last_error: inner.last_error.clone(),
                    feed_path: format!("/feed/{source_id}"),
                    snapshot_path: format!("/snapshot/{source_id}"),
                };
                (source_id.clone(), health)
            })
            .collect();

        Self {
            state,
            started_at,
            total_viewers: viewers.map_or(0, ViewerRegistry::total_count),
            sources,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_transitions() {
        let status = SourceStatus::default();
        assert_eq!(status.state(), SourceState::Unopened);

        status.mark_open();
        assert_eq!(status.state(), SourceState::Open);

        assert_eq!(status.mark_unavailable("timeout"), 1);
        assert_eq!(status.mark_unavailable("timeout"), 2);
        assert_eq!(status.state(), SourceState::Unavailable);

        status.record_publish();
        assert_eq!(status.state(), SourceState::Open);
        assert_eq!(status.consecutive_failures(), 0);
        assert_eq!(status.frames_published(), 1);

        status.mark_closed();
        assert_eq!(status.state(), SourceState::Closed);
        status.reset();
        assert_eq!(status.state(), SourceState::Unopened);
        assert_eq!(status.frames_published(), 0);
    }

    #[test]
    fn test_report_without_running_service() {
        let board = StatusBoard::new([SourceId::from("robot"), SourceId::from("usb")]);
        if let Some(status) = board.get(&SourceId::from("usb")) {
            status.mark_unavailable("no device");
        }

        let report = HealthReport::collect(
            ServiceState::Stopped,
            None,
            &board,
            None,
            None,
            &QualityPolicy::default(),
        );
        assert_eq!(report.total_viewers, 0);
        let usb = &report.sources[&SourceId::from("usb")];
        assert_eq!(usb.state, SourceState::Unavailable);
        assert_eq!(usb.last_error.as_deref(), Some("no device"));
        assert_eq!(usb.tier, QualityTier::Idle);
        let robot = &report.sources[&SourceId::from("robot")];
        assert_eq!(robot.feed_path, "/feed/robot");
    }
}
