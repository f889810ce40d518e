//! Viewer bookkeeping and the adaptive quality policy it drives.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use serde::{Deserialize, Serialize};
use tracing::{debug, error};
use uuid::Uuid;

use crate::frame::SourceId;
use crate::{OurError, OurResult};

/// Discrete encode setting picked from the current viewer load.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QualityTier {
    Idle,
    High,
    Medium,
    Low,
}

/// Viewer-count thresholds and the JPEG quality used for each tier.
///
/// The idle tier only feeds snapshots, so it may be configured above the
/// high tier. Among tiers that have viewers, one viewer always gets the
/// highest quality.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QualityPolicy {
    /// JPEG quality while nobody is watching (frames still feed snapshots)
    pub idle_quality: u8,
    /// JPEG quality for a single viewer
    pub high_quality: u8,
    pub medium_quality: u8,
    pub low_quality: u8,
    /// Viewer count at which the medium tier starts
    pub medium_from_viewers: usize,
    /// Viewer count at which the low tier starts
    pub low_from_viewers: usize,
}

impl Default for QualityPolicy {
    fn default() -> Self {
        Self {
            idle_quality: 85,
            high_quality: 85,
            medium_quality: 70,
            low_quality: 50,
            medium_from_viewers: 2,
            low_from_viewers: 4,
        }
    }
}

impl QualityPolicy {
    pub fn tier_for(&self, viewers: usize) -> QualityTier {
        match viewers {
            0 => QualityTier::Idle,
            n if n >= self.low_from_viewers => QualityTier::Low,
            n if n >= self.medium_from_viewers => QualityTier::Medium,
            _ => QualityTier::High,
        }
    }

    pub fn jpeg_quality(&self, tier: QualityTier) -> u8 {
        match tier {
            QualityTier::Idle => self.idle_quality,
            QualityTier::High => self.high_quality,
            QualityTier::Medium => self.medium_quality,
            QualityTier::Low => self.low_quality,
        }
    }

    /// Rejects policies where quality could rise as viewers are added.
    pub fn validate(&self) -> OurResult<()> {
        let qualities = [
            ("idle_quality", self.idle_quality),
            ("high_quality", self.high_quality),
            ("medium_quality", self.medium_quality),
            ("low_quality", self.low_quality),
        ];
        for (name, quality) in qualities {
            if !(1..=100).contains(&quality) {
                return Err(OurError::Config(format!(
                    "{name} must be between 1 and 100, got {quality}"
                )));
            }
        }
        if qualities.windows(2).any(|pair| pair[1].1 > pair[0].1) {
            return Err(OurError::Config(
                "quality must not increase with viewer count (idle >= high >= medium >= low)"
                    .to_string(),
            ));
        }
        if self.medium_from_viewers < 2 {
            return Err(OurError::Config(
                "medium_from_viewers must be at least 2".to_string(),
            ));
        }
        if self.low_from_viewers <= self.medium_from_viewers {
            return Err(OurError::Config(
                "low_from_viewers must be greater than medium_from_viewers".to_string(),
            ));
        }
        Ok(())
    }
}

pub type SessionId = Uuid;

/// Per-source counts of attached stream viewers.
///
/// Counters are created up front for every configured source, so the hot
/// path only touches an atomic. The session map exists to make `detach`
/// idempotent.
#[derive(Debug)]
pub struct ViewerRegistry {
    counts: HashMap<SourceId, AtomicUsize>,
    sessions: Mutex<HashMap<SessionId, SourceId>>,
}

impl ViewerRegistry {
    pub fn new(sources: impl IntoIterator<Item = SourceId>) -> Self {
        Self {
            counts: sources
                .into_iter()
                .map(|id| (id, AtomicUsize::new(0)))
                .collect(),
            sessions: Mutex::new(HashMap::new()),
        }
    }

    fn sessions(&self) -> MutexGuard<'_, HashMap<SessionId, SourceId>> {
        self.sessions.lock().unwrap_or_else(|e| {
            error!("Viewer session mutex poisoned: {e}");
            e.into_inner()
        })
    }

    pub fn attach(&self, source_id: &SourceId) -> OurResult<SessionId> {
        let counter = self
            .counts
            .get(source_id)
            .ok_or_else(|| OurError::UnknownSource(source_id.clone()))?;
        let session_id = Uuid::new_v4();
        self.sessions().insert(session_id, source_id.clone());
        let now = counter.fetch_add(1, Ordering::AcqRel) + 1;
        debug!("Viewer {session_id} attached to {source_id} ({now} watching)");
        Ok(session_id)
    }

    /// Attach and get a guard that detaches when dropped.
    pub fn attach_lease(self: &Arc<Self>, source_id: &SourceId) -> OurResult<ViewerLease> {
        let session_id = self.attach(source_id)?;
        Ok(ViewerLease {
            registry: Arc::clone(self),
            session_id,
            source_id: source_id.clone(),
        })
    }

    /// Detaching an unknown or already detached session is a no-op.
    pub fn detach(&self, session_id: SessionId) {
        let Some(source_id) = self.sessions().remove(&session_id) else {
            debug!("Viewer {session_id} already detached");
            return;
        };
        if let Some(counter) = self.counts.get(&source_id) {
            // Removal from the session map is the single ticket for this
            // decrement, so the counter cannot underflow.
            let now = counter.fetch_sub(1, Ordering::AcqRel).saturating_sub(1);
            debug!("Viewer {session_id} detached from {source_id} ({now} watching)");
        }
    }

    pub fn current_count(&self, source_id: &SourceId) -> usize {
        self.counts
            .get(source_id)
            .map(|counter| counter.load(Ordering::Acquire))
            .unwrap_or(0)
    }

    pub fn total_count(&self) -> usize {
        self.counts
            .values()
            .map(|counter| counter.load(Ordering::Acquire))
            .sum()
    }
}

/// An attached viewer. Dropping it detaches the session.
#[derive(Debug)]
pub struct ViewerLease {
    registry: Arc<ViewerRegistry>,
    session_id: SessionId,
    source_id: SourceId,
}

impl ViewerLease {
    pub fn session_id(&self) -> SessionId {
        self.session_id
    }

    pub fn source_id(&self) -> &SourceId {
        &self.source_id
    }
}

impl Drop for ViewerLease {
    fn drop(&mut self) {
        self.registry.detach(self.session_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry() -> Arc<ViewerRegistry> {
        Arc::new(ViewerRegistry::new([
            SourceId::from("robot"),
            SourceId::from("usb"),
        ]))
    }

    #[test]
    fn test_default_policy_shape() {
        let policy = QualityPolicy::default();
        assert!(policy.validate().is_ok());
        assert_eq!(policy.tier_for(0), QualityTier::Idle);
        assert_eq!(policy.tier_for(1), QualityTier::High);
        assert_eq!(policy.tier_for(2), QualityTier::Medium);
        assert_eq!(policy.tier_for(3), QualityTier::Medium);
        assert_eq!(policy.tier_for(4), QualityTier::Low);
        assert_eq!(policy.tier_for(400), QualityTier::Low);
    }

    #[test]
    fn test_quality_never_increases_with_viewers() {
        let policy = QualityPolicy::default();
        let mut previous = policy.jpeg_quality(policy.tier_for(0));
        for viewers in 1..64 {
            let quality = policy.jpeg_quality(policy.tier_for(viewers));
            assert!(
                quality <= previous,
                "quality rose from {previous} to {quality} at {viewers} viewers"
            );
            previous = quality;
        }
    }

    #[test]
    fn test_policy_rejects_rising_quality() {
        let policy = QualityPolicy {
            medium_quality: 90,
            ..Default::default()
        };
        assert!(matches!(policy.validate(), Err(OurError::Config(_))));

        let policy = QualityPolicy {
            low_from_viewers: 2,
            ..Default::default()
        };
        assert!(policy.validate().is_err());
    }

    #[test]
    fn test_idle_may_exceed_high_but_one_viewer_is_best_served() {
        let policy = QualityPolicy {
            idle_quality: 95,
            ..Default::default()
        };
        assert!(policy.validate().is_ok());

        let one = policy.jpeg_quality(policy.tier_for(1));
        for viewers in 2..10 {
            assert!(policy.jpeg_quality(policy.tier_for(viewers)) <= one);
        }
        assert!(policy.jpeg_quality(QualityTier::Idle) > one);
    }

    #[test]
    fn test_attach_detach_counts() {
        let registry = registry();
        let robot = SourceId::from("robot");
        let a = registry.attach(&robot).expect("attach");
        let b = registry.attach(&robot).expect("attach");
        assert_eq!(registry.current_count(&robot), 2);
        assert_eq!(registry.current_count(&SourceId::from("usb")), 0);

        registry.detach(a);
        registry.detach(a);
        assert_eq!(registry.current_count(&robot), 1);
        registry.detach(b);
        registry.detach(Uuid::new_v4());
        assert_eq!(registry.current_count(&robot), 0);
    }

    #[test]
    fn test_attach_unknown_source() {
        let registry = registry();
        let result = registry.attach(&SourceId::from("nope"));
        assert!(matches!(result, Err(OurError::UnknownSource(_))));
        assert_eq!(registry.total_count(), 0);
    }

    #[test]
    fn test_lease_detaches_on_drop() {
        let registry = registry();
        let robot = SourceId::from("robot");
        {
            let lease = registry.attach_lease(&robot).expect("lease");
            assert_eq!(lease.source_id(), &robot);
            assert_eq!(registry.current_count(&robot), 1);
            registry.detach(lease.session_id());
            assert_eq!(registry.current_count(&robot), 0);
        }
        // the lease's own detach after an explicit one must not underflow
        assert_eq!(registry.current_count(&robot), 0);
    }

    #[test]
    fn test_concurrent_attach_detach_has_no_lost_updates() {
        let registry = registry();
        let robot = SourceId::from("robot");
        let handles: Vec<_> = (0..8)
            .map(|thread| {
                let registry = Arc::clone(&registry);
                let robot = robot.clone();
                std::thread::spawn(move || {
                    let sessions: Vec<_> = (0..100)
                        .map(|_| registry.attach(&robot).expect("attach"))
                        .collect();
                    // detach 40 of every 100 attaches, keep the rest
                    for session in sessions.iter().skip(thread % 2).take(40) {
                        registry.detach(*session);
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().expect("worker thread");
        }
        assert_eq!(registry.current_count(&robot), 8 * (100 - 40));
    }
}
