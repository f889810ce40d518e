//! Background capture loop, one per source.
//!
//! Each cycle waits out the rest of the frame interval, reads a frame from
//! the source worker, encodes it once at the tier the current viewer count
//! calls for, and publishes it to the cache. Failures mark the source
//! unavailable and push the next attempt back, but never end the loop; only
//! the shutdown signal does.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::cache::FrameCache;
use crate::encoder;
use crate::frame::SourceId;
use crate::sources::SourceHandle;
use crate::status::SourceStatus;
use crate::viewers::{QualityPolicy, ViewerRegistry};
use crate::{OurError, OurResult};

/// Delay before the next attempt after `failures` consecutive failures.
///
/// Doubles from the capture interval and is capped at `max_backoff` (or the
/// interval itself, if that is longer).
pub fn retry_delay(interval: Duration, max_backoff: Duration, failures: u32) -> Duration {
    let cap = max_backoff.max(interval);
    if failures == 0 {
        return interval;
    }
    let factor = 1u32.checked_shl(failures - 1).unwrap_or(u32::MAX);
    interval.checked_mul(factor).unwrap_or(cap).min(cap)
}

/// Resolves once shutdown has been requested or the service went away.
pub async fn shutdown_requested(shutdown: &mut watch::Receiver<bool>) {
    let _ = shutdown.wait_for(|stop| *stop).await;
}

pub struct CaptureLoop {
    pub source_id: SourceId,
    pub handle: SourceHandle,
    pub cache: Arc<FrameCache>,
    pub viewers: Arc<ViewerRegistry>,
    pub status: Arc<SourceStatus>,
    pub policy: QualityPolicy,
    pub interval: Duration,
    pub max_backoff: Duration,
    pub shutdown: watch::Receiver<bool>,
}

impl CaptureLoop {
    /// Run until shutdown, then hand the source back for closing.
    pub async fn run(self) -> SourceHandle {
        let mut shutdown = self.shutdown.clone();
        info!(
            "Capture loop for {} started, interval {:?}",
            self.source_id, self.interval
        );

        let mut next_attempt = Instant::now();
        let mut failures: u32 = 0;
        loop {
            tokio::select! {
                biased;
                _ = shutdown_requested(&mut shutdown) => break,
                _ = tokio::time::sleep_until(next_attempt) => {}
            }

            let started = Instant::now();
            let outcome = tokio::select! {
                biased;
                _ = shutdown_requested(&mut shutdown) => break,
                outcome = self.cycle() => outcome,
            };

            match outcome {
                Ok(()) => {
                    if failures > 0 {
                        info!(
                            "Source {} recovered after {failures} failed attempts",
                            self.source_id
                        );
                    }
                    failures = 0;
                    next_attempt = started + self.interval;
                }
                Err(e) => {
                    failures = self.status.mark_unavailable(e.to_string());
                    let delay = retry_delay(self.interval, self.max_backoff, failures);
                    if failures == 1 {
                        warn!("Source {} unavailable: {e}", self.source_id);
                    } else {
                        debug!(
                            "Source {} still down ({failures} failures, retry in {delay:?}): {e}",
                            self.source_id
                        );
                    }
                    next_attempt = started + delay;
                }
            }
        }

        info!("Capture loop for {} stopped", self.source_id);
        self.handle
    }

    async fn cycle(&self) -> OurResult<()> {
        if !self.handle.is_open() {
            self.handle.open().await?;
            self.status.mark_open();
        }

        let raw = self.handle.read_frame().await?;
        let tier = self.policy.tier_for(self.viewers.current_count(&self.source_id));
        let policy = self.policy.clone();
        let (raw, encoded) = tokio::task::spawn_blocking(move || {
            encoder::encode(&raw, tier, &policy).map(|encoded| (raw, encoded))
        })
        .await
        .map_err(|e| OurError::App(format!("encode task failed: {e}")))??;

        debug!(
            "Publishing {} byte {:?} frame for {}",
            encoded.len(),
            tier,
            self.source_id
        );
        self.cache.publish(&self.source_id, Arc::new(raw), encoded)?;
        self.status.record_publish();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retry_delay_is_capped_exponential() {
        let interval = Duration::from_millis(100);
        let cap = Duration::from_millis(1000);
        assert_eq!(retry_delay(interval, cap, 0), interval);
        assert_eq!(retry_delay(interval, cap, 1), Duration::from_millis(100));
        assert_eq!(retry_delay(interval, cap, 2), Duration::from_millis(200));
        assert_eq!(retry_delay(interval, cap, 3), Duration::from_millis(400));
        assert_eq!(retry_delay(interval, cap, 4), Duration::from_millis(800));
        assert_eq!(retry_delay(interval, cap, 5), cap);
        assert_eq!(retry_delay(interval, cap, 200), cap);
    }

    #[test]
    fn test_retry_delay_never_below_interval() {
        let interval = Duration::from_secs(2);
        assert_eq!(
            retry_delay(interval, Duration::from_millis(500), 3),
            interval
        );
    }
}
