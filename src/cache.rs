//! Latest-frame cache, one slot per source.
//!
//! Each slot has its own mutex, held only long enough to swap or clone a
//! couple of `Arc`s. The capture loop of a source is the only writer of its
//! slot; stream sessions and snapshot requests only read.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Instant;

use tracing::error;

use crate::frame::{EncodedFrame, RawFrame, SourceId};
use crate::{OurError, OurResult};

#[derive(Debug, Default)]
struct CacheSlot {
    raw: Option<Arc<RawFrame>>,
    encoded: Option<EncodedFrame>,
    last_updated: Option<Instant>,
}

/// Whatever a slot currently holds, regardless of freshness.
#[derive(Debug, Clone)]
pub struct Snapshot {
    pub raw: Arc<RawFrame>,
    pub encoded: EncodedFrame,
}

#[derive(Debug)]
pub struct FrameCache {
    slots: HashMap<SourceId, Mutex<CacheSlot>>,
}

impl FrameCache {
    pub fn new(sources: impl IntoIterator<Item = SourceId>) -> Self {
        Self {
            slots: sources
                .into_iter()
                .map(|id| (id, Mutex::new(CacheSlot::default())))
                .collect(),
        }
    }

    fn slot(&self, source_id: &SourceId) -> Option<MutexGuard<'_, CacheSlot>> {
        self.slots.get(source_id).map(|slot| {
            slot.lock().unwrap_or_else(|e| {
                error!("Frame cache slot for {source_id} poisoned: {e}");
                e.into_inner()
            })
        })
    }

    /// Replace the slot contents with a freshly encoded frame.
    pub fn publish(
        &self,
        source_id: &SourceId,
        raw: Arc<RawFrame>,
        encoded: EncodedFrame,
    ) -> OurResult<()> {
        let mut slot = self
            .slot(source_id)
            .ok_or_else(|| OurError::UnknownSource(source_id.clone()))?;
        slot.last_updated = Some(encoded.captured_at);
        slot.raw = Some(raw);
        slot.encoded = Some(encoded);
        Ok(())
    }

    /// The cached frame if it is strictly newer than `since`.
    ///
    /// `None` for `since` means the caller has not seen any frame yet.
    pub fn read_latest(
        &self,
        source_id: &SourceId,
        since: Option<Instant>,
    ) -> Option<EncodedFrame> {
        let slot = self.slot(source_id)?;
        let encoded = slot.encoded.as_ref()?;
        match since {
            Some(since) if encoded.captured_at <= since => None,
            _ => Some(encoded.clone()),
        }
    }

    pub fn read_snapshot(&self, source_id: &SourceId) -> Option<Snapshot> {
        let slot = self.slot(source_id)?;
        Some(Snapshot {
            raw: Arc::clone(slot.raw.as_ref()?),
            encoded: slot.encoded.clone()?,
        })
    }

    pub fn last_updated(&self, source_id: &SourceId) -> Option<Instant> {
        self.slot(source_id)?.last_updated
    }

    pub fn contains(&self, source_id: &SourceId) -> bool {
        self.slots.contains_key(source_id)
    }

    /// Drop every cached frame.
    pub fn clear(&self) {
        for source_id in self.slots.keys() {
            if let Some(mut slot) = self.slot(source_id) {
                *slot = CacheSlot::default();
            }
        }
    }
}
