//! Multi-source tracking.
//!
//! One [`IdentityTracker`] per source, created lazily the first time the source is
//! updated. All trackers share one id allocator, so tracking ids are unique across
//! sources. Identity resolution runs outside of every lock.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde_derive::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use crate::config::TrackerConfig;
use crate::detection::Detection;
use crate::frame::Frame;
use crate::resolver::{IdentityResolver, NullResolver};
use crate::track::{TrackedIdentity, TrackingId};
use crate::tracker::{IdAllocator, IdentityTracker, TrackerUpdate};

#[derive(Serialize, Debug, Clone, Default, PartialEq, Eq)]
pub struct SourceTrackingStats {
    pub tracked: usize,
    pub active: usize,
}

#[derive(Serialize, Debug, Clone, Default, PartialEq, Eq)]
pub struct TrackingStats {
    pub sources: usize,
    pub total_tracked: usize,
    pub total_active: usize,
    pub per_source: BTreeMap<String, SourceTrackingStats>,
}

pub struct TrackingCoordinator {
    config: TrackerConfig,
    ids: IdAllocator,
    resolver: Arc<dyn IdentityResolver>,
    trackers: Mutex<HashMap<String, Arc<Mutex<IdentityTracker>>>>,
}

impl TrackingCoordinator {
    pub fn new(config: TrackerConfig) -> Self {
        Self::with_resolver(config, Arc::new(NullResolver))
    }

    pub fn with_resolver(config: TrackerConfig, resolver: Arc<dyn IdentityResolver>) -> Self {
        Self {
            config,
            ids: IdAllocator::new(),
            resolver,
            trackers: Mutex::new(HashMap::new()),
        }
    }

    fn tracker(&self, source_id: &str) -> Arc<Mutex<IdentityTracker>> {
        let mut trackers = self.trackers.lock();

        if let Some(tracker) = trackers.get(source_id) {
            return tracker.clone();
        }

        tracing::debug!(source_id, "Creating tracker");
        trackers
            .entry(source_id.to_string())
            .or_insert_with(|| {
                Arc::new(Mutex::new(IdentityTracker::with_allocator(
                    source_id,
                    self.config,
                    self.ids.clone(),
                )))
            })
            .clone()
    }

    fn existing(&self, source_id: &str) -> Option<Arc<Mutex<IdentityTracker>>> {
        self.trackers.lock().get(source_id).cloned()
    }

    pub fn update(
        &self,
        source_id: &str,
        detections: &[Detection],
        frame: Option<&Frame>,
    ) -> TrackerUpdate {
        self.update_at(source_id, detections, frame, Utc::now())
    }

    /// Feeds one frame's detections to the source's tracker, then tries to resolve
    /// identities that have no external identity yet.
    pub fn update_at(
        &self,
        source_id: &str,
        detections: &[Detection],
        frame: Option<&Frame>,
        now: DateTime<Utc>,
    ) -> TrackerUpdate {
        let tracker = self.tracker(source_id);

        let (mut update, unresolved) = {
            let mut tracker = tracker.lock();
            let update = tracker.update_at(detections, now);
            let unresolved: Vec<_> = tracker
                .active()
                .filter(|i| i.external_identity.is_none() && i.disappeared_frames == 0)
                .map(|i| (i.tracking_id, i.bbox))
                .collect();

            (update, unresolved)
        };

        let Some(frame) = frame else {
            return update;
        };

        let names: Vec<(TrackingId, String)> = unresolved
            .into_iter()
            .filter_map(|(id, bbox)| self.resolver.identify(frame, &bbox).map(|name| (id, name)))
            .collect();

        if names.is_empty() {
            return update;
        }

        let mut tracker = tracker.lock();
        for (id, name) in names {
            if tracker.attach_external_identity(id, &name) {
                if let Some(identity) = tracker.get(id) {
                    update.identities.insert(id, identity.clone());
                    update.resolved.push(identity.clone());
                }
            }
        }

        for arrived in update.arrived.iter_mut() {
            if let Some(identity) = tracker.get(arrived.tracking_id) {
                arrived.external_identity = identity.external_identity.clone();
            }
        }

        update
    }

    /// Identities of one source that have not departed.
    pub fn active_identities(&self, source_id: &str) -> Vec<TrackedIdentity> {
        self.existing(source_id)
            .map(|t| t.lock().active().cloned().collect())
            .unwrap_or_default()
    }

    /// Active identities across all sources, ordered by tracking id.
    pub fn all_active(&self) -> Vec<TrackedIdentity> {
        let mut all: Vec<_> = self
            .snapshot_trackers()
            .into_iter()
            .flat_map(|t| t.lock().active().cloned().collect::<Vec<_>>())
            .collect();

        all.sort_by_key(|i| i.tracking_id);
        all
    }

    pub fn active_count(&self) -> usize {
        self.snapshot_trackers()
            .iter()
            .map(|t| t.lock().active_count())
            .sum()
    }

    pub fn identity(&self, source_id: &str, id: TrackingId) -> Option<TrackedIdentity> {
        self.existing(source_id)
            .and_then(|t| t.lock().get(id).cloned())
    }

    /// Departures reported by the latest update of `source_id`.
    pub fn just_departed(&self, source_id: &str) -> Vec<TrackedIdentity> {
        self.existing(source_id)
            .map(|t| t.lock().last_departures().to_vec())
            .unwrap_or_default()
    }

    pub fn sources(&self) -> Vec<String> {
        let mut sources: Vec<_> = self.trackers.lock().keys().cloned().collect();
        sources.sort();
        sources
    }

    /// Forces every present identity of the source to departed, silently.
    pub fn clear_source(&self, source_id: &str) -> bool {
        match self.existing(source_id) {
            Some(tracker) => {
                tracker.lock().clear();
                true
            }
            None => false,
        }
    }

    pub fn remove_source(&self, source_id: &str) -> bool {
        let removed = self.trackers.lock().remove(source_id).is_some();
        if removed {
            tracing::info!(source_id, "Removed tracker");
        }
        removed
    }

    pub fn statistics(&self) -> TrackingStats {
        let trackers: Vec<_> = self
            .trackers
            .lock()
            .iter()
            .map(|(id, t)| (id.clone(), t.clone()))
            .collect();

        let mut stats = TrackingStats {
            sources: trackers.len(),
            ..Default::default()
        };

        for (id, tracker) in trackers {
            let tracker = tracker.lock();
            let entry = SourceTrackingStats {
                tracked: tracker.identities().len(),
                active: tracker.active_count(),
            };

            stats.total_tracked += entry.tracked;
            stats.total_active += entry.active;
            stats.per_source.insert(id, entry);
        }

        stats
    }

    fn snapshot_trackers(&self) -> Vec<Arc<Mutex<IdentityTracker>>> {
        self.trackers.lock().values().cloned().collect()
    }
}
