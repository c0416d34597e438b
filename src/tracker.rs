//! Per-source centroid tracker.
//!
//! [`IdentityTracker`] associates the detections of one frame with the identities it
//! already follows, by greedy nearest-centroid matching under a distance threshold.
//! Identities that stay unmatched for more than `max_disappeared` consecutive frames
//! depart; a later sighting of the same person is registered as a new identity.

use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::circular_queue::CircularQueue;
use crate::config::TrackerConfig;
use crate::detection::Detection;
use crate::math;
use crate::track::{TrackedIdentity, TrackingId};

/// Hands out tracking ids; clones share the same sequence.
#[derive(Debug, Clone, Default)]
pub struct IdAllocator(Arc<AtomicU64>);

impl IdAllocator {
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub fn next_id(&self) -> TrackingId {
        self.0.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Highest id handed out so far, `0` if none.
    #[inline]
    pub fn last_id(&self) -> TrackingId {
        self.0.load(Ordering::Relaxed)
    }
}

/// Result of one [`IdentityTracker::update`] call.
#[derive(Debug, Clone, Default)]
pub struct TrackerUpdate {
    /// Every identity the tracker still knows about, in all states.
    pub identities: BTreeMap<TrackingId, TrackedIdentity>,
    /// Identities registered by this call.
    pub arrived: Vec<TrackedIdentity>,
    /// Identities that departed during this call.
    pub departed: Vec<TrackedIdentity>,
    /// Identities that got an external identity attached during this call.
    pub resolved: Vec<TrackedIdentity>,
}

impl TrackerUpdate {
    pub fn active_count(&self) -> usize {
        self.identities.values().filter(|i| i.is_present()).count()
    }
}

pub struct IdentityTracker {
    source_id: String,
    config: TrackerConfig,
    ids: IdAllocator,
    identities: BTreeMap<TrackingId, TrackedIdentity>,
    departed_order: CircularQueue<TrackingId>,
    last_departures: Vec<TrackedIdentity>,
}

impl IdentityTracker {
    pub fn new(source_id: impl Into<String>, config: TrackerConfig) -> Self {
        Self::with_allocator(source_id, config, IdAllocator::new())
    }

    pub fn with_allocator(
        source_id: impl Into<String>,
        config: TrackerConfig,
        ids: IdAllocator,
    ) -> Self {
        Self {
            source_id: source_id.into(),
            departed_order: CircularQueue::with_capacity(config.departed_history),
            config,
            ids,
            identities: BTreeMap::new(),
            last_departures: Vec::new(),
        }
    }

    #[inline]
    pub fn source_id(&self) -> &str {
        &self.source_id
    }

    #[inline]
    pub fn config(&self) -> &TrackerConfig {
        &self.config
    }

    pub fn update(&mut self, detections: &[Detection]) -> TrackerUpdate {
        self.update_at(detections, Utc::now())
    }

    pub fn update_at(&mut self, detections: &[Detection], now: DateTime<Utc>) -> TrackerUpdate {
        let mut arrived = Vec::new();
        let mut departed = Vec::new();

        let present: Vec<TrackingId> = self
            .identities
            .values()
            .filter(|i| i.is_present())
            .map(|i| i.tracking_id)
            .collect();

        if detections.is_empty() {
            for id in &present {
                self.miss(*id, now, &mut departed);
            }
        } else if present.is_empty() {
            for det in detections {
                arrived.push(self.register(det, now));
            }
        } else {
            let centroids: Vec<_> = present
                .iter()
                .filter_map(|id| self.identities.get(id))
                .map(|i| i.centroid)
                .collect();
            let centers: Vec<_> = detections.iter().map(|d| d.center).collect();

            let dist = math::distance_matrix(&centroids, &centers);
            let assignment = math::greedy_assignment(dist.view(), self.config.max_distance);

            for &(row, col, distance) in &assignment.matched {
                if let Some(identity) = self.identities.get_mut(&present[row]) {
                    identity.matched(&detections[col], now);
                    tracing::trace!(
                        source_id = %self.source_id,
                        tracking_id = identity.tracking_id,
                        distance,
                        "Matched identity"
                    );
                }
            }

            for &row in &assignment.unmatched_rows {
                self.miss(present[row], now, &mut departed);
            }

            for &col in &assignment.unmatched_cols {
                arrived.push(self.register(&detections[col], now));
            }
        }

        for identity in &departed {
            if let Some(evicted) = self.departed_order.push(identity.tracking_id) {
                self.identities.remove(&evicted);
            }
        }

        self.last_departures = departed.clone();

        TrackerUpdate {
            identities: self.identities.clone(),
            arrived,
            departed,
            resolved: Vec::new(),
        }
    }

    fn register(&mut self, det: &Detection, now: DateTime<Utc>) -> TrackedIdentity {
        let identity = TrackedIdentity::new(self.ids.next_id(), &self.source_id, det, now);

        tracing::info!(
            source_id = %self.source_id,
            tracking_id = identity.tracking_id,
            x = identity.centroid.x,
            y = identity.centroid.y,
            "Registered identity"
        );

        self.identities.insert(identity.tracking_id, identity.clone());
        identity
    }

    fn miss(&mut self, id: TrackingId, now: DateTime<Utc>, departed: &mut Vec<TrackedIdentity>) {
        let Some(identity) = self.identities.get_mut(&id) else {
            return;
        };

        if identity.missed(self.config.max_disappeared, now) {
            tracing::info!(
                source_id = %self.source_id,
                tracking_id = id,
                last_seen = %identity.last_seen,
                "Identity departed"
            );
            departed.push(identity.clone());
        }
    }

    pub fn get(&self, id: TrackingId) -> Option<&TrackedIdentity> {
        self.identities.get(&id)
    }

    /// Identities that have not departed, ordered by tracking id.
    pub fn active(&self) -> impl Iterator<Item = &TrackedIdentity> + '_ {
        self.identities.values().filter(|i| i.is_present())
    }

    pub fn active_count(&self) -> usize {
        self.active().count()
    }

    /// Full table including retained departed identities.
    #[inline]
    pub fn identities(&self) -> &BTreeMap<TrackingId, TrackedIdentity> {
        &self.identities
    }

    /// Departures reported by the latest update.
    #[inline]
    pub fn last_departures(&self) -> &[TrackedIdentity] {
        &self.last_departures
    }

    /// Attaches a resolved identity unless one is already attached.
    pub fn attach_external_identity(&mut self, id: TrackingId, external: &str) -> bool {
        match self.identities.get_mut(&id) {
            Some(identity) if identity.is_present() && identity.external_identity.is_none() => {
                tracing::info!(
                    source_id = %self.source_id,
                    tracking_id = id,
                    external_identity = external,
                    "Resolved identity"
                );
                identity.external_identity = Some(external.to_string());
                true
            }
            _ => false,
        }
    }

    /// Marks every present identity as departed without reporting departures.
    pub fn clear(&mut self) {
        let now = Utc::now();
        let cleared: Vec<TrackingId> = self.active().map(|i| i.tracking_id).collect();

        for id in &cleared {
            if let Some(identity) = self.identities.get_mut(id) {
                identity.state = crate::track::IdentityState::Departed;
                identity.departed_at = Some(now);
            }
            if let Some(evicted) = self.departed_order.push(*id) {
                self.identities.remove(&evicted);
            }
        }

        self.last_departures.clear();
        tracing::info!(source_id = %self.source_id, cleared = cleared.len(), "Cleared tracker");
    }
}
