use chrono::{DateTime, Utc};
use nalgebra as na;
use serde_derive::{Deserialize, Serialize};

use crate::bbox::{BBox, Ltwh};
use crate::detection::Detection;

pub type TrackingId = u64;

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum IdentityState {
    /// Matched on the last processed frame.
    Active,
    /// Missed at least one frame but still within tolerance.
    Disappeared,
    /// Missed more frames than tolerated; never reverted.
    Departed,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct TrackedIdentity {
    pub tracking_id: TrackingId,
    pub external_identity: Option<String>,
    pub centroid: na::Point2<f32>,
    pub bbox: BBox<Ltwh>,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    /// Set once, on the frame that exceeded the miss tolerance.
    #[serde(default)]
    pub departed_at: Option<DateTime<Utc>>,
    pub disappeared_frames: u32,
    pub state: IdentityState,
    pub source_id: String,
    pub confidence: f32,
}

impl TrackedIdentity {
    pub(crate) fn new(
        tracking_id: TrackingId,
        source_id: &str,
        det: &Detection,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            tracking_id,
            external_identity: None,
            centroid: det.center,
            bbox: det.bbox,
            first_seen: now,
            last_seen: now,
            departed_at: None,
            disappeared_frames: 0,
            state: IdentityState::Active,
            source_id: source_id.to_string(),
            confidence: det.confidence,
        }
    }

    /// Still tracked, whether seen on the last frame or not.
    #[inline]
    pub fn is_present(&self) -> bool {
        self.state != IdentityState::Departed
    }

    #[inline]
    pub fn is_departed(&self) -> bool {
        self.state == IdentityState::Departed
    }

    pub(crate) fn matched(&mut self, det: &Detection, now: DateTime<Utc>) {
        self.centroid = det.center;
        self.bbox = det.bbox;
        self.confidence = det.confidence;
        self.disappeared_frames = 0;
        self.last_seen = now;
        self.state = IdentityState::Active;
    }

    /// Counts one missed frame. Returns `true` on the transition to `Departed`.
    pub(crate) fn missed(&mut self, max_disappeared: u32, now: DateTime<Utc>) -> bool {
        if self.is_departed() {
            return false;
        }

        self.disappeared_frames += 1;

        if self.disappeared_frames > max_disappeared {
            self.state = IdentityState::Departed;
            self.departed_at = Some(now);
            true
        } else {
            self.state = IdentityState::Disappeared;
            false
        }
    }

    /// When the departure was observed, falling back to the last sighting.
    pub fn departure_time(&self) -> DateTime<Utc> {
        self.departed_at.unwrap_or(self.last_seen)
    }

    /// Time spent in view between the first and the last sighting.
    pub fn dwell(&self) -> chrono::Duration {
        self.last_seen - self.first_seen
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn identity() -> TrackedIdentity {
        let det = Detection::new(BBox::ltwh(100.0, 100.0, 50.0, 100.0), 0.9);
        TrackedIdentity::new(1, "cam1", &det, Utc::now())
    }

    #[test]
    fn departs_once_tolerance_is_exceeded() {
        let mut id = identity();
        let t0 = id.last_seen;
        let at = |s: i64| t0 + chrono::Duration::seconds(s);

        for s in 1..=5 {
            assert!(!id.missed(5, at(s)));
            assert_eq!(id.state, IdentityState::Disappeared);
            assert_eq!(id.departed_at, None);
        }

        assert!(id.missed(5, at(6)));
        assert!(id.is_departed());
        assert_eq!(id.departed_at, Some(at(6)));
        assert_eq!(id.departure_time(), at(6));
        assert_eq!(id.last_seen, t0);

        // one-shot
        assert!(!id.missed(5, at(7)));
        assert_eq!(id.disappeared_frames, 6);
        assert_eq!(id.departed_at, Some(at(6)));
    }

    #[test]
    fn match_resets_counter() {
        let mut id = identity();
        let now = id.last_seen;
        id.missed(5, now);
        id.missed(5, now);

        let later = id.last_seen + chrono::Duration::seconds(3);
        let det = Detection::new(BBox::ltwh(105.0, 105.0, 50.0, 100.0), 0.7);
        id.matched(&det, later);

        assert_eq!(id.disappeared_frames, 0);
        assert_eq!(id.state, IdentityState::Active);
        assert_eq!(id.centroid, na::Point2::new(130.0, 155.0));
        assert_eq!(id.dwell(), chrono::Duration::seconds(3));
    }
}
