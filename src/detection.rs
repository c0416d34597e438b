use nalgebra as na;
use serde_derive::{Deserialize, Serialize};

use crate::bbox::{BBox, Ltwh};

/// One candidate person in a single frame: box, confidence and box center
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq)]
#[serde(from = "RawDetection")]
pub struct Detection {
    pub bbox: BBox<Ltwh>,
    pub confidence: f32,
    pub center: na::Point2<f32>,
}

// dumps may omit the center, it is derived from the box then
#[derive(Deserialize)]
struct RawDetection {
    bbox: BBox<Ltwh>,
    confidence: f32,
    #[serde(default)]
    center: Option<na::Point2<f32>>,
}

impl From<RawDetection> for Detection {
    fn from(raw: RawDetection) -> Self {
        Detection {
            bbox: raw.bbox,
            confidence: raw.confidence,
            center: raw.center.unwrap_or_else(|| raw.bbox.center()),
        }
    }
}

impl Detection {
    pub fn new(bbox: BBox<Ltwh>, confidence: f32) -> Self {
        Self {
            bbox,
            confidence: confidence.clamp(0.0, 1.0),
            center: bbox.center(),
        }
    }

    /// Detection with an explicit center, for detectors that report keypoint-based centers.
    pub fn with_center(bbox: BBox<Ltwh>, confidence: f32, center: na::Point2<f32>) -> Self {
        Self {
            bbox,
            confidence: confidence.clamp(0.0, 1.0),
            center,
        }
    }

    pub fn iou(&self, other: &Detection) -> f32 {
        let a = self.bbox.as_ltrb();
        let b = other.bbox.as_ltrb();

        let inter = a.intersection_area(&b);
        let union = self.bbox.area() + other.bbox.area() - inter;

        if union <= 0.0 {
            0.0
        } else {
            inter / union
        }
    }

    #[inline(always)]
    pub fn distance_to(&self, point: &na::Point2<f32>) -> f32 {
        na::distance(&self.center, point)
    }
}
