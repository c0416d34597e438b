use crate::detection::Detection;
use crate::error::Result;
use crate::frame::Frame;

/// Turns a frame into person detections. Implementations wrap an actual model.
pub trait Detector: Send + Sync {
    fn detect(&self, frame: &Frame) -> Result<Vec<Detection>>;
}

impl<D: Detector + ?Sized> Detector for Box<D> {
    fn detect(&self, frame: &Frame) -> Result<Vec<Detection>> {
        (**self).detect(frame)
    }
}

impl<D: Detector + ?Sized> Detector for std::sync::Arc<D> {
    fn detect(&self, frame: &Frame) -> Result<Vec<Detection>> {
        (**self).detect(frame)
    }
}

#[derive(Debug, Clone, Copy)]
pub struct FilterConfig {
    pub confidence_threshold: f32,
    pub iou_threshold: f32,
}

impl FilterConfig {
    pub fn new(confidence_threshold: f32, iou_threshold: f32) -> Self {
        Self {
            confidence_threshold,
            iou_threshold,
        }
    }
}

impl Default for FilterConfig {
    fn default() -> Self {
        Self::new(0.2, 0.45)
    }
}

/// Drops low-confidence detections and suppresses overlapping boxes.
pub struct FilteredDetector<D> {
    inner: D,
    config: FilterConfig,
}

impl<D: Detector> FilteredDetector<D> {
    pub fn new(inner: D, config: FilterConfig) -> Self {
        Self { inner, config }
    }

    pub fn postprocess(&self, mut dets: Vec<Detection>) -> Vec<Detection> {
        dets.retain(|d| d.confidence >= self.config.confidence_threshold);

        if dets.len() < 2 {
            return dets;
        }

        let indices = self.non_maximum_supression(&mut dets);

        dets.into_iter()
            .enumerate()
            .filter_map(|(idx, item)| indices.contains(&idx).then_some(item))
            .collect()
    }

    fn non_maximum_supression(&self, dets: &mut [Detection]) -> Vec<usize> {
        dets.sort_by(|a, b| b.confidence.total_cmp(&a.confidence));

        let mut retain = vec![true; dets.len()];
        for idx in 0..dets.len() - 1 {
            if !retain[idx] {
                continue;
            }

            for other in idx + 1..dets.len() {
                if retain[other] && dets[idx].iou(&dets[other]) > self.config.iou_threshold {
                    retain[other] = false;
                }
            }
        }

        (0..dets.len()).filter(|&i| retain[i]).collect()
    }
}

impl<D: Detector> Detector for FilteredDetector<D> {
    fn detect(&self, frame: &Frame) -> Result<Vec<Detection>> {
        let raw = self.inner.detect(frame)?;
        let total = raw.len();
        let kept = self.postprocess(raw);

        tracing::trace!(total, kept = kept.len(), "Filtered detections");
        Ok(kept)
    }
}
