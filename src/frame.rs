use chrono::{DateTime, Utc};
use image::{imageops, RgbImage};
use std::sync::Arc;

/// A decoded frame; cloning shares the pixel buffer.
#[derive(Debug, Clone)]
pub struct Frame {
    pub image: Arc<RgbImage>,
    pub timestamp: DateTime<Utc>,
    pub sequence: u64,
}

impl Frame {
    pub fn new(image: RgbImage, timestamp: DateTime<Utc>) -> Self {
        Self {
            image: Arc::new(image),
            timestamp,
            sequence: 0,
        }
    }

    #[inline]
    pub fn dims(&self) -> (u32, u32) {
        self.image.dimensions()
    }

    #[inline]
    pub fn width(&self) -> u32 {
        self.image.width()
    }

    #[inline]
    pub fn height(&self) -> u32 {
        self.image.height()
    }

    /// Shrinks the frame to fit into `max_w` x `max_h`, keeping the aspect ratio.
    /// Frames that already fit are returned untouched.
    pub fn downscaled(self, max_w: u32, max_h: u32) -> Frame {
        let (w, h) = self.dims();
        if w == 0 || h == 0 || (w <= max_w && h <= max_h) {
            return self;
        }

        let scale = f64::min(max_w as f64 / w as f64, max_h as f64 / h as f64);
        let nw = ((w as f64 * scale) as u32).max(1);
        let nh = ((h as f64 * scale) as u32).max(1);

        let resized = imageops::resize(self.image.as_ref(), nw, nh, imageops::FilterType::Triangle);

        Frame {
            image: Arc::new(resized),
            timestamp: self.timestamp,
            sequence: self.sequence,
        }
    }
}
