use crate::circular_queue::CircularQueue;
use std::time::Instant;

/// Rolling average of the interval between events, used for per-source frame rates.
#[derive(Debug, Clone)]
pub struct RollingAvg {
    last: Option<Instant>,
    intervals: CircularQueue<f32>,
    sum: f32,
}

impl RollingAvg {
    pub fn new(window: usize) -> Self {
        Self {
            last: None,
            intervals: CircularQueue::with_capacity(window),
            sum: 0.0,
        }
    }

    pub fn clear(&mut self) {
        self.last = None;
        self.intervals.clear();
        self.sum = 0.0;
    }

    pub fn push(&mut self, ts: Instant) {
        if let Some(last) = self.last {
            let dt = ts.saturating_duration_since(last).as_secs_f32();

            if let Some(evicted) = self.intervals.push(dt) {
                self.sum -= evicted;
            }
            self.sum += dt;
        }

        self.last = Some(ts);
    }

    /// Mean interval in seconds, if at least two events were seen.
    pub fn mean_interval(&self) -> Option<f32> {
        if self.intervals.is_empty() {
            return None;
        }

        Some(self.sum.max(0.0) / self.intervals.len() as f32)
    }

    /// Events per second over the window.
    pub fn rate(&self) -> f32 {
        match self.mean_interval() {
            Some(dt) if dt > f32::EPSILON => 1.0 / dt,
            _ => 0.0,
        }
    }

    #[inline]
    pub fn last(&self) -> Option<Instant> {
        self.last
    }

    #[inline]
    pub fn num_samples(&self) -> usize {
        self.intervals.len()
    }
}
