//! Deployment tunables.
//!
//! Option names follow the JSON configuration surface (`maxDisappearedFrames`,
//! `absenceTimeoutMinutes`, ...). Every option has a default, so an empty object
//! is a valid configuration.

use serde_derive::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::error::{Error, Result};

/// Ten years.
pub const MAX_ABSENCE_TIMEOUT_MINUTES: i64 = 10 * 366 * 24 * 60;

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default, rename_all = "camelCase")]
pub struct Config {
    pub max_disappeared_frames: u32,
    pub max_match_distance: f32,
    pub absence_timeout_minutes: i64,
    pub alert_evaluation_interval_seconds: u64,
    pub stream_buffer_depth: usize,
    pub max_frame_width: Option<u32>,
    pub max_frame_height: Option<u32>,

    pub frame_skip: u32,
    pub pipeline_idle_millis: u64,
    pub retry_backoff_millis: u64,
    pub reconnect_backoff_millis: u64,
    pub stop_timeout_millis: u64,
    pub source_stale_seconds: u64,
    pub min_detection_confidence: f32,
    pub nms_iou_threshold: f32,
    pub departed_history: usize,
    pub event_channel_capacity: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            max_disappeared_frames: 30,
            max_match_distance: 50.0,
            absence_timeout_minutes: 20,
            alert_evaluation_interval_seconds: 30,
            stream_buffer_depth: 5,
            max_frame_width: Some(640),
            max_frame_height: Some(480),
            frame_skip: 2,
            pipeline_idle_millis: 10,
            retry_backoff_millis: 100,
            reconnect_backoff_millis: 1000,
            stop_timeout_millis: 2000,
            source_stale_seconds: 5,
            min_detection_confidence: 0.2,
            nms_iou_threshold: 0.45,
            departed_history: 256,
            event_channel_capacity: 64,
        }
    }
}

impl Config {
    pub fn from_json_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let file = std::fs::File::open(path.as_ref())?;
        let config: Config = serde_json::from_reader(std::io::BufReader::new(file))?;
        config.validate()?;

        tracing::info!(path = %path.as_ref().display(), "Loaded configuration");
        Ok(config)
    }

    pub fn from_json_str(s: &str) -> Result<Self> {
        let config: Config = serde_json::from_str(s)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if !(self.max_match_distance.is_finite() && self.max_match_distance >= 0.0) {
            return Err(Error::Config(format!(
                "maxMatchDistance must be a non-negative number, got {}",
                self.max_match_distance
            )));
        }
        if !(0..=MAX_ABSENCE_TIMEOUT_MINUTES).contains(&self.absence_timeout_minutes) {
            return Err(Error::Config(format!(
                "absenceTimeoutMinutes must be within [0, {}], got {}",
                MAX_ABSENCE_TIMEOUT_MINUTES, self.absence_timeout_minutes
            )));
        }
        if self.alert_evaluation_interval_seconds == 0 {
            return Err(Error::Config(
                "alertEvaluationIntervalSeconds must be at least 1".into(),
            ));
        }
        if self.stream_buffer_depth == 0 {
            return Err(Error::Config("streamBufferDepth must be at least 1".into()));
        }
        if self.frame_skip == 0 {
            return Err(Error::Config("frameSkip must be at least 1".into()));
        }
        if matches!(self.max_frame_width, Some(0)) || matches!(self.max_frame_height, Some(0)) {
            return Err(Error::Config("maxFrameWidth/Height must be positive".into()));
        }
        if !(0.0..=1.0).contains(&self.min_detection_confidence) {
            return Err(Error::Config(
                "minDetectionConfidence must be within [0, 1]".into(),
            ));
        }

        Ok(())
    }

    pub fn tracker(&self) -> TrackerConfig {
        TrackerConfig {
            max_disappeared: self.max_disappeared_frames,
            max_distance: self.max_match_distance,
            departed_history: self.departed_history,
        }
    }

    pub fn stream(&self) -> StreamConfig {
        let max_frame_size = match (self.max_frame_width, self.max_frame_height) {
            (Some(w), Some(h)) => Some((w, h)),
            _ => None,
        };

        StreamConfig {
            buffer_depth: self.stream_buffer_depth,
            max_frame_size,
            retry_backoff: Duration::from_millis(self.retry_backoff_millis),
            reconnect_backoff: Duration::from_millis(self.reconnect_backoff_millis),
            stop_timeout: Duration::from_millis(self.stop_timeout_millis),
            stale_after: Duration::from_secs(self.source_stale_seconds),
        }
    }

    pub fn alerts(&self) -> AlertConfig {
        AlertConfig {
            timeout: chrono::Duration::minutes(
                self.absence_timeout_minutes
                    .clamp(0, MAX_ABSENCE_TIMEOUT_MINUTES),
            ),
            evaluation_interval: Duration::from_secs(self.alert_evaluation_interval_seconds),
            stop_timeout: Duration::from_millis(self.stop_timeout_millis),
        }
    }

    pub fn pipeline(&self) -> PipelineConfig {
        PipelineConfig {
            frame_skip: self.frame_skip,
            idle: Duration::from_millis(self.pipeline_idle_millis),
            stop_timeout: Duration::from_millis(self.stop_timeout_millis),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TrackerConfig {
    pub max_disappeared: u32,
    pub max_distance: f32,
    pub departed_history: usize,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Config::default().tracker()
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StreamConfig {
    pub buffer_depth: usize,
    /// Frames larger than this (width, height) are downscaled before publishing.
    pub max_frame_size: Option<(u32, u32)>,
    pub retry_backoff: Duration,
    pub reconnect_backoff: Duration,
    pub stop_timeout: Duration,
    pub stale_after: Duration,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Config::default().stream()
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AlertConfig {
    pub timeout: chrono::Duration,
    pub evaluation_interval: Duration,
    pub stop_timeout: Duration,
}

impl Default for AlertConfig {
    fn default() -> Self {
        Config::default().alerts()
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PipelineConfig {
    pub frame_skip: u32,
    pub idle: Duration,
    pub stop_timeout: Duration,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Config::default().pipeline()
    }
}
