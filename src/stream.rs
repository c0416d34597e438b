//! Per-source acquisition loop and frame buffer.
//!
//! Each started [`StreamBuffer`] owns one background thread that keeps pulling frames
//! from its [`FrameSource`]. Every frame overwrites the latest-frame slot and is
//! also appended to a small ring that drops its oldest entry when full. Readers never
//! block: they get the ring's oldest frame, the latest frame, or nothing.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde_derive::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use crate::circular_queue::CircularQueue;
use crate::config::StreamConfig;
use crate::error::{Error, Result};
use crate::frame::Frame;
use crate::rolling_avg::RollingAvg;
use crate::source::{FrameSource, SourceDescriptor, SourceKind};
use crate::worker::{Shutdown, Worker};

const RATE_WINDOW: usize = 30;
const FAILURE_LOG_EVERY: u32 = 50;

#[derive(Serialize, Debug, Clone, PartialEq)]
pub struct SourceStats {
    pub id: String,
    pub name: String,
    pub kind: SourceKind,
    pub healthy: bool,
    pub running: bool,
    pub fps: f32,
    pub frame_count: u64,
    pub dropped_frames: u64,
    pub consecutive_failures: u32,
    pub last_frame_at: Option<DateTime<Utc>>,
    pub resolution: Option<(u32, u32)>,
    pub last_error: Option<String>,
}

struct BufferState {
    ring: CircularQueue<Frame>,
    latest: Option<Frame>,
    frame_count: u64,
    dropped: u64,
    consecutive_failures: u32,
    last_frame_instant: Option<Instant>,
    last_frame_at: Option<DateTime<Utc>>,
    resolution: Option<(u32, u32)>,
    rate: RollingAvg,
    last_error: Option<String>,
}

struct Shared {
    state: Mutex<BufferState>,
    running: AtomicBool,
}

impl Shared {
    fn publish(&self, frame: Frame, source_resolution: Option<(u32, u32)>) {
        let now = Instant::now();
        let mut state = self.state.lock();

        state.frame_count += 1;
        state.consecutive_failures = 0;
        state.last_frame_instant = Some(now);
        state.last_frame_at = Some(frame.timestamp);
        state.resolution = source_resolution.or(Some(frame.dims()));
        state.rate.push(now);
        state.latest = Some(frame.clone());

        if state.ring.push(frame).is_some() {
            state.dropped += 1;
        }
    }

    fn record_failure(&self, err: &Error) -> u32 {
        let mut state = self.state.lock();
        state.consecutive_failures += 1;
        state.last_error = Some(err.to_string());
        state.consecutive_failures
    }
}

pub struct StreamBuffer {
    descriptor: SourceDescriptor,
    config: StreamConfig,
    shared: Arc<Shared>,
    source: Mutex<Option<Box<dyn FrameSource>>>,
    worker: Mutex<Option<Worker>>,
}

impl StreamBuffer {
    pub fn new(
        descriptor: SourceDescriptor,
        source: Box<dyn FrameSource>,
        config: StreamConfig,
    ) -> Self {
        let state = BufferState {
            ring: CircularQueue::with_capacity(config.buffer_depth),
            latest: None,
            frame_count: 0,
            dropped: 0,
            consecutive_failures: 0,
            last_frame_instant: None,
            last_frame_at: None,
            resolution: None,
            rate: RollingAvg::new(RATE_WINDOW),
            last_error: None,
        };

        Self {
            descriptor,
            config,
            shared: Arc::new(Shared {
                state: Mutex::new(state),
                running: AtomicBool::new(false),
            }),
            source: Mutex::new(Some(source)),
            worker: Mutex::new(None),
        }
    }

    #[inline]
    pub fn descriptor(&self) -> &SourceDescriptor {
        &self.descriptor
    }

    #[inline]
    pub fn id(&self) -> &str {
        &self.descriptor.id
    }

    /// Opens the source and spawns the acquisition loop.
    pub fn start(&self) -> Result<()> {
        let mut worker_slot = self.worker.lock();
        let mut source = match self.source.lock().take() {
            Some(source) => source,
            None if worker_slot.is_some() => return Ok(()),
            None => {
                return Err(Error::source_unavailable(
                    &self.descriptor.id,
                    "source was released by a previous stop",
                ))
            }
        };

        if let Err(err) = source.open() {
            let reason = err.to_string();
            tracing::error!(source_id = %self.descriptor.id, error = %reason, "Failed to open source");
            source.close();
            return Err(Error::source_unavailable(&self.descriptor.id, reason));
        }

        let shared = self.shared.clone();
        let config = self.config;
        let source_id = self.descriptor.id.clone();

        shared.running.store(true, Ordering::SeqCst);
        let worker = Worker::spawn(format!("acquire-{}", source_id), move |shutdown| {
            acquisition_loop(&source_id, source, &shared, &config, &shutdown);
            shared.running.store(false, Ordering::SeqCst);
        });

        match worker {
            Ok(worker) => {
                *worker_slot = Some(worker);
                tracing::info!(
                    source_id = %self.descriptor.id,
                    name = %self.descriptor.name,
                    "Started source"
                );
                Ok(())
            }
            Err(err) => {
                self.shared.running.store(false, Ordering::SeqCst);
                Err(Error::source_unavailable(&self.descriptor.id, err))
            }
        }
    }

    /// Newest acquired frame, possibly stale; `None` if nothing was ever acquired.
    pub fn latest_frame(&self) -> Option<Frame> {
        self.shared.state.lock().latest.clone()
    }

    /// Oldest buffered frame, falling back to the last known good frame when the ring is empty.
    pub fn read(&self) -> Option<Frame> {
        let mut state = self.shared.state.lock();
        state.ring.pop_oldest().or_else(|| state.latest.clone())
    }

    pub fn buffered(&self) -> usize {
        self.shared.state.lock().ring.len()
    }

    #[inline]
    pub fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::SeqCst)
    }

    /// Running and delivered a frame recently.
    pub fn is_healthy(&self) -> bool {
        if !self.is_running() {
            return false;
        }

        let state = self.shared.state.lock();
        state
            .last_frame_instant
            .map_or(false, |at| at.elapsed() <= self.config.stale_after)
    }

    /// Stops the acquisition loop; safe to call repeatedly or before `start`.
    pub fn stop(&self) {
        let worker = self.worker.lock().take();
        if let Some(mut worker) = worker {
            if !worker.stop(self.config.stop_timeout) {
                tracing::warn!(source_id = %self.descriptor.id, "Acquisition loop still busy after stop timeout");
            }
            tracing::info!(source_id = %self.descriptor.id, "Stopped source");
        }

        if let Some(mut source) = self.source.lock().take() {
            source.close();
        }

        self.shared.running.store(false, Ordering::SeqCst);
    }

    pub fn stats(&self) -> SourceStats {
        let healthy = self.is_healthy();
        let state = self.shared.state.lock();

        SourceStats {
            id: self.descriptor.id.clone(),
            name: self.descriptor.name.clone(),
            kind: self.descriptor.kind.clone(),
            healthy,
            running: self.is_running(),
            fps: state.rate.rate(),
            frame_count: state.frame_count,
            dropped_frames: state.dropped,
            consecutive_failures: state.consecutive_failures,
            last_frame_at: state.last_frame_at,
            resolution: state.resolution,
            last_error: state.last_error.clone(),
        }
    }
}

impl Drop for StreamBuffer {
    fn drop(&mut self) {
        self.stop();
    }
}

fn acquisition_loop(
    source_id: &str,
    mut source: Box<dyn FrameSource>,
    shared: &Shared,
    config: &StreamConfig,
    shutdown: &Shutdown,
) {
    let mut sequence = 0u64;

    while !shutdown.is_requested() {
        match source.read() {
            Ok(mut frame) => {
                sequence += 1;
                frame.sequence = sequence;

                let resolution = source.resolution();
                let frame = match config.max_frame_size {
                    Some((w, h)) => frame.downscaled(w, h),
                    None => frame,
                };

                shared.publish(frame, resolution);
            }
            Err(err) => {
                let failures = shared.record_failure(&err);
                let connected = source.is_connected();

                if failures == 1 || failures % FAILURE_LOG_EVERY == 0 {
                    tracing::warn!(
                        source_id = %source_id,
                        failures,
                        connected,
                        error = %err,
                        "Frame acquisition failed, retrying"
                    );
                }

                let backoff = if connected {
                    config.retry_backoff
                } else {
                    config.reconnect_backoff
                };

                if shutdown.wait(backoff) {
                    break;
                }
            }
        }
    }

    source.close();
    tracing::debug!(source_id = %source_id, frames = sequence, "Acquisition loop finished");
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use image::RgbImage;
    use std::collections::VecDeque;
    use std::time::Duration;

    /// Scripted source: plays back `script` then keeps failing.
    pub(crate) struct ScriptedSource {
        pub script: VecDeque<Result<Frame>>,
        pub fail_open: bool,
        pub delay: Duration,
    }

    impl ScriptedSource {
        pub fn frames(n: usize, w: u32, h: u32) -> Self {
            Self {
                script: (0..n)
                    .map(|_| Ok(Frame::new(RgbImage::new(w, h), Utc::now())))
                    .collect(),
                fail_open: false,
                delay: Duration::from_millis(1),
            }
        }
    }

    impl FrameSource for ScriptedSource {
        fn open(&mut self) -> Result<()> {
            if self.fail_open {
                Err(Error::source_unavailable("scripted", "device busy"))
            } else {
                Ok(())
            }
        }

        fn read(&mut self) -> Result<Frame> {
            std::thread::sleep(self.delay);
            self.script
                .pop_front()
                .unwrap_or_else(|| Err(Error::source_unavailable("scripted", "end of script")))
        }
    }

    fn config(depth: usize) -> StreamConfig {
        StreamConfig {
            buffer_depth: depth,
            max_frame_size: Some((640, 480)),
            retry_backoff: Duration::from_millis(5),
            reconnect_backoff: Duration::from_millis(5),
            stop_timeout: Duration::from_secs(2),
            stale_after: Duration::from_secs(5),
        }
    }

    fn wait_for<F: Fn() -> bool>(cond: F) -> bool {
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            if cond() {
                return true;
            }
            std::thread::sleep(Duration::from_millis(2));
        }
        false
    }

    fn descriptor() -> SourceDescriptor {
        SourceDescriptor::new("cam1", "Desk", SourceKind::Device(0))
    }

    #[test]
    fn ring_drops_oldest_and_latest_survives() {
        let buffer = StreamBuffer::new(
            descriptor(),
            Box::new(ScriptedSource::frames(8, 320, 240)),
            config(5),
        );
        assert!(buffer.latest_frame().is_none());
        assert!(buffer.read().is_none());

        buffer.start().unwrap();
        assert!(wait_for(|| buffer.stats().frame_count == 8));

        let stats = buffer.stats();
        assert_eq!(stats.dropped_frames, 3);
        assert_eq!(buffer.buffered(), 5);
        assert_eq!(buffer.latest_frame().unwrap().sequence, 8);

        // oldest surviving frame is the 4th
        assert_eq!(buffer.read().unwrap().sequence, 4);
        for _ in 0..4 {
            buffer.read();
        }
        assert_eq!(buffer.buffered(), 0);

        // empty ring falls back to the last known good frame
        assert_eq!(buffer.read().unwrap().sequence, 8);

        buffer.stop();
        assert!(!buffer.is_running());
        assert!(!buffer.is_healthy());
        assert_eq!(buffer.latest_frame().unwrap().sequence, 8);
    }

    #[test]
    fn frames_are_downscaled_before_publishing() {
        let buffer = StreamBuffer::new(
            descriptor(),
            Box::new(ScriptedSource::frames(1, 1280, 960)),
            config(5),
        );
        buffer.start().unwrap();
        assert!(wait_for(|| buffer.latest_frame().is_some()));

        assert_eq!(buffer.latest_frame().unwrap().dims(), (640, 480));
        assert_eq!(buffer.stats().resolution, Some((1280, 960)));
        buffer.stop();
    }

    #[test]
    fn failing_open_is_reported() {
        let mut source = ScriptedSource::frames(0, 1, 1);
        source.fail_open = true;

        let buffer = StreamBuffer::new(descriptor(), Box::new(source), config(5));
        assert!(matches!(
            buffer.start(),
            Err(Error::SourceUnavailable { .. })
        ));
        assert!(!buffer.is_running());
    }

    #[test]
    fn transient_failures_are_retried() {
        let mut source = ScriptedSource::frames(0, 1, 1);
        source.script.push_back(Err(Error::source_unavailable("scripted", "decode error")));
        source.script.push_back(Err(Error::source_unavailable("scripted", "decode error")));
        source
            .script
            .push_back(Ok(Frame::new(RgbImage::new(2, 2), Utc::now())));

        let buffer = StreamBuffer::new(descriptor(), Box::new(source), config(5));
        buffer.start().unwrap();

        assert!(wait_for(|| buffer.latest_frame().is_some()));
        assert!(buffer.is_running());
        assert!(buffer.is_healthy());
        buffer.stop();
    }

    #[test]
    fn stop_during_backoff_is_prompt() {
        let mut cfg = config(5);
        cfg.retry_backoff = Duration::from_secs(30);

        let buffer = StreamBuffer::new(
            descriptor(),
            Box::new(ScriptedSource::frames(0, 1, 1)),
            cfg,
        );
        buffer.start().unwrap();
        assert!(wait_for(|| buffer.stats().consecutive_failures >= 1));

        let started = Instant::now();
        buffer.stop();
        assert!(started.elapsed() < Duration::from_secs(2));
        assert!(!buffer.is_running());
    }
}
