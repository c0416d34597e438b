//! Detect, track, log and alert, for every active source in turn.
//!
//! A pass never waits for acquisition: each source contributes its latest frame if
//! there is a new one, otherwise it is skipped until the next pass. Updates for one
//! source are applied in the order the frames were acquired.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::alert::AlertScheduler;
use crate::config::{Config, PipelineConfig};
use crate::coordinator::TrackingCoordinator;
use crate::detector::{Detector, FilterConfig, FilteredDetector};
use crate::error::Result;
use crate::events::{EventBus, MonitorEvent, SourceUpdateMessage};
use crate::frame::Frame;
use crate::registry::SourceRegistry;
use crate::resolver::IdentityResolver;
use crate::store::PresenceStore;
use crate::tracker::TrackerUpdate;
use crate::worker::Worker;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PassReport {
    pub processed: usize,
    pub skipped: usize,
    pub detection_failures: usize,
    pub arrived: usize,
    pub departed: usize,
}

#[derive(Default)]
struct FrameCursor {
    last_sequence: Option<u64>,
    counter: u32,
}

pub struct Pipeline {
    config: PipelineConfig,
    registry: Arc<SourceRegistry>,
    detector: Arc<dyn Detector>,
    coordinator: Arc<TrackingCoordinator>,
    scheduler: Arc<AlertScheduler>,
    store: Option<Arc<dyn PresenceStore>>,
    events: EventBus,
    cursors: Mutex<HashMap<String, FrameCursor>>,
}

impl Pipeline {
    pub fn new(
        config: PipelineConfig,
        registry: Arc<SourceRegistry>,
        detector: Arc<dyn Detector>,
        coordinator: Arc<TrackingCoordinator>,
        scheduler: Arc<AlertScheduler>,
    ) -> Self {
        Self {
            config,
            registry,
            detector,
            coordinator,
            scheduler,
            store: None,
            events: EventBus::default(),
            cursors: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_store(mut self, store: Arc<dyn PresenceStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn with_events(mut self, events: EventBus) -> Self {
        self.events = events;
        self
    }

    /// Wires up every component from one configuration.
    pub fn from_config(
        config: &Config,
        detector: Arc<dyn Detector>,
        resolver: Arc<dyn IdentityResolver>,
        store: Arc<dyn PresenceStore>,
    ) -> Self {
        let events = EventBus::new(config.event_channel_capacity);
        let registry = Arc::new(SourceRegistry::new(config.stream()));
        let coordinator = Arc::new(TrackingCoordinator::with_resolver(config.tracker(), resolver));
        let scheduler = Arc::new(
            AlertScheduler::new(config.alerts())
                .with_store(store.clone())
                .with_events(events.clone()),
        );
        let detector = Arc::new(FilteredDetector::new(
            detector,
            FilterConfig::new(config.min_detection_confidence, config.nms_iou_threshold),
        ));

        Self::new(config.pipeline(), registry, detector, coordinator, scheduler)
            .with_store(store)
            .with_events(events)
    }

    #[inline]
    pub fn registry(&self) -> &Arc<SourceRegistry> {
        &self.registry
    }

    #[inline]
    pub fn coordinator(&self) -> &Arc<TrackingCoordinator> {
        &self.coordinator
    }

    #[inline]
    pub fn scheduler(&self) -> &Arc<AlertScheduler> {
        &self.scheduler
    }

    #[inline]
    pub fn events(&self) -> &EventBus {
        &self.events
    }

    /// New frames only, and of those every `frame_skip`-th.
    fn should_process(&self, source_id: &str, sequence: u64) -> bool {
        let mut cursors = self.cursors.lock();
        let cursor = cursors.entry(source_id.to_string()).or_default();

        if cursor.last_sequence == Some(sequence) {
            return false;
        }
        cursor.last_sequence = Some(sequence);

        let take = cursor.counter % self.config.frame_skip.max(1) == 0;
        cursor.counter = cursor.counter.wrapping_add(1);
        take
    }

    /// Processes the latest frame of every active source once.
    pub fn run_pass(&self) -> PassReport {
        let mut report = PassReport::default();

        for source_id in self.registry.active_sources() {
            let Some(frame) = self.registry.latest_frame(&source_id) else {
                report.skipped += 1;
                continue;
            };

            if !self.should_process(&source_id, frame.sequence) {
                report.skipped += 1;
                continue;
            }

            match self.process_frame(&source_id, &frame) {
                Ok(update) => {
                    report.processed += 1;
                    report.arrived += update.arrived.len();
                    report.departed += update.departed.len();
                }
                Err(err) => {
                    report.detection_failures += 1;
                    tracing::warn!(source_id = %source_id, sequence = frame.sequence, error = %err, "Detection failed, frame skipped");
                }
            }
        }

        report
    }

    /// Runs detection on one frame and forwards the results.
    ///
    /// A detection error leaves the source's tracking state untouched.
    pub fn process_frame(&self, source_id: &str, frame: &Frame) -> Result<TrackerUpdate> {
        let detections = self.detector.detect(frame)?;
        let now = frame.timestamp;

        let update = self
            .coordinator
            .update_at(source_id, &detections, Some(frame), now);

        for identity in &update.arrived {
            if let Some(store) = &self.store {
                if let Err(err) = store.log_entry(
                    identity.tracking_id,
                    source_id,
                    identity.external_identity.as_deref(),
                    now,
                ) {
                    tracing::error!(source_id, tracking_id = identity.tracking_id, error = %err, "Failed to log entry");
                }
            }
            self.events.publish(MonitorEvent::Arrived(identity.clone()));
        }

        for identity in &update.resolved {
            if let Some(name) = &identity.external_identity {
                self.scheduler.on_identity_returned(name);
            }
        }

        for identity in &update.departed {
            if let Some(store) = &self.store {
                if let Err(err) = store.log_exit(identity.tracking_id, source_id, now) {
                    tracing::error!(source_id, tracking_id = identity.tracking_id, error = %err, "Failed to log exit");
                }
            }
            self.scheduler.on_departure(identity);
            self.events.publish(MonitorEvent::Departed(identity.clone()));
        }

        tracing::debug!(
            source_id,
            sequence = frame.sequence,
            detections = detections.len(),
            tracked = update.active_count(),
            "Processed frame"
        );

        self.events.publish(MonitorEvent::SourceUpdate(SourceUpdateMessage {
            source_id: source_id.to_string(),
            detections: detections.len(),
            tracked: update.active_count(),
            timestamp: now,
        }));

        Ok(update)
    }

    /// Starts the alert evaluator and the pipeline worker.
    pub fn start(self: &Arc<Self>) -> Result<PipelineHandle> {
        self.scheduler.start()?;

        let active = Arc::new(AtomicBool::new(true));
        let flag = active.clone();
        let pipeline = self.clone();
        let idle = self.config.idle;

        let worker = Worker::spawn("pipeline", move |shutdown| {
            tracing::info!(sources = pipeline.registry.len(), "Pipeline started");

            while flag.load(Ordering::SeqCst) {
                pipeline.run_pass();

                if shutdown.wait(idle) {
                    break;
                }
            }

            tracing::info!("Pipeline finished");
        });

        let worker = match worker {
            Ok(worker) => worker,
            Err(err) => {
                self.scheduler.stop();
                return Err(err.into());
            }
        };

        Ok(PipelineHandle {
            active,
            worker: Some(worker),
            pipeline: self.clone(),
        })
    }
}

/// Controls a started [`Pipeline`]; dropping it stops everything.
pub struct PipelineHandle {
    active: Arc<AtomicBool>,
    worker: Option<Worker>,
    pipeline: Arc<Pipeline>,
}

impl PipelineHandle {
    pub fn is_running(&self) -> bool {
        self.active.load(Ordering::SeqCst) && self.worker.as_ref().map_or(false, |w| !w.is_finished())
    }

    pub fn pipeline(&self) -> &Arc<Pipeline> {
        &self.pipeline
    }

    /// Stops the pipeline worker, then every source, then the alert evaluator.
    pub fn stop(&mut self) {
        self.active.store(false, Ordering::SeqCst);

        if let Some(mut worker) = self.worker.take() {
            worker.stop(self.pipeline.config.stop_timeout);
            self.pipeline.registry.stop_all();
            self.pipeline.scheduler.stop();
            tracing::info!("Pipeline stopped");
        }
    }
}

impl Drop for PipelineHandle {
    fn drop(&mut self) {
        self.stop();
    }
}
