//! Absence alerts.
//!
//! A departure schedules a [`PendingAlert`] that fires `timeout` after the departure was
//! observed. A return before that cancels it. Firing happens in a periodic evaluation
//! pass, exactly once per alert; fired alerts stay around until acknowledged and after.
//!
//! Trigger marking and cancellation both happen under the one lock guarding the alert
//! map. Whichever of an evaluation pass and a return takes the lock first decides the
//! outcome: a return that comes after the alert was marked triggered leaves it fired.

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde_derive::Serialize;
use std::collections::BTreeMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Weak};

use crate::config::AlertConfig;
use crate::error::{Error, Result};
use crate::events::{AlertAcknowledgedMessage, AlertCancelledMessage, EventBus, MonitorEvent};
use crate::store::{AlertId, PresenceStore};
use crate::track::{TrackedIdentity, TrackingId};
use crate::worker::Worker;

#[derive(Serialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AlertState {
    Pending,
    Triggered,
    Acknowledged,
}

#[derive(Serialize, Debug, Clone, PartialEq)]
pub struct PendingAlert {
    pub tracking_id: TrackingId,
    pub external_identity: Option<String>,
    pub source_id: String,
    pub departed_at: DateTime<Utc>,
    pub fire_at: DateTime<Utc>,
    pub triggered: bool,
    pub triggered_at: Option<DateTime<Utc>>,
    pub acknowledged: bool,
    /// Id of the persisted alert record, once stored.
    pub alert_id: Option<AlertId>,
}

impl PendingAlert {
    /// Fire time saturates instead of overflowing for out-of-range timeouts.
    pub fn new(identity: &TrackedIdentity, timeout: chrono::Duration) -> Self {
        let departed_at = identity.departure_time();

        Self {
            tracking_id: identity.tracking_id,
            external_identity: identity.external_identity.clone(),
            source_id: identity.source_id.clone(),
            departed_at,
            fire_at: departed_at
                .checked_add_signed(timeout)
                .unwrap_or(DateTime::<Utc>::MAX_UTC),
            triggered: false,
            triggered_at: None,
            acknowledged: false,
            alert_id: None,
        }
    }

    pub fn state(&self) -> AlertState {
        match (self.triggered, self.acknowledged) {
            (_, true) => AlertState::Acknowledged,
            (true, false) => AlertState::Triggered,
            (false, false) => AlertState::Pending,
        }
    }

    #[inline]
    pub fn should_trigger_at(&self, now: DateTime<Utc>) -> bool {
        !self.triggered && now >= self.fire_at
    }

    /// Zero once the fire time has passed.
    pub fn time_remaining_at(&self, now: DateTime<Utc>) -> chrono::Duration {
        (self.fire_at - now).max(chrono::Duration::zero())
    }

    pub fn timeout_minutes(&self) -> i64 {
        (self.fire_at - self.departed_at).num_minutes()
    }
}

/// Notified once for every alert that fires.
pub trait AlertObserver: Send + Sync {
    fn on_alert(&self, alert: &PendingAlert) -> Result<()>;
}

impl<F> AlertObserver for F
where
    F: Fn(&PendingAlert) -> Result<()> + Send + Sync,
{
    fn on_alert(&self, alert: &PendingAlert) -> Result<()> {
        self(alert)
    }
}

#[derive(Debug, Default)]
pub struct EvaluationReport {
    pub triggered: Vec<PendingAlert>,
    pub observer_failures: usize,
    pub persistence_failures: usize,
}

#[derive(Serialize, Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AlertStats {
    pub total_pending: usize,
    pub total_triggered: usize,
    pub total_acknowledged: usize,
    pub total_unacknowledged: usize,
}

pub struct AlertScheduler {
    config: AlertConfig,
    alerts: Mutex<BTreeMap<TrackingId, PendingAlert>>,
    observers: RwLock<Vec<Arc<dyn AlertObserver>>>,
    store: Option<Arc<dyn PresenceStore>>,
    events: Option<EventBus>,
    evaluator: Mutex<Option<Worker>>,
}

impl AlertScheduler {
    pub fn new(config: AlertConfig) -> Self {
        Self {
            config,
            alerts: Mutex::new(BTreeMap::new()),
            observers: RwLock::new(Vec::new()),
            store: None,
            events: None,
            evaluator: Mutex::new(None),
        }
    }

    pub fn with_store(mut self, store: Arc<dyn PresenceStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn with_events(mut self, events: EventBus) -> Self {
        self.events = Some(events);
        self
    }

    #[inline]
    pub fn config(&self) -> &AlertConfig {
        &self.config
    }

    pub fn register_observer(&self, observer: Arc<dyn AlertObserver>) {
        self.observers.write().push(observer);
    }

    /// Schedules an alert for a departed identity. No-op if one already exists.
    pub fn on_departure(&self, identity: &TrackedIdentity) -> bool {
        let alert = PendingAlert::new(identity, self.config.timeout);
        let fire_at = alert.fire_at;

        {
            let mut alerts = self.alerts.lock();
            if alerts.contains_key(&identity.tracking_id) {
                return false;
            }
            alerts.insert(identity.tracking_id, alert);
        }

        tracing::info!(
            tracking_id = identity.tracking_id,
            source_id = %identity.source_id,
            fire_at = %fire_at,
            "Scheduled absence alert"
        );
        true
    }

    /// Cancels a not yet triggered alert.
    pub fn on_return(&self, tracking_id: TrackingId) -> bool {
        let cancelled = {
            let mut alerts = self.alerts.lock();
            match alerts.get(&tracking_id) {
                Some(alert) if !alert.triggered => alerts.remove(&tracking_id),
                _ => None,
            }
        };

        match cancelled {
            Some(alert) => {
                self.cancelled(alert);
                true
            }
            None => false,
        }
    }

    /// Cancels every untriggered alert raised for `external_identity`.
    pub fn on_identity_returned(&self, external_identity: &str) -> Vec<TrackingId> {
        let cancelled: Vec<PendingAlert> = {
            let mut alerts = self.alerts.lock();
            let ids: Vec<TrackingId> = alerts
                .values()
                .filter(|a| !a.triggered)
                .filter(|a| a.external_identity.as_deref() == Some(external_identity))
                .map(|a| a.tracking_id)
                .collect();

            ids.iter().filter_map(|id| alerts.remove(id)).collect()
        };

        cancelled
            .into_iter()
            .map(|alert| {
                let id = alert.tracking_id;
                self.cancelled(alert);
                id
            })
            .collect()
    }

    fn cancelled(&self, alert: PendingAlert) {
        tracing::info!(
            tracking_id = alert.tracking_id,
            external_identity = ?alert.external_identity,
            "Cancelled absence alert, identity returned"
        );

        self.publish(MonitorEvent::AlertCancelled(AlertCancelledMessage {
            tracking_id: alert.tracking_id,
            external_identity: alert.external_identity,
        }));
    }

    pub fn evaluate(&self) -> EvaluationReport {
        self.evaluate_at(Utc::now())
    }

    /// Fires every due alert exactly once.
    pub fn evaluate_at(&self, now: DateTime<Utc>) -> EvaluationReport {
        let due: Vec<PendingAlert> = {
            let mut alerts = self.alerts.lock();
            alerts
                .values_mut()
                .filter(|a| a.should_trigger_at(now))
                .map(|a| {
                    a.triggered = true;
                    a.triggered_at = Some(now);
                    a.clone()
                })
                .collect()
        };

        let mut report = EvaluationReport::default();

        for mut alert in due {
            tracing::warn!(
                tracking_id = alert.tracking_id,
                source_id = %alert.source_id,
                external_identity = ?alert.external_identity,
                departed_at = %alert.departed_at,
                "Absence alert triggered"
            );

            match self.persist(&alert) {
                Ok(Some(alert_id)) => {
                    alert.alert_id = Some(alert_id);
                    if let Some(stored) = self.alerts.lock().get_mut(&alert.tracking_id) {
                        stored.alert_id = Some(alert_id);
                    }
                }
                Ok(None) => {}
                Err(err) => {
                    tracing::error!(tracking_id = alert.tracking_id, error = %err, "Failed to record alert");
                    report.persistence_failures += 1;
                }
            }

            report.observer_failures += self.notify(&alert);
            self.publish(MonitorEvent::AlertTriggered(alert.clone()));
            report.triggered.push(alert);
        }

        report
    }

    fn persist(&self, alert: &PendingAlert) -> Result<Option<AlertId>> {
        let Some(store) = &self.store else {
            return Ok(None);
        };

        store
            .record_alert(
                alert.tracking_id,
                alert.external_identity.as_deref(),
                alert.departed_at,
                alert.timeout_minutes(),
            )
            .map(Some)
    }

    /// Returns the number of failed observers.
    fn notify(&self, alert: &PendingAlert) -> usize {
        let observers: Vec<_> = self.observers.read().clone();
        let mut failures = 0;

        for (idx, observer) in observers.iter().enumerate() {
            let outcome = catch_unwind(AssertUnwindSafe(|| observer.on_alert(alert)))
                .unwrap_or_else(|_| Err(Error::Observer("observer panicked".into())));

            if let Err(err) = outcome {
                failures += 1;
                tracing::error!(
                    observer = idx,
                    tracking_id = alert.tracking_id,
                    error = %err,
                    "Alert observer failed"
                );
            }
        }

        failures
    }

    /// Marks a triggered alert as acknowledged.
    pub fn acknowledge(&self, tracking_id: TrackingId) -> bool {
        let alert_id = {
            let mut alerts = self.alerts.lock();
            match alerts.get_mut(&tracking_id) {
                Some(alert) if alert.triggered && !alert.acknowledged => {
                    alert.acknowledged = true;
                    alert.alert_id
                }
                _ => return false,
            }
        };

        if let (Some(store), Some(alert_id)) = (&self.store, alert_id) {
            if let Err(err) = store.acknowledge_alert(alert_id) {
                tracing::error!(tracking_id, alert_id, error = %err, "Failed to persist acknowledgement");
            }
        }

        tracing::info!(tracking_id, "Alert acknowledged");
        self.publish(MonitorEvent::AlertAcknowledged(AlertAcknowledgedMessage {
            tracking_id,
            acknowledged_at: Utc::now(),
        }));

        true
    }

    pub fn get(&self, tracking_id: TrackingId) -> Option<PendingAlert> {
        self.alerts.lock().get(&tracking_id).cloned()
    }

    /// Alerts waiting for their fire time.
    pub fn pending_alerts(&self) -> Vec<PendingAlert> {
        self.filtered(|a| !a.triggered)
    }

    /// Fired alerts nobody acknowledged yet.
    pub fn triggered_alerts(&self) -> Vec<PendingAlert> {
        self.filtered(|a| a.triggered && !a.acknowledged)
    }

    pub fn all_alerts(&self) -> Vec<PendingAlert> {
        self.filtered(|_| true)
    }

    fn filtered<P: Fn(&PendingAlert) -> bool>(&self, pred: P) -> Vec<PendingAlert> {
        self.alerts
            .lock()
            .values()
            .filter(|a| pred(a))
            .cloned()
            .collect()
    }

    pub fn statistics(&self) -> AlertStats {
        let alerts = self.alerts.lock();
        let mut stats = AlertStats::default();

        for alert in alerts.values() {
            match alert.state() {
                AlertState::Pending => stats.total_pending += 1,
                AlertState::Triggered => {
                    stats.total_triggered += 1;
                    stats.total_unacknowledged += 1;
                }
                AlertState::Acknowledged => {
                    stats.total_triggered += 1;
                    stats.total_acknowledged += 1;
                }
            }
        }

        stats
    }

    fn publish(&self, event: MonitorEvent) {
        if let Some(events) = &self.events {
            events.publish(event);
        }
    }

    /// Starts the periodic evaluation pass. Calling it again while running is a no-op.
    pub fn start(self: &Arc<Self>) -> Result<()> {
        let mut evaluator = self.evaluator.lock();
        if evaluator.is_some() {
            return Ok(());
        }

        let scheduler: Weak<Self> = Arc::downgrade(self);
        let interval = self.config.evaluation_interval;

        let worker = Worker::spawn("alert-evaluator", move |shutdown| {
            while !shutdown.wait(interval) {
                let Some(scheduler) = scheduler.upgrade() else {
                    break;
                };

                let report = scheduler.evaluate();
                if !report.triggered.is_empty() {
                    tracing::debug!(triggered = report.triggered.len(), "Evaluation pass finished");
                }
            }
        })?;

        tracing::info!(interval_secs = interval.as_secs(), "Started alert evaluator");
        *evaluator = Some(worker);
        Ok(())
    }

    pub fn is_running(&self) -> bool {
        self.evaluator
            .lock()
            .as_ref()
            .map_or(false, |w| !w.is_finished())
    }

    pub fn stop(&self) {
        let worker = self.evaluator.lock().take();

        if let Some(mut worker) = worker {
            worker.stop(self.config.stop_timeout);
            tracing::info!("Stopped alert evaluator");
        }
    }
}

impl Drop for AlertScheduler {
    fn drop(&mut self) {
        if let Some(mut worker) = self.evaluator.get_mut().take() {
            // the evaluator itself may hold the last reference
            if std::thread::current().name() != Some(worker.name()) {
                worker.stop(self.config.stop_timeout);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bbox::BBox;
    use crate::detection::Detection;
    use crate::store::MemoryStore;
    use crate::track::IdentityState;
    use chrono::Duration;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn config() -> AlertConfig {
        AlertConfig {
            timeout: Duration::minutes(20),
            evaluation_interval: std::time::Duration::from_millis(10),
            stop_timeout: std::time::Duration::from_secs(2),
        }
    }

    fn departed(id: TrackingId, at: DateTime<Utc>, name: Option<&str>) -> TrackedIdentity {
        let det = Detection::new(BBox::ltwh(0.0, 0.0, 10.0, 10.0), 0.9);
        let mut identity = TrackedIdentity::new(id, "cam1", &det, at - Duration::seconds(30));
        identity.external_identity = name.map(str::to_string);
        identity.state = IdentityState::Departed;
        identity.departed_at = Some(at);
        identity
    }

    #[test]
    fn grace_period_counts_from_the_departure() {
        let scheduler = AlertScheduler::new(config());
        let t = Utc::now();
        let identity = departed(2, t, None);
        assert!(identity.last_seen < t);

        scheduler.on_departure(&identity);
        let alert = scheduler.get(2).unwrap();
        assert_eq!(alert.departed_at, t);
        assert_eq!(alert.fire_at, t + Duration::minutes(20));

        let almost = t + Duration::minutes(20) - Duration::seconds(1);
        assert!(scheduler.evaluate_at(almost).triggered.is_empty());
        assert_eq!(scheduler.evaluate_at(t + Duration::minutes(20)).triggered.len(), 1);
    }

    #[test]
    fn huge_timeout_saturates_instead_of_overflowing() {
        let mut cfg = config();
        cfg.timeout = Duration::max_value();

        let scheduler = AlertScheduler::new(cfg);
        let t = Utc::now();
        assert!(scheduler.on_departure(&departed(1, t, None)));

        assert_eq!(scheduler.get(1).unwrap().fire_at, DateTime::<Utc>::MAX_UTC);
        assert!(scheduler.evaluate_at(t + Duration::days(365 * 100)).triggered.is_empty());
    }

    #[test]
    fn fires_after_timeout_only() {
        let scheduler = AlertScheduler::new(config());
        let t = Utc::now();

        assert!(scheduler.on_departure(&departed(7, t, None)));
        assert_eq!(scheduler.get(7).unwrap().fire_at, t + Duration::minutes(20));

        assert!(scheduler.evaluate_at(t + Duration::minutes(19)).triggered.is_empty());

        let report = scheduler.evaluate_at(t + Duration::minutes(21));
        assert_eq!(report.triggered.len(), 1);
        assert_eq!(report.triggered[0].tracking_id, 7);
    }

    #[test]
    fn trigger_is_idempotent() {
        let scheduler = AlertScheduler::new(config());
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        scheduler.register_observer(Arc::new(move |_: &PendingAlert| -> Result<()> {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }));

        let t = Utc::now();
        scheduler.on_departure(&departed(1, t, None));

        let mut fired = 0;
        for minutes in 21..25 {
            fired += scheduler.evaluate_at(t + Duration::minutes(minutes)).triggered.len();
        }

        assert_eq!(fired, 1);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(scheduler.triggered_alerts().len(), 1);
    }

    #[test]
    fn departure_is_idempotent() {
        let scheduler = AlertScheduler::new(config());
        let t = Utc::now();

        assert!(scheduler.on_departure(&departed(3, t, None)));
        assert!(!scheduler.on_departure(&departed(3, t + Duration::minutes(5), None)));
        assert_eq!(scheduler.get(3).unwrap().departed_at, t);
        assert_eq!(scheduler.pending_alerts().len(), 1);
    }

    #[test]
    fn return_before_trigger_cancels() {
        let scheduler = AlertScheduler::new(config());
        let t = Utc::now();

        scheduler.on_departure(&departed(4, t, None));
        assert!(scheduler.on_return(4));

        assert!(scheduler.evaluate_at(t + Duration::hours(1)).triggered.is_empty());
        assert!(scheduler.pending_alerts().is_empty());
        assert!(scheduler.all_alerts().is_empty());
        assert!(!scheduler.on_return(4));
    }

    #[test]
    fn return_after_trigger_keeps_the_alert() {
        let scheduler = AlertScheduler::new(config());
        let t = Utc::now();

        scheduler.on_departure(&departed(5, t, None));
        scheduler.evaluate_at(t + Duration::minutes(30));

        assert!(!scheduler.on_return(5));
        assert_eq!(scheduler.get(5).unwrap().state(), AlertState::Triggered);
    }

    #[test]
    fn racing_return_and_trigger_settle_on_one_outcome() {
        use std::sync::Barrier;

        let t = Utc::now();
        let (mut cancelled, mut fired) = (0, 0);

        for _ in 0..200 {
            let scheduler = AlertScheduler::new(config());
            let notified = Arc::new(AtomicUsize::new(0));
            let counter = notified.clone();
            scheduler.register_observer(Arc::new(move |_: &PendingAlert| -> Result<()> {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }));
            scheduler.on_departure(&departed(1, t, None));

            let barrier = Barrier::new(2);
            let (returned, triggered) = std::thread::scope(|s| {
                let ret = s.spawn(|| {
                    barrier.wait();
                    scheduler.on_return(1)
                });
                let eval = s.spawn(|| {
                    barrier.wait();
                    scheduler.evaluate_at(t + Duration::minutes(21)).triggered.len()
                });
                (ret.join().unwrap(), eval.join().unwrap())
            });

            if returned {
                assert_eq!(triggered, 0);
                assert!(scheduler.get(1).is_none());
                assert_eq!(notified.load(Ordering::SeqCst), 0);
                cancelled += 1;
            } else {
                assert_eq!(triggered, 1);
                assert_eq!(scheduler.get(1).unwrap().state(), AlertState::Triggered);
                assert_eq!(notified.load(Ordering::SeqCst), 1);
                fired += 1;
            }

            // settled: nothing left to fire or cancel
            assert!(scheduler.evaluate_at(t + Duration::hours(1)).triggered.is_empty());
            assert!(!scheduler.on_return(1));
        }

        assert_eq!(cancelled + fired, 200);
    }

    #[test]
    fn returning_external_identity_cancels_its_alerts() {
        let scheduler = AlertScheduler::new(config());
        let t = Utc::now();

        scheduler.on_departure(&departed(1, t, Some("alice")));
        scheduler.on_departure(&departed(2, t, Some("bob")));
        scheduler.on_departure(&departed(3, t, Some("alice")));

        assert_eq!(scheduler.on_identity_returned("alice"), vec![1, 3]);
        assert_eq!(scheduler.pending_alerts().len(), 1);
        assert!(scheduler.on_identity_returned("carol").is_empty());
    }

    #[test]
    fn acknowledge_only_triggered_alerts() {
        let store = Arc::new(MemoryStore::new());
        let scheduler = AlertScheduler::new(config()).with_store(store.clone());
        let t = Utc::now();

        scheduler.on_departure(&departed(9, t, Some("dave")));
        assert!(!scheduler.acknowledge(9));
        assert!(!scheduler.acknowledge(10));

        let report = scheduler.evaluate_at(t + Duration::minutes(20));
        assert_eq!(report.triggered[0].alert_id, Some(1));
        assert_eq!(store.alerts()[0].timeout_minutes, 20);
        assert_eq!(store.alerts()[0].external_identity.as_deref(), Some("dave"));

        assert!(scheduler.acknowledge(9));
        assert!(!scheduler.acknowledge(9));
        assert!(store.unacknowledged_alerts().is_empty());

        let stats = scheduler.statistics();
        assert_eq!(stats.total_triggered, 1);
        assert_eq!(stats.total_acknowledged, 1);
        assert_eq!(stats.total_unacknowledged, 0);
        assert!(scheduler.triggered_alerts().is_empty());
    }

    #[test]
    fn failing_observers_are_isolated() {
        let scheduler = AlertScheduler::new(config());
        let calls = Arc::new(AtomicUsize::new(0));

        scheduler.register_observer(Arc::new(|_: &PendingAlert| -> Result<()> {
            Err(Error::Observer("smtp down".into()))
        }));
        scheduler.register_observer(Arc::new(|_: &PendingAlert| -> Result<()> {
            panic!("observer bug")
        }));
        let counter = calls.clone();
        scheduler.register_observer(Arc::new(move |_: &PendingAlert| -> Result<()> {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }));

        let t = Utc::now();
        scheduler.on_departure(&departed(1, t, None));
        let report = scheduler.evaluate_at(t + Duration::minutes(21));

        assert_eq!(report.triggered.len(), 1);
        assert_eq!(report.observer_failures, 2);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(scheduler.get(1).unwrap().state(), AlertState::Triggered);
    }

    #[test]
    fn time_remaining_never_negative() {
        let t = Utc::now();
        let alert = PendingAlert::new(&departed(1, t, None), Duration::minutes(20));

        assert_eq!(alert.time_remaining_at(t + Duration::minutes(5)), Duration::minutes(15));
        assert_eq!(alert.time_remaining_at(t + Duration::hours(2)), Duration::zero());
        assert!(alert.should_trigger_at(t + Duration::minutes(20)));
    }

    #[test]
    fn background_evaluator_fires_due_alerts() {
        let mut cfg = config();
        cfg.timeout = Duration::zero();

        let scheduler = Arc::new(AlertScheduler::new(cfg));
        scheduler.start().unwrap();
        assert!(scheduler.is_running());

        scheduler.on_departure(&departed(1, Utc::now(), None));

        let deadline = std::time::Instant::now() + std::time::Duration::from_secs(5);
        while scheduler.triggered_alerts().is_empty() && std::time::Instant::now() < deadline {
            std::thread::sleep(std::time::Duration::from_millis(5));
        }

        assert_eq!(scheduler.triggered_alerts().len(), 1);
        scheduler.stop();
        assert!(!scheduler.is_running());
    }
}
