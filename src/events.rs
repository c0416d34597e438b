//! Fire-and-forget event stream for dashboards.
//!
//! Subscribers get a bounded channel. A subscriber that does not keep up loses events,
//! one that went away is dropped on the next publish. Publishing never blocks.

use chrono::{DateTime, Utc};
use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};
use parking_lot::Mutex;
use serde_derive::Serialize;
use std::sync::Arc;

use crate::alert::PendingAlert;
use crate::track::{TrackedIdentity, TrackingId};

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", content = "data")]
#[serde(rename_all = "snake_case")]
pub enum MonitorEvent {
    Arrived(TrackedIdentity),
    Departed(TrackedIdentity),
    /// Published once per processed frame.
    SourceUpdate(SourceUpdateMessage),
    AlertTriggered(PendingAlert),
    AlertCancelled(AlertCancelledMessage),
    AlertAcknowledged(AlertAcknowledgedMessage),
}

#[derive(Debug, Clone, Serialize)]
pub struct SourceUpdateMessage {
    pub source_id: String,
    pub detections: usize,
    pub tracked: usize,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct AlertCancelledMessage {
    pub tracking_id: TrackingId,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub external_identity: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct AlertAcknowledgedMessage {
    pub tracking_id: TrackingId,
    pub acknowledged_at: DateTime<Utc>,
}

/// A lagging subscriber is reported on its first dropped event and then every
/// `DROP_LOG_EVERY` drops until it catches up.
const DROP_LOG_EVERY: u64 = 100;

struct Subscriber {
    tx: Sender<MonitorEvent>,
    /// Consecutive drops since the last delivered event.
    lagging: u64,
    dropped: u64,
}

#[derive(Clone)]
pub struct EventBus {
    capacity: usize,
    subscribers: Arc<Mutex<Vec<Subscriber>>>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            subscribers: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn subscribe(&self) -> Receiver<MonitorEvent> {
        let (tx, rx) = bounded(self.capacity);
        self.subscribers.lock().push(Subscriber {
            tx,
            lagging: 0,
            dropped: 0,
        });
        rx
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().len()
    }

    /// Events lost to lagging subscribers that are still connected.
    pub fn dropped_events(&self) -> u64 {
        self.subscribers.lock().iter().map(|s| s.dropped).sum()
    }

    /// Returns the number of subscribers that received the event.
    pub fn publish(&self, event: MonitorEvent) -> usize {
        let mut delivered = 0;
        let mut subscribers = self.subscribers.lock();

        subscribers.retain_mut(|sub| match sub.tx.try_send(event.clone()) {
            Ok(()) => {
                if sub.lagging > 0 {
                    tracing::debug!(dropped = sub.lagging, "Event subscriber caught up");
                    sub.lagging = 0;
                }
                delivered += 1;
                true
            }
            Err(TrySendError::Full(_)) => {
                sub.lagging += 1;
                sub.dropped += 1;
                if should_log_drop(sub.lagging) {
                    tracing::warn!(dropped = sub.lagging, "Event subscriber lagging, events dropped");
                }
                true
            }
            Err(TrySendError::Disconnected(_)) => false,
        });

        delivered
    }
}

#[inline]
fn should_log_drop(lagging: u64) -> bool {
    lagging == 1 || lagging % DROP_LOG_EVERY == 0
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(id: TrackingId) -> MonitorEvent {
        MonitorEvent::AlertAcknowledged(AlertAcknowledgedMessage {
            tracking_id: id,
            acknowledged_at: Utc::now(),
        })
    }

    #[test]
    fn slow_and_gone_subscribers() {
        let bus = EventBus::new(1);
        let slow = bus.subscribe();
        let gone = bus.subscribe();
        drop(gone);

        assert_eq!(bus.publish(event(1)), 1);
        assert_eq!(bus.subscriber_count(), 1);

        // full, dropped
        assert_eq!(bus.publish(event(2)), 0);

        match slow.try_recv().unwrap() {
            MonitorEvent::AlertAcknowledged(m) => assert_eq!(m.tracking_id, 1),
            other => panic!("unexpected event {:?}", other),
        }
        assert!(slow.try_recv().is_err());
    }

    #[test]
    fn lagging_subscriber_is_counted_and_logged_sparsely() {
        let bus = EventBus::new(1);
        let slow = bus.subscribe();

        assert_eq!(bus.publish(event(0)), 1);
        for id in 1..=250 {
            assert_eq!(bus.publish(event(id)), 0);
        }
        assert_eq!(bus.dropped_events(), 250);

        let logged = (1..=250).filter(|&n| should_log_drop(n)).count();
        assert_eq!(logged, 3);

        // draining lets the next event through and resets the streak
        slow.try_recv().unwrap();
        assert_eq!(bus.publish(event(251)), 1);
        assert_eq!(bus.subscribers.lock()[0].lagging, 0);
        assert_eq!(bus.dropped_events(), 250);
    }

    #[test]
    fn events_serialize_tagged() {
        let json = serde_json::to_value(MonitorEvent::SourceUpdate(SourceUpdateMessage {
            source_id: "cam1".into(),
            detections: 2,
            tracked: 1,
            timestamp: Utc::now(),
        }))
        .unwrap();

        assert_eq!(json["type"], "source_update");
        assert_eq!(json["data"]["source_id"], "cam1");
        assert_eq!(json["data"]["tracked"], 1);
    }
}
