//! Metric names and recording for hub and presence activity.
//!
//! Recording goes through the `metrics` facade, so it is a no-op until the
//! embedding process installs a recorder.

use crate::hub::PublishReport;
use metrics::{counter, gauge};

/// Metric names.
pub mod names {
    pub const MESSAGES_PUBLISHED: &str = "roomcast_messages_published_total";
    pub const DELIVERIES_TOTAL: &str = "roomcast_deliveries_total";
    pub const DELIVERY_FAILURES: &str = "roomcast_delivery_failures_total";
    pub const USERS_ONLINE: &str = "roomcast_users_online";
}

/// Record one publish and its fan-out outcome.
pub fn record_publish(report: &PublishReport) {
    counter!(names::MESSAGES_PUBLISHED).increment(1);
    counter!(names::DELIVERIES_TOTAL).increment(report.delivered as u64);
    if report.failed > 0 {
        counter!(names::DELIVERY_FAILURES).increment(report.failed as u64);
    }
}

/// Update the tracked user count.
pub fn set_users_online(count: usize) {
    gauge!(names::USERS_ONLINE).set(count as f64);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::{OverflowPolicy, QueuedConnection};
    use crate::hub::Hub;
    use crate::message::Message;
    use crate::presence::PresenceTracker;
    use crate::room::PRESENCE;
    use metrics::{Counter, Gauge, Histogram, Key, KeyName, Metadata, Recorder, SharedString, Unit};
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::sync::{Arc, Mutex};

    #[derive(Default)]
    struct Capture {
        values: Mutex<HashMap<String, Arc<AtomicU64>>>,
    }

    impl Capture {
        fn slot(&self, key: &Key) -> Arc<AtomicU64> {
            let mut values = self.values.lock().unwrap();
            Arc::clone(values.entry(key.name().to_string()).or_default())
        }

        fn counter(&self, name: &str) -> u64 {
            self.values
                .lock()
                .unwrap()
                .get(name)
                .map_or(0, |v| v.load(Ordering::SeqCst))
        }

        fn gauge(&self, name: &str) -> f64 {
            f64::from_bits(self.counter(name))
        }
    }

    impl Recorder for Capture {
        fn describe_counter(&self, _: KeyName, _: Option<Unit>, _: SharedString) {}
        fn describe_gauge(&self, _: KeyName, _: Option<Unit>, _: SharedString) {}
        fn describe_histogram(&self, _: KeyName, _: Option<Unit>, _: SharedString) {}

        fn register_counter(&self, key: &Key, _: &Metadata<'_>) -> Counter {
            Counter::from_arc(self.slot(key))
        }

        fn register_gauge(&self, key: &Key, _: &Metadata<'_>) -> Gauge {
            Gauge::from_arc(self.slot(key))
        }

        fn register_histogram(&self, _: &Key, _: &Metadata<'_>) -> Histogram {
            Histogram::noop()
        }
    }

    #[test]
    fn test_publishes_and_presence_edges_are_recorded() {
        let capture = Capture::default();

        metrics::with_local_recorder(&capture, || {
            let hub = Hub::new();
            let presence = PresenceTracker::new();
            let (watcher, _events) = QueuedConnection::new(8, OverflowPolicy::DropNewest);
            hub.join(PRESENCE, watcher);

            let lease = presence.acquire("u1");
            assert_eq!(capture.gauge(names::USERS_ONLINE), 1.0);

            hub.publish_message(&Message::online("u1")).unwrap();
            hub.publish_message(&Message::new("post_created", "feed"))
                .unwrap();

            assert!(presence.release(&lease));
            assert_eq!(capture.gauge(names::USERS_ONLINE), 0.0);
        });

        assert_eq!(capture.counter(names::MESSAGES_PUBLISHED), 2);
        assert_eq!(capture.counter(names::DELIVERIES_TOTAL), 1);
        assert_eq!(capture.counter(names::DELIVERY_FAILURES), 0);
    }
}
