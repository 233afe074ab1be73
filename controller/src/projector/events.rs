use chrono::Utc;
use k8s_openapi::api::core::v1::Event;
use kecs_model::ServiceEvent;
use std::collections::HashMap;
use std::time::{Duration, Instant};

/// How many synthesized events a service keeps; ECS itself caps the list.
pub(crate) const MAX_SERVICE_EVENTS: usize = 100;

/// Drops duplicate `(object, reason, message)` events observed within the rate-limit window.
/// The Kubernetes event stream repeats itself aggressively; one copy per second is plenty.
pub(crate) struct EventDeduper {
    window: Duration,
    seen: HashMap<(String, String, String), Instant>,
}

impl EventDeduper {
    pub(crate) fn new(window: Duration) -> Self {
        Self {
            window,
            seen: HashMap::new(),
        }
    }

    /// Returns `true` when this event should be processed.
    pub(crate) fn accept(&mut self, object: &str, reason: &str, message: &str) -> bool {
        let now = Instant::now();
        self.seen
            .retain(|_, last_seen| now.duration_since(*last_seen) < self.window);
        let key = (object.to_owned(), reason.to_owned(), message.to_owned());
        match self.seen.get(&key) {
            Some(last_seen) if now.duration_since(*last_seen) < self.window => false,
            _ => {
                self.seen.insert(key, now);
                true
            }
        }
    }
}

/// Synthesize an ECS service event from a Kubernetes event, in the `(service x) message`
/// phrasing the ECS console uses.
pub(crate) fn service_event_from(service_name: &str, event: &Event) -> ServiceEvent {
    let reason = event.reason.as_deref().unwrap_or("Unknown");
    let message = event.message.as_deref().unwrap_or_default();
    ServiceEvent {
        id: uuid_like(event),
        created_at: Some(
            event
                .last_timestamp
                .as_ref()
                .or(event.first_timestamp.as_ref())
                .map(|time| time.0)
                .unwrap_or_else(Utc::now),
        ),
        message: format!("(service {}) {}: {}", service_name, reason, message),
    }
}

/// Prepend `event` and trim the list to the cap.
pub(crate) fn push_service_event(events: &mut Vec<ServiceEvent>, event: ServiceEvent) {
    events.insert(0, event);
    events.truncate(MAX_SERVICE_EVENTS);
}

fn uuid_like(event: &Event) -> String {
    event
        .metadata
        .uid
        .clone()
        .unwrap_or_else(|| format!("evt-{}", Utc::now().timestamp_nanos_opt().unwrap_or_default()))
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn duplicate_events_within_window_are_dropped() {
        let mut deduper = EventDeduper::new(Duration::from_secs(1));
        assert!(deduper.accept("pod/a", "Pulled", "image pulled"));
        assert!(!deduper.accept("pod/a", "Pulled", "image pulled"));
        // A different message is a different event.
        assert!(deduper.accept("pod/a", "Pulled", "another image pulled"));
        // Same message for a different object passes too.
        assert!(deduper.accept("pod/b", "Pulled", "image pulled"));
    }

    #[test]
    fn event_list_is_capped() {
        let mut events = Vec::new();
        for index in 0..(MAX_SERVICE_EVENTS + 10) {
            push_service_event(
                &mut events,
                ServiceEvent {
                    id: index.to_string(),
                    created_at: None,
                    message: format!("event {}", index),
                },
            );
        }
        assert_eq!(events.len(), MAX_SERVICE_EVENTS);
        // Newest first.
        assert_eq!(events[0].id, (MAX_SERVICE_EVENTS + 9).to_string());
    }

    #[test]
    fn service_event_phrasing() {
        let mut event = Event::default();
        event.reason = Some("ScalingReplicaSet".to_string());
        event.message = Some("Scaled up replica set s1-abc to 2".to_string());
        let service_event = service_event_from("s1", &event);
        assert_eq!(
            service_event.message,
            "(service s1) ScalingReplicaSet: Scaled up replica set s1-abc to 2"
        );
    }
}
