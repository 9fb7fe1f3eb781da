//! Events the monitor publishes to anyone listening. Publishing never waits for subscribers and a
//! slow subscriber only loses its own backlog.

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::broadcast;
use tokio_stream::{
    StreamExt,
    wrappers::{BroadcastStream, errors::BroadcastStreamRecvError},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::fusion::{ActivityState, ActivityStatus, DailyStats, StateTransition};

const EVENT_CAPACITY: usize = 64;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum MonitorEvent {
    #[serde(rename_all = "camelCase")]
    ActivityChanged {
        is_active: bool,
        previous_state: ActivityState,
        new_state: ActivityState,
        timestamp: DateTime<Utc>,
    },
    #[serde(rename_all = "camelCase")]
    StatusUpdate {
        state: ActivityState,
        is_active: bool,
        last_activity: DateTime<Utc>,
        /// Milliseconds since the last qualifying signal.
        #[serde(rename = "idleTime")]
        idle_time_ms: i64,
        stats: DailyStats,
    },
    MouseActivity {
        timestamp: DateTime<Utc>,
    },
    KeyboardActivity {
        timestamp: DateTime<Utc>,
    },
    WindowChanged {
        app: String,
        title: String,
        timestamp: DateTime<Utc>,
    },
}

impl From<&StateTransition> for MonitorEvent {
    fn from(transition: &StateTransition) -> Self {
        MonitorEvent::ActivityChanged {
            is_active: transition.next.is_active(),
            previous_state: transition.previous,
            new_state: transition.next,
            timestamp: transition.timestamp,
        }
    }
}

impl From<ActivityStatus> for MonitorEvent {
    fn from(status: ActivityStatus) -> Self {
        MonitorEvent::StatusUpdate {
            state: status.state,
            is_active: status.is_active,
            last_activity: status.last_activity,
            idle_time_ms: status.idle_time_ms,
            stats: status.stats,
        }
    }
}

#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<MonitorEvent>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(EVENT_CAPACITY);
        Self { sender }
    }

    pub fn publish(&self, event: MonitorEvent) {
        // No receivers is the common case when nobody listens.
        if self.sender.send(event).is_err() {
            debug!("Event dropped, no subscribers");
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<MonitorEvent> {
        self.sender.subscribe()
    }
}

/// Writes every event into the log until shutdown. The daemon has no UI, so this is the consumer
/// that makes the event stream observable.
pub async fn log_events(receiver: broadcast::Receiver<MonitorEvent>, shutdown: CancellationToken) {
    let mut events = BroadcastStream::new(receiver);
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => return,
            event = events.next() => match event {
                Some(Ok(MonitorEvent::ActivityChanged { previous_state, new_state, timestamp, .. })) => {
                    info!("Activity changed {previous_state} -> {new_state} at {timestamp}");
                }
                Some(Ok(event)) => debug!("Event {}", serde_json::to_string(&event).unwrap_or_default()),
                Some(Err(BroadcastStreamRecvError::Lagged(skipped))) => {
                    warn!("Event log lagged behind, skipped {skipped} events");
                }
                None => return,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use chrono::{TimeZone, Utc};
    use serde_json::json;

    use crate::daemon::fusion::{
        ActivityFusion, ActivityState, DailyStats, FusionThresholds, StateTransition,
    };

    use super::{EventBus, MonitorEvent};

    #[test]
    fn publishing_without_subscribers_is_fine() {
        let bus = EventBus::new();
        bus.publish(MonitorEvent::MouseActivity {
            timestamp: Utc::now(),
        });
    }

    #[tokio::test]
    async fn every_subscriber_receives_events() {
        let bus = EventBus::new();
        let mut first = bus.subscribe();
        let mut second = bus.subscribe();
        let timestamp = Utc.with_ymd_and_hms(2018, 7, 4, 9, 0, 0).unwrap();

        bus.publish(MonitorEvent::KeyboardActivity { timestamp });

        assert_eq!(first.recv().await.unwrap(), MonitorEvent::KeyboardActivity { timestamp });
        assert_eq!(second.recv().await.unwrap(), MonitorEvent::KeyboardActivity { timestamp });
    }

    #[test]
    fn activity_change_serializes_with_type_tag() {
        let timestamp = Utc.with_ymd_and_hms(2018, 7, 4, 9, 0, 0).unwrap();
        let event = MonitorEvent::from(&StateTransition {
            previous: ActivityState::Idle,
            next: ActivityState::Active,
            timestamp,
        });

        assert_eq!(
            serde_json::to_value(&event).unwrap(),
            json!({
                "type": "activity-changed",
                "isActive": true,
                "previousState": "idle",
                "newState": "active",
                "timestamp": "2018-07-04T09:00:00Z",
            })
        );
    }

    #[test]
    fn status_update_carries_idle_time() {
        let start = Utc.with_ymd_and_hms(2018, 7, 4, 9, 0, 0).unwrap();
        let fusion = ActivityFusion::new(
            FusionThresholds::default(),
            start,
            DailyStats::new("2018-07-04".into()),
        );

        let event = MonitorEvent::from(fusion.status(start + chrono::Duration::seconds(2)));
        let value = serde_json::to_value(&event).unwrap();

        assert_eq!(value["type"], "status-update");
        assert_eq!(value["isActive"], true);
        assert_eq!(value["idleTime"], 2_000);
        assert_eq!(value["lastActivity"], "2018-07-04T09:00:00Z");
    }
}
