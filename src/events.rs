use serde::Serialize;
use tokio::sync::broadcast;
use tracing::trace;

/// Lifecycle events consumed by the sales/UI layers.
///
/// Delivery is at-most-once: a subscriber that lags behind the channel
/// capacity loses the oldest events, and there is no ordering across topics.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum EdgeEvent {
    SessionStart {
        camera_id: i64,
        face_id: String,
        lane_name: Option<String>,
    },
    SessionEnd {
        camera_id: i64,
        face_id: Option<String>,
        faces: usize,
        got_faces: bool,
    },
    Recognized {
        client_id: i64,
        face_id: String,
        camera_id: i64,
        similarity: f32,
    },
    CameraAdded {
        camera_id: i64,
        ip: String,
        port: u16,
    },
    CameraRemoved {
        camera_id: i64,
        ip: String,
        port: u16,
    },
    RecordingAdded {
        client_id: i64,
        camera_id: i64,
        master_video_id: i64,
        clip_ids: Vec<i64>,
        shots: Vec<f64>,
    },
    ClientRemoved {
        client_id: i64,
        face_id: String,
        reason: String,
    },
}

impl EdgeEvent {
    pub fn topic(&self) -> &'static str {
        match self {
            EdgeEvent::SessionStart { .. } => "session.start",
            EdgeEvent::SessionEnd { .. } => "session.end",
            EdgeEvent::Recognized { .. } => "recognized",
            EdgeEvent::CameraAdded { .. } => "camera.added",
            EdgeEvent::CameraRemoved { .. } => "camera.removed",
            EdgeEvent::RecordingAdded { .. } => "recording.added",
            EdgeEvent::ClientRemoved { .. } => "client.removed",
        }
    }
}

#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<EdgeEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Fire-and-forget; having no subscriber is not an error
    pub fn publish(&self, event: EdgeEvent) {
        trace!("Publishing event {}", event.topic());
        let _ = self.sender.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EdgeEvent> {
        self.sender.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_publish_without_subscribers_is_noop() {
        let bus = EventBus::new(4);
        bus.publish(EdgeEvent::CameraAdded { camera_id: 1, ip: "10.0.0.2".into(), port: 80 });
    }

    #[tokio::test]
    async fn test_lagging_subscriber_drops_oldest() {
        let bus = EventBus::new(2);
        let mut rx = bus.subscribe();
        for id in 0..4 {
            bus.publish(EdgeEvent::CameraRemoved { camera_id: id, ip: "10.0.0.2".into(), port: 80 });
        }

        assert!(matches!(rx.recv().await, Err(broadcast::error::RecvError::Lagged(2))));
        match rx.recv().await.unwrap() {
            EdgeEvent::CameraRemoved { camera_id, .. } => assert_eq!(camera_id, 2),
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[test]
    fn test_event_serializes_with_tag() {
        let event = EdgeEvent::SessionEnd { camera_id: 3, face_id: None, faces: 0, got_faces: false };
        assert_eq!(event.topic(), "session.end");
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["event"], "session_end");
        assert_eq!(json["got_faces"], false);
    }
}
