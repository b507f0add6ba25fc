use serde_json::json;
use tidewatch_client::entities::event::{
  Event, EventKind, UpdatePhase,
};
use tokio::sync::broadcast;

const CHANNEL_CAPACITY: usize = 256;

/// In-process fan-out of progress / state events.
///
/// Built on a broadcast channel, so publishing never blocks:
/// a subscriber that stops draining lags and is skipped, it
/// cannot back-pressure producers.
#[derive(Debug)]
pub struct EventBus {
  sender: broadcast::Sender<Event>,
}

impl Default for EventBus {
  fn default() -> Self {
    let (sender, _) = broadcast::channel(CHANNEL_CAPACITY);
    EventBus { sender }
  }
}

impl EventBus {
  pub fn subscribe(&self) -> broadcast::Receiver<Event> {
    self.sender.subscribe()
  }

  pub fn publish(&self, event: Event) {
    // Err just means nobody is listening right now.
    let _ = self.sender.send(event);
  }

  pub fn publish_kind(
    &self,
    kind: EventKind,
    container_id: &str,
    container_name: &str,
    data: serde_json::Value,
  ) {
    self.publish(Event::new(
      kind,
      container_id,
      container_name,
      data,
    ));
  }

  /// The per-phase progress event every apply step emits.
  pub fn publish_progress(
    &self,
    container_id: &str,
    container_name: &str,
    phase: UpdatePhase,
    status: &str,
    message: &str,
  ) {
    self.publish_kind(
      EventKind::UpdateProgress,
      container_id,
      container_name,
      json!({
        "phase": phase,
        "progress": phase.progress(),
        "status": status,
        "message": message,
      }),
    );
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[tokio::test]
  async fn subscribers_receive_published_events() {
    let bus = EventBus::default();
    let mut receiver = bus.subscribe();
    bus.publish_kind(
      EventKind::UpdateAvailable,
      "abc",
      "web",
      json!({ "to_tag": "1.2.4" }),
    );
    let event = receiver.recv().await.unwrap();
    assert_eq!(event.kind, EventKind::UpdateAvailable);
    assert_eq!(event.container_name, "web");
    assert_eq!(event.data["to_tag"], "1.2.4");
  }

  #[tokio::test]
  async fn publish_without_subscribers_is_fine() {
    let bus = EventBus::default();
    bus.publish_kind(
      EventKind::UpdateCheckStarted,
      "abc",
      "web",
      json!({}),
    );
  }

  #[tokio::test]
  async fn slow_subscribers_lag_instead_of_blocking() {
    let bus = EventBus::default();
    let mut receiver = bus.subscribe();
    for i in 0..(CHANNEL_CAPACITY + 10) {
      bus.publish_kind(
        EventKind::UpdateProgress,
        "abc",
        "web",
        json!({ "i": i }),
      );
    }
    // The receiver missed the earliest events and reports the lag.
    match receiver.recv().await {
      Err(broadcast::error::RecvError::Lagged(missed)) => {
        assert!(missed > 0);
      }
      other => panic!("expected lag, got {other:?}"),
    }
  }
}
