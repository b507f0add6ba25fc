use axum::{
  Router,
  extract::{
    State, WebSocketUpgrade,
    ws::{Message, WebSocket},
  },
  response::IntoResponse,
  routing::get,
};
use futures::{SinkExt, StreamExt};
use tokio::select;
use tokio_util::sync::CancellationToken;

use crate::state::State as AppState;

pub fn router(state: AppState) -> Router {
  Router::new()
    .route("/events", get(events_handler))
    .with_state(state)
}

/// Streams every event bus message to the client as JSON text.
/// A subscriber that stops reading lags and silently misses
/// events rather than back-pressuring publishers.
async fn events_handler(
  State(state): State<AppState>,
  ws: WebSocketUpgrade,
) -> impl IntoResponse {
  let receiver = state.events.subscribe();
  ws.on_upgrade(move |socket| handle_socket(socket, receiver))
}

async fn handle_socket(
  socket: WebSocket,
  mut receiver: tokio::sync::broadcast::Receiver<
    tidewatch_client::entities::event::Event,
  >,
) {
  let (mut sender, mut client_messages) = socket.split();

  let cancel = CancellationToken::new();
  let cancel_clone = cancel.clone();

  tokio::spawn(async move {
    loop {
      let event = select! {
        _ = cancel_clone.cancelled() => break,
        event = receiver.recv() => match event {
          Ok(event) => event,
          Err(
            tokio::sync::broadcast::error::RecvError::Lagged(_),
          ) => continue,
          Err(_) => break,
        },
      };
      let Ok(text) = serde_json::to_string(&event) else {
        continue;
      };
      if sender.send(Message::text(text)).await.is_err() {
        break;
      }
    }
    let _ = sender.close().await;
  });

  // Only the close message matters from the client side.
  while let Some(message) = client_messages.next().await {
    match message {
      Ok(Message::Close(_)) | Err(_) => {
        cancel.cancel();
        return;
      }
      _ => {}
    }
  }
  cancel.cancel();
}
