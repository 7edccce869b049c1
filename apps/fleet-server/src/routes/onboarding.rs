use async_trait::async_trait;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::Response;
use axum::routing::get;
use axum::Router;
use futures::{SinkExt, StreamExt};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::error::AppError;
use crate::services::onboarding::{OnboardingRequest, PushChannel};
use crate::state::AppState;

const OPEN_MESSAGE: &str = "open";

/// Frames queued for the socket writer task.
struct SocketChannel {
    outbound: mpsc::UnboundedSender<String>,
}

#[async_trait]
impl PushChannel for SocketChannel {
    async fn send(&self, message: String) -> bool {
        self.outbound.send(message).is_ok()
    }
}

pub fn router() -> Router<AppState> {
    Router::new().route("/ws/onboarding", get(onboarding_socket))
}

pub(crate) async fn onboarding_socket(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
) -> Response {
    ws.on_upgrade(move |socket| run_onboarding(socket, state))
}

async fn run_onboarding(socket: WebSocket, state: AppState) {
    let (mut sender, mut receiver) = socket.split();
    if sender.send(Message::Text(OPEN_MESSAGE.into())).await.is_err() {
        return;
    }

    let submission = loop {
        match receiver.next().await {
            Some(Ok(Message::Text(text))) => break text,
            Some(Ok(Message::Close(_))) | Some(Err(_)) | None => return,
            Some(Ok(_)) => continue,
        }
    };
    let request: OnboardingRequest = match serde_json::from_str(submission.as_str()) {
        Ok(request) => request,
        Err(err) => {
            let reply = AppError::bad_request(format!("invalid onboarding submission: {err}"));
            let _ = sender.send(Message::Text(reply.message.into())).await;
            let _ = sender.close().await;
            return;
        }
    };

    let (outbound, mut queued) = mpsc::unbounded_channel::<String>();
    let socket_closed = state.shutdown.child_token();
    let session = match state
        .onboarding
        .submit(
            request,
            Arc::new(SocketChannel { outbound }),
            socket_closed.clone(),
        )
        .await
    {
        Ok(session) => session,
        Err(err) => {
            let reply = AppError::from(err);
            let _ = sender.send(Message::Text(reply.message.into())).await;
            let _ = sender.close().await;
            return;
        }
    };
    tracing::info!(public_ip = %session.public_ip(), "onboarding session opened");

    let finished = CancellationToken::new();
    let writer_done = finished.clone();
    let writer = tokio::spawn(async move {
        loop {
            tokio::select! {
                biased;
                message = queued.recv() => match message {
                    Some(message) => {
                        if sender.send(Message::Text(message.into())).await.is_err() {
                            return;
                        }
                    }
                    None => break,
                },
                _ = writer_done.cancelled() => {
                    while let Ok(message) = queued.try_recv() {
                        if sender.send(Message::Text(message.into())).await.is_err() {
                            return;
                        }
                    }
                    break;
                }
            }
        }
        let _ = sender.close().await;
    });

    let reader_closed = socket_closed.clone();
    let reader = tokio::spawn(async move {
        while let Some(Ok(message)) = receiver.next().await {
            if matches!(message, Message::Close(_)) {
                break;
            }
        }
        reader_closed.cancel();
    });

    let outcome = session.wait().await;
    tracing::debug!(outcome = ?outcome, "onboarding session finished");
    finished.cancel();
    let _ = writer.await;
    reader.abort();
}
