use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, Query, State};
use axum::response::Response;
use axum::routing::get;
use axum::Router;
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;

use crate::error::{AppError, AppResult};
use crate::services::hosts::ConsoleCommand;
use crate::state::AppState;

#[derive(Debug, serde::Deserialize)]
pub struct ConsoleQuery {
    pub command: String,
}

pub fn router() -> Router<AppState> {
    Router::new().route("/ws/server/{id}/console", get(console_socket))
}

pub(crate) async fn console_socket(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    Query(query): Query<ConsoleQuery>,
    ws: WebSocketUpgrade,
) -> AppResult<Response> {
    let command: ConsoleCommand = query.command.parse()?;
    Ok(ws.on_upgrade(move |socket| run_console(socket, state, id, command)))
}

async fn run_console(
    socket: WebSocket,
    state: AppState,
    server_id: i64,
    command: ConsoleCommand,
) {
    let (mut sender, mut receiver) = socket.split();
    let (lines, mut queued) = mpsc::unbounded_channel::<String>();
    let cancel = state.shutdown.child_token();

    let writer = tokio::spawn(async move {
        while let Some(line) = queued.recv().await {
            if sender.send(Message::Text(line.into())).await.is_err() {
                break;
            }
        }
        let _ = sender.close().await;
    });

    let reader_cancel = cancel.clone();
    let reader = tokio::spawn(async move {
        while let Some(Ok(message)) = receiver.next().await {
            if matches!(message, Message::Close(_)) {
                break;
            }
        }
        reader_cancel.cancel();
    });

    let errors = lines.clone();
    if let Err(err) = state
        .hosts
        .console(server_id, command, lines, cancel.clone())
        .await
    {
        let _ = errors.send(AppError::from(err).message);
    }
    drop(errors);
    let _ = writer.await;
    reader.abort();
}
