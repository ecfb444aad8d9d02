//! Log Stream WebSocket Handlers
//!
//! Two endpoints per run:
//! - `stagelogstream`: a worker forwarder pushes one text frame per log line,
//!   which is republished on the log bus.
//! - `logstream`: a viewer receives every subsequent bus line of the run as a
//!   JSON frame, periodic pings while idle, and a close frame when the run's
//!   stream ends. Unknown runs are refused; viewers of a resolved run get the
//!   close frame right away.
//!
//! Pings sent by workers are answered by axum at the protocol level.

use axum::{
    body::Bytes,
    extract::{
        Path, Query, State,
        ws::{CloseFrame, Message, Utf8Bytes, WebSocket, WebSocketUpgrade, close_code},
    },
    response::Response,
};
use futures::{SinkExt, StreamExt};
use gantry_core::domain::log::viewer_line;
use gantry_core::dto::log::{StageLogQuery, ViewerFrame};
use std::time::Duration;
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::api::AppState;
use crate::api::error::ApiResult;
use crate::service::event_service;
use crate::service::log_bus::{BusMessage, LogBus, run_topic};

/// Keep-alive period towards viewers
const VIEWER_PING_INTERVAL: Duration = Duration::from_secs(30);

/// GET /api/v1/projects/{project_id}/pipelines/{pipeline_id}/records/{record_id}/stagelogstream?stage=&task=
pub async fn stage_log_stream(
    State(state): State<AppState>,
    Path((project_id, pipeline_id, record_id)): Path<(Uuid, Uuid, Uuid)>,
    Query(query): Query<StageLogQuery>,
    ws: WebSocketUpgrade,
) -> Response {
    let topic = run_topic(project_id, pipeline_id, record_id);
    tracing::debug!(
        "Stage log stream opened for {} ({}{})",
        topic,
        query.stage,
        query.task.as_deref().map(|t| format!("/{}", t)).unwrap_or_default()
    );

    ws.on_upgrade(move |socket| receive_stage_log(socket, state.bus, topic, query))
}

async fn receive_stage_log(mut socket: WebSocket, bus: LogBus, topic: String, query: StageLogQuery) {
    let mut received = 0usize;

    while let Some(message) = socket.recv().await {
        match message {
            Ok(Message::Text(text)) => {
                for line in text.as_str().lines().filter(|l| !l.is_empty()) {
                    bus.publish(
                        &topic,
                        BusMessage::Line {
                            stage: query.stage,
                            task: query.task.clone(),
                            line: line.to_string(),
                        },
                    )
                    .await;
                    received += 1;
                }
            }
            Ok(Message::Close(_)) => break,
            Ok(_) => {}
            Err(e) => {
                tracing::warn!("Stage log stream for {} dropped: {}", topic, e);
                break;
            }
        }
    }

    tracing::debug!(
        "Stage log stream for {} ({}) closed after {} lines",
        topic,
        query.stage,
        received
    );
}

/// GET /api/v1/projects/{project_id}/pipelines/{pipeline_id}/records/{record_id}/logstream
pub async fn viewer_log_stream(
    State(state): State<AppState>,
    Path((project_id, pipeline_id, record_id)): Path<(Uuid, Uuid, Uuid)>,
    ws: WebSocketUpgrade,
) -> ApiResult<Response> {
    let topic = run_topic(project_id, pipeline_id, record_id);
    let records = state.records.as_ref();

    let record = event_service::get_record(records, project_id, pipeline_id, record_id).await?;
    if record.is_terminal() {
        return Ok(ws.on_upgrade(move |socket| close_viewer(socket, topic)));
    }

    // Subscribe before the upgrade so nothing published after the request is missed
    let rx = state.bus.subscribe(&topic).await;

    // The run may have resolved between the lookup and the subscription
    let record = event_service::get_record(records, project_id, pipeline_id, record_id).await?;
    if record.is_terminal() {
        state.bus.end(&topic).await;
    }

    Ok(ws.on_upgrade(move |socket| relay_to_viewer(socket, rx, topic)))
}

fn stream_end() -> CloseFrame {
    CloseFrame {
        code: close_code::NORMAL,
        reason: Utf8Bytes::from_static("stream end"),
    }
}

async fn close_viewer(mut socket: WebSocket, topic: String) {
    let _ = socket.send(Message::Close(Some(stream_end()))).await;
    tracing::debug!("Viewer of resolved run {} closed", topic);
}

async fn relay_to_viewer(socket: WebSocket, mut rx: broadcast::Receiver<BusMessage>, topic: String) {
    let (mut sender, mut receiver) = socket.split();
    tracing::info!("Viewer attached to {}", topic);

    let send_topic = topic.clone();
    let mut send_task = tokio::spawn(async move {
        let mut ping = tokio::time::interval(VIEWER_PING_INTERVAL);
        ping.tick().await;

        loop {
            tokio::select! {
                message = rx.recv() => match message {
                    Ok(BusMessage::Line { stage, task, line }) => {
                        let Some(view) = viewer_line(&line) else {
                            continue;
                        };
                        let frame = ViewerFrame {
                            stage,
                            task,
                            id: view.id,
                            log: view.log,
                        };
                        let Ok(text) = serde_json::to_string(&frame) else {
                            continue;
                        };
                        if sender.send(Message::Text(Utf8Bytes::from(text))).await.is_err() {
                            break;
                        }
                    }
                    Ok(BusMessage::End) | Err(broadcast::error::RecvError::Closed) => {
                        let _ = sender.send(Message::Close(Some(stream_end()))).await;
                        break;
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::warn!("Viewer of {} lagged, {} lines dropped", send_topic, skipped);
                    }
                },
                _ = ping.tick() => {
                    if sender.send(Message::Ping(Bytes::new())).await.is_err() {
                        break;
                    }
                }
            }
        }
    });

    let mut recv_task = tokio::spawn(async move {
        while let Some(Ok(message)) = receiver.next().await {
            if let Message::Close(_) = message {
                break;
            }
        }
    });

    tokio::select! {
        _ = &mut send_task => recv_task.abort(),
        _ = &mut recv_task => send_task.abort(),
    }

    tracing::info!("Viewer detached from {}", topic);
}
