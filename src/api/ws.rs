//! WebSocket adapter for the per-study retrieve progress topics.
//!
//! Subscribers receive one JSON message per job snapshot; the terminal
//! snapshot is followed by a normal close.

use crate::retrieve::RetrieveJob;
use crate::AppState;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, State};
use axum::response::Response;
use axum::routing::get;
use axum::Router;
use serde::Serialize;
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, instrument};

pub fn routes() -> Router<AppState> {
	Router::new().route("/topic/retrieve/{study}", get(subscribe))
}

/// The progress payload pushed per snapshot.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct RetrieveProgress {
	study_instance_uid: String,
	completed_instances: u32,
	total_instances: u32,
	percent_complete: u8,
	status: crate::types::RetrieveStatus,
}

impl From<&RetrieveJob> for RetrieveProgress {
	fn from(job: &RetrieveJob) -> Self {
		Self {
			study_instance_uid: job.study_instance_uid.clone(),
			completed_instances: job.completed_ops,
			total_instances: job.total_ops,
			percent_complete: job.percent_complete(),
			status: job.status,
		}
	}
}

#[instrument(skip_all, fields(study))]
async fn subscribe(
	State(state): State<AppState>,
	Path(study): Path<String>,
	upgrade: WebSocketUpgrade,
) -> Response {
	// Subscribe before upgrading so no snapshot published during the
	// handshake is lost.
	let receiver = state.progress.subscribe(&study);
	let current = state.orchestrator.active_job(&study);
	upgrade.on_upgrade(move |socket| forward(socket, receiver, current))
}

async fn forward(
	mut socket: WebSocket,
	mut receiver: tokio::sync::broadcast::Receiver<RetrieveJob>,
	current: Option<RetrieveJob>,
) {
	// Without a running job there are no snapshots to wait for.
	let Some(job) = current else {
		let _ = socket.send(Message::Close(None)).await;
		return;
	};

	if send_snapshot(&mut socket, &job).await.is_err() {
		return;
	}
	if job.status.is_terminal() {
		let _ = socket.send(Message::Close(None)).await;
		return;
	}

	loop {
		match receiver.recv().await {
			Ok(job) => {
				let terminal = job.status.is_terminal();
				if send_snapshot(&mut socket, &job).await.is_err() {
					return;
				}
				if terminal {
					break;
				}
			}
			// Intermediate snapshots may be coalesced under load; the
			// newest ones, including the terminal snapshot, survive.
			Err(RecvError::Lagged(skipped)) => {
				debug!(skipped, "Subscriber lagged behind progress topic");
			}
			Err(RecvError::Closed) => break,
		}
	}

	let _ = socket.send(Message::Close(None)).await;
}

async fn send_snapshot(socket: &mut WebSocket, job: &RetrieveJob) -> Result<(), axum::Error> {
	let progress = RetrieveProgress::from(job);
	let payload = serde_json::to_string(&progress).unwrap_or_default();
	socket.send(Message::Text(payload.into())).await
}
