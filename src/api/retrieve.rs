//! Retrieve control: start a study retrieve, cancel a running one.

use crate::api::node_error_response;
use crate::retrieve::{RetrieveError, RetrieveReceipt, RetrieveRequest};
use crate::AppState;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::json;
use tracing::instrument;

#[rustfmt::skip]
pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/api/retrieve/study/{study}", post(retrieve_study))
        .route("/api/retrieve/study/{study}", delete(cancel_retrieve))
}

#[derive(Deserialize)]
struct RetrieveParameters {
	#[serde(rename = "pacsNode")]
	pacs_node: Option<String>,
}

#[instrument(skip_all, fields(study))]
async fn retrieve_study(
	State(state): State<AppState>,
	Path(study): Path<String>,
	Query(parameters): Query<RetrieveParameters>,
) -> Response {
	let request = RetrieveRequest::study(study, parameters.pacs_node);

	match state.orchestrator.start(request).await {
		Ok(RetrieveReceipt::AlreadyCached { study_instance_uid }) => (
			StatusCode::OK,
			Json(json!({
				"status": "ALREADY_CACHED",
				"studyInstanceUid": study_instance_uid,
			})),
		)
			.into_response(),
		Ok(RetrieveReceipt::Started { job }) => (
			StatusCode::ACCEPTED,
			Json(json!({
				"status": "RETRIEVING",
				"studyInstanceUid": job.study_instance_uid,
				"websocketTopic": format!("/topic/retrieve/{}", job.study_instance_uid),
			})),
		)
			.into_response(),
		Err(RetrieveError::Node(err)) => node_error_response(&err),
		Err(err) => (StatusCode::INTERNAL_SERVER_ERROR, err.to_string()).into_response(),
	}
}

#[instrument(skip_all, fields(study))]
async fn cancel_retrieve(
	State(state): State<AppState>,
	Path(study): Path<String>,
) -> Response {
	if state.orchestrator.cancel(&study) {
		(
			StatusCode::ACCEPTED,
			Json(json!({ "status": "CANCELLING", "studyInstanceUid": study })),
		)
			.into_response()
	} else {
		(StatusCode::NOT_FOUND, "No running retrieve for this study").into_response()
	}
}
