//! WADO-RS instance retrieval and the volume (pixeldata) endpoint.
//!
//! Instances are served from the cache; a miss triggers a retrieve and
//! answers `202 Accepted` so the viewer can follow the progress topic.

use crate::api::node_error_response;
use crate::retrieve::{RetrieveError, RetrieveReceipt, RetrieveRequest};
use crate::types::QueryRetrieveLevel;
use crate::volume::{self, VolumeError};
use crate::AppState;
use axum::extract::{Path, Query, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use bytes::Bytes;
use serde::Deserialize;
use serde_json::json;
use std::io::Write;
use tracing::{error, instrument};
use uuid::Uuid;

#[rustfmt::skip]
pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/dicomweb/studies/{study}/series/{series}/instances/{sop}", get(instance))
        .route("/dicomweb/studies/{study}/series/{series}/pixeldata", get(pixeldata))
}

#[derive(Debug, Deserialize)]
struct RetrieveParameters {
	#[serde(rename = "pacsNode")]
	pacs_node: Option<String>,
}

#[instrument(skip_all, fields(study, series, sop))]
async fn instance(
	State(state): State<AppState>,
	Path((study, series, sop)): Path<(String, String, String)>,
	Query(parameters): Query<RetrieveParameters>,
) -> Response {
	match state.cache.cached_file(&study, &series, &sop).await {
		Ok(Some(path)) => match tokio::fs::read(&path).await {
			Ok(bytes) => (
				StatusCode::OK,
				[(header::CONTENT_TYPE, "application/dicom")],
				bytes,
			)
				.into_response(),
			Err(err) => {
				error!("Failed to read cached file {}: {err}", path.display());
				(StatusCode::INTERNAL_SERVER_ERROR, err.to_string()).into_response()
			}
		},
		Ok(None) => {
			// Rehydrate the miss through a retrieve; the caller learns of
			// completion through the progress topic.
			let request = RetrieveRequest {
				level: QueryRetrieveLevel::Image,
				study_instance_uid: study.clone(),
				series_instance_uid: Some(series),
				sop_instance_uid: Some(sop),
				node_name: parameters.pacs_node,
			};
			match state.orchestrator.start(request).await {
				Ok(RetrieveReceipt::Started { job }) => (
					StatusCode::ACCEPTED,
					Json(json!({
						"status": "RETRIEVING",
						"studyInstanceUid": job.study_instance_uid,
						"websocketTopic": format!("/topic/retrieve/{}", job.study_instance_uid),
					})),
				)
					.into_response(),
				// The study is marked cached but this instance is not part
				// of it.
				Ok(RetrieveReceipt::AlreadyCached { .. }) => {
					StatusCode::NOT_FOUND.into_response()
				}
				Err(RetrieveError::Node(err)) => node_error_response(&err),
				Err(err) => {
					(StatusCode::INTERNAL_SERVER_ERROR, err.to_string()).into_response()
				}
			}
		}
		Err(err) => (StatusCode::INTERNAL_SERVER_ERROR, err.to_string()).into_response(),
	}
}

#[derive(Debug, Deserialize)]
struct PixeldataParameters {
	subsample: Option<i64>,
}

#[instrument(skip_all, fields(study, series))]
async fn pixeldata(
	State(state): State<AppState>,
	Path((study, series)): Path<(String, String)>,
	Query(parameters): Query<PixeldataParameters>,
) -> Response {
	let subsample = parameters.subsample.unwrap_or(1);
	if subsample <= 0 {
		return (
			StatusCode::BAD_REQUEST,
			VolumeError::InvalidSubsample(subsample).to_string(),
		)
			.into_response();
	}
	let subsample = subsample as usize;

	let paths = match state.cache.series_instance_paths(&study, &series).await {
		Ok(paths) => paths,
		Err(err) => {
			return (StatusCode::INTERNAL_SERVER_ERROR, err.to_string()).into_response()
		}
	};

	let extraction =
		tokio::task::spawn_blocking(move || volume::extract_volume(&paths, subsample)).await;
	let (metadata, pixels) = match extraction {
		Ok(Ok(volume)) => volume,
		Ok(Err(err)) => {
			return (StatusCode::INTERNAL_SERVER_ERROR, err.to_string()).into_response()
		}
		Err(err) => {
			return (StatusCode::INTERNAL_SERVER_ERROR, err.to_string()).into_response()
		}
	};

	let metadata_json = match serde_json::to_vec(&metadata) {
		Ok(json) => json,
		Err(err) => {
			return (StatusCode::INTERNAL_SERVER_ERROR, err.to_string()).into_response()
		}
	};

	let boundary = Uuid::new_v4().simple().to_string();
	match write_multipart(&boundary, &metadata_json, &pixels) {
		Ok(body) => (
			StatusCode::OK,
			[(
				header::CONTENT_TYPE,
				format!("multipart/related; boundary={boundary}"),
			)],
			Bytes::from(body),
		)
			.into_response(),
		Err(err) => (StatusCode::INTERNAL_SERVER_ERROR, err.to_string()).into_response(),
	}
}

/// Two-part `multipart/related` body: JSON volume metadata followed by
/// the packed little-endian pixel stream, each with an explicit
/// Content-Length.
fn write_multipart(
	boundary: &str,
	metadata_json: &[u8],
	pixels: &[u8],
) -> Result<Vec<u8>, std::io::Error> {
	let mut buffer = Vec::with_capacity(metadata_json.len() + pixels.len() + 512);

	writeln!(buffer, "--{boundary}\r")?;
	writeln!(buffer, "Content-Type: {}\r", mime::APPLICATION_JSON)?;
	writeln!(buffer, "Content-Length: {}\r", metadata_json.len())?;
	writeln!(buffer, "\r")?;
	buffer.extend_from_slice(metadata_json);
	writeln!(buffer, "\r")?;

	writeln!(buffer, "--{boundary}\r")?;
	writeln!(buffer, "Content-Type: {}\r", mime::APPLICATION_OCTET_STREAM)?;
	writeln!(buffer, "Content-Length: {}\r", pixels.len())?;
	writeln!(buffer, "\r")?;
	buffer.extend_from_slice(pixels);
	writeln!(buffer, "\r")?;

	writeln!(buffer, "--{boundary}--\r")?;
	Ok(buffer)
}
