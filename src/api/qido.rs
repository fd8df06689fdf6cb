//! QIDO-RS search transaction.
//!
//! <https://dicom.nema.org/medical/dicom/current/output/html/part18.html#sect_10.6>

use crate::api::node_error_response;
use crate::query::{MatchCriteria, QueryError};
use crate::AppState;
use axum::extract::{Path, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use axum_extra::extract::Query;
use axum_streams::StreamBodyAs;
use dicom::object::InMemDicomObject;
use dicom_json::DicomJson;
use std::collections::HashMap;
use tracing::{instrument, warn};

const DEFAULT_LIMIT: usize = 200;

#[rustfmt::skip]
pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/dicomweb/studies", get(all_studies))
        .route("/dicomweb/studies/{study}/series", get(studys_series))
        .route("/dicomweb/studies/{study}/series/{series}/instances", get(studys_series_instances))
}

/// Query parameters recognized on every search route; everything else is
/// treated as a matching key.
struct SearchParameters {
	node: Option<String>,
	criteria: MatchCriteria,
	offset: usize,
	limit: usize,
}

impl SearchParameters {
	fn parse(mut raw: HashMap<String, String>) -> Self {
		let node = raw.remove("pacsNode");
		let offset = raw
			.remove("offset")
			.and_then(|value| value.parse().ok())
			.unwrap_or(0);
		let limit = raw
			.remove("limit")
			.and_then(|value| value.parse().ok())
			.unwrap_or(DEFAULT_LIMIT);
		// includefield=all is the implicit behavior of the C-FIND
		// identifiers; an explicit list is accepted and ignored.
		raw.remove("includefield");

		let mut criteria = MatchCriteria::default();
		for (name, value) in raw {
			match MatchCriteria::resolve_parameter(&name) {
				Some(tag) => criteria.push(tag, value),
				None => warn!(parameter = name, "Ignoring unknown QIDO parameter"),
			}
		}

		Self {
			node,
			criteria,
			offset,
			limit,
		}
	}
}

fn dicom_json_response(matches: Vec<InMemDicomObject>) -> Response {
	if matches.is_empty() {
		return StatusCode::NO_CONTENT.into_response();
	}

	let json: Vec<DicomJson<InMemDicomObject>> =
		matches.into_iter().map(DicomJson::from).collect();

	axum::response::Response::builder()
		.status(StatusCode::OK)
		.header(header::CONTENT_TYPE, "application/dicom+json")
		.body(StreamBodyAs::json_array(futures::stream::iter(json)))
		.unwrap()
		.into_response()
}

fn query_error_response(err: &QueryError) -> Response {
	match err {
		QueryError::Node(node_err) => node_error_response(node_err),
		QueryError::InvalidDateRange(_) => (StatusCode::BAD_REQUEST, err.to_string()).into_response(),
		QueryError::Find(_) => (StatusCode::BAD_GATEWAY, err.to_string()).into_response(),
	}
}

#[instrument(skip_all)]
async fn all_studies(
	State(state): State<AppState>,
	Query(raw): Query<HashMap<String, String>>,
) -> Response {
	let parameters = SearchParameters::parse(raw);
	let node = match state.config.node(parameters.node.as_deref()) {
		Ok(node) => node.name.clone(),
		Err(err) => return node_error_response(&err),
	};

	match state
		.query
		.find_studies(&node, &parameters.criteria, parameters.offset, parameters.limit)
		.await
	{
		Ok(matches) => dicom_json_response(matches),
		Err(err) => query_error_response(&err),
	}
}

#[instrument(skip_all)]
async fn studys_series(
	State(state): State<AppState>,
	Path(study): Path<String>,
	Query(raw): Query<HashMap<String, String>>,
) -> Response {
	let parameters = SearchParameters::parse(raw);
	let node = match state.config.node(parameters.node.as_deref()) {
		Ok(node) => node.name.clone(),
		Err(err) => return node_error_response(&err),
	};

	match state
		.query
		.find_series(
			&node,
			&study,
			&parameters.criteria,
			parameters.offset,
			parameters.limit,
		)
		.await
	{
		Ok(matches) => dicom_json_response(matches),
		Err(err) => query_error_response(&err),
	}
}

#[instrument(skip_all)]
async fn studys_series_instances(
	State(state): State<AppState>,
	Path((study, series)): Path<(String, String)>,
	Query(raw): Query<HashMap<String, String>>,
) -> Response {
	let parameters = SearchParameters::parse(raw);
	let node = match state.config.node(parameters.node.as_deref()) {
		Ok(node) => node.name.clone(),
		Err(err) => return node_error_response(&err),
	};

	match state
		.query
		.find_instances(
			&node,
			&study,
			&series,
			&parameters.criteria,
			parameters.offset,
			parameters.limit,
		)
		.await
	{
		Ok(matches) => dicom_json_response(matches),
		Err(err) => query_error_response(&err),
	}
}
