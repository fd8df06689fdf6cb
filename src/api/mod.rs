//! HTTP and WebSocket surface: QIDO-RS search, WADO-RS retrieve, the
//! volume endpoint, retrieve control and progress topics.

pub mod qido;
pub mod retrieve;
pub mod wado;
pub mod ws;

use crate::config::NodeError;
use crate::dimse::association::PresentationProposal;
use crate::dimse::cecho::EchoServiceClassUser;
use crate::AppState;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use dicom::dictionary_std::uids;
use serde::Serialize;
use std::time::Duration;
use tower::ServiceBuilder;
use tower_http::cors::CorsLayer;
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;

pub fn router(state: AppState) -> Router {
	Router::new()
		.merge(qido::routes())
		.merge(wado::routes())
		.merge(retrieve::routes())
		.merge(ws::routes())
		.route("/aets", get(all_nodes))
		.route("/aets/{name}", get(node_health))
		.layer(
			ServiceBuilder::new()
				.layer(TraceLayer::new_for_http())
				.layer(CorsLayer::permissive())
				.layer(TimeoutLayer::new(Duration::from_secs(120))),
		)
		.with_state(state)
}

/// Maps a PACS node lookup failure onto the HTTP surface.
pub(crate) fn node_error_response(err: &NodeError) -> Response {
	(StatusCode::BAD_REQUEST, err.to_string()).into_response()
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct NodeStatus {
	name: String,
	ae_title: String,
	hostname: String,
	port: u16,
}

async fn all_nodes(State(state): State<AppState>) -> impl IntoResponse {
	let nodes: Vec<NodeStatus> = state
		.config
		.pacs
		.nodes
		.iter()
		.map(|node| NodeStatus {
			name: node.name.clone(),
			ae_title: node.ae_title.clone(),
			hostname: node.hostname.clone(),
			port: node.port,
		})
		.collect();
	Json(nodes)
}

/// Liveness probe: C-ECHO against the named node.
async fn node_health(
	State(state): State<AppState>,
	axum::extract::Path(name): axum::extract::Path<String>,
) -> Response {
	let Some(pool) = state.pools.get(&name) else {
		return node_error_response(&NodeError::Unknown(name));
	};

	let proposal = PresentationProposal::new(
		uids::VERIFICATION,
		crate::sop::CORE_TRANSFER_SYNTAXES.iter().copied(),
	);
	let association = match pool.get(proposal).await {
		Ok(association) => association,
		Err(err) => {
			return (StatusCode::BAD_GATEWAY, format!("{name} is unreachable: {err}"))
				.into_response()
		}
	};

	match EchoServiceClassUser::new(&association)
		.echo(Duration::from_secs(5))
		.await
	{
		Ok(true) => (StatusCode::OK, format!("{name} is healthy")).into_response(),
		Ok(false) => (
			StatusCode::BAD_GATEWAY,
			format!("{name} answered C-ECHO with a non-success status"),
		)
			.into_response(),
		Err(err) => (StatusCode::BAD_GATEWAY, format!("{name} failed C-ECHO: {err}")).into_response(),
	}
}
