pub(crate) mod auth;

use std::sync::Arc;

use axum::{Router, routing::get};
use http::header::AUTHORIZATION;
use slipstream_service::Services;
use tower_http::{
	sensitive_headers::SetSensitiveRequestHeadersLayer, trace::TraceLayer,
};

use crate::client;

/// The proxy's entire client-facing surface: one endpoint, both verbs.
pub fn build(services: Arc<Services>) -> Router {
	Router::new()
		.route("/sync", get(client::sync_route).post(client::sync_route))
		.layer(TraceLayer::new_for_http())
		.layer(SetSensitiveRequestHeadersLayer::new([AUTHORIZATION]))
		.with_state(services)
}
