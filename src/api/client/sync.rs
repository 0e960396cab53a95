use std::{sync::Arc, time::Duration};

use axum::{
	extract::{Query, State},
	response::IntoResponse,
};
use axum_extra::{
	TypedHeader,
	headers::{Authorization, authorization::Bearer},
};
use bytes::Bytes;
use http::{HeaderName, header::CONTENT_TYPE};
use serde::Deserialize;
use slipstream_core::{Error, Result};
use slipstream_service::{Conn, ConnId, Services};
use tracing::{debug, warn};

use crate::router::auth;

const POSITION_HEADER: HeaderName = HeaderName::from_static("x-sync3-position");
const SESSION_HEADER: HeaderName = HeaderName::from_static("x-sync3-session");

#[derive(Deserialize)]
pub(crate) struct SyncQuery {
	/// Stream position from the previous response; absent or 0 requests an
	/// initial snapshot.
	pos: Option<String>,

	/// Session cookie from the previous response; absent creates one.
	session: Option<String>,
}

/// `GET|POST /sync`
///
/// The sliding-window sync endpoint. The declared window rides in the JSON
/// body and is sticky per session; the cursor and session identity ride in
/// the query string and response headers.
#[tracing::instrument(name = "sync", level = "debug", skip_all)]
pub(crate) async fn sync_route(
	State(services): State<Arc<Services>>,
	query: Query<SyncQuery>,
	bearer: Option<TypedHeader<Authorization<Bearer>>>,
	body: Bytes,
) -> Result<impl IntoResponse> {
	let token = auth::require_bearer(bearer.as_ref())?;

	let pos = match query.pos.as_deref() {
		| None | Some("") => 0,
		| Some(raw) => raw
			.parse::<u64>()
			.map_err(|_| Error::InvalidPosition(raw.to_owned()))?,
	};

	let conn = get_or_create_conn(&services, token, query.session.as_deref()).await?;
	debug!(conn_id = %conn.id, pos, "incoming sync request");

	let timeout = Duration::from_secs(services.config.request_timeout_secs);
	let (next_pos, bytes) = conn.on_incoming_request(pos, &body, timeout).await?;

	let headers = [
		(CONTENT_TYPE, "application/json".to_owned()),
		(POSITION_HEADER, next_pos.to_string()),
		(SESSION_HEADER, conn.id.session_id.clone()),
	];

	Ok((headers, bytes))
}

/// Resolve the request to a session: an existing one when the client names
/// it, otherwise a fresh session with the upstream machinery warmed up.
async fn get_or_create_conn(
	services: &Arc<Services>,
	token: &str,
	session: Option<&str>,
) -> Result<Arc<Conn>> {
	// WhoAmI is the identity attestation; cached per token, so only
	// connection creation can surface upstream errors here
	let identity = services.pollers.identify(token).await?;

	if let Some(session_id) = session.filter(|session| !session.is_empty()) {
		let id = ConnId {
			device_id: identity.device_id.clone(),
			session_id: session_id.to_owned(),
		};

		// an unknown session is rejected, never silently recreated: the
		// client's cursor would be meaningless against a fresh session
		return services.notifier.conn(&id).ok_or(Error::SessionExpired);
	}

	let device = services.storage.devices.insert_device(&identity.device_id);
	if device.user_id.is_empty() {
		if let Err(e) = services
			.storage
			.devices
			.update_user_id_for_device(&identity.device_id, &identity.user_id)
		{
			// non-fatal: the mapping is a convenience, not a correctness
			// requirement
			warn!(%e, device_id = %identity.device_id, "failed to persist device owner");
		}
	}

	services
		.pollers
		.ensure_polling(token, &identity.user_id, &identity.device_id, device.since);

	Ok(services
		.notifier
		.create_conn(&identity.user_id, &identity.device_id))
}
