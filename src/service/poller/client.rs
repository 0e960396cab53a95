use std::{collections::HashMap, time::Duration};

use serde::Deserialize;
use serde_json::value::RawValue;
use slipstream_core::{Config, Error, Result};
use url::Url;

/// Thin client for the two upstream endpoints the proxy consumes: identity
/// attestation and the per-device long-poll.
pub struct UpstreamClient {
	http: reqwest::Client,
	base: Url,
	poll_timeout: Duration,
}

#[derive(Debug, Deserialize)]
pub struct WhoAmI {
	pub user_id: String,
	pub device_id: String,
}

#[derive(Debug, Default, Deserialize)]
pub struct UpstreamSync {
	pub next_batch: String,
	#[serde(default)]
	pub rooms: UpstreamRooms,
	#[serde(default)]
	pub account_data: EventContainer,
	#[serde(default)]
	pub to_device: EventContainer,
}

#[derive(Debug, Default, Deserialize)]
pub struct UpstreamRooms {
	#[serde(default)]
	pub join: HashMap<String, JoinedRoom>,
	#[serde(default)]
	pub invite: HashMap<String, InvitedRoom>,
	#[serde(default)]
	pub leave: HashMap<String, LeftRoom>,
}

#[derive(Debug, Default, Deserialize)]
pub struct JoinedRoom {
	#[serde(default)]
	pub state: EventContainer,
	#[serde(default)]
	pub timeline: Timeline,
	#[serde(default)]
	pub ephemeral: EventContainer,
	#[serde(default)]
	pub account_data: EventContainer,
}

#[derive(Debug, Default, Deserialize)]
pub struct InvitedRoom {
	#[serde(default)]
	pub invite_state: EventContainer,
}

#[derive(Debug, Default, Deserialize)]
pub struct LeftRoom {
	#[serde(default)]
	pub timeline: Timeline,
}

#[derive(Debug, Default, Deserialize)]
pub struct Timeline {
	#[serde(default)]
	pub events: Vec<Box<RawValue>>,
	#[serde(default)]
	pub limited: bool,
	pub prev_batch: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct EventContainer {
	#[serde(default)]
	pub events: Vec<Box<RawValue>>,
}

impl UpstreamClient {
	pub fn new(config: &Config) -> Result<Self> {
		let poll_timeout = Duration::from_secs(config.upstream_poll_timeout_secs);
		let http = reqwest::Client::builder()
			.connect_timeout(Duration::from_secs(10))
			// the long-poll must be allowed to run its full course
			.timeout(poll_timeout.saturating_add(Duration::from_secs(30)))
			.build()?;

		Ok(Self {
			http,
			base: config.upstream_url.clone(),
			poll_timeout,
		})
	}

	fn endpoint(&self, path: &str) -> Result<Url> {
		self.base
			.join(path)
			.map_err(|e| Error::BadGateway(format!("invalid upstream URL: {e}")))
	}

	/// Ask the upstream who the bearer token belongs to. This is the only
	/// identity attestation the proxy trusts.
	pub async fn whoami(&self, token: &str) -> Result<WhoAmI> {
		let url = self.endpoint("_matrix/client/v3/account/whoami")?;
		let response = self
			.http
			.get(url)
			.bearer_auth(token)
			.send()
			.await?;

		let status = response.status();
		let body = response.text().await?;
		if status == reqwest::StatusCode::UNAUTHORIZED
			|| status == reqwest::StatusCode::FORBIDDEN
		{
			return Err(Error::Unauthorized(format!("whoami: {status}")));
		}
		if !status.is_success() {
			return Err(Error::BadGateway(format!("whoami: {status}")));
		}

		serde_json::from_str(&body)
			.map_err(|e| Error::BadGateway(format!("whoami: unparseable body: {e}")))
	}

	/// One long-poll round against the upstream sync endpoint.
	pub async fn sync(&self, token: &str, since: Option<&str>) -> Result<UpstreamSync> {
		let mut url = self.endpoint("_matrix/client/v3/sync")?;
		{
			let mut query = url.query_pairs_mut();
			query.append_pair("timeout", &self.poll_timeout.as_millis().to_string());
			if let Some(since) = since.filter(|since| !since.is_empty()) {
				query.append_pair("since", since);
			}
		}

		let response = self
			.http
			.get(url)
			.bearer_auth(token)
			.send()
			.await?;

		let status = response.status();
		let body = response.text().await?;
		if status == reqwest::StatusCode::UNAUTHORIZED {
			return Err(Error::Unauthorized(format!("sync: {status}")));
		}
		if !status.is_success() {
			return Err(Error::BadGateway(format!("sync: {status}")));
		}

		serde_json::from_str(&body)
			.map_err(|e| Error::BadGateway(format!("sync: unparseable body: {e}")))
	}
}
