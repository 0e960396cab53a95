use std::{net::SocketAddr, path::Path};

use figment::{
	Figment,
	providers::{Env, Format, Toml},
};
use serde::Deserialize;
use url::Url;

/// Runtime configuration, read from an optional TOML file and then
/// overridden by `SLIPSTREAM_*` environment variables.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct Config {
	/// Address the /sync endpoint binds to.
	pub listen: SocketAddr,

	/// Base URL of the upstream event server, e.g. `https://synapse.local`.
	pub upstream_url: Url,

	/// How long a client request may park waiting for live data before an
	/// empty response is returned.
	pub request_timeout_secs: u64,

	/// Upstream long-poll timeout handed to the upstream sync endpoint.
	pub upstream_poll_timeout_secs: u64,

	/// Sessions untouched for this long are expired and their requests
	/// rejected.
	pub session_ttl_secs: u64,

	/// Poll loops for devices with no live session are stopped after this
	/// grace period.
	pub poller_grace_secs: u64,

	/// Maximum number of pending updates buffered per session. Overflow
	/// drops the oldest update and forces the session to re-initialise its
	/// windowed rooms on the next request.
	pub session_inbox_capacity: usize,

	/// Timeline depth used when the client does not declare one.
	pub default_timeline_limit: usize,

	/// Upper bound on the client-declared timeline depth.
	pub max_timeline_limit: usize,

	/// tracing-subscriber filter directive, e.g. `info,slipstream=debug`.
	pub log: String,
}

impl Config {
	/// Layered load: defaults < TOML file < environment.
	pub fn load(path: Option<&Path>) -> crate::Result<Self> {
		let mut figment = Figment::new();
		if let Some(path) = path {
			figment = figment.merge(Toml::file(path));
		}

		let config = figment
			.merge(Env::prefixed("SLIPSTREAM_").split("__"))
			.extract::<Self>()?;

		Ok(config)
	}
}

impl Default for Config {
	fn default() -> Self {
		Self {
			listen: SocketAddr::from(([127, 0, 0, 1], 8009)),
			upstream_url: Url::parse("http://127.0.0.1:8008")
				.expect("default upstream URL is valid"),
			request_timeout_secs: 30,
			upstream_poll_timeout_secs: 30,
			session_ttl_secs: 30 * 60,
			poller_grace_secs: 5 * 60,
			session_inbox_capacity: 512,
			default_timeline_limit: 20,
			max_timeline_limit: 100,
			log: "info".to_owned(),
		}
	}
}

#[cfg(test)]
mod tests {
	use super::Config;

	#[test]
	fn defaults_are_sane() {
		let config = Config::default();
		assert!(config.request_timeout_secs > 0);
		assert!(config.max_timeline_limit >= config.default_timeline_limit);
		assert!(config.session_inbox_capacity > 0);
	}

	#[test]
	fn load_without_file_yields_defaults() {
		let config = Config::load(None).unwrap();
		assert_eq!(config.listen, Config::default().listen);
	}
}
