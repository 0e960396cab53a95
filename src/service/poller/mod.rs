mod client;

use std::{
	collections::{HashMap, HashSet},
	sync::Arc,
	time::Duration,
};

use serde::Deserialize;
use slipstream_core::{Config, Error, Result, SyncMutex, SyncRwLock};
use tokio::{sync::Notify, time::Instant};
use tracing::{debug, error, info, warn};

pub use self::client::{UpstreamClient, UpstreamSync, WhoAmI};
use crate::{
	cache::Cache,
	storage::{RawEvent, Storage},
};

const INITIAL_BACKOFF: Duration = Duration::from_secs(1);
const MAX_BACKOFF: Duration = Duration::from_secs(64);

/// Identity attested by the upstream for a bearer token.
#[derive(Clone, Debug)]
pub struct Identity {
	pub user_id: String,
	pub device_id: String,
}

struct PollerHandle {
	interrupt: Arc<Notify>,
	/// Set when the reaper last saw this device without any live session.
	idle_since: Option<Instant>,
}

/// One long-lived poll loop per upstream device. Every client session for
/// a device shares its loop; the loops know nothing about sessions and
/// only feed storage and the cache.
pub struct PollerMap {
	config: Arc<Config>,
	storage: Arc<Storage>,
	cache: Arc<Cache>,
	client: UpstreamClient,
	pollers: SyncMutex<HashMap<String, PollerHandle>>,
	identities: SyncRwLock<HashMap<String, Identity>>,
}

/// Outcome classification for one processed upstream payload. Transient
/// failures are retried with backoff without advancing `since`; a fatal
/// failure ends the loop, because retrying from an advanced `since` would
/// implicitly acknowledge data we failed to keep.
struct ProcessError {
	fatal: bool,
	source: Error,
}

impl ProcessError {
	fn transient(source: Error) -> Self { Self { fatal: false, source } }

	fn fatal(source: Error) -> Self { Self { fatal: true, source } }
}

#[derive(Deserialize)]
struct TypeOnly {
	#[serde(rename = "type")]
	kind: String,
}

#[derive(Deserialize)]
struct TypingContent {
	#[serde(default)]
	user_ids: Vec<String>,
}

#[derive(Deserialize)]
struct TypingEvent {
	content: TypingContent,
}

impl PollerMap {
	pub fn new(config: Arc<Config>, storage: Arc<Storage>, cache: Arc<Cache>) -> Result<Self> {
		Ok(Self {
			client: UpstreamClient::new(&config)?,
			config,
			storage,
			cache,
			pollers: SyncMutex::new(HashMap::new()),
			identities: SyncRwLock::new(HashMap::new()),
		})
	}

	/// Resolve a bearer token to its upstream identity, asking the
	/// upstream once and caching the attestation for the token's lifetime
	/// in this process.
	pub async fn identify(&self, token: &str) -> Result<Identity> {
		if let Some(identity) = self.identities.read().get(token) {
			return Ok(identity.clone());
		}

		let whoami = self.client.whoami(token).await?;
		let identity = Identity {
			user_id: whoami.user_id,
			device_id: whoami.device_id,
		};

		self.identities
			.write()
			.insert(token.to_owned(), identity.clone());

		Ok(identity)
	}

	/// Idempotent: spawn a poll loop for the device unless one is already
	/// running, seeded from the last persisted `since` token.
	pub fn ensure_polling(
		self: &Arc<Self>,
		token: &str,
		user_id: &str,
		device_id: &str,
		since: String,
	) {
		let mut pollers = self.pollers.lock();
		if pollers.contains_key(device_id) {
			return;
		}

		let interrupt = Arc::new(Notify::new());
		pollers.insert(device_id.to_owned(), PollerHandle {
			interrupt: interrupt.clone(),
			idle_since: None,
		});

		let this = self.clone();
		let token = token.to_owned();
		let user_id = user_id.to_owned();
		let device_id = device_id.to_owned();
		tokio::spawn(async move {
			this.clone()
				.run(interrupt, token, &user_id, &device_id, since)
				.await;
			this.pollers.lock().remove(&device_id);
		});
	}

	/// Stop loops whose device has had no live session for the grace
	/// period. Called from the notifier's housekeeping tick with the set
	/// of devices that still have sessions.
	pub fn reap_idle(&self, live_devices: &HashSet<String>, grace: Duration) {
		let now = Instant::now();
		let mut pollers = self.pollers.lock();
		pollers.retain(|device_id, handle| {
			if live_devices.contains(device_id) {
				handle.idle_since = None;
				return true;
			}

			match handle.idle_since {
				| None => {
					handle.idle_since = Some(now);
					true
				},
				| Some(idle_since) if now.duration_since(idle_since) < grace => true,
				| Some(_) => {
					info!(%device_id, "stopping poll loop for sessionless device");
					handle.interrupt.notify_one();
					false
				},
			}
		});
	}

	pub fn shutdown(&self) {
		for handle in self.pollers.lock().values() {
			handle.interrupt.notify_one();
		}
	}

	#[tracing::instrument(name = "poller", level = "debug", skip_all, fields(%user_id, %device_id))]
	async fn run(
		self: Arc<Self>,
		interrupt: Arc<Notify>,
		token: String,
		user_id: &str,
		device_id: &str,
		mut since: String,
	) {
		info!(%since, "starting upstream poll loop");
		let mut backoff = INITIAL_BACKOFF;

		loop {
			let since_arg = (!since.is_empty()).then_some(since.as_str());
			let payload = tokio::select! {
				() = interrupt.notified() => break,
				result = self.client.sync(&token, since_arg) => match result {
					| Ok(payload) => payload,
					| Err(e) => {
						warn!(%e, ?backoff, "upstream poll failed");
						tokio::select! {
							() = interrupt.notified() => break,
							() = tokio::time::sleep(backoff) => {},
						}
						backoff = backoff.saturating_mul(2).min(MAX_BACKOFF);
						continue;
					},
				},
			};

			backoff = INITIAL_BACKOFF;
			match self.process(user_id, device_id, &payload) {
				| Ok(()) => {
					since = payload.next_batch.clone();
					if let Err(e) = self.storage.devices.update_device_since(device_id, &since)
					{
						warn!(%e, "failed to persist since token");
					}
				},
				| Err(e) if e.fatal => {
					error!(error = %e.source, "terminating poll loop without advancing since");
					break;
				},
				| Err(e) => {
					warn!(error = %e.source, ?backoff, "failed to process upstream payload");
					tokio::select! {
						() = interrupt.notified() => break,
						() = tokio::time::sleep(backoff) => {},
					}
					backoff = backoff.saturating_mul(2).min(MAX_BACKOFF);
				},
			}
		}

		info!("upstream poll loop ended");
	}

	fn process(
		&self,
		user_id: &str,
		device_id: &str,
		payload: &UpstreamSync,
	) -> Result<(), ProcessError> {
		for (room_id, joined) in &payload.rooms.join {
			self.cache.on_joined_room(user_id, room_id);

			// a first-seen or gappy room comes with a state snapshot
			if !self.storage.room_exists(room_id) || joined.timeline.limited {
				let created = self
					.storage
					.initialise(room_id, &joined.state.events)
					.map_err(ProcessError::transient)?;
				if created {
					let state = self.storage.room_state(room_id);
					self.cache.on_initial_state(room_id, &state);
				}
			}

			let (position, events) = self
				.storage
				.accumulate(room_id, &joined.timeline.events)
				.map_err(ProcessError::transient)?;
			self.cache.on_timeline(room_id, &events, position);

			for raw in &joined.ephemeral.events {
				let Ok(meta) = serde_json::from_str::<TypeOnly>(raw.get()) else {
					continue;
				};
				if meta.kind != "m.typing" {
					continue;
				}

				match serde_json::from_str::<TypingEvent>(raw.get()) {
					| Ok(typing) => self
						.cache
						.on_typing(room_id, typing.content.user_ids)
						.map_err(ProcessError::transient)?,
					| Err(e) => debug!(%room_id, %e, "skipping malformed typing event"),
				}
			}

			let entries = account_data_entries(&joined.account_data.events);
			if !entries.is_empty() {
				self.cache
					.on_room_account_data(user_id, room_id, entries)
					.map_err(ProcessError::transient)?;
			}
		}

		for (room_id, invited) in &payload.rooms.invite {
			let invite_state = invited
				.invite_state
				.events
				.iter()
				.map(|raw| RawEvent::from(raw.clone()))
				.collect();
			self.cache.on_invite(user_id, room_id, invite_state);
		}

		for room_id in payload.rooms.leave.keys() {
			self.cache.on_leave(user_id, room_id);
		}

		let entries = account_data_entries(&payload.account_data.events);
		if !entries.is_empty() {
			self.cache
				.on_account_data(user_id, entries)
				.map_err(ProcessError::transient)?;
		}

		if !payload.to_device.events.is_empty() {
			// failure here must end the loop: advancing past these
			// messages would acknowledge them to the upstream unread
			let position = self
				.storage
				.to_device
				.insert_messages(device_id, &payload.to_device.events)
				.map_err(ProcessError::fatal)?;
			self.cache.on_to_device(user_id, device_id, position);
		}

		Ok(())
	}
}

fn account_data_entries(events: &[Box<serde_json::value::RawValue>]) -> Vec<(String, RawEvent)> {
	events
		.iter()
		.filter_map(|raw| {
			let meta = serde_json::from_str::<TypeOnly>(raw.get()).ok()?;
			Some((meta.kind, RawEvent::from(raw.clone())))
		})
		.collect()
}
