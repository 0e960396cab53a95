mod conn;
mod extensions;
mod list;
pub mod request;
pub mod response;

use std::{
	collections::{HashMap, HashSet},
	sync::{
		Arc,
		atomic::{AtomicBool, Ordering},
	},
	time::Duration,
};

use slipstream_core::{Config, SyncRwLock, utils::rand};
use tokio::{
	sync::Notify,
	time::{MissedTickBehavior, interval},
};
use tracing::{debug, info, trace};

pub use self::conn::{Conn, ConnId};
use crate::{
	cache::{Cache, Update},
	poller::PollerMap,
	storage::Storage,
};

pub const SESSION_ID_LENGTH: usize = 32;

const HOUSEKEEPING_INTERVAL: Duration = Duration::from_secs(30);

/// The shared handles a session needs to reconcile a request. Sessions
/// hold this instead of the notifier, so the registry owns the sessions
/// and nothing points back at it.
pub struct Engine {
	pub(crate) config: Arc<Config>,
	pub(crate) storage: Arc<Storage>,
	pub(crate) cache: Arc<Cache>,
}

/// Registry of live sessions plus the fan-out of cache updates into their
/// inboxes. Fan-out never blocks on a session; a slow consumer sheds load
/// in its own inbox.
pub struct Notifier {
	engine: Arc<Engine>,
	conns: SyncRwLock<HashMap<ConnId, Arc<Conn>>>,
	interrupted: AtomicBool,
	interrupt: Notify,
}

impl Notifier {
	pub fn new(config: Arc<Config>, storage: Arc<Storage>, cache: Arc<Cache>) -> Self {
		Self {
			engine: Arc::new(Engine { config, storage, cache }),
			conns: SyncRwLock::new(HashMap::new()),
			interrupted: AtomicBool::new(false),
			interrupt: Notify::new(),
		}
	}

	/// Look up a live session. `None` means unknown or already expired;
	/// the caller decides whether that is an error.
	pub fn conn(&self, id: &ConnId) -> Option<Arc<Conn>> {
		self.conns.read().get(id).cloned()
	}

	/// Mint a new session for an attested identity. The `(device,
	/// session)` pair is guaranteed unique among live sessions; expired
	/// sessions are never resurrected under a recycled id because the id
	/// space is large and regenerated on collision.
	pub fn create_conn(&self, user_id: &str, device_id: &str) -> Arc<Conn> {
		let mut conns = self.conns.write();
		let id = loop {
			let id = ConnId {
				device_id: device_id.to_owned(),
				session_id: rand::string(SESSION_ID_LENGTH),
			};
			if !conns.contains_key(&id) {
				break id;
			}
		};

		info!(conn_id = %id, %user_id, "creating new connection");
		let conn = Arc::new(Conn::new(id.clone(), user_id.to_owned(), self.engine.clone()));
		conns.insert(id, conn.clone());
		conn
	}

	/// Devices that still have at least one live session.
	pub fn live_devices(&self) -> HashSet<String> {
		self.conns
			.read()
			.keys()
			.map(|id| id.device_id.clone())
			.collect()
	}

	/// Drop sessions idle past the TTL. Their next request is rejected
	/// rather than silently renumbered.
	pub fn expire_idle(&self, ttl: Duration) -> usize {
		let mut conns = self.conns.write();
		let before = conns.len();
		conns.retain(|id, conn| {
			let keep = conn.idle() < ttl;
			if !keep {
				info!(conn_id = %id, "expiring idle session");
			}
			keep
		});

		before.saturating_sub(conns.len())
	}

	pub fn interrupt(&self) {
		self.interrupted.store(true, Ordering::SeqCst);
		self.interrupt.notify_waiters();
	}

	fn is_interrupted(&self) -> bool { self.interrupted.load(Ordering::SeqCst) }

	/// Fan-out worker: drains the cache's update stream and routes each
	/// update to every session whose declared interest intersects it.
	#[tracing::instrument(name = "fanout", level = "debug", skip_all)]
	pub async fn worker(self: Arc<Self>, updates: loole::Receiver<Update>) {
		while !self.is_interrupted() {
			let update = tokio::select! {
				() = self.interrupt.notified() => break,
				update = updates.recv_async() => match update {
					| Ok(update) => update,
					| Err(_) => break,
				},
			};

			self.handle_update(&update);
		}

		debug!("fan-out worker ended");
	}

	fn handle_update(&self, update: &Update) {
		let conns: Vec<Arc<Conn>> = self.conns.read().values().cloned().collect();
		for conn in conns {
			let interested = match update {
				| Update::AccountData { user_id, .. }
				| Update::RoomAccountData { user_id, .. }
				| Update::Invite { user_id, .. }
				| Update::Leave { user_id, .. } => conn.user_id == *user_id,
				| Update::DeviceData { device_id, .. } => conn.id.device_id == *device_id,
				| Update::Timeline { room_id, .. } | Update::Typing { room_id, .. } =>
					self.engine.cache.user_sees_room(&conn.user_id, room_id),
			};

			if interested {
				trace!(conn_id = %conn.id, position = update.position(), "routing update");
				conn.push_update(update.clone());
			}
		}
	}

	/// Housekeeping worker: expires idle sessions and stops poll loops
	/// for devices that no longer have any.
	#[tracing::instrument(name = "housekeeping", level = "debug", skip_all)]
	pub async fn housekeeping(self: Arc<Self>, pollers: Arc<PollerMap>) {
		let ttl = Duration::from_secs(self.engine.config.session_ttl_secs);
		let grace = Duration::from_secs(self.engine.config.poller_grace_secs);

		let mut ticker = interval(HOUSEKEEPING_INTERVAL);
		ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

		while !self.is_interrupted() {
			tokio::select! {
				() = self.interrupt.notified() => break,
				_ = ticker.tick() => {},
			}

			let expired = self.expire_idle(ttl);
			if expired > 0 {
				debug!(expired, "expired idle sessions");
			}

			pollers.reap_idle(&self.live_devices(), grace);
		}

		debug!("housekeeping worker ended");
	}
}

#[cfg(test)]
mod tests {
	use std::{sync::Arc, time::Duration};

	use slipstream_core::Config;
	use tokio::task::JoinHandle;

	use super::{ConnId, Notifier};
	use crate::{
		cache::Cache,
		storage::{Storage, tests::event},
	};

	struct Rig {
		storage: Arc<Storage>,
		cache: Arc<Cache>,
		notifier: Arc<Notifier>,
		_fanout: JoinHandle<()>,
	}

	fn rig() -> Rig { rig_with(Config::default()) }

	fn rig_with(config: Config) -> Rig {
		let config = Arc::new(config);
		let storage = Arc::new(Storage::new());
		let cache = Arc::new(Cache::new(storage.clone()));
		let notifier = Arc::new(Notifier::new(config, storage.clone(), cache.clone()));
		let _fanout = tokio::spawn(notifier.clone().worker(cache.updates()));

		Rig { storage, cache, notifier, _fanout }
	}

	impl Rig {
		/// Join the user to a room seeded with one message event.
		fn seed_room(&self, user_id: &str, room_id: &str) {
			self.cache.on_joined_room(user_id, room_id);
			let (position, events) = self
				.storage
				.accumulate(room_id, &[event(&format!("$seed-{room_id}"), "m.room.message", None)])
				.unwrap();
			self.cache.on_timeline(room_id, &events, position);
		}

		fn append(&self, room_id: &str, event_id: &str) {
			let (position, events) = self
				.storage
				.accumulate(room_id, &[event(event_id, "m.room.message", None)])
				.unwrap();
			self.cache.on_timeline(room_id, &events, position);
		}
	}

	fn parse(bytes: &bytes::Bytes) -> serde_json::Value {
		serde_json::from_slice(bytes).unwrap()
	}

	const WINDOW_0_5: &[u8] = br#"{"lists":[{"ranges":[[0,5]]}]}"#;

	#[tokio::test]
	async fn initial_connect_returns_windowed_snapshots() {
		let rig = rig();
		for i in 0..8 {
			rig.seed_room("@u:x", &format!("!r{i}:x"));
		}

		let conn = rig.notifier.create_conn("@u:x", "DEV");
		let (pos, bytes) = conn
			.on_incoming_request(0, WINDOW_0_5, Duration::from_secs(1))
			.await
			.unwrap();

		assert!(pos > 0);
		let body = parse(&bytes);
		assert_eq!(body["lists"][0]["count"], 8);

		let rooms = body["rooms"].as_object().unwrap();
		assert_eq!(rooms.len(), 6, "range 0..=5 selects six rooms");
		for room in rooms.values() {
			assert_eq!(room["initial"], true);
			assert!(!room["timeline"].as_array().unwrap().is_empty());
		}
	}

	#[tokio::test]
	async fn retransmit_returns_identical_bytes() {
		let rig = rig();
		rig.seed_room("@u:x", "!a:x");

		let conn = rig.notifier.create_conn("@u:x", "DEV");
		let (pos, first) = conn
			.on_incoming_request(0, WINDOW_0_5, Duration::from_secs(1))
			.await
			.unwrap();

		// the reply got lost; the client re-issues the exact same request
		let (retry_pos, second) = conn
			.on_incoming_request(0, WINDOW_0_5, Duration::from_secs(1))
			.await
			.unwrap();

		assert_eq!(pos, retry_pos);
		assert_eq!(first, second, "retransmit must be byte-identical");
	}

	#[tokio::test]
	async fn positions_from_the_past_are_rejected() {
		let rig = rig();
		rig.seed_room("@u:x", "!a:x");

		let conn = rig.notifier.create_conn("@u:x", "DEV");
		let (pos, _) = conn
			.on_incoming_request(0, WINDOW_0_5, Duration::from_secs(1))
			.await
			.unwrap();

		let (pos, _) = conn
			.on_incoming_request(pos, b"", Duration::from_millis(10))
			.await
			.unwrap();

		// a different body at an old position is not a retransmit
		let err = conn
			.on_incoming_request(pos.checked_sub(1).unwrap(), WINDOW_0_5, Duration::from_secs(1))
			.await
			.unwrap_err();
		assert!(matches!(err, slipstream_core::Error::InvalidPosition(_)));
	}

	#[tokio::test]
	async fn live_append_wakes_a_parked_request() {
		let rig = rig();
		rig.seed_room("@u:x", "!r:x");

		let conn = rig.notifier.create_conn("@u:x", "DEV");
		let (pos, _) = conn
			.on_incoming_request(0, WINDOW_0_5, Duration::from_secs(1))
			.await
			.unwrap();

		let parked = {
			let conn = conn.clone();
			tokio::spawn(async move {
				conn.on_incoming_request(pos, b"", Duration::from_secs(10)).await
			})
		};

		rig.append("!r:x", "$live");

		let (next_pos, bytes) = parked.await.unwrap().unwrap();
		assert!(next_pos > pos);

		let body = parse(&bytes);
		let timeline = body["rooms"]["!r:x"]["timeline"].as_array().unwrap();
		assert_eq!(timeline.len(), 1);
		assert_eq!(timeline[0]["event_id"], "$live");
	}

	#[tokio::test]
	async fn window_slide_invalidates_and_snapshots() {
		let rig = rig();
		for i in 0..12 {
			rig.seed_room("@u:x", &format!("!r{i:02}:x"));
		}

		let conn = rig.notifier.create_conn("@u:x", "DEV");
		let (pos, bytes) = conn
			.on_incoming_request(0, WINDOW_0_5, Duration::from_secs(1))
			.await
			.unwrap();
		let first: Vec<String> = parse(&bytes)["rooms"]
			.as_object()
			.unwrap()
			.keys()
			.cloned()
			.collect();
		assert_eq!(first.len(), 6);

		let (_, bytes) = conn
			.on_incoming_request(
				pos,
				br#"{"lists":[{"ranges":[[6,11]]}]}"#,
				Duration::from_secs(1),
			)
			.await
			.unwrap();

		let body = parse(&bytes);
		let rooms = body["rooms"].as_object().unwrap();
		assert_eq!(rooms.len(), 12);

		for room_id in &first {
			assert_eq!(
				rooms[room_id]["invalidated"], true,
				"{room_id} slid out of the window"
			);
		}

		let snapshots = rooms
			.values()
			.filter(|room| room["initial"] == true)
			.count();
		assert_eq!(snapshots, 6);
	}

	#[tokio::test]
	async fn live_global_account_data_reaches_the_client() {
		let rig = rig();
		rig.seed_room("@u:x", "!r:x");

		let conn = rig.notifier.create_conn("@u:x", "DEV");
		let (pos, _) = conn
			.on_incoming_request(
				0,
				br#"{"lists":[{"ranges":[[0,5]]}],"extensions":{"account_data":{"enabled":true}}}"#,
				Duration::from_secs(1),
			)
			.await
			.unwrap();

		let parked = {
			let conn = conn.clone();
			tokio::spawn(async move {
				conn.on_incoming_request(pos, b"", Duration::from_secs(10)).await
			})
		};

		let direct = serde_json::value::to_raw_value(&serde_json::json!({
			"type": "m.direct",
			"content": { "@bob:x": ["!r:x"] },
		}))
		.unwrap();
		rig.cache
			.on_account_data("@u:x", vec![("m.direct".to_owned(), direct.into())])
			.unwrap();

		let (_, bytes) = parked.await.unwrap().unwrap();
		let body = parse(&bytes);
		let global = body["extensions"]["account_data"]["global"]
			.as_array()
			.unwrap();
		assert_eq!(global.len(), 1);
		assert_eq!(global[0]["type"], "m.direct");
	}

	#[tokio::test]
	async fn idle_wait_times_out_with_empty_response() {
		let rig = rig();
		rig.seed_room("@u:x", "!r:x");

		let conn = rig.notifier.create_conn("@u:x", "DEV");
		let (pos, _) = conn
			.on_incoming_request(0, WINDOW_0_5, Duration::from_secs(1))
			.await
			.unwrap();

		let (next_pos, bytes) = conn
			.on_incoming_request(pos, b"", Duration::from_millis(20))
			.await
			.unwrap();

		assert!(next_pos >= pos);
		let body = parse(&bytes);
		assert!(body.get("rooms").is_none(), "timeout response carries no rooms");
	}

	#[tokio::test]
	async fn newer_request_preempts_a_parked_one() {
		let rig = rig();
		rig.seed_room("@u:x", "!r:x");

		let conn = rig.notifier.create_conn("@u:x", "DEV");
		let (pos, _) = conn
			.on_incoming_request(0, WINDOW_0_5, Duration::from_secs(1))
			.await
			.unwrap();

		let parked = {
			let conn = conn.clone();
			tokio::spawn(async move {
				conn.on_incoming_request(pos, b"", Duration::from_secs(10)).await
			})
		};

		// give the first request a moment to park
		tokio::time::sleep(Duration::from_millis(100)).await;

		conn.on_incoming_request(pos, b"{}", Duration::from_millis(20))
			.await
			.expect("new request must win");

		let err = parked.await.unwrap().unwrap_err();
		assert!(matches!(err, slipstream_core::Error::Superseded));
	}

	#[tokio::test]
	async fn inbox_overflow_forces_reinitialisation() {
		let config = Config {
			session_inbox_capacity: 2,
			..Config::default()
		};
		let rig = rig_with(config);
		rig.seed_room("@u:x", "!r:x");

		let conn = rig.notifier.create_conn("@u:x", "DEV");
		let (pos, _) = conn
			.on_incoming_request(0, WINDOW_0_5, Duration::from_secs(1))
			.await
			.unwrap();

		// more updates than the inbox holds; the oldest are shed
		for i in 0..5 {
			rig.append("!r:x", &format!("$burst{i}"));
		}
		// wait for the fan-out worker to deliver the burst
		tokio::time::sleep(Duration::from_millis(100)).await;

		let (_, bytes) = conn
			.on_incoming_request(pos, b"", Duration::from_secs(1))
			.await
			.unwrap();

		let body = parse(&bytes);
		let room = &body["rooms"]["!r:x"];
		assert_eq!(
			room["initial"], true,
			"a lossy inbox must resnapshot instead of sending a gappy delta"
		);
		// the snapshot carries the latest events, not the shed ones
		let timeline = room["timeline"].as_array().unwrap();
		assert_eq!(timeline.last().unwrap()["event_id"], "$burst4");
	}

	#[tokio::test]
	async fn expired_sessions_are_rejected_not_renumbered() {
		let rig = rig();
		let conn = rig.notifier.create_conn("@u:x", "DEV");

		let unknown = ConnId {
			device_id: "DEV".to_owned(),
			session_id: "abc".to_owned(),
		};
		assert!(rig.notifier.conn(&unknown).is_none());

		assert_eq!(rig.notifier.expire_idle(Duration::ZERO), 1);
		assert!(rig.notifier.conn(&conn.id).is_none(), "expired session must be gone");
	}

	#[tokio::test]
	async fn consecutive_positions_never_decrease() {
		let rig = rig();
		rig.seed_room("@u:x", "!r:x");

		let conn = rig.notifier.create_conn("@u:x", "DEV");
		let (mut pos, _) = conn
			.on_incoming_request(0, WINDOW_0_5, Duration::from_secs(1))
			.await
			.unwrap();

		for i in 0..3 {
			rig.append("!r:x", &format!("$m{i}"));
			let (next, _) = conn
				.on_incoming_request(pos, b"", Duration::from_secs(5))
				.await
				.unwrap();
			assert!(next >= pos);
			pos = next;
		}
	}
}
