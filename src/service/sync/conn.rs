use std::{
	collections::{BTreeSet, HashMap, VecDeque},
	fmt,
	sync::{
		Arc,
		atomic::{AtomicU64, Ordering},
	},
	time::Duration,
};

use bytes::Bytes;
use slipstream_core::{Error, Result, SyncMutex};
use tokio::{
	sync::{Mutex, Notify},
	time::Instant,
};
use tracing::{debug, trace};

use super::{
	Engine,
	extensions::{self, ExtContext},
	list::{ResolvedList, resolve_lists, visible_rooms},
	request::{SyncRequest, SyncRequestBody},
	response::{ListResponse, RoomResponse, SyncResponse},
};
use crate::{cache::Update, storage::StoredEvent};

/// Session identity. The device half is attested by the upstream; the
/// session half is generated by the proxy. Only the pair is unique.
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub struct ConnId {
	pub device_id: String,
	pub session_id: String,
}

impl fmt::Display for ConnId {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{}|{}", self.device_id, self.session_id)
	}
}

struct Inbox {
	updates: VecDeque<Update>,
	/// Set when the bounded inbox dropped an update. The next request
	/// re-reads storage for every windowed room instead of trusting the
	/// delta stream.
	missed: bool,
}

/// Everything only the session's own request path touches. Guarded by the
/// request lock, which also serializes requests per session.
struct ConnState {
	/// Sticky declaration folded from every body seen so far.
	request: SyncRequest,

	/// Rooms the client currently holds a snapshot of.
	known_rooms: BTreeSet<String>,

	/// The position of the last response; the client echoes it back.
	pos: u64,

	last: Option<BufferedResponse>,
}

/// The previous reply, kept verbatim for single-step retransmit recovery.
struct BufferedResponse {
	req_pos: u64,
	req_body: Vec<u8>,
	next_pos: u64,
	bytes: Bytes,
}

#[derive(Clone, Default)]
struct RoomParams {
	required_state: Vec<(String, String)>,
	timeline_limit: usize,
}

/// One live session. Owned by the notifier's registry; holds a handle to
/// the engine (storage + cache + config) but never to the notifier itself.
pub struct Conn {
	pub id: ConnId,
	pub user_id: String,
	engine: Arc<Engine>,
	state: Mutex<ConnState>,
	inbox: SyncMutex<Inbox>,
	/// Pinged when the inbox gains an update.
	signal: Notify,
	/// Pinged when a newer request wants this session.
	preempt: Notify,
	/// Request generation counter for last-writer-wins arbitration.
	requests: AtomicU64,
	last_active: SyncMutex<Instant>,
}

impl Conn {
	pub(super) fn new(id: ConnId, user_id: String, engine: Arc<Engine>) -> Self {
		Self {
			id,
			user_id,
			engine,
			state: Mutex::new(ConnState {
				request: SyncRequest::default(),
				known_rooms: BTreeSet::new(),
				pos: 0,
				last: None,
			}),
			inbox: SyncMutex::new(Inbox { updates: VecDeque::new(), missed: false }),
			signal: Notify::new(),
			preempt: Notify::new(),
			requests: AtomicU64::new(0),
			last_active: SyncMutex::new(Instant::now()),
		}
	}

	/// How long since this session last serviced a request.
	pub fn idle(&self) -> Duration { self.last_active.lock().elapsed() }

	/// Called by the notifier's fan-out worker. Never blocks: a full inbox
	/// sheds its oldest update and flags the session for re-initialisation.
	pub fn push_update(&self, update: Update) {
		{
			let mut inbox = self.inbox.lock();
			if inbox.updates.len() >= self.engine.config.session_inbox_capacity {
				inbox.updates.pop_front();
				inbox.missed = true;
			}
			inbox.updates.push_back(update);
		}

		self.signal.notify_one();
	}

	fn drain_inbox(&self) -> (Vec<Update>, bool) {
		let mut inbox = self.inbox.lock();
		let updates = inbox.updates.drain(..).collect();
		let missed = std::mem::take(&mut inbox.missed);
		(updates, missed)
	}

	/// Service one client request: reconcile the declared window against
	/// the current world, produce the delta, assign the next position.
	///
	/// At most one request is serviced at a time. A newer request on the
	/// same session preempts an older one parked in the live wait; the
	/// older request ends with `Error::Superseded` and no body.
	#[tracing::instrument(
		name = "request",
		level = "debug",
		skip_all,
		fields(conn_id = %self.id, pos = pos),
	)]
	pub async fn on_incoming_request(
		&self,
		pos: u64,
		body: &[u8],
		timeout: Duration,
	) -> Result<(u64, Bytes)> {
		let generation = self.requests.fetch_add(1, Ordering::SeqCst) + 1;
		self.preempt.notify_one();

		let mut state = self.state.lock().await;
		if self.requests.load(Ordering::SeqCst) != generation {
			return Err(Error::Superseded);
		}

		*self.last_active.lock() = Instant::now();

		// the client never saw our last reply: play it back byte for byte
		if let Some(last) = &state.last {
			if last.req_pos == pos && last.req_body == body {
				debug!("retransmit; replaying buffered response");
				return Ok((last.next_pos, last.bytes.clone()));
			}
		}

		if pos != 0 && pos != state.pos {
			return Err(Error::InvalidPosition(format!(
				"got {pos}, expected {}",
				state.pos
			)));
		}

		let parsed: SyncRequestBody = if body.is_empty() {
			SyncRequestBody::default()
		} else {
			serde_json::from_slice(body)
				.map_err(|e| Error::bad_request(format!("malformed request body: {e}")))?
		};
		state.request.apply(parsed);

		// an echoed to-device token acknowledges everything up to it
		if state.request.to_device_enabled {
			if let Some(since) = state
				.request
				.to_device_since
				.as_deref()
				.and_then(|since| since.parse::<u64>().ok())
			{
				self.engine
					.storage
					.to_device
					.delete_messages_up_to(&self.id.device_id, since);
			}
		}

		let response = if pos == 0 {
			self.build_initial(&mut state)
		} else {
			let deadline = Instant::now() + timeout;
			self.build_live(&mut state, generation, deadline).await?
		};

		let next_pos = state.pos.saturating_add(1);
		state.pos = next_pos;

		let bytes = Bytes::from(serde_json::to_vec(&response)?);
		state.last = Some(BufferedResponse {
			req_pos: pos,
			req_body: body.to_vec(),
			next_pos,
			bytes: bytes.clone(),
		});

		trace!(next_pos, len = bytes.len(), "responding");
		Ok((next_pos, bytes))
	}

	/// Initial (or client-reset) response: a full snapshot of the window.
	fn build_initial(&self, state: &mut ConnState) -> SyncResponse {
		// a snapshot supersedes any pending deltas
		self.drain_inbox();

		let resolved = resolve_lists(&self.engine.cache, &self.user_id, &state.request);
		let visible = visible_rooms(&resolved);
		let params = self.room_params(&state.request, &resolved);

		let mut response = SyncResponse {
			lists: list_counts(&resolved),
			..SyncResponse::default()
		};
		for room_id in &visible {
			response
				.rooms
				.insert(room_id.clone(), self.snapshot_room(room_id, &params));
		}

		state.known_rooms = visible.clone();

		let ctx = ExtContext {
			user_id: &self.user_id,
			device_id: &self.id.device_id,
			is_initial: true,
			room_ids: &visible,
			request: &state.request,
			storage: &self.engine.storage,
		};
		extensions::process_initial(&mut response.extensions, &ctx);
		extensions::prune(&mut response.extensions, true);

		response
	}

	/// Live response: drain pending updates, reconcile the window, and if
	/// nothing came of it park on the inbox until data, timeout or
	/// preemption.
	async fn build_live(
		&self,
		state: &mut ConnState,
		generation: u64,
		deadline: Instant,
	) -> Result<SyncResponse> {
		loop {
			let (updates, missed) = self.drain_inbox();
			if missed {
				debug!(conn_id = %self.id, "inbox overflowed; re-initialising windowed rooms");
				state.known_rooms.clear();
			}

			let resolved = resolve_lists(&self.engine.cache, &self.user_id, &state.request);
			let visible = visible_rooms(&resolved);
			let params = self.room_params(&state.request, &resolved);

			let mut response = SyncResponse {
				lists: list_counts(&resolved),
				..SyncResponse::default()
			};

			let entering: BTreeSet<String> =
				visible.difference(&state.known_rooms).cloned().collect();
			for room_id in state.known_rooms.difference(&visible) {
				response
					.rooms
					.insert(room_id.clone(), RoomResponse::invalidate());
			}
			for room_id in &entering {
				response
					.rooms
					.insert(room_id.clone(), self.snapshot_room(room_id, &params));
			}

			// incremental timeline for rooms that stayed in the window;
			// rooms that just entered already carry a snapshot
			for update in &updates {
				if let Update::Timeline { room_id, events, .. } = update {
					if state.known_rooms.contains(room_id) && visible.contains(room_id) {
						append_timeline(&mut response, room_id, events);
					}
				}
			}

			state.known_rooms = visible.clone();

			if !entering.is_empty() {
				let ctx = ExtContext {
					user_id: &self.user_id,
					device_id: &self.id.device_id,
					is_initial: false,
					room_ids: &entering,
					request: &state.request,
					storage: &self.engine.storage,
				};
				extensions::process_initial(&mut response.extensions, &ctx);
			}

			let ctx = ExtContext {
				user_id: &self.user_id,
				device_id: &self.id.device_id,
				is_initial: false,
				room_ids: &visible,
				request: &state.request,
				storage: &self.engine.storage,
			};
			for update in &updates {
				extensions::append_live(&mut response.extensions, &ctx, update);
			}
			extensions::prune(&mut response.extensions, false);

			if response.has_data() {
				return Ok(response);
			}

			tokio::select! {
				() = self.signal.notified() => {},
				() = tokio::time::sleep_until(deadline) => {
					trace!(conn_id = %self.id, "request timeout; empty response");
					return Ok(response);
				},
				() = self.preempt.notified() => {
					if self.requests.load(Ordering::SeqCst) != generation {
						return Err(Error::Superseded);
					}
				},
			}
		}
	}

	/// Union of list parameters per windowed room: the deepest requested
	/// timeline and every required-state selector of any list the room
	/// appears in.
	fn room_params(
		&self,
		request: &SyncRequest,
		resolved: &[ResolvedList],
	) -> HashMap<String, RoomParams> {
		let config = &self.engine.config;
		let mut params: HashMap<String, RoomParams> = HashMap::new();

		for (list, resolved) in request.lists.iter().zip(resolved) {
			let limit = request.timeline_limit(
				list,
				config.default_timeline_limit,
				config.max_timeline_limit,
			);

			for room_id in &resolved.windowed {
				let entry = params.entry(room_id.clone()).or_default();
				entry.timeline_limit = entry.timeline_limit.max(limit);
				entry
					.required_state
					.extend(list.required_state.iter().cloned());
			}
		}

		params
	}

	fn snapshot_room(&self, room_id: &str, params: &HashMap<String, RoomParams>) -> RoomResponse {
		let engine = &self.engine;
		let name = engine.cache.room_name(room_id);

		// invited rooms are all stripped state, no timeline
		if let Some(invite_state) = engine.cache.invite_state(&self.user_id, room_id) {
			return RoomResponse {
				initial: true,
				name,
				invite_state: Some(invite_state),
				..RoomResponse::default()
			};
		}

		let params = params.get(room_id).cloned().unwrap_or(RoomParams {
			required_state: Vec::new(),
			timeline_limit: engine.config.default_timeline_limit,
		});

		let timeline = engine
			.storage
			.room_timeline(room_id, params.timeline_limit)
			.into_iter()
			.map(|event| event.raw)
			.collect();

		let required_state = if params.required_state.is_empty() {
			Vec::new()
		} else {
			engine
				.storage
				.room_state(room_id)
				.into_iter()
				.filter(|event| state_matches(event, &params.required_state))
				.map(|event| event.raw)
				.collect()
		};

		RoomResponse {
			initial: true,
			name,
			required_state,
			timeline,
			..RoomResponse::default()
		}
	}
}

fn list_counts(resolved: &[ResolvedList]) -> Vec<ListResponse> {
	resolved
		.iter()
		.map(|list| ListResponse { count: list.count })
		.collect()
}

fn append_timeline(response: &mut SyncResponse, room_id: &str, events: &[StoredEvent]) {
	response
		.rooms
		.entry(room_id.to_owned())
		.or_default()
		.timeline
		.extend(events.iter().map(|event| event.raw.clone()));
}

fn state_matches(event: &StoredEvent, selectors: &[(String, String)]) -> bool {
	let state_key = event.state_key.as_deref().unwrap_or("");
	selectors.iter().any(|(kind, key)| {
		(kind == "*" || *kind == event.kind) && (key == "*" || key == state_key)
	})
}
