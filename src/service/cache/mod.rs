mod update;

use std::{
	collections::{BTreeSet, HashMap},
	sync::Arc,
};

use serde::Deserialize;
use slipstream_core::{Result, SyncRwLock};
use tracing::trace;

pub use self::update::Update;
use crate::storage::{RawEvent, Storage, StoredEvent};

#[derive(Default)]
struct CacheInner {
	/// Rooms each user is joined to, in the proxy's view of the upstream
	/// stream. BTreeSet for a stable iteration order.
	joined: HashMap<String, BTreeSet<String>>,
	/// Pending invites per user, with the stripped invite state to show.
	invited: HashMap<String, HashMap<String, Vec<RawEvent>>>,
	/// Latest m.room.name content per room.
	room_names: HashMap<String, String>,
	/// Position of the newest timeline event per room; drives the
	/// by-recency sort.
	room_recency: HashMap<String, u64>,
}

/// In-memory projection of storage used by the session engine, and the
/// source of the typed update stream. The pollers write through the cache;
/// sessions read room lists and names from it and everything heavier from
/// storage directly.
pub struct Cache {
	storage: Arc<Storage>,
	inner: SyncRwLock<CacheInner>,
	tx: loole::Sender<Update>,
	rx: loole::Receiver<Update>,
}

#[derive(Deserialize)]
struct NameContent {
	name: Option<String>,
}

#[derive(Deserialize)]
struct NameEvent {
	content: NameContent,
}

impl Cache {
	pub fn new(storage: Arc<Storage>) -> Self {
		let (tx, rx) = loole::unbounded();
		Self {
			storage,
			inner: SyncRwLock::new(CacheInner::default()),
			tx,
			rx,
		}
	}

	/// The update stream. Drained by the notifier's fan-out worker.
	pub fn updates(&self) -> loole::Receiver<Update> { self.rx.clone() }

	fn emit(&self, update: Update) {
		trace!(?update, "cache update");
		// receiver only closes on shutdown; nothing to do then
		self.tx.send(update).ok();
	}

	/// Record that `user_id` is joined to `room_id`. Quiet: the timeline
	/// accumulation for the room carries the wake-up.
	pub fn on_joined_room(&self, user_id: &str, room_id: &str) {
		let mut inner = self.inner.write();
		inner
			.joined
			.entry(user_id.to_owned())
			.or_default()
			.insert(room_id.to_owned());
		if let Some(invites) = inner.invited.get_mut(user_id) {
			invites.remove(room_id);
		}
	}

	/// Fold a batch of newly accumulated events into the projection and
	/// emit a timeline update.
	pub fn on_timeline(&self, room_id: &str, events: &[StoredEvent], position: u64) {
		if events.is_empty() {
			return;
		}

		{
			let mut inner = self.inner.write();
			inner.room_recency.insert(room_id.to_owned(), position);
			for event in events {
				if event.kind == "m.room.name" && event.state_key.as_deref() == Some("") {
					if let Ok(parsed) = serde_json::from_str::<NameEvent>(event.raw.get()) {
						match parsed.content.name {
							| Some(name) => inner.room_names.insert(room_id.to_owned(), name),
							| None => inner.room_names.remove(room_id),
						};
					}
				}
			}
		}

		self.emit(Update::Timeline {
			room_id: room_id.to_owned(),
			events: events.to_vec(),
			position,
		});
	}

	/// Seed names/recency from a state snapshot without emitting anything;
	/// initial state is not a delta anybody is waiting on.
	pub fn on_initial_state(&self, room_id: &str, state: &[StoredEvent]) {
		let mut inner = self.inner.write();
		for event in state {
			if event.kind == "m.room.name" && event.state_key.as_deref() == Some("") {
				if let Ok(parsed) = serde_json::from_str::<NameEvent>(event.raw.get()) {
					if let Some(name) = parsed.content.name {
						inner.room_names.insert(room_id.to_owned(), name);
					}
				}
			}
		}
	}

	pub fn on_account_data(&self, user_id: &str, entries: Vec<(String, RawEvent)>) -> Result<()> {
		let written = self.storage.account_data.set(user_id, "", entries)?;
		if let Some(position) = written.iter().map(|e| e.position).max() {
			self.emit(Update::AccountData {
				user_id: user_id.to_owned(),
				entries: written,
				position,
			});
		}

		Ok(())
	}

	pub fn on_room_account_data(
		&self,
		user_id: &str,
		room_id: &str,
		entries: Vec<(String, RawEvent)>,
	) -> Result<()> {
		let written = self.storage.account_data.set(user_id, room_id, entries)?;
		if let Some(position) = written.iter().map(|e| e.position).max() {
			self.emit(Update::RoomAccountData {
				user_id: user_id.to_owned(),
				room_id: room_id.to_owned(),
				entries: written,
				position,
			});
		}

		Ok(())
	}

	pub fn on_typing(&self, room_id: &str, user_ids: Vec<String>) -> Result<()> {
		let (_, previous) = self.storage.typing.typing_users(room_id);
		let position = self.storage.typing.set_typing(room_id, user_ids)?;
		if position == previous {
			return Ok(());
		}

		let (user_ids, _) = self.storage.typing.typing_users(room_id);
		self.emit(Update::Typing { room_id: room_id.to_owned(), user_ids, position });

		Ok(())
	}

	pub fn on_invite(&self, user_id: &str, room_id: &str, invite_state: Vec<RawEvent>) {
		{
			let mut inner = self.inner.write();
			inner
				.invited
				.entry(user_id.to_owned())
				.or_default()
				.insert(room_id.to_owned(), invite_state);
		}

		self.emit(Update::Invite {
			user_id: user_id.to_owned(),
			room_id: room_id.to_owned(),
			position: self.storage.next_position(),
		});
	}

	pub fn on_leave(&self, user_id: &str, room_id: &str) {
		{
			let mut inner = self.inner.write();
			if let Some(joined) = inner.joined.get_mut(user_id) {
				joined.remove(room_id);
			}
			if let Some(invites) = inner.invited.get_mut(user_id) {
				invites.remove(room_id);
			}
		}

		self.emit(Update::Leave {
			user_id: user_id.to_owned(),
			room_id: room_id.to_owned(),
			position: self.storage.next_position(),
		});
	}

	pub fn on_to_device(&self, user_id: &str, device_id: &str, position: u64) {
		self.emit(Update::DeviceData {
			user_id: user_id.to_owned(),
			device_id: device_id.to_owned(),
			position,
		});
	}

	pub fn joined_rooms(&self, user_id: &str) -> Vec<String> {
		self.inner
			.read()
			.joined
			.get(user_id)
			.map(|rooms| rooms.iter().cloned().collect())
			.unwrap_or_default()
	}

	pub fn invited_rooms(&self, user_id: &str) -> Vec<String> {
		self.inner
			.read()
			.invited
			.get(user_id)
			.map(|rooms| rooms.keys().cloned().collect())
			.unwrap_or_default()
	}

	pub fn invite_state(&self, user_id: &str, room_id: &str) -> Option<Vec<RawEvent>> {
		self.inner
			.read()
			.invited
			.get(user_id)
			.and_then(|rooms| rooms.get(room_id))
			.cloned()
	}

	/// Whether a room update is relevant to this user at all.
	pub fn user_sees_room(&self, user_id: &str, room_id: &str) -> bool {
		let inner = self.inner.read();
		inner
			.joined
			.get(user_id)
			.is_some_and(|rooms| rooms.contains(room_id))
			|| inner
				.invited
				.get(user_id)
				.is_some_and(|rooms| rooms.contains_key(room_id))
	}

	pub fn room_name(&self, room_id: &str) -> Option<String> {
		self.inner.read().room_names.get(room_id).cloned()
	}

	pub fn room_recency(&self, room_id: &str) -> u64 {
		self.inner
			.read()
			.room_recency
			.get(room_id)
			.copied()
			.unwrap_or(0)
	}
}
