mod account_data;
mod device;
mod to_device;
mod typing;

use std::{
	collections::{BTreeMap, HashMap, HashSet},
	sync::{
		Arc,
		atomic::{AtomicU64, Ordering},
	},
};

use serde::Deserialize;
use serde_json::value::RawValue;
use slipstream_core::{Error, Result, SyncMutex};

pub use self::{
	account_data::{AccountData, AccountDataTable},
	device::{Device, DeviceTable},
	to_device::{ToDeviceMessage, ToDeviceTable},
	typing::TypingTable,
};

/// Events are stored and delivered as the raw JSON the upstream handed us;
/// the proxy never rewrites them.
pub type RawEvent = Arc<RawValue>;

/// The single global position counter. Every table stamps rows from this
/// counter, so one position names a cut across all streams.
#[derive(Debug, Default)]
pub(crate) struct Counter(AtomicU64);

impl Counter {
	pub(crate) fn next(&self) -> u64 { self.0.fetch_add(1, Ordering::SeqCst) + 1 }

	pub(crate) fn current(&self) -> u64 { self.0.load(Ordering::SeqCst) }
}

/// An event as accumulated into a room log, with the metadata the engine
/// sorts and filters on pulled out of the raw JSON.
#[derive(Clone, Debug)]
pub struct StoredEvent {
	pub position: u64,
	pub event_id: String,
	pub kind: String,
	pub state_key: Option<String>,
	pub raw: RawEvent,
}

#[derive(Deserialize)]
struct EventMeta {
	event_id: String,
	#[serde(rename = "type")]
	kind: String,
	state_key: Option<String>,
}

#[derive(Default)]
struct RoomLog {
	timeline: Vec<StoredEvent>,
	seen_event_ids: HashSet<String>,
	/// Current state, keyed by `(type, state_key)`.
	state: BTreeMap<(String, String), StoredEvent>,
}

/// The storage accumulator. Append-only per-room event logs plus the
/// derived per-user tables, all stamped from one monotonic counter.
///
/// Writes are serialized per table; a timeline batch is validated before
/// any position is assigned, so either the whole batch lands at
/// consecutive positions or the counter does not advance.
pub struct Storage {
	counter: Arc<Counter>,
	rooms: SyncMutex<HashMap<String, RoomLog>>,
	pub account_data: AccountDataTable,
	pub typing: TypingTable,
	pub to_device: ToDeviceTable,
	pub devices: DeviceTable,
}

impl Default for Storage {
	fn default() -> Self { Self::new() }
}

impl Storage {
	pub fn new() -> Self {
		let counter = Arc::new(Counter::default());
		Self {
			rooms: SyncMutex::new(HashMap::new()),
			account_data: AccountDataTable::new(counter.clone()),
			typing: TypingTable::new(counter.clone()),
			to_device: ToDeviceTable::new(counter.clone()),
			devices: DeviceTable::new(),
			counter,
		}
	}

	/// The highest position assigned so far.
	pub fn current_position(&self) -> u64 { self.counter.current() }

	/// Stamp a fresh position. Used for updates which are not backed by a
	/// table row, such as invite and leave transitions.
	pub fn next_position(&self) -> u64 { self.counter.next() }

	/// Seed a room's current state from a state snapshot. A no-op on a
	/// room which already has state, so replayed snapshots from the poller
	/// cannot clobber accumulated state.
	pub fn initialise(&self, room_id: &str, state: &[Box<RawValue>]) -> Result<bool> {
		let parsed = parse_events(room_id, state)?;

		// reject the whole snapshot before mutating anything
		if let Some((meta, _)) = parsed.iter().find(|(meta, _)| meta.state_key.is_none()) {
			return Err(Error::storage(format!(
				"state snapshot for {room_id} contains non-state event {}",
				meta.event_id
			)));
		}

		let mut rooms = self.rooms.lock();
		let room = rooms.entry(room_id.to_owned()).or_default();
		if !room.state.is_empty() {
			return Ok(false);
		}

		for (meta, raw) in parsed {
			let state_key = meta.state_key.unwrap_or_default();
			let position = self.counter.next();
			room.state.insert((meta.kind.clone(), state_key.clone()), StoredEvent {
				position,
				event_id: meta.event_id.clone(),
				kind: meta.kind,
				state_key: Some(state_key),
				raw,
			});
			room.seen_event_ids.insert(meta.event_id);
		}

		Ok(true)
	}

	/// Append a timeline batch. State events in the batch advance current
	/// state. Events already accumulated for this room are dropped, so
	/// poller replays do not double-count. Returns the highest assigned
	/// position together with the events that were actually new.
	pub fn accumulate(
		&self,
		room_id: &str,
		timeline: &[Box<RawValue>],
	) -> Result<(u64, Vec<StoredEvent>)> {
		let parsed = parse_events(room_id, timeline)?;

		let mut rooms = self.rooms.lock();
		let room = rooms.entry(room_id.to_owned()).or_default();

		let mut new_events = Vec::new();
		for (meta, raw) in parsed {
			if !room.seen_event_ids.insert(meta.event_id.clone()) {
				continue;
			}

			let event = StoredEvent {
				position: self.counter.next(),
				event_id: meta.event_id,
				kind: meta.kind,
				state_key: meta.state_key,
				raw,
			};

			if let Some(state_key) = &event.state_key {
				room.state
					.insert((event.kind.clone(), state_key.clone()), event.clone());
			}

			room.timeline.push(event.clone());
			new_events.push(event);
		}

		let position = new_events
			.last()
			.map_or_else(|| self.counter.current(), |event| event.position);

		Ok((position, new_events))
	}

	pub fn room_exists(&self, room_id: &str) -> bool {
		self.rooms.lock().contains_key(room_id)
	}

	/// The most recent `limit` timeline events, oldest first.
	pub fn room_timeline(&self, room_id: &str, limit: usize) -> Vec<StoredEvent> {
		let rooms = self.rooms.lock();
		let Some(room) = rooms.get(room_id) else {
			return Vec::new();
		};

		let skip = room.timeline.len().saturating_sub(limit);
		room.timeline[skip..].to_vec()
	}

	/// Timeline events strictly after `position`, oldest first.
	pub fn room_timeline_after(&self, room_id: &str, position: u64) -> Vec<StoredEvent> {
		let rooms = self.rooms.lock();
		let Some(room) = rooms.get(room_id) else {
			return Vec::new();
		};

		let start = room.timeline.partition_point(|event| event.position <= position);
		room.timeline[start..].to_vec()
	}

	/// The room's current state events.
	pub fn room_state(&self, room_id: &str) -> Vec<StoredEvent> {
		self.rooms
			.lock()
			.get(room_id)
			.map(|room| room.state.values().cloned().collect())
			.unwrap_or_default()
	}
}

fn parse_events(
	room_id: &str,
	events: &[Box<RawValue>],
) -> Result<Vec<(EventMeta, RawEvent)>> {
	events
		.iter()
		.map(|raw| {
			let meta = serde_json::from_str::<EventMeta>(raw.get()).map_err(|e| {
				Error::storage(format!("unparseable event in {room_id}: {e}"))
			})?;

			Ok((meta, RawEvent::from(raw.clone())))
		})
		.collect()
}

#[cfg(test)]
pub(crate) mod tests {
	use serde_json::value::RawValue;

	use super::Storage;

	pub(crate) fn event(event_id: &str, kind: &str, state_key: Option<&str>) -> Box<RawValue> {
		let mut value = serde_json::json!({
			"event_id": event_id,
			"type": kind,
			"sender": "@alice:example.org",
			"content": { "body": event_id },
		});
		if let Some(state_key) = state_key {
			value["state_key"] = state_key.into();
		}

		serde_json::value::to_raw_value(&value).unwrap()
	}

	#[test]
	fn positions_are_strictly_increasing() {
		let storage = Storage::new();
		let (first, _) = storage
			.accumulate("!a:x", &[event("$1", "m.room.message", None)])
			.unwrap();
		let (second, _) = storage
			.accumulate("!b:x", &[event("$2", "m.room.message", None)])
			.unwrap();

		assert!(second > first);
		assert_eq!(storage.current_position(), second);
	}

	#[test]
	fn batch_positions_are_assigned_in_order() {
		let storage = Storage::new();
		let (highest, events) = storage
			.accumulate("!a:x", &[
				event("$1", "m.room.message", None),
				event("$2", "m.room.message", None),
				event("$3", "m.room.message", None),
			])
			.unwrap();

		assert_eq!(events.len(), 3);
		assert!(events.windows(2).all(|w| w[0].position < w[1].position));
		assert_eq!(events.last().unwrap().position, highest);
	}

	#[test]
	fn duplicate_event_ids_are_dropped() {
		let storage = Storage::new();
		let batch = [event("$dup", "m.room.message", None)];
		let (first, new_events) = storage.accumulate("!a:x", &batch).unwrap();
		assert_eq!(new_events.len(), 1);

		let (second, new_events) = storage.accumulate("!a:x", &batch).unwrap();
		assert!(new_events.is_empty(), "replayed event must not re-accumulate");
		assert_eq!(first, second, "replay must not advance the counter");
		assert_eq!(storage.room_timeline("!a:x", 10).len(), 1);
	}

	#[test]
	fn duplicates_are_scoped_per_room() {
		let storage = Storage::new();
		let batch = [event("$dup", "m.room.message", None)];
		storage.accumulate("!a:x", &batch).unwrap();
		let (_, new_events) = storage.accumulate("!b:x", &batch).unwrap();
		assert_eq!(new_events.len(), 1);
	}

	#[test]
	fn initialise_is_idempotent_on_nonempty_rooms() {
		let storage = Storage::new();
		let created = storage
			.initialise("!a:x", &[event("$n1", "m.room.name", Some(""))])
			.unwrap();
		assert!(created);

		let created = storage
			.initialise("!a:x", &[event("$n2", "m.room.name", Some(""))])
			.unwrap();
		assert!(!created, "second snapshot must be a no-op");

		let state = storage.room_state("!a:x");
		assert_eq!(state.len(), 1);
		assert_eq!(state[0].event_id, "$n1");
	}

	#[test]
	fn state_events_advance_current_state() {
		let storage = Storage::new();
		storage
			.initialise("!a:x", &[event("$n1", "m.room.name", Some(""))])
			.unwrap();
		storage
			.accumulate("!a:x", &[event("$n2", "m.room.name", Some(""))])
			.unwrap();

		let state = storage.room_state("!a:x");
		assert_eq!(state.len(), 1);
		assert_eq!(state[0].event_id, "$n2");
	}

	#[test]
	fn malformed_batches_do_not_advance_the_counter() {
		let storage = Storage::new();
		let garbage = serde_json::value::to_raw_value(&serde_json::json!({
			"type": "m.room.message",
		}))
		.unwrap();

		let before = storage.current_position();
		let result =
			storage.accumulate("!a:x", &[event("$ok", "m.room.message", None), garbage]);

		assert!(result.is_err());
		assert_eq!(storage.current_position(), before);
		assert!(storage.room_timeline("!a:x", 10).is_empty());
	}

	#[test]
	fn timeline_reads_are_bit_exact() {
		let storage = Storage::new();
		let raw = event("$1", "m.room.message", None);
		let wire = raw.get().to_owned();
		storage.accumulate("!a:x", &[raw]).unwrap();

		let stored = storage.room_timeline("!a:x", 1);
		assert_eq!(stored[0].raw.get(), wire);
	}

	#[test]
	fn timeline_after_filters_by_position() {
		let storage = Storage::new();
		let (_, events) = storage
			.accumulate("!a:x", &[
				event("$1", "m.room.message", None),
				event("$2", "m.room.message", None),
			])
			.unwrap();

		let after = storage.room_timeline_after("!a:x", events[0].position);
		assert_eq!(after.len(), 1);
		assert_eq!(after[0].event_id, "$2");
	}
}
