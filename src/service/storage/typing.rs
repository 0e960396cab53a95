use std::{collections::HashMap, sync::Arc};

use slipstream_core::{Result, SyncMutex};

use super::Counter;

#[derive(Clone, Debug, Default)]
struct TypingSet {
	user_ids: Vec<String>,
	position: u64,
}

/// Who is typing in each room, with the position the set last changed at.
pub struct TypingTable {
	counter: Arc<Counter>,
	rooms: SyncMutex<HashMap<String, TypingSet>>,
}

impl TypingTable {
	pub(super) fn new(counter: Arc<Counter>) -> Self {
		Self {
			counter,
			rooms: SyncMutex::new(HashMap::new()),
		}
	}

	/// Replace the typing set for a room. Setting an identical set is a
	/// no-op which returns the position of the last actual change, so
	/// upstream keepalives do not wake every session in the room.
	pub fn set_typing(&self, room_id: &str, mut user_ids: Vec<String>) -> Result<u64> {
		user_ids.sort_unstable();
		user_ids.dedup();

		let mut rooms = self.rooms.lock();
		let set = rooms.entry(room_id.to_owned()).or_default();
		if set.user_ids == user_ids {
			return Ok(set.position);
		}

		set.user_ids = user_ids;
		set.position = self.counter.next();
		Ok(set.position)
	}

	/// The current typing set and its position stamp.
	pub fn typing_users(&self, room_id: &str) -> (Vec<String>, u64) {
		self.rooms
			.lock()
			.get(room_id)
			.map(|set| (set.user_ids.clone(), set.position))
			.unwrap_or_default()
	}
}
