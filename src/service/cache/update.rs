use crate::storage::{AccountData, StoredEvent};

/// A typed change emitted by the cache, consumed by the session engine and
/// the extensions. Every variant carries the position at which it became
/// visible; the notifier delivers them to each session in position order.
#[derive(Clone, Debug)]
pub enum Update {
	/// Global account data changed for a user.
	AccountData {
		user_id: String,
		entries: Vec<AccountData>,
		position: u64,
	},

	/// Per-room account data changed for a user.
	RoomAccountData {
		user_id: String,
		room_id: String,
		entries: Vec<AccountData>,
		position: u64,
	},

	/// New timeline events were accumulated for a room.
	Timeline {
		room_id: String,
		events: Vec<StoredEvent>,
		position: u64,
	},

	/// The typing set of a room was replaced.
	Typing {
		room_id: String,
		user_ids: Vec<String>,
		position: u64,
	},

	/// The user was invited to a room.
	Invite {
		user_id: String,
		room_id: String,
		position: u64,
	},

	/// The user left (or was removed from) a room.
	Leave {
		user_id: String,
		room_id: String,
		position: u64,
	},

	/// To-device traffic arrived for a device.
	DeviceData {
		user_id: String,
		device_id: String,
		position: u64,
	},
}

impl Update {
	pub fn position(&self) -> u64 {
		match self {
			| Self::AccountData { position, .. }
			| Self::RoomAccountData { position, .. }
			| Self::Timeline { position, .. }
			| Self::Typing { position, .. }
			| Self::Invite { position, .. }
			| Self::Leave { position, .. }
			| Self::DeviceData { position, .. } => *position,
		}
	}

	/// The room this update relates to, for room-scoped variants.
	pub fn room_id(&self) -> Option<&str> {
		match self {
			| Self::RoomAccountData { room_id, .. }
			| Self::Timeline { room_id, .. }
			| Self::Typing { room_id, .. }
			| Self::Invite { room_id, .. }
			| Self::Leave { room_id, .. } => Some(room_id),
			| Self::AccountData { .. } | Self::DeviceData { .. } => None,
		}
	}
}
