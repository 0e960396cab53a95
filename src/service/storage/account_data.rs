use std::{collections::HashMap, sync::Arc};

use slipstream_core::{Result, SyncMutex};

use super::{Counter, RawEvent};

/// One account-data entry. `room_id` is empty for global entries, matching
/// the upstream wire shape where global and per-room entries share a type
/// namespace but not a scope.
#[derive(Clone, Debug)]
pub struct AccountData {
	pub user_id: String,
	pub room_id: String,
	pub kind: String,
	pub data: RawEvent,
	pub position: u64,
}

type Key = (String, String);

/// Current account data per user, keyed by `(room_id_or_empty, type)`.
/// Later writes for the same key replace earlier ones.
pub struct AccountDataTable {
	counter: Arc<Counter>,
	table: SyncMutex<HashMap<String, HashMap<Key, AccountData>>>,
}

impl AccountDataTable {
	pub(super) fn new(counter: Arc<Counter>) -> Self {
		Self {
			counter,
			table: SyncMutex::new(HashMap::new()),
		}
	}

	/// Upsert a batch of entries for one `(user, room)` scope. Returns the
	/// entries as written, each stamped with its position.
	pub fn set(
		&self,
		user_id: &str,
		room_id: &str,
		entries: Vec<(String, RawEvent)>,
	) -> Result<Vec<AccountData>> {
		let mut table = self.table.lock();
		let user = table.entry(user_id.to_owned()).or_default();

		let mut written = Vec::with_capacity(entries.len());
		for (kind, data) in entries {
			let entry = AccountData {
				user_id: user_id.to_owned(),
				room_id: room_id.to_owned(),
				kind: kind.clone(),
				data,
				position: self.counter.next(),
			};
			user.insert((room_id.to_owned(), kind), entry.clone());
			written.push(entry);
		}

		Ok(written)
	}

	/// Current entries for a user. With no rooms given, returns the global
	/// scope only; otherwise returns the entries of the named rooms.
	pub fn account_datas(&self, user_id: &str, room_ids: &[&str]) -> Vec<AccountData> {
		let table = self.table.lock();
		let Some(user) = table.get(user_id) else {
			return Vec::new();
		};

		let mut entries: Vec<_> = user
			.values()
			.filter(|entry| {
				if room_ids.is_empty() {
					entry.room_id.is_empty()
				} else {
					room_ids.contains(&entry.room_id.as_str())
				}
			})
			.cloned()
			.collect();

		entries.sort_by_key(|entry| entry.position);
		entries
	}
}
