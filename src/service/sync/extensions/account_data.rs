use tracing::debug;

use super::{ExtContext, Extension};
use crate::{
	cache::Update,
	storage::AccountData,
	sync::{request::SyncRequest, response::ExtensionsResponse},
};

/// Account data enrichment. Per-room entries travel with the rooms in the
/// window; global entries are sent once on the first response and then
/// only live-streamed.
pub(super) struct AccountDataExt;

fn entries_as_events(entries: &[AccountData]) -> Vec<crate::storage::RawEvent> {
	entries.iter().map(|entry| entry.data.clone()).collect()
}

impl Extension for AccountDataExt {
	fn name(&self) -> &'static str { "account_data" }

	fn enabled(&self, request: &SyncRequest) -> bool { request.account_data_enabled }

	fn process_initial(&self, res: &mut ExtensionsResponse, ctx: &ExtContext<'_>) {
		let section = res.account_data.get_or_insert_default();

		// room account data is sent whenever rooms (re)enter the window
		let room_ids: Vec<&str> = ctx.room_ids.iter().map(String::as_str).collect();
		if !room_ids.is_empty() {
			for entry in ctx.storage.account_data.account_datas(ctx.user_id, &room_ids) {
				section
					.rooms
					.entry(entry.room_id.clone())
					.or_default()
					.push(entry.data.clone());
			}
		}

		// global account data only on the first response; afterwards the
		// live stream carries the deltas
		if ctx.is_initial {
			let global = ctx.storage.account_data.account_datas(ctx.user_id, &[]);
			section.global.extend(entries_as_events(&global));
		}
	}

	fn append_live(&self, res: &mut ExtensionsResponse, ctx: &ExtContext<'_>, update: &Update) {
		match update {
			| Update::AccountData { user_id, entries, .. } if user_id == ctx.user_id => {
				res.account_data
					.get_or_insert_default()
					.global
					.extend(entries_as_events(entries));
			},
			| Update::RoomAccountData { user_id, room_id, entries, .. }
				if user_id == ctx.user_id =>
			{
				res.account_data
					.get_or_insert_default()
					.rooms
					.entry(room_id.clone())
					.or_default()
					.extend(entries_as_events(entries));
			},
			// any other update for a room the client is looking at: attach
			// that room's account data, so it arrives together with the
			// room when the client first learns of it through this window
			| Update::Timeline { room_id, .. } | Update::Typing { room_id, .. }
				if ctx.room_ids.contains(room_id) =>
			{
				let entries = ctx
					.storage
					.account_data
					.account_datas(ctx.user_id, &[room_id.as_str()]);
				if entries.is_empty() {
					debug!(%room_id, "no room account data to attach");
					return;
				}

				res.account_data
					.get_or_insert_default()
					.rooms
					.insert(room_id.clone(), entries_as_events(&entries));
			},
			| _ => {},
		}
	}
}

#[cfg(test)]
mod tests {
	use std::collections::BTreeSet;

	use super::{AccountDataExt, ExtContext, Extension};
	use crate::{
		storage::Storage,
		sync::{request::SyncRequest, response::ExtensionsResponse},
	};

	fn raw(value: &str) -> crate::storage::RawEvent {
		serde_json::value::to_raw_value(&serde_json::json!({
			"type": "m.direct",
			"content": { "value": value },
		}))
		.unwrap()
		.into()
	}

	fn request() -> SyncRequest {
		SyncRequest { account_data_enabled: true, ..SyncRequest::default() }
	}

	#[test]
	fn global_data_only_on_initial() {
		let storage = Storage::new();
		storage
			.account_data
			.set("@u:x", "", vec![("m.direct".to_owned(), raw("one"))])
			.unwrap();

		let request = request();
		let rooms = BTreeSet::new();
		let mut ctx = ExtContext {
			user_id: "@u:x",
			device_id: "DEV",
			is_initial: true,
			room_ids: &rooms,
			request: &request,
			storage: &storage,
		};

		let mut res = ExtensionsResponse::default();
		AccountDataExt.process_initial(&mut res, &ctx);
		assert_eq!(res.account_data.as_ref().unwrap().global.len(), 1);

		ctx.is_initial = false;
		let mut res = ExtensionsResponse::default();
		AccountDataExt.process_initial(&mut res, &ctx);
		assert!(res.account_data.as_ref().unwrap().global.is_empty());
	}

	#[test]
	fn windowed_rooms_get_their_account_data() {
		let storage = Storage::new();
		storage
			.account_data
			.set("@u:x", "!a:x", vec![("m.tag".to_owned(), raw("tag"))])
			.unwrap();

		let request = request();
		let rooms: BTreeSet<String> = ["!a:x".to_owned(), "!b:x".to_owned()].into();
		let ctx = ExtContext {
			user_id: "@u:x",
			device_id: "DEV",
			is_initial: false,
			room_ids: &rooms,
			request: &request,
			storage: &storage,
		};

		let mut res = ExtensionsResponse::default();
		AccountDataExt.process_initial(&mut res, &ctx);

		let section = res.account_data.unwrap();
		assert_eq!(section.rooms.len(), 1);
		assert!(section.rooms.contains_key("!a:x"));
	}
}
