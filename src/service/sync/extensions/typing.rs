use tracing::debug;

use super::{ExtContext, Extension};
use crate::{
	cache::Update,
	storage::RawEvent,
	sync::{request::SyncRequest, response::ExtensionsResponse},
};

/// Live typing notifications for the rooms the client can currently see.
pub(super) struct TypingExt;

/// The wire shape is the upstream's ephemeral event, rebuilt from the
/// typing table rather than passed through, since the table deduplicates
/// keepalive repeats.
fn typing_event(user_ids: &[String]) -> Option<RawEvent> {
	let value = serde_json::json!({
		"type": "m.typing",
		"content": { "user_ids": user_ids },
	});

	match serde_json::value::to_raw_value(&value) {
		| Ok(raw) => Some(raw.into()),
		| Err(e) => {
			debug!(%e, "failed to serialize typing event");
			None
		},
	}
}

impl Extension for TypingExt {
	fn name(&self) -> &'static str { "typing" }

	fn enabled(&self, request: &SyncRequest) -> bool { request.typing_enabled }

	fn process_initial(&self, res: &mut ExtensionsResponse, ctx: &ExtContext<'_>) {
		for room_id in ctx.room_ids {
			let (user_ids, _) = ctx.storage.typing.typing_users(room_id);
			if user_ids.is_empty() {
				continue;
			}

			if let Some(event) = typing_event(&user_ids) {
				res.typing
					.get_or_insert_default()
					.rooms
					.insert(room_id.clone(), event);
			}
		}
	}

	fn append_live(&self, res: &mut ExtensionsResponse, ctx: &ExtContext<'_>, update: &Update) {
		let Update::Typing { room_id, user_ids, .. } = update else {
			return;
		};
		if !ctx.room_ids.contains(room_id) {
			return;
		}

		if let Some(event) = typing_event(user_ids) {
			res.typing
				.get_or_insert_default()
				.rooms
				.insert(room_id.clone(), event);
		}
	}
}
