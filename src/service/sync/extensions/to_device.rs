use super::{ExtContext, Extension};
use crate::{
	cache::Update,
	sync::{request::SyncRequest, response::ExtensionsResponse},
};

/// To-device messages for the session's device. Delivery is at-least-once:
/// the queue is only drained when the client echoes the `next_batch` token
/// back as `since`, which the session engine turns into a
/// `delete_messages_up_to` before the extensions run.
pub(super) struct ToDeviceExt;

/// Cap per response; an overfull queue drains over successive requests.
const MAX_MESSAGES: usize = 100;

fn ack_baseline(ctx: &ExtContext<'_>) -> u64 {
	ctx.request
		.to_device_since
		.as_deref()
		.and_then(|since| since.parse().ok())
		.unwrap_or(0)
}

impl Extension for ToDeviceExt {
	fn name(&self) -> &'static str { "to_device" }

	fn enabled(&self, request: &SyncRequest) -> bool { request.to_device_enabled }

	fn process_initial(&self, res: &mut ExtensionsResponse, ctx: &ExtContext<'_>) {
		let since = ack_baseline(ctx);
		let messages = ctx
			.storage
			.to_device
			.messages_after(ctx.device_id, since, MAX_MESSAGES);

		let section = res.to_device.get_or_insert_default();
		let next_batch = messages.last().map_or(since, |msg| msg.position);
		section.next_batch = next_batch.to_string();
		section
			.events
			.extend(messages.into_iter().map(|msg| msg.data));
	}

	fn append_live(&self, res: &mut ExtensionsResponse, ctx: &ExtContext<'_>, update: &Update) {
		let Update::DeviceData { device_id, .. } = update else {
			return;
		};
		if device_id != ctx.device_id {
			return;
		}

		// resume from whatever this response already carries
		let since = res
			.to_device
			.as_ref()
			.and_then(|section| section.next_batch.parse().ok())
			.unwrap_or_else(|| ack_baseline(ctx));

		let messages = ctx
			.storage
			.to_device
			.messages_after(ctx.device_id, since, MAX_MESSAGES);
		if messages.is_empty() {
			return;
		}

		let section = res.to_device.get_or_insert_default();
		if let Some(last) = messages.last() {
			section.next_batch = last.position.to_string();
		}
		section
			.events
			.extend(messages.into_iter().map(|msg| msg.data));
	}
}

#[cfg(test)]
mod tests {
	use std::collections::BTreeSet;

	use super::{Extension, ToDeviceExt};
	use crate::{
		cache::Update,
		storage::Storage,
		sync::{
			extensions::ExtContext,
			request::SyncRequest,
			response::ExtensionsResponse,
		},
	};

	fn msg(body: &str) -> Box<serde_json::value::RawValue> {
		serde_json::value::to_raw_value(&serde_json::json!({
			"type": "m.room_key_request",
			"content": { "body": body },
		}))
		.unwrap()
	}

	#[test]
	fn initial_delivers_queue_tail_and_a_token() {
		let storage = Storage::new();
		let highest = storage
			.to_device
			.insert_messages("DEV", &[msg("one"), msg("two")])
			.unwrap();

		let request = SyncRequest { to_device_enabled: true, ..SyncRequest::default() };
		let rooms = BTreeSet::new();
		let ctx = ExtContext {
			user_id: "@u:x",
			device_id: "DEV",
			is_initial: true,
			room_ids: &rooms,
			request: &request,
			storage: &storage,
		};

		let mut res = ExtensionsResponse::default();
		ToDeviceExt.process_initial(&mut res, &ctx);

		let section = res.to_device.unwrap();
		assert_eq!(section.events.len(), 2);
		assert_eq!(section.next_batch, highest.to_string());
	}

	#[test]
	fn live_append_continues_from_the_section_token() {
		let storage = Storage::new();
		storage.to_device.insert_messages("DEV", &[msg("one")]).unwrap();

		let request = SyncRequest { to_device_enabled: true, ..SyncRequest::default() };
		let rooms = BTreeSet::new();
		let ctx = ExtContext {
			user_id: "@u:x",
			device_id: "DEV",
			is_initial: false,
			room_ids: &rooms,
			request: &request,
			storage: &storage,
		};

		let mut res = ExtensionsResponse::default();
		ToDeviceExt.process_initial(&mut res, &ctx);
		assert_eq!(res.to_device.as_ref().unwrap().events.len(), 1);

		// a second burst arrives; the live path must not re-deliver "one"
		let highest = storage.to_device.insert_messages("DEV", &[msg("two")]).unwrap();
		ToDeviceExt.append_live(&mut res, &ctx, &Update::DeviceData {
			user_id: "@u:x".to_owned(),
			device_id: "DEV".to_owned(),
			position: highest,
		});

		let section = res.to_device.unwrap();
		assert_eq!(section.events.len(), 2);
		assert_eq!(section.next_batch, highest.to_string());
	}
}
