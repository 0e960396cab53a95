mod account_data;
mod to_device;
mod typing;

use std::collections::BTreeSet;

use tracing::trace;

use self::{account_data::AccountDataExt, to_device::ToDeviceExt, typing::TypingExt};
use crate::{
	cache::Update,
	storage::Storage,
	sync::{request::SyncRequest, response::ExtensionsResponse},
};

/// What an extension is allowed to see while enriching a response.
pub(super) struct ExtContext<'a> {
	pub(super) user_id: &'a str,
	pub(super) device_id: &'a str,

	/// True only for the very first response of a session (or an explicit
	/// client reset). Controls once-per-session payloads such as global
	/// account data.
	pub(super) is_initial: bool,

	/// The rooms this pass is enriching: on the initial pass the whole
	/// window, on a window slide just the rooms entering it, on a live
	/// append the currently visible window.
	pub(super) room_ids: &'a BTreeSet<String>,

	pub(super) request: &'a SyncRequest,
	pub(super) storage: &'a Storage,
}

/// An orthogonal data stream attached to the response under its own key.
/// Each extension has a snapshot path and a live path driven by the same
/// update feed as the core body.
pub(super) trait Extension: Sync {
	fn name(&self) -> &'static str;

	fn enabled(&self, request: &SyncRequest) -> bool;

	/// Populate from current state for the rooms in `ctx.room_ids`.
	fn process_initial(&self, res: &mut ExtensionsResponse, ctx: &ExtContext<'_>);

	/// Fold one live update into the response.
	fn append_live(&self, res: &mut ExtensionsResponse, ctx: &ExtContext<'_>, update: &Update);
}

static EXTENSIONS: [&(dyn Extension); 3] = [&AccountDataExt, &TypingExt, &ToDeviceExt];

pub(super) fn process_initial(res: &mut ExtensionsResponse, ctx: &ExtContext<'_>) {
	for extension in EXTENSIONS {
		if extension.enabled(ctx.request) {
			trace!(extension = extension.name(), rooms = ctx.room_ids.len(), "initial");
			extension.process_initial(res, ctx);
		}
	}
}

pub(super) fn append_live(res: &mut ExtensionsResponse, ctx: &ExtContext<'_>, update: &Update) {
	for extension in EXTENSIONS {
		if extension.enabled(ctx.request) {
			trace!(extension = extension.name(), "live");
			extension.append_live(res, ctx, update);
		}
	}
}

/// Drop sections that ended up carrying nothing, so empty objects never
/// reach the wire and an all-quiet response still counts as empty for the
/// long-poll wait.
pub(super) fn prune(res: &mut ExtensionsResponse, is_initial: bool) {
	if res
		.account_data
		.as_ref()
		.is_some_and(|section| !section.has_data(false))
	{
		res.account_data = None;
	}

	if res
		.typing
		.as_ref()
		.is_some_and(|section| section.rooms.is_empty())
	{
		res.typing = None;
	}

	// the initial to-device section stays even when empty: its next_batch
	// is the acknowledgement baseline for the whole session
	if res
		.to_device
		.as_ref()
		.is_some_and(|section| section.events.is_empty() && !is_initial)
	{
		res.to_device = None;
	}
}
