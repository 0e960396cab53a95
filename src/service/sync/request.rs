use serde::Deserialize;

/// One request body as sent by the client. All fields are optional:
/// parameters are sticky, so an omitted field means "unchanged from the
/// last request on this session".
#[derive(Clone, Debug, Default, Deserialize)]
pub struct SyncRequestBody {
	pub lists: Option<Vec<ListRequest>>,
	pub extensions: Option<ExtensionsRequestBody>,
}

#[derive(Clone, Debug, Default, Deserialize)]
pub struct ListRequest {
	/// Inclusive index ranges into the sorted room list, e.g. `[[0,5]]`.
	#[serde(default)]
	pub ranges: Vec<(usize, usize)>,

	/// First recognised entry wins; defaults to by-recency.
	#[serde(default)]
	pub sort: Vec<SortBy>,

	pub filters: Option<ListFilters>,

	/// `(type, state_key)` selectors for state events to include with each
	/// room snapshot; `*` matches anything.
	#[serde(default)]
	pub required_state: Vec<(String, String)>,

	pub timeline_limit: Option<usize>,
}

#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum SortBy {
	ByRecency,
	ByName,
}

#[derive(Clone, Debug, Default, Deserialize)]
pub struct ListFilters {
	/// `true`: invites only. `false`: joined only. Absent: both.
	pub is_invite: Option<bool>,

	/// Case-insensitive substring match on the room name.
	pub room_name_like: Option<String>,
}

#[derive(Clone, Debug, Default, Deserialize)]
pub struct ExtensionsRequestBody {
	pub account_data: Option<ExtensionToggle>,
	pub typing: Option<ExtensionToggle>,
	pub to_device: Option<ToDeviceToggle>,
}

#[derive(Clone, Debug, Default, Deserialize)]
pub struct ExtensionToggle {
	pub enabled: Option<bool>,
}

#[derive(Clone, Debug, Default, Deserialize)]
pub struct ToDeviceToggle {
	pub enabled: Option<bool>,
	/// Acknowledgement token: deletes everything at or below it from the
	/// device's queue. Not sticky.
	pub since: Option<String>,
}

/// The session's current declaration, folded together from every body the
/// client has sent so far.
#[derive(Clone, Debug, Default)]
pub struct SyncRequest {
	pub lists: Vec<ListRequest>,
	pub account_data_enabled: bool,
	pub typing_enabled: bool,
	pub to_device_enabled: bool,
	pub to_device_since: Option<String>,
}

impl SyncRequest {
	/// Fold one request body into the sticky declaration.
	pub fn apply(&mut self, body: SyncRequestBody) {
		if let Some(lists) = body.lists {
			self.lists = lists;
		}

		// the ack token is per-request, never sticky
		self.to_device_since = None;

		let Some(extensions) = body.extensions else {
			return;
		};

		if let Some(toggle) = extensions.account_data {
			if let Some(enabled) = toggle.enabled {
				self.account_data_enabled = enabled;
			}
		}
		if let Some(toggle) = extensions.typing {
			if let Some(enabled) = toggle.enabled {
				self.typing_enabled = enabled;
			}
		}
		if let Some(toggle) = extensions.to_device {
			if let Some(enabled) = toggle.enabled {
				self.to_device_enabled = enabled;
			}
			self.to_device_since = toggle.since;
		}
	}

	pub fn timeline_limit(&self, list: &ListRequest, default: usize, max: usize) -> usize {
		list.timeline_limit.unwrap_or(default).clamp(1, max)
	}
}
