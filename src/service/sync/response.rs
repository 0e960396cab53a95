use std::collections::BTreeMap;

use serde::Serialize;

use crate::storage::RawEvent;

/// The response document. Serialized exactly once per request; the bytes
/// are buffered on the session afterwards so a retransmit can be answered
/// verbatim.
#[derive(Debug, Default, Serialize)]
pub struct SyncResponse {
	pub lists: Vec<ListResponse>,

	#[serde(skip_serializing_if = "BTreeMap::is_empty")]
	pub rooms: BTreeMap<String, RoomResponse>,

	#[serde(skip_serializing_if = "ExtensionsResponse::is_empty")]
	pub extensions: ExtensionsResponse,
}

#[derive(Debug, Default, Serialize)]
pub struct ListResponse {
	/// Total size of the filtered, sorted room list, independent of the
	/// requested ranges.
	pub count: usize,
}

#[derive(Debug, Default, Serialize)]
pub struct RoomResponse {
	/// Set on rooms entering the window: the room is delivered as a full
	/// snapshot and the client should drop any previous state for it.
	#[serde(skip_serializing_if = "std::ops::Not::not")]
	pub initial: bool,

	/// Set on rooms that left the window; the client should consider its
	/// copy of the room stale.
	#[serde(skip_serializing_if = "std::ops::Not::not")]
	pub invalidated: bool,

	#[serde(skip_serializing_if = "Option::is_none")]
	pub name: Option<String>,

	#[serde(skip_serializing_if = "Vec::is_empty")]
	pub required_state: Vec<RawEvent>,

	#[serde(skip_serializing_if = "Vec::is_empty")]
	pub timeline: Vec<RawEvent>,

	#[serde(skip_serializing_if = "Option::is_none")]
	pub invite_state: Option<Vec<RawEvent>>,
}

impl RoomResponse {
	pub fn invalidate() -> Self {
		Self { invalidated: true, ..Self::default() }
	}

	pub fn has_data(&self) -> bool {
		self.initial
			|| self.invalidated
			|| !self.required_state.is_empty()
			|| !self.timeline.is_empty()
			|| self.invite_state.is_some()
	}
}

#[derive(Debug, Default, Serialize)]
pub struct ExtensionsResponse {
	#[serde(skip_serializing_if = "Option::is_none")]
	pub account_data: Option<AccountDataResponse>,

	#[serde(skip_serializing_if = "Option::is_none")]
	pub typing: Option<TypingResponse>,

	#[serde(skip_serializing_if = "Option::is_none")]
	pub to_device: Option<ToDeviceResponse>,
}

impl ExtensionsResponse {
	pub fn is_empty(&self) -> bool {
		self.account_data.is_none() && self.typing.is_none() && self.to_device.is_none()
	}
}

#[derive(Debug, Default, Serialize)]
pub struct AccountDataResponse {
	#[serde(skip_serializing_if = "Vec::is_empty")]
	pub global: Vec<RawEvent>,

	#[serde(skip_serializing_if = "BTreeMap::is_empty")]
	pub rooms: BTreeMap<String, Vec<RawEvent>>,
}

impl AccountDataResponse {
	pub fn has_data(&self, is_initial: bool) -> bool {
		is_initial || !self.global.is_empty() || !self.rooms.is_empty()
	}
}

#[derive(Debug, Default, Serialize)]
pub struct TypingResponse {
	/// room_id -> synthesized m.typing ephemeral event
	#[serde(skip_serializing_if = "BTreeMap::is_empty")]
	pub rooms: BTreeMap<String, RawEvent>,
}

#[derive(Debug, Default, Serialize)]
pub struct ToDeviceResponse {
	/// Echo this back as `since` to acknowledge everything delivered here.
	pub next_batch: String,

	#[serde(skip_serializing_if = "Vec::is_empty")]
	pub events: Vec<RawEvent>,
}

impl SyncResponse {
	/// Whether anything in this response is worth waking the client for.
	pub fn has_data(&self) -> bool {
		self.rooms.values().any(RoomResponse::has_data) || !self.extensions.is_empty()
	}
}

#[cfg(test)]
mod tests {
	use super::{RoomResponse, SyncResponse};

	#[test]
	fn empty_sections_are_omitted_from_the_wire() {
		let mut response = SyncResponse::default();
		response.lists.push(super::ListResponse { count: 3 });

		let wire = serde_json::to_string(&response).unwrap();
		assert_eq!(wire, r#"{"lists":[{"count":3}]}"#);
	}

	#[test]
	fn invalidated_rooms_serialize_as_markers() {
		let mut response = SyncResponse::default();
		response
			.rooms
			.insert("!a:x".to_owned(), RoomResponse::invalidate());

		let wire = serde_json::to_string(&response).unwrap();
		assert!(wire.contains(r#""!a:x":{"invalidated":true}"#), "wire was {wire}");
	}
}
