use std::{
	collections::{HashMap, VecDeque},
	sync::Arc,
};

use serde_json::value::RawValue;
use slipstream_core::{Result, SyncMutex};

use super::{Counter, RawEvent};

#[derive(Clone, Debug)]
pub struct ToDeviceMessage {
	pub position: u64,
	pub data: RawEvent,
}

/// Per-device FIFO of opaque to-device messages. Messages stay queued
/// until the device acknowledges them by echoing a position; only then are
/// they deleted. Losing a message here loses it forever, which is why the
/// poller treats insert failures as fatal.
pub struct ToDeviceTable {
	counter: Arc<Counter>,
	queues: SyncMutex<HashMap<String, VecDeque<ToDeviceMessage>>>,
}

impl ToDeviceTable {
	pub(super) fn new(counter: Arc<Counter>) -> Self {
		Self {
			counter,
			queues: SyncMutex::new(HashMap::new()),
		}
	}

	/// Enqueue messages for a device; returns the highest assigned
	/// position, or the current position for an empty batch.
	pub fn insert_messages(&self, device_id: &str, msgs: &[Box<RawValue>]) -> Result<u64> {
		let mut queues = self.queues.lock();
		let queue = queues.entry(device_id.to_owned()).or_default();

		for msg in msgs {
			queue.push_back(ToDeviceMessage {
				position: self.counter.next(),
				data: RawEvent::from(msg.clone()),
			});
		}

		Ok(self.counter.current())
	}

	/// Messages strictly after `position`, oldest first, capped at `limit`.
	pub fn messages_after(
		&self,
		device_id: &str,
		position: u64,
		limit: usize,
	) -> Vec<ToDeviceMessage> {
		let queues = self.queues.lock();
		let Some(queue) = queues.get(device_id) else {
			return Vec::new();
		};

		queue
			.iter()
			.filter(|msg| msg.position > position)
			.take(limit)
			.cloned()
			.collect()
	}

	/// Drain acknowledged messages: everything at or below `position`.
	pub fn delete_messages_up_to(&self, device_id: &str, position: u64) {
		let mut queues = self.queues.lock();
		if let Some(queue) = queues.get_mut(device_id) {
			while queue.front().is_some_and(|msg| msg.position <= position) {
				queue.pop_front();
			}
		}
	}
}

#[cfg(test)]
mod tests {
	use std::sync::Arc;

	use super::{Counter, ToDeviceTable};

	fn msg(body: &str) -> Box<serde_json::value::RawValue> {
		serde_json::value::to_raw_value(&serde_json::json!({
			"type": "m.room_key_request",
			"content": { "body": body },
		}))
		.unwrap()
	}

	#[test]
	fn queue_is_fifo_and_drains_by_ack() {
		let table = ToDeviceTable::new(Arc::new(Counter::default()));
		let highest = table
			.insert_messages("DEV", &[msg("one"), msg("two")])
			.unwrap();

		let pending = table.messages_after("DEV", 0, 10);
		assert_eq!(pending.len(), 2);
		assert!(pending[0].position < pending[1].position);
		assert_eq!(pending[1].position, highest);

		// ack the first message only
		table.delete_messages_up_to("DEV", pending[0].position);
		let pending = table.messages_after("DEV", 0, 10);
		assert_eq!(pending.len(), 1);
		assert!(pending[0].data.get().contains("two"));
	}

	#[test]
	fn unacknowledged_messages_survive_rereads() {
		let table = ToDeviceTable::new(Arc::new(Counter::default()));
		table.insert_messages("DEV", &[msg("one")]).unwrap();

		assert_eq!(table.messages_after("DEV", 0, 10).len(), 1);
		assert_eq!(table.messages_after("DEV", 0, 10).len(), 1);
	}
}
