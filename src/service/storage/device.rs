use std::collections::HashMap;

use slipstream_core::{Result, SyncMutex};

/// A device known to the proxy, carrying the upstream `since` token its
/// poll loop resumes from.
#[derive(Clone, Debug, Default)]
pub struct Device {
	pub device_id: String,
	pub user_id: String,
	pub since: String,
}

pub struct DeviceTable {
	devices: SyncMutex<HashMap<String, Device>>,
}

impl DeviceTable {
	pub(super) fn new() -> Self {
		Self { devices: SyncMutex::new(HashMap::new()) }
	}

	/// Fetch-or-create. A fresh device has no user mapping and no since
	/// token; the caller fills those in as it learns them.
	pub fn insert_device(&self, device_id: &str) -> Device {
		self.devices
			.lock()
			.entry(device_id.to_owned())
			.or_insert_with(|| Device {
				device_id: device_id.to_owned(),
				..Device::default()
			})
			.clone()
	}

	pub fn device(&self, device_id: &str) -> Option<Device> {
		self.devices.lock().get(device_id).cloned()
	}

	/// Persist the poll loop's progress; the next loop for this device
	/// resumes from here.
	pub fn update_device_since(&self, device_id: &str, since: &str) -> Result<()> {
		if let Some(device) = self.devices.lock().get_mut(device_id) {
			device.since = since.to_owned();
		}

		Ok(())
	}

	pub fn update_user_id_for_device(&self, device_id: &str, user_id: &str) -> Result<()> {
		if let Some(device) = self.devices.lock().get_mut(device_id) {
			device.user_id = user_id.to_owned();
		}

		Ok(())
	}
}
