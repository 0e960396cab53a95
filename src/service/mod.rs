pub mod cache;
pub mod poller;
pub mod storage;
pub mod sync;

use std::sync::Arc;

use slipstream_core::{Config, Result, SyncMutex};
use tokio::task::JoinHandle;
use tracing::debug;

pub use self::{
	cache::{Cache, Update},
	poller::{Identity, PollerMap},
	storage::Storage,
	sync::{Conn, ConnId, Notifier},
};

/// The process-wide service container. Everything is constructed once at
/// startup and injected; nothing reaches for globals.
pub struct Services {
	pub config: Arc<Config>,
	pub storage: Arc<Storage>,
	pub cache: Arc<Cache>,
	pub pollers: Arc<PollerMap>,
	pub notifier: Arc<Notifier>,
	workers: SyncMutex<Vec<JoinHandle<()>>>,
}

impl Services {
	pub fn build(config: Config) -> Result<Arc<Self>> {
		let config = Arc::new(config);
		let storage = Arc::new(Storage::new());
		let cache = Arc::new(Cache::new(storage.clone()));
		let pollers = Arc::new(PollerMap::new(config.clone(), storage.clone(), cache.clone())?);
		let notifier = Arc::new(Notifier::new(
			config.clone(),
			storage.clone(),
			cache.clone(),
		));

		Ok(Arc::new(Self {
			config,
			storage,
			cache,
			pollers,
			notifier,
			workers: SyncMutex::new(Vec::new()),
		}))
	}

	/// Start the long-lived workers: update fan-out and housekeeping.
	/// Poll loops are started on demand by the request path.
	pub fn start(self: &Arc<Self>) {
		let mut workers = self.workers.lock();
		workers.push(tokio::spawn(
			self.notifier.clone().worker(self.cache.updates()),
		));
		workers.push(tokio::spawn(
			self.notifier.clone().housekeeping(self.pollers.clone()),
		));
	}

	/// Interrupt every worker and poll loop. Idempotent.
	pub async fn shutdown(&self) {
		debug!("shutting down services");
		self.notifier.interrupt();
		self.pollers.shutdown();

		let workers: Vec<_> = self.workers.lock().drain(..).collect();
		for worker in workers {
			worker.await.ok();
		}
	}
}
