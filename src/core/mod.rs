pub mod config;
pub mod error;
pub mod utils;

pub use self::{
	config::Config,
	error::{Error, Result},
};

pub type SyncMutex<T> = parking_lot::Mutex<T>;
pub type SyncRwLock<T> = parking_lot::RwLock<T>;
