pub mod client;
pub mod router;

pub use self::router::build;
