mod logging;

use std::{path::PathBuf, process::ExitCode, time::Duration};

use clap::Parser;
use slipstream_core::{Config, Result};
use slipstream_service::Services;
use tracing::{error, info};

#[derive(Parser)]
#[command(name = "slipstream", version, about = "sliding-window sync proxy")]
struct Args {
	/// Path to the configuration file. Environment variables prefixed
	/// with SLIPSTREAM_ override it.
	#[arg(short, long, env = "SLIPSTREAM_CONFIG")]
	config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> ExitCode {
	match run().await {
		| Ok(()) => ExitCode::SUCCESS,
		| Err(e) => {
			// logging may not be up yet when startup itself failed
			eprintln!("slipstream: {e}");
			ExitCode::FAILURE
		},
	}
}

async fn run() -> Result<()> {
	let args = Args::parse();
	let config = Config::load(args.config.as_deref())?;
	logging::init(&config);

	info!(
		listen = %config.listen,
		upstream = %config.upstream_url,
		"starting slipstream"
	);

	let services = Services::build(config)?;
	services.start();

	let app = slipstream_api::build(services.clone());
	let handle = axum_server::Handle::new();
	tokio::spawn(wait_for_shutdown(handle.clone()));

	axum_server::bind(services.config.listen)
		.handle(handle)
		.serve(app.into_make_service())
		.await?;

	services.shutdown().await;
	info!("shutdown complete");

	Ok(())
}

async fn wait_for_shutdown(handle: axum_server::Handle) {
	let ctrl_c = async {
		tokio::signal::ctrl_c().await.ok();
	};

	#[cfg(unix)]
	let terminate = async {
		match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
			| Ok(mut signal) => {
				signal.recv().await;
			},
			| Err(e) => error!("failed to install SIGTERM handler: {e}"),
		}
	};

	#[cfg(not(unix))]
	let terminate = std::future::pending::<()>();

	tokio::select! {
		() = ctrl_c => {},
		() = terminate => {},
	}

	info!("shutdown signal received");
	handle.graceful_shutdown(Some(Duration::from_secs(30)));
}
