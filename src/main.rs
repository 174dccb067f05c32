use std::path::PathBuf;
use std::sync::Arc;

use async_shutdown::ShutdownManager;
use clap::Parser;

use moonshine::config::Config;
use moonshine::external::LoggingInputInjector;
use moonshine::rtsp::RtspServer;
use moonshine::session::manager::SessionManager;

#[derive(Parser, Debug)]
#[clap(version)]
struct Args {
	/// Path to configuration file.
	config: PathBuf,

	/// Show more log messages.
	#[clap(long, short)]
	#[clap(action = clap::ArgAction::Count)]
	verbose: u8,

	/// Show less log messages.
	#[clap(long, short)]
	#[clap(action = clap::ArgAction::Count)]
	quiet: u8,
}

impl Args {
	fn log_directive(&self) -> &'static str {
		match i16::from(self.verbose) - i16::from(self.quiet) {
			..=-2 => "error",
			-1 => "warn",
			0 => "info",
			1 => "debug",
			2.. => "trace",
		}
	}
}

#[tokio::main(flavor = "multi_thread")]
async fn main() -> Result<(), ()> {
	let args = Args::parse();

	tracing_subscriber::fmt()
		.with_env_filter(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| args.log_directive().into()))
		.init();

	let config = Config::read_from_file(&args.config).map_err(|e| {
		tracing::error!("{e:#}");
		std::process::exit(1);
	})?;

	tracing::debug!("Using configuration:\n{config:#?}");

	let shutdown = ShutdownManager::new();
	tokio::spawn({
		let shutdown = shutdown.clone();
		async move {
			if let Err(e) = tokio::signal::ctrl_c().await {
				tracing::error!("Failed to wait for CTRL+C: {e}");
				std::process::exit(1);
			} else {
				tracing::info!("Received interrupt signal. Shutting down server...");
				shutdown.trigger_shutdown(1).ok();
			}
		}
	});

	let moonshine = Moonshine::new(config, shutdown.clone());

	shutdown.wait_shutdown_triggered().await;
	drop(moonshine);

	let exit_code = shutdown.wait_shutdown_complete().await;
	tracing::trace!("Successfully waited for shutdown to complete.");
	std::process::exit(exit_code);
}

/// The top-level application object. Dropping it signals every owned collaborator
/// (currently just the RTSP server) to wind down.
pub struct Moonshine {
	_rtsp_server: RtspServer,
	_session_manager: Arc<SessionManager>,
}

impl Moonshine {
	pub fn new(config: Config, shutdown: ShutdownManager<i32>) -> Self {
		let session_manager = Arc::new(SessionManager::new(config.clone(), Arc::new(LoggingInputInjector)));
		let rtsp_server = RtspServer::new(config, session_manager.clone(), shutdown);

		Self { _rtsp_server: rtsp_server, _session_manager: session_manager }
	}
}
