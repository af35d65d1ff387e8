use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use gangway_core::{telemetry, version};
use tracing::info;

#[derive(Parser, Debug)]
#[command(about = "Protocol-aware PostgreSQL proxy: routes on the startup-packet username", long_about = None)]
struct Args {
	/// Path to the JSON config file
	#[arg(short, long, value_name = "file")]
	config: Option<PathBuf>,

	/// Parse the config and exit
	#[arg(long)]
	validate_only: bool,

	/// Print version and exit
	#[arg(short = 'V', long = "version")]
	version: bool,
}

fn main() -> anyhow::Result<()> {
	let _log_flush = telemetry::setup_logging();

	let args = Args::parse();
	if args.version {
		println!("{}", version::BuildInfo::new());
		return Ok(());
	}

	let contents = match &args.config {
		Some(path) => std::fs::read_to_string(path)?,
		None => "{}".to_string(),
	};
	let config = gangway::config::parse_config(&contents)?;
	if args.validate_only {
		println!("configuration is valid");
		return Ok(());
	}

	tokio::runtime::Builder::new_multi_thread()
		.enable_all()
		.build()
		.expect("failed to build runtime")
		.block_on(async move {
			info!("version: {}", version::BuildInfo::new());
			gangway::app::run_postgres(Arc::new(config))
				.await?
				.wait_termination()
				.await
		})
}
