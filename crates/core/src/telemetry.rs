use std::env;
use std::time::Instant;

use once_cell::sync::Lazy;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::prelude::*;

pub static APPLICATION_START_TIME: Lazy<Instant> = Lazy::new(Instant::now);

/// setup_logging installs the global tracing subscriber. Logs are written
/// through a non-blocking worker; the returned guard must be held by main so
/// buffered lines are flushed on exit.
///
/// The filter comes from RUST_LOG (default `info`). Setting LOG_FORMAT=json
/// switches to one-JSON-object-per-line output.
pub fn setup_logging() -> WorkerGuard {
	Lazy::force(&APPLICATION_START_TIME);
	let (writer, guard) = tracing_appender::non_blocking(std::io::stdout());
	let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
	let json = env::var("LOG_FORMAT").as_deref() == Ok("json");
	if json {
		tracing_subscriber::registry()
			.with(filter)
			.with(
				tracing_subscriber::fmt::layer()
					.json()
					.flatten_event(true)
					.with_writer(writer),
			)
			.init();
	} else {
		tracing_subscriber::registry()
			.with(filter)
			.with(tracing_subscriber::fmt::layer().with_writer(writer))
			.init();
	}
	guard
}

/// testing_logging installs a plain subscriber for unit tests. Safe to call
/// more than once; only the first call wins.
pub fn testing_logging() {
	let _ = tracing_subscriber::registry()
		.with(EnvFilter::new("debug"))
		.with(tracing_subscriber::fmt::layer().with_test_writer())
		.try_init();
}
